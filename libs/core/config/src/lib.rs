//! Environment-driven configuration shared by the messaging crates.
//!
//! - [`Environment`]: development vs production, read from `APP_ENV`
//! - [`FromEnv`]: implemented by config structs that load themselves from env vars
//! - `env_*` helpers for required, defaulted, parsed and boolean variables
//! - [`tracing::init_tracing`]: subscriber setup (pretty in dev, JSON in prod)

pub mod tracing;

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },

    #[error("Invalid value for '{key}': {details}")]
    Invalid { key: String, details: String },
}

/// Runtime environment, selects log format and verbosity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        match env::var("APP_ENV") {
            Ok(value) if value.eq_ignore_ascii_case("production") => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Load an environment variable, falling back to `default` when unset
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Load an environment variable or return `MissingEnvVar`
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse an environment variable, using `default` when unset
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Read a boolean flag; accepts `true/false`, `1/0`, `yes/no`, `on/off`
pub fn env_flag(key: &str, default: bool) -> Result<bool, ConfigError> {
    let Ok(raw) = env::var(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::ParseError {
            key: key.to_string(),
            details: format!("'{}' is not a boolean", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            assert_eq!(Environment::from_env(), Environment::Production);
        });
        temp_env::with_var("APP_ENV", Some("staging"), || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
    }

    #[test]
    fn test_env_or_default() {
        temp_env::with_var("JMS_TEST_VAR", Some("value"), || {
            assert_eq!(env_or_default("JMS_TEST_VAR", "default"), "value");
        });
        temp_env::with_var_unset("JMS_TEST_VAR", || {
            assert_eq!(env_or_default("JMS_TEST_VAR", "default"), "default");
        });
    }

    #[test]
    fn test_env_required_missing() {
        temp_env::with_var_unset("JMS_MISSING_REQUIRED", || {
            let err = env_required("JMS_MISSING_REQUIRED").unwrap_err();
            assert!(err.to_string().contains("JMS_MISSING_REQUIRED"));
            assert!(err.to_string().contains("required"));
        });
    }

    #[test]
    fn test_env_parse() {
        temp_env::with_var("JMS_POOL_SIZE", Some(" 12 "), || {
            assert_eq!(env_parse::<usize>("JMS_POOL_SIZE", 1).unwrap(), 12);
        });
        temp_env::with_var_unset("JMS_POOL_SIZE", || {
            assert_eq!(env_parse::<usize>("JMS_POOL_SIZE", 3).unwrap(), 3);
        });
        temp_env::with_var("JMS_POOL_SIZE", Some("many"), || {
            let err = env_parse::<usize>("JMS_POOL_SIZE", 1).unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { .. }));
        });
    }

    #[test]
    fn test_env_flag() {
        temp_env::with_var("JMS_FLAG", Some("Yes"), || {
            assert!(env_flag("JMS_FLAG", false).unwrap());
        });
        temp_env::with_var("JMS_FLAG", Some("0"), || {
            assert!(!env_flag("JMS_FLAG", true).unwrap());
        });
        temp_env::with_var("JMS_FLAG", Some("maybe"), || {
            assert!(env_flag("JMS_FLAG", true).is_err());
        });
        temp_env::with_var_unset("JMS_FLAG", || {
            assert!(env_flag("JMS_FLAG", true).unwrap());
        });
    }
}
