//! Relay settings loaded from the environment.

use core_config::{env_or_default, env_parse, ConfigError, FromEnv};
use jms::listener::Concurrency;
use jms::Destination;

/// Where the relay reads from and writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub source: Destination,
    pub target: Destination,
    pub concurrency: Concurrency,
    /// Messages published to the source at startup
    pub seed_messages: usize,
}

impl FromEnv for RelayConfig {
    /// Reads `RELAY_SOURCE`, `RELAY_TARGET` (`queue://name`, `topic://name` or
    /// a bare queue name), `RELAY_CONCURRENCY` (`min-max`) and
    /// `RELAY_SEED_MESSAGES`.
    fn from_env() -> Result<Self, ConfigError> {
        let source = destination("RELAY_SOURCE", "queue://inbound")?;
        let target = destination("RELAY_TARGET", "queue://outbound")?;
        if source == target {
            return Err(ConfigError::Invalid {
                key: "RELAY_TARGET".to_string(),
                details: format!("target must differ from source {}", source),
            });
        }

        let concurrency = env_or_default("RELAY_CONCURRENCY", "1-4")
            .parse()
            .map_err(|e: jms::JmsError| ConfigError::ParseError {
                key: "RELAY_CONCURRENCY".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self {
            source,
            target,
            concurrency,
            seed_messages: env_parse("RELAY_SEED_MESSAGES", 3)?,
        })
    }
}

fn destination(key: &str, default: &str) -> Result<Destination, ConfigError> {
    env_or_default(key, default)
        .parse()
        .map_err(|e: jms::JmsError| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        temp_env::with_vars_unset(
            ["RELAY_SOURCE", "RELAY_TARGET", "RELAY_CONCURRENCY", "RELAY_SEED_MESSAGES"],
            || {
                let config = RelayConfig::from_env().unwrap();
                assert_eq!(config.source, Destination::queue("inbound"));
                assert_eq!(config.target, Destination::queue("outbound"));
                assert_eq!(config.concurrency.to_string(), "1-4");
                assert_eq!(config.seed_messages, 3);
            },
        );
    }

    #[test]
    fn test_topic_target_and_concurrency() {
        temp_env::with_vars(
            [
                ("RELAY_TARGET", Some("topic://fanout")),
                ("RELAY_CONCURRENCY", Some("2-8")),
            ],
            || {
                let config = RelayConfig::from_env().unwrap();
                assert_eq!(config.target, Destination::topic("fanout"));
                assert_eq!((config.concurrency.min(), config.concurrency.max()), (2, 8));
            },
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        temp_env::with_var("RELAY_CONCURRENCY", Some("4-2"), || {
            assert!(matches!(
                RelayConfig::from_env(),
                Err(ConfigError::ParseError { .. })
            ));
        });
        temp_env::with_vars(
            [
                ("RELAY_SOURCE", Some("queue://same")),
                ("RELAY_TARGET", Some("same")),
            ],
            || {
                assert!(matches!(RelayConfig::from_env(), Err(ConfigError::Invalid { .. })));
            },
        );
        temp_env::with_var("RELAY_SOURCE", Some("fax://x"), || {
            assert!(RelayConfig::from_env().is_err());
        });
    }
}
