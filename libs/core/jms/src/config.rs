//! Pool and listener configuration
//!
//! This module provides `PoolConfig`, `PoolSettings` and `ListenerConfig`.
//! Pool sizing can be loaded from the environment through [`FromEnv`].

use crate::error::{JmsError, Result};
use crate::listener::{Concurrency, DestinationDescriptor};
use core_config::{env_flag, env_parse, ConfigError, FromEnv};
use std::time::Duration;

/// Warm count used when nothing is configured.
pub const DEFAULT_INITIAL_SIZE: usize = 1;
/// Hard cap used when nothing is configured.
pub const DEFAULT_MAX_SIZE: usize = 50;
/// How long a stopping listener waits for in-flight callbacks.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a surplus dispatch worker stays alive without work.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Sizing of one resource pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Resources created eagerly when the pool is built
    pub initial_size: usize,

    /// Upper bound on idle plus active resources
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_INITIAL_SIZE,
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

impl PoolConfig {
    pub fn new(initial_size: usize, max_size: usize) -> Self {
        Self {
            initial_size,
            max_size,
        }
    }

    /// Set the warm count
    pub fn with_initial_size(mut self, size: usize) -> Self {
        self.initial_size = size;
        self
    }

    /// Set the hard cap
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Check `max_size >= 1` and `initial_size <= max_size`.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(JmsError::Config("pool max_size must be at least 1".into()));
        }
        if self.initial_size > self.max_size {
            return Err(JmsError::Config(format!(
                "pool initial_size {} exceeds max_size {}",
                self.initial_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Sizing for the connection pool and the pools nested under it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub connections: PoolConfig,
    /// Applied to the session pool of every pooled connection
    pub sessions: PoolConfig,
    /// Applied to the producer pool of every pooled session
    pub producers: PoolConfig,
    /// Run the reset hook when a resource is returned
    pub reset_on_release: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connections: PoolConfig::default(),
            sessions: PoolConfig::default().with_initial_size(0),
            producers: PoolConfig::default().with_initial_size(0),
            reset_on_release: true,
        }
    }
}

impl PoolSettings {
    pub fn with_connections(mut self, config: PoolConfig) -> Self {
        self.connections = config;
        self
    }

    pub fn with_sessions(mut self, config: PoolConfig) -> Self {
        self.sessions = config;
        self
    }

    pub fn with_producers(mut self, config: PoolConfig) -> Self {
        self.producers = config;
        self
    }

    pub fn with_reset_on_release(mut self, enable: bool) -> Self {
        self.reset_on_release = enable;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.connections.validate()?;
        self.sessions.validate()?;
        self.producers.validate()
    }
}

impl FromEnv for PoolSettings {
    /// Reads `JMS_POOL_INITIAL_SIZE`, `JMS_POOL_MAX_SIZE`,
    /// `JMS_SESSION_POOL_MAX_SIZE`, `JMS_PRODUCER_POOL_MAX_SIZE` and
    /// `JMS_POOL_RESET_ON_RELEASE`. Nested pools default to the connection cap.
    fn from_env() -> std::result::Result<Self, ConfigError> {
        let initial_size = env_parse("JMS_POOL_INITIAL_SIZE", DEFAULT_INITIAL_SIZE)?;
        let max_size = env_parse("JMS_POOL_MAX_SIZE", DEFAULT_MAX_SIZE)?;
        let session_max = env_parse("JMS_SESSION_POOL_MAX_SIZE", max_size)?;
        let producer_max = env_parse("JMS_PRODUCER_POOL_MAX_SIZE", max_size)?;
        let reset_on_release = env_flag("JMS_POOL_RESET_ON_RELEASE", true)?;

        let settings = Self {
            connections: PoolConfig::new(initial_size, max_size),
            sessions: PoolConfig::new(0, session_max),
            producers: PoolConfig::new(0, producer_max),
            reset_on_release,
        };
        settings.validate().map_err(|e| ConfigError::Invalid {
            key: "JMS_POOL_*".to_string(),
            details: e.to_string(),
        })?;
        Ok(settings)
    }
}

/// One listener binding: where to listen and how many callbacks run at once
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub destination: DestinationDescriptor,
    pub concurrency: Concurrency,
    /// Grace period for in-flight callbacks when the listener stops
    pub shutdown_timeout: Duration,
    /// Idle time after which surplus workers exit
    pub keep_alive: Duration,
}

impl ListenerConfig {
    /// A sequential (`1-1`) listener on `destination`
    pub fn new(destination: DestinationDescriptor) -> Self {
        Self {
            destination,
            concurrency: Concurrency::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Parse and set a `min-max` concurrency range
    pub fn with_concurrency_range(mut self, range: &str) -> Result<Self> {
        self.concurrency = range.parse()?;
        Ok(self)
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}
