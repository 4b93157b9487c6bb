//! Named connection pools, built once at startup and passed by reference.

use super::ConnectionPool;
use crate::error::{JmsError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Resolves a broker binding name to its connection pool.
#[derive(Default)]
pub struct PoolRegistry {
    pools: HashMap<String, Arc<ConnectionPool>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool under its own name. Names must be unique.
    pub fn register(&mut self, pool: ConnectionPool) -> Result<Arc<ConnectionPool>> {
        let name = pool.name().to_string();
        if self.pools.contains_key(&name) {
            return Err(JmsError::Config(format!(
                "connection pool '{}' is already registered",
                name
            )));
        }
        let pool = Arc::new(pool);
        self.pools.insert(name.clone(), pool.clone());
        debug!(pool = %name, "Registered connection pool");
        Ok(pool)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.get(name).cloned()
    }

    /// Look up a pool, failing with a configuration error when it is unknown.
    pub fn require(&self, name: &str) -> Result<Arc<ConnectionPool>> {
        self.get(name)
            .ok_or_else(|| JmsError::Config(format!("no connection pool named '{}'", name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Close every registered pool.
    pub async fn close_all(&self) {
        for pool in self.pools.values() {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::memory::InMemoryBroker;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = PoolRegistry::new();
        registry
            .register(ConnectionPool::new("primary", broker.clone(), PoolSettings::default()).unwrap())
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.get("primary").is_some());
        assert!(matches!(registry.require("other"), Err(JmsError::Config(_))));

        let duplicate = ConnectionPool::new("primary", broker, PoolSettings::default()).unwrap();
        assert!(registry.register(duplicate).is_err());
        registry.close_all().await;
    }
}
