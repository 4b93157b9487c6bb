//! Pooled connections presented through the connection-factory capability.

use super::{Lease, PoolManager, PoolStatus, ResourcePool, SessionPool};
use crate::config::PoolSettings;
use crate::error::{JmsError, Result};
use crate::protocol::{AcknowledgeMode, Connection, ConnectionFactory, Session};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A started connection together with its session pool.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub connection: Arc<dyn Connection>,
    pub sessions: SessionPool,
}

/// Opens and starts connections from the wrapped factory.
pub struct ConnectionManager {
    name: String,
    factory: Arc<dyn ConnectionFactory>,
    settings: PoolSettings,
    created: AtomicU64,
}

impl ConnectionManager {
    pub fn new(name: impl Into<String>, factory: Arc<dyn ConnectionFactory>, settings: PoolSettings) -> Self {
        Self {
            name: name.into(),
            factory,
            settings,
            created: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl PoolManager for ConnectionManager {
    type Key = ();
    type Resource = ConnectionHandle;

    fn kind(&self) -> &'static str {
        "connection"
    }

    async fn create(&self, _key: &()) -> Result<ConnectionHandle> {
        let connection = self.factory.create_connection().await?;
        if let Err(e) = connection.start().await {
            if let Err(close) = connection.close().await {
                warn!(pool = %self.name, error = %close, "Failed to close connection that did not start");
            }
            return Err(e);
        }
        let n = self.created.fetch_add(1, Ordering::Relaxed);
        let sessions = SessionPool::new(
            format!("{}-{}-sessions", self.name, n),
            connection.clone(),
            self.settings.sessions,
            self.settings.producers,
            self.settings.reset_on_release,
        );
        Ok(ConnectionHandle {
            connection,
            sessions,
        })
    }

    async fn destroy(&self, handle: ConnectionHandle) {
        handle.sessions.close().await;
        if let Err(e) = handle.connection.close().await {
            warn!(pool = %self.name, error = %e, "Failed to close connection");
        }
    }
}

/// Connection pool for one broker binding.
///
/// Implements [`ConnectionFactory`], so it can stand in wherever a plain
/// factory is expected; closing a connection it handed out returns the
/// connection to the pool instead of tearing it down.
pub struct ConnectionPool {
    pool: ResourcePool<ConnectionManager>,
    warm_up: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Build the pool and pre-warm `settings.connections.initial_size`
    /// connections in the background.
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
        settings: PoolSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let name = name.into();
        let manager = ConnectionManager::new(name.clone(), factory, settings);
        let pool = ResourcePool::new(name, settings.connections, settings.reset_on_release, manager);
        let warm_up = pool.warm((), settings.connections.initial_size);
        info!(
            pool = %pool.name(),
            initial_size = settings.connections.initial_size,
            max_size = settings.connections.max_size,
            "Connection pool created"
        );
        Ok(Self {
            pool,
            warm_up: Mutex::new(warm_up),
        })
    }

    pub fn name(&self) -> &str {
        self.pool.name()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.pool.manager().settings
    }

    /// Wait for the pre-warm tasks started by [`new`](Self::new).
    pub async fn warmed_up(&self) {
        let handles = std::mem::take(&mut *self.warm_up.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Check out a started connection.
    pub async fn request(&self) -> Result<PooledConnection> {
        let pooled = self.pool.request(()).await?;
        Ok(PooledConnection {
            handle: (*pooled).clone(),
            lease: Lease::new("pooled connection", pooled),
        })
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Close idle connections; connections still checked out are closed
    /// when they are returned.
    pub async fn close(&self) {
        for handle in std::mem::take(&mut *self.warm_up.lock().unwrap_or_else(PoisonError::into_inner)) {
            handle.abort();
        }
        self.pool.close().await;
        info!(pool = %self.pool.name(), "Connection pool closed");
    }
}

#[async_trait]
impl ConnectionFactory for ConnectionPool {
    async fn create_connection(&self) -> Result<Arc<dyn Connection>> {
        Ok(Arc::new(self.request().await?))
    }

    async fn create_connection_with_credentials(
        &self,
        _username: &str,
        _password: &str,
    ) -> Result<Arc<dyn Connection>> {
        Err(JmsError::UnsupportedOperation(format!(
            "pool '{}' uses the credentials of its wrapped connection factory",
            self.name()
        )))
    }
}

/// A checked-out connection; `close()` returns it to its pool.
pub struct PooledConnection {
    handle: ConnectionHandle,
    lease: Lease<ConnectionManager>,
}

impl PooledConnection {
    /// Pool-assigned id of the underlying connection, `None` once closed.
    pub fn pool_id(&self) -> Option<u64> {
        self.lease.id()
    }

    pub fn session_status(&self) -> PoolStatus {
        self.handle.sessions.status()
    }
}

#[async_trait]
impl Connection for PooledConnection {
    async fn start(&self) -> Result<()> {
        self.lease.ensure_open()?;
        self.handle.connection.start().await
    }

    /// Draws from this connection's session pool.
    async fn create_session(
        &self,
        transacted: bool,
        acknowledge_mode: AcknowledgeMode,
    ) -> Result<Arc<dyn Session>> {
        self.lease.ensure_open()?;
        let session = self.handle.sessions.request(transacted, acknowledge_mode).await?;
        Ok(Arc::new(session))
    }

    async fn close(&self) -> Result<()> {
        self.lease.release().await
    }
}
