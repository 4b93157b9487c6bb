//! Sessions pooled per connection, partitioned by transaction semantics.

use super::{Lease, PoolManager, PoolStatus, ProducerPool, ResourcePool};
use crate::config::PoolConfig;
use crate::error::Result;
use crate::message::{Destination, Message, MessageBody};
use crate::protocol::{AcknowledgeMode, Connection, ConsumerOptions, MessageConsumer, MessageProducer, Session};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Creation arguments of a session.
///
/// A transacted session always carries [`AcknowledgeMode::Transacted`] and
/// vice versa, so equivalent requests share one idle partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub transacted: bool,
    pub acknowledge_mode: AcknowledgeMode,
}

impl SessionKey {
    pub fn new(transacted: bool, acknowledge_mode: AcknowledgeMode) -> Self {
        let transacted = transacted || acknowledge_mode == AcknowledgeMode::Transacted;
        let acknowledge_mode = if transacted {
            AcknowledgeMode::Transacted
        } else {
            acknowledge_mode
        };
        Self {
            transacted,
            acknowledge_mode,
        }
    }
}

/// A pooled session together with its producer pool.
#[derive(Clone)]
pub struct SessionHandle {
    pub session: Arc<dyn Session>,
    pub producers: ProducerPool,
}

/// Creates sessions on one fixed connection.
pub struct SessionManager {
    name: String,
    connection: Arc<dyn Connection>,
    producers: PoolConfig,
    reset_on_release: bool,
    created: AtomicU64,
}

impl SessionManager {
    pub fn new(
        name: impl Into<String>,
        connection: Arc<dyn Connection>,
        producers: PoolConfig,
        reset_on_release: bool,
    ) -> Self {
        Self {
            name: name.into(),
            connection,
            producers,
            reset_on_release,
            created: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl PoolManager for SessionManager {
    type Key = SessionKey;
    type Resource = SessionHandle;

    fn kind(&self) -> &'static str {
        "session"
    }

    async fn create(&self, key: &SessionKey) -> Result<SessionHandle> {
        let session = self
            .connection
            .create_session(key.transacted, key.acknowledge_mode)
            .await?;
        let n = self.created.fetch_add(1, Ordering::Relaxed);
        let producers = ProducerPool::new(
            format!("{}-{}-producers", self.name, n),
            session.clone(),
            self.producers,
            self.reset_on_release,
        );
        Ok(SessionHandle { session, producers })
    }

    /// Discard uncommitted work and unacknowledged deliveries so the next
    /// user starts clean.
    async fn reset(&self, handle: &SessionHandle) -> Result<()> {
        match handle.session.acknowledge_mode() {
            _ if handle.session.is_transacted() => {
                debug!(pool = %self.name, "Rolling back returned transacted session");
                handle.session.rollback().await
            }
            AcknowledgeMode::Client => handle.session.recover().await,
            _ => Ok(()),
        }
    }

    async fn destroy(&self, handle: SessionHandle) {
        handle.producers.close().await;
        if let Err(e) = handle.session.close().await {
            warn!(pool = %self.name, error = %e, "Failed to close session");
        }
    }
}

/// Session pool scoped to one connection.
#[derive(Clone)]
pub struct SessionPool {
    pool: ResourcePool<SessionManager>,
}

impl SessionPool {
    pub fn new(
        name: impl Into<String>,
        connection: Arc<dyn Connection>,
        sessions: PoolConfig,
        producers: PoolConfig,
        reset_on_release: bool,
    ) -> Self {
        let name = name.into();
        let manager = SessionManager::new(name.clone(), connection, producers, reset_on_release);
        Self {
            pool: ResourcePool::new(name, sessions, reset_on_release, manager),
        }
    }

    /// Check out a session created with the given semantics.
    pub async fn request(&self, transacted: bool, acknowledge_mode: AcknowledgeMode) -> Result<PooledSession> {
        let pooled = self.pool.request(SessionKey::new(transacted, acknowledge_mode)).await?;
        Ok(PooledSession {
            handle: (*pooled).clone(),
            lease: Lease::new("pooled session", pooled),
        })
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub async fn close(&self) {
        self.pool.close().await
    }
}

/// A checked-out session; `close()` returns it to its pool.
///
/// Producers created from it come from the session's producer pool.
pub struct PooledSession {
    handle: SessionHandle,
    lease: Lease<SessionManager>,
}

impl PooledSession {
    /// Pool-assigned id of the underlying session, `None` once closed.
    pub fn pool_id(&self) -> Option<u64> {
        self.lease.id()
    }

    pub fn producer_status(&self) -> PoolStatus {
        self.handle.producers.status()
    }
}

#[async_trait]
impl Session for PooledSession {
    fn is_transacted(&self) -> bool {
        self.handle.session.is_transacted()
    }

    fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.handle.session.acknowledge_mode()
    }

    fn create_message(&self, body: MessageBody) -> Result<Message> {
        self.handle.session.create_message(body)
    }

    async fn create_producer(&self, destination: &Destination) -> Result<Arc<dyn MessageProducer>> {
        self.lease.ensure_open()?;
        let producer = self.handle.producers.request(destination).await?;
        Ok(Arc::new(producer))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<Arc<dyn MessageConsumer>> {
        self.lease.ensure_open()?;
        self.handle.session.create_consumer(destination, options).await
    }

    async fn acknowledge(&self, message: &Message) -> Result<()> {
        self.handle.session.acknowledge(message).await
    }

    async fn commit(&self) -> Result<()> {
        self.lease.ensure_open()?;
        self.handle.session.commit().await
    }

    async fn rollback(&self) -> Result<()> {
        self.lease.ensure_open()?;
        self.handle.session.rollback().await
    }

    async fn recover(&self) -> Result<()> {
        self.lease.ensure_open()?;
        self.handle.session.recover().await
    }

    async fn close(&self) -> Result<()> {
        self.lease.release().await
    }
}
