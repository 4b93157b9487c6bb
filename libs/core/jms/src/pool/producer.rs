//! Producers cached per destination within one pooled session.

use super::{Lease, PoolManager, PoolStatus, ResourcePool};
use crate::config::PoolConfig;
use crate::error::Result;
use crate::message::{Destination, Message, SendOptions};
use crate::protocol::{MessageProducer, Session};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Creates producers on one fixed session.
pub struct ProducerManager {
    session: Arc<dyn Session>,
}

impl ProducerManager {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl PoolManager for ProducerManager {
    type Key = Destination;
    type Resource = Arc<dyn MessageProducer>;

    fn kind(&self) -> &'static str {
        "producer"
    }

    async fn create(&self, destination: &Destination) -> Result<Self::Resource> {
        self.session.create_producer(destination).await
    }

    async fn destroy(&self, producer: Self::Resource) {
        if let Err(e) = producer.close().await {
            warn!(destination = %producer.destination(), error = %e, "Failed to close producer");
        }
    }
}

/// Producer pool scoped to one session, keyed by destination.
#[derive(Clone)]
pub struct ProducerPool {
    pool: ResourcePool<ProducerManager>,
}

impl ProducerPool {
    pub fn new(name: impl Into<String>, session: Arc<dyn Session>, config: PoolConfig, reset_on_release: bool) -> Self {
        Self {
            pool: ResourcePool::new(name, config, reset_on_release, ProducerManager::new(session)),
        }
    }

    /// Check out a producer bound to `destination`.
    pub async fn request(&self, destination: &Destination) -> Result<PooledProducer> {
        let pooled = self.pool.request(destination.clone()).await?;
        Ok(PooledProducer {
            producer: Arc::clone(&*pooled),
            lease: Lease::new("pooled producer", pooled),
        })
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub async fn close(&self) {
        self.pool.close().await
    }
}

/// A checked-out producer; `close()` returns it to its pool.
pub struct PooledProducer {
    producer: Arc<dyn MessageProducer>,
    lease: Lease<ProducerManager>,
}

impl PooledProducer {
    /// Pool-assigned id of the underlying producer, `None` once closed.
    pub fn pool_id(&self) -> Option<u64> {
        self.lease.id()
    }
}

#[async_trait]
impl MessageProducer for PooledProducer {
    fn destination(&self) -> &Destination {
        self.producer.destination()
    }

    async fn send(&self, message: Message, options: SendOptions) -> Result<()> {
        self.lease.ensure_open()?;
        self.producer.send(message, options).await
    }

    async fn close(&self) -> Result<()> {
        self.lease.release().await
    }
}
