//! Client-side building blocks for JMS-style message brokers.
//!
//! - **Pools**: connections, sessions per connection and producers per
//!   session, each bounded and reused, behind the protocol traits so pooled
//!   resources drop in wherever plain ones are expected
//! - **Listeners**: bind a destination to an application callback with a
//!   bounded worker pool, acknowledgement/transaction handling and
//!   coordinated shutdown
//! - **Templates**: one-shot send and receive through a connection pool
//! - **In-memory broker**: a complete in-process implementation of the
//!   protocol traits for tests and local runs
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌─────────────────────────────────────────────────┐
//! │ Application  │    │                ConnectionPool                   │
//! │              │    │  ┌────────────┐  ┌─────────────┐  ┌──────────┐  │
//! │ JmsProducer ─│───▶│  │ connection │─▶│ SessionPool │─▶│ Producer │  │
//! │ JmsConsumer ─│───▶│  │   (idle)   │  │  per conn.  │  │   Pool   │  │
//! │              │    │  └────────────┘  └─────────────┘  └──────────┘  │
//! │ Listener    ─│───▶│                                                 │
//! │  └ executor  │    └───────────────────────┬─────────────────────────┘
//! └──────────────┘                            ▼
//!                               ConnectionFactory (broker client)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use jms::listener::{listener_fn, DestinationDescriptor, HandlerChain, ListenerRegistry};
//! use jms::{ConnectionPool, InMemoryBroker, ListenerConfig, PoolSettings};
//!
//! let broker = Arc::new(InMemoryBroker::new());
//! let pool = ConnectionPool::new("main", broker, PoolSettings::default())?;
//!
//! let registry = ListenerRegistry::new();
//! let config = ListenerConfig::new(DestinationDescriptor::queue("orders"))
//!     .with_concurrency_range("2-4")?;
//! registry
//!     .register(&pool, config, listener_fn("orders", |message| async move {
//!         println!("{:?}", message.body);
//!         Ok(())
//!     }), HandlerChain::new())
//!     .await?;
//! ```

mod config;
mod error;
mod message;
mod metrics;
mod protocol;
mod serdes;

pub mod listener;
pub mod memory;
pub mod pool;
pub mod selector;
pub mod template;

pub use config::{
    ListenerConfig, PoolConfig, PoolSettings, DEFAULT_INITIAL_SIZE, DEFAULT_KEEP_ALIVE, DEFAULT_MAX_SIZE,
    DEFAULT_SHUTDOWN_TIMEOUT,
};
pub use error::{BoxError, ErrorCategory, JmsError, Result};
pub use memory::InMemoryBroker;
pub use message::{
    BodyKind, DeliveryMode, Destination, DestinationType, Message, MessageBody, MessageHeader, SendOptions,
    DEFAULT_PRIORITY, JMS_CORRELATION_ID, JMS_REPLY_TO, JMS_TYPE, MAX_PRIORITY, MIN_PRIORITY, SERDES_TYPE_PROPERTY,
};
pub use metrics::{init_metrics, prometheus_handle, render_metrics, ListenerMetrics, PoolMetrics, RequestOutcome};
pub use pool::{ConnectionPool, PoolRegistry, PoolStatus};
pub use protocol::{
    AcknowledgeMode, Connection, ConnectionFactory, ConsumerOptions, MessageConsumer, MessageProducer, RawListener,
    Session, Subscription,
};
pub use selector::Selector;
pub use serdes::{DefaultSerializer, Deserializer, Serializer};
pub use template::{JmsConsumer, JmsProducer};
