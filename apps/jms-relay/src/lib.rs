//! JMS Relay
//!
//! Forwards every message arriving at a source destination to a target
//! destination, through pooled connections, sessions and producers.
//!
//! ## Architecture
//!
//! ```text
//! source (RELAY_SOURCE)
//!   ↓ Listener (RELAY_CONCURRENCY workers)
//! relay callback
//!   ↓ JmsProducer (pooled connection/session/producer)
//! target (RELAY_TARGET)
//!   ↓ Listener
//! sink callback (logs what arrived)
//! ```
//!
//! The broker is the in-process [`InMemoryBroker`]; `RELAY_SEED_MESSAGES`
//! messages are published to the source at startup so there is traffic to
//! watch.

mod config;

pub use config::RelayConfig;

use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use jms::listener::{listener_fn, DestinationDescriptor, HandlerChain, ListenerRegistry, MessageListener};
use jms::{
    BoxError, ConnectionPool, Destination, InMemoryBroker, JmsProducer, ListenerConfig, Message, MessageHeader,
    PoolRegistry, PoolSettings,
};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

/// Connection pool name used by the relay.
pub const POOL_NAME: &str = "relay";

/// Copy of `message` for the target, keeping properties and correlation.
pub fn forwarded(message: &Message) -> Message {
    let mut copy = Message::new(message.body.clone());
    copy.properties = message.properties.clone();
    copy.message_type = message.message_type.clone();
    copy.reply_to = message.reply_to.clone();
    copy.correlation_id = Some(message.correlation_id.clone().unwrap_or_else(|| message.id.clone()));
    copy
}

/// Callback forwarding each message to `target`.
pub fn relay_listener(producer: Arc<JmsProducer>, target: Destination) -> Arc<dyn MessageListener> {
    listener_fn("relay", move |message: Message| {
        let producer = producer.clone();
        let target = target.clone();
        async move {
            producer
                .send_message(&target, forwarded(&message), &[])
                .await
                .map_err(|e| Box::new(e) as BoxError)?;
            info!(message_id = %message.id, target = %target, "Message relayed");
            Ok::<(), BoxError>(())
        }
    })
}

fn sink_listener() -> Arc<dyn MessageListener> {
    listener_fn("sink", |message: Message| async move {
        info!(
            message_id = %message.id,
            correlation_id = ?message.correlation_id,
            body = ?message.body,
            "Message arrived at target"
        );
        Ok::<(), BoxError>(())
    })
}

fn descriptor(destination: &Destination) -> DestinationDescriptor {
    DestinationDescriptor::new(destination.kind(), destination.name())
}

/// Run the relay until Ctrl+C or SIGTERM.
///
/// # Errors
///
/// Returns an error if:
/// - pool or relay configuration is invalid
/// - the metrics recorder cannot be installed
/// - a listener cannot be registered
pub async fn run() -> Result<()> {
    install_color_eyre();
    let environment = Environment::from_env();
    init_tracing(&environment);
    jms::init_metrics().wrap_err("Failed to install metrics recorder")?;

    let settings = PoolSettings::from_env().wrap_err("Failed to load pool configuration")?;
    let relay = RelayConfig::from_env().wrap_err("Failed to load relay configuration")?;
    info!(
        source = %relay.source,
        target = %relay.target,
        concurrency = %relay.concurrency,
        max_connections = settings.connections.max_size,
        "Relay configuration loaded"
    );

    let broker = Arc::new(InMemoryBroker::new());
    let mut pools = PoolRegistry::new();
    let pool = pools
        .register(ConnectionPool::new(POOL_NAME, broker.clone(), settings).wrap_err("Failed to build connection pool")?)
        .wrap_err("Failed to register connection pool")?;
    pool.warmed_up().await;

    let listeners = ListenerRegistry::new();
    let target_producer = Arc::new(JmsProducer::new(relay.target.kind(), pool.clone()));
    listeners
        .register(
            pool.as_ref(),
            ListenerConfig::new(descriptor(&relay.source)).with_concurrency(relay.concurrency),
            relay_listener(target_producer, relay.target.clone()),
            HandlerChain::new(),
        )
        .await
        .wrap_err("Failed to start relay listener")?;
    listeners
        .register(
            pool.as_ref(),
            ListenerConfig::new(descriptor(&relay.target)),
            sink_listener(),
            HandlerChain::new(),
        )
        .await
        .wrap_err("Failed to start sink listener")?;

    let seed = JmsProducer::new(relay.source.kind(), pool.clone());
    for n in 0..relay.seed_messages {
        seed.send(relay.source.name(), format!("seed message {}", n), &[MessageHeader::new("seq", n)])
            .await
            .wrap_err("Failed to publish seed message")?;
    }
    info!(count = relay.seed_messages, "Seed messages published");

    shutdown_signal().await;

    if !listeners.shutdown().await {
        warn!("Some listeners did not stop cleanly");
    }
    pools.close_all().await;
    tracing::debug!(metrics = %jms::render_metrics(), "Final metrics");
    info!("Relay stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jms::{DestinationType, PoolConfig};
    use std::time::Duration;

    #[test]
    fn test_forwarded_keeps_correlation() {
        let original = Message::new("x").with_property("seq", 1);
        let copy = forwarded(&original);
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.correlation_id.as_deref(), Some(original.id.as_str()));
        assert_eq!(copy.property("seq"), original.property("seq"));
    }

    #[tokio::test]
    async fn test_relay_moves_messages_to_target() {
        let broker = InMemoryBroker::new();
        let settings = PoolSettings::default().with_connections(PoolConfig::new(0, 4));
        let pool = Arc::new(ConnectionPool::new("relay-test", Arc::new(broker.clone()), settings).unwrap());
        let listeners = ListenerRegistry::new();

        let producer = Arc::new(JmsProducer::new(DestinationType::Queue, pool.clone()));
        listeners
            .register(
                pool.as_ref(),
                ListenerConfig::new(DestinationDescriptor::queue("in")),
                relay_listener(producer, Destination::queue("out")),
                HandlerChain::new(),
            )
            .await
            .unwrap();

        broker.publish(&Destination::queue("in"), Message::new("ping"));
        let consumer = jms::JmsConsumer::new(DestinationType::Queue, pool.clone());
        let relayed = consumer
            .receive("out", Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relayed.body.as_text(), Some("ping"));
        assert!(relayed.correlation_id.is_some());
        assert!(listeners.shutdown().await);
    }
}
