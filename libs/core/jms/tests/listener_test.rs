//! Listener tests against the in-memory broker
//!
//! These tests drive complete bindings end to end:
//! - delivery to the callback and clean shutdown
//! - acknowledgement and transaction handling around the callback
//! - per-worker sessions for transacted bindings, ordering with one worker
//! - worker bounds under load
//! - selectors, shared and durable topic subscriptions

use jms::listener::{
    listener_fn, Concurrency, DestinationDescriptor, DispatchExecutor, HandlerChain, ListenerRegistry, ListenerState,
    MessageListener,
};
use jms::{
    AcknowledgeMode, BoxError, Connection, ConnectionPool, Destination, DestinationType, InMemoryBroker, JmsError, JmsProducer,
    ListenerConfig, Message, MessageHeader, PoolConfig, PoolSettings,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

const WAIT: Duration = Duration::from_secs(2);

fn pool(broker: &InMemoryBroker) -> Arc<ConnectionPool> {
    let settings = PoolSettings::default().with_connections(PoolConfig::new(0, 8));
    Arc::new(ConnectionPool::new("listener-test", Arc::new(broker.clone()), settings).unwrap())
}

/// Callback forwarding every message body (as text) to a channel.
fn forwarding(name: &str) -> (Arc<dyn MessageListener>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = listener_fn(name, move |message: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message.body.as_text().unwrap_or_default().to_string());
            Ok::<(), BoxError>(())
        }
    });
    (listener, rx)
}

/// Callback that reports the message and then fails.
fn failing(name: &str) -> (Arc<dyn MessageListener>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = listener_fn(name, move |message: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message.id.clone());
            Err::<(), BoxError>("callback refused".into())
        }
    });
    (listener, rx)
}

/// Poll `check` until it holds or [`WAIT`] elapses.
async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_delivers_then_stops_cleanly() {
    let broker = InMemoryBroker::new();
    let pool = pool(&broker);
    let registry = ListenerRegistry::new();
    let (callback, mut received) = forwarding("hello-listener");

    let config = ListenerConfig::new(DestinationDescriptor::queue("Q"))
        .with_concurrency_range("1-1")
        .unwrap();
    let listener = registry
        .register(pool.as_ref(), config, callback, HandlerChain::new())
        .await
        .unwrap();
    assert_eq!(listener.state(), ListenerState::Running);

    let producer = JmsProducer::new(DestinationType::Queue, pool.clone());
    producer.send("Q", "hello", &[]).await.unwrap();
    let body = tokio::time::timeout(WAIT, received.recv()).await.unwrap().unwrap();
    assert_eq!(body, "hello");

    assert!(registry.shutdown().await);
    assert_eq!(listener.state(), ListenerState::Stopped);
    assert!(registry.is_empty());

    // Returning the pooled session must not hand "hello" back to the queue.
    let (fresh, mut fresh_rx) = forwarding("fresh-listener");
    registry
        .register(
            pool.as_ref(),
            ListenerConfig::new(DestinationDescriptor::queue("Q")),
            fresh,
            HandlerChain::new(),
        )
        .await
        .unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(200), fresh_rx.recv())
        .await
        .is_err());
    assert_eq!(broker.pending(&Destination::queue("Q")), 0);
    assert!(registry.shutdown().await);

    producer.send("Q", "after stop", &[]).await.unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(200), received.recv())
        .await
        .is_err());
    assert_eq!(broker.pending(&Destination::queue("Q")), 1);
    assert!(listener.stop().await);
}

#[tokio::test]
async fn test_client_ack_on_success_only() {
    let broker = InMemoryBroker::new();
    let pool = pool(&broker);
    let registry = ListenerRegistry::new();

    let (ok, mut ok_rx) = forwarding("ack-ok");
    let descriptor = DestinationDescriptor::queue("ack-ok").with_acknowledge_mode(AcknowledgeMode::Client);
    registry
        .register(pool.as_ref(), ListenerConfig::new(descriptor), ok, HandlerChain::new())
        .await
        .unwrap();
    broker.publish(&Destination::queue("ack-ok"), Message::new("good"));
    tokio::time::timeout(WAIT, ok_rx.recv()).await.unwrap().unwrap();
    assert!(eventually(|| broker.acknowledged() == 1).await);

    let (bad, mut bad_rx) = failing("ack-bad");
    let descriptor = DestinationDescriptor::queue("ack-bad").with_acknowledge_mode(AcknowledgeMode::Client);
    registry
        .register(pool.as_ref(), ListenerConfig::new(descriptor), bad, HandlerChain::new())
        .await
        .unwrap();
    broker.publish(&Destination::queue("ack-bad"), Message::new("bad"));
    tokio::time::timeout(WAIT, bad_rx.recv()).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.acknowledged(), 1);

    assert!(registry.shutdown().await);
}

#[tokio::test]
async fn test_transacted_commit_on_success() {
    let broker = InMemoryBroker::new();
    let registry = ListenerRegistry::new();
    let (callback, mut received) = forwarding("tx-ok");

    let descriptor = DestinationDescriptor::queue("tx-ok").transacted(true);
    registry
        .register(&broker, ListenerConfig::new(descriptor), callback, HandlerChain::new())
        .await
        .unwrap();
    broker.publish(&Destination::queue("tx-ok"), Message::new("commit me"));
    tokio::time::timeout(WAIT, received.recv()).await.unwrap().unwrap();

    assert!(eventually(|| broker.commits() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.commits(), 1);
    assert_eq!(broker.rollbacks(), 0);
    assert!(registry.shutdown().await);
}

#[tokio::test]
async fn test_transacted_rollback_on_failure() {
    let broker = InMemoryBroker::new().with_redelivery_limit(0);
    let registry = ListenerRegistry::new();
    let (callback, mut received) = failing("tx-bad");

    let descriptor = DestinationDescriptor::queue("tx-bad").with_acknowledge_mode(AcknowledgeMode::Transacted);
    registry
        .register(&broker, ListenerConfig::new(descriptor), callback, HandlerChain::new())
        .await
        .unwrap();
    broker.publish(&Destination::queue("tx-bad"), Message::new("roll me back"));
    tokio::time::timeout(WAIT, received.recv()).await.unwrap().unwrap();

    assert!(eventually(|| broker.rollbacks() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.rollbacks(), 1);
    assert_eq!(broker.commits(), 0);
    assert_eq!(broker.dead_letters().len(), 1);
    assert!(registry.shutdown().await);
}

#[tokio::test]
async fn test_transacted_workers_settle_only_their_own_message() {
    let broker = InMemoryBroker::new().with_redelivery_limit(0);
    let registry = ListenerRegistry::new();
    let bad_attempts = Arc::new(AtomicUsize::new(0));
    let (tx, mut good_rx) = mpsc::unbounded_channel();
    let callback = {
        let bad_attempts = bad_attempts.clone();
        listener_fn("overlap", move |message: Message| {
            let (bad_attempts, tx) = (bad_attempts.clone(), tx.clone());
            async move {
                if message.body.as_text() == Some("bad") {
                    bad_attempts.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    return Err::<(), BoxError>("slow failure".into());
                }
                let _ = tx.send(message.id.clone());
                Ok(())
            }
        })
    };

    let config = ListenerConfig::new(DestinationDescriptor::queue("overlap").transacted(true))
        .with_concurrency_range("2-2")
        .unwrap();
    registry
        .register(&broker, config, callback, HandlerChain::new())
        .await
        .unwrap();
    broker.publish(&Destination::queue("overlap"), Message::new("bad"));
    broker.publish(&Destination::queue("overlap"), Message::new("good"));

    tokio::time::timeout(WAIT, good_rx.recv()).await.unwrap().unwrap();
    assert!(eventually(|| broker.dead_letters().len() == 1).await);
    let dead = broker.dead_letters();
    assert_eq!(dead[0].body.as_text(), Some("bad"));
    assert_eq!(bad_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(broker.commits(), 1);
    assert_eq!(broker.rollbacks(), 1);
    assert!(registry.shutdown().await);
}

#[tokio::test]
async fn test_single_worker_keeps_delivery_order() {
    let broker = InMemoryBroker::new().with_redelivery_delay(Duration::from_millis(1));
    let registry = ListenerRegistry::new();
    let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();

    for descriptor in [
        DestinationDescriptor::queue("ord"),
        DestinationDescriptor::queue("ord-tx").transacted(true),
    ] {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback = listener_fn("ordered", move |message: Message| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                let _ = tx.send(message.body.as_text().unwrap_or_default().to_string());
                Ok::<(), BoxError>(())
            }
        });
        let destination = descriptor.destination();
        let config = ListenerConfig::new(descriptor).with_concurrency_range("1-1").unwrap();
        registry
            .register(&broker, config, callback, HandlerChain::new())
            .await
            .unwrap();

        for body in &expected {
            broker.publish(&destination, Message::new(body.as_str()));
        }
        let mut bodies = Vec::new();
        for _ in 0..expected.len() {
            bodies.push(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap());
        }
        assert_eq!(bodies, expected, "order on {destination}");
    }
    assert!(registry.shutdown().await);
}

#[tokio::test]
async fn test_executor_prestarts_core_workers() {
    let executor = DispatchExecutor::new("prestart", Concurrency::new(2, 4).unwrap(), Duration::from_secs(5)).unwrap();
    assert_eq!(executor.worker_count(), 2);
    assert_eq!(executor.active_count(), 0);
    assert!(executor.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_concurrency_bounds_in_flight_callbacks() {
    let broker = InMemoryBroker::new().with_redelivery_delay(Duration::from_millis(2));
    let registry = ListenerRegistry::new();

    let gate = Arc::new(Semaphore::new(0));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let callback = {
        let (gate, in_flight, peak, done) = (gate.clone(), in_flight.clone(), peak.clone(), done.clone());
        listener_fn("bounded", move |_message: Message| {
            let (gate, in_flight, peak, done) = (gate.clone(), in_flight.clone(), peak.clone(), done.clone());
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let permit = gate.acquire().await.map_err(|e| Box::new(e) as BoxError)?;
                drop(permit);
                in_flight.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        })
    };

    let config = ListenerConfig::new(DestinationDescriptor::queue("load"))
        .with_concurrency_range("2-4")
        .unwrap();
    registry
        .register(&broker, config, callback, HandlerChain::new())
        .await
        .unwrap();
    for i in 0..10 {
        broker.publish(&Destination::queue("load"), Message::new(format!("m{i}")));
    }

    assert!(eventually(|| in_flight.load(Ordering::SeqCst) == 4).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(peak.load(Ordering::SeqCst), 4);

    gate.add_permits(100);
    assert!(eventually(|| done.load(Ordering::SeqCst) == 10).await);
    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert!(registry.shutdown().await);
}

#[tokio::test]
async fn test_selectors_split_a_queue() {
    let broker = InMemoryBroker::new();
    let pool = pool(&broker);
    let registry = ListenerRegistry::new();

    let (yes, mut yes_rx) = forwarding("flag-true");
    let (no, mut no_rx) = forwarding("flag-false");
    for (callback, selector) in [(yes, "flag = true"), (no, "flag = false")] {
        let descriptor = DestinationDescriptor::queue("S").with_selector(selector);
        registry
            .register(pool.as_ref(), ListenerConfig::new(descriptor), callback, HandlerChain::new())
            .await
            .unwrap();
    }

    let producer = JmsProducer::new(DestinationType::Queue, pool.clone());
    for (body, flag) in [("a", true), ("b", false), ("c", true)] {
        producer
            .send("S", body, &[MessageHeader::new("flag", flag)])
            .await
            .unwrap();
    }

    let mut yes_bodies = Vec::new();
    for _ in 0..2 {
        yes_bodies.push(tokio::time::timeout(WAIT, yes_rx.recv()).await.unwrap().unwrap());
    }
    let no_body = tokio::time::timeout(WAIT, no_rx.recv()).await.unwrap().unwrap();
    yes_bodies.sort();
    assert_eq!(yes_bodies, vec!["a", "c"]);
    assert_eq!(no_body, "b");
    assert!(tokio::time::timeout(Duration::from_millis(50), yes_rx.recv()).await.is_err());

    assert_eq!(registry.len(), 2);
    assert!(registry.shutdown().await);
}

#[tokio::test]
async fn test_registration_failure_leaves_registry_untouched() {
    let broker = InMemoryBroker::new();
    let registry = ListenerRegistry::new();
    let (callback, _rx) = forwarding("broken");

    let descriptor = DestinationDescriptor::queue("broken").with_selector("flag = ");
    let Err(err) = registry
        .register(&broker, ListenerConfig::new(descriptor), callback.clone(), HandlerChain::new())
        .await
    else {
        panic!("invalid selector should fail registration");
    };
    assert!(matches!(err, JmsError::ListenerRegistrationFailed { .. }));

    let queue_shared = DestinationDescriptor::queue("broken").shared(true);
    assert!(registry
        .register(&broker, ListenerConfig::new(queue_shared), callback, HandlerChain::new())
        .await
        .is_err());
    assert!(registry.is_empty());
    assert_eq!(broker.connections_created(), 0);
}

#[tokio::test]
async fn test_failed_registration_returns_pooled_resources() {
    let broker = InMemoryBroker::new();
    let pool = pool(&broker);
    let registry = ListenerRegistry::new();
    let descriptor = DestinationDescriptor::topic("ledger").durable(true);

    let (first, _first_rx) = forwarding("ledger-1");
    registry
        .register(pool.as_ref(), ListenerConfig::new(descriptor.clone()), first, HandlerChain::new())
        .await
        .unwrap();
    assert_eq!(pool.status().active, 1);

    // The durable subscription already has its consumer.
    let (second, _second_rx) = forwarding("ledger-2");
    let Err(err) = registry
        .register(pool.as_ref(), ListenerConfig::new(descriptor), second, HandlerChain::new())
        .await
    else {
        panic!("second consumer on a durable subscription should fail");
    };
    assert!(matches!(err, JmsError::ListenerRegistrationFailed { .. }));
    assert_eq!(registry.len(), 1);

    let status = pool.status();
    assert_eq!(status.active, 1);
    assert_eq!(status.idle, 1);
    let connection = pool.request().await.unwrap();
    assert_eq!(connection.session_status().active, 0);
    connection.close().await.unwrap();
    assert!(registry.shutdown().await);
}

#[tokio::test]
async fn test_shared_topic_subscription_delivers_once() {
    let broker = InMemoryBroker::new();
    let registry = ListenerRegistry::new();
    let count = Arc::new(AtomicUsize::new(0));

    for name in ["shared-a", "shared-b"] {
        let count = count.clone();
        let callback = listener_fn(name, move |_message: Message| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        });
        let descriptor = DestinationDescriptor::topic("events")
            .shared(true)
            .with_subscription_name("workers");
        registry
            .register(&broker, ListenerConfig::new(descriptor), callback, HandlerChain::new())
            .await
            .unwrap();
    }

    broker.publish(&Destination::topic("events"), Message::new("once"));
    assert!(eventually(|| count.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(registry.shutdown().await);
}

#[tokio::test]
async fn test_durable_topic_subscription_survives_restart() {
    let broker = InMemoryBroker::new();
    let registry = ListenerRegistry::new();
    let descriptor = DestinationDescriptor::topic("audit").durable(true);

    let (first, _first_rx) = forwarding("audit-1");
    registry
        .register(&broker, ListenerConfig::new(descriptor.clone()), first, HandlerChain::new())
        .await
        .unwrap();
    assert!(registry.shutdown().await);

    broker.publish(&Destination::topic("audit"), Message::new("while away"));
    assert_eq!(broker.pending(&Destination::topic("audit")), 1);

    let (second, mut second_rx) = forwarding("audit-2");
    registry
        .register(&broker, ListenerConfig::new(descriptor), second, HandlerChain::new())
        .await
        .unwrap();
    let body = tokio::time::timeout(WAIT, second_rx.recv()).await.unwrap().unwrap();
    assert_eq!(body, "while away");
    assert!(registry.shutdown().await);
}

#[tokio::test]
async fn test_target_kind_converts_body_before_callback() {
    let broker = InMemoryBroker::new();
    let registry = ListenerRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback = listener_fn("typed", move |message: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message.body.kind());
            Ok::<(), BoxError>(())
        }
    });

    let descriptor = DestinationDescriptor::queue("typed").with_target(jms::BodyKind::Object);
    registry
        .register(&broker, ListenerConfig::new(descriptor), callback, HandlerChain::new())
        .await
        .unwrap();
    broker.publish(&Destination::queue("typed"), Message::new(r#"{"id": 1}"#));
    let kind = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(kind, jms::BodyKind::Object);
    assert!(registry.shutdown().await);
}
