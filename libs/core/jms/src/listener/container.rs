//! A running binding of one destination to one application callback.

use super::{DispatchExecutor, HandlerChain, MessageListener};
use crate::config::ListenerConfig;
use crate::error::{JmsError, Result};
use crate::message::{DestinationType, Message};
use crate::metrics::ListenerMetrics;
use crate::protocol::{AcknowledgeMode, Connection, ConnectionFactory, MessageConsumer, RawListener, Session};
use crate::serdes::{DefaultSerializer, Deserializer};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use strum::{AsRefStr, Display};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of a [`Listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ListenerState {
    Registered,
    Running,
    Stopped,
}

/// Everything a dispatched task needs to finish one message.
struct Dispatch {
    session: Arc<dyn Session>,
    callback: Arc<dyn MessageListener>,
    handlers: HandlerChain,
    deserializer: Arc<dyn Deserializer>,
    config: ListenerConfig,
    metrics: ListenerMetrics,
}

impl Dispatch {
    async fn process(&self, message: Message) {
        let started = Instant::now();
        let outcome = match self.bind(&message) {
            Ok(bound) => self
                .callback
                .on_message(&bound)
                .await
                .map_err(JmsError::CallbackFailed),
            Err(e) => Err(e),
        };
        let outcome = match outcome {
            Ok(()) => self.handlers.on_success(self.session.as_ref(), &message).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                debug!(
                    listener = %self.callback.name(),
                    message_id = %message.id,
                    "Message processed"
                );
                self.metrics.message_succeeded(started.elapsed());
            }
            Err(e) => {
                self.metrics.message_failed(e.kind());
                self.handlers
                    .on_error(self.session.as_ref(), &message, &e)
                    .await;
            }
        }
    }

    /// Convert the body to the descriptor's target kind, if one is set.
    fn bind(&self, message: &Message) -> Result<Message> {
        let mut bound = message.clone();
        if let Some(target) = self.config.destination.target() {
            if bound.body.kind() != target {
                bound.body = self.deserializer.deserialize(message, target)?;
            }
        }
        Ok(bound)
    }
}

/// One session with its consumer.
struct Lane {
    session: Arc<dyn Session>,
    consumer: Arc<dyn MessageConsumer>,
}

struct Running {
    connection: Arc<dyn Connection>,
    lanes: Vec<Lane>,
    executor: DispatchExecutor,
}

/// Binds a destination, its sessions and consumers, and an application
/// callback.
///
/// Deliveries are handed to a [`DispatchExecutor`] so the broker's delivery
/// task never runs application code. Completion order across workers is not
/// guaranteed; use a `1-1` concurrency when order matters.
///
/// A commit or client acknowledgement covers everything its session has
/// consumed. Transacted and client-acknowledged bindings therefore open one
/// session per worker, and each of those sessions holds at most one message
/// until its handlers have finished.
pub struct Listener {
    id: Uuid,
    config: ListenerConfig,
    callback: Arc<dyn MessageListener>,
    handlers: HandlerChain,
    deserializer: Arc<dyn Deserializer>,
    metrics: ListenerMetrics,
    state: Mutex<ListenerState>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Listener {
    /// Create a listener in the `Registered` state.
    ///
    /// The handler chain starts with the handlers derived from the
    /// descriptor; `handlers` are appended after them.
    pub fn new(config: ListenerConfig, callback: Arc<dyn MessageListener>, handlers: HandlerChain) -> Self {
        let metrics = ListenerMetrics::new(callback.name(), config.destination.to_string());
        Self {
            id: Uuid::new_v4(),
            handlers: HandlerChain::for_descriptor(&config.destination).extend(handlers),
            config,
            callback,
            deserializer: Arc::new(DefaultSerializer),
            metrics,
            state: Mutex::new(ListenerState::Registered),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Use a custom body converter for descriptors with a target kind.
    pub fn with_deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.deserializer = deserializer;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        self.callback.name()
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ListenerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Open a connection, the sessions and consumers, and start dispatching.
    ///
    /// Any failure closes what was opened so far and surfaces as
    /// [`JmsError::ListenerRegistrationFailed`].
    pub async fn start(&self, factory: &dyn ConnectionFactory) -> Result<()> {
        let destination = self.config.destination.to_string();
        let mut running = self.running.lock().await;
        if self.state() != ListenerState::Registered {
            return Err(JmsError::registration(
                destination,
                JmsError::Config(format!("listener is {}", self.state())),
            ));
        }

        let resources = self
            .open(factory)
            .await
            .map_err(|e| JmsError::registration(destination.clone(), e))?;
        let sessions = resources.lanes.len();
        *running = Some(resources);
        self.set_state(ListenerState::Running);

        info!(
            listener = %self.name(),
            destination = %destination,
            concurrency = %self.config.concurrency,
            sessions,
            "Listener started"
        );
        Ok(())
    }

    /// Whether a session settles everything it consumed at once.
    fn settles_per_session(&self) -> bool {
        matches!(
            self.config.destination.acknowledge_mode(),
            AcknowledgeMode::Transacted | AcknowledgeMode::Client
        )
    }

    /// Sessions to open. A plain topic subscription cannot be split across
    /// consumers without duplicating messages, so it keeps a single session.
    fn lane_count(&self) -> usize {
        let descriptor = &self.config.destination;
        let splittable = descriptor.kind() == DestinationType::Queue || descriptor.is_shared();
        if self.settles_per_session() && splittable {
            self.config.concurrency.max()
        } else {
            1
        }
    }

    async fn open(&self, factory: &dyn ConnectionFactory) -> Result<Running> {
        let descriptor = &self.config.destination;
        descriptor.validate()?;

        let connection = factory.create_connection().await?;
        let executor = match DispatchExecutor::new(
            format!("{}-{}", self.name(), descriptor),
            self.config.concurrency,
            self.config.keep_alive,
        ) {
            Ok(executor) => executor,
            Err(e) => {
                self.log_cleanup("connection", connection.close().await);
                return Err(e);
            }
        };

        let count = self.lane_count();
        let mut lanes = Vec::with_capacity(count);
        for _ in 0..count {
            match self.open_lane(connection.as_ref(), &executor).await {
                Ok(lane) => lanes.push(lane),
                Err(e) => {
                    self.abandon(connection, lanes, executor).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = connection.start().await {
            self.abandon(connection, lanes, executor).await;
            return Err(e);
        }

        Ok(Running {
            connection,
            lanes,
            executor,
        })
    }

    async fn open_lane(&self, connection: &dyn Connection, executor: &DispatchExecutor) -> Result<Lane> {
        let descriptor = &self.config.destination;
        let session = connection
            .create_session(descriptor.is_transacted(), descriptor.acknowledge_mode())
            .await?;
        let consumer = match session
            .create_consumer(&descriptor.destination(), descriptor.consumer_options())
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                self.log_cleanup("session", session.close().await);
                return Err(e);
            }
        };

        let dispatch = Arc::new(Dispatch {
            session: session.clone(),
            callback: self.callback.clone(),
            handlers: self.handlers.clone(),
            deserializer: self.deserializer.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
        });
        let gate = self
            .settles_per_session()
            .then(|| Arc::new(AtomicBool::new(false)));

        if let Err(e) = consumer.set_message_listener(raw_listener(dispatch, executor.clone(), gate)) {
            self.log_cleanup("consumer", consumer.close().await);
            self.log_cleanup("session", session.close().await);
            return Err(e);
        }
        Ok(Lane { session, consumer })
    }

    /// Undo a partial start. The error that caused it is reported by the
    /// caller; failures here are only logged.
    async fn abandon(&self, connection: Arc<dyn Connection>, lanes: Vec<Lane>, executor: DispatchExecutor) {
        for lane in &lanes {
            self.log_cleanup("consumer", lane.consumer.close().await);
        }
        if !executor.shutdown(self.config.shutdown_timeout).await {
            warn!(listener = %self.name(), "Dispatch executor did not drain during cleanup");
        }
        for lane in &lanes {
            self.log_cleanup("session", lane.session.close().await);
        }
        self.log_cleanup("connection", connection.close().await);
    }

    fn log_cleanup(&self, resource: &str, result: Result<()>) {
        if let Err(e) = result {
            warn!(listener = %self.name(), resource, error = %e, "Failed to close resource during cleanup");
        }
    }

    /// Close the consumers, drain the executor, then return the sessions and
    /// connection.
    ///
    /// Every step runs even if an earlier one failed. Returns `true` when all
    /// of them succeeded. Stopping a stopped listener is a no-op.
    pub async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        let previous = self.state();
        self.set_state(ListenerState::Stopped);
        let Some(resources) = running.take() else {
            if previous != ListenerState::Stopped {
                debug!(listener = %self.name(), "Listener stopped before it started");
            }
            return true;
        };

        let mut clean = true;
        for lane in &resources.lanes {
            if let Err(e) = lane.consumer.close().await {
                warn!(listener = %self.name(), error = %e, "Failed to close consumer");
                clean = false;
            }
        }
        if !resources.executor.shutdown(self.config.shutdown_timeout).await {
            clean = false;
        }
        for lane in &resources.lanes {
            if let Err(e) = lane.session.close().await {
                warn!(listener = %self.name(), error = %e, "Failed to close session");
                clean = false;
            }
        }
        if let Err(e) = resources.connection.close().await {
            warn!(listener = %self.name(), error = %e, "Failed to close connection");
            clean = false;
        }

        info!(
            listener = %self.name(),
            destination = %self.config.destination,
            clean,
            "Listener stopped"
        );
        clean
    }
}

/// Held by a dispatched task while its session has a message in flight.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn acquire(gate: &Arc<AtomicBool>) -> Option<Self> {
        gate.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(gate.clone()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Delivery callback installed on a consumer.
///
/// Runs on the broker client's delivery task, so it only submits. A refused
/// submission is returned as an error, which makes the broker client keep
/// the message for redelivery. With a `gate`, the session takes a new
/// message only after the previous one is finished.
fn raw_listener(dispatch: Arc<Dispatch>, executor: DispatchExecutor, gate: Option<Arc<AtomicBool>>) -> RawListener {
    Arc::new(move |message: Message| {
        let in_flight = match &gate {
            Some(gate) => match InFlight::acquire(gate) {
                Some(in_flight) => Some(in_flight),
                None => {
                    return Err(JmsError::DispatchRejected {
                        listener: executor.name().to_string(),
                        active_workers: executor.worker_count(),
                    })
                }
            },
            None => None,
        };
        let task_dispatch = dispatch.clone();
        executor
            .try_submit(
                async move {
                    let _in_flight = in_flight;
                    task_dispatch.process(message).await
                }
                .boxed(),
            )
            .map_err(|e| {
                if matches!(e, JmsError::DispatchRejected { .. }) {
                    dispatch.metrics.dispatch_rejected();
                }
                warn!(listener = %dispatch.callback.name(), error = %e, "Dispatch refused message");
                e
            })
    })
}
