//! In-process broker client for tests and local runs.
//!
//! Implements the protocol traits against shared in-memory mailboxes:
//! - queues deliver each message to one consumer, round-robin among the
//!   consumers whose selector matches; unmatched messages wait
//! - topics fan out to every subscription; a shared subscription delivers
//!   once per subscription name, a durable one keeps messages while no
//!   consumer is attached
//! - client acknowledgement, transactions (sends buffered until commit,
//!   received messages redelivered on rollback), time-to-live
//! - a message refused by a busy listener is offered again after a short
//!   delay, ahead of later messages; any other refusal requeues it
//!
//! Messages redelivered by rollback or recover more than the redelivery
//! limit are moved to [`InMemoryBroker::dead_letters`].

use crate::error::{JmsError, Result};
use crate::message::{Destination, Message, SendOptions};
use crate::protocol::{
    AcknowledgeMode, Connection, ConnectionFactory, ConsumerOptions, MessageConsumer, MessageProducer,
    RawListener, Session, Subscription,
};
use crate::selector::Selector;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Redeliveries allowed before a message is dead-lettered.
pub const DEFAULT_REDELIVERY_LIMIT: u32 = 6;
/// Pause before a refused message is offered again.
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SubscriptionKey {
    Consumer(u64),
    Named(String),
}

/// Where a delivered message goes back to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Address {
    Queue(String),
    Topic { topic: String, key: SubscriptionKey },
}

struct Slot {
    id: u64,
    selector: Option<Selector>,
    started: Arc<AtomicBool>,
    inbox: mpsc::UnboundedSender<Message>,
}

impl Slot {
    fn accepts(&self, message: &Message) -> bool {
        self.started.load(Ordering::SeqCst) && self.selector.as_ref().map_or(true, |s| s.matches(message))
    }
}

#[derive(Default)]
struct Mailbox {
    pending: VecDeque<Message>,
    consumers: Vec<Slot>,
    next: usize,
    /// Topic subscriptions only store messages their selector accepts.
    filter: Option<Selector>,
    durable: bool,
    shared: bool,
}

impl Mailbox {
    fn offer(&mut self, message: Message) {
        if self.filter.as_ref().map_or(true, |f| f.matches(&message)) {
            self.pending.push_back(message);
            self.pump();
        }
    }

    /// Hand pending messages to consumers that accept them.
    fn pump(&mut self) {
        let now = Utc::now();
        let mut waiting = VecDeque::with_capacity(self.pending.len());
        while let Some(message) = self.pending.pop_front() {
            if message.is_expired(now) {
                debug!(message_id = %message.id, "Dropping expired message");
                continue;
            }
            if let Some(unsent) = self.deliver(message) {
                waiting.push_back(unsent);
            }
        }
        self.pending = waiting;
    }

    /// Round-robin over matching consumers; returns the message if nobody took it.
    fn deliver(&mut self, mut message: Message) -> Option<Message> {
        let count = self.consumers.len();
        for offset in 0..count {
            let index = (self.next + offset) % count;
            if !self.consumers[index].accepts(&message) {
                continue;
            }
            message.delivery_count += 1;
            message.redelivered = message.delivery_count > 1;
            match self.consumers[index].inbox.send(message) {
                Ok(()) => {
                    self.next = index + 1;
                    return None;
                }
                Err(mpsc::error::SendError(returned)) => {
                    message = returned;
                    message.delivery_count -= 1;
                    message.redelivered = message.delivery_count > 1;
                }
            }
        }
        Some(message)
    }
}

#[derive(Default)]
struct Destinations {
    queues: HashMap<String, Mailbox>,
    topics: HashMap<String, HashMap<SubscriptionKey, Mailbox>>,
    dead_letters: Vec<Message>,
}

impl Destinations {
    fn mailbox(&mut self, address: &Address) -> Option<&mut Mailbox> {
        match address {
            Address::Queue(name) => self.queues.get_mut(name),
            Address::Topic { topic, key } => self.topics.get_mut(topic)?.get_mut(key),
        }
    }

    fn route(&mut self, destination: &Destination, message: Message) {
        match destination {
            Destination::Queue(name) => self.queues.entry(name.clone()).or_default().offer(message),
            Destination::Topic(name) => {
                if let Some(subscriptions) = self.topics.get_mut(name) {
                    for mailbox in subscriptions.values_mut() {
                        mailbox.offer(message.clone());
                    }
                }
            }
        }
    }

    fn pump_all(&mut self) {
        self.queues.values_mut().for_each(Mailbox::pump);
        self.topics
            .values_mut()
            .flat_map(HashMap::values_mut)
            .for_each(Mailbox::pump);
    }
}

struct BrokerState {
    destinations: Mutex<Destinations>,
    redelivery_limit: AtomicU32,
    redelivery_delay_ms: AtomicU64,
    next_id: AtomicU64,
    connections_created: AtomicUsize,
    acknowledged: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl BrokerState {
    fn lock(&self) -> MutexGuard<'_, Destinations> {
        self.destinations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, destination: &Destination, message: Message) {
        self.lock().route(destination, message);
    }

    fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms.load(Ordering::SeqCst))
    }

    /// Put back a message the consumer never processed.
    fn return_undelivered(&self, address: &Address, mut message: Message) {
        message.delivery_count = message.delivery_count.saturating_sub(1);
        message.redelivered = message.delivery_count > 1;
        self.requeue(address, vec![message]);
    }

    /// Put back messages that were processed but not acknowledged or committed.
    fn redeliver(&self, messages: Vec<(Address, Message)>) {
        let limit = self.redelivery_limit.load(Ordering::SeqCst);
        let mut by_address: Vec<(Address, Vec<Message>)> = Vec::new();
        let mut state = self.lock();
        for (address, message) in messages {
            if message.delivery_count > limit {
                warn!(message_id = %message.id, deliveries = message.delivery_count, "Redelivery limit reached, dead-lettering");
                state.dead_letters.push(message);
                continue;
            }
            match by_address.iter_mut().find(|(a, _)| *a == address) {
                Some((_, batch)) => batch.push(message),
                None => by_address.push((address, vec![message])),
            }
        }
        drop(state);
        for (address, batch) in by_address {
            self.requeue(&address, batch);
        }
    }

    /// Re-insert at the front, keeping the batch order.
    fn requeue(&self, address: &Address, messages: Vec<Message>) {
        let mut state = self.lock();
        match state.mailbox(address) {
            Some(mailbox) => {
                for message in messages.into_iter().rev() {
                    mailbox.pending.push_front(message);
                }
                mailbox.pump();
            }
            None => debug!(address = ?address, dropped = messages.len(), "Subscription gone, dropping messages"),
        }
    }

    fn attach(
        &self,
        destination: &Destination,
        options: &ConsumerOptions,
        selector: Option<Selector>,
        started: Arc<AtomicBool>,
        inbox: mpsc::UnboundedSender<Message>,
    ) -> Result<(u64, Address)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let slot = Slot {
            id,
            selector: selector.clone(),
            started,
            inbox,
        };
        let mut state = self.lock();
        let (address, mailbox) = match destination {
            Destination::Queue(name) => (
                Address::Queue(name.clone()),
                state.queues.entry(name.clone()).or_default(),
            ),
            Destination::Topic(topic) => {
                let key = match options.subscription.name() {
                    Some(name) => SubscriptionKey::Named(name.to_string()),
                    None => SubscriptionKey::Consumer(id),
                };
                let mailbox = state
                    .topics
                    .entry(topic.clone())
                    .or_default()
                    .entry(key.clone())
                    .or_insert_with(|| Mailbox {
                        filter: selector,
                        durable: options.subscription.is_durable(),
                        shared: options.subscription.is_shared(),
                        ..Mailbox::default()
                    });
                if !mailbox.shared && !mailbox.consumers.is_empty() {
                    return Err(JmsError::protocol(format!(
                        "subscription '{}' on topic '{}' already has a consumer",
                        options.subscription.name().unwrap_or_default(),
                        topic
                    )));
                }
                (
                    Address::Topic {
                        topic: topic.clone(),
                        key,
                    },
                    mailbox,
                )
            }
        };
        mailbox.consumers.push(slot);
        mailbox.pump();
        Ok((id, address))
    }

    fn detach(&self, id: u64, address: &Address) {
        let mut state = self.lock();
        let Some(mailbox) = state.mailbox(address) else {
            return;
        };
        mailbox.consumers.retain(|slot| slot.id != id);
        let unused = mailbox.consumers.is_empty() && !mailbox.durable;
        if let (true, Address::Topic { topic, key }) = (unused, address) {
            if let Some(subscriptions) = state.topics.get_mut(topic) {
                subscriptions.remove(key);
            }
        }
    }
}

/// In-process broker. Clones share the same destinations.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                destinations: Mutex::new(Destinations::default()),
                redelivery_limit: AtomicU32::new(DEFAULT_REDELIVERY_LIMIT),
                redelivery_delay_ms: AtomicU64::new(DEFAULT_REDELIVERY_DELAY.as_millis() as u64),
                next_id: AtomicU64::new(1),
                connections_created: AtomicUsize::new(0),
                acknowledged: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
            }),
        }
    }

    /// Set how often a rolled back or recovered message may be redelivered.
    pub fn with_redelivery_limit(self, limit: u32) -> Self {
        self.state.redelivery_limit.store(limit, Ordering::SeqCst);
        self
    }

    /// Set the pause before a refused message is offered again.
    pub fn with_redelivery_delay(self, delay: Duration) -> Self {
        self.state
            .redelivery_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    /// Deliver a message without going through a producer.
    pub fn publish(&self, destination: &Destination, mut message: Message) {
        SendOptions::default().stamp(&mut message, destination);
        self.state.route(destination, message);
    }

    pub fn connections_created(&self) -> usize {
        self.state.connections_created.load(Ordering::SeqCst)
    }

    /// Messages waiting at `destination` (summed over subscriptions for topics).
    pub fn pending(&self, destination: &Destination) -> usize {
        let state = self.state.lock();
        match destination {
            Destination::Queue(name) => state.queues.get(name).map_or(0, |m| m.pending.len()),
            Destination::Topic(name) => state
                .topics
                .get(name)
                .map_or(0, |subs| subs.values().map(|m| m.pending.len()).sum()),
        }
    }

    /// Client acknowledgements that matched a delivered message.
    pub fn acknowledged(&self) -> usize {
        self.state.acknowledged.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    pub fn dead_letters(&self) -> Vec<Message> {
        self.state.lock().dead_letters.clone()
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryBroker {
    async fn create_connection(&self) -> Result<Arc<dyn Connection>> {
        self.state.connections_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryConnection {
            broker: self.state.clone(),
            started: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
        }))
    }
}

/// Connection to an [`InMemoryBroker`].
pub struct InMemoryConnection {
    broker: Arc<BrokerState>,
    started: Arc<AtomicBool>,
    closed: AtomicBool,
    sessions: Mutex<Vec<Arc<SessionCore>>>,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JmsError::Closed("connection"));
        }
        if !self.started.swap(true, Ordering::SeqCst) {
            self.broker.lock().pump_all();
        }
        Ok(())
    }

    async fn create_session(
        &self,
        transacted: bool,
        acknowledge_mode: AcknowledgeMode,
    ) -> Result<Arc<dyn Session>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JmsError::Closed("connection"));
        }
        let transacted = transacted || acknowledge_mode == AcknowledgeMode::Transacted;
        let core = Arc::new(SessionCore {
            broker: self.broker.clone(),
            started: self.started.clone(),
            transacted,
            acknowledge_mode: if transacted {
                AcknowledgeMode::Transacted
            } else {
                acknowledge_mode
            },
            inner: Mutex::new(SessionInner::default()),
        });
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(core.clone());
        Ok(Arc::new(InMemorySession { core }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.started.store(false, Ordering::SeqCst);
        let sessions = std::mem::take(&mut *self.sessions.lock().unwrap_or_else(PoisonError::into_inner));
        for session in sessions {
            session.close();
        }
        Ok(())
    }
}

#[derive(Default)]
struct SessionInner {
    /// Deliveries awaiting acknowledgement or commit.
    delivered: Vec<(Address, Message)>,
    /// Sends awaiting commit.
    outgoing: Vec<(Destination, Message)>,
    consumers: Vec<Arc<ConsumerCore>>,
    closed: bool,
}

struct SessionCore {
    broker: Arc<BrokerState>,
    started: Arc<AtomicBool>,
    transacted: bool,
    acknowledge_mode: AcknowledgeMode,
    inner: Mutex<SessionInner>,
}

impl SessionCore {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.lock().closed {
            Err(JmsError::Closed("session"))
        } else {
            Ok(())
        }
    }

    fn tracks_deliveries(&self) -> bool {
        self.transacted || self.acknowledge_mode == AcknowledgeMode::Client
    }

    fn track(&self, address: &Address, message: &Message) {
        if self.tracks_deliveries() {
            self.lock().delivered.push((address.clone(), message.clone()));
        }
    }

    /// Hand `message` to `hand_off` and track it only if it was accepted.
    ///
    /// The session lock is held throughout, so an acknowledge, commit or
    /// rollback racing with the offer never settles a refused message.
    fn offer(&self, address: &Address, message: &Message, hand_off: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut inner = self.lock();
        let accepted = hand_off();
        if accepted.is_ok() && self.tracks_deliveries() {
            inner.delivered.push((address.clone(), message.clone()));
        }
        accepted
    }

    fn send(&self, destination: &Destination, message: Message) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(JmsError::Closed("session"));
        }
        if self.transacted {
            inner.outgoing.push((destination.clone(), message));
        } else {
            drop(inner);
            self.broker.route(destination, message);
        }
        Ok(())
    }

    fn take_delivered(&self) -> Vec<(Address, Message)> {
        std::mem::take(&mut self.lock().delivered)
    }

    fn close(&self) {
        let (consumers, delivered) = {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.outgoing.clear();
            (
                std::mem::take(&mut inner.consumers),
                std::mem::take(&mut inner.delivered),
            )
        };
        for consumer in consumers {
            consumer.close();
        }
        self.broker.redeliver(delivered);
    }
}

/// Session of an [`InMemoryConnection`].
pub struct InMemorySession {
    core: Arc<SessionCore>,
}

#[async_trait]
impl Session for InMemorySession {
    fn is_transacted(&self) -> bool {
        self.core.transacted
    }

    fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.core.acknowledge_mode
    }

    async fn create_producer(&self, destination: &Destination) -> Result<Arc<dyn MessageProducer>> {
        self.core.ensure_open()?;
        Ok(Arc::new(InMemoryProducer {
            session: self.core.clone(),
            destination: destination.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<Arc<dyn MessageConsumer>> {
        self.core.ensure_open()?;
        if !destination.is_topic() && options.subscription != Subscription::None {
            return Err(JmsError::protocol(format!(
                "queue '{}' does not support subscriptions",
                destination.name()
            )));
        }
        let selector = options.selector.as_deref().map(Selector::parse).transpose()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let (id, address) = self.core.broker.attach(
            destination,
            &options,
            selector,
            self.core.started.clone(),
            sender,
        )?;

        let consumer = Arc::new(ConsumerCore {
            id,
            address,
            broker: self.core.broker.clone(),
            session: Arc::downgrade(&self.core),
            inbox: tokio::sync::Mutex::new(receiver),
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.core.lock().consumers.push(consumer.clone());
        Ok(Arc::new(InMemoryConsumer { core: consumer }))
    }

    async fn acknowledge(&self, message: &Message) -> Result<()> {
        if self.core.acknowledge_mode != AcknowledgeMode::Client {
            return Ok(());
        }
        let mut inner = self.core.lock();
        let before = inner.delivered.len();
        inner.delivered.retain(|(_, m)| m.id != message.id);
        if inner.delivered.len() < before {
            self.core.broker.acknowledged.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        if !self.core.transacted {
            return Err(JmsError::protocol("commit on a non-transacted session"));
        }
        let outgoing = {
            let mut inner = self.core.lock();
            if inner.closed {
                return Err(JmsError::Closed("session"));
            }
            inner.delivered.clear();
            std::mem::take(&mut inner.outgoing)
        };
        {
            let mut state = self.core.broker.lock();
            for (destination, message) in outgoing {
                state.route(&destination, message);
            }
        }
        self.core.broker.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if !self.core.transacted {
            return Err(JmsError::protocol("rollback on a non-transacted session"));
        }
        let delivered = {
            let mut inner = self.core.lock();
            if inner.closed {
                return Err(JmsError::Closed("session"));
            }
            inner.outgoing.clear();
            std::mem::take(&mut inner.delivered)
        };
        self.core.broker.redeliver(delivered);
        self.core.broker.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn recover(&self) -> Result<()> {
        if self.core.transacted {
            return Err(JmsError::protocol("recover on a transacted session"));
        }
        self.core.broker.redeliver(self.core.take_delivered());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.core.close();
        Ok(())
    }
}

/// Producer of an [`InMemorySession`].
pub struct InMemoryProducer {
    session: Arc<SessionCore>,
    destination: Destination,
    closed: AtomicBool,
}

#[async_trait]
impl MessageProducer for InMemoryProducer {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn send(&self, mut message: Message, options: SendOptions) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JmsError::Closed("producer"));
        }
        options.stamp(&mut message, &self.destination);
        self.session.send(&self.destination, message)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct ConsumerCore {
    id: u64,
    address: Address,
    broker: Arc<BrokerState>,
    session: Weak<SessionCore>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    listening: AtomicBool,
    closed: AtomicBool,
}

impl ConsumerCore {
    fn track(&self, message: &Message) {
        if let Some(session) = self.session.upgrade() {
            session.track(&self.address, message);
        }
    }

    fn offer(&self, listener: &RawListener, message: &Message) -> Result<()> {
        match self.session.upgrade() {
            Some(session) => session.offer(&self.address, message, || listener(message.clone())),
            None => listener(message.clone()),
        }
    }

    /// Stop receiving; anything still in the inbox goes back to the broker.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker.detach(self.id, &self.address);
        // A running delivery task drains the inbox itself.
        if let Ok(mut inbox) = self.inbox.try_lock() {
            while let Ok(message) = inbox.try_recv() {
                self.broker.return_undelivered(&self.address, message);
            }
        }
    }

    async fn deliver(self: Arc<Self>, listener: RawListener) {
        loop {
            let next = self.inbox.lock().await.recv().await;
            let Some(message) = next else {
                break;
            };
            if self.closed.load(Ordering::SeqCst) {
                self.broker.return_undelivered(&self.address, message);
                continue;
            }
            if message.is_expired(Utc::now()) {
                continue;
            }

            // A busy dispatcher gets the same message again before anything
            // behind it, so a single-worker listener sees inbox order.
            loop {
                let Err(e) = self.offer(&listener, &message) else {
                    break;
                };
                tokio::time::sleep(self.broker.redelivery_delay()).await;
                let busy = matches!(e, JmsError::DispatchRejected { .. });
                if busy && !self.closed.load(Ordering::SeqCst) {
                    trace!(consumer = self.id, message_id = %message.id, "Dispatcher busy, retrying");
                    continue;
                }
                debug!(consumer = self.id, message_id = %message.id, error = %e, "Listener refused message, redelivering");
                self.broker.return_undelivered(&self.address, message);
                break;
            }
        }
        debug!(consumer = self.id, "Delivery task finished");
    }
}

/// Consumer of an [`InMemorySession`].
pub struct InMemoryConsumer {
    core: Arc<ConsumerCore>,
}

#[async_trait]
impl MessageConsumer for InMemoryConsumer {
    fn set_message_listener(&self, listener: RawListener) -> Result<()> {
        if self.core.closed.load(Ordering::SeqCst) {
            return Err(JmsError::Closed("consumer"));
        }
        if self.core.listening.swap(true, Ordering::SeqCst) {
            return Err(JmsError::protocol("consumer already has a message listener"));
        }
        let handle = Handle::try_current().map_err(|_| {
            self.core.listening.store(false, Ordering::SeqCst);
            JmsError::Config("message listeners require a tokio runtime".into())
        })?;
        handle.spawn(self.core.clone().deliver(listener));
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Message>> {
        if self.core.closed.load(Ordering::SeqCst) {
            return Err(JmsError::Closed("consumer"));
        }
        if self.core.listening.load(Ordering::SeqCst) {
            return Err(JmsError::protocol("consumer has a message listener"));
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let mut inbox = self.core.inbox.lock().await;
        loop {
            let message = match tokio::time::timeout_at(deadline, inbox.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) | Err(_) => return Ok(None),
            };
            if message.is_expired(Utc::now()) {
                continue;
            }
            self.core.track(&message);
            return Ok(Some(message));
        }
    }

    async fn close(&self) -> Result<()> {
        self.core.close();
        if let Some(session) = self.core.session.upgrade() {
            session
                .lock()
                .consumers
                .retain(|consumer| !Arc::ptr_eq(consumer, &self.core));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageHeader;

    async fn session(broker: &InMemoryBroker, transacted: bool, mode: AcknowledgeMode) -> Arc<dyn Session> {
        let connection = broker.create_connection().await.unwrap();
        connection.start().await.unwrap();
        connection.create_session(transacted, mode).await.unwrap()
    }

    async fn send(session: &dyn Session, destination: &Destination, body: &str) {
        let producer = session.create_producer(destination).await.unwrap();
        producer
            .send(Message::new(body), SendOptions::default())
            .await
            .unwrap();
    }

    const WAIT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_queue_delivers_once() {
        let broker = InMemoryBroker::new();
        let queue = Destination::queue("q");
        let session = session(&broker, false, AcknowledgeMode::Auto).await;
        let first = session.create_consumer(&queue, ConsumerOptions::default()).await.unwrap();
        let second = session.create_consumer(&queue, ConsumerOptions::default()).await.unwrap();

        send(session.as_ref(), &queue, "one").await;
        let a = first.receive(Duration::from_millis(50)).await.unwrap();
        let b = second.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(a.iter().chain(b.iter()).count(), 1);
        assert_eq!(broker.pending(&queue), 0);
    }

    #[tokio::test]
    async fn test_unconsumed_queue_messages_wait() {
        let broker = InMemoryBroker::new();
        let queue = Destination::queue("later");
        let session = session(&broker, false, AcknowledgeMode::Auto).await;
        send(session.as_ref(), &queue, "x").await;
        assert_eq!(broker.pending(&queue), 1);

        let consumer = session.create_consumer(&queue, ConsumerOptions::default()).await.unwrap();
        let message = consumer.receive(WAIT).await.unwrap().unwrap();
        assert_eq!(message.body.as_text(), Some("x"));
        assert_eq!(message.delivery_count, 1);
        assert!(!message.redelivered);
    }

    #[tokio::test]
    async fn test_topic_fan_out_and_shared_subscription() {
        let broker = InMemoryBroker::new();
        let topic = Destination::topic("prices");
        let session = session(&broker, false, AcknowledgeMode::Auto).await;
        let plain_a = session.create_consumer(&topic, ConsumerOptions::default()).await.unwrap();
        let plain_b = session.create_consumer(&topic, ConsumerOptions::default()).await.unwrap();
        let shared = ConsumerOptions::default().with_subscription(Subscription::Shared("s".into()));
        let shared_a = session.create_consumer(&topic, shared.clone()).await.unwrap();
        let shared_b = session.create_consumer(&topic, shared).await.unwrap();

        send(session.as_ref(), &topic, "tick").await;
        assert!(plain_a.receive(WAIT).await.unwrap().is_some());
        assert!(plain_b.receive(WAIT).await.unwrap().is_some());
        let short = Duration::from_millis(20);
        let got_a = shared_a.receive(short).await.unwrap().is_some();
        let got_b = shared_b.receive(short).await.unwrap().is_some();
        assert!(got_a ^ got_b);
    }

    #[tokio::test]
    async fn test_durable_subscription_keeps_messages() {
        let broker = InMemoryBroker::new();
        let topic = Destination::topic("audit");
        let session = session(&broker, false, AcknowledgeMode::Auto).await;
        let durable = ConsumerOptions::default().with_subscription(Subscription::Durable("d".into()));

        let consumer = session.create_consumer(&topic, durable.clone()).await.unwrap();
        consumer.close().await.unwrap();
        send(session.as_ref(), &topic, "kept").await;
        assert_eq!(broker.pending(&topic), 1);

        let consumer = session.create_consumer(&topic, durable.clone()).await.unwrap();
        assert!(consumer.receive(WAIT).await.unwrap().is_some());
        assert!(session.create_consumer(&topic, durable).await.is_err());
    }

    #[tokio::test]
    async fn test_client_ack_and_recover() {
        let broker = InMemoryBroker::new();
        let queue = Destination::queue("c");
        let session = session(&broker, false, AcknowledgeMode::Client).await;
        let consumer = session.create_consumer(&queue, ConsumerOptions::default()).await.unwrap();

        send(session.as_ref(), &queue, "a").await;
        let message = consumer.receive(WAIT).await.unwrap().unwrap();
        session.recover().await.unwrap();
        let again = consumer.receive(WAIT).await.unwrap().unwrap();
        assert_eq!(again.id, message.id);
        assert!(again.redelivered);

        session.acknowledge(&again).await.unwrap();
        session.acknowledge(&again).await.unwrap();
        assert_eq!(broker.acknowledged(), 1);
        session.recover().await.unwrap();
        assert!(consumer.receive(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transacted_send_waits_for_commit() {
        let broker = InMemoryBroker::new();
        let queue = Destination::queue("tx");
        let session = session(&broker, true, AcknowledgeMode::Auto).await;
        assert_eq!(session.acknowledge_mode(), AcknowledgeMode::Transacted);

        send(session.as_ref(), &queue, "pending").await;
        assert_eq!(broker.pending(&queue), 0);
        session.rollback().await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(broker.pending(&queue), 0);

        send(session.as_ref(), &queue, "committed").await;
        session.commit().await.unwrap();
        assert_eq!(broker.pending(&queue), 1);
    }

    #[tokio::test]
    async fn test_rollback_redelivers_until_dead_letter() {
        let broker = InMemoryBroker::new().with_redelivery_limit(1);
        let queue = Destination::queue("dlq");
        broker.publish(&queue, Message::new("poison"));
        let session = session(&broker, true, AcknowledgeMode::Transacted).await;
        let consumer = session.create_consumer(&queue, ConsumerOptions::default()).await.unwrap();

        assert!(consumer.receive(WAIT).await.unwrap().is_some());
        session.rollback().await.unwrap();
        assert!(consumer.receive(WAIT).await.unwrap().is_some());
        session.rollback().await.unwrap();
        assert!(consumer.receive(Duration::from_millis(20)).await.unwrap().is_none());
        assert_eq!(broker.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_messages_are_dropped() {
        let broker = InMemoryBroker::new();
        let queue = Destination::queue("ttl");
        let session = session(&broker, false, AcknowledgeMode::Auto).await;
        let producer = session.create_producer(&queue).await.unwrap();
        producer
            .send(
                Message::new("short"),
                SendOptions::default().with_time_to_live(Duration::from_millis(1)),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let consumer = session.create_consumer(&queue, ConsumerOptions::default()).await.unwrap();
        assert!(consumer.receive(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_selector_routes_and_unmatched_waits() {
        let broker = InMemoryBroker::new();
        let queue = Destination::queue("sel");
        let session = session(&broker, false, AcknowledgeMode::Auto).await;
        let consumer = session
            .create_consumer(&queue, ConsumerOptions::default().with_selector("kind = 'a'"))
            .await
            .unwrap();

        let mut b = Message::new("b");
        MessageHeader::new("kind", "b").apply(&mut b).unwrap();
        broker.publish(&queue, b);
        broker.publish(&queue, Message::new("a").with_property("kind", "a"));

        let message = consumer.receive(WAIT).await.unwrap().unwrap();
        assert_eq!(message.body.as_text(), Some("a"));
        assert_eq!(broker.pending(&queue), 1);
        assert!(session
            .create_consumer(&queue, ConsumerOptions::default().with_selector("kind = "))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_refused_message_is_redelivered_to_listener() {
        let broker = InMemoryBroker::new().with_redelivery_delay(Duration::from_millis(1));
        let queue = Destination::queue("retry");
        let session = session(&broker, false, AcknowledgeMode::Auto).await;
        let consumer = session.create_consumer(&queue, ConsumerOptions::default()).await.unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let counter = attempts.clone();
        consumer
            .set_message_listener(Arc::new(move |message: Message| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(JmsError::protocol("busy"));
                }
                let _ = tx.send(message);
                Ok(())
            }))
            .unwrap();
        assert!(consumer.receive(WAIT).await.is_err());

        broker.publish(&queue, Message::new("again"));
        let delivered = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.body.as_text(), Some("again"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_busy_rejection_keeps_inbox_order() {
        let broker = InMemoryBroker::new().with_redelivery_delay(Duration::from_millis(1));
        let queue = Destination::queue("ordered");
        let session = session(&broker, false, AcknowledgeMode::Auto).await;
        let consumer = session.create_consumer(&queue, ConsumerOptions::default()).await.unwrap();
        for body in ["first", "second", "third"] {
            broker.publish(&queue, Message::new(body));
        }

        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let counter = attempts.clone();
        consumer
            .set_message_listener(Arc::new(move |message: Message| {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    return Err(JmsError::DispatchRejected {
                        listener: "ordered".into(),
                        active_workers: 1,
                    });
                }
                let _ = tx.send(message.body.as_text().unwrap_or_default().to_string());
                Ok(())
            }))
            .unwrap();

        let mut bodies = Vec::new();
        for _ in 0..3 {
            bodies.push(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap());
        }
        assert_eq!(bodies, vec!["first", "second", "third"]);
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert_eq!(broker.pending(&queue), 0);
    }

    #[tokio::test]
    async fn test_queue_rejects_subscription() {
        let broker = InMemoryBroker::new();
        let session = session(&broker, false, AcknowledgeMode::Auto).await;
        let options = ConsumerOptions::default().with_subscription(Subscription::Durable("d".into()));
        assert!(session
            .create_consumer(&Destination::queue("q"), options)
            .await
            .is_err());
        assert_eq!(broker.connections_created(), 1);
    }
}
