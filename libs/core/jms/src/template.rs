//! One-shot send and receive through a [`ConnectionPool`].
//!
//! Each call checks out a connection and a session, does its work and
//! returns both to their pools.

use crate::error::{JmsError, Result};
use crate::message::{BodyKind, Destination, DestinationType, Message, MessageBody, MessageHeader, SendOptions};
use crate::pool::ConnectionPool;
use crate::protocol::{AcknowledgeMode, Connection, ConnectionFactory, ConsumerOptions, Session};
use crate::serdes::{DefaultSerializer, Deserializer, Serializer};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A checked-out connection and session, returned together.
struct Checkout {
    connection: Arc<dyn Connection>,
    session: Arc<dyn Session>,
}

impl Checkout {
    async fn open(pool: &ConnectionPool, transacted: bool, mode: AcknowledgeMode) -> Result<Self> {
        let connection = pool.create_connection().await?;
        match connection.create_session(transacted, mode).await {
            Ok(session) => Ok(Self { connection, session }),
            Err(e) => {
                if let Err(close) = connection.close().await {
                    warn!(error = %close, "Failed to return connection after session failure");
                }
                Err(e)
            }
        }
    }

    async fn close(self) {
        if let Err(e) = self.session.close().await {
            warn!(error = %e, "Failed to return session");
        }
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "Failed to return connection");
        }
    }
}

/// Sends messages to queues or topics, depending on how it was built.
pub struct JmsProducer {
    kind: DestinationType,
    pool: Arc<ConnectionPool>,
    serializer: Arc<dyn Serializer>,
    transacted: bool,
    acknowledge_mode: AcknowledgeMode,
    options: SendOptions,
}

impl JmsProducer {
    pub fn new(kind: DestinationType, pool: Arc<ConnectionPool>) -> Self {
        Self {
            kind,
            pool,
            serializer: Arc::new(DefaultSerializer),
            transacted: false,
            acknowledge_mode: AcknowledgeMode::Auto,
            options: SendOptions::default(),
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Send on transacted sessions: commit after each send, roll back on failure.
    pub fn transacted(mut self, transacted: bool) -> Self {
        self.transacted = transacted;
        self
    }

    pub fn with_acknowledge_mode(mut self, mode: AcknowledgeMode) -> Self {
        self.acknowledge_mode = mode;
        self
    }

    pub fn with_send_options(mut self, options: SendOptions) -> Self {
        self.options = options;
        self
    }

    pub fn kind(&self) -> DestinationType {
        self.kind
    }

    /// Build a message from `body` and send it to the named destination.
    pub async fn send(
        &self,
        destination: &str,
        body: impl Into<MessageBody>,
        headers: &[MessageHeader],
    ) -> Result<()> {
        let destination = Destination::of(self.kind, destination);
        let checkout = Checkout::open(&self.pool, self.transacted, self.acknowledge_mode).await?;
        let result = match self.serializer.serialize(checkout.session.as_ref(), body.into()) {
            Ok(message) => self.send_on(checkout.session.as_ref(), &destination, message, headers).await,
            Err(e) => Err(e),
        };
        checkout.close().await;
        result
    }

    /// Send a prepared message.
    pub async fn send_message(
        &self,
        destination: &Destination,
        message: Message,
        headers: &[MessageHeader],
    ) -> Result<()> {
        let checkout = Checkout::open(&self.pool, self.transacted, self.acknowledge_mode).await?;
        let result = self
            .send_on(checkout.session.as_ref(), destination, message, headers)
            .await;
        checkout.close().await;
        result
    }

    async fn send_on(
        &self,
        session: &dyn Session,
        destination: &Destination,
        mut message: Message,
        headers: &[MessageHeader],
    ) -> Result<()> {
        let result = async {
            message.apply_headers(headers)?;
            let producer = session.create_producer(destination).await?;
            let sent = producer.send(message, self.options).await;
            if let Err(e) = producer.close().await {
                warn!(destination = %destination, error = %e, "Failed to return producer");
            }
            sent?;
            if self.transacted {
                session.commit().await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                debug!(destination = %destination, "Message sent");
                Ok(())
            }
            Err(e) if self.transacted => {
                if let Err(rollback) = session.rollback().await {
                    return Err(JmsError::RollbackFailed(format!(
                        "{} (after send failure: {})",
                        rollback, e
                    )));
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

/// Receives single messages from queues or topics.
pub struct JmsConsumer {
    kind: DestinationType,
    pool: Arc<ConnectionPool>,
    deserializer: Arc<dyn Deserializer>,
    transacted: bool,
    acknowledge_mode: AcknowledgeMode,
}

impl JmsConsumer {
    pub fn new(kind: DestinationType, pool: Arc<ConnectionPool>) -> Self {
        Self {
            kind,
            pool,
            deserializer: Arc::new(DefaultSerializer),
            transacted: false,
            acknowledge_mode: AcknowledgeMode::Auto,
        }
    }

    pub fn with_deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.deserializer = deserializer;
        self
    }

    pub fn transacted(mut self, transacted: bool) -> Self {
        self.transacted = transacted;
        self
    }

    pub fn with_acknowledge_mode(mut self, mode: AcknowledgeMode) -> Self {
        self.acknowledge_mode = mode;
        self
    }

    /// Wait up to `timeout` for one message.
    ///
    /// The message is committed or acknowledged before it is returned.
    pub async fn receive(&self, destination: &str, timeout: Duration) -> Result<Option<Message>> {
        let destination = Destination::of(self.kind, destination);
        let checkout = Checkout::open(&self.pool, self.transacted, self.acknowledge_mode).await?;
        let result = Self::receive_on(checkout.session.as_ref(), &destination, timeout).await;
        checkout.close().await;
        result
    }

    /// Receive and convert the body to `target`.
    pub async fn receive_body(
        &self,
        destination: &str,
        timeout: Duration,
        target: BodyKind,
    ) -> Result<Option<MessageBody>> {
        self.receive(destination, timeout)
            .await?
            .map(|message| self.deserializer.deserialize(&message, target))
            .transpose()
    }

    /// Receive and decode the body as `T`.
    pub async fn receive_as<T: DeserializeOwned>(&self, destination: &str, timeout: Duration) -> Result<Option<T>> {
        self.receive(destination, timeout)
            .await?
            .map(|message| DefaultSerializer::from_message(&message))
            .transpose()
    }

    async fn receive_on(
        session: &dyn Session,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<Option<Message>> {
        let consumer = session
            .create_consumer(destination, ConsumerOptions::default())
            .await?;
        let received = consumer.receive(timeout).await;
        if let Err(e) = consumer.close().await {
            warn!(destination = %destination, error = %e, "Failed to close consumer");
        }
        let message = received?;

        if session.is_transacted() {
            session.commit().await?;
        }
        if let Some(message) = &message {
            if session.acknowledge_mode() == AcknowledgeMode::Client {
                session.acknowledge(message).await?;
            }
        }
        Ok(message)
    }
}
