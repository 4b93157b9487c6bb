//! Broker client capabilities consumed by the pools and listeners.
//!
//! A broker-specific client implements these traits once; everything else in
//! the crate works against `Arc<dyn ...>` handles. The pooled wrappers in
//! [`crate::pool`] implement the same traits, so calling code cannot tell a
//! pooled connection from a direct one.

use crate::error::{JmsError, Result};
use crate::message::{Destination, Message, MessageBody, SendOptions};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};

/// When a delivered message counts as consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum AcknowledgeMode {
    /// Consumed once the delivery callback returns.
    #[default]
    Auto,
    /// Consumed when the application acknowledges it.
    Client,
    /// Lazy acknowledgement, duplicates tolerated.
    DupsOk,
    /// Consumed when the session commits.
    Transacted,
}

/// Durable/shared subscription flavour of a topic consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Subscription {
    #[default]
    None,
    Shared(String),
    Durable(String),
    SharedDurable(String),
}

impl Subscription {
    pub fn name(&self) -> Option<&str> {
        match self {
            Subscription::None => None,
            Subscription::Shared(name)
            | Subscription::Durable(name)
            | Subscription::SharedDurable(name) => Some(name),
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, Subscription::Durable(_) | Subscription::SharedDurable(_))
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Subscription::Shared(_) | Subscription::SharedDurable(_))
    }
}

/// How a consumer is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub selector: Option<String>,
    pub subscription: Subscription,
}

impl ConsumerOptions {
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = subscription;
        self
    }
}

/// Callback the broker client invokes on its delivery task.
///
/// Returning `Err` means the message was not taken and must be redelivered.
pub type RawListener = Arc<dyn Fn(Message) -> Result<()> + Send + Sync>;

/// Opens connections to the broker.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(&self) -> Result<Arc<dyn Connection>>;

    async fn create_connection_with_credentials(
        &self,
        _username: &str,
        _password: &str,
    ) -> Result<Arc<dyn Connection>> {
        Err(JmsError::UnsupportedOperation(
            "this connection factory does not accept per-connection credentials".into(),
        ))
    }
}

/// A logical link to the broker.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Begin delivering messages to consumers of this connection.
    async fn start(&self) -> Result<()>;

    async fn create_session(
        &self,
        transacted: bool,
        acknowledge_mode: AcknowledgeMode,
    ) -> Result<Arc<dyn Session>>;

    async fn close(&self) -> Result<()>;
}

/// A single-threaded unit of work.
#[async_trait]
pub trait Session: Send + Sync {
    fn is_transacted(&self) -> bool;

    fn acknowledge_mode(&self) -> AcknowledgeMode;

    fn create_message(&self, body: MessageBody) -> Result<Message> {
        Ok(Message::new(body))
    }

    async fn create_producer(&self, destination: &Destination) -> Result<Arc<dyn MessageProducer>>;

    async fn create_consumer(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<Arc<dyn MessageConsumer>>;

    /// Acknowledge one delivered message (client acknowledgement).
    async fn acknowledge(&self, message: &Message) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    /// Redeliver every message this session consumed but did not acknowledge.
    ///
    /// Pools call this when a client-acknowledged session is returned.
    async fn recover(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Sends to one destination fixed at creation.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    fn destination(&self) -> &Destination;

    async fn send(&self, message: Message, options: SendOptions) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Receives from one destination.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Install the delivery callback. Only one listener per consumer.
    fn set_message_listener(&self, listener: RawListener) -> Result<()>;

    /// Synchronous receive; `None` when nothing arrived within `timeout`.
    async fn receive(&self, timeout: Duration) -> Result<Option<Message>>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_mode_strings() {
        assert_eq!(AcknowledgeMode::DupsOk.to_string(), "DUPS_OK");
        assert_eq!(
            "client".parse::<AcknowledgeMode>().unwrap(),
            AcknowledgeMode::Client
        );
        assert!("sometimes".parse::<AcknowledgeMode>().is_err());
    }

    #[test]
    fn test_subscription_flags() {
        let sub = Subscription::SharedDurable("audit".into());
        assert!(sub.is_shared());
        assert!(sub.is_durable());
        assert_eq!(sub.name(), Some("audit"));
        assert_eq!(Subscription::None.name(), None);
    }
}
