//! Message model: destinations, bodies, headers and send options.

use crate::error::{JmsError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Header carrying the correlation id.
pub const JMS_CORRELATION_ID: &str = "JMSCorrelationID";
/// Header carrying the application message type.
pub const JMS_TYPE: &str = "JMSType";
/// Header carrying the reply-to destination.
pub const JMS_REPLY_TO: &str = "JMSReplyTo";
/// Property naming the Rust type an object body was serialized from.
pub const SERDES_TYPE_PROPERTY: &str = "serdes_type";

/// Lowest and highest message priority.
pub const MIN_PRIORITY: u8 = 0;
pub const MAX_PRIORITY: u8 = 9;
/// Priority used when the sender does not set one.
pub const DEFAULT_PRIORITY: u8 = 4;

/// Point-to-point or publish/subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DestinationType {
    Queue,
    Topic,
}

/// A named queue or topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Destination {
    Queue(String),
    Topic(String),
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue(name.into())
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Destination::Topic(name.into())
    }

    /// Build a destination of the given type.
    pub fn of(kind: DestinationType, name: impl Into<String>) -> Self {
        match kind {
            DestinationType::Queue => Destination::Queue(name.into()),
            DestinationType::Topic => Destination::Topic(name.into()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) | Destination::Topic(name) => name,
        }
    }

    pub fn kind(&self) -> DestinationType {
        match self {
            Destination::Queue(_) => DestinationType::Queue,
            Destination::Topic(_) => DestinationType::Topic,
        }
    }

    pub fn is_topic(&self) -> bool {
        matches!(self, Destination::Topic(_))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind(), self.name())
    }
}

/// Parses `queue://name`, `topic://name`, or a bare name (a queue).
impl FromStr for Destination {
    type Err = JmsError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, name) = match s.split_once("://") {
            Some((scheme, name)) => {
                let kind = scheme.parse::<DestinationType>().map_err(|_| {
                    JmsError::serialization(format!("unknown destination scheme '{}'", scheme))
                })?;
                (kind, name)
            }
            None => (DestinationType::Queue, s),
        };
        if name.is_empty() {
            return Err(JmsError::serialization("destination name is empty"));
        }
        Ok(Destination::of(kind, name))
    }
}

/// Kind tag of a [`MessageBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BodyKind {
    Text,
    Bytes,
    Map,
    Object,
}

/// Message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    Text(String),
    Bytes(Vec<u8>),
    Map(BTreeMap<String, Value>),
    Object(Value),
}

impl MessageBody {
    pub fn kind(&self) -> BodyKind {
        match self {
            MessageBody::Text(_) => BodyKind::Text,
            MessageBody::Bytes(_) => BodyKind::Bytes,
            MessageBody::Map(_) => BodyKind::Map,
            MessageBody::Object(_) => BodyKind::Object,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<&str> for MessageBody {
    fn from(value: &str) -> Self {
        MessageBody::Text(value.to_string())
    }
}

impl From<String> for MessageBody {
    fn from(value: String) -> Self {
        MessageBody::Text(value)
    }
}

impl From<Vec<u8>> for MessageBody {
    fn from(value: Vec<u8>) -> Self {
        MessageBody::Bytes(value)
    }
}

impl From<BTreeMap<String, Value>> for MessageBody {
    fn from(value: BTreeMap<String, Value>) -> Self {
        MessageBody::Map(value)
    }
}

impl From<Value> for MessageBody {
    fn from(value: Value) -> Self {
        MessageBody::Object(value)
    }
}

/// Whether the broker must persist the message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DeliveryMode {
    #[default]
    Persistent,
    NonPersistent,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub destination: Option<Destination>,
    pub body: MessageBody,
    pub properties: BTreeMap<String, Value>,
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    pub reply_to: Option<Destination>,
    pub priority: u8,
    pub delivery_mode: DeliveryMode,
    pub timestamp: DateTime<Utc>,
    pub expiration: Option<DateTime<Utc>>,
    pub redelivered: bool,
    pub delivery_count: u32,
}

impl Message {
    pub fn new(body: impl Into<MessageBody>) -> Self {
        Self {
            id: format!("ID:{}", Uuid::new_v4()),
            destination: None,
            body: body.into(),
            properties: BTreeMap::new(),
            correlation_id: None,
            message_type: None,
            reply_to: None,
            priority: DEFAULT_PRIORITY,
            delivery_mode: DeliveryMode::default(),
            timestamp: Utc::now(),
            expiration: None,
            redelivered: false,
            delivery_count: 0,
        }
    }

    /// Set a property, builder style.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|at| at <= now)
    }

    /// Apply headers in order.
    pub fn apply_headers(&mut self, headers: &[MessageHeader]) -> Result<()> {
        headers.iter().try_for_each(|header| header.apply(self))
    }
}

/// A header or property set on an outgoing message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    pub key: String,
    pub value: Value,
}

impl MessageHeader {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn correlation_id(id: impl Into<String>) -> Self {
        Self::new(JMS_CORRELATION_ID, id.into())
    }

    pub fn message_type(kind: impl Into<String>) -> Self {
        Self::new(JMS_TYPE, kind.into())
    }

    pub fn reply_to(destination: &Destination) -> Self {
        Self::new(JMS_REPLY_TO, destination.to_string())
    }

    /// Write the header onto the message.
    ///
    /// Known JMS headers update the matching field and require a string value;
    /// anything else is stored as a property.
    pub fn apply(&self, message: &mut Message) -> Result<()> {
        match self.key.as_str() {
            JMS_CORRELATION_ID => message.correlation_id = Some(self.string_value()?),
            JMS_TYPE => message.message_type = Some(self.string_value()?),
            JMS_REPLY_TO => message.reply_to = Some(self.string_value()?.parse()?),
            _ => {
                message.properties.insert(self.key.clone(), self.value.clone());
            }
        }
        Ok(())
    }

    fn string_value(&self) -> Result<String> {
        match &self.value {
            Value::String(s) => Ok(s.clone()),
            other => Err(JmsError::serialization(format!(
                "header '{}' expects a string, got {}",
                self.key, other
            ))),
        }
    }
}

/// Per-send delivery settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub delivery_mode: DeliveryMode,
    pub priority: u8,
    pub time_to_live: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Persistent,
            priority: DEFAULT_PRIORITY,
            time_to_live: None,
        }
    }
}

impl SendOptions {
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Set the priority, clamped to 0..=9.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Stamp delivery settings onto an outgoing message.
    pub fn stamp(&self, message: &mut Message, destination: &Destination) {
        let now = Utc::now();
        message.destination = Some(destination.clone());
        message.delivery_mode = self.delivery_mode;
        message.priority = self.priority;
        message.timestamp = now;
        message.expiration = self
            .time_to_live
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now + ttl);
    }
}
