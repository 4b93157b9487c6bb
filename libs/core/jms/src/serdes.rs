//! Conversion between application values and protocol messages.

use crate::error::{JmsError, Result};
use crate::message::{BodyKind, Message, MessageBody, SERDES_TYPE_PROPERTY};
use crate::protocol::Session;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Builds an outgoing message from a body.
pub trait Serializer: Send + Sync {
    fn serialize(&self, session: &dyn Session, body: MessageBody) -> Result<Message>;
}

/// Extracts a body of the requested kind from a received message.
pub trait Deserializer: Send + Sync {
    fn deserialize(&self, message: &Message, target: BodyKind) -> Result<MessageBody>;
}

/// Maps text, bytes, map and object bodies onto the matching message kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSerializer;

impl DefaultSerializer {
    /// Turn a serializable value into an object body.
    pub fn to_body<T: Serialize>(value: &T) -> Result<MessageBody> {
        Ok(MessageBody::Object(serde_json::to_value(value)?))
    }

    /// Serialize a typed value into a message of the requested kind.
    ///
    /// Text and bytes bodies carry the JSON encoding and are tagged with the
    /// Rust type name under [`SERDES_TYPE_PROPERTY`]. A map body requires the
    /// value to serialize as a JSON object.
    pub fn serialize_as<T: Serialize>(
        &self,
        session: &dyn Session,
        value: &T,
        kind: BodyKind,
    ) -> Result<Message> {
        let body = match kind {
            BodyKind::Object => return self.serialize(session, Self::to_body(value)?),
            BodyKind::Text => MessageBody::Text(serde_json::to_string(value)?),
            BodyKind::Bytes => MessageBody::Bytes(serde_json::to_vec(value)?),
            BodyKind::Map => match serde_json::to_value(value)? {
                Value::Object(fields) => MessageBody::Map(fields.into_iter().collect()),
                other => {
                    return Err(JmsError::serialization(format!(
                        "a map body needs a JSON object, got {}",
                        json_kind(&other)
                    )))
                }
            },
        };
        let mut message = self.serialize(session, body)?;
        if matches!(kind, BodyKind::Text | BodyKind::Bytes) {
            message
                .properties
                .insert(SERDES_TYPE_PROPERTY.to_string(), std::any::type_name::<T>().into());
        }
        Ok(message)
    }

    /// Decode a typed value from any body kind.
    pub fn from_message<T: DeserializeOwned>(message: &Message) -> Result<T> {
        let value = match &message.body {
            MessageBody::Text(text) => return Ok(serde_json::from_str(text)?),
            MessageBody::Bytes(bytes) => return Ok(serde_json::from_slice(bytes)?),
            MessageBody::Map(fields) => Value::Object(fields.clone().into_iter().collect()),
            MessageBody::Object(value) => value.clone(),
        };
        Ok(serde_json::from_value(value)?)
    }
}

impl Serializer for DefaultSerializer {
    fn serialize(&self, session: &dyn Session, body: MessageBody) -> Result<Message> {
        session.create_message(body)
    }
}

impl Deserializer for DefaultSerializer {
    fn deserialize(&self, message: &Message, target: BodyKind) -> Result<MessageBody> {
        match (&message.body, target) {
            (body, target) if body.kind() == target => Ok(body.clone()),
            (MessageBody::Text(text), BodyKind::Object) => {
                serde_json::from_str(text).map(MessageBody::Object).map_err(|e| {
                    JmsError::serialization(format!(
                        "text body of message {} is not JSON: {}",
                        message.id, e
                    ))
                })
            }
            (MessageBody::Object(Value::String(text)), BodyKind::Text) => {
                Ok(MessageBody::Text(text.clone()))
            }
            (body, target) => Err(JmsError::serialization(format!(
                "cannot read a {} body of message {} as {}",
                body.kind(),
                message.id,
                target
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;
    use crate::protocol::{AcknowledgeMode, ConnectionFactory};
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        sku: String,
    }

    async fn session() -> Arc<dyn Session> {
        let broker = InMemoryBroker::new();
        let connection = broker.create_connection().await.unwrap();
        connection
            .create_session(false, AcknowledgeMode::Auto)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_every_body_kind_survives_serialize_then_deserialize() {
        let session = session().await;
        let serdes = DefaultSerializer;
        let mut map = BTreeMap::new();
        map.insert("count".to_string(), json!(3));

        for body in [
            MessageBody::Text("hello".into()),
            MessageBody::Bytes(vec![0, 1, 255]),
            MessageBody::Map(map),
            MessageBody::Object(json!({"nested": [1, 2]})),
        ] {
            let message = serdes.serialize(session.as_ref(), body.clone()).unwrap();
            assert_eq!(serdes.deserialize(&message, body.kind()).unwrap(), body);
        }
    }

    #[tokio::test]
    async fn test_text_json_read_as_object_and_back() {
        let session = session().await;
        let serdes = DefaultSerializer;

        let message = serdes
            .serialize(session.as_ref(), MessageBody::from(r#"{"a":1}"#))
            .unwrap();
        assert_eq!(
            serdes.deserialize(&message, BodyKind::Object).unwrap(),
            MessageBody::Object(json!({"a": 1}))
        );

        let message = serdes
            .serialize(session.as_ref(), MessageBody::Object(json!("plain")))
            .unwrap();
        assert_eq!(
            serdes.deserialize(&message, BodyKind::Text).unwrap(),
            MessageBody::Text("plain".into())
        );
    }

    #[tokio::test]
    async fn test_mismatched_kind_is_a_serialization_error() {
        let session = session().await;
        let serdes = DefaultSerializer;
        let message = serdes
            .serialize(session.as_ref(), MessageBody::Bytes(vec![1]))
            .unwrap();

        let err = serdes.deserialize(&message, BodyKind::Map).unwrap_err();
        assert!(matches!(err, JmsError::Serialization(_)));

        let message = serdes
            .serialize(session.as_ref(), MessageBody::from("not json"))
            .unwrap();
        assert!(serdes.deserialize(&message, BodyKind::Object).is_err());
    }

    #[tokio::test]
    async fn test_typed_values() {
        let session = session().await;
        let serdes = DefaultSerializer;
        let order = Order {
            id: 7,
            sku: "A-1".into(),
        };

        let text = serdes
            .serialize_as(session.as_ref(), &order, BodyKind::Text)
            .unwrap();
        assert!(text.property(SERDES_TYPE_PROPERTY).is_some());
        assert_eq!(DefaultSerializer::from_message::<Order>(&text).unwrap(), order);

        let map = serdes
            .serialize_as(session.as_ref(), &order, BodyKind::Map)
            .unwrap();
        assert_eq!(map.body.kind(), BodyKind::Map);
        assert_eq!(DefaultSerializer::from_message::<Order>(&map).unwrap(), order);

        assert!(serdes
            .serialize_as(session.as_ref(), &42, BodyKind::Map)
            .is_err());
    }
}
