//! # Wire Message
//!
//! Every frame on a transport is one [`Message`], serialized as JSON. The
//! payload is always a list of codec envelopes so arguments keep their types.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use duopack::Envelope;
use duopack::ErrorValue;
use duopack::Value;

use crate::error::Error;
use crate::error::Result;

/// Identifies one guest context's association with the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the sender expects to happen with a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Fire-and-forget, delivered to listeners.
    Send,
    /// Blocking round trip, answered on the reply channel.
    Sync,
    /// Correlated request, answered on the reply channel.
    Invoke,
    /// Successful reply; payload holds the single result.
    Resolve,
    /// Failed reply; payload holds the encoded error.
    Reject,
}

impl MessageKind {
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Resolve | Self::Reject)
    }

    pub fn expects_reply(&self) -> bool {
        matches!(self, Self::Sync | Self::Invoke)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub channel: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    #[serde(default)]
    pub payload: Vec<Envelope>,
}

/// Name of the channel a reply to `channel`/`correlation_id` travels on.
pub fn reply_channel(channel: &str, correlation_id: u64) -> String {
    format!("{}_RESPONSE_{}", channel, correlation_id)
}

/// Encodes an error for a `reject` reply. A cause that cannot be encoded is
/// dropped rather than losing the whole error.
pub fn error_envelope(error: &ErrorValue) -> Envelope {
    match duopack::encode(&Value::Error(error.clone())) {
        Ok(envelope) => envelope,
        Err(_) => Envelope::Error {
            name: error.name().to_string(),
            message: error.message.clone(),
            stack: error.stack.clone(),
            origin: error.origin,
            cause: None,
        },
    }
}

impl Message {
    pub fn send(channel: impl Into<String>, payload: Vec<Envelope>) -> Self {
        Self {
            channel: channel.into(),
            kind: MessageKind::Send,
            correlation_id: None,
            connection_id: None,
            payload,
        }
    }

    pub fn request(
        kind: MessageKind,
        channel: impl Into<String>,
        correlation_id: u64,
        payload: Vec<Envelope>,
    ) -> Self {
        Self {
            channel: channel.into(),
            kind,
            correlation_id: Some(correlation_id),
            connection_id: None,
            payload,
        }
    }

    pub fn resolve(request_channel: &str, correlation_id: u64, result: Envelope) -> Self {
        Self {
            channel: reply_channel(request_channel, correlation_id),
            kind: MessageKind::Resolve,
            correlation_id: Some(correlation_id),
            connection_id: None,
            payload: vec![result],
        }
    }

    pub fn reject(request_channel: &str, correlation_id: u64, error: Envelope) -> Self {
        Self {
            channel: reply_channel(request_channel, correlation_id),
            kind: MessageKind::Reject,
            correlation_id: Some(correlation_id),
            connection_id: None,
            payload: vec![error],
        }
    }

    /// Stamps the sending connection.
    pub fn from_connection(mut self, connection: ConnectionId) -> Self {
        self.connection_id = Some(connection);
        self
    }

    /// Reads a `resolve`/`reject` reply back into a result.
    pub fn outcome(&self) -> Result<Value> {
        let value = match self.payload.first() {
            Some(envelope) => duopack::decode(envelope)?,
            None => Value::Null,
        };
        match self.kind {
            MessageKind::Reject => Err(Error::Remote(match value {
                Value::Error(error) => error,
                Value::Str(message) => ErrorValue::generic(message),
                other => ErrorValue::generic(format!("rejected with a {} value", other.kind_name())),
            })),
            _ => Ok(value),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Protocol(format!("could not serialize message: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Protocol(format!("malformed message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_channel_naming() {
        assert_eq!(reply_channel("ping", 12), "ping_RESPONSE_12");
        let reply = Message::resolve("ping", 12, Envelope::raw(serde_json::json!("pong")));
        assert_eq!(reply.channel, "ping_RESPONSE_12");
        assert_eq!(reply.correlation_id, Some(12));
    }

    #[test]
    fn test_wire_shape_is_stable() {
        let msg = Message::request(MessageKind::Invoke, "open", 3, vec![Envelope::raw(serde_json::json!(1))])
            .from_connection(ConnectionId(9));
        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();

        assert_eq!(json["channel"], "open");
        assert_eq!(json["kind"], "invoke");
        assert_eq!(json["correlation_id"], 3);
        assert_eq!(json["connection_id"], 9);
        assert_eq!(json["payload"][0]["kind"], "raw");
    }

    #[test]
    fn test_garbage_is_a_protocol_error() {
        assert!(matches!(Message::from_bytes(b"not json"), Err(Error::Protocol(_))));
    }
}
