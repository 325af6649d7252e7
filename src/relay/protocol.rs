//! Relay wire types shared by the server and [`crate::network::RelayClient`].
//!
//! HTTP requests are JSON objects tagged by `action`; WebSocket frames are
//! JSON objects tagged by `type`.

use crate::network::peers::PeerRecord;
use crate::utils::RelayError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name stored for peers that do not announce one
pub const UNKNOWN_NAME: &str = "Unknown";

/// Unix time in fractional seconds
pub fn unix_seconds(at: DateTime<Utc>) -> f64 {
    // Millisecond precision is plenty for TTL bookkeeping.
    at.timestamp_millis() as f64 / 1000.0
}

fn unknown_name() -> String {
    UNKNOWN_NAME.to_string()
}

/// One registered peer as stored and listed by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEntry {
    /// `name@public_ip:tcp_port`
    pub peer_id: String,
    /// Display name
    #[serde(default = "unknown_name")]
    pub name: String,
    /// Address the peer reported
    #[serde(default)]
    pub public_ip: Option<String>,
    /// Inbox port the peer reported
    #[serde(default)]
    pub tcp_port: Option<u16>,
    /// Relay clock at the last update, unix seconds
    #[serde(default)]
    pub last_seen: f64,
}

impl RelayEntry {
    /// Convert to a local peer record stamped with `received_at`.
    ///
    /// Entries without a usable address or port are skipped.
    pub fn to_peer_record(&self, received_at: DateTime<Utc>) -> Option<PeerRecord> {
        let address = self.public_ip.as_deref().filter(|ip| !ip.is_empty())?;
        let port = self.tcp_port.filter(|port| *port > 0)?;
        Some(PeerRecord::new(self.name.clone(), address, port, received_at))
    }
}

/// One message held in a recipient's mailbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxMessage {
    /// Relay-wide monotonic id
    pub id: u64,
    /// Sender user id
    pub sender: String,
    /// Message body
    pub text: String,
    /// Relay clock when stored, unix seconds
    pub timestamp: f64,
}

/// A parsed `POST /api` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RelayRequest {
    /// Register or refresh presence
    Update {
        peer_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        public_ip: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tcp_port: Option<u16>,
    },
    /// List active peers
    List {
        #[serde(skip_serializing_if = "Option::is_none")]
        exclude: Option<String>,
    },
    /// Drop a peer's presence
    Remove {
        #[serde(skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },
    /// Ensure a mailbox exists
    RegisterMessaging { user_id: String },
    /// Store and push a message
    SendMessage {
        sender: String,
        recipient: String,
        text: String,
    },
    /// Fetch mailbox entries newer than `since_id`
    GetMessages { user_id: String, since_id: u64 },
}

impl RelayRequest {
    /// Parse a request body.
    ///
    /// # Errors
    ///
    /// [`RelayError::NoJson`] for anything but a non-empty object,
    /// [`RelayError::UnknownAction`] for a missing or unrecognised action and
    /// [`RelayError::MissingField`] for a missing or empty required field.
    pub fn from_value(value: &Value) -> Result<Self, RelayError> {
        let body = match value {
            Value::Object(body) if !body.is_empty() => body,
            _ => return Err(RelayError::NoJson),
        };

        match body.get("action").and_then(Value::as_str) {
            Some("update") => Ok(Self::Update {
                peer_id: required_str(body, "peer_id")?,
                name: optional_str(body, "name"),
                public_ip: optional_str(body, "public_ip"),
                tcp_port: body
                    .get("tcp_port")
                    .and_then(Value::as_u64)
                    .and_then(|port| u16::try_from(port).ok()),
            }),
            Some("list") => Ok(Self::List {
                exclude: optional_str(body, "exclude"),
            }),
            Some("remove") => Ok(Self::Remove {
                peer_id: optional_str(body, "peer_id").filter(|id| !id.is_empty()),
            }),
            Some("register_messaging") => Ok(Self::RegisterMessaging {
                user_id: required_str(body, "user_id")?,
            }),
            Some("send_message") => Ok(Self::SendMessage {
                sender: required_str(body, "sender")?,
                recipient: required_str(body, "recipient")?,
                text: required_str(body, "text")?,
            }),
            Some("get_messages") => Ok(Self::GetMessages {
                user_id: required_str(body, "user_id")?,
                since_id: body.get("since_id").map_or(0, since_id_of),
            }),
            _ => Err(RelayError::UnknownAction),
        }
    }

    /// Action name as it appears on the wire
    pub fn action(&self) -> &'static str {
        match self {
            Self::Update { .. } => "update",
            Self::List { .. } => "list",
            Self::Remove { .. } => "remove",
            Self::RegisterMessaging { .. } => "register_messaging",
            Self::SendMessage { .. } => "send_message",
            Self::GetMessages { .. } => "get_messages",
        }
    }
}

fn required_str(body: &Map<String, Value>, field: &str) -> Result<String, RelayError> {
    match body.get(field).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(RelayError::MissingField(field.to_string())),
    }
}

fn optional_str(body: &Map<String, Value>, field: &str) -> Option<String> {
    body.get(field).and_then(Value::as_str).map(str::to_string)
}

fn since_id_of(value: &Value) -> u64 {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|v| *v > 0.0).map(|v| v as u64))
        .unwrap_or(0)
}

/// `{status}` or `{status, message}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// `updated`, `removed` or `ok`
    pub status: String,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Response to `list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerList {
    /// Active peers other than the excluded one
    #[serde(default)]
    pub peers: Vec<RelayEntry>,
}

/// Response to `send_message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAccepted {
    /// Always `ok`
    pub status: String,
    /// Id assigned to the stored message
    pub message_id: u64,
}

/// Response to `get_messages`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBatch {
    /// Always `ok`
    pub status: String,
    /// Messages in ascending id order
    pub messages: Vec<MailboxMessage>,
    /// `messages.len()`
    pub count: usize,
}

/// Response to `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Always `ok`
    pub status: String,
    /// Registered peers
    pub peers: usize,
    /// Relay clock, unix seconds
    pub timestamp: f64,
}

/// Body of every 4xx/5xx response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error text, e.g. `Missing peer_id`
    pub error: String,
}

/// Frames a push-channel client may send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Join the room for `user_id`
    Register {
        #[serde(default)]
        user_id: Option<String>,
    },
    /// Send a message as the registered user
    SendMessage {
        #[serde(default)]
        recipient: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    /// Keepalive
    Ping,
}

/// Frames the relay pushes to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent once after the socket opens
    Status { message: String },
    /// Acknowledges `register`
    Registered { user_id: String },
    /// A message for the registered user
    Message {
        id: u64,
        sender: String,
        text: String,
        timestamp: f64,
    },
    /// Acknowledges a `send_message` frame
    Delivered { recipient: String },
    /// A rejected frame
    Error { message: String },
    /// Reply to `ping`
    Pong,
}

impl From<&MailboxMessage> for ServerFrame {
    fn from(message: &MailboxMessage) -> Self {
        Self::Message {
            id: message.id,
            sender: message.sender.clone(),
            text: message.text.clone(),
            timestamp: message.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_object_bodies_are_no_json() {
        for body in [json!(null), json!([]), json!("update"), json!({})] {
            assert_eq!(RelayRequest::from_value(&body), Err(RelayError::NoJson));
        }
    }

    #[test]
    fn test_unknown_or_missing_action() {
        assert_eq!(
            RelayRequest::from_value(&json!({"action": "dance"})),
            Err(RelayError::UnknownAction)
        );
        assert_eq!(
            RelayRequest::from_value(&json!({"peer_id": "a"})),
            Err(RelayError::UnknownAction)
        );
    }

    #[test]
    fn test_empty_required_field_is_missing() {
        let err = RelayRequest::from_value(&json!({"action": "update", "peer_id": ""})).unwrap_err();
        assert_eq!(err.to_string(), "Missing peer_id");

        let err = RelayRequest::from_value(&json!({"action": "send_message", "sender": "a", "recipient": "b"}))
            .unwrap_err();
        assert_eq!(err, RelayError::MissingField("text".to_string()));
    }

    #[test]
    fn test_update_parses_optional_fields() {
        let request = RelayRequest::from_value(&json!({
            "action": "update",
            "peer_id": "ann@1.2.3.4:5000",
            "public_ip": "1.2.3.4",
            "tcp_port": 5000,
            "timestamp": 1.5,
        }))
        .unwrap();
        assert_eq!(
            request,
            RelayRequest::Update {
                peer_id: "ann@1.2.3.4:5000".to_string(),
                name: None,
                public_ip: Some("1.2.3.4".to_string()),
                tcp_port: Some(5000),
            }
        );
    }

    #[test]
    fn test_since_id_defaults_to_zero() {
        let request = RelayRequest::from_value(&json!({"action": "get_messages", "user_id": "u"})).unwrap();
        assert_eq!(
            request,
            RelayRequest::GetMessages {
                user_id: "u".to_string(),
                since_id: 0
            }
        );
    }

    #[test]
    fn test_request_serializes_with_action_tag() {
        let value = serde_json::to_value(RelayRequest::List {
            exclude: Some("me".to_string()),
        })
        .unwrap();
        assert_eq!(value, json!({"action": "list", "exclude": "me"}));
        assert_eq!(RelayRequest::from_value(&value).unwrap().action(), "list");
    }

    #[test]
    fn test_entry_without_name_defaults_to_unknown() {
        let entry: RelayEntry = serde_json::from_value(json!({"peer_id": "x", "last_seen": 1.0})).unwrap();
        assert_eq!(entry.name, UNKNOWN_NAME);
        assert!(entry.to_peer_record(Utc::now()).is_none());
    }

    #[test]
    fn test_frames_use_type_tag() {
        assert_eq!(serde_json::to_value(ServerFrame::Pong).unwrap(), json!({"type": "pong"}));
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"register","user_id":"bob"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Register {
                user_id: Some("bob".to_string())
            }
        );
    }
}
