//! Session channel event vocabulary.
//!
//! ## Client → server
//!
//! | Event           | Payload                  |
//! |-----------------|--------------------------|
//! | `session:join`  | session id (string)      |
//! | `session:leave` | session id (string)      |
//! | `session:input` | `{ sessionId, input }`   |
//!
//! ## Server → client
//!
//! | Event            | Payload                                      |
//! |------------------|----------------------------------------------|
//! | `session:output` | `{ sessionId, type, content, timestamp }`    |
//! | `session:status` | `{ sessionId, status }`                      |
//! | `session:usage`  | `{ sessionId, tokensUsed, requestCount }`    |
//! | `session:input`  | `{ sessionId, input, timestamp }` (echo)     |
//! | `session:error`  | `{ sessionId, error }`                       |
//!
//! Payloads are validated here, at the connection boundary; listeners only
//! ever see a typed [`ServerEvent`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::SocketPacket;
use crate::error::ProtocolError;

pub const EVENT_JOIN: &str = "session:join";
pub const EVENT_LEAVE: &str = "session:leave";
pub const EVENT_INPUT: &str = "session:input";
pub const EVENT_OUTPUT: &str = "session:output";
pub const EVENT_STATUS: &str = "session:status";
pub const EVENT_USAGE: &str = "session:usage";
pub const EVENT_ERROR: &str = "session:error";

/// Which stream an output record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Stdout,
    Stderr,
    /// Messages from the session runtime itself.
    System,
    /// Model reasoning.
    Thinking,
    ToolUse,
    ToolResult,
}

impl OutputType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
            Self::Thinking => "thinking",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
        }
    }
}

/// Session lifecycle status as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }
}

/// One unit of streamed session output. Doubles as the `session:output` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRecord {
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: OutputType,
    pub content: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub session_id: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub session_id: String,
    pub tokens_used: u64,
    pub request_count: u64,
}

/// Server echo of input sent to a session (by this or another client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEvent {
    pub session_id: String,
    pub input: String,
    pub timestamp: u64,
}

/// A session-level error. Transport failures are reported with an empty `session_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    #[serde(default)]
    pub session_id: String,
    pub error: String,
}

/// Inbound event kinds a listener can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Output,
    Status,
    Usage,
    Input,
    Error,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Output => EVENT_OUTPUT,
            Self::Status => EVENT_STATUS,
            Self::Usage => EVENT_USAGE,
            Self::Input => EVENT_INPUT,
            Self::Error => EVENT_ERROR,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            EVENT_OUTPUT => Some(Self::Output),
            EVENT_STATUS => Some(Self::Status),
            EVENT_USAGE => Some(Self::Usage),
            EVENT_INPUT => Some(Self::Input),
            EVENT_ERROR => Some(Self::Error),
            _ => None,
        }
    }
}

/// A validated server → client event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Output(OutputRecord),
    Status(StatusEvent),
    Usage(UsageEvent),
    Input(InputEvent),
    Error(ErrorEvent),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Output(_) => EventKind::Output,
            Self::Status(_) => EventKind::Status,
            Self::Usage(_) => EventKind::Usage,
            Self::Input(_) => EventKind::Input,
            Self::Error(_) => EventKind::Error,
        }
    }

    /// Session the payload claims to belong to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::Output(e) => &e.session_id,
            Self::Status(e) => &e.session_id,
            Self::Usage(e) => &e.session_id,
            Self::Input(e) => &e.session_id,
            Self::Error(e) => &e.session_id,
        }
    }

    /// Validate a decoded Socket.IO event against the vocabulary.
    pub fn decode(name: &str, args: Vec<Value>) -> Result<Self, ProtocolError> {
        let kind =
            EventKind::from_name(name).ok_or_else(|| ProtocolError::UnknownEvent(name.to_string()))?;
        let payload = args
            .into_iter()
            .next()
            .ok_or_else(|| ProtocolError::MissingPayload(name.to_string()))?;
        Ok(match kind {
            EventKind::Output => Self::Output(from_payload(name, payload)?),
            EventKind::Status => Self::Status(from_payload(name, payload)?),
            EventKind::Usage => Self::Usage(from_payload(name, payload)?),
            EventKind::Input => Self::Input(from_payload(name, payload)?),
            EventKind::Error => Self::Error(from_payload(name, payload)?),
        })
    }

    /// Wire form, as a server would emit it.
    pub fn to_packet(&self) -> SocketPacket {
        let payload = match self {
            Self::Output(e) => serde_json::to_value(e),
            Self::Status(e) => serde_json::to_value(e),
            Self::Usage(e) => serde_json::to_value(e),
            Self::Input(e) => serde_json::to_value(e),
            Self::Error(e) => serde_json::to_value(e),
        };
        SocketPacket::event(self.kind().name(), payload.unwrap_or(Value::Null))
    }
}

fn from_payload<T: DeserializeOwned>(event: &str, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload {
        event: event.to_string(),
        message: e.to_string(),
    })
}

/// A client → server event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Join(String),
    Leave(String),
    Input { session_id: String, input: String },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => EVENT_JOIN,
            Self::Leave(_) => EVENT_LEAVE,
            Self::Input { .. } => EVENT_INPUT,
        }
    }

    pub fn to_packet(&self) -> SocketPacket {
        let payload = match self {
            Self::Join(id) | Self::Leave(id) => Value::String(id.clone()),
            Self::Input { session_id, input } => serde_json::json!({
                "sessionId": session_id,
                "input": input,
            }),
        };
        SocketPacket::event(self.name(), payload)
    }

    /// Parse a client event as a server would receive it.
    pub fn decode(name: &str, args: &[Value]) -> Result<Self, ProtocolError> {
        let payload = args
            .first()
            .ok_or_else(|| ProtocolError::MissingPayload(name.to_string()))?;
        let invalid = |message: &str| ProtocolError::InvalidPayload {
            event: name.to_string(),
            message: message.to_string(),
        };
        match name {
            EVENT_JOIN | EVENT_LEAVE => {
                let id = payload
                    .as_str()
                    .ok_or_else(|| invalid("session id must be a string"))?
                    .to_string();
                Ok(if name == EVENT_JOIN {
                    Self::Join(id)
                } else {
                    Self::Leave(id)
                })
            }
            EVENT_INPUT => {
                let session_id = payload["sessionId"]
                    .as_str()
                    .ok_or_else(|| invalid("missing sessionId"))?;
                let input = payload["input"]
                    .as_str()
                    .ok_or_else(|| invalid("missing input"))?;
                Ok(Self::Input {
                    session_id: session_id.to_string(),
                    input: input.to_string(),
                })
            }
            _ => Err(ProtocolError::UnknownEvent(name.to_string())),
        }
    }
}
