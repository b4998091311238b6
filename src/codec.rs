//! Engine.IO v4 / Socket.IO v5 text framing.
//!
//! Every WebSocket text frame is one Engine.IO packet: a single type digit
//! followed by an optional body. Packet type `4` (message) wraps a Socket.IO
//! packet, which has its own type digit, an optional namespace (`/nsp,`), an
//! optional ack id, and a JSON body.
//!
//! ```text
//! 0{"sid":"x","pingInterval":25000,"pingTimeout":20000}   open
//! 2 / 3                                                  ping / pong
//! 40                                                     connect to "/"
//! 40{"sid":"y"}                                          connect ack
//! 44{"message":"nope"}                                   connect error
//! 42["session:output",{...}]                             event
//! 41                                                     disconnect
//! ```
//!
//! Only the default namespace is used; namespaces and ack ids on inbound
//! packets are tolerated and discarded.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;

/// Body of the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Server ping cadence in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Grace after a missed ping before the server is considered gone.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}
fn default_ping_timeout() -> u64 {
    20_000
}

/// One Engine.IO packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Message(SocketPacket),
    Noop,
}

/// One Socket.IO packet carried inside an Engine.IO message.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    /// Client request (no body) or server ack (`{"sid": ...}`).
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, args: Vec<Value> },
    ConnectError(Value),
}

impl SocketPacket {
    /// Convenience constructor for an event with a single payload argument.
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        SocketPacket::Event {
            name: name.into(),
            args: vec![payload],
        }
    }
}

/// Encode a packet into a WebSocket text frame.
pub fn encode(packet: &Packet) -> String {
    match packet {
        Packet::Open(handshake) => {
            format!("0{}", serde_json::to_string(handshake).unwrap_or_default())
        }
        Packet::Close => "1".to_string(),
        Packet::Ping => "2".to_string(),
        Packet::Pong => "3".to_string(),
        Packet::Message(inner) => format!("4{}", encode_socket(inner)),
        Packet::Noop => "6".to_string(),
    }
}

fn encode_socket(packet: &SocketPacket) -> String {
    match packet {
        SocketPacket::Connect(None) => "0".to_string(),
        SocketPacket::Connect(Some(body)) => format!("0{body}"),
        SocketPacket::Disconnect => "1".to_string(),
        SocketPacket::Event { name, args } => {
            let mut array = Vec::with_capacity(args.len() + 1);
            array.push(Value::String(name.clone()));
            array.extend(args.iter().cloned());
            format!("2{}", Value::Array(array))
        }
        SocketPacket::ConnectError(body) => format!("4{body}"),
    }
}

/// Decode one WebSocket text frame.
pub fn decode(frame: &str) -> Result<Packet, CodecError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or(CodecError::Empty)?;
    let body = chars.as_str();

    match kind {
        '0' => serde_json::from_str(body)
            .map(Packet::Open)
            .map_err(|e| CodecError::Json(e.to_string())),
        '1' => Ok(Packet::Close),
        // Ping/pong may carry a "probe" payload during transport upgrades; ignore it.
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_socket(body).map(Packet::Message),
        '6' => Ok(Packet::Noop),
        other => Err(CodecError::UnknownPacket(other.to_string())),
    }
}

fn decode_socket(frame: &str) -> Result<SocketPacket, CodecError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or(CodecError::Empty)?;
    let body = strip_ack_id(strip_namespace(chars.as_str()));

    match kind {
        '0' => {
            if body.is_empty() {
                Ok(SocketPacket::Connect(None))
            } else {
                parse_json(body).map(|v| SocketPacket::Connect(Some(v)))
            }
        }
        '1' => Ok(SocketPacket::Disconnect),
        '2' => {
            let mut args = match parse_json(body)? {
                Value::Array(items) => items,
                _ => return Err(CodecError::Json("event body is not an array".into())),
            };
            if args.is_empty() {
                return Err(CodecError::Json("event array is empty".into()));
            }
            let name = match args.remove(0) {
                Value::String(name) => name,
                _ => return Err(CodecError::Json("event name is not a string".into())),
            };
            Ok(SocketPacket::Event { name, args })
        }
        '4' => {
            let body = if body.is_empty() {
                Value::Null
            } else {
                parse_json(body)?
            };
            Ok(SocketPacket::ConnectError(body))
        }
        '5' | '6' => Err(CodecError::Binary),
        other => Err(CodecError::UnknownPacket(format!("4{other}"))),
    }
}

/// Drop a leading `/namespace,` if present.
fn strip_namespace(s: &str) -> &str {
    if s.starts_with('/') {
        match s.find(',') {
            Some(idx) => &s[idx + 1..],
            None => "",
        }
    } else {
        s
    }
}

/// Drop a leading numeric ack id.
fn strip_ack_id(s: &str) -> &str {
    s.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn parse_json(s: &str) -> Result<Value, CodecError> {
    serde_json::from_str(s).map_err(|e| CodecError::Json(e.to_string()))
}
