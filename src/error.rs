//! Error types shared across the crate.

use std::fmt;

/// Errors surfaced by [`Connection::connect`](crate::connection::Connection::connect).
///
/// Carried inside [`ConnectionState`](crate::connection::ConnectionState), so
/// every variant is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The configured base URL is not `http(s)://` or `ws(s)://`.
    InvalidUrl(String),
    /// The WebSocket could not be opened or failed mid-handshake.
    Transport(String),
    /// The server spoke something other than Engine.IO v4 during the open sequence.
    Handshake(String),
    /// The server answered the namespace connect with a `CONNECT_ERROR` packet.
    Rejected(String),
    /// The open sequence did not finish within `connect_timeout_ms`.
    Timeout,
    /// `disconnect()` was called (or the transport task went away) while waiting.
    Closed,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::InvalidUrl(url) => write!(f, "Invalid URL scheme: {url}"),
            ConnectionError::Transport(e) => write!(f, "WebSocket transport error: {e}"),
            ConnectionError::Handshake(e) => write!(f, "Engine.IO handshake failed: {e}"),
            ConnectionError::Rejected(msg) => write!(f, "Server rejected connection: {msg}"),
            ConnectionError::Timeout => write!(f, "Timed out waiting for connection"),
            ConnectionError::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Errors from decoding a single Engine.IO / Socket.IO text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Zero-length frame.
    Empty,
    /// Leading packet type digit is not one we understand.
    UnknownPacket(String),
    /// Binary attachments are not supported over the text transport.
    Binary,
    /// The JSON body did not parse or had the wrong shape.
    Json(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Empty => write!(f, "Empty frame"),
            CodecError::UnknownPacket(t) => write!(f, "Unknown packet type: {t}"),
            CodecError::Binary => write!(f, "Binary packets are not supported"),
            CodecError::Json(e) => write!(f, "Malformed packet body: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors from turning a decoded Socket.IO event into a typed [`ServerEvent`](crate::protocol::ServerEvent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Event name outside the session channel vocabulary.
    UnknownEvent(String),
    /// Event carried no payload argument.
    MissingPayload(String),
    /// Payload did not match the event's schema.
    InvalidPayload { event: String, message: String },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownEvent(name) => write!(f, "Unknown event: {name}"),
            ProtocolError::MissingPayload(name) => write!(f, "Event {name} has no payload"),
            ProtocolError::InvalidPayload { event, message } => {
                write!(f, "Invalid payload for {event}: {message}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Errors from loading the TOML configuration file.
#[derive(Debug)]
pub enum ConfigError {
    /// The file exists (or was named explicitly) but could not be read.
    Read { path: String, source: std::io::Error },
    /// The file was read but is not valid configuration TOML.
    Parse { path: String, source: toml::de::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config file {path}: {source}")
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config file {path}: {source}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}
