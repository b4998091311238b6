#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! # session-channel
//!
//! Real-time event channel for agent sessions.
//!
//! A client keeps one Socket.IO connection to the API server, multiplexes it
//! across per-session subscriptions, and mirrors each session's output into a
//! bounded in-memory store that views and the `session-tail` CLI read from.
//!
//! ## Events
//!
//! | Direction     | Event            | Payload                                   |
//! |---------------|------------------|-------------------------------------------|
//! | client→server | `session:join`   | session id                                |
//! | client→server | `session:leave`  | session id                                |
//! | client→server | `session:input`  | `{sessionId, input}`                      |
//! | server→client | `session:output` | `{sessionId, type, content, timestamp}`   |
//! | server→client | `session:status` | `{sessionId, status}`                     |
//! | server→client | `session:usage`  | `{sessionId, tokensUsed, requestCount}`   |
//! | server→client | `session:input`  | `{sessionId, input, timestamp}` (echo)    |
//! | server→client | `session:error`  | `{sessionId, error}`                      |
//!
//! ## Architecture
//!
//! ```text
//! config.rs        TOML + env-var configuration
//! error.rs         ConnectionError, CodecError, ProtocolError, ConfigError
//! codec.rs         Engine.IO v4 / Socket.IO v5 text framing
//! protocol.rs      typed session events and payloads
//! connection.rs    shared transport task, listener registry, reconnect, outbox
//! channel.rs       SessionChannel: per-session subscribe/unsubscribe, input
//! store.rs         SessionStore: bounded output buffers, tasks, session list
//! view.rs          SessionView: mount/unmount lifecycle for one session
//! main.rs          session-tail CLI
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod store;
pub mod view;

#[cfg(test)]
mod testing;

pub use channel::{SessionCallbacks, SessionChannel, Subscription};
pub use config::Config;
pub use connection::{Connection, ConnectionState};
pub use error::ConnectionError;
pub use store::{SessionStore, SharedStore};
pub use view::{SessionCache, SessionView, ViewState};
