//! Per-session subscriptions over the shared [`Connection`].
//!
//! Each [`SessionChannel::subscribe`] call joins the session's room and
//! registers one connection listener per supplied callback. Listeners are not
//! filtered by session: a callback sees every event of its kind that reaches
//! this client, whichever room it came from. Consumers that care filter on
//! `session_id` themselves (see [`SessionView`](crate::view::SessionView)).

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::connection::{Connection, ListenerId};
use crate::protocol::{
    ClientEvent, ErrorEvent, EventKind, InputEvent, OutputRecord, ServerEvent, StatusEvent,
    UsageEvent,
};

pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Optional handlers for one subscription. Unset handlers register nothing.
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    pub on_output: Option<Callback<OutputRecord>>,
    pub on_status: Option<Callback<StatusEvent>>,
    pub on_usage: Option<Callback<UsageEvent>>,
    pub on_input: Option<Callback<InputEvent>>,
    pub on_error: Option<Callback<ErrorEvent>>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_output(mut self, f: impl Fn(&OutputRecord) + Send + Sync + 'static) -> Self {
        self.on_output = Some(Arc::new(f));
        self
    }

    pub fn on_status(mut self, f: impl Fn(&StatusEvent) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Arc::new(f));
        self
    }

    pub fn on_usage(mut self, f: impl Fn(&UsageEvent) + Send + Sync + 'static) -> Self {
        self.on_usage = Some(Arc::new(f));
        self
    }

    pub fn on_input(mut self, f: impl Fn(&InputEvent) + Send + Sync + 'static) -> Self {
        self.on_input = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ErrorEvent) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

/// Subscription front-end for the shared connection.
#[derive(Clone)]
pub struct SessionChannel {
    connection: Connection,
}

impl SessionChannel {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Join `session_id`'s room and register `callbacks`.
    ///
    /// Does not connect; if the transport is down the join is sent once it
    /// comes up.
    pub fn subscribe(&self, session_id: &str, callbacks: SessionCallbacks) -> Subscription {
        self.connection.emit(ClientEvent::Join(session_id.to_string()));

        let mut listeners = Vec::new();
        if let Some(cb) = callbacks.on_output {
            listeners.push(self.connection.on(
                EventKind::Output,
                Arc::new(move |event: &ServerEvent| {
                    if let ServerEvent::Output(record) = event {
                        cb(record);
                    }
                }),
            ));
        }
        if let Some(cb) = callbacks.on_status {
            listeners.push(self.connection.on(
                EventKind::Status,
                Arc::new(move |event: &ServerEvent| {
                    if let ServerEvent::Status(status) = event {
                        cb(status);
                    }
                }),
            ));
        }
        if let Some(cb) = callbacks.on_usage {
            listeners.push(self.connection.on(
                EventKind::Usage,
                Arc::new(move |event: &ServerEvent| {
                    if let ServerEvent::Usage(usage) = event {
                        cb(usage);
                    }
                }),
            ));
        }
        if let Some(cb) = callbacks.on_input {
            listeners.push(self.connection.on(
                EventKind::Input,
                Arc::new(move |event: &ServerEvent| {
                    if let ServerEvent::Input(input) = event {
                        cb(input);
                    }
                }),
            ));
        }
        if let Some(cb) = callbacks.on_error {
            listeners.push(self.connection.on(
                EventKind::Error,
                Arc::new(move |event: &ServerEvent| {
                    if let ServerEvent::Error(error) = event {
                        cb(error);
                    }
                }),
            ));
        }

        debug!(
            "Subscribed to session {session_id} ({} listeners)",
            listeners.len()
        );
        Subscription {
            session_id: session_id.to_string(),
            connection: self.connection.clone(),
            listeners: Mutex::new(Some(listeners)),
        }
    }

    /// Fire-and-forget input for a session. Buffered while disconnected.
    pub fn send_input(&self, session_id: &str, input: impl Into<String>) {
        self.connection.emit(ClientEvent::Input {
            session_id: session_id.to_string(),
            input: input.into(),
        });
    }
}

/// Live registration returned by [`SessionChannel::subscribe`].
///
/// Dropping it unsubscribes.
pub struct Subscription {
    session_id: String,
    connection: Connection,
    /// `None` once unsubscribed.
    listeners: Mutex<Option<Vec<ListenerId>>>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_active(&self) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Leave the room and remove exactly this subscription's listeners.
    /// Later calls do nothing.
    pub fn unsubscribe(&self) {
        let taken = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(listeners) = taken else {
            return;
        };
        self.connection
            .emit(ClientEvent::Leave(self.session_id.clone()));
        for id in listeners {
            self.connection.off(id);
        }
        debug!("Unsubscribed from session {}", self.session_id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::ConnectionConfig;
    use crate::protocol::{OutputType, SessionStatus};
    use crate::testing::MockServer;

    fn output(session_id: &str, content: &str) -> ServerEvent {
        ServerEvent::Output(OutputRecord {
            session_id: session_id.into(),
            kind: OutputType::Stdout,
            content: content.into(),
            timestamp: 7,
        })
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&OutputRecord) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |r: &OutputRecord| {
            sink.lock()
                .unwrap()
                .push(format!("{}:{}", r.session_id, r.content));
        })
    }

    fn offline_channel() -> SessionChannel {
        SessionChannel::new(Connection::new(ConnectionConfig::default()))
    }

    #[test]
    fn subscribe_joins_then_registers_only_supplied_callbacks() {
        let channel = offline_channel();
        let sub = channel.subscribe(
            "abc",
            SessionCallbacks::new()
                .on_output(|_| {})
                .on_status(|_| {}),
        );
        let conn = channel.connection();
        assert_eq!(conn.rooms(), vec!["abc".to_string()]);
        assert!(conn.buffered().is_empty());
        assert_eq!(conn.listener_count(EventKind::Output), 1);
        assert_eq!(conn.listener_count(EventKind::Status), 1);
        assert_eq!(conn.listener_count(EventKind::Usage), 0);
        assert_eq!(conn.listener_count(EventKind::Error), 0);
        assert!(sub.is_active());
        assert_eq!(sub.session_id(), "abc");
    }

    #[test]
    fn output_fans_out_to_every_subscriber_regardless_of_session() {
        let channel = offline_channel();
        let (seen_a, on_a) = recorder();
        let (seen_b, on_b) = recorder();
        let _a = channel.subscribe("a", SessionCallbacks::new().on_output(on_a));
        let _b = channel.subscribe("b", SessionCallbacks::new().on_output(on_b));

        channel.connection().dispatch(&output("zzz", "hi"));

        assert_eq!(*seen_a.lock().unwrap(), vec!["zzz:hi".to_string()]);
        assert_eq!(*seen_b.lock().unwrap(), vec!["zzz:hi".to_string()]);
    }

    #[test]
    fn events_route_by_kind() {
        let channel = offline_channel();
        let outputs = Arc::new(AtomicUsize::new(0));
        let statuses = Arc::new(AtomicUsize::new(0));
        let (o, s) = (Arc::clone(&outputs), Arc::clone(&statuses));
        let _sub = channel.subscribe(
            "abc",
            SessionCallbacks::new()
                .on_output(move |_| {
                    o.fetch_add(1, Ordering::SeqCst);
                })
                .on_status(move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                }),
        );

        channel.connection().dispatch(&ServerEvent::Status(StatusEvent {
            session_id: "abc".into(),
            status: SessionStatus::Paused,
        }));
        channel.connection().dispatch(&ServerEvent::Usage(UsageEvent {
            session_id: "abc".into(),
            tokens_used: 1,
            request_count: 1,
        }));

        assert_eq!(outputs.load(Ordering::SeqCst), 0);
        assert_eq!(statuses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_twice_is_harmless() {
        let channel = offline_channel();
        let sub = channel.subscribe("abc", SessionCallbacks::new().on_output(|_| {}));

        sub.unsubscribe();
        sub.unsubscribe();

        let conn = channel.connection();
        assert!(!sub.is_active());
        assert_eq!(conn.listener_count(EventKind::Output), 0);
        assert!(conn.buffered().is_empty());
        assert!(conn.rooms().is_empty());
    }

    #[test]
    fn unsubscribe_leaves_other_subscriptions_intact() {
        let channel = offline_channel();
        let (seen_a, on_a) = recorder();
        let (seen_b, on_b) = recorder();
        let a = channel.subscribe("abc", SessionCallbacks::new().on_output(on_a));
        let _b = channel.subscribe("abc", SessionCallbacks::new().on_output(on_b));

        a.unsubscribe();
        channel.connection().dispatch(&output("abc", "after"));

        assert!(seen_a.lock().unwrap().is_empty());
        assert_eq!(*seen_b.lock().unwrap(), vec!["abc:after".to_string()]);
        // The room is still held by the second subscription.
        assert_eq!(channel.connection().rooms(), vec!["abc".to_string()]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let channel = offline_channel();
        {
            let _sub = channel.subscribe("abc", SessionCallbacks::new().on_error(|_| {}));
            assert_eq!(channel.connection().listener_count(EventKind::Error), 1);
        }
        assert_eq!(channel.connection().listener_count(EventKind::Error), 0);
        assert!(channel.connection().rooms().is_empty());
    }

    #[test]
    fn send_input_is_buffered_while_offline() {
        let channel = offline_channel();
        channel.send_input("abc", "ls -la\n");
        assert_eq!(
            channel.connection().buffered(),
            vec![ClientEvent::Input {
                session_id: "abc".into(),
                input: "ls -la\n".into()
            }]
        );
    }

    #[tokio::test]
    async fn room_signals_reach_the_server() {
        let mut server = MockServer::start().await;
        let channel = SessionChannel::new(Connection::new(server.client_config()));
        channel.connection().connect().await.unwrap();

        let sub = channel.subscribe("abc", SessionCallbacks::new().on_output(|_| {}));
        assert_eq!(server.next_event().await, ClientEvent::Join("abc".into()));

        channel.send_input("abc", "pwd");
        assert_eq!(
            server.next_event().await,
            ClientEvent::Input {
                session_id: "abc".into(),
                input: "pwd".into()
            }
        );

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(server.next_event().await, ClientEvent::Leave("abc".into()));
        server.assert_quiet().await;
    }
}
