//! Live detail view for one session.
//!
//! A [`SessionView`] ties the connection, the multiplexer, and the store
//! together for a single session id: mounting connects and subscribes,
//! output for that session is appended to the [`SharedStore`], and status or
//! usage changes refresh the stored summary and invalidate the caller's
//! cached session metadata through [`SessionCache`].
//!
//! Callbacks run on the connection's transport task, so they only forward
//! into a channel; a pump task spawned on mount applies the updates to the
//! store in arrival order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::channel::{SessionCallbacks, SessionChannel, Subscription};
use crate::error::ConnectionError;
use crate::protocol::{OutputRecord, StatusEvent, UsageEvent};
use crate::store::{SessionUpdate, SessionUsage, SharedStore};

/// Externally owned cache of session metadata (e.g. REST query results).
pub trait SessionCache: Send + Sync {
    /// Mark the cached metadata for `session_id` as stale.
    fn invalidate_session(&self, session_id: &str);
}

impl<F> SessionCache for F
where
    F: Fn(&str) + Send + Sync,
{
    fn invalidate_session(&self, session_id: &str) {
        self(session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    Disconnected,
    Connecting,
    Subscribed,
    Unsubscribed,
    /// The connect on mount failed.
    Failed(ConnectionError),
}

enum ViewUpdate {
    Output(OutputRecord),
    Status(StatusEvent),
    Usage(UsageEvent),
}

pub struct SessionView {
    session_id: String,
    channel: SessionChannel,
    store: SharedStore,
    cache: Arc<dyn SessionCache>,
    state: ViewState,
    subscription: Option<Subscription>,
}

impl SessionView {
    pub fn new(
        session_id: impl Into<String>,
        channel: SessionChannel,
        store: SharedStore,
        cache: Arc<dyn SessionCache>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            channel,
            store,
            cache,
            state: ViewState::Disconnected,
            subscription: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Connect and subscribe. A second mount while subscribed does nothing.
    pub async fn mount(&mut self) -> Result<(), ConnectionError> {
        if self.state == ViewState::Subscribed {
            return Ok(());
        }

        self.state = ViewState::Connecting;
        if let Err(e) = self.channel.connection().connect().await {
            warn!("Session {}: connect failed: {e}", self.session_id);
            self.state = ViewState::Failed(e.clone());
            return Err(e);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(apply_updates(rx, self.store.clone(), Arc::clone(&self.cache)));

        let own_id = self.session_id.clone();
        let output_tx = tx.clone();
        let status_tx = tx.clone();
        let usage_tx = tx;
        let callbacks = SessionCallbacks::new()
            .on_output(move |record| {
                if record.session_id == own_id {
                    let _ = output_tx.send(ViewUpdate::Output(record.clone()));
                }
            })
            .on_status(move |status| {
                let _ = status_tx.send(ViewUpdate::Status(status.clone()));
            })
            .on_usage(move |usage| {
                let _ = usage_tx.send(ViewUpdate::Usage(usage.clone()));
            })
            .on_error(|e| {
                error!(session_id = %e.session_id, "Session error: {}", e.error);
            });

        self.subscription = Some(self.channel.subscribe(&self.session_id, callbacks));
        self.state = ViewState::Subscribed;
        Ok(())
    }

    /// Forward a line of input to the session.
    pub fn send_input(&self, input: impl Into<String>) {
        self.channel.send_input(&self.session_id, input);
    }

    /// Tear down the subscription. Safe to call any number of times.
    ///
    /// Updates already forwarded are still applied; the pump exits once the
    /// deregistered callbacks drop its sender.
    pub fn unmount(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        subscription.unsubscribe();
        self.state = ViewState::Unsubscribed;
        debug!("Unmounted view for session {}", self.session_id);
    }
}

impl Drop for SessionView {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Single writer for everything the view puts into the store.
async fn apply_updates(
    mut rx: mpsc::UnboundedReceiver<ViewUpdate>,
    store: SharedStore,
    cache: Arc<dyn SessionCache>,
) {
    while let Some(update) = rx.recv().await {
        match update {
            ViewUpdate::Output(record) => {
                let session_id = record.session_id.clone();
                store.update(|s| s.add_output(&session_id, record)).await;
            }
            ViewUpdate::Status(event) => {
                store
                    .update(|s| {
                        s.update_session(
                            &event.session_id,
                            SessionUpdate {
                                status: Some(event.status),
                                ..SessionUpdate::default()
                            },
                        )
                    })
                    .await;
                cache.invalidate_session(&event.session_id);
            }
            ViewUpdate::Usage(event) => {
                store
                    .update(|s| {
                        s.update_session(
                            &event.session_id,
                            SessionUpdate {
                                usage: Some(SessionUsage {
                                    tokens_used: event.tokens_used,
                                    request_count: event.request_count,
                                }),
                                ..SessionUpdate::default()
                            },
                        )
                    })
                    .await;
                cache.invalidate_session(&event.session_id);
            }
        }
    }
}
