//! Per-session output ring buffers and session metadata.
//!
//! [`SessionStore`] is plain synchronous state: bounded output buffers keyed by
//! session id, background-task lists, the flat session list, and the active
//! selection. [`SharedStore`] wraps it for concurrent use and wakes readers
//! (via a shared [`Notify`]) after every mutation.
//!
//! Output buffers are copy-on-write: [`SessionStore::outputs`] hands out an
//! `Arc` snapshot that later appends never touch.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, RwLock, RwLockReadGuard};

use crate::protocol::{OutputRecord, SessionStatus};

/// Default number of output records kept per session.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 1000;

/// What a background task is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Agent,
    Shell,
    FileOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A background task spawned inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundTask {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub description: String,
    /// Percent complete, 0–100.
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Unix timestamp in milliseconds.
    pub started_at: u64,
    #[serde(default)]
    pub completed_at: Option<u64>,
}

/// Partial update merged into a [`BackgroundTask`]; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub description: Option<String>,
    pub progress: Option<u8>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub completed_at: Option<u64>,
}

impl TaskUpdate {
    fn apply(self, task: &mut BackgroundTask) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(description) = self.description {
            task.description = description;
        }
        if self.progress.is_some() {
            task.progress = self.progress;
        }
        if self.output.is_some() {
            task.output = self.output;
        }
        if self.error.is_some() {
            task.error = self.error;
        }
        if self.completed_at.is_some() {
            task.completed_at = self.completed_at;
        }
    }
}

/// OS process backing a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub started_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUsage {
    pub tokens_used: u64,
    pub request_count: u64,
}

/// Session summary as served by the REST API. The store caches it; the server owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub process: Option<ProcessInfo>,
    #[serde(default)]
    pub usage: SessionUsage,
}

/// Partial update merged into a [`Session`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub name: Option<String>,
    pub status: Option<SessionStatus>,
    pub mode: Option<String>,
    pub working_directory: Option<String>,
    pub config: Option<Value>,
    pub process: Option<ProcessInfo>,
    pub usage: Option<SessionUsage>,
}

impl SessionUpdate {
    fn apply(self, session: &mut Session) {
        if let Some(name) = self.name {
            session.name = name;
        }
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(mode) = self.mode {
            session.mode = mode;
        }
        if let Some(dir) = self.working_directory {
            session.working_directory = dir;
        }
        if let Some(config) = self.config {
            session.config = config;
        }
        if self.process.is_some() {
            session.process = self.process;
        }
        if let Some(usage) = self.usage {
            session.usage = usage;
        }
    }
}

/// Bounded output history for one session.
#[derive(Debug, Clone, Default)]
struct OutputBuffer {
    entries: Arc<VecDeque<OutputRecord>>,
    /// Records ever appended (never reset, not even by clear). Doubles as the
    /// sequence number of the newest record.
    appended: u64,
}

impl OutputBuffer {
    fn push(&mut self, record: OutputRecord, capacity: usize) {
        let entries = Arc::make_mut(&mut self.entries);
        entries.push_back(record);
        while entries.len() > capacity {
            entries.pop_front();
        }
        self.appended += 1;
    }

    fn read_since(&self, cursor: u64) -> (Vec<OutputRecord>, u64) {
        let len = self.entries.len() as u64;
        let oldest_available = self.appended - len + 1;
        let dropped = if oldest_available > cursor.saturating_add(1) {
            oldest_available - cursor - 1
        } else {
            0
        };
        let skip = cursor.saturating_sub(self.appended - len).min(len);

        #[allow(clippy::cast_possible_truncation)]
        let entries = self.entries.iter().skip(skip as usize).cloned().collect();
        (entries, dropped)
    }
}

/// Output buffers, task lists, and the session list for every known session.
#[derive(Debug)]
pub struct SessionStore {
    capacity: usize,
    outputs: HashMap<String, OutputBuffer>,
    tasks: HashMap<String, Vec<BackgroundTask>>,
    sessions: Vec<Session>,
    active_session_id: Option<String>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_CAPACITY)
    }
}

impl SessionStore {
    /// Create a store that keeps at most `capacity` output records per session.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            outputs: HashMap::new(),
            tasks: HashMap::new(),
            sessions: Vec::new(),
            active_session_id: None,
        }
    }

    // --- output ---

    /// Append a record, evicting the oldest records beyond capacity.
    pub fn add_output(&mut self, session_id: &str, record: OutputRecord) {
        self.outputs
            .entry(session_id.to_string())
            .or_default()
            .push(record, self.capacity);
    }

    /// Empty one session's buffer. Other sessions are untouched.
    pub fn clear_outputs(&mut self, session_id: &str) {
        if let Some(buf) = self.outputs.get_mut(session_id) {
            buf.entries = Arc::new(VecDeque::new());
        }
    }

    /// Snapshot of a session's buffered output, oldest first.
    pub fn outputs(&self, session_id: &str) -> Arc<VecDeque<OutputRecord>> {
        self.outputs
            .get(session_id)
            .map(|buf| Arc::clone(&buf.entries))
            .unwrap_or_default()
    }

    /// Records appended after `cursor` (a previous [`output_cursor`](Self::output_cursor)).
    ///
    /// Returns `(records, dropped)` where `dropped > 0` if records between
    /// `cursor` and the oldest buffered record were evicted or cleared.
    pub fn read_since(&self, session_id: &str, cursor: u64) -> (Vec<OutputRecord>, u64) {
        self.outputs
            .get(session_id)
            .map_or((Vec::new(), 0), |buf| buf.read_since(cursor))
    }

    /// Number of records ever appended for a session.
    pub fn output_cursor(&self, session_id: &str) -> u64 {
        self.outputs.get(session_id).map_or(0, |buf| buf.appended)
    }

    // --- tasks ---

    pub fn set_tasks(&mut self, session_id: &str, tasks: Vec<BackgroundTask>) {
        self.tasks.insert(session_id.to_string(), tasks);
    }

    pub fn add_task(&mut self, session_id: &str, task: BackgroundTask) {
        self.tasks
            .entry(session_id.to_string())
            .or_default()
            .push(task);
    }

    /// Merge `update` into the matching task. Unknown ids are ignored.
    pub fn update_task(&mut self, session_id: &str, task_id: &str, update: TaskUpdate) {
        if let Some(task) = self
            .tasks
            .get_mut(session_id)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.id == task_id))
        {
            update.apply(task);
        }
    }

    pub fn tasks(&self, session_id: &str) -> &[BackgroundTask] {
        self.tasks.get(session_id).map(Vec::as_slice).unwrap_or(&[])
    }

    // --- sessions ---

    pub fn set_sessions(&mut self, sessions: Vec<Session>) {
        self.sessions = sessions;
    }

    pub fn add_session(&mut self, session: Session) {
        self.sessions.push(session);
    }

    /// Merge `update` into the session with `id`. Unknown ids are ignored.
    pub fn update_session(&mut self, id: &str, update: SessionUpdate) {
        if let Some(session) = self.sessions.iter_mut().find(|s| s.id == id) {
            update.apply(session);
        }
    }

    /// Remove a session, clearing the active selection if it pointed at it.
    pub fn remove_session(&mut self, id: &str) {
        self.sessions.retain(|s| s.id != id);
        if self.active_session_id.as_deref() == Some(id) {
            self.active_session_id = None;
        }
    }

    pub fn set_active_session(&mut self, id: Option<&str>) {
        self.active_session_id = id.map(str::to_string);
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn active_session_id(&self) -> Option<&str> {
        self.active_session_id.as_deref()
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.active_session_id.as_deref().and_then(|id| self.session(id))
    }
}

/// Cloneable handle to a [`SessionStore`] shared between the transport task and readers.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<RwLock<SessionStore>>,
    notify: Arc<Notify>,
}

impl SharedStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SessionStore::new(capacity))),
            notify: Arc::new(Notify::new()),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, SessionStore> {
        self.inner.read().await
    }

    /// Mutate the store and wake every waiter.
    pub async fn update<R>(&self, f: impl FnOnce(&mut SessionStore) -> R) -> R {
        let result = {
            let mut store = self.inner.write().await;
            f(&mut store)
        };
        self.notify.notify_waiters();
        result
    }

    /// Wait until a session has records past `cursor`, then return them along
    /// with the dropped count and the new cursor.
    pub async fn wait_for_output(
        &self,
        session_id: &str,
        cursor: u64,
    ) -> (Vec<OutputRecord>, u64, u64) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before reading so a write between the read and the await is not missed.
            notified.as_mut().enable();

            {
                let store = self.inner.read().await;
                let next = store.output_cursor(session_id);
                if next > cursor {
                    let (records, dropped) = store.read_since(session_id, cursor);
                    return (records, dropped, next);
                }
            }

            notified.await;
        }
    }
}

impl Default for SharedStore {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OutputType;

    fn record(session_id: &str, timestamp: u64) -> OutputRecord {
        OutputRecord {
            session_id: session_id.into(),
            kind: OutputType::Stdout,
            content: format!("line {timestamp}"),
            timestamp,
        }
    }

    fn task(id: &str) -> BackgroundTask {
        BackgroundTask {
            id: id.into(),
            session_id: "s1".into(),
            kind: TaskKind::Shell,
            status: TaskStatus::Running,
            description: "cargo build".into(),
            progress: None,
            output: None,
            error: None,
            started_at: 10,
            completed_at: None,
        }
    }

    fn session(id: &str) -> Session {
        Session {
            id: id.into(),
            name: format!("session {id}"),
            status: SessionStatus::Idle,
            mode: "interactive".into(),
            working_directory: "/tmp".into(),
            config: Value::Null,
            process: None,
            usage: SessionUsage::default(),
        }
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut store = SessionStore::default();
        for ts in 1..=1001 {
            store.add_output("s1", record("s1", ts));
        }
        let outputs = store.outputs("s1");
        assert_eq!(outputs.len(), 1000);
        assert_eq!(outputs.front().unwrap().timestamp, 2);
        assert_eq!(outputs.back().unwrap().timestamp, 1001);
    }

    #[test]
    fn never_exceeds_capacity_and_keeps_order() {
        let mut store = SessionStore::new(7);
        for ts in 1..=50 {
            store.add_output("s1", record("s1", ts));
            let outputs = store.outputs("s1");
            assert!(outputs.len() <= 7);
            let stamps: Vec<u64> = outputs.iter().map(|r| r.timestamp).collect();
            let expected: Vec<u64> = (ts.saturating_sub(6).max(1)..=ts).collect();
            assert_eq!(stamps, expected);
        }
    }

    #[test]
    fn snapshots_are_copy_on_write() {
        let mut store = SessionStore::default();
        store.add_output("s1", record("s1", 1));
        let before = store.outputs("s1");
        store.add_output("s1", record("s1", 2));
        store.clear_outputs("s1");
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].timestamp, 1);
        assert!(store.outputs("s1").is_empty());
    }

    #[test]
    fn clear_is_scoped_to_one_session() {
        let mut store = SessionStore::default();
        store.add_output("a", record("a", 1));
        store.add_output("b", record("b", 1));
        store.clear_outputs("a");
        for ts in 2..=5 {
            store.add_output("b", record("b", ts));
        }
        assert!(store.outputs("a").is_empty());
        assert_eq!(store.outputs("b").len(), 5);
    }

    #[test]
    fn unknown_session_has_empty_output() {
        let store = SessionStore::default();
        assert!(store.outputs("nope").is_empty());
        assert_eq!(store.output_cursor("nope"), 0);
        assert_eq!(store.read_since("nope", 0), (vec![], 0));
    }

    #[test]
    fn read_since_reports_evictions() {
        let mut store = SessionStore::new(3);
        for ts in 1..=5 {
            store.add_output("s1", record("s1", ts));
        }
        // Buffer holds seq 3..=5
        let (records, dropped) = store.read_since("s1", 0);
        assert_eq!(dropped, 2);
        assert_eq!(records.iter().map(|r| r.timestamp).collect::<Vec<_>>(), [3, 4, 5]);

        let (records, dropped) = store.read_since("s1", 4);
        assert_eq!(dropped, 0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, 5);

        assert_eq!(store.read_since("s1", 5), (vec![], 0));
        assert_eq!(store.output_cursor("s1"), 5);
    }

    #[test]
    fn cursor_survives_clear() {
        let mut store = SessionStore::default();
        store.add_output("s1", record("s1", 1));
        store.add_output("s1", record("s1", 2));
        store.clear_outputs("s1");
        store.add_output("s1", record("s1", 3));
        let (records, dropped) = store.read_since("s1", 1);
        assert_eq!(dropped, 1);
        assert_eq!(records[0].timestamp, 3);
    }

    #[test]
    fn update_task_merges_matching_task() {
        let mut store = SessionStore::default();
        store.set_tasks("s1", vec![task("t1"), task("t2")]);
        store.update_task(
            "s1",
            "t2",
            TaskUpdate {
                status: Some(TaskStatus::Completed),
                progress: Some(100),
                completed_at: Some(99),
                ..TaskUpdate::default()
            },
        );
        let tasks = store.tasks("s1");
        assert_eq!(tasks[0], task("t1"));
        assert_eq!(tasks[1].status, TaskStatus::Completed);
        assert_eq!(tasks[1].progress, Some(100));
        assert_eq!(tasks[1].completed_at, Some(99));
        assert_eq!(tasks[1].description, "cargo build");
    }

    #[test]
    fn update_task_with_unknown_id_is_noop() {
        let mut store = SessionStore::default();
        store.set_tasks("s1", vec![task("t1")]);
        let before = store.tasks("s1").to_vec();
        store.update_task(
            "s1",
            "nonexistent-id",
            TaskUpdate {
                status: Some(TaskStatus::Completed),
                ..TaskUpdate::default()
            },
        );
        store.update_task("other", "t1", TaskUpdate::default());
        assert_eq!(store.tasks("s1"), before.as_slice());
        assert!(store.tasks("other").is_empty());
    }

    #[test]
    fn add_and_set_tasks() {
        let mut store = SessionStore::default();
        store.add_task("s1", task("t1"));
        store.add_task("s1", task("t2"));
        assert_eq!(store.tasks("s1").len(), 2);
        store.set_tasks("s1", vec![task("t3")]);
        assert_eq!(store.tasks("s1").len(), 1);
        assert_eq!(store.tasks("s1")[0].id, "t3");
    }

    #[test]
    fn task_update_parses_from_partial_json() {
        let update: TaskUpdate =
            serde_json::from_value(serde_json::json!({"status": "failed", "error": "exit 1"})).unwrap();
        assert_eq!(update.status, Some(TaskStatus::Failed));
        assert_eq!(update.error.as_deref(), Some("exit 1"));
        assert!(update.progress.is_none());
    }

    #[test]
    fn session_collection_operations() {
        let mut store = SessionStore::default();
        store.set_sessions(vec![session("a"), session("b")]);
        store.add_session(session("c"));
        store.update_session(
            "b",
            SessionUpdate {
                status: Some(SessionStatus::Running),
                ..SessionUpdate::default()
            },
        );
        store.update_session("missing", SessionUpdate::default());
        assert_eq!(store.sessions().len(), 3);
        assert_eq!(store.session("b").unwrap().status, SessionStatus::Running);
        assert_eq!(store.session("b").unwrap().name, "session b");
    }

    #[test]
    fn removing_active_session_clears_selection() {
        let mut store = SessionStore::default();
        store.set_sessions(vec![session("a"), session("b")]);
        store.set_active_session(Some("a"));
        store.remove_session("b");
        assert_eq!(store.active_session_id(), Some("a"));
        store.remove_session("a");
        assert_eq!(store.active_session_id(), None);
        assert!(store.active_session().is_none());
        store.remove_session("a");
        assert_eq!(store.sessions().len(), 0);
    }

    #[tokio::test]
    async fn shared_store_wakes_waiters() {
        let store = SharedStore::new(10);
        let reader = store.clone();
        let handle = tokio::spawn(async move { reader.wait_for_output("s1", 0).await });

        tokio::task::yield_now().await;
        store.update(|s| s.add_output("s1", record("s1", 7))).await;

        let (records, dropped, cursor) = handle.await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, 7);
        assert_eq!(dropped, 0);
        assert_eq!(cursor, 1);
    }
}
