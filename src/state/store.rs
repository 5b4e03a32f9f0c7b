//! # The state store: in-memory model with durable snapshots.
//!
//! [`State`] is the authoritative, process-wide model of changes, tasks,
//! notices, identities, and custom manager data. All access is serialised
//! by the single exclusive lock of [`StateLock`]; releasing the lock is
//! the checkpoint point.
//!
//! ```text
//! let mut st = state.lock();      // exclusive access
//! let id = st.new_change(...);    // mutations mark the state modified
//! drop(st);                       // unlock ⇒ serialise + Backend::checkpoint
//! ```
//!
//! ## Rules
//! - Lock discipline is enforced by the type system: the only way to an
//!   `&mut State` is through a [`StateGuard`].
//! - Unlock retries failed checkpoints every 3 s for up to 5 min, then
//!   panics; a state that cannot persist must not keep running.
//! - Status-changed observers fire under the lock and must not block.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::StateError;
use crate::state::backend::Backend;
use crate::state::change::Change;
use crate::state::identity::Identity;
use crate::state::notice::{Notice, NoticeKey, NoticeType};
use crate::state::status::Status;
use crate::state::task::Task;

/// Checkpoint retry policy: how long and how often unlock retries a
/// failing backend before giving up.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointRetry {
    pub interval: Duration,
    pub max_time: Duration,
}

impl Default for CheckpointRetry {
    fn default() -> Self {
        CheckpointRetry {
            interval: Duration::from_secs(3),
            max_time: Duration::from_secs(5 * 60),
        }
    }
}

/// Observer of task status transitions. Fired under the state lock;
/// must be non-blocking.
pub type TaskStatusHandler = Box<dyn Fn(&Task, Status, Status) + Send + Sync>;

/// Observer of change status transitions. Fired under the state lock;
/// must be non-blocking.
pub type ChangeStatusHandler = Box<dyn Fn(&Change, Status, Status) + Send + Sync>;

/// Predicate consulted by [`State::prune`] before aborting an old
/// unready change carrying the registered attribute.
pub type PendingPredicate = Box<dyn Fn(&Change) -> bool + Send + Sync>;

/// The evolving system state that persists across restarts.
pub struct State {
    backend: Option<Arc<dyn Backend>>,

    data: HashMap<String, Value>,
    pub(crate) changes: HashMap<String, Change>,
    pub(crate) tasks: HashMap<String, Task>,
    pub(crate) notices: BTreeMap<NoticeKey, Notice>,
    pub(crate) identities: BTreeMap<String, Identity>,

    last_change_id: u64,
    last_task_id: u64,
    last_lane_id: u64,
    last_notice_id: u64,

    modified: bool,
    retry: CheckpointRetry,

    // Runtime-only, never serialized.
    pub(crate) latest_warning_time: Option<DateTime<Utc>>,
    pending_change_by_attr: HashMap<String, PendingPredicate>,
    task_handlers: BTreeMap<u64, TaskStatusHandler>,
    change_handlers: BTreeMap<u64, ChangeStatusHandler>,
    last_handler_id: u64,
}

/// Serialized form of the state file.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct MarshalledState {
    data: HashMap<String, Value>,
    changes: HashMap<String, Change>,
    tasks: HashMap<String, Task>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    notices: Vec<Notice>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    identities: BTreeMap<String, Identity>,
    last_change_id: u64,
    last_task_id: u64,
    last_lane_id: u64,
    last_notice_id: u64,
}

impl State {
    fn empty(backend: Option<Arc<dyn Backend>>) -> State {
        State {
            backend,
            data: HashMap::new(),
            changes: HashMap::new(),
            tasks: HashMap::new(),
            notices: BTreeMap::new(),
            identities: BTreeMap::new(),
            last_change_id: 0,
            last_task_id: 0,
            last_lane_id: 0,
            last_notice_id: 0,
            modified: true,
            retry: CheckpointRetry::default(),
            latest_warning_time: None,
            pending_change_by_attr: HashMap::new(),
            task_handlers: BTreeMap::new(),
            change_handlers: BTreeMap::new(),
            last_handler_id: 0,
        }
    }

    /// Marks the state as modified. Every mutating entry point calls
    /// this; the next unlock will checkpoint.
    pub(crate) fn writing(&mut self) {
        self.modified = true;
    }

    /// Whether the state changed since the last checkpoint.
    pub fn modified(&self) -> bool {
        self.modified
    }

    /// Asks the engine loop for an ensure pass within `d` from now.
    pub fn ensure_before(&self, d: Duration) {
        if let Some(backend) = &self.backend {
            backend.ensure_before(d);
        }
    }

    // --- Custom key/value data -------------------------------------------

    /// Typed read of the custom data entry for `key`. Returns
    /// [`StateError::NoState`] when absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        let Some(value) = self.data.get(key) else {
            return Err(StateError::NoState { key: key.into() });
        };
        serde_json::from_value(value.clone()).map_err(StateError::Read)
    }

    /// Whether a custom data entry exists for `key`.
    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Associates a value with `key` for future consulting by managers.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) {
        self.writing();
        let encoded = serde_json::to_value(value)
            .unwrap_or_else(|e| panic!("internal error: cannot marshal state entry {key:?}: {e}"));
        self.data.insert(key.to_string(), encoded);
    }

    /// Removes the custom data entry for `key`.
    pub fn unset(&mut self, key: &str) {
        self.writing();
        self.data.remove(key);
    }

    // --- Id allocation ----------------------------------------------------

    pub(crate) fn next_change_id(&mut self) -> String {
        self.last_change_id += 1;
        self.last_change_id.to_string()
    }

    pub(crate) fn next_task_id(&mut self) -> String {
        self.last_task_id += 1;
        self.last_task_id.to_string()
    }

    pub(crate) fn next_notice_id(&mut self) -> String {
        self.last_notice_id += 1;
        self.last_notice_id.to_string()
    }

    /// Allocates a new lane id (rollback group).
    pub fn new_lane(&mut self) -> u64 {
        self.writing();
        self.last_lane_id += 1;
        self.last_lane_id
    }

    // --- Status observers -------------------------------------------------

    /// Registers an observer of task status transitions; returns an id
    /// for removal. Observers run under the state lock: keep them simple,
    /// non-blocking, and free of I/O.
    pub fn add_task_status_changed_handler(&mut self, f: TaskStatusHandler) -> u64 {
        let id = self.last_handler_id;
        self.last_handler_id += 1;
        self.task_handlers.insert(id, f);
        id
    }

    pub fn remove_task_status_changed_handler(&mut self, id: u64) {
        self.task_handlers.remove(&id);
    }

    /// Registers an observer of change status transitions; same rules as
    /// [`State::add_task_status_changed_handler`].
    pub fn add_change_status_changed_handler(&mut self, f: ChangeStatusHandler) -> u64 {
        let id = self.last_handler_id;
        self.last_handler_id += 1;
        self.change_handlers.insert(id, f);
        id
    }

    pub fn remove_change_status_changed_handler(&mut self, id: u64) {
        self.change_handlers.remove(&id);
    }

    pub(crate) fn notify_task_status_changed(&mut self, task_id: &str, old: Status, new: Status) {
        let handlers = std::mem::take(&mut self.task_handlers);
        if let Some(task) = self.tasks.get(task_id) {
            for f in handlers.values() {
                f(task, old, new);
            }
        }
        self.task_handlers = handlers;
    }

    pub(crate) fn notify_change_status_changed(
        &mut self,
        change_id: &str,
        old: Status,
        new: Status,
    ) {
        let handlers = std::mem::take(&mut self.change_handlers);
        if let Some(change) = self.changes.get(change_id) {
            for f in handlers.values() {
                f(change, old, new);
            }
        }
        self.change_handlers = handlers;
    }

    /// Registers a predicate that vetoes the pruner's abort of old
    /// unready changes carrying the `attr` data entry.
    pub fn register_pending_change_by_attr(&mut self, attr: &str, f: PendingPredicate) {
        self.pending_change_by_attr.insert(attr.to_string(), f);
    }

    // --- Pruning ----------------------------------------------------------

    /// Retention sweep over changes, tasks, and notices.
    ///
    /// - Ready changes older than `prune_wait` are dropped with their
    ///   tasks, as are the oldest ready changes beyond `max_ready_changes`.
    /// - Unready changes older than `abort_wait` get their unready lanes
    ///   aborted, unless a registered pending predicate vetoes it.
    /// - Task-less unready changes older than `prune_wait` are dropped.
    /// - Unlinked tasks older than `prune_wait` are dropped.
    /// - Expired notices are dropped, as are `change-update` notices whose
    ///   change no longer exists; the newest `max_notices` survive.
    pub fn prune(
        &mut self,
        start_of_operation: DateTime<Utc>,
        prune_wait: Duration,
        abort_wait: Duration,
        max_ready_changes: usize,
        max_notices: usize,
    ) {
        let now = Utc::now();
        let prune_limit = now - chrono::Duration::from_std(prune_wait).unwrap_or_default();
        let abort_limit = now - chrono::Duration::from_std(abort_wait).unwrap_or_default();

        // Oldest ready changes first; unready changes lead the list.
        let mut changes: Vec<(String, Option<DateTime<Utc>>, DateTime<Utc>, usize)> = self
            .changes
            .values()
            .map(|c| {
                (
                    c.id.clone(),
                    c.ready_time,
                    c.spawn_time,
                    c.task_ids.len(),
                )
            })
            .collect();
        changes.sort_by_key(|(_, ready, _, _)| *ready);
        let mut ready_count = changes.iter().filter(|(_, r, _, _)| r.is_some()).count();

        let mut pruned_changes = 0usize;
        'next_change: for (id, ready_time, spawn_time, task_count) in changes {
            let spawn_time = spawn_time.max(start_of_operation);
            let Some(ready_time) = ready_time else {
                if spawn_time < prune_limit && task_count == 0 {
                    self.abort_change(&id);
                    self.writing();
                    self.changes.remove(&id);
                    pruned_changes += 1;
                } else if spawn_time < abort_limit {
                    let predicates = std::mem::take(&mut self.pending_change_by_attr);
                    let vetoed = self.changes.get(&id).is_some_and(|chg| {
                        predicates
                            .iter()
                            .any(|(attr, pending)| chg.has(attr) && pending(chg))
                    });
                    self.pending_change_by_attr = predicates;
                    if vetoed {
                        continue 'next_change;
                    }
                    self.abort_unready_lanes(&id);
                }
                continue;
            };
            if ready_time < prune_limit || ready_count > max_ready_changes {
                self.writing();
                if let Some(change) = self.changes.remove(&id) {
                    for task_id in &change.task_ids {
                        self.tasks.remove(task_id);
                    }
                }
                pruned_changes += 1;
                ready_count -= 1;
            }
        }

        // Unlinked tasks.
        let stale_tasks: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.change.is_none() && t.spawn_time.max(start_of_operation) < prune_limit)
            .map(|t| t.id.clone())
            .collect();
        for id in &stale_tasks {
            self.writing();
            self.tasks.remove(id);
        }

        // Expired notices and orphaned change-update notices.
        let mut pruned_notices = 0usize;
        let stale_notices: Vec<NoticeKey> = self
            .notices
            .values()
            .filter(|n| {
                n.expired(now)
                    || (n.notice_type == NoticeType::ChangeUpdate
                        && !self.changes.contains_key(&n.key))
            })
            .map(|n| n.dedupe_key())
            .collect();
        for key in &stale_notices {
            self.writing();
            self.notices.remove(key);
            pruned_notices += 1;
        }

        if self.notices.len() > max_notices {
            let mut by_age: Vec<(DateTime<Utc>, NoticeKey)> = self
                .notices
                .values()
                .map(|n| (n.last_occurred, n.dedupe_key()))
                .collect();
            by_age.sort_by_key(|(t, _)| *t);
            let excess = self.notices.len() - max_notices;
            for (_, key) in by_age.into_iter().take(excess) {
                self.writing();
                self.notices.remove(&key);
                pruned_notices += 1;
            }
        }

        self.refresh_latest_warning_time();
        if pruned_changes > 0 || pruned_notices > 0 {
            debug!(pruned_changes, pruned_notices, "pruned state");
        }
    }

    // --- Serialization ----------------------------------------------------

    fn to_marshalled(&self) -> MarshalledState {
        MarshalledState {
            data: self.data.clone(),
            changes: self.changes.clone(),
            tasks: self.tasks.clone(),
            notices: self.notices.values().cloned().collect(),
            identities: self.identities.clone(),
            last_change_id: self.last_change_id,
            last_task_id: self.last_task_id,
            last_lane_id: self.last_lane_id,
            last_notice_id: self.last_notice_id,
        }
    }

    pub(crate) fn checkpoint_data(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_marshalled())
            .unwrap_or_else(|e| panic!("internal error: cannot marshal state: {e}"))
    }

    fn from_marshalled(backend: Option<Arc<dyn Backend>>, m: MarshalledState) -> State {
        let mut state = State::empty(backend);
        state.data = m.data;
        // Trust the embedded ids over the map keys; re-key accordingly.
        state.changes = m.changes.into_values().map(|c| (c.id.clone(), c)).collect();
        state.tasks = m.tasks.into_values().map(|t| (t.id.clone(), t)).collect();
        state.notices = m.notices.into_iter().map(|n| (n.dedupe_key(), n)).collect();
        state.identities = m
            .identities
            .into_iter()
            .map(|(name, mut identity)| {
                identity.name = name.clone();
                (name, identity)
            })
            .collect();
        state.last_change_id = m.last_change_id;
        state.last_task_id = m.last_task_id;
        state.last_lane_id = m.last_lane_id;
        state.last_notice_id = m.last_notice_id;
        state.refresh_latest_warning_time();
        state.modified = false;
        state
    }
}

/// The single exclusive lock guarding a [`State`].
pub struct StateLock {
    inner: Mutex<State>,
}

impl StateLock {
    /// Creates a fresh state checkpointing through `backend`.
    pub fn new(backend: Arc<dyn Backend>) -> StateLock {
        StateLock {
            inner: Mutex::new(State::empty(Some(backend))),
        }
    }

    /// Creates a fresh state with no persistence (tests, tooling).
    pub fn in_memory() -> StateLock {
        StateLock {
            inner: Mutex::new(State::empty(None)),
        }
    }

    /// Reconstructs a state from a serialized snapshot.
    ///
    /// Transient fields (observers, caches, pending predicates) start
    /// empty; the store is unmodified until the first mutation.
    pub fn read(backend: Arc<dyn Backend>, reader: impl Read) -> Result<StateLock, StateError> {
        let m: MarshalledState = serde_json::from_reader(reader)?;
        Ok(StateLock {
            inner: Mutex::new(State::from_marshalled(Some(backend), m)),
        })
    }

    /// Acquires the state lock. Dropping the returned guard releases the
    /// lock and checkpoints if the state was modified.
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            lock: self,
            guard: Some(self.inner.lock().unwrap_or_else(|e| e.into_inner())),
        }
    }

    /// Overrides the checkpoint retry policy (tests shorten it).
    pub fn set_checkpoint_retry(&self, retry: CheckpointRetry) {
        let mut st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        st.retry = retry;
    }
}

/// Exclusive access token for the state; unlocking checkpoints.
pub struct StateGuard<'a> {
    lock: &'a StateLock,
    guard: Option<MutexGuard<'a, State>>,
}

impl StateGuard<'_> {
    /// Releases the lock (checkpointing as usual), runs `f`, and
    /// re-acquires the lock before returning.
    ///
    /// This is the scoped unlocker for slow I/O inside handlers: the lock
    /// is guaranteed to be re-acquired on all exit paths, since `f` has
    /// no way to keep the unlocked token.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let mut guard = self.guard.take().expect("state guard already released");
        checkpoint_on_unlock(&mut guard);
        drop(guard);
        let result = f();
        self.guard = Some(self.lock.inner.lock().unwrap_or_else(|e| e.into_inner()));
        result
    }
}

impl std::ops::Deref for StateGuard<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        self.guard.as_ref().expect("state guard already released")
    }
}

impl std::ops::DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut State {
        self.guard.as_mut().expect("state guard already released")
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            checkpoint_on_unlock(&mut guard);
        }
    }
}

/// The unlock path: serialise and hand the snapshot to the backend,
/// retrying per the state's retry policy.
///
/// # Panics
/// Panics when the backend keeps failing past the retry window; a state
/// that cannot persist must not keep running.
fn checkpoint_on_unlock(state: &mut State) {
    if !state.modified {
        return;
    }
    let Some(backend) = state.backend.clone() else {
        return;
    };
    if !backend.needs_checkpoint() {
        state.modified = false;
        return;
    }

    let data = state.checkpoint_data();
    let start = Instant::now();
    let mut last_err: Option<std::io::Error> = None;
    while start.elapsed() <= state.retry.max_time {
        match backend.checkpoint(&data) {
            Ok(()) => {
                state.modified = false;
                return;
            }
            Err(e) => {
                warn!(error = %e, "cannot write state file, retrying");
                last_err = Some(e);
            }
        }
        std::thread::sleep(state.retry.interval);
    }
    panic!(
        "cannot checkpoint even after {:?} of retries every {:?}: {}",
        state.retry.max_time,
        state.retry.interval,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    );
}
