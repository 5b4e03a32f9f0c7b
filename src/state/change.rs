//! # Changes: units of intent composed of tasks.
//!
//! A [`Change`] groups the tasks that together carry out one piece of
//! intended work (a service replan, a firmware refresh, ...). Its status
//! is derived from its tasks; it becomes **ready** exactly when every
//! task is in a terminal status.
//!
//! Lane rollback lives here: [`State::abort_change_lanes`] flips
//! not-yet-started tasks to `Abort` and schedules `Undo` for the tasks
//! that already finished `Done`; the runner picks the undos up in reverse
//! wait-for order.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StateError;
use crate::state::notice::NoticeType;
use crate::state::status::{derive_change_status, Status};
use crate::state::store::State;
use crate::state::task::TaskSet;

/// A unit of intended work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Change {
    pub(crate) id: String,
    pub(crate) kind: String,
    pub(crate) summary: String,
    /// Explicit status override; `None` means derived from tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) status: Option<Status>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) data: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) task_ids: Vec<String>,
    pub(crate) spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) ready_time: Option<DateTime<Utc>>,
}

impl Change {
    pub(crate) fn new(id: String, kind: &str, summary: &str, now: DateTime<Utc>) -> Change {
        Change {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            status: None,
            data: BTreeMap::new(),
            task_ids: Vec::new(),
            spawn_time: now,
            ready_time: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn task_ids(&self) -> &[String] {
        &self.task_ids
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    /// When the change became ready, if it has.
    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    /// Typed read of a per-change data entry.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        let Some(value) = self.data.get(key) else {
            return Err(StateError::NoState { key: key.into() });
        };
        serde_json::from_value(value.clone()).map_err(StateError::Read)
    }

    /// Whether a per-change data entry exists.
    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}

impl State {
    /// Adds a new change to the state.
    pub fn new_change(&mut self, kind: &str, summary: &str) -> String {
        self.new_change_with_notice_data(kind, summary, BTreeMap::new())
    }

    /// Adds a new change, attaching extra key/value data to the
    /// `change-update` notices it emits over its lifetime.
    pub fn new_change_with_notice_data(
        &mut self,
        kind: &str,
        summary: &str,
        notice_data: BTreeMap<String, String>,
    ) -> String {
        self.writing();
        let id = self.next_change_id();
        let change = Change::new(id.clone(), kind, summary, Utc::now());
        self.changes.insert(id.clone(), change);
        if !notice_data.is_empty() {
            self.change_set(&id, "notice-data", &notice_data);
        }
        self.record_change_update_notice(&id);
        id
    }

    /// Returns the change for the given id.
    pub fn change(&self, id: &str) -> Option<&Change> {
        self.changes.get(id)
    }

    /// All changes currently known to the state, ordered by id.
    pub fn changes(&self) -> Vec<&Change> {
        let mut changes: Vec<&Change> = self.changes.values().collect();
        changes.sort_by_key(|c| c.id.parse::<u64>().unwrap_or(u64::MAX));
        changes
    }

    /// Stores a typed per-change data entry.
    pub fn change_set<T: Serialize>(&mut self, change_id: &str, key: &str, value: &T) {
        self.writing();
        if let Some(change) = self.changes.get_mut(change_id) {
            let encoded = serde_json::to_value(value).unwrap_or_else(|e| {
                panic!("internal error: cannot marshal change entry {key:?}: {e}")
            });
            change.data.insert(key.to_string(), encoded);
        }
    }

    /// Links a task to a change.
    pub fn change_add_task(&mut self, change_id: &str, task_id: &str) {
        self.writing();
        let Some(change) = self.changes.get_mut(change_id) else {
            return;
        };
        if !change.task_ids.iter().any(|t| t == task_id) {
            change.task_ids.push(task_id.to_string());
        }
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.change = Some(change_id.to_string());
        }
    }

    /// Links every task of a [`TaskSet`] to a change.
    pub fn change_add_all(&mut self, change_id: &str, tasks: &TaskSet) {
        for task_id in tasks.task_ids() {
            self.change_add_task(change_id, task_id);
        }
    }

    /// The change's current status: the explicit override when set,
    /// otherwise derived from its tasks.
    pub fn change_status(&self, change_id: &str) -> Status {
        let Some(change) = self.changes.get(change_id) else {
            return Status::Hold;
        };
        if let Some(status) = change.status {
            return status;
        }
        derive_change_status(
            change
                .task_ids
                .iter()
                .filter_map(|id| self.tasks.get(id))
                .map(|t| t.status),
        )
    }

    /// Whether every task of the change is in a terminal status.
    pub fn change_is_ready(&self, change_id: &str) -> bool {
        self.change_status(change_id).ready()
    }

    /// Aborts the whole change: every lane its tasks belong to.
    ///
    /// A task-less change is parked in `Hold` directly.
    pub fn abort_change(&mut self, change_id: &str) {
        self.writing();
        let Some(change) = self.changes.get(change_id) else {
            return;
        };
        if change.task_ids.is_empty() {
            let old = self.change_status(change_id);
            let change = self.changes.get_mut(change_id).expect("change just looked up");
            change.status = Some(Status::Hold);
            self.change_status_maybe_changed(change_id, old);
            return;
        }
        let lanes: BTreeSet<u64> = change
            .task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .flat_map(|t| t.lanes().iter().copied())
            .collect();
        self.abort_change_lanes(change_id, lanes.into_iter().collect());
    }

    /// Aborts the given lanes of a change and every lane reachable from
    /// them through shared tasks.
    ///
    /// Effects on each task in an aborted lane:
    /// - `Do` → `Abort` (never started, skipped)
    /// - `Done` → `Undo` (queued for its undo handler)
    /// - running tasks are left for the runner, which cancels their
    ///   tokens and records the terminal status when they return.
    ///
    /// Returns the transitive closure of aborted lanes so the runner can
    /// cancel the running tasks caught in it.
    pub fn abort_change_lanes(&mut self, change_id: &str, lanes: Vec<u64>) -> Vec<u64> {
        self.writing();
        let Some(change) = self.changes.get(change_id) else {
            return Vec::new();
        };
        let task_ids = change.task_ids.clone();
        let old_status = self.change_status(change_id);

        // Expand transitively: aborting a lane aborts its tasks, which
        // drags every other lane those tasks belong to.
        let mut aborted: BTreeSet<u64> = BTreeSet::new();
        let mut frontier: Vec<u64> = lanes;
        while let Some(lane) = frontier.pop() {
            if !aborted.insert(lane) {
                continue;
            }
            for task_id in &task_ids {
                if let Some(task) = self.tasks.get(task_id) {
                    if task.lanes().contains(&lane) {
                        frontier.extend(task.lanes().iter().copied());
                    }
                }
            }
        }

        let mut flipped = Vec::new();
        for task_id in &task_ids {
            let Some(task) = self.tasks.get_mut(task_id) else {
                continue;
            };
            if !task.lanes().iter().any(|l| aborted.contains(l)) {
                continue;
            }
            let new = match task.status {
                Status::Do => Status::Abort,
                Status::Done => Status::Undo,
                _ => continue,
            };
            let old = task.status;
            task.status = new;
            if new.ready() {
                task.ready_time.get_or_insert_with(Utc::now);
            } else {
                task.ready_time = None;
            }
            flipped.push((task_id.clone(), old, new));
        }

        for (task_id, old, new) in flipped {
            self.notify_task_status_changed(&task_id, old, new);
        }
        self.change_status_maybe_changed(change_id, old_status);
        aborted.into_iter().collect()
    }

    /// Aborts every lane of the change that still has a non-terminal
    /// task. Lanes that already quiesced are left alone.
    pub fn abort_unready_lanes(&mut self, change_id: &str) {
        let Some(change) = self.changes.get(change_id) else {
            return;
        };
        let mut lane_unready: BTreeMap<u64, bool> = BTreeMap::new();
        for task_id in &change.task_ids {
            if let Some(task) = self.tasks.get(task_id) {
                for lane in task.lanes() {
                    let entry = lane_unready.entry(*lane).or_default();
                    *entry = *entry || !task.status.ready();
                }
            }
        }
        let lanes: Vec<u64> = lane_unready
            .into_iter()
            .filter_map(|(lane, unready)| unready.then_some(lane))
            .collect();
        if !lanes.is_empty() {
            self.abort_change_lanes(change_id, lanes);
        }
    }

    /// Recomputes a change's status after a task transition; when it
    /// moved, fires change observers, stamps the ready time, and records
    /// a `change-update` notice.
    pub(crate) fn change_status_maybe_changed(&mut self, change_id: &str, old: Status) {
        let new = self.change_status(change_id);
        if new == old {
            return;
        }
        let Some(change) = self.changes.get_mut(change_id) else {
            return;
        };
        if new.ready() {
            change.ready_time.get_or_insert_with(Utc::now);
        } else {
            change.ready_time = None;
        }
        self.notify_change_status_changed(change_id, old, new);
        self.record_change_update_notice(change_id);
    }

    /// Records the `change-update` notice for a change, merging in the
    /// change's `notice-data` entry when present.
    pub(crate) fn record_change_update_notice(&mut self, change_id: &str) {
        let Some(change) = self.changes.get(change_id) else {
            return;
        };
        let mut data = BTreeMap::new();
        data.insert("kind".to_string(), change.kind.clone());
        if let Ok(extra) = change.get::<BTreeMap<String, String>>("notice-data") {
            data.extend(extra);
        }
        self.record_notice(None, NoticeType::ChangeUpdate, change_id, data);
    }
}
