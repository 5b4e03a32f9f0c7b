//! # Tasks: single handler invocations within a change.
//!
//! A [`Task`] records one do/undo handler invocation: kind, summary,
//! status, progress, wait/halt edges to other tasks, lane membership, and
//! free-form per-task data. Tasks live in the state arena and refer to
//! their parent change and peer tasks by id; the [`State`] owns every
//! mutation so that status transitions fire the registered observers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StateError;
use crate::state::status::Status;
use crate::state::store::State;

/// Latest progress reported by a task handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    pub done: u64,
    pub total: u64,
}

/// A single handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Task {
    pub(crate) id: String,
    pub(crate) kind: String,
    pub(crate) summary: String,
    pub(crate) status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) data: BTreeMap<String, Value>,
    /// Tasks that must be `Done` before this task's do runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) wait_tasks: Vec<String>,
    /// Tasks waiting on this task (the reverse edges); their undo must be
    /// resolved before this task's undo runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) halt_tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) lanes: Vec<u64>,
    pub(crate) spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) ready_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) change: Option<String>,
}

impl Task {
    pub(crate) fn new(id: String, kind: &str, summary: &str, now: DateTime<Utc>) -> Task {
        Task {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            status: Status::Do,
            progress: None,
            data: BTreeMap::new(),
            wait_tasks: Vec::new(),
            halt_tasks: Vec::new(),
            lanes: Vec::new(),
            spawn_time: now,
            ready_time: None,
            change: None,
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

    pub fn status(&self) -> Status {
        self.status
    }

    /// The parent change id, if the task has been linked to a change.
    pub fn change_id(&self) -> Option<&str> {
        self.change.as_deref()
    }

    /// Tasks this task waits for before its do handler may run.
    pub fn wait_tasks(&self) -> &[String] {
        &self.wait_tasks
    }

    /// Tasks that wait on this task.
    pub fn halt_tasks(&self) -> &[String] {
        &self.halt_tasks
    }

    /// Lanes this task belongs to. A task in no explicit lane is in the
    /// implicit lane 0.
    pub fn lanes(&self) -> &[u64] {
        if self.lanes.is_empty() {
            const DEFAULT: &[u64] = &[0];
            DEFAULT
        } else {
            &self.lanes
        }
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    /// Latest reported progress. Defaults to `(current, 1)` done units
    /// when the handler never reported.
    pub fn progress(&self) -> Progress {
        match &self.progress {
            Some(p) if p.total > 0 && p.done <= p.total => p.clone(),
            _ => Progress {
                label: String::new(),
                done: if self.status == Status::Done { 1 } else { 0 },
                total: 1,
            },
        }
    }

    /// Typed read of a per-task data entry.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        let Some(value) = self.data.get(key) else {
            return Err(StateError::NoState { key: key.into() });
        };
        serde_json::from_value(value.clone()).map_err(StateError::Read)
    }
}

/// An ordered group of task ids, used to hand a set of freshly created
/// tasks to a change in one call.
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    task_ids: Vec<String>,
}

impl TaskSet {
    pub fn new(task_ids: Vec<String>) -> TaskSet {
        TaskSet { task_ids }
    }

    pub fn task_ids(&self) -> &[String] {
        &self.task_ids
    }
}

impl State {
    /// Creates a new task. It is usually linked to a change right after
    /// with [`State::change_add_task`] or [`State::change_add_all`].
    pub fn new_task(&mut self, kind: &str, summary: &str) -> String {
        self.writing();
        let id = self.next_task_id();
        let task = Task::new(id.clone(), kind, summary, Utc::now());
        self.tasks.insert(id.clone(), task);
        id
    }

    /// Returns the task for the given id, if it is linked to a change.
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id).filter(|t| t.change.is_some())
    }

    /// All tasks linked to changes.
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().filter(|t| t.change.is_some()).collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Number of tasks in the state, linked or not.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Declares that `task_id` must wait for `wait_id` to be `Done`
    /// before its do handler runs. Both directions of the edge are kept.
    pub fn task_wait_for(&mut self, task_id: &str, wait_id: &str) {
        self.writing();
        if let Some(task) = self.tasks.get_mut(task_id) {
            if !task.wait_tasks.iter().any(|t| t == wait_id) {
                task.wait_tasks.push(wait_id.to_string());
            }
        }
        if let Some(other) = self.tasks.get_mut(wait_id) {
            if !other.halt_tasks.iter().any(|t| t == task_id) {
                other.halt_tasks.push(task_id.to_string());
            }
        }
    }

    /// Adds the task to a lane (rollback group).
    pub fn task_join_lane(&mut self, task_id: &str, lane: u64) {
        self.writing();
        if let Some(task) = self.tasks.get_mut(task_id) {
            if !task.lanes.contains(&lane) {
                task.lanes.push(lane);
            }
        }
    }

    /// Stores a typed per-task data entry.
    pub fn task_set<T: Serialize>(&mut self, task_id: &str, key: &str, value: &T) {
        self.writing();
        if let Some(task) = self.tasks.get_mut(task_id) {
            let encoded = serde_json::to_value(value)
                .unwrap_or_else(|e| panic!("internal error: cannot marshal task entry {key:?}: {e}"));
            task.data.insert(key.to_string(), encoded);
        }
    }

    /// Records the latest progress for a task.
    pub fn task_set_progress(&mut self, task_id: &str, label: &str, done: u64, total: u64) {
        self.writing();
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.progress = Some(Progress {
                label: label.to_string(),
                done,
                total,
            });
        }
    }

    /// Sets a task's status, firing task observers and recomputing the
    /// parent change status (which in turn may fire change observers and
    /// record a `change-update` notice).
    pub fn set_task_status(&mut self, task_id: &str, new: Status) {
        self.writing();
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        let old = task.status;
        if old == new {
            return;
        }
        let change_id = task.change.clone();
        let old_change_status = change_id
            .as_deref()
            .and_then(|id| self.changes.get(id))
            .map(|c| self.change_status(&c.id));

        let task = self.tasks.get_mut(task_id).expect("task just looked up");
        task.status = new;
        if new.ready() {
            task.ready_time.get_or_insert_with(Utc::now);
        } else {
            task.ready_time = None;
        }

        self.notify_task_status_changed(task_id, old, new);

        if let (Some(change_id), Some(old_change_status)) = (change_id, old_change_status) {
            self.change_status_maybe_changed(&change_id, old_change_status);
        }
    }
}
