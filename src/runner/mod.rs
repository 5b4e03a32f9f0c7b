//! # Task runner: concurrent do/undo execution with lane rollback.
//!
//! The [`TaskRunner`] walks the state's non-terminal tasks on every
//! [`ensure`](TaskRunner::ensure) pass, spawns the eligible ones as
//! independent tokio tasks, and applies the do/undo state table when each
//! handler returns.
//!
//! ```text
//! ensure():
//!   Do      ──(wait-for all Done, handler known)──► spawn do   ──► Doing
//!   Undo    ──(halt tasks all terminal)───────────► spawn undo ──► Undoing
//!   Do/Undo ──(no handler registered)─────────────► Hold (parked)
//!
//! handler returns:
//!   do   Ok        ──► Done
//!   do   Canceled  ──► Hold (resumable), or Error if its lane is aborting
//!   do   Err       ──► Error, lanes abort: Do──►Abort, Done──►Undo,
//!                      running peers cancelled
//!   undo Ok        ──► Undone
//!   undo Err/Canceled ──► Error
//! ```
//!
//! ## Rules
//! - Every handler runs with a cancellation token derived from its
//!   change's token; cancelling a change cancels all its tasks.
//! - A panicking handler is caught and treated as a failure.
//! - Undo order is the reverse of the wait-for topology: a task's undo
//!   only runs once every task waiting on it has quiesced.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::state::{StateLock, Status};

pub mod handler;

pub use handler::{handler_fn, BoxHandlerFuture, HandlerFn, TaskHandle};

/// Which side of a handler pair a spawned invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Do,
    Undo,
}

struct HandlerPair {
    do_fn: HandlerFn,
    undo_fn: Option<HandlerFn>,
}

struct RunningHandler {
    token: CancellationToken,
}

/// Executes do/undo handlers for the tasks in a state store.
pub struct TaskRunner {
    state: Arc<StateLock>,
    handlers: DashMap<String, HandlerPair>,
    running: DashMap<String, RunningHandler>,
    change_tokens: DashMap<String, CancellationToken>,
    /// Tasks parked in `Hold` because no handler was registered for their
    /// kind, with the direction to resume in.
    parked: DashMap<String, Direction>,
    /// Running tasks cancelled because their lane aborted; their
    /// `Canceled` result maps to `Error` instead of `Hold`.
    abort_cancelled: DashSet<String>,
    runtime_token: CancellationToken,
    tracker: TaskTracker,
}

impl TaskRunner {
    /// Creates a runner over the given state.
    pub fn new(state: Arc<StateLock>) -> Arc<TaskRunner> {
        Arc::new(TaskRunner {
            state,
            handlers: DashMap::new(),
            running: DashMap::new(),
            change_tokens: DashMap::new(),
            parked: DashMap::new(),
            abort_cancelled: DashSet::new(),
            runtime_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// The state this runner drives.
    pub fn state(&self) -> &Arc<StateLock> {
        &self.state
    }

    /// Registers the do/undo handler pair for a task kind.
    ///
    /// Tasks of this kind that were parked in `Hold` for want of a
    /// handler return to their previous direction on the next ensure
    /// pass.
    pub fn add_handler(&self, kind: &str, do_fn: HandlerFn, undo_fn: Option<HandlerFn>) {
        self.handlers
            .insert(kind.to_string(), HandlerPair { do_fn, undo_fn });

        let revive: Vec<(String, Direction)> = {
            let st = self.state.lock();
            self.parked
                .iter()
                .filter(|entry| {
                    st.task(entry.key())
                        .is_some_and(|t| t.kind() == kind && t.status() == Status::Hold)
                })
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect()
        };
        if revive.is_empty() {
            return;
        }
        let mut st = self.state.lock();
        for (task_id, direction) in revive {
            self.parked.remove(&task_id);
            let status = match direction {
                Direction::Do => Status::Do,
                Direction::Undo => Status::Undo,
            };
            st.set_task_status(&task_id, status);
        }
        st.ensure_before(std::time::Duration::ZERO);
    }

    /// Walks all non-terminal tasks and spawns every eligible one.
    ///
    /// Called by the engine loop periodically and by the runner itself
    /// whenever a handler finishes. Idempotent: already-running tasks are
    /// skipped.
    pub fn ensure(self: &Arc<Self>) {
        if self.runtime_token.is_cancelled() {
            return;
        }

        struct Snap {
            id: String,
            kind: String,
            status: Status,
            wait_tasks: Vec<String>,
            halt_tasks: Vec<String>,
            change_id: String,
        }

        let mut to_spawn: Vec<(String, CancellationToken, Direction, HandlerFn)> = Vec::new();
        {
            let mut st = self.state.lock();
            let snaps: Vec<Snap> = st
                .tasks()
                .iter()
                .map(|t| Snap {
                    id: t.id().to_string(),
                    kind: t.kind().to_string(),
                    status: t.status(),
                    wait_tasks: t.wait_tasks().to_vec(),
                    halt_tasks: t.halt_tasks().to_vec(),
                    change_id: t.change_id().unwrap_or_default().to_string(),
                })
                .collect();

            for snap in snaps {
                if self.running.contains_key(&snap.id) {
                    continue;
                }
                // Doing/Undoing without a running handler means the
                // process restarted mid-task; run the handler again.
                let direction = match snap.status {
                    Status::Do | Status::Doing => Direction::Do,
                    Status::Undo | Status::Undoing => Direction::Undo,
                    Status::Hold => match self.parked.get(&snap.id) {
                        Some(dir) if self.handlers.contains_key(&snap.kind) => *dir,
                        _ => continue,
                    },
                    _ => continue,
                };

                let eligible = match direction {
                    Direction::Do => snap
                        .wait_tasks
                        .iter()
                        .all(|id| st.task(id).is_none_or(|t| t.status() == Status::Done)),
                    Direction::Undo => snap
                        .halt_tasks
                        .iter()
                        .all(|id| st.task(id).is_none_or(|t| t.status().ready())),
                };
                if !eligible {
                    continue;
                }

                let fns = self
                    .handlers
                    .get(&snap.kind)
                    .map(|pair| (pair.do_fn.clone(), pair.undo_fn.clone()));
                let Some((do_fn, undo_fn)) = fns else {
                    debug!(task = %snap.id, kind = %snap.kind, "no handler registered, parking task");
                    self.parked.insert(snap.id.clone(), direction);
                    st.set_task_status(&snap.id, Status::Hold);
                    continue;
                };
                self.parked.remove(&snap.id);

                let (handler, running_status) = match direction {
                    Direction::Do => (do_fn, Status::Doing),
                    Direction::Undo => match undo_fn {
                        Some(undo) => (undo, Status::Undoing),
                        None => {
                            // Nothing to undo; resolved immediately.
                            st.set_task_status(&snap.id, Status::Undone);
                            continue;
                        }
                    },
                };
                st.set_task_status(&snap.id, running_status);
                // Register as running before the lock drops, so a
                // concurrent ensure pass cannot spawn the task twice.
                let token = self.change_token(&snap.change_id).child_token();
                self.running.insert(
                    snap.id.clone(),
                    RunningHandler {
                        token: token.clone(),
                    },
                );
                to_spawn.push((snap.id, token, direction, handler));
            }
        }

        for (task_id, token, direction, handler) in to_spawn {
            self.spawn_handler(task_id, token, direction, handler);
        }
    }

    fn spawn_handler(
        self: &Arc<Self>,
        task_id: String,
        token: CancellationToken,
        direction: Direction,
        handler: HandlerFn,
    ) {
        let runner = Arc::clone(self);
        let handle = TaskHandle::new(Arc::clone(&self.state), task_id.clone());
        self.tracker.spawn(async move {
            let fut = handler(handle, token);
            let result = match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "handler panicked".to_string());
                    Err(TaskError::Fail {
                        reason: format!("handler panicked: {reason}"),
                    })
                }
            };
            runner.task_finished(&task_id, direction, result);
        });
    }

    /// Applies the do/undo state table for a finished handler and kicks
    /// the next ensure pass.
    fn task_finished(self: &Arc<Self>, task_id: &str, direction: Direction, result: Result<(), TaskError>) {
        self.running.remove(task_id);
        let was_abort_cancelled = self.abort_cancelled.remove(task_id).is_some();

        {
            let mut st = self.state.lock();
            let Some(task) = st.task(task_id) else {
                return;
            };
            let kind = task.kind().to_string();
            let lanes = task.lanes().to_vec();
            let change_id = task.change_id().unwrap_or_default().to_string();

            let new_status = match (direction, &result) {
                (Direction::Do, Ok(())) => Status::Done,
                (Direction::Do, Err(TaskError::Canceled)) => {
                    if was_abort_cancelled {
                        Status::Error
                    } else {
                        Status::Hold
                    }
                }
                (Direction::Do, Err(TaskError::Hold { .. })) => Status::Hold,
                (Direction::Do, Err(_)) => Status::Error,
                (Direction::Undo, Ok(())) => Status::Undone,
                (Direction::Undo, Err(_)) => Status::Error,
            };

            if let Err(e) = &result {
                if !e.is_cancellation() {
                    warn!(task = %task_id, kind = %kind, error = %e, "task handler failed");
                    st.task_set(task_id, "last-error", &e.to_string());
                }
            }
            st.set_task_status(task_id, new_status);

            // A genuine do failure rolls its lanes back.
            if direction == Direction::Do
                && new_status == Status::Error
                && !change_id.is_empty()
            {
                let aborted = st.abort_change_lanes(&change_id, lanes);
                self.cancel_running_in_lanes(&st, &change_id, &aborted);
            }
            st.ensure_before(std::time::Duration::ZERO);
        }

        self.ensure();
    }

    /// Cancels every running task of `change_id` caught in the aborted
    /// lanes, marking it so its `Canceled` result resolves to `Error`.
    fn cancel_running_in_lanes(
        &self,
        st: &crate::state::State,
        change_id: &str,
        aborted: &[u64],
    ) {
        for entry in self.running.iter() {
            let Some(task) = st.task(entry.key()) else {
                continue;
            };
            if task.change_id() != Some(change_id) {
                continue;
            }
            if task.lanes().iter().any(|l| aborted.contains(l)) {
                self.abort_cancelled.insert(entry.key().clone());
                entry.value().token.cancel();
            }
        }
    }

    /// Cancels all tasks of a change. Handlers observe their tokens and
    /// return promptly; cancelled tasks park in `Hold` (resumable).
    pub fn cancel_change(&self, change_id: &str) {
        if let Some(token) = self.change_tokens.get(change_id) {
            token.cancel();
        }
    }

    /// Aborts a change outright: unstarted tasks are skipped, finished
    /// ones are undone, running ones are cancelled and finish `Error`.
    pub fn abort_change(self: &Arc<Self>, change_id: &str) {
        {
            let mut st = self.state.lock();
            let lanes: Vec<u64> = st
                .change(change_id)
                .map(|c| c.task_ids().to_vec())
                .unwrap_or_default()
                .iter()
                .filter_map(|id| st.task(id))
                .flat_map(|t| t.lanes().iter().copied())
                .collect();
            if lanes.is_empty() {
                st.abort_change(change_id);
            } else {
                let aborted = st.abort_change_lanes(change_id, lanes);
                self.cancel_running_in_lanes(&st, change_id, &aborted);
            }
        }
        self.ensure();
    }

    /// The cancellation token shared by all tasks of a change.
    fn change_token(&self, change_id: &str) -> CancellationToken {
        self.change_tokens
            .entry(change_id.to_string())
            .or_insert_with(|| self.runtime_token.child_token())
            .clone()
    }

    /// Number of handler invocations currently in flight.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Stops the runner: cancels every in-flight handler and waits for
    /// all of them to observe termination.
    pub async fn stop(&self) {
        self.runtime_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
