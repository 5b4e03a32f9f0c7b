//! # Task handlers and the handle they receive.
//!
//! A handler is an async closure invoked by the [`TaskRunner`](crate::runner::TaskRunner)
//! with a [`TaskHandle`] and a cancellation token. The handle is the only
//! thing a handler needs: it reaches the state store (locking per access),
//! the task's typed data, its progress, and its parent change.
//!
//! ## Rules
//! - Handlers **must not** hold the state lock across blocking work; lock,
//!   read or write, unlock, then do the slow part.
//! - Handlers **must** observe their cancellation token and return
//!   [`TaskError::Canceled`] promptly when it fires.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{StateError, TaskError};
use crate::state::StateLock;

/// Boxed future returned by a handler invocation.
pub type BoxHandlerFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send + 'static>>;

/// A do or undo handler: creates a fresh future per invocation.
pub type HandlerFn = Arc<dyn Fn(TaskHandle, CancellationToken) -> BoxHandlerFuture + Send + Sync>;

/// Wraps an async closure as a [`HandlerFn`].
///
/// ```no_run
/// use planvisor::runner::handler_fn;
/// use planvisor::TaskError;
///
/// let handler = handler_fn(|task, _token| async move {
///     task.set_progress("working", 1, 2);
///     Ok::<_, TaskError>(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(TaskHandle, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    Arc::new(move |handle, token| Box::pin(f(handle, token)))
}

/// Handle to the task a handler is running for.
///
/// Every method acquires the state lock for the duration of the call, so
/// the handle is safe to use from handler code without further locking.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<StateLock>,
    task_id: String,
}

impl TaskHandle {
    pub(crate) fn new(state: Arc<StateLock>, task_id: String) -> TaskHandle {
        TaskHandle { state, task_id }
    }

    /// The task id.
    pub fn id(&self) -> &str {
        &self.task_id
    }

    /// The state lock, for handlers that need multi-step transactions.
    pub fn state(&self) -> &Arc<StateLock> {
        &self.state
    }

    /// The task's kind.
    pub fn kind(&self) -> String {
        let st = self.state.lock();
        st.task(&self.task_id).map(|t| t.kind().to_string()).unwrap_or_default()
    }

    /// The parent change id.
    pub fn change_id(&self) -> Option<String> {
        let st = self.state.lock();
        st.task(&self.task_id).and_then(|t| t.change_id().map(str::to_string))
    }

    /// Typed read of a per-task data entry.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        let st = self.state.lock();
        let Some(task) = st.task(&self.task_id) else {
            return Err(StateError::NoSuchId {
                kind: "task",
                id: self.task_id.clone(),
            });
        };
        task.get(key)
    }

    /// Typed write of a per-task data entry.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        let mut st = self.state.lock();
        st.task_set(&self.task_id, key, value);
    }

    /// Typed read of a per-change data entry on the parent change.
    pub fn change_get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        let st = self.state.lock();
        let Some(change_id) = st.task(&self.task_id).and_then(|t| t.change_id()) else {
            return Err(StateError::NoSuchId {
                kind: "change",
                id: self.task_id.clone(),
            });
        };
        let Some(change) = st.change(change_id) else {
            return Err(StateError::NoSuchId {
                kind: "change",
                id: change_id.to_string(),
            });
        };
        change.get(key)
    }

    /// Typed write of a per-change data entry on the parent change.
    pub fn change_set<T: Serialize>(&self, key: &str, value: &T) {
        let mut st = self.state.lock();
        if let Some(change_id) = st.task(&self.task_id).and_then(|t| t.change_id().map(str::to_string)) {
            st.change_set(&change_id, key, value);
        }
    }

    /// Reports `(label, done, total)` progress; readers observe the
    /// latest value.
    pub fn set_progress(&self, label: &str, done: u64, total: u64) {
        let mut st = self.state.lock();
        st.task_set_progress(&self.task_id, label, done, total);
    }
}
