//! # Error types used by the planvisor core.
//!
//! This module defines the error taxonomies of the crate:
//!
//! - [`PlanError`] errors raised while parsing, combining, or validating plan layers.
//! - [`StateError`] errors raised by the state store.
//! - [`TaskError`] errors raised by task do/undo handlers.
//! - [`PairingError`] errors raised by the pairing manager and its controllers.
//!
//! Every type provides `as_label()` for stable log/metric labels.
//! [`TaskError`] additionally distinguishes cancellation from failure via
//! [`TaskError::is_cancellation`].

use std::time::Duration;

use thiserror::Error;

/// # Errors produced by the plan layer model.
///
/// Validation errors are always detected before a combined plan is
/// published, so a returned `PlanError` implies no state mutation.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PlanError {
    /// A layer, section, or entry has a format problem (bad YAML, missing
    /// override, invalid field value, dependency cycle, ...).
    #[error("{message}")]
    Format {
        /// Human-readable description of the problem.
        message: String,
    },

    /// A layer with this label already exists (returned by append).
    #[error("layer {label:?} already exists")]
    LabelExists {
        /// The duplicate layer label.
        label: String,
    },

    /// No layer with this label exists (returned by update).
    #[error("layer {label:?} not found")]
    LabelMissing {
        /// The missing layer label.
        label: String,
    },

    /// Reading the layers directory or a layer file failed.
    #[error("cannot read plan layers: {0}")]
    ReadLayers(#[from] std::io::Error),
}

impl PlanError {
    /// Builds a [`PlanError::Format`] from anything displayable.
    pub fn format(message: impl Into<String>) -> Self {
        PlanError::Format {
            message: message.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            PlanError::Format { .. } => "plan_format",
            PlanError::LabelExists { .. } => "plan_label_exists",
            PlanError::LabelMissing { .. } => "plan_label_missing",
            PlanError::ReadLayers(_) => "plan_read_layers",
        }
    }
}

/// # Errors produced by the state store.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StateError {
    /// No state entry exists for the given key.
    ///
    /// This is the semantic "absent" case; callers treat it as expected.
    #[error("no state entry for key {key:?}")]
    NoState {
        /// The key for which no entry could be found.
        key: String,
    },

    /// A change or task id does not exist in the store.
    #[error("no {kind} with id {id:?}")]
    NoSuchId {
        /// `"change"` or `"task"`.
        kind: &'static str,
        /// The id that could not be resolved.
        id: String,
    },

    /// A request is structurally invalid (bad identity, conflict, ...).
    #[error("{message}")]
    Invalid {
        /// Human-readable description of the problem.
        message: String,
    },

    /// The serialized state document could not be decoded.
    #[error("cannot read state: {0}")]
    Read(#[from] serde_json::Error),
}

impl StateError {
    /// Returns true when the error is the semantic "no entry" case.
    pub fn is_no_state(&self) -> bool {
        matches!(self, StateError::NoState { .. })
    }

    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            StateError::NoState { .. } => "state_no_entry",
            StateError::NoSuchId { .. } => "state_no_such_id",
            StateError::Invalid { .. } => "state_invalid",
            StateError::Read(_) => "state_read",
        }
    }
}

/// # Errors produced by task do/undo handlers.
///
/// A handler returning [`TaskError::Canceled`] or [`TaskError::Hold`] signals
/// intentional termination; everything else is a failure that marks the task
/// `Error` and aborts its lanes.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TaskError {
    /// Handler execution exceeded a deadline it imposed on itself.
    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Non-recoverable failure.
    #[error("fatal error: {reason}")]
    Fatal { reason: String },

    /// Ordinary handler failure.
    #[error("execution failed: {reason}")]
    Fail { reason: String },

    /// The handler observed its cancellation token and stopped.
    ///
    /// This is **not an error** in the traditional sense; the runner maps it
    /// to `Hold` (resumable) unless the task's lane is already aborting.
    #[error("task canceled")]
    Canceled,

    /// The handler wants the task parked in `Hold` without failing it.
    #[error("task on hold: {reason}")]
    Hold { reason: String },
}

impl TaskError {
    /// Builds an ordinary failure from anything displayable.
    pub fn fail(reason: impl Into<String>) -> Self {
        TaskError::Fail {
            reason: reason.into(),
        }
    }

    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Timeout { .. } => "task_timeout",
            TaskError::Fatal { .. } => "task_fatal",
            TaskError::Fail { .. } => "task_failed",
            TaskError::Canceled => "task_canceled",
            TaskError::Hold { .. } => "task_hold",
        }
    }

    /// Returns true when the error signals cooperative termination rather
    /// than a failure (no lane rollback is triggered).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TaskError::Canceled | TaskError::Hold { .. })
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Fail {
            reason: e.to_string(),
        }
    }
}

impl From<StateError> for TaskError {
    fn from(e: StateError) -> Self {
        TaskError::Fail {
            reason: e.to_string(),
        }
    }
}

/// # Errors produced by the pairing manager and pairing controllers.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PairingError {
    /// The pairing window could not be opened.
    #[error("cannot enable pairing: {reason}")]
    EnableRefused {
        /// Why the window stays closed.
        reason: String,
    },

    /// The pairing window could not be closed.
    #[error("cannot disable pairing: {reason}")]
    DisableRefused {
        /// Why the window stays open.
        reason: String,
    },

    /// A controller rejected its configuration.
    #[error("pairing controller {controller:?}: {reason}")]
    Controller {
        /// The controller type name.
        controller: String,
        /// What went wrong.
        reason: String,
    },
}

impl PairingError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            PairingError::EnableRefused { .. } => "pairing_enable_refused",
            PairingError::DisableRefused { .. } => "pairing_disable_refused",
            PairingError::Controller { .. } => "pairing_controller",
        }
    }
}
