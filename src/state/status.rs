//! # Task and change statuses.
//!
//! [`Status`] is shared between tasks and changes. A change's status is
//! never stored directly (unless explicitly overridden); it is derived
//! from its tasks' statuses by [`derive_change_status`].

use serde::{Deserialize, Serialize};

/// Status of a task, and by derivation of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// Queued for its do handler.
    Do,
    /// Do handler running.
    Doing,
    /// Do handler finished successfully. Terminal.
    Done,
    /// Skipped because its lane aborted before it started. Terminal.
    Abort,
    /// Queued for its undo handler after a lane abort.
    Undo,
    /// Undo handler running.
    Undoing,
    /// Undo handler finished successfully. Terminal.
    Undone,
    /// Parked: cancelled-but-resumable, or waiting for a handler to be
    /// registered. Terminal for readiness purposes.
    Hold,
    /// Do or undo handler failed. Terminal.
    Error,
}

impl Status {
    /// Returns true when the status is terminal: the task will not move
    /// again without outside intervention.
    pub fn ready(&self) -> bool {
        matches!(
            self,
            Status::Done | Status::Undone | Status::Hold | Status::Error | Status::Abort
        )
    }

    /// Stable lowercase label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Status::Do => "do",
            Status::Doing => "doing",
            Status::Done => "done",
            Status::Abort => "abort",
            Status::Undo => "undo",
            Status::Undoing => "undoing",
            Status::Undone => "undone",
            Status::Hold => "hold",
            Status::Error => "error",
        }
    }
}

/// Derives a change's status from its tasks' statuses.
///
/// Non-terminal statuses dominate, busiest first (`Doing`, `Undoing`,
/// `Do`, `Undo`). Once every task is terminal: `Error` (an `Abort` task
/// counts as an error), then `Hold`, then `Undone`, then `Done`.
/// A change with no tasks derives `Hold`.
pub fn derive_change_status<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
    let mut any = false;
    let (mut doing, mut undoing, mut do_, mut undo) = (false, false, false, false);
    let (mut error, mut hold, mut undone, mut done) = (false, false, false, false);
    for status in statuses {
        any = true;
        match status {
            Status::Doing => doing = true,
            Status::Undoing => undoing = true,
            Status::Do => do_ = true,
            Status::Undo => undo = true,
            Status::Error | Status::Abort => error = true,
            Status::Hold => hold = true,
            Status::Undone => undone = true,
            Status::Done => done = true,
        }
    }
    if !any {
        return Status::Hold;
    }
    if doing {
        Status::Doing
    } else if undoing {
        Status::Undoing
    } else if do_ {
        Status::Do
    } else if undo {
        Status::Undo
    } else if error {
        Status::Error
    } else if hold {
        Status::Hold
    } else if undone {
        Status::Undone
    } else {
        debug_assert!(done);
        Status::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_statuses() {
        for s in [Status::Done, Status::Undone, Status::Hold, Status::Error, Status::Abort] {
            assert!(s.ready(), "{s:?}");
        }
        for s in [Status::Do, Status::Doing, Status::Undo, Status::Undoing] {
            assert!(!s.ready(), "{s:?}");
        }
    }

    #[test]
    fn derivation_precedence() {
        use Status::*;
        assert_eq!(derive_change_status([]), Hold);
        assert_eq!(derive_change_status([Done, Doing, Error]), Doing);
        assert_eq!(derive_change_status([Done, Undo]), Undo);
        assert_eq!(derive_change_status([Done, Abort]), Error);
        assert_eq!(derive_change_status([Undone, Undone, Error]), Error);
        assert_eq!(derive_change_status([Done, Done]), Done);
        assert_eq!(derive_change_status([Undone, Done]), Undone);
        assert_eq!(derive_change_status([Hold, Done]), Hold);
    }
}
