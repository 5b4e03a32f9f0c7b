//! # Durable state engine.
//!
//! The state store keeps the process-wide model of [`Change`]s, [`Task`]s,
//! [`Notice`]s, and [`Identity`]s, guarded by the single exclusive
//! [`StateLock`] and checkpointed through a [`Backend`] on every unlock.

pub mod backend;
pub mod change;
pub mod identity;
pub mod notice;
pub mod status;
pub mod store;
pub mod task;

pub use backend::{Backend, FileBackend, MemoryBackend};
pub use change::Change;
pub use identity::{BasicIdentity, Identity, IdentityAccess, LocalIdentity};
pub use notice::{Notice, NoticeOptions, NoticeType};
pub use status::{derive_change_status, Status};
pub use store::{
    ChangeStatusHandler, CheckpointRetry, PendingPredicate, State, StateGuard, StateLock,
    TaskStatusHandler,
};
pub use task::{Progress, Task, TaskSet};
