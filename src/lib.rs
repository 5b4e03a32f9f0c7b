//! # planvisor
//!
//! **Planvisor** is the configuration plane and orchestration core of a
//! lightweight service-supervisor daemon: it assembles a validated plan
//! from ordered declarative layers, drives asynchronous work through a
//! durably-checkpointed Change/Task state engine, and coordinates
//! plan-driven managers.
//!
//! | Area | Description | Key types / traits |
//! |------|-------------|--------------------|
//! | **Plan** | Parse, validate, and combine ordered layers; extension registry. | [`Plan`], [`Layer`], [`SectionExtension`] |
//! | **State** | Persistent Change/Task graph with checkpoint-on-unlock. | [`StateLock`], [`Change`], [`Task`], [`Notice`] |
//! | **Runner** | Concurrent do/undo handlers with lanes and cancellation. | [`TaskRunner`], [`TaskHandle`] |
//! | **Managers** | Plan-driven controllers reacting to plan changes. | [`Manager`], [`PlanManager`], [`ServiceManager`] |
//! | **Pairing** | Timed pairing-window lifecycle with pluggable controllers. | [`PairingManager`](pairing::PairingManager) |
//! | **Errors** | Typed errors per subsystem. | [`PlanError`], [`StateError`], [`TaskError`] |
//!
//! ```no_run
//! use std::sync::Arc;
//! use planvisor::{Config, FileBackend, PlanManager, StateEngine, StateLock, TaskRunner};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let cfg = Config::new("/var/lib/planvisor");
//!     let backend = Arc::new(FileBackend::new(&cfg.state_file));
//!     let ensure_notify = backend.ensure_notify();
//!     let state = Arc::new(StateLock::new(backend));
//!     let runner = TaskRunner::new(Arc::clone(&state));
//!
//!     let engine = StateEngine::new(&cfg, Arc::clone(&state), Arc::clone(&runner), ensure_notify);
//!     engine.add_manager(Arc::new(PlanManager::new(&cfg.base_dir)));
//!
//!     engine.start_up().await?;
//!     engine.run().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod managers;
pub mod osutil;
pub mod pairing;
pub mod plan;
pub mod runner;
pub mod state;

// ---- Public re-exports ----

pub use config::Config;
pub use error::{PairingError, PlanError, StateError, TaskError};
pub use managers::{
    FirmwareManager, LogManager, Manager, PlanChanged, PlanManager, RefreshOptions, ServiceManager,
    ServiceState, StateEngine, UploadRequest,
};
pub use plan::{Layer, Plan, Section, SectionExtension};
pub use runner::{handler_fn, TaskHandle, TaskRunner};
pub use state::{
    Backend, Change, FileBackend, Identity, MemoryBackend, Notice, NoticeType, StateLock, Status,
    Task, TaskSet,
};
