//! # Managers: long-lived components driven by the engine loop.
//!
//! Every manager implements [`Manager`]: one-shot [`startup`](Manager::startup),
//! an idempotent [`ensure`](Manager::ensure) reconciliation pass invoked
//! periodically and on `EnsureBefore`, and [`stop`](Manager::stop) at
//! shutdown. Plan-driven managers additionally subscribe to plan change
//! notifications through the [`PlanManager`].

use async_trait::async_trait;

pub mod engine;
pub mod firmware;
pub mod logfwd;
pub mod plan;
pub mod serve;

pub use engine::StateEngine;
pub use firmware::{FirmwareManager, RefreshOptions, UploadRequest};
pub use logfwd::LogManager;
pub use plan::{PlanChanged, PlanFunc, PlanManager};
pub use serve::{ServiceManager, ServiceState};

/// A long-lived component wired into the engine loop.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Short stable name for logs.
    fn name(&self) -> &'static str;

    /// One-shot pre-loop initialisation. A failing startup aborts the
    /// engine start.
    async fn startup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Idempotent reconciliation pass. Errors are logged by the engine;
    /// the loop keeps running.
    async fn ensure(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Shutdown hook, called after the engine loop exits.
    async fn stop(&self) {}
}
