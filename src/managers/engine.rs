//! # State engine: the manager set and the ensure loop.
//!
//! The [`StateEngine`] owns the state lock, the task runner, and an
//! ordered list of [`Manager`]s. After a one-shot [`start_up`](StateEngine::start_up)
//! it runs [`ensure`](StateEngine::ensure) passes on a fixed cadence and
//! whenever a manager asks for one through `EnsureBefore`, pruning the
//! state store at a slower cadence in between.
//!
//! ```text
//! run():
//!   ┌─► tick(ensure_interval) ─┐
//!   ├─► EnsureBefore wakeup  ──┼──► managers.ensure() ──► runner.ensure()
//!   └─► stop token ────────────┘           │
//!                                          └─(every prune_interval)─► state.prune()
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::managers::Manager;
use crate::runner::TaskRunner;
use crate::state::StateLock;

/// State key remembering when this state file first went into service;
/// pruning never abort-sweeps changes older than the key's horizon.
const START_OF_OPERATION_KEY: &str = "start-of-operation-time";

/// Coordinates managers, the task runner, and state retention.
pub struct StateEngine {
    state: Arc<StateLock>,
    runner: Arc<TaskRunner>,
    managers: Mutex<Vec<Arc<dyn Manager>>>,
    ensure_notify: Arc<Notify>,
    token: CancellationToken,

    ensure_interval: Duration,
    prune_interval: Duration,
    prune_wait: Duration,
    abort_wait: Duration,
    max_ready_changes: usize,
    max_notices: usize,
}

impl StateEngine {
    /// Builds an engine over the given state and runner. `ensure_notify`
    /// is the notifier pulsed by the state backend's `EnsureBefore`.
    pub fn new(
        config: &Config,
        state: Arc<StateLock>,
        runner: Arc<TaskRunner>,
        ensure_notify: Arc<Notify>,
    ) -> StateEngine {
        StateEngine {
            state,
            runner,
            managers: Mutex::new(Vec::new()),
            ensure_notify,
            token: CancellationToken::new(),
            ensure_interval: config.ensure_interval,
            prune_interval: config.prune_interval,
            prune_wait: config.prune_wait,
            abort_wait: config.abort_wait,
            max_ready_changes: config.max_ready_changes,
            max_notices: config.max_notices,
        }
    }

    /// Adds a manager. Managers start up, ensure, and stop in the order
    /// they were added.
    pub fn add_manager(&self, manager: Arc<dyn Manager>) {
        self.managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(manager);
    }

    /// The state this engine drives.
    pub fn state(&self) -> &Arc<StateLock> {
        &self.state
    }

    /// The task runner this engine drives.
    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    /// One-shot initialisation of all managers, in order. Also stamps the
    /// start-of-operation time used by the pruner.
    pub async fn start_up(&self) -> anyhow::Result<()> {
        {
            let mut st = self.state.lock();
            if !st.has(START_OF_OPERATION_KEY) {
                st.set(START_OF_OPERATION_KEY, &Utc::now());
            }
        }
        let managers = self.managers_snapshot();
        for manager in managers {
            manager
                .startup()
                .await
                .map_err(|e| e.context(format!("cannot start up {} manager", manager.name())))?;
        }
        Ok(())
    }

    /// One reconciliation pass: every manager's ensure, then the task
    /// runner's. Manager errors are logged, not fatal.
    pub async fn ensure(&self) {
        for manager in self.managers_snapshot() {
            if let Err(e) = manager.ensure().await {
                warn!(manager = manager.name(), error = %e, "manager ensure failed");
            }
        }
        self.runner.ensure();
    }

    /// Runs the engine loop until [`stop`](StateEngine::stop) is called:
    /// ensure on the configured cadence and on every `EnsureBefore`
    /// wakeup, prune on its own slower cadence.
    pub async fn run(&self) {
        let mut ensure_tick = tokio::time::interval(self.ensure_interval);
        ensure_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut prune_tick = tokio::time::interval(self.prune_interval);
        prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Both intervals fire immediately once; swallow that.
        ensure_tick.tick().await;
        prune_tick.tick().await;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ensure_tick.tick() => self.ensure().await,
                _ = self.ensure_notify.notified() => self.ensure().await,
                _ = prune_tick.tick() => self.prune(),
            }
        }
    }

    /// One retention sweep with the configured limits.
    pub fn prune(&self) {
        let mut st = self.state.lock();
        let start_of_operation: DateTime<Utc> =
            st.get(START_OF_OPERATION_KEY).unwrap_or_else(|_| Utc::now());
        st.prune(
            start_of_operation,
            self.prune_wait,
            self.abort_wait,
            self.max_ready_changes,
            self.max_notices,
        );
    }

    /// Stops the loop, drains the runner, and stops every manager in
    /// reverse order.
    pub async fn stop(&self) {
        self.token.cancel();
        self.runner.stop().await;
        for manager in self.managers_snapshot().into_iter().rev() {
            manager.stop().await;
        }
        info!("state engine stopped");
    }

    fn managers_snapshot(&self) -> Vec<Arc<dyn Manager>> {
        self.managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
