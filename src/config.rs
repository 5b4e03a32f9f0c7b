//! # Global runtime configuration.
//!
//! [`Config`] centralises the daemon-core settings: where layers and the
//! state file live, the ensure and prune cadence, retention limits, and
//! the checkpoint retry policy.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use planvisor::Config;
//!
//! let mut cfg = Config::new("/var/lib/planvisor");
//! cfg.ensure_interval = Duration::from_secs(60);
//!
//! assert!(cfg.state_file.ends_with(".planvisor.state"));
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::state::CheckpointRetry;

/// Global configuration for the orchestration core.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base directory; layers live in `<base_dir>/layers`.
    pub base_dir: PathBuf,
    /// Path of the JSON state file.
    pub state_file: PathBuf,
    /// Directory of firmware slots (`<slots>/<target>/firmware.img`).
    pub slots_dir: PathBuf,
    /// Cadence of periodic ensure passes.
    pub ensure_interval: Duration,
    /// Cadence of state pruning.
    pub prune_interval: Duration,
    /// Ready changes older than this are pruned.
    pub prune_wait: Duration,
    /// Unready changes older than this get their unready lanes aborted.
    pub abort_wait: Duration,
    /// Cap on retained ready changes.
    pub max_ready_changes: usize,
    /// Cap on retained notices.
    pub max_notices: usize,
    /// Checkpoint retry policy applied at state unlock.
    pub checkpoint_retry: CheckpointRetry,
}

impl Config {
    /// Configuration rooted at `base_dir` with the defaults:
    /// - `state_file = <base_dir>/.planvisor.state`
    /// - `slots_dir = <base_dir>/slots`
    /// - `ensure_interval = 5m`, `prune_interval = 10m`
    /// - `prune_wait = 24h`, `abort_wait = 7d`
    /// - `max_ready_changes = 500`, `max_notices = 10000`
    /// - checkpoint retry every 3s for up to 5m
    pub fn new(base_dir: impl Into<PathBuf>) -> Config {
        let base_dir = base_dir.into();
        Config {
            state_file: base_dir.join(".planvisor.state"),
            slots_dir: base_dir.join("slots"),
            base_dir,
            ensure_interval: Duration::from_secs(5 * 60),
            prune_interval: Duration::from_secs(10 * 60),
            prune_wait: Duration::from_secs(24 * 3600),
            abort_wait: Duration::from_secs(7 * 24 * 3600),
            max_ready_changes: 500,
            max_notices: 10_000,
            checkpoint_retry: CheckpointRetry::default(),
        }
    }
}
