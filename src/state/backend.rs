//! # State persistence backends.
//!
//! A [`Backend`] receives the serialized state on every checkpoint and
//! mediates `EnsureBefore` requests from managers to the engine loop.
//!
//! - [`FileBackend`] writes the state file atomically and wakes the
//!   engine through a shared [`Notify`].
//! - [`MemoryBackend`] keeps the bytes in memory; used by tests.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::osutil;

/// Checkpoint sink and ensure-scheduling seam of the state store.
pub trait Backend: Send + Sync {
    /// Durably stores the serialized state. Called synchronously while
    /// the state lock is being released; must be atomic from the reader's
    /// point of view.
    fn checkpoint(&self, data: &[u8]) -> io::Result<()>;

    /// Whether a checkpoint is currently wanted. Backends that snapshot
    /// elsewhere (or tests) can return false to skip serialisation.
    fn needs_checkpoint(&self) -> bool {
        true
    }

    /// Asks the engine loop to run an ensure pass within `d` from now.
    fn ensure_before(&self, d: Duration);
}

/// File-backed checkpointing with atomic replacement.
pub struct FileBackend {
    path: PathBuf,
    ensure: Arc<Notify>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> FileBackend {
        FileBackend {
            path: path.into(),
            ensure: Arc::new(Notify::new()),
        }
    }

    /// The notifier pulsed by [`Backend::ensure_before`]; the engine loop
    /// selects on it alongside its periodic tick.
    pub fn ensure_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.ensure)
    }

    /// Path of the state file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Backend for FileBackend {
    fn checkpoint(&self, data: &[u8]) -> io::Result<()> {
        osutil::atomic_write(&self.path, data)
    }

    fn ensure_before(&self, _d: Duration) {
        // The engine treats any wakeup as "ensure soon"; sub-interval
        // scheduling granularity is not needed.
        self.ensure.notify_one();
    }
}

/// In-memory backend for tests: records checkpoints and can be told to
/// fail the first N attempts to exercise the retry policy.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<Vec<u8>>,
    checkpoints: AtomicUsize,
    fail_next: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }

    /// Makes the next `n` checkpoint calls fail with an I/O error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of successful checkpoints so far.
    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.load(Ordering::SeqCst)
    }

    /// The last checkpointed document.
    pub fn data(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl Backend for MemoryBackend {
    fn checkpoint(&self, data: &[u8]) -> io::Result<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::other("injected checkpoint failure"));
        }
        *self.data.lock().unwrap() = data.to_vec();
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn ensure_before(&self, _d: Duration) {}
}
