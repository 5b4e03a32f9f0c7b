//! # Firmware refresh manager.
//!
//! A refresh is a three-task change in a single lane:
//!
//! ```text
//! firmware-refresh-prepare ──► firmware-refresh-upload ──► firmware-refresh-complete
//! ```
//!
//! The upload task suspends until an out-of-band HTTP handler deposits an
//! [`UploadRequest`] keyed by change id (polling every 100 ms, bounded at
//! 5 s), then streams the payload to the inactive slot path
//! `<slots>/<target>/firmware.img`, reporting progress as it goes, and
//! signals the waiting HTTP handler through the request's `done` channel.
//! A failure in any task aborts the change's lane and undoes completed
//! predecessors.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::TaskError;
use crate::managers::Manager;
use crate::osutil::AtomicFile;
use crate::runner::{handler_fn, TaskHandle, TaskRunner};
use crate::state::{StateLock, TaskSet};

/// How long the upload task waits for the client metadata to arrive.
const UPLOAD_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll cadence while waiting for the upload request.
const UPLOAD_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Streaming block size.
const UPLOAD_BLOCK_SIZE: usize = 4096;

/// Payload handed over by the out-of-band upload endpoint.
pub struct UploadRequest {
    /// Total payload size in bytes.
    pub size: u64,
    /// The byte stream to persist.
    pub source: Box<dyn AsyncRead + Send + Sync + Unpin>,
    /// Signalled when the upload task finished consuming the stream, so
    /// the HTTP handler can return.
    pub done: oneshot::Sender<Result<(), String>>,
}

/// Options stored on the refresh change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RefreshOptions {
    /// False would mean a store-based refresh; only upload is supported.
    pub upload: bool,
    /// The inactive slot the image is written to.
    pub target: String,
}

/// Drives firmware refresh changes.
pub struct FirmwareManager {
    state: Arc<StateLock>,
    runner: Arc<TaskRunner>,
    slots_dir: PathBuf,
    uploads: DashMap<String, UploadRequest>,
}

impl FirmwareManager {
    /// Creates the manager and registers its refresh task handlers.
    pub fn new(
        state: Arc<StateLock>,
        runner: Arc<TaskRunner>,
        slots_dir: impl Into<PathBuf>,
    ) -> Arc<FirmwareManager> {
        let manager = Arc::new(FirmwareManager {
            state,
            runner: Arc::clone(&runner),
            slots_dir: slots_dir.into(),
            uploads: DashMap::new(),
        });

        let m = Arc::clone(&manager);
        let do_prepare = handler_fn(move |task, token| {
            let m = Arc::clone(&m);
            async move { m.do_refresh_prepare(task, token).await }
        });
        runner.add_handler(
            "firmware-refresh-prepare",
            do_prepare,
            Some(handler_fn(|_task, _token| async { Ok(()) })),
        );

        let m = Arc::clone(&manager);
        let do_upload = handler_fn(move |task, token| {
            let m = Arc::clone(&m);
            async move { m.do_refresh_upload(task, token).await }
        });
        let m = Arc::clone(&manager);
        let undo_upload = handler_fn(move |task, _token| {
            let m = Arc::clone(&m);
            async move { m.undo_refresh_upload(task).await }
        });
        runner.add_handler("firmware-refresh-upload", do_upload, Some(undo_upload));

        let m = Arc::clone(&manager);
        let do_complete = handler_fn(move |task, token| {
            let m = Arc::clone(&m);
            async move { m.do_refresh_complete(task, token).await }
        });
        runner.add_handler("firmware-refresh-complete", do_complete, None);

        manager
    }

    /// Builds and submits the refresh change. Returns its change id; the
    /// upload task then waits for [`FirmwareManager::set_upload_request`].
    pub fn refresh(&self, opts: &RefreshOptions) -> anyhow::Result<String> {
        if !opts.upload {
            anyhow::bail!("store refresh not implemented");
        }
        if opts.target.is_empty() {
            anyhow::bail!("refresh target slot must not be empty");
        }

        let change_id = {
            let mut st = self.state.lock();
            let change_id = st.new_change("refresh", "Firmware refresh");
            let lane = st.new_lane();

            let prepare = st.new_task("firmware-refresh-prepare", "Validate and prepare for refresh");
            let upload = st.new_task("firmware-refresh-upload", "Receiving firmware payload");
            let complete = st.new_task("firmware-refresh-complete", "Verify and complete");
            for task_id in [&prepare, &upload, &complete] {
                st.task_join_lane(task_id, lane);
            }
            st.task_wait_for(&upload, &prepare);
            st.task_wait_for(&complete, &upload);
            st.change_add_all(&change_id, &TaskSet::new(vec![prepare, upload, complete]));
            st.change_set(&change_id, "firmware-refresh", opts);
            st.ensure_before(Duration::ZERO);
            change_id
        };
        self.runner.ensure();
        Ok(change_id)
    }

    /// Deposits the upload stream for a refresh change. Called by the
    /// HTTP upload handler; the corresponding upload task consumes it.
    pub fn set_upload_request(&self, change_id: &str, request: UploadRequest) {
        self.uploads.insert(change_id.to_string(), request);
    }

    /// Path of the image for a target slot.
    pub fn image_path(&self, target: &str) -> PathBuf {
        self.slots_dir.join(target).join("firmware.img")
    }

    async fn do_refresh_prepare(
        &self,
        task: TaskHandle,
        token: tokio_util::sync::CancellationToken,
    ) -> Result<(), TaskError> {
        let opts: RefreshOptions = task.change_get("firmware-refresh")?;
        if opts.target.is_empty() {
            return Err(TaskError::fail("refresh options carry no target slot"));
        }
        tokio::select! {
            _ = token.cancelled() => Err(TaskError::Canceled),
            _ = tokio::time::sleep(Duration::from_millis(10)) => Ok(()),
        }
    }

    async fn do_refresh_upload(
        &self,
        task: TaskHandle,
        token: tokio_util::sync::CancellationToken,
    ) -> Result<(), TaskError> {
        let change_id = task
            .change_id()
            .ok_or_else(|| TaskError::fail("upload task has no change"))?;
        let opts: RefreshOptions = task.change_get("firmware-refresh")?;

        // Suspend until the out-of-band handler deposits the request.
        let request = {
            let deadline = tokio::time::sleep(UPLOAD_WAIT_TIMEOUT);
            tokio::pin!(deadline);
            let mut poll = tokio::time::interval(UPLOAD_POLL_INTERVAL);
            loop {
                if let Some((_, request)) = self.uploads.remove(&change_id) {
                    break request;
                }
                tokio::select! {
                    _ = token.cancelled() => return Err(TaskError::Canceled),
                    _ = &mut deadline => {
                        return Err(TaskError::fail("timeout waiting for client upload metadata"));
                    }
                    _ = poll.tick() => {}
                }
            }
        };

        let UploadRequest {
            size,
            mut source,
            done,
        } = request;
        let result = self
            .write_image(&task, &opts, size, &mut source, &token)
            .await;
        // Whatever happened, release the waiting upload handler.
        let _ = done.send(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        result
    }

    async fn write_image(
        &self,
        task: &TaskHandle,
        opts: &RefreshOptions,
        size: u64,
        source: &mut (dyn AsyncRead + Send + Unpin),
        token: &tokio_util::sync::CancellationToken,
    ) -> Result<(), TaskError> {
        let path = self.image_path(&opts.target);
        let dir = path.parent().expect("image path has a parent");
        tokio::fs::create_dir_all(dir).await?;

        // The image goes through the crate's atomic writer, so readers
        // never observe a partial image and the rename is made durable.
        // The writer is synchronous; each filesystem step hops to the
        // blocking pool while the stream reads stay async. Dropping the
        // writer without committing discards the temp file.
        let mut writer = blocking_io(move || AtomicFile::create(&path)).await?;
        let mut buf = vec![0u8; UPLOAD_BLOCK_SIZE];
        let mut received: u64 = 0;
        task.set_progress("firmware upload", 0, size);

        loop {
            let read = tokio::select! {
                _ = token.cancelled() => return Err(TaskError::Canceled),
                read = source.read(&mut buf) => read?,
            };
            if read == 0 {
                break;
            }
            let block = buf[..read].to_vec();
            writer = blocking_io(move || {
                writer.write_all(&block)?;
                Ok(writer)
            })
            .await?;
            received += read as u64;
            task.set_progress("firmware upload", received.min(size), size);
        }

        if received != size {
            return Err(TaskError::fail(format!(
                "short upload: got {received} of {size} bytes"
            )));
        }

        blocking_io(move || writer.commit()).await?;
        info!(target = %opts.target, bytes = size, "firmware image written");
        Ok(())
    }

    async fn undo_refresh_upload(&self, task: TaskHandle) -> Result<(), TaskError> {
        let Ok(opts) = task.change_get::<RefreshOptions>("firmware-refresh") else {
            return Ok(());
        };
        let path = self.image_path(&opts.target);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(target = %opts.target, "removed uploaded firmware image");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn do_refresh_complete(
        &self,
        task: TaskHandle,
        token: tokio_util::sync::CancellationToken,
    ) -> Result<(), TaskError> {
        let opts: RefreshOptions = task.change_get("firmware-refresh")?;
        let path = self.image_path(&opts.target);
        if !tokio::fs::try_exists(&path).await? {
            return Err(TaskError::fail(format!(
                "uploaded image missing at {}",
                path.display()
            )));
        }
        tokio::select! {
            _ = token.cancelled() => Err(TaskError::Canceled),
            _ = tokio::time::sleep(Duration::from_millis(10)) => Ok(()),
        }
    }
}

/// Runs one synchronous filesystem step of the atomic writer on the
/// blocking pool, keeping the handler's runtime threads free.
async fn blocking_io<T: Send + 'static>(
    f: impl FnOnce() -> std::io::Result<T> + Send + 'static,
) -> Result<T, TaskError> {
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(TaskError::from),
        Err(e) => Err(TaskError::fail(format!("blocking write failed: {e}"))),
    }
}

#[async_trait]
impl Manager for FirmwareManager {
    fn name(&self) -> &'static str {
        "firmware"
    }

    async fn stop(&self) {
        // Release any upload handler still parked on its done channel.
        let pending: Vec<String> = self.uploads.iter().map(|e| e.key().clone()).collect();
        for change_id in pending {
            if let Some((_, request)) = self.uploads.remove(&change_id) {
                let _ = request.done.send(Err("firmware manager shutting down".into()));
            }
        }
    }
}
