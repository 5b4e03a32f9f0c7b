//! Firmware refresh: the three-task change, the suspended upload
//! handshake, progress reporting, and rollback on failure.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use planvisor::{
    FirmwareManager, RefreshOptions, StateLock, Status, TaskRunner, UploadRequest,
};
use tokio::sync::oneshot;

async fn wait_ready(state: &Arc<StateLock>, change_id: &str) {
    for _ in 0..400 {
        {
            let st = state.lock();
            if st.change_is_ready(change_id) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("change {change_id} did not quiesce in time");
}

fn task_status_by_kind(state: &Arc<StateLock>, change_id: &str, kind: &str) -> Status {
    let st = state.lock();
    let change = st.change(change_id).expect("change exists");
    for task_id in change.task_ids() {
        let task = st.task(task_id).expect("task exists");
        if task.kind() == kind {
            return task.status();
        }
    }
    panic!("no task of kind {kind} in change {change_id}");
}

#[tokio::test(flavor = "multi_thread")]
async fn refresh_streams_payload_into_slot() {
    let slots = tempfile::tempdir().unwrap();
    let state = Arc::new(StateLock::in_memory());
    let runner = TaskRunner::new(Arc::clone(&state));
    let manager = FirmwareManager::new(Arc::clone(&state), Arc::clone(&runner), slots.path());

    let change_id = manager
        .refresh(&RefreshOptions {
            upload: true,
            target: "slot-b".to_string(),
        })
        .unwrap();

    // The upload task suspends until the out-of-band handler deposits
    // the request.
    let payload = vec![0xA5u8; 10_000];
    let (done_tx, done_rx) = oneshot::channel();
    manager.set_upload_request(
        &change_id,
        UploadRequest {
            size: payload.len() as u64,
            source: Box::new(Cursor::new(payload.clone())),
            done: done_tx,
        },
    );

    // The handler side unblocks once the stream is consumed.
    let uploaded = done_rx.await.expect("upload task signals completion");
    assert_eq!(uploaded, Ok(()));
    wait_ready(&state, &change_id).await;

    for kind in [
        "firmware-refresh-prepare",
        "firmware-refresh-upload",
        "firmware-refresh-complete",
    ] {
        assert_eq!(task_status_by_kind(&state, &change_id, kind), Status::Done);
    }
    {
        let st = state.lock();
        assert_eq!(st.change_status(&change_id), Status::Done);
    }

    let image = manager.image_path("slot-b");
    let written = std::fs::read(&image).unwrap();
    assert_eq!(written, payload);

    // Progress settled at the full size.
    let st = state.lock();
    let change = st.change(&change_id).unwrap();
    let upload_task = change
        .task_ids()
        .iter()
        .find_map(|id| st.task(id).filter(|t| t.kind() == "firmware-refresh-upload"))
        .unwrap();
    let progress = upload_task.progress();
    assert_eq!(progress.label, "firmware upload");
    assert_eq!((progress.done, progress.total), (10_000, 10_000));
}

#[tokio::test(flavor = "multi_thread")]
async fn short_upload_rolls_the_change_back() {
    let slots = tempfile::tempdir().unwrap();
    let state = Arc::new(StateLock::in_memory());
    let runner = TaskRunner::new(Arc::clone(&state));
    let manager = FirmwareManager::new(Arc::clone(&state), Arc::clone(&runner), slots.path());

    let change_id = manager
        .refresh(&RefreshOptions {
            upload: true,
            target: "slot-b".to_string(),
        })
        .unwrap();

    // Announce more bytes than the stream delivers.
    let payload = vec![0x5Au8; 1_000];
    let (done_tx, done_rx) = oneshot::channel();
    manager.set_upload_request(
        &change_id,
        UploadRequest {
            size: 2_000,
            source: Box::new(Cursor::new(payload)),
            done: done_tx,
        },
    );

    let uploaded = done_rx.await.expect("upload task signals completion");
    assert!(uploaded.unwrap_err().contains("short upload"));
    wait_ready(&state, &change_id).await;

    // The lane rolled back: prepare undone, upload failed, complete
    // never ran.
    assert_eq!(
        task_status_by_kind(&state, &change_id, "firmware-refresh-prepare"),
        Status::Undone
    );
    assert_eq!(
        task_status_by_kind(&state, &change_id, "firmware-refresh-upload"),
        Status::Error
    );
    assert_eq!(
        task_status_by_kind(&state, &change_id, "firmware-refresh-complete"),
        Status::Abort
    );
    {
        let st = state.lock();
        assert_eq!(st.change_status(&change_id), Status::Error);
    }

    // No image and no partials left behind.
    assert!(!manager.image_path("slot-b").exists());
    let leftovers: Vec<_> = std::fs::read_dir(slots.path().join("slot-b"))
        .map(|entries| entries.map(|e| e.unwrap().file_name()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn store_refresh_is_rejected() {
    let slots = tempfile::tempdir().unwrap();
    let state = Arc::new(StateLock::in_memory());
    let runner = TaskRunner::new(Arc::clone(&state));
    let manager = FirmwareManager::new(Arc::clone(&state), Arc::clone(&runner), slots.path());

    let err = manager
        .refresh(&RefreshOptions {
            upload: false,
            target: "slot-b".to_string(),
        })
        .unwrap_err();
    assert!(err.to_string().contains("store refresh"), "{err}");

    // Nothing was recorded.
    let st = state.lock();
    assert!(st.changes().is_empty());
}
