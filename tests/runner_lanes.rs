//! Task runner behavior: wait-for ordering, lane rollback, cancellation,
//! and hold-parking for unregistered handlers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use planvisor::runner::handler_fn;
use planvisor::{StateLock, Status, TaskError, TaskRunner};

async fn wait_ready(state: &Arc<StateLock>, change_id: &str) {
    for _ in 0..400 {
        {
            let st = state.lock();
            if st.change_is_ready(change_id) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("change {change_id} did not quiesce in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn tasks_respect_wait_for_edges() {
    let state = Arc::new(StateLock::in_memory());
    let runner = TaskRunner::new(Arc::clone(&state));

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    for kind in ["first", "second", "third"] {
        let log = Arc::clone(&log);
        runner.add_handler(
            kind,
            handler_fn(move |task, _token| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(task.kind());
                    Ok(())
                }
            }),
            None,
        );
    }

    let change_id = {
        let mut st = state.lock();
        let change_id = st.new_change("ordered", "Ordered work");
        let t1 = st.new_task("first", "First");
        let t2 = st.new_task("second", "Second");
        let t3 = st.new_task("third", "Third");
        st.task_wait_for(&t2, &t1);
        st.task_wait_for(&t3, &t2);
        for t in [&t1, &t2, &t3] {
            st.change_add_task(&change_id, t);
        }
        change_id
    };
    runner.ensure();
    wait_ready(&state, &change_id).await;

    assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    let st = state.lock();
    assert_eq!(st.change_status(&change_id), Status::Done);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_task_rolls_its_lane_back() {
    let state = Arc::new(StateLock::in_memory());
    let runner = TaskRunner::new(Arc::clone(&state));

    let undone: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    for kind in ["step-one", "step-two"] {
        let undone = Arc::clone(&undone);
        runner.add_handler(
            kind,
            handler_fn(|_task, _token| async { Ok(()) }),
            Some(handler_fn(move |task, _token| {
                let undone = Arc::clone(&undone);
                async move {
                    undone.lock().unwrap().push(task.kind());
                    Ok(())
                }
            })),
        );
    }
    runner.add_handler(
        "step-three",
        handler_fn(|_task, _token| async { Err(TaskError::fail("boom")) }),
        None,
    );

    let (change_id, t1, t2, t3) = {
        let mut st = state.lock();
        let change_id = st.new_change("deploy", "Deploy with failure");
        let lane = st.new_lane();
        let t1 = st.new_task("step-one", "One");
        let t2 = st.new_task("step-two", "Two");
        let t3 = st.new_task("step-three", "Three");
        st.task_wait_for(&t2, &t1);
        st.task_wait_for(&t3, &t2);
        for t in [&t1, &t2, &t3] {
            st.task_join_lane(t, lane);
            st.change_add_task(&change_id, t);
        }
        (change_id, t1, t2, t3)
    };
    runner.ensure();
    wait_ready(&state, &change_id).await;

    // Undo ran in reverse wait-for order.
    assert_eq!(*undone.lock().unwrap(), vec!["step-two", "step-one"]);
    let st = state.lock();
    assert_eq!(st.task(&t1).unwrap().status(), Status::Undone);
    assert_eq!(st.task(&t2).unwrap().status(), Status::Undone);
    assert_eq!(st.task(&t3).unwrap().status(), Status::Error);
    assert_eq!(st.change_status(&change_id), Status::Error);
}

#[tokio::test(flavor = "multi_thread")]
async fn unstarted_lane_peers_are_skipped_on_failure() {
    let state = Arc::new(StateLock::in_memory());
    let runner = TaskRunner::new(Arc::clone(&state));

    runner.add_handler(
        "fails",
        handler_fn(|_task, _token| async { Err(TaskError::fail("nope")) }),
        None,
    );
    runner.add_handler("never-runs", handler_fn(|_task, _token| async { Ok(()) }), None);

    let (change_id, t1, t2) = {
        let mut st = state.lock();
        let change_id = st.new_change("doomed", "Doomed");
        let lane = st.new_lane();
        let t1 = st.new_task("fails", "Fails");
        let t2 = st.new_task("never-runs", "Skipped");
        st.task_wait_for(&t2, &t1);
        for t in [&t1, &t2] {
            st.task_join_lane(t, lane);
            st.change_add_task(&change_id, t);
        }
        (change_id, t1, t2)
    };
    runner.ensure();
    wait_ready(&state, &change_id).await;

    let st = state.lock();
    assert_eq!(st.task(&t1).unwrap().status(), Status::Error);
    assert_eq!(st.task(&t2).unwrap().status(), Status::Abort);
    assert_eq!(st.change_status(&change_id), Status::Error);
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_handler_counts_as_failure() {
    let state = Arc::new(StateLock::in_memory());
    let runner = TaskRunner::new(Arc::clone(&state));

    runner.add_handler(
        "explodes",
        handler_fn(|_task, _token| async { panic!("kaboom") }),
        None,
    );

    let (change_id, task_id) = {
        let mut st = state.lock();
        let change_id = st.new_change("volatile", "Volatile");
        let task_id = st.new_task("explodes", "Explodes");
        st.change_add_task(&change_id, &task_id);
        (change_id, task_id)
    };
    runner.ensure();
    wait_ready(&state, &change_id).await;

    let st = state.lock();
    assert_eq!(st.task(&task_id).unwrap().status(), Status::Error);
    let last_error: String = st.task(&task_id).unwrap().get("last-error").unwrap();
    assert!(last_error.contains("kaboom"), "{last_error}");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_change_parks_tasks_in_hold() {
    let state = Arc::new(StateLock::in_memory());
    let runner = TaskRunner::new(Arc::clone(&state));

    runner.add_handler(
        "patient",
        handler_fn(|_task, token| async move {
            token.cancelled().await;
            Err(TaskError::Canceled)
        }),
        None,
    );

    let (change_id, task_id) = {
        let mut st = state.lock();
        let change_id = st.new_change("slow", "Slow work");
        let task_id = st.new_task("patient", "Waits forever");
        st.change_add_task(&change_id, &task_id);
        (change_id, task_id)
    };
    runner.ensure();

    // Let the handler actually start before cancelling.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runner.running_count(), 1);
    runner.cancel_change(&change_id);
    wait_ready(&state, &change_id).await;

    let st = state.lock();
    assert_eq!(st.task(&task_id).unwrap().status(), Status::Hold);
    assert_eq!(st.change_status(&change_id), Status::Hold);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_handler_parks_until_registered() {
    let state = Arc::new(StateLock::in_memory());
    let runner = TaskRunner::new(Arc::clone(&state));

    let (change_id, task_id) = {
        let mut st = state.lock();
        let change_id = st.new_change("later", "Handler arrives later");
        let task_id = st.new_task("late-kind", "Waits for its handler");
        st.change_add_task(&change_id, &task_id);
        (change_id, task_id)
    };
    runner.ensure();
    {
        let st = state.lock();
        assert_eq!(st.task(&task_id).unwrap().status(), Status::Hold);
    }

    runner.add_handler("late-kind", handler_fn(|_task, _token| async { Ok(()) }), None);
    runner.ensure();
    wait_ready(&state, &change_id).await;

    let st = state.lock();
    assert_eq!(st.task(&task_id).unwrap().status(), Status::Done);
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_reports_latest_value() {
    let state = Arc::new(StateLock::in_memory());
    let runner = TaskRunner::new(Arc::clone(&state));

    runner.add_handler(
        "counts",
        handler_fn(|task, _token| async move {
            for done in 1..=3 {
                task.set_progress("counting", done, 3);
            }
            Ok(())
        }),
        None,
    );

    let (change_id, task_id) = {
        let mut st = state.lock();
        let change_id = st.new_change("count", "Counting");
        let task_id = st.new_task("counts", "Counts to three");
        st.change_add_task(&change_id, &task_id);
        (change_id, task_id)
    };
    runner.ensure();
    wait_ready(&state, &change_id).await;

    let st = state.lock();
    let progress = st.task(&task_id).unwrap().progress();
    assert_eq!(progress.label, "counting");
    assert_eq!((progress.done, progress.total), (3, 3));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_drains_running_handlers() {
    let state = Arc::new(StateLock::in_memory());
    let runner = TaskRunner::new(Arc::clone(&state));

    runner.add_handler(
        "drainable",
        handler_fn(|_task, token| async move {
            token.cancelled().await;
            Err(TaskError::Canceled)
        }),
        None,
    );

    let change_id = {
        let mut st = state.lock();
        let change_id = st.new_change("draining", "Draining");
        let task_id = st.new_task("drainable", "Runs until stop");
        st.change_add_task(&change_id, &task_id);
        change_id
    };
    runner.ensure();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runner.running_count(), 1);

    runner.stop().await;
    assert_eq!(runner.running_count(), 0);
    let st = state.lock();
    assert!(st.change_is_ready(&change_id));
}
