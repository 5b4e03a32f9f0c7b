//! Plan-driven managers: service autostart and replan, log forwarder
//! reconciliation.

use std::sync::Arc;
use std::time::Duration;

use planvisor::plan::Layer;
use planvisor::{LogManager, Plan, PlanChanged, ServiceManager, StateLock, Status, TaskRunner};

fn plan_from(yaml: &str) -> PlanChanged {
    let layer = Layer::parse(1, "base", yaml.as_bytes()).unwrap();
    PlanChanged {
        plan: Arc::new(Plan::from_layers(vec![layer]).unwrap()),
        changed_sections: vec!["services".to_string()],
    }
}

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
async fn autostart_brings_enabled_services_up_in_order() {
    let state = Arc::new(StateLock::in_memory());
    let runner = TaskRunner::new(Arc::clone(&state));
    let manager = ServiceManager::new(Arc::clone(&state), Arc::clone(&runner));

    let pc = plan_from(
        "services:\n  web:\n    override: replace\n    command: /bin/web\n    startup: enabled\n    requires: [db]\n    after: [db]\n  db:\n    override: replace\n    command: /bin/db\n    startup: enabled\n",
    );
    manager.plan_changed(&pc);

    let change_id = manager.autostart(&pc.plan).unwrap().expect("services to start");
    wait_ready(&state, &change_id).await;

    {
        let st = state.lock();
        assert_eq!(st.change_status(&change_id), Status::Done);
        // db starts before web.
        let change = st.change(&change_id).unwrap();
        let kinds: Vec<String> = change
            .task_ids()
            .iter()
            .map(|id| st.task(id).unwrap().summary().to_string())
            .collect();
        assert_eq!(kinds[0], "Start service \"db\"");
        assert_eq!(kinds[1], "Start service \"web\"");
    }
    assert_eq!(
        manager.service_state("web"),
        Some(planvisor::ServiceState::Active)
    );
    assert_eq!(
        manager.service_state("db"),
        Some(planvisor::ServiceState::Active)
    );

    // A second pass has nothing to do.
    assert!(manager.autostart(&pc.plan).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn changed_config_restarts_active_services() {
    let state = Arc::new(StateLock::in_memory());
    let runner = TaskRunner::new(Arc::clone(&state));
    let manager = ServiceManager::new(Arc::clone(&state), Arc::clone(&runner));

    let pc = plan_from(
        "services:\n  web:\n    override: replace\n    command: /bin/web\n    startup: enabled\n",
    );
    manager.plan_changed(&pc);
    let change_id = manager.autostart(&pc.plan).unwrap().unwrap();
    wait_ready(&state, &change_id).await;

    // Same service, new command: the active service is restarted
    // through a replan change.
    let updated = plan_from(
        "services:\n  web:\n    override: replace\n    command: /bin/web --verbose\n    startup: enabled\n",
    );
    manager.plan_changed(&updated);

    let replan_id = {
        let st = state.lock();
        st.changes()
            .iter()
            .find(|c| c.kind() == "replan")
            .expect("replan change submitted")
            .id()
            .to_string()
    };
    wait_ready(&state, &replan_id).await;

    let st = state.lock();
    assert_eq!(st.change_status(&replan_id), Status::Done);
    let change = st.change(&replan_id).unwrap();
    assert_eq!(change.task_ids().len(), 2);
    drop(st);
    assert_eq!(
        manager.service_state("web"),
        Some(planvisor::ServiceState::Active)
    );

    // An unchanged plan publication does not submit more work.
    let before = state.lock().changes().len();
    manager.plan_changed(&plan_from(
        "services:\n  web:\n    override: replace\n    command: /bin/web --verbose\n    startup: enabled\n",
    ));
    assert_eq!(state.lock().changes().len(), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_service_is_forgotten() {
    let state = Arc::new(StateLock::in_memory());
    let runner = TaskRunner::new(Arc::clone(&state));
    let manager = ServiceManager::new(Arc::clone(&state), Arc::clone(&runner));

    manager.plan_changed(&plan_from(
        "services:\n  web:\n    override: replace\n    command: /bin/web\n",
    ));
    assert!(manager.service_state("web").is_some());

    manager.plan_changed(&plan_from(
        "services:\n  other:\n    override: replace\n    command: /bin/other\n",
    ));
    assert!(manager.service_state("web").is_none());
    assert!(manager.service_state("other").is_some());
}

#[test]
fn log_forwarders_follow_target_service_selection() {
    let manager = LogManager::new();

    let pc = plan_from(
        "services:\n  web:\n    override: replace\n    command: /bin/web\n  db:\n    override: replace\n    command: /bin/db\nlog-targets:\n  central:\n    override: replace\n    type: loki\n    location: http://loki:3100\n    services: [all, -db]\n",
    );
    manager.plan_changed(&pc);

    let forwarder = manager.forwarder("central").expect("forwarder created");
    assert_eq!(forwarder.location, "http://loki:3100");
    assert_eq!(forwarder.services, vec!["web"]);

    // Removing the target tears the forwarder down.
    let pc = plan_from(
        "services:\n  web:\n    override: replace\n    command: /bin/web\n",
    );
    manager.plan_changed(&pc);
    assert!(manager.forwarder("central").is_none());
    assert!(manager.targets().is_empty());
}
