//! Pairing manager behavior: section combining, the power-on controller,
//! and the window state machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use planvisor::pairing::{
    register_controller, Controller, ControllerConfig, ControllerExtension, DisableReason,
    PairingAccessor, PairingManager, PairingMode, PairingSection, PowerOnExtension,
    PAIRING_SECTION, POWER_ON_CONTROLLER,
};
use planvisor::plan::Layer;
use planvisor::{Plan, PlanChanged, PlanError};

/// Seconds since boot reported to the power-on controller.
static BOOT_SECS: AtomicU64 = AtomicU64::new(0);
static REGISTER: Once = Once::new();

/// Serialises the tests that flip [`BOOT_SECS`].
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn setup() -> std::sync::MutexGuard<'static, ()> {
    REGISTER.call_once(|| {
        PairingManager::register_section_extension();
        register_controller(
            POWER_ON_CONTROLLER,
            Arc::new(PowerOnExtension::with_boot_clock(Arc::new(|| {
                Some(Duration::from_secs(BOOT_SECS.load(Ordering::SeqCst)))
            }))),
        );
        register_controller("remote", Arc::new(RemoteExtension));
    });
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

// A minimal second controller type, used to exercise the replace rule.

#[derive(Debug, Clone, Default)]
struct RemoteConfig {
    url: String,
}

impl ControllerConfig for RemoteConfig {
    fn equal(&self, other: &dyn ControllerConfig) -> bool {
        other
            .as_any()
            .downcast_ref::<RemoteConfig>()
            .is_some_and(|o| o.url == self.url)
    }

    fn validate(&self) -> Result<(), PlanError> {
        Ok(())
    }

    fn to_yaml(&self) -> Result<serde_yaml::Value, PlanError> {
        let mut out = serde_yaml::Mapping::new();
        out.insert("url".into(), self.url.clone().into());
        Ok(serde_yaml::Value::Mapping(out))
    }

    fn boxed_clone(&self) -> Box<dyn ControllerConfig> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct RemoteExtension;

impl ControllerExtension for RemoteExtension {
    fn parse_config(
        &self,
        data: serde_yaml::Value,
    ) -> Result<Box<dyn ControllerConfig>, PlanError> {
        #[derive(serde::Deserialize, Default)]
        #[serde(deny_unknown_fields)]
        struct Yaml {
            #[serde(default)]
            url: String,
        }
        let parsed: Yaml = if data.is_null() {
            Yaml::default()
        } else {
            serde_yaml::from_value(data)
                .map_err(|e| PlanError::format(format!("cannot parse the controller config: {e}")))?
        };
        Ok(Box::new(RemoteConfig { url: parsed.url }))
    }

    fn combine_configs(
        &self,
        configs: &[&dyn ControllerConfig],
    ) -> Result<Box<dyn ControllerConfig>, PlanError> {
        let mut combined = RemoteConfig::default();
        for config in configs {
            if let Some(config) = config.as_any().downcast_ref::<RemoteConfig>() {
                if !config.url.is_empty() {
                    combined.url = config.url.clone();
                }
            }
        }
        Ok(Box::new(combined))
    }

    fn new_controller(&self, _accessor: Arc<dyn PairingAccessor>) -> Arc<dyn Controller> {
        Arc::new(RemoteController)
    }
}

struct RemoteController;

impl Controller for RemoteController {
    fn controller_type(&self) -> &str {
        "remote"
    }

    fn config(&self) -> Option<Box<dyn ControllerConfig>> {
        None
    }

    fn pairing_disabled(&self, _reason: DisableReason) {}

    fn ensure_config(
        &self,
        _config: Option<&dyn ControllerConfig>,
    ) -> Result<(), planvisor::PairingError> {
        Ok(())
    }
}

fn pairing_plan(yaml: &str) -> Plan {
    let layer = Layer::parse(1, "base", yaml.as_bytes()).unwrap();
    Plan::from_layers(vec![layer]).unwrap()
}

fn publish(plan: Plan) -> PlanChanged {
    PlanChanged {
        plan: Arc::new(plan),
        changed_sections: vec![PAIRING_SECTION.to_string()],
    }
}

#[test]
fn controller_type_change_requires_replace() {
    let _guard = setup();
    let base = Layer::parse(
        1,
        "base",
        b"pairing:\n  override: merge\n  mode: single\n  controller:\n    type: power-on\n",
    )
    .unwrap();
    let merge = Layer::parse(
        2,
        "merge",
        b"pairing:\n  override: merge\n  controller:\n    type: remote\n    url: https://pair.example\n",
    )
    .unwrap();
    let err = Plan::from_layers(vec![base.clone(), merge]).unwrap_err();
    assert!(
        err.to_string().contains("only replace"),
        "got: {err}"
    );

    let replace = Layer::parse(
        2,
        "replace",
        b"pairing:\n  override: replace\n  mode: multiple\n  controller:\n    type: remote\n    url: https://pair.example\n",
    )
    .unwrap();
    let plan = Plan::from_layers(vec![base, replace]).unwrap();
    let section = plan.section::<PairingSection>(PAIRING_SECTION).unwrap();
    assert_eq!(section.controller_type, "remote");
    assert_eq!(section.mode, PairingMode::Multiple);
}

#[test]
fn absent_section_defaults_to_disabled_mode() {
    let _guard = setup();
    let plan = pairing_plan("{}");
    let section = plan.section::<PairingSection>(PAIRING_SECTION).unwrap();
    assert_eq!(section.mode, PairingMode::Disabled);
    assert!(section.controller_type.is_empty());
}

#[test]
fn unknown_controller_fields_are_rejected() {
    let _guard = setup();
    let err = Layer::parse(
        1,
        "base",
        b"pairing:\n  override: merge\n  controller:\n    type: power-on\n    frequency: often\n",
    )
    .unwrap_err();
    assert!(err.to_string().contains("frequency"), "{err}");

    let err = Layer::parse(
        1,
        "base",
        b"pairing:\n  override: merge\n  controller:\n    duration: 10s\n",
    )
    .unwrap_err();
    assert!(err.to_string().contains("type missing"), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn power_on_opens_window_after_recent_boot() {
    let _guard = setup();
    BOOT_SECS.store(5, Ordering::SeqCst);

    let manager = PairingManager::new();
    let pc = publish(pairing_plan(
        "pairing:\n  override: merge\n  mode: single\n  controller:\n    type: power-on\n    duration: 150ms\n",
    ));
    manager.plan_changed(&pc);
    assert!(manager.window_open());

    // The window closes by itself once the duration elapses.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!manager.window_open());
}

#[tokio::test(flavor = "multi_thread")]
async fn power_on_stays_closed_after_process_restart() {
    let _guard = setup();
    BOOT_SECS.store(120, Ordering::SeqCst);

    let manager = PairingManager::new();
    let pc = publish(pairing_plan(
        "pairing:\n  override: merge\n  mode: multiple\n  controller:\n    type: power-on\n    duration: 150ms\n",
    ));
    manager.plan_changed(&pc);
    assert!(!manager.window_open());
}

#[tokio::test(flavor = "multi_thread")]
async fn single_mode_refuses_reopening_after_success() {
    let _guard = setup();
    BOOT_SECS.store(5, Ordering::SeqCst);

    let manager = PairingManager::new();
    let pc = publish(pairing_plan(
        "pairing:\n  override: merge\n  mode: single\n  controller:\n    type: power-on\n    duration: 10s\n",
    ));
    manager.plan_changed(&pc);
    assert!(manager.window_open());

    manager.report_pairing_result(true);
    assert!(!manager.window_open());
    assert!(manager.is_paired());

    let err = manager.enable_pairing().unwrap_err();
    assert!(err.to_string().contains("already paired"), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn config_change_closes_open_window() {
    let _guard = setup();
    BOOT_SECS.store(5, Ordering::SeqCst);

    let manager = PairingManager::new();
    manager.plan_changed(&publish(pairing_plan(
        "pairing:\n  override: merge\n  mode: multiple\n  controller:\n    type: power-on\n    duration: 10s\n",
    )));
    assert!(manager.window_open());

    // Same controller type, different duration: the open window closes
    // as a security precaution and stays closed (the power-on controller
    // does not re-open once armed).
    manager.plan_changed(&publish(pairing_plan(
        "pairing:\n  override: merge\n  mode: multiple\n  controller:\n    type: power-on\n    duration: 20s\n",
    )));
    assert!(!manager.window_open());
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_mode_refuses_enable() {
    let _guard = setup();
    let manager = PairingManager::new();
    manager.plan_changed(&publish(pairing_plan(
        "pairing:\n  override: merge\n  mode: disabled\n",
    )));
    let err = manager.enable_pairing().unwrap_err();
    assert!(err.to_string().contains("not allowed"), "{err}");
}
