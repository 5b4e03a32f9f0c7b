//! Layered plan behavior: parsing, combining, validation, and the plan
//! manager's mutation operations.

use std::fs;
use std::sync::{Arc, Mutex};

use planvisor::plan::{combine_layers, read_layers_dir, Layer, Plan};
use planvisor::{PlanError, PlanManager};
use tempfile::TempDir;

fn write_layer(dir: &TempDir, name: &str, content: &str) {
    let layers = dir.path().join("layers");
    fs::create_dir_all(&layers).unwrap();
    fs::write(layers.join(name), content).unwrap();
}

#[test]
fn merge_override_combines_fields() {
    let base = Layer::parse(
        1,
        "base",
        b"services:\n  web:\n    override: replace\n    command: /bin/srv\n",
    )
    .unwrap();
    let tune = Layer::parse(
        2,
        "tune",
        b"services:\n  web:\n    override: merge\n    environment:\n      LOG: info\n",
    )
    .unwrap();

    let combined = combine_layers(&[&base, &tune]).unwrap();
    let web = &combined.services["web"];
    assert_eq!(web.command, "/bin/srv");
    assert_eq!(web.environment["LOG"], "info");
}

#[test]
fn replace_override_discards_lower_entry() {
    let base = Layer::parse(
        1,
        "base",
        b"services:\n  web:\n    override: replace\n    command: /bin/srv\n    environment:\n      A: one\n",
    )
    .unwrap();
    let swap = Layer::parse(
        2,
        "swap",
        b"services:\n  web:\n    override: replace\n    command: /bin/other\n",
    )
    .unwrap();

    let combined = combine_layers(&[&base, &swap]).unwrap();
    let web = &combined.services["web"];
    assert_eq!(web.command, "/bin/other");
    assert!(web.environment.is_empty());
}

#[test]
fn dependency_cycle_is_a_format_error() {
    let err = Layer::parse(
        1,
        "base",
        b"services:\n  a:\n    override: replace\n    command: /bin/a\n    after: [b]\n  b:\n    override: replace\n    command: /bin/b\n    after: [a]\n",
    )
    .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("loop"), "got: {msg}");
    assert!(msg.contains('a') && msg.contains('b'), "got: {msg}");
}

#[test]
fn check_must_specify_exactly_one_type() {
    let layer = Layer::parse(
        1,
        "base",
        b"checks:\n  up:\n    override: replace\n    http:\n      url: http://localhost/\n    tcp:\n      port: 8080\n",
    )
    .unwrap();
    let err = combine_layers(&[&layer]).unwrap_err();
    assert!(
        err.to_string().contains("one of \"http\", \"tcp\", or \"exec\""),
        "got: {err}"
    );
}

#[test]
fn load_reads_layers_in_order() {
    let dir = TempDir::new().unwrap();
    write_layer(
        &dir,
        "001-base.yaml",
        "services:\n  web:\n    override: replace\n    command: /bin/srv\n",
    );
    write_layer(
        &dir,
        "002-tune.yaml",
        "services:\n  web:\n    override: merge\n    environment:\n      LOG: info\n",
    );
    // Ignored: not a .yaml file, and a subdirectory.
    fs::write(dir.path().join("layers/readme.txt"), "ignore me").unwrap();
    fs::create_dir(dir.path().join("layers/subdir")).unwrap();

    let plan = Plan::read_dir(dir.path()).unwrap();
    assert_eq!(plan.layers().len(), 2);
    assert_eq!(plan.layers()[0].label, "base");
    assert_eq!(plan.layers()[0].order, 1);
    let web = &plan.services()["web"];
    assert_eq!(web.command, "/bin/srv");
    assert_eq!(web.environment["LOG"], "info");
}

#[test]
fn load_rejects_bad_filenames_and_duplicates() {
    let dir = TempDir::new().unwrap();
    write_layer(&dir, "1-short.yaml", "{}");
    let err = read_layers_dir(&dir.path().join("layers")).unwrap_err();
    assert!(err.to_string().contains("invalid layer filename"), "{err}");

    let dir = TempDir::new().unwrap();
    write_layer(&dir, "001-base.yaml", "{}");
    write_layer(&dir, "001-other.yaml", "{}");
    let err = read_layers_dir(&dir.path().join("layers")).unwrap_err();
    assert!(err.to_string().contains("not unique"), "{err}");

    let dir = TempDir::new().unwrap();
    write_layer(&dir, "001-base.yaml", "{}");
    write_layer(&dir, "002-base.yaml", "{}");
    let err = read_layers_dir(&dir.path().join("layers")).unwrap_err();
    assert!(err.to_string().contains("not unique"), "{err}");
}

#[test]
fn missing_layers_dir_yields_empty_plan() {
    let dir = TempDir::new().unwrap();
    let plan = Plan::read_dir(dir.path()).unwrap();
    assert!(plan.layers().is_empty());
    assert!(plan.services().is_empty());
}

#[test]
fn published_plan_matches_reparse_of_layers() {
    let dir = TempDir::new().unwrap();
    write_layer(
        &dir,
        "001-base.yaml",
        "summary: base\nservices:\n  web:\n    override: replace\n    command: /bin/srv\n    startup: enabled\nchecks:\n  up:\n    override: replace\n    tcp:\n      port: 8080\n",
    );
    write_layer(
        &dir,
        "002-tune.yaml",
        "services:\n  web:\n    override: merge\n    environment:\n      LOG: info\n",
    );

    let published = Plan::read_dir(dir.path()).unwrap();
    let reparsed =
        Plan::from_layers(read_layers_dir(&dir.path().join("layers")).unwrap()).unwrap();
    assert_eq!(
        serde_yaml::to_string(&published.to_yaml().unwrap()).unwrap(),
        serde_yaml::to_string(&reparsed.to_yaml().unwrap()).unwrap()
    );
}

#[test]
fn layer_yaml_round_trips_canonically() {
    let source = "summary: base\nservices:\n  web:\n    override: replace\n    command: /bin/srv\n    after: [db]\n  db:\n    override: replace\n    command: /bin/db\n";
    let layer = Layer::parse(1, "base", source.as_bytes()).unwrap();
    let marshalled = serde_yaml::to_string(&layer.to_yaml().unwrap()).unwrap();
    let reparsed = Layer::parse(1, "base", marshalled.as_bytes()).unwrap();
    assert_eq!(
        serde_yaml::to_string(&reparsed.to_yaml().unwrap()).unwrap(),
        marshalled
    );
}

#[test]
fn manager_append_update_combine() {
    let dir = TempDir::new().unwrap();
    write_layer(
        &dir,
        "001-base.yaml",
        "services:\n  web:\n    override: replace\n    command: /bin/srv\n",
    );
    let manager = PlanManager::new(dir.path());
    manager.load().unwrap();

    // Append a fresh label.
    let mut layer = Layer::parse(
        0,
        "extra",
        b"services:\n  worker:\n    override: replace\n    command: /bin/worker\n",
    )
    .unwrap();
    manager.append_layer(&mut layer).unwrap();
    assert_eq!(layer.order, 2);
    assert!(manager.plan().unwrap().services().contains_key("worker"));

    // Appending the same label again fails.
    let mut dup = Layer::parse(0, "extra", b"{}").unwrap();
    match manager.append_layer(&mut dup) {
        Err(PlanError::LabelExists { label }) => assert_eq!(label, "extra"),
        other => panic!("expected LabelExists, got {other:?}"),
    }

    // Updating an unknown label fails.
    let mut missing = Layer::parse(0, "ghost", b"{}").unwrap();
    match manager.update_layer(&mut missing) {
        Err(PlanError::LabelMissing { label }) => assert_eq!(label, "ghost"),
        other => panic!("expected LabelMissing, got {other:?}"),
    }

    // Update merges into the existing layer, keeping its order.
    let mut tune = Layer::parse(
        0,
        "extra",
        b"services:\n  worker:\n    override: merge\n    environment:\n      LOG: debug\n",
    )
    .unwrap();
    manager.update_layer(&mut tune).unwrap();
    assert_eq!(tune.order, 2);
    let plan = manager.plan().unwrap();
    assert_eq!(plan.services()["worker"].environment["LOG"], "debug");
    assert_eq!(plan.services()["worker"].command, "/bin/worker");

    // Combine appends unknown labels and merges known ones.
    let mut fresh = Layer::parse(
        0,
        "third",
        b"services:\n  cron:\n    override: replace\n    command: /bin/cron\n",
    )
    .unwrap();
    manager.combine_layer(&mut fresh).unwrap();
    assert_eq!(fresh.order, 3);
}

#[test]
fn failed_mutation_leaves_plan_untouched() {
    let dir = TempDir::new().unwrap();
    write_layer(
        &dir,
        "001-base.yaml",
        "services:\n  web:\n    override: replace\n    command: /bin/srv\n",
    );
    let manager = PlanManager::new(dir.path());
    manager.load().unwrap();

    // The new layer parses but produces an invalid combined plan
    // (unknown service in a log target).
    let mut bad = Layer::parse(
        0,
        "broken",
        b"log-targets:\n  remote:\n    override: replace\n    type: loki\n    location: http://loki/\n    services: [ghost]\n",
    )
    .unwrap();
    assert!(manager.append_layer(&mut bad).is_err());

    let plan = manager.plan().unwrap();
    assert_eq!(plan.layers().len(), 1);
    assert!(plan.log_targets().is_empty());
}

#[test]
fn subscribers_observe_changed_sections() {
    let dir = TempDir::new().unwrap();
    write_layer(
        &dir,
        "001-base.yaml",
        "services:\n  web:\n    override: replace\n    command: /bin/srv\n",
    );
    let manager = PlanManager::new(dir.path());

    let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.notify_plan_changed(Box::new(move |pc| {
        sink.lock().unwrap().push(pc.changed_sections.clone());
    }));

    manager.load().unwrap();
    // Adding a check leaves services untouched.
    let mut layer = Layer::parse(
        0,
        "checks",
        b"checks:\n  up:\n    override: replace\n    tcp:\n      port: 8080\n",
    )
    .unwrap();
    manager.append_layer(&mut layer).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], vec!["services".to_string()]);
    assert_eq!(seen[1], vec!["checks".to_string()]);
}
