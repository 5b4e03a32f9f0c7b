//! # Plan manager: owns the current combined plan.
//!
//! The [`PlanManager`] serialises every plan mutation behind one plan
//! lock, revalidates before publishing, and fans the new combined plan
//! out to subscribers.
//!
//! ## Rules
//! - No partial publication: a mutation that fails validation leaves the
//!   current plan untouched.
//! - Subscribers run synchronously **under the plan lock** and must not
//!   block; enqueue nontrivial work instead of doing it inline.
//! - A panicking subscriber aborts the notify loop and is logged; the
//!   published plan is not rolled back.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::PlanError;
use crate::managers::Manager;
use crate::plan::{combine_layers, Layer, Plan};

/// Payload delivered to plan-change subscribers.
pub struct PlanChanged {
    /// The newly published combined plan.
    pub plan: Arc<Plan>,
    /// Section keys that became non-empty or changed relative to the
    /// previously published plan.
    pub changed_sections: Vec<String>,
}

/// A plan-change subscriber.
pub type PlanFunc = Box<dyn Fn(&PlanChanged) + Send + Sync>;

struct PlanInner {
    plan: Option<Arc<Plan>>,
    subscribers: Vec<PlanFunc>,
}

/// Owns the combined plan and serialises mutations.
pub struct PlanManager {
    base_dir: PathBuf,
    inner: Mutex<PlanInner>,
}

impl PlanManager {
    /// Creates a manager reading layers from `<base_dir>/layers`.
    pub fn new(base_dir: impl Into<PathBuf>) -> PlanManager {
        PlanManager {
            base_dir: base_dir.into(),
            inner: Mutex::new(PlanInner {
                plan: None,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Registers `f` to be called after every successful publish, with
    /// the new combined plan and the changed section keys.
    pub fn notify_plan_changed(&self, f: PlanFunc) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.push(f);
    }

    /// Returns the current combined plan, loading the on-disk layers
    /// first if no plan has been published yet.
    pub fn plan(&self) -> Result<Arc<Plan>, PlanError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_loaded(&mut inner)?;
        Ok(Arc::clone(inner.plan.as_ref().expect("plan just loaded")))
    }

    /// Re-reads the layers directory and publishes the combined plan.
    pub fn load(&self) -> Result<(), PlanError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let plan = Plan::read_dir(&self.base_dir)?;
        publish(&mut inner, plan);
        Ok(())
    }

    /// Appends `layer` after the highest existing order. Fails with
    /// [`PlanError::LabelExists`] if the label is taken. On success the
    /// assigned order is written back into `layer`.
    pub fn append_layer(&self, layer: &mut Layer) -> Result<(), PlanError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_loaded(&mut inner)?;
        let current = inner.plan.as_ref().expect("plan just loaded");
        if find_layer(current.layers(), &layer.label).is_some() {
            return Err(PlanError::LabelExists {
                label: layer.label.clone(),
            });
        }
        append_layer_locked(&mut inner, layer)
    }

    /// Merges `layer` into the existing layer with the same label,
    /// keeping the original order. Fails with [`PlanError::LabelMissing`]
    /// if no such layer exists.
    pub fn update_layer(&self, layer: &mut Layer) -> Result<(), PlanError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_loaded(&mut inner)?;
        let current = inner.plan.as_ref().expect("plan just loaded");
        let Some(index) = find_layer(current.layers(), &layer.label) else {
            return Err(PlanError::LabelMissing {
                label: layer.label.clone(),
            });
        };
        update_layer_locked(&mut inner, index, layer)
    }

    /// Combines `layer` into the layer with the same label, or appends a
    /// new layer when the label is unknown. Writes the resulting order
    /// back into `layer`.
    pub fn combine_layer(&self, layer: &mut Layer) -> Result<(), PlanError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_loaded(&mut inner)?;
        let current = inner.plan.as_ref().expect("plan just loaded");
        match find_layer(current.layers(), &layer.label) {
            Some(index) => update_layer_locked(&mut inner, index, layer),
            None => append_layer_locked(&mut inner, layer),
        }
    }

    fn ensure_loaded(&self, inner: &mut PlanInner) -> Result<(), PlanError> {
        if inner.plan.is_none() {
            let plan = Plan::read_dir(&self.base_dir)?;
            publish(inner, plan);
        }
        Ok(())
    }
}

fn find_layer(layers: &[Layer], label: &str) -> Option<usize> {
    layers.iter().position(|l| l.label == label)
}

fn append_layer_locked(inner: &mut PlanInner, layer: &mut Layer) -> Result<(), PlanError> {
    let current = inner.plan.as_ref().expect("plan loaded by caller");
    let new_order = current.layers().last().map(|l| l.order + 1).unwrap_or(1);
    let mut candidate = layer.clone();
    candidate.order = new_order;
    let mut layers = current.layers().to_vec();
    layers.push(candidate);
    let plan = Plan::from_layers(layers)?;
    // Write the assigned order back only once the plan validated.
    layer.order = new_order;
    publish(inner, plan);
    Ok(())
}

fn update_layer_locked(
    inner: &mut PlanInner,
    index: usize,
    layer: &mut Layer,
) -> Result<(), PlanError> {
    let current = inner.plan.as_ref().expect("plan loaded by caller");
    let existing = &current.layers()[index];
    let existing_order = existing.order;
    // Re-merge with the in-memory variant of the layer, keeping its
    // original order and label.
    let mut combined = combine_layers(&[existing, layer])?;
    combined.order = existing_order;
    combined.label = existing.label.clone();

    let mut layers = current.layers().to_vec();
    layers[index] = combined;
    let plan = Plan::from_layers(layers)?;
    layer.order = existing_order;
    publish(inner, plan);
    Ok(())
}

/// Swaps in the new plan and fans out notifications, still under the
/// plan lock.
fn publish(inner: &mut PlanInner, plan: Plan) {
    let old = inner.plan.take();
    let plan = Arc::new(plan);
    let changed_sections = changed_sections(old.as_deref(), &plan);
    inner.plan = Some(Arc::clone(&plan));

    let notification = PlanChanged {
        plan,
        changed_sections,
    };
    for f in &inner.subscribers {
        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&notification)));
        if outcome.is_err() {
            error!("plan-change subscriber panicked, aborting notify loop");
            break;
        }
    }
    debug!(sections = ?notification.changed_sections, "published combined plan");
}

/// Section keys whose combined content differs between `old` and `new`,
/// including sections that appear (non-empty) for the first time.
fn changed_sections(old: Option<&Plan>, new: &Plan) -> Vec<String> {
    let mut changed = Vec::new();

    let services_differ = old.map(|o| o.services() != new.services()).unwrap_or(true);
    if services_differ && !(old.is_none() && new.services().is_empty()) {
        changed.push("services".to_string());
    }
    let checks_differ = old.map(|o| o.checks() != new.checks()).unwrap_or(true);
    if checks_differ && !(old.is_none() && new.checks().is_empty()) {
        changed.push("checks".to_string());
    }
    let targets_differ = old
        .map(|o| o.log_targets() != new.log_targets())
        .unwrap_or(true);
    if targets_differ && !(old.is_none() && new.log_targets().is_empty()) {
        changed.push("log-targets".to_string());
    }

    for (name, section) in new.sections() {
        let new_repr = section.to_yaml().ok();
        let old_repr = old
            .and_then(|o| o.sections().get(name))
            .and_then(|s| s.to_yaml().ok());
        let appeared = old_repr.is_none() && !section.is_empty();
        if appeared || (old_repr.is_some() && old_repr != new_repr) {
            changed.push(name.clone());
        }
    }
    changed
}

#[async_trait]
impl Manager for PlanManager {
    fn name(&self) -> &'static str {
        "plan"
    }

    async fn startup(&self) -> anyhow::Result<()> {
        self.load()?;
        Ok(())
    }
}
