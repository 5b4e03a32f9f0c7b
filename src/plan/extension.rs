//! # Plan section extensions.
//!
//! Beyond the built-in `services`/`checks`/`log-targets` sections, plan
//! layers can carry additional named sections registered at startup. An
//! extension supplies the capability set for its section: parse, combine,
//! and cross-section plan validation; the parsed [`Section`] values carry
//! validate/marshal/is-empty themselves.
//!
//! The registry is process-global and name-keyed. Registration order is
//! preserved: sections combine and validate in the order their extensions
//! were registered.
//!
//! ## Rules
//! - [`register_section`] panics on a duplicate name.
//! - Call sites never downcast `dyn Section` directly; typed access goes
//!   through [`Plan::section`](crate::plan::Plan::section).

use std::any::Any;
use std::fmt;
use std::sync::{Arc, LazyLock, RwLock};

use crate::error::PlanError;
use crate::plan::Plan;

/// A parsed section value held by a layer or combined plan.
pub trait Section: Any + Send + Sync + fmt::Debug {
    /// Structural validation of this section in isolation.
    fn validate(&self) -> Result<(), PlanError>;

    /// Returns true when the section has nothing worth marshalling.
    fn is_empty(&self) -> bool;

    /// Marshals the section back to YAML.
    fn to_yaml(&self) -> Result<serde_yaml::Value, PlanError>;

    /// Deep copy behind the trait object.
    fn boxed_clone(&self) -> Box<dyn Section>;

    /// Downcast seam used by [`Plan::section`](crate::plan::Plan::section).
    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn Section> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// Capability set of one registered plan section.
pub trait SectionExtension: Send + Sync {
    /// Parses the section's YAML sub-document into a fresh [`Section`].
    ///
    /// Called with `Value::Null` when a layer does not mention the section,
    /// so every layer carries a (possibly empty) instance of each
    /// registered section.
    fn parse_section(&self, data: serde_yaml::Value) -> Result<Box<dyn Section>, PlanError>;

    /// Combines layer sections in ascending layer order into one.
    fn combine_sections(&self, sections: &[&dyn Section]) -> Result<Box<dyn Section>, PlanError>;

    /// Cross-section validation of the full combined plan. An extension
    /// may reject the plan here; the plan is then not published.
    fn validate_plan(&self, plan: &Plan) -> Result<(), PlanError>;
}

type Registry = Vec<(String, Arc<dyn SectionExtension>)>;

static SECTION_EXTENSIONS: LazyLock<RwLock<Registry>> = LazyLock::new(|| RwLock::new(Vec::new()));

/// Registers a section extension under `name`.
///
/// # Panics
/// Panics if `name` is already registered or collides with a built-in
/// section key.
pub fn register_section(name: &str, ext: Arc<dyn SectionExtension>) {
    if matches!(name, "services" | "checks" | "log-targets") {
        panic!("internal error: section {name:?} is built in");
    }
    let mut registry = SECTION_EXTENSIONS.write().unwrap();
    if registry.iter().any(|(n, _)| n == name) {
        panic!("internal error: section {name:?} already registered");
    }
    registry.push((name.to_string(), ext));
}

/// Removes a registered section extension. Unknown names are ignored.
pub fn unregister_section(name: &str) {
    SECTION_EXTENSIONS.write().unwrap().retain(|(n, _)| n != name);
}

/// Snapshot of the registry in registration order.
pub(crate) fn registered_sections() -> Registry {
    SECTION_EXTENSIONS.read().unwrap().clone()
}

/// Looks up one extension by section name.
pub(crate) fn find_section(name: &str) -> Option<Arc<dyn SectionExtension>> {
    SECTION_EXTENSIONS
        .read()
        .unwrap()
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, ext)| Arc::clone(ext))
}
