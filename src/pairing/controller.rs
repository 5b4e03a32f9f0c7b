//! # Pairing controllers and their registry.
//!
//! A pairing controller decides *when* the pairing window opens and
//! closes; the [`PairingManager`](crate::pairing::PairingManager) decides
//! *whether* it may. Controllers are registered process-wide by type name
//! and instantiated by the manager when the plan selects them.
//!
//! ## Rules
//! - Controllers call back into the manager **only** through the
//!   [`PairingAccessor`] they were created with, and only from
//!   [`Controller::ensure_config`] or their own timers, never from
//!   [`Controller::pairing_disabled`] or the read-only methods.
//! - `ensure_config(None)` is the shutdown request: the controller must
//!   stop its timers and free its resources.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, RwLock};

use crate::error::{PairingError, PlanError};

/// Access to the pairing manager's window controls, handed to
/// controllers at construction time.
pub trait PairingAccessor: Send + Sync {
    /// Requests the pairing window to open. Fails when the window is
    /// already open or the configured mode forbids it.
    fn enable_pairing(&self) -> Result<(), PairingError>;

    /// Requests the pairing window to close. Fails when the window is
    /// already closed.
    fn disable_pairing(&self) -> Result<(), PairingError>;
}

/// Why the pairing manager closed the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    /// Closed due to an internal error.
    InternalError,
    /// Closed after a successful pairing request.
    PairingSuccess,
    /// Closed after a failed pairing request.
    PairingFailure,
    /// Closed because the pairing configuration changed.
    ConfigChanged,
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DisableReason::InternalError => "internal-error",
            DisableReason::PairingSuccess => "pairing-success",
            DisableReason::PairingFailure => "pairing-failure",
            DisableReason::ConfigChanged => "config-changed",
        })
    }
}

/// Controller-specific configuration carried in the `pairing` plan
/// section.
pub trait ControllerConfig: Any + Send + Sync + fmt::Debug {
    /// Value equality across trait objects.
    fn equal(&self, other: &dyn ControllerConfig) -> bool;

    /// Structural validation of the configuration content.
    fn validate(&self) -> Result<(), PlanError>;

    /// Marshals the config fields (without the `type` key).
    fn to_yaml(&self) -> Result<serde_yaml::Value, PlanError>;

    /// Deep copy behind the trait object.
    fn boxed_clone(&self) -> Box<dyn ControllerConfig>;

    /// Downcast seam for concrete controller implementations.
    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn ControllerConfig> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// A live pairing controller instance.
pub trait Controller: Send + Sync {
    /// The controller type, matching its registered extension name.
    /// May not call [`PairingAccessor`] methods.
    fn controller_type(&self) -> &str;

    /// The currently applied configuration. May not call
    /// [`PairingAccessor`] methods.
    fn config(&self) -> Option<Box<dyn ControllerConfig>>;

    /// Informs the controller that the manager closed the window.
    /// May not call [`PairingAccessor`] methods.
    fn pairing_disabled(&self, reason: DisableReason);

    /// Applies a configuration, or shuts the controller down when
    /// `config` is `None`. The only controller entry point that may call
    /// [`PairingAccessor`] methods.
    fn ensure_config(&self, config: Option<&dyn ControllerConfig>) -> Result<(), PairingError>;
}

/// Capability set of one registered controller type.
pub trait ControllerExtension: Send + Sync {
    /// Parses the controller's config sub-document (the `controller`
    /// mapping minus its `type` key).
    fn parse_config(&self, data: serde_yaml::Value) -> Result<Box<dyn ControllerConfig>, PlanError>;

    /// Combines configs from successive layers into one, applying the
    /// controller's defaults.
    fn combine_configs(
        &self,
        configs: &[&dyn ControllerConfig],
    ) -> Result<Box<dyn ControllerConfig>, PlanError>;

    /// Creates a controller without a configuration. The controller may
    /// not use the accessor until a configuration is ensured.
    fn new_controller(&self, accessor: Arc<dyn PairingAccessor>) -> Arc<dyn Controller>;
}

static CONTROLLER_EXTENSIONS: LazyLock<RwLock<HashMap<String, Arc<dyn ControllerExtension>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Registers a pairing controller extension under its type name.
///
/// # Panics
/// Panics if the name is already registered.
pub fn register_controller(name: &str, ext: Arc<dyn ControllerExtension>) {
    let mut registry = CONTROLLER_EXTENSIONS.write().unwrap();
    if registry.contains_key(name) {
        panic!("internal error: pairing controller {name:?} already registered");
    }
    registry.insert(name.to_string(), ext);
}

/// Removes a registered controller extension. Unknown names are ignored.
pub fn unregister_controller(name: &str) {
    CONTROLLER_EXTENSIONS.write().unwrap().remove(name);
}

/// Looks up a controller extension by type name.
pub(crate) fn find_controller(name: &str) -> Option<Arc<dyn ControllerExtension>> {
    CONTROLLER_EXTENSIONS.read().unwrap().get(name).cloned()
}
