//! # Pairing manager: the pairing-window lifecycle.
//!
//! The pairing window is a timed period during which externally-initiated
//! pairing requests are accepted. The [`PairingManager`] owns the window
//! state machine; the configured [`Controller`] decides when to ask for
//! the window to open or close.
//!
//! ```text
//!          EnablePairing
//! closed ───────────────► open ──{timer | DisablePairing | config change}──► closed
//! ```
//!
//! In mode `single`, once a pairing has succeeded, further
//! `EnablePairing` calls are refused.
//!
//! ## Locking
//! Plan configuration (including controller replacement) is serialised
//! by a secondary lock so that [`Controller::ensure_config`] can call
//! back into the [`PairingAccessor`] without deadlocking against the
//! manager lock.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::PairingError;
use crate::managers::plan::PlanChanged;
use crate::managers::Manager;

pub mod controller;
pub mod poweron;
pub mod section;

pub use controller::{
    register_controller, unregister_controller, Controller, ControllerConfig,
    ControllerExtension, DisableReason, PairingAccessor,
};
pub use poweron::{PowerOnConfig, PowerOnController, PowerOnExtension, POWER_ON_CONTROLLER};
pub use section::{PairingMode, PairingSection, PairingSectionExtension, PAIRING_SECTION};

struct PairingInner {
    controller: Option<Arc<dyn Controller>>,
    mode: PairingMode,
    is_paired: bool,
    window_open: bool,
}

/// Owns the pairing window and the configured controller.
pub struct PairingManager {
    inner: Mutex<PairingInner>,
    /// Serialises plan-driven configuration so controller callbacks into
    /// the accessor cannot deadlock against the manager lock.
    plan_lock: Mutex<()>,
}

impl PairingManager {
    pub fn new() -> Arc<PairingManager> {
        Arc::new(PairingManager {
            inner: Mutex::new(PairingInner {
                controller: None,
                mode: PairingMode::Disabled,
                is_paired: false,
                window_open: false,
            }),
            plan_lock: Mutex::new(()),
        })
    }

    /// Registers the `pairing` plan section extension.
    pub fn register_section_extension() {
        crate::plan::register_section(PAIRING_SECTION, Arc::new(PairingSectionExtension));
    }

    /// Whether the pairing window is currently open.
    pub fn window_open(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).window_open
    }

    /// Whether any pairing request has succeeded in the past.
    pub fn is_paired(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).is_paired
    }

    /// Applies the `pairing` section of a newly published plan:
    /// closes the window if the configuration changed, replaces the
    /// controller when its type changed, and ensures the new
    /// configuration into the controller.
    pub fn plan_changed(self: &Arc<Self>, pc: &PlanChanged) {
        let _applying = self.plan_lock.lock().unwrap_or_else(|e| e.into_inner());
        let Some(section) = pc.plan.section::<PairingSection>(PAIRING_SECTION) else {
            return;
        };
        let mode = match section.mode {
            PairingMode::Unset => PairingMode::Disabled,
            mode => mode,
        };

        let mut prev: Option<Arc<dyn Controller>> = None;
        let curr: Option<Arc<dyn Controller>>;
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            // Any configuration change while the window is open closes
            // it, as a security precaution.
            if inner.window_open && config_changed(&inner, mode, section) {
                inner.window_open = false;
                if let Some(controller) = &inner.controller {
                    controller.pairing_disabled(DisableReason::ConfigChanged);
                }
            }

            inner.mode = mode;

            // Is the current controller being replaced by another type?
            if let Some(controller) = &inner.controller {
                if controller.controller_type() != section.controller_type {
                    prev = inner.controller.take();
                }
            }

            // Instantiate a controller for the newly selected type.
            if inner.controller.is_none() && !section.controller_type.is_empty() {
                match controller::find_controller(&section.controller_type) {
                    Some(ext) => {
                        let accessor: Arc<dyn PairingAccessor> = Arc::clone(self) as _;
                        inner.controller = Some(ext.new_controller(accessor));
                    }
                    None => {
                        warn!(
                            controller = %section.controller_type,
                            "plan selects unregistered pairing controller"
                        );
                    }
                }
            }
            curr = inner.controller.clone();
        }

        // Configuration is applied outside the manager lock, so the
        // controller may call back into the accessor.
        if let Some(prev) = prev {
            if let Err(e) = prev.ensure_config(None) {
                warn!(controller = prev.controller_type(), error = %e,
                    "cannot shut down pairing controller");
            }
        }
        if let Some(curr) = curr {
            let config = section.controller_config.as_deref();
            if let Err(e) = curr.ensure_config(config) {
                warn!(controller = curr.controller_type(), error = %e,
                    "cannot apply pairing controller configuration");
            }
        }
    }

    /// Records the outcome of an externally-processed pairing request:
    /// closes the window and, on success, latches `is_paired`.
    pub fn report_pairing_result(&self, success: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if success {
            inner.is_paired = true;
        }
        if inner.window_open {
            inner.window_open = false;
            let reason = if success {
                DisableReason::PairingSuccess
            } else {
                DisableReason::PairingFailure
            };
            if let Some(controller) = &inner.controller {
                controller.pairing_disabled(reason);
            }
        }
    }
}

/// True when the manager mode, the controller type, or the controller
/// configuration differs from what is currently applied.
fn config_changed(inner: &PairingInner, mode: PairingMode, section: &PairingSection) -> bool {
    if inner.mode != mode {
        return true;
    }
    let Some(controller) = &inner.controller else {
        return !section.controller_type.is_empty();
    };
    if controller.controller_type() != section.controller_type {
        return true;
    }
    match (controller.config(), &section.controller_config) {
        (Some(current), Some(next)) => !current.equal(next.as_ref()),
        (None, None) => false,
        _ => true,
    }
}

impl PairingAccessor for PairingManager {
    fn enable_pairing(&self) -> Result<(), PairingError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.window_open {
            return Err(PairingError::EnableRefused {
                reason: "already enabled".to_string(),
            });
        }
        match inner.mode {
            PairingMode::Unset | PairingMode::Disabled => {
                return Err(PairingError::EnableRefused {
                    reason: "pairing not allowed".to_string(),
                });
            }
            PairingMode::Single if inner.is_paired => {
                return Err(PairingError::EnableRefused {
                    reason: "device already paired and pairing-mode is \"single\"".to_string(),
                });
            }
            PairingMode::Single | PairingMode::Multiple => {}
        }
        inner.window_open = true;
        debug!("pairing window opened");
        Ok(())
    }

    fn disable_pairing(&self) -> Result<(), PairingError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.window_open {
            return Err(PairingError::DisableRefused {
                reason: "already disabled".to_string(),
            });
        }
        inner.window_open = false;
        debug!("pairing window closed");
        Ok(())
    }
}

#[async_trait]
impl Manager for PairingManager {
    fn name(&self) -> &'static str {
        "pairing"
    }

    async fn stop(&self) {
        let controller = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.window_open = false;
            inner.controller.take()
        };
        if let Some(controller) = controller {
            if let Err(e) = controller.ensure_config(None) {
                warn!(controller = controller.controller_type(), error = %e,
                    "cannot shut down pairing controller");
            }
        }
    }
}
