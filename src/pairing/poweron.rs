//! # The bundled `power-on` pairing controller.
//!
//! Opens the pairing window on process start **only if** the host booted
//! recently (monotonic-since-boot time below a threshold), i.e. the
//! process start coincides with a host power-on rather than a plain
//! restart, and closes the window again after a configured duration.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PairingError, PlanError};
use crate::osutil;
use crate::pairing::controller::{
    Controller, ControllerConfig, ControllerExtension, DisableReason, PairingAccessor,
};
use crate::plan::types::OptionalDuration;

/// Registered type name of this controller.
pub const POWER_ON_CONTROLLER: &str = "power-on";

/// Boot-clock threshold below which a process start counts as a host
/// power-on. Starting later is interpreted as a process restart and the
/// window stays closed.
const POWER_ON_BOOT_EXPIRY: Duration = Duration::from_secs(30);

/// Default maximum time the window stays open after power-on.
const PAIRING_WINDOW_DURATION_DEFAULT: Duration = Duration::from_secs(30);

/// Source of the monotonic-since-boot clock, injectable for tests.
pub type BootClock = Arc<dyn Fn() -> Option<Duration> + Send + Sync>;

/// Configuration of the power-on controller.
#[derive(Debug, Clone, Default)]
pub struct PowerOnConfig {
    /// How long the window stays open after power-on.
    pub duration: OptionalDuration,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PowerOnConfigYaml {
    #[serde(default)]
    duration: OptionalDuration,
}

impl ControllerConfig for PowerOnConfig {
    fn equal(&self, other: &dyn ControllerConfig) -> bool {
        other
            .as_any()
            .downcast_ref::<PowerOnConfig>()
            .is_some_and(|o| o.duration.value == self.duration.value)
    }

    fn validate(&self) -> Result<(), PlanError> {
        Ok(())
    }

    fn to_yaml(&self) -> Result<serde_yaml::Value, PlanError> {
        let mut out = serde_yaml::Mapping::new();
        let duration = if self.duration.is_set {
            self.duration.value
        } else {
            PAIRING_WINDOW_DURATION_DEFAULT
        };
        out.insert(
            "duration".into(),
            crate::plan::format_duration(duration).into(),
        );
        Ok(serde_yaml::Value::Mapping(out))
    }

    fn boxed_clone(&self) -> Box<dyn ControllerConfig> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Extension registering the power-on controller type.
pub struct PowerOnExtension {
    boot_clock: BootClock,
}

impl Default for PowerOnExtension {
    fn default() -> Self {
        PowerOnExtension {
            boot_clock: Arc::new(osutil::boot_clock),
        }
    }
}

impl PowerOnExtension {
    pub fn new() -> PowerOnExtension {
        PowerOnExtension::default()
    }

    /// Replaces the boot-clock source (tests pin it to a fixed value).
    pub fn with_boot_clock(boot_clock: BootClock) -> PowerOnExtension {
        PowerOnExtension { boot_clock }
    }
}

impl ControllerExtension for PowerOnExtension {
    fn parse_config(&self, data: serde_yaml::Value) -> Result<Box<dyn ControllerConfig>, PlanError> {
        if data.is_null() {
            return Ok(Box::new(PowerOnConfig::default()));
        }
        let parsed: PowerOnConfigYaml = serde_yaml::from_value(data)
            .map_err(|e| PlanError::format(format!("cannot parse the controller config: {e}")))?;
        Ok(Box::new(PowerOnConfig {
            duration: parsed.duration,
        }))
    }

    fn combine_configs(
        &self,
        configs: &[&dyn ControllerConfig],
    ) -> Result<Box<dyn ControllerConfig>, PlanError> {
        let mut combined = PowerOnConfig::default();
        for config in configs {
            let config = config
                .as_any()
                .downcast_ref::<PowerOnConfig>()
                .ok_or_else(|| {
                    PlanError::format("internal error: power-on config has wrong concrete type")
                })?;
            if config.duration.is_set {
                combined.duration = config.duration;
            }
        }
        if !combined.duration.is_set {
            combined.duration = OptionalDuration::set(PAIRING_WINDOW_DURATION_DEFAULT);
        }
        Ok(Box::new(combined))
    }

    fn new_controller(&self, accessor: Arc<dyn PairingAccessor>) -> Arc<dyn Controller> {
        Arc::new(PowerOnController {
            accessor,
            boot_clock: Arc::clone(&self.boot_clock),
            inner: Mutex::new(PowerOnInner {
                config: PowerOnConfig::default(),
                timer: None,
            }),
        })
    }
}

struct PowerOnInner {
    config: PowerOnConfig,
    /// Cancellation token of the armed close timer; present once the
    /// window was opened.
    timer: Option<CancellationToken>,
}

/// Controller opening the window right after host power-on.
pub struct PowerOnController {
    accessor: Arc<dyn PairingAccessor>,
    boot_clock: BootClock,
    inner: Mutex<PowerOnInner>,
}

impl Controller for PowerOnController {
    fn controller_type(&self) -> &str {
        POWER_ON_CONTROLLER
    }

    fn config(&self) -> Option<Box<dyn ControllerConfig>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Some(Box::new(inner.config.clone()))
    }

    fn pairing_disabled(&self, reason: DisableReason) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Stop the close timer but keep it as the armed marker: this
        // controller never re-opens the window once it has fired.
        if let Some(timer) = &inner.timer {
            timer.cancel();
        }
        debug!(%reason, "power-on controller received pairing disabled");
    }

    fn ensure_config(&self, config: Option<&dyn ControllerConfig>) -> Result<(), PairingError> {
        // Decide under the lock, open the window outside it: the
        // accessor takes the manager lock and must not nest inside ours.
        let (open, duration) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            let Some(config) = config else {
                if let Some(timer) = inner.timer.take() {
                    timer.cancel();
                }
                return Ok(());
            };
            let config = config
                .as_any()
                .downcast_ref::<PowerOnConfig>()
                .ok_or_else(|| PairingError::Controller {
                    controller: POWER_ON_CONTROLLER.to_string(),
                    reason: "configuration has wrong concrete type".to_string(),
                })?;
            inner.config = config.clone();

            // No reconfiguration once the window was opened.
            if inner.timer.is_some() {
                return Ok(());
            }

            let recently_booted = (self.boot_clock)()
                .map(|boot| boot < POWER_ON_BOOT_EXPIRY)
                .unwrap_or(false);
            if !recently_booted {
                return Ok(());
            }
            let duration = if inner.config.duration.is_set {
                inner.config.duration.value
            } else {
                PAIRING_WINDOW_DURATION_DEFAULT
            };
            let token = CancellationToken::new();
            inner.timer = Some(token.clone());
            (token, duration)
        };

        if let Err(e) = self.accessor.enable_pairing() {
            warn!(error = %e, "cannot enable pairing using power-on controller");
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(timer) = inner.timer.take() {
                timer.cancel();
            }
            return Ok(());
        }

        let accessor = Arc::clone(&self.accessor);
        tokio::spawn(async move {
            tokio::select! {
                _ = open.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    if let Err(e) = accessor.disable_pairing() {
                        warn!(error = %e, "cannot disable pairing using power-on controller");
                    }
                }
            }
        });
        Ok(())
    }
}
