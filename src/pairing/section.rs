//! # The `pairing` plan section.
//!
//! The section carries the pairing manager mode and the selected
//! controller with its type-specific configuration:
//!
//! ```yaml
//! pairing:
//!   override: merge
//!   mode: single
//!   controller:
//!     type: power-on
//!     duration: 30s
//! ```
//!
//! Combining has one rule beyond the ordinary override policy: if the
//! controller *type* changes between layers, the upper layer must carry
//! `override: replace`, otherwise the combine fails.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::PlanError;
use crate::pairing::controller::{find_controller, ControllerConfig};
use crate::plan::{Override, Plan, Section, SectionExtension};

/// Section key in the plan schema.
pub const PAIRING_SECTION: &str = "pairing";

/// Pairing policy of the manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingMode {
    #[default]
    #[serde(rename = "")]
    Unset,
    /// No pairing is permitted.
    Disabled,
    /// Pairing is permitted until the first success.
    Single,
    /// Pairing is permitted repeatedly.
    Multiple,
}

impl PairingMode {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            PairingMode::Unset => "",
            PairingMode::Disabled => "disabled",
            PairingMode::Single => "single",
            PairingMode::Multiple => "multiple",
        }
    }
}

/// Parsed `pairing` section of one layer, or the combined plan.
#[derive(Debug, Clone, Default)]
pub struct PairingSection {
    pub r#override: Override,
    pub mode: PairingMode,
    /// Selected controller type; empty when no controller is configured.
    pub controller_type: String,
    /// Controller-specific configuration, when a controller is selected.
    pub controller_config: Option<Box<dyn ControllerConfig>>,
}

impl Section for PairingSection {
    fn validate(&self) -> Result<(), PlanError> {
        if let Some(config) = &self.controller_config {
            config.validate()?;
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        // Always marshal at least the mode, so an unconfigured plan
        // still shows pairing as disabled.
        false
    }

    fn to_yaml(&self) -> Result<Value, PlanError> {
        let mut out = serde_yaml::Mapping::new();
        let mode = if self.mode == PairingMode::Unset {
            PairingMode::Disabled
        } else {
            self.mode
        };
        out.insert("mode".into(), mode.as_str().into());
        if !self.controller_type.is_empty() {
            let mut controller = serde_yaml::Mapping::new();
            controller.insert("type".into(), self.controller_type.clone().into());
            if let Some(config) = &self.controller_config {
                if let Value::Mapping(fields) = config.to_yaml()? {
                    for (k, v) in fields {
                        controller.insert(k, v);
                    }
                }
            }
            out.insert("controller".into(), Value::Mapping(controller));
        }
        Ok(Value::Mapping(out))
    }

    fn boxed_clone(&self) -> Box<dyn Section> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// The plan section extension registering `pairing`.
#[derive(Debug, Default)]
pub struct PairingSectionExtension;

impl SectionExtension for PairingSectionExtension {
    fn parse_section(&self, data: Value) -> Result<Box<dyn Section>, PlanError> {
        let mapping = match data {
            // An absent section merges by default, so a layer without a
            // pairing key does not need to spell the override out.
            Value::Null => {
                return Ok(Box::new(PairingSection {
                    r#override: Override::Merge,
                    ..Default::default()
                }))
            }
            Value::Mapping(m) => m,
            _ => {
                return Err(PlanError::format(
                    "cannot parse the pairing section: must be a YAML mapping",
                ))
            }
        };

        let mut section = PairingSection::default();
        for (key, value) in mapping {
            let Value::String(key) = key else {
                return Err(PlanError::format(
                    "cannot parse the pairing section: keys must be strings",
                ));
            };
            match key.as_str() {
                "override" => {
                    section.r#override = serde_yaml::from_value(value).map_err(|e| {
                        PlanError::format(format!("cannot parse the pairing section: {e}"))
                    })?;
                }
                "mode" => {
                    section.mode = serde_yaml::from_value(value).map_err(|e| {
                        PlanError::format(format!("cannot parse the pairing section: {e}"))
                    })?;
                }
                "controller" => parse_controller(value, &mut section)?,
                other => {
                    return Err(PlanError::format(format!(
                        "cannot parse the pairing section: unknown field {other:?}"
                    )));
                }
            }
        }
        Ok(Box::new(section))
    }

    fn combine_sections(&self, sections: &[&dyn Section]) -> Result<Box<dyn Section>, PlanError> {
        // The combined section may itself re-enter a combine (layer
        // updates merge the stored layer with the supplied one), so it
        // carries the neutral merge policy.
        let mut combined = PairingSection {
            r#override: Override::Merge,
            ..Default::default()
        };
        let layers: Vec<&PairingSection> = sections
            .iter()
            .map(|s| {
                s.as_any().downcast_ref::<PairingSection>().ok_or_else(|| {
                    PlanError::format("internal error: pairing section has wrong concrete type")
                })
            })
            .collect::<Result<_, _>>()?;

        // Combine the manager mode under the ordinary override policy.
        for layer in &layers {
            match layer.r#override {
                Override::Merge => {
                    if layer.mode != PairingMode::Unset {
                        combined.mode = layer.mode;
                    }
                }
                Override::Replace => {
                    combined.mode = layer.mode;
                }
                Override::Unknown => {
                    return Err(PlanError::format(
                        "pairing must define an \"override\" policy",
                    ));
                }
            }
        }
        if combined.mode == PairingMode::Unset {
            combined.mode = PairingMode::Disabled;
        }

        // Controller configs merge only while the type is stable; a type
        // change requires the upper layer to replace.
        let mut controller_type = String::new();
        let mut merge_start = 0usize;
        for (i, layer) in layers.iter().enumerate() {
            if !controller_type.is_empty()
                && !layer.controller_type.is_empty()
                && controller_type != layer.controller_type
            {
                if layer.r#override != Override::Replace {
                    return Err(PlanError::format(
                        "cannot merge different controller configurations (only replace)",
                    ));
                }
                merge_start = i;
            }
            if !layer.controller_type.is_empty() {
                controller_type = layer.controller_type.clone();
            }
        }

        if !controller_type.is_empty() {
            let ext = find_controller(&controller_type).ok_or_else(|| {
                PlanError::format(format!(
                    "cannot decode pairing controller configuration: unknown type {controller_type:?}"
                ))
            })?;
            let configs: Vec<&dyn ControllerConfig> = layers[merge_start..]
                .iter()
                .filter_map(|l| l.controller_config.as_deref())
                .collect();
            combined.controller_config = Some(ext.combine_configs(&configs)?);
            combined.controller_type = controller_type;
        }

        Ok(Box::new(combined))
    }

    fn validate_plan(&self, _plan: &Plan) -> Result<(), PlanError> {
        // No cross-section validation needed.
        Ok(())
    }
}

/// Splits the `controller` sub-document into its `type` and the
/// type-specific fields, parsed by the matching controller extension.
fn parse_controller(value: Value, section: &mut PairingSection) -> Result<(), PlanError> {
    let mapping = match value {
        Value::Null => return Ok(()),
        Value::Mapping(m) => m,
        _ => {
            return Err(PlanError::format(
                "cannot parse the pairing controller: must be a YAML mapping",
            ))
        }
    };

    let mut controller_type = String::new();
    let mut fields = serde_yaml::Mapping::new();
    for (key, value) in mapping {
        if key == Value::from("type") {
            controller_type = serde_yaml::from_value(value).map_err(|e| {
                PlanError::format(format!("cannot parse the pairing controller type: {e}"))
            })?;
        } else {
            fields.insert(key, value);
        }
    }

    if controller_type.is_empty() {
        if fields.is_empty() {
            return Ok(());
        }
        return Err(PlanError::format(
            "cannot decode pairing controller configuration: type missing",
        ));
    }

    let ext = find_controller(&controller_type).ok_or_else(|| {
        PlanError::format(format!(
            "cannot decode pairing controller configuration: unknown type {controller_type:?}"
        ))
    })?;
    section.controller_config = Some(ext.parse_config(Value::Mapping(fields))?);
    section.controller_type = controller_type;
    Ok(())
}
