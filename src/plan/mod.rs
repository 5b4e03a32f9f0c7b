//! # The layered configuration plan.
//!
//! A [`Plan`] is assembled from an ordered set of declarative [`Layer`]s.
//! Each layer carries named sections: the built-in `services`, `checks`,
//! and `log-targets`, plus any sections added through the
//! [`extension`](crate::plan::extension) registry. Layers combine in
//! ascending order; every section entry's `override` field decides whether
//! it merges into or replaces the same-named entry below it.
//!
//! ```text
//! layers/001-base.yaml  ──┐
//! layers/002-tune.yaml  ──┼──► combine (ascending order) ──► validate ──► Plan
//! runtime layers        ──┘
//! ```
//!
//! ## Rules
//! - Validation runs **before** a combined plan is published; a plan that
//!   fails validation leaves no trace.
//! - On-disk layers live in `<base>/layers/NNN-label.yaml`; order and label
//!   are pairwise unique.
//! - Unknown top-level keys and unknown entry fields are format errors.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_yaml::Value;
use tracing::warn;

use crate::error::PlanError;

pub mod check;
pub mod extension;
pub mod logtarget;
pub mod service;
pub mod types;

pub use check::{Check, CheckLevel, ExecCheck, HttpCheck, TcpCheck};
pub use extension::{register_section, unregister_section, Section, SectionExtension};
pub use logtarget::{LogTarget, LogTargetType};
pub use service::{command_string, Service, ServiceAction, ServiceStartup};
pub use types::{format_duration, parse_duration, OptionalDuration, OptionalFloat, Override};

use check::{DEFAULT_CHECK_PERIOD, DEFAULT_CHECK_THRESHOLD, DEFAULT_CHECK_TIMEOUT};
use logtarget::RESERVED_LABEL_PREFIX;
use service::{
    order_services, DEFAULT_BACKOFF_DELAY, DEFAULT_BACKOFF_FACTOR, DEFAULT_BACKOFF_LIMIT,
};

/// On-disk layer filename shape: `NNN-label.yaml`.
static LAYER_FILENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]{3})-([a-z](?:-?[a-z0-9]){2,})\.yaml$").unwrap());

/// An ordered, labelled bundle of declarative configuration.
#[derive(Debug, Clone, Default)]
pub struct Layer {
    /// Position within the layer set; unique, ascending.
    pub order: i32,
    /// Unique human label (`[a-z](?:-?[a-z0-9]){2,}` on disk).
    pub label: String,
    pub summary: String,
    pub description: String,
    /// Built-in sections.
    pub services: BTreeMap<String, Service>,
    pub checks: BTreeMap<String, Check>,
    pub log_targets: BTreeMap<String, LogTarget>,
    /// Extension sections, keyed by registered section name.
    pub sections: BTreeMap<String, Box<dyn Section>>,
}

impl Layer {
    /// Parses YAML bytes into a layer with the given order and label.
    ///
    /// All registered extension sections are instantiated even when absent
    /// from the YAML. Unknown top-level keys are rejected, as are unknown
    /// fields inside section entries.
    pub fn parse(order: i32, label: &str, data: &[u8]) -> Result<Layer, PlanError> {
        let parse_err = |err: &dyn std::fmt::Display| {
            PlanError::format(format!("cannot parse layer {label:?}: {err}"))
        };

        let doc: Value =
            serde_yaml::from_slice(data).map_err(|e| parse_err(&e))?;
        let mapping = match doc {
            Value::Null => serde_yaml::Mapping::new(),
            Value::Mapping(m) => m,
            _ => return Err(parse_err(&"layer must be a YAML mapping")),
        };

        let mut layer = Layer {
            order,
            label: label.to_string(),
            ..Default::default()
        };

        for (key, value) in mapping {
            let Value::String(key) = key else {
                return Err(parse_err(&"section keys must be strings"));
            };
            match key.as_str() {
                "summary" if value.is_null() => {}
                "summary" => {
                    layer.summary = serde_yaml::from_value(value).map_err(|e| parse_err(&e))?;
                }
                "description" if value.is_null() => {}
                "description" => {
                    layer.description = serde_yaml::from_value(value).map_err(|e| parse_err(&e))?;
                }
                "services" => layer.services = parse_entries(label, "service", value)?,
                "checks" => layer.checks = parse_entries(label, "check", value)?,
                "log-targets" => {
                    layer.log_targets = parse_entries(label, "log target", value)?;
                }
                other => match extension::find_section(other) {
                    Some(ext) => {
                        layer.sections.insert(other.to_string(), ext.parse_section(value)?);
                    }
                    None => {
                        return Err(parse_err(&format!("unknown section {other:?}")));
                    }
                },
            }
        }

        // Instantiate registered sections the YAML did not mention.
        for (name, ext) in extension::registered_sections() {
            if !layer.sections.contains_key(&name) {
                layer.sections.insert(name, ext.parse_section(Value::Null)?);
            }
        }

        layer.validate()?;
        Ok(layer)
    }

    /// Structural validation of a single layer: entry names, null bodies,
    /// reserved names and label prefixes, per-section validation of
    /// extension sections, and dependency cycles within this layer.
    fn validate(&mut self) -> Result<(), PlanError> {
        for (name, service) in &mut self.services {
            if name.is_empty() {
                return Err(PlanError::format("cannot use empty string as service name"));
            }
            if name == "pebble" {
                // Reserved to avoid ambiguity in log output.
                return Err(PlanError::format(format!(
                    "cannot use reserved service name {name:?}"
                )));
            }
            if matches!(name.as_str(), "all" | "default" | "none") {
                warn!(service = %name, "using this keyword as a service name is deprecated");
            }
            if name.starts_with('-') {
                return Err(PlanError::format(format!(
                    "cannot use service name {name:?}: starting with \"-\" not allowed"
                )));
            }
            service.name = name.clone();
        }

        for (name, check) in &mut self.checks {
            if name.is_empty() {
                return Err(PlanError::format("cannot use empty string as check name"));
            }
            check.name = name.clone();
        }

        for (name, target) in &mut self.log_targets {
            if name.is_empty() {
                return Err(PlanError::format(
                    "cannot use empty string as log target name",
                ));
            }
            for label_name in target.labels.keys() {
                if label_name.starts_with(RESERVED_LABEL_PREFIX) {
                    return Err(PlanError::format(format!(
                        "log target {name:?}: label {label_name:?} uses reserved prefix {RESERVED_LABEL_PREFIX:?}"
                    )));
                }
            }
            target.name = name.clone();
        }

        for section in self.sections.values() {
            section.validate()?;
        }

        self.check_cycles()
    }

    /// Ensures the service ordering graph of this layer is acyclic.
    fn check_cycles(&self) -> Result<(), PlanError> {
        let names: Vec<String> = self.services.keys().cloned().collect();
        order_services(&self.services, &names, false).map(|_| ())
    }

    /// Marshals the layer back to YAML. Defaulted fields and empty
    /// sections are omitted.
    pub fn to_yaml(&self) -> Result<Value, PlanError> {
        let marshal_err =
            |e: serde_yaml::Error| PlanError::format(format!("cannot marshal layer: {e}"));
        let mut out = serde_yaml::Mapping::new();
        if !self.summary.is_empty() {
            out.insert("summary".into(), self.summary.clone().into());
        }
        if !self.description.is_empty() {
            out.insert("description".into(), self.description.clone().into());
        }
        if !self.services.is_empty() {
            out.insert(
                "services".into(),
                serde_yaml::to_value(&self.services).map_err(marshal_err)?,
            );
        }
        if !self.checks.is_empty() {
            out.insert(
                "checks".into(),
                serde_yaml::to_value(&self.checks).map_err(marshal_err)?,
            );
        }
        if !self.log_targets.is_empty() {
            out.insert(
                "log-targets".into(),
                serde_yaml::to_value(&self.log_targets).map_err(marshal_err)?,
            );
        }
        for (name, section) in &self.sections {
            if !section.is_empty() {
                out.insert(name.clone().into(), section.to_yaml()?);
            }
        }
        Ok(Value::Mapping(out))
    }
}

/// Parses a section's `name -> entry` map, rejecting null entry bodies.
fn parse_entries<T: serde::de::DeserializeOwned>(
    label: &str,
    what: &str,
    value: Value,
) -> Result<BTreeMap<String, T>, PlanError> {
    if value.is_null() {
        return Ok(BTreeMap::new());
    }
    let raw: BTreeMap<String, Option<T>> = serde_yaml::from_value(value)
        .map_err(|e| PlanError::format(format!("cannot parse layer {label:?}: {e}")))?;
    let mut out = BTreeMap::new();
    for (name, entry) in raw {
        let Some(entry) = entry else {
            return Err(PlanError::format(format!(
                "{what} object cannot be null for {what} {name:?}"
            )));
        };
        out.insert(name, entry);
    }
    Ok(out)
}

/// Combines the given layers into a single layer, later layers overriding
/// earlier ones per each entry's `override` policy.
///
/// The result carries no order or label. Built-in sections are combined
/// here; extension sections are combined by their registered extensions in
/// registration order. The combined layer is validated (defaults applied,
/// invariants enforced) before being returned.
pub fn combine_layers(layers: &[&Layer]) -> Result<Layer, PlanError> {
    let mut combined = Layer::default();
    if let Some(last) = layers.last() {
        combined.summary = last.summary.clone();
        combined.description = last.description.clone();
    }

    for layer in layers {
        combine_entries(
            &mut combined.services,
            &layer.services,
            &layer.label,
            "service",
            |acc, entry| acc.merge(entry),
        )?;
        combine_entries(
            &mut combined.checks,
            &layer.checks,
            &layer.label,
            "check",
            |acc, entry| acc.merge(entry),
        )?;
        combine_entries(
            &mut combined.log_targets,
            &layer.log_targets,
            &layer.label,
            "log target",
            |acc, entry| acc.merge(entry),
        )?;
    }

    for (name, ext) in extension::registered_sections() {
        let sections: Vec<&dyn Section> = layers
            .iter()
            .filter_map(|l| l.sections.get(&name).map(|s| s.as_ref()))
            .collect();
        combined.sections.insert(name, ext.combine_sections(&sections)?);
    }

    validate_combined(&mut combined)?;
    Ok(combined)
}

/// The merge/replace walk for one built-in section.
fn combine_entries<T: Clone + HasOverride>(
    acc: &mut BTreeMap<String, T>,
    entries: &BTreeMap<String, T>,
    layer_label: &str,
    what: &str,
    merge: impl Fn(&mut T, &T),
) -> Result<(), PlanError> {
    for (name, entry) in entries {
        match entry.override_policy() {
            Override::Merge => {
                if let Some(old) = acc.get_mut(name) {
                    merge(old, entry);
                    continue;
                }
                acc.insert(name.clone(), entry.clone());
            }
            Override::Replace => {
                acc.insert(name.clone(), entry.clone());
            }
            Override::Unknown => {
                return Err(PlanError::format(format!(
                    "layer {layer_label:?} must define \"override\" for {what} {name:?}"
                )));
            }
        }
    }
    Ok(())
}

trait HasOverride {
    fn override_policy(&self) -> Override;
}

impl HasOverride for Service {
    fn override_policy(&self) -> Override {
        self.r#override
    }
}

impl HasOverride for Check {
    fn override_policy(&self) -> Override {
        self.r#override
    }
}

impl HasOverride for LogTarget {
    fn override_policy(&self) -> Override {
        self.r#override
    }
}

/// Validates the combined layer and applies defaults.
fn validate_combined(combined: &mut Layer) -> Result<(), PlanError> {
    for (name, service) in &mut combined.services {
        if service.command.is_empty() {
            return Err(PlanError::format(format!(
                "plan must define \"command\" for service {name:?}"
            )));
        }
        service.parse_command()?;
        if !service
            .on_success
            .valid_in_context(ServiceAction::FailureShutdown)
        {
            return Err(PlanError::format(format!(
                "plan service {name:?} on-success action {:?} invalid",
                service.on_success
            )));
        }
        if !service
            .on_failure
            .valid_in_context(ServiceAction::SuccessShutdown)
        {
            return Err(PlanError::format(format!(
                "plan service {name:?} on-failure action {:?} invalid",
                service.on_failure
            )));
        }
        for action in service.on_check_failure.values() {
            if !action.valid_in_context(ServiceAction::SuccessShutdown) {
                return Err(PlanError::format(format!(
                    "plan service {name:?} on-check-failure action {action:?} invalid"
                )));
            }
        }
        if !service.backoff_delay.is_set {
            service.backoff_delay.value = DEFAULT_BACKOFF_DELAY;
        }
        if !service.backoff_factor.is_set {
            service.backoff_factor.value = DEFAULT_BACKOFF_FACTOR;
        } else if service.backoff_factor.value < 1.0 {
            return Err(PlanError::format(format!(
                "plan service {name:?} backoff-factor must be 1.0 or greater, not {}",
                service.backoff_factor.value
            )));
        }
        if !service.backoff_limit.is_set {
            service.backoff_limit.value = DEFAULT_BACKOFF_LIMIT;
        }
    }

    let service_names: Vec<&str> = combined.services.keys().map(String::as_str).collect();

    for (name, check) in &mut combined.checks {
        if !check.period.is_set {
            check.period.value = DEFAULT_CHECK_PERIOD;
        } else if check.period.value.is_zero() {
            return Err(PlanError::format(format!(
                "plan check {name:?} period must not be zero"
            )));
        }
        if !check.timeout.is_set {
            check.timeout.value = DEFAULT_CHECK_TIMEOUT;
        } else if check.timeout.value.is_zero() {
            return Err(PlanError::format(format!(
                "plan check {name:?} timeout must not be zero"
            )));
        } else if check.timeout.value > check.period.value {
            // An over-long timeout is capped to the period; the user-set
            // flag stays clear so marshalling does not invent the field.
            check.timeout.value = check.period.value;
            check.timeout.is_set = false;
        }
        if check.threshold == 0 {
            // Default to >1 to avoid flapping on glitches.
            check.threshold = DEFAULT_CHECK_THRESHOLD;
        }

        let mut num_types = 0;
        if let Some(http) = &check.http {
            if http.url.is_empty() {
                return Err(PlanError::format(format!(
                    "plan must set \"url\" for http check {name:?}"
                )));
            }
            num_types += 1;
        }
        if let Some(tcp) = &check.tcp {
            if tcp.port == 0 {
                return Err(PlanError::format(format!(
                    "plan must set \"port\" for tcp check {name:?}"
                )));
            }
            num_types += 1;
        }
        if let Some(exec) = &check.exec {
            if exec.command.is_empty() {
                return Err(PlanError::format(format!(
                    "plan must set \"command\" for exec check {name:?}"
                )));
            }
            if shlex::split(&exec.command).is_none() {
                return Err(PlanError::format(format!(
                    "plan check {name:?} command invalid"
                )));
            }
            if !exec.service_context.is_empty()
                && !service_names.contains(&exec.service_context.as_str())
            {
                return Err(PlanError::format(format!(
                    "plan check {name:?} service context specifies non-existent service {:?}",
                    exec.service_context
                )));
            }
            num_types += 1;
        }
        if num_types != 1 {
            return Err(PlanError::format(format!(
                "plan must specify one of \"http\", \"tcp\", or \"exec\" for check {name:?}"
            )));
        }
    }

    for (name, target) in &combined.log_targets {
        if target.target_type == LogTargetType::Unset {
            return Err(PlanError::format(format!(
                "plan must define \"type\" (\"loki\" or \"syslog\") for log target {name:?}"
            )));
        }
        for service_name in &target.services {
            let bare = service_name.strip_prefix('-').unwrap_or(service_name);
            if bare == "all" || service_names.contains(&bare) {
                continue;
            }
            return Err(PlanError::format(format!(
                "log target {name:?} specifies unknown service {bare:?}"
            )));
        }
        if target.location.is_empty() {
            return Err(PlanError::format(format!(
                "plan must define \"location\" for log target {name:?}"
            )));
        }
    }

    combined.check_cycles()
}

/// The combined, validated plan: the layer list plus the result of
/// combining them.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    layers: Vec<Layer>,
    combined: Layer,
}

impl Plan {
    /// Builds a plan by combining `layers` in the given order and running
    /// full validation, including extension cross-section validation.
    pub fn from_layers(layers: Vec<Layer>) -> Result<Plan, PlanError> {
        let refs: Vec<&Layer> = layers.iter().collect();
        let combined = combine_layers(&refs)?;
        let plan = Plan { layers, combined };
        for (_, ext) in extension::registered_sections() {
            ext.validate_plan(&plan)?;
        }
        Ok(plan)
    }

    /// Reads all layer files from the `layers` sub-directory of `base_dir`
    /// and builds the combined plan. A missing directory yields an empty
    /// plan.
    pub fn read_dir(base_dir: &Path) -> Result<Plan, PlanError> {
        let layers_dir = base_dir.join("layers");
        if !layers_dir.exists() {
            return Plan::from_layers(Vec::new());
        }
        Plan::from_layers(read_layers_dir(&layers_dir)?)
    }

    /// The layers this plan was combined from, ascending order.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Combined `services` section.
    pub fn services(&self) -> &BTreeMap<String, Service> {
        &self.combined.services
    }

    /// Combined `checks` section.
    pub fn checks(&self) -> &BTreeMap<String, Check> {
        &self.combined.checks
    }

    /// Combined `log-targets` section.
    pub fn log_targets(&self) -> &BTreeMap<String, LogTarget> {
        &self.combined.log_targets
    }

    /// Combined extension sections, keyed by registered section name.
    pub fn sections(&self) -> &BTreeMap<String, Box<dyn Section>> {
        &self.combined.sections
    }

    /// Typed access to a combined extension section.
    ///
    /// Returns `None` when the section is not present or has a different
    /// concrete type.
    pub fn section<T: Section>(&self, name: &str) -> Option<&T> {
        self.combined
            .sections
            .get(name)
            .and_then(|s| s.as_any().downcast_ref::<T>())
    }

    /// Services that must start for `names` to run, dependency-first.
    pub fn start_order(&self, names: &[String]) -> Result<Vec<String>, PlanError> {
        order_services(&self.combined.services, names, false)
    }

    /// Services that must stop for `names` to stop, dependents-first.
    pub fn stop_order(&self, names: &[String]) -> Result<Vec<String>, PlanError> {
        order_services(&self.combined.services, names, true)
    }

    /// Marshals the combined plan to YAML.
    pub fn to_yaml(&self) -> Result<Value, PlanError> {
        self.combined.to_yaml()
    }
}

/// Reads and parses every layer file in `dir`.
///
/// Files are visited in lexical order. Subdirectories and files without a
/// `.yaml` suffix are ignored; a `.yaml` file that does not match the
/// `NNN-label.yaml` shape is an error, as is a duplicate order or label.
pub fn read_layers_dir(dir: &Path) -> Result<Vec<Layer>, PlanError> {
    let mut names: Vec<(String, bool)> = fs::read_dir(dir)?
        .map(|entry| {
            let entry = entry?;
            let is_dir = entry.file_type()?.is_dir();
            Ok((entry.file_name().to_string_lossy().into_owned(), is_dir))
        })
        .collect::<Result<_, std::io::Error>>()?;
    names.sort();

    let mut orders: BTreeMap<i32, String> = BTreeMap::new();
    let mut labels: BTreeMap<String, i32> = BTreeMap::new();
    let mut layers = Vec::new();

    for (name, is_dir) in names {
        if is_dir || !name.ends_with(".yaml") {
            continue;
        }
        let Some(caps) = LAYER_FILENAME.captures(&name) else {
            return Err(PlanError::format(format!(
                "invalid layer filename: {name:?} (must look like \"123-some-label.yaml\")"
            )));
        };
        let order: i32 = caps[1].parse().expect("filename regexp admits non-numbers");
        let label = caps[2].to_string();

        if let Some(old_label) = orders.get(&order) {
            return Err(PlanError::format(format!(
                "invalid layer filename: {name:?} not unique (have \"{order:03}-{old_label}.yaml\" already)"
            )));
        }
        if let Some(old_order) = labels.get(&label) {
            return Err(PlanError::format(format!(
                "invalid layer filename: {name:?} not unique (have \"{old_order:03}-{label}.yaml\" already)"
            )));
        }
        orders.insert(order, label.clone());
        labels.insert(label.clone(), order);

        let data = fs::read(dir.join(&name))?;
        layers.push(Layer::parse(order, &label, &data)?);
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_unknown_section() {
        let err = Layer::parse(1, "base", b"summary: x\nnonsense:\n").unwrap_err();
        assert!(err.to_string().contains("unknown section"));
    }

    #[test]
    fn parse_rejects_null_service() {
        let err = Layer::parse(1, "base", b"services:\n  web:\n").unwrap_err();
        assert!(err.to_string().contains("cannot be null"));
    }

    #[test]
    fn parse_rejects_reserved_name() {
        let data = b"services:\n  pebble:\n    override: replace\n    command: /bin/x\n";
        let err = Layer::parse(1, "base", data).unwrap_err();
        assert!(err.to_string().contains("reserved service name"));
    }

    #[test]
    fn combine_requires_override() {
        let layer = Layer::parse(
            1,
            "base",
            b"services:\n  web:\n    command: /bin/srv\n",
        )
        .unwrap();
        let err = combine_layers(&[&layer]).unwrap_err();
        assert!(err.to_string().contains("must define \"override\""), "{err}");
    }

    #[test]
    fn combined_applies_service_defaults() {
        let layer = Layer::parse(
            1,
            "base",
            b"services:\n  web:\n    override: replace\n    command: /bin/srv\n",
        )
        .unwrap();
        let combined = combine_layers(&[&layer]).unwrap();
        let web = &combined.services["web"];
        assert_eq!(web.backoff_delay.value, DEFAULT_BACKOFF_DELAY);
        assert!(!web.backoff_delay.is_set);
        assert_eq!(web.backoff_factor.value, DEFAULT_BACKOFF_FACTOR);
        assert_eq!(web.backoff_limit.value, DEFAULT_BACKOFF_LIMIT);
    }

    #[test]
    fn check_timeout_capped_to_period() {
        let layer = Layer::parse(
            1,
            "base",
            b"checks:\n  up:\n    override: replace\n    period: 5s\n    timeout: 10s\n    tcp:\n      port: 80\n",
        )
        .unwrap();
        let combined = combine_layers(&[&layer]).unwrap();
        let up = &combined.checks["up"];
        assert_eq!(up.timeout.value, up.period.value);
        assert!(!up.timeout.is_set);
        assert_eq!(up.threshold, DEFAULT_CHECK_THRESHOLD);
    }

    #[test]
    fn marshal_omits_defaults() {
        let layer = Layer::parse(
            1,
            "base",
            b"summary: base\nservices:\n  web:\n    override: replace\n    command: /bin/srv\n",
        )
        .unwrap();
        let yaml = serde_yaml::to_string(&layer.to_yaml().unwrap()).unwrap();
        assert!(yaml.contains("summary: base"));
        assert!(yaml.contains("command: /bin/srv"));
        assert!(!yaml.contains("backoff"));
    }
}
