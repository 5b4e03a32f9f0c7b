//! # The `log-targets` plan section.
//!
//! [`LogTarget`] names a remote server that service logs are forwarded to.
//! The `services` list selects which services forward there: entries are
//! matched last-one-wins, `-name` excludes a service, and `all`/`-all` act
//! as wildcards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::plan::types::Override;

/// Reserved label-key prefix; rejected at parse time.
pub(crate) const RESERVED_LABEL_PREFIX: &str = "pebble_";

/// Forwarding protocol of a log target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTargetType {
    #[default]
    #[serde(rename = "")]
    Unset,
    Loki,
    Syslog,
}

impl LogTargetType {
    fn is_unset(&self) -> bool {
        matches!(self, LogTargetType::Unset)
    }
}

/// A single log target entry in a layer or combined plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LogTarget {
    /// Entry name; comes from the map key, not the YAML body.
    #[serde(skip)]
    pub name: String,

    #[serde(default, rename = "type", skip_serializing_if = "LogTargetType::is_unset")]
    pub target_type: LogTargetType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
    #[serde(default, rename = "override", skip_serializing_if = "Override::is_unknown")]
    pub r#override: Override,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl LogTarget {
    /// Merges the fields set in `other` into `self`.
    ///
    /// The `services` list is appended (not deduplicated), which is what
    /// makes the last-one-wins matching of [`LogTarget::logs_to`] work
    /// across layers.
    pub fn merge(&mut self, other: &LogTarget) {
        if other.target_type != LogTargetType::Unset {
            self.target_type = other.target_type;
        }
        if !other.location.is_empty() {
            self.location = other.location.clone();
        }
        self.services.extend(other.services.iter().cloned());
        for (k, v) in &other.labels {
            self.labels.insert(k.clone(), v.clone());
        }
    }

    /// Returns true if logs from `service` should be forwarded to this
    /// target. The last matching entry of `services` wins.
    pub fn logs_to(&self, service: &str) -> bool {
        for entry in self.services.iter().rev() {
            if entry == service || entry == "all" {
                return true;
            }
            if let Some(excluded) = entry.strip_prefix('-') {
                if excluded == service || excluded == "all" {
                    return false;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(services: &[&str]) -> LogTarget {
        LogTarget {
            name: "remote".into(),
            target_type: LogTargetType::Loki,
            location: "http://loki:3100".into(),
            services: services.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn logs_to_last_match_wins() {
        assert!(target(&["all"]).logs_to("web"));
        assert!(!target(&["all", "-web"]).logs_to("web"));
        assert!(target(&["-all", "web"]).logs_to("web"));
        assert!(!target(&["web", "-all"]).logs_to("web"));
        assert!(!target(&[]).logs_to("web"));
    }

    #[test]
    fn merge_appends_services() {
        let mut base = target(&["all"]);
        base.merge(&target(&["-web"]));
        assert_eq!(base.services, vec!["all", "-web"]);
        assert!(!base.logs_to("web"));
        assert!(base.logs_to("db"));
    }
}
