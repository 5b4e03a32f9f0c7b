//! # The `checks` plan section.
//!
//! [`Check`] describes one periodic health check. Exactly one of the
//! `http`/`tcp`/`exec` sub-documents must be set; the combined-plan
//! validation in [`crate::plan`] enforces that along with the
//! timeout-versus-period rule and the default threshold.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plan::types::{OptionalDuration, Override};

pub(crate) const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
pub(crate) const DEFAULT_CHECK_THRESHOLD: u32 = 3;

/// The optional check level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckLevel {
    #[default]
    #[serde(rename = "")]
    Unset,
    Alive,
    Ready,
}

impl CheckLevel {
    fn is_unset(&self) -> bool {
        matches!(self, CheckLevel::Unset)
    }
}

/// A single health check entry in a layer or combined plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Check {
    /// Entry name; comes from the map key, not the YAML body.
    #[serde(skip)]
    pub name: String,

    #[serde(default, rename = "override", skip_serializing_if = "Override::is_unknown")]
    pub r#override: Override,
    #[serde(default, skip_serializing_if = "CheckLevel::is_unset")]
    pub level: CheckLevel,

    // Common settings.
    #[serde(default, skip_serializing_if = "OptionalDuration::is_unset")]
    pub period: OptionalDuration,
    #[serde(default, skip_serializing_if = "OptionalDuration::is_unset")]
    pub timeout: OptionalDuration,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub threshold: u32,

    // Type-specific settings; only one of these may be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecCheck>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl Check {
    /// Merges the fields set in `other` into `self`.
    pub fn merge(&mut self, other: &Check) {
        if other.level != CheckLevel::Unset {
            self.level = other.level;
        }
        if other.period.is_set {
            self.period = other.period;
        }
        if other.timeout.is_set {
            self.timeout = other.timeout;
        }
        if other.threshold != 0 {
            self.threshold = other.threshold;
        }
        if let Some(http) = &other.http {
            self.http.get_or_insert_with(Default::default).merge(http);
        }
        if let Some(tcp) = &other.tcp {
            self.tcp.get_or_insert_with(Default::default).merge(tcp);
        }
        if let Some(exec) = &other.exec {
            self.exec.get_or_insert_with(Default::default).merge(exec);
        }
    }
}

/// Configuration of an HTTP health check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct HttpCheck {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl HttpCheck {
    fn merge(&mut self, other: &HttpCheck) {
        if !other.url.is_empty() {
            self.url = other.url.clone();
        }
        for (k, v) in &other.headers {
            self.headers.insert(k.clone(), v.clone());
        }
    }
}

/// Configuration of a TCP port health check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TcpCheck {
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

impl TcpCheck {
    fn merge(&mut self, other: &TcpCheck) {
        if other.port != 0 {
            self.port = other.port;
        }
        if !other.host.is_empty() {
            self.host = other.host.clone();
        }
    }
}

/// Configuration of an exec health check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ExecCheck {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_context: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
}

impl ExecCheck {
    fn merge(&mut self, other: &ExecCheck) {
        if !other.command.is_empty() {
            self.command = other.command.clone();
        }
        if !other.service_context.is_empty() {
            self.service_context = other.service_context.clone();
        }
        for (k, v) in &other.environment {
            self.environment.insert(k.clone(), v.clone());
        }
        if other.user_id.is_some() {
            self.user_id = other.user_id;
        }
        if !other.user.is_empty() {
            self.user = other.user.clone();
        }
        if other.group_id.is_some() {
            self.group_id = other.group_id;
        }
        if !other.group.is_empty() {
            self.group = other.group.clone();
        }
        if !other.working_dir.is_empty() {
            self.working_dir = other.working_dir.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overlays_set_fields() {
        let mut base: Check = serde_yaml::from_str(
            "override: replace\nperiod: 10s\nhttp:\n  url: http://localhost/\n",
        )
        .unwrap();
        let upper: Check =
            serde_yaml::from_str("override: merge\ntimeout: 1s\nhttp:\n  headers:\n    X-A: b\n")
                .unwrap();
        base.merge(&upper);
        assert_eq!(base.period.value, Duration::from_secs(10));
        assert_eq!(base.timeout.value, Duration::from_secs(1));
        let http = base.http.unwrap();
        assert_eq!(http.url, "http://localhost/");
        assert_eq!(http.headers["X-A"], "b");
    }

    #[test]
    fn unknown_fields_rejected() {
        let res: Result<Check, _> = serde_yaml::from_str("override: merge\nfrequency: 3s\n");
        assert!(res.is_err());
    }
}
