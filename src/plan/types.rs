//! # Shared scalar types for plan sections.
//!
//! - [`Override`] the per-entry merge policy carried by every section entry.
//! - [`OptionalDuration`] / [`OptionalFloat`] values that remember whether
//!   they were explicitly set, so defaulted values marshal as absent.
//! - [`parse_duration`] / [`format_duration`] Go-style duration strings
//!   (`500ms`, `3s`, `1m30s`) used in layer YAML and in persisted notices.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Per-entry merge policy.
///
/// Every named entry inside a plan section carries an `override` field that
/// decides how the entry combines with a same-named entry from a lower
/// layer. An entry left at [`Override::Unknown`] fails at combine time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Override {
    /// No policy given; rejected when layers are combined.
    #[default]
    #[serde(rename = "")]
    Unknown,
    /// Merge set fields into the accumulated entry.
    Merge,
    /// Replace the accumulated entry wholesale.
    Replace,
}

impl Override {
    /// Returns true when no policy was supplied.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Override::Unknown)
    }
}

/// Duration that remembers whether it was explicitly set.
///
/// Unset values marshal as absent; combined-plan validation fills defaults
/// in without flipping `is_set`, so a defaulted plan round-trips without
/// inventing fields the user never wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionalDuration {
    pub value: Duration,
    pub is_set: bool,
}

impl OptionalDuration {
    /// An explicitly set duration.
    pub fn set(value: Duration) -> Self {
        OptionalDuration { value, is_set: true }
    }

    /// Returns true when the value was never supplied.
    pub fn is_unset(&self) -> bool {
        !self.is_set
    }
}

impl Serialize for OptionalDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(self.value))
    }
}

impl<'de> Deserialize<'de> for OptionalDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = OptionalDuration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration string such as \"500ms\" or \"1m30s\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                let value = parse_duration(v).map_err(E::custom)?;
                Ok(OptionalDuration::set(value))
            }
        }

        deserializer.deserialize_str(DurationVisitor)
    }
}

/// Float that remembers whether it was explicitly set.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OptionalFloat {
    pub value: f64,
    pub is_set: bool,
}

impl OptionalFloat {
    /// An explicitly set value.
    pub fn set(value: f64) -> Self {
        OptionalFloat { value, is_set: true }
    }

    /// Returns true when the value was never supplied.
    pub fn is_unset(&self) -> bool {
        !self.is_set
    }
}

impl Serialize for OptionalFloat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.value)
    }
}

impl<'de> Deserialize<'de> for OptionalFloat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Ok(OptionalFloat::set(value))
    }
}

/// Parses a Go-style duration string: a sequence of decimal numbers with
/// unit suffixes `ns`, `us`, `ms`, `s`, `m`, `h` (e.g. `300ms`, `1m30s`,
/// `1.5s`). A bare `0` is accepted. Negative durations are rejected.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("invalid duration \"\"".into());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.starts_with('-') || s.starts_with('+') {
        return Err(format!("negative duration {s:?} not supported"));
    }

    let bytes = s.as_bytes();
    let mut idx = 0;
    let mut total = 0f64;
    while idx < bytes.len() {
        let num_start = idx;
        while idx < bytes.len() && (bytes[idx].is_ascii_digit() || bytes[idx] == b'.') {
            idx += 1;
        }
        if idx == num_start {
            return Err(format!("invalid duration {s:?}"));
        }
        let number: f64 = s[num_start..idx]
            .parse()
            .map_err(|_| format!("invalid duration {s:?}"))?;

        let unit_start = idx;
        while idx < bytes.len() && !bytes[idx].is_ascii_digit() && bytes[idx] != b'.' {
            idx += 1;
        }
        let scale = match &s[unit_start..idx] {
            "ns" => 1e-9,
            "us" | "\u{b5}s" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => return Err(format!("unknown unit {unit:?} in duration {s:?}")),
        };
        total += number * scale;
    }
    if !total.is_finite() {
        return Err(format!("invalid duration {s:?}"));
    }
    Ok(Duration::from_secs_f64(total))
}

/// Formats a duration the way [`parse_duration`] reads it.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".into();
    }
    let nanos = d.as_nanos();
    if nanos < 1_000_000_000 {
        return if nanos % 1_000_000 == 0 {
            format!("{}ms", nanos / 1_000_000)
        } else if nanos % 1_000 == 0 {
            format!("{}us", nanos / 1_000)
        } else {
            format!("{nanos}ns")
        };
    }

    let mut out = String::new();
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if mins > 0 {
        out.push_str(&format!("{mins}m"));
    }
    let subsec = d.subsec_nanos();
    if secs > 0 || subsec > 0 || out.is_empty() {
        if subsec == 0 {
            out.push_str(&format!("{secs}s"));
        } else {
            let frac = format!("{:09}", subsec);
            let frac = frac.trim_end_matches('0');
            out.push_str(&format!("{secs}.{frac}s"));
        }
    }
    out
}

/// Serde adapter for `Option<Duration>` fields stored as duration strings.
pub(crate) mod duration_opt {
    use super::*;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            Some(text) => parse_duration(&text).map(Some).map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(
            parse_duration("1.5s").unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("ten seconds").is_err());
        assert!(parse_duration("-3s").is_err());
        assert!(parse_duration("3parsecs").is_err());
    }

    #[test]
    fn format_round_trips() {
        for text in ["500ms", "3s", "1m30s", "2h", "1.5s", "0s", "250us"] {
            let d = parse_duration(text).unwrap();
            assert_eq!(format_duration(d), text, "formatting {text}");
        }
    }

    #[test]
    fn override_yaml_forms() {
        #[derive(Deserialize)]
        struct Entry {
            #[serde(default)]
            r#override: Override,
        }
        let e: Entry = serde_yaml::from_str("override: merge").unwrap();
        assert_eq!(e.r#override, Override::Merge);
        let e: Entry = serde_yaml::from_str("override: replace").unwrap();
        assert_eq!(e.r#override, Override::Replace);
        let e: Entry = serde_yaml::from_str("{}").unwrap();
        assert!(e.r#override.is_unknown());
    }
}
