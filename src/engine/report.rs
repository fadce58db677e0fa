//! Result envelope types.
//!
//! Every result carries a `success` flag that is `true`, `false`, or the
//! literal string `"skipped"`. Device-scoped results additionally carry a
//! `devices` map of the same shape, either under `results` or at the top
//! level of a workflow report.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

/// Outcome of a job, run, or single invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    #[default]
    Failed,
    Skipped,
}

impl Outcome {
    pub fn from_bool(success: bool) -> Self {
        if success {
            Outcome::Passed
        } else {
            Outcome::Failed
        }
    }

    /// Skipped jobs count as successful for successor selection.
    pub fn truthy(self) -> bool {
        !matches!(self, Outcome::Failed)
    }

    pub fn passed(self) -> bool {
        matches!(self, Outcome::Passed)
    }
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Outcome::Passed => serializer.serialize_bool(true),
            Outcome::Failed => serializer.serialize_bool(false),
            Outcome::Skipped => serializer.serialize_str("skipped"),
        }
    }
}

impl<'de> Deserialize<'de> for Outcome {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Bool(b) => Ok(Outcome::from_bool(b)),
            Value::String(s) if s == "skipped" => Ok(Outcome::Skipped),
            other => Err(D::Error::custom(format!(
                "expected a boolean or \"skipped\", got {other}"
            ))),
        }
    }
}

/// Per-device entry of a workflow's terminal device summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub success: bool,
}

/// The stable result envelope produced by every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub success: Outcome,

    /// Per-node results keyed by job name, or the raw invocation result.
    /// Device fan-outs nest their per-device map under `devices`.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub results: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Terminal per-device summary of a device-propagating workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<BTreeMap<String, DeviceSummary>>,

    /// Prior attempts, keyed `"Attempt <n>"`. Present only with retries.
    #[serde(flatten)]
    pub attempts: BTreeMap<String, Value>,
}

impl Report {
    /// An empty, not-yet-successful report for the given runtime.
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            success: Outcome::Failed,
            results: json!({}),
            runtime: Some(runtime.into()),
            error: None,
            devices: None,
            attempts: BTreeMap::new(),
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: Outcome::Failed,
            results: Value::Null,
            runtime: None,
            error: Some(error.to_string()),
            devices: None,
            attempts: BTreeMap::new(),
        }
    }

    pub fn skipped() -> Self {
        Self {
            success: Outcome::Skipped,
            results: Value::Null,
            runtime: None,
            error: None,
            devices: None,
            attempts: BTreeMap::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "success": false }))
    }

    /// Per-device success flags: the `devices` map under `results` when
    /// present, else the terminal device summary.
    pub fn per_device_success(&self) -> Option<BTreeMap<String, bool>> {
        if let Some(devices) = self.results.get("devices").and_then(Value::as_object) {
            return Some(
                devices
                    .iter()
                    .map(|(name, result)| (name.clone(), value_success(result)))
                    .collect(),
            );
        }
        self.devices.as_ref().map(|summary| {
            summary
                .iter()
                .map(|(name, entry)| (name.clone(), entry.success))
                .collect()
        })
    }
}

/// Read the `success` flag out of a raw result value. Skipped counts as
/// successful, everything else defaults to failure.
pub fn value_success(value: &Value) -> bool {
    match value.get("success") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "skipped",
        _ => false,
    }
}

/// Merge every entry of `src` into the object `dst`, overwriting existing
/// keys. No-op when `dst` is not an object.
pub fn merge_objects(dst: &mut Value, src: &Map<String, Value>) {
    if let Value::Object(dst) = dst {
        for (key, value) in src {
            dst.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization() {
        assert_eq!(serde_json::to_value(Outcome::Passed).unwrap(), json!(true));
        assert_eq!(serde_json::to_value(Outcome::Failed).unwrap(), json!(false));
        assert_eq!(
            serde_json::to_value(Outcome::Skipped).unwrap(),
            json!("skipped")
        );
    }

    #[test]
    fn test_outcome_roundtrip() {
        for outcome in [Outcome::Passed, Outcome::Failed, Outcome::Skipped] {
            let value = serde_json::to_value(outcome).unwrap();
            let back: Outcome = serde_json::from_value(value).unwrap();
            assert_eq!(back, outcome);
        }
    }

    #[test]
    fn test_skipped_is_truthy_but_not_passed() {
        assert!(Outcome::Skipped.truthy());
        assert!(!Outcome::Skipped.passed());
        assert!(!Outcome::Failed.truthy());
    }

    #[test]
    fn test_attempts_flatten_into_envelope() {
        let mut report = Report::new("t0");
        report
            .attempts
            .insert("Attempt 1".into(), json!({ "success": false }));
        let value = report.to_value();
        assert_eq!(value["Attempt 1"]["success"], json!(false));
        assert_eq!(value["runtime"], json!("t0"));
    }

    #[test]
    fn test_value_success_shapes() {
        assert!(value_success(&json!({ "success": true })));
        assert!(value_success(&json!({ "success": "skipped" })));
        assert!(!value_success(&json!({ "success": false })));
        assert!(!value_success(&json!({ "result": 1 })));
    }

    #[test]
    fn test_per_device_success_prefers_results_map() {
        let mut report = Report::new("t0");
        report.results = json!({ "devices": { "r1": { "success": true }, "r2": { "success": false } } });
        let map = report.per_device_success().unwrap();
        assert_eq!(map["r1"], true);
        assert_eq!(map["r2"], false);
    }
}
