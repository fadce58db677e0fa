//! Target device-set computation.
//!
//! Explicit run property overrides win outright; otherwise the job's
//! configured devices and pools are combined with the devices named by its
//! target query, evaluated against the payload. Any query entry that fails
//! to resolve aborts the run with a resolution error.

use std::collections::HashSet;

use serde_json::Value;

use crate::engine::coordinator::Engine;
use crate::engine::error::EngineError;
use crate::eval::EvalContext;
use crate::model::{Device, DeviceId, Run, TargetProperty};

impl Engine {
    /// Compute the effective target set of a run, in insertion order.
    pub(crate) fn compute_targets(
        &self,
        run: &Run,
        payload: &Value,
    ) -> Result<Vec<Device>, EngineError> {
        let job = self.store.job(run.job)?;
        let mut targets: Vec<Device> = Vec::new();
        let mut seen: HashSet<DeviceId> = HashSet::new();
        let mut push = |targets: &mut Vec<Device>, device: Device| {
            if seen.insert(device.id) {
                targets.push(device);
            }
        };

        if let Some(ids) = &run.properties.devices {
            for id in ids {
                push(&mut targets, self.store.device(*id)?);
            }
            return Ok(targets);
        }

        for id in &job.devices {
            push(&mut targets, self.store.device(*id)?);
        }
        for pool_id in &job.pools {
            let pool = self.store.pool(*pool_id)?;
            for id in &pool.devices {
                push(&mut targets, self.store.device(*id)?);
            }
        }

        if let Some(query) = &job.target_query {
            let scoped = run
                .workflow_device
                .map(|id| self.store.device(id))
                .transpose()?;
            let ctx = EvalContext::with_payload(payload)
                .device(scoped.as_ref())
                .job(&job);
            let value = self.evaluator.eval(query, &ctx)?;
            for entry in query_strings(&value)? {
                let device = match job.query_property_type {
                    TargetProperty::Name => self.store.device_by_name(&entry),
                    TargetProperty::IpAddress => self.store.device_by_ip(&entry),
                }
                .map_err(|_| {
                    EngineError::Resolution(format!(
                        "no device with {:?} matching {entry:?}",
                        job.query_property_type
                    ))
                })?;
                push(&mut targets, device);
            }
        }
        Ok(targets)
    }
}

/// A target query must produce a string or a list of strings.
fn query_strings(value: &Value) -> Result<Vec<String>, EngineError> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(String::from).ok_or_else(|| {
                    EngineError::Resolution(format!(
                        "target query produced a non-string entry: {item}"
                    ))
                })
            })
            .collect(),
        other => Err(EngineError::Resolution(format!(
            "target query must produce a list of strings, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_strings_accepts_list_and_scalar() {
        assert_eq!(
            query_strings(&json!(["r1", "r2"])).unwrap(),
            vec!["r1".to_string(), "r2".to_string()]
        );
        assert_eq!(query_strings(&json!("r1")).unwrap(), vec!["r1".to_string()]);
    }

    #[test]
    fn test_query_strings_rejects_non_strings() {
        assert!(query_strings(&json!([1, 2])).is_err());
        assert!(query_strings(&json!({ "a": 1 })).is_err());
    }
}
