//! Result records: per-run, per-job, per-device execution results.

use std::sync::RwLock;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::model::{DeviceId, JobId, Run};

/// One recorded result. Device is set for device-scoped entries.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRecord {
    pub runtime: String,
    pub job: JobId,
    pub device: Option<DeviceId>,
    pub recorded_at: String,
    pub result: Value,
}

/// Append-only in-memory result log.
#[derive(Default)]
pub struct ResultStore {
    records: RwLock<Vec<ResultRecord>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, run: &Run, device: Option<DeviceId>, result: &Value) {
        self.records.write().unwrap().push(ResultRecord {
            runtime: run.runtime.clone(),
            job: run.job,
            device,
            recorded_at: Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            result: result.clone(),
        });
    }

    pub fn for_runtime(&self, runtime: &str) -> Vec<ResultRecord> {
        self.records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.runtime == runtime)
            .cloned()
            .collect()
    }

    pub fn for_job(&self, job: JobId) -> Vec<ResultRecord> {
        self.records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.job == job)
            .cloned()
            .collect()
    }

    pub fn for_device(&self, device: DeviceId) -> Vec<ResultRecord> {
        self.records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.device == Some(device))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.records.write().unwrap().clear();
    }
}
