//! Run records: one execution attempt of a top-level or nested job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::device::DeviceId;
use super::job::{JobId, TraversalMode};

/// Dynamic per-run overrides of the job's configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunProperties {
    /// Explicit target device ids; takes precedence over the job's own
    /// devices, pools, and target query.
    #[serde(default)]
    pub devices: Option<Vec<DeviceId>>,

    #[serde(default)]
    pub multiprocessing: Option<bool>,

    #[serde(default)]
    pub max_processes: Option<usize>,
}

/// Arguments to the run factory.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub job: JobId,
    pub workflow: Option<JobId>,
    pub workflow_device: Option<DeviceId>,
    pub parent_runtime: Option<String>,
    pub restart_run: Option<String>,
    pub properties: RunProperties,
}

impl RunSpec {
    pub fn new(job: JobId) -> Self {
        Self {
            job,
            ..Default::default()
        }
    }
}

/// One execution of a job. Owns a copy of the job's policy attributes taken
/// at start-of-run, with any [`RunProperties`] overrides already applied.
#[derive(Debug, Clone)]
pub struct Run {
    /// Unique timestamp string; primary key among active runs.
    pub runtime: String,
    pub job: JobId,
    pub workflow: Option<JobId>,
    /// Set when a nested sub-run is scoped to one device.
    pub workflow_device: Option<DeviceId>,
    pub parent_runtime: Option<String>,
    pub restart_run: Option<String>,
    pub properties: RunProperties,

    // Policy snapshot.
    pub retries: u32,
    pub retry_delay: u64,
    pub has_targets: bool,
    pub multiprocessing: bool,
    pub max_processes: usize,
    pub use_workflow_devices: bool,
    pub traversal_mode: TraversalMode,

    /// Cooperative cancellation flag, shared with child runs.
    pub(crate) stop: Arc<AtomicBool>,
}

impl Run {
    /// The runtime under which this whole execution tree was started.
    pub fn base_runtime(&self) -> &str {
        self.parent_runtime.as_deref().unwrap_or(&self.runtime)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Request cancellation. Idempotent; honored at the next suspension
    /// point of the owning executor.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
