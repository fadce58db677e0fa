//! Live run state, partitioned by runtime.
//!
//! Each run owns its entry exclusively; readers (a UI, tests) observe
//! concurrently through coarse cloned snapshots. The map also tracks how
//! many runs of each job are currently in flight.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;

use crate::engine::report::Outcome;
use crate::model::{EdgeId, JobId, JobSnapshot};

/// Per-run progress counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub failed: usize,
    /// Total number of jobs this run will dispatch.
    pub total: usize,
}

/// Everything a run publishes while executing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunState {
    pub current_job: Option<JobSnapshot>,
    /// Per-job outcome as nodes complete.
    pub jobs: HashMap<JobId, Outcome>,
    /// Devices that traversed each edge.
    pub edges: HashMap<EdgeId, usize>,
    pub progress: Progress,
}

/// Runtime-keyed state map shared between the engine and its observers.
#[derive(Default)]
pub struct RunStateMap {
    entries: RwLock<HashMap<String, RunState>>,
    active: RwLock<HashMap<JobId, usize>>,
}

impl RunStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&self, runtime: &str) {
        self.entries
            .write()
            .unwrap()
            .insert(runtime.to_string(), RunState::default());
    }

    pub fn remove(&self, runtime: &str) {
        self.entries.write().unwrap().remove(runtime);
    }

    pub fn snapshot(&self, runtime: &str) -> Option<RunState> {
        self.entries.read().unwrap().get(runtime).cloned()
    }

    pub fn set_current_job(&self, runtime: &str, job: JobSnapshot) {
        self.update(runtime, |state| state.current_job = Some(job));
    }

    pub fn set_job_outcome(&self, runtime: &str, job: JobId, outcome: Outcome) {
        self.update(runtime, |state| {
            state.jobs.insert(job, outcome);
        });
    }

    pub fn set_edge_count(&self, runtime: &str, edge: EdgeId, devices: usize) {
        self.update(runtime, |state| {
            state.edges.insert(edge, devices);
        });
    }

    pub fn set_progress_total(&self, runtime: &str, total: usize) {
        self.update(runtime, |state| state.progress.total = total);
    }

    /// Zero the attempt counters at the start of each service attempt.
    pub fn reset_progress(&self, runtime: &str) {
        self.update(runtime, |state| {
            state.progress.completed = 0;
            state.progress.failed = 0;
        });
    }

    pub fn record_completed(&self, runtime: &str) {
        self.update(runtime, |state| state.progress.completed += 1);
    }

    pub fn record_failed(&self, runtime: &str) {
        self.update(runtime, |state| state.progress.failed += 1);
    }

    /// Number of in-flight top-level runs of a job.
    pub fn active_runs(&self, job: JobId) -> usize {
        self.active.read().unwrap().get(&job).copied().unwrap_or(0)
    }

    pub fn job_started(&self, job: JobId) {
        *self.active.write().unwrap().entry(job).or_insert(0) += 1;
    }

    pub fn job_finished(&self, job: JobId) {
        let mut active = self.active.write().unwrap();
        if let Some(count) = active.get_mut(&job) {
            *count = count.saturating_sub(1);
        }
    }

    fn update(&self, runtime: &str, apply: impl FnOnce(&mut RunState)) {
        let mut entries = self.entries.write().unwrap();
        let state = entries.entry(runtime.to_string()).or_default();
        apply(state);
    }
}
