//! The workflow traverser.
//!
//! Walks the edge-labeled graph of member jobs in LIFO order, carrying a
//! per-node allowed-device set when device propagation is on. Successors
//! are chosen by the success or failure of the predecessor, per device
//! when possible; prerequisite edges hold a node back until all of its
//! prerequisite sources have been visited. Nested jobs execute as child
//! runs, which makes nested workflows reuse this traverser recursively.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::time::sleep;
use tracing::info;

use crate::engine::coordinator::Engine;
use crate::engine::error::EngineError;
use crate::engine::report::{merge_objects, DeviceSummary, Outcome, Report};
use crate::eval::{truthy, EvalContext};
use crate::model::{
    Device, DeviceId, EdgeKind, Job, JobId, JobKind, Run, RunProperties, RunSpec, TraversalMode,
};
use crate::store::entity::END_JOB;

impl Engine {
    /// Execute one workflow run. Mode `service` traverses once for all
    /// devices; mode `device` traverses independently per target device
    /// and aggregates the per-device results.
    pub(crate) async fn run_workflow(&self, run: &Run, job: &Job, payload: &Value) -> Report {
        match run.traversal_mode {
            TraversalMode::Service => self.traverse(run, job, payload, None).await,
            TraversalMode::Device => {
                let targets = match self.compute_targets(run, payload) {
                    Ok(targets) => targets,
                    Err(error) => return Report::failed(error),
                };
                let mut results = Map::new();
                let mut success = true;
                for device in targets {
                    if run.is_stopped() {
                        break;
                    }
                    let device_report = self.traverse(run, job, payload, Some(&device)).await;
                    if !device_report.success.truthy() {
                        success = false;
                    }
                    results.insert(device.name.clone(), device_report.to_value());
                }
                Report {
                    success: Outcome::from_bool(success),
                    results: Value::Object(results),
                    runtime: Some(run.runtime.clone()),
                    error: None,
                    devices: None,
                    attempts: BTreeMap::new(),
                }
            }
        }
    }

    /// Single-pass traversal. `outer_device` is set in mode `device`: the
    /// one device this traversal is scoped to.
    async fn traverse(
        &self,
        run: &Run,
        workflow: &Job,
        payload: &Value,
        outer_device: Option<&Device>,
    ) -> Report {
        let (start_jobs, mode) = match &workflow.kind {
            JobKind::Workflow {
                start_jobs,
                traversal_mode,
                ..
            } => (start_jobs.clone(), *traversal_mode),
            JobKind::Service { .. } => {
                return Report::failed(format!("{} is not a workflow", workflow.name));
            }
        };
        self.state
            .set_progress_total(&run.runtime, self.store.job_number(workflow.id));

        let mut pending: Vec<Job> = start_jobs
            .iter()
            .filter_map(|id| self.store.job(*id).ok())
            .collect();
        let mut payload = payload.clone();
        let mut visited: HashSet<JobId> = HashSet::new();
        let mut report = Report::new(&run.runtime);
        let mut allowed: HashMap<String, BTreeSet<DeviceId>> = HashMap::new();

        // Device membership propagates through edges only in mode service.
        let propagate = run.use_workflow_devices && mode == TraversalMode::Service;
        let mut initial_targets: Vec<Device> = Vec::new();
        if propagate {
            initial_targets = match self.compute_targets(run, &payload) {
                Ok(targets) => targets,
                Err(error) => return Report::failed(error),
            };
            let ids: BTreeSet<DeviceId> = initial_targets.iter().map(|d| d.id).collect();
            for job in &pending {
                allowed.insert(job.name.clone(), ids.clone());
            }
        }
        let end_id = self.store.job_by_name(END_JOB).map(|j| j.id).ok();

        loop {
            if run.is_stopped() {
                info!(runtime = %run.runtime, "workflow run cancelled");
                return report;
            }
            let Some(job) = pending.pop() else { break };
            if visited.contains(&job.id) {
                continue;
            }
            // Join barrier: a node with unvisited prerequisite sources is
            // dropped here and re-enqueued by the upstream completion.
            let blocked = self
                .store
                .predecessors(workflow.id, job.id, EdgeKind::Prerequisite)
                .iter()
                .any(|(source, _)| !visited.contains(&source.id));
            if blocked {
                continue;
            }
            visited.insert(job.id);
            self.state.set_current_job(&run.runtime, job.snapshot());

            let mut skip_job = job.skip;
            let mut eval_failure = None;
            if let Some(query) = &job.skip_query {
                let ctx = EvalContext::with_payload(&payload)
                    .device(outer_device)
                    .job(&job);
                match self.evaluator.eval(query, &ctx) {
                    Ok(value) => skip_job = skip_job || truthy(&value),
                    Err(error) => eval_failure = Some(error.to_string()),
                }
            }

            let job_report = if let Some(error) = eval_failure {
                Report::failed(error)
            } else if skip_job {
                Report::skipped()
            } else if run.use_workflow_devices && job.target_query.is_some() {
                self.run_derived_targets(run, workflow, &job, &allowed, &payload, mode, outer_device)
                    .await
            } else {
                self.run_member_job(run, workflow, &job, &allowed, &payload, mode, outer_device)
                    .await
            };

            self.state
                .set_job_outcome(&run.runtime, job.id, job_report.success);

            let successors: Vec<Job> = if propagate {
                self.process_allowed_targets(&run.runtime, workflow.id, &job, &job_report, &mut allowed)
            } else {
                let kind = if job_report.success.truthy() {
                    EdgeKind::Success
                } else {
                    EdgeKind::Failure
                };
                self.store
                    .successors(workflow.id, job.id, kind)
                    .into_iter()
                    .map(|(successor, _)| successor)
                    .collect()
            };

            if let Value::Object(map) = &mut payload {
                map.insert(job.name.clone(), job_report.to_value());
            }
            if let Value::Object(map) = &payload {
                merge_objects(&mut report.results, map);
            }

            for successor in successors {
                if !propagate && Some(successor.id) == end_id {
                    report.success = Outcome::Passed;
                }
                pending.push(successor);
            }
            // Completing a node also re-offers its prerequisite
            // destinations; the join barrier above holds each one back
            // until every prerequisite source has been visited.
            for (successor, _) in
                self.store
                    .successors(workflow.id, job.id, EdgeKind::Prerequisite)
            {
                pending.push(successor);
            }

            if !skip_job && job.waiting_time > 0 {
                sleep(Duration::from_secs(job.waiting_time)).await;
            }
        }

        if propagate {
            let end_devices = allowed.get(END_JOB).cloned().unwrap_or_default();
            let initial_ids: BTreeSet<DeviceId> =
                initial_targets.iter().map(|d| d.id).collect();
            report.devices = Some(
                initial_targets
                    .iter()
                    .map(|device| {
                        (
                            device.name.clone(),
                            DeviceSummary {
                                success: end_devices.contains(&device.id),
                            },
                        )
                    })
                    .collect(),
            );
            report.success = Outcome::from_bool(initial_ids == end_devices);
        }
        report
    }

    /// A node whose target query derives its own devices: in mode service
    /// it runs once per allowed device, scoped to that device; in mode
    /// device it runs once, scoped to the outer device. Per-target
    /// failures never abort the siblings.
    async fn run_derived_targets(
        &self,
        run: &Run,
        workflow: &Job,
        job: &Job,
        allowed: &HashMap<String, BTreeSet<DeviceId>>,
        payload: &Value,
        mode: TraversalMode,
        outer_device: Option<&Device>,
    ) -> Report {
        match mode {
            TraversalMode::Service => {
                let mut device_results = Map::new();
                let mut success = true;
                let base_targets = allowed.get(&job.name).cloned().unwrap_or_default();
                for target_id in base_targets {
                    let Ok(target) = self.store.device(target_id) else {
                        continue;
                    };
                    let child_report = self
                        .run_scoped_child(run, workflow, job, Some(target.id), payload)
                        .await;
                    if !child_report.success.truthy() {
                        success = false;
                    }
                    device_results.insert(target.name.clone(), child_report.to_value());
                }
                Report {
                    success: Outcome::from_bool(success),
                    results: json!({ "devices": device_results }),
                    runtime: None,
                    error: None,
                    devices: None,
                    attempts: BTreeMap::new(),
                }
            }
            TraversalMode::Device => {
                self.run_scoped_child(run, workflow, job, outer_device.map(|d| d.id), payload)
                    .await
            }
        }
    }

    /// Ordinary member execution: compute the valid device set and run the
    /// job as a child run pinned to exactly those devices.
    async fn run_member_job(
        &self,
        run: &Run,
        workflow: &Job,
        job: &Job,
        allowed: &HashMap<String, BTreeSet<DeviceId>>,
        payload: &Value,
        mode: TraversalMode,
        outer_device: Option<&Device>,
    ) -> Report {
        let valid: Vec<DeviceId> = match mode {
            TraversalMode::Service => {
                match self.compute_valid_devices(run, job, allowed, payload) {
                    Ok(devices) => devices,
                    Err(error) => return Report::failed(error),
                }
            }
            TraversalMode::Device => outer_device.iter().map(|d| d.id).collect(),
        };
        let spec = RunSpec {
            job: job.id,
            workflow: Some(workflow.id),
            workflow_device: None,
            parent_runtime: Some(run.base_runtime().to_string()),
            restart_run: run.restart_run.clone(),
            properties: RunProperties {
                devices: Some(valid),
                ..Default::default()
            },
        };
        self.run_child(spec, payload).await
    }

    fn compute_valid_devices(
        &self,
        run: &Run,
        job: &Job,
        allowed: &HashMap<String, BTreeSet<DeviceId>>,
        payload: &Value,
    ) -> Result<Vec<DeviceId>, EngineError> {
        if !job.is_workflow() && !job.has_targets {
            Ok(Vec::new())
        } else if run.use_workflow_devices {
            Ok(allowed
                .get(&job.name)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default())
        } else {
            Ok(self
                .compute_targets(run, payload)?
                .into_iter()
                .map(|d| d.id)
                .collect())
        }
    }

    /// Child run scoped to one device (or none), with empty properties so
    /// the child resolves its own targets.
    async fn run_scoped_child(
        &self,
        run: &Run,
        workflow: &Job,
        job: &Job,
        device: Option<DeviceId>,
        payload: &Value,
    ) -> Report {
        let spec = RunSpec {
            job: job.id,
            workflow: Some(workflow.id),
            workflow_device: device,
            parent_runtime: Some(run.base_runtime().to_string()),
            restart_run: run.restart_run.clone(),
            properties: RunProperties::default(),
        };
        self.run_child(spec, payload).await
    }

    async fn run_child(&self, spec: RunSpec, payload: &Value) -> Report {
        let child = match self.store.create_run(spec) {
            Ok(child) => child,
            Err(error) => return Report::failed(error),
        };
        self.store.commit();
        let report = self.execute_run(&child, payload).await;
        self.store.remove_run(&child.runtime);
        report
    }

    /// Split the node's device set into passed and failed halves and union
    /// them into the allowed sets of the success/failure successors.
    /// Nodes without device fan-out (and skipped nodes) route their whole
    /// incoming allowed set by their scalar outcome.
    fn process_allowed_targets(
        &self,
        runtime: &str,
        workflow: JobId,
        job: &Job,
        report: &Report,
        allowed: &mut HashMap<String, BTreeSet<DeviceId>>,
    ) -> Vec<Job> {
        let mut passed: BTreeSet<DeviceId> = BTreeSet::new();
        let mut failed: BTreeSet<DeviceId> = BTreeSet::new();
        let skipped = report.success == Outcome::Skipped;

        if (job.is_workflow() || job.has_targets) && !skipped {
            if let Some(device_success) = report.per_device_success() {
                for (name, success) in device_success {
                    if let Ok(device) = self.store.device_by_name(&name) {
                        if success {
                            passed.insert(device.id);
                        } else {
                            failed.insert(device.id);
                        }
                    }
                }
            }
        } else {
            let incoming = allowed.get(&job.name).cloned().unwrap_or_default();
            if report.success.truthy() {
                passed = incoming;
            } else {
                failed = incoming;
            }
        }

        let mut successors = Vec::new();
        for (devices, kind) in [(&passed, EdgeKind::Success), (&failed, EdgeKind::Failure)] {
            if devices.is_empty() {
                continue;
            }
            for (successor, edge) in self.store.successors(workflow, job.id, kind) {
                allowed
                    .entry(successor.name.clone())
                    .or_default()
                    .extend(devices.iter().copied());
                self.state.set_edge_count(runtime, edge.id, devices.len());
                successors.push(successor);
            }
        }
        successors
    }
}
