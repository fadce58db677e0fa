//! Entity store: devices, pools, jobs, edges, and the run factory.
//!
//! The store owns all long-lived configuration and enforces the structural
//! invariants of the model: unique names, workflow membership of edge
//! endpoints, mandatory Start/End membership, and acyclicity of
//! prerequisite edges. Active runs are keyed by their runtime string.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::model::{
    Device, DeviceId, Edge, EdgeId, EdgeKind, Job, JobId, JobKind, Pool, PoolId, Run, RunSpec,
    TraversalMode,
};

pub const START_JOB: &str = "Start";
pub const END_JOB: &str = "End";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("Job {job} is not a member of workflow {workflow}")]
    NotAMember { job: String, workflow: String },

    #[error("Job {0} is not a workflow")]
    NotAWorkflow(String),

    #[error("Prerequisite edges of workflow {0} would form a cycle")]
    PrerequisiteCycle(String),
}

#[derive(Default)]
struct StoreInner {
    devices: HashMap<DeviceId, Device>,
    device_names: HashMap<String, DeviceId>,
    pools: HashMap<PoolId, Pool>,
    pool_names: HashMap<String, PoolId>,
    jobs: HashMap<JobId, Job>,
    job_names: HashMap<String, JobId>,
    edges: HashMap<EdgeId, Edge>,
    /// (workflow, source) → outgoing edge ids.
    outgoing: HashMap<(JobId, JobId), Vec<EdgeId>>,
    /// (workflow, destination) → incoming edge ids.
    incoming: HashMap<(JobId, JobId), Vec<EdgeId>>,
    runs: HashMap<String, Run>,
    next_id: u32,
}

impl StoreInner {
    fn allocate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// The in-memory entity store. Cheap to share: all methods take `&self`.
pub struct Store {
    inner: RwLock<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// An empty store seeded with the process-wide Start and End services.
    pub fn new() -> Self {
        let store = Self {
            inner: RwLock::new(StoreInner::default()),
        };
        for name in [START_JOB, END_JOB] {
            let mut anchor = Job::service(name, name);
            anchor.hidden = true;
            store.add_job(anchor).expect("seeding anchor services");
        }
        store
    }

    /// Flush point called by executors before dispatching a child run. The
    /// in-memory store commits eagerly, so there is nothing left to write.
    pub fn commit(&self) {
        debug!("commit");
    }

    // ------------------------------------------------------------------
    // Inventory
    // ------------------------------------------------------------------

    pub fn add_device(&self, mut device: Device) -> Result<Device, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.device_names.contains_key(&device.name) {
            return Err(StoreError::DuplicateName {
                kind: "device",
                name: device.name,
            });
        }
        device.id = inner.allocate_id();
        inner.device_names.insert(device.name.clone(), device.id);
        inner.devices.insert(device.id, device.clone());
        Ok(device)
    }

    pub fn add_pool(&self, mut pool: Pool) -> Result<Pool, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.pool_names.contains_key(&pool.name) {
            return Err(StoreError::DuplicateName {
                kind: "pool",
                name: pool.name,
            });
        }
        pool.id = inner.allocate_id();
        inner.pool_names.insert(pool.name.clone(), pool.id);
        inner.pools.insert(pool.id, pool.clone());
        Ok(pool)
    }

    pub fn device(&self, id: DeviceId) -> Result<Device, StoreError> {
        self.inner
            .read()
            .unwrap()
            .devices
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "device",
                key: id.to_string(),
            })
    }

    pub fn device_by_name(&self, name: &str) -> Result<Device, StoreError> {
        let inner = self.inner.read().unwrap();
        inner
            .device_names
            .get(name)
            .and_then(|id| inner.devices.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "device",
                key: name.to_string(),
            })
    }

    /// Find the device whose `ip_address` matches.
    pub fn device_by_ip(&self, ip: &str) -> Result<Device, StoreError> {
        let inner = self.inner.read().unwrap();
        inner
            .devices
            .values()
            .find(|d| d.ip_address == ip)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "device",
                key: ip.to_string(),
            })
    }

    pub fn pool(&self, id: PoolId) -> Result<Pool, StoreError> {
        self.inner
            .read()
            .unwrap()
            .pools
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "pool",
                key: id.to_string(),
            })
    }

    pub fn pool_by_name(&self, name: &str) -> Result<Pool, StoreError> {
        let inner = self.inner.read().unwrap();
        inner
            .pool_names
            .get(name)
            .and_then(|id| inner.pools.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "pool",
                key: name.to_string(),
            })
    }

    // ------------------------------------------------------------------
    // Jobs and edges
    // ------------------------------------------------------------------

    /// Insert a job. Workflows are completed on the way in: Start and End
    /// are added to the members, and `start_jobs` defaults to `[Start]`.
    pub fn add_job(&self, mut job: Job) -> Result<Job, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.job_names.contains_key(&job.name) {
            return Err(StoreError::DuplicateName {
                kind: "job",
                name: job.name,
            });
        }
        if let JobKind::Workflow {
            ref mut jobs,
            ref mut start_jobs,
            ..
        } = job.kind
        {
            for member in jobs.iter() {
                if !inner.jobs.contains_key(member) {
                    return Err(StoreError::NotFound {
                        kind: "job",
                        key: member.to_string(),
                    });
                }
            }
            for anchor in [START_JOB, END_JOB] {
                let id = inner.job_names[anchor];
                if !jobs.contains(&id) {
                    jobs.push(id);
                }
            }
            if start_jobs.is_empty() {
                start_jobs.push(inner.job_names[START_JOB]);
            }
        }
        job.id = inner.allocate_id();
        inner.job_names.insert(job.name.clone(), job.id);
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    /// Insert an edge after checking that both endpoints are members of its
    /// workflow and that prerequisite edges stay acyclic.
    pub fn add_edge(&self, mut edge: Edge) -> Result<Edge, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let workflow = inner
            .jobs
            .get(&edge.workflow)
            .ok_or_else(|| StoreError::NotFound {
                kind: "workflow",
                key: edge.workflow.to_string(),
            })?
            .clone();
        let members = match &workflow.kind {
            JobKind::Workflow { jobs, .. } => jobs.clone(),
            _ => return Err(StoreError::NotAWorkflow(workflow.name)),
        };
        for endpoint in [edge.source, edge.destination] {
            if !members.contains(&endpoint) {
                return Err(StoreError::NotAMember {
                    job: endpoint.to_string(),
                    workflow: workflow.name.clone(),
                });
            }
        }
        if edge.label.is_empty() {
            edge.label = format!("{:?}", edge.kind).to_lowercase();
        }
        edge.id = inner.allocate_id();
        inner
            .outgoing
            .entry((edge.workflow, edge.source))
            .or_default()
            .push(edge.id);
        inner
            .incoming
            .entry((edge.workflow, edge.destination))
            .or_default()
            .push(edge.id);
        inner.edges.insert(edge.id, edge.clone());

        if edge.kind == EdgeKind::Prerequisite
            && has_prerequisite_cycle(&inner, edge.workflow, &members)
        {
            remove_edge(&mut inner, edge.id);
            return Err(StoreError::PrerequisiteCycle(workflow.name));
        }
        Ok(edge)
    }

    pub fn job(&self, id: JobId) -> Result<Job, StoreError> {
        self.inner
            .read()
            .unwrap()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "job",
                key: id.to_string(),
            })
    }

    pub fn job_by_name(&self, name: &str) -> Result<Job, StoreError> {
        let inner = self.inner.read().unwrap();
        inner
            .job_names
            .get(name)
            .and_then(|id| inner.jobs.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "job",
                key: name.to_string(),
            })
    }

    pub fn edge(&self, id: EdgeId) -> Result<Edge, StoreError> {
        self.inner
            .read()
            .unwrap()
            .edges
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "edge",
                key: id.to_string(),
            })
    }

    /// Delete a job, its incident edges in every workflow, and its
    /// membership entries. Deleting a workflow also drops its own edges.
    pub fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let job = inner.jobs.remove(&id).ok_or_else(|| StoreError::NotFound {
            kind: "job",
            key: id.to_string(),
        })?;
        inner.job_names.remove(&job.name);

        let doomed: Vec<EdgeId> = inner
            .edges
            .values()
            .filter(|e| e.workflow == id || e.source == id || e.destination == id)
            .map(|e| e.id)
            .collect();
        for edge_id in doomed {
            remove_edge(&mut inner, edge_id);
        }

        for other in inner.jobs.values_mut() {
            if let JobKind::Workflow {
                jobs, start_jobs, ..
            } = &mut other.kind
            {
                jobs.retain(|member| *member != id);
                start_jobs.retain(|member| *member != id);
            }
        }
        Ok(())
    }

    /// Successors of `source` over edges of the given kind, with the edges.
    pub fn successors(
        &self,
        workflow: JobId,
        source: JobId,
        kind: EdgeKind,
    ) -> Vec<(Job, Edge)> {
        let inner = self.inner.read().unwrap();
        adjacent(&inner, &inner.outgoing, (workflow, source), kind, |e| {
            e.destination
        })
    }

    /// Predecessors of `destination` over edges of the given kind.
    pub fn predecessors(
        &self,
        workflow: JobId,
        destination: JobId,
        kind: EdgeKind,
    ) -> Vec<(Job, Edge)> {
        let inner = self.inner.read().unwrap();
        adjacent(&inner, &inner.incoming, (workflow, destination), kind, |e| {
            e.source
        })
    }

    /// Number of jobs a workflow run will dispatch, counting each nested
    /// workflow as itself plus its own job number.
    pub fn job_number(&self, workflow: JobId) -> usize {
        let inner = self.inner.read().unwrap();
        let mut visiting = HashSet::new();
        count_jobs(&inner, workflow, &mut visiting)
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Factory for run records. The runtime is a unique timestamp string;
    /// the job's policy attributes are copied in with any property
    /// overrides applied, and the cancellation flag is shared with the
    /// parent run when one is active.
    pub fn create_run(&self, spec: RunSpec) -> Result<Run, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let job = inner
            .jobs
            .get(&spec.job)
            .ok_or_else(|| StoreError::NotFound {
                kind: "job",
                key: spec.job.to_string(),
            })?
            .clone();

        let mut runtime = Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string();
        while inner.runs.contains_key(&runtime) {
            runtime = format!("{runtime} ({})", &Uuid::new_v4().to_string()[..8]);
        }

        let stop = spec
            .parent_runtime
            .as_deref()
            .and_then(|parent| inner.runs.get(parent))
            .map(|parent| Arc::clone(&parent.stop))
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

        let (multiprocessing, max_processes) = match &job.kind {
            JobKind::Service {
                multiprocessing,
                max_processes,
                ..
            } => (*multiprocessing, *max_processes),
            JobKind::Workflow { .. } => (false, 1),
        };
        let (use_workflow_devices, traversal_mode) = match &job.kind {
            JobKind::Workflow {
                use_workflow_devices,
                traversal_mode,
                ..
            } => (*use_workflow_devices, *traversal_mode),
            JobKind::Service { .. } => (false, TraversalMode::Service),
        };

        let run = Run {
            runtime: runtime.clone(),
            job: job.id,
            workflow: spec.workflow,
            workflow_device: spec.workflow_device,
            parent_runtime: spec.parent_runtime,
            restart_run: spec.restart_run,
            retries: job.retries,
            retry_delay: job.retry_delay,
            has_targets: job.has_targets,
            multiprocessing: spec.properties.multiprocessing.unwrap_or(multiprocessing),
            max_processes: spec.properties.max_processes.unwrap_or(max_processes).max(1),
            use_workflow_devices,
            traversal_mode,
            properties: spec.properties,
            stop,
        };
        inner.runs.insert(runtime, run.clone());
        Ok(run)
    }

    pub fn run(&self, runtime: &str) -> Option<Run> {
        self.inner.read().unwrap().runs.get(runtime).cloned()
    }

    /// Seal a completed run: drop it from the active-run map.
    pub fn remove_run(&self, runtime: &str) {
        self.inner.write().unwrap().runs.remove(runtime);
    }

    /// Request cancellation of an active run (and of the children sharing
    /// its flag). Returns false when the runtime is unknown.
    pub fn stop_run(&self, runtime: &str) -> bool {
        match self.inner.read().unwrap().runs.get(runtime) {
            Some(run) => {
                run.request_stop();
                true
            }
            None => false,
        }
    }
}

fn adjacent(
    inner: &StoreInner,
    index: &HashMap<(JobId, JobId), Vec<EdgeId>>,
    key: (JobId, JobId),
    kind: EdgeKind,
    peer: impl Fn(&Edge) -> JobId,
) -> Vec<(Job, Edge)> {
    index
        .get(&key)
        .into_iter()
        .flatten()
        .filter_map(|edge_id| inner.edges.get(edge_id))
        .filter(|edge| edge.kind == kind)
        .filter_map(|edge| {
            inner
                .jobs
                .get(&peer(edge))
                .map(|job| (job.clone(), edge.clone()))
        })
        .collect()
}

fn remove_edge(inner: &mut StoreInner, id: EdgeId) {
    if let Some(edge) = inner.edges.remove(&id) {
        if let Some(out) = inner.outgoing.get_mut(&(edge.workflow, edge.source)) {
            out.retain(|e| *e != id);
        }
        if let Some(inc) = inner.incoming.get_mut(&(edge.workflow, edge.destination)) {
            inc.retain(|e| *e != id);
        }
    }
}

fn count_jobs(inner: &StoreInner, workflow: JobId, visiting: &mut HashSet<JobId>) -> usize {
    if !visiting.insert(workflow) {
        return 0;
    }
    let members = match inner.jobs.get(&workflow).map(|j| &j.kind) {
        Some(JobKind::Workflow { jobs, .. }) => jobs.clone(),
        _ => return 0,
    };
    let total = members
        .iter()
        .map(|member| match inner.jobs.get(member).map(|j| &j.kind) {
            Some(JobKind::Workflow { .. }) => 1 + count_jobs(inner, *member, visiting),
            _ => 1,
        })
        .sum();
    visiting.remove(&workflow);
    total
}

/// Depth-first cycle check restricted to prerequisite edges of one workflow.
fn has_prerequisite_cycle(inner: &StoreInner, workflow: JobId, members: &[JobId]) -> bool {
    fn visit(
        inner: &StoreInner,
        workflow: JobId,
        node: JobId,
        visited: &mut HashSet<JobId>,
        in_path: &mut HashSet<JobId>,
    ) -> bool {
        if in_path.contains(&node) {
            return true;
        }
        if !visited.insert(node) {
            return false;
        }
        in_path.insert(node);
        let next: Vec<JobId> = inner
            .outgoing
            .get(&(workflow, node))
            .into_iter()
            .flatten()
            .filter_map(|id| inner.edges.get(id))
            .filter(|e| e.kind == EdgeKind::Prerequisite)
            .map(|e| e.destination)
            .collect();
        for succ in next {
            if visit(inner, workflow, succ, visited, in_path) {
                return true;
            }
        }
        in_path.remove(&node);
        false
    }

    let mut visited = HashSet::new();
    let mut in_path = HashSet::new();
    members
        .iter()
        .any(|node| visit(inner, workflow, *node, &mut visited, &mut in_path))
}
