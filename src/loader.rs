//! Declarative topology loader.
//!
//! Loads devices, pools, services, workflows, and edges from a YAML file
//! into a [`Store`]. References between entities are by name and resolved
//! on the way in, so files stay readable:
//!
//! ```yaml
//! devices:
//!   - name: r1
//!     ip_address: 10.0.0.1
//! services:
//!   - name: get-facts
//!     handler: job1
//!     has_targets: true
//!     devices: [r1]
//! workflows:
//!   - name: provisioning
//!     devices: [r1]
//!     jobs: [get-facts]
//!     edges:
//!       - source: Start
//!         destination: get-facts
//!         kind: success
//!       - source: get-facts
//!         destination: End
//!         kind: success
//! ```

use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::model::{
    Device, Edge, EdgeKind, Job, JobKind, Pool, TargetProperty, TraversalMode,
};
use crate::notify::NotifyChannel;
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    devices: Vec<Device>,
    #[serde(default)]
    pools: Vec<PoolSpec>,
    #[serde(default)]
    services: Vec<ServiceSpec>,
    #[serde(default)]
    workflows: Vec<WorkflowSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct PoolSpec {
    name: String,
    #[serde(default)]
    devices: Vec<String>,
}

/// Policy, targeting, and notification fields shared by services and
/// workflows. Device and pool references are by name.
#[derive(Debug, Default, Deserialize)]
struct JobCommon {
    #[serde(default)]
    description: String,
    #[serde(default)]
    retries: u32,
    #[serde(default)]
    retry_delay: Option<u64>,
    #[serde(default)]
    waiting_time: u64,
    #[serde(default)]
    skip: bool,
    #[serde(default)]
    skip_query: Option<String>,
    #[serde(default)]
    target_query: Option<String>,
    #[serde(default)]
    query_property_type: TargetProperty,
    #[serde(default)]
    success_query: Option<String>,
    #[serde(default)]
    devices: Vec<String>,
    #[serde(default)]
    pools: Vec<String>,
    #[serde(default)]
    initial_payload: Map<String, Value>,
    #[serde(default)]
    send_notification: bool,
    #[serde(default)]
    notification_method: NotifyChannel,
    #[serde(default)]
    notification_header: String,
    #[serde(default)]
    mail_recipient: String,
    #[serde(default)]
    push_to_git: bool,
}

#[derive(Debug, Deserialize)]
struct ServiceSpec {
    name: String,
    handler: String,
    #[serde(default)]
    multiprocessing: bool,
    #[serde(default)]
    max_processes: Option<usize>,
    #[serde(default)]
    has_targets: bool,
    #[serde(flatten)]
    common: JobCommon,
}

#[derive(Debug, Deserialize)]
struct WorkflowSpec {
    name: String,
    #[serde(default)]
    jobs: Vec<String>,
    #[serde(default)]
    start_jobs: Vec<String>,
    #[serde(default = "default_true")]
    use_workflow_devices: bool,
    #[serde(default)]
    traversal_mode: TraversalMode,
    #[serde(default)]
    edges: Vec<EdgeSpec>,
    #[serde(flatten)]
    common: JobCommon,
}

#[derive(Debug, Deserialize)]
struct EdgeSpec {
    source: String,
    destination: String,
    kind: EdgeKind,
}

fn default_true() -> bool {
    true
}

/// Loads topology files into a store.
pub struct TopologyLoader;

impl TopologyLoader {
    pub fn load_file(path: &Path, store: &Store) -> Result<(), LoadError> {
        let content = std::fs::read_to_string(path)?;
        let file: TopologyFile =
            serde_yaml::from_str(&content).map_err(|error| LoadError::Yaml {
                file: path.display().to_string(),
                error,
            })?;
        Self::load(file, store)
    }

    pub fn load_str(content: &str, store: &Store) -> Result<(), LoadError> {
        let file: TopologyFile =
            serde_yaml::from_str(content).map_err(|error| LoadError::Yaml {
                file: "<inline>".to_string(),
                error,
            })?;
        Self::load(file, store)
    }

    fn load(file: TopologyFile, store: &Store) -> Result<(), LoadError> {
        for device in file.devices {
            store.add_device(device)?;
        }
        for pool in file.pools {
            let devices = pool
                .devices
                .iter()
                .map(|name| store.device_by_name(name).map(|d| d.id))
                .collect::<Result<Vec<_>, _>>()?;
            store.add_pool(Pool {
                id: 0,
                name: pool.name,
                devices,
            })?;
        }
        for spec in file.services {
            let mut job = Job::service(&spec.name, &spec.handler);
            if let JobKind::Service {
                multiprocessing,
                max_processes,
                ..
            } = &mut job.kind
            {
                *multiprocessing = spec.multiprocessing;
                if let Some(processes) = spec.max_processes {
                    *max_processes = processes;
                }
            }
            job.has_targets = spec.has_targets;
            apply_common(&mut job, spec.common, store)?;
            store.add_job(job)?;
        }
        for spec in file.workflows {
            let members = spec
                .jobs
                .iter()
                .map(|name| store.job_by_name(name).map(|j| j.id))
                .collect::<Result<Vec<_>, _>>()?;
            let starters = spec
                .start_jobs
                .iter()
                .map(|name| store.job_by_name(name).map(|j| j.id))
                .collect::<Result<Vec<_>, _>>()?;
            let mut job = Job::workflow(&spec.name);
            job.kind = JobKind::Workflow {
                jobs: members,
                start_jobs: starters,
                use_workflow_devices: spec.use_workflow_devices,
                traversal_mode: spec.traversal_mode,
            };
            apply_common(&mut job, spec.common, store)?;
            let workflow = store.add_job(job)?;
            for edge in spec.edges {
                let source = store.job_by_name(&edge.source)?.id;
                let destination = store.job_by_name(&edge.destination)?.id;
                store.add_edge(Edge::new(workflow.id, source, destination, edge.kind))?;
            }
        }
        Ok(())
    }
}

fn apply_common(job: &mut Job, common: JobCommon, store: &Store) -> Result<(), StoreError> {
    job.description = common.description;
    job.retries = common.retries;
    if let Some(delay) = common.retry_delay {
        job.retry_delay = delay;
    }
    job.waiting_time = common.waiting_time;
    job.skip = common.skip;
    job.skip_query = common.skip_query;
    job.target_query = common.target_query;
    job.query_property_type = common.query_property_type;
    job.success_query = common.success_query;
    job.initial_payload = common.initial_payload;
    job.send_notification = common.send_notification;
    job.notification_method = common.notification_method;
    job.notification_header = common.notification_header;
    job.mail_recipient = common.mail_recipient;
    job.push_to_git = common.push_to_git;
    job.devices = common
        .devices
        .iter()
        .map(|name| store.device_by_name(name).map(|d| d.id))
        .collect::<Result<Vec<_>, _>>()?;
    job.pools = common
        .pools
        .iter()
        .map(|name| store.pool_by_name(name).map(|p| p.id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EdgeKind;

    const TOPOLOGY: &str = r#"
devices:
  - name: r1
    ip_address: 10.0.0.1
    vendor: arista
  - name: r2
    ip_address: 10.0.0.2
pools:
  - name: core
    devices: [r1, r2]
services:
  - name: get-facts
    handler: job1
    has_targets: true
    pools: [core]
    retries: 1
    retry_delay: 0
workflows:
  - name: provisioning
    devices: [r1, r2]
    jobs: [get-facts]
    edges:
      - source: Start
        destination: get-facts
        kind: success
      - source: get-facts
        destination: End
        kind: success
"#;

    #[test]
    fn test_load_topology() {
        let store = Store::new();
        TopologyLoader::load_str(TOPOLOGY, &store).unwrap();

        let device = store.device_by_name("r1").unwrap();
        assert_eq!(device.vendor, "arista");

        let pool = store.pool_by_name("core").unwrap();
        assert_eq!(pool.devices.len(), 2);

        let service = store.job_by_name("get-facts").unwrap();
        assert_eq!(service.retries, 1);
        assert_eq!(service.pools, vec![pool.id]);

        let workflow = store.job_by_name("provisioning").unwrap();
        match &workflow.kind {
            JobKind::Workflow {
                jobs, start_jobs, ..
            } => {
                // Start and End are added to the membership automatically.
                assert_eq!(jobs.len(), 3);
                assert_eq!(start_jobs.len(), 1);
            }
            _ => panic!("expected a workflow"),
        }
        assert_eq!(
            store
                .successors(workflow.id, service.id, EdgeKind::Success)
                .len(),
            1
        );
    }

    #[test]
    fn test_unknown_device_reference() {
        let store = Store::new();
        let result = TopologyLoader::load_str(
            "services:\n  - name: s\n    handler: job1\n    devices: [ghost]\n",
            &store,
        );
        assert!(matches!(result, Err(LoadError::Store(_))));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.yaml");
        std::fs::write(&path, TOPOLOGY).unwrap();

        let store = Store::new();
        TopologyLoader::load_file(&path, &store).unwrap();
        assert!(store.job_by_name("provisioning").is_ok());
    }
}
