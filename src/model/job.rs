//! Job, service, workflow, and edge definitions.
//!
//! A job is either a leaf service invoking a named handler, or a workflow:
//! a directed graph of member jobs joined by typed edges. The two built-in
//! services `Start` and `End` are members of every workflow.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::device::{DeviceId, PoolId};
use crate::notify::NotifyChannel;

pub type JobId = u32;
pub type EdgeId = u32;

/// How a workflow is traversed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraversalMode {
    /// One traversal for all devices; membership propagates through edges.
    #[default]
    Service,
    /// One independent traversal per device; the outer result aggregates them.
    Device,
}

/// Edge subtype. Success and failure edges select successors by outcome;
/// prerequisite edges impose a join barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Success,
    Failure,
    Prerequisite,
}

/// Which device attribute a target query's strings are matched against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetProperty {
    #[default]
    IpAddress,
    Name,
}

/// Discriminates services from workflows and carries their specific fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobKind {
    Service {
        /// Handler name in the process-wide registry.
        handler: String,
        #[serde(default)]
        multiprocessing: bool,
        #[serde(default = "default_max_processes")]
        max_processes: usize,
    },
    Workflow {
        /// Member job ids. Always contains Start and End.
        #[serde(default)]
        jobs: Vec<JobId>,
        /// Jobs seeding the traversal stack. Defaults to `[Start]`.
        #[serde(default)]
        start_jobs: Vec<JobId>,
        #[serde(default = "default_true")]
        use_workflow_devices: bool,
        #[serde(default)]
        traversal_mode: TraversalMode,
    },
}

fn default_max_processes() -> usize {
    5
}

fn default_true() -> bool {
    true
}

/// A named unit of work: service or workflow, plus the shared policy,
/// targeting, and notification attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: JobId,

    /// Unique across all jobs.
    pub name: String,

    #[serde(flatten)]
    pub kind: JobKind,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub hidden: bool,

    #[serde(default = "default_creator")]
    pub creator: String,

    #[serde(default)]
    pub vendor: String,

    #[serde(default)]
    pub operating_system: String,

    /// Additional attempts after the first one.
    #[serde(default)]
    pub retries: u32,

    /// Seconds to sleep between attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,

    /// Seconds to sleep after execution when embedded in a workflow.
    #[serde(default)]
    pub waiting_time: u64,

    #[serde(default)]
    pub skip: bool,

    /// Expression deciding at traversal time whether to skip this job.
    #[serde(default)]
    pub skip_query: Option<String>,

    /// Expression producing target device strings from the payload.
    #[serde(default)]
    pub target_query: Option<String>,

    #[serde(default)]
    pub query_property_type: TargetProperty,

    /// Expression overriding the success flag of each invocation result.
    #[serde(default)]
    pub success_query: Option<String>,

    /// Whether this job fans out over a device set.
    #[serde(default)]
    pub has_targets: bool,

    #[serde(default)]
    pub devices: Vec<DeviceId>,

    #[serde(default)]
    pub pools: Vec<PoolId>,

    /// Merged under the caller's payload at run start.
    #[serde(default)]
    pub initial_payload: Map<String, Value>,

    #[serde(default)]
    pub send_notification: bool,

    #[serde(default)]
    pub notification_method: NotifyChannel,

    #[serde(default)]
    pub notification_header: String,

    /// Comma-separated notification recipients.
    #[serde(default)]
    pub mail_recipient: String,

    #[serde(default)]
    pub push_to_git: bool,
}

fn default_retry_delay() -> u64 {
    10
}

fn default_creator() -> String {
    "admin".into()
}

impl Job {
    /// A minimal service with every policy attribute at its default.
    pub fn service(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            kind: JobKind::Service {
                handler: handler.into(),
                multiprocessing: false,
                max_processes: default_max_processes(),
            },
            description: String::new(),
            hidden: false,
            creator: default_creator(),
            vendor: String::new(),
            operating_system: String::new(),
            retries: 0,
            retry_delay: default_retry_delay(),
            waiting_time: 0,
            skip: false,
            skip_query: None,
            target_query: None,
            query_property_type: TargetProperty::default(),
            success_query: None,
            has_targets: false,
            devices: Vec::new(),
            pools: Vec::new(),
            initial_payload: Map::new(),
            send_notification: false,
            notification_method: NotifyChannel::default(),
            notification_header: String::new(),
            mail_recipient: String::new(),
            push_to_git: false,
        }
    }

    /// A minimal workflow; the store completes membership on insertion.
    pub fn workflow(name: impl Into<String>) -> Self {
        let mut job = Self::service(name, "");
        job.kind = JobKind::Workflow {
            jobs: Vec::new(),
            start_jobs: Vec::new(),
            use_workflow_devices: true,
            traversal_mode: TraversalMode::Service,
        };
        job.has_targets = true;
        job
    }

    pub fn is_workflow(&self) -> bool {
        matches!(self.kind, JobKind::Workflow { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            JobKind::Service { .. } => "service",
            JobKind::Workflow { .. } => "workflow",
        }
    }

    /// Job name stripped down to a filesystem-safe token.
    pub fn filename(&self) -> String {
        self.name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }

    /// Notification recipients parsed from the comma-separated field.
    pub fn recipients(&self) -> Vec<String> {
        self.mail_recipient
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind_name(),
        }
    }
}

/// Coarse job view published to the run-state map and handler contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    pub kind: &'static str,
}

/// A directed arc between two member jobs of one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default)]
    pub id: EdgeId,
    #[serde(default)]
    pub name: String,
    /// Display label; defaults to the subtype.
    #[serde(default)]
    pub label: String,
    pub kind: EdgeKind,
    pub workflow: JobId,
    pub source: JobId,
    pub destination: JobId,
}

impl Edge {
    pub fn new(workflow: JobId, source: JobId, destination: JobId, kind: EdgeKind) -> Self {
        Self {
            id: 0,
            name: String::new(),
            label: String::new(),
            kind,
            workflow,
            source,
            destination,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_yaml_deserialize() {
        let yaml = r#"
name: get-facts
type: service
handler: job1
has_targets: true
retries: 2
retry_delay: 0
"#;
        let job: Job = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(job.name, "get-facts");
        assert_eq!(job.retries, 2);
        assert!(job.has_targets);
        match job.kind {
            JobKind::Service {
                ref handler,
                multiprocessing,
                max_processes,
            } => {
                assert_eq!(handler, "job1");
                assert!(!multiprocessing);
                assert_eq!(max_processes, 5);
            }
            _ => panic!("expected a service"),
        }
    }

    #[test]
    fn test_workflow_yaml_deserialize() {
        let yaml = r#"
name: provisioning
type: workflow
traversal_mode: device
"#;
        let job: Job = serde_yaml::from_str(yaml).unwrap();
        match job.kind {
            JobKind::Workflow {
                traversal_mode,
                use_workflow_devices,
                ..
            } => {
                assert_eq!(traversal_mode, TraversalMode::Device);
                assert!(use_workflow_devices);
            }
            _ => panic!("expected a workflow"),
        }
    }

    #[test]
    fn test_filename_strips_punctuation() {
        let job = Job::service("Get Facts (v2)", "job1");
        assert_eq!(job.filename(), "Get_Facts__v2_");
    }

    #[test]
    fn test_recipients_parsing() {
        let mut job = Job::service("notify", "notify_mail");
        job.mail_recipient = "ops@example.com, net@example.com,".into();
        assert_eq!(
            job.recipients(),
            vec!["ops@example.com".to_string(), "net@example.com".to_string()]
        );
    }
}
