//! Core data model: inventory, jobs, edges, and runs.
//!
//! Jobs and edges are long-lived configuration, devices are inventory, and
//! runs are created per invocation by the [`crate::store::Store`] factory.

pub mod device;
pub mod job;
pub mod run;

pub use device::{Device, DeviceId, Pool, PoolId};
pub use job::{
    Edge, EdgeId, EdgeKind, Job, JobId, JobKind, JobSnapshot, TargetProperty, TraversalMode,
};
pub use run::{Run, RunProperties, RunSpec};
