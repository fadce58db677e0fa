//! # Autoflow
//!
//! A network-automation workflow engine. Operators define **jobs**: atomic
//! **services** invoking named handlers against a device set, or
//! **workflows**, directed graphs of jobs joined by typed edges. A run
//! executes a job against its computed targets, applies retries, and, for
//! workflows, walks successors selected by the per-device success or
//! failure of each node.
//!
//! ## Features
//!
//! - **Per-device membership propagation** - success and failure edges
//!   carry device sets from node to node
//! - **Bounded fan-out** - services run their targets on up to
//!   `max_processes` parallel workers
//! - **Retries that converge** - succeeded devices are never re-run
//! - **Prerequisite joins, skip and target queries, nested workflows**
//! - **Declarative YAML topologies** - devices, services, workflows, edges
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use autoflow::{Engine, Store, TopologyLoader};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(Store::new());
//!     TopologyLoader::load_str(
//!         r#"
//! devices:
//!   - name: r1
//!     ip_address: 10.0.0.1
//! services:
//!   - name: get-facts
//!     handler: job1
//!     has_targets: true
//!     devices: [r1]
//! "#,
//!         &store,
//!     )?;
//!
//!     let engine = Engine::new(store);
//!     let report = engine.run_by_name("get-facts", json!({})).await;
//!     println!("success: {:?}", report.success);
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod eval;
pub mod export;
pub mod handlers;
pub mod loader;
pub mod model;
pub mod notify;
pub mod store;

// Re-export main types
pub use engine::{value_success, DeviceSummary, Engine, EngineError, Outcome, Report};
pub use eval::{EvalContext, EvalError, Evaluator, ExpressionEvaluator};
pub use export::GitExporter;
pub use handlers::{Handler, HandlerContext, HandlerRegistry};
pub use loader::{LoadError, TopologyLoader};
pub use model::{
    Device, DeviceId, Edge, EdgeId, EdgeKind, Job, JobId, JobKind, JobSnapshot, Pool, PoolId, Run,
    RunProperties, RunSpec, TargetProperty, TraversalMode,
};
pub use notify::{LogNotifier, Notifier, NotifyChannel};
pub use store::{Progress, ResultRecord, ResultStore, RunState, RunStateMap, Store, StoreError};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::engine::{Engine, Outcome, Report};
    pub use crate::eval::{EvalContext, Evaluator, ExpressionEvaluator};
    pub use crate::handlers::{Handler, HandlerContext, HandlerRegistry};
    pub use crate::loader::TopologyLoader;
    pub use crate::model::{
        Device, Edge, EdgeKind, Job, JobKind, Pool, RunProperties, RunSpec, TargetProperty,
        TraversalMode,
    };
    pub use crate::store::{ResultStore, RunStateMap, Store};
}
