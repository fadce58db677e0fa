//! The execution engine.
//!
//! This module contains:
//! - `coordinator` - the [`Engine`] entry point dispatching runs
//! - `resolver` - target device-set computation
//! - `service` - the service runner (fan-out, retries, aggregation)
//! - `traverser` - the workflow traverser (edge-labeled graph walk)
//! - `report` - the stable result envelope
//! - `error` - engine error types

pub mod coordinator;
pub mod error;
pub mod report;
pub mod resolver;
pub mod service;
pub mod traverser;

pub use coordinator::Engine;
pub use error::EngineError;
pub use report::{value_success, DeviceSummary, Outcome, Report};
