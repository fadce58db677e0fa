//! In-memory persistence: entities, results, and live run state.

pub mod entity;
pub mod results;
pub mod state;

pub use entity::{Store, StoreError};
pub use results::{ResultRecord, ResultStore};
pub use state::{Progress, RunState, RunStateMap};
