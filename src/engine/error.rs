//! Engine error types.
//!
//! No error of this kind ever crosses the top-level run boundary: the
//! coordinator reifies every failure into the result envelope.

use crate::eval::EvalError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),

    #[error("Device resolution failed: {0}")]
    Resolution(String),

    #[error("Unknown handler: {0}")]
    UnknownHandler(String),
}
