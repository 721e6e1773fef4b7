//! Engine error kinds.
//!
//! Validation errors (`Type`, `Shape`) are detected before any device
//! work is issued and are safe to retry after correcting inputs.
//! Backend errors surface from the device layer: allocation and
//! submission faults invalidate any output the call produced, and
//! compile/build/discovery faults are startup-fatal by policy.

use thiserror::Error;

use molten_backend::BackendError;

use crate::engine::Op;

/// Errors returned by [`crate::Engine`] operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Device, allocation, compilation or submission failure from the
    /// backend layer.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// Operand element types mismatched or unsupported.
    #[error("type error: {0}")]
    Type(String),
    /// Rank, dimension or vector-likeness violated.
    #[error("shape error: {0}")]
    Shape(String),
    /// The engine does not implement this operation; query
    /// [`crate::Engine::supports`] before calling.
    #[error("operation {0:?} is not supported by this engine")]
    Unsupported(Op),
}

impl EngineError {
    /// True for validation errors that left no side effects.
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Type(_) | EngineError::Shape(_))
    }
}
