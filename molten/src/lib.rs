//! # Molten - a GPU compute engine for host tensor libraries
//!
//! Molten executes tensor operations (elementwise arithmetic, matrix
//! multiply, matrix-vector multiply, softmax) on whatever GPU wgpu can
//! reach, and presents itself to a host tensor library as an
//! interchangeable compute backend.
//!
//! The bridge it builds: the host side makes synchronous, CPU-flavored
//! operation calls; the GPU side wants queue submissions, separate
//! address spaces and explicit resource descriptors. The [`Engine`]
//! dispatcher maps each call onto one command-buffer submission,
//! validates shapes and dtypes up front, resolves the
//! reuse/alias/incr function options, and blocks until the device
//! signals completion.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use molten::prelude::*;
//!
//! let ctx = Arc::new(molten_backend::GpuContext::discover_blocking()?);
//! let engine = Engine::new(ctx)?;
//!
//! let a = engine.tensor_from_slice(&[1., 2., 3., 4., 5., 6.], &[2, 3])?;
//! let b = engine.tensor_from_slice(&[1., 2., 3., 4., 5., 6.], &[2, 3])?;
//! let c = engine.add(&a, &b, &[])?;
//! println!("{:?}", engine.to_vec(&c)?);
//! # Ok::<(), molten::EngineError>(())
//! ```

#![warn(missing_docs)]

pub mod capability;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod linalg;
pub mod opts;
pub mod tensor;

pub use engine::{Engine, Op};
pub use error::EngineError;
pub use opts::{AliasMode, FuncOpt};
pub use tensor::{Dtype, GpuTensor};

pub use molten_backend;

/// Import everything you need with `use molten::prelude::*`.
pub mod prelude {
    pub use crate::capability::{Adder, MatMuler, MatVecMuler, MemoryBackend, SoftMaxer};
    pub use crate::engine::{Engine, Op};
    pub use crate::error::EngineError;
    pub use crate::opts::{AliasMode, FuncOpt};
    pub use crate::tensor::{Dtype, GpuTensor};
}
