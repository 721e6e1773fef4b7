//! Capability traits the host tensor library programs against.
//!
//! Each trait covers one narrow ability; a host library takes
//! `impl Adder` or `impl MatMuler` bounds rather than the concrete
//! [`Engine`], so engines that lack an ability simply do not implement
//! the trait. [`Engine`] implements all of them, returning
//! [`EngineError::Unsupported`] from the operations it declines.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::opts::FuncOpt;
use crate::tensor::{Dtype, GpuTensor};

/// Allocation, release and raw memory operations.
pub trait MemoryBackend {
    /// Allocate an uninitialized tensor whose contents can later be
    /// read back to the host.
    fn alloc_accessible(&self, shape: &[usize]) -> Result<GpuTensor, EngineError>;
    /// Allocate an uninitialized tensor with an explicit element type.
    fn alloc(&self, shape: &[usize], dtype: Dtype) -> Result<GpuTensor, EngineError>;
    /// Release a tensor's device memory.
    fn free(&self, t: GpuTensor);
    /// Fill every element with a constant.
    fn memset(&self, t: &GpuTensor, value: f32) -> Result<(), EngineError>;
    /// Zero every byte of a tensor's buffer.
    fn memclr(&self, t: &GpuTensor) -> Result<(), EngineError>;
    /// Device-side copy of `src` into `dst`.
    fn memcpy(&self, dst: &GpuTensor, src: &GpuTensor) -> Result<(), EngineError>;
    /// Read a tensor's contents back to the host.
    fn accessible(&self, t: &GpuTensor) -> Result<Vec<f32>, EngineError>;
}

/// Elementwise and scalar addition.
pub trait Adder {
    /// Elementwise `a + b`.
    fn add(&self, a: &GpuTensor, b: &GpuTensor, opts: &[FuncOpt])
        -> Result<GpuTensor, EngineError>;
    /// Elementwise `a + scalar`.
    fn add_scalar(
        &self,
        a: &GpuTensor,
        scalar: f32,
        opts: &[FuncOpt],
    ) -> Result<GpuTensor, EngineError>;
}

/// Matrix-matrix multiply into a caller-provided output.
pub trait MatMuler {
    /// `prealloc = a * b`.
    fn matmul(&self, a: &GpuTensor, b: &GpuTensor, prealloc: &GpuTensor)
        -> Result<(), EngineError>;
}

/// Matrix-vector multiply into a caller-provided output.
pub trait MatVecMuler {
    /// `prealloc = m * v`.
    fn matvecmul(
        &self,
        m: &GpuTensor,
        v: &GpuTensor,
        prealloc: &GpuTensor,
    ) -> Result<(), EngineError>;
}

/// Softmax family: forward and backward, plain and log.
pub trait SoftMaxer {
    /// Softmax of `x` along `axis`.
    fn softmax(
        &self,
        x: &GpuTensor,
        axis: usize,
        opts: &[FuncOpt],
    ) -> Result<GpuTensor, EngineError>;
    /// Log-softmax of `x` along `axis`.
    fn log_softmax(
        &self,
        x: &GpuTensor,
        axis: usize,
        opts: &[FuncOpt],
    ) -> Result<GpuTensor, EngineError>;
    /// Softmax backward pass.
    fn softmax_b(
        &self,
        output: &GpuTensor,
        grad: &GpuTensor,
        axis: usize,
    ) -> Result<GpuTensor, EngineError>;
    /// Log-softmax backward pass.
    fn log_softmax_b(
        &self,
        output: &GpuTensor,
        grad: &GpuTensor,
        axis: usize,
    ) -> Result<GpuTensor, EngineError>;
}

impl MemoryBackend for Engine {
    fn alloc_accessible(&self, shape: &[usize]) -> Result<GpuTensor, EngineError> {
        self.empty(shape)
    }

    fn alloc(&self, shape: &[usize], dtype: Dtype) -> Result<GpuTensor, EngineError> {
        self.empty_with_dtype(shape, dtype)
    }

    fn free(&self, t: GpuTensor) {
        self.release(t);
    }

    fn memset(&self, t: &GpuTensor, value: f32) -> Result<(), EngineError> {
        Engine::memset(self, t, value)
    }

    fn memclr(&self, t: &GpuTensor) -> Result<(), EngineError> {
        Engine::memclr(self, t)
    }

    fn memcpy(&self, dst: &GpuTensor, src: &GpuTensor) -> Result<(), EngineError> {
        Engine::memcpy(self, dst, src)
    }

    fn accessible(&self, t: &GpuTensor) -> Result<Vec<f32>, EngineError> {
        self.to_vec(t)
    }
}

impl Adder for Engine {
    fn add(
        &self,
        a: &GpuTensor,
        b: &GpuTensor,
        opts: &[FuncOpt],
    ) -> Result<GpuTensor, EngineError> {
        Engine::add(self, a, b, opts)
    }

    fn add_scalar(
        &self,
        a: &GpuTensor,
        scalar: f32,
        opts: &[FuncOpt],
    ) -> Result<GpuTensor, EngineError> {
        Engine::add_scalar(self, a, scalar, opts)
    }
}

impl MatMuler for Engine {
    fn matmul(
        &self,
        a: &GpuTensor,
        b: &GpuTensor,
        prealloc: &GpuTensor,
    ) -> Result<(), EngineError> {
        Engine::matmul(self, a, b, prealloc)
    }
}

impl MatVecMuler for Engine {
    fn matvecmul(
        &self,
        m: &GpuTensor,
        v: &GpuTensor,
        prealloc: &GpuTensor,
    ) -> Result<(), EngineError> {
        Engine::matvecmul(self, m, v, prealloc)
    }
}

impl SoftMaxer for Engine {
    fn softmax(
        &self,
        x: &GpuTensor,
        axis: usize,
        opts: &[FuncOpt],
    ) -> Result<GpuTensor, EngineError> {
        Engine::softmax(self, x, axis, opts)
    }

    fn log_softmax(
        &self,
        x: &GpuTensor,
        axis: usize,
        opts: &[FuncOpt],
    ) -> Result<GpuTensor, EngineError> {
        Engine::log_softmax(self, x, axis, opts)
    }

    fn softmax_b(
        &self,
        output: &GpuTensor,
        grad: &GpuTensor,
        axis: usize,
    ) -> Result<GpuTensor, EngineError> {
        Engine::softmax_b(self, output, grad, axis)
    }

    fn log_softmax_b(
        &self,
        output: &GpuTensor,
        grad: &GpuTensor,
        axis: usize,
    ) -> Result<GpuTensor, EngineError> {
        Engine::log_softmax_b(self, output, grad, axis)
    }
}
