//! The compute engine: pipeline construction, input validation and
//! operation dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use wgpu::util::DeviceExt;

use molten_backend::{
    BackendError, CommandQueue, DeviceCaps, GpuContext,
};

use crate::error::EngineError;
use crate::kernels::KERNELS_WGSL;
use crate::linalg::{
    self, bind_entries, workgroups_1d, LinalgKernels, Matrix, MatrixDescriptor, Vector,
    VectorDescriptor,
};
use crate::opts::{handle_func_opts, FuncOpt};
use crate::tensor::{Dtype, GpuTensor};

/// Operations the host tensor library can ask about via
/// [`Engine::supports`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Elementwise addition of two tensors.
    Add,
    /// Addition of a scalar to every element.
    AddScalar,
    /// Matrix-matrix multiply.
    MatMul,
    /// Matrix-vector multiply.
    MatVecMul,
    /// Softmax along an axis of a matrix.
    SoftMax,
    /// Log-softmax forward pass.
    LogSoftMax,
    /// Softmax backward pass.
    SoftMaxB,
    /// Log-softmax backward pass.
    LogSoftMaxB,
    /// Fill a tensor with a constant.
    Memset,
    /// Zero a tensor.
    Memclr,
    /// Device-side tensor copy.
    Memcpy,
    /// Host readback of a tensor.
    Accessible,
}

/// Elementwise entry points compiled into pipelines at construction.
const ELEMENTWISE_KERNELS: &[&str] = &[
    "add",
    "add_incr",
    "add_assign",
    "add_self",
    "add_scalar",
    "add_scalar_incr",
    "add_scalar_assign",
    "fill",
];

/// A GPU compute backend for a host tensor library.
///
/// Owns one device context, one command queue and the full set of
/// compiled kernel pipelines. Construction compiles every kernel up
/// front; per-operation work is validation, descriptor construction
/// and a single synchronous command submission.
#[derive(Debug)]
pub struct Engine {
    ctx: Arc<GpuContext>,
    queue: CommandQueue,
    fns: HashMap<&'static str, wgpu::ComputePipeline>,
    linalg: LinalgKernels,
}

impl Engine {
    /// Compile the kernel library and build every pipeline.
    ///
    /// Any compile or pipeline failure here is fatal; the engine never
    /// retries kernel construction.
    pub fn new(ctx: Arc<GpuContext>) -> Result<Self, EngineError> {
        let library = ctx.compile_library(KERNELS_WGSL)?;

        let mut fns = HashMap::new();
        for &name in ELEMENTWISE_KERNELS {
            fns.insert(name, ctx.build_pipeline(&library, name)?);
        }
        let linalg = LinalgKernels::new(&ctx, &library)?;
        log::info!(
            "engine ready on {} ({} pipelines)",
            ctx.adapter_summary(),
            fns.len() + LinalgKernels::ENTRY_POINTS.len()
        );

        Ok(Self {
            queue: CommandQueue::new(&ctx),
            ctx,
            fns,
            linalg,
        })
    }

    /// The device context this engine runs on.
    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    /// Capability facts for the underlying device.
    pub fn device_caps(&self) -> &DeviceCaps {
        self.ctx.caps()
    }

    /// Whether this engine implements an operation. Calling an
    /// unimplemented one returns [`EngineError::Unsupported`] instead.
    pub fn supports(&self, op: Op) -> bool {
        !matches!(op, Op::LogSoftMax | Op::SoftMaxB | Op::LogSoftMaxB)
    }

    fn pipeline(&self, name: &'static str) -> Result<&wgpu::ComputePipeline, EngineError> {
        self.fns
            .get(name)
            .ok_or_else(|| BackendError::FunctionNotFound(name.to_string()).into())
    }

    // --- host <-> device bridge ---

    /// Allocate an uninitialized tensor of the given shape.
    pub fn empty(&self, shape: &[usize]) -> Result<GpuTensor, EngineError> {
        self.empty_with_dtype(shape, Dtype::F32)
    }

    /// Allocate an uninitialized tensor with an explicit element type.
    pub fn empty_with_dtype(
        &self,
        shape: &[usize],
        dtype: Dtype,
    ) -> Result<GpuTensor, EngineError> {
        let numel: usize = shape.iter().product();
        let buf = self.ctx.alloc((numel * dtype.size_bytes()) as u64)?;
        Ok(GpuTensor::new(Arc::new(buf), shape, dtype))
    }

    /// Upload host data into a new device tensor.
    pub fn tensor_from_slice(
        &self,
        data: &[f32],
        shape: &[usize],
    ) -> Result<GpuTensor, EngineError> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(EngineError::Shape(format!(
                "{} host elements cannot fill shape {:?}",
                data.len(),
                shape
            )));
        }
        let buf = self.ctx.buffer_from_host(bytemuck::cast_slice(data))?;
        Ok(GpuTensor::new(Arc::new(buf), shape, Dtype::F32))
    }

    /// Copy a tensor's contents back to the host.
    ///
    /// Blocks until the device-to-host copy completes. This is the only
    /// way host code observes computed results.
    pub fn to_vec(&self, t: &GpuTensor) -> Result<Vec<f32>, EngineError> {
        require_f32(&[t])?;
        let bytes = self.ctx.read_back(t.buffer())?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Release a tensor's device memory.
    ///
    /// Clones of the handle that outlive the release see submission
    /// errors from any later use, never stale data.
    pub fn release(&self, t: GpuTensor) {
        self.ctx.free_shared(t.buffer());
    }

    // --- elementwise dispatch ---

    /// Elementwise `a + b`.
    ///
    /// By default writes into a fresh tensor (or the reuse tensor when
    /// one is given); with [`crate::AliasMode::InPlace`] it overwrites
    /// `a`'s own buffer and returns a handle sharing it. A buffer
    /// cannot be bound for reading and writing in the same dispatch,
    /// so a reuse tensor sharing a buffer with an input goes through
    /// the in-place kernel, and identical left/right operands written
    /// in place go through a doubling kernel.
    pub fn add(
        &self,
        a: &GpuTensor,
        b: &GpuTensor,
        opts: &[FuncOpt],
    ) -> Result<GpuTensor, EngineError> {
        require_f32(&[a, b])?;
        if a.numel() != b.numel() {
            return Err(EngineError::Shape(format!(
                "cannot add {:?} and {:?}: element counts differ",
                a.shape(),
                b.shape()
            )));
        }
        let resolved = handle_func_opts(a.shape(), Dtype::F32, opts)?;
        let same_operands = a.same_buffer(b);

        if !resolved.safe {
            if resolved.incr {
                log::warn!("incr is ignored for in-place add");
            }
            if resolved.to_reuse() {
                log::warn!("reuse tensor is ignored for in-place add");
            }
            if same_operands {
                return self.add_self(a).map(|_| a.clone());
            }
            return self.add_assign(a, b).map(|_| a.clone());
        }

        if let Some(out) = resolved.reuse {
            if out.same_buffer(a) || out.same_buffer(b) {
                if resolved.incr {
                    log::warn!("incr is ignored when the reuse tensor aliases an input");
                }
                if same_operands {
                    return self.add_self(a).map(|_| out);
                }
                if out.same_buffer(a) {
                    return self.add_assign(a, b).map(|_| out);
                }
                return self.add_assign(b, a).map(|_| out);
            }
            let kernel = if resolved.incr { "add_incr" } else { "add" };
            self.dispatch_binary(kernel, a, b, &out)?;
            return Ok(out);
        }

        if resolved.incr {
            log::warn!("incr needs a reuse tensor to accumulate into; ignored");
        }
        let out = self.empty(a.shape())?;
        self.dispatch_binary("add", a, b, &out)?;
        Ok(out)
    }

    fn dispatch_binary(
        &self,
        kernel: &'static str,
        a: &GpuTensor,
        b: &GpuTensor,
        out: &GpuTensor,
    ) -> Result<(), EngineError> {
        let pipeline = self.pipeline(kernel)?;
        let mut cmd = self.queue.command_buffer(kernel);
        let bind = bind_entries(
            cmd.device(),
            pipeline,
            &[
                a.buffer().raw().as_entire_binding(),
                b.buffer().raw().as_entire_binding(),
                out.buffer().raw().as_entire_binding(),
            ],
        );
        cmd.enqueue();
        cmd.dispatch(pipeline, &bind, (workgroups_1d(out.numel() as u32), 1, 1));
        cmd.commit_and_wait()?;
        Ok(())
    }

    fn add_self(&self, acc: &GpuTensor) -> Result<(), EngineError> {
        let pipeline = self.pipeline("add_self")?;
        let mut cmd = self.queue.command_buffer("add_self");
        let bind = bind_entries(
            cmd.device(),
            pipeline,
            &[acc.buffer().raw().as_entire_binding()],
        );
        cmd.enqueue();
        cmd.dispatch(pipeline, &bind, (workgroups_1d(acc.numel() as u32), 1, 1));
        cmd.commit_and_wait()?;
        Ok(())
    }

    fn add_assign(&self, acc: &GpuTensor, other: &GpuTensor) -> Result<(), EngineError> {
        let pipeline = self.pipeline("add_assign")?;
        let mut cmd = self.queue.command_buffer("add_assign");
        let bind = bind_entries(
            cmd.device(),
            pipeline,
            &[
                acc.buffer().raw().as_entire_binding(),
                other.buffer().raw().as_entire_binding(),
            ],
        );
        cmd.enqueue();
        cmd.dispatch(pipeline, &bind, (workgroups_1d(acc.numel() as u32), 1, 1));
        cmd.commit_and_wait()?;
        Ok(())
    }

    /// Elementwise `a + scalar`, with the same aliasing rules as
    /// [`Engine::add`].
    pub fn add_scalar(
        &self,
        a: &GpuTensor,
        scalar: f32,
        opts: &[FuncOpt],
    ) -> Result<GpuTensor, EngineError> {
        require_f32(&[a])?;
        let resolved = handle_func_opts(a.shape(), Dtype::F32, opts)?;

        if !resolved.safe {
            if resolved.incr {
                log::warn!("incr is ignored for in-place add_scalar");
            }
            return self.add_scalar_assign(a, scalar).map(|_| a.clone());
        }

        if let Some(out) = resolved.reuse {
            if out.same_buffer(a) {
                if resolved.incr {
                    log::warn!("incr is ignored when the reuse tensor aliases the input");
                }
                return self.add_scalar_assign(a, scalar).map(|_| out);
            }
            let kernel = if resolved.incr {
                "add_scalar_incr"
            } else {
                "add_scalar"
            };
            self.dispatch_scalar(kernel, a, scalar, &out)?;
            return Ok(out);
        }

        if resolved.incr {
            log::warn!("incr needs a reuse tensor to accumulate into; ignored");
        }
        let out = self.empty(a.shape())?;
        self.dispatch_scalar("add_scalar", a, scalar, &out)?;
        Ok(out)
    }

    fn dispatch_scalar(
        &self,
        kernel: &'static str,
        a: &GpuTensor,
        scalar: f32,
        out: &GpuTensor,
    ) -> Result<(), EngineError> {
        let pipeline = self.pipeline(kernel)?;
        let mut cmd = self.queue.command_buffer(kernel);
        let val = scalar_uniform(cmd.device(), scalar);
        let bind = bind_entries(
            cmd.device(),
            pipeline,
            &[
                a.buffer().raw().as_entire_binding(),
                out.buffer().raw().as_entire_binding(),
                val.as_entire_binding(),
            ],
        );
        cmd.enqueue();
        cmd.dispatch(pipeline, &bind, (workgroups_1d(out.numel() as u32), 1, 1));
        cmd.commit_and_wait()?;
        Ok(())
    }

    fn add_scalar_assign(&self, a: &GpuTensor, scalar: f32) -> Result<(), EngineError> {
        let pipeline = self.pipeline("add_scalar_assign")?;
        let mut cmd = self.queue.command_buffer("add_scalar_assign");
        let val = scalar_uniform(cmd.device(), scalar);
        let bind = bind_entries(
            cmd.device(),
            pipeline,
            &[
                a.buffer().raw().as_entire_binding(),
                val.as_entire_binding(),
            ],
        );
        cmd.enqueue();
        cmd.dispatch(pipeline, &bind, (workgroups_1d(a.numel() as u32), 1, 1));
        cmd.commit_and_wait()?;
        Ok(())
    }

    // --- linear algebra dispatch ---

    /// Matrix multiply `prealloc = a * b`.
    ///
    /// All three operands must be rank-2 and `f32`; the caller supplies
    /// the output tensor.
    pub fn matmul(
        &self,
        a: &GpuTensor,
        b: &GpuTensor,
        prealloc: &GpuTensor,
    ) -> Result<(), EngineError> {
        require_f32(&[a, b, prealloc])?;
        check_matmul_dims(a.shape(), b.shape(), prealloc.shape())?;

        let a_m = Matrix::new(a.buffer(), MatrixDescriptor::from_tensor(a)?);
        let b_m = Matrix::new(b.buffer(), MatrixDescriptor::from_tensor(b)?);
        let c_m = Matrix::new(prealloc.buffer(), MatrixDescriptor::from_tensor(prealloc)?);

        let mut cmd = self.queue.command_buffer("matmul");
        cmd.enqueue();
        linalg::matmul(&self.linalg, &mut cmd, &a_m, &b_m, &c_m);
        cmd.commit_and_wait()?;
        Ok(())
    }

    /// Matrix-vector multiply `prealloc = m * v`.
    ///
    /// `m` must be rank-2; `v` and `prealloc` must be vector-like with
    /// lengths matching `m`'s columns and rows respectively.
    pub fn matvecmul(
        &self,
        m: &GpuTensor,
        v: &GpuTensor,
        prealloc: &GpuTensor,
    ) -> Result<(), EngineError> {
        require_f32(&[m, v, prealloc])?;
        check_matvecmul_dims(m.shape(), v.shape(), prealloc.shape())?;

        let m_view = Matrix::new(m.buffer(), MatrixDescriptor::from_tensor(m)?);
        let v_view = Vector::new(v.buffer(), VectorDescriptor::from_tensor(v)?);
        let out_view = Vector::new(prealloc.buffer(), VectorDescriptor::from_tensor(prealloc)?);

        let mut cmd = self.queue.command_buffer("matvecmul");
        cmd.enqueue();
        linalg::matvecmul(&self.linalg, &mut cmd, &m_view, &v_view, &out_view);
        cmd.commit_and_wait()?;
        Ok(())
    }

    /// Softmax of `x` along `axis`, max-shifted for numerical
    /// stability.
    ///
    /// `x` must be rank 1 or 2; a rank-1 tensor is treated as a single
    /// row. The aliasing rules of [`Engine::add`] apply; `incr` is not
    /// meaningful for softmax and is ignored with a warning.
    pub fn softmax(
        &self,
        x: &GpuTensor,
        axis: usize,
        opts: &[FuncOpt],
    ) -> Result<GpuTensor, EngineError> {
        require_f32(&[x])?;
        if x.ndim() > 2 {
            return Err(EngineError::Shape(format!(
                "softmax needs a vector or matrix, got shape {:?}",
                x.shape()
            )));
        }
        if axis >= x.ndim().max(1) {
            return Err(EngineError::Shape(format!(
                "axis {} out of range for shape {:?}",
                axis,
                x.shape()
            )));
        }
        let resolved = handle_func_opts(x.shape(), Dtype::F32, opts)?;
        if resolved.incr {
            log::warn!("incr is not meaningful for softmax; ignored");
        }

        // Rank-1 input is one row reduced along its only axis.
        let (desc, kernel_axis) = if x.ndim() == 1 {
            (
                MatrixDescriptor::from_parts(&[1, x.numel()], Dtype::F32)?,
                1,
            )
        } else {
            (MatrixDescriptor::from_tensor(x)?, axis)
        };

        if !resolved.safe {
            self.softmax_inplace(x, desc, kernel_axis)?;
            return Ok(x.clone());
        }

        if let Some(out) = resolved.reuse {
            if out.same_buffer(x) {
                self.softmax_inplace(x, desc, kernel_axis)?;
                return Ok(out);
            }
            self.softmax_copy_out(x, &out, desc, kernel_axis)?;
            return Ok(out);
        }

        let out = self.empty(x.shape())?;
        self.softmax_copy_out(x, &out, desc, kernel_axis)?;
        Ok(out)
    }

    fn softmax_copy_out(
        &self,
        x: &GpuTensor,
        out: &GpuTensor,
        desc: MatrixDescriptor,
        axis: usize,
    ) -> Result<(), EngineError> {
        let x_view = Matrix::new(x.buffer(), desc);
        let out_view = Matrix::new(out.buffer(), desc);
        let mut cmd = self.queue.command_buffer("softmax");
        cmd.enqueue();
        linalg::softmax(&self.linalg, &mut cmd, &x_view, &out_view, axis);
        cmd.commit_and_wait()?;
        Ok(())
    }

    fn softmax_inplace(
        &self,
        x: &GpuTensor,
        desc: MatrixDescriptor,
        axis: usize,
    ) -> Result<(), EngineError> {
        let x_view = Matrix::new(x.buffer(), desc);
        let mut cmd = self.queue.command_buffer("softmax_inplace");
        cmd.enqueue();
        linalg::softmax_inplace(&self.linalg, &mut cmd, &x_view, axis);
        cmd.commit_and_wait()?;
        Ok(())
    }

    /// Log-softmax forward pass. Not implemented by this engine.
    pub fn log_softmax(
        &self,
        _x: &GpuTensor,
        _axis: usize,
        _opts: &[FuncOpt],
    ) -> Result<GpuTensor, EngineError> {
        Err(EngineError::Unsupported(Op::LogSoftMax))
    }

    /// Softmax backward pass. Not implemented by this engine.
    pub fn softmax_b(
        &self,
        _output: &GpuTensor,
        _grad: &GpuTensor,
        _axis: usize,
    ) -> Result<GpuTensor, EngineError> {
        Err(EngineError::Unsupported(Op::SoftMaxB))
    }

    /// Log-softmax backward pass. Not implemented by this engine.
    pub fn log_softmax_b(
        &self,
        _output: &GpuTensor,
        _grad: &GpuTensor,
        _axis: usize,
    ) -> Result<GpuTensor, EngineError> {
        Err(EngineError::Unsupported(Op::LogSoftMaxB))
    }

    // --- raw memory operations ---

    /// Fill every element of a tensor with a constant.
    pub fn memset(&self, t: &GpuTensor, value: f32) -> Result<(), EngineError> {
        require_f32(&[t])?;
        let pipeline = self.pipeline("fill")?;
        let mut cmd = self.queue.command_buffer("fill");
        let val = scalar_uniform(cmd.device(), value);
        let bind = bind_entries(
            cmd.device(),
            pipeline,
            &[
                t.buffer().raw().as_entire_binding(),
                val.as_entire_binding(),
            ],
        );
        cmd.enqueue();
        cmd.dispatch(pipeline, &bind, (workgroups_1d(t.numel() as u32), 1, 1));
        cmd.commit_and_wait()?;
        Ok(())
    }

    /// Zero every byte of a tensor's buffer. Works for any dtype.
    pub fn memclr(&self, t: &GpuTensor) -> Result<(), EngineError> {
        let mut cmd = self.queue.command_buffer("memclr");
        cmd.enqueue();
        cmd.clear_buffer(t.buffer());
        cmd.commit_and_wait()?;
        Ok(())
    }

    /// Device-side copy of `src`'s contents into `dst`. Byte sizes must
    /// match.
    pub fn memcpy(&self, dst: &GpuTensor, src: &GpuTensor) -> Result<(), EngineError> {
        self.ctx.copy(dst.buffer(), src.buffer())?;
        Ok(())
    }
}

fn require_f32(tensors: &[&GpuTensor]) -> Result<(), EngineError> {
    for t in tensors {
        if t.dtype() != Dtype::F32 {
            return Err(EngineError::Type(format!(
                "kernels compute in f32 only, got {}",
                t.dtype()
            )));
        }
    }
    Ok(())
}

fn scalar_uniform(device: &wgpu::Device, value: f32) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("scalar"),
        contents: bytemuck::cast_slice(&[value]),
        usage: wgpu::BufferUsages::UNIFORM,
    })
}

/// Validate `out = a * b` shapes; returns `(m, k, n)`.
pub(crate) fn check_matmul_dims(
    a: &[usize],
    b: &[usize],
    out: &[usize],
) -> Result<(usize, usize, usize), EngineError> {
    if a.len() != 2 || b.len() != 2 || out.len() != 2 {
        return Err(EngineError::Shape(format!(
            "matmul needs three matrices, got {:?}, {:?}, {:?}",
            a, b, out
        )));
    }
    if a[1] != b[0] {
        return Err(EngineError::Shape(format!(
            "cannot multiply {:?} by {:?}: inner dimensions differ",
            a, b
        )));
    }
    if out[0] != a[0] || out[1] != b[1] {
        return Err(EngineError::Shape(format!(
            "output shape {:?} does not hold a {:?} x {:?} product",
            out, a, b
        )));
    }
    Ok((a[0], a[1], b[1]))
}

/// Validate `out = m * v` shapes.
pub(crate) fn check_matvecmul_dims(
    m: &[usize],
    v: &[usize],
    out: &[usize],
) -> Result<(), EngineError> {
    if m.len() != 2 {
        return Err(EngineError::Shape(format!(
            "matvecmul needs a matrix, got {:?}",
            m
        )));
    }
    if !crate::tensor::is_vector_like(v) {
        return Err(EngineError::Shape(format!(
            "matvecmul needs a vector-like operand, got {:?}",
            v
        )));
    }
    if !crate::tensor::is_vector_like(out) {
        return Err(EngineError::Shape(format!(
            "matvecmul output must be vector-like, got {:?}",
            out
        )));
    }
    let v_len: usize = v.iter().product();
    let out_len: usize = out.iter().product();
    if v_len != m[1] {
        return Err(EngineError::Shape(format!(
            "vector of {} elements does not match {:?}'s columns",
            v_len, m
        )));
    }
    if out_len != m[0] {
        return Err(EngineError::Shape(format!(
            "output of {} elements does not match {:?}'s rows",
            out_len, m
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_dims_accept_conformable_shapes() {
        assert_eq!(
            check_matmul_dims(&[2, 3], &[3, 4], &[2, 4]).unwrap(),
            (2, 3, 4)
        );
    }

    #[test]
    fn matmul_dims_reject_mismatches() {
        assert!(check_matmul_dims(&[2, 3], &[4, 5], &[2, 5]).is_err());
        assert!(check_matmul_dims(&[2, 3], &[3, 4], &[3, 4]).is_err());
        assert!(check_matmul_dims(&[2, 3], &[3, 4], &[2, 5]).is_err());
        assert!(check_matmul_dims(&[6], &[3, 4], &[2, 4]).is_err());
    }

    #[test]
    fn matvecmul_dims_validate_all_operands() {
        assert!(check_matvecmul_dims(&[2, 3], &[3], &[2]).is_ok());
        assert!(check_matvecmul_dims(&[2, 3], &[1, 3], &[2, 1]).is_ok());
        assert!(check_matvecmul_dims(&[2, 3], &[2], &[2]).is_err());
        assert!(check_matvecmul_dims(&[2, 3], &[3], &[3]).is_err());
        assert!(check_matvecmul_dims(&[2, 3], &[2, 2], &[2]).is_err());
        assert!(check_matvecmul_dims(&[3], &[3], &[1]).is_err());
    }
}
