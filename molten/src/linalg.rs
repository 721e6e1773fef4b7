//! The linear-algebra layer: matrix/vector descriptors and the kernels
//! that consume them.
//!
//! Descriptors are derived, read-only metadata computed from a
//! tensor's shape and element type at the moment an operation needs
//! them; they never outlive the call that created them. The record
//! functions take pre-built matrix/vector views plus the command
//! buffer directly: they record work and do not fail at call time --
//! device faults surface when the buffer is committed.

use wgpu::util::DeviceExt;

use molten_backend::{BackendError, CommandBuffer, DeviceBuffer, GpuContext, KernelLibrary};

use crate::error::EngineError;
use crate::tensor::{self, Dtype, GpuTensor};

/// Row/column counts and row stride in bytes for reading a buffer as
/// a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixDescriptor {
    /// Number of rows.
    pub rows: usize,
    /// Number of columns.
    pub cols: usize,
    /// Stride between rows, in bytes: `cols * element size`.
    pub row_bytes: usize,
}

impl MatrixDescriptor {
    /// Build a descriptor from a shape and element type. The rank must
    /// be exactly 2.
    pub fn from_parts(shape: &[usize], dtype: Dtype) -> Result<Self, EngineError> {
        if shape.len() != 2 {
            return Err(EngineError::Shape(format!(
                "expected a matrix, got shape {:?}",
                shape
            )));
        }
        Ok(Self {
            rows: shape[0],
            cols: shape[1],
            row_bytes: shape[1] * dtype.size_bytes(),
        })
    }

    /// Build a descriptor from a tensor's metadata.
    pub fn from_tensor(t: &GpuTensor) -> Result<Self, EngineError> {
        Self::from_parts(t.shape(), t.dtype())
    }
}

/// Length metadata for reading a buffer as a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorDescriptor {
    /// Extent of the single non-unit dimension, or 1 if all dimensions
    /// are unit-length.
    pub len: usize,
}

impl VectorDescriptor {
    /// Build a descriptor from a shape. The shape must be vector-like:
    /// at most one dimension with extent greater than 1.
    pub fn from_parts(shape: &[usize]) -> Result<Self, EngineError> {
        if !tensor::is_vector_like(shape) {
            return Err(EngineError::Shape(format!(
                "expected a vector-like shape, got {:?}",
                shape
            )));
        }
        Ok(Self {
            len: shape.iter().product::<usize>().max(1),
        })
    }

    /// Build a descriptor from a tensor's metadata.
    pub fn from_tensor(t: &GpuTensor) -> Result<Self, EngineError> {
        Self::from_parts(t.shape())
    }
}

/// A buffer viewed as a matrix for the duration of one call.
pub struct Matrix<'a> {
    buffer: &'a DeviceBuffer,
    desc: MatrixDescriptor,
    transposed: bool,
}

impl<'a> Matrix<'a> {
    /// Pair a buffer with a matrix descriptor.
    pub fn new(buffer: &'a DeviceBuffer, desc: MatrixDescriptor) -> Self {
        Self {
            buffer,
            desc,
            transposed: false,
        }
    }

    /// The descriptor this view was built from.
    pub fn descriptor(&self) -> MatrixDescriptor {
        self.desc
    }

    /// Flip whether the kernels read this matrix transposed. The
    /// descriptor keeps describing the stored layout; the dimension
    /// math accounts for the flip.
    pub fn toggle_transpose(&mut self) {
        self.transposed = !self.transposed;
    }
}

/// A buffer viewed as a vector for the duration of one call.
pub struct Vector<'a> {
    buffer: &'a DeviceBuffer,
    desc: VectorDescriptor,
}

impl<'a> Vector<'a> {
    /// Pair a buffer with a vector descriptor.
    pub fn new(buffer: &'a DeviceBuffer, desc: VectorDescriptor) -> Self {
        Self { buffer, desc }
    }

    /// The descriptor this view was built from.
    pub fn descriptor(&self) -> VectorDescriptor {
        self.desc
    }
}

/// Pipelines for the linear-algebra kernel set, built once at engine
/// construction.
#[derive(Debug)]
pub struct LinalgKernels {
    matmul: wgpu::ComputePipeline,
    matvecmul: wgpu::ComputePipeline,
    softmax: wgpu::ComputePipeline,
    softmax_inplace: wgpu::ComputePipeline,
}

impl LinalgKernels {
    /// Entry points compiled into this set, in build order.
    pub const ENTRY_POINTS: [&'static str; 4] =
        ["matmul", "matvecmul", "softmax", "softmax_inplace"];

    /// Build the pipeline set from a compiled kernel library.
    pub fn new(ctx: &GpuContext, library: &KernelLibrary) -> Result<Self, BackendError> {
        let [mm, mv, sm, smi] = Self::ENTRY_POINTS;
        Ok(Self {
            matmul: ctx.build_pipeline(library, mm)?,
            matvecmul: ctx.build_pipeline(library, mv)?,
            softmax: ctx.build_pipeline(library, sm)?,
            softmax_inplace: ctx.build_pipeline(library, smi)?,
        })
    }
}

fn dims_uniform(device: &wgpu::Device, dims: [u32; 4]) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("linalg dims"),
        contents: bytemuck::cast_slice(&dims),
        usage: wgpu::BufferUsages::UNIFORM,
    })
}

pub(crate) fn bind_entries<'a>(
    device: &wgpu::Device,
    pipeline: &wgpu::ComputePipeline,
    resources: &[wgpu::BindingResource<'a>],
) -> wgpu::BindGroup {
    let layout = pipeline.get_bind_group_layout(0);
    let entries: Vec<wgpu::BindGroupEntry> = resources
        .iter()
        .enumerate()
        .map(|(i, r)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: r.clone(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("linalg bind group"),
        layout: &layout,
        entries: &entries,
    })
}

pub(crate) fn workgroups_1d(size: u32) -> u32 {
    (size + 63) / 64
}

/// Record `c = op(a) * op(b)` against the command buffer.
///
/// Descriptors describe the stored layout; a transposed view of a
/// buffer stored `[k, m]` contributes `m` logical rows.
pub fn matmul(kernels: &LinalgKernels, cmd: &mut CommandBuffer, a: &Matrix, b: &Matrix, c: &Matrix) {
    let (m, k) = if a.transposed {
        (a.desc.cols as u32, a.desc.rows as u32)
    } else {
        (a.desc.rows as u32, a.desc.cols as u32)
    };
    let n = c.desc.cols as u32;
    let flags = (a.transposed as u32) | ((b.transposed as u32) << 1);

    let device = cmd.device();
    let dims = dims_uniform(device, [m, k, n, flags]);
    let bind = bind_entries(
        device,
        &kernels.matmul,
        &[
            a.buffer.raw().as_entire_binding(),
            b.buffer.raw().as_entire_binding(),
            c.buffer.raw().as_entire_binding(),
            dims.as_entire_binding(),
        ],
    );
    cmd.dispatch(&kernels.matmul, &bind, ((n + 15) / 16, (m + 15) / 16, 1));
}

/// Record `out = op(m) * v` against the command buffer.
pub fn matvecmul(
    kernels: &LinalgKernels,
    cmd: &mut CommandBuffer,
    m: &Matrix,
    v: &Vector,
    out: &Vector,
) {
    let rows = m.desc.rows as u32;
    let cols = m.desc.cols as u32;
    let flags = m.transposed as u32;

    let device = cmd.device();
    let dims = dims_uniform(device, [rows, cols, flags, 0]);
    let bind = bind_entries(
        device,
        &kernels.matvecmul,
        &[
            m.buffer.raw().as_entire_binding(),
            v.buffer.raw().as_entire_binding(),
            out.buffer.raw().as_entire_binding(),
            dims.as_entire_binding(),
        ],
    );
    cmd.dispatch(
        &kernels.matvecmul,
        &bind,
        (workgroups_1d(out.desc.len as u32), 1, 1),
    );
}

/// Record a softmax of `x` along `axis` into `out`.
pub fn softmax(
    kernels: &LinalgKernels,
    cmd: &mut CommandBuffer,
    x: &Matrix,
    out: &Matrix,
    axis: usize,
) {
    let rows = x.desc.rows as u32;
    let cols = x.desc.cols as u32;
    let slices = if axis == 0 { cols } else { rows };

    let device = cmd.device();
    let dims = dims_uniform(device, [rows, cols, axis as u32, 0]);
    let bind = bind_entries(
        device,
        &kernels.softmax,
        &[
            x.buffer.raw().as_entire_binding(),
            out.buffer.raw().as_entire_binding(),
            dims.as_entire_binding(),
        ],
    );
    cmd.dispatch(&kernels.softmax, &bind, (workgroups_1d(slices), 1, 1));
}

/// Record a softmax of `x` along `axis` into `x`'s own buffer.
pub fn softmax_inplace(kernels: &LinalgKernels, cmd: &mut CommandBuffer, x: &Matrix, axis: usize) {
    let rows = x.desc.rows as u32;
    let cols = x.desc.cols as u32;
    let slices = if axis == 0 { cols } else { rows };

    let device = cmd.device();
    let dims = dims_uniform(device, [rows, cols, axis as u32, 0]);
    let bind = bind_entries(
        device,
        &kernels.softmax_inplace,
        &[
            x.buffer.raw().as_entire_binding(),
            dims.as_entire_binding(),
        ],
    );
    cmd.dispatch(&kernels.softmax_inplace, &bind, (workgroups_1d(slices), 1, 1));
}
