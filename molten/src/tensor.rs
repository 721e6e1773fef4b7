//! Tensor handles: logical shape + dtype + a device buffer reference.

use std::sync::Arc;

use molten_backend::DeviceBuffer;

use crate::error::EngineError;

/// Element type of a tensor.
///
/// The engine computes in `F32` only; `F16` tensors can be allocated
/// but any operation touching one fails with a type error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    /// 32-bit float. The only element type the kernels support.
    F32,
    /// 16-bit float. Allocatable, not computable.
    F16,
}

impl Dtype {
    /// Size of a single element in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            Dtype::F32 => 4,
            Dtype::F16 => 2,
        }
    }
}

impl Default for Dtype {
    fn default() -> Self {
        Dtype::F32
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::F32 => write!(f, "f32"),
            Dtype::F16 => write!(f, "f16"),
        }
    }
}

/// At most one dimension with extent greater than 1.
pub(crate) fn is_vector_like(shape: &[usize]) -> bool {
    shape.iter().filter(|&&d| d > 1).count() <= 1
}

/// A tensor handle the engine hands to and accepts from the host
/// tensor library.
///
/// Carries the logical shape, the element type and a shared reference
/// to the backing device buffer. Cloning a handle shares the buffer;
/// use [`GpuTensor::same_buffer`] to test identity.
#[derive(Clone)]
pub struct GpuTensor {
    pub(crate) buffer: Arc<DeviceBuffer>,
    shape: Vec<usize>,
    dtype: Dtype,
}

impl GpuTensor {
    pub(crate) fn new(buffer: Arc<DeviceBuffer>, shape: &[usize], dtype: Dtype) -> Self {
        Self {
            buffer,
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// The logical shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// The element type.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// The backing device buffer.
    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    /// Whether two handles share the same backing buffer.
    pub fn same_buffer(&self, other: &GpuTensor) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// At most one dimension with extent greater than 1.
    pub fn is_vector_like(&self) -> bool {
        is_vector_like(&self.shape)
    }

    /// Change the logical shape without touching the buffer. The total
    /// element count must be preserved.
    pub fn reshape(&mut self, shape: &[usize]) -> Result<(), EngineError> {
        let new_numel: usize = shape.iter().product();
        if new_numel != self.numel() {
            return Err(EngineError::Shape(format!(
                "cannot reshape {:?} ({} elements) into {:?} ({} elements)",
                self.shape,
                self.numel(),
                shape,
                new_numel
            )));
        }
        self.shape = shape.to_vec();
        Ok(())
    }
}

impl std::fmt::Debug for GpuTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuTensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("bytes", &self.buffer.byte_len())
            .finish()
    }
}
