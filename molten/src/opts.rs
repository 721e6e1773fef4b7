//! Function options controlling where an operation writes its result.

use crate::error::EngineError;
use crate::tensor::{Dtype, GpuTensor};

/// Whether an operation may alias its output onto an input buffer.
///
/// An explicit enum rather than a boolean so the aliasing hazard is
/// visible at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasMode {
    /// Never mutate an input: write into the reuse tensor or a freshly
    /// allocated buffer. The default.
    CopyOut,
    /// Overwrite the left-hand input's buffer in place and return that
    /// same tensor. Callers must serialize access to the buffer.
    InPlace,
}

/// A variadic option accepted by every engine operation.
#[derive(Debug, Clone)]
pub enum FuncOpt {
    /// Write the result into this pre-existing tensor instead of
    /// allocating a new one.
    Reuse(GpuTensor),
    /// Select the output aliasing policy.
    Alias(AliasMode),
    /// Accumulate into the destination instead of overwriting. Only
    /// honored by kernels that support accumulation; ignored (with a
    /// warning) elsewhere.
    Incr,
}

/// Options after resolution: last occurrence of each option wins.
#[derive(Debug)]
pub(crate) struct ResolvedOpts {
    pub reuse: Option<GpuTensor>,
    pub safe: bool,
    pub incr: bool,
}

impl ResolvedOpts {
    pub fn to_reuse(&self) -> bool {
        self.reuse.is_some()
    }
}

/// Resolve the option list and validate any reuse tensor against the
/// expected output shape and dtype. The reuse tensor is reshaped to
/// the expected shape before any device work.
pub(crate) fn handle_func_opts(
    expected_shape: &[usize],
    expected_dtype: Dtype,
    opts: &[FuncOpt],
) -> Result<ResolvedOpts, EngineError> {
    let mut resolved = ResolvedOpts {
        reuse: None,
        safe: true,
        incr: false,
    };
    for opt in opts {
        match opt {
            FuncOpt::Reuse(t) => resolved.reuse = Some(t.clone()),
            FuncOpt::Alias(AliasMode::CopyOut) => resolved.safe = true,
            FuncOpt::Alias(AliasMode::InPlace) => resolved.safe = false,
            FuncOpt::Incr => resolved.incr = true,
        }
    }

    if let Some(reuse) = resolved.reuse.as_mut() {
        if reuse.dtype() != expected_dtype {
            return Err(EngineError::Type(format!(
                "expected a {} reuse tensor, got {}",
                expected_dtype,
                reuse.dtype()
            )));
        }
        let expected_numel: usize = expected_shape.iter().product();
        if reuse.numel() != expected_numel {
            return Err(EngineError::Shape(format!(
                "reuse tensor has {} elements, expected shape {:?} needs {}",
                reuse.numel(),
                expected_shape,
                expected_numel
            )));
        }
        reuse.reshape(expected_shape)?;
    }
    Ok(resolved)
}
