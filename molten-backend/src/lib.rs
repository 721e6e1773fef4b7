//! Low-level GPU plumbing for the molten compute engine.
//!
//! This crate owns the wgpu instance/adapter/device/queue, the buffer
//! memory bridge between host and device address spaces, and the
//! command submission pipeline. The higher-level dispatch logic lives
//! in the `molten` crate.

use std::sync::Arc;

use thiserror::Error;
use wgpu::{Adapter, Device, Instance, Queue};

pub use wgpu; // Re-export wgpu for downstream crates

pub mod buffer;
pub mod command;

pub use buffer::DeviceBuffer;
pub use command::{CommandBuffer, CommandQueue, CommandState};

/// Errors raised by the device, buffer and submission layer.
#[derive(Error, Debug)]
pub enum BackendError {
    /// No compute-capable adapter was found. Fatal to any engine caller.
    #[error("no compute-capable device found")]
    DeviceUnavailable,
    /// The adapter refused to hand out a logical device.
    #[error("device request failed: {0}")]
    RequestDevice(String),
    /// Kernel source failed to compile into a library.
    #[error("kernel library failed to compile: {0}")]
    Compile(String),
    /// A named kernel function is missing from the compiled library.
    #[error("kernel function `{0}` not found in library")]
    FunctionNotFound(String),
    /// Pipeline construction for a kernel function failed.
    #[error("pipeline build failed for `{name}`: {message}")]
    PipelineBuild {
        /// Entry point the pipeline was built for.
        name: String,
        /// Device-reported failure message.
        message: String,
    },
    /// The device could not satisfy an allocation.
    #[error("device allocation of {bytes} bytes failed")]
    Allocation {
        /// Requested size in bytes.
        bytes: u64,
    },
    /// The device rejected or faulted during command execution.
    #[error("command submission failed: {0}")]
    Submission(String),
    /// Byte sizes of two memory regions did not match for a copy.
    #[error("buffer size mismatch: dst is {dst} bytes, src is {src} bytes")]
    SizeMismatch {
        /// Destination size in bytes.
        dst: u64,
        /// Source size in bytes.
        src: u64,
    },
    /// Mapping a staging buffer for host readback failed.
    #[error("buffer map failed: {0}")]
    Map(String),
}

/// Static capability facts about the discovered device.
#[derive(Debug, Clone)]
pub struct DeviceCaps {
    /// Human-readable adapter name.
    pub name: String,
    /// True when the adapter is a software/CPU fallback with no display.
    pub headless: bool,
    /// True for integrated (low-power) GPUs.
    pub low_power: bool,
    /// True for hot-pluggable external devices. wgpu does not expose
    /// removability, so this is always false on this backend.
    pub removable: bool,
    /// Stable numeric identity derived from the vendor/device ids.
    pub registry_id: u64,
}

/// Owns the wgpu handles for one discovered device.
///
/// Created once per process and shared by `Arc` reference; every other
/// resource in the workspace holds a non-owning view of it.
#[derive(Debug)]
pub struct GpuContext {
    instance: Instance,
    adapter: Adapter,
    pub device: Arc<Device>,
    pub queue: Arc<Queue>,
    caps: DeviceCaps,
}

impl GpuContext {
    /// Discover the default high-performance adapter and open a device.
    pub async fn discover() -> Result<Self, BackendError> {
        let instance = Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or(BackendError::DeviceUnavailable)?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("molten device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| BackendError::RequestDevice(e.to_string()))?;

        let info = adapter.get_info();
        let caps = DeviceCaps {
            name: info.name.clone(),
            headless: info.device_type == wgpu::DeviceType::Cpu,
            low_power: info.device_type == wgpu::DeviceType::IntegratedGpu,
            removable: false,
            registry_id: ((info.vendor as u64) << 32) | info.device as u64,
        };
        log::info!("discovered device {} ({:?})", caps.name, info.backend);

        Ok(Self {
            instance,
            adapter,
            device: Arc::new(device),
            queue: Arc::new(queue),
            caps,
        })
    }

    /// Blocking wrapper around [`GpuContext::discover`].
    pub fn discover_blocking() -> Result<Self, BackendError> {
        pollster::block_on(Self::discover())
    }

    /// Static capability facts for the discovered device.
    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// One-line adapter summary for logs.
    pub fn adapter_summary(&self) -> String {
        let info = self.adapter.get_info();
        format!("{} ({:?})", info.name, info.backend)
    }

    /// Compile kernel source text into a library of functions.
    ///
    /// Compilation failure is fatal to engine construction and is not
    /// retried.
    pub fn compile_library(&self, source: &str) -> Result<KernelLibrary, BackendError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("molten kernels"),
            source: wgpu::ShaderSource::Wgsl(std::borrow::Cow::Borrowed(source)),
        });
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Compile(e.to_string()));
        }
        Ok(KernelLibrary { module })
    }

    /// Build a compute pipeline for a named entry point of a library.
    pub fn build_pipeline(
        &self,
        library: &KernelLibrary,
        entry: &str,
    ) -> Result<wgpu::ComputePipeline, BackendError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: None,
                module: &library.module,
                entry_point: entry,
                compilation_options: Default::default(),
                cache: None,
            });
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            let message = e.to_string();
            if message.contains("entry point") {
                return Err(BackendError::FunctionNotFound(entry.to_string()));
            }
            return Err(BackendError::PipelineBuild {
                name: entry.to_string(),
                message,
            });
        }
        Ok(pipeline)
    }
}

/// A compiled collection of kernel functions, looked up by entry point.
#[derive(Debug)]
pub struct KernelLibrary {
    module: wgpu::ShaderModule,
}
