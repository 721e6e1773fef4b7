//! The command submission pipeline.
//!
//! A [`CommandQueue`] issues [`CommandBuffer`]s; a command buffer is a
//! short-lived, single-use unit of work that moves forward-only through
//! `Created -> Enqueued -> Committed -> Completed`. Commit consumes the
//! buffer, so reuse after commit does not typecheck.

use std::sync::Arc;

use crate::{BackendError, DeviceBuffer, GpuContext};

/// Lifecycle states of a command buffer.
///
/// `Committed` and `Completed` are listed for documentation; they are
/// unobservable from outside because [`CommandBuffer::commit_and_wait`]
/// consumes the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Freshly issued; accepting recorded work.
    Created,
    /// Marked as intending to run; still accepting recorded work.
    Enqueued,
    /// Submitted to the device.
    Committed,
    /// The device signalled completion.
    Completed,
}

/// Stateless issuer of command buffers. One per engine instance.
///
/// Buffers issued by the same queue from the same thread execute in
/// enqueue order; no ordering holds across distinct queues.
#[derive(Debug)]
pub struct CommandQueue {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
}

impl CommandQueue {
    /// Create a queue over the context's device.
    pub fn new(ctx: &GpuContext) -> Self {
        Self {
            device: Arc::clone(&ctx.device),
            queue: Arc::clone(&ctx.queue),
        }
    }

    /// Issue a fresh command buffer in the `Created` state.
    pub fn command_buffer(&self, label: &str) -> CommandBuffer {
        let encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        CommandBuffer {
            device: Arc::clone(&self.device),
            queue: Arc::clone(&self.queue),
            encoder,
            state: CommandState::Created,
        }
    }
}

/// A single-use unit of GPU work.
pub struct CommandBuffer {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    encoder: wgpu::CommandEncoder,
    state: CommandState,
}

impl CommandBuffer {
    /// Current lifecycle state.
    pub fn state(&self) -> CommandState {
        self.state
    }

    /// The device this buffer records against, for building bind groups
    /// and parameter buffers at record time.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Mark intent to run without blocking.
    pub fn enqueue(&mut self) {
        if self.state == CommandState::Created {
            self.state = CommandState::Enqueued;
        }
    }

    /// Record one kernel dispatch: pipeline state, argument bindings
    /// and thread-grid size.
    pub fn dispatch(
        &mut self,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        workgroups: (u32, u32, u32),
    ) {
        let mut pass = self
            .encoder
            .begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: None,
                timestamp_writes: None,
            });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(workgroups.0, workgroups.1, workgroups.2);
    }

    /// Record a device-side buffer copy. Sizes must match.
    pub fn copy_buffer(
        &mut self,
        dst: &DeviceBuffer,
        src: &DeviceBuffer,
    ) -> Result<(), BackendError> {
        if dst.byte_len() != src.byte_len() {
            return Err(BackendError::SizeMismatch {
                dst: dst.byte_len(),
                src: src.byte_len(),
            });
        }
        self.encoder
            .copy_buffer_to_buffer(src.raw(), 0, dst.raw(), 0, src.byte_len());
        Ok(())
    }

    /// Record zeroing a buffer.
    pub fn clear_buffer(&mut self, buf: &DeviceBuffer) {
        self.encoder.clear_buffer(buf.raw(), 0, None);
    }

    /// Submit to the device and block the calling thread until the
    /// device signals completion.
    ///
    /// The one suspension point of an engine operation. Any submission
    /// fault is non-recoverable for the call and surfaces as
    /// [`BackendError::Submission`].
    pub fn commit_and_wait(mut self) -> Result<(), BackendError> {
        self.state = CommandState::Committed;
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.queue.submit(std::iter::once(self.encoder.finish()));
        let _ = self.device.poll(wgpu::Maintain::Wait);
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Submission(e.to_string()));
        }
        self.state = CommandState::Completed;
        Ok(())
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("state", &self.state)
            .finish()
    }
}
