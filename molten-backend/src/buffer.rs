//! The buffer memory bridge between host and device address spaces.
//!
//! A [`DeviceBuffer`] is an owning, non-clonable handle to a region of
//! device-visible memory. Tensors carry a raw (buffer, byte size) pair
//! rather than a typed handle so the same buffer type can back either a
//! fresh GPU allocation or a device mirror of host memory; the engine
//! never assumes which.

use wgpu::util::DeviceExt;

use crate::{BackendError, GpuContext};

const STORAGE_USAGES: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

/// An addressable region of device-visible memory plus its byte size.
///
/// Owning handle: it is deliberately not `Clone`. Share it behind an
/// `Arc` and release it exactly once via [`GpuContext::free`].
#[derive(Debug)]
pub struct DeviceBuffer {
    raw: wgpu::Buffer,
    len: u64,
}

impl DeviceBuffer {
    /// Size of the region in bytes. Never changes after construction.
    pub fn byte_len(&self) -> u64 {
        self.len
    }

    /// The underlying wgpu buffer, for binding into dispatches.
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.raw
    }
}

impl GpuContext {
    /// Reserve uninitialized device memory of the given size.
    pub fn alloc(&self, byte_len: u64) -> Result<DeviceBuffer, BackendError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let raw = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("molten buffer"),
            size: byte_len,
            usage: STORAGE_USAGES,
            mapped_at_creation: false,
        });
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(BackendError::Allocation { bytes: byte_len });
        }
        Ok(DeviceBuffer { raw, len: byte_len })
    }

    /// Copy a host memory region into a new device buffer.
    ///
    /// The host region only needs to stay valid for the duration of
    /// this call.
    pub fn buffer_from_host(&self, bytes: &[u8]) -> Result<DeviceBuffer, BackendError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let raw = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("molten host-sourced buffer"),
                contents: bytes,
                usage: STORAGE_USAGES,
            });
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(BackendError::Allocation {
                bytes: bytes.len() as u64,
            });
        }
        Ok(DeviceBuffer {
            raw,
            len: bytes.len() as u64,
        })
    }

    /// Overwrite a buffer's contents from host memory. Sizes must match.
    pub fn write_host(&self, buf: &DeviceBuffer, bytes: &[u8]) -> Result<(), BackendError> {
        if buf.byte_len() != bytes.len() as u64 {
            return Err(BackendError::SizeMismatch {
                dst: buf.byte_len(),
                src: bytes.len() as u64,
            });
        }
        self.queue.write_buffer(buf.raw(), 0, bytes);
        Ok(())
    }

    /// Copy a buffer's contents back to host memory.
    ///
    /// Synchronous: blocks until the device-to-host copy completes.
    /// This is the only way host code observes GPU-computed results.
    pub fn read_back(&self, buf: &DeviceBuffer) -> Result<Vec<u8>, BackendError> {
        let size = buf.byte_len();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("molten staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("molten readback"),
            });
        encoder.copy_buffer_to_buffer(buf.raw(), 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Submission(e.to_string()));
        }

        let slice = staging.slice(..);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        match pollster::block_on(rx.receive()) {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(BackendError::Map(e.to_string())),
            None => return Err(BackendError::Map("map callback dropped".into())),
        }

        let data = slice.get_mapped_range();
        let bytes = data.to_vec();
        drop(data);
        staging.unmap();
        Ok(bytes)
    }

    /// Byte-for-byte device-side copy. Sizes must match exactly.
    pub fn copy(&self, dst: &DeviceBuffer, src: &DeviceBuffer) -> Result<(), BackendError> {
        if dst.byte_len() != src.byte_len() {
            return Err(BackendError::SizeMismatch {
                dst: dst.byte_len(),
                src: src.byte_len(),
            });
        }
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("molten copy"),
            });
        encoder.copy_buffer_to_buffer(src.raw(), 0, dst.raw(), 0, src.byte_len());
        self.queue.submit(std::iter::once(encoder.finish()));
        let _ = self.device.poll(wgpu::Maintain::Wait);
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Submission(e.to_string()));
        }
        Ok(())
    }

    /// Release a buffer, invalidating its device memory.
    ///
    /// Consumes the handle, so a second release of the same buffer does
    /// not typecheck. Shared (`Arc`) views that outlive the release see
    /// submission errors, never stale data.
    pub fn free(&self, buf: DeviceBuffer) {
        buf.raw.destroy();
    }

    /// Invalidate a buffer that is still referenced elsewhere.
    ///
    /// Any later submission touching the buffer fails; intended for
    /// callers that manage sharing themselves.
    pub fn free_shared(&self, buf: &DeviceBuffer) {
        buf.raw.destroy();
    }
}
