//! wgpu backend.
//!
//! Maps the [`hal`](crate::hal) traits directly onto [`wgpu`]'s types: the
//! device is a [`wgpu::Device`], batches are [`wgpu::CommandBuffer`]s, and
//! polling forwards to [`wgpu::Device::poll`].
//!
//! Two reporting gaps of the underlying API are worth knowing about:
//!
//! - Buffer creation does not fail through a return value. wgpu reports
//!   exhaustion through its own error machinery, so
//!   [`create_buffer`](crate::hal::Device::create_buffer) always returns
//!   `Ok` here.
//! - Work-done callbacks carry no status. Submissions resolve to success
//!   when the device reports them done; a lost device shows up as callbacks
//!   that never arrive, not as an error resolution.

use std::sync::Arc;

use thiserror::Error;

use crate::device::Device;
use crate::error::{DeviceError, MapAccessError, MapError};
use crate::hal::{self, Backend, BufferDesc, BufferUsages, Label, MapCallback, SubmitCallback};
use crate::queue::Queue;
use crate::WRITE_ALIGNMENT;

// Staged sizes are rounded with WRITE_ALIGNMENT; wgpu enforces the same
// alignment for copy sizes and offsets.
const _: () = assert!(WRITE_ALIGNMENT == wgpu::COPY_BUFFER_ALIGNMENT);

/// The wgpu backend.
#[derive(Debug, Clone, Copy)]
pub struct WebGpu;

impl Backend for WebGpu {
    type Device = wgpu::Device;
    type Queue = wgpu::Queue;
    type Encoder = wgpu::CommandEncoder;
    type Buffer = wgpu::Buffer;
    type CommandBatch = wgpu::CommandBuffer;
}

fn map_usages(usage: BufferUsages) -> wgpu::BufferUsages {
    let pairs = [
        (BufferUsages::MAP_READ, wgpu::BufferUsages::MAP_READ),
        (BufferUsages::MAP_WRITE, wgpu::BufferUsages::MAP_WRITE),
        (BufferUsages::COPY_SRC, wgpu::BufferUsages::COPY_SRC),
        (BufferUsages::COPY_DST, wgpu::BufferUsages::COPY_DST),
        (BufferUsages::INDEX, wgpu::BufferUsages::INDEX),
        (BufferUsages::VERTEX, wgpu::BufferUsages::VERTEX),
        (BufferUsages::UNIFORM, wgpu::BufferUsages::UNIFORM),
        (BufferUsages::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsages::INDIRECT, wgpu::BufferUsages::INDIRECT),
    ];
    let mut out = wgpu::BufferUsages::empty();
    for (ours, theirs) in pairs {
        if usage.contains(ours) {
            out |= theirs;
        }
    }
    out
}

impl hal::Device<WebGpu> for wgpu::Device {
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<wgpu::Buffer, DeviceError> {
        Ok(wgpu::Device::create_buffer(
            self,
            &wgpu::BufferDescriptor {
                label: desc.label,
                size: desc.size,
                usage: map_usages(desc.usage),
                mapped_at_creation: desc.mapped_at_creation,
            },
        ))
    }

    fn create_encoder(&self, label: Label<'_>) -> wgpu::CommandEncoder {
        wgpu::Device::create_command_encoder(self, &wgpu::CommandEncoderDescriptor { label })
    }

    fn map_async(&self, buffer: &Arc<wgpu::Buffer>, callback: MapCallback) {
        buffer.slice(..).map_async(wgpu::MapMode::Write, move |result| {
            callback(result.map_err(|_| MapError::Failed));
        });
    }

    fn with_mapped_mut(
        &self,
        buffer: &wgpu::Buffer,
        len: u64,
        write: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), MapAccessError> {
        // wgpu validates mapping itself and panics on misuse; the
        // unavailable-range case does not arise on this backend.
        let slice = buffer.slice(0..len);
        let mut view = slice.get_mapped_range_mut();
        write(&mut view[..]);
        Ok(())
    }

    fn unmap(&self, buffer: &wgpu::Buffer) {
        wgpu::Buffer::unmap(buffer);
    }

    fn poll(&self) {
        let _ = wgpu::Device::poll(self, wgpu::Maintain::Poll);
    }
}

impl hal::Queue<WebGpu> for wgpu::Queue {
    fn submit(&self, batch: wgpu::CommandBuffer, on_complete: SubmitCallback) {
        wgpu::Queue::submit(self, std::iter::once(batch));
        self.on_submitted_work_done(move || on_complete(Ok(())));
    }
}

impl hal::Encoder<WebGpu> for wgpu::CommandEncoder {
    fn copy_buffer_to_buffer(
        &mut self,
        src: &Arc<wgpu::Buffer>,
        src_offset: u64,
        dst: &Arc<wgpu::Buffer>,
        dst_offset: u64,
        size: u64,
    ) {
        wgpu::CommandEncoder::copy_buffer_to_buffer(self, src, src_offset, dst, dst_offset, size);
    }

    fn finish(self) -> wgpu::CommandBuffer {
        wgpu::CommandEncoder::finish(self)
    }
}

/// Failure to bring up a wgpu device.
#[derive(Debug, Error)]
pub enum ContextError {
    /// No adapter on the system satisfied the default selection options.
    #[error("no suitable graphics adapter found")]
    NoAdapter,
    /// The adapter refused the device request.
    #[error(transparent)]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

/// Creates a device and queue pair on the system's default adapter.
///
/// Blocks on the underlying async requests. For non-default instance or
/// adapter selection, bring up wgpu yourself and wrap the results with
/// [`Device::new`] and [`Queue::new`].
///
/// # Errors
///
/// Returns [`ContextError`] when no adapter is available or the device
/// request is refused.
pub fn create_context() -> Result<(Device<WebGpu>, Queue<WebGpu>), ContextError> {
    pollster::block_on(async {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .ok_or(ContextError::NoAdapter)?;
        let info = adapter.get_info();
        tracing::info!(name = %info.name, backend = ?info.backend, "selected adapter");

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("scoria device"),
                    ..Default::default()
                },
                None,
            )
            .await?;
        let device = Device::new(device);
        let queue = Queue::new(device.clone(), queue);
        Ok((device, queue))
    })
}
