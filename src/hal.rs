//! Backend abstraction over the underlying graphics API.
//!
//! The upload and synchronization machinery in this crate only needs a narrow
//! slice of a WebGPU-style device: buffer creation, asynchronous write-maps,
//! mapped-range access, command encoding of buffer-to-buffer copies, queue
//! submission with a work-done callback, and an event pump. This module
//! declares that slice as a family of traits tied together by [`Backend`],
//! in the same shape `wgpu-hal` ties its backends to an `Api` type.
//!
//! # Key Types
//!
//! - [`Backend`]: associates the concrete device, queue, encoder, buffer and
//!   command-batch types of one binding.
//! - [`Device`], [`Queue`], [`Encoder`]: the operations consumed by the crate.
//! - [`BufferDesc`] and [`BufferUsages`]: WebGPU-shaped buffer descriptors.
//!
//! Two backends ship with the crate: [`crate::backend::webgpu`] (the `wgpu`
//! binding, for real hardware) and [`crate::backend::noop`] (a CPU backend
//! that executes copies in memory, used by the test suite and runnable
//! examples).
//!
//! # Callback delivery
//!
//! Map and work-done callbacks fire while the owning thread pumps
//! [`Device::poll`]; a backend may also deliver a map callback inline from
//! [`Device::map_async`] when the request can complete immediately. Callbacks
//! may call back into the crate, so implementations must not hold internal
//! locks while invoking them.

use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{DeviceError, MapAccessError, MapError, SubmitError};

/// Object label for debugging and log lines.
pub type Label<'a> = Option<&'a str>;

/// Completion callback for an asynchronous buffer map request.
pub type MapCallback = Box<dyn FnOnce(Result<(), MapError>) + Send + 'static>;

/// Completion callback for a submitted command batch.
pub type SubmitCallback = Box<dyn FnOnce(Result<(), SubmitError>) + Send + 'static>;

bitflags! {
    /// Usage flags describing how a buffer may be bound and accessed.
    ///
    /// Bit-compatible with WebGPU's `GPUBufferUsage`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsages: u32 {
        /// The buffer can be mapped for reading.
        const MAP_READ = 1 << 0;
        /// The buffer can be mapped for writing.
        const MAP_WRITE = 1 << 1;
        /// The buffer can be the source of a copy command.
        const COPY_SRC = 1 << 2;
        /// The buffer can be the destination of a copy command.
        const COPY_DST = 1 << 3;
        /// The buffer can be bound as an index buffer.
        const INDEX = 1 << 4;
        /// The buffer can be bound as a vertex buffer.
        const VERTEX = 1 << 5;
        /// The buffer can be bound as a uniform buffer.
        const UNIFORM = 1 << 6;
        /// The buffer can be bound as a storage buffer.
        const STORAGE = 1 << 7;
        /// The buffer can back indirect draw or dispatch arguments.
        const INDIRECT = 1 << 8;
    }
}

/// Creation parameters for a device buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    /// Debug label, forwarded to the binding where supported.
    pub label: Label<'a>,
    /// Size in bytes.
    pub size: u64,
    /// Allowed usages.
    pub usage: BufferUsages,
    /// When set, the buffer starts out mapped for writing, skipping the
    /// asynchronous map round-trip for its first use. Bindings require the
    /// size of such buffers to be a multiple of [`crate::WRITE_ALIGNMENT`].
    pub mapped_at_creation: bool,
}

/// Ties together the concrete types of one graphics binding.
pub trait Backend: Sized + Send + Sync + 'static {
    /// Device handle, used for resource creation and event pumping.
    type Device: Device<Self>;
    /// Queue handle, used for submission.
    type Queue: Queue<Self>;
    /// Open command encoder.
    type Encoder: Encoder<Self>;
    /// Buffer handle. Shared through [`Arc`] by the crate.
    type Buffer: std::fmt::Debug + Send + Sync + 'static;
    /// A finished, submittable batch of commands.
    type CommandBatch: Send + 'static;
}

/// Device-level operations of a backend.
pub trait Device<B: Backend>: Send + Sync + 'static {
    /// Creates a buffer.
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<B::Buffer, DeviceError>;

    /// Opens a new command encoder.
    fn create_encoder(&self, label: Label<'_>) -> B::Encoder;

    /// Requests that `buffer` be mapped for writing in its entirety.
    ///
    /// The callback fires once the request resolves, either inline or during
    /// a later [`poll`](Self::poll). The buffer must not currently be mapped.
    fn map_async(&self, buffer: &Arc<B::Buffer>, callback: MapCallback);

    /// Runs `write` over the first `len` bytes of the buffer's mapped range.
    ///
    /// The buffer must have been mapped (at creation or via
    /// [`map_async`](Self::map_async)). Returns [`MapAccessError`] when the
    /// mapped range cannot be produced; callers are expected to fall back to
    /// an asynchronous remap.
    fn with_mapped_mut(
        &self,
        buffer: &B::Buffer,
        len: u64,
        write: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), MapAccessError>;

    /// Unmaps a mapped buffer, making it usable by the device again.
    fn unmap(&self, buffer: &B::Buffer);

    /// Pumps the binding's event loop once, delivering any completed map and
    /// work-done callbacks. Never blocks.
    fn poll(&self);
}

/// Queue-level operations of a backend.
pub trait Queue<B: Backend>: Send + Sync + 'static {
    /// Submits one finished batch and registers its completion callback.
    ///
    /// Batches submitted to the same queue start, and for the bindings this
    /// crate targets also finish, in submission order.
    fn submit(&self, batch: B::CommandBatch, on_complete: SubmitCallback);
}

/// Recording operations on an open command encoder.
pub trait Encoder<B: Backend>: Send + 'static {
    /// Records a buffer-to-buffer copy.
    ///
    /// Offsets and size must satisfy the binding's copy alignment
    /// ([`crate::WRITE_ALIGNMENT`]); neither buffer may be mapped when the
    /// containing batch is submitted.
    fn copy_buffer_to_buffer(
        &mut self,
        src: &Arc<B::Buffer>,
        src_offset: u64,
        dst: &Arc<B::Buffer>,
        dst_offset: u64,
        size: u64,
    );

    /// Finishes recording, producing a submittable batch.
    fn finish(self) -> B::CommandBatch;
}
