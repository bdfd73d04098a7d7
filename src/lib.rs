//! # Scoria
//!
//! Staged buffer uploads and submission tracking for WebGPU-style devices.
//!
//! Scoria handles the unglamorous part of getting bytes onto the GPU: it
//! pools mapped staging buffers, records buffer-to-buffer copies into a
//! shared batch, and hands out completion tokens so both callers and the
//! pool itself know when the device is done with a piece of memory.
//!
//! ## Quick Start
//!
//! ```
//! use scoria::prelude::*;
//! use scoria::backend::noop;
//!
//! // The CPU backend runs the whole path without a GPU; swap in
//! // `backend::webgpu::create_context()` for a real adapter.
//! let (raw_device, raw_queue) = noop::context();
//! let device: Device<noop::Noop> = Device::new(raw_device);
//! let queue = Queue::new(device.clone(), raw_queue);
//!
//! let positions = Buffer::new(&device, 10, BufferUsages::VERTEX, Some("positions")).unwrap();
//! positions.update(&queue, 0, &[1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();
//! assert_eq!(queue.finish(), SubmissionStatus::Success);
//!
//! // Once per frame: pump completions and recycle staging buffers.
//! queue.maintain();
//! ```
//!
//! ## Overview
//!
//! ### Devices and Backends
//!
//! Everything is generic over a [`Backend`](hal::Backend), a small trait
//! family covering buffers, encoders, map requests, and submission. Two
//! implementations ship with the crate: [`backend::webgpu`] runs on a
//! [`wgpu`] device, and [`backend::noop`] executes copies in process memory
//! so tests never need an adapter. [`Device`] is the cheap-to-clone handle
//! the rest of the crate shares.
//!
//! ### Buffers and Uploads
//!
//! A [`Buffer`] is device-local memory with its size rounded up to
//! [`WRITE_ALIGNMENT`] and copy-destination usage always enabled.
//! [`Buffer::update`] stages the payload through a pooled, already-mapped
//! staging buffer and records the copy; the destination changes only when
//! the queue is flushed and the submission executes.
//!
//! ### The Queue and Submissions
//!
//! [`Queue`] owns one lazily created recording context. Copies accumulate
//! there until [`Queue::flush`] submits them as a batch, minting a
//! [`Submission`] token that resolves to success or error when the device
//! reports back. [`Queue::finish`] is the blocking variant. Completion is
//! pull-based: callbacks only arrive while the device is pumped, so call
//! [`Queue::maintain`] once per frame.
//!
//! ### The Staging Pool
//!
//! [`StagingPool`] keeps used staging buffers on a best-fit free list
//! instead of destroying them. A buffer returns to the free list only after
//! the submission that read from it succeeded and the buffer was remapped,
//! which makes writing into a pooled buffer race-free by construction.
//!
//! ### Synchronization
//!
//! [`Submission`] is a write-once tri-state token shared by everything
//! interested in one batch. [`Fence`] wraps one for callers that want a
//! plain wait handle with a timeout.
//!
//! ### Failure Policy
//!
//! Nothing in this crate retries. Synchronous allocation failures surface
//! as [`DeviceError`] at the call site. A failed submission resolves its
//! [`Submission`] to [`SubmissionStatus::Error`]; a failed staging map
//! drops the write with a warning and a bump of [`Queue::dropped_writes`],
//! leaving the destination unchanged. Staging buffers the pool gives up on
//! are counted in [`PoolStats::discarded`].

pub mod backend;
pub mod buffer;
pub mod device;
mod error;
pub mod hal;
pub mod queue;
pub mod staging;
pub mod sync;

pub use buffer::Buffer;
pub use device::{Device, HasDevice};
pub use error::{DeviceError, MapAccessError, MapError, SubmitError};
pub use hal::{BufferDesc, BufferUsages, Label};
pub use queue::Queue;
pub use staging::{PoolStats, StagingBuffer, StagingPool};
pub use sync::{Fence, Submission, SubmissionStatus, WaitResult};

pub use wgpu;

/// Alignment, in bytes, of everything that travels the upload path: buffer
/// capacities, staged lengths, and copy offsets.
///
/// Matches the copy alignment the underlying API enforces, so a rounded
/// write is always a legal copy.
pub const WRITE_ALIGNMENT: u64 = 4;

/// Rounds `size` up to the next multiple of [`WRITE_ALIGNMENT`].
pub const fn align_size(size: u64) -> u64 {
    (size + WRITE_ALIGNMENT - 1) & !(WRITE_ALIGNMENT - 1)
}

pub mod prelude {
    pub use crate::{
        wgpu, Buffer, BufferUsages, Device, Fence, HasDevice, Queue, StagingPool, Submission,
        SubmissionStatus, WaitResult, WRITE_ALIGNMENT,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_size_rounds_up() {
        assert_eq!(align_size(0), 0);
        assert_eq!(align_size(1), 4);
        assert_eq!(align_size(4), 4);
        assert_eq!(align_size(10), 12);
        assert_eq!(align_size(100), 100);
    }
}
