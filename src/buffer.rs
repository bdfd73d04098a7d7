//! Device-local buffers with staged uploads.
//!
//! This module provides the [`Buffer`] type: device memory whose contents are
//! written by staging through the pool rather than mapped directly.
//!
//! # Overview
//!
//! A buffer's capacity is its requested size rounded up to
//! [`WRITE_ALIGNMENT`], and every buffer can be a copy destination whether or
//! not the caller asked for it. [`Buffer::update`] writes bytes at an aligned
//! offset by borrowing a mapped staging buffer, copying the payload in,
//! zero-filling the alignment pad, and recording a staging-to-buffer copy
//! into the queue's open recording context. The destination's memory only
//! changes when that context is flushed and the submission executes.
//!
//! # Quick Start
//!
//! ```
//! # use scoria::backend::noop;
//! # use scoria::{Buffer, BufferUsages, Device, Queue, SubmissionStatus};
//! let (raw_device, raw_queue) = noop::context();
//! let device: Device<noop::Noop> = Device::new(raw_device);
//! let queue = Queue::new(device.clone(), raw_queue);
//!
//! let positions = Buffer::new(&device, 10, BufferUsages::VERTEX, Some("positions")).unwrap();
//! assert_eq!(positions.capacity(), 12);
//!
//! positions.update(&queue, 0, &[1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();
//! assert_eq!(queue.finish(), SubmissionStatus::Success);
//! ```

use std::sync::Arc;

use crate::align_size;
use crate::device::{Device, HasDevice};
use crate::error::DeviceError;
use crate::hal::{Backend, BufferDesc, BufferUsages, Label};
use crate::queue::Queue;
use crate::staging::StagingBuffer;
use crate::WRITE_ALIGNMENT;

/// A device-local buffer written through staged uploads.
pub struct Buffer<B: Backend> {
    device: Device<B>,
    raw: Arc<B::Buffer>,
    capacity: u64,
    usage: BufferUsages,
    label: Option<String>,
}

impl<B: Backend> Clone for Buffer<B> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            raw: self.raw.clone(),
            capacity: self.capacity,
            usage: self.usage,
            label: self.label.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Buffer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("label", &self.label)
            .field("capacity", &self.capacity)
            .field("usage", &self.usage)
            .finish()
    }
}

impl<B: Backend> Buffer<B> {
    /// Creates a buffer of at least `size` bytes.
    ///
    /// The actual capacity is `size` rounded up to [`WRITE_ALIGNMENT`].
    /// [`BufferUsages::COPY_DST`] is added to `usage` unconditionally so the
    /// buffer can receive staged uploads.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] when the device cannot satisfy the allocation.
    pub fn new(
        device: &Device<B>,
        size: u64,
        usage: BufferUsages,
        label: Label<'_>,
    ) -> Result<Self, DeviceError> {
        assert!(size > 0, "buffers have nonzero size");
        let capacity = align_size(size);
        let usage = usage | BufferUsages::COPY_DST;
        let raw = device.create_buffer(&BufferDesc {
            label,
            size: capacity,
            usage,
            mapped_at_creation: false,
        })?;
        tracing::debug!(
            label = label.unwrap_or("<unlabeled>"),
            capacity,
            requested = size,
            "created buffer"
        );
        Ok(Self {
            device: device.clone(),
            raw: Arc::new(raw),
            capacity,
            usage,
            label: label.map(str::to_owned),
        })
    }

    /// Returns the backend buffer.
    pub fn raw(&self) -> &Arc<B::Buffer> {
        &self.raw
    }

    /// Returns the buffer's capacity in bytes, always a multiple of
    /// [`WRITE_ALIGNMENT`].
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the buffer's usage flags, including the implied
    /// [`BufferUsages::COPY_DST`].
    pub fn usage(&self) -> BufferUsages {
        self.usage
    }

    /// Returns the buffer's debug label.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Schedules `data` to be written at `offset`.
    ///
    /// The payload lands in a pooled staging buffer immediately; the copy to
    /// this buffer is recorded into `queue`'s open recording context and only
    /// executes once the queue is flushed. The staged length is `data.len()`
    /// rounded up to [`WRITE_ALIGNMENT`], with the pad bytes zero-filled, so
    /// the device sees `[offset, offset + padded)` overwritten. The padded
    /// range never extends past the buffer's capacity.
    ///
    /// Work already recorded that reads this buffer's old contents must be
    /// flushed before calling this, or the copy is ordered ahead of it inside
    /// the same batch.
    ///
    /// An empty `data` is a no-op and does not open a recording context.
    ///
    /// # Panics
    ///
    /// Panics if `queue` belongs to a different device, if `offset` is not
    /// [`WRITE_ALIGNMENT`]-aligned, or if `offset + data.len()` exceeds the
    /// buffer's capacity.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] when no staging buffer could be obtained. A
    /// failure on the asynchronous remap path is not surfaced here: the write
    /// is dropped, logged, and counted in [`Queue::dropped_writes`], and the
    /// destination keeps its prior contents.
    pub fn update(&self, queue: &Queue<B>, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        assert!(
            queue.device() == &self.device,
            "buffer and queue belong to different devices"
        );
        assert!(
            offset % WRITE_ALIGNMENT == 0,
            "write offsets are aligned to WRITE_ALIGNMENT"
        );
        assert!(
            offset.checked_add(data.len() as u64).is_some_and(|end| end <= self.capacity),
            "write ends past the buffer's capacity"
        );
        if data.is_empty() {
            tracing::trace!(label = self.label(), "empty update skipped");
            return Ok(());
        }

        // Capacity and offset are both aligned, so the padded length still
        // fits below capacity.
        let padded = align_size(data.len() as u64);
        let staging = queue.staging().acquire_pending(padded)?;

        // Free-list buffers are already mapped, so the common case writes
        // straight through without waiting on the device.
        let direct = self.device.with_mapped_mut(staging.raw(), padded, &mut |bytes| {
            bytes[..data.len()].copy_from_slice(data);
            bytes[data.len()..].fill(0);
        });
        match direct {
            Ok(()) => {
                staging.set_mapped(false);
                self.device.unmap(staging.raw());
                queue.record_copy(&staging, 0, &self.raw, offset, padded);
                Ok(())
            }
            Err(err) => {
                // The mapped range can be unavailable even for a nominally
                // mapped buffer. Fall back to a fresh asynchronous map and
                // finish the write when it settles.
                tracing::debug!(
                    label = self.label(),
                    %err,
                    "mapped range unavailable, retrying through an async map"
                );
                staging.set_mapped(false);
                self.device.unmap(staging.raw());
                let pending = PendingWrite {
                    data: data.to_vec(),
                    padded,
                    dst: self.raw.clone(),
                    dst_offset: offset,
                    staging: staging.clone(),
                    queue: queue.clone(),
                };
                let device = self.device.clone();
                let raw = staging.raw().clone();
                self.device
                    .map_async(&raw, Box::new(move |result| pending.complete(&device, result)));
                Ok(())
            }
        }
    }

    /// Schedules a typed slice to be written at `offset`.
    ///
    /// See [`update`](Self::update) for the staging and ordering behavior.
    pub fn update_slice<T: bytemuck::NoUninit>(
        &self,
        queue: &Queue<B>,
        offset: u64,
        data: &[T],
    ) -> Result<(), DeviceError> {
        self.update(queue, offset, bytemuck::cast_slice(data))
    }
}

impl<B: Backend> HasDevice<B> for Buffer<B> {
    fn device(&self) -> &Device<B> {
        &self.device
    }
}

/// An update whose staging buffer was not writable at call time.
///
/// Holds everything needed to finish the write once the fallback map request
/// settles: the payload itself, the staged length, and the copy's
/// destination. Consumed exactly once by the map callback.
struct PendingWrite<B: Backend> {
    data: Vec<u8>,
    padded: u64,
    dst: Arc<B::Buffer>,
    dst_offset: u64,
    staging: Arc<StagingBuffer<B>>,
    queue: Queue<B>,
}

impl<B: Backend> PendingWrite<B> {
    fn complete(self, device: &Device<B>, result: Result<(), crate::error::MapError>) {
        let Self {
            data,
            padded,
            dst,
            dst_offset,
            staging,
            queue,
        } = self;

        if let Err(err) = result {
            tracing::warn!(%err, "staging map failed, dropping the write");
            queue.note_dropped_write();
            queue.staging().release(&staging);
            return;
        }
        staging.set_mapped(true);

        let written = device.with_mapped_mut(staging.raw(), padded, &mut |bytes| {
            bytes[..data.len()].copy_from_slice(&data);
            bytes[data.len()..].fill(0);
        });
        match written {
            Ok(()) => {
                staging.set_mapped(false);
                device.unmap(staging.raw());
                queue.record_copy(&staging, 0, &dst, dst_offset, padded);
            }
            Err(err) => {
                // Mapped again yet still no range. Give up rather than loop.
                tracing::warn!(%err, "mapped range unavailable after remap, dropping the write");
                staging.set_mapped(false);
                device.unmap(staging.raw());
                queue.note_dropped_write();
                queue.staging().release(&staging);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::noop::{self, Noop};
    use crate::sync::SubmissionStatus;

    fn test_context() -> (Device<Noop>, Queue<Noop>) {
        let (raw_device, raw_queue) = noop::context();
        let device = Device::new(raw_device);
        let queue = Queue::new(device.clone(), raw_queue);
        (device, queue)
    }

    /// Creates a buffer of `size` bytes filled with `fill`.
    fn seeded(device: &Device<Noop>, queue: &Queue<Noop>, size: u64, fill: u8) -> Buffer<Noop> {
        let buffer = Buffer::new(device, size, BufferUsages::empty(), Some("seeded")).unwrap();
        let payload = vec![fill; size as usize];
        buffer.update(queue, 0, &payload).unwrap();
        assert_eq!(queue.finish(), SubmissionStatus::Success);
        buffer
    }

    #[test]
    fn test_capacity_rounds_up() {
        let (device, _queue) = test_context();
        let buffer = Buffer::new(&device, 10, BufferUsages::VERTEX, None).unwrap();
        assert_eq!(buffer.capacity(), 12);

        let aligned = Buffer::new(&device, 16, BufferUsages::VERTEX, None).unwrap();
        assert_eq!(aligned.capacity(), 16);
    }

    #[test]
    fn test_copy_dst_usage_is_implied() {
        let (device, _queue) = test_context();
        let buffer = Buffer::new(&device, 4, BufferUsages::INDEX, None).unwrap();
        assert!(buffer.usage().contains(BufferUsages::COPY_DST));
        assert!(buffer.usage().contains(BufferUsages::INDEX));
    }

    #[test]
    #[should_panic(expected = "nonzero size")]
    fn test_zero_size_panics() {
        let (device, _queue) = test_context();
        let _ = Buffer::new(&device, 0, BufferUsages::VERTEX, None);
    }

    #[test]
    fn test_allocation_failure_surfaces() {
        let (device, _queue) = test_context();
        device.raw().fail_next_allocation();
        let result = Buffer::new(&device, 64, BufferUsages::VERTEX, None);
        assert_eq!(result.unwrap_err(), DeviceError::OutOfMemory);
    }

    #[test]
    fn test_update_roundtrip_with_padding() {
        let (device, queue) = test_context();
        let buffer = Buffer::new(&device, 10, BufferUsages::VERTEX, Some("payload")).unwrap();
        let payload: [u8; 10] = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100];

        buffer.update(&queue, 0, &payload).unwrap();
        assert_eq!(queue.finish(), SubmissionStatus::Success);

        let contents = buffer.raw().contents();
        assert_eq!(&contents[..10], &payload);
        assert_eq!(&contents[10..12], &[0, 0]);
    }

    #[test]
    fn test_update_at_offset_preserves_surroundings() {
        let (device, queue) = test_context();
        let buffer = seeded(&device, &queue, 16, 0xff);

        buffer.update(&queue, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(queue.finish(), SubmissionStatus::Success);

        let contents = buffer.raw().contents();
        assert_eq!(&contents[..4], &[0xff; 4]);
        assert_eq!(&contents[4..8], &[1, 2, 3, 4]);
        assert_eq!(&contents[8..], &[0xff; 8]);
    }

    #[test]
    fn test_padding_never_reaches_past_staged_range() {
        let (device, queue) = test_context();
        let buffer = seeded(&device, &queue, 16, 0xff);

        // 6 bytes stage as 8: two zero pad bytes, nothing beyond.
        buffer.update(&queue, 4, &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(queue.finish(), SubmissionStatus::Success);

        let contents = buffer.raw().contents();
        assert_eq!(&contents[..4], &[0xff; 4]);
        assert_eq!(&contents[4..10], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&contents[10..12], &[0, 0]);
        assert_eq!(&contents[12..], &[0xff; 4]);
    }

    #[test]
    fn test_empty_update_is_noop() {
        let (device, queue) = test_context();
        let buffer = Buffer::new(&device, 8, BufferUsages::VERTEX, None).unwrap();
        let before = queue.latest_submission();

        buffer.update(&queue, 0, &[]).unwrap();
        assert_eq!(queue.flush(), before);
        assert_eq!(queue.staging().stats().in_flight, 0);
    }

    #[test]
    #[should_panic(expected = "aligned to WRITE_ALIGNMENT")]
    fn test_misaligned_offset_panics() {
        let (device, queue) = test_context();
        let buffer = Buffer::new(&device, 16, BufferUsages::VERTEX, None).unwrap();
        let _ = buffer.update(&queue, 2, &[1, 2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "past the buffer's capacity")]
    fn test_update_past_capacity_panics() {
        let (device, queue) = test_context();
        let buffer = Buffer::new(&device, 8, BufferUsages::VERTEX, None).unwrap();
        let _ = buffer.update(&queue, 4, &[1, 2, 3, 4, 5]);
    }

    #[test]
    #[should_panic(expected = "past the buffer's capacity")]
    fn test_update_offset_overflow_panics() {
        let (device, queue) = test_context();
        let buffer = Buffer::new(&device, 8, BufferUsages::VERTEX, None).unwrap();
        // u64::MAX - 3 keeps the offset aligned, so the bounds check is
        // the one that has to reject the wrapped end.
        let _ = buffer.update(&queue, u64::MAX - 3, &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_update_staging_allocation_failure_surfaces() {
        let (device, queue) = test_context();
        let buffer = Buffer::new(&device, 8, BufferUsages::VERTEX, None).unwrap();
        device.raw().fail_next_allocation();
        let result = buffer.update(&queue, 0, &[1, 2, 3, 4]);
        assert_eq!(result.unwrap_err(), DeviceError::OutOfMemory);
        assert_eq!(queue.staging().stats().in_flight, 0);
    }

    #[test]
    fn test_lost_mapped_range_falls_back_to_async_map() {
        let (device, queue) = test_context();
        let buffer = seeded(&device, &queue, 8, 0xff);

        device.raw().lose_next_mapped_range();
        buffer.update(&queue, 0, &[1, 2, 3, 4]).unwrap();

        // The copy is only recorded once the fallback map settles.
        device.poll();
        assert_eq!(queue.finish(), SubmissionStatus::Success);
        let contents = buffer.raw().contents();
        assert_eq!(&contents[..4], &[1, 2, 3, 4]);
        assert_eq!(&contents[4..], &[0xff; 4]);
        assert_eq!(queue.dropped_writes(), 0);
    }

    #[test]
    fn test_failed_fallback_map_drops_the_write() {
        let (device, queue) = test_context();
        let buffer = seeded(&device, &queue, 8, 0xff);
        queue.maintain();
        queue.maintain();

        device.raw().lose_next_mapped_range();
        device.raw().fail_next_map();
        buffer.update(&queue, 0, &[1, 2, 3, 4]).unwrap();
        device.poll();

        assert_eq!(queue.dropped_writes(), 1);
        let stats = queue.staging().stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.discarded, 1);

        // Destination keeps its prior contents.
        assert_eq!(queue.finish(), SubmissionStatus::Success);
        assert_eq!(buffer.raw().contents(), [0xff; 8]);
    }

    #[test]
    fn test_update_slice_writes_typed_data() {
        let (device, queue) = test_context();
        let buffer = Buffer::new(&device, 8, BufferUsages::UNIFORM, None).unwrap();

        buffer
            .update_slice(&queue, 0, &[0x0403_0201u32, 0x0807_0605u32])
            .unwrap();
        assert_eq!(queue.finish(), SubmissionStatus::Success);
        assert_eq!(
            buffer.raw().contents(),
            [1, 2, 3, 4, 5, 6, 7, 8],
            "little endian lanes in declaration order"
        );
    }

    #[test]
    #[should_panic(expected = "different devices")]
    fn test_update_with_foreign_queue_panics() {
        let (device, _queue) = test_context();
        let (_other_device, other_queue) = test_context();
        let buffer = Buffer::new(&device, 8, BufferUsages::VERTEX, None).unwrap();
        let _ = buffer.update(&other_queue, 0, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_sequential_updates_execute_in_order() {
        let (device, queue) = test_context();
        let buffer = Buffer::new(&device, 4, BufferUsages::VERTEX, None).unwrap();

        buffer.update(&queue, 0, &[1, 1, 1, 1]).unwrap();
        buffer.update(&queue, 0, &[2, 2, 2, 2]).unwrap();
        assert_eq!(queue.finish(), SubmissionStatus::Success);
        assert_eq!(buffer.raw().contents(), [2, 2, 2, 2]);
    }
}
