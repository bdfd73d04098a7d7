//! Staging buffer pool.
//!
//! Every upload travels through a host-writable staging buffer. Creating and
//! mapping one per write is expensive, so this module pools them: a buffer is
//! acquired for a write, rides along with the submission that consumes it,
//! and returns to the free list once that submission completes and the buffer
//! is mapped again.
//!
//! # Key Types
//!
//! - [`StagingPool`]: the pool itself, cheap to clone and shared with the
//!   queue manager.
//! - [`StagingBuffer`]: one pooled buffer, handed out as `Arc`.
//! - [`PoolStats`]: a point-in-time snapshot for diagnostics.
//!
//! # Buffer lifecycle
//!
//! ```text
//! free list --acquire--> in flight --submission done, remap ok--> free list
//!                            |
//!                            +-- submission failed / remap failed --> discarded
//! ```
//!
//! A buffer on the free list is always mapped, so acquiring one never waits
//! on the device. An in-flight buffer is never handed out again until the
//! submission it is tied to has completed, which is what keeps host writes
//! from racing the GPU's reads of the same memory.
//!
//! The pool never recycles on its own: the owner drives collection through
//! [`StagingPool::garbage_collect`], usually via
//! [`Queue::maintain`](crate::Queue::maintain).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::align_size;
use crate::device::{Device, HasDevice};
use crate::error::DeviceError;
use crate::hal::{Backend, BufferDesc, BufferUsages};
use crate::sync::{Submission, SubmissionStatus};

/// One pooled, host-writable staging buffer.
///
/// The recorded size is the buffer's real, alignment-rounded capacity, which
/// may exceed what the acquiring call asked for.
pub struct StagingBuffer<B: Backend> {
    raw: Arc<B::Buffer>,
    size: u64,
    id: u64,
    mapped: AtomicBool,
}

impl<B: Backend> StagingBuffer<B> {
    /// Returns the backend buffer.
    pub fn raw(&self) -> &Arc<B::Buffer> {
        &self.raw
    }

    /// Returns the buffer's capacity in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns `true` while the buffer's memory is host-visible.
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Relaxed)
    }

    pub(crate) fn set_mapped(&self, mapped: bool) {
        self.mapped.store(mapped, Ordering::Relaxed);
    }
}

impl<B: Backend> std::fmt::Debug for StagingBuffer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Where an in-flight buffer stands relative to the submission timeline.
///
/// A buffer is safe to reuse only once the submission that reads from it has
/// completed. Until its copy is submitted there is no such submission yet, so
/// the entry moves through two provisional states first.
enum FlightTag {
    /// Acquired; no copy recorded yet.
    Pending,
    /// A copy out of this buffer sits in the current recording.
    Recorded,
    /// The copy was submitted; reuse waits on this submission.
    Sealed(Submission),
}

struct InFlight<B: Backend> {
    buffer: Arc<StagingBuffer<B>>,
    tag: FlightTag,
}

struct PoolInner<B: Backend> {
    /// Mapped buffers ready for reuse, buckets keyed by capacity.
    free: BTreeMap<u64, Vec<Arc<StagingBuffer<B>>>>,
    in_flight: SmallVec<[InFlight<B>; 8]>,
}

struct PoolShared<B: Backend> {
    device: Device<B>,
    inner: Mutex<PoolInner<B>>,
    discarded: AtomicU64,
    next_id: AtomicU64,
}

/// A pool of reusable staging buffers.
///
/// Cloning the pool is cheap; clones share the same free list.
pub struct StagingPool<B: Backend> {
    shared: Arc<PoolShared<B>>,
}

impl<B: Backend> Clone for StagingPool<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for StagingPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("StagingPool")
            .field("free_buffers", &stats.free_buffers)
            .field("in_flight", &stats.in_flight)
            .finish()
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Buffers on the free list.
    pub free_buffers: usize,
    /// Total capacity of the free list in bytes.
    pub free_bytes: u64,
    /// Buffers tied to unfinished GPU work.
    pub in_flight: usize,
    /// Buffers the pool gave up on instead of recycling.
    pub discarded: u64,
}

impl<B: Backend> StagingPool<B> {
    /// Creates an empty pool allocating from `device`.
    pub fn new(device: Device<B>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                device,
                inner: Mutex::new(PoolInner {
                    free: BTreeMap::new(),
                    in_flight: SmallVec::new(),
                }),
                discarded: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Hands out a mapped staging buffer of at least `size` bytes.
    ///
    /// The smallest free buffer that fits is reused; if none fits, a new one
    /// is allocated with `size` rounded up to [`crate::WRITE_ALIGNMENT`]. The
    /// buffer will not be handed out again until `after` has completed and
    /// the pool was garbage collected.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] when a fresh allocation is needed and fails.
    pub fn acquire(
        &self,
        size: u64,
        after: Submission,
    ) -> Result<Arc<StagingBuffer<B>>, DeviceError> {
        self.acquire_tagged(size, FlightTag::Sealed(after))
    }

    /// Hands out a mapped staging buffer whose reuse boundary is not known
    /// yet.
    ///
    /// The entry stays in flight through [`mark_recorded`](Self::mark_recorded)
    /// and [`seal_recorded`](Self::seal_recorded) before it can ever be
    /// collected.
    pub(crate) fn acquire_pending(&self, size: u64) -> Result<Arc<StagingBuffer<B>>, DeviceError> {
        self.acquire_tagged(size, FlightTag::Pending)
    }

    fn acquire_tagged(
        &self,
        size: u64,
        tag: FlightTag,
    ) -> Result<Arc<StagingBuffer<B>>, DeviceError> {
        assert!(size > 0, "staging buffers have nonzero size");

        let reused = {
            let mut inner = self.shared.inner.lock();
            // Best fit: smallest free bucket large enough.
            let bucket = inner.free.range(size..).next().map(|(&key, _)| key);
            bucket.and_then(|key| {
                let buffers = inner.free.get_mut(&key)?;
                let buffer = buffers.pop();
                if buffers.is_empty() {
                    inner.free.remove(&key);
                }
                buffer
            })
        };

        let buffer = match reused {
            Some(buffer) => {
                tracing::trace!(
                    id = buffer.id,
                    capacity = buffer.size,
                    requested = size,
                    "reusing staging buffer"
                );
                buffer
            }
            None => self.allocate(size)?,
        };
        debug_assert!(buffer.is_mapped(), "pooled staging buffers are mapped");

        let mut inner = self.shared.inner.lock();
        inner.in_flight.push(InFlight {
            buffer: buffer.clone(),
            tag,
        });
        Ok(buffer)
    }

    fn allocate(&self, size: u64) -> Result<Arc<StagingBuffer<B>>, DeviceError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let capacity = align_size(size);
        let label = format!("staging buffer {id}");
        let raw = self.shared.device.create_buffer(&BufferDesc {
            label: Some(&label),
            size: capacity,
            usage: BufferUsages::MAP_WRITE | BufferUsages::COPY_SRC,
            mapped_at_creation: true,
        })?;
        tracing::debug!(id, capacity, requested = size, "allocated staging buffer");
        Ok(Arc::new(StagingBuffer {
            raw: Arc::new(raw),
            size: capacity,
            id,
            mapped: AtomicBool::new(true),
        }))
    }

    /// Marks `buffer`'s in-flight entry as having its copy recorded.
    ///
    /// Called by the queue manager under its recording lock, so the entry is
    /// sealed by the same submission that carries the copy. Entries already
    /// sealed at acquire time keep their boundary.
    pub(crate) fn mark_recorded(&self, buffer: &Arc<StagingBuffer<B>>) {
        let mut inner = self.shared.inner.lock();
        let entry = inner
            .in_flight
            .iter_mut()
            .find(|entry| Arc::ptr_eq(&entry.buffer, buffer));
        debug_assert!(entry.is_some(), "recorded a copy from an untracked staging buffer");
        if let Some(entry) = entry {
            if matches!(entry.tag, FlightTag::Pending) {
                entry.tag = FlightTag::Recorded;
            }
        }
    }

    /// Seals every recorded entry to `submission`.
    ///
    /// Called by the queue manager under its recording lock right before the
    /// batch containing those copies is submitted.
    pub(crate) fn seal_recorded(&self, submission: &Submission) {
        let mut inner = self.shared.inner.lock();
        for entry in inner.in_flight.iter_mut() {
            if matches!(entry.tag, FlightTag::Recorded) {
                entry.tag = FlightTag::Sealed(submission.clone());
            }
        }
    }

    /// Drops an in-flight entry whose write never made it to the queue.
    ///
    /// The buffer is discarded rather than recycled.
    pub(crate) fn release(&self, buffer: &Arc<StagingBuffer<B>>) {
        let mut inner = self.shared.inner.lock();
        let before = inner.in_flight.len();
        inner
            .in_flight
            .retain(|entry| !Arc::ptr_eq(&entry.buffer, buffer));
        debug_assert!(inner.in_flight.len() < before, "released an untracked staging buffer");
        drop(inner);
        self.shared.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Sweeps the in-flight list, recycling buffers whose submission
    /// succeeded and discarding those whose submission failed.
    ///
    /// Recycling is asynchronous: each reclaimed buffer is remapped and only
    /// joins the free list once the device delivers the map callback, at a
    /// later [`Device::poll`]. Returns how many buffers began recycling.
    pub fn garbage_collect(&self) -> usize {
        let mut recyclable: Vec<Arc<StagingBuffer<B>>> = Vec::new();
        {
            let mut inner = self.shared.inner.lock();
            inner.in_flight.retain(|entry| match &entry.tag {
                FlightTag::Sealed(submission) => match submission.status() {
                    SubmissionStatus::Pending => true,
                    SubmissionStatus::Success => {
                        recyclable.push(entry.buffer.clone());
                        false
                    }
                    SubmissionStatus::Error => {
                        tracing::warn!(
                            id = entry.buffer.id,
                            capacity = entry.buffer.size,
                            "discarding staging buffer tied to a failed submission"
                        );
                        self.shared.discarded.fetch_add(1, Ordering::Relaxed);
                        false
                    }
                },
                FlightTag::Pending | FlightTag::Recorded => true,
            });
        }
        // Remap outside the pool lock; the callbacks take it again.
        let count = recyclable.len();
        for buffer in recyclable {
            self.remap(buffer);
        }
        count
    }

    /// Remaps `buffer` and returns it to the free list once the map settles.
    ///
    /// [`garbage_collect`](Self::garbage_collect) does this automatically for
    /// sealed entries; callers that observe completion themselves can hand a
    /// buffer back early instead of waiting for the next sweep. The buffer's
    /// in-flight entry, if still present, is removed here.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is still tied to a submission that has not
    /// succeeded.
    pub fn recycle(&self, buffer: Arc<StagingBuffer<B>>) {
        {
            let mut inner = self.shared.inner.lock();
            if let Some(pos) = inner
                .in_flight
                .iter()
                .position(|entry| Arc::ptr_eq(&entry.buffer, &buffer))
            {
                let entry = inner.in_flight.remove(pos);
                let done = matches!(
                    &entry.tag,
                    FlightTag::Sealed(submission)
                        if submission.status() == SubmissionStatus::Success
                );
                assert!(done, "recycled a staging buffer before its submission succeeded");
            }
        }
        self.remap(buffer);
    }

    fn remap(&self, buffer: Arc<StagingBuffer<B>>) {
        let shared = Arc::downgrade(&self.shared);
        let raw = buffer.raw.clone();
        self.shared.device.map_async(
            &raw,
            Box::new(move |result| {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                match result {
                    Ok(()) => {
                        buffer.set_mapped(true);
                        tracing::trace!(
                            id = buffer.id,
                            capacity = buffer.size,
                            "staging buffer recycled"
                        );
                        let mut inner = shared.inner.lock();
                        inner.free.entry(buffer.size).or_default().push(buffer);
                    }
                    Err(err) => {
                        tracing::warn!(
                            id = buffer.id,
                            capacity = buffer.size,
                            %err,
                            "staging buffer remap failed; discarding it"
                        );
                        shared.discarded.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }),
        );
    }

    /// Empties the free list, returning how many buffers were dropped.
    ///
    /// In-flight buffers are untouched. Useful after an upload burst to give
    /// memory back to the device.
    pub fn trim(&self) -> usize {
        let mut inner = self.shared.inner.lock();
        let count = inner.free.values().map(Vec::len).sum();
        if count > 0 {
            tracing::debug!(count, "trimming staging pool free list");
        }
        inner.free.clear();
        count
    }

    /// Returns a snapshot of the pool's counters.
    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock();
        PoolStats {
            free_buffers: inner.free.values().map(Vec::len).sum(),
            free_bytes: inner
                .free
                .iter()
                .map(|(&size, buffers)| size * buffers.len() as u64)
                .sum(),
            in_flight: inner.in_flight.len(),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }
}

impl<B: Backend> HasDevice<B> for StagingPool<B> {
    fn device(&self) -> &Device<B> {
        &self.shared.device
    }
}
