//! Queue management: deferred command recording and batched submission.
//!
//! This module provides the [`Queue`] type, which owns the crate's single
//! recording context and turns recorded copies into submissions.
//!
//! # Overview
//!
//! Commands are not submitted one by one. They accumulate in a lazily created
//! command encoder and go to the device in one batch when the caller flushes.
//! Each non-empty submission mints a fresh [`Submission`] token; the queue
//! always exposes the latest one, starting from a pre-satisfied token so that
//! "wait for everything so far" never blocks on a fresh queue.
//!
//! Commands recorded into the same open context execute on the device in
//! recording order. Two separate submissions are only ordered by the device's
//! own queue-in-order execution.
//!
//! # Ordering contract for uploads
//!
//! [`Buffer::update`](crate::Buffer::update) records its copy into the
//! *current* context. Previously recorded work that depends on the
//! destination's old contents must be flushed before the update, or the copy
//! lands in the same batch ahead of it. The queue does not enforce this.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::device::{Device, HasDevice};
use crate::hal::{self, Backend, Encoder as _};
use crate::staging::{StagingBuffer, StagingPool};
use crate::sync::{Submission, SubmissionStatus};
use crate::WRITE_ALIGNMENT;

/// Sleep between device pumps while blocking in [`Queue::finish`].
///
/// Short enough to keep completion latency low, long enough not to spin a
/// core. There is no backoff and no upper bound; `finish` polls until the
/// submission resolves.
const FINISH_POLL_INTERVAL: Duration = Duration::from_micros(100);

struct RecordingState<B: Backend> {
    /// The open recording context, if any. `None` both before first use and
    /// after every flush.
    encoder: Option<B::Encoder>,
    latest: Submission,
}

struct QueueShared<B: Backend> {
    device: Device<B>,
    raw: B::Queue,
    staging: StagingPool<B>,
    rec: Mutex<RecordingState<B>>,
    submitted: AtomicU64,
    dropped_writes: AtomicU64,
}

/// Manages command recording and submission for one device queue.
///
/// Cloning the handle is cheap; clones share the recording context, the
/// staging pool, and the submission counters.
///
/// Lock ordering: the recording lock may be held while taking the staging
/// pool's lock, never the other way around.
pub struct Queue<B: Backend> {
    shared: Arc<QueueShared<B>>,
}

impl<B: Backend> Clone for Queue<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> PartialEq for Queue<B> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}
impl<B: Backend> Eq for Queue<B> {}

impl<B: Backend> std::fmt::Debug for Queue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("submitted", &self.shared.submitted.load(Ordering::Relaxed))
            .finish()
    }
}

impl<B: Backend> Queue<B> {
    /// Wraps a backend queue and creates its staging pool.
    ///
    /// The latest submission starts pre-satisfied.
    pub fn new(device: Device<B>, raw: B::Queue) -> Self {
        let staging = StagingPool::new(device.clone());
        Self {
            shared: Arc::new(QueueShared {
                device,
                raw,
                staging,
                rec: Mutex::new(RecordingState {
                    encoder: None,
                    latest: Submission::completed(),
                }),
                submitted: AtomicU64::new(0),
                dropped_writes: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the staging pool serving this queue's uploads.
    pub fn staging(&self) -> &StagingPool<B> {
        &self.shared.staging
    }

    /// Returns the completion token of the most recent submission.
    ///
    /// On a queue that has never submitted, the token is pre-satisfied.
    pub fn latest_submission(&self) -> Submission {
        self.shared.rec.lock().latest.clone()
    }

    /// Runs `f` against the open recording context, creating one if needed.
    ///
    /// Opening the context makes the next [`flush`](Self::flush) submit even
    /// if `f` records nothing.
    pub fn with_encoder<R>(&self, f: impl FnOnce(&mut B::Encoder) -> R) -> R {
        let mut rec = self.shared.rec.lock();
        let encoder = rec
            .encoder
            .get_or_insert_with(|| self.shared.device.create_encoder(Some("upload batch")));
        f(encoder)
    }

    /// Records a copy from a staging buffer into `dst`.
    ///
    /// The staging buffer's in-flight entry is tied to the batch being
    /// recorded, so the pool will not reuse it until that batch completes.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or any of `size`, `src_offset`, `dst_offset`
    /// is not [`WRITE_ALIGNMENT`]-aligned, if the copy reads past the staging
    /// buffer, or if the staging buffer is still mapped.
    pub fn record_copy(
        &self,
        src: &Arc<StagingBuffer<B>>,
        src_offset: u64,
        dst: &Arc<B::Buffer>,
        dst_offset: u64,
        size: u64,
    ) {
        assert!(size > 0, "copies have nonzero size");
        assert!(
            size % WRITE_ALIGNMENT == 0
                && src_offset % WRITE_ALIGNMENT == 0
                && dst_offset % WRITE_ALIGNMENT == 0,
            "copy offsets and sizes are aligned to WRITE_ALIGNMENT"
        );
        assert!(
            src_offset.checked_add(size).is_some_and(|end| end <= src.size()),
            "copy reads past the end of the staging buffer"
        );
        assert!(
            !src.is_mapped(),
            "staging buffer must be unmapped before its copy is recorded"
        );

        let mut rec = self.shared.rec.lock();
        let encoder = rec
            .encoder
            .get_or_insert_with(|| self.shared.device.create_encoder(Some("upload batch")));
        encoder.copy_buffer_to_buffer(src.raw(), src_offset, dst, dst_offset, size);
        // Under the recording lock, so a concurrent flush cannot seal between
        // the copy landing in the encoder and the entry being marked.
        self.shared.staging.mark_recorded(src);
    }

    /// Submits the open recording context, if any, without blocking.
    ///
    /// Returns the latest submission token: a fresh pending one if a batch
    /// was submitted, the previous one unchanged if no context was open.
    pub fn flush(&self) -> Submission {
        let (batch, submission) = {
            let mut rec = self.shared.rec.lock();
            let Some(encoder) = rec.encoder.take() else {
                tracing::trace!("flush with no open recording context");
                return rec.latest.clone();
            };
            let submission = Submission::new();
            rec.latest = submission.clone();
            // Seal under the recording lock: every entry recorded into this
            // batch is already marked, and nothing new can be marked until
            // the lock drops.
            self.shared.staging.seal_recorded(&submission);
            (encoder.finish(), submission)
        };

        let index = self.shared.submitted.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(index, "submitting recorded batch");
        let completion = submission.clone();
        hal::Queue::<B>::submit(
            &self.shared.raw,
            batch,
            Box::new(move |result| match result {
                Ok(()) => completion.resolve(SubmissionStatus::Success),
                Err(err) => {
                    tracing::warn!(index, %err, "submission failed on the device");
                    completion.resolve(SubmissionStatus::Error);
                }
            }),
        );
        submission
    }

    /// Submits the open recording context and blocks until it completes.
    ///
    /// Blocks by repeatedly pumping the device and sleeping briefly in
    /// between; completion callbacks are only delivered from those pumps.
    /// This is the crate's only operation that blocks without a timeout.
    pub fn finish(&self) -> SubmissionStatus {
        let submission = self.flush();
        loop {
            if submission.is_resolved() {
                return submission.status();
            }
            self.shared.device.poll();
            if submission.is_resolved() {
                return submission.status();
            }
            std::thread::sleep(FINISH_POLL_INTERVAL);
        }
    }

    /// Pumps the device and garbage collects the staging pool.
    ///
    /// Call once per frame or tick. Skipping it entirely means map and
    /// completion callbacks are never delivered and staging buffers are
    /// never recycled.
    pub fn maintain(&self) {
        self.shared.device.poll();
        self.shared.staging.garbage_collect();
    }

    /// Counts an upload whose staged data never reached the queue.
    pub(crate) fn note_dropped_write(&self) {
        self.shared.dropped_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns how many uploads were dropped because their staging buffer
    /// could not be mapped.
    pub fn dropped_writes(&self) -> u64 {
        self.shared.dropped_writes.load(Ordering::Relaxed)
    }
}

impl<B: Backend> HasDevice<B> for Queue<B> {
    fn device(&self) -> &Device<B> {
        &self.shared.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::noop::{self, Noop};
    use crate::hal::{BufferDesc, BufferUsages};

    fn test_queue() -> Queue<Noop> {
        let (raw_device, raw_queue) = noop::context();
        Queue::new(Device::new(raw_device), raw_queue)
    }

    fn destination(queue: &Queue<Noop>, size: u64) -> Arc<<Noop as Backend>::Buffer> {
        let raw = queue
            .device()
            .create_buffer(&BufferDesc {
                label: Some("dst"),
                size,
                usage: BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
            .unwrap();
        Arc::new(raw)
    }

    /// Acquires a staging buffer, writes `data` into it, and unmaps it so a
    /// copy can be recorded.
    fn staged(queue: &Queue<Noop>, data: &[u8]) -> Arc<crate::staging::StagingBuffer<Noop>> {
        let staging = queue.staging().acquire_pending(data.len() as u64).unwrap();
        queue
            .device()
            .with_mapped_mut(staging.raw(), data.len() as u64, &mut |bytes| {
                bytes.copy_from_slice(data);
            })
            .unwrap();
        queue.device().unmap(staging.raw());
        staging.set_mapped(false);
        staging
    }

    #[test]
    fn test_fresh_queue_latest_is_satisfied() {
        let queue = test_queue();
        assert_eq!(
            queue.latest_submission().status(),
            SubmissionStatus::Success
        );
        assert_eq!(queue.finish(), SubmissionStatus::Success);
    }

    #[test]
    fn test_flush_without_context_keeps_latest() {
        let queue = test_queue();
        let before = queue.latest_submission();
        let after = queue.flush();
        assert_eq!(after, before);
        assert_eq!(queue.flush(), before);
    }

    #[test]
    fn test_flush_after_opening_context_mints_new_submission() {
        let queue = test_queue();
        let before = queue.latest_submission();
        queue.with_encoder(|_| {});
        let after = queue.flush();
        assert_ne!(after, before);
        assert_eq!(after.status(), SubmissionStatus::Pending);

        queue.device().poll();
        assert_eq!(after.status(), SubmissionStatus::Success);
    }

    #[test]
    fn test_flush_submits_recorded_copy() {
        let queue = test_queue();
        let dst = destination(&queue, 8);
        let staging = staged(&queue, &[1, 2, 3, 4, 5, 6, 7, 8]);
        queue.record_copy(&staging, 0, &dst, 0, 8);

        let submission = queue.flush();
        assert_eq!(submission.status(), SubmissionStatus::Pending);
        assert_eq!(queue.latest_submission(), submission);

        queue.device().poll();
        assert_eq!(submission.status(), SubmissionStatus::Success);
        assert_eq!(dst.contents(), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_finish_blocks_until_complete() {
        let queue = test_queue();
        let dst = destination(&queue, 4);
        let staging = staged(&queue, &[9, 9, 9, 9]);
        queue.record_copy(&staging, 0, &dst, 0, 4);

        assert_eq!(queue.finish(), SubmissionStatus::Success);
        assert_eq!(queue.latest_submission().status(), SubmissionStatus::Success);
        assert_eq!(dst.contents(), [9, 9, 9, 9]);
    }

    #[test]
    fn test_failed_submission_resolves_error() {
        let queue = test_queue();
        let dst = destination(&queue, 4);
        let staging = staged(&queue, &[1, 2, 3, 4]);
        queue.record_copy(&staging, 0, &dst, 0, 4);

        queue.device().raw().fail_next_submit();
        let submission = queue.flush();
        queue.device().poll();
        assert_eq!(submission.status(), SubmissionStatus::Error);
        assert_eq!(queue.finish(), SubmissionStatus::Error);
    }

    #[test]
    fn test_maintain_recycles_consumed_staging() {
        let queue = test_queue();
        let dst = destination(&queue, 4);
        let staging = staged(&queue, &[1, 2, 3, 4]);
        queue.record_copy(&staging, 0, &dst, 0, 4);
        queue.flush();

        // First pass resolves the submission and starts the remap; second
        // pass delivers the map callback.
        queue.maintain();
        queue.maintain();
        let stats = queue.staging().stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.free_buffers, 1);
        assert!(staging.is_mapped());
    }

    #[test]
    fn test_submissions_execute_in_recording_order() {
        let queue = test_queue();
        let dst = destination(&queue, 4);
        let first = staged(&queue, &[1, 1, 1, 1]);
        let second = staged(&queue, &[2, 2, 2, 2]);
        queue.record_copy(&first, 0, &dst, 0, 4);
        queue.record_copy(&second, 0, &dst, 0, 4);

        assert_eq!(queue.finish(), SubmissionStatus::Success);
        assert_eq!(dst.contents(), [2, 2, 2, 2]);
    }

    #[test]
    #[should_panic(expected = "unmapped before its copy is recorded")]
    fn test_record_copy_from_mapped_staging_panics() {
        let queue = test_queue();
        let dst = destination(&queue, 4);
        let staging = queue.staging().acquire_pending(4).unwrap();
        queue.record_copy(&staging, 0, &dst, 0, 4);
    }

    #[test]
    #[should_panic(expected = "aligned to WRITE_ALIGNMENT")]
    fn test_record_copy_misaligned_size_panics() {
        let queue = test_queue();
        let dst = destination(&queue, 8);
        let staging = staged(&queue, &[1, 2, 3, 4]);
        queue.record_copy(&staging, 0, &dst, 0, 3);
    }

    #[test]
    #[should_panic(expected = "past the end of the staging buffer")]
    fn test_record_copy_offset_overflow_panics() {
        let queue = test_queue();
        let dst = destination(&queue, 8);
        let staging = staged(&queue, &[1, 2, 3, 4]);
        // Aligned source offset whose end wraps around u64.
        queue.record_copy(&staging, u64::MAX - 3, &dst, 0, 4);
    }

    #[test]
    fn test_dropped_writes_starts_at_zero() {
        let queue = test_queue();
        assert_eq!(queue.dropped_writes(), 0);
    }
}
