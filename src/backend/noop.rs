//! CPU-only backend.
//!
//! Buffers live in process memory and copies execute on the CPU, so the full
//! upload path runs deterministically with no adapter present. Completion
//! delivery mimics a real device: map and submit callbacks are queued when
//! requested and only delivered from [`poll`](crate::hal::Device::poll),
//! submissions first, then maps.
//!
//! The device carries one-shot failure switches so tests can drive the error
//! paths that a healthy GPU never takes:
//!
//! - [`NoopDevice::fail_next_allocation`]: next buffer creation reports
//!   out-of-memory.
//! - [`NoopDevice::fail_next_map`]: next map request settles with an error.
//! - [`NoopDevice::fail_next_submit`]: next submission completes with an
//!   error and its copies do not execute.
//! - [`NoopDevice::lose_next_mapped_range`]: next mapped-range access fails
//!   even though the buffer is mapped.
//! - [`NoopDevice::hold_completions`]: freezes delivery entirely until
//!   released, for observing intermediate states.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{DeviceError, MapAccessError, MapError, SubmitError};
use crate::hal::{self, Backend, BufferDesc, BufferUsages, Label, MapCallback, SubmitCallback};

/// The CPU backend.
#[derive(Debug, Clone, Copy)]
pub struct Noop;

impl Backend for Noop {
    type Device = NoopDevice;
    type Queue = NoopQueue;
    type Encoder = NoopEncoder;
    type Buffer = NoopBuffer;
    type CommandBatch = Vec<CopyCommand>;
}

/// Creates a connected device and queue pair.
///
/// The two share one completion queue: work submitted through the queue is
/// observed by polling the device.
pub fn context() -> (NoopDevice, NoopQueue) {
    let shared = Arc::new(Shared::default());
    (
        NoopDevice {
            shared: shared.clone(),
        },
        NoopQueue { shared },
    )
}

struct BufferState {
    bytes: Vec<u8>,
    mapped: bool,
}

/// A buffer backed by process memory.
pub struct NoopBuffer {
    label: Option<String>,
    size: u64,
    usage: BufferUsages,
    state: Mutex<BufferState>,
}

impl NoopBuffer {
    /// Returns a copy of the buffer's current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }

    /// Returns the buffer's size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the buffer's usage flags.
    pub fn usage(&self) -> BufferUsages {
        self.usage
    }

    /// Returns `true` while the buffer is mapped for host access.
    pub fn is_mapped(&self) -> bool {
        self.state.lock().mapped
    }
}

impl std::fmt::Debug for NoopBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoopBuffer")
            .field("label", &self.label)
            .field("size", &self.size)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// A recorded buffer-to-buffer copy, executed when its batch is polled.
pub struct CopyCommand {
    src: Arc<NoopBuffer>,
    src_offset: u64,
    dst: Arc<NoopBuffer>,
    dst_offset: u64,
    size: u64,
}

impl CopyCommand {
    fn execute(&self) {
        let chunk = {
            let src = self.src.state.lock();
            assert!(!src.mapped, "copy source is mapped");
            let start = self.src_offset as usize;
            src.bytes[start..start + self.size as usize].to_vec()
        };
        let mut dst = self.dst.state.lock();
        assert!(!dst.mapped, "copy destination is mapped");
        let start = self.dst_offset as usize;
        dst.bytes[start..start + self.size as usize].copy_from_slice(&chunk);
    }
}

struct PendingMap {
    buffer: Arc<NoopBuffer>,
    outcome: Result<(), MapError>,
    callback: MapCallback,
}

struct PendingSubmit {
    copies: Vec<CopyCommand>,
    outcome: Result<(), SubmitError>,
    callback: SubmitCallback,
}

#[derive(Default)]
struct SharedState {
    pending_maps: Vec<PendingMap>,
    pending_submits: Vec<PendingSubmit>,
    hold_completions: bool,
    fail_next_allocation: bool,
    fail_next_map: bool,
    fail_next_submit: bool,
    lose_next_mapped_range: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<SharedState>,
}

/// The CPU device.
#[derive(Clone)]
pub struct NoopDevice {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for NoopDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoopDevice").finish_non_exhaustive()
    }
}

impl NoopDevice {
    /// Makes the next buffer creation report out-of-memory.
    pub fn fail_next_allocation(&self) {
        self.shared.state.lock().fail_next_allocation = true;
    }

    /// Makes the next map request settle with [`MapError::Failed`].
    pub fn fail_next_map(&self) {
        self.shared.state.lock().fail_next_map = true;
    }

    /// Makes the next submission complete with an error; its copies do not
    /// execute.
    pub fn fail_next_submit(&self) {
        self.shared.state.lock().fail_next_submit = true;
    }

    /// Makes the next mapped-range access fail despite the buffer being
    /// mapped.
    pub fn lose_next_mapped_range(&self) {
        self.shared.state.lock().lose_next_mapped_range = true;
    }

    /// While `hold` is set, polling delivers nothing.
    pub fn hold_completions(&self, hold: bool) {
        self.shared.state.lock().hold_completions = hold;
    }
}

impl hal::Device<Noop> for NoopDevice {
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<NoopBuffer, DeviceError> {
        {
            let mut state = self.shared.state.lock();
            if state.fail_next_allocation {
                state.fail_next_allocation = false;
                return Err(DeviceError::OutOfMemory);
            }
        }
        Ok(NoopBuffer {
            label: desc.label.map(str::to_owned),
            size: desc.size,
            usage: desc.usage,
            state: Mutex::new(BufferState {
                bytes: vec![0; desc.size as usize],
                mapped: desc.mapped_at_creation,
            }),
        })
    }

    fn create_encoder(&self, label: Label<'_>) -> NoopEncoder {
        NoopEncoder {
            label: label.map(str::to_owned),
            copies: Vec::new(),
        }
    }

    fn map_async(&self, buffer: &Arc<NoopBuffer>, callback: MapCallback) {
        let mut state = self.shared.state.lock();
        let outcome = if state.fail_next_map {
            state.fail_next_map = false;
            Err(MapError::Failed)
        } else {
            Ok(())
        };
        state.pending_maps.push(PendingMap {
            buffer: buffer.clone(),
            outcome,
            callback,
        });
    }

    fn with_mapped_mut(
        &self,
        buffer: &NoopBuffer,
        len: u64,
        write: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), MapAccessError> {
        {
            let mut state = self.shared.state.lock();
            if state.lose_next_mapped_range {
                state.lose_next_mapped_range = false;
                return Err(MapAccessError);
            }
        }
        let mut state = buffer.state.lock();
        if !state.mapped {
            return Err(MapAccessError);
        }
        assert!(
            len <= state.bytes.len() as u64,
            "mapped access past the end of the buffer"
        );
        write(&mut state.bytes[..len as usize]);
        Ok(())
    }

    fn unmap(&self, buffer: &NoopBuffer) {
        buffer.state.lock().mapped = false;
    }

    fn poll(&self) {
        let (submits, maps) = {
            let mut state = self.shared.state.lock();
            if state.hold_completions {
                return;
            }
            (
                std::mem::take(&mut state.pending_submits),
                std::mem::take(&mut state.pending_maps),
            )
        };
        // Callbacks run with the state lock released; they may queue new
        // work, which waits for the next poll.
        for submit in submits {
            if submit.outcome.is_ok() {
                for copy in &submit.copies {
                    copy.execute();
                }
            }
            (submit.callback)(submit.outcome);
        }
        for map in maps {
            if map.outcome.is_ok() {
                map.buffer.state.lock().mapped = true;
            }
            (map.callback)(map.outcome);
        }
    }
}

/// The CPU queue.
#[derive(Clone)]
pub struct NoopQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for NoopQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoopQueue").finish_non_exhaustive()
    }
}

impl hal::Queue<Noop> for NoopQueue {
    fn submit(&self, batch: Vec<CopyCommand>, on_complete: SubmitCallback) {
        let mut state = self.shared.state.lock();
        let outcome = if state.fail_next_submit {
            state.fail_next_submit = false;
            Err(SubmitError)
        } else {
            Ok(())
        };
        state.pending_submits.push(PendingSubmit {
            copies: batch,
            outcome,
            callback: on_complete,
        });
    }
}

/// Records copies into a plain list.
pub struct NoopEncoder {
    #[allow(dead_code)]
    label: Option<String>,
    copies: Vec<CopyCommand>,
}

impl hal::Encoder<Noop> for NoopEncoder {
    fn copy_buffer_to_buffer(
        &mut self,
        src: &Arc<NoopBuffer>,
        src_offset: u64,
        dst: &Arc<NoopBuffer>,
        dst_offset: u64,
        size: u64,
    ) {
        assert!(
            src_offset.checked_add(size).is_some_and(|end| end <= src.size),
            "copy reads past the end of the source"
        );
        assert!(
            dst_offset.checked_add(size).is_some_and(|end| end <= dst.size),
            "copy writes past the end of the destination"
        );
        self.copies.push(CopyCommand {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
            dst_offset,
            size,
        });
    }

    fn finish(self) -> Vec<CopyCommand> {
        self.copies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Device as _, Encoder as _, Queue as _};

    fn make_buffer(device: &NoopDevice, size: u64, mapped: bool) -> Arc<NoopBuffer> {
        Arc::new(
            device
                .create_buffer(&BufferDesc {
                    label: None,
                    size,
                    usage: BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
                    mapped_at_creation: mapped,
                })
                .unwrap(),
        )
    }

    #[test]
    fn test_mapped_at_creation() {
        let (device, _queue) = context();
        let buffer = make_buffer(&device, 8, true);
        assert!(buffer.is_mapped());
        device.unmap(&buffer);
        assert!(!buffer.is_mapped());
    }

    #[test]
    fn test_copies_execute_in_recorded_order() {
        let (device, queue) = context();
        let src_a = make_buffer(&device, 4, true);
        let src_b = make_buffer(&device, 4, true);
        device
            .with_mapped_mut(&src_a, 4, &mut |bytes| bytes.copy_from_slice(&[1; 4]))
            .unwrap();
        device
            .with_mapped_mut(&src_b, 4, &mut |bytes| bytes.copy_from_slice(&[2; 4]))
            .unwrap();
        device.unmap(&src_a);
        device.unmap(&src_b);

        let dst = make_buffer(&device, 4, false);
        let mut encoder = device.create_encoder(None);
        encoder.copy_buffer_to_buffer(&src_a, 0, &dst, 0, 4);
        encoder.copy_buffer_to_buffer(&src_b, 0, &dst, 0, 4);
        queue.submit(encoder.finish(), Box::new(|result| result.unwrap()));

        device.poll();
        assert_eq!(dst.contents(), [2; 4]);
    }

    #[test]
    #[should_panic(expected = "past the end of the destination")]
    fn test_copy_offset_overflow_panics() {
        let (device, _queue) = context();
        let src = make_buffer(&device, 4, false);
        let dst = make_buffer(&device, 4, false);
        let mut encoder = device.create_encoder(None);
        // Aligned destination offset whose end wraps around u64.
        encoder.copy_buffer_to_buffer(&src, 0, &dst, u64::MAX - 3, 4);
    }

    #[test]
    fn test_poll_delivers_submits_before_maps() {
        let (device, queue) = context();
        let buffer = make_buffer(&device, 4, false);
        let order = Arc::new(Mutex::new(Vec::new()));

        let seen = order.clone();
        device.map_async(&buffer, Box::new(move |_| seen.lock().push("map")));
        let seen = order.clone();
        queue.submit(Vec::new(), Box::new(move |_| seen.lock().push("submit")));

        device.poll();
        assert_eq!(*order.lock(), ["submit", "map"]);
        assert!(buffer.is_mapped());
    }

    #[test]
    fn test_hold_completions_defers_delivery() {
        let (device, _queue) = context();
        let buffer = make_buffer(&device, 4, false);
        let delivered = Arc::new(Mutex::new(false));

        device.hold_completions(true);
        let seen = delivered.clone();
        device.map_async(&buffer, Box::new(move |_| *seen.lock() = true));
        device.poll();
        assert!(!*delivered.lock());

        device.hold_completions(false);
        device.poll();
        assert!(*delivered.lock());
    }

    #[test]
    fn test_fail_next_map_is_one_shot() {
        let (device, _queue) = context();
        let buffer = make_buffer(&device, 4, false);
        let outcomes = Arc::new(Mutex::new(Vec::new()));

        device.fail_next_map();
        let seen = outcomes.clone();
        device.map_async(&buffer, Box::new(move |result| seen.lock().push(result)));
        let seen = outcomes.clone();
        device.map_async(&buffer, Box::new(move |result| seen.lock().push(result)));

        device.poll();
        assert_eq!(*outcomes.lock(), [Err(MapError::Failed), Ok(())]);
    }

    #[test]
    fn test_failed_submit_skips_copies() {
        let (device, queue) = context();
        let src = make_buffer(&device, 4, true);
        device
            .with_mapped_mut(&src, 4, &mut |bytes| bytes.copy_from_slice(&[7; 4]))
            .unwrap();
        device.unmap(&src);
        let dst = make_buffer(&device, 4, false);

        let mut encoder = device.create_encoder(None);
        encoder.copy_buffer_to_buffer(&src, 0, &dst, 0, 4);
        device.fail_next_submit();
        let outcome = Arc::new(Mutex::new(None));
        let seen = outcome.clone();
        queue.submit(
            encoder.finish(),
            Box::new(move |result| *seen.lock() = Some(result)),
        );

        device.poll();
        assert_eq!(*outcome.lock(), Some(Err(SubmitError)));
        assert_eq!(dst.contents(), [0; 4]);
    }

    #[test]
    fn test_lose_next_mapped_range_is_one_shot() {
        let (device, _queue) = context();
        let buffer = make_buffer(&device, 4, true);

        device.lose_next_mapped_range();
        let first = device.with_mapped_mut(&buffer, 4, &mut |_| {});
        assert_eq!(first, Err(MapAccessError));
        let second = device.with_mapped_mut(&buffer, 4, &mut |_| {});
        assert_eq!(second, Ok(()));
    }

    #[test]
    fn test_unmapped_range_is_unavailable() {
        let (device, _queue) = context();
        let buffer = make_buffer(&device, 4, false);
        let result = device.with_mapped_mut(&buffer, 4, &mut |_| {});
        assert_eq!(result, Err(MapAccessError));
    }
}
