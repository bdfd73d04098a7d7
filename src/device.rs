//! Logical device wrapper.
//!
//! This module provides the core [`Device`] handle shared by every other part
//! of the crate.
//!
//! # Overview
//!
//! A [`Device`] owns one backend device and is reference-counted for cheap
//! sharing: buffers, the queue manager, and the staging pool each keep a
//! clone. Two device handles compare equal exactly when they refer to the
//! same underlying backend device, which lets resources assert that they are
//! used with the device that created them.
//!
//! The handle forwards resource creation and map traffic to the backend and
//! adds structured logging around the calls that can fail. Completion
//! delivery is pull-based: map and work-done callbacks fire during
//! [`Device::poll`], so something must pump the device for asynchronous
//! operations to make progress.

use std::sync::Arc;

use crate::error::{DeviceError, MapAccessError};
use crate::hal::{self, Backend, BufferDesc, Label, MapCallback};

struct DeviceInner<B: Backend> {
    raw: B::Device,
}

/// A handle to a logical GPU device.
///
/// Cloning the handle is cheap and every clone refers to the same backend
/// device.
pub struct Device<B: Backend> {
    inner: Arc<DeviceInner<B>>,
}

impl<B: Backend> Clone for Device<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> PartialEq for Device<B> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl<B: Backend> Eq for Device<B> {}

impl<B: Backend> std::fmt::Debug for Device<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Device")
            .field(&Arc::as_ptr(&self.inner))
            .finish()
    }
}

impl<B: Backend> Device<B> {
    /// Wraps a backend device.
    pub fn new(raw: B::Device) -> Self {
        Self {
            inner: Arc::new(DeviceInner { raw }),
        }
    }

    /// Returns the underlying backend device.
    pub fn raw(&self) -> &B::Device {
        &self.inner.raw
    }

    /// Creates a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] when the backend cannot satisfy the
    /// allocation. The failure is logged with the requested size and usage.
    pub fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<B::Buffer, DeviceError> {
        hal::Device::<B>::create_buffer(&self.inner.raw, desc).map_err(|err| {
            tracing::error!(
                label = desc.label.unwrap_or("<unlabeled>"),
                size = desc.size,
                usage = ?desc.usage,
                %err,
                "buffer creation failed"
            );
            err
        })
    }

    /// Creates a command encoder.
    pub fn create_encoder(&self, label: Label<'_>) -> B::Encoder {
        hal::Device::<B>::create_encoder(&self.inner.raw, label)
    }

    /// Requests a write mapping of `buffer` and schedules `callback` for when
    /// the request settles.
    ///
    /// The callback runs at some later [`poll`](Self::poll) (backends may
    /// also deliver it inline). The buffer must not be mapped when the
    /// request is made.
    pub fn map_async(&self, buffer: &Arc<B::Buffer>, callback: MapCallback) {
        hal::Device::<B>::map_async(&self.inner.raw, buffer, callback);
    }

    /// Runs `write` over the first `len` bytes of `buffer`'s mapped range.
    ///
    /// # Errors
    ///
    /// Returns [`MapAccessError`] when the backend cannot hand out the
    /// mapped range even though the buffer is nominally mapped. Callers fall
    /// back to a fresh [`map_async`](Self::map_async) request in that case.
    pub fn with_mapped_mut(
        &self,
        buffer: &B::Buffer,
        len: u64,
        write: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), MapAccessError> {
        hal::Device::<B>::with_mapped_mut(&self.inner.raw, buffer, len, write)
    }

    /// Unmaps `buffer`, making its contents visible to the device.
    pub fn unmap(&self, buffer: &B::Buffer) {
        hal::Device::<B>::unmap(&self.inner.raw, buffer);
    }

    /// Pumps the device, delivering any settled map and work-done callbacks.
    ///
    /// Must not be called while holding a lock that one of those callbacks
    /// may take.
    pub fn poll(&self) {
        hal::Device::<B>::poll(&self.inner.raw);
    }
}

/// Trait for types associated with a device.
pub trait HasDevice<B: Backend> {
    fn device(&self) -> &Device<B>;
}

impl<B: Backend> HasDevice<B> for Device<B> {
    fn device(&self) -> &Device<B> {
        self
    }
}
