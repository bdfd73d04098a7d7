//! Error types shared across the crate.
//!
//! The subsystem distinguishes three failure classes: caller bugs (checked with
//! assertions at the call site, not represented here), allocation failures that
//! the caller must handle ([`DeviceError`]), and asynchronous completion
//! failures that are reported through callbacks and submission status
//! ([`MapError`], [`SubmitError`]).

use thiserror::Error;

/// A failure reported by the device while creating a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The device could not satisfy the allocation.
    #[error("not enough memory left")]
    OutOfMemory,
    /// The device connection is gone; no further resources can be created.
    #[error("device is lost")]
    Lost,
}

/// A failure reported by an asynchronous buffer map request.
///
/// Delivered through the map callback. The operation that needed the mapped
/// memory is abandoned; see the crate-level error policy notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// The request was cancelled before it could complete, for example
    /// because the device was torn down.
    #[error("buffer map request was cancelled")]
    Cancelled,
    /// The device failed the request.
    #[error("buffer map request failed")]
    Failed,
}

/// The mapped range of a buffer could not be produced even though the buffer
/// is nominally mapped.
///
/// Some platforms report a successful map but hand back no usable pointer
/// until previously submitted work referencing the buffer has drained. Write
/// paths treat this as "not mapped yet" and fall back to an asynchronous map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("mapped range unavailable")]
pub struct MapAccessError;

/// The device rejected or failed a submitted command batch.
///
/// Surfaces only as the terminal `Error` status of the submission's
/// completion token; the batch is not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("device rejected the submission")]
pub struct SubmitError;
