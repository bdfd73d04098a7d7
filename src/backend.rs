//! Backend implementations of the [`hal`](crate::hal) traits.
//!
//! - [`webgpu`]: the production backend, running on a [`wgpu`] device.
//! - [`noop`]: a CPU-only backend that executes copies in process memory,
//!   used by this crate's own tests and available for downstream tests that
//!   should not require a GPU.

pub mod noop;
pub mod webgpu;
