//! CPU/GPU synchronization primitives.
//!
//! This module provides the completion token minted for every submitted batch
//! of GPU work and the user-facing fence built on top of it.
//!
//! # Key Types
//!
//! - [`Submission`]: a single-use, thread-safe completion token. Cloning it is
//!   cheap; every clone observes the same status.
//! - [`SubmissionStatus`]: the token's tri-state status.
//! - [`Fence`]: a rebindable wait handle snapshotting one submission.
//!
//! # Status lifecycle
//!
//! A submission's status moves exactly once:
//!
//! ```text
//! Pending ---> Success
//!    |
//!    +-------> Error
//! ```
//!
//! The transition is driven by the device's work-done callback. Both terminal
//! states are final; a second resolution attempt is ignored and logged. The
//! thread creating and reading tokens is usually not the one resolving them,
//! so the status lives behind a mutex paired with a condition variable for
//! blocking waiters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Status of one batch of submitted GPU work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    /// The device has not reported completion yet.
    Pending,
    /// All work in the batch finished on the device.
    Success,
    /// The device reported a failure for the batch.
    Error,
}

/// Outcome of a bounded wait on a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The submission resolved to [`SubmissionStatus::Success`].
    Success,
    /// The submission resolved to [`SubmissionStatus::Error`].
    Error,
    /// The timeout elapsed with the submission still pending.
    TimedOut,
}

struct SubmissionShared {
    status: Mutex<SubmissionStatus>,
    condvar: Condvar,
}

/// Completion token for one batch of submitted GPU work.
///
/// A token is minted by [`Queue`](crate::Queue) each time a non-empty batch
/// is submitted, and resolved exactly once by the device's work-done
/// callback. It is shared by everything interested in that batch:
/// staging-pool entries waiting to recycle their buffers, and any [`Fence`]
/// bound to it.
///
/// Equality is handle identity: two tokens compare equal when they observe
/// the same submission, not when they currently hold the same status.
#[derive(Clone)]
pub struct Submission {
    shared: Arc<SubmissionShared>,
}

impl Submission {
    fn with_status(status: SubmissionStatus) -> Self {
        Self {
            shared: Arc::new(SubmissionShared {
                status: Mutex::new(status),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Creates a token in the [`Pending`](SubmissionStatus::Pending) state.
    pub fn new() -> Self {
        Self::with_status(SubmissionStatus::Pending)
    }

    /// Creates a pre-satisfied token.
    ///
    /// Used where "everything up to now" must be waitable before any work was
    /// ever submitted: the fresh queue manager's latest token and unbound
    /// fences.
    pub fn completed() -> Self {
        Self::with_status(SubmissionStatus::Success)
    }

    /// Returns the current status without blocking.
    pub fn status(&self) -> SubmissionStatus {
        *self.shared.status.lock()
    }

    /// Returns `true` once the token reached a terminal status.
    pub fn is_resolved(&self) -> bool {
        self.status() != SubmissionStatus::Pending
    }

    /// Resolves the token to a terminal status and wakes all waiters.
    ///
    /// Called by the device's work-done callback. The first resolution wins;
    /// later attempts are ignored and logged, so the status never regresses.
    ///
    /// # Panics
    ///
    /// Panics if `status` is [`SubmissionStatus::Pending`].
    pub fn resolve(&self, status: SubmissionStatus) {
        assert!(
            status != SubmissionStatus::Pending,
            "a submission resolves to Success or Error"
        );
        let mut current = self.shared.status.lock();
        if *current != SubmissionStatus::Pending {
            tracing::warn!(
                current = ?*current,
                attempted = ?status,
                "ignoring repeated resolution of a submission"
            );
            return;
        }
        *current = status;
        self.shared.condvar.notify_all();
    }

    /// Blocks the calling thread until the token resolves.
    ///
    /// Completion is only delivered while somebody pumps the device, so a
    /// thread that is itself responsible for pumping must use
    /// [`Queue::finish`](crate::Queue::finish) instead of parking here.
    pub fn wait(&self) -> SubmissionStatus {
        let mut status = self.shared.status.lock();
        while *status == SubmissionStatus::Pending {
            self.shared.condvar.wait(&mut status);
        }
        *status
    }

    /// Blocks until the token resolves or `timeout` elapses.
    ///
    /// A timeout is reported as the distinguished [`WaitResult::TimedOut`],
    /// never as success or error.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        while *status == SubmissionStatus::Pending {
            if self
                .shared
                .condvar
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                break;
            }
        }
        match *status {
            SubmissionStatus::Pending => WaitResult::TimedOut,
            SubmissionStatus::Success => WaitResult::Success,
            SubmissionStatus::Error => WaitResult::Error,
        }
    }
}

impl Default for Submission {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Submission {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}
impl Eq for Submission {}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Submission").field(&self.status()).finish()
    }
}

/// A user-facing wait handle over one submission snapshot.
///
/// A fence does not track "whatever is latest": it observes the exact
/// [`Submission`] it was last bound to, typically captured from
/// [`Queue::latest_submission`](crate::Queue::latest_submission) right after
/// a flush. Multiple fences may share one submission.
///
/// A freshly created fence is bound to a pre-satisfied submission, so
/// waiting on it before any work was submitted returns immediately.
#[derive(Debug, Clone)]
pub struct Fence {
    submission: Submission,
}

impl Fence {
    /// Creates a fence bound to a pre-satisfied submission.
    pub fn new() -> Self {
        Self {
            submission: Submission::completed(),
        }
    }

    /// Replaces the submission this fence observes.
    pub fn bind(&mut self, submission: Submission) {
        self.submission = submission;
    }

    /// Returns the bound submission.
    pub fn submission(&self) -> &Submission {
        &self.submission
    }

    /// Returns the bound submission's status without blocking.
    pub fn status(&self) -> SubmissionStatus {
        self.submission.status()
    }

    /// Blocks until the bound submission resolves or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        self.submission.wait_timeout(timeout)
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}
