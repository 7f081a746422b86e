//! Request lifecycle in both directions.
//!
//! A [`LocalOperation`] services a request the peer sent us; a
//! [`RemoteOperation`] waits for the answer to a request we sent. Both embed
//! the same [`Bookkeeping`]: the correlation id, a one-way state machine and
//! the inconsistency counter driven by the consistency monitor.

mod local;
mod remote;

pub use local::{LocalOperation, OperationScope};
pub use remote::{RemoteCall, RemoteKind, RemoteOperation, RemoteReply, RemoteRequest};

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use tether_core::RequestId;

/// Lifecycle state shared by both operation kinds.
///
/// `Pending` is the only non-terminal state; there is no path back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationState {
    /// Created, no terminal message exchanged yet.
    Pending = 0,
    /// Finished with a result.
    Completed = 1,
    /// Finished with an error.
    Failed = 2,
    /// Stopped before finishing.
    Cancelled = 3,
}

impl OperationState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Completed,
            2 => Self::Failed,
            3 => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// Correlation and consistency bookkeeping embedded in every operation.
#[derive(Debug)]
pub struct Bookkeeping {
    request_id: RequestId,
    state: AtomicU8,
    misses: AtomicU32,
    threshold: u32,
}

impl Bookkeeping {
    /// Fresh pending bookkeeping.
    pub fn new(request_id: RequestId, threshold: u32) -> Self {
        Self {
            request_id,
            state: AtomicU8::new(OperationState::Pending as u8),
            misses: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    /// Correlation id.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Current state.
    pub fn state(&self) -> OperationState {
        OperationState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `Pending` to `to`. Only the first terminal transition wins.
    pub fn finish(&self, to: OperationState) -> bool {
        debug_assert!(to.is_terminal());
        self.state
            .compare_exchange(
                OperationState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Record one unmatched consistency tick; returns the new count.
    pub fn record_miss(&self) -> u32 {
        self.misses.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The peer confirmed the operation; the miss streak starts over.
    pub fn reset_misses(&self) {
        self.misses.store(0, Ordering::Release);
    }

    /// Current miss streak.
    pub fn misses(&self) -> u32 {
        self.misses.load(Ordering::Acquire)
    }

    /// Whether the miss streak is still below the threshold.
    pub fn is_consistent(&self) -> bool {
        self.misses() < self.threshold
    }
}
