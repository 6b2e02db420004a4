//! Approval gates
//!
//! A gate is a one-shot synchronization point: the run's background task
//! awaits the receiving half while external callers race to resolve the
//! sending half. The first resolution wins; every later attempt is a no-op
//! that reports `false`. Safe to resolve from any thread.

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::retry::RetryResolution;

/// Resolution of an approval gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Phase accepted
    Approved,
    /// Phase rejected, run stops
    Rejected { reason: Option<String> },
    /// Run cancelled while parked
    Cancelled,
}

/// Resolution of a retry gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Caller picked a retry strategy
    Resolved(RetryResolution),
    /// Run cancelled while parked
    Cancelled,
}

/// One-shot gate guarding a single phase transition
#[derive(Debug)]
pub struct Gate<T> {
    /// Phase this gate guards; approve/reject calls must name it
    phase: String,
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Gate<T> {
    /// Open a gate for a phase, returning the receiving half the run task
    /// awaits
    pub fn open(phase: &str) -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                phase: phase.to_string(),
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Phase this gate guards
    pub fn phase(&self) -> &str {
        &self.phase
    }

    /// Resolve the gate. Returns true only for the call that actually
    /// delivered the outcome; later calls (or calls after the awaiting task
    /// went away) return false.
    pub fn resolve(&self, outcome: T) -> bool {
        match self.sender.lock().take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// True once a resolution was taken
    pub fn is_resolved(&self) -> bool {
        self.sender.lock().is_none()
    }
}
