//! Execution context
//!
//! One context per active run. It owns the status cell (written only by the
//! run's own task), the currently open gate (if parked), and the
//! cancellation flag. Approve/reject/cancel callers on other threads touch
//! nothing but the gate and the flag.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::gate::{ApprovalOutcome, Gate, RetryOutcome};
use super::retry::FixTask;
use super::status::WorkflowStatus;

enum GateSlot {
    Closed,
    Approval(Arc<Gate<ApprovalOutcome>>),
    Retry(Arc<Gate<RetryOutcome>>),
}

/// Shared state of one workflow run
pub struct ExecutionContext {
    id: String,
    auto_approve: bool,
    status: RwLock<WorkflowStatus>,
    gate: Mutex<GateSlot>,
    cancelled: Arc<AtomicBool>,
    last_rejection: Mutex<Option<String>>,
    fix_seed: Mutex<Vec<FixTask>>,
}

impl ExecutionContext {
    /// Create a context around a fresh (or resumed) status
    pub fn new(status: WorkflowStatus, auto_approve: bool) -> Self {
        Self {
            id: status.id.clone(),
            auto_approve,
            status: RwLock::new(status),
            gate: Mutex::new(GateSlot::Closed),
            cancelled: Arc::new(AtomicBool::new(false)),
            last_rejection: Mutex::new(None),
            fix_seed: Mutex::new(Vec::new()),
        }
    }

    /// Workflow id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// True when phases complete without gates
    pub fn auto_approve(&self) -> bool {
        self.auto_approve
    }

    /// Status snapshot by value; readers never hold the lock past the clone
    pub fn snapshot(&self) -> WorkflowStatus {
        self.status.read().clone()
    }

    /// Mutate the status. Only the run's own task may call this.
    pub fn update<R>(&self, f: impl FnOnce(&mut WorkflowStatus) -> R) -> R {
        f(&mut self.status.write())
    }

    /// Open an approval gate for a phase and return the half to await
    pub fn open_approval_gate(&self, phase: &str) -> oneshot::Receiver<ApprovalOutcome> {
        let (gate, rx) = Gate::open(phase);
        *self.gate.lock() = GateSlot::Approval(Arc::new(gate));
        rx
    }

    /// Open a retry gate for a phase and return the half to await
    pub fn open_retry_gate(&self, phase: &str) -> oneshot::Receiver<RetryOutcome> {
        let (gate, rx) = Gate::open(phase);
        *self.gate.lock() = GateSlot::Retry(Arc::new(gate));
        rx
    }

    /// Drop the open gate after the run task wakes
    pub fn close_gate(&self) {
        *self.gate.lock() = GateSlot::Closed;
    }

    /// Resolve the approval gate iff one is open for exactly this phase.
    /// Anything else is a no-op returning false.
    pub fn resolve_approval(&self, phase: &str, outcome: ApprovalOutcome) -> bool {
        let gate = match &*self.gate.lock() {
            GateSlot::Approval(g) if g.phase() == phase => g.clone(),
            _ => return false,
        };
        gate.resolve(outcome)
    }

    /// Resolve the retry gate iff one is open for exactly this phase
    pub fn resolve_retry(&self, phase: &str, outcome: RetryOutcome) -> bool {
        let gate = match &*self.gate.lock() {
            GateSlot::Retry(g) if g.phase() == phase => g.clone(),
            _ => return false,
        };
        gate.resolve(outcome)
    }

    /// The retry record's attempt budget check needs the parked gate's phase
    pub fn parked_retry_phase(&self) -> Option<String> {
        match &*self.gate.lock() {
            GateSlot::Retry(g) => Some(g.phase().to_string()),
            _ => None,
        }
    }

    /// Signal cancellation and wake the parked task, if any. The run task
    /// observes the flag at the next phase boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);

        let slot = self.gate.lock();
        match &*slot {
            GateSlot::Approval(g) => {
                g.resolve(ApprovalOutcome::Cancelled);
            }
            GateSlot::Retry(g) => {
                g.resolve(RetryOutcome::Cancelled);
            }
            GateSlot::Closed => {}
        }
    }

    /// True once cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Shared handle actions can poll inside bounded loops
    pub fn cancellation_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Record why the run was rejected
    pub fn set_rejection(&self, reason: Option<String>) {
        *self.last_rejection.lock() = reason;
    }

    /// Last rejection reason, if any
    pub fn last_rejection(&self) -> Option<String> {
        self.last_rejection.lock().clone()
    }

    /// Seed fix tasks for the next (rewound) run of the coding phase
    pub fn seed_fix_tasks(&self, tasks: Vec<FixTask>) {
        *self.fix_seed.lock() = tasks;
    }

    /// Take the seeded fix tasks, leaving the seed empty
    pub fn take_fix_tasks(&self) -> Vec<FixTask> {
        std::mem::take(&mut *self.fix_seed.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::descriptor::{PhaseDescriptor, PhaseSpec};
    use crate::engine::retry::{FixTask, FixTaskKind, RetryResolution};

    fn context() -> ExecutionContext {
        let descriptor = PhaseDescriptor::new(
            "test",
            vec![PhaseSpec::new("plan"), PhaseSpec::new("code")],
        )
        .unwrap();
        ExecutionContext::new(WorkflowStatus::new("wf-1", &descriptor), false)
    }

    #[tokio::test]
    async fn test_resolve_requires_matching_phase() {
        let ctx = context();
        let rx = ctx.open_approval_gate("plan");

        assert!(!ctx.resolve_approval("code", ApprovalOutcome::Approved));
        assert!(ctx.resolve_approval("plan", ApprovalOutcome::Approved));
        assert!(!ctx.resolve_approval("plan", ApprovalOutcome::Approved));

        assert_eq!(rx.await.unwrap(), ApprovalOutcome::Approved);
    }

    #[tokio::test]
    async fn test_approval_resolve_ignores_retry_gate() {
        let ctx = context();
        let _rx = ctx.open_retry_gate("code");

        assert!(!ctx.resolve_approval("code", ApprovalOutcome::Approved));
        assert!(ctx.resolve_retry(
            "code",
            RetryOutcome::Resolved(RetryResolution::Abort)
        ));
    }

    #[tokio::test]
    async fn test_cancel_wakes_parked_gate() {
        let ctx = Arc::new(context());
        let rx = ctx.open_approval_gate("plan");

        let canceller = ctx.clone();
        tokio::spawn(async move {
            canceller.cancel();
        });

        assert_eq!(rx.await.unwrap(), ApprovalOutcome::Cancelled);
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let ctx = context();
        let before = ctx.snapshot();

        ctx.update(|s| s.start_phase("plan"));

        assert_eq!(before.current_phase, "plan");
        assert_eq!(
            before.phase("plan").unwrap().state,
            crate::engine::status::PhaseState::Pending
        );
        assert_eq!(
            ctx.snapshot().phase("plan").unwrap().state,
            crate::engine::status::PhaseState::Running
        );
    }

    #[test]
    fn test_fix_seed_handoff() {
        let ctx = context();
        ctx.seed_fix_tasks(vec![FixTask::new(0, "fix the null check", FixTaskKind::TestFailure)]);

        let taken = ctx.take_fix_tasks();
        assert_eq!(taken.len(), 1);
        assert!(ctx.take_fix_tasks().is_empty());
    }
}
