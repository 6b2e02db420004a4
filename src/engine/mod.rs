//! The approval-gated sequencing engine
//!
//! One generic machine drives every workflow kind:
//!
//! - **Descriptor**: the ordered phase list for a workflow type, with
//!   per-phase retry policies
//! - **Status**: the per-run snapshot (phase states, timestamps, retry info)
//! - **Gate**: one-shot approval primitive a parked run suspends on
//! - **Context**: one run's status cell, gate slot, and cancellation handle
//! - **Registry**: concurrent id → context map, one active run per id
//! - **Runner**: executes a single phase through its state transitions
//! - **Retry**: diagnostics, attempt bookkeeping, and resolution strategies
//! - **Sequencer**: the public start/approve/reject/cancel/resume surface
//!
//! ## Phase lifecycle
//!
//! ```text
//! pending → running → waiting_approval → completed
//!                │            └─ reject → skipped (run stops)
//!                └─ failure → waiting_retry_approval
//!                     auto_fix → rewind   skip_tests → skipped
//!                     manual_fix → park   abort → failed
//! ```

pub mod context;
pub mod descriptor;
pub mod gate;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod sequencer;
pub mod status;

pub use context::ExecutionContext;
pub use descriptor::{PhaseDescriptor, PhaseSpec, RetryPolicy, PHASE_COMPLETED};
pub use gate::{ApprovalOutcome, Gate, RetryOutcome};
pub use registry::ExecutionRegistry;
pub use retry::{
    FailureReport, FixTask, FixTaskKind, RetryCoordinator, RetryInfo, RetryReason,
    RetryResolution, TestResult, TestSummary,
};
pub use runner::{PhaseResult, PhaseRunner};
pub use sequencer::Sequencer;
pub use status::{PhaseState, PhaseStatus, WorkflowStatus};
