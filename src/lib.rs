//! Fermata: approval-gated phase sequencing
//!
//! Drives long-running, multi-phase workflows (agent-backed development
//! pipelines) where each phase's output must be confirmed by a human before
//! the next phase begins. A workflow runs on its own background task, parks
//! on a one-shot gate while waiting for approval, and supports
//! auto-approval, cooperative cancellation, and bounded retry with
//! structured diagnostics when a phase reports build/test failures.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Sequencer                     │
//! │  start / approve / reject / cancel / resume   │
//! └──────────┬────────────────────▲──────────────┘
//!            ▼                    │ resolve
//! ┌────────────────────┐  ┌───────┴──────────────┐
//! │   Phase Runner      │  │   Approval Gates     │
//! │  pending → running  │──│  one-shot, first     │
//! │  → waiting → done   │  │  resolution wins     │
//! └──────────┬─────────┘  └──────────────────────┘
//!            ▼
//! ┌────────────────────┐
//! │  Execution Registry │  one active run per id
//! └────────────────────┘
//! ```
//!
//! Phase actions, notification delivery, and persistence are supplied by the
//! caller through the [`PhaseAction`], [`Notifier`], and [`StatusStore`]
//! ports.

pub mod actions;
pub mod config;
pub mod engine;
pub mod notify;
pub mod store;

// Re-exports for convenience
pub use actions::{ActionContext, ActionSet, CommandAction, PhaseAction, PhaseOutcome};
pub use config::{dev_pipeline, spec_wizard, Config, WorkflowFile};
pub use engine::{
    FailureReport, FixTask, FixTaskKind, PhaseDescriptor, PhaseSpec, PhaseState, PhaseStatus,
    RetryInfo, RetryPolicy, RetryReason, RetryResolution, Sequencer, TestResult, TestSummary,
    WorkflowStatus,
};
pub use notify::{LogNotifier, MultiNotifier, Notifier};
pub use store::{FileStore, MemoryStore, StatusStore};

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Workflow {0} is already running")]
    AlreadyRunning(String),

    #[error("Workflow {0} not found")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Phase action failed: {0}")]
    PhaseAction(String),

    #[error("Retry budget exhausted for workflow {id}: attempt {attempt} exceeds {max_attempts} automated retries")]
    RetryExhausted {
        id: String,
        attempt: u32,
        max_attempts: u32,
    },

    #[error("Workflow {0} was cancelled")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
