//! Per-phase execution
//!
//! Runs one phase through its lifecycle on the sequencer's task:
//! dispatch the action, park on the approval gate (unless auto-approving),
//! and classify the terminal outcome. All status writes happen here or in
//! the sequencer, never from approval callers.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::context::ExecutionContext;
use super::descriptor::PhaseSpec;
use super::gate::ApprovalOutcome;
use super::retry::FailureReport;
use crate::actions::{ActionContext, PhaseAction, PhaseOutcome};
use crate::notify::Notifier;

/// How a single phase ended, as seen by the sequencer loop
#[derive(Debug)]
pub enum PhaseResult {
    /// Approved (or auto-approved) and marked `Completed`
    Completed,
    /// Output rejected; the phase is `Skipped` and the run stops
    Rejected { reason: Option<String> },
    /// Retry-eligible phase produced a structured failure; the sequencer
    /// routes this into the retry coordinator instead of failing the run
    FailureSignal(FailureReport),
    /// Unrecoverable failure; the phase is marked `Failed`
    Failed { error: String },
    /// Cancellation observed; the phase keeps its last state
    Cancelled,
}

/// Executes one phase against an execution context
pub struct PhaseRunner {
    notifier: Arc<dyn Notifier>,
}

impl PhaseRunner {
    /// Create a runner that reports transitions through `notifier`
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Run one phase to a terminal outcome.
    ///
    /// Cancellation is checked before dispatch; a cancel arriving later is
    /// observed through the gate or the action's own cancellation checks.
    pub async fn run_phase(
        &self,
        ctx: &ExecutionContext,
        spec: &PhaseSpec,
        action: Arc<dyn PhaseAction>,
    ) -> PhaseResult {
        if ctx.is_cancelled() {
            return PhaseResult::Cancelled;
        }

        let phase = spec.id.as_str();
        let attempt = ctx.update(|status| {
            status.start_phase(phase);
            status.phase(phase).map(|p| p.attempts).unwrap_or(1)
        });

        info!(workflow = %ctx.id(), phase, attempt, "phase started");
        let started = format!("{} started", spec.title());
        if let Err(e) = self.notifier.phase_started(ctx.id(), phase, &started).await {
            warn!(workflow = %ctx.id(), phase, error = %e, "phase_started notification failed");
        }

        let action_ctx = ActionContext::new(
            ctx.id(),
            phase,
            attempt,
            ctx.take_fix_tasks(),
            ctx.cancellation_handle(),
        );

        let outcome = match action.run(action_ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if ctx.is_cancelled() {
                    debug!(workflow = %ctx.id(), phase, "action unwound after cancel");
                    return PhaseResult::Cancelled;
                }
                return self.handle_error(ctx, spec, e.to_string()).await;
            }
        };

        match outcome {
            PhaseOutcome::Failure(report) => {
                if ctx.is_cancelled() {
                    return PhaseResult::Cancelled;
                }
                if spec.retry.is_some() {
                    PhaseResult::FailureSignal(report)
                } else {
                    self.handle_error(ctx, spec, report.error).await
                }
            }
            PhaseOutcome::Success { result, message } => {
                self.await_approval(ctx, spec, result, message).await
            }
        }
    }

    /// Park the phase at `WaitingApproval` and resolve it, either by
    /// short-circuiting (auto-approve, no gate created) or by awaiting
    /// the approval gate.
    async fn await_approval(
        &self,
        ctx: &ExecutionContext,
        spec: &PhaseSpec,
        result: Option<serde_json::Value>,
        message: Option<String>,
    ) -> PhaseResult {
        let phase = spec.id.as_str();
        let note = message
            .clone()
            .unwrap_or_else(|| format!("{} awaiting approval", spec.title()));

        ctx.update(|status| status.waiting_approval(phase, message, result.clone()));
        if let Err(e) = self
            .notifier
            .phase_pending_approval(ctx.id(), phase, &note, result.as_ref())
            .await
        {
            warn!(workflow = %ctx.id(), phase, error = %e, "pending_approval notification failed");
        }

        if ctx.auto_approve() {
            self.complete(ctx, phase, format!("{} auto-approved", spec.title()))
                .await;
            return PhaseResult::Completed;
        }

        debug!(workflow = %ctx.id(), phase, "awaiting approval");
        let rx = ctx.open_approval_gate(phase);
        // A cancel can land between the park and the gate opening; its
        // gate resolution would hit a closed slot, so re-check the flag.
        if ctx.is_cancelled() {
            ctx.close_gate();
            return PhaseResult::Cancelled;
        }
        let outcome = rx.await;
        ctx.close_gate();

        match outcome {
            Ok(ApprovalOutcome::Approved) => {
                self.complete(ctx, phase, format!("{} approved", spec.title()))
                    .await;
                PhaseResult::Completed
            }
            Ok(ApprovalOutcome::Rejected { reason }) => {
                let note = reason
                    .clone()
                    .unwrap_or_else(|| format!("{} rejected", spec.title()));
                ctx.update(|status| status.skip_phase(phase, Some(note.clone())));
                ctx.set_rejection(reason.clone());
                info!(workflow = %ctx.id(), phase, "phase rejected");
                if let Err(e) = self.notifier.phase_failed(ctx.id(), phase, &note).await {
                    warn!(workflow = %ctx.id(), phase, error = %e, "phase_failed notification failed");
                }
                PhaseResult::Rejected { reason }
            }
            // Cancelled outcome, or the gate vanished with the context
            Ok(ApprovalOutcome::Cancelled) | Err(_) => {
                debug!(workflow = %ctx.id(), phase, "approval wait cancelled");
                PhaseResult::Cancelled
            }
        }
    }

    /// Route an action error: retry-eligible phases hand back a failure
    /// signal, everything else marks the phase `Failed`.
    async fn handle_error(
        &self,
        ctx: &ExecutionContext,
        spec: &PhaseSpec,
        error: String,
    ) -> PhaseResult {
        let phase = spec.id.as_str();
        if let Some(policy) = &spec.retry {
            return PhaseResult::FailureSignal(FailureReport::new(policy.reason, error));
        }

        ctx.update(|status| status.fail_phase(phase, &error));
        if let Err(e) = self.notifier.phase_failed(ctx.id(), phase, &error).await {
            warn!(workflow = %ctx.id(), phase, error = %e, "phase_failed notification failed");
        }
        PhaseResult::Failed { error }
    }

    async fn complete(&self, ctx: &ExecutionContext, phase: &str, note: String) {
        ctx.update(|status| status.complete_phase(phase, None));
        info!(workflow = %ctx.id(), phase, "phase completed");
        if let Err(e) = self.notifier.phase_completed(ctx.id(), phase, &note).await {
            warn!(workflow = %ctx.id(), phase, error = %e, "phase_completed notification failed");
        }
    }
}
