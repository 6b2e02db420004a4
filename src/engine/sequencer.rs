//! Workflow sequencing
//!
//! One background task per active workflow drives the phase list in
//! descriptor order. That task is the only writer of the workflow's
//! status; approve/reject/cancel calls from other threads touch the run
//! solely through its gates and cancellation flag. Status is saved at
//! every terminal phase transition, at retry parks, and at completion,
//! so partial progress is never silently discarded.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::context::ExecutionContext;
use super::descriptor::{PhaseDescriptor, PhaseSpec};
use super::gate::{ApprovalOutcome, RetryOutcome};
use super::registry::ExecutionRegistry;
use super::retry::{FailureReport, RetryCoordinator, RetryResolution};
use super::runner::{PhaseResult, PhaseRunner};
use super::status::{PhaseState, WorkflowStatus};
use crate::actions::ActionSet;
use crate::notify::Notifier;
use crate::store::StatusStore;
use crate::{Error, Result};

/// What the loop does after a retry park resolves
enum RetryStep {
    /// Re-enter the loop at an earlier phase index
    Rewind(usize),
    /// Move past the skipped phase
    Continue,
    /// The run ended; registry cleanup already happened
    Stop,
}

/// Drives workflows through an ordered phase list with approval gates.
///
/// Cheap to clone; clones share the registry, store, and notifier, so a
/// clone handed to a signal handler can cancel runs started elsewhere.
#[derive(Clone)]
pub struct Sequencer {
    descriptor: Arc<PhaseDescriptor>,
    registry: Arc<ExecutionRegistry>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn StatusStore>,
    coordinator: RetryCoordinator,
}

impl Sequencer {
    /// Create a sequencer for one phase descriptor
    pub fn new(
        descriptor: PhaseDescriptor,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn StatusStore>,
    ) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            registry: Arc::new(ExecutionRegistry::new()),
            notifier,
            store,
            coordinator: RetryCoordinator,
        }
    }

    /// The phase descriptor this sequencer runs
    pub fn descriptor(&self) -> &PhaseDescriptor {
        &self.descriptor
    }

    /// Ids with a live background task
    pub fn active_ids(&self) -> Vec<String> {
        self.registry.active_ids()
    }

    /// Start a workflow on its own background task.
    ///
    /// Fails with [`Error::AlreadyRunning`] when the id is already
    /// registered, and with [`Error::InvalidState`] when `actions` does
    /// not cover every descriptor phase. Returns the initial status
    /// snapshot; progress is observed via [`Sequencer::status`].
    pub async fn start(
        &self,
        workflow_id: &str,
        actions: ActionSet,
        auto_approve: bool,
    ) -> Result<WorkflowStatus> {
        self.check_actions(&actions)?;

        let status = WorkflowStatus::new(workflow_id, &self.descriptor);
        let ctx = Arc::new(ExecutionContext::new(status, auto_approve));
        if !self.registry.try_register(ctx.clone()) {
            return Err(Error::AlreadyRunning(workflow_id.to_string()));
        }

        info!(
            workflow = %workflow_id,
            descriptor = %self.descriptor.name(),
            auto_approve,
            "workflow started"
        );
        if let Err(e) = self.notifier.workflow_list_changed().await {
            warn!(error = %e, "workflow_list_changed notification failed");
        }

        let snapshot = ctx.snapshot();
        let this = self.clone();
        tokio::spawn(async move {
            this.run_loop(ctx, actions, 0).await;
        });
        Ok(snapshot)
    }

    /// Re-enter a workflow parked at `WaitingRetryApproval` after an
    /// out-of-band manual fix. Execution restarts at the parked phase;
    /// its attempt counter carries over, so the retry budget still holds.
    pub async fn resume(
        &self,
        workflow_id: &str,
        actions: ActionSet,
        auto_approve: bool,
    ) -> Result<WorkflowStatus> {
        self.check_actions(&actions)?;

        let stored = self
            .store
            .load(workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;

        let phase = stored
            .phases
            .iter()
            .find(|p| p.state == PhaseState::WaitingRetryApproval)
            .map(|p| p.phase.clone())
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "workflow '{}' is not parked for a manual fix",
                    workflow_id
                ))
            })?;
        let index = self.descriptor.index_of(&phase).ok_or_else(|| {
            Error::InvalidState(format!(
                "parked phase '{}' is not in descriptor '{}'",
                phase,
                self.descriptor.name()
            ))
        })?;

        let mut status = stored;
        status.running = true;
        status.clear_retry();

        let ctx = Arc::new(ExecutionContext::new(status, auto_approve));
        if !self.registry.try_register(ctx.clone()) {
            return Err(Error::AlreadyRunning(workflow_id.to_string()));
        }

        info!(workflow = %workflow_id, phase = %phase, "workflow resumed");
        if let Err(e) = self.notifier.workflow_list_changed().await {
            warn!(error = %e, "workflow_list_changed notification failed");
        }

        let snapshot = ctx.snapshot();
        let this = self.clone();
        tokio::spawn(async move {
            this.run_loop(ctx, actions, index).await;
        });
        Ok(snapshot)
    }

    /// Approve the phase currently parked on an approval gate.
    ///
    /// Returns `Ok(false)` when the named phase is not the one parked or
    /// the gate was already resolved; races are expected, callers re-poll
    /// status instead of treating `false` as an error.
    pub fn approve(&self, workflow_id: &str, phase: &str) -> Result<bool> {
        let ctx = self
            .registry
            .get(workflow_id)
            .ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;
        Ok(ctx.resolve_approval(phase, ApprovalOutcome::Approved))
    }

    /// Reject the phase currently parked on an approval gate, ending the
    /// run. Same race contract as [`Sequencer::approve`].
    pub fn reject(&self, workflow_id: &str, phase: &str, reason: Option<String>) -> Result<bool> {
        let ctx = self
            .registry
            .get(workflow_id)
            .ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;
        Ok(ctx.resolve_approval(phase, ApprovalOutcome::Rejected { reason }))
    }

    /// Resolve a retry park.
    ///
    /// `AutoFix` is refused with [`Error::RetryExhausted`] once the
    /// phase's automated budget is spent; `Abort` and `ManualFix` always
    /// remain valid.
    pub fn approve_retry(&self, workflow_id: &str, resolution: RetryResolution) -> Result<bool> {
        let ctx = self
            .registry
            .get(workflow_id)
            .ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;

        let phase = match ctx.parked_retry_phase() {
            Some(phase) => phase,
            None => return Ok(false),
        };

        if resolution == RetryResolution::AutoFix {
            if let Some(info) = ctx.snapshot().retry {
                if !self.coordinator.auto_fix_allowed(&info) {
                    return Err(Error::RetryExhausted {
                        id: workflow_id.to_string(),
                        attempt: info.attempt,
                        max_attempts: info.max_attempts,
                    });
                }
            }
        }

        Ok(ctx.resolve_retry(&phase, RetryOutcome::Resolved(resolution)))
    }

    /// Request cooperative cancellation.
    ///
    /// The background task observes the flag at the next phase boundary
    /// (or through a resolved gate) and unwinds; the in-flight phase is
    /// never marked `Completed` or `Failed`.
    pub fn cancel(&self, workflow_id: &str) -> Result<()> {
        let ctx = self
            .registry
            .get(workflow_id)
            .ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;
        ctx.cancel();
        info!(workflow = %workflow_id, "cancellation requested");
        Ok(())
    }

    /// Status snapshot: live for active runs, last saved otherwise
    pub async fn status(&self, workflow_id: &str) -> Result<WorkflowStatus> {
        if let Some(ctx) = self.registry.get(workflow_id) {
            return Ok(ctx.snapshot());
        }
        self.store
            .load(workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound(workflow_id.to_string()))
    }

    /// All known statuses, live snapshots overriding stored ones,
    /// newest first
    pub async fn list(&self) -> Result<Vec<WorkflowStatus>> {
        let mut statuses = self.store.list().await?;
        for id in self.registry.active_ids() {
            if let Some(ctx) = self.registry.get(&id) {
                let live = ctx.snapshot();
                match statuses.iter_mut().find(|s| s.id == live.id) {
                    Some(slot) => *slot = live,
                    None => statuses.push(live),
                }
            }
        }
        statuses.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(statuses)
    }

    fn check_actions(&self, actions: &ActionSet) -> Result<()> {
        for spec in self.descriptor.phases() {
            if !actions.contains(&spec.id) {
                return Err(Error::InvalidState(format!(
                    "no action registered for phase '{}'",
                    spec.id
                )));
            }
        }
        Ok(())
    }

    /// The per-workflow driver task. Sole writer of this run's status.
    async fn run_loop(self, ctx: Arc<ExecutionContext>, actions: ActionSet, mut index: usize) {
        let runner = PhaseRunner::new(self.notifier.clone());
        let id = ctx.id().to_string();

        while index < self.descriptor.len() {
            let spec = match self.descriptor.get(index) {
                Some(spec) => spec,
                None => break,
            };
            let action = match actions.get(&spec.id) {
                Some(action) => action,
                None => {
                    let message = format!("no action registered for phase '{}'", spec.id);
                    ctx.update(|status| {
                        status.fail_phase(&spec.id, &message);
                        status.finish();
                    });
                    self.save(&ctx).await;
                    self.finish_run(&id).await;
                    error!(workflow = %id, phase = %spec.id, "run failed: missing action");
                    return;
                }
            };

            match runner.run_phase(&ctx, spec, action).await {
                PhaseResult::Completed => {
                    self.save(&ctx).await;
                    index += 1;
                }
                PhaseResult::Rejected { reason } => {
                    ctx.update(|status| status.finish());
                    self.save(&ctx).await;
                    self.finish_run(&id).await;
                    info!(
                        workflow = %id,
                        phase = %spec.id,
                        reason = reason.as_deref().unwrap_or("none given"),
                        "run stopped on rejection"
                    );
                    return;
                }
                PhaseResult::Failed { error } => {
                    ctx.update(|status| status.finish());
                    self.save(&ctx).await;
                    self.finish_run(&id).await;
                    error!(workflow = %id, phase = %spec.id, error = %error, "run failed");
                    return;
                }
                PhaseResult::Cancelled => {
                    self.stop_run(&ctx).await;
                    info!(workflow = %id, "run cancelled");
                    return;
                }
                PhaseResult::FailureSignal(report) => {
                    match self.park_for_retry(&ctx, spec, report).await {
                        RetryStep::Rewind(rewind) => index = rewind,
                        RetryStep::Continue => index += 1,
                        RetryStep::Stop => return,
                    }
                }
            }
        }

        ctx.update(|status| status.complete());
        self.save(&ctx).await;
        self.finish_run(&id).await;
        info!(workflow = %id, "workflow completed");
    }

    /// Park a failed retry-eligible phase and apply the caller's
    /// resolution once it arrives.
    async fn park_for_retry(
        &self,
        ctx: &ExecutionContext,
        spec: &PhaseSpec,
        report: FailureReport,
    ) -> RetryStep {
        let phase = spec.id.as_str();
        let attempt = ctx
            .snapshot()
            .phase(phase)
            .map(|p| p.attempts)
            .unwrap_or(1);

        let info = self.coordinator.record(spec, attempt, report);
        let reason = info.reason;
        let error_note = info
            .last_error
            .clone()
            .unwrap_or_else(|| format!("{} failed", spec.title()));

        ctx.update(|status| status.waiting_retry(phase, info));
        self.save(ctx).await;
        warn!(
            workflow = %ctx.id(),
            phase,
            attempt,
            %reason,
            "phase failed, awaiting retry resolution"
        );
        if let Err(e) = self.notifier.phase_failed(ctx.id(), phase, &error_note).await {
            warn!(workflow = %ctx.id(), phase, error = %e, "phase_failed notification failed");
        }

        let rx = ctx.open_retry_gate(phase);
        // Same window as the approval gate: a cancel landing before the
        // gate opened could not resolve it.
        if ctx.is_cancelled() {
            ctx.close_gate();
            self.stop_run(ctx).await;
            info!(workflow = %ctx.id(), "run cancelled");
            return RetryStep::Stop;
        }
        let outcome = rx.await;
        ctx.close_gate();

        match outcome {
            Ok(RetryOutcome::Resolved(RetryResolution::AutoFix)) => {
                let rewind = match self.coordinator.rewind_index(&self.descriptor, phase) {
                    Ok(rewind) => rewind,
                    Err(e) => {
                        ctx.update(|status| {
                            status.fail_phase(phase, &e.to_string());
                            status.clear_retry();
                            status.finish();
                        });
                        self.save(ctx).await;
                        self.finish_run(ctx.id()).await;
                        error!(workflow = %ctx.id(), phase, error = %e, "auto-fix rewind failed");
                        return RetryStep::Stop;
                    }
                };

                let tasks = ctx
                    .snapshot()
                    .retry
                    .map(|r| r.fix_tasks)
                    .unwrap_or_default();
                ctx.seed_fix_tasks(tasks);
                ctx.update(|status| {
                    status.clear_retry();
                    status.reset_phases_from(rewind);
                });
                info!(
                    workflow = %ctx.id(),
                    phase,
                    rewind_to = %spec.retry.as_ref().map(|r| r.rewind_to.as_str()).unwrap_or(phase),
                    attempt,
                    "auto-fix accepted, rewinding"
                );
                RetryStep::Rewind(rewind)
            }
            Ok(RetryOutcome::Resolved(RetryResolution::ManualFix)) => {
                // Status stays parked at WaitingRetryApproval in the store;
                // a later resume() re-enters at this phase.
                ctx.update(|status| status.stop());
                self.save(ctx).await;
                self.finish_run(ctx.id()).await;
                info!(workflow = %ctx.id(), phase, "parked for manual fix");
                RetryStep::Stop
            }
            Ok(RetryOutcome::Resolved(RetryResolution::SkipTests)) => {
                let note = format!("Skipped: {} accepted by operator", reason);
                ctx.update(|status| {
                    status.skip_phase(phase, Some(note));
                    status.clear_retry();
                });
                self.save(ctx).await;
                warn!(workflow = %ctx.id(), phase, "failures accepted, phase skipped");
                RetryStep::Continue
            }
            Ok(RetryOutcome::Resolved(RetryResolution::Abort)) => {
                let message = format!("Aborted after attempt {}: {}", attempt, error_note);
                ctx.update(|status| {
                    status.fail_phase(phase, &message);
                    status.clear_retry();
                    status.finish();
                });
                self.save(ctx).await;
                self.finish_run(ctx.id()).await;
                info!(workflow = %ctx.id(), phase, "run aborted at retry gate");
                RetryStep::Stop
            }
            Ok(RetryOutcome::Cancelled) | Err(_) => {
                self.stop_run(ctx).await;
                info!(workflow = %ctx.id(), "run cancelled");
                RetryStep::Stop
            }
        }
    }

    /// Stop without an end timestamp and release the id (cancellation,
    /// manual-fix park)
    async fn stop_run(&self, ctx: &ExecutionContext) {
        ctx.update(|status| status.stop());
        self.save(ctx).await;
        self.finish_run(ctx.id()).await;
    }

    /// Persist the current snapshot. Store failures are logged, never
    /// fatal to the run.
    async fn save(&self, ctx: &ExecutionContext) {
        let status = ctx.snapshot();
        if let Err(e) = self.store.save(&status).await {
            warn!(workflow = %status.id, error = %e, "status save failed");
        }
    }

    async fn finish_run(&self, id: &str) {
        self.registry.remove(id);
        if let Err(e) = self.notifier.workflow_list_changed().await {
            warn!(error = %e, "workflow_list_changed notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::NoopAction;
    use crate::engine::descriptor::{PhaseSpec, PHASE_COMPLETED};
    use crate::notify::LogNotifier;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn descriptor() -> PhaseDescriptor {
        PhaseDescriptor::new(
            "review-train",
            vec![
                PhaseSpec::new("plan"),
                PhaseSpec::new("code"),
                PhaseSpec::new("review"),
            ],
        )
        .unwrap()
    }

    fn noop_actions() -> ActionSet {
        ActionSet::new()
            .register("plan", Arc::new(NoopAction::new()))
            .register("code", Arc::new(NoopAction::new()))
            .register("review", Arc::new(NoopAction::new()))
    }

    async fn wait_until(what: &str, check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_start_requires_action_for_every_phase() {
        let sequencer = Sequencer::new(
            descriptor(),
            Arc::new(LogNotifier),
            Arc::new(MemoryStore::new()),
        );
        let incomplete = ActionSet::new().register("plan", Arc::new(NoopAction::new()));

        let err = sequencer.start("wf-1", incomplete, true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(sequencer.active_ids().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected() {
        let sequencer = Sequencer::new(
            descriptor(),
            Arc::new(LogNotifier),
            Arc::new(MemoryStore::new()),
        );

        sequencer.start("wf-1", noop_actions(), false).await.unwrap();
        let err = sequencer
            .start("wf-1", noop_actions(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn test_auto_approve_run_completes_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let sequencer = Sequencer::new(descriptor(), Arc::new(LogNotifier), store.clone());

        let status = sequencer.start("wf-1", noop_actions(), true).await.unwrap();
        assert!(status.running);

        wait_until("run to finish", || sequencer.active_ids().is_empty()).await;

        let done = sequencer.status("wf-1").await.unwrap();
        assert!(done.is_complete());
        assert!(!done.running);
        assert_eq!(done.current_phase, PHASE_COMPLETED);
        assert!(done.completed_at.is_some());
        assert!(done.phases.iter().all(|p| p.attempts == 1));
    }

    #[tokio::test]
    async fn test_status_unknown_id() {
        let sequencer = Sequencer::new(
            descriptor(),
            Arc::new(LogNotifier),
            Arc::new(MemoryStore::new()),
        );
        let err = sequencer.status("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_approve_unknown_id() {
        let sequencer = Sequencer::new(
            descriptor(),
            Arc::new(LogNotifier),
            Arc::new(MemoryStore::new()),
        );
        let err = sequencer.approve("missing", "plan").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
