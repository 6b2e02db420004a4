//! Workflow status
//!
//! The per-run snapshot: current phase, running flag, one record per phase
//! in descriptor order, and the retry record while parked. Only the run's
//! own background task mutates a status; everyone else reads clones, so a
//! reader can never observe a torn update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::descriptor::{PhaseDescriptor, PHASE_COMPLETED};
use super::retry::RetryInfo;

/// State of a single phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    /// Not yet started
    Pending,
    /// Action currently executing
    Running,
    /// Parked on an approval gate
    WaitingApproval,
    /// Parked on a retry gate after a failure
    WaitingRetryApproval,
    /// Approved and done
    Completed,
    /// Failed with an error
    Failed,
    /// Rejected or skipped past
    Skipped,
}

impl PhaseState {
    /// True for states a phase never leaves (within one run)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseState::Completed | PhaseState::Failed | PhaseState::Skipped
        )
    }

    /// True while the run is suspended waiting for a caller
    pub fn is_parked(&self) -> bool {
        matches!(
            self,
            PhaseState::WaitingApproval | PhaseState::WaitingRetryApproval
        )
    }
}

/// Per-phase record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseStatus {
    /// Phase id
    pub phase: String,
    /// Current state
    pub state: PhaseState,
    /// Message from the last transition (result note, rejection reason, error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Result payload the action produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// How many times the action has run (rewinds re-run phases)
    #[serde(default)]
    pub attempts: u32,
    /// When the phase last started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the phase reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PhaseStatus {
    fn new(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            state: PhaseState::Pending,
            message: None,
            result: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Aggregate status of one workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    /// Workflow id
    pub id: String,
    /// Workflow type name (descriptor name)
    pub workflow: String,
    /// Active phase id, or [`PHASE_COMPLETED`] after the last phase
    pub current_phase: String,
    /// True while the background task is alive
    pub running: bool,
    /// One record per descriptor phase, in execution order
    pub phases: Vec<PhaseStatus>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the status last changed
    pub updated_at: DateTime<Utc>,
    /// When the run ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Workflow-level error, set when a phase fails unrecoverably
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retry record while parked at `WaitingRetryApproval`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryInfo>,
}

impl WorkflowStatus {
    /// Create a fresh status with every phase `Pending`
    pub fn new(id: &str, descriptor: &PhaseDescriptor) -> Self {
        let now = Utc::now();
        let phases: Vec<PhaseStatus> = descriptor.ids().map(PhaseStatus::new).collect();
        let current_phase = phases
            .first()
            .map(|p| p.phase.clone())
            .unwrap_or_default();

        Self {
            id: id.to_string(),
            workflow: descriptor.name().to_string(),
            current_phase,
            running: true,
            phases,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            retry: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Record for a phase id
    pub fn phase(&self, phase: &str) -> Option<&PhaseStatus> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    fn phase_mut(&mut self, phase: &str) -> Option<&mut PhaseStatus> {
        self.phases.iter_mut().find(|p| p.phase == phase)
    }

    /// Start a phase: becomes the current phase, state `Running`, attempt
    /// counter bumped
    pub fn start_phase(&mut self, phase: &str) {
        self.current_phase = phase.to_string();
        self.touch();

        if let Some(p) = self.phase_mut(phase) {
            p.state = PhaseState::Running;
            p.started_at = Some(Utc::now());
            p.completed_at = None;
            p.attempts += 1;
        }
    }

    /// Park a phase on its approval gate, storing the action's result
    pub fn waiting_approval(
        &mut self,
        phase: &str,
        message: Option<String>,
        result: Option<serde_json::Value>,
    ) {
        self.touch();
        if let Some(p) = self.phase_mut(phase) {
            p.state = PhaseState::WaitingApproval;
            p.message = message;
            p.result = result;
        }
    }

    /// Park a phase on its retry gate with the retry record attached
    pub fn waiting_retry(&mut self, phase: &str, info: RetryInfo) {
        self.touch();
        if let Some(p) = self.phase_mut(phase) {
            p.state = PhaseState::WaitingRetryApproval;
            p.message = info.last_error.clone();
        }
        self.retry = Some(info);
    }

    /// Complete a phase
    pub fn complete_phase(&mut self, phase: &str, message: Option<String>) {
        self.touch();
        if let Some(p) = self.phase_mut(phase) {
            p.state = PhaseState::Completed;
            p.completed_at = Some(Utc::now());
            if message.is_some() {
                p.message = message;
            }
        }
    }

    /// Skip a phase (rejection or explicit risk acceptance)
    pub fn skip_phase(&mut self, phase: &str, reason: Option<String>) {
        self.touch();
        if let Some(p) = self.phase_mut(phase) {
            p.state = PhaseState::Skipped;
            p.completed_at = Some(Utc::now());
            p.message = reason;
        }
    }

    /// Fail a phase and record the workflow-level error
    pub fn fail_phase(&mut self, phase: &str, error: &str) {
        self.touch();
        self.error = Some(error.to_string());
        if let Some(p) = self.phase_mut(phase) {
            p.state = PhaseState::Failed;
            p.completed_at = Some(Utc::now());
            p.message = Some(error.to_string());
        }
    }

    /// Reset every phase from `index` onward back to `Pending` for a rewind.
    /// Attempt counters survive so the retry budget keeps counting.
    pub fn reset_phases_from(&mut self, index: usize) {
        self.touch();
        for p in self.phases.iter_mut().skip(index) {
            p.state = PhaseState::Pending;
            p.message = None;
            p.result = None;
            p.started_at = None;
            p.completed_at = None;
        }
    }

    /// Drop the retry record (a resolution was applied)
    pub fn clear_retry(&mut self) {
        self.retry = None;
        self.touch();
    }

    /// Mark the whole run complete
    pub fn complete(&mut self) {
        self.current_phase = PHASE_COMPLETED.to_string();
        self.running = false;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    /// Stop without an end timestamp (cancel, ManualFix park)
    pub fn stop(&mut self) {
        self.running = false;
        self.touch();
    }

    /// Stop with an end timestamp (rejection, unrecoverable failure)
    pub fn finish(&mut self) {
        self.running = false;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    /// True when every phase is `Completed` or `Skipped`
    pub fn is_complete(&self) -> bool {
        self.phases
            .iter()
            .all(|p| matches!(p.state, PhaseState::Completed | PhaseState::Skipped))
    }

    /// Coarse label for display
    pub fn state_label(&self) -> &'static str {
        if self.running {
            match self.phase(&self.current_phase).map(|p| p.state) {
                Some(PhaseState::WaitingApproval) => "waiting_approval",
                Some(PhaseState::WaitingRetryApproval) => "waiting_retry_approval",
                _ => "running",
            }
        } else if self.current_phase == PHASE_COMPLETED {
            "completed"
        } else if self.error.is_some() {
            "failed"
        } else {
            "stopped"
        }
    }

    /// Render the per-phase progress block
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Workflow: {} ({})", self.workflow, self.id),
            format!("Status: {}", self.state_label()),
            format!("Current: {}", self.current_phase),
            String::new(),
            "Phases:".to_string(),
        ];

        for p in &self.phases {
            let icon = match p.state {
                PhaseState::Pending => "⬜",
                PhaseState::Running => "🔄",
                PhaseState::WaitingApproval => "⏸️",
                PhaseState::WaitingRetryApproval => "🔁",
                PhaseState::Completed => "✅",
                PhaseState::Failed => "❌",
                PhaseState::Skipped => "⏭️",
            };
            let mut line = format!("  {} {}", icon, p.phase);
            if let Some(msg) = &p.message {
                line.push_str(&format!(" — {}", msg));
            }
            lines.push(line);
        }

        if let Some(retry) = &self.retry {
            lines.push(String::new());
            lines.push(format!(
                "Retry: {} attempt {} (budget {}), {}",
                retry.phase, retry.attempt, retry.max_attempts, retry.reason
            ));
            if let Some(summary) = &retry.test_summary {
                if summary.is_breaking_change {
                    lines.push(format!(
                        "  ⚠ breaking change: {} previously-passing test(s) now fail",
                        summary.existing_tests_failed
                    ));
                }
            }
        }

        if let Some(error) = &self.error {
            lines.push(format!("Error: {}", error));
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::descriptor::PhaseSpec;
    use crate::engine::retry::{FailureReport, RetryCoordinator, RetryReason};

    fn descriptor() -> PhaseDescriptor {
        PhaseDescriptor::new(
            "test",
            vec![
                PhaseSpec::new("plan"),
                PhaseSpec::new("code"),
                PhaseSpec::new("review"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_new_prepopulates_pending() {
        let status = WorkflowStatus::new("wf-1", &descriptor());

        assert_eq!(status.id, "wf-1");
        assert_eq!(status.current_phase, "plan");
        assert!(status.running);
        assert_eq!(status.phases.len(), 3);
        assert!(status
            .phases
            .iter()
            .all(|p| p.state == PhaseState::Pending));
    }

    #[test]
    fn test_phase_transitions() {
        let mut status = WorkflowStatus::new("wf-1", &descriptor());

        status.start_phase("plan");
        assert_eq!(status.phase("plan").unwrap().state, PhaseState::Running);
        assert_eq!(status.phase("plan").unwrap().attempts, 1);
        assert_eq!(status.current_phase, "plan");

        status.waiting_approval("plan", Some("done".into()), None);
        assert_eq!(
            status.phase("plan").unwrap().state,
            PhaseState::WaitingApproval
        );

        status.complete_phase("plan", None);
        assert_eq!(status.phase("plan").unwrap().state, PhaseState::Completed);
        assert!(status.phase("plan").unwrap().completed_at.is_some());
    }

    #[test]
    fn test_skip_records_reason() {
        let mut status = WorkflowStatus::new("wf-1", &descriptor());
        status.start_phase("code");
        status.skip_phase("code", Some("not good".into()));

        let code = status.phase("code").unwrap();
        assert_eq!(code.state, PhaseState::Skipped);
        assert_eq!(code.message.as_deref(), Some("not good"));
    }

    #[test]
    fn test_fail_sets_workflow_error() {
        let mut status = WorkflowStatus::new("wf-1", &descriptor());
        status.start_phase("plan");
        status.fail_phase("plan", "planner crashed");

        assert_eq!(status.phase("plan").unwrap().state, PhaseState::Failed);
        assert_eq!(status.error.as_deref(), Some("planner crashed"));
    }

    #[test]
    fn test_reset_keeps_attempts() {
        let mut status = WorkflowStatus::new("wf-1", &descriptor());
        status.start_phase("code");
        status.complete_phase("code", None);
        status.start_phase("review");

        status.reset_phases_from(1);

        let code = status.phase("code").unwrap();
        assert_eq!(code.state, PhaseState::Pending);
        assert_eq!(code.attempts, 1);
        assert!(code.started_at.is_none());
        let review = status.phase("review").unwrap();
        assert_eq!(review.state, PhaseState::Pending);
    }

    #[test]
    fn test_complete_sets_reserved_phase() {
        let mut status = WorkflowStatus::new("wf-1", &descriptor());
        status.complete();

        assert_eq!(status.current_phase, PHASE_COMPLETED);
        assert!(!status.running);
        assert!(status.completed_at.is_some());
        assert_eq!(status.state_label(), "completed");
    }

    #[test]
    fn test_waiting_retry_attaches_record() {
        let mut status = WorkflowStatus::new("wf-1", &descriptor());
        let spec = PhaseSpec::new("code");
        let info = RetryCoordinator.record(
            &spec,
            1,
            FailureReport::new(RetryReason::BuildFailed, "no compile"),
        );

        status.start_phase("code");
        status.waiting_retry("code", info);

        assert_eq!(
            status.phase("code").unwrap().state,
            PhaseState::WaitingRetryApproval
        );
        assert_eq!(status.retry.as_ref().unwrap().attempt, 1);
        assert_eq!(status.state_label(), "waiting_retry_approval");

        status.clear_retry();
        assert!(status.retry.is_none());
    }

    #[test]
    fn test_summary_lists_phases() {
        let mut status = WorkflowStatus::new("wf-1", &descriptor());
        status.start_phase("plan");
        let summary = status.summary();

        assert!(summary.contains("wf-1"));
        assert!(summary.contains("plan"));
        assert!(summary.contains("review"));
    }
}
