//! Retry diagnostics and resolution
//!
//! A retry-eligible phase that fails does not kill the run. The failure is
//! captured as a structured report (fix tasks, test summary), the phase
//! parks at `WaitingRetryApproval`, and the caller picks a resolution
//! strategy. Attempts are bounded: once a phase has burned its automated
//! budget, AutoFix is refused and only Abort or ManualFix remain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::descriptor::{PhaseDescriptor, PhaseSpec};
use crate::{Error, Result};

/// Why a retry-eligible phase failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    BuildFailed,
    TestsFailed,
    IntegrationFailed,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetryReason::BuildFailed => "build failed",
            RetryReason::TestsFailed => "tests failed",
            RetryReason::IntegrationFailed => "integration failed",
        };
        write!(f, "{}", s)
    }
}

/// Kind of defect a fix task addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixTaskKind {
    BuildError,
    TestFailure,
    IntegrationError,
}

/// One concrete fix to apply on the next automated attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixTask {
    /// Position in the fix list
    pub index: u32,
    /// Short title
    pub title: String,
    /// What to change and why
    pub description: String,
    /// Defect kind
    pub kind: FixTaskKind,
    /// File the fix targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Error message from the failing build/test
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Source location (file:line) if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Captured stack trace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    /// Suggested fix, when the diagnostic step produced one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

impl FixTask {
    /// Create a fix task with the required fields
    pub fn new(index: u32, title: impl Into<String>, kind: FixTaskKind) -> Self {
        Self {
            index,
            title: title.into(),
            description: String::new(),
            kind,
            file: None,
            error_message: None,
            location: None,
            stack_trace: None,
            suggested_fix: None,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the target file
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Set the captured error message
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Set the source location
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Set the stack trace
    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    /// Set a suggested fix
    pub fn with_suggested_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }
}

/// One failing test in a summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    /// Test name
    pub name: String,
    /// True when the test was added during this run
    pub is_new: bool,
    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// File the test lives in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Test-run summary attached to a retry record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Failures among tests added during this run
    pub new_tests_failed: u32,
    /// Failures among tests that passed before this run
    pub existing_tests_failed: u32,
    /// True iff previously-passing tests now fail
    pub is_breaking_change: bool,
    /// The failing tests
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failing: Vec<TestResult>,
}

impl TestSummary {
    /// Create a summary from top-level counts
    pub fn with_counts(total: u32, passed: u32, failed: u32, skipped: u32) -> Self {
        Self {
            total,
            passed,
            failed,
            skipped,
            ..Default::default()
        }
    }

    /// Set the new-vs-existing failure breakdown; derives the
    /// breaking-change flag
    pub fn with_breakdown(mut self, new_failed: u32, existing_failed: u32) -> Self {
        self.new_tests_failed = new_failed;
        self.existing_tests_failed = existing_failed;
        self.is_breaking_change = existing_failed > 0;
        self
    }

    /// Attach the failing test records
    pub fn with_failing(mut self, failing: Vec<TestResult>) -> Self {
        self.failing = failing;
        self
    }
}

/// Structured failure a retry-eligible phase hands back instead of raising
#[derive(Debug, Clone)]
pub struct FailureReport {
    /// Failure classification
    pub reason: RetryReason,
    /// Human-readable error text
    pub error: String,
    /// Fixes the diagnostic step derived
    pub fix_tasks: Vec<FixTask>,
    /// Test summary, when the failure came from a test run
    pub test_summary: Option<TestSummary>,
}

impl FailureReport {
    /// Create a report
    pub fn new(reason: RetryReason, error: impl Into<String>) -> Self {
        Self {
            reason,
            error: error.into(),
            fix_tasks: Vec::new(),
            test_summary: None,
        }
    }

    /// Attach fix tasks
    pub fn with_fix_tasks(mut self, tasks: Vec<FixTask>) -> Self {
        self.fix_tasks = tasks;
        self
    }

    /// Attach a test summary
    pub fn with_test_summary(mut self, summary: TestSummary) -> Self {
        self.test_summary = Some(summary);
        self
    }
}

/// Retry record attached to a workflow while parked at
/// `WaitingRetryApproval`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryInfo {
    /// The failing phase
    pub phase: String,
    /// How many times the phase has run and failed
    pub attempt: u32,
    /// Automated re-runs allowed before AutoFix is refused
    pub max_attempts: u32,
    /// Failure classification
    pub reason: RetryReason,
    /// Fixes to seed the next automated attempt with
    pub fix_tasks: Vec<FixTask>,
    /// Error text from the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Test summary from the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_summary: Option<TestSummary>,
    /// When the last attempt failed
    pub last_attempt_at: DateTime<Utc>,
}

/// How the caller resolves a retry park
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryResolution {
    /// Rewind and re-run with the fix tasks seeded
    AutoFix,
    /// Stop the run, leave the status parked for out-of-band repair
    ManualFix,
    /// Accept the failures, skip the phase, continue
    SkipTests,
    /// Fail the phase and stop the run
    Abort,
}

impl FromStr for RetryResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto_fix" | "autofix" | "auto" => Ok(RetryResolution::AutoFix),
            "manual_fix" | "manualfix" | "manual" => Ok(RetryResolution::ManualFix),
            "skip_tests" | "skiptests" | "skip" => Ok(RetryResolution::SkipTests),
            "abort" => Ok(RetryResolution::Abort),
            other => Err(Error::InvalidState(format!(
                "Unknown retry resolution '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for RetryResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetryResolution::AutoFix => "auto_fix",
            RetryResolution::ManualFix => "manual_fix",
            RetryResolution::SkipTests => "skip_tests",
            RetryResolution::Abort => "abort",
        };
        write!(f, "{}", s)
    }
}

/// Attempt bookkeeping and resolution rules for retry-eligible phases
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryCoordinator;

impl RetryCoordinator {
    /// Build the retry record for a failed attempt
    ///
    /// `attempt` is the phase's failed-run count including this failure.
    /// The breaking-change flag is rederived from the breakdown so callers
    /// cannot hand in an inconsistent summary.
    pub fn record(&self, spec: &PhaseSpec, attempt: u32, report: FailureReport) -> RetryInfo {
        let policy = spec
            .retry
            .as_ref()
            .map(|r| r.max_attempts)
            .unwrap_or(1);

        let mut test_summary = report.test_summary;
        if let Some(summary) = test_summary.as_mut() {
            summary.is_breaking_change = summary.existing_tests_failed > 0;
        }

        RetryInfo {
            phase: spec.id.clone(),
            attempt,
            max_attempts: policy,
            reason: report.reason,
            fix_tasks: report.fix_tasks,
            last_error: Some(report.error),
            test_summary,
            last_attempt_at: Utc::now(),
        }
    }

    /// Whether another automated re-run fits the budget
    pub fn auto_fix_allowed(&self, info: &RetryInfo) -> bool {
        info.attempt <= info.max_attempts
    }

    /// Resolve the rewind target index for AutoFix
    pub fn rewind_index(&self, descriptor: &PhaseDescriptor, phase: &str) -> Result<usize> {
        let spec = descriptor
            .spec(phase)
            .ok_or_else(|| Error::InvalidState(format!("Unknown phase '{}'", phase)))?;
        let policy = spec.retry.as_ref().ok_or_else(|| {
            Error::InvalidState(format!("Phase '{}' is not retry-eligible", phase))
        })?;
        descriptor.index_of(&policy.rewind_to).ok_or_else(|| {
            Error::InvalidState(format!(
                "Rewind target '{}' not in descriptor",
                policy.rewind_to
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::descriptor::RetryPolicy;

    fn testing_spec(max_attempts: u32) -> PhaseSpec {
        PhaseSpec::new("testing").with_retry(RetryPolicy {
            max_attempts,
            rewind_to: "coding".to_string(),
            reason: RetryReason::TestsFailed,
        })
    }

    #[test]
    fn test_breaking_change_derived_from_breakdown() {
        let summary = TestSummary::with_counts(10, 8, 2, 0).with_breakdown(1, 1);
        assert!(summary.is_breaking_change);

        let summary = TestSummary::with_counts(10, 8, 2, 0).with_breakdown(2, 0);
        assert!(!summary.is_breaking_change);
    }

    #[test]
    fn test_record_rederives_breaking_change() {
        let mut summary = TestSummary::with_counts(5, 4, 1, 0).with_breakdown(0, 1);
        summary.is_breaking_change = false;

        let report = FailureReport::new(RetryReason::TestsFailed, "1 test failed")
            .with_test_summary(summary);
        let info = RetryCoordinator.record(&testing_spec(3), 1, report);

        assert!(info.test_summary.unwrap().is_breaking_change);
    }

    #[test]
    fn test_auto_fix_budget() {
        let coordinator = RetryCoordinator;
        let report = || FailureReport::new(RetryReason::TestsFailed, "boom");

        let info = coordinator.record(&testing_spec(2), 1, report());
        assert!(coordinator.auto_fix_allowed(&info));

        let info = coordinator.record(&testing_spec(2), 2, report());
        assert!(coordinator.auto_fix_allowed(&info));

        let info = coordinator.record(&testing_spec(2), 3, report());
        assert!(!coordinator.auto_fix_allowed(&info));
    }

    #[test]
    fn test_resolution_from_str() {
        assert_eq!(
            "auto".parse::<RetryResolution>().unwrap(),
            RetryResolution::AutoFix
        );
        assert_eq!(
            "skip_tests".parse::<RetryResolution>().unwrap(),
            RetryResolution::SkipTests
        );
        assert_eq!(
            "ABORT".parse::<RetryResolution>().unwrap(),
            RetryResolution::Abort
        );
        assert!("retry-harder".parse::<RetryResolution>().is_err());
    }

    #[test]
    fn test_rewind_index() {
        let descriptor = PhaseDescriptor::new(
            "pipeline",
            vec![
                PhaseSpec::new("planning"),
                PhaseSpec::new("coding"),
                testing_spec(3),
            ],
        )
        .unwrap();

        assert_eq!(
            RetryCoordinator
                .rewind_index(&descriptor, "testing")
                .unwrap(),
            1
        );
        assert!(RetryCoordinator.rewind_index(&descriptor, "planning").is_err());
        assert!(RetryCoordinator.rewind_index(&descriptor, "nope").is_err());
    }
}
