//! Phase actions
//!
//! The work inside a phase is opaque to the engine: callers hand in one
//! [`PhaseAction`] per phase. An action either succeeds with an optional
//! result payload, reports a structured failure (retry-eligible phases park
//! on it), or raises an error. Long-running actions should poll the
//! cancellation probe on the [`ActionContext`] inside their loops.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{FailureReport, FixTask};
use crate::{Error, Result};

/// What a phase action reports back to the runner
#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    /// Work finished and awaits approval
    Success {
        /// Result payload shown with the approval request
        result: Option<serde_json::Value>,
        /// Short note for the approval prompt
        message: Option<String>,
    },
    /// Work ran to completion but the artifact failed (build/test errors).
    /// Distinct from the action itself raising an error.
    Failure(FailureReport),
}

impl PhaseOutcome {
    /// A bare success
    pub fn success() -> Self {
        PhaseOutcome::Success {
            result: None,
            message: None,
        }
    }

    /// A failure carrying diagnostics
    pub fn failure(report: FailureReport) -> Self {
        PhaseOutcome::Failure(report)
    }

    /// Attach a note to a success (no-op on failures)
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        if let PhaseOutcome::Success { message: m, .. } = &mut self {
            *m = Some(message.into());
        }
        self
    }

    /// Attach a result payload to a success (no-op on failures)
    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        if let PhaseOutcome::Success { result: r, .. } = &mut self {
            *r = Some(result);
        }
        self
    }
}

/// Context handed to a phase action
#[derive(Clone)]
pub struct ActionContext {
    /// Workflow id
    pub workflow_id: String,
    /// Phase being run
    pub phase: String,
    /// 1-based run count for this phase; rewinds increment it
    pub attempt: u32,
    /// Fix tasks seeded by an AutoFix rewind, empty otherwise
    pub fix_tasks: Vec<FixTask>,
    cancelled: Arc<AtomicBool>,
}

impl ActionContext {
    pub(crate) fn new(
        workflow_id: &str,
        phase: &str,
        attempt: u32,
        fix_tasks: Vec<FixTask>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            phase: phase.to_string(),
            attempt,
            fix_tasks,
            cancelled,
        }
    }

    /// True once the run was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Bail out of a bounded loop once the run was cancelled
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled(self.workflow_id.clone()))
        } else {
            Ok(())
        }
    }
}

/// One phase's work
#[async_trait]
pub trait PhaseAction: Send + Sync {
    /// Run the phase
    async fn run(&self, ctx: ActionContext) -> Result<PhaseOutcome>;
}

/// Adapter turning an async closure into a [`PhaseAction`]
pub struct FnAction<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> PhaseAction for FnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<PhaseOutcome>> + Send,
{
    async fn run(&self, ctx: ActionContext) -> Result<PhaseOutcome> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a shareable action
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn PhaseAction>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PhaseOutcome>> + Send + 'static,
{
    Arc::new(FnAction { f })
}

/// Action that succeeds immediately with a note; used for phases whose work
/// happens outside the engine and only needs an approval checkpoint
pub struct NoopAction {
    message: Option<String>,
}

impl NoopAction {
    /// Create a no-op action
    pub fn new() -> Self {
        Self { message: None }
    }

    /// Set the note shown with the approval request
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl Default for NoopAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhaseAction for NoopAction {
    async fn run(&self, ctx: ActionContext) -> Result<PhaseOutcome> {
        let message = self
            .message
            .clone()
            .unwrap_or_else(|| format!("{} ready for review", ctx.phase));
        Ok(PhaseOutcome::success().with_message(message))
    }
}

/// Action that runs a shell command and treats a nonzero exit as failure
pub struct CommandAction {
    command: String,
    workdir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandAction {
    /// Create an action for a command line
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            workdir: None,
            timeout: None,
        }
    }

    /// Run the command in a specific directory
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Give up on the command after this long
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[async_trait]
impl PhaseAction for CommandAction {
    async fn run(&self, ctx: ActionContext) -> Result<PhaseOutcome> {
        ctx.check_cancelled()?;

        let argv = shell_words::split(&self.command)
            .map_err(|e| Error::Command(format!("Bad command line '{}': {}", self.command, e)))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Command("Empty command line".to_string()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| {
                    Error::Command(format!(
                        "`{}` timed out after {}",
                        self.command,
                        humantime::format_duration(limit)
                    ))
                })?,
            None => cmd.output().await,
        }
        .map_err(|e| Error::Command(format!("Failed to run '{}': {}", self.command, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            Ok(PhaseOutcome::success()
                .with_message(format!("`{}` succeeded", self.command))
                .with_result(serde_json::json!({
                    "command": self.command,
                    "stdout_tail": tail(&stdout, 20),
                })))
        } else {
            Err(Error::Command(format!(
                "`{}` exited with {}: {}",
                self.command,
                output.status,
                tail(&stderr, 10)
            )))
        }
    }
}

/// Actions for every phase of a workflow, keyed by phase id
#[derive(Clone, Default)]
pub struct ActionSet {
    actions: HashMap<String, Arc<dyn PhaseAction>>,
}

impl ActionSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action for a phase
    pub fn register(mut self, phase: impl Into<String>, action: Arc<dyn PhaseAction>) -> Self {
        self.actions.insert(phase.into(), action);
        self
    }

    /// Register an async closure for a phase
    pub fn register_fn<F, Fut>(self, phase: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PhaseOutcome>> + Send + 'static,
    {
        self.register(phase, action_fn(f))
    }

    /// Action for a phase
    pub fn get(&self, phase: &str) -> Option<Arc<dyn PhaseAction>> {
        self.actions.get(phase).cloned()
    }

    /// True when the phase has an action
    pub fn contains(&self, phase: &str) -> bool {
        self.actions.contains_key(phase)
    }
}
