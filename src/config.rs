//! Configuration loading and workflow definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::actions::{ActionSet, CommandAction, NoopAction, PhaseAction};
use crate::engine::{PhaseDescriptor, PhaseSpec, RetryPolicy, RetryReason};
use crate::{Error, Result};

/// Retry budget used when nothing else specifies one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory run statuses are saved under
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Retry budget applied when a workflow file omits one
    #[serde(default = "default_max_attempts")]
    pub max_retry_attempts: u32,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".fermata/runs")
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            max_retry_attempts: default_max_attempts(),
        }
    }
}

impl Config {
    /// Load configuration from a file or the default locations
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            // Try .fermata/config.toml in the current directory
            let local = PathBuf::from(".fermata/config.toml");
            if local.exists() {
                return Some(local);
            }

            // Try ~/.fermata/config.toml
            dirs::home_dir().map(|h| h.join(".fermata/config.toml"))
        });

        match config_path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                let config: Config = toml::from_str(&content)?;
                Ok(config)
            }
            _ => Ok(Config::default()),
        }
    }
}

/// A workflow definition file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFile {
    /// Workflow metadata
    pub workflow: WorkflowMeta,

    /// Display titles per phase id
    #[serde(default)]
    pub titles: HashMap<String, String>,

    /// Per-phase actions; phases without one are approval checkpoints
    #[serde(default)]
    pub actions: HashMap<String, ActionConfig>,

    /// Per-phase retry policies
    #[serde(default)]
    pub retry: HashMap<String, RetryConfig>,
}

/// Workflow metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMeta {
    /// Workflow name
    pub name: String,
    /// Ordered list of phase ids
    pub phases: Vec<String>,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
}

/// What a phase runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Command line to execute
    #[serde(default)]
    pub command: Option<String>,

    /// Working directory for the command
    #[serde(default)]
    pub workdir: Option<PathBuf>,

    /// Give up on the command after this long
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Note shown with the approval request (checkpoint phases)
    #[serde(default)]
    pub message: Option<String>,
}

/// Retry policy for a phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Automated re-runs before AutoFix is refused; falls back to the
    /// configured default when omitted
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Phase to rewind to on AutoFix
    pub rewind_to: String,

    /// Failure classification
    #[serde(default = "default_retry_reason")]
    pub reason: RetryReason,
}

fn default_retry_reason() -> RetryReason {
    RetryReason::TestsFailed
}

impl WorkflowFile {
    /// Load a workflow definition from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read workflow file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    /// Parse a workflow definition from TOML
    pub fn parse(content: &str) -> Result<Self> {
        let file: WorkflowFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse workflow file: {}", e)))?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<()> {
        let keys = self
            .titles
            .keys()
            .chain(self.actions.keys())
            .chain(self.retry.keys());
        for key in keys {
            if !self.workflow.phases.iter().any(|p| p == key) {
                return Err(Error::Config(format!(
                    "'{}' is not a phase of workflow '{}'",
                    key, self.workflow.name
                )));
            }
        }
        Ok(())
    }

    /// Build the phase descriptor, applying `default_max_attempts` where a
    /// retry table omits its budget
    pub fn descriptor(&self, default_max_attempts: u32) -> Result<PhaseDescriptor> {
        let mut phases = Vec::with_capacity(self.workflow.phases.len());
        for id in &self.workflow.phases {
            let mut spec = PhaseSpec::new(id);
            if let Some(title) = self.titles.get(id) {
                spec = spec.with_title(title);
            }
            if let Some(retry) = self.retry.get(id) {
                spec = spec.with_retry(RetryPolicy {
                    max_attempts: retry.max_attempts.unwrap_or(default_max_attempts),
                    rewind_to: retry.rewind_to.clone(),
                    reason: retry.reason,
                });
            }
            phases.push(spec);
        }
        PhaseDescriptor::new(&self.workflow.name, phases)
    }

    /// Build the action set: configured commands run, everything else
    /// parks as an approval checkpoint
    pub fn actions(&self) -> ActionSet {
        let mut set = ActionSet::new();
        for id in &self.workflow.phases {
            let config = self.actions.get(id);
            let action: Arc<dyn PhaseAction> = match config.and_then(|c| c.command.as_ref()) {
                Some(command) => {
                    let mut cmd = CommandAction::new(command);
                    if let Some(dir) = config.and_then(|c| c.workdir.as_ref()) {
                        cmd = cmd.with_workdir(dir);
                    }
                    if let Some(limit) = config.and_then(|c| c.timeout) {
                        cmd = cmd.with_timeout(limit);
                    }
                    Arc::new(cmd)
                }
                None => {
                    let mut noop = NoopAction::new();
                    if let Some(message) = config.and_then(|c| c.message.clone()) {
                        noop = noop.with_message(message);
                    }
                    Arc::new(noop)
                }
            };
            set = set.register(id, action);
        }
        set
    }
}

/// The built-in development pipeline: plan, build, debug, test with an
/// auto-fix retry rewinding to coding, then review
pub fn dev_pipeline() -> PhaseDescriptor {
    PhaseDescriptor::new(
        "dev_pipeline",
        vec![
            PhaseSpec::new("planning").with_title("Planning"),
            PhaseSpec::new("coding").with_title("Coding"),
            PhaseSpec::new("debugging").with_title("Debugging"),
            PhaseSpec::new("testing")
                .with_title("Testing")
                .with_retry(RetryPolicy {
                    max_attempts: DEFAULT_MAX_ATTEMPTS,
                    rewind_to: "coding".to_string(),
                    reason: RetryReason::TestsFailed,
                }),
            PhaseSpec::new("review").with_title("Review"),
        ],
    )
    .expect("built-in pipeline is valid")
}

/// The built-in specification wizard: every phase is an approval
/// checkpoint, no retry machinery
pub fn spec_wizard() -> PhaseDescriptor {
    PhaseDescriptor::new(
        "spec_wizard",
        vec![
            PhaseSpec::new("analysis").with_title("Analysis"),
            PhaseSpec::new("questions").with_title("Questions"),
            PhaseSpec::new("refinement").with_title("Refinement"),
            PhaseSpec::new("decomposition").with_title("Decomposition"),
            PhaseSpec::new("review").with_title("Review"),
        ],
    )
    .expect("built-in wizard is valid")
}

const DEV_PIPELINE_TOML: &str = r#"[workflow]
name = "dev_pipeline"
phases = ["planning", "coding", "debugging", "testing", "review"]
description = "Plan, build, debug, test, review"

[titles]
planning = "Planning"
coding = "Coding"
debugging = "Debugging"
testing = "Testing"
review = "Review"

# Phases without an action park as approval checkpoints. Commands run
# with shell-words splitting, no shell interpolation:
# [actions.testing]
# command = "cargo test"
# timeout = "10m"

[retry.testing]
rewind_to = "coding"
reason = "tests_failed"
"#;

const SPEC_WIZARD_TOML: &str = r#"[workflow]
name = "spec_wizard"
phases = ["analysis", "questions", "refinement", "decomposition", "review"]
description = "Specification refinement wizard"

[titles]
analysis = "Analysis"
questions = "Questions"
refinement = "Refinement"
decomposition = "Decomposition"
review = "Review"
"#;

/// Initialize the .fermata directory: state dir, default config, and the
/// built-in workflow definitions
pub fn init() -> Result<()> {
    let fermata_dir = PathBuf::from(".fermata");
    if !fermata_dir.exists() {
        std::fs::create_dir_all(&fermata_dir)?;
    }

    let runs_dir = fermata_dir.join("runs");
    if !runs_dir.exists() {
        std::fs::create_dir_all(&runs_dir)?;
    }

    let config_path = fermata_dir.join("config.toml");
    if !config_path.exists() {
        let config_str = toml::to_string_pretty(&Config::default())
            .map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(&config_path, config_str)?;
    }

    let workflows_dir = fermata_dir.join("workflows");
    if !workflows_dir.exists() {
        std::fs::create_dir_all(&workflows_dir)?;
    }
    for (name, content) in [
        ("dev_pipeline.toml", DEV_PIPELINE_TOML),
        ("spec_wizard.toml", SPEC_WIZARD_TOML),
    ] {
        let path = workflows_dir.join(name);
        if !path.exists() {
            std::fs::write(&path, content)?;
        }
    }

    Ok(())
}

// Custom serde module for Duration using humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => {
                let s = humantime::format_duration(*d).to_string();
                serializer.serialize_some(&s)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => humantime::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workflow_file() {
        let content = r##"
[workflow]
name = "ship-it"
phases = ["plan", "build", "verify"]
description = "Small pipeline"

[titles]
plan = "Plan"

[actions.build]
command = "make all"
timeout = "5m"

[actions.plan]
message = "Plan drafted, please review"

[retry.verify]
max_attempts = 2
rewind_to = "build"
reason = "tests_failed"
"##;

        let file = WorkflowFile::parse(content).unwrap();
        assert_eq!(file.workflow.name, "ship-it");
        assert_eq!(file.workflow.phases.len(), 3);
        assert_eq!(
            file.actions["build"].timeout,
            Some(Duration::from_secs(300))
        );

        let descriptor = file.descriptor(DEFAULT_MAX_ATTEMPTS).unwrap();
        assert_eq!(descriptor.spec("plan").unwrap().title(), "Plan");
        let retry = descriptor.spec("verify").unwrap().retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 2);
        assert_eq!(retry.rewind_to, "build");
    }

    #[test]
    fn test_unknown_phase_key_rejected() {
        let content = r##"
[workflow]
name = "ship-it"
phases = ["plan", "build"]

[retry.verify]
rewind_to = "plan"
"##;

        let err = WorkflowFile::parse(content).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_retry_budget_falls_back_to_default() {
        let content = r##"
[workflow]
name = "ship-it"
phases = ["build", "verify"]

[retry.verify]
rewind_to = "build"
"##;

        let file = WorkflowFile::parse(content).unwrap();
        let descriptor = file.descriptor(5).unwrap();
        let retry = descriptor.spec("verify").unwrap().retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.reason, RetryReason::TestsFailed);
    }

    #[test]
    fn test_actions_cover_every_phase() {
        let content = r##"
[workflow]
name = "ship-it"
phases = ["plan", "build", "verify"]

[actions.build]
command = "make all"
"##;

        let file = WorkflowFile::parse(content).unwrap();
        let actions = file.actions();
        assert!(actions.contains("plan"));
        assert!(actions.contains("build"));
        assert!(actions.contains("verify"));
    }

    #[test]
    fn test_builtin_workflows() {
        let pipeline = dev_pipeline();
        assert_eq!(pipeline.len(), 5);
        let retry = pipeline.spec("testing").unwrap().retry.as_ref().unwrap();
        assert_eq!(retry.rewind_to, "coding");
        assert_eq!(retry.max_attempts, DEFAULT_MAX_ATTEMPTS);

        let wizard = spec_wizard();
        assert_eq!(wizard.len(), 5);
        assert!(wizard.phases().iter().all(|p| p.retry.is_none()));
    }

    #[test]
    fn test_builtin_workflow_files_parse() {
        let pipeline = WorkflowFile::parse(DEV_PIPELINE_TOML).unwrap();
        let descriptor = pipeline.descriptor(DEFAULT_MAX_ATTEMPTS).unwrap();
        assert_eq!(descriptor.name(), "dev_pipeline");
        assert!(descriptor.spec("testing").unwrap().retry.is_some());

        let wizard = WorkflowFile::parse(SPEC_WIZARD_TOML).unwrap();
        assert_eq!(
            wizard.descriptor(DEFAULT_MAX_ATTEMPTS).unwrap().name(),
            "spec_wizard"
        );
    }

    #[test]
    fn test_config_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "state_dir = \"/tmp/fermata-runs\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/fermata-runs"));
        assert_eq!(config.max_retry_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn test_config_missing_path_falls_back_to_default() {
        let config = Config::load(Some(Path::new("/nonexistent/config.toml"))).unwrap();
        assert_eq!(config.state_dir, default_state_dir());
    }
}
