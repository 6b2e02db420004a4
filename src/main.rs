//! Fermata CLI
//!
//! Runs approval-gated workflows from the terminal: phases execute on a
//! background task while this process polls status and prompts at the
//! gates.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use fermata::actions::NoopAction;
use fermata::engine::{PhaseDescriptor, PhaseState, PhaseStatus, RetryInfo, RetryResolution};
use fermata::{
    dev_pipeline, spec_wizard, ActionSet, Config, Error, FileStore, LogNotifier, Result,
    Sequencer, StatusStore, WorkflowFile,
};

#[derive(Parser)]
#[command(name = "fermata")]
#[command(author, version, about = "Approval-gated phase sequencing")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow, driving its gates from the terminal
    Run {
        /// Workflow name or path to a workflow file (default: dev_pipeline)
        #[arg(long, short)]
        workflow: Option<String>,

        /// Run id (default: a fresh UUID)
        #[arg(long)]
        id: Option<String>,

        /// Resolve every approval gate without prompting
        #[arg(long)]
        auto_approve: bool,

        /// Resume a run parked for a manual fix
        #[arg(long)]
        resume: Option<String>,

        /// Status poll interval (e.g. "500ms", "2s")
        #[arg(long, default_value = "500ms")]
        poll: String,
    },

    /// Show the status of a run
    Status {
        /// Run id
        id: String,

        /// Print the raw status as JSON
        #[arg(long)]
        json: bool,
    },

    /// List saved runs
    List {
        /// Show only the last N runs
        #[arg(long, default_value = "10")]
        last: usize,

        /// Print the raw statuses as JSON
        #[arg(long)]
        json: bool,
    },

    /// Initialize .fermata/ with a config and the built-in workflows
    Init,

    /// Parse a workflow file and report problems
    Validate {
        /// Workflow name or path to a workflow file
        workflow: String,
    },

    /// Prune old run statuses, keeping the most recent
    Clean {
        /// How many runs to keep
        #[arg(long, default_value = "20")]
        keep: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            workflow,
            id,
            auto_approve,
            resume,
            poll,
        } => {
            handle_run(&config, workflow.as_deref(), id, auto_approve, resume, &poll).await?;
        }

        Commands::Status { id, json } => {
            let store = FileStore::new(config.state_dir.clone());
            let status = store
                .load(&id)
                .await?
                .ok_or_else(|| Error::NotFound(id.clone()))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{}", status.summary());
            }
        }

        Commands::List { last, json } => {
            let store = FileStore::new(config.state_dir.clone());
            let mut statuses = store.list().await?;
            statuses.sort_by(|a, b| b.started_at.cmp(&a.started_at));

            if json {
                let shown: Vec<_> = statuses.into_iter().take(last).collect();
                println!("{}", serde_json::to_string_pretty(&shown)?);
            } else {
                for status in statuses.into_iter().take(last) {
                    println!(
                        "{} | {} | {} | {}",
                        status.id,
                        status.workflow,
                        status.state_label(),
                        status.started_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }

        Commands::Init => {
            fermata::config::init()?;
            println!("Initialized .fermata/ (config.toml, workflows/, runs/)");
        }

        Commands::Validate { workflow } => {
            let path = workflow_path(&workflow);
            let file = WorkflowFile::load(&path)?;
            let descriptor = file.descriptor(config.max_retry_attempts)?;

            println!(
                "{}: workflow '{}' with {} phase(s)",
                path.display(),
                descriptor.name(),
                descriptor.len()
            );
            for spec in descriptor.phases() {
                match &spec.retry {
                    Some(policy) => println!(
                        "  {} (retries {} time(s), rewinds to {})",
                        spec.id, policy.max_attempts, policy.rewind_to
                    ),
                    None => println!("  {}", spec.id),
                }
            }
        }

        Commands::Clean { keep } => {
            let store = FileStore::new(config.state_dir.clone());
            let removed = store.cleanup(keep)?;
            println!("Removed {} old run status(es)", removed);
        }
    }

    Ok(())
}

/// Start (or resume) a run and drive its gates until the background
/// task exits.
async fn handle_run(
    config: &Config,
    workflow: Option<&str>,
    id: Option<String>,
    auto_approve: bool,
    resume: Option<String>,
    poll: &str,
) -> Result<()> {
    let poll = humantime::parse_duration(poll)
        .map_err(|e| Error::Config(format!("Invalid poll interval '{}': {}", poll, e)))?;

    let (descriptor, actions) = load_workflow(config, workflow)?;
    let store = Arc::new(FileStore::new(config.state_dir.clone()));
    let sequencer = Sequencer::new(descriptor, Arc::new(LogNotifier::new()), store);

    let run_id = match &resume {
        Some(resume_id) => resume_id.clone(),
        None => id.unwrap_or_else(|| Uuid::new_v4().to_string()),
    };

    // Ctrl-C requests cooperative cancellation; the run unwinds at the
    // next phase boundary or open gate.
    let canceller = sequencer.clone();
    let cancel_id = run_id.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling {}...", cancel_id);
        if let Err(e) = canceller.cancel(&cancel_id) {
            eprintln!("Cancel failed: {}", e);
        }
    })
    .map_err(|e| Error::Config(format!("Failed to set signal handler: {}", e)))?;

    let status = match resume {
        Some(resume_id) => sequencer.resume(&resume_id, actions, auto_approve).await?,
        None => sequencer.start(&run_id, actions, auto_approve).await?,
    };

    info!(workflow = %run_id, descriptor = %status.workflow, "run started");
    println!("Run {} ({})", run_id, status.workflow);

    drive_gates(&sequencer, &run_id, auto_approve, poll).await?;

    let final_status = sequencer.status(&run_id).await?;
    println!("\n{}", final_status.summary());
    Ok(())
}

/// Poll the run until its background task exits, prompting whenever a
/// phase parks on a gate.
async fn drive_gates(
    sequencer: &Sequencer,
    run_id: &str,
    auto_approve: bool,
    poll: Duration,
) -> Result<()> {
    loop {
        if !sequencer.active_ids().iter().any(|id| id == run_id) {
            return Ok(());
        }

        // Under auto-approve the gates resolve themselves; just wait.
        if auto_approve {
            tokio::time::sleep(poll).await;
            continue;
        }

        let status = sequencer.status(run_id).await?;

        if let Some(parked) = status
            .phases
            .iter()
            .find(|p| p.state == PhaseState::WaitingApproval)
        {
            match prompt_approval(&status.workflow, parked)? {
                GateChoice::Approve => {
                    match sequencer.approve(run_id, &parked.phase) {
                        Ok(true) => {}
                        // Gate already resolved or the run finished; the
                        // next poll observes the new state.
                        Ok(false) | Err(Error::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                GateChoice::Reject(reason) => {
                    match sequencer.reject(run_id, &parked.phase, reason) {
                        Ok(_) | Err(Error::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        } else if let Some(retry) = status.retry.as_ref().filter(|_| {
            status
                .phases
                .iter()
                .any(|p| p.state == PhaseState::WaitingRetryApproval)
        }) {
            let resolution = prompt_retry(run_id, retry)?;
            match sequencer.approve_retry(run_id, resolution) {
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(Error::RetryExhausted { .. }) => {
                    println!(
                        "Automated retries exhausted after {} attempt(s); choose manual, skip or abort.",
                        retry.max_attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }

        tokio::time::sleep(poll).await;
    }
}

enum GateChoice {
    Approve,
    Reject(Option<String>),
}

/// Prompt for an approval gate decision
fn prompt_approval(workflow: &str, phase: &PhaseStatus) -> Result<GateChoice> {
    println!("\n{}", "─".repeat(60));
    println!("{} / {} awaiting approval", workflow, phase.phase);
    println!("{}", "─".repeat(60));

    if let Some(message) = &phase.message {
        println!("\n{}", message);
    }
    if let Some(result) = &phase.result {
        println!("\n{}", serde_json::to_string_pretty(result)?);
    }

    println!("\n[a]pprove  [r]eject");
    print!("> ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();

    match input.as_str() {
        "a" | "approve" | "y" | "yes" | "" => Ok(GateChoice::Approve),
        "r" | "reject" | "n" | "no" => {
            print!("Reason (blank for none): ");
            io::stdout().flush()?;
            let mut reason = String::new();
            io::stdin().read_line(&mut reason)?;
            let reason = reason.trim();
            Ok(GateChoice::Reject(if reason.is_empty() {
                None
            } else {
                Some(reason.to_string())
            }))
        }
        _ => {
            println!("Commands:");
            println!("  a/approve/y/yes - approve the phase and continue");
            println!("  r/reject/n/no   - reject the phase and stop the run");
            prompt_approval(workflow, phase)
        }
    }
}

/// Prompt for a retry park resolution
fn prompt_retry(run_id: &str, retry: &RetryInfo) -> Result<RetryResolution> {
    println!("\n{}", "─".repeat(60));
    println!(
        "{} failed, attempt {} of {} ({})",
        retry.phase, retry.attempt, retry.max_attempts, retry.reason
    );
    println!("{}", "─".repeat(60));

    if let Some(error) = &retry.last_error {
        println!("\n{}", error);
    }
    if let Some(summary) = &retry.test_summary {
        println!("\n{} of {} test(s) failed", summary.failed, summary.total);
        if summary.is_breaking_change {
            println!(
                "⚠ breaking change: {} previously-passing test(s) now fail",
                summary.existing_tests_failed
            );
        }
        for test in &summary.failing {
            println!("  FAIL {}", test.name);
        }
    }
    if !retry.fix_tasks.is_empty() {
        println!("\nSuggested fixes:");
        for task in &retry.fix_tasks {
            println!("  {}. {}", task.index, task.title);
        }
    }

    println!("\n[auto]fix  [manual]fix  [skip]tests  [abort]");
    print!("> ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    match input.trim().parse::<RetryResolution>() {
        Ok(resolution) => Ok(resolution),
        Err(_) => {
            println!("Commands:");
            println!("  auto   - rewind and re-run with the suggested fixes seeded");
            println!(
                "  manual - stop here; fix by hand, then `fermata run --resume {}`",
                run_id
            );
            println!("  skip   - accept the failures, skip the phase, continue");
            println!("  abort  - fail the phase and stop the run");
            prompt_retry(run_id, retry)
        }
    }
}

/// Resolve a workflow argument to a descriptor and its actions.
///
/// A bare name maps to `.fermata/workflows/{name}.toml`; a path is
/// loaded as given. The built-in pipelines are used when no file
/// exists under that name.
fn load_workflow(config: &Config, name: Option<&str>) -> Result<(PhaseDescriptor, ActionSet)> {
    let name = name.unwrap_or("dev_pipeline");
    let path = workflow_path(name);

    if path.exists() {
        let file = WorkflowFile::load(&path)?;
        let descriptor = file.descriptor(config.max_retry_attempts)?;
        let actions = file.actions();
        return Ok((descriptor, actions));
    }

    let descriptor = match name {
        "dev_pipeline" => dev_pipeline(),
        "spec_wizard" => spec_wizard(),
        other => {
            return Err(Error::Config(format!(
                "No workflow named '{}' (looked for {})",
                other,
                path.display()
            )))
        }
    };
    let actions = review_actions(&descriptor);
    Ok((descriptor, actions))
}

fn workflow_path(name: &str) -> PathBuf {
    if name.ends_with(".toml") {
        PathBuf::from(name)
    } else {
        PathBuf::from(format!(".fermata/workflows/{}.toml", name))
    }
}

/// The built-in pipelines have no commands wired up; every phase parks
/// for review.
fn review_actions(descriptor: &PhaseDescriptor) -> ActionSet {
    let mut actions = ActionSet::new();
    for spec in descriptor.phases() {
        actions = actions.register(&spec.id, Arc::new(NoopAction::new()));
    }
    actions
}
