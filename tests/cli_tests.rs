//! CLI surface tests: help, scaffolding, validation, and end-to-end
//! auto-approved runs in a scratch directory.

use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A `fermata` invocation rooted in the scratch directory; HOME points
/// there too so no user-level config leaks in.
fn fermata(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("fermata").unwrap();
    cmd.current_dir(dir.path()).env("HOME", dir.path());
    cmd
}

#[test]
fn test_help_lists_command_surface() {
    let mut cmd = Command::cargo_bin("fermata").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Approval-gated phase sequencing"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("clean"));
}

#[test]
fn test_init_scaffolds_project_dir() -> Result<()> {
    let dir = TempDir::new()?;

    fermata(&dir).arg("init").assert().success();

    assert!(dir.path().join(".fermata/config.toml").exists());
    assert!(dir.path().join(".fermata/runs").is_dir());
    assert!(dir
        .path()
        .join(".fermata/workflows/dev_pipeline.toml")
        .exists());
    assert!(dir
        .path()
        .join(".fermata/workflows/spec_wizard.toml")
        .exists());

    // Second init leaves the existing files alone.
    fermata(&dir).arg("init").assert().success();
    Ok(())
}

#[test]
fn test_validate_reports_workflow_shape() -> Result<()> {
    let dir = TempDir::new()?;
    fermata(&dir).arg("init").assert().success();

    fermata(&dir)
        .args(["validate", "dev_pipeline"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "workflow 'dev_pipeline' with 5 phase(s)",
        ))
        .stdout(predicate::str::contains("rewinds to coding"));
    Ok(())
}

#[test]
fn test_validate_rejects_unknown_phase_key() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(
        dir.path().join("demo.toml"),
        r#"
[workflow]
name = "demo"
phases = ["draft", "publish"]

[actions.deploy]
message = "not a phase"
"#,
    )?;

    fermata(&dir)
        .args(["validate", "demo.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not a phase"));
    Ok(())
}

#[test]
fn test_status_unknown_run_fails() {
    let dir = TempDir::new().unwrap();
    fermata(&dir)
        .args(["status", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("NotFound"));
}

#[test]
fn test_list_without_runs_is_quiet() {
    let dir = TempDir::new().unwrap();
    fermata(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_clean_reports_removals() {
    let dir = TempDir::new().unwrap();
    fermata(&dir)
        .args(["clean", "--keep", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 0 old run status(es)"));
}

#[test]
fn test_auto_approved_run_completes_and_persists() -> Result<()> {
    let dir = TempDir::new()?;

    fermata(&dir)
        .args(["run", "--auto-approve", "--id", "demo-run", "--poll", "25ms"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Run demo-run"))
        .stdout(predicate::str::contains("Status: completed"));

    assert!(dir.path().join(".fermata/runs/demo-run.yaml").exists());

    fermata(&dir)
        .args(["status", "demo-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Status: completed"));

    fermata(&dir)
        .args(["status", "demo-run", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\": \"demo-run\""));

    fermata(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("demo-run"));
    Ok(())
}

#[test]
fn test_run_with_workflow_file_and_command_action() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(
        dir.path().join("release.toml"),
        r#"
[workflow]
name = "release"
phases = ["draft", "publish"]

[titles]
draft = "Draft notes"

[actions.draft]
message = "notes drafted"

[actions.publish]
command = "echo published"
"#,
    )?;

    fermata(&dir)
        .args([
            "run",
            "--workflow",
            "release.toml",
            "--auto-approve",
            "--id",
            "rel-1",
            "--poll",
            "25ms",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Run rel-1 (release)"))
        .stdout(predicate::str::contains("Status: completed"));
    Ok(())
}

#[test]
fn test_invalid_poll_interval_fails_fast() {
    let dir = TempDir::new().unwrap();
    fermata(&dir)
        .args(["run", "--auto-approve", "--poll", "soon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid poll interval"));
}
