//! Integration tests for the checkgate CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a checkgate Command isolated from the caller's environment
fn checkgate(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("checkgate");
    cmd.current_dir(dir)
        .env_remove("RUST_LOG")
        .env_remove("CHECKGATE_CONFIG")
        .env("CHECKGATE_LOG_FILTER", "warn");
    cmd
}

fn write_manifest(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

const TWO_INSTANCES: &str = r#"
metadata:
  name: checkout
  namespace: ns
spec:
  appName: shop
  preDeploymentCheck:
    taskPayload:
      image-scan: {}
  postDeploymentCheck:
    taskPayload:
      smoke-test: {}
---
metadata:
  name: cart
  namespace: ns
spec:
  appName: shop
"#;

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_checkgate_help() {
        let dir = TempDir::new().unwrap();
        checkgate(dir.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("simulate"))
            .stdout(predicate::str::contains("config"));
    }

    #[test]
    fn test_checkgate_version() {
        let dir = TempDir::new().unwrap();
        checkgate(dir.path())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("checkgate"));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        let dir = TempDir::new().unwrap();
        checkgate(dir.path()).arg("deploy").assert().failure();
    }
}

// =============================================================================
// Config Command Tests
// =============================================================================

mod config_commands {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        checkgate(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No config file found"))
            .stdout(predicate::str::contains("requeue_after_ms = 5000"))
            .stdout(predicate::str::contains("workers = 4"));
    }

    #[test]
    fn test_config_show_applies_env_override() {
        let dir = TempDir::new().unwrap();
        checkgate(dir.path())
            .args(["config", "show"])
            .env("CHECKGATE_WORKERS", "12")
            .assert()
            .success()
            .stdout(predicate::str::contains("workers = 12"));
    }

    #[test]
    fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        checkgate(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created checkgate.toml"));

        let content = fs::read_to_string(dir.path().join("checkgate.toml")).unwrap();
        assert!(content.contains("[reconciler]"));
        assert!(content.contains("[controller]"));

        checkgate(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_validate_accepts_defaults() {
        let dir = TempDir::new().unwrap();
        checkgate(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_validate_rejects_bad_values() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("checkgate.toml"),
            "[controller]\nworkers = 0\n\n[reconciler]\ntask_suffix_len = 40\n",
        )
        .unwrap();

        checkgate(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("controller.workers"))
            .stdout(predicate::str::contains("task_suffix_len"));
    }

    #[test]
    fn test_explicit_missing_config_fails() {
        let dir = TempDir::new().unwrap();
        checkgate(dir.path())
            .args(["--config", "missing.toml", "config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read config file"));
    }
}

// =============================================================================
// Simulate Command Tests
// =============================================================================

mod simulate {
    use super::*;

    #[test]
    fn test_simulate_runs_both_phases() {
        let dir = TempDir::new().unwrap();
        let manifest = write_manifest(&dir, "workloads.yaml", TWO_INSTANCES);

        checkgate(dir.path())
            .arg("simulate")
            .arg(&manifest)
            .args(["--task-delay-ms", "10", "--requeue-after-ms", "20"])
            .assert()
            .success()
            .stdout(predicate::str::contains("completed: true"))
            .stdout(predicate::str::contains("preDeploymentPhase: Succeeded"))
            .stdout(predicate::str::contains("postDeploymentPhase: Succeeded"))
            .stdout(predicate::str::contains("pre-deployment checks are started"))
            .stdout(predicate::str::contains("post-deployment checks are finished"));
    }

    #[test]
    fn test_simulate_pre_failure_skips_post() {
        let dir = TempDir::new().unwrap();
        let manifest = write_manifest(&dir, "workloads.yaml", TWO_INSTANCES);

        let output = checkgate(dir.path())
            .arg("simulate")
            .arg(&manifest)
            .args(["--pre-outcome", "failed", "--output", "json"])
            .args(["--task-delay-ms", "10", "--requeue-after-ms", "20"])
            .output()
            .unwrap();
        assert!(output.status.success());

        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(report["completed"], true);
        for instance in report["instances"].as_array().unwrap() {
            assert_eq!(instance["preDeploymentPhase"], "Failed");
            assert_eq!(instance["postDeploymentPhase"], "Failed");
        }
        let messages: Vec<&str> = report["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["message"].as_str().unwrap())
            .collect();
        assert!(messages.contains(&"post-deployment checks are skipped"));
        assert!(!messages.contains(&"post-deployment checks are started"));
    }

    #[test]
    fn test_simulate_times_out() {
        let dir = TempDir::new().unwrap();
        let manifest = write_manifest(&dir, "workloads.yaml", TWO_INSTANCES);

        checkgate(dir.path())
            .arg("simulate")
            .arg(&manifest)
            .args(["--task-delay-ms", "60000", "--timeout-secs", "1"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("completed: false"))
            .stderr(predicate::str::contains("Timed out"));
    }

    #[test]
    fn test_simulate_rejects_invalid_manifest() {
        let dir = TempDir::new().unwrap();
        let manifest = write_manifest(&dir, "broken.yaml", "metadata: [unterminated\n");

        checkgate(dir.path())
            .arg("simulate")
            .arg(&manifest)
            .assert()
            .failure()
            .stderr(predicate::str::contains("broken.yaml"));
    }

    #[test]
    fn test_simulate_requires_manifest() {
        let dir = TempDir::new().unwrap();
        checkgate(dir.path()).arg("simulate").assert().failure();
    }
}
