use std::fs;
use std::process::Command;
use tempfile::tempdir;

// Helper function to run the CLI command and capture output
fn run_command(args: &[&str]) -> (bool, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_skyswarm"))
        .args(args)
        .output()
        .expect("Failed to execute skyswarm command");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let output_text = format!("{}\n{}", stdout, stderr);

    (output.status.success(), output_text)
}

#[test]
fn test_short_run_prints_summary() {
    let (success, output) = run_command(&["--ticks", "20", "--agents", "4"]);
    assert!(success, "run failed: {}", output);
    assert!(output.contains("\"ticks\": 20"));
    assert!(output.contains("\"active\": 4"));
}

#[test]
fn test_failure_injection_flag() {
    let (success, output) = run_command(&["--ticks", "10", "--fail-at", "3"]);
    assert!(success, "run failed: {}", output);
    assert!(output.contains("\"failed\": 1"));
}

#[test]
fn test_proposal_flag() {
    let (success, output) = run_command(&["--ticks", "5", "--propose", r#"{"type":"loiter"}"#]);
    assert!(success, "run failed: {}", output);
    assert!(output.contains("\"proposals_passed\": 1"));

    let (success, _) = run_command(&["--ticks", "5", "--propose", "selfDestruct"]);
    assert!(!success);
}

#[test]
fn test_missing_config_fails() {
    let (success, output) = run_command(&["--config", "/nonexistent/skyswarm.toml"]);
    assert!(!success);
    assert!(output.contains("Failed to read config file"));
}

#[test]
fn test_archive_written_to_data_dir() {
    let dir = tempdir().expect("Failed to create temp directory");
    let data_dir = dir.path().join("data");
    let config_path = dir.path().join("swarm.toml");
    fs::write(
        &config_path,
        format!(
            "[simulation]\ndata_dir = \"{}\"\n",
            data_dir.to_str().unwrap().replace('\\', "\\\\")
        ),
    )
    .unwrap();

    let (success, output) = run_command(&["--config", config_path.to_str().unwrap(), "--ticks", "5"]);
    assert!(success, "run failed: {}", output);
    assert!(data_dir.join("patterns.json").exists());
}
