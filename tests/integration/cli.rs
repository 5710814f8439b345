//! The `carbon-ingest` binary end to end against a temp database

use assert_cmd::Command;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

fn database_url(dir: &Path) -> String {
    format!("sqlite://{}", dir.join("cli.db").display())
}

fn carbon_ingest(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("carbon-ingest").unwrap();
    cmd.env_remove("CARBON_INGEST_CONFIG")
        .env_remove("CARBON_INGEST_DATABASE")
        .env("RUST_LOG", "carbon_ingest=warn")
        .args(["--database", &database_url(dir), "--output-format", "json"]);
    cmd
}

fn json_output(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).unwrap()
}

fn submit(dir: &Path, activities: &[&str]) -> String {
    let mut cmd = carbon_ingest(dir);
    cmd.args(["submit", "--org", "org-1", "--workspace", "ws-1"]);
    for id in activities {
        cmd.args(["--activity", id]);
    }
    json_output(&mut cmd)["job_id"].as_str().unwrap().to_string()
}

#[test]
fn test_submit_then_status_and_list() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();

    let job_id = submit(dir, &["act-1", "act-2"]);
    assert!(job_id.starts_with("job_"), "{job_id}");

    let detail = json_output(carbon_ingest(dir).args(["status", &job_id]));
    assert_eq!(detail["job"]["status"], "pending");
    assert_eq!(detail["job"]["activity_count"], 2);
    assert_eq!(detail["activities"][1]["activity_id"], "act-2");

    let page = json_output(carbon_ingest(dir).args(["list", "--org", "org-1"]));
    assert_eq!(page["total"], 1);
    assert_eq!(page["jobs"][0]["id"], job_id.as_str());
}

#[test]
fn test_worker_once_fails_job_with_missing_activities() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    let job_id = submit(dir, &["missing"]);

    let stats = json_output(carbon_ingest(dir).args(["worker", "--once", "--worker-id", "cli-worker"]));
    assert_eq!(stats["jobs_claimed"], 1);
    assert_eq!(stats["batches_failed"], 1);

    let detail = json_output(carbon_ingest(dir).args(["status", &job_id]));
    assert_eq!(detail["job"]["status"], "failed");
    assert_eq!(detail["activities"][0]["error_class"], "not_found");
}

#[test]
fn test_cancel_and_health() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    let job_id = submit(dir, &["act-1"]);

    let cancelled = json_output(carbon_ingest(dir).args(["cancel", &job_id]));
    assert_eq!(cancelled["job"]["status"], "cancelled");

    let health = json_output(carbon_ingest(dir).arg("health"));
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["queue_depth"], 0);
    assert_eq!(health["scheduler_running"], false);

    // cancelling twice is an invalid transition
    carbon_ingest(dir).args(["cancel", &job_id]).assert().failure();
}

#[test]
fn test_retry_rejects_pending_job() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    let job_id = submit(dir, &["act-1"]);

    carbon_ingest(dir).args(["retry", &job_id]).assert().failure();
}

#[test]
fn test_config_file_sets_submission_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    let config = dir.join("carbon-ingest.yaml");
    std::fs::write(&config, "scheduler:\n  max_retries: 7\n  fail_fast: true\n").unwrap();

    let mut cmd = carbon_ingest(dir);
    cmd.args(["--config", config.to_str().unwrap()]).args([
        "submit",
        "--org",
        "org-1",
        "--workspace",
        "ws-1",
        "--activity",
        "act-1",
    ]);
    let job_id = json_output(&mut cmd)["job_id"].as_str().unwrap().to_string();

    let detail = json_output(carbon_ingest(dir).args(["status", &job_id]));
    assert_eq!(detail["job"]["max_retries"], 7);
    assert_eq!(detail["job"]["fail_fast"], true);
}

#[test]
fn test_invalid_arguments_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();

    // --activity is required
    carbon_ingest(dir)
        .args(["submit", "--org", "org-1", "--workspace", "ws-1"])
        .assert()
        .failure();

    // inverted window
    carbon_ingest(dir)
        .args([
            "ingest",
            "--provider",
            "aws",
            "--org",
            "org-1",
            "--workspace",
            "ws-1",
            "--start",
            "2024-02-01",
            "--end",
            "2024-01-01",
        ])
        .assert()
        .failure();

    carbon_ingest(dir).args(["status", "job_missing"]).assert().failure();
}
