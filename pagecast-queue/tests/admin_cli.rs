//! Integration tests for pagecast-queue

use std::fs;
use std::sync::Arc;

use assert_cmd::Command;
use libpagecast::config::QueueConfig;
use libpagecast::credentials::StaticCredentialProvider;
use libpagecast::platforms::mock::MockPublisher;
use libpagecast::{
    Database, FailureKind, Platform, PlatformTarget, Post, QueueProcessor, QueueStatus,
    RetryPolicy,
};
use predicates::prelude::*;
use tempfile::TempDir;

/// Helper to escape path for TOML on Windows
fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

fn setup_test_env() -> (TempDir, String, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("queue.db");

    let config_content = format!(
        "[database]\npath = \"{}\"\n",
        escape_path_for_toml(&db_path.to_string_lossy())
    );
    fs::write(&config_path, config_content).unwrap();

    (
        temp_dir,
        config_path.to_string_lossy().to_string(),
        db_path.to_string_lossy().to_string(),
    )
}

fn queue_cmd(config_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("pagecast-queue").unwrap();
    cmd.env("PAGECAST_CONFIG", config_path)
        .env_remove("PAGECAST_DB_PATH");
    cmd
}

fn json_output(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

/// One post whose only publish attempt was rejected; returns its queue id
async fn create_failed_item(db_path: &str) -> String {
    let db = Database::new(db_path).await.unwrap();
    let post = Post::new("owner-1", "Holiday hours", PlatformTarget::Facebook, "page-1")
        .scheduled_at(chrono::Utc::now().timestamp() - 60);
    db.create_post(&post).await.unwrap();

    let processor = QueueProcessor::new(
        Arc::new(db.clone()),
        Arc::new(StaticCredentialProvider::new().with_owner("owner-1", "t", Some("page-1"), None)),
        RetryPolicy::immediate(),
        QueueConfig::default(),
    )
    .with_publisher(Arc::new(MockPublisher::failing(
        Platform::Facebook,
        FailureKind::PermissionDenied,
        "token expired",
    )));
    processor.run_cycle(5).await.unwrap();

    db.queue_items_for_post(&post.id).await.unwrap().remove(0).queue_id
}

#[test]
fn test_status_on_empty_queue() {
    let (_temp, config_path, _db_path) = setup_test_env();

    let status = json_output(queue_cmd(&config_path).args(["status", "--format", "json"]));
    assert_eq!(status["total"], 0);
    assert_eq!(status["pending"], 0);
    assert_eq!(status["window_secs"], 24 * 60 * 60);

    queue_cmd(&config_path)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Total:      0"));
}

#[test]
fn test_invalid_format_is_invalid_input() {
    let (_temp, config_path, _db_path) = setup_test_env();

    queue_cmd(&config_path)
        .args(["status", "--format", "yaml"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Invalid format"));
}

#[test]
fn test_invalid_duration_is_invalid_input() {
    let (_temp, config_path, _db_path) = setup_test_env();

    queue_cmd(&config_path)
        .args(["clear", "--older-than", "a while"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Invalid duration"));
}

#[test]
fn test_retry_unknown_item_is_not_found() {
    let (_temp, config_path, _db_path) = setup_test_env();

    queue_cmd(&config_path)
        .args(["retry", "no-such-item"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Not found"));
}

#[tokio::test]
async fn test_failed_item_can_be_inspected_and_retried() {
    let (_temp, config_path, db_path) = setup_test_env();
    let queue_id = create_failed_item(&db_path).await;

    let failed = json_output(queue_cmd(&config_path).args(["failed", "--format", "json"]));
    let failed = failed.as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["queue_id"], queue_id.as_str());
    assert_eq!(failed[0]["status"], "failed");

    queue_cmd(&config_path)
        .arg("errors")
        .assert()
        .success()
        .stdout(predicate::str::contains("token expired"));

    queue_cmd(&config_path)
        .args(["retry", &queue_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Re-queued"));

    // A pending item cannot be retried again
    queue_cmd(&config_path)
        .args(["retry", &queue_id])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid status transition"));

    let status = json_output(queue_cmd(&config_path).args(["status", "--format", "json"]));
    assert_eq!(status["pending"], 1);
    assert_eq!(status["failed"], 0);
}

#[tokio::test]
async fn test_retry_all_requeues_failures() {
    let (_temp, config_path, db_path) = setup_test_env();
    create_failed_item(&db_path).await;

    queue_cmd(&config_path)
        .arg("retry-all")
        .assert()
        .success()
        .stdout(predicate::str::contains("Re-queued 1 item(s)"));

    queue_cmd(&config_path)
        .arg("failed")
        .assert()
        .success()
        .stdout(predicate::str::contains("No retryable failures"));
}

#[tokio::test]
async fn test_reclaim_returns_abandoned_claims() {
    let (_temp, config_path, db_path) = setup_test_env();
    let queue_id = {
        let db = Database::new(&db_path).await.unwrap();
        let post = Post::new("owner-1", "Flash sale", PlatformTarget::Facebook, "page-1")
            .scheduled_at(chrono::Utc::now().timestamp() - 60);
        db.create_post(&post).await.unwrap();
        let now = chrono::Utc::now().timestamp();
        db.enqueue_due_posts(now, 3).await.unwrap();
        db.claim_batch(5, now).await.unwrap().remove(0).queue_id
    };

    // Default threshold leaves a fresh claim alone
    queue_cmd(&config_path)
        .arg("reclaim")
        .assert()
        .success()
        .stdout(predicate::str::contains("Reclaimed 0"));

    queue_cmd(&config_path)
        .args(["reclaim", "--older-than", "0s"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Reclaimed 1"));

    let db = Database::new(&db_path).await.unwrap();
    let item = db.get_queue_item(&queue_id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Pending);
}

#[test]
fn test_clear_on_empty_queue() {
    let (_temp, config_path, _db_path) = setup_test_env();

    queue_cmd(&config_path)
        .arg("clear")
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 0 completed item(s)"));
}
