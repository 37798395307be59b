//! End-to-end tests for the `hn-ingest` binary
//!
//! Each test runs the binary in a scratch directory with its API pointed at
//! a mock server (or at a closed port when no network is wanted).

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;
use wiremock::{
    matchers::{method, path, path_regex},
    Mock, MockServer, Request, Respond, ResponseTemplate,
};

const OFFLINE_API: &str = "http://127.0.0.1:9";

fn hn_ingest(dir: &Path, api: &str) -> Command {
    let mut cmd = Command::cargo_bin("hn-ingest").unwrap();
    cmd.current_dir(dir)
        .env("HN_API_BASE_URL", api)
        .env("HN_OUTPUT_DIR", dir.join("items"))
        .env("HN_CHECKPOINT_PATH", dir.join("checkpoint.json"))
        .env("HN_RETRY_BASE_DELAY_MS", "5");
    cmd
}

struct EchoItem;

impl Respond for EchoItem {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let id: i64 = request
            .url
            .path()
            .trim_start_matches("/item/")
            .trim_end_matches(".json")
            .parse()
            .unwrap();

        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": id,
            "type": "comment",
            "by": "tester",
            "time": 1_700_000_000 + id,
            "text": format!("comment {id}"),
        }))
    }
}

async fn mock_api(max_id: i64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/maxitem.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(max_id.to_string()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/item/\d+\.json$"))
        .respond_with(EchoItem)
        .mount(&server)
        .await;
    server
}

#[test]
fn test_help_lists_commands() {
    let dir = TempDir::new().unwrap();
    hn_ingest(dir.path(), OFFLINE_API)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("fetch"))
        .stdout(predicate::str::contains("stats"))
        .stdout(predicate::str::contains("reset"))
        .stdout(predicate::str::contains("migrate"));
}

#[test]
fn test_stats_without_data() {
    let dir = TempDir::new().unwrap();
    hn_ingest(dir.path(), OFFLINE_API)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("No local data yet"));
}

#[test]
fn test_invalid_concurrency_fails() {
    let dir = TempDir::new().unwrap();
    hn_ingest(dir.path(), OFFLINE_API)
        .args(["fetch", "--concurrency", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_unreachable_api_fails() {
    let dir = TempDir::new().unwrap();
    hn_ingest(dir.path(), OFFLINE_API)
        .args(["fetch", "--start", "1", "--end", "10"])
        .assert()
        .failure();

    assert!(!dir.path().join("checkpoint.json").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_stats_migrate_reset() {
    let server = mock_api(50).await;
    let dir = TempDir::new().unwrap();

    hn_ingest(dir.path(), &server.uri())
        .args(["fetch", "--start", "1", "--end", "20", "--batch-size", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Fetch complete!"));

    let checkpoint: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("checkpoint.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(checkpoint["last_fetched_id"], 20);
    assert_eq!(checkpoint["partition_style"], "flat");

    hn_ingest(dir.path(), &server.uri())
        .args(["stats", "--tree"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Total items: 20"))
        .stdout(predicate::str::contains("Last fetched ID: 20"));

    hn_ingest(dir.path(), &server.uri())
        .args(["migrate", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Dry run"));

    hn_ingest(dir.path(), &server.uri())
        .args(["reset", "--data", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Checkpoint deleted"));

    assert!(!dir.path().join("checkpoint.json").exists());
    assert!(!dir.path().join("items").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_hive_layout() {
    let server = mock_api(30).await;
    let dir = TempDir::new().unwrap();

    hn_ingest(dir.path(), &server.uri())
        .args(["fetch", "--partition-style", "hive"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Layout: hive"));

    assert!(dir.path().join("items/year=2023/month=11").is_dir());
}
