use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_catalog-sync"))
}

fn setup_test_env(base_url: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/replica.sqlite"

[catalog]
base_url = "{}"
page_size = 100
max_retries = 0

[log]
level = "warn"

[profiles]
ubi8 = ["registry.example.io/ubi8/*"]
nothing = []
"#,
        root.display(),
        base_url
    );

    let config_path = config_dir.join("catalog-sync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cli(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

async fn run_cli_async(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let config_path = config_path.to_path_buf();
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    tokio::task::spawn_blocking(move || {
        let refs: Vec<&str> = args.iter().map(|a| a.as_str()).collect();
        run_cli(&config_path, &refs)
    })
    .await
    .unwrap()
}

async fn mock_catalog() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/repositories"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {
                    "_id": "r1",
                    "registry": "registry.example.io",
                    "repository": "ubi8/ubi",
                    "last_update_date": "2024-03-01T10:00:00Z"
                },
                {
                    "_id": "r2",
                    "registry": "registry.example.io",
                    "repository": "ubi9/ubi",
                    "last_update_date": "2024-03-01T10:00:00Z"
                }
            ],
            "page": 0,
            "page_size": 100,
            "total": 2
        })))
        .mount(&server)
        .await;

    for (repository, image_id, digest) in [
        ("ubi8/ubi", "i1", "sha256:aaa"),
        ("ubi9/ubi", "i2", "sha256:bbb"),
    ] {
        Mock::given(method("GET"))
            .and(path(format!(
                "/v1/repositories/registry/registry.example.io/repository/{}/images",
                repository
            )))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "_id": image_id, "image_id": digest, "last_update_date": "2024-03-01T10:00:00Z" }
                ],
                "page": 0,
                "page_size": 100,
                "total": 1
            })))
            .mount(&server)
            .await;
    }

    for image_id in ["i1", "i2"] {
        Mock::given(method("GET"))
            .and(path(format!("/v1/images/id/{}/vulnerabilities", image_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [ { "cve_id": "CVE-2024-0001" } ],
                "page": 0,
                "page_size": 100,
                "total": 1
            })))
            .mount(&server)
            .await;
    }

    server
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:1");

    let (stdout, stderr, success) = run_cli(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:1");

    let (_, _, success1) = run_cli(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_cli(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_profiles_lists_configured_profiles() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:1");

    let (stdout, _, success) = run_cli(&config_path, &["profiles"]);
    assert!(success);
    assert!(stdout.contains("ubi8"));
    assert!(stdout.contains("registry.example.io/ubi8/*"));
}

#[test]
fn test_stats_on_empty_replica() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:1");

    run_cli(&config_path, &["init"]);
    let (stdout, stderr, success) = run_cli(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Repositories:   0"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_cli(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_unknown_profile_fails() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:1");

    run_cli(&config_path, &["init"]);
    let (_, stderr, success) = run_cli(&config_path, &["sync", "--profile", "zzz"]);
    assert!(!success);
    assert!(stderr.contains("Unknown profile"));
}

#[test]
fn test_unreachable_catalog_fails_run() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:1");

    run_cli(&config_path, &["init"]);
    let (_, _, success) = run_cli(&config_path, &["sync"]);
    assert!(!success, "enumeration failure should fail the run");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_then_resync() {
    let server = mock_catalog().await;
    let (_tmp, config_path) = setup_test_env(&server.uri());

    run_cli_async(&config_path, &["init"]).await;

    let (stdout, stderr, success) = run_cli_async(&config_path, &["sync"]).await;
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("synced: 2"));
    assert!(stdout.contains("images: +2 ~0"));
    assert!(stdout.contains("cves: +1"));
    assert!(stdout.contains("ok"));

    let (stdout, _, success) = run_cli_async(&config_path, &["sync"]).await;
    assert!(success);
    assert!(stdout.contains("repositories: +0 ~0"), "got: {}", stdout);
    assert!(stdout.contains("images: +0 ~0"));

    let (stdout, _, _) = run_cli_async(&config_path, &["stats"]).await;
    assert!(stdout.contains("Repositories:   2"));
    assert!(stdout.contains("CVEs:           1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_with_profile() {
    let server = mock_catalog().await;
    let (_tmp, config_path) = setup_test_env(&server.uri());

    run_cli_async(&config_path, &["init"]).await;

    let (stdout, stderr, success) =
        run_cli_async(&config_path, &["sync", "--profile", "ubi8"]).await;
    assert!(success, "sync failed: {}", stderr);
    assert!(stdout.contains("profile: ubi8"));
    assert!(stdout.contains("repositories in scope: 1"));
    assert!(stdout.contains("synced: 1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_dry_run() {
    let server = mock_catalog().await;
    let (_tmp, config_path) = setup_test_env(&server.uri());

    run_cli_async(&config_path, &["init"]).await;

    let (stdout, _, success) = run_cli_async(&config_path, &["sync", "--dry-run"]).await;
    assert!(success);
    assert!(stdout.contains("dry-run"));
    assert!(stdout.contains("repositories: +2"));

    let (stdout, _, _) = run_cli_async(&config_path, &["stats"]).await;
    assert!(stdout.contains("Repositories:   0"));
}
