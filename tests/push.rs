//! Push Integration Tests
//!
//! Server-side delivery through the push endpoint and the management API.


use integration_harness::{TestConfig, cleanup, connect_user, next_text, spawn_daemon, wait_for_port};
use serde_json::{Value, json};
use std::time::Duration;

/// Test: pushToWeb delivers the message verbatim
#[tokio::test]
#[ignore] // Run with: cargo test --test push -- --ignored
async fn test_push_endpoint() {
    let config = TestConfig::new("push_endpoint", 35460);

    let mut daemon = spawn_daemon(&config).expect("Failed to spawn daemon");
    assert!(
        wait_for_port(config.daemon_bind, Duration::from_secs(30)).await,
        "Daemon did not start in time"
    );

    let mut bob = connect_user(&config, "bob").await.unwrap();
    let client = reqwest::Client::new();

    let resp = client
        .get(config.http_url("/pushToWeb"))
        .query(&[("toUserId", "bob"), ("message", "server notice")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "MSG SEND SUCCESS");
    assert_eq!(next_text(&mut bob).await.unwrap(), "server notice");

    let resp = client
        .get(config.http_url("/pushToWeb"))
        .query(&[("toUserId", "ghost"), ("message", "lost")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let _ = daemon.kill();
    cleanup(&config);
}

/// Test: Management API push and kick
#[tokio::test]
#[ignore]
async fn test_management_push_and_kick() {
    let config = TestConfig::new("push_admin", 35470);

    let mut daemon = spawn_daemon(&config).expect("Failed to spawn daemon");
    assert!(wait_for_port(config.management_bind, Duration::from_secs(30)).await);

    let mut carol = connect_user(&config, "carol").await.unwrap();
    let client = reqwest::Client::new();

    let resp = client
        .post(config.admin_url("/admin/push"))
        .json(&json!({"to_user_id": "carol", "message": "from admin"}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success(), "Expected 2xx status");
    assert_eq!(next_text(&mut carol).await.unwrap(), "from admin");

    let resp = client
        .delete(config.admin_url("/admin/users/carol"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let users: Vec<String> = client
        .get(config.admin_url("/admin/users"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(users.is_empty());

    let stats: Value = client
        .get(config.admin_url("/admin/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["online_count"], 0);

    let _ = daemon.kill();
    cleanup(&config);
}
