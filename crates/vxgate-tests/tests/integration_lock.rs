// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Device-lock semantics across real client connections.

use std::time::{Duration, Instant};

use vxgate_tests::common::{spawn_gateway, Vxi11TestClient};

const LOCKED_ECHO_CONFIG: &str = r#"
devices:
  echo:
    type: loopback
    requires_lock: true
"#;

#[tokio::test]
async fn test_lock_contention_between_links() {
    let gateway = spawn_gateway(LOCKED_ECHO_CONFIG).await;
    let mut c1 = Vxi11TestClient::connect(gateway.port).await;
    let mut c2 = Vxi11TestClient::connect(gateway.port).await;

    let l1 = c1.create_link("echo").await;
    let l2 = c2.create_link("echo").await;

    // L1 takes the lock.
    assert_eq!(c1.device_lock(l1.lid, true, 1000).await, 0);

    // L2 without wait: error 11 immediately.
    assert_eq!(c2.device_lock(l2.lid, false, 0).await, 11);

    // L2 with a 50 ms wait: error 11 after roughly that long.
    let start = Instant::now();
    assert_eq!(c2.device_lock(l2.lid, true, 50).await, 11);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(40), "failed too fast: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "failed too slow: {:?}", elapsed);

    // After L1 unlocks, L2 wins.
    assert_eq!(c1.device_unlock(l1.lid).await, 0);
    assert_eq!(c2.device_lock(l2.lid, true, 1000).await, 0);
}

#[tokio::test]
async fn test_unlock_without_lock_is_error_12() {
    let gateway = spawn_gateway(LOCKED_ECHO_CONFIG).await;
    let mut client = Vxi11TestClient::connect(gateway.port).await;
    let link = client.create_link("echo").await;
    assert_eq!(client.device_unlock(link.lid).await, 12);
}

#[tokio::test]
async fn test_create_link_with_lock_flag() {
    let gateway = spawn_gateway(LOCKED_ECHO_CONFIG).await;
    let mut c1 = Vxi11TestClient::connect(gateway.port).await;
    let mut c2 = Vxi11TestClient::connect(gateway.port).await;

    let l1 = c1.create_link_with_lock("echo", true, 1000).await;
    assert_eq!(l1.error, 0);

    let l2 = c2.create_link("echo").await;
    assert_eq!(l2.error, 0);
    assert_eq!(c2.device_lock(l2.lid, false, 0).await, 11);

    // Destroying the locked link frees the device.
    assert_eq!(c1.destroy_link(l1.lid).await, 0);
    assert_eq!(c2.device_lock(l2.lid, false, 0).await, 0);
}

#[tokio::test]
async fn test_connection_drop_releases_lock() {
    let gateway = spawn_gateway(LOCKED_ECHO_CONFIG).await;

    let mut c1 = Vxi11TestClient::connect(gateway.port).await;
    let l1 = c1.create_link("echo").await;
    assert_eq!(c1.device_lock(l1.lid, true, 1000).await, 0);

    // The client vanishes without DESTROY_LINK.
    c1.abandon();

    // Cleanup runs when the server notices the closed socket; a fresh
    // client must be able to lock shortly after.
    let mut c2 = Vxi11TestClient::connect(gateway.port).await;
    let l2 = c2.create_link("echo").await;

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if c2.device_lock(l2.lid, false, 0).await == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "lock was never released after disconnect");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(gateway.engine.active_links().await, 1);
}

#[tokio::test]
async fn test_opportunistic_lock_on_first_write() {
    let gateway = spawn_gateway(LOCKED_ECHO_CONFIG).await;
    let mut c1 = Vxi11TestClient::connect(gateway.port).await;
    let mut c2 = Vxi11TestClient::connect(gateway.port).await;

    let l1 = c1.create_link("echo").await;
    let l2 = c2.create_link("echo").await;

    // No explicit DEVICE_LOCK: writing locks the device for L1.
    let written = c1.device_write(l1.lid, b"claim\n").await;
    assert_eq!(written.error, 0);

    assert_eq!(c2.device_lock(l2.lid, false, 0).await, 11);
    assert_eq!(gateway.engine.lock_owners().await["echo"], Some(l1.lid));
}
