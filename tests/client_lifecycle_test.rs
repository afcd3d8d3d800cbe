//! Integration tests for the connection lifecycle.
//!
//! Each test spins up a real WebSocket server on an ephemeral port,
//! connects a client against it, and exercises handshake, presence,
//! reconnection, and teardown behavior.

mod common;

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::net::TcpListener;

use common::{test_config, wait_until, TestServer};
use storesync::client::SyncClient;
use storesync::events::EventName;
use storesync::transport::{ConnectionState, StaticToken, SyncError, TokenSource};

fn test_client(url: &str) -> SyncClient {
    SyncClient::new(test_config(url), Arc::new(StaticToken::new("tok"))).unwrap()
}

// ---------------------------------------------------------------------------
// 1. Handshake carries the token; presence follows before connect resolves
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_handshake_then_presence() {
    let mut server = TestServer::start().await;
    let client = test_client(&server.url);

    client.connect().await.unwrap();
    assert!(client.is_connected());
    assert!(client.status().borrow().connected);

    let auth = server.expect_frame().await;
    assert_eq!(auth["event"], "AUTH");
    assert_eq!(auth["payload"]["token"], "tok");
    assert_eq!(auth["payload"]["protocolVersion"], 1);

    let join = server.expect_frame().await;
    assert_eq!(join["event"], "join");
    assert_eq!(join["payload"]["role"], "admin");

    assert_eq!(server.handshake_count(), 1);
    client.disconnect().await;
}

// ---------------------------------------------------------------------------
// 2. Concurrent connects coalesce into exactly one handshake
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_connects_share_one_handshake() {
    let server = TestServer::start().await;
    let client = Arc::new(test_client(&server.url));

    let a = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    let b = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };

    let handle_a = a.await.unwrap().unwrap();
    let handle_b = b.await.unwrap().unwrap();

    assert_eq!(handle_a, handle_b);
    assert_eq!(server.handshake_count(), 1);

    // a third call while connected re-negotiates nothing
    let handle_c = client.connect().await.unwrap();
    assert_eq!(handle_c, handle_a);
    assert_eq!(server.handshake_count(), 1);

    client.disconnect().await;
}

// ---------------------------------------------------------------------------
// 3. Auth rejection is fatal: no retries, Failed state
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auth_rejection_fails_without_retry() {
    let server = TestServer::start().await;
    server.set_reject_auth(true);
    let client = test_client(&server.url);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, SyncError::Auth(_)));
    assert!(!client.is_connected());
    assert!(matches!(
        client.status().borrow().state,
        ConnectionState::Failed { .. }
    ));
    // a rejected token must not be retried against the server
    assert_eq!(server.handshake_count(), 1);
}

// ---------------------------------------------------------------------------
// 4. Unexpected drop: reconnect, re-auth, re-announce
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_after_drop() {
    let mut server = TestServer::start().await;
    let client = test_client(&server.url);
    client.connect().await.unwrap();

    // swallow the first session's AUTH + join
    server.expect_frame().await;
    server.expect_frame().await;

    // record every status transition so the disconnected window is
    // observable even though the reconnect is fast
    let mut status = client.status();
    let transitions = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let transitions_in = transitions.clone();
    let watcher = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            transitions_in.lock().push(status.borrow().clone());
        }
    });

    server.drop_connections();

    wait_until("reconnected", || {
        server.handshake_count() == 2 && client.is_connected()
    })
    .await;

    let transitions = transitions.lock().clone();
    assert!(
        transitions.iter().any(|s| !s.connected),
        "status observable never reported the drop"
    );
    assert!(transitions.last().unwrap().connected);
    watcher.abort();

    // the new epoch re-authenticated and re-announced
    let auth = server.expect_frame().await;
    assert_eq!(auth["event"], "AUTH");
    let join = server.expect_frame().await;
    assert_eq!(join["event"], "join");

    client.disconnect().await;
}

// ---------------------------------------------------------------------------
// 5. Token is re-read at every attempt, never cached
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rotated_token_used_on_reconnect() {
    let mut server = TestServer::start().await;

    let current = Arc::new(parking_lot::Mutex::new("tok-1".to_string()));
    let tokens = {
        let current = current.clone();
        move || Some(current.lock().clone())
    };
    let client = SyncClient::new(test_config(&server.url), Arc::new(tokens)).unwrap();

    client.connect().await.unwrap();
    let auth = server.expect_frame().await;
    assert_eq!(auth["payload"]["token"], "tok-1");
    server.expect_frame().await; // join

    // rotate the token, then force a reconnect
    *current.lock() = "tok-2".to_string();
    server.drop_connections();
    wait_until("second handshake", || server.handshake_count() == 2).await;

    let auth = server.expect_frame().await;
    assert_eq!(auth["payload"]["token"], "tok-2");

    client.disconnect().await;
}

// ---------------------------------------------------------------------------
// 6. Retries are bounded with non-decreasing spacing, then Failed
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backoff_is_bounded_and_non_decreasing() {
    // A listener that accepts and immediately drops every socket, so
    // each attempt fails at the WebSocket handshake and leaves a
    // timestamp behind.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let attempts = Arc::new(parking_lot::Mutex::new(Vec::<Instant>::new()));
    let attempts_in = attempts.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            attempts_in.lock().push(Instant::now());
            drop(stream);
        }
    });

    let config = storesync::config::SyncConfig {
        url: format!("ws://{addr}/sync"),
        reconnect_interval_ms: 50,
        max_retries: 3,
        ..storesync::config::SyncConfig::default()
    };
    let client = SyncClient::new(config, Arc::new(StaticToken::new("tok"))).unwrap();

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
    assert!(matches!(
        client.status().borrow().state,
        ConnectionState::Failed { .. }
    ));

    let attempts = attempts.lock().clone();
    assert_eq!(attempts.len(), 3, "exactly max_retries attempts");

    // gaps between consecutive attempts must not shrink (50ms, then 100ms)
    let gap_1 = attempts[1] - attempts[0];
    let gap_2 = attempts[2] - attempts[1];
    assert!(
        gap_2 + std::time::Duration::from_millis(10) >= gap_1,
        "backoff spacing decreased: {gap_1:?} then {gap_2:?}"
    );

    accept_task.abort();
}

// ---------------------------------------------------------------------------
// 7. Explicit connect after Failed starts a fresh cycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_explicit_retry_after_failed() {
    let server = TestServer::start().await;
    server.set_reject_auth(true);
    let client = test_client(&server.url);

    assert!(client.connect().await.is_err());
    assert!(matches!(
        client.status().borrow().state,
        ConnectionState::Failed { .. }
    ));

    // the operator fixes the credential problem; an explicit connect works
    server.set_reject_auth(false);
    client.connect().await.unwrap();
    assert!(client.is_connected());

    client.disconnect().await;
}

// ---------------------------------------------------------------------------
// 8. Emit round trip + rejection while down
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_emit_acknowledgment() {
    let server = TestServer::start().await;
    let client = test_client(&server.url);
    client.connect().await.unwrap();

    let ack = client
        .emit(EventName::Join, json!({ "role": "admin" }))
        .await
        .unwrap();
    assert_eq!(ack["received"], "join");

    client.disconnect().await;

    let err = client
        .emit(EventName::Join, json!({ "role": "admin" }))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotConnected));
}

// ---------------------------------------------------------------------------
// 9. Disconnect resets state; a later connect opens a fresh epoch
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_then_new_epoch() {
    let server = TestServer::start().await;
    let client = test_client(&server.url);

    let first = client.connect().await.unwrap();
    client.disconnect().await;
    assert!(!client.is_connected());
    assert_eq!(
        client.status().borrow().state,
        ConnectionState::Disconnected
    );

    let second = client.connect().await.unwrap();
    assert!(second.epoch > first.epoch);
    assert_eq!(server.handshake_count(), 2);

    client.disconnect().await;
}

// ---------------------------------------------------------------------------
// 10. Token source returning None surfaces as an auth error
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_token_is_auth_error() {
    let server = TestServer::start().await;
    let no_session = || None::<String>;
    assert!(TokenSource::token(&no_session).is_none());

    let client = SyncClient::new(test_config(&server.url), Arc::new(no_session)).unwrap();
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, SyncError::Auth(_)));
    assert_eq!(server.handshake_count(), 0);
}
