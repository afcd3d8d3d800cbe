#![allow(dead_code)]

//! In-process WebSocket server for integration tests.
//!
//! Speaks the sync wire protocol: expects an `AUTH` handshake frame
//! first, then acknowledges emitted frames, records everything the
//! client sends, and lets tests push events or drop live connections.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

use storesync::config::SyncConfig;

pub struct TestServer {
    pub url: String,
    handshakes: Arc<AtomicUsize>,
    reject_auth: Arc<AtomicBool>,
    push_tx: broadcast::Sender<String>,
    drop_tx: broadcast::Sender<()>,
    seen_rx: mpsc::UnboundedReceiver<Value>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("ws://{addr}/sync");

        let handshakes = Arc::new(AtomicUsize::new(0));
        let reject_auth = Arc::new(AtomicBool::new(false));
        let (push_tx, _) = broadcast::channel::<String>(64);
        let (drop_tx, _) = broadcast::channel::<()>(8);
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        let accept_task = {
            let handshakes = handshakes.clone();
            let reject_auth = reject_auth.clone();
            let push_tx = push_tx.clone();
            let drop_tx = drop_tx.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    tokio::spawn(run_session(
                        stream,
                        handshakes.clone(),
                        reject_auth.clone(),
                        push_tx.clone(),
                        drop_tx.clone(),
                        seen_tx.clone(),
                    ));
                }
            })
        };

        Self {
            url,
            handshakes,
            reject_auth,
            push_tx,
            drop_tx,
            seen_rx,
            accept_task,
        }
    }

    /// Push a named event to every live session.
    pub fn push(&self, event: &str, payload: Value) {
        let frame = json!({ "event": event, "payload": payload }).to_string();
        let _ = self.push_tx.send(frame);
    }

    /// Kill every live session without a close handshake (simulated
    /// network drop).
    pub fn drop_connections(&self) {
        let _ = self.drop_tx.send(());
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// How many auth handshakes the server has processed.
    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Next frame received from a client; panics after 2 s.
    pub async fn expect_frame(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(2), self.seen_rx.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("server frame channel closed")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn run_session(
    stream: TcpStream,
    handshakes: Arc<AtomicUsize>,
    reject_auth: Arc<AtomicBool>,
    push_tx: broadcast::Sender<String>,
    drop_tx: broadcast::Sender<()>,
    seen_tx: mpsc::UnboundedSender<Value>,
) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };

    // First frame must be the auth handshake.
    let first = match ws.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => return,
    };
    let frame: Value = match serde_json::from_str(&first) {
        Ok(value) => value,
        Err(_) => return,
    };
    let _ = seen_tx.send(frame.clone());
    handshakes.fetch_add(1, Ordering::SeqCst);

    let id = frame["id"].as_str().unwrap_or_default().to_string();
    if reject_auth.load(Ordering::SeqCst) {
        let reply = json!({ "id": id, "ok": false, "error": "invalid token" }).to_string();
        let _ = ws.send(Message::Text(reply.into())).await;
        let _ = ws.close(None).await;
        return;
    }
    let reply = json!({ "id": id, "ok": true }).to_string();
    if ws.send(Message::Text(reply.into())).await.is_err() {
        return;
    }

    let mut push_rx = push_tx.subscribe();
    let mut drop_rx = drop_tx.subscribe();

    loop {
        tokio::select! {
            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame: Value = match serde_json::from_str(&text) {
                            Ok(value) => value,
                            Err(_) => continue,
                        };
                        let _ = seen_tx.send(frame.clone());
                        // acknowledge request frames
                        if let (Some(id), Some(event)) =
                            (frame["id"].as_str(), frame["event"].as_str())
                        {
                            let ack = json!({
                                "id": id,
                                "ok": true,
                                "payload": { "received": event }
                            })
                            .to_string();
                            if ws.send(Message::Text(ack.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            Ok(frame) = push_rx.recv() => {
                if ws.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = drop_rx.recv() => break,
        }
    }
}

/// Sync config tuned for fast test turnaround.
pub fn test_config(url: &str) -> SyncConfig {
    SyncConfig {
        url: url.to_string(),
        reconnect_interval_ms: 20,
        max_retries: 3,
        handshake_timeout_ms: 2_000,
        ack_timeout_ms: 2_000,
        ..SyncConfig::default()
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
