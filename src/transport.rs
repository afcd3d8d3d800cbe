//! Transport client owning the single persistent connection.
//!
//! Lifecycle (connect/disconnect/reconnect with bounded exponential
//! backoff), the auth handshake, and low-level frame send/receive with
//! acknowledgment correlation. Inbound event frames are handed to a
//! dispatcher installed by the multiplexer; the transport itself carries
//! no business knowledge.
//!
//! One `Transport` per process. It is constructed explicitly at
//! application boot and shared by reference; consumers reach it only
//! through the multiplexer's contract.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::events::{EventName, WireFrame, PROTOCOL_VERSION};
use crate::presence::Announcer;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Callback receiving every inbound named event (name + raw payload).
pub type EventDispatcher = Arc<dyn Fn(EventName, Value) + Send + Sync>;

// ============================================================================
// Error types
// ============================================================================

/// Errors surfaced by the sync core.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The server rejected the auth token. Fatal to the current attempt;
    /// a fresh token is required before retrying.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Transport-level failure. Transient; drives the backoff policy.
    #[error("network failure: {0}")]
    Network(String),

    /// Malformed inbound frame. Covers a single frame, never the
    /// connection.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The transport is not connected.
    #[error("transport is not connected")]
    NotConnected,

    /// The server acknowledged an emitted event negatively.
    #[error("server rejected request: {0}")]
    Rejected(String),

    /// No acknowledgment arrived within the configured window.
    #[error("acknowledgment timed out after {0} ms")]
    AckTimeout(u64),
}

// ============================================================================
// Connection state
// ============================================================================

/// Runtime state of the connection.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Initial connection attempt in progress.
    Connecting,
    /// Connected (and presence-announced) since the given timestamp.
    Connected { since_ms: u64 },
    /// Connection lost; retrying with backoff.
    Reconnecting { attempt: u32 },
    /// Retries exhausted (or fatal error). Stays here until an explicit
    /// `connect()` is issued.
    Failed { error: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Snapshot surfaced through the status channel. Other parts of the
/// dashboard (the connected/disconnected indicator, refetch-on-reconnect
/// logic) watch this instead of holding the transport.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub last_error: Option<String>,
}

/// Handle to an established connection epoch. Two `connect()` calls that
/// coalesced into one handshake return equal handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub epoch: u64,
}

// ============================================================================
// Token source
// ============================================================================

/// Supplies the current auth token. Re-read at every connection attempt;
/// tokens may rotate between attempts, so the transport never caches one.
pub trait TokenSource: Send + Sync {
    /// The current token, or `None` when no session is active.
    fn token(&self) -> Option<String>;
}

/// Fixed token (tests, long-lived service credentials).
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct Transport {
    config: SyncConfig,
    tokens: Arc<dyn TokenSource>,
    state: parking_lot::RwLock<ConnectionState>,
    status_tx: watch::Sender<ConnectionStatus>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    pending: parking_lot::Mutex<HashMap<String, oneshot::Sender<Result<Value, SyncError>>>>,
    dispatcher: parking_lot::RwLock<Option<EventDispatcher>>,
    announcer: parking_lot::RwLock<Option<Arc<Announcer>>>,
    /// Serializes connection attempts so concurrent `connect()` calls
    /// coalesce into exactly one handshake.
    connect_gate: tokio::sync::Mutex<()>,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
    epoch: AtomicU64,
    protocol_errors: AtomicU64,
    /// Self-reference handed to the spawned read loop.
    weak: Weak<Transport>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("url", &self.config.url)
            .field("state", &*self.state.read())
            .field("epoch", &self.epoch.load(Ordering::SeqCst))
            .finish()
    }
}

impl Transport {
    pub fn new(config: SyncConfig, tokens: Arc<dyn TokenSource>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Arc::new_cyclic(|weak| Self {
            config,
            tokens,
            state: parking_lot::RwLock::new(ConnectionState::Disconnected),
            status_tx,
            writer: tokio::sync::Mutex::new(None),
            pending: parking_lot::Mutex::new(HashMap::new()),
            dispatcher: parking_lot::RwLock::new(None),
            announcer: parking_lot::RwLock::new(None),
            connect_gate: tokio::sync::Mutex::new(()),
            cancel: parking_lot::Mutex::new(None),
            epoch: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            weak: weak.clone(),
        })
    }

    /// Install the inbound event dispatcher (the multiplexer).
    pub fn set_dispatcher(&self, dispatcher: EventDispatcher) {
        *self.dispatcher.write() = Some(dispatcher);
    }

    /// Install the presence announcer fired on every successful connect.
    pub fn set_announcer(&self, announcer: Arc<Announcer>) {
        *self.announcer.write() = Some(announcer);
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected()
    }

    /// Subscribe to connection status transitions.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Connection epoch, bumped on every successful handshake.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Count of inbound frames dropped as malformed or unknown.
    pub fn protocol_error_count(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: ConnectionState) {
        let last_error = match &state {
            ConnectionState::Failed { error } => Some(error.clone()),
            _ => self.status_tx.borrow().last_error.clone(),
        };
        let status = ConnectionStatus {
            connected: state.is_connected(),
            state: state.clone(),
            last_error: if state.is_connected() { None } else { last_error },
        };
        *self.state.write() = state;
        self.status_tx.send_replace(status);
    }

    // ------------------------------------------------------------------
    // Connect / disconnect
    // ------------------------------------------------------------------

    /// Establish the connection.
    ///
    /// Idempotent when already connected: returns the existing handle
    /// without re-negotiating. Concurrent calls while an attempt is in
    /// flight wait for that attempt instead of issuing a second
    /// handshake. Transient failures are retried with exponential
    /// backoff up to `max_retries`; an auth rejection aborts immediately.
    pub async fn connect(&self) -> Result<ConnectionHandle, SyncError> {
        let _gate = self.connect_gate.lock().await;

        if self.is_connected() {
            return Ok(ConnectionHandle {
                epoch: self.epoch(),
            });
        }

        // A background reconnect may already be in flight; wait for it to
        // settle instead of racing it with a second dial.
        if matches!(self.state(), ConnectionState::Reconnecting { .. }) {
            return self.await_settled().await;
        }

        let cancel = self.reset_cancel_token();
        self.set_state(ConnectionState::Connecting);

        let mut attempt: u32 = 0;
        loop {
            match self.establish(&cancel).await {
                Ok(epoch) => return Ok(ConnectionHandle { epoch }),
                Err(SyncError::Auth(msg)) => {
                    self.set_state(ConnectionState::Failed { error: msg.clone() });
                    return Err(SyncError::Auth(msg));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.max_retries.max(1) {
                        let msg = e.to_string();
                        self.set_state(ConnectionState::Failed { error: msg });
                        return Err(e);
                    }
                    let backoff = self.config.backoff_for(attempt - 1);
                    warn!(
                        target: "sync",
                        error = %e,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "connect attempt failed, will retry"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Tear down the connection. Safe to call when already disconnected.
    ///
    /// In-flight emits reject with a network error; subscriptions held by
    /// the multiplexer are untouched.
    pub async fn disconnect(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.send(Message::Close(None)).await;
        }

        self.fail_pending("disconnected");
        self.set_state(ConnectionState::Disconnected);
    }

    /// Wait for an in-flight reconnect to settle into Connected or a
    /// terminal state.
    async fn await_settled(&self) -> Result<ConnectionHandle, SyncError> {
        let mut rx = self.status();
        loop {
            {
                let status = rx.borrow_and_update();
                match &status.state {
                    ConnectionState::Connected { .. } => {
                        let epoch = self.epoch();
                        return Ok(ConnectionHandle { epoch });
                    }
                    ConnectionState::Failed { error } => {
                        return Err(SyncError::Network(error.clone()));
                    }
                    ConnectionState::Disconnected => {
                        return Err(SyncError::NotConnected);
                    }
                    _ => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(SyncError::NotConnected);
            }
        }
    }

    fn reset_cancel_token(&self) -> CancellationToken {
        let mut slot = self.cancel.lock();
        if let Some(old) = slot.take() {
            old.cancel();
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        token
    }

    /// One full connection attempt: dial, handshake, announce, attach.
    ///
    /// The presence announcement goes out before the state flips to
    /// `Connected`, so no observer sees a connected-but-not-yet-joined
    /// window.
    async fn establish(&self, cancel: &CancellationToken) -> Result<u64, SyncError> {
        // Tokens rotate; always re-read at attempt time.
        let token = self
            .tokens
            .token()
            .ok_or_else(|| SyncError::Auth("no session token available".to_string()))?;

        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| SyncError::Network(format!("websocket connect failed: {e}")))?;

        let (mut write, mut read) = ws_stream.split();

        perform_handshake(
            &mut write,
            &mut read,
            &token,
            self.config.handshake_timeout_ms,
        )
        .await?;

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let announcer = self.announcer.read().clone();
        if let Some(announcer) = announcer {
            if let Err(e) = announcer.announce(&mut write, epoch).await {
                // Degraded, not fatal: role-scoped pushes will not arrive.
                warn!(target: "sync", error = %e, epoch, "presence announce failed");
            }
        }

        *self.writer.lock().await = Some(write);

        // disconnect() may have raced this attempt
        if cancel.is_cancelled() {
            self.writer.lock().await.take();
            return Err(SyncError::Network("connection cancelled".to_string()));
        }

        self.set_state(ConnectionState::Connected { since_ms: now_ms() });
        info!(target: "sync", epoch, url = %self.config.url, "sync connection established");

        if let Some(transport) = self.weak.upgrade() {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                transport.run_read_loop(read, cancel, epoch).await;
            });
        }

        Ok(epoch)
    }

    // ------------------------------------------------------------------
    // Read loop + reconnection
    // ------------------------------------------------------------------

    // Returns an explicitly-`Send` boxed future so the compiler does not
    // have to resolve the Send auto-trait across the
    // establish -> run_read_loop -> run_reconnect_loop -> establish
    // recursion cycle (which it cannot do by inference).
    fn run_read_loop(
        self: Arc<Self>,
        mut read: WsSource,
        cancel: CancellationToken,
        epoch: u64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(target: "sync", epoch, "read loop cancelled");
                    return;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(Message::Close(_))) => {
                            info!(target: "sync", epoch, "connection closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(target: "sync", epoch, error = %e, "read failed");
                            break;
                        }
                        None => {
                            info!(target: "sync", epoch, "connection stream ended");
                            break;
                        }
                    }
                }
            }
        }

        // Unexpected drop: clear the dead writer, reject in-flight emits,
        // then hand over to the reconnect policy.
        self.writer.lock().await.take();
        self.fail_pending("connection lost");

        if cancel.is_cancelled() {
            return;
        }

        if self.config.auto_reconnect && self.config.max_retries > 0 {
            self.run_reconnect_loop(cancel).await;
        } else {
            self.set_state(ConnectionState::Failed {
                error: "connection lost".to_string(),
            });
        }
        })
    }

    async fn run_reconnect_loop(&self, cancel: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.set_state(ConnectionState::Reconnecting { attempt });

            let backoff = self.config.backoff_for(attempt - 1);
            warn!(
                target: "sync",
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "connection lost, reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return,
            }

            match self.establish(&cancel).await {
                Ok(epoch) => {
                    info!(target: "sync", epoch, attempt, "reconnected");
                    return;
                }
                Err(SyncError::Auth(msg)) => {
                    // A rejected token cannot be fixed by retrying.
                    self.set_state(ConnectionState::Failed { error: msg });
                    return;
                }
                Err(e) => {
                    if attempt >= self.config.max_retries {
                        warn!(target: "sync", attempt, error = %e, "giving up on reconnect");
                        self.set_state(ConnectionState::Failed {
                            error: e.to_string(),
                        });
                        return;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Frame I/O
    // ------------------------------------------------------------------

    /// Send a frame without expecting an acknowledgment.
    pub async fn send_frame(&self, frame: &WireFrame) -> Result<(), SyncError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(SyncError::NotConnected)?;
        send_on(writer, frame).await
    }

    /// Send a frame and await the server's acknowledgment.
    pub async fn request(&self, name: EventName, payload: Value) -> Result<Value, SyncError> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let frame = WireFrame::request(id.clone(), name, payload);
        if let Err(e) = self.send_frame(&frame).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(Duration::from_millis(self.config.ack_timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Network(
                "connection closed before acknowledgment".to_string(),
            )),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(SyncError::AckTimeout(self.config.ack_timeout_ms))
            }
        }
    }

    /// Fold one inbound frame: acks resolve their pending request, named
    /// events go to the dispatcher, anything malformed is dropped.
    fn handle_frame(&self, text: &str) {
        let frame: WireFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(target: "sync", error = %e, "dropping unparseable frame");
                return;
            }
        };

        if frame.is_ack() {
            let id = frame.id.clone().unwrap_or_default();
            let sender = self.pending.lock().remove(&id);
            match sender {
                Some(sender) => {
                    let result = if frame.ok == Some(true) {
                        Ok(frame.payload.unwrap_or(Value::Null))
                    } else {
                        Err(SyncError::Rejected(
                            frame.error.unwrap_or_else(|| "request rejected".to_string()),
                        ))
                    };
                    let _ = sender.send(result);
                }
                None => {
                    debug!(target: "sync", id = %id, "ack for unknown request id");
                }
            }
            return;
        }

        let Some(event) = frame.event.as_deref() else {
            self.protocol_errors.fetch_add(1, Ordering::Relaxed);
            warn!(target: "sync", "dropping frame with neither event nor ack");
            return;
        };

        let Some(name) = EventName::parse(event) else {
            self.protocol_errors.fetch_add(1, Ordering::Relaxed);
            warn!(target: "sync", event = %event, "dropping frame with unknown event name");
            return;
        };

        let dispatcher = self.dispatcher.read().clone();
        if let Some(dispatch) = dispatcher {
            dispatch(name, frame.payload.unwrap_or(Value::Null));
        }
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, sender) in drained {
            let _ = sender.send(Err(SyncError::Network(reason.to_string())));
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

pub(crate) async fn send_on(sink: &mut WsSink, frame: &WireFrame) -> Result<(), SyncError> {
    let text = serde_json::to_string(frame).map_err(|e| SyncError::Protocol(e.to_string()))?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| SyncError::Network(format!("send failed: {e}")))
}

/// Send the auth handshake and validate the response.
async fn perform_handshake(
    write: &mut WsSink,
    read: &mut WsSource,
    token: &str,
    timeout_ms: u64,
) -> Result<(), SyncError> {
    let frame = WireFrame::request(
        Uuid::new_v4().to_string(),
        EventName::Auth,
        json!({ "token": token, "protocolVersion": PROTOCOL_VERSION }),
    );
    send_on(write, &frame)
        .await
        .map_err(|e| SyncError::Network(format!("handshake send failed: {e}")))?;

    let response = tokio::time::timeout(Duration::from_millis(timeout_ms), read.next())
        .await
        .map_err(|_| SyncError::Network(format!("handshake timed out after {timeout_ms} ms")))?;

    match response {
        Some(Ok(Message::Text(text))) => {
            let ack: WireFrame = serde_json::from_str(&text)
                .map_err(|e| SyncError::Protocol(format!("handshake response: {e}")))?;
            if ack.ok == Some(true) {
                Ok(())
            } else {
                Err(SyncError::Auth(
                    ack.error.unwrap_or_else(|| "handshake rejected".to_string()),
                ))
            }
        }
        Some(Ok(_)) => Err(SyncError::Protocol(
            "unexpected non-text handshake response".to_string(),
        )),
        Some(Err(e)) => Err(SyncError::Network(format!("handshake receive failed: {e}"))),
        None => Err(SyncError::Network(
            "connection closed during handshake".to_string(),
        )),
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

// ============================================================================
// Tests
// ============================================================================
