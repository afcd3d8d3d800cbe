//! Dashboard-facing sync client.
//!
//! Wires the transport, multiplexer, and presence announcer into one
//! handle the dashboard shell constructs at boot and shares by
//! reference. Consumers subscribe through it and never touch the raw
//! transport.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

use crate::config::{ConfigError, SyncConfig};
use crate::events::{EventName, ServerEvent};
use crate::mux::{EventMux, HandlerId, Subscription};
use crate::presence::Announcer;
use crate::transport::{
    ConnectionHandle, ConnectionStatus, SyncError, TokenSource, Transport,
};

pub struct SyncClient {
    transport: Arc<Transport>,
    mux: Arc<EventMux>,
    announcer: Arc<Announcer>,
}

impl SyncClient {
    /// Build a client from a validated config and a token source owned
    /// by the session/login collaborator.
    pub fn new(config: SyncConfig, tokens: Arc<dyn TokenSource>) -> Result<Self, ConfigError> {
        config.validate()?;

        let announcer = Arc::new(Announcer::new(config.role.clone()));
        let transport = Transport::new(config, tokens);
        transport.set_announcer(Arc::clone(&announcer));
        let mux = EventMux::new(Arc::clone(&transport));

        Ok(Self {
            transport,
            mux,
            announcer,
        })
    }

    /// Establish the connection (idempotent; see
    /// [`Transport::connect`]). Presence is announced before this
    /// resolves.
    pub async fn connect(&self) -> Result<ConnectionHandle, SyncError> {
        self.transport.connect().await
    }

    /// Tear down the connection, keeping subscriptions registered so a
    /// later `connect()` resumes delivery.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Register a handler for a named event.
    pub fn on(
        &self,
        name: EventName,
        handler: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.mux.on(name, handler)
    }

    /// Remove one handler by its id.
    pub fn off(&self, name: EventName, id: HandlerId) -> bool {
        self.mux.off(name, id)
    }

    /// Remove every handler for a name.
    pub fn off_all(&self, name: EventName) -> usize {
        self.mux.off_all(name)
    }

    /// Send an outbound event and await the server's acknowledgment.
    pub async fn emit(&self, name: EventName, payload: Value) -> Result<Value, SyncError> {
        self.mux.emit(name, payload).await
    }

    /// Connection status transitions, for the connected indicator and
    /// refetch-on-reconnect logic.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.transport.status()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// The multiplexer, for reconcilers attaching their subscriptions.
    pub fn mux(&self) -> &Arc<EventMux> {
        &self.mux
    }

    /// Role announced on each connect.
    pub fn role(&self) -> &str {
        self.announcer.role()
    }

    /// Called by the session collaborator when it detects the token is
    /// no longer valid: drop the connection and every subscription.
    pub async fn auth_revoked(&self) {
        info!(target: "sync", "session token revoked, tearing down");
        self.transport.disconnect().await;
        self.mux.clear();
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("role", &self.announcer.role())
            .field("connected", &self.is_connected())
            .finish()
    }
}
