//! Presence announcement.
//!
//! After every successful auth handshake the client announces its
//! role-scoped membership (the "admin room") so the server scopes push
//! events to this connection. The announcement fires exactly once per
//! connection epoch, before the connect handle is surfaced to callers.
//!
//! A rejected announcement is a degradation, not a failure: role-scoped
//! pushes simply will not arrive, which shows up as stale data. It never
//! tears down the connection.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use tracing::debug;

use crate::events::{EventName, WireFrame};
use crate::transport::{send_on, SyncError, WsSink};

pub struct Announcer {
    role: String,
    /// Epoch of the last announcement; 0 means never announced.
    last_epoch: AtomicU64,
}

impl Announcer {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            last_epoch: AtomicU64::new(0),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Epoch of the last successful announcement, if any.
    pub fn announced_epoch(&self) -> Option<u64> {
        match self.last_epoch.load(Ordering::SeqCst) {
            0 => None,
            epoch => Some(epoch),
        }
    }

    /// Mark `epoch` as announced. Returns `false` when that epoch was
    /// already announced (repeat call within the same connection).
    fn mark(&self, epoch: u64) -> bool {
        self.last_epoch.swap(epoch, Ordering::SeqCst) != epoch
    }

    /// The join frame for this role.
    pub fn join_frame(&self) -> WireFrame {
        WireFrame::event(EventName::Join, json!({ "role": self.role }))
    }

    /// Announce membership for the given connection epoch. Idempotent:
    /// a second call for the same epoch sends nothing.
    pub(crate) async fn announce(&self, sink: &mut WsSink, epoch: u64) -> Result<(), SyncError> {
        if !self.mark(epoch) {
            debug!(target: "sync", epoch, role = %self.role, "already announced for epoch");
            return Ok(());
        }

        send_on(sink, &self.join_frame()).await?;
        debug!(target: "sync", epoch, role = %self.role, "announced presence");
        Ok(())
    }
}
