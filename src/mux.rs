//! Event multiplexer: named-event subscribe/unsubscribe/publish layered
//! on the transport.
//!
//! Many independent consumers share the one connection without
//! cross-talk: each event name carries an ordered handler list, handlers
//! are invoked in registration order, and removing one handler never
//! touches its siblings. Registration is independent of the transport's
//! attachment, so subscribing immediately after requesting a connection
//! (without awaiting it) loses nothing.
//!
//! A panicking handler is caught at the dispatch boundary and logged; it
//! reaches neither sibling handlers nor the read loop.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::events::{EventName, ServerEvent};
use crate::transport::{ConnectionStatus, SyncError, Transport};

/// Unregistration token for a single handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct RegisteredHandler {
    id: HandlerId,
    func: Arc<dyn Fn(&ServerEvent) + Send + Sync>,
}

type Registry = RwLock<HashMap<EventName, Vec<RegisteredHandler>>>;

/// Guard for one registered handler. Dropping it unregisters the handler;
/// `off`/`off_all` on the mux cover callers that lost their guard.
pub struct Subscription {
    name: EventName,
    id: HandlerId,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn event_name(&self) -> EventName {
        self.name
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Unregister now instead of at drop.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            remove_handler(&registry, self.name, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

pub struct EventMux {
    transport: Arc<Transport>,
    registry: Arc<Registry>,
    next_id: AtomicU64,
}

impl EventMux {
    /// Build the multiplexer over a transport and install its dispatcher.
    pub fn new(transport: Arc<Transport>) -> Arc<Self> {
        let mux = Arc::new(Self {
            transport: Arc::clone(&transport),
            registry: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&mux);
        transport.set_dispatcher(Arc::new(move |name, payload| {
            if let Some(mux) = weak.upgrade() {
                mux.dispatch(name, payload);
            }
        }));

        mux
    }

    /// Inbound entry point, invoked from the transport's read loop.
    pub(crate) fn dispatch(&self, name: EventName, payload: Value) {
        dispatch_to(&self.registry, name, payload);
    }

    /// Register `handler` for `name`. Handlers for the same name run in
    /// registration order per inbound event.
    pub fn on(
        &self,
        name: EventName,
        handler: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .write()
            .entry(name)
            .or_default()
            .push(RegisteredHandler {
                id,
                func: Arc::new(handler),
            });

        Subscription {
            name,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Remove exactly one handler. Returns `false` when it was already
    /// gone (e.g. its guard dropped first).
    pub fn off(&self, name: EventName, id: HandlerId) -> bool {
        remove_handler(&self.registry, name, id)
    }

    /// Remove every handler for `name`. Returns how many were removed.
    pub fn off_all(&self, name: EventName) -> usize {
        match self.registry.write().remove(&name) {
            Some(handlers) => handlers.len(),
            None => 0,
        }
    }

    /// Drop every handler for every name (session teardown).
    pub fn clear(&self) {
        self.registry.write().clear();
    }

    /// Send an outbound event and await the server's acknowledgment.
    /// Rejects with [`SyncError::NotConnected`] when the transport is
    /// down.
    pub async fn emit(&self, name: EventName, payload: Value) -> Result<Value, SyncError> {
        self.transport.request(name, payload).await
    }

    /// Number of event names with at least one registered handler.
    pub fn active_event_names(&self) -> usize {
        self.registry.read().len()
    }

    /// Number of handlers registered for `name`.
    pub fn handler_count(&self, name: EventName) -> usize {
        self.registry.read().get(&name).map_or(0, Vec::len)
    }

    /// Connection status surface, for consumers deciding when to refetch.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.transport.status()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }
}

impl std::fmt::Debug for EventMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMux")
            .field("active_event_names", &self.active_event_names())
            .finish()
    }
}

/// Remove one handler; drops the name's entry when it was the last so
/// the active-name set shrinks with it.
fn remove_handler(registry: &Registry, name: EventName, id: HandlerId) -> bool {
    let mut registry = registry.write();
    let Some(handlers) = registry.get_mut(&name) else {
        return false;
    };
    let before = handlers.len();
    handlers.retain(|h| h.id != id);
    let removed = handlers.len() < before;
    if handlers.is_empty() {
        registry.remove(&name);
    }
    removed
}

/// Decode and fan out one inbound event.
fn dispatch_to(registry: &Registry, name: EventName, payload: Value) {
    let event = match ServerEvent::decode(name, payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(target: "sync", event = %name, error = %e, "dropping malformed event frame");
            return;
        }
    };

    if let ServerEvent::Notice(notice) = &event {
        info!(target: "sync", message = %notice.message, "server notice");
    }

    // Snapshot under the read lock, invoke outside it: a handler may
    // register or drop subscriptions of its own.
    let handlers: Vec<(HandlerId, Arc<dyn Fn(&ServerEvent) + Send + Sync>)> = {
        let registry = registry.read();
        match registry.get(&name) {
            Some(handlers) => handlers
                .iter()
                .map(|h| (h.id, Arc::clone(&h.func)))
                .collect(),
            None => return,
        }
    };

    for (id, handler) in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
            warn!(
                target: "sync",
                event = %name,
                handler = ?id,
                "subscriber panicked; suppressed"
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
