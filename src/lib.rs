//! storesync core library
//!
//! Realtime push-synchronization core for the storefront admin
//! dashboard: one persistent authenticated WebSocket connection,
//! multiplexed across independent consumers (product tables, the
//! collection editor, the notification bell), each folding pushed
//! change events into locally held collections without duplicate,
//! stale, or out-of-order state.

pub mod client;
pub mod config;
pub mod events;
pub mod logging;
pub mod mux;
pub mod notify;
pub mod presence;
pub mod reconcile;
pub mod transport;
