//! Notification aggregation.
//!
//! Folds order/user/status pushes into a most-recent-first feed backing
//! the notification bell: an unread counter, mark-read operations, and a
//! bounded recent view over a collection that grows until `clear_all`.
//! All read-state operations are local; no server round trip.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::events::{EventName, OrderCreated, OrderStatusChanged, ServerEvent, UserCreated};
use crate::mux::{EventMux, Subscription};
use crate::reconcile::{EntityRecord, EntitySet, OrderPolicy};
use crate::transport::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    Order,
    User,
    Status,
    Other,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::User => "user",
            Self::Status => "status",
            Self::Other => "other",
        }
    }
}

/// A single feed entry.
///
/// The id is synthesized client-side from category, source id, and
/// receipt time, so a push without a server id still reconciles.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: String,
    pub category: NotificationCategory,
    pub title: String,
    pub body: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Build a locally originated notification.
    pub fn local(
        category: NotificationCategory,
        source_id: &str,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: synthetic_id(category, source_id),
            category,
            title: title.into(),
            body: body.into(),
            read: false,
            created_at: Utc::now(),
        }
    }

    fn from_order(order: &OrderCreated) -> Self {
        let number = display_number(&order.order_number, &order.order_id);
        Self {
            id: synthetic_id(NotificationCategory::Order, &order.order_id),
            category: NotificationCategory::Order,
            title: "New order".to_string(),
            body: format!(
                "Order #{} placed by {} for ${:.2}",
                number, order.customer_name, order.total_amount
            ),
            read: false,
            created_at: order.created_at.unwrap_or_else(Utc::now),
        }
    }

    fn from_user(user: &UserCreated) -> Self {
        Self {
            id: synthetic_id(NotificationCategory::User, &user.user_id),
            category: NotificationCategory::User,
            title: "New customer".to_string(),
            body: format!("{} ({}) signed up", user.name, user.email),
            read: false,
            created_at: user.created_at.unwrap_or_else(Utc::now),
        }
    }

    fn from_status(status: &OrderStatusChanged) -> Self {
        let number = display_number(&status.order_number, &status.order_id);
        Self {
            id: synthetic_id(NotificationCategory::Status, &status.order_id),
            category: NotificationCategory::Status,
            title: "Order status updated".to_string(),
            body: format!("Order #{} is now {}", number, status.status),
            read: false,
            created_at: Utc::now(),
        }
    }
}

impl EntityRecord for Notification {
    fn id(&self) -> &str {
        &self.id
    }
}

fn synthetic_id(category: NotificationCategory, source_id: &str) -> String {
    format!("{}:{}:{}", category.as_str(), source_id, now_ms())
}

fn display_number<'a>(number: &'a str, fallback: &'a str) -> &'a str {
    if number.is_empty() {
        fallback
    } else {
        number
    }
}

// ============================================================================
// Feed
// ============================================================================

struct FeedState {
    set: EntitySet<Notification>,
    unread: usize,
}

/// Most-recent-first notification feed with read tracking.
pub struct NotificationFeed {
    state: Arc<RwLock<FeedState>>,
    _subs: Vec<Subscription>,
}

impl NotificationFeed {
    /// Subscribe to the notification-bearing event names on `mux`.
    pub fn attach(mux: &EventMux) -> Self {
        let state = Arc::new(RwLock::new(FeedState {
            set: EntitySet::new(OrderPolicy::MoveToFront),
            unread: 0,
        }));

        let orders = state.clone();
        let users = state.clone();
        let statuses = state.clone();
        let subs = vec![
            mux.on(EventName::NewOrder, move |event| {
                if let ServerEvent::NewOrder(order) = event {
                    push_record(&orders, Notification::from_order(order));
                }
            }),
            mux.on(EventName::NewUser, move |event| {
                if let ServerEvent::NewUser(user) = event {
                    push_record(&users, Notification::from_user(user));
                }
            }),
            mux.on(EventName::OrderStatusUpdated, move |event| {
                if let ServerEvent::OrderStatusUpdated(status) = event {
                    push_record(&statuses, Notification::from_status(status));
                }
            }),
        ];

        Self { state, _subs: subs }
    }

    /// Add a notification directly (locally originated entries).
    pub fn push(&self, notification: Notification) {
        push_record(&self.state, notification);
    }

    /// The `n` most recent notifications, newest first.
    pub fn recent(&self, n: usize) -> Vec<Notification> {
        self.state.read().set.iter().take(n).cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.state.read().set.snapshot()
    }

    pub fn unread_count(&self) -> usize {
        self.state.read().unread
    }

    pub fn len(&self) -> usize {
        self.state.read().set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().set.is_empty()
    }

    /// Mark one notification read. Returns `false` for unknown ids and
    /// already-read entries.
    pub fn mark_read(&self, id: &str) -> bool {
        let mut state = self.state.write();
        let mut flipped = false;
        state.set.for_each_mut(|record| {
            if record.id == id && !record.read {
                record.read = true;
                flipped = true;
            }
        });
        if flipped {
            state.unread = state.unread.saturating_sub(1);
        }
        flipped
    }

    /// Mark every notification read and zero the unread counter.
    pub fn mark_all_read(&self) {
        let mut state = self.state.write();
        state.set.for_each_mut(|record| record.read = true);
        state.unread = 0;
    }

    /// Drop every notification.
    pub fn clear_all(&self) {
        let mut state = self.state.write();
        state.set.clear();
        state.unread = 0;
    }
}

fn push_record(state: &RwLock<FeedState>, notification: Notification) {
    let mut state = state.write();
    // a replayed duplicate replaces its record without recounting
    if !state.set.contains(&notification.id) {
        state.unread += 1;
    }
    state.set.upsert(notification);
}

// ============================================================================
// Tests
// ============================================================================
