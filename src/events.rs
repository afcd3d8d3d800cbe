//! Wire protocol: the frame envelope and the typed event contract.
//!
//! Every event that can cross the connection is a member of the closed
//! [`EventName`] set, paired with a typed payload in [`ServerEvent`]. A
//! frame naming an unknown event, or carrying a payload that does not
//! deserialize into the shape its name promises, is a per-frame protocol
//! error: the frame is dropped and logged, the connection is unaffected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol version sent in the auth handshake.
pub const PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// Event names
// ============================================================================

/// The closed set of named events carried over the transport.
///
/// Inbound names are SCREAMING_SNAKE on the wire; the transport-level
/// `AUTH`/`join`/`error` names round out the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    ProductCreated,
    ProductUpdated,
    ProductDeleted,
    CollectionCreated,
    CollectionUpdated,
    CollectionDeleted,
    NewOrder,
    NewUser,
    OrderStatusUpdated,
    /// Non-fatal server notice (`error` on the wire).
    Notice,
    /// Outbound role announcement.
    Join,
    /// Outbound auth handshake.
    Auth,
}

impl EventName {
    /// Wire spelling of this event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProductCreated => "PRODUCT_CREATED",
            Self::ProductUpdated => "PRODUCT_UPDATED",
            Self::ProductDeleted => "PRODUCT_DELETED",
            Self::CollectionCreated => "COLLECTION_CREATED",
            Self::CollectionUpdated => "COLLECTION_UPDATED",
            Self::CollectionDeleted => "COLLECTION_DELETED",
            Self::NewOrder => "NEW_ORDER",
            Self::NewUser => "NEW_USER",
            Self::OrderStatusUpdated => "ORDER_STATUS_UPDATED",
            Self::Notice => "error",
            Self::Join => "join",
            Self::Auth => "AUTH",
        }
    }

    /// Parse a wire event name. Returns `None` for names outside the set.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PRODUCT_CREATED" => Some(Self::ProductCreated),
            "PRODUCT_UPDATED" => Some(Self::ProductUpdated),
            "PRODUCT_DELETED" => Some(Self::ProductDeleted),
            "COLLECTION_CREATED" => Some(Self::CollectionCreated),
            "COLLECTION_UPDATED" => Some(Self::CollectionUpdated),
            "COLLECTION_DELETED" => Some(Self::CollectionDeleted),
            "NEW_ORDER" => Some(Self::NewOrder),
            "NEW_USER" => Some(Self::NewUser),
            "ORDER_STATUS_UPDATED" => Some(Self::OrderStatusUpdated),
            "error" => Some(Self::Notice),
            "join" => Some(Self::Join),
            "AUTH" => Some(Self::Auth),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payload shapes
// ============================================================================

/// A catalog product as pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Partial product update. Absent fields leave the record untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductPatch {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// A product collection. Update events carry the full payload, so the
/// same shape serves create, update, and (id-only) delete frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub products: Vec<String>,
}

/// Reference to a record by id only (delete frames).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "_id")]
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: String,
    #[serde(default)]
    pub order_number: String,
    #[serde(default)]
    pub total_amount: f64,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreated {
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusChanged {
    pub order_id: String,
    #[serde(default)]
    pub order_number: String,
    #[serde(default)]
    pub status: String,
}

/// Non-fatal server-side notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerNotice {
    #[serde(default)]
    pub message: String,
}

// ============================================================================
// Typed event union
// ============================================================================

/// An inbound event paired with its decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ProductCreated(Product),
    ProductUpdated(ProductPatch),
    ProductDeleted(EntityRef),
    CollectionCreated(Collection),
    CollectionUpdated(Collection),
    CollectionDeleted(Collection),
    NewOrder(OrderCreated),
    NewUser(UserCreated),
    OrderStatusUpdated(OrderStatusChanged),
    Notice(ServerNotice),
}

/// Payload decode failures. Each covers a single frame; none are fatal
/// to the connection.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload did not match the shape for {event}: {source}")]
    Payload {
        event: EventName,
        source: serde_json::Error,
    },
    #[error("{0} is not an inbound event")]
    NotInbound(EventName),
}

impl ServerEvent {
    /// The event name this payload arrived under.
    pub fn name(&self) -> EventName {
        match self {
            Self::ProductCreated(_) => EventName::ProductCreated,
            Self::ProductUpdated(_) => EventName::ProductUpdated,
            Self::ProductDeleted(_) => EventName::ProductDeleted,
            Self::CollectionCreated(_) => EventName::CollectionCreated,
            Self::CollectionUpdated(_) => EventName::CollectionUpdated,
            Self::CollectionDeleted(_) => EventName::CollectionDeleted,
            Self::NewOrder(_) => EventName::NewOrder,
            Self::NewUser(_) => EventName::NewUser,
            Self::OrderStatusUpdated(_) => EventName::OrderStatusUpdated,
            Self::Notice(_) => EventName::Notice,
        }
    }

    /// Decode a raw payload under the given event name.
    pub fn decode(name: EventName, payload: Value) -> Result<Self, DecodeError> {
        fn parse<T: serde::de::DeserializeOwned>(
            name: EventName,
            payload: Value,
        ) -> Result<T, DecodeError> {
            serde_json::from_value(payload).map_err(|source| DecodeError::Payload {
                event: name,
                source,
            })
        }

        match name {
            EventName::ProductCreated => parse(name, payload).map(Self::ProductCreated),
            EventName::ProductUpdated => parse(name, payload).map(Self::ProductUpdated),
            EventName::ProductDeleted => parse(name, payload).map(Self::ProductDeleted),
            EventName::CollectionCreated => parse(name, payload).map(Self::CollectionCreated),
            EventName::CollectionUpdated => parse(name, payload).map(Self::CollectionUpdated),
            EventName::CollectionDeleted => parse(name, payload).map(Self::CollectionDeleted),
            EventName::NewOrder => parse(name, payload).map(Self::NewOrder),
            EventName::NewUser => parse(name, payload).map(Self::NewUser),
            EventName::OrderStatusUpdated => parse(name, payload).map(Self::OrderStatusUpdated),
            EventName::Notice => parse(name, payload).map(Self::Notice),
            EventName::Join | EventName::Auth => Err(DecodeError::NotInbound(name)),
        }
    }
}

// ============================================================================
// Frame envelope
// ============================================================================

/// Raw JSON envelope for every frame on the wire.
///
/// Requests carry `id` + `event` + `payload`; acknowledgments echo the
/// `id` with `ok` (and `error` when `ok` is false); pushed events carry
/// `event` + `payload` with no `id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WireFrame {
    /// An un-acknowledged outbound event frame.
    pub fn event(name: EventName, payload: Value) -> Self {
        Self {
            event: Some(name.as_str().to_string()),
            payload: Some(payload),
            ..Self::default()
        }
    }

    /// An outbound frame expecting an acknowledgment under `id`.
    pub fn request(id: String, name: EventName, payload: Value) -> Self {
        Self {
            id: Some(id),
            event: Some(name.as_str().to_string()),
            payload: Some(payload),
            ..Self::default()
        }
    }

    /// Whether this frame acknowledges a prior request.
    pub fn is_ack(&self) -> bool {
        self.id.is_some() && self.ok.is_some()
    }
}

// ============================================================================
// Tests
// ============================================================================
