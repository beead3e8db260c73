use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// Domain Models
// ============================================================================
//
// Payload shapes published by the producing services. Producers serialize
// documents whose identifier may appear as `id` or `_id`; both are folded
// into `EntityId` here, at the boundary, and nowhere else.
//
// ============================================================================

/// Canonical identifier of an origin entity. Replicas reuse it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Result<Self, DecodeError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DecodeError::InvalidIdentifier("empty identifier".to_string()));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read an identifier out of a JSON value (string or integer).
    pub fn from_json(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::String(s) => Self::new(s.as_str()),
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::new(n.to_string()),
            other => Err(DecodeError::InvalidIdentifier(format!(
                "expected string or integer, got {}",
                json_kind(other)
            ))),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Field names producers use for the origin identifier, in precedence order.
pub const ID_FIELDS: [&str; 2] = ["id", "_id"];

/// Remove both identifier variants from `payload` and return the canonical id.
///
/// A null or blank variant yields to the other one; it is only reported as
/// invalid when no usable variant exists.
pub fn take_entity_id(payload: &mut Map<String, Value>) -> Result<EntityId, DecodeError> {
    let mut found = None;
    let mut blank = None;
    for field in ID_FIELDS {
        match payload.remove(field) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) if s.trim().is_empty() => {
                blank.get_or_insert(Value::String(s));
            }
            Some(value) => {
                found.get_or_insert(value);
            }
        }
    }
    match found.or(blank) {
        Some(value) => EntityId::from_json(&value),
        None => Err(DecodeError::MissingIdentifier),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse a message body into a JSON object.
pub fn parse_object(body: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_slice::<Value>(body)? {
        Value::Object(map) => Ok(map),
        other => Err(DecodeError::NotAnObject(json_kind(&other))),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("payload carries neither `id` nor `_id`")]
    MissingIdentifier,

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("invalid {kind} payload: {source}")]
    InvalidFields {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("no decoder for topic {0}")]
    UnsupportedTopic(String),
}

// ============================================================================
// Replicated Entities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Product,
    Order,
    Payment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Product => "product",
            EntityKind::Order => "order",
            EntityKind::Payment => "payment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(EntityKind::User),
            "product" => Some(EntityKind::Product),
            "order" => Some(EntityKind::Order),
            "payment" => Some(EntityKind::Payment),
            _ => None,
        }
    }

    /// Position of `status` in this kind's lifecycle, if the kind has one.
    pub fn status_rank(&self, status: &str) -> Option<u8> {
        match self {
            EntityKind::Payment => status.parse::<PaymentStatus>().ok().map(|s| s.rank()),
            EntityKind::Order => status.parse::<OrderStatus>().ok().map(|s| s.rank()),
            EntityKind::User | EntityKind::Product => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }

    /// Completed and failed are both terminal.
    pub fn rank(&self) -> u8 {
        match self {
            PaymentStatus::Pending => 0,
            PaymentStatus::Completed | PaymentStatus::Failed => 1,
        }
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(DecodeError::InvalidField {
                field: "status",
                reason: format!("unknown payment status `{}`", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Confirmed => 1,
            OrderStatus::Shipped => 2,
            OrderStatus::Delivered | OrderStatus::Cancelled => 3,
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "shipped" => Ok(OrderStatus::Shipped),
            "delivered" => Ok(OrderStatus::Delivered),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(DecodeError::InvalidField {
                field: "status",
                reason: format!("unknown order status `{}`", other),
            }),
        }
    }
}

// ============================================================================
// Created-event payloads (allowed replica fields)
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Price {
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "INR".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProductImage {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UserCreated {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub firstname: Option<String>,
    #[serde(default)]
    pub lastname: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProductCreated {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub seller: String,
    pub price: Price,
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub images: Vec<ProductImage>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: String,
    pub qty: i64,
    pub price: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub zip_code: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    #[serde(default)]
    pub user_id: Option<String>,
    pub items: Vec<OrderItem>,
    pub total_amount: f64,
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub shipping_address: Option<Address>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCreated {
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub status: Option<PaymentStatus>,
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub razorpay_order_id: Option<String>,
}

/// Extra fields a payment status event may carry alongside the identifier.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusFields {
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}

// ============================================================================
// Authenticated request context
// ============================================================================

/// Identity attached by upstream authentication middleware.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct AuthContext {
    #[serde(default, alias = "_id", alias = "userId")]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub firstname: Option<String>,
    #[serde(default)]
    pub lastname: Option<String>,
}

impl AuthContext {
    /// Identity used for per-caller limits, if the token carried one.
    pub fn identity(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_either_id_field_is_accepted() {
        let mut a = object(json!({"id": "u1", "username": "a"}));
        let mut b = object(json!({"_id": "u1", "username": "a"}));
        assert_eq!(take_entity_id(&mut a).unwrap().as_str(), "u1");
        assert_eq!(take_entity_id(&mut b).unwrap().as_str(), "u1");
        assert!(!a.contains_key("id"));
        assert!(!b.contains_key("_id"));
    }

    #[test]
    fn test_id_takes_precedence_over_underscore_id() {
        let mut payload = object(json!({"id": "primary", "_id": "secondary"}));
        assert_eq!(take_entity_id(&mut payload).unwrap().as_str(), "primary");
        assert!(payload.is_empty());
    }

    #[test]
    fn test_null_id_falls_back_to_underscore_id() {
        let mut payload = object(json!({"id": null, "_id": "o1"}));
        assert_eq!(take_entity_id(&mut payload).unwrap().as_str(), "o1");
    }

    #[test]
    fn test_blank_id_falls_back_to_underscore_id() {
        let mut payload = object(json!({"id": "", "_id": "65f0c0ffee"}));
        assert_eq!(take_entity_id(&mut payload).unwrap().as_str(), "65f0c0ffee");
        assert!(payload.is_empty());

        let mut spaces = object(json!({"id": "o1", "_id": "  "}));
        assert_eq!(take_entity_id(&mut spaces).unwrap().as_str(), "o1");
    }

    #[test]
    fn test_numeric_id_is_rendered_verbatim() {
        let mut payload = object(json!({"_id": 42}));
        assert_eq!(take_entity_id(&mut payload).unwrap().as_str(), "42");
    }

    #[test]
    fn test_missing_or_invalid_id_is_rejected() {
        assert!(matches!(
            take_entity_id(&mut object(json!({"title": "x"}))),
            Err(DecodeError::MissingIdentifier)
        ));
        assert!(matches!(
            take_entity_id(&mut object(json!({"id": ""}))),
            Err(DecodeError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            take_entity_id(&mut object(json!({"id": {"$oid": "x"}}))),
            Err(DecodeError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_parse_object_rejects_non_objects() {
        assert!(matches!(parse_object(b"[1,2]"), Err(DecodeError::NotAnObject("array"))));
        assert!(matches!(parse_object(b"{not json"), Err(DecodeError::InvalidJson(_))));
    }

    #[test]
    fn test_status_ranks() {
        assert_eq!(EntityKind::Payment.status_rank("pending"), Some(0));
        assert_eq!(EntityKind::Payment.status_rank("completed"), Some(1));
        assert_eq!(EntityKind::Payment.status_rank("failed"), Some(1));
        assert_eq!(EntityKind::Order.status_rank("shipped"), Some(2));
        assert_eq!(EntityKind::User.status_rank("pending"), None);
        assert_eq!(EntityKind::Payment.status_rank("refunded"), None);
    }

    #[test]
    fn test_auth_context_identity_aliases() {
        let ctx: AuthContext = serde_json::from_value(json!({"_id": "u9", "role": "seller"})).unwrap();
        assert_eq!(ctx.identity(), Some("u9"));

        let ctx: AuthContext = serde_json::from_value(json!({"userId": "u7"})).unwrap();
        assert_eq!(ctx.identity(), Some("u7"));

        assert_eq!(AuthContext::default().identity(), None);
    }
}
