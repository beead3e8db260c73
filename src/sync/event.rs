use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::models::{
    parse_object, take_entity_id, DecodeError, EntityId, EntityKind, OrderCreated, OrderStatus,
    PaymentCreated, PaymentStatus, PaymentStatusFields, ProductCreated, UserCreated,
};
use crate::topics::Topic;

use super::replica::{ReplicaRecord, StatusUpdate};

// ============================================================================
// Inbound replica events
// ============================================================================

/// A decoded event for the replica store, with its identifier normalized.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    Created(ReplicaRecord),
    Status(StatusUpdate),
}

impl ReplicaEvent {
    pub fn decode(topic: Topic, body: &[u8], now: DateTime<Utc>) -> Result<Self, DecodeError> {
        let mut payload = parse_object(body)?;
        let id = take_entity_id(&mut payload)?;

        match topic {
            Topic::DashboardUserCreated => {
                let user: UserCreated = typed(EntityKind::User, payload)?;
                created(EntityKind::User, id, &user, None, now)
            }
            Topic::DashboardProductCreated => {
                let product: ProductCreated = typed(EntityKind::Product, payload)?;
                created(EntityKind::Product, id, &product, None, now)
            }
            Topic::DashboardOrderCreated => {
                let order: OrderCreated = typed(EntityKind::Order, payload)?;
                let status = order.status.unwrap_or(OrderStatus::Pending).as_str();
                created(EntityKind::Order, id, &order, Some(status), now)
            }
            Topic::DashboardPaymentCreated => {
                let payment: PaymentCreated = typed(EntityKind::Payment, payload)?;
                let status = payment.status.unwrap_or(PaymentStatus::Pending).as_str();
                created(EntityKind::Payment, id, &payment, Some(status), now)
            }
            Topic::DashboardPaymentInitiated => payment_status(id, PaymentStatus::Pending, payload, now),
            Topic::DashboardPaymentCompleted => payment_status(id, PaymentStatus::Completed, payload, now),
            Topic::DashboardPaymentFailed => payment_status(id, PaymentStatus::Failed, payload, now),
            other => Err(DecodeError::UnsupportedTopic(other.to_string())),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            ReplicaEvent::Created(record) => record.kind,
            ReplicaEvent::Status(update) => update.kind,
        }
    }

    pub fn id(&self) -> &EntityId {
        match self {
            ReplicaEvent::Created(record) => &record.id,
            ReplicaEvent::Status(update) => &update.id,
        }
    }
}

fn typed<T: DeserializeOwned>(kind: EntityKind, payload: Map<String, Value>) -> Result<T, DecodeError> {
    serde_json::from_value(Value::Object(payload)).map_err(|source| DecodeError::InvalidFields {
        kind: kind.as_str(),
        source,
    })
}

/// Project a typed payload onto the replica document. Only the fields of the
/// payload type survive; status lives on the record itself.
fn created<T: Serialize>(
    kind: EntityKind,
    id: EntityId,
    payload: &T,
    status: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ReplicaEvent, DecodeError> {
    let mut document = serde_json::to_value(payload).map_err(|source| DecodeError::InvalidFields {
        kind: kind.as_str(),
        source,
    })?;
    if let Value::Object(map) = &mut document {
        map.remove("status");
    }
    Ok(ReplicaEvent::Created(ReplicaRecord::new(
        kind,
        id,
        document,
        status.map(str::to_string),
        now,
    )))
}

fn payment_status(
    id: EntityId,
    status: PaymentStatus,
    payload: Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<ReplicaEvent, DecodeError> {
    let extra: PaymentStatusFields = typed(EntityKind::Payment, payload)?;
    let fields = match serde_json::to_value(extra) {
        Ok(Value::Object(map)) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        _ => Map::new(),
    };

    Ok(ReplicaEvent::Status(StatusUpdate {
        kind: EntityKind::Payment,
        id,
        status: status.as_str().to_string(),
        fields,
        received_at: now,
    }))
}
