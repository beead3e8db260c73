use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{EntityId, EntityKind};

// ============================================================================
// Replica Records - per-identifier state machine
// ============================================================================
//
//   unknown ──created──▶ created ──status──▶ status ──status──▶ ...
//
// A replica is created once, keyed by the origin identifier, and afterwards
// only moves forward through its kind's status lattice. Replays of the same
// status are no-ops; statuses that would move it backwards are stale.
//
// ============================================================================

/// Local copy of an entity owned by another service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub kind: EntityKind,
    pub id: EntityId,
    pub document: Value,
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial status mutation addressed to a replica by identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub kind: EntityKind,
    pub id: EntityId,
    pub status: String,
    pub fields: Map<String, Value>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    Changed { from: Option<String>, to: String },
    Unchanged,
    Stale { current: String, incoming: String },
}

impl ReplicaRecord {
    pub fn new(
        kind: EntityKind,
        id: EntityId,
        document: Value,
        status: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            id,
            document,
            status,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status update in place.
    pub fn apply(&mut self, update: &StatusUpdate) -> StatusOutcome {
        if let Some(current) = self.status.as_deref() {
            if current == update.status {
                return StatusOutcome::Unchanged;
            }
            let ranks = (self.kind.status_rank(current), self.kind.status_rank(&update.status));
            if let (Some(current_rank), Some(incoming_rank)) = ranks {
                if incoming_rank <= current_rank {
                    return StatusOutcome::Stale {
                        current: current.to_string(),
                        incoming: update.status.clone(),
                    };
                }
            }
        }

        if let Value::Object(document) = &mut self.document {
            for (key, value) in &update.fields {
                if !value.is_null() {
                    document.insert(key.clone(), value.clone());
                }
            }
        }

        let from = self.status.replace(update.status.clone());
        self.updated_at = self.updated_at.max(update.received_at);

        StatusOutcome::Changed {
            from,
            to: update.status.clone(),
        }
    }

    /// Convenience accessor into the document.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.document.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payment(status: &str) -> ReplicaRecord {
        ReplicaRecord::new(
            EntityKind::Payment,
            EntityId::new("p1").unwrap(),
            json!({"order": "o1", "price": {"amount": 1200.0, "currency": "INR"}}),
            Some(status.to_string()),
            Utc::now(),
        )
    }

    fn update(status: &str) -> StatusUpdate {
        StatusUpdate {
            kind: EntityKind::Payment,
            id: EntityId::new("p1").unwrap(),
            status: status.to_string(),
            fields: Map::new(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_forward_transition_changes_status() {
        let mut record = payment("pending");
        let outcome = record.apply(&update("completed"));
        assert_eq!(
            outcome,
            StatusOutcome::Changed {
                from: Some("pending".to_string()),
                to: "completed".to_string()
            }
        );
        assert_eq!(record.status.as_deref(), Some("completed"));
    }

    #[test]
    fn test_same_status_twice_is_idempotent() {
        let mut once = payment("pending");
        once.apply(&update("completed"));

        let mut twice = payment("pending");
        twice.apply(&update("completed"));
        let second = twice.apply(&update("completed"));

        assert_eq!(second, StatusOutcome::Unchanged);
        assert_eq!(once.status, twice.status);
        assert_eq!(once.document, twice.document);
    }

    #[test]
    fn test_terminal_status_does_not_regress() {
        let mut record = payment("completed");
        assert!(matches!(record.apply(&update("pending")), StatusOutcome::Stale { .. }));
        assert!(matches!(record.apply(&update("failed")), StatusOutcome::Stale { .. }));
        assert_eq!(record.status.as_deref(), Some("completed"));
    }

    #[test]
    fn test_status_fields_are_merged_into_document() {
        let mut record = payment("pending");
        let mut completed = update("completed");
        completed.fields.insert("paymentId".to_string(), json!("pay_123"));
        completed.fields.insert("signature".to_string(), Value::Null);

        record.apply(&completed);

        assert_eq!(record.field("paymentId"), Some(&json!("pay_123")));
        assert_eq!(record.field("signature"), None);
        assert_eq!(record.field("order"), Some(&json!("o1")));
    }
}
