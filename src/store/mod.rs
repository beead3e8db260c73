// ============================================================================
// Local Read-Model Store
// ============================================================================
//
// Denormalized replicas of foreign entities plus the pending buffer for
// status updates that arrive before their replica exists.
//
// Both operations that touch a replica are atomic per identifier:
// - `create` inserts and replays any parked updates in one step
// - `update_status` either applies to the replica or parks the update
// so a created event racing a status event on another queue cannot strand
// the update.
//
// ============================================================================

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{EntityId, EntityKind};
use crate::sync::{ReplicaRecord, StatusOutcome, StatusUpdate};
use crate::utils::IsTransient;

pub use memory::InMemoryReplicaStore;
pub use postgres::PostgresReplicaStore;

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// Replica inserted; `replayed` holds the outcome of each parked update.
    Inserted { replayed: Vec<StatusOutcome> },
    /// A replica with this identifier already exists.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied(StatusOutcome),
    /// No replica yet; the update waits in the pending buffer.
    Parked,
}

/// A status update waiting in the pending buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    /// Arrival order within the buffer.
    pub seq: i64,
    pub update: StatusUpdate,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IsTransient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Insert `record` unless a replica with the same kind and id exists.
    async fn create(&self, record: ReplicaRecord) -> Result<CreateOutcome, StoreError>;

    /// Apply `update` to its replica, or park it until `park_until`.
    async fn update_status(
        &self,
        update: StatusUpdate,
        park_until: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<ReplicaRecord>, StoreError>;

    async fn list(&self, kind: EntityKind) -> Result<Vec<ReplicaRecord>, StoreError>;

    async fn count(&self, kind: EntityKind) -> Result<u64, StoreError>;

    async fn pending_count(&self) -> Result<u64, StoreError>;

    /// Parked updates whose deadline is at or before `now`, oldest first.
    /// They stay parked until `remove_pending` drops them.
    async fn due_pending(&self, now: DateTime<Utc>) -> Result<Vec<PendingUpdate>, StoreError>;

    /// Drop parked updates by sequence number. Sequences already gone
    /// (replayed by a create in the meantime) are ignored.
    async fn remove_pending(&self, seqs: &[i64]) -> Result<u64, StoreError>;
}
