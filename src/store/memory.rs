use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::models::{EntityId, EntityKind};
use crate::sync::{ReplicaRecord, StatusUpdate};

use super::{CreateOutcome, PendingUpdate, ReplicaStore, StoreError, UpdateOutcome};

#[derive(Default)]
struct State {
    replicas: HashMap<(EntityKind, EntityId), ReplicaRecord>,
    pending: Vec<PendingUpdate>,
    next_seq: i64,
}

/// Process-local store used in development mode and tests.
#[derive(Default)]
pub struct InMemoryReplicaStore {
    state: Mutex<State>,
}

impl InMemoryReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ReplicaStore for InMemoryReplicaStore {
    async fn create(&self, mut record: ReplicaRecord) -> Result<CreateOutcome, StoreError> {
        let mut state = self.lock();
        let key = (record.kind, record.id.clone());
        if state.replicas.contains_key(&key) {
            return Ok(CreateOutcome::Duplicate);
        }

        let (matching, rest): (Vec<PendingUpdate>, Vec<PendingUpdate>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|p| p.update.kind == record.kind && p.update.id == record.id);
        state.pending = rest;

        let replayed = matching.iter().map(|p| record.apply(&p.update)).collect();
        state.replicas.insert(key, record);

        Ok(CreateOutcome::Inserted { replayed })
    }

    async fn update_status(
        &self,
        update: StatusUpdate,
        park_until: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut state = self.lock();
        match state.replicas.get_mut(&(update.kind, update.id.clone())) {
            Some(record) => Ok(UpdateOutcome::Applied(record.apply(&update))),
            None => {
                state.next_seq += 1;
                let seq = state.next_seq;
                state.pending.push(PendingUpdate {
                    seq,
                    update,
                    expires_at: park_until,
                });
                Ok(UpdateOutcome::Parked)
            }
        }
    }

    async fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<ReplicaRecord>, StoreError> {
        Ok(self.lock().replicas.get(&(kind, id.clone())).cloned())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<ReplicaRecord>, StoreError> {
        let mut records: Vec<ReplicaRecord> = self
            .lock()
            .replicas
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn count(&self, kind: EntityKind) -> Result<u64, StoreError> {
        Ok(self.lock().replicas.keys().filter(|(k, _)| *k == kind).count() as u64)
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        Ok(self.lock().pending.len() as u64)
    }

    async fn due_pending(&self, now: DateTime<Utc>) -> Result<Vec<PendingUpdate>, StoreError> {
        Ok(self
            .lock()
            .pending
            .iter()
            .filter(|p| p.expires_at <= now)
            .cloned()
            .collect())
    }

    async fn remove_pending(&self, seqs: &[i64]) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let before = state.pending.len();
        state.pending.retain(|p| !seqs.contains(&p.seq));
        Ok((before - state.pending.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::StatusOutcome;
    use chrono::Duration;
    use serde_json::{json, Map};

    fn payment(id: &str) -> ReplicaRecord {
        ReplicaRecord::new(
            EntityKind::Payment,
            EntityId::new(id).unwrap(),
            json!({"order": "o1"}),
            Some("pending".to_string()),
            Utc::now(),
        )
    }

    fn completed(id: &str) -> StatusUpdate {
        StatusUpdate {
            kind: EntityKind::Payment,
            id: EntityId::new(id).unwrap(),
            status: "completed".to_string(),
            fields: Map::new(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = InMemoryReplicaStore::new();
        assert!(matches!(store.create(payment("p1")).await.unwrap(), CreateOutcome::Inserted { .. }));
        assert_eq!(store.create(payment("p1")).await.unwrap(), CreateOutcome::Duplicate);
        assert_eq!(store.count(EntityKind::Payment).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_orphan_is_parked_then_replayed_on_create() {
        let store = InMemoryReplicaStore::new();
        let deadline = Utc::now() + Duration::minutes(5);

        let outcome = store.update_status(completed("p1"), deadline).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Parked);
        assert_eq!(store.pending_count().await.unwrap(), 1);

        let outcome = store.create(payment("p1")).await.unwrap();
        assert_eq!(
            outcome,
            CreateOutcome::Inserted {
                replayed: vec![StatusOutcome::Changed {
                    from: Some("pending".to_string()),
                    to: "completed".to_string()
                }]
            }
        );
        assert_eq!(store.pending_count().await.unwrap(), 0);

        let record = store.get(EntityKind::Payment, &EntityId::new("p1").unwrap()).await.unwrap().unwrap();
        assert_eq!(record.status.as_deref(), Some("completed"));
    }

    #[tokio::test]
    async fn test_parked_updates_are_scoped_by_kind_and_id() {
        let store = InMemoryReplicaStore::new();
        let deadline = Utc::now() + Duration::minutes(5);
        store.update_status(completed("p2"), deadline).await.unwrap();

        store.create(payment("p1")).await.unwrap();

        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_due_pending_stays_parked_until_removed() {
        let store = InMemoryReplicaStore::new();
        let now = Utc::now();
        store.update_status(completed("old"), now - Duration::seconds(1)).await.unwrap();
        store.update_status(completed("new"), now + Duration::minutes(5)).await.unwrap();

        let due = store.due_pending(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].update.id.as_str(), "old");
        assert_eq!(store.pending_count().await.unwrap(), 2);

        assert_eq!(store.remove_pending(&[due[0].seq]).await.unwrap(), 1);
        assert_eq!(store.remove_pending(&[due[0].seq]).await.unwrap(), 0);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }
}
