use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, Row};

use crate::models::{EntityId, EntityKind};
use crate::sync::{ReplicaRecord, StatusUpdate};

use super::{CreateOutcome, PendingUpdate, ReplicaStore, StoreError, UpdateOutcome};

// ============================================================================
// PostgreSQL Replica Store
// ============================================================================
//
// Tables:
// - replicas         (kind, id) primary key, JSONB document
// - pending_updates  orphan status updates, replayed in `seq` order
//
// Every write path takes a transaction-scoped advisory lock on "kind:id", so
// create and update for the same entity serialize even when they arrive on
// different queues.
//
// ============================================================================

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS replicas (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        document JSONB NOT NULL,
        status TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (kind, id)
    )",
    "CREATE TABLE IF NOT EXISTS pending_updates (
        seq BIGSERIAL PRIMARY KEY,
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        status TEXT NOT NULL,
        fields JSONB NOT NULL,
        received_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_pending_updates_entity ON pending_updates (kind, id)",
    "CREATE INDEX IF NOT EXISTS idx_pending_updates_expiry ON pending_updates (expires_at)",
];

pub struct PostgresReplicaStore {
    pool: PgPool,
}

impl PostgresReplicaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Replica tables initialized (PostgreSQL)");
        Ok(())
    }

    async fn lock_entity(conn: &mut PgConnection, kind: EntityKind, id: &EntityId) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}:{}", kind, id))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn fetch(
        conn: &mut PgConnection,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<ReplicaRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT kind, id, document, status, created_at, updated_at
             FROM replicas WHERE kind = $1 AND id = $2",
        )
        .bind(kind.as_str())
        .bind(id.as_str())
        .fetch_optional(conn)
        .await?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    async fn write(conn: &mut PgConnection, record: &ReplicaRecord) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE replicas SET document = $3, status = $4, updated_at = $5
             WHERE kind = $1 AND id = $2",
        )
        .bind(record.kind.as_str())
        .bind(record.id.as_str())
        .bind(Json(&record.document))
        .bind(record.status.as_deref())
        .bind(record.updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<ReplicaRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let id: String = row.try_get("id")?;
    let Json(document): Json<Value> = row.try_get("document")?;

    Ok(ReplicaRecord {
        kind: EntityKind::parse(&kind).ok_or_else(|| StoreError::Corrupt(format!("unknown kind `{}`", kind)))?,
        id: EntityId::new(id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        document,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn update_from_row(row: &PgRow) -> Result<StatusUpdate, StoreError> {
    let kind: String = row.try_get("kind")?;
    let id: String = row.try_get("id")?;
    let Json(fields): Json<Map<String, Value>> = row.try_get("fields")?;

    Ok(StatusUpdate {
        kind: EntityKind::parse(&kind).ok_or_else(|| StoreError::Corrupt(format!("unknown kind `{}`", kind)))?,
        id: EntityId::new(id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        status: row.try_get("status")?,
        fields,
        received_at: row.try_get("received_at")?,
    })
}

#[async_trait]
impl ReplicaStore for PostgresReplicaStore {
    async fn create(&self, mut record: ReplicaRecord) -> Result<CreateOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_entity(&mut tx, record.kind, &record.id).await?;

        let inserted = sqlx::query(
            "INSERT INTO replicas (kind, id, document, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (kind, id) DO NOTHING",
        )
        .bind(record.kind.as_str())
        .bind(record.id.as_str())
        .bind(Json(&record.document))
        .bind(record.status.as_deref())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(CreateOutcome::Duplicate);
        }

        let parked = sqlx::query(
            "DELETE FROM pending_updates WHERE kind = $1 AND id = $2
             RETURNING seq, kind, id, status, fields, received_at",
        )
        .bind(record.kind.as_str())
        .bind(record.id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut ordered = parked
            .iter()
            .map(|row| -> Result<(i64, StatusUpdate), StoreError> {
                Ok((row.try_get("seq")?, update_from_row(row)?))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        ordered.sort_by_key(|(seq, _)| *seq);

        let replayed: Vec<_> = ordered.iter().map(|(_, update)| record.apply(update)).collect();
        if !replayed.is_empty() {
            Self::write(&mut tx, &record).await?;
        }

        tx.commit().await?;
        Ok(CreateOutcome::Inserted { replayed })
    }

    async fn update_status(
        &self,
        update: StatusUpdate,
        park_until: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_entity(&mut tx, update.kind, &update.id).await?;

        let outcome = match Self::fetch(&mut tx, update.kind, &update.id).await? {
            Some(mut record) => {
                let outcome = record.apply(&update);
                if matches!(outcome, crate::sync::StatusOutcome::Changed { .. }) {
                    Self::write(&mut tx, &record).await?;
                }
                UpdateOutcome::Applied(outcome)
            }
            None => {
                sqlx::query(
                    "INSERT INTO pending_updates (kind, id, status, fields, received_at, expires_at)
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(update.kind.as_str())
                .bind(update.id.as_str())
                .bind(&update.status)
                .bind(Json(&update.fields))
                .bind(update.received_at)
                .bind(park_until)
                .execute(&mut *tx)
                .await?;
                UpdateOutcome::Parked
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<ReplicaRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch(&mut conn, kind, id).await
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<ReplicaRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT kind, id, document, status, created_at, updated_at
             FROM replicas WHERE kind = $1 ORDER BY created_at, id",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn count(&self, kind: EntityKind) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM replicas WHERE kind = $1")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_updates")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn due_pending(&self, now: DateTime<Utc>) -> Result<Vec<PendingUpdate>, StoreError> {
        let rows = sqlx::query(
            "SELECT seq, kind, id, status, fields, received_at, expires_at
             FROM pending_updates WHERE expires_at <= $1
             ORDER BY seq",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PendingUpdate, StoreError> {
                Ok(PendingUpdate {
                    seq: row.try_get("seq")?,
                    update: update_from_row(row)?,
                    expires_at: row.try_get("expires_at")?,
                })
            })
            .collect()
    }

    async fn remove_pending(&self, seqs: &[i64]) -> Result<u64, StoreError> {
        if seqs.is_empty() {
            return Ok(0);
        }
        let removed = sqlx::query("DELETE FROM pending_updates WHERE seq = ANY($1)")
            .bind(seqs)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }
}
