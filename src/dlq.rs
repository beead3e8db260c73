use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

use crate::store::StoreError;

// ============================================================================
// Dead Letter Queue
// ============================================================================
//
// Terminal resting place for work the service gave up on:
// - malformed payloads and permanent handler failures
// - transient failures that exhausted their deliveries
// - orphan status updates whose replica never arrived
// - outbox rows that could not be published
//
// Queryable for manual intervention. A delivery is only acknowledged after
// its dead letter has been recorded.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    Malformed,
    Permanent,
    RetriesExhausted,
    OrphanExpired,
    OutboxExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Malformed => "malformed",
            DeadLetterReason::Permanent => "permanent",
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
            DeadLetterReason::OrphanExpired => "orphan_expired",
            DeadLetterReason::OutboxExhausted => "outbox_exhausted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "malformed" => Some(DeadLetterReason::Malformed),
            "permanent" => Some(DeadLetterReason::Permanent),
            "retries_exhausted" => Some(DeadLetterReason::RetriesExhausted),
            "orphan_expired" => Some(DeadLetterReason::OrphanExpired),
            "outbox_exhausted" => Some(DeadLetterReason::OutboxExhausted),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub topic: String,
    pub payload: String,
    pub error: String,
    pub reason: DeadLetterReason,
    pub delivery_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        topic: impl Into<String>,
        payload: &[u8],
        error: impl Into<String>,
        reason: DeadLetterReason,
        delivery_count: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            topic: topic.into(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            error: error.into(),
            reason,
            delivery_count,
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: DeadLetter) -> Result<(), StoreError>;

    /// Most recent dead letters first.
    async fn recent(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

fn log_dead_letter(letter: &DeadLetter) {
    tracing::error!(
        dead_letter_id = %letter.id,
        topic = %letter.topic,
        reason = %letter.reason,
        delivery_count = letter.delivery_count,
        error = %letter.error,
        "💀 Adding message to Dead Letter Queue"
    );
}

// ============================================================================
// In-memory sink
// ============================================================================

/// Bounded in-process sink; the oldest letters are dropped past `capacity`.
pub struct InMemoryDeadLetterSink {
    letters: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl InMemoryDeadLetterSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            letters: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap_or_else(|p| p.into_inner()).iter().cloned().collect()
    }
}

impl Default for InMemoryDeadLetterSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&self, letter: DeadLetter) -> Result<(), StoreError> {
        log_dead_letter(&letter);
        let mut letters = self.letters.lock().unwrap_or_else(|p| p.into_inner());
        if letters.len() >= self.capacity {
            letters.pop_front();
        }
        letters.push_back(letter);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let letters = self.letters.lock().unwrap_or_else(|p| p.into_inner());
        Ok(letters.iter().rev().take(limit).cloned().collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.letters.lock().unwrap_or_else(|p| p.into_inner()).len() as u64)
    }
}

// ============================================================================
// PostgreSQL sink
// ============================================================================

pub struct PostgresDeadLetterSink {
    pool: PgPool,
}

impl PostgresDeadLetterSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dead_letter_queue (
                id UUID PRIMARY KEY,
                topic TEXT NOT NULL,
                payload TEXT NOT NULL,
                error_message TEXT NOT NULL,
                reason TEXT NOT NULL,
                delivery_count INTEGER NOT NULL,
                failed_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dead_letter_queue_failed_at ON dead_letter_queue (failed_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn letter_from_row(row: &PgRow) -> Result<DeadLetter, StoreError> {
    let reason: String = row.try_get("reason")?;
    let delivery_count: i32 = row.try_get("delivery_count")?;

    Ok(DeadLetter {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        error: row.try_get("error_message")?,
        reason: DeadLetterReason::parse(&reason)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown dead letter reason `{}`", reason)))?,
        delivery_count: delivery_count.max(0) as u32,
        failed_at: row.try_get("failed_at")?,
    })
}

#[async_trait]
impl DeadLetterSink for PostgresDeadLetterSink {
    async fn record(&self, letter: DeadLetter) -> Result<(), StoreError> {
        log_dead_letter(&letter);

        sqlx::query(
            "INSERT INTO dead_letter_queue (
                id, topic, payload, error_message, reason, delivery_count, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING",
        )
        .bind(letter.id)
        .bind(&letter.topic)
        .bind(&letter.payload)
        .bind(&letter.error)
        .bind(letter.reason.as_str())
        .bind(i32::try_from(letter.delivery_count).unwrap_or(i32::MAX))
        .bind(letter.failed_at)
        .execute(&self.pool)
        .await?;

        tracing::info!(dead_letter_id = %letter.id, "Message successfully stored in DLQ");
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, topic, payload, error_message, reason, delivery_count, failed_at
             FROM dead_letter_queue
             ORDER BY failed_at DESC
             LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(letter_from_row).collect()
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_kept_as_lossy_text() {
        let letter = DeadLetter::new("Q", &[b'{', 0xff, b'}'], "bad", DeadLetterReason::Malformed, 1);
        assert_eq!(letter.payload, "{\u{fffd}}");
        assert_eq!(letter.reason.as_str(), "malformed");
    }

    #[test]
    fn test_reason_round_trips_through_its_name() {
        for reason in [
            DeadLetterReason::Malformed,
            DeadLetterReason::Permanent,
            DeadLetterReason::RetriesExhausted,
            DeadLetterReason::OrphanExpired,
            DeadLetterReason::OutboxExhausted,
        ] {
            assert_eq!(DeadLetterReason::parse(reason.as_str()), Some(reason));
        }
    }

    #[tokio::test]
    async fn test_memory_sink_returns_newest_first_and_is_bounded() {
        let sink = InMemoryDeadLetterSink::new(2);
        for topic in ["a", "b", "c"] {
            sink.record(DeadLetter::new(topic, b"{}", "boom", DeadLetterReason::Permanent, 1))
                .await
                .unwrap();
        }

        assert_eq!(sink.count().await.unwrap(), 2);
        let recent = sink.recent(10).await.unwrap();
        let topics: Vec<_> = recent.iter().map(|l| l.topic.as_str()).collect();
        assert_eq!(topics, vec!["c", "b"]);
    }
}
