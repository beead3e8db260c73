use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, Row};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::dlq::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::messaging::Publisher;
use crate::metrics::Metrics;
use crate::store::StoreError;
use crate::topics::Topic;
use crate::utils::{shutdown_requested, RetryConfig};

// ============================================================================
// Transactional Outbox
// ============================================================================
//
// Producers write their entity and the event describing it in one local
// transaction (`PostgresOutboxStore::enqueue_in`). The relay then drains the
// outbox to the broker:
//
//   pending ──publish ok──▶ deleted
//      │
//      ├──broker unreachable──▶ unchanged, relay backs off
//      │
//      └──publish refused──▶ attempts += 1 ──(attempts ≥ max)──▶ dead letter
//
// Only a refusal counts against a message: an outage (connection lost,
// timeout, open breaker) says nothing about the message itself, so it stays
// pending however long the outage lasts. Either failure ends the current
// batch so later rows for the same queue are not sent ahead of it.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn new(topic: Topic, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            topic: topic.as_str().to_string(),
            payload,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn enqueue(&self, message: OutboxMessage) -> Result<(), StoreError>;

    /// Oldest unpublished messages first.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Remove a delivered message. Published rows are not kept.
    async fn mark_published(&self, id: Uuid) -> Result<(), StoreError>;

    /// Record a failed publish and return the new attempt count.
    async fn record_failure(&self, id: Uuid, error: &str) -> Result<u32, StoreError>;

    /// Drop a message that will never be published.
    async fn discard(&self, id: Uuid) -> Result<(), StoreError>;

    async fn pending_count(&self) -> Result<u64, StoreError>;
}

// ============================================================================
// In-memory outbox
// ============================================================================

#[derive(Default)]
pub struct InMemoryOutboxStore {
    messages: Mutex<Vec<OutboxMessage>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OutboxMessage>> {
        self.messages.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, message: OutboxMessage) -> Result<(), StoreError> {
        self.lock().push(message);
        Ok(())
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        Ok(self.lock().iter().take(limit).cloned().collect())
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), StoreError> {
        self.lock().retain(|m| m.id != id);
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<u32, StoreError> {
        let mut messages = self.lock();
        match messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                message.attempts += 1;
                message.last_error = Some(error.to_string());
                Ok(message.attempts)
            }
            None => Err(StoreError::Corrupt(format!("outbox message {} not found", id))),
        }
    }

    async fn discard(&self, id: Uuid) -> Result<(), StoreError> {
        self.lock().retain(|m| m.id != id);
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        Ok(self.lock().len() as u64)
    }
}

// ============================================================================
// PostgreSQL outbox
// ============================================================================

pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS outbox_messages (
                id UUID PRIMARY KEY,
                topic TEXT NOT NULL,
                payload JSONB NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_messages_created
             ON outbox_messages (created_at, id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Enqueue on the caller's connection, typically inside the transaction
    /// that writes the entity the event describes.
    pub async fn enqueue_in(conn: &mut PgConnection, topic: Topic, payload: Value) -> Result<Uuid, StoreError> {
        let message = OutboxMessage::new(topic, payload);
        insert(conn, &message).await?;
        Ok(message.id)
    }
}

async fn insert(conn: &mut PgConnection, message: &OutboxMessage) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO outbox_messages (id, topic, payload, attempts, last_error, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(message.id)
    .bind(&message.topic)
    .bind(Json(&message.payload))
    .bind(i32::try_from(message.attempts).unwrap_or(i32::MAX))
    .bind(message.last_error.as_deref())
    .bind(message.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

fn message_from_row(row: &PgRow) -> Result<OutboxMessage, StoreError> {
    let Json(payload): Json<Value> = row.try_get("payload")?;
    let attempts: i32 = row.try_get("attempts")?;

    Ok(OutboxMessage {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        payload,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn enqueue(&self, message: OutboxMessage) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert(&mut conn, &message).await
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, topic, payload, attempts, last_error, created_at
             FROM outbox_messages
             ORDER BY created_at, id
             LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM outbox_messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<u32, StoreError> {
        let attempts: i32 = sqlx::query_scalar(
            "UPDATE outbox_messages SET attempts = attempts + 1, last_error = $2
             WHERE id = $1
             RETURNING attempts",
        )
        .bind(id)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;
        Ok(attempts.max(0) as u32)
    }

    async fn discard(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM outbox_messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

// ============================================================================
// Relay
// ============================================================================

#[derive(Clone, Debug)]
pub struct OutboxRelayConfig {
    pub interval: Duration,
    pub batch_size: usize,
    /// Refused publishes allowed before a message is dead-lettered.
    pub max_attempts: u32,
    /// Longest pause between passes while the broker is unreachable.
    pub max_backoff: Duration,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
            max_attempts: 10,
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub published: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    /// The pass stopped because the broker could not be reached.
    pub broker_unavailable: bool,
}

pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<Publisher>,
    sink: Arc<dyn DeadLetterSink>,
    config: OutboxRelayConfig,
    metrics: Option<Arc<Metrics>>,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<Publisher>,
        sink: Arc<dyn DeadLetterSink>,
        config: OutboxRelayConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            sink,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish one batch of pending messages in creation order.
    pub async fn relay_once(&self) -> Result<RelayReport, StoreError> {
        let mut report = RelayReport::default();

        for message in self.store.pending(self.config.batch_size).await? {
            let body = serde_json::to_vec(&message.payload)?;
            match self.publisher.publish_bytes(&message.topic, body).await {
                Ok(()) => {
                    self.store.mark_published(message.id).await?;
                    report.published += 1;
                }
                Err(e) if e.is_unavailable() => {
                    report.broker_unavailable = true;
                    tracing::warn!(
                        outbox_id = %message.id,
                        topic = %message.topic,
                        error = %e,
                        "Broker unavailable, outbox relay paused"
                    );
                    break;
                }
                Err(e) => {
                    report.failed += 1;
                    let attempts = self.store.record_failure(message.id, &e.to_string()).await?;
                    tracing::warn!(
                        outbox_id = %message.id,
                        topic = %message.topic,
                        attempts = attempts,
                        error = %e,
                        "Outbox publish failed"
                    );

                    if attempts >= self.config.max_attempts {
                        let letter = DeadLetter::new(
                            message.topic.clone(),
                            message.payload.to_string().as_bytes(),
                            e.to_string(),
                            DeadLetterReason::OutboxExhausted,
                            attempts,
                        );
                        self.sink.record(letter).await?;
                        self.store.discard(message.id).await?;
                        report.dead_lettered += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.record_dlq_message(DeadLetterReason::OutboxExhausted.as_str());
                        }
                    }
                    break;
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_outbox_published(report.published);
            metrics.set_outbox_pending(self.store.pending_count().await?);
        }
        if report.published > 0 {
            tracing::debug!(published = report.published, "Outbox batch relayed");
        }
        Ok(report)
    }

    /// Relay on every interval until shutdown. While the broker is
    /// unreachable the pause doubles up to `max_backoff`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_ms = self.config.interval.as_millis() as u64, "📤 Outbox relay started");
        let backoff = RetryConfig {
            max_attempts: u32::MAX,
            initial_delay: self.config.interval,
            max_delay: self.config.max_backoff.max(self.config.interval),
            multiplier: 2.0,
        };
        let mut outages = 0u32;

        loop {
            let pause = backoff.delay_for(outages + 1);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }

            match self.relay_once().await {
                Ok(report) if report.broker_unavailable => {
                    outages = outages.saturating_add(1);
                    tracing::debug!(
                        outages = outages,
                        retry_in_ms = backoff.delay_for(outages + 1).as_millis() as u64,
                        "Outbox relay backing off"
                    );
                }
                Ok(_) => {
                    if outages > 0 {
                        tracing::info!(outages = outages, "✅ Outbox relay resumed");
                    }
                    outages = 0;
                }
                Err(e) => tracing::error!(error = %e, "Outbox relay pass failed"),
            }
        }
        tracing::info!("Outbox relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::InMemoryDeadLetterSink;
    use crate::messaging::{BrokerConnection, ConnectionConfig, InMemoryBroker};
    use crate::utils::{CircuitBreakerConfig, RetryConfig};
    use futures_util::StreamExt;
    use serde_json::json;

    fn publisher(broker: &InMemoryBroker, breaker: CircuitBreakerConfig) -> Arc<Publisher> {
        let connection = Arc::new(BrokerConnection::new(
            Arc::new(broker.clone()),
            ConnectionConfig {
                connect_timeout: Duration::from_millis(200),
                reconnect: RetryConfig {
                    max_attempts: 1,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                    multiplier: 1.0,
                },
            },
        ));
        Arc::new(Publisher::new(connection, breaker, Duration::from_secs(1)))
    }

    fn relay(broker: &InMemoryBroker, max_attempts: u32) -> (OutboxRelay, Arc<InMemoryOutboxStore>, Arc<InMemoryDeadLetterSink>) {
        let breaker = CircuitBreakerConfig {
            failure_threshold: 100,
            ..Default::default()
        };
        let store = Arc::new(InMemoryOutboxStore::new());
        let sink = Arc::new(InMemoryDeadLetterSink::default());
        let relay = OutboxRelay::new(
            store.clone(),
            publisher(broker, breaker),
            sink.clone(),
            OutboxRelayConfig {
                interval: Duration::from_millis(10),
                batch_size: 10,
                max_attempts,
                max_backoff: Duration::from_millis(40),
            },
        );
        (relay, store, sink)
    }

    #[tokio::test]
    async fn test_relay_publishes_in_creation_order() {
        let broker = InMemoryBroker::new();
        let (relay, store, _) = relay(&broker, 3);
        let topic = Topic::DashboardOrderCreated;
        store.enqueue(OutboxMessage::new(topic, json!({"id": "o1"}))).await.unwrap();
        store.enqueue(OutboxMessage::new(topic, json!({"id": "o2"}))).await.unwrap();

        let report = relay.relay_once().await.unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(store.pending_count().await.unwrap(), 0);

        let connection = BrokerConnection::new(Arc::new(broker.clone()), ConnectionConfig::default());
        let channel = connection.connect().await.unwrap();
        let mut stream = channel.consume(topic.as_str(), "test").await.unwrap();
        for expected in ["o1", "o2"] {
            let delivery = stream.next().await.unwrap().unwrap();
            let body: Value = serde_json::from_slice(&delivery.body).unwrap();
            assert_eq!(body["id"], expected);
        }
    }

    #[tokio::test]
    async fn test_refused_publish_counts_attempt_and_stops_batch() {
        let broker = InMemoryBroker::new();
        broker.reject_publishes(Topic::DashboardUserCreated.as_str(), true);
        let (relay, store, sink) = relay(&broker, 3);
        store
            .enqueue(OutboxMessage::new(Topic::DashboardUserCreated, json!({"id": "u1"})))
            .await
            .unwrap();
        store
            .enqueue(OutboxMessage::new(Topic::DashboardUserCreated, json!({"id": "u2"})))
            .await
            .unwrap();

        let report = relay.relay_once().await.unwrap();
        assert_eq!(
            report,
            RelayReport {
                failed: 1,
                ..Default::default()
            }
        );

        let pending = store.pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.as_deref().unwrap().contains("nacked"));
        assert_eq!(pending[1].attempts, 0);
        assert_eq!(sink.count().await.unwrap(), 0);

        broker.reject_publishes(Topic::DashboardUserCreated.as_str(), false);
        assert_eq!(relay.relay_once().await.unwrap().published, 2);
    }

    #[tokio::test]
    async fn test_exhausted_message_is_dead_lettered() {
        let broker = InMemoryBroker::new();
        broker.reject_publishes(Topic::DashboardPaymentCreated.as_str(), true);
        let (relay, store, sink) = relay(&broker, 2);
        store
            .enqueue(OutboxMessage::new(Topic::DashboardPaymentCreated, json!({"_id": "p1"})))
            .await
            .unwrap();

        relay.relay_once().await.unwrap();
        let report = relay.relay_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(store.pending_count().await.unwrap(), 0);

        let letters = sink.snapshot();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::OutboxExhausted);
        assert_eq!(letters[0].delivery_count, 2);
        assert!(letters[0].payload.contains("p1"));
    }

    #[tokio::test]
    async fn test_broker_outage_never_exhausts_a_message() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let store = Arc::new(InMemoryOutboxStore::new());
        let sink = Arc::new(InMemoryDeadLetterSink::default());
        let config = OutboxRelayConfig::default();
        let relay = OutboxRelay::new(
            store.clone(),
            publisher(&broker, CircuitBreakerConfig::default()),
            sink.clone(),
            config.clone(),
        );
        store
            .enqueue(OutboxMessage::new(Topic::DashboardOrderCreated, json!({"_id": "o1"})))
            .await
            .unwrap();

        // Connection errors first, then the open breaker, across more passes
        // than max_attempts allows.
        for _ in 0..=config.max_attempts {
            let report = relay.relay_once().await.unwrap();
            assert!(report.broker_unavailable);
            assert_eq!(report.failed, 0);
        }

        let pending = store.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 0);
        assert_eq!(sink.count().await.unwrap(), 0);

        broker.set_available(true);
        let recovered = OutboxRelay::new(
            store.clone(),
            publisher(&broker, CircuitBreakerConfig::default()),
            sink.clone(),
            config,
        );
        assert_eq!(recovered.relay_once().await.unwrap().published, 1);
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert_eq!(broker.depth(Topic::DashboardOrderCreated.as_str()), 1);
    }

    #[tokio::test]
    async fn test_run_drains_after_outage_and_stops_on_shutdown() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let (relay, store, _) = relay(&broker, 3);
        store
            .enqueue(OutboxMessage::new(Topic::DashboardProductCreated, json!({"_id": "pr1"})))
            .await
            .unwrap();

        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(Arc::new(relay).run(shutdown));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.pending(10).await.unwrap()[0].attempts, 0);

        broker.set_available(true);
        for _ in 0..100 {
            if store.pending_count().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.pending_count().await.unwrap(), 0);

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
