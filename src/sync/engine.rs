use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::dlq::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::messaging::{HandlerError, MessageHandler};
use crate::metrics::Metrics;
use crate::models::DecodeError;
use crate::store::{CreateOutcome, ReplicaStore, StoreError, UpdateOutcome};
use crate::topics::Topic;
use crate::utils::{shutdown_requested, IsTransient};

use super::event::ReplicaEvent;
use super::replica::StatusOutcome;

// ============================================================================
// Idempotent Apply Engine
// ============================================================================
//
//   created  → store.create: insert under the origin id and replay parked
//              updates, or Duplicate when the replica already exists
//   status   → store.update_status: apply through the lattice, or park the
//              update until `now + pending_ttl` when no replica exists yet
//
// Parked updates that outlive their deadline are removed by the sweeper and
// dead-lettered as `orphan_expired`.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Created { replayed: Vec<StatusOutcome> },
    Duplicate,
    Updated { from: Option<String>, to: String },
    Unchanged,
    Stale { current: String, incoming: String },
    Parked,
}

impl ApplyOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::Created { .. } => "created",
            ApplyOutcome::Duplicate => "duplicate",
            ApplyOutcome::Updated { .. } => "updated",
            ApplyOutcome::Unchanged => "unchanged",
            ApplyOutcome::Stale { .. } => "stale",
            ApplyOutcome::Parked => "parked",
        }
    }
}

impl From<StatusOutcome> for ApplyOutcome {
    fn from(outcome: StatusOutcome) -> Self {
        match outcome {
            StatusOutcome::Changed { from, to } => ApplyOutcome::Updated { from, to },
            StatusOutcome::Unchanged => ApplyOutcome::Unchanged,
            StatusOutcome::Stale { current, incoming } => ApplyOutcome::Stale { current, incoming },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ApplyError> for HandlerError {
    fn from(error: ApplyError) -> Self {
        match error {
            ApplyError::Decode(DecodeError::UnsupportedTopic(topic)) => {
                HandlerError::Permanent(format!("topic {} is not a replica topic", topic))
            }
            ApplyError::Decode(e) => HandlerError::Malformed(e.to_string()),
            ApplyError::Store(e) if e.is_transient() => HandlerError::Transient(e.to_string()),
            ApplyError::Store(e) => HandlerError::Permanent(e.to_string()),
        }
    }
}

pub struct ApplyEngine {
    store: Arc<dyn ReplicaStore>,
    pending_ttl: chrono::Duration,
    metrics: Option<Arc<Metrics>>,
}

impl ApplyEngine {
    pub fn new(store: Arc<dyn ReplicaStore>, pending_ttl: Duration) -> Self {
        Self {
            store,
            pending_ttl: chrono::Duration::from_std(pending_ttl).unwrap_or_else(|_| chrono::Duration::days(1)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn apply(&self, event: ReplicaEvent, now: DateTime<Utc>) -> Result<ApplyOutcome, StoreError> {
        match event {
            ReplicaEvent::Created(record) => {
                let (kind, id) = (record.kind, record.id.clone());
                match self.store.create(record).await? {
                    CreateOutcome::Inserted { replayed } => {
                        tracing::info!(
                            kind = %kind,
                            id = %id,
                            replayed = replayed.len(),
                            "✅ Replica created"
                        );
                        Ok(ApplyOutcome::Created { replayed })
                    }
                    CreateOutcome::Duplicate => {
                        tracing::debug!(kind = %kind, id = %id, "Replica already exists, skipping");
                        Ok(ApplyOutcome::Duplicate)
                    }
                }
            }
            ReplicaEvent::Status(update) => {
                let (kind, id, status) = (update.kind, update.id.clone(), update.status.clone());
                match self.store.update_status(update, now + self.pending_ttl).await? {
                    UpdateOutcome::Applied(outcome) => {
                        match &outcome {
                            StatusOutcome::Changed { from, to } => {
                                tracing::info!(kind = %kind, id = %id, from = ?from, to = %to, "Replica status updated")
                            }
                            StatusOutcome::Unchanged => {
                                tracing::debug!(kind = %kind, id = %id, status = %status, "Status already applied")
                            }
                            StatusOutcome::Stale { current, incoming } => tracing::warn!(
                                kind = %kind,
                                id = %id,
                                current = %current,
                                incoming = %incoming,
                                "Dropping stale status update"
                            ),
                        }
                        Ok(outcome.into())
                    }
                    UpdateOutcome::Parked => {
                        tracing::warn!(
                            kind = %kind,
                            id = %id,
                            status = %status,
                            "⏳ No replica yet, parking status update"
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.record_orphan(kind.as_str());
                        }
                        Ok(ApplyOutcome::Parked)
                    }
                }
            }
        }
    }

    /// Decode a delivery body for `topic` and apply it.
    pub async fn apply_delivery(
        &self,
        topic: Topic,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ApplyError> {
        let event = ReplicaEvent::decode(topic, body, now)?;
        Ok(self.apply(event, now).await?)
    }
}

#[async_trait]
impl MessageHandler for ApplyEngine {
    async fn handle(&self, topic: Topic, body: &[u8]) -> Result<(), HandlerError> {
        match self.apply_delivery(topic, body, Utc::now()).await {
            Ok(outcome) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_applied(topic.as_str(), outcome.label());
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Failed to apply replica event");
                Err(e.into())
            }
        }
    }
}

// ============================================================================
// Orphan sweeper
// ============================================================================

/// Dead-letters parked updates whose replica never arrived.
pub struct OrphanSweeper {
    store: Arc<dyn ReplicaStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    interval: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl OrphanSweeper {
    pub fn new(store: Arc<dyn ReplicaStore>, dead_letters: Arc<dyn DeadLetterSink>, interval: Duration) -> Self {
        Self {
            store,
            dead_letters,
            interval,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Dead-letter everything due at `now`. Returns how many updates were expired.
    ///
    /// An update leaves the pending buffer only after its dead letter was
    /// recorded. When the sink fails, the updates already recorded are removed
    /// and the rest stay parked for the next sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let due = self.store.due_pending(now).await?;
        let mut recorded = Vec::with_capacity(due.len());
        let mut failure = None;

        for pending in &due {
            let update = &pending.update;
            let letter = match serde_json::to_vec(update) {
                Ok(payload) => DeadLetter::new(
                    format!("pending_updates.{}", update.kind),
                    &payload,
                    format!("no {} replica `{}` arrived before the pending deadline", update.kind, update.id),
                    DeadLetterReason::OrphanExpired,
                    1,
                ),
                Err(e) => {
                    failure = Some(StoreError::from(e));
                    break;
                }
            };
            if let Err(e) = self.dead_letters.record(letter).await {
                failure = Some(e);
                break;
            }
            recorded.push(pending.seq);
            if let Some(metrics) = &self.metrics {
                metrics.record_dlq_message(DeadLetterReason::OrphanExpired.as_str());
            }
        }

        self.store.remove_pending(&recorded).await?;

        if !recorded.is_empty() {
            tracing::warn!(expired = recorded.len(), "💀 Expired orphan status updates");
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_pending_updates(self.store.pending_count().await?);
        }
        match failure {
            Some(e) => {
                tracing::error!(
                    recorded = recorded.len(),
                    remaining = due.len() - recorded.len(),
                    error = %e,
                    "Dead-letter sink failed, leaving orphans parked"
                );
                Err(e)
            }
            None => Ok(recorded.len()),
        }
    }

    /// Sweep on every tick until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        tracing::error!(error = %e, "Orphan sweep failed");
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        tracing::info!("Orphan sweeper stopped");
    }
}
