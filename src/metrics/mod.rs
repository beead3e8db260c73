// Private module declaration
mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::health::HealthStatus;
use crate::messaging::ConnectionState;
use crate::utils::CircuitState;

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Provides metrics for:
// - Replica apply outcomes (created, duplicate, changed, stale, parked)
// - Handler failures, redeliveries and processing latency per queue
// - Dead Letter Queue statistics and orphan updates
// - Publisher results, circuit breaker and broker connection state
// - Rate gate decisions, emails sent, outbox backlog
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

/// Central metrics registry for the entire application
pub struct Metrics {
    registry: Registry,

    // Apply Metrics
    pub events_applied: IntCounterVec,
    pub handler_failures: IntCounterVec,
    pub processing_duration: HistogramVec,
    pub redeliveries: IntCounterVec,

    // DLQ / Orphan Metrics
    pub dlq_messages_total: IntCounter,
    pub dlq_messages_by_reason: IntCounterVec,
    pub orphan_updates_total: IntCounterVec,
    pub pending_updates: IntGauge,

    // Broker Metrics
    pub publish_total: IntCounterVec,
    pub circuit_breaker_state: IntGauge,
    pub broker_connection_state: IntGauge,

    // Gate / Notification / Outbox Metrics
    pub rate_gate_decisions: IntCounterVec,
    pub rate_gate_tracked_identities: IntGauge,
    pub emails_sent: IntCounterVec,
    pub outbox_pending: IntGauge,
    pub outbox_published_total: IntCounter,

    pub service_health_status: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Apply Metrics
        let events_applied = IntCounterVec::new(
            Opts::new("replica_events_applied_total", "Replica events applied, by outcome"),
            &["topic", "outcome"],
        )?;
        registry.register(Box::new(events_applied.clone()))?;

        let handler_failures = IntCounterVec::new(
            Opts::new("handler_failures_total", "Deliveries whose handler returned an error"),
            &["topic", "reason"],
        )?;
        registry.register(Box::new(handler_failures.clone()))?;

        let processing_duration = HistogramVec::new(
            HistogramOpts::new("delivery_processing_duration_seconds", "Handler duration per delivery")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["topic"],
        )?;
        registry.register(Box::new(processing_duration.clone()))?;

        let redeliveries = IntCounterVec::new(
            Opts::new("redeliveries_total", "Deliveries nacked for redelivery"),
            &["topic"],
        )?;
        registry.register(Box::new(redeliveries.clone()))?;

        // DLQ / Orphan Metrics
        let dlq_messages_total = IntCounter::new("dlq_messages_total", "Total messages in dead letter queue")?;
        registry.register(Box::new(dlq_messages_total.clone()))?;

        let dlq_messages_by_reason = IntCounterVec::new(
            Opts::new("dlq_messages_by_reason", "DLQ messages by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(dlq_messages_by_reason.clone()))?;

        let orphan_updates_total = IntCounterVec::new(
            Opts::new("orphan_updates_total", "Status updates that arrived before their replica"),
            &["kind"],
        )?;
        registry.register(Box::new(orphan_updates_total.clone()))?;

        let pending_updates = IntGauge::new("pending_updates", "Status updates parked awaiting their replica")?;
        registry.register(Box::new(pending_updates.clone()))?;

        // Broker Metrics
        let publish_total = IntCounterVec::new(
            Opts::new("publish_total", "Publish attempts by queue and result"),
            &["queue", "result"],
        )?;
        registry.register(Box::new(publish_total.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let broker_connection_state = IntGauge::new(
            "broker_connection_state",
            "Broker connection state (0=Disconnected, 1=Opening, 2=Healthy, 3=Closed)",
        )?;
        registry.register(Box::new(broker_connection_state.clone()))?;

        // Gate / Notification / Outbox Metrics
        let rate_gate_decisions = IntCounterVec::new(
            Opts::new("rate_gate_decisions_total", "Rate gate decisions"),
            &["decision"],
        )?;
        registry.register(Box::new(rate_gate_decisions.clone()))?;

        let rate_gate_tracked_identities =
            IntGauge::new("rate_gate_tracked_identities", "Identities with live request timestamps")?;
        registry.register(Box::new(rate_gate_tracked_identities.clone()))?;

        let emails_sent = IntCounterVec::new(
            Opts::new("emails_sent_total", "Notification emails by template and result"),
            &["template", "result"],
        )?;
        registry.register(Box::new(emails_sent.clone()))?;

        let outbox_pending = IntGauge::new("outbox_pending", "Outbox messages waiting to be published")?;
        registry.register(Box::new(outbox_pending.clone()))?;

        let outbox_published_total = IntCounter::new("outbox_published_total", "Outbox messages published")?;
        registry.register(Box::new(outbox_published_total.clone()))?;

        let service_health_status = IntGauge::new(
            "service_health_status",
            "Overall health status (0=Unhealthy, 1=Degraded, 2=Healthy)",
        )?;
        registry.register(Box::new(service_health_status.clone()))?;

        Ok(Self {
            registry,
            events_applied,
            handler_failures,
            processing_duration,
            redeliveries,
            dlq_messages_total,
            dlq_messages_by_reason,
            orphan_updates_total,
            pending_updates,
            publish_total,
            circuit_breaker_state,
            broker_connection_state,
            rate_gate_decisions,
            rate_gate_tracked_identities,
            emails_sent,
            outbox_pending,
            outbox_published_total,
            service_health_status,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_applied(&self, topic: &str, outcome: &str) {
        self.events_applied.with_label_values(&[topic, outcome]).inc();
    }

    pub fn observe_processing(&self, topic: &str, duration_secs: f64) {
        self.processing_duration.with_label_values(&[topic]).observe(duration_secs);
    }

    pub fn record_handler_failure(&self, topic: &str, reason: &str) {
        self.handler_failures.with_label_values(&[topic, reason]).inc();
    }

    pub fn record_redelivery(&self, topic: &str) {
        self.redeliveries.with_label_values(&[topic]).inc();
    }

    /// Helper to record DLQ message
    pub fn record_dlq_message(&self, reason: &str) {
        self.dlq_messages_total.inc();
        self.dlq_messages_by_reason.with_label_values(&[reason]).inc();
    }

    pub fn record_orphan(&self, kind: &str) {
        self.orphan_updates_total.with_label_values(&[kind]).inc();
    }

    pub fn set_pending_updates(&self, count: u64) {
        self.pending_updates.set(count as i64);
    }

    pub fn record_publish(&self, queue: &str, result: &str) {
        self.publish_total.with_label_values(&[queue, result]).inc();
    }

    /// Helper to update circuit breaker state
    pub fn update_circuit_breaker_state(&self, state: CircuitState) {
        self.circuit_breaker_state.set(state.as_gauge());
    }

    pub fn update_connection_state(&self, state: ConnectionState) {
        self.broker_connection_state.set(state.as_gauge());
    }

    pub fn record_gate_decision(&self, allowed: bool) {
        let decision = if allowed { "allowed" } else { "denied" };
        self.rate_gate_decisions.with_label_values(&[decision]).inc();
    }

    pub fn set_tracked_identities(&self, count: usize) {
        self.rate_gate_tracked_identities.set(count as i64);
    }

    pub fn record_email(&self, template: &str, sent: bool) {
        let result = if sent { "sent" } else { "failed" };
        self.emails_sent.with_label_values(&[template, result]).inc();
    }

    pub fn set_outbox_pending(&self, count: u64) {
        self.outbox_pending.set(count as i64);
    }

    pub fn record_outbox_published(&self, count: u64) {
        self.outbox_published_total.inc_by(count);
    }

    pub fn update_health_status(&self, status: &HealthStatus) {
        self.service_health_status.set(status.as_gauge());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_applied("AUTH_SELLER_DASHBOARD.USER_CREATED", "created");
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_record_applied_by_outcome() {
        let metrics = Metrics::new().unwrap();
        metrics.record_applied("PAYMENT_SELLER_DASHBOARD.PAYMENT_CREATED", "created");
        metrics.record_applied("PAYMENT_SELLER_DASHBOARD.PAYMENT_CREATED", "duplicate");
        metrics.record_applied("PAYMENT_SELLER_DASHBOARD.PAYMENT_CREATED", "duplicate");

        let gathered = metrics.registry.gather();
        let applied = gathered.iter().find(|m| m.name() == "replica_events_applied_total").unwrap();
        assert_eq!(applied.metric.len(), 2);
    }

    #[test]
    fn test_record_dlq_message() {
        let metrics = Metrics::new().unwrap();
        metrics.record_dlq_message("malformed");
        metrics.record_dlq_message("orphan_expired");

        assert_eq!(metrics.dlq_messages_total.get(), 2);
        assert_eq!(metrics.dlq_messages_by_reason.with_label_values(&["malformed"]).get(), 1);
    }

    #[test]
    fn test_circuit_breaker_and_connection_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.update_circuit_breaker_state(CircuitState::Open);
        metrics.update_connection_state(ConnectionState::Healthy);

        assert_eq!(metrics.circuit_breaker_state.get(), 1);
        assert_eq!(metrics.broker_connection_state.get(), 2);
    }
}
