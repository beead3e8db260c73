use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::messaging::{BrokerConnection, ConnectionState, Publisher};
use crate::metrics::Metrics;
use crate::utils::{shutdown_requested, CircuitState};

// ============================================================================
// Health Monitoring
// ============================================================================
//
// Components report into a shared registry; the overall status is the worst
// of them:
// - any component Unhealthy → Unhealthy
// - any component Degraded  → Degraded
// - otherwise               → Healthy
//
// The monitor polls the broker connection and the publisher's circuit
// breaker on a fixed interval and feeds the registry.
//
// ============================================================================

/// Health status of a component
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy(_))
    }

    pub fn as_gauge(&self) -> i64 {
        match self {
            HealthStatus::Unhealthy(_) => 0,
            HealthStatus::Degraded(_) => 1,
            HealthStatus::Healthy => 2,
        }
    }
}

/// Health information for a component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    #[serde(flatten)]
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    pub details: Option<String>,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            last_check: Utc::now(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub check_time: DateTime<Utc>,
}

#[derive(Default)]
pub struct HealthRegistry {
    components: Mutex<HashMap<String, ComponentHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, health: ComponentHealth) {
        tracing::debug!(component = %health.name, status = ?health.status, "Updated component health");
        self.components
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(health.name.clone(), health);
    }

    pub fn report(&self) -> SystemHealth {
        let mut components: Vec<ComponentHealth> = self
            .components
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        components.sort_by(|a, b| a.name.cmp(&b.name));

        SystemHealth {
            overall: compute_overall_status(&components),
            components,
            check_time: Utc::now(),
        }
    }
}

fn compute_overall_status(components: &[ComponentHealth]) -> HealthStatus {
    let mut has_degraded = false;
    let mut unhealthy_components = Vec::new();

    for health in components {
        match &health.status {
            HealthStatus::Unhealthy(msg) => {
                unhealthy_components.push(format!("{}: {}", health.name, msg));
            }
            HealthStatus::Degraded(_) => {
                has_degraded = true;
            }
            HealthStatus::Healthy => {}
        }
    }

    if !unhealthy_components.is_empty() {
        HealthStatus::Unhealthy(unhealthy_components.join(", "))
    } else if has_degraded {
        HealthStatus::Degraded("Some components degraded".to_string())
    } else {
        HealthStatus::Healthy
    }
}

pub fn connection_health(state: ConnectionState) -> HealthStatus {
    match state {
        ConnectionState::Healthy => HealthStatus::Healthy,
        ConnectionState::Opening => HealthStatus::Degraded("Connecting to broker".to_string()),
        ConnectionState::Disconnected => HealthStatus::Unhealthy("Broker disconnected".to_string()),
        ConnectionState::Closed => HealthStatus::Unhealthy("Broker connection closed".to_string()),
    }
}

pub fn breaker_health(state: CircuitState) -> HealthStatus {
    match state {
        CircuitState::Closed => HealthStatus::Healthy,
        CircuitState::HalfOpen => HealthStatus::Degraded("Circuit breaker half-open".to_string()),
        CircuitState::Open => HealthStatus::Unhealthy("Circuit breaker open".to_string()),
    }
}

/// Periodically samples the broker connection and publisher breaker.
pub struct HealthMonitor {
    registry: Arc<HealthRegistry>,
    connection: Arc<BrokerConnection>,
    publisher: Option<Arc<Publisher>>,
    metrics: Option<Arc<Metrics>>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<HealthRegistry>, connection: Arc<BrokerConnection>) -> Self {
        Self {
            registry,
            connection,
            publisher: None,
            metrics: None,
            interval: Duration::from_secs(10),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Take one sample and update the registry.
    pub fn check(&self) {
        let state = self.connection.state();
        self.registry
            .update(ComponentHealth::new("broker", connection_health(state)).with_details(state.as_str()));

        if let Some(publisher) = &self.publisher {
            let breaker = publisher.circuit_state();
            self.registry.update(ComponentHealth::new("publisher", breaker_health(breaker)));
            if let Some(metrics) = &self.metrics {
                metrics.update_circuit_breaker_state(breaker);
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.update_connection_state(state);
            metrics.update_health_status(&self.registry.report().overall);
        }
    }

    /// Sample on every tick until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Health monitor started");
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.check(),
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{ConnectionConfig, InMemoryBroker};

    #[test]
    fn test_overall_is_worst_component() {
        let registry = HealthRegistry::new();
        assert_eq!(registry.report().overall, HealthStatus::Healthy);

        registry.update(ComponentHealth::new("broker", HealthStatus::Healthy));
        registry.update(ComponentHealth::new("publisher", HealthStatus::Degraded("half-open".into())));
        assert!(matches!(registry.report().overall, HealthStatus::Degraded(_)));

        registry.update(ComponentHealth::new("broker", HealthStatus::Unhealthy("down".into())));
        assert_eq!(registry.report().overall, HealthStatus::Unhealthy("broker: down".to_string()));
    }

    #[test]
    fn test_status_serializes_with_tag() {
        let health = ComponentHealth::new("broker", HealthStatus::Degraded("opening".into()));
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["reason"], "opening");
        assert_eq!(json["name"], "broker");
    }

    #[tokio::test]
    async fn test_monitor_tracks_connection_state() {
        let broker = Arc::new(InMemoryBroker::new());
        let connection = Arc::new(BrokerConnection::new(broker, ConnectionConfig::default()));
        let registry = Arc::new(HealthRegistry::new());
        let monitor = HealthMonitor::new(registry.clone(), connection.clone());

        monitor.check();
        assert!(registry.report().overall.is_unhealthy());

        connection.connect().await.unwrap();
        monitor.check();
        assert!(registry.report().overall.is_healthy());
    }
}
