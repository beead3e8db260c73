use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics::Metrics;
use crate::topics::Topic;
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};

use super::{with_timeout, BrokerConnection, BrokerError};

/// Places JSON events on durable queues.
///
/// A publish is connect, declare, send and confirm, each under
/// `operation_timeout`, all inside the circuit breaker. Retries are left to
/// the caller (the outbox relay re-attempts pending rows on its next tick).
pub struct Publisher {
    connection: Arc<BrokerConnection>,
    circuit_breaker: CircuitBreaker,
    operation_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl Publisher {
    pub fn new(
        connection: Arc<BrokerConnection>,
        breaker_config: CircuitBreakerConfig,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            circuit_breaker: CircuitBreaker::new(breaker_config),
            operation_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn publish<T: Serialize>(&self, topic: Topic, payload: &T) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(payload)?;
        self.publish_bytes(topic.as_str(), body).await
    }

    /// Publish an already-serialized JSON body.
    pub async fn publish_bytes(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let result = self.circuit_breaker.call(self.send(queue, body)).await;
        self.report_breaker();

        match result {
            Ok(()) => {
                tracing::debug!(queue = %queue, "Published event");
                self.record(queue, "ok");
                Ok(())
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                tracing::error!(queue = %queue, "Circuit breaker open - broker unavailable");
                self.record(queue, "circuit_open");
                Err(BrokerError::CircuitOpen)
            }
            Err(CircuitBreakerError::OperationFailed(e)) => {
                tracing::error!(error = %e, queue = %queue, "Failed to publish event");
                self.record(queue, "error");
                Err(e)
            }
        }
    }

    async fn send(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let channel = self.connection.connect().await?;
        let timeout = self.operation_timeout;

        let sent = async {
            with_timeout("declare", timeout, channel.declare_durable_queue(queue)).await?;
            with_timeout("publish", timeout, channel.send(queue, body)).await
        }
        .await;

        if let Err(e) = &sent {
            if !channel.is_open() || matches!(e, BrokerError::Timeout { .. }) {
                self.connection.invalidate(&channel).await;
            }
        }
        sent
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    fn report_breaker(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.update_circuit_breaker_state(self.circuit_breaker.state());
        }
    }

    fn record(&self, queue: &str, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_publish(queue, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{ConnectionConfig, InMemoryBroker};
    use crate::utils::RetryConfig;
    use futures_util::StreamExt;
    use serde_json::json;

    fn connection(broker: &InMemoryBroker) -> Arc<BrokerConnection> {
        Arc::new(BrokerConnection::new(
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
        ))
    }

    fn breaker(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }

    #[tokio::test]
    async fn test_publish_declares_queue_and_delivers_json() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker);
        let publisher = Publisher::new(connection.clone(), breaker(5), Duration::from_secs(1));

        publisher
            .publish(Topic::NotificationUserCreated, &json!({"id": "u1", "email": "a@b.c"}))
            .await
            .unwrap();

        let queue = Topic::NotificationUserCreated.as_str();
        assert!(broker.queue_exists(queue));
        assert_eq!(broker.depth(queue), 1);

        let channel = connection.connect().await.unwrap();
        let mut stream = channel.consume(queue, "test").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(body["id"], "u1");
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let publisher = Publisher::new(connection(&broker), breaker(2), Duration::from_secs(1));

        for _ in 0..2 {
            let err = publisher.publish_bytes("q", b"{}".to_vec()).await.unwrap_err();
            assert!(matches!(err, BrokerError::Connection(_)));
        }
        assert_eq!(publisher.circuit_state(), CircuitState::Open);

        broker.set_available(true);
        let err = publisher.publish_bytes("q", b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, BrokerError::CircuitOpen));
        assert_eq!(broker.depth("q"), 0);
    }

    #[tokio::test]
    async fn test_broken_channel_is_replaced_on_next_publish() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker);
        let publisher = Publisher::new(connection.clone(), breaker(5), Duration::from_secs(1));

        publisher.publish_bytes("q", b"1".to_vec()).await.unwrap();
        broker.sever_connections();

        publisher.publish_bytes("q", b"2".to_vec()).await.unwrap();
        assert_eq!(broker.channels_opened(), 2);
        assert_eq!(broker.depth("q"), 2);
    }
}
