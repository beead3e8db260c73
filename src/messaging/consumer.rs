use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dlq::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::metrics::Metrics;
use crate::topics::Topic;
use crate::utils::RetryConfig;

use super::{with_timeout, BrokerConnection, BrokerError, Channel, Delivery, DeliveryStream};

// ============================================================================
// Consumer Registry
// ============================================================================
//
// One task per durable queue. Each task takes a delivery, awaits its handler,
// settles it, and only then takes the next one, so processing within a queue
// is strictly sequential. Queues run concurrently with each other.
//
// Acknowledgement contract:
//
//   handler Ok                               → ack
//   malformed / permanent                    → dead letter, ack
//   transient, delivery_count < max          → delay, nack(requeue)
//   transient, delivery_count >= max         → dead letter, ack
//   dead letter write failed                 → nack(requeue)
//
// A handler that exceeds `handler_timeout` counts as a transient failure.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The payload can never be processed (bad JSON, missing identifier).
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Worth another delivery (store or relay unavailable).
    #[error("transient failure: {0}")]
    Transient(String),
}

impl HandlerError {
    pub fn reason(&self) -> &'static str {
        match self {
            HandlerError::Malformed(_) => "malformed",
            HandlerError::Permanent(_) => "permanent",
            HandlerError::Transient(_) => "transient",
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: Topic, body: &[u8]) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter(DeadLetterReason),
}

/// Map a handler result and delivery count onto what happens to the message.
pub fn decide(result: &Result<(), HandlerError>, delivery_count: u32, max_deliveries: u32) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(HandlerError::Malformed(_)) => Disposition::DeadLetter(DeadLetterReason::Malformed),
        Err(HandlerError::Permanent(_)) => Disposition::DeadLetter(DeadLetterReason::Permanent),
        Err(HandlerError::Transient(_)) if delivery_count < max_deliveries => Disposition::Requeue,
        Err(HandlerError::Transient(_)) => Disposition::DeadLetter(DeadLetterReason::RetriesExhausted),
    }
}

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// Deliveries (first one included) before a transient failure is dead-lettered.
    pub max_deliveries: u32,
    pub handler_timeout: Duration,
    /// Delay before a requeueing nack, indexed by delivery count.
    pub redelivery: RetryConfig,
    /// Backoff between attempts to re-establish a consumer.
    pub reconnect: RetryConfig,
    pub operation_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            handler_timeout: Duration::from_secs(30),
            redelivery: RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
            reconnect: RetryConfig::aggressive(),
            operation_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

pub struct ConsumerRegistry {
    connection: Arc<BrokerConnection>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: ConsumerConfig,
    metrics: Option<Arc<Metrics>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<HashMap<Topic, JoinHandle<()>>>,
}

impl ConsumerRegistry {
    pub fn new(
        connection: Arc<BrokerConnection>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: ConsumerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            connection,
            dead_letters,
            config,
            metrics: None,
            shutdown,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start consuming `topic`. A queue can only have one consumer.
    pub fn subscribe(&self, topic: Topic, handler: Arc<dyn MessageHandler>) -> Result<(), BrokerError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if *self.shutdown.borrow() {
            return Err(BrokerError::Closed);
        }
        if tasks.contains_key(&topic) {
            return Err(BrokerError::AlreadySubscribed(topic.to_string()));
        }

        let worker = QueueWorker {
            topic,
            handler,
            connection: self.connection.clone(),
            dead_letters: self.dead_letters.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        tasks.insert(topic, tokio::spawn(worker.run()));

        tracing::info!(topic = %topic, "Subscribed to queue");
        Ok(())
    }

    pub fn subscribed_topics(&self) -> Vec<Topic> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).keys().copied().collect()
    }

    /// Stop taking deliveries, wait for in-flight handlers, close the connection.
    pub async fn shutdown(&self) {
        tracing::info!("🛑 Stopping consumers");
        self.shutdown.send_replace(true);

        let tasks: Vec<(Topic, JoinHandle<()>)> =
            self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain().collect();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        for (topic, mut task) in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => tracing::debug!(topic = %topic, "Consumer stopped"),
                Ok(Err(e)) => tracing::error!(topic = %topic, error = %e, "Consumer task failed"),
                Err(_) => {
                    tracing::warn!(topic = %topic, "Consumer did not stop within grace period, aborting");
                    task.abort();
                }
            }
        }

        self.connection.close().await;
    }
}

struct QueueWorker {
    topic: Topic,
    handler: Arc<dyn MessageHandler>,
    connection: Arc<BrokerConnection>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: ConsumerConfig,
    metrics: Option<Arc<Metrics>>,
    shutdown: watch::Receiver<bool>,
}

impl QueueWorker {
    async fn run(mut self) {
        let queue = self.topic.as_str();
        let mut failures: u32 = 0;

        while !self.stopping() {
            match self.open_stream().await {
                Ok((channel, mut stream)) => {
                    failures = 0;
                    tracing::info!(queue = %queue, "👂 Consuming");

                    loop {
                        let next = tokio::select! {
                            _ = self.shutdown.changed() => return,
                            next = stream.next() => next,
                        };

                        match next {
                            Some(Ok(delivery)) => self.process(delivery).await,
                            Some(Err(e)) => {
                                tracing::warn!(queue = %queue, error = %e, "Delivery stream failed");
                                break;
                            }
                            None => {
                                tracing::warn!(queue = %queue, "Delivery stream ended");
                                break;
                            }
                        }

                        if self.stopping() {
                            return;
                        }
                    }

                    self.connection.invalidate(&channel).await;
                }
                Err(BrokerError::Closed) => return,
                Err(e) => {
                    tracing::warn!(queue = %queue, error = %e, "Failed to start consumer");
                }
            }

            failures += 1;
            let delay = self.config.reconnect.delay_for(failures);
            tracing::info!(queue = %queue, delay_ms = delay.as_millis() as u64, "Re-establishing consumer after delay");
            tokio::select! {
                _ = self.shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn open_stream(&self) -> Result<(Arc<dyn Channel>, DeliveryStream), BrokerError> {
        let queue = self.topic.as_str();
        let timeout = self.config.operation_timeout;
        let channel = self.connection.connect().await?;

        with_timeout("declare", timeout, channel.declare_durable_queue(queue)).await?;
        let tag = format!("replica_sync.{}", queue);
        let stream = with_timeout("consume", timeout, channel.consume(queue, &tag)).await?;
        Ok((channel, stream))
    }

    async fn process(&self, delivery: Delivery) {
        let topic = self.topic;
        let started = Instant::now();

        let result = match tokio::time::timeout(
            self.config.handler_timeout,
            self.handler.handle(topic, &delivery.body),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Transient(format!(
                "handler timed out after {:?}",
                self.config.handler_timeout
            ))),
        };

        let delivery_count = delivery.delivery_count;
        let disposition = decide(&result, delivery_count, self.config.max_deliveries);

        if let Some(metrics) = &self.metrics {
            metrics.observe_processing(topic.as_str(), started.elapsed().as_secs_f64());
            if let Err(e) = &result {
                metrics.record_handler_failure(topic.as_str(), e.reason());
            }
        }

        match disposition {
            Disposition::Ack => {
                if let Err(e) = delivery.ack().await {
                    tracing::error!(topic = %topic, error = %e, "Failed to ack delivery");
                }
            }
            Disposition::Requeue => {
                let delay = self.config.redelivery.delay_for(delivery_count);
                tracing::warn!(
                    topic = %topic,
                    delivery_count = delivery_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %error_text(&result),
                    "🔄 Transient failure, requeueing delivery"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_redelivery(topic.as_str());
                }
                tokio::time::sleep(delay).await;
                if let Err(e) = delivery.nack(true).await {
                    tracing::error!(topic = %topic, error = %e, "Failed to requeue delivery");
                }
            }
            Disposition::DeadLetter(reason) => {
                let letter = DeadLetter::new(topic.as_str(), &delivery.body, error_text(&result), reason, delivery_count);
                match self.dead_letters.record(letter).await {
                    Ok(()) => {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_dlq_message(reason.as_str());
                        }
                        if let Err(e) = delivery.ack().await {
                            tracing::error!(topic = %topic, error = %e, "Failed to ack dead-lettered delivery");
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            topic = %topic,
                            error = %e,
                            "Failed to record dead letter, requeueing delivery"
                        );
                        if let Err(e) = delivery.nack(true).await {
                            tracing::error!(topic = %topic, error = %e, "Failed to requeue delivery");
                        }
                    }
                }
            }
        }
    }
}

fn error_text(result: &Result<(), HandlerError>) -> String {
    match result {
        Ok(()) => String::new(),
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::InMemoryDeadLetterSink;
    use crate::messaging::{Channel, ConnectionConfig, Connector, InMemoryBroker};
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOPIC: Topic = Topic::DashboardUserCreated;

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            max_deliveries: 3,
            handler_timeout: Duration::from_millis(200),
            redelivery: fast_retry(3),
            reconnect: fast_retry(3),
            operation_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    fn registry(broker: &InMemoryBroker, sink: Arc<dyn DeadLetterSink>) -> ConsumerRegistry {
        let connection = Arc::new(BrokerConnection::new(
            Arc::new(broker.clone()),
            ConnectionConfig {
                connect_timeout: Duration::from_millis(200),
                reconnect: fast_retry(2),
            },
        ));
        ConsumerRegistry::new(connection, sink, config())
    }

    async fn publish(broker: &InMemoryBroker, body: &[u8]) {
        let channel = broker.open().await.unwrap();
        channel.declare_durable_queue(TOPIC.as_str()).await.unwrap();
        channel.send(TOPIC.as_str(), body.to_vec()).await.unwrap();
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    /// Fails with the scripted errors in order, then succeeds.
    struct Scripted {
        script: Mutex<Vec<HandlerError>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut script: Vec<HandlerError>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for Scripted {
        async fn handle(&self, _topic: Topic, _body: &[u8]) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl DeadLetterSink for BrokenSink {
        async fn record(&self, _letter: DeadLetter) -> Result<(), StoreError> {
            Err(StoreError::Corrupt("sink offline".to_string()))
        }

        async fn recent(&self, _limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
            Ok(Vec::new())
        }

        async fn count(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    fn transient() -> HandlerError {
        HandlerError::Transient("store unavailable".to_string())
    }

    #[test]
    fn test_decide_follows_the_ack_contract() {
        assert_eq!(decide(&Ok(()), 1, 3), Disposition::Ack);
        assert_eq!(
            decide(&Err(HandlerError::Malformed("x".into())), 1, 3),
            Disposition::DeadLetter(DeadLetterReason::Malformed)
        );
        assert_eq!(
            decide(&Err(HandlerError::Permanent("x".into())), 1, 3),
            Disposition::DeadLetter(DeadLetterReason::Permanent)
        );
        assert_eq!(decide(&Err(transient()), 2, 3), Disposition::Requeue);
        assert_eq!(
            decide(&Err(transient()), 3, 3),
            Disposition::DeadLetter(DeadLetterReason::RetriesExhausted)
        );
    }

    #[tokio::test]
    async fn test_successful_delivery_is_acked() {
        let broker = InMemoryBroker::new();
        let sink = Arc::new(InMemoryDeadLetterSink::default());
        let registry = registry(&broker, sink.clone());
        let handler = Scripted::new(vec![]);

        publish(&broker, b"{\"id\":\"u1\"}").await;
        registry.subscribe(TOPIC, handler.clone()).unwrap();

        eventually(|| broker.acked(TOPIC.as_str()) == 1).await;
        assert_eq!(handler.calls(), 1);
        assert_eq!(sink.count().await.unwrap(), 0);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_delivery_is_dead_lettered_then_acked() {
        let broker = InMemoryBroker::new();
        let sink = Arc::new(InMemoryDeadLetterSink::default());
        let registry = registry(&broker, sink.clone());
        let handler = Scripted::new(vec![HandlerError::Malformed("missing identifier".into())]);

        publish(&broker, b"{}").await;
        registry.subscribe(TOPIC, handler.clone()).unwrap();

        eventually(|| broker.acked(TOPIC.as_str()) == 1).await;
        let letters = sink.snapshot();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::Malformed);
        assert_eq!(letters[0].topic, TOPIC.as_str());
        assert_eq!(handler.calls(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failure_is_redelivered_until_success() {
        let broker = InMemoryBroker::new();
        let sink = Arc::new(InMemoryDeadLetterSink::default());
        let registry = registry(&broker, sink.clone());
        let handler = Scripted::new(vec![transient(), transient()]);

        publish(&broker, b"{\"id\":\"u1\"}").await;
        registry.subscribe(TOPIC, handler.clone()).unwrap();

        eventually(|| broker.acked(TOPIC.as_str()) == 1).await;
        assert_eq!(handler.calls(), 3);
        assert_eq!(sink.count().await.unwrap(), 0);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failure_is_bounded() {
        let broker = InMemoryBroker::new();
        let sink = Arc::new(InMemoryDeadLetterSink::default());
        let registry = registry(&broker, sink.clone());
        let handler = Scripted::new(vec![transient(), transient(), transient(), transient()]);

        publish(&broker, b"{\"id\":\"u1\"}").await;
        registry.subscribe(TOPIC, handler.clone()).unwrap();

        eventually(|| broker.acked(TOPIC.as_str()) == 1).await;
        assert_eq!(handler.calls(), 3);
        let letters = sink.snapshot();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::RetriesExhausted);
        assert_eq!(letters[0].delivery_count, 3);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_dead_letter_failure_requeues_instead_of_acking() {
        let broker = InMemoryBroker::new();
        let registry = registry(&broker, Arc::new(BrokenSink));
        let handler = Scripted::new(vec![HandlerError::Permanent("rejected".into())]);

        publish(&broker, b"{\"id\":\"u1\"}").await;
        registry.subscribe(TOPIC, handler.clone()).unwrap();

        // First delivery fails permanently and cannot be dead-lettered, so it
        // comes back and succeeds on the second delivery.
        eventually(|| broker.acked(TOPIC.as_str()) == 1).await;
        assert_eq!(handler.calls(), 2);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_subscription_to_same_topic_is_rejected() {
        let broker = InMemoryBroker::new();
        let registry = registry(&broker, Arc::new(InMemoryDeadLetterSink::default()));

        registry.subscribe(TOPIC, Scripted::new(vec![])).unwrap();
        let err = registry.subscribe(TOPIC, Scripted::new(vec![])).unwrap_err();

        assert!(matches!(err, BrokerError::AlreadySubscribed(_)));
        assert_eq!(registry.subscribed_topics(), vec![TOPIC]);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_consumer_resumes_after_connection_loss() {
        let broker = InMemoryBroker::new();
        let registry = registry(&broker, Arc::new(InMemoryDeadLetterSink::default()));
        let handler = Scripted::new(vec![]);

        publish(&broker, b"{\"id\":\"u1\"}").await;
        registry.subscribe(TOPIC, handler.clone()).unwrap();
        eventually(|| broker.acked(TOPIC.as_str()) == 1).await;

        broker.sever_connections();
        publish(&broker, b"{\"id\":\"u2\"}").await;

        eventually(|| broker.acked(TOPIC.as_str()) == 2).await;
        assert!(broker.channels_opened() >= 2);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_handler() {
        struct Slow(AtomicUsize);

        #[async_trait]
        impl MessageHandler for Slow {
            async fn handle(&self, _topic: Topic, _body: &[u8]) -> Result<(), HandlerError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let broker = InMemoryBroker::new();
        let registry = registry(&broker, Arc::new(InMemoryDeadLetterSink::default()));
        let handler = Arc::new(Slow(AtomicUsize::new(0)));

        publish(&broker, b"{\"id\":\"u1\"}").await;
        registry.subscribe(TOPIC, handler.clone()).unwrap();
        eventually(|| broker.unacked(TOPIC.as_str()) == 1).await;

        registry.shutdown().await;

        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
        assert_eq!(broker.acked(TOPIC.as_str()), 1);
        assert!(registry.subscribe(TOPIC, handler).is_err());
    }
}
