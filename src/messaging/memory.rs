use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use super::{Acknowledger, BrokerError, Channel, Connector, Delivery, DeliveryStream};

// ============================================================================
// In-Memory Broker
// ============================================================================
//
// Durable-queue semantics without a broker process, for `memory://` URLs and
// for tests:
// - queues outlive channels (messages survive a severed connection)
// - deliveries stay unacknowledged until ack/nack; a delivery dropped
//   without being settled goes back to the head of its queue
// - nack with requeue redelivers with an incremented delivery count
//
// ============================================================================

const IDLE_POLL: Duration = Duration::from_millis(25);

struct Stored {
    body: Vec<u8>,
    delivery_count: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    unacked: usize,
    acked: u64,
    rejected: u64,
    notify: Arc<Notify>,
}

struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    channels: Mutex<Vec<Arc<AtomicBool>>>,
    available: AtomicBool,
    channels_opened: AtomicUsize,
    rejecting: Mutex<HashSet<String>>,
}

impl Shared {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn requeue(&self, queue: &str, mut message: Stored) {
        let mut queues = self.queues();
        if let Some(state) = queues.get_mut(queue) {
            state.unacked = state.unacked.saturating_sub(1);
            message.delivery_count += 1;
            state.ready.push_front(message);
            state.notify.notify_one();
        }
    }

    fn take_next(&self, queue: &str) -> Result<Option<Stored>, Arc<Notify>> {
        let mut queues = self.queues();
        match queues.get_mut(queue) {
            Some(state) => match state.ready.pop_front() {
                Some(message) => {
                    state.unacked += 1;
                    Ok(Some(message))
                }
                None => Err(state.notify.clone()),
            },
            None => Ok(None),
        }
    }
}

#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(HashMap::new()),
                channels: Mutex::new(Vec::new()),
                available: AtomicBool::new(true),
                channels_opened: AtomicUsize::new(0),
                rejecting: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Close every channel opened so far, as a dropped TCP connection would.
    pub fn sever_connections(&self) {
        let channels = self.shared.channels.lock().unwrap_or_else(|p| p.into_inner());
        for open in channels.iter() {
            open.store(false, Ordering::SeqCst);
        }
    }

    /// Nack every publish to `queue` while `reject` is set, as a broker
    /// refusing messages (full disk, policy) would.
    pub fn reject_publishes(&self, queue: &str, reject: bool) {
        let mut rejecting = self.shared.rejecting.lock().unwrap_or_else(|p| p.into_inner());
        if reject {
            rejecting.insert(queue.to_string());
        } else {
            rejecting.remove(queue);
        }
    }

    pub fn channels_opened(&self) -> usize {
        self.shared.channels_opened.load(Ordering::SeqCst)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.shared.queues().contains_key(queue)
    }

    /// Messages waiting to be delivered.
    pub fn depth(&self, queue: &str) -> usize {
        self.shared.queues().get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    pub fn unacked(&self, queue: &str) -> usize {
        self.shared.queues().get(queue).map(|q| q.unacked).unwrap_or(0)
    }

    pub fn acked(&self, queue: &str) -> u64 {
        self.shared.queues().get(queue).map(|q| q.acked).unwrap_or(0)
    }

    pub fn rejected(&self, queue: &str) -> u64 {
        self.shared.queues().get(queue).map(|q| q.rejected).unwrap_or(0)
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn open(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("in-memory broker unavailable".to_string()));
        }
        let open = Arc::new(AtomicBool::new(true));
        self.shared
            .channels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(open.clone());
        self.shared.channels_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(InMemoryChannel {
            shared: self.shared.clone(),
            open,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct InMemoryChannel {
    shared: Arc<Shared>,
    open: Arc<AtomicBool>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) && self.shared.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Connection("channel is not open".to_string()))
        }
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_durable_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared.queues().entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn send(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if self.shared.rejecting.lock().unwrap_or_else(|p| p.into_inner()).contains(queue) {
            return Err(BrokerError::Publish {
                queue: queue.to_string(),
                reason: "message nacked by broker".to_string(),
            });
        }
        let mut queues = self.shared.queues();
        let state = queues.get_mut(queue).ok_or_else(|| BrokerError::Publish {
            queue: queue.to_string(),
            reason: "queue not declared".to_string(),
        })?;
        state.ready.push_back(Stored {
            body,
            delivery_count: 1,
        });
        state.notify.notify_one();
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        if !self.shared.queues().contains_key(queue) {
            return Err(BrokerError::Consume {
                queue: queue.to_string(),
                reason: "queue not declared".to_string(),
            });
        }

        let init = (self.shared.clone(), self.open.clone(), queue.to_string());
        let deliveries = stream::unfold(init, |(shared, open, queue)| async move {
            loop {
                if !open.load(Ordering::SeqCst) {
                    return None;
                }
                match shared.take_next(&queue) {
                    Ok(Some(message)) => {
                        let delivery_count = message.delivery_count;
                        let body = message.body.clone();
                        let acker = MemoryAcker {
                            shared: shared.clone(),
                            open: open.clone(),
                            queue: queue.clone(),
                            message: Mutex::new(Some(message)),
                        };
                        let delivery = Delivery::new(queue.clone(), body, delivery_count, Box::new(acker));
                        return Some((Ok(delivery), (shared, open, queue)));
                    }
                    Ok(None) => return None,
                    Err(notify) => {
                        let _ = tokio::time::timeout(IDLE_POLL, notify.notified()).await;
                    }
                }
            }
        });

        Ok(deliveries.boxed())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    open: Arc<AtomicBool>,
    queue: String,
    message: Mutex<Option<Stored>>,
}

impl MemoryAcker {
    fn take(&self) -> Result<Stored, BrokerError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::Ack("channel closed before settle".to_string()));
        }
        self.message
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| BrokerError::Ack("delivery already settled".to_string()))
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.take()?;
        let mut queues = self.shared.queues();
        if let Some(state) = queues.get_mut(&self.queue) {
            state.unacked = state.unacked.saturating_sub(1);
            state.acked += 1;
        }
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let message = self.take()?;
        if requeue {
            self.shared.requeue(&self.queue, message);
        } else {
            let mut queues = self.shared.queues();
            if let Some(state) = queues.get_mut(&self.queue) {
                state.unacked = state.unacked.saturating_sub(1);
                state.rejected += 1;
            }
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        let pending = self.message.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(message) = pending {
            self.shared.requeue(&self.queue, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn channel(broker: &InMemoryBroker) -> Arc<dyn Channel> {
        let channel = broker.open().await.unwrap();
        channel.declare_durable_queue("q").await.unwrap();
        channel
    }

    #[tokio::test]
    async fn test_send_requires_declared_queue() {
        let broker = InMemoryBroker::new();
        let channel = broker.open().await.unwrap();
        assert!(matches!(
            channel.send("missing", b"{}".to_vec()).await,
            Err(BrokerError::Publish { .. })
        ));
    }

    #[tokio::test]
    async fn test_deliveries_preserve_order_and_ack() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        channel.send("q", b"1".to_vec()).await.unwrap();
        channel.send("q", b"2".to_vec()).await.unwrap();

        let mut stream = channel.consume("q", "test").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.body, b"1");
        assert_eq!(broker.unacked("q"), 1);
        first.ack().await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"2");
        second.ack().await.unwrap();

        assert_eq!(broker.acked("q"), 2);
        assert_eq!(broker.depth("q"), 0);
    }

    #[tokio::test]
    async fn test_nack_requeue_increments_delivery_count() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        channel.send("q", b"x".to_vec()).await.unwrap();

        let mut stream = channel.consume("q", "test").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.delivery_count, 1);
        delivery.nack(true).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.delivery_count, 2);
        again.nack(false).await.unwrap();

        assert_eq!(broker.rejected("q"), 1);
        assert_eq!(broker.depth("q"), 0);
    }

    #[tokio::test]
    async fn test_unsettled_delivery_returns_to_queue() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        channel.send("q", b"x".to_vec()).await.unwrap();

        let mut stream = channel.consume("q", "test").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        broker.sever_connections();
        assert!(delivery.ack().await.is_err());

        assert_eq!(broker.depth("q"), 1);
        assert_eq!(broker.unacked("q"), 0);
    }
}
