use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::metrics::Metrics;
use crate::models::AuthContext;
use crate::utils::shutdown_requested;

// ============================================================================
// Rate-Limited Request Gate
// ============================================================================
//
// Sliding window per identity: at most `limit` admitted calls within any
// `window`. Each identity keeps the timestamps of its admitted calls; a call
// first drops timestamps at least `window` old, then is admitted (and
// recorded) only if fewer than `limit` remain.
//
// Memory stays bounded two ways: `sweep` drops identities with no live
// timestamps, and past `max_identities` the least recently seen identity is
// evicted to make room.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct RateGateConfig {
    pub window: Duration,
    pub limit: usize,
    pub max_identities: usize,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(60_000),
            limit: 2,
            max_identities: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    /// Over the limit; the oldest counted call leaves the window after `retry_after`.
    Denied { retry_after: Duration },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allowed)
    }
}

struct Calls {
    admitted: VecDeque<Instant>,
    last_seen: Instant,
}

/// Per-identity admission gate for request handlers.
///
/// The service binary serves no API routes of its own, so it only runs the
/// sweeper. Crates that embed replica_sync call `allow` or `check_context`
/// from their handlers and share one gate per process.
pub struct RateGate {
    config: RateGateConfig,
    identities: Mutex<HashMap<String, Calls>>,
    metrics: Option<Arc<Metrics>>,
}

impl RateGate {
    pub fn new(config: RateGateConfig) -> Self {
        Self {
            config,
            identities: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Calls>> {
        self.identities.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn allow(&self, identity: &str) -> bool {
        self.check(identity).is_allowed()
    }

    pub fn check(&self, identity: &str) -> GateDecision {
        self.check_at(identity, Instant::now())
    }

    /// Gate a request by the caller's authenticated identity. `None` when the
    /// context carries no identity to count against.
    pub fn check_context(&self, context: &AuthContext) -> Option<GateDecision> {
        context.identity().map(|identity| self.check(identity))
    }

    pub fn allow_at(&self, identity: &str, now: Instant) -> bool {
        self.check_at(identity, now).is_allowed()
    }

    pub fn check_at(&self, identity: &str, now: Instant) -> GateDecision {
        let window = self.config.window;
        let mut identities = self.lock();

        if !identities.contains_key(identity) && identities.len() >= self.config.max_identities {
            evict_least_recent(&mut identities);
        }

        let calls = identities.entry(identity.to_string()).or_insert_with(|| Calls {
            admitted: VecDeque::new(),
            last_seen: now,
        });
        calls.last_seen = now;

        while let Some(oldest) = calls.admitted.front() {
            if now.saturating_duration_since(*oldest) >= window {
                calls.admitted.pop_front();
            } else {
                break;
            }
        }

        let decision = if calls.admitted.len() < self.config.limit {
            calls.admitted.push_back(now);
            GateDecision::Allowed
        } else {
            let oldest = calls.admitted.front().copied().unwrap_or(now);
            GateDecision::Denied {
                retry_after: window.saturating_sub(now.saturating_duration_since(oldest)),
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_gate_decision(decision.is_allowed());
            metrics.set_tracked_identities(identities.len());
        }
        if !decision.is_allowed() {
            tracing::debug!(identity = %identity, "Rate limit exceeded");
        }
        decision
    }

    /// Drop identities whose every timestamp has left the window.
    pub fn sweep(&self, now: Instant) -> usize {
        let window = self.config.window;
        let mut identities = self.lock();
        let before = identities.len();

        identities.retain(|_, calls| {
            calls
                .admitted
                .back()
                .is_some_and(|newest| now.saturating_duration_since(*newest) < window)
        });

        if let Some(metrics) = &self.metrics {
            metrics.set_tracked_identities(identities.len());
        }
        before - identities.len()
    }

    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    /// Sweep every `every` until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = self.sweep(Instant::now());
                    if removed > 0 {
                        tracing::debug!(removed = removed, "Swept idle rate gate identities");
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
    }
}

fn evict_least_recent(identities: &mut HashMap<String, Calls>) {
    let oldest = identities
        .iter()
        .min_by_key(|(_, calls)| calls.last_seen)
        .map(|(identity, _)| identity.clone());
    if let Some(identity) = oldest {
        identities.remove(&identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> RateGate {
        RateGate::new(RateGateConfig {
            window: Duration::from_millis(60_000),
            limit: 2,
            max_identities: 3,
        })
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_two_calls_per_window_then_denied() {
        let gate = gate();
        let t0 = Instant::now();

        assert!(gate.allow_at("u1", t0));
        assert!(gate.allow_at("u1", t0 + ms(1)));
        assert_eq!(
            gate.check_at("u1", t0 + ms(2)),
            GateDecision::Denied { retry_after: ms(59_998) }
        );

        // Earliest counted call leaves the window exactly W later.
        assert!(gate.allow_at("u1", t0 + ms(60_000)));
        assert!(!gate.allow_at("u1", t0 + ms(60_000)));
    }

    #[test]
    fn test_denied_calls_are_not_counted() {
        let gate = gate();
        let t0 = Instant::now();

        assert!(gate.allow_at("u1", t0));
        assert!(gate.allow_at("u1", t0 + ms(10)));
        for i in 0..5 {
            assert!(!gate.allow_at("u1", t0 + ms(20 + i)));
        }
        assert!(gate.allow_at("u1", t0 + ms(60_000)));
        assert!(gate.allow_at("u1", t0 + ms(60_010)));
    }

    #[test]
    fn test_identities_are_independent() {
        let gate = gate();
        let t0 = Instant::now();

        assert!(gate.allow_at("u1", t0));
        assert!(gate.allow_at("u1", t0));
        assert!(gate.allow_at("u2", t0));
        assert!(!gate.allow_at("u1", t0));
    }

    #[test]
    fn test_sweep_removes_idle_identities() {
        let gate = gate();
        let t0 = Instant::now();
        gate.allow_at("idle", t0);
        gate.allow_at("busy", t0 + ms(30_000));

        assert_eq!(gate.sweep(t0 + ms(60_000)), 1);
        assert_eq!(gate.tracked(), 1);
    }

    #[test]
    fn test_least_recent_identity_is_evicted_at_capacity() {
        let gate = gate();
        let t0 = Instant::now();
        gate.allow_at("a", t0);
        gate.allow_at("a", t0 + ms(1));
        gate.allow_at("b", t0 + ms(2));
        gate.allow_at("c", t0 + ms(3));
        gate.allow_at("b", t0 + ms(4));

        gate.allow_at("d", t0 + ms(5));

        assert_eq!(gate.tracked(), 3);
        // "a" was evicted with its history, so it starts fresh.
        assert!(gate.allow_at("a", t0 + ms(6)));
    }

    #[test]
    fn test_context_without_identity_is_not_gated() {
        let gate = gate();
        assert_eq!(gate.check_context(&AuthContext::default()), None);

        let context = AuthContext {
            id: Some("u1".to_string()),
            ..Default::default()
        };
        assert_eq!(gate.check_context(&context), Some(GateDecision::Allowed));
    }

    #[tokio::test]
    async fn test_sweeper_task_drops_idle_identities_until_shutdown() {
        let gate = Arc::new(RateGate::new(RateGateConfig {
            window: ms(10),
            limit: 2,
            max_identities: 3,
        }));
        gate.allow("u1");

        let (stop, shutdown) = watch::channel(false);
        let sweeper = tokio::spawn(gate.clone().run_sweeper(ms(5), shutdown));

        for _ in 0..100 {
            if gate.tracked() == 0 {
                break;
            }
            tokio::time::sleep(ms(5)).await;
        }
        assert_eq!(gate.tracked(), 0);

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), sweeper).await.unwrap().unwrap();
    }
}
