use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Gates broker publishes on broker health. After `failure_threshold`
// consecutive failures the circuit opens and calls fail fast with
// `CircuitOpen` until `timeout` has passed; then one probe window
// (HalfOpen) decides whether to close again.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Value exported on the `circuit_breaker_state` gauge.
    pub fn as_gauge(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening circuit
    pub failure_threshold: u32,
    /// Time to wait before attempting recovery
    pub timeout: Duration,
    /// Number of successes needed to close circuit from half-open
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<BreakerState>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            })),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(CircuitBreakerError::CircuitOpen);
        }

        match operation.await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        if state.state != CircuitState::Open {
            return true;
        }
        match state.last_failure_time {
            Some(last_failure) if last_failure.elapsed() >= self.config.timeout => {
                tracing::info!("Circuit breaker transitioning to HalfOpen");
                state.state = CircuitState::HalfOpen;
                state.success_count = 0;
                true
            }
            _ => false,
        }
    }

    fn record_success(&self) {
        let mut state = self.lock();
        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    tracing::info!(successes = state.success_count, "Circuit breaker closing");
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.last_failure_time = None;
                }
            }
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::Open => tracing::warn!("Success recorded while circuit is open"),
        }
    }

    fn record_failure(&self) {
        let mut state = self.lock();
        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());

        match state.state {
            CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                tracing::warn!(failures = state.failure_count, "Circuit breaker opening");
                state.state = CircuitState::Open;
            }
            CircuitState::HalfOpen => {
                tracing::warn!("Failure during half-open, reopening circuit");
                state.state = CircuitState::Open;
                state.success_count = 0;
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Manually reset the circuit breaker
    pub fn reset(&self) {
        let mut state = self.lock();
        tracing::info!("Circuit breaker manually reset");
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.last_failure_time = None;
    }
}

#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    CircuitOpen,
    OperationFailed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "Circuit breaker is open"),
            CircuitBreakerError::OperationFailed(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error> std::error::Error for CircuitBreakerError<E> {}
