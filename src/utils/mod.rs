pub mod circuit_breaker;
pub mod retry;
pub mod supervisor;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use retry::{retry_on_transient, retry_with_backoff, IsTransient, RetryConfig, RetryResult};
pub use supervisor::{shutdown_requested, Supervisor};
