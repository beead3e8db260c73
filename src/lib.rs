// ============================================================================
// replica_sync - event propagation and idempotent replica synchronization
// ============================================================================
//
// Producers publish domain events to durable queues; consumers keep local
// read-model replicas and send notification emails. Delivery is at least
// once, so every apply step is idempotent and tolerates reordering.
//
// ============================================================================

pub mod config;
pub mod dashboard;
pub mod dlq;
pub mod gate;
pub mod health;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod outbox;
pub mod store;
pub mod sync;
pub mod topics;
pub mod utils;
