// ============================================================================
// Replica synchronization
// ============================================================================
//
// - event    decode a delivery into a created record or a status update
// - replica  per-identifier record and its status lattice
// - engine   idempotent apply against the store, orphan expiry sweep
//
// ============================================================================

mod engine;
mod event;
mod replica;

pub use engine::{ApplyEngine, ApplyError, ApplyOutcome, OrphanSweeper};
pub use event::ReplicaEvent;
pub use replica::{ReplicaRecord, StatusOutcome, StatusUpdate};
