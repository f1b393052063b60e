//! Sync engine: drives each account to eventual consistency

mod backoff;
mod engine;

pub use engine::{SyncConfig, SyncEngine, TickStats};
