//! Mailstash engine - JMAP mailbox archiving
//!
//! This crate provides platform-independent archiving functionality:
//! - Domain models (Mailbox, Email, Thread, SyncCursor, OauthToken)
//! - JMAP client behind the [`RemoteMailbox`] seam
//! - Encrypted OAuth token store
//! - SQLite archive store with an FTS5 search index
//! - The per-account sync engine with retry/backoff and a ticker
//!
//! The crate has no HTTP-server or UI dependencies; the webhook listener
//! and process wiring live in the server binary.

pub mod config;
pub mod error;
pub mod jmap;
pub mod models;
pub mod store;
pub mod sync;
pub mod tokens;

pub use config::{Credentials, EngineConfig};
pub use error::{EngineError, Result};
pub use jmap::{EmailPage, EmailQuery, JmapClient, RemoteMailbox, Session, ThreadPage, ThreadQuery};
pub use models::{
    Attachment, Email, EmailAddress, Mailbox, OauthToken, SyncCursor, SyncStatus, Thread,
};
pub use store::{
    ArchiveStats, ArchiveStore, BatchUpsertReport, EmailSort, HealthReport, HealthStatus,
    IntegrityCheck, RepairAction, SearchFilters, SearchHit, SearchSort,
};
pub use sync::{SyncConfig, SyncEngine, TickStats};
pub use tokens::{RefreshEndpoint, TokenCipher, TokenStore};
