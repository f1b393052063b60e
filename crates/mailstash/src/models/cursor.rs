//! Per-account sync cursor
//!
//! Persisted separately from mail data so a crashed or restarted engine
//! resumes from the last durably persisted batch. The sync token is an
//! opaque provider-issued string; it only advances after the batch it
//! describes has been committed to the archive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an account's sync cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Completed,
    Error,
}

impl SyncStatus {
    /// Stable string form used in the `sync_state` table.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Completed => "completed",
            SyncStatus::Error => "error",
        }
    }

    /// Parse the stored string form; unknown values fall back to idle.
    pub fn parse(s: &str) -> Self {
        match s {
            "syncing" => SyncStatus::Syncing,
            "completed" => SyncStatus::Completed,
            "error" => SyncStatus::Error,
            _ => SyncStatus::Idle,
        }
    }
}

/// Sync progress for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub account_id: String,
    /// Opaque provider state; stored and presented unchanged
    pub last_sync_token: Option<String>,
    /// When the cursor last advanced
    pub last_sync_date: Option<DateTime<Utc>>,
    /// Monotone count of emails persisted under successful batches
    pub total_emails_synced: i64,
    pub last_error: Option<String>,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncCursor {
    /// Fresh cursor for an account that has never synced.
    pub fn new(account_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            account_id: account_id.into(),
            last_sync_token: None,
            last_sync_date: None,
            total_emails_synced: 0,
            last_error: None,
            sync_status: SyncStatus::Idle,
            created_at: now,
            updated_at: now,
        }
    }
}
