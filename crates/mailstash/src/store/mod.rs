//! SQLite-backed archive store
//!
//! The only writer and the authoritative reader of archived state. All
//! mutations are natural-key upserts; the FTS5 search index is maintained
//! inside the same transaction as the email row it derives from.

mod cursors;
mod emails;
mod integrity;
mod mailboxes;
mod search;
mod stats;
mod threads;
mod tokens;

pub use emails::{BatchFailure, BatchUpsertReport, EmailSort};
pub use integrity::{IntegrityCheck, RepairAction};
pub use search::{SearchFilters, SearchHit, SearchSort};
pub use stats::{ArchiveStats, HealthReport, HealthStatus, MailboxCount, MonthCount};
pub use tokens::TokenRow;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rusqlite_migration::{M, Migrations};

use crate::error::{EngineError, Result};

/// Database migrations
///
/// Applied in order; the user_version pragma tracks progress.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        r#"
        -- Mailboxes, keyed on the provider id
        CREATE TABLE mailboxes (
            id INTEGER PRIMARY KEY,
            remote_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            parent_remote_id TEXT,
            role TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            total_emails INTEGER NOT NULL DEFAULT 0,
            unread_emails INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Archived emails; bodies are zstd-compressed, lists are JSON
        CREATE TABLE emails (
            id INTEGER PRIMARY KEY,
            remote_id TEXT NOT NULL UNIQUE,
            thread_id TEXT,
            mailbox_id TEXT NOT NULL,
            subject TEXT,
            from_address TEXT,
            to_addresses TEXT NOT NULL DEFAULT '[]',
            cc_addresses TEXT NOT NULL DEFAULT '[]',
            bcc_addresses TEXT NOT NULL DEFAULT '[]',
            reply_to_addresses TEXT NOT NULL DEFAULT '[]',
            date_received TEXT,
            date_sent TEXT,
            message_id TEXT,
            in_reply_to TEXT,
            header_references TEXT NOT NULL DEFAULT '[]',
            body_text BLOB,
            body_html BLOB,
            attachments TEXT NOT NULL DEFAULT '[]',
            flags TEXT NOT NULL DEFAULT '{}',
            size_bytes INTEGER NOT NULL DEFAULT 0,
            is_read INTEGER NOT NULL DEFAULT 0,
            is_flagged INTEGER NOT NULL DEFAULT 0,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX idx_emails_mailbox_received
            ON emails(mailbox_id, date_received DESC);
        CREATE INDEX idx_emails_read_received
            ON emails(is_read, date_received DESC);
        CREATE INDEX idx_emails_thread ON emails(thread_id);

        -- Threads, derived from the archived emails that reference them
        CREATE TABLE email_threads (
            id TEXT PRIMARY KEY,
            email_remote_ids TEXT NOT NULL DEFAULT '[]',
            subject TEXT,
            mailbox_membership TEXT NOT NULL DEFAULT '{}',
            message_count INTEGER NOT NULL DEFAULT 0,
            unread_count INTEGER NOT NULL DEFAULT 0,
            last_message_date TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Search index; one row per live email, rewritten on upsert
        CREATE VIRTUAL TABLE email_search USING fts5(
            subject,
            from_address,
            body,
            email_id UNINDEXED,
            content_hash UNINDEXED
        );

        -- Per-account sync cursor
        CREATE TABLE sync_state (
            account_id TEXT PRIMARY KEY,
            last_sync_token TEXT,
            last_sync_date TEXT,
            total_emails_synced INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            sync_status TEXT NOT NULL DEFAULT 'idle',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Encrypted OAuth credentials; plaintext never reaches this table
        CREATE TABLE oauth_tokens (
            account_id TEXT PRIMARY KEY,
            access_token TEXT NOT NULL,
            refresh_token TEXT,
            token_type TEXT NOT NULL DEFAULT 'Bearer',
            expires_at TEXT,
            scope TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )])
}

/// The archive store
///
/// Wraps a single SQLite connection; WAL mode keeps readers concurrent
/// with the engine's writes.
pub struct ArchiveStore {
    pub(crate) conn: Mutex<Connection>,
}

impl ArchiveStore {
    /// Open (or create) the archive at the given path.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(|e| {
            EngineError::StoreUnavailable(format!(
                "failed to open archive at {:?}: {}",
                db_path.as_ref(),
                e
            ))
        })?;
        Self::from_connection(conn)
    }

    /// Open an archive from a `STORE_URL` value: a plain path, or a
    /// `sqlite:`/`sqlite://` URL.
    pub fn open_url(url: &str) -> Result<Self> {
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        Self::open(path)
    }

    /// In-memory archive for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL for concurrent readers during sync writes; NORMAL sync is
        // safe under WAL; the rest trades memory for fewer syscalls.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .map_err(|e| EngineError::StoreUnavailable(format!("migration failed: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Current time in the stored RFC 3339 form.
pub(crate) fn now_str() -> String {
    Utc::now().to_rfc3339()
}

/// Parse a stored RFC 3339 timestamp, falling back to now on damage.
pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Parse an optional stored timestamp.
pub(crate) fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_ts(&s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_validity() {
        migrations().validate().unwrap();
    }

    #[test]
    fn test_open_in_memory() {
        let store = ArchiveStore::in_memory().unwrap();
        let conn = store.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM emails", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_open_url_strips_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.db");
        let url = format!("sqlite://{}", path.display());
        ArchiveStore::open_url(&url).unwrap();
        assert!(path.exists());
    }
}
