//! Sync cursor persistence
//!
//! The cursor only advances through [`ArchiveStore::advance_cursor`],
//! which the engine calls after the corresponding batch has been
//! committed; `total_emails_synced` is therefore monotone under
//! successful batches.

use rusqlite::{Connection, OptionalExtension, params};

use super::{ArchiveStore, now_str, parse_ts, parse_ts_opt};
use crate::error::Result;
use crate::models::{SyncCursor, SyncStatus};

impl ArchiveStore {
    /// Create the cursor row for an account if it does not exist yet.
    pub fn initialize_cursor(&self, account_id: &str) -> Result<SyncCursor> {
        let conn = self.conn.lock().unwrap();
        let now = now_str();
        conn.execute(
            "INSERT INTO sync_state (account_id, sync_status, created_at, updated_at)
             VALUES (?, 'idle', ?, ?)
             ON CONFLICT(account_id) DO NOTHING",
            params![account_id, now, now],
        )?;
        Ok(load_cursor(&conn, account_id)?.expect("row just written"))
    }

    /// Advance the cursor after a durably persisted batch.
    pub fn advance_cursor(
        &self,
        account_id: &str,
        new_state: &str,
        emails_added: usize,
        status: SyncStatus,
    ) -> Result<SyncCursor> {
        let conn = self.conn.lock().unwrap();
        let now = now_str();
        conn.execute(
            "UPDATE sync_state SET
                last_sync_token = ?,
                last_sync_date = ?,
                total_emails_synced = total_emails_synced + ?,
                sync_status = ?,
                last_error = NULL,
                updated_at = ?
             WHERE account_id = ?",
            params![
                new_state,
                now,
                emails_added as i64,
                status.as_str(),
                now,
                account_id
            ],
        )?;
        Ok(load_cursor(&conn, account_id)?.expect("cursor must exist to advance"))
    }

    /// Record a tick failure; the token and totals stay untouched.
    pub fn record_error(&self, account_id: &str, message: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_state SET sync_status = 'error', last_error = ?, updated_at = ?
             WHERE account_id = ?",
            params![message, now_str(), account_id],
        )?;
        Ok(())
    }

    /// Move the cursor through the tick lifecycle without advancing it.
    pub fn set_cursor_status(&self, account_id: &str, status: SyncStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_state SET sync_status = ?, updated_at = ? WHERE account_id = ?",
            params![status.as_str(), now_str(), account_id],
        )?;
        Ok(())
    }

    /// Clear (or pin) the cursor for a full re-pull.
    pub fn reset_cursor(&self, account_id: &str, new_state: Option<&str>) -> Result<SyncCursor> {
        let conn = self.conn.lock().unwrap();
        let now = now_str();
        conn.execute(
            "INSERT INTO sync_state (account_id, last_sync_token, sync_status, created_at, updated_at)
             VALUES (?, ?, 'idle', ?, ?)
             ON CONFLICT(account_id) DO UPDATE SET
                last_sync_token = excluded.last_sync_token,
                last_sync_date = NULL,
                total_emails_synced = 0,
                last_error = NULL,
                sync_status = 'idle',
                updated_at = excluded.updated_at",
            params![account_id, new_state, now, now],
        )?;
        Ok(load_cursor(&conn, account_id)?.expect("row just written"))
    }

    /// Cursor for one account.
    pub fn get_cursor(&self, account_id: &str) -> Result<Option<SyncCursor>> {
        let conn = self.conn.lock().unwrap();
        load_cursor(&conn, account_id)
    }

    /// Every cursor the store knows about.
    pub fn list_cursors(&self) -> Result<Vec<SyncCursor>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT account_id, last_sync_token, last_sync_date, total_emails_synced,
                    last_error, sync_status, created_at, updated_at
             FROM sync_state ORDER BY account_id",
        )?;
        let cursors = stmt
            .query_map([], map_cursor_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(cursors)
    }
}

fn load_cursor(conn: &Connection, account_id: &str) -> Result<Option<SyncCursor>> {
    let cursor = conn
        .query_row(
            "SELECT account_id, last_sync_token, last_sync_date, total_emails_synced,
                    last_error, sync_status, created_at, updated_at
             FROM sync_state WHERE account_id = ?",
            [account_id],
            map_cursor_row,
        )
        .optional()?;
    Ok(cursor)
}

fn map_cursor_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncCursor> {
    Ok(SyncCursor {
        account_id: row.get(0)?,
        last_sync_token: row.get(1)?,
        last_sync_date: parse_ts_opt(row.get(2)?),
        total_emails_synced: row.get(3)?,
        last_error: row.get(4)?,
        sync_status: SyncStatus::parse(&row.get::<_, String>(5)?),
        created_at: parse_ts(&row.get::<_, String>(6)?),
        updated_at: parse_ts(&row.get::<_, String>(7)?),
    })
}
