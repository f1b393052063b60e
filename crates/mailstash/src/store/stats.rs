//! Archive statistics and health
//!
//! The totals are three independent aggregates on purpose; a joined
//! query over-counts whenever an email is both unread and flagged.

use chrono::{Duration, Utc};
use serde::Serialize;

use super::ArchiveStore;
use crate::error::Result;
use crate::models::SyncStatus;

/// How long a non-erroring cursor may sit without advancing before
/// health degrades to WARNING.
const STALE_AFTER_HOURS: i64 = 24;

/// Per-mailbox email count
#[derive(Debug, Clone, Serialize)]
pub struct MailboxCount {
    pub mailbox_id: String,
    pub name: Option<String>,
    pub count: i64,
}

/// Emails received in one calendar month
#[derive(Debug, Clone, Serialize)]
pub struct MonthCount {
    /// `YYYY-MM`
    pub month: String,
    pub count: i64,
}

/// Archive-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveStats {
    pub total_emails: i64,
    pub unread_emails: i64,
    pub flagged_emails: i64,
    pub per_mailbox: Vec<MailboxCount>,
    pub per_month: Vec<MonthCount>,
}

/// Overall archive health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
}

/// Health summary across every account cursor
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub total_accounts: i64,
    pub error_accounts: i64,
    pub stale_accounts: i64,
    pub total_emails: i64,
    /// Hours since the most recent cursor advance, if any cursor ever
    /// advanced
    pub last_sync_age_hours: Option<f64>,
}

impl ArchiveStore {
    /// Archive-wide statistics over non-deleted emails.
    pub fn stats(&self) -> Result<ArchiveStats> {
        let conn = self.conn.lock().unwrap();

        let count = |sql: &str| -> Result<i64> {
            Ok(conn.query_row(sql, [], |row| row.get(0))?)
        };

        let total_emails = count("SELECT COUNT(*) FROM emails WHERE is_deleted = 0")?;
        let unread_emails =
            count("SELECT COUNT(*) FROM emails WHERE is_deleted = 0 AND is_read = 0")?;
        let flagged_emails =
            count("SELECT COUNT(*) FROM emails WHERE is_deleted = 0 AND is_flagged = 1")?;

        let mut stmt = conn.prepare(
            "SELECT e.mailbox_id, m.name, COUNT(*)
             FROM emails e
             LEFT JOIN mailboxes m ON m.remote_id = e.mailbox_id
             WHERE e.is_deleted = 0
             GROUP BY e.mailbox_id
             ORDER BY COUNT(*) DESC",
        )?;
        let per_mailbox = stmt
            .query_map([], |row| {
                Ok(MailboxCount {
                    mailbox_id: row.get(0)?,
                    name: row.get(1)?,
                    count: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT strftime('%Y-%m', date_received), COUNT(*)
             FROM emails
             WHERE is_deleted = 0 AND date_received IS NOT NULL
             GROUP BY 1
             ORDER BY 1",
        )?;
        let per_month = stmt
            .query_map([], |row| {
                Ok(MonthCount {
                    month: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ArchiveStats {
            total_emails,
            unread_emails,
            flagged_emails,
            per_mailbox,
            per_month,
        })
    }

    /// Health across every account cursor.
    ///
    /// ERROR if any cursor is in `error`; WARNING if any cursor is
    /// `syncing` or `completed` but has not advanced in 24 hours;
    /// HEALTHY otherwise.
    pub fn health(&self) -> Result<HealthReport> {
        let cursors = self.list_cursors()?;
        let stale_cutoff = Utc::now() - Duration::hours(STALE_AFTER_HOURS);

        let error_accounts = cursors
            .iter()
            .filter(|c| c.sync_status == SyncStatus::Error)
            .count() as i64;

        let stale_accounts = cursors
            .iter()
            .filter(|c| {
                matches!(c.sync_status, SyncStatus::Syncing | SyncStatus::Completed)
                    && c.last_sync_date.unwrap_or(c.created_at) < stale_cutoff
            })
            .count() as i64;

        let status = if error_accounts > 0 {
            HealthStatus::Error
        } else if stale_accounts > 0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        let last_sync_age_hours = cursors
            .iter()
            .filter_map(|c| c.last_sync_date)
            .max()
            .map(|most_recent| {
                (Utc::now() - most_recent).num_milliseconds() as f64 / 3_600_000.0
            });

        let total_emails = {
            let conn = self.conn.lock().unwrap();
            conn.query_row("SELECT COUNT(*) FROM emails WHERE is_deleted = 0", [], |r| {
                r.get(0)
            })?
        };

        Ok(HealthReport {
            status,
            total_accounts: cursors.len() as i64,
            error_accounts,
            stale_accounts,
            total_emails,
            last_sync_age_hours,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Email, KEYWORD_FLAGGED, KEYWORD_SEEN, Mailbox, SyncStatus};

    #[test]
    fn test_stats_independent_aggregates() {
        let store = ArchiveStore::in_memory().unwrap();
        store.upsert_mailbox(&Mailbox::new("mb1", "Inbox")).unwrap();

        // One email that is both unread and flagged must count once in
        // each aggregate.
        let mut email = Email::new("e1", "mb1");
        email.flags.insert(KEYWORD_FLAGGED.to_string(), true);
        email.date_received = Some(Utc::now());
        store.upsert_email(&email).unwrap();

        let mut read = Email::new("e2", "mb1");
        read.flags.insert(KEYWORD_SEEN.to_string(), true);
        read.date_received = Some(Utc::now());
        store.upsert_email(&read).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_emails, 2);
        assert_eq!(stats.unread_emails, 1);
        assert_eq!(stats.flagged_emails, 1);
        assert_eq!(stats.per_mailbox.len(), 1);
        assert_eq!(stats.per_mailbox[0].count, 2);
        assert_eq!(stats.per_month.len(), 1);
    }

    #[test]
    fn test_health_transitions() {
        let store = ArchiveStore::in_memory().unwrap();
        assert_eq!(store.health().unwrap().status, HealthStatus::Healthy);

        store.initialize_cursor("acc1").unwrap();
        store
            .advance_cursor("acc1", "s1", 1, SyncStatus::Completed)
            .unwrap();
        assert_eq!(store.health().unwrap().status, HealthStatus::Healthy);

        store.record_error("acc1", "boom").unwrap();
        let report = store.health().unwrap();
        assert_eq!(report.status, HealthStatus::Error);
        assert_eq!(report.error_accounts, 1);
    }

    #[test]
    fn test_health_stale_warning() {
        let store = ArchiveStore::in_memory().unwrap();
        store.initialize_cursor("acc1").unwrap();
        store
            .advance_cursor("acc1", "s1", 1, SyncStatus::Completed)
            .unwrap();

        // Backdate the advance beyond the staleness window.
        {
            let conn = store.conn.lock().unwrap();
            let old = (Utc::now() - Duration::hours(30)).to_rfc3339();
            conn.execute(
                "UPDATE sync_state SET last_sync_date = ?",
                rusqlite::params![old],
            )
            .unwrap();
        }

        let report = store.health().unwrap();
        assert_eq!(report.status, HealthStatus::Warning);
        assert_eq!(report.stale_accounts, 1);
        assert!(report.last_sync_age_hours.unwrap() > 24.0);
    }
}
