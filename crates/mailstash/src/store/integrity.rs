//! Archive integrity checks and repair
//!
//! The checks mirror the store's invariants: every email references a
//! known mailbox, provider ids are unique, search rows exist exactly for
//! live emails, and JSON columns hold well-formed arrays.

use rusqlite::params;

use super::emails::map_email_row;
use super::search::write_search_row;
use super::ArchiveStore;
use crate::error::Result;

/// One invariant check with its outcome
#[derive(Debug, Clone, serde::Serialize)]
pub struct IntegrityCheck {
    pub name: String,
    pub passed: bool,
    pub issues: i64,
}

/// One repair step with the number of rows it touched
#[derive(Debug, Clone, serde::Serialize)]
pub struct RepairAction {
    pub name: String,
    pub affected: i64,
}

impl ArchiveStore {
    /// Run every integrity check; one row per check.
    pub fn validate_integrity(&self) -> Result<Vec<IntegrityCheck>> {
        let conn = self.conn.lock().unwrap();
        let mut checks = Vec::new();

        let count = |sql: &str| -> Result<i64> {
            Ok(conn.query_row(sql, [], |row| row.get(0))?)
        };

        let orphan_mailbox = count(
            "SELECT COUNT(*) FROM emails e
             WHERE NOT EXISTS (SELECT 1 FROM mailboxes m WHERE m.remote_id = e.mailbox_id)",
        )?;
        checks.push(check("emails_with_unknown_mailbox", orphan_mailbox));

        let duplicate_remote_ids = count(
            "SELECT COUNT(*) FROM (
                SELECT remote_id FROM emails GROUP BY remote_id HAVING COUNT(*) > 1
             )",
        )?;
        checks.push(check("duplicate_email_remote_ids", duplicate_remote_ids));

        let orphan_search_rows = count(
            "SELECT COUNT(*) FROM email_search s
             WHERE NOT EXISTS (
                SELECT 1 FROM emails e WHERE e.id = s.email_id AND e.is_deleted = 0
             )",
        )?;
        checks.push(check("orphan_search_rows", orphan_search_rows));

        let missing_search_rows = count(
            "SELECT COUNT(*) FROM emails e
             WHERE e.is_deleted = 0
               AND NOT EXISTS (SELECT 1 FROM email_search s WHERE s.email_id = e.id)",
        )?;
        checks.push(check("emails_without_search_row", missing_search_rows));

        // json_type errors out on invalid JSON, so guard it behind
        // json_valid per column.
        let malformed_addresses = count(
            "SELECT COUNT(*) FROM emails WHERE
                (CASE WHEN json_valid(to_addresses)
                      THEN json_type(to_addresses) != 'array' ELSE 1 END)
             OR (CASE WHEN json_valid(cc_addresses)
                      THEN json_type(cc_addresses) != 'array' ELSE 1 END)
             OR (CASE WHEN json_valid(bcc_addresses)
                      THEN json_type(bcc_addresses) != 'array' ELSE 1 END)
             OR (CASE WHEN json_valid(reply_to_addresses)
                      THEN json_type(reply_to_addresses) != 'array' ELSE 1 END)",
        )?;
        checks.push(check("malformed_address_arrays", malformed_addresses));

        Ok(checks)
    }

    /// Repair what can be repaired; one row per action.
    pub fn repair_integrity(&self) -> Result<Vec<RepairAction>> {
        let mut actions = Vec::new();

        // Orphan search rows are simply dropped.
        let deleted_orphans = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "DELETE FROM email_search WHERE email_id NOT IN (
                    SELECT id FROM emails WHERE is_deleted = 0
                )",
                [],
            )? as i64
        };
        actions.push(RepairAction {
            name: "deleted_orphan_search_rows".to_string(),
            affected: deleted_orphans,
        });

        // Missing search rows are rebuilt from current email content.
        let rebuilt = {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;
            let missing = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM emails e
                     WHERE e.is_deleted = 0
                       AND NOT EXISTS (SELECT 1 FROM email_search s WHERE s.email_id = e.id)",
                    super::emails::EMAIL_COLUMNS,
                ))?;
                stmt.query_map([], map_email_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            let rebuilt = missing.len() as i64;
            for email in &missing {
                write_search_row(&tx, email.id, email)?;
            }
            tx.commit()?;
            rebuilt
        };
        actions.push(RepairAction {
            name: "rebuilt_missing_search_rows".to_string(),
            affected: rebuilt,
        });

        // Mailbox counters are recomputed from the live emails.
        let recounted = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE mailboxes SET
                    total_emails = (
                        SELECT COUNT(*) FROM emails
                        WHERE mailbox_id = mailboxes.remote_id AND is_deleted = 0
                    ),
                    unread_emails = (
                        SELECT COUNT(*) FROM emails
                        WHERE mailbox_id = mailboxes.remote_id
                          AND is_deleted = 0 AND is_read = 0
                    ),
                    updated_at = ?",
                params![super::now_str()],
            )? as i64
        };
        actions.push(RepairAction {
            name: "recomputed_mailbox_counters".to_string(),
            affected: recounted,
        });

        Ok(actions)
    }
}

fn check(name: &str, issues: i64) -> IntegrityCheck {
    IntegrityCheck {
        name: name.to_string(),
        passed: issues == 0,
        issues,
    }
}
