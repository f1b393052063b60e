//! Email persistence
//!
//! All writes go through the natural-key upsert; the search row and the
//! derived thread row are rewritten in the same transaction, so a crash
//! at any point leaves the three in agreement.

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::search::write_search_row;
use super::threads::refresh_thread;
use super::{ArchiveStore, now_str, parse_ts, parse_ts_opt};
use crate::error::{EngineError, Result};
use crate::models::Email;

/// zstd level for body compression: good balance of speed vs ratio.
const BODY_COMPRESSION_LEVEL: i32 = 3;

/// Sort orders for mailbox listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailSort {
    ReceivedDesc,
    ReceivedAsc,
    SizeDesc,
    SizeAsc,
}

impl EmailSort {
    fn order_clause(&self) -> &'static str {
        match self {
            EmailSort::ReceivedDesc => "date_received DESC",
            EmailSort::ReceivedAsc => "date_received ASC",
            EmailSort::SizeDesc => "size_bytes DESC",
            EmailSort::SizeAsc => "size_bytes ASC",
        }
    }
}

/// One item that could not be written during a batch upsert
#[derive(Debug)]
pub struct BatchFailure {
    pub remote_id: String,
    pub error: String,
}

/// Outcome of a batch upsert: every written row, plus per-item failures
#[derive(Debug, Default)]
pub struct BatchUpsertReport {
    pub written: Vec<Email>,
    pub failed: Vec<BatchFailure>,
}

impl ArchiveStore {
    /// Insert or update an email under its provider id.
    ///
    /// The search row is recomputed and the thread row refreshed in the
    /// same transaction. Returns the canonical post-write row.
    pub fn upsert_email(&self, email: &Email) -> Result<Email> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        write_email(&tx, email)?;
        let written = load_email(&tx, &email.remote_id)?.expect("row just written");
        tx.commit()?;
        Ok(written)
    }

    /// Upsert a batch of emails, tolerating per-item failures.
    ///
    /// Each item runs inside its own savepoint: a bad item rolls back
    /// alone and is reported; unrelated items still commit.
    pub fn upsert_emails(&self, emails: &[Email]) -> Result<BatchUpsertReport> {
        let mut conn = self.conn.lock().unwrap();
        let mut tx = conn.transaction()?;
        let mut report = BatchUpsertReport::default();

        for email in emails {
            let mut savepoint = tx.savepoint()?;
            savepoint.set_drop_behavior(rusqlite::DropBehavior::Rollback);
            match write_email(&savepoint, email)
                .and_then(|_| load_email(&savepoint, &email.remote_id))
            {
                Ok(Some(written)) => {
                    savepoint.commit()?;
                    report.written.push(written);
                }
                Ok(None) => {
                    report.failed.push(BatchFailure {
                        remote_id: email.remote_id.clone(),
                        error: "row vanished during upsert".to_string(),
                    });
                }
                Err(e) => {
                    report.failed.push(BatchFailure {
                        remote_id: email.remote_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        tx.commit()?;
        Ok(report)
    }

    /// Soft-delete an email and drop its search row.
    ///
    /// Returns false when no row with that provider id exists.
    pub fn tombstone_email(&self, remote_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let row: Option<(i64, Option<String>)> = tx
            .query_row(
                "SELECT id, thread_id FROM emails WHERE remote_id = ?",
                [remote_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((id, thread_id)) = row else {
            return Ok(false);
        };

        tx.execute(
            "UPDATE emails SET is_deleted = 1, updated_at = ? WHERE id = ?",
            params![now_str(), id],
        )?;
        tx.execute("DELETE FROM email_search WHERE email_id = ?", [id])?;

        if let Some(thread_id) = thread_id {
            refresh_thread(&tx, &thread_id)?;
        }

        tx.commit()?;
        Ok(true)
    }

    /// Retention job: hard-delete tombstoned emails last touched before
    /// the cutoff. The only hard-delete path in the engine.
    pub fn purge_deleted(&self, older_than: chrono::DateTime<chrono::Utc>) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let cutoff = older_than.to_rfc3339();
        let mut stmt = tx.prepare(
            "SELECT id, thread_id FROM emails WHERE is_deleted = 1 AND updated_at < ?",
        )?;
        let doomed: Vec<(i64, Option<String>)> = stmt
            .query_map([&cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        for (id, _) in &doomed {
            tx.execute("DELETE FROM email_search WHERE email_id = ?", [id])?;
            tx.execute("DELETE FROM emails WHERE id = ?", [id])?;
        }

        let purged = doomed.len();
        let mut threads: Vec<String> = doomed.into_iter().filter_map(|(_, t)| t).collect();
        threads.sort();
        threads.dedup();
        for thread_id in threads {
            refresh_thread(&tx, &thread_id)?;
        }

        tx.commit()?;
        Ok(purged)
    }

    /// Look up an email by its provider id.
    pub fn get_email_by_remote_id(&self, remote_id: &str) -> Result<Option<Email>> {
        let conn = self.conn.lock().unwrap();
        load_email(&conn, remote_id)
    }

    /// Non-deleted emails in a mailbox, paginated.
    pub fn get_emails_in_mailbox(
        &self,
        mailbox_id: &str,
        sort: EmailSort,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Email>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM emails
             WHERE mailbox_id = ? AND is_deleted = 0
             ORDER BY {}
             LIMIT ? OFFSET ?",
            EMAIL_COLUMNS,
            sort.order_clause(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let emails = stmt
            .query_map(
                params![mailbox_id, limit as i64, offset as i64],
                map_email_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(emails)
    }

    /// Most recently received non-deleted emails.
    pub fn recent_emails(&self, limit: usize) -> Result<Vec<Email>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM emails
             WHERE is_deleted = 0
             ORDER BY date_received DESC
             LIMIT ?",
            EMAIL_COLUMNS,
        );
        let mut stmt = conn.prepare(&sql)?;
        let emails = stmt
            .query_map([limit as i64], map_email_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(emails)
    }
}

pub(crate) const EMAIL_COLUMNS: &str = "id, remote_id, thread_id, mailbox_id, subject, from_address,
    to_addresses, cc_addresses, bcc_addresses, reply_to_addresses,
    date_received, date_sent, message_id, in_reply_to, header_references,
    body_text, body_html, attachments, flags, size_bytes,
    is_deleted, created_at, updated_at";

/// Upsert one email row plus its derived search and thread rows.
///
/// Runs inside the caller's transaction or savepoint.
pub(crate) fn write_email(conn: &Connection, email: &Email) -> Result<()> {
    let body_text_compressed = compress(email.body_text.as_deref())?;
    let body_html_compressed = compress(email.body_html.as_deref())?;
    let now = now_str();

    conn.execute(
        "INSERT INTO emails
         (remote_id, thread_id, mailbox_id, subject, from_address,
          to_addresses, cc_addresses, bcc_addresses, reply_to_addresses,
          date_received, date_sent, message_id, in_reply_to, header_references,
          body_text, body_html, attachments, flags, size_bytes,
          is_read, is_flagged, is_deleted, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(remote_id) DO UPDATE SET
            thread_id = excluded.thread_id,
            mailbox_id = excluded.mailbox_id,
            subject = excluded.subject,
            from_address = excluded.from_address,
            to_addresses = excluded.to_addresses,
            cc_addresses = excluded.cc_addresses,
            bcc_addresses = excluded.bcc_addresses,
            reply_to_addresses = excluded.reply_to_addresses,
            date_received = excluded.date_received,
            date_sent = excluded.date_sent,
            message_id = excluded.message_id,
            in_reply_to = excluded.in_reply_to,
            header_references = excluded.header_references,
            body_text = excluded.body_text,
            body_html = excluded.body_html,
            attachments = excluded.attachments,
            flags = excluded.flags,
            size_bytes = excluded.size_bytes,
            is_read = excluded.is_read,
            is_flagged = excluded.is_flagged,
            is_deleted = excluded.is_deleted,
            updated_at = excluded.updated_at",
        params![
            email.remote_id,
            email.thread_id,
            email.mailbox_id,
            email.subject,
            email.from_address.as_ref().map(|a| a.display()),
            to_json(&email.to_addresses)?,
            to_json(&email.cc_addresses)?,
            to_json(&email.bcc_addresses)?,
            to_json(&email.reply_to_addresses)?,
            email.date_received.map(|dt| dt.to_rfc3339()),
            email.date_sent.map(|dt| dt.to_rfc3339()),
            email.message_id,
            email.in_reply_to,
            to_json(&email.references)?,
            body_text_compressed,
            body_html_compressed,
            to_json(&email.attachments)?,
            to_json(&email.flags)?,
            email.size_bytes as i64,
            email.is_read(),
            email.is_flagged(),
            email.is_deleted,
            now,
            now,
        ],
    )?;

    let id: i64 = conn.query_row(
        "SELECT id FROM emails WHERE remote_id = ?",
        [&email.remote_id],
        |row| row.get(0),
    )?;

    // Search row follows the email row in the same transaction.
    conn.execute("DELETE FROM email_search WHERE email_id = ?", [id])?;
    if !email.is_deleted {
        write_search_row(conn, id, email)?;
    }

    if let Some(thread_id) = &email.thread_id {
        refresh_thread(conn, thread_id)?;
    }

    Ok(())
}

pub(crate) fn load_email(conn: &Connection, remote_id: &str) -> Result<Option<Email>> {
    let sql = format!("SELECT {} FROM emails WHERE remote_id = ?", EMAIL_COLUMNS);
    let email = conn
        .query_row(&sql, [remote_id], map_email_row)
        .optional()?;
    Ok(email)
}

pub(crate) fn map_email_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Email> {
    Ok(Email {
        id: row.get(0)?,
        remote_id: row.get(1)?,
        thread_id: row.get(2)?,
        mailbox_id: row.get(3)?,
        subject: row.get(4)?,
        from_address: row
            .get::<_, Option<String>>(5)?
            .map(|s| crate::models::EmailAddress::parse(&s)),
        to_addresses: from_json(row.get::<_, String>(6)?),
        cc_addresses: from_json(row.get::<_, String>(7)?),
        bcc_addresses: from_json(row.get::<_, String>(8)?),
        reply_to_addresses: from_json(row.get::<_, String>(9)?),
        date_received: parse_ts_opt(row.get(10)?),
        date_sent: parse_ts_opt(row.get(11)?),
        message_id: row.get(12)?,
        in_reply_to: row.get(13)?,
        references: from_json(row.get::<_, String>(14)?),
        body_text: decompress(row.get::<_, Option<Vec<u8>>>(15)?),
        body_html: decompress(row.get::<_, Option<Vec<u8>>>(16)?),
        attachments: from_json(row.get::<_, String>(17)?),
        flags: from_json(row.get::<_, String>(18)?),
        size_bytes: row.get::<_, i64>(19)? as u64,
        is_deleted: row.get(20)?,
        created_at: parse_ts(&row.get::<_, String>(21)?),
        updated_at: parse_ts(&row.get::<_, String>(22)?),
    })
}

fn compress(text: Option<&str>) -> Result<Option<Vec<u8>>> {
    text.map(|t| {
        zstd::encode_all(t.as_bytes(), BODY_COMPRESSION_LEVEL)
            .map_err(|e| EngineError::StoreUnavailable(format!("body compression failed: {}", e)))
    })
    .transpose()
}

/// Damaged compressed bodies read back as None rather than failing the
/// whole row.
fn decompress(data: Option<Vec<u8>>) -> Option<String> {
    data.and_then(|bytes| {
        zstd::decode_all(bytes.as_slice())
            .ok()
            .map(|decoded| String::from_utf8_lossy(&decoded).into_owned())
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| EngineError::IntegrityViolation(format!("unserializable column: {}", e)))
}

/// Malformed JSON columns decode to the empty value; the integrity
/// checks surface them for repair.
fn from_json<T: DeserializeOwned + Default>(raw: String) -> T {
    serde_json::from_str(&raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::models::{Attachment, EmailAddress, KEYWORD_SEEN};

    fn make_email(remote_id: &str, subject: &str) -> Email {
        let mut email = Email::new(remote_id, "mb1");
        email.thread_id = Some("t1".to_string());
        email.subject = Some(subject.to_string());
        email.from_address = Some(EmailAddress::with_name("Alice", "alice@example.com"));
        email.to_addresses = vec![EmailAddress::new("bob@example.com")];
        email.body_text = Some(format!("body of {}", remote_id));
        email.date_received = Some(Utc::now());
        email.size_bytes = 512;
        email
    }

    #[test]
    fn test_upsert_roundtrip() {
        let store = ArchiveStore::in_memory().unwrap();
        let written = store.upsert_email(&make_email("e1", "Hello")).unwrap();

        assert!(written.id > 0);
        assert_eq!(written.subject.as_deref(), Some("Hello"));
        assert_eq!(written.body_text.as_deref(), Some("body of e1"));
        assert_eq!(written.from_address.as_ref().unwrap().email, "alice@example.com");

        let loaded = store.get_email_by_remote_id("e1").unwrap().unwrap();
        assert_eq!(loaded.id, written.id);
        assert_eq!(loaded.to_addresses, written.to_addresses);
    }

    #[test]
    fn test_double_upsert_is_idempotent() {
        let store = ArchiveStore::in_memory().unwrap();
        let email = make_email("e1", "Hello");

        let first = store.upsert_email(&email).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.upsert_email(&email).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.subject, second.subject);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at > first.updated_at);

        let conn = store.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM emails", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_batch_upsert_tolerates_duplicates() {
        let store = ArchiveStore::in_memory().unwrap();
        store.upsert_email(&make_email("e1", "old")).unwrap();

        let batch = vec![
            make_email("e1", "new"),
            make_email("e2", "two"),
            make_email("e3", "three"),
        ];
        let report = store.upsert_emails(&batch).unwrap();

        assert_eq!(report.written.len(), 3);
        assert!(report.failed.is_empty());
        assert_eq!(
            store
                .get_email_by_remote_id("e1")
                .unwrap()
                .unwrap()
                .subject
                .as_deref(),
            Some("new")
        );
    }

    #[test]
    fn test_tombstone() {
        let store = ArchiveStore::in_memory().unwrap();
        store.upsert_email(&make_email("e1", "Hello")).unwrap();

        assert!(store.tombstone_email("e1").unwrap());
        assert!(!store.tombstone_email("missing").unwrap());

        let email = store.get_email_by_remote_id("e1").unwrap().unwrap();
        assert!(email.is_deleted);

        let conn = store.conn.lock().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM email_search", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_purge_deleted() {
        let store = ArchiveStore::in_memory().unwrap();
        store.upsert_email(&make_email("e1", "keep")).unwrap();
        store.upsert_email(&make_email("e2", "purge")).unwrap();
        store.tombstone_email("e2").unwrap();

        // Cutoff in the future covers the fresh tombstone.
        let purged = store.purge_deleted(Utc::now() + Duration::minutes(1)).unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_email_by_remote_id("e2").unwrap().is_none());
        assert!(store.get_email_by_remote_id("e1").unwrap().is_some());
    }

    #[test]
    fn test_mailbox_listing_and_recent() {
        let store = ArchiveStore::in_memory().unwrap();
        for (i, id) in ["e1", "e2", "e3"].iter().enumerate() {
            let mut email = make_email(id, id);
            email.date_received = Some(Utc::now() - Duration::hours(i as i64));
            store.upsert_email(&email).unwrap();
        }
        store.tombstone_email("e2").unwrap();

        let in_mailbox = store
            .get_emails_in_mailbox("mb1", EmailSort::ReceivedDesc, 10, 0)
            .unwrap();
        assert_eq!(in_mailbox.len(), 2);
        assert_eq!(in_mailbox[0].remote_id, "e1");

        let recent = store.recent_emails(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].remote_id, "e1");
    }

    #[test]
    fn test_flags_and_attachments_roundtrip() {
        let store = ArchiveStore::in_memory().unwrap();
        let mut email = make_email("e1", "Hello");
        email.flags.insert(KEYWORD_SEEN.to_string(), true);
        email.attachments.push(Attachment {
            id: "p1".to_string(),
            blob_id: "b1".to_string(),
            name: Some("a.txt".to_string()),
            mime_type: "text/plain".to_string(),
            size: 10,
            content_id: None,
            inline: false,
        });

        let written = store.upsert_email(&email).unwrap();
        assert!(written.is_read());
        assert_eq!(written.attachments.len(), 1);

        let conn = store.conn.lock().unwrap();
        let is_read: bool = conn
            .query_row("SELECT is_read FROM emails WHERE remote_id = 'e1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert!(is_read);
    }
}
