//! Thread persistence
//!
//! Thread rows are derived: whenever a member email is written or
//! tombstoned, the thread is recomputed from the live emails that
//! reference it, keeping `message_count` equal to the member list.

use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension, params};

use super::{ArchiveStore, now_str, parse_ts_opt};
use crate::error::{EngineError, Result};
use crate::models::Thread;

impl ArchiveStore {
    /// Insert or update a thread row directly.
    ///
    /// The sync path derives threads from emails; this direct form
    /// exists for provider-sourced thread records.
    pub fn upsert_thread(&self, thread: &Thread) -> Result<Thread> {
        let conn = self.conn.lock().unwrap();
        write_thread(&conn, thread)?;
        Ok(load_thread(&conn, &thread.id)?.expect("row just written"))
    }

    /// Look up a thread by its provider id.
    pub fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        let conn = self.conn.lock().unwrap();
        load_thread(&conn, thread_id)
    }
}

/// Recompute a thread row from its live member emails.
///
/// Runs inside the caller's transaction. A thread with no live members
/// is removed.
pub(crate) fn refresh_thread(conn: &Connection, thread_id: &str) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT remote_id, subject, mailbox_id, is_read, date_received
         FROM emails
         WHERE thread_id = ? AND is_deleted = 0
         ORDER BY date_received ASC, remote_id ASC",
    )?;

    struct Member {
        remote_id: String,
        subject: Option<String>,
        mailbox_id: String,
        is_read: bool,
        date_received: Option<String>,
    }

    let members: Vec<Member> = stmt
        .query_map([thread_id], |row| {
            Ok(Member {
                remote_id: row.get(0)?,
                subject: row.get(1)?,
                mailbox_id: row.get(2)?,
                is_read: row.get(3)?,
                date_received: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);

    if members.is_empty() {
        conn.execute("DELETE FROM email_threads WHERE id = ?", [thread_id])?;
        return Ok(());
    }

    let email_remote_ids: Vec<&str> = members.iter().map(|m| m.remote_id.as_str()).collect();
    let subject = members.iter().find_map(|m| m.subject.clone());
    let mut membership: BTreeMap<&str, bool> = BTreeMap::new();
    for member in &members {
        membership.insert(member.mailbox_id.as_str(), true);
    }
    let unread_count = members.iter().filter(|m| !m.is_read).count() as i64;
    let last_message_date = members.iter().filter_map(|m| m.date_received.clone()).max();

    let thread = Thread {
        id: thread_id.to_string(),
        email_remote_ids: email_remote_ids.iter().map(|s| s.to_string()).collect(),
        subject,
        mailbox_membership: membership
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        message_count: members.len() as i64,
        unread_count,
        last_message_date: parse_ts_opt(last_message_date),
    };

    write_thread(conn, &thread)
}

pub(crate) fn write_thread(conn: &Connection, thread: &Thread) -> Result<()> {
    let now = now_str();
    conn.execute(
        "INSERT INTO email_threads
         (id, email_remote_ids, subject, mailbox_membership,
          message_count, unread_count, last_message_date, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            email_remote_ids = excluded.email_remote_ids,
            subject = excluded.subject,
            mailbox_membership = excluded.mailbox_membership,
            message_count = excluded.message_count,
            unread_count = excluded.unread_count,
            last_message_date = excluded.last_message_date,
            updated_at = excluded.updated_at",
        params![
            thread.id,
            to_json(&thread.email_remote_ids)?,
            thread.subject,
            to_json(&thread.mailbox_membership)?,
            thread.message_count,
            thread.unread_count,
            thread.last_message_date.map(|dt| dt.to_rfc3339()),
            now,
            now,
        ],
    )?;
    Ok(())
}

pub(crate) fn load_thread(conn: &Connection, thread_id: &str) -> Result<Option<Thread>> {
    let thread = conn
        .query_row(
            "SELECT id, email_remote_ids, subject, mailbox_membership,
                    message_count, unread_count, last_message_date
             FROM email_threads WHERE id = ?",
            [thread_id],
            |row| {
                Ok(Thread {
                    id: row.get(0)?,
                    email_remote_ids: serde_json::from_str(&row.get::<_, String>(1)?)
                        .unwrap_or_default(),
                    subject: row.get(2)?,
                    mailbox_membership: serde_json::from_str(&row.get::<_, String>(3)?)
                        .unwrap_or_default(),
                    message_count: row.get(4)?,
                    unread_count: row.get(5)?,
                    last_message_date: parse_ts_opt(row.get(6)?),
                })
            },
        )
        .optional()?;
    Ok(thread)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| EngineError::IntegrityViolation(format!("unserializable column: {}", e)))
}
