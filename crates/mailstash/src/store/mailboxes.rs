//! Mailbox persistence

use rusqlite::{Connection, OptionalExtension, params};

use super::{ArchiveStore, now_str, parse_ts};
use crate::error::Result;
use crate::models::Mailbox;

impl ArchiveStore {
    /// Insert or update a mailbox under its provider id.
    ///
    /// Returns the canonical post-write row.
    pub fn upsert_mailbox(&self, mailbox: &Mailbox) -> Result<Mailbox> {
        let conn = self.conn.lock().unwrap();
        write_mailbox(&conn, mailbox)?;
        Ok(load_mailbox(&conn, &mailbox.remote_id)?.expect("row just written"))
    }

    /// Look up a mailbox by its provider id.
    pub fn get_mailbox_by_remote_id(&self, remote_id: &str) -> Result<Option<Mailbox>> {
        let conn = self.conn.lock().unwrap();
        load_mailbox(&conn, remote_id)
    }

    /// All mailboxes in provider sort order.
    pub fn list_mailboxes(&self) -> Result<Vec<Mailbox>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, remote_id, name, parent_remote_id, role, sort_order,
                    total_emails, unread_emails, created_at, updated_at
             FROM mailboxes
             ORDER BY sort_order, name",
        )?;

        let mailboxes = stmt
            .query_map([], map_mailbox_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(mailboxes)
    }
}

/// Upsert a mailbox row. `INSERT OR REPLACE` would churn the local row
/// id, so conflicts update in place.
pub(crate) fn write_mailbox(conn: &Connection, mailbox: &Mailbox) -> Result<()> {
    let now = now_str();
    conn.execute(
        "INSERT INTO mailboxes
         (remote_id, name, parent_remote_id, role, sort_order,
          total_emails, unread_emails, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(remote_id) DO UPDATE SET
            name = excluded.name,
            parent_remote_id = excluded.parent_remote_id,
            role = excluded.role,
            sort_order = excluded.sort_order,
            total_emails = excluded.total_emails,
            unread_emails = excluded.unread_emails,
            updated_at = excluded.updated_at",
        params![
            mailbox.remote_id,
            mailbox.name,
            mailbox.parent_remote_id,
            mailbox.role,
            mailbox.sort_order,
            mailbox.total_emails,
            mailbox.unread_emails,
            now,
            now,
        ],
    )?;
    Ok(())
}

pub(crate) fn load_mailbox(conn: &Connection, remote_id: &str) -> Result<Option<Mailbox>> {
    let mailbox = conn
        .query_row(
            "SELECT id, remote_id, name, parent_remote_id, role, sort_order,
                    total_emails, unread_emails, created_at, updated_at
             FROM mailboxes WHERE remote_id = ?",
            [remote_id],
            map_mailbox_row,
        )
        .optional()?;
    Ok(mailbox)
}

fn map_mailbox_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Mailbox> {
    Ok(Mailbox {
        id: row.get(0)?,
        remote_id: row.get(1)?,
        name: row.get(2)?,
        parent_remote_id: row.get(3)?,
        role: row.get(4)?,
        sort_order: row.get(5)?,
        total_emails: row.get(6)?,
        unread_emails: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?),
        updated_at: parse_ts(&row.get::<_, String>(9)?),
    })
}
