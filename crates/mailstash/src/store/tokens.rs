//! Encrypted OAuth token rows
//!
//! The store only ever sees ciphertext; the token store layered above
//! encrypts before calling in and decrypts on the way out.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::{ArchiveStore, now_str, parse_ts, parse_ts_opt};
use crate::error::Result;

/// One row of the `oauth_tokens` table; token fields are ciphertext.
#[derive(Debug, Clone)]
pub struct TokenRow {
    pub account_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ArchiveStore {
    /// Upsert a token row under its account id.
    pub fn put_token_row(&self, row: &TokenRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_str();
        conn.execute(
            "INSERT INTO oauth_tokens
             (account_id, access_token, refresh_token, token_type,
              expires_at, scope, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_type = excluded.token_type,
                expires_at = excluded.expires_at,
                scope = excluded.scope,
                updated_at = excluded.updated_at",
            params![
                row.account_id,
                row.access_token,
                row.refresh_token,
                row.token_type,
                row.expires_at.map(|dt| dt.to_rfc3339()),
                row.scope,
                now,
                now,
            ],
        )?;
        Ok(())
    }

    /// Fetch the token row for an account, ciphertext and all.
    pub fn get_token_row(&self, account_id: &str) -> Result<Option<TokenRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT account_id, access_token, refresh_token, token_type,
                        expires_at, scope, created_at, updated_at
                 FROM oauth_tokens WHERE account_id = ?",
                [account_id],
                |row| {
                    Ok(TokenRow {
                        account_id: row.get(0)?,
                        access_token: row.get(1)?,
                        refresh_token: row.get(2)?,
                        token_type: row.get(3)?,
                        expires_at: parse_ts_opt(row.get(4)?),
                        scope: row.get(5)?,
                        created_at: parse_ts(&row.get::<_, String>(6)?),
                        updated_at: parse_ts(&row.get::<_, String>(7)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Delete the token row for an account. Idempotent.
    pub fn delete_token_row(&self, account_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM oauth_tokens WHERE account_id = ?", [account_id])?;
        Ok(())
    }

    /// Accounts with stored credentials, oldest row first.
    pub fn list_token_accounts(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT account_id FROM oauth_tokens ORDER BY created_at, account_id")?;
        let accounts = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(accounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(account_id: &str, access: &str) -> TokenRow {
        TokenRow {
            account_id: account_id.to_string(),
            access_token: access.to_string(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_at: None,
            scope: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_put_get_delete() {
        let store = ArchiveStore::in_memory().unwrap();
        store.put_token_row(&row("acc1", "ct-1")).unwrap();

        let loaded = store.get_token_row("acc1").unwrap().unwrap();
        assert_eq!(loaded.access_token, "ct-1");

        store.put_token_row(&row("acc1", "ct-2")).unwrap();
        let replaced = store.get_token_row("acc1").unwrap().unwrap();
        assert_eq!(replaced.access_token, "ct-2");
        assert_eq!(store.list_token_accounts().unwrap(), vec!["acc1"]);

        store.delete_token_row("acc1").unwrap();
        store.delete_token_row("acc1").unwrap();
        assert!(store.get_token_row("acc1").unwrap().is_none());
    }
}
