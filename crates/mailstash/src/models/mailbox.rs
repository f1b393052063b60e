//! Mailbox model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A mailbox (folder) visible to the account
///
/// `remote_id` is the natural key for upserts; `sort_order` is whatever
/// the provider advertised and drives stable listing order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    /// Local row id (0 before the record is persisted)
    pub id: i64,
    /// Provider mailbox id (unique)
    pub remote_id: String,
    pub name: String,
    pub parent_remote_id: Option<String>,
    /// Provider role such as "inbox", "archive", "trash"
    pub role: Option<String>,
    pub sort_order: i64,
    pub total_emails: i64,
    pub unread_emails: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mailbox {
    /// Create a mailbox record for the given natural key.
    pub fn new(remote_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            remote_id: remote_id.into(),
            name: name.into(),
            parent_remote_id: None,
            role: None,
            sort_order: 0,
            total_emails: 0,
            unread_emails: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
