//! Thread model

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation thread
///
/// The row is derived from the archived emails that reference the thread;
/// `message_count` always equals the number of member email ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    /// Provider thread id
    pub id: String,
    /// Provider ids of the member emails
    pub email_remote_ids: Vec<String>,
    /// Subject of the earliest member
    pub subject: Option<String>,
    /// Mailboxes the thread has at least one member in
    pub mailbox_membership: BTreeMap<String, bool>,
    pub message_count: i64,
    pub unread_count: i64,
    pub last_message_date: Option<DateTime<Utc>>,
}

impl Thread {
    /// Create an empty thread record for the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email_remote_ids: Vec::new(),
            subject: None,
            mailbox_membership: BTreeMap::new(),
            message_count: 0,
            unread_count: 0,
            last_message_date: None,
        }
    }

    /// Create a thread from a provider id list, as returned by the
    /// remote `Thread/get` call. Derived fields are filled in by the
    /// archive store when members are persisted.
    pub fn from_member_ids(id: impl Into<String>, email_remote_ids: Vec<String>) -> Self {
        let message_count = email_remote_ids.len() as i64;
        Self {
            id: id.into(),
            email_remote_ids,
            subject: None,
            mailbox_membership: BTreeMap::new(),
            message_count,
            unread_count: 0,
            last_message_date: None,
        }
    }
}
