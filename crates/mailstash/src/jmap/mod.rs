//! JMAP integration
//!
//! This module provides:
//! - The [`RemoteMailbox`] seam the sync engine is written against
//! - A JMAP client speaking compound method calls over HTTP
//! - Response normalization to domain models

mod client;
mod normalize;

pub use client::JmapClient;
pub use normalize::{normalize_email, normalize_mailbox};

use std::collections::BTreeMap;

use crate::error::Result;
use crate::models::{Email, Mailbox, Thread};

/// An authenticated JMAP session
///
/// Holds the bearer credential for the lifetime of the session; the
/// credential never leaves this process.
#[derive(Clone)]
pub struct Session {
    pub(crate) access_token: String,
    /// Provider account id the session is bound to
    pub account_id: String,
    /// Endpoint for compound method calls
    pub api_url: String,
    /// Capability identifiers advertised by the provider
    pub capabilities: Vec<String>,
    /// Provider session state
    pub session_state: String,
}

impl Session {
    /// Build a session directly; scripted [`RemoteMailbox`]
    /// implementations use this, the JMAP client builds sessions from
    /// the provider's session document.
    pub fn new(
        access_token: impl Into<String>,
        account_id: impl Into<String>,
        api_url: impl Into<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            account_id: account_id.into(),
            api_url: api_url.into(),
            capabilities: vec![
                api::CAPABILITY_CORE.to_string(),
                api::CAPABILITY_MAIL.to_string(),
            ],
            session_state: "0".to_string(),
        }
    }

    /// The bearer credential the session was opened with.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("account_id", &self.account_id)
            .field("api_url", &self.api_url)
            .field("session_state", &self.session_state)
            .finish()
    }
}

/// Parameters for an incremental email pull
#[derive(Debug, Clone, Default)]
pub struct EmailQuery {
    /// Opaque cursor from a previous page; None starts from the beginning
    pub since_state: Option<String>,
    /// Restrict to one mailbox (provider id)
    pub mailbox_filter: Option<String>,
    /// Maximum ids per page
    pub limit: usize,
}

/// One page of email ids plus the cursor for the next page
#[derive(Debug, Clone)]
pub struct EmailPage {
    /// Provider-ordered ids; the engine must not assume a global order
    pub ids: Vec<String>,
    /// Opaque cursor describing the store state these ids brought us to
    pub next_state: String,
}

/// Parameters for an incremental thread pull
#[derive(Debug, Clone, Default)]
pub struct ThreadQuery {
    pub since_state: Option<String>,
    pub limit: usize,
}

/// One page of thread ids plus the cursor for the next page
#[derive(Debug, Clone)]
pub struct ThreadPage {
    pub ids: Vec<String>,
    pub next_state: String,
}

/// The remote mail service as the engine sees it
///
/// [`JmapClient`] is the production implementation; tests script an
/// in-memory one. Implementations do not retry; retry policy belongs to
/// the sync engine.
pub trait RemoteMailbox: Send + Sync {
    /// Authenticate and fetch the session document.
    fn open_session(&self, access_token: &str) -> Result<Session>;

    /// Every mailbox visible to the account, ordered by provider sort order.
    fn list_mailboxes(&self, session: &Session) -> Result<Vec<Mailbox>>;

    /// Fetch email ids changed since the query's cursor.
    fn query_emails(&self, session: &Session, query: &EmailQuery) -> Result<EmailPage>;

    /// Resolve ids to full records under the fixed archive projection.
    fn get_emails(&self, session: &Session, ids: &[String]) -> Result<Vec<Email>>;

    /// Single-message convenience for the webhook path.
    fn get_email(&self, session: &Session, id: &str) -> Result<Option<Email>>;

    /// Fetch thread ids changed since the query's cursor.
    fn list_threads(&self, session: &Session, query: &ThreadQuery) -> Result<ThreadPage>;

    /// Resolve thread ids to member email id lists.
    fn get_threads(&self, session: &Session, ids: &[String]) -> Result<Vec<Thread>>;

    /// Mutate per-email keyword flags; returns the updated record.
    fn set_flags(
        &self,
        session: &Session,
        id: &str,
        flags: &BTreeMap<String, bool>,
    ) -> Result<Email>;
}

/// JMAP request and response types
pub mod api {
    use std::collections::{BTreeMap, HashMap};

    use chrono::{DateTime, FixedOffset, Utc};
    use serde::{Deserialize, Serialize};

    /// Core capability required on every request
    pub const CAPABILITY_CORE: &str = "urn:ietf:params:jmap:core";
    /// Mail capability required on every request
    pub const CAPABILITY_MAIL: &str = "urn:ietf:params:jmap:mail";

    /// One tagged method call: `[name, arguments, callId]`
    pub type MethodCall = (String, serde_json::Value, String);

    /// Compound request envelope
    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Request {
        pub using: Vec<String>,
        pub method_calls: Vec<MethodCall>,
    }

    /// Compound response envelope
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Response {
        pub method_responses: Vec<MethodCall>,
        #[serde(default)]
        pub session_state: Option<String>,
    }

    /// Method-level error payload (`["error", {...}, callId]`)
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MethodError {
        #[serde(rename = "type")]
        pub error_type: String,
        #[serde(default)]
        pub description: Option<String>,
    }

    /// Session resource document
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SessionResource {
        #[serde(default)]
        pub capabilities: HashMap<String, serde_json::Value>,
        pub api_url: String,
        #[serde(default)]
        pub primary_accounts: HashMap<String, String>,
        #[serde(default)]
        pub accounts: HashMap<String, serde_json::Value>,
        pub state: String,
    }

    /// Generic `Foo/get` response
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GetResponse<T> {
        pub state: String,
        pub list: Vec<T>,
        #[serde(default)]
        pub not_found: Vec<String>,
    }

    /// `Email/query` response
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct QueryResponse {
        pub query_state: String,
        pub ids: Vec<String>,
        #[serde(default)]
        pub position: Option<u64>,
        #[serde(default)]
        pub total: Option<u64>,
    }

    /// Generic `Foo/changes` response
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ChangesResponse {
        pub old_state: String,
        pub new_state: String,
        #[serde(default)]
        pub has_more_changes: bool,
        #[serde(default)]
        pub created: Vec<String>,
        #[serde(default)]
        pub updated: Vec<String>,
        #[serde(default)]
        pub destroyed: Vec<String>,
    }

    /// `Email/set` response
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SetResponse {
        #[serde(default)]
        pub updated: Option<HashMap<String, Option<serde_json::Value>>>,
        #[serde(default)]
        pub not_updated: Option<HashMap<String, MethodError>>,
    }

    /// A mailbox as the provider describes it
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct JmapMailbox {
        pub id: String,
        pub name: String,
        #[serde(default)]
        pub parent_id: Option<String>,
        #[serde(default)]
        pub role: Option<String>,
        #[serde(default)]
        pub sort_order: i64,
        #[serde(default)]
        pub total_emails: i64,
        #[serde(default)]
        pub unread_emails: i64,
    }

    /// An address as the provider describes it
    #[derive(Debug, Clone, Deserialize)]
    pub struct JmapAddress {
        #[serde(default)]
        pub name: Option<String>,
        #[serde(default)]
        pub email: Option<String>,
    }

    /// A body part reference (text/html bodies and attachments)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct JmapBodyPart {
        #[serde(default)]
        pub part_id: Option<String>,
        #[serde(default)]
        pub blob_id: Option<String>,
        #[serde(default)]
        pub size: Option<u64>,
        #[serde(default)]
        pub name: Option<String>,
        #[serde(rename = "type", default)]
        pub mime_type: Option<String>,
        #[serde(default)]
        pub cid: Option<String>,
        #[serde(default)]
        pub disposition: Option<String>,
    }

    /// Fetched body content keyed by part id
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct JmapBodyValue {
        pub value: String,
        #[serde(default)]
        pub is_truncated: bool,
    }

    /// A full email record under the archive projection
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct JmapEmail {
        pub id: String,
        #[serde(default)]
        pub thread_id: Option<String>,
        #[serde(default)]
        pub mailbox_ids: BTreeMap<String, bool>,
        #[serde(default)]
        pub keywords: BTreeMap<String, bool>,
        #[serde(default)]
        pub from: Option<Vec<JmapAddress>>,
        #[serde(default)]
        pub to: Option<Vec<JmapAddress>>,
        #[serde(default)]
        pub cc: Option<Vec<JmapAddress>>,
        #[serde(default)]
        pub bcc: Option<Vec<JmapAddress>>,
        #[serde(default)]
        pub reply_to: Option<Vec<JmapAddress>>,
        #[serde(default)]
        pub subject: Option<String>,
        #[serde(default)]
        pub sent_at: Option<DateTime<FixedOffset>>,
        #[serde(default)]
        pub received_at: Option<DateTime<Utc>>,
        #[serde(default)]
        pub message_id: Option<Vec<String>>,
        #[serde(default)]
        pub in_reply_to: Option<Vec<String>>,
        #[serde(default)]
        pub references: Option<Vec<String>>,
        #[serde(default)]
        pub size: Option<u64>,
        #[serde(default)]
        pub text_body: Option<Vec<JmapBodyPart>>,
        #[serde(default)]
        pub html_body: Option<Vec<JmapBodyPart>>,
        #[serde(default)]
        pub attachments: Option<Vec<JmapBodyPart>>,
        #[serde(default)]
        pub body_values: Option<HashMap<String, JmapBodyValue>>,
    }

    /// A thread as the provider describes it
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct JmapThread {
        pub id: String,
        #[serde(default)]
        pub email_ids: Vec<String>,
    }
}
