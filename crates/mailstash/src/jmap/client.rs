//! JMAP HTTP client
//!
//! Speaks compound request/response method calls against the provider's
//! API endpoint. Uses synchronous HTTP (ureq) to be executor-agnostic.
//! This layer never retries; retry policy belongs to the sync engine.

use std::collections::BTreeMap;

use serde_json::json;

use super::api::{self, CAPABILITY_CORE, CAPABILITY_MAIL};
use super::{EmailPage, EmailQuery, RemoteMailbox, Session, ThreadPage, ThreadQuery};
use crate::error::{EngineError, Result};
use crate::models::{Email, Mailbox, Thread};

/// Email properties fetched for the archive. Fixed projection: ids,
/// threading, headers, timestamps, bodies, attachments, keywords, size.
const EMAIL_PROPERTIES: &[&str] = &[
    "id",
    "threadId",
    "mailboxIds",
    "keywords",
    "from",
    "to",
    "cc",
    "bcc",
    "replyTo",
    "subject",
    "sentAt",
    "receivedAt",
    "messageId",
    "inReplyTo",
    "references",
    "size",
    "textBody",
    "htmlBody",
    "attachments",
    "bodyValues",
];

/// Cursor tokens minted by this client
///
/// The engine stores the token unchanged; only the client interprets it.
/// A fresh account backfills by position against an anchor state captured
/// up front, then switches to the provider's changes feed, so emails that
/// arrive during the backfill are picked up by the first changes query.
#[derive(Debug, PartialEq)]
enum CursorToken {
    /// No token yet: start a backfill and capture the anchor
    Start,
    /// Backfill in progress at the given position
    Backfill { offset: usize, anchor: String },
    /// Incremental changes since the given provider state
    Changes { state: String },
}

impl CursorToken {
    fn parse(token: Option<&str>) -> Self {
        let Some(token) = token else {
            return CursorToken::Start;
        };

        if let Some(rest) = token.strip_prefix("backfill:")
            && let Some((offset, anchor)) = rest.split_once(':')
            && let Ok(offset) = offset.parse()
        {
            return CursorToken::Backfill {
                offset,
                anchor: anchor.to_string(),
            };
        }

        let state = token.strip_prefix("state:").unwrap_or(token);
        CursorToken::Changes {
            state: state.to_string(),
        }
    }

    fn backfill(offset: usize, anchor: &str) -> String {
        format!("backfill:{}:{}", offset, anchor)
    }

    fn changes(state: &str) -> String {
        format!("state:{}", state)
    }
}

/// JMAP client bound to one provider session resource
pub struct JmapClient {
    session_url: String,
}

impl JmapClient {
    /// Create a client for the given session resource URL.
    pub fn new(session_url: impl Into<String>) -> Self {
        Self {
            session_url: session_url.into(),
        }
    }

    /// Issue one compound request and return the tagged responses.
    fn request(&self, session: &Session, method_calls: Vec<api::MethodCall>) -> Result<api::Response> {
        let request = api::Request {
            using: vec![CAPABILITY_CORE.to_string(), CAPABILITY_MAIL.to_string()],
            method_calls,
        };

        let mut response = ureq::post(&session.api_url)
            .header("Authorization", &format!("Bearer {}", session.access_token))
            .send_json(&request)
            .map_err(|e| map_http_error(e, "method call"))?;

        response
            .body_mut()
            .read_json()
            .map_err(|e| EngineError::Protocol(format!("malformed method response: {}", e)))
    }

    /// Pull one tagged response out of a compound response, translating
    /// method-level errors into the engine taxonomy.
    fn take(
        response: &mut api::Response,
        call_id: &str,
        expected: &str,
    ) -> Result<serde_json::Value> {
        let index = response
            .method_responses
            .iter()
            .position(|(_, _, id)| id == call_id)
            .ok_or_else(|| {
                EngineError::Protocol(format!("no response for call {:?}", call_id))
            })?;

        let (name, args, _) = response.method_responses.remove(index);

        if name == "error" {
            let err: api::MethodError = serde_json::from_value(args)
                .map_err(|e| EngineError::Protocol(format!("malformed error response: {}", e)))?;
            return Err(map_method_error(err));
        }

        if name != expected {
            return Err(EngineError::Protocol(format!(
                "expected {} response, got {}",
                expected, name
            )));
        }

        Ok(args)
    }

    fn parse<T: serde::de::DeserializeOwned>(what: &str, args: serde_json::Value) -> Result<T> {
        serde_json::from_value(args)
            .map_err(|e| EngineError::Protocol(format!("malformed {} response: {}", what, e)))
    }

    /// Current provider state for the email type, via an empty `Email/get`.
    fn email_state(&self, session: &Session) -> Result<String> {
        let mut response = self.request(
            session,
            vec![(
                "Email/get".to_string(),
                json!({ "accountId": session.account_id, "ids": [] }),
                "s0".to_string(),
            )],
        )?;
        let get: api::GetResponse<api::JmapEmail> =
            Self::parse("Email/get", Self::take(&mut response, "s0", "Email/get")?)?;
        Ok(get.state)
    }

    /// One positional `Email/query` page. Requests a receivedAt sort but
    /// falls back to provider order when the provider rejects it; the
    /// engine never depends on a global order.
    fn query_page(
        &self,
        session: &Session,
        filter: Option<&str>,
        position: usize,
        limit: usize,
    ) -> Result<Vec<String>> {
        for with_sort in [true, false] {
            let mut args = json!({
                "accountId": session.account_id,
                "position": position,
                "limit": limit,
            });
            if let Some(mailbox_id) = filter {
                args["filter"] = json!({ "inMailbox": mailbox_id });
            }
            if with_sort {
                args["sort"] = json!([{ "property": "receivedAt", "isAscending": false }]);
            }

            let calls = vec![("Email/query".to_string(), args, "q0".to_string())];
            let mut response = self.request(session, calls)?;

            match Self::take(&mut response, "q0", "Email/query") {
                Ok(args) => {
                    let query: api::QueryResponse = Self::parse("Email/query", args)?;
                    return Ok(query.ids);
                }
                Err(EngineError::Protocol(msg)) if with_sort && msg.contains("unsupportedSort") => {
                    tracing::debug!("provider rejected receivedAt sort, retrying unsorted");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("unsorted query does not produce unsupportedSort");
    }

    /// `Email/changes` since the given state.
    fn email_changes(
        &self,
        session: &Session,
        since: &str,
        limit: usize,
    ) -> Result<api::ChangesResponse> {
        let mut response = self.request(
            session,
            vec![(
                "Email/changes".to_string(),
                json!({
                    "accountId": session.account_id,
                    "sinceState": since,
                    "maxChanges": limit,
                }),
                "c0".to_string(),
            )],
        )?;
        Self::parse(
            "Email/changes",
            Self::take(&mut response, "c0", "Email/changes")?,
        )
    }
}

impl RemoteMailbox for JmapClient {
    fn open_session(&self, access_token: &str) -> Result<Session> {
        let mut response = ureq::get(&self.session_url)
            .header("Authorization", &format!("Bearer {}", access_token))
            .call()
            .map_err(|e| map_http_error(e, "session fetch"))?;

        let resource: api::SessionResource = response
            .body_mut()
            .read_json()
            .map_err(|e| EngineError::Protocol(format!("malformed session document: {}", e)))?;

        let account_id = resource
            .primary_accounts
            .get(CAPABILITY_MAIL)
            .cloned()
            .or_else(|| resource.accounts.keys().next().cloned())
            .ok_or_else(|| {
                EngineError::Protocol("session document advertises no mail account".to_string())
            })?;

        let mut capabilities: Vec<String> = resource.capabilities.keys().cloned().collect();
        capabilities.sort();

        Ok(Session {
            access_token: access_token.to_string(),
            account_id,
            api_url: resource.api_url,
            capabilities,
            session_state: resource.state,
        })
    }

    fn list_mailboxes(&self, session: &Session) -> Result<Vec<Mailbox>> {
        let mut response = self.request(
            session,
            vec![(
                "Mailbox/get".to_string(),
                json!({ "accountId": session.account_id, "ids": null }),
                "m0".to_string(),
            )],
        )?;

        let get: api::GetResponse<api::JmapMailbox> =
            Self::parse("Mailbox/get", Self::take(&mut response, "m0", "Mailbox/get")?)?;

        let mut mailboxes: Vec<Mailbox> = get.list.into_iter().map(super::normalize_mailbox).collect();
        mailboxes.sort_by_key(|m| m.sort_order);
        Ok(mailboxes)
    }

    fn query_emails(&self, session: &Session, query: &EmailQuery) -> Result<EmailPage> {
        match CursorToken::parse(query.since_state.as_deref()) {
            CursorToken::Start => {
                // Anchor the changes feed before listing so anything that
                // arrives during the backfill is seen by the first
                // changes query.
                let anchor = self.email_state(session)?;
                let ids =
                    self.query_page(session, query.mailbox_filter.as_deref(), 0, query.limit)?;
                let next_state = if ids.len() == query.limit {
                    CursorToken::backfill(ids.len(), &anchor)
                } else {
                    CursorToken::changes(&anchor)
                };
                Ok(EmailPage { ids, next_state })
            }
            CursorToken::Backfill { offset, anchor } => {
                let ids = self.query_page(
                    session,
                    query.mailbox_filter.as_deref(),
                    offset,
                    query.limit,
                )?;
                let next_state = if ids.len() == query.limit {
                    CursorToken::backfill(offset + ids.len(), &anchor)
                } else {
                    CursorToken::changes(&anchor)
                };
                Ok(EmailPage { ids, next_state })
            }
            CursorToken::Changes { state } => {
                let changes = self.email_changes(session, &state, query.limit)?;
                let mut ids = changes.created;
                for id in changes.updated {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                Ok(EmailPage {
                    ids,
                    next_state: CursorToken::changes(&changes.new_state),
                })
            }
        }
    }

    fn get_emails(&self, session: &Session, ids: &[String]) -> Result<Vec<Email>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut response = self.request(
            session,
            vec![(
                "Email/get".to_string(),
                json!({
                    "accountId": session.account_id,
                    "ids": ids,
                    "properties": EMAIL_PROPERTIES,
                    "fetchTextBodyValues": true,
                    "fetchHTMLBodyValues": true,
                }),
                "g0".to_string(),
            )],
        )?;

        let get: api::GetResponse<api::JmapEmail> =
            Self::parse("Email/get", Self::take(&mut response, "g0", "Email/get")?)?;

        let mut emails = Vec::with_capacity(get.list.len());
        for wire in get.list {
            match super::normalize_email(wire) {
                Ok(email) => emails.push(email),
                Err(e) => tracing::warn!(error = %e, "skipping email that failed to normalize"),
            }
        }
        Ok(emails)
    }

    fn get_email(&self, session: &Session, id: &str) -> Result<Option<Email>> {
        let ids = [id.to_string()];
        Ok(self.get_emails(session, &ids)?.into_iter().next())
    }

    fn list_threads(&self, session: &Session, query: &ThreadQuery) -> Result<ThreadPage> {
        match CursorToken::parse(query.since_state.as_deref()) {
            CursorToken::Changes { state } => {
                let mut response = self.request(
                    session,
                    vec![(
                        "Thread/changes".to_string(),
                        json!({
                            "accountId": session.account_id,
                            "sinceState": state,
                            "maxChanges": query.limit,
                        }),
                        "t0".to_string(),
                    )],
                )?;
                let changes: api::ChangesResponse = Self::parse(
                    "Thread/changes",
                    Self::take(&mut response, "t0", "Thread/changes")?,
                )?;

                let mut ids = changes.created;
                for id in changes.updated {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                Ok(ThreadPage {
                    ids,
                    next_state: CursorToken::changes(&changes.new_state),
                })
            }
            // Threads are discovered through email records; without a
            // cursor we only capture the current state.
            _ => {
                let mut response = self.request(
                    session,
                    vec![(
                        "Thread/get".to_string(),
                        json!({ "accountId": session.account_id, "ids": [] }),
                        "t0".to_string(),
                    )],
                )?;
                let get: api::GetResponse<api::JmapThread> =
                    Self::parse("Thread/get", Self::take(&mut response, "t0", "Thread/get")?)?;
                Ok(ThreadPage {
                    ids: Vec::new(),
                    next_state: CursorToken::changes(&get.state),
                })
            }
        }
    }

    fn get_threads(&self, session: &Session, ids: &[String]) -> Result<Vec<Thread>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut response = self.request(
            session,
            vec![(
                "Thread/get".to_string(),
                json!({ "accountId": session.account_id, "ids": ids }),
                "t0".to_string(),
            )],
        )?;

        let get: api::GetResponse<api::JmapThread> =
            Self::parse("Thread/get", Self::take(&mut response, "t0", "Thread/get")?)?;

        Ok(get
            .list
            .into_iter()
            .map(|t| Thread::from_member_ids(t.id, t.email_ids))
            .collect())
    }

    fn set_flags(
        &self,
        session: &Session,
        id: &str,
        flags: &BTreeMap<String, bool>,
    ) -> Result<Email> {
        // Keyword maps only carry true entries; clearing a keyword is a
        // null patch.
        let mut patch = serde_json::Map::new();
        for (keyword, value) in flags {
            let key = format!("keywords/{}", keyword);
            patch.insert(key, if *value { json!(true) } else { json!(null) });
        }

        let mut response = self.request(
            session,
            vec![
                (
                    "Email/set".to_string(),
                    json!({
                        "accountId": session.account_id,
                        "update": { id: patch },
                    }),
                    "s0".to_string(),
                ),
                (
                    "Email/get".to_string(),
                    json!({
                        "accountId": session.account_id,
                        "ids": [id],
                        "properties": EMAIL_PROPERTIES,
                        "fetchTextBodyValues": true,
                        "fetchHTMLBodyValues": true,
                    }),
                    "g0".to_string(),
                ),
            ],
        )?;

        let set: api::SetResponse =
            Self::parse("Email/set", Self::take(&mut response, "s0", "Email/set")?)?;
        if let Some(not_updated) = set.not_updated
            && let Some(err) = not_updated.get(id)
        {
            return Err(EngineError::Protocol(format!(
                "flag update rejected: {}{}",
                err.error_type,
                err.description
                    .as_deref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default()
            )));
        }

        let get: api::GetResponse<api::JmapEmail> =
            Self::parse("Email/get", Self::take(&mut response, "g0", "Email/get")?)?;
        let wire = get.list.into_iter().next().ok_or_else(|| {
            EngineError::Protocol(format!("email {} vanished after flag update", id))
        })?;
        super::normalize_email(wire)
    }
}

/// Translate an HTTP-level failure into the engine taxonomy.
fn map_http_error(err: ureq::Error, what: &str) -> EngineError {
    match err {
        ureq::Error::StatusCode(401) | ureq::Error::StatusCode(403) => {
            EngineError::Unauthorized(format!("{}: HTTP {}", what, http_code(&err)))
        }
        ureq::Error::StatusCode(429) => {
            EngineError::RateLimited(format!("{}: HTTP 429", what))
        }
        ureq::Error::StatusCode(code) if code >= 500 => {
            EngineError::Network(format!("{}: HTTP {}", what, code))
        }
        ureq::Error::StatusCode(code) => {
            EngineError::Protocol(format!("{}: unexpected HTTP {}", what, code))
        }
        other => EngineError::Network(format!("{}: {}", what, other)),
    }
}

fn http_code(err: &ureq::Error) -> u16 {
    match err {
        ureq::Error::StatusCode(code) => *code,
        _ => 0,
    }
}

/// Translate a JMAP method-level error, preserving the provider code.
fn map_method_error(err: api::MethodError) -> EngineError {
    let detail = format!(
        "{}{}",
        err.error_type,
        err.description
            .as_deref()
            .map(|d| format!(": {}", d))
            .unwrap_or_default()
    );
    match err.error_type.as_str() {
        "serverUnavailable" | "serverPartialFail" => EngineError::Network(detail),
        "forbidden" | "accountNotFound" | "accountReadOnly" => EngineError::Unauthorized(detail),
        _ => EngineError::Protocol(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_token_start() {
        assert_eq!(CursorToken::parse(None), CursorToken::Start);
    }

    #[test]
    fn test_cursor_token_backfill_roundtrip() {
        let token = CursorToken::backfill(200, "anchor-7");
        assert_eq!(
            CursorToken::parse(Some(&token)),
            CursorToken::Backfill {
                offset: 200,
                anchor: "anchor-7".to_string()
            }
        );
    }

    #[test]
    fn test_cursor_token_changes_roundtrip() {
        let token = CursorToken::changes("xyz");
        assert_eq!(
            CursorToken::parse(Some(&token)),
            CursorToken::Changes {
                state: "xyz".to_string()
            }
        );
    }

    #[test]
    fn test_cursor_token_raw_state_is_changes() {
        // States recorded by older builds carry no prefix.
        assert_eq!(
            CursorToken::parse(Some("plain-state")),
            CursorToken::Changes {
                state: "plain-state".to_string()
            }
        );
    }

    #[test]
    fn test_method_error_mapping() {
        let err = map_method_error(api::MethodError {
            error_type: "serverUnavailable".to_string(),
            description: None,
        });
        assert!(matches!(err, EngineError::Network(_)));

        let err = map_method_error(api::MethodError {
            error_type: "unsupportedSort".to_string(),
            description: Some("receivedAt".to_string()),
        });
        match err {
            EngineError::Protocol(msg) => assert!(msg.contains("unsupportedSort")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
