//! Full-text search over the archive
//!
//! One FTS5 row per live email, rewritten whenever the email is
//! upserted. The content hash over the indexed inputs makes change
//! detection and integrity checking cheap.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ToSql};
use sha2::{Digest, Sha256};

use super::{ArchiveStore, parse_ts_opt};
use crate::error::Result;
use crate::models::Email;

/// Filters applied on top of the text match
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub mailbox_ids: Option<Vec<String>>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub is_read: Option<bool>,
    pub is_flagged: Option<bool>,
    pub has_attachments: Option<bool>,
}

/// Result ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchSort {
    /// Text-relevance score, best first
    #[default]
    Rank,
    ReceivedDesc,
    ReceivedAsc,
}

/// One search result row
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub email_id: i64,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub snippet: String,
    /// Relevance score, positive and higher-is-better under rank sort;
    /// 0 under any other sort
    pub rank: f64,
    pub date_received: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub is_flagged: bool,
}

impl ArchiveStore {
    /// Ranked full-text search over non-deleted emails.
    ///
    /// All user-supplied values are bound parameters; the query text is
    /// quoted into FTS phrase tokens so operator characters cannot
    /// change the query shape.
    pub fn search(
        &self,
        query_text: &str,
        filters: &SearchFilters,
        sort: SearchSort,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SearchHit>> {
        let match_expr = fts_match_expression(query_text);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT e.id, e.subject, e.from_address,
                    snippet(email_search, 2, '', '', '…', 16),
                    bm25(email_search),
                    e.date_received, e.is_read, e.is_flagged
             FROM email_search
             JOIN emails e ON e.id = email_search.email_id
             WHERE email_search MATCH ? AND e.is_deleted = 0",
        );
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(match_expr)];

        if let Some(mailbox_ids) = &filters.mailbox_ids
            && !mailbox_ids.is_empty()
        {
            let placeholders = vec!["?"; mailbox_ids.len()].join(", ");
            sql.push_str(&format!(" AND e.mailbox_id IN ({})", placeholders));
            for id in mailbox_ids {
                params.push(Box::new(id.clone()));
            }
        }
        if let Some(from) = filters.date_from {
            sql.push_str(" AND e.date_received >= ?");
            params.push(Box::new(from.to_rfc3339()));
        }
        if let Some(to) = filters.date_to {
            sql.push_str(" AND e.date_received <= ?");
            params.push(Box::new(to.to_rfc3339()));
        }
        if let Some(is_read) = filters.is_read {
            sql.push_str(" AND e.is_read = ?");
            params.push(Box::new(is_read));
        }
        if let Some(is_flagged) = filters.is_flagged {
            sql.push_str(" AND e.is_flagged = ?");
            params.push(Box::new(is_flagged));
        }
        if let Some(has_attachments) = filters.has_attachments {
            sql.push_str(if has_attachments {
                " AND json_array_length(e.attachments) > 0"
            } else {
                " AND json_array_length(e.attachments) = 0"
            });
        }

        sql.push_str(match sort {
            // bm25 is lower-is-better
            SearchSort::Rank => " ORDER BY bm25(email_search)",
            SearchSort::ReceivedDesc => " ORDER BY e.date_received DESC",
            SearchSort::ReceivedAsc => " ORDER BY e.date_received ASC",
        });
        sql.push_str(" LIMIT ? OFFSET ?");
        params.push(Box::new(limit as i64));
        params.push(Box::new(offset as i64));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let hits = stmt
            .query_map(param_refs.as_slice(), |row| {
                let bm25: f64 = row.get(4)?;
                Ok(SearchHit {
                    email_id: row.get(0)?,
                    subject: row.get(1)?,
                    from: row.get(2)?,
                    snippet: row.get(3)?,
                    rank: if sort == SearchSort::Rank { -bm25 } else { 0.0 },
                    date_received: parse_ts_opt(row.get(5)?),
                    is_read: row.get(6)?,
                    is_flagged: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(hits)
    }
}

/// Write the search row for an email. Caller has already removed any
/// previous row and runs inside the email's transaction.
pub(crate) fn write_search_row(conn: &Connection, email_id: i64, email: &Email) -> Result<()> {
    let subject = email.subject.clone().unwrap_or_default();
    let from = email
        .from_address
        .as_ref()
        .map(|a| a.display())
        .unwrap_or_default();
    let body = email.search_body();
    let hash = content_hash(&subject, &from, &body);

    conn.execute(
        "INSERT INTO email_search (subject, from_address, body, email_id, content_hash)
         VALUES (?, ?, ?, ?, ?)",
        rusqlite::params![subject, from, body, email_id, hash],
    )?;
    Ok(())
}

/// Stable hash over the search-text inputs.
pub(crate) fn content_hash(subject: &str, from: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    hasher.update(b"\n");
    hasher.update(from.as_bytes());
    hasher.update(b"\n");
    hasher.update(body.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Quote each whitespace-separated token as an FTS phrase so user input
/// cannot inject FTS operators. Tokens with nothing for the tokenizer
/// (pure punctuation) are dropped; they would read as empty phrases.
fn fts_match_expression(query_text: &str) -> String {
    query_text
        .split_whitespace()
        .filter(|token| token.chars().any(char::is_alphanumeric))
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmailAddress, KEYWORD_SEEN};

    fn make_email(remote_id: &str, subject: &str, body: &str) -> Email {
        let mut email = Email::new(remote_id, "mb1");
        email.subject = Some(subject.to_string());
        email.from_address = Some(EmailAddress::new("sender@example.com"));
        email.body_text = Some(body.to_string());
        email.date_received = Some(Utc::now());
        email
    }

    #[test]
    fn test_search_ranking() {
        let store = ArchiveStore::in_memory().unwrap();
        store
            .upsert_email(&make_email("e1", "Privacy Policy", "our privacy practices"))
            .unwrap();
        store
            .upsert_email(&make_email("e2", "weekend plans", "hiking maybe"))
            .unwrap();

        let hits = store
            .search("privacy", &SearchFilters::default(), SearchSort::Rank, 10, 0)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].subject.as_deref(), Some("Privacy Policy"));
        assert!(hits[0].rank > 0.0);
    }

    #[test]
    fn test_search_is_read_filter() {
        let store = ArchiveStore::in_memory().unwrap();
        let mut read = make_email("e1", "privacy update", "read one");
        read.flags.insert(KEYWORD_SEEN.to_string(), true);
        store.upsert_email(&read).unwrap();
        store
            .upsert_email(&make_email("e2", "privacy notice", "unread one"))
            .unwrap();

        let filters = SearchFilters {
            is_read: Some(false),
            ..Default::default()
        };
        let hits = store
            .search("privacy", &filters, SearchSort::Rank, 10, 0)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].subject.as_deref(), Some("privacy notice"));
    }

    #[test]
    fn test_search_excludes_deleted() {
        let store = ArchiveStore::in_memory().unwrap();
        store
            .upsert_email(&make_email("e1", "privacy", "gone soon"))
            .unwrap();
        store.tombstone_email("e1").unwrap();

        let hits = store
            .search("privacy", &SearchFilters::default(), SearchSort::Rank, 10, 0)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_search_non_rank_sort_zeroes_rank() {
        let store = ArchiveStore::in_memory().unwrap();
        store
            .upsert_email(&make_email("e1", "privacy", "body"))
            .unwrap();

        let hits = store
            .search(
                "privacy",
                &SearchFilters::default(),
                SearchSort::ReceivedDesc,
                10,
                0,
            )
            .unwrap();
        assert_eq!(hits[0].rank, 0.0);
    }

    #[test]
    fn test_fts_operators_are_inert() {
        let store = ArchiveStore::in_memory().unwrap();
        store
            .upsert_email(&make_email("e1", "plain subject", "body"))
            .unwrap();

        // Must not panic or error; operator characters are quoted away.
        let hits = store
            .search(
                "subject\" OR NOT (",
                &SearchFilters::default(),
                SearchSort::Rank,
                10,
                0,
            )
            .unwrap();
        assert!(hits.len() <= 1);
    }

    #[test]
    fn test_content_hash_stable() {
        let a = content_hash("s", "f", "b");
        let b = content_hash("s", "f", "b");
        assert_eq!(a, b);
        assert_ne!(a, content_hash("s", "f", "changed"));
    }
}
