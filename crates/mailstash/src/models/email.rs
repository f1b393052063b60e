//! Email model and address handling

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Keyword marking a message as read.
pub const KEYWORD_SEEN: &str = "$seen";
/// Keyword marking a message as flagged.
pub const KEYWORD_FLAGGED: &str = "$flagged";

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    /// Create a new email address with just the email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new email address with a display name
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse an email address from a string like "John Doe <john@example.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim();
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                email: email.to_string(),
            };
        }

        Self {
            name: None,
            email: s.to_string(),
        }
    }

    /// Format the email address for display
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// An attachment reference carried on an archived email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Provider part id
    pub id: String,
    /// Provider blob id for downloading the content
    pub blob_id: String,
    /// File name, when the provider supplied one
    pub name: Option<String>,
    /// MIME type
    pub mime_type: String,
    /// Size in bytes
    pub size: u64,
    /// Content-ID for inline references from the HTML body
    pub content_id: Option<String>,
    /// Whether the part is displayed inline
    pub inline: bool,
}

/// An archived email message
///
/// `remote_id` is the natural key; the local `id` is assigned by the
/// archive store and is zero until the record has been persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    /// Local row id (0 before the record is persisted)
    pub id: i64,
    /// Provider email id (unique)
    pub remote_id: String,
    /// Provider thread id
    pub thread_id: Option<String>,
    /// Primary mailbox (provider mailbox id)
    pub mailbox_id: String,
    pub subject: Option<String>,
    pub from_address: Option<EmailAddress>,
    pub to_addresses: Vec<EmailAddress>,
    pub cc_addresses: Vec<EmailAddress>,
    pub bcc_addresses: Vec<EmailAddress>,
    pub reply_to_addresses: Vec<EmailAddress>,
    pub date_received: Option<DateTime<Utc>>,
    pub date_sent: Option<DateTime<Utc>>,
    /// RFC 5322 Message-ID header
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Provider keyword flags (`$seen`, `$flagged`, ...)
    pub flags: BTreeMap<String, bool>,
    pub size_bytes: u64,
    /// Soft-delete tombstone; the engine never hard-deletes outside the
    /// retention job
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Email {
    /// Create a skeleton email for the given natural key.
    pub fn new(remote_id: impl Into<String>, mailbox_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            remote_id: remote_id.into(),
            thread_id: None,
            mailbox_id: mailbox_id.into(),
            subject: None,
            from_address: None,
            to_addresses: Vec::new(),
            cc_addresses: Vec::new(),
            bcc_addresses: Vec::new(),
            reply_to_addresses: Vec::new(),
            date_received: None,
            date_sent: None,
            message_id: None,
            in_reply_to: None,
            references: Vec::new(),
            body_text: None,
            body_html: None,
            attachments: Vec::new(),
            flags: BTreeMap::new(),
            size_bytes: 0,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Read status, derived from the `$seen` keyword.
    pub fn is_read(&self) -> bool {
        self.flags.get(KEYWORD_SEEN).copied().unwrap_or(false)
    }

    /// Flagged status, derived from the `$flagged` keyword.
    pub fn is_flagged(&self) -> bool {
        self.flags.get(KEYWORD_FLAGGED).copied().unwrap_or(false)
    }

    /// Plain text used for the search row: the text body, or a plain
    /// rendering of the HTML body when no plain part exists. Script and
    /// style content never reaches the index.
    pub fn search_body(&self) -> String {
        if let Some(text) = &self.body_text
            && !text.is_empty()
        {
            return text.clone();
        }
        self.body_html
            .as_deref()
            .map(|html| {
                html2text::from_read(html.as_bytes(), HTML_RENDER_WIDTH)
                    .trim()
                    .to_string()
            })
            .unwrap_or_default()
    }
}

/// Column width when rendering HTML to indexable text. Wrapping only
/// affects line breaks, which the tokenizer ignores.
const HTML_RENDER_WIDTH: usize = 80;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_email_with_name() {
        let addr = EmailAddress::parse("John Doe <john@example.com>");
        assert_eq!(addr.name, Some("John Doe".to_string()));
        assert_eq!(addr.email, "john@example.com");
    }

    #[test]
    fn test_parse_email_without_name() {
        let addr = EmailAddress::parse("john@example.com");
        assert_eq!(addr.name, None);
        assert_eq!(addr.email, "john@example.com");
    }

    #[test]
    fn test_display_roundtrip() {
        let addr = EmailAddress::with_name("John Doe", "john@example.com");
        assert_eq!(EmailAddress::parse(&addr.display()), addr);
    }

    #[test]
    fn test_derived_flags() {
        let mut email = Email::new("e1", "mb1");
        assert!(!email.is_read());
        assert!(!email.is_flagged());

        email.flags.insert(KEYWORD_SEEN.to_string(), true);
        email.flags.insert(KEYWORD_FLAGGED.to_string(), false);
        assert!(email.is_read());
        assert!(!email.is_flagged());
    }

    #[test]
    fn test_search_body_prefers_text() {
        let mut email = Email::new("e1", "mb1");
        email.body_text = Some("plain".to_string());
        email.body_html = Some("<p>html</p>".to_string());
        assert_eq!(email.search_body(), "plain");
    }

    #[test]
    fn test_search_body_renders_html() {
        let mut email = Email::new("e1", "mb1");
        email.body_html = Some("<p>Hello <b>world</b></p>".to_string());
        let body = email.search_body();
        assert!(body.contains("Hello"), "{:?}", body);
        assert!(body.contains("world"), "{:?}", body);
    }

    #[test]
    fn test_search_body_drops_script_and_style() {
        let mut email = Email::new("e1", "mb1");
        email.body_html = Some(
            "<html><head><style>.banner { color: #ff0000; }</style>\
             <script>var trackingToken = \"opaque\";</script></head>\
             <body><p>quarterly report attached</p></body></html>"
                .to_string(),
        );
        let body = email.search_body();
        assert!(body.contains("quarterly report"), "{:?}", body);
        assert!(!body.contains("trackingToken"), "{:?}", body);
        assert!(!body.contains("ff0000"), "{:?}", body);
        assert!(!body.contains("banner"), "{:?}", body);
    }
}
