//! JMAP response normalization
//!
//! Converts provider wire records to archive domain models.

use chrono::Utc;

use super::api::{JmapBodyPart, JmapEmail, JmapMailbox};
use crate::error::{EngineError, Result};
use crate::models::{Attachment, Email, EmailAddress, Mailbox};

/// Normalize a provider mailbox to an archive [`Mailbox`].
pub fn normalize_mailbox(wire: JmapMailbox) -> Mailbox {
    let mut mailbox = Mailbox::new(wire.id, wire.name);
    mailbox.parent_remote_id = wire.parent_id;
    mailbox.role = wire.role;
    mailbox.sort_order = wire.sort_order;
    mailbox.total_emails = wire.total_emails;
    mailbox.unread_emails = wire.unread_emails;
    mailbox
}

/// Normalize a provider email to an archive [`Email`].
///
/// The provider carries a mailbox-id set; the archive keys each email on
/// a primary mailbox, taken as the first member in id order.
pub fn normalize_email(wire: JmapEmail) -> Result<Email> {
    let mailbox_id = wire
        .mailbox_ids
        .iter()
        .find(|(_, present)| **present)
        .map(|(id, _)| id.clone())
        .ok_or_else(|| {
            EngineError::Protocol(format!("email {} belongs to no mailbox", wire.id))
        })?;

    let body_text = collect_body(&wire, wire.text_body.as_deref());
    let body_html = collect_body(&wire, wire.html_body.as_deref());

    let mut email = Email::new(wire.id, mailbox_id);
    email.thread_id = wire.thread_id;
    email.subject = wire.subject;
    email.from_address = wire.from.as_deref().and_then(first_address);
    email.to_addresses = addresses(wire.to.as_deref());
    email.cc_addresses = addresses(wire.cc.as_deref());
    email.bcc_addresses = addresses(wire.bcc.as_deref());
    email.reply_to_addresses = addresses(wire.reply_to.as_deref());
    email.date_sent = wire.sent_at.map(|dt| dt.with_timezone(&Utc));
    email.date_received = wire.received_at;
    email.message_id = wire.message_id.and_then(|ids| ids.into_iter().next());
    email.in_reply_to = wire.in_reply_to.and_then(|ids| ids.into_iter().next());
    email.references = wire.references.unwrap_or_default();
    email.body_text = body_text;
    email.body_html = body_html;
    email.attachments = wire
        .attachments
        .unwrap_or_default()
        .into_iter()
        .filter_map(normalize_attachment)
        .collect();
    email.flags = wire.keywords;
    email.size_bytes = wire.size.unwrap_or(0);
    Ok(email)
}

/// Concatenate the fetched body values for the given part list.
fn collect_body(wire: &JmapEmail, parts: Option<&[JmapBodyPart]>) -> Option<String> {
    let parts = parts?;
    let values = wire.body_values.as_ref()?;

    let mut out = String::new();
    for part in parts {
        if let Some(part_id) = &part.part_id
            && let Some(value) = values.get(part_id)
        {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&value.value);
        }
    }

    if out.is_empty() { None } else { Some(out) }
}

fn first_address(addrs: &[super::api::JmapAddress]) -> Option<EmailAddress> {
    addrs.iter().find_map(|a| {
        a.email.as_ref().map(|email| EmailAddress {
            name: a.name.clone(),
            email: email.clone(),
        })
    })
}

fn addresses(addrs: Option<&[super::api::JmapAddress]>) -> Vec<EmailAddress> {
    addrs
        .unwrap_or_default()
        .iter()
        .filter_map(|a| {
            a.email.as_ref().map(|email| EmailAddress {
                name: a.name.clone(),
                email: email.clone(),
            })
        })
        .collect()
}

/// An attachment part without a blob id cannot be fetched later; skip it.
fn normalize_attachment(part: JmapBodyPart) -> Option<Attachment> {
    let blob_id = part.blob_id?;
    let inline = part.disposition.as_deref() == Some("inline") || part.cid.is_some();
    Some(Attachment {
        id: part.part_id.unwrap_or_else(|| blob_id.clone()),
        blob_id,
        name: part.name,
        mime_type: part
            .mime_type
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        size: part.size.unwrap_or(0),
        content_id: part.cid,
        inline,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use super::super::api::{JmapAddress, JmapBodyValue};
    use super::*;

    fn wire_email(id: &str) -> JmapEmail {
        JmapEmail {
            id: id.to_string(),
            thread_id: Some("t1".to_string()),
            mailbox_ids: BTreeMap::from([("mb1".to_string(), true)]),
            keywords: BTreeMap::from([("$seen".to_string(), true)]),
            from: Some(vec![JmapAddress {
                name: Some("Alice".to_string()),
                email: Some("alice@example.com".to_string()),
            }]),
            to: Some(vec![JmapAddress {
                name: None,
                email: Some("bob@example.com".to_string()),
            }]),
            cc: None,
            bcc: None,
            reply_to: None,
            subject: Some("Hello".to_string()),
            sent_at: None,
            received_at: Some(Utc::now()),
            message_id: Some(vec!["<m1@example.com>".to_string()]),
            in_reply_to: None,
            references: None,
            size: Some(2048),
            text_body: Some(vec![JmapBodyPart {
                part_id: Some("p1".to_string()),
                blob_id: Some("b1".to_string()),
                size: Some(11),
                name: None,
                mime_type: Some("text/plain".to_string()),
                cid: None,
                disposition: None,
            }]),
            html_body: None,
            attachments: Some(vec![JmapBodyPart {
                part_id: Some("p2".to_string()),
                blob_id: Some("b2".to_string()),
                size: Some(1024),
                name: Some("report.pdf".to_string()),
                mime_type: Some("application/pdf".to_string()),
                cid: None,
                disposition: Some("attachment".to_string()),
            }]),
            body_values: Some(HashMap::from([(
                "p1".to_string(),
                JmapBodyValue {
                    value: "Hello Bob!".to_string(),
                    is_truncated: false,
                },
            )])),
        }
    }

    #[test]
    fn test_normalize_email() {
        let email = normalize_email(wire_email("e1")).unwrap();
        assert_eq!(email.remote_id, "e1");
        assert_eq!(email.mailbox_id, "mb1");
        assert_eq!(email.thread_id.as_deref(), Some("t1"));
        assert_eq!(email.subject.as_deref(), Some("Hello"));
        assert_eq!(email.from_address.as_ref().unwrap().email, "alice@example.com");
        assert_eq!(email.body_text.as_deref(), Some("Hello Bob!"));
        assert!(email.is_read());
        assert!(!email.is_flagged());
        assert_eq!(email.attachments.len(), 1);
        assert_eq!(email.attachments[0].name.as_deref(), Some("report.pdf"));
        assert!(!email.attachments[0].inline);
        assert_eq!(email.size_bytes, 2048);
    }

    #[test]
    fn test_normalize_email_without_mailbox_fails() {
        let mut wire = wire_email("e1");
        wire.mailbox_ids.clear();
        assert!(matches!(
            normalize_email(wire),
            Err(EngineError::Protocol(_))
        ));
    }

    #[test]
    fn test_normalize_mailbox() {
        let mailbox = normalize_mailbox(JmapMailbox {
            id: "mb1".to_string(),
            name: "Inbox".to_string(),
            parent_id: None,
            role: Some("inbox".to_string()),
            sort_order: 1,
            total_emails: 10,
            unread_emails: 3,
        });
        assert_eq!(mailbox.remote_id, "mb1");
        assert_eq!(mailbox.role.as_deref(), Some("inbox"));
        assert_eq!(mailbox.unread_emails, 3);
    }

    #[test]
    fn test_inline_attachment_detection() {
        let part = JmapBodyPart {
            part_id: Some("p1".to_string()),
            blob_id: Some("b1".to_string()),
            size: Some(64),
            name: None,
            mime_type: Some("image/png".to_string()),
            cid: Some("logo@example.com".to_string()),
            disposition: None,
        };
        assert!(normalize_attachment(part).unwrap().inline);
    }
}
