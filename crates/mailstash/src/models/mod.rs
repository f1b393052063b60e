//! Domain models for the mailbox archive
//!
//! Tagged records mirroring the archive schema: mailboxes, emails,
//! threads, per-account sync cursors, and OAuth tokens. Adapter functions
//! in the JMAP module translate the provider's wire shapes into these.

mod cursor;
mod email;
mod mailbox;
mod thread;
mod token;

pub use cursor::{SyncCursor, SyncStatus};
pub use email::{Attachment, Email, EmailAddress, KEYWORD_FLAGGED, KEYWORD_SEEN};
pub use mailbox::Mailbox;
pub use thread::Thread;
pub use token::OauthToken;
