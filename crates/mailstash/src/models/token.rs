//! OAuth token model
//!
//! This is the decrypted, in-memory shape. The token store encrypts the
//! access and refresh tokens before they reach the archive; plaintext is
//! never persisted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// An OAuth credential for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OauthToken {
    pub account_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OauthToken {
    /// Create a bearer token for an account.
    pub fn new(account_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            account_id: account_id.into(),
            access_token: access_token.into(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_at: None,
            scope: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the token expires within the given window. Tokens
    /// without an expiry never need a refresh.
    pub fn expires_within(&self, window: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= Utc::now() + window,
            None => false,
        }
    }
}
