//! OAuth token store
//!
//! Durable, confidential credential storage. Tokens are encrypted before
//! they reach the archive and decrypted on the way out; plaintext exists
//! only in memory. Refresh goes through the external authorization
//! endpoint, and a failed refresh leaves the previous row intact.

mod crypto;

pub use crypto::TokenCipher;

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::models::OauthToken;
use crate::store::{ArchiveStore, TokenRow};

/// Tokens expiring within this window are refreshed ahead of use.
const REFRESH_WINDOW_MINUTES: i64 = 5;

/// The external OAuth token endpoint used for refresh grants
#[derive(Debug, Clone)]
pub struct RefreshEndpoint {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

/// Token response from the authorization endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Encrypted credential store for OAuth tokens
pub struct TokenStore {
    store: Arc<ArchiveStore>,
    cipher: TokenCipher,
    refresh_endpoint: Option<RefreshEndpoint>,
}

impl TokenStore {
    pub fn new(
        store: Arc<ArchiveStore>,
        cipher: TokenCipher,
        refresh_endpoint: Option<RefreshEndpoint>,
    ) -> Self {
        Self {
            store,
            cipher,
            refresh_endpoint,
        }
    }

    /// Whether a refresh grant can be attempted at all.
    pub fn can_refresh(&self) -> bool {
        self.refresh_endpoint.is_some()
    }

    /// Encrypt and upsert a token; an existing row for the account is
    /// replaced. Returns the canonical stored token.
    pub fn put(&self, token: &OauthToken) -> Result<OauthToken> {
        let row = TokenRow {
            account_id: token.account_id.clone(),
            access_token: self.cipher.encrypt(&token.access_token)?,
            refresh_token: token
                .refresh_token
                .as_deref()
                .map(|rt| self.cipher.encrypt(rt))
                .transpose()?,
            token_type: token.token_type.clone(),
            expires_at: token.expires_at,
            scope: token.scope.clone(),
            created_at: token.created_at,
            updated_at: token.updated_at,
        };
        self.store.put_token_row(&row)?;
        self.get(&token.account_id)?
            .ok_or_else(|| EngineError::StoreUnavailable("token row vanished after put".into()))
    }

    /// Fetch and decrypt the token for an account. Absence is not an
    /// error.
    pub fn get(&self, account_id: &str) -> Result<Option<OauthToken>> {
        let Some(row) = self.store.get_token_row(account_id)? else {
            return Ok(None);
        };

        Ok(Some(OauthToken {
            account_id: row.account_id,
            access_token: self.cipher.decrypt(&row.access_token)?,
            refresh_token: row
                .refresh_token
                .as_deref()
                .map(|ct| self.cipher.decrypt(ct))
                .transpose()?,
            token_type: row.token_type,
            expires_at: row.expires_at,
            scope: row.scope,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }

    /// Remove the stored token. Idempotent.
    pub fn delete(&self, account_id: &str) -> Result<()> {
        self.store.delete_token_row(account_id)
    }

    /// Accounts with stored credentials, oldest first.
    pub fn accounts(&self) -> Result<Vec<String>> {
        self.store.list_token_accounts()
    }

    /// True when the token expires within the refresh window.
    pub fn needs_refresh(token: &OauthToken) -> bool {
        token.expires_within(Duration::minutes(REFRESH_WINDOW_MINUTES))
    }

    /// Exchange the stored refresh token for a fresh credential and
    /// atomically replace the stored row.
    pub fn refresh(&self, account_id: &str) -> Result<OauthToken> {
        let endpoint = self.refresh_endpoint.as_ref().ok_or_else(|| {
            EngineError::Config("OAuth refresh requested but no token endpoint configured".into())
        })?;

        let current = self.get(account_id)?.ok_or_else(|| {
            EngineError::AuthFailure(format!("no stored token for account {}", account_id))
        })?;
        let refresh_token = current.refresh_token.clone().ok_or_else(|| {
            EngineError::AuthFailure(format!("account {} has no refresh token", account_id))
        })?;

        tracing::info!(account_id, "refreshing access token");
        let mut response = ureq::post(&endpoint.token_url)
            .send_form([
                ("client_id", endpoint.client_id.as_str()),
                ("client_secret", endpoint.client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .map_err(map_refresh_error)?;

        let fresh: TokenResponse = response
            .body_mut()
            .read_json()
            .map_err(|e| EngineError::Protocol(format!("malformed token response: {}", e)))?;

        let now = Utc::now();
        let replacement = OauthToken {
            account_id: account_id.to_string(),
            access_token: fresh.access_token,
            // Providers often omit the refresh token on refresh; keep
            // the one we have.
            refresh_token: fresh.refresh_token.or(Some(refresh_token)),
            token_type: fresh.token_type.unwrap_or(current.token_type),
            expires_at: fresh
                .expires_in
                .map(|secs| now + Duration::seconds(secs as i64)),
            scope: fresh.scope.or(current.scope),
            created_at: current.created_at,
            updated_at: now,
        };

        self.put(&replacement)
    }
}

fn map_refresh_error(err: ureq::Error) -> EngineError {
    match err {
        ureq::Error::StatusCode(code) if (400..500).contains(&code) => {
            EngineError::Unauthorized(format!("token refresh rejected: HTTP {}", code))
        }
        ureq::Error::StatusCode(code) => {
            EngineError::Network(format!("token endpoint returned HTTP {}", code))
        }
        other => EngineError::Network(format!("token refresh failed: {}", other)),
    }
}
