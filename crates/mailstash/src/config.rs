//! Engine configuration loaded from the environment
//!
//! Required keys missing or malformed produce [`EngineError::Config`],
//! which the server binary treats as fatal (exit code 1).

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{EngineError, Result};

/// Default ticker period in minutes.
const DEFAULT_SYNC_INTERVAL_MINUTES: u64 = 15;
/// Default number of emails pulled per batch.
const DEFAULT_BATCH_SIZE: usize = 100;
/// Default transient retry count per tick step.
const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default initial backoff in milliseconds.
const DEFAULT_RETRY_DELAY_MS: u64 = 5000;
/// Default webhook listener port.
const DEFAULT_WEBHOOK_PORT: u16 = 8080;

/// How the engine authenticates to the remote mail service.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// A static bearer token supplied directly via the environment.
    StaticToken(String),
    /// OAuth client credentials; access tokens live in the token store
    /// and are refreshed against the external authorization endpoint.
    OAuth {
        client_id: String,
        client_secret: String,
        token_url: String,
    },
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// JMAP session resource URL.
    pub session_url: String,
    /// Remote credential source.
    pub credentials: Credentials,
    /// Archive database location (a path, or a `sqlite:` URL).
    pub store_url: String,
    /// 32-byte AES-256-GCM key for token confidentiality.
    pub encryption_key: [u8; 32],
    /// Preferred account when the token store holds several rows.
    pub account_id: Option<String>,
    /// Ticker period.
    pub sync_interval: Duration,
    /// Emails per pull.
    pub batch_size: usize,
    /// Transient retries per tick step.
    pub max_retries: u32,
    /// Initial backoff delay.
    pub retry_delay: Duration,
    /// Shared secret for webhook signature verification. Absent means the
    /// webhook endpoint fails closed with 401.
    pub webhook_secret: Option<String>,
    /// Webhook listener port.
    pub webhook_port: u16,
}

impl EngineConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let session_url = require("MAIL_SESSION_URL")?;
        let store_url = require("STORE_URL")?;

        let credentials = Self::credentials_from_env()?;

        let encryption_key = decode_key(&require("ENCRYPTION_KEY")?)?;

        let sync_interval = Duration::from_secs(
            60 * parse_or("SYNC_INTERVAL_MINUTES", DEFAULT_SYNC_INTERVAL_MINUTES)?,
        );
        let batch_size = parse_or("BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        let max_retries = parse_or("MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        let retry_delay =
            Duration::from_millis(parse_or("RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS)?);
        let webhook_port = parse_or("WEBHOOK_PORT", DEFAULT_WEBHOOK_PORT)?;

        let webhook_secret = optional("WEBHOOK_SECRET");
        if webhook_secret.is_none() {
            tracing::warn!(
                "WEBHOOK_SECRET is not set; webhook requests will be rejected with 401"
            );
        }

        Ok(Self {
            session_url,
            credentials,
            store_url,
            encryption_key,
            account_id: optional("MAIL_ACCOUNT_ID"),
            sync_interval,
            batch_size,
            max_retries,
            retry_delay,
            webhook_secret,
            webhook_port,
        })
    }

    fn credentials_from_env() -> Result<Credentials> {
        if let Some(token) = optional("REMOTE_API_TOKEN") {
            return Ok(Credentials::StaticToken(token));
        }

        match (
            optional("OAUTH_CLIENT_ID"),
            optional("OAUTH_CLIENT_SECRET"),
            optional("OAUTH_TOKEN_URL"),
        ) {
            (Some(client_id), Some(client_secret), Some(token_url)) => Ok(Credentials::OAuth {
                client_id,
                client_secret,
                token_url,
            }),
            (None, None, None) => Err(EngineError::Config(
                "set REMOTE_API_TOKEN, or OAUTH_CLIENT_ID + OAUTH_CLIENT_SECRET + OAUTH_TOKEN_URL"
                    .to_string(),
            )),
            _ => Err(EngineError::Config(
                "incomplete OAuth credentials: OAUTH_CLIENT_ID, OAUTH_CLIENT_SECRET and \
                 OAUTH_TOKEN_URL must all be set"
                    .to_string(),
            )),
        }
    }
}

/// Decode a base64 `ENCRYPTION_KEY` into a 32-byte AES-256 key.
fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| EngineError::Config(format!("ENCRYPTION_KEY is not valid base64: {}", e)))?;

    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        EngineError::Config(format!(
            "ENCRYPTION_KEY must decode to 32 bytes, got {}",
            bytes.len()
        ))
    })
}

fn require(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngineError::Config(format!("{} environment variable not set", key)))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| EngineError::Config(format!("{} has invalid value {:?}", key, raw))),
        _ => Ok(default),
    }
}
