//! The per-account sync state machine
//!
//! One tick: acquire a credential, open a session (refreshing at most
//! once on rejection), upsert mailboxes, then pull emails in batches
//! behind the stored cursor. Every batch is persisted before the cursor
//! advances, so a crash costs at most one batch of idempotent re-upserts.
//!
//! Full ticks are mutually exclusive per account. Webhook-driven
//! single-item operations may interleave with a tick because every write
//! is an idempotent upsert.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::backoff::Backoff;
use crate::config::{Credentials, EngineConfig};
use crate::error::{EngineError, Result};
use crate::jmap::{EmailQuery, RemoteMailbox, Session};
use crate::models::{Email, KEYWORD_FLAGGED, KEYWORD_SEEN, SyncCursor, SyncStatus};
use crate::store::ArchiveStore;
use crate::tokens::TokenStore;

/// Extra backoff multiplier when the provider rate-limits us.
const RATE_LIMIT_MULTIPLIER: u32 = 4;

/// Engine knobs, usually derived from [`EngineConfig`]
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub sync_interval: Duration,
    /// Static bearer credential; bypasses the token store
    pub static_token: Option<String>,
    /// Account whose stored token to use when several exist
    pub preferred_account: Option<String>,
}

impl SyncConfig {
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            sync_interval: config.sync_interval,
            static_token: match &config.credentials {
                Credentials::StaticToken(token) => Some(token.clone()),
                Credentials::OAuth { .. } => None,
            },
            preferred_account: config.account_id.clone(),
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Default, Clone)]
pub struct TickStats {
    pub account_id: String,
    pub mailboxes_upserted: usize,
    pub emails_synced: usize,
    pub batches: usize,
    pub duration_ms: u64,
}

/// Stop signal shared with the ticker thread and in-flight ticks
struct Shutdown {
    requested: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Shutdown {
    fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    /// Sleep up to `duration`; returns true when stop was requested.
    fn wait_timeout(&self, duration: Duration) -> bool {
        let guard = self.mutex.lock().unwrap();
        let (_guard, _) = self
            .condvar
            .wait_timeout_while(guard, duration, |_| !self.requested())
            .unwrap();
        self.requested()
    }
}

/// In-flight credential state for one tick
struct AuthState {
    access_token: String,
    account_id: Option<String>,
    refreshed: bool,
    can_refresh: bool,
}

/// The sync engine
///
/// Constructed once at startup and shared; no process globals. Tests
/// build their own with a scripted remote and an in-memory store.
pub struct SyncEngine {
    remote: Arc<dyn RemoteMailbox>,
    store: Arc<ArchiveStore>,
    tokens: Arc<TokenStore>,
    config: SyncConfig,
    tick_gate: Mutex<()>,
    shutdown: Shutdown,
    ticker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteMailbox>,
        store: Arc<ArchiveStore>,
        tokens: Arc<TokenStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            remote,
            store,
            tokens,
            config,
            tick_gate: Mutex::new(()),
            shutdown: Shutdown::new(),
            ticker: Mutex::new(None),
        }
    }

    /// The archive this engine writes to.
    pub fn store(&self) -> &Arc<ArchiveStore> {
        &self.store
    }

    /// Begin periodic ticks; the first runs immediately.
    pub fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().unwrap();
        if ticker.is_some() {
            return;
        }
        self.shutdown.clear();

        let engine = Arc::clone(self);
        *ticker = Some(thread::spawn(move || {
            tracing::info!(
                interval_secs = engine.config.sync_interval.as_secs(),
                "sync ticker started"
            );
            loop {
                match engine.tick() {
                    Ok(stats) => tracing::info!(
                        account_id = %stats.account_id,
                        emails = stats.emails_synced,
                        batches = stats.batches,
                        duration_ms = stats.duration_ms,
                        "tick completed"
                    ),
                    Err(EngineError::Cancelled) => {}
                    Err(EngineError::SyncInProgress) => {
                        tracing::debug!("tick skipped, a pass is already running")
                    }
                    Err(e) => tracing::warn!(error = %e, "tick failed"),
                }
                if engine.shutdown.wait_timeout(engine.config.sync_interval) {
                    break;
                }
            }
            tracing::info!("sync ticker stopped");
        }));
    }

    /// Halt the ticker and wait for any in-flight tick to finish.
    pub fn stop(&self) {
        self.shutdown.request();
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            let _ = handle.join();
        }
        // An externally triggered tick may still be draining.
        if let Ok(gate) = self.tick_gate.lock() {
            drop(gate);
        }
    }

    /// One full pass for the configured account.
    ///
    /// Rejected with [`EngineError::SyncInProgress`] while another full
    /// tick is in flight.
    pub fn tick(&self) -> Result<TickStats> {
        let _gate = self
            .tick_gate
            .try_lock()
            .map_err(|_| EngineError::SyncInProgress)?;

        let start = Instant::now();
        let mut auth = self.acquire_auth()?;

        let mut session = match self.open_session_checked(&mut auth) {
            Ok(session) => session,
            Err(e) => {
                if let Some(account_id) = &auth.account_id
                    && !matches!(e, EngineError::Cancelled)
                {
                    let _ = self.store.record_error(account_id, &e.to_string());
                }
                return Err(e);
            }
        };

        let account_id = session.account_id.clone();
        let cursor = match self.store.get_cursor(&account_id)? {
            Some(cursor) => cursor,
            None => self.store.initialize_cursor(&account_id)?,
        };
        self.store
            .set_cursor_status(&account_id, SyncStatus::Syncing)?;
        tracing::debug!(
            account_id = %account_id,
            since = cursor.last_sync_token.as_deref().unwrap_or("<start>"),
            "tick starting"
        );

        match self.pull(&mut auth, &mut session, &account_id, cursor.last_sync_token) {
            Ok(mut stats) => {
                stats.account_id = account_id;
                stats.duration_ms = start.elapsed().as_millis() as u64;
                Ok(stats)
            }
            Err(EngineError::Cancelled) => {
                // Clean abort: the cursor keeps its last durable value
                // and no error is recorded.
                let _ = self.store.set_cursor_status(&account_id, SyncStatus::Idle);
                Err(EngineError::Cancelled)
            }
            Err(e) => {
                let _ = self.store.record_error(&account_id, &e.to_string());
                Err(e)
            }
        }
    }

    /// Webhook path: fetch one email and upsert it.
    ///
    /// An email the provider no longer knows is tombstoned, since the
    /// notification may have raced its deletion.
    pub fn sync_one(&self, remote_email_id: &str) -> Result<Option<Email>> {
        let mut auth = self.acquire_auth()?;
        let mut session = self.open_session_checked(&mut auth)?;

        let fetched = self.call_remote(&mut auth, &mut session, |remote, s| {
            remote.get_email(s, remote_email_id)
        })?;

        match fetched {
            Some(email) => {
                let written = self.with_retries(|| self.store.upsert_email(&email))?;
                tracing::debug!(remote_id = remote_email_id, "synced single email");
                Ok(Some(written))
            }
            None => {
                self.with_retries(|| self.store.tombstone_email(remote_email_id))?;
                tracing::debug!(remote_id = remote_email_id, "email gone upstream, tombstoned");
                Ok(None)
            }
        }
    }

    /// Webhook path: soft-delete without touching the remote.
    pub fn mark_deleted(&self, remote_email_id: &str) -> Result<bool> {
        self.with_retries(|| self.store.tombstone_email(remote_email_id))
    }

    /// Clear (or pin) an account's cursor for a full re-pull.
    pub fn reset(&self, account_id: &str, cursor: Option<&str>) -> Result<SyncCursor> {
        tracing::info!(account_id, pinned = cursor.is_some(), "cursor reset");
        self.store.reset_cursor(account_id, cursor)
    }

    /// Push a read/unread change to the provider and archive the result.
    pub fn set_read(&self, remote_email_id: &str, read: bool) -> Result<Email> {
        self.push_flags(remote_email_id, BTreeMap::from([(KEYWORD_SEEN.to_string(), read)]))
    }

    /// Push a flagged change to the provider and archive the result.
    pub fn set_flagged(&self, remote_email_id: &str, flagged: bool) -> Result<Email> {
        self.push_flags(
            remote_email_id,
            BTreeMap::from([(KEYWORD_FLAGGED.to_string(), flagged)]),
        )
    }

    fn push_flags(&self, remote_email_id: &str, flags: BTreeMap<String, bool>) -> Result<Email> {
        let mut auth = self.acquire_auth()?;
        let mut session = self.open_session_checked(&mut auth)?;

        let updated = self.call_remote(&mut auth, &mut session, |remote, s| {
            remote.set_flags(s, remote_email_id, &flags)
        })?;
        self.with_retries(|| self.store.upsert_email(&updated))
    }

    /// Mailboxes first, then the batched email loop.
    fn pull(
        &self,
        auth: &mut AuthState,
        session: &mut Session,
        account_id: &str,
        mut since: Option<String>,
    ) -> Result<TickStats> {
        let mailboxes =
            self.call_remote(auth, session, |remote, s| remote.list_mailboxes(s))?;
        for mailbox in &mailboxes {
            self.with_retries(|| self.store.upsert_mailbox(mailbox))?;
        }

        let mut stats = TickStats {
            mailboxes_upserted: mailboxes.len(),
            ..TickStats::default()
        };

        loop {
            if self.shutdown.requested() {
                return Err(EngineError::Cancelled);
            }

            let query = EmailQuery {
                since_state: since.clone(),
                mailbox_filter: None,
                limit: self.config.batch_size,
            };
            let page =
                self.call_remote(auth, session, |remote, s| remote.query_emails(s, &query))?;

            if page.ids.is_empty() {
                if since.as_deref() == Some(page.next_state.as_str()) {
                    // No new work; the cursor stays where it was.
                    break;
                }
                // State moved without new emails (e.g. backfill handoff
                // to the changes feed).
                self.with_retries(|| {
                    self.store
                        .advance_cursor(account_id, &page.next_state, 0, SyncStatus::Syncing)
                })?;
                since = Some(page.next_state);
                continue;
            }

            let emails =
                self.call_remote(auth, session, |remote, s| remote.get_emails(s, &page.ids))?;
            let report = self.with_retries(|| self.store.upsert_emails(&emails))?;
            for failure in &report.failed {
                tracing::warn!(
                    remote_id = %failure.remote_id,
                    error = %failure.error,
                    "email skipped during batch upsert"
                );
            }

            let final_batch = page.ids.len() < self.config.batch_size;
            let status = if final_batch {
                SyncStatus::Completed
            } else {
                SyncStatus::Syncing
            };
            self.with_retries(|| {
                self.store.advance_cursor(
                    account_id,
                    &page.next_state,
                    report.written.len(),
                    status,
                )
            })?;

            stats.emails_synced += report.written.len();
            stats.batches += 1;
            since = Some(page.next_state);

            if final_batch {
                break;
            }
        }

        // The final advance marks completion; the empty-page exits land
        // here still marked syncing.
        self.store
            .set_cursor_status(account_id, SyncStatus::Completed)?;

        Ok(stats)
    }

    /// Resolve the credential for this pass, refreshing ahead of use
    /// when the stored token is about to expire.
    fn acquire_auth(&self) -> Result<AuthState> {
        if let Some(token) = &self.config.static_token {
            return Ok(AuthState {
                access_token: token.clone(),
                account_id: None,
                refreshed: false,
                can_refresh: false,
            });
        }

        let account_id = match &self.config.preferred_account {
            Some(account) => account.clone(),
            None => self
                .tokens
                .accounts()?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    EngineError::AuthFailure("no credential stored for any account".to_string())
                })?,
        };

        let mut token = self.tokens.get(&account_id)?.ok_or_else(|| {
            EngineError::AuthFailure(format!("no credential stored for account {}", account_id))
        })?;

        let mut refreshed = false;
        if TokenStore::needs_refresh(&token) && self.tokens.can_refresh() {
            token = self.tokens.refresh(&account_id)?;
            refreshed = true;
        }

        Ok(AuthState {
            access_token: token.access_token,
            account_id: Some(account_id),
            refreshed,
            can_refresh: self.tokens.can_refresh(),
        })
    }

    /// Open the session, allowing the single refresh-then-retry on a
    /// rejected credential. A second rejection is an auth failure.
    fn open_session_checked(&self, auth: &mut AuthState) -> Result<Session> {
        match self.with_retries(|| self.remote.open_session(&auth.access_token)) {
            Err(EngineError::Unauthorized(why)) => {
                self.refresh_auth(auth, &why)
                    .map_err(escalate_unauthorized)?;
                self.with_retries(|| self.remote.open_session(&auth.access_token))
                    .map_err(escalate_unauthorized)
            }
            other => other,
        }
    }

    /// Run a remote call with transient retries; on a rejected
    /// credential, refresh once, reopen the session, and retry.
    fn call_remote<T>(
        &self,
        auth: &mut AuthState,
        session: &mut Session,
        op: impl Fn(&dyn RemoteMailbox, &Session) -> Result<T>,
    ) -> Result<T> {
        match self.with_retries(|| op(self.remote.as_ref(), session)) {
            Err(EngineError::Unauthorized(why)) => {
                self.refresh_auth(auth, &why)
                    .map_err(escalate_unauthorized)?;
                *session = self
                    .with_retries(|| self.remote.open_session(&auth.access_token))
                    .map_err(escalate_unauthorized)?;
                self.with_retries(|| op(self.remote.as_ref(), session))
                    .map_err(escalate_unauthorized)
            }
            other => other,
        }
    }

    /// At most one refresh per pass; anything further is an auth
    /// failure needing operator attention.
    fn refresh_auth(&self, auth: &mut AuthState, why: &str) -> Result<()> {
        if auth.refreshed || !auth.can_refresh {
            return Err(EngineError::AuthFailure(why.to_string()));
        }
        let account_id = auth.account_id.clone().ok_or_else(|| {
            EngineError::AuthFailure(format!("{} (static credential, cannot refresh)", why))
        })?;

        let fresh = self.tokens.refresh(&account_id)?;
        auth.access_token = fresh.access_token;
        auth.refreshed = true;
        Ok(())
    }

    /// Retry transient failures with exponential backoff. Cancellation
    /// during a backoff wait aborts cleanly.
    fn with_retries<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut backoff = Backoff::new(self.config.retry_delay);
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let mut delay = backoff.delay();
                    if e.is_rate_limit() {
                        delay *= RATE_LIMIT_MULTIPLIER;
                    }
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, backing off"
                    );
                    if self.shutdown.wait_timeout(delay) {
                        return Err(EngineError::Cancelled);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn escalate_unauthorized(err: EngineError) -> EngineError {
    match err {
        EngineError::Unauthorized(why) => EngineError::AuthFailure(why),
        other => other,
    }
}
