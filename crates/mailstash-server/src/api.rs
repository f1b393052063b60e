//! Change listener and status endpoints
//!
//! The listener authenticates provider notifications and translates them
//! into engine operations; it never mutates archive state directly.
//! Engine calls are blocking, so handlers bridge through spawn_blocking.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use mailstash::{EngineError, SyncCursor, SyncEngine};

use crate::error::ServerError;
use crate::signature::verify_signature;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub webhook_secret: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/{provider}", post(webhook))
        .route("/sync/trigger", post(sync_trigger))
        .route("/sync/status", get(sync_status))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "change listener ready");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// Accepted webhook envelope
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    email_id: Option<String>,
    #[serde(default)]
    mailbox_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    changes: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WebhookAck {
    status: &'static str,
    event: String,
}

async fn webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ServerError> {
    let header = headers
        .get("signature")
        .and_then(|v| v.to_str().ok());
    verify_signature(state.webhook_secret.as_deref(), header, &body)?;

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| ServerError::BadRequest(format!("malformed event: {}", e)))?;

    info!(
        provider = %provider,
        event = %event.kind,
        account_id = event.account_id.as_deref().unwrap_or(""),
        email_id = event.email_id.as_deref().unwrap_or(""),
        mailbox_id = event.mailbox_id.as_deref().unwrap_or(""),
        "webhook event received"
    );

    let engine = state.engine.clone();
    let kind = event.kind.clone();
    match event.kind.as_str() {
        "email.received" | "email.updated" => {
            let email_id = required(event.email_id, "emailId")?;
            run_blocking(move || engine.sync_one(&email_id).map(|_| ())).await?;
        }
        "email.deleted" => {
            let email_id = required(event.email_id, "emailId")?;
            run_blocking(move || engine.mark_deleted(&email_id).map(|_| ())).await?;
        }
        "mailbox.updated" => {
            // Counts may have drifted; run a full pass. A pass already
            // in flight will pick the change up anyway.
            match run_blocking(move || engine.tick().map(|_| ())).await {
                Err(ServerError::Engine(EngineError::SyncInProgress)) => {}
                other => other?,
            }
        }
        other => {
            // Forward compatibility: acknowledge events we do not know.
            warn!(event = %other, "ignoring unknown webhook event type");
        }
    }

    Ok(Json(WebhookAck {
        status: "ok",
        event: kind,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct TriggerRequest {
    #[serde(default)]
    force: bool,
    #[serde(default)]
    account_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    emails_synced: usize,
    batches: usize,
    duration_ms: u64,
}

async fn sync_trigger(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<TriggerResponse>, ServerError> {
    let request: TriggerRequest = if body.is_empty() {
        TriggerRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ServerError::BadRequest(format!("malformed trigger request: {}", e)))?
    };

    let engine = state.engine.clone();
    let stats = run_blocking(move || {
        if request.force {
            match &request.account_id {
                Some(account_id) => {
                    engine.reset(account_id, None)?;
                }
                None => {
                    for cursor in engine.store().list_cursors()? {
                        engine.reset(&cursor.account_id, None)?;
                    }
                }
            }
        }
        engine.tick()
    })
    .await?;

    Ok(Json(TriggerResponse {
        emails_synced: stats.emails_synced,
        batches: stats.batches,
        duration_ms: stats.duration_ms,
    }))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(default)]
    account_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum StatusResponse {
    One(SyncCursor),
    All(Vec<SyncCursor>),
}

async fn sync_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ServerError> {
    let engine = state.engine.clone();
    let account_id = query.account_id.clone();
    let response = run_blocking(move || match &account_id {
        Some(account_id) => Ok(engine.store().get_cursor(account_id)?.map(StatusResponse::One)),
        None => Ok(Some(StatusResponse::All(engine.store().list_cursors()?))),
    })
    .await?;

    response.map(Json).ok_or_else(|| {
        ServerError::NotFound(format!(
            "no sync cursor for account {:?}",
            query.account_id.as_deref().unwrap_or("")
        ))
    })
}

async fn health(
    State(state): State<AppState>,
) -> Result<Json<mailstash::HealthReport>, ServerError> {
    let engine = state.engine.clone();
    let report = run_blocking(move || engine.store().health()).await?;
    Ok(Json(report))
}

fn required(value: Option<String>, field: &str) -> Result<String, ServerError> {
    value.ok_or_else(|| ServerError::BadRequest(format!("event is missing {}", field)))
}

/// Engine calls block on HTTP and SQLite; keep them off the runtime.
async fn run_blocking<T: Send + 'static>(
    op: impl FnOnce() -> mailstash::Result<T> + Send + 'static,
) -> Result<T, ServerError> {
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| ServerError::Engine(EngineError::StoreUnavailable(e.to_string())))?
        .map_err(ServerError::from)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use mailstash::{
        ArchiveStore, Email, EmailQuery, EmailPage, Mailbox, RemoteMailbox, SearchFilters,
        SearchSort, Session, SyncConfig, SyncEngine, Thread, ThreadPage, ThreadQuery, TokenCipher,
        TokenStore,
    };

    use super::*;
    use crate::signature::sign;

    const SECRET: &str = "test-webhook-secret";

    /// The webhook tests never reach the provider; every call fails.
    struct OfflineRemote;

    impl RemoteMailbox for OfflineRemote {
        fn open_session(&self, _token: &str) -> mailstash::Result<Session> {
            Err(EngineError::Network("offline".into()))
        }
        fn list_mailboxes(&self, _s: &Session) -> mailstash::Result<Vec<Mailbox>> {
            Err(EngineError::Network("offline".into()))
        }
        fn query_emails(&self, _s: &Session, _q: &EmailQuery) -> mailstash::Result<EmailPage> {
            Err(EngineError::Network("offline".into()))
        }
        fn get_emails(&self, _s: &Session, _ids: &[String]) -> mailstash::Result<Vec<Email>> {
            Err(EngineError::Network("offline".into()))
        }
        fn get_email(&self, _s: &Session, _id: &str) -> mailstash::Result<Option<Email>> {
            Err(EngineError::Network("offline".into()))
        }
        fn list_threads(&self, _s: &Session, _q: &ThreadQuery) -> mailstash::Result<ThreadPage> {
            Err(EngineError::Network("offline".into()))
        }
        fn get_threads(&self, _s: &Session, _ids: &[String]) -> mailstash::Result<Vec<Thread>> {
            Err(EngineError::Network("offline".into()))
        }
        fn set_flags(
            &self,
            _s: &Session,
            _id: &str,
            _flags: &BTreeMap<String, bool>,
        ) -> mailstash::Result<Email> {
            Err(EngineError::Network("offline".into()))
        }
    }

    fn test_state() -> AppState {
        let store = Arc::new(ArchiveStore::in_memory().unwrap());
        let tokens = Arc::new(TokenStore::new(
            store.clone(),
            TokenCipher::new([3u8; 32]),
            None,
        ));
        let config = SyncConfig {
            batch_size: 10,
            max_retries: 0,
            retry_delay: std::time::Duration::from_millis(1),
            sync_interval: std::time::Duration::from_secs(600),
            static_token: Some("token".to_string()),
            preferred_account: None,
        };
        let engine = Arc::new(SyncEngine::new(
            Arc::new(OfflineRemote),
            store,
            tokens,
            config,
        ));
        AppState {
            engine,
            webhook_secret: Some(SECRET.to_string()),
        }
    }

    fn seed_email(state: &AppState, remote_id: &str, subject: &str) {
        let mut email = Email::new(remote_id, "mb1");
        email.subject = Some(subject.to_string());
        email.body_text = Some("body".to_string());
        state.engine.store().upsert_email(&email).unwrap();
    }

    fn signed_post(path: &str, body: &str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("signature", signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_webhook_delete_tombstones() {
        let state = test_state();
        seed_email(&state, "e2", "privacy report");
        let router = build_router(state.clone());

        let body = r#"{"type":"email.deleted","accountId":"acc1","emailId":"e2"}"#;
        let request = signed_post("/webhook/jmap", body, Some(sign(SECRET, body.as_bytes())));
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let email = state
            .engine
            .store()
            .get_email_by_remote_id("e2")
            .unwrap()
            .unwrap();
        assert!(email.is_deleted);

        // Tombstoned emails disappear from search results.
        let hits = state
            .engine
            .store()
            .search("privacy", &SearchFilters::default(), SearchSort::Rank, 10, 0)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_webhook_bad_signature_rejected() {
        let state = test_state();
        seed_email(&state, "e2", "untouched");
        let router = build_router(state.clone());

        let body = r#"{"type":"email.deleted","accountId":"acc1","emailId":"e2"}"#;
        let mut signature = sign(SECRET, body.as_bytes());
        signature.truncate(signature.len() - 2);
        signature.push_str("ff");

        let response = router
            .oneshot(signed_post("/webhook/jmap", body, Some(signature)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // No state change happened.
        let email = state
            .engine
            .store()
            .get_email_by_remote_id("e2")
            .unwrap()
            .unwrap();
        assert!(!email.is_deleted);
    }

    #[tokio::test]
    async fn test_webhook_missing_signature_rejected() {
        let state = test_state();
        let router = build_router(state);

        let body = r#"{"type":"email.received","emailId":"e1"}"#;
        let response = router
            .oneshot(signed_post("/webhook/jmap", body, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_missing_secret_fails_closed() {
        let mut state = test_state();
        state.webhook_secret = None;
        let router = build_router(state);

        let body = r#"{"type":"email.received","emailId":"e1"}"#;
        let request = signed_post("/webhook/jmap", body, Some(sign(SECRET, body.as_bytes())));
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_unknown_event_acknowledged() {
        let state = test_state();
        let router = build_router(state);

        let body = r#"{"type":"calendar.updated","accountId":"acc1"}"#;
        let request = signed_post("/webhook/jmap", body, Some(sign(SECRET, body.as_bytes())));
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_sync_status_lists_cursors() {
        let state = test_state();
        state.engine.store().initialize_cursor("acc1").unwrap();
        let router = build_router(state);

        let request = Request::builder()
            .uri("/sync/status")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let cursors: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0]["account_id"], "acc1");
    }

    #[tokio::test]
    async fn test_sync_status_unknown_account_is_404() {
        let state = test_state();
        let router = build_router(state);

        let request = Request::builder()
            .uri("/sync/status?account_id=ghost")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = test_state();
        let router = build_router(state);

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let report: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(report["status"], "HEALTHY");
    }
}
