mod api;
mod error;
mod signature;

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mailstash::{
    ArchiveStore, Credentials, EngineConfig, JmapClient, RefreshEndpoint, SyncConfig, SyncEngine,
    TokenCipher, TokenStore,
};

use crate::api::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    info!("starting mailstash v{}", env!("CARGO_PKG_VERSION"));

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "fatal configuration error");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "fatal runtime error");
            ExitCode::from(2)
        }
    }
}

async fn run(config: EngineConfig) -> anyhow::Result<()> {
    let store = Arc::new(ArchiveStore::open_url(&config.store_url)?);
    info!(store_url = %config.store_url, "archive store opened");

    let refresh_endpoint = match &config.credentials {
        Credentials::OAuth {
            client_id,
            client_secret,
            token_url,
        } => Some(RefreshEndpoint {
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            token_url: token_url.clone(),
        }),
        Credentials::StaticToken(_) => None,
    };

    let tokens = Arc::new(TokenStore::new(
        store.clone(),
        TokenCipher::new(config.encryption_key),
        refresh_endpoint,
    ));

    let remote = Arc::new(JmapClient::new(config.session_url.clone()));
    let engine = Arc::new(SyncEngine::new(
        remote,
        store,
        tokens,
        SyncConfig::from_engine_config(&config),
    ));

    engine.start();

    let state = AppState {
        engine: engine.clone(),
        webhook_secret: config.webhook_secret.clone(),
    };

    let result = tokio::select! {
        result = api::serve(state, config.webhook_port) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
            Ok(())
        }
    };

    // Let the in-flight tick finish its batch before the process exits.
    let engine_for_stop = engine.clone();
    tokio::task::spawn_blocking(move || engine_for_stop.stop()).await?;

    result
}
