use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnel_auth::{config::Config, MultiTokenVerifier, SessionRegistry, TokenStore};

/// How often the token count is logged while running
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "tunnel-auth starting");

    // Load configuration
    let config = Config::load()?;
    info!(
        region = %config.store.region,
        endpoints = ?config.store.endpoints,
        scopes = ?config.auth.additional_scopes,
        "Loaded configuration"
    );

    // Connect the token store and hook session teardown to invalidations
    let store = Arc::new(TokenStore::connect(&config.store).await?);
    let sessions = SessionRegistry::new();
    store.set_token_invalid_callback(sessions.invalidation_callback());

    let verifier = MultiTokenVerifier::new(
        Arc::clone(&store),
        config.auth.additional_scopes.iter().copied(),
    );
    info!(
        tokens = verifier.store().token_count(),
        valid = verifier.store().valid_tokens().len(),
        "Token store ready"
    );

    let status_handle = {
        let store = Arc::clone(&store);
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATUS_INTERVAL);
            loop {
                interval.tick().await;
                info!(
                    tokens = store.token_count(),
                    sessions = sessions.len(),
                    "Token store status"
                );
            }
        })
    };

    shutdown_signal().await;

    info!("Shutting down");
    status_handle.abort();
    store.close();

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
