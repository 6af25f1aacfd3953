use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use measurements_api::auth::Authenticator;
use measurements_api::config::{redact_url, Config, StorageBackend};
use measurements_api::metrics;
use measurements_api::model::Role;
use measurements_api::password::PasswordHasher;
use measurements_api::rate_limit::{InMemoryRateLimiter, RateLimitConfig};
use measurements_api::rest::{self, AppState};
use measurements_api::store::{make_pool, MemoryStore, PgStore, Store};
use measurements_api::token::TokenIssuer;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;

    info!("Starting measurements API");
    info!("HTTP server: {}", config.http_addr);
    info!("Storage: {:?}", config.storage);

    metrics::init_metrics();

    let store: Arc<dyn Store> = match config.storage {
        StorageBackend::Postgres => {
            info!("Database: {}", redact_url(&config.database_url));
            let pool = make_pool(&config.database_url, config.db_max_connections)
                .await
                .context("Failed to connect to database")?;
            Arc::new(PgStore::new(pool))
        }
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    };

    let limiter = InMemoryRateLimiter::new(RateLimitConfig {
        max_attempts: config.login_max_attempts,
        window: config.login_window,
        ..RateLimitConfig::default()
    });
    let auth = Authenticator::new(
        store.clone(),
        PasswordHasher::new(config.bcrypt_cost, &config.password_pepper),
        TokenIssuer::new(
            config.secret_key.as_bytes(),
            chrono::Duration::minutes(config.token_ttl_minutes),
        ),
        Arc::new(limiter),
    )?;

    if let Some((username, password)) = &config.bootstrap_admin {
        if store.get_user(username).await?.is_none() {
            auth.provision_user(username, password, Role::Admin).await?;
        } else {
            info!("Bootstrap admin {} already exists", username);
        }
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(AppState::new(store, auth)));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")?;

    info!("Shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
