//! Stockroom API server

use std::sync::Arc;

use anyhow::Context;
use axum::http::HeaderValue;
use stockroom_api::{create_router, AppState, Config};
use stockroom_billing::{BillingService, PgUserStore, UserStore};
use stockroom_shared::{create_pool, run_migrations};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "stockroom_api=info,stockroom_billing=info,tower_http=info";

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_json);

    tracing::info!(
        bind_address = %config.bind_address,
        enable_billing = config.enable_billing,
        "Starting Stockroom API"
    );

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let users: Arc<dyn UserStore> = Arc::new(PgUserStore::new(pool.clone()));

    let billing = if config.enable_billing {
        Some(BillingService::from_env(pool.clone()).context("Failed to configure billing")?)
    } else {
        tracing::warn!("Billing disabled; billing routes are not mounted");
        None
    };

    let cors = CorsLayer::new()
        .allow_origin(
            config
                .public_url
                .parse::<HeaderValue>()
                .context("PUBLIC_URL is not a valid origin")?,
        )
        .allow_methods(Any)
        .allow_headers(Any);

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, pool, users, billing);

    let app = create_router(state)
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
