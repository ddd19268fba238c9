mod cache;
mod config;
mod db;
mod error;
mod middleware;
mod repository;
mod routes;
mod schemas;
mod services;
mod state;

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::{middleware::from_fn_with_state, Router};
use config::AppConfig;
use middleware::api_key::enforce_api_key;
use middleware::cors::build_cors_layer;
use middleware::request_id::inject_request_id;
use services::extension_alerts::reload_open_requests;
use services::realtime::{run_pg_listener, Subscription};
use state::AppState;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::GovernorLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::from_env();
    let state = AppState::build(config)?;

    if state.config.is_production() && state.config.internal_api_key.is_none() {
        tracing::warn!("INTERNAL_API_KEY is not set, analytics routes are unauthenticated");
    }
    if state.db_pool.is_none() {
        tracing::warn!("DATABASE_URL is not set, analytics routes will return 503");
    }

    let extension_alerts = start_extension_alerts(&state).await;

    let mut app = Router::new()
        .nest(&state.config.api_prefix, routes::v1_router())
        .layer(from_fn_with_state(state.clone(), enforce_api_key))
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024)) // 2 MB
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            Duration::from_secs(state.config.request_timeout_seconds),
        ))
        .layer(axum::middleware::from_fn(inject_request_id))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(&state.config))
        .with_state(state.clone());

    if state.config.rate_limit_enabled {
        // Keyed by peer IP.
        let governor_config = GovernorConfigBuilder::default()
            .per_second(state.config.rate_limit_per_second)
            .burst_size(state.config.rate_limit_burst_size)
            .finish()
            .expect("valid governor config");
        app = app.layer(GovernorLayer::new(governor_config));
    }

    let socket_addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(socket_addr).await?;

    tracing::info!(
        app_name = %state.config.app_name,
        environment = %state.config.environment,
        api_prefix = %state.config.api_prefix,
        realtime_enabled = state.config.realtime_enabled,
        "Analytics backend listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(subscription) = extension_alerts {
        subscription.unsubscribe();
    }
    Ok(())
}

/// Keeps the open-extension store in sync with the database. With realtime
/// on, the listener loads the store after each `LISTEN` so no change falls
/// between the initial read and the subscription.
async fn start_extension_alerts(state: &AppState) -> Option<Subscription> {
    state.db_pool.as_ref()?;

    let subscription = state.extension_alerts.attach(&state.change_feed);
    if state.config.realtime_enabled {
        tokio::spawn(run_pg_listener(state.clone()));
    } else {
        reload_open_requests(state).await;
        tracing::info!("Realtime disabled, extension alerts reflect startup state only");
    }
    Some(subscription)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("Shutdown signal received, finishing in-flight requests");
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
