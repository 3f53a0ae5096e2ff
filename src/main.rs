//! # AudioHook Server - Main Application Entry Point
//!
//! Sets up an Actix-web HTTP server that terminates AudioHook websocket
//! connections and hosts the load-test driver.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (config.toml + environment variables)
//! - **audiohook**: The protocol engine (codec, session state machine, registry)
//! - **loadtest**: Concurrent synthetic clients and result aggregation
//! - **websocket**: Actix actor bridging sockets to session tasks
//! - **state**: Shared application state and HTTP metrics
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and metrics collection
//! - **handlers**: Diagnostic HTTP handlers (config, sessions)
//! - **error**: Protocol and HTTP error types
//!
//! ## Shutdown:
//! SIGINT/SIGTERM first drains the session registry (every live session gets a
//! `close` with reason `shutdown`), then stops the HTTP server.

mod audiohook;
mod config;
mod error;
mod handlers;
mod health;
mod loadtest;
mod middleware;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::{AppConfig, LogFormat};
use crate::state::AppState;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Routes registered below, logged once at startup.
const ROUTES: &[(&str, &str)] = &[
    ("GET", "/health"),
    ("GET", "/api/v1/health"),
    ("GET", "/api/v1/metrics"),
    ("GET", "/api/v1/config"),
    ("GET", "/api/v1/sessions"),
    ("GET", "/api/v1/sessions/{id}"),
    ("DELETE", "/api/v1/sessions/{id}"),
    ("GET", "/api/v1/audiohook/ws"),
    ("GET", "/api/v1/loadtest/ws"),
];

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** in the configured format
/// 3. **Creates shared application state**, including the session registry
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** when receiving system signals
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    let config = AppConfig::load()?;
    init_tracing(config.server.log_format)?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        max_sessions = config.performance.max_concurrent_sessions,
        max_payload_bytes = config.protocol.max_payload_bytes,
        inactivity_timeout_ms = config.protocol.inactivity_timeout_ms,
        "Configuration loaded"
    );

    let app_state = AppState::new(config.clone());
    let registry = app_state.registry.clone();
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let shutdown = setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs in reverse registration order for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route("/sessions/{id}", web::delete().to(handlers::close_session))
                    .route("/audiohook/ws", web::get().to(websocket::audiohook_websocket))
                    .route("/loadtest/ws", web::get().to(loadtest::socket::loadtest_websocket)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .disable_signals()
    .run();

    for (method, path) in ROUTES {
        info!(method = %method, path = %path, "Route registered");
    }

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown signal received, draining sessions...");
            let report = registry
                .shutdown(Duration::from_millis(config.performance.shutdown_grace_ms))
                .await;
            if !report.drained {
                warn!(stragglers = report.stragglers.len(), "Shutdown grace elapsed with sessions still active");
            }
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged; defaults to
///   "audiohook_server=debug,actix_web=info"
///
/// `LogFormat::Json` emits one JSON object per event for log shipping.
fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "audiohook_server=debug,actix_web=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init()?,
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
    }

    Ok(())
}

/// Listen for SIGTERM/SIGINT and cancel the returned token on the first one.
///
/// Installing a handler can fail (e.g. no signal support); the server then
/// keeps running and only Ctrl+C is watched.
fn setup_signal_handlers() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    }
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for SIGINT: {}", e);
                        return;
                    }
                    info!("Received SIGINT");
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        trigger.cancel();
    });

    token
}
