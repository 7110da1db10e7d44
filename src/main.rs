//! # Speech Assessment Server - Main Application Entry Point
//!
//! Real-time pronunciation assessment over WebSocket. A client streams audio for a known
//! reference text; the server relays it to a remote scoring engine and streams the
//! engine's results back.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, config.toml, environment)
//! - **state**: Shared metrics and session slots
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and metrics collection
//! - **handlers**: Plain HTTP API handlers
//! - **websocket**: The `/ws/assessment` endpoint (actix actor per connection)
//! - **assessment**: Session state machine, wire protocol and mode classifier
//! - **recognition**: Engine contract and the Tencent Cloud SOE adapter
//! - **audio**: PCM helpers and debug WAV recording
//! - **error**: HTTP and session error types

mod assessment;
mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod recognition;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use recognition::{RecognitionEngine, SoeEngine};
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** with `RUST_LOG` support
/// 3. **Creates shared state** and the engine used by every session
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** on SIGINT/SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if !config.speech.has_credentials() {
        warn!("Engine credentials are not configured; every session will fail to start");
    }

    let engine: Arc<dyn RecognitionEngine> = Arc::new(SoeEngine::new(config.speech.clone()));
    let engine = web::Data::from(engine);
    let app_state = web::Data::new(AppState::new(config.clone()));
    let allowed_origins = config.server.allowed_origins.clone();
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .app_data(engine.clone())
            // Middleware runs in reverse registration order for requests
            .wrap(build_cors(&allowed_origins))
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/assessment", web::get().to(websocket::assessment_websocket))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

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
        signal = wait_for_shutdown() => {
            match signal {
                Ok(name) => info!("Received {}, stopping server...", name),
                Err(e) => error!("Failed to listen for shutdown signals: {}", e),
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
/// - `RUST_LOG`: Controls what gets logged (e.g., "info", "speech_assessment_server=trace")
/// - If not set, defaults to "speech_assessment_server=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_assessment_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// CORS for the HTTP API. An empty origin list allows any origin.
fn build_cors(allowed_origins: &[String]) -> Cors {
    let cors = Cors::default()
        .allow_any_method()
        .allow_any_header()
        .max_age(3600);

    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        return cors.allow_any_origin();
    }
    allowed_origins
        .iter()
        .fold(cors, |cors, origin| cors.allowed_origin(origin))
}

/// Resolve on SIGINT or SIGTERM, returning which one arrived.
#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}
