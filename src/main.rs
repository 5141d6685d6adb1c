//! # Voice Gateway Backend - Main Application Entry Point
//!
//! Realtime audio ingestion and transcription gateway. Clients exchange a
//! bearer token for a one-use ticket over HTTP, open a WebSocket, stream
//! VAD-annotated 16 kHz PCM frames, and receive transcripts back on the
//! same connection while the raw audio is archived to an object store in
//! rolling chunks.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (TOML + environment)
//! - **state**: shared state, gateway metrics, wired services
//! - **auth**: bearer token verification and one-use tickets
//! - **ws**: connection upgrade, session actors, the stream engine
//! - **asr**: speech-to-text provider dispatch
//! - **archive**: sliding-window audio archival and the object store seam
//! - **handlers**: the HTTP surface (tickets, archive administration)
//! - **middleware / health / error**: request logging, metrics, health
//!   endpoints, and HTTP error mapping

mod archive;     // Sliding-window archiver and object store client
mod asr;         // Speech-to-text provider dispatch
mod audio;       // Ring buffer and WAV assembly
mod auth;        // JWT verification and connection tickets
mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod state;       // Application state management (state.rs)
mod ws;          // WebSocket sessions (ws/ directory)

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::archive::{FsObjectStore, ObjectStore};
use crate::asr::AsrDispatcher;
use crate::auth::{MemoryTicketStore, TokenVerifier};
use crate::config::AppConfig;
use crate::state::{AppState, GatewayServices};

/// Global shutdown signal, set by the SIGINT/SIGTERM handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-gateway-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let app_state = AppState::new(config.clone());
    let services = build_services(&config, app_state.clone())?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::Data::new(services.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            // Ticket exchange and the WebSocket itself
            .route("/api/ws/ticket", web::post().to(handlers::issue_ws_ticket))
            .route("/api/ws", web::get().to(ws::ws_upgrade))
            // Archive administration
            .route("/api/audio/stats", web::get().to(handlers::archive_admin::archive_stats))
            .route(
                "/api/audio/sessions/{session_id}",
                web::get().to(handlers::archive_admin::list_session_chunks),
            )
            .route(
                "/api/audio/download/{key:.*}",
                web::get().to(handlers::archive_admin::download_chunk),
            )
            .route(
                "/api/audio/retention",
                web::post().to(handlers::archive_admin::retention_sweep),
            )
            .route(
                "/api/audio/{key:.*}",
                web::delete().to(handlers::archive_admin::delete_chunk),
            )
            // Observability
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Wire the gateway's collaborators from configuration.
///
/// Missing optional pieces degrade features rather than failing startup:
/// no bucket means no archival, no JWT key means no ticket issuance. An
/// invalid JWT key is a hard error, though — better to refuse to start
/// than to silently reject every client.
fn build_services(config: &AppConfig, app_state: AppState) -> Result<GatewayServices> {
    if let Some(binding) = &config.tickets.store_binding {
        info!(
            binding = %binding,
            "external ticket store binding configured; this build serves tickets from the in-process store"
        );
    }
    let ticket_store = Arc::new(MemoryTicketStore::new());

    let object_store: Option<Arc<dyn ObjectStore>> = match &config.archive.object_store_bucket {
        Some(bucket) => {
            info!(bucket = %bucket, "audio archival enabled");
            Some(Arc::new(FsObjectStore::new(bucket)))
        }
        None => {
            warn!("OBJECT_STORE_BUCKET not set; sessions will run without archival");
            None
        }
    };

    let token_verifier = match &config.auth.clerk_jwt_key {
        Some(pem) => {
            let verifier = TokenVerifier::new(pem, config.auth.authorized_party_list())
                .map_err(|e| anyhow::anyhow!("CLERK_JWT_KEY is unusable: {}", e))?;
            Some(Arc::new(verifier))
        }
        None => {
            warn!("CLERK_JWT_KEY not set; ticket issuance is disabled");
            None
        }
    };

    let dispatcher = AsrDispatcher::new(&config.providers);
    info!(provider = dispatcher.provider().name(), "transcription provider selected");

    Ok(GatewayServices {
        ticket_store,
        object_store,
        token_verifier,
        dispatcher,
        archiver_config: config.archive.to_archiver_config(),
        allowed_origins: config.auth.authorized_party_list(),
        app_state,
    })
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_gateway_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and flip the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
