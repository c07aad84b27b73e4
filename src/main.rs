//! # Clinic Simulation Observer - Main Application Entry Point
//!
//! Follows a live clinical-interview simulation over one WebSocket, plays the
//! speakers' audio in order, and serves the live view state to local clients.
//!
//! ## Application Architecture:
//! - **stream**: Connection lifecycle, start handshake and event dispatch
//! - **audio**: Sequential playback queue, payload decoding and the output device
//! - **view**: Ranked/filtered view state and its broadcast store
//! - **config**: Application configuration (TOML files + environment variables)
//! - **state**: Shared application state and request metrics
//! - **handlers / websocket / health**: The local HTTP and WebSocket API
//! - **middleware**: Request metrics
//! - **error**: HTTP error responses
//!
//! ## Startup order:
//! 1. Configuration and logging
//! 2. Playback queue (its worker starts immediately; the device is acquired on
//!    the first start request)
//! 3. Session controller, optionally connecting right away
//! 4. HTTP server, until SIGINT/SIGTERM

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod stream;
mod view;
mod websocket;

use crate::audio::{AudioOutput, CpalOutput, DisabledOutput, PayloadDecoder, PlaybackQueue};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::state::AppState;
use crate::stream::{SessionController, WsTransport};
use crate::view::ViewStore;
use actix_cors::Cors;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// How long queued audio may keep playing after shutdown starts.
const PLAYBACK_DRAIN_GRACE: Duration = Duration::from_secs(5);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        stream_url = %config.stream.url,
        audio_enabled = config.audio.enabled,
        "Configuration loaded"
    );

    let output: Arc<dyn AudioOutput> = if config.audio.enabled {
        Arc::new(CpalOutput::new(config.output_device()))
    } else {
        info!("Audio playback disabled, audio events will be skipped");
        Arc::new(DisabledOutput)
    };
    let playback = Arc::new(PlaybackQueue::spawn(
        Arc::new(PayloadDecoder::new(config.pcm_format())),
        output,
    ));

    let controller = SessionController::new(
        config.stream_settings(),
        Arc::new(WsTransport),
        Arc::clone(&playback),
        ViewStore::new(config.view_limits()),
    );
    if config.stream.connect_on_startup {
        controller.connect().await;
    }

    let app_state = AppState::new(config.clone(), controller.clone());
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
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/view", web::get().to(handlers::get_view))
                    .route("/session", web::get().to(handlers::session_status))
                    .route("/session/start", web::post().to(handlers::start_session))
                    .route("/session/connect", web::post().to(handlers::connect))
                    .route("/session/disconnect", web::post().to(handlers::disconnect))
                    .route("/audio/init", web::post().to(handlers::init_audio)),
            )
            .route("/ws/view", web::get().to(websocket::view_websocket))
            .route("/health", web::get().to(health::health_check))
            .default_service(web::to(not_found))
    })
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
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    controller.disconnect().await;
    playback.shutdown(PLAYBACK_DRAIN_GRACE).await;

    info!("Server stopped gracefully");
    Ok(())
}

async fn not_found(req: HttpRequest) -> Result<HttpResponse, AppError> {
    Err(AppError::NotFound(format!(
        "No route for {} {}",
        req.method(),
        req.path()
    )))
}

/// `RUST_LOG` overrides the default `clinic_sim_observer=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clinic_sim_observer=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

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
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
