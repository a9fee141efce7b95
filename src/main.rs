//! # Surgical Copilot Backend Entry Point
//!
//! Session orchestration and real-time relay service for a generative-AI
//! assisted procedure session. Startup order matters here:
//!
//! 1. configuration and logging come up first;
//! 2. the completion backend health check runs with a bounded wait; this
//!    is the only process-fatal dependency;
//! 3. the ASR backend is probed but only logged (the relay self-heals);
//! 4. the procedure session and its background annotation loop start;
//! 5. the HTTP/WebSocket server binds, and signal handlers arrange a
//!    graceful stop.

mod agents;
mod asr;
mod completion;
mod config;
mod dispatch;
mod error;
mod handlers;
mod health;
mod middleware;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::agents::annotation::{AnnotationLoop, AnnotationWorker};
use crate::agents::chat::ChatAgent;
use crate::agents::notetaker::NoteTaker;
use crate::agents::report::ReportComposer;
use crate::agents::router::AgentRouter;
use crate::asr::AsrRelay;
use crate::completion::{CompletionClient, HttpCompletionClient};
use crate::config::AppConfig;
use crate::dispatch::Dispatcher;
use crate::session::ProcedureSession;
use crate::state::AppState;
use crate::websocket::ClientRegistry;

/// Set by the signal handler task; polled by the main select loop.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!(
        "Starting surgical-copilot-backend v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        "Configuration loaded: {}:{}, backend {}",
        config.server.host, config.server.port, config.backend.llm_url
    );

    let app_state = AppState::new(config.clone());

    // The completion backend is the one dependency nothing works without.
    let http_client = HttpCompletionClient::new(
        config.backend.llm_url.clone(),
        config.backend.model_name.clone(),
        Duration::from_secs(config.backend.request_timeout_seconds),
    );
    http_client
        .wait_for_backend(Duration::from_secs(config.backend.startup_wait_seconds))
        .await
        .map_err(|e| anyhow::anyhow!("Completion backend unavailable: {}", e))?;
    let client: Arc<dyn CompletionClient> = Arc::new(http_client);

    let asr_relay = Arc::new(AsrRelay::new(&config.asr));
    asr_relay.probe().await;

    // One procedure session per server run, with its background annotator.
    let session = Arc::new(ProcedureSession::create(
        Path::new(&config.storage.output_dir),
        config.annotation.frame_queue_capacity,
    )?);

    // Built before the annotation loop so new annotations reach connected
    // clients as they are recorded.
    let registry = ClientRegistry::new();

    let annotation_state = app_state.clone();
    let annotation_registry = registry.clone();
    let annotation_loop = AnnotationLoop::spawn(
        AnnotationWorker::new(client.clone(), session.clone(), config.annotation.clone())
            .with_callback(Box::new(move |annotation| {
                annotation_state.record_annotation();
                annotation_registry.broadcast(websocket::annotation_update_message(annotation));
            })),
    );

    let dispatcher = Arc::new(Dispatcher::new(
        AgentRouter::new(client.clone()),
        ChatAgent::new(client.clone()),
        NoteTaker::new(session.clone()),
        ReportComposer::new(
            client.clone(),
            config.report.chunk_size,
            config.backend.max_tokens,
        ),
        session,
        app_state.clone(),
        Some(annotation_loop),
    ));

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
            .app_data(web::Data::new(dispatcher.clone()))
            .app_data(web::Data::new(registry.clone()))
            .app_data(web::Data::new(asr_relay.clone()))
            .app_data(web::Data::new(client.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/ws", web::get().to(websocket::session_websocket))
            .route("/ws/audio", web::get().to(websocket::audio_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/report", web::post().to(handlers::generate_report))
                    .route("/tts", web::post().to(handlers::synthesize_speech))
                    .route("/videos", web::post().to(handlers::upload_video))
                    .route("/videos", web::get().to(handlers::list_videos))
                    .route("/videos/select", web::post().to(handlers::select_video))
                    .route("/videos/{filename}", web::get().to(handlers::serve_video)),
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

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "surgical_copilot_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// SIGTERM/SIGINT flip the shutdown flag; the select loop in `main` does the
/// actual stop so in-flight requests finish first.
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
