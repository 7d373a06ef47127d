//! # Companion Gateway - Main Entry Point
//!
//! Boots the HTTP server that carries the device WebSocket endpoint and the
//! small REST surface next to it (health, metrics, runtime config).
//!
//! ## Startup order:
//! 1. Load and validate configuration (TOML + environment)
//! 2. Initialize tracing
//! 3. Build shared state: metrics, session registry, enhancement worker
//!    pool, collaborator wiring
//! 4. Spawn the grace-window sweeper
//! 5. Run the server until SIGTERM/SIGINT, then stop gracefully

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use companion_device_backend::collaborators::CollaboratorSet;
use companion_device_backend::config::AppConfig;
use companion_device_backend::enhancement::WorkerPool;
use companion_device_backend::gateway::{device_ws, SessionRegistry};
use companion_device_backend::handlers::config as config_handlers;
use companion_device_backend::state::AppState;
use companion_device_backend::{health, middleware};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// How often the registry is swept for sessions whose grace window passed.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load()?;
    config.validate()?;

    info!(
        "Starting companion-gateway v{} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.server.host,
        config.server.port
    );

    let app_state = AppState::new(config.clone());
    let registry = Arc::new(SessionRegistry::new(
        config.performance.max_concurrent_sessions,
        config.protocol.grace_window(),
        Arc::clone(&app_state.metrics),
    ));
    let pool = Arc::new(WorkerPool::new(
        config.performance.enhancement_workers,
        config.performance.pending_utterance_queue,
        Arc::clone(&app_state.metrics),
    ));
    let collaborators = CollaboratorSet::stubs();

    spawn_grace_sweeper(Arc::clone(&registry));
    setup_signal_handlers();

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Listening on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::Data::new(Arc::clone(&registry)))
            .app_data(web::Data::new(Arc::clone(&pool)))
            .app_data(web::Data::new(collaborators.clone()))
            .wrap(cors)
            .wrap(middleware::RequestCounters)
            .wrap(middleware::RequestLogging)
            .route("/ws/device/{device_id}", web::get().to(device_ws))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(config_handlers::get_config))
                    .route("/config", web::put().to(config_handlers::update_config)),
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

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "companion_device_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Periodically drop sessions whose grace window expired. Sweep cadence only
/// affects how promptly resources are reclaimed; resumption checks the exact
/// deadline itself.
fn spawn_grace_sweeper(registry: Arc<SessionRegistry>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = registry.sweep_expired();
            if removed > 0 {
                info!(removed, "Swept expired sessions");
            }
        }
    });
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        let sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
        let sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            _ => {
                error!("Failed to install signal handlers");
                return;
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
