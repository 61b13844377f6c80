mod config;
mod db;
mod device;
mod handlers;
mod jobs;
mod models;
mod router;
mod scheduler;
mod tasks;
mod utils;
mod ws;

use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use db::Store;
use device::SshConnector;
use jobs::JobExecutor;
use scheduler::Scheduler;
use tasks::{StartDelays, TaskService};
use ws::Hub;

/// Application state shared across handlers
pub struct AppState {
    pub task_service: Arc<TaskService>,
    pub ws_hub: Option<Arc<Hub>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let dotenv = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "forge_tasks=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Ok(path) = dotenv {
        tracing::info!("Loaded environment from {}", path.display());
    }

    // Load configuration
    let cfg = Config::load();
    tracing::info!("Starting ForgeTasks Server");
    tracing::info!("Database: {}", cfg.db_path);
    tracing::info!("Listen: {}", cfg.listen_addr);

    // Initialize database
    let store = Store::with_pool_size(&cfg.db_path, cfg.db_max_connections).await?;
    tracing::info!("Database initialized (pool_size={})", cfg.db_max_connections);

    // Initialize WebSocket hub
    let ws_hub = Arc::new(Hub::new());

    // Wire the executor to devices over SSH
    let connector = Arc::new(SshConnector::new(cfg.ssh_port, cfg.ssh_timeout_secs));
    let executor = JobExecutor::new(Arc::new(store.clone()), connector, Some(ws_hub.clone()));

    let scheduler = Scheduler::new(executor, cfg.scheduler_tick);
    let task_service = Arc::new(TaskService::new(
        store,
        scheduler.clone(),
        Some(ws_hub.clone()),
        StartDelays {
            one_time: cfg.one_time_start_delay,
            recurring: cfg.recurring_start_delay,
        },
    ));

    // Bring persisted tasks back before the first tick
    task_service.restore_tasks().await?;
    scheduler.start();

    // Create app state
    let state = Arc::new(AppState {
        task_service,
        ws_hub: Some(ws_hub),
    });

    // Build router
    let app = router::build(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    tracing::info!("ForgeTasks listening on {}", cfg.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("ForgeTasks shutting down, waiting up to {:?} for running tasks", cfg.shutdown_grace);
    scheduler.shutdown(cfg.shutdown_grace).await;
    Ok(())
}

/// WebSocket upgrade handler
pub async fn ws_upgrade_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> axum::response::Response {
    use axum::response::IntoResponse;

    if let Some(hub) = &state.ws_hub {
        ws::ws_handler(ws, axum::extract::State(hub.clone())).await
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
