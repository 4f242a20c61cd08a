// src/main.rs

//! # Hotpage
//!
//! Loads configuration, initializes logging, then runs the file watcher, the
//! change pipeline and the web server until Ctrl-C.

use anyhow::Result;
use hotpage::config::{AppConfig, RunMode};
use hotpage::self_version::CLIENT_SCRIPT_NAME;
use hotpage::watch_session::{run_pipeline, WatchOptions, WatchSession};
use hotpage::watcher::{self, Notification, WatchTarget};
use hotpage::web::{self, AppState};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let app_config = match AppConfig::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&app_config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default tracing subscriber failed");

    tracing::info!("Hotpage starting with configuration: {:?}", app_config);

    let development = app_config.mode == RunMode::Development;
    let client_script = app_config.public_dir.join(CLIENT_SCRIPT_NAME);
    let options = WatchOptions {
        retry: app_config.retry,
        queue_capacity: app_config.queue_capacity,
        client_script: (development && client_script.is_file()).then(|| client_script.clone()),
    };

    let watch_session = match WatchSession::open(&app_config.root, options) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Error opening {:?}: {:#}", app_config.root, e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (notification_tx, notification_rx) = mpsc::channel::<Notification>(app_config.queue_capacity.max(16));

    let mut targets = vec![WatchTarget::recursive(watch_session.root())];
    if let Some(script_dir) = watch_session.client_script().and_then(|s| s.path().parent()) {
        tracing::info!("DEVELOPMENT MODE: watching {:?} for agent updates", script_dir);
        targets.push(WatchTarget::flat(script_dir));
    }
    watcher::run_watcher(targets, app_config.debounce, notification_tx).await?;

    let mut tasks = Vec::new();

    let pipeline_session = Arc::clone(&watch_session);
    let pipeline_shutdown_rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        run_pipeline(pipeline_session, notification_rx, pipeline_shutdown_rx).await;
    }));

    let web_addr = app_config.web_addr()?;
    let state = AppState {
        watch: Arc::clone(&watch_session),
        public_dir: app_config.public_dir.clone(),
        port: app_config.port,
    };
    let web_shutdown_rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = web::start_server(web_addr, state, web_shutdown_rx).await {
            tracing::error!("Web server exited with error: {}", e);
        }
    }));

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Ctrl-C received, stopping pipeline and server...");
        }
        Err(err) => {
            tracing::error!("Failed to listen for Ctrl-C signal: {}", err);
        }
    }

    if shutdown_tx.send(true).is_err() {
        tracing::error!("Failed to signal shutdown to pipeline and server");
    }

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("Task failed during shutdown: {}", e);
        }
    }

    tracing::info!("Hotpage shut down gracefully.");
    Ok(())
}
