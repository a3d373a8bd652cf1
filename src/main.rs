mod config;
mod db;
mod engine;
mod errors;
mod execution;
mod models;
mod paper;
mod risk;
mod server;
mod state;
mod store;
#[cfg(test)]
mod testutil;

use crate::db::SqliteStore;
use crate::engine::clock::SystemClock;
use crate::engine::{scheduler, EngineOptions, TradeEngine};
use crate::state::{AppState, WsMessage};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

#[tokio::main]
async fn main() {
    // Structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("timed_settle starting");

    // Load config
    let cfg = match config::AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    // Init database
    let db_pool = match db::init_db(&cfg.data_dir) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("database init error: {e}");
            std::process::exit(1);
        }
    };

    // Engine -> clients: fire-and-forget notifications
    let (ws_tx, _) = broadcast::channel::<WsMessage>(1024);

    let engine = Arc::new(TradeEngine::new(
        Arc::new(SqliteStore::new(db_pool)),
        Arc::new(SystemClock),
        EngineOptions::from_config(&cfg),
        ws_tx.clone(),
    ));
    tracing::info!(
        model = engine.model_name(),
        quota = ?cfg.max_daily_attempts,
        quota_offset = %cfg.quota_offset,
        "engine ready"
    );

    // ── Spawn tasks ──

    // 1. Catch up on everything that matured while we were down
    match scheduler::catch_up(&engine, None).await {
        Ok(entries) => tracing::info!(count = entries.len(), "startup catch-up complete"),
        Err(e) => tracing::warn!(error = %e, "startup catch-up failed, poll will retry"),
    }

    // 2. Fixed-interval expiration poll
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll = tokio::spawn(scheduler::run_poll_loop(
        engine.clone(),
        cfg.poll_interval,
        shutdown_rx,
    ));

    // 3. Axum HTTP + WS server
    let port = cfg.server_port;
    let app = server::router(AppState::new(cfg, engine, ws_tx));

    let addr = format!("0.0.0.0:{port}");
    tracing::info!("server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("bind error: {e}");
            std::process::exit(1);
        });

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        tracing::error!("server error: {e}");
    }

    let _ = shutdown_tx.send(true);
    let _ = poll.await;
    tracing::info!("timed_settle stopped");
}
