//! Market Recorder
//!
//! Subscribes to the Binance combined stream for one symbol, records every
//! channel to per-day JSON line files and keeps a synchronized order book.
//!
//! Usage: `market-recorder [SYMBOL]`

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use market_recorder::orderbook::RestSnapshotClient;
use market_recorder::recorder::{self, PipelineReport};
use market_recorder::{AppState, Config, EventRouter, RecorderMetrics, Shutdown, WebSocketManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Market Recorder");

    let mut config = Config::load()?;
    if let Some(symbol) = std::env::args().nth(1) {
        config = config.with_symbol(&symbol)?;
    }
    let config = Arc::new(config);
    info!(symbol = %config.symbol, streams = ?config.stream_names(), "Configuration loaded");

    let day_dir = recorder::day_directory(&config.output_dir, chrono::Local::now().date_naive())?;

    let shutdown = Shutdown::new();
    let signals = shutdown.listen_for_signals();
    let metrics = Arc::new(RecorderMetrics::new()?);

    let rest_endpoint = config.rest_endpoint.clone();
    let (router, pipelines) = recorder::start(
        &config,
        &day_dir,
        shutdown.clone(),
        metrics.clone(),
        move || RestSnapshotClient::new(&rest_endpoint),
    )?;

    let state = Arc::new(AppState {
        metrics,
        shutdown: shutdown.clone(),
        config: config.clone(),
    });

    let health_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state).await {
            warn!(error = %e, "Health server error");
        }
    });

    spawn_status_task(&router, &state);

    let mut ws_manager = WebSocketManager::new(config.clone(), router, shutdown.clone());
    let feed = ws_manager.run().await;

    shutdown.trigger("feed stopped");
    // Releases the queue senders
    drop(ws_manager);

    let joined = tokio::task::spawn_blocking(move || pipelines.join()).await?;
    signals.abort();

    let reports = joined?;
    for report in &reports {
        match report {
            PipelineReport::Writer(w) => info!(
                category = %w.category,
                lines = w.file.lines,
                bytes = w.file.bytes_written,
                "Writer report"
            ),
            PipelineReport::Synchronizer(s) => info!(
                applied = s.applied,
                stale = s.stale,
                gaps = s.gaps,
                resyncs = s.resyncs,
                last_update_id = ?s.last_update_id,
                "Order book report"
            ),
        }
    }
    info!(reason = ?shutdown.reason(), "Market Recorder stopped");

    feed?;
    Ok(())
}

/// Log queue drop counts every `status_interval_secs`
fn spawn_status_task(router: &EventRouter, state: &Arc<AppState>) {
    let stats = router.queue_stats();
    let shutdown = state.shutdown.clone();
    let period = Duration::from_secs(state.config.status_interval_secs.max(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }
            for (queue, counters) in &stats {
                info!(
                    queue = %queue,
                    pushed = counters.pushed(),
                    dropped = counters.dropped(),
                    "Queue status"
                );
            }
        }
    });
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: Arc<AppState>) -> anyhow::Result<()> {
    use std::net::SocketAddr;

    let port = state.config.health_port;
    let shutdown = state.shutdown.clone();
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = if state.shutdown.is_triggered() {
        "stopping"
    } else {
        "healthy"
    };
    Json(serde_json::json!({
        "status": status,
        "component": "market-recorder",
        "symbol": state.config.symbol,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, StatusCode> {
    state.metrics.render().map_err(|e| {
        warn!(error = %e, "Failed to render metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
