mod config;
mod correlator;
mod decode;
mod dedup;
mod gazetteer;
mod geocode;
mod iso;
mod metrics;
mod model;
mod pending;
mod persistence;
mod pipeline;
mod position_cache;
mod rotating_log;
mod sink;
mod subscriber;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use config::Config;
use correlator::{ControlMsg, Correlator};
use decode::Decoder;
use dedup::DedupFilter;
use geocode::Geocoder;
use metrics::Metrics;
use pending::PendingBuffer;
use pipeline::{decode_worker, now_unix, FUTURE_TOLERANCE_SECS};
use position_cache::{PositionCache, POSITION_TTL_SECS};
use rotating_log::RotatingLog;
use sink::Sink;
use subscriber::spawn_fleet;

/// Hard ceiling on graceful shutdown; past it, caches rely on the last
/// cadence snapshot and the process exits.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

// Bounded stage channels: the subscriber→decode hop absorbs mesh bursts, the
// rest stay modest so backpressure reaches the brokers instead of memory.
const RAW_CHANNEL_CAPACITY: usize = 4096;
const DECODED_CHANNEL_CAPACITY: usize = 512;
const SINK_CHANNEL_CAPACITY: usize = 512;

// ─── Health / Metrics Endpoints ──────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_snapshot(State(metrics): State<Arc<Metrics>>) -> Json<metrics::MetricsSnapshot> {
    Json(metrics.snapshot())
}

// ─── Main ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let default_filter = if std::env::var("WESENSE_DEBUG").ok().as_deref() == Some("true") {
        "wesense_ingester=debug"
    } else {
        "wesense_ingester=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    // The only surfaced failure is a startup error; steady-state faults are
    // counters and logs, never exits.
    if let Err(e) = run().await {
        eprintln!("wesense-ingester: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::load()?;
    let enabled: Vec<String> = config
        .regions
        .iter()
        .filter(|r| r.enabled)
        .map(|r| r.region.clone())
        .collect();
    info!(
        "🌏 WeSense Meshtastic ingester v{} starting — regions [{}], node `{}`",
        env!("CARGO_PKG_VERSION"),
        enabled.join(", "),
        config.ingestion_node_id
    );

    tokio::fs::create_dir_all(&config.log_dir).await?;
    tokio::fs::create_dir_all(&config.state_dir).await?;

    let metrics = Metrics::new(&enabled);
    let now = now_unix();

    // Restore persisted state before anything connects
    let positions =
        PositionCache::load(config.position_cache_path(), POSITION_TTL_SECS, now).await;
    let pending =
        PendingBuffer::load(config.pending_telemetry_path(), now, FUTURE_TOLERANCE_SECS).await;
    let (geocoder, geocoder_handle, resolve_rx) = Geocoder::new(
        &config.geocoder,
        config.geocoding_cache_path(),
        metrics.clone(),
    )
    .await?;

    // Stage channels and the supervisor-scoped shutdown signal
    let (raw_tx, raw_rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
    let (decoded_tx, decoded_rx) = mpsc::channel(DECODED_CHANNEL_CAPACITY);
    let (record_tx, record_rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
    let (control_tx, control_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let subscriber_handles = spawn_fleet(&config.regions, &raw_tx, &shutdown_rx);
    drop(raw_tx); // subscribers hold the only senders now

    let decode_handle = tokio::spawn(decode_worker(
        raw_rx,
        decoded_tx,
        Decoder::new(config.channel_key),
        DedupFilter::with_defaults(),
        RotatingLog::new(
            config.future_timestamps_log_path(),
            config.log_rotate_bytes,
            config.log_rotate_files,
        ),
        metrics.clone(),
    ));

    let correlator = Correlator::new(
        positions,
        pending,
        geocoder_handle,
        record_tx,
        metrics.clone(),
    );
    let correlator_handle = tokio::spawn(correlator.run(decoded_rx, control_rx));

    let geocoder_handle_task = tokio::spawn(geocoder.run(resolve_rx));

    let sink = Sink::new(
        config.columnar.clone(),
        config.output_mqtt.as_ref(),
        config.ingestion_node_id.clone(),
        metrics.clone(),
    );
    let sink_handle = tokio::spawn(sink.run(record_rx));

    // Internal observability endpoint; failure to bind is a warning, not a fault
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_snapshot))
        .with_state(metrics.clone());
    let health_addr = format!("0.0.0.0:{}", config.health_port);
    match tokio::net::TcpListener::bind(&health_addr).await {
        Ok(listener) => {
            info!("health/metrics listening on {health_addr}");
            tokio::spawn(async move {
                let _ = axum::serve(listener, app).await;
            });
        }
        Err(e) => warn!("could not bind health endpoint {health_addr}: {e}"),
    }

    // ── Signals ──────────────────────────────────────────────────────────────
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = sigint.recv() => { info!("SIGINT received"); break; }
            _ = sigterm.recv() => { info!("SIGTERM received"); break; }
            _ = sighup.recv() => {
                info!("SIGHUP received — snapshotting caches");
                let _ = control_tx.try_send(ControlMsg::Snapshot);
            }
        }
    }

    // ── Graceful shutdown ────────────────────────────────────────────────────
    // Stopping the subscribers closes the raw channel; each stage drains its
    // input and drops its own sender, so the pipeline winds down in order:
    // decode → correlator (snapshots caches) → geocoder flush + sink flush.
    let _ = shutdown_tx.send(true);
    drop(control_tx);

    let drained = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
        for handle in subscriber_handles {
            let _ = handle.await;
        }
        let _ = decode_handle.await;
        let _ = correlator_handle.await;
        let _ = geocoder_handle_task.await;
        let _ = sink_handle.await;
    })
    .await;

    match drained {
        Ok(()) => info!("shutdown complete"),
        Err(_) => warn!(
            "shutdown deadline ({}s) exceeded — exiting with best-effort snapshots",
            SHUTDOWN_DEADLINE.as_secs()
        ),
    }
    Ok(())
}
