//! # correlator
//!
//! The single-consumer junction of the pipeline. Owns the position cache and
//! the pending buffer outright — no other task touches them, which keeps the
//! hot path lock-free. All work here is in-memory; snapshot writes are
//! serialized here but performed on spawned tasks, and the geocoder lookup is
//! cache-only by contract.
//!
//! Policy:
//! - POSITION: upsert the cache, then drain everything buffered for that node
//!   through the join.
//! - TELEMETRY: join against a live cached position, or buffer on miss.
//! - NODEINFO: folds name/board into an existing cached position; never
//!   creates one.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::decode::DecodedPacket;
use crate::geocode::GeocoderHandle;
use crate::metrics::Metrics;
use crate::model::{EnrichedRecord, NodePosition, Reading, RegionTag};
use crate::pending::{PendingBuffer, PENDING_TTL_SECS};
use crate::persistence;
use crate::position_cache::PositionCache;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Out-of-band commands from the supervisor.
pub enum ControlMsg {
    /// SIGHUP: persist caches without exiting
    Snapshot,
}

pub struct Correlator {
    positions: PositionCache,
    pending: PendingBuffer,
    geocoder: GeocoderHandle,
    sink_tx: mpsc::Sender<EnrichedRecord>,
    metrics: Arc<Metrics>,
}

impl Correlator {
    pub fn new(
        positions: PositionCache,
        pending: PendingBuffer,
        geocoder: GeocoderHandle,
        sink_tx: mpsc::Sender<EnrichedRecord>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            positions,
            pending,
            geocoder,
            sink_tx,
            metrics,
        }
    }

    /// Consume decoded packets until the decode stage closes its sender, then
    /// snapshot both caches and exit.
    pub async fn run(
        mut self,
        mut decoded_rx: mpsc::Receiver<DecodedPacket>,
        mut control_rx: mpsc::Receiver<ControlMsg>,
    ) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sweep.tick().await; // immediate first tick

        loop {
            tokio::select! {
                maybe = decoded_rx.recv() => match maybe {
                    Some(packet) => self.handle(packet).await,
                    None => break,
                },
                Some(cmd) = control_rx.recv() => match cmd {
                    ControlMsg::Snapshot => {
                        info!("snapshot requested");
                        self.snapshot_now().await;
                    }
                },
                _ = sweep.tick() => self.periodic(),
            }
        }

        self.snapshot_now().await;
        info!(
            "correlator stopped ({} positions cached, {} readings pending)",
            self.positions.len(),
            self.pending.reading_count()
        );
    }

    async fn handle(&mut self, packet: DecodedPacket) {
        match packet {
            DecodedPacket::Position { meta, position } => {
                let now = meta.received_at;
                self.positions.put(NodePosition {
                    node_id: meta.node_id,
                    latitude: position.latitude,
                    longitude: position.longitude,
                    altitude: position.altitude,
                    hardware_model: None,
                    node_name: None,
                    received_at: now,
                });
                Metrics::incr(&self.metrics.positions_cached);
                // Start resolving this locality now; telemetry usually trails
                // the beacon by minutes, which is plenty
                self.geocoder.warm(position.latitude, position.longitude).await;

                // Re-read so identity fields merged from the previous entry
                // are on the join side
                let Some(joined) = self.positions.get(meta.node_id, now).cloned() else {
                    return;
                };
                for entry in self.pending.drain(meta.node_id) {
                    if now - entry.buffered_at >= PENDING_TTL_SECS {
                        Metrics::incr(&self.metrics.pending_expired);
                        continue;
                    }
                    Metrics::incr(&self.metrics.pending_drained);
                    self.emit(&joined, entry.reading, entry.buffered_at).await;
                }
            }
            DecodedPacket::Telemetry { meta, readings, .. } => {
                let now = meta.received_at;
                match self.positions.get(meta.node_id, now).cloned() {
                    Some(position) => {
                        for reading in readings {
                            self.emit(&position, reading, now).await;
                        }
                    }
                    None => {
                        debug!(node = %meta.node_id, "no position yet, buffering telemetry");
                        for reading in readings {
                            self.buffer(reading, meta.region.clone(), now);
                        }
                    }
                }
            }
            DecodedPacket::NodeInfo {
                meta,
                node_name,
                hardware_model,
            } => {
                let applied = self.positions.apply_node_info(
                    meta.node_id,
                    Some(node_name),
                    Some(hardware_model),
                );
                if applied {
                    Metrics::incr(&self.metrics.nodeinfo_applied);
                }
            }
            DecodedPacket::Ignored => {}
        }

        self.maybe_snapshot();
    }

    fn buffer(&mut self, reading: Reading, region: RegionTag, now: i64) {
        self.pending.push(reading, region, now);
        Metrics::incr(&self.metrics.telemetry_buffered);
    }

    async fn emit(&mut self, position: &NodePosition, reading: Reading, received_at: i64) {
        let codes = self
            .geocoder
            .lookup_or_request(position.latitude, position.longitude)
            .await;
        let record = EnrichedRecord {
            node_id: reading.node_id,
            reading_type: reading.reading_type,
            value: reading.value,
            sensor_time: reading.sensor_time,
            latitude: position.latitude,
            longitude: position.longitude,
            altitude: position.altitude,
            node_name: position.node_name.clone(),
            board_model: position.hardware_model.clone(),
            country_code: codes.country,
            subdivision_code: codes.subdivision,
            position_received_at: position.received_at,
            received_at,
        };
        Metrics::incr(&self.metrics.records_emitted);
        if self.sink_tx.send(record).await.is_err() {
            warn!("sink channel closed, dropping record");
        }
    }

    fn periodic(&mut self) {
        let now = crate::pipeline::now_unix();
        let expired_positions = self.positions.sweep(now);
        let expired_pending = self.pending.sweep(now);
        Metrics::add(&self.metrics.pending_expired, expired_pending as u64);
        if expired_positions + expired_pending > 0 {
            info!(
                expired_positions,
                expired_pending,
                positions = self.positions.len(),
                pending = self.pending.reading_count(),
                "sweep"
            );
        }
    }

    /// Hand snapshot writes off so this task never waits on the filesystem.
    fn maybe_snapshot(&mut self) {
        if self.positions.should_snapshot() {
            let path = self.positions.path().clone();
            let json = self.positions.snapshot_json();
            self.positions.mark_snapshotted();
            tokio::spawn(async move {
                if let Err(e) = persistence::write_atomic(&path, &json).await {
                    warn!("position cache: snapshot failed: {e:#}");
                }
            });
        }
        if self.pending.should_snapshot() {
            let path = self.pending.path().clone();
            let json = self.pending.snapshot_json();
            self.pending.mark_snapshotted();
            tokio::spawn(async move {
                if let Err(e) = persistence::write_atomic(&path, &json).await {
                    warn!("pending buffer: snapshot failed: {e:#}");
                }
            });
        }
    }

    /// Awaited snapshot of both caches — used on SIGHUP and shutdown, where
    /// completion matters more than latency.
    async fn snapshot_now(&mut self) {
        if let Err(e) =
            persistence::write_atomic(self.positions.path(), &self.positions.snapshot_json()).await
        {
            warn!("position cache: snapshot failed: {e:#}");
        }
        self.positions.mark_snapshotted();
        if let Err(e) =
            persistence::write_atomic(self.pending.path(), &self.pending.snapshot_json()).await
        {
            warn!("pending buffer: snapshot failed: {e:#}");
        }
        self.pending.mark_snapshotted();
    }
}
