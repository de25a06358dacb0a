//! # pipeline
//!
//! The decode stage between the subscriber fleet and the correlator:
//! dedup → decrypt/decode → future-timestamp guard. Packets that fail any
//! step are dropped here with a counter; nothing downstream ever sees them.
//!
//! The guard rejects telemetry whose sensor clock runs more than 30 seconds
//! ahead of arrival. Sensor-declared time is the canonical timestamp (mesh
//! delays make ingestion time useless for time series), so a broken RTC
//! produces permanently unaligned data — better rejected than archived.
//! Rejections go to a dedicated size-rotated log stream.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::decode::{DecodeError, DecodedPacket, Decoder};
use crate::dedup::DedupFilter;
use crate::metrics::Metrics;
use crate::model::RegionTag;
use crate::rotating_log::{FutureTimestampEntry, RotatingLog};

/// Sensor clocks may run this far ahead of arrival before a reading is
/// rejected as future-dated.
pub const FUTURE_TOLERANCE_SECS: i64 = 30;

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// One raw MQTT payload with its receive metadata.
pub struct RawEnvelope {
    pub region: RegionTag,
    pub topic: String,
    pub payload: Bytes,
    /// Unix seconds at arrival
    pub received_at: i64,
}

/// Decode worker loop. Exits when all subscribers have dropped their senders.
pub async fn decode_worker(
    mut raw_rx: mpsc::Receiver<RawEnvelope>,
    decoded_tx: mpsc::Sender<DecodedPacket>,
    decoder: Decoder,
    mut dedup: DedupFilter,
    reject_log: RotatingLog,
    metrics: Arc<Metrics>,
) {
    while let Some(raw) = raw_rx.recv().await {
        Metrics::incr(&metrics.packets_received);
        metrics.region_received(&raw.region);

        let packet = match decoder.decode(&raw.region, &raw.payload, raw.received_at) {
            Ok(packet) => packet,
            Err(e) => {
                match e {
                    DecodeError::DecryptFailed => Metrics::incr(&metrics.decrypt_failed),
                    DecodeError::DecodeFailed(_) => Metrics::incr(&metrics.decode_failed),
                    DecodeError::UnsupportedPacket(_) => {
                        Metrics::incr(&metrics.unsupported_packet)
                    }
                }
                debug!(topic = %raw.topic, region = %raw.region, "dropping packet: {e}");
                continue;
            }
        };

        let meta = match &packet {
            DecodedPacket::Position { meta, .. }
            | DecodedPacket::Telemetry { meta, .. }
            | DecodedPacket::NodeInfo { meta, .. } => meta,
            DecodedPacket::Ignored => continue,
        };

        if !dedup.accept(meta.fingerprint(), Instant::now()) {
            Metrics::incr(&metrics.deduped);
            debug!(node = %meta.node_id, packet_id = meta.packet_id, "dropping flood duplicate");
            continue;
        }

        if let DecodedPacket::Telemetry {
            meta,
            readings,
            zero_dropped,
        } = &packet
        {
            Metrics::add(&metrics.zero_integer_dropped, u64::from(*zero_dropped));
            if readings.is_empty() {
                continue;
            }
            let sensor_time = readings[0].sensor_time;
            let delta = sensor_time - meta.received_at;
            if delta > FUTURE_TOLERANCE_SECS {
                Metrics::incr(&metrics.future_timestamp_rejected);
                warn!(
                    node = %meta.node_id,
                    region = %meta.region,
                    delta_seconds = delta,
                    "rejecting telemetry from future-dated sensor clock"
                );
                reject_log
                    .append(&FutureTimestampEntry {
                        node_id: meta.node_id.device_id(),
                        region: &meta.region,
                        sensor_time,
                        delta_seconds: delta,
                    })
                    .await;
                continue;
            }
        }

        if decoded_tx.send(packet).await.is_err() {
            // Correlator gone; we are shutting down
            break;
        }
    }
    info!("decode worker stopped");
}
