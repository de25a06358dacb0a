//! # decode
//!
//! Envelope decryption and inner-packet decoding.
//!
//! The public Meshtastic bridges publish `ServiceEnvelope` protobufs whose
//! inner packet is AES-128-CTR ciphertext. The 128-bit initial counter is the
//! packet id as a little-endian u64, followed by the source node id as a
//! little-endian u32, followed by four zero bytes. CTR has no integrity tag:
//! a wrong key surfaces as garbage that fails the inner protobuf parse, which
//! is what `DecryptFailed` reports.
//!
//! Only POSITION_APP, TELEMETRY_APP (environment and air-quality variants)
//! and NODEINFO_APP are forwarded. Everything else is dropped, counted, and
//! never retried.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use ctr::Ctr128BE;
use prost::Message;

use crate::model::{NodeId, Reading, ReadingType, RegionTag};
use mesh_proto::{
    hardware_model_name, mesh_packet::PayloadVariant, telemetry::Variant, Data, ServiceEnvelope,
    NODEINFO_APP, POSITION_APP, TELEMETRY_APP,
};

type MeshCipher = Ctr128BE<Aes128>;

/// Non-fatal decode-stage failures. Logged at debug, counted, dropped.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload failed decryption")]
    DecryptFailed,
    #[error("envelope decode failed: {0}")]
    DecodeFailed(#[from] prost::DecodeError),
    #[error("unsupported port {0}")]
    UnsupportedPacket(i32),
}

/// Routing metadata carried in clear on the envelope.
#[derive(Debug, Clone)]
pub struct PacketMeta {
    pub node_id: NodeId,
    pub packet_id: u32,
    pub region: RegionTag,
    pub channel_id: String,
    pub gateway_id: String,
    /// Unix seconds the ingester saw the envelope
    pub received_at: i64,
}

impl PacketMeta {
    /// Flood fingerprint: a rebroadcast keeps (source, packet id) intact.
    pub fn fingerprint(&self) -> (u32, u32) {
        (self.node_id.0, self.packet_id)
    }
}

/// Geographic fix announced by a node. Identity fields (name, board) arrive
/// separately via NODEINFO and are folded in by the correlator.
#[derive(Debug, Clone)]
pub struct PositionUpdate {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
}

#[derive(Debug)]
pub enum DecodedPacket {
    Position {
        meta: PacketMeta,
        position: PositionUpdate,
    },
    Telemetry {
        meta: PacketMeta,
        readings: Vec<Reading>,
        /// Integer fields reported as zero — "unreported", dropped here
        zero_dropped: u32,
    },
    NodeInfo {
        meta: PacketMeta,
        node_name: String,
        hardware_model: String,
    },
    /// A handled port whose content this pipeline does not archive
    /// (device metrics, power metrics, empty telemetry)
    Ignored,
}

pub struct Decoder {
    key: [u8; 16],
}

impl Decoder {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    fn nonce(packet_id: u32, from: u32) -> [u8; 16] {
        let mut nonce = [0u8; 16];
        nonce[..8].copy_from_slice(&u64::from(packet_id).to_le_bytes());
        nonce[8..12].copy_from_slice(&from.to_le_bytes());
        nonce
    }

    /// AES-CTR is its own inverse; this also encrypts, which the tests use to
    /// build known ciphertext.
    pub fn apply_keystream(&self, packet_id: u32, from: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = payload.to_vec();
        let mut cipher =
            MeshCipher::new(&self.key.into(), &Self::nonce(packet_id, from).into());
        cipher.apply_keystream(&mut buf);
        buf
    }

    /// Decode one raw MQTT payload into a pipeline packet.
    pub fn decode(
        &self,
        region: &str,
        payload: &[u8],
        received_at: i64,
    ) -> Result<DecodedPacket, DecodeError> {
        let envelope = ServiceEnvelope::decode(payload)?;
        let Some(packet) = envelope.packet else {
            return Err(DecodeError::UnsupportedPacket(-1));
        };

        let meta = PacketMeta {
            node_id: NodeId(packet.from),
            packet_id: packet.id,
            region: region.to_string(),
            channel_id: envelope.channel_id,
            gateway_id: envelope.gateway_id,
            received_at,
        };

        let data = match packet.payload_variant {
            Some(PayloadVariant::Decoded(data)) => data,
            Some(PayloadVariant::Encrypted(ciphertext)) => {
                let cleartext = self.apply_keystream(packet.id, packet.from, &ciphertext);
                // Garbage from a wrong key fails here, not in the cipher
                Data::decode(cleartext.as_slice()).map_err(|_| DecodeError::DecryptFailed)?
            }
            None => return Err(DecodeError::UnsupportedPacket(-1)),
        };

        self.dispatch(meta, data)
    }

    fn dispatch(&self, meta: PacketMeta, data: Data) -> Result<DecodedPacket, DecodeError> {
        match data.portnum {
            p if p == POSITION_APP => {
                let pos = mesh_proto::Position::decode(data.payload.as_slice())?;
                Ok(DecodedPacket::Position {
                    meta,
                    // (0, 0) is accepted as-is; the geocoder resolves it as
                    // unknown rather than the decoder second-guessing the fix
                    position: PositionUpdate {
                        latitude: f64::from(pos.latitude_i.unwrap_or(0)) * 1e-7,
                        longitude: f64::from(pos.longitude_i.unwrap_or(0)) * 1e-7,
                        altitude: pos.altitude,
                    },
                })
            }
            p if p == NODEINFO_APP => {
                let user = mesh_proto::User::decode(data.payload.as_slice())?;
                Ok(DecodedPacket::NodeInfo {
                    meta,
                    node_name: user.long_name,
                    hardware_model: hardware_model_name(user.hw_model),
                })
            }
            p if p == TELEMETRY_APP => {
                let telemetry = mesh_proto::Telemetry::decode(data.payload.as_slice())?;
                Ok(extract_readings(meta, telemetry))
            }
            other => Err(DecodeError::UnsupportedPacket(other)),
        }
    }
}

/// Flatten a telemetry packet into individual readings. Device and power
/// metrics fall through to `Ignored`.
fn extract_readings(meta: PacketMeta, telemetry: mesh_proto::Telemetry) -> DecodedPacket {
    let sensor_time = i64::from(telemetry.time);
    let node_id = meta.node_id;
    let mut readings = Vec::new();
    let mut zero_dropped = 0u32;

    fn push(out: &mut Vec<Reading>, node_id: NodeId, sensor_time: i64, rt: ReadingType, value: f64) {
        out.push(Reading {
            node_id,
            reading_type: rt,
            value,
            sensor_time,
        });
    }

    match telemetry.variant {
        Some(Variant::EnvironmentMetrics(env)) => {
            for (rt, v) in [
                (ReadingType::Temperature, env.temperature),
                (ReadingType::Humidity, env.relative_humidity),
                (ReadingType::Pressure, env.barometric_pressure),
                (ReadingType::Voc, env.gas_resistance),
                (ReadingType::Lux, env.lux),
                (ReadingType::WindSpeed, env.wind_speed),
                (ReadingType::Rainfall, env.rainfall_1h),
            ] {
                if let Some(v) = v {
                    push(&mut readings, node_id, sensor_time, rt, f64::from(v));
                }
            }
            for (rt, v) in [
                (ReadingType::Iaq, env.iaq),
                (ReadingType::WindDirection, env.wind_direction),
            ] {
                match v {
                    Some(0) => zero_dropped += 1,
                    Some(v) => push(&mut readings, node_id, sensor_time, rt, f64::from(v)),
                    None => {}
                }
            }
        }
        Some(Variant::AirQualityMetrics(air)) => {
            for (rt, v) in [
                (ReadingType::Pm2_5, air.pm25_standard),
                (ReadingType::Pm10, air.pm100_standard),
                (ReadingType::Co2, air.co2),
            ] {
                match v {
                    Some(0) => zero_dropped += 1,
                    Some(v) => push(&mut readings, node_id, sensor_time, rt, f64::from(v)),
                    None => {}
                }
            }
        }
        // Battery levels and INA channel measurements are not environmental
        Some(Variant::DeviceMetrics(_)) | Some(Variant::PowerMetrics(_)) | None => {
            return DecodedPacket::Ignored
        }
    }

    DecodedPacket::Telemetry {
        meta,
        readings,
        zero_dropped,
    }
}
