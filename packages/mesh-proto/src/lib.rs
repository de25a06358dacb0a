//! # mesh-proto
//!
//! Shared Meshtastic wire structures for the WeSense ingestion pipeline.
//!
//! These types are used by:
//! - `ingester-rust`: decoding ServiceEnvelopes received from the public
//!   MQTT bridges and the decrypted inner packets
//! - tooling and tests: building known envelopes byte-for-byte
//!
//! Only the subset of the Meshtastic protobuf schema that this system
//! consumes is declared here. Field tags match the upstream `.proto`
//! definitions; undeclared fields are skipped by prost on decode, so packets
//! from newer firmware remain parseable.
//!
//! ## Invariants
//! - Enumeration-typed fields are kept as raw `i32` so unknown enum values
//!   survive decode instead of failing it.
//! - `latitude_i` / `longitude_i` are degrees × 1e7 (signed); conversion to
//!   floating degrees happens in the consumer, not here.

use prost::Message;

// ── Port numbers ──────────────────────────────────────────────────────────────

/// Application port carried in `Data.portnum`. Only the ports this pipeline
/// handles are named; everything else falls through as its raw value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    UnknownApp = 0,
    TextMessageApp = 1,
    PositionApp = 3,
    NodeinfoApp = 4,
    RoutingApp = 5,
    AdminApp = 6,
    TelemetryApp = 67,
    TracerouteApp = 70,
    NeighborinfoApp = 71,
    MapReportApp = 73,
}

pub const POSITION_APP: i32 = PortNum::PositionApp as i32;
pub const NODEINFO_APP: i32 = PortNum::NodeinfoApp as i32;
pub const TELEMETRY_APP: i32 = PortNum::TelemetryApp as i32;

// ── Envelope and packet ───────────────────────────────────────────────────────

/// Outer message published by a Meshtastic MQTT gateway: the mesh packet plus
/// which channel and gateway it came through.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceEnvelope {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    #[prost(string, tag = "2")]
    pub channel_id: String,
    #[prost(string, tag = "3")]
    pub gateway_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MeshPacket {
    /// Source node id (the join key of the whole pipeline)
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<mesh_packet::PayloadVariant>,
    /// Per-sender packet id; combined with `from` it fingerprints a flood
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
}

pub mod mesh_packet {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        /// Cleartext inner packet (rare on the public bridges)
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        /// AES-CTR ciphertext of an encoded `Data`
        #[prost(bytes = "vec", tag = "5")]
        Encrypted(Vec<u8>),
    }
}

/// The decrypted inner packet: an application port plus its payload bytes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
}

// ── Application payloads ──────────────────────────────────────────────────────

/// POSITION_APP payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Position {
    /// Degrees × 1e7
    #[prost(sfixed32, optional, tag = "1")]
    pub latitude_i: Option<i32>,
    /// Degrees × 1e7
    #[prost(sfixed32, optional, tag = "2")]
    pub longitude_i: Option<i32>,
    /// Meters above MSL
    #[prost(int32, optional, tag = "3")]
    pub altitude: Option<i32>,
    /// Unix seconds as declared by the node's clock
    #[prost(fixed32, tag = "4")]
    pub time: u32,
}

/// NODEINFO_APP payload — the node's self-description.
#[derive(Clone, PartialEq, prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(enumeration = "HardwareModel", tag = "5")]
    pub hw_model: i32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
}

/// TELEMETRY_APP payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Telemetry {
    /// Unix seconds as declared by the node's clock
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(oneof = "telemetry::Variant", tags = "2, 3, 4, 5")]
    pub variant: Option<telemetry::Variant>,
}

pub mod telemetry {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Variant {
        /// Battery/uptime self-reporting — not environmental, dropped upstream
        #[prost(message, tag = "2")]
        DeviceMetrics(super::DeviceMetrics),
        #[prost(message, tag = "3")]
        EnvironmentMetrics(super::EnvironmentMetrics),
        #[prost(message, tag = "4")]
        AirQualityMetrics(super::AirQualityMetrics),
        /// INA2xx channel measurements — not environmental, dropped upstream
        #[prost(message, tag = "5")]
        PowerMetrics(super::PowerMetrics),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceMetrics {
    #[prost(uint32, optional, tag = "1")]
    pub battery_level: Option<u32>,
    #[prost(float, optional, tag = "2")]
    pub voltage: Option<f32>,
}

/// Weather-station style measurements. All fields optional; absent means the
/// sensor does not report that quantity.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EnvironmentMetrics {
    /// °C
    #[prost(float, optional, tag = "1")]
    pub temperature: Option<f32>,
    /// %RH
    #[prost(float, optional, tag = "2")]
    pub relative_humidity: Option<f32>,
    /// hPa
    #[prost(float, optional, tag = "3")]
    pub barometric_pressure: Option<f32>,
    /// MΩ, VOC proxy from BME680-class sensors
    #[prost(float, optional, tag = "4")]
    pub gas_resistance: Option<f32>,
    /// Bosch IAQ index, 0–500
    #[prost(uint32, optional, tag = "7")]
    pub iaq: Option<u32>,
    /// Lux
    #[prost(float, optional, tag = "9")]
    pub lux: Option<f32>,
    /// Degrees, 0 = north
    #[prost(uint32, optional, tag = "13")]
    pub wind_direction: Option<u32>,
    /// m/s
    #[prost(float, optional, tag = "14")]
    pub wind_speed: Option<f32>,
    /// mm over the trailing hour
    #[prost(float, optional, tag = "19")]
    pub rainfall_1h: Option<f32>,
}

/// Particulate-matter counts from PMS5003-class sensors plus CO₂.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AirQualityMetrics {
    /// µg/m³, PM2.5 standard particle
    #[prost(uint32, optional, tag = "2")]
    pub pm25_standard: Option<u32>,
    /// µg/m³, PM10 standard particle
    #[prost(uint32, optional, tag = "3")]
    pub pm100_standard: Option<u32>,
    /// ppm
    #[prost(uint32, optional, tag = "13")]
    pub co2: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PowerMetrics {
    #[prost(float, optional, tag = "1")]
    pub ch1_voltage: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub ch1_current: Option<f32>,
}

// ── Hardware models ───────────────────────────────────────────────────────────

/// Board identifiers seen in `User.hw_model`. A practical subset of the
/// upstream enum; values outside it are still decoded (the field is `i32`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum HardwareModel {
    Unset = 0,
    TloraV2 = 1,
    TloraV1 = 2,
    TloraV211p6 = 3,
    Tbeam = 4,
    HeltecV20 = 5,
    TbeamV0p7 = 6,
    TEcho = 7,
    TloraV11p3 = 8,
    Rak4631 = 9,
    HeltecV21 = 10,
    HeltecV1 = 11,
    LilygoTbeamS3Core = 12,
    Rak11200 = 13,
    NanoG1 = 14,
    TloraV211p8 = 15,
    TloraT3S3 = 16,
    NanoG1Explorer = 17,
    NanoG2Ultra = 18,
    StationG1 = 25,
    Rak11310 = 26,
    Rp2040Lora = 30,
    StationG2 = 31,
    Portduino = 37,
    DiyV1 = 39,
    M5stack = 42,
    HeltecV3 = 43,
    HeltecWslV3 = 44,
    RpiPico = 47,
    HeltecWirelessTracker = 48,
    HeltecWirelessPaper = 49,
    TDeck = 50,
    TWatchS3 = 51,
    PicomputerS3 = 52,
    SensecapIndicator = 70,
    TrackerT1000E = 71,
}

impl HardwareModel {
    /// Friendly product name for display and downstream records.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Unset => "UNKNOWN",
            Self::TloraV2 | Self::TloraV211p6 | Self::TloraV211p8 => "LILYGO T-LoRa V2",
            Self::TloraV1 | Self::TloraV11p3 => "LILYGO T-LoRa V1",
            Self::TloraT3S3 => "LILYGO T3-S3",
            Self::Tbeam | Self::TbeamV0p7 => "LILYGO T-Beam",
            Self::LilygoTbeamS3Core => "LILYGO T-Beam S3 Core",
            Self::TEcho => "LILYGO T-Echo",
            Self::TDeck => "LILYGO T-Deck",
            Self::TWatchS3 => "LILYGO T-Watch S3",
            Self::PicomputerS3 => "LILYGO T-Picomputer S3",
            Self::HeltecV1 => "Heltec V1",
            Self::HeltecV20 | Self::HeltecV21 => "Heltec V2",
            Self::HeltecV3 => "Heltec V3",
            Self::HeltecWslV3 => "Heltec WSL V3",
            Self::HeltecWirelessTracker => "Heltec Wireless Tracker",
            Self::HeltecWirelessPaper => "Heltec Wireless Paper",
            Self::Rak4631 => "RAK WisBlock 4631",
            Self::Rak11200 => "RAK WisBlock 11200",
            Self::Rak11310 => "RAK WisBlock 11310",
            Self::NanoG1 => "B&Q Nano G1",
            Self::NanoG1Explorer => "B&Q Nano G1 Explorer",
            Self::NanoG2Ultra => "B&Q Nano G2 Ultra",
            Self::StationG1 => "B&Q Station G1",
            Self::StationG2 => "B&Q Station G2",
            Self::RpiPico | Self::Rp2040Lora => "Raspberry Pi Pico LoRa",
            Self::SensecapIndicator => "Seeed SenseCAP Indicator",
            Self::TrackerT1000E => "Seeed Tracker T1000-E",
            Self::M5stack => "M5Stack",
            Self::Portduino => "Portduino (native)",
            Self::DiyV1 => "DIY V1",
        }
    }
}

/// Normalize a wire hardware-model value to a display name.
///
/// Values outside the declared enum render as `HW_<n>` so new boards degrade
/// gracefully instead of failing decode. The table is a living artefact —
/// extend the enum and `display_name` as new boards show up in the field.
pub fn hardware_model_name(value: i32) -> String {
    match HardwareModel::try_from(value) {
        Ok(model) => model.display_name().to_string(),
        Err(_) => format!("HW_{value}"),
    }
}

/// Encode any of the message types above to bytes. Convenience for tests and
/// tooling; the ingester itself only decodes.
pub fn encode_to_vec<M: Message>(msg: &M) -> Vec<u8> {
    let mut buf = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut buf).expect("Vec<u8> write is infallible");
    buf
}
