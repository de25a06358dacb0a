use serde::{Deserialize, Serialize};

// ─── Node Identity ───────────────────────────────────────────────────────────

/// Raw 32-bit mesh node id. The join key inside the pipeline; rendered as
/// `meshtastic_<hex>` only at the output boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Globally unique device identifier used in downstream systems.
    pub fn device_id(&self) -> String {
        format!("meshtastic_{:08x}", self.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Label of the upstream MQTT subscription a packet came through
/// (e.g. `ANZ`, `US`, `EU_868`). Diagnostic only — never used for geography.
pub type RegionTag = String;

pub const DATA_SOURCE: &str = "MESHTASTIC";

/// Placeholder for a geographic code that could not be resolved.
pub const UNKNOWN_CODE: &str = "unknown";

// ─── Readings ────────────────────────────────────────────────────────────────

/// The closed set of environmental quantities this pipeline archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingType {
    Temperature,
    Humidity,
    Pressure,
    Co2,
    Voc,
    Pm2_5,
    Pm10,
    Lux,
    WindSpeed,
    WindDirection,
    Rainfall,
    Iaq,
}

impl ReadingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Pressure => "pressure",
            Self::Co2 => "co2",
            Self::Voc => "voc",
            Self::Pm2_5 => "pm2_5",
            Self::Pm10 => "pm10",
            Self::Lux => "lux",
            Self::WindSpeed => "wind_speed",
            Self::WindDirection => "wind_direction",
            Self::Rainfall => "rainfall",
            Self::Iaq => "iaq",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity => "%",
            Self::Pressure => "hPa",
            Self::Co2 => "ppm",
            Self::Voc => "MΩ",
            Self::Pm2_5 | Self::Pm10 => "µg/m³",
            Self::Lux => "lx",
            Self::WindSpeed => "m/s",
            Self::WindDirection => "°",
            Self::Rainfall => "mm",
            Self::Iaq => "IAQ",
        }
    }

    /// True for quantities carried as integers on the wire. A zero in an
    /// integer field means "unreported", not a measurement of zero.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::Co2 | Self::Pm2_5 | Self::Pm10 | Self::Iaq | Self::WindDirection
        )
    }
}

impl std::fmt::Display for ReadingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One environmental measurement as declared by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub node_id: NodeId,
    pub reading_type: ReadingType,
    pub value: f64,
    /// Unix seconds from the node's clock — the canonical timestamp
    pub sensor_time: i64,
}

// ─── Positions ───────────────────────────────────────────────────────────────

/// Last-known whereabouts and identity of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub node_id: NodeId,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i32>,
    /// Friendly board name, folded in from NODEINFO when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Unix seconds at which this position was observed by the ingester
    pub received_at: i64,
}

// ─── Enriched Output ─────────────────────────────────────────────────────────

/// The correlated record: one reading joined with its node's position and
/// geographic codes. Produced, written, discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub node_id: NodeId,
    pub reading_type: ReadingType,
    pub value: f64,
    /// Canonical timestamp of the measurement (sensor clock, unix seconds)
    pub sensor_time: i64,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board_model: Option<String>,
    /// ISO 3166-1 alpha-2, lowercase, or `unknown`
    pub country_code: String,
    /// ISO 3166-2 without country prefix, lowercase, or `unknown`
    pub subdivision_code: String,
    /// Unix seconds this ingester observed the position used for the join —
    /// carried for downstream freshness judgement
    pub position_received_at: i64,
    pub received_at: i64,
}

impl EnrichedRecord {
    /// Wide-table row for the columnar insert (one JSON object per line).
    pub fn columnar_row(&self, ingestion_node_id: &str) -> serde_json::Value {
        serde_json::json!({
            "timestamp": self.sensor_time,
            "device_id": self.node_id.device_id(),
            "node_name": self.node_name.as_deref().unwrap_or(""),
            "data_source": DATA_SOURCE,
            "board_model": self.board_model.as_deref().unwrap_or(""),
            "reading_type": self.reading_type.as_str(),
            "value": self.value,
            "unit": self.reading_type.unit(),
            "latitude": self.latitude,
            "longitude": self.longitude,
            "altitude": self.altitude,
            "country": self.country_code,
            "subdivision": self.subdivision_code,
            "ingestion_node_id": ingestion_node_id,
        })
    }

    /// Output topic: `wesense/v1/{country}/{subdivision}/{device_id}/{type}`.
    pub fn republish_topic(&self) -> String {
        format!(
            "wesense/v1/{}/{}/{}/{}",
            self.country_code,
            self.subdivision_code,
            self.node_id.device_id(),
            self.reading_type.as_str()
        )
    }

    /// JSON payload published alongside the columnar write.
    pub fn republish_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "value": self.value,
            "timestamp": self.sensor_time,
            "device_id": self.node_id.device_id(),
            "latitude": self.latitude,
            "longitude": self.longitude,
            "country": self.country_code,
            "subdivision": self.subdivision_code,
            "unit": self.reading_type.unit(),
            "data_source": DATA_SOURCE,
            "board_model": self.board_model.as_deref().unwrap_or(""),
            "reading_type": self.reading_type.as_str(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> EnrichedRecord {
        EnrichedRecord {
            node_id: NodeId(0xa1b2c3d4),
            reading_type: ReadingType::Temperature,
            value: 22.5,
            sensor_time: 1060,
            latitude: -36.8485,
            longitude: 174.7633,
            altitude: Some(33),
            node_name: Some("Ponsonby Weather".to_string()),
            board_model: Some("LILYGO T-Beam".to_string()),
            country_code: "nz".to_string(),
            subdivision_code: "auk".to_string(),
            position_received_at: 1000,
            received_at: 1065,
        }
    }

    #[test]
    fn device_id_is_lowercase_hex() {
        assert_eq!(NodeId(0xa1b2c3d4).device_id(), "meshtastic_a1b2c3d4");
        assert_eq!(NodeId(0xdeadbeef).device_id(), "meshtastic_deadbeef");
        // Small ids are zero-padded so the identifier is stable
        assert_eq!(NodeId(0x2a).device_id(), "meshtastic_0000002a");
    }

    #[test]
    fn republish_topic_shape() {
        assert_eq!(
            record().republish_topic(),
            "wesense/v1/nz/auk/meshtastic_a1b2c3d4/temperature"
        );
    }

    #[test]
    fn republish_topic_with_unknown_codes() {
        let mut rec = record();
        rec.country_code = UNKNOWN_CODE.to_string();
        rec.subdivision_code = UNKNOWN_CODE.to_string();
        assert_eq!(
            rec.republish_topic(),
            "wesense/v1/unknown/unknown/meshtastic_a1b2c3d4/temperature"
        );
    }

    #[test]
    fn republish_payload_fields() {
        let payload = record().republish_payload();
        assert_eq!(payload["value"], 22.5);
        assert_eq!(payload["timestamp"], 1060);
        assert_eq!(payload["device_id"], "meshtastic_a1b2c3d4");
        assert_eq!(payload["country"], "nz");
        assert_eq!(payload["subdivision"], "auk");
        assert_eq!(payload["unit"], "°C");
        assert_eq!(payload["data_source"], "MESHTASTIC");
        assert_eq!(payload["reading_type"], "temperature");
    }

    #[test]
    fn columnar_row_fields() {
        let row = record().columnar_row("ingest-01");
        assert_eq!(row["timestamp"], 1060);
        assert_eq!(row["device_id"], "meshtastic_a1b2c3d4");
        assert_eq!(row["node_name"], "Ponsonby Weather");
        assert_eq!(row["board_model"], "LILYGO T-Beam");
        assert_eq!(row["altitude"], 33);
        assert_eq!(row["ingestion_node_id"], "ingest-01");
    }

    #[test]
    fn integer_reading_types() {
        assert!(ReadingType::Pm2_5.is_integer());
        assert!(ReadingType::Co2.is_integer());
        assert!(!ReadingType::Temperature.is_integer());
        assert!(!ReadingType::WindSpeed.is_integer());
    }

    #[test]
    fn reading_type_serde_is_snake_case() {
        let json = serde_json::to_string(&ReadingType::Pm2_5).unwrap();
        assert_eq!(json, "\"pm2_5\"");
        let back: ReadingType = serde_json::from_str("\"wind_speed\"").unwrap();
        assert_eq!(back, ReadingType::WindSpeed);
    }
}
