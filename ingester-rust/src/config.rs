//! # config
//!
//! All tunables are frozen here at startup from environment + regions file.
//! Anything malformed fails fast with a diagnostic — a restart is the
//! reconfiguration mechanism, there is no runtime reload.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Published key of the default public channel. Overridden with
/// `MESHTASTIC_CHANNEL_KEY` for community deployments.
pub const DEFAULT_CHANNEL_KEY_B64: &str = "1PG7OiApB1nwvP+rz05pAQ==";

const PUBLIC_BROKER: &str = "mqtt.meshtastic.org";
const PUBLIC_USERNAME: &str = "meshdev";
const PUBLIC_PASSWORD: &str = "large4cats";
const PUBLIC_REGIONS: &[&str] = &["ANZ", "US", "EU_868"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Public community brokers, published channel key, built-in region list
    Public,
    /// Operator-supplied brokers and key; regions file is mandatory
    Community,
}

/// One upstream MQTT subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionConfig {
    pub region: String,
    pub broker: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub enabled: bool,
}

/// On-disk shape of one region entry. Keyed by region tag in the file.
#[derive(Debug, Deserialize)]
struct RegionEntry {
    broker: String,
    #[serde(default = "default_mqtt_port")]
    port: u16,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    topic: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct OutputMqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ColumnarConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub table: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl ColumnarConfig {
    /// Wide-table insert endpoint; rows go in the body as JSON lines.
    pub fn insert_url(&self) -> String {
        format!(
            "http://{}:{}/?query=INSERT%20INTO%20{}.{}%20FORMAT%20JSONEachRow",
            self.host, self.port, self.database, self.table
        )
    }
}

#[derive(Debug, Clone)]
pub struct GeocoderConfig {
    /// TSV gazetteer for the offline layer; unset disables it
    pub gazetteer_file: Option<PathBuf>,
    pub online_enabled: bool,
    pub online_endpoint: String,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub channel_key: [u8; 16],
    pub regions: Vec<RegionConfig>,
    pub output_mqtt: Option<OutputMqttConfig>,
    pub columnar: ColumnarConfig,
    pub geocoder: GeocoderConfig,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_rotate_bytes: u64,
    pub log_rotate_files: u32,
    pub ingestion_node_id: String,
    pub health_port: u16,
    pub debug: bool,
}

impl Config {
    /// Load from the real process environment and the regions file.
    pub fn load() -> Result<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();
        let regions_path = env
            .get("MESHTASTIC_REGIONS_FILE")
            .cloned()
            .unwrap_or_else(|| "regions.json".to_string());
        let regions_json = match std::fs::read_to_string(&regions_path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).with_context(|| format!("reading {regions_path}")),
        };
        Self::from_sources(&env, regions_json.as_deref())
    }

    /// Build a config from explicit sources. Split out so tests can drive it
    /// without touching process-global environment.
    pub fn from_sources(env: &HashMap<String, String>, regions_json: Option<&str>) -> Result<Self> {
        let mode = match env.get("MESHTASTIC_MODE").map(String::as_str) {
            None | Some("public") => Mode::Public,
            Some("community") => Mode::Community,
            Some(other) => bail!("MESHTASTIC_MODE must be `public` or `community`, got `{other}`"),
        };

        let key_b64 = env
            .get("MESHTASTIC_CHANNEL_KEY")
            .map(String::as_str)
            .unwrap_or(DEFAULT_CHANNEL_KEY_B64);
        let channel_key = decode_channel_key(key_b64)?;

        let regions = match (regions_json, mode) {
            (Some(json), _) => parse_regions(json)?,
            (None, Mode::Public) => public_regions(),
            (None, Mode::Community) => {
                bail!("community mode requires a regions file (MESHTASTIC_REGIONS_FILE)")
            }
        };
        if !regions.iter().any(|r| r.enabled) {
            bail!("no enabled regions configured");
        }

        let output_mqtt = match env.get("WESENSE_OUTPUT_MQTT_HOST") {
            Some(host) if !host.is_empty() => Some(OutputMqttConfig {
                host: host.clone(),
                port: parse_env(env, "WESENSE_OUTPUT_MQTT_PORT")?.unwrap_or(1883),
                username: env.get("WESENSE_OUTPUT_MQTT_USERNAME").cloned(),
                password: env.get("WESENSE_OUTPUT_MQTT_PASSWORD").cloned(),
            }),
            _ => None,
        };

        let columnar = ColumnarConfig {
            host: env_str(env, "COLUMNAR_HOST", "localhost"),
            port: parse_env(env, "COLUMNAR_PORT")?.unwrap_or(8123),
            database: env_str(env, "COLUMNAR_DATABASE", "wesense"),
            table: env_str(env, "COLUMNAR_TABLE", "sensor_readings"),
            username: env.get("COLUMNAR_USERNAME").cloned(),
            password: env.get("COLUMNAR_PASSWORD").cloned(),
            batch_size: parse_env::<usize>(env, "COLUMNAR_BATCH_SIZE")?
                .filter(|&n| n > 0)
                .unwrap_or(100),
            flush_interval: Duration::from_secs(
                parse_env::<u64>(env, "COLUMNAR_FLUSH_INTERVAL_SECS")?
                    .filter(|&n| n > 0)
                    .unwrap_or(10),
            ),
        };

        let geocoder = GeocoderConfig {
            gazetteer_file: env.get("GAZETTEER_FILE").map(PathBuf::from),
            online_enabled: parse_env::<bool>(env, "GEOCODER_ONLINE")?.unwrap_or(true),
            online_endpoint: env_str(
                env,
                "GEOCODER_ENDPOINT",
                "https://nominatim.openstreetmap.org/reverse",
            ),
            user_agent: env_str(env, "GEOCODER_USER_AGENT", "wesense-ingester/0.1"),
        };

        let ingestion_node_id = env
            .get("INGESTION_NODE_ID")
            .or_else(|| env.get("HOSTNAME"))
            .cloned()
            .unwrap_or_else(|| "wesense-ingester".to_string());

        Ok(Self {
            mode,
            channel_key,
            regions,
            output_mqtt,
            columnar,
            geocoder,
            state_dir: PathBuf::from(env_str(env, "STATE_DIR", ".")),
            log_dir: PathBuf::from(env_str(env, "LOG_DIR", "logs")),
            log_rotate_bytes: parse_env(env, "LOG_ROTATE_BYTES")?.unwrap_or(5 * 1024 * 1024),
            log_rotate_files: parse_env(env, "LOG_ROTATE_FILES")?.unwrap_or(3),
            ingestion_node_id,
            health_port: parse_env(env, "WESENSE_HEALTH_PORT")?.unwrap_or(9090),
            debug: parse_env::<bool>(env, "WESENSE_DEBUG")?.unwrap_or(false),
        })
    }

    pub fn position_cache_path(&self) -> PathBuf {
        self.state_dir.join("position_cache.json")
    }

    pub fn pending_telemetry_path(&self) -> PathBuf {
        self.state_dir.join("pending_telemetry.json")
    }

    pub fn geocoding_cache_path(&self) -> PathBuf {
        self.state_dir.join("geocoding_cache.json")
    }

    pub fn future_timestamps_log_path(&self) -> PathBuf {
        self.log_dir.join("future_timestamps.log")
    }
}

fn decode_channel_key(b64: &str) -> Result<[u8; 16]> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| anyhow!("MESHTASTIC_CHANNEL_KEY is not valid base64: {e}"))?;
    <[u8; 16]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow!("MESHTASTIC_CHANNEL_KEY must decode to 16 bytes, got {}", bytes.len()))
}

fn parse_regions(json: &str) -> Result<Vec<RegionConfig>> {
    // BTreeMap so subscriber start order is stable across runs
    let entries: BTreeMap<String, RegionEntry> =
        serde_json::from_str(json).context("parsing regions file")?;
    if entries.is_empty() {
        bail!("regions file defines no regions");
    }
    Ok(entries
        .into_iter()
        .map(|(region, e)| RegionConfig {
            region,
            broker: e.broker,
            port: e.port,
            username: e.username,
            password: e.password,
            topic: e.topic,
            enabled: e.enabled,
        })
        .collect())
}

fn public_regions() -> Vec<RegionConfig> {
    PUBLIC_REGIONS
        .iter()
        .map(|region| RegionConfig {
            region: region.to_string(),
            broker: PUBLIC_BROKER.to_string(),
            port: 1883,
            username: Some(PUBLIC_USERNAME.to_string()),
            password: Some(PUBLIC_PASSWORD.to_string()),
            topic: format!("msh/{region}/#"),
            enabled: true,
        })
        .collect()
}

fn env_str(env: &HashMap<String, String>, key: &str, default: &str) -> String {
    env.get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

/// Parse an optional env var, failing fast on a malformed value instead of
/// silently falling back to the default.
fn parse_env<T: std::str::FromStr>(env: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env.get(key) {
        None => Ok(None),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("{key}=`{v}` is invalid: {e}")),
    }
}
