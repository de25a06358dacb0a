//! # geocode
//!
//! Coordinates → (country, subdivision) ISO codes, in two layers.
//!
//! **L1** is a cache keyed by coordinates rounded to 3 decimal places
//! (~100 m), shared between the correlator (read path, memory only) and the
//! resolver worker (write path). The lock is held only across single-map
//! operations, never across I/O. The cache is monotonic: a stored resolution
//! is only ever replaced when it upgrades a previously-`unknown` result.
//!
//! **L2** runs on the worker: first the offline gazetteer (nearest city
//! within an acceptance radius), then — if enabled — an online reverse
//! geocoder paced to one request per second with a politeness `User-Agent`.
//!
//! The correlator's path is cache-only by contract: a miss yields
//! `(unknown, unknown)` immediately and enqueues a resolve job. Records
//! already emitted with `unknown` are never re-emitted; later readings from
//! the same locality pick up the stored answer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::config::GeocoderConfig;
use crate::gazetteer::Gazetteer;
use crate::iso;
use crate::metrics::Metrics;
use crate::model::UNKNOWN_CODE;
use crate::persistence;

pub const RESOLVE_QUEUE_CAPACITY: usize = 64;
pub const ONLINE_MIN_INTERVAL: Duration = Duration::from_secs(1);
/// A nearest city further than this is not evidence of jurisdiction
/// (open ocean, Null Island)
pub const GAZETTEER_MAX_KM: f64 = 200.0;

// ── Keys and codes ────────────────────────────────────────────────────────────

/// Coordinates rounded to 3 decimals (~100 m), collapsing near-identical
/// positions into one lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeoKey {
    lat_e3: i32,
    lon_e3: i32,
}

impl GeoKey {
    pub fn from_coords(lat: f64, lon: f64) -> Self {
        Self {
            lat_e3: (lat * 1000.0).round() as i32,
            lon_e3: (lon * 1000.0).round() as i32,
        }
    }

    pub fn lat(&self) -> f64 {
        f64::from(self.lat_e3) / 1000.0
    }

    pub fn lon(&self) -> f64 {
        f64::from(self.lon_e3) / 1000.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoCodes {
    pub country: String,
    pub subdivision: String,
}

impl GeoCodes {
    pub fn unknown() -> Self {
        Self {
            country: UNKNOWN_CODE.to_string(),
            subdivision: UNKNOWN_CODE.to_string(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.country != UNKNOWN_CODE
    }
}

/// Convert resolver output (free-text names) to codes via the static tables.
/// Unmapped names degrade to `unknown` and are logged for table extension.
fn codes_from_names(country_name: &str, admin1_name: Option<&str>) -> GeoCodes {
    let Some(cc) = iso::country_code(country_name) else {
        if !country_name.is_empty() {
            info!("geocode: country name `{country_name}` not in ISO table");
        }
        return GeoCodes::unknown();
    };
    let subdivision = match admin1_name {
        Some(admin1) if !admin1.is_empty() => match iso::subdivision_code(cc, admin1) {
            Some(code) => code.to_string(),
            None => {
                debug!("geocode: admin1 `{admin1}` not in ISO table for {cc}");
                UNKNOWN_CODE.to_string()
            }
        },
        _ => UNKNOWN_CODE.to_string(),
    };
    GeoCodes {
        country: cc.to_string(),
        subdivision,
    }
}

// ── L1 cache ──────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct StoredGeoEntry {
    lat_e3: i32,
    lon_e3: i32,
    country: String,
    subdivision: String,
}

/// Shared rounded-key cache. Cloning shares the underlying map.
#[derive(Clone)]
pub struct GeoCache {
    inner: Arc<RwLock<HashMap<GeoKey, GeoCodes>>>,
}

impl GeoCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn load(path: &std::path::Path) -> Self {
        let cache = Self::new();
        if let Some(entries) = persistence::load_json::<Vec<StoredGeoEntry>>(path).await {
            let mut map = cache.inner.write().await;
            for e in entries {
                map.insert(
                    GeoKey {
                        lat_e3: e.lat_e3,
                        lon_e3: e.lon_e3,
                    },
                    GeoCodes {
                        country: e.country,
                        subdivision: e.subdivision,
                    },
                );
            }
            info!("geocoding cache: restored {} localities from {}", map.len(), path.display());
        }
        cache
    }

    pub async fn get(&self, key: GeoKey) -> Option<GeoCodes> {
        self.inner.read().await.get(&key).cloned()
    }

    /// Store a resolution without ever downgrading one: vacant keys accept
    /// anything, occupied keys only upgrade `unknown` → resolved. Returns
    /// whether the map changed.
    pub async fn insert_monotonic(&self, key: GeoKey, codes: GeoCodes) -> bool {
        let mut map = self.inner.write().await;
        match map.get(&key) {
            None => {
                map.insert(key, codes);
                true
            }
            Some(existing) if !existing.is_resolved() && codes.is_resolved() => {
                map.insert(key, codes);
                true
            }
            Some(_) => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn snapshot_json(&self) -> String {
        let map = self.inner.read().await;
        let entries: Vec<StoredGeoEntry> = map
            .iter()
            .map(|(k, v)| StoredGeoEntry {
                lat_e3: k.lat_e3,
                lon_e3: k.lon_e3,
                country: v.country.clone(),
                subdivision: v.subdivision.clone(),
            })
            .collect();
        serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string())
    }
}

// ── Correlator-facing handle ──────────────────────────────────────────────────

/// What the correlator holds: cache reads plus a coalescing resolve queue.
#[derive(Clone)]
pub struct GeocoderHandle {
    cache: GeoCache,
    resolve_tx: mpsc::Sender<GeoKey>,
    metrics: Arc<Metrics>,
}

impl GeocoderHandle {
    pub fn new(cache: GeoCache, resolve_tx: mpsc::Sender<GeoKey>, metrics: Arc<Metrics>) -> Self {
        Self {
            cache,
            resolve_tx,
            metrics,
        }
    }

    /// Kick off resolution for a locality without consuming the answer.
    /// Called when a position is cached, so that by the time its telemetry
    /// arrives the L1 cache usually already holds the codes.
    pub async fn warm(&self, lat: f64, lon: f64) {
        let key = GeoKey::from_coords(lat, lon);
        if self.cache.get(key).await.is_none() {
            let _ = self.resolve_tx.try_send(key);
        }
    }

    /// Cache-only lookup. On a miss the record gets `unknown` immediately and
    /// a resolve job is enqueued; a full queue just drops the request —
    /// the next reading from that locality re-requests it.
    pub async fn lookup_or_request(&self, lat: f64, lon: f64) -> GeoCodes {
        let key = GeoKey::from_coords(lat, lon);
        if let Some(codes) = self.cache.get(key).await {
            Metrics::incr(&self.metrics.geocode_cache_hits);
            return codes;
        }
        Metrics::incr(&self.metrics.geocode_cache_misses);
        if self.resolve_tx.try_send(key).is_err() {
            debug!("geocode: resolve queue full, dropping request for {key:?}");
        }
        GeoCodes::unknown()
    }
}

// ── Resolver worker ───────────────────────────────────────────────────────────

struct OnlineResolver {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct ReverseResponse {
    address: Option<ReverseAddress>,
}

#[derive(Deserialize)]
struct ReverseAddress {
    country: Option<String>,
    state: Option<String>,
    province: Option<String>,
    county: Option<String>,
}

impl OnlineResolver {
    fn new(endpoint: String, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, endpoint })
    }

    /// One reverse lookup: free-text country plus best-effort admin1.
    async fn reverse(&self, lat: f64, lon: f64) -> anyhow::Result<Option<(String, Option<String>)>> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("format", "jsonv2".to_string()),
                ("zoom", "5".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body: ReverseResponse = response.json().await?;
        Ok(body.address.and_then(|a| {
            let admin1 = a.state.or(a.province).or(a.county);
            a.country.map(|c| (c, admin1))
        }))
    }
}

pub struct Geocoder {
    cache: GeoCache,
    gazetteer: Option<Gazetteer>,
    online: Option<OnlineResolver>,
    snapshot_path: PathBuf,
    metrics: Arc<Metrics>,
    last_online: Option<Instant>,
}

impl Geocoder {
    /// Build the worker and its correlator-facing handle. Gazetteer load
    /// failures disable the offline layer rather than aborting startup.
    pub async fn new(
        config: &GeocoderConfig,
        snapshot_path: PathBuf,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<(Self, GeocoderHandle, mpsc::Receiver<GeoKey>)> {
        let cache = GeoCache::load(&snapshot_path).await;

        let gazetteer = match &config.gazetteer_file {
            Some(path) => match Gazetteer::load(path) {
                Ok(g) => Some(g),
                Err(e) => {
                    warn!("gazetteer unavailable, offline layer disabled: {e:#}");
                    None
                }
            },
            None => None,
        };

        let online = if config.online_enabled {
            Some(OnlineResolver::new(
                config.online_endpoint.clone(),
                &config.user_agent,
            )?)
        } else {
            None
        };

        let (resolve_tx, resolve_rx) = mpsc::channel(RESOLVE_QUEUE_CAPACITY);
        let handle = GeocoderHandle {
            cache: cache.clone(),
            resolve_tx,
            metrics: metrics.clone(),
        };
        Ok((
            Self {
                cache,
                gazetteer,
                online,
                snapshot_path,
                metrics,
                last_online: None,
            },
            handle,
            resolve_rx,
        ))
    }

    /// Worker loop. Exits (flushing the cache) when every handle is dropped.
    pub async fn run(mut self, mut resolve_rx: mpsc::Receiver<GeoKey>) {
        while let Some(key) = resolve_rx.recv().await {
            // Coalescing: requests queued behind a now-resolved key are no-ops
            if matches!(self.cache.get(key).await, Some(codes) if codes.is_resolved()) {
                continue;
            }
            let codes = self.resolve(key).await;
            if self.cache.insert_monotonic(key, codes).await {
                self.flush().await;
            }
        }
        self.flush().await;
        info!("geocoder: worker stopped");
    }

    /// L2 resolution: gazetteer first, online second, `unknown` if neither
    /// can answer. Stored either way so the queue is not hammered for
    /// localities nobody can resolve.
    async fn resolve(&mut self, key: GeoKey) -> GeoCodes {
        let (lat, lon) = (key.lat(), key.lon());

        if let Some(gazetteer) = &self.gazetteer {
            if let Some((entry, distance_km)) = gazetteer.nearest(lat, lon) {
                if distance_km <= GAZETTEER_MAX_KM {
                    let codes = codes_from_names(&entry.country, Some(&entry.admin1));
                    if codes.is_resolved() {
                        Metrics::incr(&self.metrics.geocode_resolved_offline);
                        debug!(
                            "geocode: ({lat:.3}, {lon:.3}) → {}/{} via {} ({distance_km:.0} km)",
                            codes.country, codes.subdivision, entry.name
                        );
                        return codes;
                    }
                }
            }
        }

        if let Some(online) = &self.online {
            // Global 1 req/s politeness limit
            if let Some(last) = self.last_online {
                let elapsed = last.elapsed();
                if elapsed < ONLINE_MIN_INTERVAL {
                    tokio::time::sleep(ONLINE_MIN_INTERVAL - elapsed).await;
                }
            }
            self.last_online = Some(Instant::now());
            match online.reverse(lat, lon).await {
                Ok(Some((country, admin1))) => {
                    let codes = codes_from_names(&country, admin1.as_deref());
                    if codes.is_resolved() {
                        Metrics::incr(&self.metrics.geocode_resolved_online);
                        return codes;
                    }
                }
                Ok(None) => debug!("geocode: online resolver had no address for ({lat}, {lon})"),
                Err(e) => warn!("geocode: online lookup failed for ({lat}, {lon}): {e}"),
            }
        }

        Metrics::incr(&self.metrics.geocode_unresolved);
        GeoCodes::unknown()
    }

    pub async fn flush(&self) {
        let json = self.cache.snapshot_json().await;
        if let Err(e) = persistence::write_atomic(&self.snapshot_path, &json).await {
            warn!("geocoding cache: snapshot failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gazetteer::GazetteerEntry;

    fn auckland_gazetteer() -> Gazetteer {
        Gazetteer::from_entries(vec![GazetteerEntry {
            name: "Auckland".to_string(),
            lat: -36.8485,
            lon: 174.7633,
            country: "New Zealand".to_string(),
            admin1: "Auckland".to_string(),
        }])
    }

    fn test_metrics() -> Arc<Metrics> {
        Metrics::new(&[])
    }

    fn offline_geocoder(dir: &std::path::Path, gazetteer: Option<Gazetteer>) -> Geocoder {
        Geocoder {
            cache: GeoCache::new(),
            gazetteer,
            online: None,
            snapshot_path: dir.join("geocoding_cache.json"),
            metrics: test_metrics(),
            last_online: None,
        }
    }

    #[test]
    fn geo_key_rounds_to_three_decimals() {
        let key = GeoKey::from_coords(-36.84851, 174.76331);
        assert_eq!(key.lat(), -36.849);
        assert_eq!(key.lon(), 174.763);
        // ~100 m apart → same key
        assert_eq!(
            GeoKey::from_coords(-36.8485, 174.7633),
            GeoKey::from_coords(-36.8487, 174.7629)
        );
        // Null Island stays distinct from its neighbours
        assert_eq!(GeoKey::from_coords(0.0, 0.0).lat(), 0.0);
    }

    #[test]
    fn names_map_through_iso_tables() {
        let codes = codes_from_names("New Zealand", Some("Auckland"));
        assert_eq!(codes.country, "nz");
        assert_eq!(codes.subdivision, "auk");

        let codes = codes_from_names("New Zealand", Some("Middle Earth"));
        assert_eq!(codes.country, "nz");
        assert_eq!(codes.subdivision, "unknown");

        let codes = codes_from_names("Atlantis", Some("Poseidonis"));
        assert!(!codes.is_resolved());
    }

    #[tokio::test]
    async fn cache_is_monotonic() {
        let cache = GeoCache::new();
        let key = GeoKey::from_coords(-36.8485, 174.7633);

        // Vacant accepts even unknown
        assert!(cache.insert_monotonic(key, GeoCodes::unknown()).await);
        // unknown → resolved upgrades
        let auk = GeoCodes {
            country: "nz".to_string(),
            subdivision: "auk".to_string(),
        };
        assert!(cache.insert_monotonic(key, auk.clone()).await);
        // resolved is never overwritten
        let other = GeoCodes {
            country: "au".to_string(),
            subdivision: "nsw".to_string(),
        };
        assert!(!cache.insert_monotonic(key, other).await);
        assert!(!cache.insert_monotonic(key, GeoCodes::unknown()).await);
        assert_eq!(cache.get(key).await.unwrap(), auk);
    }

    #[tokio::test]
    async fn cache_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geocoding_cache.json");

        let cache = GeoCache::new();
        let key = GeoKey::from_coords(51.5074, -0.1278);
        cache
            .insert_monotonic(
                key,
                GeoCodes {
                    country: "gb".to_string(),
                    subdivision: "eng".to_string(),
                },
            )
            .await;
        persistence::write_atomic(&path, &cache.snapshot_json().await)
            .await
            .unwrap();

        let restored = GeoCache::load(&path).await;
        assert_eq!(restored.len().await, 1);
        let codes = restored.get(key).await.unwrap();
        assert_eq!(codes.country, "gb");
        assert_eq!(codes.subdivision, "eng");
    }

    #[tokio::test]
    async fn warm_enqueues_only_on_miss() {
        let cache = GeoCache::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = GeocoderHandle::new(cache.clone(), tx, test_metrics());

        handle.warm(-36.8485, 174.7633).await;
        assert_eq!(rx.try_recv().unwrap(), GeoKey::from_coords(-36.8485, 174.7633));

        cache
            .insert_monotonic(
                GeoKey::from_coords(-36.8485, 174.7633),
                GeoCodes {
                    country: "nz".to_string(),
                    subdivision: "auk".to_string(),
                },
            )
            .await;
        handle.warm(-36.8485, 174.7633).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn handle_miss_returns_unknown_and_enqueues() {
        let cache = GeoCache::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = GeocoderHandle {
            cache: cache.clone(),
            resolve_tx: tx,
            metrics: test_metrics(),
        };

        let codes = handle.lookup_or_request(-36.8485, 174.7633).await;
        assert!(!codes.is_resolved());
        assert_eq!(rx.try_recv().unwrap(), GeoKey::from_coords(-36.8485, 174.7633));

        // Once resolved, the same coordinates hit the cache
        cache
            .insert_monotonic(
                GeoKey::from_coords(-36.8485, 174.7633),
                GeoCodes {
                    country: "nz".to_string(),
                    subdivision: "auk".to_string(),
                },
            )
            .await;
        let codes = handle.lookup_or_request(-36.8485, 174.7633).await;
        assert_eq!(codes.country, "nz");
        assert!(rx.try_recv().is_err(), "hit must not enqueue");
    }

    #[tokio::test]
    async fn offline_resolution_via_gazetteer() {
        let dir = tempfile::tempdir().unwrap();
        let mut geocoder = offline_geocoder(dir.path(), Some(auckland_gazetteer()));

        let codes = geocoder.resolve(GeoKey::from_coords(-36.85, 174.76)).await;
        assert_eq!(codes.country, "nz");
        assert_eq!(codes.subdivision, "auk");
    }

    #[tokio::test]
    async fn null_island_is_beyond_gazetteer_reach() {
        let dir = tempfile::tempdir().unwrap();
        let mut geocoder = offline_geocoder(dir.path(), Some(auckland_gazetteer()));

        let codes = geocoder.resolve(GeoKey::from_coords(0.0, 0.0)).await;
        assert!(!codes.is_resolved());
    }

    #[tokio::test]
    async fn no_layers_resolves_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let mut geocoder = offline_geocoder(dir.path(), None);
        let codes = geocoder.resolve(GeoKey::from_coords(48.8566, 2.3522)).await;
        assert!(!codes.is_resolved());
    }

    #[tokio::test]
    async fn worker_resolves_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot_path = dir.path().join("geocoding_cache.json");
        let cache = GeoCache::new();
        let geocoder = Geocoder {
            cache: cache.clone(),
            gazetteer: Some(auckland_gazetteer()),
            online: None,
            snapshot_path: snapshot_path.clone(),
            metrics: test_metrics(),
            last_online: None,
        };

        let (tx, rx) = mpsc::channel(4);
        let worker = tokio::spawn(geocoder.run(rx));
        tx.send(GeoKey::from_coords(-36.8485, 174.7633)).await.unwrap();
        drop(tx); // closes the queue; worker drains and flushes
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();

        let codes = cache.get(GeoKey::from_coords(-36.8485, 174.7633)).await.unwrap();
        assert_eq!(codes.country, "nz");
        assert!(snapshot_path.exists());
    }
}
