//! # gazetteer
//!
//! Offline nearest-city lookup. The dataset is a TSV of populated points
//! (`name <TAB> lat <TAB> lon <TAB> country <TAB> admin1`), loaded whole into
//! memory. Nearest neighbour is a linear haversine scan — the bundled files
//! are tens of thousands of rows, well under a millisecond per query, so no
//! spatial index is warranted.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct GazetteerEntry {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// Free-text country name, mapped to ISO by the geocoder
    pub country: String,
    /// Free-text first-level subdivision name
    pub admin1: String,
}

pub struct Gazetteer {
    entries: Vec<GazetteerEntry>,
}

impl Gazetteer {
    pub fn from_entries(entries: Vec<GazetteerEntry>) -> Self {
        Self { entries }
    }

    /// Parse the TSV dataset. Malformed lines are skipped with a count, not
    /// fatal — a partly usable gazetteer beats none.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading gazetteer {}", path.display()))?;
        let mut entries = Vec::new();
        let mut skipped = 0usize;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let parsed = (|| -> Option<GazetteerEntry> {
                Some(GazetteerEntry {
                    name: fields.first()?.to_string(),
                    lat: fields.get(1)?.parse().ok()?,
                    lon: fields.get(2)?.parse().ok()?,
                    country: fields.get(3)?.to_string(),
                    admin1: fields.get(4)?.to_string(),
                })
            })();
            match parsed {
                Some(entry) => entries.push(entry),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!("gazetteer: skipped {skipped} malformed lines in {}", path.display());
        }
        info!("gazetteer: loaded {} places from {}", entries.len(), path.display());
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Nearest populated point to the query coordinates, with its distance in
    /// kilometers. The caller applies the acceptance cutoff — open-ocean
    /// queries have a nearest city too, it just isn't meaningful.
    pub fn nearest(&self, lat: f64, lon: f64) -> Option<(&GazetteerEntry, f64)> {
        self.entries
            .iter()
            .map(|e| (haversine_km(lat, lon, e.lat, e.lon), e))
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(d, e)| (e, d))
    }
}

/// Great-circle distance in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Gazetteer {
        Gazetteer::from_entries(vec![
            GazetteerEntry {
                name: "Auckland".to_string(),
                lat: -36.8485,
                lon: 174.7633,
                country: "New Zealand".to_string(),
                admin1: "Auckland".to_string(),
            },
            GazetteerEntry {
                name: "Wellington".to_string(),
                lat: -41.2866,
                lon: 174.7756,
                country: "New Zealand".to_string(),
                admin1: "Wellington".to_string(),
            },
            GazetteerEntry {
                name: "London".to_string(),
                lat: 51.5074,
                lon: -0.1278,
                country: "United Kingdom".to_string(),
                admin1: "England".to_string(),
            },
        ])
    }

    #[test]
    fn haversine_known_distance() {
        // Auckland ↔ Wellington is about 493 km
        let d = haversine_km(-36.8485, 174.7633, -41.2866, 174.7756);
        assert!((d - 493.0).abs() < 5.0, "got {d}");
        assert_eq!(haversine_km(10.0, 20.0, 10.0, 20.0), 0.0);
    }

    #[test]
    fn nearest_picks_closest_city() {
        let g = sample();
        // Just north of Auckland CBD
        let (hit, dist) = g.nearest(-36.80, 174.75).unwrap();
        assert_eq!(hit.name, "Auckland");
        assert!(dist < 10.0, "got {dist}");
        // Central London
        let (hit, _) = g.nearest(51.50, -0.12).unwrap();
        assert_eq!(hit.admin1, "England");
    }

    #[test]
    fn empty_gazetteer_returns_none() {
        let g = Gazetteer::from_entries(Vec::new());
        assert!(g.nearest(0.0, 0.0).is_none());
    }

    #[test]
    fn load_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cities.tsv");
        std::fs::write(
            &path,
            "# name\tlat\tlon\tcountry\tadmin1\n\
             Auckland\t-36.8485\t174.7633\tNew Zealand\tAuckland\n\
             broken line without tabs\n\
             Wellington\tnot-a-number\t174.77\tNew Zealand\tWellington\n\
             London\t51.5074\t-0.1278\tUnited Kingdom\tEngland\n",
        )
        .unwrap();
        let g = Gazetteer::load(&path).unwrap();
        assert_eq!(g.len(), 2);
        assert_eq!(g.nearest(52.0, 0.0).unwrap().0.name, "London");
    }
}
