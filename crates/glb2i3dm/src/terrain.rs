//! Ground height lookup used to clamp generated instances to terrain.
//!
//! Order: external height service (bounded timeout) -> region table -> 0.0.
//! This is an estimate; failures of the service are recovered, never reported.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

use crate::GeoBboxDeg;

#[derive(Error, Debug)]
pub enum TerrainError {
    #[error("height service unavailable: {0}")]
    Upstream(String),
}

/// A remote (or otherwise fallible) source of ground heights.
pub trait HeightSource: Send + Sync {
    fn query(&self, lon: f64, lat: f64) -> Result<f64, TerrainError>;
}

pub struct HttpHeightService {
    client: reqwest::blocking::Client,
    url: String,
}

#[derive(Deserialize)]
struct HeightResponse {
    height: Option<f64>,
}

impl HttpHeightService {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TerrainError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| TerrainError::Upstream(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl HeightSource for HttpHeightService {
    fn query(&self, lon: f64, lat: f64) -> Result<f64, TerrainError> {
        let upstream = |e: reqwest::Error| TerrainError::Upstream(e.to_string());

        let response = self
            .client
            .get(&self.url)
            .query(&[("lon", lon), ("lat", lat)])
            .send()
            .map_err(upstream)?;

        if !response.status().is_success() {
            return Err(TerrainError::Upstream(format!("status {}", response.status())));
        }

        // A reply without a height means "ground at the ellipsoid".
        let height = response.json::<HeightResponse>().map_err(upstream)?.height.unwrap_or(0.0);
        if !height.is_finite() {
            return Err(TerrainError::Upstream(format!("non-finite height {height}")));
        }

        Ok(height)
    }
}

/// Constant ground height inside an inclusive lon/lat rectangle.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegionRule {
    pub name: String,
    pub lon_min: f64,
    pub lon_max: f64,
    pub lat_min: f64,
    pub lat_max: f64,
    pub height: f64,
}

impl RegionRule {
    fn new(name: &str, lon: (f64, f64), lat: (f64, f64), height: f64) -> Self {
        Self {
            name: name.to_owned(),
            lon_min: lon.0,
            lon_max: lon.1,
            lat_min: lat.0,
            lat_max: lat.1,
            height,
        }
    }

    #[inline]
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        (self.lon_min..=self.lon_max).contains(&lon) && (self.lat_min..=self.lat_max).contains(&lat)
    }
}

/// Ordered rules, first match wins, `default_height` otherwise.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegionTable {
    pub rules: Vec<RegionRule>,
    #[serde(default)]
    pub default_height: f64,
}

impl Default for RegionTable {
    /// Coarse Vietnam terrain bands; lowlands fall through to 0 m.
    fn default() -> Self {
        Self {
            rules: vec![
                RegionRule::new("Central Highlands", (107.0, 109.0), (11.0, 15.0), 800.0),
                RegionRule::new("Northern mountains", (104.0, 106.0), (21.5, 23.5), 150.0),
                RegionRule::new("North Central mountains", (106.0, 108.0), (15.5, 18.0), 200.0),
            ],
            default_height: 0.0,
        }
    }
}

impl RegionTable {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn matching(&self, lon: f64, lat: f64) -> Option<&RegionRule> {
        self.rules.iter().find(|rule| rule.contains(lon, lat))
    }

    pub fn lookup(&self, lon: f64, lat: f64) -> f64 {
        self.matching(lon, lat)
            .map_or(self.default_height, |rule| rule.height)
    }
}

pub struct HeightResolver {
    service: Option<Box<dyn HeightSource>>,
    table: RegionTable,
}

impl HeightResolver {
    pub fn new(service: Option<Box<dyn HeightSource>>, table: RegionTable) -> Self {
        if service.is_none() {
            info!("No height service configured; using region table ({} rules)", table.rules.len());
        }
        Self { service, table }
    }

    #[cfg(test)]
    pub fn table_only(table: RegionTable) -> Self {
        Self::new(None, table)
    }

    pub fn resolve(&self, lon: f64, lat: f64) -> f64 {
        if let Some(service) = &self.service {
            match service.query(lon, lat) {
                Ok(h) => return h,
                Err(e) => debug!("({lon:.6}, {lat:.6}): {e}; falling back to region table"),
            }
        }

        self.table.lookup(lon, lat)
    }

    /// One independent lookup per coordinate pair, in order.
    pub fn resolve_batch(&self, coordinates: &[(f64, f64)]) -> Vec<f64> {
        coordinates
            .iter()
            .map(|&(lon, lat)| self.resolve(lon, lat))
            .collect()
    }

    /// Min/max of `samples` random heights inside `bbox`; `(0, 100)` when nothing is sampled.
    pub fn sample_height_range<R: Rng>(&self, bbox: &GeoBboxDeg, samples: usize, rng: &mut R) -> (f64, f64) {
        if samples == 0 {
            return (0.0, 100.0);
        }

        (0..samples)
            .map(|_| {
                let lon = rng.gen_range(bbox.min_lon..=bbox.max_lon);
                let lat = rng.gen_range(bbox.min_lat..=bbox.max_lat);
                self.resolve(lon, lat)
            })
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), h| (lo.min(h), hi.max(h)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    struct Fixed(f64);

    impl HeightSource for Fixed {
        fn query(&self, _lon: f64, _lat: f64) -> Result<f64, TerrainError> {
            Ok(self.0)
        }
    }

    struct Down;

    impl HeightSource for Down {
        fn query(&self, _lon: f64, _lat: f64) -> Result<f64, TerrainError> {
            Err(TerrainError::Upstream("timed out".into()))
        }
    }

    #[test]
    fn builtin_bands_and_default() {
        let table = RegionTable::default();

        assert_eq!(table.lookup(108.0, 12.0), 800.0);
        assert_eq!(table.lookup(105.0, 22.0), 150.0);
        assert_eq!(table.lookup(107.0, 16.0), 200.0);
        // Hanoi lowlands
        assert_eq!(table.lookup(105.8342, 21.0278), 0.0);
        // Bounds are inclusive
        assert_eq!(table.lookup(104.0, 23.5), 150.0);
    }

    #[test]
    fn first_matching_rule_wins() {
        let table = RegionTable {
            rules: vec![
                RegionRule::new("inner", (0.0, 1.0), (0.0, 1.0), 10.0),
                RegionRule::new("outer", (-5.0, 5.0), (-5.0, 5.0), 20.0),
            ],
            default_height: -3.0,
        };

        assert_eq!(table.lookup(0.5, 0.5), 10.0);
        assert_eq!(table.matching(0.5, 0.5).unwrap().name, "inner");
        assert_eq!(table.lookup(2.0, 2.0), 20.0);
        assert_eq!(table.lookup(50.0, 2.0), -3.0);
    }

    #[test]
    fn table_parses_from_json() {
        let table: RegionTable = serde_json::from_str(
            r#"{"rules": [{"name": "alps", "lon_min": 6.0, "lon_max": 14.0, "lat_min": 45.0, "lat_max": 48.0, "height": 1800.0}]}"#,
        )
        .unwrap();

        assert_eq!(table.default_height, 0.0);
        assert_eq!(table.lookup(10.0, 46.5), 1800.0);
    }

    #[test]
    fn service_answer_takes_precedence() {
        let resolver = HeightResolver::new(Some(Box::new(Fixed(12.5))), RegionTable::default());
        assert_eq!(resolver.resolve(108.0, 12.0), 12.5);
    }

    #[test]
    fn upstream_failure_falls_back_to_table() {
        let resolver = HeightResolver::new(Some(Box::new(Down)), RegionTable::default());

        let heights = resolver.resolve_batch(&[(108.0, 12.0), (105.8342, 21.0278), (105.0, 22.0)]);
        assert_eq!(heights, vec![800.0, 0.0, 150.0]);
    }

    #[test]
    fn unreachable_service_falls_back() {
        let service = HttpHeightService::new("http://127.0.0.1:1/api/height", Duration::from_millis(200)).unwrap();
        assert!(service.query(108.0, 12.0).is_err());

        let resolver = HeightResolver::new(Some(Box::new(service)), RegionTable::default());
        assert_eq!(resolver.resolve(108.0, 12.0), 800.0);
    }

    #[test]
    fn silent_service_times_out_then_falls_back() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (release, hold) = mpsc::channel::<()>();

        // Accepts the connection and never answers.
        let server = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            let _ = hold.recv();
        });

        let timeout = Duration::from_millis(500);
        let service = HttpHeightService::new(format!("http://{addr}/api/height"), timeout).unwrap();
        let resolver = HeightResolver::new(Some(Box::new(service)), RegionTable::default());

        let started = Instant::now();
        let height = resolver.resolve(108.0, 12.0);
        let elapsed = started.elapsed();

        drop(release);
        server.join().unwrap();

        assert_eq!(height, 800.0);
        assert!(elapsed >= timeout, "returned after {elapsed:?}, before the timeout");
        assert!(elapsed < timeout * 2, "took {elapsed:?} with a {timeout:?} timeout");
    }

    #[test]
    fn sampled_range() {
        let resolver = HeightResolver::table_only(RegionTable::default());
        let mut rng = StdRng::seed_from_u64(7);

        let bbox = GeoBboxDeg {
            min_lon: 107.5,
            max_lon: 108.5,
            min_lat: 12.0,
            max_lat: 13.0,
        };
        assert_eq!(resolver.sample_height_range(&bbox, 20, &mut rng), (800.0, 800.0));
        assert_eq!(resolver.sample_height_range(&bbox, 0, &mut rng), (0.0, 100.0));
    }
}
