use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use i3dm::{ecef_to_geodetic, GeoBounds};

mod catalog;
mod config;
mod error;
mod generate;
mod meshes;
mod terrain;

use catalog::{Catalog, TilesetRecord};
use config::{Cli, Command, Config};
use error::GenerateError;
use generate::{public_uri, Generator, MeshRef, PointsRequest, RandomRequest};
use meshes::MeshLibrary;
use terrain::{HeightResolver, HeightSource, HttpHeightService, RegionTable};

/// Lon/lat rectangle in degrees, as requested or as recorded in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBboxDeg {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl GeoBboxDeg {
    pub fn validate(&self) -> error::Result<()> {
        let values = [self.min_lon, self.max_lon, self.min_lat, self.max_lat];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(GenerateError::invalid("bbox values must be finite"));
        }

        if self.min_lon >= self.max_lon || self.min_lat >= self.max_lat {
            return Err(GenerateError::invalid("min values must be less than max values"));
        }

        if self.min_lon < -180.0 || self.max_lon > 180.0 {
            return Err(GenerateError::invalid("longitude must be within [-180, 180]"));
        }

        if self.min_lat < -90.0 || self.max_lat > 90.0 {
            return Err(GenerateError::invalid("latitude must be within [-90, 90]"));
        }

        Ok(())
    }
}

impl From<GeoBounds> for GeoBboxDeg {
    fn from(b: GeoBounds) -> Self {
        Self {
            min_lon: b.lon_min,
            max_lon: b.lon_max,
            min_lat: b.lat_min,
            max_lat: b.lat_max,
        }
    }
}

fn height_resolver(config: &Config) -> Result<HeightResolver> {
    let table = match &config.region_table {
        Some(path) => RegionTable::from_json_file(path)
            .with_context(|| format!("loading region table {}", path.display()))?,
        None => RegionTable::default(),
    };

    let service: Option<Box<dyn HeightSource>> = match &config.height_service_url {
        Some(url) => {
            let timeout = Duration::from_millis(config.height_timeout_ms);
            info!("Height service {url} (timeout {timeout:?})");
            Some(Box::new(
                HttpHeightService::new(url.as_str(), timeout).context("building height service client")?,
            ))
        }
        None => None,
    };

    Ok(HeightResolver::new(service, table))
}

fn generator(config: &Config) -> Result<Generator> {
    Ok(Generator::new(
        MeshLibrary::new(&config.mesh_dir),
        height_resolver(config)?,
        Catalog::open(&config.output_dir)?,
        config.public_base.as_str(),
    ))
}

/// A record as shown to users, with public URIs and the current tile size.
fn describe(record: &TilesetRecord, catalog: &Catalog, public_base: &str) -> Value {
    json!({
        "record": record,
        "tile_uri": public_uri(public_base, &record.tile_file),
        "tileset_uri": public_uri(public_base, &record.tileset_file),
        "tile_size": catalog.tile_size(record),
    })
}

fn inspect(path: &Path) -> Result<Value> {
    let tile = i3dm::read_file(path).with_context(|| format!("reading {}", path.display()))?;

    let [x, y, z] = tile.feature_table.rtc_center;
    let (lon, lat, height) = ecef_to_geodetic(x, y, z);

    Ok(json!({
        "success": true,
        "path": path.display().to_string(),
        "header": {
            "version": tile.header.version,
            "byte_length": tile.header.byte_length,
            "feature_table_json_byte_length": tile.header.feature_table_json_byte_length,
            "feature_table_binary_byte_length": tile.header.feature_table_binary_byte_length,
            "batch_table_json_byte_length": tile.header.batch_table_json_byte_length,
            "batch_table_binary_byte_length": tile.header.batch_table_binary_byte_length,
            "gltf_format": tile.header.gltf_format,
        },
        "count": tile.feature_table.instances_length,
        "rtc_center": tile.feature_table.rtc_center,
        "rtc_center_geodetic": { "lon": lon, "lat": lat, "height": height },
        "glb_size": tile.glb.len(),
    }))
}

fn run(cli: Cli) -> Result<Value> {
    let config = cli.config;

    match cli.command {
        Command::Random {
            mesh_id,
            min_lon,
            max_lon,
            min_lat,
            max_lat,
            count,
            height_offset,
            scale,
            seed,
        } => {
            let request = RandomRequest {
                mesh_id,
                bbox: GeoBboxDeg {
                    min_lon,
                    max_lon,
                    min_lat,
                    max_lat,
                },
                count,
                height_offset,
                scale,
                seed,
            };

            // Reject before the height service or catalog is touched.
            request.validate()?;
            let report = generator(&config)?.random(&request)?;
            Ok(serde_json::to_value(report)?)
        }

        Command::Points {
            mesh_id,
            mesh_file,
            instances,
        } => {
            let bytes = fs::read(&instances).map_err(GenerateError::io("reading", &instances))?;
            let instances = generate::parse_instances(&bytes)?;
            generate::validate_instances(&instances)?;

            let mesh = match (mesh_id, mesh_file) {
                (Some(id), _) => MeshRef::Library(id),
                (None, Some(path)) => MeshRef::Upload(path),
                (None, None) => return Err(GenerateError::invalid("either --mesh-id or --mesh-file is required").into()),
            };

            let report = generator(&config)?.points(PointsRequest { mesh, instances })?;
            Ok(serde_json::to_value(report)?)
        }

        Command::List => {
            let catalog = Catalog::open(&config.output_dir)?;
            let records: Vec<Value> = catalog
                .list()
                .into_iter()
                .map(|r| describe(r, &catalog, &config.public_base))
                .collect();
            Ok(json!({ "success": true, "count": records.len(), "tilesets": records }))
        }

        Command::Show { id } => {
            let catalog = Catalog::open(&config.output_dir)?;
            let record = catalog.get(id)?;
            Ok(json!({ "success": true, "tileset": describe(record, &catalog, &config.public_base) }))
        }

        Command::ByMesh { mesh_id } => {
            let mesh_id = meshes::canonical_id(&mesh_id).to_owned();
            let catalog = Catalog::open(&config.output_dir)?;
            let records: Vec<Value> = catalog
                .by_mesh(&mesh_id)
                .into_iter()
                .map(|r| describe(r, &catalog, &config.public_base))
                .collect();
            Ok(json!({ "success": true, "mesh_id": mesh_id, "count": records.len(), "tilesets": records }))
        }

        Command::Delete { id } => {
            let mut catalog = Catalog::open(&config.output_dir)?;
            let record = catalog.delete(id)?;
            Ok(json!({ "success": true, "deleted": record }))
        }

        Command::Cleanup => {
            let mut catalog = Catalog::open(&config.output_dir)?;
            let report = catalog.cleanup_orphans()?;
            info!("Cleanup removed {} files", report.deleted);
            Ok(json!({ "success": true, "cleanup": report }))
        }

        Command::Inspect { path } => inspect(&path),

        Command::Meshes => {
            let ids = MeshLibrary::new(&config.mesh_dir).list();
            Ok(json!({ "success": true, "count": ids.len(), "meshes": ids }))
        }

        Command::Height { lon, lat } => {
            if !((-180.0..=180.0).contains(&lon) && (-90.0..=90.0).contains(&lat)) {
                return Err(GenerateError::invalid(format!("({lon}, {lat}) is not a valid lon/lat")).into());
            }

            let height = height_resolver(&config)?.resolve(lon, lat);
            Ok(json!({ "success": true, "lon": lon, "lat": lat, "height": height }))
        }

        Command::HeightRange {
            min_lon,
            max_lon,
            min_lat,
            max_lat,
            samples,
            seed,
        } => {
            let bbox = GeoBboxDeg {
                min_lon,
                max_lon,
                min_lat,
                max_lat,
            };
            bbox.validate()?;

            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };

            let (min, max) = height_resolver(&config)?.sample_height_range(&bbox, samples, &mut rng);
            Ok(json!({ "success": true, "bbox": bbox, "samples": samples, "min_height": min, "max_height": max }))
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()));
            ExitCode::SUCCESS
        }
        Err(err) => {
            let (kind, code) = match err.downcast_ref::<GenerateError>() {
                Some(e) => (e.kind(), e.exit_code()),
                None => ("internal", 1),
            };

            error!("{err:#}");
            println!("{}", json!({ "success": false, "error": format!("{err:#}"), "kind": kind }));
            ExitCode::from(code)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(min_lon: f64, max_lon: f64, min_lat: f64, max_lat: f64) -> GeoBboxDeg {
        GeoBboxDeg {
            min_lon,
            max_lon,
            min_lat,
            max_lat,
        }
    }

    #[test]
    fn bbox_validation() {
        assert!(bbox(105.0, 106.0, 21.0, 22.0).validate().is_ok());

        let err = bbox(106.0, 105.0, 21.0, 22.0).validate().unwrap_err();
        assert_eq!(err.to_string(), "min values must be less than max values");
        assert!(bbox(105.0, 105.0, 21.0, 22.0).validate().is_err());
        assert!(bbox(105.0, 181.0, 21.0, 22.0).validate().is_err());
        assert!(bbox(105.0, 106.0, -91.0, 22.0).validate().is_err());
        assert!(bbox(f64::NAN, 106.0, 21.0, 22.0).validate().is_err());
    }

    #[test]
    fn cli_parses_random_with_negative_coordinates() {
        let cli = Cli::try_parse_from([
            "glb2i3dm",
            "--output-dir",
            "/tmp/out",
            "random",
            "--mesh-id",
            "tree",
            "--min-lon",
            "-74.1",
            "--max-lon",
            "-73.9",
            "--min-lat",
            "40.6",
            "--max-lat",
            "40.8",
            "--count",
            "25",
        ])
        .unwrap();

        assert_eq!(cli.config.output_dir, Path::new("/tmp/out"));
        match cli.command {
            Command::Random {
                min_lon, count, scale, ..
            } => {
                assert_eq!(min_lon, -74.1);
                assert_eq!(count, 25);
                assert_eq!(scale, 1.0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn points_needs_exactly_one_mesh_source() {
        assert!(Cli::try_parse_from(["glb2i3dm", "points", "--instances", "p.json"]).is_err());
        assert!(Cli::try_parse_from([
            "glb2i3dm",
            "points",
            "--mesh-id",
            "tree",
            "--mesh-file",
            "t.glb",
            "--instances",
            "p.json"
        ])
        .is_err());
        assert!(Cli::try_parse_from(["glb2i3dm", "points", "--mesh-file", "t.glb", "--instances", "p.json"]).is_ok());
    }

    #[test]
    fn inspect_reports_center_position() {
        let dir = testutil::ScratchDir::new("main-inspect");
        let path = dir.path().join("t.i3dm");

        let instances = [
            i3dm::PlacementInstance::new(105.8342, 21.0278, 10.0),
            i3dm::PlacementInstance::new(105.8350, 21.0285, 12.0),
        ];
        let buffer = i3dm::TileBuffer::build(&instances).unwrap();
        i3dm::write_file(&path, b"glTF\x02\x00\x00\x00", &buffer).unwrap();

        let value = inspect(&path).unwrap();

        assert_eq!(value["count"], 2);
        assert_eq!(value["glb_size"], 8);
        assert_eq!(value["header"]["gltf_format"], 1);
        let lon = value["rtc_center_geodetic"]["lon"].as_f64().unwrap();
        let height = value["rtc_center_geodetic"]["height"].as_f64().unwrap();
        assert!((lon - 105.8342).abs() < 1e-6);
        assert!((height - 10.0).abs() < 1e-3);
    }

    #[test]
    fn not_found_maps_to_its_exit_code() {
        let err: anyhow::Error = GenerateError::not_found("tileset", 7).into();
        let err = err.context("show");
        let inner = err.downcast_ref::<GenerateError>().unwrap();
        assert_eq!((inner.kind(), inner.exit_code()), ("not_found", 3));
    }
}
