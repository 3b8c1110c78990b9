//! Request validation and the generation pipeline: mesh + placements ->
//! i3dm tile + tileset.json + catalog record.
//!
//! Everything is encoded in memory first. Files are written through
//! [`ScopedOutputs`], which removes them again unless the catalog record
//! was committed.

use std::fs;
use std::path::{Path, PathBuf};

use i3dm::{encode_tile, GeoBounds, I3dmError, PlacementInstance, TileBuffer, Tileset, MAX_INSTANCES};
use log::{info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::{Catalog, NewRecord, TilesetRecord};
use crate::error::{GenerateError, Result};
use crate::meshes::{self, MeshLibrary};
use crate::terrain::HeightResolver;
use crate::GeoBboxDeg;

/// File-name label used for meshes that are not in the library.
const UPLOAD_LABEL: &str = "upload";

#[derive(Debug, Clone)]
pub struct RandomRequest {
    pub mesh_id: String,
    pub bbox: GeoBboxDeg,
    pub count: usize,
    /// Metres added to the resolved terrain height.
    pub height_offset: f64,
    pub scale: f64,
    pub seed: Option<u64>,
}

impl RandomRequest {
    pub fn validate(&self) -> Result<()> {
        self.bbox.validate()?;

        if !(1..=MAX_INSTANCES).contains(&self.count) {
            return Err(GenerateError::invalid(format!(
                "count must be between 1 and {MAX_INSTANCES}, got {}",
                self.count
            )));
        }

        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(GenerateError::invalid(format!("scale {} must be positive", self.scale)));
        }

        if !self.height_offset.is_finite() {
            return Err(GenerateError::invalid("height offset must be finite"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeshRef {
    /// Mesh id inside the configured mesh directory.
    Library(String),
    /// A `.glb` supplied directly.
    Upload(PathBuf),
}

impl MeshRef {
    fn source_mesh(&self) -> Option<String> {
        match self {
            Self::Library(id) => Some(id.clone()),
            Self::Upload(_) => None,
        }
    }

    fn file_label(&self) -> &str {
        match self {
            Self::Library(id) => id,
            Self::Upload(_) => UPLOAD_LABEL,
        }
    }

    fn model_name(&self) -> String {
        match self {
            Self::Library(id) => id.clone(),
            Self::Upload(path) => path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(UPLOAD_LABEL)
                .to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PointsRequest {
    pub mesh: MeshRef,
    pub instances: Vec<PlacementInstance>,
}

/// Parse a JSON array of instances. Errors name the offending instance index.
pub fn parse_instances(bytes: &[u8]) -> Result<Vec<PlacementInstance>> {
    let values: Vec<serde_json::Value> = serde_json::from_slice(bytes)
        .map_err(|e| GenerateError::invalid(format!("instances must be a JSON array: {e}")))?;

    values
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            serde_json::from_value(value).map_err(|e| GenerateError::invalid(format!("instance {i}: {e}")))
        })
        .collect()
}

pub fn validate_instances(instances: &[PlacementInstance]) -> Result<()> {
    if instances.is_empty() {
        return Err(GenerateError::invalid("need at least one instance"));
    }

    if instances.len() > MAX_INSTANCES {
        return Err(GenerateError::invalid(format!(
            "at most {MAX_INSTANCES} instances per tile, got {}",
            instances.len()
        )));
    }

    for (i, instance) in instances.iter().enumerate() {
        instance.validate().map_err(|e| match e {
            I3dmError::InvalidInput(msg) => GenerateError::invalid(format!("instance {i}: {msg}")),
            other => GenerateError::from(other),
        })?;
    }

    Ok(())
}

/// Stdout payload of a successful generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub success: bool,
    pub id: u64,
    pub count: usize,
    pub byte_length: usize,
    pub tileset_uri: String,
    pub tile_uri: String,
    pub model_name: String,
}

/// Inputs of one tile after requests have been turned into placements.
struct Batch {
    mesh: MeshRef,
    glb: Vec<u8>,
    instances: Vec<PlacementInstance>,
    bbox: GeoBboxDeg,
    height: f64,
    scale: f64,
}

pub struct Generator {
    library: MeshLibrary,
    heights: HeightResolver,
    catalog: Catalog,
    public_base: String,
}

impl Generator {
    pub fn new(library: MeshLibrary, heights: HeightResolver, catalog: Catalog, public_base: impl Into<String>) -> Self {
        Self {
            library,
            heights,
            catalog,
            public_base: public_base.into(),
        }
    }

    #[cfg(test)]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Scatter `count` instances uniformly in the bbox, each standing on resolved terrain.
    pub fn random(&mut self, request: &RandomRequest) -> Result<GenerationReport> {
        request.validate()?;

        let mesh = self.library.resolve(&request.mesh_id)?;
        let glb = meshes::load(&mesh.path)?;

        let mut rng = match request.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let bbox = &request.bbox;
        let coordinates: Vec<(f64, f64)> = (0..request.count)
            .map(|_| {
                (
                    rng.gen_range(bbox.min_lon..=bbox.max_lon),
                    rng.gen_range(bbox.min_lat..=bbox.max_lat),
                )
            })
            .collect();

        let instances = coordinates
            .iter()
            .zip(self.heights.resolve_batch(&coordinates))
            .map(|(&(lon, lat), ground)| {
                PlacementInstance::new(lon, lat, ground + request.height_offset).with_scale(request.scale)
            })
            .collect();

        self.emit(Batch {
            mesh: MeshRef::Library(mesh.id),
            glb,
            instances,
            bbox: request.bbox,
            height: request.height_offset,
            scale: request.scale,
        })
    }

    /// Place instances exactly where the request says.
    pub fn points(&mut self, request: PointsRequest) -> Result<GenerationReport> {
        validate_instances(&request.instances)?;

        let (mesh, mesh_path) = match request.mesh {
            MeshRef::Library(id) => {
                let entry = self.library.resolve(&id)?;
                (MeshRef::Library(entry.id), entry.path)
            }
            MeshRef::Upload(path) => {
                meshes::check_upload(&path)?;
                (MeshRef::Upload(path.clone()), path)
            }
        };
        let glb = meshes::load(&mesh_path)?;

        let bounds = GeoBounds::from_instances(&request.instances)
            .ok_or_else(|| GenerateError::invalid("need at least one instance"))?;

        let n = request.instances.len() as f64;
        let height = request.instances.iter().map(|i| i.height).sum::<f64>() / n;
        let scale = request.instances.iter().map(|i| i.scale).sum::<f64>() / n;

        self.emit(Batch {
            mesh,
            glb,
            instances: request.instances,
            bbox: GeoBboxDeg::from(bounds),
            height,
            scale,
        })
    }

    fn emit(&mut self, batch: Batch) -> Result<GenerationReport> {
        let count = batch.instances.len();
        let label = batch.mesh.file_label();
        let uid = Uuid::new_v4().simple().to_string();
        let uid = &uid[..8];

        let tile_file = format!("instances_{label}_{count}_{uid}.i3dm");
        let tileset_file = format!("tileset_{label}_{count}_{uid}.json");

        let buffer = TileBuffer::build(&batch.instances)?;
        let tile = encode_tile(&batch.glb, &buffer)?;
        let tileset = Tileset::for_instances(&batch.instances, tile_file.clone())?.to_json_bytes()?;

        let mut outputs = ScopedOutputs::new(self.catalog.dir());
        outputs.write(&tile_file, &tile)?;
        outputs.write(&tileset_file, &tileset)?;

        let model_name = batch.mesh.model_name();
        let record: TilesetRecord = self.catalog.insert(NewRecord {
            source_mesh: batch.mesh.source_mesh(),
            name: format!("{model_name} - {count} instances"),
            count,
            bbox: batch.bbox,
            height: batch.height,
            scale: batch.scale,
            tile_file: tile_file.clone(),
            tileset_file: tileset_file.clone(),
        })?;
        outputs.commit();

        info!(
            "Generated #{}: {} instances of {} -> {} ({} B)",
            record.id,
            count,
            model_name,
            tile_file,
            tile.len()
        );

        Ok(GenerationReport {
            success: true,
            id: record.id,
            count,
            byte_length: tile.len(),
            tileset_uri: public_uri(&self.public_base, &tileset_file),
            tile_uri: public_uri(&self.public_base, &tile_file),
            model_name,
        })
    }
}

pub fn public_uri(base: &str, file: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), file)
}

/// Files written for one generation. Dropping without [`commit`](Self::commit)
/// removes every file written so far.
struct ScopedOutputs {
    dir: PathBuf,
    written: Vec<PathBuf>,
    committed: bool,
}

impl ScopedOutputs {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            written: Vec::new(),
            committed: false,
        }
    }

    /// Write `<name>.tmp`, then rename it to `<name>`.
    fn write(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));

        if let Err(e) = fs::write(&tmp, bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(GenerateError::io("writing", &tmp)(e));
        }

        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(GenerateError::io("renaming", &tmp)(e));
        }

        self.written.push(path);
        Ok(())
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ScopedOutputs {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        for path in &self.written {
            match fs::remove_file(path) {
                Ok(()) => warn!("Removed partial output {}", path.display()),
                Err(e) => warn!("Could not remove partial output {}: {e}", path.display()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::RegionTable;
    use crate::testutil::ScratchDir;

    const FAKE_GLB: &[u8] = b"glTF\x02\x00\x00\x00\x0c\x00\x00\x00";

    struct Fixture {
        meshes: ScratchDir,
        out: ScratchDir,
    }

    impl Fixture {
        fn new(tag: &str) -> Self {
            let meshes = ScratchDir::new(&format!("{tag}-meshes"));
            fs::write(meshes.path().join("tree.glb"), FAKE_GLB).unwrap();
            Self {
                meshes,
                out: ScratchDir::new(&format!("{tag}-out")),
            }
        }

        fn generator(&self) -> Generator {
            Generator::new(
                MeshLibrary::new(self.meshes.path()),
                HeightResolver::table_only(RegionTable::default()),
                Catalog::open(self.out.path()).unwrap(),
                "/media/i3dm/",
            )
        }

        /// Output files other than the catalog and its lock.
        fn outputs(&self) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(self.out.path())
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|n| n != "catalog.json" && n != "catalog.lock")
                .collect();
            names.sort();
            names
        }
    }

    fn highlands_request(count: usize) -> RandomRequest {
        RandomRequest {
            mesh_id: "tree".into(),
            bbox: GeoBboxDeg {
                min_lon: 107.5,
                max_lon: 108.5,
                min_lat: 12.0,
                max_lat: 13.0,
            },
            count,
            height_offset: 5.0,
            scale: 2.0,
            seed: Some(42),
        }
    }

    #[test]
    fn random_generation_writes_tile_tileset_and_record() {
        let fx = Fixture::new("gen-random");
        let mut generator = fx.generator();

        let report = generator.random(&highlands_request(5)).unwrap();

        assert!(report.success);
        assert_eq!(report.count, 5);
        assert_eq!(report.model_name, "tree");
        assert!(report.tile_uri.starts_with("/media/i3dm/instances_tree_5_"));
        assert!(report.tileset_uri.starts_with("/media/i3dm/tileset_tree_5_"));

        let record = generator.catalog().get(report.id).unwrap().clone();
        assert_eq!(record.source_mesh.as_deref(), Some("tree"));
        assert_eq!(record.height, 5.0);
        assert_eq!(record.scale, 2.0);
        assert_eq!(record.bbox, highlands_request(5).bbox);
        assert_eq!(fx.outputs(), {
            let mut v = vec![record.tile_file.clone(), record.tileset_file.clone()];
            v.sort();
            v
        });

        let tile = i3dm::read_file(fx.out.path().join(&record.tile_file)).unwrap();
        assert_eq!(tile.feature_table.instances_length, 5);
        assert_eq!(tile.glb, FAKE_GLB);
        assert_eq!(tile.header.byte_length as usize, report.byte_length);
        assert!(tile.scales.iter().all(|&s| s == 2.0));

        // Every sample lands in the 800 m band, plus the offset.
        let (_, _, h) = i3dm::ecef_to_geodetic(
            tile.feature_table.rtc_center[0],
            tile.feature_table.rtc_center[1],
            tile.feature_table.rtc_center[2],
        );
        assert!((h - 805.0).abs() < 1e-3);

        let tileset: Tileset =
            serde_json::from_slice(&fs::read(fx.out.path().join(&record.tileset_file)).unwrap()).unwrap();
        assert_eq!(tileset.root.content.uri, record.tile_file);
        assert_eq!(tileset.region()[4], 805.0);
        assert_eq!(tileset.region()[5], 855.0);
    }

    #[test]
    fn points_from_upload_use_upload_label_and_means() {
        let fx = Fixture::new("gen-points");
        let upload = fx.meshes.path().join("House.glb");
        fs::write(&upload, FAKE_GLB).unwrap();

        let instances = parse_instances(
            br#"[
                {"lon": 105.8342, "lat": 21.0278, "height": 10.0, "scale": 1.0},
                {"lon": 105.8350, "lat": 21.0285, "height": 12.0, "scale": 1.5, "heading": 45.0},
                {"lon": 105.8360, "lat": 21.0290, "height": 8.0, "scale": 2.0, "heading": 90.0}
            ]"#,
        )
        .unwrap();

        let mut generator = fx.generator();
        let report = generator
            .points(PointsRequest {
                mesh: MeshRef::Upload(upload),
                instances,
            })
            .unwrap();

        assert_eq!(report.model_name, "House");
        assert!(report.tile_uri.contains("/instances_upload_3_"));

        let record = generator.catalog().get(report.id).unwrap();
        assert_eq!(record.source_mesh, None);
        assert!((record.height - 10.0).abs() < 1e-12);
        assert!((record.scale - 1.5).abs() < 1e-12);
        assert_eq!(record.bbox.min_lon, 105.8342);
        assert_eq!(record.bbox.max_lat, 21.0290);
        assert!(generator.catalog().by_mesh("tree").is_empty());
    }

    #[test]
    fn invalid_requests_touch_nothing() {
        let fx = Fixture::new("gen-invalid");
        let mut generator = fx.generator();

        for count in [0, MAX_INSTANCES + 1] {
            let err = generator.random(&highlands_request(count)).unwrap_err();
            assert_eq!(err.kind(), "invalid_input");
        }

        let mut flipped = highlands_request(3);
        flipped.bbox.min_lon = 109.0;
        assert_eq!(generator.random(&flipped).unwrap_err().exit_code(), 2);

        let err = generator
            .points(PointsRequest {
                mesh: MeshRef::Library("tree".into()),
                instances: Vec::new(),
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "need at least one instance");

        let err = generator
            .points(PointsRequest {
                mesh: MeshRef::Upload(fx.meshes.path().join("tree.gltf")),
                instances: vec![PlacementInstance::new(105.0, 21.0, 0.0)],
            })
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");

        let mut missing = highlands_request(3);
        missing.mesh_id = "rock".into();
        assert_eq!(generator.random(&missing).unwrap_err().exit_code(), 3);

        assert!(fx.outputs().is_empty());
        assert!(generator.catalog().list().is_empty());
    }

    #[test]
    fn failed_record_commit_removes_written_files() {
        let fx = Fixture::new("gen-rollback");
        let mut generator = fx.generator();

        // The catalog can no longer be read back once its path is a directory.
        fs::create_dir(fx.out.path().join("catalog.json")).unwrap();

        let err = generator.random(&highlands_request(4)).unwrap_err();

        assert_eq!(err.kind(), "io_failure");
        assert!(fx.outputs().is_empty());
        assert!(generator.catalog().list().is_empty());
    }

    #[test]
    fn instance_errors_name_the_index() {
        let err = parse_instances(br#"[{"lon": 1.0, "lat": 2.0, "height": 0.0}, {"lon": 1.0, "height": 0.0}]"#)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(err.to_string().starts_with("instance 1: "));
        assert!(err.to_string().contains("lat"));

        assert!(parse_instances(br#"{"lon": 1.0}"#).is_err());

        let bad = [
            PlacementInstance::new(105.0, 21.0, 0.0),
            PlacementInstance::new(105.0, 95.0, 0.0),
        ];
        let err = validate_instances(&bad).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert_eq!(err.to_string(), "instance 1: latitude 95 outside [-90, 90]");
    }

    #[test]
    fn mesh_id_with_extension_is_recorded_canonically() {
        let fx = Fixture::new("gen-canonical");
        let mut generator = fx.generator();

        let mut request = highlands_request(3);
        request.mesh_id = "tree.glb".into();
        let report = generator.random(&request).unwrap();

        assert_eq!(report.model_name, "tree");
        assert!(report.tile_uri.contains("/instances_tree_3_"));
        assert_eq!(generator.catalog().get(report.id).unwrap().source_mesh.as_deref(), Some("tree"));
        assert_eq!(generator.catalog().by_mesh("tree").len(), 1);

        let points = generator
            .points(PointsRequest {
                mesh: MeshRef::Library("tree.GLB".into()),
                instances: vec![PlacementInstance::new(105.0, 21.0, 0.0)],
            })
            .unwrap();
        assert!(points.tile_uri.contains("/instances_tree_1_"));
    }

    #[test]
    fn public_uri_joins_once() {
        assert_eq!(public_uri("/media/i3dm", "a.json"), "/media/i3dm/a.json");
        assert_eq!(public_uri("https://cdn.example/i3dm/", "a.json"), "https://cdn.example/i3dm/a.json");
    }
}
