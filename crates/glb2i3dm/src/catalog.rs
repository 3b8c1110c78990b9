//! Metadata records for generated tilesets, persisted as `catalog.json` next to the files.
//!
//! A record exists only for artifacts that were fully written. Writers in the
//! same directory serialize on `catalog.lock`.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{GenerateError, Result};
use crate::GeoBboxDeg;

pub const CATALOG_FILE: &str = "catalog.json";
const LOCK_FILE: &str = "catalog.lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilesetRecord {
    pub id: u64,
    /// `None` for meshes supplied ad hoc rather than from the library.
    pub source_mesh: Option<String>,
    pub name: String,
    pub count: usize,
    pub bbox: GeoBboxDeg,
    /// Height offset (random placement) or mean height (explicit points).
    pub height: f64,
    pub scale: f64,
    pub tile_file: String,
    pub tileset_file: String,
    pub created_at: DateTime<Utc>,
}

/// Everything in a record except what the catalog assigns.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub source_mesh: Option<String>,
    pub name: String,
    pub count: usize,
    pub bbox: GeoBboxDeg,
    pub height: f64,
    pub scale: f64,
    pub tile_file: String,
    pub tileset_file: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogState {
    next_id: u64,
    records: Vec<TilesetRecord>,
}

#[derive(Debug, Default, Serialize)]
pub struct CleanupReport {
    pub deleted: usize,
    pub orphan_tiles: Vec<String>,
    pub orphan_tilesets: Vec<String>,
}

pub struct Catalog {
    dir: PathBuf,
    state: CatalogState,
}

/// Exclusive lock on `catalog.lock`, held for one read-modify-write of `catalog.json`.
struct CatalogLock {
    file: File,
}

impl CatalogLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(GenerateError::io("opening", &path))?;

        file.lock_exclusive().map_err(GenerateError::io("locking", &path))?;
        Ok(Self { file })
    }
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Could not release catalog lock: {e}");
        }
    }
}

impl Catalog {
    /// Open (or start) the catalog in `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(GenerateError::io("creating", &dir))?;

        let state = load_state(&dir)?;
        debug!("Catalog {} holds {} records", dir.display(), state.records.len());
        Ok(Self { dir, state })
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Assign the next id and persist the record. State is re-read under the
    /// lock so concurrent writers in the same directory never share an id.
    pub fn insert(&mut self, new: NewRecord) -> Result<TilesetRecord> {
        let _lock = CatalogLock::acquire(&self.dir)?;
        let mut state = load_state(&self.dir)?;

        let record = TilesetRecord {
            id: state.next_id,
            source_mesh: new.source_mesh,
            name: new.name,
            count: new.count,
            bbox: new.bbox,
            height: new.height,
            scale: new.scale,
            tile_file: new.tile_file,
            tileset_file: new.tileset_file,
            created_at: Utc::now(),
        };

        state.next_id += 1;
        state.records.push(record.clone());
        save_state(&self.dir, &state)?;
        self.state = state;

        info!("Catalog: added #{} {}", record.id, record.name);
        Ok(record)
    }

    /// Newest first.
    pub fn list(&self) -> Vec<&TilesetRecord> {
        let mut records: Vec<&TilesetRecord> = self.state.records.iter().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        records
    }

    pub fn get(&self, id: u64) -> Result<&TilesetRecord> {
        self.state
            .records
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| GenerateError::not_found("tileset", id))
    }

    pub fn by_mesh(&self, mesh_id: &str) -> Vec<&TilesetRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.source_mesh.as_deref() == Some(mesh_id))
            .collect()
    }

    /// Current size of the record's tile on disk, 0 if it is gone.
    pub fn tile_size(&self, record: &TilesetRecord) -> u64 {
        fs::metadata(self.dir.join(&record.tile_file))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Drop the record and persist, then remove both files. File removal is
    /// best effort: failures are logged and leave orphans for `cleanup_orphans`.
    pub fn delete(&mut self, id: u64) -> Result<TilesetRecord> {
        let lock = CatalogLock::acquire(&self.dir)?;
        let mut state = load_state(&self.dir)?;

        let index = state
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| GenerateError::not_found("tileset", id))?;

        let record = state.records.remove(index);
        save_state(&self.dir, &state)?;
        self.state = state;
        drop(lock);

        for file in [&record.tileset_file, &record.tile_file] {
            remove_best_effort(&self.dir.join(file));
        }

        info!("Catalog: deleted #{} {}", record.id, record.name);
        Ok(record)
    }

    /// Delete `instances_*.i3dm` / `tileset_*.json` files no record points at.
    pub fn cleanup_orphans(&mut self) -> Result<CleanupReport> {
        let _lock = CatalogLock::acquire(&self.dir)?;
        self.state = load_state(&self.dir)?;

        let referenced: HashSet<&str> = self
            .state
            .records
            .iter()
            .flat_map(|r| [r.tile_file.as_str(), r.tileset_file.as_str()])
            .collect();

        let mut report = CleanupReport::default();

        for entry in WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }

            let Some(name) = entry.file_name().to_str() else {
                continue;
            };

            let is_tile = name.starts_with("instances_") && name.ends_with(".i3dm");
            let is_tileset = name.starts_with("tileset_") && name.ends_with(".json");
            if !(is_tile || is_tileset) || referenced.contains(name) {
                continue;
            }

            fs::remove_file(entry.path()).map_err(GenerateError::io("removing", entry.path()))?;
            info!("Deleted orphan {name}");

            report.deleted += 1;
            if is_tile {
                report.orphan_tiles.push(name.to_owned());
            } else {
                report.orphan_tilesets.push(name.to_owned());
            }
        }

        report.orphan_tiles.sort();
        report.orphan_tilesets.sort();
        Ok(report)
    }
}

fn load_state(dir: &Path) -> Result<CatalogState> {
    let path = dir.join(CATALOG_FILE);
    match fs::read(&path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(CatalogState {
            next_id: 1,
            records: Vec::new(),
        }),
        Err(e) => Err(GenerateError::io("reading", &path)(e)),
    }
}

/// Rewrite `catalog.json` via a per-writer temp file and rename.
fn save_state(dir: &Path, state: &CatalogState) -> Result<()> {
    let path = dir.join(CATALOG_FILE);
    let tmp = dir.join(format!("{CATALOG_FILE}.{}.tmp", Uuid::new_v4().simple()));
    let bytes = serde_json::to_vec_pretty(state)?;

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        GenerateError::io("writing", &path)(e)
    })
}

fn remove_best_effort(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Deleted {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => warn!("{} already missing", path.display()),
        Err(e) => warn!("Could not delete {}: {e}", path.display()),
    }
}
