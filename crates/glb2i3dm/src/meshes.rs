use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use walkdir::WalkDir;

use crate::error::{GenerateError, Result};

const GLB_MAGIC: &[u8; 4] = b"glTF";

/// Source meshes addressed by id: `<root>/<id>.glb`.
pub struct MeshLibrary {
    root: PathBuf,
}

/// A library mesh under its canonical id (no `.glb` suffix).
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryMesh {
    pub id: String,
    pub path: PathBuf,
}

impl MeshLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map an id to its file. Ids are bare names; an explicit `.glb` suffix
    /// is accepted and stripped from the returned id.
    pub fn resolve(&self, id: &str) -> Result<LibraryMesh> {
        let id = canonical_id(id);
        if id.is_empty() || id.contains(&['/', '\\'][..]) || id.starts_with('.') {
            return Err(GenerateError::invalid(format!("invalid mesh id {id:?}")));
        }

        let path = self.root.join(format!("{id}.glb"));
        if !path.is_file() {
            return Err(GenerateError::not_found("mesh", id));
        }

        debug!("Mesh {id} -> {}", path.display());
        Ok(LibraryMesh {
            id: id.to_owned(),
            path,
        })
    }

    /// Ids of every `.glb` directly inside the library root, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && has_glb_extension(entry.path()))
            .filter_map(|entry| {
                entry
                    .path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_owned)
            })
            .collect();

        ids.sort();
        ids
    }
}

/// `tree.glb` and `tree.GLB` both name the mesh `tree`.
pub fn canonical_id(id: &str) -> &str {
    match id.len().checked_sub(4) {
        Some(stem) if id.is_char_boundary(stem) && id[stem..].eq_ignore_ascii_case(".glb") => &id[..stem],
        _ => id,
    }
}

/// Case-insensitive `.glb` check.
pub fn has_glb_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("glb"))
}

/// Reject anything that is not named `*.glb` before reading it.
pub fn check_upload(path: &Path) -> Result<()> {
    if has_glb_extension(path) {
        Ok(())
    } else {
        Err(GenerateError::invalid(format!(
            "only .glb files are allowed, got {}",
            path.display()
        )))
    }
}

/// Read a mesh fully into memory; it is appended to the tile verbatim.
pub fn load(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path).map_err(GenerateError::io("reading mesh", path))?;

    if !bytes.starts_with(GLB_MAGIC) {
        warn!("{} does not start with the glTF magic; embedding it unchanged", path.display());
    }

    debug!("Loaded mesh {} ({} bytes)", path.display(), bytes.len());
    Ok(bytes)
}
