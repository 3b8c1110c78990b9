use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// `glb2i3dm` - place many copies of a glb mesh on the globe as one i3dm tile.
///
/// Every generation writes an `.i3dm` tile plus its `tileset.json` into the
/// output directory and records both in the catalog kept alongside them.
#[derive(Parser, Debug)]
#[command(name = "glb2i3dm", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Directory receiving tiles, tilesets and `catalog.json`.
    #[arg(long, env = "I3DM_OUTPUT_DIR", default_value = "media/i3dm")]
    pub output_dir: PathBuf,

    /// Directory of source meshes; a mesh id `tree` resolves to `<mesh_dir>/tree.glb`.
    #[arg(long, env = "I3DM_MESH_DIR", default_value = "media/glb")]
    pub mesh_dir: PathBuf,

    /// Public URL prefix under which the output directory is served.
    #[arg(long, env = "I3DM_PUBLIC_BASE", default_value = "/media/i3dm")]
    pub public_base: String,

    /// Terrain height service, queried as `<url>?lon=..&lat=..` and answering `{"height": m}`.
    ///
    /// When unset, or when a query fails, heights come from the region table.
    #[arg(long, env = "I3DM_HEIGHT_SERVICE_URL")]
    pub height_service_url: Option<String>,

    /// Per-request timeout for the height service.
    #[arg(long, env = "I3DM_HEIGHT_TIMEOUT_MS", default_value_t = 1000)]
    pub height_timeout_ms: u64,

    /// JSON file with region height rules replacing the built-in table.
    #[arg(long, env = "I3DM_REGION_TABLE")]
    pub region_table: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Scatter `count` instances uniformly inside a bbox, clamped to terrain.
    Random {
        #[arg(long)]
        mesh_id: String,

        #[arg(long, allow_negative_numbers = true)]
        min_lon: f64,

        #[arg(long, allow_negative_numbers = true)]
        max_lon: f64,

        #[arg(long, allow_negative_numbers = true)]
        min_lat: f64,

        #[arg(long, allow_negative_numbers = true)]
        max_lat: f64,

        #[arg(long, default_value_t = 100)]
        count: usize,

        /// Metres added on top of the resolved terrain height.
        #[arg(long, allow_negative_numbers = true, default_value_t = 0.0)]
        height_offset: f64,

        #[arg(long, default_value_t = 1.0)]
        scale: f64,

        /// Seed for reproducible placements.
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Place instances at explicit positions with heights already resolved.
    Points {
        #[arg(long, required_unless_present = "mesh_file", conflicts_with = "mesh_file")]
        mesh_id: Option<String>,

        /// Ad-hoc `.glb` not in the mesh directory.
        #[arg(long)]
        mesh_file: Option<PathBuf>,

        /// JSON array of `{lon, lat, height, scale?, heading?}`.
        #[arg(long)]
        instances: PathBuf,
    },

    /// All catalog records, newest first.
    List,

    Show {
        id: u64,
    },

    /// Records generated from one mesh.
    ByMesh {
        mesh_id: String,
    },

    /// Delete a record together with its tile and tileset files.
    Delete {
        id: u64,
    },

    /// Remove tile/tileset files that no record references.
    Cleanup,

    /// Decode a tile and print its header and feature table summary.
    Inspect {
        path: PathBuf,
    },

    /// Mesh ids available in the mesh directory.
    Meshes,

    /// Resolve the terrain height at one point.
    Height {
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,

        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
    },

    /// Estimate the terrain height range of a bbox from random samples.
    HeightRange {
        #[arg(long, allow_negative_numbers = true)]
        min_lon: f64,

        #[arg(long, allow_negative_numbers = true)]
        max_lon: f64,

        #[arg(long, allow_negative_numbers = true)]
        min_lat: f64,

        #[arg(long, allow_negative_numbers = true)]
        max_lat: f64,

        #[arg(long, default_value_t = 10)]
        samples: usize,

        #[arg(long)]
        seed: Option<u64>,
    },
}
