//! I3DM: instanced 3D model tiles placed on the WGS-84 ellipsoid.
//!
//! - `geodesy`:   WGS-84 constants, geodetic <-> ECEF, per-point ENU frames.
//! - `instances`: placement records and the packed per-instance buffers.
//! - `format`:    the binary container (header + feature table + glb).
//! - `tileset`:   the `tileset.json` bounding descriptor for one tile.
//!
//! Everything here is a pure function of its inputs; the only IO is the
//! `write_file` / `read_file` convenience wrappers.

pub mod error;
pub mod format;
pub mod geodesy;
pub mod instances;
pub mod tileset;

pub use error::{I3dmError, Result};
pub use format::{encode_tile, parse_i3dm_bytes, read_file, write_file, FeatureTable, I3dmHeader, I3dmTile};
pub use geodesy::{ecef_to_geodetic, enu_basis, geodetic_to_ecef, local_frame, wgs84, EnuBasis, LocalFrame};
pub use instances::{GeoBounds, PlacementInstance, TileBuffer, MAX_INSTANCES};
pub use tileset::{Tileset, HEIGHT_MARGIN_M};
