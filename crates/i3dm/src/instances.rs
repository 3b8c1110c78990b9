use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{I3dmError, Result};
use crate::geodesy::{geodetic_to_ecef, local_frame};

/// Upper bound on instances per tile accepted by callers.
pub const MAX_INSTANCES: usize = 10_000;

/// One placement of the mesh. Heights are absolute (above the ellipsoid).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlacementInstance {
    /// Longitude in degrees
    pub lon: f64,
    /// Latitude in degrees
    pub lat: f64,
    /// Metres above the WGS-84 ellipsoid
    pub height: f64,
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Degrees; positive turns the frame counter-clockwise seen from above
    #[serde(default)]
    pub heading: f64,
}

fn default_scale() -> f64 {
    1.0
}

impl PlacementInstance {
    pub fn new(lon: f64, lat: f64, height: f64) -> Self {
        Self {
            lon,
            lat,
            height,
            scale: 1.0,
            heading: 0.0,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = heading;
        self
    }

    /// Range checks only; presence of fields is enforced by deserialization.
    pub fn validate(&self) -> Result<()> {
        if !(self.lon.is_finite() && (-180.0..=180.0).contains(&self.lon)) {
            return Err(I3dmError::invalid_input(format!("longitude {} outside [-180, 180]", self.lon)));
        }

        if !(self.lat.is_finite() && (-90.0..=90.0).contains(&self.lat)) {
            return Err(I3dmError::invalid_input(format!("latitude {} outside [-90, 90]", self.lat)));
        }

        if !self.height.is_finite() {
            return Err(I3dmError::invalid_input("height must be finite"));
        }

        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(I3dmError::invalid_input(format!("scale {} must be positive", self.scale)));
        }

        if !self.heading.is_finite() {
            return Err(I3dmError::invalid_input("heading must be finite"));
        }

        Ok(())
    }
}

/// The four feature-table arrays of a tile, index-aligned with the input instances.
#[derive(Debug, Clone, PartialEq)]
pub struct TileBuffer {
    /// ECEF of the first instance; written as `RTC_CENTER`.
    pub origin: [f64; 3],
    pub positions: Vec<[f32; 3]>,
    pub ups: Vec<[f32; 3]>,
    pub rights: Vec<[f32; 3]>,
    pub scales: Vec<f32>,
}

impl TileBuffer {
    /// Transform every instance into origin-relative position + its own frame + scale.
    ///
    /// Relative positions are differenced in f64 and only then narrowed, so the
    /// stored magnitudes stay within a tile's extent rather than ~6.4e6 m.
    pub fn build(instances: &[PlacementInstance]) -> Result<Self> {
        let first = instances
            .first()
            .ok_or_else(|| I3dmError::invalid_input("need at least one instance"))?;

        for (index, inst) in instances.iter().enumerate() {
            inst.validate().map_err(|e| match e {
                I3dmError::InvalidInput(msg) => I3dmError::InvalidInput(format!("instance {index}: {msg}")),
                other => other,
            })?;
        }

        let origin = geodetic_to_ecef(first.lon, first.lat, first.height);

        // Each instance gets its own frame; order is preserved by the indexed collect.
        let rows: Vec<([f32; 3], [f32; 3], [f32; 3], f32)> = instances
            .par_iter()
            .map(|inst| {
                let abs = geodetic_to_ecef(inst.lon, inst.lat, inst.height);
                let rel = [abs[0] - origin[0], abs[1] - origin[1], abs[2] - origin[2]];
                let frame = local_frame(inst.lon, inst.lat, inst.heading);

                (to_f32x3(rel), to_f32x3(frame.up), to_f32x3(frame.right), inst.scale as f32)
            })
            .collect();

        let mut buffer = TileBuffer {
            origin,
            positions: Vec::with_capacity(rows.len()),
            ups: Vec::with_capacity(rows.len()),
            rights: Vec::with_capacity(rows.len()),
            scales: Vec::with_capacity(rows.len()),
        };

        for (position, up, right, scale) in rows {
            buffer.positions.push(position);
            buffer.ups.push(up);
            buffer.rights.push(right);
            buffer.scales.push(scale);
        }

        debug!(
            "Built buffers for {} instances, RTC center ({:.2}, {:.2}, {:.2})",
            buffer.len(),
            origin[0],
            origin[1],
            origin[2]
        );

        Ok(buffer)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// True when all four arrays describe the same number of instances.
    pub fn is_consistent(&self) -> bool {
        let n = self.positions.len();
        self.ups.len() == n && self.rights.len() == n && self.scales.len() == n
    }
}

#[inline]
fn to_f32x3(v: [f64; 3]) -> [f32; 3] {
    [v[0] as f32, v[1] as f32, v[2] as f32]
}

/// Geographic extent of a set of instances, degrees and metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBounds {
    pub lon_min: f64,
    pub lon_max: f64,
    pub lat_min: f64,
    pub lat_max: f64,
    pub h_min: f64,
    pub h_max: f64,
}

impl GeoBounds {
    /// `None` for an empty slice; there are no degenerate bounds.
    pub fn from_instances(instances: &[PlacementInstance]) -> Option<Self> {
        let first = instances.first()?;

        let init = GeoBounds {
            lon_min: first.lon,
            lon_max: first.lon,
            lat_min: first.lat,
            lat_max: first.lat,
            h_min: first.height,
            h_max: first.height,
        };

        Some(instances[1..].iter().fold(init, |b, inst| GeoBounds {
            lon_min: b.lon_min.min(inst.lon),
            lon_max: b.lon_max.max(inst.lon),
            lat_min: b.lat_min.min(inst.lat),
            lat_max: b.lat_max.max(inst.lat),
            h_min: b.h_min.min(inst.height),
            h_max: b.h_max.max(inst.height),
        }))
    }
}

#[cfg(test)]
pub(crate) fn hanoi_instances() -> Vec<PlacementInstance> {
    vec![
        PlacementInstance::new(105.8342, 21.0278, 10.0),
        PlacementInstance::new(105.8345, 21.0280, 10.0)
            .with_scale(1.2)
            .with_heading(45.0),
        PlacementInstance::new(105.8348, 21.0282, 15.0)
            .with_scale(0.8)
            .with_heading(90.0),
    ]
}
