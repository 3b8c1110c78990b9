//! `tileset.json` for a single i3dm tile.

use serde::{Deserialize, Serialize};

use crate::error::{I3dmError, Result};
use crate::instances::{GeoBounds, PlacementInstance};

/// Added to the top of the region so instanced meshes standing on their
/// placement point stay inside it.
pub const HEIGHT_MARGIN_M: f64 = 50.0;

/// Geometric error of the tileset as a whole.
pub const TILESET_GEOMETRIC_ERROR: f64 = 500.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilesetAsset {
    pub version: String,
}

/// `[west, south, east, north, min_height, max_height]`, radians and metres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingVolume {
    pub region: [f64; 6],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileContent {
    pub uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Refine {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "REPLACE")]
    Replace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootTile {
    #[serde(rename = "boundingVolume")]
    pub bounding_volume: BoundingVolume,
    #[serde(rename = "geometricError")]
    pub geometric_error: f64,
    pub refine: Refine,
    pub content: TileContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tileset {
    pub asset: TilesetAsset,
    #[serde(rename = "geometricError")]
    pub geometric_error: f64,
    pub root: RootTile,
}

impl Tileset {
    /// Region spanning every instance, with [`HEIGHT_MARGIN_M`] added to the top only.
    pub fn for_instances(instances: &[PlacementInstance], content_uri: impl Into<String>) -> Result<Self> {
        let b = GeoBounds::from_instances(instances)
            .ok_or_else(|| I3dmError::invalid_input("need at least one instance"))?;

        Ok(Self {
            asset: TilesetAsset {
                version: "1.0".to_owned(),
            },
            geometric_error: TILESET_GEOMETRIC_ERROR,
            root: RootTile {
                bounding_volume: BoundingVolume {
                    region: [
                        b.lon_min.to_radians(),
                        b.lat_min.to_radians(),
                        b.lon_max.to_radians(),
                        b.lat_max.to_radians(),
                        b.h_min,
                        b.h_max + HEIGHT_MARGIN_M,
                    ],
                },
                geometric_error: 0.0,
                refine: Refine::Add,
                content: TileContent {
                    uri: content_uri.into(),
                },
            },
        })
    }

    /// Pretty-printed JSON, two-space indent.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    #[inline]
    pub fn region(&self) -> &[f64; 6] {
        &self.root.bounding_volume.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::hanoi_instances;

    #[test]
    fn region_spans_instances_in_radians() {
        let tileset = Tileset::for_instances(&hanoi_instances(), "test.i3dm").unwrap();
        let r = tileset.region();

        assert_eq!(r[0], 105.8342f64.to_radians());
        assert_eq!(r[1], 21.0278f64.to_radians());
        assert_eq!(r[2], 105.8348f64.to_radians());
        assert_eq!(r[3], 21.0282f64.to_radians());
        assert_eq!(r[4], 10.0);
        assert_eq!(r[5], 65.0);
    }

    #[test]
    fn margin_only_raises_the_top() {
        let flat: Vec<_> = (0..4)
            .map(|i| PlacementInstance::new(2.0 + i as f64, 48.0, -12.5))
            .collect();
        let r = *Tileset::for_instances(&flat, "a.i3dm").unwrap().region();

        assert_eq!(r[4], -12.5);
        assert!(r[5] >= r[4] + HEIGHT_MARGIN_M);
    }

    #[test]
    fn empty_instances_are_rejected() {
        assert!(matches!(
            Tileset::for_instances(&[], "x.i3dm"),
            Err(I3dmError::InvalidInput(_))
        ));
    }

    #[test]
    fn json_shape() {
        let tileset = Tileset::for_instances(&hanoi_instances(), "instances_1_3_abcd1234.i3dm").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&tileset.to_json_bytes().unwrap()).unwrap();

        assert_eq!(value["asset"]["version"], "1.0");
        assert_eq!(value["geometricError"], 500.0);
        assert_eq!(value["root"]["geometricError"], 0.0);
        assert_eq!(value["root"]["refine"], "ADD");
        assert_eq!(value["root"]["content"]["uri"], "instances_1_3_abcd1234.i3dm");
        assert_eq!(value["root"]["boundingVolume"]["region"].as_array().unwrap().len(), 6);

        let back: Tileset = serde_json::from_value(value).unwrap();
        assert_eq!(back, tileset);
    }
}
