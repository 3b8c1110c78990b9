//! WGS-84 geodesy: geodetic <-> ECEF and the per-instance orientation frame.
//!
//! Argument order throughout is `(lon, lat, h)`, degrees and metres, matching
//! the placement records.

pub mod wgs84 {
    /// Semi-major axis (equatorial radius) in meters.
    pub const A: f64 = 6_378_137.0;

    /// First eccentricity squared.
    pub const E2: f64 = 0.006_694_379_990_14;

    /// Semi-minor axis (polar radius) in meters.
    pub const B: f64 = 6_356_752.314_245_184;

    /// Second eccentricity squared.
    pub const E2P: f64 = E2 / (1.0 - E2);
}

/// Geodetic (degrees, metres above the ellipsoid) to ECEF metres.
///
/// No special casing at the poles; +-90 deg yields whatever the float math gives.
#[inline]
pub fn geodetic_to_ecef(lon_deg: f64, lat_deg: f64, h_m: f64) -> [f64; 3] {
    let (sin_lat, cos_lat) = lat_deg.to_radians().sin_cos();
    let (sin_lon, cos_lon) = lon_deg.to_radians().sin_cos();

    // Radius of curvature in the prime vertical
    let n = wgs84::A / (1.0 - wgs84::E2 * sin_lat * sin_lat).sqrt();

    let x = (n + h_m) * cos_lat * cos_lon;
    let y = (n + h_m) * cos_lat * sin_lon;
    let z = (n * (1.0 - wgs84::E2) + h_m) * sin_lat;

    [x, y, z]
}

/// ECEF metres back to `(lon_deg, lat_deg, h_m)` using Bowring's closed form.
///
/// Sub-millimetre for anything near the surface; degrades close to the poles
/// where `h` is recovered through `1 / cos(lat)`.
#[inline]
pub fn ecef_to_geodetic(x: f64, y: f64, z: f64) -> (f64, f64, f64) {
    // Distance from the Z-axis
    let p = (x * x + y * y).sqrt();

    let lon = y.atan2(x);

    // Parametric latitude estimate
    let theta = (z * wgs84::A).atan2(p * wgs84::B);
    let (sin_theta, cos_theta) = theta.sin_cos();

    let lat_numerator = z + wgs84::E2P * wgs84::B * sin_theta * sin_theta * sin_theta;
    let lat_denominator = p - wgs84::E2 * wgs84::A * cos_theta * cos_theta * cos_theta;
    let lat = lat_numerator.atan2(lat_denominator);

    let sin_lat = lat.sin();
    let n = wgs84::A / (1.0 - wgs84::E2 * sin_lat * sin_lat).sqrt();

    let h = p / lat.cos() - n;

    (lon.to_degrees(), lat.to_degrees(), h)
}

/// The geographic tangent basis at a point, in ECEF axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnuBasis {
    pub east: [f64; 3],
    pub north: [f64; 3],
    /// Ellipsoid normal.
    pub up: [f64; 3],
}

/// Closed-form east/north/up unit vectors at `(lon, lat)`.
#[inline]
pub fn enu_basis(lon_deg: f64, lat_deg: f64) -> EnuBasis {
    let (sin_lat, cos_lat) = lat_deg.to_radians().sin_cos();
    let (sin_lon, cos_lon) = lon_deg.to_radians().sin_cos();

    EnuBasis {
        east: [-sin_lon, cos_lon, 0.0],
        north: [-sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat],
        up: [cos_lat * cos_lon, cos_lat * sin_lon, sin_lat],
    }
}

/// Orientation written to the tile for one instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalFrame {
    /// Becomes `NORMAL_UP`.
    pub up: [f64; 3],
    /// Becomes `NORMAL_RIGHT`.
    pub right: [f64; 3],
}

/// Frame for an instance at `(lon, lat)` with the east/north pair rotated by `heading_deg`.
///
/// Positive headings turn counter-clockwise seen from above: at 90 deg `up`
/// points west and `right` points north.
///
/// `up` is the rotated NORTH vector, not the ellipsoid normal: glb meshes are
/// Y-up and the viewer maps the model's +Y onto `NORMAL_UP`, so binding it to
/// north is what makes the mesh stand upright. `right` is the rotated east.
pub fn local_frame(lon_deg: f64, lat_deg: f64, heading_deg: f64) -> LocalFrame {
    let EnuBasis { east, north, .. } = enu_basis(lon_deg, lat_deg);
    let (sin_h, cos_h) = heading_deg.to_radians().sin_cos();

    let mut rotated_east = [0.0; 3];
    let mut rotated_north = [0.0; 3];

    for i in 0..3 {
        rotated_east[i] = east[i] * cos_h + north[i] * sin_h;
        rotated_north[i] = -east[i] * sin_h + north[i] * cos_h;
    }

    LocalFrame {
        up: rotated_north,
        right: rotated_east,
    }
}

#[cfg(test)]
fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[cfg(test)]
fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}
