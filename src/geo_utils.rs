//! Geographic utilities: distances, bounds and hyperplane math.
//!
//! Two distance modes coexist in this crate:
//! - **planar** distances in degree units, valid only for relative ordering
//!   (what the spatial index compares internally);
//! - **geodesic** distances in meters over a spherical Earth, what callers
//!   show to users.
//!
//! A single query must use one mode throughout so its ordering is valid.

use serde::{Deserialize, Serialize};

use crate::GpsPoint;

/// Earth radius in meters (spherical approximation).
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Distance function selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMode {
    /// Euclidean distance over raw (lat, lng) coordinates, in degree units.
    /// Never user-facing.
    Planar,
    /// Great-circle distance in meters (haversine).
    Geodesic,
}

impl DistanceMode {
    /// Distance between two points in this mode's unit.
    pub fn measure(&self, a: &GpsPoint, b: &GpsPoint) -> f64 {
        match self {
            DistanceMode::Planar => planar_distance(a, b),
            DistanceMode::Geodesic => haversine_distance(a, b),
        }
    }
}

/// Great-circle distance between two GPS points in meters.
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let dlat = (p2.latitude - p1.latitude).to_radians();
    let dlng = (p2.longitude - p1.longitude).to_radians();

    let sin_dlat_half = (dlat * 0.5).sin();
    let sin_dlng_half = (dlng * 0.5).sin();

    let h = sin_dlat_half * sin_dlat_half
        + lat1.cos() * lat2.cos() * sin_dlng_half * sin_dlng_half;

    2.0 * EARTH_RADIUS * h.sqrt().asin()
}

/// Euclidean distance over raw coordinates, in degree units.
pub fn planar_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let dlat = p1.latitude - p2.latitude;
    let dlng = p1.longitude - p2.longitude;
    (dlat * dlat + dlng * dlng).sqrt()
}

/// Geodesic distance in meters from a point at `lat1` to the parallel of
/// latitude `lat2`, measured along the meridian (the shortest path to a
/// parallel runs due north/south).
pub fn meridian_distance(lat1: f64, lat2: f64) -> f64 {
    EARTH_RADIUS * (lat2 - lat1).to_radians().abs()
}

/// Geodesic distance in meters from a point at latitude `lat` to the
/// meridian `dlng` degrees of longitude away.
///
/// Parallels of latitude are not great circles, so this is not a plain
/// haversine: the shortest path projects through the spherical triangle.
pub fn parallel_distance(lat: f64, dlng: f64) -> f64 {
    (EARTH_RADIUS * (dlng.to_radians().sin() * lat.to_radians().cos()).asin()).abs()
}

/// Total geodesic length of a polyline in meters.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}
