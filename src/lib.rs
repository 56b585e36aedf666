//! # Station Locator
//!
//! Nearest railway station search and next-station prediction from GPS fixes.
//!
//! This library provides:
//! - A segmented, lazily materialized k-d tree over station coordinates
//! - Track geometry parsing and cursor-based next-station prediction
//! - Debounced search orchestration with a stable "detected station" signal
//!
//! The crate is the computational core of a station-finding application:
//! UI, permissions, persistence and data download are collaborators that
//! feed it location fixes and consume its ranked results.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use station_locator::{
//!     DistanceMode, GpsPoint, MemoryDataset, Station, StationKdTree,
//! };
//! use station_locator::kdtree::build_tree_segments;
//!
//! let stations = vec![
//!     Station::new(1130101, "Tokyo", 35.681236, 139.767125),
//!     Station::new(1130102, "Kanda", 35.69169, 139.770883),
//!     Station::new(1130103, "Okachimachi", 35.707438, 139.774632),
//! ];
//! let segments = build_tree_segments(&stations, 2).unwrap();
//! let dataset = Arc::new(MemoryDataset::from_parts(stations, vec![], segments).unwrap());
//!
//! let tree = StationKdTree::new(dataset, "root");
//! let result = tree
//!     .search(GpsPoint::new(35.68, 139.76), 1, 0.0, DistanceMode::Geodesic)
//!     .unwrap();
//! assert_eq!(result.stations[0].station.code, 1130101);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{LocatorError, OptionExt, Result};

// Geographic utilities (distance functions, hyperplane math)
pub mod geo_utils;
pub use geo_utils::DistanceMode;

// Dataset provider abstraction and in-memory implementation
pub mod dataset;
pub use dataset::{DatasetProvider, MemoryDataset, NodeRecord, TreeSegment};

// Spatial index (segmented lazy k-d tree)
pub mod kdtree;
pub use kdtree::{MeasuredStation, SearchResult, StationKdTree};

// Track geometry model (polyline documents, edge graph, projection)
pub mod track;
pub use track::{Projection, StationMark, Track, TrackEdge};

// Polyline cursor navigator (prediction state machine)
pub mod navigator;
pub use navigator::{LineNavigator, PredictionResult, StationPrediction};

// Search orchestration (debounced near-station stream)
pub mod search;
pub use search::{NearStation, SearchEvent, StationSearcher};

// Stateful coordinator tying search and navigation together
pub mod engine;
pub use engine::LocatorEngine;

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use station_locator::GpsPoint;
/// let point = GpsPoint::new(35.681236, 139.767125); // Tokyo Station
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// One sample from the location stream.
///
/// Carries both a wall-clock timestamp and a monotonic-clock timestamp
/// (milliseconds), matching what platform location services deliver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// Monotonic clock timestamp in milliseconds.
    pub elapsed_realtime: i64,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64, timestamp: i64, elapsed_realtime: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
            elapsed_realtime,
        }
    }

    /// The fix position as a `GpsPoint`.
    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    /// Check if the fix has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.point().is_valid()
    }
}

/// A railway station record.
///
/// `code` is globally unique and is the only key used by the spatial index
/// and all joins. The voronoi cell is an opaque geometry blob the core never
/// interprets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub code: u32,
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub name_kana: Option<String>,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub prefecture: u8,
    #[serde(default)]
    pub lines: Vec<u32>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub voronoi: Option<serde_json::Value>,
}

impl Station {
    /// Create a station with the essential fields; the rest default.
    pub fn new(code: u32, name: &str, lat: f64, lng: f64) -> Self {
        Self {
            code,
            id: String::new(),
            name: name.to_string(),
            name_kana: None,
            lat,
            lng,
            prefecture: 0,
            lines: Vec::new(),
            closed: false,
            voronoi: None,
        }
    }

    /// The station position as a `GpsPoint`.
    pub fn position(&self) -> GpsPoint {
        GpsPoint::new(self.lat, self.lng)
    }
}

/// A station's registration on a line, with optional numbering labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationRegistration {
    pub code: u32,
    #[serde(default)]
    pub numbering: Option<Vec<String>>,
}

/// A railway line record.
///
/// `polyline` is the line's encoded track geometry document; it is absent
/// for lines without trackable geometry (e.g. closed lines), in which case
/// a navigator cannot be constructed for the line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Line {
    pub code: u32,
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub name_kana: Option<String>,
    pub station_size: u32,
    pub station_list: Vec<StationRegistration>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub polyline: Option<String>,
}

impl Line {
    /// Whether this line carries track geometry a navigator can follow.
    pub fn has_track_geometry(&self) -> bool {
        self.polyline.is_some()
    }
}

/// Configuration for the search orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Number of nearest stations to return per query. Must be >= 1.
    pub k: usize,
    /// Distance mode used for index comparisons and reported distances.
    pub mode: DistanceMode,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            k: 12,
            mode: DistanceMode::Geodesic,
        }
    }
}

/// Configuration for the prediction navigator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionConfig {
    /// Maximum number of upcoming stations per prediction. Must be >= 1.
    pub max_prediction: usize,
    /// Fixes closer than this (meters) to the last processed fix are
    /// skipped as GPS jitter.
    pub jitter_threshold: f64,
    /// Cursors whose nearest-point distance exceeds this multiple of the
    /// minimum among live cursors are discarded. Tunable heuristic.
    pub prune_ratio: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            max_prediction: 5,
            jitter_threshold: 5.0,
            prune_ratio: 2.0,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(35.681236, 139.767125).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_location_fix() {
        let fix = LocationFix::new(35.68, 139.76, 1_700_000_000_000, 12_345);
        assert!(fix.is_valid());
        assert_eq!(fix.point(), GpsPoint::new(35.68, 139.76));

        let bad = LocationFix::new(f64::INFINITY, 139.76, 0, 0);
        assert!(!bad.is_valid());
    }

    #[test]
    fn test_station_position() {
        let s = Station::new(1130101, "Tokyo", 35.681236, 139.767125);
        assert_eq!(s.position(), GpsPoint::new(35.681236, 139.767125));
        assert!(!s.closed);
        assert!(s.lines.is_empty());
    }

    #[test]
    fn test_station_json_roundtrip() {
        let json = r#"{
            "code": 1130101,
            "id": "d8aab",
            "name": "Tokyo",
            "lat": 35.681236,
            "lng": 139.767125,
            "prefecture": 13,
            "lines": [11301, 11302],
            "voronoi": {"type": "Polygon", "coordinates": []}
        }"#;
        let station: Station = serde_json::from_str(json).unwrap();
        assert_eq!(station.code, 1130101);
        assert_eq!(station.lines, vec![11301, 11302]);
        assert!(station.voronoi.is_some());
        assert!(!station.closed);
    }

    #[test]
    fn test_line_geometry_flag() {
        let line: Line = serde_json::from_str(
            r#"{
                "code": 11302,
                "name": "Yamanote",
                "station_size": 1,
                "station_list": [{"code": 1130101}]
            }"#,
        )
        .unwrap();
        assert!(!line.has_track_geometry());
    }

    #[test]
    fn test_config_defaults() {
        let search = SearchConfig::default();
        assert!(search.k >= 1);
        assert_eq!(search.mode, DistanceMode::Geodesic);

        let prediction = PredictionConfig::default();
        assert!(prediction.max_prediction >= 1);
        assert_eq!(prediction.jitter_threshold, 5.0);
        assert_eq!(prediction.prune_ratio, 2.0);
    }
}
