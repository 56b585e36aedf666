//! Dataset provider abstraction and an in-memory implementation.
//!
//! Reference data (stations, lines, tree segments) is installed wholesale
//! when a dataset version lands and replaced atomically on update; the core
//! only ever reads it. The provider trait captures the three access patterns
//! the core needs: batch station lookup, batch line lookup, and tree segment
//! lookup by name.

use std::collections::HashMap;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{LocatorError, Result};
use crate::{Line, Station};

// ============================================================================
// Storage Schema
// ============================================================================

/// One node record as stored in a tree segment document.
///
/// A record either materializes a node (lat/lng present) or is a boundary
/// pointer into another segment (`segment` names the segment holding the
/// subtree rooted at `code`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub code: u32,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub left: Option<u32>,
    #[serde(default)]
    pub right: Option<u32>,
    #[serde(default)]
    pub segment: Option<String>,
}

/// A named, independently loadable chunk of the k-d tree's node list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSegment {
    pub name: String,
    /// Code of the subtree root contained in this segment.
    pub root: u32,
    pub nodes: Vec<NodeRecord>,
}

// ============================================================================
// Provider Trait
// ============================================================================

/// Read access to the installed reference dataset.
///
/// Batch lookups return the records found, ordered ascending by code; the
/// return order is a storage detail and callers that need query order must
/// reorder themselves. Absence of a requested code is not an error at this
/// layer — callers decide whether a miss is fatal.
pub trait DatasetProvider: Send + Sync {
    fn stations_by_codes(&self, codes: &[u32]) -> Result<Vec<Station>>;
    fn lines_by_codes(&self, codes: &[u32]) -> Result<Vec<Line>>;
    fn tree_segment(&self, name: &str) -> Result<TreeSegment>;
}

// ============================================================================
// In-Memory Dataset
// ============================================================================

/// Top-level dataset document shape.
#[derive(Debug, Deserialize)]
struct DatasetDoc {
    stations: Vec<Station>,
    #[serde(default)]
    lines: Vec<Line>,
    #[serde(default)]
    segments: Vec<TreeSegment>,
}

/// An installed dataset held fully in memory.
///
/// Validates the integrity invariants the core relies on at install time:
/// unique station codes, valid coordinates, and line station lists matching
/// their declared size.
#[derive(Debug, Default)]
pub struct MemoryDataset {
    stations: HashMap<u32, Station>,
    lines: HashMap<u32, Line>,
    segments: HashMap<String, TreeSegment>,
}

impl MemoryDataset {
    /// Build a dataset from parts, validating integrity invariants.
    pub fn from_parts(
        stations: Vec<Station>,
        lines: Vec<Line>,
        segments: Vec<TreeSegment>,
    ) -> Result<Self> {
        let mut station_map = HashMap::with_capacity(stations.len());
        for station in stations {
            if !station.position().is_valid() {
                return Err(LocatorError::DataIntegrity {
                    message: format!("station {} has invalid coordinates", station.code),
                });
            }
            let code = station.code;
            if station_map.insert(code, station).is_some() {
                return Err(LocatorError::DataIntegrity {
                    message: format!("duplicate station code {} in dataset", code),
                });
            }
        }

        let mut line_map = HashMap::with_capacity(lines.len());
        for line in lines {
            if line.station_list.len() != line.station_size as usize {
                return Err(LocatorError::DataIntegrity {
                    message: format!(
                        "line {} declares {} stations but lists {}",
                        line.code,
                        line.station_size,
                        line.station_list.len()
                    ),
                });
            }
            if line_map.insert(line.code, line).is_some() {
                return Err(LocatorError::DataIntegrity {
                    message: "duplicate line code in dataset".to_string(),
                });
            }
        }

        let mut segment_map = HashMap::with_capacity(segments.len());
        for segment in segments {
            if segment_map
                .insert(segment.name.clone(), segment)
                .is_some()
            {
                return Err(LocatorError::DataIntegrity {
                    message: "duplicate tree segment name in dataset".to_string(),
                });
            }
        }

        info!(
            "[MemoryDataset] Installed {} stations, {} lines, {} tree segments",
            station_map.len(),
            line_map.len(),
            segment_map.len()
        );

        Ok(Self {
            stations: station_map,
            lines: line_map,
            segments: segment_map,
        })
    }

    /// Parse and validate a full dataset document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let doc: DatasetDoc =
            serde_json::from_str(json).map_err(|e| LocatorError::DataIntegrity {
                message: format!("dataset document: {}", e),
            })?;
        Self::from_parts(doc.stations, doc.lines, doc.segments)
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }
}

impl DatasetProvider for MemoryDataset {
    fn stations_by_codes(&self, codes: &[u32]) -> Result<Vec<Station>> {
        let mut found: Vec<Station> = codes
            .iter()
            .filter_map(|code| self.stations.get(code).cloned())
            .collect();
        // Storage return order is by key, not by query order.
        found.sort_by_key(|s| s.code);
        found.dedup_by_key(|s| s.code);
        Ok(found)
    }

    fn lines_by_codes(&self, codes: &[u32]) -> Result<Vec<Line>> {
        let mut found: Vec<Line> = codes
            .iter()
            .filter_map(|code| self.lines.get(code).cloned())
            .collect();
        found.sort_by_key(|l| l.code);
        found.dedup_by_key(|l| l.code);
        Ok(found)
    }

    fn tree_segment(&self, name: &str) -> Result<TreeSegment> {
        self.segments
            .get(name)
            .cloned()
            .ok_or_else(|| LocatorError::DataIntegrity {
                message: format!("tree segment '{}' not found", name),
            })
    }
}
