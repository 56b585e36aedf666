//! Segmented, lazily materialized k-d tree over station coordinates.
//!
//! The tree is stored as a forest of named segments, each a self-contained
//! subtree (node list + subtree root code). Nodes live in an arena keyed by
//! station code; an entry is either `Resolved` (coordinates and children in
//! memory) or `Unresolved` (only the name of the segment that contains it).
//! Resolving a segment loads its full node list through the dataset provider
//! and caches it indefinitely — the dataset is small enough to hold fully
//! once touched.
//!
//! Split-axis convention: **even depth compares longitude, odd depth
//! compares latitude**. `build_tree_segments` and the query traversal apply
//! the same convention.
//!
//! Concurrency: a single coarse mutex guards the arena and the loaded-segment
//! set, so concurrent first-time queries load each segment at most once. The
//! root bootstrap is additionally cached in a `OnceCell`. Resolved nodes are
//! never mutated in place, so queries over already-resolved subtrees only
//! take the lock briefly per node visit.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::debug;
use once_cell::sync::OnceCell;

use crate::dataset::{DatasetProvider, NodeRecord, TreeSegment};
use crate::error::{LocatorError, OptionExt, Result};
use crate::geo_utils::{self, DistanceMode};
use crate::{GpsPoint, Station};

// ============================================================================
// Node Arena
// ============================================================================

/// A fully materialized tree node. Coordinates are a redundant cache of the
/// station's position so comparisons never need a station join.
#[derive(Debug, Clone, Copy)]
struct TreeNode {
    code: u32,
    lat: f64,
    lng: f64,
    left: Option<u32>,
    right: Option<u32>,
}

#[derive(Debug, Clone)]
enum NodeEntry {
    Resolved(TreeNode),
    /// Name of the storage segment holding this node's subtree.
    Unresolved(String),
}

struct TreeState {
    arena: HashMap<u32, NodeEntry>,
    loaded: HashSet<String>,
}

// ============================================================================
// Search Results
// ============================================================================

/// A station paired with its distance from the query point, in the unit of
/// the query's distance mode.
#[derive(Debug, Clone)]
pub struct MeasuredStation {
    pub station: Station,
    pub distance: f64,
}

/// The outcome of one spatial query. Never mutated in place; recomputed on
/// every accepted location fix.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub point: GpsPoint,
    pub k: usize,
    pub r: f64,
    pub mode: DistanceMode,
    /// Stations ordered ascending by distance (ties broken by code).
    pub stations: Vec<MeasuredStation>,
}

impl SearchResult {
    /// Station codes in result order.
    pub fn codes(&self) -> Vec<u32> {
        self.stations.iter().map(|m| m.station.code).collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    code: u32,
    distance: f64,
}

// ============================================================================
// Station K-d Tree
// ============================================================================

/// Spatial index answering "k nearest stations, optionally within radius r"
/// over a lazily loaded segment forest.
pub struct StationKdTree {
    provider: Arc<dyn DatasetProvider>,
    root_segment: String,
    root: OnceCell<u32>,
    state: Mutex<TreeState>,
}

impl StationKdTree {
    /// Create a tree over the given provider. No I/O happens until the
    /// first query.
    pub fn new(provider: Arc<dyn DatasetProvider>, root_segment: impl Into<String>) -> Self {
        Self {
            provider,
            root_segment: root_segment.into(),
            root: OnceCell::new(),
            state: Mutex::new(TreeState {
                arena: HashMap::new(),
                loaded: HashSet::new(),
            }),
        }
    }

    /// Search the k nearest stations to `point`, merged with every station
    /// within radius `r` (same unit as `mode` distances; pass `r = 0.0` for
    /// a plain k-nearest query).
    ///
    /// The result buffer satisfies both stopping criteria jointly: it holds
    /// at least `k` entries (when that many exist) plus every station within
    /// `r`, sorted ascending by distance.
    pub fn search(
        &self,
        point: GpsPoint,
        k: usize,
        r: f64,
        mode: DistanceMode,
    ) -> Result<SearchResult> {
        if k < 1 {
            return Err(LocatorError::InvalidParameter {
                message: format!("k must be >= 1, got {}", k),
            });
        }
        if !(r >= 0.0) {
            return Err(LocatorError::InvalidParameter {
                message: format!("radius must be non-negative, got {}", r),
            });
        }
        if !point.is_valid() {
            return Err(LocatorError::InvalidParameter {
                message: format!("query point out of range: {:?}", point),
            });
        }

        let root = self.root()?;
        let mut buffer: Vec<Candidate> = Vec::with_capacity(k + 1);
        self.search_node(Some(root), &point, 0, k, r, mode, &mut buffer)?;

        let stations = self.assemble(&buffer)?;
        Ok(SearchResult {
            point,
            k,
            r,
            mode,
            stations,
        })
    }

    /// Bootstrap the root code, loading the root segment on first use.
    fn root(&self) -> Result<u32> {
        self.root
            .get_or_try_init(|| {
                let mut state = self.state.lock().unwrap();
                self.load_segment(&self.root_segment, &mut state)
            })
            .copied()
    }

    /// Resolve a node code to its materialized form, loading the owning
    /// segment if needed. Holds the state lock across the check-then-load
    /// sequence so each segment is parsed at most once.
    fn resolve(&self, code: u32) -> Result<TreeNode> {
        let mut state = self.state.lock().unwrap();
        loop {
            let pending = match state.arena.get(&code) {
                Some(NodeEntry::Resolved(node)) => return Ok(*node),
                Some(NodeEntry::Unresolved(segment)) => segment.clone(),
                None => {
                    return Err(LocatorError::DataIntegrity {
                        message: format!("unknown tree node {}", code),
                    });
                }
            };
            if state.loaded.contains(&pending) {
                return Err(LocatorError::DataIntegrity {
                    message: format!("node {} not materialized by segment '{}'", code, pending),
                });
            }
            self.load_segment(&pending, &mut state)?;
        }
    }

    /// Load a segment's node list into the arena. Returns the segment's
    /// declared subtree root code. Caller must hold the state lock.
    fn load_segment(&self, name: &str, state: &mut TreeState) -> Result<u32> {
        let segment = self.provider.tree_segment(name)?;
        if segment.name != name {
            return Err(LocatorError::DataIntegrity {
                message: format!(
                    "requested segment '{}' but storage returned '{}'",
                    name, segment.name
                ),
            });
        }
        debug!(
            "[StationKdTree] Resolving segment '{}' ({} nodes)",
            name,
            segment.nodes.len()
        );

        let root = segment.root;
        let mut root_materialized = false;
        for record in segment.nodes {
            match record.segment {
                Some(ref other) if other != name => {
                    // Boundary pointer into another segment. A previously
                    // materialized node always wins over a pointer.
                    state
                        .arena
                        .entry(record.code)
                        .or_insert_with(|| NodeEntry::Unresolved(other.clone()));
                }
                _ => {
                    let lat = record
                        .lat
                        .ok_or_integrity(&format!("node {} missing latitude", record.code))?;
                    let lng = record
                        .lng
                        .ok_or_integrity(&format!("node {} missing longitude", record.code))?;
                    if record.code == root {
                        root_materialized = true;
                    }
                    state.arena.insert(
                        record.code,
                        NodeEntry::Resolved(TreeNode {
                            code: record.code,
                            lat,
                            lng,
                            left: record.left,
                            right: record.right,
                        }),
                    );
                }
            }
        }

        if !root_materialized {
            return Err(LocatorError::DataIntegrity {
                message: format!("segment '{}' does not materialize its root {}", name, root),
            });
        }
        state.loaded.insert(name.to_string());
        Ok(root)
    }

    /// Classic k-d branch-and-bound with the two stopping criteria merged.
    #[allow(clippy::too_many_arguments)]
    fn search_node(
        &self,
        code: Option<u32>,
        point: &GpsPoint,
        depth: usize,
        k: usize,
        r: f64,
        mode: DistanceMode,
        buffer: &mut Vec<Candidate>,
    ) -> Result<()> {
        let Some(code) = code else {
            return Ok(());
        };
        let node = self.resolve(code)?;
        let position = GpsPoint::new(node.lat, node.lng);
        insert_candidate(
            buffer,
            Candidate {
                code,
                distance: mode.measure(point, &position),
            },
            k,
            r,
        );

        // Even depth splits on longitude, odd on latitude.
        let lng_axis = depth % 2 == 0;
        let (query_axis, node_axis) = if lng_axis {
            (point.longitude, node.lng)
        } else {
            (point.latitude, node.lat)
        };
        let (near, far) = if query_axis < node_axis {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        self.search_node(near, point, depth + 1, k, r, mode, buffer)?;

        // Distance from the query point to the splitting hyperplane. A
        // longitude split is a meridian, reached by travelling along the
        // query's parallel; a latitude split is a parallel, reached along
        // the meridian.
        let boundary = match mode {
            DistanceMode::Planar => (query_axis - node_axis).abs(),
            DistanceMode::Geodesic => {
                if lng_axis {
                    geo_utils::parallel_distance(point.latitude, point.longitude - node.lng)
                } else {
                    geo_utils::meridian_distance(point.latitude, node.lat)
                }
            }
        };
        let threshold = if buffer.len() < k {
            f64::INFINITY
        } else {
            buffer.last().map_or(f64::INFINITY, |c| c.distance).max(r)
        };
        if boundary <= threshold {
            self.search_node(far, point, depth + 1, k, r, mode, buffer)?;
        }
        Ok(())
    }

    /// Resolve the collected codes to full station records, preserving the
    /// distance order established during traversal (batch lookups return in
    /// key order, so the ordered candidate list drives the output).
    fn assemble(&self, buffer: &[Candidate]) -> Result<Vec<MeasuredStation>> {
        let codes: Vec<u32> = buffer.iter().map(|c| c.code).collect();
        let fetched = self.provider.stations_by_codes(&codes)?;
        let mut by_code: HashMap<u32, Station> =
            fetched.into_iter().map(|s| (s.code, s)).collect();

        let mut stations = Vec::with_capacity(buffer.len());
        for candidate in buffer {
            let station = by_code
                .remove(&candidate.code)
                .ok_or_integrity(&format!("station {} missing from storage", candidate.code))?;
            stations.push(MeasuredStation {
                station,
                distance: candidate.distance,
            });
        }
        Ok(stations)
    }
}

/// Insertion-sort a candidate into the distance-ordered buffer, then trim
/// the tail while both stopping criteria stay satisfied (more than k entries
/// AND the tail beyond the radius).
fn insert_candidate(buffer: &mut Vec<Candidate>, candidate: Candidate, k: usize, r: f64) {
    let rank = buffer
        .iter()
        .position(|c| {
            c.distance > candidate.distance
                || (c.distance == candidate.distance && c.code > candidate.code)
        })
        .unwrap_or(buffer.len());
    buffer.insert(rank, candidate);
    while buffer.len() > k && buffer.last().map_or(false, |c| c.distance > r) {
        buffer.pop();
    }
}

// ============================================================================
// Segment Builder
// ============================================================================

struct BuiltNode {
    code: u32,
    lat: f64,
    lng: f64,
    left: Option<usize>,
    right: Option<usize>,
    size: usize,
}

/// Build the segment forest for a station list.
///
/// Median splitting on alternating axes (even depth on longitude) yields a
/// balanced tree; subtrees of at most `capacity` nodes hanging off the root
/// segment spill into their own segments, so a consumer can materialize the
/// tree incrementally. The root segment is named `"root"`.
pub fn build_tree_segments(stations: &[Station], capacity: usize) -> Result<Vec<TreeSegment>> {
    if stations.is_empty() {
        return Err(LocatorError::InvalidParameter {
            message: "cannot build a tree over zero stations".to_string(),
        });
    }
    if capacity < 1 {
        return Err(LocatorError::InvalidParameter {
            message: "segment capacity must be >= 1".to_string(),
        });
    }
    let mut seen = HashSet::with_capacity(stations.len());
    for station in stations {
        if !station.position().is_valid() {
            return Err(LocatorError::DataIntegrity {
                message: format!("station {} has invalid coordinates", station.code),
            });
        }
        if !seen.insert(station.code) {
            return Err(LocatorError::DataIntegrity {
                message: format!("duplicate station code {}", station.code),
            });
        }
    }

    let mut points: Vec<(u32, f64, f64)> =
        stations.iter().map(|s| (s.code, s.lat, s.lng)).collect();
    let mut nodes: Vec<BuiltNode> = Vec::with_capacity(points.len());
    let root_idx = build_subtree(&mut points, 0, &mut nodes)
        .ok_or_integrity("median build produced an empty tree")?;

    let mut out = Vec::new();
    let mut counter = 0usize;
    let mut root_records = Vec::new();
    emit_records(
        root_idx,
        &nodes,
        true,
        capacity,
        &mut out,
        &mut counter,
        &mut root_records,
    );
    out.insert(
        0,
        TreeSegment {
            name: "root".to_string(),
            root: nodes[root_idx].code,
            nodes: root_records,
        },
    );
    Ok(out)
}

fn build_subtree(
    points: &mut [(u32, f64, f64)],
    depth: usize,
    nodes: &mut Vec<BuiltNode>,
) -> Option<usize> {
    if points.is_empty() {
        return None;
    }
    let lng_axis = depth % 2 == 0;
    points.sort_unstable_by(|a, b| {
        let (ka, kb) = if lng_axis { (a.2, b.2) } else { (a.1, b.1) };
        ka.partial_cmp(&kb)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    let mid = points.len() / 2;
    let (code, lat, lng) = points[mid];
    let (left_half, rest) = points.split_at_mut(mid);
    let right_half = &mut rest[1..];

    let left = build_subtree(left_half, depth + 1, nodes);
    let right = build_subtree(right_half, depth + 1, nodes);
    let size = 1
        + left.map_or(0, |i| nodes[i].size)
        + right.map_or(0, |i| nodes[i].size);
    nodes.push(BuiltNode {
        code,
        lat,
        lng,
        left,
        right,
        size,
    });
    Some(nodes.len() - 1)
}

fn emit_records(
    idx: usize,
    nodes: &[BuiltNode],
    cut_allowed: bool,
    capacity: usize,
    out: &mut Vec<TreeSegment>,
    counter: &mut usize,
    records: &mut Vec<NodeRecord>,
) {
    let node = &nodes[idx];
    records.push(NodeRecord {
        code: node.code,
        lat: Some(node.lat),
        lng: Some(node.lng),
        left: node.left.map(|i| nodes[i].code),
        right: node.right.map(|i| nodes[i].code),
        segment: None,
    });
    for child in [node.left, node.right].into_iter().flatten() {
        let child_node = &nodes[child];
        if cut_allowed && child_node.size <= capacity {
            *counter += 1;
            let name = format!("seg{}", counter);
            records.push(NodeRecord {
                code: child_node.code,
                lat: None,
                lng: None,
                left: None,
                right: None,
                segment: Some(name.clone()),
            });
            let mut child_records = Vec::new();
            emit_records(
                child,
                nodes,
                false,
                capacity,
                out,
                counter,
                &mut child_records,
            );
            out.push(TreeSegment {
                name,
                root: child_node.code,
                nodes: child_records,
            });
        } else {
            emit_records(child, nodes, cut_allowed, capacity, out, counter, records);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
