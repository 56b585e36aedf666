//! Track geometry: encoded polyline documents, the edge graph, and
//! nearest-point projection.
//!
//! A line's geometry document is JSON of the shape
//!
//! ```json
//! { "segments": [ { "start": "t1", "end": "t2",
//!                   "points": "<encoded polyline>",
//!                   "stations": [ { "code": 1130101, "distance": 812.5 } ] } ] }
//! ```
//!
//! where `points` is a Google encoded polyline (precision 5) and `distance`
//! is cumulative meters from the chunk start. Each chunk decodes into a
//! chain of straight edges. Interior junction tags are synthesized with a
//! `#` prefix (declared tags must not start with `#`); the declared tags
//! bind chunk ends so chunks chain and branch into a connectivity graph.

use std::cmp::Ordering;
use std::collections::HashMap;

use geo::Coord;
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::Deserialize;

use crate::error::{LocatorError, Result};
use crate::geo_utils::haversine_distance;
use crate::GpsPoint;

/// Slack allowed when a station mark sits at the very end of a chunk,
/// absorbing rounding from the polyline encoding.
const MARK_TOLERANCE: f64 = 0.5;

// ============================================================================
// Document Schema
// ============================================================================

#[derive(Debug, Deserialize)]
struct TrackDoc {
    segments: Vec<ChunkDoc>,
}

#[derive(Debug, Deserialize)]
struct ChunkDoc {
    start: String,
    end: String,
    points: String,
    #[serde(default)]
    stations: Vec<MarkDoc>,
}

#[derive(Debug, Deserialize)]
struct MarkDoc {
    code: u32,
    distance: f64,
}

// ============================================================================
// Geometry Types
// ============================================================================

/// A station pinned to an edge, `offset` meters from the edge's `a` end.
#[derive(Debug, Clone, PartialEq)]
pub struct StationMark {
    pub code: u32,
    pub offset: f64,
}

/// A straight edge between two track-graph junction points.
#[derive(Debug, Clone)]
pub struct TrackEdge {
    pub a: Coord<f64>,
    pub b: Coord<f64>,
    pub a_tag: String,
    pub b_tag: String,
    /// Geodesic edge length in meters.
    pub length: f64,
    /// Stations on this edge, ascending by offset.
    pub stations: Vec<StationMark>,
}

impl TrackEdge {
    /// Interpolated position at normalized parameter `t`.
    pub fn point_at(&self, t: f64) -> GpsPoint {
        GpsPoint::new(
            self.a.y + t * (self.b.y - self.a.y),
            self.a.x + t * (self.b.x - self.a.x),
        )
    }

    /// Meters from the `a` end to the position at `t`.
    pub fn distance_from_start(&self, t: f64) -> f64 {
        t * self.length
    }

    /// Meters from the position at `t` to the `b` end.
    pub fn distance_to_end(&self, t: f64) -> f64 {
        (1.0 - t) * self.length
    }
}

/// Nearest-point projection of a fix onto one edge.
///
/// `t` is clamped to [0, 1]; `on_edge` records whether the unclamped
/// projection fell within the segment bounds. Callers handle cursors that
/// fall off an edge by jumping to the adjoining edge at that junction.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    /// Closest point on the edge.
    pub point: GpsPoint,
    pub t: f64,
    pub on_edge: bool,
    /// Geodesic meters from the fix to the closest point.
    pub distance: f64,
}

// ============================================================================
// Edge Spatial Index
// ============================================================================

#[derive(Debug, Clone)]
struct EdgeHandle {
    idx: usize,
    a: [f64; 2],
    b: [f64; 2],
}

impl RTreeObject for EdgeHandle {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.a, self.b)
    }
}

impl PointDistance for EdgeHandle {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        // Squared planar distance from point to segment; track edges are
        // locally short so degree-space comparisons order correctly.
        let ab = [self.b[0] - self.a[0], self.b[1] - self.a[1]];
        let ap = [point[0] - self.a[0], point[1] - self.a[1]];

        let ab_ab = ab[0] * ab[0] + ab[1] * ab[1];
        if ab_ab == 0.0 {
            return ap[0] * ap[0] + ap[1] * ap[1];
        }

        let t = ((ab[0] * ap[0] + ab[1] * ap[1]) / ab_ab).clamp(0.0, 1.0);
        let dx = point[0] - (self.a[0] + t * ab[0]);
        let dy = point[1] - (self.a[1] + t * ab[1]);
        dx * dx + dy * dy
    }
}

// ============================================================================
// Track
// ============================================================================

/// Parsed track geometry for one line: the edge list, the junction graph,
/// and a spatial index for nearest-edge lookups.
#[derive(Debug)]
pub struct Track {
    edges: Vec<TrackEdge>,
    junctions: HashMap<String, Vec<usize>>,
    index: RTree<EdgeHandle>,
}

impl Track {
    /// Parse a geometry document into a track graph.
    pub fn parse(doc: &str) -> Result<Self> {
        let doc: TrackDoc =
            serde_json::from_str(doc).map_err(|e| LocatorError::MalformedGeometry {
                message: format!("geometry document: {}", e),
            })?;
        if doc.segments.is_empty() {
            return Err(LocatorError::MalformedGeometry {
                message: "geometry document has no segments".to_string(),
            });
        }

        let mut edges: Vec<TrackEdge> = Vec::new();
        for (ci, chunk) in doc.segments.into_iter().enumerate() {
            if chunk.start.starts_with('#') || chunk.end.starts_with('#') {
                return Err(LocatorError::MalformedGeometry {
                    message: format!("chunk {}: declared tags must not start with '#'", ci),
                });
            }
            let line = polyline::decode_polyline(&chunk.points, 5).map_err(|e| {
                LocatorError::MalformedGeometry {
                    message: format!("chunk {}: {}", ci, e),
                }
            })?;

            // Consecutive duplicate coordinates would produce zero-length
            // edges; drop them up front.
            let mut coords: Vec<Coord<f64>> = Vec::with_capacity(line.0.len());
            for c in line.0 {
                if coords.last() != Some(&c) {
                    coords.push(c);
                }
            }
            if coords.len() < 2 {
                return Err(LocatorError::MalformedGeometry {
                    message: format!("chunk {} has fewer than two distinct points", ci),
                });
            }

            let mut cumulative = Vec::with_capacity(coords.len());
            cumulative.push(0.0);
            for i in 1..coords.len() {
                let prev = GpsPoint::new(coords[i - 1].y, coords[i - 1].x);
                let curr = GpsPoint::new(coords[i].y, coords[i].x);
                cumulative.push(cumulative[i - 1] + haversine_distance(&prev, &curr));
            }
            let total = *cumulative.last().unwrap_or(&0.0);

            let base = edges.len();
            let count = coords.len() - 1;
            for i in 0..count {
                let a_tag = if i == 0 {
                    chunk.start.clone()
                } else {
                    interior_tag(ci, i)
                };
                let b_tag = if i == count - 1 {
                    chunk.end.clone()
                } else {
                    interior_tag(ci, i + 1)
                };
                edges.push(TrackEdge {
                    a: coords[i],
                    b: coords[i + 1],
                    a_tag,
                    b_tag,
                    length: cumulative[i + 1] - cumulative[i],
                    stations: Vec::new(),
                });
            }

            let mut marks = chunk.stations;
            marks.sort_by(|a, b| {
                a.distance
                    .partial_cmp(&b.distance)
                    .unwrap_or(Ordering::Equal)
            });
            for mark in marks {
                if !mark.distance.is_finite()
                    || mark.distance < 0.0
                    || mark.distance > total + MARK_TOLERANCE
                {
                    return Err(LocatorError::DataIntegrity {
                        message: format!(
                            "station {} at {:.1}m outside chunk {} of length {:.1}m",
                            mark.code, mark.distance, ci, total
                        ),
                    });
                }
                let i = cumulative[1..]
                    .iter()
                    .position(|c| *c >= mark.distance)
                    .unwrap_or(count - 1);
                let edge = &mut edges[base + i];
                let offset = (mark.distance - cumulative[i]).clamp(0.0, edge.length);
                edge.stations.push(StationMark {
                    code: mark.code,
                    offset,
                });
            }
        }

        let mut junctions: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, edge) in edges.iter().enumerate() {
            junctions.entry(edge.a_tag.clone()).or_default().push(idx);
            junctions.entry(edge.b_tag.clone()).or_default().push(idx);
        }

        let handles: Vec<EdgeHandle> = edges
            .iter()
            .enumerate()
            .map(|(idx, e)| EdgeHandle {
                idx,
                a: [e.a.x, e.a.y],
                b: [e.b.x, e.b.y],
            })
            .collect();
        let index = RTree::bulk_load(handles);

        Ok(Self {
            edges,
            junctions,
            index,
        })
    }

    pub fn edges(&self) -> &[TrackEdge] {
        &self.edges
    }

    pub fn edge(&self, idx: usize) -> &TrackEdge {
        &self.edges[idx]
    }

    /// Edges incident to `tag`, excluding `exclude`.
    pub fn adjacent(&self, tag: &str, exclude: usize) -> Vec<usize> {
        self.junctions
            .get(tag)
            .map(|ids| ids.iter().copied().filter(|&i| i != exclude).collect())
            .unwrap_or_default()
    }

    /// Index of the edge whose nearest point is closest to `point`.
    pub fn nearest_edge(&self, point: &GpsPoint) -> Option<usize> {
        self.index
            .nearest_neighbor(&[point.longitude, point.latitude])
            .map(|h| h.idx)
    }

    /// Project a point onto one edge using the planar dot-product test.
    pub fn project(edge: &TrackEdge, point: &GpsPoint) -> Projection {
        let px = point.longitude - edge.a.x;
        let py = point.latitude - edge.a.y;
        let bx = edge.b.x - edge.a.x;
        let by = edge.b.y - edge.a.y;

        let denom = bx * bx + by * by;
        let raw = if denom == 0.0 {
            0.0
        } else {
            (px * bx + py * by) / denom
        };
        let on_edge = (0.0..=1.0).contains(&raw);
        let t = raw.clamp(0.0, 1.0);
        let closest = edge.point_at(t);

        Projection {
            point: closest,
            t,
            on_edge,
            distance: haversine_distance(point, &closest),
        }
    }
}

fn interior_tag(chunk: usize, point: usize) -> String {
    format!("#{}:{}", chunk, point)
}

// ============================================================================
// Tests
// ============================================================================
