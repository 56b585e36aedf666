//! Polyline cursor navigator: predicts upcoming stations along a selected
//! line from a stream of location fixes.
//!
//! The navigator moves through three phases: `Uninitialized` (no cursors
//! yet) → `Tracking` (at least one cursor, producing a prediction on each
//! accepted update) → `Released` (stopped, all cursors discarded). A cursor
//! is one hypothesis of the user's position on the track graph; ambiguous
//! junctions spawn extra cursors rather than guessing, and a distance-ratio
//! filter prunes hypotheses that fall behind.
//!
//! All state mutation happens under one mutex held for a full update cycle,
//! so concurrent updates are fully serialized in arrival order and the
//! published result always reflects a complete cycle. An update that was
//! queued behind a release observes the `Released` phase and no-ops.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetProvider;
use crate::error::{LocatorError, OptionExt, Result};
use crate::geo_utils::haversine_distance;
use crate::track::Track;
use crate::{GpsPoint, Line, LocationFix, PredictionConfig, Station};

/// Cap on junction hops a single cursor may take in one update.
const MAX_EDGE_HOPS: usize = 4;
/// Projected movement (meters) required before a direction is inferred.
const DIRECTION_EPSILON: f64 = 1.0;
/// Tolerance when deciding whether a station mark is still ahead.
const MARK_EPSILON: f64 = 1e-6;

// ============================================================================
// State
// ============================================================================

/// Direction of travel along an edge. `Forward` runs a → b.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// One hypothesis of the user's position on the track graph.
#[derive(Debug, Clone)]
struct Cursor {
    edge: usize,
    t: f64,
    direction: Option<Direction>,
    /// Nearest-point distance of the latest projection, meters.
    distance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Tracking,
    Released,
}

struct NavState {
    phase: Phase,
    cursors: Vec<Cursor>,
    last_fix: Option<GpsPoint>,
    result: Option<PredictionResult>,
}

// ============================================================================
// Results
// ============================================================================

/// One predicted upcoming station with its remaining distance in meters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationPrediction {
    pub station: Station,
    pub distance: f64,
}

/// The navigator's output for one accepted fix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    /// The station the search orchestration currently detects, if any.
    pub current: Option<Station>,
    /// Upcoming stations ascending by distance.
    pub predictions: Vec<StationPrediction>,
}

// ============================================================================
// Navigator
// ============================================================================

/// Prediction engine for one selected line.
pub struct LineNavigator {
    provider: Arc<dyn DatasetProvider>,
    line: Line,
    track: Track,
    config: PredictionConfig,
    state: Mutex<NavState>,
}

impl std::fmt::Debug for LineNavigator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineNavigator")
            .field("line", &self.line)
            .field("track", &self.track)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LineNavigator {
    /// Build a navigator for a line. Fails with `MissingGeometry` when the
    /// line carries no track geometry — a navigator must not exist for such
    /// a line.
    pub fn new(
        line: Line,
        provider: Arc<dyn DatasetProvider>,
        config: PredictionConfig,
    ) -> Result<Self> {
        if config.max_prediction < 1 {
            return Err(LocatorError::InvalidParameter {
                message: format!(
                    "max_prediction must be >= 1, got {}",
                    config.max_prediction
                ),
            });
        }
        let doc = line
            .polyline
            .as_deref()
            .ok_or_else(|| LocatorError::MissingGeometry {
                line: line.name.clone(),
            })?;
        let track = Track::parse(doc)?;
        info!(
            "[LineNavigator] Ready for line '{}' ({} edges)",
            line.name,
            track.edges().len()
        );
        Ok(Self {
            provider,
            line,
            track,
            config,
            state: Mutex::new(NavState {
                phase: Phase::Uninitialized,
                cursors: Vec::new(),
                last_fix: None,
                result: None,
            }),
        })
    }

    /// Process one location fix together with the currently detected
    /// station, returning the refreshed prediction (or `None` once
    /// released).
    pub fn update(
        &self,
        fix: &LocationFix,
        current: Option<Station>,
    ) -> Result<Option<PredictionResult>> {
        debug_assert!(fix.is_valid(), "location fix out of range: {:?}", fix);
        if !fix.is_valid() {
            warn!("[LineNavigator] Ignoring out-of-range fix");
            return Ok(self.latest());
        }

        let mut state = self.state.lock().unwrap();
        if state.phase == Phase::Released {
            return Ok(None);
        }
        let point = fix.point();

        if let Some(last) = state.last_fix {
            if haversine_distance(&last, &point) < self.config.jitter_threshold {
                debug!("[LineNavigator] Fix within jitter threshold, skipping");
                return Ok(state.result.clone());
            }
        }

        if state.phase == Phase::Uninitialized {
            let edge = self
                .track
                .nearest_edge(&point)
                .ok_or_integrity("track has no edges")?;
            let proj = Track::project(self.track.edge(edge), &point);
            state.cursors.push(Cursor {
                edge,
                t: proj.t,
                direction: None,
                distance: proj.distance,
            });
            state.phase = Phase::Tracking;
            debug!(
                "[LineNavigator] Tracking started on edge {} (t={:.3})",
                edge, proj.t
            );
        } else {
            let mut advanced: Vec<Cursor> = Vec::new();
            for cursor in state.cursors.drain(..) {
                self.advance_cursor(cursor, &point, &mut advanced);
            }

            // Two hypotheses on the same edge are redundant; keep the closer.
            let mut best: HashMap<usize, Cursor> = HashMap::new();
            for cursor in advanced {
                match best.get(&cursor.edge) {
                    Some(existing) if existing.distance <= cursor.distance => {}
                    _ => {
                        best.insert(cursor.edge, cursor);
                    }
                }
            }
            let mut cursors: Vec<Cursor> = best.into_values().collect();

            if cursors.len() > 1 {
                let min = cursors
                    .iter()
                    .map(|c| c.distance)
                    .fold(f64::INFINITY, f64::min);
                let before = cursors.len();
                cursors.retain(|c| c.distance <= min * self.config.prune_ratio);
                if cursors.len() < before {
                    debug!(
                        "[LineNavigator] Pruned {} cursor(s) beyond {:.0}x ratio",
                        before - cursors.len(),
                        self.config.prune_ratio
                    );
                }
            }
            cursors.sort_by_key(|c| c.edge);
            state.cursors = cursors;
        }

        state.last_fix = Some(point);

        // Merge proposals from all cursors, keeping the minimum distance
        // for stations reachable via more than one hypothesis.
        let mut merged: HashMap<u32, f64> = HashMap::new();
        for cursor in &state.cursors {
            for (code, distance) in self.proposals(cursor) {
                merged
                    .entry(code)
                    .and_modify(|d| {
                        if distance < *d {
                            *d = distance;
                        }
                    })
                    .or_insert(distance);
            }
        }
        let mut ranked: Vec<(u32, f64)> = merged.into_iter().collect();
        ranked.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        ranked.truncate(self.config.max_prediction);

        let predictions = self.resolve_predictions(&ranked)?;
        let result = PredictionResult {
            current,
            predictions,
        };
        state.result = Some(result.clone());
        Ok(Some(result))
    }

    /// Stop navigation and discard all cursors. Any update already queued
    /// behind this call observes the released phase and no-ops.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.phase = Phase::Released;
        state.cursors.clear();
        state.last_fix = None;
        state.result = None;
        info!("[LineNavigator] Released line '{}'", self.line.name);
    }

    /// The most recently published prediction, if tracking.
    pub fn latest(&self) -> Option<PredictionResult> {
        self.state.lock().unwrap().result.clone()
    }

    pub fn line(&self) -> &Line {
        &self.line
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Released
    }

    /// Re-project a cursor onto the new fix, hopping junctions when the
    /// projection falls off the current edge and spawning one cursor per
    /// adjoining edge at ambiguous junctions.
    fn advance_cursor(&self, cursor: Cursor, point: &GpsPoint, out: &mut Vec<Cursor>) {
        let mut work: Vec<(usize, f64, Option<Direction>, usize)> =
            vec![(cursor.edge, cursor.t, cursor.direction, 0)];

        while let Some((edge_idx, entry_t, mut direction, hops)) = work.pop() {
            let edge = self.track.edge(edge_idx);
            let proj = Track::project(edge, point);

            if proj.on_edge || hops >= MAX_EDGE_HOPS {
                if hops == 0 {
                    let moved = (proj.t - entry_t) * edge.length;
                    if moved.abs() >= DIRECTION_EPSILON {
                        direction = Some(if moved > 0.0 {
                            Direction::Forward
                        } else {
                            Direction::Reverse
                        });
                    }
                }
                out.push(Cursor {
                    edge: edge_idx,
                    t: proj.t,
                    direction,
                    distance: proj.distance,
                });
                continue;
            }

            // Fell off this edge: cross the junction at the clamped end.
            let (tag, exit_direction) = if proj.t >= 1.0 {
                (edge.b_tag.as_str(), Direction::Forward)
            } else {
                (edge.a_tag.as_str(), Direction::Reverse)
            };
            let adjacent = self.track.adjacent(tag, edge_idx);
            if adjacent.is_empty() {
                // End of the line; the cursor pins to the terminal.
                out.push(Cursor {
                    edge: edge_idx,
                    t: proj.t,
                    direction: Some(exit_direction),
                    distance: proj.distance,
                });
                continue;
            }
            if adjacent.len() > 1 {
                debug!(
                    "[LineNavigator] Spawning {} cursors at junction '{}'",
                    adjacent.len(),
                    tag
                );
            }
            for next in adjacent {
                let next_edge = self.track.edge(next);
                let (entry, dir) = if next_edge.a_tag == tag {
                    (0.0, Direction::Forward)
                } else {
                    (1.0, Direction::Reverse)
                };
                work.push((next, entry, Some(dir), hops + 1));
            }
        }
    }

    /// Upcoming-station proposals for one cursor. While the direction is
    /// still unknown both directions contribute; the distance-sorted merge
    /// arbitrates.
    fn proposals(&self, cursor: &Cursor) -> Vec<(u32, f64)> {
        match cursor.direction {
            Some(direction) => self.scan(cursor.edge, cursor.t, direction),
            None => {
                let mut both = self.scan(cursor.edge, cursor.t, Direction::Forward);
                both.extend(self.scan(cursor.edge, cursor.t, Direction::Reverse));
                both
            }
        }
    }

    /// Walk the segment chain from a cursor position, collecting up to
    /// `max_prediction` station marks with cumulative distances. The walk
    /// follows only unique continuations: an ambiguous branch ends the
    /// chain (branch exploration is the advancement machinery's job).
    fn scan(&self, edge_idx: usize, t: f64, direction: Direction) -> Vec<(u32, f64)> {
        let max = self.config.max_prediction;
        let mut found: Vec<(u32, f64)> = Vec::new();
        let mut visited: HashSet<usize> = HashSet::new();
        visited.insert(edge_idx);

        let edge = self.track.edge(edge_idx);
        let position = edge.distance_from_start(t);
        let (mut acc, mut tag) = match direction {
            Direction::Forward => {
                for mark in &edge.stations {
                    if mark.offset >= position - MARK_EPSILON {
                        found.push((mark.code, (mark.offset - position).max(0.0)));
                    }
                }
                (edge.distance_to_end(t), edge.b_tag.clone())
            }
            Direction::Reverse => {
                for mark in edge.stations.iter().rev() {
                    if mark.offset <= position + MARK_EPSILON {
                        found.push((mark.code, (position - mark.offset).max(0.0)));
                    }
                }
                (position, edge.a_tag.clone())
            }
        };

        let mut current = edge_idx;
        while found.len() < max {
            let next: Vec<usize> = self
                .track
                .adjacent(&tag, current)
                .into_iter()
                .filter(|i| !visited.contains(i))
                .collect();
            if next.len() != 1 {
                break;
            }
            let idx = next[0];
            visited.insert(idx);
            let next_edge = self.track.edge(idx);
            if next_edge.a_tag == tag {
                for mark in &next_edge.stations {
                    found.push((mark.code, acc + mark.offset));
                }
                tag = next_edge.b_tag.clone();
            } else {
                for mark in next_edge.stations.iter().rev() {
                    found.push((mark.code, acc + (next_edge.length - mark.offset)));
                }
                tag = next_edge.a_tag.clone();
            }
            acc += next_edge.length;
            current = idx;
        }
        found.truncate(max);
        found
    }

    /// Resolve predicted codes to station records, preserving rank order
    /// (batch lookups return in key order).
    fn resolve_predictions(&self, ranked: &[(u32, f64)]) -> Result<Vec<StationPrediction>> {
        if ranked.is_empty() {
            return Ok(Vec::new());
        }
        let codes: Vec<u32> = ranked.iter().map(|(code, _)| *code).collect();
        let fetched = self.provider.stations_by_codes(&codes)?;
        let mut by_code: HashMap<u32, Station> =
            fetched.into_iter().map(|s| (s.code, s)).collect();

        let mut out = Vec::with_capacity(ranked.len());
        for (code, distance) in ranked {
            let station = by_code.remove(code).ok_or_integrity(&format!(
                "predicted station {} missing from storage",
                code
            ))?;
            out.push(StationPrediction {
                station,
                distance: *distance,
            });
        }
        Ok(out)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MemoryDataset;
    use crate::StationRegistration;
    use geo::Coord;

    fn encode(points: &[(f64, f64)]) -> String {
        let coords: Vec<Coord<f64>> = points
            .iter()
            .map(|(lat, lng)| Coord { x: *lng, y: *lat })
            .collect();
        polyline::encode_coordinates(coords, 5).unwrap()
    }

    fn make_line(code: u32, name: &str, polyline: Option<String>, codes: &[u32]) -> Line {
        Line {
            code,
            id: String::new(),
            name: name.to_string(),
            name_kana: None,
            station_size: codes.len() as u32,
            station_list: codes
                .iter()
                .map(|c| StationRegistration {
                    code: *c,
                    numbering: None,
                })
                .collect(),
            symbol: None,
            color: None,
            closed: false,
            polyline,
        }
    }

    /// Straight due-north track at lng 139.0 from 35.00 to 35.03 (~3340 m),
    /// stations at 800 m and 2000 m, terminal at 3300 m.
    fn straight_fixture(max_prediction: usize) -> (Arc<MemoryDataset>, LineNavigator) {
        let points = encode(&[
            (35.0, 139.0),
            (35.01, 139.0),
            (35.02, 139.0),
            (35.03, 139.0),
        ]);
        let doc = format!(
            r#"{{"segments":[{{"start":"s","end":"e","points":"{}","stations":[
                {{"code":202,"distance":800.0}},
                {{"code":203,"distance":2000.0}},
                {{"code":204,"distance":3300.0}}
            ]}}]}}"#,
            points
        );
        let stations = vec![
            Station::new(202, "A", 35.0072, 139.0),
            Station::new(203, "B", 35.018, 139.0),
            Station::new(204, "C", 35.0297, 139.0),
        ];
        let line = make_line(900, "Testline", Some(doc), &[202, 203, 204]);
        let dataset =
            Arc::new(MemoryDataset::from_parts(stations, vec![line.clone()], vec![]).unwrap());
        let config = PredictionConfig {
            max_prediction,
            ..PredictionConfig::default()
        };
        let navigator = LineNavigator::new(line, dataset.clone(), config).unwrap();
        (dataset, navigator)
    }

    fn fix(lat: f64, lng: f64, t: i64) -> LocationFix {
        LocationFix::new(lat, lng, t, t)
    }

    #[test]
    fn test_missing_geometry_rejected() {
        let line = make_line(900, "Closedline", None, &[]);
        let dataset = Arc::new(MemoryDataset::from_parts(vec![], vec![], vec![]).unwrap());
        let err = LineNavigator::new(line, dataset, PredictionConfig::default()).unwrap_err();
        assert!(matches!(err, LocatorError::MissingGeometry { .. }));
    }

    #[test]
    fn test_invalid_max_prediction_rejected() {
        let line = make_line(900, "L", Some("{}".to_string()), &[]);
        let dataset = Arc::new(MemoryDataset::from_parts(vec![], vec![], vec![]).unwrap());
        let config = PredictionConfig {
            max_prediction: 0,
            ..PredictionConfig::default()
        };
        let err = LineNavigator::new(line, dataset, config).unwrap_err();
        assert!(matches!(err, LocatorError::InvalidParameter { .. }));
    }

    #[test]
    fn test_first_prediction_from_standstill() {
        let (_, navigator) = straight_fixture(2);

        let result = navigator
            .update(&fix(35.0, 139.0, 1_000), None)
            .unwrap()
            .unwrap();
        assert_eq!(result.predictions.len(), 2);
        assert_eq!(result.predictions[0].station.code, 202);
        assert!((result.predictions[0].distance - 800.0).abs() < 1e-6);
        assert_eq!(result.predictions[1].station.code, 203);
        assert!((result.predictions[1].distance - 2000.0).abs() < 1e-6);
    }

    #[test]
    fn test_advance_shrinks_distances() {
        let (_, navigator) = straight_fixture(3);

        navigator.update(&fix(35.0, 139.0, 1_000), None).unwrap();
        // ~334 m north.
        let result = navigator
            .update(&fix(35.003, 139.0, 2_000), None)
            .unwrap()
            .unwrap();

        assert_eq!(result.predictions[0].station.code, 202);
        let d = result.predictions[0].distance;
        assert!(d > 455.0 && d < 480.0, "got {}", d);

        // Direction is inferred, so the station behind no longer appears
        // once passed.
        let codes: Vec<u32> = result
            .predictions
            .iter()
            .map(|p| p.station.code)
            .collect();
        assert_eq!(codes, vec![202, 203, 204]);
    }

    #[test]
    fn test_reverse_direction() {
        let (_, navigator) = straight_fixture(3);

        navigator.update(&fix(35.02, 139.0, 1_000), None).unwrap();
        // Move ~334 m south from ~1890 m along the chunk.
        let result = navigator
            .update(&fix(35.017, 139.0, 2_000), None)
            .unwrap()
            .unwrap();

        // Heading back toward the 800 m station; the 2000 m station lies
        // behind the direction of travel and must not be proposed.
        let codes: Vec<u32> = result
            .predictions
            .iter()
            .map(|p| p.station.code)
            .collect();
        assert_eq!(codes, vec![202]);
        let d = result.predictions[0].distance;
        assert!(d > 1_000.0 && d < 1_200.0, "got {}", d);
    }

    #[test]
    fn test_jitter_skip_is_noop() {
        let (_, navigator) = straight_fixture(2);

        navigator.update(&fix(35.0, 139.0, 1_000), None).unwrap();
        let before = navigator
            .update(&fix(35.003, 139.0, 2_000), None)
            .unwrap()
            .unwrap();

        // 3 m further: below the 5 m threshold, published result unchanged.
        let after = navigator
            .update(&fix(35.003027, 139.0, 3_000), None)
            .unwrap()
            .unwrap();
        assert_eq!(before.predictions.len(), after.predictions.len());
        for (a, b) in before.predictions.iter().zip(after.predictions.iter()) {
            assert_eq!(a.station.code, b.station.code);
            assert_eq!(a.distance, b.distance);
        }
    }

    #[test]
    fn test_release_makes_updates_noop() {
        let (_, navigator) = straight_fixture(2);
        navigator.update(&fix(35.0, 139.0, 1_000), None).unwrap();
        assert!(navigator.latest().is_some());

        navigator.release();
        assert!(navigator.is_released());
        assert!(navigator.latest().is_none());

        let result = navigator.update(&fix(35.005, 139.0, 2_000), None).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_current_station_is_carried() {
        let (_, navigator) = straight_fixture(2);
        let current = Station::new(202, "A", 35.0072, 139.0);
        let result = navigator
            .update(&fix(35.0, 139.0, 1_000), Some(current))
            .unwrap()
            .unwrap();
        assert_eq!(result.current.as_ref().map(|s| s.code), Some(202));
    }

    #[test]
    fn test_cursor_distance_identity() {
        let (_, navigator) = straight_fixture(3);
        navigator.update(&fix(35.0, 139.0, 1_000), None).unwrap();
        navigator.update(&fix(35.004, 139.0, 2_000), None).unwrap();
        navigator.update(&fix(35.009, 139.0005, 3_000), None).unwrap();

        let state = navigator.state.lock().unwrap();
        assert!(!state.cursors.is_empty());
        for cursor in &state.cursors {
            let edge = navigator.track.edge(cursor.edge);
            let sum = edge.distance_from_start(cursor.t) + edge.distance_to_end(cursor.t);
            assert!((sum - edge.length).abs() < 1e-9);
        }
    }

    /// Trunk with two branches at junction "j": cursors spawn on both, then
    /// the ratio filter keeps only the branch the fixes follow.
    fn branching_fixture() -> (Arc<MemoryDataset>, LineNavigator) {
        let trunk = encode(&[(35.0, 139.0), (35.01, 139.0)]);
        let north = encode(&[(35.01, 139.0), (35.02, 139.0)]);
        let east = encode(&[(35.01, 139.0), (35.02, 139.02)]);
        let doc = format!(
            r#"{{"segments":[
                {{"start":"s","end":"j","points":"{}"}},
                {{"start":"j","end":"n","points":"{}","stations":[{{"code":301,"distance":1000.0}}]}},
                {{"start":"j","end":"x","points":"{}","stations":[{{"code":302,"distance":1500.0}}]}}
            ]}}"#,
            trunk, north, east
        );
        let stations = vec![
            Station::new(301, "North", 35.019, 139.0),
            Station::new(302, "East", 35.017, 139.013),
        ];
        let line = make_line(901, "Branchline", Some(doc), &[301, 302]);
        let dataset =
            Arc::new(MemoryDataset::from_parts(stations, vec![line.clone()], vec![]).unwrap());
        let navigator =
            LineNavigator::new(line, dataset.clone(), PredictionConfig::default()).unwrap();
        (dataset, navigator)
    }

    #[test]
    fn test_branch_spawns_and_prunes_cursors() {
        let (_, navigator) = branching_fixture();

        // Start mid-trunk, then step just past the junction where both
        // branches remain plausible.
        navigator.update(&fix(35.005, 139.0, 1_000), None).unwrap();
        navigator.update(&fix(35.011, 139.001, 2_000), None).unwrap();
        {
            let state = navigator.state.lock().unwrap();
            assert_eq!(state.cursors.len(), 2, "both branches should be live");
        }

        // Commit clearly to the north branch; the east hypothesis exceeds
        // the prune ratio and is discarded.
        navigator.update(&fix(35.015, 139.0, 3_000), None).unwrap();
        {
            let state = navigator.state.lock().unwrap();
            assert_eq!(state.cursors.len(), 1);
            let edge = navigator.track.edge(state.cursors[0].edge);
            assert_eq!(edge.b_tag, "n");
        }
    }

    #[test]
    fn test_junction_transition_keeps_chain_distances() {
        // Two chained chunks; predictions reach across the junction.
        let first = encode(&[(35.0, 139.0), (35.01, 139.0)]);
        let second = encode(&[(35.01, 139.0), (35.02, 139.0)]);
        let doc = format!(
            r#"{{"segments":[
                {{"start":"s","end":"j","points":"{}"}},
                {{"start":"j","end":"e","points":"{}","stations":[{{"code":401,"distance":500.0}}]}}
            ]}}"#,
            first, second
        );
        let stations = vec![Station::new(401, "Beyond", 35.0145, 139.0)];
        let line = make_line(902, "Chainline", Some(doc), &[401]);
        let dataset =
            Arc::new(MemoryDataset::from_parts(stations, vec![line.clone()], vec![]).unwrap());
        let navigator =
            LineNavigator::new(line, dataset, PredictionConfig::default()).unwrap();

        navigator.update(&fix(35.002, 139.0, 1_000), None).unwrap();
        let result = navigator
            .update(&fix(35.006, 139.0, 2_000), None)
            .unwrap()
            .unwrap();

        // Station sits 500 m into the second chunk; remaining trunk is
        // ~445 m, so the prediction lands near 945 m.
        assert_eq!(result.predictions[0].station.code, 401);
        let d = result.predictions[0].distance;
        assert!(d > 900.0 && d < 1_000.0, "got {}", d);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn test_out_of_range_fix_skipped_in_release() {
        let (_, navigator) = straight_fixture(2);
        navigator.update(&fix(35.0, 139.0, 1_000), None).unwrap();
        let before = navigator.latest();
        let result = navigator
            .update(&fix(f64::NAN, 139.0, 2_000), None)
            .unwrap();
        assert_eq!(
            result.map(|r| r.predictions.len()),
            before.map(|r| r.predictions.len())
        );
    }
}
