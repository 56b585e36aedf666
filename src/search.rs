//! Search orchestration: turns the raw location stream into a debounced,
//! de-duplicated sequence of nearest-station results with a stable
//! "detected station" signal.
//!
//! Concurrency contract: updates never overlap. A fix arriving while a
//! previous computation is running parks in a single pending slot (latest
//! wins) and is picked up by whichever caller holds the processing lock, so
//! every accepted fix is processed exactly once in arrival order while
//! rapid bursts collapse to the latest pending one.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetProvider;
use crate::error::{LocatorError, Result};
use crate::geo_utils::DistanceMode;
use crate::kdtree::StationKdTree;
use crate::{Line, LocationFix, Station};

// ============================================================================
// Results & Events
// ============================================================================

/// One ranked nearest-station entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearStation {
    pub station: Station,
    /// Distance from the fix, in the searcher's distance-mode unit.
    pub distance: f64,
    /// Timestamp of the fix that produced this entry (unix ms).
    pub detected_at: i64,
    /// Lines the station belongs to.
    pub lines: Vec<Line>,
}

/// Events published over the injected channel.
#[derive(Debug, Clone)]
pub enum SearchEvent {
    /// The top-ranked station identity changed.
    DetectedStationChanged(NearStation),
    /// A fresh ranked list was published.
    ResultsUpdated(Vec<NearStation>),
}

// ============================================================================
// Searcher
// ============================================================================

struct SearcherState {
    /// Bit patterns of the last accepted (lat, lng, k).
    last_key: Option<(u64, u64, usize)>,
    detected: Option<NearStation>,
    results: Vec<NearStation>,
    events: Option<Sender<SearchEvent>>,
}

struct PendingUpdate {
    fix: LocationFix,
    k: usize,
}

/// Orchestrates spatial queries over the location stream.
pub struct StationSearcher {
    tree: Arc<StationKdTree>,
    provider: Arc<dyn DatasetProvider>,
    mode: DistanceMode,
    state: Mutex<SearcherState>,
    pending: Mutex<Option<PendingUpdate>>,
}

impl StationSearcher {
    pub fn new(
        tree: Arc<StationKdTree>,
        provider: Arc<dyn DatasetProvider>,
        mode: DistanceMode,
    ) -> Self {
        Self::build(tree, provider, mode, None)
    }

    /// Like [`StationSearcher::new`], publishing events over `events`.
    pub fn with_events(
        tree: Arc<StationKdTree>,
        provider: Arc<dyn DatasetProvider>,
        mode: DistanceMode,
        events: Sender<SearchEvent>,
    ) -> Self {
        Self::build(tree, provider, mode, Some(events))
    }

    fn build(
        tree: Arc<StationKdTree>,
        provider: Arc<dyn DatasetProvider>,
        mode: DistanceMode,
        events: Option<Sender<SearchEvent>>,
    ) -> Self {
        Self {
            tree,
            provider,
            mode,
            state: Mutex::new(SearcherState {
                last_key: None,
                detected: None,
                results: Vec::new(),
                events,
            }),
            pending: Mutex::new(None),
        }
    }

    /// Accept one location fix with the configured nearest-station count.
    ///
    /// Returns once this fix is either processed or parked for the caller
    /// currently holding the processing lock.
    pub fn update(&self, fix: LocationFix, k: usize) -> Result<()> {
        if k < 1 {
            return Err(LocatorError::InvalidParameter {
                message: format!("k must be >= 1, got {}", k),
            });
        }
        debug_assert!(fix.is_valid(), "location fix out of range: {:?}", fix);
        if !fix.is_valid() {
            warn!("[StationSearcher] Ignoring out-of-range fix");
            return Ok(());
        }

        *self.pending.lock().unwrap() = Some(PendingUpdate { fix, k });
        self.drain()
    }

    /// The stable detected-station signal.
    pub fn detected_station(&self) -> Option<NearStation> {
        self.state.lock().unwrap().detected.clone()
    }

    /// The latest ranked nearest-station list.
    pub fn latest_results(&self) -> Vec<NearStation> {
        self.state.lock().unwrap().results.clone()
    }

    /// Forget all session state (detected station, results, dedup key).
    pub fn reset(&self) {
        self.pending.lock().unwrap().take();
        let mut state = self.state.lock().unwrap();
        state.last_key = None;
        state.detected = None;
        state.results.clear();
        info!("[StationSearcher] Session state cleared");
    }

    /// Drain the pending slot under the processing lock. The re-check after
    /// releasing the lock catches a fix parked between our last take and
    /// the release, so no accepted fix is left stranded.
    fn drain(&self) -> Result<()> {
        loop {
            {
                let mut state = match self.state.try_lock() {
                    Ok(guard) => guard,
                    // Another caller holds the lock and will pick the
                    // pending fix up in its own drain loop.
                    Err(_) => return Ok(()),
                };
                loop {
                    let job = self.pending.lock().unwrap().take();
                    match job {
                        Some(job) => self.process(&mut state, job)?,
                        None => break,
                    }
                }
            }
            if self.pending.lock().unwrap().is_none() {
                return Ok(());
            }
        }
    }

    fn process(&self, state: &mut SearcherState, job: PendingUpdate) -> Result<()> {
        let point = job.fix.point();
        let key = (
            point.latitude.to_bits(),
            point.longitude.to_bits(),
            job.k,
        );
        if state.last_key == Some(key) {
            debug!("[StationSearcher] Identical fix and k, skipping recomputation");
            return Ok(());
        }

        let search = self.tree.search(point, job.k, 0.0, self.mode)?;

        // Resolve line memberships for all ranked stations in one batch.
        let mut line_codes: Vec<u32> = Vec::new();
        for measured in &search.stations {
            for code in &measured.station.lines {
                if !line_codes.contains(code) {
                    line_codes.push(*code);
                }
            }
        }
        let fetched = self.provider.lines_by_codes(&line_codes)?;
        let by_code: HashMap<u32, Line> = fetched.into_iter().map(|l| (l.code, l)).collect();

        let results: Vec<NearStation> = search
            .stations
            .iter()
            .map(|measured| NearStation {
                station: measured.station.clone(),
                distance: measured.distance,
                detected_at: job.fix.timestamp,
                lines: measured
                    .station
                    .lines
                    .iter()
                    .filter_map(|code| by_code.get(code).cloned())
                    .collect(),
            })
            .collect();

        if let Some(top) = results.first() {
            let unchanged = state
                .detected
                .as_ref()
                .map_or(false, |d| d.station.code == top.station.code);
            if unchanged {
                // Same identity: keep the detected station fixed while its
                // distance and timestamp refresh.
                if let Some(detected) = state.detected.as_mut() {
                    detected.distance = top.distance;
                    detected.detected_at = top.detected_at;
                    detected.lines = top.lines.clone();
                }
            } else {
                info!(
                    "[StationSearcher] Station changed to '{}' ({})",
                    top.station.name, top.station.code
                );
                state.detected = Some(top.clone());
                if let Some(sender) = &state.events {
                    if sender
                        .send(SearchEvent::DetectedStationChanged(top.clone()))
                        .is_err()
                    {
                        debug!("[StationSearcher] Event receiver dropped");
                    }
                }
            }
        }

        state.results = results;
        state.last_key = Some(key);
        if let Some(sender) = &state.events {
            let _ = sender.send(SearchEvent::ResultsUpdated(state.results.clone()));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MemoryDataset;
    use crate::kdtree::build_tree_segments;
    use crate::StationRegistration;
    use std::sync::mpsc;

    fn make_line(code: u32, name: &str, station_codes: &[u32]) -> Line {
        Line {
            code,
            id: String::new(),
            name: name.to_string(),
            name_kana: None,
            station_size: station_codes.len() as u32,
            station_list: station_codes
                .iter()
                .map(|c| StationRegistration {
                    code: *c,
                    numbering: None,
                })
                .collect(),
            symbol: None,
            color: None,
            closed: false,
            polyline: None,
        }
    }

    fn fixture() -> (Arc<MemoryDataset>, Arc<StationKdTree>) {
        let mut a = Station::new(1, "A", 35.0, 139.0);
        a.lines = vec![100];
        let mut b = Station::new(2, "B", 35.1, 139.1);
        b.lines = vec![100, 101];
        let mut c = Station::new(3, "C", 35.2, 139.2);
        c.lines = vec![101];
        let d = Station::new(4, "D", 36.0, 140.0);
        let e = Station::new(5, "E", 36.1, 140.1);
        let stations = vec![a, b, c, d, e];

        let lines = vec![make_line(100, "First", &[1, 2]), make_line(101, "Second", &[2, 3])];
        let segments = build_tree_segments(&stations, 2).unwrap();
        let dataset =
            Arc::new(MemoryDataset::from_parts(stations, lines, segments).unwrap());
        let tree = Arc::new(StationKdTree::new(
            dataset.clone() as Arc<dyn DatasetProvider>,
            "root",
        ));
        (dataset, tree)
    }

    fn fix(lat: f64, lng: f64, t: i64) -> LocationFix {
        LocationFix::new(lat, lng, t, t)
    }

    #[test]
    fn test_ranked_results_with_line_membership() {
        let (dataset, tree) = fixture();
        let searcher = StationSearcher::new(tree, dataset, DistanceMode::Geodesic);

        searcher.update(fix(35.001, 139.001, 1_000), 3).unwrap();
        let results = searcher.latest_results();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].station.code, 1);
        assert!(results[0].distance < results[1].distance);
        assert_eq!(results[0].lines.len(), 1);
        assert_eq!(results[0].lines[0].code, 100);

        // B belongs to both lines.
        let b = results.iter().find(|n| n.station.code == 2).unwrap();
        let mut line_codes: Vec<u32> = b.lines.iter().map(|l| l.code).collect();
        line_codes.sort_unstable();
        assert_eq!(line_codes, vec![100, 101]);
    }

    #[test]
    fn test_detected_station_stability() {
        let (dataset, tree) = fixture();
        let (sender, receiver) = mpsc::channel();
        let searcher =
            StationSearcher::with_events(tree, dataset, DistanceMode::Geodesic, sender);

        searcher.update(fix(35.001, 139.001, 1_000), 2).unwrap();
        let first = searcher.detected_station().unwrap();
        assert_eq!(first.station.code, 1);
        assert_eq!(first.detected_at, 1_000);

        // A nearby but distinct fix: same top station, refreshed fields,
        // unchanged identity.
        searcher.update(fix(35.002, 139.001, 2_000), 2).unwrap();
        let second = searcher.detected_station().unwrap();
        assert_eq!(second.station.code, 1);
        assert_eq!(second.detected_at, 2_000);
        assert_ne!(second.distance, first.distance);

        // Move next to C: identity changes.
        searcher.update(fix(35.199, 139.199, 3_000), 2).unwrap();
        let third = searcher.detected_station().unwrap();
        assert_eq!(third.station.code, 3);

        let changes: Vec<u32> = receiver
            .try_iter()
            .filter_map(|event| match event {
                SearchEvent::DetectedStationChanged(n) => Some(n.station.code),
                _ => None,
            })
            .collect();
        assert_eq!(changes, vec![1, 3]);
    }

    #[test]
    fn test_identical_fix_skips_recomputation() {
        let (dataset, tree) = fixture();
        let (sender, receiver) = mpsc::channel();
        let searcher =
            StationSearcher::with_events(tree, dataset, DistanceMode::Geodesic, sender);

        let same = fix(35.001, 139.001, 1_000);
        searcher.update(same, 2).unwrap();
        let emitted_first: usize = receiver.try_iter().count();
        assert!(emitted_first > 0);

        // Bit-identical coordinates and k: no recomputation, no events.
        searcher.update(fix(35.001, 139.001, 5_000), 2).unwrap();
        assert_eq!(receiver.try_iter().count(), 0);

        // A different k forces a fresh query.
        searcher.update(fix(35.001, 139.001, 6_000), 3).unwrap();
        assert!(receiver.try_iter().count() > 0);
        assert_eq!(searcher.latest_results().len(), 3);
    }

    #[test]
    fn test_invalid_k_rejected() {
        let (dataset, tree) = fixture();
        let searcher = StationSearcher::new(tree, dataset, DistanceMode::Geodesic);
        assert!(matches!(
            searcher.update(fix(35.0, 139.0, 1_000), 0),
            Err(LocatorError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_reset_clears_session() {
        let (dataset, tree) = fixture();
        let searcher = StationSearcher::new(tree, dataset, DistanceMode::Geodesic);

        searcher.update(fix(35.001, 139.001, 1_000), 2).unwrap();
        assert!(searcher.detected_station().is_some());

        searcher.reset();
        assert!(searcher.detected_station().is_none());
        assert!(searcher.latest_results().is_empty());

        // The dedup key is also gone: the same fix computes again.
        searcher.update(fix(35.001, 139.001, 2_000), 2).unwrap();
        assert!(searcher.detected_station().is_some());
    }

    #[test]
    fn test_concurrent_updates_all_settle() {
        let (dataset, tree) = fixture();
        let searcher = Arc::new(StationSearcher::new(
            tree,
            dataset,
            DistanceMode::Geodesic,
        ));

        let mut handles = Vec::new();
        for i in 0..4i64 {
            let searcher = searcher.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..25i64 {
                    let step = (i * 25 + j) as f64 * 1e-4;
                    searcher
                        .update(fix(35.0 + step, 139.0, i * 1_000 + j), 2)
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Every thread returned, so nothing is left parked and a complete
        // result is published.
        assert!(searcher.pending.lock().unwrap().is_none());
        assert_eq!(searcher.latest_results().len(), 2);
        assert!(searcher.detected_station().is_some());
    }
}
