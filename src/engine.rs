//! Stateful coordinator tying the pieces together.
//!
//! `LocatorEngine` owns the spatial index, the search orchestration, and
//! the optional navigator, and wires the two external signals — the
//! location stream and the line selection — into them. It is a plain value
//! the caller owns; consumers that want change notifications inject an
//! event channel at construction.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use log::info;

use crate::dataset::DatasetProvider;
use crate::error::{LocatorError, OptionExt, Result};
use crate::kdtree::StationKdTree;
use crate::navigator::{LineNavigator, PredictionResult};
use crate::search::{NearStation, SearchEvent, StationSearcher};
use crate::{Line, LocationFix, PredictionConfig, SearchConfig};

/// Application-facing facade over search and navigation.
pub struct LocatorEngine {
    provider: Arc<dyn DatasetProvider>,
    searcher: StationSearcher,
    navigator: Mutex<Option<Arc<LineNavigator>>>,
    search_k: Mutex<usize>,
    prediction_config: PredictionConfig,
}

impl LocatorEngine {
    /// Create an engine over an installed dataset. `root_segment` names the
    /// k-d tree's root segment in storage.
    pub fn new(
        provider: Arc<dyn DatasetProvider>,
        root_segment: &str,
        search_config: SearchConfig,
        prediction_config: PredictionConfig,
    ) -> Result<Self> {
        Self::build(provider, root_segment, search_config, prediction_config, None)
    }

    /// Like [`LocatorEngine::new`], publishing search events over `events`.
    pub fn with_events(
        provider: Arc<dyn DatasetProvider>,
        root_segment: &str,
        search_config: SearchConfig,
        prediction_config: PredictionConfig,
        events: Sender<SearchEvent>,
    ) -> Result<Self> {
        Self::build(
            provider,
            root_segment,
            search_config,
            prediction_config,
            Some(events),
        )
    }

    fn build(
        provider: Arc<dyn DatasetProvider>,
        root_segment: &str,
        search_config: SearchConfig,
        prediction_config: PredictionConfig,
        events: Option<Sender<SearchEvent>>,
    ) -> Result<Self> {
        if search_config.k < 1 {
            return Err(LocatorError::InvalidParameter {
                message: format!("search k must be >= 1, got {}", search_config.k),
            });
        }
        if prediction_config.max_prediction < 1 {
            return Err(LocatorError::InvalidParameter {
                message: format!(
                    "max_prediction must be >= 1, got {}",
                    prediction_config.max_prediction
                ),
            });
        }

        let tree = Arc::new(StationKdTree::new(provider.clone(), root_segment));
        let searcher = match events {
            Some(sender) => StationSearcher::with_events(
                tree,
                provider.clone(),
                search_config.mode,
                sender,
            ),
            None => StationSearcher::new(tree, provider.clone(), search_config.mode),
        };

        Ok(Self {
            provider,
            searcher,
            navigator: Mutex::new(None),
            search_k: Mutex::new(search_config.k),
            prediction_config,
        })
    }

    /// Feed one fix from the location stream: runs the nearest-station
    /// search and, when a line is selected, the prediction update with the
    /// freshly detected station.
    pub fn update_location(&self, fix: LocationFix) -> Result<()> {
        let k = *self.search_k.lock().unwrap();
        self.searcher.update(fix, k)?;

        let navigator = self.navigator.lock().unwrap().clone();
        if let Some(navigator) = navigator {
            let current = self.searcher.detected_station().map(|n| n.station);
            navigator.update(&fix, current)?;
        }
        Ok(())
    }

    /// Change the line selection. `None` deselects; the previous
    /// navigator's cursors are released promptly either way. Selecting a
    /// line without track geometry fails with `MissingGeometry` and leaves
    /// no line selected.
    pub fn select_line(&self, code: Option<u32>) -> Result<()> {
        let mut slot = self.navigator.lock().unwrap();
        if let Some(previous) = slot.take() {
            previous.release();
        }
        let Some(code) = code else {
            info!("[LocatorEngine] Line deselected");
            return Ok(());
        };

        let line = self
            .provider
            .lines_by_codes(&[code])?
            .into_iter()
            .next()
            .ok_or_integrity(&format!("line {} not found in dataset", code))?;
        let navigator = Arc::new(LineNavigator::new(
            line,
            self.provider.clone(),
            self.prediction_config,
        )?);
        info!(
            "[LocatorEngine] Line '{}' selected",
            navigator.line().name
        );
        *slot = Some(navigator);
        Ok(())
    }

    /// Adjust the nearest-station count for subsequent fixes.
    pub fn set_search_k(&self, k: usize) -> Result<()> {
        if k < 1 {
            return Err(LocatorError::InvalidParameter {
                message: format!("search k must be >= 1, got {}", k),
            });
        }
        *self.search_k.lock().unwrap() = k;
        Ok(())
    }

    pub fn selected_line(&self) -> Option<Line> {
        self.navigator
            .lock()
            .unwrap()
            .as_ref()
            .map(|n| n.line().clone())
    }

    pub fn detected_station(&self) -> Option<NearStation> {
        self.searcher.detected_station()
    }

    pub fn latest_results(&self) -> Vec<NearStation> {
        self.searcher.latest_results()
    }

    pub fn latest_prediction(&self) -> Option<PredictionResult> {
        self.navigator
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|n| n.latest())
    }

    /// Stop the session: releases navigation and clears search state.
    pub fn release(&self) {
        if let Some(navigator) = self.navigator.lock().unwrap().take() {
            navigator.release();
        }
        self.searcher.reset();
        info!("[LocatorEngine] Session released");
    }
}

// ============================================================================
// Tests
// ============================================================================
