//! Picks the next collection window from a source's tracking state.

use chrono::{DateTime, Utc};
use harvest_core::{CollectionWindow, TargetSpan, TrackingState, WindowSpan};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkDirection {
    /// Walk into history, one span before the earliest covered boundary.
    #[default]
    Backward,
    /// Catch up towards `now`, one span after the latest covered boundary.
    Forward,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Window(CollectionWindow),
    AlreadyCovered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeriodResolver {
    direction: WalkDirection,
    floor: Option<DateTime<Utc>>,
}

impl PeriodResolver {
    pub fn new(direction: WalkDirection, floor: Option<DateTime<Utc>>) -> Self {
        Self { direction, floor }
    }

    pub fn direction(&self) -> WalkDirection {
        self.direction
    }

    /// Order of preference: cold start ending at `now`, then the most recent gap between
    /// covered windows, then one span further in the configured direction.
    pub fn resolve(
        &self,
        source_id: &str,
        tracking: &TrackingState,
        span: TargetSpan,
        now: DateTime<Utc>,
    ) -> Resolution {
        if tracking.covered_windows.is_empty() {
            return self.bounded(source_id, tracking, span.step_back(now), now);
        }

        if let Some(gap) = tracking.gaps().last() {
            let start = gap.start.max(span.step_back(gap.end));
            return self.bounded(source_id, tracking, start, gap.end);
        }

        match self.direction {
            WalkDirection::Backward => match tracking.earliest_boundary() {
                Some(earliest) => self.bounded(source_id, tracking, span.step_back(earliest), earliest),
                None => Resolution::AlreadyCovered,
            },
            WalkDirection::Forward => match tracking.latest_boundary() {
                Some(latest) => {
                    let end = span.step_forward(latest).min(now);
                    self.bounded(source_id, tracking, latest, end)
                }
                None => Resolution::AlreadyCovered,
            },
        }
    }

    fn bounded(
        &self,
        source_id: &str,
        tracking: &TrackingState,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Resolution {
        let start = match self.floor {
            Some(floor) => start.max(floor),
            None => start,
        };
        if start >= end {
            return Resolution::AlreadyCovered;
        }
        let candidate = WindowSpan { start, end };
        if tracking.covered_windows.iter().any(|w| w.intersects(&candidate)) {
            return Resolution::AlreadyCovered;
        }
        Resolution::Window(CollectionWindow::new(source_id, start, end))
    }
}
