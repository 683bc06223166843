//! Core domain model for incremental harvesting: windows, tasks, records, entities and
//! per-source tracking state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod canonical;

pub use canonical::{Canonicalizer, CanonicalizerConfig};

pub const CRATE_NAME: &str = "harvest-core";

/// Current version of the persisted tracking snapshot.
pub const TRACKING_SCHEMA_VERSION: u32 = 1;

/// Field name → JSON value, ordered by key.
pub type FieldMap = BTreeMap<String, JsonValue>;

/// Half-open `[start, end)` collection interval issued to a single run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionWindow {
    pub source_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CollectionWindow {
    pub fn new(source_id: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            start,
            end,
        }
    }

    pub fn span(&self) -> WindowSpan {
        WindowSpan {
            start: self.start,
            end: self.end,
        }
    }

    pub fn intersects(&self, other: &WindowSpan) -> bool {
        self.span().intersects(other)
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for CollectionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{} .. {})",
            self.source_id,
            self.start.to_rfc3339(),
            self.end.to_rfc3339()
        )
    }
}

/// A covered interval as stored in tracking state (source id is implied by the owner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowSpan {
    pub fn intersects(&self, other: &WindowSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn touches(&self, other: &WindowSpan) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Length of one collection step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetSpan {
    Days(u32),
    Weeks(u32),
    Months(u32),
}

impl TargetSpan {
    pub fn step_back(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            TargetSpan::Days(n) => from - Duration::days(i64::from(n)),
            TargetSpan::Weeks(n) => from - Duration::weeks(i64::from(n)),
            TargetSpan::Months(n) => from
                .checked_sub_months(Months::new(n))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn step_forward(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            TargetSpan::Days(n) => from + Duration::days(i64::from(n)),
            TargetSpan::Weeks(n) => from + Duration::weeks(i64::from(n)),
            TargetSpan::Months(n) => from
                .checked_add_months(Months::new(n))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid target span {0:?}: expected <n>d, <n>w or <n>m with n > 0")]
pub struct ParseSpanError(String);

impl FromStr for TargetSpan {
    type Err = ParseSpanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().to_ascii_lowercase();
        let err = || ParseSpanError(s.to_string());
        let unit = trimmed.chars().last().ok_or_else(err)?;
        let count: u32 = trimmed[..trimmed.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| err())?;
        if count == 0 {
            return Err(err());
        }
        match unit {
            'd' => Ok(TargetSpan::Days(count)),
            'w' => Ok(TargetSpan::Weeks(count)),
            'm' => Ok(TargetSpan::Months(count)),
            _ => Err(err()),
        }
    }
}

impl TryFrom<String> for TargetSpan {
    type Error = ParseSpanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetSpan> for String {
    fn from(value: TargetSpan) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TargetSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSpan::Days(n) => write!(f, "{n}d"),
            TargetSpan::Weeks(n) => write!(f, "{n}w"),
            TargetSpan::Months(n) => write!(f, "{n}m"),
        }
    }
}

/// A single page/resource to fetch within a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTask {
    pub url: String,
    pub source_id: String,
    pub attempt: u32,
    pub priority: i32,
    /// Planner-assigned position; used for stable tie-breaking, never for arrival order.
    pub ordinal: usize,
}

impl FetchTask {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>, ordinal: usize) -> Self {
        Self {
            url: url.into(),
            source_id: source_id.into(),
            attempt: 0,
            priority: 0,
            ordinal,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// `(task ordinal, record index within the fetched page)`.
pub type RecordOrdinal = (usize, usize);

/// Adapter output for one record of one fetched page. Lives for a single run only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub payload: FieldMap,
    pub origin_url: String,
    #[serde(default)]
    pub ordinal: RecordOrdinal,
}

/// Deduplicated, normalized representation of a real-world record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub entity_key: String,
    pub normalized_fields: FieldMap,
    pub content_hash: String,
    pub origin_urls: BTreeSet<String>,
    pub first_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub merged_from: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
    #[serde(skip)]
    pub ordinal: RecordOrdinal,
}

impl CanonicalEntity {
    /// Number of normalized fields carrying a non-empty value.
    pub fn completeness(&self) -> usize {
        self.normalized_fields
            .values()
            .filter(|v| !is_empty_value(v))
            .count()
    }
}

pub fn is_empty_value(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::Bool(_) | JsonValue::Number(_) => false,
    }
}

/// Durable per-source bookkeeping of what has already been collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub source_id: String,
    #[serde(default)]
    pub covered_windows: Vec<WindowSpan>,
    #[serde(default)]
    pub seen_hashes: BTreeSet<String>,
    #[serde(default)]
    pub seen_entity_keys: BTreeSet<String>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Fields written by newer versions; preserved verbatim on rewrite.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

fn default_schema_version() -> u32 {
    TRACKING_SCHEMA_VERSION
}

impl TrackingState {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            schema_version: TRACKING_SCHEMA_VERSION,
            source_id: source_id.into(),
            covered_windows: Vec::new(),
            seen_hashes: BTreeSet::new(),
            seen_entity_keys: BTreeSet::new(),
            last_run_at: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn has_seen(&self, entity: &CanonicalEntity) -> bool {
        self.seen_entity_keys.contains(&entity.entity_key)
            || self.seen_hashes.contains(&entity.content_hash)
    }

    /// Inserts a window, coalescing it with every overlapping or adjacent covered span so the
    /// list stays ordered and non-overlapping.
    pub fn record_window(&mut self, window: &CollectionWindow) {
        let mut merged = window.span();
        let mut kept = Vec::with_capacity(self.covered_windows.len() + 1);
        for span in self.covered_windows.drain(..) {
            if span.touches(&merged) {
                merged.start = merged.start.min(span.start);
                merged.end = merged.end.max(span.end);
            } else {
                kept.push(span);
            }
        }
        kept.push(merged);
        kept.sort_by_key(|s| s.start);
        self.covered_windows = kept;
    }

    /// Unions the identities of persisted entities into the seen sets. Append-only.
    pub fn absorb<'a>(&mut self, entities: impl IntoIterator<Item = &'a CanonicalEntity>) {
        for entity in entities {
            self.seen_entity_keys.insert(entity.entity_key.clone());
            self.seen_hashes.insert(entity.content_hash.clone());
            for absorbed in &entity.merged_from {
                self.seen_entity_keys.insert(absorbed.clone());
            }
        }
    }

    pub fn earliest_boundary(&self) -> Option<DateTime<Utc>> {
        self.covered_windows.first().map(|s| s.start)
    }

    pub fn latest_boundary(&self) -> Option<DateTime<Utc>> {
        self.covered_windows.iter().map(|s| s.end).max()
    }

    /// Uncovered spans between consecutive covered windows, oldest first.
    pub fn gaps(&self) -> Vec<WindowSpan> {
        self.covered_windows
            .windows(2)
            .filter(|pair| pair[0].end < pair[1].start)
            .map(|pair| WindowSpan {
                start: pair[0].end,
                end: pair[1].start,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn target_span_parses_and_displays() {
        assert_eq!("30d".parse::<TargetSpan>(), Ok(TargetSpan::Days(30)));
        assert_eq!(" 2W ".parse::<TargetSpan>(), Ok(TargetSpan::Weeks(2)));
        assert_eq!("1m".parse::<TargetSpan>(), Ok(TargetSpan::Months(1)));
        assert!("0d".parse::<TargetSpan>().is_err());
        assert!("month".parse::<TargetSpan>().is_err());
        assert!("".parse::<TargetSpan>().is_err());
        assert_eq!(TargetSpan::Months(3).to_string(), "3m");
    }

    #[test]
    fn month_steps_are_calendar_aware() {
        let span = TargetSpan::Months(1);
        assert_eq!(span.step_back(at(2026, 3, 31)), at(2026, 2, 28));
        assert_eq!(span.step_forward(at(2026, 1, 15)), at(2026, 2, 15));
    }

    #[test]
    fn record_window_coalesces_adjacent_and_keeps_order() {
        let mut state = TrackingState::new("bills");
        state.record_window(&CollectionWindow::new("bills", at(2026, 5, 1), at(2026, 6, 1)));
        state.record_window(&CollectionWindow::new("bills", at(2026, 2, 1), at(2026, 3, 1)));
        assert_eq!(state.covered_windows.len(), 2);
        assert_eq!(state.gaps().len(), 1);

        state.record_window(&CollectionWindow::new("bills", at(2026, 4, 1), at(2026, 5, 1)));
        assert_eq!(state.covered_windows.len(), 2);
        assert_eq!(state.covered_windows[1].start, at(2026, 4, 1));
        assert_eq!(state.gaps()[0].start, at(2026, 3, 1));
        assert_eq!(state.gaps()[0].end, at(2026, 4, 1));

        state.record_window(&CollectionWindow::new("bills", at(2026, 3, 1), at(2026, 4, 1)));
        assert_eq!(state.covered_windows.len(), 1);
        assert!(state.gaps().is_empty());
        assert_eq!(state.earliest_boundary(), Some(at(2026, 2, 1)));
        assert_eq!(state.latest_boundary(), Some(at(2026, 6, 1)));
    }

    #[test]
    fn tracking_snapshot_tolerates_and_preserves_unknown_fields() {
        let raw = r#"{
            "source_id": "speeches",
            "covered_windows": [],
            "seen_hashes": ["abc"],
            "seen_entity_keys": [],
            "last_run_at": null,
            "operator_note": "migrated from v0"
        }"#;
        let state: TrackingState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.schema_version, TRACKING_SCHEMA_VERSION);
        assert!(state.seen_hashes.contains("abc"));
        assert_eq!(
            state.extra.get("operator_note"),
            Some(&JsonValue::String("migrated from v0".into()))
        );

        let rewritten = serde_json::to_value(&state).unwrap();
        assert_eq!(rewritten["operator_note"], "migrated from v0");
    }

    #[test]
    fn window_intersection_is_half_open() {
        let a = CollectionWindow::new("s", at(2026, 1, 1), at(2026, 2, 1));
        let touching = WindowSpan {
            start: at(2026, 2, 1),
            end: at(2026, 3, 1),
        };
        let overlapping = WindowSpan {
            start: at(2026, 1, 20),
            end: at(2026, 2, 10),
        };
        assert!(!a.intersects(&touching));
        assert!(a.intersects(&overlapping));
        assert!(a.contains(at(2026, 1, 1)));
        assert!(!a.contains(at(2026, 2, 1)));
    }
}
