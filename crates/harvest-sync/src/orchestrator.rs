//! One incremental harvest run per call: resolve, fetch, extract, dedup, persist.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use harvest_adapters::PageContext;
use harvest_core::{CanonicalEntity, CollectionWindow, TargetSpan};
use harvest_storage::{
    ArtifactDocument, BatchStats, ClientIdentity, FetchOutcome, FetchScheduler, FetchedPage,
    IdentityRotator, PersistenceError, PersistenceWriter, SourceLease, Transport,
};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{HarvestConfig, HarvestSource};
use crate::dedup::{AdmissionCounts, DedupStore};
use crate::period::Resolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    WindowResolved,
    Fetching,
    Extracting,
    Deduping,
    Persisted,
    Failed,
}

impl RunPhase {
    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Idle, WindowResolved)
                | (WindowResolved, Fetching)
                | (Fetching, Extracting)
                | (Fetching, Failed)
                | (Extracting, Deduping)
                | (Deduping, Persisted)
                // dry runs stop before persistence
                | (Deduping, Idle)
                | (Persisted, Idle)
        )
    }
}

/// Tracks the phase of a single run and rejects transitions outside the lifecycle.
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    phase: RunPhase,
    trail: Vec<RunPhase>,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self {
            phase: RunPhase::Idle,
            trail: vec![RunPhase::Idle],
        }
    }
}

impl RunStateMachine {
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn trail(&self) -> &[RunPhase] {
        &self.trail
    }

    pub fn advance(&mut self, next: RunPhase) -> Result<(), HarvestError> {
        if !self.phase.can_transition_to(next) {
            return Err(HarvestError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        debug!(from = ?self.phase, to = ?next, "run phase");
        self.phase = next;
        self.trail.push(next);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("run request targets {requested} but source is {configured}")]
    SourceMismatch { requested: String, configured: String },
    #[error("invalid collection window {0}")]
    InvalidWindow(String),
    #[error(
        "source {source_id} unreachable: {failed} of {attempted} fetches failed (threshold {threshold})"
    )]
    SourceUnreachable {
        source_id: String,
        failed: usize,
        attempted: usize,
        threshold: f64,
    },
    #[error("illegal run phase transition {from:?} -> {to:?}")]
    InvalidTransition { from: RunPhase, to: RunPhase },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl HarvestError {
    pub fn is_lease_held(&self) -> bool {
        matches!(self, HarvestError::Persistence(PersistenceError::LeaseHeld { .. }))
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source_id: String,
    pub target_span: TargetSpan,
    pub concurrency_limit: usize,
    pub dry_run: bool,
    /// Collect exactly this window instead of resolving one; coverage is still recorded.
    pub window: Option<CollectionWindow>,
}

impl RunRequest {
    pub fn for_source(source: &HarvestSource) -> Self {
        Self {
            source_id: source.source_id.clone(),
            target_span: source.target_span,
            concurrency_limit: source.fetch.concurrency_limit,
            dry_run: false,
            window: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_window(mut self, window: CollectionWindow) -> Self {
        self.window = Some(window);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Persisted,
    DryRun,
    AlreadyCovered,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source_id: String,
    pub outcome: RunOutcome,
    pub window: Option<CollectionWindow>,
    /// False when cancellation left tasks unissued; the window then stays uncovered.
    pub window_complete: bool,
    pub phases: Vec<RunPhase>,
    pub tasks_planned: usize,
    pub fetched: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub blocked_signals: usize,
    pub records_extracted: usize,
    pub extraction_errors: usize,
    pub admissions: AdmissionCounts,
    pub entities_written: usize,
    pub artifact_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip)]
    pub entities: Vec<CanonicalEntity>,
}

impl RunReport {
    fn new(run_id: Uuid, source_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            source_id: source_id.to_string(),
            outcome: RunOutcome::AlreadyCovered,
            window: None,
            window_complete: false,
            phases: Vec::new(),
            tasks_planned: 0,
            fetched: 0,
            failed: 0,
            cancelled: 0,
            blocked_signals: 0,
            records_extracted: 0,
            extraction_errors: 0,
            admissions: AdmissionCounts::default(),
            entities_written: 0,
            artifact_path: None,
            started_at,
            finished_at: started_at,
            entities: Vec::new(),
        }
    }

    fn absorb_stats(&mut self, stats: &BatchStats) {
        self.fetched = stats.fetched;
        self.failed = stats.failed;
        self.cancelled = stats.cancelled;
        self.blocked_signals = stats.blocked_signals;
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub failure_threshold: f64,
    pub identities: Vec<ClientIdentity>,
    pub rotate_every: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            identities: Vec::new(),
            rotate_every: 20,
        }
    }
}

impl From<&HarvestConfig> for OrchestratorConfig {
    fn from(config: &HarvestConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            identities: config.identities(),
            rotate_every: config.rotate_every,
        }
    }
}

/// Drives runs for any number of sources. Runs share only the transport and the
/// persistence writer; every run gets its own rotator, scheduler and dedup store.
pub struct HarvestOrchestrator<T: Transport, P: PersistenceWriter> {
    config: OrchestratorConfig,
    transport: Arc<T>,
    persistence: Arc<P>,
}

impl<T: Transport, P: PersistenceWriter> HarvestOrchestrator<T, P> {
    pub fn new(config: OrchestratorConfig, transport: Arc<T>, persistence: Arc<P>) -> Self {
        Self {
            config,
            transport,
            persistence,
        }
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn run(
        &self,
        source: &HarvestSource,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunReport, HarvestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "harvest_run",
            %run_id,
            source_id = %request.source_id,
            dry_run = request.dry_run
        );
        self.run_inner(run_id, source, request, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        source: &HarvestSource,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunReport, HarvestError> {
        if request.source_id != source.source_id {
            return Err(HarvestError::SourceMismatch {
                requested: request.source_id.clone(),
                configured: source.source_id.clone(),
            });
        }
        let started_at = Utc::now();
        let mut report = RunReport::new(run_id, &source.source_id, started_at);
        let mut machine = RunStateMachine::default();

        let _lease = if request.dry_run {
            SourceLease::unguarded()
        } else {
            self.persistence.acquire_lease(&source.source_id).await?
        };
        let tracking = self.persistence.load_tracking(&source.source_id).await?;

        let window = match &request.window {
            Some(window) => {
                if window.source_id != source.source_id || window.start >= window.end {
                    return Err(HarvestError::InvalidWindow(window.to_string()));
                }
                window.clone()
            }
            None => match source
                .resolver
                .resolve(&source.source_id, &tracking, request.target_span, started_at)
            {
                Resolution::Window(window) => window,
                Resolution::AlreadyCovered => {
                    info!("history already covered; nothing to collect");
                    report.phases = machine.trail().to_vec();
                    report.finished_at = Utc::now();
                    return Ok(report);
                }
            },
        };
        machine.advance(RunPhase::WindowResolved)?;
        info!(window = %window, "collection window resolved");
        report.window = Some(window.clone());

        let tasks = source.planner.plan(&window);
        report.tasks_planned = tasks.len();
        machine.advance(RunPhase::Fetching)?;

        let mut fetch_config = source.fetch.clone();
        fetch_config.concurrency_limit = request.concurrency_limit.max(1);
        let rotator = Arc::new(IdentityRotator::new(
            self.config.identities.clone(),
            self.config.rotate_every,
        ));
        let scheduler = FetchScheduler::new(Arc::clone(&self.transport), rotator, fetch_config);
        let mut extracted = PageYield::default();
        let stats = scheduler
            .run_batch_with(tasks, cancel, |outcome| match outcome {
                FetchOutcome::Fetched(page) => extracted.absorb(source, page),
                FetchOutcome::Failed { task, error } => {
                    warn!(url = %task.url, ordinal = task.ordinal, error = %error, "fetch task failed");
                }
                FetchOutcome::Cancelled { .. } => {}
            })
            .await;
        report.absorb_stats(&stats);
        info!(
            fetched = stats.fetched,
            failed = stats.failed,
            cancelled = stats.cancelled,
            blocked = stats.blocked_signals,
            concurrency = stats.final_concurrency,
            "fetch phase finished"
        );

        if stats.failure_rate() > self.config.failure_threshold {
            machine.advance(RunPhase::Failed)?;
            warn!(
                failure_rate = stats.failure_rate(),
                threshold = self.config.failure_threshold,
                "failure threshold exceeded; tracking state left untouched"
            );
            return Err(HarvestError::SourceUnreachable {
                source_id: source.source_id.clone(),
                failed: stats.failed,
                attempted: stats.attempted(),
                threshold: self.config.failure_threshold,
            });
        }
        report.window_complete = stats.cancelled == 0;

        // Pages were extracted as their fetches completed; only ordering remains.
        machine.advance(RunPhase::Extracting)?;
        let PageYield {
            entities: mut canonical,
            records,
            errors,
        } = extracted;
        report.records_extracted = records;
        report.extraction_errors = errors;
        canonical.sort_by_key(|entity| entity.ordinal);

        machine.advance(RunPhase::Deduping)?;
        let mut store = DedupStore::new();
        for entity in canonical {
            store.admit(entity, &tracking);
        }
        report.admissions = store.counts();
        let entities = store.into_entities();
        report.entities_written = entities.len();
        info!(
            records = report.records_extracted,
            new = report.admissions.new,
            seen = report.admissions.duplicate_of_seen,
            within_run = report.admissions.duplicate_within_run,
            merged = report.admissions.merged,
            "dedup finished"
        );

        if request.dry_run {
            machine.advance(RunPhase::Idle)?;
            report.outcome = RunOutcome::DryRun;
            report.phases = machine.trail().to_vec();
            report.entities = entities;
            report.finished_at = Utc::now();
            return Ok(report);
        }

        let document = ArtifactDocument::new(run_id, window.clone(), report.window_complete, entities);
        let stored = match self.persistence.write_artifact(&document).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(error = %err, "artifact write failed; tracking state not committed");
                return Err(err.into());
            }
        };

        let mut next = tracking;
        if report.window_complete {
            next.record_window(&window);
        } else {
            info!("run cancelled mid-window; window left uncovered");
        }
        next.absorb(&document.entities);
        next.last_run_at = Some(Utc::now());
        if let Err(err) = self.persistence.commit_tracking(&next).await {
            warn!(error = %err, artifact = %stored.relative_path.display(), "tracking commit failed");
            return Err(err.into());
        }

        machine.advance(RunPhase::Persisted)?;
        info!(
            artifact = %stored.relative_path.display(),
            entities = stored.entity_count,
            bytes = stored.byte_size,
            "run persisted"
        );
        machine.advance(RunPhase::Idle)?;

        report.outcome = RunOutcome::Persisted;
        report.artifact_path = Some(stored.absolute_path);
        report.phases = machine.trail().to_vec();
        report.entities = document.entities;
        report.finished_at = Utc::now();
        Ok(report)
    }
}

/// Canonical entities taken from pages as their fetches complete, so raw bodies are
/// dropped page by page instead of being held until the batch ends.
#[derive(Default)]
struct PageYield {
    entities: Vec<CanonicalEntity>,
    records: usize,
    errors: usize,
}

impl PageYield {
    fn absorb(&mut self, source: &HarvestSource, page: FetchedPage) {
        let ctx = PageContext {
            source_id: &source.source_id,
            origin_url: &page.final_url,
            fetched_at: page.fetched_at,
            task_ordinal: page.task.ordinal,
        };
        match source.adapter.extract(&ctx, &page.body) {
            Ok(records) => {
                if records.is_empty() {
                    debug!(url = %page.final_url, "page yielded no records");
                }
                self.records += records.len();
                self.entities
                    .extend(records.iter().map(|r| source.canonicalizer.canonicalize(r)));
            }
            Err(err) => {
                self.errors += 1;
                warn!(url = %page.final_url, error = %err, "extraction failed; page skipped");
            }
        }
    }
}
