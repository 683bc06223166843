use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use harvest_core::{CollectionWindow, TrackingState};
use harvest_storage::{
    ArtifactDocument, BackoffPolicy, ClientIdentity, FsPersistence, PersistenceError,
    PersistenceWriter, SchedulerConfig, SourceLease, StoredArtifact, Transport, TransportError,
    TransportResponse,
};
use harvest_sync::{
    parse_source_registry, run_sources, HarvestConfig, HarvestError, HarvestOrchestrator,
    HarvestSource, OrchestratorConfig, RunOutcome, RunPhase, RunRequest,
};
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const REGISTRY: &str = r#"
sources:
  - source_id: bills
    target_span: 1m
    url_templates: ["https://fixture.test/bills?from={start}&to={end}&page={page}"]
    pages: 50
    canonical:
      identity_fields: [number]
    adapter:
      kind: json
      records_pointer: /items
  - source_id: candidates
    target_span: 2w
    url_templates: ["https://fixture.test/candidates?from={start}&page={page}"]
    pages: 3
    canonical:
      identity_fields: [name, region]
      profile_url_field: profile
    adapter:
      kind: json
      records_pointer: /items
  - source_id: archive
    target_span: 1m
    history_floor: 2026-01-01T00:00:00Z
    url_templates: ["https://fixture.test/archive?from={start}"]
    canonical:
      identity_fields: [id]
    adapter:
      kind: json
      records_pointer: /items
"#;

type Handler = dyn Fn(&str) -> Result<TransportResponse, TransportError> + Send + Sync;

struct FixtureTransport {
    handler: Box<Handler>,
    calls: AtomicUsize,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl FixtureTransport {
    fn new(handler: impl Fn(&str) -> Result<TransportResponse, TransportError> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            cancel_after: None,
        }
    }

    fn cancelling_after(mut self, calls: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FixtureTransport {
    async fn get(&self, url: &str, _identity: &ClientIdentity) -> Result<TransportResponse, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.cancel_after {
            if n >= *limit {
                token.cancel();
            }
        }
        (self.handler)(url)
    }
}

fn page_number(url: &str) -> usize {
    url.rsplit("page=")
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(1)
}

fn json_page(url: &str, items: Value) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status: 200,
        final_url: url.to_string(),
        body: serde_json::to_vec(&json!({ "items": items })).unwrap(),
    })
}

fn status(url: &str, code: u16) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status: code,
        final_url: url.to_string(),
        body: Vec::new(),
    })
}

/// Pages 1-40 carry one distinct bill each, 41-45 repeat bills 1-5 with a fresher
/// timestamp, everything above `last_ok` is a 404.
fn bills_handler(last_ok: usize) -> impl Fn(&str) -> Result<TransportResponse, TransportError> + Send + Sync {
    move |url| {
        let page = page_number(url);
        if page > last_ok {
            return status(url, 404);
        }
        let number = if page > 40 { page - 40 } else { page };
        json_page(
            url,
            json!([{
                "number": format!("PL {number}/2026"),
                "title": format!("Bill  {number}"),
                "fetched_at": format!("2026-10-18T00:00:{:02}Z", page % 60),
            }]),
        )
    }
}

fn test_config() -> HarvestConfig {
    HarvestConfig {
        fetch: SchedulerConfig {
            concurrency_limit: 4,
            delay_range: Duration::ZERO..=Duration::ZERO,
            block_cooldown: Duration::from_millis(10),
            backoff: BackoffPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..SchedulerConfig::default()
        },
        ..HarvestConfig::default()
    }
}

fn source(source_id: &str) -> HarvestSource {
    let registry = parse_source_registry(REGISTRY).expect("registry");
    let config = registry
        .sources
        .iter()
        .find(|s| s.source_id == source_id)
        .expect("source in registry");
    HarvestSource::from_config(config, &test_config()).expect("source")
}

fn persistence(root: &Path) -> FsPersistence {
    FsPersistence::new(root.join("artifacts"), root.join("tracking"))
}

fn orchestrator<T: Transport, P: PersistenceWriter>(transport: T, persistence: P) -> HarvestOrchestrator<T, P> {
    HarvestOrchestrator::new(
        OrchestratorConfig {
            failure_threshold: 0.5,
            identities: Vec::new(),
            rotate_every: 5,
        },
        Arc::new(transport),
        Arc::new(persistence),
    )
}

fn august() -> CollectionWindow {
    CollectionWindow::new(
        "bills",
        Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single().unwrap(),
        Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).single().unwrap(),
    )
}

fn artifact_files(root: &Path) -> usize {
    fn count(dir: &Path) -> usize {
        let Ok(entries) = std::fs::read_dir(dir) else { return 0 };
        entries
            .flatten()
            .map(|e| {
                let path = e.path();
                if path.is_dir() {
                    count(&path)
                } else {
                    usize::from(path.extension().is_some_and(|ext| ext == "json"))
                }
            })
            .sum()
    }
    count(&root.join("artifacts"))
}

#[tokio::test]
async fn bills_run_tolerates_partial_failure_and_next_run_walks_back() {
    let dir = tempdir().expect("tempdir");
    let bills = source("bills");
    let harvest = orchestrator(FixtureTransport::new(bills_handler(45)), persistence(dir.path()));
    let cancel = CancellationToken::new();

    let first = harvest
        .run(&bills, &RunRequest::for_source(&bills), &cancel)
        .await
        .expect("first run");
    assert_eq!(first.outcome, RunOutcome::Persisted);
    assert_eq!(first.tasks_planned, 50);
    assert_eq!((first.fetched, first.failed), (45, 5));
    assert_eq!(first.records_extracted, 45);
    assert_eq!(first.admissions.new, 40);
    assert_eq!(first.admissions.duplicate_within_run, 5);
    assert_eq!(first.entities_written, 40);
    assert!(first.window_complete);
    assert_eq!(
        first.phases,
        [
            RunPhase::Idle,
            RunPhase::WindowResolved,
            RunPhase::Fetching,
            RunPhase::Extracting,
            RunPhase::Deduping,
            RunPhase::Persisted,
            RunPhase::Idle,
        ]
    );

    let artifact_path = first.artifact_path.clone().expect("artifact");
    let document: ArtifactDocument =
        serde_json::from_slice(&std::fs::read(&artifact_path).expect("artifact bytes")).expect("artifact json");
    assert_eq!(document.entity_count, 40);
    assert_eq!(document.run_id, first.run_id);
    let repeated = document
        .entities
        .iter()
        .find(|e| e.entity_key == "bills:pl 1/2026")
        .expect("bill 1");
    assert_eq!(repeated.origin_urls.len(), 2);
    assert_eq!(repeated.normalized_fields["title"], json!("Bill 1"));

    let tracking = harvest.persistence().load_tracking("bills").await.expect("tracking");
    let first_window = first.window.clone().expect("window");
    assert_eq!(tracking.covered_windows.len(), 1);
    assert_eq!(tracking.covered_windows[0], first_window.span());
    assert_eq!(tracking.seen_entity_keys.len(), 40);

    let second = harvest
        .run(&bills, &RunRequest::for_source(&bills), &cancel)
        .await
        .expect("second run");
    let second_window = second.window.clone().expect("window");
    assert_eq!(second_window.end, first_window.start);
    assert_eq!(
        second_window.start,
        first_window.start.checked_sub_months(chrono::Months::new(1)).unwrap()
    );
    assert_eq!(second.admissions.duplicate_of_seen, 45);
    assert_eq!(second.entities_written, 0);

    let tracking = harvest.persistence().load_tracking("bills").await.expect("tracking");
    assert_eq!(tracking.covered_windows.len(), 1);
    assert_eq!(tracking.covered_windows[0].start, second_window.start);
    assert_eq!(tracking.covered_windows[0].end, first_window.end);
    assert_eq!(artifact_files(dir.path()), 2);
}

#[tokio::test]
async fn rerunning_the_same_window_adds_nothing() {
    let dir = tempdir().expect("tempdir");
    let bills = source("bills");
    let harvest = orchestrator(FixtureTransport::new(bills_handler(50)), persistence(dir.path()));
    let cancel = CancellationToken::new();
    let request = RunRequest::for_source(&bills).with_window(august());

    let first = harvest.run(&bills, &request, &cancel).await.expect("first");
    assert_eq!(first.entities_written, 40);
    let after_first = harvest.persistence().load_tracking("bills").await.expect("tracking");

    let second = harvest.run(&bills, &request, &cancel).await.expect("second");
    assert_eq!(second.window, Some(august()));
    assert_eq!(second.entities_written, 0);
    assert_eq!(second.admissions.duplicate_of_seen, 50);

    let after_second = harvest.persistence().load_tracking("bills").await.expect("tracking");
    assert_eq!(after_second.covered_windows, after_first.covered_windows);
    assert_eq!(after_second.seen_entity_keys, after_first.seen_entity_keys);
    assert_eq!(after_second.seen_hashes, after_first.seen_hashes);
}

#[tokio::test]
async fn unparseable_pages_are_skipped_and_the_rest_persisted() {
    let dir = tempdir().expect("tempdir");
    let bills = source("bills");
    let good_pages = bills_handler(50);
    let transport = FixtureTransport::new(move |url| match page_number(url) {
        5 | 17 | 33 => Ok(TransportResponse {
            status: 200,
            final_url: url.to_string(),
            body: b"<html><body><h1>Please wait while we check your browser</h1></body></html>".to_vec(),
        }),
        _ => good_pages(url),
    });
    let harvest = orchestrator(transport, persistence(dir.path()));

    let report = harvest
        .run(&bills, &RunRequest::for_source(&bills), &CancellationToken::new())
        .await
        .expect("run");
    assert_eq!(report.outcome, RunOutcome::Persisted);
    assert_eq!(report.phases.last(), Some(&RunPhase::Idle));
    assert!(report.phases.contains(&RunPhase::Persisted));
    assert_eq!((report.fetched, report.failed), (50, 0));
    assert_eq!(report.extraction_errors, 3);
    assert_eq!(report.records_extracted, 47);
    // Bill 5 is still listed on page 45; bills 17 and 33 only appeared on the broken pages.
    assert_eq!(report.entities_written, 38);
    assert_eq!(report.admissions.duplicate_within_run, 9);

    let documents = harvest.persistence().artifacts().load_all("bills").await.expect("artifacts");
    assert_eq!(documents.len(), 1);
    let keys: Vec<&str> = documents[0].entities.iter().map(|e| e.entity_key.as_str()).collect();
    assert_eq!(keys.len(), 38);
    assert!(keys.contains(&"bills:pl 5/2026"));
    assert!(!keys.contains(&"bills:pl 17/2026"));
    assert!(!keys.contains(&"bills:pl 33/2026"));
}

#[tokio::test]
async fn listing_variants_merge_into_one_candidate() {
    let dir = tempdir().expect("tempdir");
    let candidates = source("candidates");
    let transport = FixtureTransport::new(|url| match page_number(url) {
        1 => json_page(
            url,
            json!([
                { "name": "José Araújo", "region": "São Paulo", "profile": "https://example.org/people/7/" },
                { "name": "Maria Lima", "region": "Bahia" }
            ]),
        ),
        2 => json_page(url, json!([{ "name": "JOSE  ARAUJO", "region": "Sao Paulo", "party": "Verde" }])),
        _ => json_page(
            url,
            json!([{
                "name": "José Araújo Silva",
                "region": "São Paulo",
                "profile": "https://example.org/people/7#bio",
                "party": "Verde",
                "age": "51"
            }]),
        ),
    });
    let harvest = orchestrator(transport, persistence(dir.path()));

    let report = harvest
        .run(&candidates, &RunRequest::for_source(&candidates), &CancellationToken::new())
        .await
        .expect("run");
    assert_eq!(report.admissions.new, 2);
    assert_eq!(report.admissions.duplicate_within_run, 1);
    assert_eq!(report.admissions.merged, 1);
    assert_eq!(report.entities.len(), 2);

    let jose = report
        .entities
        .iter()
        .find(|e| e.entity_key == "candidates:jose araujo silva|sao paulo")
        .expect("merged candidate");
    assert_eq!(jose.merged_from, vec!["candidates:jose araujo|sao paulo".to_string()]);
    assert_eq!(jose.origin_urls.len(), 3);
    assert_eq!(jose.profile_url.as_deref(), Some("https://example.org/people/7"));

    let tracking = harvest.persistence().load_tracking("candidates").await.expect("tracking");
    assert!(tracking.seen_entity_keys.contains("candidates:jose araujo|sao paulo"));
    assert!(tracking.seen_entity_keys.contains("candidates:maria lima|bahia"));
    assert_eq!(tracking.seen_entity_keys.len(), 3);
}

#[tokio::test]
async fn exceeding_failure_threshold_leaves_tracking_untouched() {
    let dir = tempdir().expect("tempdir");
    let bills = source("bills");
    let harvest = orchestrator(FixtureTransport::new(bills_handler(20)), persistence(dir.path()));

    let err = harvest
        .run(&bills, &RunRequest::for_source(&bills), &CancellationToken::new())
        .await
        .expect_err("source should be unreachable");
    match err {
        HarvestError::SourceUnreachable { failed, attempted, .. } => {
            assert_eq!((failed, attempted), (30, 50));
        }
        other => panic!("unexpected error {other}"),
    }

    assert_eq!(artifact_files(dir.path()), 0);
    let tracking = harvest.persistence().load_tracking("bills").await.expect("tracking");
    assert_eq!(tracking, TrackingState::new("bills"));
    assert!(!harvest.persistence().tracking().lease_path_for("bills").exists());
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let dir = tempdir().expect("tempdir");
    let bills = source("bills");
    let harvest = orchestrator(FixtureTransport::new(bills_handler(45)), persistence(dir.path()));

    let report = harvest
        .run(&bills, &RunRequest::for_source(&bills).dry_run(true), &CancellationToken::new())
        .await
        .expect("dry run");
    assert_eq!(report.outcome, RunOutcome::DryRun);
    assert_eq!(report.entities.len(), 40);
    assert!(report.artifact_path.is_none());
    assert_eq!(report.phases.last(), Some(&RunPhase::Idle));
    assert!(!report.phases.contains(&RunPhase::Persisted));

    assert_eq!(artifact_files(dir.path()), 0);
    assert!(!harvest.persistence().tracking().path_for("bills").exists());
}

#[tokio::test]
async fn runs_walk_history_without_gaps() {
    let dir = tempdir().expect("tempdir");
    let bills = source("bills");
    let harvest = orchestrator(FixtureTransport::new(bills_handler(50)), persistence(dir.path()));
    let cancel = CancellationToken::new();

    let mut windows = Vec::new();
    for _ in 0..3 {
        let report = harvest
            .run(&bills, &RunRequest::for_source(&bills), &cancel)
            .await
            .expect("run");
        windows.push(report.window.expect("window"));
    }
    assert!(windows.windows(2).all(|pair| pair[1].end == pair[0].start));

    let tracking = harvest.persistence().load_tracking("bills").await.expect("tracking");
    assert_eq!(tracking.covered_windows.len(), 1);
    assert!(tracking.gaps().is_empty());
    assert_eq!(tracking.earliest_boundary(), Some(windows[2].start));
}

/// Delegates to the filesystem but refuses to write artifacts.
struct BrokenArtifacts(FsPersistence);

#[async_trait]
impl PersistenceWriter for BrokenArtifacts {
    async fn acquire_lease(&self, source_id: &str) -> Result<SourceLease, PersistenceError> {
        self.0.acquire_lease(source_id).await
    }

    async fn load_tracking(&self, source_id: &str) -> Result<TrackingState, PersistenceError> {
        self.0.load_tracking(source_id).await
    }

    async fn write_artifact(&self, document: &ArtifactDocument) -> Result<StoredArtifact, PersistenceError> {
        Err(PersistenceError::Io {
            path: self.0.artifacts().root().join(&document.source_id),
            source: std::io::Error::other("disk full"),
        })
    }

    async fn commit_tracking(&self, state: &TrackingState) -> Result<(), PersistenceError> {
        self.0.commit_tracking(state).await
    }

    async fn reset_tracking(&self, source_id: &str) -> Result<bool, PersistenceError> {
        self.0.reset_tracking(source_id).await
    }

    async fn clear_lease(&self, source_id: &str) -> Result<bool, PersistenceError> {
        self.0.clear_lease(source_id).await
    }
}

#[tokio::test]
async fn failed_artifact_write_does_not_commit_tracking() {
    let dir = tempdir().expect("tempdir");
    let bills = source("bills");
    let harvest = orchestrator(
        FixtureTransport::new(bills_handler(50)),
        BrokenArtifacts(persistence(dir.path())),
    );

    let err = harvest
        .run(&bills, &RunRequest::for_source(&bills), &CancellationToken::new())
        .await
        .expect_err("write should fail");
    assert!(matches!(err, HarvestError::Persistence(PersistenceError::Io { .. })));

    let tracking = harvest.persistence().load_tracking("bills").await.expect("tracking");
    assert!(tracking.covered_windows.is_empty());
    assert!(tracking.seen_entity_keys.is_empty());
}

#[tokio::test]
async fn cancelled_run_persists_partial_results_but_not_coverage() {
    let dir = tempdir().expect("tempdir");
    let mut bills = source("bills");
    bills.fetch.concurrency_limit = 1;
    let cancel = CancellationToken::new();
    let transport = FixtureTransport::new(bills_handler(50)).cancelling_after(3, cancel.clone());
    let harvest = orchestrator(transport, persistence(dir.path()));

    let report = harvest
        .run(&bills, &RunRequest::for_source(&bills), &cancel)
        .await
        .expect("cancelled run still persists");
    assert_eq!(report.outcome, RunOutcome::Persisted);
    assert!(!report.window_complete);
    assert!(report.cancelled > 0);
    assert!(report.fetched >= 1 && report.fetched <= 3);
    assert_eq!(report.entities_written, report.fetched);

    let document: ArtifactDocument = serde_json::from_slice(
        &std::fs::read(report.artifact_path.as_ref().expect("artifact")).expect("bytes"),
    )
    .expect("json");
    assert!(!document.window_complete);

    let tracking = harvest.persistence().load_tracking("bills").await.expect("tracking");
    assert!(tracking.covered_windows.is_empty());
    assert_eq!(tracking.seen_entity_keys.len(), report.entities_written);

    let rebuilt = harvest.persistence().rebuild_tracking("bills").await.expect("rebuild");
    assert!(rebuilt.covered_windows.is_empty());
}

#[tokio::test]
async fn held_lease_rejects_a_second_run() {
    let dir = tempdir().expect("tempdir");
    let bills = source("bills");
    let transport = FixtureTransport::new(bills_handler(50));
    let harvest = orchestrator(transport, persistence(dir.path()));

    let _lease = harvest.persistence().acquire_lease("bills").await.expect("lease");
    let err = harvest
        .run(&bills, &RunRequest::for_source(&bills), &CancellationToken::new())
        .await
        .expect_err("lease is held");
    assert!(err.is_lease_held());

    let dry = harvest
        .run(&bills, &RunRequest::for_source(&bills).dry_run(true), &CancellationToken::new())
        .await
        .expect("dry runs take no lease");
    assert_eq!(dry.outcome, RunOutcome::DryRun);
}

#[tokio::test]
async fn floor_reached_means_already_covered() {
    let dir = tempdir().expect("tempdir");
    let archive = source("archive");
    let transport = FixtureTransport::new(|url| json_page(url, json!([{ "id": "1" }])));
    let harvest = orchestrator(transport, persistence(dir.path()));

    let mut tracking = TrackingState::new("archive");
    tracking.record_window(&CollectionWindow::new(
        "archive",
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap(),
        Utc::now() + chrono::Duration::days(1),
    ));
    harvest.persistence().commit_tracking(&tracking).await.expect("seed tracking");

    let report = harvest
        .run(&archive, &RunRequest::for_source(&archive), &CancellationToken::new())
        .await
        .expect("run");
    assert_eq!(report.outcome, RunOutcome::AlreadyCovered);
    assert!(report.window.is_none());
    assert_eq!(report.phases, [RunPhase::Idle]);
    assert_eq!(artifact_files(dir.path()), 0);
}

#[tokio::test]
async fn window_override_must_match_the_source() {
    let dir = tempdir().expect("tempdir");
    let candidates = source("candidates");
    let transport = FixtureTransport::new(|url| status(url, 500));
    let harvest = orchestrator(transport, persistence(dir.path()));

    let err = harvest
        .run(
            &candidates,
            &RunRequest::for_source(&candidates).with_window(august()),
            &CancellationToken::new(),
        )
        .await
        .expect_err("window belongs to bills");
    assert!(matches!(err, HarvestError::InvalidWindow(_)));
    assert_eq!(harvest_calls(&harvest), 0);
}

fn harvest_calls<P: PersistenceWriter>(harvest: &HarvestOrchestrator<FixtureTransport, P>) -> usize {
    harvest.transport().calls()
}

#[tokio::test]
async fn sources_run_concurrently_and_independently() {
    let dir = tempdir().expect("tempdir");
    let sources = vec![Arc::new(source("bills")), Arc::new(source("candidates"))];
    let transport = FixtureTransport::new(|url| {
        if url.contains("/bills") {
            bills_handler(45)(url)
        } else {
            json_page(url, json!([{ "name": format!("Candidate {}", page_number(url)), "region": "Norte" }]))
        }
    });
    let harvest = Arc::new(orchestrator(transport, persistence(dir.path())));

    let results = run_sources(Arc::clone(&harvest), &sources, &CancellationToken::new()).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "bills");
    assert_eq!(results[1].0, "candidates");
    let bills = results[0].1.as_ref().expect("bills run");
    let candidates = results[1].1.as_ref().expect("candidates run");
    assert_eq!(bills.entities_written, 40);
    assert_eq!(candidates.entities_written, 3);
    assert_ne!(bills.run_id, candidates.run_id);

    let bills_state = harvest.persistence().load_tracking("bills").await.expect("bills tracking");
    let candidate_state = harvest.persistence().load_tracking("candidates").await.expect("candidate tracking");
    assert!(bills_state.seen_entity_keys.iter().all(|k| k.starts_with("bills:")));
    assert!(candidate_state.seen_entity_keys.iter().all(|k| k.starts_with("candidates:")));
}
