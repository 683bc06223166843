//! Harvest run orchestration: window resolution, run-local dedup, persistence and scheduling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use harvest_storage::{FsPersistence, HttpClientConfig, PersistenceWriter, ReqwestTransport, Transport};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod config;
pub mod dedup;
pub mod orchestrator;
pub mod period;

pub use config::{
    load_source_registry, parse_source_registry, HarvestConfig, HarvestSource, SourceConfig,
    SourceRegistry, TaskPlanner, UrlTemplatePlanner,
};
pub use dedup::{Admission, AdmissionCounts, DedupStore};
pub use orchestrator::{
    HarvestError, HarvestOrchestrator, OrchestratorConfig, RunOutcome, RunPhase, RunReport,
    RunRequest, RunStateMachine,
};
pub use period::{PeriodResolver, Resolution, WalkDirection};

pub const CRATE_NAME: &str = "harvest-sync";

pub type LiveOrchestrator = HarvestOrchestrator<ReqwestTransport, FsPersistence>;

/// Everything a process needs to run harvests: configuration, the live orchestrator and the
/// sources declared in `sources.yaml`.
pub struct HarvestRuntime {
    pub config: HarvestConfig,
    pub orchestrator: Arc<LiveOrchestrator>,
    pub sources: Vec<Arc<HarvestSource>>,
}

impl HarvestRuntime {
    pub async fn from_env() -> Result<Self> {
        Self::from_config(HarvestConfig::from_env()).await
    }

    pub async fn from_config(config: HarvestConfig) -> Result<Self> {
        let registry = load_source_registry(&config.registry_path()).await?;
        let sources = registry
            .sources
            .iter()
            .map(|source| HarvestSource::from_config(source, &config).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let transport = ReqwestTransport::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
        })?;
        let persistence = FsPersistence::new(&config.artifacts_dir, &config.tracking_dir)
            .with_lease_ttl(Duration::from_secs(config.lease_ttl_secs));
        let orchestrator = HarvestOrchestrator::new(
            OrchestratorConfig::from(&config),
            Arc::new(transport),
            Arc::new(persistence),
        );
        let enabled = sources.iter().filter(|s| s.enabled).count();
        info!(sources = sources.len(), enabled, "harvest runtime ready");
        Ok(Self {
            config,
            orchestrator: Arc::new(orchestrator),
            sources,
        })
    }

    pub fn source(&self, source_id: &str) -> Result<Arc<HarvestSource>> {
        self.sources
            .iter()
            .find(|s| s.source_id == source_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown source {source_id}"))
    }

    pub fn enabled_sources(&self) -> Vec<Arc<HarvestSource>> {
        self.sources.iter().filter(|s| s.enabled).cloned().collect()
    }

    pub async fn maybe_build_scheduler(&self, cancel: CancellationToken) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        build_scheduler(
            &self.config.harvest_cron,
            Arc::clone(&self.orchestrator),
            self.enabled_sources(),
            cancel,
        )
        .await
        .map(Some)
    }
}

/// Runs every source concurrently with its default request. Runs for different sources
/// share nothing but the transport and the persistence root.
pub async fn run_sources<T, P>(
    orchestrator: Arc<HarvestOrchestrator<T, P>>,
    sources: &[Arc<HarvestSource>],
    cancel: &CancellationToken,
) -> Vec<(String, Result<RunReport, HarvestError>)>
where
    T: Transport,
    P: PersistenceWriter,
{
    let mut set = JoinSet::new();
    for source in sources {
        let orchestrator = Arc::clone(&orchestrator);
        let source = Arc::clone(source);
        let cancel = cancel.clone();
        set.spawn(async move {
            let request = RunRequest::for_source(&source);
            let result = orchestrator.run(&source, &request, &cancel).await;
            (source.source_id.clone(), result)
        });
    }

    let mut results = Vec::with_capacity(sources.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(err) => warn!(error = %err, "harvest run task aborted"),
        }
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}

pub async fn build_scheduler<T, P>(
    cron: &str,
    orchestrator: Arc<HarvestOrchestrator<T, P>>,
    sources: Vec<Arc<HarvestSource>>,
    cancel: CancellationToken,
) -> Result<JobScheduler>
where
    T: Transport,
    P: PersistenceWriter,
{
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let sources = Arc::new(sources);
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = Arc::clone(&orchestrator);
        let sources = Arc::clone(&sources);
        let cancel = cancel.clone();
        Box::pin(async move {
            info!(sources = sources.len(), "scheduled harvest triggered");
            for (source_id, result) in run_sources(orchestrator, &sources, &cancel).await {
                log_run_result(&source_id, &result);
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub fn log_run_result(source_id: &str, result: &Result<RunReport, HarvestError>) {
    match result {
        Ok(report) => info!(
            source_id,
            outcome = ?report.outcome,
            window = ?report.window.as_ref().map(ToString::to_string),
            entities = report.entities_written,
            "harvest run finished"
        ),
        Err(err) if err.is_lease_held() => {
            info!(source_id, error = %err, "harvest run skipped; source busy")
        }
        Err(err) => warn!(source_id, error = %err, "harvest run failed"),
    }
}
