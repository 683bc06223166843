//! Environment configuration, the `sources.yaml` registry and per-source task planning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use harvest_adapters::{adapter_from_spec, AdapterSpec, ExtractionAdapter};
use harvest_core::{Canonicalizer, CanonicalizerConfig, CollectionWindow, FetchTask, TargetSpan};
use harvest_storage::{default_identities, ClientIdentity, SchedulerConfig};
use serde::Deserialize;
use tokio::fs;

use crate::period::{PeriodResolver, WalkDirection};

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub workspace_root: PathBuf,
    pub artifacts_dir: PathBuf,
    pub tracking_dir: PathBuf,
    /// A run fails when more than this share of attempted fetches failed permanently.
    pub failure_threshold: f64,
    pub http_timeout_secs: u64,
    /// Leases older than this are reclaimed from runs that died holding them.
    pub lease_ttl_secs: u64,
    pub user_agents: Vec<String>,
    pub rotate_every: usize,
    pub scheduler_enabled: bool,
    pub harvest_cron: String,
    pub fetch: SchedulerConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            artifacts_dir: PathBuf::from("./artifacts"),
            tracking_dir: PathBuf::from("./tracking"),
            failure_threshold: 0.5,
            http_timeout_secs: 20,
            lease_ttl_secs: harvest_storage::DEFAULT_LEASE_TTL.as_secs(),
            user_agents: Vec::new(),
            rotate_every: 20,
            scheduler_enabled: false,
            harvest_cron: "0 0 5 * * *".to_string(),
            fetch: SchedulerConfig::default(),
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let workspace_root = std::env::var("HARVEST_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_root);
        Self {
            artifacts_dir: std::env::var("HARVEST_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("artifacts")),
            tracking_dir: std::env::var("HARVEST_TRACKING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("tracking")),
            failure_threshold: std::env::var("HARVEST_FAILURE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| (0.0..=1.0).contains(v))
                .unwrap_or(defaults.failure_threshold),
            http_timeout_secs: std::env::var("HARVEST_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            lease_ttl_secs: std::env::var("HARVEST_LEASE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.lease_ttl_secs),
            user_agents: std::env::var("HARVEST_USER_AGENTS")
                .map(|v| {
                    v.split('|')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            rotate_every: std::env::var("HARVEST_ROTATE_EVERY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.rotate_every),
            scheduler_enabled: std::env::var("HARVEST_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            harvest_cron: std::env::var("HARVEST_CRON").unwrap_or(defaults.harvest_cron),
            workspace_root,
            fetch: defaults.fetch,
        }
    }

    pub fn identities(&self) -> Vec<ClientIdentity> {
        if self.user_agents.is_empty() {
            return default_identities();
        }
        self.user_agents
            .iter()
            .map(ClientIdentity::with_user_agent)
            .collect()
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub target_span: TargetSpan,
    #[serde(default)]
    pub direction: WalkDirection,
    #[serde(default)]
    pub history_floor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
    /// `[min, max]` pre-request jitter in milliseconds.
    #[serde(default)]
    pub delay_ms: Option<(u64, u64)>,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub blocked_markers: Vec<String>,
    pub url_templates: Vec<String>,
    #[serde(default = "default_pages")]
    pub pages: u32,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    pub canonical: CanonicalizerConfig,
    pub adapter: AdapterSpec,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_pages() -> u32 {
    1
}

fn default_date_format() -> String {
    "%Y-%m-%d".to_string()
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_source_registry(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_source_registry(text: &str) -> Result<SourceRegistry> {
    let registry: SourceRegistry = serde_yaml::from_str(text)?;
    let mut seen = std::collections::BTreeSet::new();
    for source in &registry.sources {
        if !seen.insert(source.source_id.as_str()) {
            bail!("duplicate source_id {}", source.source_id);
        }
        if source.url_templates.is_empty() {
            bail!("source {} declares no url_templates", source.source_id);
        }
    }
    Ok(registry)
}

/// Turns a collection window into the fetch tasks that cover it.
pub trait TaskPlanner: Send + Sync {
    fn plan(&self, window: &CollectionWindow) -> Vec<FetchTask>;
}

/// Expands `{start}`, `{end}`, `{start_ts}`, `{end_ts}` and `{page}` placeholders.
/// Templates without `{page}` yield a single task.
#[derive(Debug, Clone)]
pub struct UrlTemplatePlanner {
    source_id: String,
    templates: Vec<String>,
    pages: u32,
    date_format: String,
}

impl UrlTemplatePlanner {
    pub fn new(
        source_id: impl Into<String>,
        templates: Vec<String>,
        pages: u32,
        date_format: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            templates,
            pages: pages.max(1),
            date_format: date_format.into(),
        }
    }
}

impl TaskPlanner for UrlTemplatePlanner {
    fn plan(&self, window: &CollectionWindow) -> Vec<FetchTask> {
        let start = window.start.format(&self.date_format).to_string();
        let end = window.end.format(&self.date_format).to_string();
        let mut tasks = Vec::new();
        for template in &self.templates {
            let base = template
                .replace("{start}", &start)
                .replace("{end}", &end)
                .replace("{start_ts}", &window.start.timestamp().to_string())
                .replace("{end_ts}", &window.end.timestamp().to_string());
            let pages = if base.contains("{page}") { self.pages } else { 1 };
            for page in 1..=pages {
                let url = base.replace("{page}", &page.to_string());
                let ordinal = tasks.len();
                tasks.push(FetchTask::new(&self.source_id, url, ordinal));
            }
        }
        tasks
    }
}

/// Everything a run needs to know about one source.
pub struct HarvestSource {
    pub source_id: String,
    pub display_name: String,
    pub notes: Option<String>,
    pub enabled: bool,
    pub target_span: TargetSpan,
    pub resolver: PeriodResolver,
    pub planner: Box<dyn TaskPlanner>,
    pub adapter: Box<dyn ExtractionAdapter>,
    pub canonicalizer: Canonicalizer,
    pub fetch: SchedulerConfig,
}

impl HarvestSource {
    pub fn from_config(source: &SourceConfig, config: &HarvestConfig) -> Result<Self> {
        let adapter = adapter_from_spec(&source.source_id, &source.adapter)
            .with_context(|| format!("building adapter for {}", source.source_id))?;

        let mut fetch = config.fetch.clone();
        if let Some(limit) = source.concurrency_limit {
            fetch.concurrency_limit = limit.max(1);
        }
        if let Some((min, max)) = source.delay_ms {
            fetch.delay_range = Duration::from_millis(min)..=Duration::from_millis(max.max(min));
        }
        if let Some(secs) = source.cooldown_secs {
            fetch.block_cooldown = Duration::from_secs(secs);
        }
        if let Some(attempts) = source.max_attempts {
            fetch.backoff.max_attempts = attempts.max(1);
        }
        fetch.blocked_markers.extend(source.blocked_markers.iter().cloned());

        Ok(Self {
            source_id: source.source_id.clone(),
            display_name: source
                .display_name
                .clone()
                .unwrap_or_else(|| source.source_id.clone()),
            notes: source.notes.clone(),
            enabled: source.enabled,
            target_span: source.target_span,
            resolver: PeriodResolver::new(source.direction, source.history_floor),
            planner: Box::new(UrlTemplatePlanner::new(
                &source.source_id,
                source.url_templates.clone(),
                source.pages,
                &source.date_format,
            )),
            adapter,
            canonicalizer: Canonicalizer::new(source.canonical.clone()),
            fetch,
        })
    }
}
