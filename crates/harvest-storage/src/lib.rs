//! Fetch execution, artifact persistence and tracking-state storage for harvest runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{CanonicalEntity, CollectionWindow, TrackingState};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub mod fetch;
pub mod identity;

pub use fetch::{
    BackoffPolicy, BatchOutcome, BatchStats, FetchError, FetchOutcome, FetchScheduler, FetchedPage,
    HttpClientConfig, ReqwestTransport, SchedulerConfig, TokenBucketConfig, Transport,
    TransportError, TransportResponse,
};
pub use identity::{default_identities, ClientIdentity, IdentityRotator};

pub const CRATE_NAME: &str = "harvest-storage";

pub const ARTIFACT_SCHEMA_VERSION: u32 = 1;

/// Leases older than this are presumed abandoned by a run that died without releasing them.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("invalid source id {0:?}")]
    InvalidSourceId(String),
    #[error("source {source_id} is owned by another run (lease {})", path.display())]
    LeaseHeld { source_id: String, path: PathBuf },
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error for {}: {source}", path.display())]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn serde_err(path: &Path) -> impl FnOnce(serde_json::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Serde {
        path: path.to_path_buf(),
        source,
    }
}

/// Source ids become file names, so only a conservative character set is accepted.
pub fn validate_source_id(source_id: &str) -> Result<(), PersistenceError> {
    let ok = !source_id.is_empty()
        && !source_id.starts_with('.')
        && source_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(PersistenceError::InvalidSourceId(source_id.to_string()))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Writes through a temp file in the target directory and renames it into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(io_err(parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err(&temp_path)(err));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err(path)(err));
    }
    Ok(())
}

/// The versioned JSON document written once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDocument {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub source_id: String,
    pub window: CollectionWindow,
    /// False when the run was cancelled before every task was issued.
    pub window_complete: bool,
    pub written_at: DateTime<Utc>,
    pub entity_count: usize,
    pub entities: Vec<CanonicalEntity>,
}

impl ArtifactDocument {
    pub fn new(
        run_id: Uuid,
        window: CollectionWindow,
        window_complete: bool,
        entities: Vec<CanonicalEntity>,
    ) -> Self {
        Self {
            schema_version: ARTIFACT_SCHEMA_VERSION,
            run_id,
            source_id: window.source_id.clone(),
            window,
            window_complete,
            written_at: Utc::now(),
            entity_count: entities.len(),
            entities,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub entity_count: usize,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_relative_path(&self, window: &CollectionWindow, run_id: Uuid) -> PathBuf {
        let range = format!(
            "{}_{}",
            window.start.format("%Y%m%dT%H%M%S"),
            window.end.format("%Y%m%dT%H%M%S")
        );
        PathBuf::from(&window.source_id)
            .join(range)
            .join(format!("{run_id}.json"))
    }

    pub async fn store(&self, document: &ArtifactDocument) -> Result<StoredArtifact, PersistenceError> {
        validate_source_id(&document.source_id)?;
        let relative_path = self.artifact_relative_path(&document.window, document.run_id);
        let absolute_path = self.root.join(&relative_path);
        let bytes = serde_json::to_vec_pretty(document).map_err(serde_err(&absolute_path))?;
        write_atomic(&absolute_path, &bytes).await?;
        Ok(StoredArtifact {
            content_hash: sha256_hex(&bytes),
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            entity_count: document.entity_count,
        })
    }

    /// Every artifact written for a source, ordered by window start then write time.
    pub async fn load_all(&self, source_id: &str) -> Result<Vec<ArtifactDocument>, PersistenceError> {
        validate_source_id(source_id)?;
        let source_dir = self.root.join(source_id);
        if !fs::try_exists(&source_dir).await.map_err(io_err(&source_dir))? {
            return Ok(Vec::new());
        }

        let mut documents = Vec::new();
        let mut windows = fs::read_dir(&source_dir).await.map_err(io_err(&source_dir))?;
        while let Some(window_dir) = windows.next_entry().await.map_err(io_err(&source_dir))? {
            let window_path = window_dir.path();
            let file_type = window_dir.file_type().await.map_err(io_err(&window_path))?;
            if !file_type.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(&window_path).await.map_err(io_err(&window_path))?;
            while let Some(entry) = files.next_entry().await.map_err(io_err(&window_path))? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let bytes = fs::read(&path).await.map_err(io_err(&path))?;
                match serde_json::from_slice::<ArtifactDocument>(&bytes) {
                    Ok(doc) => documents.push(doc),
                    Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable artifact"),
                }
            }
        }
        documents.sort_by_key(|d| (d.window.start, d.written_at));
        Ok(documents)
    }
}

#[derive(Debug, Clone)]
pub struct TrackingStore {
    root: PathBuf,
    lease_ttl: Duration,
}

impl TrackingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn path_for(&self, source_id: &str) -> PathBuf {
        self.root.join(format!("{source_id}.json"))
    }

    pub fn lease_path_for(&self, source_id: &str) -> PathBuf {
        self.root.join(format!("{source_id}.lock"))
    }

    /// Missing snapshots yield a fresh state (first run for the source).
    pub async fn load(&self, source_id: &str) -> Result<TrackingState, PersistenceError> {
        validate_source_id(source_id)?;
        let path = self.path_for(source_id);
        if !fs::try_exists(&path).await.map_err(io_err(&path))? {
            return Ok(TrackingState::new(source_id));
        }
        let bytes = fs::read(&path).await.map_err(io_err(&path))?;
        serde_json::from_slice(&bytes).map_err(serde_err(&path))
    }

    pub async fn commit(&self, state: &TrackingState) -> Result<(), PersistenceError> {
        validate_source_id(&state.source_id)?;
        let path = self.path_for(&state.source_id);
        let bytes = serde_json::to_vec_pretty(state).map_err(serde_err(&path))?;
        write_atomic(&path, &bytes).await
    }

    /// Removes the snapshot and any stale lease. Returns whether a snapshot existed.
    pub async fn reset(&self, source_id: &str) -> Result<bool, PersistenceError> {
        if self.clear_lease(source_id).await? {
            warn!(source_id, "removed stale lease during reset");
        }
        let path = self.path_for(source_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_err(&path)(err)),
        }
    }

    /// Deletes the lease file regardless of its owner. Tracking state is left untouched.
    pub async fn clear_lease(&self, source_id: &str) -> Result<bool, PersistenceError> {
        validate_source_id(source_id)?;
        let lease = self.lease_path_for(source_id);
        match fs::remove_file(&lease).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_err(&lease)(err)),
        }
    }

    /// Takes the source's lease. A lease left behind by a dead process, or older than the
    /// configured TTL, is reclaimed.
    pub async fn acquire_lease(&self, source_id: &str) -> Result<SourceLease, PersistenceError> {
        validate_source_id(source_id)?;
        fs::create_dir_all(&self.root).await.map_err(io_err(&self.root))?;
        let path = self.lease_path_for(source_id);
        if let Some(lease) = create_lease(&path).await? {
            return Ok(lease);
        }

        let held = || PersistenceError::LeaseHeld {
            source_id: source_id.to_string(),
            path: path.clone(),
        };
        let Some((stamp, reason)) = self.stale_lease(&path).await? else {
            return Err(held());
        };
        // Another process may have reclaimed it between the check and now.
        match fs::read_to_string(&path).await {
            Ok(current) if current == stamp => {}
            Ok(_) => return Err(held()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&path)(err)),
        }
        warn!(source_id, %reason, lease = %path.display(), "reclaiming abandoned source lease");
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&path)(err)),
        }
        create_lease(&path).await?.ok_or_else(held)
    }

    /// Returns the lease's stamp and why it is considered abandoned, or `None` if its
    /// owner may still be running.
    async fn stale_lease(&self, path: &Path) -> Result<Option<(String, String)>, PersistenceError> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Some((String::new(), "released while checking".to_string())))
            }
            Err(err) => return Err(io_err(path)(err)),
        };
        let stamp = LeaseStamp::parse(&text);
        if let Some(pid) = stamp.pid {
            if !process_alive(pid) {
                return Ok(Some((text, format!("owner pid {pid} is not running"))));
            }
        }
        let acquired_at = match stamp.acquired_at {
            Some(at) => at,
            None => {
                let metadata = fs::metadata(path).await.map_err(io_err(path))?;
                metadata.modified().map(DateTime::<Utc>::from).map_err(io_err(path))?
            }
        };
        let age = (Utc::now() - acquired_at).to_std().unwrap_or_default();
        if age > self.lease_ttl {
            return Ok(Some((text, format!("lease is {}s old", age.as_secs()))));
        }
        Ok(None)
    }
}

async fn create_lease(path: &Path) -> Result<Option<SourceLease>, PersistenceError> {
    let opened = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await;
    let mut file = match opened {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
        Err(err) => return Err(io_err(path)(err)),
    };
    let lease = SourceLease {
        path: Some(path.to_path_buf()),
    };
    file.write_all(LeaseStamp::current().as_bytes())
        .await
        .map_err(io_err(path))?;
    file.flush().await.map_err(io_err(path))?;
    Ok(Some(lease))
}

/// Contents of a lease file: `pid=<pid> acquired_at=<rfc3339>`.
#[derive(Debug, Default, PartialEq, Eq)]
struct LeaseStamp {
    pid: Option<u32>,
    acquired_at: Option<DateTime<Utc>>,
}

impl LeaseStamp {
    fn current() -> String {
        format!("pid={} acquired_at={}\n", std::process::id(), Utc::now().to_rfc3339())
    }

    fn parse(text: &str) -> Self {
        let mut stamp = Self::default();
        for part in text.split_whitespace() {
            if let Some(pid) = part.strip_prefix("pid=") {
                stamp.pid = pid.parse().ok();
            } else if let Some(at) = part.strip_prefix("acquired_at=") {
                stamp.acquired_at = DateTime::parse_from_rfc3339(at)
                    .ok()
                    .map(|at| at.with_timezone(&Utc));
            }
        }
        stamp
    }
}

/// Pids are only meaningful on the same host; elsewhere the TTL alone decides.
#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id() || Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Exclusive ownership of one source's tracking state; released on drop.
#[derive(Debug)]
pub struct SourceLease {
    path: Option<PathBuf>,
}

impl SourceLease {
    /// A lease with no backing file, for writers that need no cross-process exclusion.
    pub fn unguarded() -> Self {
        Self { path: None }
    }
}

impl Drop for SourceLease {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "failed to release source lease");
            }
        }
    }
}

/// Durable sink for run output. `commit_tracking` must only be called after
/// `write_artifact` succeeded for the same run.
#[async_trait]
pub trait PersistenceWriter: Send + Sync + 'static {
    async fn acquire_lease(&self, source_id: &str) -> Result<SourceLease, PersistenceError>;
    async fn load_tracking(&self, source_id: &str) -> Result<TrackingState, PersistenceError>;
    async fn write_artifact(&self, document: &ArtifactDocument) -> Result<StoredArtifact, PersistenceError>;
    async fn commit_tracking(&self, state: &TrackingState) -> Result<(), PersistenceError>;
    async fn reset_tracking(&self, source_id: &str) -> Result<bool, PersistenceError>;
    async fn clear_lease(&self, source_id: &str) -> Result<bool, PersistenceError>;
}

/// Filesystem persistence: artifacts under one root, tracking snapshots and leases under another.
#[derive(Debug, Clone)]
pub struct FsPersistence {
    artifacts: ArtifactStore,
    tracking: TrackingStore,
}

impl FsPersistence {
    pub fn new(artifacts_dir: impl Into<PathBuf>, tracking_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifacts: ArtifactStore::new(artifacts_dir),
            tracking: TrackingStore::new(tracking_dir),
        }
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.tracking = self.tracking.with_lease_ttl(lease_ttl);
        self
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn tracking(&self) -> &TrackingStore {
        &self.tracking
    }

    /// Reconstructs tracking state from the artifacts on disk, e.g. after the snapshot was
    /// lost. Windows of cancelled runs are not counted as covered.
    pub async fn rebuild_tracking(&self, source_id: &str) -> Result<TrackingState, PersistenceError> {
        let documents = self.artifacts.load_all(source_id).await?;
        let mut state = TrackingState::new(source_id);
        for doc in &documents {
            if doc.window_complete {
                state.record_window(&doc.window);
            }
            state.absorb(&doc.entities);
            state.last_run_at = Some(state.last_run_at.map_or(doc.written_at, |t| t.max(doc.written_at)));
        }
        info!(
            source_id,
            artifacts = documents.len(),
            windows = state.covered_windows.len(),
            entities = state.seen_entity_keys.len(),
            "rebuilt tracking state from artifacts"
        );
        Ok(state)
    }
}

#[async_trait]
impl PersistenceWriter for FsPersistence {
    async fn acquire_lease(&self, source_id: &str) -> Result<SourceLease, PersistenceError> {
        self.tracking.acquire_lease(source_id).await
    }

    async fn load_tracking(&self, source_id: &str) -> Result<TrackingState, PersistenceError> {
        self.tracking.load(source_id).await
    }

    async fn write_artifact(&self, document: &ArtifactDocument) -> Result<StoredArtifact, PersistenceError> {
        self.artifacts.store(document).await
    }

    async fn commit_tracking(&self, state: &TrackingState) -> Result<(), PersistenceError> {
        self.tracking.commit(state).await
    }

    async fn reset_tracking(&self, source_id: &str) -> Result<bool, PersistenceError> {
        self.tracking.reset(source_id).await
    }

    async fn clear_lease(&self, source_id: &str) -> Result<bool, PersistenceError> {
        self.tracking.clear_lease(source_id).await
    }
}
