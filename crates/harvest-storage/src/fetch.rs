//! Bounded-concurrency, jittered, retrying fetch execution.

use std::collections::{HashMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::FetchTask;
use rand::Rng;
use reqwest::header::{ACCEPT_LANGUAGE, USER_AGENT};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::identity::{ClientIdentity, IdentityRotator};

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("reading response body failed: {0}")]
    Body(String),
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl TransportError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            TransportError::Timeout(_) | TransportError::Connect(_) | TransportError::Body(_) => {
                RetryDisposition::Retryable
            }
            TransportError::Invalid(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Issues a single GET with the given identity. Implementations must not retry.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn get(
        &self,
        url: &str,
        identity: &ClientIdentity,
    ) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        TransportError::Connect(err.to_string())
    } else if err.is_body() || err.is_decode() {
        TransportError::Body(err.to_string())
    } else {
        TransportError::Invalid(err.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        identity: &ClientIdentity,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, identity.user_agent.as_str())
            .header(ACCEPT_LANGUAGE, identity.accept_language.as_str());
        for (name, value) in &identity.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let resp = request.send().await.map_err(|e| classify_reqwest_error(&e))?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let body = resp
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(&e))?
            .to_vec();
        Ok(TransportResponse {
            status,
            final_url,
            body,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Blocked,
    Retryable,
    NonRetryable,
}

/// 403/429 and marker-bearing bodies are blocking signals; 5xx and 408 are transient.
pub fn classify_response(status: u16, body: &[u8], blocked_markers: &[String]) -> ResponseClass {
    if status == 403 || status == 429 || body_has_marker(body, blocked_markers) {
        return ResponseClass::Blocked;
    }
    match status {
        200..=299 => ResponseClass::Success,
        408 | 500..=599 => ResponseClass::Retryable,
        _ => ResponseClass::NonRetryable,
    }
}

fn body_has_marker(body: &[u8], markers: &[String]) -> bool {
    if markers.is_empty() || body.is_empty() {
        return false;
    }
    let text = String::from_utf8_lossy(body).to_lowercase();
    markers
        .iter()
        .filter(|m| !m.is_empty())
        .any(|m| text.contains(&m.to_lowercase()))
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts per task, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Caps the request rate across all workers of a batch.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<(u32, Instant)>,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new((config.capacity.max(1), Instant::now())),
        }
    }

    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (tokens, last_refill) = &mut *state;
                if !self.refill_every.is_zero() {
                    let refills = last_refill.elapsed().as_nanos() / self.refill_every.as_nanos();
                    if refills > 0 {
                        let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                        *tokens = tokens.saturating_add(refills).min(self.capacity);
                        *last_refill += self.refill_every.saturating_mul(refills);
                    }
                } else {
                    *tokens = self.capacity;
                }
                if *tokens > 0 {
                    *tokens -= 1;
                    return;
                }
                (*last_refill + self.refill_every).saturating_duration_since(Instant::now())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency_limit: usize,
    /// Random pause before every request.
    pub delay_range: RangeInclusive<Duration>,
    /// Pause shared by all workers after a blocking signal.
    pub block_cooldown: Duration,
    pub backoff: BackoffPolicy,
    /// Case-insensitive body substrings that mark a 2xx page as a block. Empty unless the
    /// source declares some.
    pub blocked_markers: Vec<String>,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            delay_range: Duration::from_millis(500)..=Duration::from_millis(1500),
            block_cooldown: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            blocked_markers: Vec::new(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient failure for {url}: {reason}")]
    Transient { url: String, reason: String },
    #[error("blocked by {url} (status {status})")]
    Blocked { url: String, status: u16 },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("fetch worker for {url} aborted: {reason}")]
    Aborted { url: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub task: FetchTask,
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fetched(FetchedPage),
    /// Permanently failed after the attempt ceiling or a non-retryable response.
    Failed { task: FetchTask, error: FetchError },
    /// Never issued, or stopped between attempts, because the run was cancelled.
    Cancelled { task: FetchTask },
}

impl FetchOutcome {
    pub fn task(&self) -> &FetchTask {
        match self {
            FetchOutcome::Fetched(page) => &page.task,
            FetchOutcome::Failed { task, .. } | FetchOutcome::Cancelled { task } => task,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStats {
    pub total: usize,
    pub fetched: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub blocked_signals: usize,
    pub final_concurrency: usize,
}

impl BatchStats {
    pub fn attempted(&self) -> usize {
        self.fetched + self.failed
    }

    /// Share of attempted tasks that failed permanently. Cancelled tasks are not counted.
    pub fn failure_rate(&self) -> f64 {
        match self.attempted() {
            0 => 0.0,
            n => self.failed as f64 / n as f64,
        }
    }

    fn record(&mut self, outcome: &FetchOutcome) {
        match outcome {
            FetchOutcome::Fetched(_) => self.fetched += 1,
            FetchOutcome::Failed { .. } => self.failed += 1,
            FetchOutcome::Cancelled { .. } => self.cancelled += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub outcomes: Vec<FetchOutcome>,
    pub stats: BatchStats,
}

pub struct FetchScheduler<T: Transport> {
    transport: Arc<T>,
    rotator: Arc<IdentityRotator>,
    config: SchedulerConfig,
}

impl<T: Transport> FetchScheduler<T> {
    pub fn new(transport: Arc<T>, rotator: Arc<IdentityRotator>, config: SchedulerConfig) -> Self {
        Self {
            transport,
            rotator,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub async fn run_batch(&self, tasks: Vec<FetchTask>, cancel: &CancellationToken) -> BatchOutcome {
        let mut outcomes = Vec::with_capacity(tasks.len());
        let stats = self
            .run_batch_with(tasks, cancel, |outcome| outcomes.push(outcome))
            .await;
        BatchOutcome { outcomes, stats }
    }

    /// Runs every task with at most `concurrency_limit` in flight, handing each outcome to
    /// `on_outcome` on the calling task as soon as it completes.
    pub async fn run_batch_with<F>(
        &self,
        tasks: Vec<FetchTask>,
        cancel: &CancellationToken,
        mut on_outcome: F,
    ) -> BatchStats
    where
        F: FnMut(FetchOutcome),
    {
        let limit = self.config.concurrency_limit.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let shared = Arc::new(BatchShared {
            transport: Arc::clone(&self.transport),
            rotator: Arc::clone(&self.rotator),
            config: self.config.clone(),
            cancel: cancel.clone(),
            bucket: self.config.token_bucket.map(TokenBucket::new),
            cooldown_until: Mutex::new(None),
            effective_limit: AtomicUsize::new(limit),
            shed_pending: AtomicUsize::new(0),
            blocked_signals: AtomicUsize::new(0),
        });

        let mut ordered = tasks;
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.ordinal.cmp(&b.ordinal)));
        let mut stats = BatchStats {
            total: ordered.len(),
            ..Default::default()
        };
        let mut queue: VecDeque<FetchTask> = ordered.into();
        let mut in_flight: HashMap<tokio::task::Id, FetchTask> = HashMap::new();
        let mut join_set = JoinSet::new();

        info!(tasks = stats.total, concurrency = limit, "starting fetch batch");

        while !queue.is_empty() && !cancel.is_cancelled() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = join_set.join_next_with_id(), if !join_set.is_empty() => {
                    finish_joined(joined, &mut in_flight, &mut stats, &mut on_outcome);
                }
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    let Ok(permit) = permit else { break };
                    let Some(task) = queue.pop_front() else { break };
                    let handle = join_set.spawn(execute_task(Arc::clone(&shared), task.clone(), permit));
                    in_flight.insert(handle.id(), task);
                }
            }
        }

        for task in queue.drain(..) {
            let outcome = FetchOutcome::Cancelled { task };
            stats.record(&outcome);
            on_outcome(outcome);
        }
        while let Some(joined) = join_set.join_next_with_id().await {
            finish_joined(joined, &mut in_flight, &mut stats, &mut on_outcome);
        }

        stats.blocked_signals = shared.blocked_signals.load(Ordering::SeqCst);
        stats.final_concurrency = shared.effective_limit.load(Ordering::SeqCst);
        info!(
            fetched = stats.fetched,
            failed = stats.failed,
            cancelled = stats.cancelled,
            blocked_signals = stats.blocked_signals,
            final_concurrency = stats.final_concurrency,
            "fetch batch finished"
        );
        stats
    }
}

fn finish_joined<F: FnMut(FetchOutcome)>(
    joined: Result<(tokio::task::Id, FetchOutcome), JoinError>,
    in_flight: &mut HashMap<tokio::task::Id, FetchTask>,
    stats: &mut BatchStats,
    on_outcome: &mut F,
) {
    let outcome = match joined {
        Ok((id, outcome)) => {
            in_flight.remove(&id);
            outcome
        }
        Err(err) => {
            let Some(task) = in_flight.remove(&err.id()) else {
                warn!(error = %err, "fetch worker ended without a tracked task");
                return;
            };
            FetchOutcome::Failed {
                error: FetchError::Aborted {
                    url: task.url.clone(),
                    reason: err.to_string(),
                },
                task,
            }
        }
    };
    stats.record(&outcome);
    on_outcome(outcome);
}

struct BatchShared<T> {
    transport: Arc<T>,
    rotator: Arc<IdentityRotator>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    bucket: Option<TokenBucket>,
    cooldown_until: Mutex<Option<Instant>>,
    effective_limit: AtomicUsize,
    shed_pending: AtomicUsize,
    blocked_signals: AtomicUsize,
}

impl<T> BatchShared<T> {
    /// Returns false if the run was cancelled while waiting.
    async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn wait_for_cooldown(&self) -> bool {
        loop {
            let until = *self.cooldown_until.lock().await;
            match until {
                Some(t) if t > Instant::now() => {
                    if !self.pause(t - Instant::now()).await {
                        return false;
                    }
                }
                _ => return !self.cancel.is_cancelled(),
            }
        }
    }

    fn jitter(&self) -> Duration {
        let range = &self.config.delay_range;
        if range.end() <= range.start() {
            return *range.start();
        }
        rand::rng().random_range(range.clone())
    }

    /// Extends the shared cooldown and, when no cooldown was already active, halves the
    /// effective concurrency (floor 1) for the rest of the batch.
    async fn on_blocked(&self) {
        self.blocked_signals.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        let mut cooldown = self.cooldown_until.lock().await;
        let already_cooling = cooldown.is_some_and(|t| t > now);
        let until = now + self.config.block_cooldown;
        *cooldown = Some(cooldown.map_or(until, |t| t.max(until)));
        drop(cooldown);

        if already_cooling {
            return;
        }
        let mut current = self.effective_limit.load(Ordering::SeqCst);
        loop {
            let target = (current / 2).max(1);
            if target == current {
                break;
            }
            match self.effective_limit.compare_exchange(
                current,
                target,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.shed_pending.fetch_add(current - target, Ordering::SeqCst);
                    warn!(from = current, to = target, "blocking signal; reducing concurrency");
                    break;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, permit: OwnedSemaphorePermit) {
        let shed = self
            .shed_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if shed {
            permit.forget();
        }
    }
}

async fn execute_task<T: Transport>(
    shared: Arc<BatchShared<T>>,
    task: FetchTask,
    permit: OwnedSemaphorePermit,
) -> FetchOutcome {
    let span = info_span!(
        "http_fetch",
        source_id = %task.source_id,
        url = %task.url,
        ordinal = task.ordinal
    );
    let outcome = attempt_until_done(&shared, task).instrument(span).await;
    shared.release(permit);
    outcome
}

async fn attempt_until_done<T: Transport>(shared: &BatchShared<T>, mut task: FetchTask) -> FetchOutcome {
    let backoff = shared.config.backoff;
    let max_attempts = backoff.max_attempts.max(1);

    loop {
        if !shared.wait_for_cooldown().await || !shared.pause(shared.jitter()).await {
            return FetchOutcome::Cancelled { task };
        }
        if let Some(bucket) = &shared.bucket {
            bucket.take().await;
        }

        let identity = shared.rotator.next_identity();
        task.attempt += 1;
        let attempt = task.attempt;

        let response = shared.transport.get(&task.url, &identity).await;
        let error = match response {
            Ok(resp) => {
                match classify_response(resp.status, &resp.body, &shared.config.blocked_markers) {
                    ResponseClass::Success => {
                        debug!(attempt, status = resp.status, bytes = resp.body.len(), "fetched");
                        return FetchOutcome::Fetched(FetchedPage {
                            status: resp.status,
                            final_url: resp.final_url,
                            body: resp.body,
                            fetched_at: Utc::now(),
                            task,
                        });
                    }
                    ResponseClass::Blocked => {
                        shared.on_blocked().await;
                        FetchError::Blocked {
                            url: task.url.clone(),
                            status: resp.status,
                        }
                    }
                    ResponseClass::Retryable => FetchError::Transient {
                        url: task.url.clone(),
                        reason: format!("http status {}", resp.status),
                    },
                    ResponseClass::NonRetryable => {
                        let error = FetchError::Status {
                            status: resp.status,
                            url: task.url.clone(),
                        };
                        warn!(attempt, error = %error, "non-retryable response");
                        return FetchOutcome::Failed { task, error };
                    }
                }
            }
            Err(err) if err.disposition() == RetryDisposition::Retryable => FetchError::Transient {
                url: task.url.clone(),
                reason: err.to_string(),
            },
            Err(err) => {
                let error = FetchError::Transport {
                    url: task.url.clone(),
                    source: err,
                };
                warn!(attempt, error = %error, "non-retryable transport error");
                return FetchOutcome::Failed { task, error };
            }
        };

        if attempt >= max_attempts {
            warn!(attempt, error = %error, "giving up after attempt ceiling");
            return FetchOutcome::Failed { task, error };
        }
        debug!(attempt, error = %error, "attempt failed; backing off");
        if !shared.pause(backoff.delay_for_attempt(attempt - 1)).await {
            return FetchOutcome::Cancelled { task };
        }
    }
}
