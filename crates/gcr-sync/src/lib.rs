//! Reconciliation pipeline orchestration, progress tracking and background runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gcr_adapters::{
    AdapterError, CheapSharkAdapter, CheapSharkConfig, MetadataSource, PriceLookup, PriceSource,
    RawgAdapter, RawgConfig,
};
use gcr_core::{MergedItem, SyncAuditRecord, SyncCounts, SyncStatus, SYNC_SOURCE};
use gcr_storage::{AuditDraft, CatalogStore, HttpClientConfig, LinearBackoff, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gcr-sync";

/// Largest page the metadata provider serves.
pub const MAX_PAGE_SIZE: u32 = 40;

const JOB_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub rawg: RawgConfig,
    pub cheapshark: CheapSharkConfig,
    pub http: HttpClientConfig,
    pub default_limit: u32,
    pub max_pages: Option<u32>,
    pub worker_count: usize,
    pub job_policy: JobPolicy,
    pub progress_ttl: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://gcr.db?mode=rwc".to_string()),
            rawg: RawgConfig {
                base_url: std::env::var("RAWG_BASE")
                    .unwrap_or_else(|_| "https://api.rawg.io/api".to_string()),
                api_key: std::env::var("RAWG_API_KEY").unwrap_or_default(),
            },
            cheapshark: CheapSharkConfig {
                base_url: std::env::var("CHEAPSHARK_BASE")
                    .unwrap_or_else(|_| "https://www.cheapshark.com/api/1.0".to_string()),
                request_delay: Duration::from_millis(env_parse("CHEAPSHARK_REQUEST_DELAY_MS", 1000)),
                backoff: LinearBackoff {
                    max_retries: env_parse("CHEAPSHARK_MAX_RETRIES", 3),
                    retry_delay: Duration::from_millis(env_parse("CHEAPSHARK_RETRY_DELAY_MS", 5000)),
                },
            },
            http: HttpClientConfig {
                timeout: Duration::from_secs(env_parse("GCR_HTTP_TIMEOUT_SECS", 20)),
                user_agent: Some(
                    std::env::var("GCR_USER_AGENT").unwrap_or_else(|_| "gcr-bot/0.1".to_string()),
                ),
            },
            default_limit: env_parse("GCR_SYNC_LIMIT", MAX_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
            max_pages: std::env::var("GCR_FULL_SYNC_MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok()),
            worker_count: env_parse("GCR_WORKERS", 1),
            job_policy: JobPolicy {
                max_retries: env_parse("GCR_JOB_MAX_RETRIES", 3),
                retry_delay: Duration::from_secs(env_parse("GCR_JOB_RETRY_DELAY_SECS", 60)),
            },
            progress_ttl: Duration::from_secs(env_parse("GCR_PROGRESS_TTL_SECS", 3600)),
            scheduler_enabled: std::env::var("GCR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("GCR_SYNC_CRON").unwrap_or_else(|_| "0 0 2 * * *".to_string()),
        }
    }

    pub fn single_page(&self, limit: Option<u32>) -> SyncMode {
        SyncMode::SinglePage {
            limit: limit.unwrap_or(self.default_limit),
        }
    }

    pub fn full_catalog(&self) -> SyncMode {
        SyncMode::FullCatalog {
            page_size: MAX_PAGE_SIZE,
            max_pages: self.max_pages,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("metadata source failed: {0}")]
    Upstream(#[from] AdapterError),
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
    #[error("page size {0} is outside 1..=40")]
    InvalidPageSize(u32),
    #[error("sync job queue is closed")]
    QueueClosed,
}

/// Terminal outcome of an aborted run, after the error audit row was attempted.
#[derive(Debug, Error)]
#[error("sync run failed: {message}")]
pub struct RunFailure {
    pub message: String,
    /// `None` when the run never started or the audit write itself failed.
    pub audit: Option<SyncAuditRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncMode {
    SinglePage { limit: u32 },
    FullCatalog { page_size: u32, max_pages: Option<u32> },
}

impl SyncMode {
    pub fn validate(&self) -> Result<(), SyncError> {
        let size = self.page_size();
        if size == 0 || size > MAX_PAGE_SIZE {
            return Err(SyncError::InvalidPageSize(size));
        }
        Ok(())
    }

    fn page_size(&self) -> u32 {
        match self {
            SyncMode::SinglePage { limit } => *limit,
            SyncMode::FullCatalog { page_size, .. } => *page_size,
        }
    }

    fn page_cap(&self) -> Option<u32> {
        match self {
            SyncMode::SinglePage { .. } => Some(1),
            SyncMode::FullCatalog { max_pages, .. } => *max_pages,
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::SinglePage { limit } => write!(f, "single-page(limit={limit})"),
            SyncMode::FullCatalog { page_size, max_pages: Some(cap) } => {
                write!(f, "full-catalog(page_size={page_size}, max_pages={cap})")
            }
            SyncMode::FullCatalog { page_size, max_pages: None } => {
                write!(f, "full-catalog(page_size={page_size})")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    PerItemProcessing,
    Upserting,
    Finalized(SyncStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub phase: SyncPhase,
    pub current: u64,
    pub total: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub message: String,
}

impl ProgressUpdate {
    fn from_tally(phase: SyncPhase, tally: &SyncCounts, current: u64, total: u64, message: String) -> Self {
        Self {
            phase,
            current,
            total,
            inserted: tally.inserted,
            updated: tally.updated,
            skipped: tally.skipped,
            message,
        }
    }
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, update: ProgressUpdate);
}

#[derive(Default)]
pub struct NoopProgress;

#[async_trait]
impl ProgressSink for NoopProgress {
    async fn report(&self, _update: ProgressUpdate) {}
}

pub struct SyncPipeline {
    store: CatalogStore,
    metadata: Box<dyn MetadataSource>,
    prices: Box<dyn PriceSource>,
}

impl SyncPipeline {
    pub fn new(config: &SyncConfig, store: CatalogStore) -> Result<Self, SyncError> {
        let metadata = RawgAdapter::new(config.rawg.clone(), &config.http)?;
        let prices = CheapSharkAdapter::new(config.cheapshark.clone(), &config.http)?;
        Ok(Self::from_parts(store, Box::new(metadata), Box::new(prices)))
    }

    pub fn from_parts(
        store: CatalogStore,
        metadata: Box<dyn MetadataSource>,
        prices: Box<dyn PriceSource>,
    ) -> Self {
        Self {
            store,
            metadata,
            prices,
        }
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    /// Run the pipeline once. Exactly one audit row is written for a run that
    /// passes validation, whichever way it ends.
    pub async fn run(
        &self,
        mode: SyncMode,
        progress: &dyn ProgressSink,
    ) -> Result<SyncAuditRecord, RunFailure> {
        if let Err(err) = mode.validate() {
            return Err(RunFailure {
                message: err.to_string(),
                audit: None,
            });
        }

        let started_at = Utc::now();
        let span = info_span!("sync_run", %mode);
        async move {
            info!("sync started");
            match self.execute(mode, started_at, progress).await {
                Ok(audit) => {
                    info!(
                        fetched = audit.records_fetched,
                        inserted = audit.records_inserted,
                        updated = audit.records_updated,
                        skipped = audit.records_skipped,
                        "sync finished"
                    );
                    let counts = audit.counts();
                    progress
                        .report(ProgressUpdate::from_tally(
                            SyncPhase::Finalized(SyncStatus::Success),
                            &counts,
                            counts.fetched,
                            counts.fetched,
                            "Sync complete".to_string(),
                        ))
                        .await;
                    Ok(audit)
                }
                Err(err) => {
                    let message = err.to_string();
                    error!(error = %message, "sync failed");
                    let audit = match self
                        .store
                        .record_failure(SYNC_SOURCE, started_at, &message)
                        .await
                    {
                        Ok(audit) => Some(audit),
                        Err(store_err) => {
                            error!(error = %store_err, "could not write error audit");
                            None
                        }
                    };
                    progress
                        .report(ProgressUpdate::from_tally(
                            SyncPhase::Finalized(SyncStatus::Error),
                            &SyncCounts::default(),
                            0,
                            0,
                            message.clone(),
                        ))
                        .await;
                    Err(RunFailure { message, audit })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        mode: SyncMode,
        started_at: DateTime<Utc>,
        progress: &dyn ProgressSink,
    ) -> Result<SyncAuditRecord, SyncError> {
        let page_size = mode.page_size();
        let page_cap = mode.page_cap();
        let mut tally = SyncCounts::default();
        let mut page_no = 1u32;

        loop {
            // the next page holds at most `page_size` more records
            progress
                .report(ProgressUpdate::from_tally(
                    SyncPhase::Fetching,
                    &tally,
                    tally.fetched,
                    tally.fetched + u64::from(page_size),
                    format!("Fetching page {page_no} from {}...", self.metadata.source_id()),
                ))
                .await;
            let page = self.metadata.fetch_page(page_size, page_no).await?;
            let is_last = !page.has_next_page || page_cap.is_some_and(|cap| page_no >= cap);
            let total = tally.fetched + page.records.len() as u64;

            let mut batch = Vec::with_capacity(page.records.len());
            for record in page.records {
                tally.fetched += 1;
                progress
                    .report(ProgressUpdate::from_tally(
                        SyncPhase::PerItemProcessing,
                        &tally,
                        tally.fetched,
                        total,
                        format!("Processing: {}", record.name),
                    ))
                    .await;

                match self.prices.fetch_price(&record.name).await {
                    PriceLookup::Matched(price) => batch.push(MergedItem::merge(record, price)),
                    PriceLookup::NoMatch(reason) => {
                        tally.skipped += 1;
                        debug!(name = %record.name, ?reason, "no price, skipping");
                    }
                }
            }

            progress
                .report(ProgressUpdate::from_tally(
                    SyncPhase::Upserting,
                    &tally,
                    tally.fetched,
                    total,
                    format!("Saving {} games...", batch.len()),
                ))
                .await;
            let finalize = is_last.then(|| AuditDraft {
                source: SYNC_SOURCE.to_string(),
                started_at,
                prior: tally,
            });
            let outcome = self.store.apply_batch(&batch, finalize).await?;
            tally.inserted += outcome.inserted;
            tally.updated += outcome.updated;

            if let Some(audit) = outcome.audit {
                return Ok(audit);
            }
            page_no += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProgressCounters {
    pub current: u64,
    pub total: u64,
    pub percent: f64,
}

/// What a poller sees for one run id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
    pub task_id: Uuid,
    pub state: RunState,
    pub phase: SyncPhase,
    pub progress: ProgressCounters,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub message: String,
    pub audit: Option<SyncAuditRecord>,
}

impl RunStatus {
    /// Status of a run no worker has picked up, also reported for unknown ids.
    pub fn queued(task_id: Uuid) -> Self {
        Self {
            task_id,
            state: RunState::Queued,
            phase: SyncPhase::Idle,
            progress: ProgressCounters::default(),
            inserted: 0,
            updated: 0,
            skipped: 0,
            message: "Task is waiting to be processed".to_string(),
            audit: None,
        }
    }
}

/// Percentage rounded to one decimal; 0 when nothing is known yet.
pub fn percent(current: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((current as f64 / total as f64) * 1000.0).round() / 10.0
}

struct TrackedRun {
    status: RunStatus,
    finished_at: Option<Instant>,
}

/// Shared, pollable progress keyed by run id. Finished runs expire after `ttl`.
#[derive(Clone)]
pub struct ProgressStore {
    runs: Arc<RwLock<HashMap<Uuid, TrackedRun>>>,
    ttl: Duration,
}

impl ProgressStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn handle(&self, run_id: Uuid) -> ProgressHandle {
        ProgressHandle {
            run_id,
            store: self.clone(),
        }
    }

    pub async fn enqueue(&self, run_id: Uuid) {
        self.runs.write().await.insert(
            run_id,
            TrackedRun {
                status: RunStatus::queued(run_id),
                finished_at: None,
            },
        );
    }

    pub async fn record(&self, run_id: Uuid, update: ProgressUpdate) {
        let mut runs = self.runs.write().await;
        let tracked = runs.entry(run_id).or_insert_with(|| TrackedRun {
            status: RunStatus::queued(run_id),
            finished_at: None,
        });
        let status = &mut tracked.status;
        status.state = RunState::Running;
        status.phase = update.phase;
        status.progress = ProgressCounters {
            current: update.current,
            total: update.total,
            percent: percent(update.current, update.total),
        };
        status.inserted = update.inserted;
        status.updated = update.updated;
        status.skipped = update.skipped;
        status.message = update.message;
    }

    /// The next attempt starts from the first page, so counters go back to zero here.
    pub async fn note_retry(&self, run_id: Uuid, attempt: u32, max_retries: u32, reason: &str) {
        let mut runs = self.runs.write().await;
        if let Some(tracked) = runs.get_mut(&run_id) {
            let status = &mut tracked.status;
            status.state = RunState::Running;
            status.phase = SyncPhase::Idle;
            status.progress = ProgressCounters::default();
            status.inserted = 0;
            status.updated = 0;
            status.skipped = 0;
            status.message = format!(
                "Retry {attempt}/{max_retries} after error: {reason}; progress restarts from zero"
            );
        }
    }

    pub async fn succeed(&self, run_id: Uuid, audit: SyncAuditRecord) {
        let counts = audit.counts();
        let mut status = RunStatus::queued(run_id);
        status.state = RunState::Succeeded;
        status.phase = SyncPhase::Finalized(SyncStatus::Success);
        status.progress = ProgressCounters {
            current: counts.fetched,
            total: counts.fetched,
            percent: 100.0,
        };
        status.inserted = counts.inserted;
        status.updated = counts.updated;
        status.skipped = counts.skipped;
        status.message = "Sync complete".to_string();
        status.audit = Some(audit);
        self.finish(run_id, status).await;
    }

    pub async fn fail(&self, run_id: Uuid, message: String, audit: Option<SyncAuditRecord>) {
        let mut status = RunStatus::queued(run_id);
        status.state = RunState::Failed;
        status.phase = SyncPhase::Finalized(SyncStatus::Error);
        status.message = message;
        status.audit = audit;
        self.finish(run_id, status).await;
    }

    async fn finish(&self, run_id: Uuid, status: RunStatus) {
        self.runs.write().await.insert(
            run_id,
            TrackedRun {
                status,
                finished_at: Some(Instant::now()),
            },
        );
    }

    /// Never fails: unknown or expired ids read back as queued.
    pub async fn status(&self, run_id: Uuid) -> RunStatus {
        let runs = self.runs.read().await;
        match runs.get(&run_id) {
            Some(tracked) if !self.is_expired(tracked) => tracked.status.clone(),
            _ => RunStatus::queued(run_id),
        }
    }

    pub async fn prune_expired(&self) -> usize {
        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|_, tracked| !self.is_expired(tracked));
        before - runs.len()
    }

    fn is_expired(&self, tracked: &TrackedRun) -> bool {
        tracked
            .finished_at
            .is_some_and(|finished| finished.elapsed() >= self.ttl)
    }
}

/// Progress sink bound to one run id.
pub struct ProgressHandle {
    run_id: Uuid,
    store: ProgressStore,
}

#[async_trait]
impl ProgressSink for ProgressHandle {
    async fn report(&self, update: ProgressUpdate) {
        self.store.record(self.run_id, update).await;
    }
}

/// Run-level retry envelope, separate from the per-lookup rate-limit retry.
#[derive(Debug, Clone, Copy)]
pub struct JobPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(60),
        }
    }
}

struct QueuedRun {
    run_id: Uuid,
    mode: SyncMode,
}

/// Submission side of the background worker pool.
#[derive(Clone)]
pub struct SyncJobs {
    queue: mpsc::Sender<QueuedRun>,
    progress: ProgressStore,
}

impl SyncJobs {
    /// Spawn `workers` tasks draining a shared queue. Needs a running tokio runtime.
    pub fn start(
        pipeline: Arc<SyncPipeline>,
        progress: ProgressStore,
        workers: usize,
        policy: JobPolicy,
    ) -> Self {
        let (queue, rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..workers.max(1) {
            tokio::spawn(worker_loop(
                worker,
                rx.clone(),
                pipeline.clone(),
                progress.clone(),
                policy,
            ));
        }
        Self { queue, progress }
    }

    pub async fn submit(&self, mode: SyncMode) -> Result<Uuid, SyncError> {
        mode.validate()?;
        let run_id = Uuid::new_v4();
        self.progress.enqueue(run_id).await;
        self.queue
            .send(QueuedRun { run_id, mode })
            .await
            .map_err(|_| SyncError::QueueClosed)?;
        info!(%run_id, %mode, "sync run queued");
        Ok(run_id)
    }

    pub async fn status(&self, run_id: Uuid) -> RunStatus {
        self.progress.status(run_id).await
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<QueuedRun>>>,
    pipeline: Arc<SyncPipeline>,
    progress: ProgressStore,
    policy: JobPolicy,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(job) = next else {
            debug!(worker, "job queue closed, worker exiting");
            return;
        };
        let span = info_span!("sync_job", worker, run_id = %job.run_id);
        run_job(job, &pipeline, &progress, policy).instrument(span).await;
        progress.prune_expired().await;
    }
}

async fn run_job(job: QueuedRun, pipeline: &SyncPipeline, progress: &ProgressStore, policy: JobPolicy) {
    let handle = progress.handle(job.run_id);
    let mut retries = 0u32;
    loop {
        match pipeline.run(job.mode, &handle).await {
            Ok(audit) => {
                progress.succeed(job.run_id, audit).await;
                return;
            }
            Err(failure) if retries < policy.max_retries => {
                retries += 1;
                warn!(retries, max = policy.max_retries, error = %failure.message, "run failed, retrying");
                progress
                    .note_retry(job.run_id, retries, policy.max_retries, &failure.message)
                    .await;
                tokio::time::sleep(policy.retry_delay).await;
            }
            Err(failure) => {
                error!(error = %failure.message, "run failed, giving up");
                progress.fail(job.run_id, failure.message, failure.audit).await;
                return;
            }
        }
    }
}

/// Cron trigger that queues a single-page run. `None` when disabled.
pub async fn maybe_build_scheduler(config: &SyncConfig, jobs: SyncJobs) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let mode = config.single_page(None);
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let jobs = jobs.clone();
        Box::pin(async move {
            match jobs.submit(mode).await {
                Ok(run_id) => info!(%run_id, "scheduled sync queued"),
                Err(err) => warn!(error = %err, "scheduled sync could not be queued"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env(mode: Option<SyncMode>) -> Result<SyncAuditRecord> {
    let config = SyncConfig::from_env();
    let store = CatalogStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening store {}", config.database_url))?;
    let pipeline = SyncPipeline::new(&config, store)?;
    let mode = mode.unwrap_or_else(|| config.single_page(None));
    let audit = pipeline.run(mode, &NoopProgress).await?;
    Ok(audit)
}
