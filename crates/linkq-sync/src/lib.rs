//! CSV import orchestration, background enrichment and runtime wiring.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use linkq_adapters::{
    read_listing_csv, AhrefsConfig, AhrefsProvider, CsvError, DisabledProvider,
    EnrichmentProvider,
};
use linkq_core::{
    EnrichmentWrite, ImportOutcome, ImportRecord, ImportStatus, ListingId, NormalizedUrl,
    RejectReason,
};
use linkq_search::SearchEngine;
use linkq_storage::{
    BackoffPolicy, CatalogStore, MemoryCatalog, PgCatalog, StoreError, UploadArchive,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "linkq-sync";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub catalog_snapshot: PathBuf,
    pub uploads_dir: Option<PathBuf>,
    pub ahrefs_api_key: Option<String>,
    pub ahrefs_base_url: String,
    pub enrich_concurrency: usize,
    pub enrich_max_attempts: usize,
    pub enrich_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub web_port: u16,
    pub max_upload_bytes: usize,
    pub user_agent: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str, default| parse_or(text(key), default);

        Self {
            database_url: text("DATABASE_URL"),
            catalog_snapshot: text("LINKQ_CATALOG_SNAPSHOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/catalog.json")),
            uploads_dir: text("LINKQ_UPLOADS_DIR").map(PathBuf::from),
            ahrefs_api_key: text("AHREFS_API_KEY"),
            ahrefs_base_url: text("AHREFS_BASE_URL")
                .unwrap_or_else(|| AhrefsConfig::DEFAULT_BASE_URL.to_string()),
            enrich_concurrency: number("LINKQ_ENRICH_CONCURRENCY", 4u64) as usize,
            enrich_max_attempts: number("LINKQ_ENRICH_MAX_ATTEMPTS", 3) as usize,
            enrich_timeout_secs: number("LINKQ_ENRICH_TIMEOUT_SECS", 20),
            backoff_base_ms: number("LINKQ_BACKOFF_BASE_MS", 500),
            backoff_max_ms: number("LINKQ_BACKOFF_MAX_MS", 8_000),
            web_port: parse_or(text("LINKQ_WEB_PORT"), 8000u16),
            max_upload_bytes: number("LINKQ_MAX_UPLOAD_BYTES", 10 * 1024 * 1024) as usize,
            user_agent: text("LINKQ_USER_AGENT").unwrap_or_else(|| "linkq/0.1".to_string()),
        }
    }

    pub fn enrichment(&self) -> EnrichmentConfig {
        EnrichmentConfig {
            concurrency: self.enrich_concurrency.max(1),
            attempt_timeout: Duration::from_secs(self.enrich_timeout_secs.max(1)),
            backoff: BackoffPolicy {
                max_attempts: self.enrich_max_attempts.max(1),
                base_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            },
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Keeps the first character of the local part, enough to correlate log lines.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().map(String::from).unwrap_or_default();
            format!("{first}***@{domain}")
        }
        None => "***".to_string(),
    }
}

pub const DEFAULT_TRACKED_IMPORTS: usize = 1_000;

#[derive(Debug, Default)]
struct ImportLog {
    records: HashMap<Uuid, ImportRecord>,
    order: Vec<Uuid>,
}

impl ImportLog {
    /// Drop the oldest completed records until at most `capacity` remain.
    /// Imports still processing are never evicted.
    fn evict_completed(&mut self, capacity: usize) {
        while self.order.len() > capacity {
            let Some(pos) = self.order.iter().position(|id| {
                self.records
                    .get(id)
                    .is_some_and(|r| r.status == ImportStatus::Completed)
            }) else {
                return;
            };
            let id = self.order.remove(pos);
            self.records.remove(&id);
        }
    }
}

/// In-process registry of uploads and their enrichment progress, holding at
/// most `capacity` records once older imports have completed.
#[derive(Debug, Clone)]
pub struct ImportTracker {
    log: Arc<RwLock<ImportLog>>,
    capacity: usize,
}

impl Default for ImportTracker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TRACKED_IMPORTS)
    }
}

impl ImportTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            log: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    pub async fn begin(
        &self,
        filename: &str,
        content_hash: &str,
        outcome: &ImportOutcome,
        queued: usize,
    ) -> ImportRecord {
        let now = Utc::now();
        let record = ImportRecord {
            id: Uuid::new_v4(),
            filename: filename.to_string(),
            content_hash: content_hash.to_string(),
            status: if queued == 0 {
                ImportStatus::Completed
            } else {
                ImportStatus::Processing
            },
            total_rows: outcome.total_rows,
            accepted: outcome.accepted,
            queued,
            enriched: 0,
            failed: 0,
            created_at: now,
            completed_at: (queued == 0).then_some(now),
        };

        let mut log = self.log.write().await;
        log.order.push(record.id);
        log.records.insert(record.id, record.clone());
        log.evict_completed(self.capacity);
        record
    }

    /// Count one queued listing as settled. Returns `true` when this settles
    /// the whole import.
    pub async fn settle(&self, import_id: Uuid, enriched: bool) -> bool {
        let mut log = self.log.write().await;
        let Some(record) = log.records.get_mut(&import_id) else {
            return false;
        };
        if record.status == ImportStatus::Completed {
            return false;
        }
        if enriched {
            record.enriched += 1;
        } else {
            record.failed += 1;
        }
        if record.settled() >= record.queued {
            record.status = ImportStatus::Completed;
            record.completed_at = Some(Utc::now());
            return true;
        }
        false
    }

    pub async fn get(&self, import_id: Uuid) -> Option<ImportRecord> {
        self.log.read().await.records.get(&import_id).cloned()
    }

    /// Newest first.
    pub async fn recent(&self, limit: usize) -> Vec<ImportRecord> {
        let log = self.log.read().await;
        log.order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| log.records.get(id).cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.log.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnrichmentConfig {
    pub concurrency: usize,
    pub attempt_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        AppConfig::default().enrichment()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentJob {
    pub listing_id: ListingId,
    pub import_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Applied(EnrichmentWrite),
    /// Every attempt came back empty, timed out or failed transiently.
    Exhausted { attempts: usize, last_error: String },
    /// A non-retryable provider or store error ended the job early.
    Aborted { attempts: usize, error: String },
    Cancelled,
}

impl JobOutcome {
    pub fn is_enriched(&self) -> bool {
        matches!(
            self,
            JobOutcome::Applied(EnrichmentWrite::Updated | EnrichmentWrite::Unchanged)
        )
    }
}

struct SchedulerInner {
    store: Arc<dyn CatalogStore>,
    provider: Arc<dyn EnrichmentProvider>,
    tracker: ImportTracker,
    config: EnrichmentConfig,
    limiter: Arc<Semaphore>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

/// Bounded pool of background enrichment tasks.
#[derive(Clone)]
pub struct EnrichmentScheduler {
    inner: Arc<SchedulerInner>,
}

impl EnrichmentScheduler {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        provider: Arc<dyn EnrichmentProvider>,
        tracker: ImportTracker,
        config: EnrichmentConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                provider,
                tracker,
                limiter: Arc::new(Semaphore::new(config.concurrency.max(1))),
                config,
                tasks: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Returns `None` once shutdown has begun.
    pub fn enqueue(&self, job: EnrichmentJob) -> Option<JoinHandle<JobOutcome>> {
        if self.is_shutting_down() {
            return None;
        }
        let inner = self.inner.clone();
        let span = info_span!(
            "enrich_listing",
            listing_id = %job.listing_id,
            provider = inner.provider.name()
        );
        Some(self.inner.tasks.spawn(
            async move {
                let outcome = inner.run(job.listing_id).await;
                inner.report(job, &outcome).await;
                outcome
            }
            .instrument(span),
        ))
    }

    pub fn in_flight(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Wait until every task spawned so far has finished.
    pub async fn wait_idle(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        if !self.is_shutting_down() {
            self.inner.tasks.reopen();
        }
    }

    /// Cancel outstanding work and wait for every task to observe it.
    pub async fn shutdown(&self) {
        info!(in_flight = self.in_flight(), "stopping enrichment workers");
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

impl SchedulerInner {
    async fn run(&self, listing_id: ListingId) -> JobOutcome {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return JobOutcome::Cancelled,
            permit = self.limiter.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return JobOutcome::Cancelled,
            },
        };

        let listing = match self.store.get(listing_id).await {
            Ok(Some(listing)) => listing,
            Ok(None) => return JobOutcome::Applied(EnrichmentWrite::NotFound),
            Err(err) => {
                return JobOutcome::Aborted {
                    attempts: 0,
                    error: err.to_string(),
                }
            }
        };
        let url = match NormalizedUrl::parse(&listing.url) {
            Ok(url) => url,
            Err(err) => {
                return JobOutcome::Aborted {
                    attempts: 0,
                    error: err.to_string(),
                }
            }
        };

        let backoff = self.config.backoff;
        let mut last_error = String::new();
        for attempt in 0..backoff.max_attempts {
            let attempt_lookup =
                tokio::time::timeout(self.config.attempt_timeout, self.provider.lookup(&url));
            let lookup = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return JobOutcome::Cancelled,
                result = attempt_lookup => result,
            };

            match lookup {
                Ok(Ok(Some(metrics))) => {
                    if self.cancel.is_cancelled() {
                        return JobOutcome::Cancelled;
                    }
                    return match self.store.apply_enrichment(listing_id, metrics).await {
                        Ok(write) => JobOutcome::Applied(write),
                        Err(err) => JobOutcome::Aborted {
                            attempts: attempt + 1,
                            error: err.to_string(),
                        },
                    };
                }
                Ok(Ok(None)) => last_error = "no metrics for domain".to_string(),
                Ok(Err(err)) if !err.is_retryable() => {
                    return JobOutcome::Aborted {
                        attempts: attempt + 1,
                        error: err.to_string(),
                    }
                }
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => {
                    last_error = format!(
                        "lookup timed out after {:?}",
                        self.config.attempt_timeout
                    )
                }
            }

            if attempt + 1 < backoff.max_attempts {
                let delay = backoff.delay_for_attempt(attempt);
                debug!(attempt = attempt + 1, ?delay, error = %last_error, "retrying enrichment");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return JobOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        JobOutcome::Exhausted {
            attempts: backoff.max_attempts,
            last_error,
        }
    }

    async fn report(&self, job: EnrichmentJob, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Applied(write) => debug!(?write, "enrichment applied"),
            JobOutcome::Exhausted {
                attempts,
                last_error,
            } => warn!(
                attempts,
                error = %last_error,
                "enrichment exhausted; listing stays unenriched"
            ),
            JobOutcome::Aborted { attempts, error } => {
                warn!(attempts, %error, "enrichment aborted; listing stays unenriched")
            }
            JobOutcome::Cancelled => debug!("enrichment cancelled"),
        }

        let Some(import_id) = job.import_id else {
            return;
        };
        if self.tracker.settle(import_id, outcome.is_enriched()).await {
            info!(%import_id, "import enrichment completed");
            if let Err(err) = self.store.flush().await {
                warn!(error = %err, "catalog flush after import failed");
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Csv(#[from] CsvError),
    #[error("catalog unavailable: {0}")]
    StoreUnavailable(StoreError),
    #[error("archiving upload failed: {0}")]
    Archive(String),
}

impl ImportError {
    pub fn tag(&self) -> &'static str {
        match self {
            ImportError::Csv(err) => err.tag(),
            ImportError::StoreUnavailable(_) => "store_unavailable",
            ImportError::Archive(_) => "archive_failed",
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, ImportError::Csv(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReceipt {
    pub import_id: Uuid,
    pub outcome: ImportOutcome,
    pub queued: usize,
}

/// Synchronous half of an upload: decode, validate, dedupe and upsert, then
/// hand unenriched listings to the scheduler.
#[derive(Clone)]
pub struct ImportPipeline {
    store: Arc<dyn CatalogStore>,
    scheduler: EnrichmentScheduler,
    tracker: ImportTracker,
    archive: Option<UploadArchive>,
}

impl ImportPipeline {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        scheduler: EnrichmentScheduler,
        tracker: ImportTracker,
    ) -> Self {
        Self {
            store,
            scheduler,
            tracker,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: UploadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub async fn import(&self, filename: &str, bytes: &[u8]) -> Result<ImportReceipt, ImportError> {
        let upload = read_listing_csv(filename, bytes)?;
        let content_hash = UploadArchive::sha256_hex(bytes);
        if let Some(archive) = &self.archive {
            let archived = archive
                .archive(Utc::now(), bytes)
                .await
                .map_err(|err| ImportError::Archive(format!("{err:#}")))?;
            debug!(
                path = %archived.relative_path.display(),
                deduplicated = archived.deduplicated,
                "upload archived"
            );
        }

        let span = info_span!("csv_import", filename, rows = upload.rows.len());
        async {
            let mut last_row_for_key = HashMap::new();
            for (index, row) in upload.rows.iter().enumerate() {
                if let Ok(valid) = &row.result {
                    last_row_for_key.insert(valid.draft.url.key().to_string(), index);
                }
            }

            let mut outcome = ImportOutcome {
                total_rows: upload.rows.len(),
                ..Default::default()
            };
            let mut pending = Vec::new();

            for (index, row) in upload.rows.into_iter().enumerate() {
                let valid = match row.result {
                    Ok(valid) => valid,
                    Err(err) => {
                        outcome.reject(row.row, err.reason, err.detail);
                        continue;
                    }
                };
                if last_row_for_key.get(valid.draft.url.key()) != Some(&index) {
                    outcome.skipped += 1;
                    continue;
                }

                let url = valid.draft.url.to_string();
                let email = mask_email(&valid.draft.email);
                let upserted = match self.store.upsert(valid.draft).await {
                    Ok(upserted) => upserted,
                    Err(err) if err.is_unavailable() => {
                        return Err(ImportError::StoreUnavailable(err))
                    }
                    Err(err) => {
                        debug!(
                            row = row.row,
                            %url,
                            %email,
                            error = %err,
                            "row rejected by catalog"
                        );
                        outcome.reject(row.row, RejectReason::StoreError, err.to_string());
                        continue;
                    }
                };
                outcome.record_upsert(upserted);

                match valid.inline_metrics {
                    None => pending.push(upserted.id),
                    Some(metrics) => match self.store.apply_enrichment(upserted.id, metrics).await {
                        Ok(_) => {}
                        Err(err) if err.is_unavailable() => {
                            return Err(ImportError::StoreUnavailable(err))
                        }
                        Err(err) => {
                            warn!(row = row.row, %url, error = %err, "inline metrics not applied");
                        }
                    },
                }
            }

            match self.store.flush().await {
                Ok(()) => {}
                Err(err) if err.is_unavailable() => return Err(ImportError::StoreUnavailable(err)),
                Err(err) => warn!(error = %err, "catalog flush after import failed"),
            }

            let record = self
                .tracker
                .begin(filename, &content_hash, &outcome, pending.len())
                .await;
            for listing_id in &pending {
                let job = EnrichmentJob {
                    listing_id: *listing_id,
                    import_id: Some(record.id),
                };
                if self.scheduler.enqueue(job).is_none() {
                    self.tracker.settle(record.id, false).await;
                }
            }

            info!(
                import_id = %record.id,
                accepted = outcome.accepted,
                created = outcome.created,
                updated = outcome.updated,
                skipped = outcome.skipped,
                rejected = outcome.rejected,
                queued = pending.len(),
                "import processed"
            );

            Ok::<_, ImportError>(ImportReceipt {
                import_id: record.id,
                queued: pending.len(),
                outcome,
            })
        }
        .instrument(span)
        .await
    }
}

pub async fn open_catalog(config: &AppConfig) -> Result<Arc<dyn CatalogStore>> {
    match &config.database_url {
        Some(url) => {
            let catalog = PgCatalog::connect(url).await?;
            catalog.migrate().await?;
            info!("using PostgreSQL catalog");
            Ok(Arc::new(catalog))
        }
        None => {
            let catalog = MemoryCatalog::open(&config.catalog_snapshot)
                .await
                .with_context(|| {
                    format!("opening catalog snapshot {}", config.catalog_snapshot.display())
                })?;
            info!(snapshot = %config.catalog_snapshot.display(), "using in-memory catalog");
            Ok(Arc::new(catalog))
        }
    }
}

pub fn build_provider(config: &AppConfig) -> Result<Arc<dyn EnrichmentProvider>> {
    let Some(api_key) = &config.ahrefs_api_key else {
        warn!("AHREFS_API_KEY not set; listings will not be enriched");
        return Ok(Arc::new(DisabledProvider));
    };
    let provider = AhrefsProvider::new(AhrefsConfig {
        base_url: config.ahrefs_base_url.clone(),
        api_key: api_key.clone(),
        timeout: Duration::from_secs(config.enrich_timeout_secs.max(1)),
        user_agent: Some(config.user_agent.clone()),
    })?;
    Ok(Arc::new(provider))
}

/// Every long-lived component, constructed once and shared.
#[derive(Clone)]
pub struct Runtime {
    pub config: AppConfig,
    pub store: Arc<dyn CatalogStore>,
    pub tracker: ImportTracker,
    pub scheduler: EnrichmentScheduler,
    pub pipeline: ImportPipeline,
    pub search: SearchEngine,
}

impl Runtime {
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let store = open_catalog(&config).await?;
        let provider = build_provider(&config)?;
        Ok(Self::with_parts(config, store, provider))
    }

    pub fn with_parts(
        config: AppConfig,
        store: Arc<dyn CatalogStore>,
        provider: Arc<dyn EnrichmentProvider>,
    ) -> Self {
        let tracker = ImportTracker::new();
        let scheduler =
            EnrichmentScheduler::new(store.clone(), provider, tracker.clone(), config.enrichment());
        let mut pipeline = ImportPipeline::new(store.clone(), scheduler.clone(), tracker.clone());
        if let Some(dir) = &config.uploads_dir {
            pipeline = pipeline.with_archive(UploadArchive::new(dir.clone()));
        }
        let search = SearchEngine::new(store.clone());
        Self {
            config,
            store,
            tracker,
            scheduler,
            pipeline,
            search,
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown().await;
        self.store
            .flush()
            .await
            .context("flushing catalog on shutdown")
    }
}
