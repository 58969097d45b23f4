//! Catalog store backends, upload archive and retry timing for LinkQ.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use linkq_core::{
    CatalogStats, DomainMetrics, EnrichmentWrite, ListingDraft, ListingId, MetricSummary,
    NormalizedUrl, RangeFilter, UpsertOutcome, WebsiteListing,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "linkq-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("catalog storage unavailable: {0}")]
    Unavailable(String),
    #[error("catalog rejected write: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            other => StoreError::Rejected(other.to_string()),
        }
    }
}

/// Keyed collection of website listings shared by ingestion, enrichment and search.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert-or-update by normalized URL key. Updates touch `email`, `price`
    /// and `keywords` only.
    async fn upsert(&self, draft: ListingDraft) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, id: ListingId) -> Result<Option<WebsiteListing>, StoreError>;

    /// All listings ordered by id.
    async fn get_all(&self) -> Result<Vec<WebsiteListing>, StoreError>;

    /// Writes `dr` and `traffic` as one group. Idempotent; a stale id yields
    /// `NotFound` rather than an error.
    async fn apply_enrichment(
        &self,
        id: ListingId,
        metrics: DomainMetrics,
    ) -> Result<EnrichmentWrite, StoreError>;

    async fn range_query(&self, filter: &RangeFilter) -> Result<Vec<WebsiteListing>, StoreError> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(|listing| filter.matches(listing))
            .collect())
    }

    async fn stats(&self) -> Result<CatalogStats, StoreError> {
        Ok(CatalogStats::from_listings(&self.get_all().await?))
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn check_draft(draft: &ListingDraft) -> Result<(), StoreError> {
    if !draft.price.is_finite() || draft.price < 0.0 {
        return Err(StoreError::Rejected(format!(
            "price {} for {} must be a non-negative number",
            draft.price, draft.url
        )));
    }
    Ok(())
}

fn check_metrics(metrics: &DomainMetrics) -> Result<(), StoreError> {
    match metrics.dr {
        Some(dr) if dr > 100 => Err(StoreError::Rejected(format!("dr {dr} outside 0..=100"))),
        _ => Ok(()),
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    next_id: i64,
    listings: BTreeMap<ListingId, WebsiteListing>,
    by_key: HashMap<String, ListingId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogSnapshot {
    next_id: i64,
    listings: Vec<WebsiteListing>,
}

/// Process-local catalog. Optionally persisted to a JSON snapshot that is
/// rewritten atomically on `flush`.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
    snapshot_path: Option<PathBuf>,
    dirty: AtomicBool,
    /// Held from the dirty check through the rename so snapshots land in order.
    flush_lock: Mutex<()>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a snapshot-backed catalog, loading the snapshot when it exists.
    pub async fn open(snapshot_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let snapshot_path = snapshot_path.into();
        let mut state = CatalogState::default();

        if fs::try_exists(&snapshot_path)
            .await
            .with_context(|| format!("checking catalog snapshot {}", snapshot_path.display()))?
        {
            let bytes = fs::read(&snapshot_path)
                .await
                .with_context(|| format!("reading catalog snapshot {}", snapshot_path.display()))?;
            let snapshot: CatalogSnapshot = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing catalog snapshot {}", snapshot_path.display()))?;
            state.next_id = snapshot.next_id;
            for listing in snapshot.listings {
                let key = NormalizedUrl::parse(&listing.url)
                    .with_context(|| format!("snapshot listing {} has invalid url", listing.id))?
                    .key()
                    .to_string();
                state.next_id = state.next_id.max(listing.id.0);
                state.by_key.insert(key, listing.id);
                state.listings.insert(listing.id, listing);
            }
            info!(
                path = %snapshot_path.display(),
                listings = state.listings.len(),
                "loaded catalog snapshot"
            );
        }

        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(snapshot_path),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.listings.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn upsert(&self, draft: ListingDraft) -> Result<UpsertOutcome, StoreError> {
        check_draft(&draft)?;
        let now = Utc::now();
        let mut state = self.state.write().await;

        if let Some(id) = state.by_key.get(draft.url.key()).copied() {
            if let Some(existing) = state.listings.get_mut(&id) {
                let changed = existing.email != draft.email
                    || existing.price != draft.price
                    || existing.keywords != draft.keywords;
                if changed {
                    existing.email = draft.email;
                    existing.price = draft.price;
                    existing.keywords = draft.keywords;
                    existing.updated_at = now;
                    self.dirty.store(true, Ordering::Release);
                }
                return Ok(UpsertOutcome { id, created: false });
            }
        }

        state.next_id += 1;
        let id = ListingId(state.next_id);
        let key = draft.url.key().to_string();
        state.listings.insert(
            id,
            WebsiteListing {
                id,
                url: draft.url.as_str().to_string(),
                email: draft.email,
                price: draft.price,
                dr: None,
                traffic: None,
                keywords: draft.keywords,
                created_at: now,
                updated_at: now,
                enriched_at: None,
            },
        );
        state.by_key.insert(key, id);
        self.dirty.store(true, Ordering::Release);
        Ok(UpsertOutcome { id, created: true })
    }

    async fn get(&self, id: ListingId) -> Result<Option<WebsiteListing>, StoreError> {
        Ok(self.state.read().await.listings.get(&id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<WebsiteListing>, StoreError> {
        Ok(self.state.read().await.listings.values().cloned().collect())
    }

    async fn apply_enrichment(
        &self,
        id: ListingId,
        metrics: DomainMetrics,
    ) -> Result<EnrichmentWrite, StoreError> {
        check_metrics(&metrics)?;
        let mut state = self.state.write().await;
        let Some(listing) = state.listings.get_mut(&id) else {
            return Ok(EnrichmentWrite::NotFound);
        };
        if listing.metrics() == metrics {
            return Ok(EnrichmentWrite::Unchanged);
        }
        let now = Utc::now();
        listing.dr = metrics.dr;
        listing.traffic = metrics.traffic;
        listing.enriched_at = Some(now);
        listing.updated_at = now;
        self.dirty.store(true, Ordering::Release);
        Ok(EnrichmentWrite::Updated)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let _flushing = self.flush_lock.lock().await;
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let bytes = {
            let state = self.state.read().await;
            serde_json::to_vec_pretty(&CatalogSnapshot {
                next_id: state.next_id,
                listings: state.listings.values().cloned().collect(),
            })
            .map_err(|e| StoreError::Rejected(format!("serializing catalog snapshot: {e}")))?
        };

        if let Err(err) = write_atomic(path, &bytes).await {
            self.dirty.store(true, Ordering::Release);
            return Err(StoreError::Unavailable(format!("{err:#}")));
        }
        debug!(path = %path.display(), bytes = bytes.len(), "catalog snapshot written");
        Ok(())
    }
}

/// Write through a uniquely named temp file in the target directory, then rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(())
}

const LISTING_COLUMNS: &str =
    "id, url, email, price, dr, traffic, keywords, created_at, updated_at, enriched_at";

#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("connecting to catalog database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running catalog migrations")
    }
}

fn listing_from_row(row: &PgRow) -> Result<WebsiteListing, sqlx::Error> {
    let dr: Option<i16> = row.try_get("dr")?;
    let traffic: Option<i64> = row.try_get("traffic")?;
    let keywords: Vec<String> = row.try_get("keywords")?;
    Ok(WebsiteListing {
        id: ListingId(row.try_get("id")?),
        url: row.try_get("url")?,
        email: row.try_get("email")?,
        price: row.try_get("price")?,
        dr: dr.and_then(|v| u8::try_from(v).ok()),
        traffic: traffic.and_then(|v| u64::try_from(v).ok()),
        keywords: keywords.into_iter().collect(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        enriched_at: row.try_get("enriched_at")?,
    })
}

fn summary(min: Option<f64>, max: Option<f64>, avg: Option<f64>) -> Option<MetricSummary> {
    match (min, max, avg) {
        (Some(min), Some(max), Some(avg)) => Some(MetricSummary { min, max, avg }),
        _ => None,
    }
}

fn traffic_param(traffic: Option<u64>) -> Option<i64> {
    traffic.map(|t| i64::try_from(t).unwrap_or(i64::MAX))
}

#[async_trait]
impl CatalogStore for PgCatalog {
    async fn upsert(&self, draft: ListingDraft) -> Result<UpsertOutcome, StoreError> {
        check_draft(&draft)?;
        let keywords = draft.keywords.into_iter().collect::<Vec<_>>();
        let row = sqlx::query(
            r#"
            INSERT INTO websites (url, url_key, email, price, keywords, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (url_key) DO UPDATE
               SET email = EXCLUDED.email,
                   price = EXCLUDED.price,
                   keywords = EXCLUDED.keywords,
                   updated_at = CASE
                       WHEN (websites.email, websites.price, websites.keywords)
                            IS DISTINCT FROM (EXCLUDED.email, EXCLUDED.price, EXCLUDED.keywords)
                       THEN EXCLUDED.updated_at
                       ELSE websites.updated_at
                   END
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(draft.url.as_str())
        .bind(draft.url.key())
        .bind(&draft.email)
        .bind(draft.price)
        .bind(&keywords)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(UpsertOutcome {
            id: ListingId(row.try_get("id")?),
            created: row.try_get("inserted")?,
        })
    }

    async fn get(&self, id: ListingId) -> Result<Option<WebsiteListing>, StoreError> {
        let row = sqlx::query(&format!("SELECT {LISTING_COLUMNS} FROM websites WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(listing_from_row).transpose()?)
    }

    async fn get_all(&self) -> Result<Vec<WebsiteListing>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {LISTING_COLUMNS} FROM websites ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(listing_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn apply_enrichment(
        &self,
        id: ListingId,
        metrics: DomainMetrics,
    ) -> Result<EnrichmentWrite, StoreError> {
        check_metrics(&metrics)?;
        let dr = metrics.dr.map(i16::from);
        let traffic = traffic_param(metrics.traffic);
        let result = sqlx::query(
            r#"
            UPDATE websites
               SET dr = $2, traffic = $3, enriched_at = $4, updated_at = $4
             WHERE id = $1
               AND (dr IS DISTINCT FROM $2 OR traffic IS DISTINCT FROM $3)
            "#,
        )
        .bind(id.0)
        .bind(dr)
        .bind(traffic)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(EnrichmentWrite::Updated);
        }

        let exists: bool =
            sqlx::query("SELECT EXISTS (SELECT 1 FROM websites WHERE id = $1) AS found")
                .bind(id.0)
                .fetch_one(&self.pool)
                .await?
                .try_get("found")?;
        Ok(if exists {
            EnrichmentWrite::Unchanged
        } else {
            EnrichmentWrite::NotFound
        })
    }

    async fn range_query(&self, filter: &RangeFilter) -> Result<Vec<WebsiteListing>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {LISTING_COLUMNS}
              FROM websites
             WHERE ($1::SMALLINT IS NULL OR dr >= $1)
               AND ($2::SMALLINT IS NULL OR dr <= $2)
               AND ($3::BIGINT IS NULL OR traffic >= $3)
               AND ($4::DOUBLE PRECISION IS NULL OR price <= $4)
             ORDER BY id
            "#
        ))
        .bind(filter.min_dr.map(i16::from))
        .bind(filter.max_dr.map(i16::from))
        .bind(traffic_param(filter.min_traffic))
        .bind(filter.max_price)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(listing_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn stats(&self) -> Result<CatalogStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE dr IS NOT NULL OR traffic IS NOT NULL) AS enriched,
                   MIN(dr)::DOUBLE PRECISION AS dr_min,
                   MAX(dr)::DOUBLE PRECISION AS dr_max,
                   AVG(dr)::DOUBLE PRECISION AS dr_avg,
                   MIN(traffic)::DOUBLE PRECISION AS traffic_min,
                   MAX(traffic)::DOUBLE PRECISION AS traffic_max,
                   AVG(traffic)::DOUBLE PRECISION AS traffic_avg,
                   MIN(price) AS price_min,
                   MAX(price) AS price_max,
                   AVG(price) AS price_avg
              FROM websites
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.try_get("total")?;
        let enriched: i64 = row.try_get("enriched")?;
        Ok(CatalogStats {
            total: total as usize,
            enriched: enriched as usize,
            dr: summary(row.try_get("dr_min")?, row.try_get("dr_max")?, row.try_get("dr_avg")?),
            traffic: summary(
                row.try_get("traffic_min")?,
                row.try_get("traffic_max")?,
                row.try_get("traffic_avg")?,
            ),
            price: summary(
                row.try_get("price_min")?,
                row.try_get("price_max")?,
                row.try_get("price_avg")?,
            ),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedUpload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw CSV uploads. Re-uploading identical bytes
/// on the same day reuses the existing file.
#[derive(Debug, Clone)]
pub struct UploadArchive {
    root: PathBuf,
}

impl UploadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn upload_relative_path(&self, received_at: DateTime<Utc>, content_hash: &str) -> PathBuf {
        PathBuf::from(received_at.format("%Y%m%d").to_string()).join(format!("{content_hash}.csv"))
    }

    pub async fn archive(
        &self,
        received_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedUpload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.upload_relative_path(received_at, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking upload path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(ArchivedUpload {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Exponential, capped delay between enrichment attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the failed attempt with the given 0-based index.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkq_core::keywords_for;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn draft(url: &str, email: &str, price: f64) -> ListingDraft {
        let url = NormalizedUrl::parse(url).expect("valid url");
        let keywords = keywords_for(&url, None);
        ListingDraft {
            url,
            email: email.to_string(),
            price,
            keywords,
        }
    }

    #[tokio::test]
    async fn upsert_creates_then_updates_by_normalized_key() {
        let store = MemoryCatalog::new();
        let first = store
            .upsert(draft("http://Example.com/Page", "a@x.com", 10.0))
            .await
            .unwrap();
        let second = store
            .upsert(draft("https://example.com/page/", "b@x.com", 12.5))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.len().await, 1);

        let listing = store.get(first.id).await.unwrap().unwrap();
        assert_eq!(listing.url, "http://example.com/page");
        assert_eq!(listing.email, "b@x.com");
        assert_eq!(listing.price, 12.5);
    }

    #[tokio::test]
    async fn upsert_never_touches_identity_or_enrichment_fields() {
        let store = MemoryCatalog::new();
        let created = store.upsert(draft("http://a.com/seo-tools", "a@x.com", 10.0)).await.unwrap();
        store
            .apply_enrichment(
                created.id,
                DomainMetrics {
                    dr: Some(50),
                    traffic: Some(1000),
                },
            )
            .await
            .unwrap();
        let before = store.get(created.id).await.unwrap().unwrap();

        store.upsert(draft("http://a.com/seo-tools", "new@x.com", 10.0)).await.unwrap();
        let after = store.get(created.id).await.unwrap().unwrap();

        assert_eq!(after.email, "new@x.com");
        assert_eq!(after.id, before.id);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.dr, Some(50));
        assert_eq!(after.traffic, Some(1000));
    }

    #[tokio::test]
    async fn ids_are_sequential_and_never_reused() {
        let store = MemoryCatalog::new();
        let a = store.upsert(draft("http://a.com", "a@x.com", 1.0)).await.unwrap();
        let b = store.upsert(draft("http://b.com", "b@x.com", 1.0)).await.unwrap();
        let a_again = store.upsert(draft("http://a.com", "a@x.com", 2.0)).await.unwrap();
        assert_eq!(a.id, ListingId(1));
        assert_eq!(b.id, ListingId(2));
        assert_eq!(a_again.id, a.id);
    }

    #[tokio::test]
    async fn enrichment_is_idempotent_and_tolerates_stale_ids() {
        let store = MemoryCatalog::new();
        let created = store.upsert(draft("http://a.com", "a@x.com", 1.0)).await.unwrap();
        let metrics = DomainMetrics {
            dr: Some(40),
            traffic: Some(10),
        };

        assert_eq!(
            store.apply_enrichment(created.id, metrics).await.unwrap(),
            EnrichmentWrite::Updated
        );
        assert_eq!(
            store.apply_enrichment(created.id, metrics).await.unwrap(),
            EnrichmentWrite::Unchanged
        );
        assert_eq!(
            store.apply_enrichment(ListingId(999), metrics).await.unwrap(),
            EnrichmentWrite::NotFound
        );
    }

    #[tokio::test]
    async fn invalid_values_are_rejected_by_the_store() {
        let store = MemoryCatalog::new();
        let err = store.upsert(draft("http://a.com", "a@x.com", -1.0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));

        let created = store.upsert(draft("http://a.com", "a@x.com", 1.0)).await.unwrap();
        let err = store
            .apply_enrichment(
                created.id,
                DomainMetrics {
                    dr: Some(101),
                    traffic: None,
                },
            )
            .await
            .unwrap_err();
        assert!(!err.is_unavailable());
    }

    #[tokio::test]
    async fn range_query_applies_null_exclusion() {
        let store = MemoryCatalog::new();
        let a = store.upsert(draft("http://a.com", "a@x.com", 5.0)).await.unwrap();
        store.upsert(draft("http://b.com", "b@x.com", 5.0)).await.unwrap();
        store
            .apply_enrichment(
                a.id,
                DomainMetrics {
                    dr: Some(70),
                    traffic: Some(5),
                },
            )
            .await
            .unwrap();

        let filter = RangeFilter {
            min_dr: Some(10),
            ..Default::default()
        };
        let hits = store.range_query(&filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, a.id);
        assert_eq!(store.range_query(&RangeFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_upserts_of_one_url_converge_on_a_single_listing() {
        let store = Arc::new(MemoryCatalog::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert(draft("http://same.com/page", &format!("u{i}@x.com"), i as f64))
                    .await
                    .unwrap()
            }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_flush_and_open() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("catalog.json");

        let store = MemoryCatalog::open(&path).await.unwrap();
        let created = store.upsert(draft("http://a.com/seo", "a@x.com", 3.0)).await.unwrap();
        store
            .apply_enrichment(
                created.id,
                DomainMetrics {
                    dr: Some(12),
                    traffic: None,
                },
            )
            .await
            .unwrap();
        store.flush().await.unwrap();
        assert!(path.exists());

        let reopened = MemoryCatalog::open(&path).await.unwrap();
        let listing = reopened.get(created.id).await.unwrap().unwrap();
        assert_eq!(listing.dr, Some(12));
        assert!(listing.keywords.contains("seo"));

        let next = reopened.upsert(draft("http://b.com", "b@x.com", 1.0)).await.unwrap();
        assert_eq!(next.id, ListingId(2));
        let same = reopened.upsert(draft("https://A.com/seo/", "a@x.com", 3.0)).await.unwrap();
        assert!(!same.created);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_flushes_leave_the_latest_state_on_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        let store = Arc::new(MemoryCatalog::open(&path).await.unwrap());

        let mut handles = Vec::new();
        for worker in 0..6 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    let url = format!("http://w{worker}-{i}.com");
                    store.upsert(draft(&url, "a@x.com", 1.0)).await.unwrap();
                    store.flush().await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        store.flush().await.unwrap();

        let reopened = MemoryCatalog::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 300);
        assert_eq!(
            reopened.get_all().await.unwrap(),
            store.get_all().await.unwrap()
        );
    }

    #[tokio::test]
    async fn unwritable_snapshot_reports_unavailable() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("sub");
        let store = MemoryCatalog::open(blocker.join("catalog.json")).await.unwrap();
        std::fs::write(&blocker, b"not a directory").unwrap();

        store.upsert(draft("http://a.com", "a@x.com", 1.0)).await.unwrap();

        let err = store.flush().await.unwrap_err();
        assert!(err.is_unavailable());
        // Still dirty, so a later flush retries the write.
        assert!(store.flush().await.is_err());
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_uploads() {
        let dir = tempdir().expect("tempdir");
        let archive = UploadArchive::new(dir.path());
        let received_at = DateTime::parse_from_rfc3339("2026-10-18T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive.archive(received_at, b"url,email,price\n").await.unwrap();
        let second = archive.archive(received_at, b"url,email,price\n").await.unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20261018"));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn upload_hashing_is_stable() {
        assert_eq!(
            UploadArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL pointing at a disposable PostgreSQL database
    async fn pg_catalog_upsert_and_enrichment() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let store = PgCatalog::connect(&url).await.unwrap();
        store.migrate().await.unwrap();

        let suffix = Uuid::new_v4().simple().to_string();
        let page = format!("http://pg-{suffix}.com/seo-tools");
        let first = store.upsert(draft(&page, "a@x.com", 10.0)).await.unwrap();
        let second = store.upsert(draft(&page.to_uppercase(), "b@x.com", 10.0)).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);

        let metrics = DomainMetrics {
            dr: Some(50),
            traffic: Some(1000),
        };
        assert_eq!(
            store.apply_enrichment(first.id, metrics).await.unwrap(),
            EnrichmentWrite::Updated
        );
        assert_eq!(
            store.apply_enrichment(first.id, metrics).await.unwrap(),
            EnrichmentWrite::Unchanged
        );

        let hits = store
            .range_query(&RangeFilter {
                min_dr: Some(50),
                max_dr: Some(50),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(hits.iter().any(|l| l.id == first.id));
    }
}
