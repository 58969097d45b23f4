//! Core domain model for the LinkQ website catalog.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "linkq-core";

/// Tokens that never make it into a keyword set or a query.
pub const STOP_WORDS: &[&str] = &[
    "www", "http", "https", "html", "htm", "php", "asp", "aspx", "index", "the", "and", "or",
    "of", "for", "to", "in", "on", "with",
];

/// Store-assigned listing identifier. Assigned once, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(pub i64);

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical persisted catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsiteListing {
    pub id: ListingId,
    pub url: String,
    pub email: String,
    pub price: f64,
    pub dr: Option<u8>,
    pub traffic: Option<u64>,
    pub keywords: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub enriched_at: Option<DateTime<Utc>>,
}

impl WebsiteListing {
    pub fn metrics(&self) -> DomainMetrics {
        DomainMetrics {
            dr: self.dr,
            traffic: self.traffic,
        }
    }

    pub fn is_enriched(&self) -> bool {
        !self.metrics().is_empty()
    }
}

/// Validated upsert payload handed from ingestion into the catalog store.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingDraft {
    pub url: NormalizedUrl,
    pub email: String,
    pub price: f64,
    pub keywords: BTreeSet<String>,
}

/// Enrichment field group. `dr` and `traffic` are always written together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DomainMetrics {
    pub dr: Option<u8>,
    pub traffic: Option<u64>,
}

impl DomainMetrics {
    pub fn is_empty(&self) -> bool {
        self.dr.is_none() && self.traffic.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: ListingId,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentWrite {
    Updated,
    Unchanged,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("not an absolute url: {0}")]
    Parse(#[from] url::ParseError),
    #[error("unsupported scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("url has no host")]
    MissingHost,
}

/// URL in catalog form plus the scheme-less key used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedUrl {
    url: String,
    key: String,
    host: String,
    path: String,
}

impl NormalizedUrl {
    /// Lowercases host, path and query, drops the fragment, the default port
    /// and any trailing slash. `http` and `https` variants share one key.
    pub fn parse(raw: &str) -> Result<Self, UrlError> {
        let parsed = Url::parse(raw.trim())?;
        let scheme = parsed.scheme().to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(UrlError::UnsupportedScheme(scheme));
        }
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or(UrlError::MissingHost)?
            .to_lowercase();
        let path = parsed.path().trim_end_matches('/').to_lowercase();
        let port = parsed.port().map(|p| format!(":{p}")).unwrap_or_default();
        let query = parsed
            .query()
            .filter(|q| !q.is_empty())
            .map(|q| format!("?{}", q.to_lowercase()))
            .unwrap_or_default();

        let key = format!("{host}{port}{path}{query}");
        Ok(Self {
            url: format!("{scheme}://{key}"),
            key,
            host,
            path,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for NormalizedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Lowercase, split on non-alphanumeric boundaries, drop stop words, dedupe
/// keeping first-occurrence order. Used for both listings and queries.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

pub fn keywords_for(url: &NormalizedUrl, description: Option<&str>) -> BTreeSet<String> {
    let mut keywords: BTreeSet<String> = tokenize(url.host()).into_iter().collect();
    keywords.extend(tokenize(url.path()));
    if let Some(text) = description {
        keywords.extend(tokenize(text));
    }
    keywords
}

/// Inclusive numeric bounds. A listing without `dr` (or `traffic`) fails any
/// bound on that field.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RangeFilter {
    pub min_dr: Option<u8>,
    pub max_dr: Option<u8>,
    pub min_traffic: Option<u64>,
    pub max_price: Option<f64>,
}

impl RangeFilter {
    pub fn is_unbounded(&self) -> bool {
        self.min_dr.is_none()
            && self.max_dr.is_none()
            && self.min_traffic.is_none()
            && self.max_price.is_none()
    }

    pub fn matches(&self, listing: &WebsiteListing) -> bool {
        if self.min_dr.is_some() || self.max_dr.is_some() {
            let Some(dr) = listing.dr else {
                return false;
            };
            if self.min_dr.is_some_and(|min| dr < min) || self.max_dr.is_some_and(|max| dr > max) {
                return false;
            }
        }
        if let Some(min) = self.min_traffic {
            match listing.traffic {
                Some(traffic) if traffic >= min => {}
                _ => return false,
            }
        }
        if let Some(max) = self.max_price {
            if listing.price > max {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MalformedRow,
    InvalidUrl,
    InvalidEmail,
    InvalidPrice,
    InvalidDr,
    StoreError,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MalformedRow => "malformed_row",
            RejectReason::InvalidUrl => "invalid_url",
            RejectReason::InvalidEmail => "invalid_email",
            RejectReason::InvalidPrice => "invalid_price",
            RejectReason::InvalidDr => "invalid_dr",
            RejectReason::StoreError => "store_error",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRejection {
    /// 1-based data row number (the header row is not counted).
    pub row: usize,
    pub reason: RejectReason,
    pub detail: String,
}

/// Per-upload tally returned to the uploader. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub total_rows: usize,
    pub accepted: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub rejections: Vec<RowRejection>,
}

impl ImportOutcome {
    pub fn reject(&mut self, row: usize, reason: RejectReason, detail: impl Into<String>) {
        self.rejected += 1;
        self.rejections.push(RowRejection {
            row,
            reason,
            detail: detail.into(),
        });
    }

    pub fn record_upsert(&mut self, outcome: UpsertOutcome) {
        self.accepted += 1;
        if outcome.created {
            self.created += 1;
        } else {
            self.updated += 1;
        }
    }

    pub fn reasons(&self) -> Vec<RejectReason> {
        self.rejections.iter().map(|r| r.reason).collect()
    }

    pub fn message(&self) -> String {
        format!("Processing {} websites", self.accepted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Processing,
    Completed,
}

/// Tracking record for one upload and its background enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub id: Uuid,
    pub filename: String,
    pub content_hash: String,
    pub status: ImportStatus,
    pub total_rows: usize,
    pub accepted: usize,
    pub queued: usize,
    pub enriched: usize,
    pub failed: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportRecord {
    pub fn settled(&self) -> usize {
        self.enriched + self.failed
    }
}

/// Search request as it arrives on the wire. Bounds are signed so that a
/// negative value is reported as a client error instead of a decode failure.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub keyword: String,
    pub min_dr: Option<i64>,
    pub max_dr: Option<i64>,
    pub min_traffic: Option<i64>,
    pub max_price: Option<f64>,
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn keyword(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: ListingId,
    pub url: String,
    pub email: String,
    pub price: f64,
    pub dr: Option<u8>,
    pub traffic: Option<u64>,
    pub relevance_score: f64,
    pub matching_keywords: Vec<String>,
}

impl SearchResult {
    pub fn from_listing(
        listing: &WebsiteListing,
        relevance_score: f64,
        matching_keywords: Vec<String>,
    ) -> Self {
        Self {
            id: listing.id,
            url: listing.url.clone(),
            email: listing.email.clone(),
            price: listing.price,
            dr: listing.dr,
            traffic: listing.traffic,
            relevance_score,
            matching_keywords,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl MetricSummary {
    fn from_values(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        (count > 0).then(|| Self {
            min,
            max,
            avg: sum / count as f64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogStats {
    pub total: usize,
    pub enriched: usize,
    pub dr: Option<MetricSummary>,
    pub traffic: Option<MetricSummary>,
    pub price: Option<MetricSummary>,
}

impl CatalogStats {
    pub fn from_listings<'a>(listings: impl IntoIterator<Item = &'a WebsiteListing>) -> Self {
        let listings = listings.into_iter().collect::<Vec<_>>();
        Self {
            total: listings.len(),
            enriched: listings.iter().filter(|l| l.is_enriched()).count(),
            dr: MetricSummary::from_values(listings.iter().filter_map(|l| l.dr).map(f64::from)),
            traffic: MetricSummary::from_values(
                listings.iter().filter_map(|l| l.traffic).map(|t| t as f64),
            ),
            price: MetricSummary::from_values(listings.iter().map(|l| l.price)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(id: i64, dr: Option<u8>, traffic: Option<u64>, price: f64) -> WebsiteListing {
        let now = Utc::now();
        WebsiteListing {
            id: ListingId(id),
            url: format!("http://site{id}.com"),
            email: "owner@site.com".into(),
            price,
            dr,
            traffic,
            keywords: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            enriched_at: None,
        }
    }

    #[test]
    fn normalization_collapses_case_scheme_and_trailing_slash() {
        let a = NormalizedUrl::parse("http://Example.com/Page").unwrap();
        let b = NormalizedUrl::parse("https://example.com/page/").unwrap();
        let c = NormalizedUrl::parse("  http://EXAMPLE.com:80/page#top ").unwrap();
        assert_eq!(a.key(), "example.com/page");
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key(), c.key());
        assert_eq!(a.as_str(), "http://example.com/page");
        assert_eq!(b.as_str(), "https://example.com/page");
    }

    #[test]
    fn normalization_keeps_non_default_port_and_query() {
        let url = NormalizedUrl::parse("https://Shop.io:8443/Deals/?Q=Tools").unwrap();
        assert_eq!(url.key(), "shop.io:8443/deals?q=tools");
        assert_eq!(url.host(), "shop.io");
    }

    #[test]
    fn normalization_rejects_relative_and_foreign_schemes() {
        assert!(matches!(NormalizedUrl::parse("not-a-url"), Err(UrlError::Parse(_))));
        assert_eq!(
            NormalizedUrl::parse("ftp://files.example.com/x"),
            Err(UrlError::UnsupportedScheme("ftp".into()))
        );
        assert!(NormalizedUrl::parse("mailto:someone@example.com").is_err());
    }

    #[test]
    fn url_keywords_come_from_host_and_path() {
        let url = NormalizedUrl::parse("http://a.com/seo-tools").unwrap();
        let keywords = keywords_for(&url, None);
        let expected: BTreeSet<String> = ["a", "com", "seo", "tools"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(keywords, expected);
    }

    #[test]
    fn description_extends_keywords_without_stop_words() {
        let url = NormalizedUrl::parse("https://www.garden.org/index.html").unwrap();
        let keywords = keywords_for(&url, Some("Guides for the Organic grower"));
        assert!(keywords.contains("garden"));
        assert!(keywords.contains("organic"));
        assert!(keywords.contains("grower"));
        assert!(!keywords.contains("www"));
        assert!(!keywords.contains("index"));
        assert!(!keywords.contains("the"));
    }

    #[test]
    fn tokenize_dedupes_in_first_seen_order() {
        assert_eq!(tokenize("SEO tools, seo-Tools & more"), vec!["seo", "tools", "more"]);
        assert!(tokenize("  -- / ").is_empty());
    }

    #[test]
    fn range_filter_excludes_unenriched_listings_once_bounded() {
        let unenriched = listing(1, None, None, 10.0);
        let enriched = listing(2, Some(50), Some(1000), 10.0);

        let dr_only = RangeFilter {
            max_dr: Some(90),
            ..Default::default()
        };
        assert!(!dr_only.matches(&unenriched));
        assert!(dr_only.matches(&enriched));

        let traffic = RangeFilter {
            min_traffic: Some(0),
            ..Default::default()
        };
        assert!(!traffic.matches(&unenriched));

        assert!(RangeFilter::default().matches(&unenriched));
    }

    #[test]
    fn range_filter_bounds_are_inclusive() {
        let l = listing(1, Some(50), Some(1000), 10.0);
        let exact = RangeFilter {
            min_dr: Some(50),
            max_dr: Some(50),
            min_traffic: Some(1000),
            max_price: Some(10.0),
        };
        assert!(exact.matches(&l));
        let price = RangeFilter {
            max_price: Some(9.99),
            ..Default::default()
        };
        assert!(!price.matches(&l));
    }

    #[test]
    fn outcome_tallies_and_message() {
        let mut outcome = ImportOutcome::default();
        outcome.record_upsert(UpsertOutcome {
            id: ListingId(1),
            created: true,
        });
        outcome.reject(2, RejectReason::InvalidUrl, "not-a-url");
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.reasons(), vec![RejectReason::InvalidUrl]);
        assert_eq!(outcome.message(), "Processing 1 websites");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["rejections"][0]["reason"], "invalid_url");
    }

    #[test]
    fn stats_average_only_enriched_metrics() {
        let listings = vec![
            listing(1, Some(40), Some(100), 10.0),
            listing(2, Some(60), None, 30.0),
            listing(3, None, None, 20.0),
        ];
        let stats = CatalogStats::from_listings(&listings);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.enriched, 2);
        assert_eq!(stats.dr.unwrap().avg, 50.0);
        assert_eq!(stats.traffic.unwrap().max, 100.0);
        assert_eq!(stats.price.unwrap().min, 10.0);
    }
}
