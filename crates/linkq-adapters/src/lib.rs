//! Inbound and outbound adapters: CSV listing uploads and domain metric providers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use csv::{ByteRecord, ReaderBuilder, Trim};
use linkq_core::{keywords_for, DomainMetrics, ListingDraft, NormalizedUrl, RejectReason};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "linkq-adapters";

pub const REQUIRED_COLUMNS: &[&str] = &["url", "email", "price"];

/// Request-level upload failures. Row-level problems never surface here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CsvError {
    #[error("`{0}` is not a .csv file")]
    NotCsv(String),
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("unreadable csv header: {0}")]
    Unreadable(String),
}

impl CsvError {
    pub fn tag(&self) -> &'static str {
        match self {
            CsvError::NotCsv(_) => "not_csv",
            CsvError::MissingColumns(_) => "missing_columns",
            CsvError::Unreadable(_) => "malformed_csv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub reason: RejectReason,
    pub detail: String,
}

impl RowError {
    fn new(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    fn malformed(detail: impl Into<String>) -> Self {
        Self::new(RejectReason::MalformedRow, detail)
    }
}

/// A row that passed decoding and validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidRow {
    pub draft: ListingDraft,
    /// Present when the row carried its own `dr` or `traffic`.
    pub inline_metrics: Option<DomainMetrics>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    /// 1-based data row number.
    pub row: usize,
    pub result: Result<ValidRow, RowError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CsvUpload {
    pub filename: String,
    pub columns: ColumnMap,
    pub rows: Vec<ParsedRow>,
}

/// Header positions, resolved case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMap {
    pub url: usize,
    pub email: usize,
    pub price: usize,
    pub dr: Option<usize>,
    pub traffic: Option<usize>,
    pub description: Option<usize>,
    pub width: usize,
}

impl ColumnMap {
    pub fn from_headers<S: AsRef<str>>(headers: &[S]) -> Result<Self, CsvError> {
        let names = headers
            .iter()
            .map(|h| h.as_ref().trim().to_ascii_lowercase())
            .collect::<Vec<_>>();
        let position = |name: &str| names.iter().position(|h| h == name);

        let missing = REQUIRED_COLUMNS
            .iter()
            .filter(|name| position(name).is_none())
            .map(|name| name.to_string())
            .collect::<Vec<_>>();

        match (position("url"), position("email"), position("price")) {
            (Some(url), Some(email), Some(price)) => Ok(Self {
                url,
                email,
                price,
                dr: position("dr"),
                traffic: position("traffic"),
                description: position("description"),
                width: names.len(),
            }),
            _ => Err(CsvError::MissingColumns(missing)),
        }
    }

    fn required_width(&self) -> usize {
        self.url.max(self.email).max(self.price) + 1
    }

    fn decode(&self, record: &ByteRecord) -> Result<RawRow, RowError> {
        if record.len() > self.width {
            return Err(RowError::malformed(format!(
                "expected at most {} fields, found {}",
                self.width,
                record.len()
            )));
        }
        if record.len() < self.required_width() {
            return Err(RowError::malformed(format!(
                "expected {} fields, found {}",
                self.width,
                record.len()
            )));
        }

        let url = text_field(record, Some(self.url), "url")?.unwrap_or_default();
        let email = text_field(record, Some(self.email), "email")?.unwrap_or_default();
        let price = match text_field(record, Some(self.price), "price")? {
            None => return Err(RowError::malformed("price is empty")),
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|_| RowError::malformed(format!("price `{raw}` is not a number")))?,
        };
        let dr = text_field(record, self.dr, "dr")?
            .map(|raw| {
                raw.parse::<i64>()
                    .map_err(|_| RowError::malformed(format!("dr `{raw}` is not an integer")))
            })
            .transpose()?;
        let traffic = text_field(record, self.traffic, "traffic")?
            .map(|raw| {
                raw.parse::<u64>().map_err(|_| {
                    RowError::malformed(format!("traffic `{raw}` is not a non-negative integer"))
                })
            })
            .transpose()?;
        let description = text_field(record, self.description, "description")?;

        Ok(RawRow {
            url,
            email,
            price,
            dr,
            traffic,
            description,
        })
    }
}

#[derive(Debug)]
struct RawRow {
    url: String,
    email: String,
    price: f64,
    dr: Option<i64>,
    traffic: Option<u64>,
    description: Option<String>,
}

impl RawRow {
    fn validate(self) -> Result<ValidRow, RowError> {
        let url = NormalizedUrl::parse(&self.url).map_err(|err| {
            RowError::new(RejectReason::InvalidUrl, format!("`{}`: {err}", self.url))
        })?;
        if !is_valid_email(&self.email) {
            return Err(RowError::new(
                RejectReason::InvalidEmail,
                format!("`{}` is not a valid email address", self.email),
            ));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(RowError::new(
                RejectReason::InvalidPrice,
                format!("price {} must be a non-negative number", self.price),
            ));
        }
        let dr = match self.dr {
            None => None,
            Some(dr) => Some(u8::try_from(dr).ok().filter(|dr| *dr <= 100).ok_or_else(|| {
                RowError::new(RejectReason::InvalidDr, format!("dr {dr} outside 0..=100"))
            })?),
        };

        let inline_metrics = DomainMetrics {
            dr,
            traffic: self.traffic,
        };
        let keywords = keywords_for(&url, self.description.as_deref());
        Ok(ValidRow {
            draft: ListingDraft {
                url,
                email: self.email,
                price: self.price,
                keywords,
            },
            inline_metrics: (!inline_metrics.is_empty()).then_some(inline_metrics),
        })
    }
}

fn text_field(
    record: &ByteRecord,
    index: Option<usize>,
    name: &str,
) -> Result<Option<String>, RowError> {
    let Some(bytes) = index.and_then(|i| record.get(i)) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(bytes)
        .map_err(|_| RowError::malformed(format!("column `{name}` is not valid UTF-8")))?;
    Ok(text_or_none(text))
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Exactly one `@` with a non-empty local part and domain.
pub fn is_valid_email(email: &str) -> bool {
    let mut parts = email.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty() && !domain.is_empty() && !email.chars().any(char::is_whitespace)
        }
        _ => false,
    }
}

pub fn is_csv_filename(filename: &str) -> bool {
    filename.to_ascii_lowercase().ends_with(".csv")
}

/// Decode and validate an uploaded listing file. Only request-level problems
/// are returned as `Err`; every data row yields a `ParsedRow`.
pub fn read_listing_csv(filename: &str, bytes: &[u8]) -> Result<CsvUpload, CsvError> {
    if !is_csv_filename(filename) {
        return Err(CsvError::NotCsv(filename.to_string()));
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(bytes);

    let headers = reader
        .byte_headers()
        .map_err(|err| CsvError::Unreadable(err.to_string()))?
        .iter()
        .map(|h| String::from_utf8_lossy(h).into_owned())
        .collect::<Vec<_>>();
    let columns = ColumnMap::from_headers(&headers)?;

    let rows = reader
        .byte_records()
        .enumerate()
        .map(|(index, record)| ParsedRow {
            row: index + 1,
            result: record
                .map_err(|err| RowError::malformed(err.to_string()))
                .and_then(|record| columns.decode(&record))
                .and_then(RawRow::validate),
        })
        .collect();

    Ok(CsvUpload {
        filename: filename.to_string(),
        columns,
        rows,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("enrichment provider is not configured")]
    NotConfigured,
    #[error("http status {status} from {endpoint}")]
    HttpStatus { status: u16, endpoint: String },
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid provider payload: {0}")]
    InvalidPayload(String),
    #[error("provider temporarily unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            ProviderError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            ProviderError::Request(err) => classify_reqwest_error(err),
            ProviderError::Unavailable(_) => RetryDisposition::Retryable,
            ProviderError::NotConfigured | ProviderError::InvalidPayload(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

/// Source of externally measured domain metrics.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when the provider has no data for the domain.
    async fn lookup(&self, url: &NormalizedUrl) -> Result<Option<DomainMetrics>, ProviderError>;
}

/// Stand-in used when no provider credentials are configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledProvider;

#[async_trait]
impl EnrichmentProvider for DisabledProvider {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn lookup(&self, _url: &NormalizedUrl) -> Result<Option<DomainMetrics>, ProviderError> {
        Err(ProviderError::NotConfigured)
    }
}

#[derive(Debug, Clone)]
pub struct AhrefsConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl AhrefsConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.ahrefs.com/v2";

    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DomainRatingResponse {
    domain_rating: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TrafficResponse {
    traffic: Option<f64>,
}

/// HTTP client for an Ahrefs-style metrics API.
#[derive(Debug, Clone)]
pub struct AhrefsProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AhrefsProvider {
    pub fn new(config: AhrefsConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        host: &str,
    ) -> Result<Option<T>, ProviderError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("target", host)])
            .bearer_auth(&self.api_key)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ProviderError::HttpStatus {
                status: status.as_u16(),
                endpoint: endpoint.to_string(),
            });
        }

        let body = resp.bytes().await?;
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|err| ProviderError::InvalidPayload(format!("{endpoint}: {err}")))
    }
}

fn checked_dr(value: f64) -> Result<u8, ProviderError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(value.round() as u8)
    } else {
        Err(ProviderError::InvalidPayload(format!(
            "domain_rating {value} outside 0..=100"
        )))
    }
}

fn checked_traffic(value: f64) -> Result<u64, ProviderError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value.round() as u64)
    } else {
        Err(ProviderError::InvalidPayload(format!(
            "traffic {value} must be a non-negative number"
        )))
    }
}

#[async_trait]
impl EnrichmentProvider for AhrefsProvider {
    fn name(&self) -> &'static str {
        "ahrefs"
    }

    async fn lookup(&self, url: &NormalizedUrl) -> Result<Option<DomainMetrics>, ProviderError> {
        let host = url.host();
        let span = info_span!("ahrefs_lookup", host);
        async {
            let rating = self
                .fetch_json::<DomainRatingResponse>("domain-rating", host)
                .await?;
            let traffic = self
                .fetch_json::<TrafficResponse>("organic-traffic", host)
                .await?;

            if rating.is_none() && traffic.is_none() {
                debug!("no metrics for domain");
                return Ok(None);
            }

            let metrics = DomainMetrics {
                dr: rating
                    .and_then(|r| r.domain_rating)
                    .map(checked_dr)
                    .transpose()?,
                traffic: traffic
                    .and_then(|t| t.traffic)
                    .map(checked_traffic)
                    .transpose()?,
            };
            Ok::<_, ProviderError>((!metrics.is_empty()).then_some(metrics))
        }
        .instrument(span)
        .await
    }
}

/// In-memory provider keyed by host, with optional scripted transient
/// failures and latency.
#[derive(Debug, Default)]
pub struct StaticProvider {
    metrics: HashMap<String, DomainMetrics>,
    failures: Mutex<HashMap<String, usize>>,
    latency: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, host: impl Into<String>, metrics: DomainMetrics) -> Self {
        self.metrics.insert(host.into().to_ascii_lowercase(), metrics);
        self
    }

    /// The next `count` lookups for `host` fail with a retryable error.
    pub fn with_transient_failures(mut self, host: impl Into<String>, count: usize) -> Self {
        self.failures
            .get_mut()
            .insert(host.into().to_ascii_lowercase(), count);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn lookup(&self, url: &NormalizedUrl) -> Result<Option<DomainMetrics>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        {
            let mut failures = self.failures.lock().await;
            if let Some(remaining) = failures.get_mut(url.host()) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ProviderError::Unavailable(format!(
                        "scripted failure for {}",
                        url.host()
                    )));
                }
            }
        }

        Ok(self.metrics.get(url.host()).copied())
    }
}
