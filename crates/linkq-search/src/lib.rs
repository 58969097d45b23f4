//! Keyword relevance search over the website catalog.

use std::cmp::Ordering;
use std::sync::Arc;

use linkq_core::{
    tokenize, CatalogStats, MetricSummary, RangeFilter, SearchQuery, SearchResult, WebsiteListing,
};
use linkq_storage::{CatalogStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "linkq-search";

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("keyword has no searchable tokens")]
    EmptyKeyword,
    #[error("{0} must not be negative")]
    NegativeBound(&'static str),
    #[error("{0} must be within 0..=100")]
    DrOutOfRange(&'static str),
    #[error("min_dr {min} is greater than max_dr {max}")]
    InvalidDrRange { min: i64, max: i64 },
    #[error("max_price must be a finite number")]
    InvalidPriceBound,
    #[error("limit must be at least 1")]
    InvalidLimit,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SearchError {
    pub fn tag(&self) -> &'static str {
        match self {
            SearchError::EmptyKeyword => "empty_keyword",
            SearchError::NegativeBound(_) => "negative_bound",
            SearchError::DrOutOfRange(_) => "dr_out_of_range",
            SearchError::InvalidDrRange { .. } => "invalid_dr_range",
            SearchError::InvalidPriceBound => "invalid_price_bound",
            SearchError::InvalidLimit => "invalid_limit",
            SearchError::Store(StoreError::Unavailable(_)) => "store_unavailable",
            SearchError::Store(StoreError::Rejected(_)) => "store_error",
        }
    }

    pub fn is_client_error(&self) -> bool {
        !matches!(self, SearchError::Store(_))
    }
}

/// A query that passed validation: tokens plus typed bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    pub tokens: Vec<String>,
    pub filter: RangeFilter,
    pub limit: Option<usize>,
}

fn dr_bound(field: &'static str, value: Option<i64>) -> Result<Option<u8>, SearchError> {
    value
        .map(|v| u8::try_from(v).ok().filter(|v| *v <= 100).ok_or(SearchError::DrOutOfRange(field)))
        .transpose()
}

pub fn validate(query: &SearchQuery) -> Result<ValidatedQuery, SearchError> {
    let tokens = tokenize(query.keyword.trim());
    if tokens.is_empty() {
        return Err(SearchError::EmptyKeyword);
    }

    let negative = [
        ("min_dr", query.min_dr.is_some_and(|v| v < 0)),
        ("max_dr", query.max_dr.is_some_and(|v| v < 0)),
        ("min_traffic", query.min_traffic.is_some_and(|v| v < 0)),
        ("max_price", query.max_price.is_some_and(|v| v < 0.0)),
    ];
    if let Some((field, _)) = negative.iter().find(|(_, negative)| *negative) {
        return Err(SearchError::NegativeBound(*field));
    }

    let min_dr = dr_bound("min_dr", query.min_dr)?;
    let max_dr = dr_bound("max_dr", query.max_dr)?;
    if let (Some(min), Some(max)) = (query.min_dr, query.max_dr) {
        if min > max {
            return Err(SearchError::InvalidDrRange { min, max });
        }
    }
    if query.max_price.is_some_and(|p| !p.is_finite()) {
        return Err(SearchError::InvalidPriceBound);
    }
    if query.limit == Some(0) {
        return Err(SearchError::InvalidLimit);
    }

    Ok(ValidatedQuery {
        tokens,
        filter: RangeFilter {
            min_dr,
            max_dr,
            min_traffic: query.min_traffic.map(|t| t as u64),
            max_price: query.max_price,
        },
        limit: query.limit,
    })
}

/// Fraction of query tokens present in the listing's keywords, with the
/// matched tokens in query order. `None` when nothing matches.
pub fn score_listing(tokens: &[String], listing: &WebsiteListing) -> Option<(f64, Vec<String>)> {
    if tokens.is_empty() {
        return None;
    }
    let matches = tokens
        .iter()
        .filter(|t| listing.keywords.contains(t.as_str()))
        .cloned()
        .collect::<Vec<_>>();
    if matches.is_empty() {
        return None;
    }
    Some((matches.len() as f64 / tokens.len() as f64, matches))
}

/// Relevance desc, then dr desc with missing dr last, then id asc.
pub fn rank_order(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.relevance_score
        .total_cmp(&a.relevance_score)
        .then_with(|| match (a.dr, b.dr) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    pub min: f64,
    pub max: f64,
}

impl NumericRange {
    fn from_summary(summary: Option<MetricSummary>, default_max: f64) -> Self {
        summary
            .map(|s| Self {
                min: s.min,
                max: s.max,
            })
            .unwrap_or(Self {
                min: 0.0,
                max: default_max,
            })
    }
}

/// Bounds a client can offer as filter sliders.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterRanges {
    pub dr_range: NumericRange,
    pub traffic_range: NumericRange,
    pub price_range: NumericRange,
}

impl FilterRanges {
    pub fn from_stats(stats: &CatalogStats) -> Self {
        Self {
            dr_range: NumericRange::from_summary(stats.dr, 100.0),
            traffic_range: NumericRange::from_summary(stats.traffic, 1_000_000.0),
            price_range: NumericRange::from_summary(stats.price, 10_000.0),
        }
    }
}

#[derive(Clone)]
pub struct SearchEngine {
    store: Arc<dyn CatalogStore>,
}

impl SearchEngine {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, SearchError> {
        let validated = validate(query)?;
        let span = info_span!("search", keyword = %query.keyword, tokens = validated.tokens.len());
        async {
            let candidates = self.store.range_query(&validated.filter).await?;
            let scanned = candidates.len();

            let mut results = candidates
                .iter()
                .filter_map(|listing| {
                    score_listing(&validated.tokens, listing)
                        .map(|(score, matches)| SearchResult::from_listing(listing, score, matches))
                })
                .collect::<Vec<_>>();
            results.sort_by(rank_order);
            if let Some(limit) = validated.limit {
                results.truncate(limit);
            }

            debug!(scanned, returned = results.len(), "search complete");
            Ok::<_, SearchError>(results)
        }
        .instrument(span)
        .await
    }

    pub async fn filter_ranges(&self) -> Result<FilterRanges, SearchError> {
        Ok(FilterRanges::from_stats(&self.store.stats().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use linkq_core::{
        keywords_for, DomainMetrics, EnrichmentWrite, ListingDraft, ListingId, NormalizedUrl,
        UpsertOutcome,
    };
    use linkq_storage::MemoryCatalog;

    async fn add(
        store: &MemoryCatalog,
        url: &str,
        description: Option<&str>,
        price: f64,
        metrics: Option<DomainMetrics>,
    ) -> ListingId {
        let url = NormalizedUrl::parse(url).unwrap();
        let keywords = keywords_for(&url, description);
        let outcome = store
            .upsert(ListingDraft {
                url,
                email: "owner@x.com".into(),
                price,
                keywords,
            })
            .await
            .unwrap();
        if let Some(metrics) = metrics {
            store.apply_enrichment(outcome.id, metrics).await.unwrap();
        }
        outcome.id
    }

    fn metrics(dr: u8, traffic: u64) -> Option<DomainMetrics> {
        Some(DomainMetrics {
            dr: Some(dr),
            traffic: Some(traffic),
        })
    }

    async fn scenario_catalog() -> (Arc<MemoryCatalog>, ListingId) {
        let store = Arc::new(MemoryCatalog::new());
        let id = add(&store, "http://a.com/seo-tools", None, 10.0, metrics(50, 1000)).await;
        (store, id)
    }

    #[tokio::test]
    async fn single_token_keyword_scores_full_match() {
        let (store, id) = scenario_catalog().await;
        let engine = SearchEngine::new(store);

        let results = engine
            .search(&SearchQuery {
                min_dr: Some(40),
                ..SearchQuery::keyword("seo")
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, id);
        assert_eq!(results[0].relevance_score, 1.0);
        assert_eq!(results[0].matching_keywords, vec!["seo"]);
    }

    #[tokio::test]
    async fn dr_bound_above_listing_excludes_it() {
        let (store, _) = scenario_catalog().await;
        let engine = SearchEngine::new(store);
        let results = engine
            .search(&SearchQuery {
                min_dr: Some(60),
                ..SearchQuery::keyword("seo")
            })
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn partial_overlap_scores_fractionally_in_query_order() {
        let (store, _) = scenario_catalog().await;
        let engine = SearchEngine::new(store);
        let results = engine
            .search(&SearchQuery::keyword("Tools for SEO audits"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!((results[0].relevance_score - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(results[0].matching_keywords, vec!["tools", "seo"]);
    }

    #[tokio::test]
    async fn ranking_is_score_then_dr_then_id() {
        let store = Arc::new(MemoryCatalog::new());
        let low = add(&store, "http://low.com/garden", None, 5.0, metrics(10, 1)).await;
        let none = add(&store, "http://none.com/garden", None, 5.0, None).await;
        let high = add(&store, "http://high.com/garden", None, 5.0, metrics(90, 1)).await;
        let best = add(&store, "http://best.com/garden-tools", None, 5.0, metrics(1, 1)).await;
        let tie = add(&store, "http://tie.com/garden", None, 5.0, metrics(90, 1)).await;
        add(&store, "http://other.com/cooking", None, 5.0, metrics(99, 1)).await;

        let engine = SearchEngine::new(store);
        let ids = engine
            .search(&SearchQuery::keyword("garden tools"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![best, high, tie, low, none]);
    }

    #[tokio::test]
    async fn unenriched_listings_fail_any_metric_bound() {
        let store = Arc::new(MemoryCatalog::new());
        add(&store, "http://a.com/seo", None, 5.0, None).await;
        let engine = SearchEngine::new(store);

        assert_eq!(engine.search(&SearchQuery::keyword("seo")).await.unwrap().len(), 1);
        let bounded = engine
            .search(&SearchQuery {
                min_traffic: Some(0),
                ..SearchQuery::keyword("seo")
            })
            .await
            .unwrap();
        assert!(bounded.is_empty());

        let priced = engine
            .search(&SearchQuery {
                max_price: Some(5.0),
                ..SearchQuery::keyword("seo")
            })
            .await
            .unwrap();
        assert_eq!(priced.len(), 1);
    }

    #[tokio::test]
    async fn limit_truncates_after_ranking() {
        let store = Arc::new(MemoryCatalog::new());
        for i in 0..5u8 {
            add(&store, &format!("http://s{i}.com/seo"), None, 1.0, metrics(i * 10, 1)).await;
        }
        let engine = SearchEngine::new(store);
        let results = engine
            .search(&SearchQuery {
                limit: Some(2),
                ..SearchQuery::keyword("seo")
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].dr, Some(40));
        assert_eq!(results[1].dr, Some(30));
        assert!(results.iter().all(|r| r.relevance_score == 1.0));
    }

    #[test]
    fn validation_errors_carry_stable_tags() {
        let cases = [
            (SearchQuery::keyword("   "), "empty_keyword"),
            (SearchQuery::keyword("the www of"), "empty_keyword"),
            (
                SearchQuery {
                    min_traffic: Some(-1),
                    ..SearchQuery::keyword("seo")
                },
                "negative_bound",
            ),
            (
                SearchQuery {
                    max_dr: Some(101),
                    ..SearchQuery::keyword("seo")
                },
                "dr_out_of_range",
            ),
            (
                SearchQuery {
                    min_dr: Some(70),
                    max_dr: Some(20),
                    ..SearchQuery::keyword("seo")
                },
                "invalid_dr_range",
            ),
            (
                SearchQuery {
                    max_price: Some(f64::NAN),
                    ..SearchQuery::keyword("seo")
                },
                "invalid_price_bound",
            ),
            (
                SearchQuery {
                    limit: Some(0),
                    ..SearchQuery::keyword("seo")
                },
                "invalid_limit",
            ),
        ];
        for (query, tag) in cases {
            let err = validate(&query).unwrap_err();
            assert_eq!(err.tag(), tag, "{query:?}");
            assert!(err.is_client_error());
        }
    }

    #[test]
    fn filter_ranges_fall_back_to_defaults() {
        let ranges = FilterRanges::from_stats(&CatalogStats::default());
        assert_eq!(ranges.dr_range, NumericRange { min: 0.0, max: 100.0 });
        assert_eq!(ranges.traffic_range.max, 1_000_000.0);
        assert_eq!(ranges.price_range.max, 10_000.0);
        let json = serde_json::to_value(ranges).unwrap();
        assert_eq!(json["dr_range"]["max"], 100.0);
    }

    struct UnavailableStore;

    #[async_trait]
    impl CatalogStore for UnavailableStore {
        async fn upsert(&self, _draft: ListingDraft) -> Result<UpsertOutcome, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }

        async fn get(&self, _id: ListingId) -> Result<Option<WebsiteListing>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }

        async fn get_all(&self) -> Result<Vec<WebsiteListing>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }

        async fn apply_enrichment(
            &self,
            _id: ListingId,
            _metrics: DomainMetrics,
        ) -> Result<EnrichmentWrite, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
    }

    #[tokio::test]
    async fn store_failure_fails_the_whole_request() {
        let engine = SearchEngine::new(Arc::new(UnavailableStore));
        let err = engine.search(&SearchQuery::keyword("seo")).await.unwrap_err();
        assert_eq!(err.tag(), "store_unavailable");
        assert!(!err.is_client_error());
    }
}
