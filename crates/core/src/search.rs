//! Freshness-weighted ranking over nearest-neighbour hits.
//!
//! ```text
//! freshness = exp(-decay_rate * age_days)      (1.0 when decay_rate is 0)
//! combined  = (1 - w) * similarity + w * freshness
//! score     = combined + 0.1 per keyword found
//! ```

use crate::classifier::{QueryClassifier, QueryKind, QueryProfile};
use crate::config::SearchConfig;
use crate::embeddings::{truncate_chars, Embedder};
use crate::error::SyncError;
use crate::vectorstore::{ScoredRecord, SearchFilter, VectorIndex};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Freshness used when a timestamp cannot be read.
pub const UNKNOWN_FRESHNESS: f64 = 0.5;
pub const KEYWORD_BOOST: f64 = 0.1;

/// RFC 3339, `YYYY-MM-DD HH:MM:SS`, or anything starting with `YYYY-MM-DD`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(t.and_utc());
    }
    let day = raw.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

pub fn freshness(modified_at: &str, decay_rate: f64, now: DateTime<Utc>) -> f64 {
    if decay_rate <= 0.0 {
        return 1.0;
    }
    let Some(t) = parse_timestamp(modified_at) else {
        return UNKNOWN_FRESHNESS;
    };
    let age_days = ((now - t).num_seconds() as f64 / 86_400.0).max(0.0);
    (-decay_rate * age_days).exp()
}

pub fn combine(similarity: f64, freshness: f64, freshness_weight: f64) -> f64 {
    (1.0 - freshness_weight) * similarity + freshness_weight * freshness
}

/// How many candidates to pull from the index. Freshness can promote items the
/// index ranked lower, so oversample whenever it carries weight.
pub fn fetch_limit(limit: usize, freshness_weight: f64, oversample_factor: usize) -> usize {
    if freshness_weight > 0.0 {
        limit.saturating_mul(oversample_factor.max(1))
    } else {
        limit
    }
}

/// `KEYWORD_BOOST` for every keyword found, case-insensitively, in title or text.
pub fn keyword_boost(title: &str, text: &str, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let haystack = format!("{title} {text}").to_lowercase();
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty() && haystack.contains(k.as_str()))
        .count() as f64
        * KEYWORD_BOOST
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub id: String,
    pub title: String,
    pub group: String,
    pub created_at: String,
    pub modified_at: String,
    pub preview: String,
    pub similarity: f64,
    pub freshness: f64,
    pub combined: f64,
    pub score: f64,
    pub profile: String,
}

fn by_rank(a: &RankedResult, b: &RankedResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.similarity.total_cmp(&a.similarity))
        .then_with(|| a.id.cmp(&b.id))
}

/// Score and order hits. `preview_chars` of `None` keeps the full text.
pub fn rank(
    hits: Vec<ScoredRecord>,
    profile: &QueryProfile,
    keywords: &[String],
    now: DateTime<Utc>,
    preview_chars: Option<usize>,
) -> Vec<RankedResult> {
    let mut ranked: Vec<RankedResult> = hits
        .into_iter()
        .map(|hit| {
            let r = hit.record;
            let similarity = 1.0 - hit.distance as f64;
            let fresh = freshness(&r.modified_at, profile.decay_rate, now);
            let combined = combine(similarity, fresh, profile.freshness_weight);
            let score = combined + keyword_boost(&r.title, &r.plaintext, keywords);
            let preview = match preview_chars {
                Some(n) => truncate_chars(&r.plaintext, n).to_string(),
                None => r.plaintext,
            };
            RankedResult {
                id: r.id,
                title: r.title,
                group: r.group,
                created_at: r.created_at,
                modified_at: r.modified_at,
                preview,
                similarity,
                freshness: fresh,
                combined,
                score,
                profile: profile.label.clone(),
            }
        })
        .collect();
    ranked.sort_by(by_rank);
    ranked
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub limit: Option<usize>,
    pub group: Option<String>,
    /// Skip classification and use this kind's preset.
    pub kind: Option<QueryKind>,
    pub freshness_weight: Option<f64>,
    pub keywords: Vec<String>,
    /// Return whole texts instead of previews.
    pub full: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub profile: QueryProfile,
    pub results: Vec<RankedResult>,
}

pub struct SearchService {
    embedder: Embedder,
    index: Arc<dyn VectorIndex>,
    classifier: QueryClassifier,
    cfg: SearchConfig,
}

impl SearchService {
    pub fn new(
        embedder: Embedder,
        index: Arc<dyn VectorIndex>,
        cfg: SearchConfig,
    ) -> Result<Self, SyncError> {
        let classifier = QueryClassifier::new().map_err(|e| SyncError::Other(e.into()))?;
        Ok(Self {
            embedder,
            index,
            classifier,
            cfg,
        })
    }

    pub async fn search(&self, req: SearchRequest) -> Result<SearchResponse, SyncError> {
        self.search_at(req, Utc::now()).await
    }

    pub async fn search_at(
        &self,
        req: SearchRequest,
        now: DateTime<Utc>,
    ) -> Result<SearchResponse, SyncError> {
        let profile = self
            .classifier
            .resolve_profile(&req.query, req.kind, req.freshness_weight);
        let limit = req.limit.unwrap_or(self.cfg.default_limit);
        if req.query.trim().is_empty() || limit == 0 {
            return Ok(SearchResponse {
                query: req.query,
                profile,
                results: Vec::new(),
            });
        }

        let vector = self.embedder.embed_text(&req.query).await?;
        let candidates = fetch_limit(limit, profile.freshness_weight, self.cfg.oversample_factor);
        let filter = SearchFilter {
            group: req.group.clone(),
        };
        let hits = self.index.search(&vector, candidates, &filter).await?;
        debug!(
            query = %req.query,
            profile = %profile.label,
            candidates,
            hits = hits.len(),
            "ranking search hits"
        );

        let preview = if req.full {
            None
        } else {
            Some(self.cfg.preview_chars)
        };
        let mut results = rank(hits, &profile, &req.keywords, now, preview);
        results.truncate(limit);
        Ok(SearchResponse {
            query: req.query,
            profile,
            results,
        })
    }
}
