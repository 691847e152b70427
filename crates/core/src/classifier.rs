//! Maps a free-text query to a ranking profile.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Current,
    Balanced,
    Historical,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Current => "current",
            QueryKind::Balanced => "balanced",
            QueryKind::Historical => "historical",
        }
    }

    /// Preset `(freshness_weight, decay_rate)` for this kind.
    pub fn profile(&self) -> QueryProfile {
        let (freshness_weight, decay_rate) = match self {
            QueryKind::Current => (0.4, 0.02),
            QueryKind::Balanced => (0.2, 0.005),
            QueryKind::Historical => (0.0, 0.0),
        };
        QueryProfile {
            label: self.as_str().to_string(),
            freshness_weight,
            decay_rate,
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "current" => Ok(QueryKind::Current),
            "balanced" => Ok(QueryKind::Balanced),
            "historical" => Ok(QueryKind::Historical),
            other => Err(format!("unknown query type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryProfile {
    pub label: String,
    /// Share of the final score taken by freshness, in `[0, 1]`.
    pub freshness_weight: f64,
    /// Per-day exponential decay; 0 turns freshness off.
    pub decay_rate: f64,
}

const CURRENT_WORDS: &str =
    r"(?i)\b(current|now|today|latest|recent|active|present|up.?to.?date|modern)\b";
const HISTORICAL_WORDS: &str =
    r"(?i)\b(old|previous|former|history|past|archive|original|backup|legacy)\b";

/// Ordered rule table; the first matching rule decides.
pub struct QueryClassifier {
    rules: Vec<(QueryKind, Regex)>,
    fallback: QueryKind,
}

impl QueryClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            rules: vec![
                (QueryKind::Current, Regex::new(CURRENT_WORDS)?),
                (QueryKind::Historical, Regex::new(HISTORICAL_WORDS)?),
            ],
            fallback: QueryKind::Balanced,
        })
    }

    pub fn classify(&self, query: &str) -> QueryKind {
        self.rules
            .iter()
            .find(|(_, re)| re.is_match(query))
            .map(|(kind, _)| *kind)
            .unwrap_or(self.fallback)
    }

    /// Pick the profile for `query`. An explicit kind beats classification, and an
    /// explicit weight replaces the preset weight.
    pub fn resolve_profile(
        &self,
        query: &str,
        kind: Option<QueryKind>,
        freshness_weight: Option<f64>,
    ) -> QueryProfile {
        let kind = kind.unwrap_or_else(|| self.classify(query));
        let mut profile = kind.profile();
        if let Some(w) = freshness_weight {
            profile.freshness_weight = if w.is_nan() { 0.0 } else { w.clamp(0.0, 1.0) };
        }
        profile
    }
}
