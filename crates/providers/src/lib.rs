//! Provider abstractions for the embedding service and the vector index.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod noop;
pub mod openai;
pub mod qdrant;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("not implemented")]
    NotImplemented,
    /// Connection refused, timeout, 429 or 5xx. Worth retrying later.
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_))
    }

    pub(crate) fn from_send(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            ProviderError::Unavailable(err.to_string())
        } else {
            ProviderError::RequestFailed(err.to_string())
        }
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        let msg = format!("status {} body {}", status, body);
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            ProviderError::Unauthorized(msg)
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ProviderError::Unavailable(msg)
        } else {
            ProviderError::RequestFailed(msg)
        }
    }
}

/// Turn a non-success response into a [`ProviderError`].
pub(crate) async fn ensure_success(
    resp: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::from_status(status, body))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedResponse {
    pub vectors: Vec<Vec<f32>>,
}

#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError>;

    /// Cheap reachability check, called before every sync cycle.
    async fn health(&self) -> Result<(), ProviderError>;

    fn model_name(&self) -> &str;
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    embeddings: HashMap<String, Arc<dyn EmbeddingProvider>>,
    pub preferred_embedding: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_embedding(mut self, name: &str, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embeddings.insert(name.to_string(), provider);
        self
    }

    pub fn set_preferred_embedding(mut self, name: &str) -> Self {
        self.preferred_embedding = Some(name.to_string());
        self
    }

    pub fn embedding(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
        let key = name
            .map(str::to_string)
            .or_else(|| self.preferred_embedding.clone())
            .ok_or_else(|| {
                ProviderError::UnknownProvider("no embedding provider configured".into())
            })?;
        self.embeddings
            .get(&key)
            .cloned()
            .ok_or(ProviderError::UnknownProvider(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noop::NoopProvider;

    #[test]
    fn registry_falls_back_to_preferred() {
        let reg = ProviderRegistry::new()
            .with_embedding("noop", Arc::new(NoopProvider))
            .set_preferred_embedding("noop");
        assert!(reg.embedding(None).is_ok());
        assert!(matches!(
            reg.embedding(Some("missing")),
            Err(ProviderError::UnknownProvider(name)) if name == "missing"
        ));
    }

    #[test]
    fn registry_without_preference_errors() {
        let reg = ProviderRegistry::new().with_embedding("noop", Arc::new(NoopProvider));
        assert!(reg.embedding(None).is_err());
    }

    #[test]
    fn status_mapping() {
        use reqwest::StatusCode;
        assert!(ProviderError::from_status(StatusCode::SERVICE_UNAVAILABLE, String::new())
            .is_transient());
        assert!(ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new())
            .is_transient());
        assert!(matches!(
            ProviderError::from_status(StatusCode::FORBIDDEN, String::new()),
            ProviderError::Unauthorized(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::BAD_REQUEST, String::new()),
            ProviderError::RequestFailed(_)
        ));
    }
}
