use crate::config::EmbeddingConfig;
use crate::error::SyncError;
use crate::models::ContentItem;
use providers::EmbeddingProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const SERVICE: &str = "embeddings";

/// The text an item is embedded from: title, blank line, plain text.
pub fn embedding_text(item: &ContentItem, max_chars: usize) -> String {
    let text = format!("{}\n\n{}", item.title, item.text());
    truncate_chars(&text, max_chars).to_string()
}

/// Cut to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Wraps an [`EmbeddingProvider`] with input shaping and transient-failure retries.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    max_input_chars: usize,
    max_retries: u32,
    retry_delay: Duration,
    dims: Option<usize>,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cfg: &EmbeddingConfig) -> Self {
        Self {
            provider,
            max_input_chars: cfg.max_input_chars,
            max_retries: cfg.max_retries,
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
            dims: Some(cfg.dims),
        }
    }

    pub fn with_retry(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = delay;
        self
    }

    /// Skip the vector length check.
    pub fn any_dims(mut self) -> Self {
        self.dims = None;
        self
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub async fn health(&self) -> Result<(), SyncError> {
        self.provider
            .health()
            .await
            .map_err(|e| SyncError::from_provider(SERVICE, e))
    }

    pub async fn embed_item(&self, item: &ContentItem) -> Result<Vec<f32>, SyncError> {
        self.embed_text(&embedding_text(item, self.max_input_chars))
            .await
    }

    /// Embed one text. `ServiceUnavailable` is retried with doubling delays up to
    /// `max_retries` extra attempts; anything else returns at once.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, SyncError> {
        let input = vec![truncate_chars(text, self.max_input_chars).to_string()];
        let mut attempt = 0u32;
        let mut delay = self.retry_delay;
        loop {
            let result = self
                .provider
                .embed(&input)
                .await
                .map_err(|e| SyncError::from_provider(SERVICE, e))
                .and_then(|resp| {
                    resp.vectors.into_iter().next().ok_or_else(|| {
                        SyncError::Other(anyhow::anyhow!("embedding response was empty"))
                    })
                });
            match result {
                Ok(vector) => {
                    if let Some(dims) = self.dims {
                        if vector.len() != dims {
                            return Err(SyncError::Other(anyhow::anyhow!(
                                "embedding has {} dimensions, expected {dims}",
                                vector.len()
                            )));
                        }
                    }
                    return Ok(vector);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max = self.max_retries,
                        error = %e,
                        "embedding failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    debug!(attempts = attempt + 1, error = %e, "embedding gave up");
                    return Err(e);
                }
            }
        }
    }
}
