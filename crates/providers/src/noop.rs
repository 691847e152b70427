use crate::{EmbedResponse, EmbeddingProvider, ProviderError};

/// Stand-in used when embeddings are disabled. Always healthy, never produces vectors.
#[derive(Debug, Default)]
pub struct NoopProvider;

#[async_trait::async_trait]
impl EmbeddingProvider for NoopProvider {
    async fn embed(&self, _texts: &[String]) -> Result<EmbedResponse, ProviderError> {
        Err(ProviderError::NotImplemented)
    }

    async fn health(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn model_name(&self) -> &str {
        "noop"
    }
}
