use providers::ProviderError;
use serde::{Deserialize, Serialize};
use storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A collaborator could not be reached. The cycle is abandoned and retried later.
    #[error("{service} unavailable: {message}")]
    ServiceUnavailable { service: String, message: String },
    #[error("another sync cycle holds the lock")]
    LockContention,
    #[error("sync state unreadable: {0}")]
    CorruptState(String),
    /// Access to the content source was refused. Retrying will not help.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("vector index: {0}")]
    Index(String),
    #[error("state store: {0}")]
    State(String),
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn unavailable(service: &str, message: impl Into<String>) -> Self {
        SyncError::ServiceUnavailable {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::ServiceUnavailable { .. })
    }

    /// Errors that should stop a daemon instead of waiting for the next interval.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::PermissionDenied(_) | SyncError::Config(_))
    }

    /// Map an embedding or index client error, naming the service it came from.
    pub fn from_provider(service: &str, err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(msg) => SyncError::unavailable(service, msg),
            ProviderError::Unauthorized(msg) => {
                SyncError::PermissionDenied(format!("{service}: {msg}"))
            }
            ProviderError::UnknownProvider(name) => {
                SyncError::Config(format!("unknown {service} provider '{name}'"))
            }
            other => SyncError::Other(anyhow::anyhow!("{service}: {other}")),
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Corrupt(msg) => SyncError::CorruptState(msg),
            other => SyncError::State(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOperation {
    Fetch,
    Embed,
}

impl std::fmt::Display for ItemOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemOperation::Fetch => f.write_str("fetch"),
            ItemOperation::Embed => f.write_str("embed"),
        }
    }
}

/// One item that could not be reconciled. Its stored signature is left alone so the
/// next cycle sees it as changed again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub id: String,
    pub operation: ItemOperation,
    pub message: String,
}

impl std::fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed for {}: {}", self.operation, self.id, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_keep_their_meaning() {
        let e =
            SyncError::from_provider("embeddings", ProviderError::Unavailable("refused".into()));
        assert!(e.is_transient());
        assert!(e.to_string().starts_with("embeddings unavailable"));

        let e = SyncError::from_provider("embeddings", ProviderError::Unauthorized("401".into()));
        assert!(e.is_fatal());

        let e = SyncError::from_provider("index", ProviderError::RequestFailed("400".into()));
        assert!(!e.is_transient() && !e.is_fatal());
    }

    #[test]
    fn corrupt_storage_maps_to_corrupt_state() {
        let e: SyncError = StorageError::Corrupt("bad".into()).into();
        assert!(matches!(e, SyncError::CorruptState(_)));
    }
}
