use anyhow::bail;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub embeddings: EmbeddingConfig,
    #[serde(default)]
    pub vectors: VectorConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/notesync.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    /// `export_dir` is the only on-disk provider; `memory` is for embedding the library.
    #[serde(default = "default_content_provider")]
    pub provider: String,
    /// Root of the notes export: one sub-directory per group, one JSON file per note.
    #[serde(default)]
    pub export_dir: Option<String>,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            provider: default_content_provider(),
            export_dir: None,
        }
    }
}

fn default_content_provider() -> String {
    "export_dir".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
    /// Input is cut to this many characters before it is sent.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles on every further attempt.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            base_url: default_embedding_url(),
            api_key: None,
            dims: default_dims(),
            timeout_secs: default_embed_timeout(),
            max_input_chars: default_max_input_chars(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_embedding_provider() -> String {
    "lmstudio".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-nomic-embed-text-v1.5".to_string()
}
fn default_embedding_url() -> String {
    "http://localhost:1234".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_embed_timeout() -> u64 {
    30
}
fn default_max_input_chars() -> usize {
    8000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    /// `qdrant` or `memory`.
    #[serde(default = "default_vector_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_vector_timeout")]
    pub timeout_secs: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            provider: default_vector_provider(),
            url: Some("http://localhost:6333".to_string()),
            collection: default_collection(),
            api_key: None,
            timeout_secs: default_vector_timeout(),
        }
    }
}

fn default_vector_provider() -> String {
    "qdrant".to_string()
}
fn default_collection() -> String {
    "notes".to_string()
}
fn default_vector_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_lock_path")]
    pub lock_path: String,
    /// Items per fetch/embed/upsert batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Daemon cycle interval.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Consecutive failures before an alert is raised.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u32,
    /// Force a full-coverage metadata scan when the last one is older than this. 0 disables.
    #[serde(default = "default_full_scan_interval_hours")]
    pub full_scan_interval_hours: u64,
    #[serde(default = "default_list_timeout_secs")]
    pub list_timeout_secs: u64,
    #[serde(default)]
    pub metadata_timeout: ScaledTimeout,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: ScaledTimeout,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lock_path: default_lock_path(),
            batch_size: default_batch_size(),
            interval_secs: default_interval_secs(),
            alert_threshold: default_alert_threshold(),
            full_scan_interval_hours: default_full_scan_interval_hours(),
            list_timeout_secs: default_list_timeout_secs(),
            metadata_timeout: ScaledTimeout::default(),
            fetch_timeout: default_fetch_timeout(),
        }
    }
}

/// Timeout that grows with the number of items a call is expected to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaledTimeout {
    pub floor_secs: u64,
    pub per_item_secs: u64,
}

impl Default for ScaledTimeout {
    fn default() -> Self {
        Self {
            floor_secs: 60,
            per_item_secs: 2,
        }
    }
}

impl ScaledTimeout {
    pub fn for_items(&self, items: usize) -> std::time::Duration {
        let scaled = self.per_item_secs.saturating_mul(items as u64);
        std::time::Duration::from_secs(scaled.max(self.floor_secs).max(1))
    }
}

fn default_lock_path() -> String {
    "data/sync.lock".to_string()
}
fn default_batch_size() -> usize {
    10
}
fn default_interval_secs() -> u64 {
    600
}
fn default_alert_threshold() -> u32 {
    3
}
fn default_full_scan_interval_hours() -> u64 {
    24
}
fn default_list_timeout_secs() -> u64 {
    60
}
fn default_fetch_timeout() -> ScaledTimeout {
    ScaledTimeout {
        floor_secs: 60,
        per_item_secs: 3,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Candidate multiplier used when freshness can reorder results.
    #[serde(default = "default_oversample")]
    pub oversample_factor: usize,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            oversample_factor: default_oversample(),
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_limit() -> usize {
    10
}
fn default_oversample() -> usize {
    3
}
fn default_preview_chars() -> usize {
    300
}

/// Layer an optional TOML file under `NOTESYNC__SECTION__KEY` environment overrides.
pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let mut settings = config::Config::builder();
    if let Some(p) = path {
        settings = settings.add_source(config::File::with_name(p));
    } else {
        settings = settings.add_source(config::File::with_name("config/default").required(false));
    }
    settings = settings.add_source(
        config::Environment::with_prefix("NOTESYNC")
            .prefix_separator("__")
            .separator("__"),
    );
    let cfg: AppConfig = settings.build()?.try_deserialize()?;
    validate(&cfg)?;
    Ok(cfg)
}

pub fn validate(cfg: &AppConfig) -> anyhow::Result<()> {
    if cfg.sync.batch_size == 0 {
        bail!("sync.batch_size must be > 0");
    }
    if cfg.embeddings.dims == 0 {
        bail!("embeddings.dims must be > 0");
    }
    if cfg.embeddings.max_input_chars == 0 {
        bail!("embeddings.max_input_chars must be > 0");
    }
    if cfg.search.oversample_factor == 0 {
        bail!("search.oversample_factor must be >= 1");
    }
    match cfg.embeddings.provider.as_str() {
        "openai" | "lmstudio" | "noop" => {}
        other => bail!("unknown embeddings.provider '{other}' (openai, lmstudio, noop)"),
    }
    match cfg.vectors.provider.as_str() {
        "qdrant" => {
            if cfg.vectors.url.is_none() {
                bail!("vectors.url is required for the qdrant provider");
            }
        }
        "memory" => {}
        other => bail!("unknown vectors.provider '{other}' (qdrant, memory)"),
    }
    match cfg.content.provider.as_str() {
        "export_dir" => {
            if cfg.content.export_dir.is_none() {
                bail!("content.export_dir is required for the export_dir provider");
            }
        }
        "memory" => {}
        other => bail!("unknown content.provider '{other}' (export_dir, memory)"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_with_only_required_fields_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notesync.toml");
        std::fs::write(
            &path,
            r#"
            [content]
            export_dir = "/tmp/notes-export"

            [sync]
            batch_size = 5
            "#,
        )
        .unwrap();
        let cfg = load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(cfg.sync.batch_size, 5);
        assert_eq!(cfg.sync.alert_threshold, 3);
        assert_eq!(cfg.embeddings.max_input_chars, 8000);
        assert_eq!(cfg.search.oversample_factor, 3);
        assert_eq!(cfg.vectors.collection, "notes");
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut cfg = AppConfig::default();
        cfg.content.export_dir = Some("/tmp".into());
        cfg.sync.batch_size = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn export_dir_provider_needs_a_directory() {
        let cfg = AppConfig::default();
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("export_dir"));
    }

    #[test]
    fn scaled_timeout_respects_floor() {
        let t = ScaledTimeout {
            floor_secs: 60,
            per_item_secs: 3,
        };
        assert_eq!(t.for_items(1).as_secs(), 60);
        assert_eq!(t.for_items(100).as_secs(), 300);
    }
}
