use crate::{ensure_success, ProviderError};
use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub collection: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Clone)]
pub struct QdrantClient {
    client: Client,
    cfg: QdrantConfig,
}

/// Qdrant only accepts unsigned integers or UUIDs as point ids, so item ids are
/// mapped onto a stable UUID-shaped digest. The original id travels in the payload.
pub fn point_id(item_id: &str) -> String {
    let hash = blake3::hash(item_id.as_bytes());
    let hex = hash.to_hex();
    let h = &hex.as_str()[..32];
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

impl QdrantClient {
    pub fn new(cfg: QdrantConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        Ok(Self { client, cfg })
    }

    pub fn collection(&self) -> &str {
        &self.cfg.collection
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!(
            "{}/collections/{}{}",
            self.cfg.url.trim_end_matches('/'),
            self.cfg.collection,
            suffix
        )
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        url: String,
        body: Option<&B>,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut builder = self.client.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if let Some(key) = &self.cfg.api_key {
            builder = builder.header("api-key", key);
        }
        let resp = builder.send().await.map_err(ProviderError::from_send)?;
        ensure_success(resp).await
    }

    async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        body: Option<&B>,
    ) -> Result<T, ProviderError> {
        let resp = self.send(method, url, body).await?;
        resp.json()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))
    }

    /// Probe the server root; any 2xx means the index is reachable.
    pub async fn health(&self) -> Result<(), ProviderError> {
        let url = format!("{}/", self.cfg.url.trim_end_matches('/'));
        self.send::<()>(Method::GET, url, None).await?;
        Ok(())
    }

    /// Create the collection with cosine distance unless it already exists.
    pub async fn ensure_collection(&self, dims: usize) -> Result<(), ProviderError> {
        let url = self.collection_url("");
        let mut builder = self.client.get(&url);
        if let Some(key) = &self.cfg.api_key {
            builder = builder.header("api-key", key);
        }
        let resp = builder.send().await.map_err(ProviderError::from_send)?;
        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status() != reqwest::StatusCode::NOT_FOUND {
            ensure_success(resp).await?;
            return Ok(());
        }

        tracing::info!(collection = %self.cfg.collection, dims, "creating qdrant collection");
        let body = serde_json::json!({
            "vectors": { "size": dims, "distance": "Cosine" }
        });
        self.send(Method::PUT, url, Some(&body)).await?;

        // Keyword index on item_id keeps delete-by-id filters cheap.
        let index_body = serde_json::json!({
            "field_name": "item_id",
            "field_schema": "keyword"
        });
        self.send(Method::PUT, self.collection_url("/index"), Some(&index_body))
            .await?;
        Ok(())
    }

    /// Drop the collection; a missing collection is not an error.
    pub async fn delete_collection(&self) -> Result<(), ProviderError> {
        let mut builder = self.client.delete(self.collection_url(""));
        if let Some(key) = &self.cfg.api_key {
            builder = builder.header("api-key", key);
        }
        let resp = builder.send().await.map_err(ProviderError::from_send)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(resp).await?;
        Ok(())
    }

    pub async fn search(
        &self,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<serde_json::Value>,
    ) -> Result<QdrantSearchResponse, ProviderError> {
        #[derive(Serialize)]
        struct SearchRequest {
            vector: Vec<f32>,
            limit: u64,
            with_payload: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            filter: Option<serde_json::Value>,
        }
        let body = SearchRequest {
            vector,
            limit,
            with_payload: true,
            filter,
        };
        self.send_json(Method::POST, self.collection_url("/points/search"), Some(&body))
            .await
    }

    pub async fn upsert(&self, points: Vec<QdrantPoint>) -> Result<(), ProviderError> {
        if points.is_empty() {
            return Ok(());
        }
        let req = QdrantUpsert { points };
        self.send(
            Method::PUT,
            self.collection_url("/points?wait=true"),
            Some(&req),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_by_filter(&self, filter: serde_json::Value) -> Result<(), ProviderError> {
        #[derive(Serialize)]
        struct DeletePoints {
            filter: serde_json::Value,
        }
        let body = DeletePoints { filter };
        self.send(
            Method::POST,
            self.collection_url("/points/delete?wait=true"),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<u64, ProviderError> {
        let body = serde_json::json!({ "exact": true });
        let resp: QdrantCountResponse = self
            .send_json(Method::POST, self.collection_url("/points/count"), Some(&body))
            .await?;
        Ok(resp.result.count)
    }
}

#[derive(Debug, Serialize)]
pub struct QdrantUpsert {
    pub points: Vec<QdrantPoint>,
}

#[derive(Debug, Serialize)]
pub struct QdrantPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct QdrantSearchResponse {
    pub result: Vec<SearchResult>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SearchResult {
    pub id: serde_json::Value,
    pub score: f32,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct QdrantCountResponse {
    result: CountResult,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_id_is_stable_uuid_shape() {
        let a = point_id("x-coredata://ABC/ICNote/p42");
        let b = point_id("x-coredata://ABC/ICNote/p42");
        assert_eq!(a, b);
        assert_eq!(a.len(), 36);
        let parts: Vec<&str> = a.split('-').collect();
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert_ne!(a, point_id("x-coredata://ABC/ICNote/p43"));
    }

    #[test]
    fn collection_url_trims_trailing_slash() {
        let client = QdrantClient::new(QdrantConfig {
            url: "http://localhost:6333/".into(),
            collection: "notes".into(),
            api_key: None,
            timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(
            client.collection_url("/points/search"),
            "http://localhost:6333/collections/notes/points/search"
        );
    }
}
