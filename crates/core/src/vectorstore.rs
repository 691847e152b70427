use crate::error::SyncError;
use crate::models::IndexRecord;
use providers::qdrant::{point_id, QdrantClient, QdrantPoint};
use providers::ProviderError;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const SERVICE: &str = "vector index";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: IndexRecord,
    /// Cosine distance in `[0, 2]`; smaller is closer.
    pub distance: f32,
}

#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    async fn ensure_collection(&self, dims: usize) -> Result<(), SyncError>;
    /// Drop every record and recreate the collection empty.
    async fn reset(&self, dims: usize) -> Result<(), SyncError>;
    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<(), SyncError>;
    async fn delete(&self, ids: &[String]) -> Result<(), SyncError>;
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredRecord>, SyncError>;
    async fn count(&self) -> Result<u64, SyncError>;
    async fn health(&self) -> Result<(), SyncError>;
}

fn index_error(err: ProviderError) -> SyncError {
    match err {
        ProviderError::RequestFailed(msg) => SyncError::Index(msg),
        other => SyncError::from_provider(SERVICE, other),
    }
}

pub struct QdrantIndex {
    client: QdrantClient,
}

impl QdrantIndex {
    pub fn new(client: QdrantClient) -> Self {
        Self { client }
    }

    fn to_point(record: IndexRecord) -> Result<QdrantPoint, SyncError> {
        let id = point_id(&record.id);
        let item_id = serde_json::Value::String(record.id.clone());
        let vector = record.vector.clone();
        let payload: HashMap<String, serde_json::Value> = match serde_json::to_value(&record)
            .map_err(|e| SyncError::Index(e.to_string()))?
        {
            serde_json::Value::Object(map) => {
                let mut payload: HashMap<_, _> = map.into_iter().collect();
                payload.insert("item_id".to_string(), item_id);
                payload
            }
            _ => return Err(SyncError::Index("record did not serialize to an object".into())),
        };
        Ok(QdrantPoint {
            id,
            vector,
            payload,
        })
    }
}

#[async_trait::async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_collection(&self, dims: usize) -> Result<(), SyncError> {
        self.client.ensure_collection(dims).await.map_err(index_error)
    }

    async fn reset(&self, dims: usize) -> Result<(), SyncError> {
        tracing::info!(collection = %self.client.collection(), "dropping collection for rebuild");
        self.client.delete_collection().await.map_err(index_error)?;
        self.client.ensure_collection(dims).await.map_err(index_error)
    }

    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<(), SyncError> {
        let points = records
            .into_iter()
            .map(Self::to_point)
            .collect::<Result<Vec<_>, _>>()?;
        self.client.upsert(points).await.map_err(index_error)
    }

    async fn delete(&self, ids: &[String]) -> Result<(), SyncError> {
        if ids.is_empty() {
            return Ok(());
        }
        let filter = serde_json::json!({
            "must": [{ "key": "item_id", "match": { "any": ids } }]
        });
        self.client.delete_by_filter(filter).await.map_err(index_error)
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredRecord>, SyncError> {
        let qfilter = filter.group.as_ref().map(|g| {
            serde_json::json!({ "must": [{ "key": "group", "match": { "value": g } }] })
        });
        let resp = self
            .client
            .search(vector.to_vec(), limit as u64, qfilter)
            .await
            .map_err(index_error)?;
        let mut out = Vec::with_capacity(resp.result.len());
        for hit in resp.result {
            let Some(payload) = hit.payload else {
                tracing::warn!(point = %hit.id, "search hit without payload");
                continue;
            };
            match serde_json::from_value::<IndexRecord>(payload) {
                Ok(record) => out.push(ScoredRecord {
                    record,
                    distance: 1.0 - hit.score,
                }),
                Err(e) => tracing::warn!(point = %hit.id, error = %e, "undecodable payload"),
            }
        }
        Ok(out)
    }

    async fn count(&self) -> Result<u64, SyncError> {
        self.client.count().await.map_err(index_error)
    }

    async fn health(&self) -> Result<(), SyncError> {
        self.client.health().await.map_err(index_error)
    }
}

/// Brute-force cosine index held in process. Clones share storage.
#[derive(Clone, Default)]
pub struct MemoryIndex {
    inner: Arc<RwLock<MemoryIndexInner>>,
}

#[derive(Default)]
struct MemoryIndexInner {
    records: BTreeMap<String, IndexRecord>,
    dims: Option<usize>,
    unavailable: bool,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.read().await.records.keys().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<IndexRecord> {
        self.inner.read().await.records.get(id).cloned()
    }

    pub async fn set_unavailable(&self, down: bool) {
        self.inner.write().await.unavailable = down;
    }

    async fn check(&self) -> Result<(), SyncError> {
        if self.inner.read().await.unavailable {
            return Err(SyncError::unavailable(SERVICE, "memory index marked down"));
        }
        Ok(())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[async_trait::async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_collection(&self, dims: usize) -> Result<(), SyncError> {
        self.check().await?;
        self.inner.write().await.dims.get_or_insert(dims);
        Ok(())
    }

    async fn reset(&self, dims: usize) -> Result<(), SyncError> {
        self.check().await?;
        let mut guard = self.inner.write().await;
        guard.records.clear();
        guard.dims = Some(dims);
        Ok(())
    }

    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<(), SyncError> {
        self.check().await?;
        let mut guard = self.inner.write().await;
        for record in records {
            if let Some(dims) = guard.dims {
                if record.vector.len() != dims {
                    return Err(SyncError::Index(format!(
                        "vector for {} has {} dimensions, collection has {dims}",
                        record.id,
                        record.vector.len()
                    )));
                }
            }
            guard.records.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), SyncError> {
        self.check().await?;
        let mut guard = self.inner.write().await;
        for id in ids {
            guard.records.remove(id);
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredRecord>, SyncError> {
        self.check().await?;
        let guard = self.inner.read().await;
        let mut hits: Vec<ScoredRecord> = guard
            .records
            .values()
            .filter(|r| filter.group.as_ref().map_or(true, |g| &r.group == g))
            .map(|r| ScoredRecord {
                record: r.clone(),
                distance: 1.0 - cosine_similarity(vector, &r.vector),
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self) -> Result<u64, SyncError> {
        self.check().await?;
        Ok(self.inner.read().await.records.len() as u64)
    }

    async fn health(&self) -> Result<(), SyncError> {
        self.check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str, group: &str, vector: Vec<f32>) -> IndexRecord {
        IndexRecord {
            id: id.into(),
            title: id.to_uppercase(),
            plaintext: String::new(),
            group: group.into(),
            created_at: String::new(),
            modified_at: "t1".into(),
            content_hash: "h".into(),
            synced_at: Utc::now(),
            vector,
        }
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn memory_index_orders_by_distance_and_filters() {
        let index = MemoryIndex::new();
        index.ensure_collection(2).await.unwrap();
        index
            .upsert(vec![
                record("a", "Work", vec![1.0, 0.0]),
                record("b", "Home", vec![0.9, 0.1]),
                record("c", "Work", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = index
            .search(&[1.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.record.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(hits[0].distance.abs() < 1e-6);

        let work = index
            .search(
                &[1.0, 0.0],
                1,
                &SearchFilter {
                    group: Some("Work".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].record.id, "a");
    }

    #[tokio::test]
    async fn upsert_replaces_and_delete_removes() {
        let index = MemoryIndex::new();
        index.upsert(vec![record("a", "Work", vec![1.0])]).await.unwrap();
        index.upsert(vec![record("a", "Home", vec![1.0])]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        assert_eq!(index.get("a").await.unwrap().group, "Home");
        index.delete(&["a".into(), "missing".into()]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);

        index.upsert(vec![record("b", "Home", vec![1.0])]).await.unwrap();
        index.reset(1).await.unwrap();
        assert!(index.ids().await.is_empty());
    }

    #[tokio::test]
    async fn wrong_dimensions_rejected() {
        let index = MemoryIndex::new();
        index.ensure_collection(3).await.unwrap();
        let err = index
            .upsert(vec![record("a", "Work", vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Index(_)));
    }

    #[test]
    fn qdrant_point_carries_item_id() {
        let point = QdrantIndex::to_point(record("x-coredata://p1", "Work", vec![0.5])).unwrap();
        assert_eq!(point.id, point_id("x-coredata://p1"));
        assert_eq!(point.payload["item_id"], "x-coredata://p1");
        assert_eq!(point.payload["group"], "Work");
        assert!(!point.payload.contains_key("vector"));
        let back: IndexRecord =
            serde_json::from_value(serde_json::to_value(&point.payload).unwrap()).unwrap();
        assert_eq!(back.id, "x-coredata://p1");
    }
}
