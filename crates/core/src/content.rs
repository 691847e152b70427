//! The content source being mirrored into the index.
//!
//! [`ExportDirProvider`] reads a notes export laid out as one directory per group
//! with one JSON document per note. [`MemoryProvider`] keeps items in process.

use crate::error::SyncError;
use crate::models::{ContentItem, GroupCount, ItemMetadata};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Group assigned to notes that sit directly in the export root.
pub const DEFAULT_GROUP: &str = "Notes";

#[async_trait::async_trait]
pub trait ContentProvider: Send + Sync {
    /// Item count per group. Must be cheap; it runs every cycle.
    async fn list_groups(&self) -> Result<Vec<GroupCount>, SyncError>;

    /// Metadata for one group, or for every group when `group` is `None`.
    async fn list_item_metadata(&self, group: Option<&str>)
        -> Result<Vec<ItemMetadata>, SyncError>;

    /// Full items for `ids`. Ids that no longer exist are simply absent from the result.
    async fn fetch_items(&self, ids: &[String]) -> Result<Vec<ContentItem>, SyncError>;

    async fn health_check(&self) -> Result<(), SyncError>;
}

pub struct ExportDirProvider {
    root: PathBuf,
    /// File each listed id was read from, so fetches open only what they need.
    paths: RwLock<HashMap<String, PathBuf>>,
}

impl ExportDirProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            paths: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn load_all(&self, group: Option<String>) -> Result<Vec<ContentItem>, SyncError> {
        let root = self.root.clone();
        let whole_export = group.is_none();
        let found = task::spawn_blocking(move || read_export(&root, group.as_deref()))
            .await
            .map_err(|e| SyncError::Other(e.into()))??;

        let mut paths = self.paths.write().await;
        if whole_export {
            paths.clear();
        }
        let mut items = Vec::with_capacity(found.len());
        for (item, path) in found {
            paths.insert(item.id.clone(), path);
            items.push(item);
        }
        Ok(items)
    }

    /// Read the notes whose files are already known. Returns the items found and
    /// the ids that need a walk of the export because their file is unknown or stale.
    async fn read_known(
        &self,
        ids: &[String],
    ) -> Result<(Vec<ContentItem>, Vec<String>), SyncError> {
        let known: Vec<(String, Option<PathBuf>)> = {
            let paths = self.paths.read().await;
            ids.iter()
                .map(|id| (id.clone(), paths.get(id).cloned()))
                .collect()
        };
        let root = self.root.clone();
        task::spawn_blocking(move || {
            let mut items = Vec::new();
            let mut missed = Vec::new();
            for (id, path) in known {
                let Some(path) = path else {
                    missed.push(id);
                    continue;
                };
                match read_note(&root, &path) {
                    Ok(item) if item.id == id => items.push(item),
                    Ok(_) => missed.push(id),
                    Err(SyncError::PermissionDenied(msg)) => {
                        return Err(SyncError::PermissionDenied(msg))
                    }
                    Err(e) => {
                        debug!(id = %id, error = %e, "known note path is stale");
                        missed.push(id);
                    }
                }
            }
            Ok((items, missed))
        })
        .await
        .map_err(|e| SyncError::Other(e.into()))?
    }
}

fn io_error(path: &Path, err: std::io::Error) -> SyncError {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        SyncError::PermissionDenied(format!("{}: {err}", path.display()))
    } else {
        SyncError::unavailable("content", format!("{}: {err}", path.display()))
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

fn group_of(root: &Path, file: &Path) -> String {
    match file.parent().and_then(|p| p.strip_prefix(root).ok()) {
        Some(rel) if !rel.as_os_str().is_empty() => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        _ => DEFAULT_GROUP.to_string(),
    }
}

fn note_files(root: &Path) -> impl Iterator<Item = walkdir::DirEntry> + '_ {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.path()))
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                warn!(error = %err, "skipping unreadable export entry");
                None
            }
        })
        .filter(|e| {
            e.file_type().is_file()
                && e.path().extension().and_then(|x| x.to_str()) == Some("json")
        })
}

fn read_note(root: &Path, path: &Path) -> Result<ContentItem, SyncError> {
    let raw = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let mut value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| SyncError::Other(anyhow::anyhow!("{}: {e}", path.display())))?;

    // Fill the fields an export may leave out from the file itself.
    if let Some(obj) = value.as_object_mut() {
        if !obj.contains_key("id") {
            let rel = path.strip_prefix(root).unwrap_or(path).with_extension("");
            obj.insert(
                "id".into(),
                serde_json::Value::String(rel.to_string_lossy().replace('\\', "/")),
            );
        }
        if !obj.contains_key("modified_at") && !obj.contains_key("modificationDate") {
            let mtime = std::fs::metadata(path)
                .and_then(|m| m.modified())
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
                .unwrap_or_default();
            obj.insert("modified_at".into(), serde_json::Value::String(mtime));
        }
    }
    let mut item: ContentItem = serde_json::from_value(value)
        .map_err(|e| SyncError::Other(anyhow::anyhow!("{}: {e}", path.display())))?;
    // The directory is authoritative for the group.
    item.group = group_of(root, path);
    Ok(item)
}

fn read_export(
    root: &Path,
    group: Option<&str>,
) -> Result<Vec<(ContentItem, PathBuf)>, SyncError> {
    std::fs::read_dir(root).map_err(|e| io_error(root, e))?;
    let mut items = Vec::new();
    for entry in note_files(root) {
        if let Some(g) = group {
            if group_of(root, entry.path()) != g {
                continue;
            }
        }
        match read_note(root, entry.path()) {
            Ok(item) => items.push((item, entry.into_path())),
            Err(SyncError::PermissionDenied(msg)) => return Err(SyncError::PermissionDenied(msg)),
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "skipping unreadable note")
            }
        }
    }
    items.sort_by(|a, b| a.0.id.cmp(&b.0.id));
    Ok(items)
}

#[async_trait::async_trait]
impl ContentProvider for ExportDirProvider {
    async fn list_groups(&self) -> Result<Vec<GroupCount>, SyncError> {
        let root = self.root.clone();
        task::spawn_blocking(move || {
            std::fs::read_dir(&root).map_err(|e| io_error(&root, e))?;
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            for entry in note_files(&root) {
                *counts.entry(group_of(&root, entry.path())).or_insert(0) += 1;
            }
            Ok(counts
                .into_iter()
                .map(|(group, count)| GroupCount { group, count })
                .collect())
        })
        .await
        .map_err(|e| SyncError::Other(e.into()))?
    }

    async fn list_item_metadata(
        &self,
        group: Option<&str>,
    ) -> Result<Vec<ItemMetadata>, SyncError> {
        let items = self.load_all(group.map(str::to_string)).await?;
        debug!(group = ?group, items = items.len(), "listed export metadata");
        Ok(items.iter().map(ContentItem::metadata).collect())
    }

    async fn fetch_items(&self, ids: &[String]) -> Result<Vec<ContentItem>, SyncError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let (mut items, missed) = self.read_known(ids).await?;
        if !missed.is_empty() {
            debug!(missed = missed.len(), "walking export for unknown ids");
            let wanted: HashSet<&str> = missed.iter().map(String::as_str).collect();
            items.extend(
                self.load_all(None)
                    .await?
                    .into_iter()
                    .filter(|i| wanted.contains(i.id.as_str())),
            );
        }
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    async fn health_check(&self) -> Result<(), SyncError> {
        let meta = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;
        if !meta.is_dir() {
            return Err(SyncError::unavailable(
                "content",
                format!("{} is not a directory", self.root.display()),
            ));
        }
        Ok(())
    }
}

/// In-process content source. Clones share the same items.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    inner: Arc<RwLock<MemoryContent>>,
}

#[derive(Default)]
struct MemoryContent {
    items: BTreeMap<String, ContentItem>,
    unavailable: Option<String>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_items(items: impl IntoIterator<Item = ContentItem>) -> Self {
        let provider = Self::new();
        for item in items {
            provider.upsert(item).await;
        }
        provider
    }

    pub async fn upsert(&self, item: ContentItem) {
        self.inner.write().await.items.insert(item.id.clone(), item);
    }

    pub async fn remove(&self, id: &str) -> Option<ContentItem> {
        self.inner.write().await.items.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<ContentItem> {
        self.inner.read().await.items.get(id).cloned()
    }

    /// Make every call fail with `ServiceUnavailable` until cleared with `None`.
    pub async fn set_unavailable(&self, reason: Option<&str>) {
        self.inner.write().await.unavailable = reason.map(str::to_string);
    }

    async fn check(&self) -> Result<(), SyncError> {
        match &self.inner.read().await.unavailable {
            Some(reason) => Err(SyncError::unavailable("content", reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ContentProvider for MemoryProvider {
    async fn list_groups(&self) -> Result<Vec<GroupCount>, SyncError> {
        self.check().await?;
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for item in self.inner.read().await.items.values() {
            *counts.entry(item.group.clone()).or_insert(0) += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(group, count)| GroupCount { group, count })
            .collect())
    }

    async fn list_item_metadata(
        &self,
        group: Option<&str>,
    ) -> Result<Vec<ItemMetadata>, SyncError> {
        self.check().await?;
        Ok(self
            .inner
            .read()
            .await
            .items
            .values()
            .filter(|i| group.map_or(true, |g| i.group == g))
            .map(ContentItem::metadata)
            .collect())
    }

    async fn fetch_items(&self, ids: &[String]) -> Result<Vec<ContentItem>, SyncError> {
        self.check().await?;
        let guard = self.inner.read().await;
        Ok(ids.iter().filter_map(|id| guard.items.get(id).cloned()).collect())
    }

    async fn health_check(&self) -> Result<(), SyncError> {
        self.check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_note(dir: &Path, rel: &str, json: serde_json::Value) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string(&json).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn export_dir_groups_by_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_note(
            dir.path(),
            "Work/standup.json",
            serde_json::json!({
                "id": "w1", "title": "Standup", "body": "notes", "modified_at": "t1"
            }),
        );
        write_note(
            dir.path(),
            "Work/Projects/roadmap.json",
            serde_json::json!({
                "id": "w2", "name": "Roadmap", "body": "q3", "modificationDate": "t2"
            }),
        );
        write_note(
            dir.path(),
            "loose.json",
            serde_json::json!({"title": "Loose", "body": "x", "modified_at": "t3"}),
        );
        std::fs::write(dir.path().join("Work/readme.txt"), "ignored").unwrap();
        std::fs::create_dir_all(dir.path().join(".trash")).unwrap();
        std::fs::write(dir.path().join(".trash/old.json"), "{}").unwrap();

        let provider = ExportDirProvider::new(dir.path());
        provider.health_check().await.unwrap();

        let groups = provider.list_groups().await.unwrap();
        assert_eq!(
            groups,
            vec![
                GroupCount { group: "Notes".into(), count: 1 },
                GroupCount { group: "Work".into(), count: 1 },
                GroupCount { group: "Work/Projects".into(), count: 1 },
            ]
        );

        let work = provider.list_item_metadata(Some("Work")).await.unwrap();
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].id, "w1");

        let all = provider.list_item_metadata(None).await.unwrap();
        let loose = all.iter().find(|m| m.group == "Notes").unwrap();
        assert_eq!(loose.id, "loose");

        let fetched = provider
            .fetch_items(&["w2".to_string(), "gone".to_string()])
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].title, "Roadmap");
        assert_eq!(fetched[0].group, "Work/Projects");
    }

    #[tokio::test]
    async fn fetch_reads_only_listed_files() {
        let dir = tempfile::tempdir().unwrap();
        write_note(
            dir.path(),
            "Work/a.json",
            serde_json::json!({"id": "a", "title": "A", "body": "alpha", "modified_at": "t1"}),
        );
        write_note(
            dir.path(),
            "Home/b.json",
            serde_json::json!({"id": "b", "title": "B", "body": "beta", "modified_at": "t1"}),
        );
        let provider = ExportDirProvider::new(dir.path());
        provider.list_item_metadata(None).await.unwrap();

        // An unrelated note going bad must not matter to a fetch of `a`.
        std::fs::write(dir.path().join("Home/b.json"), "not json").unwrap();
        let (items, missed) = provider.read_known(&["a".to_string()]).await.unwrap();
        assert!(missed.is_empty());
        assert_eq!(items[0].body, "alpha");

        let fetched = provider.fetch_items(&["a".to_string()]).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].group, "Work");
    }

    #[tokio::test]
    async fn moved_note_is_found_by_walking() {
        let dir = tempfile::tempdir().unwrap();
        write_note(
            dir.path(),
            "Work/a.json",
            serde_json::json!({"id": "a", "title": "A", "body": "alpha", "modified_at": "t1"}),
        );
        let provider = ExportDirProvider::new(dir.path());
        provider.list_item_metadata(None).await.unwrap();

        std::fs::create_dir_all(dir.path().join("Archive")).unwrap();
        std::fs::rename(dir.path().join("Work/a.json"), dir.path().join("Archive/a.json"))
            .unwrap();
        let (_, missed) = provider.read_known(&["a".to_string()]).await.unwrap();
        assert_eq!(missed, vec!["a"]);

        let fetched = provider.fetch_items(&["a".to_string()]).await.unwrap();
        assert_eq!(fetched[0].group, "Archive");
        let (items, missed) = provider.read_known(&["a".to_string()]).await.unwrap();
        assert!(missed.is_empty());
        assert_eq!(items[0].group, "Archive");
    }

    #[tokio::test]
    async fn missing_modified_at_uses_file_mtime() {
        let dir = tempfile::tempdir().unwrap();
        write_note(
            dir.path(),
            "Home/list.json",
            serde_json::json!({"id": "h1", "title": "List", "body": "eggs"}),
        );
        let provider = ExportDirProvider::new(dir.path());
        let meta = provider.list_item_metadata(None).await.unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&meta[0].modified_at).is_ok());
    }

    #[tokio::test]
    async fn missing_root_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ExportDirProvider::new(dir.path().join("nope"));
        let err = provider.health_check().await.unwrap_err();
        assert!(err.is_transient(), "got {err}");
    }

    #[tokio::test]
    async fn memory_provider_can_be_taken_down() {
        let provider = MemoryProvider::new();
        provider
            .upsert(ContentItem {
                id: "a".into(),
                title: "A".into(),
                body: "b".into(),
                plaintext: String::new(),
                group: "G".into(),
                created_at: String::new(),
                modified_at: "t1".into(),
            })
            .await;
        assert_eq!(provider.list_groups().await.unwrap()[0].count, 1);
        provider.set_unavailable(Some("locked")).await;
        assert!(provider.health_check().await.unwrap_err().is_transient());
        provider.set_unavailable(None).await;
        assert!(provider.health_check().await.is_ok());
    }
}
