use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use storage::models::{ItemSignature, SyncState, SyncTotals};

/// A note as the content source hands it over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    #[serde(alias = "name")]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub plaintext: String,
    #[serde(default, alias = "folder")]
    pub group: String,
    #[serde(default, alias = "creationDate")]
    pub created_at: String,
    /// Opaque version token; compared for equality only.
    #[serde(default, alias = "modificationDate")]
    pub modified_at: String,
}

impl ContentItem {
    pub fn content_hash(&self) -> String {
        content_hash(&self.body)
    }

    pub fn signature(&self) -> ItemSignature {
        ItemSignature {
            content_hash: self.content_hash(),
            modified_at: self.modified_at.clone(),
            group: self.group.clone(),
        }
    }

    pub fn metadata(&self) -> ItemMetadata {
        ItemMetadata {
            id: self.id.clone(),
            group: self.group.clone(),
            modified_at: self.modified_at.clone(),
        }
    }

    /// Plain text if the source provided it, otherwise the raw body.
    pub fn text(&self) -> &str {
        if self.plaintext.is_empty() {
            &self.body
        } else {
            &self.plaintext
        }
    }
}

/// Digest of the body only; metadata edits leave it unchanged.
pub fn content_hash(body: &str) -> String {
    blake3::hash(body.as_bytes()).to_hex().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub id: String,
    pub group: String,
    pub modified_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCount {
    pub group: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub id: String,
    pub title: String,
    pub plaintext: String,
    pub group: String,
    pub created_at: String,
    pub modified_at: String,
    pub content_hash: String,
    pub synced_at: DateTime<Utc>,
    #[serde(skip)]
    pub vector: Vec<f32>,
}

impl IndexRecord {
    pub fn from_item(item: &ContentItem, vector: Vec<f32>, synced_at: DateTime<Utc>) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            plaintext: item.text().to_string(),
            group: item.group.clone(),
            created_at: item.created_at.clone(),
            modified_at: item.modified_at.clone(),
            content_hash: item.content_hash(),
            synced_at,
            vector,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub new: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.new.len() + self.modified.len() + self.deleted.len()
    }

    /// Ids that need fetching and embedding, new ones first.
    pub fn to_upsert(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.new.len() + self.modified.len());
        out.extend(self.new.iter().cloned());
        out.extend(self.modified.iter().cloned());
        out
    }
}

/// How much of the item universe a metadata listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanCoverage {
    /// Every group was listed; absent ids really are gone.
    Full,
    /// Only some groups were listed; absence proves nothing.
    Partial,
}
