use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single memory entry, persisted as `<sanitized_key>.md` with a YAML
/// front-matter header (§4.10, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    /// Set when the entry lives in `archive/`; cleared by `restore_from_archive`.
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    pub fn new(key: String, content: String, tags: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            key,
            content,
            tags,
            created_at: now,
            updated_at: now,
            metadata: serde_json::Map::new(),
            archived_at: None,
        }
    }

    pub fn matches_query(&self, q: &str) -> bool {
        let q = q.to_ascii_lowercase();
        self.key.to_ascii_lowercase().contains(&q) || self.content.to_ascii_lowercase().contains(&q)
    }

    pub fn matches_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }
}
