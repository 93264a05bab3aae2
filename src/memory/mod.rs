//! Memory Store (spec §4.10, §6).
//!
//! Two scopes share this implementation: **project**
//! (`<project>/<mcp_dir>/<session>/memory/`) and **global**
//! (`~/.multi-agent-mcp/memory/`). Entry files are `<sanitized_key>.md`
//! with a YAML front matter header (`key, tags, created_at, updated_at,
//! metadata`); archived entries live alongside in an `archive/` subdir.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::Result;
use crate::models::{sanitize_filename, MemoryEntry};

pub struct MemoryStore {
    root: PathBuf,
    pub max_entries: usize,
    pub ttl_days: i64,
    pub auto_prune: bool,
}

impl MemoryStore {
    pub fn new(root: PathBuf, max_entries: usize, ttl_days: i64, auto_prune: bool) -> Self {
        Self {
            root,
            max_entries,
            ttl_days,
            auto_prune,
        }
    }

    fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.md", sanitize_filename(key, "entry")))
    }

    fn archive_path(&self, key: &str) -> PathBuf {
        self.archive_dir()
            .join(format!("{}.md", sanitize_filename(key, "entry")))
    }

    pub fn save(&self, key: &str, content: &str, tags: Vec<String>) -> Result<MemoryEntry> {
        let sanitized_key = sanitize_filename(key, "entry");
        let path = self.entry_path(&sanitized_key);
        let entry = if let Some(mut existing) = self.get(&sanitized_key)? {
            existing.content = content.to_string();
            existing.tags = tags;
            existing.updated_at = Utc::now();
            existing
        } else {
            MemoryEntry::new(sanitized_key, content.to_string(), tags)
        };
        write_entry(&path, &entry)?;
        if self.auto_prune {
            self.prune()?;
        }
        Ok(entry)
    }

    pub fn get(&self, key: &str) -> Result<Option<MemoryEntry>> {
        read_entry(&self.entry_path(key))
    }

    /// Up to `max_entries` most-recent active entries, newest mtime first.
    pub fn list(&self) -> Result<Vec<MemoryEntry>> {
        let mut entries = self.list_dir(&self.root)?;
        entries.truncate(self.max_entries);
        Ok(entries)
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<MemoryEntry>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut with_mtime: Vec<(std::time::SystemTime, MemoryEntry)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() || path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let mtime = entry.metadata()?.modified()?;
            if let Some(parsed) = read_entry(&path)? {
                with_mtime.push((mtime, parsed));
            }
        }
        with_mtime.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(with_mtime.into_iter().map(|(_, e)| e).collect())
    }

    pub fn search(&self, q: &str, tags: Option<&[String]>, limit: usize) -> Result<Vec<MemoryEntry>> {
        let all = self.list_dir(&self.root)?;
        Ok(search_in(all, q, tags, limit))
    }

    pub fn search_archive(
        &self,
        q: &str,
        tags: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>> {
        let all = self.list_dir(&self.archive_dir())?;
        Ok(search_in(all, q, tags, limit))
    }

    pub fn list_archive(&self) -> Result<Vec<MemoryEntry>> {
        self.list_dir(&self.archive_dir())
    }

    /// 1. Move entries past TTL to `archive/`. 2. If still over `max_entries`,
    /// move the oldest-by-`updated_at` active entries until size ≤ cap.
    pub fn prune(&self) -> Result<(usize, usize)> {
        let cutoff = Utc::now() - chrono::Duration::days(self.ttl_days);
        let mut ttl_archived = 0usize;
        let mut active = self.list_dir(&self.root)?;

        let mut kept = Vec::new();
        for entry in active.drain(..) {
            if entry.updated_at < cutoff {
                self.archive_one(&entry)?;
                ttl_archived += 1;
            } else {
                kept.push(entry);
            }
        }

        kept.sort_by_key(|e| e.updated_at);
        let mut cap_archived = 0usize;
        while kept.len() > self.max_entries {
            let oldest = kept.remove(0);
            self.archive_one(&oldest)?;
            cap_archived += 1;
        }
        Ok((ttl_archived, cap_archived))
    }

    /// Move one entry from active storage into `archive/`, stamping
    /// `archived_at`. Filename collisions in `archive/` append a timestamp
    /// suffix rather than overwrite.
    fn archive_one(&self, entry: &MemoryEntry) -> Result<()> {
        let mut archived = entry.clone();
        archived.archived_at = Some(Utc::now());
        let mut dest = self.archive_path(&entry.key);
        if dest.is_file() {
            let suffix = Utc::now().format("%Y%m%d%H%M%S%6f");
            dest = self
                .archive_dir()
                .join(format!("{}_{suffix}.md", sanitize_filename(&entry.key, "entry")));
        }
        write_entry(&dest, &archived)?;
        let active_path = self.entry_path(&entry.key);
        if active_path.is_file() {
            std::fs::remove_file(active_path)?;
        }
        Ok(())
    }

    /// Restore an entry from `archive/`: clears `archived_at`, bumps
    /// `updated_at = now`, and re-adds it to the active store.
    pub fn restore_from_archive(&self, key: &str) -> Result<Option<MemoryEntry>> {
        let archive_path = self.archive_path(key);
        let Some(mut entry) = read_entry(&archive_path)? else {
            return Ok(None);
        };
        entry.archived_at = None;
        entry.updated_at = Utc::now();
        write_entry(&self.entry_path(key), &entry)?;
        if archive_path.is_file() {
            std::fs::remove_file(&archive_path)?;
        }
        Ok(Some(entry))
    }
}

fn search_in(
    entries: Vec<MemoryEntry>,
    q: &str,
    tags: Option<&[String]>,
    limit: usize,
) -> Vec<MemoryEntry> {
    entries
        .into_iter()
        .filter(|e| e.matches_query(q))
        .filter(|e| tags.map(|t| e.matches_tags(t)).unwrap_or(true))
        .take(limit)
        .collect()
}

fn write_entry(path: &Path, entry: &MemoryEntry) -> Result<()> {
    let yaml = serde_yaml::to_string(entry)?;
    crate::utils::atomic_write(path, &format!("---\n{yaml}---\n{}\n", entry.content))
}

fn read_entry(path: &Path) -> Result<Option<MemoryEntry>> {
    if !path.is_file() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    let Some(rest) = contents.strip_prefix("---\n") else {
        return Ok(None);
    };
    let Some(end) = rest.find("\n---\n") else {
        return Ok(None);
    };
    let (front, body) = rest.split_at(end);
    let body = body.strip_prefix("\n---\n").unwrap_or(body).trim_end_matches('\n');
    let mut entry: MemoryEntry = serde_yaml::from_str(front)?;
    entry.content = body.to_string();
    Ok(Some(entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> MemoryStore {
        MemoryStore::new(dir.to_path_buf(), 1000, 90, false)
    }

    #[test]
    fn save_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save("k1", "hello world", vec!["a".into()]).unwrap();
        let entry = store.get("k1").unwrap().unwrap();
        assert_eq!(entry.content, "hello world");
        assert_eq!(entry.tags, vec!["a".to_string()]);
    }

    #[test]
    fn prune_then_restore_refreshes_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().to_path_buf(), 1000, 0, false);
        store.save("k1", "v1", vec![]).unwrap();
        let (ttl_archived, _) = store.prune().unwrap();
        assert_eq!(ttl_archived, 1);
        assert!(store.get("k1").unwrap().is_none());

        let restored = store.restore_from_archive("k1").unwrap().unwrap();
        assert!(restored.archived_at.is_none());
        assert!(store.get("k1").unwrap().is_some());
    }

    #[test]
    fn prune_enforces_count_cap_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().to_path_buf(), 2, 9999, false);
        let mut e1 = store.save("k1", "v1", vec![]).unwrap();
        e1.updated_at = Utc::now() - chrono::Duration::seconds(30);
        write_entry(&store.entry_path("k1"), &e1).unwrap();
        store.save("k2", "v2", vec![]).unwrap();
        store.save("k3", "v3", vec![]).unwrap();

        let (_, cap_archived) = store.prune().unwrap();
        assert_eq!(cap_archived, 1);
        assert!(store.get("k1").unwrap().is_none());
        assert!(store.get("k2").unwrap().is_some());
        assert!(store.get("k3").unwrap().is_some());
    }

    #[test]
    fn search_is_case_insensitive_substring_over_key_or_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save("architecture-notes", "Uses EVENT sourcing", vec!["design".into()]).unwrap();
        store.save("unrelated", "nothing interesting", vec![]).unwrap();

        let hits = store.search("event", None, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "architecture-notes");

        let tag_hits = store.search("", Some(&["design".to_string()]), 10).unwrap();
        assert_eq!(tag_hits.len(), 1);
    }
}
