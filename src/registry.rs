//! Registry & Config Store (spec §4.2).
//!
//! Two file-backed stores: the global, cross-project agent registry under
//! `~/.multi-agent-mcp/agents/<agent_id>.json`, and the per-project
//! `config.json` read by every MCP process serving that project.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::utils::atomic_write;

/// One global registry entry: which project (and optionally session) owns
/// a given agent id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryEntry {
    pub agent_id: String,
    pub owner_id: String,
    pub project_root: String,
    pub session_id: Option<String>,
}

/// Global registry root: `~/.multi-agent-mcp/agents/`.
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    pub fn new(home: &Path) -> Self {
        Self {
            root: home.join(".multi-agent-mcp").join("agents"),
        }
    }

    fn entry_path(&self, agent_id: &str) -> PathBuf {
        self.root.join(format!("{agent_id}.json"))
    }

    pub fn register(&self, entry: &RegistryEntry) -> Result<()> {
        let path = self.entry_path(&entry.agent_id);
        let contents = serde_json::to_string_pretty(entry)?;
        atomic_write(&path, &contents)
    }

    pub fn lookup(&self, agent_id: &str) -> Result<Option<RegistryEntry>> {
        let path = self.entry_path(agent_id);
        if !path.is_file() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub fn remove(&self, agent_id: &str) -> Result<()> {
        let path = self.entry_path(agent_id);
        if path.is_file() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Remove every entry whose `owner_id` matches (spec §4.2, used by
    /// teardown step 6).
    pub fn remove_by_owner(&self, owner_id: &str) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        if !self.root.is_dir() {
            return Ok(removed);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(parsed) = serde_json::from_str::<RegistryEntry>(&contents) else {
                continue;
            };
            if parsed.owner_id == owner_id {
                std::fs::remove_file(&path)?;
                removed.push(parsed.agent_id);
            }
        }
        Ok(removed)
    }

    pub fn list_all(&self) -> Result<Vec<RegistryEntry>> {
        let mut out = Vec::new();
        if !self.root.is_dir() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            out.push(serde_json::from_str(&contents)?);
        }
        Ok(out)
    }
}

/// Per-project `config.json`: `{mcp_tool_prefix, session_id?, enable_git}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectConfig {
    pub mcp_tool_prefix: String,
    pub session_id: Option<String>,
    pub enable_git: bool,
}

impl ProjectConfig {
    pub fn new(mcp_tool_prefix: String, enable_git: bool) -> Self {
        Self {
            mcp_tool_prefix,
            session_id: None,
            enable_git,
        }
    }
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(project_root: &Path, mcp_dir: &str) -> Self {
        Self {
            path: project_root.join(mcp_dir).join("config.json"),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read `config.json`. A parse failure surfaces as `invalid_config`,
    /// never a silent default (spec §4.2).
    pub fn read(&self) -> Result<Option<ProjectConfig>> {
        if !self.path.is_file() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        let parsed: ProjectConfig = serde_json::from_str(&contents)
            .map_err(|e| FleetError::InvalidConfig(format!("{}: {e}", self.path.display())))?;
        Ok(Some(parsed))
    }

    pub fn write(&self, config: &ProjectConfig) -> Result<()> {
        let contents = serde_json::to_string_pretty(config)?;
        atomic_write(&self.path, &contents)
    }

    /// Clear `session_id` in place, preserving every other field (teardown
    /// step 8).
    pub fn clear_session_id(&self) -> Result<()> {
        if let Some(mut config) = self.read()? {
            config.session_id = None;
            self.write(&config)?;
        }
        Ok(())
    }

    pub fn set_session_id(&self, session_id: &str) -> Result<()> {
        let mut config = self.read()?.unwrap_or_else(|| {
            ProjectConfig::new("mcp".to_string(), true)
        });
        config.session_id = Some(session_id.to_string());
        self.write(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup_roundtrips() {
        let home = tempfile::tempdir().unwrap();
        let registry = Registry::new(home.path());
        let entry = RegistryEntry {
            agent_id: "agent-1".into(),
            owner_id: "owner-1".into(),
            project_root: "/repo".into(),
            session_id: Some("sess-1".into()),
        };
        registry.register(&entry).unwrap();
        assert_eq!(registry.lookup("agent-1").unwrap(), Some(entry));
    }

    #[test]
    fn remove_by_owner_deletes_only_matching_entries() {
        let home = tempfile::tempdir().unwrap();
        let registry = Registry::new(home.path());
        registry
            .register(&RegistryEntry {
                agent_id: "a1".into(),
                owner_id: "owner-1".into(),
                project_root: "/repo".into(),
                session_id: None,
            })
            .unwrap();
        registry
            .register(&RegistryEntry {
                agent_id: "a2".into(),
                owner_id: "owner-2".into(),
                project_root: "/repo".into(),
                session_id: None,
            })
            .unwrap();
        let removed = registry.remove_by_owner("owner-1").unwrap();
        assert_eq!(removed, vec!["a1".to_string()]);
        assert!(registry.lookup("a1").unwrap().is_none());
        assert!(registry.lookup("a2").unwrap().is_some());
    }

    #[test]
    fn config_store_parse_failure_is_invalid_config() {
        let project = tempfile::tempdir().unwrap();
        let mcp_dir = project.path().join(".multi-agent-mcp");
        std::fs::create_dir_all(&mcp_dir).unwrap();
        std::fs::write(mcp_dir.join("config.json"), "not json").unwrap();
        let store = ConfigStore::new(project.path(), ".multi-agent-mcp");
        let err = store.read().unwrap_err();
        assert_eq!(err.code(), "invalid_config");
    }

    #[test]
    fn clear_session_id_preserves_other_fields() {
        let project = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(project.path(), ".multi-agent-mcp");
        store
            .write(&ProjectConfig {
                mcp_tool_prefix: "mcp".into(),
                session_id: Some("sess-1".into()),
                enable_git: true,
            })
            .unwrap();
        store.clear_session_id().unwrap();
        let config = store.read().unwrap().unwrap();
        assert_eq!(config.session_id, None);
        assert!(config.enable_git);
    }
}
