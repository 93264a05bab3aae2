//! Agent Manager (spec §4.5, §6): pane slot allocation for new Workers, and
//! the session-scoped `agents.json` store that backs `AppContext.agents`.
//!
//! Slot allocation is grounded verbatim in
//! `original_source/src/tools/agent_helpers.py`'s `_get_next_worker_slot` —
//! the main window's 6 panes fill first, then extra `workers-N` windows are
//! probed in order. The file store follows the same atomic-write pattern as
//! [`crate::registry`] and [`crate::dashboard`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::error::Result;
use crate::models::{Agent, AgentStatus, Role};
use crate::utils::atomic_write;

/// Count non-terminated Workers, then probe `(window, pane)` slots in main-
/// window order `(0,1)..(0,6)` before walking extra windows `w=1,2,…` with
/// panes `0..workers_per_extra_window-1`. Terminated agents' slots are
/// immediately reusable since only non-terminated occupants are counted
/// (§4.5).
pub fn get_next_worker_slot(
    agents: &[Agent],
    settings: &Settings,
    session_name: &str,
    max_workers: usize,
) -> Option<(usize, usize)> {
    let non_terminated_workers = agents
        .iter()
        .filter(|a| a.role == Role::Worker && a.status != AgentStatus::Terminated)
        .count();
    if non_terminated_workers >= max_workers {
        return None;
    }

    let occupied: std::collections::HashSet<(usize, usize)> = agents
        .iter()
        .filter(|a| a.role == Role::Worker && a.status != AgentStatus::Terminated)
        .filter(|a| a.tmux_session.as_deref() == Some(session_name))
        .filter_map(|a| a.slot().map(|(_, w, p)| (w, p)))
        .collect();

    for pane in 1..=settings.workers_per_main_window {
        if !occupied.contains(&(0, pane)) {
            return Some((0, pane));
        }
    }

    let panes_per_extra = settings.workers_per_extra_window;
    let mut extra_worker_index = 0usize;
    while non_terminated_workers + extra_worker_index < max_workers {
        let window_index = 1 + extra_worker_index / panes_per_extra;
        let pane_index = extra_worker_index % panes_per_extra;
        if !occupied.contains(&(window_index, pane_index)) {
            return Some((window_index, pane_index));
        }
        extra_worker_index += 1;
    }
    None
}

/// `<session>/agents.json`: the one map from agent id to [`Agent`] written
/// per mutation (§6 filesystem layout) and reloaded by the healthcheck
/// daemon's "sync agent state from file" step (§4.11).
pub struct AgentStore {
    path: PathBuf,
}

impl AgentStore {
    pub fn new(session_dir: &Path) -> Self {
        Self {
            path: session_dir.join("agents.json"),
        }
    }

    pub fn load(&self) -> Result<HashMap<String, Agent>> {
        if !self.path.is_file() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, agents: &HashMap<String, Agent>) -> Result<()> {
        let contents = serde_json::to_string_pretty(agents)?;
        atomic_write(&self.path, &contents)
    }

    /// Delete the file entirely (teardown step 7).
    pub fn delete(&self) -> Result<()> {
        if self.path.is_file() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AICli;

    fn worker_at(session: &str, window: usize, pane: usize) -> Agent {
        Agent::new_paned(
            format!("w-{window}-{pane}"),
            Role::Worker,
            "/repo".into(),
            session.into(),
            window,
            pane,
            Some(AICli::Claude),
        )
    }

    #[test]
    fn first_slot_is_main_window_pane_one() {
        let settings = Settings::defaults();
        let slot = get_next_worker_slot(&[], &settings, "proj", 6);
        assert_eq!(slot, Some((0, 1)));
    }

    #[test]
    fn terminated_slot_is_immediately_reusable() {
        let settings = Settings::defaults();
        let mut terminated = worker_at("proj", 0, 1);
        terminated.status = AgentStatus::Terminated;
        let slot = get_next_worker_slot(&[terminated], &settings, "proj", 6);
        assert_eq!(slot, Some((0, 1)));
    }

    #[test]
    fn overflows_into_extra_window_after_main_window_fills() {
        let settings = Settings::defaults();
        let agents: Vec<Agent> = (1..=6).map(|pane| worker_at("proj", 0, pane)).collect();
        let slot = get_next_worker_slot(&agents, &settings, "proj", 16);
        assert_eq!(slot, Some((1, 0)));
    }

    #[test]
    fn returns_none_at_capacity() {
        let settings = Settings::defaults();
        let agents: Vec<Agent> = (1..=6).map(|pane| worker_at("proj", 0, pane)).collect();
        let slot = get_next_worker_slot(&agents, &settings, "proj", 6);
        assert_eq!(slot, None);
    }

    #[test]
    fn occupied_slots_in_a_different_session_do_not_block() {
        let settings = Settings::defaults();
        let agents = vec![worker_at("other-proj", 0, 1)];
        let slot = get_next_worker_slot(&agents, &settings, "proj", 6);
        assert_eq!(slot, Some((0, 1)));
    }

    #[test]
    fn agent_store_round_trips_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::new(dir.path());
        assert!(!store.exists());

        let mut agents = HashMap::new();
        agents.insert("w-0-1".into(), worker_at("proj", 0, 1));
        store.save(&agents).unwrap();
        assert!(store.exists());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("w-0-1"));

        store.delete().unwrap();
        assert!(!store.exists());
        assert!(store.load().unwrap().is_empty());
    }
}
