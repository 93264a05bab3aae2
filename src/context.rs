//! `AppContext` (spec §3, §5, §9): the process-wide handle every manager is
//! constructed against. Write-mostly during init/teardown; tool handlers
//! must tolerate `None` fields and re-resolve from `config.json` rather than
//! assume the in-memory value is current (§5 "Shared-resource policy").
//!
//! Grounded in the teacher's `Arc<RwLock<...>>` state-sharing pattern
//! (`orchestrator/mod.rs`) and its use of `dashmap::DashMap` for
//! fine-grained concurrent maps where a single giant lock would serialize
//! unrelated agents.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::models::Agent;

/// Handle to a running healthcheck daemon task, held so `stop()` can
/// cooperatively cancel it then await its join (§4.11, §5 "Cancellation").
pub struct DaemonHandle {
    pub cancel: CancellationToken,
    pub join: tokio::task::JoinHandle<()>,
}

/// Process-wide state shared across every manager. Cloned cheaply via
/// `Arc<AppContext>`; interior mutability lives in the per-field locks, not
/// in a single context-wide lock, matching §5's "fine-grained locking beats
/// one giant lock" guidance.
pub struct AppContext {
    pub project_root: RwLock<Option<PathBuf>>,
    pub session_id: RwLock<Option<String>>,
    pub workspace_id: RwLock<Option<String>>,

    /// Keyed by agent id. `DashMap` so batch fan-out sub-tasks can mutate
    /// distinct agents concurrently without a single writer lock (§5).
    pub agents: DashMap<String, Agent>,

    pub settings: RwLock<Settings>,

    /// Healthcheck daemon task handle, `None` when not running. Start is
    /// guarded by `daemon_start_lock` so concurrent starts collapse to one
    /// (§4.11 "Start is guarded by a mutex").
    pub daemon: Mutex<Option<DaemonHandle>>,
    pub daemon_start_lock: Mutex<()>,

    /// Consecutive idle healthcheck cycles; reset to 0 whenever a cycle is
    /// not all-idle or `pending_tasks > 0` (§4.11 "Auto-stop").
    pub healthcheck_idle_cycles: RwLock<u32>,

    /// Per-agent recovery lock so a tool-call-triggered recovery and a
    /// daemon-triggered recovery for the same agent never race (§5
    /// "Healthcheck daemon vs. tool calls").
    pub recovery_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AppContext {
    pub fn new(settings: Settings) -> Self {
        Self {
            project_root: RwLock::new(None),
            session_id: RwLock::new(None),
            workspace_id: RwLock::new(None),
            agents: DashMap::new(),
            settings: RwLock::new(settings),
            daemon: Mutex::new(None),
            daemon_start_lock: Mutex::new(()),
            healthcheck_idle_cycles: RwLock::new(0),
            recovery_locks: DashMap::new(),
        }
    }

    pub async fn project_root(&self) -> Option<PathBuf> {
        self.project_root.read().await.clone()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    /// The recovery lock for one agent id, created on first access and
    /// reused thereafter — never removed, since agent ids aren't recycled
    /// within a session's lifetime.
    pub fn recovery_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        self.recovery_locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Reset everything teardown step 10 names: agents, daemon handle,
    /// idle counter, session/project/workspace ids. `settings` survives —
    /// a fresh session under the same process re-resolves it on init.
    pub async fn reset(&self) {
        self.agents.clear();
        self.recovery_locks.clear();
        *self.project_root.write().await = None;
        *self.session_id.write().await = None;
        *self.workspace_id.write().await = None;
        *self.healthcheck_idle_cycles.write().await = 0;
        if let Some(handle) = self.daemon.lock().await.take() {
            handle.cancel.cancel();
            let _ = handle.join.await;
        }
    }

    pub fn non_terminated_workers(&self) -> Vec<Agent> {
        self.agents
            .iter()
            .filter(|e| e.value().role == crate::models::Role::Worker)
            .filter(|e| e.value().status != crate::models::AgentStatus::Terminated)
            .map(|e| e.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reset_clears_agents_and_ids() {
        let ctx = AppContext::new(Settings::defaults());
        *ctx.session_id.write().await = Some("sess-1".into());
        ctx.agents.insert(
            "a1".into(),
            Agent::new_owner("a1".into(), "/repo".into()),
        );
        ctx.reset().await;
        assert!(ctx.session_id().await.is_none());
        assert!(ctx.agents.is_empty());
    }

    #[test]
    fn recovery_lock_is_stable_across_calls() {
        let ctx = AppContext::new(Settings::defaults());
        let first = ctx.recovery_lock("a1");
        let second = ctx.recovery_lock("a1");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
