//! Healthcheck Manager & Daemon (spec §4.11).
//!
//! Grounded in `original_source/src/managers/healthcheck_manager.py`
//! (per-agent check/recovery) and
//! `original_source/src/managers/healthcheck_daemon.py` (the monitoring
//! loop, consecutive-error thresholds, auto-stop). Liveness is tmux
//! session existence only — no heartbeats, matching the original.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collaborators::Notifier;
use crate::context::{AppContext, DaemonHandle};
use crate::dashboard::Dashboard;
use crate::error::Result;
use crate::git::WorktreeProvisioner;
use crate::models::{Agent, AgentStatus, Role, TaskStatus};
use crate::tmux::TmuxDriver;

/// Consecutive *loop* errors (not per-agent) before the manager is reset
/// for re-init; at 5 the daemon gives up entirely.
const CONSECUTIVE_ERROR_REINIT_THRESHOLD: u32 = 3;
const CONSECUTIVE_ERROR_STOP_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub agent_id: String,
    pub is_healthy: bool,
    pub tmux_session_alive: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecoveryOutcome {
    pub status: String,
    pub new_agent_id: Option<String>,
    pub new_worktree_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MonitorResult {
    pub recovered: Vec<String>,
    pub escalated: Vec<String>,
    pub failed_tasks: Vec<String>,
    pub skipped: Vec<String>,
}

/// Per-agent checks and the Worker-specific `full_recovery` flow. Holds no
/// daemon state itself — the daemon loop lives in [`run_daemon_loop`] and
/// is scheduled against [`AppContext`].
pub struct HealthcheckManager {
    tmux: Arc<TmuxDriver>,
    worktrees: Option<Arc<dyn WorktreeProvisioner>>,
    enable_git: bool,
    notifier: Option<Arc<dyn Notifier>>,
}

impl HealthcheckManager {
    pub fn new(
        tmux: Arc<TmuxDriver>,
        worktrees: Option<Arc<dyn WorktreeProvisioner>>,
        enable_git: bool,
    ) -> Self {
        Self::with_notifier(tmux, worktrees, enable_git, None)
    }

    /// Same as [`Self::new`] but with an explicit auto-stop [`Notifier`]
    /// (§4.11 `auto_stop_idle`/`auto_stop_check_failed`).
    pub fn with_notifier(
        tmux: Arc<TmuxDriver>,
        worktrees: Option<Arc<dyn WorktreeProvisioner>>,
        enable_git: bool,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            tmux,
            worktrees,
            enable_git,
            notifier,
        }
    }

    fn resolve_session_name(agent: &Agent) -> Option<String> {
        if let Some(name) = &agent.session_name {
            return Some(name.clone());
        }
        agent
            .tmux_session
            .as_ref()
            .map(|s| s.split(':').next().unwrap_or(s).to_string())
    }

    pub async fn check_agent(&self, ctx: &AppContext, agent_id: &str) -> HealthStatus {
        let agent = ctx.agents.get(agent_id).map(|e| e.value().clone());
        let Some(agent) = agent else {
            return HealthStatus {
                agent_id: agent_id.to_string(),
                is_healthy: false,
                tmux_session_alive: false,
                error_message: Some("agent not found".into()),
            };
        };

        let Some(session_name) = Self::resolve_session_name(&agent) else {
            return HealthStatus {
                agent_id: agent_id.to_string(),
                is_healthy: false,
                tmux_session_alive: false,
                error_message: Some("no tmux session configured".into()),
            };
        };

        match self.tmux.session_exists(&session_name).await {
            Ok(alive) => HealthStatus {
                agent_id: agent_id.to_string(),
                is_healthy: alive,
                tmux_session_alive: alive,
                error_message: if alive {
                    None
                } else {
                    Some(format!("tmux session {session_name} not found"))
                },
            },
            Err(e) => HealthStatus {
                agent_id: agent_id.to_string(),
                is_healthy: false,
                tmux_session_alive: false,
                error_message: Some(e.to_string()),
            },
        }
    }

    pub async fn check_all_agents(&self, ctx: &AppContext) -> Vec<HealthStatus> {
        let ids: Vec<String> = ctx.agents.iter().map(|e| e.key().clone()).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.check_agent(ctx, &id).await);
        }
        out
    }

    pub async fn get_unhealthy_agents(&self, ctx: &AppContext) -> Vec<HealthStatus> {
        self.check_all_agents(ctx)
            .await
            .into_iter()
            .filter(|s| !s.is_healthy)
            .collect()
    }

    pub async fn get_healthy_agents(&self, ctx: &AppContext) -> Vec<HealthStatus> {
        self.check_all_agents(ctx)
            .await
            .into_iter()
            .filter(|s| s.is_healthy)
            .collect()
    }

    pub fn get_summary(&self, ctx: &AppContext, interval_seconds: u64) -> serde_json::Value {
        serde_json::json!({
            "total_agents": ctx.agents.len(),
            "healthcheck_interval_seconds": interval_seconds,
        })
    }

    /// The 5-step Worker-only recovery flow (§4.11 `full_recovery`).
    pub async fn full_recovery(
        &self,
        ctx: &AppContext,
        dashboard: &Dashboard,
        agent_id: &str,
    ) -> Result<RecoveryOutcome> {
        let Some(old_agent) = ctx.agents.get(agent_id).map(|e| e.value().clone()) else {
            return Ok(RecoveryOutcome {
                status: "failed".into(),
                ..Default::default()
            });
        };
        if old_agent.role != Role::Worker {
            return Ok(RecoveryOutcome {
                status: "failed".into(),
                ..Default::default()
            });
        }

        // Step 1: snapshot old state and reassignable tasks.
        let assigned_tasks: Vec<String> = dashboard
            .list_tasks(None, Some(agent_id))?
            .into_iter()
            .filter(|t| !matches!(t.status, TaskStatus::Completed | TaskStatus::Failed))
            .map(|t| t.id)
            .collect();
        let (Some(session_name), Some(window), Some(pane)) =
            (old_agent.session_name.clone(), old_agent.window_index, old_agent.pane_index)
        else {
            return Ok(RecoveryOutcome {
                status: "failed".into(),
                ..Default::default()
            });
        };

        // Step 2: clear pane, drop old agent from the map.
        let _ = self
            .tmux
            .send_keys_to_pane(&session_name, window, pane, "C-c", false)
            .await;
        let _ = self
            .tmux
            .send_keys_to_pane(&session_name, window, pane, "clear", true)
            .await;
        ctx.agents.remove(agent_id);

        // Step 3/4: recreate the worktree on the same branch, short-hash retry once.
        let mut new_worktree_path: Option<String> = None;
        if self.enable_git {
            let Some(provisioner) = &self.worktrees else {
                return Ok(RecoveryOutcome {
                    status: "blocked".into(),
                    ..Default::default()
                });
            };
            let (Some(old_path), Some(branch)) =
                (old_agent.worktree_path.clone(), old_agent.branch.clone())
            else {
                return Ok(RecoveryOutcome {
                    status: "blocked".into(),
                    ..Default::default()
                });
            };
            let path = std::path::PathBuf::from(&old_path);
            if let Err(e) = provisioner.remove_worktree(&path).await {
                warn!("full_recovery: removing old worktree {old_path} failed: {e}");
            }
            match provisioner.create_worktree(&path, &branch, &branch).await {
                Ok(info) => new_worktree_path = Some(info.path.to_string_lossy().to_string()),
                Err(_) => {
                    let suffix = &uuid::Uuid::new_v4().to_string()[..6];
                    let retry_branch = format!("{branch}-{suffix}");
                    let retry_path = std::path::PathBuf::from(format!("{old_path}-{suffix}"));
                    match provisioner
                        .create_worktree(&retry_path, &retry_branch, &branch)
                        .await
                    {
                        Ok(info) => {
                            new_worktree_path = Some(info.path.to_string_lossy().to_string())
                        }
                        Err(_) => {
                            return Ok(RecoveryOutcome {
                                status: "failed".into(),
                                new_worktree_path: None,
                                ..Default::default()
                            })
                        }
                    }
                }
            }
        }

        // Step 5: new agent id reusing the old pane slot; reassign tasks; persist.
        let new_id = format!("worker-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let working_dir = new_worktree_path
            .clone()
            .unwrap_or_else(|| old_agent.working_dir.clone());
        let mut new_agent = Agent::new_paned(
            new_id.clone(),
            Role::Worker,
            working_dir.clone(),
            session_name.clone(),
            window,
            pane,
            old_agent.ai_cli,
        );
        new_agent.worktree_path = new_worktree_path.clone();
        new_agent.branch = old_agent.branch.clone();
        ctx.agents.insert(new_id.clone(), new_agent);

        let _ = self
            .tmux
            .set_pane_title(&session_name, window, pane, &new_id)
            .await;
        let cd_cmd = format!("cd '{}'", working_dir.replace('\'', "'\\''"));
        let _ = self
            .tmux
            .send_keys_to_pane(&session_name, window, pane, &cd_cmd, true)
            .await;

        for task_id in &assigned_tasks {
            if let Err(e) = dashboard.assign_task(task_id, &new_id) {
                warn!("full_recovery: reassigning task {task_id} to {new_id} failed: {e}");
            }
        }

        Ok(RecoveryOutcome {
            status: "recovered".into(),
            new_agent_id: Some(new_id),
            new_worktree_path,
        })
    }

    pub async fn attempt_recovery(
        &self,
        ctx: &AppContext,
        dashboard: &Dashboard,
        agent_id: &str,
    ) -> Result<RecoveryOutcome> {
        let status = self.check_agent(ctx, agent_id).await;
        if status.is_healthy {
            return Ok(RecoveryOutcome {
                status: "already_healthy".into(),
                ..Default::default()
            });
        }
        self.full_recovery(ctx, dashboard, agent_id).await
    }

    /// `monitor_and_recover_workers` (§4.11): check every non-terminated
    /// Worker, recover the unhealthy ones, classify each outcome.
    pub async fn monitor_and_recover_workers(
        &self,
        ctx: &AppContext,
        dashboard: &Dashboard,
    ) -> MonitorResult {
        let mut result = MonitorResult::default();
        let workers = ctx.non_terminated_workers();
        for worker in workers {
            let status = self.check_agent(ctx, &worker.id).await;
            if status.is_healthy {
                continue;
            }
            let _lock = ctx.recovery_lock(&worker.id).lock_owned().await;
            match self.full_recovery(ctx, dashboard, &worker.id).await {
                Ok(outcome) if outcome.status == "recovered" => {
                    result.recovered.push(worker.id.clone())
                }
                Ok(outcome) if outcome.status == "blocked" => {
                    result.escalated.push(worker.id.clone());
                    let _ = outcome;
                }
                Ok(_) => result.failed_tasks.push(worker.id.clone()),
                Err(e) => {
                    error!("monitor_and_recover_workers: recovery failed for {}: {e}", worker.id);
                    result.failed_tasks.push(worker.id.clone());
                }
            }
        }
        result
    }
}

/// Whether the daemon should count this cycle as idle (§4.11). Returns
/// `Err` if the dashboard itself can't answer — the caller treats that as
/// `auto_stop_check_failed`, not as "not idle".
fn should_auto_stop(ctx: &AppContext, dashboard: &Dashboard) -> Result<bool> {
    let workers = ctx.non_terminated_workers();
    if workers.is_empty() {
        return Ok(true);
    }
    let all_idle = workers
        .iter()
        .all(|w| w.status == AgentStatus::Idle && w.current_task.is_none());

    let pending_tasks = dashboard.list_tasks(Some(TaskStatus::Pending), None)?.len();
    if pending_tasks > 0 {
        return Ok(false);
    }
    let in_progress_tasks = dashboard.list_tasks(Some(TaskStatus::InProgress), None)?.len();

    Ok(in_progress_tasks == 0 && all_idle)
}

/// Reloads `ctx.agents` from `<session>/agents.json`, the daemon's "sync
/// agent state from file" step (§4.11) — picks up agents created or
/// mutated by a concurrent tool call between cycles.
fn sync_agents_from_file(ctx: &AppContext, store: &crate::agent::AgentStore) -> Result<()> {
    let loaded = store.load()?;
    ctx.agents.clear();
    for (id, agent) in loaded {
        ctx.agents.insert(id, agent);
    }
    Ok(())
}

/// Start the daemon under `ctx.daemon_start_lock`, collapsing concurrent
/// starts to one (§4.11 "Start is guarded by a mutex"). Returns `false`
/// when already running.
pub async fn start_daemon(
    ctx: Arc<AppContext>,
    manager: Arc<HealthcheckManager>,
    dashboard: Arc<Dashboard>,
    agent_store: Arc<crate::agent::AgentStore>,
) -> bool {
    let _start_guard = ctx.daemon_start_lock.lock().await;
    {
        let daemon = ctx.daemon.lock().await;
        if daemon.is_some() {
            return false;
        }
    }

    *ctx.healthcheck_idle_cycles.write().await = 0;
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let loop_ctx = ctx.clone();
    let join = tokio::spawn(async move {
        run_daemon_loop(loop_ctx, manager, dashboard, agent_store, loop_cancel).await;
    });

    *ctx.daemon.lock().await = Some(DaemonHandle { cancel, join });
    info!("healthcheck daemon started");
    true
}

/// Cancel the daemon and await its join with a timeout, matching the
/// original's `stop_healthcheck_daemon` timeout-then-hard-cancel shape.
pub async fn stop_daemon(ctx: &AppContext, timeout: Duration) -> bool {
    let _start_guard = ctx.daemon_start_lock.lock().await;
    let Some(handle) = ctx.daemon.lock().await.take() else {
        *ctx.healthcheck_idle_cycles.write().await = 0;
        return false;
    };
    handle.cancel.cancel();
    let _ = tokio::time::timeout(timeout, handle.join).await;
    *ctx.healthcheck_idle_cycles.write().await = 0;
    info!("healthcheck daemon stopped");
    true
}

/// One idle-cycle decision (§4.11 auto-stop): bumps or resets
/// `ctx.healthcheck_idle_cycles`, notifies `auto_stop_idle` once the
/// consecutive-idle threshold is crossed, and notifies
/// `auto_stop_check_failed` if the dashboard check itself errors. Returns
/// whether the daemon loop should stop.
async fn evaluate_auto_stop(ctx: &AppContext, dashboard: &Dashboard, notifier: Option<&dyn Notifier>) -> bool {
    match should_auto_stop(ctx, dashboard) {
        Ok(true) => {
            let mut idle = ctx.healthcheck_idle_cycles.write().await;
            *idle += 1;
            let threshold = ctx.settings.read().await.healthcheck_idle_stop_consecutive;
            if *idle >= threshold {
                info!("healthcheck daemon auto-stopped (idle_count={})", *idle);
                if let Some(notifier) = notifier {
                    notifier.notify("auto_stop_idle", &format!("idle_count={}", *idle));
                }
                true
            } else {
                false
            }
        }
        Ok(false) => {
            *ctx.healthcheck_idle_cycles.write().await = 0;
            false
        }
        Err(e) => {
            warn!("healthcheck daemon auto-stop check failed: {e}");
            if let Some(notifier) = notifier {
                notifier.notify("auto_stop_check_failed", &e.to_string());
            }
            false
        }
    }
}

async fn run_daemon_loop(
    ctx: Arc<AppContext>,
    mut manager: Arc<HealthcheckManager>,
    dashboard: Arc<Dashboard>,
    agent_store: Arc<crate::agent::AgentStore>,
    cancel: CancellationToken,
) {
    let mut consecutive_errors: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            break;
        }

        match sync_agents_from_file(&ctx, &agent_store) {
            Ok(()) => {
                let result = manager.monitor_and_recover_workers(&ctx, &dashboard).await;
                if !result.escalated.is_empty() || !result.failed_tasks.is_empty() {
                    warn!(
                        "healthcheck daemon: recovered={} escalated={} failed={}",
                        result.recovered.len(),
                        result.escalated.len(),
                        result.failed_tasks.len()
                    );
                }
                consecutive_errors = 0;
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(
                    "healthcheck daemon loop error (consecutive={consecutive_errors}): {e}"
                );
                if consecutive_errors >= CONSECUTIVE_ERROR_STOP_THRESHOLD {
                    error!("healthcheck daemon stopping: {consecutive_errors} consecutive errors");
                    break;
                }
                if consecutive_errors >= CONSECUTIVE_ERROR_REINIT_THRESHOLD {
                    warn!("healthcheck daemon reinitializing manager: {consecutive_errors} consecutive errors");
                    manager = Arc::new(HealthcheckManager::with_notifier(
                        manager.tmux.clone(),
                        manager.worktrees.clone(),
                        manager.enable_git,
                        manager.notifier.clone(),
                    ));
                }
            }
        }

        if evaluate_auto_stop(&ctx, &dashboard, manager.notifier.as_deref()).await {
            break;
        }

        let wait_seconds = ctx.settings.read().await.healthcheck_interval_seconds.max(1);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(wait_seconds)) => {}
        }
    }

    *ctx.healthcheck_idle_cycles.write().await = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::models::AICli;
    use crate::tmux::{TmuxDriver, TmuxDriverConfig};

    fn test_manager() -> HealthcheckManager {
        HealthcheckManager::new(
            Arc::new(TmuxDriver::new(TmuxDriverConfig {
                send_cooldown: std::time::Duration::from_millis(0),
                codex_enter_retry_max: 1,
                codex_enter_retry_interval: std::time::Duration::from_millis(0),
            })),
            None,
            false,
        )
    }

    #[tokio::test]
    async fn unknown_agent_is_unhealthy() {
        let ctx = AppContext::new(Settings::defaults());
        let manager = test_manager();
        let status = manager.check_agent(&ctx, "missing").await;
        assert!(!status.is_healthy);
        assert!(status.error_message.is_some());
    }

    #[tokio::test]
    async fn agent_without_session_name_is_unhealthy() {
        let ctx = AppContext::new(Settings::defaults());
        let agent = Agent::new_paned(
            "w1".into(),
            Role::Worker,
            "/repo".into(),
            "sess".into(),
            0,
            1,
            Some(AICli::Claude),
        );
        let mut stripped = agent.clone();
        stripped.session_name = None;
        stripped.tmux_session = None;
        ctx.agents.insert("w1".into(), stripped);

        let manager = test_manager();
        let status = manager.check_agent(&ctx, "w1").await;
        assert!(!status.is_healthy);
        assert_eq!(
            status.error_message.as_deref(),
            Some("no tmux session configured")
        );
    }

    #[test]
    fn resolve_session_name_prefers_session_name_over_tmux_session() {
        let mut agent = Agent::new_paned(
            "w1".into(),
            Role::Worker,
            "/repo".into(),
            "sess".into(),
            0,
            1,
            Some(AICli::Claude),
        );
        agent.tmux_session = Some("other:0.1".into());
        assert_eq!(
            HealthcheckManager::resolve_session_name(&agent),
            Some("sess".into())
        );

        agent.session_name = None;
        assert_eq!(
            HealthcheckManager::resolve_session_name(&agent),
            Some("other".into())
        );
    }

    #[tokio::test]
    async fn should_auto_stop_is_true_with_no_workers() {
        let ctx = AppContext::new(Settings::defaults());
        let dir = tempfile::tempdir().unwrap();
        let dashboard = Dashboard::new(dir.path().to_path_buf(), "sess".into());
        assert!(should_auto_stop(&ctx, &dashboard).unwrap());
    }

    #[tokio::test]
    async fn should_auto_stop_is_false_when_worker_is_busy() {
        let ctx = AppContext::new(Settings::defaults());
        let mut worker = Agent::new_paned(
            "w1".into(),
            Role::Worker,
            "/repo".into(),
            "sess".into(),
            0,
            1,
            Some(AICli::Claude),
        );
        worker.status = AgentStatus::Busy;
        worker.current_task = Some("t1".into());
        ctx.agents.insert("w1".into(), worker);
        let dir = tempfile::tempdir().unwrap();
        let dashboard = Dashboard::new(dir.path().to_path_buf(), "sess".into());
        assert!(!should_auto_stop(&ctx, &dashboard).unwrap());
    }

    struct RecordingNotifier {
        reasons: std::sync::Mutex<Vec<String>>,
    }
    impl RecordingNotifier {
        fn new() -> Self {
            Self { reasons: std::sync::Mutex::new(Vec::new()) }
        }
    }
    impl Notifier for RecordingNotifier {
        fn notify(&self, stop_reason: &str, _details: &str) {
            self.reasons.lock().unwrap().push(stop_reason.to_string());
        }
    }

    #[tokio::test]
    async fn evaluate_auto_stop_notifies_auto_stop_idle_at_threshold() {
        let ctx = AppContext::new(Settings::defaults());
        ctx.settings.write().await.healthcheck_idle_stop_consecutive = 1;
        let dir = tempfile::tempdir().unwrap();
        let dashboard = Dashboard::new(dir.path().to_path_buf(), "sess".into());
        let notifier = RecordingNotifier::new();

        let stopped = evaluate_auto_stop(&ctx, &dashboard, Some(&notifier)).await;

        assert!(stopped);
        assert_eq!(notifier.reasons.lock().unwrap().as_slice(), ["auto_stop_idle"]);
    }

    #[tokio::test]
    async fn evaluate_auto_stop_notifies_auto_stop_check_failed_on_dashboard_error() {
        let ctx = AppContext::new(Settings::defaults());
        let mut worker = Agent::new_paned(
            "w1".into(),
            Role::Worker,
            "/repo".into(),
            "sess".into(),
            0,
            1,
            Some(AICli::Claude),
        );
        worker.status = AgentStatus::Idle;
        worker.current_task = None;
        ctx.agents.insert("w1".into(), worker);
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("dashboard")).unwrap();
        std::fs::write(dir.path().join("dashboard").join("dashboard_sess.json"), "not json").unwrap();
        let dashboard = Dashboard::new(dir.path().to_path_buf(), "sess".into());
        let notifier = RecordingNotifier::new();

        let stopped = evaluate_auto_stop(&ctx, &dashboard, Some(&notifier)).await;

        assert!(!stopped);
        assert_eq!(notifier.reasons.lock().unwrap().as_slice(), ["auto_stop_check_failed"]);
    }
}
