//! Worker Batch Engine (spec §4.6).
//!
//! Grounded in `original_source/src/tools/agent_batch_tools.py`: pane
//! reservation and capacity checks run synchronously up front so the
//! subsequent parallel fan-out (§5) never races over the same slot or
//! blows past `profile.max_workers`; reuse/create sub-tasks then run
//! concurrently via [`futures` or hand-rolled `tokio::join_all`-style
//! fan-out].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::agent::{get_next_worker_slot, AgentStore};
use crate::cli_manager::build_stdin_command;
use crate::collaborators::TemplateRenderer;
use crate::config::Settings;
use crate::context::AppContext;
use crate::dashboard::Dashboard;
use crate::error::{FleetError, Result};
use crate::git::WorktreeProvisioner;
use crate::ipc::IpcStore;
use crate::models::{AICli, Agent, AgentStatus, CostCall, Role};
use crate::tmux::{worker_number_for_slot, TmuxDriver};

/// A global cap on concurrently-dispatched Cursor (image-generation)
/// Workers, independent of `profile.max_workers` (§4.6 step 2).
pub const MAX_IMAGE_TASK_PARALLEL: usize = 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub task_id: Option<String>,
    pub task_content: Option<String>,
    pub task_title: Option<String>,
    pub branch: Option<String>,
    pub preferred_cli: Option<AICli>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBatchResult {
    pub success: bool,
    pub worker_index: usize,
    pub agent_id: Option<String>,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    pub tmux_session: Option<String>,
    pub task_title: Option<String>,
    pub reused: bool,
    pub ipc_registered: bool,
    pub file_persisted: bool,
    pub dashboard_updated: bool,
    pub task_assigned: bool,
    pub assignment_error: Option<String>,
    pub task_sent: bool,
    pub dispatch_mode: String,
    pub dispatch_error: Option<String>,
    pub error: Option<String>,
}

impl WorkerBatchResult {
    fn failed(worker_index: usize, error: impl Into<String>) -> Self {
        Self {
            success: false,
            worker_index,
            agent_id: None,
            branch: None,
            worktree_path: None,
            tmux_session: None,
            task_title: None,
            reused: false,
            ipc_registered: false,
            file_persisted: false,
            dashboard_updated: false,
            task_assigned: false,
            assignment_error: None,
            task_sent: false,
            dispatch_mode: "none".into(),
            dispatch_error: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub success: bool,
    pub workers: Vec<WorkerBatchResult>,
    pub failed_count: usize,
    pub errors: Vec<String>,
    pub message: String,
}

/// Everything `create_workers_batch` needs reach-out access to, bundled so
/// the entry point doesn't take a dozen parameters.
pub struct BatchDeps {
    pub tmux: Arc<TmuxDriver>,
    pub dashboard: Arc<Dashboard>,
    pub ipc: Arc<IpcStore>,
    pub agent_store: Arc<AgentStore>,
    pub worktrees: Option<Arc<dyn WorktreeProvisioner>>,
    pub renderer: Arc<dyn TemplateRenderer>,
}

fn validate_config(config: &WorkerConfig, worker_index: usize) -> Option<String> {
    if config.task_content.is_some() && config.task_id.is_none() {
        return Some(format!(
            "Worker {}: task_id is required when task_content is set",
            worker_index + 1
        ));
    }
    None
}

/// Strips a trailing `feature/` prefix, matching [`crate::git::build_worker_task_branch`]
/// so a requested branch name never double-prefixes.
fn default_branch(requested: Option<&str>, worker_no: usize) -> String {
    requested
        .map(str::to_string)
        .unwrap_or_else(|| format!("worker-{worker_no}"))
}

/// Reserve pane slots for `count` new Workers up front (§4.6 step 6), using
/// the same allocator as single-Worker creation so batch and non-batch
/// paths never disagree on slot ordering.
fn pre_assign_pane_slots(
    ctx: &AppContext,
    settings: &Settings,
    session_name: &str,
    max_workers: usize,
    count: usize,
) -> Vec<Option<(usize, usize)>> {
    let mut snapshot: Vec<Agent> = ctx.agents.iter().map(|e| e.value().clone()).collect();
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        match get_next_worker_slot(&snapshot, settings, session_name, max_workers) {
            Some((window, pane)) => {
                out.push(Some((window, pane)));
                snapshot.push(Agent::new_paned(
                    format!("__reserved-{i}"),
                    Role::Worker,
                    String::new(),
                    session_name.to_string(),
                    window,
                    pane,
                    None,
                ));
            }
            None => {
                warn!("Worker {}: no available pane slot", i + 1);
                out.push(None);
            }
        }
    }
    out
}

/// Record a cost estimate and persist the updated dashboard after
/// dispatch (§4.6 step 11 "Record a cost call").
fn record_dispatch_cost(dashboard: &Dashboard, settings: &Settings, agent: &Agent, task_id: Option<&str>) {
    let Some(cli) = agent.ai_cli else { return };
    let mut call = CostCall::estimated(cli, String::new(), settings.estimated_tokens_per_call);
    call.agent_id = Some(agent.id.clone());
    call.task_id = task_id.map(str::to_string);
    let _ = dashboard.record_api_call(call);
}

/// Assign (if `task_id` set) and dispatch (if `task_content` set) to one
/// agent, mirroring `_assign_and_dispatch_task` (§4.6 step 11).
#[allow(clippy::too_many_arguments)]
async fn assign_and_dispatch(
    deps: &BatchDeps,
    settings: &Settings,
    session_id: Option<&str>,
    agent: &mut Agent,
    task_id: Option<&str>,
    task_content: Option<&str>,
    branch: &str,
    worktree_path: &str,
    worker_index: usize,
) -> (bool, Option<String>, bool, String, Option<String>) {
    let mut task_assigned = false;
    let mut assignment_error = None;
    if let Some(task_id) = task_id {
        match deps.dashboard.assign_task(task_id, &agent.id) {
            Ok(_) => {
                task_assigned = true;
                agent.current_task = Some(task_id.to_string());
                agent.branch = Some(branch.to_string());
                if agent.role == Role::Worker {
                    agent.status = AgentStatus::Busy;
                }
                agent.touch();
                let _ = deps.agent_store.load().map(|mut all| {
                    all.insert(agent.id.clone(), agent.clone());
                    deps.agent_store.save(&all)
                });
                let _ = deps.dashboard.update_agent_summary(crate::dashboard::AgentSummary {
                    agent_id: agent.id.clone(),
                    role: agent.role,
                    status: agent.status,
                    current_task: agent.current_task.clone(),
                    last_activity: agent.last_activity,
                });
            }
            Err(e) => {
                warn!("Worker {}: task assignment failed: {e}", worker_index + 1);
                assignment_error = Some(e.to_string());
            }
        }
    }

    let mut task_sent = false;
    let mut dispatch_mode = "none".to_string();
    let mut dispatch_error = None;
    if let (Some(content), Some(session_id)) = (task_content, session_id) {
        let Some(window) = agent.window_index else {
            return (task_assigned, assignment_error, false, dispatch_mode, Some("agent has no pane".into()));
        };
        let pane = agent.pane_index.unwrap_or(0);
        let Some(session_name) = agent.session_name.clone() else {
            return (task_assigned, assignment_error, false, dispatch_mode, Some("agent has no tmux session".into()));
        };

        let mut vars = serde_json::Map::new();
        vars.insert("objective".into(), content.into());
        let rendered = deps
            .renderer
            .render("task", &format!("Worker {}", worker_index + 1), &vars)
            .unwrap_or_else(|_| content.to_string());
        match deps.dashboard.write_task_file(&agent.id, &rendered) {
            Ok(task_file) => {
                let task_file = task_file.to_string_lossy().to_string();
                if agent.ai_bootstrapped {
                    dispatch_mode = "message".to_string();
                    let cd_cmd = format!("cd '{}'", worktree_path.replace('\'', "'\\''"));
                    let message = format!("実行してください: {task_file}");
                    let sent = deps
                        .tmux
                        .send_with_rate_limit_to_pane(&session_name, window, pane, &cd_cmd, false)
                        .await
                        .and(
                            deps.tmux
                                .send_with_rate_limit_to_pane(&session_name, window, pane, &message, false)
                                .await,
                        );
                    match sent {
                        Ok(()) => task_sent = true,
                        Err(e) => dispatch_error = Some(e.to_string()),
                    }
                } else {
                    dispatch_mode = "bootstrap".to_string();
                    let model = None;
                    let cmd = build_stdin_command(
                        agent.ai_cli.unwrap_or(AICli::Claude),
                        &task_file,
                        Some(worktree_path),
                        model,
                        None,
                        None,
                        None,
                    );
                    match deps
                        .tmux
                        .send_with_rate_limit_to_pane(&session_name, window, pane, &cmd, false)
                        .await
                    {
                        Ok(()) => {
                            task_sent = true;
                            agent.ai_bootstrapped = true;
                        }
                        Err(e) => dispatch_error = Some(e.to_string()),
                    }
                }
                record_dispatch_cost(&deps.dashboard, settings, agent, task_id);
            }
            Err(e) => dispatch_error = Some(e.to_string()),
        }
    }

    (task_assigned, assignment_error, task_sent, dispatch_mode, dispatch_error)
}

#[allow(clippy::too_many_arguments)]
async fn create_single_worker(
    ctx: &AppContext,
    deps: &BatchDeps,
    settings: &Settings,
    config: WorkerConfig,
    worker_index: usize,
    assigned_slot: Option<(usize, usize)>,
    repo_path: &str,
    base_branch: &str,
    project_name: &str,
    enable_worktree: bool,
    session_id: Option<&str>,
) -> WorkerBatchResult {
    if let Some(err) = validate_config(&config, worker_index) {
        return WorkerBatchResult::failed(worker_index, err);
    }

    let Some((window_index, pane_index)) = assigned_slot else {
        return WorkerBatchResult::failed(
            worker_index,
            format!("Worker {}: no available pane slot", worker_index + 1),
        );
    };
    let worker_no = worker_number_for_slot(window_index, pane_index, settings.workers_per_extra_window);
    let mut branch = default_branch(config.branch.as_deref(), worker_no);
    if enable_worktree {
        let Some(task_id) = &config.task_id else {
            return WorkerBatchResult::failed(
                worker_index,
                format!("Worker {}: task_id is required", worker_index + 1),
            );
        };
        branch = crate::git::build_worker_task_branch(base_branch, worker_no, task_id);
    }

    let mut worktree_path = repo_path.to_string();
    if enable_worktree {
        let Some(provisioner) = &deps.worktrees else {
            return WorkerBatchResult::failed(worker_index, "worktree provisioning unavailable");
        };
        let path = std::path::PathBuf::from(repo_path)
            .join(".worktrees")
            .join(branch.replace('/', "-"));
        match provisioner.create_worktree(&path, &branch, base_branch).await {
            Ok(info) => worktree_path = info.path.to_string_lossy().to_string(),
            Err(e) => return WorkerBatchResult::failed(worker_index, e.to_string()),
        }
    }

    if !deps.tmux.session_exists(project_name).await.unwrap_or(false) {
        if let Err(e) = deps.tmux.create_main_session(project_name, repo_path).await {
            return WorkerBatchResult::failed(worker_index, e.to_string());
        }
    }
    if window_index > 0 {
        let window_name = format!("{}{}", settings.window_name_worker_prefix, window_index);
        let exists = deps
            .tmux
            .list_windows(project_name)
            .await
            .map(|ws| ws.iter().any(|w| w.name == window_name))
            .unwrap_or(false);
        if !exists {
            if let Err(e) = deps
                .tmux
                .add_extra_worker_window(
                    project_name,
                    &window_name,
                    repo_path,
                    settings.extra_worker_rows,
                    settings.extra_worker_cols,
                )
                .await
            {
                return WorkerBatchResult::failed(worker_index, e.to_string());
            }
        }
    }

    let worker_cli = config
        .preferred_cli
        .unwrap_or_else(|| settings.profiles[&settings.model_profile_active].cli);
    let agent_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    let _ = deps
        .tmux
        .set_pane_title(project_name, window_index, pane_index, &format!("worker-{agent_id}"))
        .await;

    let mut agent = Agent::new_paned(
        agent_id.clone(),
        Role::Worker,
        worktree_path.clone(),
        project_name.to_string(),
        window_index,
        pane_index,
        Some(worker_cli),
    );
    agent.worktree_path = if enable_worktree { Some(worktree_path.clone()) } else { None };

    ctx.agents.insert(agent_id.clone(), agent.clone());
    let ipc_registered = deps.ipc.register_agent(&agent_id).is_ok();
    let file_persisted = deps
        .agent_store
        .load()
        .and_then(|mut all| {
            all.insert(agent_id.clone(), agent.clone());
            deps.agent_store.save(&all)
        })
        .is_ok();
    let dashboard_updated = deps
        .dashboard
        .update_agent_summary(crate::dashboard::AgentSummary {
            agent_id: agent_id.clone(),
            role: agent.role,
            status: agent.status,
            current_task: agent.current_task.clone(),
            last_activity: agent.last_activity,
        })
        .is_ok();

    let (task_assigned, assignment_error, task_sent, dispatch_mode, dispatch_error) =
        assign_and_dispatch(
            deps,
            settings,
            session_id,
            &mut agent,
            config.task_id.as_deref(),
            config.task_content.as_deref(),
            &branch,
            &worktree_path,
            worker_index,
        )
        .await;
    ctx.agents.insert(agent_id.clone(), agent.clone());

    WorkerBatchResult {
        success: true,
        worker_index,
        agent_id: Some(agent_id),
        branch: Some(branch),
        worktree_path: Some(worktree_path),
        tmux_session: agent.tmux_session.clone(),
        task_title: Some(config.task_title.unwrap_or_else(|| format!("Worker {}", worker_index + 1))),
        reused: false,
        ipc_registered,
        file_persisted,
        dashboard_updated,
        task_assigned,
        assignment_error,
        task_sent,
        dispatch_mode,
        dispatch_error,
        error: None,
    }
}

#[allow(clippy::too_many_arguments)]
async fn reuse_single_worker(
    ctx: &AppContext,
    deps: &BatchDeps,
    settings: &Settings,
    config: WorkerConfig,
    worker_index: usize,
    mut worker: Agent,
    repo_path: &str,
    base_branch: &str,
    enable_worktree: bool,
    session_id: Option<&str>,
) -> WorkerBatchResult {
    if let Some(err) = validate_config(&config, worker_index) {
        return WorkerBatchResult::failed(worker_index, err);
    }

    if let Some(preferred) = config.preferred_cli {
        if worker.ai_cli != Some(preferred) {
            return WorkerBatchResult::failed(
                worker_index,
                format!(
                    "Worker {}: preferred_cli='{}' but the reused Worker runs '{}'; CLIs must match to reuse",
                    worker_index + 1,
                    preferred.as_str(),
                    worker.ai_cli.map(|c| c.as_str()).unwrap_or("none"),
                ),
            );
        }
    }

    let mut worktree_path = worker.worktree_path.clone().unwrap_or_else(|| repo_path.to_string());
    let worker_no = worker_number_for_slot(
        worker.window_index.unwrap_or(0),
        worker.pane_index.unwrap_or(0),
        settings.workers_per_extra_window,
    );
    let mut branch = default_branch(config.branch.as_deref(), worker_no);
    if enable_worktree {
        let Some(task_id) = &config.task_id else {
            return WorkerBatchResult::failed(
                worker_index,
                format!("Worker {}: task_id is required when worktrees are enabled", worker_index + 1),
            );
        };
        branch = crate::git::build_worker_task_branch(base_branch, worker_no, task_id);
        let Some(provisioner) = &deps.worktrees else {
            return WorkerBatchResult::failed(worker_index, "worktree provisioning unavailable");
        };
        let path = std::path::PathBuf::from(repo_path)
            .join(".worktrees")
            .join(branch.replace('/', "-"));
        match provisioner.create_worktree(&path, &branch, base_branch).await {
            Ok(info) => {
                worktree_path = info.path.to_string_lossy().to_string();
                worker.worktree_path = Some(worktree_path.clone());
                worker.working_dir = worktree_path.clone();
            }
            Err(e) => return WorkerBatchResult::failed(worker_index, e.to_string()),
        }
    }

    let (task_assigned, assignment_error, task_sent, dispatch_mode, dispatch_error) =
        assign_and_dispatch(
            deps,
            settings,
            session_id,
            &mut worker,
            config.task_id.as_deref(),
            config.task_content.as_deref(),
            &branch,
            &worktree_path,
            worker_index,
        )
        .await;

    worker.touch();
    let file_persisted = deps
        .agent_store
        .load()
        .and_then(|mut all| {
            all.insert(worker.id.clone(), worker.clone());
            deps.agent_store.save(&all)
        })
        .is_ok();
    ctx.agents.insert(worker.id.clone(), worker.clone());

    WorkerBatchResult {
        success: true,
        worker_index,
        agent_id: Some(worker.id.clone()),
        branch: Some(branch),
        worktree_path: Some(worktree_path),
        tmux_session: worker.tmux_session.clone(),
        task_title: Some(config.task_title.unwrap_or_else(|| format!("Worker {}", worker_index + 1))),
        reused: true,
        ipc_registered: true,
        file_persisted,
        dashboard_updated: true,
        task_assigned,
        assignment_error,
        task_sent,
        dispatch_mode,
        dispatch_error,
        error: None,
    }
}

/// `create_workers_batch` (§4.6): validate, reserve, fan out, aggregate.
#[allow(clippy::too_many_arguments)]
pub async fn create_workers_batch(
    ctx: &AppContext,
    deps: &BatchDeps,
    caller_role: Role,
    worker_configs: Vec<WorkerConfig>,
    repo_path: &str,
    base_branch: &str,
    session_id: Option<&str>,
    reuse_idle_workers: bool,
) -> Result<BatchOutcome> {
    if !matches!(caller_role, Role::Owner | Role::Admin) {
        return Err(FleetError::RoleDenied("create_workers_batch requires Owner or Admin".into()));
    }
    if worker_configs.is_empty() {
        return Err(FleetError::InvalidConfig("worker_configs is empty".into()));
    }

    let settings = ctx.settings.read().await.clone();
    let profile = &settings.profiles[&settings.model_profile_active];

    let cursor_requested = worker_configs
        .iter()
        .filter(|c| c.preferred_cli == Some(AICli::Cursor))
        .count();
    let cursor_busy = ctx
        .agents
        .iter()
        .filter(|e| {
            e.value().role == Role::Worker
                && e.value().status == AgentStatus::Busy
                && e.value().ai_cli == Some(AICli::Cursor)
        })
        .count();
    if cursor_requested + cursor_busy > MAX_IMAGE_TASK_PARALLEL {
        return Err(FleetError::CapacityExceeded {
            current: cursor_busy,
            requested: cursor_requested,
            available: MAX_IMAGE_TASK_PARALLEL.saturating_sub(cursor_busy),
        });
    }

    let current_worker_count = ctx
        .agents
        .iter()
        .filter(|e| e.value().role == Role::Worker && e.value().status != AgentStatus::Terminated)
        .count();

    let mut reusable_workers: Vec<Agent> = if reuse_idle_workers {
        let mut idle: Vec<Agent> = ctx
            .agents
            .iter()
            .filter(|e| {
                let a = e.value();
                a.role == Role::Worker
                    && a.status == AgentStatus::Idle
                    && a.current_task.is_none()
                    && a.session_name.is_some()
                    && a.window_index.is_some()
                    && a.pane_index.is_some()
            })
            .map(|e| e.value().clone())
            .collect();
        idle.sort_by_key(|a| a.last_activity);
        idle
    } else {
        Vec::new()
    };

    let requested_count = worker_configs.len();
    let reuse_count = requested_count.min(reusable_workers.len());
    let new_needed = requested_count.saturating_sub(reuse_count);
    let new_capacity = profile.max_workers.saturating_sub(current_worker_count);
    if new_needed > new_capacity {
        return Err(FleetError::CapacityExceeded {
            current: current_worker_count,
            requested: requested_count,
            available: new_capacity,
        });
    }

    let mut reuse_pairs: Vec<(WorkerConfig, Agent)> = Vec::new();
    let mut create_configs: Vec<WorkerConfig> = Vec::new();
    for config in worker_configs {
        let mut matched = false;
        if reuse_idle_workers && !reusable_workers.is_empty() {
            if let Some(preferred) = config.preferred_cli {
                if let Some(pos) = reusable_workers.iter().position(|w| w.ai_cli == Some(preferred)) {
                    reuse_pairs.push((config.clone(), reusable_workers.remove(pos)));
                    matched = true;
                }
            } else {
                reuse_pairs.push((config.clone(), reusable_workers.remove(0)));
                matched = true;
            }
        }
        if !matched {
            create_configs.push(config);
        }
    }

    let new_capacity_after_reuse = profile.max_workers.saturating_sub(current_worker_count);
    if create_configs.len() > new_capacity_after_reuse {
        return Err(FleetError::CapacityExceeded {
            current: current_worker_count,
            requested: create_configs.len(),
            available: new_capacity_after_reuse,
        });
    }

    let enable_worktree = settings.enable_worktree;
    let project_name = repo_path
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("project")
        .to_string();
    let pre_assigned = pre_assign_pane_slots(
        ctx,
        &settings,
        &project_name,
        profile.max_workers,
        create_configs.len(),
    );

    let reuse_len = reuse_pairs.len();
    let mut reuse_futures = Vec::with_capacity(reuse_len);
    for (i, (config, worker)) in reuse_pairs.into_iter().enumerate() {
        reuse_futures.push(reuse_single_worker(
            ctx,
            deps,
            &settings,
            config,
            i,
            worker,
            repo_path,
            base_branch,
            enable_worktree,
            session_id,
        ));
    }
    let mut create_futures = Vec::with_capacity(create_configs.len());
    for (i, config) in create_configs.into_iter().enumerate() {
        create_futures.push(create_single_worker(
            ctx,
            deps,
            &settings,
            config,
            i + reuse_len,
            pre_assigned[i],
            repo_path,
            base_branch,
            &project_name,
            enable_worktree,
            session_id,
        ));
    }

    let reuse_results = futures::future::join_all(reuse_futures).await;
    let create_results = futures::future::join_all(create_futures).await;

    let mut workers = Vec::new();
    let mut errors = Vec::new();
    let mut failed_count = 0;
    for result in reuse_results.into_iter().chain(create_results) {
        if result.success {
            workers.push(result);
        } else {
            failed_count += 1;
            errors.push(result.error.clone().unwrap_or_else(|| "unknown error".into()));
        }
    }

    let ok = failed_count == 0;
    let message = if ok {
        format!("{} worker(s) processed successfully", workers.len())
    } else {
        format!("{} worker(s) processed ({failed_count} failed)", workers.len())
    };

    Ok(BatchOutcome {
        success: ok,
        workers,
        failed_count,
        errors,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_branch_falls_back_to_worker_number() {
        assert_eq!(default_branch(None, 3), "worker-3");
        assert_eq!(default_branch(Some("custom"), 3), "custom");
    }

    #[test]
    fn validate_config_requires_task_id_with_content() {
        let config = WorkerConfig {
            task_content: Some("do it".into()),
            ..Default::default()
        };
        assert!(validate_config(&config, 0).is_some());
    }

    #[tokio::test]
    async fn pre_assign_reserves_distinct_slots() {
        let ctx = AppContext::new(Settings::defaults());
        let settings = Settings::defaults();
        let slots = pre_assign_pane_slots(&ctx, &settings, "proj", 6, 3);
        assert_eq!(slots.len(), 3);
        let unique: std::collections::HashSet<_> = slots.iter().flatten().collect();
        assert_eq!(unique.len(), 3);
    }
}
