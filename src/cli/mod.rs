//! CLI entry point & tool dispatch (spec §4.14).
//!
//! One subcommand per tool-call shape named across §4.2-§4.13. Every
//! command re-resolves `Settings` and `config.json` fresh rather than
//! trusting cached state (§5 "tool handlers must tolerate re-resolving
//! from file"), builds only the managers it needs, and prints one JSON
//! object shaped `{success, ...}` or `{success: false, error, message}`
//! — never a Rust `Debug` dump.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;

use crate::agent::AgentStore;
use crate::batch::{create_workers_batch, BatchDeps, WorkerConfig};
use crate::collaborators::{DefaultTemplateRenderer, TracingNotifier};
use crate::config::Settings;
use crate::context::AppContext;
use crate::cost;
use crate::dashboard::Dashboard;
use crate::error::{FleetError, Result};
use crate::git::ShellWorktreeManager;
use crate::healthcheck::{self, HealthcheckManager};
use crate::ipc::IpcStore;
use crate::memory::MemoryStore;
use crate::models::{AICli, MessagePriority, MessageType, Role, TaskStatus};
use crate::models::ScheduledTask;
use crate::registry::{ConfigStore, Registry};
use crate::scheduler::{Scheduler, TaskPriority};
use crate::session;
use crate::tmux::{TmuxDriver, TmuxDriverConfig};
use crate::utils::atomic_write;

#[derive(Parser)]
#[command(name = "agent-fleet")]
#[command(about = "Multi-agent CLI fleet orchestrator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Project root (the directory holding `.multi-agent-mcp/`)
    #[arg(short, long, default_value = ".")]
    pub repo: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the tmux workspace and session filesystem layout (§4.12).
    Init {
        #[arg(long)]
        open_terminal: bool,
        #[arg(long)]
        auto_setup_gtr: bool,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        enable_git: Option<bool>,
    },
    /// Tear down the current session's resources (§4.12).
    Teardown {
        #[arg(long)]
        remove_worktrees: bool,
    },
    /// List sessions left behind by a run that never tore down (§4.12).
    StaleSessions,
    /// List agents recorded for the current session.
    Agents,
    /// Create a batch of Worker agents (§4.6).
    CreateWorkers {
        /// One task id per worker, comma-separated.
        #[arg(long, value_delimiter = ',')]
        task_ids: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        task_titles: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        task_contents: Vec<String>,
        #[arg(long)]
        base_branch: String,
        #[arg(long)]
        preferred_cli: Option<String>,
        #[arg(long)]
        reuse_idle_workers: bool,
    },
    /// Create a dashboard task (§4.8).
    CreateTask {
        id: String,
        title: String,
        #[arg(default_value = "")]
        description: String,
    },
    /// List dashboard tasks (§4.8).
    ListTasks {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        agent_id: Option<String>,
    },
    /// Enqueue a task onto the priority scheduler (§4.7).
    Enqueue {
        task_id: String,
        #[arg(long, default_value = "medium")]
        priority: String,
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
    },
    /// Run one pass of auto-assignment over the scheduler queue (§4.7).
    AutoAssign,
    /// Send an IPC message; omit `--to` to broadcast (§4.9).
    SendMessage {
        sender: String,
        #[arg(long)]
        to: Option<String>,
        subject: String,
        content: String,
        #[arg(long, default_value = "normal")]
        priority: String,
    },
    /// Read IPC messages for an agent (§4.9).
    ReadMessages {
        agent_id: String,
        #[arg(long)]
        unread_only: bool,
        #[arg(long)]
        mark_as_read: bool,
    },
    /// Save a memory entry (§4.10).
    MemorySet {
        key: String,
        content: String,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        global: bool,
    },
    /// Read a memory entry (§4.10).
    MemoryGet {
        key: String,
        #[arg(long)]
        global: bool,
    },
    /// Search memory entries by substring and/or tags (§4.10).
    MemorySearch {
        query: String,
        #[arg(long)]
        global: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Current estimated + actual cost totals (§4.13).
    CostStatus,
    /// Start the healthcheck daemon (§4.11).
    HealthcheckStart,
    /// Stop the healthcheck daemon (§4.11).
    HealthcheckStop,
    /// One-shot healthcheck summary without starting the daemon (§4.11).
    HealthcheckStatus,
}

/// Run the parsed command, returning the JSON value to print — never
/// panics: every `FleetError` is caught and rendered as `{success: false}`.
pub async fn run(cli: Cli) -> serde_json::Value {
    match dispatch(&cli).await {
        Ok(value) => value,
        Err(e) => json!({"success": false, "error": e.code(), "message": e.to_string()}),
    }
}

struct SessionHandle {
    ctx: Arc<AppContext>,
    settings: Settings,
    project_root: PathBuf,
    session_id: String,
    session_dir: PathBuf,
    tmux: Arc<TmuxDriver>,
    dashboard: Arc<Dashboard>,
    ipc: Arc<IpcStore>,
    agent_store: Arc<AgentStore>,
}

/// Re-resolve everything a command needs from `config.json` and
/// `Settings`, then hydrate `AppContext.agents` from `agents.json` (§5).
async fn open_session(repo: &Path) -> Result<SessionHandle> {
    let project_root = repo
        .canonicalize()
        .unwrap_or_else(|_| repo.to_path_buf());
    let settings = Settings::resolve(&project_root)?;
    let config_store = ConfigStore::new(&project_root, &settings.mcp_dir);
    let config = config_store
        .read()?
        .ok_or_else(|| FleetError::InvalidConfig("no config.json; run `init` first".into()))?;
    let session_id = config
        .session_id
        .ok_or_else(|| FleetError::InvalidConfig("config.json has no active session_id".into()))?;

    let session_dir = project_root.join(&settings.mcp_dir).join(&session_id);
    let agent_store = Arc::new(AgentStore::new(&session_dir));
    let dashboard = Arc::new(Dashboard::new(session_dir.clone(), session_id.clone()));
    let ipc = Arc::new(IpcStore::new(&session_dir));
    let tmux = Arc::new(TmuxDriver::new(TmuxDriverConfig {
        send_cooldown: Duration::from_secs_f64(settings.send_cooldown_seconds),
        codex_enter_retry_max: settings.codex_enter_retry_max,
        codex_enter_retry_interval: Duration::from_millis(settings.codex_enter_retry_interval_ms),
    }));

    let ctx = Arc::new(AppContext::new(settings.clone()));
    *ctx.project_root.write().await = Some(project_root.clone());
    *ctx.session_id.write().await = Some(session_id.clone());
    for (id, agent) in agent_store.load()? {
        ctx.agents.insert(id, agent);
    }

    Ok(SessionHandle {
        ctx,
        settings,
        project_root,
        session_id,
        session_dir,
        tmux,
        dashboard,
        ipc,
        agent_store,
    })
}

/// `<session>/scheduler.json` persistence (§4.7, §6) — the CLI re-resolves
/// everything per invocation, so the in-memory `Scheduler` built by one
/// command must be snapshotted to disk for the next to pick up.
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct SchedulerSnapshot {
    pending: Vec<ScheduledTask>,
    assigned: std::collections::HashMap<String, String>,
}

fn scheduler_path(session_dir: &Path) -> PathBuf {
    session_dir.join("scheduler.json")
}

fn load_scheduler(session_dir: &Path) -> Result<Scheduler> {
    let path = scheduler_path(session_dir);
    if !path.is_file() {
        return Ok(Scheduler::new());
    }
    let contents = std::fs::read_to_string(&path)?;
    let snapshot: SchedulerSnapshot = serde_json::from_str(&contents)?;
    Ok(Scheduler::restore(snapshot.pending, snapshot.assigned))
}

fn save_scheduler(session_dir: &Path, scheduler: &Scheduler) -> Result<()> {
    let snapshot = SchedulerSnapshot {
        pending: scheduler.pending_snapshot(),
        assigned: scheduler.assigned_snapshot(),
    };
    atomic_write(&scheduler_path(session_dir), &serde_json::to_string_pretty(&snapshot)?)
}

fn parse_priority(value: &str) -> Result<MessagePriority> {
    match value.to_ascii_lowercase().as_str() {
        "low" => Ok(MessagePriority::Low),
        "normal" => Ok(MessagePriority::Normal),
        "high" => Ok(MessagePriority::High),
        "urgent" => Ok(MessagePriority::Urgent),
        other => Err(FleetError::InvalidConfig(format!("unknown message priority '{other}'"))),
    }
}

fn parse_task_priority(value: &str) -> Result<TaskPriority> {
    match value.to_ascii_lowercase().as_str() {
        "critical" => Ok(TaskPriority::Critical),
        "high" => Ok(TaskPriority::High),
        "medium" => Ok(TaskPriority::Medium),
        "low" => Ok(TaskPriority::Low),
        other => Err(FleetError::InvalidConfig(format!("unknown task priority '{other}'"))),
    }
}

fn parse_task_status(value: &str) -> Result<TaskStatus> {
    match value.to_ascii_lowercase().as_str() {
        "pending" => Ok(TaskStatus::Pending),
        "in_progress" | "in-progress" => Ok(TaskStatus::InProgress),
        "completed" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        other => Err(FleetError::InvalidConfig(format!("unknown task status '{other}'"))),
    }
}

async fn dispatch(cli: &Cli) -> Result<serde_json::Value> {
    match &cli.command {
        Commands::Init {
            open_terminal,
            auto_setup_gtr,
            session_id,
            enable_git,
        } => {
            let ctx = Arc::new(AppContext::new(Settings::defaults()));
            let settings = Settings::resolve(&cli.repo.canonicalize().unwrap_or_else(|_| cli.repo.clone()))?;
            let tmux = TmuxDriver::new(TmuxDriverConfig {
                send_cooldown: Duration::from_secs_f64(settings.send_cooldown_seconds),
                codex_enter_retry_max: settings.codex_enter_retry_max,
                codex_enter_retry_interval: Duration::from_millis(settings.codex_enter_retry_interval_ms),
            });
            let outcome = session::init_tmux_workspace(
                &ctx,
                &tmux,
                &cli.repo.to_string_lossy(),
                *open_terminal,
                *auto_setup_gtr,
                session_id.clone(),
                *enable_git,
            )
            .await?;
            Ok(json!({
                "success": true,
                "session_id": outcome.session_id,
                "project_name": outcome.project_name,
                "session_dir": outcome.session_dir.to_string_lossy(),
                "attach_command": outcome.attach_command,
            }))
        }

        Commands::Teardown { remove_worktrees } => {
            let handle = open_session(&cli.repo).await?;
            let home = dirs::home_dir().unwrap_or_default();
            let registry = Registry::new(&home);
            let owner_id = handle
                .ctx
                .agents
                .iter()
                .find(|e| e.value().role == Role::Owner)
                .map(|e| e.key().clone())
                .unwrap_or_else(|| "owner".to_string());
            session::cleanup_session_resources(
                &handle.ctx,
                &handle.tmux,
                &handle.dashboard,
                &handle.ipc,
                &handle.agent_store,
                &registry,
                &owner_id,
                *remove_worktrees,
                Some(handle.project_root.as_path()),
            )
            .await?;
            Ok(json!({"success": true, "session_id": handle.session_id}))
        }

        Commands::StaleSessions => {
            let project_root = cli.repo.canonicalize().unwrap_or_else(|_| cli.repo.clone());
            let settings = Settings::resolve(&project_root)?;
            let stale = session::detect_stale_sessions(&project_root, &settings.mcp_dir)?;
            Ok(json!({"success": true, "stale_sessions": stale}))
        }

        Commands::Agents => {
            let handle = open_session(&cli.repo).await?;
            let agents: Vec<_> = handle
                .ctx
                .agents
                .iter()
                .map(|e| e.value().clone())
                .collect();
            Ok(json!({"success": true, "agents": agents}))
        }

        Commands::CreateWorkers {
            task_ids,
            task_titles,
            task_contents,
            base_branch,
            preferred_cli,
            reuse_idle_workers,
        } => {
            let handle = open_session(&cli.repo).await?;
            let preferred: Option<AICli> = preferred_cli
                .as_deref()
                .map(str::parse)
                .transpose()?;
            let count = task_ids.len().max(task_titles.len()).max(task_contents.len()).max(1);
            let worker_configs: Vec<WorkerConfig> = (0..count)
                .map(|i| WorkerConfig {
                    task_id: task_ids.get(i).cloned(),
                    task_title: task_titles.get(i).cloned(),
                    task_content: task_contents.get(i).cloned(),
                    branch: None,
                    preferred_cli: preferred,
                })
                .collect();

            let worktrees = if handle.settings.enable_git {
                Some(Arc::new(ShellWorktreeManager::new(handle.project_root.clone()))
                    as Arc<dyn crate::git::WorktreeProvisioner>)
            } else {
                None
            };
            let deps = BatchDeps {
                tmux: handle.tmux.clone(),
                dashboard: handle.dashboard.clone(),
                ipc: handle.ipc.clone(),
                agent_store: handle.agent_store.clone(),
                worktrees,
                renderer: Arc::new(DefaultTemplateRenderer),
            };
            let outcome = create_workers_batch(
                &handle.ctx,
                &deps,
                Role::Owner,
                worker_configs,
                &handle.project_root.to_string_lossy(),
                base_branch,
                Some(handle.session_id.as_str()),
                *reuse_idle_workers,
            )
            .await?;
            Ok(serde_json::to_value(outcome)?)
        }

        Commands::CreateTask { id, title, description } => {
            let handle = open_session(&cli.repo).await?;
            let task = handle.dashboard.create_task(id.clone(), title.clone(), description.clone())?;
            Ok(json!({"success": true, "task": task}))
        }

        Commands::ListTasks { status, agent_id } => {
            let handle = open_session(&cli.repo).await?;
            let status = status.as_deref().map(parse_task_status).transpose()?;
            let tasks = handle.dashboard.list_tasks(status, agent_id.as_deref())?;
            Ok(json!({"success": true, "tasks": tasks}))
        }

        Commands::Enqueue { task_id, priority, depends_on } => {
            let handle = open_session(&cli.repo).await?;
            let priority = parse_task_priority(priority)?;
            let mut scheduler = load_scheduler(&handle.session_dir)?;
            let accepted = scheduler.enqueue_task(task_id.clone(), priority, depends_on.clone());
            save_scheduler(&handle.session_dir, &scheduler)?;
            Ok(json!({"success": accepted, "task_id": task_id}))
        }

        Commands::AutoAssign => {
            let handle = open_session(&cli.repo).await?;
            let mut scheduler = load_scheduler(&handle.session_dir)?;
            for task in handle.dashboard.list_tasks(Some(TaskStatus::Pending), None)? {
                scheduler.enqueue_task(task.id, TaskPriority::Medium, Vec::new());
            }
            let assignments = scheduler.run_auto_assign_loop(&handle.ctx, &handle.agent_store, &handle.dashboard)?;
            save_scheduler(&handle.session_dir, &scheduler)?;
            Ok(json!({"success": true, "assignments": assignments}))
        }

        Commands::SendMessage { sender, to, subject, content, priority } => {
            let handle = open_session(&cli.repo).await?;
            let priority = parse_priority(priority)?;
            let message_type = if to.is_some() {
                MessageType::StatusUpdate
            } else {
                MessageType::Broadcast
            };
            let message = handle.ipc.send_message(
                sender,
                to.as_deref(),
                message_type,
                content.clone(),
                subject.clone(),
                priority,
                serde_json::Map::new(),
            )?;
            Ok(json!({"success": true, "message_id": message.id}))
        }

        Commands::ReadMessages { agent_id, unread_only, mark_as_read } => {
            let handle = open_session(&cli.repo).await?;
            let messages = handle.ipc.read_messages(agent_id, *unread_only, None, *mark_as_read)?;
            Ok(json!({"success": true, "messages": messages}))
        }

        Commands::MemorySet { key, content, tags, global } => {
            let store = memory_store(&cli.repo, *global).await?;
            let entry = store.save(key, content, tags.clone())?;
            Ok(json!({"success": true, "entry": entry}))
        }

        Commands::MemoryGet { key, global } => {
            let store = memory_store(&cli.repo, *global).await?;
            let entry = store.get(key)?;
            Ok(json!({"success": true, "entry": entry}))
        }

        Commands::MemorySearch { query, global, limit } => {
            let store = memory_store(&cli.repo, *global).await?;
            let hits = store.search(query, None, *limit)?;
            Ok(json!({"success": true, "entries": hits}))
        }

        Commands::CostStatus => {
            let handle = open_session(&cli.repo).await?;
            let estimate = handle.dashboard.get_cost_estimate(&handle.settings)?;
            let warning = handle.dashboard.check_cost_warning(&handle.settings)?;
            Ok(json!({"success": true, "estimated_cost_usd": estimate, "warning": warning}))
        }

        Commands::HealthcheckStart => {
            let handle = open_session(&cli.repo).await?;
            let manager = Arc::new(build_healthcheck_manager(&handle));
            let started = healthcheck::start_daemon(
                handle.ctx.clone(),
                manager,
                handle.dashboard.clone(),
                handle.agent_store.clone(),
            )
            .await;
            Ok(json!({"success": true, "started": started}))
        }

        Commands::HealthcheckStop => {
            let handle = open_session(&cli.repo).await?;
            let stopped = healthcheck::stop_daemon(&handle.ctx, Duration::from_secs(5)).await;
            Ok(json!({"success": true, "stopped": stopped}))
        }

        Commands::HealthcheckStatus => {
            let handle = open_session(&cli.repo).await?;
            let manager = build_healthcheck_manager(&handle);
            let interval = handle.settings.healthcheck_interval_seconds;
            let summary = manager.get_summary(&handle.ctx, interval);
            Ok(json!({"success": true, "summary": summary}))
        }
    }
}

fn build_healthcheck_manager(handle: &SessionHandle) -> HealthcheckManager {
    let worktrees = if handle.settings.enable_git {
        Some(Arc::new(ShellWorktreeManager::new(handle.project_root.clone()))
            as Arc<dyn crate::git::WorktreeProvisioner>)
    } else {
        None
    };
    HealthcheckManager::with_notifier(
        handle.tmux.clone(),
        worktrees,
        handle.settings.enable_git,
        Some(Arc::new(TracingNotifier) as Arc<dyn crate::collaborators::Notifier>),
    )
}

/// Resolve the `MemoryStore` for a scope (§4.10). Global memory is rooted
/// at the user's home directory regardless of project; project memory is
/// rooted at the *session's* memory directory
/// (`<project>/<mcp_dir>/<session_id>/memory/`), not the top-level
/// `<mcp_dir>/memory/` scaffolding created by session init step 7 — that
/// directory exists for parity with the filesystem layout in §6 but isn't
/// addressed by any scope name in §4.10.
async fn memory_store(repo: &Path, global: bool) -> Result<MemoryStore> {
    if global {
        let home = dirs::home_dir().unwrap_or_default();
        return Ok(MemoryStore::new(home.join(".multi-agent-mcp").join("memory"), 1000, 90, false));
    }
    let handle = open_session(repo).await?;
    Ok(MemoryStore::new(
        handle.session_dir.join("memory"),
        handle.settings.memory_max_entries,
        handle.settings.memory_ttl_days,
        true,
    ))
}

/// `cost::build_actual_cost_call` entry point for pane-capture driven
/// callers (e.g. a future `healthcheck`-cycle hook); kept as a thin
/// re-export so `cli` is the single place tool dispatch lives (§4.13).
pub fn capture_actual_cost(ai_cli: AICli, agent_id: &str, captured: &str) -> Option<crate::models::CostCall> {
    cost::build_actual_cost_call(ai_cli, agent_id, captured)
}
