//! Session Init & Teardown (spec §4.12).
//!
//! Grounded in spec §4.12's step-by-step description (the original
//! `session_tools.py` is not present in the retrieved pack) and the
//! teacher's own pattern of a single filesystem root per session. Every
//! path this module touches is rooted at
//! `<project_root>/<mcp_dir>/<session_id>/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::agent::AgentStore;
use crate::config::Settings;
use crate::context::AppContext;
use crate::dashboard::Dashboard;
use crate::error::{FleetError, Result};
use crate::git::{GtrWorktreeManager, ShellWorktreeManager, WorktreeProvisioner};
use crate::healthcheck;
use crate::ipc::IpcStore;
use crate::models::sanitize_filename;
use crate::registry::{ConfigStore, ProjectConfig, Registry};
use crate::tmux::TmuxDriver;

/// Derive a filesystem/tmux-safe project name from a repo path's final
/// path segment (spec §4.12 step 2).
pub fn resolve_project_name(repo_path: &str) -> String {
    let name = Path::new(repo_path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("project");
    sanitize_filename(name, "project")
}

/// All paths rooted at `<project_root>/<mcp_dir>/<session_id>/`.
pub struct SessionPaths {
    pub mcp_root: PathBuf,
    pub session_dir: PathBuf,
}

impl SessionPaths {
    pub fn new(project_root: &Path, mcp_dir: &str, session_id: &str) -> Self {
        let mcp_root = project_root.join(mcp_dir);
        Self {
            session_dir: mcp_root.join(session_id),
            mcp_root,
        }
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.mcp_root.join("memory")
    }

    pub fn screenshot_dir(&self) -> PathBuf {
        self.mcp_root.join("screenshot")
    }

    pub fn env_path(&self) -> PathBuf {
        self.mcp_root.join(".env")
    }
}

/// `.env` template rendered from live `Settings` defaults (spec §4.12 step
/// 7), using the exact `MCP_*` keys `Settings::apply_one` understands.
fn render_env_template(settings: &Settings) -> String {
    format!(
        "# agent-fleet environment overrides — edit, don't regenerate by hand.\n\
         MCP_ENABLE_WORKTREE={enable_worktree}\n\
         MCP_ENABLE_GIT={enable_git}\n\
         MCP_MAX_WORKERS={max_workers}\n\
         MCP_WORKERS_PER_MAIN_WINDOW={workers_per_main_window}\n\
         MCP_EXTRA_WORKER_ROWS={extra_worker_rows}\n\
         MCP_EXTRA_WORKER_COLS={extra_worker_cols}\n\
         MCP_WORKERS_PER_EXTRA_WINDOW={workers_per_extra_window}\n\
         MCP_COST_WARNING_THRESHOLD_USD={cost_threshold}\n\
         MCP_HEALTHCHECK_INTERVAL_SECONDS={healthcheck_interval}\n\
         MCP_HEALTHCHECK_IDLE_STOP_CONSECUTIVE={healthcheck_idle_stop}\n",
        enable_worktree = settings.enable_worktree,
        enable_git = settings.enable_git,
        max_workers = settings.max_workers,
        workers_per_main_window = settings.workers_per_main_window,
        extra_worker_rows = settings.extra_worker_rows,
        extra_worker_cols = settings.extra_worker_cols,
        workers_per_extra_window = settings.workers_per_extra_window,
        cost_threshold = settings.cost_warning_threshold_usd,
        healthcheck_interval = settings.healthcheck_interval_seconds,
        healthcheck_idle_stop = settings.healthcheck_idle_stop_consecutive,
    )
}

/// Enumerate immediate subdirectories of the mcp dir containing
/// `agents.json` — sessions a previous run didn't tear down cleanly
/// (spec §4.12 `detect_stale_sessions`).
pub fn detect_stale_sessions(project_root: &Path, mcp_dir: &str) -> Result<Vec<String>> {
    let root = project_root.join(mcp_dir);
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut stale = Vec::new();
    for entry in std::fs::read_dir(&root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.path().join("agents.json").is_file() {
            stale.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(stale)
}

/// Rename any `provisional-*` directory left from an id a caller supplied
/// before a real session id was minted, folding its contents into
/// `<session_id>/` (spec §4.12 steps 4-5).
fn migrate_provisional_dirs(mcp_root: &Path, session_id: &str) -> Result<()> {
    if !mcp_root.is_dir() {
        return Ok(());
    }
    let target = mcp_root.join(session_id);
    for entry in std::fs::read_dir(mcp_root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("provisional-") || !entry.file_type()?.is_dir() {
            continue;
        }
        if !target.is_dir() {
            std::fs::rename(entry.path(), &target)?;
        } else {
            // A real session dir already exists; discard the stale
            // provisional one rather than leaving it to accumulate.
            std::fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

pub struct InitOutcome {
    pub session_id: String,
    pub project_name: String,
    pub session_dir: PathBuf,
    pub attach_command: Option<String>,
}

/// `init_tmux_workspace` (spec §4.12), run by the Owner only.
pub async fn init_tmux_workspace(
    ctx: &Arc<AppContext>,
    tmux: &TmuxDriver,
    working_dir: &str,
    open_terminal: bool,
    auto_setup_gtr: bool,
    session_id: Option<String>,
    enable_git_override: Option<bool>,
) -> Result<InitOutcome> {
    let project_root = PathBuf::from(working_dir);
    let mut settings = Settings::resolve(&project_root)?;
    if let Some(enable_git) = enable_git_override {
        settings.enable_git = enable_git;
    }
    if settings.enable_git && !ShellWorktreeManager::is_git_repo(&project_root).await {
        return Err(FleetError::NotAGitRepo(working_dir.to_string()));
    }

    let project_name = resolve_project_name(working_dir);
    let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mcp_root = project_root.join(&settings.mcp_dir);

    // Step 3: a same-named session from a previous run that crashed
    // without running teardown is treated as stale and cleaned up.
    if tmux.session_exists(&project_name).await? {
        warn!("session '{project_name}' already exists — treating as stale and cleaning up");
        let stale_session_dir = mcp_root.join(&session_id);
        let agent_store = AgentStore::new(&stale_session_dir);
        let dashboard = Dashboard::new(stale_session_dir.clone(), session_id.clone());
        let ipc = IpcStore::new(&stale_session_dir);
        let registry = Registry::new(&dirs::home_dir().unwrap_or_default());
        cleanup_session_resources(
            ctx, tmux, &dashboard, &ipc, &agent_store, &registry, "owner", false, None,
        )
        .await?;
        tmux.kill_session(&project_name).await?;
        if tmux.session_exists(&project_name).await? {
            return Err(FleetError::SessionConflict(format!(
                "session '{project_name}' still exists after cleanup; manual intervention required"
            )));
        }
    }

    // Steps 4-5: fold any provisional session directory into the real one.
    migrate_provisional_dirs(&mcp_root, &session_id)?;

    // Step 6: optional gtr auto-detection.
    if auto_setup_gtr {
        let gtrconfig = project_root.join(".gtrconfig");
        if !gtrconfig.is_file() && GtrWorktreeManager::is_available().await {
            std::fs::write(&gtrconfig, "# generated by agent-fleet init\n")?;
        }
    }

    // Step 7: create directory layout, write `.env` template (preserving
    // any existing file) and `config.json`.
    let paths = SessionPaths::new(&project_root, &settings.mcp_dir, &session_id);
    std::fs::create_dir_all(paths.memory_dir())?;
    std::fs::create_dir_all(paths.screenshot_dir())?;
    std::fs::create_dir_all(&paths.session_dir)?;
    if !paths.env_path().is_file() {
        std::fs::write(paths.env_path(), render_env_template(&settings))?;
    }

    let config_store = ConfigStore::new(&project_root, &settings.mcp_dir);
    let mut project_config = config_store
        .read()?
        .unwrap_or_else(|| ProjectConfig::new("mcp".to_string(), settings.enable_git));
    project_config.session_id = Some(session_id.clone());
    project_config.enable_git = settings.enable_git;
    config_store.write(&project_config)?;

    // Step 8: set `project_root` on the shared context and initialize the
    // dashboard for this session (Owner only).
    *ctx.project_root.write().await = Some(project_root.clone());
    *ctx.session_id.write().await = Some(session_id.clone());
    *ctx.settings.write().await = settings;

    let dashboard = Dashboard::new(paths.session_dir.clone(), session_id.clone());
    dashboard.cleanup().ok();

    // Step 9: launch a terminal emulator, or create the headless session.
    if !tmux.session_exists(&project_name).await? {
        tmux.create_main_session(&project_name, working_dir).await?;
    }
    let attach_command = if open_terminal {
        Some(TmuxDriver::attach_command(&project_name)?)
    } else {
        None
    };

    info!("session '{session_id}' initialized for project '{project_name}'");
    Ok(InitOutcome {
        session_id,
        project_name,
        session_dir: paths.session_dir,
        attach_command,
    })
}

/// `cleanup_session_resources` (spec §4.12), the canonical ten-step
/// teardown. `owner_id` scopes the registry purge (step 6); `repo_path`
/// is required only when `remove_worktrees` is set.
#[allow(clippy::too_many_arguments)]
pub async fn cleanup_session_resources(
    ctx: &Arc<AppContext>,
    tmux: &TmuxDriver,
    dashboard: &Dashboard,
    ipc: &IpcStore,
    agent_store: &AgentStore,
    registry: &Registry,
    owner_id: &str,
    remove_worktrees: bool,
    repo_path: Option<&Path>,
) -> Result<()> {
    // 1. Kill every tmux session referenced by the agent map.
    let session_names: std::collections::HashSet<String> = ctx
        .agents
        .iter()
        .filter_map(|e| e.value().session_name.clone())
        .collect();
    let names: Vec<String> = session_names.into_iter().collect();
    for (name, result) in tmux.cleanup_sessions(&names).await {
        if let Err(e) = result {
            warn!("teardown: killing session {name} failed: {e}");
        }
    }

    // 2. Stop the healthcheck daemon.
    healthcheck::stop_daemon(ctx, Duration::from_secs(5)).await;

    // 3/4. Remove IPC and dashboard state.
    ipc.cleanup()?;
    dashboard.cleanup()?;

    // 5. Optionally remove worktrees under `.worktrees/`.
    if remove_worktrees {
        let enable_git = ctx.settings.read().await.enable_git;
        if enable_git {
            if let Some(repo_path) = repo_path {
                let shell = ShellWorktreeManager::new(repo_path.to_path_buf());
                match shell.list_worktrees().await {
                    Ok(worktrees) => {
                        for wt in worktrees {
                            if wt.path.components().any(|c| c.as_os_str() == ".worktrees") {
                                if let Err(e) = shell.remove_worktree(&wt.path).await {
                                    warn!("teardown: removing worktree {:?} failed: {e}", wt.path);
                                }
                            }
                        }
                    }
                    Err(e) => warn!("teardown: listing worktrees failed: {e}"),
                }
            }
        }
    }

    // 6. Purge registry entries owned by this Owner.
    registry.remove_by_owner(owner_id)?;

    // 7. Delete agents.json.
    agent_store.delete()?;

    if let Some(project_root) = ctx.project_root().await {
        let mcp_dir = ctx.settings.read().await.mcp_dir.clone();

        // 8. Clear session_id from config.json.
        let config_store = ConfigStore::new(&project_root, &mcp_dir);
        config_store.clear_session_id()?;

        // 9. Remove any provisional session directories.
        let mcp_root = project_root.join(&mcp_dir);
        if mcp_root.is_dir() {
            for entry in std::fs::read_dir(&mcp_root)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with("provisional-") && entry.file_type()?.is_dir() {
                    std::fs::remove_dir_all(entry.path())?;
                }
            }
        }
    }

    // 10. Reset in-memory AppContext.
    ctx.reset().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_name_is_sanitized_basename() {
        assert_eq!(resolve_project_name("/home/user/My Repo"), "My Repo");
        assert_eq!(resolve_project_name("/a/b/repo:weird"), "repo_weird");
    }

    #[test]
    fn env_template_contains_live_settings_values() {
        let settings = Settings::defaults();
        let rendered = render_env_template(&settings);
        assert!(rendered.contains("MCP_MAX_WORKERS=6"));
        assert!(rendered.contains("MCP_ENABLE_GIT=true"));
    }

    #[test]
    fn detect_stale_sessions_finds_dirs_with_agents_json() {
        let project = tempfile::tempdir().unwrap();
        let mcp_root = project.path().join(".multi-agent-mcp");
        let stale_session = mcp_root.join("sess-stale");
        std::fs::create_dir_all(&stale_session).unwrap();
        std::fs::write(stale_session.join("agents.json"), "{}").unwrap();
        let clean_session = mcp_root.join("sess-clean");
        std::fs::create_dir_all(&clean_session).unwrap();

        let stale = detect_stale_sessions(project.path(), ".multi-agent-mcp").unwrap();
        assert_eq!(stale, vec!["sess-stale".to_string()]);
    }

    #[test]
    fn migrate_provisional_dirs_renames_into_session_dir() {
        let project = tempfile::tempdir().unwrap();
        let mcp_root = project.path().join(".multi-agent-mcp");
        let provisional = mcp_root.join("provisional-abc123");
        std::fs::create_dir_all(&provisional).unwrap();
        std::fs::write(provisional.join("agents.json"), "{}").unwrap();

        migrate_provisional_dirs(&mcp_root, "sess-real").unwrap();
        assert!(mcp_root.join("sess-real").join("agents.json").is_file());
        assert!(!provisional.is_dir());
    }

    #[tokio::test]
    async fn teardown_resets_app_context() {
        let ctx = Arc::new(AppContext::new(Settings::defaults()));
        *ctx.session_id.write().await = Some("sess-1".into());
        let project = tempfile::tempdir().unwrap();
        let session_dir = project.path().join(".multi-agent-mcp").join("sess-1");
        std::fs::create_dir_all(&session_dir).unwrap();
        *ctx.project_root.write().await = Some(project.path().to_path_buf());

        let tmux = TmuxDriver::new(crate::tmux::TmuxDriverConfig {
            send_cooldown: Duration::from_millis(0),
            codex_enter_retry_max: 1,
            codex_enter_retry_interval: Duration::from_millis(0),
        });
        let dashboard = Dashboard::new(session_dir.clone(), "sess-1".into());
        let ipc = IpcStore::new(&session_dir);
        let agent_store = AgentStore::new(&session_dir);
        let home = tempfile::tempdir().unwrap();
        let registry = Registry::new(home.path());

        cleanup_session_resources(
            &ctx, &tmux, &dashboard, &ipc, &agent_store, &registry, "owner", false, None,
        )
        .await
        .unwrap();

        assert!(ctx.session_id().await.is_none());
        assert!(ctx.project_root().await.is_none());
    }
}
