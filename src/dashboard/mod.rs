//! Dashboard & Task Store (spec §4.8, §6).
//!
//! One JSON snapshot per session (`dashboard/dashboard_<session>.json`)
//! plus a human-readable markdown view, and per-agent task instruction
//! files under `tasks/<agent_id>.md`. Writes are atomic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{FleetError, Result};
use crate::models::{AgentStatus, ChecklistItem, CostCall, CostSource, Role, Task, TaskStatus};
use crate::utils::atomic_write;

/// The last N cost calls kept for status-line dedup (§4.8).
const COST_DEDUP_WINDOW: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub role: Role,
    pub status: AgentStatus,
    pub current_task: Option<String>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub in_progress_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub total_agents: usize,
    pub idle_agents: usize,
    pub busy_agents: usize,
    pub estimated_cost_usd: f64,
    pub actual_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub session_id: String,
    pub tasks: HashMap<String, Task>,
    pub agent_summaries: HashMap<String, AgentSummary>,
    pub cost_calls: Vec<CostCall>,
    #[serde(default)]
    pub stats: DashboardStats,
}

impl DashboardSnapshot {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            tasks: HashMap::new(),
            agent_summaries: HashMap::new(),
            cost_calls: Vec::new(),
            stats: DashboardStats::default(),
        }
    }
}

pub struct Dashboard {
    session_dir: PathBuf,
    session_id: String,
}

impl Dashboard {
    pub fn new(session_dir: PathBuf, session_id: String) -> Self {
        Self {
            session_dir,
            session_id,
        }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.session_dir
            .join("dashboard")
            .join(format!("dashboard_{}.json", self.session_id))
    }

    fn markdown_path(&self) -> PathBuf {
        self.session_dir
            .join("dashboard")
            .join(format!("dashboard_{}.md", self.session_id))
    }

    fn load(&self) -> Result<DashboardSnapshot> {
        let path = self.snapshot_path();
        if !path.is_file() {
            return Ok(DashboardSnapshot::new(self.session_id.clone()));
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, snapshot: &mut DashboardSnapshot) -> Result<()> {
        recalculate_stats(snapshot);
        let json = serde_json::to_string_pretty(snapshot)?;
        atomic_write(&self.snapshot_path(), &json)?;
        atomic_write(&self.markdown_path(), &render_markdown(snapshot))?;
        Ok(())
    }

    /// Remove the snapshot (and markdown view) file (teardown step 4).
    pub fn cleanup(&self) -> Result<()> {
        for path in [self.snapshot_path(), self.markdown_path()] {
            if path.is_file() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    pub fn create_task(&self, id: String, title: String, description: String) -> Result<Task> {
        let mut snapshot = self.load()?;
        if snapshot.tasks.contains_key(&id) {
            return Err(FleetError::AlreadyExists(format!("task {id}")));
        }
        let task = Task::new(id.clone(), title, description);
        snapshot.tasks.insert(id, task.clone());
        self.save(&mut snapshot)?;
        Ok(task)
    }

    /// Apply a status transition, enforcing the started_at/completed_at
    /// invariants via `Task::transition`.
    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<Task> {
        let mut snapshot = self.load()?;
        let task = snapshot
            .tasks
            .get_mut(id)
            .ok_or_else(|| FleetError::NotFound { kind: "task", id: id.to_string() })?;
        task.transition(status);
        let result = task.clone();
        self.save(&mut snapshot)?;
        Ok(result)
    }

    pub fn update_task_checklist(&self, id: &str, checklist: Vec<ChecklistItem>) -> Result<Task> {
        let mut snapshot = self.load()?;
        let task = snapshot
            .tasks
            .get_mut(id)
            .ok_or_else(|| FleetError::NotFound { kind: "task", id: id.to_string() })?;
        task.checklist = checklist;
        let result = task.clone();
        self.save(&mut snapshot)?;
        Ok(result)
    }

    /// Assign `task_id` to `agent_id`, atomically: on failure nothing is
    /// persisted (the scheduler is responsible for reverting its own
    /// in-memory agent fields on a `Dashboard` failure, per §4.7).
    pub fn assign_task(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let mut snapshot = self.load()?;
        let task = snapshot
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| FleetError::NotFound { kind: "task", id: task_id.to_string() })?;
        task.assigned_agent_id = Some(agent_id.to_string());
        let result = task.clone();
        self.save(&mut snapshot)?;
        Ok(result)
    }

    pub fn remove_task(&self, id: &str) -> Result<()> {
        let mut snapshot = self.load()?;
        snapshot.tasks.remove(id);
        self.save(&mut snapshot)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.load()?.tasks.get(id).cloned())
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>, agent_id: Option<&str>) -> Result<Vec<Task>> {
        let snapshot = self.load()?;
        let mut tasks: Vec<Task> = snapshot
            .tasks
            .values()
            .filter(|t| status.map(|s| t.status == s).unwrap_or(true))
            .filter(|t| {
                agent_id
                    .map(|a| t.assigned_agent_id.as_deref() == Some(a))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    pub fn update_agent_summary(&self, summary: AgentSummary) -> Result<()> {
        let mut snapshot = self.load()?;
        snapshot.agent_summaries.insert(summary.agent_id.clone(), summary);
        self.save(&mut snapshot)
    }

    pub fn remove_agent_summary(&self, agent_id: &str) -> Result<()> {
        let mut snapshot = self.load()?;
        snapshot.agent_summaries.remove(agent_id);
        self.save(&mut snapshot)
    }

    /// Record a cost call, deduplicating actual calls by `(agent_id,
    /// status_line)` over the last 50 recorded calls.
    pub fn record_api_call(&self, call: CostCall) -> Result<bool> {
        let mut snapshot = self.load()?;
        if call.source == CostSource::Actual {
            if let Some(key) = call.dedup_key() {
                let window_start = snapshot.cost_calls.len().saturating_sub(COST_DEDUP_WINDOW);
                let duplicate = snapshot.cost_calls[window_start..]
                    .iter()
                    .any(|c| c.dedup_key().as_ref() == Some(&key));
                if duplicate {
                    return Ok(false);
                }
            }
        }
        snapshot.cost_calls.push(call);
        self.save(&mut snapshot)?;
        Ok(true)
    }

    pub fn get_cost_estimate(&self, settings: &Settings) -> Result<f64> {
        let snapshot = self.load()?;
        Ok(total_cost(&snapshot, settings))
    }

    pub fn check_cost_warning(&self, settings: &Settings) -> Result<bool> {
        Ok(self.get_cost_estimate(settings)? >= settings.cost_warning_threshold_usd)
    }

    pub fn reset_cost_counter(&self) -> Result<()> {
        let mut snapshot = self.load()?;
        snapshot.cost_calls.clear();
        self.save(&mut snapshot)
    }

    fn task_file_path(&self, agent_id: &str) -> PathBuf {
        self.session_dir.join("tasks").join(format!("{agent_id}.md"))
    }

    pub fn write_task_file(&self, agent_id: &str, rendered: &str) -> Result<PathBuf> {
        let path = self.task_file_path(agent_id);
        atomic_write(&path, rendered)?;
        Ok(path)
    }

    pub fn read_task_file(&self, agent_id: &str) -> Result<Option<String>> {
        let path = self.task_file_path(agent_id);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }

    pub fn clear_task_file(&self, agent_id: &str) -> Result<()> {
        let path = self.task_file_path(agent_id);
        if path.is_file() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn total_cost(snapshot: &DashboardSnapshot, settings: &Settings) -> f64 {
    snapshot
        .cost_calls
        .iter()
        .map(|call| match call.source {
            CostSource::Actual => call.actual_cost_usd.unwrap_or(0.0),
            CostSource::Estimated => {
                let rate = settings.cost_per_1k_tokens.get(&call.ai_cli).copied().unwrap_or(0.0);
                (call.estimated_tokens as f64 / 1000.0) * rate
            }
        })
        .sum()
}

fn recalculate_stats(snapshot: &mut DashboardSnapshot) {
    let mut stats = DashboardStats::default();
    stats.total_tasks = snapshot.tasks.len();
    for task in snapshot.tasks.values() {
        match task.status {
            TaskStatus::Pending => stats.pending_tasks += 1,
            TaskStatus::InProgress => stats.in_progress_tasks += 1,
            TaskStatus::Completed => stats.completed_tasks += 1,
            TaskStatus::Failed => stats.failed_tasks += 1,
        }
    }
    stats.total_agents = snapshot.agent_summaries.len();
    for summary in snapshot.agent_summaries.values() {
        match summary.status {
            AgentStatus::Idle => stats.idle_agents += 1,
            AgentStatus::Busy => stats.busy_agents += 1,
            _ => {}
        }
    }
    for call in &snapshot.cost_calls {
        match call.source {
            CostSource::Actual => stats.actual_cost_usd += call.actual_cost_usd.unwrap_or(0.0),
            CostSource::Estimated => {
                stats.estimated_cost_usd += call.estimated_tokens as f64 / 1000.0 * 0.015;
            }
        }
    }
    snapshot.stats = stats;
}

fn render_markdown(snapshot: &DashboardSnapshot) -> String {
    let mut out = format!("# Dashboard — session `{}`\n\n", snapshot.session_id);
    out.push_str(&format!(
        "Tasks: {} total, {} pending, {} in progress, {} completed, {} failed\n\n",
        snapshot.stats.total_tasks,
        snapshot.stats.pending_tasks,
        snapshot.stats.in_progress_tasks,
        snapshot.stats.completed_tasks,
        snapshot.stats.failed_tasks
    ));
    out.push_str("## Tasks\n\n");
    let mut tasks: Vec<&Task> = snapshot.tasks.values().collect();
    tasks.sort_by_key(|t| t.created_at);
    for task in tasks {
        out.push_str(&format!(
            "- `{}` **{}** — {:?} ({}%) agent={}\n",
            task.id,
            task.title,
            task.status,
            task.progress,
            task.assigned_agent_id.as_deref().unwrap_or("-")
        ));
    }
    out.push_str("\n## Agents\n\n");
    let mut agents: Vec<&AgentSummary> = snapshot.agent_summaries.values().collect();
    agents.sort_by_key(|a| a.agent_id.clone());
    for agent in agents {
        out.push_str(&format!(
            "- `{}` {:?}/{:?} task={}\n",
            agent.agent_id,
            agent.role,
            agent.status,
            agent.current_task.as_deref().unwrap_or("-")
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AICli;

    fn dash(dir: &Path) -> Dashboard {
        Dashboard::new(dir.to_path_buf(), "sess-1".into())
    }

    #[test]
    fn completing_task_enforces_progress_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let dashboard = dash(dir.path());
        dashboard.create_task("t1".into(), "Title".into(), "Desc".into()).unwrap();
        dashboard.update_task_status("t1", TaskStatus::InProgress).unwrap();
        let task = dashboard.update_task_status("t1", TaskStatus::Completed).unwrap();
        assert_eq!(task.progress, 100);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn duplicate_actual_cost_call_is_deduped() {
        let dir = tempfile::tempdir().unwrap();
        let dashboard = dash(dir.path());
        let call = CostCall::actual(AICli::Claude, "agent-1".into(), "cost $0.02".into(), 0.02);
        assert!(dashboard.record_api_call(call.clone()).unwrap());
        assert!(!dashboard.record_api_call(call).unwrap());
    }

    #[test]
    fn cost_estimate_sums_estimated_and_actual() {
        let dir = tempfile::tempdir().unwrap();
        let dashboard = dash(dir.path());
        let settings = Settings::defaults();
        dashboard
            .record_api_call(CostCall::estimated(AICli::Claude, "sonnet".into(), 2000))
            .unwrap();
        dashboard
            .record_api_call(CostCall::actual(AICli::Claude, "a1".into(), "cost $1.00".into(), 1.0))
            .unwrap();
        let total = dashboard.get_cost_estimate(&settings).unwrap();
        assert!((total - 1.03).abs() < 1e-9);
    }

    #[test]
    fn list_tasks_filters_by_status_and_agent() {
        let dir = tempfile::tempdir().unwrap();
        let dashboard = dash(dir.path());
        dashboard.create_task("t1".into(), "A".into(), "".into()).unwrap();
        dashboard.create_task("t2".into(), "B".into(), "".into()).unwrap();
        dashboard.assign_task("t1", "worker-1").unwrap();
        dashboard.update_task_status("t1", TaskStatus::InProgress).unwrap();

        let in_progress = dashboard.list_tasks(Some(TaskStatus::InProgress), None).unwrap();
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].id, "t1");

        let for_worker = dashboard.list_tasks(None, Some("worker-1")).unwrap();
        assert_eq!(for_worker.len(), 1);
    }

    #[test]
    fn task_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let dashboard = dash(dir.path());
        dashboard.write_task_file("worker-1", "# Task\ndo it").unwrap();
        assert_eq!(
            dashboard.read_task_file("worker-1").unwrap().unwrap(),
            "# Task\ndo it"
        );
        dashboard.clear_task_file("worker-1").unwrap();
        assert!(dashboard.read_task_file("worker-1").unwrap().is_none());
    }
}
