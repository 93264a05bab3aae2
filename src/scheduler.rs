//! Scheduler (spec §4.7): priority heap + dependency-gated auto-assignment.
//!
//! Grounded verbatim in `original_source/src/managers/scheduler_manager.py`
//! (`SchedulerManager`): a `BinaryHeap<ScheduledTask>` keyed by
//! `(priority, created_at)`, an `assigned_tasks: task_id -> agent_id` map,
//! and the atomic assign/revert sequence in `assign_task`.

use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};

use crate::agent::AgentStore;
use crate::context::AppContext;
use crate::dashboard::Dashboard;
use crate::models::{AgentStatus, Role, ScheduledTask};

/// Mirrors the Python `IntEnum`: lower value = more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

pub struct QueueEntry {
    pub task_id: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub dependencies: Vec<String>,
    pub dependencies_satisfied: bool,
}

pub struct QueueStatus {
    pub pending: Vec<QueueEntry>,
    pub assigned: Vec<(String, String)>,
    pub idle_workers: Vec<String>,
}

/// In-memory priority queue over tasks, paired with the session's
/// [`Dashboard`] (for dependency/assignment persistence) and [`AgentStore`]
/// (for agent state persistence) — both re-resolved per call rather than
/// cached, per §5's "tool handlers must tolerate re-resolving from file".
pub struct Scheduler {
    queue: BinaryHeap<ScheduledTask>,
    task_map: HashMap<String, ScheduledTask>,
    assigned: HashMap<String, String>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            task_map: HashMap::new(),
            assigned: HashMap::new(),
        }
    }

    /// Rejects a duplicate `task_id` already in the queue (§4.7).
    pub fn enqueue_task(&mut self, task_id: String, priority: TaskPriority, dependencies: Vec<String>) -> bool {
        if self.task_map.contains_key(&task_id) {
            return false;
        }
        let scheduled = ScheduledTask::new(task_id.clone(), priority as i32, dependencies);
        self.queue.push(scheduled.clone());
        self.task_map.insert(task_id, scheduled);
        true
    }

    pub fn dequeue_task(&mut self, task_id: &str) -> bool {
        if self.task_map.remove(task_id).is_none() {
            return false;
        }
        self.queue = self.queue.drain().filter(|t| t.task_id != task_id).collect();
        true
    }

    pub fn update_priority(&mut self, task_id: &str, priority: TaskPriority) -> bool {
        let Some(existing) = self.task_map.get(task_id).cloned() else {
            return false;
        };
        self.dequeue_task(task_id);
        self.enqueue_task(task_id.to_string(), priority, existing.dependencies)
    }

    /// Every dependency must be a Dashboard task with status `completed`.
    /// Takes one `list_tasks()` snapshot per call and checks every
    /// dependency against it, rather than re-querying per entry (§4.7).
    fn dependencies_satisfied(dependencies: &[String], snapshot: &HashMap<String, crate::models::TaskStatus>) -> bool {
        dependencies.iter().all(|dep| {
            matches!(snapshot.get(dep), Some(crate::models::TaskStatus::Completed))
        })
    }

    /// Scans heap order (urgency, then creation time) for the first
    /// unassigned task whose dependencies are all satisfied, using a single
    /// `list_tasks()` snapshot for the whole scan.
    pub fn get_next_task(&self, dashboard: &Dashboard) -> crate::error::Result<Option<String>> {
        let snapshot: HashMap<String, crate::models::TaskStatus> = dashboard
            .list_tasks(None, None)?
            .into_iter()
            .map(|t| (t.id, t.status))
            .collect();
        let mut ordered: Vec<&ScheduledTask> = self.queue.iter().collect();
        ordered.sort();
        ordered.reverse();
        for scheduled in ordered {
            if self.assigned.contains_key(&scheduled.task_id) {
                continue;
            }
            if Self::dependencies_satisfied(&scheduled.dependencies, &snapshot) {
                return Ok(Some(scheduled.task_id.clone()));
            }
        }
        Ok(None)
    }

    pub fn get_idle_workers(&self, ctx: &AppContext) -> Vec<String> {
        ctx.agents
            .iter()
            .filter(|e| e.value().role == Role::Worker && e.value().status == AgentStatus::Idle)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn get_idle_worker(&self, ctx: &AppContext) -> Option<String> {
        self.get_idle_workers(ctx).into_iter().next()
    }

    /// Atomic assign: flip the agent to `busy` and persist *before* calling
    /// `Dashboard::assign_task`; on Dashboard failure, revert all three
    /// fields (`status`, `current_task`, `last_activity`) to their pre-state
    /// and re-persist (§4.7).
    pub fn assign_task(
        &mut self,
        ctx: &AppContext,
        agent_store: &AgentStore,
        dashboard: &Dashboard,
        task_id: &str,
        worker_id: &str,
    ) -> crate::error::Result<(bool, String)> {
        if !self.task_map.contains_key(task_id) {
            return Ok((false, format!("task {task_id} is not queued")));
        }
        let Some(mut agent_ref) = ctx.agents.get_mut(worker_id) else {
            return Ok((false, format!("worker {worker_id} not found")));
        };
        if agent_ref.role != Role::Worker {
            return Ok((false, format!("{worker_id} is not a worker")));
        }
        if agent_ref.status != AgentStatus::Idle {
            return Ok((false, format!("worker {worker_id} is not idle (status={:?})", agent_ref.status)));
        }

        let previous_status = agent_ref.status;
        let previous_task = agent_ref.current_task.clone();
        let previous_activity = agent_ref.last_activity;

        agent_ref.status = AgentStatus::Busy;
        agent_ref.current_task = Some(task_id.to_string());
        agent_ref.touch();
        drop(agent_ref);
        Self::persist(ctx, agent_store)?;

        self.assigned.insert(task_id.to_string(), worker_id.to_string());
        match dashboard.assign_task(task_id, worker_id) {
            Ok(_) => Ok((true, format!("assigned {task_id} to {worker_id}"))),
            Err(e) => {
                self.assigned.remove(task_id);
                if let Some(mut agent_ref) = ctx.agents.get_mut(worker_id) {
                    agent_ref.status = previous_status;
                    agent_ref.current_task = previous_task;
                    agent_ref.last_activity = previous_activity;
                }
                Self::persist(ctx, agent_store)?;
                Ok((false, e.to_string()))
            }
        }
    }

    fn persist(ctx: &AppContext, agent_store: &AgentStore) -> crate::error::Result<()> {
        let snapshot: HashMap<String, crate::models::Agent> = ctx
            .agents
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        agent_store.save(&snapshot)
    }

    /// Assign exactly one ready task to exactly one idle worker.
    pub fn auto_assign(
        &mut self,
        ctx: &AppContext,
        agent_store: &AgentStore,
        dashboard: &Dashboard,
    ) -> crate::error::Result<Option<(String, String)>> {
        let Some(task_id) = self.get_next_task(dashboard)? else {
            return Ok(None);
        };
        let Some(worker_id) = self.get_idle_worker(ctx) else {
            return Ok(None);
        };
        let (success, _) = self.assign_task(ctx, agent_store, dashboard, &task_id, &worker_id)?;
        Ok(success.then_some((task_id, worker_id)))
    }

    /// Iterates `auto_assign` until exhausted. Each assignment flips the
    /// worker's status to `busy` synchronously before the next iteration
    /// reads `get_idle_worker`, so no idle worker is ever double-assigned
    /// within one pass (§4.7).
    pub fn run_auto_assign_loop(
        &mut self,
        ctx: &AppContext,
        agent_store: &AgentStore,
        dashboard: &Dashboard,
    ) -> crate::error::Result<Vec<(String, String)>> {
        let mut assignments = Vec::new();
        while let Some(pair) = self.auto_assign(ctx, agent_store, dashboard)? {
            assignments.push(pair);
        }
        Ok(assignments)
    }

    pub fn complete_task(&mut self, task_id: &str) -> bool {
        self.assigned.remove(task_id);
        self.dequeue_task(task_id)
    }

    /// Snapshot everything needed to reconstruct this scheduler elsewhere
    /// (§6 `scheduler.json`) — heap iteration order isn't itself
    /// meaningful, so `restore` rebuilds the heap from these entries
    /// rather than trying to serialize it directly.
    pub fn pending_snapshot(&self) -> Vec<ScheduledTask> {
        self.task_map.values().cloned().collect()
    }

    pub fn assigned_snapshot(&self) -> HashMap<String, String> {
        self.assigned.clone()
    }

    pub fn restore(pending: Vec<ScheduledTask>, assigned: HashMap<String, String>) -> Self {
        let mut scheduler = Self::new();
        for task in pending {
            scheduler.queue.push(task.clone());
            scheduler.task_map.insert(task.task_id.clone(), task);
        }
        scheduler.assigned = assigned;
        scheduler
    }

    pub fn get_queue_status(&self, dashboard: &Dashboard, ctx: &AppContext) -> crate::error::Result<QueueStatus> {
        let snapshot: HashMap<String, crate::models::TaskStatus> = dashboard
            .list_tasks(None, None)?
            .into_iter()
            .map(|t| (t.id, t.status))
            .collect();
        let mut ordered: Vec<&ScheduledTask> = self.queue.iter().collect();
        ordered.sort();
        ordered.reverse();
        let pending = ordered
            .into_iter()
            .filter(|t| !self.assigned.contains_key(&t.task_id))
            .map(|t| QueueEntry {
                task_id: t.task_id.clone(),
                priority: t.priority,
                created_at: t.created_at,
                dependencies: t.dependencies.clone(),
                dependencies_satisfied: Self::dependencies_satisfied(&t.dependencies, &snapshot),
            })
            .collect();
        Ok(QueueStatus {
            pending,
            assigned: self.assigned.iter().map(|(t, w)| (t.clone(), w.clone())).collect(),
            idle_workers: self.get_idle_workers(ctx),
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Agent, TaskStatus};

    fn fixture() -> (AppContext, AgentStore, Dashboard, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::new(crate::config::Settings::defaults());
        let agent_store = AgentStore::new(dir.path());
        let dashboard = Dashboard::new(dir.path().to_path_buf(), "sess-1".into());
        (ctx, agent_store, dashboard, dir)
    }

    fn idle_worker(id: &str) -> Agent {
        Agent::new_paned(id.into(), Role::Worker, "/repo".into(), "proj".into(), 0, 1, None)
    }

    #[test]
    fn enqueue_rejects_duplicate_task_id() {
        let mut scheduler = Scheduler::new();
        assert!(scheduler.enqueue_task("t1".into(), TaskPriority::Medium, vec![]));
        assert!(!scheduler.enqueue_task("t1".into(), TaskPriority::High, vec![]));
    }

    #[test]
    fn get_next_task_skips_unsatisfied_dependencies() {
        let (_ctx, _store, dashboard, _dir) = fixture();
        dashboard.create_task("dep".into(), "Dep".into(), "".into()).unwrap();
        let mut scheduler = Scheduler::new();
        scheduler.enqueue_task("t1".into(), TaskPriority::Medium, vec!["dep".into()]);
        assert_eq!(scheduler.get_next_task(&dashboard).unwrap(), None);

        dashboard.update_task_status("dep", TaskStatus::InProgress).unwrap();
        dashboard.update_task_status("dep", TaskStatus::Completed).unwrap();
        assert_eq!(scheduler.get_next_task(&dashboard).unwrap(), Some("t1".to_string()));
    }

    #[test]
    fn assign_task_flips_agent_busy_and_persists() {
        let (ctx, store, dashboard, _dir) = fixture();
        ctx.agents.insert("w1".into(), idle_worker("w1"));
        dashboard.create_task("t1".into(), "T".into(), "".into()).unwrap();
        let mut scheduler = Scheduler::new();
        scheduler.enqueue_task("t1".into(), TaskPriority::Medium, vec![]);

        let (ok, _) = scheduler.assign_task(&ctx, &store, &dashboard, "t1", "w1").unwrap();
        assert!(ok);
        assert_eq!(ctx.agents.get("w1").unwrap().status, AgentStatus::Busy);
        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.get("w1").unwrap().status, AgentStatus::Busy);
    }

    #[test]
    fn assign_task_reverts_on_dashboard_failure() {
        let (ctx, store, dashboard, _dir) = fixture();
        ctx.agents.insert("w1".into(), idle_worker("w1"));
        let mut scheduler = Scheduler::new();
        scheduler.enqueue_task("ghost-task".into(), TaskPriority::Medium, vec![]);

        let (ok, _) = scheduler
            .assign_task(&ctx, &store, &dashboard, "ghost-task", "w1")
            .unwrap();
        assert!(!ok, "dashboard has no such task, assignment must fail");
        assert_eq!(ctx.agents.get("w1").unwrap().status, AgentStatus::Idle);
        assert!(ctx.agents.get("w1").unwrap().current_task.is_none());
    }

    #[test]
    fn run_auto_assign_loop_never_double_assigns_one_worker() {
        let (ctx, store, dashboard, _dir) = fixture();
        ctx.agents.insert("w1".into(), idle_worker("w1"));
        dashboard.create_task("t1".into(), "T1".into(), "".into()).unwrap();
        dashboard.create_task("t2".into(), "T2".into(), "".into()).unwrap();
        let mut scheduler = Scheduler::new();
        scheduler.enqueue_task("t1".into(), TaskPriority::Medium, vec![]);
        scheduler.enqueue_task("t2".into(), TaskPriority::Medium, vec![]);

        let assignments = scheduler.run_auto_assign_loop(&ctx, &store, &dashboard).unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].1, "w1");
    }

    #[test]
    fn snapshot_then_restore_preserves_ordering_and_assignment() {
        let (ctx, store, dashboard, _dir) = fixture();
        ctx.agents.insert("w1".into(), idle_worker("w1"));
        dashboard.create_task("t1".into(), "T1".into(), "".into()).unwrap();
        dashboard.create_task("t2".into(), "T2".into(), "".into()).unwrap();
        let mut scheduler = Scheduler::new();
        scheduler.enqueue_task("t1".into(), TaskPriority::Low, vec![]);
        scheduler.enqueue_task("t2".into(), TaskPriority::Critical, vec![]);
        scheduler.assign_task(&ctx, &store, &dashboard, "t2", "w1").unwrap();

        let restored = Scheduler::restore(scheduler.pending_snapshot(), scheduler.assigned_snapshot());
        assert_eq!(restored.get_next_task(&dashboard).unwrap(), Some("t1".to_string()));
        assert_eq!(restored.assigned_snapshot().get("t2"), Some(&"w1".to_string()));
    }
}
