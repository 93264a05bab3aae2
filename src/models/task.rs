use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Logs are retained as the last 5 entries; older ones are dropped on push.
const MAX_LOG_ENTRIES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<String>,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    pub progress: u8,
    pub error_message: Option<String>,
    pub checklist: Vec<ChecklistItem>,
    #[serde(default)]
    pub logs: VecDeque<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub label: String,
    pub done: bool,
}

impl Task {
    pub fn new(id: String, title: String, description: String) -> Self {
        Self {
            id,
            title,
            description,
            status: TaskStatus::Pending,
            assigned_agent_id: None,
            branch: None,
            worktree_path: None,
            progress: 0,
            error_message: None,
            checklist: Vec::new(),
            logs: VecDeque::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn push_log(&mut self, line: impl Into<String>) {
        self.logs.push_back(line.into());
        while self.logs.len() > MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
    }

    /// Apply a status transition, enforcing the invariants of spec §3:
    /// `in_progress ⇒ started_at≠null`, `{completed,failed} ⇒ completed_at≠null`,
    /// `completed ⇒ progress=100`.
    pub fn transition(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::InProgress => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Completed => {
                self.completed_at.get_or_insert_with(Utc::now);
                self.progress = 100;
            }
            TaskStatus::Failed => {
                self.completed_at.get_or_insert_with(Utc::now);
            }
            TaskStatus::Pending => {}
        }
        self.status = status;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completing_a_task_sets_progress_and_completed_at() {
        let mut task = Task::new("t1".into(), "Title".into(), "Desc".into());
        task.transition(TaskStatus::InProgress);
        assert!(task.started_at.is_some());
        task.transition(TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn log_retention_keeps_last_five() {
        let mut task = Task::new("t1".into(), "Title".into(), "Desc".into());
        for i in 0..8 {
            task.push_log(format!("line {i}"));
        }
        assert_eq!(task.logs.len(), 5);
        assert_eq!(task.logs.front().unwrap(), "line 3");
    }
}
