use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AICli;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Error,
    Terminated,
}

/// An agent occupying (at most) one pane of the tmux grid.
///
/// Owners have no pane: `session_name`, `window_index`, `pane_index` and
/// `tmux_session` are all `None` for `role == Owner`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub role: Role,
    pub status: AgentStatus,
    pub tmux_session: Option<String>,
    pub working_dir: String,
    pub worktree_path: Option<String>,
    pub branch: Option<String>,
    pub current_task: Option<String>,
    pub session_name: Option<String>,
    pub window_index: Option<usize>,
    pub pane_index: Option<usize>,
    pub ai_cli: Option<AICli>,
    pub ai_bootstrapped: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Agent {
    pub fn new_owner(id: String, working_dir: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            role: Role::Owner,
            status: AgentStatus::Idle,
            tmux_session: None,
            working_dir,
            worktree_path: None,
            branch: None,
            current_task: None,
            session_name: None,
            window_index: None,
            pane_index: None,
            ai_cli: None,
            ai_bootstrapped: false,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn new_paned(
        id: String,
        role: Role,
        working_dir: String,
        session_name: String,
        window_index: usize,
        pane_index: usize,
        ai_cli: Option<AICli>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            role,
            status: AgentStatus::Idle,
            tmux_session: Some(session_name.clone()),
            working_dir,
            worktree_path: None,
            branch: None,
            current_task: None,
            session_name: Some(session_name),
            window_index: Some(window_index),
            pane_index: Some(pane_index),
            ai_cli,
            ai_bootstrapped: false,
            created_at: now,
            last_activity: now,
        }
    }

    /// The `(session_name, window_index, pane_index)` slot identity used to
    /// enforce the one-agent-per-pane invariant. `None` for Owners.
    pub fn slot(&self) -> Option<(&str, usize, usize)> {
        match (&self.session_name, self.window_index, self.pane_index) {
            (Some(s), Some(w), Some(p)) => Some((s.as_str(), w, p)),
            _ => None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_has_no_slot() {
        let owner = Agent::new_owner("owner-1".into(), "/repo".into());
        assert!(owner.slot().is_none());
        assert_eq!(owner.role, Role::Owner);
    }

    #[test]
    fn paned_agent_reports_its_slot() {
        let worker = Agent::new_paned(
            "w1".into(),
            Role::Worker,
            "/repo".into(),
            "proj".into(),
            0,
            1,
            Some(AICli::Claude),
        );
        assert_eq!(worker.slot(), Some(("proj", 0, 1)));
    }
}
