use thiserror::Error;

/// Error kinds surfaced to tool callers. Every variant maps to a stable
/// `error` string in the `{success, error, message}` tool response shape;
/// never an implementation-internal string.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("role_denied: {0}")]
    RoleDenied(String),

    #[error("invalid_config: {0}")]
    InvalidConfig(String),

    #[error("not_a_git_repo: {0}")]
    NotAGitRepo(String),

    #[error("capacity_exceeded: current={current} requested={requested} available={available}")]
    CapacityExceeded {
        current: usize,
        requested: usize,
        available: usize,
    },

    #[error("slot_unavailable")]
    SlotUnavailable,

    #[error("session_conflict: {0}")]
    SessionConflict(String),

    #[error("worktree_failed: {0}")]
    WorktreeFailed(String),

    #[error("worktree_blocked: {0}")]
    WorktreeBlocked(String),

    #[error("cli_unavailable: {0}")]
    CliUnavailable(String),

    #[error("not_found: {kind} {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("already_exists: {0}")]
    AlreadyExists(String),

    #[error("pending_prompt")]
    PendingPrompt,

    #[error("internal:{0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl FleetError {
    /// The stable error code returned to tool callers.
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::RoleDenied(_) => "role_denied",
            FleetError::InvalidConfig(_) => "invalid_config",
            FleetError::NotAGitRepo(_) => "not_a_git_repo",
            FleetError::CapacityExceeded { .. } => "capacity_exceeded",
            FleetError::SlotUnavailable => "slot_unavailable",
            FleetError::SessionConflict(_) => "session_conflict",
            FleetError::WorktreeFailed(_) => "worktree_failed",
            FleetError::WorktreeBlocked(_) => "worktree_blocked",
            FleetError::CliUnavailable(_) => "cli_unavailable",
            FleetError::NotFound { .. } => "not_found",
            FleetError::AlreadyExists(_) => "already_exists",
            FleetError::PendingPrompt => "pending_prompt",
            FleetError::Internal(_) | FleetError::Io(_) | FleetError::Json(_) | FleetError::Yaml(_) => {
                "internal"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
