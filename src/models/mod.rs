//! Shared entity types persisted by the stores and passed between managers.

mod agent;
mod cost;
mod memory;
mod message;
mod scheduled_task;
mod task;

pub use agent::{Agent, AgentStatus, Role};
pub use cost::{CostCall, CostSource};
pub use memory::MemoryEntry;
pub use message::{Message, MessagePriority, MessageType};
pub use scheduled_task::ScheduledTask;
pub use task::{Task, TaskStatus};

/// CLI backends a Worker (or Admin) may be bootstrapped against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AICli {
    Claude,
    Codex,
    Gemini,
    Cursor,
}

impl AICli {
    pub fn as_str(&self) -> &'static str {
        match self {
            AICli::Claude => "claude",
            AICli::Codex => "codex",
            AICli::Gemini => "gemini",
            AICli::Cursor => "cursor",
        }
    }
}

impl std::str::FromStr for AICli {
    type Err = crate::error::FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Ok(AICli::Claude),
            "codex" => Ok(AICli::Codex),
            "gemini" => Ok(AICli::Gemini),
            "cursor" => Ok(AICli::Cursor),
            other => Err(crate::error::FleetError::InvalidConfig(format!(
                "unknown AI CLI '{other}'"
            ))),
        }
    }
}

/// Sanitize a user-supplied string for safe use as a path segment.
///
/// Mirrors the forbidden-character set and fallback used throughout the
/// file stores (IPC, memory, dashboard task files): `<>:"/\|?*` are
/// replaced with `_`, leading/trailing spaces and dots are trimmed, and an
/// empty result falls back to `fallback`.
pub fn sanitize_filename(value: &str, fallback: &str) -> String {
    let mut safe: String = value
        .chars()
        .map(|c| if "<>:\"/\\|?*".contains(c) { '_' } else { c })
        .collect();
    safe = safe.trim_matches(|c: char| c == ' ' || c == '.').to_string();
    if safe.is_empty() {
        fallback.to_string()
    } else {
        safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_disallowed_characters() {
        assert_eq!(sanitize_filename("a/b:c*d", "entry"), "a_b_c_d");
    }

    #[test]
    fn sanitize_empty_falls_back() {
        assert_eq!(sanitize_filename("   ...  ", "entry"), "entry");
        assert_eq!(sanitize_filename("", "message"), "message");
    }

    #[test]
    fn ai_cli_roundtrips_through_str() {
        assert_eq!("codex".parse::<AICli>().unwrap().as_str(), "codex");
        assert!("nonsense".parse::<AICli>().is_err());
    }
}
