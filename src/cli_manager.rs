//! CLI Manager (spec §4.4): detects which AI CLIs are on PATH and builds
//! the shell command string dispatched into a worker's pane.
//!
//! Grounded in the teacher's `providers/claude_code.rs` env-var injection
//! style, adapted: here the builder returns a command *string* for
//! `tmux::send_keys`/`send_and_confirm_to_pane` rather than spawning a
//! child process directly, since the actual CLI process lives inside the
//! tmux pane, not under this process's control.

use crate::models::AICli;
use crate::utils::command::command_exists;

/// Which AI CLIs are currently reachable via PATH, probed with `<cli>
/// --version` (mirrors the teacher's own `TmuxClient::new` self-check).
pub async fn detect_available_clis() -> Vec<AICli> {
    let mut available = Vec::new();
    for cli in [AICli::Claude, AICli::Codex, AICli::Gemini, AICli::Cursor] {
        if command_exists(cli.as_str()).await {
            available.push(cli);
        }
    }
    available
}

pub async fn is_cli_available(cli: AICli) -> bool {
    command_exists(cli.as_str()).await
}

/// Shell-quote a single argument for embedding in a `sh -c`-style command
/// string (single-quote, escaping embedded single quotes POSIX-style).
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Build the stdin-dispatch shell command for one CLI (§4.4). `worktree_path`
/// defaults to the current directory (no `cd`) when absent.
#[allow(clippy::too_many_arguments)]
pub fn build_stdin_command(
    cli: AICli,
    task_file_path: &str,
    worktree_path: Option<&str>,
    model: Option<&str>,
    thinking_tokens: Option<u64>,
    project_root: Option<&str>,
    _role: Option<&str>,
) -> String {
    let cd_prefix = worktree_path
        .map(|wt| format!("cd {} && ", shell_quote(wt)))
        .unwrap_or_default();
    let task_file = shell_quote(task_file_path);

    match cli {
        AICli::Claude => {
            let mut env_vars = Vec::new();
            if let Some(tokens) = thinking_tokens {
                env_vars.push(format!("MAX_THINKING_TOKENS={tokens}"));
            }
            if let Some(root) = project_root {
                env_vars.push(format!("MCP_PROJECT_ROOT={}", shell_quote(root)));
            }
            let env_prefix = if env_vars.is_empty() {
                String::new()
            } else {
                format!("{} ", env_vars.join(" "))
            };
            let model_flag = model.map(|m| format!(" --model {}", shell_quote(m))).unwrap_or_default();
            format!(
                "{cd_prefix}{env_prefix}claude --dangerously-skip-permissions{model_flag} < {task_file}"
            )
        }
        AICli::Codex => {
            let model_flag = model.map(|m| format!(" --model {}", shell_quote(m))).unwrap_or_default();
            format!("{cd_prefix}codex exec{model_flag} - < {task_file}")
        }
        AICli::Gemini => {
            let model_flag = model.map(|m| format!(" --model {}", shell_quote(m))).unwrap_or_default();
            format!("{cd_prefix}gemini --yolo{model_flag} --prompt \"$(cat {task_file})\"")
        }
        AICli::Cursor => {
            let model_flag = model.map(|m| format!(" --model {}", shell_quote(m))).unwrap_or_default();
            format!("{cd_prefix}cursor-agent{model_flag} --print < {task_file}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_command_exports_thinking_tokens_even_when_zero() {
        let cmd = build_stdin_command(
            AICli::Claude,
            "/proj/tasks/a1.md",
            Some("/proj/.worktrees/x"),
            Some("opus"),
            Some(0),
            Some("/proj"),
            None,
        );
        assert!(cmd.contains("MAX_THINKING_TOKENS=0"));
        assert!(cmd.starts_with("cd '/proj/.worktrees/x' &&"));
        assert!(cmd.contains("--model 'opus'"));
        assert!(cmd.ends_with("< '/proj/tasks/a1.md'"));
    }

    #[test]
    fn codex_command_has_no_thinking_tokens() {
        let cmd = build_stdin_command(AICli::Codex, "/t.md", None, None, Some(5000), None, None);
        assert!(!cmd.contains("MAX_THINKING_TOKENS"));
        assert_eq!(cmd, "codex exec - < '/t.md'");
    }

    #[test]
    fn worktree_paths_with_spaces_are_shell_quoted() {
        let cmd = build_stdin_command(
            AICli::Claude,
            "/t.md",
            Some("/my project/wt"),
            None,
            None,
            None,
            None,
        );
        assert!(cmd.starts_with("cd '/my project/wt' &&"));
    }
}
