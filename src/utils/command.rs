//! Subprocess probing shared by the CLI Manager and worktree backends.

use tokio::process::Command;

/// Whether `cmd --version` succeeds, the same self-check style the
/// teacher's `TmuxClient::new` uses for the `tmux` binary (§4.4 CLI
/// detection).
pub async fn command_exists(cmd: &str) -> bool {
    Command::new(cmd)
        .arg("--version")
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nonexistent_binary_is_not_available() {
        assert!(!command_exists("definitely-not-a-real-binary-xyz").await);
    }
}
