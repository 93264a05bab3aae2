//! Terminal Multiplexer Driver (spec §4.3, §5, §6).
//!
//! Wraps the `tmux` binary via `tokio::process::Command`. All pane writes
//! serialize through one process-wide mutex with an inter-send cooldown
//! (§5 "Rate limits"), and the main-window layout follows the exact split
//! sequence of `original_source/src/managers/tmux_workspace_mixin.py`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{FleetError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmuxWindowInfo {
    pub index: usize,
    pub name: String,
}

/// Characters tmux session names must be restricted to before they can be
/// safely interpolated into `tmux attach -t -- <name>` or a launcher script
/// (§4.3, §6 "Session naming").
pub fn validate_session_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FleetError::SessionConflict("session name cannot be empty".into()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(FleetError::SessionConflict(format!(
            "session name '{name}' contains characters outside [A-Za-z0-9._-]"
        )));
    }
    Ok(())
}

/// The exact split sequence for the main window (§4.3): one 40/60 split,
/// two more horizontal splits carving the right side into three columns,
/// then a vertical split per worker column walked in reverse (3, 2, 1) so
/// earlier splits' pane indices never shift underneath a later command.
pub fn main_window_split_plan() -> Vec<Vec<String>> {
    vec![
        vec!["split-window".into(), "-h".into(), "-p".into(), "60".into()],
        vec![
            "split-window".into(),
            "-h".into(),
            "-t".into(),
            ".1".into(),
            "-p".into(),
            "67".into(),
        ],
        vec![
            "split-window".into(),
            "-h".into(),
            "-t".into(),
            ".2".into(),
            "-p".into(),
            "50".into(),
        ],
        vec!["split-window".into(), "-v".into(), "-t".into(), ".3".into()],
        vec!["split-window".into(), "-v".into(), "-t".into(), ".2".into()],
        vec!["split-window".into(), "-v".into(), "-t".into(), ".1".into()],
    ]
}

/// Generic `rows × cols` grid splitter for extra worker windows (§4.3):
/// `cols - 1` horizontal splits, an `even-horizontal` re-layout, then
/// `rows - 1` vertical splits per column walked in reverse column order.
pub fn extra_window_split_plan(rows: usize, cols: usize) -> Vec<Vec<String>> {
    let mut plan = Vec::new();
    for _ in 0..cols.saturating_sub(1) {
        plan.push(vec!["split-window".to_string(), "-h".to_string()]);
    }
    if cols > 1 {
        plan.push(vec!["select-layout".to_string(), "even-horizontal".to_string()]);
    }
    for col in (0..cols).rev() {
        for _ in 0..rows.saturating_sub(1) {
            plan.push(vec![
                "split-window".to_string(),
                "-v".to_string(),
                "-t".to_string(),
                format!(".{col}"),
            ]);
        }
    }
    plan
}

/// Worker number (1-based) ↔ `(window_index, pane_index)` mapping (§4.6
/// step 10): window 0 panes 1..6 are workers 1..6; window `w ≥ 1` pane `p`
/// is worker `6 + (w-1)*workers_per_extra_window + p + 1`.
pub fn worker_number_for_slot(window_index: usize, pane_index: usize, workers_per_extra_window: usize) -> usize {
    if window_index == 0 {
        pane_index
    } else {
        6 + (window_index - 1) * workers_per_extra_window + pane_index + 1
    }
}

/// Whether a Codex pane capture still shows an unconfirmed prompt: either
/// a line starting `›` that echoes the sent command, or the "tab to queue
/// message" hint (§4.3, S7).
pub fn pane_has_pending_codex_prompt(captured: &str, command: &str) -> bool {
    captured.lines().rev().take(5).any(|line| {
        let trimmed = line.trim();
        (trimmed.starts_with('›') && trimmed.contains(command))
            || trimmed.to_ascii_lowercase().contains("tab to queue message")
    })
}

pub struct TmuxDriverConfig {
    pub send_cooldown: Duration,
    pub codex_enter_retry_max: u32,
    pub codex_enter_retry_interval: Duration,
}

/// Drives the `tmux` binary. The send mutex is process-wide (not per-pane)
/// so multi-command sequences (`cd` + instruction) never interleave with a
/// concurrent send to a different pane (§5).
pub struct TmuxDriver {
    config: TmuxDriverConfig,
    send_gate: Mutex<Instant>,
}

impl TmuxDriver {
    pub fn new(config: TmuxDriverConfig) -> Self {
        Self {
            config,
            send_gate: Mutex::new(Instant::now() - Duration::from_secs(3600)),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        let output = Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|e| FleetError::Internal(format!("tmux exec failed: {e}")))?;
        if !output.status.success() {
            return Err(FleetError::Internal(format!(
                "tmux {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    pub async fn session_exists(&self, name: &str) -> Result<bool> {
        let output = Command::new("tmux")
            .args(["has-session", "-t", name])
            .output()
            .await
            .map_err(|e| FleetError::Internal(format!("tmux exec failed: {e}")))?;
        Ok(output.status.success())
    }

    pub async fn create_session(&self, name: &str, working_dir: &str) -> Result<()> {
        validate_session_name(name)?;
        if self.session_exists(name).await? {
            return Err(FleetError::SessionConflict(format!("session '{name}' already exists")));
        }
        self.run(&Self::args(&["new-session", "-d", "-s", name, "-c", working_dir, "-n", "main"]))
            .await?;
        Ok(())
    }

    /// Create the main session and lay out window 0 per
    /// [`main_window_split_plan`], then normalize window indexing (§4.3
    /// "Index normalization"). `pane-base-index 0` is set *before* the split
    /// plan runs (not after) so the `.0`-based pane targets baked into the
    /// split plan itself are valid regardless of the user's tmux config.
    pub async fn create_main_session(&self, name: &str, working_dir: &str) -> Result<()> {
        self.create_session(name, working_dir).await?;
        self.run(&Self::args(&["set-option", "-t", name, "pane-base-index", "0"])).await?;
        for step in main_window_split_plan() {
            self.run(&qualify_pane_targets(name, 0, &step)).await?;
        }
        self.normalize_indices(name).await
    }

    pub async fn add_extra_worker_window(
        &self,
        name: &str,
        window_name: &str,
        working_dir: &str,
        rows: usize,
        cols: usize,
    ) -> Result<()> {
        self.run(&Self::args(&["new-window", "-t", name, "-n", window_name, "-c", working_dir]))
            .await?;
        self.run(&Self::args(&["set-option", "-t", &format!("{name}:{window_name}"), "pane-base-index", "0"]))
            .await?;
        let window_target = format!("{name}:{window_name}");
        for step in extra_window_split_plan(rows, cols) {
            let args = qualify_pane_targets_named(&window_target, &step);
            self.run(&args).await?;
        }
        Ok(())
    }

    /// `move-window -r` renumbers windows to start at 0 regardless of the
    /// user's `base-index`; `pane-base-index 0` is set per window so pane
    /// index math holds across configurations.
    async fn normalize_indices(&self, name: &str) -> Result<()> {
        self.run(&Self::args(&["move-window", "-r", "-s", name, "-t", name])).await?;
        self.run(&Self::args(&["set-option", "-t", name, "pane-base-index", "0"])).await?;
        Ok(())
    }

    pub async fn kill_session(&self, name: &str) -> Result<()> {
        if !self.session_exists(name).await? {
            return Ok(());
        }
        self.run(&Self::args(&["kill-session", "-t", name])).await?;
        Ok(())
    }

    /// Best-effort: tolerate individual sessions already being gone.
    pub async fn cleanup_sessions(&self, names: &[String]) -> Vec<(String, Result<()>)> {
        let mut results = Vec::new();
        for name in names {
            results.push((name.clone(), self.kill_session(name).await));
        }
        results
    }

    pub async fn rename_session(&self, old: &str, new: &str) -> Result<()> {
        validate_session_name(new)?;
        self.run(&Self::args(&["rename-session", "-t", old, new])).await?;
        Ok(())
    }

    pub async fn list_windows(&self, name: &str) -> Result<Vec<TmuxWindowInfo>> {
        let output = self
            .run(&Self::args(&[
                "list-windows",
                "-t",
                name,
                "-F",
                "#{window_index}|#{window_name}",
            ]))
            .await?;
        Ok(output
            .lines()
            .filter_map(|line| {
                let (idx, win_name) = line.split_once('|')?;
                Some(TmuxWindowInfo {
                    index: idx.parse().ok()?,
                    name: win_name.to_string(),
                })
            })
            .collect())
    }

    fn pane_target(session: &str, window_index: usize, pane_index: usize) -> String {
        format!("{session}:{window_index}.{pane_index}")
    }

    /// Raw send, no rate limiting — used internally by
    /// [`send_with_rate_limit_to_pane`] and by callers that already hold
    /// the send gate (e.g. the Codex confirm retry loop).
    pub async fn send_keys_to_pane(
        &self,
        session: &str,
        window_index: usize,
        pane_index: usize,
        keys: &str,
        confirm_enter: bool,
    ) -> Result<()> {
        let target = Self::pane_target(session, window_index, pane_index);
        if confirm_enter {
            self.run(&Self::args(&["send-keys", "-t", &target, keys, "Enter"])).await?;
        } else {
            self.run(&Self::args(&["send-keys", "-t", &target, keys])).await?;
        }
        Ok(())
    }

    /// Serializes through the process-wide send gate with
    /// `send_cooldown_seconds` between consecutive sends; optionally clears
    /// pane input with `C-u` first (never `C-c`, which redraws the shell).
    pub async fn send_with_rate_limit_to_pane(
        &self,
        session: &str,
        window_index: usize,
        pane_index: usize,
        keys: &str,
        clear_first: bool,
    ) -> Result<()> {
        let mut last_send = self.send_gate.lock().await;
        let elapsed = last_send.elapsed();
        if elapsed < self.config.send_cooldown {
            tokio::time::sleep(self.config.send_cooldown - elapsed).await;
        }
        let target = Self::pane_target(session, window_index, pane_index);
        if clear_first {
            self.run(&Self::args(&["send-keys", "-t", &target, "C-u"])).await?;
        }
        self.run(&Self::args(&["send-keys", "-t", &target, keys, "Enter"])).await?;
        *last_send = Instant::now();
        Ok(())
    }

    /// Send-then-confirm for Codex panes (§4.3, S7): re-capture after the
    /// send and re-issue Enter while a pending prompt line is detected, up
    /// to `codex_enter_retry_max` times at `codex_enter_retry_interval`.
    pub async fn send_and_confirm_to_pane(
        &self,
        session: &str,
        window_index: usize,
        pane_index: usize,
        command: &str,
        confirm_codex_prompt: bool,
    ) -> Result<bool> {
        self.send_with_rate_limit_to_pane(session, window_index, pane_index, command, true)
            .await?;
        if !confirm_codex_prompt {
            return Ok(true);
        }
        for _ in 0..self.config.codex_enter_retry_max {
            let captured = self.capture_pane_by_index(session, window_index, pane_index).await?;
            if !pane_has_pending_codex_prompt(&captured, command) {
                return Ok(true);
            }
            tokio::time::sleep(self.config.codex_enter_retry_interval).await;
            self.send_keys_to_pane(session, window_index, pane_index, "", true).await?;
        }
        let captured = self.capture_pane_by_index(session, window_index, pane_index).await?;
        Ok(!pane_has_pending_codex_prompt(&captured, command))
    }

    pub async fn capture_pane_by_index(
        &self,
        session: &str,
        window_index: usize,
        pane_index: usize,
    ) -> Result<String> {
        let target = Self::pane_target(session, window_index, pane_index);
        self.run(&Self::args(&["capture-pane", "-t", &target, "-p"])).await
    }

    pub async fn set_pane_title(
        &self,
        session: &str,
        window_index: usize,
        pane_index: usize,
        title: &str,
    ) -> Result<()> {
        let target = Self::pane_target(session, window_index, pane_index);
        self.run(&Self::args(&["select-pane", "-t", &target, "-T", title])).await?;
        Ok(())
    }

    pub async fn get_pane_current_command(
        &self,
        session: &str,
        window_index: usize,
        pane_index: usize,
    ) -> Result<String> {
        let target = Self::pane_target(session, window_index, pane_index);
        let output = self
            .run(&Self::args(&["display-message", "-p", "-t", &target, "#{pane_current_command}"]))
            .await?;
        Ok(output.trim().to_string())
    }

    /// `tmux attach -t -- <name>` — the `--` guards against a session name
    /// that could otherwise be parsed as a flag (§4.3, §6).
    pub fn attach_command(name: &str) -> Result<String> {
        validate_session_name(name)?;
        Ok(format!("tmux attach -t -- {name}"))
    }
}

/// Turn a bare split-plan step (pane targets like `.1` relative to the
/// current window) into a fully-qualified tmux argv: `.N` tokens become
/// `<session>:<window>.N`, and a step with no `-t` at all gets one
/// inserted targeting pane 0 of the window.
fn qualify_pane_targets(session: &str, window_index: usize, step: &[String]) -> Vec<String> {
    qualify_pane_targets_named(&format!("{session}:{window_index}"), step)
}

/// As [`qualify_pane_targets`] but given an already-built `session:window`
/// target string (used for extra worker windows addressed by name).
fn qualify_pane_targets_named(window_target: &str, step: &[String]) -> Vec<String> {
    let mut out: Vec<String> = step
        .iter()
        .map(|token| {
            if let Some(pane) = token.strip_prefix('.') {
                format!("{window_target}.{pane}")
            } else {
                token.clone()
            }
        })
        .collect();
    if !step.iter().any(|t| t == "-t") {
        out.push("-t".to_string());
        out.push(window_target.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_name_rejects_disallowed_characters() {
        assert!(validate_session_name("my-project_1.2").is_ok());
        assert!(validate_session_name("bad session").is_err());
        assert!(validate_session_name("bad;rm -rf").is_err());
        assert!(validate_session_name("").is_err());
    }

    #[test]
    fn attach_command_uses_double_dash_separator() {
        assert_eq!(
            TmuxDriver::attach_command("my-proj").unwrap(),
            "tmux attach -t -- my-proj"
        );
        assert!(TmuxDriver::attach_command("bad name").is_err());
    }

    #[test]
    fn main_window_split_plan_has_six_steps() {
        let plan = main_window_split_plan();
        assert_eq!(plan.len(), 6);
        assert_eq!(plan[0][0], "split-window");
        assert!(plan[0].contains(&"60".to_string()));
    }

    #[test]
    fn extra_window_grid_counts_splits_for_two_by_three() {
        let plan = extra_window_split_plan(2, 3);
        let horizontal = plan.iter().filter(|s| s[1] == "-h").count();
        let vertical = plan.iter().filter(|s| s[1] == "-v").count();
        assert_eq!(horizontal, 2);
        assert_eq!(vertical, 3);
    }

    #[test]
    fn worker_number_mapping_matches_spec_formula() {
        assert_eq!(worker_number_for_slot(0, 1, 10), 1);
        assert_eq!(worker_number_for_slot(0, 6, 10), 6);
        assert_eq!(worker_number_for_slot(1, 0, 10), 7);
        assert_eq!(worker_number_for_slot(2, 3, 10), 24);
    }

    #[test]
    fn qualify_pane_targets_rewrites_dot_tokens_and_inserts_missing_target() {
        let step = vec!["split-window".to_string(), "-h".to_string(), "-p".to_string(), "60".to_string()];
        let qualified = qualify_pane_targets("proj", 0, &step);
        assert_eq!(qualified, vec!["split-window", "-h", "-p", "60", "-t", "proj:0.0"]);

        let step2 = vec![
            "split-window".to_string(),
            "-h".to_string(),
            "-t".to_string(),
            ".1".to_string(),
            "-p".to_string(),
            "67".to_string(),
        ];
        let qualified2 = qualify_pane_targets("proj", 0, &step2);
        assert_eq!(qualified2, vec!["split-window", "-h", "-t", "proj:0.1", "-p", "67"]);
    }

    #[test]
    fn codex_pending_prompt_detection() {
        let captured = "$ echo hello\n› echo hello\n";
        assert!(pane_has_pending_codex_prompt(captured, "echo hello"));
        assert!(!pane_has_pending_codex_prompt("$ echo hello\nhello\n", "echo hello"));
        assert!(pane_has_pending_codex_prompt("tab to queue message", "echo hello"));
    }
}
