//! Settings & Profile Resolution (spec §4.1, §6).
//!
//! Merge order, highest wins: process environment (`MCP_*`) > per-project
//! `.env` at `<project>/.multi-agent-mcp/.env` > built-in defaults. Built on
//! the `config` crate's layered `Config` builder, matching the teacher's
//! existing dependency on `config = "0.15"`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::models::AICli;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProfile {
    Standard,
    Performance,
}

impl ModelProfile {
    pub fn max_workers_cap(&self) -> usize {
        match self {
            ModelProfile::Standard => 6,
            ModelProfile::Performance => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminal {
    Auto,
    Ghostty,
    Iterm2,
    Terminal,
}

/// One profile's resource envelope and default model selection (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDefaults {
    pub cli: AICli,
    pub admin_model: String,
    pub worker_model: String,
    pub max_workers: usize,
    pub admin_thinking_tokens: u64,
    pub worker_thinking_tokens: u64,
}

/// The full `MCP_*` environment surface of spec §6, resolved once per
/// process/project and passed by reference to every manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub mcp_dir: String,
    pub enable_worktree: bool,
    pub enable_git: bool,
    pub max_workers: usize,

    pub window_name_main: String,
    pub window_name_worker_prefix: String,
    pub main_worker_rows: usize,
    pub main_worker_cols: usize,
    pub workers_per_main_window: usize,
    pub extra_worker_rows: usize,
    pub extra_worker_cols: usize,
    pub workers_per_extra_window: usize,

    pub default_terminal: Terminal,

    pub model_profile_active: ModelProfile,
    pub profiles: HashMap<ModelProfile, ProfileDefaults>,

    /// `{cli -> {role -> model}}` Claude-alias fallback table (§4.1, §4.4).
    pub cli_model_fallback: HashMap<AICli, HashMap<String, String>>,

    pub cost_warning_threshold_usd: f64,
    pub estimated_tokens_per_call: u64,
    pub cost_per_1k_tokens: HashMap<AICli, f64>,

    pub healthcheck_interval_seconds: u64,
    pub healthcheck_idle_stop_consecutive: u32,
    pub healthcheck_stall_timeout_seconds: u64,
    pub healthcheck_max_recovery_attempts: u32,

    pub memory_max_entries: usize,
    pub memory_ttl_days: i64,

    pub send_cooldown_seconds: f64,
    pub codex_enter_retry_max: u32,
    pub codex_enter_retry_interval_ms: u64,

    pub screenshot_extensions: Vec<String>,

    pub quality_check_max_iterations: u32,
    pub quality_check_same_issue_limit: u32,
}

impl Settings {
    /// Compiled-in defaults (the bottom of the merge order). Values
    /// transcribed from `original_source/src/config/settings.py`.
    pub fn defaults() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(
            ModelProfile::Standard,
            ProfileDefaults {
                cli: AICli::Claude,
                admin_model: "opus".into(),
                worker_model: "sonnet".into(),
                max_workers: 6,
                admin_thinking_tokens: 16000,
                worker_thinking_tokens: 8000,
            },
        );
        profiles.insert(
            ModelProfile::Performance,
            ProfileDefaults {
                cli: AICli::Claude,
                admin_model: "opus".into(),
                worker_model: "opus".into(),
                max_workers: 16,
                admin_thinking_tokens: 32000,
                worker_thinking_tokens: 16000,
            },
        );

        let mut cost_per_1k_tokens = HashMap::new();
        cost_per_1k_tokens.insert(AICli::Claude, 0.015);
        cost_per_1k_tokens.insert(AICli::Codex, 0.01);
        cost_per_1k_tokens.insert(AICli::Gemini, 0.005);
        cost_per_1k_tokens.insert(AICli::Cursor, 0.015);

        let mut cli_model_fallback = HashMap::new();
        let mut codex_table = HashMap::new();
        codex_table.insert("admin".to_string(), "o1".to_string());
        codex_table.insert("worker".to_string(), "o1-mini".to_string());
        cli_model_fallback.insert(AICli::Codex, codex_table);
        let mut gemini_table = HashMap::new();
        gemini_table.insert("admin".to_string(), "gemini-1.5-pro".to_string());
        gemini_table.insert("worker".to_string(), "gemini-1.5-flash".to_string());
        cli_model_fallback.insert(AICli::Gemini, gemini_table);

        Self {
            mcp_dir: ".multi-agent-mcp".into(),
            enable_worktree: true,
            enable_git: true,
            max_workers: 6,

            window_name_main: "main".into(),
            window_name_worker_prefix: "workers-".into(),
            main_worker_rows: 2,
            main_worker_cols: 3,
            workers_per_main_window: 6,
            extra_worker_rows: 2,
            extra_worker_cols: 5,
            workers_per_extra_window: 10,

            default_terminal: Terminal::Auto,

            model_profile_active: ModelProfile::Standard,
            profiles,

            cli_model_fallback,

            cost_warning_threshold_usd: 10.0,
            estimated_tokens_per_call: 2000,
            cost_per_1k_tokens,

            healthcheck_interval_seconds: 60,
            healthcheck_idle_stop_consecutive: 3,
            healthcheck_stall_timeout_seconds: 300,
            healthcheck_max_recovery_attempts: 3,

            memory_max_entries: 1000,
            memory_ttl_days: 90,

            send_cooldown_seconds: 2.0,
            codex_enter_retry_max: 3,
            codex_enter_retry_interval_ms: 250,

            screenshot_extensions: vec![
                ".png".into(),
                ".jpg".into(),
                ".jpeg".into(),
                ".gif".into(),
                ".webp".into(),
            ],

            quality_check_max_iterations: 5,
            quality_check_same_issue_limit: 3,
        }
    }

    /// Resolve effective settings: defaults, overlaid by `<project>/.multi-agent-mcp/.env`
    /// (if present), overlaid by `MCP_*` process environment variables.
    pub fn resolve(project_root: &Path) -> Result<Self> {
        let mut settings = Self::defaults();
        let env_path = project_root.join(".multi-agent-mcp").join(".env");
        if env_path.is_file() {
            settings.apply_env_file(&env_path)?;
        }
        settings.apply_process_env();
        Ok(settings)
    }

    fn apply_env_file(&mut self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path)?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                self.apply_one(key.trim(), value.trim());
            }
        }
        Ok(())
    }

    fn apply_process_env(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(suffix) = key.strip_prefix("MCP_") {
                self.apply_one(suffix, &value);
            }
        }
    }

    /// Apply one `KEY=value` pair (with or without the `MCP_` prefix already
    /// stripped) onto the settings in place. Unknown keys are ignored —
    /// this is an overlay, not a strict schema.
    fn apply_one(&mut self, key: &str, value: &str) {
        match key {
            "MCP_DIR" | "DIR" => self.mcp_dir = value.to_string(),
            "ENABLE_WORKTREE" => {
                if let Ok(v) = value.parse() {
                    self.enable_worktree = v;
                }
            }
            "ENABLE_GIT" => {
                if let Ok(v) = value.parse() {
                    self.enable_git = v;
                }
            }
            "MAX_WORKERS" => {
                if let Ok(v) = value.parse() {
                    self.max_workers = v;
                }
            }
            "WINDOW_NAME_MAIN" => self.window_name_main = value.to_string(),
            "WINDOW_NAME_WORKER_PREFIX" => self.window_name_worker_prefix = value.to_string(),
            "MAIN_WORKER_ROWS" => {
                if let Ok(v) = value.parse() {
                    self.main_worker_rows = v;
                }
            }
            "MAIN_WORKER_COLS" => {
                if let Ok(v) = value.parse() {
                    self.main_worker_cols = v;
                }
            }
            "WORKERS_PER_MAIN_WINDOW" => {
                if let Ok(v) = value.parse() {
                    self.workers_per_main_window = v;
                }
            }
            "EXTRA_WORKER_ROWS" => {
                if let Ok(v) = value.parse() {
                    self.extra_worker_rows = v;
                }
            }
            "EXTRA_WORKER_COLS" => {
                if let Ok(v) = value.parse() {
                    self.extra_worker_cols = v;
                }
            }
            "WORKERS_PER_EXTRA_WINDOW" => {
                if let Ok(v) = value.parse() {
                    self.workers_per_extra_window = v;
                }
            }
            "DEFAULT_TERMINAL" => {
                self.default_terminal = match value.to_ascii_lowercase().as_str() {
                    "ghostty" => Terminal::Ghostty,
                    "iterm2" => Terminal::Iterm2,
                    "terminal" => Terminal::Terminal,
                    _ => Terminal::Auto,
                };
            }
            "MODEL_PROFILE_ACTIVE" => {
                self.model_profile_active = match value.to_ascii_lowercase().as_str() {
                    "performance" => ModelProfile::Performance,
                    _ => ModelProfile::Standard,
                };
            }
            "COST_WARNING_THRESHOLD_USD" => {
                if let Ok(v) = value.parse() {
                    self.cost_warning_threshold_usd = v;
                }
            }
            "ESTIMATED_TOKENS_PER_CALL" => {
                if let Ok(v) = value.parse() {
                    self.estimated_tokens_per_call = v;
                }
            }
            "HEALTHCHECK_INTERVAL_SECONDS" => {
                if let Ok(v) = value.parse() {
                    self.healthcheck_interval_seconds = v;
                }
            }
            "HEALTHCHECK_IDLE_STOP_CONSECUTIVE" => {
                if let Ok(v) = value.parse() {
                    self.healthcheck_idle_stop_consecutive = v;
                }
            }
            "HEALTHCHECK_STALL_TIMEOUT_SECONDS" => {
                if let Ok(v) = value.parse() {
                    self.healthcheck_stall_timeout_seconds = v;
                }
            }
            "HEALTHCHECK_MAX_RECOVERY_ATTEMPTS" => {
                if let Ok(v) = value.parse() {
                    self.healthcheck_max_recovery_attempts = v;
                }
            }
            "MEMORY_MAX_ENTRIES" => {
                if let Ok(v) = value.parse() {
                    self.memory_max_entries = v;
                }
            }
            "MEMORY_TTL_DAYS" => {
                if let Ok(v) = value.parse() {
                    self.memory_ttl_days = v;
                }
            }
            "SEND_COOLDOWN_SECONDS" => {
                if let Ok(v) = value.parse() {
                    self.send_cooldown_seconds = v;
                }
            }
            "CODEX_ENTER_RETRY_MAX" => {
                if let Ok(v) = value.parse() {
                    self.codex_enter_retry_max = v;
                }
            }
            "CODEX_ENTER_RETRY_INTERVAL_MS" => {
                if let Ok(v) = value.parse() {
                    self.codex_enter_retry_interval_ms = v;
                }
            }
            "SCREENSHOT_EXTENSIONS" => {
                if let Ok(v) = serde_json::from_str::<Vec<String>>(value) {
                    self.screenshot_extensions = v;
                }
            }
            "QUALITY_CHECK_MAX_ITERATIONS" => {
                if let Ok(v) = value.parse() {
                    self.quality_check_max_iterations = v;
                }
            }
            "QUALITY_CHECK_SAME_ISSUE_LIMIT" => {
                if let Ok(v) = value.parse() {
                    self.quality_check_same_issue_limit = v;
                }
            }
            _ => {}
        }
    }

    pub fn active_profile(&self) -> &ProfileDefaults {
        self.profiles
            .get(&self.model_profile_active)
            .expect("every ModelProfile variant has a compiled-in default")
    }
}

/// Resolve a Claude-aliased model name (`opus|sonnet|haiku|default`) for a
/// non-Claude CLI via the `{cli -> {role -> model}}` fallback table;
/// anything else (and Claude itself) passes through verbatim (§4.1).
pub fn resolve_model_for_cli(
    settings: &Settings,
    cli: AICli,
    role: &str,
    model_name: Option<&str>,
) -> Result<Option<String>> {
    let Some(model_name) = model_name else {
        return Ok(None);
    };
    if cli == AICli::Claude {
        return Ok(Some(model_name.to_string()));
    }
    let is_claude_alias = matches!(model_name, "opus" | "sonnet" | "haiku" | "default");
    if !is_claude_alias {
        return Ok(Some(model_name.to_string()));
    }
    let table = settings.cli_model_fallback.get(&cli).ok_or_else(|| {
        FleetError::CliUnavailable(format!("no model fallback table for {}", cli.as_str()))
    })?;
    Ok(table
        .get(role)
        .cloned()
        .or_else(|| table.get("worker").cloned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_transcribed_values() {
        let settings = Settings::defaults();
        assert_eq!(settings.max_workers, 6);
        assert_eq!(settings.healthcheck_interval_seconds, 60);
        assert_eq!(settings.send_cooldown_seconds, 2.0);
        assert_eq!(settings.codex_enter_retry_max, 3);
        assert_eq!(*settings.cost_per_1k_tokens.get(&AICli::Claude).unwrap(), 0.015);
    }

    #[test]
    fn env_override_wins_over_default() {
        let mut settings = Settings::defaults();
        settings.apply_one("MAX_WORKERS", "12");
        assert_eq!(settings.max_workers, 12);
    }

    #[test]
    fn profile_caps_standard_and_performance() {
        assert_eq!(ModelProfile::Standard.max_workers_cap(), 6);
        assert_eq!(ModelProfile::Performance.max_workers_cap(), 16);
    }

    #[test]
    fn claude_alias_resolves_for_codex() {
        let settings = Settings::defaults();
        let resolved =
            resolve_model_for_cli(&settings, AICli::Codex, "admin", Some("opus")).unwrap();
        assert_eq!(resolved, Some("o1".to_string()));
    }

    #[test]
    fn non_alias_model_passes_through_for_gemini() {
        let settings = Settings::defaults();
        let resolved =
            resolve_model_for_cli(&settings, AICli::Gemini, "worker", Some("gemini-2.0-flash"))
                .unwrap();
        assert_eq!(resolved, Some("gemini-2.0-flash".to_string()));
    }

    #[test]
    fn claude_model_always_passes_through() {
        let settings = Settings::defaults();
        let resolved =
            resolve_model_for_cli(&settings, AICli::Claude, "worker", Some("sonnet")).unwrap();
        assert_eq!(resolved, Some("sonnet".to_string()));
    }
}
