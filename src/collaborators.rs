//! External-collaborator interfaces (spec §9, "Non-goals"): template
//! rendering, persona detection, terminal launching, and notification
//! delivery are owned by systems outside this crate. Only the narrow
//! interface each exposes to the core is specified here, each with a
//! minimal in-crate implementation — enough to compile and test against,
//! never a stand-in for the real system.

use async_trait::async_trait;

use crate::error::Result;

/// `render(category, name, vars) → string` (spec §9).
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, category: &str, name: &str, vars: &serde_json::Map<String, serde_json::Value>) -> Result<String>;
}

/// A persona, detected from free text sent in a task instruction or IPC
/// message (spec §9 `detect(text) → persona`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persona {
    Reviewer,
    Implementer,
    Researcher,
    Unknown,
}

pub trait PersonaDetector: Send + Sync {
    fn detect(&self, text: &str) -> Persona;
}

/// `launch(script_path) → (bool, message)` (spec §9).
#[async_trait]
pub trait TerminalLauncher: Send + Sync {
    async fn launch(&self, script_path: &str) -> (bool, String);
}

/// `notify(stop_reason, details)` (spec §9); used by the healthcheck
/// daemon's auto-stop path and by teardown.
pub trait Notifier: Send + Sync {
    fn notify(&self, stop_reason: &str, details: &str);
}

/// The 7-section task instruction template named throughout §4.6/§4.9:
/// title, objective, context, constraints, steps, acceptance criteria,
/// reporting instructions. Renders to plain Markdown with no external
/// template engine, since the section set is fixed and small.
pub struct DefaultTemplateRenderer;

#[async_trait]
impl TemplateRenderer for DefaultTemplateRenderer {
    fn render(
        &self,
        category: &str,
        name: &str,
        vars: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let get = |key: &str| -> String {
            vars.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        Ok(format!(
            "# {name}\n\n\
             ## Objective\n{objective}\n\n\
             ## Context\n{context}\n\n\
             ## Constraints\n{constraints}\n\n\
             ## Steps\n{steps}\n\n\
             ## Acceptance Criteria\n{acceptance}\n\n\
             ## Reporting\n{reporting}\n",
            name = name,
            objective = get("objective"),
            context = get("context"),
            constraints = get("constraints"),
            steps = get("steps"),
            acceptance = get("acceptance"),
            reporting = get("reporting"),
        ))
        .map(|body| if category.is_empty() { body } else { format!("<!-- {category} -->\n{body}") })
    }
}

/// Keyword match against a fixed persona vocabulary; real persona
/// detection (tone, role inference) is out of scope for the core.
pub struct KeywordPersonaDetector;

impl PersonaDetector for KeywordPersonaDetector {
    fn detect(&self, text: &str) -> Persona {
        let lower = text.to_ascii_lowercase();
        if lower.contains("review") {
            Persona::Reviewer
        } else if lower.contains("implement") || lower.contains("build") {
            Persona::Implementer
        } else if lower.contains("research") || lower.contains("investigate") {
            Persona::Researcher
        } else {
            Persona::Unknown
        }
    }
}

/// No-op launcher: recording it was asked for, never actually shelling out
/// to a terminal emulator. Real launch scripts are per-OS external tools.
pub struct NoopTerminalLauncher;

#[async_trait]
impl TerminalLauncher for NoopTerminalLauncher {
    async fn launch(&self, script_path: &str) -> (bool, String) {
        (false, format!("terminal launch not implemented: {script_path}"))
    }
}

/// Logs via `tracing` instead of delivering anywhere; a real `Notifier`
/// (desktop notification, webhook) lives outside the crate.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, stop_reason: &str, details: &str) {
        tracing::info!(stop_reason, details, "notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_named_sections() {
        let mut vars = serde_json::Map::new();
        vars.insert("objective".into(), "do the thing".into());
        let rendered = DefaultTemplateRenderer
            .render("task", "Worker 1", &vars)
            .unwrap();
        assert!(rendered.contains("## Objective\ndo the thing"));
        assert!(rendered.contains("## Reporting"));
    }

    #[test]
    fn detects_persona_by_keyword() {
        let detector = KeywordPersonaDetector;
        assert_eq!(detector.detect("please review this PR"), Persona::Reviewer);
        assert_eq!(detector.detect("implement the new endpoint"), Persona::Implementer);
        assert_eq!(detector.detect("???"), Persona::Unknown);
    }

    #[tokio::test]
    async fn noop_launcher_reports_failure() {
        let (ok, msg) = NoopTerminalLauncher.launch("/tmp/x.sh").await;
        assert!(!ok);
        assert!(msg.contains("/tmp/x.sh"));
    }
}
