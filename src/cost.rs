//! Cost Capture (spec §4.13).
//!
//! Grounded in `original_source/src/tools/cost_capture.py::extract_claude_statusline_cost`:
//! scan a pane capture's lines in reverse for one of three Claude
//! status-line cost patterns, returning the first (i.e. most recent) line
//! that matches along with the dollar figure it carries. Deduplication
//! against the last 50 calls is `Dashboard::record_api_call`'s job, not
//! this module's — it only extracts a candidate.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{AICli, CostCall};

static STATUSLINE_PATTERNS: Lazy<[Regex; 3]> = Lazy::new(|| {
    [
        Regex::new(r"💰\s*\$\s*([0-9]+(?:\.[0-9]+)?)").unwrap(),
        Regex::new(r"(?i:cost)[^$\n]*\$\s*([0-9]+(?:\.[0-9]+)?)").unwrap(),
        Regex::new(r"\$\s*([0-9]+(?:\.[0-9]+)?)\s*(?i:cost)").unwrap(),
    ]
});

/// Scan `captured` bottom-up for a Claude status-line cost emission.
/// Patterns are tried in the fixed order above per line; the first line
/// (reading from the bottom) that matches any pattern wins, so a later
/// line always takes precedence over an earlier one (§4.13 "later lines
/// win").
pub fn extract_claude_statusline_cost(captured: &str) -> Option<(f64, String)> {
    for line in captured.lines().rev() {
        for pattern in STATUSLINE_PATTERNS.iter() {
            if let Some(caps) = pattern.captures(line) {
                if let Ok(value) = caps[1].parse::<f64>() {
                    return Some((value, line.trim().to_string()));
                }
            }
        }
    }
    None
}

/// Build the `CostCall` to hand to `Dashboard::record_api_call` from a
/// pane capture, or `None` for a non-Claude CLI or a capture with no cost
/// emission (§4.13 "Non-Claude CLIs return null").
pub fn build_actual_cost_call(
    ai_cli: AICli,
    agent_id: &str,
    captured: &str,
) -> Option<CostCall> {
    if ai_cli != AICli::Claude {
        return None;
    }
    let (cost_usd, status_line) = extract_claude_statusline_cost(captured)?;
    Some(CostCall::actual(ai_cli, agent_id.to_string(), status_line, cost_usd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_emoji_pattern() {
        let captured = "some output\n💰 $1.23\nmore output\n";
        let (cost, line) = extract_claude_statusline_cost(captured).unwrap();
        assert_eq!(cost, 1.23);
        assert_eq!(line, "💰 $1.23");
    }

    #[test]
    fn extracts_cost_prefixed_pattern() {
        let captured = "Cost so far: $4.50 this session\n";
        let (cost, _) = extract_claude_statusline_cost(captured).unwrap();
        assert_eq!(cost, 4.50);
    }

    #[test]
    fn extracts_cost_suffixed_pattern() {
        let captured = "$0.75 cost\n";
        let (cost, _) = extract_claude_statusline_cost(captured).unwrap();
        assert_eq!(cost, 0.75);
    }

    #[test]
    fn later_line_wins_over_earlier_match() {
        let captured = "💰 $1.00\nsome noise\n💰 $2.00\n";
        let (cost, _) = extract_claude_statusline_cost(captured).unwrap();
        assert_eq!(cost, 2.00);
    }

    #[test]
    fn no_match_returns_none() {
        assert!(extract_claude_statusline_cost("nothing to see here\n").is_none());
    }

    #[test]
    fn non_claude_cli_returns_none() {
        let captured = "💰 $1.23\n";
        assert!(build_actual_cost_call(AICli::Codex, "a1", captured).is_none());
    }

    #[test]
    fn claude_cli_builds_actual_cost_call() {
        let captured = "💰 $1.23\n";
        let call = build_actual_cost_call(AICli::Claude, "a1", captured).unwrap();
        assert_eq!(call.agent_id.as_deref(), Some("a1"));
        assert_eq!(call.actual_cost_usd, Some(1.23));
    }
}
