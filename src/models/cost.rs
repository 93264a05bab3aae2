use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AICli;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostSource {
    /// `estimated_tokens × per-1k rate`, recorded at dispatch time.
    Estimated,
    /// Parsed from a pane's status-line cost emission.
    Actual,
}

/// One recorded API call, either an estimate made at dispatch time or an
/// actual cost parsed from a pane's status line (§4.13).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostCall {
    pub ai_cli: AICli,
    pub model: String,
    pub estimated_tokens: u64,
    pub agent_id: Option<String>,
    pub task_id: Option<String>,
    pub actual_cost_usd: Option<f64>,
    pub status_line: Option<String>,
    pub source: CostSource,
    pub timestamp: DateTime<Utc>,
}

impl CostCall {
    pub fn estimated(ai_cli: AICli, model: String, estimated_tokens: u64) -> Self {
        Self {
            ai_cli,
            model,
            estimated_tokens,
            agent_id: None,
            task_id: None,
            actual_cost_usd: None,
            status_line: None,
            source: CostSource::Estimated,
            timestamp: Utc::now(),
        }
    }

    pub fn actual(ai_cli: AICli, agent_id: String, status_line: String, cost_usd: f64) -> Self {
        Self {
            ai_cli,
            model: String::new(),
            estimated_tokens: 0,
            agent_id: Some(agent_id),
            task_id: None,
            actual_cost_usd: Some(cost_usd),
            status_line: Some(status_line),
            source: CostSource::Actual,
            timestamp: Utc::now(),
        }
    }

    /// The dedup key used to suppress re-recording the same status-line
    /// emission for the same agent (§4.8: last 50 calls).
    pub fn dedup_key(&self) -> Option<(String, String)> {
        match (&self.agent_id, &self.status_line) {
            (Some(agent_id), Some(status_line)) => {
                Some((agent_id.clone(), status_line.clone()))
            }
            _ => None,
        }
    }
}
