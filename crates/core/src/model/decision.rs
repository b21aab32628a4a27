use serde::{Deserialize, Serialize};

/// Action chosen by the orchestrator model for a meta-decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionAction {
    Approve,
    Modify,
    Retry,
    Skip,
    Abort,
    Clarify,
    Escalate,
    Cancel,
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecisionAction::Approve => "approve",
            DecisionAction::Modify => "modify",
            DecisionAction::Retry => "retry",
            DecisionAction::Skip => "skip",
            DecisionAction::Abort => "abort",
            DecisionAction::Clarify => "clarify",
            DecisionAction::Escalate => "escalate",
            DecisionAction::Cancel => "cancel",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorDecision {
    pub action: DecisionAction,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub confidence: f64,
    /// Free text; may carry `branch:` / `commit_message:` key-lines or a
    /// validation mode, depending on the question asked.
    #[serde(default)]
    pub modifications: Option<String>,
    #[serde(default)]
    pub next_step: Option<String>,
    #[serde(default)]
    pub estimated_success_probability: Option<f64>,
}

impl OrchestratorDecision {
    /// Synthetic decision used when the orchestrator model itself fails.
    pub fn fallback(action: DecisionAction, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            action,
            reasoning: reason.into(),
            confidence,
            modifications: None,
            next_step: None,
            estimated_success_probability: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_lowercase() {
        let d: OrchestratorDecision = serde_json::from_str(
            r#"{"action": "clarify", "reasoning": "unsure", "confidence": 0.4}"#,
        )
        .unwrap();
        assert_eq!(d.action, DecisionAction::Clarify);
        assert!(serde_json::to_string(&d).unwrap().contains("\"clarify\""));
    }
}
