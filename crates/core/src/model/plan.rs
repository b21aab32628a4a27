use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One step of a refactor plan. Steps are densely numbered from 1 and may
/// only depend on earlier steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefactorStep {
    pub step_number: u32,
    /// Action verb, e.g. `create_class`, `implement_interface`.
    pub action: String,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub target_classes: Vec<String>,
    pub description: String,
    /// Step numbers this step depends on; strict subset of earlier steps.
    #[serde(default)]
    pub dependencies: Vec<u32>,
    #[serde(default)]
    pub risk_level: u8,
    #[serde(default)]
    pub estimated_minutes: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskAssessment {
    #[serde(default)]
    pub overall_risk_level: u8,
    #[serde(default)]
    pub breaking_changes: bool,
    #[serde(default)]
    pub compilation_risk: bool,
    #[serde(default)]
    pub affected_modules: Vec<String>,
    #[serde(default)]
    pub mitigation_strategies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefactorPlan {
    pub plan_id: String,
    pub job_id: String,
    #[serde(default)]
    pub steps: Vec<RefactorStep>,
    #[serde(default)]
    pub risk_assessment: RiskAssessment,
    #[serde(default)]
    pub estimated_duration: String,
}

impl RefactorPlan {
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Enforce the structural invariants: dense 1-based numbering and
    /// dependencies that reference strictly earlier steps (this also rules
    /// out cycles).
    pub fn validate(&self) -> Result<(), String> {
        for (index, step) in self.steps.iter().enumerate() {
            let expected = (index + 1) as u32;
            if step.step_number != expected {
                return Err(format!(
                    "step numbering is not dense: expected {expected}, found {}",
                    step.step_number
                ));
            }
            let mut seen = HashSet::new();
            for dep in &step.dependencies {
                if *dep == 0 || *dep >= step.step_number {
                    return Err(format!(
                        "step {} depends on {dep}, which is not an earlier step",
                        step.step_number
                    ));
                }
                if !seen.insert(*dep) {
                    return Err(format!(
                        "step {} lists dependency {dep} twice",
                        step.step_number
                    ));
                }
            }
        }
        Ok(())
    }
}

pub fn generate_plan_id() -> String {
    format!("plan_{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(n: u32, deps: &[u32]) -> RefactorStep {
        RefactorStep {
            step_number: n,
            action: "create_class".into(),
            target_files: vec![],
            target_classes: vec![],
            description: format!("step {n}"),
            dependencies: deps.to_vec(),
            risk_level: 2,
            estimated_minutes: 10,
        }
    }

    fn plan(steps: Vec<RefactorStep>) -> RefactorPlan {
        RefactorPlan {
            plan_id: "plan_x".into(),
            job_id: "job_x".into(),
            steps,
            risk_assessment: RiskAssessment::default(),
            estimated_duration: "1 hour".into(),
        }
    }

    #[test]
    fn valid_plan_passes() {
        let p = plan(vec![step(1, &[]), step(2, &[1]), step(3, &[1, 2])]);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn forward_dependency_rejected() {
        let p = plan(vec![step(1, &[2]), step(2, &[])]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn self_dependency_rejected() {
        let p = plan(vec![step(1, &[]), step(2, &[2])]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn sparse_numbering_rejected() {
        let p = plan(vec![step(1, &[]), step(3, &[])]);
        assert!(p.validate().is_err());
    }
}
