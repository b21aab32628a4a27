pub mod changes;
pub mod decision;
pub mod job;
pub mod plan;
pub mod pr;
pub mod validation;

pub use changes::{ChangeType, CodeChange, CodeChanges};
pub use decision::{DecisionAction, OrchestratorDecision};
pub use job::{generate_job_id, JobScope, JobSpec};
pub use plan::{generate_plan_id, RefactorPlan, RefactorStep, RiskAssessment};
pub use pr::PrDescription;
pub use validation::{
    ConfidenceMetrics, JUnitTestResults, ValidationCheck, ValidationResult,
};
