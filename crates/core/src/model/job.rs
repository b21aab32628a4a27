use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which files, packages and patterns a refactoring touches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobScope {
    /// Target file globs, e.g. `src/main/java/**/auth/**/*.java`.
    #[serde(default)]
    pub target_files: Vec<String>,
    /// Java package names, e.g. `com.example.auth`.
    #[serde(default)]
    pub target_packages: Vec<String>,
    /// Module names for non-package languages.
    #[serde(default)]
    pub target_modules: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub build_system: Option<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

fn default_language() -> String {
    "java".to_string()
}

/// Structured refactoring intent, produced by the intake agent and consumed
/// by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    /// Short intent identifier, e.g. `add_jwt_authentication`.
    pub intent: String,
    #[serde(default)]
    pub scope: JobScope,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl JobSpec {
    /// Derive a retry spec: same scope and constraints, requirements
    /// extended with a critical directive and a truncated error reference.
    pub fn with_modifications(&self, modifications: &str, error_summary: Option<&str>) -> JobSpec {
        let mut requirements = self.requirements.clone();
        requirements.push(format!(
            "CRITICAL - Address validation errors: {modifications}"
        ));
        if let Some(summary) = error_summary {
            let truncated: String = summary.chars().take(500).collect();
            requirements.push(format!("Previous validation errors: {truncated}"));
        }
        JobSpec {
            job_id: format!("{}_modified", self.job_id),
            intent: self.intent.clone(),
            scope: self.scope.clone(),
            requirements,
            constraints: self.constraints.clone(),
            created_at: Utc::now(),
        }
    }
}

pub fn generate_job_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = &uuid::Uuid::new_v4().to_string()[..8];
    format!("job_{timestamp}_{suffix}")
}
