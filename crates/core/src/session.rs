use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::confirm::ConfirmationKind;
use crate::model::{CodeChanges, JobSpec, PrDescription, RefactorPlan, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    Intake,
    Planning,
    AwaitingPlanConfirmation,
    Transformation,
    AwaitingValidationConfirmation,
    Validation,
    Narration,
    AwaitingPushConfirmation,
    GitOperations,
    Complete,
    Failed,
    Cancelled,
}

impl PipelineStage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStage::Complete | PipelineStage::Failed | PipelineStage::Cancelled
        )
    }

    /// Coarse completion fraction surfaced in progress events.
    pub fn progress(self) -> f64 {
        match self {
            PipelineStage::Idle => 0.0,
            PipelineStage::Intake => 0.2,
            PipelineStage::Planning | PipelineStage::AwaitingPlanConfirmation => 0.4,
            PipelineStage::Transformation | PipelineStage::AwaitingValidationConfirmation => 0.6,
            PipelineStage::Validation => 0.8,
            PipelineStage::Narration | PipelineStage::AwaitingPushConfirmation => 0.9,
            PipelineStage::GitOperations => 0.95,
            PipelineStage::Complete => 1.0,
            PipelineStage::Failed | PipelineStage::Cancelled => 0.0,
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineStage::Idle => "idle",
            PipelineStage::Intake => "intake",
            PipelineStage::Planning => "planning",
            PipelineStage::AwaitingPlanConfirmation => "awaiting_plan_confirmation",
            PipelineStage::Transformation => "transformation",
            PipelineStage::AwaitingValidationConfirmation => "awaiting_validation_confirmation",
            PipelineStage::Validation => "validation",
            PipelineStage::Narration => "narration",
            PipelineStage::AwaitingPushConfirmation => "awaiting_push_confirmation",
            PipelineStage::GitOperations => "git_operations",
            PipelineStage::Complete => "complete",
            PipelineStage::Failed => "failed",
            PipelineStage::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Paused,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Paused => "paused",
            PipelineStatus::Retrying => "retrying",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    #[serde(rename = "autonomous")]
    Autonomous,
    #[serde(rename = "interactive")]
    Interactive,
    #[serde(rename = "interactive-detailed")]
    InteractiveDetailed,
}

impl ExecutionMode {
    pub fn is_interactive_detailed(self) -> bool {
        matches!(self, ExecutionMode::InteractiveDetailed)
    }
}

/// Mutable per-session state. Owned by the pipeline worker; the status
/// endpoint only ever sees `StatusSnapshot` projections.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub user_id: String,
    pub user_prompt: String,
    pub mode: ExecutionMode,
    pub stage: PipelineStage,
    pub status: PipelineStatus,
    pub job_spec: Option<JobSpec>,
    pub plan: Option<RefactorPlan>,
    pub code_changes: Option<CodeChanges>,
    pub validation_result: Option<ValidationResult>,
    pub pr_description: Option<PrDescription>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Milliseconds spent per stage, keyed by stage name.
    pub stage_timings: HashMap<String, f64>,
    pub awaiting_confirmation: Option<ConfirmationKind>,
    pub confirmation_data: Option<serde_json::Value>,
    pub repo_root: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub git_branch: Option<String>,
}

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        user_prompt: impl Into<String>,
        mode: ExecutionMode,
        max_retries: u32,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            user_prompt: user_prompt.into(),
            mode,
            stage: PipelineStage::Idle,
            status: PipelineStatus::Pending,
            job_spec: None,
            plan: None,
            code_changes: None,
            validation_result: None,
            pr_description: None,
            retry_count: 0,
            max_retries,
            errors: Vec::new(),
            warnings: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            stage_timings: HashMap::new(),
            awaiting_confirmation: None,
            confirmation_data: None,
            repo_root: None,
            backup_dir: None,
            git_branch: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn record_stage_time(&mut self, stage: PipelineStage, ms: f64) {
        self.stage_timings.insert(stage.to_string(), ms);
    }

    pub fn elapsed_ms(&self) -> f64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            stage: self.stage,
            status: self.status,
            progress: self.stage.progress(),
            elapsed_time_ms: self.elapsed_ms(),
            job_id: self.job_spec.as_ref().map(|j| j.job_id.clone()),
            plan_id: self.plan.as_ref().map(|p| p.plan_id.clone()),
            files_changed: self
                .code_changes
                .as_ref()
                .map(|c| c.total_changes())
                .unwrap_or(0),
            validation_passed: self
                .validation_result
                .as_ref()
                .map(|v| v.passed)
                .unwrap_or(false),
            pr_title: self.pr_description.as_ref().map(|p| p.title.clone()),
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            awaiting_confirmation: self.awaiting_confirmation,
            confirmation_data: self.confirmation_data.clone(),
            git_branch: self.git_branch.clone(),
        }
    }
}

/// By-value projection served by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub stage: PipelineStage,
    pub status: PipelineStatus,
    pub progress: f64,
    pub elapsed_time_ms: f64,
    pub job_id: Option<String>,
    pub plan_id: Option<String>,
    pub files_changed: usize,
    pub validation_passed: bool,
    pub pr_title: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub awaiting_confirmation: Option<ConfirmationKind>,
    pub confirmation_data: Option<serde_json::Value>,
    pub git_branch: Option<String>,
}

pub type SessionHandle = Arc<RwLock<SessionState>>;

/// In-memory session registry. Sessions live until process exit.
#[derive(Default)]
pub struct SessionStore {
    inner: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, state: SessionState) -> SessionHandle {
        let id = state.session_id.clone();
        let handle: SessionHandle = Arc::new(RwLock::new(state));
        self.inner.write().await.insert(id, handle.clone());
        handle
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner.read().await.get(session_id).cloned()
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<StatusSnapshot> {
        let handle = self.get(session_id).await?;
        let state = handle.read().await;
        Some(state.snapshot())
    }
}

pub fn generate_session_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = &uuid::Uuid::new_v4().to_string()[..8];
    format!("session_{timestamp}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_labels_are_snake_case() {
        assert_eq!(PipelineStage::GitOperations.to_string(), "git_operations");
        assert_eq!(PipelineStatus::Retrying.to_string(), "retrying");
    }

    #[test]
    fn mode_serde_uses_kebab_name() {
        let mode: ExecutionMode = serde_json::from_str("\"interactive-detailed\"").unwrap();
        assert!(mode.is_interactive_detailed());
    }

    #[tokio::test]
    async fn store_serves_snapshots_by_value() {
        let store = SessionStore::new();
        let state = SessionState::new("session_1", "u", "p", ExecutionMode::Autonomous, 2);
        let handle = store.insert(state).await;

        handle.write().await.retry_count = 1;
        let snap = store.snapshot("session_1").await.unwrap();
        assert_eq!(snap.retry_count, 1);
        assert_eq!(snap.max_retries, 2);
        assert!(store.snapshot("session_x").await.is_none());
    }

    #[test]
    fn session_ids_carry_prefix_and_uniqueness() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert!(a.starts_with("session_"));
        assert_ne!(a, b);
    }
}
