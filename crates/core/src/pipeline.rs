use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use refactory_provider::{is_context_error, ModelRouter};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::agents::transformer::generate_targeted_fixes;
use crate::agents::validator::{run_validator, ValidationMode, ValidationOutcome};
use crate::agents::{intake, narrator, planner};
use crate::confirm::{
    ConfirmationChannel, ConfirmationKind, ConfirmationPayload, ConfirmationWait,
};
use crate::decision;
use crate::fsops;
use crate::gitops::{self, GitHubCredentials};
use crate::model::{ChangeType, CodeChanges, DecisionAction, RefactorPlan, ValidationResult};
use crate::progress::{ProgressBus, ProgressEvent};
use crate::session::{PipelineStage, PipelineStatus, SessionHandle, SessionState};
use crate::streaming::{transform_streaming, TransformOptions, TransformerEvent};

/// Everything a session worker needs to drive its pipeline.
pub struct PipelineDeps {
    pub router: Arc<ModelRouter>,
    pub config: Arc<refactory_config::Config>,
    pub session: SessionHandle,
    pub bus: Arc<ProgressBus>,
    pub confirmations: Option<Arc<ConfirmationChannel>>,
    pub credentials: Option<GitHubCredentials>,
    /// Pre-provisioned working copy; when absent and credentials carry a
    /// repository URL, the pipeline clones one.
    pub repo_root: Option<PathBuf>,
}

/// The staged, resumable state machine driving one refactoring session
/// from prompt to pushed branch.
pub struct Pipeline {
    deps: PipelineDeps,
    session_id: String,
    repo_root: Option<PathBuf>,
    backup_dir: Option<PathBuf>,
    cloned: bool,
    /// Branch/commit overrides resolved at the push gate.
    branch_override: Option<String>,
    message_override: Option<String>,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        let repo_root = deps.repo_root.clone();
        Self {
            deps,
            session_id: String::new(),
            repo_root,
            backup_dir: None,
            cloned: false,
            branch_override: None,
            message_override: None,
        }
    }

    /// Run the session to a terminal state. Never panics and never
    /// returns an error: failures are recorded on the session, reported
    /// on the bus, and followed by best-effort cleanup.
    pub async fn run(mut self) {
        {
            let mut session = self.deps.session.write().await;
            session.status = PipelineStatus::Running;
            self.session_id = session.session_id.clone();
        }

        if let Err(e) = self.execute().await {
            let cancelled = e.to_string().contains("cancelled by user");
            let (stage, status) = if cancelled {
                (PipelineStage::Cancelled, PipelineStatus::Cancelled)
            } else {
                (PipelineStage::Failed, PipelineStatus::Failed)
            };
            error!(error = %e, "Pipeline terminated abnormally");
            {
                let mut session = self.deps.session.write().await;
                session.stage = stage;
                session.status = status;
                session.add_error(format!("Pipeline failed: {e}"));
                session.ended_at = Some(chrono::Utc::now());
            }
            self.publish(
                self.event(stage, status, format!("Pipeline failed: {e}"))
                    .with_type("error"),
            );
            self.cleanup().await;
        }

        self.deps.bus.close();
    }

    async fn execute(&mut self) -> Result<()> {
        let (user_prompt, mode) = {
            let session = self.deps.session.read().await;
            (session.user_prompt.clone(), session.mode)
        };
        info!(session_id = %self.session_id, ?mode, "Starting pipeline");

        // Pre-flight: conversational input never touches a repository.
        if let Some(reply) =
            decision::classify_conversational(&self.deps.router, &user_prompt).await
        {
            info!("Conversational input; replying and completing");
            {
                let mut session = self.deps.session.write().await;
                session.stage = PipelineStage::Complete;
                session.status = PipelineStatus::Completed;
                session.ended_at = Some(chrono::Utc::now());
            }
            self.publish(self.event(PipelineStage::Complete, PipelineStatus::Completed, reply));
            return Ok(());
        }

        // Clone when a repository is configured but no root exists yet.
        if self.repo_root.is_none() {
            if let Some(creds) = self.deps.credentials.clone() {
                self.say(PipelineStage::Idle, format!("Cloning repository: {}", creds.repository_url));
                match gitops::clone_repository(
                    &creds.repository_url,
                    &creds.access_token,
                    &creds.branch,
                    &self.deps.config.git.clone_dir,
                )
                .await
                {
                    Ok(root) => {
                        self.repo_root = Some(root.clone());
                        self.cloned = true;
                        self.deps.session.write().await.repo_root = Some(root);
                        self.say(PipelineStage::Idle, "Repository cloned successfully");
                    }
                    Err(e) => bail!("Failed to clone repository: {e}"),
                }
            }
        }

        self.say(
            PipelineStage::Idle,
            format!("Starting pipeline: {}", truncate(&user_prompt, 80)),
        );

        // Stage 1: intake.
        self.enter_stage(PipelineStage::Intake).await;
        self.say(PipelineStage::Intake, "Stage 1: Analyzing refactoring request...");
        let stage_start = Instant::now();
        let (job_spec, _run) = intake::run_intake(&self.deps.router, &user_prompt, None).await?;
        {
            let mut session = self.deps.session.write().await;
            session.record_stage_time(PipelineStage::Intake, elapsed_ms(stage_start));
            session.job_spec = Some(job_spec.clone());
        }
        self.say(
            PipelineStage::Intake,
            format!("Intake complete: {}", job_spec.intent),
        );

        // Stage 2: planning (with optional confirmation gate).
        self.run_planning_stage(None).await?;
        if mode.is_interactive_detailed() {
            self.plan_confirmation_gate().await?;
        }

        // Stage 3: streaming transformation.
        self.run_transformation_stage().await?;

        // Stage 3.5: validation mode gate.
        let validation_mode = if mode.is_interactive_detailed() {
            self.validation_mode_gate().await?
        } else {
            ValidationMode::Full
        };

        // Stage 4: validation with the intelligent retry loop.
        self.run_validation_stage(validation_mode).await?;

        let validation_failed = {
            let session = self.deps.session.read().await;
            session
                .validation_result
                .as_ref()
                .map(|v| !v.passed)
                .unwrap_or(false)
        };
        if validation_failed {
            let digest = {
                let session = self.deps.session.read().await;
                session
                    .validation_result
                    .as_ref()
                    .map(build_error_digest)
                    .unwrap_or_default()
            };
            self.deps
                .session
                .write()
                .await
                .add_error("Validation failed after retry attempts");
            self.publish(
                self.event(
                    PipelineStage::Validation,
                    PipelineStatus::Failed,
                    "Validation failed after retries. You may still commit/push these changes.",
                )
                .with_type("validation_failed")
                .with_data(json!({ "error_summary": digest })),
            );
        }

        // Stage 5: narration always runs so the user gets a PR
        // description even when validation failed.
        self.run_narration_stage().await?;

        // Stage 5.5: push gate.
        if mode.is_interactive_detailed() {
            self.push_confirmation_gate().await?;
        }

        // Stage 6: git operations, when credentials are configured.
        if self.deps.credentials.is_some() {
            self.say(
                PipelineStage::GitOperations,
                "Stage 6: Executing git operations...",
            );
            self.run_git_stage().await?;
        }

        // Termination.
        let elapsed;
        let validation_result;
        {
            let mut session = self.deps.session.write().await;
            session.stage = if validation_failed {
                PipelineStage::Failed
            } else {
                PipelineStage::Complete
            };
            session.status = if validation_failed {
                PipelineStatus::Failed
            } else {
                PipelineStatus::Completed
            };
            session.ended_at = Some(chrono::Utc::now());
            elapsed = session.elapsed_ms();
            validation_result = session.validation_result.clone();
        }

        let (final_stage, final_status, label) = if validation_failed {
            (PipelineStage::Failed, PipelineStatus::Failed, "Failed")
        } else {
            (PipelineStage::Complete, PipelineStatus::Completed, "Passed")
        };
        self.publish(
            self.event(
                final_stage,
                final_status,
                format!(
                    "Refactoring completed! Validation: {label} ({:.1}s)",
                    elapsed / 1000.0
                ),
            )
            .with_type("pipeline_completed")
            .with_data(json!({ "validation_result": validation_result })),
        );

        let branch = self.deps.session.read().await.git_branch.clone();
        if let (Some(creds), Some(branch)) = (self.deps.credentials.as_ref(), branch) {
            let url = gitops::branch_url(&creds.repository_url, &branch);
            self.publish(
                self.event(
                    final_stage,
                    final_status,
                    format!("Review your changes: {url}"),
                )
                .with_type("branch_link")
                .with_data(json!({ "branch_url": url })),
            );
        }

        self.cleanup().await;
        info!(session_id = %self.session_id, "Pipeline finished");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------

    async fn run_planning_stage(&mut self, modifications: Option<&str>) -> Result<()> {
        self.enter_stage(PipelineStage::Planning).await;
        self.say(PipelineStage::Planning, "Stage 2: Creating refactoring plan...");
        let stage_start = Instant::now();

        let job_spec = {
            let session = self.deps.session.read().await;
            let base = session
                .job_spec
                .clone()
                .ok_or_else(|| anyhow::anyhow!("JobSpec not available"))?;
            match modifications {
                Some(mods) => {
                    let digest = session.validation_result.as_ref().map(build_error_digest);
                    base.with_modifications(mods, digest.as_deref())
                }
                None => base,
            }
        };

        let (plan, _run) =
            planner::run_planner(&self.deps.router, &job_spec, self.repo_root.as_deref()).await?;

        {
            let mut session = self.deps.session.write().await;
            session.record_stage_time(PipelineStage::Planning, elapsed_ms(stage_start));
            if modifications.is_some() {
                session.job_spec = Some(job_spec);
            }
            session.plan = Some(plan.clone());
        }
        self.say(
            PipelineStage::Planning,
            format!("Plan created: {} steps", plan.total_steps()),
        );
        Ok(())
    }

    async fn plan_confirmation_gate(&mut self) -> Result<()> {
        loop {
            let (summary, plan_data) = {
                let session = self.deps.session.read().await;
                let plan = session
                    .plan
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("Plan not available"))?;
                (
                    build_plan_summary(plan, session.job_spec.as_ref().map(|j| j.intent.as_str())),
                    plan_gate_data(plan),
                )
            };

            self.pause_for(ConfirmationKind::Plan, json!({ "plan_summary": &summary }))
                .await;
            self.publish(
                self.event(
                    PipelineStage::AwaitingPlanConfirmation,
                    PipelineStatus::Paused,
                    "Plan ready for review - awaiting your confirmation",
                )
                .with_type("plan_ready")
                .requiring("plan")
                .with_data(plan_data),
            );

            let payload = self.wait_for_confirmation(ConfirmationKind::Plan).await?;

            let (action, modifications) = match payload {
                ConfirmationPayload::Reply { user_response } => {
                    let decision = decision::interpret_plan_reply(
                        &self.deps.router,
                        &user_response,
                        &summary,
                    )
                    .await;
                    (decision.action, decision.modifications)
                }
                ConfirmationPayload::Plan {
                    action,
                    modifications,
                } => {
                    let action = match action.as_str() {
                        "approve" => DecisionAction::Approve,
                        "modify" => DecisionAction::Modify,
                        "cancel" | "abort" => DecisionAction::Abort,
                        _ => DecisionAction::Clarify,
                    };
                    (action, modifications)
                }
                // Payloads for other gates cannot arrive here; the
                // transport checks awaiting_confirmation first.
                _ => (DecisionAction::Clarify, None),
            };

            match action {
                DecisionAction::Approve => {
                    self.resume().await;
                    self.say(
                        PipelineStage::Transformation,
                        "Plan approved - starting code generation...",
                    );
                    return Ok(());
                }
                DecisionAction::Modify => {
                    let Some(mods) = modifications else {
                        self.publish(
                            self.event(
                                PipelineStage::AwaitingPlanConfirmation,
                                PipelineStatus::Paused,
                                "Modification requested without instructions - please clarify",
                            )
                            .with_type("clarification_needed")
                            .requiring("plan"),
                        );
                        continue;
                    };
                    self.resume().await;
                    self.say(
                        PipelineStage::Planning,
                        "Regenerating plan with modifications...",
                    );
                    self.run_planning_stage(Some(&mods)).await?;
                    // Loop to present the regenerated plan.
                }
                DecisionAction::Abort | DecisionAction::Cancel => {
                    self.deps.session.write().await.status = PipelineStatus::Cancelled;
                    bail!("Refactoring cancelled by user");
                }
                _ => {
                    self.publish(
                        self.event(
                            PipelineStage::AwaitingPlanConfirmation,
                            PipelineStatus::Paused,
                            "Could not understand your response. Reply with approve, \
                             modify: <instructions>, or cancel.",
                        )
                        .with_type("clarification_needed")
                        .requiring("plan"),
                    );
                    // Loop to wait again.
                }
            }
        }
    }

    async fn run_transformation_stage(&mut self) -> Result<()> {
        self.enter_stage(PipelineStage::Transformation).await;
        self.say(PipelineStage::Transformation, "Stage 3: Generating code changes...");
        let stage_start = Instant::now();

        let plan = {
            let session = self.deps.session.read().await;
            session
                .plan
                .clone()
                .ok_or_else(|| anyhow::anyhow!("RefactorPlan not available"))?
        };

        // One backup per session; retries reuse it so a final restore
        // reverts to the pre-change tree.
        if self.backup_dir.is_none() {
            if let Some(root) = &self.repo_root {
                let backup = fsops::create_backup(root)?;
                self.deps.session.write().await.backup_dir = Some(backup.clone());
                self.backup_dir = Some(backup);
            }
        }

        let mut aggregate = {
            let session = self.deps.session.read().await;
            session
                .code_changes
                .clone()
                .unwrap_or_else(|| CodeChanges::new(&plan.plan_id))
        };
        aggregate.plan_id = plan.plan_id.clone();

        let mut applied_created: Vec<String> = Vec::new();
        let mut rx = transform_streaming(
            self.deps.router.clone(),
            plan,
            self.repo_root.clone(),
            TransformOptions {
                batch_size: self.deps.config.pipeline.batch_size,
            },
        );

        let mut stream_error: Option<anyhow::Error> = None;
        while let Some(item) = rx.recv().await {
            match item {
                Ok(TransformerEvent::BatchStarted {
                    batch,
                    step_numbers,
                    actions,
                }) => {
                    self.publish(
                        self.event(
                            PipelineStage::Transformation,
                            PipelineStatus::Running,
                            format!(
                                "Proceeding batch {batch}: steps {} - actions: {}",
                                join_u32(&step_numbers),
                                actions.join(", ")
                            ),
                        )
                        .with_type("batch_started")
                        .with_data(
                            json!({ "batch": batch, "steps": step_numbers, "actions": actions }),
                        ),
                    );
                }
                Ok(TransformerEvent::BatchCompleted {
                    batch,
                    step_numbers,
                    files,
                }) => {
                    self.publish(
                        self.event(
                            PipelineStage::Transformation,
                            PipelineStatus::Running,
                            format!(
                                "Batch {batch} completed: steps {} ({} files)",
                                join_u32(&step_numbers),
                                files.len()
                            ),
                        )
                        .with_type("batch_completed")
                        .with_data(json!({ "batch": batch, "files_summary": files })),
                    );
                }
                Ok(TransformerEvent::Change(change)) => {
                    let Some(root) = self.repo_root.clone() else {
                        aggregate.push(change);
                        continue;
                    };
                    match fsops::apply_change(&change, &root, self.backup_dir.as_deref()) {
                        Ok(_) => {
                            if change.change_type == ChangeType::Created {
                                applied_created.push(change.file_path.clone());
                            }
                            self.publish(
                                self.event(
                                    PipelineStage::Transformation,
                                    PipelineStatus::Running,
                                    format!(
                                        "Generated & applied: {} (+{}/-{})",
                                        change.file_path,
                                        change.lines_added,
                                        change.lines_removed
                                    ),
                                )
                                .with_type(format!("file_{}", change.change_type))
                                .with_file(change.file_path.clone())
                                .with_data(json!({
                                    "operation": change.change_type,
                                    "file_path": &change.file_path,
                                    "class_name": &change.class_name,
                                    "package_name": &change.package_name,
                                    "original_content": &change.original_content,
                                    "modified_content": &change.modified_content,
                                    "diff": &change.diff,
                                    "lines_added": change.lines_added,
                                    "lines_removed": change.lines_removed,
                                    "imports_added": &change.imports_added,
                                    "methods_added": &change.methods_added,
                                    "annotations_added": &change.annotations_added,
                                })),
                            );
                            aggregate.push(change);
                        }
                        Err(e) => {
                            // A rejected change is recorded and skipped;
                            // the stage proceeds with the rest.
                            warn!(path = %change.file_path, error = %e, "Failed to apply change");
                            self.deps
                                .session
                                .write()
                                .await
                                .add_warning(format!("Failed to apply {}: {e}", change.file_path));
                            self.publish(
                                self.event(
                                    PipelineStage::Transformation,
                                    PipelineStatus::Running,
                                    format!("Failed to apply: {}", change.file_path),
                                )
                                .with_type("step_failed"),
                            );
                        }
                    }
                }
                Err(e) => {
                    stream_error = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = stream_error {
            // Token exhaustion at batch size one, or any other
            // non-recoverable error: revert the working tree.
            if is_context_error(&e) {
                error!("Transformation failed: token limit exceeded after all batch halvings");
            } else {
                error!(error = %e, "Transformation streaming failed");
            }
            self.restore_working_tree(&applied_created).await;
            return Err(e);
        }

        {
            let mut session = self.deps.session.write().await;
            session.record_stage_time(PipelineStage::Transformation, elapsed_ms(stage_start));
            session.code_changes = Some(aggregate.clone());
        }
        self.say(
            PipelineStage::Transformation,
            format!(
                "Code generated: {} files (+{}/-{})",
                aggregate.total_changes(),
                aggregate.lines_added,
                aggregate.lines_removed
            ),
        );
        Ok(())
    }

    async fn validation_mode_gate(&mut self) -> Result<ValidationMode> {
        let summary = {
            let session = self.deps.session.read().await;
            let changes = session.code_changes.as_ref();
            format!(
                "Files to validate: {} changed (+{}/-{} lines).\n\
                 Options: full (compile + tests), compile_only, skip.",
                changes.map(|c| c.total_changes()).unwrap_or(0),
                changes.map(|c| c.lines_added).unwrap_or(0),
                changes.map(|c| c.lines_removed).unwrap_or(0),
            )
        };

        self.pause_for(
            ConfirmationKind::Validation,
            json!({ "validation_summary": &summary }),
        )
        .await;
        self.publish(
            self.event(
                PipelineStage::AwaitingValidationConfirmation,
                PipelineStatus::Paused,
                "Choose validation mode - awaiting your confirmation",
            )
            .with_type("validation_ready")
            .requiring("validation")
            .with_data(json!({ "validation_summary": &summary })),
        );

        let mode = match self
            .wait_for_confirmation_or_timeout(ConfirmationKind::Validation)
            .await?
        {
            Some(ConfirmationPayload::Reply { user_response }) => {
                decision::interpret_validation_reply(&self.deps.router, &user_response, &summary)
                    .await
            }
            Some(ConfirmationPayload::Validation { validation_mode }) => {
                ValidationMode::parse(&validation_mode)
            }
            Some(_) => ValidationMode::Full,
            // Timeout on this gate defaults to full validation rather
            // than failing the session.
            None => {
                warn!("Validation confirmation timed out; defaulting to full");
                ValidationMode::Full
            }
        };

        self.resume().await;
        self.say(PipelineStage::Validation, format!("Validation mode: {mode}"));
        Ok(mode)
    }

    async fn run_validation_stage(&mut self, mode: ValidationMode) -> Result<()> {
        self.enter_stage(PipelineStage::Validation).await;
        let stage_start = Instant::now();

        if mode == ValidationMode::Skip {
            let plan_id = {
                let session = self.deps.session.read().await;
                session
                    .plan
                    .as_ref()
                    .map(|p| p.plan_id.clone())
                    .unwrap_or_default()
            };
            self.deps.session.write().await.validation_result =
                Some(ValidationResult::skipped(plan_id));
            self.say(PipelineStage::Validation, "Validation skipped by user");
            return Ok(());
        }

        self.say(
            PipelineStage::Validation,
            "Stage 4: Validating code changes (compilation and tests)...",
        );

        loop {
            let code_changes = {
                let session = self.deps.session.read().await;
                session
                    .code_changes
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("CodeChanges not available"))?
            };

            let outcome = self.validate_once(&code_changes, mode).await?;
            let passed = outcome.result.passed;
            self.deps.session.write().await.validation_result = Some(outcome.result.clone());

            if passed {
                self.say(PipelineStage::Validation, "Validation passed");
                break;
            }

            let (can_retry, retry_count, max_retries, intent) = {
                let session = self.deps.session.read().await;
                (
                    session.can_retry(),
                    session.retry_count,
                    session.max_retries,
                    session
                        .job_spec
                        .as_ref()
                        .map(|j| j.intent.clone())
                        .unwrap_or_default(),
                )
            };

            if !self.deps.config.pipeline.auto_fix_enabled {
                info!("Auto-fix disabled; stopping validation");
                break;
            }
            if !can_retry {
                warn!(max_retries, "Max retries reached; stopping validation");
                let digest = build_error_digest(&outcome.result);
                self.publish(
                    self.event(
                        PipelineStage::Validation,
                        PipelineStatus::Failed,
                        "Validation failed: maximum retries reached",
                    )
                    .with_type("validation_failed")
                    .with_data(json!({
                        "error_summary": digest,
                        "failed_checks": outcome.result.failed_checks(),
                        "compilation_passed": outcome.result.compilation_passed,
                    })),
                );
                break;
            }

            // Stream the orchestrator's analysis as it forms.
            let digest = build_error_digest(&outcome.result);
            let (reasoning_tx, mut reasoning_rx) = mpsc::unbounded_channel::<String>();
            let bus = self.deps.bus.clone();
            let session_id = self.session_id.clone();
            let forward = tokio::spawn(async move {
                while let Some(reasoning) = reasoning_rx.recv().await {
                    bus.publish(
                        ProgressEvent::new(
                            &session_id,
                            PipelineStage::Validation,
                            PipelineStatus::Retrying,
                            reasoning,
                        )
                        .with_type("llm_reasoning")
                        .with_data(json!({ "stage": "validation_analysis", "partial": true })),
                    );
                }
            });

            let retry_decision = decision::decide_retry_strategy(
                &self.deps.router,
                &digest,
                &intent,
                retry_count,
                max_retries,
                Some(reasoning_tx),
            )
            .await;
            forward.abort();

            match retry_decision.action {
                DecisionAction::Retry => {
                    {
                        let mut session = self.deps.session.write().await;
                        session.retry_count += 1;
                        session.status = PipelineStatus::Retrying;
                    }
                    self.publish(
                        self.event(
                            PipelineStage::Validation,
                            PipelineStatus::Retrying,
                            format!("Attempting fix (retry {})...", retry_count + 1),
                        )
                        .with_type("fix_attempt"),
                    );
                    self.apply_targeted_fixes(&digest, retry_decision.modifications.as_deref())
                        .await?;
                }
                DecisionAction::Modify => {
                    let Some(mods) = retry_decision.modifications else {
                        warn!("Modify strategy without modifications; stopping");
                        break;
                    };
                    {
                        let mut session = self.deps.session.write().await;
                        session.retry_count += 1;
                        session.status = PipelineStatus::Retrying;
                    }
                    self.say(
                        PipelineStage::Planning,
                        "Re-planning with modification instructions...",
                    );
                    self.run_planning_stage(Some(&mods)).await?;
                    self.run_transformation_stage().await?;
                    self.enter_stage(PipelineStage::Validation).await;
                }
                DecisionAction::Escalate => {
                    self.deps.session.write().await.add_warning(format!(
                        "Escalated: {}. Human review recommended.",
                        retry_decision.reasoning
                    ));
                    break;
                }
                _ => {
                    info!(action = %retry_decision.action, "Stopping validation retries");
                    break;
                }
            }
        }

        self.deps
            .session
            .write()
            .await
            .record_stage_time(PipelineStage::Validation, elapsed_ms(stage_start));
        Ok(())
    }

    async fn validate_once(
        &mut self,
        code_changes: &CodeChanges,
        mode: ValidationMode,
    ) -> Result<ValidationOutcome> {
        // Bridge build output lines onto the bus as they stream.
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let bus = self.deps.bus.clone();
        let session_id = self.session_id.clone();
        let forward = tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                bus.publish(
                    ProgressEvent::new(
                        &session_id,
                        PipelineStage::Validation,
                        PipelineStatus::Running,
                        line.trim_end().to_string(),
                    )
                    .with_type("build_output"),
                );
            }
        });

        let result = run_validator(
            &self.deps.router,
            code_changes,
            self.repo_root.as_deref(),
            mode,
            Some(line_tx),
        )
        .await;
        forward.abort();
        let (outcome, _run) = result?;
        Ok(outcome)
    }

    async fn apply_targeted_fixes(
        &mut self,
        digest: &str,
        modifications: Option<&str>,
    ) -> Result<()> {
        let plan = {
            let session = self.deps.session.read().await;
            session
                .plan
                .clone()
                .ok_or_else(|| anyhow::anyhow!("RefactorPlan not available"))?
        };

        // Prefer the orchestrator's own instructions; otherwise ask the
        // planner model to analyze the digest into fix instructions.
        let instructions = match modifications {
            Some(mods) => mods.to_string(),
            None => {
                let analysis_prompt = format!(
                    "Analyze these Java validation errors and produce concrete fix \
                     instructions for a code generator. Name exact files, classes and \
                     signatures. Check for: missing symbols that need the class created \
                     or the stale reference removed, missing annotation imports that \
                     need a build dependency, constructor or method signatures that \
                     changed without their callers (often tests) being updated.\n\n\
                     **Errors:**\n{digest}"
                );
                self.deps
                    .router
                    .complete_text(
                        refactory_provider::ModelRole::Planner,
                        None,
                        &analysis_prompt,
                        refactory_provider::CallOpts {
                            temperature: Some(0.3),
                            max_tokens: Some(2048),
                        },
                    )
                    .await?
            }
        };

        let (fixes, _run) = generate_targeted_fixes(
            &self.deps.router,
            &plan,
            digest,
            &instructions,
            self.repo_root.as_deref(),
        )
        .await?;

        let mut aggregate = {
            let session = self.deps.session.read().await;
            session
                .code_changes
                .clone()
                .unwrap_or_else(|| CodeChanges::new(&plan.plan_id))
        };

        for fix in fixes {
            if let Some(root) = &self.repo_root {
                if let Err(e) = fsops::apply_change(&fix, root, self.backup_dir.as_deref()) {
                    warn!(path = %fix.file_path, error = %e, "Failed to apply fix");
                    self.deps
                        .session
                        .write()
                        .await
                        .add_warning(format!("Failed to apply fix {}: {e}", fix.file_path));
                    continue;
                }
            }
            self.publish(
                self.event(
                    PipelineStage::Validation,
                    PipelineStatus::Retrying,
                    format!("Applied fix: {}", fix.file_path),
                )
                .with_type("file_operation")
                .with_file(fix.file_path.clone()),
            );

            // Fixes replace earlier changes to the same path in the
            // aggregate so counters reflect the final state.
            aggregate.changes.retain(|c| c.file_path != fix.file_path);
            aggregate.changes.push(fix);
        }
        aggregate.recount();
        self.deps.session.write().await.code_changes = Some(aggregate);
        Ok(())
    }

    async fn run_narration_stage(&mut self) -> Result<()> {
        self.enter_stage(PipelineStage::Narration).await;
        self.say(PipelineStage::Narration, "Stage 5: Creating PR description...");
        let stage_start = Instant::now();

        let (code_changes, validation) = {
            let session = self.deps.session.read().await;
            (
                session
                    .code_changes
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("CodeChanges not available"))?,
                session
                    .validation_result
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("ValidationResult not available"))?,
            )
        };

        let (description, _run) =
            narrator::run_narrator(&self.deps.router, &code_changes, &validation).await?;
        {
            let mut session = self.deps.session.write().await;
            session.record_stage_time(PipelineStage::Narration, elapsed_ms(stage_start));
            session.pr_description = Some(description);
        }
        self.say(PipelineStage::Narration, "PR description ready");
        Ok(())
    }

    async fn push_confirmation_gate(&mut self) -> Result<()> {
        loop {
            let (summary, gate_data) = {
                let session = self.deps.session.read().await;
                build_push_summary(&session)
            };

            self.pause_for(ConfirmationKind::Push, json!({ "push_summary": &summary }))
                .await;
            self.publish(
                self.event(
                    PipelineStage::AwaitingPushConfirmation,
                    PipelineStatus::Paused,
                    "Code changes ready - awaiting push confirmation",
                )
                .with_type("push_ready")
                .requiring("push")
                .with_data(gate_data),
            );

            let payload = self.wait_for_confirmation(ConfirmationKind::Push).await?;

            let (action, branch_override, message_override) = match payload {
                ConfirmationPayload::Reply { user_response } => {
                    let interpretation = decision::interpret_push_reply(
                        &self.deps.router,
                        &user_response,
                        &summary,
                    )
                    .await;
                    (
                        interpretation.decision.action,
                        interpretation.branch_override,
                        interpretation.message_override,
                    )
                }
                ConfirmationPayload::Push {
                    action,
                    branch_name_override,
                    commit_message_override,
                } => {
                    let action = match action.as_str() {
                        "approve" => DecisionAction::Approve,
                        "cancel" | "abort" => DecisionAction::Cancel,
                        _ => DecisionAction::Clarify,
                    };
                    (action, branch_name_override, commit_message_override)
                }
                _ => (DecisionAction::Clarify, None, None),
            };

            match action {
                DecisionAction::Approve => {
                    let message_override =
                        self.maybe_regenerate_commit_message(message_override).await;
                    self.branch_override = branch_override;
                    self.message_override = message_override;
                    self.resume().await;
                    return Ok(());
                }
                DecisionAction::Cancel | DecisionAction::Abort => {
                    self.deps.session.write().await.status = PipelineStatus::Cancelled;
                    bail!("Push cancelled by user");
                }
                _ => {
                    self.publish(
                        self.event(
                            PipelineStage::AwaitingPushConfirmation,
                            PipelineStatus::Paused,
                            "Could not understand your response. Reply with approve or cancel.",
                        )
                        .with_type("clarification_needed")
                        .requiring("push"),
                    );
                }
            }
        }
    }

    /// A message override containing a regeneration keyword re-runs the
    /// narrator; its fresh summary becomes the commit message.
    async fn maybe_regenerate_commit_message(
        &mut self,
        message_override: Option<String>,
    ) -> Option<String> {
        let message = message_override?;
        let keywords = ["regenerate", "rewrite", "improve", "better"];
        let lower = message.to_lowercase();
        if !keywords.iter().any(|k| lower.contains(k)) {
            return Some(message);
        }

        self.say(
            PipelineStage::AwaitingPushConfirmation,
            "Regenerating commit message...",
        );
        let (code_changes, validation) = {
            let session = self.deps.session.read().await;
            (
                session.code_changes.clone(),
                session.validation_result.clone(),
            )
        };
        let (Some(code_changes), Some(validation)) = (code_changes, validation) else {
            warn!("Cannot regenerate commit message without changes and validation");
            return Some(message);
        };

        match narrator::run_narrator(&self.deps.router, &code_changes, &validation).await {
            Ok((description, _)) => {
                let summary = description.summary.clone();
                self.deps.session.write().await.pr_description = Some(description);
                self.say(
                    PipelineStage::AwaitingPushConfirmation,
                    format!("New commit message: {}", truncate(&summary, 80)),
                );
                Some(summary)
            }
            Err(e) => {
                warn!(error = %e, "Commit message regeneration failed; keeping original");
                Some(message)
            }
        }
    }

    async fn run_git_stage(&mut self) -> Result<()> {
        self.enter_stage(PipelineStage::GitOperations).await;
        let stage_start = Instant::now();
        let creds = self
            .deps
            .credentials
            .clone()
            .ok_or_else(|| anyhow::anyhow!("GitHub credentials not available"))?;
        let root = self
            .repo_root
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Repository root not set"))?;

        let pr = self.deps.session.read().await.pr_description.clone();

        let branch = self
            .branch_override
            .clone()
            .unwrap_or_else(|| format!("repoai/{}", self.session_id));
        let message = self.message_override.clone().unwrap_or_else(|| {
            pr.as_ref()
                .map(|p| format!("{}\n\n{}", p.title, p.summary))
                .unwrap_or_else(|| "Automated refactoring".to_string())
        });

        self.emit_git_op(format!("Creating branch {branch}"));
        gitops::create_branch(&root, &branch).await?;
        self.deps.session.write().await.git_branch = Some(branch.clone());

        self.emit_git_op("Committing changes");
        let commit = gitops::commit_all(
            &root,
            &message,
            &self.deps.config.git.author_name,
            &self.deps.config.git.author_email,
        )
        .await?;
        if !commit.is_empty() {
            self.emit_git_op(format!("Committed {}", &commit[..7.min(commit.len())]));
        }

        self.emit_git_op("Pushing to origin");
        gitops::push_branch(&root, &branch, &creds.access_token, &creds.repository_url).await?;

        let url = gitops::branch_url(&creds.repository_url, &branch);
        self.publish(
            self.event(
                PipelineStage::GitOperations,
                PipelineStatus::Running,
                "Git operations completed",
            )
            .with_type("stage_completed")
            .with_data(json!({ "branch_url": url })),
        );

        self.deps
            .session
            .write()
            .await
            .record_stage_time(PipelineStage::GitOperations, elapsed_ms(stage_start));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Confirmation plumbing
    // ------------------------------------------------------------------

    async fn pause_for(&mut self, kind: ConfirmationKind, data: serde_json::Value) {
        let mut session = self.deps.session.write().await;
        session.stage = match kind {
            ConfirmationKind::Plan => PipelineStage::AwaitingPlanConfirmation,
            ConfirmationKind::Validation => PipelineStage::AwaitingValidationConfirmation,
            ConfirmationKind::Push => PipelineStage::AwaitingPushConfirmation,
        };
        session.status = PipelineStatus::Paused;
        session.awaiting_confirmation = Some(kind);
        session.confirmation_data = Some(data);
    }

    async fn resume(&mut self) {
        let mut session = self.deps.session.write().await;
        session.awaiting_confirmation = None;
        session.confirmation_data = None;
        session.status = PipelineStatus::Running;
    }

    /// Wait for a payload; a timeout fails the pipeline.
    async fn wait_for_confirmation(
        &mut self,
        kind: ConfirmationKind,
    ) -> Result<ConfirmationPayload> {
        match self.wait_for_confirmation_or_timeout(kind).await? {
            Some(payload) => Ok(payload),
            None => {
                self.deps.session.write().await.status = PipelineStatus::Failed;
                bail!("{kind} confirmation timeout - no response from user")
            }
        }
    }

    /// Wait for a payload; `None` means timeout (gate-specific handling).
    async fn wait_for_confirmation_or_timeout(
        &mut self,
        kind: ConfirmationKind,
    ) -> Result<Option<ConfirmationPayload>> {
        let Some(channel) = self.deps.confirmations.clone() else {
            warn!(%kind, "No confirmation channel; skipping gate");
            return Ok(Some(default_payload(kind)));
        };
        let timeout = Duration::from_secs(self.deps.config.pipeline.confirmation_timeout_secs);
        info!(%kind, "Waiting for user confirmation");
        match channel.wait(timeout).await {
            ConfirmationWait::Received(payload) => Ok(Some(payload)),
            ConfirmationWait::TimedOut => Ok(None),
            ConfirmationWait::Cancelled => {
                self.deps.session.write().await.status = PipelineStatus::Cancelled;
                bail!("Refactoring cancelled by user")
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn enter_stage(&mut self, stage: PipelineStage) {
        let mut session = self.deps.session.write().await;
        session.stage = stage;
        if session.status != PipelineStatus::Retrying {
            session.status = PipelineStatus::Running;
        }
    }

    fn event(
        &self,
        stage: PipelineStage,
        status: PipelineStatus,
        message: impl Into<String>,
    ) -> ProgressEvent {
        ProgressEvent::new(&self.session_id, stage, status, message)
    }

    fn publish(&self, event: ProgressEvent) {
        self.deps.bus.publish(event);
    }

    /// Publish a plain running-status message for a stage.
    fn say(&self, stage: PipelineStage, message: impl Into<String>) {
        self.publish(self.event(stage, PipelineStatus::Running, message));
    }

    fn emit_git_op(&self, message: impl Into<String>) {
        self.publish(
            self.event(PipelineStage::GitOperations, PipelineStatus::Running, message)
                .with_type("git_operation"),
        );
    }

    /// Revert the working tree to its pre-transformation state: remove the
    /// files this run created, then copy the backup over everything it
    /// preserved.
    async fn restore_working_tree(&mut self, created: &[String]) {
        let (Some(root), Some(backup)) = (self.repo_root.as_ref(), self.backup_dir.as_ref())
        else {
            return;
        };
        for path in created {
            let target = root.join(path);
            if target.exists() {
                if let Err(e) = std::fs::remove_file(&target) {
                    warn!(path, error = %e, "Failed to remove created file during restore");
                }
            }
        }
        if let Err(e) = fsops::restore_backup(backup, root) {
            warn!(error = %e, "Backup restore failed");
        }
    }

    async fn cleanup(&mut self) {
        if let Some(backup) = self.backup_dir.take() {
            fsops::cleanup_backup(&backup);
        }
        if self.cloned {
            if let Some(root) = self.repo_root.take() {
                fsops::cleanup_clone(&root);
            }
        }
    }
}

fn default_payload(kind: ConfirmationKind) -> ConfirmationPayload {
    match kind {
        ConfirmationKind::Plan => ConfirmationPayload::Plan {
            action: "approve".into(),
            modifications: None,
        },
        ConfirmationKind::Validation => ConfirmationPayload::Validation {
            validation_mode: "full".into(),
        },
        ConfirmationKind::Push => ConfirmationPayload::Push {
            action: "approve".into(),
            branch_name_override: None,
            commit_message_override: None,
        },
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}

fn join_u32(values: &[u32]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Human-readable plan summary for confirmation prompts.
pub fn build_plan_summary(plan: &RefactorPlan, intent: Option<&str>) -> String {
    let mut lines = vec![
        "# Refactoring Plan Summary".to_string(),
        String::new(),
        format!("**Intent:** {}", intent.unwrap_or("unknown")),
        format!("**Total steps:** {}", plan.total_steps()),
        format!(
            "**Risk level:** {}/10",
            plan.risk_assessment.overall_risk_level
        ),
        format!(
            "**Breaking changes:** {}",
            if plan.risk_assessment.breaking_changes {
                "Yes"
            } else {
                "No"
            }
        ),
        String::new(),
        "## Steps:".to_string(),
    ];
    for step in plan.steps.iter().take(10) {
        lines.push(format!("{}. {}", step.step_number, step.description));
        if !step.target_files.is_empty() {
            lines.push(format!("   Files: {}", step.target_files.join(", ")));
        }
    }
    if plan.total_steps() > 10 {
        lines.push(format!("... and {} more steps", plan.total_steps() - 10));
    }
    lines.join("\n")
}

fn plan_gate_data(plan: &RefactorPlan) -> serde_json::Value {
    json!({
        "plan_id": &plan.plan_id,
        "total_steps": plan.total_steps(),
        "estimated_duration": &plan.estimated_duration,
        "steps": plan.steps.iter().map(|step| json!({
            "step_number": step.step_number,
            "action": &step.action,
            "description": &step.description,
            "target_files": &step.target_files,
            "target_classes": &step.target_classes,
            "dependencies": &step.dependencies,
        })).collect::<Vec<_>>(),
    })
}

/// Digest of a failed validation: compilation errors, failed checks with
/// their issues, and security findings.
pub fn build_error_digest(result: &ValidationResult) -> String {
    let mut lines: Vec<String> = Vec::new();
    if !result.compilation_passed {
        lines.push("**Compilation errors:**".into());
        for check in result.checks.values() {
            for error in &check.compilation_errors {
                lines.push(format!("  - {error}"));
            }
        }
    }
    let failed = result.failed_checks();
    if !failed.is_empty() {
        lines.push("**Failed checks:**".into());
        for name in failed {
            if let Some(check) = result.checks.get(name) {
                lines.push(format!("  {name}:"));
                for issue in check.issues.iter().take(5) {
                    lines.push(format!("    - {issue}"));
                }
            }
        }
    }
    if !result.security_vulnerabilities.is_empty() {
        lines.push("**Security vulnerabilities:**".into());
        for vulnerability in &result.security_vulnerabilities {
            lines.push(format!("  - {vulnerability}"));
        }
    }
    lines.join("\n")
}

fn build_push_summary(session: &SessionState) -> (String, serde_json::Value) {
    let changes = session.code_changes.as_ref();
    let validation = session.validation_result.as_ref();
    let pr = session.pr_description.as_ref();

    let files_changed: Vec<serde_json::Value> = changes
        .map(|c| {
            c.changes
                .iter()
                .take(20)
                .map(|change| {
                    json!({
                        "file_path": &change.file_path,
                        "change_type": change.change_type,
                        "lines_added": change.lines_added,
                        "lines_removed": change.lines_removed,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let mut lines = vec![
        "# Push Confirmation".to_string(),
        String::new(),
        format!(
            "**Files changed:** {}",
            changes.map(|c| c.total_changes()).unwrap_or(0)
        ),
        format!(
            "**Validation:** {}",
            if validation.map(|v| v.passed).unwrap_or(false) {
                "Passed"
            } else {
                "Failed"
            }
        ),
        String::new(),
    ];
    if let Some(pr) = pr {
        lines.push("## PR Description".to_string());
        lines.push(format!("**Title:** {}", pr.title));
        lines.push(format!("**Summary:** {}", truncate(&pr.summary, 200)));
        lines.push(String::new());
    }
    lines.push("## Files to push:".to_string());
    for change in files_changed.iter().take(10) {
        lines.push(format!(
            "  - {} ({})",
            change["file_path"].as_str().unwrap_or(""),
            change["change_type"].as_str().unwrap_or(""),
        ));
    }

    let summary = lines.join("\n");
    let data = json!({
        "files_changed": files_changed,
        "total_files": changes.map(|c| c.total_changes()).unwrap_or(0),
        "lines_added": changes.map(|c| c.lines_added).unwrap_or(0),
        "lines_removed": changes.map(|c| c.lines_removed).unwrap_or(0),
        "validation_passed": validation.map(|v| v.passed).unwrap_or(false),
        "validation_summary": validation.map(|v| json!({
            "compilation_passed": v.compilation_passed,
            "test_coverage": v.test_coverage,
            "junit_results": v.junit_test_results,
        })),
        "pr_description": pr.map(|p| json!({
            "title": &p.title,
            "summary": &p.summary,
            "testing_notes": &p.testing_notes,
        })),
        "push_summary": &summary,
    });
    (summary, data)
}
