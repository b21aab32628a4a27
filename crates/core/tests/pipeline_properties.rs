mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{mock_router, MockProvider};
use refactory_core::confirm::ConfirmationPayload;
use refactory_core::progress::ProgressEvent;
use refactory_core::{
    ConfirmationChannel, ExecutionMode, Pipeline, PipelineDeps, PipelineStage, PipelineStatus,
    ProgressBus, SessionHandle, SessionState, SessionStore,
};

struct Harness {
    store: Arc<SessionStore>,
    session: SessionHandle,
    bus: Arc<ProgressBus>,
    confirmations: Option<Arc<ConfirmationChannel>>,
}

async fn spawn_pipeline(
    provider: MockProvider,
    mode: ExecutionMode,
    max_retries: u32,
    prompt: &str,
    repo_root: Option<std::path::PathBuf>,
    config: Option<refactory_config::Config>,
) -> Harness {
    let store = Arc::new(SessionStore::new());
    let session = store
        .insert(SessionState::new(
            "session_test",
            "tester",
            prompt,
            mode,
            max_retries,
        ))
        .await;
    let bus = Arc::new(ProgressBus::new());
    let confirmations = mode
        .is_interactive_detailed()
        .then(|| Arc::new(ConfirmationChannel::new()));

    let pipeline = Pipeline::new(PipelineDeps {
        router: mock_router(Arc::new(provider)),
        config: Arc::new(config.unwrap_or_default()),
        session: session.clone(),
        bus: bus.clone(),
        confirmations: confirmations.clone(),
        credentials: None,
        repo_root,
    });
    tokio::spawn(pipeline.run());

    Harness {
        store,
        session,
        bus,
        confirmations,
    }
}

/// Collect every event until the sentinel, with a guard timeout.
async fn drain(bus: &ProgressBus) -> Vec<ProgressEvent> {
    let mut rx = bus.subscribe();
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(30), rx.recv()).await {
            Ok(Some(Some(event))) => events.push(event),
            Ok(Some(None)) | Ok(None) => break,
            Err(_) => panic!("timed out waiting for the sentinel"),
        }
    }
    events
}

fn stage_rank(stage: PipelineStage) -> usize {
    match stage {
        PipelineStage::Idle => 0,
        PipelineStage::Intake => 1,
        PipelineStage::Planning => 2,
        PipelineStage::AwaitingPlanConfirmation => 3,
        PipelineStage::Transformation => 4,
        PipelineStage::AwaitingValidationConfirmation => 5,
        PipelineStage::Validation => 6,
        PipelineStage::Narration => 7,
        PipelineStage::AwaitingPushConfirmation => 8,
        PipelineStage::GitOperations => 9,
        PipelineStage::Complete | PipelineStage::Failed | PipelineStage::Cancelled => 10,
    }
}

// ---------------------------------------------------------------------
// Property 1: stage monotonicity on the happy path.
// ---------------------------------------------------------------------
#[tokio::test]
async fn stages_advance_monotonically_on_the_happy_path() {
    let harness = spawn_pipeline(
        MockProvider::new(),
        ExecutionMode::Autonomous,
        0,
        "Add getUserById(int) to UserService",
        None,
        None,
    )
    .await;
    let events = drain(&harness.bus).await;

    assert!(!events.is_empty());
    let mut previous = 0;
    for event in &events {
        let rank = stage_rank(event.stage);
        assert!(
            rank >= previous,
            "stage went backwards: {:?} after rank {previous}",
            event.stage
        );
        previous = rank;
    }

    let snapshot = harness.store.snapshot("session_test").await.unwrap();
    assert_eq!(snapshot.stage, PipelineStage::Complete);
    assert_eq!(snapshot.status, PipelineStatus::Completed);
}

// ---------------------------------------------------------------------
// Property 2 / scenario E3: retry bound and terminal failed stage.
// ---------------------------------------------------------------------
#[tokio::test]
async fn retry_count_never_exceeds_max_retries() {
    let mut provider = MockProvider::new().with_failing_validation(10);
    provider.validator_default = false;
    provider.retry_action = "retry".to_string();

    let harness = spawn_pipeline(
        provider,
        ExecutionMode::Autonomous,
        2,
        "Add a Spring @Service annotation",
        None,
        None,
    )
    .await;
    let events = drain(&harness.bus).await;

    let snapshot = harness.store.snapshot("session_test").await.unwrap();
    assert_eq!(snapshot.retry_count, 2);
    assert_eq!(snapshot.stage, PipelineStage::Failed);
    assert!(!snapshot.validation_passed);

    // The failed result still reaches the subscriber as pipeline_completed.
    let completed = events
        .iter()
        .find(|e| e.event_type.as_deref() == Some("pipeline_completed"))
        .expect("pipeline_completed event");
    let validation = completed
        .data
        .as_ref()
        .and_then(|d| d.get("validation_result"))
        .expect("validation result payload");
    assert_eq!(validation["passed"], serde_json::json!(false));
}

// ---------------------------------------------------------------------
// Scenario E2: one retry then success.
// ---------------------------------------------------------------------
#[tokio::test]
async fn retry_then_success_completes_with_one_retry() {
    let mut provider = MockProvider::new().with_failing_validation(1);
    provider.retry_action = "retry".to_string();

    let harness = spawn_pipeline(
        provider,
        ExecutionMode::Autonomous,
        3,
        "Add a Spring @Service annotation to UserService",
        None,
        None,
    )
    .await;
    drain(&harness.bus).await;

    let snapshot = harness.store.snapshot("session_test").await.unwrap();
    assert_eq!(snapshot.retry_count, 1);
    assert_eq!(snapshot.stage, PipelineStage::Complete);
    assert!(snapshot.validation_passed);
}

// ---------------------------------------------------------------------
// Property 3: a transformation failure restores the prior tree.
// ---------------------------------------------------------------------
#[tokio::test]
async fn failed_transformation_restores_the_working_tree() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    std::fs::create_dir_all(root.join("src/main/java/com/example")).unwrap();
    let existing = root.join("src/main/java/com/example/Existing.java");
    std::fs::write(&existing, "public class Existing { /* pristine */ }").unwrap();

    // Stream one created file and one modification, then explode.
    let prefix = serde_json::json!({
        "changes": [
            {
                "file_path": "src/main/java/com/example/Fresh.java",
                "change_type": "created",
                "modified_content": "public class Fresh {}",
                "diff": "", "lines_added": 0, "lines_removed": 0,
                "imports_added": [], "methods_added": [], "annotations_added": []
            },
            {
                "file_path": "src/main/java/com/example/Existing.java",
                "change_type": "modified",
                "modified_content": "public class Existing { /* clobbered */ }",
                "diff": "", "lines_added": 0, "lines_removed": 0,
                "imports_added": [], "methods_added": [], "annotations_added": []
            }
        ]
    })
    .to_string();

    let mut provider = MockProvider::new();
    provider.stream_emit_then_fail = Some(prefix);

    let harness = spawn_pipeline(
        provider,
        ExecutionMode::Autonomous,
        0,
        "Modify Existing",
        Some(root.clone()),
        None,
    )
    .await;
    drain(&harness.bus).await;

    let snapshot = harness.store.snapshot("session_test").await.unwrap();
    assert_eq!(snapshot.stage, PipelineStage::Failed);

    // Byte-identical pre-transformation tree: the modification reverted
    // and the created file removed.
    assert_eq!(
        std::fs::read_to_string(&existing).unwrap(),
        "public class Existing { /* pristine */ }"
    );
    assert!(!root.join("src/main/java/com/example/Fresh.java").exists());
}

// ---------------------------------------------------------------------
// Property 4: unsafe paths are never applied; the stage continues.
// ---------------------------------------------------------------------
#[tokio::test]
async fn unsafe_paths_are_rejected_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    std::fs::create_dir_all(&root).unwrap();

    let doc = serde_json::json!({
        "changes": [
            {
                "file_path": "../evil.java",
                "change_type": "created",
                "modified_content": "pwned",
                "diff": "", "lines_added": 0, "lines_removed": 0,
                "imports_added": [], "methods_added": [], "annotations_added": []
            },
            {
                "file_path": "src/main/java/com/example/Good.java",
                "change_type": "created",
                "modified_content": "public class Good {}",
                "diff": "", "lines_added": 0, "lines_removed": 0,
                "imports_added": [], "methods_added": [], "annotations_added": []
            }
        ]
    })
    .to_string();

    let mut provider = MockProvider::new();
    provider.stream_override = Some(doc);
    provider.validator_default = false;

    let harness = spawn_pipeline(
        provider,
        ExecutionMode::Autonomous,
        0,
        "Add a class",
        Some(root.clone()),
        None,
    )
    .await;
    drain(&harness.bus).await;

    assert!(!dir.path().join("evil.java").exists());
    assert!(root.join("src/main/java/com/example/Good.java").exists());

    let state = harness.session.read().await;
    assert!(
        state.warnings.iter().any(|w| w.contains("evil.java")),
        "rejected path recorded as a warning: {:?}",
        state.warnings
    );
    let changes = state.code_changes.as_ref().unwrap();
    assert!(changes.changes.iter().all(|c| c.file_path != "../evil.java"));
}

// ---------------------------------------------------------------------
// Property 5: a late subscriber replays the full history in order.
// ---------------------------------------------------------------------
#[tokio::test]
async fn late_subscriber_sees_full_history_then_sentinel() {
    let harness = spawn_pipeline(
        MockProvider::new(),
        ExecutionMode::Autonomous,
        0,
        "Add a feature",
        None,
        None,
    )
    .await;

    // Wait for the worker to finish before attaching.
    for _ in 0..300 {
        let snapshot = harness.store.snapshot("session_test").await.unwrap();
        if snapshot.stage.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let events = drain(&harness.bus).await;
    assert!(events.len() >= 5, "expected replayed history, got {}", events.len());
    assert!(events.first().unwrap().message.contains("Starting pipeline"));
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type.as_deref() == Some("pipeline_completed"))
            .count(),
        1
    );
}

// ---------------------------------------------------------------------
// Property 7: token-limit batches halve and every file applies once.
// ---------------------------------------------------------------------
#[tokio::test]
async fn token_limited_batches_degrade_and_apply_each_file_once() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    std::fs::create_dir_all(&root).unwrap();

    let mut provider = MockProvider::new();
    provider.plan_steps = 4;
    provider.stream_step_limit = Some(2);
    provider.validator_default = false;

    let harness = spawn_pipeline(
        provider,
        ExecutionMode::Autonomous,
        0,
        "Create four classes",
        Some(root.clone()),
        None,
    )
    .await;
    let events = drain(&harness.bus).await;

    for n in 1..=4 {
        assert!(
            root.join(format!("src/main/java/com/example/F{n}.java")).exists(),
            "F{n}.java applied"
        );
    }
    let state = harness.session.read().await;
    let changes = state.code_changes.as_ref().unwrap();
    assert_eq!(changes.total_changes(), 4);
    let mut paths: Vec<&str> = changes.changes.iter().map(|c| c.file_path.as_str()).collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 4, "each file applied exactly once");

    // The oversized batch fails and splits; each successful sub-batch is
    // framed by started/completed events.
    let started = events
        .iter()
        .filter(|e| e.event_type.as_deref() == Some("batch_started"))
        .count();
    let completed = events
        .iter()
        .filter(|e| e.event_type.as_deref() == Some("batch_completed"))
        .count();
    assert_eq!(completed, 2, "two sub-batches completed");
    assert_eq!(started, 3, "the failed batch plus two sub-batches started");

    // file events land between their batch frames.
    let file_events = events
        .iter()
        .filter(|e| e.event_type.as_deref() == Some("file_created"))
        .count();
    assert_eq!(file_events, 4);
}

// ---------------------------------------------------------------------
// Property 8 / scenario E4: ambiguous replies clarify; modify re-plans.
// ---------------------------------------------------------------------
#[tokio::test]
async fn plan_gate_modify_replans_and_low_confidence_clarifies() {
    let provider = MockProvider::new();
    {
        let mut decisions = provider.plan_decisions.lock().unwrap();
        // First reply: ambiguous, low confidence -> clarify (stay paused).
        decisions.push_back(
            serde_json::json!({
                "action": "approve",
                "reasoning": "not sure",
                "confidence": 0.4,
                "modifications": null
            })
            .to_string(),
        );
        // Second reply: modify with concrete instructions.
        decisions.push_back(
            serde_json::json!({
                "action": "modify",
                "reasoning": "user wants caching",
                "confidence": 0.95,
                "modifications": "also add a cache using Redis"
            })
            .to_string(),
        );
    }

    let harness = spawn_pipeline(
        provider,
        ExecutionMode::InteractiveDetailed,
        0,
        "Refactor the user service",
        None,
        None,
    )
    .await;
    let channel = harness.confirmations.clone().unwrap();
    let mut rx = harness.bus.subscribe();

    let mut plan_ready_seen = 0;
    let mut clarification_seen = 0;
    let mut events = Vec::new();
    loop {
        let item = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("event before timeout");
        match item {
            Some(Some(event)) => {
                match event.event_type.as_deref() {
                    Some("plan_ready") => {
                        plan_ready_seen += 1;
                        // While paused, the session reports the awaiting state.
                        let snapshot = harness.store.snapshot("session_test").await.unwrap();
                        assert_eq!(
                            snapshot.awaiting_confirmation,
                            Some(refactory_core::ConfirmationKind::Plan)
                        );
                        let reply = if plan_ready_seen == 1 {
                            "hmm maybe"
                        } else {
                            "looks good but also add a cache using Redis"
                        };
                        // The second plan_ready (after modify) gets a
                        // structured approval instead.
                        if plan_ready_seen == 3 {
                            channel
                                .try_deliver(ConfirmationPayload::Plan {
                                    action: "approve".into(),
                                    modifications: None,
                                })
                                .unwrap();
                        } else {
                            channel
                                .try_deliver(ConfirmationPayload::Reply {
                                    user_response: reply.into(),
                                })
                                .unwrap();
                        }
                    }
                    Some("clarification_needed") => {
                        clarification_seen += 1;
                        // Session remains in the awaiting state after a
                        // clarify; the gate re-publishes plan_ready, which
                        // is where the next reply goes.
                        let snapshot = harness.store.snapshot("session_test").await.unwrap();
                        assert_eq!(
                            snapshot.awaiting_confirmation,
                            Some(refactory_core::ConfirmationKind::Plan)
                        );
                    }
                    Some("validation_ready") => {
                        channel
                            .try_deliver(ConfirmationPayload::Validation {
                                validation_mode: "skip".into(),
                            })
                            .unwrap();
                    }
                    Some("push_ready") => {
                        channel
                            .try_deliver(ConfirmationPayload::Push {
                                action: "approve".into(),
                                branch_name_override: None,
                                commit_message_override: None,
                            })
                            .unwrap();
                    }
                    _ => {}
                }
                events.push(event);
            }
            Some(None) | None => break,
        }
    }

    assert!(clarification_seen >= 1, "ambiguous reply produced a clarification");
    assert!(plan_ready_seen >= 2, "modify produced a second plan_ready");

    let state = harness.session.read().await;
    let job_spec = state.job_spec.as_ref().unwrap();
    assert!(
        job_spec.requirements.iter().any(|r| r.contains("Redis")),
        "modification instructions appended to requirements: {:?}",
        job_spec.requirements
    );
    assert_eq!(state.stage, PipelineStage::Complete);
}

// ---------------------------------------------------------------------
// Property 9 / scenario E6: conversational input short-circuits.
// ---------------------------------------------------------------------
#[tokio::test]
async fn conversational_input_short_circuits_with_one_event() {
    let harness = spawn_pipeline(
        MockProvider::new(),
        ExecutionMode::Autonomous,
        0,
        "hi",
        None,
        None,
    )
    .await;
    let events = drain(&harness.bus).await;

    assert_eq!(events.len(), 1, "exactly one progress event: {events:#?}");
    let snapshot = harness.store.snapshot("session_test").await.unwrap();
    assert_eq!(snapshot.stage, PipelineStage::Complete);
    assert_eq!(snapshot.retry_count, 0);

    // No repository work happened.
    let state = harness.session.read().await;
    assert!(state.repo_root.is_none());
    assert!(state.backup_dir.is_none());
    assert!(state.job_spec.is_none());
}

// ---------------------------------------------------------------------
// Property 10: factual build results override the model's judgment.
// ---------------------------------------------------------------------
#[tokio::test]
async fn validation_annotation_reflects_real_build_results() {
    // Repository with no build manifest: the factual compile result is a
    // synthetic failure, whatever the validator model claims.
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    std::fs::create_dir_all(&root).unwrap();

    let provider = MockProvider::new(); // validator says passed=true

    let harness = spawn_pipeline(
        provider,
        ExecutionMode::Autonomous,
        0,
        "Add a class",
        Some(root),
        None,
    )
    .await;
    drain(&harness.bus).await;

    let state = harness.session.read().await;
    let validation = state.validation_result.as_ref().unwrap();
    assert!(!validation.compilation_passed);
    assert!(!validation.passed);
    assert!(validation.checks.contains_key("maven_compile"));
}

// ---------------------------------------------------------------------
// Confirmation timeout fails the session.
// ---------------------------------------------------------------------
#[tokio::test]
async fn plan_confirmation_timeout_fails_the_session() {
    let mut config = refactory_config::Config::default();
    config.pipeline.confirmation_timeout_secs = 1;

    let harness = spawn_pipeline(
        MockProvider::new(),
        ExecutionMode::InteractiveDetailed,
        0,
        "Refactor the user service",
        None,
        Some(config),
    )
    .await;
    let events = drain(&harness.bus).await;

    let snapshot = harness.store.snapshot("session_test").await.unwrap();
    assert_eq!(snapshot.stage, PipelineStage::Failed);
    assert_eq!(snapshot.status, PipelineStatus::Failed);
    assert!(snapshot
        .errors
        .iter()
        .any(|e| e.contains("confirmation timeout")));
    assert!(events
        .iter()
        .any(|e| e.event_type.as_deref() == Some("error")));
}
