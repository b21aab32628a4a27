use anyhow::Result;
use futures::StreamExt;
use refactory_provider::{CallOpts, ModelRole, ModelRouter};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agents::prompts::{
    CAPABILITIES_REPLY, CONVERSATIONAL_CLASSIFIER_PROMPT, GREETING_REPLY,
    ORCHESTRATOR_SYSTEM_PROMPT, PLAN_INTENT_INSTRUCTIONS, PUSH_INTENT_INSTRUCTIONS,
    RETRY_STRATEGY_INSTRUCTIONS, THANKS_REPLY, VALIDATION_INTENT_INSTRUCTIONS,
};
use crate::agents::validator::ValidationMode;
use crate::model::{DecisionAction, OrchestratorDecision};

/// Below this confidence a plan/push interpretation degrades to clarify.
pub const CLARIFY_THRESHOLD: f64 = 0.7;

/// Presence of any of these marks the input as a refactoring request and
/// skips the conversational checks entirely.
const REFACTORING_KEYWORDS: &[&str] = &[
    "refactor", "add", "create", "implement", "modify", "change", "update", "migrate",
    "upgrade", "fix", "improve", "extract", "rename", "move", "delete", "remove", "replace",
    "optimize", "enhance", "class", "method", "function", "code", "repository", "service",
    "controller", "module", "component", "file", "package", "dependency", "test", "junit",
    "spring", "encapsulation", "readability", "behaviour", "validation", "register",
];

const GREETINGS: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "good morning",
    "good afternoon",
    "good evening",
    "greetings",
];

const CAPABILITY_PHRASES: &[&str] = &[
    "what can you do",
    "what do you do",
    "help me",
    "how does this work",
    "what are you",
    "who are you",
    "capabilities",
];

const THANKS_PHRASES: &[&str] = &["thanks", "thank you", "bye", "goodbye"];

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn has_refactoring_keyword(lower: &str) -> bool {
    REFACTORING_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Fast-path classification without a model call. `Some(reply)` means the
/// input is conversational and the reply should be sent as-is.
pub fn classify_conversational_fast(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    let lower = lower.trim();
    if has_refactoring_keyword(lower) {
        return None;
    }

    let words = word_count(text);
    if words < 5
        && GREETINGS
            .iter()
            .any(|g| lower == *g || lower.starts_with(&format!("{g} ")))
    {
        return Some(GREETING_REPLY);
    }
    if words < 15 && CAPABILITY_PHRASES.iter().any(|p| lower.contains(p)) {
        return Some(CAPABILITIES_REPLY);
    }
    if words < 5 && THANKS_PHRASES.iter().any(|p| lower.contains(p)) {
        return Some(THANKS_REPLY);
    }
    None
}

/// Full classification: fast path first, then the orchestrator model for
/// short ambiguous inputs only. Long inputs are always treated as
/// refactoring requests; so is anything the model call fails on.
pub async fn classify_conversational(router: &ModelRouter, text: &str) -> Option<String> {
    if let Some(reply) = classify_conversational_fast(text) {
        return Some(reply.to_string());
    }
    if has_refactoring_keyword(&text.to_lowercase()) || word_count(text) >= 10 {
        return None;
    }

    let prompt = format!("{CONVERSATIONAL_CLASSIFIER_PROMPT}\n\n**User input:** \"{text}\"");
    match router
        .complete_text(
            ModelRole::Orchestrator,
            None,
            &prompt,
            CallOpts {
                temperature: Some(0.1),
                max_tokens: Some(10),
            },
        )
        .await
    {
        Ok(answer) if answer.to_uppercase().contains("CONVERSATIONAL") => {
            debug!("model classified input as conversational");
            Some(GREETING_REPLY.to_string())
        }
        Ok(_) => None,
        Err(e) => {
            // When in doubt, run the pipeline.
            warn!(error = %e, "Conversational classification failed; assuming request");
            None
        }
    }
}

async fn decide(
    router: &ModelRouter,
    instructions: &str,
    context: &str,
    user_response: &str,
    max_tokens: u32,
) -> Result<OrchestratorDecision> {
    let prompt = format!(
        "{context}\n\n**User response:**\n\"{user_response}\"\n\n{instructions}\n\n\
         Output a single OrchestratorDecision JSON object."
    );
    router
        .complete_json(
            ModelRole::Orchestrator,
            Some(ORCHESTRATOR_SYSTEM_PROMPT),
            &prompt,
            CallOpts {
                temperature: Some(0.2),
                max_tokens: Some(max_tokens),
            },
        )
        .await
}

/// Interpret a free-form reply at the plan gate.
pub async fn interpret_plan_reply(
    router: &ModelRouter,
    user_response: &str,
    plan_summary: &str,
) -> OrchestratorDecision {
    let context = format!("**Refactor plan summary:**\n{plan_summary}");
    let mut decision = match decide(
        router,
        PLAN_INTENT_INSTRUCTIONS,
        &context,
        user_response,
        1024,
    )
    .await
    {
        Ok(decision) => decision,
        Err(e) => {
            warn!(error = %e, "Plan intent interpretation failed");
            return OrchestratorDecision::fallback(
                DecisionAction::Clarify,
                0.0,
                format!("Failed to interpret response: {e}"),
            );
        }
    };

    // The plan gate only knows approve/modify/abort/clarify.
    decision.action = match decision.action {
        DecisionAction::Cancel => DecisionAction::Abort,
        DecisionAction::Approve | DecisionAction::Modify | DecisionAction::Abort => decision.action,
        _ => DecisionAction::Clarify,
    };
    if decision.confidence < CLARIFY_THRESHOLD {
        decision.action = DecisionAction::Clarify;
    }
    if decision.action == DecisionAction::Modify && decision.modifications.is_none() {
        decision.action = DecisionAction::Clarify;
    }
    info!(action = %decision.action, confidence = decision.confidence, "Plan reply interpreted");
    decision
}

/// Extract `branch:` from a modifications blob, with legacy-phrase
/// fallbacks.
pub fn extract_branch_override(modifications: &str) -> Option<String> {
    let lower = modifications.to_lowercase();
    if let Some(idx) = lower.find("branch:") {
        let value = modifications[idx + "branch:".len()..]
            .lines()
            .next()?
            .trim()
            .trim_matches('"')
            .trim_matches('\'');
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    for phrase in ["branch name:", "use branch"] {
        if let Some(idx) = lower.find(phrase) {
            let value = modifications[idx + phrase.len()..]
                .split_whitespace()
                .next()?
                .trim_matches('"')
                .trim_matches('\'');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Extract `commit_message:` from a modifications blob, with legacy-phrase
/// fallbacks.
pub fn extract_message_override(modifications: &str) -> Option<String> {
    let lower = modifications.to_lowercase();
    if let Some(idx) = lower.find("commit_message:") {
        let value = modifications[idx + "commit_message:".len()..]
            .lines()
            .next()?
            .trim()
            .trim_matches('"')
            .trim_matches('\'');
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    for phrase in ["commit message:", "message:", "use message"] {
        if let Some(idx) = lower.find(phrase) {
            let value = modifications[idx + phrase.len()..]
                .lines()
                .next()?
                .trim()
                .trim_matches('"')
                .trim_matches('\'');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Decision plus any branch/message overrides for the push gate.
#[derive(Debug, Clone)]
pub struct PushInterpretation {
    pub decision: OrchestratorDecision,
    pub branch_override: Option<String>,
    pub message_override: Option<String>,
}

/// Interpret a free-form reply at the push gate.
pub async fn interpret_push_reply(
    router: &ModelRouter,
    user_response: &str,
    push_summary: &str,
) -> PushInterpretation {
    let context = format!("**Push summary:**\n{push_summary}");
    let mut decision = match decide(
        router,
        PUSH_INTENT_INSTRUCTIONS,
        &context,
        user_response,
        512,
    )
    .await
    {
        Ok(decision) => decision,
        Err(e) => {
            warn!(error = %e, "Push intent interpretation failed");
            return PushInterpretation {
                decision: OrchestratorDecision::fallback(
                    DecisionAction::Clarify,
                    0.0,
                    format!("Failed to interpret response: {e}"),
                ),
                branch_override: None,
                message_override: None,
            };
        }
    };

    decision.action = match decision.action {
        DecisionAction::Abort => DecisionAction::Cancel,
        DecisionAction::Approve | DecisionAction::Cancel => decision.action,
        _ => DecisionAction::Clarify,
    };
    if decision.confidence < CLARIFY_THRESHOLD {
        decision.action = DecisionAction::Clarify;
    }

    let (branch_override, message_override) = decision
        .modifications
        .as_deref()
        .map(|mods| (extract_branch_override(mods), extract_message_override(mods)))
        .unwrap_or((None, None));

    info!(
        action = %decision.action,
        branch = ?branch_override,
        message = ?message_override,
        "Push reply interpreted"
    );
    PushInterpretation {
        decision,
        branch_override,
        message_override,
    }
}

/// Interpret a free-form reply at the validation gate; always resolves to
/// a concrete mode, defaulting to full.
pub async fn interpret_validation_reply(
    router: &ModelRouter,
    user_response: &str,
    validation_summary: &str,
) -> ValidationMode {
    let context = format!("**Validation options:**\n{validation_summary}");
    let decision = match decide(
        router,
        VALIDATION_INTENT_INSTRUCTIONS,
        &context,
        user_response,
        256,
    )
    .await
    {
        Ok(decision) => decision,
        Err(e) => {
            warn!(error = %e, "Validation intent interpretation failed; defaulting to full");
            return ValidationMode::Full;
        }
    };

    let mode = decision
        .modifications
        .as_deref()
        .map(|mods| {
            let lower = mods.to_lowercase();
            if lower.contains("skip") {
                ValidationMode::Skip
            } else if lower.contains("compile") && lower.contains("only") {
                ValidationMode::CompileOnly
            } else {
                ValidationMode::Full
            }
        })
        .unwrap_or(ValidationMode::Full);
    info!(%mode, "Validation reply interpreted");
    mode
}

/// Choose a recovery strategy for a failed validation. The decision is
/// streamed when possible; each reasoning snapshot is forwarded through
/// `reasoning_sink` so the transport can surface live analysis.
pub async fn decide_retry_strategy(
    router: &ModelRouter,
    error_digest: &str,
    intent: &str,
    retry_count: u32,
    max_retries: u32,
    reasoning_sink: Option<mpsc::UnboundedSender<String>>,
) -> OrchestratorDecision {
    let prompt = format!(
        "**Validation errors:**\n{error_digest}\n\n**Retry context:**\n\
         - Current attempt: {}/{max_retries}\n- Previous attempts: {retry_count}\n\n\
         **Original intent:** {intent}\n\n{RETRY_STRATEGY_INSTRUCTIONS}\n\n\
         Output a single OrchestratorDecision JSON object.",
        retry_count + 1,
    );

    let stream = router
        .stream_json::<OrchestratorDecision>(
            ModelRole::Orchestrator,
            Some(ORCHESTRATOR_SYSTEM_PROMPT),
            &prompt,
            CallOpts {
                temperature: Some(0.2),
                max_tokens: Some(4096),
            },
        )
        .await;

    let mut last: Option<OrchestratorDecision> = None;
    match stream {
        Ok(mut partials) => {
            let mut last_reasoning_len = 0usize;
            while let Some(partial) = partials.next().await {
                match partial {
                    Ok(decision) => {
                        if decision.reasoning.len() > last_reasoning_len {
                            last_reasoning_len = decision.reasoning.len();
                            if let Some(sink) = &reasoning_sink {
                                let _ = sink.send(decision.reasoning.clone());
                            }
                        }
                        last = Some(decision);
                    }
                    Err(e) => {
                        warn!(error = %e, "Retry strategy stream failed mid-flight");
                        break;
                    }
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "Retry strategy stream failed to open");
        }
    }

    let mut decision = match last {
        Some(decision) => decision,
        None => OrchestratorDecision::fallback(
            DecisionAction::Abort,
            0.5,
            "Failed to analyze validation errors",
        ),
    };

    decision.action = match decision.action {
        DecisionAction::Retry
        | DecisionAction::Modify
        | DecisionAction::Abort
        | DecisionAction::Escalate => decision.action,
        // Anything else is not a retry strategy; stop cleanly.
        _ => DecisionAction::Abort,
    };
    info!(
        action = %decision.action,
        confidence = decision.confidence,
        success_probability = ?decision.estimated_success_probability,
        "Retry strategy decided"
    );
    decision
}
