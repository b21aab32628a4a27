//! A scripted provider standing in for the LLM backends, plus helpers for
//! wiring a pipeline against it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use refactory_provider::{
    ChatRequest, ChatResponse, ModelRole, ModelRouter, ModelSpec, Provider, ProviderError,
    StreamEvent,
};

/// Deterministic provider: answers are derived from the calling agent's
/// system prompt and a small amount of per-test scripting.
#[derive(Default)]
pub struct MockProvider {
    /// Steps the scripted plan contains.
    pub plan_steps: usize,
    /// Per-call validator verdicts, popped front; empty falls back to
    /// `validator_default`.
    pub validator_results: Mutex<VecDeque<bool>>,
    pub validator_default: bool,
    /// Raw decision JSON popped per plan-gate interpretation.
    pub plan_decisions: Mutex<VecDeque<String>>,
    /// Action the retry-strategy decision reports.
    pub retry_action: String,
    /// Confidence reported for plan/push interpretations without scripts.
    pub decision_confidence: f64,
    /// Streamed calls whose prompt contains more step headers than this
    /// fail with a context-overflow error.
    pub stream_step_limit: Option<usize>,
    /// Full ChangeSet JSON to stream instead of deriving from the prompt.
    pub stream_override: Option<String>,
    /// Raw text emitted as a single delta before the stream errors out.
    pub stream_emit_then_fail: Option<String>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            plan_steps: 1,
            validator_results: Mutex::new(VecDeque::new()),
            validator_default: true,
            plan_decisions: Mutex::new(VecDeque::new()),
            retry_action: "abort".to_string(),
            decision_confidence: 0.9,
            stream_step_limit: None,
            stream_override: None,
            stream_emit_then_fail: None,
        }
    }

    pub fn with_failing_validation(self, times: usize) -> Self {
        {
            let mut script = self.validator_results.lock().unwrap();
            for _ in 0..times {
                script.push_back(false);
            }
        }
        self
    }

    fn intake_json(&self) -> String {
        serde_json::json!({
            "job_id": "job_scripted",
            "intent": "add_feature",
            "scope": {
                "target_files": ["src/main/java/**/*.java"],
                "target_packages": ["com.example"],
                "target_modules": [],
                "language": "java",
                "build_system": "maven",
                "exclude_patterns": ["**/target/**"]
            },
            "requirements": ["Implement the requested change"],
            "constraints": []
        })
        .to_string()
    }

    fn plan_json(&self) -> String {
        let steps: Vec<serde_json::Value> = (1..=self.plan_steps.max(1))
            .map(|n| {
                serde_json::json!({
                    "step_number": n,
                    "action": "create_class",
                    "target_files": [format!("src/main/java/com/example/F{n}.java")],
                    "target_classes": [format!("F{n}")],
                    "description": format!("Create class F{n}"),
                    "dependencies": [],
                    "risk_level": 2,
                    "estimated_minutes": 10
                })
            })
            .collect();
        serde_json::json!({
            "plan_id": "plan_scripted",
            "job_id": "job_scripted",
            "steps": steps,
            "risk_assessment": {
                "overall_risk_level": 3,
                "breaking_changes": false,
                "compilation_risk": false,
                "affected_modules": ["com.example"],
                "mitigation_strategies": ["Cover every new method with unit tests"]
            },
            "estimated_duration": "30 minutes"
        })
        .to_string()
    }

    fn validation_json(&self) -> String {
        let passed = self
            .validator_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.validator_default);
        serde_json::json!({
            "plan_id": "plan_scripted",
            "passed": passed,
            "compilation_passed": passed,
            "checks": {
                "static_review": {
                    "check_name": "static_review",
                    "passed": passed,
                    "issues": if passed { vec![] } else {
                        vec!["cannot find symbol: class Service".to_string()]
                    },
                    "compilation_errors": [],
                    "code_quality_score": 8.0
                }
            },
            "test_coverage": 0.8,
            "junit_test_results": null,
            "security_vulnerabilities": [],
            "confidence": {
                "overall_confidence": 0.9,
                "reasoning_quality": 0.9,
                "code_safety": 0.9,
                "test_coverage": 0.8
            },
            "recommendations": []
        })
        .to_string()
    }

    fn narrator_json(&self) -> String {
        serde_json::json!({
            "plan_id": "plan_scripted",
            "title": "feat: add requested feature",
            "summary": "Implements the requested change across the target classes.",
            "changes_by_file": {},
            "breaking_changes": [],
            "migration_guide": null,
            "testing_notes": "Validated by the pipeline."
        })
        .to_string()
    }

    fn decision_json(&self, action: &str, modifications: Option<&str>) -> String {
        serde_json::json!({
            "action": action,
            "reasoning": "scripted decision",
            "confidence": self.decision_confidence,
            "modifications": modifications,
            "next_step": null,
            "estimated_success_probability": 0.8
        })
        .to_string()
    }

    fn orchestrator_response(&self, prompt: &str) -> String {
        if prompt.contains("Decide what the user wants done with the proposed plan") {
            if let Some(scripted) = self.plan_decisions.lock().unwrap().pop_front() {
                return scripted;
            }
            return self.decision_json("approve", None);
        }
        if prompt.contains("Decide whether the user approves pushing") {
            return self.decision_json("approve", None);
        }
        if prompt.contains("Decide which validation level") {
            return self.decision_json("approve", Some("full"));
        }
        if prompt.contains("Choose the recovery strategy") {
            return self.decision_json(&self.retry_action, Some("add the missing import"));
        }
        self.decision_json("clarify", None)
    }

    fn changes_for_prompt(&self, prompt: &str) -> String {
        if let Some(doc) = &self.stream_override {
            return doc.clone();
        }
        let step_re = regex::Regex::new(r"\*\*Step (\d+) of").unwrap();
        let changes: Vec<serde_json::Value> = step_re
            .captures_iter(prompt)
            .map(|caps| {
                let n = &caps[1];
                serde_json::json!({
                    "file_path": format!("src/main/java/com/example/F{n}.java"),
                    "change_type": "created",
                    "original_content": null,
                    "modified_content": format!("package com.example;\n\npublic class F{n} {{\n}}\n"),
                    "diff": "",
                    "lines_added": 0,
                    "lines_removed": 0,
                    "class_name": format!("F{n}"),
                    "package_name": "com.example",
                    "imports_added": [],
                    "methods_added": [],
                    "annotations_added": []
                })
            })
            .collect();
        serde_json::json!({ "changes": changes }).to_string()
    }

    fn respond(&self, request: &ChatRequest) -> Result<String> {
        let system = request.system.as_deref().unwrap_or("");
        let prompt = request
            .messages
            .first()
            .map(|m| m.content.as_str())
            .unwrap_or("");

        let content = if system.contains("intake analyst") {
            self.intake_json()
        } else if system.contains("planning engineer") {
            self.plan_json()
        } else if system.contains("validation engineer") {
            self.validation_json()
        } else if system.contains("release narrator") {
            self.narrator_json()
        } else if system.contains("orchestrator of an automated refactoring") {
            self.orchestrator_response(prompt)
        } else if system.contains("code generation engine") {
            // Blocking transformer calls are targeted fixes.
            self.changes_for_prompt("**Step 1 of 1")
        } else if prompt.contains("Classify the user input") {
            "REFACTORING".to_string()
        } else if prompt.contains("Analyze these Java validation errors") {
            "Create the missing class and update the import.".to_string()
        } else {
            "ok".to_string()
        };
        Ok(content)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let content = self.respond(request)?;
        Ok(ChatResponse {
            content,
            usage: None,
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let system = request.system.as_deref().unwrap_or("");
        let prompt = request
            .messages
            .first()
            .map(|m| m.content.as_str())
            .unwrap_or("")
            .to_string();

        if system.contains("code generation engine") {
            if let Some(limit) = self.stream_step_limit {
                let headers = prompt.matches("**Step ").count();
                if headers > limit {
                    return Err(ProviderError::ContextOverflow(
                        "request exceeds the model token limit".to_string(),
                    )
                    .into());
                }
            }
            if let Some(prefix) = &self.stream_emit_then_fail {
                let prefix = prefix.clone();
                let events: Vec<Result<StreamEvent>> = vec![
                    Ok(StreamEvent::TextDelta(prefix)),
                    Err(anyhow::anyhow!("provider exploded mid-stream")),
                ];
                return Ok(Box::pin(futures::stream::iter(events)));
            }
            let doc = self.changes_for_prompt(&prompt);
            return Ok(stream_text(doc));
        }

        // Other roles stream their blocking answer in chunks.
        let content = self.respond(request)?;
        Ok(stream_text(content))
    }
}

fn stream_text(content: String) -> BoxStream<'static, Result<StreamEvent>> {
    let mut events: Vec<Result<StreamEvent>> = Vec::new();
    let chars: Vec<char> = content.chars().collect();
    for chunk in chars.chunks(17) {
        events.push(Ok(StreamEvent::TextDelta(chunk.iter().collect())));
    }
    events.push(Ok(StreamEvent::Done));
    Box::pin(futures::stream::iter(events))
}

/// Router whose every role resolves to the single mock provider.
pub fn mock_router(provider: Arc<MockProvider>) -> Arc<ModelRouter> {
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("mock".to_string(), provider);

    let mut table = HashMap::new();
    for role in [
        ModelRole::Intake,
        ModelRole::Planner,
        ModelRole::Coder,
        ModelRole::PrNarrator,
        ModelRole::Orchestrator,
        ModelRole::Embedding,
    ] {
        table.insert(role, vec![ModelSpec::new("mock", "mock-model")]);
    }
    Arc::new(ModelRouter::new(providers, table))
}
