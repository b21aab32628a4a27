use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::partial::parse_partial_json;
use crate::types::*;
use crate::{create_default_providers, Provider};

/// Per-call overrides on top of a role's spec defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOpts {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Role-based multiplexer over the configured providers. Each role maps to
/// an ordered list of model specs; fallback-enabled calls walk the list and
/// return the first valid output, failing with the last error only after
/// the list is exhausted.
pub struct ModelRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    table: HashMap<ModelRole, Vec<ModelSpec>>,
}

impl ModelRouter {
    pub fn new(
        providers: HashMap<String, Arc<dyn Provider>>,
        table: HashMap<ModelRole, Vec<ModelSpec>>,
    ) -> Self {
        Self { providers, table }
    }

    pub fn from_config(config: &refactory_config::Config) -> Self {
        Self::new(create_default_providers(config), build_route_table(config))
    }

    pub fn specs(&self, role: ModelRole) -> &[ModelSpec] {
        self.table.get(&role).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Primary model spec for a role.
    pub fn spec(&self, role: ModelRole) -> Result<&ModelSpec> {
        self.specs(role)
            .first()
            .ok_or_else(|| anyhow::anyhow!("No model specs configured for role: {role}"))
    }

    pub fn model_id(&self, role: ModelRole) -> String {
        self.spec(role)
            .map(|s| s.model_id.clone())
            .unwrap_or_default()
    }

    fn provider_for(&self, spec: &ModelSpec) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(&spec.provider)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No provider registered for '{}'", spec.provider))
    }

    fn build_request(
        &self,
        spec: &ModelSpec,
        system: Option<&str>,
        prompt: &str,
        opts: CallOpts,
        json_mode: bool,
    ) -> ChatRequest {
        let mut request = ChatRequest::new(&spec.model_id);
        request.system = system.map(|s| s.to_string());
        request.messages = vec![Message::user(prompt)];
        request.temperature = Some(opts.temperature.unwrap_or(spec.temperature));
        request.max_tokens = Some(opts.max_tokens.unwrap_or(spec.max_output_tokens));
        request.json_mode = json_mode || spec.json_mode;
        request
    }

    /// Blocking text completion with ordered fallback.
    pub async fn complete_text(
        &self,
        role: ModelRole,
        system: Option<&str>,
        prompt: &str,
        opts: CallOpts,
    ) -> Result<String> {
        let mut last_err: Option<anyhow::Error> = None;
        for spec in self.specs(role) {
            let provider = match self.provider_for(spec) {
                Ok(p) => p,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let request = self.build_request(spec, system, prompt, opts, false);
            match provider.chat(&request).await {
                Ok(response) => {
                    debug!(role = %role, model = %spec.model_id, "text completion ok");
                    return Ok(response.content);
                }
                Err(e) => {
                    warn!(role = %role, model = %spec.model_id, error = %e, "model failed, trying next");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("No model specs for role: {role}")))
    }

    /// Blocking JSON completion, deserialized into `T`, with ordered
    /// fallback. A response that fails to parse counts as a model failure.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        role: ModelRole,
        system: Option<&str>,
        prompt: &str,
        opts: CallOpts,
    ) -> Result<T> {
        let mut last_err: Option<anyhow::Error> = None;
        for spec in self.specs(role) {
            let provider = match self.provider_for(spec) {
                Ok(p) => p,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let request = self.build_request(spec, system, prompt, opts, true);
            match provider.chat(&request).await {
                Ok(response) => match parse_json_response::<T>(&response.content) {
                    Ok(value) => {
                        debug!(role = %role, model = %spec.model_id, "json completion ok");
                        return Ok(value);
                    }
                    Err(e) => {
                        warn!(role = %role, model = %spec.model_id, error = %e, "invalid JSON, trying next");
                        last_err = Some(e);
                    }
                },
                Err(e) => {
                    warn!(role = %role, model = %spec.model_id, error = %e, "model failed, trying next");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("No model specs for role: {role}")))
    }

    /// Streaming structured output: yields a snapshot of `T` each time the
    /// accumulated response parses to a new value. Fallback applies to
    /// opening the stream; mid-stream failures surface to the consumer.
    pub async fn stream_json<T: DeserializeOwned + Send + 'static>(
        &self,
        role: ModelRole,
        system: Option<&str>,
        prompt: &str,
        opts: CallOpts,
    ) -> Result<BoxStream<'static, Result<T>>> {
        let mut last_err: Option<anyhow::Error> = None;
        for spec in self.specs(role) {
            let provider = match self.provider_for(spec) {
                Ok(p) => p,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let request = self.build_request(spec, system, prompt, opts, true);
            match provider.chat_stream(&request).await {
                Ok(inner) => {
                    debug!(role = %role, model = %spec.model_id, "structured stream opened");
                    return Ok(snapshot_stream::<T>(inner));
                }
                Err(e) => {
                    warn!(role = %role, model = %spec.model_id, error = %e, "stream open failed, trying next");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("No model specs for role: {role}")))
    }
}

struct SnapshotState {
    inner: BoxStream<'static, Result<StreamEvent>>,
    buffer: String,
    last_emitted: Option<String>,
    finished: bool,
}

/// Turn a raw token stream into a stream of parsed `T` snapshots, emitting
/// only when the parse result changes.
fn snapshot_stream<T: DeserializeOwned + Send + 'static>(
    inner: BoxStream<'static, Result<StreamEvent>>,
) -> BoxStream<'static, Result<T>> {
    let state = SnapshotState {
        inner,
        buffer: String::new(),
        last_emitted: None,
        finished: false,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            match state.inner.next().await {
                Some(Ok(StreamEvent::TextDelta(delta))) => {
                    if delta.is_empty() {
                        continue;
                    }
                    state.buffer.push_str(&delta);
                    if let Some(value) = parse_partial_json::<serde_json::Value>(&state.buffer) {
                        let fingerprint = value.to_string();
                        if state.last_emitted.as_deref() != Some(fingerprint.as_str()) {
                            if let Ok(typed) = serde_json::from_value::<T>(value) {
                                state.last_emitted = Some(fingerprint);
                                return Some((Ok(typed), state));
                            }
                        }
                    }
                }
                Some(Ok(StreamEvent::Usage(_))) => continue,
                Some(Ok(StreamEvent::Done)) | None => {
                    state.finished = true;
                    // Final parse catches documents that only became valid
                    // at the very end.
                    if let Some(value) = parse_partial_json::<serde_json::Value>(&state.buffer) {
                        let fingerprint = value.to_string();
                        if state.last_emitted.as_deref() != Some(fingerprint.as_str()) {
                            if let Ok(typed) = serde_json::from_value::<T>(value) {
                                return Some((Ok(typed), state));
                            }
                        }
                        return None;
                    }
                    if state.last_emitted.is_none() {
                        return Some((
                            Err(anyhow::anyhow!(
                                "stream produced no parseable structured output"
                            )),
                            state,
                        ));
                    }
                    return None;
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
            }
        }
    });

    Box::pin(stream)
}

/// Strip markdown fences and parse a JSON response body.
pub fn parse_json_response<T: DeserializeOwned>(content: &str) -> Result<T> {
    let trimmed = content.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    serde_json::from_str(stripped).or_else(|first_err| {
        // Some models wrap the object in prose; fall back to the repaired
        // leading value.
        parse_partial_json(stripped)
            .ok_or_else(|| anyhow::anyhow!("invalid JSON response: {first_err}"))
    })
}

const ENV_ROUTE_KEYS: &[(ModelRole, &str)] = &[
    (ModelRole::Intake, "MODEL_ROUTE_INTAKE"),
    (ModelRole::Planner, "MODEL_ROUTE_PLANNER"),
    (ModelRole::PrNarrator, "MODEL_ROUTE_PR"),
    (ModelRole::Coder, "MODEL_ROUTE_CODER"),
    (ModelRole::Embedding, "EMBEDDING_MODEL"),
    (ModelRole::Orchestrator, "MODEL_ROUTE_ORCHESTRATOR"),
];

fn default_models_for(role: ModelRole) -> Vec<&'static str> {
    match role {
        // Fast reasoning over short user prompts.
        ModelRole::Intake => vec![
            "deepseek/deepseek-chat-v3.1",
            "alibaba/qwen-max",
            "claude-sonnet-4-5",
        ],
        // Deliberate reasoning with JSON output.
        ModelRole::Planner => vec![
            "deepseek/deepseek-reasoner-v3.1",
            "alibaba/qwen3-next-80b-a3b-thinking",
            "claude-opus-4-1",
        ],
        ModelRole::PrNarrator => vec![
            "deepseek/deepseek-chat-v3.1",
            "claude-haiku-4-5",
            "alibaba/qwen3-235b-a22b-thinking-2507",
        ],
        ModelRole::Coder => vec![
            "alibaba/qwen3-coder-480b-a35b-instruct",
            "Qwen/Qwen2.5-Coder-32B-Instruct",
            "deepseek/deepseek-chat-v3.1",
            "claude-opus-4-1",
        ],
        // Meta-decisions: cheap, low-latency models first.
        ModelRole::Orchestrator => vec![
            "deepseek/deepseek-chat-v3.1",
            "claude-haiku-4-5",
        ],
        ModelRole::Embedding => vec!["bge-small"],
    }
}

fn infer_provider(model_id: &str) -> &'static str {
    if model_id.starts_with("claude-") {
        "anthropic"
    } else {
        "aimlapi"
    }
}

fn spec_for(role: ModelRole, model_id: &str) -> ModelSpec {
    ModelSpec {
        provider: infer_provider(model_id).to_string(),
        model_id: model_id.to_string(),
        temperature: match role {
            ModelRole::Coder => 0.2,
            ModelRole::Orchestrator => 0.2,
            _ => 0.3,
        },
        json_mode: matches!(
            role,
            ModelRole::Planner | ModelRole::Intake | ModelRole::Orchestrator
        ),
        max_output_tokens: match role {
            ModelRole::Planner | ModelRole::PrNarrator => 4096,
            ModelRole::Orchestrator => 1024,
            _ => 2048,
        },
    }
}

/// Build the per-role route table: config lists first, then env CSV
/// overrides, then built-in defaults.
pub fn build_route_table(
    config: &refactory_config::Config,
) -> HashMap<ModelRole, Vec<ModelSpec>> {
    let mut table = HashMap::new();

    for (role, env_key) in ENV_ROUTE_KEYS {
        let configured = match role {
            ModelRole::Intake => &config.models.intake,
            ModelRole::Planner => &config.models.planner,
            ModelRole::Coder => &config.models.coder,
            ModelRole::PrNarrator => &config.models.pr_narrator,
            ModelRole::Orchestrator => &config.models.orchestrator,
            ModelRole::Embedding => &config.models.embedding,
        };

        let mut ids: Vec<String> = configured.clone();
        if ids.is_empty() {
            if let Ok(raw) = std::env::var(env_key) {
                ids = raw
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
        }
        if ids.is_empty() {
            ids = default_models_for(*role)
                .into_iter()
                .map(String::from)
                .collect();
        }

        let specs = ids.iter().map(|id| spec_for(*role, id)).collect();
        table.insert(*role, specs);
    }

    table
}
