pub mod types;

pub mod anthropic;
pub mod openai;
pub mod router;

mod error;
mod partial;
mod sse;

pub use error::{is_context_error, ProviderError};
pub use partial::parse_partial_json;
pub use router::{build_route_table, parse_json_response, CallOpts, ModelRouter};
pub use types::*;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}

/// Instantiate the wire-style adapters the default route tables point at:
/// an OpenAI-compatible aggregator endpoint plus the Anthropic API.
pub fn create_default_providers(
    config: &refactory_config::Config,
) -> HashMap<String, Arc<dyn Provider>> {
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();

    let aiml_key = config.providers.api_key("aimlapi").unwrap_or_else(|| {
        tracing::warn!("No aimlapi credentials configured; calls will be rejected upstream");
        String::new()
    });
    providers.insert(
        "aimlapi".to_string(),
        Arc::new(openai::OpenAiCompatProvider::new(
            "aimlapi",
            aiml_key,
            config.providers.base_url("aimlapi"),
        )),
    );

    let anthropic_key = config
        .providers
        .api_key("anthropic")
        .unwrap_or_default();
    providers.insert(
        "anthropic".to_string(),
        Arc::new(anthropic::AnthropicProvider::new(
            anthropic_key,
            config.providers.base_url("anthropic"),
        )),
    );

    providers
}
