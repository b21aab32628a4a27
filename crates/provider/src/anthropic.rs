use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde_json::json;

use crate::sse::parse_sse_stream;
use crate::types::*;
use crate::{Provider, ProviderError};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
        }
    }

    fn build_body(&self, request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::Assistant => "assistant",
                        _ => "user",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(4096),
        });
        if let Some(system) = &request.system {
            // JSON mode has no wire-level switch here; the instruction
            // travels with the system prompt instead.
            let system = if request.json_mode {
                format!("{system}\n\nRespond with a single valid JSON object and nothing else.")
            } else {
                system.clone()
            };
            body["system"] = json!(system);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if request.stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let text = resp.text().await.unwrap_or_default();
            return Err(
                ProviderError::from_http(status.as_u16(), text, retry_after.as_deref()).into(),
            );
        }
        Ok(resp)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(request);
        let resp = self.send(&body).await?;
        let data: serde_json::Value = resp.json().await?;

        let content = data["content"][0]["text"].as_str().unwrap_or("").to_string();

        Ok(ChatResponse {
            content,
            usage: Some(Usage {
                input_tokens: data["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: data["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            }),
            finish_reason: data["stop_reason"].as_str().map(String::from),
        })
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let mut streaming = request.clone();
        streaming.stream = true;
        let body = self.build_body(&streaming);
        let resp = self.send(&body).await?;

        let events = parse_sse_stream(resp).flat_map(|result| {
            let out: Vec<Result<StreamEvent>> = match result {
                Ok(frame) => {
                    let data: serde_json::Value = match serde_json::from_str(&frame.data) {
                        Ok(v) => v,
                        Err(_) => return futures::stream::iter(vec![]),
                    };
                    match frame.event.as_deref().unwrap_or("") {
                        "message_start" => {
                            let input =
                                data["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0);
                            if input > 0 {
                                vec![Ok(StreamEvent::Usage(Usage {
                                    input_tokens: input as u32,
                                    output_tokens: 0,
                                }))]
                            } else {
                                vec![]
                            }
                        }
                        "content_block_delta" => {
                            if data["delta"]["type"] == "text_delta" {
                                vec![Ok(StreamEvent::TextDelta(
                                    data["delta"]["text"].as_str().unwrap_or("").to_string(),
                                ))]
                            } else {
                                vec![]
                            }
                        }
                        "message_delta" => {
                            let mut evts = Vec::new();
                            let output = data["usage"]["output_tokens"].as_u64().unwrap_or(0);
                            if output > 0 {
                                evts.push(Ok(StreamEvent::Usage(Usage {
                                    input_tokens: 0,
                                    output_tokens: output as u32,
                                })));
                            }
                            evts
                        }
                        "message_stop" => vec![Ok(StreamEvent::Done)],
                        _ => vec![],
                    }
                }
                Err(e) => vec![Err(e)],
            };
            futures::stream::iter(out)
        });

        Ok(Box::pin(events))
    }
}
