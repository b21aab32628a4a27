/// Patterns that identify a request rejected for prompt or output size.
/// The streaming transformer keys its adaptive batch halving on these.
const CONTEXT_PATTERNS: &[&str] = &[
    "token limit",
    "Token limit",
    "context length",
    "context too large",
    "MAX_TOKENS",
    "MALFORMED_FUNCTION_CALL",
    "maximum context",
];

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {status} - {body}")]
    Http { status: u16, body: String },

    #[error("SSE stream error: {0}")]
    Stream(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Context window exceeded: {0}")]
    ContextOverflow(String),
}

impl ProviderError {
    pub fn from_http(status: u16, body: String, retry_after: Option<&str>) -> Self {
        if status == 429 {
            let retry_after_ms = retry_after
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(5_000);
            return ProviderError::RateLimited { retry_after_ms };
        }
        if CONTEXT_PATTERNS.iter().any(|p| body.contains(p)) {
            return ProviderError::ContextOverflow(body);
        }
        ProviderError::Http { status, body }
    }
}

/// True when an error (typed or stringly) describes a token/context limit.
pub fn is_context_error(err: &anyhow::Error) -> bool {
    if let Some(provider_err) = err.downcast_ref::<ProviderError>() {
        if matches!(provider_err, ProviderError::ContextOverflow(_)) {
            return true;
        }
    }
    let text = format!("{err:#}");
    CONTEXT_PATTERNS.iter().any(|p| text.contains(p))
}
