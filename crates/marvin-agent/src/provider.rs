//! Outbound LLM port.
//!
//! The core never speaks a concrete provider wire protocol; it hands a
//! `ChatRequest` built from domain messages to whatever `LlmProvider`
//! implementation the composition root wired in, and gets back a
//! `ChatResponse` with content, tool calls, finish reason and usage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use marvin_sessions::{Message, ToolCallRecord};

/// Tool definition sent to the LLM API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Token usage for one attempt.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    /// Conversation history in domain form. Providers translate roles,
    /// tool calls and tool results into their own wire encoding.
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    /// Tools to expose to the LLM. Empty when the turn has none.
    pub tools: Vec<ToolDefinition>,
}

/// Response from an LLM provider (non-streaming).
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    /// Tool calls requested by the LLM. Empty when no tools are called.
    pub tool_calls: Vec<ToolCallRecord>,
    pub model: String,
    pub finish_reason: String,
    pub usage: Usage,
}

impl ChatResponse {
    /// An empty response has neither content nor tool calls.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.tool_calls.is_empty()
    }
}

/// Common interface for all LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and rate-limit bucket keys.
    fn name(&self) -> &str;

    /// Send a non-streaming chat request, wait for the full response.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Substrings that classify a provider failure as a context overflow.
const CONTEXT_OVERFLOW_MARKERS: &[&str] = &[
    "exceeds maximum input length",
    "context_length_exceeded",
    "maximum context length",
    "too many tokens",
    "request too large",
];

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// True when the failure message matches a known context-overflow shape.
    ///
    /// Overflow is recovered once per turn via emergency truncation rather
    /// than retried blindly.
    pub fn is_context_overflow(&self) -> bool {
        let message = match self {
            ProviderError::Api { message, .. } => message.as_str(),
            ProviderError::Parse(m) | ProviderError::Unavailable(m) => m.as_str(),
            _ => return false,
        };
        let lower = message.to_lowercase();
        CONTEXT_OVERFLOW_MARKERS.iter().any(|m| lower.contains(m))
    }
}
