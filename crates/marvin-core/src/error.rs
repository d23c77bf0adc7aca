use thiserror::Error;

/// Top-level error for the agent runtime.
///
/// Every variant maps to a stable kind tag via [`MarvinError::kind`]; the turn
/// scheduler uses the tag when emitting `TurnFailed` events and the outgoing
/// preparer uses [`MarvinError::user_message`] to build the visible reply.
/// Errors never propagate past the turn boundary.
#[derive(Debug, Error)]
pub enum MarvinError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("LLM provider error: {0}")]
    LlmTransient(String),

    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    #[error("LLM returned empty response")]
    LlmEmpty,

    #[error("Tool '{tool}' failed: {message}")]
    ToolFailure { tool: String, message: String },

    #[error("Tool '{tool}' denied by user")]
    ToolDenied { tool: String },

    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MarvinError {
    /// Stable kind tag used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MarvinError::Config(_) => "Fatal",
            MarvinError::RateLimited { .. } => "RateLimited",
            MarvinError::LlmTransient(_) => "LlmTransient",
            MarvinError::ContextOverflow(_) => "ContextOverflow",
            MarvinError::LlmEmpty => "LlmEmpty",
            MarvinError::ToolFailure { .. } => "ToolFailure",
            MarvinError::ToolDenied { .. } => "ToolDenied",
            MarvinError::PolicyDenied(_) => "PolicyDenied",
            MarvinError::Timeout { .. } => "Timeout",
            MarvinError::Session(_) => "Fatal",
            MarvinError::Channel(_) => "Fatal",
            MarvinError::Serialization(_) => "Fatal",
            MarvinError::Io(_) => "Fatal",
            MarvinError::Internal(_) => "Fatal",
        }
    }

    /// User-visible rendition for the outgoing response.
    ///
    /// Internal detail stays in logs; the user gets a short, actionable line.
    pub fn user_message(&self) -> String {
        match self {
            MarvinError::RateLimited { retry_after_ms } => format!(
                "You're sending messages too quickly. Please retry in {} seconds.",
                (retry_after_ms / 1000).max(1)
            ),
            MarvinError::Timeout { .. } => {
                "The request took too long and was cancelled. Please try again.".to_string()
            }
            MarvinError::LlmEmpty => {
                "The model returned an empty response. Please try again.".to_string()
            }
            MarvinError::ContextOverflow(_) => {
                "The conversation grew too large for the model. Try /reset to start fresh."
                    .to_string()
            }
            MarvinError::LlmTransient(_) => {
                "The language model is currently unavailable. Please try again shortly."
                    .to_string()
            }
            _ => "Something went wrong while processing your message.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MarvinError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(
            MarvinError::RateLimited { retry_after_ms: 5 }.kind(),
            "RateLimited"
        );
        assert_eq!(
            MarvinError::ContextOverflow("x".into()).kind(),
            "ContextOverflow"
        );
        assert_eq!(MarvinError::LlmEmpty.kind(), "LlmEmpty");
        assert_eq!(MarvinError::Timeout { ms: 1 }.kind(), "Timeout");
        assert_eq!(MarvinError::Internal("x".into()).kind(), "Fatal");
    }

    #[test]
    fn rate_limited_user_message_names_retry_delay() {
        let err = MarvinError::RateLimited {
            retry_after_ms: 12_000,
        };
        assert!(err.user_message().contains("12 seconds"));
    }
}
