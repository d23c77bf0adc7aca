//! Token-budget-driven history compaction.
//!
//! Before a tool-loop iteration, when the estimated token count of the
//! working list exceeds the configured ceiling, the prefix of the history is
//! replaced with one summary message and only the most recent messages are
//! kept verbatim. A no-op below the threshold.

use async_trait::async_trait;
use tracing::{info, warn};

use marvin_core::config::CompactionConfig;
use marvin_sessions::Message;

use crate::pipeline::context::TurnContext;
use crate::pipeline::history::HistoryWriter;
use crate::provider::ProviderError;

/// Prefix of the synthetic summary message.
pub const SUMMARY_PREFIX: &str = "[Conversation summary]";

/// Outbound summarization port.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize a plain-text transcript into a few paragraphs.
    async fn summarize(&self, transcript: &str) -> Result<String, ProviderError>;
}

/// Summarizer backed by the LLM provider on a cheap model.
pub struct LlmSummarizer {
    provider: std::sync::Arc<dyn crate::provider::LlmProvider>,
    model: String,
}

impl LlmSummarizer {
    pub fn new(provider: std::sync::Arc<dyn crate::provider::LlmProvider>, model: String) -> Self {
        Self { provider, model }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, transcript: &str) -> Result<String, ProviderError> {
        let request = crate::provider::ChatRequest {
            model: self.model.clone(),
            system: "Summarize the conversation below for the assistant's own \
                     context. Keep decisions, facts, names, open tasks and user \
                     preferences; drop tool output and pleasantries. A few short \
                     paragraphs at most."
                .to_string(),
            messages: vec![Message::user(
                transcript.to_string(),
                chrono::Utc::now().to_rfc3339(),
            )],
            max_tokens: 512,
            tools: Vec::new(),
        };
        let response = self.provider.chat(&request).await?;
        Ok(response.content)
    }
}

/// Estimated token count of the working list: `ceil(len/3.5)` per message.
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    messages
        .iter()
        .map(|m| (m.text().len() as f64 / 3.5).ceil() as u64)
        .sum()
}

/// Compact the working list when it exceeds the configured budget.
///
/// Summarization failures are logged and skipped — an oversized context is
/// still better than a lost turn; the emergency-truncation path catches the
/// true overflow case.
pub async fn compact_if_needed(
    ctx: &mut TurnContext,
    config: &CompactionConfig,
    summarizer: &dyn Summarizer,
    history: &HistoryWriter,
) {
    let estimated = estimate_tokens(&ctx.messages);
    if estimated <= config.max_context_tokens {
        return;
    }
    if ctx.messages.len() <= config.keep_last_messages {
        return;
    }

    let split = ctx.messages.len() - config.keep_last_messages;
    let transcript: String = ctx.messages[..split]
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str().to_uppercase(), m.text()))
        .collect::<Vec<_>>()
        .join("\n\n");

    let summary = match summarizer.summarize(&transcript).await {
        Ok(s) => s,
        Err(e) => {
            warn!(session = %ctx.key(), err = %e, "compact: summarization failed, skipping");
            return;
        }
    };

    let mut rewritten = Vec::with_capacity(config.keep_last_messages + 1);
    rewritten.push(Message::system(
        format!("{SUMMARY_PREFIX}\n{summary}"),
        chrono::Utc::now().to_rfc3339(),
    ));
    rewritten.extend_from_slice(&ctx.messages[split..]);

    let kept = rewritten.len();
    if let Err(e) = history.rewrite(ctx, rewritten) {
        warn!(session = %ctx.key(), err = %e, "compact: history rewrite failed");
        return;
    }

    info!(
        session = %ctx.key(),
        estimated_tokens = estimated,
        kept_messages = kept,
        "compact: history summarized"
    );
}
