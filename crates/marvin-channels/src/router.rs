//! Transport-side dispatch of a finished turn.
//!
//! Consumes exactly the `OutgoingResponse` record and nothing else. Delivery
//! order is fixed: text → voice → attachments. Sub-sends are best-effort;
//! a failed voice send never undoes the already-delivered text.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::types::{OutgoingResponse, RoutingOutcome};

/// Registry of channel adapters plus the dispatch logic.
#[derive(Default)]
pub struct ResponseRouter {
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name. The table is frozen before the
    /// first turn runs; registration is not thread-safe by design.
    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn channel(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(name).cloned()
    }

    /// Dispatch a response to one chat on one channel.
    ///
    /// Every sub-send outcome is recorded; failures are logged and collected
    /// but never abort the remaining steps.
    pub async fn dispatch(
        &self,
        channel_name: &str,
        chat_id: &str,
        response: &OutgoingResponse,
    ) -> RoutingOutcome {
        let mut outcome = RoutingOutcome::default();

        let Some(channel) = self.channel(channel_name) else {
            warn!(channel = %channel_name, "router: no adapter registered");
            outcome
                .failures
                .push(ChannelError::UnknownChannel(channel_name.to_string()).to_string());
            return outcome;
        };

        // 1. Text.
        if let Some(text) = response.text.as_deref() {
            if !text.is_empty() {
                match channel.send_text(chat_id, text).await {
                    Ok(()) => outcome.text_sent = true,
                    Err(e) => {
                        warn!(channel = %channel_name, err = %e, "router: text send failed");
                        outcome.failures.push(format!("text: {e}"));
                    }
                }
            }
        }

        // 2. Voice.
        if response.voice_requested {
            let voice_text = response
                .voice_text
                .as_deref()
                .or(response.text.as_deref())
                .unwrap_or("");
            if voice_text.is_empty() {
                debug!(channel = %channel_name, "router: voice requested but nothing to say");
            } else {
                match channel.send_voice(chat_id, voice_text).await {
                    Ok(()) => outcome.voice_sent = true,
                    Err(e) => {
                        warn!(channel = %channel_name, err = %e, "router: voice send failed");
                        outcome.failures.push(format!("voice: {e}"));
                    }
                }
            }
        }

        // 3. Attachments, in list order.
        for attachment in &response.attachments {
            match channel.send_attachment(chat_id, attachment).await {
                Ok(()) => outcome.attachments_sent += 1,
                Err(e) => {
                    warn!(
                        channel = %channel_name,
                        kind = %attachment.kind,
                        err = %e,
                        "router: attachment send failed"
                    );
                    outcome.failures.push(format!("attachment: {e}"));
                }
            }
        }

        outcome
    }
}
