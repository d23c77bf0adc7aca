//! Outgoing response preparation.
//!
//! Derives the single-source-of-truth transport payload from the turn's
//! outcome. Precedence: an already-set response (plan approval) wins, then a
//! surfaced LLM error, then the final LLM answer. Reads only; never touches
//! raw history and never transmits.

use tracing::debug;

use marvin_channels::OutgoingResponse;

use crate::pipeline::context::TurnContext;

/// Fill `attributes.outgoing_response` from canonical sources.
pub fn prepare_outgoing(ctx: &mut TurnContext) {
    if ctx.attributes.outgoing_response.is_some() {
        debug!(session = %ctx.key(), "outgoing response already set upstream");
        return;
    }

    if let Some(error_text) = ctx.attributes.llm_error.clone() {
        ctx.attributes.outgoing_response =
            Some(OutgoingResponse::from_error("llm_error", error_text));
        return;
    }

    let Some(response) = ctx.attributes.llm_response.as_ref() else {
        return;
    };

    let voice_requested = ctx.inbound.wants_voice_reply();
    ctx.attributes.outgoing_response = Some(OutgoingResponse {
        text: Some(response.content.clone()),
        voice_requested,
        voice_text: voice_requested.then(|| response.content.clone()),
        attachments: std::mem::take(&mut ctx.tool_attachments),
        error: None,
    });
}
