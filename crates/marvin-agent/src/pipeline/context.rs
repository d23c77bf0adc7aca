//! The in-flight turn context.
//!
//! One `TurnContext` lives for one turn. It borrows the session (a snapshot
//! of its messages — the working list) and carries the typed attribute bag
//! the stages communicate through. The context is single-threaded by
//! contract: parallel tool executions mutate only their own outcomes, and
//! results are merged back by the tool loop before anything else reads them.

use tokio_util::sync::CancellationToken;

use marvin_channels::{InboundMessage, OutgoingAttachment, OutgoingResponse};
use marvin_sessions::{Message, Session, SessionKey, ToolCallRecord};

use crate::provider::ChatResponse;
use crate::skill_router::{ModelTier, RoutingResult};

/// The enumerated attribute bag. One typed field per well-known key.
#[derive(Default)]
pub struct TurnAttributes {
    pub system_prompt: Option<String>,
    pub llm_response: Option<ChatResponse>,
    /// User-facing error text; set once and never overwritten by later stages.
    pub llm_error: Option<String>,
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    pub routing_result: Option<RoutingResult>,
    pub active_skill: Option<String>,
    pub model_tier: Option<ModelTier>,
    pub outgoing_response: Option<OutgoingResponse>,
    pub plan_approval_needed: bool,
    pub llm_model: Option<String>,
    pub current_iteration: u32,
}

/// Mutable state for one turn.
pub struct TurnContext {
    pub session: Session,
    /// Working copy of the session's message list. Appends go through the
    /// history writer, which keeps this and the store in step.
    pub messages: Vec<Message>,
    pub inbound: InboundMessage,
    pub attributes: TurnAttributes,
    /// Auto-mode turns (scheduled self-prompts) skip the feedback guarantee.
    pub auto_mode: bool,
    pub cancel: CancellationToken,
    /// Attachments produced by tool executions this turn.
    pub tool_attachments: Vec<OutgoingAttachment>,
    /// Total tokens across all LLM attempts this turn.
    pub tokens_used: u64,
    /// Tool calls executed or intercepted this turn.
    pub tool_call_count: u32,
}

impl TurnContext {
    pub fn new(
        session: Session,
        history: Vec<Message>,
        inbound: InboundMessage,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            messages: history,
            inbound,
            attributes: TurnAttributes::default(),
            auto_mode: false,
            cancel,
            tool_attachments: Vec::new(),
            tokens_used: 0,
            tool_call_count: 0,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.session.key
    }

    /// Model selected for this turn, when routing has run.
    pub fn selected_model(&self) -> Option<&str> {
        self.attributes.llm_model.as_deref()
    }
}
