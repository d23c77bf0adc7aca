//! The history writer — the single point of raw-history mutation.
//!
//! Every append lands in both the turn's working list and the session store,
//! stamped by an injectable clock. No other component writes session
//! messages; flattening and compaction rewrites also go through here.

use std::sync::Arc;

use tracing::debug;

use marvin_sessions::{Message, SessionStore};

use crate::pipeline::context::TurnContext;
use crate::provider::ChatResponse;
use crate::tools::ToolOutcome;

type Clock = Box<dyn Fn() -> String + Send + Sync>;

pub struct HistoryWriter {
    store: Arc<SessionStore>,
    clock: Clock,
}

impl HistoryWriter {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            clock: Box::new(|| chrono::Utc::now().to_rfc3339()),
        }
    }

    /// Replace the wall clock (tests use a fixed timestamp).
    pub fn with_clock(store: Arc<SessionStore>, clock: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self {
            store,
            clock: Box::new(clock),
        }
    }

    fn now(&self) -> String {
        (self.clock)()
    }

    /// Append the inbound user message that started the turn.
    pub fn append_user_message(
        &self,
        ctx: &mut TurnContext,
        content: &str,
    ) -> marvin_sessions::error::Result<()> {
        let msg = Message::user(content, self.now());
        self.append(ctx, msg)
    }

    /// Append the assistant message that requested tool calls.
    pub fn append_assistant_tool_calls(
        &self,
        ctx: &mut TurnContext,
        response: &ChatResponse,
    ) -> marvin_sessions::error::Result<()> {
        let content = (!response.content.trim().is_empty()).then(|| response.content.clone());
        let msg =
            Message::assistant_tool_calls(content, response.tool_calls.clone(), self.now());
        self.append(ctx, msg)
    }

    /// Append one tool result, preserving the originating call id.
    pub fn append_tool_result(
        &self,
        ctx: &mut TurnContext,
        outcome: &ToolOutcome,
    ) -> marvin_sessions::error::Result<()> {
        let msg = Message::tool_result(
            outcome.call_id.clone(),
            outcome.name.clone(),
            outcome.result.content.clone(),
            self.now(),
        );
        self.append(ctx, msg)
    }

    /// Append the final assistant answer that ends the turn.
    pub fn append_final_assistant_answer(
        &self,
        ctx: &mut TurnContext,
        text: &str,
    ) -> marvin_sessions::error::Result<()> {
        let msg = Message::assistant_text(text, self.now());
        self.append(ctx, msg)
    }

    /// Rewrite the whole history (flattening, compaction).
    ///
    /// The working list and the session list change together; from the
    /// turn's point of view the swap is atomic because the turn holds the
    /// session lock.
    pub fn rewrite(
        &self,
        ctx: &mut TurnContext,
        messages: Vec<Message>,
    ) -> marvin_sessions::error::Result<()> {
        self.store.replace_messages(ctx.key(), &messages)?;
        debug!(
            session = %ctx.key(),
            count = messages.len(),
            "history rewritten"
        );
        ctx.messages = messages;
        Ok(())
    }

    fn append(&self, ctx: &mut TurnContext, msg: Message) -> marvin_sessions::error::Result<()> {
        self.store.append_message(ctx.key(), &msg)?;
        ctx.messages.push(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marvin_channels::InboundMessage;
    use marvin_sessions::{Role, SessionKey, ToolCallRecord};
    use tokio_util::sync::CancellationToken;

    use crate::provider::Usage;
    use crate::tools::ToolResult;

    fn fixed_clock() -> String {
        "2026-03-01T12:00:00+00:00".to_string()
    }

    fn setup() -> (HistoryWriter, TurnContext, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::in_memory().unwrap());
        let key = SessionKey::new("telegram", "42");
        let session = store.get_or_create(&key).unwrap();
        let inbound = InboundMessage {
            id: "m-1".into(),
            channel: "telegram".into(),
            chat_id: "42".into(),
            sender_id: "u-1".into(),
            content: "hi".into(),
            attachments: Vec::new(),
            metadata: serde_json::Value::Null,
            timestamp: fixed_clock(),
        };
        let ctx = TurnContext::new(session, Vec::new(), inbound, CancellationToken::new());
        let writer = HistoryWriter::with_clock(Arc::clone(&store), fixed_clock);
        (writer, ctx, store)
    }

    #[test]
    fn appends_land_in_both_lists() {
        let (writer, mut ctx, store) = setup();
        writer.append_user_message(&mut ctx, "hi").unwrap();
        writer
            .append_final_assistant_answer(&mut ctx, "hello!")
            .unwrap();

        assert_eq!(ctx.messages.len(), 2);
        let persisted = store.history(ctx.key(), 10).unwrap();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].role, Role::User);
        assert_eq!(persisted[1].text(), "hello!");
        assert_eq!(persisted[1].created_at, fixed_clock());
    }

    #[test]
    fn tool_result_preserves_call_id() {
        let (writer, mut ctx, store) = setup();
        let outcome = ToolOutcome {
            call_id: "call-9".into(),
            name: "fs_read".into(),
            result: ToolResult::success("hello"),
            confirmation_denied: false,
        };
        writer.append_tool_result(&mut ctx, &outcome).unwrap();

        let persisted = store.history(ctx.key(), 10).unwrap();
        assert_eq!(persisted[0].tool_call_id.as_deref(), Some("call-9"));
        assert_eq!(persisted[0].tool_name.as_deref(), Some("fs_read"));
    }

    #[test]
    fn assistant_tool_call_message_keeps_calls() {
        let (writer, mut ctx, store) = setup();
        let response = ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCallRecord {
                id: "call-1".into(),
                name: "fs_read".into(),
                arguments: serde_json::json!({"path": "README.md"}),
            }],
            model: "m".into(),
            finish_reason: "tool_use".into(),
            usage: Usage::default(),
        };
        writer
            .append_assistant_tool_calls(&mut ctx, &response)
            .unwrap();

        let persisted = store.history(ctx.key(), 10).unwrap();
        assert_eq!(persisted[0].role, Role::Assistant);
        assert!(persisted[0].content.is_none());
        assert_eq!(persisted[0].tool_calls.len(), 1);
    }

    #[test]
    fn rewrite_replaces_working_and_session_lists() {
        let (writer, mut ctx, store) = setup();
        writer.append_user_message(&mut ctx, "one").unwrap();
        writer.append_user_message(&mut ctx, "two").unwrap();

        let replacement = vec![Message::system("[Conversation summary]\nx", fixed_clock())];
        writer.rewrite(&mut ctx, replacement).unwrap();

        assert_eq!(ctx.messages.len(), 1);
        let persisted = store.history(ctx.key(), 10).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].role, Role::System);
    }
}
