//! Model-switch history flattening.
//!
//! Tool-call and tool-result messages are provider-specific: call ids minted
//! by one model family are rejected by another. When the selected model
//! differs from the one the session last used, the history is rewritten into
//! plain assistant text so any model can read it. Idempotent once no tool
//! artifacts remain.

use marvin_sessions::{Message, Role};

/// Whether the history needs flattening before calling `selected_model`.
///
/// True when the session's recorded model differs from the selection, or
/// when a session with no recorded model still carries tool artifacts
/// (imported or legacy history).
pub fn needs_flatten(
    last_model: Option<&str>,
    selected_model: &str,
    messages: &[Message],
) -> bool {
    let has_artifacts = messages
        .iter()
        .any(|m| m.role == Role::Tool || !m.tool_calls.is_empty());
    match last_model {
        Some(last) => last != selected_model && has_artifacts,
        None => has_artifacts,
    }
}

/// Rewrite tool artifacts into plain assistant messages.
///
/// - assistant-with-tool-calls → assistant text summarising the calls;
/// - tool result → assistant text prefixed with `[tool <name> result]`;
/// - everything else passes through unchanged.
pub fn flatten_messages(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|msg| match msg.role {
            Role::Assistant if !msg.tool_calls.is_empty() => {
                let summary = msg
                    .tool_calls
                    .iter()
                    .map(|c| format!("{}({})", c.name, c.arguments))
                    .collect::<Vec<_>>()
                    .join(", ");
                let content = if msg.text().is_empty() {
                    format!("[called tools: {summary}]")
                } else {
                    format!("{}\n[called tools: {summary}]", msg.text())
                };
                let mut flat = Message::assistant_text(content, msg.created_at.clone());
                flat.id = msg.id.clone();
                flat
            }
            Role::Tool => {
                let name = msg.tool_name.as_deref().unwrap_or("unknown");
                let mut flat = Message::assistant_text(
                    format!("[tool {name} result] {}", msg.text()),
                    msg.created_at.clone(),
                );
                flat.id = msg.id.clone();
                flat
            }
            _ => msg.clone(),
        })
        .collect()
}
