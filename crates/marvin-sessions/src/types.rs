use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Channel-scoped session key.
///
/// A session is identified by the channel it lives on and the platform-native
/// chat id: `"{channel}:{chat_id}"`. Telegram chat 42 and a WebSocket client
/// with id 42 are distinct conversations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// Logical channel name (e.g. `"telegram"`, `"ws"`).
    pub channel: String,
    /// Platform-native chat identifier.
    pub chat_id: String,
}

impl SessionKey {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Canonical wire-format string: `{channel}:{chat_id}`.
    ///
    /// The chat id may itself contain colons; only the first colon separates.
    pub fn format(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }

    /// Parse a wire-format key back into a `SessionKey`.
    pub fn parse(s: &str) -> Result<Self> {
        let (channel, chat_id) = s
            .split_once(':')
            .ok_or_else(|| SessionError::InvalidKey(format!("missing ':' separator: {s}")))?;
        if channel.is_empty() || chat_id.is_empty() {
            return Err(SessionError::InvalidKey(format!(
                "key components must not be empty: {s}"
            )));
        }
        Ok(Self::new(channel, chat_id))
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            "system" => Ok(Role::System),
            other => Err(SessionError::InvalidRole(other.to_string())),
        }
    }
}

/// A tool invocation requested by the assistant, as recorded in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments exactly as the model produced them.
    pub arguments: serde_json::Value,
}

/// One entry in a session's conversation history.
///
/// Invariants:
/// - a `tool` message carries `tool_call_id` and `tool_name`;
/// - an `assistant` message has non-empty content, non-empty `tool_calls`,
///   or both;
/// - `user` / `system` messages carry only content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    /// RFC3339 creation timestamp.
    pub created_at: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Message {
    fn base(role: Role, content: Option<String>, created_at: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content,
            tool_call_id: None,
            tool_name: None,
            tool_calls: Vec::new(),
            created_at,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn user(content: impl Into<String>, created_at: impl Into<String>) -> Self {
        Self::base(Role::User, Some(content.into()), created_at.into())
    }

    pub fn system(content: impl Into<String>, created_at: impl Into<String>) -> Self {
        Self::base(Role::System, Some(content.into()), created_at.into())
    }

    pub fn assistant_text(content: impl Into<String>, created_at: impl Into<String>) -> Self {
        Self::base(Role::Assistant, Some(content.into()), created_at.into())
    }

    pub fn assistant_tool_calls(
        content: Option<String>,
        tool_calls: Vec<ToolCallRecord>,
        created_at: impl Into<String>,
    ) -> Self {
        let mut msg = Self::base(Role::Assistant, content, created_at.into());
        msg.tool_calls = tool_calls;
        msg
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        created_at: impl Into<String>,
    ) -> Self {
        let mut msg = Self::base(Role::Tool, Some(content.into()), created_at.into());
        msg.tool_call_id = Some(call_id.into());
        msg.tool_name = Some(tool_name.into());
        msg
    }

    /// Content as a borrowed str, empty when absent.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// A persisted conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// UUIDv7 primary key — time-sortable.
    pub id: String,
    pub key: SessionKey,
    /// Model id used for the most recent completed turn. Drives the
    /// model-switch history flattening decision.
    pub last_model: Option<String>,
    pub message_count: u32,
    pub total_tokens: u64,
    pub created_at: String,
    pub updated_at: String,
}

/// Lifecycle of a plan document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Collecting,
    Ready,
    Executing,
    Done,
    Cancelled,
    Superseded,
}

impl PlanStatus {
    /// Terminal plans are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Done | PlanStatus::Cancelled | PlanStatus::Superseded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Collecting => "collecting",
            PlanStatus::Ready => "ready",
            PlanStatus::Executing => "executing",
            PlanStatus::Done => "done",
            PlanStatus::Cancelled => "cancelled",
            PlanStatus::Superseded => "superseded",
        }
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "collecting" => Ok(PlanStatus::Collecting),
            "ready" => Ok(PlanStatus::Ready),
            "executing" => Ok(PlanStatus::Executing),
            "done" => Ok(PlanStatus::Done),
            "cancelled" => Ok(PlanStatus::Cancelled),
            "superseded" => Ok(PlanStatus::Superseded),
            other => Err(SessionError::InvalidPlanStatus(other.to_string())),
        }
    }
}

/// A plan document owned by one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// UUIDv7 primary key.
    pub id: String,
    pub session_key: SessionKey,
    pub status: PlanStatus,
    pub title: Option<String>,
    /// Canonical plan document. The model reads it via `plan_get` and writes
    /// it via `plan_set_content`; nothing else edits this field.
    pub markdown: String,
    /// Routing tier recorded at creation time (informational).
    pub model_tier: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Token usage for one LLM attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub session_key: SessionKey,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub created_at: String,
}
