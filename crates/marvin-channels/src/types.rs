use serde::{Deserialize, Serialize};
use tracing::warn;

/// Hard limits on inbound attachments.
pub const MAX_INBOUND_ATTACHMENTS: usize = 6;
pub const MAX_INBOUND_ATTACHMENT_BYTES: usize = 8 * 1024 * 1024;

/// An image attached to an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundAttachment {
    /// Currently always `"image"`.
    pub kind: String,
    /// MIME type; only `image/*` is accepted.
    pub mime_type: String,
    /// Base64-encoded payload.
    pub data_base64: String,
    pub name: Option<String>,
}

impl InboundAttachment {
    /// Decoded payload size estimated from the base64 length.
    pub fn estimated_bytes(&self) -> usize {
        self.data_base64.len() / 4 * 3
    }
}

/// A message received from an external channel (Telegram, WebSocket, webhook, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    /// Logical channel name (e.g. `"telegram"`).
    pub channel: String,
    /// Platform-native chat identifier.
    pub chat_id: String,
    /// Platform-native sender identifier.
    pub sender_id: String,
    /// Plain text content. May be empty when attachments are present.
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<InboundAttachment>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// ISO-8601 receive timestamp.
    pub timestamp: String,
}

impl InboundMessage {
    /// Drop attachments that violate the transport limits.
    ///
    /// Violations shrink the list with a warning; they never fail the turn.
    pub fn validate_attachments(&mut self) {
        let before = self.attachments.len();
        self.attachments.retain(|a| {
            if !a.mime_type.starts_with("image/") {
                warn!(mime = %a.mime_type, "dropping attachment: unsupported MIME type");
                return false;
            }
            if a.estimated_bytes() > MAX_INBOUND_ATTACHMENT_BYTES {
                warn!(
                    bytes = a.estimated_bytes(),
                    "dropping attachment: exceeds size limit"
                );
                return false;
            }
            true
        });
        if self.attachments.len() > MAX_INBOUND_ATTACHMENTS {
            warn!(
                count = self.attachments.len(),
                keep = MAX_INBOUND_ATTACHMENTS,
                "dropping surplus attachments"
            );
            self.attachments.truncate(MAX_INBOUND_ATTACHMENTS);
        }
        if self.attachments.len() != before {
            warn!(
                before,
                after = self.attachments.len(),
                "inbound attachments were filtered"
            );
        }
    }

    /// Whether the inbound metadata asks for a voice rendition of the reply.
    pub fn wants_voice_reply(&self) -> bool {
        self.metadata
            .get("voice_reply")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Payload of an outgoing attachment: raw bytes or a fetchable URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentPayload {
    Bytes(Vec<u8>),
    Url(String),
}

/// An attachment to deliver alongside the text reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingAttachment {
    /// Free-form kind label (e.g. `"image"`, `"file"`).
    pub kind: String,
    pub payload: AttachmentPayload,
    pub mime_type: String,
    pub name: Option<String>,
}

/// The single source of truth for what a turn sends back.
///
/// The channel-side transport consumes exactly this record; delivery order is
/// always text → voice → attachments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutgoingResponse {
    pub text: Option<String>,
    pub voice_requested: bool,
    pub voice_text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<OutgoingAttachment>,
    /// Set when the turn failed; `text` then carries the user-facing message.
    pub error: Option<String>,
}

impl OutgoingResponse {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn from_error(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            error: Some(kind.into()),
            ..Self::default()
        }
    }

    /// True when there is nothing to deliver at all.
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().unwrap_or("").is_empty()
            && self.attachments.is_empty()
            && !self.voice_requested
    }
}

/// Per-step delivery record produced by the response router.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingOutcome {
    pub text_sent: bool,
    pub voice_sent: bool,
    pub attachments_sent: u32,
    /// Human-readable description of each failed sub-send.
    pub failures: Vec<String>,
}
