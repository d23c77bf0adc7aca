use async_trait::async_trait;

use crate::error::Result;
use crate::types::OutgoingAttachment;

/// Common interface implemented by every channel adapter (Telegram, WebSocket,
/// webhook, …).
///
/// The core only ever *sends* through this trait; receiving is the adapter's
/// business. Implementations must be `Send + Sync` so they can be stored in a
/// [`ResponseRouter`](crate::router::ResponseRouter) and driven from multiple
/// Tokio tasks.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable lowercase identifier for this channel (e.g. `"telegram"`).
    fn name(&self) -> &str;

    /// Deliver a plain text message.
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<()>;

    /// Deliver a voice rendition of `text`.
    ///
    /// Text-only channels return [`ChannelError::Unsupported`]; the router
    /// records the failure and carries on.
    async fn send_voice(&self, chat_id: &str, text: &str) -> Result<()>;

    /// Deliver a single attachment.
    async fn send_attachment(&self, chat_id: &str, attachment: &OutgoingAttachment) -> Result<()>;

    /// Present approve/deny affordances for a pending tool confirmation.
    ///
    /// The channel-side callback resolves the confirmation through the
    /// broker; this call only renders the prompt.
    async fn present_confirmation(
        &self,
        chat_id: &str,
        confirmation_id: &str,
        tool_name: &str,
        description: &str,
    ) -> Result<()>;
}
