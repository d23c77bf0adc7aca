use thiserror::Error;

/// Errors surfaced by channel adapters.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A message could not be delivered to the remote endpoint.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The named channel has no registered adapter.
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// The adapter does not support the requested delivery kind
    /// (e.g. voice on a text-only channel).
    #[error("Unsupported delivery: {0}")]
    Unsupported(String),

    /// An operation exceeded its allowed time budget.
    #[error("Operation timed out after {ms}ms")]
    Timeout { ms: u64 },
}

pub type Result<T> = std::result::Result<T, ChannelError>;
