pub mod channel;
pub mod error;
pub mod router;
pub mod types;

pub use channel::Channel;
pub use error::ChannelError;
pub use router::ResponseRouter;
pub use types::{
    AttachmentPayload, InboundAttachment, InboundMessage, OutgoingAttachment, OutgoingResponse,
    RoutingOutcome,
};
