//! Channel adapters for chatrelay.
//!
//! Adapters are pure I/O: they turn platform events into `InboundMessage`s and
//! deliver `OutboundMessage` replies. Admission policy lives in the gateway.

mod traits;
mod types;
mod webchat;

pub use traits::ChannelAdapter;
pub use types::{
    ChannelId, ChatId, InboundMessage, InboundMessageKind, Mention, MessageId, OutboundMessage,
    SenderId,
};
pub use webchat::{WEBCHAT_CHANNEL_ID, WebChatAdapter};
