use crate::types::{InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A chat surface the relay listens on and answers through.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Stable channel identifier, e.g. "webchat".
    fn channel_id(&self) -> &str;

    /// Begin delivering inbound messages into `tx`.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Deliver a reply to a recipient on this platform.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;
}
