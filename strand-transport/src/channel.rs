//! Abstract bidirectional message channel.
//!
//! The transport layer is written against these seams; the networking
//! collaborator supplies the implementation. Two are shipped in this crate:
//! an in-process memory channel and a framed TCP channel.

use async_trait::async_trait;
use strand_core::Result;
use strand_wire::Message;

/// Outbound half of a channel
#[async_trait]
pub trait MessageSink: Send {
    /// Deliver one message; messages arrive at the peer in send order
    async fn send(&mut self, message: Message) -> Result<()>;

    /// Release the channel; the peer observes a clean closure
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a channel
#[async_trait]
pub trait MessageSource: Send {
    /// Receive the next message; `None` signals clean closure by the peer
    async fn recv(&mut self) -> Result<Option<Message>>;
}

/// Both halves of one physical bidirectional channel
pub type ChannelPair = (Box<dyn MessageSink>, Box<dyn MessageSource>);

/// Establishes channels; re-invoked by the transport for reconnection
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<ChannelPair>;
}
