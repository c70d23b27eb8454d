//! # strand-transport
//!
//! Connection-oriented message transport for the strand RPC substrate.
//!
//! The transport owns one abstract bidirectional channel through its
//! lifecycle: connect, keep-alive probing on idle connections, bounded
//! reconnection on unexpected loss, and teardown. Inbound messages are
//! fanned out to subscribers through a live broadcast; lifecycle events let
//! upper layers fail pending work the instant the channel is lost.
//!
//! Two channel implementations ship here: an in-process [`memory`] link and
//! a framed [`tcp`] channel.

pub mod channel;
pub mod memory;
pub mod tcp;
pub mod transport;

pub use channel::{ChannelPair, Connector, MessageSink, MessageSource};
pub use transport::{ConnectionState, Transport, TransportConfig, TransportEvent};
