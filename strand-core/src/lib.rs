//! # strand-core
//!
//! Shared building blocks for the strand RPC substrate: the workspace-wide
//! error type and correlation id generation.

pub mod error;
pub mod id;

pub use error::{Error, Result};
pub use id::{next_message_id, next_stream_id, MessageId, StreamId};
