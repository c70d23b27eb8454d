//! # strand-wire
//!
//! The message set shared by both peers of a strand connection, the
//! wire-visible error codes, and the frame codec that moves messages over
//! byte-oriented channels.
//!
//! Payload fields (`params`, `result`, `data`, `details`) are opaque
//! pre-encoded values: the codec serializes the envelope around them and
//! passes the bytes through unchanged.

pub mod code;
pub mod codec;
pub mod message;

pub use code::{ErrorCode, WireError};
pub use codec::{CodecConfig, FrameCodec, FrameHeader, SerializationFormat, FRAME_HEADER_LEN};
pub use message::{now_millis, Message, MethodName, Payload, ServiceName};
