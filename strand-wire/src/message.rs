//! Wire message definitions.

use serde::{Deserialize, Serialize};
use strand_core::{MessageId, StreamId};

/// Semantic service name
pub type ServiceName = String;

/// Semantic method name
pub type MethodName = String;

/// Opaque pre-encoded value, passed through unchanged
pub type Payload = Vec<u8>;

/// Current time as epoch milliseconds, carried on every message as an
/// informational send time.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The tagged message set shared by both peers.
///
/// Every variant carries its correlation `id` and a `timestamp`. Stream
/// variants additionally carry the `stream_id` that groups them; the stream
/// id lives in a space separate from message ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Invoke a unary method; `streaming` signals the caller expects a stream
    Request {
        id: MessageId,
        timestamp: u64,
        service: ServiceName,
        method: String,
        params: Vec<Payload>,
        streaming: bool,
    },

    /// Terminal success for a request; `result` is absent for void methods
    Response {
        id: MessageId,
        timestamp: u64,
        result: Option<Payload>,
    },

    /// Terminal failure for a request
    Error {
        id: MessageId,
        timestamp: u64,
        code: crate::code::ErrorCode,
        message: String,
        details: Option<Payload>,
    },

    /// Open a stream on a streaming method
    StreamStart {
        id: MessageId,
        timestamp: u64,
        stream_id: StreamId,
        service: ServiceName,
        method: String,
        params: Vec<Payload>,
    },

    /// One produced stream value; ordered within its stream only
    StreamData {
        id: MessageId,
        timestamp: u64,
        stream_id: StreamId,
        data: Payload,
    },

    /// Terminal graceful completion of a stream
    StreamEnd {
        id: MessageId,
        timestamp: u64,
        stream_id: StreamId,
    },

    /// Terminal abnormal completion of a stream
    StreamError {
        id: MessageId,
        timestamp: u64,
        stream_id: StreamId,
        code: crate::code::ErrorCode,
        message: String,
        details: Option<Payload>,
    },

    /// Keep-alive probe, answered by the peer's transport
    Ping { id: MessageId, timestamp: u64 },

    /// Keep-alive acknowledgement, echoing the probe id
    Pong { id: MessageId, timestamp: u64 },
}

impl Message {
    /// Build a request message
    pub fn request(
        id: MessageId,
        service: impl Into<String>,
        method: impl Into<String>,
        params: Vec<Payload>,
        streaming: bool,
    ) -> Self {
        Message::Request {
            id,
            timestamp: now_millis(),
            service: service.into(),
            method: method.into(),
            params,
            streaming,
        }
    }

    /// Build a response message
    pub fn response(id: MessageId, result: Option<Payload>) -> Self {
        Message::Response {
            id,
            timestamp: now_millis(),
            result,
        }
    }

    /// Build an error response from a wire error
    pub fn error(id: MessageId, error: crate::code::WireError) -> Self {
        Message::Error {
            id,
            timestamp: now_millis(),
            code: error.code,
            message: error.message,
            details: error.details,
        }
    }

    /// Build a stream-open message
    pub fn stream_start(
        id: MessageId,
        stream_id: StreamId,
        service: impl Into<String>,
        method: impl Into<String>,
        params: Vec<Payload>,
    ) -> Self {
        Message::StreamStart {
            id,
            timestamp: now_millis(),
            stream_id,
            service: service.into(),
            method: method.into(),
            params,
        }
    }

    /// Build a stream value message
    pub fn stream_data(id: MessageId, stream_id: StreamId, data: Payload) -> Self {
        Message::StreamData {
            id,
            timestamp: now_millis(),
            stream_id,
            data,
        }
    }

    /// Build a stream completion message
    pub fn stream_end(id: MessageId, stream_id: StreamId) -> Self {
        Message::StreamEnd {
            id,
            timestamp: now_millis(),
            stream_id,
        }
    }

    /// Build a stream failure message from a wire error
    pub fn stream_error(id: MessageId, stream_id: StreamId, error: crate::code::WireError) -> Self {
        Message::StreamError {
            id,
            timestamp: now_millis(),
            stream_id,
            code: error.code,
            message: error.message,
            details: error.details,
        }
    }

    /// Build a keep-alive probe
    pub fn ping(id: MessageId) -> Self {
        Message::Ping {
            id,
            timestamp: now_millis(),
        }
    }

    /// Build a keep-alive acknowledgement echoing the probe id
    pub fn pong(id: MessageId) -> Self {
        Message::Pong {
            id,
            timestamp: now_millis(),
        }
    }

    /// The correlation id carried by every variant
    pub fn id(&self) -> MessageId {
        match self {
            Message::Request { id, .. }
            | Message::Response { id, .. }
            | Message::Error { id, .. }
            | Message::StreamStart { id, .. }
            | Message::StreamData { id, .. }
            | Message::StreamEnd { id, .. }
            | Message::StreamError { id, .. }
            | Message::Ping { id, .. }
            | Message::Pong { id, .. } => *id,
        }
    }

    /// The stream id, for stream variants
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Message::StreamStart { stream_id, .. }
            | Message::StreamData { stream_id, .. }
            | Message::StreamEnd { stream_id, .. }
            | Message::StreamError { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }

    /// Whether this message ends its call or stream; nothing referencing the
    /// same correlation id is valid after a terminal message
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Message::Response { .. }
                | Message::Error { .. }
                | Message::StreamEnd { .. }
                | Message::StreamError { .. }
        )
    }

    /// Short variant name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "Request",
            Message::Response { .. } => "Response",
            Message::Error { .. } => "Error",
            Message::StreamStart { .. } => "StreamStart",
            Message::StreamData { .. } => "StreamData",
            Message::StreamEnd { .. } => "StreamEnd",
            Message::StreamError { .. } => "StreamError",
            Message::Ping { .. } => "Ping",
            Message::Pong { .. } => "Pong",
        }
    }
}
