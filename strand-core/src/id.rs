//! Correlation identifier generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Correlation key for a single call, unique within one transport's lifetime.
pub type MessageId = u64;

/// Correlation key for a stream, drawn from a space separate from message ids.
pub type StreamId = u64;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a fresh message id
pub fn next_message_id() -> MessageId {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Generate a fresh stream id
pub fn next_stream_id() -> StreamId {
    NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_strictly_increasing() {
        let a = next_message_id();
        let b = next_message_id();
        let c = next_message_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn stream_ids_do_not_repeat() {
        let ids: Vec<StreamId> = (0..64).map(|_| next_stream_id()).collect();
        let mut deduped = ids.clone();
        deduped.dedup();
        assert_eq!(ids, deduped);
    }
}
