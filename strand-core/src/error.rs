//! Error types shared across the strand workspace.

/// Standard error type for strand operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Channel could not be established or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// A deadline elapsed before an outcome arrived
    #[error("Timeout")]
    Timeout,

    /// Encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Peer violated the message protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Named entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid argument provided
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(error.to_string()),
            std::io::ErrorKind::TimedOut => Error::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected => Error::Connection(error.to_string()),
            _ => Error::Io(error.to_string()),
        }
    }
}

/// Result type for strand operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if retrying the operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout | Error::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_kinds_map_to_variants() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(Error::from(refused), Error::Connection(_)));

        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(Error::from(timed_out), Error::Timeout));

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(Error::from(missing), Error::NotFound(_)));
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Connection("lost".to_string()).is_retryable());
        assert!(!Error::Internal("bug".to_string()).is_retryable());
    }
}
