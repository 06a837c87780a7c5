use aws_sdk_dynamodb::error::BuildError;
use serde_dynamo::Error as SerdeDynamoError;
use std::error::Error as StdError;
use std::fmt;

use crate::batch::UnprocessedBatch;
use crate::transport::TransportError;

/// Query compilation, execution and batch error
#[derive(Debug)]
pub enum Error {
    /// Malformed or unknown field, operator or operand, recorded by a builder
    /// and surfaced by the terminal call
    Validation(String),
    /// A raw expression fragment declares a placeholder that is already in use
    PlaceholderCollision {
        /// The offending placeholder key, e.g. `:v1` or `#n0`
        placeholder: String,
    },
    /// Malformed cursor, or a cursor produced by a different query shape
    CursorDecode(String),
    /// Items or keys remained unprocessed after the batch retry budget was spent
    PartialBatchFailure(Box<UnprocessedBatch>),
    /// The caller's deadline elapsed before an attempt could be issued
    Timeout {
        /// Operation that was about to be sent
        operation: &'static str,
        /// Attempts already made before giving up
        attempts: usize,
    },
    /// Fault reported by the store or the network layer, after retries
    Transport(TransportError),
    /// A parallel scan segment failed
    ScanSegment {
        /// Zero-based segment index
        segment: i32,
        /// What went wrong inside the segment
        source: Box<Error>,
    },
    /// A parallel scan worker panicked; the other segments still completed
    SegmentPanic {
        /// Zero-based segment index
        segment: i32,
        /// Panic payload, when it was a string
        message: String,
    },
    /// Serde DynamoDB serialization/deserialization error
    Marshal(SerdeDynamoError),
    /// DynamoDB request builder error
    Build(BuildError),
}

impl Error {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub(crate) fn cursor(message: impl Into<String>) -> Self {
        Error::CursorDecode(message.into())
    }

    /// Check if the error was raised while building or validating a request
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::PlaceholderCollision { .. }
        )
    }

    /// Check if the caller's deadline elapsed
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Check if the error came from the store
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// Check if a batch operation left items unprocessed
    ///
    /// The exact remainder is available through [`Error::unprocessed`].
    pub fn is_partial_batch_failure(&self) -> bool {
        matches!(self, Error::PartialBatchFailure(_))
    }

    /// Check if a pagination cursor was rejected
    pub fn is_cursor_error(&self) -> bool {
        matches!(self, Error::CursorDecode(_))
    }

    /// Check if a parallel scan segment failed or panicked
    pub fn is_segment_error(&self) -> bool {
        matches!(self, Error::ScanSegment { .. } | Error::SegmentPanic { .. })
    }

    /// Check if the error is a serialization/deserialization error
    pub fn is_serialization_error(&self) -> bool {
        matches!(self, Error::Marshal(_))
    }

    /// The unprocessed remainder of a partially failed batch
    pub fn unprocessed(&self) -> Option<&UnprocessedBatch> {
        match self {
            Error::PartialBatchFailure(batch) => Some(batch),
            _ => None,
        }
    }
}

macro_rules! impl_from_error {
    ($name:ident, $variant:ident) => {
        impl From<$name> for Error {
            fn from(e: $name) -> Self {
                Error::$variant(e)
            }
        }
    };
}

impl_from_error!(SerdeDynamoError, Marshal);
impl_from_error!(BuildError, Build);
impl_from_error!(TransportError, Transport);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(message) => write!(f, "invalid query: {message}"),
            Error::PlaceholderCollision { placeholder } => write!(
                f,
                "duplicate expression placeholder '{placeholder}': raw fragment reuses a placeholder already in the request"
            ),
            Error::CursorDecode(message) => write!(f, "invalid pagination cursor: {message}"),
            Error::PartialBatchFailure(batch) => write!(
                f,
                "batch operation left {} item(s) unprocessed after {} attempt(s)",
                batch.len(),
                batch.attempts
            ),
            Error::Timeout {
                operation,
                attempts,
            } => write!(
                f,
                "deadline elapsed before {operation} could be sent (after {attempts} attempt(s))"
            ),
            Error::Transport(e) => write!(f, "{e}"),
            Error::ScanSegment { segment, source } => {
                write!(f, "scan segment {segment} failed: {source}")
            }
            Error::SegmentPanic { segment, message } => {
                write!(f, "scan segment {segment} worker panicked: {message}")
            }
            Error::Marshal(e) => write!(f, "DynamoDB serialization error: {e}"),
            Error::Build(e) => write!(f, "DynamoDB request builder error: {e}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            Error::ScanSegment { source, .. } => Some(source.as_ref()),
            Error::Marshal(e) => Some(e),
            Error::Build(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_validation_error() {
        let err = Error::validation("operator cannot be empty");
        assert!(err.is_validation_error());
        assert!(!err.is_transport_error());

        let err = Error::PlaceholderCollision {
            placeholder: ":v1".to_string(),
        };
        assert!(err.is_validation_error());
        assert!(err.to_string().contains(":v1"));
    }

    #[test]
    fn test_error_conversion() {
        let build_err = BuildError::other("test");
        let err: Error = build_err.into();
        assert!(matches!(err, Error::Build(_)));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_transport_error_keeps_source() {
        let err: Error = TransportError::new("Query", "ProvisionedThroughputExceededException").into();
        assert!(err.is_transport_error());
        assert!(err.to_string().contains("ProvisionedThroughputExceededException"));
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout {
            operation: "Scan",
            attempts: 2,
        };
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "deadline elapsed before Scan could be sent (after 2 attempt(s))"
        );
    }

    #[test]
    fn test_segment_error_display() {
        let err = Error::ScanSegment {
            segment: 3,
            source: Box::new(Error::validation("boom")),
        };
        assert!(err.to_string().starts_with("scan segment 3 failed"));
        assert!(err.is_segment_error());

        let err = Error::SegmentPanic {
            segment: 1,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "scan segment 1 worker panicked: boom");
    }
}
