use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for bidi streaming operations
pub type BidiResult<T> = Result<T, BidiError>;

/// Status codes reported by the transport or by the server for a single read range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Internal,
    Unavailable,
    DataLoss,
}

impl StatusCode {
    /// Codes that usually describe a transient condition on the wire
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable
                | Self::DeadlineExceeded
                | Self::ResourceExhausted
                | Self::Internal
                | Self::Aborted
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
        };
        f.write_str(name)
    }
}

/// Coarse classification callers branch on instead of matching every variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Client and server state diverged; never retried
    DataLoss,
    /// The caller asked for something the session cannot do
    Invalid,
    /// Transport failure the default policy considers transient
    RetryableTransport,
    /// Transport failure that will not be retried
    Transport,
    /// Read data failed checksum validation
    Checksum,
    /// The owning session was closed or dropped
    Closed,
}

/// Errors produced by write and read sessions
#[derive(Error, Debug, Clone)]
pub enum BidiError {
    #[error("Data loss: {message}")]
    DataLoss { message: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Transport error ({code}): {message}")]
    Transport { code: StatusCode, message: String },

    #[error("Checksum mismatch for read {read_id} at offset {offset}: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        read_id: u64,
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("Read {read_id} failed ({code}): {message}")]
    RangeFailed {
        read_id: u64,
        code: StatusCode,
        message: String,
    },

    #[error("Redirect limit of {max} exceeded")]
    RedirectLimit { max: u32 },

    #[error("{message} (attempts: {attempts}): {source}")]
    RetryExhausted {
        message: String,
        attempts: u32,
        #[source]
        source: Box<BidiError>,
        /// Earlier failures in order of occurrence
        suppressed: Vec<BidiError>,
    },

    #[error("Session closed")]
    Closed,
}

impl BidiError {
    /// Create a data loss error
    pub fn data_loss<S: Into<String>>(message: S) -> Self {
        Self::DataLoss {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(code: StatusCode, message: S) -> Self {
        Self::Transport {
            code,
            message: message.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DataLoss { .. } => ErrorKind::DataLoss,
            Self::Invalid { .. } => ErrorKind::Invalid,
            Self::Transport { code, .. } | Self::RangeFailed { code, .. } => {
                if code.is_transient() {
                    ErrorKind::RetryableTransport
                } else {
                    ErrorKind::Transport
                }
            }
            Self::ChecksumMismatch { .. } => ErrorKind::Checksum,
            Self::RedirectLimit { .. } => ErrorKind::Transport,
            Self::RetryExhausted { source, .. } => source.kind(),
            Self::Closed => ErrorKind::Closed,
        }
    }

    /// Status code carried by transport and range errors
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Transport { code, .. } | Self::RangeFailed { code, .. } => Some(*code),
            Self::RetryExhausted { source, .. } => source.status_code(),
            _ => None,
        }
    }

    /// Failures recorded before this one gave up, oldest first
    pub fn suppressed(&self) -> &[BidiError] {
        match self {
            Self::RetryExhausted { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// Whether the default policy would try again after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RetryExhausted { .. } => false,
            other => matches!(
                other.kind(),
                ErrorKind::RetryableTransport | ErrorKind::Checksum
            ),
        }
    }

    pub fn is_data_loss(&self) -> bool {
        self.kind() == ErrorKind::DataLoss
    }

    pub fn is_closed(&self) -> bool {
        self.kind() == ErrorKind::Closed
    }
}
