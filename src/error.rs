//! Engine status codes.
//!
//! One shared taxonomy for every operation the service exposes. The split
//! that matters: per-node backend failures during traversal are absorbed by
//! the query engine (it skips to the next node), while decode/bounds
//! failures and continuation misuse always surface to the caller.

use thiserror::Error;

use crate::engine::continuation::ContinuationHandle;

/// Status returned by service operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Status {
    /// The reference id is unknown, closed, or of the wrong kind.
    #[error("invalid reference")]
    InvalidReference,

    /// Path resolution produced nothing and the local fallback failed too.
    #[error("search path not defined")]
    PathNotDefined,

    /// Continuation token unverifiable, already consumed, foreign to the
    /// reference it was presented on, or invalidated by a policy switch.
    #[error("invalid continuation")]
    InvalidContinuation,

    /// The destination buffer cannot hold even a single record. Recoverable:
    /// when a token is attached, resuming with a larger buffer continues the
    /// traversal.
    #[error("destination buffer too small")]
    BufferTooSmall {
        continuation: Option<ContinuationHandle>,
    },

    /// A length field in a packed buffer points past the end of the buffer.
    /// Always fatal to the call; never silently truncated.
    #[error("malformed buffer")]
    MalformedBuffer,

    /// A record/attribute/value index is outside the packed counts.
    #[error("index out of range")]
    IndexOutOfRange,

    /// Custom-call authorization failed.
    #[error("permission denied")]
    PermissionDenied,

    /// The service has not finished initializing.
    #[error("service not initialized")]
    NotInitialized,

    /// Service initialization failed and has not recovered.
    #[error("service failed to initialize")]
    FailedToInitialize,

    /// The request blob of a custom call could not be parsed.
    #[error("invalid request data")]
    InvalidRequest,
}

impl From<crate::wire::WireError> for Status {
    fn from(err: crate::wire::WireError) -> Self {
        match err {
            crate::wire::WireError::BufferFull => Status::BufferTooSmall { continuation: None },
            crate::wire::WireError::Malformed => Status::MalformedBuffer,
            crate::wire::WireError::IndexOutOfRange => Status::IndexOutOfRange,
        }
    }
}

pub type Result<T> = std::result::Result<T, Status>;
