//! Queue error types.

use ferry_protocol::constants::{
    ERR_CODE_CHECKSUM_MISMATCH, ERR_CODE_FORBIDDEN, ERR_CODE_INCOMPLETE, ERR_CODE_INVALID_REQUEST,
    ERR_CODE_NOT_FOUND, ERR_CODE_OUT_OF_RANGE, ERR_CODE_POLICY_VIOLATION, ERR_CODE_SIZE_MISMATCH,
    ERR_CODE_UNAUTHORIZED,
};

use crate::types::{TransferId, TransferStatus};

/// Errors returned by a [`crate::SessionApi`] call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("chunk out of range: {0}")]
    OutOfRange(String),

    #[error("size mismatch: {0}")]
    SizeMismatch(String),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("session incomplete: {0}")]
    Incomplete(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("network interrupted: {0}")]
    NetworkInterrupted(String),

    #[error("cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cannot read source: {0}")]
    Source(String),
}

impl ApiError {
    /// Decodes a wire error code.
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ERR_CODE_NOT_FOUND => ApiError::NotFound(message),
            ERR_CODE_FORBIDDEN => ApiError::Forbidden(message),
            ERR_CODE_POLICY_VIOLATION => ApiError::PolicyViolation(message),
            ERR_CODE_OUT_OF_RANGE => ApiError::OutOfRange(message),
            ERR_CODE_SIZE_MISMATCH => ApiError::SizeMismatch(message),
            ERR_CODE_CHECKSUM_MISMATCH => ApiError::ChecksumMismatch(message),
            ERR_CODE_INCOMPLETE => ApiError::Incomplete(message),
            ERR_CODE_INVALID_REQUEST => ApiError::InvalidRequest(message),
            ERR_CODE_UNAUTHORIZED => ApiError::Unauthorized(message),
            code => ApiError::Server { code, message },
        }
    }

    /// Returns `true` for errors the worker recovers from by trying again.
    ///
    /// A lost session is restarted, malformed chunks are re-sent and an
    /// incomplete session re-sends its missing indices.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::NotFound(_)
                | ApiError::OutOfRange(_)
                | ApiError::SizeMismatch(_)
                | ApiError::ChecksumMismatch(_)
                | ApiError::Incomplete(_)
                | ApiError::NetworkInterrupted(_)
                | ApiError::Server { .. }
        )
    }
}

/// Errors returned by [`crate::UploadQueue`] operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("unknown transfer {0}")]
    UnknownTransfer(TransferId),

    #[error("transfer {0} has no byte source; add the file again to resume it")]
    NoByteSource(TransferId),

    #[error("transfer {id} is {status:?}")]
    InvalidState { id: TransferId, status: TransferStatus },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

impl From<ferry_transfer::TransferError> for QueueError {
    fn from(e: ferry_transfer::TransferError) -> Self {
        QueueError::InvalidPath(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_code_maps_known_codes() {
        assert_eq!(ApiError::from_code(404, "x"), ApiError::NotFound("x".into()));
        assert_eq!(ApiError::from_code(422, "x"), ApiError::PolicyViolation("x".into()));
        assert_eq!(ApiError::from_code(409, "x"), ApiError::Incomplete("x".into()));
        assert_eq!(
            ApiError::from_code(500, "boom"),
            ApiError::Server {
                code: 500,
                message: "boom".into()
            }
        );
    }

    #[test]
    fn terminal_errors_are_not_retried() {
        assert!(!ApiError::Forbidden(String::new()).is_retryable());
        assert!(!ApiError::PolicyViolation(String::new()).is_retryable());
        assert!(!ApiError::Unauthorized(String::new()).is_retryable());
        assert!(!ApiError::Cancelled.is_retryable());
        assert!(ApiError::NetworkInterrupted(String::new()).is_retryable());
        assert!(ApiError::NotFound(String::new()).is_retryable());
        assert!(ApiError::ChecksumMismatch(String::new()).is_retryable());
    }
}
