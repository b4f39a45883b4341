//! Session error types.

use ferry_protocol::constants::{
    ERR_CODE_CHECKSUM_MISMATCH, ERR_CODE_FORBIDDEN, ERR_CODE_INCOMPLETE, ERR_CODE_INTERNAL,
    ERR_CODE_INVALID_REQUEST, ERR_CODE_NOT_FOUND, ERR_CODE_OUT_OF_RANGE,
    ERR_CODE_POLICY_VIOLATION, ERR_CODE_SIZE_MISMATCH,
};
use ferry_transfer::TransferError;

/// Errors produced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,

    #[error("access denied")]
    Forbidden,

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("chunk index {index} out of range (session has {total} chunks)")]
    OutOfRange { index: u32, total: u32 },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("session incomplete: {missing} chunks missing")]
    Incomplete { missing: u32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Wire error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            SessionError::NotFound => ERR_CODE_NOT_FOUND,
            SessionError::Forbidden => ERR_CODE_FORBIDDEN,
            SessionError::PolicyViolation(_) => ERR_CODE_POLICY_VIOLATION,
            SessionError::OutOfRange { .. } => ERR_CODE_OUT_OF_RANGE,
            SessionError::SizeMismatch { .. } => ERR_CODE_SIZE_MISMATCH,
            SessionError::ChecksumMismatch => ERR_CODE_CHECKSUM_MISMATCH,
            SessionError::Incomplete { .. } => ERR_CODE_INCOMPLETE,
            SessionError::InvalidRequest(_) => ERR_CODE_INVALID_REQUEST,
            SessionError::Io(_) | SessionError::Json(_) => ERR_CODE_INTERNAL,
        }
    }
}

impl From<TransferError> for SessionError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Io(e) => SessionError::Io(e),
            TransferError::ChecksumMismatch => SessionError::ChecksumMismatch,
            TransferError::InvalidPath(msg) | TransferError::InvalidLayout(msg) => {
                SessionError::InvalidRequest(msg)
            }
            TransferError::MissingChunk { index } => SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("chunk {index} missing from scratch storage"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_constants() {
        assert_eq!(SessionError::NotFound.code(), 404);
        assert_eq!(SessionError::Forbidden.code(), 403);
        assert_eq!(SessionError::Incomplete { missing: 1 }.code(), 409);
        assert_eq!(
            SessionError::SizeMismatch {
                expected: 1,
                actual: 2
            }
            .code(),
            412
        );
        assert_eq!(SessionError::PolicyViolation("x".into()).code(), 422);
    }

    #[test]
    fn transfer_errors_map_to_session_kinds() {
        let e: SessionError = TransferError::InvalidPath("../x".into()).into();
        assert!(matches!(e, SessionError::InvalidRequest(_)));
        let e: SessionError = TransferError::ChecksumMismatch.into();
        assert!(matches!(e, SessionError::ChecksumMismatch));
        let e: SessionError = TransferError::MissingChunk { index: 3 }.into();
        assert_eq!(e.code(), 500);
    }
}
