//! Chunk arithmetic, completion bitmaps and chunk scratch storage.
//!
//! Shared by the upload server (which stores chunks until finalize) and
//! the client queue (which slices sources into the same layout).

mod bitmap;
mod chunked;
mod layout;
mod progress;
mod store;
mod validation;

pub use bitmap::ChunkBitmap;
pub use chunked::{checksum_bytes, verify_checksum};
pub use layout::ChunkLayout;
pub use progress::RateSampler;
pub use store::{ChunkStore, StoredSession};
pub use validation::{split_relative_path, validate_file_name, validate_upload_path};

/// Default chunk size: 20 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 20 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    #[error("chunk {index} missing from scratch storage")]
    MissingChunk { index: u32 },
}
