//! Data types for the upload queue.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ferry_protocol::Destination;
use ferry_transfer::ChunkBitmap;

use crate::source::ByteSource;

/// Queue-local transfer identity. Ids increase in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// Queued or Active: the queue still owes this transfer work.
    pub fn is_pending(self) -> bool {
        matches!(self, TransferStatus::Queued | TransferStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Whole file in one request.
    SingleShot,
    /// Resumable session, one chunk at a time.
    Chunked,
}

/// Server session a chunked transfer is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    pub id: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
}

/// Snapshot of one transfer.
///
/// `confirmed_bytes <= size` always, and a `Completed` transfer has
/// `confirmed_bytes == size`.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: TransferId,
    /// Leaf file name.
    pub name: String,
    pub size: u64,
    pub destination: Destination,
    pub status: TransferStatus,
    pub mode: TransferMode,
    pub confirmed_bytes: u64,
    /// Instantaneous rate in bytes/second.
    pub bytes_per_second: f64,
    pub eta: Option<Duration>,
    pub session: Option<SessionRef>,
    /// Chunk indices the server confirmed, once known.
    pub chunks: Option<ChunkBitmap>,
    pub error: Option<String>,
    /// Automatic retries spent on the current run.
    pub retries: u32,
    /// Server path of the stored file, once completed.
    pub remote_path: Option<String>,
    /// `false` for restored placeholders waiting for their file.
    pub has_source: bool,
}

impl Transfer {
    pub fn percent(&self) -> f64 {
        if self.size == 0 {
            return if self.status == TransferStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        self.confirmed_bytes as f64 / self.size as f64 * 100.0
    }
}

/// A file handed to [`crate::UploadQueue::add_files`].
#[derive(Clone)]
pub struct UploadFile {
    /// Path relative to the upload root, e.g. `photos/2024/a.jpg`. Its
    /// directories are appended to the destination path.
    pub relative_path: String,
    pub source: Arc<dyn ByteSource>,
}

impl UploadFile {
    pub fn new(relative_path: impl Into<String>, source: Arc<dyn ByteSource>) -> Self {
        Self {
            relative_path: relative_path.into(),
            source,
        }
    }
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("relative_path", &self.relative_path)
            .field("len", &self.source.len())
            .finish()
    }
}

/// Event broadcast to queue observers.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Added {
        id: TransferId,
    },
    StatusChanged {
        id: TransferId,
        status: TransferStatus,
        error: Option<String>,
    },
    Progress {
        id: TransferId,
        confirmed_bytes: u64,
        size: u64,
        bytes_per_second: f64,
        eta: Option<Duration>,
    },
    Removed {
        id: TransferId,
    },
}

impl QueueEvent {
    pub fn id(&self) -> TransferId {
        match self {
            QueueEvent::Added { id }
            | QueueEvent::StatusChanged { id, .. }
            | QueueEvent::Progress { id, .. }
            | QueueEvent::Removed { id } => *id,
        }
    }
}
