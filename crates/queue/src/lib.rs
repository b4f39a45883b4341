//! Client-side upload queue.
//!
//! [`UploadQueue`] turns files into transfers, admits at most
//! `concurrency` of them at a time and drives each one through a
//! [`SessionApi`]: large files as resumable chunked sessions, small ones
//! as a single whole-file request. [`RestoreCoordinator`] rebuilds
//! placeholders for sessions the server still remembers.

pub mod api;
pub mod config;
pub mod error;
pub mod queue;
pub mod restore;
pub mod source;
pub mod types;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiFuture, OnSent, SessionApi};
pub use config::QueueConfig;
pub use error::{ApiError, QueueError};
pub use queue::UploadQueue;
pub use restore::RestoreCoordinator;
pub use source::{ByteSource, FileSource, MemorySource};
pub use types::{
    QueueEvent, SessionRef, Transfer, TransferId, TransferMode, TransferStatus, UploadFile,
};
