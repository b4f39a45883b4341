//! Server-side resumable upload sessions.
//!
//! [`UploadSessionService`] owns a [`SessionRegistry`] of open sessions and
//! a [`ferry_transfer::ChunkStore`] holding their chunks until finalize.
//! Identity, destination policy and path resolution are supplied by the
//! embedding server through the traits in [`policy`].

pub mod error;
pub mod policy;
pub mod registry;
pub mod service;
pub mod sweeper;

pub use error::SessionError;
pub use policy::{Caller, DestinationPolicy, PathResolver, StaticPolicy, ZoneResolver};
pub use registry::SessionRegistry;
pub use service::{DEFAULT_MAX_TOTAL_CHUNKS, SessionLimits, StoredFile, UploadSessionService};
pub use sweeper::run_sweeper;
