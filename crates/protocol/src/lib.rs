//! Wire protocol shared by the Ferry upload server and its clients.
//!
//! Text frames carry a JSON [`Message`] envelope; chunk payloads travel in
//! binary frames built by [`binary::encode_frame`].

pub mod binary;
pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use binary::{BinaryFrame, ChunkHeader, FileHeader, ParseError, encode_frame, parse_frame};
pub use constants::MessageType;
pub use envelope::{Message, WsError};
pub use types::{Destination, SessionProgress, SessionSummary};
