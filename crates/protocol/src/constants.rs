use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for any incoming frame before a connection is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often keepalive pings are sent.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (64 MB).
///
/// Must exceed the largest chunk the server accepts plus the frame header.
pub const WS_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Largest data payload a binary frame may carry, leaving room for the
/// length prefix and JSON header inside [`WS_MAX_MESSAGE_SIZE`].
pub const MAX_BINARY_PAYLOAD: u64 = WS_MAX_MESSAGE_SIZE as u64 - 64 * 1024;

/// Timeout for request/response operations (text messages).
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for binary request/response operations (chunk uploads).
///
/// Chunk uploads include a disk write on the server before the ACK.
pub const WS_BINARY_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Connection management
    #[serde(rename = "hello")]
    Hello,
    #[serde(rename = "hello_ok")]
    HelloOk,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,

    // Requests from client to server
    #[serde(rename = "create_session")]
    CreateSession,
    #[serde(rename = "get_missing")]
    GetMissing,
    #[serde(rename = "get_progress")]
    GetProgress,
    #[serde(rename = "finalize")]
    Finalize,
    #[serde(rename = "delete_session")]
    DeleteSession,
    #[serde(rename = "list_sessions")]
    ListSessions,

    // Responses from server to client
    #[serde(rename = "session_created")]
    SessionCreated,
    #[serde(rename = "missing_chunks")]
    MissingChunks,
    #[serde(rename = "progress")]
    Progress,
    #[serde(rename = "chunk_ack")]
    ChunkAck,
    #[serde(rename = "finalized")]
    Finalized,
    #[serde(rename = "session_deleted")]
    SessionDeleted,
    #[serde(rename = "sessions")]
    Sessions,
    #[serde(rename = "file_stored")]
    FileStored,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Error codes carried in [`crate::envelope::WsError`].
pub const ERR_CODE_INVALID_REQUEST: i32 = 400;
pub const ERR_CODE_UNAUTHORIZED: i32 = 401;
pub const ERR_CODE_FORBIDDEN: i32 = 403;
pub const ERR_CODE_NOT_FOUND: i32 = 404;
pub const ERR_CODE_INCOMPLETE: i32 = 409;
pub const ERR_CODE_SIZE_MISMATCH: i32 = 412;
pub const ERR_CODE_OUT_OF_RANGE: i32 = 416;
pub const ERR_CODE_CHECKSUM_MISMATCH: i32 = 417;
pub const ERR_CODE_POLICY_VIOLATION: i32 = 422;
pub const ERR_CODE_INTERNAL: i32 = 500;
pub const ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
