//! WebSocket server for Ferry uploads.
//!
//! Accepts any number of client connections, authenticates each one with
//! a `hello` handshake, and dispatches JSON and binary messages to a
//! [`Handler`]. [`UploadHandler`] binds the handler to an
//! [`ferry_sessions::UploadSessionService`].

mod auth;
mod connection;
mod handler;
mod server;
mod upload;

pub use auth::{Authenticator, StaticTokens};
pub use connection::{ClientConnection, ClientMeta, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use server::{ServerConfig, UploadServer};
pub use upload::UploadHandler;

/// Send buffer capacity per connection.
///
/// Every chunk frame gets one ACK; with several workers sharing a
/// connection the buffer must absorb bursts without `try_send()` dropping
/// replies.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// Errors produced by the upload server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
