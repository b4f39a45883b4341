//! Transport-neutral view of the upload server.
//!
//! Implemented over WebSocket by `ferry-connection` and by in-memory
//! mocks in tests. Every call takes a [`CancellationToken`]; when it
//! fires the implementation abandons the in-flight request and returns
//! [`ApiError::Cancelled`].

use std::future::Future;
use std::pin::Pin;

use ferry_protocol::messages::{
    CreateSessionRequest, CreateSessionResponse, FileStoredResponse, FinalizeResponse,
};
use ferry_protocol::{Destination, SessionProgress, SessionSummary};
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;

/// A boxed future returned by [`SessionApi`] methods.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Byte-count observer for whole-file stores.
pub type OnSent<'a> = dyn Fn(u64) + Send + Sync + 'a;

/// Session operations the queue needs from the server.
pub trait SessionApi: Send + Sync {
    fn create_session<'a>(
        &'a self,
        req: CreateSessionRequest,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, CreateSessionResponse>;

    /// Uploads one chunk. `checksum` is the SHA-256 hex of `data`.
    fn send_chunk<'a>(
        &'a self,
        session_id: &'a str,
        index: u32,
        data: Vec<u8>,
        checksum: String,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, SessionProgress>;

    fn missing_chunks<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, Vec<u32>>;

    fn progress<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, SessionProgress>;

    fn finalize<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, FinalizeResponse>;

    fn delete_session<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, ()>;

    fn list_sessions<'a>(&'a self, cancel: &'a CancellationToken)
    -> ApiFuture<'a, Vec<SessionSummary>>;

    /// Stores a whole file without a session. `on_sent` observes how many
    /// bytes of `data` have left the client so far.
    fn store_file<'a>(
        &'a self,
        filename: &'a str,
        destination: &'a Destination,
        data: Vec<u8>,
        on_sent: &'a OnSent<'a>,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, FileStoredResponse>;
}
