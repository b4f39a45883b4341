//! A [`SessionApi`] that redials the server after the connection drops.

use std::sync::Arc;

use ferry_protocol::messages::{
    CreateSessionRequest, CreateSessionResponse, FileStoredResponse, FinalizeResponse,
    HelloRequest, HelloResponse,
};
use ferry_protocol::{Destination, SessionProgress, SessionSummary};
use ferry_queue::{ApiError, ApiFuture, OnSent, SessionApi};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::cancellable;
use crate::ws_client::WsClient;

/// Holds at most one live [`WsClient`] and replaces it on demand.
///
/// Calls made while disconnected dial first. A failed dial is reported
/// as [`ApiError::NetworkInterrupted`] (or the server's rejection), so
/// the queue's retry loop paces reconnection attempts.
pub struct ReconnectingClient {
    url: String,
    hello: HelloRequest,
    current: Mutex<Option<Arc<WsClient>>>,
}

impl ReconnectingClient {
    pub fn new(url: impl Into<String>, hello: HelloRequest) -> Self {
        Self {
            url: url.into(),
            hello,
            current: Mutex::new(None),
        }
    }

    /// Dials now and returns the server's greeting.
    pub async fn connect(&self) -> Result<HelloResponse, ApiError> {
        let mut current = self.current.lock().await;
        let (client, welcome) = WsClient::connect(&self.url, &self.hello).await?;
        *current = Some(Arc::new(client));
        Ok(welcome)
    }

    /// Returns the live client, dialing if there is none.
    ///
    /// Waiting behind another caller's dial honors `cancel`.
    async fn client(&self, cancel: &CancellationToken) -> Result<Arc<WsClient>, ApiError> {
        let mut current = tokio::select! {
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            guard = self.current.lock() => guard,
        };
        if let Some(client) = current.as_ref().filter(|c| c.is_connected()) {
            return Ok(Arc::clone(client));
        }
        if current.take().is_some() {
            warn!(url = %self.url, "connection lost, reconnecting");
        }

        let (client, _) = cancellable(cancel, WsClient::connect(&self.url, &self.hello)).await?;
        info!(url = %self.url, "reconnected");
        let client = Arc::new(client);
        *current = Some(Arc::clone(&client));
        Ok(client)
    }

    pub async fn close(&self) {
        if let Some(client) = self.current.lock().await.take() {
            client.close();
        }
    }
}

impl SessionApi for ReconnectingClient {
    fn create_session<'a>(
        &'a self,
        req: CreateSessionRequest,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, CreateSessionResponse> {
        Box::pin(async move { self.client(cancel).await?.create_session(req, cancel).await })
    }

    fn send_chunk<'a>(
        &'a self,
        session_id: &'a str,
        index: u32,
        data: Vec<u8>,
        checksum: String,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, SessionProgress> {
        Box::pin(async move {
            self.client(cancel)
                .await?
                .send_chunk(session_id, index, data, checksum, cancel)
                .await
        })
    }

    fn missing_chunks<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, Vec<u32>> {
        Box::pin(async move {
            self.client(cancel)
                .await?
                .missing_chunks(session_id, cancel)
                .await
        })
    }

    fn progress<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, SessionProgress> {
        Box::pin(async move { self.client(cancel).await?.progress(session_id, cancel).await })
    }

    fn finalize<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, FinalizeResponse> {
        Box::pin(async move { self.client(cancel).await?.finalize(session_id, cancel).await })
    }

    fn delete_session<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.client(cancel)
                .await?
                .delete_session(session_id, cancel)
                .await
        })
    }

    fn list_sessions<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, Vec<SessionSummary>> {
        Box::pin(async move { self.client(cancel).await?.list_sessions(cancel).await })
    }

    fn store_file<'a>(
        &'a self,
        filename: &'a str,
        destination: &'a Destination,
        data: Vec<u8>,
        on_sent: &'a OnSent<'a>,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, FileStoredResponse> {
        Box::pin(async move {
            self.client(cancel)
                .await?
                .store_file(filename, destination, data, on_sent, cancel)
                .await
        })
    }
}
