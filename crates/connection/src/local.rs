//! In-process [`SessionApi`] calling an [`UploadSessionService`] directly.
//!
//! Runs the queue against a service in the same process: no socket, no
//! serialization. Session errors map through the same wire codes a
//! remote client would see.

use std::sync::Arc;

use ferry_protocol::messages::{
    CreateSessionRequest, CreateSessionResponse, FileStoredResponse, FinalizeResponse,
};
use ferry_protocol::{Destination, SessionProgress, SessionSummary};
use ferry_queue::{ApiError, ApiFuture, OnSent, SessionApi};
use ferry_sessions::{Caller, SessionError, UploadSessionService};
use tokio_util::sync::CancellationToken;

pub struct LocalSessionApi {
    service: Arc<UploadSessionService>,
    caller: Caller,
}

impl LocalSessionApi {
    pub fn new(service: Arc<UploadSessionService>, caller: Caller) -> Self {
        Self { service, caller }
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }
}

fn api_error(e: SessionError) -> ApiError {
    ApiError::from_code(e.code(), e.to_string())
}

fn check(cancel: &CancellationToken) -> Result<(), ApiError> {
    if cancel.is_cancelled() {
        Err(ApiError::Cancelled)
    } else {
        Ok(())
    }
}

impl SessionApi for LocalSessionApi {
    fn create_session<'a>(
        &'a self,
        req: CreateSessionRequest,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, CreateSessionResponse> {
        Box::pin(async move {
            check(cancel)?;
            self.service
                .create_session(
                    &self.caller,
                    &req.filename,
                    req.total_size,
                    &req.destination,
                    req.chunk_size,
                )
                .await
                .map_err(api_error)
        })
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
            check(cancel)?;
            self.service
                .accept_chunk(&self.caller, session_id, index, &data, &checksum)
                .await
                .map_err(api_error)
        })
    }

    fn missing_chunks<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, Vec<u32>> {
        Box::pin(async move {
            check(cancel)?;
            self.service
                .missing_chunks(&self.caller, session_id)
                .await
                .map_err(api_error)
        })
    }

    fn progress<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, SessionProgress> {
        Box::pin(async move {
            check(cancel)?;
            self.service
                .progress(&self.caller, session_id)
                .await
                .map_err(api_error)
        })
    }

    fn finalize<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, FinalizeResponse> {
        Box::pin(async move {
            check(cancel)?;
            let stored = self
                .service
                .finalize(&self.caller, session_id)
                .await
                .map_err(api_error)?;
            Ok(FinalizeResponse {
                session_id: session_id.to_string(),
                path: stored.path.display().to_string(),
                size: stored.size,
            })
        })
    }

    fn delete_session<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            check(cancel)?;
            self.service
                .delete_session(&self.caller, session_id)
                .await
                .map_err(api_error)
        })
    }

    fn list_sessions<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, Vec<SessionSummary>> {
        Box::pin(async move {
            check(cancel)?;
            Ok(self.service.list_sessions(&self.caller))
        })
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
            check(cancel)?;
            let stored = self
                .service
                .store_file(&self.caller, filename, destination, &data)
                .await
                .map_err(api_error)?;
            on_sent(stored.size);
            Ok(FileStoredResponse {
                path: stored.path.display().to_string(),
                size: stored.size,
            })
        })
    }
}
