//! [`SessionApi`] over a [`WsClient`].

use std::future::Future;

use ferry_protocol::messages::{
    ChunkAck, CreateSessionRequest, CreateSessionResponse, FileStoredResponse, FinalizeResponse,
    MissingChunksResponse, ProgressResponse, SessionRequest, SessionsResponse,
};
use ferry_protocol::{ChunkHeader, Destination, FileHeader, MessageType, SessionProgress, SessionSummary};
use ferry_queue::{ApiError, ApiFuture, OnSent, SessionApi};
use tokio_util::sync::CancellationToken;

use crate::ws_client::{WsClient, WsError};

impl From<WsError> for ApiError {
    fn from(e: WsError) -> Self {
        match e {
            WsError::Server { code, message } => ApiError::from_code(code, message),
            WsError::Timeout | WsError::Closed | WsError::Ws(_) => {
                ApiError::NetworkInterrupted(e.to_string())
            }
            WsError::Json(_) | WsError::Protocol(_) => ApiError::Protocol(e.to_string()),
        }
    }
}

/// Runs `fut` unless `cancel` fires first; the abandoned request's reply
/// is dropped by the read pump.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, WsError>>,
) -> Result<T, ApiError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ApiError::Cancelled),
        result = fut => result.map_err(ApiError::from),
    }
}

fn session_request(session_id: &str) -> SessionRequest {
    SessionRequest {
        session_id: session_id.to_string(),
    }
}

impl SessionApi for WsClient {
    fn create_session<'a>(
        &'a self,
        req: CreateSessionRequest,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, CreateSessionResponse> {
        Box::pin(async move {
            cancellable(cancel, self.request(MessageType::CreateSession, Some(&req))).await
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
            let header = ChunkHeader {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: session_id.to_string(),
                index,
                checksum,
            };
            let ack: ChunkAck =
                cancellable(cancel, self.send_binary(&header.id, &header, &data)).await?;
            if ack.index != index {
                return Err(ApiError::Protocol(format!(
                    "ack for chunk {} while sending {index}",
                    ack.index
                )));
            }
            Ok(ack.progress)
        })
    }

    fn missing_chunks<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, Vec<u32>> {
        Box::pin(async move {
            let req = session_request(session_id);
            let resp: MissingChunksResponse =
                cancellable(cancel, self.request(MessageType::GetMissing, Some(&req))).await?;
            Ok(resp.missing)
        })
    }

    fn progress<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, SessionProgress> {
        Box::pin(async move {
            let req = session_request(session_id);
            let resp: ProgressResponse =
                cancellable(cancel, self.request(MessageType::GetProgress, Some(&req))).await?;
            Ok(resp.progress)
        })
    }

    fn finalize<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, FinalizeResponse> {
        Box::pin(async move {
            let req = session_request(session_id);
            cancellable(cancel, self.request(MessageType::Finalize, Some(&req))).await
        })
    }

    fn delete_session<'a>(
        &'a self,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let req = session_request(session_id);
            cancellable(cancel, self.send_request(MessageType::DeleteSession, Some(&req))).await?;
            Ok(())
        })
    }

    fn list_sessions<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> ApiFuture<'a, Vec<SessionSummary>> {
        Box::pin(async move {
            let resp: SessionsResponse =
                cancellable(cancel, self.request::<(), _>(MessageType::ListSessions, None)).await?;
            Ok(resp.sessions)
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
            let header = FileHeader::new(
                uuid::Uuid::new_v4().to_string(),
                filename,
                destination.clone(),
                data.len() as u64,
            );
            cancellable(
                cancel,
                self.send_binary_tracked(&header.id, &header, &data, on_sent),
            )
            .await
        })
    }
}
