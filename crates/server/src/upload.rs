//! [`Handler`] implementation backed by an [`UploadSessionService`].

use std::sync::Arc;

use ferry_protocol::constants::{
    ERR_CODE_INTERNAL, ERR_CODE_INVALID_REQUEST, ERR_CODE_UNAUTHORIZED,
};
use ferry_protocol::envelope::Message;
use ferry_protocol::messages::{
    ChunkAck, CreateSessionRequest, FileStoredResponse, FinalizeResponse, HelloRequest,
    HelloResponse, MissingChunksResponse, ProgressResponse, SessionRequest, SessionsResponse,
};
use ferry_protocol::{ChunkHeader, FileHeader, MessageType};
use ferry_sessions::{Caller, SessionError, UploadSessionService};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::auth::Authenticator;
use crate::connection::Sender;
use crate::handler::{Handler, HandlerFuture};

/// Serves session requests from authenticated clients.
pub struct UploadHandler {
    service: Arc<UploadSessionService>,
    auth: Arc<dyn Authenticator>,
}

impl UploadHandler {
    pub fn new(service: Arc<UploadSessionService>, auth: Arc<dyn Authenticator>) -> Self {
        Self { service, auth }
    }
}

impl Handler for UploadHandler {
    fn on_hello(&self, sender: Sender, msg: Message) -> HandlerFuture<'_, Option<Caller>> {
        Box::pin(async move {
            let req: HelloRequest = parse_request(&sender, &msg)?;
            let Some(caller) = self.auth.authenticate(&req.token) else {
                warn!(client = %req.client_name, "rejected hello with unknown token");
                let _ = sender.send_error(&msg, ERR_CODE_UNAUTHORIZED, "invalid token");
                return None;
            };
            let resp = HelloResponse {
                user: caller.id.clone(),
                is_admin: caller.is_admin,
                server_version: env!("CARGO_PKG_VERSION").to_string(),
            };
            send_reply(&sender, &msg, MessageType::HelloOk, &resp);
            Some(caller)
        })
    }

    fn on_create_session(&self, sender: Sender, caller: Caller, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = parse_request::<CreateSessionRequest>(&sender, &msg) else {
                return;
            };
            match self
                .service
                .create_session(
                    &caller,
                    &req.filename,
                    req.total_size,
                    &req.destination,
                    req.chunk_size,
                )
                .await
            {
                Ok(resp) => send_reply(&sender, &msg, MessageType::SessionCreated, &resp),
                Err(e) => send_failure(&sender, &msg, &caller, e),
            }
        })
    }

    fn on_get_missing(&self, sender: Sender, caller: Caller, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = parse_request::<SessionRequest>(&sender, &msg) else {
                return;
            };
            match self.service.missing_chunks(&caller, &req.session_id).await {
                Ok(missing) => {
                    let resp = MissingChunksResponse {
                        session_id: req.session_id,
                        missing,
                    };
                    send_reply(&sender, &msg, MessageType::MissingChunks, &resp);
                }
                Err(e) => send_failure(&sender, &msg, &caller, e),
            }
        })
    }

    fn on_get_progress(&self, sender: Sender, caller: Caller, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = parse_request::<SessionRequest>(&sender, &msg) else {
                return;
            };
            match self.service.progress(&caller, &req.session_id).await {
                Ok(progress) => {
                    let resp = ProgressResponse {
                        session_id: req.session_id,
                        progress,
                    };
                    send_reply(&sender, &msg, MessageType::Progress, &resp);
                }
                Err(e) => send_failure(&sender, &msg, &caller, e),
            }
        })
    }

    fn on_finalize(&self, sender: Sender, caller: Caller, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = parse_request::<SessionRequest>(&sender, &msg) else {
                return;
            };
            match self.service.finalize(&caller, &req.session_id).await {
                Ok(stored) => {
                    let resp = FinalizeResponse {
                        session_id: req.session_id,
                        path: stored.path.display().to_string(),
                        size: stored.size,
                    };
                    send_reply(&sender, &msg, MessageType::Finalized, &resp);
                }
                Err(e) => send_failure(&sender, &msg, &caller, e),
            }
        })
    }

    fn on_delete_session(&self, sender: Sender, caller: Caller, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = parse_request::<SessionRequest>(&sender, &msg) else {
                return;
            };
            match self.service.delete_session(&caller, &req.session_id).await {
                Ok(()) => send_reply(&sender, &msg, MessageType::SessionDeleted, &req),
                Err(e) => send_failure(&sender, &msg, &caller, e),
            }
        })
    }

    fn on_list_sessions(&self, sender: Sender, caller: Caller, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let resp = SessionsResponse {
                sessions: self.service.list_sessions(&caller),
            };
            send_reply(&sender, &msg, MessageType::Sessions, &resp);
        })
    }

    fn on_chunk(
        &self,
        sender: Sender,
        caller: Caller,
        header: ChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = self
                .service
                .accept_chunk(
                    &caller,
                    &header.session_id,
                    header.index,
                    &data,
                    &header.checksum,
                )
                .await;
            let reply = match result {
                Ok(progress) => {
                    let ack = ChunkAck {
                        session_id: header.session_id,
                        index: header.index,
                        progress,
                    };
                    Message::new(&header.id, MessageType::ChunkAck, Some(&ack))
                        .unwrap_or_else(|e| Message::error(&header.id, ERR_CODE_INTERNAL, e.to_string()))
                }
                Err(e) => {
                    debug!(
                        session = %header.session_id,
                        index = header.index,
                        user = %caller.id,
                        "chunk rejected: {e}"
                    );
                    Message::error(&header.id, e.code(), e.to_string())
                }
            };
            let _ = sender.send_msg(reply);
        })
    }

    fn on_store_file(
        &self,
        sender: Sender,
        caller: Caller,
        header: FileHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let actual = data.len() as u64;
            if actual != header.size {
                // An abandoned upload ends its frame early.
                let err = SessionError::SizeMismatch {
                    expected: header.size,
                    actual,
                };
                debug!(filename = %header.filename, user = %caller.id, "file rejected: {err}");
                let _ = sender.send_msg(Message::error(&header.id, err.code(), err.to_string()));
                return;
            }
            let result = self
                .service
                .store_file(&caller, &header.filename, &header.destination, &data)
                .await;
            let reply = match result {
                Ok(stored) => {
                    let resp = FileStoredResponse {
                        path: stored.path.display().to_string(),
                        size: stored.size,
                    };
                    Message::new(&header.id, MessageType::FileStored, Some(&resp))
                        .unwrap_or_else(|e| Message::error(&header.id, ERR_CODE_INTERNAL, e.to_string()))
                }
                Err(e) => {
                    debug!(filename = %header.filename, user = %caller.id, "file rejected: {e}");
                    Message::error(&header.id, e.code(), e.to_string())
                }
            };
            let _ = sender.send_msg(reply);
        })
    }
}

/// Decodes the request payload, replying 400 when it is missing or malformed.
fn parse_request<T: DeserializeOwned>(sender: &Sender, msg: &Message) -> Option<T> {
    match msg.parse_payload::<T>() {
        Ok(Some(req)) => Some(req),
        Ok(None) => {
            let _ = sender.send_error(msg, ERR_CODE_INVALID_REQUEST, "missing payload");
            None
        }
        Err(e) => {
            let _ = sender.send_error(msg, ERR_CODE_INVALID_REQUEST, &format!("invalid payload: {e}"));
            None
        }
    }
}

fn send_reply<T: Serialize>(sender: &Sender, req: &Message, msg_type: MessageType, payload: &T) {
    match req.reply(msg_type, Some(payload)) {
        Ok(reply) => {
            let _ = sender.send_msg(reply);
        }
        Err(e) => {
            warn!("failed to encode reply: {e}");
            let _ = sender.send_error(req, ERR_CODE_INTERNAL, "failed to encode reply");
        }
    }
}

fn send_failure(sender: &Sender, req: &Message, caller: &Caller, err: SessionError) {
    match &err {
        SessionError::Io(_) | SessionError::Json(_) => {
            warn!(user = %caller.id, msg_type = ?req.msg_type, "request failed: {err}");
        }
        _ => debug!(user = %caller.id, msg_type = ?req.msg_type, "request rejected: {err}"),
    }
    let _ = sender.send_error(req, err.code(), &err.to_string());
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::auth::StaticTokens;
    use ferry_protocol::Destination;
    use ferry_protocol::constants::{
        ERR_CODE_INCOMPLETE, ERR_CODE_NOT_FOUND, ERR_CODE_SIZE_MISMATCH,
    };
    use ferry_protocol::messages::CreateSessionResponse;
    use ferry_sessions::{SessionLimits, StaticPolicy, ZoneResolver};
    use ferry_transfer::{ChunkStore, checksum_bytes};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    async fn handler(dir: &TempDir) -> UploadHandler {
        let store = ChunkStore::open(dir.path().join("scratch")).await.unwrap();
        let resolver = ZoneResolver::new(HashMap::from([(
            "media".to_string(),
            dir.path().join("media"),
        )]));
        let limits = SessionLimits {
            default_chunk_size: 4,
            min_chunk_size: 1,
            max_chunk_size: 1024,
            ..SessionLimits::default()
        };
        let service = UploadSessionService::open(
            store,
            Arc::new(StaticPolicy::default()),
            Arc::new(resolver),
            limits,
        )
        .await
        .unwrap();
        let tokens = StaticTokens::new(HashMap::from([(
            "t-alice".to_string(),
            Caller::user("alice"),
        )]));
        UploadHandler::new(Arc::new(service), Arc::new(tokens))
    }

    fn next_reply(rx: &mut mpsc::Receiver<WsMessage>) -> Message {
        match rx.try_recv().unwrap() {
            WsMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn hello_binds_caller_or_rejects() {
        let dir = TempDir::new().unwrap();
        let h = handler(&dir).await;
        let (sender, mut rx) = Sender::channel(8);

        let ok = Message::new(
            "1",
            MessageType::Hello,
            Some(&HelloRequest {
                token: "t-alice".into(),
                client_name: "test".into(),
            }),
        )
        .unwrap();
        assert_eq!(h.on_hello(sender.clone(), ok).await, Some(Caller::user("alice")));
        let reply = next_reply(&mut rx);
        assert_eq!(reply.msg_type, MessageType::HelloOk);
        let resp: HelloResponse = reply.parse_payload().unwrap().unwrap();
        assert_eq!(resp.user, "alice");

        let bad = Message::new(
            "2",
            MessageType::Hello,
            Some(&HelloRequest {
                token: "guess".into(),
                client_name: String::new(),
            }),
        )
        .unwrap();
        assert_eq!(h.on_hello(sender, bad).await, None);
        let reply = next_reply(&mut rx);
        assert_eq!(reply.id, "2");
        assert_eq!(reply.error.unwrap().code, ERR_CODE_UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_payload_is_invalid_request() {
        let dir = TempDir::new().unwrap();
        let h = handler(&dir).await;
        let (sender, mut rx) = Sender::channel(8);

        let msg = Message::new::<()>("7", MessageType::CreateSession, None).unwrap();
        h.on_create_session(sender, Caller::user("alice"), msg).await;
        assert_eq!(next_reply(&mut rx).error.unwrap().code, ERR_CODE_INVALID_REQUEST);
    }

    #[tokio::test]
    async fn short_file_frame_is_not_stored() {
        let dir = TempDir::new().unwrap();
        let h = handler(&dir).await;
        let (sender, mut rx) = Sender::channel(8);

        let header = FileHeader::new("w", "cut.bin", Destination::new("media", ""), 10);
        h.on_store_file(sender.clone(), Caller::user("alice"), header, b"only6b".to_vec())
            .await;
        let reply = next_reply(&mut rx);
        assert_eq!(reply.id, "w");
        assert_eq!(reply.error.unwrap().code, ERR_CODE_SIZE_MISMATCH);
        assert!(!dir.path().join("media/cut.bin").exists());

        let header = FileHeader::new("w2", "whole.bin", Destination::new("media", ""), 6);
        h.on_store_file(sender, Caller::user("alice"), header, b"all6b!".to_vec())
            .await;
        let stored: FileStoredResponse = next_reply(&mut rx).parse_payload().unwrap().unwrap();
        assert_eq!(stored.size, 6);
    }

    #[tokio::test]
    async fn session_lifecycle_through_handler() {
        let dir = TempDir::new().unwrap();
        let h = handler(&dir).await;
        let (sender, mut rx) = Sender::channel(16);
        let alice = Caller::user("alice");

        let create = Message::new(
            "c",
            MessageType::CreateSession,
            Some(&CreateSessionRequest {
                filename: "hello.txt".into(),
                total_size: 6,
                destination: Destination::new("media", "inbox"),
                chunk_size: None,
            }),
        )
        .unwrap();
        h.on_create_session(sender.clone(), alice.clone(), create).await;
        let created: CreateSessionResponse = next_reply(&mut rx).parse_payload().unwrap().unwrap();
        assert_eq!(created.total_chunks, 2);

        // Finalizing early reports the gap.
        let finalize = Message::new(
            "f1",
            MessageType::Finalize,
            Some(&SessionRequest {
                session_id: created.session_id.clone(),
            }),
        )
        .unwrap();
        h.on_finalize(sender.clone(), alice.clone(), finalize).await;
        assert_eq!(next_reply(&mut rx).error.unwrap().code, ERR_CODE_INCOMPLETE);

        for (index, bytes) in [(1u32, &b"!!"[..]), (0, &b"hell"[..])] {
            let header = ChunkHeader {
                id: format!("k{index}"),
                session_id: created.session_id.clone(),
                index,
                checksum: checksum_bytes(bytes),
            };
            h.on_chunk(sender.clone(), alice.clone(), header, bytes.to_vec()).await;
            let reply = next_reply(&mut rx);
            assert_eq!(reply.msg_type, MessageType::ChunkAck);
            let ack: ChunkAck = reply.parse_payload().unwrap().unwrap();
            assert_eq!(ack.index, index);
        }

        let finalize = Message::new(
            "f2",
            MessageType::Finalize,
            Some(&SessionRequest {
                session_id: created.session_id.clone(),
            }),
        )
        .unwrap();
        h.on_finalize(sender.clone(), alice.clone(), finalize).await;
        let done: FinalizeResponse = next_reply(&mut rx).parse_payload().unwrap().unwrap();
        assert_eq!(done.size, 6);
        assert_eq!(
            std::fs::read(dir.path().join("media/inbox/hello.txt")).unwrap(),
            b"hell!!"
        );

        // The session is gone; late chunks are told so.
        let late = ChunkHeader {
            id: "late".into(),
            session_id: created.session_id,
            index: 0,
            checksum: String::new(),
        };
        h.on_chunk(sender, alice, late, b"hell".to_vec()).await;
        let reply = next_reply(&mut rx);
        assert_eq!(reply.id, "late");
        assert_eq!(reply.error.unwrap().code, ERR_CODE_NOT_FOUND);
    }
}
