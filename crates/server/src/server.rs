//! Upload WebSocket server.
//!
//! Listens on a TCP port, upgrades every connection to WebSocket and
//! serves each client independently.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use ferry_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::ServerError;
use crate::connection::{self, ClientConnection, ClientMeta};
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

/// The upload WebSocket server.
pub struct UploadServer<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    connections: Mutex<Vec<ClientConnection>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> UploadServer<H> {
    pub fn new(config: ServerConfig, handler: H) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler: Arc::new(handler),
            connections: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Number of live client connections.
    pub async fn connection_count(&self) -> usize {
        let mut conns = self.connections.lock().await;
        conns.retain(|c| c.is_connected());
        conns.len()
    }

    /// Token cancelled on shutdown; lets the caller tie other tasks to
    /// the server's lifetime.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Gracefully shuts down the server and every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.bind, self.config.port);
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("upload server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    for conn in self.connections.lock().await.drain(..) {
                        conn.close();
                    }
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades a TCP connection to WebSocket and starts its pumps.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;
        tracing::info!(%peer_addr, "WebSocket connection established");

        let meta = ClientMeta {
            remote_addr: peer_addr.to_string(),
        };
        let conn = connection::spawn_connection(
            ws_stream,
            meta,
            Arc::clone(&self.handler),
            self.cancel.clone(),
        );

        let mut conns = self.connections.lock().await;
        conns.retain(|c| c.is_connected());
        conns.push(conn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::connection::Sender;
    use crate::handler::HandlerFuture;
    use ferry_protocol::constants::{ERR_CODE_NOT_IMPLEMENTED, ERR_CODE_UNAUTHORIZED};
    use ferry_protocol::envelope::Message;
    use ferry_protocol::messages::HelloRequest;
    use ferry_protocol::{ChunkHeader, MessageType, encode_frame};
    use ferry_sessions::Caller;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    /// Accepts the token "good" and implements nothing else.
    struct TestHandler;

    impl Handler for TestHandler {
        fn on_hello(&self, sender: Sender, msg: Message) -> HandlerFuture<'_, Option<Caller>> {
            Box::pin(async move {
                let req: Option<HelloRequest> = msg.parse_payload().ok().flatten();
                if req.is_some_and(|r| r.token == "good") {
                    let reply = msg.reply::<()>(MessageType::HelloOk, None).unwrap();
                    let _ = sender.send_msg(reply);
                    Some(Caller::user("alice"))
                } else {
                    let _ = sender.send_error(&msg, ERR_CODE_UNAUTHORIZED, "bad token");
                    None
                }
            })
        }
    }

    async fn start() -> (Arc<UploadServer<TestHandler>>, tokio::task::JoinHandle<()>, String) {
        let server = UploadServer::new(ServerConfig::default(), TestHandler);
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });
        for _ in 0..100 {
            if server.port().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let url = format!("ws://127.0.0.1:{}", server.port().await);
        (server, handle, url)
    }

    async fn next_reply<S>(ws: &mut S) -> Message
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn text(msg: &Message) -> WsMessage {
        WsMessage::Text(serde_json::to_string(msg).unwrap().into())
    }

    #[tokio::test]
    async fn server_binds_dynamic_port() {
        let (server, handle, _) = start().await;
        assert!(server.port().await > 0);
        assert_eq!(server.connection_count().await, 0);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn serves_several_clients() {
        let (server, handle, url) = start().await;
        let (_ws1, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (_ws2, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connection_count().await, 2);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn requests_before_hello_are_unauthorized() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let req = Message::new::<()>("r1", MessageType::ListSessions, None).unwrap();
        ws.send(text(&req)).await.unwrap();
        let reply = next_reply(&mut ws).await;
        assert_eq!(reply.id, "r1");
        assert_eq!(reply.error.unwrap().code, ERR_CODE_UNAUTHORIZED);

        let header = ChunkHeader {
            id: "c1".into(),
            session_id: "s".into(),
            index: 0,
            checksum: String::new(),
        };
        ws.send(WsMessage::Binary(encode_frame(&header, b"x").unwrap().into()))
            .await
            .unwrap();
        let reply = next_reply(&mut ws).await;
        assert_eq!(reply.id, "c1");
        assert_eq!(reply.error.unwrap().code, ERR_CODE_UNAUTHORIZED);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn hello_then_unimplemented_request() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let bad = Message::new(
            "h0",
            MessageType::Hello,
            Some(&HelloRequest {
                token: "bad".into(),
                client_name: String::new(),
            }),
        )
        .unwrap();
        ws.send(text(&bad)).await.unwrap();
        assert_eq!(next_reply(&mut ws).await.error.unwrap().code, ERR_CODE_UNAUTHORIZED);

        let hello = Message::new(
            "h1",
            MessageType::Hello,
            Some(&HelloRequest {
                token: "good".into(),
                client_name: "test".into(),
            }),
        )
        .unwrap();
        ws.send(text(&hello)).await.unwrap();
        assert_eq!(next_reply(&mut ws).await.msg_type, MessageType::HelloOk);

        let req = Message::new::<()>("r2", MessageType::ListSessions, None).unwrap();
        ws.send(text(&req)).await.unwrap();
        let reply = next_reply(&mut ws).await;
        assert_eq!(reply.id, "r2");
        assert_eq!(reply.error.unwrap().code, ERR_CODE_NOT_IMPLEMENTED);

        let ping = Message::new::<()>("p1", MessageType::Ping, None).unwrap();
        ws.send(text(&ping)).await.unwrap();
        assert_eq!(next_reply(&mut ws).await.msg_type, MessageType::Pong);

        server.shutdown();
        handle.await.unwrap();
    }
}
