//! Client connection management: read/write pumps, ping/pong, send
//! buffering and per-connection identity.

use std::sync::Arc;

use ferry_protocol::binary::{BinaryFrame, parse_frame};
use ferry_protocol::constants::{
    ERR_CODE_NOT_IMPLEMENTED, ERR_CODE_UNAUTHORIZED, MessageType, WS_MAX_MESSAGE_SIZE,
    WS_PING_PERIOD, WS_PONG_WAIT,
};
use ferry_protocol::envelope::Message;
use ferry_sessions::Caller;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::handler::Handler;

/// Metadata about a connected client.
#[derive(Debug, Clone)]
pub struct ClientMeta {
    pub remote_addr: String,
}

/// Handle for sending messages to a connected client.
///
/// Cloneable and cheap; wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` only if the channel is full or closed.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to a client.
///
/// Owns the read/write pump tasks and provides a [`Sender`] for
/// asynchronous message delivery.
pub struct ClientConnection {
    pub meta: ClientMeta,
    sender: Sender,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_connected() && !self.cancel.is_cancelled()
    }

    /// Signals the pumps to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Runs the read and write pumps for a WebSocket connection.
///
/// The pumps run as background tokio tasks and stop when the connection
/// is closed or the cancel token fires.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    meta: ClientMeta,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> ClientConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };

    let conn = ClientConnection {
        meta: meta.clone(),
        sender: sender.clone(),
        cancel: cancel.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let read_cancel = cancel.clone();
    tokio::spawn(async move {
        let caller = read_pump(ws_stream, sender, Arc::clone(&handler), read_cancel.clone()).await;
        // When the read pump exits, stop the write pump too.
        read_cancel.cancel();
        let user = caller.as_ref().map(|c| c.id.clone()).unwrap_or_default();
        handler.on_disconnected(caller).await;
        tracing::info!(peer = %meta.remote_addr, user, "client disconnected");
    });

    conn
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches to the handler.
///
/// Returns the caller bound to the connection, if any.
async fn read_pump<S, H>(
    mut stream: S,
    sender: Sender,
    handler: Arc<H>,
    cancel: CancellationToken,
) -> Option<Caller>
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    pong_deadline.reset();
    let mut got_pong = true;
    let mut caller: Option<Caller> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !got_pong {
                    tracing::warn!("pong timeout, closing connection");
                    break;
                }
                got_pong = false;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                                    continue;
                                }
                                dispatch_text(&handler, &sender, &mut caller, &text).await;
                            }
                            WsMessage::Binary(data) => {
                                if data.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!("binary message exceeds max size ({} > {})", data.len(), WS_MAX_MESSAGE_SIZE);
                                    continue;
                                }
                                dispatch_binary(&handler, &sender, caller.as_ref(), &data);
                            }
                            WsMessage::Pong(_) => {
                                got_pong = true;
                                pong_deadline.reset();
                            }
                            WsMessage::Ping(data) => {
                                got_pong = true;
                                let _ = sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Close(_) => {
                                tracing::debug!("received close frame");
                                break;
                            }
                            WsMessage::Frame(_) => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    caller
}

/// Dispatches a text (JSON) message.
///
/// `hello` and `ping` are handled inline so the identity is bound before
/// the next frame is read; session requests run as their own tasks.
async fn dispatch_text<H: Handler>(
    handler: &Arc<H>,
    sender: &Sender,
    caller: &mut Option<Caller>,
    text: &str,
) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("invalid message JSON: {e}");
            return;
        }
    };

    match msg.msg_type {
        MessageType::Hello => {
            if let Some(bound) = handler.on_hello(sender.clone(), msg).await {
                tracing::info!(user = %bound.id, admin = bound.is_admin, "client authenticated");
                *caller = Some(bound);
            }
            return;
        }
        MessageType::Ping => {
            handler.on_ping(sender.clone(), msg).await;
            return;
        }
        _ => {}
    }

    let Some(caller) = caller.clone() else {
        let _ = sender.send_error(&msg, ERR_CODE_UNAUTHORIZED, "hello required");
        return;
    };

    let handler = Arc::clone(handler);
    let s = sender.clone();
    tokio::spawn(async move {
        match msg.msg_type {
            MessageType::CreateSession => handler.on_create_session(s, caller, msg).await,
            MessageType::GetMissing => handler.on_get_missing(s, caller, msg).await,
            MessageType::GetProgress => handler.on_get_progress(s, caller, msg).await,
            MessageType::Finalize => handler.on_finalize(s, caller, msg).await,
            MessageType::DeleteSession => handler.on_delete_session(s, caller, msg).await,
            MessageType::ListSessions => handler.on_list_sessions(s, caller, msg).await,
            _ => {
                tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
                let _ = s.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "unknown message type");
            }
        }
    });
}

/// Dispatches a binary frame as its own task.
fn dispatch_binary<H: Handler>(
    handler: &Arc<H>,
    sender: &Sender,
    caller: Option<&Caller>,
    data: &[u8],
) {
    let frame = match parse_frame(data) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!("failed to parse binary frame: {e}");
            return;
        }
    };

    let Some(caller) = caller.cloned() else {
        let _ = sender.send_msg(Message::error(
            frame.id(),
            ERR_CODE_UNAUTHORIZED,
            "hello required",
        ));
        return;
    };

    let handler = Arc::clone(handler);
    let s = sender.clone();
    tokio::spawn(async move {
        match frame {
            BinaryFrame::Chunk { header, data } => handler.on_chunk(s, caller, header, data).await,
            BinaryFrame::File { header, data } => {
                handler.on_store_file(s, caller, header, data).await
            }
        }
    });
}
