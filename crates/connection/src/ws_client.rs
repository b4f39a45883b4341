//! WebSocket client for the upload server.
//!
//! Requests carry a UUID id; the read pump hands each reply to the
//! request waiting on that id. A connection starts with a `hello`
//! handshake and is unusable after it drops.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ferry_protocol::constants::{
    MessageType, WS_BINARY_REQUEST_TIMEOUT, WS_MAX_MESSAGE_SIZE, WS_REQUEST_TIMEOUT,
};
use ferry_protocol::messages::{HelloRequest, HelloResponse};
use ferry_protocol::{Message, encode_frame};

use crate::pumps::{self, Outgoing, PendingMap};

/// Outbound frames buffered before senders wait.
const WRITE_BUFFER: usize = 256;

/// Bytes per WebSocket frame in a fragmented binary message.
const FRAGMENT_SIZE: usize = 256 * 1024;

/// Fragments queued ahead of the socket during a tracked send.
const FRAGMENT_WINDOW: usize = 4;

/// Errors from the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("unexpected reply: {0}")]
    Protocol(String),
}

/// Removes a pending entry when its request finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(self.id);
    }
}

/// Terminates a fragmented message abandoned part way, so the next data
/// frame on the socket starts a new message. The server sees a short
/// payload and rejects it.
struct Unfinished<'a> {
    write_tx: &'a mpsc::Sender<Outgoing>,
    cancel: &'a CancellationToken,
    armed: bool,
}

impl Drop for Unfinished<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let fin = Frame::message(Vec::new(), OpCode::Data(Data::Continue), true);
        if self
            .write_tx
            .try_send(tungstenite::Message::Frame(fin).into())
            .is_err()
        {
            debug!("cannot terminate abandoned message, dropping connection");
            self.cancel.cancel();
        }
    }
}

/// An authenticated connection to one upload server.
pub struct WsClient {
    write_tx: mpsc::Sender<Outgoing>,
    /// Held while a data message is being queued; fragments of one
    /// message must not interleave with another.
    send_lock: tokio::sync::Mutex<()>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    read_handle: tokio::task::JoinHandle<()>,
    write_handle: tokio::task::JoinHandle<()>,
}

impl WsClient {
    /// Connects to `url` and performs the `hello` handshake.
    ///
    /// A rejected token surfaces as [`WsError::Server`] with code 401; a
    /// peer that never completes the WebSocket handshake as
    /// [`WsError::Timeout`].
    pub async fn connect(url: &str, hello: &HelloRequest) -> Result<(Self, HelloResponse), WsError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let dial = tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false);
        let (ws_stream, _) = tokio::time::timeout(WS_REQUEST_TIMEOUT, dial)
            .await
            .map_err(|_| WsError::Timeout)??;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel(WRITE_BUFFER);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(pumps::write::write_pump(write, write_rx, cancel.clone()));
        let read_handle = tokio::spawn(pumps::read::read_pump(
            read,
            pending.clone(),
            write_tx.clone(),
            connected.clone(),
            cancel.clone(),
        ));

        let client = Self {
            write_tx,
            send_lock: tokio::sync::Mutex::new(()),
            pending,
            connected,
            cancel,
            read_handle,
            write_handle,
        };

        let welcome: HelloResponse = client.request(MessageType::Hello, Some(hello)).await?;
        info!(
            url,
            user = %welcome.user,
            server_version = %welcome.server_version,
            "connected to upload server"
        );
        Ok((client, welcome))
    }

    /// Returns `true` until the connection drops or is closed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// Sends a text request and returns the raw reply.
    pub async fn send_request<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, WsError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;
        self.exchange(&id, tungstenite::Message::Text(json.into()), WS_REQUEST_TIMEOUT)
            .await
    }

    /// Sends a text request and decodes the reply payload.
    pub async fn request<T: Serialize, R: DeserializeOwned>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<R, WsError> {
        let reply = self.send_request(msg_type, payload).await?;
        decode(&reply)
    }

    /// Sends a binary frame whose header carries `id` and returns the
    /// decoded reply.
    ///
    /// Wire format: `[4 bytes big-endian header length][JSON header][data]`.
    pub async fn send_binary<H: Serialize, R: DeserializeOwned>(
        &self,
        id: &str,
        header: &H,
        data: &[u8],
    ) -> Result<R, WsError> {
        let frame = encode_frame(header, data)?;
        let reply = self
            .exchange(
                id,
                tungstenite::Message::Binary(frame.into()),
                WS_BINARY_REQUEST_TIMEOUT,
            )
            .await?;
        decode(&reply)
    }

    /// Like [`send_binary`](Self::send_binary), but writes the frame as a
    /// fragmented message and calls `on_sent` with the number of `data`
    /// bytes the socket has taken after each fragment.
    pub async fn send_binary_tracked<H: Serialize, R: DeserializeOwned>(
        &self,
        id: &str,
        header: &H,
        data: &[u8],
        on_sent: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<R, WsError> {
        let frame = encode_frame(header, data)?;
        let prefix = frame.len() - data.len();
        let (rx, _guard) = self.register(id)?;

        let mut acks = VecDeque::with_capacity(FRAGMENT_WINDOW);
        {
            let _sending = self.send_lock.lock().await;
            let mut unfinished = Unfinished {
                write_tx: &self.write_tx,
                cancel: &self.cancel,
                armed: true,
            };
            let count = frame.len().div_ceil(FRAGMENT_SIZE);
            for (i, piece) in frame.chunks(FRAGMENT_SIZE).enumerate() {
                let opcode = if i == 0 {
                    OpCode::Data(Data::Binary)
                } else {
                    OpCode::Data(Data::Continue)
                };
                let last = i + 1 == count;
                let (written, ack) = oneshot::channel();
                self.write_tx
                    .send(Outgoing {
                        frame: tungstenite::Message::Frame(Frame::message(
                            piece.to_vec(),
                            opcode,
                            last,
                        )),
                        written: Some(written),
                    })
                    .await
                    .map_err(|_| WsError::Closed)?;
                unfinished.armed = !last;

                let end = ((i + 1) * FRAGMENT_SIZE).min(frame.len());
                acks.push_back((end.saturating_sub(prefix) as u64, ack));
                if acks.len() >= FRAGMENT_WINDOW {
                    settle(&mut acks, on_sent).await?;
                }
            }
        }
        while !acks.is_empty() {
            settle(&mut acks, on_sent).await?;
        }

        let reply = await_reply(id, rx, WS_BINARY_REQUEST_TIMEOUT).await?;
        decode(&reply)
    }

    async fn exchange(
        &self,
        id: &str,
        frame: tungstenite::Message,
        timeout: Duration,
    ) -> Result<Message, WsError> {
        let (rx, _guard) = self.register(id)?;
        {
            let _sending = self.send_lock.lock().await;
            self.write_tx
                .send(frame.into())
                .await
                .map_err(|_| WsError::Closed)?;
        }
        await_reply(id, rx, timeout).await
    }

    /// Registers a waiter for the reply to `id`. The guard removes it
    /// again.
    fn register<'a>(
        &'a self,
        id: &'a str,
    ) -> Result<(oneshot::Receiver<Message>, PendingGuard<'a>), WsError> {
        if !self.is_connected() {
            return Err(WsError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), tx);
        let guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        Ok((rx, guard))
    }

    /// Closes the connection. Requests in flight fail with
    /// [`WsError::Closed`].
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

async fn await_reply(
    id: &str,
    rx: oneshot::Receiver<Message>,
    timeout: Duration,
) -> Result<Message, WsError> {
    let reply = match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => return Err(WsError::Closed),
        Err(_) => {
            debug!(id, ?timeout, "request timed out");
            return Err(WsError::Timeout);
        }
    };
    match &reply.error {
        Some(err) => Err(WsError::Server {
            code: err.code,
            message: err.message.clone(),
        }),
        None => Ok(reply),
    }
}

/// Waits for the oldest queued fragment to reach the socket.
async fn settle(
    acks: &mut VecDeque<(u64, oneshot::Receiver<()>)>,
    on_sent: &(dyn Fn(u64) + Send + Sync),
) -> Result<(), WsError> {
    let Some((sent, ack)) = acks.pop_front() else {
        return Ok(());
    };
    match tokio::time::timeout(WS_BINARY_REQUEST_TIMEOUT, ack).await {
        Ok(Ok(())) => {
            on_sent(sent);
            Ok(())
        }
        Ok(Err(_)) => Err(WsError::Closed),
        Err(_) => Err(WsError::Timeout),
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
    }
}

fn decode<R: DeserializeOwned>(reply: &Message) -> Result<R, WsError> {
    reply.parse_payload()?.ok_or_else(|| {
        WsError::Protocol(format!("{:?} reply without payload", reply.msg_type))
    })
}
