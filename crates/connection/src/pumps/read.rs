use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use ferry_protocol::Message;
use ferry_protocol::constants::WS_PONG_WAIT;

use super::{Outgoing, PendingMap};

/// Routes replies to their waiting requests until the socket closes.
///
/// Any inbound frame pushes the liveness deadline out by
/// [`WS_PONG_WAIT`]. On exit the client is marked disconnected and every
/// pending request is dropped, which its waiter observes as a closed
/// connection.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingMap,
    write_tx: mpsc::Sender<Outgoing>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            () = &mut deadline => {
                warn!("server silent for {WS_PONG_WAIT:?}, dropping connection");
                break;
            }
            frame = read.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                };
                deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                match msg {
                    tungstenite::Message::Text(text) => route_reply(&text, &pending),
                    tungstenite::Message::Ping(data) => {
                        let _ = write_tx.try_send(tungstenite::Message::Pong(data).into());
                    }
                    tungstenite::Message::Close(frame) => {
                        debug!(?frame, "server closed the connection");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    cancel.cancel();
    pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
}

/// Hands a reply to the request waiting on its id.
fn route_reply(text: &str, pending: &PendingMap) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };
    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received reply");

    let waiter = pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&msg.id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(msg);
        }
        // Late reply to a request that timed out or was cancelled.
        None => debug!(id = %msg.id, msg_type = ?msg.msg_type, "dropping unmatched reply"),
    }
}
