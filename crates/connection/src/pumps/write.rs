use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use ferry_protocol::constants::WS_PING_PERIOD;

use super::Outgoing;

/// Drains the outbound queue into the socket and pings the server every
/// [`WS_PING_PERIOD`]. Sends a close frame on exit.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<Outgoing>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let mut ping = tokio::time::interval(WS_PING_PERIOD);
    ping.tick().await;

    loop {
        let outgoing = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ping.tick() => {
                trace!("sending keepalive ping");
                Outgoing::from(tungstenite::Message::Ping(Vec::new().into()))
            }
            msg = write_rx.recv() => match msg {
                Some(m) => m,
                None => break,
            },
        };
        if let Err(e) = write.send(outgoing.frame).await {
            error!("WebSocket write error: {e}");
            cancel.cancel();
            break;
        }
        if let Some(written) = outgoing.written {
            let _ = written.send(());
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}
