//! Socket pumps for [`crate::WsClient`]: one task reads, one writes.

pub(crate) mod read;
pub(crate) mod write;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ferry_protocol::Message;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite;

/// Requests awaiting a reply, keyed by message id.
pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// A frame queued for the write pump.
///
/// `written` fires once the frame has been handed to the socket.
pub(crate) struct Outgoing {
    pub frame: tungstenite::Message,
    pub written: Option<oneshot::Sender<()>>,
}

impl From<tungstenite::Message> for Outgoing {
    fn from(frame: tungstenite::Message) -> Self {
        Self {
            frame,
            written: None,
        }
    }
}
