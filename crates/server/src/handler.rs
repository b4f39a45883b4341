//! Handler trait for processing WebSocket messages.
//!
//! Implementors provide the upload logic while the server framework
//! handles connections, authentication gating, routing and the binary
//! protocol.

use std::future::Future;
use std::pin::Pin;

use ferry_protocol::constants::ERR_CODE_NOT_IMPLEMENTED;
use ferry_protocol::envelope::Message;
use ferry_protocol::{ChunkHeader, FileHeader, MessageType};
use ferry_sessions::Caller;

use crate::connection::Sender;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a, T = ()> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handling messages from a client.
///
/// Only `hello` and `ping` reach the handler before a connection is
/// authenticated; everything else is rejected with 401 by the server and
/// receives the authenticated [`Caller`].
///
/// Default implementations reply with "not implemented" so handlers only
/// need to override the message types they care about.
pub trait Handler: Send + Sync + 'static {
    /// Called for `hello`. Returns the caller to bind to the connection,
    /// or `None` after replying with an error.
    fn on_hello(&self, sender: Sender, msg: Message) -> HandlerFuture<'_, Option<Caller>>;

    /// Called for `ping` messages.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for `create_session`.
    fn on_create_session(&self, sender: Sender, caller: Caller, msg: Message) -> HandlerFuture<'_> {
        let _ = caller;
        not_implemented(sender, msg)
    }

    /// Called for `get_missing`.
    fn on_get_missing(&self, sender: Sender, caller: Caller, msg: Message) -> HandlerFuture<'_> {
        let _ = caller;
        not_implemented(sender, msg)
    }

    /// Called for `get_progress`.
    fn on_get_progress(&self, sender: Sender, caller: Caller, msg: Message) -> HandlerFuture<'_> {
        let _ = caller;
        not_implemented(sender, msg)
    }

    /// Called for `finalize`.
    fn on_finalize(&self, sender: Sender, caller: Caller, msg: Message) -> HandlerFuture<'_> {
        let _ = caller;
        not_implemented(sender, msg)
    }

    /// Called for `delete_session`.
    fn on_delete_session(&self, sender: Sender, caller: Caller, msg: Message) -> HandlerFuture<'_> {
        let _ = caller;
        not_implemented(sender, msg)
    }

    /// Called for `list_sessions`.
    fn on_list_sessions(&self, sender: Sender, caller: Caller, msg: Message) -> HandlerFuture<'_> {
        let _ = caller;
        not_implemented(sender, msg)
    }

    /// Called for a binary chunk frame.
    fn on_chunk(
        &self,
        sender: Sender,
        caller: Caller,
        header: ChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        let _ = (caller, data);
        Box::pin(async move {
            let _ = sender.send_msg(Message::error(
                header.id,
                ERR_CODE_NOT_IMPLEMENTED,
                "chunks not implemented",
            ));
        })
    }

    /// Called for a binary whole-file frame.
    fn on_store_file(
        &self,
        sender: Sender,
        caller: Caller,
        header: FileHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        let _ = (caller, data);
        Box::pin(async move {
            let _ = sender.send_msg(Message::error(
                header.id,
                ERR_CODE_NOT_IMPLEMENTED,
                "file store not implemented",
            ));
        })
    }

    /// Called when a client disconnects (cleanup hook).
    fn on_disconnected(&self, caller: Option<Caller>) -> HandlerFuture<'_> {
        let _ = caller;
        Box::pin(async {})
    }
}

fn not_implemented<'a>(sender: Sender, msg: Message) -> HandlerFuture<'a> {
    Box::pin(async move {
        let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "not implemented");
    })
}
