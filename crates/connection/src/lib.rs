//! Session clients for the upload queue.
//!
//! [`WsClient`] speaks the wire protocol to a remote upload server,
//! [`ReconnectingClient`] redials it when the connection drops and
//! [`LocalSessionApi`] calls a service in the same process. All three
//! implement [`ferry_queue::SessionApi`].

mod api;
pub mod local;
mod pumps;
pub mod reconnect;
pub mod ws_client;

pub use local::LocalSessionApi;
pub use reconnect::ReconnectingClient;
pub use ws_client::{WsClient, WsError};
