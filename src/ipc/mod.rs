//! IPC endpoint for the companion control surface
//!
//! A local, name-addressed stream endpoint carrying length-prefixed JSON
//! messages: requests paired to responses by `messageId`, plus broadcast
//! notifications. See [`protocol`] for the message catalogue and framing
//! rules, [`server`] for the server and client, and [`handler`] for verb
//! dispatch.

pub mod handler;
pub mod protocol;
pub mod server;

pub use handler::IpcHandler;
pub use protocol::{
    Envelope, ErrorCode, NotificationBody, RequestBody, ResponseBody, StatusPayload,
};
pub use server::{IpcClient, IpcServer, IpcServerConfig};
