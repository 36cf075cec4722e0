//! JSON-RPC command server over HTTP and WebSocket.
//!
//! Requests are decoded against a [`jrpc_proto::Registry`] and routed through
//! a [`DispatchTable`]. Plain HTTP requests get a single reply on a connection
//! that is then closed. WebSocket sessions authenticate first and then run
//! commands concurrently, up to a per-session limit.

pub mod config;
pub mod dispatch;
pub mod error;
pub(crate) mod handlers;
pub mod http;
pub mod notify;
pub mod server;
pub mod session;
pub mod transport;
pub mod websocket;

pub use config::ServerConfig;
pub use dispatch::{DispatchTable, HandlerResult};
pub use error::{Result, ServerError};
pub use handlers::{ReadMeResult, SessionResult};
pub use notify::{BLOCKS_TOPIC, ClientHandle, NotificationManager};
pub use server::{RpcServer, WEBSOCKET_PATH, run};
pub use session::{AuthGate, Credentials, SessionId, SessionState};
pub use transport::{CodecError, HttpCodec, HttpRequest};
pub use websocket::{WsClient, WsLanes};
