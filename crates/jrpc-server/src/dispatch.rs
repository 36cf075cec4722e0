//! Method name to handler tables.
//!
//! The primary table serves both transports. The WebSocket table holds
//! session-aware extensions and is consulted first for WebSocket requests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture};
use jrpc_proto::{BoxedCommand, Command, ErrorKind, RpcError, downcast};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::server::RpcServer;
use crate::websocket::WsClient;

pub type HandlerResult = std::result::Result<Value, RpcError>;

type Handler = Arc<
    dyn Fn(Arc<RpcServer>, BoxedCommand, CancellationToken) -> BoxFuture<'static, HandlerResult>
        + Send
        + Sync,
>;

pub(crate) type WsHandler =
    Arc<dyn Fn(Arc<WsClient>, BoxedCommand) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Default)]
pub struct DispatchTable {
    handlers: RwLock<HashMap<String, Handler>>,
    ws_handlers: RwLock<HashMap<String, WsHandler>>,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("handlers", &self.methods())
            .field("ws_handlers", &self.ws_methods())
            .finish()
    }
}

impl DispatchTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler for command `C` under `method`.
    ///
    /// The handler receives a cancellation token that fires when the caller
    /// goes away. Cancellation is advisory: the handler is never interrupted.
    /// Registering a name twice keeps the first handler.
    pub fn add_handler<C, F, Fut, R, E>(&self, method: &str, handler: F)
    where
        C: Command,
        F: Fn(Arc<RpcServer>, C, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<RpcError> + Send + 'static,
    {
        let method_name = method.to_string();
        let boxed: Handler = Arc::new(
            move |server: Arc<RpcServer>, cmd: BoxedCommand, cancel: CancellationToken| {
                match downcast::<C>(cmd) {
                    Some(cmd) => handler(server, cmd, cancel).map(into_result).boxed(),
                    None => mismatched(&method_name),
                }
            },
        );

        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(method) {
            warn!("RPC method {:?} is already registered", method);
            return;
        }
        handlers.insert(method.to_string(), boxed);
    }

    /// Bind a WebSocket-only handler for command `C` under `method`.
    ///
    /// Registering a name twice keeps the first handler.
    pub fn add_ws_handler<C, F, Fut, R, E>(&self, method: &str, handler: F)
    where
        C: Command,
        F: Fn(Arc<WsClient>, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<RpcError> + Send + 'static,
    {
        let method_name = method.to_string();
        let boxed: WsHandler = Arc::new(move |client: Arc<WsClient>, cmd: BoxedCommand| {
            match downcast::<C>(cmd) {
                Some(cmd) => handler(client, cmd).map(into_result).boxed(),
                None => mismatched(&method_name),
            }
        });

        let mut handlers = self
            .ws_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(method) {
            warn!("WebSocket method {:?} is already registered", method);
            return;
        }
        handlers.insert(method.to_string(), boxed);
    }

    #[must_use]
    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(method)
    }

    #[must_use]
    pub fn has_ws_handler(&self, method: &str) -> bool {
        self.ws_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(method)
    }

    /// Names bound in the primary table, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        sorted_keys(&self.handlers)
    }

    /// Names bound in the WebSocket table, sorted.
    #[must_use]
    pub fn ws_methods(&self) -> Vec<String> {
        sorted_keys(&self.ws_handlers)
    }

    pub(crate) fn ws_handler(&self, method: &str) -> Option<WsHandler> {
        self.ws_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    /// Run the primary handler for `method`.
    pub async fn dispatch(
        &self,
        server: Arc<RpcServer>,
        method: &str,
        cmd: BoxedCommand,
        cancel: CancellationToken,
    ) -> HandlerResult {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned();
        match handler {
            Some(handler) => {
                debug!("Dispatching <{}>", method);
                handler(server, cmd, cancel).await
            }
            None => Err(jrpc_proto::Error::new(
                ErrorKind::MethodNotFound,
                format!("no handler for method \"{method}\""),
            )
            .into()),
        }
    }
}

fn into_result<R: Serialize, E: Into<RpcError>>(
    result: std::result::Result<R, E>,
) -> HandlerResult {
    match result {
        Ok(value) => serde_json::to_value(value)
            .map_err(|e| RpcError::internal_error(format!("Failed to marshal result: {e}"))),
        Err(err) => Err(err.into()),
    }
}

fn mismatched(method: &str) -> BoxFuture<'static, HandlerResult> {
    future::ready(Err(RpcError::internal_error(format!(
        "command type does not match handler for {method}"
    ))))
    .boxed()
}

fn sorted_keys<V>(map: &RwLock<HashMap<String, V>>) -> Vec<String> {
    let mut keys: Vec<String> = map
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect();
    keys.sort();
    keys
}
