//! TCP listener and per-connection routing.
//!
//! Every accepted connection carries exactly one HTTP request. A `GET /ws`
//! upgrade becomes a WebSocket session; anything else is answered as a single
//! JSON-RPC call and the connection is closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::StreamExt;
use jrpc_proto::{BoxedCommand, Registry};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::{DispatchTable, HandlerResult};
use crate::error::{Result, ServerError};
use crate::handlers::register_default_handlers;
use crate::http::json_rpc_read;
use crate::notify::NotificationManager;
use crate::session::Credentials;
use crate::transport::{HttpCodec, HttpRequest};
use crate::websocket::WsClient;

/// Path that accepts WebSocket upgrades.
pub const WEBSOCKET_PATH: &str = "/ws";

#[derive(Debug)]
pub struct RpcServer {
    config: ServerConfig,
    registry: Registry,
    dispatch: DispatchTable,
    notifications: NotificationManager,
    credentials: Credentials,
    status_lines: RwLock<HashMap<i32, String>>,
    ws_clients: AtomicUsize,
    shutdown: CancellationToken,
}

impl RpcServer {
    /// Build a server with the built-in commands and handlers registered.
    ///
    /// Must be called from within a tokio runtime, since it starts the
    /// notification manager task.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid.
    pub fn new(config: ServerConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let registry = Registry::with_default_commands()?;
        let dispatch = DispatchTable::new();
        register_default_handlers(&dispatch);

        let shutdown = CancellationToken::new();
        let notifications = NotificationManager::start(shutdown.child_token());
        let credentials = Credentials::from_config(&config);
        if !credentials.is_configured() {
            debug!("No RPC credentials configured, every authenticate succeeds");
        }

        Ok(Arc::new(Self {
            config,
            registry,
            dispatch,
            notifications,
            credentials,
            status_lines: RwLock::new(HashMap::new()),
            ws_clients: AtomicUsize::new(0),
            shutdown,
        }))
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    #[must_use]
    pub fn notifications(&self) -> &NotificationManager {
        &self.notifications
    }

    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Token cancelled by [`RpcServer::shutdown`]. Sessions derive their quit
    /// signal from it.
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Number of WebSocket sessions currently holding a slot.
    #[must_use]
    pub fn num_websockets(&self) -> usize {
        self.ws_clients.load(Ordering::Acquire)
    }

    /// Stop accepting connections and quit every session.
    pub fn shutdown(&self) {
        info!("RPC server shutting down");
        self.shutdown.cancel();
    }

    /// Run a command through the primary dispatch table.
    pub async fn standard_cmd_result(
        self: &Arc<Self>,
        method: &str,
        cmd: BoxedCommand,
        cancel: CancellationToken,
    ) -> HandlerResult {
        self.dispatch
            .dispatch(Arc::clone(self), method, cmd, cancel)
            .await
    }

    /// `HTTP/1.x <code> <reason>\r\n`, cached per protocol version and code.
    ///
    /// Codes without a known reason phrase are rendered as `status code N`
    /// and not cached.
    #[must_use]
    pub fn status_line(&self, http11: bool, code: u16) -> String {
        let key = if http11 {
            i32::from(code)
        } else {
            -i32::from(code)
        };
        if let Some(line) = self
            .status_lines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return line.clone();
        }

        let proto = if http11 { "HTTP/1.1" } else { "HTTP/1.0" };
        let Some(reason) = reason_phrase(code) else {
            return format!("{proto} {code} status code {code}\r\n");
        };
        let line = format!("{proto} {code} {reason}\r\n");
        self.status_lines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, line.clone());
        line
    }

    /// Accept connections until [`RpcServer::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener has no local address.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("RPC server listening on {}", listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("Shutdown requested, stopping server");
                    break;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        match server.handle_connection(stream, addr).await {
                            Ok(()) => {}
                            Err(e @ ServerError::Codec(_)) => {
                                warn!("Malformed HTTP request from {}: {}", addr, e);
                            }
                            Err(e) => error!("Connection error from {}: {}", addr, e),
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let mut framed = FramedRead::new(stream, HttpCodec::new());
        let next = tokio::time::timeout(self.config.auth_timeout(), framed.next()).await;
        let request = match next {
            Err(_) => {
                debug!("Timed out waiting for a request from {}", addr);
                return Ok(());
            }
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => {
                let mut stream = framed.into_inner();
                self.write_plain_status(&mut stream, 400).await?;
                return Err(e.into());
            }
            Ok(Some(Ok(request))) => request,
        };

        let leftover = framed.read_buffer().to_vec();
        let stream = framed.into_inner();

        if request.path == WEBSOCKET_PATH && request.is_websocket_upgrade() {
            return self.upgrade_websocket(stream, addr, &request, leftover).await;
        }

        debug!("{} {} from {}", request.method, request.path, addr);
        json_rpc_read(self, stream, &request).await
    }

    async fn upgrade_websocket(
        self: Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
        request: &HttpRequest,
        leftover: Vec<u8>,
    ) -> Result<()> {
        let Some(key) = request.header("sec-websocket-key") else {
            warn!("WebSocket upgrade from {} without a key", addr);
            return self.write_plain_status(&mut stream, 400).await;
        };
        let Some(_slot) = WsSlot::acquire(&self.ws_clients, self.config.max_websockets) else {
            warn!(
                "Max websocket clients exceeded [{}] - disconnecting client {}",
                self.config.max_websockets, addr
            );
            return self.write_plain_status(&mut stream, 503).await;
        };

        let handshake = format!(
            "{}Upgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            self.status_line(true, 101),
            derive_accept_key(key.as_bytes())
        );
        stream.write_all(handshake.as_bytes()).await?;
        stream.flush().await?;

        let ws = WebSocketStream::from_partially_read(stream, leftover, Role::Server, None).await;
        let (client, lanes) = WsClient::new(Arc::clone(&self), addr);
        client.run(ws, lanes).await;
        Ok(())
    }

    async fn write_plain_status<W: AsyncWrite + Unpin>(&self, stream: &mut W, code: u16) -> Result<()> {
        let response = format!(
            "{}Connection: close\r\nContent-Length: 0\r\n\r\n",
            self.status_line(true, code)
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// A reserved WebSocket slot, released on drop.
struct WsSlot<'a>(&'a AtomicUsize);

impl<'a> WsSlot<'a> {
    fn acquire(count: &'a AtomicUsize, max: usize) -> Option<Self> {
        count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(count))
    }
}

impl Drop for WsSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn reason_phrase(code: u16) -> Option<&'static str> {
    let reason = match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Request Entity Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => return None,
    };
    Some(reason)
}

/// Bind the configured address and serve until interrupted.
///
/// # Errors
///
/// Returns an error if the config is invalid or the address cannot be bound.
pub async fn run(config: ServerConfig) -> Result<()> {
    let server = RpcServer::new(config)?;
    let listener = TcpListener::bind(&server.config.listen).await?;

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal_server.shutdown(),
            Err(e) => error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    server.serve(listener).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_malformed_request_reports_codec_error() {
        let server = RpcServer::new(ServerConfig::default()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        client
            .write_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await
            .unwrap();

        let result = Arc::clone(&server).handle_connection(stream, peer).await;
        assert!(matches!(result, Err(ServerError::Codec(_))));

        let mut raw = String::new();
        client.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_status_line_cache() {
        let server = RpcServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.status_line(true, 200), "HTTP/1.1 200 OK\r\n");
        assert_eq!(server.status_line(false, 200), "HTTP/1.0 200 OK\r\n");
        assert_eq!(
            server.status_line(true, 101),
            "HTTP/1.1 101 Switching Protocols\r\n"
        );

        let cache = server.status_lines.read().unwrap();
        assert!(cache.contains_key(&200));
        assert!(cache.contains_key(&-200));
    }

    #[tokio::test]
    async fn test_unknown_status_code_not_cached() {
        let server = RpcServer::new(ServerConfig::default()).unwrap();
        assert_eq!(
            server.status_line(true, 599),
            "HTTP/1.1 599 status code 599\r\n"
        );
        assert!(!server.status_lines.read().unwrap().contains_key(&599));
    }

    #[test]
    fn test_ws_slots_are_bounded() {
        let count = AtomicUsize::new(0);
        let first = WsSlot::acquire(&count, 2).unwrap();
        let second = WsSlot::acquire(&count, 2).unwrap();
        assert!(WsSlot::acquire(&count, 2).is_none());

        drop(first);
        assert_eq!(count.load(Ordering::Acquire), 1);
        let third = WsSlot::acquire(&count, 2);
        assert!(third.is_some());
        drop(second);
        drop(third);
        assert_eq!(count.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = ServerConfig {
            rpc_pass: Some("secret".to_string()),
            ..ServerConfig::default()
        };
        assert!(RpcServer::new(config).is_err());
    }

    #[tokio::test]
    async fn test_default_handlers_registered() {
        let server = RpcServer::new(ServerConfig::default()).unwrap();
        assert!(server.dispatch().has_handler("getreadme"));
        assert!(server.dispatch().has_ws_handler("session"));
        assert!(server.registry().method_info("getblock").is_some());
    }

    #[tokio::test]
    async fn test_shutdown_stops_serve() {
        let server = RpcServer::new(ServerConfig::default()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let task = tokio::spawn(Arc::clone(&server).serve(listener));
        server.shutdown();
        task.await.unwrap().unwrap();
    }
}
