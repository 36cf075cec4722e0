//! WebSocket client sessions.
//!
//! A session runs three lanes over one upgraded connection:
//!
//! - the read lane decodes requests, applies the authentication gate and
//!   spawns handlers, at most `maxConcurrentReqs` at a time
//! - the notification queue lane moves notifications from an unbounded queue
//!   into the write lane, so a slow client never blocks a broadcaster
//! - the write lane is the only writer on the socket
//!
//! Replies and notifications reach the socket in the order they were queued
//! onto the write lane.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use jrpc_proto::{
    AuthenticateCmd, BoxedCommand, ParsedRequest, Request, RpcError, downcast, downcast_ref,
    marshal_response,
};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Semaphore, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::dispatch::HandlerResult;
use crate::error::{Result, ServerError};
use crate::notify::ClientHandle;
use crate::server::RpcServer;
use crate::session::{AuthGate, SessionId, SessionState};

/// Receiving ends of a session's queues, consumed by [`WsClient::run`].
#[derive(Debug)]
pub struct WsLanes {
    send_rx: mpsc::Receiver<Vec<u8>>,
    ntfn_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[derive(Debug)]
pub struct WsClient {
    server: Arc<RpcServer>,
    addr: SocketAddr,
    session_id: SessionId,
    authenticated: AtomicBool,
    is_admin: AtomicBool,
    state: Mutex<SessionState>,
    disconnected: Mutex<bool>,
    quit: CancellationToken,
    send_tx: mpsc::Sender<Vec<u8>>,
    ntfn_tx: mpsc::UnboundedSender<Vec<u8>>,
    service_sem: Arc<Semaphore>,
}

impl WsClient {
    #[must_use]
    pub fn new(server: Arc<RpcServer>, addr: SocketAddr) -> (Arc<Self>, WsLanes) {
        let config = server.config();
        let (send_tx, send_rx) = mpsc::channel(config.websocket_send_buffer.max(1));
        let (ntfn_tx, ntfn_rx) = mpsc::unbounded_channel();
        let service_sem = Arc::new(Semaphore::new(config.max_concurrent_reqs.max(1)));
        let quit = server.shutdown_token().child_token();

        let client = Arc::new(Self {
            server,
            addr,
            session_id: SessionId::new(),
            authenticated: AtomicBool::new(false),
            is_admin: AtomicBool::new(false),
            state: Mutex::new(SessionState::Connecting),
            disconnected: Mutex::new(false),
            quit,
            send_tx,
            ntfn_tx,
            service_sem,
        });
        (client, WsLanes { send_rx, ntfn_rx })
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn server(&self) -> &Arc<RpcServer> {
        &self.server
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.is_admin.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Handle the notification manager uses to reach this session.
    #[must_use]
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            id: self.session_id,
            queue: self.ntfn_tx.clone(),
        }
    }

    #[must_use]
    pub fn disconnected(&self) -> bool {
        *self.disconnected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Disconnect the session. Only the first call has any effect.
    pub fn disconnect(&self) {
        let mut disconnected = self
            .disconnected
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *disconnected {
            return;
        }

        trace!("Disconnecting websocket client {}", self.addr);
        *disconnected = true;
        self.set_state(SessionState::Disconnecting);
        // The lanes own the socket halves and close them once they see quit.
        self.quit.cancel();
    }

    /// Queue a marshalled reply on the write lane.
    ///
    /// # Errors
    ///
    /// Returns a `ClientQuit` error if the session is disconnected.
    pub async fn send_message(&self, payload: Vec<u8>) -> Result<()> {
        if self.disconnected() {
            return Err(ServerError::client_quit());
        }
        tokio::select! {
            () = self.quit.cancelled() => Err(ServerError::client_quit()),
            sent = self.send_tx.send(payload) => sent.map_err(|_| ServerError::client_quit()),
        }
    }

    /// Run all three lanes until the connection ends.
    pub async fn run<S>(self: Arc<Self>, ws: WebSocketStream<S>, lanes: WsLanes)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        info!("New websocket client {} ({})", self.addr, self.session_id);
        self.set_state(SessionState::Unauthenticated);
        self.server.notifications().add_client(self.handle());

        let (sink, stream) = ws.split();
        let out = tokio::spawn(Arc::clone(&self).out_handler(sink, lanes.send_rx));
        let queue = tokio::spawn(Arc::clone(&self).notification_queue_handler(lanes.ntfn_rx));

        Arc::clone(&self).in_handler(stream).await;

        let (out, queue) = tokio::join!(out, queue);
        if let Err(e) = out {
            error!("Websocket output handler for {} failed: {}", self.addr, e);
        }
        if let Err(e) = queue {
            error!("Websocket notification handler for {} failed: {}", self.addr, e);
        }

        self.server.notifications().remove_client(self.session_id);
        self.set_state(SessionState::Closed);
        info!("Disconnected websocket client {}", self.addr);
    }

    async fn in_handler<St>(self: Arc<Self>, mut stream: St)
    where
        St: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
    {
        let rpc_quirks = self.server.config().rpc_quirks;

        loop {
            let next = tokio::select! {
                biased;
                () = self.quit.cancelled() => break,
                next = stream.next() => next,
            };
            let payload = match next {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(bytes))) => bytes,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                )) => break,
                Some(Err(e)) => {
                    error!("Websocket receive error from {}: {}", self.addr, e);
                    break;
                }
            };

            let request = match Request::parse(&payload) {
                Ok(request) => request,
                Err(e) => {
                    if !self.is_authenticated() {
                        break;
                    }
                    self.reply("", None, Err(RpcError::from(e))).await;
                    continue;
                }
            };

            if request.is_notification(rpc_quirks) {
                if !self.is_authenticated() {
                    break;
                }
                continue;
            }

            let ParsedRequest { id, method, cmd } = self.server.registry().parse_cmd(&request);
            let cmd = match cmd {
                Ok(cmd) => cmd,
                Err(err) => {
                    if !self.is_authenticated() {
                        break;
                    }
                    self.reply(&method, id, Err(err)).await;
                    continue;
                }
            };
            debug!("Received command <{}> from {}", method, self.addr);

            let is_authenticate = downcast_ref::<AuthenticateCmd>(&*cmd).is_some();
            let gate = AuthGate::evaluate(self.is_authenticated(), is_authenticate);
            match gate {
                AuthGate::AlreadyAuthenticated => {
                    warn!("Websocket client {} is already authenticated", self.addr);
                }
                AuthGate::NotAuthenticated => {
                    warn!("Unauthenticated websocket message received from {}", self.addr);
                }
                AuthGate::Authenticate => {
                    if !self.authenticate(cmd) {
                        break;
                    }
                    self.reply(&method, id, Ok(Value::Null)).await;
                    continue;
                }
                AuthGate::Dispatch => {}
            }
            if gate.disconnects() {
                break;
            }

            let permit = tokio::select! {
                () = self.quit.cancelled() => break,
                permit = Arc::clone(&self.service_sem).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let client = Arc::clone(&self);
            tokio::spawn(async move {
                client.service_request(method, id, cmd).await;
                drop(permit);
            });
        }

        self.disconnect();
        trace!("Websocket client input handler done for {}", self.addr);
    }

    fn authenticate(&self, cmd: BoxedCommand) -> bool {
        let Some(auth) = downcast::<AuthenticateCmd>(cmd) else {
            return false;
        };
        let Some(is_admin) = self
            .server
            .credentials()
            .check(&auth.username, &auth.passphrase)
        else {
            warn!("Authentication failure from {}", self.addr);
            return false;
        };

        self.is_admin.store(is_admin, Ordering::Release);
        self.authenticated.store(true, Ordering::Release);
        self.set_state(SessionState::Authenticated);
        debug!("Websocket client {} authenticated (admin: {})", self.addr, is_admin);
        true
    }

    /// Run one command, preferring a WebSocket extension handler.
    async fn service_request(self: Arc<Self>, method: String, id: Option<Value>, cmd: BoxedCommand) {
        trace!("Servicing <{}> for {} (admin: {})", method, self.addr, self.is_admin());
        let result: HandlerResult = match self.server.dispatch().ws_handler(&method) {
            Some(handler) => handler(Arc::clone(&self), cmd).await,
            None => {
                self.server
                    .standard_cmd_result(&method, cmd, self.quit.child_token())
                    .await
            }
        };
        self.reply(&method, id, result).await;
    }

    async fn reply(&self, method: &str, id: Option<Value>, result: HandlerResult) {
        let payload = match marshal_response(id, result) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to marshal reply for <{}> command: {}", method, e);
                return;
            }
        };
        if let Err(e) = self.send_message(payload).await {
            trace!("Dropping reply for <{}> to {}: {}", method, self.addr, e);
        }
    }

    async fn notification_queue_handler(self: Arc<Self>, mut ntfn_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        loop {
            let payload = tokio::select! {
                () = self.quit.cancelled() => break,
                payload = ntfn_rx.recv() => payload,
            };
            let Some(payload) = payload else { break };
            let forwarded = tokio::select! {
                () = self.quit.cancelled() => break,
                sent = self.send_tx.send(payload) => sent,
            };
            if forwarded.is_err() {
                break;
            }
        }
        trace!("Websocket client notification queue handler done for {}", self.addr);
    }

    async fn out_handler<Si>(self: Arc<Self>, mut sink: Si, mut send_rx: mpsc::Receiver<Vec<u8>>)
    where
        Si: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        loop {
            let payload = tokio::select! {
                () = self.quit.cancelled() => break,
                payload = send_rx.recv() => payload,
            };
            let Some(payload) = payload else { break };
            let text = match String::from_utf8(payload) {
                Ok(text) => text,
                Err(e) => {
                    error!("Dropping non UTF-8 message for {}: {}", self.addr, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!("Failed to send to websocket client {}: {}", self.addr, e);
                self.disconnect();
                break;
            }
        }

        if let Err(e) = sink.close().await {
            trace!("Closing websocket {} failed: {}", self.addr, e);
        }
        trace!("Websocket client output handler done for {}", self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use jrpc_proto::ErrorKind;
    use std::net::{IpAddr, Ipv4Addr};

    fn is_client_quit(result: &Result<()>) -> bool {
        matches!(result, Err(ServerError::Command(err)) if err.kind == ErrorKind::ClientQuit)
    }

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000)
    }

    #[tokio::test]
    async fn test_new_client_state() {
        let server = RpcServer::new(ServerConfig::default()).unwrap();
        let (client, _lanes) = WsClient::new(server, addr());
        assert_eq!(client.state(), SessionState::Connecting);
        assert!(!client.is_authenticated());
        assert!(!client.is_admin());
        assert!(!client.disconnected());
        assert_eq!(client.handle().id, client.session_id());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let server = RpcServer::new(ServerConfig::default()).unwrap();
        let (client, _lanes) = WsClient::new(server, addr());
        client.disconnect();
        assert!(client.disconnected());
        assert!(client.quit.is_cancelled());
        assert_eq!(client.state(), SessionState::Disconnecting);

        client.disconnect();
        assert!(client.disconnected());
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails_fast() {
        let server = RpcServer::new(ServerConfig::default()).unwrap();
        let (client, mut lanes) = WsClient::new(server, addr());

        client.send_message(b"one".to_vec()).await.unwrap();
        assert_eq!(lanes.send_rx.recv().await.unwrap(), b"one");

        client.disconnect();
        assert!(is_client_quit(&client.send_message(b"two".to_vec()).await));
    }

    #[tokio::test]
    async fn test_send_unblocks_on_quit() {
        let config = ServerConfig {
            websocket_send_buffer: 1,
            ..ServerConfig::default()
        };
        let server = RpcServer::new(config).unwrap();
        let (client, _lanes) = WsClient::new(server, addr());

        client.send_message(b"fills the queue".to_vec()).await.unwrap();
        let blocked = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.send_message(b"blocked".to_vec()).await })
        };
        tokio::task::yield_now().await;
        client.disconnect();
        assert!(is_client_quit(&blocked.await.unwrap()));
    }

    #[tokio::test]
    async fn test_notification_lane_forwards_in_order() {
        let server = RpcServer::new(ServerConfig::default()).unwrap();
        let (client, lanes) = WsClient::new(server, addr());
        let WsLanes {
            mut send_rx,
            ntfn_rx,
        } = lanes;

        let lane = tokio::spawn(Arc::clone(&client).notification_queue_handler(ntfn_rx));
        for i in 0..5u8 {
            client.handle().queue.send(vec![b'0' + i]).unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(send_rx.recv().await.unwrap(), vec![b'0' + i]);
        }

        client.disconnect();
        lane.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_shutdown_quits_session() {
        let server = RpcServer::new(ServerConfig::default()).unwrap();
        let (client, _lanes) = WsClient::new(Arc::clone(&server), addr());
        server.shutdown();
        assert!(client.quit.is_cancelled());
    }
}
