//! Notification manager: topic registrations and fan-out.
//!
//! All bookkeeping runs on one task fed by a message queue, so registration
//! changes and broadcasts are applied in a single total order.

use std::collections::{HashMap, HashSet};

use jrpc_proto::Request;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Result, ServerError};
use crate::session::SessionId;

/// Topic fed by [`NotificationManager::notify_block_connected`].
pub const BLOCKS_TOPIC: &str = "blocks";

/// Non-owning reference to a session's notification queue.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: SessionId,
    pub queue: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Debug)]
enum ManagerMsg {
    AddClient(ClientHandle),
    RemoveClient(SessionId),
    Register { id: SessionId, topic: String },
    Unregister { id: SessionId, topic: String },
    Notify { topic: String, payload: Vec<u8> },
    NumClients(oneshot::Sender<usize>),
}

#[derive(Debug)]
pub struct NotificationManager {
    tx: mpsc::UnboundedSender<ManagerMsg>,
}

impl NotificationManager {
    /// Spawn the manager task on the current runtime. It stops when
    /// `shutdown` fires or the manager is dropped.
    #[must_use]
    pub fn start(shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, shutdown));
        Self { tx }
    }

    fn send(&self, msg: ManagerMsg) {
        if self.tx.send(msg).is_err() {
            trace!("Notification manager stopped, dropping message");
        }
    }

    pub fn add_client(&self, client: ClientHandle) {
        self.send(ManagerMsg::AddClient(client));
    }

    /// Forget a client and every topic it registered for.
    pub fn remove_client(&self, id: SessionId) {
        self.send(ManagerMsg::RemoveClient(id));
    }

    pub fn register(&self, id: SessionId, topic: &str) {
        self.send(ManagerMsg::Register {
            id,
            topic: topic.to_string(),
        });
    }

    pub fn unregister(&self, id: SessionId, topic: &str) {
        self.send(ManagerMsg::Unregister {
            id,
            topic: topic.to_string(),
        });
    }

    /// Queue `payload` for every client registered for `topic`.
    pub fn notify(&self, topic: &str, payload: Vec<u8>) {
        self.send(ManagerMsg::Notify {
            topic: topic.to_string(),
            payload,
        });
    }

    /// Broadcast a `blockconnected` notification to the blocks topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the notification cannot be marshalled.
    pub fn notify_block_connected(&self, hash: &str, height: u64) -> Result<()> {
        let notification = Request::notification("blockconnected", vec![json!(hash), json!(height)]);
        let payload = serde_json::to_vec(&notification)?;
        self.notify(BLOCKS_TOPIC, payload);
        Ok(())
    }

    /// Number of clients currently known to the manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager task has stopped.
    pub async fn num_clients(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(ManagerMsg::NumClients(tx));
        rx.await
            .map_err(|_| ServerError::Protocol("notification manager stopped".to_string()))
    }
}

#[derive(Debug, Default)]
struct State {
    clients: HashMap<SessionId, mpsc::UnboundedSender<Vec<u8>>>,
    topics: HashMap<String, HashSet<SessionId>>,
}

impl State {
    fn handle(&mut self, msg: ManagerMsg) {
        match msg {
            ManagerMsg::AddClient(client) => {
                self.clients.insert(client.id, client.queue);
            }
            ManagerMsg::RemoveClient(id) => {
                self.clients.remove(&id);
                self.topics.retain(|_, ids| {
                    ids.remove(&id);
                    !ids.is_empty()
                });
            }
            ManagerMsg::Register { id, topic } => {
                if self.clients.contains_key(&id) {
                    self.topics.entry(topic).or_default().insert(id);
                } else {
                    debug!("Ignoring {} registration for unknown client {}", topic, id);
                }
            }
            ManagerMsg::Unregister { id, topic } => {
                if let Some(ids) = self.topics.get_mut(&topic) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        self.topics.remove(&topic);
                    }
                }
            }
            ManagerMsg::Notify { topic, payload } => {
                let Some(ids) = self.topics.get(&topic) else {
                    return;
                };
                for id in ids {
                    if let Some(queue) = self.clients.get(id)
                        && queue.send(payload.clone()).is_err()
                    {
                        trace!("Client {} queue closed, skipping {} notification", id, topic);
                    }
                }
            }
            ManagerMsg::NumClients(reply) => {
                let _ = reply.send(self.clients.len());
            }
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<ManagerMsg>, shutdown: CancellationToken) {
    let mut state = State::default();
    loop {
        let msg = tokio::select! {
            () = shutdown.cancelled() => break,
            msg = rx.recv() => msg,
        };
        let Some(msg) = msg else { break };
        state.handle(msg);
    }
    trace!("Notification manager done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn client() -> (ClientHandle, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (queue, rx) = mpsc::unbounded_channel();
        (
            ClientHandle {
                id: SessionId::new(),
                queue,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_fan_out_to_registered_clients() {
        let manager = NotificationManager::start(CancellationToken::new());
        let (a, mut a_rx) = client();
        let (b, mut b_rx) = client();
        let (a_id, b_id) = (a.id, b.id);
        manager.add_client(a);
        manager.add_client(b);
        manager.register(a_id, BLOCKS_TOPIC);

        manager.notify(BLOCKS_TOPIC, b"hello".to_vec());
        assert_eq!(manager.num_clients().await.unwrap(), 2);

        assert_eq!(a_rx.recv().await.unwrap(), b"hello");
        assert!(b_rx.try_recv().is_err());

        manager.register(b_id, BLOCKS_TOPIC);
        manager.notify(BLOCKS_TOPIC, b"again".to_vec());
        manager.num_clients().await.unwrap();
        assert_eq!(a_rx.recv().await.unwrap(), b"again");
        assert_eq!(b_rx.recv().await.unwrap(), b"again");
    }

    #[tokio::test]
    async fn test_register_twice_delivers_once() {
        let manager = NotificationManager::start(CancellationToken::new());
        let (a, mut a_rx) = client();
        let id = a.id;
        manager.add_client(a);
        manager.register(id, BLOCKS_TOPIC);
        manager.register(id, BLOCKS_TOPIC);
        manager.notify(BLOCKS_TOPIC, b"x".to_vec());
        manager.num_clients().await.unwrap();

        assert_eq!(a_rx.recv().await.unwrap(), b"x");
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_client_drops_all_registrations() {
        let manager = NotificationManager::start(CancellationToken::new());
        let (a, mut a_rx) = client();
        let id = a.id;
        manager.add_client(a);
        manager.register(id, BLOCKS_TOPIC);
        manager.register(id, "txs");
        manager.remove_client(id);
        manager.notify(BLOCKS_TOPIC, b"x".to_vec());
        manager.notify("txs", b"y".to_vec());

        assert_eq!(manager.num_clients().await.unwrap(), 0);
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister_and_unknown_client() {
        let manager = NotificationManager::start(CancellationToken::new());
        let (a, mut a_rx) = client();
        let id = a.id;

        // Registration before the client is added is ignored.
        manager.register(id, BLOCKS_TOPIC);
        manager.add_client(a);
        manager.notify(BLOCKS_TOPIC, b"x".to_vec());
        manager.num_clients().await.unwrap();
        assert!(a_rx.try_recv().is_err());

        manager.register(id, BLOCKS_TOPIC);
        manager.unregister(id, BLOCKS_TOPIC);
        manager.notify(BLOCKS_TOPIC, b"y".to_vec());
        manager.num_clients().await.unwrap();
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_block_connected_payload() {
        let manager = NotificationManager::start(CancellationToken::new());
        let (a, mut a_rx) = client();
        let id = a.id;
        manager.add_client(a);
        manager.register(id, BLOCKS_TOPIC);
        manager.notify_block_connected("00ab", 42).unwrap();

        let payload: Value = serde_json::from_slice(&a_rx.recv().await.unwrap()).unwrap();
        assert_eq!(payload["jsonrpc"], "1.0");
        assert_eq!(payload["method"], "blockconnected");
        assert_eq!(payload["params"], json!(["00ab", 42]));
        assert!(payload["id"].is_null());
    }
}
