use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::consensus::types::{ClientId, Envelope, Event, NodeId};
use crate::consensus::wire;
use crate::error::{ConsensusError, Result};

pub mod tcp;

/// How signed frames leave this node. Implementations never touch consensus
/// state; inbound traffic arrives separately on the node's event queue.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to_node(&self, peer: NodeId, frame: Vec<u8>) -> Result<()>;
    async fn send_to_client(&self, client: ClientId, frame: Vec<u8>) -> Result<()>;
}

/// In-process mesh: every registered node gets an event queue, every
/// registered client a response queue. Used by tests and embedders running
/// several replicas in one process.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: Mutex<HashMap<NodeId, mpsc::UnboundedSender<Event>>>,
    clients: Mutex<HashMap<ClientId, mpsc::UnboundedSender<Envelope>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register_node(&self, id: NodeId) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach_node(id, tx).await;
        rx
    }

    /// Attach an externally created event queue, e.g. the queue a node's
    /// timers already feed. Replaces any previous queue for `id`.
    pub async fn attach_node(&self, id: NodeId, tx: mpsc::UnboundedSender<Event>) {
        self.nodes.lock().await.insert(id, tx);
    }

    pub async fn register_client(&self, id: ClientId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.lock().await.insert(id, tx);
        rx
    }

    /// Drop a node's queue, e.g. to simulate a partition in tests.
    pub async fn disconnect_node(&self, id: NodeId) {
        self.nodes.lock().await.remove(&id);
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn new(network: Arc<MemoryNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to_node(&self, peer: NodeId, frame: Vec<u8>) -> Result<()> {
        let envelope = wire::decode_envelope(&frame)?;
        let nodes = self.network.nodes.lock().await;
        let tx = nodes
            .get(&peer)
            .ok_or_else(|| ConsensusError::Transport(format!("unknown peer {peer}")))?;
        tx.send(Event::Rpc(envelope))
            .map_err(|_| ConsensusError::Transport(format!("peer {peer} queue closed")))
    }

    async fn send_to_client(&self, client: ClientId, frame: Vec<u8>) -> Result<()> {
        let envelope = wire::decode_envelope(&frame)?;
        let clients = self.network.clients.lock().await;
        let tx = clients
            .get(&client)
            .ok_or_else(|| ConsensusError::Transport(format!("unknown client {client}")))?;
        tx.send(envelope)
            .map_err(|_| ConsensusError::Transport(format!("client {client} queue closed")))
    }
}
