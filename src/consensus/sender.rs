//! Outbound side of the node. Every RPC leaving here is signed with the node
//! key, except forwarded client commands, whose envelopes are relayed
//! untouched so the client signature stays valid. Sends are best effort;
//! heartbeats and response-driven resends provide the retries.

use futures::future::join_all;
use std::sync::Arc;
use tracing::debug;

use crate::consensus::types::{ClientId, CommandResponse, Envelope, NodeId, Rpc};
use crate::consensus::wire;
use crate::crypto::Keyring;
use crate::transport::Transport;

pub struct Sender {
    node_id: NodeId,
    keyring: Arc<Keyring>,
    transport: Arc<dyn Transport>,
    peers: Vec<NodeId>,
}

impl Sender {
    pub fn new(
        node_id: NodeId,
        keyring: Arc<Keyring>,
        transport: Arc<dyn Transport>,
        peers: Vec<NodeId>,
    ) -> Self {
        Self {
            node_id,
            keyring,
            transport,
            peers,
        }
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    fn signed_frame(&self, rpc: &Rpc) -> Option<Vec<u8>> {
        let payload = match wire::encode_rpc(rpc) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("encode failed: {e}");
                return None;
            }
        };
        let sig = self.keyring.sign(&payload);
        match wire::encode_envelope(&Envelope { payload, sig }) {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!("envelope encode failed: {e}");
                None
            }
        }
    }

    pub async fn send(&self, peer: NodeId, rpc: &Rpc) {
        let Some(frame) = self.signed_frame(rpc) else {
            return;
        };
        if let Err(e) = self.transport.send_to_node(peer, frame).await {
            debug!("send to {peer} failed: {e}");
        }
    }

    /// Sign once, fan the same frame out to every peer.
    pub async fn broadcast(&self, rpc: &Rpc) {
        let Some(frame) = self.signed_frame(rpc) else {
            return;
        };
        let sends = self.peers.iter().map(|&peer| {
            let frame = frame.clone();
            async move {
                if let Err(e) = self.transport.send_to_node(peer, frame).await {
                    debug!("broadcast to {peer} failed: {e}");
                }
            }
        });
        join_all(sends).await;
    }

    /// Relay a client envelope verbatim (no re-signing).
    pub async fn forward(&self, peer: NodeId, envelope: &Envelope) {
        let frame = match wire::encode_envelope(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("forward encode failed: {e}");
                return;
            }
        };
        if let Err(e) = self.transport.send_to_node(peer, frame).await {
            debug!("forward to {peer} failed: {e}");
        }
    }

    pub async fn respond_to_client(&self, client: ClientId, response: CommandResponse) {
        let Some(frame) = self.signed_frame(&Rpc::CommandResponse(response)) else {
            return;
        };
        if let Err(e) = self.transport.send_to_client(client, frame).await {
            debug!("response to {client} failed: {e}");
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}
