use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use crate::consensus::node::NodeSettings;
use crate::consensus::types::{ClientId, NodeId};
use crate::crypto::{self, Keyring};
use crate::error::{ConsensusError, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub node_id: u64,
    pub listen_addr: SocketAddr,
    pub quorum_size: usize,
    #[serde(default = "default_election_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    pub private_key: String,
    #[serde(default)]
    pub logging: Option<LogSettings>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSettings {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerConfig {
    pub id: u64,
    pub addr: SocketAddr,
    pub public_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub id: u64,
    pub addr: SocketAddr,
    pub public_key: String,
}

fn default_election_min_ms() -> u64 {
    150
}
fn default_election_max_ms() -> u64 {
    300
}
fn default_heartbeat_ms() -> u64 {
    50
}
fn default_log_filter() -> String {
    "bftraft=info".to_string()
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&contents).map_err(|e| ConsensusError::Config(format!("{path}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(ConsensusError::Config(
                "election_timeout_min_ms must be below election_timeout_max_ms".into(),
            ));
        }
        // Heartbeats must outpace even the fastest election timeout.
        if self.heartbeat_ms >= self.election_timeout_min_ms {
            return Err(ConsensusError::Config(
                "heartbeat_ms must be below election_timeout_min_ms".into(),
            ));
        }
        let cluster_size = self.peers.len() + 1;
        if self.quorum_size == 0 || self.quorum_size > cluster_size {
            return Err(ConsensusError::Config(format!(
                "quorum_size {} is not in 1..={cluster_size}",
                self.quorum_size
            )));
        }
        if self.private_key.trim().is_empty() {
            return Err(ConsensusError::Config("private_key is required".into()));
        }

        let mut node_ids = HashSet::new();
        node_ids.insert(self.node_id);
        for peer in &self.peers {
            if !node_ids.insert(peer.id) {
                return Err(ConsensusError::Config(format!(
                    "duplicate node id {} in peers",
                    peer.id
                )));
            }
        }
        let mut client_ids = HashSet::new();
        for client in &self.clients {
            if !client_ids.insert(client.id) {
                return Err(ConsensusError::Config(format!(
                    "duplicate client id {} in clients",
                    client.id
                )));
            }
        }
        Ok(())
    }

    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            id: NodeId(self.node_id),
            peers: self.peers.iter().map(|peer| NodeId(peer.id)).collect(),
            quorum_size: self.quorum_size,
            election_timeout: (
                Duration::from_millis(self.election_timeout_min_ms),
                Duration::from_millis(self.election_timeout_max_ms),
            ),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
        }
    }

    /// Build the keyring from the config's base64 key material. The node's
    /// own public key is included so self-signed votes re-verify.
    pub fn keyring(&self) -> Result<Keyring> {
        let signing_key = crypto::decode_signing_key(&self.private_key)?;
        let mut node_keys = HashMap::new();
        node_keys.insert(NodeId(self.node_id), signing_key.verifying_key());
        for peer in &self.peers {
            node_keys.insert(
                NodeId(peer.id),
                crypto::decode_verifying_key(&peer.public_key)?,
            );
        }
        let mut client_keys = HashMap::new();
        for client in &self.clients {
            client_keys.insert(
                ClientId(client.id),
                crypto::decode_verifying_key(&client.public_key)?,
            );
        }
        Ok(Keyring::new(signing_key, node_keys, client_keys))
    }

    pub fn node_addrs(&self) -> HashMap<NodeId, SocketAddr> {
        self.peers
            .iter()
            .map(|peer| (NodeId(peer.id), peer.addr))
            .collect()
    }

    pub fn client_addrs(&self) -> HashMap<ClientId, SocketAddr> {
        self.clients
            .iter()
            .map(|client| (ClientId(client.id), client.addr))
            .collect()
    }
}
