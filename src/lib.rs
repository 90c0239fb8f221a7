pub mod config;
pub mod consensus;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod state_machine;
pub mod transport;

pub use config::Config;
pub use consensus::node::{NodeSettings, RaftNode};
pub use consensus::types::{
    ClientId, Command, CommandResponse, Event, LogEntry, LogIndex, NodeId, RequestId, Role, Rpc,
    Sig, Term,
};
pub use crypto::Keyring;
pub use error::ConsensusError;
pub use state_machine::{KvStore, StateMachine};
pub use transport::Transport;
