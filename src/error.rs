use thiserror::Error;

/// Failures that can surface outside the protocol rules.
///
/// Protocol-level conditions (stale terms, log mismatches, replayed commands,
/// unverifiable messages) are handled by the event rules and never show up
/// here. `Corrupt` is the one unrecoverable kind: it aborts the node.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("wire codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("key material: {0}")]
    KeyMaterial(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("log corruption: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
