use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Logical election epoch. Starts at 0, only ever increases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Term(pub u64);

impl Term {
    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in the replicated log. `START` (-1) is the slot before entry 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub i64);

impl LogIndex {
    pub const START: LogIndex = LogIndex(-1);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> LogIndex {
        LogIndex(self.0 - 1)
    }

    /// Vec slot for this index, or None for `START` and below.
    pub fn as_slot(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Opaque detached signature bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Sig(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub command: Command,
}

/// A client command. `(client_id, sig)` is the replay-dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    pub entry: Vec<u8>,
    pub client_id: ClientId,
    pub request_id: RequestId,
    pub sig: Sig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub result: Vec<u8>,
    pub leader_hint: Option<NodeId>,
    pub responder_id: NodeId,
    pub request_id: RequestId,
    /// Responder's node-key signature over `(request_id, result)`.
    pub proof: Sig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
    /// Election certificate: the votes that made `leader_id` leader of `term`.
    pub quorum_votes: HashSet<SignedVote>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub node_id: NodeId,
    pub convinced: bool,
    pub success: bool,
    pub index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub candidate_id: NodeId,
    pub node_id: NodeId,
    pub vote_granted: bool,
}

/// A vote together with the voter's signature over its RPC encoding, so it
/// can be re-verified by third parties inside a quorum certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignedVote {
    pub vote: RequestVoteResponse,
    pub sig: Sig,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revolution {
    pub client_id: ClientId,
    pub leader_id: NodeId,
    pub sig: Sig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugMessage {
    pub node_id: NodeId,
    pub note: String,
}

/// Every message exchanged between replicas and clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Rpc {
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    Command(Command),
    CommandResponse(CommandResponse),
    Revolution(Revolution),
    Debug(DebugMessage),
}

/// Wire frame: bincode `payload` of an `Rpc` plus a detached signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub sig: Sig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Everything the handler loop consumes.
#[derive(Debug)]
pub enum Event {
    Rpc(Envelope),
    ElectionTimeout { epoch: u64 },
    HeartbeatTimeout { epoch: u64 },
}

/// `(term, index)` of the last entry, or `(0, START)` for an empty log.
pub fn last_log_info(log: &[LogEntry]) -> (Term, LogIndex) {
    match log.last() {
        Some(entry) => (entry.term, LogIndex(log.len() as i64 - 1)),
        None => (Term(0), LogIndex::START),
    }
}

pub fn entry_term(log: &[LogEntry], index: LogIndex) -> Option<Term> {
    let slot = index.as_slot()?;
    log.get(slot).map(|e| e.term)
}

/// Log-matching check for AppendEntries: the entry at `prev_index` carries
/// `prev_term`, or `prev_index` is the `START` sentinel.
pub fn prev_log_entry_matches(log: &[LogEntry], prev_index: LogIndex, prev_term: Term) -> bool {
    if prev_index == LogIndex::START {
        return true;
    }
    entry_term(log, prev_index) == Some(prev_term)
}
