//! The replica itself. One `RaftNode` task owns all consensus state and is
//! the only mutator; timers and the transport communicate with it purely
//! through the event queue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::consensus::sender::Sender;
use crate::consensus::timer::{ElectionTimer, HeartbeatTimer};
use crate::consensus::types::{
    ClientId, CommandResponse, Envelope, Event, LogEntry, LogIndex, NodeId, Role, Rpc, Sig,
    SignedVote, Term,
};
use crate::consensus::wire;
use crate::crypto::Keyring;
use crate::error::Result;
use crate::state_machine::StateMachine;
use crate::transport::Transport;

/// Cluster-shape and timing knobs, distilled from the config file.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub id: NodeId,
    pub peers: Vec<NodeId>,
    pub quorum_size: usize,
    pub election_timeout: (Duration, Duration),
    pub heartbeat_interval: Duration,
}

pub struct RaftNode<S: StateMachine> {
    pub(crate) id: NodeId,
    pub(crate) peers: Vec<NodeId>,
    pub(crate) quorum_size: usize,

    pub(crate) role: Role,
    pub(crate) term: Term,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) lazy_vote: Option<(Term, NodeId)>,
    pub(crate) current_leader: Option<NodeId>,
    pub(crate) ignore_leader: bool,
    pub(crate) log: Vec<LogEntry>,
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    /// `(client, signature)` -> answered (`Some`) or revoked (`None`).
    pub(crate) replay: HashMap<(ClientId, Sig), Option<CommandResponse>>,

    // Leader bookkeeping.
    pub(crate) next_index: HashMap<NodeId, LogIndex>,
    pub(crate) match_index: HashMap<NodeId, LogIndex>,
    pub(crate) convinced: HashSet<NodeId>,
    pub(crate) quorum_cert: HashSet<SignedVote>,

    // Candidate bookkeeping.
    pub(crate) yes_votes: HashSet<SignedVote>,
    pub(crate) potential_votes: HashSet<NodeId>,

    pub(crate) keyring: Arc<Keyring>,
    pub(crate) sender: Sender,
    pub(crate) election_timer: ElectionTimer,
    pub(crate) heartbeat_timer: HeartbeatTimer,
    pub(crate) state_machine: S,
    events: mpsc::UnboundedReceiver<Event>,
}

impl<S: StateMachine> RaftNode<S> {
    pub fn new(
        settings: NodeSettings,
        keyring: Arc<Keyring>,
        transport: Arc<dyn Transport>,
        state_machine: S,
        events_tx: &mpsc::UnboundedSender<Event>,
        events_rx: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        let (election_min, election_max) = settings.election_timeout;
        let sender = Sender::new(
            settings.id,
            Arc::clone(&keyring),
            transport,
            settings.peers.clone(),
        );
        Self {
            id: settings.id,
            peers: settings.peers,
            quorum_size: settings.quorum_size,
            role: Role::Follower,
            term: Term(0),
            voted_for: None,
            lazy_vote: None,
            current_leader: None,
            ignore_leader: false,
            log: Vec::new(),
            commit_index: LogIndex::START,
            last_applied: LogIndex::START,
            replay: HashMap::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            convinced: HashSet::new(),
            quorum_cert: HashSet::new(),
            yes_votes: HashSet::new(),
            potential_votes: HashSet::new(),
            keyring,
            sender,
            election_timer: ElectionTimer::new(events_tx.clone(), election_min, election_max),
            heartbeat_timer: HeartbeatTimer::new(events_tx.clone(), settings.heartbeat_interval),
            state_machine,
            events: events_rx,
        }
    }

    /// Consume events until the queue closes. This is the node's whole life.
    pub async fn run(&mut self) -> Result<()> {
        info!(node = %self.id, "starting replica");
        self.election_timer.reset();
        while let Some(event) = self.events.recv().await {
            self.handle_event(event).await?;
        }
        info!(node = %self.id, "event queue closed, stopping");
        Ok(())
    }

    pub(crate) async fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Rpc(envelope) => self.handle_rpc(envelope).await,
            Event::ElectionTimeout { epoch } => {
                if epoch == self.election_timer.epoch() {
                    self.handle_election_timeout().await
                } else {
                    Ok(())
                }
            }
            Event::HeartbeatTimeout { epoch } => {
                if epoch == self.heartbeat_timer.epoch() {
                    self.handle_heartbeat_timeout().await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Crypto gate and dispatch. Anything that fails decode or verification
    /// is dropped without touching state.
    async fn handle_rpc(&mut self, envelope: Envelope) -> Result<()> {
        let rpc = match wire::decode_rpc(&envelope.payload) {
            Ok(rpc) => rpc,
            Err(e) => {
                debug!(node = %self.id, "undecodable rpc: {e}");
                return Ok(());
            }
        };
        if !self.verify(&rpc, &envelope) {
            debug!(node = %self.id, "dropping rpc with bad signature");
            return Ok(());
        }
        match rpc {
            Rpc::AppendEntries(ae) => self.handle_append_entries(ae).await,
            Rpc::AppendEntriesResponse(aer) => self.handle_append_entries_response(aer).await,
            Rpc::RequestVote(rv) => self.handle_request_vote(rv).await,
            Rpc::RequestVoteResponse(rvr) => {
                self.handle_request_vote_response(rvr, envelope.sig).await
            }
            Rpc::Command(cmd) => self.handle_command(cmd, envelope).await,
            Rpc::Revolution(rev) => self.handle_revolution(rev).await,
            Rpc::CommandResponse(resp) => {
                // Replies are for clients; a replica just notes it.
                debug!(node = %self.id, responder = %resp.responder_id, "ignoring command response");
                Ok(())
            }
            Rpc::Debug(msg) => {
                debug!(node = %self.id, from = %msg.node_id, "{}", msg.note);
                Ok(())
            }
        }
    }

    fn verify(&self, rpc: &Rpc, envelope: &Envelope) -> bool {
        match rpc {
            Rpc::AppendEntries(ae) => {
                self.keyring
                    .verify_node(ae.leader_id, &envelope.payload, &envelope.sig)
            }
            Rpc::AppendEntriesResponse(aer) => {
                self.keyring
                    .verify_node(aer.node_id, &envelope.payload, &envelope.sig)
            }
            Rpc::RequestVote(rv) => {
                self.keyring
                    .verify_node(rv.candidate_id, &envelope.payload, &envelope.sig)
            }
            Rpc::RequestVoteResponse(rvr) => {
                self.keyring
                    .verify_node(rvr.node_id, &envelope.payload, &envelope.sig)
            }
            Rpc::CommandResponse(resp) => {
                self.keyring
                    .verify_node(resp.responder_id, &envelope.payload, &envelope.sig)
            }
            Rpc::Debug(msg) => {
                self.keyring
                    .verify_node(msg.node_id, &envelope.payload, &envelope.sig)
            }
            // Client messages carry the client signature inside the payload,
            // over canonical signing bytes, so forwarding keeps it intact.
            Rpc::Command(cmd) => {
                match wire::command_signing_bytes(&cmd.entry, cmd.client_id, cmd.request_id) {
                    Ok(bytes) => self.keyring.verify_client(cmd.client_id, &bytes, &cmd.sig),
                    Err(_) => false,
                }
            }
            Rpc::Revolution(rev) => {
                match wire::revolution_signing_bytes(rev.client_id, rev.leader_id) {
                    Ok(bytes) => self.keyring.verify_client(rev.client_id, &bytes, &rev.sig),
                    Err(_) => false,
                }
            }
        }
    }

    pub(crate) fn last_index(&self) -> LogIndex {
        LogIndex(self.log.len() as i64 - 1)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.current_leader
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// Drain every event that is already queued. Test-only scheduling aid.
    #[cfg(test)]
    pub(crate) async fn pump(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event).await?;
            handled += 1;
        }
        Ok(handled)
    }
}
