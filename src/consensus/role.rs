//! Role transitions. Becoming leader requires a quorum of signed votes; the
//! accumulated set doubles as the certificate attached to every outgoing
//! AppendEntries for the rest of the term.

use tracing::{debug, info};

use crate::consensus::types::{
    last_log_info, LogIndex, NodeId, RequestVote, RequestVoteResponse, Role, Rpc, SignedVote, Term,
};
use crate::consensus::wire;
use crate::error::Result;
use crate::state_machine::StateMachine;

use super::node::RaftNode;

impl<S: StateMachine> RaftNode<S> {
    /// Adopt `term` with `leader` as its proven leader. Only called once a
    /// quorum certificate has validated, or at a deferred-vote timeout with
    /// `leader == None`.
    pub(crate) fn step_down_to(&mut self, term: Term, leader: Option<NodeId>) {
        if self.role == Role::Leader {
            self.heartbeat_timer.cancel();
        }
        self.role = Role::Follower;
        self.term = term;
        self.voted_for = None;
        self.current_leader = leader;
        self.ignore_leader = false;
        self.yes_votes.clear();
        self.potential_votes.clear();
    }

    pub(crate) async fn become_candidate(&mut self) -> Result<()> {
        self.role = Role::Candidate;
        self.term = self.term.next();
        self.voted_for = Some(self.id);
        self.current_leader = None;
        self.ignore_leader = false;
        self.yes_votes.clear();
        self.potential_votes = self.peers.iter().copied().collect();
        info!(node = %self.id, term = %self.term, "election timeout, standing for election");

        // Our own vote seeds the tally and, on a win, the certificate.
        let vote = RequestVoteResponse {
            term: self.term,
            candidate_id: self.id,
            node_id: self.id,
            vote_granted: true,
        };
        let sig = self.keyring.sign(&wire::vote_signing_bytes(&vote)?);
        self.yes_votes.insert(SignedVote { vote, sig });

        if self.granted_voters() >= self.quorum_size {
            return self.become_leader().await;
        }

        let (last_log_term, last_log_index) = last_log_info(&self.log);
        self.sender
            .broadcast(&Rpc::RequestVote(RequestVote {
                term: self.term,
                candidate_id: self.id,
                last_log_index,
                last_log_term,
            }))
            .await;
        self.election_timer.reset();
        Ok(())
    }

    pub(crate) async fn become_leader(&mut self) -> Result<()> {
        info!(node = %self.id, term = %self.term, "won election, becoming leader");
        self.role = Role::Leader;
        self.current_leader = Some(self.id);
        self.quorum_cert = self.yes_votes.clone();

        let next = self.last_index().next();
        self.next_index.clear();
        self.match_index.clear();
        self.convinced.clear();
        for &peer in &self.peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, LogIndex::START);
        }

        self.election_timer.cancel();
        self.heartbeat_timer.reset();
        // Announce immediately; the certificate rides along.
        self.broadcast_append_entries().await
    }

    /// Distinct peers that granted us a vote this term.
    pub(crate) fn granted_voters(&self) -> usize {
        let voters: std::collections::HashSet<NodeId> =
            self.yes_votes.iter().map(|v| v.vote.node_id).collect();
        debug!(node = %self.id, votes = voters.len(), "tallying election votes");
        voters.len()
    }
}
