//! The event rules. Everything safety-critical lives in this impl block:
//! leader recognition by quorum certificate, log matching, commit
//! advancement, deferred voting, command dedup, and leader revocation.

use tracing::{debug, info, warn};

use crate::consensus::types::{
    entry_term, last_log_info, prev_log_entry_matches, AppendEntries, AppendEntriesResponse,
    Command, CommandResponse, Envelope, LogEntry, LogIndex, NodeId, RequestVote,
    RequestVoteResponse, Revolution, Role, Rpc, Sig, SignedVote, Term,
};
use crate::consensus::wire;
use crate::error::{ConsensusError, Result};
use crate::state_machine::StateMachine;

use super::node::RaftNode;

impl<S: StateMachine> RaftNode<S> {
    // ---- AppendEntries ----

    pub(crate) async fn handle_append_entries(&mut self, ae: AppendEntries) -> Result<()> {
        self.check_for_new_leader(&ae);

        let current_term = self.term;
        let old_last = self.last_index();

        if self.current_leader == Some(ae.leader_id) && !self.ignore_leader && ae.term == current_term
        {
            self.election_timer.reset();
            self.lazy_vote = None;

            if !prev_log_entry_matches(&self.log, ae.prev_log_index, ae.prev_log_term) {
                debug!(
                    node = %self.id, prev = %ae.prev_log_index,
                    "log mismatch, asking leader to back off"
                );
                self.sender
                    .send(
                        ae.leader_id,
                        &Rpc::AppendEntriesResponse(AppendEntriesResponse {
                            term: current_term,
                            node_id: self.id,
                            convinced: true,
                            success: false,
                            index: old_last,
                        }),
                    )
                    .await;
                return Ok(());
            }

            // Keep everything through prev_log_index, then take the leader's
            // entries, dropping any conflicting suffix wholesale.
            let keep = (ae.prev_log_index.0 + 1).max(0) as usize;
            self.log.truncate(keep);
            self.log.extend(ae.entries.iter().cloned());
            let new_last = LogIndex(ae.prev_log_index.0 + ae.entries.len() as i64);

            self.sender
                .send(
                    ae.leader_id,
                    &Rpc::AppendEntriesResponse(AppendEntriesResponse {
                        term: current_term,
                        node_id: self.id,
                        convinced: true,
                        success: true,
                        index: new_last,
                    }),
                )
                .await;

            if ae.leader_commit > self.commit_index {
                self.commit_index = ae.leader_commit.min(new_last);
                self.apply_log_entries().await?;
            }
        } else if !self.ignore_leader && ae.term >= current_term {
            // A plausible term, but no proof this sender leads it.
            self.sender
                .send(
                    ae.leader_id,
                    &Rpc::AppendEntriesResponse(AppendEntriesResponse {
                        term: current_term,
                        node_id: self.id,
                        convinced: false,
                        success: false,
                        index: old_last,
                    }),
                )
                .await;
        } else {
            debug!(node = %self.id, from = %ae.leader_id, "dropping append entries");
        }
        Ok(())
    }

    /// The only path by which a node adopts a leader: a certificate of
    /// quorum-many valid votes for `(leader_id, term)`.
    fn check_for_new_leader(&mut self, ae: &AppendEntries) {
        if ae.term == self.term && self.current_leader == Some(ae.leader_id) {
            return;
        }
        if ae.term < self.term || ae.quorum_votes.is_empty() {
            return;
        }
        if !self.valid_quorum_certificate(&ae.quorum_votes, ae.leader_id, ae.term) {
            debug!(
                node = %self.id, claimed_leader = %ae.leader_id, term = %ae.term,
                "rejecting election certificate"
            );
            return;
        }
        info!(node = %self.id, leader = %ae.leader_id, term = %ae.term, "accepting new leader");
        self.step_down_to(ae.term, Some(ae.leader_id));
    }

    pub(crate) fn valid_quorum_certificate(
        &self,
        votes: &std::collections::HashSet<SignedVote>,
        leader_id: NodeId,
        term: Term,
    ) -> bool {
        let mut voters = std::collections::HashSet::new();
        for signed in votes {
            let vote = &signed.vote;
            if !vote.vote_granted || vote.candidate_id != leader_id || vote.term != term {
                return false;
            }
            let Ok(bytes) = wire::vote_signing_bytes(vote) else {
                return false;
            };
            if !self.keyring.verify_node(vote.node_id, &bytes, &signed.sig) {
                return false;
            }
            voters.insert(vote.node_id);
        }
        voters.len() >= self.quorum_size
    }

    // ---- AppendEntriesResponse ----

    pub(crate) async fn handle_append_entries_response(
        &mut self,
        aer: AppendEntriesResponse,
    ) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let peer = aer.node_id;

        if !aer.convinced && aer.term <= self.term {
            self.convinced.remove(&peer);
        }
        if aer.term == self.term {
            if aer.convinced && !aer.success {
                // Log-matching backoff, one entry at a time.
                if let Some(next) = self.next_index.get_mut(&peer) {
                    if next.0 > 0 {
                        *next = next.prev();
                    }
                }
            } else if aer.convinced && aer.success {
                // Clamp: a lying follower must not push next_index past our log.
                let index = aer.index.min(self.last_index());
                self.match_index.insert(peer, index);
                self.next_index.insert(peer, index.next());
                self.convinced.insert(peer);
                self.advance_commit_index().await?;
            }
        }
        if !aer.convinced || !aer.success {
            self.send_append_entries(peer).await?;
        }
        Ok(())
    }

    // ---- RequestVote ----

    pub(crate) async fn handle_request_vote(&mut self, rv: RequestVote) -> Result<()> {
        if rv.term < self.term {
            self.send_vote(&rv, false).await;
            return Ok(());
        }
        if self.voted_for == Some(rv.candidate_id) && rv.term == self.term {
            // Re-asserting a vote we already cast is harmless.
            self.send_vote(&rv, true).await;
            return Ok(());
        }
        if self.voted_for.is_some() && rv.term == self.term {
            self.send_vote(&rv, false).await;
            return Ok(());
        }

        let ours = last_log_info(&self.log);
        if (rv.last_log_term, rv.last_log_index) >= ours {
            // Promising candidate: remember the vote, but only externalize it
            // if our own election timer fires. A better candidate arriving in
            // the meantime (strictly higher term) can still displace it.
            match self.lazy_vote {
                Some((term, _)) if term >= rv.term => {
                    debug!(node = %self.id, "keeping existing deferred vote for term {term}");
                }
                _ => {
                    debug!(
                        node = %self.id, candidate = %rv.candidate_id, term = %rv.term,
                        "deferring vote"
                    );
                    self.lazy_vote = Some((rv.term, rv.candidate_id));
                }
            }
        } else {
            self.send_vote(&rv, false).await;
        }
        Ok(())
    }

    async fn send_vote(&mut self, rv: &RequestVote, granted: bool) {
        self.sender
            .send(
                rv.candidate_id,
                &Rpc::RequestVoteResponse(RequestVoteResponse {
                    term: rv.term,
                    candidate_id: rv.candidate_id,
                    node_id: self.id,
                    vote_granted: granted,
                }),
            )
            .await;
    }

    // ---- RequestVoteResponse ----

    pub(crate) async fn handle_request_vote_response(
        &mut self,
        rvr: RequestVoteResponse,
        sig: Sig,
    ) -> Result<()> {
        if self.role != Role::Candidate || rvr.term != self.term {
            return Ok(());
        }
        if rvr.vote_granted {
            if rvr.candidate_id != self.id {
                return Ok(());
            }
            self.yes_votes.insert(SignedVote { vote: rvr, sig });
            if self.granted_voters() >= self.quorum_size {
                self.become_leader().await?;
            }
        } else {
            self.potential_votes.remove(&rvr.node_id);
        }
        Ok(())
    }

    // ---- Timeouts ----

    pub(crate) async fn handle_election_timeout(&mut self) -> Result<()> {
        if self.role == Role::Leader {
            return Ok(());
        }
        if let Some((term, candidate)) = self.lazy_vote.take() {
            if term >= self.term {
                info!(node = %self.id, candidate = %candidate, term = %term, "casting deferred vote");
                self.term = term;
                self.voted_for = Some(candidate);
                self.ignore_leader = false;
                self.current_leader = None;
                self.sender
                    .send(
                        candidate,
                        &Rpc::RequestVoteResponse(RequestVoteResponse {
                            term,
                            candidate_id: candidate,
                            node_id: self.id,
                            vote_granted: true,
                        }),
                    )
                    .await;
                self.election_timer.reset();
                return Ok(());
            }
            // Our term moved past the deferred vote; it is dead.
            debug!(node = %self.id, "discarding stale deferred vote for term {term}");
        }
        self.become_candidate().await
    }

    pub(crate) async fn handle_heartbeat_timeout(&mut self) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        self.broadcast_append_entries().await?;
        self.heartbeat_timer.reset();
        Ok(())
    }

    // ---- Commands ----

    pub(crate) async fn handle_command(&mut self, cmd: Command, envelope: Envelope) -> Result<()> {
        let key = (cmd.client_id, cmd.sig.clone());
        if let Some(Some(cached)) = self.replay.get(&key) {
            debug!(node = %self.id, client = %cmd.client_id, "replaying cached response");
            let cached = cached.clone();
            self.sender.respond_to_client(cmd.client_id, cached).await;
            return Ok(());
        }

        if self.role == Role::Leader {
            self.log.push(LogEntry {
                term: self.term,
                command: cmd,
            });
            self.broadcast_append_entries().await?;
            self.advance_commit_index().await?;
        } else if let Some(leader) = self.current_leader {
            // Relay untouched so the client signature keeps verifying.
            self.sender.forward(leader, &envelope).await;
        } else {
            debug!(node = %self.id, client = %cmd.client_id, "no known leader, dropping command");
        }
        Ok(())
    }

    // ---- Revolution ----

    pub(crate) async fn handle_revolution(&mut self, rev: Revolution) -> Result<()> {
        let key = (rev.client_id, rev.sig.clone());
        if self.replay.contains_key(&key) {
            return Ok(());
        }
        if self.current_leader == Some(rev.leader_id) {
            warn!(
                node = %self.id, leader = %rev.leader_id, client = %rev.client_id,
                "client revoked the current leader"
            );
            self.replay.insert(key, None);
            self.ignore_leader = true;
        }
        Ok(())
    }

    // ---- Replication plumbing (leader) ----

    pub(crate) async fn send_append_entries(&mut self, peer: NodeId) -> Result<()> {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or_else(|| self.last_index().next());
        let prev_log_index = next.prev();
        let prev_log_term = if prev_log_index == LogIndex::START {
            Term(0)
        } else {
            entry_term(&self.log, prev_log_index).ok_or_else(|| {
                ConsensusError::Corrupt(format!("next_index for {peer} points past the log"))
            })?
        };
        let entries = match next.as_slot() {
            Some(slot) if slot < self.log.len() => self.log[slot..].to_vec(),
            _ => Vec::new(),
        };

        let ae = AppendEntries {
            term: self.term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
            quorum_votes: self.quorum_cert.clone(),
        };
        self.sender.send(peer, &Rpc::AppendEntries(ae)).await;
        Ok(())
    }

    pub(crate) async fn broadcast_append_entries(&mut self) -> Result<()> {
        let peers = self.peers.clone();
        for peer in peers {
            self.send_append_entries(peer).await?;
        }
        Ok(())
    }

    // ---- Commit advancement ----

    /// Advance `commit_index` over the longest prefix of own-term entries
    /// that a quorum (counting ourselves) has replicated. Returns whether it
    /// moved.
    pub(crate) async fn advance_commit_index(&mut self) -> Result<bool> {
        if self.role != Role::Leader {
            return Ok(false);
        }
        let last = self.last_index();
        let mut advanced_to = None;
        let mut index = self.commit_index.next();
        while index <= last {
            let term = entry_term(&self.log, index)
                .ok_or_else(|| ConsensusError::Corrupt(format!("missing log entry at {index}")))?;
            if term == self.term {
                let acks = 1 + self
                    .peers
                    .iter()
                    .filter(|peer| {
                        self.match_index
                            .get(peer)
                            .copied()
                            .unwrap_or(LogIndex::START)
                            >= index
                    })
                    .count();
                if acks >= self.quorum_size {
                    advanced_to = Some(index);
                } else {
                    break;
                }
            }
            index = index.next();
        }

        match advanced_to {
            Some(index) => {
                debug!(node = %self.id, commit = %index, "commit index advanced");
                self.commit_index = index;
                self.apply_log_entries().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ---- Applying ----

    /// Feed committed-but-unapplied entries to the state machine, record
    /// responses in the replay map, and (as leader) answer the clients.
    pub(crate) async fn apply_log_entries(&mut self) -> Result<()> {
        let mut responses = Vec::new();
        let mut index = self.last_applied.next();
        while index <= self.commit_index {
            let entry = index
                .as_slot()
                .and_then(|slot| self.log.get(slot))
                .cloned()
                .ok_or_else(|| {
                    ConsensusError::Corrupt(format!("commit index {index} is beyond the log"))
                })?;
            let key = (entry.command.client_id, entry.command.sig.clone());
            let response = match self.replay.get(&key) {
                // The command already executed (a duplicate made it into the
                // log); reuse the recorded response instead of re-applying.
                Some(Some(cached)) => cached.clone(),
                _ => {
                    let result = self.state_machine.apply(&entry.command.entry);
                    let proof_bytes = wire::proof_signing_bytes(entry.command.request_id, &result)?;
                    let response = CommandResponse {
                        result,
                        leader_hint: self.current_leader,
                        responder_id: self.id,
                        request_id: entry.command.request_id,
                        proof: self.keyring.sign(&proof_bytes),
                    };
                    self.replay.insert(key, Some(response.clone()));
                    response
                }
            };
            responses.push((entry.command.client_id, response));
            index = index.next();
        }
        self.last_applied = self.commit_index;

        if self.role == Role::Leader {
            for (client, response) in responses {
                self.sender.respond_to_client(client, response).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::node::{NodeSettings, RaftNode};
    use crate::consensus::types::{ClientId, Envelope, Event, RequestId};
    use crate::crypto::Keyring;
    use crate::state_machine::KvStore;
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use ed25519_dalek::{Signer, SigningKey};
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const CLIENT: ClientId = ClientId(100);

    struct Cluster {
        network: Arc<MemoryNetwork>,
        nodes: Vec<RaftNode<KvStore>>,
        node_keys: HashMap<NodeId, SigningKey>,
        client_key: SigningKey,
        client_rx: mpsc::UnboundedReceiver<Envelope>,
    }

    /// Wire up `n` replicas over a loopback mesh. Timer intervals are huge so
    /// tests drive every timeout by hand.
    async fn cluster(n: u64, quorum_size: usize) -> Cluster {
        let network = MemoryNetwork::new();
        let ids: Vec<NodeId> = (1..=n).map(NodeId).collect();
        let node_keys: HashMap<NodeId, SigningKey> = ids
            .iter()
            .map(|&id| (id, SigningKey::generate(&mut rand::rngs::OsRng)))
            .collect();
        let client_key = SigningKey::generate(&mut rand::rngs::OsRng);

        let node_public: HashMap<_, _> = node_keys
            .iter()
            .map(|(&id, key)| (id, key.verifying_key()))
            .collect();
        let client_public: HashMap<_, _> =
            [(CLIENT, client_key.verifying_key())].into_iter().collect();

        let client_rx = network.register_client(CLIENT).await;

        let mut nodes = Vec::new();
        for &id in &ids {
            let (tx, rx) = mpsc::unbounded_channel();
            network.attach_node(id, tx.clone()).await;
            let keyring = Arc::new(Keyring::new(
                node_keys[&id].clone(),
                node_public.clone(),
                client_public.clone(),
            ));
            let settings = NodeSettings {
                id,
                peers: ids.iter().copied().filter(|&peer| peer != id).collect(),
                quorum_size,
                election_timeout: (Duration::from_secs(600), Duration::from_secs(600)),
                heartbeat_interval: Duration::from_secs(600),
            };
            let transport = Arc::new(MemoryTransport::new(Arc::clone(&network)));
            nodes.push(RaftNode::new(
                settings,
                keyring,
                transport,
                KvStore::new(),
                &tx,
                rx,
            ));
        }

        Cluster {
            network,
            nodes,
            node_keys,
            client_key,
            client_rx,
        }
    }

    impl Cluster {
        fn node(&mut self, id: u64) -> &mut RaftNode<KvStore> {
            self.nodes
                .iter_mut()
                .find(|node| node.id == NodeId(id))
                .unwrap()
        }

        /// Pump every node until the mesh is quiet.
        async fn settle(&mut self) {
            loop {
                let mut handled = 0;
                for node in &mut self.nodes {
                    handled += node.pump().await.unwrap();
                }
                if handled == 0 {
                    break;
                }
            }
        }

        /// Full election for `id`: it stands, the others defer their votes,
        /// their timers pop, the votes arrive, it wins.
        async fn elect(&mut self, id: u64) {
            self.node(id).handle_election_timeout().await.unwrap();
            self.settle().await;
            let others: Vec<u64> = self
                .nodes
                .iter()
                .map(|node| node.id.0)
                .filter(|&other| other != id)
                .collect();
            for other in others {
                self.node(other).handle_election_timeout().await.unwrap();
            }
            self.settle().await;
            assert_eq!(self.node(id).role, Role::Leader);
        }

        fn command_envelope(&self, request_id: u64, entry: &[u8]) -> Envelope {
            signed_command(&self.client_key, CLIENT, request_id, entry)
        }

        fn revolution_envelope(&self, leader: u64) -> Envelope {
            let bytes = wire::revolution_signing_bytes(CLIENT, NodeId(leader)).unwrap();
            let sig = Sig(self.client_key.sign(&bytes).to_bytes().to_vec());
            let payload = wire::encode_rpc(&Rpc::Revolution(Revolution {
                client_id: CLIENT,
                leader_id: NodeId(leader),
                sig: sig.clone(),
            }))
            .unwrap();
            Envelope { payload, sig }
        }

        fn node_envelope(&self, signer: u64, rpc: &Rpc) -> Envelope {
            let payload = wire::encode_rpc(rpc).unwrap();
            let sig = Sig(self.node_keys[&NodeId(signer)]
                .sign(&payload)
                .to_bytes()
                .to_vec());
            Envelope { payload, sig }
        }

        fn signed_vote(&self, voter: u64, candidate: u64, term: u64, granted: bool) -> SignedVote {
            let vote = RequestVoteResponse {
                term: Term(term),
                candidate_id: NodeId(candidate),
                node_id: NodeId(voter),
                vote_granted: granted,
            };
            let sig = Sig(self.node_keys[&NodeId(voter)]
                .sign(&wire::vote_signing_bytes(&vote).unwrap())
                .to_bytes()
                .to_vec());
            SignedVote { vote, sig }
        }

        fn log_entry(&self, term: u64, request_id: u64, payload: &[u8]) -> LogEntry {
            let bytes =
                wire::command_signing_bytes(payload, CLIENT, RequestId(request_id)).unwrap();
            let sig = Sig(self.client_key.sign(&bytes).to_bytes().to_vec());
            LogEntry {
                term: Term(term),
                command: Command {
                    entry: payload.to_vec(),
                    client_id: CLIENT,
                    request_id: RequestId(request_id),
                    sig,
                },
            }
        }

        async fn deliver(&mut self, to: u64, envelope: Envelope) {
            self.node(to)
                .handle_event(Event::Rpc(envelope))
                .await
                .unwrap();
        }

        fn client_response(&mut self) -> CommandResponse {
            let envelope = self.client_rx.try_recv().expect("no client response queued");
            match wire::decode_rpc(&envelope.payload).unwrap() {
                Rpc::CommandResponse(resp) => resp,
                other => panic!("unexpected rpc to client: {other:?}"),
            }
        }

        /// Swap a node's inbound queue for one the test reads, so traffic
        /// addressed to it can be inspected instead of processed.
        async fn spy_on(&mut self, id: u64) -> mpsc::UnboundedReceiver<Event> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.network.attach_node(NodeId(id), tx).await;
            rx
        }
    }

    fn signed_command(
        key: &SigningKey,
        client: ClientId,
        request_id: u64,
        entry: &[u8],
    ) -> Envelope {
        let bytes = wire::command_signing_bytes(entry, client, RequestId(request_id)).unwrap();
        let sig = Sig(key.sign(&bytes).to_bytes().to_vec());
        let payload = wire::encode_rpc(&Rpc::Command(Command {
            entry: entry.to_vec(),
            client_id: client,
            request_id: RequestId(request_id),
            sig: sig.clone(),
        }))
        .unwrap();
        Envelope { payload, sig }
    }

    fn rpc_from(event: Event) -> Rpc {
        match event {
            Event::Rpc(envelope) => wire::decode_rpc(&envelope.payload).unwrap(),
            other => panic!("expected rpc event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn happy_path_commits_applies_and_replies() {
        let mut cluster = cluster(3, 2).await;
        cluster.elect(1).await;
        assert_eq!(cluster.node(2).current_leader, Some(NodeId(1)));
        assert_eq!(cluster.node(3).current_leader, Some(NodeId(1)));

        let cmd = cluster.command_envelope(1, b"SET x 1");
        cluster.deliver(1, cmd).await;
        cluster.settle().await;

        // Leader has committed and applied; followers have the entry but
        // learn the commit index only from the next heartbeat.
        assert_eq!(cluster.node(1).commit_index, LogIndex(0));
        assert_eq!(cluster.node(1).last_applied, LogIndex(0));
        assert_eq!(cluster.node(2).log.len(), 1);
        assert_eq!(cluster.node(2).commit_index, LogIndex::START);

        let resp = cluster.client_response();
        assert_eq!(resp.result, b"OK");
        assert_eq!(resp.leader_hint, Some(NodeId(1)));
        assert_eq!(resp.responder_id, NodeId(1));
        assert_eq!(resp.request_id, RequestId(1));

        // Heartbeats carry no entries but do carry the commit index.
        cluster.node(1).handle_heartbeat_timeout().await.unwrap();
        cluster.settle().await;
        for id in [2, 3] {
            assert_eq!(cluster.node(id).log.len(), 1);
            assert_eq!(cluster.node(id).commit_index, LogIndex(0));
            assert_eq!(cluster.node(id).last_applied, LogIndex(0));
        }
    }

    #[tokio::test]
    async fn duplicate_command_replays_cached_response() {
        let mut cluster = cluster(3, 2).await;
        cluster.elect(1).await;

        let cmd = cluster.command_envelope(1, b"SET x 1");
        cluster.deliver(1, cmd.clone()).await;
        cluster.settle().await;
        let first = cluster.client_response();

        cluster.deliver(1, cmd).await;
        cluster.settle().await;
        let second = cluster.client_response();

        assert_eq!(first, second);
        assert_eq!(cluster.node(1).log.len(), 1);
    }

    #[tokio::test]
    async fn new_leader_certificate_displaces_old_leader() {
        let mut cluster = cluster(3, 2).await;
        cluster.elect(1).await;

        // Leader 1 has an uncommitted entry nobody else saw.
        let stranded = cluster.log_entry(1, 7, b"SET lost 1");
        cluster.node(1).log.push(stranded);

        // Node 2 stands for term 2; node 3 votes, node 1 is still leader and
        // ignores its own election timer.
        cluster.elect(2).await;
        assert_eq!(cluster.node(2).term, Term(2));

        // The certificate in node 2's announcement deposed node 1 and the
        // empty prefix truncated its stranded tail.
        assert_eq!(cluster.node(1).role, Role::Follower);
        assert_eq!(cluster.node(1).term, Term(2));
        assert_eq!(cluster.node(1).current_leader, Some(NodeId(2)));
        assert!(cluster.node(1).log.is_empty());

        // Replication proceeds under the new leader.
        let cmd = cluster.command_envelope(8, b"SET y 2");
        cluster.deliver(2, cmd).await;
        cluster.settle().await;
        cluster.node(2).handle_heartbeat_timeout().await.unwrap();
        cluster.settle().await;
        for id in [1, 2, 3] {
            assert_eq!(cluster.node(id).log.len(), 1);
            assert_eq!(cluster.node(id).last_applied, LogIndex(0));
        }
    }

    #[tokio::test]
    async fn append_entries_without_proof_leaves_follower_unconvinced() {
        let mut cluster = cluster(3, 2).await;
        cluster.elect(1).await;
        let mut spy = cluster.spy_on(3).await;

        // Node 3 claims to lead the current term but attaches no certificate.
        let fake = Rpc::AppendEntries(AppendEntries {
            term: Term(1),
            leader_id: NodeId(3),
            prev_log_index: LogIndex::START,
            prev_log_term: Term(0),
            entries: vec![],
            leader_commit: LogIndex::START,
            quorum_votes: HashSet::new(),
        });
        let envelope = cluster.node_envelope(3, &fake);
        cluster.deliver(2, envelope).await;

        match rpc_from(spy.try_recv().unwrap()) {
            Rpc::AppendEntriesResponse(aer) => {
                assert!(!aer.convinced);
                assert!(!aer.success);
                assert_eq!(aer.term, Term(1));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(cluster.node(2).current_leader, Some(NodeId(1)));
        assert_eq!(cluster.node(2).term, Term(1));
    }

    #[tokio::test]
    async fn stale_term_append_entries_is_dropped_silently() {
        let mut cluster = cluster(3, 2).await;
        cluster.elect(1).await;
        cluster.elect(2).await;
        let mut spy = cluster.spy_on(1).await;

        let stale = Rpc::AppendEntries(AppendEntries {
            term: Term(1),
            leader_id: NodeId(1),
            prev_log_index: LogIndex::START,
            prev_log_term: Term(0),
            entries: vec![],
            leader_commit: LogIndex::START,
            quorum_votes: HashSet::new(),
        });
        let envelope = cluster.node_envelope(1, &stale);
        cluster.deliver(3, envelope).await;

        assert!(spy.try_recv().is_err());
        assert_eq!(cluster.node(3).term, Term(2));
        assert_eq!(cluster.node(3).current_leader, Some(NodeId(2)));
    }

    #[tokio::test]
    async fn revolution_blocks_leader_until_reelection() {
        let mut cluster = cluster(3, 2).await;
        cluster.elect(1).await;

        // Revolution naming a node that is not our leader is a no-op.
        let wrong = cluster.revolution_envelope(3);
        cluster.deliver(2, wrong).await;
        assert!(!cluster.node(2).ignore_leader);
        assert!(cluster.node(2).replay.is_empty());

        let revolt = cluster.revolution_envelope(1);
        cluster.deliver(2, revolt.clone()).await;
        assert!(cluster.node(2).ignore_leader);
        assert_eq!(cluster.node(2).replay.len(), 1);
        assert!(cluster.node(2).replay.values().next().unwrap().is_none());

        // One-shot: replaying the same revolution changes nothing.
        cluster.deliver(2, revolt).await;
        assert_eq!(cluster.node(2).replay.len(), 1);

        // Heartbeats from the revoked leader are now ignored outright.
        let before = cluster.node(2).term;
        cluster.node(1).handle_heartbeat_timeout().await.unwrap();
        cluster.settle().await;
        assert_eq!(cluster.node(2).term, before);
        assert!(cluster.node(2).log.is_empty());

        // The starved election timer eventually forces a new election.
        cluster.node(2).handle_election_timeout().await.unwrap();
        assert_eq!(cluster.node(2).role, Role::Candidate);
        assert_eq!(cluster.node(2).term, Term(2));
        assert!(!cluster.node(2).ignore_leader);
    }

    #[tokio::test]
    async fn divergent_follower_log_is_repaired() {
        let mut cluster = cluster(3, 2).await;
        let shared = vec![
            cluster.log_entry(1, 1, b"SET a 1"),
            cluster.log_entry(1, 2, b"SET b 2"),
        ];

        let leader_tail = cluster.log_entry(3, 3, b"SET d 4");
        let divergent_tail = cluster.log_entry(2, 9, b"SET c 3");

        {
            let leader = cluster.node(1);
            leader.role = Role::Leader;
            leader.term = Term(3);
            leader.current_leader = Some(NodeId(1));
            leader.log = shared.clone();
            leader.log.push(leader_tail);
            leader.next_index.insert(NodeId(2), LogIndex(2));
            leader.next_index.insert(NodeId(3), LogIndex(3));
            leader.match_index.insert(NodeId(2), LogIndex::START);
            leader.match_index.insert(NodeId(3), LogIndex::START);
        }
        {
            let follower = cluster.node(2);
            follower.term = Term(3);
            follower.current_leader = Some(NodeId(1));
            follower.log = shared;
            follower.log.push(divergent_tail);
        }

        cluster.node(1).send_append_entries(NodeId(2)).await.unwrap();
        cluster.settle().await;

        let leader_log = cluster.node(1).log.clone();
        assert_eq!(cluster.node(2).log, leader_log);
        assert_eq!(cluster.node(1).match_index[&NodeId(2)], LogIndex(2));
        assert_eq!(cluster.node(1).next_index[&NodeId(2)], LogIndex(3));
        assert!(cluster.node(1).convinced.contains(&NodeId(2)));
        // Quorum reached for the term-3 entry, which commits the prefix too.
        assert_eq!(cluster.node(1).commit_index, LogIndex(2));
        assert_eq!(cluster.node(1).last_applied, LogIndex(2));
    }

    #[tokio::test]
    async fn lazy_vote_prefers_strictly_higher_terms() {
        let mut cluster = cluster(3, 2).await;

        let rv = |candidate: u64, term: u64| {
            Rpc::RequestVote(RequestVote {
                term: Term(term),
                candidate_id: NodeId(candidate),
                last_log_index: LogIndex::START,
                last_log_term: Term(0),
            })
        };

        let envelope = cluster.node_envelope(1, &rv(1, 5));
        cluster.deliver(3, envelope).await;
        assert_eq!(cluster.node(3).lazy_vote, Some((Term(5), NodeId(1))));

        // Lower term cannot displace it.
        let envelope = cluster.node_envelope(2, &rv(2, 4));
        cluster.deliver(3, envelope).await;
        assert_eq!(cluster.node(3).lazy_vote, Some((Term(5), NodeId(1))));

        // Strictly higher term does.
        let envelope = cluster.node_envelope(2, &rv(2, 6));
        cluster.deliver(3, envelope).await;
        assert_eq!(cluster.node(3).lazy_vote, Some((Term(6), NodeId(2))));

        // Equal term keeps the incumbent.
        let envelope = cluster.node_envelope(1, &rv(1, 6));
        cluster.deliver(3, envelope).await;
        assert_eq!(cluster.node(3).lazy_vote, Some((Term(6), NodeId(2))));
    }

    #[tokio::test]
    async fn deferred_vote_is_cast_only_at_timeout() {
        let mut cluster = cluster(3, 2).await;
        let mut spy = cluster.spy_on(1).await;

        let rv = Rpc::RequestVote(RequestVote {
            term: Term(1),
            candidate_id: NodeId(1),
            last_log_index: LogIndex::START,
            last_log_term: Term(0),
        });
        let envelope = cluster.node_envelope(1, &rv);
        cluster.deliver(3, envelope).await;

        // No reply yet; the vote is only recorded.
        assert!(spy.try_recv().is_err());
        assert_eq!(cluster.node(3).lazy_vote, Some((Term(1), NodeId(1))));

        cluster.node(3).handle_election_timeout().await.unwrap();
        match rpc_from(spy.try_recv().unwrap()) {
            Rpc::RequestVoteResponse(rvr) => {
                assert!(rvr.vote_granted);
                assert_eq!(rvr.term, Term(1));
                assert_eq!(rvr.candidate_id, NodeId(1));
                assert_eq!(rvr.node_id, NodeId(3));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(cluster.node(3).term, Term(1));
        assert_eq!(cluster.node(3).voted_for, Some(NodeId(1)));
        assert_eq!(cluster.node(3).lazy_vote, None);
        assert_eq!(cluster.node(3).current_leader, None);
    }

    #[tokio::test]
    async fn voting_covers_stale_terms_prior_votes_and_log_freshness() {
        let mut cluster = cluster(3, 2).await;
        let mut spy1 = cluster.spy_on(1).await;
        let mut spy2 = cluster.spy_on(2).await;

        let rv = |candidate: u64, term: u64, last_index: i64, last_term: u64| {
            Rpc::RequestVote(RequestVote {
                term: Term(term),
                candidate_id: NodeId(candidate),
                last_log_index: LogIndex(last_index),
                last_log_term: Term(last_term),
            })
        };

        // Stale term: immediate refusal.
        cluster.node(3).term = Term(5);
        let envelope = cluster.node_envelope(1, &rv(1, 4, -1, 0));
        cluster.deliver(3, envelope).await;
        match rpc_from(spy1.try_recv().unwrap()) {
            Rpc::RequestVoteResponse(rvr) => assert!(!rvr.vote_granted),
            other => panic!("unexpected reply: {other:?}"),
        }

        // Idempotent re-grant for the candidate we already voted for.
        cluster.node(3).voted_for = Some(NodeId(1));
        let envelope = cluster.node_envelope(1, &rv(1, 5, -1, 0));
        cluster.deliver(3, envelope).await;
        match rpc_from(spy1.try_recv().unwrap()) {
            Rpc::RequestVoteResponse(rvr) => {
                assert!(rvr.vote_granted);
                assert_eq!(rvr.term, Term(5));
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        // Same term, different candidate: refused.
        let envelope = cluster.node_envelope(2, &rv(2, 5, -1, 0));
        cluster.deliver(3, envelope).await;
        match rpc_from(spy2.try_recv().unwrap()) {
            Rpc::RequestVoteResponse(rvr) => assert!(!rvr.vote_granted),
            other => panic!("unexpected reply: {other:?}"),
        }

        // Higher term but a shorter log: refused outright, no lazy vote.
        let entry = cluster.log_entry(1, 1, b"SET a 1");
        cluster.node(3).log.push(entry);
        let envelope = cluster.node_envelope(2, &rv(2, 6, -1, 0));
        cluster.deliver(3, envelope).await;
        match rpc_from(spy2.try_recv().unwrap()) {
            Rpc::RequestVoteResponse(rvr) => assert!(!rvr.vote_granted),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(cluster.node(3).lazy_vote, None);
    }

    #[tokio::test]
    async fn commit_needs_an_own_term_entry() {
        let mut cluster = cluster(3, 2).await;
        let old = cluster.log_entry(1, 1, b"SET a 1");
        let node = cluster.node(1);
        node.role = Role::Leader;
        node.term = Term(2);
        node.current_leader = Some(NodeId(1));
        node.log.push(old);
        node.match_index.insert(NodeId(2), LogIndex(0));
        node.match_index.insert(NodeId(3), LogIndex(0));

        // Replicated everywhere, but from an older term: not committable.
        assert!(!node.advance_commit_index().await.unwrap());
        assert_eq!(node.commit_index, LogIndex::START);
    }

    #[tokio::test]
    async fn commit_advances_over_the_quorum_prefix() {
        let mut cluster = cluster(3, 2).await;
        let old = cluster.log_entry(1, 1, b"SET a 1");
        let own = cluster.log_entry(2, 2, b"SET b 2");
        let node = cluster.node(1);
        node.role = Role::Leader;
        node.term = Term(2);
        node.current_leader = Some(NodeId(1));
        node.log.push(old);
        node.log.push(own);

        // Nobody acked the own-term entry yet: nothing commits.
        node.match_index.insert(NodeId(2), LogIndex(0));
        node.match_index.insert(NodeId(3), LogIndex(0));
        assert!(!node.advance_commit_index().await.unwrap());
        assert_eq!(node.commit_index, LogIndex::START);

        // One ack on the own-term entry reaches quorum (leader counts) and
        // commits the older prefix with it.
        node.match_index.insert(NodeId(2), LogIndex(1));
        assert!(node.advance_commit_index().await.unwrap());
        assert_eq!(node.commit_index, LogIndex(1));
        assert_eq!(node.last_applied, LogIndex(1));
    }

    #[tokio::test]
    async fn rejected_append_backs_off_and_resends() {
        let mut cluster = cluster(3, 2).await;
        cluster.elect(1).await;
        for i in 1..=3 {
            let entry = cluster.log_entry(1, i, b"SET a 1");
            cluster.node(1).log.push(entry);
        }
        cluster.node(1).next_index.insert(NodeId(2), LogIndex(3));
        let mut spy = cluster.spy_on(2).await;

        let refusal = Rpc::AppendEntriesResponse(AppendEntriesResponse {
            term: Term(1),
            node_id: NodeId(2),
            convinced: true,
            success: false,
            index: LogIndex(2),
        });
        let envelope = cluster.node_envelope(2, &refusal);
        cluster.deliver(1, envelope).await;

        assert_eq!(cluster.node(1).next_index[&NodeId(2)], LogIndex(2));
        match rpc_from(spy.try_recv().unwrap()) {
            Rpc::AppendEntries(ae) => {
                assert_eq!(ae.prev_log_index, LogIndex(1));
                assert_eq!(ae.entries.len(), 1);
                // The certificate from the election rides on every AE.
                assert!(!ae.quorum_votes.is_empty());
            }
            other => panic!("unexpected rpc: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unconvinced_response_sheds_the_peer_and_resends() {
        let mut cluster = cluster(3, 2).await;
        cluster.elect(1).await;
        cluster.node(1).convinced.insert(NodeId(2));
        let mut spy = cluster.spy_on(2).await;

        let unconvinced = Rpc::AppendEntriesResponse(AppendEntriesResponse {
            term: Term(1),
            node_id: NodeId(2),
            convinced: false,
            success: false,
            index: LogIndex::START,
        });
        let envelope = cluster.node_envelope(2, &unconvinced);
        cluster.deliver(1, envelope).await;

        assert!(!cluster.node(1).convinced.contains(&NodeId(2)));
        match rpc_from(spy.try_recv().unwrap()) {
            Rpc::AppendEntries(ae) => assert!(!ae.quorum_votes.is_empty()),
            other => panic!("unexpected rpc: {other:?}"),
        }
    }

    #[tokio::test]
    async fn quorum_certificates_are_checked_vote_by_vote() {
        let mut cluster = cluster(3, 2).await;

        let good: HashSet<SignedVote> = [
            cluster.signed_vote(1, 1, 1, true),
            cluster.signed_vote(2, 1, 1, true),
        ]
        .into_iter()
        .collect();
        assert!(cluster
            .node(3)
            .valid_quorum_certificate(&good, NodeId(1), Term(1)));

        // Too few distinct voters.
        let small: HashSet<SignedVote> =
            [cluster.signed_vote(1, 1, 1, true)].into_iter().collect();
        assert!(!cluster
            .node(3)
            .valid_quorum_certificate(&small, NodeId(1), Term(1)));

        // A forged signature poisons the whole certificate.
        let mut forged = good.clone();
        let mut vote = cluster.signed_vote(3, 1, 1, true);
        vote.sig.0[0] ^= 0xff;
        forged.insert(vote);
        assert!(!cluster
            .node(3)
            .valid_quorum_certificate(&forged, NodeId(1), Term(1)));

        // Votes must name the claimed leader and term.
        assert!(!cluster
            .node(3)
            .valid_quorum_certificate(&good, NodeId(2), Term(1)));
        assert!(!cluster
            .node(3)
            .valid_quorum_certificate(&good, NodeId(1), Term(2)));

        // A refused vote can never support a certificate.
        let refused: HashSet<SignedVote> = [
            cluster.signed_vote(1, 1, 1, true),
            cluster.signed_vote(2, 1, 1, false),
        ]
        .into_iter()
        .collect();
        assert!(!cluster
            .node(3)
            .valid_quorum_certificate(&refused, NodeId(1), Term(1)));
    }

    #[tokio::test]
    async fn certificate_in_append_entries_installs_the_leader() {
        let mut cluster = cluster(3, 2).await;
        let votes: HashSet<SignedVote> = [
            cluster.signed_vote(1, 1, 1, true),
            cluster.signed_vote(2, 1, 1, true),
        ]
        .into_iter()
        .collect();

        let announce = Rpc::AppendEntries(AppendEntries {
            term: Term(1),
            leader_id: NodeId(1),
            prev_log_index: LogIndex::START,
            prev_log_term: Term(0),
            entries: vec![],
            leader_commit: LogIndex::START,
            quorum_votes: votes,
        });
        let envelope = cluster.node_envelope(1, &announce);
        cluster.deliver(3, envelope).await;

        assert_eq!(cluster.node(3).term, Term(1));
        assert_eq!(cluster.node(3).current_leader, Some(NodeId(1)));
        assert_eq!(cluster.node(3).role, Role::Follower);
        assert!(!cluster.node(3).ignore_leader);
    }

    #[tokio::test]
    async fn followers_forward_commands_without_resigning() {
        let mut cluster = cluster(3, 2).await;
        cluster.elect(1).await;

        let cmd = cluster.command_envelope(1, b"SET k v");
        cluster.deliver(3, cmd).await;
        cluster.settle().await;

        // The leader accepted the forwarded command, so the client signature
        // must have survived the relay.
        assert_eq!(cluster.node(1).log.len(), 1);
        let resp = cluster.client_response();
        assert_eq!(resp.result, b"OK");
    }

    #[tokio::test]
    async fn commands_without_a_known_leader_are_dropped() {
        let mut cluster = cluster(3, 2).await;
        let cmd = cluster.command_envelope(1, b"SET k v");
        cluster.deliver(1, cmd).await;
        cluster.settle().await;

        for id in [1, 2, 3] {
            assert!(cluster.node(id).log.is_empty());
        }
        assert!(cluster.client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unverifiable_messages_never_touch_state() {
        let mut cluster = cluster(3, 2).await;
        cluster.elect(1).await;

        // Command signed by a key we do not know.
        let stranger = SigningKey::generate(&mut rand::rngs::OsRng);
        let forged_cmd = signed_command(&stranger, CLIENT, 1, b"SET k v");
        cluster.deliver(1, forged_cmd).await;
        assert!(cluster.node(1).log.is_empty());

        // AppendEntries signed by the wrong node key.
        let ae = Rpc::AppendEntries(AppendEntries {
            term: Term(1),
            leader_id: NodeId(1),
            prev_log_index: LogIndex::START,
            prev_log_term: Term(0),
            entries: vec![],
            leader_commit: LogIndex::START,
            quorum_votes: HashSet::new(),
        });
        let mis_signed = cluster.node_envelope(2, &ae);
        let before = cluster.node(3).term;
        cluster.deliver(3, mis_signed).await;
        assert_eq!(cluster.node(3).term, before);
    }

    #[tokio::test]
    async fn leaders_ignore_their_election_timer() {
        let mut cluster = cluster(3, 2).await;
        cluster.elect(1).await;
        cluster.node(1).handle_election_timeout().await.unwrap();
        assert_eq!(cluster.node(1).role, Role::Leader);
        assert_eq!(cluster.node(1).term, Term(1));
    }

    #[tokio::test]
    async fn single_node_cluster_commits_immediately() {
        let mut cluster = cluster(1, 1).await;
        cluster.node(1).handle_election_timeout().await.unwrap();
        assert_eq!(cluster.node(1).role, Role::Leader);

        let cmd = cluster.command_envelope(1, b"SET solo 1");
        cluster.deliver(1, cmd).await;
        assert_eq!(cluster.node(1).commit_index, LogIndex(0));
        assert_eq!(cluster.node(1).last_applied, LogIndex(0));
        assert_eq!(cluster.client_response().result, b"OK");
    }

    #[tokio::test]
    async fn duplicate_entries_in_the_log_apply_once() {
        let mut cluster = cluster(2, 2).await;
        cluster.elect(1).await;

        let set = cluster.command_envelope(1, b"SET x 1");
        cluster.deliver(1, set).await;
        cluster.settle().await;
        assert_eq!(cluster.client_response().result, b"OK");

        // The same signed DEL lands twice before anything commits, so both
        // copies enter the log.
        let del = cluster.command_envelope(2, b"DEL x");
        cluster.deliver(1, del.clone()).await;
        cluster.deliver(1, del).await;
        assert_eq!(cluster.node(1).log.len(), 3);
        cluster.settle().await;

        // Had the duplicate re-executed, the second DEL would have answered
        // NOT_FOUND instead of the cached OK.
        assert_eq!(cluster.client_response().result, b"OK");
        assert_eq!(cluster.client_response().result, b"OK");
        assert_eq!(cluster.node(1).last_applied, LogIndex(2));
    }
}
