//! Bincode codecs for the RPC sum type plus the canonical byte strings that
//! signatures are computed over. All replicas must agree on these encodings.

use crate::consensus::types::{ClientId, Envelope, NodeId, RequestId, RequestVoteResponse, Rpc};
use crate::error::Result;

pub fn encode_rpc(rpc: &Rpc) -> Result<Vec<u8>> {
    Ok(bincode::serialize(rpc)?)
}

pub fn decode_rpc(bytes: &[u8]) -> Result<Rpc> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(bincode::serialize(envelope)?)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    Ok(bincode::deserialize(bytes)?)
}

/// Bytes a client signs when issuing a command. The signature doubles as the
/// replay-dedup key, so it must not cover anything a forwarder could change.
pub fn command_signing_bytes(
    entry: &[u8],
    client_id: ClientId,
    request_id: RequestId,
) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&(client_id, request_id, entry))?)
}

/// Bytes a client signs when asking a node to stop following a leader.
pub fn revolution_signing_bytes(client_id: ClientId, leader_id: NodeId) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&(client_id, leader_id))?)
}

/// Bytes a voter signs for a vote response. Certificate validators re-derive
/// these from the vote fields, so the encoding is the full RPC frame.
pub fn vote_signing_bytes(vote: &RequestVoteResponse) -> Result<Vec<u8>> {
    encode_rpc(&Rpc::RequestVoteResponse(vote.clone()))
}

/// Bytes a responder signs as the proof attached to a command response.
pub fn proof_signing_bytes(request_id: RequestId, result: &[u8]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&(request_id, result))?)
}
