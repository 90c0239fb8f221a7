//! Message authentication. Every inbound RPC is checked against a known node
//! or client key before it can touch consensus state; failures are silent
//! drops at the call site.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::collections::HashMap;

use crate::consensus::types::{ClientId, NodeId, Sig};
use crate::error::{ConsensusError, Result};

pub struct Keyring {
    signing_key: SigningKey,
    node_keys: HashMap<NodeId, VerifyingKey>,
    client_keys: HashMap<ClientId, VerifyingKey>,
}

impl Keyring {
    pub fn new(
        signing_key: SigningKey,
        node_keys: HashMap<NodeId, VerifyingKey>,
        client_keys: HashMap<ClientId, VerifyingKey>,
    ) -> Self {
        Self {
            signing_key,
            node_keys,
            client_keys,
        }
    }

    pub fn sign(&self, payload: &[u8]) -> Sig {
        Sig(self.signing_key.sign(payload).to_bytes().to_vec())
    }

    /// Verify with a replica's key. Unknown ids fail closed.
    pub fn verify_node(&self, node: NodeId, payload: &[u8], sig: &Sig) -> bool {
        match self.node_keys.get(&node) {
            Some(key) => verify_with(key, payload, sig),
            None => false,
        }
    }

    /// Verify with a client's key. Unknown ids fail closed.
    pub fn verify_client(&self, client: ClientId, payload: &[u8], sig: &Sig) -> bool {
        match self.client_keys.get(&client) {
            Some(key) => verify_with(key, payload, sig),
            None => false,
        }
    }
}

fn verify_with(key: &VerifyingKey, payload: &[u8], sig: &Sig) -> bool {
    let Ok(bytes) = <[u8; 64]>::try_from(sig.0.as_slice()) else {
        return false;
    };
    key.verify(payload, &Signature::from_bytes(&bytes)).is_ok()
}

/// Fresh keypair as `(private_b64, public_b64)` for provisioning configs.
pub fn generate_keypair() -> (String, String) {
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    (
        BASE64.encode(signing_key.to_bytes()),
        BASE64.encode(signing_key.verifying_key().to_bytes()),
    )
}

pub fn decode_signing_key(b64: &str) -> Result<SigningKey> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| ConsensusError::KeyMaterial(format!("private key base64: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ConsensusError::KeyMaterial("private key must be 32 bytes".into()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

pub fn decode_verifying_key(b64: &str) -> Result<VerifyingKey> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| ConsensusError::KeyMaterial(format!("public key base64: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ConsensusError::KeyMaterial("public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| ConsensusError::KeyMaterial(format!("public key: {e}")))
}
