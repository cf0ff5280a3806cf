//! Durable storage for half-assembled channel proofs.
//!
//! A channel proof is completed by two `AnnounceSignatures` halves, one per
//! side. Whichever half arrives first is persisted here, keyed by channel
//! id plus origin side, until the opposite half shows up. Records survive
//! restarts: the backend is the same durable store the channel graph runs
//! on, supplied by the daemon.
//!
//! Each record carries the public key of the peer that submitted it. A
//! pending half can only be replaced by the same submitter — without this,
//! a remote peer could overwrite a legitimate pending half for a channel we
//! have not seen yet and stall its announcement.
//!
//! The key scheme (8 big-endian channel-id bytes plus one origin byte) and
//! the bincode record encoding are stable across versions; tests pin both.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::wire::{AnnounceSignatures, ShortChannelId};

/// Storage key of a waiting proof: channel id plus origin side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitingProofKey(pub [u8; 9]);

impl WaitingProofKey {
    pub fn new(channel_id: ShortChannelId, is_remote: bool) -> Self {
        let mut key = [0u8; 9];
        key[..8].copy_from_slice(&channel_id.to_u64().to_be_bytes());
        key[8] = u8::from(is_remote);
        WaitingProofKey(key)
    }
}

impl fmt::Display for WaitingProofKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// One persisted half of a channel proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingProof {
    pub channel_id: ShortChannelId,
    pub is_remote: bool,
    /// Who submitted this half. Replacement by a different peer is refused.
    pub peer: PublicKey,
    pub node_signature: Signature,
    pub bitcoin_signature: Signature,
}

impl WaitingProof {
    pub fn new(is_remote: bool, peer: PublicKey, msg: &AnnounceSignatures) -> Self {
        Self {
            channel_id: msg.short_channel_id,
            is_remote,
            peer,
            node_signature: msg.node_signature,
            bitcoin_signature: msg.bitcoin_signature,
        }
    }

    pub fn key(&self) -> WaitingProofKey {
        WaitingProofKey::new(self.channel_id, self.is_remote)
    }

    /// Key of the other half: same channel, inverted origin.
    pub fn opposite_key(&self) -> WaitingProofKey {
        WaitingProofKey::new(self.channel_id, !self.is_remote)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("proof backend: {0}")]
pub struct BackendError(pub String);

/// Minimal durable KV surface the waiting-proof store runs on.
pub trait ProofBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError>;
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), BackendError>;
    fn remove(&self, key: &[u8]) -> Result<(), BackendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProofStoreError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("stored proof record is corrupt: {0}")]
    Corrupt(String),

    #[error("pending half for channel {channel_id} was submitted by a different peer")]
    OriginMismatch { channel_id: ShortChannelId },
}

/// Waiting-proof store: bincode records over a durable KV backend.
pub struct WaitingProofStore {
    backend: Arc<dyn ProofBackend>,
}

impl WaitingProofStore {
    pub fn new(backend: Arc<dyn ProofBackend>) -> Self {
        Self { backend }
    }

    /// Persist a half-proof. At most one record exists per (channel,
    /// origin); an existing record is only replaced when the submitter
    /// matches.
    pub fn add(&self, proof: &WaitingProof) -> Result<(), ProofStoreError> {
        let key = proof.key();
        if let Some(existing) = self.get(&key)? {
            if existing.peer != proof.peer {
                return Err(ProofStoreError::OriginMismatch {
                    channel_id: proof.channel_id,
                });
            }
        }

        let value = bincode::serialize(proof)
            .map_err(|e| ProofStoreError::Corrupt(e.to_string()))?;
        self.backend.put(&key.0, value)?;
        Ok(())
    }

    pub fn get(&self, key: &WaitingProofKey) -> Result<Option<WaitingProof>, ProofStoreError> {
        let Some(raw) = self.backend.get(&key.0)? else {
            return Ok(None);
        };
        let proof = bincode::deserialize(&raw)
            .map_err(|e| ProofStoreError::Corrupt(e.to_string()))?;
        Ok(Some(proof))
    }

    pub fn remove(&self, key: &WaitingProofKey) -> Result<(), ProofStoreError> {
        self.backend.remove(&key.0)?;
        Ok(())
    }
}

/// In-process backend. Handy for tests and for nodes that accept losing
/// pending halves on restart.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProofBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.entries.lock().expect("backend lock").get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), BackendError> {
        self.entries
            .lock()
            .expect("backend lock")
            .insert(key.to_vec(), value);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), BackendError> {
        self.entries.lock().expect("backend lock").remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Message, Secp256k1, SecretKey};

    fn peer(b: u8) -> PublicKey {
        let secp = Secp256k1::new();
        PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[b; 32]).unwrap())
    }

    fn sig(b: u8) -> Signature {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[b; 32]).unwrap();
        secp.sign_ecdsa(&Message::from_digest([b; 32]), &sk)
    }

    fn half(scid: ShortChannelId, is_remote: bool, peer_byte: u8) -> WaitingProof {
        WaitingProof::new(
            is_remote,
            peer(peer_byte),
            &AnnounceSignatures {
                short_channel_id: scid,
                node_signature: sig(peer_byte),
                bitcoin_signature: sig(peer_byte.wrapping_add(1)),
            },
        )
    }

    fn store() -> WaitingProofStore {
        WaitingProofStore::new(Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn key_scheme_is_pinned() {
        // 0x0000640000010002: height 100 in the top 24 bits, tx index 1,
        // output 2 — followed by the origin byte.
        let scid = ShortChannelId::new(100, 1, 2);
        assert_eq!(
            WaitingProofKey::new(scid, false).0,
            [0x00, 0x00, 0x64, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00]
        );
        assert_eq!(
            WaitingProofKey::new(scid, true).0,
            [0x00, 0x00, 0x64, 0x00, 0x00, 0x01, 0x00, 0x02, 0x01]
        );
    }

    #[test]
    fn opposite_key_flips_origin_only() {
        let proof = half(ShortChannelId::new(100, 1, 2), true, 7);
        let mut expected = proof.key().0;
        expected[8] ^= 1;
        assert_eq!(proof.opposite_key().0, expected);
    }

    #[test]
    fn add_then_get_round_trips() {
        let store = store();
        let proof = half(ShortChannelId::new(100, 1, 2), true, 7);
        store.add(&proof).unwrap();
        assert_eq!(store.get(&proof.key()).unwrap(), Some(proof.clone()));
        // The opposite slot stays empty.
        assert_eq!(store.get(&proof.opposite_key()).unwrap(), None);
    }

    #[test]
    fn replacement_by_same_peer_is_allowed() {
        let store = store();
        let scid = ShortChannelId::new(100, 1, 2);
        store.add(&half(scid, true, 7)).unwrap();

        let mut updated = half(scid, true, 7);
        updated.node_signature = sig(42);
        store.add(&updated).unwrap();
        assert_eq!(store.get(&updated.key()).unwrap(), Some(updated));
    }

    #[test]
    fn replacement_by_other_peer_is_refused() {
        let store = store();
        let scid = ShortChannelId::new(100, 1, 2);
        let original = half(scid, true, 7);
        store.add(&original).unwrap();

        let attacker = half(scid, true, 8);
        assert!(matches!(
            store.add(&attacker),
            Err(ProofStoreError::OriginMismatch { .. })
        ));
        // The original record is untouched.
        assert_eq!(store.get(&original.key()).unwrap(), Some(original));
    }

    #[test]
    fn remove_deletes_the_record() {
        let store = store();
        let proof = half(ShortChannelId::new(100, 1, 2), false, 7);
        store.add(&proof).unwrap();
        store.remove(&proof.key()).unwrap();
        assert_eq!(store.get(&proof.key()).unwrap(), None);
    }
}
