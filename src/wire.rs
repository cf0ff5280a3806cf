//! Gossip wire messages and their canonical signed-data encoding.
//!
//! Four message types travel through the engine: channel announcements,
//! channel updates, node announcements, and the half-proof exchange
//! (`AnnounceSignatures`). Signatures commit to a double-SHA256 digest of
//! the message body serialized in the fixed big-endian layout of BOLT #7;
//! `data_to_sign()` on each type produces exactly those bytes, signatures
//! excluded.

use std::fmt;
use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Genesis-block hash identifying which blockchain a message refers to.
///
/// Messages carrying a different chain tag than the engine's are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainHash(pub [u8; 32]);

impl fmt::Display for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Compact 64-bit channel locator: (block height, tx index, output index).
///
/// The packing is `height << 40 | tx_index << 16 | output_index`, with the
/// height in the topmost 24 bits. Ordering is strict: `block_height`
/// dominates, which is what premature gating relies on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ShortChannelId {
    pub block_height: u32,
    pub tx_index: u32,
    pub output_index: u16,
}

impl ShortChannelId {
    pub fn new(block_height: u32, tx_index: u32, output_index: u16) -> Self {
        Self {
            block_height,
            tx_index,
            output_index,
        }
    }

    /// Unpack from the on-wire 64-bit form.
    pub fn from_u64(v: u64) -> Self {
        Self {
            block_height: ((v >> 40) & 0xff_ffff) as u32,
            tx_index: ((v >> 16) & 0xff_ffff) as u32,
            output_index: (v & 0xffff) as u16,
        }
    }

    /// Pack into the on-wire 64-bit form.
    pub fn to_u64(self) -> u64 {
        (u64::from(self.block_height) << 40)
            | (u64::from(self.tx_index) << 16)
            | u64::from(self.output_index)
    }
}

impl fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.block_height, self.tx_index, self.output_index
        )
    }
}

/// Canonical map key for a node: the 33-byte compressed public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vertex(pub [u8; 33]);

impl Vertex {
    pub fn from_pub_key(key: &PublicKey) -> Self {
        Vertex(key.serialize())
    }
}

impl fmt::Debug for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vertex({})", hex::encode(&self.0[..8]))
    }
}

fn put_features(buf: &mut BytesMut, features: &[u8]) {
    buf.put_u16(features.len() as u16);
    buf.put_slice(features);
}

fn put_address(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(a) => {
            buf.put_u8(1);
            buf.put_slice(&a.ip().octets());
            buf.put_u16(a.port());
        }
        SocketAddr::V6(a) => {
            buf.put_u8(2);
            buf.put_slice(&a.ip().octets());
            buf.put_u16(a.port());
        }
    }
}

/// Advertises the existence of a channel: two node keys bound to two
/// on-chain keys by four signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAnnouncement {
    pub node_sig_1: Signature,
    pub node_sig_2: Signature,
    pub bitcoin_sig_1: Signature,
    pub bitcoin_sig_2: Signature,
    pub features: Vec<u8>,
    pub chain_hash: ChainHash,
    pub short_channel_id: ShortChannelId,
    pub node_id_1: PublicKey,
    pub node_id_2: PublicKey,
    pub bitcoin_key_1: PublicKey,
    pub bitcoin_key_2: PublicKey,
}

impl ChannelAnnouncement {
    /// The bytes every one of the four signatures commits to.
    pub fn data_to_sign(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(2 + self.features.len() + 32 + 8 + 33 * 4);
        put_features(&mut buf, &self.features);
        buf.put_slice(&self.chain_hash.0);
        buf.put_u64(self.short_channel_id.to_u64());
        buf.put_slice(&self.node_id_1.serialize());
        buf.put_slice(&self.node_id_2.serialize());
        buf.put_slice(&self.bitcoin_key_1.serialize());
        buf.put_slice(&self.bitcoin_key_2.serialize());
        buf.to_vec()
    }
}

/// Directional routing policy for one side of a known channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub signature: Signature,
    pub chain_hash: ChainHash,
    pub short_channel_id: ShortChannelId,
    pub timestamp: u32,
    pub flags: u16,
    pub time_lock_delta: u16,
    pub htlc_minimum_msat: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
}

impl ChannelUpdate {
    /// Which directed edge is being updated: 0 = node 1's side, 1 = node 2's.
    pub fn direction(&self) -> u16 {
        self.flags & 1
    }

    pub fn data_to_sign(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(32 + 8 + 4 + 2 + 2 + 8 + 4 + 4);
        buf.put_slice(&self.chain_hash.0);
        buf.put_u64(self.short_channel_id.to_u64());
        buf.put_u32(self.timestamp);
        buf.put_u16(self.flags);
        buf.put_u16(self.time_lock_delta);
        buf.put_u64(self.htlc_minimum_msat);
        buf.put_u32(self.fee_base_msat);
        buf.put_u32(self.fee_proportional_millionths);
        buf.to_vec()
    }
}

/// Presents or refreshes a node's public identity record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAnnouncement {
    pub signature: Signature,
    pub features: Vec<u8>,
    pub timestamp: u32,
    pub node_id: PublicKey,
    pub alias: [u8; 32],
    pub addresses: Vec<SocketAddr>,
}

impl NodeAnnouncement {
    pub fn data_to_sign(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(2 + self.features.len() + 4 + 33 + 32);
        put_features(&mut buf, &self.features);
        buf.put_u32(self.timestamp);
        buf.put_slice(&self.node_id.serialize());
        buf.put_slice(&self.alias);
        buf.put_u16(self.addresses.len() as u16);
        for addr in &self.addresses {
            put_address(&mut buf, addr);
        }
        buf.to_vec()
    }
}

/// One half of a channel proof: the sender's signatures over the canonical
/// channel announcement, offered so the counterparty can assemble the full
/// four-signature proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceSignatures {
    pub short_channel_id: ShortChannelId,
    pub node_signature: Signature,
    pub bitcoin_signature: Signature,
}

/// The four message variants the engine admits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    ChannelAnnouncement(ChannelAnnouncement),
    ChannelUpdate(ChannelUpdate),
    NodeAnnouncement(NodeAnnouncement),
    AnnounceSignatures(AnnounceSignatures),
}

impl GossipMessage {
    /// Short message name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            GossipMessage::ChannelAnnouncement(_) => "channel_announcement",
            GossipMessage::ChannelUpdate(_) => "channel_update",
            GossipMessage::NodeAnnouncement(_) => "node_announcement",
            GossipMessage::AnnounceSignatures(_) => "announce_signatures",
        }
    }
}

/// Double-SHA256 digest that gossip signatures commit to.
pub fn message_digest(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scid_round_trip() {
        let id = ShortChannelId::new(683_000, 1024, 3);
        assert_eq!(ShortChannelId::from_u64(id.to_u64()), id);
    }

    #[test]
    fn scid_packing_layout() {
        let id = ShortChannelId::new(1, 2, 3);
        assert_eq!(id.to_u64(), (1u64 << 40) | (2u64 << 16) | 3);
    }

    #[test]
    fn scid_ordering_height_dominates() {
        let low = ShortChannelId::new(100, 9999, 9999);
        let high = ShortChannelId::new(101, 0, 0);
        assert!(low < high);
    }

    #[test]
    fn scid_display() {
        assert_eq!(ShortChannelId::new(683_000, 5, 1).to_string(), "683000:5:1");
    }

    #[test]
    fn digest_is_double_sha256() {
        // sha256d of the empty string, a fixed reference vector.
        assert_eq!(
            hex::encode(message_digest(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn digest_differs_by_input() {
        assert_ne!(message_digest(b"a"), message_digest(b"b"));
    }

    #[test]
    fn update_direction_is_low_bit() {
        let secp = secp256k1::Secp256k1::new();
        let sk = secp256k1::SecretKey::from_slice(&[7u8; 32]).unwrap();
        let sig = secp.sign_ecdsa(
            &secp256k1::Message::from_digest([0u8; 32]),
            &sk,
        );
        let mut upd = ChannelUpdate {
            signature: sig,
            chain_hash: ChainHash([0u8; 32]),
            short_channel_id: ShortChannelId::new(1, 1, 1),
            timestamp: 0,
            flags: 0,
            time_lock_delta: 144,
            htlc_minimum_msat: 1000,
            fee_base_msat: 1000,
            fee_proportional_millionths: 1,
        };
        assert_eq!(upd.direction(), 0);
        upd.flags = 1;
        assert_eq!(upd.direction(), 1);
        // Higher bits do not leak into the direction.
        upd.flags = 0x0100;
        assert_eq!(upd.direction(), 0);
    }

    #[test]
    fn update_signed_data_covers_fee_fields() {
        let secp = secp256k1::Secp256k1::new();
        let sk = secp256k1::SecretKey::from_slice(&[7u8; 32]).unwrap();
        let sig = secp.sign_ecdsa(&secp256k1::Message::from_digest([0u8; 32]), &sk);
        let mut upd = ChannelUpdate {
            signature: sig,
            chain_hash: ChainHash([0u8; 32]),
            short_channel_id: ShortChannelId::new(1, 1, 1),
            timestamp: 100,
            flags: 0,
            time_lock_delta: 144,
            htlc_minimum_msat: 1000,
            fee_base_msat: 1000,
            fee_proportional_millionths: 1,
        };
        let before = upd.data_to_sign();
        upd.fee_base_msat = 2000;
        assert_ne!(before, upd.data_to_sign());
    }
}
