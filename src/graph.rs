//! Contracts to the engine's external collaborators, and the records they
//! exchange.
//!
//! The persistent channel graph, the peer transport, the block notifier and
//! the node-identity signer all live outside this crate. The engine talks to
//! them through the traits below; the embedding daemon supplies concrete
//! implementations at construction time.

use std::net::SocketAddr;

use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

use crate::wire::{ChainHash, GossipMessage, ShortChannelId};

/// Errors reported by the channel graph store.
///
/// `Outdated` and `Ignored` are the silent kinds: the store saw the input
/// and deliberately kept its current state. The engine logs them at debug
/// and never treats them as admission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("input is outdated")]
    Outdated,

    #[error("input is ignored")]
    Ignored,

    #[error("channel is not known")]
    NotFound,

    #[error("graph has no edges")]
    NoEdges,

    #[error("store failure: {0}")]
    Io(String),
}

impl GraphError {
    /// Stale or duplicate input the store skipped on purpose.
    pub fn is_silent(&self) -> bool {
        matches!(self, GraphError::Outdated | GraphError::Ignored)
    }
}

/// Funding outpoint of a channel, used to select channels for fee updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelPoint {
    pub txid: [u8; 32],
    pub output_index: u16,
}

/// The four signatures binding a channel's node keys to its on-chain keys.
/// A channel may be publicly gossiped only once it carries one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAuthProof {
    pub node_sig_1: Signature,
    pub node_sig_2: Signature,
    pub bitcoin_sig_1: Signature,
    pub bitcoin_sig_2: Signature,
}

/// Stored per-channel record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub channel_id: ShortChannelId,
    pub chain_hash: ChainHash,
    /// Funding outpoint. Resolved by the store while validating the
    /// channel on-chain; absent on records the engine submits.
    pub channel_point: Option<ChannelPoint>,
    pub node_key_1: PublicKey,
    pub node_key_2: PublicKey,
    pub bitcoin_key_1: PublicKey,
    pub bitcoin_key_2: PublicKey,
    pub auth_proof: Option<ChannelAuthProof>,
    pub features: Vec<u8>,
}

/// Stored routing policy for one directed edge of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPolicy {
    pub signature: Signature,
    pub channel_id: ShortChannelId,
    /// Unix seconds of the policy's last signed update.
    pub last_update: u32,
    pub flags: u16,
    pub time_lock_delta: u16,
    pub htlc_minimum_msat: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
}

/// Stored per-node record. `have_announcement` is false for nodes known
/// only through a channel edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub pub_key: PublicKey,
    pub have_announcement: bool,
    /// Unix seconds of the node's last announcement.
    pub last_update: u32,
    pub alias: [u8; 32],
    pub addresses: Vec<SocketAddr>,
    pub features: Vec<u8>,
    pub auth_sig: Option<Signature>,
}

/// A new block connected to the tip of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEpoch {
    pub height: u32,
}

/// Durable channel/node/edge store with idempotent adds and version-stamped
/// updates.
///
/// Iteration hooks take `FnMut` callbacks; returning an error from a
/// callback aborts the walk and surfaces that error.
pub trait ChannelGraphSource: Send + Sync {
    fn add_node(&self, node: NodeInfo) -> Result<(), GraphError>;

    fn add_edge(&self, edge: ChannelInfo) -> Result<(), GraphError>;

    fn update_edge(&self, policy: ChannelPolicy) -> Result<(), GraphError>;

    /// Attach an authenticating proof to an existing edge.
    fn add_proof(
        &self,
        channel_id: ShortChannelId,
        proof: ChannelAuthProof,
    ) -> Result<(), GraphError>;

    /// Channel record plus the policy for each direction, if known.
    #[allow(clippy::type_complexity)]
    fn get_channel_by_id(
        &self,
        channel_id: ShortChannelId,
    ) -> Result<(ChannelInfo, Option<ChannelPolicy>, Option<ChannelPolicy>), GraphError>;

    #[allow(clippy::type_complexity)]
    fn for_each_channel(
        &self,
        f: &mut dyn FnMut(
            &ChannelInfo,
            Option<&ChannelPolicy>,
            Option<&ChannelPolicy>,
        ) -> Result<(), GraphError>,
    ) -> Result<(), GraphError>;

    fn for_each_node(
        &self,
        f: &mut dyn FnMut(&NodeInfo) -> Result<(), GraphError>,
    ) -> Result<(), GraphError>;

    /// Walk the channels whose local side is this node, with the outgoing
    /// policy for each.
    fn for_all_outgoing_channels(
        &self,
        f: &mut dyn FnMut(&ChannelInfo, &ChannelPolicy) -> Result<(), GraphError>,
    ) -> Result<(), GraphError>;

    fn current_block_height(&self) -> Result<u32, GraphError>;
}

/// Failure delivering messages to peers. Broadcast failures are logged and
/// never roll back the graph store.
#[derive(Debug, thiserror::Error)]
#[error("transport: {0}")]
pub struct TransportError(pub String);

/// Fan-out to connected peers. Assumed non-blocking per peer; a peer that
/// cannot receive is the transport's concern.
pub trait PeerTransport: Send + Sync {
    /// Send to every connected peer, optionally excluding one.
    fn broadcast(
        &self,
        exclude: Option<&PublicKey>,
        msgs: Vec<GossipMessage>,
    ) -> Result<(), TransportError>;

    /// Send to one peer identified by its public key.
    fn send_to_peer(
        &self,
        peer: &PublicKey,
        msgs: Vec<GossipMessage>,
    ) -> Result<(), TransportError>;
}

/// Signs gossip digests with the backing node's identity key.
pub trait MessageSigner: Send + Sync {
    fn sign_message(&self, digest: &[u8; 32]) -> Result<Signature, SignerError>;
}

#[derive(Debug, thiserror::Error)]
#[error("signer: {0}")]
pub struct SignerError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outdated_and_ignored_are_silent() {
        assert!(GraphError::Outdated.is_silent());
        assert!(GraphError::Ignored.is_silent());
        assert!(!GraphError::NotFound.is_silent());
        assert!(!GraphError::Io("disk".into()).is_silent());
    }
}
