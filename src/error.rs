use secp256k1::PublicKey;

use crate::graph::{GraphError, TransportError};
use crate::proofs::ProofStoreError;
use crate::wire::{ChainHash, ShortChannelId};

/// Errors surfaced to announcement senders through the envelope's result
/// channel.
#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("unexpected message type at this endpoint")]
    Malformed,

    #[error("announcement targets chain {got}, engine follows {want}")]
    WrongChain { got: ChainHash, want: ChainHash },

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("no channel found for short_chan_id={0}")]
    UnknownChannel(ShortChannelId),

    #[error("peer {peer} is not a member of channel {channel_id}")]
    PeerMismatch {
        peer: PublicKey,
        channel_id: ShortChannelId,
    },

    #[error("graph store: {0}")]
    Store(#[from] GraphError),

    #[error("waiting proofs: {0}")]
    WaitingProof(#[from] ProofStoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("message signer: {0}")]
    Signer(String),

    #[error("gossiper has shut down")]
    Shutdown,
}
