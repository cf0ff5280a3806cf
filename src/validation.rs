//! Signature validation and crafting of outgoing announcements.
//!
//! Every remote announcement is checked here before it may touch the graph
//! store. A channel announcement carries four signatures over one digest:
//! each node key and each on-chain key attests to the full set of keys. A
//! channel update is signed by whichever node key the direction flag
//! selects. Node announcements are signed by the announced key itself.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, Verification};

use crate::error::GossipError;
use crate::graph::{ChannelAuthProof, ChannelInfo, ChannelPolicy, MessageSigner};
use crate::wire::{
    message_digest, ChannelAnnouncement, ChannelUpdate, NodeAnnouncement,
};

fn verify<C: Verification>(
    secp: &Secp256k1<C>,
    data: &[u8],
    sig: &Signature,
    key: &PublicKey,
    what: &str,
) -> Result<(), GossipError> {
    let msg = Message::from_digest(message_digest(data));
    secp.verify_ecdsa(&msg, sig, key)
        .map_err(|e| GossipError::InvalidSignature(format!("{what}: {e}")))
}

/// Verify a node announcement against the key it announces.
pub fn validate_node_ann<C: Verification>(
    secp: &Secp256k1<C>,
    ann: &NodeAnnouncement,
) -> Result<(), GossipError> {
    verify(secp, &ann.data_to_sign(), &ann.signature, &ann.node_id, "node announcement")
}

/// Verify all four signatures of a channel announcement.
pub fn validate_channel_ann<C: Verification>(
    secp: &Secp256k1<C>,
    ann: &ChannelAnnouncement,
) -> Result<(), GossipError> {
    let data = ann.data_to_sign();
    verify(secp, &data, &ann.node_sig_1, &ann.node_id_1, "node sig 1")?;
    verify(secp, &data, &ann.node_sig_2, &ann.node_id_2, "node sig 2")?;
    verify(secp, &data, &ann.bitcoin_sig_1, &ann.bitcoin_key_1, "bitcoin sig 1")?;
    verify(secp, &data, &ann.bitcoin_sig_2, &ann.bitcoin_key_2, "bitcoin sig 2")?;
    Ok(())
}

/// Verify a channel update against the node key its direction flag selects.
pub fn validate_channel_update<C: Verification>(
    secp: &Secp256k1<C>,
    key: &PublicKey,
    upd: &ChannelUpdate,
) -> Result<(), GossipError> {
    verify(secp, &upd.data_to_sign(), &upd.signature, key, "channel update")
}

/// Sign announcement body bytes with the node identity signer.
pub fn sign_announcement(
    signer: &dyn MessageSigner,
    data: &[u8],
) -> Result<Signature, GossipError> {
    signer
        .sign_message(&message_digest(data))
        .map_err(|e| GossipError::Signer(e.to_string()))
}

/// Reconstruct the canonical channel announcement (and the update message
/// for each direction that has a policy) from stored graph records.
pub fn create_chan_announcement(
    proof: &ChannelAuthProof,
    info: &ChannelInfo,
    e1: Option<&ChannelPolicy>,
    e2: Option<&ChannelPolicy>,
) -> (ChannelAnnouncement, Option<ChannelUpdate>, Option<ChannelUpdate>) {
    let ann = ChannelAnnouncement {
        node_sig_1: proof.node_sig_1,
        node_sig_2: proof.node_sig_2,
        bitcoin_sig_1: proof.bitcoin_sig_1,
        bitcoin_sig_2: proof.bitcoin_sig_2,
        features: info.features.clone(),
        chain_hash: info.chain_hash,
        short_channel_id: info.channel_id,
        node_id_1: info.node_key_1,
        node_id_2: info.node_key_2,
        bitcoin_key_1: info.bitcoin_key_1,
        bitcoin_key_2: info.bitcoin_key_2,
    };

    let to_update = |policy: &ChannelPolicy| ChannelUpdate {
        signature: policy.signature,
        chain_hash: info.chain_hash,
        short_channel_id: info.channel_id,
        timestamp: policy.last_update,
        flags: policy.flags,
        time_lock_delta: policy.time_lock_delta,
        htlc_minimum_msat: policy.htlc_minimum_msat,
        fee_base_msat: policy.fee_base_msat,
        fee_proportional_millionths: policy.fee_proportional_millionths,
    };

    (ann, e1.map(to_update), e2.map(to_update))
}
