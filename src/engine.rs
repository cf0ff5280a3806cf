//! The authenticated gossip engine.
//!
//! One supervisor task drives everything: it accepts announcement envelopes
//! from peer plumbing, dispatches them to validation workers ordered by the
//! barrier, processes proof-exchange messages serially, replays premature
//! announcements as the chain advances, flushes the deduplicated batch on
//! every trickle tick, and re-signs stale outgoing edges on the retransmit
//! timer. All outgoing announcements are properly signed; all incoming ones
//! are verified before they may touch the graph store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use secp256k1::{All, PublicKey, Secp256k1};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::barrier::ValidationBarrier;
use crate::batch::DedupedAnnouncements;
use crate::error::GossipError;
use crate::graph::{
    BlockEpoch, ChannelAuthProof, ChannelGraphSource, ChannelInfo, ChannelPoint,
    ChannelPolicy, GraphError, MessageSigner, NodeInfo, PeerTransport,
};
use crate::premature::PrematureBuffer;
use crate::proofs::{ProofBackend, WaitingProof, WaitingProofStore};
use crate::validation::{
    create_chan_announcement, sign_announcement, validate_channel_ann,
    validate_channel_update, validate_node_ann,
};
use crate::wire::{
    AnnounceSignatures, ChainHash, ChannelAnnouncement, ChannelUpdate, GossipMessage,
    NodeAnnouncement, ShortChannelId,
};

/// How old an outgoing policy may grow before the retransmit loop re-signs
/// and rebroadcasts it.
const BROADCAST_INTERVAL_SECS: i64 = 24 * 60 * 60;

/// Fee parameters applied to outgoing edges by `propagate_fee_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchema {
    pub base_fee_msat: u32,
    /// Proportional fee, in millionths.
    pub fee_rate: u32,
}

/// Configuration for the engine. Every collaborator must be supplied; the
/// engine performs no discovery of its own.
pub struct Config {
    /// Chain tag the engine follows. Announcements for other chains are
    /// dropped.
    pub chain_hash: ChainHash,

    /// The persistent channel graph.
    pub router: Arc<dyn ChannelGraphSource>,

    /// Fan-out to connected peers.
    pub transport: Arc<dyn PeerTransport>,

    /// Signer backed by the node's identity key, used for outgoing channel
    /// updates.
    pub signer: Arc<dyn MessageSigner>,

    /// Durable backend for half-assembled channel proofs. Shared with the
    /// graph store's backend by the daemon.
    pub proof_backend: Arc<dyn ProofBackend>,

    /// New-block epochs, registered with the chain notifier by the daemon.
    pub block_epochs: mpsc::Receiver<BlockEpoch>,

    /// Confirmations required on top of a channel's funding height before
    /// proof halves are exchanged.
    pub proof_mature_delta: u32,

    /// Period of the batched re-broadcast of freshly accepted messages.
    pub trickle_delay: Duration,

    /// Period of the stale outgoing-channel sweep.
    pub retransmit_delay: Duration,
}

/// An announcement envelope: the message, who sent it, where it came from,
/// and the channel its one outcome is reported on.
struct NetworkMessage {
    peer: PublicKey,
    msg: GossipMessage,
    is_remote: bool,
    result: oneshot::Sender<Result<(), GossipError>>,
}

struct FeeUpdateRequest {
    schema: FeeSchema,
    target_chans: Vec<ChannelPoint>,
    result: oneshot::Sender<Result<(), GossipError>>,
}

/// Receivers handed to the supervisor when it spawns.
struct Startup {
    msg_rx: mpsc::Receiver<NetworkMessage>,
    fee_rx: mpsc::Receiver<FeeUpdateRequest>,
    block_epochs: mpsc::Receiver<BlockEpoch>,
    trickle_delay: Duration,
    retransmit_delay: Duration,
}

/// State shared between the supervisor and its validation workers.
struct GossiperState {
    chain_hash: ChainHash,
    router: Arc<dyn ChannelGraphSource>,
    transport: Arc<dyn PeerTransport>,
    signer: Arc<dyn MessageSigner>,
    secp: Secp256k1<All>,
    self_key: PublicKey,
    proof_mature_delta: u32,
    best_height: AtomicU32,
    premature: PrematureBuffer<NetworkMessage>,
    waiting_proofs: WaitingProofStore,
    batch: DedupedAnnouncements,
    quit: CancellationToken,
}

/// The gossip engine handle. Cheap to share behind an `Arc`; all mutation
/// happens on the supervisor task it spawns.
pub struct AuthenticatedGossiper {
    state: Arc<GossiperState>,
    msg_tx: mpsc::Sender<NetworkMessage>,
    fee_tx: mpsc::Sender<FeeUpdateRequest>,
    started: AtomicBool,
    stopped: AtomicBool,
    startup: Mutex<Option<Startup>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

fn validation_capacity() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        * 10
}

impl AuthenticatedGossiper {
    /// Build the engine. `self_key` is the identity key of the backing
    /// node; outgoing updates are signed under it.
    pub fn new(cfg: Config, self_key: PublicKey) -> Self {
        // Rendezvous-style ingress: producers block until the supervisor
        // accepts the envelope.
        let (msg_tx, msg_rx) = mpsc::channel(1);
        let (fee_tx, fee_rx) = mpsc::channel(1);

        let state = Arc::new(GossiperState {
            chain_hash: cfg.chain_hash,
            router: cfg.router,
            transport: cfg.transport,
            signer: cfg.signer,
            secp: Secp256k1::new(),
            self_key,
            proof_mature_delta: cfg.proof_mature_delta,
            best_height: AtomicU32::new(0),
            premature: PrematureBuffer::new(),
            waiting_proofs: WaitingProofStore::new(cfg.proof_backend),
            batch: DedupedAnnouncements::new(),
            quit: CancellationToken::new(),
        });

        Self {
            state,
            msg_tx,
            fee_tx,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            startup: Mutex::new(Some(Startup {
                msg_rx,
                fee_rx,
                block_epochs: cfg.block_epochs,
                trickle_delay: cfg.trickle_delay,
                retransmit_delay: cfg.retransmit_delay,
            })),
            supervisor: Mutex::new(None),
        }
    }

    /// Spawn the supervisor. Idempotent; the second and later calls are
    /// no-ops.
    pub fn start(&self) -> Result<(), GossipError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        info!("authenticated gossiper starting");

        let startup = self
            .startup
            .lock()
            .expect("startup lock")
            .take()
            .expect("startup consumed before first start");

        let height = self.state.router.current_block_height()?;
        self.state.best_height.store(height, Ordering::Release);

        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(network_handler(state, startup));
        *self.supervisor.lock().expect("supervisor lock") = Some(handle);

        Ok(())
    }

    /// Signal shutdown and wait for the supervisor and every in-flight
    /// validation worker to drain. Idempotent.
    pub async fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!("authenticated gossiper stopping");
        self.state.quit.cancel();

        let handle = self.supervisor.lock().expect("supervisor lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Hand a remote peer's announcement to the engine. The returned
    /// receiver fires exactly once, when the message is finally admitted or
    /// rejected; premature messages keep it open until the chain catches
    /// up.
    pub async fn process_remote_announcement(
        &self,
        msg: GossipMessage,
        peer: PublicKey,
    ) -> oneshot::Receiver<Result<(), GossipError>> {
        self.enqueue(msg, peer, true).await
    }

    /// Hand a locally originated announcement to the engine. Local messages
    /// skip signature verification; the channel proof is assembled later
    /// through the signature exchange.
    pub async fn process_local_announcement(
        &self,
        msg: GossipMessage,
        peer: PublicKey,
    ) -> oneshot::Receiver<Result<(), GossipError>> {
        self.enqueue(msg, peer, false).await
    }

    async fn enqueue(
        &self,
        msg: GossipMessage,
        peer: PublicKey,
        is_remote: bool,
    ) -> oneshot::Receiver<Result<(), GossipError>> {
        let (tx, rx) = oneshot::channel();

        if self.state.quit.is_cancelled() {
            let _ = tx.send(Err(GossipError::Shutdown));
            return rx;
        }

        let env = NetworkMessage {
            peer,
            msg,
            is_remote,
            result: tx,
        };
        if let Err(mpsc::error::SendError(env)) = self.msg_tx.send(env).await {
            // The supervisor has exited and closed the ingress.
            let _ = env.result.send(Err(GossipError::Shutdown));
        }
        rx
    }

    /// Apply a fee schema to the outgoing channels matching `target_chans`
    /// (all outgoing channels when empty) and queue freshly signed updates
    /// for the next trickle tick. Resolves once the updates are committed.
    pub async fn propagate_fee_update(
        &self,
        schema: FeeSchema,
        target_chans: Vec<ChannelPoint>,
    ) -> Result<(), GossipError> {
        if self.state.quit.is_cancelled() {
            return Err(GossipError::Shutdown);
        }

        let (tx, rx) = oneshot::channel();
        let req = FeeUpdateRequest {
            schema,
            target_chans,
            result: tx,
        };
        if self.fee_tx.send(req).await.is_err() {
            return Err(GossipError::Shutdown);
        }
        rx.await.map_err(|_| GossipError::Shutdown)?
    }

    /// Stream the full known graph to a newly connected peer: every proven
    /// channel with its direction updates, then every announced node, in a
    /// single send.
    pub fn synchronize_node(&self, peer: &PublicKey) -> Result<(), GossipError> {
        self.state.synchronize_node(peer)
    }
}

/// The supervisor loop.
async fn network_handler(state: Arc<GossiperState>, startup: Startup) {
    let Startup {
        mut msg_rx,
        mut fee_rx,
        mut block_epochs,
        trickle_delay,
        retransmit_delay,
    } = startup;

    let workers = TaskTracker::new();
    let barrier = Arc::new(ValidationBarrier::new(
        validation_capacity(),
        state.quit.clone(),
    ));

    let mut trickle = tokio::time::interval(trickle_delay);
    trickle.set_missed_tick_behavior(MissedTickBehavior::Delay);
    trickle.tick().await;

    let mut retransmit = tokio::time::interval(retransmit_delay);
    retransmit.set_missed_tick_behavior(MissedTickBehavior::Delay);
    retransmit.tick().await;

    // Catch up on anything that went stale while we were down.
    if let Err(e) = state.retransmit_stale_channels() {
        error!(error = %e, "unable to rebroadcast stale channels");
    }

    loop {
        tokio::select! {
            Some(req) = fee_rx.recv() => {
                let FeeUpdateRequest { schema, target_chans, result } = req;
                match state.process_fee_chan_update(schema, &target_chans) {
                    Ok(updates) => {
                        state.batch.add_msgs(updates);
                        let _ = result.send(Ok(()));
                    }
                    Err(e) => {
                        error!(error = %e, "unable to craft fee updates");
                        let _ = result.send(Err(e));
                    }
                }
            }

            Some(env) = msg_rx.recv() => {
                // Proof halves mutate waiting-proof state and must stay
                // totally ordered: they are handled right here, serially.
                if matches!(env.msg, GossipMessage::AnnounceSignatures(_)) {
                    if let Some(msgs) = state.process_network_announcement(env) {
                        state.batch.add_msgs(msgs);
                    }
                    continue;
                }

                let permit = match barrier.init_job_dependencies(&env.msg).await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let _ = env.result.send(Err(e));
                        continue;
                    }
                };

                let state = Arc::clone(&state);
                let barrier = Arc::clone(&barrier);
                workers.spawn(async move {
                    let _permit = permit;
                    let msg = env.msg.clone();

                    if let Err(e) = barrier.wait_for_dependants(&msg).await {
                        let _ = env.result.send(Err(e));
                        barrier.signal_dependants(&msg);
                        return;
                    }

                    let emitted = state.process_network_announcement(env);

                    // Wake dependants whether or not we admitted anything.
                    barrier.signal_dependants(&msg);

                    if let Some(msgs) = emitted {
                        state.batch.add_msgs(msgs);
                    }
                });
            }

            epoch = block_epochs.recv() => {
                let Some(epoch) = epoch else {
                    debug!("block epoch stream ended, supervisor exiting");
                    break;
                };

                state.best_height.store(epoch.height, Ordering::Release);

                let pending = state.premature.drain(epoch.height);
                if !pending.is_empty() {
                    info!(
                        count = pending.len(),
                        height = epoch.height,
                        "re-processing premature announcements"
                    );
                }
                for env in pending {
                    if let Some(msgs) = state.process_network_announcement(env) {
                        state.batch.add_msgs(msgs);
                    }
                }
            }

            _ = trickle.tick() => {
                let batch = state.batch.emit();
                if batch.is_empty() {
                    continue;
                }

                info!(count = batch.len(), "broadcasting announcement batch");
                if let Err(e) = state.transport.broadcast(None, batch) {
                    // The batch is gone, but the graph store stays
                    // authoritative; the retransmit loop re-covers
                    // outgoing edges.
                    error!(error = %e, "unable to send announcement batch");
                }
            }

            _ = retransmit.tick() => {
                if let Err(e) = state.retransmit_stale_channels() {
                    error!(error = %e, "unable to rebroadcast stale channels");
                }
            }

            _ = state.quit.cancelled() => break,
        }
    }

    // Refuse further work and fail anything already queued, then wait for
    // in-flight workers to finish.
    state.quit.cancel();
    msg_rx.close();
    while let Ok(env) = msg_rx.try_recv() {
        let _ = env.result.send(Err(GossipError::Shutdown));
    }
    fee_rx.close();
    while let Ok(req) = fee_rx.try_recv() {
        let _ = req.result.send(Err(GossipError::Shutdown));
    }
    workers.close();
    workers.wait().await;
}

impl GossiperState {
    fn best_height(&self) -> u32 {
        self.best_height.load(Ordering::Acquire)
    }

    /// A message is premature when the block it claims to be anchored in
    /// (plus `delta` confirmations) is beyond the chain tip as we know it.
    fn is_premature(&self, channel_id: ShortChannelId, delta: u32) -> bool {
        channel_id.block_height + delta > self.best_height()
    }

    /// Run one envelope through the pipeline. Returns the messages to add
    /// to the broadcast batch, if the announcement was admitted with
    /// something worth gossiping.
    fn process_network_announcement(&self, env: NetworkMessage) -> Option<Vec<GossipMessage>> {
        let NetworkMessage {
            peer,
            msg,
            is_remote,
            result,
        } = env;

        match msg {
            GossipMessage::NodeAnnouncement(ann) => {
                self.handle_node_announcement(ann, is_remote, result)
            }
            GossipMessage::ChannelAnnouncement(ann) => {
                self.handle_channel_announcement(peer, ann, is_remote, result)
            }
            GossipMessage::ChannelUpdate(upd) => {
                self.handle_channel_update(peer, upd, is_remote, result)
            }
            GossipMessage::AnnounceSignatures(half) => {
                self.handle_announce_signatures(peer, half, is_remote, result)
            }
        }
    }

    fn handle_node_announcement(
        &self,
        ann: NodeAnnouncement,
        is_remote: bool,
        result: oneshot::Sender<Result<(), GossipError>>,
    ) -> Option<Vec<GossipMessage>> {
        if is_remote {
            if let Err(e) = validate_node_ann(&self.secp, &ann) {
                error!(node = %ann.node_id, error = %e, "unable to validate node announcement");
                let _ = result.send(Err(e));
                return None;
            }
        }

        let node = NodeInfo {
            pub_key: ann.node_id,
            have_announcement: true,
            last_update: ann.timestamp,
            alias: ann.alias,
            addresses: ann.addresses.clone(),
            features: ann.features.clone(),
            auth_sig: Some(ann.signature),
        };

        if let Err(e) = self.router.add_node(node) {
            if e.is_silent() {
                debug!(node = %ann.node_id, error = %e, "router skipped node announcement");
            } else {
                error!(node = %ann.node_id, error = %e, "router rejected node announcement");
            }
            let _ = result.send(Err(e.into()));
            return None;
        }

        let _ = result.send(Ok(()));
        Some(vec![GossipMessage::NodeAnnouncement(ann)])
    }

    fn handle_channel_announcement(
        &self,
        peer: PublicKey,
        ann: ChannelAnnouncement,
        is_remote: bool,
        result: oneshot::Sender<Result<(), GossipError>>,
    ) -> Option<Vec<GossipMessage>> {
        if ann.chain_hash != self.chain_hash {
            let e = GossipError::WrongChain {
                got: ann.chain_hash,
                want: self.chain_hash,
            };
            error!(channel = %ann.short_channel_id, error = %e, "ignoring channel announcement");
            let _ = result.send(Err(e));
            return None;
        }

        if is_remote && self.is_premature(ann.short_channel_id, 0) {
            let height = ann.short_channel_id.block_height;
            info!(
                channel = %ann.short_channel_id,
                advertised = height,
                best = self.best_height(),
                "premature channel announcement, buffering"
            );
            self.premature.add(
                height,
                NetworkMessage {
                    peer,
                    msg: GossipMessage::ChannelAnnouncement(ann),
                    is_remote,
                    result,
                },
            );
            return None;
        }

        // Remote announcements must carry a fully valid proof; local ones
        // have no proof yet and go in unverified.
        let mut proof = None;
        if is_remote {
            if let Err(e) = validate_channel_ann(&self.secp, &ann) {
                error!(channel = %ann.short_channel_id, error = %e, "unable to validate channel announcement");
                let _ = result.send(Err(e));
                return None;
            }
            proof = Some(ChannelAuthProof {
                node_sig_1: ann.node_sig_1,
                node_sig_2: ann.node_sig_2,
                bitcoin_sig_1: ann.bitcoin_sig_1,
                bitcoin_sig_2: ann.bitcoin_sig_2,
            });
        }

        let edge = ChannelInfo {
            channel_id: ann.short_channel_id,
            chain_hash: ann.chain_hash,
            // The store resolves the funding outpoint while validating the
            // channel on-chain.
            channel_point: None,
            node_key_1: ann.node_id_1,
            node_key_2: ann.node_id_2,
            bitcoin_key_1: ann.bitcoin_key_1,
            bitcoin_key_2: ann.bitcoin_key_2,
            auth_proof: proof.clone(),
            features: ann.features.clone(),
        };

        if let Err(e) = self.router.add_edge(edge) {
            if e.is_silent() {
                debug!(channel = %ann.short_channel_id, error = %e, "router skipped channel edge");
            } else {
                error!(channel = %ann.short_channel_id, error = %e, "router rejected channel edge");
            }
            let _ = result.send(Err(e.into()));
            return None;
        }

        let _ = result.send(Ok(()));
        if proof.is_some() {
            Some(vec![GossipMessage::ChannelAnnouncement(ann)])
        } else {
            None
        }
    }

    fn handle_channel_update(
        &self,
        peer: PublicKey,
        upd: ChannelUpdate,
        is_remote: bool,
        result: oneshot::Sender<Result<(), GossipError>>,
    ) -> Option<Vec<GossipMessage>> {
        if upd.chain_hash != self.chain_hash {
            let e = GossipError::WrongChain {
                got: upd.chain_hash,
                want: self.chain_hash,
            };
            error!(channel = %upd.short_channel_id, error = %e, "ignoring channel update");
            let _ = result.send(Err(e));
            return None;
        }

        if is_remote && self.is_premature(upd.short_channel_id, 0) {
            let height = upd.short_channel_id.block_height;
            info!(
                channel = %upd.short_channel_id,
                advertised = height,
                best = self.best_height(),
                "premature channel update, buffering"
            );
            self.premature.add(
                height,
                NetworkMessage {
                    peer,
                    msg: GossipMessage::ChannelUpdate(upd),
                    is_remote,
                    result,
                },
            );
            return None;
        }

        // The update does not carry the signing key; fetch it from the
        // channel record. An update for an unknown channel is not buffered
        // — the peer re-sends once we learn of the channel.
        let chan_info = match self.router.get_channel_by_id(upd.short_channel_id) {
            Ok((info, _, _)) => info,
            Err(GraphError::NotFound) => {
                let e = GossipError::UnknownChannel(upd.short_channel_id);
                error!(channel = %upd.short_channel_id, "unable to validate channel update: channel unknown");
                let _ = result.send(Err(e));
                return None;
            }
            Err(e) => {
                error!(channel = %upd.short_channel_id, error = %e, "unable to fetch channel for update");
                let _ = result.send(Err(e.into()));
                return None;
            }
        };

        let signing_key = match upd.flags {
            0 => chan_info.node_key_1,
            1 => chan_info.node_key_2,
            flags => {
                error!(channel = %upd.short_channel_id, flags, "unknown channel update flags");
                let _ = result.send(Err(GossipError::Malformed));
                return None;
            }
        };

        if is_remote {
            if let Err(e) = validate_channel_update(&self.secp, &signing_key, &upd) {
                error!(channel = %upd.short_channel_id, error = %e, "unable to validate channel update");
                let _ = result.send(Err(e));
                return None;
            }
        }

        let policy = ChannelPolicy {
            signature: upd.signature,
            channel_id: upd.short_channel_id,
            last_update: upd.timestamp,
            flags: upd.flags,
            time_lock_delta: upd.time_lock_delta,
            htlc_minimum_msat: upd.htlc_minimum_msat,
            fee_base_msat: upd.fee_base_msat,
            fee_proportional_millionths: upd.fee_proportional_millionths,
        };

        if let Err(e) = self.router.update_edge(policy) {
            if e.is_silent() {
                debug!(channel = %upd.short_channel_id, error = %e, "router skipped channel update");
            } else {
                error!(channel = %upd.short_channel_id, error = %e, "router rejected channel update");
            }
            let _ = result.send(Err(e.into()));
            return None;
        }

        let _ = result.send(Ok(()));

        // Only updates for publicly known (proven) channels are gossiped
        // onward.
        if chan_info.auth_proof.is_some() {
            Some(vec![GossipMessage::ChannelUpdate(upd)])
        } else {
            None
        }
    }

    fn handle_announce_signatures(
        &self,
        peer: PublicKey,
        half: AnnounceSignatures,
        is_remote: bool,
        result: oneshot::Sender<Result<(), GossipError>>,
    ) -> Option<Vec<GossipMessage>> {
        let channel_id = half.short_channel_id;
        let need_height = channel_id.block_height + self.proof_mature_delta;

        // Proof halves are exchanged only once the funding transaction has
        // matured; be tolerant of peers that count confirmations
        // differently and park early arrivals.
        if self.is_premature(channel_id, self.proof_mature_delta) {
            info!(
                channel = %channel_id,
                need = need_height,
                best = self.best_height(),
                "premature proof announcement, buffering"
            );
            self.premature.add(
                need_height,
                NetworkMessage {
                    peer,
                    msg: GossipMessage::AnnounceSignatures(half),
                    is_remote,
                    result,
                },
            );
            return None;
        }

        let (chan_info, e1, e2) = match self.router.get_channel_by_id(channel_id) {
            Ok(t) => t,
            Err(GraphError::NotFound) => {
                // Channel not yet known: park this half. The record is
                // bound to the submitting peer, so a stranger cannot
                // overwrite it later.
                let proof = WaitingProof::new(is_remote, peer, &half);
                if let Err(e) = self.waiting_proofs.add(&proof) {
                    error!(channel = %channel_id, error = %e, "unable to store waiting proof");
                    let _ = result.send(Err(e.into()));
                    return None;
                }
                info!(
                    channel = %channel_id,
                    remote = is_remote,
                    "orphan half proof stored until channel is known"
                );
                let _ = result.send(Ok(()));
                return None;
            }
            Err(e) => {
                error!(channel = %channel_id, error = %e, "unable to fetch channel for proof");
                let _ = result.send(Err(e.into()));
                return None;
            }
        };

        let is_first_node = peer == chan_info.node_key_1;
        let is_second_node = peer == chan_info.node_key_2;
        if !is_first_node && !is_second_node {
            let e = GossipError::PeerMismatch { peer, channel_id };
            error!(channel = %channel_id, peer = %peer, "proof sender is not a channel member");
            let _ = result.send(Err(e));
            return None;
        }
        let remote_peer = if is_first_node {
            chan_info.node_key_2
        } else {
            chan_info.node_key_1
        };

        let proof = WaitingProof::new(is_remote, peer, &half);
        let opposite = match self.waiting_proofs.get(&proof.opposite_key()) {
            Ok(opposite) => opposite,
            Err(e) => {
                error!(channel = %channel_id, error = %e, "unable to fetch opposite waiting proof");
                let _ = result.send(Err(e.into()));
                return None;
            }
        };

        let Some(opposite) = opposite else {
            // First half: persist it, and if it is ours, hand it to the
            // counterparty so they can reconstruct the announcement too.
            if let Err(e) = self.waiting_proofs.add(&proof) {
                error!(channel = %channel_id, error = %e, "unable to store waiting proof");
                let _ = result.send(Err(e.into()));
                return None;
            }

            if !is_remote {
                if let Err(e) = self.transport.send_to_peer(
                    &remote_peer,
                    vec![GossipMessage::AnnounceSignatures(half)],
                ) {
                    error!(peer = %remote_peer, error = %e, "unable to send half proof to peer");
                }
            }

            info!(channel = %channel_id, "half of channel proof received, waiting for the other half");
            let _ = result.send(Ok(()));
            return None;
        };

        // The opposite half may have been stored before the channel was
        // known; make sure its submitter really is a channel member before
        // trusting it.
        if opposite.peer != chan_info.node_key_1 && opposite.peer != chan_info.node_key_2 {
            let e = GossipError::PeerMismatch {
                peer: opposite.peer,
                channel_id,
            };
            error!(
                channel = %channel_id,
                peer = %opposite.peer,
                "stored half proof was submitted by a non-member, discarding"
            );
            if let Err(e) = self.waiting_proofs.remove(&proof.opposite_key()) {
                error!(channel = %channel_id, error = %e, "unable to remove poisoned waiting proof");
            }
            let _ = result.send(Err(e));
            return None;
        }

        // Both halves present: slot them by which side the sender is and
        // assemble the full proof.
        let full_proof = if is_first_node {
            ChannelAuthProof {
                node_sig_1: half.node_signature,
                node_sig_2: opposite.node_signature,
                bitcoin_sig_1: half.bitcoin_signature,
                bitcoin_sig_2: opposite.bitcoin_signature,
            }
        } else {
            ChannelAuthProof {
                node_sig_1: opposite.node_signature,
                node_sig_2: half.node_signature,
                bitcoin_sig_1: opposite.bitcoin_signature,
                bitcoin_sig_2: half.bitcoin_signature,
            }
        };

        let (chan_ann, upd_1, upd_2) =
            create_chan_announcement(&full_proof, &chan_info, e1.as_ref(), e2.as_ref());

        if let Err(e) = validate_channel_ann(&self.secp, &chan_ann) {
            error!(channel = %channel_id, error = %e, "assembled channel proof is invalid");
            let _ = result.send(Err(e));
            return None;
        }

        if let Err(e) = self.router.add_proof(channel_id, full_proof) {
            error!(channel = %channel_id, error = %e, "unable to attach proof to channel");
            let _ = result.send(Err(e.into()));
            return None;
        }

        if let Err(e) = self.waiting_proofs.remove(&proof.opposite_key()) {
            error!(channel = %channel_id, error = %e, "unable to remove opposite waiting proof");
            let _ = result.send(Err(e.into()));
            return None;
        }

        info!(channel = %channel_id, "fully valid channel proof assembled, adding to next batch");

        let mut announcements = vec![GossipMessage::ChannelAnnouncement(chan_ann)];
        if let Some(upd) = upd_1 {
            announcements.push(GossipMessage::ChannelUpdate(upd));
        }
        if let Some(upd) = upd_2 {
            announcements.push(GossipMessage::ChannelUpdate(upd));
        }

        if !is_remote {
            if let Err(e) = self
                .transport
                .send_to_peer(&remote_peer, vec![GossipMessage::AnnounceSignatures(half)])
            {
                error!(peer = %remote_peer, error = %e, "unable to send half proof to peer");
            }
        }

        let _ = result.send(Ok(()));
        Some(announcements)
    }

    /// Sweep outgoing channels and rebroadcast any whose policy has gone
    /// stale, with a freshly signed update (and the channel announcement,
    /// when the channel is proven).
    fn retransmit_stale_channels(&self) -> Result<(), GossipError> {
        let now = Utc::now().timestamp();

        let mut edges_to_update: Vec<(ChannelInfo, ChannelPolicy)> = Vec::new();
        let walk = self.router.for_all_outgoing_channels(&mut |info, policy| {
            if now - i64::from(policy.last_update) >= BROADCAST_INTERVAL_SECS {
                edges_to_update.push((info.clone(), policy.clone()));
            }
            Ok(())
        });
        match walk {
            Ok(()) | Err(GraphError::NoEdges) => {}
            Err(e) => return Err(e.into()),
        }

        let mut signed_updates = Vec::new();
        let num_stale = edges_to_update.len();
        for (info, policy) in edges_to_update {
            let (chan_ann, chan_update) = self.update_channel(&info, policy)?;
            if let Some(ann) = chan_ann {
                signed_updates.push(GossipMessage::ChannelAnnouncement(ann));
            }
            signed_updates.push(GossipMessage::ChannelUpdate(chan_update));
        }

        if signed_updates.is_empty() {
            return Ok(());
        }

        info!(channels = num_stale, "retransmitting stale outgoing channels");
        self.transport.broadcast(None, signed_updates)?;
        Ok(())
    }

    /// Craft freshly signed updates carrying the new fee schema for the
    /// selected outgoing channels and commit them to the graph store.
    fn process_fee_chan_update(
        &self,
        schema: FeeSchema,
        target_chans: &[ChannelPoint],
    ) -> Result<Vec<GossipMessage>, GossipError> {
        let filter: HashSet<ChannelPoint> = target_chans.iter().copied().collect();

        let mut selected: Vec<(ChannelInfo, ChannelPolicy)> = Vec::new();
        self.router.for_all_outgoing_channels(&mut |info, policy| {
            if !filter.is_empty() {
                match info.channel_point {
                    Some(point) if filter.contains(&point) => {}
                    _ => return Ok(()),
                }
            }
            selected.push((info.clone(), policy.clone()));
            Ok(())
        })?;

        let mut updates = Vec::with_capacity(selected.len());
        for (info, mut policy) in selected {
            policy.fee_base_msat = schema.base_fee_msat;
            policy.fee_proportional_millionths = schema.fee_rate;

            let (_, upd) = self.update_channel(&info, policy)?;
            updates.push(GossipMessage::ChannelUpdate(upd));
        }
        Ok(updates)
    }

    /// Re-sign a policy with the current timestamp, persist it, and return
    /// the broadcastable update (plus the channel announcement when the
    /// channel carries a proof).
    fn update_channel(
        &self,
        info: &ChannelInfo,
        mut policy: ChannelPolicy,
    ) -> Result<(Option<ChannelAnnouncement>, ChannelUpdate), GossipError> {
        policy.last_update = Utc::now().timestamp() as u32;

        let mut upd = ChannelUpdate {
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

        let sig = sign_announcement(self.signer.as_ref(), &upd.data_to_sign())?;
        policy.signature = sig;
        upd.signature = sig;

        // Catch a broken signer before the bad policy hits the store.
        validate_channel_update(&self.secp, &self.self_key, &upd).map_err(|e| {
            GossipError::InvalidSignature(format!("generated invalid channel update sig: {e}"))
        })?;

        self.router.update_edge(policy)?;

        let chan_ann = info
            .auth_proof
            .as_ref()
            .map(|proof| create_chan_announcement(proof, info, None, None).0);

        Ok((chan_ann, upd))
    }

    /// Stream the full known graph to one peer, channels first.
    fn synchronize_node(&self, peer: &PublicKey) -> Result<(), GossipError> {
        let mut announce_messages = Vec::new();

        // Peers expect channel announcements before node announcements, so
        // gather proven channels (with both direction updates) first.
        let mut num_edges = 0u32;
        let walk = self.router.for_each_channel(&mut |info, e1, e2| {
            if let Some(proof) = &info.auth_proof {
                let (ann, upd_1, upd_2) = create_chan_announcement(proof, info, e1, e2);
                announce_messages.push(GossipMessage::ChannelAnnouncement(ann));
                if let Some(upd) = upd_1 {
                    announce_messages.push(GossipMessage::ChannelUpdate(upd));
                }
                if let Some(upd) = upd_2 {
                    announce_messages.push(GossipMessage::ChannelUpdate(upd));
                }
                num_edges += 1;
            }
            Ok(())
        });
        match walk {
            Ok(()) | Err(GraphError::NoEdges) => {}
            Err(e) => {
                error!(error = %e, "unable to sync channel infos with peer");
                return Err(e.into());
            }
        }

        let mut num_nodes = 0u32;
        self.router.for_each_node(&mut |node| {
            // Nodes we only know through an edge have nothing to announce.
            if !node.have_announcement {
                return Ok(());
            }
            let Some(signature) = node.auth_sig else {
                return Ok(());
            };
            announce_messages.push(GossipMessage::NodeAnnouncement(NodeAnnouncement {
                signature,
                features: node.features.clone(),
                timestamp: node.last_update,
                node_id: node.pub_key,
                alias: node.alias,
                addresses: node.addresses.clone(),
            }));
            num_nodes += 1;
            Ok(())
        })?;

        info!(
            peer = %peer,
            nodes = num_nodes,
            edges = num_edges,
            "syncing channel graph state with peer"
        );

        self.transport.send_to_peer(peer, announce_messages)?;
        Ok(())
    }
}
