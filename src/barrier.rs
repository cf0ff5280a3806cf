//! Dependency-ordered admission for parallel validation workers.
//!
//! Announcements validate in parallel, but not in arbitrary order: a channel
//! update may not complete validation before the channel announcement it
//! references, and a node announcement must wait for any in-flight channel
//! announcement that introduces its node. The barrier records a completion
//! signal per in-flight channel announcement (keyed by channel id and by
//! both node vertices) and makes dependants wait on it. A semaphore bounds
//! the total number of in-flight workers.
//!
//! Worker lifecycle: `init_job_dependencies` (on the supervisor, serially) →
//! `wait_for_dependants` → process → `signal_dependants` → drop the permit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::GossipError;
use crate::wire::{GossipMessage, ShortChannelId, Vertex};

/// Slot held by an in-flight validation job. Dropping it frees the slot.
#[derive(Debug)]
pub struct JobPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct Signals {
    channels: HashMap<ShortChannelId, watch::Sender<bool>>,
    nodes: HashMap<Vertex, watch::Sender<bool>>,
}

pub struct ValidationBarrier {
    slots: Arc<Semaphore>,
    signals: Mutex<Signals>,
    quit: CancellationToken,
}

impl ValidationBarrier {
    /// `capacity` bounds the number of concurrently validating jobs.
    pub fn new(capacity: usize, quit: CancellationToken) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            signals: Mutex::new(Signals::default()),
            quit,
        }
    }

    /// Wait for a free validation slot and record the signals any dependant
    /// of this message will wait on. Must be called serially (from the
    /// supervisor) so that signal registration is ordered with message
    /// arrival.
    pub async fn init_job_dependencies(
        &self,
        msg: &GossipMessage,
    ) -> Result<JobPermit, GossipError> {
        let permit = tokio::select! {
            res = Arc::clone(&self.slots).acquire_owned() => {
                res.map_err(|_| GossipError::Shutdown)?
            }
            _ = self.quit.cancelled() => return Err(GossipError::Shutdown),
        };

        // Only channel announcements introduce state other jobs depend on:
        // their channel id, and the two nodes they name.
        if let GossipMessage::ChannelAnnouncement(ann) = msg {
            let (tx, _) = watch::channel(false);
            let mut signals = self.signals.lock().expect("barrier lock");
            signals.channels.insert(ann.short_channel_id, tx.clone());
            signals
                .nodes
                .insert(Vertex::from_pub_key(&ann.node_id_1), tx.clone());
            signals.nodes.insert(Vertex::from_pub_key(&ann.node_id_2), tx);
        }

        Ok(JobPermit { _permit: permit })
    }

    /// Block until every announcement this message depends on has finished
    /// validating. Messages with no in-flight dependency return immediately.
    pub async fn wait_for_dependants(&self, msg: &GossipMessage) -> Result<(), GossipError> {
        let rx = {
            let signals = self.signals.lock().expect("barrier lock");
            match msg {
                GossipMessage::ChannelUpdate(upd) => signals
                    .channels
                    .get(&upd.short_channel_id)
                    .map(|tx| tx.subscribe()),
                GossipMessage::NodeAnnouncement(ann) => signals
                    .nodes
                    .get(&Vertex::from_pub_key(&ann.node_id))
                    .map(|tx| tx.subscribe()),
                _ => None,
            }
        };

        let Some(mut rx) = rx else {
            return Ok(());
        };

        tokio::select! {
            res = rx.wait_for(|done| *done) => {
                // A dropped sender means the dependency already signalled
                // and was cleaned up; either way it is finished.
                let _ = res;
                Ok(())
            }
            _ = self.quit.cancelled() => Err(GossipError::Shutdown),
        }
    }

    /// Wake everything waiting on this message. Called after processing,
    /// whether validation succeeded or not.
    pub fn signal_dependants(&self, msg: &GossipMessage) {
        if let GossipMessage::ChannelAnnouncement(ann) = msg {
            let mut signals = self.signals.lock().expect("barrier lock");
            if let Some(tx) = signals.channels.remove(&ann.short_channel_id) {
                let _ = tx.send(true);
            }
            for vertex in [
                Vertex::from_pub_key(&ann.node_id_1),
                Vertex::from_pub_key(&ann.node_id_2),
            ] {
                if let Some(tx) = signals.nodes.remove(&vertex) {
                    let _ = tx.send(true);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

    use crate::wire::{
        ChainHash, ChannelAnnouncement, ChannelUpdate, NodeAnnouncement,
    };

    fn key(b: u8) -> PublicKey {
        let secp = Secp256k1::new();
        PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[b; 32]).unwrap())
    }

    fn dummy_sig() -> secp256k1::ecdsa::Signature {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[9u8; 32]).unwrap();
        secp.sign_ecdsa(&Message::from_digest([0u8; 32]), &sk)
    }

    fn chan_ann(scid: ShortChannelId, n1: u8, n2: u8) -> GossipMessage {
        GossipMessage::ChannelAnnouncement(ChannelAnnouncement {
            node_sig_1: dummy_sig(),
            node_sig_2: dummy_sig(),
            bitcoin_sig_1: dummy_sig(),
            bitcoin_sig_2: dummy_sig(),
            features: vec![],
            chain_hash: ChainHash([0; 32]),
            short_channel_id: scid,
            node_id_1: key(n1),
            node_id_2: key(n2),
            bitcoin_key_1: key(31),
            bitcoin_key_2: key(32),
        })
    }

    fn chan_update(scid: ShortChannelId) -> GossipMessage {
        GossipMessage::ChannelUpdate(ChannelUpdate {
            signature: dummy_sig(),
            chain_hash: ChainHash([0; 32]),
            short_channel_id: scid,
            timestamp: 0,
            flags: 0,
            time_lock_delta: 144,
            htlc_minimum_msat: 1000,
            fee_base_msat: 1000,
            fee_proportional_millionths: 1,
        })
    }

    fn node_ann(n: u8) -> GossipMessage {
        GossipMessage::NodeAnnouncement(NodeAnnouncement {
            signature: dummy_sig(),
            features: vec![],
            timestamp: 0,
            node_id: key(n),
            alias: [0; 32],
            addresses: vec![],
        })
    }

    #[tokio::test]
    async fn update_waits_for_channel_announcement() {
        let barrier = Arc::new(ValidationBarrier::new(10, CancellationToken::new()));
        let scid = ShortChannelId::new(100, 1, 0);
        let ann = chan_ann(scid, 1, 2);
        let upd = chan_update(scid);

        let _ann_permit = barrier.init_job_dependencies(&ann).await.unwrap();
        let _upd_permit = barrier.init_job_dependencies(&upd).await.unwrap();

        let waiter = {
            let barrier = Arc::clone(&barrier);
            let upd = upd.clone();
            tokio::spawn(async move { barrier.wait_for_dependants(&upd).await })
        };

        // The dependant must still be blocked.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        barrier.signal_dependants(&ann);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn node_announcement_waits_for_introducing_channel() {
        let barrier = Arc::new(ValidationBarrier::new(10, CancellationToken::new()));
        let ann = chan_ann(ShortChannelId::new(100, 1, 0), 5, 6);
        let node = node_ann(6);

        let _permit = barrier.init_job_dependencies(&ann).await.unwrap();
        let _node_permit = barrier.init_job_dependencies(&node).await.unwrap();

        let waiter = {
            let barrier = Arc::clone(&barrier);
            let node = node.clone();
            tokio::spawn(async move { barrier.wait_for_dependants(&node).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        barrier.signal_dependants(&ann);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn no_dependency_returns_immediately() {
        let barrier = ValidationBarrier::new(10, CancellationToken::new());
        let upd = chan_update(ShortChannelId::new(42, 0, 0));
        let _permit = barrier.init_job_dependencies(&upd).await.unwrap();
        barrier.wait_for_dependants(&upd).await.unwrap();
    }

    #[tokio::test]
    async fn capacity_bounds_in_flight_jobs() {
        let barrier = Arc::new(ValidationBarrier::new(1, CancellationToken::new()));
        let first = barrier
            .init_job_dependencies(&node_ann(1))
            .await
            .unwrap();

        let blocked = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.init_job_dependencies(&node_ann(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        drop(first);
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn quit_releases_waiters() {
        let quit = CancellationToken::new();
        let barrier = Arc::new(ValidationBarrier::new(10, quit.clone()));
        let scid = ShortChannelId::new(100, 1, 0);
        let _permit = barrier
            .init_job_dependencies(&chan_ann(scid, 1, 2))
            .await
            .unwrap();

        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.wait_for_dependants(&chan_update(scid)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        quit.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(GossipError::Shutdown)));
    }
}
