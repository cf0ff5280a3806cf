//! Deduplicated outbound announcement batch, flushed once per trickle tick.
//!
//! Three maps, one per message type. Within a batch, a later arrival for the
//! same key replaces the earlier one; timestamp freshness is the graph
//! store's job, not this layer's. Emission order is fixed — channel
//! announcements, then channel updates, then node announcements — because
//! peers reject updates and node announcements for channels they do not yet
//! know.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::wire::{GossipMessage, ShortChannelId, Vertex};

/// Channel updates are unique per directed edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct UpdateKey {
    channel_id: ShortChannelId,
    direction: u16,
}

#[derive(Default)]
struct Batch {
    channel_announcements: HashMap<ShortChannelId, GossipMessage>,
    channel_updates: HashMap<UpdateKey, GossipMessage>,
    node_announcements: HashMap<Vertex, GossipMessage>,
}

impl Batch {
    fn add(&mut self, msg: GossipMessage) {
        match &msg {
            GossipMessage::ChannelAnnouncement(ann) => {
                self.channel_announcements.insert(ann.short_channel_id, msg);
            }
            GossipMessage::ChannelUpdate(upd) => {
                let key = UpdateKey {
                    channel_id: upd.short_channel_id,
                    direction: upd.direction(),
                };
                self.channel_updates.insert(key, msg);
            }
            GossipMessage::NodeAnnouncement(ann) => {
                self.node_announcements
                    .insert(Vertex::from_pub_key(&ann.node_id), msg);
            }
            // Proof halves are exchanged point-to-point, never batched.
            GossipMessage::AnnounceSignatures(_) => {}
        }
    }

    fn len(&self) -> usize {
        self.channel_announcements.len() + self.channel_updates.len() + self.node_announcements.len()
    }
}

/// Shared announcement batch. Validation workers and the fee-update path
/// write into it; the supervisor snapshots and clears it per trickle tick.
pub struct DedupedAnnouncements {
    inner: Mutex<Batch>,
}

impl DedupedAnnouncements {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Batch::default()),
        }
    }

    pub fn add_msgs<I>(&self, msgs: I)
    where
        I: IntoIterator<Item = GossipMessage>,
    {
        let mut batch = self.inner.lock().expect("batch lock");
        for msg in msgs {
            batch.add(msg);
        }
    }

    /// Snapshot the pending batch in broadcast order and clear it.
    pub fn emit(&self) -> Vec<GossipMessage> {
        let mut batch = self.inner.lock().expect("batch lock");
        let mut out = Vec::with_capacity(batch.len());
        out.extend(batch.channel_announcements.drain().map(|(_, m)| m));
        out.extend(batch.channel_updates.drain().map(|(_, m)| m));
        out.extend(batch.node_announcements.drain().map(|(_, m)| m));
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("batch lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupedAnnouncements {
    fn default() -> Self {
        Self::new()
    }
}
