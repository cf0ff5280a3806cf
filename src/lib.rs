//! Authenticated gossip engine for a Lightning Network node.
//!
//! Ingests channel and node announcements from peers and from the local
//! node, authenticates them, admits them into the persistent channel graph,
//! and re-broadcasts accepted messages in batched trickle rounds. Also runs
//! the half-proof signature exchange that turns a private channel into a
//! publicly gossipable one, buffers announcements that are ahead of the
//! chain tip, and periodically re-signs stale outgoing edges.

pub mod barrier;
pub mod batch;
pub mod engine;
pub mod error;
pub mod graph;
pub mod premature;
pub mod proofs;
pub mod validation;
pub mod wire;

pub use engine::{AuthenticatedGossiper, Config, FeeSchema};
pub use error::GossipError;
