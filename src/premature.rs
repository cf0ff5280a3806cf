//! Height-indexed buffer for announcements that are ahead of the chain tip.
//!
//! A message anchored in a block beyond our best known height waits here
//! until the chain catches up. Arrival order is preserved per height, and a
//! height's bucket is drained atomically when a block at that height
//! connects. Contents are in-memory only; peers re-gossip anything lost on
//! restart.

use std::collections::HashMap;
use std::sync::Mutex;

pub struct PrematureBuffer<T> {
    inner: Mutex<HashMap<u32, Vec<T>>>,
}

impl<T> PrematureBuffer<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Queue an item to be replayed once the chain reaches `height`.
    pub fn add(&self, height: u32, item: T) {
        self.inner
            .lock()
            .expect("premature lock")
            .entry(height)
            .or_default()
            .push(item);
    }

    /// Remove and return everything waiting on `height`, in arrival order.
    pub fn drain(&self, height: u32) -> Vec<T> {
        self.inner
            .lock()
            .expect("premature lock")
            .remove(&height)
            .unwrap_or_default()
    }

    /// Total number of buffered items across all heights.
    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .expect("premature lock")
            .values()
            .map(Vec::len)
            .sum()
    }
}

impl<T> Default for PrematureBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_arrival_order() {
        let buf = PrematureBuffer::new();
        buf.add(100, "a");
        buf.add(100, "b");
        buf.add(100, "c");
        assert_eq!(buf.drain(100), ["a", "b", "c"]);
    }

    #[test]
    fn drain_removes_only_the_requested_height() {
        let buf = PrematureBuffer::new();
        buf.add(100, 1);
        buf.add(101, 2);
        assert_eq!(buf.drain(100), [1]);
        assert_eq!(buf.pending(), 1);
        assert_eq!(buf.drain(101), [2]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn drain_of_empty_height_is_empty() {
        let buf: PrematureBuffer<u8> = PrematureBuffer::new();
        assert!(buf.drain(42).is_empty());
    }
}
