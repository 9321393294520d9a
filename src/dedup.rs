//! Bounded set of already-handled source events.
//!
//! Subscriptions redeliver logs after a reconnect and consecutive poll
//! batches may overlap, so handlers claim each event id here before any
//! side-effecting call.
//!
//! Ids are kept in claim order next to the lookup map, so expiry and
//! eviction pop from the front instead of scanning. Released or re-claimed
//! ids leave stale order entries behind; they are skipped when popped and
//! compacted once they outnumber the live ones.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub const DEFAULT_SEEN_EVENT_CACHE_SIZE: usize = 100_000;
pub const DEFAULT_SEEN_EVENT_TTL_SECS: u64 = 86_400; // 24 hours

/// Event ids with TTL and capacity limits.
///
/// - **Max capacity:** when full, the oldest entry is evicted on insert.
/// - **TTL:** expired entries are dropped on insert and ignored on lookup.
#[derive(Debug)]
pub struct SeenEvents {
    map: HashMap<[u8; 32], Instant>,
    order: VecDeque<([u8; 32], Instant)>,
    max_size: usize,
    ttl: Duration,
}

impl SeenEvents {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            max_size: max_size.max(1),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub fn contains(&self, id: &[u8; 32]) -> bool {
        self.map.get(id).is_some_and(|&t| t.elapsed() < self.ttl)
    }

    /// Mark `id` as seen. Returns `false` if it was already present.
    pub fn claim(&mut self, id: [u8; 32]) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.insert(id);
        true
    }

    /// Forget `id` so a later delivery is handled again.
    pub fn release(&mut self, id: &[u8; 32]) {
        self.map.remove(id);
    }

    pub fn insert(&mut self, id: [u8; 32]) {
        let now = Instant::now();
        while let Some(&(front, at)) = self.order.front() {
            let live = self.map.get(&front) == Some(&at);
            let expired = now.duration_since(at) >= self.ttl;
            if live && !expired && self.map.len() < self.max_size {
                break;
            }
            self.order.pop_front();
            if live {
                self.map.remove(&front);
            }
        }

        self.map.insert(id, now);
        self.order.push_back((id, now));

        if self.order.len() > self.map.len().saturating_mul(2).max(self.max_size) {
            let map = &self.map;
            self.order.retain(|(id, at)| map.get(id) == Some(at));
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for SeenEvents {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_EVENT_CACHE_SIZE, DEFAULT_SEEN_EVENT_TTL_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_only_once() {
        let mut seen = SeenEvents::new(10, 3600);
        let id = [1u8; 32];
        assert!(seen.claim(id));
        assert!(!seen.claim(id));
        assert!(seen.contains(&id));
    }

    #[test]
    fn test_release_allows_reclaim() {
        let mut seen = SeenEvents::new(10, 3600);
        let id = [2u8; 32];
        assert!(seen.claim(id));
        seen.release(&id);
        assert!(!seen.contains(&id));
        assert!(seen.claim(id));
    }

    #[test]
    fn test_evicts_oldest() {
        let mut seen = SeenEvents::new(3, 3600);
        for b in 1..=4u8 {
            seen.insert([b; 32]);
        }
        assert!(!seen.contains(&[1u8; 32]));
        assert!(seen.contains(&[2u8; 32]));
        assert!(seen.contains(&[4u8; 32]));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_reclaimed_id_is_not_evicted_by_its_old_slot() {
        let mut seen = SeenEvents::new(2, 3600);
        seen.insert([1u8; 32]);
        seen.release(&[1u8; 32]);
        seen.insert([2u8; 32]);
        seen.insert([1u8; 32]);
        // Full: the oldest live id goes, not the re-claimed one.
        seen.insert([3u8; 32]);
        assert!(!seen.contains(&[2u8; 32]));
        assert!(seen.contains(&[1u8; 32]));
        assert!(seen.contains(&[3u8; 32]));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_claim_release_churn_stays_bounded() {
        let mut seen = SeenEvents::new(4, 3600);
        for _ in 0..1_000 {
            assert!(seen.claim([7u8; 32]));
            seen.release(&[7u8; 32]);
        }
        assert!(seen.is_empty());
        assert!(seen.order.len() <= 4);
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let mut seen = SeenEvents::new(10, 0);
        seen.insert([3u8; 32]);
        assert!(!seen.contains(&[3u8; 32]));
        assert!(seen.claim([3u8; 32]));
        assert_eq!(seen.len(), 1);
    }
}
