//! Rarity- and priority-aware piece picker, grounded on the role
//! `bip_peer::piece::selectors::PieceSelector` plays in the original workspace (a per-torrent
//! object queried by each peer connection) even though that stub never grew a real body.

use rand::Rng;
use std::collections::VecDeque;

use crate::bitfield::Bitfield;
use crate::priority::{PriorityClass, PriorityRanges};

pub const INVALID_INDEX: u32 = u32::MAX;
const PARTIAL_QUEUE_CAP: usize = 8;
const SHARED_QUEUE_CAP: usize = 32;

/// `rarity[index]` = number of accounted peers holding that index, clamped to `[0, 255]`, plus a
/// count of full seeds.
pub struct ChunkStatistics {
    rarity: Vec<u8>,
    complete: u32,
}

impl ChunkStatistics {
    pub fn new(chunk_total: usize) -> ChunkStatistics {
        ChunkStatistics {
            rarity: vec![0; chunk_total],
            complete: 0,
        }
    }

    pub fn rarity(&self, index: u32) -> u8 {
        self.rarity[index as usize]
    }

    pub fn add_peer(&mut self, bitfield: &Bitfield) {
        if bitfield.is_all_set() {
            self.complete += 1;
        }
        for index in bitfield.iter_set() {
            let slot = &mut self.rarity[index];
            *slot = slot.saturating_add(1);
        }
    }

    pub fn remove_peer(&mut self, bitfield: &Bitfield) {
        if bitfield.is_all_set() {
            self.complete = self.complete.saturating_sub(1);
        }
        for index in bitfield.iter_set() {
            let slot = &mut self.rarity[index];
            *slot = slot.saturating_sub(1);
        }
    }

    pub fn received_have(&mut self, index: u32) {
        let slot = &mut self.rarity[index as usize];
        *slot = slot.saturating_add(1);
    }

    pub fn complete_peers(&self) -> u32 {
        self.complete
    }
}

/// A candidate entry cached in a peer's partial queue, sorted by increasing rarity.
#[derive(Clone, Copy)]
struct QueueEntry {
    index: u32,
    rarity: u8,
}

/// Per-peer cache of candidate wanted indices, capped at `PARTIAL_QUEUE_CAP` (the "shared_queue"
/// used for seeders is the same structure with a larger cap).
#[derive(Default)]
struct PartialQueue {
    entries: VecDeque<QueueEntry>,
    cap: usize,
}

impl PartialQueue {
    fn new(cap: usize) -> PartialQueue {
        PartialQueue { entries: VecDeque::new(), cap }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn insert(&mut self, index: u32, rarity: u8) {
        if self.entries.len() >= self.cap {
            return;
        }
        let pos = self.entries.iter().position(|e| e.rarity > rarity).unwrap_or(self.entries.len());
        self.entries.insert(pos, QueueEntry { index, rarity });
    }

    fn pop_front(&mut self) -> Option<u32> {
        self.entries.pop_front().map(|e| e.index)
    }
}

/// Picks the next wanted piece index for a peer using rarity and priority.
/// `m_bitfield` is the complement of local completion, intersected implicitly with priority
/// `!= OFF` by the caller's insert pattern (see `initialize`).
pub struct ChunkSelector {
    wanted: Bitfield,
    position: Option<u32>,
    shared_queue: PartialQueue,
}

impl ChunkSelector {
    /// `initialize`: `m_bitfield = ~completed_bitfield`, position seeded uniformly within the
    /// wanted set, shared queue enabled with capacity 32.
    pub fn initialize<R: Rng>(completed: &Bitfield, rng: &mut R) -> ChunkSelector {
        let wanted = completed.complement();
        let position = random_set_bit(&wanted, rng);
        ChunkSelector {
            wanted,
            position,
            shared_queue: PartialQueue::new(SHARED_QUEUE_CAP),
        }
    }

    pub fn chunk_total(&self) -> usize {
        self.wanted.len()
    }

    pub fn wanted_count(&self) -> usize {
        self.wanted.count()
    }

    /// Invalidate the cached partial queue; re-seed `position` if it became invalid.
    pub fn update_priorities<R: Rng>(&mut self, rng: &mut R) {
        self.shared_queue.clear();
        if self.position.map(|p| !self.wanted.get(p as usize)).unwrap_or(true) {
            self.position = random_set_bit(&self.wanted, rng);
        }
    }

    /// Returns a wanted index the peer has, or `INVALID_INDEX`. Prefers the cached queue; on a
    /// miss, scans forward from `position` (wrapping) over HIGH ranges first, then NORMAL.
    pub fn find(&mut self, peer_bitfield: &Bitfield, priorities: &PriorityRanges) -> u32 {
        if self.wanted.is_all_unset() {
            return INVALID_INDEX;
        }

        if let Some(index) = self.shared_queue.pop_front() {
            if self.wanted.get(index as usize) && peer_bitfield.get(index as usize) {
                return index;
            }
        }

        for class in [PriorityClass::High, PriorityClass::Normal] {
            if let Some(found) = self.scan_class(peer_bitfield, priorities, class) {
                return found;
            }
        }

        INVALID_INDEX
    }

    /// Like `find`, but restricted to a single priority class: no HIGH-then-NORMAL fallback.
    /// Used by callers that must keep a result's priority bookkeeping consistent with the class
    /// they asked for.
    pub fn find_in_class(&mut self, peer_bitfield: &Bitfield, priorities: &PriorityRanges, class: PriorityClass) -> u32 {
        if self.wanted.is_all_unset() {
            return INVALID_INDEX;
        }

        if let Some(index) = self.shared_queue.pop_front() {
            if self.wanted.get(index as usize) && peer_bitfield.get(index as usize) && priorities.has(class, index) {
                return index;
            }
        }

        self.scan_class(peer_bitfield, priorities, class).unwrap_or(INVALID_INDEX)
    }

    fn scan_class(&mut self, peer_bitfield: &Bitfield, priorities: &PriorityRanges, class: PriorityClass) -> Option<u32> {
        let total = self.wanted.len();
        if total == 0 {
            return None;
        }
        let start = self.position.unwrap_or(0) as usize;
        let mut first_found = None;

        for offset in 0..total {
            let index = (start + offset) % total;
            if !self.wanted.get(index) || !peer_bitfield.get(index) {
                continue;
            }
            if !priorities.has(class, index as u32) {
                continue;
            }
            if first_found.is_none() {
                first_found = Some(index as u32);
            }
            self.shared_queue.insert(index as u32, 0);
            if self.shared_queue.entries.len() >= PARTIAL_QUEUE_CAP {
                break;
            }
        }

        if first_found.is_some() {
            self.shared_queue.pop_front()
        } else {
            None
        }
    }

    /// Unset the bit; advance `position` if it pointed at `index`.
    pub fn using_index(&mut self, index: u32) {
        self.wanted.unset(index as usize);
        if self.position == Some(index) {
            self.position = next_set_bit(&self.wanted, index);
        }
    }

    /// Set the bit back; if `position` was invalid, adopt this index.
    pub fn not_using_index(&mut self, index: u32) {
        self.wanted.set(index as usize);
        if self.position.is_none() {
            self.position = Some(index);
        }
    }

    /// True iff we want `index`; on true, seed the peer's cache with the current rarity.
    pub fn received_have_chunk(&mut self, index: u32, rarity: u8) -> bool {
        let want = self.wanted.get(index as usize);
        if want {
            self.shared_queue.insert(index, rarity);
        }
        want
    }
}

fn random_set_bit<R: Rng>(bitfield: &Bitfield, rng: &mut R) -> Option<u32> {
    let set: Vec<u32> = bitfield.iter_set().map(|i| i as u32).collect();
    if set.is_empty() {
        None
    } else {
        Some(set[rng.gen_range(0..set.len())])
    }
}

fn next_set_bit(bitfield: &Bitfield, after: u32) -> Option<u32> {
    let total = bitfield.len();
    if total == 0 {
        return None;
    }
    for offset in 1..=total {
        let index = (after as usize + offset) % total;
        if bitfield.get(index) {
            return Some(index as u32);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn initialize_wants_complement_of_completed() {
        let mut completed = Bitfield::new(8);
        completed.set(0);
        completed.set(1);
        let mut rng = StepRng::new(0, 1);
        let selector = ChunkSelector::initialize(&completed, &mut rng);
        assert_eq!(selector.wanted_count(), 6);
    }

    #[test]
    fn find_returns_invalid_on_empty_wanted_set() {
        let mut completed = Bitfield::new(4);
        completed.set_all();
        let mut rng = StepRng::new(0, 1);
        let mut selector = ChunkSelector::initialize(&completed, &mut rng);
        let peer = Bitfield::new(4);
        let priorities = PriorityRanges::new();
        assert_eq!(selector.find(&peer, &priorities), INVALID_INDEX);
    }

    #[test]
    fn find_prefers_high_priority_then_normal() {
        let completed = Bitfield::new(4);
        let mut rng = StepRng::new(0, 1);
        let mut selector = ChunkSelector::initialize(&completed, &mut rng);
        let mut peer = Bitfield::new(4);
        peer.set_all();

        let mut priorities = PriorityRanges::new();
        priorities.insert(PriorityClass::Normal, 0, 2);
        priorities.insert(PriorityClass::High, 2, 4);

        let found = selector.find(&peer, &priorities);
        assert!(found == 2 || found == 3);
    }

    #[test]
    fn using_index_advances_position() {
        let completed = Bitfield::new(4);
        let mut rng = StepRng::new(0, 1);
        let mut selector = ChunkSelector::initialize(&completed, &mut rng);
        selector.position = Some(1);
        selector.using_index(1);
        assert!(!selector.wanted.get(1));
        assert_ne!(selector.position, Some(1));
    }

    #[test]
    fn using_then_not_using_is_a_round_trip() {
        let completed = Bitfield::new(4);
        let mut rng = StepRng::new(0, 1);
        let mut selector = ChunkSelector::initialize(&completed, &mut rng);
        let before = selector.wanted_count();
        selector.using_index(0);
        selector.not_using_index(0);
        assert_eq!(selector.wanted_count(), before);
    }

    #[test]
    fn received_have_chunk_reports_whether_wanted() {
        let mut completed = Bitfield::new(4);
        completed.set(0);
        let mut rng = StepRng::new(0, 1);
        let mut selector = ChunkSelector::initialize(&completed, &mut rng);
        assert!(!selector.received_have_chunk(0, 1));
        assert!(selector.received_have_chunk(1, 1));
    }

    #[test]
    fn chunk_statistics_tracks_rarity_and_seeds() {
        let mut stats = ChunkStatistics::new(4);
        let mut peer_a = Bitfield::new(4);
        peer_a.set(0);
        peer_a.set(1);
        let mut seed = Bitfield::new(4);
        seed.set_all();

        stats.add_peer(&peer_a);
        stats.add_peer(&seed);
        assert_eq!(stats.rarity(0), 2);
        assert_eq!(stats.rarity(2), 1);
        assert_eq!(stats.complete_peers(), 1);

        stats.remove_peer(&peer_a);
        assert_eq!(stats.rarity(0), 1);
    }
}
