//! Token-bucket allocation across a tree of throttle nodes. One `ThrottleList` exists per
//! direction (up/down) and per scope (global, per-address-class, per-connection); nodes are
//! leaves whose lifetime is the peer connection that owns them.
//!
//! The "active/inactive split by iterator" shape is expressed here as two containers
//! (`active: Vec`, `inactive: VecDeque`) instead of one list plus a splitting index -- the same
//! shape, but the "split iterator always valid" invariant becomes structural rather than
//! something to maintain by hand.

use std::collections::{HashMap, VecDeque};

use crate::rate::Rate;

pub type NodeId = u64;

/// Chunk-size decade table: the rate cap (bytes/sec) is compared
/// against each threshold (also bytes/sec) in ascending order, first match wins; minimum chunk
/// grows from 512 B to 32*512 B; maximum chunk is always 4x the minimum.
const CHUNK_THRESHOLDS: [(u32, u32); 6] = [
    (8 << 10, 1),
    (32 << 10, 2),
    (64 << 10, 3),
    (128 << 10, 4),
    (512 << 10, 8),
    (2048 << 10, 16),
];
const MIN_CHUNK_BASE: u32 = 512;

fn chunk_sizes_for_rate(rate_bytes_per_sec: u32) -> (u32, u32) {
    if rate_bytes_per_sec == 0 {
        // Unthrottled: largest chunk, activation happens immediately.
        return (MIN_CHUNK_BASE, MIN_CHUNK_BASE * 4);
    }
    let multiplier = CHUNK_THRESHOLDS
        .iter()
        .find(|&&(threshold, _)| rate_bytes_per_sec <= threshold)
        .map(|&(_, mult)| mult)
        .unwrap_or(32);
    let min_chunk = MIN_CHUNK_BASE * multiplier;
    (min_chunk, min_chunk * 4)
}

/// Tick interval (in units of 100ms) for a throttle ticking at `rate` bytes/sec, given the
/// current `max_chunk_size`.
pub fn tick_interval_units(rate_bytes_per_sec: u32, max_chunk_size: u32) -> u32 {
    if rate_bytes_per_sec < 1024 {
        return 10; // 1 second floor
    }
    let computed = (5 * max_chunk_size) / rate_bytes_per_sec.max(1);
    computed.clamp(1, 10)
}

struct NodeSlot {
    own_quota: i64,
    rate: Rate,
    on_activate: Option<Box<dyn FnMut() + Send>>,
}

/// Handle a connection holds into a `ThrottleList`. Carries no state of its own; all mutable
/// state lives in the owning list, addressed by `id`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ThrottleNode {
    pub id: NodeId,
}

pub struct ThrottleList {
    enabled: bool,
    rate_cap: u32,
    slots: HashMap<NodeId, NodeSlot>,
    active: Vec<NodeId>,
    inactive: VecDeque<NodeId>,
    unallocated_quota: i64,
    unthrottled_reserve: i64,
    next_id: NodeId,
    min_chunk_size: u32,
    max_chunk_size: u32,
}

impl ThrottleList {
    /// `rate_cap` of `0` means unthrottled (the list starts disabled).
    pub fn new(rate_cap: u32) -> ThrottleList {
        let (min_chunk_size, max_chunk_size) = chunk_sizes_for_rate(rate_cap);
        ThrottleList {
            enabled: rate_cap > 0,
            rate_cap,
            slots: HashMap::new(),
            active: Vec::new(),
            inactive: VecDeque::new(),
            unallocated_quota: 0,
            unthrottled_reserve: 0,
            next_id: 0,
            min_chunk_size,
            max_chunk_size,
        }
    }

    pub fn min_chunk_size(&self) -> u32 {
        self.min_chunk_size
    }

    pub fn max_chunk_size(&self) -> u32 {
        self.max_chunk_size
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Register a new node, starting inactive (unless the list is disabled, in which case every
    /// node is active unconditionally). Returns a handle stable for the node's lifetime.
    pub fn insert<F>(&mut self, on_activate: F) -> ThrottleNode
    where
        F: FnMut() + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(
            id,
            NodeSlot {
                own_quota: 0,
                rate: Rate::new(),
                on_activate: Some(Box::new(on_activate)),
            },
        );
        if self.enabled {
            self.inactive.push_back(id);
        } else {
            self.active.push(id);
        }
        ThrottleNode { id }
    }

    /// Remove a node, reclaiming its held quota back into the pool.
    pub fn erase(&mut self, node: ThrottleNode) {
        if let Some(slot) = self.slots.remove(&node.id) {
            self.unallocated_quota += slot.own_quota.max(0);
        }
        self.active.retain(|&id| id != node.id);
        self.inactive.retain(|&id| id != node.id);
    }

    /// Disable the throttle: clear quotas and unconditionally activate every node.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.unallocated_quota = 0;
        self.unthrottled_reserve = 0;
        while let Some(id) = self.inactive.pop_front() {
            if let Some(slot) = self.slots.get_mut(&id) {
                slot.own_quota = 0;
                if let Some(cb) = slot.on_activate.as_mut() {
                    cb();
                }
            }
            self.active.push(id);
        }
        for id in self.active.iter() {
            if let Some(slot) = self.slots.get_mut(id) {
                slot.own_quota = 0;
            }
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Quota available to `node` right now: its own reserved quota plus whatever is sitting
    /// unallocated in the shared pool, or `i32::MAX/2` while the list is disabled.
    pub fn node_quota(&self, node: ThrottleNode) -> u32 {
        if !self.enabled {
            return (i32::MAX / 2) as u32;
        }
        let slot = match self.slots.get(&node.id) {
            Some(slot) => slot,
            None => return 0,
        };
        let available = slot.own_quota.max(0) + self.unallocated_quota.max(0);
        if available >= self.min_chunk_size as i64 {
            available as u32
        } else {
            0
        }
    }

    /// Debit `used` bytes: node's own quota first, the shared pool for the remainder. Both
    /// debits saturate at zero.
    pub fn node_used(&mut self, node: ThrottleNode, now_secs: u64, used: u32) {
        let mut remaining = used as i64;
        if let Some(slot) = self.slots.get_mut(&node.id) {
            let from_own = remaining.min(slot.own_quota.max(0));
            slot.own_quota -= from_own;
            remaining -= from_own;
            slot.rate.add(now_secs, used);
        }
        if remaining > 0 {
            self.unallocated_quota = (self.unallocated_quota - remaining).max(0);
        }
    }

    /// Debit the unthrottled reserve; spill any overage onto the throttled pool.
    pub fn node_used_unthrottled(&mut self, used: u32) {
        let used = used as i64;
        let from_reserve = used.min(self.unthrottled_reserve.max(0));
        self.unthrottled_reserve -= from_reserve;
        let overflow = used - from_reserve;
        if overflow > 0 {
            self.unallocated_quota = (self.unallocated_quota - overflow).max(0);
        }
    }

    /// Move `node` to the inactive tail (e.g. the connection stopped reading/writing).
    pub fn node_deactivate(&mut self, node: ThrottleNode) {
        if !self.slots.contains_key(&node.id) {
            return;
        }
        self.active.retain(|&id| id != node.id);
        // Freshly deactivated nodes go to the front of the inactive queue: they are the most
        // likely to already hold enough quota to reactivate next tick.
        self.inactive.push_front(node.id);
    }

    /// Recompute next tick's quota: sweep unused per-node quota back into the pool, add `quota`,
    /// distribute up to `max_chunk_size` to each inactive node (activating those that cross
    /// `min_chunk_size`), then cap the carried-over remainder at `quota` to bound growth.
    /// Returns the portion of `quota` actually absorbed.
    pub fn update_quota(&mut self, quota: u32, now_secs: u64) -> u32 {
        let _ = now_secs;
        if !self.enabled {
            return quota;
        }
        let (min_chunk, max_chunk) = chunk_sizes_for_rate(self.rate_cap);
        self.min_chunk_size = min_chunk;
        self.max_chunk_size = max_chunk;

        let mut pool: i64 = self.unallocated_quota.max(0);
        for slot in self.slots.values_mut() {
            pool += slot.own_quota.max(0);
            slot.own_quota = 0;
        }
        pool += quota as i64;

        // Refill the unthrottled reserve for the next round of node_used_unthrottled calls.
        self.unthrottled_reserve = min_chunk as i64;

        while let Some(&id) = self.inactive.front() {
            if pool <= 0 {
                break;
            }
            let give = pool.min(max_chunk as i64);
            pool -= give;
            let slot = self.slots.get_mut(&id).expect("inactive node must have a slot");
            slot.own_quota += give;
            if slot.own_quota >= min_chunk as i64 {
                self.inactive.pop_front();
                if let Some(cb) = slot.on_activate.as_mut() {
                    cb();
                }
                self.active.push(id);
            } else {
                break;
            }
        }

        // The leftover carried from prior ticks is capped at `quota` so the pool can't grow
        // without bound; the newly granted `quota` itself is always fully folded in.
        let overflow = (pool - quota as i64).max(0);
        pool -= overflow;
        self.unallocated_quota = pool;

        quota
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn inactive_count(&self) -> usize {
        self.inactive.len()
    }

    pub fn is_active(&self, node: ThrottleNode) -> bool {
        self.active.contains(&node.id)
    }

    pub fn node_rate(&self, node: ThrottleNode) -> u32 {
        self.slots.get(&node.id).map(|s| s.rate.rate()).unwrap_or(0)
    }

    /// Outstanding quota held across the pool and every node, for invariant checking.
    pub fn outstanding_quota(&self) -> i64 {
        self.unallocated_quota.max(0)
            + self.slots.values().map(|s| s.own_quota.max(0)).sum::<i64>()
    }
}
