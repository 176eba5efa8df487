//! Weighted unchoke selection across a pool of connection nodes. Two
//! logical vectors, `queued` (candidates waiting for a slot) and `unchoked` (holders of a
//! slot); weights are 30-bit values clamped to `order_base = 2^30` and grouped into
//! `order_max_size = 4` bands by dividing by `order_base`.

pub mod manager;
pub mod resource;

use std::collections::HashMap;

use rand::Rng;

use crate::config::{CHOKE_GRACE_SECS, ORDER_BASE, ORDER_MAX_SIZE};
use crate::error::{ChokeErrorKind, ChokeResult};

pub type PeerId = u64;

#[derive(Clone, Debug)]
struct PeerState {
    weight: u32,
    snubbed: bool,
    time_last_choke: Option<u64>,
    unchoked: bool,
}

impl PeerState {
    fn new() -> PeerState {
        PeerState {
            weight: 0,
            snubbed: false,
            time_last_choke: None,
            unchoked: false,
        }
    }
}

/// Weighted unchoke selector. Generic over direction (upload/download) by simply being handed a
/// different weight table and weight function at each call site; the queue itself holds no
/// direction-specific logic.
pub struct ChokeQueue {
    peers: HashMap<PeerId, PeerState>,
    queued_order: Vec<PeerId>,
    max_unchoked: usize,
    flag_unchoke_all_new: bool,
}

impl ChokeQueue {
    pub fn new(max_unchoked: usize) -> ChokeQueue {
        ChokeQueue {
            peers: HashMap::new(),
            queued_order: Vec::new(),
            max_unchoked,
            flag_unchoke_all_new: false,
        }
    }

    pub fn with_unchoke_all_new(mut self, value: bool) -> ChokeQueue {
        self.flag_unchoke_all_new = value;
        self
    }

    pub fn set_max_unchoked(&mut self, value: usize) {
        self.max_unchoked = value;
    }

    pub fn queued_len(&self) -> usize {
        self.peers.values().filter(|p| !p.unchoked).count()
    }

    pub fn unchoked_len(&self) -> usize {
        self.peers.values().filter(|p| p.unchoked).count()
    }

    pub fn is_unchoked(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).map(|p| p.unchoked).unwrap_or(false)
    }

    pub fn is_queued(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).map(|p| !p.unchoked && !p.snubbed).unwrap_or(false)
    }

    pub fn is_snubbed(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).map(|p| p.snubbed).unwrap_or(false)
    }

    /// All peers currently tracked, queued or unchoked.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Add `peer` to the queued pool. A no-op if already tracked.
    pub fn set_queued(&mut self, peer: PeerId) {
        self.peers.entry(peer).or_insert_with(PeerState::new);
        if !self.queued_order.contains(&peer) {
            self.queued_order.push(peer);
        }
    }

    /// Remove `peer` from tracking entirely (inverse of `set_queued`, vectors and counters
    /// return to their pre-`set_queued` state).
    pub fn set_not_queued(&mut self, peer: PeerId) {
        if self.peers.get(&peer).map(|p| !p.unchoked).unwrap_or(false) {
            self.peers.remove(&peer);
            self.queued_order.retain(|&p| p != peer);
        }
    }

    /// Snubbed peers are excluded from the unchoke rotation; invariant: never both snubbed and
    /// queued.
    pub fn set_snubbed(&mut self, peer: PeerId) -> ChokeResult<()> {
        let state = self
            .peers
            .get_mut(&peer)
            .ok_or(ChokeErrorKind::UnknownPeer { id: peer })?;
        state.snubbed = true;
        if !state.unchoked {
            self.queued_order.retain(|&p| p != peer);
        }
        log::debug!("choke: peer {} snubbed", peer);
        Ok(())
    }

    pub fn set_not_snubbed(&mut self, peer: PeerId) -> ChokeResult<()> {
        let state = self
            .peers
            .get_mut(&peer)
            .ok_or(ChokeErrorKind::UnknownPeer { id: peer })?;
        state.snubbed = false;
        if !state.unchoked && !self.queued_order.contains(&peer) {
            self.queued_order.push(peer);
        }
        log::debug!("choke: peer {} no longer snubbed", peer);
        Ok(())
    }

    /// Drop all knowledge of `peer` (connection closed).
    pub fn disconnected(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
        self.queued_order.retain(|&p| p != peer);
    }

    fn grace_elapsed(&self, peer: &PeerState, now_secs: u64) -> bool {
        self.flag_unchoke_all_new
            || match peer.time_last_choke {
                None => true,
                Some(t) => now_secs.saturating_sub(t) >= CHOKE_GRACE_SECS,
            }
    }

    /// Weight-band index for a raw weight value.
    fn band_of(weight: u32) -> usize {
        ((weight / ORDER_BASE) as usize).min(ORDER_MAX_SIZE - 1)
    }

    /// Stable-sort `ids` by weight descending, partition into bands, and distribute `want` slots
    /// across bands proportionally to `table`, handing any remainder out starting at a random
    /// band offset so that, averaged over many calls, allocation matches the weight vector
    /// exactly. Shared by both ranking directions: `allocate_slots` calls this over the whole
    /// eligible pool with the unchoke table to pick promotion winners; `cycle` calls it over just
    /// the unchoked pool with the choke table to pick demotion targets.
    fn rank_top<R: Rng>(ids: &[PeerId], want: usize, table: [u32; ORDER_MAX_SIZE], weights: &HashMap<PeerId, u32>, rng: &mut R) -> Vec<PeerId> {
        let mut ordered: Vec<PeerId> = ids.to_vec();
        ordered.sort_by(|a, b| weights[b].cmp(&weights[a]));

        let mut bands: Vec<Vec<PeerId>> = vec![Vec::new(); ORDER_MAX_SIZE];
        for id in ordered {
            let band = Self::band_of(weights[&id]);
            bands[band].push(id);
        }

        let total_table_weight: u32 = (0..ORDER_MAX_SIZE)
            .filter(|&i| !bands[i].is_empty())
            .map(|i| table[i])
            .sum();

        let mut selected = Vec::new();
        let mut per_band_quota = [0usize; ORDER_MAX_SIZE];
        if total_table_weight > 0 {
            for i in 0..ORDER_MAX_SIZE {
                if bands[i].is_empty() {
                    continue;
                }
                let share = (want as u64 * table[i] as u64) / total_table_weight as u64;
                per_band_quota[i] = (share as usize).min(bands[i].len());
            }
        }

        for i in 0..ORDER_MAX_SIZE {
            for &id in bands[i].iter().take(per_band_quota[i]) {
                selected.push(id);
            }
        }

        // Largest-remainder method: bands whose exact (non-integer) share got rounded down the
        // most get first claim on the leftover slots, so heavier bands are favored over lighter
        // ones even when nobody's quota divides evenly. Ties (equal remainder) are broken by a
        // random rotation offset so that, averaged over many calls, ties resolve fairly.
        let mut remaining = want.saturating_sub(selected.len());
        if remaining > 0 && total_table_weight > 0 {
            let offset = rng.gen_range(0..ORDER_MAX_SIZE);
            let mut remainders = [0u64; ORDER_MAX_SIZE];
            for i in 0..ORDER_MAX_SIZE {
                if bands[i].is_empty() {
                    continue;
                }
                let numerator = want as u64 * table[i] as u64;
                remainders[i] = numerator % total_table_weight as u64;
            }
            let mut order: Vec<usize> = (0..ORDER_MAX_SIZE).filter(|&i| !bands[i].is_empty()).collect();
            order.sort_by(|&a, &b| {
                remainders[b].cmp(&remainders[a]).then_with(|| {
                    let rank = |i: usize| (i + ORDER_MAX_SIZE - offset) % ORDER_MAX_SIZE;
                    rank(a).cmp(&rank(b))
                })
            });

            'fill: while remaining > 0 {
                let mut progressed = false;
                for &band in &order {
                    let already_taken = per_band_quota[band];
                    if bands[band].len() > already_taken {
                        selected.push(bands[band][already_taken]);
                        per_band_quota[band] += 1;
                        remaining -= 1;
                        progressed = true;
                        if remaining == 0 {
                            break 'fill;
                        }
                    }
                }
                if !progressed {
                    break;
                }
            }
        } else if remaining > 0 {
            let offset = rng.gen_range(0..ORDER_MAX_SIZE);
            'fill: while remaining > 0 {
                let mut progressed = false;
                for k in 0..ORDER_MAX_SIZE {
                    let band = (offset + k) % ORDER_MAX_SIZE;
                    let already_taken = per_band_quota[band];
                    if bands[band].len() > already_taken {
                        selected.push(bands[band][already_taken]);
                        per_band_quota[band] += 1;
                        remaining -= 1;
                        progressed = true;
                        if remaining == 0 {
                            break 'fill;
                        }
                    }
                }
                if !progressed {
                    break;
                }
            }
        }

        selected
    }

    /// Recompute weights for every tracked, non-snubbed peer using `slot_weight` and rank them
    /// against the unchoke weight `table` (see `rank_top`) to pick `self.max_unchoked` winners.
    pub fn allocate_slots<W, R>(&mut self, table: [u32; ORDER_MAX_SIZE], mut slot_weight: W, rng: &mut R) -> Vec<PeerId>
    where
        W: FnMut(PeerId) -> u32,
        R: Rng,
    {
        let eligible: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, state)| !state.snubbed)
            .map(|(&id, _)| id)
            .collect();

        let weights: HashMap<PeerId, u32> = eligible.iter().map(|&id| (id, slot_weight(id))).collect();
        for (&id, &weight) in &weights {
            if let Some(state) = self.peers.get_mut(&id) {
                state.weight = weight;
            }
        }

        Self::rank_top(&eligible, self.max_unchoked, table, &weights, rng)
    }

    /// Bring `|unchoked|` to `max_unchoked`, promoting from `queued` (subject to
    /// `slot_can_unchoke` permission and the re-choke grace period) or demoting from `unchoked`.
    pub fn balance<W, C, R>(&mut self, now_secs: u64, table: [u32; ORDER_MAX_SIZE], slot_weight: W, mut slot_can_unchoke: C, rng: &mut R)
    where
        W: FnMut(PeerId) -> u32,
        C: FnMut(PeerId) -> bool,
        R: Rng,
    {
        let winners = self.allocate_slots(table, slot_weight, rng);
        let winners_set: std::collections::HashSet<PeerId> = winners.into_iter().collect();

        let currently_unchoked: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, s)| s.unchoked)
            .map(|(&id, _)| id)
            .collect();
        for id in currently_unchoked {
            if !winners_set.contains(&id) {
                self.demote(id, now_secs);
            }
        }

        for id in winners_set {
            let eligible = self
                .peers
                .get(&id)
                .map(|s| !s.unchoked && !s.snubbed && self.grace_elapsed(s, now_secs))
                .unwrap_or(false);
            if eligible && self.unchoked_len() < self.max_unchoked && slot_can_unchoke(id) {
                self.promote(id);
            }
        }
    }

    fn promote(&mut self, id: PeerId) {
        if let Some(state) = self.peers.get_mut(&id) {
            state.unchoked = true;
        }
        self.queued_order.retain(|&p| p != id);
        log::debug!("choke: promoted peer {} to unchoked", id);
    }

    fn demote(&mut self, id: PeerId, now_secs: u64) {
        if let Some(state) = self.peers.get_mut(&id) {
            state.unchoked = false;
            state.time_last_choke = Some(now_secs);
        }
        if !self.queued_order.contains(&id) {
            self.queued_order.push(id);
        }
        log::debug!("choke: demoted peer {} to queued", id);
    }

    /// Rotate up to `max(winners-needing-promotion, min(max_alternate, quota))` slots, where
    /// `max_alternate` scales with pool size. Unlike `balance`, which re-ranks and resettles the
    /// whole pool, `cycle` only ever touches `rotate_budget` peers on each side: the currently-
    /// unchoked peers not among the unchoke-table winners are ranked again against the separate
    /// choke-direction table and weight function (mirroring the original's distinct
    /// `unchoke_range`/`choke_range` passes) to pick the weakest `rotate_budget` for demotion;
    /// then the strongest eligible winners not yet unchoked are promoted into any slots that
    /// frees up (or that were already open). Returns the number of promotions actually made (the
    /// "delta").
    #[allow(clippy::too_many_arguments)]
    pub fn cycle<WU, WC, C, R>(
        &mut self,
        now_secs: u64,
        quota: usize,
        unchoke_table: [u32; ORDER_MAX_SIZE],
        choke_table: [u32; ORDER_MAX_SIZE],
        unchoke_weight: WU,
        mut choke_weight: WC,
        mut slot_can_unchoke: C,
        rng: &mut R,
    ) -> usize
    where
        WU: FnMut(PeerId) -> u32,
        WC: FnMut(PeerId) -> u32,
        C: FnMut(PeerId) -> bool,
        R: Rng,
    {
        let pool_size = self.peers.len();
        let max_alternate = if pool_size < 20 {
            (self.unchoked_len() as f64 / 8.0).ceil() as usize
        } else {
            (self.unchoked_len() as f64 / 10.0).ceil() as usize
        };
        let allowance = max_alternate.min(quota).max(1);
        let before = self.unchoked_len();

        let candidates_needing_promotion = self
            .peers
            .iter()
            .filter(|(_, s)| !s.unchoked && !s.snubbed && self.grace_elapsed(s, now_secs))
            .count();
        let rotate_budget = candidates_needing_promotion.min(self.max_unchoked).max(allowance).min(quota.max(allowance));

        let winners = self.allocate_slots(unchoke_table, unchoke_weight, rng);
        let winners_set: std::collections::HashSet<PeerId> = winners.into_iter().collect();

        let demotion_candidates: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(id, s)| s.unchoked && !winners_set.contains(id))
            .map(|(&id, _)| id)
            .collect();
        let choke_weights: HashMap<PeerId, u32> = demotion_candidates.iter().map(|&id| (id, choke_weight(id))).collect();
        let demotions = Self::rank_top(&demotion_candidates, rotate_budget, choke_table, &choke_weights, rng);
        for id in demotions {
            self.demote(id, now_secs);
        }

        let mut promotions: Vec<PeerId> = winners_set
            .into_iter()
            .filter(|id| {
                self.peers
                    .get(id)
                    .map(|s| !s.unchoked && !s.snubbed && self.grace_elapsed(s, now_secs))
                    .unwrap_or(false)
            })
            .collect();
        promotions.sort_by_key(|id| std::cmp::Reverse(self.peers[id].weight));
        promotions.truncate(rotate_budget);
        for id in promotions {
            if self.unchoked_len() >= self.max_unchoked {
                break;
            }
            if slot_can_unchoke(id) {
                self.promote(id);
            }
        }

        let after = self.unchoked_len();
        after.saturating_sub(before).max(before.saturating_sub(after)).min(allowance.max(1))
    }
}

/// Default upload-unchoke weight function: fast downloaders are strongly
/// preferred (band 2), slow downloaders and everyone else not currently downloading from us fall
/// into the optimistic-unchoke band (band 1).
pub fn upload_unchoke_weight<R: Rng>(downloading_from_us: bool, download_rate: u32, rng: &mut R) -> u32 {
    if downloading_from_us {
        if download_rate < 1000 {
            ORDER_BASE
        } else {
            2 * ORDER_BASE + download_rate
        }
    } else {
        ORDER_BASE + rng.gen_range(0..1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn can_unchoke_always(_: PeerId) -> bool {
        true
    }

    #[test]
    fn balance_respects_max_unchoked() {
        let mut queue = ChokeQueue::new(4);
        for id in 0..10u64 {
            queue.set_queued(id);
        }
        let mut rng = StepRng::new(0, 1);
        queue.balance(100, [1, 3, 9, 0], |id| id as u32, can_unchoke_always, &mut rng);
        assert!(queue.unchoked_len() <= 4);
    }

    #[test]
    fn snubbed_is_never_queued() {
        let mut queue = ChokeQueue::new(4);
        queue.set_queued(1);
        queue.set_snubbed(1).unwrap();
        assert!(!queue.is_queued(1));
        assert!(queue.is_snubbed(1));
    }

    #[test]
    fn set_queued_then_not_queued_is_a_no_op() {
        let mut queue = ChokeQueue::new(4);
        let before_len = queue.peers.len();
        queue.set_queued(42);
        queue.set_not_queued(42);
        assert_eq!(queue.peers.len(), before_len);
        assert!(!queue.is_queued(42));
    }

    #[test]
    fn cycle_bounds_promotions_to_rotate_budget() {
        let mut queue = ChokeQueue::new(20);
        for id in 0..20u64 {
            queue.set_queued(id);
        }
        let mut rng = StepRng::new(0, 1);
        // Fill every slot first so `cycle`'s only job afterwards is rotation, not backfill.
        queue.balance(0, [1, 1, 1, 1], |id| id as u32, can_unchoke_always, &mut rng);
        assert_eq!(queue.unchoked_len(), 20);

        let before_unchoked: std::collections::HashSet<PeerId> = (0..20u64).filter(|&id| queue.is_unchoked(id)).collect();

        // Reverse the weight order entirely: every previously-unchoked peer is now the weakest,
        // every previously-queued peer is now the strongest. An unbounded re-balance would swap
        // all 20; `cycle` must only rotate a small, budgeted slice.
        queue.cycle(100, 3, [1, 1, 1, 1], [1, 1, 1, 1], |id| 20 - id as u32, |id| 20 - id as u32, can_unchoke_always, &mut rng);
        assert_eq!(queue.unchoked_len(), 20);

        let still_unchoked = before_unchoked.iter().filter(|&&id| queue.is_unchoked(id)).count();
        let swapped = before_unchoked.len() - still_unchoked;
        assert!(swapped <= 3, "cycle swapped {} peers, expected <= 3 (rotate_budget)", swapped);
    }

    #[test]
    fn grace_period_blocks_immediate_rechoke() {
        let mut queue = ChokeQueue::new(1);
        queue.set_queued(1);
        queue.set_queued(2);
        let mut rng = StepRng::new(0, 1);
        // peer 1 wins the single slot with a higher weight.
        queue.balance(0, [1, 3, 9, 0], |id| if id == 1 { 3_000_000_000 } else { 1_000_000_000 }, can_unchoke_always, &mut rng);
        assert!(queue.is_unchoked(1));
        // Now peer 2 outweighs peer 1, forcing a demotion...
        queue.balance(1, [1, 3, 9, 0], |id| if id == 2 { 3_000_000_000 } else { 1_000_000_000 }, can_unchoke_always, &mut rng);
        assert!(!queue.is_unchoked(1));
        // ...but peer 1 cannot be re-unchoked again until the grace period elapses.
        queue.balance(2, [1, 3, 9, 0], |id| if id == 1 { 3_000_000_000 } else { 1_000_000_000 }, can_unchoke_always, &mut rng);
        assert!(!queue.is_unchoked(1));
        queue.balance(11, [1, 3, 9, 0], |id| if id == 1 { 3_000_000_000 } else { 1_000_000_000 }, can_unchoke_always, &mut rng);
        assert!(queue.is_unchoked(1));
    }
}
