//! Couples `ChunkSelector` to `TransferList` and presents the per-peer `delegate`/`finished`/
//! `cancel` API peer connections drive. Grounded in `bip_select::uber`'s
//! role as the module that owns both selection and transfer state for one torrent.

use crate::bitfield::Bitfield;
use crate::block::{BlockList, BlockTransfer, BlockTransferId, EraseOutcome, TransferState};
use crate::choke::PeerId;
use crate::config::STALL_THRESHOLD;
use crate::error::{DelegateErrorKind, DelegateResult};
use crate::priority::{PriorityClass, PriorityRanges};
use crate::selector::{ChunkSelector, INVALID_INDEX};
use crate::storage::Chunk;
use crate::transfer::TransferList;

#[derive(Debug, PartialEq, Eq)]
pub struct Delegation {
    pub transfer_id: BlockTransferId,
    pub chunk_index: u32,
    pub block_index: usize,
    pub offset: u32,
    pub length: u32,
}

pub struct Delegator {
    transfers: TransferList,
    aggressive_threshold: u32,
}

impl Delegator {
    pub fn new(aggressive_threshold: u32) -> Delegator {
        Delegator {
            transfers: TransferList::new(),
            aggressive_threshold,
        }
    }

    pub fn transfers(&self) -> &TransferList {
        &self.transfers
    }

    pub fn transfers_mut(&mut self) -> &mut TransferList {
        &mut self.transfers
    }

    fn in_flight_count(&self) -> u32 {
        self.transfers.order().count() as u32
    }

    /// `completed + in_flight + aggressive_threshold >= total`.
    fn is_aggressive(&self, completed: u32, total: u32) -> bool {
        completed + self.in_flight_count() + self.aggressive_threshold >= total
    }

    /// Find the next block to hand a peer in a chunk it is already downloading (the affinity
    /// rule): finish a piece already underway before starting a new one. Skips blocks the peer
    /// already holds a transfer on.
    fn find_affinity(&self, peer: PeerId, aggressive: bool) -> Option<(u32, usize)> {
        for chunk_index in self.transfers.order() {
            let list = self.transfers.get(chunk_index)?;
            let has_peer_transfer = list.blocks.iter().any(|block| {
                block
                    .transfers
                    .iter()
                    .any(|t| t.peer == peer && t.state != TransferState::Erased && !t.is_stalled(STALL_THRESHOLD))
            });
            if !has_peer_transfer {
                continue;
            }
            for (block_index, block) in list.blocks.iter().enumerate() {
                if block.is_finished() || block.transfers.iter().any(|t| t.peer == peer) {
                    continue;
                }
                if block.transfers.is_empty() || (aggressive && block.has_leader()) {
                    return Some((chunk_index, block_index));
                }
            }
        }
        None
    }

    /// Scan existing `BlockList`s of `class` priority for an unstalled unassigned block the peer
    /// can carry. In aggressive mode a block that already has a leader may be promoted to
    /// multi-download (a new `NOT_LEADER` transfer).
    fn find_in_flight(&mut self, peer: PeerId, peer_bitfield: &Bitfield, class: PriorityClass, aggressive: bool) -> Option<(u32, usize)> {
        for chunk_index in self.transfers.order().collect::<Vec<_>>() {
            if !peer_bitfield.get(chunk_index as usize) {
                continue;
            }
            let list = self.transfers.get(chunk_index)?;
            if list.priority != class {
                continue;
            }
            for (block_index, block) in list.blocks.iter().enumerate() {
                if block.is_finished() {
                    continue;
                }
                if block.transfers.is_empty() {
                    return Some((chunk_index, block_index));
                }
                if aggressive && block.has_leader() {
                    let already_has_peer = block.transfers.iter().any(|t| t.peer == peer);
                    if !already_has_peer {
                        return Some((chunk_index, block_index));
                    }
                }
            }
        }
        None
    }

    /// Public contract: `delegate(peer) -> Option<Delegation>`. Not finding one is non-fatal.
    #[allow(clippy::too_many_arguments)]
    pub fn delegate(
        &mut self,
        peer: PeerId,
        peer_bitfield: &Bitfield,
        selector: &mut ChunkSelector,
        priorities: &PriorityRanges,
        completed: u32,
        total: u32,
        chunk_size: impl Fn(u32) -> u32,
    ) -> Option<Delegation> {
        let aggressive = self.is_aggressive(completed, total);

        if let Some((chunk_index, block_index)) = self.find_affinity(peer, aggressive) {
            return self.assign(peer, chunk_index, block_index);
        }

        if let Some((chunk_index, block_index)) = self.find_in_flight(peer, peer_bitfield, PriorityClass::High, aggressive) {
            return self.assign(peer, chunk_index, block_index);
        }

        if let Some(chunk_index) = self.start_new(selector, peer_bitfield, priorities, PriorityClass::High) {
            let length = chunk_size(chunk_index);
            self.transfers.insert(chunk_index, length, PriorityClass::High, peer_bitfield.is_all_set());
            return self.assign(peer, chunk_index, 0);
        }

        if let Some((chunk_index, block_index)) = self.find_in_flight(peer, peer_bitfield, PriorityClass::Normal, aggressive) {
            return self.assign(peer, chunk_index, block_index);
        }

        if let Some(chunk_index) = self.start_new(selector, peer_bitfield, priorities, PriorityClass::Normal) {
            let length = chunk_size(chunk_index);
            self.transfers.insert(chunk_index, length, PriorityClass::Normal, peer_bitfield.is_all_set());
            return self.assign(peer, chunk_index, 0);
        }

        None
    }

    /// Start a new chunk restricted to `class`, so the `BlockList` it creates is labeled with the
    /// same priority the caller searched for.
    fn start_new(&mut self, selector: &mut ChunkSelector, peer_bitfield: &Bitfield, priorities: &PriorityRanges, class: PriorityClass) -> Option<u32> {
        let found = selector.find_in_class(peer_bitfield, priorities, class);
        if found == INVALID_INDEX {
            None
        } else {
            selector.using_index(found);
            Some(found)
        }
    }

    fn assign(&mut self, peer: PeerId, chunk_index: u32, block_index: usize) -> Option<Delegation> {
        let transfer_id = self.transfers.next_transfer_id();
        let list = self.transfers.get_mut(chunk_index)?;
        let block = list.blocks.get_mut(block_index)?;
        let length = block.length;
        let offset = BlockList::block_offset(block_index);

        if block.transfers.iter().any(|t| t.peer == peer && t.state != TransferState::Erased) {
            return None;
        }
        let transfer = BlockTransfer {
            id: transfer_id,
            peer,
            chunk_index,
            block_offset: offset,
            block_length: length,
            position: 0,
            stall_count: 0,
            failed_index: None,
            state: TransferState::Queued,
        };
        block.activate(transfer);
        Some(Delegation {
            transfer_id,
            chunk_index,
            block_index,
            offset,
            length,
        })
    }

    /// A transfer's byte stream reached `block.length` and delivered `bytes` for the block's
    /// region of `chunk`. If the block isn't finished yet, the bytes are written to storage and
    /// the block marked complete. If another transfer already finished this block (an
    /// aggressive-mode duplicate), `bytes` is instead compared against what's already stored; a
    /// mismatch records a divergent variant and stamps this transfer's `failed_index`, so a later
    /// hash failure can flag whichever peer's bytes turn out not to match the good variant.
    /// Returns the chunk index once every block in it is finished.
    pub fn finished(&mut self, chunk_index: u32, block_index: usize, transfer_id: BlockTransferId, chunk: &mut dyn Chunk, bytes: &[u8]) -> DelegateResult<Option<u32>> {
        let list = self
            .transfers
            .get_mut(chunk_index)
            .ok_or(DelegateErrorKind::UnknownTransfer { index: chunk_index })?;
        let total_blocks = list.blocks.len() as u32;
        let offset = BlockList::block_offset(block_index);
        let block = list
            .blocks
            .get_mut(block_index)
            .ok_or(DelegateErrorKind::PieceOutOfRange { index: block_index as u32, total: total_blocks })?;
        let length = block.length;

        if !block.is_finished() {
            chunk.from_buffer(bytes, offset, length);
            block.finish_leader();
            list.finished += 1;
        } else if !chunk.compare_buffer(bytes, offset, length) {
            let failed = &mut list.failed[block_index];
            failed.record(bytes);
            let variant_index = failed.index_of(bytes);
            if let Some(t) = block.transfers.iter_mut().find(|t| t.id == transfer_id) {
                t.failed_index = variant_index;
            }
        }

        if list.is_complete() {
            Ok(Some(chunk_index))
        } else {
            Ok(None)
        }
    }

    /// Remove a transfer (queued or active). Idempotent against an already-erased transfer.
    pub fn cancel(&mut self, chunk_index: u32, transfer_id: BlockTransferId) -> DelegateResult<()> {
        let list = self
            .transfers
            .get_mut(chunk_index)
            .ok_or(DelegateErrorKind::UnknownTransfer { index: chunk_index })?;
        for block in list.blocks.iter_mut() {
            if let Some(outcome) = block.erase(transfer_id) {
                if matches!(outcome, EraseOutcome::Leaderless) {
                    log::debug!("delegator: block in chunk {} left leaderless after cancel", chunk_index);
                }
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryChunk;
    use rand::rngs::mock::StepRng;

    fn all_ones(bits: usize) -> Bitfield {
        let mut b = Bitfield::new(bits);
        b.set_all();
        b
    }

    #[test]
    fn delegate_starts_a_new_high_piece_when_nothing_in_flight() {
        let mut delegator = Delegator::new(5);
        let completed = Bitfield::new(4);
        let mut rng = StepRng::new(0, 1);
        let mut selector = ChunkSelector::initialize(&completed, &mut rng);
        let mut priorities = PriorityRanges::new();
        priorities.insert(PriorityClass::High, 0, 4);
        let peer_bitfield = all_ones(4);

        let delegation = delegator
            .delegate(1, &peer_bitfield, &mut selector, &priorities, 0, 4, |_| BlockList::BLOCK_SIZE)
            .expect("expected a delegation");
        assert_eq!(delegation.block_index, 0);
        assert!(delegator.transfers.contains(delegation.chunk_index));
    }

    #[test]
    fn affinity_returns_peers_existing_unfinished_block_first() {
        let mut delegator = Delegator::new(5);
        let completed = Bitfield::new(4);
        let mut rng = StepRng::new(0, 1);
        let mut selector = ChunkSelector::initialize(&completed, &mut rng);
        let mut priorities = PriorityRanges::new();
        priorities.insert(PriorityClass::High, 0, 4);
        let peer_bitfield = all_ones(4);

        let first = delegator
            .delegate(1, &peer_bitfield, &mut selector, &priorities, 0, 4, |_| 2 * BlockList::BLOCK_SIZE)
            .unwrap();
        let second = delegator
            .delegate(1, &peer_bitfield, &mut selector, &priorities, 0, 4, |_| 2 * BlockList::BLOCK_SIZE)
            .unwrap();
        assert_eq!(first.chunk_index, second.chunk_index);
        assert_eq!(second.block_index, 1);
    }

    #[test]
    fn finished_reports_chunk_index_once_all_blocks_done() {
        let mut delegator = Delegator::new(5);
        let completed = Bitfield::new(1);
        let mut rng = StepRng::new(0, 1);
        let mut selector = ChunkSelector::initialize(&completed, &mut rng);
        let mut priorities = PriorityRanges::new();
        priorities.insert(PriorityClass::High, 0, 1);
        let peer_bitfield = all_ones(1);

        let delegation = delegator
            .delegate(1, &peer_bitfield, &mut selector, &priorities, 0, 1, |_| BlockList::BLOCK_SIZE)
            .unwrap();
        let mut chunk = MemoryChunk { bytes: vec![0u8; BlockList::BLOCK_SIZE as usize] };
        let bytes = vec![0u8; BlockList::BLOCK_SIZE as usize];
        let result = delegator
            .finished(delegation.chunk_index, delegation.block_index, delegation.transfer_id, &mut chunk, &bytes)
            .unwrap();
        assert_eq!(result, Some(delegation.chunk_index));
    }

    #[test]
    fn finished_flags_diverging_duplicate_as_corrupt() {
        let mut delegator = Delegator::new(0);
        let completed = Bitfield::new(1);
        let mut rng = StepRng::new(0, 1);
        let mut selector = ChunkSelector::initialize(&completed, &mut rng);
        let mut priorities = PriorityRanges::new();
        priorities.insert(PriorityClass::High, 0, 1);
        let peer_bitfield = all_ones(1);

        let to_a = delegator
            .delegate(1, &peer_bitfield, &mut selector, &priorities, 0, 1, |_| BlockList::BLOCK_SIZE)
            .unwrap();
        let to_b = delegator
            .delegate(2, &peer_bitfield, &mut selector, &priorities, 0, 1, |_| BlockList::BLOCK_SIZE)
            .expect("aggressive mode promotes a second transfer onto the same block");

        let mut chunk = MemoryChunk { bytes: vec![0u8; BlockList::BLOCK_SIZE as usize] };
        let good_bytes = vec![0xAAu8; BlockList::BLOCK_SIZE as usize];
        delegator
            .finished(to_a.chunk_index, to_a.block_index, to_a.transfer_id, &mut chunk, &good_bytes)
            .unwrap();

        let bad_bytes = vec![0xBBu8; BlockList::BLOCK_SIZE as usize];
        delegator
            .finished(to_b.chunk_index, to_b.block_index, to_b.transfer_id, &mut chunk, &bad_bytes)
            .unwrap();

        let list = delegator.transfers().get(to_a.chunk_index).unwrap();
        let block = &list.blocks[to_a.block_index];
        let b_transfer = block.find_transfer(to_b.transfer_id).unwrap();
        assert!(b_transfer.failed_index.is_some());

        let corrupt = delegator
            .transfers_mut()
            .hash_succeeded(to_a.chunk_index, &chunk, 0)
            .unwrap();
        assert_eq!(corrupt, vec![2]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut delegator = Delegator::new(5);
        let completed = Bitfield::new(1);
        let mut rng = StepRng::new(0, 1);
        let mut selector = ChunkSelector::initialize(&completed, &mut rng);
        let mut priorities = PriorityRanges::new();
        priorities.insert(PriorityClass::High, 0, 1);
        let peer_bitfield = all_ones(1);

        let delegation = delegator
            .delegate(1, &peer_bitfield, &mut selector, &priorities, 0, 1, |_| BlockList::BLOCK_SIZE)
            .unwrap();
        delegator.cancel(delegation.chunk_index, delegation.transfer_id).unwrap();
        delegator.cancel(delegation.chunk_index, delegation.transfer_id).unwrap();
    }
}
