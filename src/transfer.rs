//! Maps in-flight chunk index to `BlockList`, drives the hash verdicts that feed back into the
//! selector and the forensic reconstruction of a good variant after a hash failure. Grounded in
//! `bip_select::uber::UberModule`'s role as the single owner coupling selection state to
//! per-torrent transfer bookkeeping.

use std::collections::{HashMap, VecDeque};

use crate::block::{Block, BlockList, BlockTransferId, TransferIdGen};
use crate::choke::PeerId;
use crate::error::{DelegateErrorKind, DelegateResult};
use crate::priority::PriorityClass;
use crate::storage::Chunk;

const RETENTION_US: u64 = 30 * 60 * 1_000_000;

/// Outcome of a hash verdict, telling the caller what to do next.
pub enum HashVerdict {
    /// Chunk verified. Peers whose transfer held a stale failed-variant are corrupt and should
    /// be penalized (`slot_corrupt`).
    Succeeded { corrupt_peers: Vec<PeerId> },
    /// A better-supported variant emerged; it has been written back into the chunk. Re-hash it.
    Retry,
    /// No recoverable variant; the block list was reset and must be re-requested from peers.
    RequestAgain,
}

pub struct TransferList {
    lists: HashMap<u32, BlockList>,
    order: Vec<u32>,
    completed_list: VecDeque<(u64, u32)>,
    succeeded_count: u64,
    id_gen: TransferIdGen,
}

impl TransferList {
    pub fn new() -> TransferList {
        TransferList {
            lists: HashMap::new(),
            order: Vec::new(),
            completed_list: VecDeque::new(),
            succeeded_count: 0,
            id_gen: TransferIdGen::default(),
        }
    }

    pub fn next_transfer_id(&mut self) -> BlockTransferId {
        self.id_gen.allocate()
    }

    pub fn insert(&mut self, chunk_index: u32, chunk_length: u32, priority: PriorityClass, by_seeder: bool) -> &mut BlockList {
        self.order.push(chunk_index);
        self.lists
            .entry(chunk_index)
            .or_insert_with(|| BlockList::new(chunk_index, chunk_length, priority, by_seeder))
    }

    pub fn get(&self, chunk_index: u32) -> Option<&BlockList> {
        self.lists.get(&chunk_index)
    }

    pub fn get_mut(&mut self, chunk_index: u32) -> Option<&mut BlockList> {
        self.lists.get_mut(&chunk_index)
    }

    pub fn contains(&self, chunk_index: u32) -> bool {
        self.lists.contains_key(&chunk_index)
    }

    /// Iterate in-flight chunk indices in insertion order.
    pub fn order(&self) -> impl Iterator<Item = u32> + '_ {
        self.order.iter().copied()
    }

    pub fn succeeded_count(&self) -> u64 {
        self.succeeded_count
    }

    pub fn completed_list(&self) -> &VecDeque<(u64, u32)> {
        &self.completed_list
    }

    /// Remove entries older than the 30-minute retention window. Callers run this at most once
    /// per 60-minute scheduler tick.
    pub fn prune(&mut self, now_us: u64) {
        while let Some(&(t, _)) = self.completed_list.front() {
            if now_us.saturating_sub(t) > RETENTION_US {
                self.completed_list.pop_front();
            } else {
                break;
            }
        }
    }

    fn read_block_bytes(chunk: &dyn Chunk, block_index: usize, block: &Block) -> Vec<u8> {
        let mut buf = vec![0u8; block.length as usize];
        chunk.to_buffer(&mut buf, BlockList::block_offset(block_index), block.length);
        buf
    }

    /// Chunk verified by hash. Asserts every block finished, reconciles the failed-variants
    /// bookkeeping against the now-known-good bytes, and erases the `BlockList`.
    pub fn hash_succeeded(&mut self, chunk_index: u32, chunk: &dyn Chunk, now_us: u64) -> DelegateResult<Vec<PeerId>> {
        let list = self
            .lists
            .get_mut(&chunk_index)
            .ok_or(DelegateErrorKind::UnknownTransfer { index: chunk_index })?;
        debug_assert!(list.is_complete(), "hash_succeeded called on an incomplete BlockList");

        let mut corrupt_peers = Vec::new();
        for (block_index, (block, failed)) in list.blocks.iter().zip(list.failed.iter_mut()).enumerate() {
            if failed.is_empty() {
                continue;
            }
            let bytes = Self::read_block_bytes(chunk, block_index, block);
            let current = failed.set_current_matching(&bytes);
            let new_current = failed.index_of(&bytes);
            let _ = current;
            for transfer in &block.transfers {
                if let Some(fi) = transfer.failed_index {
                    if Some(fi) != new_current {
                        corrupt_peers.push(transfer.peer);
                    }
                }
            }
        }

        if !corrupt_peers.is_empty() {
            log::debug!("transfer: chunk {} verified, {} peer(s) marked corrupt", chunk_index, corrupt_peers.len());
        }
        self.completed_list.push_back((now_us, chunk_index));
        self.succeeded_count += 1;
        self.lists.remove(&chunk_index);
        self.order.retain(|&i| i != chunk_index);
        Ok(corrupt_peers)
    }

    /// Chunk failed hash. First failure: reconcile byte-variants per block and, if a better-
    /// supported variant emerged, write it back and ask the caller to retry hashing. Subsequent
    /// failures: reset the whole `BlockList` for re-request.
    pub fn hash_failed(&mut self, chunk_index: u32, chunk: &mut dyn Chunk) -> DelegateResult<HashVerdict> {
        let list = self
            .lists
            .get_mut(&chunk_index)
            .ok_or(DelegateErrorKind::UnknownTransfer { index: chunk_index })?;

        if list.attempt > 0 {
            list.do_all_failed();
            return Ok(HashVerdict::RequestAgain);
        }

        let mut promoted = 0usize;
        for (block_index, (block, failed)) in list.blocks.iter().zip(list.failed.iter_mut()).enumerate() {
            let bytes = Self::read_block_bytes(chunk, block_index, block);
            if failed.record(&bytes) {
                promoted += 1;
            }
        }

        if promoted > 0 {
            log::debug!("transfer: chunk {} hash failed, {} block(s) promoted a new variant, retrying", chunk_index, promoted);
            list.attempt = 1;
            for (block_index, (block, failed)) in list.blocks.iter().zip(list.failed.iter()).enumerate() {
                if let Some(bytes) = failed.current_bytes() {
                    chunk.from_buffer(bytes, BlockList::block_offset(block_index), block.length);
                }
            }
            Ok(HashVerdict::Retry)
        } else {
            list.do_all_failed();
            Ok(HashVerdict::RequestAgain)
        }
    }
}

impl Default for TransferList {
    fn default() -> TransferList {
        TransferList::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockTransfer, TransferState};
    use crate::storage::MemoryChunk;

    fn transfer(id: BlockTransferId, peer: PeerId, length: u32) -> BlockTransfer {
        BlockTransfer {
            id,
            peer,
            chunk_index: 0,
            block_offset: 0,
            block_length: length,
            position: length,
            stall_count: 0,
            failed_index: None,
            state: TransferState::Queued,
        }
    }

    #[test]
    fn hash_succeeded_erases_list_and_tracks_completed() {
        let mut list = TransferList::new();
        list.insert(3, BlockList::BLOCK_SIZE, PriorityClass::Normal, false);
        {
            let bl = list.get_mut(3).unwrap();
            bl.blocks[0].activate(transfer(1, 7, BlockList::BLOCK_SIZE));
            bl.blocks[0].finish_leader();
            bl.finished = 1;
        }
        let chunk = MemoryChunk { bytes: vec![0u8; BlockList::BLOCK_SIZE as usize] };
        let corrupt = list.hash_succeeded(3, &chunk, 1_000_000).unwrap();
        assert!(corrupt.is_empty());
        assert!(!list.contains(3));
        assert_eq!(list.succeeded_count(), 1);
        assert_eq!(list.completed_list().len(), 1);
    }

    #[test]
    fn hash_failed_first_attempt_records_variant_and_retries() {
        let mut list = TransferList::new();
        list.insert(5, BlockList::BLOCK_SIZE, PriorityClass::Normal, false);
        let mut chunk = MemoryChunk { bytes: vec![7u8; BlockList::BLOCK_SIZE as usize] };
        let verdict = list.hash_failed(5, &mut chunk).unwrap();
        assert!(matches!(verdict, HashVerdict::Retry));
        assert_eq!(list.get(5).unwrap().attempt, 1);
    }

    #[test]
    fn hash_failed_second_attempt_resets_block_list() {
        let mut list = TransferList::new();
        list.insert(5, BlockList::BLOCK_SIZE, PriorityClass::Normal, false);
        list.get_mut(5).unwrap().attempt = 1;
        list.get_mut(5).unwrap().finished = 1;
        let mut chunk = MemoryChunk { bytes: vec![1u8; BlockList::BLOCK_SIZE as usize] };
        let verdict = list.hash_failed(5, &mut chunk).unwrap();
        assert!(matches!(verdict, HashVerdict::RequestAgain));
        assert_eq!(list.get(5).unwrap().finished, 0);
    }

    #[test]
    fn prune_evicts_entries_older_than_retention() {
        let mut list = TransferList::new();
        list.completed_list.push_back((0, 1));
        list.completed_list.push_back((RETENTION_US + 1, 2));
        list.prune(RETENTION_US + 1);
        assert_eq!(list.completed_list.len(), 1);
        assert_eq!(list.completed_list[0].1, 2);
    }

    #[test]
    fn unknown_chunk_index_is_an_error() {
        let mut list = TransferList::new();
        let chunk = MemoryChunk { bytes: vec![0u8; 16] };
        assert!(list.hash_succeeded(99, &chunk, 0).is_err());
    }
}
