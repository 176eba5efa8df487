//! Per-block transfer bookkeeping for one in-flight chunk: leader/not-leader promotion on
//! erasure, and a `BlockList` grouping the blocks of one chunk.
//! Transfers are owned by value inside their `Block` rather than shared via `Rc<RefCell<_>>`;
//! callers outside this module hold a `BlockTransferId` handle, matching the arena-over-shared-
//! mutation pattern already used by `ThrottleList`'s `NodeId` handles.

use crate::choke::PeerId;
use crate::priority::PriorityClass;

pub type BlockTransferId = u64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockState {
    Incomplete,
    Completed,
    Invalid,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Leader,
    NotLeader,
    Erased,
}

/// Owning peer, piece (here: chunk index + block offset/length), byte position, stall counter,
/// and an optional index into the owning block's failed-variants list.
#[derive(Clone, Debug)]
pub struct BlockTransfer {
    pub id: BlockTransferId,
    pub peer: PeerId,
    pub chunk_index: u32,
    pub block_offset: u32,
    pub block_length: u32,
    pub position: u32,
    pub stall_count: u32,
    pub failed_index: Option<usize>,
    pub state: TransferState,
}

impl BlockTransfer {
    pub fn is_finished(&self) -> bool {
        self.state == TransferState::Leader && self.position == self.block_length
    }

    pub fn is_stalled(&self, threshold: u32) -> bool {
        self.stall_count >= threshold
    }
}

#[derive(Clone, Debug)]
struct Variant {
    bytes: Vec<u8>,
    refcount: u32,
}

/// Append-only list of distinct byte-variants observed for a block, with a `current` "working
/// hypothesis" index.
#[derive(Clone, Debug, Default)]
pub struct BlockFailed {
    variants: Vec<Variant>,
    current: Option<usize>,
}

impl BlockFailed {
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Record an observed byte slice: bump the refcount of a byte-equal existing variant, else
    /// append a new one. Returns `true` if this observation introduced a previously-unseen
    /// variant (a "promotion" worth re-hashing over, per `TransferList::hash_failed`).
    pub fn record(&mut self, bytes: &[u8]) -> bool {
        let is_new = match self.variants.iter().position(|v| v.bytes == bytes) {
            Some(pos) => {
                self.variants[pos].refcount += 1;
                false
            }
            None => {
                self.variants.push(Variant { bytes: bytes.to_vec(), refcount: 1 });
                true
            }
        };
        self.current = self.most_referenced_index();
        is_new
    }

    fn most_referenced_index(&self) -> Option<usize> {
        self.variants
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| v.refcount)
            .map(|(i, _)| i)
    }

    pub fn current_bytes(&self) -> Option<&[u8]> {
        self.current.and_then(|i| self.variants.get(i)).map(|v| v.bytes.as_slice())
    }

    /// Index of the variant matching `bytes` exactly, if any.
    pub fn index_of(&self, bytes: &[u8]) -> Option<usize> {
        self.variants.iter().position(|v| v.bytes == bytes)
    }

    /// Force `current` to the variant matching `bytes`, used once a chunk's hash has been
    /// verified. Returns the previous `current` index for comparison.
    pub fn set_current_matching(&mut self, bytes: &[u8]) -> Option<usize> {
        let previous = self.current;
        self.current = self.index_of(bytes);
        previous
    }
}

/// Outcome of erasing a transfer that was the leader.
pub enum EraseOutcome {
    Promoted(BlockTransferId),
    Leaderless,
}

/// One request-granularity block within an in-flight chunk. Owns `queued` (dispatched, no bytes
/// yet) and `transfers` (receiving or completed); at most one of `transfers` is the leader.
#[derive(Clone, Debug)]
pub struct Block {
    pub state: BlockState,
    pub queued: Vec<BlockTransfer>,
    pub transfers: Vec<BlockTransfer>,
    pub leader: Option<BlockTransferId>,
    pub length: u32,
}

impl Block {
    pub fn new(length: u32) -> Block {
        Block {
            state: BlockState::Incomplete,
            queued: Vec::new(),
            transfers: Vec::new(),
            leader: None,
            length,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == BlockState::Completed
    }

    pub fn has_leader(&self) -> bool {
        self.leader.is_some()
    }

    /// Move a queued transfer into `transfers`, becoming the leader if there is none yet,
    /// otherwise `NOT_LEADER` (aggressive-mode multi-download).
    pub fn activate(&mut self, mut transfer: BlockTransfer) {
        if self.leader.is_none() {
            transfer.state = TransferState::Leader;
            self.leader = Some(transfer.id);
        } else {
            transfer.state = TransferState::NotLeader;
        }
        self.transfers.push(transfer);
    }

    pub fn find_transfer(&self, id: BlockTransferId) -> Option<&BlockTransfer> {
        self.transfers.iter().find(|t| t.id == id).or_else(|| self.queued.iter().find(|t| t.id == id))
    }

    pub fn find_transfer_mut(&mut self, id: BlockTransferId) -> Option<&mut BlockTransfer> {
        if let Some(pos) = self.transfers.iter().position(|t| t.id == id) {
            return Some(&mut self.transfers[pos]);
        }
        self.queued.iter_mut().find(|t| t.id == id)
    }

    /// Mark the leader's byte stream complete. Caller has already written the final bytes.
    pub fn finish_leader(&mut self) {
        self.state = BlockState::Completed;
    }

    /// Erase a transfer, either queued or active. Idempotent against `ERASED`. If the erased
    /// transfer was the leader, promote the `NOT_LEADER` transfer with the largest byte position;
    /// if none remain, purge erased transfers and leave the block leaderless.
    pub fn erase(&mut self, id: BlockTransferId) -> Option<EraseOutcome> {
        if let Some(pos) = self.queued.iter().position(|t| t.id == id) {
            self.queued.remove(pos);
            return None;
        }

        let was_leader = self.leader == Some(id);
        if let Some(t) = self.transfers.iter_mut().find(|t| t.id == id) {
            if t.state == TransferState::Erased {
                return None;
            }
            t.state = TransferState::Erased;
        } else {
            return None;
        }

        if !was_leader {
            return None;
        }

        self.leader = None;
        let promoted = self
            .transfers
            .iter()
            .filter(|t| t.state == TransferState::NotLeader)
            .max_by_key(|t| t.position)
            .map(|t| t.id);

        match promoted {
            Some(winner) => {
                self.leader = Some(winner);
                if let Some(t) = self.transfers.iter_mut().find(|t| t.id == winner) {
                    t.state = TransferState::Leader;
                }
                Some(EraseOutcome::Promoted(winner))
            }
            None => {
                self.transfers.retain(|t| t.state != TransferState::Erased);
                self.state = BlockState::Incomplete;
                Some(EraseOutcome::Leaderless)
            }
        }
    }
}

/// All blocks for one in-flight chunk, plus the per-block failed-variants lists.
pub struct BlockList {
    pub chunk_index: u32,
    pub priority: PriorityClass,
    pub blocks: Vec<Block>,
    pub failed: Vec<BlockFailed>,
    pub finished: usize,
    pub attempt: u32,
    pub by_seeder: bool,
}

impl BlockList {
    pub const BLOCK_SIZE: u32 = 1 << 14;

    /// Split a chunk of `chunk_length` bytes into blocks of `BLOCK_SIZE`, last block short.
    pub fn new(chunk_index: u32, chunk_length: u32, priority: PriorityClass, by_seeder: bool) -> BlockList {
        let mut blocks = Vec::new();
        let mut remaining = chunk_length;
        while remaining > 0 {
            let len = remaining.min(Self::BLOCK_SIZE);
            blocks.push(Block::new(len));
            remaining -= len;
        }
        let failed = vec![BlockFailed::default(); blocks.len()];
        BlockList {
            chunk_index,
            priority,
            blocks,
            failed,
            finished: 0,
            attempt: 0,
            by_seeder,
        }
    }

    pub fn size(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_complete(&self) -> bool {
        self.finished == self.blocks.len()
    }

    pub fn block_offset(block_index: usize) -> u32 {
        block_index as u32 * Self::BLOCK_SIZE
    }

    /// Reset every block to incomplete and drop all leaders, for a retry after a hash failure
    /// with `attempt > 0`.
    pub fn do_all_failed(&mut self) {
        for block in self.blocks.iter_mut() {
            block.state = BlockState::Incomplete;
            block.leader = None;
            block.transfers.clear();
            block.queued.clear();
        }
        self.finished = 0;
    }
}

/// Monotonic id generator for `BlockTransfer`s, shared by all `BlockList`s in a `TransferList`.
#[derive(Default)]
pub struct TransferIdGen(BlockTransferId);

impl TransferIdGen {
    pub fn allocate(&mut self) -> BlockTransferId {
        self.0 += 1;
        self.0
    }
}
