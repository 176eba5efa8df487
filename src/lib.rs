//! Peer-protocol engine core: chunk selection, delegation, choking and throttling, independent
//! of any particular disk or network backend.

#[macro_use]
extern crate error_chain;

pub mod bitfield;
pub mod block;
pub mod choke;
pub mod config;
pub mod delegator;
pub mod error;
pub mod peer;
pub mod priority;
pub mod rate;
pub mod resume;
pub mod scheduler;
pub mod selector;
pub mod storage;
pub mod throttle;
pub mod transfer;

pub use bitfield::Bitfield;
pub use block::{Block, BlockList, BlockTransfer, BlockTransferId};
pub use choke::manager::ChokeManager;
pub use choke::PeerId;
pub use delegator::{Delegation, Delegator};
pub use priority::{PriorityClass, PriorityRanges};
pub use resume::ResumeData;
pub use selector::{ChunkSelector, ChunkStatistics};
pub use transfer::{HashVerdict, TransferList};
