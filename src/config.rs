//! Tunables accepted by the engine, plus constants shared by the choke, throttle and delegator
//! modules.
//!
//! Built with the same chained-builder shape as `bip_disk::DiskManagerBuilder` and
//! `bip_select::UberModuleBuilder`: `Config::new().with_x(..).with_y(..)`.

/// Default block size used to split a piece into wire-level transfer units (2^14 bytes).
pub const BLOCK_SIZE: u32 = 1 << 14;

/// Maximum legal piece (block, in wire vocabulary) length: 2^17 bytes.
pub const MAX_PIECE_LENGTH: u32 = 1 << 17;

/// Maximum legal wire message length.
pub const MAX_MESSAGE_LEN: u32 = 1 << 20;

/// 30-bit weight ceiling used by the choke queue's band split.
pub const ORDER_BASE: u32 = 1 << 30;

/// Number of weight bands the choke queue divides candidates into.
pub const ORDER_MAX_SIZE: usize = 4;

/// Grace period (seconds) a peer must remain choked before it can be unchoked again.
pub const CHOKE_GRACE_SECS: u64 = 10;

/// Retention window (seconds) for `TransferList::completed_list` entries.
pub const COMPLETED_LIST_RETENTION_SECS: u64 = 30 * 60;

/// Minimum interval (seconds) between `TransferList` prune passes.
pub const COMPLETED_LIST_PRUNE_INTERVAL_SECS: u64 = 60 * 60;

/// Keep-alive timeout (seconds): a peer silent longer than this is disconnected.
pub const KEEP_ALIVE_TIMEOUT_SECS: u64 = 240;

/// Number of consecutive keep-alive intervals a transfer may receive no bytes before the
/// Delegator treats it as stalled and eligible for cancellation.
pub const STALL_THRESHOLD: u32 = 6;

#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of peers this torrent will unchoke for upload at once.
    pub max_unchoked: usize,
    /// Number of always-on "generous" unchoke slots reserved ahead of the optimistic rotation.
    pub generous_unchokes: usize,
    /// Minimum / maximum number of peer connections a torrent tries to maintain.
    pub min_peers: usize,
    pub max_peers: usize,
    /// Global (not per-peer) up/down rate caps in bytes/sec; `0` means unthrottled.
    pub rate_limit_up: u32,
    pub rate_limit_down: u32,
    /// Bypass the 10 second re-choke grace period for newly connected peers.
    pub flag_unchoke_all_new: bool,
    /// Number of remaining incomplete+in-flight pieces at which endgame/aggressive mode begins.
    pub aggressive_endgame_threshold: u32,
    /// Per-peer bounded partial-queue capacity: non-seeder vs. seeder (shared_queue).
    pub partial_queue_capacity: usize,
    pub shared_queue_capacity: usize,
    /// Weight tables used by `ChokeQueue::allocate_slots`/`cycle`, `{band0, band1, band2, band3}`.
    pub upload_choke_weights: [u32; 4],
    pub upload_unchoke_weights: [u32; 4],
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn with_max_unchoked(mut self, value: usize) -> Config {
        self.max_unchoked = value;
        self
    }

    pub fn with_generous_unchokes(mut self, value: usize) -> Config {
        self.generous_unchokes = value;
        self
    }

    pub fn with_peer_bounds(mut self, min_peers: usize, max_peers: usize) -> Config {
        self.min_peers = min_peers;
        self.max_peers = max_peers;
        self
    }

    pub fn with_rate_limits(mut self, up: u32, down: u32) -> Config {
        self.rate_limit_up = up;
        self.rate_limit_down = down;
        self
    }

    pub fn with_unchoke_all_new(mut self, value: bool) -> Config {
        self.flag_unchoke_all_new = value;
        self
    }

    pub fn with_aggressive_endgame_threshold(mut self, value: u32) -> Config {
        self.aggressive_endgame_threshold = value;
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_unchoked: 4,
            generous_unchokes: 3,
            min_peers: 30,
            max_peers: 50,
            rate_limit_up: 0,
            rate_limit_down: 0,
            flag_unchoke_all_new: false,
            aggressive_endgame_threshold: 5,
            partial_queue_capacity: 8,
            shared_queue_capacity: 32,
            upload_choke_weights: [1, 1, 1, 1],
            upload_unchoke_weights: [1, 3, 9, 0],
        }
    }
}
