//! Interfaces for the collaborators this crate consumes but does not implement: on-disk chunk
//! storage (`bip_disk`'s job), tracker requests (`bip_utracker`'s job) and SHA-1 hashing. Grounded
//! in `bip_disk::disk::fs::FileSystem` and `bip_util::sha::ShaHash` for the trait shapes, kept
//! here rather than in those crates since this core never links a real implementation of either.

/// Opaque handle returned by `ChunkStorage::create_chunk`.
pub trait Chunk {
    /// Copy `length` bytes starting at `offset` out of the chunk into `dst`.
    fn to_buffer(&self, dst: &mut [u8], offset: u32, length: u32);

    /// Copy `length` bytes from `src` into the chunk starting at `offset`.
    fn from_buffer(&mut self, src: &[u8], offset: u32, length: u32);

    /// Compare `length` bytes starting at `offset` against `src`, byte for byte.
    fn compare_buffer(&self, src: &[u8], offset: u32, length: u32) -> bool;
}

pub trait ChunkStorage {
    type Handle: Chunk;

    fn create_chunk(&self, index: u32, writable: bool) -> Result<Self::Handle, String>;

    fn chunk_index_size(&self, index: u32) -> u32;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
    None,
    Scrape,
}

pub struct TrackerResponse {
    pub peers: Vec<std::net::SocketAddr>,
    pub interval_seconds: u32,
}

pub trait TrackerSink {
    fn send_event(&self, event: TrackerEvent);
}

/// The core never links a real SHA-1 implementation; tests and callers supply one.
pub trait Sha1Hasher {
    fn hash(&self, bytes: &[u8]) -> [u8; 20];
}

/// In-memory `Chunk`/`ChunkStorage` used by tests, grounded in the fake filesystem
/// `bip_disk/test` uses for its in-memory disk manager tests.
#[cfg(test)]
pub struct MemoryChunk {
    pub bytes: Vec<u8>,
}

#[cfg(test)]
impl Chunk for MemoryChunk {
    fn to_buffer(&self, dst: &mut [u8], offset: u32, length: u32) {
        let start = offset as usize;
        let end = start + length as usize;
        dst[..length as usize].copy_from_slice(&self.bytes[start..end]);
    }

    fn from_buffer(&mut self, src: &[u8], offset: u32, length: u32) {
        let start = offset as usize;
        let end = start + length as usize;
        self.bytes[start..end].copy_from_slice(&src[..length as usize]);
    }

    fn compare_buffer(&self, src: &[u8], offset: u32, length: u32) -> bool {
        let start = offset as usize;
        let end = start + length as usize;
        self.bytes[start..end] == src[..length as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_chunk_round_trips_bytes() {
        let mut chunk = MemoryChunk { bytes: vec![0u8; 16] };
        chunk.from_buffer(&[1, 2, 3, 4], 4, 4);
        let mut out = [0u8; 4];
        chunk.to_buffer(&mut out, 4, 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(chunk.compare_buffer(&[1, 2, 3, 4], 4, 4));
        assert!(!chunk.compare_buffer(&[9, 9, 9, 9], 4, 4));
    }
}
