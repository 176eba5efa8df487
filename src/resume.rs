//! Persisted torrent state: the completed bitfield, the completed-chunks rolling list (pruned
//! the same way the in-memory transfer list is) and the per-file baseline byte counters.
//! Grounded in the `IDiskMessage::AddTorrent` /
//! `ODiskMessage::FoundGoodPiece` round-trip exercised by `bip_disk/test/resume_torrent.rs`,
//! where a freshly-reloaded torrent re-discovers which pieces are already good on disk; here
//! that state is made explicit and serialized rather than rediscovered by rehashing.
//!
//! The wire format is a small versioned record, written with the same `byteorder` big-endian
//! convention used for wire messages elsewhere in this crate: no serde in this dependency set.

use byteorder::{BigEndian, ByteOrder};

use crate::bitfield::Bitfield;

const FORMAT_VERSION: u8 = 1;

/// Saved per-torrent state needed to resume without rehashing everything from scratch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeData {
    pub completed: Bitfield,
    pub completed_list: Vec<(u64, u32)>,
    pub file_baselines: Vec<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeError {
    Truncated,
    UnsupportedVersion(u8),
}

impl ResumeData {
    pub fn new(completed: Bitfield, file_baselines: Vec<u64>) -> ResumeData {
        ResumeData {
            completed,
            completed_list: Vec::new(),
            file_baselines,
        }
    }

    /// Serialize to bytes: version, chunk count, bitfield bytes, completed-list entries,
    /// per-file baseline counters.
    pub fn save(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(FORMAT_VERSION);

        let mut buf4 = [0u8; 4];
        BigEndian::write_u32(&mut buf4, self.completed.len() as u32);
        out.extend_from_slice(&buf4);
        out.extend_from_slice(self.completed.as_bytes());

        BigEndian::write_u32(&mut buf4, self.completed_list.len() as u32);
        out.extend_from_slice(&buf4);
        let mut buf8 = [0u8; 8];
        for &(timestamp_us, chunk_index) in &self.completed_list {
            BigEndian::write_u64(&mut buf8, timestamp_us);
            out.extend_from_slice(&buf8);
            BigEndian::write_u32(&mut buf4, chunk_index);
            out.extend_from_slice(&buf4);
        }

        BigEndian::write_u32(&mut buf4, self.file_baselines.len() as u32);
        out.extend_from_slice(&buf4);
        for &baseline in &self.file_baselines {
            BigEndian::write_u64(&mut buf8, baseline);
            out.extend_from_slice(&buf8);
        }

        out
    }

    /// Parse a record written by `save`. Rejects truncated input and unrecognized versions.
    pub fn load(bytes: &[u8]) -> Result<ResumeData, ResumeError> {
        let mut cursor = Cursor::new(bytes);

        let version = cursor.take_u8()?;
        if version != FORMAT_VERSION {
            return Err(ResumeError::UnsupportedVersion(version));
        }

        let chunk_count = cursor.take_u32()? as usize;
        let bitfield_bytes = cursor.take_bytes(chunk_count.div_ceil(8))?;
        let completed = Bitfield::from_bytes(bitfield_bytes, chunk_count);

        let completed_list_len = cursor.take_u32()? as usize;
        let mut completed_list = Vec::with_capacity(completed_list_len);
        for _ in 0..completed_list_len {
            let timestamp_us = cursor.take_u64()?;
            let chunk_index = cursor.take_u32()?;
            completed_list.push((timestamp_us, chunk_index));
        }

        let file_count = cursor.take_u32()? as usize;
        let mut file_baselines = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            file_baselines.push(cursor.take_u64()?);
        }

        Ok(ResumeData {
            completed,
            completed_list,
            file_baselines,
        })
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Cursor<'a> {
        Cursor { bytes, pos: 0 }
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], ResumeError> {
        if self.bytes.len() - self.pos < len {
            return Err(ResumeError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, ResumeError> {
        Ok(self.take_bytes(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, ResumeError> {
        Ok(BigEndian::read_u32(self.take_bytes(4)?))
    }

    fn take_u64(&mut self) -> Result<u64, ResumeError> {
        Ok(BigEndian::read_u64(self.take_bytes(8)?))
    }
}
