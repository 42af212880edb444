//! Side-car (`<path>.cinfo`) codec.
//!
//! The side-car records which blocks of the data file hold verified remote
//! bytes. Its layout is load-bearing: other readers of the cache directory
//! parse it, so encoding is fixed little-endian with no padding:
//!
//! ```text
//! header:  buffer_size: u64 | bit_count: u64
//!          fetched:      ceil(bit_count / 8) bytes
//!          write_called: ceil(bit_count / 8) bytes
//!          has_prefetch: u8
//!          prefetch:     ceil(bit_count / 8) bytes, iff has_prefetch == 1
//! records: { detach_time_secs: u64 | bytes_disk: u64
//!          | bytes_ram: u64 | bytes_missed: u64 } *
//! ```
//!
//! The header is rewritten in place on flush; IO-stat records are appended
//! on detach and never rewritten.

use std::io;

use bytes::{BufMut as _, Bytes, BytesMut};

use crate::stats::IoStatSnapshot;
use crate::storage::StorageHandle;

/// Fixed-size bit vector with one bit per block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    bits: Vec<u8>,
    nbits: u64,
}

impl BitField {
    /// All-zero field of `nbits` bits.
    #[must_use]
    pub fn new(nbits: u64) -> Self {
        Self {
            bits: vec![0u8; nbits.div_ceil(8) as usize],
            nbits,
        }
    }

    fn from_bytes(nbits: u64, bytes: &[u8]) -> Self {
        Self {
            bits: bytes.to_vec(),
            nbits,
        }
    }

    /// Number of bits.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.nbits
    }

    /// `true` when the field has zero bits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    /// Test bit `i`.
    #[must_use]
    pub fn test(&self, i: u32) -> bool {
        let i = u64::from(i);
        debug_assert!(i < self.nbits);
        self.bits[(i / 8) as usize] & (1 << (i % 8)) != 0
    }

    /// Set bit `i`. Bits are never cleared; the on-disk image only grows.
    pub fn set(&mut self, i: u32) {
        let i = u64::from(i);
        debug_assert!(i < self.nbits);
        self.bits[(i / 8) as usize] |= 1 << (i % 8);
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_set(&self) -> u64 {
        self.bits.iter().map(|b| u64::from(b.count_ones())).sum()
    }

    /// `true` when every bit is set.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count_set() == self.nbits
    }
}

/// Decoded side-car header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoHeader {
    /// Block size the cache image was written with.
    pub buffer_size: u64,
    /// Blocks present on disk.
    pub fetched: BitField,
    /// Blocks whose write-back has been recorded by a flush.
    pub write_called: BitField,
    /// Blocks brought in by the prefetcher, when tracked.
    pub prefetch: Option<BitField>,
}

/// One appended IO-stat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStatRecord {
    /// Unix time (seconds) the file was detached.
    pub detach_time_secs: u64,
    /// Byte counters at detach.
    pub stats: IoStatSnapshot,
}

const FIXED_PREFIX: usize = 16;
const RECORD_LEN: usize = 32;

impl InfoHeader {
    /// Fresh header for `bit_count` blocks of `buffer_size` bytes.
    #[must_use]
    pub fn fresh(buffer_size: u64, bit_count: u64, track_prefetch: bool) -> Self {
        Self {
            buffer_size,
            fetched: BitField::new(bit_count),
            write_called: BitField::new(bit_count),
            prefetch: track_prefetch.then(|| BitField::new(bit_count)),
        }
    }

    /// Encoded byte length of this header.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let bit_bytes = self.fetched.nbits.div_ceil(8) as usize;
        FIXED_PREFIX + 2 * bit_bytes + 1 + self.prefetch.as_ref().map_or(0, |_| bit_bytes)
    }

    fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        out.put_u64_le(self.buffer_size);
        out.put_u64_le(self.fetched.nbits);
        out.put_slice(&self.fetched.bits);
        out.put_slice(&self.write_called.bits);
        match &self.prefetch {
            Some(p) => {
                out.put_u8(1);
                out.put_slice(&p.bits);
            }
            None => out.put_u8(0),
        }
        out.freeze()
    }

    /// Read and decode the header from `handle`. Returns `Ok(None)` when the
    /// side-car is empty (a fresh cache file).
    pub async fn read(handle: &dyn StorageHandle) -> io::Result<Option<Self>> {
        let prefix = handle.read_at(0, FIXED_PREFIX).await?;
        if prefix.is_empty() {
            return Ok(None);
        }
        if prefix.len() < FIXED_PREFIX {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated cinfo header prefix",
            ));
        }
        let buffer_size = u64::from_le_bytes(prefix[0..8].try_into().map_err(io::Error::other)?);
        let bit_count = u64::from_le_bytes(prefix[8..16].try_into().map_err(io::Error::other)?);
        let bit_bytes = bit_count.div_ceil(8) as usize;

        let rest = handle
            .read_at(FIXED_PREFIX as u64, 2 * bit_bytes + 1 + bit_bytes)
            .await?;
        if rest.len() < 2 * bit_bytes + 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated cinfo bit vectors",
            ));
        }
        let fetched = BitField::from_bytes(bit_count, &rest[..bit_bytes]);
        let write_called = BitField::from_bytes(bit_count, &rest[bit_bytes..2 * bit_bytes]);
        let prefetch = match rest[2 * bit_bytes] {
            0 => None,
            _ => {
                let p = &rest[2 * bit_bytes + 1..];
                if p.len() < bit_bytes {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "truncated cinfo prefetch bits",
                    ));
                }
                Some(BitField::from_bytes(bit_count, &p[..bit_bytes]))
            }
        };

        Ok(Some(Self {
            buffer_size,
            fetched,
            write_called,
            prefetch,
        }))
    }

    /// Rewrite the header in place at offset 0.
    pub async fn write(&self, handle: &dyn StorageHandle) -> io::Result<()> {
        let encoded = self.encode();
        let mut written = 0;
        while written < encoded.len() {
            match handle
                .write_at(written as u64, encoded.slice(written..))
                .await
            {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl IoStatRecord {
    fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(RECORD_LEN);
        out.put_u64_le(self.detach_time_secs);
        out.put_u64_le(self.stats.bytes_disk);
        out.put_u64_le(self.stats.bytes_ram);
        out.put_u64_le(self.stats.bytes_missed);
        out.freeze()
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < RECORD_LEN {
            return None;
        }
        let f = |i: usize| -> Option<u64> {
            Some(u64::from_le_bytes(raw[i * 8..(i + 1) * 8].try_into().ok()?))
        };
        Some(Self {
            detach_time_secs: f(0)?,
            stats: IoStatSnapshot {
                bytes_disk: f(1)?,
                bytes_ram: f(2)?,
                bytes_missed: f(3)?,
            },
        })
    }

    /// Append this record after the header and any earlier records.
    pub async fn append(&self, handle: &dyn StorageHandle) -> io::Result<()> {
        let end = handle.len().await?;
        let encoded = self.encode();
        let mut written = 0;
        while written < encoded.len() {
            match handle
                .write_at(end + written as u64, encoded.slice(written..))
                .await
            {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read every record appended after `header`.
    pub async fn read_all(
        header: &InfoHeader,
        handle: &dyn StorageHandle,
    ) -> io::Result<Vec<Self>> {
        let start = header.encoded_len() as u64;
        let end = handle.len().await?;
        let raw = handle
            .read_at(start, end.saturating_sub(start) as usize)
            .await?;
        Ok(raw
            .chunks_exact(RECORD_LEN)
            .filter_map(Self::decode)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_semantics() {
        let mut f = BitField::new(10);
        assert_eq!(f.len(), 10);
        assert!(!f.is_full());
        for i in 0..10 {
            assert!(!f.test(i));
            f.set(i);
            assert!(f.test(i));
        }
        assert!(f.is_full());
        assert_eq!(f.count_set(), 10);
    }

    #[test]
    fn header_encoding_is_stable() {
        let mut h = InfoHeader::fresh(1 << 20, 12, true);
        h.fetched.set(0);
        h.fetched.set(11);
        h.write_called.set(0);

        let raw = h.encode();
        // 16 prefix + 2 bytes fetched + 2 write_called + 1 flag + 2 prefetch.
        assert_eq!(raw.len(), 23);
        assert_eq!(&raw[0..8], &(1u64 << 20).to_le_bytes());
        assert_eq!(&raw[8..16], &12u64.to_le_bytes());
        assert_eq!(raw[16], 0b0000_0001);
        assert_eq!(raw[17], 0b0000_1000);
        assert_eq!(raw[18], 0b0000_0001);
        assert_eq!(raw[20], 1);
    }
}
