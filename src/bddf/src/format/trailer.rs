use bytes::BufMut;

use crate::format::{TRAILER_MAGIC, TRAILER_SIZE};

/// Trailer closes a finalized file and locates its index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub index_offset: u64,
}

impl Trailer {
    pub fn new(index_offset: u64) -> Self {
        Self { index_offset }
    }

    pub fn marshal_binary(&self) -> [u8; TRAILER_SIZE] {
        let mut b = Vec::with_capacity(TRAILER_SIZE);
        b.put_u64(self.index_offset);
        b.put_u32(crc32fast::hash(&self.index_offset.to_be_bytes()));
        b.extend_from_slice(&TRAILER_MAGIC);

        let mut a = [0_u8; TRAILER_SIZE];
        a.copy_from_slice(b.as_slice());
        a
    }

    /// unmarshal_binary returns `None` if b is not a trailer: wrong size, magic or checksum.
    pub fn unmarshal_binary(b: &[u8]) -> Option<Self> {
        if b.len() != TRAILER_SIZE || b[12..] != TRAILER_MAGIC {
            return None;
        }

        let ofs: [u8; 8] = b[..8].try_into().ok()?;
        let crc: [u8; 4] = b[8..12].try_into().ok()?;
        if crc32fast::hash(&ofs) != u32::from_be_bytes(crc) {
            return None;
        }

        Some(Self {
            index_offset: u64::from_be_bytes(ofs),
        })
    }
}
