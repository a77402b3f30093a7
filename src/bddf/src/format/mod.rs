//!
//! A BDDF file is composed of four sections: header, records, index and the trailer.
//! The index and the trailer only exist once a file has been finalized.
//!
//! ┌────────┬────────────────────────────────────┬─────────────┬──────────────┐
//! │ Header │              Records               │    Index    │   Trailer    │
//! │N bytes │              N bytes               │   N bytes   │   16 bytes   │
//! └────────┴────────────────────────────────────┴─────────────┴──────────────┘
//!
//! The header identifies the file and carries session metadata.  Its length is
//! stored right after the version so readers can skip unknown annotations.
//!
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                 Header                                  │
//! ├─────────┬─────────┬─────────┬─────────┬─────────┬──────────────┬────────┤
//! │  Magic  │ Version │   Len   │ Created │  Count  │ Annotations  │  CRC   │
//! │ 4 bytes │ 1 byte  │ 4 bytes │ 8 bytes │ 2 bytes │   N bytes    │4 bytes │
//! └─────────┴─────────┴─────────┴─────────┴─────────┴──────────────┴────────┘
//!
//! Records are self-delimiting: the fixed size record header carries the payload
//! length, so a reader can walk the file without the index.  The header CRC32 covers
//! the fields before it, so a damaged length is detected before it is trusted.  The
//! record CRC32 covers every header byte before it and the payload.  Descriptor records
//! declare a channel and always precede the first data record of that channel.
//!
//! ┌───────────────────────────────────────────────────────────────────────────────────────────┐
//! │                                          Record                                           │
//! ├────────┬──────┬──────┬─────────┬──────────┬───────────┬─────────┬───────┬───────┬─────────┤
//! │ Magic  │ Kind │ Type │ Channel │ Sequence │ Timestamp │   Len   │HdrCRC │  CRC  │ Payload │
//! │4 bytes │1 byte│1 byte│ 4 bytes │ 8 bytes  │  8 bytes  │ 4 bytes │4 bytes│4 bytes│ N bytes │
//! └────────┴──────┴──────┴─────────┴──────────┴───────────┴─────────┴───────┴───────┴─────────┘
//!
//! The index is itself framed as a record of kind index, so it is checksummed like any
//! other record and a sequential reader knows the data section ended when it sees it.
//! The trailer stores the offset of the index record, a CRC32 of that offset and a
//! closing magic, so a reader seeks from the end to find the index in O(1).
//!
//! ┌─────────┬─────────┬─────────┐
//! │Index Ofs│   CRC   │  Magic  │
//! │ 8 bytes │ 4 bytes │ 4 bytes │
//! └─────────┴─────────┴─────────┘
//!
//! All integers are big-endian.

use crate::{Error, Result};

pub mod block;
pub mod header;
pub mod trailer;

/// MAGIC is written as the first 4 bytes of a file to identify it as BDDF.
pub const MAGIC: [u8; 4] = *b"BDDF";

/// VERSION indicates the version of the file format.
pub const VERSION: u8 = 1;

/// BLOCK_MAGIC opens every record; readers resynchronize on it after corruption.
pub const BLOCK_MAGIC: u32 = 0xBDDF_0B1C;

/// size in bytes of a record header, checksums included
pub const BLOCK_HEADER_SIZE: usize = 38;

/// position of the header checksum within a record header
pub(crate) const HEADER_CRC_OFFSET: usize = 30;

/// TRAILER_MAGIC closes a finalized file.
pub const TRAILER_MAGIC: [u8; 4] = *b"XDDB";

/// size in bytes of the trailer
pub const TRAILER_SIZE: usize = 16;

/// size in bytes of an index entry
pub const INDEX_ENTRY_SIZE: usize = 28;

/// INDEX_SCHEMA_VERSION is bumped whenever the index payload layout changes.  Indexes with
/// another version are ignored and rebuilt by scanning.
pub const INDEX_SCHEMA_VERSION: u8 = 1;

/// Hard upper bound of a record payload.  A header declaring more is corrupt.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// BinaryReader decodes big-endian fields from a byte slice, failing on short input.
pub(crate) struct BinaryReader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> BinaryReader<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::InvalidFormat(format!(
                "{}: short buf: {} < {}",
                self.what,
                self.buf.len(),
                n
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut a = [0_u8; N];
        a.copy_from_slice(self.bytes(N)?);
        Ok(a)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    /// str16 reads a string prefixed by its 2 byte length.
    pub fn str16(&mut self) -> Result<String> {
        let n = self.u16()? as usize;
        let b = self.bytes(n)?;
        String::from_utf8(b.to_vec())
            .map_err(|e| Error::InvalidFormat(format!("{}: {}", self.what, e)))
    }

    /// finish fails if undecoded bytes remain.
    pub fn finish(self) -> Result<()> {
        if !self.buf.is_empty() {
            return Err(Error::InvalidFormat(format!(
                "{}: {} trailing bytes",
                self.what,
                self.buf.len()
            )));
        }
        Ok(())
    }
}

/// put_str16 appends s prefixed by its 2 byte length.
pub(crate) fn put_str16(b: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(Error::InvalidFormat(format!(
            "string too long: {} > {}",
            s.len(),
            u16::MAX
        )));
    }
    b.extend_from_slice(&(s.len() as u16).to_be_bytes());
    b.extend_from_slice(s.as_bytes());
    Ok(())
}
