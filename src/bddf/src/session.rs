use std::collections::{BTreeMap, HashMap};

use bddf_utils::time::now_nanos;

use crate::format::header::FileHeader;
use crate::series::SeriesRegistry;

/// Session is the state of one write session: the file header, the descriptor table, the
/// per channel sequence counters and the write cursor.  It is owned by the
/// [`crate::BlockWriter`] appending to the file.
#[derive(Debug, Clone)]
pub struct Session {
    header: FileHeader,
    registry: SeriesRegistry,
    sequences: HashMap<u32, u64>,
    write_offset: u64,
    block_count: u64,
}

impl Session {
    pub fn new(annotations: BTreeMap<String, String>) -> Self {
        Self::with_header(FileHeader::new(now_nanos(), annotations))
    }

    pub fn with_header(header: FileHeader) -> Self {
        Self {
            header,
            registry: SeriesRegistry::new(),
            sequences: HashMap::new(),
            write_offset: 0,
            block_count: 0,
        }
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn registry(&self) -> &SeriesRegistry {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut SeriesRegistry {
        &mut self.registry
    }

    /// next_sequence returns the sequence the next block of channel_id will get.
    pub fn next_sequence(&self, channel_id: u32) -> u64 {
        self.sequences.get(&channel_id).copied().unwrap_or(0)
    }

    /// write_offset is the position the next record is appended at.
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// block_count is the number of data blocks appended in this session.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub(crate) fn advance(&mut self, n: u64) {
        self.write_offset += n;
    }

    /// commit_block records a data block of size n bytes that was appended successfully.
    pub(crate) fn commit_block(&mut self, channel_id: u32, sequence: u64, n: u64) {
        self.sequences.insert(channel_id, sequence + 1);
        self.block_count += 1;
        self.advance(n);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}
