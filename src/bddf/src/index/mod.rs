use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::ops::Range;

use bddf_utils::time::unix_nano_to_time;
use bytes::BufMut;
use common_base::time::TimeRange;

use crate::format::{BinaryReader, INDEX_ENTRY_SIZE, INDEX_SCHEMA_VERSION};
use crate::{Error, Result};

mod indexer;

pub use indexer::*;

/// IndexEntry locates one data block of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub timestamp: i64,
    pub sequence: u64,

    /// The absolute position in the file where the block record starts.
    pub offset: u64,

    /// The size in bytes of the block payload.
    pub payload_len: u32,
}

impl IndexEntry {
    pub fn new(timestamp: i64, sequence: u64, offset: u64, payload_len: u32) -> Self {
        Self {
            timestamp,
            sequence,
            offset,
            payload_len,
        }
    }

    /// unmarshal_binary decodes an IndexEntry from a byte slice.
    pub fn unmarshal_binary(b: &[u8]) -> Result<Self> {
        if b.len() < INDEX_ENTRY_SIZE {
            return Err(Error::InvalidFormat(format!(
                "unmarshal_binary: short buf: {} < {}",
                b.len(),
                INDEX_ENTRY_SIZE
            )));
        }

        let mut r = BinaryReader::new(&b[..INDEX_ENTRY_SIZE], "index entry");
        Ok(Self {
            timestamp: r.i64()?,
            sequence: r.u64()?,
            offset: r.u64()?,
            payload_len: r.u32()?,
        })
    }

    /// append_to writes a binary-encoded version of IndexEntry to b.
    pub fn append_to(&self, b: &mut Vec<u8>) {
        b.put_i64(self.timestamp);
        b.put_u64(self.sequence);
        b.put_u64(self.offset);
        b.put_u32(self.payload_len);
    }
}

impl Display for IndexEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "time={} seq={} ofs={} len={}",
            unix_nano_to_time(self.timestamp),
            self.sequence,
            self.offset,
            self.payload_len,
        )
    }
}

/// ChannelIndex holds the entries of one channel in sequence order, plus a view of the same
/// entries sorted by `(timestamp, sequence)` for range queries.
///
/// Pushing an entry that sorts before the previous one marks the view stale instead of
/// inserting in place; `sort_by_time` restores it in one pass.  Queries on a stale view sort
/// a copy.
#[derive(Debug, Clone, Default)]
pub struct ChannelIndex {
    entries: Vec<IndexEntry>,
    by_time: Vec<u32>,
    stale: bool,
}

impl ChannelIndex {
    fn key(&self, i: u32) -> (i64, u64) {
        let e = &self.entries[i as usize];
        (e.timestamp, e.sequence)
    }

    pub fn push(&mut self, entry: IndexEntry) {
        let key = (entry.timestamp, entry.sequence);
        if self.by_time.last().map_or(false, |&i| self.key(i) > key) {
            self.stale = true;
        }

        self.by_time.push(self.entries.len() as u32);
        self.entries.push(entry);
    }

    /// sort_by_time brings the timestamp view up to date.
    pub fn sort_by_time(&mut self) {
        if !self.stale {
            return;
        }

        let entries = &self.entries;
        self.by_time.sort_unstable_by_key(|&i| {
            let e = &entries[i as usize];
            (e.timestamp, e.sequence)
        });
        self.stale = false;
    }

    fn time_view(&self) -> Cow<'_, [u32]> {
        if !self.stale {
            return Cow::Borrowed(self.by_time.as_slice());
        }

        let mut view = self.by_time.clone();
        view.sort_unstable_by_key(|&i| self.key(i));
        Cow::Owned(view)
    }

    /// entries returns the entries in sequence order.
    pub fn entries(&self) -> &[IndexEntry] {
        self.entries.as_slice()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// by_time returns the entry at pos of the timestamp ordered view.
    pub fn by_time(&self, pos: usize) -> Option<&IndexEntry> {
        let i = *self.time_view().get(pos)?;
        self.entries.get(i as usize)
    }

    /// seek_time returns the position in the timestamp view of the first entry at or after t.
    pub fn seek_time(&self, t: i64) -> usize {
        self.time_view()
            .partition_point(|&i| self.entries[i as usize].timestamp < t)
    }

    /// time_range_positions returns the positions in the timestamp view of the entries whose
    /// timestamp lies in `[start, end]`.
    pub fn time_range_positions(&self, start: i64, end: i64) -> Range<usize> {
        if start > end {
            return 0..0;
        }

        let view = self.time_view();
        let lo = view.partition_point(|&i| self.entries[i as usize].timestamp < start);
        let hi = view.partition_point(|&i| self.entries[i as usize].timestamp <= end);
        lo..hi.max(lo)
    }

    /// time_range returns the min and max timestamps, `None` if the channel has no blocks.
    pub fn time_range(&self) -> Option<TimeRange> {
        let mut entries = self.entries.iter();
        let first = entries.next()?.timestamp;
        let mut range = TimeRange::new(first, first);
        for e in entries {
            range.extend(e.timestamp);
        }
        Some(range)
    }
}

/// The timestamp view is derived from the entries.
impl PartialEq for ChannelIndex {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for ChannelIndex {}

/// Index maps every channel to the blocks it owns, and every channel to the offset of its
/// descriptor record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    descriptors: BTreeMap<u32, u64>,
    channels: BTreeMap<u32, ChannelIndex>,
    block_count: u64,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_descriptor(&mut self, channel_id: u32, offset: u64) {
        self.descriptors.insert(channel_id, offset);
    }

    pub fn add_block(&mut self, channel_id: u32, entry: IndexEntry) {
        self.channels.entry(channel_id).or_default().push(entry);
        self.block_count += 1;
    }

    /// sort_by_time brings the timestamp view of every channel up to date.
    pub fn sort_by_time(&mut self) {
        for channel in self.channels.values_mut() {
            channel.sort_by_time();
        }
    }

    /// descriptors returns the descriptor table: channel id to descriptor record offset.
    pub fn descriptors(&self) -> &BTreeMap<u32, u64> {
        &self.descriptors
    }

    pub fn channel(&self, channel_id: u32) -> Option<&ChannelIndex> {
        self.channels.get(&channel_id)
    }

    /// channel_ids returns the ids of channels with at least one block.
    pub fn channel_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.channels.keys().copied()
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn marshal_binary(&self) -> Vec<u8> {
        let entries = self.block_count as usize * INDEX_ENTRY_SIZE;
        let mut b = Vec::with_capacity(1 + 8 + 4 + self.descriptors.len() * 12 + 4 + entries);
        b.put_u8(INDEX_SCHEMA_VERSION);
        b.put_u64(self.block_count);

        b.put_u32(self.descriptors.len() as u32);
        for (&channel_id, &offset) in &self.descriptors {
            b.put_u32(channel_id);
            b.put_u64(offset);
        }

        b.put_u32(self.channels.len() as u32);
        for (&channel_id, channel) in &self.channels {
            b.put_u32(channel_id);
            b.put_u32(channel.len() as u32);
            for entry in channel.entries() {
                entry.append_to(&mut b);
            }
        }
        b
    }

    /// unmarshal_binary decodes an index payload.  A different schema version is reported as
    /// `IndexInconsistent` so readers rebuild the index instead of failing.
    pub fn unmarshal_binary(b: &[u8]) -> Result<Self> {
        let mut r = BinaryReader::new(b, "index");

        let version = r.u8()?;
        if version != INDEX_SCHEMA_VERSION {
            return Err(Error::IndexInconsistent(format!(
                "index schema version {}. expected {}",
                version, INDEX_SCHEMA_VERSION
            )));
        }
        let block_count = r.u64()?;

        let mut index = Index::new();
        let n = r.u32()?;
        for _ in 0..n {
            let channel_id = r.u32()?;
            let offset = r.u64()?;
            index.add_descriptor(channel_id, offset);
        }

        let n = r.u32()?;
        for _ in 0..n {
            let channel_id = r.u32()?;
            let count = r.u32()?;
            for _ in 0..count {
                let entry = IndexEntry::unmarshal_binary(r.bytes(INDEX_ENTRY_SIZE)?)?;
                index.add_block(channel_id, entry);
            }
        }
        r.finish()?;
        index.sort_by_time();

        if index.block_count != block_count {
            return Err(Error::IndexInconsistent(format!(
                "block count {} but {} entries",
                block_count, index.block_count
            )));
        }
        Ok(index)
    }
}
