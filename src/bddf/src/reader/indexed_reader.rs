use std::sync::Arc;

use bddf_storage::{ByteSource, ByteSourceExt};
use common_base::iterator::AsyncIterator;
use common_base::time::TimeRange;

use crate::config::ReaderOptions;
use crate::format::block::{read_record, Block, RecordKind, RecordRead};
use crate::format::header::FileHeader;
use crate::format::trailer::Trailer;
use crate::format::{BLOCK_HEADER_SIZE, TRAILER_SIZE};
use crate::index::{scan, ChannelIndex, Index, IndexEntry};
use crate::series::{SeriesDescriptor, SeriesRegistry};
use crate::{Error, Result};

/// IndexedReader answers per channel and time range queries through an index.  The index
/// comes from the footer of a finalized file, or from a scan when the footer is missing,
/// damaged or inconsistent with the descriptor table; queries behave the same either way.
pub struct IndexedReader<R> {
    source: Arc<R>,
    options: ReaderOptions,
    header: FileHeader,
    registry: SeriesRegistry,
    index: Arc<Index>,
    /// End of the data section: the index record offset, or the end of the last complete
    /// record of a scanned file.
    data_end: u64,
    from_footer: bool,
}

impl<R: ByteSource> IndexedReader<R> {
    pub async fn open(source: R) -> Result<Self> {
        Self::open_with_options(source, ReaderOptions::default()).await
    }

    pub async fn open_with_options(source: R, options: ReaderOptions) -> Result<Self> {
        let source = Arc::new(source);
        let (header, header_len) = FileHeader::read_from(source.as_ref())
            .await?
            .ok_or_else(|| Error::InvalidFormat("incomplete file header".to_string()))?;

        let footer = match load_footer(source.as_ref(), header_len, &options).await {
            Ok(footer) => footer,
            Err(Error::IndexInconsistent(reason)) => {
                warn!("discarding index: {}", reason);
                None
            }
            Err(e) => return Err(e),
        };

        if let Some((index, registry, data_end)) = footer {
            debug!(
                "opened with footer index: {} channels, {} blocks",
                registry.len(),
                index.block_count()
            );
            return Ok(Self {
                source,
                options,
                header,
                registry,
                index: Arc::new(index),
                data_end,
                from_footer: true,
            });
        }

        let (index, reader) = scan(source.clone(), options.clone(), None).await?;
        info!(
            "rebuilt index by scanning: {} blocks, {} bytes skipped",
            index.block_count(),
            reader.skipped_bytes()
        );

        Ok(Self {
            source,
            options,
            header,
            registry: reader.registry().clone(),
            index: Arc::new(index),
            data_end: reader.position(),
            from_footer: false,
        })
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn registry(&self) -> &SeriesRegistry {
        &self.registry
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    /// is_from_footer reports whether the index was loaded from the footer rather than
    /// rebuilt by a scan.
    pub fn is_from_footer(&self) -> bool {
        self.from_footer
    }

    /// channels returns every declared channel in id order.
    pub fn channels(&self) -> Vec<Arc<SeriesDescriptor>> {
        self.registry.iter().cloned().collect()
    }

    pub fn descriptor(&self, channel_id: u32) -> Option<Arc<SeriesDescriptor>> {
        self.registry.lookup(channel_id)
    }

    pub fn descriptor_by_name(&self, name: &str) -> Option<Arc<SeriesDescriptor>> {
        self.registry.lookup_by_name(name)
    }

    /// time_range returns the min and max timestamps of a channel's blocks.
    pub fn time_range(&self, channel_id: u32) -> Option<TimeRange> {
        self.index.channel(channel_id).and_then(|c| c.time_range())
    }

    pub fn block_count(&self, channel_id: u32) -> usize {
        self.index.channel(channel_id).map_or(0, |c| c.len())
    }

    fn check_channel(&self, channel_id: u32) -> Result<()> {
        if self.registry.lookup(channel_id).is_none() {
            return Err(Error::UnknownChannel(channel_id));
        }
        Ok(())
    }

    /// blocks_for_channel iterates over every block of a channel in sequence order.
    pub fn blocks_for_channel(&self, channel_id: u32) -> Result<BlockIterator<R>> {
        self.check_channel(channel_id)?;
        let end = self.block_count(channel_id);
        Ok(self.iterator(channel_id, ScanOrder::Sequence, 0, end))
    }

    /// blocks_in_time_range iterates over the blocks of a channel whose timestamp lies in
    /// `[start, end]`, ordered by timestamp.
    pub fn blocks_in_time_range(
        &self,
        channel_id: u32,
        start: i64,
        end: i64,
    ) -> Result<BlockIterator<R>> {
        self.check_channel(channel_id)?;
        let range = self
            .index
            .channel(channel_id)
            .map_or(0..0, |c| c.time_range_positions(start, end));
        Ok(self.iterator(channel_id, ScanOrder::Time, range.start, range.end))
    }

    /// block_at_or_after returns the first block of a channel with a timestamp at or after
    /// timestamp, `None` if there is none.
    pub async fn block_at_or_after(
        &self,
        channel_id: u32,
        timestamp: i64,
    ) -> Result<Option<Block>> {
        self.check_channel(channel_id)?;
        let entry = match self.index.channel(channel_id) {
            Some(channel) => channel.by_time(channel.seek_time(timestamp)).copied(),
            None => None,
        };

        match entry {
            Some(entry) => Ok(Some(self.read_block(channel_id, &entry).await?)),
            None => Ok(None),
        }
    }

    /// read_block reads the block an index entry points at.
    pub async fn read_block(&self, channel_id: u32, entry: &IndexEntry) -> Result<Block> {
        read_indexed_block(
            self.source.as_ref(),
            channel_id,
            entry,
            self.data_end,
            self.options.max_payload_size,
        )
        .await
    }

    /// verify_index reads every indexed block back and checks that it matches its entry.
    pub async fn verify_index(&self) -> Result<()> {
        for channel_id in self.index.channel_ids() {
            if self.registry.lookup(channel_id).is_none() {
                return Err(Error::IndexInconsistent(format!(
                    "channel {} has blocks but no descriptor",
                    channel_id
                )));
            }

            let entries = self.index.channel(channel_id).map_or(&[][..], |c| c.entries());
            for entry in entries {
                let block = self.read_block(channel_id, entry).await.map_err(|e| {
                    Error::IndexInconsistent(format!("channel {}: {}", channel_id, e))
                })?;
                if block.timestamp != entry.timestamp || block.payload_len() != entry.payload_len {
                    return Err(Error::IndexInconsistent(format!(
                        "channel {}: block at {} does not match its entry {}",
                        channel_id, entry.offset, entry
                    )));
                }
            }
        }
        Ok(())
    }

    fn iterator(
        &self,
        channel_id: u32,
        order: ScanOrder,
        pos: usize,
        end: usize,
    ) -> BlockIterator<R> {
        BlockIterator {
            source: self.source.clone(),
            index: self.index.clone(),
            channel_id,
            order,
            pos,
            end,
            data_end: self.data_end,
            max_payload_size: self.options.max_payload_size,
        }
    }
}

/// load_footer reads the index named by the trailer and the descriptors named by the index.
/// Returns `None` if the file has no valid trailer or index record.
async fn load_footer<R: ByteSource + ?Sized>(
    source: &R,
    header_len: u64,
    options: &ReaderOptions,
) -> Result<Option<(Index, SeriesRegistry, u64)>> {
    let len = source.len().await?;
    if len < header_len + (BLOCK_HEADER_SIZE + TRAILER_SIZE) as u64 {
        return Ok(None);
    }

    let trailer_offset = len - TRAILER_SIZE as u64;
    let b = source.read_vec(trailer_offset, TRAILER_SIZE).await?;
    let trailer = match Trailer::unmarshal_binary(b.as_slice()) {
        Some(trailer) => trailer,
        None => {
            debug!("no footer, file was not finalized");
            return Ok(None);
        }
    };

    let index_offset = trailer.index_offset;
    let index_body = index_offset.checked_add(BLOCK_HEADER_SIZE as u64);
    if index_offset < header_len || index_body.map_or(true, |end| end > trailer_offset) {
        return Err(Error::InvalidFormat(format!(
            "footer points outside of the file: {} not in [{}, {})",
            index_offset, header_len, trailer_offset
        )));
    }

    let max_payload_size = options.max_payload_size;
    let record = read_record(source, index_offset, trailer_offset, max_payload_size).await?;
    let payload = match record {
        RecordRead::Complete(header, payload)
            if header.kind == RecordKind::Index && index_offset + header.size() == trailer_offset =>
        {
            payload
        }
        _ => {
            warn!("index record at {} is unreadable", index_offset);
            return Ok(None);
        }
    };
    let index = Index::unmarshal_binary(payload.as_ref()).map_err(inconsistent)?;

    let mut registry = SeriesRegistry::new();
    for (&channel_id, &offset) in index.descriptors() {
        let record = read_record(source, offset, index_offset, options.max_payload_size).await?;
        let descriptor = match record {
            RecordRead::Complete(header, payload)
                if header.kind == RecordKind::Descriptor && header.channel_id == channel_id =>
            {
                SeriesDescriptor::unmarshal_binary(channel_id, payload.as_ref())
                    .map_err(inconsistent)?
            }
            _ => {
                return Err(Error::IndexInconsistent(format!(
                    "no descriptor of channel {} at {}",
                    channel_id, offset
                )))
            }
        };
        registry.insert(descriptor).map_err(inconsistent)?;
    }

    for channel_id in index.channel_ids() {
        if registry.lookup(channel_id).is_none() {
            return Err(Error::IndexInconsistent(format!(
                "channel {} has blocks but no descriptor",
                channel_id
            )));
        }
        let last = index
            .channel(channel_id)
            .and_then(|c: &ChannelIndex| c.entries().iter().map(|e| e.offset).max());
        if last.map_or(false, |ofs| ofs >= index_offset) {
            return Err(Error::IndexInconsistent(format!(
                "channel {} has blocks past the data section",
                channel_id
            )));
        }
    }

    Ok(Some((index, registry, index_offset)))
}

fn inconsistent(e: Error) -> Error {
    match e {
        Error::IndexInconsistent(_) => e,
        e => Error::IndexInconsistent(e.to_string()),
    }
}

async fn read_indexed_block<R: ByteSource + ?Sized>(
    source: &R,
    channel_id: u32,
    entry: &IndexEntry,
    data_end: u64,
    max_payload_size: usize,
) -> Result<Block> {
    let corrupt = |reason: String| Error::CorruptBlock {
        offset: entry.offset,
        reason,
    };

    match read_record(source, entry.offset, data_end, max_payload_size).await? {
        RecordRead::Complete(header, payload) => {
            if header.kind != RecordKind::Data
                || header.channel_id != channel_id
                || header.sequence != entry.sequence
            {
                return Err(corrupt(format!(
                    "expected block {} of channel {}, found {:?} {} of channel {}",
                    entry.sequence, channel_id, header.kind, header.sequence, header.channel_id
                )));
            }
            Ok(Block::new(&header, payload, entry.offset))
        }
        RecordRead::Incomplete => Err(corrupt("block extends past the data section".to_string())),
        RecordRead::Corrupt(reason) => Err(corrupt(reason)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOrder {
    Sequence,
    Time,
}

/// BlockIterator lazily reads the blocks selected by an index query.  An error concerns
/// one block only: calling `try_next` again continues with the next one.
pub struct BlockIterator<R> {
    source: Arc<R>,
    index: Arc<Index>,
    channel_id: u32,
    order: ScanOrder,
    pos: usize,
    end: usize,
    data_end: u64,
    max_payload_size: usize,
}

impl<R> BlockIterator<R> {
    fn entry(&self, pos: usize) -> Option<IndexEntry> {
        let channel = self.index.channel(self.channel_id)?;
        match self.order {
            ScanOrder::Sequence => channel.entries().get(pos).copied(),
            ScanOrder::Time => channel.by_time(pos).copied(),
        }
    }

    /// remaining returns the number of blocks not yet read.
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }
}

#[async_trait]
impl<R: ByteSource> AsyncIterator for BlockIterator<R> {
    type Item = Block;
    type Error = Error;

    async fn try_next(&mut self) -> Result<Option<Self::Item>> {
        if self.pos >= self.end {
            return Ok(None);
        }

        let entry = match self.entry(self.pos) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        self.pos += 1;

        let block = read_indexed_block(
            self.source.as_ref(),
            self.channel_id,
            &entry,
            self.data_end,
            self.max_payload_size,
        )
        .await?;
        Ok(Some(block))
    }
}

#[cfg(test)]
mod tests {
    use bddf_storage::{memory_buffer, FileSink, FileSource, MmapSource};
    use bytes::Bytes;
    use common_base::iterator::{AsyncIterator, AsyncIteratorExt};
    use rand::{Rng, SeedableRng};

    use crate::config::{ReaderOptions, WriterOptions};
    use crate::format::TRAILER_SIZE;
    use crate::index::{finalize, Index};
    use crate::reader::{IndexedReader, ScanEntry, StreamReader};
    use crate::series::TypeMetadata;
    use crate::writer::BlockWriter;
    use crate::Error;

    fn blob() -> TypeMetadata {
        TypeMetadata::Blob {
            content_type: "application/octet-stream".to_string(),
        }
    }

    /// write_file writes n blocks spread over 3 channels with random timestamps in [0, 1000).
    async fn write_file(n: usize, build_index: bool) -> Bytes {
        let (sink, source) = memory_buffer();
        let options = WriterOptions {
            build_index,
            ..Default::default()
        };
        let mut writer = BlockWriter::create(sink, options).await.unwrap();
        let mut ids = vec![];
        for name in ["robot/odometry", "robot/battery", "robot/imu"] {
            ids.push(writer.register(name, blob()).await.unwrap());
        }

        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for i in 0..n {
            let channel = ids[rng.gen_range(0..ids.len())];
            let timestamp = rng.gen_range(0..1000_i64);
            writer
                .append(channel, timestamp, format!("block-{}", i).as_bytes())
                .await
                .unwrap();
        }
        writer.finish().await.unwrap();

        source.snapshot().await
    }

    /// linear_filter scans the whole file and keeps the blocks of channel_id in [start, end].
    async fn linear_filter(data: Bytes, channel_id: u32, start: i64, end: i64) -> Vec<(i64, u64)> {
        let mut reader = StreamReader::open(data, ReaderOptions::default())
            .await
            .unwrap();
        let mut selected = vec![];
        while let Some(entry) = reader.try_next().await.unwrap() {
            if let ScanEntry::Block(_, block) = entry {
                let ts = block.timestamp;
                if block.channel_id == channel_id && start <= ts && ts <= end {
                    selected.push((block.timestamp, block.sequence));
                }
            }
        }
        selected.sort();
        selected
    }

    #[tokio::test]
    async fn test_range_query_interleaved() {
        let data = write_file(1000, true).await;
        let reader = IndexedReader::open(data.clone()).await.unwrap();
        assert!(reader.is_from_footer());
        assert_eq!(reader.channels().len(), 3);

        let mut itr = reader.blocks_in_time_range(2, 400, 600).unwrap();
        let blocks = itr.try_collect().await.unwrap();
        let got: Vec<_> = blocks.iter().map(|b| (b.timestamp, b.sequence)).collect();

        let expected = linear_filter(data, 2, 400, 600).await;
        assert!(!expected.is_empty());
        assert_eq!(got, expected);
        assert!(blocks.iter().all(|b| b.channel_id == 2));

        reader.verify_index().await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_fallback() {
        let finalized = write_file(300, true).await;
        let unfinalized = write_file(300, false).await;

        let a = IndexedReader::open(finalized).await.unwrap();
        let b = IndexedReader::open(unfinalized).await.unwrap();
        assert!(a.is_from_footer());
        assert!(!b.is_from_footer());
        assert_eq!(a.index(), b.index());

        for channel_id in 0..3 {
            let x = a
                .blocks_for_channel(channel_id)
                .unwrap()
                .try_collect()
                .await
                .unwrap();
            let y = b
                .blocks_for_channel(channel_id)
                .unwrap()
                .try_collect()
                .await
                .unwrap();
            assert_eq!(x, y);
            assert!(x.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));
        }
    }

    #[tokio::test]
    async fn test_damaged_footer() {
        let data = write_file(50, true).await;

        // a trailer with a bad checksum is no trailer at all
        let mut damaged = data.to_vec();
        let n = damaged.len();
        damaged[n - TRAILER_SIZE] ^= 0x01;
        let reader = IndexedReader::open(Bytes::from(damaged)).await.unwrap();
        assert!(!reader.is_from_footer());
        assert_eq!(reader.index().block_count(), 50);

        // a valid trailer pointing past the end of the file breaks the framing
        let mut outside = data[..n - TRAILER_SIZE].to_vec();
        let trailer = crate::format::trailer::Trailer::new(n as u64 * 2);
        outside.extend_from_slice(&trailer.marshal_binary());
        assert!(matches!(
            IndexedReader::open(Bytes::from(outside)).await,
            Err(Error::InvalidFormat(_))
        ));

        // so does one whose offset wraps around when the record header is added
        let mut wrapping = data[..n - TRAILER_SIZE].to_vec();
        let trailer = crate::format::trailer::Trailer::new(u64::MAX - 5);
        wrapping.extend_from_slice(&trailer.marshal_binary());
        assert!(matches!(
            IndexedReader::open(Bytes::from(wrapping)).await,
            Err(Error::InvalidFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_inconsistent_index() {
        let unfinalized = write_file(20, false).await;
        let data_end = unfinalized.len() as u64;

        // an index whose descriptor table points at a data block
        let scanned = IndexedReader::open(unfinalized.clone()).await.unwrap();
        let mut bogus = Index::new();
        let entry = scanned.index().channel(0).unwrap().entries()[0];
        bogus.add_descriptor(0, entry.offset);
        bogus.add_block(0, entry);

        let mut data = unfinalized.to_vec();
        data.extend(finalize(&bogus, data_end).unwrap());
        let reader = IndexedReader::open(Bytes::from(data)).await.unwrap();
        assert!(!reader.is_from_footer());
        assert_eq!(reader.index(), scanned.index());
    }

    #[tokio::test]
    async fn test_block_at_or_after() {
        let data = write_file(200, true).await;
        let reader = IndexedReader::open(data).await.unwrap();

        let range = reader.time_range(1).unwrap();
        let first = reader.block_at_or_after(1, i64::MIN).await.unwrap().unwrap();
        assert_eq!(first.timestamp, range.min);

        let block = reader.block_at_or_after(1, 500).await.unwrap().unwrap();
        assert!(block.timestamp >= 500);
        let earlier = reader
            .blocks_in_time_range(1, 500, block.timestamp - 1)
            .unwrap();
        assert_eq!(earlier.remaining(), 0);

        assert!(reader
            .block_at_or_after(1, range.max + 1)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            reader.block_at_or_after(9, 0).await,
            Err(Error::UnknownChannel(9))
        ));
        assert!(reader.blocks_for_channel(9).is_err());
    }

    #[tokio::test]
    async fn test_corrupt_block_is_per_record() {
        let data = write_file(30, true).await;
        let reader = IndexedReader::open(data.clone()).await.unwrap();
        let entries = reader.index().channel(0).unwrap().entries().to_vec();
        assert!(entries.len() > 3);

        let mut damaged = data.to_vec();
        let victim = entries[1];
        damaged[(victim.offset + 20) as usize] ^= 0xff;
        let reader = IndexedReader::open(Bytes::from(damaged)).await.unwrap();
        assert!(reader.is_from_footer());
        assert!(reader.verify_index().await.is_err());

        let mut itr = reader.blocks_for_channel(0).unwrap();
        let mut ok = 0;
        let mut failed = 0;
        while itr.remaining() > 0 {
            match itr.try_next().await {
                Ok(Some(_)) => ok += 1,
                Ok(None) => break,
                Err(Error::CorruptBlock { offset, .. }) => {
                    assert_eq!(offset, victim.offset);
                    failed += 1;
                }
                Err(e) => panic!("unexpected {}", e),
            }
        }
        assert_eq!((ok, failed), (entries.len() - 1, 1));
    }

    #[tokio::test]
    async fn test_open_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("session.bddf");

        let sink = FileSink::create(&path).await.unwrap();
        let mut writer = BlockWriter::create(sink, WriterOptions::default())
            .await
            .unwrap();
        let id = writer.register("bosdyn-api/comment", blob()).await.unwrap();
        writer.append(id, 10, b"hello").await.unwrap();
        writer.append(id, 20, b"world").await.unwrap();
        writer.finish().await.unwrap();

        let reader = IndexedReader::open(FileSource::open(&path).await.unwrap())
            .await
            .unwrap();
        assert!(reader.is_from_footer());
        assert_eq!(reader.block_count(id), 2);

        let reader = IndexedReader::open(MmapSource::open(&path).await.unwrap())
            .await
            .unwrap();
        let descriptor = reader.descriptor_by_name("bosdyn-api/comment").unwrap();
        let block = reader
            .block_at_or_after(descriptor.channel_id, 11)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(block.payload.as_ref(), b"world");
    }
}
