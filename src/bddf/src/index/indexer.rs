use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bddf_storage::{ByteSink, ByteSource, ByteSourceExt, FileSink, FileSource};
use common_base::iterator::AsyncIterator;

use crate::config::ReaderOptions;
use crate::format::block::{encode_record, read_record, Block, RecordKind, RecordRead};
use crate::format::BLOCK_MAGIC;
use crate::format::trailer::Trailer;
use crate::index::{Index, IndexEntry};
use crate::reader::{ScanEntry, StreamReader};
use crate::series::TypeKind;
use crate::{Error, Result};

/// CancelFlag stops a long running scan.  It is checked between blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl From<&Block> for IndexEntry {
    fn from(block: &Block) -> Self {
        IndexEntry::new(
            block.timestamp,
            block.sequence,
            block.offset,
            block.payload_len(),
        )
    }
}

/// FileIndexer accumulates an [`Index`], either fed by a writer as it appends or by a scan
/// over an existing file.
#[derive(Debug, Default)]
pub struct FileIndexer {
    index: Index,
}

impl FileIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_descriptor(&mut self, channel_id: u32, offset: u64) {
        self.index.add_descriptor(channel_id, offset);
    }

    pub fn add_block(&mut self, channel_id: u32, entry: IndexEntry) {
        self.index.add_block(channel_id, entry);
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn into_index(mut self) -> Index {
        self.index.sort_by_time();
        self.index
    }
}

/// build_index rebuilds the index of source by scanning it from the start.
pub async fn build_index<R: ByteSource>(source: R) -> Result<Index> {
    let (index, _) = scan(source, ReaderOptions::default(), None).await?;
    Ok(index)
}

/// build_index_with_cancel is [`build_index`] returning `Cancelled` once cancel is set.
pub async fn build_index_with_cancel<R: ByteSource>(
    source: R,
    options: ReaderOptions,
    cancel: &CancelFlag,
) -> Result<Index> {
    let (index, _) = scan(source, options, Some(cancel)).await?;
    Ok(index)
}

/// scan drives a stream reader over the whole of source and returns the index together
/// with the reader, positioned at the end of the data section.
pub(crate) async fn scan<R: ByteSource>(
    source: R,
    options: ReaderOptions,
    cancel: Option<&CancelFlag>,
) -> Result<(Index, StreamReader<R>)> {
    let mut reader = StreamReader::open(source, options).await?;
    let mut indexer = FileIndexer::new();

    while let Some(entry) = reader.try_next().await? {
        if let ScanEntry::Block(_, block) = entry {
            indexer.add_block(block.channel_id, IndexEntry::from(&block));
        }

        if cancel.map_or(false, |c| c.is_cancelled()) {
            return Err(Error::Cancelled);
        }
    }

    for (&channel_id, &offset) in reader.descriptor_offsets() {
        indexer.add_descriptor(channel_id, offset);
    }
    Ok((indexer.into_index(), reader))
}

/// finalize serializes index as the footer of a file whose data section ends at
/// index_offset: the index record followed by the trailer.
pub fn finalize(index: &Index, index_offset: u64) -> Result<Vec<u8>> {
    let payload = index.marshal_binary();
    if payload.len() > u32::MAX as usize {
        return Err(Error::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }

    let mut b = encode_record(
        RecordKind::Index,
        TypeKind::Blob,
        0,
        0,
        0,
        payload.as_slice(),
    );
    b.extend_from_slice(&Trailer::new(index_offset).marshal_binary());
    Ok(b)
}

/// find_complete_record returns the first offset in `(from, to)` holding a complete record
/// with valid checksums.
async fn find_complete_record<R: ByteSource + ?Sized>(
    source: &R,
    from: u64,
    to: u64,
    options: &ReaderOptions,
) -> Result<Option<u64>> {
    let start = from + 1;
    if start >= to {
        return Ok(None);
    }

    let buf = source.read_vec(start, (to - start) as usize).await?;
    let magic = BLOCK_MAGIC.to_be_bytes();
    for (i, w) in buf.windows(magic.len()).enumerate() {
        if w != magic {
            continue;
        }

        let candidate = start + i as u64;
        if let RecordRead::Complete(..) =
            read_record(source, candidate, to, options.max_payload_size).await?
        {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// finalize_file makes the file at path support random access: the index is recomputed by
/// a scan and the footer is replaced if it differs from the one on disk.  An incomplete
/// record at the end of the file is dropped.  Returns whether the file was rewritten.
///
/// The file is left untouched if a valid record follows the point where the scan stopped,
/// since truncating there would drop data.
pub async fn finalize_file(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let source = FileSource::open(path).await?;
    let options = ReaderOptions::default();
    let (index, reader) = scan(source, options.clone(), None).await?;
    if reader.header().is_none() {
        return Err(Error::InvalidFormat(format!(
            "{}: incomplete file header",
            path.display()
        )));
    }
    if reader.is_exhausted() {
        return Err(Error::CorruptBlock {
            offset: reader.position(),
            reason: "no block found within the resync window".to_string(),
        });
    }

    let data_end = reader.position();
    let footer_offset = reader.footer_offset();
    let footer = finalize(&index, data_end)?;

    let source = reader.into_inner();
    let len = source.len().await?;
    if footer_offset.is_none() {
        if let Some(next) = find_complete_record(&source, data_end, len, &options).await? {
            return Err(Error::CorruptBlock {
                offset: data_end,
                reason: format!("incomplete record followed by a valid record at {}", next),
            });
        }
    }
    if len == data_end + footer.len() as u64 {
        let existing = source.read_vec(data_end, footer.len()).await?;
        if existing == footer {
            debug!("{}: footer up to date", path.display());
            return Ok(false);
        }
    }
    drop(source);

    let mut sink = FileSink::open_append(path).await?;
    sink.truncate(data_end).await?;
    sink.append(footer.as_slice()).await?;
    sink.sync().await?;

    info!(
        "{}: wrote index of {} blocks at {}, dropped {} trailing bytes",
        path.display(),
        index.block_count(),
        data_end,
        len - data_end
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use bddf_storage::{memory_buffer, ByteSink, FileSink};
    use bytes::Bytes;

    use crate::config::{ReaderOptions, WriterOptions};
    use crate::format::block::{encode_record, RecordKind};
    use crate::format::BLOCK_HEADER_SIZE;
    use crate::index::{build_index, build_index_with_cancel, finalize_file, CancelFlag};
    use crate::series::{TypeKind, TypeMetadata};
    use crate::writer::BlockWriter;
    use crate::Error;

    fn blob() -> TypeMetadata {
        TypeMetadata::Blob {
            content_type: "application/octet-stream".to_string(),
        }
    }

    #[tokio::test]
    async fn test_incremental_equals_bulk() {
        let (sink, source) = memory_buffer();
        let mut writer = BlockWriter::create(sink, WriterOptions::default())
            .await
            .unwrap();

        let a = writer.register("a", blob()).await.unwrap();
        writer.append(a, 30, b"1").await.unwrap();
        let b = writer.register("b", blob()).await.unwrap();
        writer.append(b, 10, b"22").await.unwrap();
        writer.append(a, 20, b"333").await.unwrap();
        writer.append(b, 40, b"").await.unwrap();

        let (_, incremental) = writer.finish().await.unwrap();
        let incremental = incremental.unwrap();

        let bulk = build_index(source.snapshot().await).await.unwrap();
        assert_eq!(bulk, incremental);
        assert_eq!(bulk.block_count(), 4);
    }

    #[tokio::test]
    async fn test_build_index_cancel() {
        let (sink, source) = memory_buffer();
        let mut writer = BlockWriter::create(sink, WriterOptions::default())
            .await
            .unwrap();
        let a = writer.register("a", blob()).await.unwrap();
        for i in 0..10 {
            writer.append(a, i, b"x").await.unwrap();
        }

        let cancel = CancelFlag::new();
        let index = build_index_with_cancel(source.clone(), ReaderOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(index.block_count(), 10);

        cancel.cancel();
        assert!(matches!(
            build_index_with_cancel(source, ReaderOptions::default(), &cancel).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_finalize_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("session.bddf");

        let sink = FileSink::create(&path).await.unwrap();
        let options = WriterOptions {
            build_index: false,
            ..Default::default()
        };
        let mut writer = BlockWriter::create(sink, options).await.unwrap();
        let a = writer.register("a", blob()).await.unwrap();
        for i in 0..5 {
            writer.append(a, i * 10, b"payload").await.unwrap();
        }
        let (mut sink, _) = writer.finish().await.unwrap();
        // a record torn by a crash
        sink.append(&[0xBD, 0xDF, 0x0B, 0x1C, 2, 3]).await.unwrap();
        sink.sync().await.unwrap();
        drop(sink);

        assert!(finalize_file(&path).await.unwrap());
        let finalized = tokio::fs::read(&path).await.unwrap();
        assert!(!finalize_file(&path).await.unwrap());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), finalized);

        let index = build_index(Bytes::from(finalized)).await.unwrap();
        assert_eq!(index.block_count(), 5);
    }

    #[tokio::test]
    async fn test_finalize_file_damaged_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("session.bddf");

        let sink = FileSink::create(&path).await.unwrap();
        let options = WriterOptions {
            build_index: false,
            ..Default::default()
        };
        let mut writer = BlockWriter::create(sink, options).await.unwrap();
        let a = writer.register("a", blob()).await.unwrap();
        let mut offsets = vec![];
        for i in 0..10 {
            offsets.push(writer.offset());
            writer.append(a, i, &[i as u8; 16]).await.unwrap();
        }
        writer.finish().await.unwrap();

        // one flipped bit in the length field of the third block
        let mut b = tokio::fs::read(&path).await.unwrap();
        let len_before = b.len();
        b[offsets[2] as usize + 26] ^= 0x01;
        tokio::fs::write(&path, &b).await.unwrap();

        assert!(finalize_file(&path).await.unwrap());
        let finalized = tokio::fs::read(&path).await.unwrap();
        assert!(finalized.len() > len_before);

        let index = build_index(Bytes::from(finalized)).await.unwrap();
        assert_eq!(index.block_count(), 9);
        let timestamps: Vec<_> = index
            .channel(a)
            .unwrap()
            .entries()
            .iter()
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(timestamps, vec![0, 1, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_finalize_file_keeps_records_after_short_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("session.bddf");

        let sink = FileSink::create(&path).await.unwrap();
        let options = WriterOptions {
            build_index: false,
            ..Default::default()
        };
        let mut writer = BlockWriter::create(sink, options).await.unwrap();
        let a = writer.register("a", blob()).await.unwrap();
        for i in 0..3 {
            writer.append(a, i, b"payload").await.unwrap();
        }
        let (mut sink, _) = writer.finish().await.unwrap();

        // a record cut short, followed by an intact one
        let short = encode_record(RecordKind::Data, TypeKind::Blob, a, 3, 30, &[1; 100]);
        sink.append(&short[..BLOCK_HEADER_SIZE + 10]).await.unwrap();
        let late = encode_record(RecordKind::Data, TypeKind::Blob, a, 4, 40, b"late");
        sink.append(late.as_slice()).await.unwrap();
        sink.sync().await.unwrap();
        drop(sink);

        let before = tokio::fs::read(&path).await.unwrap();
        assert!(matches!(
            finalize_file(&path).await,
            Err(Error::CorruptBlock { .. })
        ));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), before);
    }
}
