use std::collections::BTreeMap;
use std::sync::Arc;

use bddf_storage::{ByteSource, ByteSourceExt};
use common_base::iterator::AsyncIterator;

use crate::config::ReaderOptions;
use crate::format::block::{read_record, Block, BlockHeader, RecordKind, RecordRead};
use crate::format::header::FileHeader;
use crate::format::{BLOCK_HEADER_SIZE, BLOCK_MAGIC};
use crate::series::{SeriesDescriptor, SeriesRegistry};
use crate::{Error, Result};

/// ScanEntry is one step of a sequential scan.
#[derive(Debug)]
pub enum ScanEntry {
    /// A data block together with the descriptor of its channel.
    Block(Arc<SeriesDescriptor>, Block),
    /// The record at `offset` could not be used.  `skipped` bytes were passed over to
    /// reach the next record start; the scan continues after them.
    Corrupt {
        offset: u64,
        skipped: u64,
        error: Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Scanning,
    /// The index record was reached; the data section is complete.
    Ended,
    /// No record start was found within the resync window.
    Exhausted,
}

/// StreamReader walks the records of a file in physical order.  It never reads past the
/// length its source reports, so it can follow a file that is still being written: when
/// the next record is incomplete `try_next` returns `Ok(None)`, and calling it again once
/// more bytes are available resumes the scan.
pub struct StreamReader<R> {
    source: R,
    options: ReaderOptions,

    header: Option<FileHeader>,
    registry: SeriesRegistry,
    descriptor_offsets: BTreeMap<u32, u64>,

    offset: u64,
    state: ScanState,
    skipped: u64,
    footer_offset: Option<u64>,
}

impl<R: ByteSource> StreamReader<R> {
    /// open starts a scan at the first record.  Fails only if the bytes present cannot be
    /// the start of a BDDF file; an empty or partially written header is fine.
    pub async fn open(source: R, options: ReaderOptions) -> Result<Self> {
        Self::open_at(source, 0, options).await
    }

    /// open_at starts a scan at start_offset, which must be a record boundary.  Descriptor
    /// records before it are picked up by a header-only pass so the blocks that follow can
    /// be attributed to their channels.
    pub async fn open_at(source: R, start_offset: u64, options: ReaderOptions) -> Result<Self> {
        let mut reader = Self {
            source,
            options,
            header: None,
            registry: SeriesRegistry::new(),
            descriptor_offsets: BTreeMap::new(),
            offset: 0,
            state: ScanState::Scanning,
            skipped: 0,
            footer_offset: None,
        };

        if reader.read_header().await? && start_offset > reader.offset {
            reader.skim_descriptors(start_offset).await?;
            reader.offset = start_offset;
        }
        Ok(reader)
    }

    /// read_header loads the file header if it is complete, returning whether it is.
    async fn read_header(&mut self) -> Result<bool> {
        if self.header.is_some() {
            return Ok(true);
        }

        match FileHeader::read_from(&self.source).await? {
            Some((header, len)) => {
                self.header = Some(header);
                self.offset = self.offset.max(len);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// skim_descriptors absorbs the descriptor records between the current offset and until,
    /// stepping over data records by their header alone.
    async fn skim_descriptors(&mut self, until: u64) -> Result<()> {
        let avail = self.source.len().await?;
        let mut offset = self.offset;
        let mut buf = [0_u8; BLOCK_HEADER_SIZE];

        while offset < until && offset + BLOCK_HEADER_SIZE as u64 <= avail {
            self.source.read_exact_at(offset, &mut buf).await?;
            let header = match BlockHeader::unmarshal_binary(&buf) {
                Ok(header) => header,
                Err(_) => break,
            };

            if header.kind == RecordKind::Descriptor {
                if let RecordRead::Complete(header, payload) =
                    read_record(&self.source, offset, avail, self.options.max_payload_size).await?
                {
                    self.absorb_descriptor(&header, payload.as_ref(), offset)?;
                }
            }
            offset += header.size();
        }
        Ok(())
    }

    fn absorb_descriptor(
        &mut self,
        header: &BlockHeader,
        payload: &[u8],
        offset: u64,
    ) -> Result<()> {
        let descriptor = SeriesDescriptor::unmarshal_binary(header.channel_id, payload)?;
        if descriptor.type_kind() != header.type_kind {
            return Err(Error::InvalidFormat(format!(
                "descriptor of channel {} declares {} in a {} record",
                header.channel_id,
                descriptor.type_kind(),
                header.type_kind
            )));
        }

        if self.registry.insert(descriptor)? {
            debug!(
                "channel {} declared at offset {}",
                header.channel_id, offset
            );
            self.descriptor_offsets.insert(header.channel_id, offset);
        }
        Ok(())
    }

    /// resync searches forward from a corrupt record at start for the next offset holding a
    /// valid, or still incomplete, record.
    async fn resync(&mut self, start: u64, avail: u64, error: Error) -> Result<ScanEntry> {
        let from = start + 1;
        let window_end = from.saturating_add(self.options.resync_window).min(avail);
        // a magic starting at the last window position needs 3 more bytes
        let read_end = (window_end + 3).min(avail);

        let buf = self
            .source
            .read_vec(from, read_end.saturating_sub(from) as usize)
            .await?;
        let magic = BLOCK_MAGIC.to_be_bytes();

        let mut found = None;
        for (i, w) in buf.windows(magic.len()).enumerate() {
            if w != magic {
                continue;
            }

            let candidate = from + i as u64;
            let max_payload_size = self.options.max_payload_size;
            match read_record(&self.source, candidate, avail, max_payload_size).await? {
                RecordRead::Complete(..) | RecordRead::Incomplete => {
                    found = Some(candidate);
                    break;
                }
                RecordRead::Corrupt(_) => continue,
            }
        }

        let next = match found {
            Some(candidate) => candidate,
            None if window_end >= avail => {
                // the search ran into the end of the written bytes; a record may still
                // start in the last few bytes once the writer appends more
                from.max(avail.saturating_sub(3))
            }
            None => {
                warn!(
                    "no block found within {} bytes after offset {}, giving up",
                    self.options.resync_window, start
                );
                self.state = ScanState::Exhausted;
                avail
            }
        };

        let skipped = next - start;
        self.skipped += skipped;
        if self.state == ScanState::Scanning {
            self.offset = next;
        }

        warn!("corrupt record at offset {}: {}, skipped {} bytes", start, error, skipped);
        Ok(ScanEntry::Corrupt {
            offset: start,
            skipped,
            error,
        })
    }

    /// next_block returns the next data block, passing over corrupt records.
    pub async fn next_block(&mut self) -> Result<Option<(Arc<SeriesDescriptor>, Block)>> {
        while let Some(entry) = self.try_next().await? {
            if let ScanEntry::Block(descriptor, block) = entry {
                return Ok(Some((descriptor, block)));
            }
        }
        Ok(None)
    }

    pub fn header(&self) -> Option<&FileHeader> {
        self.header.as_ref()
    }

    /// registry holds every descriptor seen so far.
    pub fn registry(&self) -> &SeriesRegistry {
        &self.registry
    }

    /// descriptor_offsets maps each channel seen so far to its descriptor record offset.
    pub fn descriptor_offsets(&self) -> &BTreeMap<u32, u64> {
        &self.descriptor_offsets
    }

    /// position is the offset of the next record to read.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// skipped_bytes is the total number of bytes passed over while resynchronizing.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    /// footer_offset is the offset of the index record once the scan reached it.
    pub fn footer_offset(&self) -> Option<u64> {
        self.footer_offset
    }

    /// is_exhausted reports whether the scan stopped because no block start was found
    /// within the resync window.
    pub fn is_exhausted(&self) -> bool {
        self.state == ScanState::Exhausted
    }

    pub fn into_inner(self) -> R {
        self.source
    }
}

#[async_trait]
impl<R: ByteSource> AsyncIterator for StreamReader<R> {
    type Item = ScanEntry;
    type Error = Error;

    async fn try_next(&mut self) -> Result<Option<Self::Item>> {
        loop {
            if self.state != ScanState::Scanning || !self.read_header().await? {
                return Ok(None);
            }

            let offset = self.offset;
            let avail = self.source.len().await?;
            let max_payload_size = self.options.max_payload_size;
            let record = read_record(&self.source, offset, avail, max_payload_size).await?;
            let (header, payload) = match record {
                RecordRead::Complete(header, payload) => (header, payload),
                RecordRead::Incomplete => return Ok(None),
                RecordRead::Corrupt(reason) => {
                    let error = Error::CorruptBlock { offset, reason };
                    return self.resync(offset, avail, error).await.map(Some);
                }
            };

            match header.kind {
                RecordKind::Index => {
                    self.footer_offset = Some(offset);
                    self.state = ScanState::Ended;
                    return Ok(None);
                }
                RecordKind::Descriptor => {
                    self.offset += header.size();
                    if let Err(error) = self.absorb_descriptor(&header, payload.as_ref(), offset) {
                        warn!("bad descriptor record at offset {}: {}", offset, error);
                        return Ok(Some(ScanEntry::Corrupt {
                            offset,
                            skipped: 0,
                            error,
                        }));
                    }
                }
                RecordKind::Data => {
                    self.offset += header.size();
                    let entry = match self.registry.lookup(header.channel_id) {
                        Some(descriptor) => {
                            ScanEntry::Block(descriptor, Block::new(&header, payload, offset))
                        }
                        None => ScanEntry::Corrupt {
                            offset,
                            skipped: 0,
                            error: Error::UnknownChannel(header.channel_id),
                        },
                    };
                    return Ok(Some(entry));
                }
            }
        }
    }
}
