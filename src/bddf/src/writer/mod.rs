use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bddf_storage::ByteSink;
use tokio::time::Instant;

use crate::config::WriterOptions;
use crate::format::block::{encode_record, RecordKind};
use crate::index::{finalize, FileIndexer, Index, IndexEntry};
use crate::series::{SeriesDescriptor, TypeMetadata};
use crate::session::Session;
use crate::{Error, Result};

mod shared;

pub use shared::*;

/// BlockWriter appends framed records to a sink.  Every record is handed to the sink in a
/// single append, so a crash leaves at most one incomplete record at the end of the file.
pub struct BlockWriter<S> {
    sink: S,
    session: Session,
    options: WriterOptions,

    /// Mirrors every appended block when the options ask for an index.
    indexer: Option<FileIndexer>,

    unsynced_blocks: u64,
    unsynced_bytes: u64,
    last_sync: Instant,

    /// Set when a failed write could not be rolled back; the sink no longer matches the
    /// session and every later write is refused.
    poisoned: bool,
}

impl<S: ByteSink> BlockWriter<S> {
    /// new writes the file header of session into the empty sink.
    pub async fn new(mut sink: S, mut session: Session, options: WriterOptions) -> Result<Self> {
        options.validate()?;
        if sink.len() != 0 {
            return Err(Error::InvalidOptions(format!(
                "sink must be empty, holds {} bytes",
                sink.len()
            )));
        }

        let header = session.header().marshal_binary()?;
        sink.append(header.as_slice()).await?;
        session.advance(header.len() as u64);

        let indexer = options.build_index.then(FileIndexer::new);
        Ok(Self {
            sink,
            session,
            options,
            indexer,
            unsynced_blocks: 0,
            unsynced_bytes: header.len() as u64,
            last_sync: Instant::now(),
            poisoned: false,
        })
    }

    /// create starts a session without annotations.
    pub async fn create(sink: S, options: WriterOptions) -> Result<Self> {
        Self::new(sink, Session::default(), options).await
    }

    /// register declares a channel and returns its id.  The descriptor record is appended
    /// the first time a name is registered.
    pub async fn register(&mut self, name: &str, metadata: TypeMetadata) -> Result<u32> {
        let descriptor = self
            .register_with_annotations(name, metadata, BTreeMap::new())
            .await?;
        Ok(descriptor.channel_id)
    }

    pub async fn register_with_annotations(
        &mut self,
        name: &str,
        metadata: TypeMetadata,
        annotations: BTreeMap<String, String>,
    ) -> Result<Arc<SeriesDescriptor>> {
        // the channel only becomes visible once its descriptor record is written
        let mut registry = self.session.registry().clone();
        let (descriptor, created) = registry.register_with(name, metadata, annotations)?;
        if !created {
            return Ok(descriptor);
        }

        let payload = descriptor.marshal_binary()?;
        let record = encode_record(
            RecordKind::Descriptor,
            descriptor.type_kind(),
            descriptor.channel_id,
            0,
            self.session.header().created_nanos,
            payload.as_slice(),
        );

        let offset = self.session.write_offset();
        self.write(record.as_slice()).await?;
        *self.session.registry_mut() = registry;
        self.session.advance(record.len() as u64);
        if let Some(indexer) = &mut self.indexer {
            indexer.add_descriptor(descriptor.channel_id, offset);
        }

        debug!(
            "registered channel {} as {}: {}",
            descriptor.channel_name, descriptor.channel_id, descriptor.metadata
        );
        Ok(descriptor)
    }

    /// append writes one block and returns its sequence number within the channel.
    pub async fn append(&mut self, channel_id: u32, timestamp: i64, payload: &[u8]) -> Result<u64> {
        let descriptor = self
            .session
            .registry()
            .lookup(channel_id)
            .ok_or(Error::UnknownChannel(channel_id))?;
        if payload.len() > self.options.max_payload_size {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: self.options.max_payload_size,
            });
        }

        let sequence = self.session.next_sequence(channel_id);
        let offset = self.session.write_offset();
        let record = encode_record(
            RecordKind::Data,
            descriptor.type_kind(),
            channel_id,
            sequence,
            timestamp,
            payload,
        );

        self.write(record.as_slice()).await?;
        self.session
            .commit_block(channel_id, sequence, record.len() as u64);
        if let Some(indexer) = &mut self.indexer {
            indexer.add_block(
                channel_id,
                IndexEntry::new(timestamp, sequence, offset, payload.len() as u32),
            );
        }

        self.maybe_sync().await?;
        Ok(sequence)
    }

    /// write hands one record to the sink.  On failure the part of the record that reached
    /// the sink is cut off again, so the sink keeps ending at the write offset.
    async fn write(&mut self, record: &[u8]) -> Result<()> {
        let offset = self.session.write_offset();
        if self.poisoned {
            return Err(Error::WriterPoisoned(offset));
        }

        if let Err(e) = self.sink.append(record).await {
            if let Err(rollback) = self.sink.truncate(offset).await {
                warn!("cannot roll back failed write at {}: {}", offset, rollback);
                self.poisoned = true;
            }
            return Err(e.into());
        }
        self.unsynced_blocks += 1;
        self.unsynced_bytes += record.len() as u64;
        Ok(())
    }

    async fn maybe_sync(&mut self) -> Result<()> {
        let by_blocks = self
            .options
            .flush_every_blocks
            .map_or(false, |n| self.unsynced_blocks >= n);
        let by_time = self
            .options
            .flush_interval_ms
            .map_or(false, |ms| self.last_sync.elapsed() >= Duration::from_millis(ms));
        let by_bytes = self.unsynced_bytes >= self.options.fsync_every_bytes;

        if by_blocks || by_time || by_bytes {
            self.flush().await?;
        }
        Ok(())
    }

    /// flush makes every record appended so far durable.
    pub async fn flush(&mut self) -> Result<()> {
        self.sink.sync().await?;
        self.unsynced_blocks = 0;
        self.unsynced_bytes = 0;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// finish writes the index and the trailer if the writer keeps an index, syncs the sink
    /// and hands it back together with the index.
    pub async fn finish(mut self) -> Result<(S, Option<Index>)> {
        if self.poisoned {
            return Err(Error::WriterPoisoned(self.session.write_offset()));
        }

        let index = self.indexer.take().map(FileIndexer::into_index);
        if let Some(index) = &index {
            let index_offset = self.session.write_offset();
            let footer = finalize(index, index_offset)?;
            self.sink.append(footer.as_slice()).await?;
            self.session.advance(footer.len() as u64);

            info!(
                "finalized with {} channels, {} blocks, index at {}",
                self.session.registry().len(),
                index.block_count(),
                index_offset
            );
        }

        self.flush().await?;
        Ok((self.sink, index))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// index returns the blocks written so far, if the writer keeps an index.
    pub fn index(&self) -> Option<&Index> {
        self.indexer.as_ref().map(|indexer| indexer.index())
    }

    /// offset returns the position the next record is written at.
    pub fn offset(&self) -> u64 {
        self.session.write_offset()
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
