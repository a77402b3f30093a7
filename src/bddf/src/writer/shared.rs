use std::collections::BTreeMap;
use std::sync::Arc;

use bddf_storage::ByteSink;
use tokio::sync::Mutex;

use crate::index::Index;
use crate::series::{SeriesDescriptor, TypeMetadata};
use crate::writer::BlockWriter;
use crate::{Error, Result};

/// SharedBlockWriter lets several tasks append to one file.  Appends are serialized by a
/// mutex, so blocks of one channel keep the order in which their appends acquired it.
pub struct SharedBlockWriter<S> {
    inner: Arc<Mutex<BlockWriter<S>>>,
}

impl<S> Clone for SharedBlockWriter<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: ByteSink> SharedBlockWriter<S> {
    pub fn new(writer: BlockWriter<S>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// register declares a channel and returns a handle appending to it.
    pub async fn register(&self, name: &str, metadata: TypeMetadata) -> Result<ChannelWriter<S>> {
        self.register_with_annotations(name, metadata, BTreeMap::new())
            .await
    }

    pub async fn register_with_annotations(
        &self,
        name: &str,
        metadata: TypeMetadata,
        annotations: BTreeMap<String, String>,
    ) -> Result<ChannelWriter<S>> {
        let descriptor = self
            .inner
            .lock()
            .await
            .register_with_annotations(name, metadata, annotations)
            .await?;

        Ok(ChannelWriter {
            writer: self.clone(),
            descriptor,
        })
    }

    pub async fn append(&self, channel_id: u32, timestamp: i64, payload: &[u8]) -> Result<u64> {
        self.inner
            .lock()
            .await
            .append(channel_id, timestamp, payload)
            .await
    }

    pub async fn flush(&self) -> Result<()> {
        self.inner.lock().await.flush().await
    }

    /// finish finalizes the file.  Fails with `WriterShared` while other handles, channel
    /// writers included, are still alive.
    pub async fn finish(self) -> Result<(S, Option<Index>)> {
        let writer = Arc::try_unwrap(self.inner)
            .map_err(|inner| Error::WriterShared(Arc::strong_count(&inner) - 1))?;
        writer.into_inner().finish().await
    }
}

/// ChannelWriter appends to a single channel of a [`SharedBlockWriter`].
pub struct ChannelWriter<S> {
    writer: SharedBlockWriter<S>,
    descriptor: Arc<SeriesDescriptor>,
}

impl<S> Clone for ChannelWriter<S> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
            descriptor: self.descriptor.clone(),
        }
    }
}

impl<S: ByteSink> ChannelWriter<S> {
    pub fn channel_id(&self) -> u32 {
        self.descriptor.channel_id
    }

    pub fn descriptor(&self) -> &Arc<SeriesDescriptor> {
        &self.descriptor
    }

    pub async fn append(&self, timestamp: i64, payload: &[u8]) -> Result<u64> {
        self.writer
            .append(self.descriptor.channel_id, timestamp, payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use bddf_storage::memory_buffer;
    use common_base::iterator::AsyncIteratorExt;

    use crate::config::{ReaderOptions, WriterOptions};
    use crate::reader::{ScanEntry, StreamReader};
    use crate::series::TypeMetadata;
    use crate::writer::{BlockWriter, SharedBlockWriter};
    use crate::Error;

    fn text() -> TypeMetadata {
        TypeMetadata::Blob {
            content_type: "text/plain".to_string(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_channels() {
        let (sink, source) = memory_buffer();
        let writer = BlockWriter::create(sink, WriterOptions::default())
            .await
            .unwrap();
        let shared = SharedBlockWriter::new(writer);

        let mut handles = vec![];
        for t in 0..4 {
            let channel = shared
                .register(format!("task/{}", t).as_str(), text())
                .await
                .unwrap();
            handles.push(tokio::spawn(async move {
                for i in 0..50_i64 {
                    let seq = channel
                        .append(i, format!("{}-{}", t, i).as_bytes())
                        .await
                        .unwrap();
                    assert_eq!(seq, i as u64);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let (_, index) = shared.finish().await.unwrap();
        assert_eq!(index.unwrap().block_count(), 200);

        let mut reader = StreamReader::open(source, ReaderOptions::default())
            .await
            .unwrap();
        let entries = reader.try_collect().await.unwrap();
        let mut next = [0_u64; 4];
        for entry in entries {
            match entry {
                ScanEntry::Block(descriptor, block) => {
                    let t: usize = descriptor.channel_name[5..].parse().unwrap();
                    assert_eq!(block.sequence, next[t]);
                    assert_eq!(
                        block.payload.as_ref(),
                        format!("{}-{}", t, next[t]).as_bytes()
                    );
                    next[t] += 1;
                }
                ScanEntry::Corrupt { error, .. } => panic!("unexpected {}", error),
            }
        }
        assert_eq!(next, [50; 4]);
    }

    #[tokio::test]
    async fn test_finish_while_shared() {
        let (sink, _) = memory_buffer();
        let writer = BlockWriter::create(sink, WriterOptions::default())
            .await
            .unwrap();
        let shared = SharedBlockWriter::new(writer);
        let channel = shared.register("a", text()).await.unwrap();

        match shared.clone().finish().await {
            Err(Error::WriterShared(n)) => assert_eq!(n, 2),
            r => panic!("unexpected {:?}", r.map(|_| ())),
        }

        drop(channel);
        assert!(shared.finish().await.is_ok());
    }
}
