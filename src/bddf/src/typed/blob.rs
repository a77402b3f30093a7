use std::sync::Arc;

use bddf_storage::ByteSink;
use bytes::Bytes;

use crate::format::block::Block;
use crate::series::{SeriesDescriptor, TypeMetadata};
use crate::writer::BlockWriter;
use crate::{Error, Result};

pub const TEXT_PLAIN: &str = "text/plain";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// BlobSeriesWriter appends opaque payloads: text messages, operator comments, events or
/// any bytes the application encodes itself.
pub struct BlobSeriesWriter {
    channel_id: u32,
}

impl BlobSeriesWriter {
    pub async fn register<S: ByteSink>(
        writer: &mut BlockWriter<S>,
        name: &str,
        content_type: &str,
    ) -> Result<Self> {
        let metadata = TypeMetadata::Blob {
            content_type: content_type.to_string(),
        };
        let channel_id = writer.register(name, metadata).await?;
        Ok(Self { channel_id })
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub async fn write<S: ByteSink>(
        &self,
        writer: &mut BlockWriter<S>,
        timestamp: i64,
        payload: &[u8],
    ) -> Result<u64> {
        writer.append(self.channel_id, timestamp, payload).await
    }

    pub async fn write_text<S: ByteSink>(
        &self,
        writer: &mut BlockWriter<S>,
        timestamp: i64,
        text: &str,
    ) -> Result<u64> {
        self.write(writer, timestamp, text.as_bytes()).await
    }
}

#[derive(Debug, Clone)]
pub struct BlobSeriesReader {
    descriptor: Arc<SeriesDescriptor>,
}

impl BlobSeriesReader {
    pub fn new(descriptor: Arc<SeriesDescriptor>) -> Result<Self> {
        if !matches!(descriptor.metadata, TypeMetadata::Blob { .. }) {
            return Err(Error::schema_mismatch(
                descriptor.channel_name.as_str(),
                format!("not a blob series: {}", descriptor.metadata),
            ));
        }
        Ok(Self { descriptor })
    }

    pub fn content_type(&self) -> &str {
        match &self.descriptor.metadata {
            TypeMetadata::Blob { content_type } => content_type.as_str(),
            _ => OCTET_STREAM,
        }
    }

    /// is_text reports whether the content type is a `text/*` type.
    pub fn is_text(&self) -> bool {
        self.content_type().starts_with("text/")
    }

    pub fn decode(&self, block: &Block) -> Result<Bytes> {
        if block.channel_id != self.descriptor.channel_id {
            return Err(Error::schema_mismatch(
                self.descriptor.channel_name.as_str(),
                format!("block of channel {}", block.channel_id),
            ));
        }
        Ok(block.payload.clone())
    }

    /// decode_text returns the payload as UTF-8 text.
    pub fn decode_text(&self, block: &Block) -> Result<String> {
        let payload = self.decode(block)?;
        String::from_utf8(payload.to_vec())
            .map_err(|e| Error::decode(self.descriptor.channel_name.as_str(), e))
    }
}

#[cfg(test)]
mod tests {
    use bddf_storage::memory_buffer;

    use crate::config::{ReaderOptions, WriterOptions};
    use crate::reader::StreamReader;
    use crate::typed::{BlobSeriesReader, BlobSeriesWriter, TEXT_PLAIN};
    use crate::writer::BlockWriter;
    use crate::Error;

    #[tokio::test]
    async fn test_comments() {
        let (sink, source) = memory_buffer();
        let mut writer = BlockWriter::create(sink, WriterOptions::default())
            .await
            .unwrap();
        let comments = BlobSeriesWriter::register(&mut writer, "bosdyn-api/comment", TEXT_PLAIN)
            .await
            .unwrap();
        comments
            .write_text(&mut writer, 10, "stairs ahead")
            .await
            .unwrap();
        comments
            .write(&mut writer, 20, &[0xff, 0xfe])
            .await
            .unwrap();
        writer.finish().await.unwrap();

        let mut reader = StreamReader::open(source, ReaderOptions::default())
            .await
            .unwrap();
        let (descriptor, block) = reader.next_block().await.unwrap().unwrap();
        let decoder = BlobSeriesReader::new(descriptor).unwrap();
        assert!(decoder.is_text());
        assert_eq!(decoder.decode_text(&block).unwrap(), "stairs ahead");

        let (_, block) = reader.next_block().await.unwrap().unwrap();
        assert_eq!(decoder.decode(&block).unwrap().as_ref(), &[0xff, 0xfe]);
        assert!(matches!(
            decoder.decode_text(&block),
            Err(Error::Decode { .. })
        ));
    }
}
