use std::collections::HashMap;
use std::sync::Arc;

use bddf_core::series::SeriesDescriptor;
use bddf_core::typed::{
    to_text, BlobSeriesReader, DecoderRegistry, PodSeriesReader, ProtobufSeriesReader,
};
use bddf_core::{Block, ReaderOptions, ScanEntry, StreamReader, TypeKind};
use bddf_storage::{ByteSource, FileSource};
use bddf_utils::time::{time_format, unix_nano_to_time};
use clap::Parser;
use common_base::iterator::AsyncIterator;
use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Parser)]
#[clap(about, version, author)]
struct Config {
    #[clap(long)]
    pub path: String,

    /// only print blocks of this channel
    #[clap(long)]
    pub channel: Option<String>,

    /// stop after this many blocks
    #[clap(long)]
    pub limit: Option<usize>,

    /// print decoded payloads
    #[clap(long)]
    pub decode: bool,
}

/// Decoder renders the payload of one channel.
enum Decoder {
    Pod(PodSeriesReader),
    Protobuf(ProtobufSeriesReader),
    Blob(BlobSeriesReader),
}

impl Decoder {
    fn new(
        descriptor: Arc<SeriesDescriptor>,
        registry: &DecoderRegistry,
    ) -> bddf_core::Result<Self> {
        let decoder = match descriptor.type_kind() {
            TypeKind::Pod => Self::Pod(PodSeriesReader::new(descriptor)?),
            TypeKind::Protobuf => Self::Protobuf(ProtobufSeriesReader::new(descriptor, registry)?),
            TypeKind::Blob => Self::Blob(BlobSeriesReader::new(descriptor)?),
        };
        Ok(decoder)
    }

    fn render(&self, block: &Block) -> bddf_core::Result<String> {
        let s = match self {
            Self::Pod(r) => {
                let names: Vec<_> = r.fields().iter().map(|f| f.name.as_str()).collect();
                r.decode(block)?
                    .iter()
                    .map(|record| {
                        let values: Vec<_> = names
                            .iter()
                            .zip(&record.values)
                            .map(|(name, v)| format!("{}={}", name, v))
                            .collect();
                        values.join(" ")
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Self::Protobuf(r) => to_text(r.decode(block)?.as_ref()),
            Self::Blob(r) if r.is_text() => r.decode_text(block)?,
            Self::Blob(r) => format!("<{} bytes of {}>", block.payload.len(), r.content_type()),
        };
        Ok(s)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    if config.path.is_empty() {
        println!("path MUST not be empty!");
        return Ok(());
    }

    let source = FileSource::open(config.path.as_str()).await?;
    dump(source, &config).await?;
    Ok(())
}

/// dump prints every block of source in file order and returns how many were printed.
async fn dump<R: ByteSource>(source: R, config: &Config) -> anyhow::Result<usize> {
    let mut reader = StreamReader::open(source, ReaderOptions::default()).await?;

    let registry = DecoderRegistry::new();
    let mut decoders: HashMap<u32, Option<Decoder>> = HashMap::new();
    let mut header_printed = false;
    let mut n = 0;

    while let Some(entry) = reader.try_next().await? {
        if !header_printed {
            if let Some(header) = reader.header() {
                println!("version: {}", header.version);
                println!("created: {}", time_format(unix_nano_to_time(header.created_nanos)));
                for (k, v) in &header.annotations {
                    println!("  {}: {}", k, v);
                }
                header_printed = true;
            }
        }

        let (descriptor, block) = match entry {
            ScanEntry::Block(descriptor, block) => (descriptor, block),
            ScanEntry::Corrupt {
                offset,
                skipped,
                error,
            } => {
                println!("!! corrupt record @{} skipped {} bytes: {}", offset, skipped, error);
                continue;
            }
        };

        if let Some(channel) = &config.channel {
            if descriptor.channel_name != *channel {
                continue;
            }
        }

        if !decoders.contains_key(&descriptor.channel_id) {
            println!(
                "channel {} {:?} {}",
                descriptor.channel_id, descriptor.channel_name, descriptor.metadata
            );
            for (k, v) in &descriptor.annotations {
                println!("  {}: {}", k, v);
            }
            // a channel without a usable decoder is still listed, just not decoded
            let decoder = match Decoder::new(descriptor.clone(), &registry) {
                Ok(decoder) => Some(decoder),
                Err(e) => {
                    println!("!! {}", e);
                    None
                }
            };
            decoders.insert(descriptor.channel_id, decoder);
        }

        println!("{:08}>{} {}", n, descriptor.channel_name, block);
        if config.decode {
            if let Some(Some(decoder)) = decoders.get(&descriptor.channel_id) {
                match decoder.render(&block) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("!! {}", e),
                }
            }
        }

        n += 1;
        if config.limit.map_or(false, |limit| n >= limit) {
            break;
        }
    }

    match reader.footer_offset() {
        Some(ofs) => println!("index @{}", ofs),
        None => println!("no index: file not finalized"),
    }
    if reader.skipped_bytes() > 0 {
        println!("skipped {} corrupt bytes", reader.skipped_bytes());
    }

    Ok(n)
}

#[cfg(test)]
mod tests {
    use bddf_core::series::TypeMetadata;
    use bddf_core::{BlockWriter, WriterOptions};
    use bddf_storage::memory_buffer;

    use crate::{dump, Config};

    fn config(decode: bool) -> Config {
        Config {
            path: "memory".to_string(),
            channel: None,
            limit: None,
            decode,
        }
    }

    #[tokio::test]
    async fn test_undecodable_channel_is_listed() {
        let (sink, source) = memory_buffer();
        let mut writer = BlockWriter::create(sink, WriterOptions::default())
            .await
            .unwrap();

        // a protobuf channel without descriptors cannot be decoded
        let broken = TypeMetadata::Protobuf {
            type_name: "robot.Pose".to_string(),
            file_descriptors: vec![],
        };
        let a = writer.register("pose", broken).await.unwrap();
        let b = writer
            .register(
                "log",
                TypeMetadata::Blob {
                    content_type: "text/plain".to_string(),
                },
            )
            .await
            .unwrap();

        writer.append(a, 1, &[0x08, 0x01]).await.unwrap();
        writer.append(b, 2, b"hello").await.unwrap();
        writer.append(a, 3, &[0x08, 0x02]).await.unwrap();
        writer.finish().await.unwrap();

        assert_eq!(dump(source.clone(), &config(true)).await.unwrap(), 3);

        let limited = Config {
            limit: Some(2),
            ..config(false)
        };
        assert_eq!(dump(source, &limited).await.unwrap(), 2);
    }
}
