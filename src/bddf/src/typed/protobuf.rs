use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use bddf_storage::ByteSink;
use protobuf::descriptor::FileDescriptorProto;
use protobuf::reflect::{FileDescriptor, MessageDescriptor};
use protobuf::{Message, MessageDyn, MessageFull};

use crate::format::block::Block;
use crate::series::{SeriesDescriptor, TypeMetadata};
use crate::writer::BlockWriter;
use crate::{Error, Result};

/// protobuf_metadata describes channels carrying `M`.  The descriptor set embeds the file
/// defining `M` and, before it, every file it depends on.
pub fn protobuf_metadata<M: MessageFull>() -> Result<TypeMetadata> {
    let descriptor = M::descriptor();

    let mut files = vec![];
    collect_files(descriptor.file_descriptor(), &mut HashSet::new(), &mut files);

    let file_descriptors = files
        .iter()
        .map(|f| f.proto().write_to_bytes())
        .collect::<protobuf::Result<Vec<_>>>()?;
    Ok(TypeMetadata::Protobuf {
        type_name: descriptor.full_name().to_string(),
        file_descriptors,
    })
}

/// collect_files appends file and its transitive dependencies in dependency order.
fn collect_files(file: &FileDescriptor, seen: &mut HashSet<String>, out: &mut Vec<FileDescriptor>) {
    if !seen.insert(file.proto().name().to_string()) {
        return;
    }
    for dep in file.deps() {
        collect_files(dep, seen, out);
    }
    out.push(file.clone());
}

/// load_message builds the descriptor of type_name from an embedded descriptor set.
fn load_message(
    channel: &str,
    type_name: &str,
    file_descriptors: &[Vec<u8>],
) -> Result<MessageDescriptor> {
    let mut files: HashMap<String, FileDescriptor> = HashMap::new();
    let mut last = None;

    for b in file_descriptors {
        let proto = FileDescriptorProto::parse_from_bytes(b.as_slice())?;
        let deps = proto
            .dependency
            .iter()
            .map(|name| {
                files.get(name).cloned().ok_or_else(|| {
                    Error::schema_mismatch(channel, format!("missing descriptor of {}", name))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let name = proto.name().to_string();
        let file = FileDescriptor::new_dynamic(proto, deps.as_slice())?;
        files.insert(name, file.clone());
        last = Some(file);
    }

    let file = last.ok_or_else(|| Error::schema_mismatch(channel, "empty descriptor set"))?;
    let package = file.proto().package();
    let relative = match type_name.strip_prefix(package) {
        Some(rest) if !package.is_empty() => rest.trim_start_matches('.'),
        _ => type_name,
    };

    file.message_by_package_relative_name(relative)
        .ok_or_else(|| {
            Error::schema_mismatch(channel, format!("{} not in descriptor set", type_name))
        })
}

type DecodeFn = dyn Fn(&[u8]) -> protobuf::Result<Box<dyn MessageDyn>> + Send + Sync;

/// DecoderRegistry holds decode functions supplied by the application, keyed by fully
/// qualified message name.  Types found here are decoded with the compiled message; others
/// fall back to the descriptor embedded in the file.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: HashMap<String, Arc<DecodeFn>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: MessageFull>(&mut self) {
        self.register_fn(M::descriptor().full_name(), |b| {
            let m = M::parse_from_bytes(b)?;
            Ok(Box::new(m) as Box<dyn MessageDyn>)
        });
    }

    pub fn register_fn<F>(&mut self, type_name: &str, f: F)
    where
        F: Fn(&[u8]) -> protobuf::Result<Box<dyn MessageDyn>> + Send + Sync + 'static,
    {
        self.decoders.insert(type_name.to_string(), Arc::new(f));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    fn get(&self, type_name: &str) -> Option<Arc<DecodeFn>> {
        self.decoders.get(type_name).cloned()
    }
}

/// ProtobufSeriesWriter appends messages of type `M` to a channel.
pub struct ProtobufSeriesWriter<M> {
    channel_id: u32,
    _m: PhantomData<fn(&M)>,
}

impl<M: MessageFull> ProtobufSeriesWriter<M> {
    pub async fn register<S: ByteSink>(writer: &mut BlockWriter<S>, name: &str) -> Result<Self> {
        let channel_id = writer.register(name, protobuf_metadata::<M>()?).await?;
        Ok(Self::with_channel(channel_id))
    }

    pub(crate) fn with_channel(channel_id: u32) -> Self {
        Self {
            channel_id,
            _m: PhantomData,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub async fn write<S: ByteSink>(
        &self,
        writer: &mut BlockWriter<S>,
        timestamp: i64,
        message: &M,
    ) -> Result<u64> {
        let payload = message.write_to_bytes()?;
        writer
            .append(self.channel_id, timestamp, payload.as_slice())
            .await
    }
}

enum Decoder {
    Host(Arc<DecodeFn>),
    Dynamic(MessageDescriptor),
}

/// ProtobufSeriesReader decodes the payloads of a protobuf channel.
pub struct ProtobufSeriesReader {
    descriptor: Arc<SeriesDescriptor>,
    type_name: String,
    decoder: Decoder,
}

impl ProtobufSeriesReader {
    pub fn new(descriptor: Arc<SeriesDescriptor>, registry: &DecoderRegistry) -> Result<Self> {
        let channel = descriptor.channel_name.as_str();
        let (type_name, file_descriptors) = match &descriptor.metadata {
            TypeMetadata::Protobuf {
                type_name,
                file_descriptors,
            } => (type_name.clone(), file_descriptors),
            other => {
                return Err(Error::schema_mismatch(
                    channel,
                    format!("not a protobuf series: {}", other),
                ))
            }
        };

        let decoder = match registry.get(type_name.as_str()) {
            Some(f) => Decoder::Host(f),
            None => Decoder::Dynamic(load_message(channel, type_name.as_str(), file_descriptors)?),
        };

        Ok(Self {
            descriptor,
            type_name,
            decoder,
        })
    }

    pub fn type_name(&self) -> &str {
        self.type_name.as_str()
    }

    /// is_dynamic reports whether messages are decoded from the embedded descriptor.
    pub fn is_dynamic(&self) -> bool {
        matches!(self.decoder, Decoder::Dynamic(_))
    }

    pub fn decode(&self, block: &Block) -> Result<Box<dyn MessageDyn>> {
        if block.channel_id != self.descriptor.channel_id {
            return Err(Error::schema_mismatch(
                self.descriptor.channel_name.as_str(),
                format!("block of channel {}", block.channel_id),
            ));
        }
        self.decode_bytes(block.payload.as_ref())
    }

    pub fn decode_bytes(&self, b: &[u8]) -> Result<Box<dyn MessageDyn>> {
        let decoded = match &self.decoder {
            Decoder::Host(f) => f(b),
            Decoder::Dynamic(descriptor) => descriptor.parse_from_bytes(b),
        };
        decoded.map_err(|e| Error::decode(self.descriptor.channel_name.as_str(), e))
    }

    /// decode_as decodes into the compiled message type, which must be the channel's type.
    pub fn decode_as<M: MessageFull>(&self, block: &Block) -> Result<M> {
        let channel = self.descriptor.channel_name.as_str();
        if M::descriptor().full_name() != self.type_name {
            return Err(Error::schema_mismatch(
                channel,
                format!("channel holds {}, not {}", self.type_name, M::descriptor().full_name()),
            ));
        }
        M::parse_from_bytes(block.payload.as_ref()).map_err(|e| Error::decode(channel, e))
    }
}

/// to_text renders a message in protobuf text format.
pub fn to_text(message: &dyn MessageDyn) -> String {
    protobuf::text_format::print_to_string(message)
}
