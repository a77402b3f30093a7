use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use bytes::BufMut;

use crate::format::{put_str16, BinaryReader};
use crate::{Error, Result};

/// TypeKind is the closed set of payload families a channel can carry.  It is stored in
/// every record header so readers can dispatch without consulting the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Pod,
    Protobuf,
    Blob,
}

impl TypeKind {
    pub fn value(&self) -> u8 {
        match self {
            TypeKind::Pod => 1,
            TypeKind::Protobuf => 2,
            TypeKind::Blob => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TypeKind::Pod => "pod",
            TypeKind::Protobuf => "protobuf",
            TypeKind::Blob => "blob",
        }
    }
}

impl TryFrom<u8> for TypeKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(TypeKind::Pod),
            2 => Ok(TypeKind::Protobuf),
            3 => Ok(TypeKind::Blob),
            _ => Err(Error::InvalidFormat(format!("unknown type kind: {}", value))),
        }
    }
}

impl Display for TypeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PodType is the numeric encoding of one POD field.  Values are stored big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl PodType {
    pub fn value(&self) -> u8 {
        match self {
            PodType::U8 => 1,
            PodType::I8 => 2,
            PodType::U16 => 3,
            PodType::I16 => 4,
            PodType::U32 => 5,
            PodType::I32 => 6,
            PodType::U64 => 7,
            PodType::I64 => 8,
            PodType::F32 => 9,
            PodType::F64 => 10,
        }
    }

    /// width returns the encoded size in bytes.
    pub fn width(&self) -> usize {
        match self {
            PodType::U8 | PodType::I8 => 1,
            PodType::U16 | PodType::I16 => 2,
            PodType::U32 | PodType::I32 | PodType::F32 => 4,
            PodType::U64 | PodType::I64 | PodType::F64 => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PodType::U8 => "u8",
            PodType::I8 => "i8",
            PodType::U16 => "u16",
            PodType::I16 => "i16",
            PodType::U32 => "u32",
            PodType::I32 => "i32",
            PodType::U64 => "u64",
            PodType::I64 => "i64",
            PodType::F32 => "f32",
            PodType::F64 => "f64",
        }
    }
}

impl TryFrom<u8> for PodType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        let typ = match value {
            1 => PodType::U8,
            2 => PodType::I8,
            3 => PodType::U16,
            4 => PodType::I16,
            5 => PodType::U32,
            6 => PodType::I32,
            7 => PodType::U64,
            8 => PodType::I64,
            9 => PodType::F32,
            10 => PodType::F64,
            _ => return Err(Error::InvalidFormat(format!("unknown pod type: {}", value))),
        };
        Ok(typ)
    }
}

impl TryFrom<&str> for PodType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        let typ = match value {
            "u8" => PodType::U8,
            "i8" => PodType::I8,
            "u16" => PodType::U16,
            "i16" => PodType::I16,
            "u32" => PodType::U32,
            "i32" => PodType::I32,
            "u64" => PodType::U64,
            "i64" => PodType::I64,
            "f32" => PodType::F32,
            "f64" => PodType::F64,
            _ => return Err(Error::InvalidFormat(format!("unknown pod type: {}", value))),
        };
        Ok(typ)
    }
}

impl Display for PodType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodField {
    pub name: String,
    pub typ: PodType,
}

impl PodField {
    pub fn new(name: impl Into<String>, typ: PodType) -> Self {
        Self {
            name: name.into(),
            typ,
        }
    }
}

/// TypeMetadata describes how the payloads of a channel are laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeMetadata {
    /// Fixed layout records.  A payload holds one or more records back to back.
    Pod { fields: Vec<PodField> },
    /// Protobuf messages of `type_name`.  `file_descriptors` holds serialized
    /// `FileDescriptorProto`s, dependencies first and the defining file last.
    Protobuf {
        type_name: String,
        file_descriptors: Vec<Vec<u8>>,
    },
    /// Opaque bytes tagged with a content type such as `text/plain`.
    Blob { content_type: String },
}

impl TypeMetadata {
    pub fn type_kind(&self) -> TypeKind {
        match self {
            TypeMetadata::Pod { .. } => TypeKind::Pod,
            TypeMetadata::Protobuf { .. } => TypeKind::Protobuf,
            TypeMetadata::Blob { .. } => TypeKind::Blob,
        }
    }

    /// record_width returns the size of one POD record, `None` for other kinds.
    pub fn record_width(&self) -> Option<usize> {
        match self {
            TypeMetadata::Pod { fields } => Some(fields.iter().map(|f| f.typ.width()).sum()),
            _ => None,
        }
    }

    fn append_to(&self, b: &mut Vec<u8>) -> Result<()> {
        match self {
            TypeMetadata::Pod { fields } => {
                b.put_u16(fields.len() as u16);
                for field in fields {
                    put_str16(b, field.name.as_str())?;
                    b.put_u8(field.typ.value());
                }
            }
            TypeMetadata::Protobuf {
                type_name,
                file_descriptors,
            } => {
                put_str16(b, type_name.as_str())?;
                b.put_u16(file_descriptors.len() as u16);
                for fd in file_descriptors {
                    b.put_u32(fd.len() as u32);
                    b.extend_from_slice(fd.as_slice());
                }
            }
            TypeMetadata::Blob { content_type } => {
                put_str16(b, content_type.as_str())?;
            }
        }
        Ok(())
    }

    fn read_from(kind: TypeKind, r: &mut BinaryReader) -> Result<Self> {
        let metadata = match kind {
            TypeKind::Pod => {
                let n = r.u16()?;
                let mut fields = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let name = r.str16()?;
                    let typ = PodType::try_from(r.u8()?)?;
                    fields.push(PodField { name, typ });
                }
                TypeMetadata::Pod { fields }
            }
            TypeKind::Protobuf => {
                let type_name = r.str16()?;
                let n = r.u16()?;
                let mut file_descriptors = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let len = r.u32()? as usize;
                    file_descriptors.push(r.bytes(len)?.to_vec());
                }
                TypeMetadata::Protobuf {
                    type_name,
                    file_descriptors,
                }
            }
            TypeKind::Blob => TypeMetadata::Blob {
                content_type: r.str16()?,
            },
        };
        Ok(metadata)
    }
}

impl Display for TypeMetadata {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeMetadata::Pod { fields } => {
                write!(f, "pod{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", field.name, field.typ)?;
                }
                write!(f, "}}")
            }
            TypeMetadata::Protobuf { type_name, .. } => write!(f, "protobuf({})", type_name),
            TypeMetadata::Blob { content_type } => write!(f, "blob({})", content_type),
        }
    }
}

/// SeriesDescriptor identifies one channel and the schema of all its blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesDescriptor {
    pub channel_id: u32,
    pub channel_name: String,
    pub metadata: TypeMetadata,
    pub annotations: BTreeMap<String, String>,
}

impl SeriesDescriptor {
    pub fn type_kind(&self) -> TypeKind {
        self.metadata.type_kind()
    }

    /// marshal_binary encodes the descriptor record payload.  The channel id travels in the
    /// record header.
    pub fn marshal_binary(&self) -> Result<Vec<u8>> {
        let mut b = Vec::new();
        put_str16(&mut b, self.channel_name.as_str())?;
        b.put_u8(self.type_kind().value());
        self.metadata.append_to(&mut b)?;

        b.put_u16(self.annotations.len() as u16);
        for (k, v) in &self.annotations {
            put_str16(&mut b, k)?;
            put_str16(&mut b, v)?;
        }
        Ok(b)
    }

    pub fn unmarshal_binary(channel_id: u32, b: &[u8]) -> Result<Self> {
        let mut r = BinaryReader::new(b, "series descriptor");
        let channel_name = r.str16()?;
        let kind = TypeKind::try_from(r.u8()?)?;
        let metadata = TypeMetadata::read_from(kind, &mut r)?;

        let n = r.u16()?;
        let mut annotations = BTreeMap::new();
        for _ in 0..n {
            let k = r.str16()?;
            let v = r.str16()?;
            annotations.insert(k, v);
        }
        r.finish()?;

        Ok(Self {
            channel_id,
            channel_name,
            metadata,
            annotations,
        })
    }
}

impl Display for SeriesDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {} {}", self.channel_id, self.channel_name, self.metadata)
    }
}
