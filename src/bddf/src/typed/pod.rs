use std::fmt::{Display, Formatter};
use std::sync::Arc;

use bddf_storage::ByteSink;
use bytes::{Buf, BufMut};

use crate::format::block::Block;
use crate::series::{PodField, PodType, SeriesDescriptor, TypeMetadata};
use crate::writer::BlockWriter;
use crate::{Error, Result};

/// PodValue is one scalar of a POD record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PodValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl PodValue {
    pub fn typ(&self) -> PodType {
        match self {
            PodValue::U8(_) => PodType::U8,
            PodValue::I8(_) => PodType::I8,
            PodValue::U16(_) => PodType::U16,
            PodValue::I16(_) => PodType::I16,
            PodValue::U32(_) => PodType::U32,
            PodValue::I32(_) => PodType::I32,
            PodValue::U64(_) => PodType::U64,
            PodValue::I64(_) => PodType::I64,
            PodValue::F32(_) => PodType::F32,
            PodValue::F64(_) => PodType::F64,
        }
    }

    /// as_f64 widens the value, losing precision for large 64 bit integers.
    pub fn as_f64(&self) -> f64 {
        match *self {
            PodValue::U8(v) => v as f64,
            PodValue::I8(v) => v as f64,
            PodValue::U16(v) => v as f64,
            PodValue::I16(v) => v as f64,
            PodValue::U32(v) => v as f64,
            PodValue::I32(v) => v as f64,
            PodValue::U64(v) => v as f64,
            PodValue::I64(v) => v as f64,
            PodValue::F32(v) => v as f64,
            PodValue::F64(v) => v,
        }
    }

    fn put(&self, b: &mut Vec<u8>) {
        match *self {
            PodValue::U8(v) => b.put_u8(v),
            PodValue::I8(v) => b.put_i8(v),
            PodValue::U16(v) => b.put_u16(v),
            PodValue::I16(v) => b.put_i16(v),
            PodValue::U32(v) => b.put_u32(v),
            PodValue::I32(v) => b.put_i32(v),
            PodValue::U64(v) => b.put_u64(v),
            PodValue::I64(v) => b.put_i64(v),
            PodValue::F32(v) => b.put_f32(v),
            PodValue::F64(v) => b.put_f64(v),
        }
    }

    fn get(typ: PodType, b: &mut &[u8]) -> Self {
        match typ {
            PodType::U8 => PodValue::U8(b.get_u8()),
            PodType::I8 => PodValue::I8(b.get_i8()),
            PodType::U16 => PodValue::U16(b.get_u16()),
            PodType::I16 => PodValue::I16(b.get_i16()),
            PodType::U32 => PodValue::U32(b.get_u32()),
            PodType::I32 => PodValue::I32(b.get_i32()),
            PodType::U64 => PodValue::U64(b.get_u64()),
            PodType::I64 => PodValue::I64(b.get_i64()),
            PodType::F32 => PodValue::F32(b.get_f32()),
            PodType::F64 => PodValue::F64(b.get_f64()),
        }
    }
}

impl Display for PodValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PodValue::U8(v) => write!(f, "{}", v),
            PodValue::I8(v) => write!(f, "{}", v),
            PodValue::U16(v) => write!(f, "{}", v),
            PodValue::I16(v) => write!(f, "{}", v),
            PodValue::U32(v) => write!(f, "{}", v),
            PodValue::I32(v) => write!(f, "{}", v),
            PodValue::U64(v) => write!(f, "{}", v),
            PodValue::I64(v) => write!(f, "{}", v),
            PodValue::F32(v) => write!(f, "{}", v),
            PodValue::F64(v) => write!(f, "{}", v),
        }
    }
}

/// PodRecord holds the values of one record in field order.
#[derive(Debug, Clone, PartialEq)]
pub struct PodRecord {
    pub values: Vec<PodValue>,
}

/// encode_records packs records back to back, checking each against fields.
fn encode_records(channel: &str, fields: &[PodField], records: &[&[PodValue]]) -> Result<Vec<u8>> {
    let width: usize = fields.iter().map(|f| f.typ.width()).sum();
    let mut b = Vec::with_capacity(width * records.len());

    for values in records {
        if values.len() != fields.len() {
            return Err(Error::schema_mismatch(
                channel,
                format!("record has {} values, expected {}", values.len(), fields.len()),
            ));
        }
        for (value, field) in values.iter().zip(fields) {
            if value.typ() != field.typ {
                return Err(Error::schema_mismatch(
                    channel,
                    format!("field {} is {}, got {}", field.name, field.typ, value.typ()),
                ));
            }
            value.put(&mut b);
        }
    }
    Ok(b)
}

/// PodSeriesWriter appends fixed layout records to a POD channel.
pub struct PodSeriesWriter {
    descriptor: Arc<SeriesDescriptor>,
    fields: Vec<PodField>,
}

impl PodSeriesWriter {
    pub async fn register<S: ByteSink>(
        writer: &mut BlockWriter<S>,
        name: &str,
        fields: Vec<PodField>,
    ) -> Result<Self> {
        if fields.is_empty() {
            return Err(Error::schema_mismatch(name, "a pod series needs at least one field"));
        }

        let metadata = TypeMetadata::Pod {
            fields: fields.clone(),
        };
        let descriptor = writer
            .register_with_annotations(name, metadata, Default::default())
            .await?;
        Ok(Self { descriptor, fields })
    }

    pub fn channel_id(&self) -> u32 {
        self.descriptor.channel_id
    }

    /// encode packs records into one payload.
    pub fn encode(&self, records: &[&[PodValue]]) -> Result<Vec<u8>> {
        encode_records(self.descriptor.channel_name.as_str(), self.fields.as_slice(), records)
    }

    /// write appends a block holding a single record.
    pub async fn write<S: ByteSink>(
        &self,
        writer: &mut BlockWriter<S>,
        timestamp: i64,
        values: &[PodValue],
    ) -> Result<u64> {
        self.write_batch(writer, timestamp, &[values]).await
    }

    /// write_batch appends a block holding several records sharing one timestamp.
    pub async fn write_batch<S: ByteSink>(
        &self,
        writer: &mut BlockWriter<S>,
        timestamp: i64,
        records: &[&[PodValue]],
    ) -> Result<u64> {
        let payload = self.encode(records)?;
        writer
            .append(self.channel_id(), timestamp, payload.as_slice())
            .await
    }
}

/// PodSeriesReader unpacks the payloads of a POD channel.
#[derive(Debug, Clone)]
pub struct PodSeriesReader {
    descriptor: Arc<SeriesDescriptor>,
    width: usize,
}

impl PodSeriesReader {
    pub fn new(descriptor: Arc<SeriesDescriptor>) -> Result<Self> {
        let width = match descriptor.metadata.record_width() {
            Some(width) if width > 0 => width,
            _ => {
                return Err(Error::schema_mismatch(
                    descriptor.channel_name.as_str(),
                    format!("not a pod series: {}", descriptor.metadata),
                ))
            }
        };
        Ok(Self { descriptor, width })
    }

    pub fn fields(&self) -> &[PodField] {
        match &self.descriptor.metadata {
            TypeMetadata::Pod { fields } => fields.as_slice(),
            _ => &[],
        }
    }

    /// field_index returns the position of the named field within a record.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields().iter().position(|f| f.name == name)
    }

    /// record_width returns the size in bytes of one record.
    pub fn record_width(&self) -> usize {
        self.width
    }

    pub fn decode(&self, block: &Block) -> Result<Vec<PodRecord>> {
        if block.channel_id != self.descriptor.channel_id {
            return Err(Error::schema_mismatch(
                self.descriptor.channel_name.as_str(),
                format!("block of channel {}", block.channel_id),
            ));
        }
        self.decode_payload(block.payload.as_ref())
    }

    /// decode_payload fails with `SchemaMismatch` unless the payload holds a whole number
    /// of records.
    pub fn decode_payload(&self, payload: &[u8]) -> Result<Vec<PodRecord>> {
        if payload.len() % self.width != 0 {
            return Err(Error::schema_mismatch(
                self.descriptor.channel_name.as_str(),
                format!(
                    "payload of {} bytes is not a multiple of the record width {}",
                    payload.len(),
                    self.width
                ),
            ));
        }

        let fields = self.fields();
        let mut b = payload;
        let mut records = Vec::with_capacity(payload.len() / self.width);
        while b.has_remaining() {
            let values = fields
                .iter()
                .map(|field| PodValue::get(field.typ, &mut b))
                .collect();
            records.push(PodRecord { values });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bddf_storage::memory_buffer;
    use common_base::iterator::AsyncIterator;

    use crate::config::{ReaderOptions, WriterOptions};
    use crate::reader::{ScanEntry, StreamReader};
    use crate::series::{PodField, PodType, SeriesDescriptor, TypeMetadata};
    use crate::typed::{PodRecord, PodSeriesReader, PodSeriesWriter, PodValue};
    use crate::writer::BlockWriter;
    use crate::Error;

    #[tokio::test]
    async fn test_temp_scenario() {
        let (sink, source) = memory_buffer();
        let mut writer = BlockWriter::create(sink, WriterOptions::default())
            .await
            .unwrap();
        let temp = PodSeriesWriter::register(
            &mut writer,
            "temp",
            vec![PodField::new("value", PodType::F32)],
        )
        .await
        .unwrap();

        for (ts, v) in [(100, 1.0_f32), (200, 2.5), (300, -3.0)] {
            temp.write(&mut writer, ts, &[PodValue::F32(v)]).await.unwrap();
        }
        writer.finish().await.unwrap();

        let mut reader = StreamReader::open(source, ReaderOptions::default())
            .await
            .unwrap();
        let mut values = vec![];
        let mut timestamps = vec![];
        while let Some(entry) = reader.try_next().await.unwrap() {
            if let ScanEntry::Block(descriptor, block) = entry {
                let decoder = PodSeriesReader::new(descriptor).unwrap();
                for record in decoder.decode(&block).unwrap() {
                    values.push(record.values[0].as_f64());
                }
                timestamps.push(block.timestamp);
            }
        }
        assert_eq!(values, vec![1.0, 2.5, -3.0]);
        assert_eq!(timestamps, vec![100, 200, 300]);
    }

    fn joint_state() -> Arc<SeriesDescriptor> {
        Arc::new(SeriesDescriptor {
            channel_id: 4,
            channel_name: "robot/joint_state".to_string(),
            metadata: TypeMetadata::Pod {
                fields: vec![
                    PodField::new("joint", PodType::U8),
                    PodField::new("position", PodType::F64),
                    PodField::new("ticks", PodType::I32),
                ],
            },
            annotations: Default::default(),
        })
    }

    #[test]
    fn test_decode_multiple_records() {
        let reader = PodSeriesReader::new(joint_state()).unwrap();
        assert_eq!(reader.record_width(), 13);
        assert_eq!(reader.field_index("ticks"), Some(2));

        let fields = reader.fields().to_vec();
        let a = [PodValue::U8(1), PodValue::F64(0.25), PodValue::I32(-7)];
        let b = [PodValue::U8(2), PodValue::F64(-1.5), PodValue::I32(1 << 20)];
        let payload = super::encode_records("robot/joint_state", &fields, &[&a, &b]).unwrap();
        assert_eq!(payload.len(), 26);
        assert_eq!(&payload[..1], &[1]);

        let records = reader.decode_payload(payload.as_slice()).unwrap();
        assert_eq!(
            records,
            vec![PodRecord { values: a.to_vec() }, PodRecord { values: b.to_vec() }]
        );
        assert!(reader.decode_payload(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_schema_mismatch() {
        let reader = PodSeriesReader::new(joint_state()).unwrap();
        assert!(matches!(
            reader.decode_payload(&[0; 14]),
            Err(Error::SchemaMismatch { .. })
        ));

        let fields = reader.fields().to_vec();
        let wrong_type = [PodValue::U8(1), PodValue::F32(0.25), PodValue::I32(-7)];
        assert!(super::encode_records("j", &fields, &[&wrong_type]).is_err());
        let too_short = [PodValue::U8(1)];
        assert!(super::encode_records("j", &fields, &[&too_short]).is_err());

        let blob = Arc::new(SeriesDescriptor {
            channel_id: 0,
            channel_name: "log".to_string(),
            metadata: TypeMetadata::Blob {
                content_type: "text/plain".to_string(),
            },
            annotations: Default::default(),
        });
        assert!(PodSeriesReader::new(blob).is_err());
    }
}
