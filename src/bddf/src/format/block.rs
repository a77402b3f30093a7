use std::fmt::{Display, Formatter};

use bddf_storage::{ByteSource, ByteSourceExt};
use bddf_utils::time::unix_nano_to_time;
use bytes::{BufMut, Bytes};

use crate::format::{BinaryReader, BLOCK_HEADER_SIZE, BLOCK_MAGIC, HEADER_CRC_OFFSET};
use crate::series::TypeKind;
use crate::{Error, Result};

/// RecordKind designates what a record's payload holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// A serialized series descriptor.
    Descriptor,
    /// Application data of a channel.
    Data,
    /// The serialized file index; marks the end of the record section.
    Index,
}

impl RecordKind {
    pub fn value(&self) -> u8 {
        match self {
            Self::Descriptor => 1,
            Self::Data => 2,
            Self::Index => 3,
        }
    }
}

impl TryFrom<u8> for RecordKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Descriptor),
            2 => Ok(Self::Data),
            3 => Ok(Self::Index),
            _ => Err(Error::InvalidFormat(format!("unknown record kind: {}", value))),
        }
    }
}

/// BlockHeader is the fixed size header in front of every record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub kind: RecordKind,
    pub type_kind: TypeKind,
    pub channel_id: u32,
    pub sequence: u64,
    pub timestamp: i64,
    pub payload_len: u32,
    pub checksum: u32,
}

impl BlockHeader {
    /// unmarshal_binary decodes a header and verifies its header checksum.  The record
    /// checksum is read, not verified.
    pub fn unmarshal_binary(b: &[u8]) -> Result<Self> {
        if b.len() >= HEADER_CRC_OFFSET + 4 {
            let mut r = BinaryReader::new(&b[HEADER_CRC_OFFSET..], "block header");
            if crc32fast::hash(&b[..HEADER_CRC_OFFSET]) != r.u32()? {
                return Err(Error::InvalidFormat("block header checksum mismatch".to_string()));
            }
        }
        let mut r = BinaryReader::new(b, "block header");

        let magic = r.u32()?;
        if magic != BLOCK_MAGIC {
            return Err(Error::InvalidFormat(format!("bad block magic: {:#010x}", magic)));
        }

        let kind = RecordKind::try_from(r.u8()?)?;
        let type_kind = TypeKind::try_from(r.u8()?)?;
        let channel_id = r.u32()?;
        let sequence = r.u64()?;
        let timestamp = r.i64()?;
        let payload_len = r.u32()?;
        let _header_crc = r.u32()?;
        let checksum = r.u32()?;

        Ok(Self {
            kind,
            type_kind,
            channel_id,
            sequence,
            timestamp,
            payload_len,
            checksum,
        })
    }

    /// append_to writes the header up to, not including, the record checksum.
    fn append_to(&self, b: &mut Vec<u8>) {
        let start = b.len();
        b.put_u32(BLOCK_MAGIC);
        b.put_u8(self.kind.value());
        b.put_u8(self.type_kind.value());
        b.put_u32(self.channel_id);
        b.put_u64(self.sequence);
        b.put_i64(self.timestamp);
        b.put_u32(self.payload_len);
        let header_crc = crc32fast::hash(&b[start..]);
        b.put_u32(header_crc);
    }

    /// size returns the total size of the record in bytes.
    pub fn size(&self) -> u64 {
        BLOCK_HEADER_SIZE as u64 + self.payload_len as u64
    }
}

/// encode_record frames payload as a complete record, checksum included.
pub fn encode_record(
    kind: RecordKind,
    type_kind: TypeKind,
    channel_id: u32,
    sequence: u64,
    timestamp: i64,
    payload: &[u8],
) -> Vec<u8> {
    let mut header = BlockHeader {
        kind,
        type_kind,
        channel_id,
        sequence,
        timestamp,
        payload_len: payload.len() as u32,
        checksum: 0,
    };

    let mut b = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
    header.append_to(&mut b);
    header.checksum = checksum(b.as_slice(), payload);
    b.put_u32(header.checksum);
    b.extend_from_slice(payload);
    b
}

/// checksum computes the CRC32 of the header bytes before the record checksum plus payload.
fn checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[..BLOCK_HEADER_SIZE - 4]);
    hasher.update(payload);
    hasher.finalize()
}

/// Block is one record of a channel as read back from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub channel_id: u32,
    pub type_kind: TypeKind,
    pub timestamp: i64,
    pub sequence: u64,
    pub payload: Bytes,
    pub checksum: u32,
    /// Absolute position of the record in the file.
    pub offset: u64,
}

impl Block {
    pub(crate) fn new(header: &BlockHeader, payload: Bytes, offset: u64) -> Self {
        Self {
            channel_id: header.channel_id,
            type_kind: header.type_kind,
            timestamp: header.timestamp,
            sequence: header.sequence,
            payload,
            checksum: header.checksum,
            offset,
        }
    }

    pub fn payload_len(&self) -> u32 {
        self.payload.len() as u32
    }

    /// size returns the size of the framed record in bytes.
    pub fn size(&self) -> u64 {
        BLOCK_HEADER_SIZE as u64 + self.payload.len() as u64
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ch={} seq={} time={} ofs={} len={}",
            self.channel_id,
            self.sequence,
            unix_nano_to_time(self.timestamp),
            self.offset,
            self.payload.len(),
        )
    }
}

/// RecordRead is the outcome of reading one record at an offset.
#[derive(Debug)]
pub(crate) enum RecordRead {
    /// A complete record with a valid checksum.
    Complete(BlockHeader, Bytes),
    /// The record extends past the readable bytes: not written yet, or torn.
    Incomplete,
    /// The bytes at the offset are not a valid record.
    Corrupt(String),
}

/// read_record reads the record at offset, never reading past avail.
pub(crate) async fn read_record<R: ByteSource + ?Sized>(
    r: &R,
    offset: u64,
    avail: u64,
    max_payload_size: usize,
) -> Result<RecordRead> {
    let end = match offset.checked_add(BLOCK_HEADER_SIZE as u64) {
        Some(end) => end,
        None => return Ok(RecordRead::Corrupt(format!("offset {} out of range", offset))),
    };
    if end > avail {
        return Ok(RecordRead::Incomplete);
    }

    let mut buf = [0_u8; BLOCK_HEADER_SIZE];
    r.read_exact_at(offset, &mut buf).await?;

    let header = match BlockHeader::unmarshal_binary(&buf) {
        Ok(header) => header,
        Err(e) => return Ok(RecordRead::Corrupt(e.to_string())),
    };
    // the index grows with the file and is only bounded by the length field
    if header.kind != RecordKind::Index && header.payload_len as usize > max_payload_size {
        return Ok(RecordRead::Corrupt(format!(
            "payload length {} exceeds {}",
            header.payload_len, max_payload_size
        )));
    }
    // the header checksum held, so the length is trusted: a short record is a torn tail
    if offset + header.size() > avail {
        return Ok(RecordRead::Incomplete);
    }

    let payload = r
        .read_vec(offset + BLOCK_HEADER_SIZE as u64, header.payload_len as usize)
        .await?;
    if checksum(&buf, payload.as_slice()) != header.checksum {
        return Ok(RecordRead::Corrupt("checksum mismatch".to_string()));
    }

    Ok(RecordRead::Complete(header, Bytes::from(payload)))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::format::block::{encode_record, read_record, BlockHeader, RecordKind, RecordRead};
    use crate::format::{BLOCK_HEADER_SIZE, MAX_PAYLOAD_SIZE};
    use crate::series::TypeKind;

    #[test]
    fn test_crc() {
        let checksum = crc32fast::hash("adsafafas".as_bytes());
        assert_eq!(checksum, 2344674872);
    }

    #[test]
    fn test_encode_record_layout() {
        let b = encode_record(RecordKind::Data, TypeKind::Blob, 7, 3, -5, b"hi");
        assert_eq!(b.len(), BLOCK_HEADER_SIZE + 2);
        assert_eq!(&b[..4], &[0xBD, 0xDF, 0x0B, 0x1C]);

        let header = BlockHeader::unmarshal_binary(&b[..BLOCK_HEADER_SIZE]).unwrap();
        assert_eq!(header.kind, RecordKind::Data);
        assert_eq!(header.type_kind, TypeKind::Blob);
        assert_eq!(header.channel_id, 7);
        assert_eq!(header.sequence, 3);
        assert_eq!(header.timestamp, -5);
        assert_eq!(header.payload_len, 2);
        assert_eq!(header.size(), b.len() as u64);
    }

    #[tokio::test]
    async fn test_read_record() {
        let b = encode_record(RecordKind::Data, TypeKind::Pod, 1, 0, 100, b"payload");
        let len = b.len() as u64;
        let source = Bytes::from(b.clone());

        match read_record(&source, 0, len, MAX_PAYLOAD_SIZE).await.unwrap() {
            RecordRead::Complete(header, payload) => {
                assert_eq!(header.channel_id, 1);
                assert_eq!(payload.as_ref(), b"payload");
            }
            r => panic!("unexpected {:?}", r),
        }

        // a reader that may only see a prefix treats the record as not written yet
        for avail in 0..len {
            assert!(matches!(
                read_record(&source, 0, avail, MAX_PAYLOAD_SIZE).await.unwrap(),
                RecordRead::Incomplete
            ));
        }

        let mut corrupt = b.clone();
        corrupt[BLOCK_HEADER_SIZE] ^= 0x01;
        let source = Bytes::from(corrupt);
        assert!(matches!(
            read_record(&source, 0, len, MAX_PAYLOAD_SIZE).await.unwrap(),
            RecordRead::Corrupt(_)
        ));

        let source = Bytes::from(b);
        assert!(matches!(
            read_record(&source, 0, len, 3).await.unwrap(),
            RecordRead::Corrupt(_)
        ));
    }

    #[tokio::test]
    async fn test_damaged_length_is_corrupt() {
        let mut b = encode_record(RecordKind::Data, TypeKind::Blob, 1, 0, 100, b"payload");
        b.extend(encode_record(RecordKind::Data, TypeKind::Blob, 1, 1, 200, b"next"));
        let len = b.len() as u64;

        // a length pointing past the end must not pass for a torn tail
        b[26] ^= 0x01;
        let source = Bytes::from(b);
        assert!(matches!(
            read_record(&source, 0, len, MAX_PAYLOAD_SIZE).await.unwrap(),
            RecordRead::Corrupt(_)
        ));
        assert!(BlockHeader::unmarshal_binary(&source[..BLOCK_HEADER_SIZE]).is_err());
        assert!(matches!(
            read_record(&source, u64::MAX - 2, len, MAX_PAYLOAD_SIZE).await.unwrap(),
            RecordRead::Corrupt(_)
        ));
    }
}
