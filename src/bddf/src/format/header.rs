use std::collections::BTreeMap;

use bddf_storage::{ByteSource, ByteSourceExt};
use bytes::BufMut;

use crate::format::{put_str16, BinaryReader, MAGIC, VERSION};
use crate::{Error, Result};

/// magic + version + header length
const HEADER_PREFIX_SIZE: usize = 4 + 1 + 4;

/// prefix + created + annotation count + crc
const MIN_HEADER_SIZE: usize = HEADER_PREFIX_SIZE + 8 + 2 + 4;

/// Upper bound of a header, annotations included.
const MAX_HEADER_SIZE: usize = 1024 * 1024;

/// FileHeader opens every file: format identification plus session metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u8,
    /// Session creation time in unix nanoseconds.
    pub created_nanos: i64,
    /// Free-form session annotations (robot name, software version, ...).
    pub annotations: BTreeMap<String, String>,
}

impl FileHeader {
    pub fn new(created_nanos: i64, annotations: BTreeMap<String, String>) -> Self {
        Self {
            version: VERSION,
            created_nanos,
            annotations,
        }
    }

    pub fn marshal_binary(&self) -> Result<Vec<u8>> {
        let mut b = Vec::with_capacity(MIN_HEADER_SIZE);
        b.extend_from_slice(&MAGIC);
        b.put_u8(self.version);
        // length, patched below
        b.put_u32(0);
        b.put_i64(self.created_nanos);
        b.put_u16(self.annotations.len() as u16);
        for (k, v) in &self.annotations {
            put_str16(&mut b, k)?;
            put_str16(&mut b, v)?;
        }

        let len = b.len() + 4;
        if len > MAX_HEADER_SIZE {
            return Err(Error::InvalidFormat(format!(
                "header too large: {} > {}",
                len, MAX_HEADER_SIZE
            )));
        }
        b[5..9].copy_from_slice(&(len as u32).to_be_bytes());

        let checksum = crc32fast::hash(b.as_slice());
        b.put_u32(checksum);
        Ok(b)
    }

    /// unmarshal_binary decodes a complete header.
    pub fn unmarshal_binary(b: &[u8]) -> Result<Self> {
        if b.len() < MIN_HEADER_SIZE {
            return Err(Error::InvalidFormat(format!(
                "header: short buf: {} < {}",
                b.len(),
                MIN_HEADER_SIZE
            )));
        }

        let (body, crc) = b.split_at(b.len() - 4);
        let checksum = BinaryReader::new(crc, "header").u32()?;
        if crc32fast::hash(body) != checksum {
            return Err(Error::InvalidFormat("header checksum mismatch".to_string()));
        }

        let mut r = BinaryReader::new(body, "header");
        let magic = r.bytes(MAGIC.len())?;
        if magic != MAGIC {
            return Err(Error::InvalidFormat("not a bddf file".to_string()));
        }
        let version = r.u8()?;
        let _len = r.u32()?;
        let created_nanos = r.i64()?;

        let count = r.u16()?;
        let mut annotations = BTreeMap::new();
        for _ in 0..count {
            let k = r.str16()?;
            let v = r.str16()?;
            annotations.insert(k, v);
        }
        r.finish()?;

        Ok(Self {
            version,
            created_nanos,
            annotations,
        })
    }

    /// read_from reads the header at the start of source.  Returns `None` when the source
    /// does not hold the complete header yet; fails when the bytes present cannot be the
    /// start of a BDDF file.
    pub async fn read_from<R: ByteSource + ?Sized>(r: &R) -> Result<Option<(Self, u64)>> {
        let avail = r.len().await?;

        if avail < HEADER_PREFIX_SIZE as u64 {
            let n = (avail as usize).min(MAGIC.len());
            let prefix = r.read_vec(0, n).await?;
            if prefix.as_slice() != &MAGIC[..n] {
                return Err(Error::InvalidFormat("not a bddf file".to_string()));
            }
            return Ok(None);
        }

        let prefix = r.read_vec(0, HEADER_PREFIX_SIZE).await?;
        if prefix[..4] != MAGIC {
            return Err(Error::InvalidFormat("not a bddf file".to_string()));
        }
        if prefix[4] != VERSION {
            return Err(Error::InvalidFormat(format!(
                "file is version {}. expected {}",
                prefix[4], VERSION
            )));
        }

        let len = BinaryReader::new(&prefix[5..], "header").u32()? as usize;
        if !(MIN_HEADER_SIZE..=MAX_HEADER_SIZE).contains(&len) {
            return Err(Error::InvalidFormat(format!("invalid header length: {}", len)));
        }
        if avail < len as u64 {
            return Ok(None);
        }

        let b = r.read_vec(0, len).await?;
        let header = Self::unmarshal_binary(b.as_slice())?;
        Ok(Some((header, len as u64)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bytes::Bytes;

    use crate::format::header::FileHeader;

    #[tokio::test]
    async fn test_header_read_from() {
        let mut annotations = BTreeMap::new();
        annotations.insert("robot".to_string(), "spot-0042".to_string());
        let header = FileHeader::new(1_000, annotations);

        let b = header.marshal_binary().unwrap();
        let (decoded, len) = FileHeader::read_from(&Bytes::from(b.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decoded, header);
        assert_eq!(len, b.len() as u64);

        // every strict prefix is "not yet available"
        for n in 0..b.len() {
            let partial = Bytes::copy_from_slice(&b[..n]);
            assert!(FileHeader::read_from(&partial).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_header_bad_magic() {
        let b = Bytes::from_static(b"TSM1\x01\x00\x00\x00\x17");
        assert!(FileHeader::read_from(&b).await.is_err());

        let b = Bytes::from_static(b"BX");
        assert!(FileHeader::read_from(&b).await.is_err());
    }

    #[tokio::test]
    async fn test_header_bad_checksum() {
        let header = FileHeader::new(1_000, BTreeMap::new());
        let mut b = header.marshal_binary().unwrap();
        b[10] ^= 0xff;
        assert!(FileHeader::read_from(&Bytes::from(b)).await.is_err());
    }
}
