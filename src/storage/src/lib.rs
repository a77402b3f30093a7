//! Byte source and byte sink collaborators for BDDF readers and writers.
//!
//! Writers append to a [`ByteSink`]; readers pull from a [`ByteSource`]. A source reports
//! only the bytes that are safe to read: for files this is the current file length, for the
//! in-memory arena it is the durable length the writer last published.

#[macro_use]
extern crate async_trait;

use std::io;
use std::io::ErrorKind;
use std::sync::Arc;

use bytes::Bytes;

pub mod file;
pub mod memory;
pub mod mmap;

pub use file::readable_file::FileSource;
pub use file::writable_file::FileSink;
pub use memory::{memory_buffer, MemorySink, MemorySource};
pub use mmap::MmapSource;

#[async_trait]
pub trait ByteSource: Send + Sync {
    /// read_at copies bytes starting at offset into buf and returns how many were copied.
    /// Reads that run past the end of the source are short, never an error.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// len returns the number of bytes currently readable.
    async fn len(&self) -> io::Result<u64>;
}

#[async_trait]
pub trait ByteSourceExt: ByteSource {
    async fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let n = self.read_at(offset, buf).await?;
        if n != buf.len() {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("short read at {}: {} < {}", offset, n, buf.len()),
            ));
        }
        Ok(())
    }

    async fn read_vec(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        self.read_exact_at(offset, buf.as_mut_slice()).await?;
        Ok(buf)
    }

    async fn read_u32(&self, offset: u64) -> io::Result<u32> {
        let mut buf = [0; 4];
        self.read_exact_at(offset, &mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }

    async fn read_u64(&self, offset: u64) -> io::Result<u64> {
        let mut buf = [0; 8];
        self.read_exact_at(offset, &mut buf).await?;
        Ok(u64::from_be_bytes(buf))
    }
}

impl<R: ByteSource + ?Sized> ByteSourceExt for R {}

#[async_trait]
impl<R: ByteSource + ?Sized> ByteSource for Arc<R> {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf).await
    }

    async fn len(&self) -> io::Result<u64> {
        (**self).len().await
    }
}

#[async_trait]
impl<R: ByteSource + ?Sized> ByteSource for Box<R> {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf).await
    }

    async fn len(&self) -> io::Result<u64> {
        (**self).len().await
    }
}

/// An immutable in-memory snapshot, handy for whole-file buffers.
#[async_trait]
impl ByteSource for Bytes {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        Ok(copy_at(self.as_ref(), offset, buf))
    }

    async fn len(&self) -> io::Result<u64> {
        Ok(Bytes::len(self) as u64)
    }
}

/// ByteSink is the append-only destination of a writer.
#[async_trait]
pub trait ByteSink: Send {
    /// append writes all of data at the end of the sink.
    async fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// flush pushes buffered bytes to the underlying resource.
    async fn flush(&mut self) -> io::Result<()>;

    /// sync flushes and makes the written bytes durable.
    async fn sync(&mut self) -> io::Result<()>;

    /// truncate shrinks the sink to len bytes; later appends continue from there.
    async fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// len returns the current size of the sink in bytes.
    fn len(&self) -> u64;
}

pub(crate) fn copy_at(data: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    if offset >= data.len() as u64 {
        return 0;
    }

    let offset = offset as usize;
    let n = buf.len().min(data.len() - offset);
    buf[..n].copy_from_slice(&data[offset..offset + n]);
    n
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::{ByteSource, ByteSourceExt};

    #[tokio::test]
    async fn test_bytes_source() {
        let data = Bytes::from_static(&[0, 0, 0, 7, 1, 2]);
        assert_eq!(ByteSource::len(&data).await.unwrap(), 6);
        assert_eq!(data.read_u32(0).await.unwrap(), 7);

        let mut buf = [0_u8; 4];
        assert_eq!(data.read_at(4, &mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], &[1, 2]);
        assert_eq!(data.read_at(10, &mut buf).await.unwrap(), 0);
        assert!(data.read_u64(0).await.is_err());
    }
}
