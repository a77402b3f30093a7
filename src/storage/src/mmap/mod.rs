use std::io;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use tokio::fs::File;

use crate::{copy_at, ByteSource};

/// MmapSource maps a file read-only. The mapping is a snapshot of the length at open time,
/// so it suits finalized files; use [`crate::FileSource`] to follow a file that is still
/// being written.
pub struct MmapSource {
    _f: File,
    mmap: Option<Mmap>,
}

impl MmapSource {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let f = File::open(path).await?;

        let meta = f.metadata().await?;
        let len = meta.len() as usize;

        // zero length mappings are rejected by some platforms
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { MmapOptions::new().offset(0).len(len).map(&f)? })
        };

        Ok(Self { _f: f, mmap })
    }

    fn data(&self) -> &[u8] {
        self.mmap.as_ref().map(|m| &m[..]).unwrap_or_default()
    }
}

#[async_trait]
impl ByteSource for MmapSource {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        Ok(copy_at(self.data(), offset, buf))
    }

    async fn len(&self) -> io::Result<u64> {
        Ok(self.data().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use tokio::fs::File;
    use tokio::io;
    use tokio::io::AsyncWriteExt;

    use crate::mmap::MmapSource;
    use crate::ByteSource;

    #[tokio::test]
    async fn test_mmap_source() -> io::Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("mmap_test");

        let data = "0123456789".as_bytes();
        {
            let mut f = File::create(&path).await?;
            f.write_all(data).await?;
            f.sync_all().await?;
        }

        let source = MmapSource::open(&path).await?;
        assert_eq!(source.len().await?, 10);

        let mut buf = vec![0_u8; data.len()];
        source.read_at(0, &mut buf[..]).await?;
        assert_eq!(buf.as_slice(), data);

        Ok(())
    }

    #[tokio::test]
    async fn test_mmap_empty_file() -> io::Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("mmap_empty");
        File::create(&path).await?;

        let source = MmapSource::open(&path).await?;
        assert_eq!(source.len().await?, 0);

        Ok(())
    }
}
