use std::io;
use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use crate::ByteSource;

/// FileSource reads a local file by offset. The length is re-read on every call, so a file
/// that is still being appended to by another handle is observed as it grows.
pub struct FileSource {
    f: Mutex<File>,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let f = File::open(path).await?;
        Ok(Self { f: Mutex::new(f) })
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut f = self.f.lock().await;
        f.seek(SeekFrom::Start(offset)).await?;

        let mut n = 0;
        while n < buf.len() {
            let read = f.read(&mut buf[n..]).await?;
            if read == 0 {
                break;
            }
            n += read;
        }

        Ok(n)
    }

    async fn len(&self) -> io::Result<u64> {
        let f = self.f.lock().await;
        Ok(f.metadata().await?.len())
    }
}
