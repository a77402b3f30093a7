use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::ByteSink;

/// FileSink appends to a local file.
pub struct FileSink {
    path: PathBuf,
    f: File,
    len: u64,
}

impl FileSink {
    /// create creates a new file, failing if it already exists.
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let f = OpenOptions::new()
            .create_new(true)
            .write(true)
            .append(true)
            .open(path.as_ref())
            .await?;

        Ok(Self {
            path: path.as_ref().to_owned(),
            f,
            len: 0,
        })
    }

    /// open_append opens an existing file positioned at its end.
    pub async fn open_append(path: impl AsRef<Path>) -> io::Result<Self> {
        let f = OpenOptions::new()
            .write(true)
            .append(true)
            .open(path.as_ref())
            .await?;
        let len = f.metadata().await?.len();

        Ok(Self {
            path: path.as_ref().to_owned(),
            f,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

#[async_trait]
impl ByteSink for FileSink {
    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.f.write_all(data).await?;
        self.len += data.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.f.flush().await
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.f.flush().await?;
        self.f.sync_data().await
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.f.flush().await?;
        self.f.set_len(len).await?;
        self.len = len;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}
