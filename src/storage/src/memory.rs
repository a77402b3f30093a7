use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;

use crate::{copy_at, ByteSink, ByteSource};

/// Arena is an append-only byte buffer shared by one writer and many readers. `durable` is
/// the published length: readers never look past it, and the writer advances it only after
/// a whole append has landed in `data`.
struct Arena {
    data: RwLock<Vec<u8>>,
    durable: AtomicU64,
}

/// memory_buffer creates an in-memory arena and returns its single writing end together
/// with a cloneable reading end.
pub fn memory_buffer() -> (MemorySink, MemorySource) {
    let arena = Arc::new(Arena {
        data: RwLock::new(Vec::new()),
        durable: AtomicU64::new(0),
    });

    (
        MemorySink {
            arena: arena.clone(),
        },
        MemorySource { arena },
    )
}

/// MemorySink is the writing end of the arena. It is deliberately not `Clone`.
pub struct MemorySink {
    arena: Arc<Arena>,
}

impl MemorySink {
    /// source returns a new reading end over the same arena.
    pub fn source(&self) -> MemorySource {
        MemorySource {
            arena: self.arena.clone(),
        }
    }
}

#[async_trait]
impl ByteSink for MemorySink {
    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        let mut buf = self.arena.data.write().await;
        buf.extend_from_slice(data);
        self.arena
            .durable
            .store(buf.len() as u64, Ordering::Release);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        let mut buf = self.arena.data.write().await;
        buf.truncate(len as usize);
        self.arena
            .durable
            .store(buf.len() as u64, Ordering::Release);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.arena.durable.load(Ordering::Acquire)
    }
}

/// MemorySource is a reading end of the arena.
#[derive(Clone)]
pub struct MemorySource {
    arena: Arc<Arena>,
}

impl MemorySource {
    /// snapshot copies the currently published bytes.
    pub async fn snapshot(&self) -> Bytes {
        let durable = self.arena.durable.load(Ordering::Acquire) as usize;
        let buf = self.arena.data.read().await;
        Bytes::copy_from_slice(&buf[..durable.min(buf.len())])
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let durable = self.arena.durable.load(Ordering::Acquire) as usize;
        let data = self.arena.data.read().await;
        Ok(copy_at(&data[..durable.min(data.len())], offset, buf))
    }

    async fn len(&self) -> io::Result<u64> {
        Ok(self.arena.durable.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use crate::memory::memory_buffer;
    use crate::{ByteSink, ByteSource};

    #[tokio::test]
    async fn test_memory_buffer() -> std::io::Result<()> {
        let (mut sink, source) = memory_buffer();
        assert_eq!(source.len().await?, 0);

        sink.append(b"abc").await?;
        let other = sink.source();
        assert_eq!(source.len().await?, 3);
        assert_eq!(other.len().await?, 3);

        let mut buf = [0_u8; 8];
        assert_eq!(source.read_at(1, &mut buf).await?, 2);
        assert_eq!(&buf[..2], b"bc");

        sink.append(b"def").await?;
        sink.truncate(4).await?;
        assert_eq!(source.snapshot().await.as_ref(), b"abcd");
        assert_eq!(sink.len(), 4);

        Ok(())
    }
}
