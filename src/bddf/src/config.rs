use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::format::MAX_PAYLOAD_SIZE;
use crate::{Error, Result};

/// DEFAULT_MAX_PAYLOAD_SIZE is the largest payload a writer accepts unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// The threshold amount of data written before the writer periodically syncs the sink.  This
/// avoids long pauses from one very large sync when a file is finished.
pub const DEFAULT_FSYNC_EVERY: u64 = 25 * 1024 * 1024;

/// DEFAULT_RESYNC_WINDOW bounds how far a reader searches for the next block after corruption.
pub const DEFAULT_RESYNC_WINDOW: u64 = 1024 * 1024;

/// WriterOptions configures a [`crate::BlockWriter`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WriterOptions {
    /// Payloads above this size fail with `PayloadTooLarge`.
    pub max_payload_size: usize,
    /// Sync after this many blocks since the last sync.
    pub flush_every_blocks: Option<u64>,
    /// Sync when this many milliseconds passed since the last sync.
    pub flush_interval_ms: Option<u64>,
    /// Sync after this many bytes since the last sync.
    pub fsync_every_bytes: u64,
    /// Mirror every block into an in-memory index, written as the footer on finish.
    pub build_index: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            flush_every_blocks: None,
            flush_interval_ms: None,
            fsync_every_bytes: DEFAULT_FSYNC_EVERY,
            build_index: true,
        }
    }
}

impl WriterOptions {
    pub fn from_json(s: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(s)?;
        options.validate()?;
        Ok(options)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let s = tokio::fs::read_to_string(path).await?;
        Self::from_json(s.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_payload_size == 0 || self.max_payload_size > MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidOptions(format!(
                "max_payload_size must be within 1..={}, got {}",
                MAX_PAYLOAD_SIZE, self.max_payload_size
            )));
        }
        if self.flush_every_blocks == Some(0) {
            return Err(Error::InvalidOptions(
                "flush_every_blocks must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// ReaderOptions configures the stream and indexed readers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReaderOptions {
    /// How many bytes past a corrupt block are searched for the next block start.
    pub resync_window: u64,
    /// Block headers declaring a larger payload are treated as corrupt.
    pub max_payload_size: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            resync_window: DEFAULT_RESYNC_WINDOW,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl ReaderOptions {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{ReaderOptions, WriterOptions, DEFAULT_MAX_PAYLOAD_SIZE};

    #[test]
    fn test_writer_options_from_json() {
        let options = WriterOptions::from_json(r#"{"flush_every_blocks": 16}"#).unwrap();
        assert_eq!(options.flush_every_blocks, Some(16));
        assert_eq!(options.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);
        assert!(options.build_index);

        assert!(WriterOptions::from_json(r#"{"max_payload_size": 0}"#).is_err());
        assert!(WriterOptions::from_json(r#"{"flush_every_blocks": 0}"#).is_err());
    }

    #[test]
    fn test_reader_options_from_json() {
        let options = ReaderOptions::from_json(r#"{"resync_window": 64}"#).unwrap();
        assert_eq!(options.resync_window, 64);
        assert_eq!(options, ReaderOptions { resync_window: 64, ..Default::default() });
    }
}
