use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A channel name is already registered with a different schema.
    #[error("channel {name} already registered as {channel_id} with different metadata")]
    DuplicateChannel { name: String, channel_id: u32 },

    #[error("unknown channel: {0}")]
    UnknownChannel(u32),

    #[error("invalid channel name: {0:?}")]
    InvalidChannelName(String),

    /// Payloads are never split; the caller chunks oversized records.
    #[error("payload too large: {size} > {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("corrupt block at offset {offset}: {reason}")]
    CorruptBlock { offset: u64, reason: String },

    #[error("schema mismatch on channel {channel}: {reason}")]
    SchemaMismatch { channel: String, reason: String },

    #[error("decode error on channel {channel}: {reason}")]
    Decode { channel: String, reason: String },

    #[error("index inconsistent: {0}")]
    IndexInconsistent(String),

    /// The file framing itself is unrecognizable (bad magic, footer out of bounds, ...).
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// A failed write left bytes in the sink that could not be removed.
    #[error("writer poisoned by a failed write at offset {0}")]
    WriterPoisoned(u64),

    #[error("writer still shared by {0} handles")]
    WriterShared(usize),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf error: {0}")]
    Protobuf(#[from] protobuf::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn schema_mismatch(channel: &str, reason: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn decode(channel: &str, reason: impl ToString) -> Self {
        Self::Decode {
            channel: channel.to_string(),
            reason: reason.to_string(),
        }
    }
}
