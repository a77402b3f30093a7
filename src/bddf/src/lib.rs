//! BDDF is an append-only container for timestamped robot telemetry.
//!
//! A writer session registers channels, each typed as POD records, protobuf messages or
//! opaque blobs, and appends blocks to a [`bddf_storage::ByteSink`].  Every block is
//! self-delimiting and checksummed, so [`StreamReader`] can walk a file that is still
//! being written, or one that was cut short by a crash.  Finishing a session appends an
//! index and a trailer that [`IndexedReader`] uses for random access by channel and time.

#[macro_use]
extern crate async_trait;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate tracing;

pub mod config;
pub mod error;
pub mod format;
pub mod index;
pub mod reader;
pub mod series;
pub mod session;
pub mod typed;
pub mod writer;

pub use config::{ReaderOptions, WriterOptions};
pub use error::{Error, Result};
pub use format::block::Block;
pub use format::header::FileHeader;
pub use index::{build_index, finalize_file, FileIndexer, Index, IndexEntry};
pub use reader::{IndexedReader, ScanEntry, StreamReader};
pub use series::{SeriesDescriptor, SeriesRegistry, TypeKind, TypeMetadata};
pub use session::Session;
pub use writer::{BlockWriter, ChannelWriter, SharedBlockWriter};
