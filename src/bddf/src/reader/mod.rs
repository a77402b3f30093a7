mod indexed_reader;
mod stream_reader;

pub use indexed_reader::*;
pub use stream_reader::*;
