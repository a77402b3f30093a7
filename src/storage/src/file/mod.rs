pub mod readable_file;
pub mod writable_file;
