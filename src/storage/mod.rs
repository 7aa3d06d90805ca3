//! Storage Module - Local file tree behind a bounded handle cache
//!
//! All byte-level access to the drive's root directory goes through
//! [`FileStore`], which is the only owner of raw OS file handles.

mod handle_cache;
mod reader;

pub use handle_cache::{EntryInfo, FileStore};
pub use reader::FileReader;
