//! Table readers and origin access

pub mod cached_source;
pub mod fs_content;
pub mod live_source;

pub use cached_source::{CachedTableReader, PageDiagnostic};
pub use fs_content::{LayeredContentSource, RemoteFetcher};
pub use live_source::{LiveTableReader, LIVE_SEARCH_ROW_LIMIT};
