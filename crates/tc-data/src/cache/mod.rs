//! Paged on-disk table cache
//!
//! Layout of one dataset directory:
//!
//! ```text
//! <cache_root>/<dataset key>/headers.json
//! <cache_root>/<dataset key>/widths.json       (optional)
//! <cache_root>/<dataset key>/manifest.json
//! <cache_root>/<dataset key>/pages/page_00000.json.gz
//! <cache_root>/<dataset key>/pages/page_00001.json.gz
//! ```

pub mod codec;
pub mod integrity;
pub mod manager;
pub mod manifest;

use std::fmt;

pub use integrity::IntegrityChecker;
pub use manager::{CacheManager, RebuildOutcome, RebuildReport};
pub use manifest::{CacheManifest, OriginFingerprint, StaleReason, SCHEMA_VERSION};

pub const HEADERS_FILE: &str = "headers.json";
pub const WIDTHS_FILE: &str = "widths.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const PAGES_DIR: &str = "pages";

/// Health of a dataset's cache directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Headers file or pages directory absent
    Missing,
    /// No page files
    Empty,
    /// `(failed, sampled)` sampled pages did not decode
    Corrupted(usize, usize),
    /// Readable; total data rows
    Valid(usize),
}

impl CacheStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, CacheStatus::Valid(_))
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStatus::Missing => write!(f, "missing"),
            CacheStatus::Empty => write!(f, "empty"),
            CacheStatus::Corrupted(failed, sampled) => {
                write!(f, "corrupted ({failed} of {sampled} sampled pages unreadable)")
            }
            CacheStatus::Valid(rows) => write!(f, "valid ({rows} rows)"),
        }
    }
}
