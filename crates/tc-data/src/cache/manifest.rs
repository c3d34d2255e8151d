//! Build manifest stored next to a dataset's pages

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tc_core::TableResult;
use uuid::Uuid;

use super::codec::{read_json, write_json};
use super::MANIFEST_FILE;

/// Bumped whenever the on-disk layout changes; older caches rebuild
pub const SCHEMA_VERSION: u32 = 2;

/// What the cache was built from, and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub schema_version: u32,
    pub page_size: usize,
    pub origin_path: String,
    pub table_name: String,
    pub origin: OriginFingerprint,
    /// Changes on every rebuild; readers use it to detect a swapped cache
    pub build_id: Uuid,
    pub built_at: DateTime<Utc>,
    /// Row count of each page, in page order
    pub page_rows: Vec<usize>,
}

/// Identity of the origin bytes a cache was built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginFingerprint {
    pub len: u64,
    /// Milliseconds since the Unix epoch
    pub modified_ms: Option<i64>,
    /// Lowercase hex SHA-256 of the origin bytes
    pub sha256: String,
}

/// Why a cache no longer matches its origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    NoValidCache,
    NoManifest,
    SchemaChanged,
    PageSizeChanged,
    OriginResized,
    OriginModified,
    ContentChanged,
}

impl CacheManifest {
    /// Load `manifest.json`; `None` when absent or unreadable
    pub fn load(dataset_dir: &Path) -> Option<Self> {
        read_json(&dataset_dir.join(MANIFEST_FILE)).ok()
    }

    pub fn save(&self, dataset_dir: &Path) -> TableResult<()> {
        write_json(&dataset_dir.join(MANIFEST_FILE), self)
    }

    pub fn total_rows(&self) -> usize {
        self.page_rows.iter().sum()
    }

    /// Compare against the current layout and cheap origin metadata.
    ///
    /// Returns `None` when nothing cheap says the cache is out of date.
    pub fn check(&self, page_size: usize, len: Option<u64>, modified: Option<SystemTime>) -> Option<StaleReason> {
        if self.schema_version != SCHEMA_VERSION {
            return Some(StaleReason::SchemaChanged);
        }
        if self.page_size != page_size {
            return Some(StaleReason::PageSizeChanged);
        }
        if let Some(len) = len {
            if len != self.origin.len {
                return Some(StaleReason::OriginResized);
            }
        }
        if let (Some(now), Some(built)) = (modified.and_then(to_millis), self.origin.modified_ms) {
            if now > built {
                return Some(StaleReason::OriginModified);
            }
        }
        None
    }
}

/// Milliseconds since the Unix epoch; `None` for pre-epoch times
pub fn to_millis(time: SystemTime) -> Option<i64> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_millis()).ok())
}
