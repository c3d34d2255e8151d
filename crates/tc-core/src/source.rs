//! Origin content access
//!
//! The cache layer never knows where origin bytes come from (synced files,
//! a network download, a bundled default). It only asks a `ContentSource`
//! to open a logical path and, for staleness checks, to describe it.

use std::io::Read;
use std::time::SystemTime;

use crate::error::TableResult;

/// What is known about an origin document without reading it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMetadata {
    /// Size in bytes
    pub len: u64,

    /// Last modification time, when the backing store reports one
    pub modified: Option<SystemTime>,
}

/// Byte-stream opener for origin documents
pub trait ContentSource: Send + Sync {
    /// Open the document at `path`, resolving the freshest available copy
    fn open(&self, path: &str) -> TableResult<Box<dyn Read + Send>>;

    /// Describe the copy `open` would currently return, if that is cheap to know
    fn metadata(&self, _path: &str) -> Option<SourceMetadata> {
        None
    }

    /// Modification time of the copy `open` would currently return
    fn modified(&self, path: &str) -> Option<SystemTime> {
        self.metadata(path).and_then(|m| m.modified)
    }
}

impl<T: ContentSource + ?Sized> ContentSource for std::sync::Arc<T> {
    fn open(&self, path: &str) -> TableResult<Box<dyn Read + Send>> {
        (**self).open(path)
    }

    fn metadata(&self, path: &str) -> Option<SourceMetadata> {
        (**self).metadata(path)
    }

    fn modified(&self, path: &str) -> Option<SystemTime> {
        (**self).modified(path)
    }
}
