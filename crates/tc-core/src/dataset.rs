//! Dataset identity

use std::fmt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex digits of the identity digest appended to every cache key
const KEY_DIGEST_CHARS: usize = 12;

/// A named logical table: the origin document plus the sheet inside it.
///
/// The cache and the refresh watcher both operate on datasets as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dataset {
    /// Logical path of the origin document, as understood by a `ContentSource`
    pub origin_path: String,

    /// Sheet/table name inside the origin document
    pub table_name: String,
}

impl Dataset {
    /// Create a new dataset
    pub fn new(origin_path: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            origin_path: origin_path.into(),
            table_name: table_name.into(),
        }
    }

    /// Directory name used for this dataset under the cache root.
    ///
    /// Path separators and characters that are unsafe in file names are
    /// replaced to keep the name flat and readable. Since that replacement is
    /// lossy, a digest of the exact (origin, table) pair is appended so that
    /// distinct datasets never share a directory.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.origin_path.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.table_name.as_bytes());
        let digest = format!("{:x}", hasher.finalize());

        format!(
            "{}__{}-{}",
            sanitize_component(&self.origin_path),
            sanitize_component(&self.table_name),
            &digest[..KEY_DIGEST_CHARS]
        )
    }

    /// File name of the origin document (last path component)
    pub fn origin_file_name(&self) -> &str {
        self.origin_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.origin_path)
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.origin_path, self.table_name)
    }
}

fn sanitize_component(value: &str) -> String {
    value
        .trim_start_matches('/')
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
