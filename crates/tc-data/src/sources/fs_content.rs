//! Filesystem-backed origin access with an optional remote tier

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tc_core::{ContentSource, SourceMetadata, TableError, TableResult};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::guard::SizeGuard;

/// Downloads origin documents by logical path
pub trait RemoteFetcher: Send + Sync {
    fn fetch(&self, path: &str) -> TableResult<Vec<u8>>;
}

/// Resolves a logical path against, in order:
///
/// 1. the synced directory (files pushed by a sync job),
/// 2. the remote fetcher, persisting what it returns into the remote cache directory,
/// 3. the last copy persisted in the remote cache directory,
/// 4. the bundled directory (defaults shipped with the application).
#[derive(Default)]
pub struct LayeredContentSource {
    synced_dir: Option<PathBuf>,
    remote: Option<Arc<dyn RemoteFetcher>>,
    remote_cache_dir: Option<PathBuf>,
    bundled_dir: Option<PathBuf>,
    guard: SizeGuard,
}

impl LayeredContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_synced_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.synced_dir = Some(dir.into());
        self
    }

    /// Fetch through `fetcher`, keeping successful downloads under `cache_dir`
    pub fn with_remote(mut self, fetcher: Arc<dyn RemoteFetcher>, cache_dir: impl Into<PathBuf>) -> Self {
        self.remote = Some(fetcher);
        self.remote_cache_dir = Some(cache_dir.into());
        self
    }

    pub fn with_bundled_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundled_dir = Some(dir.into());
        self
    }

    pub fn with_size_guard(mut self, guard: SizeGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Local copies `open` may pick, in preference order (network excluded)
    fn local_candidates(&self, relative: &Path) -> Vec<PathBuf> {
        [&self.synced_dir, &self.remote_cache_dir, &self.bundled_dir]
            .into_iter()
            .flatten()
            .map(|dir| dir.join(relative))
            .collect()
    }

    fn fetch_remote(&self, path: &str, relative: &Path) -> Option<PathBuf> {
        let (fetcher, cache_dir) = match (&self.remote, &self.remote_cache_dir) {
            (Some(f), Some(d)) => (f, d),
            _ => return None,
        };

        let bytes = match fetcher.fetch(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Remote fetch of {} failed, falling back: {}", path, e);
                return None;
            }
        };
        if let Err(e) = self.guard.check_file_size(path, bytes.len() as u64) {
            warn!("Discarding remote copy of {}: {}", path, e);
            return None;
        }

        let target = cache_dir.join(relative);
        if same_contents(&target, &bytes) {
            // Keep the stored copy, and with it the mtime caches were built against
            debug!("Remote copy of {} is unchanged", path);
            return Some(target);
        }
        match persist(&target, &bytes) {
            Ok(()) => Some(target),
            Err(e) => {
                warn!("Cannot store remote copy of {}: {}", path, e);
                None
            }
        }
    }
}

impl ContentSource for LayeredContentSource {
    fn open(&self, path: &str) -> TableResult<Box<dyn Read + Send>> {
        let relative = safe_relative(path)?;

        if let Some(dir) = &self.synced_dir {
            let candidate = dir.join(&relative);
            if candidate.is_file() {
                return Ok(Box::new(File::open(candidate)?));
            }
        }

        if let Some(fetched) = self.fetch_remote(path, &relative) {
            return Ok(Box::new(File::open(fetched)?));
        }

        for dir in [&self.remote_cache_dir, &self.bundled_dir].into_iter().flatten() {
            let candidate = dir.join(&relative);
            if candidate.is_file() {
                return Ok(Box::new(File::open(candidate)?));
            }
        }

        Err(TableError::NotFound(path.to_string()))
    }

    fn metadata(&self, path: &str) -> Option<SourceMetadata> {
        let relative = safe_relative(path).ok()?;
        self.local_candidates(&relative).into_iter().find_map(|candidate| {
            let meta = fs::metadata(&candidate).ok().filter(|m| m.is_file())?;
            Some(SourceMetadata {
                len: meta.len(),
                modified: meta.modified().ok(),
            })
        })
    }
}

/// Accept only plain relative paths that stay inside their base directory
fn safe_relative(path: &str) -> TableResult<PathBuf> {
    let candidate = Path::new(path);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(TableError::InvalidFormat(format!(
                    "path '{}' escapes the content directories",
                    path
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(TableError::InvalidFormat("empty content path".into()));
    }
    Ok(clean)
}

/// Whether `path` already holds exactly `bytes`
fn same_contents(path: &Path, bytes: &[u8]) -> bool {
    let same_len = fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() == bytes.len() as u64);
    same_len && fs::read(path).is_ok_and(|stored| stored == bytes)
}

/// Write through a temporary sibling so readers never see a partial file
fn persist(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = target.with_extension(format!("part-{}", Uuid::new_v4()));
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
