//! Cache lifecycle: status, open, staleness and rebuild

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tc_core::{ContentSource, Dataset, TableError, TableReader, TableResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::codec::{page_file_name, write_json, write_page};
use super::integrity::IntegrityChecker;
use super::manifest::{to_millis, CacheManifest, OriginFingerprint, StaleReason, SCHEMA_VERSION};
use super::{CacheStatus, HEADERS_FILE, PAGES_DIR, WIDTHS_FILE};
use crate::config::CacheConfig;
use crate::guard::SizeGuard;
use crate::sources::{CachedTableReader, LiveTableReader};

/// What a successful build produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub rows: usize,
    pub pages: usize,
    pub bytes: u64,
    pub build_id: Uuid,
}

/// Result of a rebuild request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// This call built and committed a new cache
    Rebuilt(RebuildReport),
    /// The cache already matched its origin
    UpToDate,
    /// Another rebuild of the same dataset was running; this call waited for it
    Joined,
}

/// Owns every dataset directory under one cache root
pub struct CacheManager {
    config: CacheConfig,
    guard: SizeGuard,
    checker: IntegrityChecker,
    /// One lock per dataset key with a rebuild in flight
    inflight: Mutex<AHashMap<String, Arc<Mutex<()>>>>,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        let guard = SizeGuard::new(config.size_limits.clone());
        let checker = IntegrityChecker::from_config(&config);
        Self {
            config,
            guard,
            checker,
            inflight: Mutex::new(AHashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn size_guard(&self) -> &SizeGuard {
        &self.guard
    }

    /// Directory holding `dataset`'s cache (may not exist yet)
    pub fn dataset_dir(&self, dataset: &Dataset) -> PathBuf {
        self.config.cache_root.join(dataset.cache_key())
    }

    pub fn status(&self, dataset: &Dataset) -> CacheStatus {
        self.checker.validate(&self.dataset_dir(dataset))
    }

    /// A cached reader, only when the cache validates
    pub fn open_if_valid(&self, dataset: &Dataset) -> Option<CachedTableReader> {
        match self.status(dataset) {
            CacheStatus::Valid(_) => Some(CachedTableReader::new(self.dataset_dir(dataset))),
            status => {
                debug!("No usable cache for {}: {}", dataset, status);
                None
            }
        }
    }

    /// Page size the dataset's cache was built with, else the configured one.
    ///
    /// Callers that only want a current cache use this so that a cache built
    /// with an explicit page size is not rebuilt merely to change its layout.
    pub fn effective_page_size(&self, dataset: &Dataset) -> usize {
        CacheManifest::load(&self.dataset_dir(dataset))
            .map(|m| m.page_size)
            .filter(|&size| size > 0)
            .unwrap_or(self.config.page_size)
    }

    /// A cached reader, building the cache first when it is unusable or stale
    pub fn open_or_build(&self, dataset: &Dataset, source: &dyn ContentSource) -> TableResult<CachedTableReader> {
        let page_size = self.effective_page_size(dataset);
        self.rebuild_if_stale(dataset, page_size, source, |_| {})?;
        self.open_if_valid(dataset).ok_or_else(|| {
            TableError::Corrupted(format!("cache for {} did not validate after rebuild", dataset))
        })
    }

    /// Why the cache for `dataset` must be rebuilt, or `None` when it is current
    pub fn stale_reason(
        &self,
        dataset: &Dataset,
        page_size: usize,
        source: &dyn ContentSource,
    ) -> TableResult<Option<StaleReason>> {
        let dir = self.dataset_dir(dataset);
        if !self.checker.validate(&dir).is_valid() {
            return Ok(Some(StaleReason::NoValidCache));
        }
        let Some(manifest) = CacheManifest::load(&dir) else {
            return Ok(Some(StaleReason::NoManifest));
        };

        let metadata = source.metadata(&dataset.origin_path);
        let (len, modified) = match &metadata {
            Some(m) => (Some(m.len), m.modified),
            None => (None, None),
        };
        if let Some(reason) = manifest.check(page_size, len, modified) {
            return Ok(Some(reason));
        }
        if metadata.is_some() {
            return Ok(None);
        }

        // Nothing cheap to compare against: hash the origin
        let bytes = self.read_origin(dataset, source)?;
        if sha256_hex(&bytes) != manifest.origin.sha256 {
            return Ok(Some(StaleReason::ContentChanged));
        }
        Ok(None)
    }

    pub fn is_stale(&self, dataset: &Dataset, page_size: usize, source: &dyn ContentSource) -> TableResult<bool> {
        Ok(self.stale_reason(dataset, page_size, source)?.is_some())
    }

    /// Rebuild only when the cache is unusable or older than its origin
    pub fn rebuild_if_stale<F>(
        &self,
        dataset: &Dataset,
        page_size: usize,
        source: &dyn ContentSource,
        on_updated: F,
    ) -> TableResult<RebuildOutcome>
    where
        F: FnOnce(&RebuildReport),
    {
        match self.stale_reason(dataset, page_size, source)? {
            None => {
                debug!("Cache for {} is up to date", dataset);
                Ok(RebuildOutcome::UpToDate)
            }
            Some(reason) => {
                info!("Cache for {} is stale ({:?}), rebuilding", dataset, reason);
                self.force_rebuild(dataset, page_size, source, on_updated)
            }
        }
    }

    /// Build the cache from the origin and atomically replace the live one.
    ///
    /// At most one rebuild per dataset runs at a time; a concurrent call waits
    /// for it and returns `Joined`. `on_updated` runs only after this call commits.
    pub fn force_rebuild<F>(
        &self,
        dataset: &Dataset,
        page_size: usize,
        source: &dyn ContentSource,
        on_updated: F,
    ) -> TableResult<RebuildOutcome>
    where
        F: FnOnce(&RebuildReport),
    {
        if page_size == 0 {
            return Err(TableError::InvalidState("page size must be at least 1".into()));
        }

        let key = dataset.cache_key();
        let slot = self
            .inflight
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = match slot.try_lock() {
            Some(_running) => Some(self.rebuild_locked(dataset, page_size, source)),
            None => {
                debug!("Rebuild of {} already running, waiting for it", dataset);
                drop(slot.lock());
                None
            }
        };
        self.release_slot(&key, slot);

        let Some(result) = result else {
            return Ok(RebuildOutcome::Joined);
        };
        let report = result?;
        on_updated(&report);
        Ok(RebuildOutcome::Rebuilt(report))
    }

    /// Run a rebuild on the blocking pool
    pub async fn spawn_rebuild(
        self: Arc<Self>,
        dataset: Dataset,
        source: Arc<dyn ContentSource>,
        force: bool,
    ) -> TableResult<RebuildOutcome> {
        tokio::task::spawn_blocking(move || {
            let page_size = self.effective_page_size(&dataset);
            if force {
                self.force_rebuild(&dataset, page_size, source.as_ref(), |_| {})
            } else {
                self.rebuild_if_stale(&dataset, page_size, source.as_ref(), |_| {})
            }
        })
        .await
        .map_err(|e| TableError::Join(e.to_string()))?
    }

    /// Drop our handle on a dataset's rebuild lock; the last holder removes it
    fn release_slot(&self, key: &str, slot: Arc<Mutex<()>>) {
        let mut inflight = self.inflight.lock();
        drop(slot);
        if inflight.get(key).is_some_and(|s| Arc::strong_count(s) == 1) {
            inflight.remove(key);
        }
    }

    fn read_origin(&self, dataset: &Dataset, source: &dyn ContentSource) -> TableResult<Vec<u8>> {
        let name = dataset.origin_file_name();
        if let Some(meta) = source.metadata(&dataset.origin_path) {
            self.guard.check_file_size(name, meta.len)?;
        }

        let limit = self.guard.limit_for(name);
        let mut bytes = Vec::new();
        source
            .open(&dataset.origin_path)?
            .take(limit.saturating_add(1))
            .read_to_end(&mut bytes)?;
        self.guard.check_file_size(name, bytes.len() as u64)?;
        Ok(bytes)
    }

    fn rebuild_locked(
        &self,
        dataset: &Dataset,
        page_size: usize,
        source: &dyn ContentSource,
    ) -> TableResult<RebuildReport> {
        let root = &self.config.cache_root;
        let key = dataset.cache_key();
        fs::create_dir_all(root)?;
        sweep_leftovers(root, &key);

        info!("Rebuilding cache for {} (page size {})", dataset, page_size);

        let bytes = self.read_origin(dataset, source)?;
        self.guard.check_header_bytes(&bytes, dataset.origin_file_name())?;

        // Describe the copy just read: opening may have refreshed it (a remote
        // download lands with a new mtime). A size mismatch means it changed
        // again meanwhile, so no mtime is recorded and the next check rebuilds.
        let modified = source
            .metadata(&dataset.origin_path)
            .filter(|meta| meta.len == bytes.len() as u64)
            .and_then(|meta| meta.modified);
        let origin = OriginFingerprint {
            len: bytes.len() as u64,
            modified_ms: modified.and_then(to_millis),
            sha256: sha256_hex(&bytes),
        };

        let mut live = LiveTableReader::open_with_config(Cursor::new(bytes), &dataset.table_name, &self.config)?;

        let staging = StagingDir::create(root.join(format!("{}.staging-{}", key, Uuid::new_v4())))?;
        let pages_dir = staging.path().join(PAGES_DIR);
        fs::create_dir_all(&pages_dir)?;

        write_json(&staging.path().join(HEADERS_FILE), &live.headers()?)?;
        write_json(&staging.path().join(WIDTHS_FILE), &live.column_widths())?;

        let mut page_rows = Vec::new();
        let mut rows = 0;
        loop {
            let chunk = live.read_range(rows, page_size)?;
            // An empty table still gets one (empty) page
            if chunk.is_empty() && !page_rows.is_empty() {
                break;
            }
            write_page(&pages_dir.join(page_file_name(page_rows.len())), &chunk)?;
            rows += chunk.len();
            page_rows.push(chunk.len());
            if chunk.len() < page_size {
                break;
            }
        }
        live.close();

        let build_id = Uuid::new_v4();
        let manifest = CacheManifest {
            schema_version: SCHEMA_VERSION,
            page_size,
            origin_path: dataset.origin_path.clone(),
            table_name: dataset.table_name.clone(),
            origin,
            build_id,
            built_at: Utc::now(),
            page_rows,
        };
        manifest.save(staging.path())?;

        let bytes = self.guard.total_cache_size(staging.path());
        let budget = self.guard.limits().total_cache_bytes;
        if bytes > budget {
            return Err(TableError::SizeExceeded {
                what: format!("cache for {}", dataset),
                size: bytes,
                limit: budget,
            });
        }

        let live_dir = root.join(&key);
        self.guard
            .enforce_limit_protecting(root, &[staging.path(), live_dir.as_path()])?;

        staging.commit(&live_dir)?;

        let report = RebuildReport {
            rows,
            pages: manifest.page_rows.len(),
            bytes,
            build_id,
        };
        info!(
            "Committed cache for {}: {} rows in {} pages ({} bytes)",
            dataset, report.rows, report.pages, report.bytes
        );
        Ok(report)
    }
}

/// Staging directory removed on drop unless committed
struct StagingDir {
    path: PathBuf,
    committed: bool,
}

impl StagingDir {
    fn create(path: PathBuf) -> TableResult<Self> {
        fs::create_dir_all(&path)?;
        Ok(Self { path, committed: false })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Swap this directory in as `live`, keeping the old one until the swap succeeds
    fn commit(mut self, live: &Path) -> TableResult<()> {
        let retired = live.with_file_name(format!(
            "{}.retired-{}",
            live.file_name().and_then(|n| n.to_str()).unwrap_or("cache"),
            Uuid::new_v4()
        ));

        let had_live = live.exists();
        if had_live {
            fs::rename(live, &retired)?;
        }
        if let Err(e) = fs::rename(&self.path, live) {
            if had_live {
                if let Err(restore) = fs::rename(&retired, live) {
                    warn!("Failed to restore {} after aborted swap: {}", live.display(), restore);
                }
            }
            return Err(e.into());
        }
        self.committed = true;

        if had_live {
            if let Err(e) = fs::remove_dir_all(&retired) {
                warn!("Failed to remove retired cache {}: {}", retired.display(), e);
            }
        }
        Ok(())
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                warn!("Failed to discard staging {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Remove staging/retired directories left behind by an interrupted rebuild
fn sweep_leftovers(root: &Path, key: &str) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    let staging = format!("{key}.staging-");
    let retired = format!("{key}.retired-");
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(&staging) || name.starts_with(&retired) {
            debug!("Removing leftover {}", name);
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!("Failed to remove leftover {}: {}", name, e);
            }
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
