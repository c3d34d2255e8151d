//! Cache health classification

use std::path::Path;

use tracing::{debug, warn};

use super::codec::{list_pages, read_page, PageFile};
use super::manifest::CacheManifest;
use super::{CacheStatus, HEADERS_FILE, PAGES_DIR};
use crate::config::CacheConfig;

/// Samples a cache's leading pages to decide whether it can be served
#[derive(Debug, Clone)]
pub struct IntegrityChecker {
    sample_size: usize,
    tolerance: f64,
}

impl Default for IntegrityChecker {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl IntegrityChecker {
    pub fn new(sample_size: usize, tolerance: f64) -> Self {
        Self {
            sample_size: sample_size.max(1),
            tolerance,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.integrity_sample_size, config.corruption_tolerance)
    }

    /// Classify `dataset_dir`. Never fails; I/O problems read as `Missing`/`Corrupted`.
    ///
    /// When the cache has a manifest, its pages must be exactly the ones the
    /// manifest lists, each holding the recorded number of rows. A page that
    /// vanished or changed length would shift every row after it, so such a
    /// cache is `Corrupted` rather than served.
    pub fn validate(&self, dataset_dir: &Path) -> CacheStatus {
        let pages_dir = dataset_dir.join(PAGES_DIR);
        if !dataset_dir.join(HEADERS_FILE).is_file() || !pages_dir.is_dir() {
            return CacheStatus::Missing;
        }

        let pages = match list_pages(&pages_dir) {
            Ok(pages) => pages,
            Err(e) => {
                warn!("Cannot list pages in {}: {}", pages_dir.display(), e);
                return CacheStatus::Missing;
            }
        };
        if pages.is_empty() {
            return CacheStatus::Empty;
        }

        let manifest = CacheManifest::load(dataset_dir);
        if let Some(manifest) = &manifest {
            let unlisted = layout_mismatches(manifest, &pages);
            if unlisted > 0 {
                warn!(
                    "Cache {} does not match its manifest: {} of {} pages missing or unexpected",
                    dataset_dir.display(),
                    unlisted,
                    manifest.page_rows.len()
                );
                return CacheStatus::Corrupted(unlisted, manifest.page_rows.len());
            }
        }

        let sampled = pages.len().min(self.sample_size);
        let failures = pages[..sampled]
            .iter()
            .filter(|page| read_page(&page.path).is_err())
            .count();
        if failures as f64 > sampled as f64 * self.tolerance {
            warn!(
                "Cache {} is corrupted: {} of {} sampled pages unreadable",
                dataset_dir.display(),
                failures,
                sampled
            );
            return CacheStatus::Corrupted(failures, sampled);
        }

        let mut rows = 0;
        let mut miscounted = 0;
        for (i, page) in pages.iter().enumerate() {
            match read_page(&page.path) {
                Ok(page_rows) => {
                    let expected = manifest.as_ref().and_then(|m| m.page_rows.get(i));
                    if expected.is_some_and(|&n| n != page_rows.len()) {
                        miscounted += 1;
                    }
                    rows += page_rows.len();
                }
                Err(e) => debug!("Skipping unreadable page while counting: {}", e),
            }
        }
        if miscounted > 0 {
            warn!(
                "Cache {} is corrupted: {} pages hold a different row count than recorded",
                dataset_dir.display(),
                miscounted
            );
            return CacheStatus::Corrupted(miscounted, pages.len());
        }
        CacheStatus::Valid(rows)
    }
}

/// Pages missing from, or not listed in, the manifest's `0..n` sequence
fn layout_mismatches(manifest: &CacheManifest, pages: &[PageFile]) -> usize {
    let expected = manifest.page_rows.len();
    let present = pages.iter().filter(|p| p.index < expected).count();
    let unexpected = pages.len() - present;
    (expected - present) + unexpected
}
