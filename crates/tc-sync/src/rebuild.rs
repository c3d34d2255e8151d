//! Adapter that turns a cache rebuild into a change callback

use std::sync::Arc;

use anyhow::Context;
use tc_core::{ContentSource, Dataset};
use tc_data::{CacheManager, RebuildOutcome};
use tracing::info;

use crate::subscriber::ChangeCallback;

/// Callback that rebuilds a dataset's cache when its origin changes.
///
/// A cache that still matches its origin is left alone.
pub fn rebuild_on_change(manager: Arc<CacheManager>, source: Arc<dyn ContentSource>) -> ChangeCallback {
    Arc::new(move |dataset: &Dataset| -> anyhow::Result<()> {
        let page_size = manager.effective_page_size(dataset);
        let outcome = manager
            .rebuild_if_stale(dataset, page_size, source.as_ref(), |report| {
                info!(
                    "Cache for {} refreshed: {} rows in {} pages",
                    dataset, report.rows, report.pages
                );
            })
            .with_context(|| format!("rebuilding cache for {}", dataset))?;
        if outcome == RebuildOutcome::Joined {
            info!("Cache for {} was already being rebuilt", dataset);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RefreshCoordinator, WatchConfig};
    use std::time::{Duration, SystemTime};
    use tc_data::{CacheConfig, CacheStatus, LayeredContentSource};
    use tokio::runtime::Handle;

    fn write_book(path: &std::path::Path, rows: usize) {
        let mut book = rust_xlsxwriter::Workbook::new();
        let sheet = book.add_worksheet();
        sheet.set_name("Data").unwrap();
        sheet.write_string(0, 0, "Tag").unwrap();
        for i in 0..rows {
            sheet.write_string(i as u32 + 1, 0, format!("T{i}")).unwrap();
        }
        book.save(path).unwrap();
    }

    #[tokio::test]
    async fn origin_change_rebuilds_cache() {
        let dir = tempfile::tempdir().unwrap();
        let synced = dir.path().join("synced");
        std::fs::create_dir_all(&synced).unwrap();
        let origin = synced.join("book.xlsx");
        write_book(&origin, 3);

        let source: Arc<dyn ContentSource> = Arc::new(LayeredContentSource::new().with_synced_dir(&synced));
        let manager = Arc::new(CacheManager::new(CacheConfig::with_root(dir.path().join("cache"))));
        let dataset = Dataset::new("book.xlsx", "Data");

        let coordinator = RefreshCoordinator::new(
            source.clone(),
            WatchConfig::with_interval(Duration::from_secs(3600)),
            Handle::current(),
        );
        coordinator
            .start_watching(&dataset, rebuild_on_change(manager.clone(), source.clone()))
            .unwrap();

        // First notification builds the missing cache
        assert!(coordinator.force_refresh(&dataset)[0].is_ok());
        assert_eq!(manager.status(&dataset), CacheStatus::Valid(3));

        write_book(&origin, 6);
        let later = SystemTime::now() + Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&origin)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let outcomes = coordinator.poll_once(&dataset);
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_ok());
        assert_eq!(manager.status(&dataset), CacheStatus::Valid(6));
    }

    #[tokio::test]
    async fn failed_rebuild_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let source: Arc<dyn ContentSource> = Arc::new(LayeredContentSource::new().with_synced_dir(dir.path()));
        let manager = Arc::new(CacheManager::new(CacheConfig::with_root(dir.path().join("cache"))));

        let callback = rebuild_on_change(manager, source);
        let err = callback(&Dataset::new("absent.xlsx", "Data")).unwrap_err();
        assert!(format!("{:#}", err).contains("rebuilding cache for absent.xlsx::Data"));
    }
}
