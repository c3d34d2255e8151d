//! Table reader over a pre-built page cache

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tc_core::{ColumnWidths, Headers, RowRecord, TableError, TableReader, TableResult};
use tracing::warn;
use uuid::Uuid;

use crate::cache::codec::{list_pages, read_json, read_page, PageFile};
use crate::cache::{CacheManifest, HEADERS_FILE, PAGES_DIR, WIDTHS_FILE};

/// A page that could not be decoded during a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDiagnostic {
    pub page: PathBuf,
    pub error: String,
}

/// Reads rows by scanning a dataset directory's page files in order
pub struct CachedTableReader {
    dir: PathBuf,
    headers: OnceCell<Headers>,
    /// Manifest seen at open; `None` for caches written without one
    manifest: Option<CacheManifest>,
    diagnostics: Mutex<Vec<PageDiagnostic>>,
}

impl CachedTableReader {
    /// Create a reader over `dir`. Nothing is read until first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let manifest = CacheManifest::load(&dir);
        Self {
            dir,
            headers: OnceCell::new(),
            manifest,
            diagnostics: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Build this reader is pinned to, if the cache has a manifest
    pub fn build_id(&self) -> Option<Uuid> {
        self.manifest.as_ref().map(|m| m.build_id)
    }

    /// Pages that failed to decode so far
    pub fn diagnostics(&self) -> Vec<PageDiagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Fail if the directory now holds a different build than the one opened
    fn ensure_current(&self) -> TableResult<()> {
        let Some(opened) = &self.manifest else {
            return Ok(());
        };
        match CacheManifest::load(&self.dir) {
            Some(current) if current.build_id == opened.build_id => Ok(()),
            _ => Err(TableError::Stale(self.dir.display().to_string())),
        }
    }

    /// Recorded row count of each page; `None` for caches written without a manifest.
    ///
    /// With a manifest the pages on disk must be exactly the listed ones.
    /// Offsets are never re-derived from whatever pages happen to remain.
    fn page_lengths(&self, pages: &[PageFile]) -> TableResult<Option<&[usize]>> {
        let Some(manifest) = self.manifest.as_ref() else {
            return Ok(None);
        };
        let contiguous = pages.iter().enumerate().all(|(i, p)| p.index == i);
        if !contiguous || manifest.page_rows.len() != pages.len() {
            return Err(TableError::Corrupted(format!(
                "{}: {} page files on disk, manifest lists {}",
                self.dir.display(),
                pages.len(),
                manifest.page_rows.len()
            )));
        }
        Ok(Some(manifest.page_rows.as_slice()))
    }

    /// Decode one page; an unreadable page is recorded and yields `None`
    fn decode(&self, page: &PageFile) -> Option<Vec<RowRecord>> {
        match read_page(&page.path) {
            Ok(rows) => Some(rows),
            Err(e) => {
                warn!("Skipping unreadable cache page: {}", e);
                self.diagnostics.lock().push(PageDiagnostic {
                    page: page.path.clone(),
                    error: e.to_string(),
                });
                None
            }
        }
    }

    fn scan(&self, start: usize, count: usize) -> TableResult<Vec<RowRecord>> {
        let pages = list_pages(&self.dir.join(PAGES_DIR))?;
        let lengths = self.page_lengths(&pages)?;

        let mut rows = Vec::with_capacity(count.min(4096));
        // Rows held by the pages before the current one
        let mut skipped = 0usize;

        for (i, page) in pages.iter().enumerate() {
            if rows.len() >= count {
                break;
            }

            let known_len = lengths.map(|l| l[i]);
            if let Some(len) = known_len {
                if start >= skipped + len {
                    skipped += len;
                    continue;
                }
            }

            let page_rows = self.decode(page).unwrap_or_default();
            let len = match known_len {
                // Unreadable pages keep their recorded extent so later rows stay in place
                Some(len) if page_rows.is_empty() || page_rows.len() == len => len,
                Some(len) => {
                    return Err(TableError::Corrupted(format!(
                        "{} holds {} rows, manifest records {}",
                        page.path.display(),
                        page_rows.len(),
                        len
                    )))
                }
                None => page_rows.len(),
            };
            let offset = start.saturating_sub(skipped);
            if offset < page_rows.len() {
                let wanted = count - rows.len();
                rows.extend(page_rows.into_iter().skip(offset).take(wanted));
            }
            skipped += len;
        }

        Ok(rows)
    }
}

impl TableReader for CachedTableReader {
    fn headers(&self) -> TableResult<Headers> {
        self.headers
            .get_or_try_init(|| {
                let path = self.dir.join(HEADERS_FILE);
                if !path.is_file() {
                    return Err(TableError::InvalidState(format!(
                        "no headers in {}",
                        self.dir.display()
                    )));
                }
                read_json(&path)
            })
            .cloned()
    }

    fn column_widths(&self) -> ColumnWidths {
        read_json(&self.dir.join(WIDTHS_FILE)).unwrap_or_default()
    }

    fn read_range(&self, start: usize, count: usize) -> TableResult<Vec<RowRecord>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.ensure_current()?;
        let rows = self.scan(start, count)?;
        self.ensure_current()?;
        Ok(rows)
    }

    fn row_count(&self) -> TableResult<usize> {
        self.ensure_current()?;
        let pages = list_pages(&self.dir.join(PAGES_DIR))?;
        if let Some(lengths) = self.page_lengths(&pages)? {
            return Ok(lengths.iter().sum());
        }
        Ok(pages.iter().filter_map(|p| self.decode(p)).map(|rows| rows.len()).sum())
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::{page_file_name, write_json, write_page};
    use crate::cache::{OriginFingerprint, SCHEMA_VERSION};
    use chrono::Utc;
    use std::fs;

    fn row(i: usize) -> RowRecord {
        let mut row = RowRecord::new();
        row.insert("Id".into(), i.to_string());
        row.insert("Name".into(), format!("Valve {i}"));
        row
    }

    /// Write `total` rows split into pages of `page_size`, optionally with a manifest
    fn write_cache(dir: &Path, total: usize, page_size: usize, with_manifest: bool) -> Vec<usize> {
        write_json(&dir.join(HEADERS_FILE), &vec!["Id", "Name"]).unwrap();
        let pages_dir = dir.join(PAGES_DIR);
        fs::create_dir_all(&pages_dir).unwrap();

        let all: Vec<_> = (0..total).map(row).collect();
        let mut page_rows = Vec::new();
        for (i, chunk) in all.chunks(page_size).enumerate() {
            write_page(&pages_dir.join(page_file_name(i)), chunk).unwrap();
            page_rows.push(chunk.len());
        }

        if with_manifest {
            manifest(page_size, page_rows.clone()).save(dir).unwrap();
        }
        page_rows
    }

    fn manifest(page_size: usize, page_rows: Vec<usize>) -> CacheManifest {
        CacheManifest {
            schema_version: SCHEMA_VERSION,
            page_size,
            origin_path: "book.xlsx".into(),
            table_name: "Data".into(),
            origin: OriginFingerprint {
                len: 1,
                modified_ms: None,
                sha256: String::new(),
            },
            build_id: Uuid::new_v4(),
            built_at: Utc::now(),
            page_rows,
        }
    }

    fn ids(rows: &[RowRecord]) -> Vec<usize> {
        rows.iter().map(|r| r["Id"].parse().unwrap()).collect()
    }

    #[test]
    fn reads_are_independent_of_page_size() {
        for with_manifest in [false, true] {
            let small = tempfile::tempdir().unwrap();
            let large = tempfile::tempdir().unwrap();
            write_cache(small.path(), 95, 10, with_manifest);
            write_cache(large.path(), 95, 1000, with_manifest);
            let a = CachedTableReader::new(small.path());
            let b = CachedTableReader::new(large.path());

            for (start, count) in [(0, 95), (0, 10), (5, 10), (9, 2), (10, 10), (37, 40), (90, 50), (95, 5)] {
                let left = a.read_range(start, count).unwrap();
                assert_eq!(left, b.read_range(start, count).unwrap());
                let expected: Vec<usize> = (start..(start + count).min(95)).collect();
                assert_eq!(ids(&left), expected, "range {start}+{count}");
            }
        }
    }

    #[test]
    fn headers_and_widths() {
        let dir = tempfile::tempdir().unwrap();
        write_cache(dir.path(), 3, 10, true);
        let reader = CachedTableReader::new(dir.path());
        assert_eq!(reader.headers().unwrap(), vec!["Id", "Name"]);
        assert!(reader.column_widths().is_empty());

        fs::write(dir.path().join(WIDTHS_FILE), br#"{"Id": 200, "Name": 480}"#).unwrap();
        assert_eq!(reader.column_widths()["Name"], 480);
    }

    #[test]
    fn missing_headers_is_invalid_state() {
        let dir = tempfile::tempdir().unwrap();
        let reader = CachedTableReader::new(dir.path());
        assert!(matches!(reader.headers(), Err(TableError::InvalidState(_))));
    }

    #[test]
    fn zero_pages_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reader = CachedTableReader::new(dir.path());
        assert!(reader.read_range(0, 50).unwrap().is_empty());
        assert_eq!(reader.row_count().unwrap(), 0);
    }

    #[test]
    fn corrupted_page_contributes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_cache(dir.path(), 30, 10, false);
        fs::write(dir.path().join(PAGES_DIR).join(page_file_name(1)), b"junk").unwrap();

        let reader = CachedTableReader::new(dir.path());
        let rows = reader.read_range(0, 30).unwrap();
        assert_eq!(ids(&rows), (0..10).chain(20..30).collect::<Vec<_>>());
        assert_eq!(reader.diagnostics().len(), 1);
    }

    #[test]
    fn legacy_plain_pages_are_read() {
        let dir = tempfile::tempdir().unwrap();
        write_cache(dir.path(), 5, 5, false);
        let pages_dir = dir.path().join(PAGES_DIR);
        let legacy: Vec<_> = (5..8).map(row).collect();
        fs::write(pages_dir.join("page_00001.json"), serde_json::to_vec(&legacy).unwrap()).unwrap();

        let reader = CachedTableReader::new(dir.path());
        assert_eq!(ids(&reader.read_range(3, 10).unwrap()), vec![3, 4, 5, 6, 7]);
        assert_eq!(reader.row_count().unwrap(), 8);
    }

    #[test]
    fn manifest_counts_skip_decoding() {
        let dir = tempfile::tempdir().unwrap();
        write_cache(dir.path(), 30, 10, true);
        // Page 0 is never decoded when the manifest says it holds 10 rows
        fs::write(dir.path().join(PAGES_DIR).join(page_file_name(0)), b"junk").unwrap();

        let reader = CachedTableReader::new(dir.path());
        assert_eq!(ids(&reader.read_range(12, 3).unwrap()), vec![12, 13, 14]);
        assert!(reader.diagnostics().is_empty());
        assert_eq!(reader.row_count().unwrap(), 30);
    }

    #[test]
    fn rebuilt_cache_makes_reader_stale() {
        let dir = tempfile::tempdir().unwrap();
        let page_rows = write_cache(dir.path(), 20, 10, true);
        let reader = CachedTableReader::new(dir.path());
        assert_eq!(reader.read_range(0, 5).unwrap().len(), 5);

        manifest(10, page_rows).save(dir.path()).unwrap();
        assert!(matches!(reader.read_range(0, 5), Err(TableError::Stale(_))));

        let reopened = CachedTableReader::new(dir.path());
        assert_eq!(reopened.read_range(0, 5).unwrap().len(), 5);
    }

    #[test]
    fn missing_page_is_an_error_not_a_shift() {
        let dir = tempfile::tempdir().unwrap();
        write_cache(dir.path(), 30, 10, true);
        fs::remove_file(dir.path().join(PAGES_DIR).join(page_file_name(0))).unwrap();

        let reader = CachedTableReader::new(dir.path());
        assert!(matches!(reader.read_range(0, 3), Err(TableError::Corrupted(_))));
        assert!(matches!(reader.read_range(15, 3), Err(TableError::Corrupted(_))));
        assert!(matches!(reader.row_count(), Err(TableError::Corrupted(_))));
    }

    #[test]
    fn page_with_wrong_row_count_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_cache(dir.path(), 30, 10, true);
        let short: Vec<_> = (10..15).map(row).collect();
        write_page(&dir.path().join(PAGES_DIR).join(page_file_name(1)), &short).unwrap();

        let reader = CachedTableReader::new(dir.path());
        assert_eq!(ids(&reader.read_range(0, 5).unwrap()), vec![0, 1, 2, 3, 4]);
        assert!(matches!(reader.read_range(8, 5), Err(TableError::Corrupted(_))));
    }

    #[test]
    fn unreadable_page_keeps_later_rows_in_place() {
        let dir = tempfile::tempdir().unwrap();
        write_cache(dir.path(), 30, 10, true);
        fs::write(dir.path().join(PAGES_DIR).join(page_file_name(1)), b"junk").unwrap();

        let reader = CachedTableReader::new(dir.path());
        let rows = reader.read_range(5, 20).unwrap();
        assert_eq!(ids(&rows), (5..10).chain(20..30).collect::<Vec<_>>());
        assert_eq!(reader.diagnostics().len(), 1);
    }
}
