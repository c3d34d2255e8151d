//! Table reader abstraction
//!
//! A `TableReader` answers "give me rows `[start, start + count)` of this
//! table". The live implementation parses the origin document, the cached one
//! scans pre-built page files; consumers do not care which one they hold.

use indexmap::IndexMap;

use crate::error::TableResult;

/// Ordered column names taken from the header row
pub type Headers = Vec<String>;

/// Display width in pixels per column name
pub type ColumnWidths = IndexMap<String, u32>;

/// One data row: column name -> formatted cell text, in header order
pub type RowRecord = IndexMap<String, String>;

/// Number of rows fetched per step when a search walks a whole table
pub const SEARCH_CHUNK_ROWS: usize = 1000;

/// Trait for paged table readers
pub trait TableReader: Send + Sync {
    /// Column names, in column order
    fn headers(&self) -> TableResult<Headers>;

    /// Best-effort display widths; empty when unknown
    fn column_widths(&self) -> ColumnWidths;

    /// Read up to `count` rows starting at data row `start`.
    ///
    /// Returns fewer rows (possibly none) when the table ends first; never pads.
    fn read_range(&self, start: usize, count: usize) -> TableResult<Vec<RowRecord>>;

    /// Total number of data rows
    fn row_count(&self) -> TableResult<usize>;

    /// Release held resources. Idempotent and infallible.
    fn close(&mut self);

    /// Upper bound on rows a search may scan, `None` for the whole table
    fn search_limit(&self) -> Option<usize> {
        None
    }

    /// Case-insensitive substring search over every row.
    ///
    /// When `column` is given only that column (matched case-insensitively) is
    /// inspected; an unknown column yields no matches.
    fn search(&self, query: &str, column: Option<&str>) -> TableResult<Vec<RowRecord>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let target = match column {
            Some(name) => {
                let wanted = name.trim().to_lowercase();
                let headers = self.headers()?;
                match headers.iter().find(|h| h.trim().to_lowercase() == wanted) {
                    Some(h) => Some(h.clone()),
                    None => return Ok(Vec::new()),
                }
            }
            None => None,
        };

        let limit = self.search_limit().unwrap_or(usize::MAX);
        let mut results = Vec::new();
        let mut start = 0;
        while start < limit {
            let want = SEARCH_CHUNK_ROWS.min(limit - start);
            let chunk = self.read_range(start, want)?;
            let fetched = chunk.len();
            results.extend(
                chunk
                    .into_iter()
                    .filter(|row| row_matches(row, &needle, target.as_deref())),
            );
            if fetched < want {
                break;
            }
            start += fetched;
        }
        Ok(results)
    }
}

/// Check a row against an already-normalized needle
pub fn row_matches(row: &RowRecord, needle: &str, column: Option<&str>) -> bool {
    match column {
        Some(col) => row
            .get(col)
            .map(|v| v.trim().to_lowercase().contains(needle))
            .unwrap_or(false),
        None => row
            .values()
            .any(|v| !v.is_empty() && v.trim().to_lowercase().contains(needle)),
    }
}
