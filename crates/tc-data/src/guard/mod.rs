//! Size budgets for origin files and cache directories

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tc_core::{TableError, TableResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SizeLimits;

/// Broad file kinds that share a size ceiling and a magic signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    /// Zip-based spreadsheet (xlsx, xlsm)
    Spreadsheet,
    /// Compound-document spreadsheet (xls)
    LegacySpreadsheet,
    /// pdf
    Document,
    /// json
    Metadata,
    Other,
}

impl FileCategory {
    /// Classify by file extension, case-insensitively
    pub fn from_name(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("xlsx") | Some("xlsm") => FileCategory::Spreadsheet,
            Some("xls") => FileCategory::LegacySpreadsheet,
            Some("pdf") => FileCategory::Document,
            Some("json") => FileCategory::Metadata,
            _ => FileCategory::Other,
        }
    }
}

/// Outcome of an eviction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub total_before: u64,
    pub total_after: u64,
}

/// Enforces per-file and total-cache size budgets
#[derive(Debug, Clone, Default)]
pub struct SizeGuard {
    limits: SizeLimits,
}

impl SizeGuard {
    pub fn new(limits: SizeLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SizeLimits {
        &self.limits
    }

    /// Ceiling for a file of this name; unknown types get the smallest one
    pub fn limit_for(&self, name: &str) -> u64 {
        match FileCategory::from_name(name) {
            FileCategory::Spreadsheet | FileCategory::LegacySpreadsheet => self.limits.spreadsheet_bytes,
            FileCategory::Document => self.limits.document_bytes,
            FileCategory::Metadata => self.limits.metadata_bytes,
            FileCategory::Other => self.limits.most_conservative(),
        }
    }

    pub fn check_file_size(&self, name: &str, size: u64) -> TableResult<()> {
        let limit = self.limit_for(name);
        if size > limit {
            warn!("{} is {} bytes, over the {} byte limit", name, size, limit);
            return Err(TableError::SizeExceeded {
                what: name.to_string(),
                size,
                limit,
            });
        }
        Ok(())
    }

    /// Check the leading bytes against the signature expected for `name`.
    ///
    /// Reads up to `HEADER_PEEK_BYTES`, retrying short reads until that many
    /// bytes arrived or the stream ended, and returns what it consumed so the
    /// caller can chain it back in front of the rest of the stream.
    pub fn check_stream_header<R: Read + ?Sized>(&self, reader: &mut R, name: &str) -> TableResult<Vec<u8>> {
        let mut head = Vec::with_capacity(HEADER_PEEK_BYTES);
        if FileCategory::from_name(name) != FileCategory::Other {
            (&mut *reader).take(HEADER_PEEK_BYTES as u64).read_to_end(&mut head)?;
        }
        self.check_header_bytes(&head, name)?;
        Ok(head)
    }

    /// Signature check over bytes already in memory
    pub fn check_header_bytes(&self, head: &[u8], name: &str) -> TableResult<()> {
        let category = FileCategory::from_name(name);
        let ok = match category {
            FileCategory::Spreadsheet => head.starts_with(b"PK"),
            FileCategory::LegacySpreadsheet => head.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]),
            FileCategory::Document => head.starts_with(b"%PDF"),
            FileCategory::Metadata => matches!(
                head.iter().take(HEADER_PEEK_BYTES).find(|b| !b.is_ascii_whitespace()),
                Some(b'{') | Some(b'[')
            ),
            FileCategory::Other => true,
        };

        if ok {
            Ok(())
        } else {
            Err(TableError::InvalidFormat(format!(
                "{} does not start with a {:?} signature",
                name, category
            )))
        }
    }

    /// Bytes used by all files under `dir`, recursively; 0 when absent
    pub fn total_cache_size(&self, dir: &Path) -> u64 {
        collect_files(dir).iter().map(|f| f.len).sum()
    }

    /// Evict the oldest entries of `dir` when it is over the total budget
    pub fn enforce_limit(&self, dir: &Path) -> TableResult<EvictionReport> {
        self.enforce_limit_protecting(dir, &[])
    }

    /// Like `enforce_limit`, never deleting anything under `protected`.
    ///
    /// Each top-level entry of `dir` is evicted as a whole: a dataset directory
    /// goes together with its manifest, so no cache is left with missing pages.
    /// Entries still being built or retired (`*.staging-*`, `*.retired-*`) are
    /// never touched. Once over budget, entries go in order of their newest
    /// file's modification time until the total is at or below half the budget
    /// (or nothing deletable is left).
    pub fn enforce_limit_protecting(&self, dir: &Path, protected: &[&Path]) -> TableResult<EvictionReport> {
        let budget = self.limits.total_cache_bytes;
        let total_before = self.total_cache_size(dir);

        let mut report = EvictionReport {
            total_before,
            total_after: total_before,
            ..EvictionReport::default()
        };
        if total_before <= budget {
            return Ok(report);
        }

        let target = budget / 2;
        let mut entries = collect_entries(dir);
        entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

        for entry in entries {
            if report.total_after <= target {
                break;
            }
            if in_progress(&entry.path)
                || protected
                    .iter()
                    .any(|p| entry.path.starts_with(p) || p.starts_with(&entry.path))
            {
                continue;
            }

            let removed = if entry.is_dir {
                fs::remove_dir_all(&entry.path)
            } else {
                fs::remove_file(&entry.path)
            };
            match removed {
                Ok(()) => {
                    debug!("Evicted {} ({} bytes)", entry.path.display(), entry.len);
                    report.files_deleted += entry.files;
                    report.bytes_freed += entry.len;
                    report.total_after = report.total_after.saturating_sub(entry.len);
                }
                Err(e) => warn!("Failed to evict {}: {}", entry.path.display(), e),
            }
        }

        info!(
            "Cache eviction in {}: {} files, {} bytes freed, {} -> {} bytes",
            dir.display(),
            report.files_deleted,
            report.bytes_freed,
            report.total_before,
            report.total_after
        );
        Ok(report)
    }
}

/// How many leading bytes a signature check reads
pub const HEADER_PEEK_BYTES: usize = 512;

struct FileEntry {
    path: PathBuf,
    len: u64,
    modified: SystemTime,
}

/// One evictable top-level entry of a cache root
struct EvictionEntry {
    path: PathBuf,
    is_dir: bool,
    files: usize,
    len: u64,
    /// Newest modification time of anything inside
    modified: SystemTime,
}

/// Rebuild scratch directories, named `<key>.staging-<uuid>` / `<key>.retired-<uuid>`
fn in_progress(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    [".staging-", ".retired-"].iter().any(|marker| {
        name.rsplit_once(marker)
            .is_some_and(|(_, id)| Uuid::parse_str(id).is_ok())
    })
}

fn collect_entries(dir: &Path) -> Vec<EvictionEntry> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            let path = entry.path();
            let own_modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if meta.is_dir() {
                let files = collect_files(&path);
                Some(EvictionEntry {
                    is_dir: true,
                    files: files.len(),
                    len: files.iter().map(|f| f.len).sum(),
                    modified: files.iter().map(|f| f.modified).max().unwrap_or(own_modified),
                    path,
                })
            } else if meta.is_file() {
                Some(EvictionEntry {
                    path,
                    is_dir: false,
                    files: 1,
                    len: meta.len(),
                    modified: own_modified,
                })
            } else {
                None
            }
        })
        .collect()
}

fn collect_files(dir: &Path) -> Vec<FileEntry> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                files.push(FileEntry {
                    path: entry.path(),
                    len: meta.len(),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
    }
    files
}
