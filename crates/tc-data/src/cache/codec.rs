//! On-disk encoding of pages and side files

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tc_core::{RowRecord, TableError, TableResult};

const PAGE_PREFIX: &str = "page_";
const COMPRESSED_SUFFIX: &str = ".json.gz";
const LEGACY_SUFFIX: &str = ".json";

/// A page file found in a `pages/` directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFile {
    /// Sequence number parsed from the file name
    pub index: usize,
    pub path: PathBuf,
    /// `false` for legacy uncompressed pages
    pub compressed: bool,
}

/// File name of page `index`; zero-padding keeps lexical order equal to row order
pub fn page_file_name(index: usize) -> String {
    format!("{PAGE_PREFIX}{index:05}{COMPRESSED_SUFFIX}")
}

fn parse_page_name(name: &str) -> Option<(usize, bool)> {
    let rest = name.strip_prefix(PAGE_PREFIX)?;
    let (digits, compressed) = match rest.strip_suffix(COMPRESSED_SUFFIX) {
        Some(digits) => (digits, true),
        None => (rest.strip_suffix(LEGACY_SUFFIX)?, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((digits.parse().ok()?, compressed))
}

/// List page files in sequence order.
///
/// When both a compressed and a legacy file exist for one index, the
/// compressed one wins. A missing directory lists as empty.
pub fn list_pages(pages_dir: &Path) -> TableResult<Vec<PageFile>> {
    let entries = match fs::read_dir(pages_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut pages: Vec<PageFile> = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some((index, compressed)) = name.to_str().and_then(parse_page_name) else {
            continue;
        };
        pages.push(PageFile {
            index,
            path: entry.path(),
            compressed,
        });
    }

    // Compressed first within an index, then keep the first of each index
    pages.sort_by(|a, b| a.index.cmp(&b.index).then(b.compressed.cmp(&a.compressed)));
    pages.dedup_by_key(|p| p.index);
    Ok(pages)
}

/// Serialize and gzip one page of rows
pub fn encode_page(rows: &[RowRecord]) -> TableResult<Vec<u8>> {
    let json = serde_json::to_vec(rows).map_err(|e| TableError::InvalidFormat(e.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decode page bytes: gzip first, then the same bytes as plain JSON
pub fn decode_page(bytes: &[u8]) -> TableResult<Vec<RowRecord>> {
    let mut json = Vec::new();
    let gzip_err = match GzDecoder::new(bytes).read_to_end(&mut json) {
        Ok(_) => match serde_json::from_slice(&json) {
            Ok(rows) => return Ok(rows),
            Err(e) => e.to_string(),
        },
        Err(e) => e.to_string(),
    };

    serde_json::from_slice(bytes).map_err(|plain_err| {
        TableError::Corrupted(format!("gzip: {gzip_err}; plain: {plain_err}"))
    })
}

/// Read and decode a page file
pub fn read_page(path: &Path) -> TableResult<Vec<RowRecord>> {
    let bytes = fs::read(path)?;
    decode_page(&bytes).map_err(|e| match e {
        TableError::Corrupted(msg) => TableError::Corrupted(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

/// Write a page file and return its size in bytes
pub fn write_page(path: &Path, rows: &[RowRecord]) -> TableResult<u64> {
    let bytes = encode_page(rows)?;
    fs::write(path, &bytes)?;
    Ok(bytes.len() as u64)
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> TableResult<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| TableError::InvalidFormat(e.to_string()))?;
    fs::write(path, json)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> TableResult<T> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| TableError::Corrupted(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize) -> Vec<RowRecord> {
        (0..n)
            .map(|i| {
                let mut row = RowRecord::new();
                row.insert("Zeta".into(), format!("z{i}"));
                row.insert("Alpha".into(), format!("a{i}"));
                row
            })
            .collect()
    }

    #[test]
    fn compressed_page_keeps_column_order() {
        let bytes = encode_page(&rows(3)).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        let decoded = decode_page(&bytes).unwrap();
        assert_eq!(decoded, rows(3));
        assert_eq!(decoded[0].keys().collect::<Vec<_>>(), vec!["Zeta", "Alpha"]);
    }

    #[test]
    fn legacy_plain_json_still_decodes() {
        let plain = serde_json::to_vec(&rows(2)).unwrap();
        assert_eq!(decode_page(&plain).unwrap(), rows(2));
    }

    #[test]
    fn garbage_is_corrupted() {
        assert!(matches!(decode_page(b"\x1f\x8b garbage"), Err(TableError::Corrupted(_))));
        assert!(matches!(decode_page(b""), Err(TableError::Corrupted(_))));
    }

    #[test]
    fn pages_list_in_sequence_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "page_00002.json.gz",
            "page_00000.json",
            "page_00000.json.gz",
            "page_00001.json",
            "page_100000.json.gz",
            "notes.txt",
            "page_x.json.gz",
        ] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let pages = list_pages(dir.path()).unwrap();
        let listed: Vec<_> = pages.iter().map(|p| (p.index, p.compressed)).collect();
        assert_eq!(listed, vec![(0, true), (1, false), (2, true), (100_000, true)]);
    }

    #[test]
    fn missing_pages_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_pages(&dir.path().join("pages")).unwrap().is_empty());
    }

    #[test]
    fn page_names_are_zero_padded() {
        assert_eq!(page_file_name(7), "page_00007.json.gz");
        assert_eq!(parse_page_name("page_00007.json.gz"), Some((7, true)));
        assert_eq!(parse_page_name("page_00007.json"), Some((7, false)));
    }
}
