//! Minimal SpreadsheetML (xlsx) reader
//!
//! Only what the paging layer needs is decoded: the sheet directory, shared
//! strings, number formats (so numbers and dates render like a spreadsheet
//! would show them), cell values, merged regions and column widths.

mod cell_ref;
mod format;
mod sheet;
mod strings;

pub use cell_ref::{parse_cell_ref, parse_range_ref};
pub use format::NumberFormats;
pub use sheet::{ColumnSpan, MergedRegion, Sheet};

use std::io::{Read, Seek};

use quick_xml::events::Event;
use quick_xml::Reader;
use tc_core::TableError;
use thiserror::Error;
use zip::ZipArchive;

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";
const STYLES_PART: &str = "xl/styles.xml";

/// Largest decompressed part `Workbook::open` accepts
pub const DEFAULT_PART_LIMIT: u64 = 256 * 1024 * 1024;

/// Upper bound on what a part's declared size may preallocate
const PREALLOC_CAP: u64 = 8 * 1024 * 1024;

/// Errors raised while decoding a workbook container
#[derive(Debug, Error)]
pub enum XlsxError {
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("xml parse error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("xml attribute error: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("workbook part missing: {0}")]
    MissingPart(String),
    #[error("workbook part {part} is over {limit} bytes (declares {declared})")]
    PartTooLarge { part: String, declared: u64, limit: u64 },
}

impl From<XlsxError> for TableError {
    fn from(err: XlsxError) -> Self {
        match err {
            XlsxError::Io(io) => TableError::Io(io),
            XlsxError::PartTooLarge { part, declared, limit } => TableError::SizeExceeded {
                what: part,
                size: declared,
                limit,
            },
            other => TableError::InvalidFormat(other.to_string()),
        }
    }
}

/// One entry of the workbook's sheet directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetEntry {
    pub name: String,
    /// Zip part holding the worksheet XML
    pub part: String,
}

/// An opened workbook container
pub struct Workbook<R: Read + Seek> {
    archive: ZipArchive<R>,
    sheets: Vec<SheetEntry>,
    shared_strings: Vec<String>,
    formats: NumberFormats,
    date1904: bool,
    part_limit: u64,
}

impl<R: Read + Seek> Workbook<R> {
    /// Open a workbook and load its directory, shared strings and styles
    pub fn open(reader: R) -> Result<Self, XlsxError> {
        Self::open_with_part_limit(reader, DEFAULT_PART_LIMIT)
    }

    /// Like `open`, rejecting any part that decompresses past `part_limit` bytes
    pub fn open_with_part_limit(reader: R, part_limit: u64) -> Result<Self, XlsxError> {
        let mut archive = ZipArchive::new(reader)?;

        let workbook_xml = read_part(&mut archive, WORKBOOK_PART, part_limit)?
            .ok_or_else(|| XlsxError::MissingPart(WORKBOOK_PART.to_string()))?;
        let (declared, date1904) = parse_workbook(&workbook_xml)?;

        let rels = match read_part(&mut archive, WORKBOOK_RELS_PART, part_limit)? {
            Some(xml) => parse_relationships(&xml)?,
            None => Vec::new(),
        };

        let sheets = declared
            .into_iter()
            .filter_map(|(name, rel_id)| {
                rels.iter()
                    .find(|(id, _)| *id == rel_id)
                    .map(|(_, target)| SheetEntry {
                        name,
                        part: resolve_target(target),
                    })
            })
            .collect();

        let shared_strings = match read_part(&mut archive, SHARED_STRINGS_PART, part_limit)? {
            Some(xml) => strings::parse_shared_strings(&xml)?,
            None => Vec::new(),
        };

        let formats = match read_part(&mut archive, STYLES_PART, part_limit)? {
            Some(xml) => NumberFormats::parse(&xml)?,
            None => NumberFormats::default(),
        };

        Ok(Self {
            archive,
            sheets,
            shared_strings,
            formats,
            date1904,
            part_limit,
        })
    }

    /// Sheets in workbook order
    pub fn sheets(&self) -> &[SheetEntry] {
        &self.sheets
    }

    /// Whether the workbook uses the 1904 date system
    pub fn is_date1904(&self) -> bool {
        self.date1904
    }

    /// Parse the named sheet; `Ok(None)` when the workbook has no such sheet
    pub fn read_sheet(&mut self, name: &str) -> Result<Option<Sheet>, XlsxError> {
        let Some(entry) = self.sheets.iter().find(|s| s.name == name) else {
            return Ok(None);
        };
        let part = entry.part.clone();

        let xml = read_part(&mut self.archive, &part, self.part_limit)?
            .ok_or(XlsxError::MissingPart(part))?;
        let sheet = Sheet::parse(xml.as_slice(), &self.shared_strings, &self.formats, self.date1904)?;
        Ok(Some(sheet))
    }
}

/// Read a whole part, refusing to decompress more than `limit` bytes
fn read_part<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
    limit: u64,
) -> Result<Option<Vec<u8>>, XlsxError> {
    let file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let declared = file.size();
    let too_large = |declared| XlsxError::PartTooLarge {
        part: name.to_string(),
        declared,
        limit,
    };
    if declared > limit {
        return Err(too_large(declared));
    }

    // The declared size is only a hint; the cap holds even when it lies
    let mut buf = Vec::with_capacity(declared.min(PREALLOC_CAP) as usize);
    file.take(limit.saturating_add(1)).read_to_end(&mut buf)?;
    if buf.len() as u64 > limit {
        return Err(too_large(declared.max(buf.len() as u64)));
    }
    Ok(Some(buf))
}

/// Sheet `(name, relationship id)` pairs plus the date1904 flag
fn parse_workbook(xml: &[u8]) -> Result<(Vec<(String, String)>, bool), XlsxError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut sheets = Vec::new();
    let mut date1904 = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"sheet" => {
                    let mut name = None;
                    let mut rel_id = None;
                    for attr in e.attributes() {
                        let attr = attr?;
                        match attr.key.local_name().as_ref() {
                            b"name" => name = Some(attr.unescape_value()?.into_owned()),
                            b"id" => rel_id = Some(attr.unescape_value()?.into_owned()),
                            _ => {}
                        }
                    }
                    if let (Some(name), Some(rel_id)) = (name, rel_id) {
                        sheets.push((name, rel_id));
                    }
                }
                b"workbookPr" => {
                    for attr in e.attributes() {
                        let attr = attr?;
                        if attr.key.local_name().as_ref() == b"date1904" {
                            let value = attr.unescape_value()?;
                            date1904 = value == "1" || value.eq_ignore_ascii_case("true");
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok((sheets, date1904))
}

/// Relationship `(Id, Target)` pairs
fn parse_relationships(xml: &[u8]) -> Result<Vec<(String, String)>, XlsxError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut rels = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                let mut id = None;
                let mut target = None;
                for attr in e.attributes() {
                    let attr = attr?;
                    match attr.key.as_ref() {
                        b"Id" => id = Some(attr.unescape_value()?.into_owned()),
                        b"Target" => target = Some(attr.unescape_value()?.into_owned()),
                        _ => {}
                    }
                }
                if let (Some(id), Some(target)) = (id, target) {
                    rels.push((id, target));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(rels)
}

/// Turn a relationship target into a zip part name.
///
/// Targets are relative to `xl/` unless they start with `/`.
fn resolve_target(target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }

    let mut parts: Vec<&str> = vec!["xl"];
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}
