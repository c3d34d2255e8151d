//! Worksheet parsing: sparse cell grid, merged regions, column widths

use std::collections::BTreeMap;
use std::io::BufRead;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::cell_ref::{parse_cell_ref, parse_range_ref};
use super::format::NumberFormats;
use super::XlsxError;

/// Rectangular merged range; every cell inside shows the anchor's value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedRegion {
    pub first_row: u32,
    pub first_col: u32,
    pub last_row: u32,
    pub last_col: u32,
}

impl MergedRegion {
    pub fn contains(&self, row: u32, col: u32) -> bool {
        (self.first_row..=self.last_row).contains(&row)
            && (self.first_col..=self.last_col).contains(&col)
    }
}

/// Width declared for a run of columns (zero-based, inclusive), in character units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnSpan {
    pub first_col: u32,
    pub last_col: u32,
    pub width: f64,
}

/// A parsed worksheet with formatted cell text
#[derive(Debug, Default)]
pub struct Sheet {
    rows: BTreeMap<u32, BTreeMap<u32, String>>,
    merged: Vec<MergedRegion>,
    columns: Vec<ColumnSpan>,
    default_col_width: Option<f64>,
}

/// Value-bearing state of the `<c>` element being read
#[derive(Default)]
struct PendingCell {
    row: u32,
    col: u32,
    kind: Option<String>,
    style: Option<usize>,
    raw: String,
    has_value: bool,
}

impl Sheet {
    pub(crate) fn parse<B: BufRead>(
        input: B,
        shared_strings: &[String],
        formats: &NumberFormats,
        date1904: bool,
    ) -> Result<Self, XlsxError> {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(false);

        let mut sheet = Sheet::default();
        let mut buf = Vec::new();

        let mut next_row: u32 = 0;
        let mut current_row: u32 = 0;
        let mut next_col: u32 = 0;
        let mut cell: Option<PendingCell> = None;
        let mut in_value = false;
        let mut in_inline_text = false;
        let mut phonetic_depth = 0usize;

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"row" => {
                        current_row = row_index(&e)?.unwrap_or(next_row);
                        next_row = current_row + 1;
                        next_col = 0;
                        sheet.rows.entry(current_row).or_default();
                    }
                    b"c" => {
                        let pending = start_cell(&e, current_row, next_col)?;
                        next_col = pending.col + 1;
                        cell = Some(pending);
                    }
                    b"v" if cell.is_some() => in_value = true,
                    b"rPh" => phonetic_depth += 1,
                    b"t" if cell.is_some() && phonetic_depth == 0 => in_inline_text = true,
                    _ => {}
                },
                Event::Empty(e) => match e.local_name().as_ref() {
                    b"row" => {
                        current_row = row_index(&e)?.unwrap_or(next_row);
                        next_row = current_row + 1;
                        next_col = 0;
                        sheet.rows.entry(current_row).or_default();
                    }
                    // Style-only cell, no value
                    b"c" => {
                        let pending = start_cell(&e, current_row, next_col)?;
                        next_col = pending.col + 1;
                    }
                    b"mergeCell" => {
                        if let Some(region) = merge_region(&e)? {
                            sheet.merged.push(region);
                        }
                    }
                    b"col" => {
                        if let Some(span) = column_span(&e)? {
                            sheet.columns.push(span);
                        }
                    }
                    b"sheetFormatPr" => {
                        for attr in e.attributes() {
                            let attr = attr?;
                            if attr.key.as_ref() == b"defaultColWidth" {
                                sheet.default_col_width = attr.unescape_value()?.parse().ok();
                            }
                        }
                    }
                    _ => {}
                },
                Event::Text(e) if in_value || in_inline_text => {
                    if let Some(pending) = cell.as_mut() {
                        pending.raw.push_str(&e.unescape()?);
                        pending.has_value = true;
                    }
                }
                Event::End(e) => match e.local_name().as_ref() {
                    b"v" => in_value = false,
                    b"t" => in_inline_text = false,
                    b"rPh" => phonetic_depth = phonetic_depth.saturating_sub(1),
                    b"c" => {
                        if let Some(pending) = cell.take() {
                            if pending.has_value {
                                let text = render(&pending, shared_strings, formats, date1904);
                                sheet.rows.entry(pending.row).or_default().insert(pending.col, text);
                            }
                        }
                        in_value = false;
                        in_inline_text = false;
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(sheet)
    }

    /// Raw formatted value stored at `(row, col)`, ignoring merges
    pub fn value(&self, row: u32, col: u32) -> Option<&str> {
        self.rows.get(&row)?.get(&col).map(String::as_str)
    }

    /// Cell text with merged regions resolved to their anchor; blank when absent
    pub fn resolved_value(&self, row: u32, col: u32) -> String {
        if let Some(region) = self.merged.iter().find(|r| r.contains(row, col)) {
            return self
                .value(region.first_row, region.first_col)
                .unwrap_or_default()
                .to_string();
        }
        self.value(row, col).unwrap_or_default().to_string()
    }

    /// Indices of rows declared in the sheet (with or without values), ascending
    pub fn row_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.rows.keys().copied()
    }

    /// Highest populated column index of `row`
    pub fn last_col(&self, row: u32) -> Option<u32> {
        self.rows.get(&row)?.keys().next_back().copied()
    }

    pub fn merged(&self) -> &[MergedRegion] {
        &self.merged
    }

    /// Declared width of `col` in character units, if any
    pub fn column_width(&self, col: u32) -> Option<f64> {
        self.columns
            .iter()
            .find(|span| (span.first_col..=span.last_col).contains(&col))
            .map(|span| span.width)
    }

    /// Sheet-wide default column width in character units
    pub fn default_col_width(&self) -> Option<f64> {
        self.default_col_width
    }
}

fn row_index(e: &BytesStart<'_>) -> Result<Option<u32>, XlsxError> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == b"r" {
            let index = attr.unescape_value()?.trim().parse::<u32>().ok();
            return Ok(index.and_then(|r| r.checked_sub(1)));
        }
    }
    Ok(None)
}

fn start_cell(e: &BytesStart<'_>, row: u32, next_col: u32) -> Result<PendingCell, XlsxError> {
    let mut pending = PendingCell {
        row,
        col: next_col,
        ..PendingCell::default()
    };
    for attr in e.attributes() {
        let attr = attr?;
        match attr.key.as_ref() {
            b"r" => {
                if let Some((r, c)) = parse_cell_ref(&attr.unescape_value()?) {
                    pending.row = r;
                    pending.col = c;
                }
            }
            b"t" => pending.kind = Some(attr.unescape_value()?.into_owned()),
            b"s" => pending.style = attr.unescape_value()?.parse().ok(),
            _ => {}
        }
    }
    Ok(pending)
}

fn merge_region(e: &BytesStart<'_>) -> Result<Option<MergedRegion>, XlsxError> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == b"ref" {
            let value = attr.unescape_value()?;
            return Ok(parse_range_ref(&value).map(|((fr, fc), (lr, lc))| MergedRegion {
                first_row: fr,
                first_col: fc,
                last_row: lr,
                last_col: lc,
            }));
        }
    }
    Ok(None)
}

fn column_span(e: &BytesStart<'_>) -> Result<Option<ColumnSpan>, XlsxError> {
    let mut min = None;
    let mut max = None;
    let mut width = None;
    for attr in e.attributes() {
        let attr = attr?;
        match attr.key.as_ref() {
            b"min" => min = attr.unescape_value()?.parse::<u32>().ok(),
            b"max" => max = attr.unescape_value()?.parse::<u32>().ok(),
            b"width" => width = attr.unescape_value()?.parse::<f64>().ok(),
            _ => {}
        }
    }
    match (min, max, width) {
        (Some(min), Some(max), Some(width)) if min >= 1 && max >= min => Ok(Some(ColumnSpan {
            first_col: min - 1,
            last_col: max - 1,
            width,
        })),
        _ => Ok(None),
    }
}

fn render(
    cell: &PendingCell,
    shared_strings: &[String],
    formats: &NumberFormats,
    date1904: bool,
) -> String {
    let raw = cell.raw.as_str();
    match cell.kind.as_deref() {
        Some("s") => raw
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|idx| shared_strings.get(idx))
            .cloned()
            .unwrap_or_default(),
        Some("inlineStr") | Some("str") | Some("e") | Some("d") => raw.to_string(),
        Some("b") => match raw.trim() {
            "1" | "true" => "TRUE".to_string(),
            _ => "FALSE".to_string(),
        },
        _ => match raw.trim().parse::<f64>() {
            Ok(number) => formats.format_number(number, cell.style, date1904),
            Err(_) => raw.to_string(),
        },
    }
}
