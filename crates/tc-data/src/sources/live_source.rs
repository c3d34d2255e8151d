//! Direct-parse table reader over an origin spreadsheet

use std::io::{Read, Seek};

use tc_core::{ColumnWidths, Headers, RowRecord, TableError, TableReader, TableResult};
use tracing::debug;

use crate::config::CacheConfig;
use crate::xlsx::{Sheet, Workbook};

/// Origin protection: searches over a live sheet never scan more rows than this
pub const LIVE_SEARCH_ROW_LIMIT: usize = 10_000;

/// Table reader that answers range reads from a parsed sheet
pub struct LiveTableReader {
    table_name: String,
    headers: Headers,
    widths: ColumnWidths,
    /// Parsed sheet; `None` once closed
    sheet: Option<Sheet>,
    /// Sheet row index of each data row, in order
    data_rows: Vec<u32>,
}

impl LiveTableReader {
    /// Parse `table_name` out of a workbook stream using default width settings
    pub fn open<R: Read + Seek>(reader: R, table_name: &str) -> TableResult<Self> {
        Self::open_with_config(reader, table_name, &CacheConfig::default())
    }

    /// Parse `table_name` out of a workbook stream
    pub fn open_with_config<R: Read + Seek>(
        reader: R,
        table_name: &str,
        config: &CacheConfig,
    ) -> TableResult<Self> {
        let mut workbook = Workbook::open_with_part_limit(reader, config.size_limits.xml_part_bytes)?;
        let sheet = workbook
            .read_sheet(table_name)?
            .ok_or_else(|| TableError::NotFound(format!("table '{}'", table_name)))?;

        let header_cols = header_width(&sheet);
        let headers: Headers = (0..header_cols)
            .map(|col| sheet.resolved_value(0, col))
            .collect();

        let widths = headers
            .iter()
            .enumerate()
            .map(|(col, name)| {
                let chars = sheet
                    .column_width(col as u32)
                    .or_else(|| sheet.default_col_width());
                (name.clone(), config.width_px(chars))
            })
            .collect();

        let data_rows: Vec<u32> = sheet.row_indices().filter(|&r| r > 0).collect();

        debug!(
            "Opened live table '{}': {} columns, {} data rows",
            table_name,
            headers.len(),
            data_rows.len()
        );

        Ok(Self {
            table_name: table_name.to_string(),
            headers,
            widths,
            sheet: Some(sheet),
            data_rows,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn sheet(&self) -> TableResult<&Sheet> {
        self.sheet
            .as_ref()
            .ok_or_else(|| TableError::InvalidState(format!("table '{}' is closed", self.table_name)))
    }

    fn record(&self, sheet: &Sheet, row: u32) -> RowRecord {
        self.headers
            .iter()
            .enumerate()
            .map(|(col, name)| (name.clone(), sheet.resolved_value(row, col as u32)))
            .collect()
    }
}

/// Number of header columns: up to the last populated cell of row 0,
/// extended by merged regions anchored in the header row
fn header_width(sheet: &Sheet) -> u32 {
    let cells = sheet.last_col(0).map(|c| c + 1).unwrap_or(0);
    let merged = sheet
        .merged()
        .iter()
        .filter(|m| m.first_row == 0)
        .map(|m| m.last_col + 1)
        .max()
        .unwrap_or(0);
    cells.max(merged)
}

impl TableReader for LiveTableReader {
    fn headers(&self) -> TableResult<Headers> {
        self.sheet()?;
        Ok(self.headers.clone())
    }

    fn column_widths(&self) -> ColumnWidths {
        self.widths.clone()
    }

    fn read_range(&self, start: usize, count: usize) -> TableResult<Vec<RowRecord>> {
        let sheet = self.sheet()?;
        Ok(self
            .data_rows
            .iter()
            .skip(start)
            .take(count)
            .map(|&row| self.record(sheet, row))
            .collect())
    }

    fn row_count(&self) -> TableResult<usize> {
        self.sheet()?;
        Ok(self.data_rows.len())
    }

    fn close(&mut self) {
        if self.sheet.take().is_some() {
            debug!("Closed live table '{}'", self.table_name);
        }
    }

    fn search_limit(&self) -> Option<usize> {
        Some(LIVE_SEARCH_ROW_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_xlsxwriter::{Format, Workbook as XlsxWriter};
    use std::io::Cursor;

    fn book(rows: usize) -> Vec<u8> {
        let mut book = XlsxWriter::new();
        let sheet = book.add_worksheet();
        sheet.set_name("Armatures").unwrap();
        sheet.write_string(0, 0, "Name").unwrap();
        sheet.write_string(0, 1, "Room").unwrap();
        sheet.write_string(0, 2, "PDF").unwrap();
        sheet.set_column_width(0, 25).unwrap();
        for i in 0..rows {
            let r = i as u32 + 1;
            sheet.write_string(r, 0, format!("V-{i}")).unwrap();
            sheet.write_number(r, 1, i as f64).unwrap();
        }
        book.save_to_buffer().unwrap()
    }

    #[test]
    fn headers_widths_and_rows() {
        let reader = LiveTableReader::open(Cursor::new(book(3)), "Armatures").unwrap();
        assert_eq!(reader.headers().unwrap(), vec!["Name", "Room", "PDF"]);

        let widths = reader.column_widths();
        // 25 characters plus the writer's padding
        assert!(widths["Name"] >= 1000);
        assert_eq!(widths["Room"], 320);

        let rows = reader.read_range(0, 10).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1]["Name"], "V-1");
        assert_eq!(rows[1]["Room"], "1");
        assert_eq!(rows[1]["PDF"], "");
        assert_eq!(rows[1].keys().collect::<Vec<_>>(), vec!["Name", "Room", "PDF"]);
        assert_eq!(reader.row_count().unwrap(), 3);
    }

    #[test]
    fn range_reads_stop_at_the_end() {
        let reader = LiveTableReader::open(Cursor::new(book(5)), "Armatures").unwrap();
        let tail = reader.read_range(3, 10).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0]["Name"], "V-3");
        assert!(reader.read_range(5, 10).unwrap().is_empty());
        assert!(reader.read_range(2, 0).unwrap().is_empty());
    }

    #[test]
    fn missing_table_is_not_found() {
        let result = LiveTableReader::open(Cursor::new(book(1)), "Signals");
        assert!(matches!(result, Err(TableError::NotFound(_))));
    }

    #[test]
    fn merged_cells_repeat_anchor_value() {
        let mut book = XlsxWriter::new();
        let sheet = book.add_worksheet();
        sheet.set_name("Data").unwrap();
        sheet.write_string(0, 0, "Zone").unwrap();
        sheet.write_string(0, 1, "Tag").unwrap();
        sheet.merge_range(1, 0, 3, 0, "North", &Format::new()).unwrap();
        sheet.write_string(1, 1, "T1").unwrap();
        sheet.write_string(2, 1, "T2").unwrap();
        sheet.write_string(3, 1, "T3").unwrap();
        let bytes = book.save_to_buffer().unwrap();

        let reader = LiveTableReader::open(Cursor::new(bytes), "Data").unwrap();
        let rows = reader.read_range(0, 3).unwrap();
        assert!(rows.iter().all(|r| r["Zone"] == "North"));
        assert_eq!(rows[2]["Tag"], "T3");
    }

    #[test]
    fn close_is_idempotent_and_blocks_reads() {
        let mut reader = LiveTableReader::open(Cursor::new(book(2)), "Armatures").unwrap();
        reader.close();
        reader.close();
        assert!(matches!(reader.read_range(0, 1), Err(TableError::InvalidState(_))));
    }

    #[test]
    fn search_is_case_insensitive() {
        let reader = LiveTableReader::open(Cursor::new(book(30)), "Armatures").unwrap();
        let hits = reader.search("v-2", Some("NAME")).unwrap();
        // V-2 and V-20..V-29
        assert_eq!(hits.len(), 11);
    }
}
