//! Number formats (`xl/styles.xml`) and cell value rendering

use ahash::AHashMap;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use quick_xml::events::Event;
use quick_xml::Reader;

use super::XlsxError;

/// Largest serial that maps to a valid date (9999-12-31)
const MAX_DATE_SERIAL: f64 = 2_958_465.0;

/// How a numeric cell should be rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormatKind {
    General,
    Fixed { decimals: usize, grouped: bool },
    Percent { decimals: usize },
    Date,
    DateTime,
    Time,
}

/// Style index -> number format lookup
#[derive(Debug, Clone, Default)]
pub struct NumberFormats {
    /// `numFmtId` of each `cellXfs/xf`, indexed by the cell's `s` attribute
    xf_formats: Vec<u32>,

    /// Custom format codes declared in `numFmts`
    custom: AHashMap<u32, String>,
}

impl NumberFormats {
    pub fn parse(xml: &[u8]) -> Result<Self, XlsxError> {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut formats = NumberFormats::default();
        let mut in_cell_xfs = false;

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                    b"numFmt" => {
                        let mut id = None;
                        let mut code = None;
                        for attr in e.attributes() {
                            let attr = attr?;
                            match attr.key.as_ref() {
                                b"numFmtId" => id = attr.unescape_value()?.parse::<u32>().ok(),
                                b"formatCode" => code = Some(attr.unescape_value()?.into_owned()),
                                _ => {}
                            }
                        }
                        if let (Some(id), Some(code)) = (id, code) {
                            formats.custom.insert(id, code);
                        }
                    }
                    b"cellXfs" => in_cell_xfs = true,
                    b"xf" if in_cell_xfs => {
                        let mut id = 0;
                        for attr in e.attributes() {
                            let attr = attr?;
                            if attr.key.as_ref() == b"numFmtId" {
                                id = attr.unescape_value()?.parse::<u32>().unwrap_or(0);
                            }
                        }
                        formats.xf_formats.push(id);
                    }
                    _ => {}
                },
                Event::End(e) if e.local_name().as_ref() == b"cellXfs" => in_cell_xfs = false,
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(formats)
    }

    /// Render a numeric cell the way its style asks for
    pub fn format_number(&self, value: f64, style: Option<usize>, date1904: bool) -> String {
        match self.kind_for(style) {
            FormatKind::General => format_general(value),
            FormatKind::Fixed { decimals, grouped } => format_fixed(value, decimals, grouped),
            FormatKind::Percent { decimals } => format!("{:.*}%", decimals, value * 100.0),
            kind @ (FormatKind::Date | FormatKind::DateTime | FormatKind::Time) => {
                match serial_to_datetime(value, date1904) {
                    Some(dt) => {
                        let pattern = match kind {
                            FormatKind::Date => "%Y-%m-%d",
                            FormatKind::Time => "%H:%M:%S",
                            _ => "%Y-%m-%d %H:%M:%S",
                        };
                        dt.format(pattern).to_string()
                    }
                    None => format_general(value),
                }
            }
        }
    }

    fn kind_for(&self, style: Option<usize>) -> FormatKind {
        let Some(id) = style.and_then(|s| self.xf_formats.get(s)).copied() else {
            return FormatKind::General;
        };
        if let Some(code) = self.custom.get(&id) {
            return classify_code(code);
        }
        builtin_kind(id)
    }
}

fn builtin_kind(id: u32) -> FormatKind {
    match id {
        1 => FormatKind::Fixed { decimals: 0, grouped: false },
        2 => FormatKind::Fixed { decimals: 2, grouped: false },
        3 => FormatKind::Fixed { decimals: 0, grouped: true },
        4 => FormatKind::Fixed { decimals: 2, grouped: true },
        9 => FormatKind::Percent { decimals: 0 },
        10 => FormatKind::Percent { decimals: 2 },
        14..=17 | 27..=36 | 50..=58 => FormatKind::Date,
        18..=21 | 45..=47 => FormatKind::Time,
        22 => FormatKind::DateTime,
        _ => FormatKind::General,
    }
}

/// Classify a custom format code by the tokens of its first section
fn classify_code(code: &str) -> FormatKind {
    let section = code.split(';').next().unwrap_or_default();

    // Drop quoted literals, escaped characters and bracketed modifiers ([Red], [$-409])
    let mut tokens = String::new();
    let mut chars = section.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                for q in chars.by_ref() {
                    if q == '"' {
                        break;
                    }
                }
            }
            '\\' | '_' | '*' => {
                chars.next();
            }
            '[' => {
                let mut inner = String::new();
                for q in chars.by_ref() {
                    if q == ']' {
                        break;
                    }
                    inner.push(q);
                }
                // Elapsed-time brackets ([h], [mm]) still mean time
                let lower = inner.to_ascii_lowercase();
                if !lower.is_empty() && lower.chars().all(|ch| matches!(ch, 'h' | 'm' | 's')) {
                    tokens.push_str(&lower);
                }
            }
            c => tokens.push(c.to_ascii_lowercase()),
        }
    }

    let has_date = tokens.contains('y') || tokens.contains('d');
    let has_time = tokens.contains('h') || tokens.contains('s');
    match (has_date, has_time) {
        (true, true) => return FormatKind::DateTime,
        (true, false) => return FormatKind::Date,
        (false, true) => return FormatKind::Time,
        (false, false) if tokens.contains('m') => return FormatKind::Date,
        _ => {}
    }

    let decimals = tokens
        .split_once('.')
        .map(|(_, frac)| frac.chars().take_while(|c| matches!(c, '0' | '#' | '?')).count())
        .unwrap_or(0);

    if tokens.contains('%') {
        FormatKind::Percent { decimals }
    } else if tokens.contains('0') || tokens.contains('#') {
        FormatKind::Fixed {
            decimals,
            grouped: tokens.contains(','),
        }
    } else {
        FormatKind::General
    }
}

/// Render like the General format: integers without a decimal point,
/// fractions with trailing zeros removed
pub(crate) fn format_general(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let text = format!("{:.10}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

fn format_fixed(value: f64, decimals: usize, grouped: bool) -> String {
    let text = format!("{:.*}", decimals, value);
    if !grouped {
        return text;
    }

    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.as_str()),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };

    let mut grouped_int = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (idx, ch) in int_part.chars().enumerate() {
        if idx > 0 && (int_part.len() - idx) % 3 == 0 {
            grouped_int.push(',');
        }
        grouped_int.push(ch);
    }

    match frac_part {
        Some(frac) => format!("{sign}{grouped_int}.{frac}"),
        None => format!("{sign}{grouped_int}"),
    }
}

/// Convert a spreadsheet serial date to a calendar timestamp.
///
/// The 1900 system counts 1900-02-29 as a real day, so serials before 61 are
/// shifted by one to line up with the calendar.
fn serial_to_datetime(serial: f64, date1904: bool) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial < 0.0 || serial > MAX_DATE_SERIAL {
        return None;
    }

    let mut days = serial.floor() as i64;
    let mut seconds = ((serial - serial.floor()) * 86_400.0).round() as i64;
    if seconds >= 86_400 {
        days += 1;
        seconds -= 86_400;
    }

    let base = if date1904 {
        NaiveDate::from_ymd_opt(1904, 1, 1)?
    } else {
        if days < 61 {
            days += 1;
        }
        NaiveDate::from_ymd_opt(1899, 12, 30)?
    };

    base.and_hms_opt(0, 0, 0)?
        .checked_add_signed(Duration::days(days))?
        .checked_add_signed(Duration::seconds(seconds))
}
