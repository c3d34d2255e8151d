//! A1-style cell references

/// Largest column index a worksheet may use (XFD)
pub const MAX_COLS: u32 = 16_384;

/// Largest row count a worksheet may use
pub const MAX_ROWS: u32 = 1_048_576;

/// Parse an A1 reference (`"C7"`, `"$C$7"`) into zero-based `(row, col)`
pub fn parse_cell_ref(reference: &str) -> Option<(u32, u32)> {
    let reference = reference.trim();
    let mut col: u32 = 0;
    let mut letters = 0;
    let mut digits_start = None;

    for (idx, ch) in reference.char_indices() {
        match ch {
            '$' => continue,
            'A'..='Z' | 'a'..='z' if digits_start.is_none() => {
                let value = ch.to_ascii_uppercase() as u32 - 'A' as u32 + 1;
                col = col.checked_mul(26)?.checked_add(value)?;
                letters += 1;
            }
            '0'..='9' => {
                if digits_start.is_none() {
                    digits_start = Some(idx);
                }
            }
            _ => return None,
        }
    }

    let digits = &reference[digits_start?..];
    let row: u32 = digits.parse().ok()?;
    if letters == 0 || row == 0 || row > MAX_ROWS || col > MAX_COLS {
        return None;
    }
    Some((row - 1, col - 1))
}

/// Parse an A1 range (`"A1:C3"`, or a single cell) into inclusive zero-based
/// `((first_row, first_col), (last_row, last_col))`, normalized so first <= last.
pub fn parse_range_ref(reference: &str) -> Option<((u32, u32), (u32, u32))> {
    let (a, b) = match reference.split_once(':') {
        Some((a, b)) => (parse_cell_ref(a)?, parse_cell_ref(b)?),
        None => {
            let cell = parse_cell_ref(reference)?;
            (cell, cell)
        }
    };
    Some((
        (a.0.min(b.0), a.1.min(b.1)),
        (a.0.max(b.0), a.1.max(b.1)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_refs() {
        assert_eq!(parse_cell_ref("A1"), Some((0, 0)));
        assert_eq!(parse_cell_ref("c7"), Some((6, 2)));
        assert_eq!(parse_cell_ref("$AB$12"), Some((11, 27)));
        assert_eq!(parse_cell_ref("XFD1"), Some((0, 16_383)));
    }

    #[test]
    fn rejects_malformed_refs() {
        assert_eq!(parse_cell_ref("A0"), None);
        assert_eq!(parse_cell_ref("12"), None);
        assert_eq!(parse_cell_ref("A"), None);
        assert_eq!(parse_cell_ref("A1B"), None);
        assert_eq!(parse_cell_ref("XFE1"), None);
    }

    #[test]
    fn parses_ranges() {
        assert_eq!(parse_range_ref("B2:D5"), Some(((1, 1), (4, 3))));
        assert_eq!(parse_range_ref("D5:B2"), Some(((1, 1), (4, 3))));
        assert_eq!(parse_range_ref("C3"), Some(((2, 2), (2, 2))));
    }
}
