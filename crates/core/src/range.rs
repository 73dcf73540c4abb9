//! Rectangular ranges and multi-area selections.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::{letters_to_col, CellAddr, MAX_COLS, MAX_ROWS};
use crate::error::{AddressError, Result};

/// A normalized rectangular range, optionally qualified by a sheet name.
///
/// `start` is always the top-left corner and `end` the bottom-right corner;
/// parsing an inverted range (`D9:B2`) swaps the corners instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet: Option<String>,
    pub start: CellAddr,
    pub end: CellAddr,
}

impl CellRange {
    /// Build a range from two corners in any order.
    pub fn new(a: CellAddr, b: CellAddr) -> Self {
        let (top, bottom) = if a.row <= b.row { (a, b) } else { (b, a) };
        let (left, right) = if a.col <= b.col { (a, b) } else { (b, a) };
        Self {
            sheet: None,
            start: CellAddr {
                row: top.row,
                col: left.col,
                row_abs: top.row_abs,
                col_abs: left.col_abs,
            },
            end: CellAddr {
                row: bottom.row,
                col: right.col,
                row_abs: bottom.row_abs,
                col_abs: right.col_abs,
            },
        }
    }

    /// Range from zero-based corner coordinates.
    pub fn from_coords(start_row: usize, start_col: usize, end_row: usize, end_col: usize) -> Self {
        Self::new(CellAddr::new(start_row, start_col), CellAddr::new(end_row, end_col))
    }

    /// Single-cell range.
    pub fn cell(row: usize, col: usize) -> Self {
        Self::from_coords(row, col, row, col)
    }

    pub fn with_sheet(mut self, sheet: impl Into<String>) -> Self {
        self.sheet = Some(sheet.into());
        self
    }

    /// Parse `B2:D9`, `Sheet2!A1`, `'My Sheet'!A1:B2`, `A:C` or `3:5`.
    pub fn parse(input: &str) -> Result<Self> {
        let text = input.trim();
        if text.is_empty() {
            return Err(AddressError::invalid(input, "empty address"));
        }

        let (sheet, body) = split_sheet_prefix(text).map_err(|reason| AddressError::invalid(input, reason))?;

        let mut parts = body.split(':');
        let first = parts.next().unwrap_or_default();
        let second = parts.next();
        if parts.next().is_some() {
            return Err(AddressError::invalid(input, "too many ':' separators"));
        }

        let mut range = match second {
            None => {
                let addr = CellAddr::parse(first).map_err(|e| retag(e, input))?;
                Self::new(addr, addr)
            }
            Some(second) => {
                if let (Some(a), Some(b)) = (whole_col(first), whole_col(second)) {
                    Self::from_coords(0, a, MAX_ROWS - 1, b)
                } else if let (Some(a), Some(b)) = (whole_row(first), whole_row(second)) {
                    Self::from_coords(a, 0, b, MAX_COLS - 1)
                } else {
                    let a = CellAddr::parse(first).map_err(|e| retag(e, input))?;
                    let b = CellAddr::parse(second).map_err(|e| retag(e, input))?;
                    Self::new(a, b)
                }
            }
        };
        range.sheet = sheet;
        Ok(range)
    }

    pub fn rows(&self) -> usize {
        self.end.row - self.start.row + 1
    }

    pub fn cols(&self) -> usize {
        self.end.col - self.start.col + 1
    }

    pub fn cell_count(&self) -> usize {
        self.rows() * self.cols()
    }

    pub fn is_single_cell(&self) -> bool {
        self.start.row == self.end.row && self.start.col == self.end.col
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        row >= self.start.row && row <= self.end.row && col >= self.start.col && col <= self.end.col
    }

    /// True when the two rectangles share at least one cell (sheet names ignored).
    pub fn overlaps(&self, other: &CellRange) -> bool {
        self.start.row <= other.end.row
            && other.start.row <= self.end.row
            && self.start.col <= other.end.col
            && other.start.col <= self.end.col
    }

    pub fn intersect(&self, other: &CellRange) -> Option<CellRange> {
        if !self.overlaps(other) {
            return None;
        }
        let mut r = CellRange::from_coords(
            self.start.row.max(other.start.row),
            self.start.col.max(other.start.col),
            self.end.row.min(other.end.row),
            self.end.col.min(other.end.col),
        );
        r.sheet = self.sheet.clone();
        Some(r)
    }

    /// Cells in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let (c0, c1) = (self.start.col, self.end.col);
        (self.start.row..=self.end.row).flat_map(move |r| (c0..=c1).map(move |c| (r, c)))
    }

    /// The same range with every component absolute (`$A$1:$B$2`).
    pub fn to_absolute_string(&self) -> String {
        let mut out = self.sheet_prefix();
        out.push_str(&self.start.to_absolute_string());
        if !self.is_single_cell() {
            out.push(':');
            out.push_str(&self.end.to_absolute_string());
        }
        out
    }

    fn sheet_prefix(&self) -> String {
        match &self.sheet {
            Some(name) => format!("{}!", format_sheet_name(name)),
            None => String::new(),
        }
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sheet_prefix())?;
        write!(f, "{}", self.start)?;
        if !self.is_single_cell() || self.start != self.end {
            write!(f, ":{}", self.end)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for CellRange {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn retag(err: AddressError, input: &str) -> AddressError {
    match err {
        AddressError::InvalidAddress { reason, .. } => AddressError::invalid(input, reason),
        other => other,
    }
}

fn whole_col(s: &str) -> Option<usize> {
    let s = s.trim_start_matches('$');
    letters_to_col(s)
}

fn whole_row(s: &str) -> Option<usize> {
    let s = s.trim_start_matches('$');
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: usize = s.parse().ok()?;
    (n >= 1 && n <= MAX_ROWS).then(|| n - 1)
}

/// Split an optional `Sheet!` / `'Quoted Sheet'!` prefix off an address.
fn split_sheet_prefix(text: &str) -> std::result::Result<(Option<String>, &str), &'static str> {
    if let Some(rest) = text.strip_prefix('\'') {
        let mut name = String::new();
        let mut chars = rest.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '\'' {
                if let Some(&(_, '\'')) = chars.peek() {
                    chars.next();
                    name.push('\'');
                    continue;
                }
                let after = &rest[i + 1..];
                return match after.strip_prefix('!') {
                    Some(body) => Ok((Some(name), body)),
                    None => Err("quoted sheet name must be followed by '!'"),
                };
            }
            name.push(c);
        }
        return Err("unterminated sheet name");
    }

    match text.rfind('!') {
        Some(idx) => {
            let name = &text[..idx];
            if name.is_empty() {
                return Err("empty sheet name");
            }
            Ok((Some(name.to_string()), &text[idx + 1..]))
        }
        None => Ok((None, text)),
    }
}

/// Format a sheet name, adding quotes if necessary.
pub fn format_sheet_name(name: &str) -> String {
    let needs_quotes = name.is_empty()
        || name.chars().any(|c| !(c.is_alphanumeric() || c == '_' || c == '.'))
        || name.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false);

    if needs_quotes {
        format!("'{}'", name.replace('\'', "''"))
    } else {
        name.to_string()
    }
}

/// A non-contiguous selection made of several rectangular areas.
///
/// Iteration yields the first area's cells in row-major order, then the
/// cells of each following area that no earlier area already covered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MultiRange {
    areas: Vec<CellRange>,
}

impl MultiRange {
    pub fn new(first: CellRange) -> Self {
        Self { areas: vec![first] }
    }

    /// Union of two selections.
    pub fn union(a: impl Into<MultiRange>, b: impl Into<MultiRange>) -> Self {
        let mut out = a.into();
        out.areas.extend(b.into().areas);
        out
    }

    /// Parse a comma-separated list of ranges (`A1:B2,D4`).
    pub fn parse(input: &str) -> Result<Self> {
        let areas = input
            .split(',')
            .map(CellRange::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { areas })
    }

    pub fn push(&mut self, area: CellRange) {
        self.areas.push(area);
    }

    pub fn areas(&self) -> &[CellRange] {
        &self.areas
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.areas.iter().any(|a| a.contains(row, col))
    }

    /// Distinct cells, in union order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.areas.iter().enumerate().flat_map(move |(i, area)| {
            let earlier = &self.areas[..i];
            area.iter()
                .filter(move |&(r, c)| !earlier.iter().any(|e| e.contains(r, c)))
        })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }
}

impl From<CellRange> for MultiRange {
    fn from(range: CellRange) -> Self {
        MultiRange::new(range)
    }
}

impl std::ops::Add for MultiRange {
    type Output = MultiRange;

    fn add(self, rhs: MultiRange) -> MultiRange {
        MultiRange::union(self, rhs)
    }
}

impl fmt::Display for MultiRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, area) in self.areas.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", area)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_simple_range() {
        let r = CellRange::parse("B2:D9").unwrap();
        assert_eq!(r.sheet, None);
        assert_eq!((r.start.row, r.start.col), (1, 1));
        assert_eq!((r.end.row, r.end.col), (8, 3));
        assert_eq!(r.rows(), 8);
        assert_eq!(r.cols(), 3);
    }

    #[test]
    fn test_parse_inverted_range_swaps() {
        let r = CellRange::parse("D9:B2").unwrap();
        assert_eq!(r, CellRange::parse("B2:D9").unwrap());

        // Mixed inversion: bottom-left to top-right
        let r = CellRange::parse("B9:D2").unwrap();
        assert_eq!((r.start.row, r.start.col, r.end.row, r.end.col), (1, 1, 8, 3));
    }

    #[test]
    fn test_parse_sheet_qualified() {
        let r = CellRange::parse("Sheet2!A1").unwrap();
        assert_eq!(r.sheet.as_deref(), Some("Sheet2"));
        assert!(r.is_single_cell());

        let r = CellRange::parse("'Bob''s Data'!A1:B2").unwrap();
        assert_eq!(r.sheet.as_deref(), Some("Bob's Data"));
        assert_eq!(r.to_string(), "'Bob''s Data'!A1:B2");
    }

    #[test]
    fn test_parse_whole_columns_and_rows() {
        let r = CellRange::parse("A:C").unwrap();
        assert_eq!((r.start.row, r.end.row), (0, MAX_ROWS - 1));
        assert_eq!((r.start.col, r.end.col), (0, 2));

        let r = CellRange::parse("4:4").unwrap();
        assert_eq!((r.start.row, r.end.row), (3, 3));
        assert_eq!(r.cols(), MAX_COLS);
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "A1:B2:C3", "'Sheet1A1", "'Sheet1'A1", "!A1", "A1:", "1A:B2"] {
            assert!(CellRange::parse(bad).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn test_overlaps_and_intersect() {
        let a = CellRange::parse("A1:C3").unwrap();
        let b = CellRange::parse("C3:D4").unwrap();
        let c = CellRange::parse("D1:E2").unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.intersect(&b).unwrap().to_string(), "C3");
        assert!(a.intersect(&c).is_none());
    }

    #[test]
    fn test_iter_row_major() {
        let r = CellRange::parse("A1:B2").unwrap();
        let cells: Vec<_> = r.iter().collect();
        assert_eq!(cells, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn test_multi_range_union_order() {
        let a = CellRange::parse("A1:B2").unwrap();
        let b = CellRange::parse("B2:C2").unwrap();
        let combined = MultiRange::from(a) + MultiRange::from(b);
        let cells: Vec<_> = combined.iter().collect();
        // B2 appears once, in the first area's position
        assert_eq!(cells, vec![(0, 0), (0, 1), (1, 0), (1, 1), (1, 2)]);
        assert_eq!(combined.len(), 5);
        assert_eq!(combined.to_string(), "A1:B2,B2:C2");
    }

    #[test]
    fn test_multi_range_parse() {
        let m = MultiRange::parse("A2:B2,A5:B5").unwrap();
        assert_eq!(m.areas().len(), 2);
        assert!(m.contains(4, 1));
        assert!(!m.contains(2, 0));
    }

    #[test]
    fn test_absolute_string() {
        let r = CellRange::parse("Data!b2:c3").unwrap();
        assert_eq!(r.to_absolute_string(), "Data!$B$2:$C$3");
    }

    fn arb_range() -> impl Strategy<Value = CellRange> {
        (0usize..5000, 0usize..800, 0usize..5000, 0usize..800, any::<[bool; 4]>()).prop_map(
            |(r0, c0, r1, c1, abs)| {
                CellRange::new(
                    CellAddr { row: r0, col: c0, row_abs: abs[0], col_abs: abs[1] },
                    CellAddr { row: r1, col: c1, row_abs: abs[2], col_abs: abs[3] },
                )
            },
        )
    }

    proptest! {
        #[test]
        fn prop_range_resolve_render_idempotent(range in arb_range(), sheet in "[A-Za-z][A-Za-z0-9 ']{0,8}") {
            let range = range.with_sheet(sheet);
            let text = range.to_string();
            let resolved = CellRange::parse(&text).unwrap();
            prop_assert_eq!(&resolved, &range);
            let again = CellRange::parse(&resolved.to_string()).unwrap();
            prop_assert_eq!(again, resolved);
        }
    }
}
