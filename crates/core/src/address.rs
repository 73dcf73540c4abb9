//! A1-style cell addresses.
//!
//! Coordinates are zero-based internally; the text form is one-based with
//! optional `$` markers for absolute components (`$B$7`).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AddressError, Result};

/// Number of rows in a worksheet grid.
pub const MAX_ROWS: usize = 1_048_576;
/// Number of columns in a worksheet grid (A..XFD).
pub const MAX_COLS: usize = 16_384;

/// A single cell coordinate with absolute/relative markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellAddr {
    pub row: usize,
    pub col: usize,
    #[serde(default, skip_serializing_if = "is_false")]
    pub row_abs: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub col_abs: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl CellAddr {
    /// Relative address at (row, col).
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col, row_abs: false, col_abs: false }
    }

    /// Fully absolute address (`$A$1`).
    pub const fn absolute(row: usize, col: usize) -> Self {
        Self { row, col, row_abs: true, col_abs: true }
    }

    /// Parse `A1`, `$A1`, `A$1` or `$A$1` (case-insensitive).
    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim();
        let bytes = s.as_bytes();
        let mut pos = 0;

        let col_abs = bytes.first() == Some(&b'$');
        if col_abs {
            pos += 1;
        }

        let letters_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_alphabetic() {
            pos += 1;
        }
        if pos == letters_start {
            return Err(AddressError::invalid(input, "missing column letters"));
        }
        let letters = &s[letters_start..pos];

        let row_abs = bytes.get(pos) == Some(&b'$');
        if row_abs {
            pos += 1;
        }

        let digits = &s[pos..];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AddressError::invalid(input, "missing or malformed row number"));
        }

        let col = letters_to_col(letters)
            .ok_or_else(|| AddressError::invalid(input, "column out of range"))?;
        let row: usize = digits
            .parse()
            .map_err(|_| AddressError::invalid(input, "row number too large"))?;
        if row == 0 {
            return Err(AddressError::invalid(input, "row numbers start at 1"));
        }
        if row > MAX_ROWS {
            return Err(AddressError::OutOfBounds { row: row - 1, col });
        }

        Ok(Self { row: row - 1, col, row_abs, col_abs })
    }

    /// Returns this address with both absolute markers cleared.
    pub fn to_relative(self) -> Self {
        Self::new(self.row, self.col)
    }

    /// Address text without `$` markers.
    pub fn to_relative_string(&self) -> String {
        format!("{}{}", col_to_letters(self.col), self.row + 1)
    }

    /// Address text with both components absolute.
    pub fn to_absolute_string(&self) -> String {
        format!("${}${}", col_to_letters(self.col), self.row + 1)
    }

    pub fn is_in_bounds(&self) -> bool {
        self.row < MAX_ROWS && self.col < MAX_COLS
    }
}

impl fmt::Display for CellAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.col_abs {
            f.write_str("$")?;
        }
        f.write_str(&col_to_letters(self.col))?;
        if self.row_abs {
            f.write_str("$")?;
        }
        write!(f, "{}", self.row + 1)
    }
}

impl std::str::FromStr for CellAddr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Convert column index to letter(s): 0 -> A, 25 -> Z, 26 -> AA, etc.
pub fn col_to_letters(col: usize) -> String {
    let mut result = String::new();
    let mut n = col + 1;
    while n > 0 {
        n -= 1;
        result.insert(0, (b'A' + (n % 26) as u8) as char);
        n /= 26;
    }
    result
}

/// Convert column letters to a zero-based index. Returns `None` for
/// non-letters or columns past `XFD`.
pub fn letters_to_col(letters: &str) -> Option<usize> {
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let mut col = 0usize;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        col = col * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    let col = col - 1;
    (col < MAX_COLS).then_some(col)
}
