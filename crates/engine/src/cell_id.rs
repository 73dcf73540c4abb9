//! Cell identity for the dependency graph.
//!
//! A `CellId` uniquely identifies a cell across all sheets in a workbook.

use cellbook_core::col_to_letters;

use crate::sheet::SheetId;

/// Unique identifier for a cell in a workbook.
///
/// Combines sheet identity with row/column coordinates.
/// Used as graph nodes in the dependency graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId {
    /// The sheet this cell belongs to (stable, never reused after deletion)
    pub sheet: SheetId,
    /// Row index (0-based)
    pub row: usize,
    /// Column index (0-based)
    pub col: usize,
}

impl CellId {
    #[inline]
    pub fn new(sheet: SheetId, row: usize, col: usize) -> Self {
        Self { sheet, row, col }
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sheet{}!{}{}", self.sheet.raw(), col_to_letters(self.col), self.row + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_id_equality() {
        let a = CellId::new(SheetId::from_raw(1), 0, 0);
        let b = CellId::new(SheetId::from_raw(1), 0, 0);
        let c = CellId::new(SheetId::from_raw(2), 0, 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_cell_id_ordering_is_sheet_row_col() {
        let mut ids = vec![
            CellId::new(SheetId::from_raw(2), 0, 0),
            CellId::new(SheetId::from_raw(1), 3, 0),
            CellId::new(SheetId::from_raw(1), 0, 5),
        ];
        ids.sort();
        assert_eq!(ids[0], CellId::new(SheetId::from_raw(1), 0, 5));
        assert_eq!(ids[2].sheet.raw(), 2);
    }

    #[test]
    fn test_cell_id_display() {
        assert_eq!(CellId::new(SheetId::from_raw(3), 9, 27).to_string(), "Sheet3!AB10");
    }
}
