//! Reference rewriting for structural edits and copies.
//!
//! Inserting rows/columns moves every reference at or after the insertion
//! point; deleting them removes referenced cells. A single reference into
//! a deleted block becomes `#REF!`, a range that loses part of its span
//! shrinks, and a range that loses all of it becomes `#REF!`.

use cellbook_core::{CellRange, MAX_COLS, MAX_ROWS};

use super::parser::{BoundExpr, Expr};
use super::value::CellError;
use crate::sheet::{SheetId, SheetRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Row,
    Col,
}

/// A row or column insertion/deletion on one sheet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralEdit {
    InsertRows { sheet: SheetId, at: usize, count: usize },
    DeleteRows { sheet: SheetId, at: usize, count: usize },
    InsertCols { sheet: SheetId, at: usize, count: usize },
    DeleteCols { sheet: SheetId, at: usize, count: usize },
}

impl StructuralEdit {
    pub fn sheet(&self) -> SheetId {
        match *self {
            StructuralEdit::InsertRows { sheet, .. }
            | StructuralEdit::DeleteRows { sheet, .. }
            | StructuralEdit::InsertCols { sheet, .. }
            | StructuralEdit::DeleteCols { sheet, .. } => sheet,
        }
    }

    pub fn axis(&self) -> Axis {
        match self {
            StructuralEdit::InsertRows { .. } | StructuralEdit::DeleteRows { .. } => Axis::Row,
            StructuralEdit::InsertCols { .. } | StructuralEdit::DeleteCols { .. } => Axis::Col,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, StructuralEdit::InsertRows { .. } | StructuralEdit::InsertCols { .. })
    }

    fn at_count(&self) -> (usize, usize) {
        match *self {
            StructuralEdit::InsertRows { at, count, .. }
            | StructuralEdit::DeleteRows { at, count, .. }
            | StructuralEdit::InsertCols { at, count, .. }
            | StructuralEdit::DeleteCols { at, count, .. } => (at, count),
        }
    }

    /// New position of an index on the edited axis; `None` if deleted.
    pub fn map_index(&self, idx: usize) -> Option<usize> {
        let (at, count) = self.at_count();
        if self.is_insert() {
            Some(if idx >= at { idx + count } else { idx })
        } else if idx < at {
            Some(idx)
        } else if idx >= at + count {
            Some(idx - count)
        } else {
            None
        }
    }

    /// New bounds of an inclusive span on the edited axis; `None` if the
    /// whole span was deleted.
    pub fn map_span(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        let (at, count) = self.at_count();
        if self.is_insert() {
            let start = if start >= at { start + count } else { start };
            let end = if end >= at { end + count } else { end };
            return Some((start, end));
        }
        let del_end = at + count;
        if start >= at && end < del_end {
            return None;
        }
        let new_start = if start < at {
            start
        } else if start >= del_end {
            start - count
        } else {
            at
        };
        let new_end = if end < at {
            end
        } else if end >= del_end {
            end - count
        } else {
            at - 1
        };
        Some((new_start, new_end))
    }

    pub fn map_row(&self, row: usize) -> Option<usize> {
        match self.axis() {
            Axis::Row => self.map_index(row),
            Axis::Col => Some(row),
        }
    }

    pub fn map_col(&self, col: usize) -> Option<usize> {
        match self.axis() {
            Axis::Col => self.map_index(col),
            Axis::Row => Some(col),
        }
    }

    pub fn map_cell(&self, row: usize, col: usize) -> Option<(usize, usize)> {
        Some((self.map_row(row)?, self.map_col(col)?))
    }

    /// Shift a rectangle on the edited sheet, keeping its sheet label.
    pub fn map_rect(&self, range: &CellRange) -> Option<CellRange> {
        let (sr, er, sc, ec) = match self.axis() {
            Axis::Row => {
                let (sr, er) = self.map_span(range.start.row, range.end.row)?;
                (sr, er, range.start.col, range.end.col)
            }
            Axis::Col => {
                let (sc, ec) = self.map_span(range.start.col, range.end.col)?;
                (range.start.row, range.end.row, sc, ec)
            }
        };
        let mut mapped = range.clone();
        mapped.start.row = sr;
        mapped.end.row = er;
        mapped.start.col = sc;
        mapped.end.col = ec;
        Some(mapped)
    }
}

fn targets(sheet: &SheetRef, formula_sheet: SheetId, edited: SheetId) -> bool {
    match sheet {
        SheetRef::Current => formula_sheet == edited,
        SheetRef::Id(id) => *id == edited,
        SheetRef::RefError { .. } => false,
    }
}

/// Rewrite references in a formula living on `formula_sheet` for a structural edit.
pub fn shift_expr(expr: &BoundExpr, formula_sheet: SheetId, edit: &StructuralEdit) -> BoundExpr {
    match expr {
        Expr::CellRef { sheet, col, row, col_abs, row_abs } => {
            if !targets(sheet, formula_sheet, edit.sheet()) {
                return expr.clone();
            }
            match edit.map_cell(*row, *col) {
                Some((row, col)) => Expr::CellRef { sheet: sheet.clone(), col, row, col_abs: *col_abs, row_abs: *row_abs },
                None => Expr::Error(CellError::Ref),
            }
        }
        Expr::Range { sheet, start_col, start_row, end_col, end_row, start_col_abs, start_row_abs, end_col_abs, end_row_abs } => {
            if !targets(sheet, formula_sheet, edit.sheet()) {
                return expr.clone();
            }
            // `A:A` keeps spanning every row, `1:1` every column
            let spans_edited_axis = match edit.axis() {
                Axis::Row => expr.is_whole_columns(),
                Axis::Col => expr.is_whole_rows(),
            };
            if spans_edited_axis {
                return expr.clone();
            }
            let mapped = match edit.axis() {
                Axis::Row => edit
                    .map_span(*start_row, *end_row)
                    .map(|(sr, er)| (sr, er, *start_col, *end_col)),
                Axis::Col => edit
                    .map_span(*start_col, *end_col)
                    .map(|(sc, ec)| (*start_row, *end_row, sc, ec)),
            };
            match mapped {
                Some((start_row, end_row, start_col, end_col)) => Expr::Range {
                    sheet: sheet.clone(),
                    start_col,
                    start_row,
                    end_col,
                    end_row,
                    start_col_abs: *start_col_abs,
                    start_row_abs: *start_row_abs,
                    end_col_abs: *end_col_abs,
                    end_row_abs: *end_row_abs,
                },
                None => Expr::Error(CellError::Ref),
            }
        }
        _ => map_children(expr, |child| shift_expr(child, formula_sheet, edit)),
    }
}

fn offset(value: usize, delta: isize, limit: usize) -> Option<usize> {
    let moved = value as isize + delta;
    (moved >= 0 && (moved as usize) < limit).then_some(moved as usize)
}

/// Rewrite a formula copied `d_row` rows and `d_col` columns away.
/// Relative parts move, absolute parts stay; references pushed off the
/// grid become `#REF!`.
pub fn relocate_expr(expr: &BoundExpr, d_row: isize, d_col: isize) -> BoundExpr {
    match expr {
        Expr::CellRef { sheet, col, row, col_abs, row_abs } => {
            let new_row = if *row_abs { Some(*row) } else { offset(*row, d_row, MAX_ROWS) };
            let new_col = if *col_abs { Some(*col) } else { offset(*col, d_col, MAX_COLS) };
            match (new_row, new_col) {
                (Some(row), Some(col)) => Expr::CellRef { sheet: sheet.clone(), col, row, col_abs: *col_abs, row_abs: *row_abs },
                _ => Expr::Error(CellError::Ref),
            }
        }
        Expr::Range { sheet, start_col, start_row, end_col, end_row, start_col_abs, start_row_abs, end_col_abs, end_row_abs } => {
            let sr = if *start_row_abs { Some(*start_row) } else { offset(*start_row, d_row, MAX_ROWS) };
            let er = if *end_row_abs { Some(*end_row) } else { offset(*end_row, d_row, MAX_ROWS) };
            let sc = if *start_col_abs { Some(*start_col) } else { offset(*start_col, d_col, MAX_COLS) };
            let ec = if *end_col_abs { Some(*end_col) } else { offset(*end_col, d_col, MAX_COLS) };
            let (Some(sr), Some(er), Some(sc), Some(ec)) = (sr, er, sc, ec) else {
                return Expr::Error(CellError::Ref);
            };
            // Mixed anchors can cross over; keep start top-left
            let (start_row, start_row_abs, end_row, end_row_abs) =
                if sr <= er { (sr, *start_row_abs, er, *end_row_abs) } else { (er, *end_row_abs, sr, *start_row_abs) };
            let (start_col, start_col_abs, end_col, end_col_abs) =
                if sc <= ec { (sc, *start_col_abs, ec, *end_col_abs) } else { (ec, *end_col_abs, sc, *start_col_abs) };
            Expr::Range {
                sheet: sheet.clone(),
                start_col,
                start_row,
                end_col,
                end_row,
                start_col_abs,
                start_row_abs,
                end_col_abs,
                end_row_abs,
            }
        }
        _ => map_children(expr, |child| relocate_expr(child, d_row, d_col)),
    }
}

/// Replace every reference into a removed sheet with `#REF!`.
pub fn invalidate_sheet(expr: &BoundExpr, removed: SheetId) -> BoundExpr {
    match expr {
        Expr::CellRef { sheet: SheetRef::Id(id), .. } | Expr::Range { sheet: SheetRef::Id(id), .. }
            if *id == removed =>
        {
            Expr::Error(CellError::Ref)
        }
        Expr::CellRef { .. } | Expr::Range { .. } => expr.clone(),
        _ => map_children(expr, |child| invalidate_sheet(child, removed)),
    }
}

/// Rebuild composite nodes with `f` applied to each child; leaves are cloned.
fn map_children<F>(expr: &BoundExpr, f: F) -> BoundExpr
where
    F: Fn(&BoundExpr) -> BoundExpr,
{
    match expr {
        Expr::Function { name, args } => Expr::Function {
            name: name.clone(),
            args: args.iter().map(&f).collect(),
        },
        Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
            op: *op,
            left: Box::new(f(left)),
            right: Box::new(f(right)),
        },
        Expr::UnaryOp { op, operand } => Expr::UnaryOp { op: *op, operand: Box::new(f(operand)) },
        _ => expr.clone(),
    }
}
