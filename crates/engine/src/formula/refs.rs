//! Reference extraction from formula AST.
//!
//! Extracts the cells a bound expression reads, as `CellId`s, for
//! dependency graph construction.

use rustc_hash::FxHashSet;

use crate::cell_id::CellId;
use crate::sheet::{SheetId, SheetRef};

use super::eval::CellLookup;
use super::parser::{BoundExpr, Expr};

/// Every cell the formula depends on.
///
/// Ranges and named ranges are expanded cell by cell, clamped to the
/// target sheet's used extent: cells beyond it are empty and hold no
/// formulas, so they cannot take part in a cycle. The caller rebuilds the
/// edges when an edit grows an extent. Single cell references are kept
/// even outside the extent. References to missing sheets contribute nothing.
pub fn referenced_cells<L: CellLookup + ?Sized>(expr: &BoundExpr, lookup: &L) -> FxHashSet<CellId> {
    let mut refs = FxHashSet::default();
    collect_refs(expr, lookup, &mut refs);
    refs
}

fn collect_refs<L: CellLookup + ?Sized>(expr: &BoundExpr, lookup: &L, refs: &mut FxHashSet<CellId>) {
    match expr {
        Expr::Number(_) | Expr::Text(_) | Expr::Boolean(_) | Expr::Error(_) | Expr::Empty => {}

        Expr::CellRef { sheet, row, col, .. } => {
            if let Some(sheet_id) = resolve_sheet_ref(sheet, lookup.current_sheet()) {
                refs.insert(CellId::new(sheet_id, *row, *col));
            }
        }

        Expr::Range { sheet, start_row, start_col, end_row, end_col, .. } => {
            if let Some(sheet_id) = resolve_sheet_ref(sheet, lookup.current_sheet()) {
                expand_range(lookup, sheet_id, (*start_row, *start_col), (*end_row, *end_col), refs);
            }
        }

        Expr::NamedRange(name) => {
            if let Some(t) = lookup.resolve_named_range(name) {
                expand_range(lookup, t.sheet, (t.start_row, t.start_col), (t.end_row, t.end_col), refs);
            }
        }

        Expr::Function { args, .. } => {
            for arg in args {
                collect_refs(arg, lookup, refs);
            }
        }

        Expr::BinaryOp { left, right, .. } => {
            collect_refs(left, lookup, refs);
            collect_refs(right, lookup, refs);
        }

        Expr::UnaryOp { operand, .. } => collect_refs(operand, lookup, refs),
    }
}

fn resolve_sheet_ref(sheet_ref: &SheetRef, context_sheet: SheetId) -> Option<SheetId> {
    match sheet_ref {
        SheetRef::Current => Some(context_sheet),
        SheetRef::Id(id) => Some(*id),
        SheetRef::RefError { .. } => None,
    }
}

fn expand_range<L: CellLookup + ?Sized>(
    lookup: &L,
    sheet: SheetId,
    start: (usize, usize),
    end: (usize, usize),
    refs: &mut FxHashSet<CellId>,
) {
    let Some((rows, cols)) = lookup.extent(sheet) else {
        return;
    };
    let last_row = end.0.min(rows.saturating_sub(1));
    let last_col = end.1.min(cols.saturating_sub(1));
    if rows == 0 || cols == 0 || start.0 > last_row || start.1 > last_col {
        return;
    }
    for row in start.0..=last_row {
        for col in start.1..=last_col {
            refs.insert(CellId::new(sheet, row, col));
        }
    }
}

/// True if the formula reads any range or named range, i.e. its edges
/// depend on sheet extents.
pub fn has_range_refs(expr: &BoundExpr) -> bool {
    match expr {
        Expr::Range { start_row, start_col, end_row, end_col, .. } => start_row != end_row || start_col != end_col,
        Expr::NamedRange(_) => true,
        Expr::Function { args, .. } => args.iter().any(has_range_refs),
        Expr::BinaryOp { left, right, .. } => has_range_refs(left) || has_range_refs(right),
        Expr::UnaryOp { operand, .. } => has_range_refs(operand),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::super::eval::tests::{TestLookup, OTHER, SHEET};
    use super::super::eval::NamedRangeResolution;
    use super::super::parser::{bind_expr, parse};
    use super::*;

    fn bound(formula: &str) -> BoundExpr {
        let parsed = parse(formula).unwrap();
        bind_expr(&parsed, |name| match name.to_lowercase().as_str() {
            "sheet2" => Some(OTHER),
            _ => None,
        })
    }

    fn lookup_with_extent(rows: usize, cols: usize) -> TestLookup {
        let mut lookup = TestLookup::default();
        lookup.set(SHEET, rows - 1, cols - 1, 0.0);
        lookup.set(OTHER, rows - 1, cols - 1, 0.0);
        lookup
    }

    fn sorted(set: FxHashSet<CellId>) -> Vec<CellId> {
        let mut v: Vec<_> = set.into_iter().collect();
        v.sort();
        v
    }

    #[test]
    fn test_single_refs() {
        let lookup = lookup_with_extent(1, 1);
        let refs = sorted(referenced_cells(&bound("=A1+Sheet2!B3+Z100"), &lookup));
        assert_eq!(
            refs,
            vec![CellId::new(SHEET, 0, 0), CellId::new(SHEET, 99, 25), CellId::new(OTHER, 2, 1)]
        );
    }

    #[test]
    fn test_range_clamped_to_extent() {
        let lookup = lookup_with_extent(3, 2);
        let refs = referenced_cells(&bound("=SUM(A:A)"), &lookup);
        assert_eq!(refs.len(), 3);
        let refs = referenced_cells(&bound("=SUM(A1:C10)"), &lookup);
        assert_eq!(refs.len(), 6);
        assert!(referenced_cells(&bound("=SUM(D5:E9)"), &lookup).is_empty());
    }

    #[test]
    fn test_deleted_sheet_contributes_nothing() {
        let lookup = lookup_with_extent(2, 2);
        assert!(referenced_cells(&bound("=Gone!A1+1"), &lookup).is_empty());
    }

    #[test]
    fn test_named_range_expanded() {
        let mut lookup = lookup_with_extent(5, 5);
        lookup.names.insert(
            "DATA".into(),
            NamedRangeResolution { sheet: OTHER, start_row: 0, start_col: 0, end_row: 1, end_col: 1 },
        );
        let refs = referenced_cells(&bound("=SUM(Data)*2"), &lookup);
        assert_eq!(refs.len(), 4);
        assert!(refs.iter().all(|c| c.sheet == OTHER));
    }

    #[test]
    fn test_has_range_refs() {
        assert!(has_range_refs(&bound("=1+SUM(A1:A3)")));
        assert!(has_range_refs(&bound("=Data")));
        assert!(!has_range_refs(&bound("=A1*B2")));
    }
}
