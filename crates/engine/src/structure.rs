//! Structural edits, block copy and sorting.
//!
//! Every operation here moves cells around and must keep formulas pointing
//! at the same data: references are rewritten with `shift_expr` (row/column
//! insertion and deletion) or `relocate_expr` (copy and sort).

use std::cmp::Ordering;

use cellbook_core::CellRange;
use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::cell::{Cell, CellValue};
use crate::cell_id::CellId;
use crate::error::{EngineError, Result};
use crate::formula::adjust::{relocate_expr, shift_expr, Axis, StructuralEdit};
use crate::formula::parser::{format_expr, Expr};
use crate::formula::value::Value;
use crate::recalc::EvalState;
use crate::sheet::SheetId;
use crate::workbook::{stored_positions, Workbook};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl Workbook {
    pub fn insert_rows(&mut self, sheet: usize, at: usize, count: usize) -> Result<()> {
        let id = self.sheet_checked(sheet)?.id();
        self.apply_structural_edit(StructuralEdit::InsertRows { sheet: id, at, count })
    }

    pub fn delete_rows(&mut self, sheet: usize, at: usize, count: usize) -> Result<()> {
        let id = self.sheet_checked(sheet)?.id();
        self.apply_structural_edit(StructuralEdit::DeleteRows { sheet: id, at, count })
    }

    pub fn insert_cols(&mut self, sheet: usize, at: usize, count: usize) -> Result<()> {
        let id = self.sheet_checked(sheet)?.id();
        self.apply_structural_edit(StructuralEdit::InsertCols { sheet: id, at, count })
    }

    pub fn delete_cols(&mut self, sheet: usize, at: usize, count: usize) -> Result<()> {
        let id = self.sheet_checked(sheet)?.id();
        self.apply_structural_edit(StructuralEdit::DeleteCols { sheet: id, at, count })
    }

    /// Move cells on the edited sheet, rewrite formulas on every sheet,
    /// shift names, tables and charts, then recalculate everything.
    fn apply_structural_edit(&mut self, edit: StructuralEdit) -> Result<()> {
        let (at, count) = match edit {
            StructuralEdit::InsertRows { at, count, .. }
            | StructuralEdit::DeleteRows { at, count, .. }
            | StructuralEdit::InsertCols { at, count, .. }
            | StructuralEdit::DeleteCols { at, count, .. } => (at, count),
        };
        if count == 0 {
            return Ok(());
        }
        let edited = self
            .sheet_by_id(edit.sheet())
            .ok_or_else(|| EngineError::SheetNotFound(format!("id {}", edit.sheet().raw())))?;
        let (rows, cols) = edited.extent();
        let limits = self.config.limits;
        match edit.axis() {
            Axis::Row => {
                if at >= limits.max_rows {
                    return Err(EngineError::OutOfBounds { row: at, col: 0 });
                }
                if edit.is_insert() && rows > at && rows + count > limits.max_rows {
                    return Err(EngineError::OutOfBounds { row: rows - 1 + count, col: 0 });
                }
            }
            Axis::Col => {
                if at >= limits.max_cols {
                    return Err(EngineError::OutOfBounds { row: 0, col: at });
                }
                if edit.is_insert() && cols > at && cols + count > limits.max_cols {
                    return Err(EngineError::OutOfBounds { row: 0, col: cols - 1 + count });
                }
            }
        }
        let edited_name = edited.name().to_string();

        let names: FxHashMap<SheetId, String> = self.sheets.iter().map(|s| (s.id(), s.name().to_string())).collect();
        let mut rewritten = 0usize;
        for sheet in &mut self.sheets {
            let sheet_id = sheet.id();
            for (_, cell) in sheet.cells_unordered_mut() {
                if let CellValue::Formula(f) = &mut cell.value {
                    if let Some(expr) = &f.expr {
                        let shifted = shift_expr(expr, sheet_id, &edit);
                        if shifted != *expr {
                            f.source = format_expr(&shifted, |id| names.get(&id).cloned());
                            f.expr = Some(shifted);
                            rewritten += 1;
                        }
                    }
                }
            }
        }

        for sheet in &mut self.sheets {
            let own = sheet.id() == edit.sheet();
            if own {
                sheet.apply_structural(&edit);
            }
            for chart in sheet.charts_mut() {
                chart.apply_edit(&edit, |r| match &r.sheet {
                    None => own,
                    Some(name) => name.eq_ignore_ascii_case(&edited_name),
                });
            }
        }

        for dropped in self.names.apply_edit(&edit) {
            warn!("name '{}' removed: its target was deleted", dropped.name);
        }
        self.tables.retain_mut(|t| {
            let keep = t.apply_edit(&edit);
            if !keep {
                warn!("table '{}' removed: its range was deleted", t.name);
            }
            keep
        });

        debug!("{:?} on '{}': {} formulas rewritten", edit, edited_name, rewritten);
        self.structure_changed();
        Ok(())
    }

    /// Copy a block of cells. Values, styles, comments and links are
    /// duplicated; formulas are relocated by the copy offset. Merges lying
    /// inside the source block are copied; merges inside the destination
    /// block are replaced, and a merge straddling its edge fails the copy
    /// before anything changes.
    pub fn copy_range(
        &mut self,
        src_sheet: usize,
        src_range: &CellRange,
        dst_sheet: usize,
        dst_row: usize,
        dst_col: usize,
    ) -> Result<()> {
        let src = self.sheet_checked(src_sheet)?;
        let dst_id = self.sheet_checked(dst_sheet)?.id();

        let (rows, cols) = (src_range.rows(), src_range.cols());
        let last_row = dst_row + rows - 1;
        let last_col = dst_col + cols - 1;
        self.check_bounds(last_row, last_col)?;
        let dest = CellRange::from_coords(dst_row, dst_col, last_row, last_col);

        let d_row = dst_row as isize - src_range.start.row as isize;
        let d_col = dst_col as isize - src_range.start.col as isize;

        let block: Vec<((usize, usize), Cell)> = stored_positions(src, src_range)
            .into_iter()
            .filter_map(|(r, c)| src.cell(r, c).map(|cell| ((r, c), cell.clone())))
            .collect();
        let merges: Vec<CellRange> = src
            .merged_regions()
            .iter()
            .filter(|m| within(src_range, m))
            .map(|m| {
                CellRange::from_coords(
                    offset(m.start.row, d_row),
                    offset(m.start.col, d_col),
                    offset(m.end.row, d_row),
                    offset(m.end.col, d_col),
                )
            })
            .collect();

        if let Some(m) = self.sheets[dst_sheet]
            .merged_regions()
            .iter()
            .find(|m| m.overlaps(&dest) && !within(&dest, m))
        {
            return Err(EngineError::MergeOverlap { existing: m.to_string(), requested: dest.to_string() });
        }

        let names: FxHashMap<SheetId, String> = self.sheets.iter().map(|s| (s.id(), s.name().to_string())).collect();
        let ws = &mut self.sheets[dst_sheet];
        ws.remove_merges_within(&dest);
        let cleared = stored_positions(ws, &dest);
        for &(r, c) in &cleared {
            ws.take_cell(r, c);
        }

        let mut changed: Vec<CellId> = cleared.iter().map(|&(r, c)| CellId::new(dst_id, r, c)).collect();
        for ((r, c), mut cell) in block {
            if let CellValue::Formula(f) = &mut cell.value {
                if let Some(expr) = &f.expr {
                    let moved = relocate_expr(expr, d_row, d_col);
                    f.source = format_expr(&moved, |id| names.get(&id).cloned());
                    f.expr = Some(moved);
                }
            }
            cell.cached = Value::Empty;
            cell.state = EvalState::Unevaluated;
            let (row, col) = (offset(r, d_row), offset(c, d_col));
            ws.put_cell(row, col, cell);
            changed.push(CellId::new(dst_id, row, col));
        }
        for m in merges {
            ws.merge(m)?;
        }

        changed.sort();
        changed.dedup();
        self.cells_changed(&changed);
        Ok(())
    }

    /// Stable sort of the rows of `range` by the values in column `col`
    /// (absolute index). Numbers sort before text, text before booleans,
    /// and blanks always come last. Formulas move with their rows.
    pub fn sort_range_by_column(&mut self, sheet: usize, range: &CellRange, col: usize, order: SortOrder) -> Result<()> {
        let ws = self.sheet_checked(sheet)?;
        let sheet_id = ws.id();
        if col < range.start.col || col > range.end.col {
            return Err(EngineError::Precondition(format!("Sort column is outside {}", range)));
        }
        if ws.merged_regions().iter().any(|m| m.overlaps(range)) {
            return Err(EngineError::Precondition("Cannot sort a range containing merged cells".into()));
        }

        let (rows, cols) = ws.extent();
        if rows <= range.start.row || cols <= range.start.col {
            return Ok(());
        }
        let last_row = range.end.row.min(rows - 1);
        let last_col = range.end.col.min(cols - 1);
        let span = CellRange::from_coords(range.start.row, range.start.col, last_row, last_col);

        let date_system = self.config.date_system;
        let mut keyed: Vec<(usize, Value)> = (span.start.row..=span.end.row)
            .map(|r| (r, ws.computed_value(r, col, date_system)))
            .collect();
        keyed.sort_by(|(_, a), (_, b)| compare_for_sort(a, b, order));
        if keyed.iter().enumerate().all(|(i, (r, _))| *r == span.start.row + i) {
            return Ok(());
        }

        let names: FxHashMap<SheetId, String> = self.sheets.iter().map(|s| (s.id(), s.name().to_string())).collect();
        let ws = &mut self.sheets[sheet];
        let positions = stored_positions(ws, &span);
        let mut taken: FxHashMap<(usize, usize), Cell> = FxHashMap::default();
        for &(r, c) in &positions {
            if let Some(cell) = ws.take_cell(r, c) {
                taken.insert((r, c), cell);
            }
        }

        let mut changed: Vec<CellId> = positions.iter().map(|&(r, c)| CellId::new(sheet_id, r, c)).collect();
        for (i, (old_row, _)) in keyed.iter().enumerate() {
            let new_row = span.start.row + i;
            let d_row = new_row as isize - *old_row as isize;
            for c in span.start.col..=span.end.col {
                let Some(mut cell) = taken.remove(&(*old_row, c)) else { continue };
                if d_row != 0 {
                    if let CellValue::Formula(f) = &mut cell.value {
                        if let Some(expr) = &f.expr {
                            let moved = relocate_expr(expr, d_row, 0);
                            f.source = format_expr(&moved, |id| names.get(&id).cloned());
                            f.expr = Some(moved);
                        }
                    }
                }
                ws.put_cell(new_row, c, cell);
                changed.push(CellId::new(sheet_id, new_row, c));
            }
        }

        changed.sort();
        changed.dedup();
        self.cells_changed(&changed);
        Ok(())
    }

    // =========================================================================
    // Range helpers
    // =========================================================================

    pub fn range_sum(&self, sheet: usize, range: &CellRange) -> Result<Value> {
        self.aggregate(sheet, range, "SUM")
    }

    pub fn range_avg(&self, sheet: usize, range: &CellRange) -> Result<Value> {
        self.aggregate(sheet, range, "AVERAGE")
    }

    pub fn range_min(&self, sheet: usize, range: &CellRange) -> Result<Value> {
        self.aggregate(sheet, range, "MIN")
    }

    pub fn range_max(&self, sheet: usize, range: &CellRange) -> Result<Value> {
        self.aggregate(sheet, range, "MAX")
    }

    pub fn range_count(&self, sheet: usize, range: &CellRange) -> Result<Value> {
        self.aggregate(sheet, range, "COUNT")
    }

    fn aggregate(&self, sheet: usize, range: &CellRange, function: &str) -> Result<Value> {
        let id = self.sheet_checked(sheet)?.id();
        let expr = Expr::Function { name: function.to_string(), args: vec![Workbook::range_expr(range)] };
        Ok(self.evaluate_on(id, &expr))
    }

    /// Shrink a range to the bounding box of its non-empty cells, dropping
    /// empty edge rows and columns. None when the range holds nothing.
    pub fn trim_range(&self, sheet: usize, range: &CellRange) -> Result<Option<CellRange>> {
        let ws = self.sheet_checked(sheet)?;
        let mut bounds: Option<(usize, usize, usize, usize)> = None;
        for (r, c) in stored_positions(ws, range) {
            if ws.cell(r, c).is_some_and(|cell| cell.value.is_empty()) {
                continue;
            }
            bounds = Some(match bounds {
                None => (r, c, r, c),
                Some((r0, c0, r1, c1)) => (r0.min(r), c0.min(c), r1.max(r), c1.max(c)),
            });
        }
        Ok(bounds.map(|(r0, c0, r1, c1)| CellRange::from_coords(r0, c0, r1, c1)))
    }
}

fn within(outer: &CellRange, inner: &CellRange) -> bool {
    outer.contains(inner.start.row, inner.start.col) && outer.contains(inner.end.row, inner.end.col)
}

/// Destination bounds were checked, so moved coordinates stay on the grid.
fn offset(index: usize, delta: isize) -> usize {
    (index as isize + delta).max(0) as usize
}

fn sort_rank(value: &Value) -> u8 {
    match value {
        Value::Number(_) => 0,
        Value::Text(_) => 1,
        Value::Boolean(_) => 2,
        Value::Error(_) => 3,
        Value::Empty => 4,
    }
}

fn compare_for_sort(a: &Value, b: &Value, order: SortOrder) -> Ordering {
    let (ra, rb) = (sort_rank(a), sort_rank(b));
    if a.is_empty() || b.is_empty() {
        return ra.cmp(&rb);
    }
    let ord = match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Text(x), Value::Text(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        _ => ra.cmp(&rb),
    };
    match order {
        SortOrder::Ascending => ord,
        SortOrder::Descending => ord.reverse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drawing::{Anchor, Chart, ChartKind, ChartSeries};
    use crate::formula::value::CellError;
    use crate::named_range::NameScope;
    use cellbook_config::EngineConfig;

    fn range(s: &str) -> CellRange {
        CellRange::parse(s).unwrap()
    }

    fn text_of(wb: &Workbook, addr: &str) -> String {
        wb.value_at(addr).unwrap().to_text()
    }

    #[test]
    fn test_insert_row_above_sum() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "1").unwrap();
        wb.set_value_at("A2", "2").unwrap();
        wb.set_value_at("A3", "3").unwrap();
        wb.set_value_at("B1", "=SUM(A1:A3)").unwrap();
        assert_eq!(wb.value_at("B1").unwrap(), Value::Number(6.0));

        wb.insert_rows(0, 0, 1).unwrap();
        assert_eq!(wb.formula_text(0, 1, 1).as_deref(), Some("=SUM(A2:A4)"));
        assert_eq!(wb.value_at("B2").unwrap(), Value::Number(6.0));
        assert_eq!(wb.value_at("B1").unwrap(), Value::Empty);
    }

    #[test]
    fn test_insert_inside_range_grows_it() {
        let mut wb = Workbook::new();
        for (i, v) in ["1", "2", "3"].iter().enumerate() {
            wb.set_value(0, i, 0, v).unwrap();
        }
        wb.set_value_at("C1", "=SUM(A1:A3)").unwrap();
        wb.insert_rows(0, 1, 2).unwrap();
        assert_eq!(wb.formula_text(0, 0, 2).as_deref(), Some("=SUM(A1:A5)"));
        wb.set_value_at("A2", "10").unwrap();
        assert_eq!(wb.value_at("C1").unwrap(), Value::Number(16.0));
    }

    #[test]
    fn test_insert_then_delete_restores() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "1").unwrap();
        wb.set_value_at("A2", "2").unwrap();
        wb.set_value_at("A5", "x").unwrap();
        wb.set_value_at("B1", "=A1+A2").unwrap();
        wb.set_value_at("B5", "=SUM($A$1:A5)").unwrap();
        wb.sheet_mut(0).unwrap().merge(range("C4:D5")).unwrap();
        wb.define_name("Top", "Sheet1!A1:A2", NameScope::Workbook).unwrap();

        let before: Vec<_> = wb.sheet(0).unwrap().iter_cells().iter().map(|(p, c)| (*p, c.value.clone())).collect();
        let merges_before = wb.sheet(0).unwrap().merged_regions().to_vec();

        wb.insert_rows(0, 1, 3).unwrap();
        assert_eq!(wb.formula_text(0, 7, 1).as_deref(), Some("=SUM($A$1:A8)"));
        wb.delete_rows(0, 1, 3).unwrap();

        let after: Vec<_> = wb.sheet(0).unwrap().iter_cells().iter().map(|(p, c)| (*p, c.value.clone())).collect();
        assert_eq!(before, after);
        assert_eq!(wb.sheet(0).unwrap().merged_regions(), merges_before.as_slice());
        assert_eq!(wb.find_name("Top").as_deref(), Some("Sheet1!$A$1:$A$2"));
        assert_eq!(wb.value_at("B1").unwrap(), Value::Number(3.0));
        assert_eq!(wb.value_at("B5").unwrap(), Value::Number(3.0));
    }

    #[test]
    fn test_insert_then_delete_cols_restores() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "4").unwrap();
        wb.set_value_at("C1", "=A1*2").unwrap();
        let before = wb.formula_text(0, 0, 2);
        wb.insert_cols(0, 1, 2).unwrap();
        assert_eq!(wb.formula_text(0, 0, 4).as_deref(), Some("=A1*2"));
        wb.delete_cols(0, 1, 2).unwrap();
        assert_eq!(wb.formula_text(0, 0, 2), before);
        assert_eq!(wb.value_at("C1").unwrap(), Value::Number(8.0));
    }

    #[test]
    fn test_delete_referenced_row_gives_ref_error() {
        let mut wb = Workbook::new();
        wb.set_value_at("A2", "5").unwrap();
        wb.set_value_at("B1", "=A2*2").unwrap();
        wb.set_value_at("C1", "=SUM(A1:A3)").unwrap();
        wb.delete_rows(0, 1, 1).unwrap();

        assert_eq!(wb.formula_text(0, 0, 1).as_deref(), Some("=#REF!*2"));
        assert_eq!(wb.value_at("B1").unwrap(), Value::Error(CellError::Ref));
        assert_eq!(wb.formula_text(0, 0, 2).as_deref(), Some("=SUM(A1:A2)"));
        assert_eq!(wb.value_at("C1").unwrap(), Value::Number(0.0));
    }

    #[test]
    fn test_structural_edit_rewrites_other_sheets() {
        let mut wb = Workbook::new();
        wb.add_sheet("Data").unwrap();
        wb.set_value(1, 4, 0, "9").unwrap();
        wb.set_value(0, 0, 0, "=Data!A5").unwrap();
        wb.set_value(0, 0, 1, "=A5").unwrap();

        wb.insert_rows(1, 0, 2).unwrap();
        assert_eq!(wb.formula_text(0, 0, 0).as_deref(), Some("=Data!A7"));
        assert_eq!(wb.formula_text(0, 0, 1).as_deref(), Some("=A5"));
        assert_eq!(text_of(&wb, "A1"), "9");
    }

    #[test]
    fn test_insert_beyond_limits_fails() {
        let mut config = EngineConfig::default();
        config.limits.max_rows = 10;
        let mut wb = Workbook::with_config(config);
        wb.set_value(0, 8, 0, "x").unwrap();
        assert!(matches!(wb.insert_rows(0, 0, 2), Err(EngineError::OutOfBounds { .. })));
        wb.insert_rows(0, 0, 1).unwrap();
        assert_eq!(text_of(&wb, "A10"), "x");
    }

    #[test]
    fn test_structural_edit_moves_names_tables_charts() {
        let mut wb = Workbook::new();
        wb.define_name("Gone", "B2", NameScope::Workbook).unwrap();
        wb.add_named_table(0, "T", range("A4:B6")).unwrap();
        let mut chart = Chart::new(ChartKind::Line, Anchor::at(0, 4, 300, 200));
        chart.add_series(ChartSeries::new(range("B4:B6")));
        wb.sheet_mut(0).unwrap().add_chart(chart);

        wb.delete_rows(0, 1, 1).unwrap();
        assert!(wb.find_name("Gone").is_none());
        assert_eq!(wb.named_table("T").unwrap().range.to_string(), "A3:B5");
        assert_eq!(wb.sheet(0).unwrap().charts()[0].series[0].values.to_string(), "B3:B5");
    }

    #[test]
    fn test_copy_relative_and_absolute() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "1").unwrap();
        wb.set_value_at("A2", "2").unwrap();
        wb.set_value_at("B1", "=A1+$A$1").unwrap();

        wb.copy_range(0, &range("B1"), 0, 1, 1).unwrap();
        assert_eq!(wb.formula_text(0, 1, 1).as_deref(), Some("=A2+$A$1"));
        assert_eq!(wb.value_at("B2").unwrap(), Value::Number(3.0));

        wb.copy_range(0, &range("B1"), 0, 0, 3).unwrap();
        assert_eq!(wb.formula_text(0, 0, 3).as_deref(), Some("=C1+$A$1"));
    }

    #[test]
    fn test_copy_off_grid_becomes_ref() {
        let mut wb = Workbook::new();
        wb.set_value_at("B2", "=A1").unwrap();
        wb.copy_range(0, &range("B2"), 0, 0, 0).unwrap();
        assert_eq!(wb.formula_text(0, 0, 0).as_deref(), Some("=#REF!"));
        assert_eq!(wb.value_at("A1").unwrap(), Value::Error(CellError::Ref));
    }

    #[test]
    fn test_copy_keeps_style_and_merges() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "hi").unwrap();
        wb.update_style(0, &range("A1"), |s| s.font.bold = true).unwrap();
        wb.sheet_mut(0).unwrap().merge(range("A1:B1")).unwrap();

        wb.copy_range(0, &range("A1:B2"), 0, 4, 0).unwrap();
        assert_eq!(text_of(&wb, "A5"), "hi");
        assert!(wb.style_of(0, 4, 0).font.bold);
        assert_eq!(wb.sheet(0).unwrap().merged_regions().len(), 2);
        assert_eq!(wb.sheet(0).unwrap().merge_at(4, 1).unwrap().to_string(), "A5:B5");
    }

    #[test]
    fn test_copy_onto_straddling_merge_fails() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "x").unwrap();
        wb.sheet_mut(0).unwrap().merge(range("D1:F1")).unwrap();
        let err = wb.copy_range(0, &range("A1:B1"), 0, 0, 2).unwrap_err();
        assert!(matches!(err, EngineError::MergeOverlap { .. }));
        assert_eq!(wb.value_at("C1").unwrap(), Value::Empty);
    }

    #[test]
    fn test_copy_across_sheets() {
        let mut wb = Workbook::new();
        wb.add_sheet("Dst").unwrap();
        wb.set_value_at("A1", "2").unwrap();
        wb.set_value_at("B1", "=A1*2").unwrap();
        wb.copy_range(0, &range("A1:B1"), 1, 0, 0).unwrap();
        wb.set_value_at("Dst!A1", "10").unwrap();
        assert_eq!(wb.value_at("Dst!B1").unwrap(), Value::Number(20.0));
        assert_eq!(wb.value_at("B1").unwrap(), Value::Number(4.0));
    }

    #[test]
    fn test_sort_mixed_types() {
        let mut wb = Workbook::new();
        for (i, v) in ["b", "3", "", "TRUE", "a", "1"].iter().enumerate() {
            wb.set_value(0, i, 0, v).unwrap();
            wb.set_value(0, i, 1, &i.to_string()).unwrap();
        }
        wb.sort_range_by_column(0, &range("A1:B6"), 0, SortOrder::Ascending).unwrap();
        let col_a: Vec<String> = (0..6).map(|r| wb.value(0, r, 0).to_text()).collect();
        assert_eq!(col_a, vec!["1", "3", "a", "b", "TRUE", ""]);
        let col_b: Vec<String> = (0..6).map(|r| wb.value(0, r, 1).to_text()).collect();
        assert_eq!(col_b, vec!["5", "1", "4", "0", "3", "2"]);

        wb.sort_range_by_column(0, &range("A1:B6"), 0, SortOrder::Descending).unwrap();
        let col_a: Vec<String> = (0..6).map(|r| wb.value(0, r, 0).to_text()).collect();
        assert_eq!(col_a, vec!["TRUE", "b", "a", "3", "1", ""]);
    }

    #[test]
    fn test_sort_moves_formulas_with_rows() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "30").unwrap();
        wb.set_value_at("A2", "10").unwrap();
        wb.set_value_at("B1", "=A1*2").unwrap();
        wb.set_value_at("B2", "=A2*2").unwrap();
        wb.sort_range_by_column(0, &range("A1:B2"), 0, SortOrder::Ascending).unwrap();
        assert_eq!(wb.formula_text(0, 0, 1).as_deref(), Some("=A1*2"));
        assert_eq!(wb.value_at("B1").unwrap(), Value::Number(20.0));
        assert_eq!(wb.value_at("B2").unwrap(), Value::Number(60.0));
    }

    #[test]
    fn test_sort_is_stable() {
        let mut wb = Workbook::new();
        for (i, (k, v)) in [("1", "a"), ("0", "b"), ("1", "c"), ("0", "d")].iter().enumerate() {
            wb.set_value(0, i, 0, k).unwrap();
            wb.set_value(0, i, 1, v).unwrap();
        }
        wb.sort_range_by_column(0, &range("A1:B4"), 0, SortOrder::Ascending).unwrap();
        let col_b: Vec<String> = (0..4).map(|r| wb.value(0, r, 1).to_text()).collect();
        assert_eq!(col_b, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_sort_rejects_merges_and_bad_column() {
        let mut wb = Workbook::new();
        assert!(wb.sort_range_by_column(0, &range("A1:B4"), 3, SortOrder::Ascending).is_err());
        wb.sheet_mut(0).unwrap().merge(range("A2:B2")).unwrap();
        assert!(wb.sort_range_by_column(0, &range("A1:B4"), 0, SortOrder::Ascending).is_err());
    }

    #[test]
    fn test_range_helpers() {
        let mut wb = Workbook::new();
        wb.set_value_at("B2", "4").unwrap();
        wb.set_value_at("B3", "text").unwrap();
        wb.set_value_at("C4", "=2").unwrap();
        let r = range("A1:D5");
        assert_eq!(wb.range_sum(0, &r).unwrap(), Value::Number(6.0));
        assert_eq!(wb.range_avg(0, &r).unwrap(), Value::Number(3.0));
        assert_eq!(wb.range_min(0, &r).unwrap(), Value::Number(2.0));
        assert_eq!(wb.range_max(0, &r).unwrap(), Value::Number(4.0));
        assert_eq!(wb.range_count(0, &r).unwrap(), Value::Number(2.0));
        assert_eq!(wb.trim_range(0, &r).unwrap(), Some(range("B2:C4")));
        assert_eq!(wb.trim_range(0, &range("E1:F9")).unwrap(), None);
    }
}
