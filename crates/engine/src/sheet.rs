use std::collections::{BTreeMap, BTreeSet};

use cellbook_config::DateSystem;
use cellbook_core::CellRange;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::cell::{Cell, CellValue};
use crate::conditional::{ConditionalFormat, ConditionalRule};
use crate::drawing::{Chart, Image, ImageFormat, ImageId, Anchor};
use crate::error::{EngineError, Result};
use crate::formula::adjust::{Axis, StructuralEdit};
use crate::formula::value::Value;
use crate::layout::{remap_keys, Outline, Pane, PrintSetup};
use crate::number_format::format_value;
use crate::protection::SheetProtection;
use crate::style::{Color, StylePool};

/// Stable sheet identity. Ids are never reused within a workbook, so a
/// formula bound to a deleted sheet can never silently point at a new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SheetId(u64);

impl SheetId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Sheet reference inside a bound formula
#[derive(Debug, Clone, PartialEq)]
pub enum SheetRef {
    /// The sheet the formula lives on
    Current,
    Id(SheetId),
    /// Named sheet that does not exist; evaluates to #REF!
    RefError { last_known_name: String },
}

/// Sheet reference as written in formula text
#[derive(Debug, Clone, PartialEq)]
pub enum UnboundSheetRef {
    Current,
    Named(String),
}

/// Default column width in characters and row height in points
pub const DEFAULT_COL_WIDTH: f64 = 8.43;
pub const DEFAULT_ROW_HEIGHT: f64 = 15.0;

static EMPTY_VALUE: CellValue = CellValue::Empty;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sheet {
    id: SheetId,
    name: String,
    #[serde(with = "cells_serde")]
    cells: FxHashMap<(usize, usize), Cell>,
    #[serde(default)]
    merges: Vec<CellRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pane: Option<Pane>,
    #[serde(default)]
    row_heights: BTreeMap<usize, f64>,
    #[serde(default)]
    col_widths: BTreeMap<usize, f64>,
    #[serde(default)]
    hidden_rows: BTreeSet<usize>,
    #[serde(default)]
    hidden_cols: BTreeSet<usize>,
    #[serde(default)]
    row_outline: Outline,
    #[serde(default)]
    col_outline: Outline,
    #[serde(default)]
    print: PrintSetup,
    #[serde(default)]
    conditional_formats: Vec<ConditionalFormat>,
    #[serde(default)]
    images: Vec<Image>,
    #[serde(default)]
    next_image_id: u32,
    #[serde(default)]
    charts: Vec<Chart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    protection: Option<SheetProtection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_color: Option<Color>,
    #[serde(default)]
    pub hidden: bool,
}

impl Sheet {
    pub fn new(id: SheetId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            cells: FxHashMap::default(),
            merges: Vec::new(),
            pane: None,
            row_heights: BTreeMap::new(),
            col_widths: BTreeMap::new(),
            hidden_rows: BTreeSet::new(),
            hidden_cols: BTreeSet::new(),
            row_outline: Outline::default(),
            col_outline: Outline::default(),
            print: PrintSetup::default(),
            conditional_formats: Vec::new(),
            images: Vec::new(),
            next_image_id: 0,
            charts: Vec::new(),
            protection: None,
            tab_color: None,
            hidden: false,
        }
    }

    pub fn id(&self) -> SheetId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub(crate) fn set_id(&mut self, id: SheetId) {
        self.id = id;
    }

    // =========================================================================
    // Grid
    // =========================================================================

    pub fn cell(&self, row: usize, col: usize) -> Option<&Cell> {
        self.cells.get(&(row, col))
    }

    pub(crate) fn cell_mut(&mut self, row: usize, col: usize) -> Option<&mut Cell> {
        self.cells.get_mut(&(row, col))
    }

    /// Get the cell, creating an empty unstyled one if absent.
    pub fn cell_mut_or_create(&mut self, row: usize, col: usize) -> &mut Cell {
        self.cells.entry((row, col)).or_default()
    }

    /// Stored content of a cell (`Empty` when absent)
    pub fn value(&self, row: usize, col: usize) -> &CellValue {
        self.cells.get(&(row, col)).map_or(&EMPTY_VALUE, |c| &c.value)
    }

    /// Value as formulas see it: literals, or the cached formula result.
    pub fn computed_value(&self, row: usize, col: usize, date_system: DateSystem) -> Value {
        self.cells
            .get(&(row, col))
            .map_or(Value::Empty, |c| c.computed_value(date_system))
    }

    pub(crate) fn put_cell(&mut self, row: usize, col: usize, cell: Cell) {
        if cell.is_blank() {
            self.cells.remove(&(row, col));
        } else {
            self.cells.insert((row, col), cell);
        }
    }

    pub(crate) fn take_cell(&mut self, row: usize, col: usize) -> Option<Cell> {
        self.cells.remove(&(row, col))
    }

    /// Drop the cell if it no longer carries anything
    pub(crate) fn prune(&mut self, row: usize, col: usize) {
        if self.cells.get(&(row, col)).is_some_and(Cell::is_blank) {
            self.cells.remove(&(row, col));
        }
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Bounding box of all stored cells
    pub fn used_range(&self) -> Option<CellRange> {
        let mut keys = self.cells.keys();
        let &(r, c) = keys.next()?;
        let (mut min_r, mut max_r, mut min_c, mut max_c) = (r, r, c, c);
        for &(r, c) in keys {
            min_r = min_r.min(r);
            max_r = max_r.max(r);
            min_c = min_c.min(c);
            max_c = max_c.max(c);
        }
        Some(CellRange::from_coords(min_r, min_c, max_r, max_c))
    }

    /// (rows, cols) covering every stored cell from A1
    pub fn extent(&self) -> (usize, usize) {
        self.cells
            .keys()
            .fold((0, 0), |(rows, cols), &(r, c)| (rows.max(r + 1), cols.max(c + 1)))
    }

    /// Cells in row-major order
    pub fn iter_cells(&self) -> Vec<((usize, usize), &Cell)> {
        let mut cells: Vec<_> = self.cells.iter().map(|(k, v)| (*k, v)).collect();
        cells.sort_by_key(|(k, _)| *k);
        cells
    }

    pub(crate) fn cells_unordered(&self) -> impl Iterator<Item = (&(usize, usize), &Cell)> {
        self.cells.iter()
    }

    pub(crate) fn cells_unordered_mut(&mut self) -> impl Iterator<Item = (&(usize, usize), &mut Cell)> {
        self.cells.iter_mut()
    }

    /// Formatted text of a cell under its own style
    pub fn display_text(&self, row: usize, col: usize, styles: &StylePool, date_system: DateSystem) -> String {
        let Some(cell) = self.cells.get(&(row, col)) else {
            return String::new();
        };
        let style = styles.get(cell.style);
        let value = cell.computed_value(date_system);
        match &cell.value {
            CellValue::Date(dt) if style.number_format == "General" => {
                if dt.time() == chrono::NaiveTime::MIN {
                    dt.format("%Y-%m-%d").to_string()
                } else {
                    dt.format("%Y-%m-%d %H:%M:%S").to_string()
                }
            }
            _ => format_value(&value, &style.number_format, date_system),
        }
    }

    // =========================================================================
    // Merged regions
    // =========================================================================

    /// Merge a rectangular region. Fails if it is a single cell or
    /// overlaps an existing merge; nothing changes on failure.
    pub fn merge(&mut self, range: CellRange) -> Result<()> {
        let range = CellRange::from_coords(range.start.row, range.start.col, range.end.row, range.end.col);
        if range.is_single_cell() {
            return Err(EngineError::Precondition(format!(
                "Cannot merge a single cell ({})",
                range
            )));
        }
        if let Some(existing) = self.merges.iter().find(|m| m.overlaps(&range)) {
            return Err(EngineError::MergeOverlap {
                existing: existing.to_string(),
                requested: range.to_string(),
            });
        }
        self.merges.push(range);
        Ok(())
    }

    /// Remove an existing merge; the range must match it exactly.
    pub fn unmerge(&mut self, range: &CellRange) -> Result<()> {
        let pos = self
            .merges
            .iter()
            .position(|m| m.start.row == range.start.row
                && m.start.col == range.start.col
                && m.end.row == range.end.row
                && m.end.col == range.end.col)
            .ok_or_else(|| EngineError::Precondition(format!("No merged region at {}", range)))?;
        self.merges.remove(pos);
        Ok(())
    }

    pub fn merged_regions(&self) -> &[CellRange] {
        &self.merges
    }

    pub fn merge_at(&self, row: usize, col: usize) -> Option<&CellRange> {
        self.merges.iter().find(|m| m.contains(row, col))
    }

    pub(crate) fn remove_merges_within(&mut self, area: &CellRange) {
        self.merges.retain(|m| !(area.contains(m.start.row, m.start.col) && area.contains(m.end.row, m.end.col)));
    }

    // =========================================================================
    // Panes
    // =========================================================================

    pub fn pane(&self) -> Option<&Pane> {
        self.pane.as_ref()
    }

    /// Freeze the first `cols` columns and `rows` rows. `(0, 0)` removes the freeze.
    pub fn freeze_panes(&mut self, cols: usize, rows: usize) {
        self.pane = (cols > 0 || rows > 0).then(|| Pane::frozen(cols, rows));
    }

    /// Freeze with the scrollable area starting at (`top_row`, `left_col`).
    pub fn freeze_panes_scrolled(&mut self, cols: usize, rows: usize, left_col: usize, top_row: usize) {
        self.pane = Some(Pane::Frozen {
            cols,
            rows,
            left_col: left_col.max(cols),
            top_row: top_row.max(rows),
        });
    }

    /// Split the window at `x`/`y` points from the top-left corner.
    pub fn split_panes(&mut self, x: f64, y: f64) {
        self.pane = Some(Pane::Split { x: x.max(0.0), y: y.max(0.0), left_col: 0, top_row: 0 });
    }

    pub fn remove_pane(&mut self) {
        self.pane = None;
    }

    pub fn set_pane(&mut self, pane: Option<Pane>) {
        self.pane = pane;
    }

    // =========================================================================
    // Row / column layout
    // =========================================================================

    pub fn set_row_height(&mut self, row: usize, height: f64) {
        self.row_heights.insert(row, height.max(0.0));
    }

    pub fn row_height(&self, row: usize) -> Option<f64> {
        self.row_heights.get(&row).copied()
    }

    pub fn row_heights(&self) -> &BTreeMap<usize, f64> {
        &self.row_heights
    }

    pub fn set_col_width(&mut self, col: usize, width: f64) {
        self.col_widths.insert(col, width.max(0.0));
    }

    pub fn col_width(&self, col: usize) -> Option<f64> {
        self.col_widths.get(&col).copied()
    }

    pub fn col_widths(&self) -> &BTreeMap<usize, f64> {
        &self.col_widths
    }

    pub fn set_row_hidden(&mut self, row: usize, hidden: bool) {
        if hidden {
            self.hidden_rows.insert(row);
        } else {
            self.hidden_rows.remove(&row);
        }
    }

    pub fn is_row_hidden(&self, row: usize) -> bool {
        self.hidden_rows.contains(&row)
    }

    pub fn hidden_rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.hidden_rows.iter().copied()
    }

    pub fn set_col_hidden(&mut self, col: usize, hidden: bool) {
        if hidden {
            self.hidden_cols.insert(col);
        } else {
            self.hidden_cols.remove(&col);
        }
    }

    pub fn is_col_hidden(&self, col: usize) -> bool {
        self.hidden_cols.contains(&col)
    }

    pub fn hidden_cols(&self) -> impl Iterator<Item = usize> + '_ {
        self.hidden_cols.iter().copied()
    }

    /// Fit a column to its widest displayed value. Merged cells are skipped;
    /// a column with no content falls back to the default width.
    pub fn autosize_col(&mut self, col: usize, styles: &StylePool, date_system: DateSystem) {
        let widest = self
            .cells
            .iter()
            .filter(|((r, c), cell)| *c == col && !cell.value.is_empty() && self.merge_at(*r, *c).is_none())
            .map(|((r, c), cell)| {
                let size = styles.get(cell.style).font.size.into_inner();
                let chars = self
                    .display_text(*r, *c, styles, date_system)
                    .lines()
                    .map(|l| l.chars().count())
                    .max()
                    .unwrap_or(0);
                chars as f64 * size / 11.0
            })
            .fold(None, |acc: Option<f64>, w| Some(acc.map_or(w, |a| a.max(w))));
        match widest {
            Some(chars) => {
                let width = (chars + 1.0).max(DEFAULT_COL_WIDTH).min(255.0);
                self.col_widths.insert(col, (width * 100.0).round() / 100.0);
            }
            None => {
                self.col_widths.remove(&col);
            }
        }
    }

    /// Fit a row to its tallest font and line count.
    pub fn autosize_row(&mut self, row: usize, styles: &StylePool, date_system: DateSystem) {
        let tallest = self
            .cells
            .iter()
            .filter(|((r, c), cell)| *r == row && !cell.value.is_empty() && self.merge_at(*r, *c).is_none())
            .map(|((r, c), cell)| {
                let style = styles.get(cell.style);
                let lines = if style.alignment.wrap_text {
                    self.display_text(*r, *c, styles, date_system).lines().count().max(1)
                } else {
                    1
                };
                style.font.size.into_inner() * 1.36 * lines as f64
            })
            .fold(None, |acc: Option<f64>, h| Some(acc.map_or(h, |a| a.max(h))));
        match tallest {
            Some(h) => {
                self.row_heights.insert(row, h.max(DEFAULT_ROW_HEIGHT).round());
            }
            None => {
                self.row_heights.remove(&row);
            }
        }
    }

    // =========================================================================
    // Outline groups
    // =========================================================================

    pub fn group_rows(&mut self, first: usize, last: usize) -> Result<()> {
        let (first, last) = (first.min(last), first.max(last));
        if !self.row_outline.group(first, last) {
            return Err(EngineError::Precondition("Outline is already at the deepest level".into()));
        }
        Ok(())
    }

    pub fn ungroup_rows(&mut self, first: usize, last: usize) {
        self.row_outline.ungroup(first.min(last), first.max(last));
    }

    pub fn group_cols(&mut self, first: usize, last: usize) -> Result<()> {
        let (first, last) = (first.min(last), first.max(last));
        if !self.col_outline.group(first, last) {
            return Err(EngineError::Precondition("Outline is already at the deepest level".into()));
        }
        Ok(())
    }

    pub fn ungroup_cols(&mut self, first: usize, last: usize) {
        self.col_outline.ungroup(first.min(last), first.max(last));
    }

    pub fn row_outline(&self) -> &Outline {
        &self.row_outline
    }

    pub fn col_outline(&self) -> &Outline {
        &self.col_outline
    }

    /// Restore a row's outline level as read from a file (clamped to the deepest level)
    pub fn set_row_outline_level(&mut self, row: usize, level: u8) {
        self.row_outline.set_level(row, level);
    }

    pub fn set_col_outline_level(&mut self, col: usize, level: u8) {
        self.col_outline.set_level(col, level);
    }

    // =========================================================================
    // Print setup
    // =========================================================================

    pub fn print_setup(&self) -> &PrintSetup {
        &self.print
    }

    pub fn print_setup_mut(&mut self) -> &mut PrintSetup {
        &mut self.print
    }

    pub fn set_print_area(&mut self, range: &str) -> Result<()> {
        let range = CellRange::parse(range)?;
        self.print.print_area = Some(CellRange::from_coords(
            range.start.row,
            range.start.col,
            range.end.row,
            range.end.col,
        ));
        Ok(())
    }

    // =========================================================================
    // Conditional formatting
    // =========================================================================

    pub fn add_conditional_format(&mut self, range: CellRange, rules: Vec<ConditionalRule>) -> Result<()> {
        if rules.is_empty() {
            return Err(EngineError::Precondition("Conditional format needs at least one rule".into()));
        }
        if let Some(rule) = rules.iter().find(|r| r.operands.len() < r.comparison.arity()) {
            return Err(EngineError::Precondition(format!(
                "{:?} needs {} operand(s)",
                rule.comparison,
                rule.comparison.arity()
            )));
        }
        self.conditional_formats.push(ConditionalFormat::new(range, rules));
        Ok(())
    }

    pub fn conditional_formats(&self) -> &[ConditionalFormat] {
        &self.conditional_formats
    }

    /// Remove formats whose target intersects `range`; returns how many went.
    pub fn remove_conditional_formats(&mut self, range: &CellRange) -> usize {
        let before = self.conditional_formats.len();
        self.conditional_formats.retain(|cf| !cf.range.overlaps(range));
        before - self.conditional_formats.len()
    }

    // =========================================================================
    // Drawings
    // =========================================================================

    pub fn insert_image(&mut self, data: Vec<u8>, anchor: Anchor) -> Result<ImageId> {
        let format = ImageFormat::sniff(&data)
            .ok_or_else(|| EngineError::Precondition("Unsupported image format".into()))?;
        let id = ImageId(self.next_image_id);
        self.next_image_id += 1;
        self.images.push(Image { id, format, data, anchor, description: None });
        Ok(id)
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn set_image_description(&mut self, id: ImageId, description: Option<String>) -> bool {
        match self.images.iter_mut().find(|img| img.id == id) {
            Some(img) => {
                img.description = description;
                true
            }
            None => false,
        }
    }

    pub fn remove_image(&mut self, id: ImageId) -> bool {
        let before = self.images.len();
        self.images.retain(|img| img.id != id);
        before != self.images.len()
    }

    /// Add a chart; returns its index
    pub fn add_chart(&mut self, chart: Chart) -> usize {
        self.charts.push(chart);
        self.charts.len() - 1
    }

    pub fn charts(&self) -> &[Chart] {
        &self.charts
    }

    pub(crate) fn charts_mut(&mut self) -> &mut Vec<Chart> {
        &mut self.charts
    }

    pub fn remove_chart(&mut self, index: usize) -> Option<Chart> {
        (index < self.charts.len()).then(|| self.charts.remove(index))
    }

    // =========================================================================
    // Protection
    // =========================================================================

    /// Protect the worksheet. The password hash is recorded for export.
    pub fn protect(&mut self, password: Option<&str>) {
        self.protection = Some(SheetProtection::with_password(password));
    }

    /// Remove worksheet protection. No password is required.
    pub fn unprotect(&mut self) {
        self.protection = None;
    }

    pub fn is_protected(&self) -> bool {
        self.protection.is_some()
    }

    pub fn protection(&self) -> Option<&SheetProtection> {
        self.protection.as_ref()
    }

    pub fn set_protection(&mut self, protection: Option<SheetProtection>) {
        self.protection = protection;
    }

    // =========================================================================
    // Structural edits
    // =========================================================================

    /// Move cells and sheet-local layout for an edit on this sheet.
    /// Formula text is rewritten by the workbook.
    pub(crate) fn apply_structural(&mut self, edit: &StructuralEdit) {
        let cells = std::mem::take(&mut self.cells);
        self.cells = cells
            .into_iter()
            .filter_map(|((r, c), cell)| edit.map_cell(r, c).map(|pos| (pos, cell)))
            .collect();

        self.merges = self
            .merges
            .iter()
            .filter_map(|m| edit.map_rect(m))
            .filter(|m| !m.is_single_cell())
            .collect();

        match edit.axis() {
            Axis::Row => {
                self.row_heights = remap_keys(std::mem::take(&mut self.row_heights), |i| edit.map_index(i));
                self.hidden_rows = self.hidden_rows.iter().filter_map(|i| edit.map_index(*i)).collect();
                self.row_outline.remap(edit);
            }
            Axis::Col => {
                self.col_widths = remap_keys(std::mem::take(&mut self.col_widths), |i| edit.map_index(i));
                self.hidden_cols = self.hidden_cols.iter().filter_map(|i| edit.map_index(*i)).collect();
                self.col_outline.remap(edit);
            }
        }

        self.conditional_formats = std::mem::take(&mut self.conditional_formats)
            .into_iter()
            .filter_map(|mut cf| {
                cf.range = edit.map_rect(&cf.range)?;
                Some(cf)
            })
            .collect();

        self.print.apply_edit(edit);

        for image in &mut self.images {
            image.anchor.apply_edit(edit);
        }
        for chart in &mut self.charts {
            chart.anchor.apply_edit(edit);
        }
    }
}

/// Cells are stored as a sorted `(row, col, cell)` list.
mod cells_serde {
    use rustc_hash::FxHashMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::cell::Cell;

    pub fn serialize<S>(cells: &FxHashMap<(usize, usize), Cell>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut list: Vec<(usize, usize, &Cell)> = cells.iter().map(|(&(r, c), cell)| (r, c, cell)).collect();
        list.sort_by_key(|(r, c, _)| (*r, *c));
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<FxHashMap<(usize, usize), Cell>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let list: Vec<(usize, usize, Cell)> = Vec::deserialize(deserializer)?;
        Ok(list.into_iter().map(|(r, c, cell)| ((r, c), cell)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellValue;
    use crate::conditional::{Comparison, StyleOverride};

    fn sheet() -> Sheet {
        Sheet::new(SheetId::from_raw(1), "Sheet1")
    }

    fn range(s: &str) -> CellRange {
        CellRange::parse(s).unwrap()
    }

    #[test]
    fn test_get_or_create_and_used_range() {
        let mut s = sheet();
        assert!(s.used_range().is_none());
        s.cell_mut_or_create(3, 1).value = CellValue::Number(1.0);
        s.cell_mut_or_create(1, 4).value = CellValue::Text("x".into());
        assert_eq!(s.used_range().unwrap().to_string(), "B2:E4");
        assert_eq!(s.extent(), (4, 5));
        assert!(s.value(9, 9).is_empty());
    }

    #[test]
    fn test_iter_cells_is_row_major() {
        let mut s = sheet();
        s.cell_mut_or_create(2, 0).value = CellValue::Number(3.0);
        s.cell_mut_or_create(0, 1).value = CellValue::Number(2.0);
        s.cell_mut_or_create(0, 0).value = CellValue::Number(1.0);
        let order: Vec<_> = s.iter_cells().into_iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (2, 0)]);
    }

    #[test]
    fn test_non_overlapping_merges_then_overlap_fails() {
        let mut s = sheet();
        s.merge(range("A1:B2")).unwrap();
        s.merge(range("D1:E3")).unwrap();
        let err = s.merge(range("B2:D2")).unwrap_err();
        assert!(matches!(err, EngineError::MergeOverlap { .. }));
        assert_eq!(s.merged_regions().len(), 2);
    }

    #[test]
    fn test_single_cell_merge_rejected() {
        let mut s = sheet();
        assert!(matches!(s.merge(range("C3")), Err(EngineError::Precondition(_))));
    }

    #[test]
    fn test_unmerge_requires_exact_region() {
        let mut s = sheet();
        s.merge(range("A1:C3")).unwrap();
        assert!(s.unmerge(&range("A1:B2")).is_err());
        assert_eq!(s.merge_at(1, 1).map(|r| r.to_string()), Some("A1:C3".into()));
        s.unmerge(&range("A1:C3")).unwrap();
        assert!(s.merge_at(1, 1).is_none());
    }

    #[test]
    fn test_panes() {
        let mut s = sheet();
        s.freeze_panes(1, 2);
        assert_eq!(s.pane(), Some(&Pane::Frozen { cols: 1, rows: 2, left_col: 1, top_row: 2 }));
        s.freeze_panes_scrolled(1, 1, 5, 10);
        assert_eq!(s.pane(), Some(&Pane::Frozen { cols: 1, rows: 1, left_col: 5, top_row: 10 }));
        s.split_panes(120.0, 40.0);
        assert!(matches!(s.pane(), Some(Pane::Split { .. })));
        s.remove_pane();
        assert!(s.pane().is_none());
    }

    #[test]
    fn test_autosize_col_uses_display_text() {
        let styles = StylePool::new();
        let mut s = sheet();
        s.cell_mut_or_create(0, 0).value = CellValue::Text("a fairly long piece of text".into());
        s.cell_mut_or_create(1, 0).value = CellValue::Number(1.0);
        s.autosize_col(0, &styles, DateSystem::Excel1900);
        let width = s.col_width(0).unwrap();
        assert!(width > 25.0 && width < 30.0, "width = {width}");

        s.autosize_col(7, &styles, DateSystem::Excel1900);
        assert!(s.col_width(7).is_none());
    }

    #[test]
    fn test_autosize_skips_merged_cells() {
        let styles = StylePool::new();
        let mut s = sheet();
        s.cell_mut_or_create(0, 0).value = CellValue::Text("x".repeat(60));
        s.merge(range("A1:D1")).unwrap();
        s.autosize_col(0, &styles, DateSystem::Excel1900);
        assert!(s.col_width(0).is_none());
    }

    #[test]
    fn test_structural_shift_moves_layout() {
        let mut s = sheet();
        s.cell_mut_or_create(4, 0).value = CellValue::Number(5.0);
        s.set_row_height(4, 30.0);
        s.set_row_hidden(6, true);
        s.merge(range("A5:B6")).unwrap();
        s.add_conditional_format(
            range("A1:A10"),
            vec![ConditionalRule::new(Comparison::GreaterThan, vec![1.0.into()], StyleOverride::default())],
        )
        .unwrap();

        s.apply_structural(&StructuralEdit::InsertRows { sheet: s.id(), at: 2, count: 3 });
        assert_eq!(s.value(7, 0), &CellValue::Number(5.0));
        assert_eq!(s.row_height(7), Some(30.0));
        assert!(s.is_row_hidden(9));
        assert_eq!(s.merged_regions()[0].to_string(), "A8:B9");
        assert_eq!(s.conditional_formats()[0].range.to_string(), "A1:A13");

        s.apply_structural(&StructuralEdit::DeleteRows { sheet: s.id(), at: 7, count: 1 });
        assert!(s.value(7, 0).is_empty());
        assert_eq!(s.merged_regions()[0].to_string(), "A8:B8");

        // A merge shrunk to one cell is no longer a merge
        s.apply_structural(&StructuralEdit::DeleteCols { sheet: s.id(), at: 1, count: 1 });
        assert!(s.merged_regions().is_empty());
    }

    #[test]
    fn test_protection_policy() {
        let mut s = sheet();
        s.protect(Some("pw"));
        assert!(s.is_protected());
        assert!(s.protection().unwrap().password_hash.is_some());
        s.unprotect();
        assert!(!s.is_protected());
    }

    #[test]
    fn test_images() {
        let mut s = sheet();
        let png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        let id = s.insert_image(png, Anchor::at(0, 0, 64, 64)).unwrap();
        assert_eq!(s.images()[0].format, ImageFormat::Png);
        assert!(s.insert_image(b"nope".to_vec(), Anchor::at(0, 0, 1, 1)).is_err());
        assert!(s.remove_image(id));
        assert!(s.images().is_empty());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut s = sheet();
        s.cell_mut_or_create(0, 0).value = CellValue::Number(1.5);
        s.set_col_width(2, 20.0);
        let json = serde_json::to_string(&s).unwrap();
        let back: Sheet = serde_json::from_str(&json).unwrap();
        assert_eq!(back.value(0, 0), &CellValue::Number(1.5));
        assert_eq!(back.col_width(2), Some(20.0));
        assert_eq!(back.name(), "Sheet1");
    }
}
