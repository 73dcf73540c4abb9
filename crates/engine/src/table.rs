//! Named tables and the tabular data-set view of a sheet.
//!
//! A `NamedTable` is a styled, named block of cells living on a sheet.
//! A `DataTable` is a detached, typed copy of a sheet's contents used to
//! hand data to callers and to build sheets from rows (`to_table` /
//! `add_sheet_from_table` on the workbook).

use cellbook_core::CellRange;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::cell::CellValue;
use crate::formula::adjust::StructuralEdit;
use crate::formula::value::{CellError, Value};
use crate::sheet::SheetId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTable {
    pub name: String,
    pub sheet: SheetId,
    /// Whole table including the header row (no sheet qualifier)
    pub range: CellRange,
    #[serde(default = "default_true")]
    pub header_row: bool,
    #[serde(default = "default_true")]
    pub show_filter: bool,
    /// Built-in table style name, e.g. "TableStyleMedium9"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

fn default_true() -> bool {
    true
}

impl NamedTable {
    pub fn new(name: impl Into<String>, sheet: SheetId, range: CellRange) -> Self {
        let mut range = range;
        range.sheet = None;
        Self { name: name.into(), sheet, range, header_row: true, show_filter: true, style: None }
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    /// Data rows exclude the header
    pub fn data_rows(&self) -> usize {
        self.range.rows().saturating_sub(usize::from(self.header_row))
    }

    /// Shift for an edit on its sheet; false when the table was deleted.
    pub(crate) fn apply_edit(&mut self, edit: &StructuralEdit) -> bool {
        if self.sheet != edit.sheet() {
            return true;
        }
        match edit.map_rect(&self.range) {
            Some(range) => {
                self.range = range;
                true
            }
            None => false,
        }
    }
}

/// Inferred type of a data-set column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    /// No non-empty values
    Empty,
    Number,
    Text,
    Boolean,
    Date,
    Error,
    /// More than one kind of value
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

/// A single value of a data set. Formula cells contribute their results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum TableValue {
    #[default]
    Empty,
    Number(f64),
    Text(String),
    Boolean(bool),
    Date(NaiveDateTime),
    Error(CellError),
}

impl TableValue {
    pub fn kind(&self) -> ColumnKind {
        match self {
            TableValue::Empty => ColumnKind::Empty,
            TableValue::Number(_) => ColumnKind::Number,
            TableValue::Text(_) => ColumnKind::Text,
            TableValue::Boolean(_) => ColumnKind::Boolean,
            TableValue::Date(_) => ColumnKind::Date,
            TableValue::Error(_) => ColumnKind::Error,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, TableValue::Empty)
    }

    /// Cell content for writing the value back into a sheet
    pub fn to_cell_value(&self) -> CellValue {
        match self {
            TableValue::Empty => CellValue::Empty,
            TableValue::Number(n) => CellValue::Number(*n),
            TableValue::Text(s) => CellValue::Text(s.clone()),
            TableValue::Boolean(b) => CellValue::Boolean(*b),
            TableValue::Date(dt) => CellValue::Date(*dt),
            // Re-evaluates to the same error
            TableValue::Error(e) => CellValue::Formula(crate::cell::Formula::new(e.code())),
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            TableValue::Empty => String::new(),
            TableValue::Number(n) => crate::formula::value::format_general(*n),
            TableValue::Text(s) => s.clone(),
            TableValue::Boolean(b) => if *b { "TRUE".into() } else { "FALSE".into() },
            TableValue::Date(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            TableValue::Error(e) => e.code().to_string(),
        }
    }
}

impl From<Value> for TableValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Empty => TableValue::Empty,
            Value::Number(n) => TableValue::Number(n),
            Value::Text(s) => TableValue::Text(s),
            Value::Boolean(b) => TableValue::Boolean(b),
            Value::Error(e) => TableValue::Error(e),
        }
    }
}

impl From<f64> for TableValue {
    fn from(n: f64) -> Self {
        TableValue::Number(n)
    }
}

impl From<&str> for TableValue {
    fn from(s: &str) -> Self {
        TableValue::Text(s.to_string())
    }
}

impl From<bool> for TableValue {
    fn from(b: bool) -> Self {
        TableValue::Boolean(b)
    }
}

/// Rows of typed values with named columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    pub name: String,
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<TableValue>>,
}

impl DataTable {
    /// Empty table with the given column names; kinds are inferred as rows arrive.
    pub fn new<S: Into<String>>(name: impl Into<String>, columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            columns: columns
                .into_iter()
                .map(|name| Column { name: name.into(), kind: ColumnKind::Empty })
                .collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row, widening the table if it is longer than the header.
    pub fn push_row(&mut self, row: Vec<TableValue>) {
        while self.columns.len() < row.len() {
            let n = self.columns.len() + 1;
            self.columns.push(Column { name: format!("Column{}", n), kind: ColumnKind::Empty });
        }
        for (column, value) in self.columns.iter_mut().zip(&row) {
            column.kind = merge_kind(column.kind, value.kind());
        }
        self.rows.push(row);
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Values of one column, padding short rows with Empty
    pub fn column_values(&self, index: usize) -> impl Iterator<Item = &TableValue> + '_ {
        const EMPTY: TableValue = TableValue::Empty;
        self.rows.iter().map(move |row| row.get(index).unwrap_or(&EMPTY))
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

pub(crate) fn merge_kind(current: ColumnKind, next: ColumnKind) -> ColumnKind {
    match (current, next) {
        (kind, ColumnKind::Empty) => kind,
        (ColumnKind::Empty, kind) => kind,
        (a, b) if a == b => a,
        _ => ColumnKind::Mixed,
    }
}
