//! Sheet layout state: panes, outline groups and print setup.

use std::collections::BTreeMap;

use cellbook_core::CellRange;
use serde::{Deserialize, Serialize};

use crate::formula::adjust::{Axis, StructuralEdit};

/// Deepest outline level supported by file formats
pub const MAX_OUTLINE_LEVEL: u8 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pane {
    /// Rows above `rows` and columns left of `cols` stay fixed while scrolling;
    /// the scrollable area starts at (`top_row`, `left_col`).
    Frozen {
        cols: usize,
        rows: usize,
        left_col: usize,
        top_row: usize,
    },
    /// Independent panes split at the given offsets (in points).
    Split {
        x: f64,
        y: f64,
        left_col: usize,
        top_row: usize,
    },
}

impl Pane {
    pub fn frozen(cols: usize, rows: usize) -> Self {
        Pane::Frozen { cols, rows, left_col: cols, top_row: rows }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaperSize {
    #[default]
    Letter,
    Tabloid,
    Legal,
    Executive,
    A3,
    A4,
    A5,
    B4,
    B5,
}

impl PaperSize {
    /// Paper index used by spreadsheet file formats
    pub fn code(self) -> u8 {
        match self {
            PaperSize::Letter => 1,
            PaperSize::Tabloid => 3,
            PaperSize::Legal => 5,
            PaperSize::Executive => 7,
            PaperSize::A3 => 8,
            PaperSize::A4 => 9,
            PaperSize::A5 => 11,
            PaperSize::B4 => 12,
            PaperSize::B5 => 13,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        [
            PaperSize::Letter,
            PaperSize::Tabloid,
            PaperSize::Legal,
            PaperSize::Executive,
            PaperSize::A3,
            PaperSize::A4,
            PaperSize::A5,
            PaperSize::B4,
            PaperSize::B5,
        ]
        .into_iter()
        .find(|p| p.code() == code)
    }
}

/// Page margins in inches
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Margins {
    pub left: f64,
    pub right: f64,
    pub top: f64,
    pub bottom: f64,
    pub header: f64,
    pub footer: f64,
}

impl Default for Margins {
    fn default() -> Self {
        Self { left: 0.7, right: 0.7, top: 0.75, bottom: 0.75, header: 0.3, footer: 0.3 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderFooter {
    pub left: String,
    pub center: String,
    pub right: String,
}

impl HeaderFooter {
    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.center.is_empty() && self.right.is_empty()
    }

    /// Combined `&L..&C..&R..` code string
    pub fn to_code(&self) -> String {
        let mut out = String::new();
        if !self.left.is_empty() {
            out.push_str("&L");
            out.push_str(&self.left);
        }
        if !self.center.is_empty() {
            out.push_str("&C");
            out.push_str(&self.center);
        }
        if !self.right.is_empty() {
            out.push_str("&R");
            out.push_str(&self.right);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintSetup {
    pub orientation: Orientation,
    pub paper: PaperSize,
    /// Fit to (pages wide, pages tall); overrides `scale`
    pub fit_to: Option<(u16, u16)>,
    /// Percent, 10..=400
    pub scale: u16,
    pub margins: Margins,
    pub header: HeaderFooter,
    pub footer: HeaderFooter,
    pub print_area: Option<CellRange>,
    /// Rows repeated at the top of each page (inclusive)
    pub repeat_rows: Option<(usize, usize)>,
    /// Columns repeated at the left of each page (inclusive)
    pub repeat_cols: Option<(usize, usize)>,
    /// Manual page breaks before these rows
    pub row_breaks: Vec<usize>,
    /// Manual page breaks before these columns
    pub col_breaks: Vec<usize>,
    pub black_and_white: bool,
    pub gridlines: bool,
}

impl Default for PrintSetup {
    fn default() -> Self {
        Self {
            orientation: Orientation::Portrait,
            paper: PaperSize::Letter,
            fit_to: None,
            scale: 100,
            margins: Margins::default(),
            header: HeaderFooter::default(),
            footer: HeaderFooter::default(),
            print_area: None,
            repeat_rows: None,
            repeat_cols: None,
            row_breaks: Vec::new(),
            col_breaks: Vec::new(),
            black_and_white: false,
            gridlines: false,
        }
    }
}

impl PrintSetup {
    pub fn is_default(&self) -> bool {
        *self == PrintSetup::default()
    }

    pub(crate) fn apply_edit(&mut self, edit: &StructuralEdit) {
        if let Some(area) = &self.print_area {
            self.print_area = edit.map_rect(area);
        }
        let (repeat, breaks) = match edit.axis() {
            Axis::Row => (&mut self.repeat_rows, &mut self.row_breaks),
            Axis::Col => (&mut self.repeat_cols, &mut self.col_breaks),
        };
        if let Some((first, last)) = *repeat {
            *repeat = edit.map_span(first, last);
        }
        *breaks = breaks.iter().filter_map(|b| edit.map_index(*b)).collect();
    }
}

/// Outline levels per row or column; absent = level 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outline {
    levels: BTreeMap<usize, u8>,
}

impl Outline {
    pub fn level(&self, idx: usize) -> u8 {
        self.levels.get(&idx).copied().unwrap_or(0)
    }

    /// Increase the level of `first..=last`; returns false when any index
    /// is already at the deepest level.
    pub fn group(&mut self, first: usize, last: usize) -> bool {
        if (first..=last).any(|i| self.level(i) >= MAX_OUTLINE_LEVEL) {
            return false;
        }
        for i in first..=last {
            *self.levels.entry(i).or_insert(0) += 1;
        }
        true
    }

    pub fn ungroup(&mut self, first: usize, last: usize) {
        for i in first..=last {
            if let Some(level) = self.levels.get_mut(&i) {
                *level -= 1;
                if *level == 0 {
                    self.levels.remove(&i);
                }
            }
        }
    }

    pub fn set_level(&mut self, idx: usize, level: u8) {
        match level.min(MAX_OUTLINE_LEVEL) {
            0 => {
                self.levels.remove(&idx);
            }
            level => {
                self.levels.insert(idx, level);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, u8)> + '_ {
        self.levels.iter().map(|(i, l)| (*i, *l))
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub(crate) fn remap(&mut self, edit: &StructuralEdit) {
        self.levels = remap_keys(std::mem::take(&mut self.levels), |i| edit.map_index(i));
    }
}

/// Rebuild an index-keyed map through a position mapping, dropping deleted keys.
pub(crate) fn remap_keys<V>(map: BTreeMap<usize, V>, f: impl Fn(usize) -> Option<usize>) -> BTreeMap<usize, V> {
    map.into_iter().filter_map(|(k, v)| f(k).map(|k| (k, v))).collect()
}
