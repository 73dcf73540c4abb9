//! Embedded pictures and charts.

use cellbook_core::CellRange;
use serde::{Deserialize, Serialize};

use crate::formula::adjust::StructuralEdit;

/// Top-left placement of a drawing, with pixel offsets and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub row: usize,
    pub col: usize,
    #[serde(default)]
    pub x_offset: u32,
    #[serde(default)]
    pub y_offset: u32,
    pub width: u32,
    pub height: u32,
}

impl Anchor {
    pub fn at(row: usize, col: usize, width: u32, height: u32) -> Self {
        Self { row, col, x_offset: 0, y_offset: 0, width, height }
    }

    /// Drawings move with their anchor cell; an anchor inside a deleted
    /// block snaps to the first surviving row/column.
    pub(crate) fn apply_edit(&mut self, edit: &StructuralEdit) {
        let (row, col) = match edit.map_cell(self.row, self.col) {
            Some(cell) => cell,
            None => (
                edit.map_row(self.row).unwrap_or_else(|| first_surviving(edit)),
                edit.map_col(self.col).unwrap_or_else(|| first_surviving(edit)),
            ),
        };
        self.row = row;
        self.col = col;
    }
}

fn first_surviving(edit: &StructuralEdit) -> usize {
    match *edit {
        StructuralEdit::DeleteRows { at, .. }
        | StructuralEdit::DeleteCols { at, .. }
        | StructuralEdit::InsertRows { at, .. }
        | StructuralEdit::InsertCols { at, .. } => at,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Bmp,
}

impl ImageFormat {
    /// Detect the format from the file signature.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(ImageFormat::Png)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else if bytes.starts_with(b"BM") && bytes.len() > 14 {
            Some(ImageFormat::Bmp)
        } else {
            None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Gif => "gif",
            ImageFormat::Bmp => "bmp",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Bmp => "image/bmp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub format: ImageFormat,
    pub data: Vec<u8>,
    pub anchor: Anchor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChartKind {
    Line,
    #[default]
    Column,
    Bar,
    Pie,
    Scatter,
    Area,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegendPosition {
    #[default]
    Right,
    Left,
    Top,
    Bottom,
    Hidden,
}

/// One data series. Ranges carry a sheet name when they point
/// outside the chart's own sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub values: CellRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<CellRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ChartSeries {
    pub fn new(values: CellRange) -> Self {
        Self { values, categories: None, title: None }
    }

    pub fn with_categories(mut self, categories: CellRange) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chart {
    pub kind: ChartKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub series: Vec<ChartSeries>,
    pub anchor: Anchor,
    #[serde(default)]
    pub legend: LegendPosition,
}

impl Chart {
    pub fn new(kind: ChartKind, anchor: Anchor) -> Self {
        Self { kind, title: None, series: Vec::new(), anchor, legend: LegendPosition::default() }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn add_series(&mut self, series: ChartSeries) -> &mut Self {
        self.series.push(series);
        self
    }

    /// Shift series ranges that point at the edited sheet. A series whose
    /// values are deleted entirely is dropped.
    pub(crate) fn apply_edit(&mut self, edit: &StructuralEdit, points_at_edited: impl Fn(&CellRange) -> bool) {
        self.series.retain_mut(|s| {
            if points_at_edited(&s.values) {
                match edit.map_rect(&s.values) {
                    Some(values) => s.values = values,
                    None => return false,
                }
            }
            if let Some(cats) = &s.categories {
                if points_at_edited(cats) {
                    s.categories = edit.map_rect(cats);
                }
            }
            true
        });
    }
}
