//! Interned cell styles.
//!
//! A `Style` is an immutable value. Cells hold a `StyleId` into the
//! workbook's `StylePool`; editing a cell's style interns a modified copy
//! and repoints that cell, so other cells sharing the old record are
//! unaffected.

use std::fmt;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// 24-bit RGB colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color(u32);

impl Color {
    pub const BLACK: Color = Color(0x000000);
    pub const WHITE: Color = Color(0xFFFFFF);
    pub const RED: Color = Color(0xFF0000);
    pub const GREEN: Color = Color(0x00B050);
    pub const YELLOW: Color = Color(0xFFFF00);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Color(((r as u32) << 16) | ((g as u32) << 8) | b as u32)
    }

    pub const fn from_u32(rgb: u32) -> Self {
        Color(rgb & 0xFF_FFFF)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    /// Parse `#RRGGBB`, `RRGGBB` or `AARRGGBB` (alpha ignored).
    pub fn parse(s: &str) -> Option<Self> {
        let hex = s.trim().trim_start_matches('#');
        let hex = match hex.len() {
            6 => hex,
            8 => &hex[2..],
            _ => return None,
        };
        u32::from_str_radix(hex, 16).ok().map(Color)
    }

    /// `#RRGGBB`
    pub fn to_hex(self) -> String {
        format!("#{:06X}", self.0)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for Color {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Color::parse(&s).ok_or_else(|| format!("invalid colour: {}", s))
    }
}

impl From<Color> for String {
    fn from(c: Color) -> Self {
        c.to_hex()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Underline {
    #[default]
    None,
    Single,
    Double,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Font {
    pub name: String,
    pub size: OrderedFloat<f64>,
    pub bold: bool,
    pub italic: bool,
    pub underline: Underline,
    pub strikethrough: bool,
    pub color: Option<Color>,
}

impl Default for Font {
    fn default() -> Self {
        Self {
            name: "Calibri".to_string(),
            size: OrderedFloat(11.0),
            bold: false,
            italic: false,
            underline: Underline::None,
            strikethrough: false,
            color: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FillPattern {
    #[default]
    None,
    Solid,
    Gray50,
    Gray25,
    Gray125,
    HorizontalStripe,
    VerticalStripe,
    DiagonalStripe,
    DiagonalCrosshatch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Fill {
    pub pattern: FillPattern,
    pub fg_color: Option<Color>,
    pub bg_color: Option<Color>,
}

impl Fill {
    pub fn solid(color: Color) -> Self {
        Self { pattern: FillPattern::Solid, fg_color: Some(color), bg_color: None }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BorderStyle {
    #[default]
    None,
    Thin,
    Medium,
    Thick,
    Dashed,
    Dotted,
    Double,
    Hair,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Border {
    pub style: BorderStyle,
    pub color: Option<Color>,
}

impl Border {
    pub fn thin() -> Self {
        Self { style: BorderStyle::Thin, color: None }
    }

    pub fn is_none(&self) -> bool {
        self.style == BorderStyle::None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagonalDirection {
    #[default]
    None,
    Up,
    Down,
    Both,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Borders {
    pub left: Border,
    pub right: Border,
    pub top: Border,
    pub bottom: Border,
    pub diagonal: Border,
    pub diagonal_direction: DiagonalDirection,
}

impl Borders {
    /// Same border on all four outer edges
    pub fn all(border: Border) -> Self {
        Self { left: border, right: border, top: border, bottom: border, ..Default::default() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HAlign {
    #[default]
    General,
    Left,
    Center,
    Right,
    Fill,
    Justify,
    CenterAcross,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VAlign {
    Top,
    Center,
    #[default]
    Bottom,
    Justify,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Alignment {
    pub horizontal: HAlign,
    pub vertical: VAlign,
    pub wrap_text: bool,
    pub indent: u8,
    /// Text rotation in degrees (-90..=90)
    pub rotation: i16,
}

/// Immutable formatting record shared between cells.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Style {
    pub font: Font,
    pub fill: Fill,
    pub borders: Borders,
    pub alignment: Alignment,
    pub number_format: String,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            font: Font::default(),
            fill: Fill::default(),
            borders: Borders::default(),
            alignment: Alignment::default(),
            number_format: "General".to_string(),
        }
    }
}

impl Style {
    pub fn is_default(&self) -> bool {
        *self == Style::default()
    }
}

/// Index into a `StylePool`. `StyleId::DEFAULT` always exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StyleId(pub u32);

impl StyleId {
    pub const DEFAULT: StyleId = StyleId(0);

    pub fn is_default(&self) -> bool {
        self.0 == 0
    }
}

/// Deduplicating style table. Equal styles always map to the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "Vec<Style>", into = "Vec<Style>")]
pub struct StylePool {
    styles: Vec<Arc<Style>>,
    index: FxHashMap<Arc<Style>, StyleId>,
}

impl Default for StylePool {
    fn default() -> Self {
        let default = Arc::new(Style::default());
        let mut index = FxHashMap::default();
        index.insert(default.clone(), StyleId::DEFAULT);
        Self { styles: vec![default], index }
    }
}

impl StylePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id of an equal style, adding it if unseen.
    pub fn intern(&mut self, style: Style) -> StyleId {
        if let Some(id) = self.index.get(&style) {
            return *id;
        }
        let id = StyleId(self.styles.len() as u32);
        let style = Arc::new(style);
        self.styles.push(style.clone());
        self.index.insert(style, id);
        id
    }

    /// Unknown ids resolve to the default style.
    pub fn get(&self, id: StyleId) -> &Style {
        self.styles
            .get(id.0 as usize)
            .unwrap_or(&self.styles[0])
    }

    /// Shared handle to a style record
    pub fn get_arc(&self, id: StyleId) -> Arc<Style> {
        self.styles
            .get(id.0 as usize)
            .unwrap_or(&self.styles[0])
            .clone()
    }

    /// Copy-on-write edit: clone `base`, apply `edit`, intern the result.
    pub fn derive<F>(&mut self, base: StyleId, edit: F) -> StyleId
    where
        F: FnOnce(&mut Style),
    {
        let mut style = self.get(base).clone();
        edit(&mut style);
        self.intern(style)
    }

    pub fn contains(&self, id: StyleId) -> bool {
        (id.0 as usize) < self.styles.len()
    }

    pub fn len(&self) -> usize {
        self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = (StyleId, &Style)> + '_ {
        self.styles
            .iter()
            .enumerate()
            .map(|(i, s)| (StyleId(i as u32), s.as_ref()))
    }
}

impl From<Vec<Style>> for StylePool {
    fn from(styles: Vec<Style>) -> Self {
        // Ids are positional: keep every entry even if duplicated so that
        // references in a loaded document stay valid.
        let mut pool = StylePool::default();
        for (i, style) in styles.into_iter().enumerate() {
            if i == 0 {
                continue;
            }
            let style = Arc::new(style);
            let id = StyleId(pool.styles.len() as u32);
            pool.index.entry(style.clone()).or_insert(id);
            pool.styles.push(style);
        }
        pool
    }
}

impl From<StylePool> for Vec<Style> {
    fn from(pool: StylePool) -> Self {
        pool.styles.iter().map(|s| s.as_ref().clone()).collect()
    }
}

/// Builtin number formats addressed by their conventional numeric ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinFormat {
    General,
    Integer,
    Decimal2,
    Thousands,
    Thousands2,
    Currency0,
    Currency2,
    Percent,
    Percent2,
    Scientific,
    Fraction,
    Date,
    DayMonthYear,
    DayMonth,
    MonthYear,
    Time12,
    Time12Seconds,
    Time24,
    Time24Seconds,
    DateTime,
    Accounting0,
    Accounting2,
    Text,
}

impl BuiltinFormat {
    pub fn id(self) -> u16 {
        match self {
            BuiltinFormat::General => 0,
            BuiltinFormat::Integer => 1,
            BuiltinFormat::Decimal2 => 2,
            BuiltinFormat::Thousands => 3,
            BuiltinFormat::Thousands2 => 4,
            BuiltinFormat::Currency0 => 5,
            BuiltinFormat::Currency2 => 7,
            BuiltinFormat::Percent => 9,
            BuiltinFormat::Percent2 => 10,
            BuiltinFormat::Scientific => 11,
            BuiltinFormat::Fraction => 12,
            BuiltinFormat::Date => 14,
            BuiltinFormat::DayMonthYear => 15,
            BuiltinFormat::DayMonth => 16,
            BuiltinFormat::MonthYear => 17,
            BuiltinFormat::Time12 => 18,
            BuiltinFormat::Time12Seconds => 19,
            BuiltinFormat::Time24 => 20,
            BuiltinFormat::Time24Seconds => 21,
            BuiltinFormat::DateTime => 22,
            BuiltinFormat::Accounting0 => 37,
            BuiltinFormat::Accounting2 => 39,
            BuiltinFormat::Text => 49,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            BuiltinFormat::General => "General",
            BuiltinFormat::Integer => "0",
            BuiltinFormat::Decimal2 => "0.00",
            BuiltinFormat::Thousands => "#,##0",
            BuiltinFormat::Thousands2 => "#,##0.00",
            BuiltinFormat::Currency0 => "$#,##0_);($#,##0)",
            BuiltinFormat::Currency2 => "$#,##0.00_);($#,##0.00)",
            BuiltinFormat::Percent => "0%",
            BuiltinFormat::Percent2 => "0.00%",
            BuiltinFormat::Scientific => "0.00E+00",
            BuiltinFormat::Fraction => "# ?/?",
            BuiltinFormat::Date => "m/d/yyyy",
            BuiltinFormat::DayMonthYear => "d-mmm-yy",
            BuiltinFormat::DayMonth => "d-mmm",
            BuiltinFormat::MonthYear => "mmm-yy",
            BuiltinFormat::Time12 => "h:mm AM/PM",
            BuiltinFormat::Time12Seconds => "h:mm:ss AM/PM",
            BuiltinFormat::Time24 => "h:mm",
            BuiltinFormat::Time24Seconds => "h:mm:ss",
            BuiltinFormat::DateTime => "m/d/yyyy h:mm",
            BuiltinFormat::Accounting0 => "#,##0_);(#,##0)",
            BuiltinFormat::Accounting2 => "#,##0.00_);(#,##0.00)",
            BuiltinFormat::Text => "@",
        }
    }

    const ALL: [BuiltinFormat; 23] = [
        BuiltinFormat::General,
        BuiltinFormat::Integer,
        BuiltinFormat::Decimal2,
        BuiltinFormat::Thousands,
        BuiltinFormat::Thousands2,
        BuiltinFormat::Currency0,
        BuiltinFormat::Currency2,
        BuiltinFormat::Percent,
        BuiltinFormat::Percent2,
        BuiltinFormat::Scientific,
        BuiltinFormat::Fraction,
        BuiltinFormat::Date,
        BuiltinFormat::DayMonthYear,
        BuiltinFormat::DayMonth,
        BuiltinFormat::MonthYear,
        BuiltinFormat::Time12,
        BuiltinFormat::Time12Seconds,
        BuiltinFormat::Time24,
        BuiltinFormat::Time24Seconds,
        BuiltinFormat::DateTime,
        BuiltinFormat::Accounting0,
        BuiltinFormat::Accounting2,
        BuiltinFormat::Text,
    ];

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.id() == id)
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.code() == code)
    }
}

/// Format code for a builtin number format id.
pub fn builtin_number_format(id: u16) -> Option<&'static str> {
    BuiltinFormat::from_id(id).map(BuiltinFormat::code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bold() -> Style {
        let mut s = Style::default();
        s.font.bold = true;
        s
    }

    #[test]
    fn test_default_style_is_id_zero() {
        let mut pool = StylePool::new();
        assert_eq!(pool.intern(Style::default()), StyleId::DEFAULT);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_intern_dedups_equal_styles() {
        let mut pool = StylePool::new();
        let a = pool.intern(bold());
        let b = pool.intern(bold());
        assert_eq!(a, b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_derive_leaves_source_untouched() {
        let mut pool = StylePool::new();
        let base = pool.intern(bold());
        let italic = pool.derive(base, |s| s.font.italic = true);
        assert_ne!(base, italic);
        assert!(!pool.get(base).font.italic);
        assert!(pool.get(italic).font.bold && pool.get(italic).font.italic);

        // Deriving back to an existing shape reuses it
        let again = pool.derive(italic, |s| s.font.italic = false);
        assert_eq!(again, base);
    }

    #[test]
    fn test_unknown_id_falls_back_to_default() {
        let pool = StylePool::new();
        assert!(pool.get(StyleId(42)).is_default());
    }

    #[test]
    fn test_pool_serde_keeps_ids() {
        let mut pool = StylePool::new();
        let id = pool.intern(bold());
        let json = serde_json::to_string(&pool).unwrap();
        let back: StylePool = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 2);
        assert!(back.get(id).font.bold);
    }

    #[test]
    fn test_color_parse() {
        assert_eq!(Color::parse("#FF0000"), Some(Color::RED));
        assert_eq!(Color::parse("ff0000"), Some(Color::RED));
        assert_eq!(Color::parse("FFFF0000"), Some(Color::RED));
        assert_eq!(Color::parse("red"), None);
        assert_eq!(Color::rgb(0, 0xB0, 0x50), Color::GREEN);
        assert_eq!(Color::GREEN.to_hex(), "#00B050");
    }

    #[test]
    fn test_builtin_formats() {
        assert_eq!(builtin_number_format(10), Some("0.00%"));
        assert_eq!(builtin_number_format(0), Some("General"));
        assert_eq!(builtin_number_format(300), None);
        assert_eq!(BuiltinFormat::from_code("#,##0"), Some(BuiltinFormat::Thousands));
    }
}
