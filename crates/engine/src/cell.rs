use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use cellbook_config::DateSystem;

use crate::formula::parser::{self, BoundExpr};
use crate::formula::value::Value;
use crate::number_format::datetime_to_serial;
use crate::recalc::EvalState;
use crate::style::StyleId;

/// Formula source plus its bound AST.
///
/// `source` is always the canonical text (leading `=`); it is regenerated
/// from the AST after structural edits and sheet renames. The AST is
/// rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formula {
    pub source: String,
    #[serde(skip)]
    pub expr: Option<BoundExpr>,
}

impl Formula {
    /// Unbound formula; the workbook binds it when the cell is stored.
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let source = if source.starts_with('=') { source } else { format!("={}", source) };
        Self { source, expr: None }
    }

    /// Syntax check without binding
    pub fn validate(source: &str) -> Result<(), String> {
        parser::parse(source).map(|_| ())
    }
}

impl PartialEq for Formula {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    #[default]
    Empty,
    Number(f64),
    Text(String),
    Boolean(bool),
    Date(NaiveDateTime),
    Formula(Formula),
}

impl CellValue {
    /// Infer the content type of typed input: formula, boolean, number
    /// (`1,234.5`, `12%`), date or text.
    pub fn infer(input: &str) -> Self {
        let trimmed = input.trim();

        if trimmed.is_empty() {
            return CellValue::Empty;
        }

        if trimmed.starts_with('=') && trimmed.len() > 1 {
            return CellValue::Formula(Formula::new(trimmed));
        }

        if trimmed.eq_ignore_ascii_case("TRUE") {
            return CellValue::Boolean(true);
        }
        if trimmed.eq_ignore_ascii_case("FALSE") {
            return CellValue::Boolean(false);
        }

        if let Some(num) = parse_number(trimmed) {
            return CellValue::Number(num);
        }

        if let Some(date) = parse_date(trimmed) {
            return CellValue::Date(date);
        }

        CellValue::Text(trimmed.to_string())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    pub fn is_formula(&self) -> bool {
        matches!(self, CellValue::Formula(_))
    }

    pub fn formula(&self) -> Option<&Formula> {
        match self {
            CellValue::Formula(f) => Some(f),
            _ => None,
        }
    }

    /// Value of a literal cell as seen by formulas. Formulas have no
    /// literal value; their cached result lives on the `Cell`.
    pub fn literal_value(&self, date_system: DateSystem) -> Value {
        match self {
            CellValue::Empty | CellValue::Formula(_) => Value::Empty,
            CellValue::Number(n) => Value::Number(*n),
            CellValue::Text(s) => Value::Text(s.clone()),
            CellValue::Boolean(b) => Value::Boolean(*b),
            CellValue::Date(dt) => Value::Number(datetime_to_serial(*dt, date_system)),
        }
    }

    /// Text a user would edit: formula source, or the literal.
    pub fn raw_display(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Number(n) => crate::formula::value::format_general(*n),
            CellValue::Text(s) => s.clone(),
            CellValue::Boolean(b) => if *b { "TRUE".into() } else { "FALSE".into() },
            CellValue::Date(dt) => {
                if dt.time() == chrono::NaiveTime::MIN {
                    dt.format("%Y-%m-%d").to_string()
                } else {
                    dt.format("%Y-%m-%d %H:%M:%S").to_string()
                }
            }
            CellValue::Formula(f) => f.source.clone(),
        }
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Boolean(b)
    }
}

fn parse_number(s: &str) -> Option<f64> {
    if let Some(pct) = s.strip_suffix('%') {
        return parse_number(pct.trim()).map(|n| n / 100.0);
    }
    if let Ok(n) = s.parse::<f64>() {
        // Reject "inf"/"NaN" spellings that f64 accepts
        return n.is_finite().then_some(n);
    }
    if !s.contains(',') {
        return None;
    }
    // Thousands separators: 1,234 or -1,234,567.89
    let (sign, body) = match s.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, s),
    };
    let (int_part, frac_part) = match body.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (body, None),
    };
    let groups: Vec<&str> = int_part.split(',').collect();
    let well_formed = !groups[0].is_empty()
        && groups[0].len() <= 3
        && groups[1..].iter().all(|g| g.len() == 3)
        && groups.iter().all(|g| g.bytes().all(|b| b.is_ascii_digit()));
    if !well_formed {
        return None;
    }
    let mut plain = groups.concat();
    if let Some(frac) = frac_part {
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        plain.push('.');
        plain.push_str(frac);
    }
    plain.parse::<f64>().ok().map(|n| sign * n)
}

fn parse_date(s: &str) -> Option<NaiveDateTime> {
    const DATETIME_FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ];
    const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Note attached to a cell
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub content: String,
    #[serde(default)]
    pub visible: bool,
}

impl Comment {
    pub fn new(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self { author: author.into(), content: content.into(), visible: false }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cell {
    pub value: CellValue,
    #[serde(default, skip_serializing_if = "StyleId::is_default")]
    pub style: StyleId,
    /// Result of the last evaluation (formula cells only)
    #[serde(skip)]
    pub cached: Value,
    #[serde(skip)]
    pub state: EvalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<Comment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyperlink: Option<String>,
}

impl Cell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: CellValue) -> Self {
        Self { value, ..Self::default() }
    }

    pub fn is_formula(&self) -> bool {
        self.value.is_formula()
    }

    /// Value as seen by formulas referencing this cell
    pub fn computed_value(&self, date_system: DateSystem) -> Value {
        match &self.value {
            CellValue::Formula(_) => self.cached.clone(),
            other => other.literal_value(date_system),
        }
    }

    /// True when the cell carries nothing worth storing
    pub fn is_blank(&self) -> bool {
        self.value.is_empty()
            && self.style.is_default()
            && self.comment.is_none()
            && self.hyperlink.is_none()
    }

    /// Reset content; style, comment and link survive.
    pub fn clear_content(&mut self) {
        self.value = CellValue::Empty;
        self.cached = Value::Empty;
        self.state = EvalState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_numbers() {
        assert_eq!(CellValue::infer("42"), CellValue::Number(42.0));
        assert_eq!(CellValue::infer(" -3.5 "), CellValue::Number(-3.5));
        assert_eq!(CellValue::infer("1,234.5"), CellValue::Number(1234.5));
        assert_eq!(CellValue::infer("12%"), CellValue::Number(0.12));
        assert_eq!(CellValue::infer("1,23"), CellValue::Text("1,23".into()));
        assert_eq!(CellValue::infer("inf"), CellValue::Text("inf".into()));
    }

    #[test]
    fn test_infer_booleans_and_text() {
        assert_eq!(CellValue::infer("true"), CellValue::Boolean(true));
        assert_eq!(CellValue::infer("FALSE"), CellValue::Boolean(false));
        assert_eq!(CellValue::infer("hello"), CellValue::Text("hello".into()));
        assert_eq!(CellValue::infer("   "), CellValue::Empty);
        assert_eq!(CellValue::infer("="), CellValue::Text("=".into()));
    }

    #[test]
    fn test_infer_formula() {
        match CellValue::infer("=SUM(A1:A3)") {
            CellValue::Formula(f) => {
                assert_eq!(f.source, "=SUM(A1:A3)");
                assert!(f.expr.is_none());
            }
            other => panic!("expected formula, got {:?}", other),
        }
    }

    #[test]
    fn test_infer_dates() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert_eq!(CellValue::infer("2024-03-05"), CellValue::Date(expected));
        assert_eq!(CellValue::infer("03/05/2024"), CellValue::Date(expected));
        assert_eq!(CellValue::infer("2024/03/05"), CellValue::Date(expected));
        match CellValue::infer("2024-03-05 14:30") {
            CellValue::Date(dt) => assert_eq!(dt.format("%H:%M").to_string(), "14:30"),
            other => panic!("expected date, got {:?}", other),
        }
    }

    #[test]
    fn test_date_literal_value_is_serial() {
        let cell = Cell::with_value(CellValue::infer("2024-01-15"));
        assert_eq!(cell.computed_value(DateSystem::Excel1900), Value::Number(45306.0));
    }

    #[test]
    fn test_clear_content_keeps_style() {
        let mut cell = Cell::with_value(CellValue::Number(1.0));
        cell.style = StyleId(3);
        cell.comment = Some(Comment::new("me", "note"));
        cell.clear_content();
        assert!(cell.value.is_empty());
        assert_eq!(cell.style, StyleId(3));
        assert!(!cell.is_blank());
    }
}
