//! Conditional formatting.
//!
//! Rules are stored, never materialized: the effective style of a cell is
//! computed on demand from its current value. Within a sheet the formats
//! are checked in insertion order and the rules of each format in order;
//! the first rule that matches supplies the override.

use std::cmp::Ordering;

use cellbook_core::CellRange;
use serde::{Deserialize, Serialize};

use crate::formula::value::Value;
use crate::style::{Border, Borders, Color, Fill, FillPattern, Style, Underline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Equal,
    NotEqual,
    Between,
    NotBetween,
}

impl Comparison {
    /// Operands the comparison needs
    pub fn arity(self) -> usize {
        match self {
            Comparison::Between | Comparison::NotBetween => 2,
            _ => 1,
        }
    }
}

/// Literal right-hand side of a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Number(f64),
    Text(String),
}

impl From<f64> for Operand {
    fn from(n: f64) -> Self {
        Operand::Number(n)
    }
}

impl From<&str> for Operand {
    fn from(s: &str) -> Self {
        Operand::Text(s.to_string())
    }
}

/// Properties a matching rule replaces; `None` leaves the base style's value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleOverride {
    pub bold: Option<bool>,
    pub italic: Option<bool>,
    pub underline: Option<Underline>,
    pub strikethrough: Option<bool>,
    pub font_color: Option<Color>,
    pub fill_color: Option<Color>,
    pub fill_pattern: Option<FillPattern>,
    pub border: Option<Border>,
    pub number_format: Option<String>,
}

impl StyleOverride {
    pub fn fill(color: Color) -> Self {
        Self { fill_color: Some(color), ..Default::default() }
    }

    pub fn font_color(color: Color) -> Self {
        Self { font_color: Some(color), ..Default::default() }
    }

    pub fn apply(&self, base: &Style) -> Style {
        let mut style = base.clone();
        if let Some(bold) = self.bold {
            style.font.bold = bold;
        }
        if let Some(italic) = self.italic {
            style.font.italic = italic;
        }
        if let Some(underline) = self.underline {
            style.font.underline = underline;
        }
        if let Some(strike) = self.strikethrough {
            style.font.strikethrough = strike;
        }
        if let Some(color) = self.font_color {
            style.font.color = Some(color);
        }
        if let Some(color) = self.fill_color {
            let pattern = self.fill_pattern.unwrap_or(FillPattern::Solid);
            style.fill = Fill { pattern, fg_color: Some(color), bg_color: style.fill.bg_color };
        } else if let Some(pattern) = self.fill_pattern {
            style.fill.pattern = pattern;
        }
        if let Some(border) = self.border {
            style.borders = Borders { diagonal: style.borders.diagonal, diagonal_direction: style.borders.diagonal_direction, ..Borders::all(border) };
        }
        if let Some(fmt) = &self.number_format {
            style.number_format = fmt.clone();
        }
        style
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalRule {
    pub comparison: Comparison,
    pub operands: Vec<Operand>,
    pub style: StyleOverride,
}

impl ConditionalRule {
    pub fn new(comparison: Comparison, operands: Vec<Operand>, style: StyleOverride) -> Self {
        Self { comparison, operands, style }
    }

    pub fn matches(&self, value: &Value) -> bool {
        if value.is_error() || value.is_empty() || self.operands.len() < self.comparison.arity() {
            return false;
        }
        let first = &self.operands[0];
        match self.comparison {
            Comparison::LessThan => compare(value, first) == Some(Ordering::Less),
            Comparison::LessThanOrEqual => matches!(compare(value, first), Some(Ordering::Less | Ordering::Equal)),
            Comparison::GreaterThan => compare(value, first) == Some(Ordering::Greater),
            Comparison::GreaterThanOrEqual => {
                matches!(compare(value, first), Some(Ordering::Greater | Ordering::Equal))
            }
            Comparison::Equal => compare(value, first) == Some(Ordering::Equal),
            Comparison::NotEqual => compare(value, first) != Some(Ordering::Equal),
            Comparison::Between => between(value, first, &self.operands[1]),
            Comparison::NotBetween => !between(value, first, &self.operands[1]),
        }
    }
}

/// Numbers compare with numbers, text with text (case-insensitive);
/// mixed kinds are unordered.
fn compare(value: &Value, operand: &Operand) -> Option<Ordering> {
    match (value, operand) {
        (Value::Number(n), Operand::Number(o)) => n.partial_cmp(o),
        (Value::Boolean(b), Operand::Number(o)) => (if *b { 1.0 } else { 0.0 }).partial_cmp(o),
        (Value::Text(s), Operand::Text(o)) => Some(s.to_lowercase().cmp(&o.to_lowercase())),
        _ => None,
    }
}

fn between(value: &Value, a: &Operand, b: &Operand) -> bool {
    let (low, high) = match (a, b) {
        (Operand::Number(x), Operand::Number(y)) if x > y => (b, a),
        (Operand::Text(x), Operand::Text(y)) if x.to_lowercase() > y.to_lowercase() => (b, a),
        _ => (a, b),
    };
    matches!(compare(value, low), Some(Ordering::Greater | Ordering::Equal))
        && matches!(compare(value, high), Some(Ordering::Less | Ordering::Equal))
}

/// Ordered rule list over a target range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalFormat {
    pub range: CellRange,
    pub rules: Vec<ConditionalRule>,
}

impl ConditionalFormat {
    pub fn new(range: CellRange, rules: Vec<ConditionalRule>) -> Self {
        Self { range, rules }
    }

    /// First matching rule for a cell inside the target range
    pub fn first_match(&self, row: usize, col: usize, value: &Value) -> Option<&ConditionalRule> {
        if !self.range.contains(row, col) {
            return None;
        }
        self.rules.iter().find(|rule| rule.matches(value))
    }
}

/// Evaluate a sheet's formats against one cell: first match wins.
pub fn resolve<'a>(
    formats: &'a [ConditionalFormat],
    row: usize,
    col: usize,
    value: &Value,
) -> Option<&'a StyleOverride> {
    formats
        .iter()
        .find_map(|cf| cf.first_match(row, col, value))
        .map(|rule| &rule.style)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(cmp: Comparison, operands: Vec<Operand>, color: Color) -> ConditionalRule {
        ConditionalRule::new(cmp, operands, StyleOverride::fill(color))
    }

    #[test]
    fn test_comparisons() {
        let lt = rule(Comparison::LessThan, vec![10.0.into()], Color::RED);
        assert!(lt.matches(&Value::Number(5.0)));
        assert!(!lt.matches(&Value::Number(10.0)));
        assert!(!lt.matches(&Value::Text("5".into())));
        assert!(!lt.matches(&Value::Empty));

        let eq = rule(Comparison::Equal, vec!["Done".into()], Color::GREEN);
        assert!(eq.matches(&Value::Text("done".into())));
        assert!(!eq.matches(&Value::Number(1.0)));

        let ne = rule(Comparison::NotEqual, vec!["Done".into()], Color::GREEN);
        assert!(ne.matches(&Value::Number(1.0)));
        assert!(!ne.matches(&Value::Error(crate::formula::value::CellError::Div0)));
    }

    #[test]
    fn test_blank_cells_match_nothing() {
        let rules = [
            rule(Comparison::LessThan, vec![10.0.into()], Color::RED),
            rule(Comparison::Equal, vec!["".into()], Color::RED),
            rule(Comparison::NotEqual, vec!["Done".into()], Color::RED),
            rule(Comparison::NotBetween, vec![1.0.into(), 2.0.into()], Color::RED),
        ];
        for r in &rules {
            assert!(!r.matches(&Value::Empty), "{:?}", r.comparison);
        }
    }

    #[test]
    fn test_between_is_inclusive_and_order_free() {
        let between = rule(Comparison::Between, vec![20.0.into(), 10.0.into()], Color::YELLOW);
        assert!(between.matches(&Value::Number(10.0)));
        assert!(between.matches(&Value::Number(20.0)));
        assert!(!between.matches(&Value::Number(21.0)));

        let outside = rule(Comparison::NotBetween, vec![10.0.into(), 20.0.into()], Color::YELLOW);
        assert!(outside.matches(&Value::Number(25.0)));
        assert!(!outside.matches(&Value::Number(15.0)));
    }

    #[test]
    fn test_first_match_wins() {
        let range = CellRange::parse("A1:A10").unwrap();
        let formats = vec![
            ConditionalFormat::new(
                range.clone(),
                vec![
                    rule(Comparison::GreaterThan, vec![100.0.into()], Color::RED),
                    rule(Comparison::GreaterThan, vec![50.0.into()], Color::YELLOW),
                ],
            ),
            ConditionalFormat::new(range, vec![rule(Comparison::GreaterThan, vec![0.0.into()], Color::GREEN)]),
        ];

        let fill = |v: f64| resolve(&formats, 0, 0, &Value::Number(v)).and_then(|o| o.fill_color);
        assert_eq!(fill(150.0), Some(Color::RED));
        assert_eq!(fill(75.0), Some(Color::YELLOW));
        assert_eq!(fill(5.0), Some(Color::GREEN));
        assert_eq!(fill(-5.0), None);
        assert!(resolve(&formats, 0, 1, &Value::Number(150.0)).is_none());
    }

    #[test]
    fn test_override_apply() {
        let mut base = Style::default();
        base.font.italic = true;
        let over = StyleOverride {
            bold: Some(true),
            fill_color: Some(Color::RED),
            number_format: Some("0.00".into()),
            ..Default::default()
        };
        let styled = over.apply(&base);
        assert!(styled.font.bold && styled.font.italic);
        assert_eq!(styled.fill.pattern, FillPattern::Solid);
        assert_eq!(styled.fill.fg_color, Some(Color::RED));
        assert_eq!(styled.number_format, "0.00");
        assert!(!base.font.bold);
    }
}
