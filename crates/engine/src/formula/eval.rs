// Formula evaluator - evaluates bound expressions (after sheet name resolution)

use std::cmp::Ordering;

use super::functions;
use super::parser::{BoundExpr, Expr, Op, UnaryOp};
use super::value::{CellError, Value};
use crate::sheet::{SheetId, SheetRef};

/// Target of a named range as the evaluator sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamedRangeResolution {
    pub sheet: SheetId,
    pub start_row: usize,
    pub start_col: usize,
    pub end_row: usize,
    pub end_col: usize,
}

impl NamedRangeResolution {
    pub fn is_single_cell(&self) -> bool {
        self.start_row == self.end_row && self.start_col == self.end_col
    }
}

/// Read access to the workbook for one formula evaluation.
pub trait CellLookup {
    /// The sheet the formula being evaluated lives on.
    fn current_sheet(&self) -> SheetId;

    /// Value of a cell as formulas see it. Returns `#REF!` when the sheet
    /// does not exist.
    fn get_value(&self, sheet: SheetId, row: usize, col: usize) -> Value;

    /// (rows, cols) covering every stored cell of a sheet, or None when
    /// the sheet does not exist. Ranges are clamped to it.
    fn extent(&self, sheet: SheetId) -> Option<(usize, usize)>;

    /// Resolve a named range to its target. Default: no names defined.
    fn resolve_named_range(&self, _name: &str) -> Option<NamedRangeResolution> {
        None
    }
}

/// A rectangular block of cells read lazily through a `CellLookup`.
///
/// Bounds are clamped to the sheet's used extent when built, so whole-column
/// references cost only what is stored. `iter()` starts a fresh pass every
/// time it is called.
pub struct RangeValues<'a, L: ?Sized> {
    lookup: &'a L,
    sheet: SheetId,
    start_row: usize,
    start_col: usize,
    /// Exclusive bounds after clamping
    end_row: usize,
    end_col: usize,
}

impl<L: ?Sized> Clone for RangeValues<'_, L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<L: ?Sized> Copy for RangeValues<'_, L> {}

impl<'a, L: CellLookup + ?Sized> RangeValues<'a, L> {
    /// Inclusive corners; None when the sheet does not exist.
    pub fn new(
        lookup: &'a L,
        sheet: SheetId,
        start_row: usize,
        start_col: usize,
        end_row: usize,
        end_col: usize,
    ) -> Option<Self> {
        let (rows, cols) = lookup.extent(sheet)?;
        Some(Self {
            lookup,
            sheet,
            start_row,
            start_col,
            end_row: end_row.saturating_add(1).min(rows).max(start_row),
            end_col: end_col.saturating_add(1).min(cols).max(start_col),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.start_row >= self.end_row || self.start_col >= self.end_col
    }

    /// Row-major iterator over the clamped block
    pub fn iter(&self) -> RangeIter<'a, L> {
        RangeIter { range: *self, row: self.start_row, col: self.start_col }
    }

    /// Row-major iterator yielding coordinates along with values
    pub fn iter_cells(&self) -> impl Iterator<Item = (usize, usize, Value)> + 'a {
        let range = *self;
        (range.start_row..range.end_row).flat_map(move |row| {
            (range.start_col..range.end_col).map(move |col| (row, col, range.lookup.get_value(range.sheet, row, col)))
        })
    }
}

impl<'a, L: CellLookup + ?Sized> IntoIterator for &RangeValues<'a, L> {
    type Item = Value;
    type IntoIter = RangeIter<'a, L>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct RangeIter<'a, L: ?Sized> {
    range: RangeValues<'a, L>,
    row: usize,
    col: usize,
}

impl<L: CellLookup + ?Sized> Iterator for RangeIter<'_, L> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let r = &self.range;
        if r.is_empty() || self.row >= r.end_row {
            return None;
        }
        let value = r.lookup.get_value(r.sheet, self.row, self.col);
        self.col += 1;
        if self.col >= r.end_col {
            self.col = r.start_col;
            self.row += 1;
        }
        Some(value)
    }
}

/// A function argument after reference resolution
pub enum Arg<'a, L: ?Sized> {
    Value(Value),
    Range(RangeValues<'a, L>),
}

/// Resolve an argument without collapsing references: cell refs, ranges
/// and named ranges become `Arg::Range`; anything else is evaluated.
pub(crate) fn eval_arg<'a, L: CellLookup + ?Sized>(expr: &BoundExpr, lookup: &'a L) -> Arg<'a, L> {
    let range = match expr {
        Expr::CellRef { sheet, row, col, .. } => resolve_sheet(sheet, lookup)
            .and_then(|id| RangeValues::new(lookup, id, *row, *col, *row, *col)),
        Expr::Range { sheet, start_row, start_col, end_row, end_col, .. } => resolve_sheet(sheet, lookup)
            .and_then(|id| RangeValues::new(lookup, id, *start_row, *start_col, *end_row, *end_col)),
        Expr::NamedRange(name) => match lookup.resolve_named_range(name) {
            Some(t) => RangeValues::new(lookup, t.sheet, t.start_row, t.start_col, t.end_row, t.end_col),
            None => return Arg::Value(Value::Error(CellError::Name)),
        },
        _ => return Arg::Value(evaluate(expr, lookup)),
    };
    match range {
        Some(range) => Arg::Range(range),
        None => Arg::Value(Value::Error(CellError::Ref)),
    }
}

fn resolve_sheet<L: CellLookup + ?Sized>(sheet: &SheetRef, lookup: &L) -> Option<SheetId> {
    match sheet {
        SheetRef::Current => Some(lookup.current_sheet()),
        SheetRef::Id(id) => Some(*id),
        SheetRef::RefError { .. } => None,
    }
}

/// Evaluate a whole formula. A blank result reads as 0, the way a cell
/// holding `=A1` shows 0 when A1 is empty.
pub fn evaluate_formula<L: CellLookup + ?Sized>(expr: &BoundExpr, lookup: &L) -> Value {
    match evaluate(expr, lookup) {
        Value::Empty => Value::Number(0.0),
        v => v,
    }
}

pub fn evaluate<L: CellLookup + ?Sized>(expr: &BoundExpr, lookup: &L) -> Value {
    match expr {
        Expr::Number(n) => Value::Number(*n),
        Expr::Text(s) => Value::Text(s.clone()),
        Expr::Boolean(b) => Value::Boolean(*b),
        Expr::Error(e) => Value::Error(*e),
        Expr::Empty => Value::Empty,
        Expr::CellRef { sheet, row, col, .. } => match resolve_sheet(sheet, lookup) {
            Some(id) => lookup.get_value(id, *row, *col),
            None => Value::Error(CellError::Ref),
        },
        Expr::Range { sheet, start_row, start_col, end_row, end_col, .. } => {
            match resolve_sheet(sheet, lookup) {
                // A 1x1 range is just a cell; a larger one is not a scalar
                Some(id) if start_row == end_row && start_col == end_col => lookup.get_value(id, *start_row, *start_col),
                Some(_) => Value::Error(CellError::Value),
                None => Value::Error(CellError::Ref),
            }
        }
        Expr::NamedRange(name) => match lookup.resolve_named_range(name) {
            None => Value::Error(CellError::Name),
            Some(t) if t.is_single_cell() => lookup.get_value(t.sheet, t.start_row, t.start_col),
            Some(_) => Value::Error(CellError::Value),
        },
        Expr::Function { name, args } => functions::call(name, args, lookup),
        Expr::UnaryOp { op, operand } => {
            let n = match evaluate(operand, lookup).to_number() {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            match op {
                UnaryOp::Neg => Value::Number(-n),
                UnaryOp::Percent => Value::Number(n / 100.0),
            }
        }
        Expr::BinaryOp { op, left, right } => {
            let left = evaluate(left, lookup);
            let right = evaluate(right, lookup);
            binary(*op, &left, &right)
        }
    }
}

fn binary(op: Op, left: &Value, right: &Value) -> Value {
    if let Value::Error(e) = left {
        return Value::Error(*e);
    }
    if let Value::Error(e) = right {
        return Value::Error(*e);
    }

    match op {
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow => {
            let (a, b) = match (left.to_number(), right.to_number()) {
                (Ok(a), Ok(b)) => (a, b),
                (Err(e), _) | (_, Err(e)) => return Value::Error(e),
            };
            let result = match op {
                Op::Add => a + b,
                Op::Sub => a - b,
                Op::Mul => a * b,
                Op::Div if b == 0.0 => return Value::Error(CellError::Div0),
                Op::Div => a / b,
                _ => a.powf(b),
            };
            if result.is_finite() {
                Value::Number(result)
            } else {
                Value::Error(CellError::Num)
            }
        }
        Op::Concat => Value::Text(format!("{}{}", left.to_text(), right.to_text())),
        Op::Lt | Op::Gt | Op::Eq | Op::LtEq | Op::GtEq | Op::NotEq => {
            let ord = compare_values(left, right);
            Value::Boolean(match op {
                Op::Lt => ord == Ordering::Less,
                Op::Gt => ord == Ordering::Greater,
                Op::Eq => ord == Ordering::Equal,
                Op::LtEq => ord != Ordering::Greater,
                Op::GtEq => ord != Ordering::Less,
                _ => ord != Ordering::Equal,
            })
        }
    }
}

/// Relative tolerance for numeric equality
const EPSILON: f64 = 1e-12;

/// Comparison operator semantics: numbers < text < booleans; text compares
/// case-insensitively; a blank takes the type of the other side.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Number(_) | Value::Empty => 0,
            Value::Text(_) => 1,
            Value::Boolean(_) => 2,
            Value::Error(_) => 3,
        }
    }

    match (a, b) {
        (Value::Empty, Value::Empty) => Ordering::Equal,
        (Value::Empty, Value::Text(_)) => compare_values(&Value::Text(String::new()), b),
        (Value::Text(_), Value::Empty) => compare_values(a, &Value::Text(String::new())),
        (Value::Empty, Value::Boolean(_)) => compare_values(&Value::Boolean(false), b),
        (Value::Boolean(_), Value::Empty) => compare_values(a, &Value::Boolean(false)),
        (Value::Empty, _) => compare_values(&Value::Number(0.0), b),
        (_, Value::Empty) => compare_values(a, &Value::Number(0.0)),
        (Value::Number(x), Value::Number(y)) => {
            if (x - y).abs() <= EPSILON * x.abs().max(y.abs()).max(1.0) {
                Ordering::Equal
            } else {
                x.partial_cmp(y).unwrap_or(Ordering::Equal)
            }
        }
        (Value::Text(x), Value::Text(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::formula::parser::{bind_expr, parse};
    use rustc_hash::FxHashMap;
    use std::cell::Cell as Counter;

    pub(crate) const SHEET: SheetId = SheetId::from_raw(1);
    pub(crate) const OTHER: SheetId = SheetId::from_raw(2);

    /// In-memory lookup over two sheets, counting reads.
    #[derive(Default)]
    pub(crate) struct TestLookup {
        pub cells: FxHashMap<(SheetId, usize, usize), Value>,
        pub names: FxHashMap<String, NamedRangeResolution>,
        pub reads: Counter<usize>,
    }

    impl TestLookup {
        pub fn set(&mut self, sheet: SheetId, row: usize, col: usize, value: impl Into<Value>) {
            self.cells.insert((sheet, row, col), value.into());
        }
    }

    impl CellLookup for TestLookup {
        fn current_sheet(&self) -> SheetId {
            SHEET
        }

        fn get_value(&self, sheet: SheetId, row: usize, col: usize) -> Value {
            self.reads.set(self.reads.get() + 1);
            if sheet != SHEET && sheet != OTHER {
                return Value::Error(CellError::Ref);
            }
            self.cells.get(&(sheet, row, col)).cloned().unwrap_or_default()
        }

        fn extent(&self, sheet: SheetId) -> Option<(usize, usize)> {
            if sheet != SHEET && sheet != OTHER {
                return None;
            }
            Some(
                self.cells
                    .keys()
                    .filter(|(s, _, _)| *s == sheet)
                    .fold((0, 0), |(r, c), (_, row, col)| (r.max(row + 1), c.max(col + 1))),
            )
        }

        fn resolve_named_range(&self, name: &str) -> Option<NamedRangeResolution> {
            self.names.get(name).copied()
        }
    }

    pub(crate) fn eval_str(formula: &str, lookup: &TestLookup) -> Value {
        let parsed = parse(formula).unwrap();
        let bound = bind_expr(&parsed, |name| match name.to_lowercase().as_str() {
            "sheet1" => Some(SHEET),
            "sheet2" => Some(OTHER),
            _ => None,
        });
        evaluate_formula(&bound, lookup)
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn test_arithmetic_precedence() {
        let lookup = TestLookup::default();
        assert_eq!(eval_str("=1+2*3", &lookup), Value::Number(7.0));
        assert_eq!(eval_str("=(1+2)*3", &lookup), Value::Number(9.0));
        assert_eq!(eval_str("=2^3^2", &lookup), Value::Number(512.0));
        assert_eq!(eval_str("=-2^2", &lookup), Value::Number(4.0));
        assert_eq!(eval_str("=50%", &lookup), Value::Number(0.5));
        assert_eq!(eval_str("=\"a\"&1&TRUE", &lookup), text("a1TRUE"));
    }

    #[test]
    fn test_errors() {
        let lookup = TestLookup::default();
        assert_eq!(eval_str("=1/0", &lookup), Value::Error(CellError::Div0));
        assert_eq!(eval_str("=\"x\"+1", &lookup), Value::Error(CellError::Value));
        assert_eq!(eval_str("=#N/A+1", &lookup), Value::Error(CellError::Na));
        assert_eq!(eval_str("=Missing!A1", &lookup), Value::Error(CellError::Ref));
        assert_eq!(eval_str("=NOSUCHFN(1)", &lookup), Value::Error(CellError::Name));
        assert_eq!(eval_str("=undefined_name", &lookup), Value::Error(CellError::Name));
        assert_eq!(eval_str("=(-8)^0.5", &lookup), Value::Error(CellError::Num));
    }

    #[test]
    fn test_cell_refs_and_blank() {
        let mut lookup = TestLookup::default();
        lookup.set(SHEET, 0, 0, 10.0);
        lookup.set(OTHER, 1, 1, 5.0);
        assert_eq!(eval_str("=A1*2", &lookup), Value::Number(20.0));
        assert_eq!(eval_str("=Sheet2!B2+A1", &lookup), Value::Number(15.0));
        assert_eq!(eval_str("=Z99", &lookup), Value::Number(0.0));
        assert_eq!(eval_str("=Z99&\"\"", &lookup), text(""));
        assert_eq!(eval_str("=A1:A3", &lookup), Value::Error(CellError::Value));
    }

    #[test]
    fn test_comparisons() {
        let mut lookup = TestLookup::default();
        lookup.set(SHEET, 0, 0, text("Apple"));
        assert_eq!(eval_str("=A1=\"APPLE\"", &lookup), Value::Boolean(true));
        assert_eq!(eval_str("=0.1+0.2=0.3", &lookup), Value::Boolean(true));
        assert_eq!(eval_str("=1<\"a\"", &lookup), Value::Boolean(true));
        assert_eq!(eval_str("=\"z\"<TRUE", &lookup), Value::Boolean(true));
        assert_eq!(eval_str("=B1=0", &lookup), Value::Boolean(true));
        assert_eq!(eval_str("=B1=\"\"", &lookup), Value::Boolean(true));
        assert_eq!(eval_str("=3<>3", &lookup), Value::Boolean(false));
    }

    #[test]
    fn test_named_range() {
        let mut lookup = TestLookup::default();
        lookup.set(SHEET, 0, 0, 1.0);
        lookup.set(SHEET, 1, 0, 2.0);
        lookup.names.insert(
            "TOTALS".into(),
            NamedRangeResolution { sheet: SHEET, start_row: 0, start_col: 0, end_row: 1, end_col: 0 },
        );
        lookup.names.insert(
            "FIRST".into(),
            NamedRangeResolution { sheet: SHEET, start_row: 0, start_col: 0, end_row: 0, end_col: 0 },
        );
        assert_eq!(eval_str("=SUM(Totals)", &lookup), Value::Number(3.0));
        assert_eq!(eval_str("=first*10", &lookup), Value::Number(10.0));
    }

    #[test]
    fn test_range_values_are_clamped_and_restartable() {
        let mut lookup = TestLookup::default();
        lookup.set(SHEET, 0, 0, 1.0);
        lookup.set(SHEET, 2, 0, 3.0);

        // A:A is clamped to the three stored rows
        let range = RangeValues::new(&lookup, SHEET, 0, 0, cellbook_core::MAX_ROWS - 1, 0).unwrap();
        let first: Vec<Value> = range.iter().collect();
        assert_eq!(first, vec![Value::Number(1.0), Value::Empty, Value::Number(3.0)]);
        assert_eq!(lookup.reads.get(), 3);

        // A second pass starts over
        let second: Vec<Value> = (&range).into_iter().collect();
        assert_eq!(first, second);

        // Reads happen on demand
        lookup.reads.set(0);
        let mut iter = range.iter();
        iter.next();
        assert_eq!(lookup.reads.get(), 1);
    }

    #[test]
    fn test_range_outside_extent_is_empty() {
        let mut lookup = TestLookup::default();
        lookup.set(SHEET, 0, 0, 1.0);
        let range = RangeValues::new(&lookup, SHEET, 10, 10, 20, 20).unwrap();
        assert!(range.is_empty());
        assert_eq!(range.iter().count(), 0);
        assert!(RangeValues::new(&lookup, SheetId::from_raw(9), 0, 0, 1, 1).is_none());
    }
}
