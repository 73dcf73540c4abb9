// Built-in spreadsheet functions

use super::eval::{eval_arg, evaluate, Arg, CellLookup};
use super::parser::BoundExpr;
use super::value::{CellError, Value};

/// Check if a function name is a known built-in function.
/// Function names must be uppercase (as produced by the parser).
pub fn is_known_function(name: &str) -> bool {
    matches!(
        name,
        // Aggregates
        "SUM" | "AVERAGE" | "AVG" | "MIN" | "MAX" | "COUNT" | "COUNTA" |
        // Math
        "ABS" | "ROUND" |
        // Logic
        "IF" | "AND" | "OR" | "NOT" | "IFERROR" | "ISBLANK" |
        // Text
        "TRIM" | "LEN" | "UPPER" | "LOWER" | "CONCATENATE" | "CONCAT"
    )
}

/// Call a built-in. Arguments arrive unevaluated so IF and IFERROR only
/// evaluate the branch they take.
pub fn call<L: CellLookup + ?Sized>(name: &str, args: &[BoundExpr], lookup: &L) -> Value {
    dispatch(name, args, lookup).unwrap_or_else(Value::Error)
}

fn dispatch<L: CellLookup + ?Sized>(name: &str, args: &[BoundExpr], lookup: &L) -> Result<Value, CellError> {
    match name {
        // =====================
        // AGGREGATES
        // =====================
        "SUM" => {
            let mut total = 0.0;
            for_each_number(args, lookup, |n| total += n)?;
            Ok(Value::Number(total))
        }
        "AVERAGE" | "AVG" => {
            let (mut total, mut count) = (0.0, 0usize);
            for_each_number(args, lookup, |n| {
                total += n;
                count += 1;
            })?;
            if count == 0 {
                return Err(CellError::Div0);
            }
            Ok(Value::Number(total / count as f64))
        }
        "MIN" | "MAX" => {
            let is_min = name == "MIN";
            let mut best: Option<f64> = None;
            for_each_number(args, lookup, |n| {
                best = Some(match best {
                    None => n,
                    Some(b) if is_min => b.min(n),
                    Some(b) => b.max(n),
                });
            })?;
            Ok(Value::Number(best.unwrap_or(0.0)))
        }
        "COUNT" => {
            let mut count = 0usize;
            for arg in args {
                match eval_arg(arg, lookup) {
                    Arg::Range(range) => count += range.iter().filter(|v| matches!(v, Value::Number(_))).count(),
                    Arg::Value(Value::Empty | Value::Error(_)) => {}
                    Arg::Value(v) => count += usize::from(v.to_number().is_ok()),
                }
            }
            Ok(Value::Number(count as f64))
        }
        "COUNTA" => {
            let mut count = 0usize;
            for arg in args {
                match eval_arg(arg, lookup) {
                    Arg::Range(range) => count += range.iter().filter(|v| !v.is_empty()).count(),
                    Arg::Value(v) => count += usize::from(!v.is_empty()),
                }
            }
            Ok(Value::Number(count as f64))
        }

        // =====================
        // MATH
        // =====================
        "ABS" => {
            arity(args, 1, 1)?;
            Ok(Value::Number(number(&args[0], lookup)?.abs()))
        }
        "ROUND" => {
            arity(args, 1, 2)?;
            let value = number(&args[0], lookup)?;
            let digits = match args.get(1) {
                Some(arg) => number(arg, lookup)?.trunc() as i32,
                None => 0,
            };
            Ok(Value::Number(round_half_away(value, digits)))
        }

        // =====================
        // LOGIC
        // =====================
        "IF" => {
            arity(args, 2, 3)?;
            let condition = evaluate(&args[0], lookup).to_bool()?;
            if condition {
                Ok(evaluate(&args[1], lookup))
            } else {
                match args.get(2) {
                    Some(branch) => Ok(evaluate(branch, lookup)),
                    None => Ok(Value::Boolean(false)),
                }
            }
        }
        "AND" | "OR" => {
            let is_and = name == "AND";
            let mut seen = false;
            let mut result = is_and;
            for arg in args {
                let mut fold = |v: Value, from_range: bool| -> Result<(), CellError> {
                    let b = match v {
                        Value::Error(e) => return Err(e),
                        Value::Empty => return Ok(()),
                        Value::Text(_) if from_range => return Ok(()),
                        other => other.to_bool()?,
                    };
                    seen = true;
                    result = if is_and { result && b } else { result || b };
                    Ok(())
                };
                match eval_arg(arg, lookup) {
                    Arg::Range(range) => {
                        for v in range.iter() {
                            fold(v, true)?;
                        }
                    }
                    Arg::Value(v) => fold(v, false)?,
                }
            }
            if !seen {
                return Err(CellError::Value);
            }
            Ok(Value::Boolean(result))
        }
        "NOT" => {
            arity(args, 1, 1)?;
            Ok(Value::Boolean(!evaluate(&args[0], lookup).to_bool()?))
        }
        "IFERROR" => {
            arity(args, 2, 2)?;
            match evaluate(&args[0], lookup) {
                Value::Error(_) => Ok(evaluate(&args[1], lookup)),
                v => Ok(v),
            }
        }
        "ISBLANK" => {
            arity(args, 1, 1)?;
            Ok(Value::Boolean(evaluate(&args[0], lookup).is_empty()))
        }

        // =====================
        // TEXT
        // =====================
        "TRIM" => {
            arity(args, 1, 1)?;
            Ok(Value::Text(trim_spaces(&text(&args[0], lookup)?)))
        }
        "LEN" => {
            arity(args, 1, 1)?;
            Ok(Value::Number(text(&args[0], lookup)?.chars().count() as f64))
        }
        "UPPER" => {
            arity(args, 1, 1)?;
            Ok(Value::Text(text(&args[0], lookup)?.to_uppercase()))
        }
        "LOWER" => {
            arity(args, 1, 1)?;
            Ok(Value::Text(text(&args[0], lookup)?.to_lowercase()))
        }
        "CONCATENATE" | "CONCAT" => {
            let mut out = String::new();
            for arg in args {
                match eval_arg(arg, lookup) {
                    Arg::Range(range) => {
                        for v in range.iter() {
                            if let Value::Error(e) = v {
                                return Err(e);
                            }
                            out.push_str(&v.to_text());
                        }
                    }
                    Arg::Value(Value::Error(e)) => return Err(e),
                    Arg::Value(v) => out.push_str(&v.to_text()),
                }
            }
            Ok(Value::Text(out))
        }

        _ => Err(CellError::Name),
    }
}

fn arity(args: &[BoundExpr], min: usize, max: usize) -> Result<(), CellError> {
    if args.len() < min || args.len() > max {
        return Err(CellError::Value);
    }
    Ok(())
}

fn number<L: CellLookup + ?Sized>(expr: &BoundExpr, lookup: &L) -> Result<f64, CellError> {
    evaluate(expr, lookup).to_number()
}

fn text<L: CellLookup + ?Sized>(expr: &BoundExpr, lookup: &L) -> Result<String, CellError> {
    match evaluate(expr, lookup) {
        Value::Error(e) => Err(e),
        v => Ok(v.to_text()),
    }
}

/// Feed every numeric input to `f`.
///
/// Values read from references contribute only when they are numbers:
/// text, booleans and blanks are skipped and errors abort. Values passed
/// directly are coerced, so `SUM("3", TRUE)` is 4 and `SUM("x")` is #VALUE!.
fn for_each_number<L: CellLookup + ?Sized>(
    args: &[BoundExpr],
    lookup: &L,
    mut f: impl FnMut(f64),
) -> Result<(), CellError> {
    for arg in args {
        match eval_arg(arg, lookup) {
            Arg::Range(range) => {
                for v in range.iter() {
                    match v {
                        Value::Number(n) => f(n),
                        Value::Error(e) => return Err(e),
                        _ => {}
                    }
                }
            }
            Arg::Value(Value::Empty) => {}
            Arg::Value(v) => f(v.to_number()?),
        }
    }
    Ok(())
}

fn round_half_away(value: f64, digits: i32) -> f64 {
    if digits < 0 {
        let factor = 10f64.powi(-digits);
        return (value / factor).round() * factor;
    }
    let factor = 10f64.powi(digits);
    let scaled = value * factor;
    // Nudge representation error (2.675 is stored as 2.67499..)
    let nudged = scaled + scaled.signum() * scaled.abs() * f64::EPSILON * 4.0;
    nudged.round() / factor
}

/// Strip leading/trailing spaces and collapse inner runs to one space.
fn trim_spaces(s: &str) -> String {
    s.split(' ').filter(|part| !part.is_empty()).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::super::eval::tests::{eval_str, TestLookup, OTHER, SHEET};
    use super::*;

    fn text_value(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn sample() -> TestLookup {
        let mut lookup = TestLookup::default();
        lookup.set(SHEET, 0, 0, 1.0);
        lookup.set(SHEET, 1, 0, 2.0);
        lookup.set(SHEET, 2, 0, 3.0);
        lookup.set(SHEET, 3, 0, text_value("note"));
        lookup.set(SHEET, 4, 0, Value::Boolean(true));
        lookup
    }

    #[test]
    fn test_sum_a1_a3() {
        let lookup = sample();
        assert_eq!(eval_str("=SUM(A1:A3)", &lookup), Value::Number(6.0));
    }

    #[test]
    fn test_aggregates_skip_text_and_booleans_in_ranges() {
        let lookup = sample();
        assert_eq!(eval_str("=SUM(A1:A10)", &lookup), Value::Number(6.0));
        assert_eq!(eval_str("=AVERAGE(A1:A10)", &lookup), Value::Number(2.0));
        assert_eq!(eval_str("=AVG(A1:A3)", &lookup), Value::Number(2.0));
        assert_eq!(eval_str("=MIN(A1:A10)", &lookup), Value::Number(1.0));
        assert_eq!(eval_str("=MAX(A1:A10, 10)", &lookup), Value::Number(10.0));
        assert_eq!(eval_str("=COUNT(A1:A10)", &lookup), Value::Number(3.0));
        assert_eq!(eval_str("=COUNTA(A1:A10)", &lookup), Value::Number(5.0));
        assert_eq!(eval_str("=SUM(A4)", &lookup), Value::Number(0.0));
    }

    #[test]
    fn test_direct_arguments_are_coerced() {
        let lookup = TestLookup::default();
        assert_eq!(eval_str("=SUM(\"3\", TRUE, 1)", &lookup), Value::Number(5.0));
        assert_eq!(eval_str("=SUM(\"x\")", &lookup), Value::Error(CellError::Value));
        assert_eq!(eval_str("=COUNT(1, \"2\", \"x\", TRUE)", &lookup), Value::Number(3.0));
    }

    #[test]
    fn test_empty_aggregates() {
        let lookup = TestLookup::default();
        assert_eq!(eval_str("=SUM(B1:B5)", &lookup), Value::Number(0.0));
        assert_eq!(eval_str("=MIN(B1:B5)", &lookup), Value::Number(0.0));
        assert_eq!(eval_str("=MAX(B1:B5)", &lookup), Value::Number(0.0));
        assert_eq!(eval_str("=AVERAGE(B1:B5)", &lookup), Value::Error(CellError::Div0));
    }

    #[test]
    fn test_errors_in_ranges_propagate() {
        let mut lookup = sample();
        lookup.set(SHEET, 1, 0, Value::Error(CellError::Div0));
        assert_eq!(eval_str("=SUM(A1:A3)", &lookup), Value::Error(CellError::Div0));
        assert_eq!(eval_str("=MAX(A1:A3)", &lookup), Value::Error(CellError::Div0));
        assert_eq!(eval_str("=COUNT(A1:A3)", &lookup), Value::Number(2.0));
    }

    #[test]
    fn test_cross_sheet_range() {
        let mut lookup = TestLookup::default();
        lookup.set(OTHER, 0, 1, 4.0);
        lookup.set(OTHER, 1, 1, 6.0);
        assert_eq!(eval_str("=SUM(Sheet2!B1:B2)", &lookup), Value::Number(10.0));
        assert_eq!(eval_str("=SUM(Nope!B1:B2)", &lookup), Value::Error(CellError::Ref));
    }

    #[test]
    fn test_if_is_lazy() {
        let lookup = sample();
        assert_eq!(eval_str("=IF(A1>0, \"pos\", 1/0)", &lookup), text_value("pos"));
        assert_eq!(eval_str("=IF(A1>5, 1/0, \"small\")", &lookup), text_value("small"));
        assert_eq!(eval_str("=IF(FALSE, 1)", &lookup), Value::Boolean(false));
        assert_eq!(eval_str("=IF(\"maybe\", 1, 2)", &lookup), Value::Error(CellError::Value));
        assert_eq!(eval_str("=IF(1)", &lookup), Value::Error(CellError::Value));
    }

    #[test]
    fn test_trim() {
        let lookup = TestLookup::default();
        assert_eq!(eval_str("=TRIM(\"  a   b  c \")", &lookup), text_value("a b c"));
        assert_eq!(eval_str("=TRIM(\"\")", &lookup), text_value(""));
        assert_eq!(eval_str("=TRIM(#N/A)", &lookup), Value::Error(CellError::Na));
    }

    #[test]
    fn test_text_functions() {
        let lookup = sample();
        assert_eq!(eval_str("=LEN(\"héllo\")", &lookup), Value::Number(5.0));
        assert_eq!(eval_str("=UPPER(A4)", &lookup), text_value("NOTE"));
        assert_eq!(eval_str("=LOWER(\"MiXeD\")", &lookup), text_value("mixed"));
        assert_eq!(eval_str("=CONCATENATE(\"a\", 1, TRUE)", &lookup), text_value("a1TRUE"));
        assert_eq!(eval_str("=CONCAT(A1:A3)", &lookup), text_value("123"));
    }

    #[test]
    fn test_math_functions() {
        let lookup = TestLookup::default();
        assert_eq!(eval_str("=ABS(-3)", &lookup), Value::Number(3.0));
        assert_eq!(eval_str("=ROUND(2.675, 2)", &lookup), Value::Number(2.68));
        assert_eq!(eval_str("=ROUND(-2.5)", &lookup), Value::Number(-3.0));
        assert_eq!(eval_str("=ROUND(1234, -2)", &lookup), Value::Number(1200.0));
    }

    #[test]
    fn test_logic_functions() {
        let lookup = sample();
        assert_eq!(eval_str("=AND(TRUE, 1)", &lookup), Value::Boolean(true));
        assert_eq!(eval_str("=AND(A1:A5)", &lookup), Value::Boolean(true));
        assert_eq!(eval_str("=OR(FALSE, 0)", &lookup), Value::Boolean(false));
        assert_eq!(eval_str("=OR(B1:B3)", &lookup), Value::Error(CellError::Value));
        assert_eq!(eval_str("=NOT(A1>2)", &lookup), Value::Boolean(true));
        assert_eq!(eval_str("=IFERROR(1/0, \"n/a\")", &lookup), text_value("n/a"));
        assert_eq!(eval_str("=IFERROR(7, 0)", &lookup), Value::Number(7.0));
        assert_eq!(eval_str("=ISBLANK(Z9)", &lookup), Value::Boolean(true));
        assert_eq!(eval_str("=ISBLANK(A1)", &lookup), Value::Boolean(false));
    }

    #[test]
    fn test_known_functions() {
        assert!(is_known_function("SUM"));
        assert!(is_known_function("TRIM"));
        assert!(!is_known_function("VLOOKUP"));
    }
}
