// Scalar values produced by formula evaluation

use std::fmt;

use serde::{Deserialize, Serialize};

/// Formula error codes. Errors are values: they propagate through
/// dependent formulas instead of aborting evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellError {
    /// Reference to a deleted cell, row, column or sheet
    Ref,
    Div0,
    Value,
    Name,
    Na,
    Num,
    Null,
    /// Cell participates in a circular reference
    Circular,
}

impl CellError {
    pub const ALL: [CellError; 8] = [
        CellError::Ref,
        CellError::Div0,
        CellError::Value,
        CellError::Name,
        CellError::Na,
        CellError::Num,
        CellError::Null,
        CellError::Circular,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            CellError::Ref => "#REF!",
            CellError::Div0 => "#DIV/0!",
            CellError::Value => "#VALUE!",
            CellError::Name => "#NAME?",
            CellError::Na => "#N/A",
            CellError::Num => "#NUM!",
            CellError::Null => "#NULL!",
            CellError::Circular => "#CIRC!",
        }
    }

    /// Parse an error literal such as `#DIV/0!` (case-insensitive).
    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim();
        Self::ALL.iter().copied().find(|e| e.code().eq_ignore_ascii_case(code))
    }
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Empty,
    Number(f64),
    Text(String),
    Boolean(bool),
    Error(CellError),
}

impl Value {
    /// Coerce to a number the way arithmetic operators do.
    pub fn to_number(&self) -> Result<f64, CellError> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Text(s) if s.trim().is_empty() => Ok(0.0),
            Value::Text(s) => s.trim().parse::<f64>().map_err(|_| CellError::Value),
            Value::Empty => Ok(0.0),
            Value::Error(e) => Err(*e),
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Value::Number(n) => format_general(*n),
            Value::Text(s) => s.clone(),
            Value::Boolean(b) => if *b { "TRUE".to_string() } else { "FALSE".to_string() },
            Value::Empty => String::new(),
            Value::Error(e) => e.code().to_string(),
        }
    }

    pub fn to_bool(&self) -> Result<bool, CellError> {
        match self {
            Value::Boolean(b) => Ok(*b),
            Value::Number(n) => Ok(*n != 0.0),
            Value::Text(s) => {
                let upper = s.to_uppercase();
                if upper == "TRUE" {
                    Ok(true)
                } else if upper == "FALSE" {
                    Ok(false)
                } else {
                    Err(CellError::Value)
                }
            }
            Value::Empty => Ok(false),
            Value::Error(e) => Err(*e),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<CellError> for Value {
    fn from(e: CellError) -> Self {
        Value::Error(e)
    }
}

/// General number display: integers without decimals, otherwise up to
/// 10 significant decimals with trailing zeros removed.
pub fn format_general(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else if n.abs() >= 1e15 || (n != 0.0 && n.abs() < 1e-9) {
        format!("{:E}", n)
    } else {
        let s = format!("{:.10}", n);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}
