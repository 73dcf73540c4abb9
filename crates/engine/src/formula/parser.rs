// Formula parser - converts formula strings into AST
// Supports: numbers, strings, booleans, error literals, cell refs (A1, $A$1), ranges (A1:A5),
// whole columns and rows (A:C, $2:$4), sheet-qualified refs (Sheet2!A1, 'My Sheet'!A1:B2), functions, named ranges,
// arithmetic (+ - * / ^ %), concatenation (&) and comparisons (< > = <= >= <>)

use cellbook_core::{col_to_letters, format_sheet_name, letters_to_col, MAX_COLS, MAX_ROWS};

use super::value::CellError;
use crate::sheet::{SheetId, SheetRef, UnboundSheetRef};

/// Generic expression AST, parameterized over sheet reference type.
/// - Parser outputs `ParsedExpr = Expr<UnboundSheetRef>` (sheet names unresolved)
/// - After binding, becomes `BoundExpr = Expr<SheetRef>` (sheet IDs resolved)
#[derive(Debug, Clone, PartialEq)]
pub enum Expr<S> {
    Number(f64),
    Text(String),
    Boolean(bool),
    /// Error literal, also produced when a reference target is deleted
    Error(CellError),
    /// Cell reference with sheet context
    /// - col_abs/row_abs: true if that component is absolute ($A vs A, $1 vs 1)
    CellRef {
        sheet: S,
        col: usize,
        row: usize,
        col_abs: bool,
        row_abs: bool,
    },
    /// Range reference with sheet context
    Range {
        sheet: S,
        start_col: usize,
        start_row: usize,
        end_col: usize,
        end_row: usize,
        start_col_abs: bool,
        start_row_abs: bool,
        end_col_abs: bool,
        end_row_abs: bool,
    },
    Function {
        name: String,
        args: Vec<Expr<S>>,
    },
    BinaryOp {
        op: Op,
        left: Box<Expr<S>>,
        right: Box<Expr<S>>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr<S>>,
    },
    /// Named range reference (resolved at evaluation time)
    NamedRange(String),
    /// Empty/omitted argument (e.g. the trailing slot in `=IF(a,b,)`)
    Empty,
}

impl<S> Expr<S> {
    /// `A:C` form: a range over every row with both row anchors pinned
    pub fn is_whole_columns(&self) -> bool {
        matches!(
            self,
            Expr::Range { start_row: 0, end_row, start_row_abs: true, end_row_abs: true, .. } if *end_row == MAX_ROWS - 1
        )
    }

    /// `2:4` form: a range over every column with both column anchors pinned
    pub fn is_whole_rows(&self) -> bool {
        matches!(
            self,
            Expr::Range { start_col: 0, end_col, start_col_abs: true, end_col_abs: true, .. } if *end_col == MAX_COLS - 1
        )
    }
}

/// Parser output: sheet references are unresolved names
pub type ParsedExpr = Expr<UnboundSheetRef>;

/// Bound expression: sheet references resolved to stable IDs
pub type BoundExpr = Expr<SheetRef>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    // Comparison
    Lt,      // <
    Gt,      // >
    Eq,      // =
    LtEq,    // <=
    GtEq,    // >=
    NotEq,   // <>
    // String
    Concat,  // &
    // Exponentiation
    Pow,     // ^
}

impl Op {
    fn symbol(self) -> &'static str {
        match self {
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mul => "*",
            Op::Div => "/",
            Op::Lt => "<",
            Op::Gt => ">",
            Op::Eq => "=",
            Op::LtEq => "<=",
            Op::GtEq => ">=",
            Op::NotEq => "<>",
            Op::Concat => "&",
            Op::Pow => "^",
        }
    }

    /// Binding strength, matching the parser's precedence chain.
    fn precedence(self) -> u8 {
        match self {
            Op::Lt | Op::Gt | Op::Eq | Op::LtEq | Op::GtEq | Op::NotEq => 1,
            Op::Concat => 2,
            Op::Add | Op::Sub => 3,
            Op::Mul | Op::Div => 4,
            Op::Pow => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Neg,
    Percent,
}

/// Parse a formula string into an unbound AST (sheet names not yet resolved to IDs).
/// Call `bind_expr()` with workbook context to resolve sheet references before evaluation.
pub fn parse(formula: &str) -> Result<ParsedExpr, String> {
    let formula = formula.trim();
    let Some(input) = formula.strip_prefix('=') else {
        return Err("Formula must start with =".to_string());
    };

    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err("Empty formula".to_string());
    }
    let (expr, pos) = parse_comparison(&tokens, 0)?;
    if pos < tokens.len() {
        return Err(format!("Unexpected token at position {}", pos));
    }
    Ok(expr)
}

#[derive(Debug, Clone)]
enum Token {
    Number(f64),
    StringLit(String),
    ErrorLit(CellError),
    /// Cell reference with absolute/relative flags
    CellRef {
        col: usize,
        row: usize,
        col_abs: bool,
        row_abs: bool,
    },
    /// `$A` or `$3`: only valid as one end of a whole column/row range
    ColRef { col: usize, abs: bool },
    RowRef { row: usize, abs: bool },
    /// Sheet name prefix (e.g., "Sheet1" from "Sheet1!A1")
    SheetPrefix(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Colon,
    Comma,
    Lt,
    Gt,
    Eq,
    LtEq,
    GtEq,
    NotEq,
    Ampersand,
    Caret,
    Percent,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => { chars.next(); }
            '+' => { tokens.push(Token::Plus); chars.next(); }
            '-' => { tokens.push(Token::Minus); chars.next(); }
            '*' => { tokens.push(Token::Star); chars.next(); }
            '/' => { tokens.push(Token::Slash); chars.next(); }
            '(' => { tokens.push(Token::LParen); chars.next(); }
            ')' => { tokens.push(Token::RParen); chars.next(); }
            ':' => { tokens.push(Token::Colon); chars.next(); }
            ',' => { tokens.push(Token::Comma); chars.next(); }
            '&' => { tokens.push(Token::Ampersand); chars.next(); }
            '^' => { tokens.push(Token::Caret); chars.next(); }
            '%' => { tokens.push(Token::Percent); chars.next(); }
            '<' => {
                chars.next();
                match chars.peek() {
                    Some('=') => { tokens.push(Token::LtEq); chars.next(); }
                    Some('>') => { tokens.push(Token::NotEq); chars.next(); }
                    _ => tokens.push(Token::Lt),
                }
            }
            '>' => {
                chars.next();
                if let Some(&'=') = chars.peek() {
                    tokens.push(Token::GtEq);
                    chars.next();
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '=' => { tokens.push(Token::Eq); chars.next(); }
            '"' => {
                // String literal; "" inside is an escaped quote
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => {
                            if chars.peek() == Some(&'"') {
                                chars.next();
                                s.push('"');
                            } else {
                                break;
                            }
                        }
                        Some(ch) => s.push(ch),
                        None => return Err("Unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::StringLit(s));
            }
            '#' => {
                let rest: String = chars.clone().collect();
                let err = CellError::ALL
                    .iter()
                    .copied()
                    .find(|e| {
                        rest.len() >= e.code().len()
                            && rest.is_char_boundary(e.code().len())
                            && rest[..e.code().len()].eq_ignore_ascii_case(e.code())
                    })
                    .ok_or_else(|| format!("Unknown error literal: {}", rest))?;
                for _ in 0..err.code().chars().count() {
                    chars.next();
                }
                tokens.push(Token::ErrorLit(err));
            }
            '\'' => {
                // Quoted sheet name (e.g., 'My Sheet'!A1 or 'Bob''s Sheet'!A1)
                chars.next();
                let mut sheet_name = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => {
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                                sheet_name.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some(ch) => sheet_name.push(ch),
                        None => return Err("Unterminated sheet name".to_string()),
                    }
                }
                if chars.next() != Some('!') {
                    return Err("Quoted sheet name must be followed by !".to_string());
                }
                tokens.push(Token::SheetPrefix(sheet_name));
            }
            c if c.is_alphabetic() || c == '_' => {
                // Cell reference (A1), function name (SUM), named range, or sheet prefix (Sheet1!)
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' || ch == '$' || ch == '.' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }

                if chars.peek() == Some(&'!') {
                    chars.next();
                    tokens.push(Token::SheetPrefix(ident));
                    continue;
                }

                let upper = ident.to_uppercase();
                if let Some(token) = try_parse_cell_ref(&ident) {
                    tokens.push(token);
                } else {
                    tokens.push(Token::Ident(upper));
                }
            }
            '$' => {
                // Absolute reference marker - collect with following letters/numbers
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '$' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match try_parse_cell_ref(&ident).or_else(|| try_parse_line_ref(&ident)) {
                    Some(token) => tokens.push(token),
                    None => return Err(format!("Invalid cell reference: {}", ident)),
                }
            }
            '0'..='9' | '.' => {
                let mut num_str = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num_str.push(d);
                        chars.next();
                    } else if (d == 'e' || d == 'E') && !num_str.contains(['e', 'E']) {
                        // Scientific notation: 1.5E+3
                        let mut lookahead = chars.clone();
                        lookahead.next();
                        let sign = lookahead.peek().copied();
                        let has_digits = match sign {
                            Some('+') | Some('-') => {
                                lookahead.next();
                                lookahead.peek().map_or(false, |c| c.is_ascii_digit())
                            }
                            Some(c) => c.is_ascii_digit(),
                            None => false,
                        };
                        if !has_digits {
                            break;
                        }
                        num_str.push(d);
                        chars.next();
                        if let Some(&s) = chars.peek() {
                            if s == '+' || s == '-' {
                                num_str.push(s);
                                chars.next();
                            }
                        }
                    } else {
                        break;
                    }
                }
                let num: f64 = num_str.parse().map_err(|_| format!("Invalid number: {}", num_str))?;
                tokens.push(Token::Number(num));
            }
            _ => return Err(format!("Unexpected character: {}", c)),
        }
    }

    Ok(tokens)
}

fn try_parse_cell_ref(s: &str) -> Option<Token> {
    let bytes = s.as_bytes();
    let mut pos = 0;

    let col_abs = bytes.first() == Some(&b'$');
    if col_abs {
        pos += 1;
    }
    let letters_start = pos;
    while pos < bytes.len() && bytes[pos].is_ascii_alphabetic() {
        pos += 1;
    }
    if pos == letters_start {
        return None;
    }
    let col = letters_to_col(&s[letters_start..pos])?;

    let row_abs = bytes.get(pos) == Some(&b'$');
    if row_abs {
        pos += 1;
    }
    let row_str = &s[pos..];
    if row_str.is_empty() || !row_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let row: usize = row_str.parse().ok()?;
    if row == 0 || row > MAX_ROWS {
        return None;
    }

    Some(Token::CellRef { col, row: row - 1, col_abs, row_abs })
}

/// `$A` or `$3`
fn try_parse_line_ref(s: &str) -> Option<Token> {
    let rest = s.strip_prefix('$')?;
    if rest.bytes().all(|b| b.is_ascii_digit()) {
        let row: usize = rest.parse().ok()?;
        return (1..=MAX_ROWS).contains(&row).then_some(Token::RowRef { row: row - 1, abs: true });
    }
    letters_to_col(rest).map(|col| Token::ColRef { col, abs: true })
}

/// One end of a whole column/row range. Bare letters and integers only
/// take this meaning next to a colon.
#[derive(Clone, Copy)]
enum Line {
    Col(usize, bool),
    Row(usize, bool),
}

fn as_line(token: &Token) -> Option<Line> {
    match token {
        Token::ColRef { col, abs } => Some(Line::Col(*col, *abs)),
        Token::RowRef { row, abs } => Some(Line::Row(*row, *abs)),
        Token::Ident(name) => letters_to_col(name).map(|col| Line::Col(col, false)),
        Token::Number(n) if n.fract() == 0.0 && *n >= 1.0 && *n <= MAX_ROWS as f64 => {
            Some(Line::Row(*n as usize - 1, false))
        }
        _ => None,
    }
}

/// `A:C`, `$A:$A`, `1:1` or `$2:4` at `pos`; None if the tokens there
/// are not a whole column/row range.
fn parse_line_range(tokens: &[Token], pos: usize, sheet: &UnboundSheetRef) -> Option<(ParsedExpr, usize)> {
    let first = as_line(tokens.get(pos)?)?;
    if !matches!(tokens.get(pos + 1), Some(Token::Colon)) {
        return None;
    }
    let second = as_line(tokens.get(pos + 2)?)?;
    let ordered = |a: usize, a_abs: bool, b: usize, b_abs: bool| {
        if a <= b { (a, a_abs, b, b_abs) } else { (b, b_abs, a, a_abs) }
    };
    let expr = match (first, second) {
        (Line::Col(c1, a1), Line::Col(c2, a2)) => {
            let (start_col, start_col_abs, end_col, end_col_abs) = ordered(c1, a1, c2, a2);
            Expr::Range {
                sheet: sheet.clone(),
                start_col,
                start_row: 0,
                end_col,
                end_row: MAX_ROWS - 1,
                start_col_abs,
                start_row_abs: true,
                end_col_abs,
                end_row_abs: true,
            }
        }
        (Line::Row(r1, a1), Line::Row(r2, a2)) => {
            let (start_row, start_row_abs, end_row, end_row_abs) = ordered(r1, a1, r2, a2);
            Expr::Range {
                sheet: sheet.clone(),
                start_col: 0,
                start_row,
                end_col: MAX_COLS - 1,
                end_row,
                start_col_abs: true,
                start_row_abs,
                end_col_abs: true,
                end_row_abs,
            }
        }
        _ => return None,
    };
    Some((expr, pos + 3))
}

// Lowest precedence: comparison operators
fn parse_comparison(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    let (mut left, mut pos) = parse_concat(tokens, pos)?;

    while pos < tokens.len() {
        let op = match &tokens[pos] {
            Token::Lt => Op::Lt,
            Token::Gt => Op::Gt,
            Token::Eq => Op::Eq,
            Token::LtEq => Op::LtEq,
            Token::GtEq => Op::GtEq,
            Token::NotEq => Op::NotEq,
            _ => break,
        };
        let (right, new_pos) = parse_concat(tokens, pos + 1)?;
        left = binary(op, left, right);
        pos = new_pos;
    }

    Ok((left, pos))
}

// String concatenation (&)
fn parse_concat(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    let (mut left, mut pos) = parse_add_sub(tokens, pos)?;

    while pos < tokens.len() {
        if let Token::Ampersand = &tokens[pos] {
            let (right, new_pos) = parse_add_sub(tokens, pos + 1)?;
            left = binary(Op::Concat, left, right);
            pos = new_pos;
        } else {
            break;
        }
    }

    Ok((left, pos))
}

fn parse_add_sub(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    let (mut left, mut pos) = parse_mul_div(tokens, pos)?;

    while pos < tokens.len() {
        let op = match &tokens[pos] {
            Token::Plus => Op::Add,
            Token::Minus => Op::Sub,
            _ => break,
        };
        let (right, new_pos) = parse_mul_div(tokens, pos + 1)?;
        left = binary(op, left, right);
        pos = new_pos;
    }

    Ok((left, pos))
}

fn parse_mul_div(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    let (mut left, mut pos) = parse_power(tokens, pos)?;

    while pos < tokens.len() {
        let op = match &tokens[pos] {
            Token::Star => Op::Mul,
            Token::Slash => Op::Div,
            _ => break,
        };
        let (right, new_pos) = parse_power(tokens, pos + 1)?;
        left = binary(op, left, right);
        pos = new_pos;
    }

    Ok((left, pos))
}

// Exponentiation (^) - right-associative, higher precedence than * /
fn parse_power(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    let (base, pos) = parse_percent(tokens, pos)?;

    if let Some(Token::Caret) = tokens.get(pos) {
        let (exponent, new_pos) = parse_power(tokens, pos + 1)?;
        return Ok((binary(Op::Pow, base, exponent), new_pos));
    }

    Ok((base, pos))
}

// Percent postfix (%)
fn parse_percent(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    let (mut expr, mut pos) = parse_unary(tokens, pos)?;

    while let Some(Token::Percent) = tokens.get(pos) {
        expr = Expr::UnaryOp { op: UnaryOp::Percent, operand: Box::new(expr) };
        pos += 1;
    }

    Ok((expr, pos))
}

fn parse_unary(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    match tokens.get(pos) {
        Some(Token::Plus) => parse_unary(tokens, pos + 1),
        Some(Token::Minus) => {
            let (operand, pos) = parse_unary(tokens, pos + 1)?;
            Ok((Expr::UnaryOp { op: UnaryOp::Neg, operand: Box::new(operand) }, pos))
        }
        _ => parse_primary(tokens, pos),
    }
}

fn binary(op: Op, left: ParsedExpr, right: ParsedExpr) -> ParsedExpr {
    Expr::BinaryOp { op, left: Box::new(left), right: Box::new(right) }
}

/// Parse `ref` or `ref:ref` starting at `pos` with the given sheet context.
fn parse_reference(tokens: &[Token], pos: usize, sheet: UnboundSheetRef) -> Result<(ParsedExpr, usize), String> {
    if let Some(parsed) = parse_line_range(tokens, pos, &sheet) {
        return Ok(parsed);
    }
    let Some(Token::CellRef { col, row, col_abs, row_abs }) = tokens.get(pos) else {
        return Err("Sheet reference must be followed by cell reference".to_string());
    };
    if let (Some(Token::Colon), Some(Token::CellRef { col: c2, row: r2, col_abs: ca2, row_abs: ra2 })) =
        (tokens.get(pos + 1), tokens.get(pos + 2))
    {
        // Normalize corners so start is top-left
        let (start_row, start_row_abs, end_row, end_row_abs) =
            if row <= r2 { (*row, *row_abs, *r2, *ra2) } else { (*r2, *ra2, *row, *row_abs) };
        let (start_col, start_col_abs, end_col, end_col_abs) =
            if col <= c2 { (*col, *col_abs, *c2, *ca2) } else { (*c2, *ca2, *col, *col_abs) };
        return Ok((
            Expr::Range {
                sheet,
                start_col,
                start_row,
                end_col,
                end_row,
                start_col_abs,
                start_row_abs,
                end_col_abs,
                end_row_abs,
            },
            pos + 3,
        ));
    }
    Ok((Expr::CellRef { sheet, col: *col, row: *row, col_abs: *col_abs, row_abs: *row_abs }, pos + 1))
}

fn parse_primary(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    let Some(token) = tokens.get(pos) else {
        return Err("Unexpected end of expression".to_string());
    };

    if let Some(parsed) = parse_line_range(tokens, pos, &UnboundSheetRef::Current) {
        return Ok(parsed);
    }

    match token {
        Token::Number(n) => Ok((Expr::Number(*n), pos + 1)),
        Token::StringLit(s) => Ok((Expr::Text(s.clone()), pos + 1)),
        Token::ErrorLit(e) => Ok((Expr::Error(*e), pos + 1)),
        Token::SheetPrefix(sheet_name) => {
            parse_reference(tokens, pos + 1, UnboundSheetRef::Named(sheet_name.clone()))
        }
        Token::CellRef { .. } => parse_reference(tokens, pos, UnboundSheetRef::Current),
        Token::Ident(name) => {
            if let Some(Token::LParen) = tokens.get(pos + 1) {
                let (args, new_pos) = parse_function_args(tokens, pos + 2)?;
                return Ok((Expr::Function { name: name.clone(), args }, new_pos));
            }
            match name.as_str() {
                "TRUE" => Ok((Expr::Boolean(true), pos + 1)),
                "FALSE" => Ok((Expr::Boolean(false), pos + 1)),
                // Not a function call - treat as a named range (resolved at evaluation time)
                _ => Ok((Expr::NamedRange(name.clone()), pos + 1)),
            }
        }
        Token::LParen => {
            let (expr, pos) = parse_comparison(tokens, pos + 1)?;
            match tokens.get(pos) {
                Some(Token::RParen) => Ok((expr, pos + 1)),
                Some(_) => Err("Expected closing parenthesis".to_string()),
                None => Err("Missing closing parenthesis".to_string()),
            }
        }
        _ => Err(format!("Unexpected token at position {}", pos)),
    }
}

fn parse_function_args(tokens: &[Token], pos: usize) -> Result<(Vec<ParsedExpr>, usize), String> {
    let mut args = Vec::new();
    let mut pos = pos;

    // Handle empty function call SUM()
    if let Some(Token::RParen) = tokens.get(pos) {
        return Ok((args, pos + 1));
    }

    loop {
        // Empty argument: next token is , or ) immediately
        match tokens.get(pos) {
            Some(Token::RParen) => {
                args.push(Expr::Empty);
                return Ok((args, pos + 1));
            }
            Some(Token::Comma) => {
                args.push(Expr::Empty);
                pos += 1;
                continue;
            }
            _ => {}
        }

        let (arg, new_pos) = parse_comparison(tokens, pos)?;
        args.push(arg);
        pos = new_pos;

        match tokens.get(pos) {
            Some(Token::RParen) => return Ok((args, pos + 1)),
            Some(Token::Comma) => pos += 1,
            Some(_) => return Err("Expected comma or closing parenthesis".to_string()),
            None => return Err("Missing closing parenthesis in function call".to_string()),
        }
    }
}

// =============================================================================
// Expression Binding - Convert ParsedExpr to BoundExpr
// =============================================================================

/// Bind a parsed expression by resolving sheet names to SheetIds.
///
/// The resolver function takes a sheet name and returns:
/// - Some(SheetId) if the sheet exists
/// - None if the sheet doesn't exist (evaluates to #REF!, keeps its name for display)
pub fn bind_expr<F>(expr: &ParsedExpr, resolver: F) -> BoundExpr
where
    F: Fn(&str) -> Option<SheetId> + Copy,
{
    map_sheets(expr, &|sheet: &UnboundSheetRef| match sheet {
        UnboundSheetRef::Current => SheetRef::Current,
        UnboundSheetRef::Named(name) => match resolver(name) {
            Some(id) => SheetRef::Id(id),
            None => SheetRef::RefError { last_known_name: name.clone() },
        },
    })
}

/// Rebuild an expression with every sheet reference mapped through `f`.
pub fn map_sheets<S, T, F>(expr: &Expr<S>, f: &F) -> Expr<T>
where
    F: Fn(&S) -> T,
{
    match expr {
        Expr::Empty => Expr::Empty,
        Expr::Number(n) => Expr::Number(*n),
        Expr::Text(s) => Expr::Text(s.clone()),
        Expr::Boolean(b) => Expr::Boolean(*b),
        Expr::Error(e) => Expr::Error(*e),
        Expr::NamedRange(name) => Expr::NamedRange(name.clone()),
        Expr::CellRef { sheet, col, row, col_abs, row_abs } => Expr::CellRef {
            sheet: f(sheet),
            col: *col,
            row: *row,
            col_abs: *col_abs,
            row_abs: *row_abs,
        },
        Expr::Range { sheet, start_col, start_row, end_col, end_row, start_col_abs, start_row_abs, end_col_abs, end_row_abs } => {
            Expr::Range {
                sheet: f(sheet),
                start_col: *start_col,
                start_row: *start_row,
                end_col: *end_col,
                end_row: *end_row,
                start_col_abs: *start_col_abs,
                start_row_abs: *start_row_abs,
                end_col_abs: *end_col_abs,
                end_row_abs: *end_row_abs,
            }
        }
        Expr::Function { name, args } => Expr::Function {
            name: name.clone(),
            args: args.iter().map(|arg| map_sheets(arg, f)).collect(),
        },
        Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
            op: *op,
            left: Box::new(map_sheets(left, f)),
            right: Box::new(map_sheets(right, f)),
        },
        Expr::UnaryOp { op, operand } => Expr::UnaryOp {
            op: *op,
            operand: Box::new(map_sheets(operand, f)),
        },
    }
}

// =============================================================================
// Formula Printing - Convert BoundExpr back to string
// =============================================================================

/// Format a bound expression as a formula string (with leading '=').
///
/// The `name_resolver` function takes a SheetId and returns the current sheet name.
/// This allows formulas to display updated names after sheet renames.
pub fn format_expr<F>(expr: &BoundExpr, name_resolver: F) -> String
where
    F: Fn(SheetId) -> Option<String> + Copy,
{
    format!("={}", format_expr_inner(expr, name_resolver))
}

/// Format a bound expression without the leading '='.
pub fn format_expr_inner<F>(expr: &BoundExpr, name_resolver: F) -> String
where
    F: Fn(SheetId) -> Option<String> + Copy,
{
    match expr {
        Expr::Empty => String::new(),
        Expr::Number(n) => format_number_literal(*n),
        Expr::Text(s) => format!("\"{}\"", s.replace('"', "\"\"")),
        Expr::Boolean(b) => if *b { "TRUE".to_string() } else { "FALSE".to_string() },
        Expr::Error(e) => e.code().to_string(),
        Expr::NamedRange(name) => name.clone(),
        Expr::CellRef { sheet, col, row, col_abs, row_abs } => {
            let Some(prefix) = format_sheet_prefix(sheet, name_resolver) else {
                return CellError::Ref.code().to_string();
            };
            format!("{}{}", prefix, format_cell_addr(*col, *row, *col_abs, *row_abs))
        }
        Expr::Range { sheet, start_col, start_row, end_col, end_row, start_col_abs, start_row_abs, end_col_abs, end_row_abs } => {
            let Some(prefix) = format_sheet_prefix(sheet, name_resolver) else {
                return CellError::Ref.code().to_string();
            };
            let pin = |abs: bool| if abs { "$" } else { "" };
            if expr.is_whole_columns() {
                return format!(
                    "{}{}{}:{}{}",
                    prefix,
                    pin(*start_col_abs),
                    col_to_letters(*start_col),
                    pin(*end_col_abs),
                    col_to_letters(*end_col)
                );
            }
            if expr.is_whole_rows() {
                return format!("{}{}{}:{}{}", prefix, pin(*start_row_abs), start_row + 1, pin(*end_row_abs), end_row + 1);
            }
            let start = format_cell_addr(*start_col, *start_row, *start_col_abs, *start_row_abs);
            let end = format_cell_addr(*end_col, *end_row, *end_col_abs, *end_row_abs);
            format!("{}{}:{}", prefix, start, end)
        }
        Expr::Function { name, args } => {
            let args_str: Vec<String> = args.iter()
                .map(|arg| format_expr_inner(arg, name_resolver))
                .collect();
            format!("{}({})", name, args_str.join(","))
        }
        Expr::BinaryOp { op, left, right } => {
            let prec = op.precedence();
            let mut left_str = format_expr_inner(left, name_resolver);
            let mut right_str = format_expr_inner(right, name_resolver);
            // Parenthesize children that bind looser than this operator.
            // Left-associative ops also need parens for an equal-precedence right child;
            // right-associative ^ needs them for an equal-precedence left child.
            if let Expr::BinaryOp { op: lop, .. } = left.as_ref() {
                let lp = lop.precedence();
                if lp < prec || (lp == prec && *op == Op::Pow) {
                    left_str = format!("({})", left_str);
                }
            }
            if let Expr::BinaryOp { op: rop, .. } = right.as_ref() {
                let rp = rop.precedence();
                if rp < prec || (rp == prec && *op != Op::Pow) {
                    right_str = format!("({})", right_str);
                }
            }
            format!("{}{}{}", left_str, op.symbol(), right_str)
        }
        Expr::UnaryOp { op, operand } => {
            let inner = format_expr_inner(operand, name_resolver);
            let inner = if matches!(operand.as_ref(), Expr::BinaryOp { .. }) {
                format!("({})", inner)
            } else {
                inner
            };
            match op {
                UnaryOp::Neg => format!("-{}", inner),
                UnaryOp::Percent => format!("{}%", inner),
            }
        }
    }
}

fn format_number_literal(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Format a sheet reference prefix: empty for Current, "Name!" otherwise.
/// Returns None when the referenced sheet no longer exists.
fn format_sheet_prefix<F>(sheet: &SheetRef, name_resolver: F) -> Option<String>
where
    F: Fn(SheetId) -> Option<String>,
{
    match sheet {
        SheetRef::Current => Some(String::new()),
        SheetRef::Id(id) => name_resolver(*id).map(|name| format!("{}!", format_sheet_name(&name))),
        SheetRef::RefError { last_known_name } => Some(format!("{}!", format_sheet_name(last_known_name))),
    }
}

/// Format a cell address in A1 notation
fn format_cell_addr(col: usize, row: usize, col_abs: bool, row_abs: bool) -> String {
    format!(
        "{}{}{}{}",
        if col_abs { "$" } else { "" },
        col_to_letters(col),
        if row_abs { "$" } else { "" },
        row + 1
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(formula: &str) -> String {
        let parsed = parse(formula).unwrap();
        let bound = bind_expr(&parsed, |name| {
            if name.eq_ignore_ascii_case("Sheet2") { Some(SheetId::from_raw(2)) } else { None }
        });
        format_expr(&bound, |id| (id.raw() == 2).then(|| "Sheet2".to_string()))
    }

    // ── absolute references ──

    #[test]
    fn test_parse_absolute_both() {
        let expr = parse("=$A$1").unwrap();
        match expr {
            Expr::CellRef { col, row, col_abs, row_abs, .. } => {
                assert_eq!((col, row), (0, 0));
                assert!(col_abs && row_abs);
            }
            _ => panic!("Expected CellRef, got {:?}", expr),
        }
    }

    #[test]
    fn test_parse_mixed_absolute() {
        match parse("=$A1").unwrap() {
            Expr::CellRef { col_abs, row_abs, .. } => assert!(col_abs && !row_abs),
            other => panic!("Expected CellRef, got {:?}", other),
        }
        match parse("=A$1").unwrap() {
            Expr::CellRef { col_abs, row_abs, .. } => assert!(!col_abs && row_abs),
            other => panic!("Expected CellRef, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_range() {
        match parse("=SUM(A1:A3)").unwrap() {
            Expr::Function { name, args } => {
                assert_eq!(name, "SUM");
                assert!(matches!(
                    args[0],
                    Expr::Range { start_row: 0, end_row: 2, start_col: 0, end_col: 0, .. }
                ));
            }
            other => panic!("Expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_whole_columns_and_rows() {
        match parse("=SUM(B:A)").unwrap() {
            Expr::Function { args, .. } => {
                assert!(args[0].is_whole_columns());
                assert!(matches!(
                    args[0],
                    Expr::Range { start_col: 0, end_col: 1, start_row: 0, start_col_abs: false, .. }
                ));
            }
            other => panic!("Expected function, got {:?}", other),
        }
        match parse("=SUM(3:2)").unwrap() {
            Expr::Function { args, .. } => {
                assert!(args[0].is_whole_rows());
                assert!(matches!(args[0], Expr::Range { start_row: 1, end_row: 2, start_col: 0, .. }));
            }
            other => panic!("Expected function, got {:?}", other),
        }
        assert_eq!(roundtrip("=SUM(a:a)"), "=SUM(A:A)");
        assert_eq!(roundtrip("=SUM($A:C,1:1)"), "=SUM($A:C,1:1)");
        assert_eq!(roundtrip("=Sheet2!$2:$4"), "=Sheet2!$2:$4");
        assert_eq!(roundtrip("=SUM(A1:A1048576)"), "=SUM(A1:A1048576)");
    }

    #[test]
    fn test_mixed_line_kinds_rejected() {
        for bad in ["=A:1", "=1:A", "=$A", "=SUM($3)", "=A1:B", "=0:1"] {
            assert!(parse(bad).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn test_inverted_range_is_normalized() {
        assert_eq!(roundtrip("=SUM(B5:A1)"), "=SUM(A1:B5)");
    }

    // ── sheet references ──

    #[test]
    fn test_cross_sheet_reference() {
        match parse("=Sheet2!B3").unwrap() {
            Expr::CellRef { sheet: UnboundSheetRef::Named(name), row: 2, col: 1, .. } => {
                assert_eq!(name, "Sheet2");
            }
            other => panic!("Expected sheet ref, got {:?}", other),
        }
        match parse("='My Data'!A1:B2").unwrap() {
            Expr::Range { sheet: UnboundSheetRef::Named(name), .. } => assert_eq!(name, "My Data"),
            other => panic!("Expected sheet range, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_sheet_keeps_name() {
        let parsed = parse("=Missing!A1+1").unwrap();
        let bound = bind_expr(&parsed, |_| None);
        match &bound {
            Expr::BinaryOp { left, .. } => assert!(matches!(
                left.as_ref(),
                Expr::CellRef { sheet: SheetRef::RefError { .. }, .. }
            )),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(format_expr(&bound, |_| None), "=Missing!A1+1");
    }

    #[test]
    fn test_deleted_sheet_prints_ref_error() {
        let parsed = parse("=Sheet2!A1").unwrap();
        let bound = bind_expr(&parsed, |_| Some(SheetId::from_raw(9)));
        assert_eq!(format_expr(&bound, |_| None), "=#REF!");
    }

    // ── literals and operators ──

    #[test]
    fn test_error_literal() {
        assert_eq!(parse("=#REF!").unwrap(), Expr::Error(CellError::Ref));
        assert_eq!(parse("=#div/0!+1").unwrap(), binary(Op::Add, Expr::Error(CellError::Div0), Expr::Number(1.0)));
        assert!(parse("=#WHAT").is_err());
    }

    #[test]
    fn test_string_with_escaped_quote() {
        assert_eq!(parse("=\"say \"\"hi\"\"\"").unwrap(), Expr::Text("say \"hi\"".into()));
        assert_eq!(roundtrip("=\"a\"\"b\""), "=\"a\"\"b\"");
    }

    #[test]
    fn test_precedence_preserved_when_printing() {
        assert_eq!(roundtrip("=(A1+B1)*2"), "=(A1+B1)*2");
        assert_eq!(roundtrip("=A1+B1*2"), "=A1+B1*2");
        assert_eq!(roundtrip("=A1-(B1-C1)"), "=A1-(B1-C1)");
        assert_eq!(roundtrip("=(2^3)^2"), "=(2^3)^2");
        assert_eq!(roundtrip("=2^3^2"), "=2^3^2");
    }

    #[test]
    fn test_unary_and_percent() {
        assert_eq!(roundtrip("=-A1"), "=-A1");
        assert_eq!(roundtrip("=50%"), "=50%");
        assert_eq!(roundtrip("=-(A1+1)"), "=-(A1+1)");
    }

    #[test]
    fn test_scientific_notation() {
        assert_eq!(parse("=1.5E3").unwrap(), Expr::Number(1500.0));
        assert_eq!(parse("=2e-2").unwrap(), Expr::Number(0.02));
    }

    #[test]
    fn test_named_range_and_booleans() {
        assert_eq!(parse("=Revenue").unwrap(), Expr::NamedRange("REVENUE".into()));
        assert_eq!(parse("=true").unwrap(), Expr::Boolean(true));
    }

    #[test]
    fn test_empty_arguments() {
        match parse("=IF(A1,,)").unwrap() {
            Expr::Function { args, .. } => {
                assert_eq!(args.len(), 3);
                assert_eq!(args[1], Expr::Empty);
                assert_eq!(args[2], Expr::Empty);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["A1", "=", "=SUM(A1", "=(1+2", "=1+", "=\"open", "='Sheet A1", "=1 2"] {
            assert!(parse(bad).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn test_roundtrip_cross_sheet() {
        assert_eq!(roundtrip("=sum(sheet2!a1:b2, $C$3)"), "=SUM(Sheet2!A1:B2,$C$3)");
    }
}
