//! Number format rendering and date serials.
//!
//! Supports the common subset of format codes: `General`, digit
//! placeholders (`0`, `#`, `?`), thousands separators, percent,
//! scientific notation, quoted/escaped literals, up to four `;`-separated
//! sections, and date/time codes (`yyyy`, `mmm`, `d`, `h`, `mm`, `ss`, `AM/PM`).

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};

use cellbook_config::DateSystem;

use crate::formula::value::{format_general, Value};

fn epoch(date_system: DateSystem) -> Option<NaiveDate> {
    match date_system {
        DateSystem::Excel1900 => NaiveDate::from_ymd_opt(1899, 12, 30),
        DateSystem::Excel1904 => NaiveDate::from_ymd_opt(1904, 1, 1),
    }
}

/// Convert a date-time to its serial number. The 1900 system keeps the
/// phantom 29 Feb 1900, so serials before March 1900 are shifted by one.
pub fn datetime_to_serial(dt: NaiveDateTime, date_system: DateSystem) -> f64 {
    let Some(base) = epoch(date_system) else { return 0.0 };
    let mut days = (dt.date() - base).num_days() as f64;
    if date_system == DateSystem::Excel1900 && days < 61.0 {
        days -= 1.0;
    }
    days + dt.time().num_seconds_from_midnight() as f64 / 86_400.0
}

/// Convert a serial number back to a date-time. Negative serials have no date.
pub fn serial_to_datetime(serial: f64, date_system: DateSystem) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial < 0.0 || serial > 2_958_466.0 {
        return None;
    }
    let days = serial.floor();
    let mut seconds = ((serial - days) * 86_400.0).round() as i64;
    let mut days = days as i64;
    if seconds >= 86_400 {
        seconds -= 86_400;
        days += 1;
    }
    let base = epoch(date_system)?;
    let base = if date_system == DateSystem::Excel1900 && days < 60 {
        base + Duration::days(1)
    } else {
        base
    };
    let date = base.checked_add_signed(Duration::days(days))?;
    date.and_hms_opt(0, 0, 0)
        .map(|midnight| midnight + Duration::seconds(seconds))
}

/// Render a number with a format code.
pub fn format_number(n: f64, code: &str, date_system: DateSystem) -> String {
    let code = code.trim();
    if code.is_empty() || code.eq_ignore_ascii_case("General") || code == "@" {
        return format_general(n);
    }

    let sections = split_sections(code);
    let (section, value, explicit_sign) = if n < 0.0 && sections.len() > 1 {
        (sections[1], -n, true)
    } else if n == 0.0 && sections.len() > 2 {
        (sections[2], n, false)
    } else {
        (sections[0], n, false)
    };

    if section.eq_ignore_ascii_case("General") {
        return format_general(value);
    }

    if is_date_format(section) {
        return format_date(value, section, date_system).unwrap_or_else(|| "#".repeat(8));
    }

    let rendered = format_numeric(value.abs(), section);
    if value < 0.0 && !explicit_sign && rendered.chars().any(|c| c.is_ascii_digit() && c != '0') {
        format!("-{}", rendered)
    } else {
        rendered
    }
}

/// Render any evaluated value with a format code.
pub fn format_value(value: &Value, code: &str, date_system: DateSystem) -> String {
    match value {
        Value::Number(n) => format_number(*n, code, date_system),
        Value::Text(s) => format_text(s, code),
        other => other.to_text(),
    }
}

/// Text for a text value under a format with a fourth section (`@` placeholder).
pub fn format_text(text: &str, code: &str) -> String {
    let sections = split_sections(code);
    match sections.get(3) {
        Some(section) => {
            let mut out = String::new();
            for piece in literal_pieces(section) {
                match piece {
                    Piece::Literal(s) => out.push_str(&s),
                    Piece::Pattern(p) if p.contains('@') => out.push_str(text),
                    Piece::Pattern(p) => out.push_str(&p),
                }
            }
            out
        }
        None => text.to_string(),
    }
}

fn split_sections(code: &str) -> Vec<&str> {
    let mut sections = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in code.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                sections.push(&code[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    sections.push(&code[start..]);
    sections
}

enum Piece {
    Literal(String),
    Pattern(String),
}

/// Split a section into literal text and format pattern characters.
/// Brackets (`[Red]`, `[>100]`), fill (`*x`) and padding (`_x`) are consumed.
fn literal_pieces(section: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut pattern = String::new();
    let mut literal = String::new();
    let mut chars = section.chars().peekable();

    let flush = |pattern: &mut String, literal: &mut String, pieces: &mut Vec<Piece>| {
        if !pattern.is_empty() {
            pieces.push(Piece::Pattern(std::mem::take(pattern)));
        }
        if !literal.is_empty() {
            pieces.push(Piece::Literal(std::mem::take(literal)));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                flush(&mut pattern, &mut literal, &mut pieces);
                for q in chars.by_ref() {
                    if q == '"' {
                        break;
                    }
                    literal.push(q);
                }
            }
            '\\' => {
                flush(&mut pattern, &mut literal, &mut pieces);
                if let Some(x) = chars.next() {
                    literal.push(x);
                }
            }
            '_' => {
                flush(&mut pattern, &mut literal, &mut pieces);
                chars.next();
                literal.push(' ');
            }
            '*' => {
                chars.next();
            }
            '[' => {
                // Elapsed-time brackets keep their content as pattern
                let mut inner = String::new();
                for b in chars.by_ref() {
                    if b == ']' {
                        break;
                    }
                    inner.push(b);
                }
                if inner.chars().all(|c| matches!(c.to_ascii_lowercase(), 'h' | 'm' | 's')) && !inner.is_empty() {
                    if !literal.is_empty() {
                        pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                    }
                    pattern.push_str(&inner);
                }
            }
            '$' | '-' | '+' | '(' | ')' | ' ' | ':' | '/' | '!' | '^' | '&' | '\'' | '~' | '{' | '}' | '<' | '>' | '=' => {
                if !pattern.is_empty() && matches!(c, ':' | '/' | ' ' | '-') && is_date_format(&pattern) {
                    pattern.push(c);
                } else if !pattern.is_empty() && (c == '-' || c == '+') && pattern.ends_with(['E', 'e']) {
                    pattern.push(c);
                } else {
                    if !pattern.is_empty() {
                        pieces.push(Piece::Pattern(std::mem::take(&mut pattern)));
                    }
                    literal.push(c);
                }
            }
            _ => {
                if !literal.is_empty() {
                    pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                }
                pattern.push(c);
            }
        }
    }
    flush(&mut pattern, &mut literal, &mut pieces);
    pieces
}

fn is_date_format(section: &str) -> bool {
    let mut in_quotes = false;
    let mut prev_backslash = false;
    let mut in_bracket = false;
    for c in section.chars() {
        if prev_backslash {
            prev_backslash = false;
            continue;
        }
        match c {
            '\\' => prev_backslash = true,
            '"' => in_quotes = !in_quotes,
            '[' if !in_quotes => in_bracket = true,
            ']' if !in_quotes => in_bracket = false,
            _ if in_quotes || in_bracket => {}
            'y' | 'Y' | 'd' | 'D' | 'h' | 'H' | 's' | 'S' | 'm' | 'M' => return true,
            _ => {}
        }
    }
    false
}

fn format_numeric(n: f64, section: &str) -> String {
    let mut out = String::new();
    let mut number_done = false;
    for piece in literal_pieces(section) {
        match piece {
            Piece::Literal(s) => out.push_str(&s),
            Piece::Pattern(p) if !number_done && p.contains(['0', '#', '?']) => {
                out.push_str(&render_digits(n, &p));
                number_done = true;
            }
            Piece::Pattern(p) => out.push_str(&p),
        }
    }
    out
}

fn render_digits(n: f64, pattern: &str) -> String {
    let percent_count = pattern.matches('%').count();
    let mut value = n;
    for _ in 0..percent_count {
        value *= 100.0;
    }

    if let Some(e_pos) = pattern.find(['E', 'e']) {
        let mantissa = &pattern[..e_pos];
        let decimals = mantissa.split('.').nth(1).map_or(0, |f| f.chars().filter(|c| matches!(c, '0' | '#' | '?')).count());
        let exp_digits = pattern[e_pos + 1..].chars().filter(|c| *c == '0').count().max(1);
        let formatted = format!("{:.*E}", decimals, value);
        let (m, e) = formatted.split_once('E').unwrap_or((&formatted, "0"));
        let exp: i32 = e.parse().unwrap_or(0);
        let sign = if exp < 0 { '-' } else { '+' };
        return format!("{}E{}{:0width$}", m, sign, exp.abs(), width = exp_digits);
    }

    let body: String = pattern.chars().filter(|c| *c != '%').collect();
    let (int_pat, frac_pat) = match body.split_once('.') {
        Some((i, f)) => (i, f),
        None => (body.as_str(), ""),
    };
    let thousands = int_pat.contains(',');
    let min_int = int_pat.chars().filter(|c| *c == '0').count();
    let max_frac = frac_pat.chars().filter(|c| matches!(c, '0' | '#' | '?')).count();
    let min_frac = frac_pat.chars().filter(|c| *c == '0').count();

    let rounded = format!("{:.*}", max_frac, value);
    let (int_digits, frac_digits) = match rounded.split_once('.') {
        Some((i, f)) => (i.to_string(), f.to_string()),
        None => (rounded.clone(), String::new()),
    };

    let mut int_digits = if int_digits == "0" && min_int == 0 { String::new() } else { int_digits };
    while int_digits.len() < min_int {
        int_digits.insert(0, '0');
    }
    if thousands {
        int_digits = group_thousands(&int_digits);
    }

    let mut frac_digits = frac_digits;
    while frac_digits.len() > min_frac && frac_digits.ends_with('0') {
        frac_digits.pop();
    }

    let mut out = int_digits;
    if !frac_digits.is_empty() {
        out.push('.');
        out.push_str(&frac_digits);
    }
    for _ in 0..percent_count {
        out.push('%');
    }
    out
}

fn group_thousands(digits: &str) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
enum DateTok {
    Year(usize),
    Month(usize),
    Minute(usize),
    Day(usize),
    Hour(usize),
    Second(usize),
    AmPm,
    Literal(String),
}

fn tokenize_date(section: &str) -> Vec<DateTok> {
    let mut toks = Vec::new();
    let chars: Vec<char> = section.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let lower = c.to_ascii_lowercase();
        let run = |i: usize| chars[i..].iter().take_while(|x| x.to_ascii_lowercase() == lower).count();
        match lower {
            'y' => {
                let n = run(i);
                toks.push(DateTok::Year(n));
                i += n;
            }
            'm' => {
                let n = run(i);
                toks.push(DateTok::Month(n));
                i += n;
            }
            'd' => {
                let n = run(i);
                toks.push(DateTok::Day(n));
                i += n;
            }
            'h' => {
                let n = run(i);
                toks.push(DateTok::Hour(n));
                i += n;
            }
            's' => {
                let n = run(i);
                toks.push(DateTok::Second(n));
                i += n;
            }
            'a' => {
                let rest: String = chars[i..].iter().collect();
                if rest.len() >= 5 && rest[..5].eq_ignore_ascii_case("AM/PM") {
                    toks.push(DateTok::AmPm);
                    i += 5;
                } else if rest.len() >= 3 && rest[..3].eq_ignore_ascii_case("A/P") {
                    toks.push(DateTok::AmPm);
                    i += 3;
                } else {
                    toks.push(DateTok::Literal(c.to_string()));
                    i += 1;
                }
            }
            '"' => {
                let mut lit = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    lit.push(chars[i]);
                    i += 1;
                }
                i += 1;
                toks.push(DateTok::Literal(lit));
            }
            '\\' => {
                if let Some(x) = chars.get(i + 1) {
                    toks.push(DateTok::Literal(x.to_string()));
                }
                i += 2;
            }
            '[' | ']' => i += 1,
            '.' if matches!(toks.last(), Some(DateTok::Second(_))) => {
                // Fractional seconds are not rendered
                i += 1;
                while i < chars.len() && chars[i] == '0' {
                    i += 1;
                }
            }
            _ => {
                toks.push(DateTok::Literal(c.to_string()));
                i += 1;
            }
        }
    }

    // `m` directly after an hour or directly before seconds means minutes
    let mut resolved = toks.clone();
    for idx in 0..toks.len() {
        if let DateTok::Month(n) = toks[idx] {
            if n > 2 {
                continue;
            }
            let prev = toks[..idx].iter().rev().find(|t| !matches!(t, DateTok::Literal(_)));
            let next = toks[idx + 1..].iter().find(|t| !matches!(t, DateTok::Literal(_)));
            if matches!(prev, Some(DateTok::Hour(_))) || matches!(next, Some(DateTok::Second(_))) {
                resolved[idx] = DateTok::Minute(n);
            }
        }
    }
    resolved
}

fn format_date(serial: f64, section: &str, date_system: DateSystem) -> Option<String> {
    let dt = serial_to_datetime(serial, date_system)?;
    let toks = tokenize_date(section);
    let twelve_hour = toks.contains(&DateTok::AmPm);
    let mut out = String::new();
    for tok in toks {
        match tok {
            DateTok::Year(n) if n <= 2 => out.push_str(&format!("{:02}", dt.year() % 100)),
            DateTok::Year(_) => out.push_str(&format!("{:04}", dt.year())),
            DateTok::Month(1) => out.push_str(&dt.month().to_string()),
            DateTok::Month(2) => out.push_str(&format!("{:02}", dt.month())),
            DateTok::Month(3) => out.push_str(&dt.format("%b").to_string()),
            DateTok::Month(5) => out.push_str(&dt.format("%b").to_string()[..1]),
            DateTok::Month(_) => out.push_str(&dt.format("%B").to_string()),
            DateTok::Day(1) => out.push_str(&dt.day().to_string()),
            DateTok::Day(2) => out.push_str(&format!("{:02}", dt.day())),
            DateTok::Day(3) => out.push_str(&dt.format("%a").to_string()),
            DateTok::Day(_) => out.push_str(&dt.format("%A").to_string()),
            DateTok::Hour(n) => {
                let mut h = dt.hour();
                if twelve_hour {
                    h %= 12;
                    if h == 0 {
                        h = 12;
                    }
                }
                if n >= 2 {
                    out.push_str(&format!("{:02}", h));
                } else {
                    out.push_str(&h.to_string());
                }
            }
            DateTok::Minute(n) => {
                if n >= 2 {
                    out.push_str(&format!("{:02}", dt.minute()));
                } else {
                    out.push_str(&dt.minute().to_string());
                }
            }
            DateTok::Second(n) => {
                if n >= 2 {
                    out.push_str(&format!("{:02}", dt.second()));
                } else {
                    out.push_str(&dt.second().to_string());
                }
            }
            DateTok::AmPm => out.push_str(if dt.hour() < 12 { "AM" } else { "PM" }),
            DateTok::Literal(s) => out.push_str(&s),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const D1900: DateSystem = DateSystem::Excel1900;

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, min, s).unwrap()
    }

    #[test]
    fn test_serial_round_trip() {
        assert_eq!(datetime_to_serial(dt(1900, 1, 1, 0, 0, 0), D1900), 1.0);
        assert_eq!(datetime_to_serial(dt(1900, 3, 1, 0, 0, 0), D1900), 61.0);
        assert_eq!(datetime_to_serial(dt(2024, 1, 15, 12, 0, 0), D1900), 45306.5);
        assert_eq!(serial_to_datetime(45306.5, D1900), Some(dt(2024, 1, 15, 12, 0, 0)));
        assert_eq!(serial_to_datetime(1.0, D1900), Some(dt(1900, 1, 1, 0, 0, 0)));
        assert_eq!(serial_to_datetime(-1.0, D1900), None);
    }

    #[test]
    fn test_1904_system() {
        let ds = DateSystem::Excel1904;
        assert_eq!(datetime_to_serial(dt(1904, 1, 2, 0, 0, 0), ds), 1.0);
        assert_eq!(serial_to_datetime(0.0, ds), Some(dt(1904, 1, 1, 0, 0, 0)));
    }

    #[test]
    fn test_numeric_formats() {
        assert_eq!(format_number(1234.567, "0", D1900), "1235");
        assert_eq!(format_number(1234.567, "0.00", D1900), "1234.57");
        assert_eq!(format_number(1234567.891, "#,##0.00", D1900), "1,234,567.89");
        assert_eq!(format_number(1234.0, "#,##0", D1900), "1,234");
        assert_eq!(format_number(0.256, "0%", D1900), "26%");
        assert_eq!(format_number(0.2567, "0.00%", D1900), "25.67%");
        assert_eq!(format_number(-5.0, "0.00", D1900), "-5.00");
        assert_eq!(format_number(12345.0, "0.00E+00", D1900), "1.23E+04");
    }

    #[test]
    fn test_sections_and_literals() {
        assert_eq!(format_number(-1234.0, "#,##0_);(#,##0)", D1900), "(1,234)");
        assert_eq!(format_number(1234.0, "#,##0_);(#,##0)", D1900), "1,234 ");
        assert_eq!(format_number(5.0, "$#,##0.00", D1900), "$5.00");
        assert_eq!(format_number(0.0, "0;-0;\"zero\"", D1900), "zero");
        assert_eq!(format_number(3.0, "0 \"units\"", D1900), "3 units");
    }

    #[test]
    fn test_general_passthrough() {
        assert_eq!(format_number(6.0, "General", D1900), "6");
        assert_eq!(format_number(2.5, "", D1900), "2.5");
    }

    #[test]
    fn test_date_formats() {
        let serial = datetime_to_serial(dt(2024, 3, 5, 14, 7, 9), D1900);
        assert_eq!(format_number(serial, "yyyy-mm-dd", D1900), "2024-03-05");
        assert_eq!(format_number(serial, "m/d/yyyy", D1900), "3/5/2024");
        assert_eq!(format_number(serial, "d-mmm-yy", D1900), "5-Mar-24");
        assert_eq!(format_number(serial, "h:mm:ss", D1900), "14:07:09");
        assert_eq!(format_number(serial, "h:mm AM/PM", D1900), "2:07 PM");
        assert_eq!(format_number(serial, "mmmm d, yyyy", D1900), "March 5, 2024");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(&Value::Number(0.5), "0%", D1900), "50%");
        assert_eq!(format_value(&Value::Boolean(true), "0.00", D1900), "TRUE");
        assert_eq!(format_value(&Value::Empty, "0.00", D1900), "");
    }

    #[test]
    fn test_text_section() {
        assert_eq!(format_text("abc", "0;0;0;\"[\"@\"]\""), "[abc]");
        assert_eq!(format_text("abc", "0.00"), "abc");
    }
}
