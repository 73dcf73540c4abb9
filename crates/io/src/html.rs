// HTML export (one-way)
//
// Each visible sheet becomes a heading and a <table>. Cell text is the
// formatted display value; styles, including any conditional format that
// matches, are inlined as CSS. Merges become colspan/rowspan. Hidden rows
// and columns are left out.

use std::fmt::Write;

use cellbook_engine::style::{Border, BorderStyle, FillPattern, HAlign, Style, Underline, VAlign};
use cellbook_engine::{Value, Workbook};
use log::debug;
use quick_xml::escape::escape;

use crate::error::{IoError, Result};

/// Pixels per character of column width, plus cell padding
const PX_PER_CHAR: f64 = 7.0;
const PX_PADDING: f64 = 5.0;

pub fn encode(workbook: &Workbook) -> Result<Vec<u8>> {
    let mut out = String::new();
    let title = workbook.metadata().title.clone().unwrap_or_else(|| "Workbook".to_string());

    out.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    writeln!(out, "<title>{}</title>", escape(title.as_str())).map_err(IoError::encode)?;
    out.push_str("</head>\n<body>\n");

    for (index, sheet) in workbook.sheets().iter().enumerate() {
        if sheet.hidden {
            continue;
        }
        write_sheet(&mut out, workbook, index).map_err(IoError::encode)?;
    }

    out.push_str("</body>\n</html>\n");
    debug!("HTML export: {} bytes", out.len());
    Ok(out.into_bytes())
}

fn write_sheet(out: &mut String, workbook: &Workbook, index: usize) -> std::fmt::Result {
    let Some(sheet) = workbook.sheet(index) else { return Ok(()) };
    writeln!(out, "<h2>{}</h2>", escape(sheet.name()))?;
    out.push_str("<table style=\"border-collapse:collapse\">\n");

    let (rows, cols) = sheet.extent();
    let rows = sheet.merged_regions().iter().fold(rows, |n, m| n.max(m.end.row + 1));
    let cols = sheet.merged_regions().iter().fold(cols, |n, m| n.max(m.end.col + 1));
    let visible_cols: Vec<usize> = (0..cols).filter(|&c| !sheet.is_col_hidden(c)).collect();

    if sheet.col_widths().keys().any(|&c| c < cols) {
        out.push_str("<colgroup>\n");
        for &col in &visible_cols {
            match sheet.col_width(col) {
                Some(width) => writeln!(out, "<col style=\"width:{}px\">", px(width))?,
                None => out.push_str("<col>\n"),
            }
        }
        out.push_str("</colgroup>\n");
    }

    for row in (0..rows).filter(|&r| !sheet.is_row_hidden(r)) {
        match sheet.row_height(row) {
            Some(height) => writeln!(out, "<tr style=\"height:{}pt\">", height)?,
            None => out.push_str("<tr>\n"),
        }
        for &col in &visible_cols {
            let mut span = String::new();
            if let Some(merge) = sheet.merge_at(row, col) {
                if (merge.start.row, merge.start.col) != (row, col) {
                    continue;
                }
                let colspan = (merge.start.col..=merge.end.col).filter(|&c| !sheet.is_col_hidden(c)).count();
                let rowspan = (merge.start.row..=merge.end.row).filter(|&r| !sheet.is_row_hidden(r)).count();
                if colspan > 1 {
                    write!(span, " colspan=\"{}\"", colspan)?;
                }
                if rowspan > 1 {
                    write!(span, " rowspan=\"{}\"", rowspan)?;
                }
            }

            let style = workbook.effective_style(index, row, col);
            let numeric = matches!(workbook.value(index, row, col), Value::Number(_));
            let css = css(&style, numeric);
            if css.is_empty() {
                write!(out, "<td{}>", span)?;
            } else {
                write!(out, "<td{} style=\"{}\">", span, css)?;
            }

            let text = escape(workbook.display(index, row, col).as_str()).replace('\n', "<br>");
            match sheet.cell(row, col).and_then(|c| c.hyperlink.as_deref()) {
                Some(url) => write!(out, "<a href=\"{}\">{}</a>", escape(url), text)?,
                None => out.push_str(&text),
            }
            out.push_str("</td>\n");
        }
        out.push_str("</tr>\n");
    }

    out.push_str("</table>\n");
    Ok(())
}

fn px(width: f64) -> f64 {
    (width * PX_PER_CHAR + PX_PADDING).round()
}

/// Inline CSS for the parts of `style` that differ from the default
pub(crate) fn css(style: &Style, numeric: bool) -> String {
    let default = Style::default();
    let mut rules: Vec<String> = Vec::new();

    let font = &style.font;
    if font.name != default.font.name {
        rules.push(format!("font-family:'{}'", font.name.replace('\'', "")));
    }
    if font.size != default.font.size {
        rules.push(format!("font-size:{}pt", font.size));
    }
    if font.bold {
        rules.push("font-weight:bold".into());
    }
    if font.italic {
        rules.push("font-style:italic".into());
    }
    let mut decoration = Vec::new();
    if font.underline != Underline::None {
        decoration.push("underline");
    }
    if font.strikethrough {
        decoration.push("line-through");
    }
    if !decoration.is_empty() {
        rules.push(format!("text-decoration:{}", decoration.join(" ")));
    }
    if let Some(color) = font.color {
        rules.push(format!("color:{}", color.to_hex()));
    }

    let fill = &style.fill;
    let background = match fill.pattern {
        FillPattern::None => None,
        FillPattern::Solid => fill.fg_color.or(fill.bg_color),
        _ => fill.bg_color.or(fill.fg_color),
    };
    if let Some(color) = background {
        rules.push(format!("background-color:{}", color.to_hex()));
    }

    for (side, border) in [
        ("top", &style.borders.top),
        ("right", &style.borders.right),
        ("bottom", &style.borders.bottom),
        ("left", &style.borders.left),
    ] {
        if let Some(rule) = border_css(border) {
            rules.push(format!("border-{}:{}", side, rule));
        }
    }

    let align = &style.alignment;
    let horizontal = match align.horizontal {
        HAlign::General if numeric => Some("right"),
        HAlign::General => None,
        HAlign::Left | HAlign::Fill => Some("left"),
        HAlign::Center | HAlign::CenterAcross => Some("center"),
        HAlign::Right => Some("right"),
        HAlign::Justify => Some("justify"),
    };
    if let Some(h) = horizontal {
        rules.push(format!("text-align:{}", h));
    }
    let vertical = match align.vertical {
        VAlign::Top => Some("top"),
        VAlign::Center | VAlign::Justify => Some("middle"),
        VAlign::Bottom => None,
    };
    if let Some(v) = vertical {
        rules.push(format!("vertical-align:{}", v));
    }
    if align.wrap_text {
        rules.push("white-space:pre-wrap".into());
    }
    if align.indent > 0 {
        rules.push(format!("padding-left:{}px", align.indent as u32 * 9));
    }

    rules.join(";")
}

fn border_css(border: &Border) -> Option<String> {
    let kind = match border.style {
        BorderStyle::None => return None,
        BorderStyle::Thin => "1px solid",
        BorderStyle::Medium => "2px solid",
        BorderStyle::Thick => "3px solid",
        BorderStyle::Dashed => "1px dashed",
        BorderStyle::Dotted | BorderStyle::Hair => "1px dotted",
        BorderStyle::Double => "3px double",
    };
    let color = border.color.map_or_else(|| "#000000".to_string(), |c| c.to_hex());
    Some(format!("{} {}", kind, color))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellbook_core::CellRange;
    use cellbook_engine::conditional::{Comparison, ConditionalRule, Operand, StyleOverride};
    use cellbook_engine::style::{Color, Fill};

    fn render(wb: &Workbook) -> String {
        String::from_utf8(encode(wb).unwrap()).unwrap()
    }

    #[test]
    fn test_escapes_text() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "<b>Fish & Chips</b>").unwrap();
        let html = render(&wb);
        assert!(html.contains("&lt;b&gt;Fish &amp; Chips&lt;/b&gt;"));
        assert!(!html.contains("<b>Fish"));
    }

    #[test]
    fn test_merge_spans_and_covered_cells() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "Title").unwrap();
        wb.set_value(0, 1, 2, "x").unwrap();
        wb.sheet_mut(0).unwrap().merge(CellRange::from_coords(0, 0, 1, 1)).unwrap();
        let html = render(&wb);
        assert!(html.contains("<td colspan=\"2\" rowspan=\"2\">Title</td>"));
        // Row 1: only C2 remains after the covered A2:B2
        let second_row = html.split("<tr>").nth(2).unwrap();
        assert_eq!(second_row.matches("<td").count(), 1);
    }

    #[test]
    fn test_inline_styles() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "Head").unwrap();
        wb.set_value(0, 0, 1, "12").unwrap();
        let mut style = Style::default();
        style.font.bold = true;
        style.fill = Fill::solid(Color::YELLOW);
        wb.set_style(0, &CellRange::cell(0, 0), style).unwrap();
        let html = render(&wb);
        assert!(html.contains("font-weight:bold;background-color:#FFFF00"));
        assert!(html.contains("<td style=\"text-align:right\">12</td>"));
    }

    #[test]
    fn test_conditional_format_applied() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "5").unwrap();
        wb.set_value(0, 1, 0, "50").unwrap();
        let rule = ConditionalRule::new(
            Comparison::GreaterThan,
            vec![Operand::Number(10.0)],
            StyleOverride::font_color(Color::RED),
        );
        wb.sheet_mut(0)
            .unwrap()
            .add_conditional_format(CellRange::from_coords(0, 0, 1, 0), vec![rule])
            .unwrap();
        let html = render(&wb);
        assert!(html.contains("color:#FF0000;text-align:right\">50<"));
        assert!(html.contains("<td style=\"text-align:right\">5</td>"));
    }

    #[test]
    fn test_hidden_sheets_and_rows_skipped() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "shown").unwrap();
        wb.set_value(0, 1, 0, "secret row").unwrap();
        wb.sheet_mut(0).unwrap().set_row_hidden(1, true);
        wb.add_sheet("Hidden").unwrap();
        wb.set_value(1, 0, 0, "secret sheet").unwrap();
        wb.sheet_mut(1).unwrap().hidden = true;
        let html = render(&wb);
        assert!(html.contains("shown"));
        assert!(!html.contains("secret"));
        assert!(!html.contains("<h2>Hidden</h2>"));
    }
}
