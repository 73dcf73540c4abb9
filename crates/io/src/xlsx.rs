//! XLSX export via rust_xlsxwriter.
//!
//! Formulas are written with their last computed result so viewers that do
//! not recalculate still show values. Dates become serial numbers in the
//! 1900 system with a date format when the cell has none.
//!
//! Not written: split panes, outline groups, workbook structure locks, and
//! password hashes on sheet protection (the sheet is still protected).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cellbook_config::DateSystem;
use cellbook_core::CellRange;
use cellbook_engine::conditional::{Comparison, ConditionalRule, Operand, StyleOverride};
use cellbook_engine::drawing::{ChartKind, LegendPosition};
use cellbook_engine::layout::{Orientation, Pane};
use cellbook_engine::number_format::datetime_to_serial;
use cellbook_engine::style::{
    Border, BorderStyle, DiagonalDirection, FillPattern, HAlign, Style, Underline, VAlign,
};
use cellbook_engine::{CellValue, NameScope, Sheet, StyleId, Value, Workbook};
use log::{debug, warn};
use rust_xlsxwriter::{
    Chart, ChartLegendPosition, ChartType, Color, ConditionalFormatCell, ConditionalFormatCellRule,
    DocProperties, Format, FormatAlign, FormatBorder, FormatDiagonalBorder, FormatPattern,
    FormatUnderline, Formula as XlsxFormula, Image, Note, Table, TableColumn, TableStyle, Url,
    Workbook as XlsxWorkbook, Worksheet,
};

use crate::error::{IoError, Result};

const DATE_FORMAT: &str = "yyyy-mm-dd";
const DATETIME_FORMAT: &str = "yyyy-mm-dd hh:mm:ss";

/// Shared flag for stopping a long export from another thread.
///
/// Clones observe the same flag. The exporter checks it between sheets and
/// between rows and returns [`IoError::Cancelled`] once it is set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(IoError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub fn encode(workbook: &Workbook) -> Result<Vec<u8>> {
    encode_cancellable(workbook, &CancelToken::new())
}

pub fn encode_cancellable(workbook: &Workbook, cancel: &CancelToken) -> Result<Vec<u8>> {
    let mut xlsx = XlsxWorkbook::new();
    xlsx.set_properties(&doc_properties(workbook));
    let mut formats = FormatCache::default();

    for (index, sheet) in workbook.sheets().iter().enumerate() {
        cancel.check()?;
        let worksheet = xlsx.add_worksheet();
        worksheet.set_name(sheet.name()).map_err(IoError::encode)?;
        write_sheet(worksheet, workbook, index, sheet, &mut formats, cancel)?;
    }
    cancel.check()?;

    define_names(&mut xlsx, workbook)?;
    if let Ok(worksheet) = xlsx.worksheet_from_index(workbook.active_sheet_index()) {
        worksheet.set_active(true);
    }
    if workbook.workbook_protection().lock_structure {
        warn!("workbook structure lock is not written to xlsx");
    }

    let bytes = xlsx.save_to_buffer().map_err(IoError::encode)?;
    debug!(
        "xlsx export: {} sheets, {} formats, {} bytes",
        workbook.sheet_count(),
        formats.len(),
        bytes.len()
    );
    Ok(bytes)
}

fn doc_properties(workbook: &Workbook) -> DocProperties {
    let meta = workbook.metadata();
    let mut props = DocProperties::new();
    if let Some(title) = &meta.title {
        props = props.set_title(title);
    }
    if let Some(subject) = &meta.subject {
        props = props.set_subject(subject);
    }
    if let Some(author) = &meta.author {
        props = props.set_author(author);
    }
    if let Some(keywords) = &meta.keywords {
        props = props.set_keywords(keywords);
    }
    if let Some(comments) = &meta.comments {
        props = props.set_comment(comments);
    }
    props
}

fn define_names(xlsx: &mut XlsxWorkbook, workbook: &Workbook) -> Result<()> {
    for name in workbook.named_ranges().iter() {
        let Some(target) = workbook.sheet_by_id(name.sheet) else { continue };
        let refers_to = format!("={}", name.range.clone().with_sheet(target.name()).to_absolute_string());
        let defined = match name.scope {
            NameScope::Workbook => name.name.clone(),
            NameScope::Sheet(id) => match workbook.sheet_by_id(id) {
                Some(owner) => format!("{}!{}", cellbook_core::format_sheet_name(owner.name()), name.name),
                None => continue,
            },
        };
        xlsx.define_name(defined.as_str(), &refers_to).map_err(IoError::encode)?;
    }
    Ok(())
}

// ============================================================================
// Sheets
// ============================================================================

fn write_sheet(
    ws: &mut Worksheet,
    workbook: &Workbook,
    index: usize,
    sheet: &Sheet,
    formats: &mut FormatCache,
    cancel: &CancelToken,
) -> Result<()> {
    let date_system = workbook.config().date_system;

    // Merges first; the origin cell is written over the placeholder below
    for merge in sheet.merged_regions() {
        let format = formats.get(workbook, style_id(sheet, merge.start.row, merge.start.col), None);
        ws.merge_range(
            merge.start.row as u32,
            merge.start.col as u16,
            merge.end.row as u32,
            merge.end.col as u16,
            "",
            &format,
        )
        .map_err(IoError::encode)?;
    }

    let mut current_row = None;
    for ((row, col), cell) in sheet.iter_cells() {
        if current_row != Some(row) {
            cancel.check()?;
            current_row = Some(row);
        }
        if sheet.merge_at(row, col).is_some_and(|m| (m.start.row, m.start.col) != (row, col)) {
            continue;
        }
        let (r, c) = (row as u32, col as u16);

        let date_default = match &cell.value {
            CellValue::Date(dt) if dt.time() == chrono::NaiveTime::MIN => Some(DATE_FORMAT),
            CellValue::Date(_) => Some(DATETIME_FORMAT),
            _ => None,
        };
        let format = formats.get(workbook, cell.style, date_default);

        if let Some(url) = &cell.hyperlink {
            let text = workbook.display(index, row, col);
            // In-workbook targets are stored as `#Sheet2!A1`
            let target = match url.strip_prefix('#') {
                Some(location) => format!("internal:{}", location),
                None => url.clone(),
            };
            let link = if text.is_empty() { Url::new(target) } else { Url::new(target).set_text(text.as_str()) };
            ws.write_url_with_format(r, c, link, &format).map_err(IoError::encode)?;
        } else {
            match &cell.value {
                CellValue::Empty => {
                    if !cell.style.is_default() {
                        ws.write_blank(r, c, &format).map_err(IoError::encode)?;
                    }
                }
                CellValue::Number(n) => {
                    ws.write_number_with_format(r, c, *n, &format).map_err(IoError::encode)?;
                }
                CellValue::Text(s) => {
                    ws.write_string_with_format(r, c, s.as_str(), &format).map_err(IoError::encode)?;
                }
                CellValue::Boolean(b) => {
                    ws.write_boolean_with_format(r, c, *b, &format).map_err(IoError::encode)?;
                }
                CellValue::Date(dt) => {
                    let serial = datetime_to_serial(*dt, DateSystem::Excel1900);
                    ws.write_number_with_format(r, c, serial, &format).map_err(IoError::encode)?;
                }
                CellValue::Formula(f) => {
                    let result = match cell.computed_value(date_system) {
                        Value::Empty => String::new(),
                        Value::Boolean(true) => "TRUE".to_string(),
                        Value::Boolean(false) => "FALSE".to_string(),
                        _ => workbook.display(index, row, col),
                    };
                    let formula = XlsxFormula::new(f.source.as_str()).set_result(result);
                    ws.write_formula_with_format(r, c, formula, &format).map_err(IoError::encode)?;
                }
            }
        }

        if let Some(comment) = &cell.comment {
            let mut note = Note::new(comment.content.as_str())
                .set_visible(comment.visible)
                .add_author_prefix(false);
            if !comment.author.is_empty() {
                note = note.set_author(comment.author.as_str());
            }
            ws.insert_note(r, c, &note).map_err(IoError::encode)?;
        }
    }

    write_layout(ws, sheet)?;
    write_print_setup(ws, sheet)?;
    write_tables(ws, workbook, index, sheet)?;
    write_conditional_formats(ws, sheet)?;
    write_drawings(ws, sheet)?;

    if sheet.protection().is_some() {
        ws.protect();
    }
    if let Some(color) = sheet.tab_color {
        ws.set_tab_color(Color::RGB(color.to_u32()));
    }
    if sheet.hidden {
        ws.set_hidden(true);
    }
    Ok(())
}

fn style_id(sheet: &Sheet, row: usize, col: usize) -> StyleId {
    sheet.cell(row, col).map(|c| c.style).unwrap_or_default()
}

fn write_layout(ws: &mut Worksheet, sheet: &Sheet) -> Result<()> {
    for (&col, &width) in sheet.col_widths() {
        ws.set_column_width(col as u16, width).map_err(IoError::encode)?;
    }
    for (&row, &height) in sheet.row_heights() {
        ws.set_row_height(row as u32, height).map_err(IoError::encode)?;
    }
    for col in sheet.hidden_cols() {
        ws.set_column_hidden(col as u16).map_err(IoError::encode)?;
    }
    for row in sheet.hidden_rows() {
        ws.set_row_hidden(row as u32).map_err(IoError::encode)?;
    }

    match sheet.pane() {
        Some(Pane::Frozen { cols, rows, left_col, top_row }) => {
            ws.set_freeze_panes(*rows as u32, *cols as u16).map_err(IoError::encode)?;
            if (*top_row, *left_col) != (*rows, *cols) {
                ws.set_freeze_panes_top_cell(*top_row as u32, *left_col as u16).map_err(IoError::encode)?;
            }
        }
        Some(Pane::Split { .. }) => warn!("{}: split panes are not written to xlsx", sheet.name()),
        None => {}
    }
    if !sheet.row_outline().is_empty() || !sheet.col_outline().is_empty() {
        warn!("{}: outline groups are not written to xlsx", sheet.name());
    }
    Ok(())
}

fn write_print_setup(ws: &mut Worksheet, sheet: &Sheet) -> Result<()> {
    let setup = sheet.print_setup();
    if setup.is_default() {
        return Ok(());
    }
    if setup.orientation == Orientation::Landscape {
        ws.set_landscape();
    }
    ws.set_paper_size(setup.paper.code());
    if let Some((wide, tall)) = setup.fit_to {
        ws.set_print_fit_to_pages(wide, tall);
    } else if setup.scale != 100 {
        ws.set_print_scale(setup.scale);
    }
    let m = &setup.margins;
    ws.set_margins(m.left, m.right, m.top, m.bottom, m.header, m.footer);
    if !setup.header.is_empty() {
        ws.set_header(&setup.header.to_code());
    }
    if !setup.footer.is_empty() {
        ws.set_footer(&setup.footer.to_code());
    }
    if let Some(area) = &setup.print_area {
        ws.set_print_area(area.start.row as u32, area.start.col as u16, area.end.row as u32, area.end.col as u16)
            .map_err(IoError::encode)?;
    }
    if let Some((first, last)) = setup.repeat_rows {
        ws.set_repeat_rows(first as u32, last as u32).map_err(IoError::encode)?;
    }
    if let Some((first, last)) = setup.repeat_cols {
        ws.set_repeat_columns(first as u16, last as u16).map_err(IoError::encode)?;
    }
    if !setup.row_breaks.is_empty() {
        let breaks: Vec<u32> = setup.row_breaks.iter().map(|&r| r as u32).collect();
        ws.set_page_breaks(&breaks).map_err(IoError::encode)?;
    }
    if !setup.col_breaks.is_empty() {
        let breaks: Vec<u32> = setup.col_breaks.iter().map(|&c| c as u32).collect();
        ws.set_vertical_page_breaks(&breaks).map_err(IoError::encode)?;
    }
    ws.set_print_black_and_white(setup.black_and_white);
    ws.set_print_gridlines(setup.gridlines);
    Ok(())
}

fn write_tables(ws: &mut Worksheet, workbook: &Workbook, index: usize, sheet: &Sheet) -> Result<()> {
    for named in workbook.named_tables().iter().filter(|t| t.sheet == sheet.id()) {
        let range = &named.range;
        let columns: Vec<TableColumn> = (range.start.col..=range.end.col)
            .enumerate()
            .map(|(i, col)| {
                let header = if named.header_row { workbook.display(index, range.start.row, col) } else { String::new() };
                let header = if header.is_empty() { format!("Column{}", i + 1) } else { header };
                TableColumn::new().set_header(header.as_str())
            })
            .collect();

        let mut table = Table::new()
            .set_name(named.name.as_str())
            .set_header_row(named.header_row)
            .set_autofilter(named.show_filter && named.header_row)
            .set_columns(&columns);
        if let Some(style) = &named.style {
            match table_style(style) {
                Some(s) => table = table.set_style(s),
                None => warn!("table '{}': style '{}' not written", named.name, style),
            }
        }
        ws.add_table(range.start.row as u32, range.start.col as u16, range.end.row as u32, range.end.col as u16, &table)
            .map_err(IoError::encode)?;
    }
    Ok(())
}

fn table_style(name: &str) -> Option<TableStyle> {
    let style = match name {
        "None" | "TableStyleNone" => TableStyle::None,
        "TableStyleLight1" => TableStyle::Light1,
        "TableStyleLight8" => TableStyle::Light8,
        "TableStyleLight9" => TableStyle::Light9,
        "TableStyleLight15" => TableStyle::Light15,
        "TableStyleMedium1" => TableStyle::Medium1,
        "TableStyleMedium2" => TableStyle::Medium2,
        "TableStyleMedium9" => TableStyle::Medium9,
        "TableStyleMedium15" => TableStyle::Medium15,
        "TableStyleDark1" => TableStyle::Dark1,
        "TableStyleDark9" => TableStyle::Dark9,
        _ => return None,
    };
    Some(style)
}

macro_rules! cell_rule {
    ($cmp:expr, $a:expr, $b:expr) => {
        match $cmp {
            Comparison::LessThan => ConditionalFormatCellRule::LessThan($a),
            Comparison::LessThanOrEqual => ConditionalFormatCellRule::LessThanOrEqualTo($a),
            Comparison::GreaterThan => ConditionalFormatCellRule::GreaterThan($a),
            Comparison::GreaterThanOrEqual => ConditionalFormatCellRule::GreaterThanOrEqualTo($a),
            Comparison::Equal => ConditionalFormatCellRule::EqualTo($a),
            Comparison::NotEqual => ConditionalFormatCellRule::NotEqualTo($a),
            Comparison::Between => ConditionalFormatCellRule::Between($a, $b),
            Comparison::NotBetween => ConditionalFormatCellRule::NotBetween($a, $b),
        }
    };
}

fn write_conditional_formats(ws: &mut Worksheet, sheet: &Sheet) -> Result<()> {
    for cf in sheet.conditional_formats() {
        let range = &cf.range;
        for rule in &cf.rules {
            let Some(conditional) = conditional_cell(rule) else {
                warn!("{}: conditional rule on {} has too few operands", sheet.name(), range);
                continue;
            };
            ws.add_conditional_format(
                range.start.row as u32,
                range.start.col as u16,
                range.end.row as u32,
                range.end.col as u16,
                &conditional,
            )
            .map_err(IoError::encode)?;
        }
    }
    Ok(())
}

fn conditional_cell(rule: &ConditionalRule) -> Option<ConditionalFormatCell> {
    let arity = rule.comparison.arity();
    if rule.operands.len() < arity {
        return None;
    }
    let format = override_format(&rule.style);
    let numbers: Option<Vec<f64>> = rule
        .operands
        .iter()
        .map(|op| match op {
            Operand::Number(n) => Some(*n),
            Operand::Text(_) => None,
        })
        .collect();

    let conditional = match numbers {
        Some(n) => {
            let (a, b) = (n[0], n.get(1).copied().unwrap_or(n[0]));
            ConditionalFormatCell::new().set_rule(cell_rule!(rule.comparison, a, b))
        }
        None => {
            let text: Vec<String> = rule
                .operands
                .iter()
                .map(|op| match op {
                    Operand::Number(n) => n.to_string(),
                    Operand::Text(s) => s.clone(),
                })
                .collect();
            let a = text[0].as_str();
            let b = text.get(1).map_or(a, |s| s.as_str());
            ConditionalFormatCell::new().set_rule(cell_rule!(rule.comparison, a, b))
        }
    };
    Some(conditional.set_format(&format))
}

fn override_format(style: &StyleOverride) -> Format {
    let mut format = Format::new();
    if style.bold == Some(true) {
        format = format.set_bold();
    }
    if style.italic == Some(true) {
        format = format.set_italic();
    }
    match style.underline {
        Some(Underline::Single) => format = format.set_underline(FormatUnderline::Single),
        Some(Underline::Double) => format = format.set_underline(FormatUnderline::Double),
        _ => {}
    }
    if style.strikethrough == Some(true) {
        format = format.set_font_strikethrough();
    }
    if let Some(color) = style.font_color {
        format = format.set_font_color(Color::RGB(color.to_u32()));
    }
    if let Some(color) = style.fill_color {
        format = format.set_background_color(Color::RGB(color.to_u32()));
    }
    if let Some(border) = &style.border {
        if let Some(b) = format_border(border.style) {
            format = format.set_border(b);
            if let Some(color) = border.color {
                format = format.set_border_color(Color::RGB(color.to_u32()));
            }
        }
    }
    if let Some(code) = &style.number_format {
        format = format.set_num_format(code);
    }
    format
}

fn write_drawings(ws: &mut Worksheet, sheet: &Sheet) -> Result<()> {
    for image in sheet.images() {
        let a = &image.anchor;
        let mut xl_image = Image::new_from_buffer(&image.data).map_err(IoError::encode)?;
        if let Some(text) = &image.description {
            xl_image = xl_image.set_alt_text(text);
        }
        if a.width > 0 && a.height > 0 {
            xl_image = xl_image.set_scale_to_size(a.width, a.height, false);
        }
        ws.insert_image_with_offset(a.row as u32, a.col as u16, &xl_image, a.x_offset, a.y_offset)
            .map_err(IoError::encode)?;
    }

    for chart in sheet.charts() {
        let kind = match chart.kind {
            ChartKind::Line => ChartType::Line,
            ChartKind::Column => ChartType::Column,
            ChartKind::Bar => ChartType::Bar,
            ChartKind::Pie => ChartType::Pie,
            ChartKind::Scatter => ChartType::Scatter,
            ChartKind::Area => ChartType::Area,
        };
        let mut xl_chart = Chart::new(kind);
        for series in &chart.series {
            let values = qualified(&series.values, sheet);
            let s = xl_chart.add_series();
            s.set_values(values.as_str());
            if let Some(categories) = &series.categories {
                s.set_categories(qualified(categories, sheet).as_str());
            }
            if let Some(title) = &series.title {
                s.set_name(title.as_str());
            }
        }
        if let Some(title) = &chart.title {
            xl_chart.title().set_name(title.as_str());
        }
        match chart.legend {
            LegendPosition::Right => {}
            LegendPosition::Left => {
                xl_chart.legend().set_position(ChartLegendPosition::Left);
            }
            LegendPosition::Top => {
                xl_chart.legend().set_position(ChartLegendPosition::Top);
            }
            LegendPosition::Bottom => {
                xl_chart.legend().set_position(ChartLegendPosition::Bottom);
            }
            LegendPosition::Hidden => {
                xl_chart.legend().set_hidden();
            }
        }
        let a = &chart.anchor;
        if a.width > 0 && a.height > 0 {
            xl_chart.set_width(a.width).set_height(a.height);
        }
        ws.insert_chart_with_offset(a.row as u32, a.col as u16, &xl_chart, a.x_offset, a.y_offset)
            .map_err(IoError::encode)?;
    }
    Ok(())
}

/// Chart ranges always need a sheet name in xlsx
fn qualified(range: &CellRange, sheet: &Sheet) -> String {
    match range.sheet {
        Some(_) => range.to_absolute_string(),
        None => range.clone().with_sheet(sheet.name()).to_absolute_string(),
    }
}

// ============================================================================
// Formats
// ============================================================================

/// One rust_xlsxwriter format per (style, implied date format) pair
#[derive(Default)]
struct FormatCache {
    formats: HashMap<(StyleId, Option<&'static str>), Format>,
}

impl FormatCache {
    fn get(&mut self, workbook: &Workbook, id: StyleId, date_default: Option<&'static str>) -> Format {
        self.formats
            .entry((id, date_default))
            .or_insert_with(|| build_format(workbook.styles().get(id), date_default))
            .clone()
    }

    fn len(&self) -> usize {
        self.formats.len()
    }
}

fn build_format(style: &Style, date_default: Option<&str>) -> Format {
    let mut format = Format::new();
    let default = Style::default();

    let font = &style.font;
    if font.name != default.font.name {
        format = format.set_font_name(font.name.as_str());
    }
    if font.size != default.font.size {
        format = format.set_font_size(font.size.into_inner());
    }
    if font.bold {
        format = format.set_bold();
    }
    if font.italic {
        format = format.set_italic();
    }
    match font.underline {
        Underline::None => {}
        Underline::Single => format = format.set_underline(FormatUnderline::Single),
        Underline::Double => format = format.set_underline(FormatUnderline::Double),
    }
    if font.strikethrough {
        format = format.set_font_strikethrough();
    }
    if let Some(color) = font.color {
        format = format.set_font_color(Color::RGB(color.to_u32()));
    }

    let fill = &style.fill;
    match fill.pattern {
        FillPattern::None => {}
        FillPattern::Solid => {
            if let Some(color) = fill.fg_color.or(fill.bg_color) {
                format = format.set_background_color(Color::RGB(color.to_u32()));
            }
        }
        pattern => {
            format = format.set_pattern(match pattern {
                FillPattern::Gray50 => FormatPattern::MediumGray,
                FillPattern::Gray25 => FormatPattern::LightGray,
                FillPattern::Gray125 => FormatPattern::Gray125,
                FillPattern::HorizontalStripe => FormatPattern::DarkHorizontal,
                FillPattern::VerticalStripe => FormatPattern::DarkVertical,
                FillPattern::DiagonalStripe => FormatPattern::DarkDown,
                _ => FormatPattern::DarkGrid,
            });
            if let Some(color) = fill.fg_color {
                format = format.set_foreground_color(Color::RGB(color.to_u32()));
            }
            if let Some(color) = fill.bg_color {
                format = format.set_background_color(Color::RGB(color.to_u32()));
            }
        }
    }

    let borders = &style.borders;
    if let Some((b, color)) = side(&borders.top) {
        format = format.set_border_top(b);
        if let Some(c) = color {
            format = format.set_border_top_color(c);
        }
    }
    if let Some((b, color)) = side(&borders.bottom) {
        format = format.set_border_bottom(b);
        if let Some(c) = color {
            format = format.set_border_bottom_color(c);
        }
    }
    if let Some((b, color)) = side(&borders.left) {
        format = format.set_border_left(b);
        if let Some(c) = color {
            format = format.set_border_left_color(c);
        }
    }
    if let Some((b, color)) = side(&borders.right) {
        format = format.set_border_right(b);
        if let Some(c) = color {
            format = format.set_border_right_color(c);
        }
    }
    let diagonal = match borders.diagonal_direction {
        DiagonalDirection::None => None,
        DiagonalDirection::Up => Some(FormatDiagonalBorder::BorderUp),
        DiagonalDirection::Down => Some(FormatDiagonalBorder::BorderDown),
        DiagonalDirection::Both => Some(FormatDiagonalBorder::BorderUpDown),
    };
    if let (Some(kind), Some((b, color))) = (diagonal, side(&borders.diagonal)) {
        format = format.set_border_diagonal(b).set_border_diagonal_type(kind);
        if let Some(c) = color {
            format = format.set_border_diagonal_color(c);
        }
    }

    let align = &style.alignment;
    let horizontal = match align.horizontal {
        HAlign::General => None,
        HAlign::Left => Some(FormatAlign::Left),
        HAlign::Center => Some(FormatAlign::Center),
        HAlign::Right => Some(FormatAlign::Right),
        HAlign::Fill => Some(FormatAlign::Fill),
        HAlign::Justify => Some(FormatAlign::Justify),
        HAlign::CenterAcross => Some(FormatAlign::CenterAcross),
    };
    if let Some(h) = horizontal {
        format = format.set_align(h);
    }
    let vertical = match align.vertical {
        VAlign::Top => Some(FormatAlign::Top),
        VAlign::Center => Some(FormatAlign::VerticalCenter),
        VAlign::Justify => Some(FormatAlign::VerticalJustify),
        VAlign::Bottom => None,
    };
    if let Some(v) = vertical {
        format = format.set_align(v);
    }
    if align.wrap_text {
        format = format.set_text_wrap();
    }
    if align.indent > 0 {
        format = format.set_indent(align.indent);
    }
    if align.rotation != 0 {
        format = format.set_rotation(align.rotation);
    }

    if style.number_format != "General" {
        format = format.set_num_format(style.number_format.as_str());
    } else if let Some(code) = date_default {
        format = format.set_num_format(code);
    }
    format
}

fn side(border: &Border) -> Option<(FormatBorder, Option<Color>)> {
    format_border(border.style).map(|b| (b, border.color.map(|c| Color::RGB(c.to_u32()))))
}

fn format_border(style: BorderStyle) -> Option<FormatBorder> {
    Some(match style {
        BorderStyle::None => return None,
        BorderStyle::Thin => FormatBorder::Thin,
        BorderStyle::Medium => FormatBorder::Medium,
        BorderStyle::Thick => FormatBorder::Thick,
        BorderStyle::Dashed => FormatBorder::Dashed,
        BorderStyle::Dotted => FormatBorder::Dotted,
        BorderStyle::Double => FormatBorder::Double,
        BorderStyle::Hair => FormatBorder::Hair,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellbook_engine::style::{Color as CellColor, Fill};
    use std::io::{Cursor, Read};

    fn part(bytes: &[u8], name: &str) -> String {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut file = archive.by_name(name).unwrap();
        let mut out = String::new();
        file.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_export_values_and_formula_results() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "10").unwrap();
        wb.set_value(0, 0, 1, "label").unwrap();
        wb.set_formula(0, 1, 0, "=A1*2").unwrap();

        let bytes = encode(&wb).unwrap();
        let sheet = part(&bytes, "xl/worksheets/sheet1.xml");
        assert!(sheet.contains("<f>A1*2</f>"));
        assert!(sheet.contains("<v>20</v>"));
        assert!(part(&bytes, "xl/sharedStrings.xml").contains("label"));
    }

    #[test]
    fn test_export_sheet_names_and_names() {
        let mut wb = Workbook::new();
        wb.add_sheet("Data").unwrap();
        wb.set_value(1, 0, 0, "1").unwrap();
        wb.define_name("Total", "Data!A1", NameScope::Workbook).unwrap();

        let bytes = encode(&wb).unwrap();
        let book = part(&bytes, "xl/workbook.xml");
        assert!(book.contains("name=\"Sheet1\""));
        assert!(book.contains("name=\"Data\""));
        assert!(book.contains("Data!$A$1"));
    }

    #[test]
    fn test_export_merges_and_styles() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "Title").unwrap();
        let mut style = Style::default();
        style.font.bold = true;
        style.fill = Fill::solid(CellColor::YELLOW);
        wb.set_style(0, &CellRange::cell(0, 0), style).unwrap();
        wb.sheet_mut(0).unwrap().merge(CellRange::from_coords(0, 0, 0, 2)).unwrap();

        let bytes = encode(&wb).unwrap();
        assert!(part(&bytes, "xl/worksheets/sheet1.xml").contains("<mergeCell ref=\"A1:C1\"/>"));
        let styles = part(&bytes, "xl/styles.xml");
        assert!(styles.contains("<b/>"));
        assert!(styles.contains("FFFFFF00"));
    }

    #[test]
    fn test_export_dates_get_date_format() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "2024-03-15").unwrap();
        let bytes = encode(&wb).unwrap();
        assert!(part(&bytes, "xl/styles.xml").contains("yyyy-mm-dd"));
        assert!(part(&bytes, "xl/worksheets/sheet1.xml").contains("<v>45366</v>"));
    }

    #[test]
    fn test_cancelled_export() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "x").unwrap();
        let token = CancelToken::new();
        let observer = token.clone();
        token.cancel();
        assert!(observer.is_cancelled());
        assert!(matches!(encode_cancellable(&wb, &observer), Err(IoError::Cancelled)));
    }
}
