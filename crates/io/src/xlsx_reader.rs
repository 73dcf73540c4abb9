//! XLSX import: the zip container's SpreadsheetML parts read with quick-xml.
//!
//! Read: values, formulas (shared formulas expanded), styles, merges,
//! column widths, row heights, hidden rows and columns, outline levels,
//! panes, hyperlinks, comments, sheet protection, tab colors, print setup,
//! defined names, tables, cell-value conditional formats and document
//! properties. Drawings are skipped with a warning.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use cellbook_config::{DateSystem, EngineConfig, Limits};
use cellbook_core::{letters_to_col, CellAddr, CellRange};
use cellbook_engine::conditional::{Comparison, ConditionalRule, Operand, StyleOverride};
use cellbook_engine::formula::adjust::relocate_expr;
use cellbook_engine::formula::parser::{bind_expr, format_expr, parse};
use cellbook_engine::layout::{HeaderFooter, Orientation, Pane, PaperSize};
use cellbook_engine::protection::SheetProtection;
use cellbook_engine::{CellError, CellValue, Comment, EngineError, Formula, NameScope, StyleId, Workbook};
use chrono::{DateTime, NaiveDateTime};
use log::{debug, info, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{IoError, Result};
use crate::xlsx_styles::{attr, parse_color, parse_styles, StyleSheet};
use crate::xml::push_general_ref;

type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

pub fn decode(bytes: &[u8], config: &EngineConfig) -> Result<Workbook> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(IoError::corrupt)?;
    let book_xml = read_part(&mut archive, "xl/workbook.xml")?
        .ok_or_else(|| IoError::corrupt("missing xl/workbook.xml"))?;
    let book = parse_workbook(&book_xml)?;
    if book.sheets.is_empty() {
        return Err(IoError::corrupt("workbook has no sheets"));
    }
    let rels = match read_part(&mut archive, "xl/_rels/workbook.xml.rels")? {
        Some(xml) => parse_rels(&xml)?,
        None => Vec::new(),
    };
    let shared = match read_part(&mut archive, "xl/sharedStrings.xml")? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };
    let stylesheet = match read_part(&mut archive, "xl/styles.xml")? {
        Some(xml) => parse_styles(&xml)?,
        None => StyleSheet::default(),
    };

    let mut config = config.clone();
    if book.date1904 {
        info!("xlsx uses the 1904 date system");
        config.date_system = DateSystem::Excel1904;
    }
    let mut workbook = Workbook::with_config(config.clone());
    let style_ids: Vec<StyleId> = stylesheet
        .cell_styles
        .iter()
        .map(|s| workbook.styles_mut().intern(s.clone()))
        .collect();

    // Every sheet exists before any formula is read so cross-sheet references bind
    let mut indices = Vec::with_capacity(book.sheets.len());
    for (i, entry) in book.sheets.iter().enumerate() {
        let index = crate::open_sheet(&mut workbook, i, &entry.name)?;
        if let Some(sheet) = workbook.sheet_mut(index) {
            sheet.hidden = entry.hidden;
        }
        indices.push(index);
    }

    let ctx = Context { shared: &shared, styles: &style_ids, dxfs: &stylesheet.dxfs, limits: config.limits };
    let mut cells = 0;
    for (entry, &index) in book.sheets.iter().zip(&indices) {
        let Some(path) = rels.iter().find(|r| r.id == entry.rel_id).map(|r| resolve_target("xl", &r.target)) else {
            warn!("sheet '{}' has no worksheet part; left empty", entry.name);
            continue;
        };
        let Some(xml) = read_part(&mut archive, &path)? else {
            warn!("sheet '{}': {} is missing; left empty", entry.name, path);
            continue;
        };
        let sheet_rels = match read_part(&mut archive, &rels_path(&path))? {
            Some(xml) => parse_rels(&xml)?,
            None => Vec::new(),
        };

        let parts = SheetReader::new(&ctx, &mut workbook, index).read(&xml)?;
        cells += parts.cells;
        if parts.has_drawing {
            warn!("{}: images and charts are not imported", entry.name);
        }
        expand_shared_formulas(&mut workbook, index, &parts.shared)?;
        apply_links(&mut workbook, index, &parts.links, &sheet_rels)?;

        let dir = parent_dir(&path);
        for rel in &sheet_rels {
            if rel.kind.ends_with("/comments") {
                if let Some(xml) = read_part(&mut archive, &resolve_target(dir, &rel.target))? {
                    apply_comments(&mut workbook, index, &xml)?;
                }
            } else if rel.kind.ends_with("/table") {
                if let Some(xml) = read_part(&mut archive, &resolve_target(dir, &rel.target))? {
                    apply_table(&mut workbook, index, &xml)?;
                }
            }
        }
    }

    apply_names(&mut workbook, &book.names, &indices);
    if let Some(xml) = read_part(&mut archive, "docProps/core.xml")? {
        apply_properties(&mut workbook, &xml)?;
    }
    if book.lock_structure {
        let mut protection = workbook.workbook_protection().clone();
        protection.lock_structure = true;
        protection.password_hash = book.workbook_password;
        workbook.set_workbook_protection(protection);
    }
    if let Some(&active) = indices.get(book.active_tab) {
        workbook.set_active_sheet(active)?;
    }

    let report = workbook.rebuild();
    debug!("xlsx import: {} sheets, {} cells, {}", workbook.sheet_count(), cells, report.summary());
    Ok(workbook)
}

fn read_part(archive: &mut Archive<'_>, path: &str) -> Result<Option<String>> {
    let mut file = match archive.by_name(path) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(IoError::corrupt(format!("{}: {}", path, e))),
    };
    let mut xml = String::new();
    file.read_to_string(&mut xml).map_err(|e| IoError::corrupt(format!("{}: {}", path, e)))?;
    Ok(Some(xml))
}

/// `xl/worksheets/sheet1.xml` -> `xl/worksheets/_rels/sheet1.xml.rels`
fn rels_path(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{}/_rels/{}.rels", dir, file),
        None => format!("_rels/{}.rels", part),
    }
}

fn parent_dir(part: &str) -> &str {
    part.rsplit_once('/').map_or("", |(dir, _)| dir)
}

/// Resolve a relationship target against the directory of its source part
fn resolve_target(base_dir: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut parts: Vec<&str> = base_dir.split('/').filter(|p| !p.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Runs `on_event` for every event; text and entity references inside
/// elements are handed over already joined per text node.
fn for_each_event<F>(xml: &str, mut on_event: F) -> Result<()>
where
    F: FnMut(Node<'_, '_>) -> Result<()>,
{
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| IoError::corrupt(format!("XML error at {}: {}", reader.buffer_position(), e)))?;
        match &event {
            Event::Start(e) => on_event(Node::Start(e, false))?,
            Event::Empty(e) => on_event(Node::Start(e, true))?,
            Event::End(e) => on_event(Node::End(e.local_name().as_ref()))?,
            Event::Text(e) => on_event(Node::Text(&String::from_utf8_lossy(e.as_ref())))?,
            Event::CData(e) => on_event(Node::Text(&String::from_utf8_lossy(e.as_ref())))?,
            Event::GeneralRef(e) => {
                let mut text = String::new();
                push_general_ref(&mut text, e);
                on_event(Node::Text(&text))?
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

enum Node<'e, 'b> {
    /// Element start; `true` when self-closing
    Start(&'e BytesStart<'b>, bool),
    End(&'e [u8]),
    Text(&'e str),
}

fn local(e: &BytesStart<'_>) -> Vec<u8> {
    e.local_name().as_ref().to_vec()
}

fn is_true(value: Option<String>) -> bool {
    matches!(value.as_deref(), Some("1") | Some("true"))
}

fn parse_num<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

// ============================================================================
// Workbook-level parts
// ============================================================================

struct SheetEntry {
    name: String,
    rel_id: String,
    hidden: bool,
}

struct DefinedName {
    name: String,
    local_sheet: Option<usize>,
    target: String,
}

#[derive(Default)]
struct BookInfo {
    sheets: Vec<SheetEntry>,
    names: Vec<DefinedName>,
    date1904: bool,
    active_tab: usize,
    lock_structure: bool,
    workbook_password: Option<u16>,
}

fn parse_workbook(xml: &str) -> Result<BookInfo> {
    let mut book = BookInfo::default();
    let mut pending: Option<DefinedName> = None;
    for_each_event(xml, |node| {
        match node {
            Node::Start(e, empty) => match local(e).as_slice() {
                b"sheet" => book.sheets.push(SheetEntry {
                    name: attr(e, b"name").unwrap_or_default(),
                    rel_id: attr(e, b"id").unwrap_or_default(),
                    hidden: matches!(attr(e, b"state").as_deref(), Some("hidden") | Some("veryHidden")),
                }),
                b"workbookPr" => book.date1904 = is_true(attr(e, b"date1904")),
                b"workbookView" => book.active_tab = parse_num(attr(e, b"activeTab")).unwrap_or(0),
                b"workbookProtection" => {
                    book.lock_structure = is_true(attr(e, b"lockStructure"));
                    book.workbook_password =
                        attr(e, b"workbookPassword").and_then(|h| u16::from_str_radix(&h, 16).ok());
                }
                b"definedName" if !empty => {
                    pending = Some(DefinedName {
                        name: attr(e, b"name").unwrap_or_default(),
                        local_sheet: parse_num(attr(e, b"localSheetId")),
                        target: String::new(),
                    })
                }
                _ => {}
            },
            Node::Text(text) => {
                if let Some(name) = pending.as_mut() {
                    name.target.push_str(text);
                }
            }
            Node::End(b"definedName") => book.names.extend(pending.take()),
            Node::End(_) => {}
        }
        Ok(())
    })?;
    Ok(book)
}

struct Relationship {
    id: String,
    target: String,
    kind: String,
    external: bool,
}

fn parse_rels(xml: &str) -> Result<Vec<Relationship>> {
    let mut rels = Vec::new();
    for_each_event(xml, |node| {
        if let Node::Start(e, _) = node {
            if local(e) == b"Relationship" {
                rels.push(Relationship {
                    id: attr(e, b"Id").unwrap_or_default(),
                    target: attr(e, b"Target").unwrap_or_default(),
                    kind: attr(e, b"Type").unwrap_or_default(),
                    external: attr(e, b"TargetMode").as_deref() == Some("External"),
                });
            }
        }
        Ok(())
    })?;
    Ok(rels)
}

/// Shared string table; rich-text runs are flattened, phonetic runs dropped
fn parse_shared_strings(xml: &str) -> Result<Vec<String>> {
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    let mut in_phonetic = false;
    for_each_event(xml, |node| {
        match node {
            Node::Start(e, empty) => match local(e).as_slice() {
                b"si" => {
                    if empty {
                        strings.push(String::new());
                    } else {
                        current = Some(String::new());
                    }
                }
                b"rPh" => in_phonetic = !empty,
                b"t" => in_text = !empty && !in_phonetic,
                _ => {}
            },
            Node::Text(text) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(text);
                }
            }
            Node::End(b"t") => in_text = false,
            Node::End(b"rPh") => in_phonetic = false,
            Node::End(b"si") => strings.extend(current.take()),
            _ => {}
        }
        Ok(())
    })?;
    Ok(strings)
}

fn apply_names(workbook: &mut Workbook, names: &[DefinedName], indices: &[usize]) {
    for name in names {
        let local_index = name.local_sheet.and_then(|i| indices.get(i).copied());
        let target = name.target.trim().trim_start_matches('=');

        if let Some(builtin) = name.name.strip_prefix("_xlnm.") {
            let Some(index) = local_index else { continue };
            let applied = match builtin {
                "Print_Area" => set_print_area(workbook, index, target),
                "Print_Titles" => set_print_titles(workbook, index, target),
                _ => true,
            };
            if !applied {
                warn!("ignoring {} '{}'", name.name, target);
            }
            continue;
        }

        let scope = match local_index.and_then(|i| workbook.sheet(i)) {
            Some(sheet) => NameScope::Sheet(sheet.id()),
            None => NameScope::Workbook,
        };
        if let Err(err) = workbook.define_name(&name.name, target, scope) {
            warn!("dropping name '{}' ({}): {}", name.name, target, err);
        }
    }
}

fn unqualified(target: &str) -> &str {
    target.rsplit_once('!').map_or(target, |(_, r)| r)
}

fn set_print_area(workbook: &mut Workbook, index: usize, target: &str) -> bool {
    // Only the first area of a multi-area print range is kept
    let first = target.split(',').next().unwrap_or(target);
    match workbook.sheet_mut(index) {
        Some(sheet) => sheet.set_print_area(unqualified(first)).is_ok(),
        None => false,
    }
}

/// `Sheet1!$1:$2,Sheet1!$A:$B`
fn set_print_titles(workbook: &mut Workbook, index: usize, target: &str) -> bool {
    let Some(sheet) = workbook.sheet_mut(index) else { return false };
    let mut applied = false;
    for part in target.split(',') {
        let Some((a, b)) = unqualified(part).split_once(':') else { continue };
        let (a, b) = (a.trim_start_matches('$'), b.trim_start_matches('$'));
        if let (Ok(first), Ok(last)) = (a.parse::<usize>(), b.parse::<usize>()) {
            if first >= 1 && last >= first {
                sheet.print_setup_mut().repeat_rows = Some((first - 1, last - 1));
                applied = true;
            }
        } else if let (Some(first), Some(last)) = (letters_to_col(a), letters_to_col(b)) {
            sheet.print_setup_mut().repeat_cols = Some((first, last));
            applied = true;
        }
    }
    applied
}

fn apply_properties(workbook: &mut Workbook, xml: &str) -> Result<()> {
    let mut field: Option<Vec<u8>> = None;
    let mut text = String::new();
    let mut values: Vec<(Vec<u8>, String)> = Vec::new();
    for_each_event(xml, |node| {
        match node {
            Node::Start(e, false) => {
                field = Some(local(e));
                text.clear();
            }
            Node::Text(t) => text.push_str(t),
            Node::End(name) => {
                if field.as_deref() == Some(name) {
                    values.push((name.to_vec(), text.trim().to_string()));
                }
                field = None;
            }
            _ => {}
        }
        Ok(())
    })?;

    let meta = workbook.metadata_mut();
    for (name, value) in values {
        if value.is_empty() {
            continue;
        }
        match name.as_slice() {
            b"title" => meta.title = Some(value),
            b"subject" => meta.subject = Some(value),
            b"creator" => meta.author = Some(value),
            b"keywords" => meta.keywords = Some(value),
            b"description" => meta.comments = Some(value),
            b"created" => meta.created = parse_w3c_datetime(&value),
            b"modified" => meta.modified = parse_w3c_datetime(&value),
            b"lastPrinted" => meta.last_printed = parse_w3c_datetime(&value),
            _ => {}
        }
    }
    Ok(())
}

fn parse_w3c_datetime(value: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.naive_utc())
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

// ============================================================================
// Worksheets
// ============================================================================

struct Context<'a> {
    shared: &'a [String],
    styles: &'a [StyleId],
    dxfs: &'a [StyleOverride],
    limits: Limits,
}

#[derive(Clone, Copy, PartialEq)]
enum Capture {
    None,
    Value,
    Formula,
    Inline,
    Header,
    Footer,
    Condition,
}

#[derive(Default)]
struct PendingCell {
    row: usize,
    col: usize,
    kind: Option<String>,
    style: usize,
    value: String,
    inline: String,
    formula: Option<String>,
    shared_index: Option<String>,
}

struct SharedFormula {
    row: usize,
    col: usize,
    index: String,
    /// Master cells carry the formula text; followers are empty
    source: Option<String>,
}

struct PendingLink {
    row: usize,
    col: usize,
    rel_id: Option<String>,
    location: Option<String>,
}

#[derive(Default)]
struct SheetParts {
    cells: usize,
    shared: Vec<SharedFormula>,
    links: Vec<PendingLink>,
    has_drawing: bool,
}

struct PendingConditional {
    ranges: Vec<CellRange>,
    rules: Vec<(u32, ConditionalRule)>,
    rule: Option<(u32, Comparison, StyleOverride)>,
    operands: Vec<Operand>,
}

struct SheetReader<'a, 'w> {
    ctx: &'a Context<'a>,
    workbook: &'w mut Workbook,
    index: usize,
    parts: SheetParts,
    next_row: usize,
    next_col: usize,
    cell: Option<PendingCell>,
    capture: Capture,
    text: String,
    in_inline: bool,
    in_row_breaks: bool,
    fit_to_page: bool,
    conditional: Option<PendingConditional>,
}

impl<'a, 'w> SheetReader<'a, 'w> {
    fn new(ctx: &'a Context<'a>, workbook: &'w mut Workbook, index: usize) -> Self {
        Self {
            ctx,
            workbook,
            index,
            parts: SheetParts::default(),
            next_row: 0,
            next_col: 0,
            cell: None,
            capture: Capture::None,
            text: String::new(),
            in_inline: false,
            in_row_breaks: true,
            fit_to_page: false,
            conditional: None,
        }
    }

    fn read(mut self, xml: &str) -> Result<SheetParts> {
        for_each_event(xml, |node| match node {
            Node::Start(e, empty) => self.start(e, empty),
            Node::End(name) => self.end(name),
            Node::Text(text) => {
                if self.capture != Capture::None {
                    self.text.push_str(text);
                }
                Ok(())
            }
        })?;
        Ok(self.parts)
    }

    fn sheet(&mut self) -> Result<&mut cellbook_engine::Sheet> {
        let index = self.index;
        self.workbook
            .sheet_mut(index)
            .ok_or_else(|| IoError::corrupt("sheet index out of range"))
    }

    fn check(&self, row: usize, col: usize) -> Result<()> {
        if row >= self.ctx.limits.max_rows || col >= self.ctx.limits.max_cols {
            return Err(EngineError::OutOfBounds { row, col }.into());
        }
        Ok(())
    }

    fn begin_capture(&mut self, capture: Capture, empty: bool) {
        self.text.clear();
        self.capture = if empty { Capture::None } else { capture };
    }

    fn start(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<()> {
        match local(e).as_slice() {
            b"tabColor" => {
                let color = parse_color(e);
                self.sheet()?.tab_color = color;
            }
            b"pageSetUpPr" => self.fit_to_page = is_true(attr(e, b"fitToPage")),
            b"pane" => self.pane(e)?,
            b"col" => self.column(e)?,
            b"row" => {
                let row = match parse_num::<usize>(attr(e, b"r")) {
                    Some(r) if r >= 1 => r - 1,
                    _ => self.next_row,
                };
                self.check(row, 0)?;
                self.next_row = row + 1;
                self.next_col = 0;
                let custom_height = is_true(attr(e, b"customHeight"));
                let height = parse_num::<f64>(attr(e, b"ht"));
                let hidden = is_true(attr(e, b"hidden"));
                let level = parse_num::<u8>(attr(e, b"outlineLevel")).unwrap_or(0);
                let sheet = self.sheet()?;
                if let (true, Some(h)) = (custom_height, height) {
                    sheet.set_row_height(row, h);
                }
                if hidden {
                    sheet.set_row_hidden(row, true);
                }
                if level > 0 {
                    sheet.set_row_outline_level(row, level);
                }
            }
            b"c" => {
                let (row, col) = match attr(e, b"r").and_then(|r| CellAddr::parse(&r).ok()) {
                    Some(addr) => (addr.row, addr.col),
                    None => (self.next_row.saturating_sub(1), self.next_col),
                };
                self.check(row, col)?;
                self.next_col = col + 1;
                self.cell = Some(PendingCell {
                    row,
                    col,
                    kind: attr(e, b"t"),
                    style: parse_num(attr(e, b"s")).unwrap_or(0),
                    ..PendingCell::default()
                });
                if empty {
                    self.finish_cell()?;
                }
            }
            b"v" if self.cell.is_some() => self.begin_capture(Capture::Value, empty),
            b"f" if self.cell.is_some() => {
                if let Some(cell) = self.cell.as_mut() {
                    if attr(e, b"t").as_deref() == Some("shared") {
                        cell.shared_index = attr(e, b"si");
                    }
                    cell.formula = Some(String::new());
                }
                self.begin_capture(Capture::Formula, empty);
            }
            b"is" if self.cell.is_some() => self.in_inline = !empty,
            b"rPh" => self.in_inline = false,
            b"t" if self.in_inline => self.begin_capture(Capture::Inline, empty),
            b"mergeCell" => {
                if let Some(range) = attr(e, b"ref").and_then(|r| CellRange::parse(&r).ok()) {
                    if let Err(err) = self.sheet()?.merge(range) {
                        warn!("skipping merge: {}", err);
                    }
                }
            }
            b"hyperlink" => {
                if let Some(addr) = attr(e, b"ref").and_then(|r| CellRange::parse(&r).ok()) {
                    self.parts.links.push(PendingLink {
                        row: addr.start.row,
                        col: addr.start.col,
                        rel_id: attr(e, b"id"),
                        location: attr(e, b"location"),
                    });
                }
            }
            b"sheetProtection" => {
                if is_true(attr(e, b"sheet")) {
                    let protection = sheet_protection(e);
                    self.sheet()?.set_protection(Some(protection));
                }
            }
            b"pageMargins" => {
                let sheet = self.sheet()?;
                let m = &mut sheet.print_setup_mut().margins;
                let get = |key: &[u8], default: f64| parse_num(attr(e, key)).unwrap_or(default);
                m.left = get(b"left", m.left);
                m.right = get(b"right", m.right);
                m.top = get(b"top", m.top);
                m.bottom = get(b"bottom", m.bottom);
                m.header = get(b"header", m.header);
                m.footer = get(b"footer", m.footer);
            }
            b"pageSetup" => self.page_setup(e)?,
            b"printOptions" => {
                let gridlines = is_true(attr(e, b"gridLines"));
                self.sheet()?.print_setup_mut().gridlines = gridlines;
            }
            b"oddHeader" => self.begin_capture(Capture::Header, empty),
            b"oddFooter" => self.begin_capture(Capture::Footer, empty),
            b"rowBreaks" => self.in_row_breaks = true,
            b"colBreaks" => self.in_row_breaks = false,
            b"brk" => {
                if let Some(id) = parse_num::<usize>(attr(e, b"id")) {
                    let in_rows = self.in_row_breaks;
                    let setup = self.sheet()?.print_setup_mut();
                    if in_rows {
                        setup.row_breaks.push(id);
                    } else {
                        setup.col_breaks.push(id);
                    }
                }
            }
            b"conditionalFormatting" => {
                let ranges = attr(e, b"sqref")
                    .unwrap_or_default()
                    .split_whitespace()
                    .filter_map(|r| CellRange::parse(r).ok())
                    .collect();
                self.conditional = Some(PendingConditional {
                    ranges,
                    rules: Vec::new(),
                    rule: None,
                    operands: Vec::new(),
                });
            }
            b"cfRule" => self.cf_rule(e, empty),
            b"formula" if self.conditional.as_ref().is_some_and(|c| c.rule.is_some()) => {
                self.begin_capture(Capture::Condition, empty)
            }
            b"drawing" => self.parts.has_drawing = true,
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, name: &[u8]) -> Result<()> {
        match name {
            b"v" | b"f" | b"t" | b"oddHeader" | b"oddFooter" | b"formula" => self.end_capture()?,
            b"is" => self.in_inline = false,
            b"c" => self.finish_cell()?,
            b"cfRule" => {
                if let Some(pending) = self.conditional.as_mut() {
                    if let Some((priority, comparison, style)) = pending.rule.take() {
                        let operands = std::mem::take(&mut pending.operands);
                        if operands.len() >= comparison.arity() {
                            pending.rules.push((priority, ConditionalRule::new(comparison, operands, style)));
                        }
                    }
                }
            }
            b"conditionalFormatting" => {
                if let Some(mut pending) = self.conditional.take() {
                    pending.rules.sort_by_key(|(priority, _)| *priority);
                    let rules: Vec<ConditionalRule> = pending.rules.into_iter().map(|(_, r)| r).collect();
                    if !rules.is_empty() {
                        for range in pending.ranges {
                            if let Err(err) = self.sheet()?.add_conditional_format(range, rules.clone()) {
                                warn!("skipping conditional format: {}", err);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn end_capture(&mut self) -> Result<()> {
        let text = std::mem::take(&mut self.text);
        match std::mem::replace(&mut self.capture, Capture::None) {
            Capture::None => {}
            Capture::Value => {
                if let Some(cell) = self.cell.as_mut() {
                    cell.value.push_str(&text);
                }
            }
            Capture::Formula => {
                if let Some(cell) = self.cell.as_mut() {
                    cell.formula = Some(text);
                }
            }
            Capture::Inline => {
                if let Some(cell) = self.cell.as_mut() {
                    cell.inline.push_str(&text);
                }
            }
            Capture::Header => self.sheet()?.print_setup_mut().header = parse_header_footer(&text),
            Capture::Footer => self.sheet()?.print_setup_mut().footer = parse_header_footer(&text),
            Capture::Condition => {
                if let Some(pending) = self.conditional.as_mut() {
                    pending.operands.push(parse_operand(&text));
                }
            }
        }
        Ok(())
    }

    fn finish_cell(&mut self) -> Result<()> {
        let Some(pending) = self.cell.take() else { return Ok(()) };
        let literal = match pending.kind.as_deref() {
            Some("s") => {
                let index: usize = pending
                    .value
                    .trim()
                    .parse()
                    .map_err(|_| IoError::corrupt(format!("invalid shared string index '{}'", pending.value)))?;
                let text = self
                    .ctx
                    .shared
                    .get(index)
                    .ok_or_else(|| IoError::corrupt(format!("shared string {} out of range", index)))?;
                CellValue::Text(text.clone())
            }
            Some("inlineStr") => CellValue::Text(pending.inline.clone()),
            Some("str") => CellValue::Text(pending.value.clone()),
            Some("b") => CellValue::Boolean(pending.value.trim() == "1"),
            Some("e") => match CellError::from_code(pending.value.trim()) {
                Some(_) => CellValue::Formula(Formula::new(pending.value.trim())),
                None => CellValue::Text(pending.value.clone()),
            },
            Some("d") => match parse_w3c_datetime(pending.value.trim()) {
                Some(dt) => CellValue::Date(dt),
                None => CellValue::Text(pending.value.clone()),
            },
            _ if pending.value.trim().is_empty() => CellValue::Empty,
            _ => pending
                .value
                .trim()
                .parse()
                .map(CellValue::Number)
                .map_err(|_| IoError::corrupt(format!("invalid number '{}'", pending.value)))?,
        };

        let value = match &pending.formula {
            Some(source) if !source.trim().is_empty() => CellValue::Formula(Formula::new(source.trim())),
            _ => literal,
        };
        if let Some(index) = pending.shared_index {
            let source = pending.formula.filter(|s| !s.trim().is_empty());
            self.parts.shared.push(SharedFormula { row: pending.row, col: pending.col, index, source });
        }

        let style = self.ctx.styles.get(pending.style).copied().unwrap_or_default();
        if value.is_empty() && style.is_default() {
            return Ok(());
        }
        let cell = self.sheet()?.cell_mut_or_create(pending.row, pending.col);
        cell.value = value;
        cell.style = style;
        self.parts.cells += 1;
        Ok(())
    }

    fn column(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let (Some(min), Some(max)) = (parse_num::<usize>(attr(e, b"min")), parse_num::<usize>(attr(e, b"max"))) else {
            return Ok(());
        };
        if min == 0 || max < min {
            return Ok(());
        }
        let max = max.min(self.ctx.limits.max_cols);
        let width = parse_num::<f64>(attr(e, b"width")).filter(|_| is_true(attr(e, b"customWidth")));
        let hidden = is_true(attr(e, b"hidden"));
        let level = parse_num::<u8>(attr(e, b"outlineLevel")).unwrap_or(0);
        let sheet = self.sheet()?;
        for col in (min - 1)..max {
            if let Some(w) = width {
                sheet.set_col_width(col, character_width(w));
            }
            if hidden {
                sheet.set_col_hidden(col, true);
            }
            if level > 0 {
                sheet.set_col_outline_level(col, level);
            }
        }
        Ok(())
    }

    fn pane(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let x = parse_num::<f64>(attr(e, b"xSplit")).unwrap_or(0.0);
        let y = parse_num::<f64>(attr(e, b"ySplit")).unwrap_or(0.0);
        let top_left = attr(e, b"topLeftCell").and_then(|r| CellAddr::parse(&r).ok());
        let pane = match attr(e, b"state").as_deref() {
            Some("frozen") | Some("frozenSplit") => {
                let (cols, rows) = (x as usize, y as usize);
                Pane::Frozen {
                    cols,
                    rows,
                    left_col: top_left.map_or(cols, |a| a.col),
                    top_row: top_left.map_or(rows, |a| a.row),
                }
            }
            // Split offsets are stored in twentieths of a point
            _ => Pane::Split {
                x: x / 20.0,
                y: y / 20.0,
                left_col: top_left.map_or(0, |a| a.col),
                top_row: top_left.map_or(0, |a| a.row),
            },
        };
        self.sheet()?.set_pane(Some(pane));
        Ok(())
    }

    fn page_setup(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let fit_to_page = self.fit_to_page;
        let setup = self.sheet()?.print_setup_mut();
        if attr(e, b"orientation").as_deref() == Some("landscape") {
            setup.orientation = Orientation::Landscape;
        }
        if let Some(paper) = parse_num::<u8>(attr(e, b"paperSize")).and_then(PaperSize::from_code) {
            setup.paper = paper;
        }
        if let Some(scale) = parse_num::<u16>(attr(e, b"scale")) {
            setup.scale = scale.clamp(10, 400);
        }
        if fit_to_page {
            let wide = parse_num(attr(e, b"fitToWidth")).unwrap_or(1);
            let tall = parse_num(attr(e, b"fitToHeight")).unwrap_or(1);
            setup.fit_to = Some((wide, tall));
        }
        setup.black_and_white = is_true(attr(e, b"blackAndWhite"));
        Ok(())
    }

    fn cf_rule(&mut self, e: &BytesStart<'_>, empty: bool) {
        let Some(pending) = self.conditional.as_mut() else { return };
        if attr(e, b"type").as_deref() != Some("cellIs") {
            warn!("conditional rule type '{}' is not imported", attr(e, b"type").unwrap_or_default());
            return;
        }
        let comparison = match attr(e, b"operator").as_deref() {
            Some("lessThan") => Comparison::LessThan,
            Some("lessThanOrEqual") => Comparison::LessThanOrEqual,
            Some("greaterThan") => Comparison::GreaterThan,
            Some("greaterThanOrEqual") => Comparison::GreaterThanOrEqual,
            Some("equal") => Comparison::Equal,
            Some("notEqual") => Comparison::NotEqual,
            Some("between") => Comparison::Between,
            Some("notBetween") => Comparison::NotBetween,
            other => {
                warn!("conditional operator '{}' is not imported", other.unwrap_or_default());
                return;
            }
        };
        let style = parse_num::<usize>(attr(e, b"dxfId"))
            .and_then(|i| self.ctx.dxfs.get(i).cloned())
            .unwrap_or_default();
        let priority = parse_num(attr(e, b"priority")).unwrap_or(u32::MAX);
        pending.operands.clear();
        if !empty {
            pending.rule = Some((priority, comparison, style));
        }
    }
}

/// Column width as stored (with cell padding) to the character count shown
fn character_width(stored: f64) -> f64 {
    if stored <= 1.0 {
        return stored;
    }
    ((stored * 7.0 - 5.0) / 7.0 * 100.0).round() / 100.0
}

fn sheet_protection(e: &BytesStart<'_>) -> SheetProtection {
    // Attributes name what is locked; "0" lifts the lock
    let allowed = |key: &[u8]| matches!(attr(e, key).as_deref(), Some("0") | Some("false"));
    let locked = |key: &[u8]| is_true(attr(e, key));
    SheetProtection {
        password_hash: attr(e, b"password").and_then(|h| u16::from_str_radix(&h, 16).ok()),
        select_locked_cells: !locked(b"selectLockedCells"),
        select_unlocked_cells: !locked(b"selectUnlockedCells"),
        format_cells: allowed(b"formatCells"),
        insert_rows: allowed(b"insertRows"),
        insert_columns: allowed(b"insertColumns"),
        delete_rows: allowed(b"deleteRows"),
        delete_columns: allowed(b"deleteColumns"),
        sort: allowed(b"sort"),
    }
}

/// `&Lleft&Ccenter&Rright`; text before any section code is centered
fn parse_header_footer(code: &str) -> HeaderFooter {
    let mut hf = HeaderFooter::default();
    let mut section = 'C';
    let mut rest = code;
    while !rest.is_empty() {
        let marker = ["&L", "&C", "&R"].iter().filter_map(|m| rest.find(m).map(|i| (i, *m))).min();
        let (text, next) = match marker {
            Some((i, m)) => (&rest[..i], Some((m, &rest[i + 2..]))),
            None => (rest, None),
        };
        let target = match section {
            'L' => &mut hf.left,
            'R' => &mut hf.right,
            _ => &mut hf.center,
        };
        target.push_str(text);
        match next {
            Some((m, after)) => {
                section = m.chars().nth(1).unwrap_or('C');
                rest = after;
            }
            None => break,
        }
    }
    hf
}

/// Condition formula text as a literal operand
fn parse_operand(formula: &str) -> Operand {
    let formula = formula.trim();
    if let Ok(n) = formula.parse::<f64>() {
        return Operand::Number(n);
    }
    match formula.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(text) => Operand::Text(text.replace("\"\"", "\"")),
        None => {
            debug!("conditional operand '{}' kept as text", formula);
            Operand::Text(formula.to_string())
        }
    }
}

/// Give followers of a shared formula the master's text moved by their offset
fn expand_shared_formulas(workbook: &mut Workbook, index: usize, shared: &[SharedFormula]) -> Result<()> {
    if shared.is_empty() {
        return Ok(());
    }
    let masters: HashMap<&str, (usize, usize, &str)> = shared
        .iter()
        .filter_map(|s| s.source.as_deref().map(|src| (s.index.as_str(), (s.row, s.col, src))))
        .collect();

    let mut sources = Vec::new();
    {
        let book: &Workbook = workbook;
        for follower in shared.iter().filter(|s| s.source.is_none()) {
            let Some(&(row, col, src)) = masters.get(follower.index.as_str()) else {
                warn!("shared formula {} has no master cell", follower.index);
                continue;
            };
            let parsed = match parse(&format!("={}", src.trim_start_matches('='))) {
                Ok(parsed) => parsed,
                Err(reason) => {
                    warn!("shared formula '{}' does not parse: {}", src, reason);
                    continue;
                }
            };
            let bound = bind_expr(&parsed, |name| book.sheet_id_by_name(name));
            let moved = relocate_expr(&bound, follower.row as isize - row as isize, follower.col as isize - col as isize);
            let text = format_expr(&moved, |id| book.sheet_by_id(id).map(|s| s.name().to_string()));
            sources.push((follower.row, follower.col, text));
        }
    }

    let sheet = workbook
        .sheet_mut(index)
        .ok_or_else(|| IoError::corrupt("sheet index out of range"))?;
    for (row, col, text) in sources {
        sheet.cell_mut_or_create(row, col).value = CellValue::Formula(Formula::new(text));
    }
    Ok(())
}

fn apply_links(workbook: &mut Workbook, index: usize, links: &[PendingLink], rels: &[Relationship]) -> Result<()> {
    for link in links {
        let external = link
            .rel_id
            .as_deref()
            .and_then(|id| rels.iter().find(|r| r.id == id))
            .filter(|r| r.external)
            .map(|r| r.target.clone());
        let url = match (external, &link.location) {
            (Some(url), Some(loc)) => format!("{}#{}", url, loc),
            (Some(url), None) => url,
            (None, Some(loc)) => format!("#{}", loc),
            (None, None) => continue,
        };
        workbook.set_hyperlink(index, link.row, link.col, Some(url))?;
    }
    Ok(())
}

fn apply_comments(workbook: &mut Workbook, index: usize, xml: &str) -> Result<()> {
    let mut authors: Vec<String> = Vec::new();
    let mut in_author = false;
    let mut current: Option<(CellAddr, usize, String)> = None;
    let mut in_text = false;
    let mut comments = Vec::new();
    for_each_event(xml, |node| {
        match node {
            Node::Start(e, empty) => match local(e).as_slice() {
                b"author" => {
                    in_author = !empty;
                    authors.push(String::new());
                }
                b"comment" => {
                    current = attr(e, b"ref")
                        .and_then(|r| CellAddr::parse(&r).ok())
                        .map(|addr| (addr, parse_num(attr(e, b"authorId")).unwrap_or(0), String::new()));
                }
                b"t" => in_text = !empty && current.is_some(),
                _ => {}
            },
            Node::Text(text) => {
                if in_author {
                    if let Some(author) = authors.last_mut() {
                        author.push_str(text);
                    }
                } else if in_text {
                    if let Some((_, _, body)) = current.as_mut() {
                        body.push_str(text);
                    }
                }
            }
            Node::End(b"author") => in_author = false,
            Node::End(b"t") => in_text = false,
            Node::End(b"comment") => comments.extend(current.take()),
            Node::End(_) => {}
        }
        Ok(())
    })?;

    for (addr, author_id, body) in comments {
        let author = authors.get(author_id).cloned().unwrap_or_default();
        workbook.set_comment(index, addr.row, addr.col, Some(Comment::new(author, body)))?;
    }
    Ok(())
}

fn apply_table(workbook: &mut Workbook, index: usize, xml: &str) -> Result<()> {
    let mut name = None;
    let mut range = None;
    let mut header_row = true;
    let mut show_filter = false;
    let mut style = None;
    for_each_event(xml, |node| {
        if let Node::Start(e, _) = node {
            match local(e).as_slice() {
                b"table" => {
                    name = attr(e, b"displayName").or_else(|| attr(e, b"name"));
                    range = attr(e, b"ref").and_then(|r| CellRange::parse(&r).ok());
                    header_row = attr(e, b"headerRowCount").as_deref() != Some("0");
                }
                b"autoFilter" => show_filter = true,
                b"tableStyleInfo" => style = attr(e, b"name"),
                _ => {}
            }
        }
        Ok(())
    })?;

    let (Some(name), Some(range)) = (name, range) else {
        warn!("table part without a name or range");
        return Ok(());
    };
    if let Err(err) = workbook.add_named_table(index, &name, range) {
        warn!("skipping table '{}': {}", name, err);
        return Ok(());
    }
    if let Some(table) = workbook.named_table_mut(&name) {
        table.header_row = header_row;
        table.show_filter = show_filter;
        table.style = style;
    }
    Ok(())
}
