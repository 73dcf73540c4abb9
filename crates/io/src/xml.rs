//! XML Spreadsheet 2003 (SpreadsheetML) import/export.
//!
//! ```text
//! <Workbook>
//!   <Names><NamedRange ss:Name="Total" ss:RefersTo="=Sheet1!$B$5"/></Names>
//!   <Worksheet ss:Name="Sheet1">
//!     <Table>
//!       <Column ss:Index="2" ss:Width="63"/>
//!       <Row ss:Index="1">
//!         <Cell ss:Formula="=B1*2" ss:MergeAcross="1"><Data ss:Type="Number">6</Data></Cell>
//! ```
//!
//! Formulas are written in A1 notation. Styles are not carried.

use std::collections::BTreeMap;

use cellbook_config::EngineConfig;
use cellbook_core::CellRange;
use cellbook_engine::{CellError, CellValue, EngineError, Formula, NameScope, Sheet, Value, Workbook};
use chrono::NaiveDateTime;
use log::{debug, warn};
use quick_xml::escape::unescape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesPI, BytesRef, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{IoError, Result};

const NS: &str = "urn:schemas-microsoft-com:office:spreadsheet";
const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";
/// Points per character of column width
const POINTS_PER_CHAR: f64 = 5.25;

// ============================================================================
// Export
// ============================================================================

pub fn encode(workbook: &Workbook) -> Result<Vec<u8>> {
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 1);
    emit(&mut w, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    emit(&mut w, Event::PI(BytesPI::new("mso-application progid=\"Excel.Sheet\"")))?;
    emit(&mut w, Event::Start(BytesStart::new("Workbook").with_attributes([("xmlns", NS), ("xmlns:ss", NS)])))?;

    write_names(&mut w, workbook, NameScope::Workbook)?;
    for sheet in workbook.sheets() {
        write_sheet(&mut w, workbook, sheet)?;
    }

    emit(&mut w, Event::End(BytesEnd::new("Workbook")))?;
    Ok(w.into_inner())
}

fn emit(w: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    w.write_event(event).map_err(IoError::encode)
}

fn write_names(w: &mut Writer<Vec<u8>>, workbook: &Workbook, scope: NameScope) -> Result<()> {
    let names: Vec<_> = workbook.named_ranges().iter().filter(|n| n.scope == scope).collect();
    if names.is_empty() {
        return Ok(());
    }
    emit(w, Event::Start(BytesStart::new("Names")))?;
    for name in names {
        let Some(target) = workbook.sheet_by_id(name.sheet) else { continue };
        let refers_to = format!("={}", name.range.clone().with_sheet(target.name()).to_absolute_string());
        let mut e = BytesStart::new("NamedRange");
        e.push_attribute(("ss:Name", name.name.as_str()));
        e.push_attribute(("ss:RefersTo", refers_to.as_str()));
        emit(w, Event::Empty(e))?;
    }
    emit(w, Event::End(BytesEnd::new("Names")))
}

fn write_sheet(w: &mut Writer<Vec<u8>>, workbook: &Workbook, sheet: &Sheet) -> Result<()> {
    let mut ws = BytesStart::new("Worksheet");
    ws.push_attribute(("ss:Name", sheet.name()));
    emit(w, Event::Start(ws))?;
    write_names(w, workbook, NameScope::Sheet(sheet.id()))?;
    emit(w, Event::Start(BytesStart::new("Table")))?;

    for (&col, &width) in sheet.col_widths() {
        let mut e = BytesStart::new("Column");
        e.push_attribute(("ss:Index", (col + 1).to_string().as_str()));
        e.push_attribute(("ss:Width", (width * POINTS_PER_CHAR).to_string().as_str()));
        emit(w, Event::Empty(e))?;
    }

    // Every stored cell plus the origin of each merge, grouped by row
    let mut rows: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for ((row, col), cell) in sheet.iter_cells() {
        if !cell.value.is_empty() || cell.hyperlink.is_some() {
            rows.entry(row).or_default().push(col);
        }
    }
    for merge in sheet.merged_regions() {
        let cols = rows.entry(merge.start.row).or_default();
        if !cols.contains(&merge.start.col) {
            cols.push(merge.start.col);
        }
    }
    for &row in sheet.row_heights().keys() {
        rows.entry(row).or_default();
    }

    for (row, mut cols) in rows {
        cols.sort_unstable();
        let mut r = BytesStart::new("Row");
        r.push_attribute(("ss:Index", (row + 1).to_string().as_str()));
        if let Some(height) = sheet.row_height(row) {
            r.push_attribute(("ss:Height", height.to_string().as_str()));
        }
        if cols.is_empty() {
            emit(w, Event::Empty(r))?;
            continue;
        }
        emit(w, Event::Start(r))?;
        for col in cols {
            write_cell(w, workbook, sheet, row, col)?;
        }
        emit(w, Event::End(BytesEnd::new("Row")))?;
    }

    emit(w, Event::End(BytesEnd::new("Table")))?;
    emit(w, Event::End(BytesEnd::new("Worksheet")))
}

fn write_cell(w: &mut Writer<Vec<u8>>, workbook: &Workbook, sheet: &Sheet, row: usize, col: usize) -> Result<()> {
    let mut e = BytesStart::new("Cell");
    e.push_attribute(("ss:Index", (col + 1).to_string().as_str()));
    if let Some(merge) = sheet.merge_at(row, col) {
        if merge.cols() > 1 {
            e.push_attribute(("ss:MergeAcross", (merge.cols() - 1).to_string().as_str()));
        }
        if merge.rows() > 1 {
            e.push_attribute(("ss:MergeDown", (merge.rows() - 1).to_string().as_str()));
        }
    }

    let Some(cell) = sheet.cell(row, col) else {
        return emit(w, Event::Empty(e));
    };
    if let Some(url) = &cell.hyperlink {
        e.push_attribute(("ss:HRef", url.as_str()));
    }

    let data = match &cell.value {
        CellValue::Empty => None,
        CellValue::Number(n) => Some(("Number", n.to_string())),
        CellValue::Text(s) => Some(("String", s.clone())),
        CellValue::Boolean(b) => Some(("Boolean", bool_text(*b))),
        CellValue::Date(dt) => Some(("DateTime", dt.format(DATE_FORMAT).to_string())),
        CellValue::Formula(f) => {
            e.push_attribute(("ss:Formula", f.source.as_str()));
            match cell.computed_value(workbook.config().date_system) {
                Value::Empty => None,
                Value::Number(n) => Some(("Number", n.to_string())),
                Value::Text(s) => Some(("String", s)),
                Value::Boolean(b) => Some(("Boolean", bool_text(b))),
                Value::Error(err) => Some(("Error", err.code().to_string())),
            }
        }
    };

    let Some((kind, text)) = data else {
        return emit(w, Event::Empty(e));
    };
    emit(w, Event::Start(e))?;
    let mut d = BytesStart::new("Data");
    d.push_attribute(("ss:Type", kind));
    emit(w, Event::Start(d))?;
    emit(w, Event::Text(BytesText::new(&text)))?;
    emit(w, Event::End(BytesEnd::new("Data")))?;
    emit(w, Event::End(BytesEnd::new("Cell")))
}

fn bool_text(b: bool) -> String {
    if b { "1" } else { "0" }.to_string()
}

// ============================================================================
// Import
// ============================================================================

/// Append a resolved entity or character reference to `out`
pub(crate) fn push_general_ref(out: &mut String, e: &BytesRef<'_>) {
    if let Ok(Some(ch)) = e.resolve_char_ref() {
        out.push(ch);
        return;
    }
    let name = String::from_utf8_lossy(e.as_ref());
    match name.as_ref() {
        "amp" => out.push('&'),
        "lt" => out.push('<'),
        "gt" => out.push('>'),
        "quot" => out.push('"'),
        "apos" => out.push('\''),
        other => {
            out.push('&');
            out.push_str(other);
            out.push(';');
        }
    }
}

/// Attributes keyed by local name (`ss:Index` and `Index` are the same)
fn attributes(e: &BytesStart<'_>) -> Result<Vec<(String, String)>> {
    e.attributes()
        .map(|attr| {
            let attr = attr.map_err(IoError::corrupt)?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let raw = String::from_utf8_lossy(&attr.value);
            let value = unescape(&raw).map_err(IoError::corrupt)?.into_owned();
            Ok((key, value))
        })
        .collect()
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

/// 1-based `ss:Index` as a 0-based position
fn index_attr(attrs: &[(String, String)]) -> Result<Option<usize>> {
    match attr(attrs, "Index") {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n >= 1 => Ok(Some(n - 1)),
            _ => Err(IoError::corrupt(format!("invalid ss:Index '{}'", raw))),
        },
    }
}

fn number_attr(attrs: &[(String, String)], key: &str) -> Option<f64> {
    attr(attrs, key).and_then(|v| v.trim().parse().ok())
}

#[derive(Default)]
struct PendingCell {
    row: usize,
    col: usize,
    formula: Option<String>,
    href: Option<String>,
    data_type: Option<String>,
    text: String,
}

struct PendingName {
    name: String,
    refers_to: String,
    sheet: Option<usize>,
}

struct Importer {
    workbook: Workbook,
    config: EngineConfig,
    sheets: usize,
    current: Option<usize>,
    row: Option<usize>,
    col: Option<usize>,
    cell: Option<PendingCell>,
    in_data: bool,
    names: Vec<PendingName>,
    cells: usize,
}

impl Importer {
    fn sheet(&mut self) -> Result<&mut Sheet> {
        let index = self.current.ok_or_else(|| IoError::corrupt("table content outside a worksheet"))?;
        self.workbook
            .sheet_mut(index)
            .ok_or_else(|| IoError::corrupt("sheet index out of range"))
    }

    fn check(&self, row: usize, col: usize) -> Result<()> {
        if row >= self.config.limits.max_rows || col >= self.config.limits.max_cols {
            return Err(EngineError::OutOfBounds { row, col }.into());
        }
        Ok(())
    }

    fn start(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<()> {
        let local = e.local_name();
        match local.as_ref() {
            b"Worksheet" => {
                let attrs = attributes(e)?;
                let name = attr(&attrs, "Name").unwrap_or("Sheet");
                self.current = Some(crate::open_sheet(&mut self.workbook, self.sheets, name)?);
                self.sheets += 1;
                self.row = None;
            }
            b"NamedRange" => {
                let attrs = attributes(e)?;
                if let (Some(name), Some(refers_to)) = (attr(&attrs, "Name"), attr(&attrs, "RefersTo")) {
                    self.names.push(PendingName {
                        name: name.to_string(),
                        refers_to: refers_to.to_string(),
                        sheet: self.current,
                    });
                }
            }
            b"Column" => {
                let attrs = attributes(e)?;
                let col = match index_attr(&attrs)? {
                    Some(col) => col,
                    None => self.col.map_or(0, |c| c + 1),
                };
                self.col = Some(col);
                if let Some(width) = number_attr(&attrs, "Width") {
                    self.sheet()?.set_col_width(col, width / POINTS_PER_CHAR);
                }
            }
            b"Row" => {
                let attrs = attributes(e)?;
                let row = match index_attr(&attrs)? {
                    Some(row) => row,
                    None => self.row.map_or(0, |r| r + 1),
                };
                self.check(row, 0)?;
                self.row = Some(row);
                self.col = None;
                if let Some(height) = number_attr(&attrs, "Height") {
                    self.sheet()?.set_row_height(row, height);
                }
            }
            b"Cell" => {
                let attrs = attributes(e)?;
                let row = self.row.ok_or_else(|| IoError::corrupt("cell outside a row"))?;
                let col = match index_attr(&attrs)? {
                    Some(col) => col,
                    None => self.col.map_or(0, |c| c + 1),
                };
                self.check(row, col)?;
                let across = number_attr(&attrs, "MergeAcross").unwrap_or(0.0) as usize;
                let down = number_attr(&attrs, "MergeDown").unwrap_or(0.0) as usize;
                // A merged cell consumes the columns it spans
                self.col = Some(col + across);
                if across > 0 || down > 0 {
                    let range = CellRange::from_coords(row, col, row + down, col + across);
                    if let Err(err) = self.sheet()?.merge(range) {
                        warn!("skipping merge: {}", err);
                    }
                }
                self.cell = Some(PendingCell {
                    row,
                    col,
                    formula: attr(&attrs, "Formula").map(str::to_string),
                    href: attr(&attrs, "HRef").map(str::to_string),
                    ..PendingCell::default()
                });
                if empty {
                    self.finish_cell()?;
                }
            }
            b"Data" if self.cell.is_some() && !empty => {
                let attrs = attributes(e)?;
                if let Some(cell) = self.cell.as_mut() {
                    cell.data_type = attr(&attrs, "Type").map(str::to_string);
                }
                self.in_data = true;
            }
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, e: &BytesEnd<'_>) -> Result<()> {
        match e.local_name().as_ref() {
            b"Data" => self.in_data = false,
            b"Cell" => self.finish_cell()?,
            b"Worksheet" => self.current = None,
            _ => {}
        }
        Ok(())
    }

    fn finish_cell(&mut self) -> Result<()> {
        let Some(pending) = self.cell.take() else { return Ok(()) };
        let literal = match pending.data_type.as_deref() {
            None => CellValue::Empty,
            Some("Number") => pending
                .text
                .trim()
                .parse()
                .map(CellValue::Number)
                .map_err(|_| IoError::corrupt(format!("invalid number '{}'", pending.text)))?,
            Some("Boolean") => CellValue::Boolean(matches!(pending.text.trim(), "1" | "true" | "TRUE")),
            Some("DateTime") => parse_datetime(&pending.text)
                .map(CellValue::Date)
                .unwrap_or_else(|| CellValue::Text(pending.text.clone())),
            Some("Error") => match CellError::from_code(pending.text.trim()) {
                Some(_) => CellValue::Formula(Formula::new(pending.text.trim())),
                None => CellValue::Text(pending.text.clone()),
            },
            Some(_) => CellValue::Text(pending.text.clone()),
        };
        let value = match pending.formula {
            Some(source) => CellValue::Formula(Formula::new(source)),
            None => literal,
        };

        let cell = self.sheet()?.cell_mut_or_create(pending.row, pending.col);
        cell.value = value;
        cell.hyperlink = pending.href;
        self.cells += 1;
        Ok(())
    }
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    NaiveDateTime::parse_from_str(text, DATE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

pub fn decode(bytes: &[u8], config: &EngineConfig) -> Result<Workbook> {
    let text = std::str::from_utf8(bytes).map_err(IoError::corrupt)?;
    let mut reader = Reader::from_str(text.strip_prefix('\u{FEFF}').unwrap_or(text));
    reader.config_mut().trim_text(false);

    let mut importer = Importer {
        workbook: Workbook::with_config(config.clone()),
        config: config.clone(),
        sheets: 0,
        current: None,
        row: None,
        col: None,
        cell: None,
        in_data: false,
        names: Vec::new(),
        cells: 0,
    };
    let mut saw_root = false;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                saw_root |= e.local_name().as_ref() == b"Workbook";
                importer.start(e, false)?;
            }
            Ok(Event::Empty(ref e)) => importer.start(e, true)?,
            Ok(Event::End(ref e)) => importer.end(e)?,
            Ok(Event::Text(ref e)) if importer.in_data => {
                if let Some(cell) = importer.cell.as_mut() {
                    cell.text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::CData(ref e)) if importer.in_data => {
                if let Some(cell) = importer.cell.as_mut() {
                    cell.text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::GeneralRef(ref e)) if importer.in_data => {
                if let Some(cell) = importer.cell.as_mut() {
                    push_general_ref(&mut cell.text, e);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(IoError::corrupt(format!("XML error at {}: {}", reader.buffer_position(), e))),
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(IoError::corrupt("missing Workbook element"));
    }
    if importer.sheets == 0 {
        return Err(IoError::corrupt("workbook has no worksheets"));
    }

    let cells = importer.cells;
    let mut workbook = importer.workbook;
    for pending in importer.names {
        let scope = match pending.sheet.and_then(|i| workbook.sheet(i)).map(Sheet::id) {
            Some(id) => NameScope::Sheet(id),
            None => NameScope::Workbook,
        };
        let target = pending.refers_to.trim_start_matches('=');
        if let Err(err) = workbook.define_name(&pending.name, target, scope) {
            warn!("dropping name '{}': {}", pending.name, err);
        }
    }
    let report = workbook.rebuild();
    debug!("XML workbook: {} sheets, {} cells, {}", workbook.sheet_count(), cells, report.summary());
    Ok(workbook)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Workbook {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "Item").unwrap();
        wb.set_value(0, 0, 1, "Qty").unwrap();
        wb.set_value(0, 1, 0, "Bolts & <Nuts>").unwrap();
        wb.set_value(0, 1, 1, "40").unwrap();
        wb.set_value(0, 2, 0, "Washers").unwrap();
        wb.set_value(0, 2, 1, "2.5").unwrap();
        wb.set_formula(0, 3, 1, "=SUM(B2:B3)").unwrap();
        wb.set_value(0, 4, 0, "TRUE").unwrap();
        wb.set_value(0, 5, 0, "2024-03-15").unwrap();
        wb.set_hyperlink(0, 0, 0, Some("https://example.com/?a=1&b=2".into())).unwrap();
        wb.sheet_mut(0).unwrap().merge(CellRange::from_coords(6, 0, 7, 2)).unwrap();
        wb.sheet_mut(0).unwrap().set_col_width(1, 12.0);
        wb.sheet_mut(0).unwrap().set_row_height(2, 30.0);
        wb.add_sheet("Summary").unwrap();
        wb.set_formula(1, 0, 0, "=Sheet1!B4*2").unwrap();
        wb.define_name("Total", "Sheet1!B4", NameScope::Workbook).unwrap();
        wb
    }

    #[test]
    fn test_round_trip_values_and_formulas() {
        let bytes = encode(&sample()).unwrap();
        let wb = decode(&bytes, &EngineConfig::default()).unwrap();

        assert_eq!(wb.sheet_names(), vec!["Sheet1", "Summary"]);
        assert_eq!(wb.value(0, 1, 0), Value::Text("Bolts & <Nuts>".into()));
        assert_eq!(wb.value(0, 1, 1), Value::Number(40.0));
        assert_eq!(wb.formula_text(0, 3, 1).as_deref(), Some("=SUM(B2:B3)"));
        assert_eq!(wb.value(0, 3, 1), Value::Number(42.5));
        assert_eq!(wb.value(0, 4, 0), Value::Boolean(true));
        assert!(matches!(wb.cell(0, 5, 0).map(|c| &c.value), Some(CellValue::Date(_))));
        assert_eq!(wb.value(1, 0, 0), Value::Number(85.0));
    }

    #[test]
    fn test_round_trip_layout_names_and_links() {
        let bytes = encode(&sample()).unwrap();
        let wb = decode(&bytes, &EngineConfig::default()).unwrap();
        let sheet = wb.sheet(0).unwrap();

        assert_eq!(sheet.merged_regions(), &[CellRange::from_coords(6, 0, 7, 2)]);
        assert!((sheet.col_width(1).unwrap() - 12.0).abs() < 1e-9);
        assert_eq!(sheet.row_height(2), Some(30.0));
        assert_eq!(wb.cell(0, 0, 0).and_then(|c| c.hyperlink.as_deref()), Some("https://example.com/?a=1&b=2"));
        assert_eq!(wb.value_at("Summary!A1").unwrap(), Value::Number(85.0));
        assert!(wb.find_name("Total").is_some());
    }

    #[test]
    fn test_implicit_indices() {
        let xml = r#"<?xml version="1.0"?>
<Workbook xmlns="urn:schemas-microsoft-com:office:spreadsheet"
          xmlns:ss="urn:schemas-microsoft-com:office:spreadsheet">
 <Worksheet ss:Name="Data">
  <Table>
   <Row>
    <Cell><Data ss:Type="Number">1</Data></Cell>
    <Cell ss:Index="3"><Data ss:Type="Number">3</Data></Cell>
    <Cell><Data ss:Type="String">x &amp; y &#65;</Data></Cell>
   </Row>
   <Row ss:Index="4">
    <Cell ss:Formula="=A1+C1"><Data ss:Type="Number">0</Data></Cell>
   </Row>
  </Table>
 </Worksheet>
</Workbook>"#;
        let wb = decode(xml.as_bytes(), &EngineConfig::default()).unwrap();
        assert_eq!(wb.sheet_names(), vec!["Data"]);
        assert_eq!(wb.value(0, 0, 0), Value::Number(1.0));
        assert_eq!(wb.value(0, 0, 2), Value::Number(3.0));
        assert_eq!(wb.value(0, 0, 3), Value::Text("x & y A".into()));
        assert_eq!(wb.value(0, 3, 0), Value::Number(4.0));
    }

    #[test]
    fn test_escaped_attributes() {
        let xml = r#"<?xml version="1.0"?>
<Workbook xmlns="urn:schemas-microsoft-com:office:spreadsheet"
          xmlns:ss="urn:schemas-microsoft-com:office:spreadsheet">
 <Worksheet ss:Name="R&amp;D">
  <Table>
   <Row>
    <Cell><Data ss:Type="Number">1</Data></Cell>
    <Cell ss:Formula="=IF(A1&lt;2,&quot;low&quot;,&quot;high&quot;)" ss:HRef="http://x.test/?a=1&amp;b=&#50;"><Data ss:Type="String">low</Data></Cell>
   </Row>
  </Table>
 </Worksheet>
</Workbook>"#;
        let wb = decode(xml.as_bytes(), &EngineConfig::default()).unwrap();
        assert_eq!(wb.sheet_names(), vec!["R&D"]);
        assert_eq!(wb.formula_text(0, 0, 1).as_deref(), Some("=IF(A1<2,\"low\",\"high\")"));
        assert_eq!(wb.value(0, 0, 1), Value::Text("low".into()));
        assert_eq!(wb.cell(0, 0, 1).and_then(|c| c.hyperlink.as_deref()), Some("http://x.test/?a=1&b=2"));
    }

    #[test]
    fn test_malformed_xml_is_corrupt() {
        let err = decode(b"<Workbook><Worksheet ss:Name=\"A\"></Table></Workbook>", &EngineConfig::default());
        assert!(matches!(err, Err(IoError::CorruptFile(_))));
        let err = decode(b"<?xml version=\"1.0\"?><Other/>", &EngineConfig::default());
        assert!(matches!(err, Err(IoError::CorruptFile(_))));
    }
}
