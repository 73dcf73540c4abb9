// Binary workbook container
//
// A compound file holding a `Workbook` stream of little-endian records:
// u16 record type, u32 payload length, payload. The first record is a BOF
// whose payload starts with the native magic; streams without it are
// genuine BIFF workbooks and are read through calamine (values and
// formulas only).
//
// Cell records carry (row u32, col u32, style u32) followed by the value.
// Records after a SHEET record belong to that sheet until the next SHEET.
// Rich sheet state (panes, print setup, conditional formats, charts,
// protection) is stored as JSON payloads.

use std::io::{Cursor, Read, Write};

use cellbook_config::{EngineConfig, Limits};
use cellbook_core::CellRange;
use cellbook_engine::cell::{CellValue, Comment, Formula};
use cellbook_engine::conditional::ConditionalFormat;
use cellbook_engine::drawing::{Anchor, Chart};
use cellbook_engine::layout::{Pane, PrintSetup};
use cellbook_engine::protection::{SheetProtection, WorkbookProtection};
use cellbook_engine::sheet::Sheet;
use cellbook_engine::style::{Color, Style, StyleId};
use cellbook_engine::{CellError, Metadata, NameScope, NamedRange, Value, Workbook};
use chrono::{DateTime, NaiveDateTime};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{IoError, Result};
use crate::open_sheet;

/// Name of the record stream inside the compound file
pub const WORKBOOK_STREAM: &str = "/Workbook";

const MAGIC: &[u8; 4] = b"CBK\0";
const VERSION: u16 = 1;

mod record {
    pub const BOF: u16 = 0x0809;
    pub const EOF: u16 = 0x000A;
    pub const WINDOW: u16 = 0x003D;
    pub const STYLE: u16 = 0x00E0;
    pub const METADATA: u16 = 0x0022;
    pub const WBPROTECT: u16 = 0x0013;
    pub const SHEET: u16 = 0x0085;
    pub const BLANK: u16 = 0x0201;
    pub const NUMBER: u16 = 0x0203;
    pub const TEXT: u16 = 0x0204;
    pub const BOOL: u16 = 0x0205;
    pub const DATE: u16 = 0x0206;
    pub const FORMULA: u16 = 0x0006;
    pub const COMMENT: u16 = 0x001C;
    pub const LINK: u16 = 0x01B8;
    pub const MERGE: u16 = 0x00E5;
    pub const COLINFO: u16 = 0x007D;
    pub const ROWINFO: u16 = 0x0208;
    pub const PANE: u16 = 0x0041;
    pub const PRINT: u16 = 0x0019;
    pub const COND: u16 = 0x01B0;
    pub const IMAGE: u16 = 0x00EB;
    pub const CHART: u16 = 0x1002;
    pub const PROTECT: u16 = 0x0012;
    pub const NAME: u16 = 0x0018;
    pub const TABLE: u16 = 0x0866;
}

// ============================================================================
// Encoding
// ============================================================================

/// Payload builder
#[derive(Default)]
struct Payload(Vec<u8>);

impl Payload {
    fn new() -> Self {
        Self::default()
    }

    fn u8(mut self, v: u8) -> Self {
        self.0.push(v);
        self
    }

    fn u16(mut self, v: u16) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(mut self, v: u32) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i64(mut self, v: i64) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn f64(mut self, v: f64) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn raw(mut self, data: &[u8]) -> Self {
        self.0.extend_from_slice(data);
        self
    }

    fn bytes(mut self, data: &[u8]) -> Self {
        self.0.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.0.extend_from_slice(data);
        self
    }

    fn str(self, s: &str) -> Self {
        self.bytes(s.as_bytes())
    }

    fn opt_str(self, s: Option<&str>) -> Self {
        match s {
            Some(s) => self.u8(1).str(s),
            None => self.u8(0),
        }
    }

    fn range(self, range: &CellRange) -> Self {
        self.u32(range.start.row as u32)
            .u32(range.start.col as u32)
            .u32(range.end.row as u32)
            .u32(range.end.col as u32)
    }

    fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let data = serde_json::to_vec(value).map_err(IoError::encode)?;
        Ok(self.bytes(&data))
    }
}

struct RecordWriter {
    out: Vec<u8>,
}

impl RecordWriter {
    fn new() -> Self {
        Self { out: Vec::new() }
    }

    fn put(&mut self, kind: u16, payload: Payload) -> Result<()> {
        let len = u32::try_from(payload.0.len())
            .map_err(|_| IoError::encode(format!("record 0x{:04X} is too large", kind)))?;
        self.out.extend_from_slice(&kind.to_le_bytes());
        self.out.extend_from_slice(&len.to_le_bytes());
        self.out.extend_from_slice(&payload.0);
        Ok(())
    }
}

/// Encode a workbook as a compound file
pub fn encode(workbook: &Workbook) -> Result<Vec<u8>> {
    let stream = encode_records(workbook)?;
    write_compound(&[(WORKBOOK_STREAM, &stream)])
}

/// Compound file holding the given root-level streams
pub(crate) fn write_compound(streams: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let mut comp = cfb::CompoundFile::create(Cursor::new(Vec::new()))?;
    for (name, data) in streams {
        let mut stream = comp.create_stream(name)?;
        stream.write_all(data)?;
    }
    comp.flush()?;
    Ok(comp.into_inner().into_inner())
}

fn encode_records(workbook: &Workbook) -> Result<Vec<u8>> {
    let mut w = RecordWriter::new();
    w.put(record::BOF, Payload::new().raw(MAGIC).u16(VERSION))?;
    w.put(record::WINDOW, Payload::new().u32(workbook.active_sheet_index() as u32))?;
    w.put(record::METADATA, Payload::new().json(workbook.metadata())?)?;

    for (_, style) in workbook.styles().iter() {
        w.put(record::STYLE, Payload::new().json(style)?)?;
    }

    for sheet in workbook.sheets() {
        encode_sheet(&mut w, sheet)?;
    }

    for name in workbook.named_ranges().iter() {
        let Some(target) = workbook.sheet_index(name.sheet) else { continue };
        let payload = Payload::new().str(&name.name).u32(target as u32).range(&name.range);
        let payload = match name.scope {
            NameScope::Workbook => payload.u8(0).u32(0),
            NameScope::Sheet(id) => match workbook.sheet_index(id) {
                Some(index) => payload.u8(1).u32(index as u32),
                None => continue,
            },
        };
        w.put(record::NAME, payload.opt_str(name.comment.as_deref()))?;
    }

    for table in workbook.named_tables() {
        let Some(index) = workbook.sheet_index(table.sheet) else { continue };
        w.put(
            record::TABLE,
            Payload::new()
                .str(&table.name)
                .u32(index as u32)
                .range(&table.range)
                .u8(table.header_row as u8)
                .u8(table.show_filter as u8)
                .opt_str(table.style.as_deref()),
        )?;
    }

    let protection = workbook.workbook_protection();
    if protection.lock_structure {
        w.put(
            record::WBPROTECT,
            Payload::new()
                .u8(protection.password_hash.is_some() as u8)
                .u16(protection.password_hash.unwrap_or(0)),
        )?;
    }

    w.put(record::EOF, Payload::new())?;
    Ok(w.out)
}

fn encode_sheet(w: &mut RecordWriter, sheet: &Sheet) -> Result<()> {
    let tab = sheet.tab_color.map(Color::to_u32);
    w.put(
        record::SHEET,
        Payload::new()
            .str(sheet.name())
            .u8(sheet.hidden as u8)
            .u8(tab.is_some() as u8)
            .u32(tab.unwrap_or(0)),
    )?;

    for ((row, col), cell) in sheet.iter_cells() {
        let head = Payload::new().u32(row as u32).u32(col as u32).u32(cell.style.0);
        match &cell.value {
            CellValue::Empty => w.put(record::BLANK, head)?,
            CellValue::Number(n) => w.put(record::NUMBER, head.f64(*n))?,
            CellValue::Text(s) => w.put(record::TEXT, head.str(s))?,
            CellValue::Boolean(b) => w.put(record::BOOL, head.u8(*b as u8))?,
            CellValue::Date(dt) => {
                let utc = dt.and_utc();
                w.put(record::DATE, head.i64(utc.timestamp()).u32(utc.timestamp_subsec_nanos()))?
            }
            CellValue::Formula(f) => w.put(record::FORMULA, encode_value(head.str(&f.source), &cell.cached))?,
        }
        if let Some(comment) = &cell.comment {
            w.put(
                record::COMMENT,
                Payload::new()
                    .u32(row as u32)
                    .u32(col as u32)
                    .str(&comment.author)
                    .str(&comment.content)
                    .u8(comment.visible as u8),
            )?;
        }
        if let Some(url) = &cell.hyperlink {
            w.put(record::LINK, Payload::new().u32(row as u32).u32(col as u32).str(url))?;
        }
    }

    for merge in sheet.merged_regions() {
        w.put(record::MERGE, Payload::new().range(merge))?;
    }

    let mut cols: Vec<usize> = sheet.col_widths().keys().copied().collect();
    cols.extend(sheet.hidden_cols());
    cols.extend(sheet.col_outline().iter().map(|(c, _)| c));
    cols.sort_unstable();
    cols.dedup();
    for col in cols {
        w.put(
            record::COLINFO,
            dimension(col, sheet.col_width(col), sheet.is_col_hidden(col), sheet.col_outline().level(col)),
        )?;
    }

    let mut rows: Vec<usize> = sheet.row_heights().keys().copied().collect();
    rows.extend(sheet.hidden_rows());
    rows.extend(sheet.row_outline().iter().map(|(r, _)| r));
    rows.sort_unstable();
    rows.dedup();
    for row in rows {
        w.put(
            record::ROWINFO,
            dimension(row, sheet.row_height(row), sheet.is_row_hidden(row), sheet.row_outline().level(row)),
        )?;
    }

    if let Some(pane) = sheet.pane() {
        w.put(record::PANE, Payload::new().json(pane)?)?;
    }
    if !sheet.print_setup().is_default() {
        w.put(record::PRINT, Payload::new().json(sheet.print_setup())?)?;
    }
    for cf in sheet.conditional_formats() {
        w.put(record::COND, Payload::new().json(cf)?)?;
    }
    for image in sheet.images() {
        let a = &image.anchor;
        w.put(
            record::IMAGE,
            Payload::new()
                .u32(a.row as u32)
                .u32(a.col as u32)
                .u32(a.x_offset)
                .u32(a.y_offset)
                .u32(a.width)
                .u32(a.height)
                .opt_str(image.description.as_deref())
                .bytes(&image.data),
        )?;
    }
    for chart in sheet.charts() {
        w.put(record::CHART, Payload::new().json(chart)?)?;
    }
    if let Some(protection) = sheet.protection() {
        w.put(record::PROTECT, Payload::new().json(protection)?)?;
    }
    Ok(())
}

fn dimension(index: usize, size: Option<f64>, hidden: bool, level: u8) -> Payload {
    Payload::new()
        .u32(index as u32)
        .u8(size.is_some() as u8)
        .f64(size.unwrap_or(0.0))
        .u8(hidden as u8)
        .u8(level)
}

fn encode_value(payload: Payload, value: &Value) -> Payload {
    match value {
        Value::Empty => payload.u8(0),
        Value::Number(n) => payload.u8(1).f64(*n),
        Value::Text(s) => payload.u8(2).str(s),
        Value::Boolean(b) => payload.u8(3).u8(*b as u8),
        Value::Error(e) => payload.u8(4).str(e.code()),
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Cursor over one record's payload
struct Fields<'a> {
    kind: u16,
    data: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len()).ok_or_else(|| {
            IoError::corrupt(format!("record 0x{:04X} is truncated", self.kind))
        })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn flag(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn index(&mut self) -> Result<usize> {
        Ok(self.u32()? as usize)
    }

    fn i64(&mut self) -> Result<i64> {
        self.array().map(i64::from_le_bytes)
    }

    fn f64(&mut self) -> Result<f64> {
        self.array().map(f64::from_le_bytes)
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.index()?;
        self.take(len)
    }

    fn str(&mut self) -> Result<String> {
        let kind = self.kind;
        String::from_utf8(self.bytes()?.to_vec())
            .map_err(|_| IoError::corrupt(format!("record 0x{:04X} holds invalid UTF-8", kind)))
    }

    fn opt_str(&mut self) -> Result<Option<String>> {
        if self.flag()? {
            self.str().map(Some)
        } else {
            Ok(None)
        }
    }

    fn range(&mut self) -> Result<CellRange> {
        let (r1, c1, r2, c2) = (self.index()?, self.index()?, self.index()?, self.index()?);
        Ok(CellRange::from_coords(r1, c1, r2, c2))
    }

    fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let kind = self.kind;
        serde_json::from_slice(self.bytes()?)
            .map_err(|e| IoError::corrupt(format!("record 0x{:04X}: {}", kind, e)))
    }

    fn value(&mut self) -> Result<Value> {
        Ok(match self.u8()? {
            0 => Value::Empty,
            1 => Value::Number(self.f64()?),
            2 => Value::Text(self.str()?),
            3 => Value::Boolean(self.flag()?),
            4 => Value::Error(CellError::from_code(&self.str()?).unwrap_or(CellError::Value)),
            tag => return Err(IoError::corrupt(format!("unknown value tag {}", tag))),
        })
    }
}

fn split_records(data: &[u8]) -> Result<Vec<Fields<'_>>> {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        if data.len() - pos < 6 {
            return Err(IoError::corrupt("truncated record header"));
        }
        let kind = u16::from_le_bytes([data[pos], data[pos + 1]]);
        let len = u32::from_le_bytes([data[pos + 2], data[pos + 3], data[pos + 4], data[pos + 5]]) as usize;
        pos += 6;
        let end = pos
            .checked_add(len)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| IoError::corrupt(format!("record 0x{:04X} runs past the end of the stream", kind)))?;
        records.push(Fields { kind, data: &data[pos..end], pos: 0 });
        pos = end;
    }
    Ok(records)
}

/// Read the workbook stream out of a compound file
pub(crate) fn read_stream(bytes: &[u8], name: &str) -> Result<Vec<u8>> {
    let mut comp = cfb::CompoundFile::open(Cursor::new(bytes)).map_err(IoError::corrupt)?;
    if !comp.is_stream(name) {
        return Err(IoError::corrupt(format!("missing {} stream", name.trim_start_matches('/'))));
    }
    let mut data = Vec::new();
    comp.open_stream(name)
        .and_then(|mut stream| stream.read_to_end(&mut data))
        .map_err(IoError::corrupt)?;
    Ok(data)
}

/// True if the compound file carries a native record stream
pub fn is_native(stream: &[u8]) -> bool {
    stream.len() >= 10
        && u16::from_le_bytes([stream[0], stream[1]]) == record::BOF
        && &stream[6..10] == MAGIC
}

/// Decode an unencrypted binary workbook
pub fn decode(bytes: &[u8], config: &EngineConfig) -> Result<Workbook> {
    let stream = match read_stream(bytes, WORKBOOK_STREAM) {
        Ok(stream) => stream,
        Err(_) => return decode_biff(bytes, config),
    };
    if !is_native(&stream) {
        return decode_biff(bytes, config);
    }
    decode_records(&stream, config)
}

struct Loader {
    workbook: Workbook,
    limits: Limits,
    styles: Vec<StyleId>,
    sheets: usize,
    current: Option<usize>,
    active: usize,
    protection: Option<WorkbookProtection>,
}

impl Loader {
    fn sheet(&mut self, kind: u16) -> Result<&mut Sheet> {
        let index = self
            .current
            .ok_or_else(|| IoError::corrupt(format!("record 0x{:04X} before any sheet", kind)))?;
        self.workbook
            .sheet_mut(index)
            .ok_or_else(|| IoError::corrupt("sheet index out of range"))
    }

    fn style(&self, raw: u32) -> Result<StyleId> {
        self.styles
            .get(raw as usize)
            .copied()
            .ok_or_else(|| IoError::corrupt(format!("unknown style {}", raw)))
    }

    fn position(&self, f: &mut Fields) -> Result<(usize, usize)> {
        let (row, col) = (f.index()?, f.index()?);
        if row >= self.limits.max_rows || col >= self.limits.max_cols {
            return Err(IoError::corrupt(format!("cell ({}, {}) is outside the grid", row, col)));
        }
        Ok((row, col))
    }

    fn put_cell(&mut self, f: &mut Fields, value: impl FnOnce(&mut Fields) -> Result<(CellValue, Value)>) -> Result<()> {
        let (row, col) = self.position(f)?;
        let style = self.style(f.u32()?)?;
        let (value, cached) = value(f)?;
        let cell = self.sheet(f.kind)?.cell_mut_or_create(row, col);
        cell.value = value;
        cell.style = style;
        cell.cached = cached;
        Ok(())
    }

    fn sheet_id(&self, index: usize) -> Result<cellbook_engine::SheetId> {
        self.workbook
            .sheet(index)
            .map(Sheet::id)
            .ok_or_else(|| IoError::corrupt(format!("reference to missing sheet {}", index)))
    }

    fn apply(&mut self, f: &mut Fields) -> Result<()> {
        match f.kind {
            record::BOF | record::EOF => {}
            record::WINDOW => self.active = f.index()?,
            record::METADATA => *self.workbook.metadata_mut() = f.json::<Metadata>()?,
            record::STYLE => {
                let style: Style = f.json()?;
                let id = self.workbook.styles_mut().intern(style);
                self.styles.push(id);
            }
            record::SHEET => {
                let name = f.str()?;
                let hidden = f.flag()?;
                let tab = f.flag()?.then_some(f.u32()?);
                let index = open_sheet(&mut self.workbook, self.sheets, &name)?;
                self.sheets += 1;
                self.current = Some(index);
                let sheet = self.sheet(record::SHEET)?;
                sheet.hidden = hidden;
                sheet.tab_color = tab.map(Color::from_u32);
            }
            record::BLANK => self.put_cell(f, |_| Ok((CellValue::Empty, Value::Empty)))?,
            record::NUMBER => self.put_cell(f, |f| Ok((CellValue::Number(f.f64()?), Value::Empty)))?,
            record::TEXT => self.put_cell(f, |f| Ok((CellValue::Text(f.str()?), Value::Empty)))?,
            record::BOOL => self.put_cell(f, |f| Ok((CellValue::Boolean(f.flag()?), Value::Empty)))?,
            record::DATE => self.put_cell(f, |f| {
                let (secs, nanos) = (f.i64()?, f.u32()?);
                let dt: NaiveDateTime = DateTime::from_timestamp(secs, nanos)
                    .ok_or_else(|| IoError::corrupt("date out of range"))?
                    .naive_utc();
                Ok((CellValue::Date(dt), Value::Empty))
            })?,
            record::FORMULA => self.put_cell(f, |f| {
                let source = f.str()?;
                let cached = f.value()?;
                Ok((CellValue::Formula(Formula::new(source)), cached))
            })?,
            record::COMMENT => {
                let (row, col) = self.position(f)?;
                let mut comment = Comment::new(f.str()?, f.str()?);
                comment.visible = f.flag()?;
                self.sheet(f.kind)?.cell_mut_or_create(row, col).comment = Some(comment);
            }
            record::LINK => {
                let (row, col) = self.position(f)?;
                let url = f.str()?;
                self.sheet(f.kind)?.cell_mut_or_create(row, col).hyperlink = Some(url);
            }
            record::MERGE => {
                let range = f.range()?;
                self.sheet(f.kind)?.merge(range)?;
            }
            record::COLINFO => {
                let (col, width, hidden, level) = read_dimension(f)?;
                let sheet = self.sheet(record::COLINFO)?;
                if let Some(width) = width {
                    sheet.set_col_width(col, width);
                }
                sheet.set_col_hidden(col, hidden);
                sheet.set_col_outline_level(col, level);
            }
            record::ROWINFO => {
                let (row, height, hidden, level) = read_dimension(f)?;
                let sheet = self.sheet(record::ROWINFO)?;
                if let Some(height) = height {
                    sheet.set_row_height(row, height);
                }
                sheet.set_row_hidden(row, hidden);
                sheet.set_row_outline_level(row, level);
            }
            record::PANE => {
                let pane: Pane = f.json()?;
                self.sheet(f.kind)?.set_pane(Some(pane));
            }
            record::PRINT => {
                let print: PrintSetup = f.json()?;
                *self.sheet(f.kind)?.print_setup_mut() = print;
            }
            record::COND => {
                let cf: ConditionalFormat = f.json()?;
                self.sheet(f.kind)?.add_conditional_format(cf.range, cf.rules)?;
            }
            record::IMAGE => {
                let (row, col) = (f.index()?, f.index()?);
                let (x_offset, y_offset, width, height) = (f.u32()?, f.u32()?, f.u32()?, f.u32()?);
                let description = f.opt_str()?;
                let data = f.bytes()?.to_vec();
                let anchor = Anchor { row, col, x_offset, y_offset, width, height };
                let sheet = self.sheet(record::IMAGE)?;
                let id = sheet.insert_image(data, anchor)?;
                sheet.set_image_description(id, description);
            }
            record::CHART => {
                let chart: Chart = f.json()?;
                self.sheet(f.kind)?.add_chart(chart);
            }
            record::PROTECT => {
                let protection: SheetProtection = f.json()?;
                self.sheet(f.kind)?.set_protection(Some(protection));
            }
            record::NAME => {
                let name = f.str()?;
                let target = self.sheet_id(f.index()?)?;
                let range = f.range()?;
                let scope = match (f.u8()?, f.index()?) {
                    (0, _) => NameScope::Workbook,
                    (_, index) => NameScope::Sheet(self.sheet_id(index)?),
                };
                let mut named = NamedRange::new(name, target, range, scope);
                named.comment = f.opt_str()?;
                if let Err(e) = self.workbook.insert_name(named) {
                    warn!("dropping defined name: {}", e);
                }
            }
            record::TABLE => {
                let name = f.str()?;
                let index = f.index()?;
                let range = f.range()?;
                let (header_row, show_filter) = (f.flag()?, f.flag()?);
                let style = f.opt_str()?;
                self.workbook.add_named_table(index, &name, range)?;
                if let Some(table) = self.workbook.named_table_mut(&name) {
                    table.header_row = header_row;
                    table.show_filter = show_filter;
                    table.style = style;
                }
            }
            record::WBPROTECT => {
                let has_hash = f.flag()?;
                let hash = f.u16()?;
                self.protection = Some(WorkbookProtection {
                    lock_structure: true,
                    password_hash: has_hash.then_some(hash),
                });
            }
            other => return Err(IoError::corrupt(format!("unknown record type 0x{:04X}", other))),
        }
        Ok(())
    }
}

fn read_dimension(f: &mut Fields) -> Result<(usize, Option<f64>, bool, u8)> {
    let index = f.index()?;
    let has_size = f.flag()?;
    let size = f.f64()?;
    let hidden = f.flag()?;
    let level = f.u8()?;
    Ok((index, has_size.then_some(size), hidden, level))
}

fn decode_records(stream: &[u8], config: &EngineConfig) -> Result<Workbook> {
    let records = split_records(stream)?;
    if records.last().map(|r| r.kind) != Some(record::EOF) {
        return Err(IoError::corrupt("missing EOF record"));
    }

    let mut loader = Loader {
        workbook: Workbook::with_config(config.clone()),
        limits: config.limits,
        styles: Vec::new(),
        sheets: 0,
        current: None,
        active: 0,
        protection: None,
    };
    for mut f in records {
        loader.apply(&mut f)?;
    }
    if loader.sheets == 0 {
        return Err(IoError::corrupt("workbook has no sheets"));
    }

    let mut workbook = loader.workbook;
    if workbook.set_active_sheet(loader.active).is_err() {
        warn!("active sheet {} out of range; using the first sheet", loader.active);
    }
    if let Some(protection) = loader.protection {
        workbook.set_workbook_protection(protection);
    }
    let report = workbook.rebuild();
    debug!("binary workbook: {} sheets, {}", workbook.sheet_count(), report.summary());
    Ok(workbook)
}

// ============================================================================
// Genuine BIFF workbooks
// ============================================================================

fn decode_biff(bytes: &[u8], config: &EngineConfig) -> Result<Workbook> {
    use calamine::{Data, Reader, Xls};
    use cellbook_engine::number_format::serial_to_datetime;

    let mut xls = Xls::new(Cursor::new(bytes.to_vec())).map_err(IoError::corrupt)?;
    let names: Vec<String> = xls.sheet_names().to_vec();
    if names.is_empty() {
        return Err(IoError::corrupt("workbook has no sheets"));
    }

    let mut workbook = Workbook::with_config(config.clone());
    for (i, name) in names.iter().enumerate() {
        let index = open_sheet(&mut workbook, i, name)?;
        let range = xls.worksheet_range(name).map_err(IoError::corrupt)?;
        let formulas = xls.worksheet_formula(name).ok();

        let sheet = workbook
            .sheet_mut(index)
            .ok_or_else(|| IoError::corrupt("sheet index out of range"))?;
        let (row0, col0) = range.start().unwrap_or((0, 0));
        let mut cells = 0usize;
        for (r, c, data) in range.used_cells() {
            let (row, col) = (row0 as usize + r, col0 as usize + c);
            let value = match data {
                Data::Empty => continue,
                Data::Float(n) => CellValue::Number(*n),
                Data::Int(n) => CellValue::Number(*n as f64),
                Data::String(s) => CellValue::Text(s.clone()),
                Data::Bool(b) => CellValue::Boolean(*b),
                Data::DateTime(dt) => match serial_to_datetime(dt.as_f64(), config.date_system) {
                    Some(dt) => CellValue::Date(dt),
                    None => CellValue::Number(dt.as_f64()),
                },
                Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
                Data::Error(e) => CellValue::Formula(Formula::new(format!("={}", e))),
            };
            sheet.cell_mut_or_create(row, col).value = value;
            cells += 1;
        }

        if let Some(formulas) = formulas {
            let (row0, col0) = formulas.start().unwrap_or((0, 0));
            for (r, c, source) in formulas.used_cells() {
                if source.is_empty() {
                    continue;
                }
                let (row, col) = (row0 as usize + r, col0 as usize + c);
                sheet.cell_mut_or_create(row, col).value = CellValue::Formula(Formula::new(source.clone()));
            }
        }
        debug!("xls sheet '{}': {} cells", name, cells);
    }

    workbook.rebuild();
    Ok(workbook)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellbook_engine::conditional::{Comparison, ConditionalRule, Operand, StyleOverride};
    use cellbook_engine::drawing::{ChartKind, ChartSeries};

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    fn sample() -> Workbook {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "Item").unwrap();
        wb.set_value(0, 1, 0, "10").unwrap();
        wb.set_value(0, 2, 0, "32.5").unwrap();
        wb.set_value(0, 3, 0, "=SUM(A2:A3)").unwrap();
        wb.set_value(0, 0, 1, "TRUE").unwrap();
        wb.set_value(0, 1, 1, "2024-03-01").unwrap();
        wb.set_style(0, &CellRange::parse("A1:B1").unwrap(), {
            let mut s = Style::default();
            s.font.bold = true;
            s
        })
        .unwrap();
        wb.set_number_format(0, &CellRange::parse("A4").unwrap(), "0.00").unwrap();
        wb.set_comment(0, 0, 0, Some(Comment::new("ann", "header"))).unwrap();
        wb.set_hyperlink(0, 0, 1, Some("https://example.com".into())).unwrap();

        let idx = wb.add_sheet("Other Data").unwrap();
        wb.set_value(idx, 0, 0, "='Sheet1'!A4*2").unwrap();
        wb.define_name("Items", "Sheet1!A2:A3", NameScope::Workbook).unwrap();

        let sheet = wb.sheet_mut(0).unwrap();
        sheet.merge(CellRange::parse("C1:D1").unwrap()).unwrap();
        sheet.set_col_width(0, 20.0);
        sheet.set_row_hidden(5, true);
        sheet.group_rows(1, 2).unwrap();
        sheet.freeze_panes(1, 1);
        sheet.protect(Some("pw"));
        sheet
            .add_conditional_format(
                CellRange::parse("A2:A3").unwrap(),
                vec![ConditionalRule::new(Comparison::GreaterThan, vec![Operand::Number(20.0)], StyleOverride::fill(Color::RED))],
            )
            .unwrap();
        sheet.insert_image(PNG.to_vec(), Anchor::at(6, 0, 64, 32)).unwrap();
        let mut chart = Chart::new(ChartKind::Column, Anchor::at(8, 0, 400, 300)).with_title("Totals");
        chart.add_series(ChartSeries::new(CellRange::parse("A2:A3").unwrap()));
        sheet.add_chart(chart);
        wb.add_named_table(0, "Stock", CellRange::parse("A1:B3").unwrap()).unwrap();
        wb.metadata_mut().author = Some("ann".into());
        wb.set_active_sheet(1).unwrap();
        wb.rebuild();
        wb
    }

    #[test]
    fn test_round_trip_values_formulas_and_styles() {
        let wb = sample();
        let bytes = encode(&wb).unwrap();
        assert!(bytes.starts_with(&crate::format::CFB_SIGNATURE));

        let back = decode(&bytes, &EngineConfig::default()).unwrap();
        assert_eq!(back.sheet_names(), vec!["Sheet1", "Other Data"]);
        assert_eq!(back.active_sheet_index(), 1);
        assert_eq!(back.value(0, 3, 0), Value::Number(42.5));
        assert_eq!(back.formula_text(0, 3, 0).as_deref(), Some("=SUM(A2:A3)"));
        assert_eq!(back.value(1, 0, 0), Value::Number(85.0));
        assert_eq!(back.value(0, 0, 1), Value::Boolean(true));
        assert!(matches!(back.cell(0, 1, 1).map(|c| &c.value), Some(CellValue::Date(_))));
        assert!(back.style_of(0, 0, 0).font.bold);
        assert_eq!(back.style_of(0, 3, 0).number_format, "0.00");
        assert!(!back.style_of(0, 1, 0).font.bold);
        assert_eq!(back.cell(0, 0, 0).and_then(|c| c.comment.as_ref()).map(|c| c.content.as_str()), Some("header"));
        assert_eq!(back.cell(0, 0, 1).and_then(|c| c.hyperlink.as_deref()), Some("https://example.com"));
        assert_eq!(back.find_name("Items").as_deref(), Some("Sheet1!$A$2:$A$3"));
        assert_eq!(back.metadata().author.as_deref(), Some("ann"));
    }

    #[test]
    fn test_round_trip_sheet_state() {
        let wb = sample();
        let back = decode(&encode(&wb).unwrap(), &EngineConfig::default()).unwrap();
        let (orig, sheet) = (wb.sheet(0).unwrap(), back.sheet(0).unwrap());

        assert_eq!(sheet.merged_regions(), orig.merged_regions());
        assert_eq!(sheet.col_width(0), Some(20.0));
        assert!(sheet.is_row_hidden(5));
        assert_eq!(sheet.row_outline(), orig.row_outline());
        assert_eq!(sheet.pane(), orig.pane());
        assert!(sheet.is_protected());
        assert_eq!(sheet.conditional_formats(), orig.conditional_formats());
        assert_eq!(sheet.images().len(), 1);
        assert_eq!(sheet.images()[0].data, PNG);
        assert_eq!(sheet.charts(), orig.charts());
        assert_eq!(back.named_table("stock").map(|t| t.range.to_string()), Some("A1:B3".to_string()));
    }

    #[test]
    fn test_workbook_protection_survives() {
        let mut wb = Workbook::new();
        wb.add_sheet("Two").unwrap();
        wb.protect_structure(Some("secret"));
        let mut back = decode(&encode(&wb).unwrap(), &EngineConfig::default()).unwrap();
        assert!(back.is_structure_protected());
        assert_eq!(back.sheet_count(), 2);
        assert!(back.unprotect_structure(Some("nope")).is_err());
        back.unprotect_structure(Some("secret")).unwrap();
    }

    #[test]
    fn test_truncated_stream_is_corrupt() {
        let wb = sample();
        let mut stream = encode_records(&wb).unwrap();
        stream.truncate(stream.len() - 3);
        let bytes = write_compound(&[(WORKBOOK_STREAM, &stream)]).unwrap();
        assert!(matches!(decode(&bytes, &EngineConfig::default()), Err(IoError::CorruptFile(_))));
    }

    #[test]
    fn test_unknown_record_is_corrupt() {
        let mut w = RecordWriter::new();
        w.put(record::BOF, Payload::new().raw(MAGIC).u16(VERSION)).unwrap();
        w.put(0x7777, Payload::new().u32(1)).unwrap();
        w.put(record::EOF, Payload::new()).unwrap();
        let bytes = write_compound(&[(WORKBOOK_STREAM, &w.out)]).unwrap();
        let err = decode(&bytes, &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, IoError::CorruptFile(ref m) if m.contains("0x7777")));
    }

    #[test]
    fn test_is_native() {
        let wb = Workbook::new();
        assert!(is_native(&encode_records(&wb).unwrap()));
        assert!(!is_native(&[0x09, 0x08, 0x10, 0, 0, 0, 0x00, 0x06, 0x10, 0x00]));
    }

    #[test]
    fn test_native_header_layout() {
        let stream = encode_records(&Workbook::new()).unwrap();
        assert_eq!(u16::from_le_bytes([stream[0], stream[1]]), record::BOF);
        assert_eq!(&stream[6..10], MAGIC);
        assert_eq!(u16::from_le_bytes([stream[10], stream[11]]), VERSION);
    }

    #[test]
    fn test_biff_stream_goes_to_legacy_reader() {
        // BIFF8 BOF (version 0x0600, workbook globals) followed by EOF
        let mut stream = Vec::new();
        stream.extend_from_slice(&record::BOF.to_le_bytes());
        stream.extend_from_slice(&16u16.to_le_bytes());
        stream.extend_from_slice(&[0x00, 0x06, 0x05, 0x00]);
        stream.extend_from_slice(&[0u8; 12]);
        stream.extend_from_slice(&record::EOF.to_le_bytes());
        stream.extend_from_slice(&0u16.to_le_bytes());
        assert!(!is_native(&stream));

        // No BOUNDSHEET records, so the legacy reader finds no sheets
        let bytes = write_compound(&[(WORKBOOK_STREAM, &stream)]).unwrap();
        let err = decode(&bytes, &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, IoError::CorruptFile(_)));
    }
}
