// CSV/TSV import/export

use std::borrow::Cow;

use cellbook_config::EngineConfig;
use cellbook_engine::{CellValue, EngineError, Workbook};
use log::{debug, warn};

use crate::error::{IoError, Result};

/// Export one sheet's displayed values.
///
/// Formulas are written as their results and styles are dropped; both are
/// reported once at `warn`. Cells covered by a merge (other than its
/// top-left cell) are written empty.
pub fn encode(workbook: &Workbook, sheet: usize, delimiter: u8) -> Result<Vec<u8>> {
    let data = workbook
        .sheet(sheet)
        .ok_or_else(|| EngineError::SheetNotFound(sheet.to_string()))?;

    // Rows may be variable width because trailing empties are omitted
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_writer(Vec::new());

    let (rows, cols) = data.extent();
    let (mut formulas, mut styled) = (0usize, 0usize);
    for row in 0..rows {
        let mut record: Vec<String> = Vec::with_capacity(cols);
        let mut last_non_empty = 0;

        for col in 0..cols {
            let covered = data
                .merge_at(row, col)
                .is_some_and(|m| (m.start.row, m.start.col) != (row, col));
            let value = if covered {
                String::new()
            } else {
                if let Some(cell) = data.cell(row, col) {
                    formulas += cell.is_formula() as usize;
                    styled += !cell.style.is_default() as usize;
                }
                workbook.display(sheet, row, col)
            };
            if !value.is_empty() {
                last_non_empty = col + 1;
            }
            record.push(value);
        }

        record.truncate(last_non_empty);
        if record.is_empty() {
            // Written as `""`; a bare blank line would be skipped on import
            writer.write_record([""]).map_err(IoError::encode)?;
        } else {
            writer.write_record(&record).map_err(IoError::encode)?;
        }
    }

    if formulas > 0 || styled > 0 {
        warn!(
            "{}: delimited export keeps values only ({} formulas, {} styled cells flattened)",
            data.name(),
            formulas,
            styled
        );
    }
    writer.into_inner().map_err(IoError::encode)
}

/// Import delimited text into a single-sheet workbook.
///
/// `delimiter` overrides both the configured delimiter and detection.
pub fn decode(bytes: &[u8], delimiter: Option<u8>, config: &EngineConfig) -> Result<Workbook> {
    let content = to_utf8(bytes);
    let content = content.strip_prefix('\u{FEFF}').unwrap_or(content.as_ref());
    let delimiter = delimiter
        .or_else(|| config.csv.delimiter.and_then(|c| u8::try_from(c).ok()))
        .unwrap_or_else(|| sniff_delimiter(content));

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_bytes());

    let mut workbook = Workbook::with_config(config.clone());
    let limits = config.limits;
    let sheet = workbook
        .sheet_mut(0)
        .ok_or_else(|| IoError::corrupt("workbook has no sheets"))?;

    let mut formulas = 0usize;
    let mut cells = 0usize;
    for (row, result) in reader.records().enumerate() {
        let record = result.map_err(IoError::corrupt)?;
        for (col, field) in record.iter().enumerate() {
            let value = match CellValue::infer(field) {
                CellValue::Empty => continue,
                // Delimited text carries values only
                CellValue::Formula(f) => {
                    formulas += 1;
                    CellValue::Text(f.source)
                }
                value => value,
            };
            if row >= limits.max_rows || col >= limits.max_cols {
                return Err(EngineError::OutOfBounds { row, col }.into());
            }
            sheet.cell_mut_or_create(row, col).value = value;
            cells += 1;
        }
    }
    if formulas > 0 {
        warn!("{} formula-like fields imported as text", formulas);
    }

    workbook.rebuild();
    debug!("delimited import: {} cells, delimiter {:?}", cells, delimiter as char);
    Ok(workbook)
}

/// Detect the most likely field delimiter by checking consistency across the first few lines.
///
/// For each candidate (tab, semicolon, comma, pipe), count fields per line. The delimiter
/// that produces the most consistent field count (>1 field) wins.
pub fn sniff_delimiter(content: &str) -> u8 {
    let candidates: &[u8] = &[b'\t', b';', b',', b'|'];
    let sample_lines: Vec<&str> = content.lines().take(10).collect();

    let mut best = b',';
    let mut best_score = 0u64;

    for &delim in candidates {
        let counts: Vec<usize> = sample_lines
            .iter()
            .map(|line| {
                csv::ReaderBuilder::new()
                    .delimiter(delim)
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(line.as_bytes())
                    .records()
                    .next()
                    .and_then(|r| r.ok())
                    .map_or(1, |r| r.len())
            })
            .collect();

        let target = counts.first().copied().unwrap_or(0);
        if target <= 1 {
            continue;
        }

        // More columns break ties between equally consistent candidates
        let consistent = counts.iter().filter(|&&c| c == target).count() as u64;
        let score = consistent * target as u64;
        if score > best_score {
            best_score = score;
            best = delim;
        }
    }

    best
}

/// UTF-8 as is; anything else is read as Windows-1252 (Excel's usual CSV encoding).
pub fn to_utf8(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Cow::Borrowed(s),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            Cow::Owned(decoded.into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellbook_core::CellRange;
    use cellbook_engine::Value;

    #[test]
    fn test_export_merged_cells_no_leak() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "Header").unwrap();
        wb.set_value(0, 0, 1, "LEAK1").unwrap();
        wb.set_value(0, 0, 2, "LEAK2").unwrap();
        wb.set_value(0, 1, 0, "A").unwrap();
        wb.set_value(0, 1, 1, "B").unwrap();
        wb.set_value(0, 1, 2, "C").unwrap();
        wb.sheet_mut(0).unwrap().merge(CellRange::from_coords(0, 0, 0, 2)).unwrap();

        let content = String::from_utf8(encode(&wb, 0, b',').unwrap()).unwrap();
        assert!(!content.contains("LEAK"), "covered merge cells leaked: {content}");
        assert!(content.starts_with("Header\n"));
        assert!(content.contains("A,B,C"));
    }

    #[test]
    fn test_export_values_not_formulas() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "2").unwrap();
        wb.set_value(0, 1, 0, "3").unwrap();
        wb.set_formula(0, 2, 0, "=A1*A2").unwrap();

        let content = String::from_utf8(encode(&wb, 0, b',').unwrap()).unwrap();
        assert_eq!(content, "2\n3\n6\n");
    }

    #[test]
    fn test_sniff_semicolon_delimiter() {
        let content = "Name;Age;City\nAlice;30;Paris\nBob;25;London\n";
        assert_eq!(sniff_delimiter(content), b';');
    }

    #[test]
    fn test_sniff_tab_and_pipe_delimiters() {
        assert_eq!(sniff_delimiter("Name\tAge\nAlice\t30\n"), b'\t');
        assert_eq!(sniff_delimiter("Name|Age|City\nAlice|30|Paris\n"), b'|');
        assert_eq!(sniff_delimiter("single column\nvalues\n"), b',');
    }

    #[test]
    fn test_sniff_semicolon_with_commas_in_values() {
        let content = "Name;Address;City\n\"Doe, Jane\";\"123 Main St, Apt 4\";Paris\nBob;\"456 Elm\";London\n";
        assert_eq!(sniff_delimiter(content), b';');
    }

    #[test]
    fn test_import_infers_types() {
        let content = "Name;Qty;Active\nWidget;12;TRUE\nGadget;3.5;false\n";
        let wb = decode(content.as_bytes(), None, &EngineConfig::default()).unwrap();
        assert_eq!(wb.value(0, 0, 0), Value::Text("Name".into()));
        assert_eq!(wb.value(0, 1, 1), Value::Number(12.0));
        assert_eq!(wb.value(0, 2, 1), Value::Number(3.5));
        assert_eq!(wb.value(0, 1, 2), Value::Boolean(true));
    }

    #[test]
    fn test_import_keeps_formula_text_literal() {
        let wb = decode(b"1,=A1*2\n", None, &EngineConfig::default()).unwrap();
        assert_eq!(wb.value(0, 0, 1), Value::Text("=A1*2".into()));
        assert!(wb.formula_text(0, 0, 1).is_none());
    }

    #[test]
    fn test_import_windows_1252() {
        // "Café;5" with é as 0xE9
        let bytes = b"Caf\xE9;5\n";
        let wb = decode(bytes, None, &EngineConfig::default()).unwrap();
        assert_eq!(wb.value(0, 0, 0), Value::Text("Café".into()));
        assert_eq!(wb.value(0, 0, 1), Value::Number(5.0));
    }

    #[test]
    fn test_configured_delimiter_wins() {
        let mut config = EngineConfig::default();
        config.csv.delimiter = Some('|');
        let wb = decode(b"a,b|c\n", None, &config).unwrap();
        assert_eq!(wb.value(0, 0, 0), Value::Text("a,b".into()));
        assert_eq!(wb.value(0, 0, 1), Value::Text("c".into()));
    }

    #[test]
    fn test_tsv_round_trip() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "Name").unwrap();
        wb.set_value(0, 0, 1, "Value").unwrap();
        wb.set_value(0, 1, 0, "Alice").unwrap();
        wb.set_value(0, 1, 1, "42").unwrap();

        let bytes = encode(&wb, 0, b'\t').unwrap();
        let content = String::from_utf8(bytes.clone()).unwrap();
        assert!(content.contains('\t'));
        assert!(!content.contains(','));

        let back = decode(&bytes, Some(b'\t'), &EngineConfig::default()).unwrap();
        assert_eq!(back.display(0, 0, 1), "Value");
        assert_eq!(back.value(0, 1, 1), Value::Number(42.0));
    }

    #[test]
    fn test_import_beyond_limits_fails() {
        let mut config = EngineConfig::default();
        config.limits.max_cols = 2;
        let err = decode(b"1,2,3\n", Some(b','), &config).unwrap_err();
        assert!(matches!(err, IoError::Engine(EngineError::OutOfBounds { row: 0, col: 2 })));
    }
}
