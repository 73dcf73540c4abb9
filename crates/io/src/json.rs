// JSON workbook documents
//
// The whole model (sheets, styles, names, tables, layout, metadata) is
// serialized with serde. Engine settings and the dependency graph are not
// part of the document: the caller's config is applied and the graph is
// rebuilt after load.

use cellbook_config::EngineConfig;
use cellbook_engine::Workbook;
use log::{debug, warn};

use crate::error::{IoError, Result};

pub fn encode(workbook: &Workbook) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(workbook).map_err(IoError::encode)
}

pub fn decode(bytes: &[u8], config: &EngineConfig) -> Result<Workbook> {
    let mut workbook: Workbook = serde_json::from_slice(bytes).map_err(IoError::corrupt)?;
    if workbook.sheet_count() == 0 {
        return Err(IoError::corrupt("workbook has no sheets"));
    }
    if workbook.set_active_sheet(workbook.active_sheet_index()).is_err() {
        warn!("active sheet {} out of range; using the first sheet", workbook.active_sheet_index());
        workbook.set_active_sheet(0)?;
    }
    for sheet in workbook.sheets() {
        if let Some(range) = sheet.used_range() {
            if range.end.row >= config.limits.max_rows || range.end.col >= config.limits.max_cols {
                return Err(IoError::corrupt(format!("{}: cell {} is outside the grid", sheet.name(), range)));
            }
        }
    }

    workbook.set_config(config.clone());
    let report = workbook.rebuild();
    debug!("JSON workbook: {} sheets, {}", workbook.sheet_count(), report.summary());
    Ok(workbook)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellbook_core::CellRange;
    use cellbook_engine::style::Style;
    use cellbook_engine::{EvalState, Value};

    #[test]
    fn test_round_trip_rebuilds_formulas() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "10").unwrap();
        wb.set_formula(0, 1, 0, "=A1*3").unwrap();
        let mut bold = Style::default();
        bold.font.bold = true;
        wb.set_style(0, &CellRange::cell(0, 0), bold).unwrap();
        wb.add_sheet("Notes").unwrap();
        wb.set_value(1, 0, 0, "hello").unwrap();

        let bytes = encode(&wb).unwrap();
        let mut back = decode(&bytes, &EngineConfig::default()).unwrap();

        assert_eq!(back.sheet_names(), vec!["Sheet1", "Notes"]);
        assert_eq!(back.value(0, 1, 0), Value::Number(30.0));
        assert_eq!(back.eval_state(0, 1, 0), Some(EvalState::Evaluated));
        assert!(back.style_of(0, 0, 0).font.bold);

        // The graph is live again: editing a precedent updates the dependent
        back.set_value(0, 0, 0, "2").unwrap();
        assert_eq!(back.value(0, 1, 0), Value::Number(6.0));
    }

    #[test]
    fn test_config_comes_from_caller() {
        let mut config = EngineConfig::default();
        config.csv.has_headers = false;
        let back = decode(&encode(&Workbook::new()).unwrap(), &config).unwrap();
        assert_eq!(back.config(), &config);
    }

    #[test]
    fn test_malformed_document_is_corrupt() {
        assert!(matches!(decode(b"{\"sheets\": 5}", &EngineConfig::default()), Err(IoError::CorruptFile(_))));
        assert!(matches!(decode(b"{", &EngineConfig::default()), Err(IoError::CorruptFile(_))));
    }
}
