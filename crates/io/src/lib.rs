// File I/O operations
//
// Every format goes through `decode`/`encode` here. Formats with a
// signature are detected from content; delimited text and HTML are chosen
// by the caller (`decode_as`, or the file extension in `load`/`save`).

pub mod binary;
pub mod crypto;
pub mod csv;
pub mod error;
pub mod format;
pub mod html;
pub mod json;
pub mod xlsx;
mod xlsx_reader;
mod xlsx_styles;
pub mod xml;

use std::fs;
use std::path::Path;

use cellbook_config::EngineConfig;
use cellbook_engine::Workbook;
use log::{info, warn};

pub use error::{IoError, Result};
pub use format::FileFormat;
pub use xlsx::CancelToken;

/// Decode a workbook, detecting the format from its content.
///
/// Password-protected containers need `password`; without one, or with the
/// wrong one, this fails with `WrongPassword`. A password given for an
/// unprotected file is ignored.
pub fn decode(bytes: &[u8], password: Option<&str>, config: &EngineConfig) -> Result<Workbook> {
    if crypto::is_encrypted(bytes) {
        let password = password.ok_or(IoError::WrongPassword)?;
        let container = crypto::decrypt(bytes, password)?;
        return binary::decode(&container, config);
    }
    let format = FileFormat::detect(bytes)?;
    decode_as(bytes, format, config)
}

/// Decode a workbook in a known format
pub fn decode_as(bytes: &[u8], format: FileFormat, config: &EngineConfig) -> Result<Workbook> {
    match format {
        FileFormat::Binary => {
            if crypto::is_encrypted(bytes) {
                return Err(IoError::WrongPassword);
            }
            binary::decode(bytes, config)
        }
        FileFormat::Xlsx => xlsx_reader::decode(bytes, config),
        FileFormat::Csv => csv::decode(bytes, None, config),
        FileFormat::Tsv => csv::decode(bytes, Some(b'\t'), config),
        FileFormat::Json => json::decode(bytes, config),
        FileFormat::Xml => xml::decode(bytes, config),
        FileFormat::Html => Err(IoError::UnsupportedFormat("HTML is export only".into())),
    }
}

/// Encode a workbook. Delimited text holds only the active sheet.
pub fn encode(workbook: &Workbook, format: FileFormat) -> Result<Vec<u8>> {
    match format {
        FileFormat::Binary => binary::encode(workbook),
        FileFormat::Xlsx => xlsx::encode(workbook),
        FileFormat::Csv => csv::encode(workbook, workbook.active_sheet_index(), b','),
        FileFormat::Tsv => csv::encode(workbook, workbook.active_sheet_index(), b'\t'),
        FileFormat::Json => json::encode(workbook),
        FileFormat::Xml => xml::encode(workbook),
        FileFormat::Html => html::encode(workbook),
    }
}

/// Binary container protected by `password`, keyed with the configured
/// spin count
pub fn encrypt(workbook: &Workbook, password: &str, config: &EngineConfig) -> Result<Vec<u8>> {
    let container = binary::encode(workbook)?;
    crypto::encrypt(&container, password, &config.encryption)
}

/// Read a workbook from disk. The extension picks delimited text;
/// everything else is detected from content.
pub fn load(path: &Path, password: Option<&str>, config: &EngineConfig) -> Result<Workbook> {
    let bytes = fs::read(path)?;
    let workbook = match FileFormat::from_path(path) {
        Some(format @ (FileFormat::Csv | FileFormat::Tsv)) => decode_as(&bytes, format, config)?,
        Some(FileFormat::Html) => {
            return Err(IoError::UnsupportedFormat(format!("{} (HTML is export only)", path.display())))
        }
        _ => decode(&bytes, password, config)?,
    };
    info!("Loaded {} ({} sheets)", path.display(), workbook.sheet_count());
    Ok(workbook)
}

/// Write a workbook in the format named by the file extension
pub fn save(workbook: &Workbook, path: &Path) -> Result<()> {
    let format = FileFormat::from_path(path)
        .ok_or_else(|| IoError::UnsupportedFormat(format!("no known extension on {}", path.display())))?;
    let bytes = encode(workbook, format)?;
    fs::write(path, &bytes)?;
    info!("Saved {} as {} ({} bytes)", path.display(), format, bytes.len());
    Ok(())
}

/// Write a password-protected binary workbook
pub fn save_encrypted(workbook: &Workbook, path: &Path, password: &str, config: &EngineConfig) -> Result<()> {
    let bytes = encrypt(workbook, password, config)?;
    fs::write(path, &bytes)?;
    info!("Saved {} encrypted ({} bytes)", path.display(), bytes.len());
    Ok(())
}

/// Write xlsx, stopping with `Cancelled` once `token` is cancelled. Nothing
/// is written to `path` when the export is cancelled.
pub fn export_xlsx_cancellable(workbook: &Workbook, path: &Path, token: &CancelToken) -> Result<()> {
    let bytes = xlsx::encode_cancellable(workbook, token)?;
    fs::write(path, &bytes)?;
    info!("Exported {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

/// Make room for the `index`-th sheet of a file being read. The first sheet
/// reuses the workbook's initial sheet. Names the workbook rejects fall back
/// to the first free `Sheet{n}`; the first sheet keeps its initial name.
pub(crate) fn open_sheet(workbook: &mut Workbook, index: usize, name: &str) -> Result<usize> {
    let attempt = if index == 0 {
        workbook.rename_sheet(0, name).map(|_| 0)
    } else {
        workbook.add_sheet(name)
    };
    match attempt {
        Ok(i) => Ok(i),
        Err(err) => {
            warn!("sheet name '{}' rejected ({}); using a generated name", name, err);
            if index == 0 {
                return Ok(0);
            }
            let fallback = (index + 1..)
                .map(|n| format!("Sheet{}", n))
                .find(|candidate| workbook.sheet_by_name(candidate).is_none())
                .unwrap_or_default();
            Ok(workbook.add_sheet(&fallback)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellbook_engine::Value;
    use tempfile::tempdir;

    fn sample() -> Workbook {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "Item").unwrap();
        wb.set_value(0, 0, 1, "Cost").unwrap();
        wb.set_value(0, 1, 0, "Paper").unwrap();
        wb.set_value(0, 1, 1, "4.5").unwrap();
        wb.set_formula(0, 2, 1, "=SUM(B2:B2)").unwrap();
        wb
    }

    #[test]
    fn test_save_and_load_each_format() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::default();
        for ext in ["xls", "xlsx", "json", "xml"] {
            let path = dir.path().join(format!("book.{}", ext));
            save(&sample(), &path).unwrap();
            let back = load(&path, None, &config).unwrap();
            assert_eq!(back.value(0, 1, 1), Value::Number(4.5), "{}", ext);
            assert_eq!(back.value(0, 2, 1), Value::Number(4.5), "{}", ext);
            assert_eq!(back.formula_text(0, 2, 1).as_deref(), Some("=SUM(B2:B2)"), "{}", ext);
        }
    }

    #[test]
    fn test_delimited_text_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("book.tsv");
        save(&sample(), &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Item\tCost"));
        let back = load(&path, None, &EngineConfig::default()).unwrap();
        assert_eq!(back.value(0, 1, 0), Value::Text("Paper".into()));
    }

    #[test]
    fn test_encrypted_round_trip() {
        let mut config = EngineConfig::default();
        config.encryption.spin_count = 10;
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret.xls");
        save_encrypted(&sample(), &path, "hunter2", &config).unwrap();

        assert!(matches!(load(&path, None, &config), Err(IoError::WrongPassword)));
        assert!(matches!(load(&path, Some("wrong"), &config), Err(IoError::WrongPassword)));
        let back = load(&path, Some("hunter2"), &config).unwrap();
        assert_eq!(back.value(0, 1, 0), Value::Text("Paper".into()));
    }

    #[test]
    fn test_html_is_export_only() {
        let html = encode(&sample(), FileFormat::Html).unwrap();
        assert!(matches!(
            decode_as(&html, FileFormat::Html, &EngineConfig::default()),
            Err(IoError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_unknown_content_is_unsupported() {
        let err = decode(b"\x00\x01garbage", None, &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, IoError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_cancelled_export_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("book.xlsx");
        let token = CancelToken::new();
        token.cancel();
        let err = export_xlsx_cancellable(&sample(), &path, &token).unwrap_err();
        assert!(matches!(err, IoError::Cancelled));
        assert!(!path.exists());
    }

    #[test]
    fn test_open_sheet_falls_back_on_bad_names() {
        let mut wb = Workbook::new();
        assert_eq!(open_sheet(&mut wb, 0, "Data").unwrap(), 0);
        assert_eq!(open_sheet(&mut wb, 1, "Data").unwrap(), 1);
        assert_eq!(wb.sheet_names(), vec!["Data", "Sheet2"]);
    }
}
