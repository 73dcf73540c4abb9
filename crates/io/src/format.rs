//! File format identification by extension and by content signature.

use std::fmt;
use std::path::Path;

use log::debug;

use crate::error::{IoError, Result};

/// Compound File Binary signature (binary workbooks, encrypted or not)
pub const CFB_SIGNATURE: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
/// Local file header of a zip archive
pub const ZIP_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFormat {
    /// Compound-file binary workbook (`.xls`)
    Binary,
    /// Zip + XML container (`.xlsx`)
    Xlsx,
    Csv,
    Tsv,
    Json,
    /// SpreadsheetML 2003 (`.xml`)
    Xml,
    /// Export only
    Html,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "xls" | "cbk" => Some(FileFormat::Binary),
            "xlsx" | "xlsm" => Some(FileFormat::Xlsx),
            "csv" => Some(FileFormat::Csv),
            "tsv" | "tab" => Some(FileFormat::Tsv),
            "json" => Some(FileFormat::Json),
            "xml" => Some(FileFormat::Xml),
            "html" | "htm" => Some(FileFormat::Html),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension().and_then(|e| e.to_str()).and_then(Self::from_extension)
    }

    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Binary => "xls",
            FileFormat::Xlsx => "xlsx",
            FileFormat::Csv => "csv",
            FileFormat::Tsv => "tsv",
            FileFormat::Json => "json",
            FileFormat::Xml => "xml",
            FileFormat::Html => "html",
        }
    }

    /// Formats that can be read back
    pub fn can_import(self) -> bool {
        !matches!(self, FileFormat::Html)
    }

    /// Identify a format from the leading bytes.
    ///
    /// Delimited text and HTML carry no signature and are never detected;
    /// use [`FileFormat::from_extension`] or `decode_as` for them.
    pub fn detect(bytes: &[u8]) -> Result<Self> {
        let format = if bytes.starts_with(&CFB_SIGNATURE) {
            FileFormat::Binary
        } else if bytes.starts_with(&ZIP_SIGNATURE) {
            FileFormat::Xlsx
        } else {
            let text = skip_bom_and_whitespace(bytes);
            if text.starts_with(b"{") {
                FileFormat::Json
            } else if text.starts_with(b"<?xml") || text.starts_with(b"<Workbook") {
                FileFormat::Xml
            } else {
                return Err(IoError::UnsupportedFormat(describe_signature(bytes)));
            }
        };
        debug!("detected {} from {} bytes", format, bytes.len());
        Ok(format)
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileFormat::Binary => "binary workbook",
            FileFormat::Xlsx => "xlsx",
            FileFormat::Csv => "CSV",
            FileFormat::Tsv => "TSV",
            FileFormat::Json => "JSON",
            FileFormat::Xml => "XML spreadsheet",
            FileFormat::Html => "HTML",
        };
        f.write_str(name)
    }
}

fn skip_bom_and_whitespace(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    &bytes[start..]
}

fn describe_signature(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "empty input".to_string();
    }
    let head: Vec<String> = bytes.iter().take(8).map(|b| format!("{:02X}", b)).collect();
    format!("unrecognized signature {}", head.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_extension() {
        assert_eq!(FileFormat::from_extension("XLSX"), Some(FileFormat::Xlsx));
        assert_eq!(FileFormat::from_extension(".tsv"), Some(FileFormat::Tsv));
        assert_eq!(FileFormat::from_extension("htm"), Some(FileFormat::Html));
        assert_eq!(FileFormat::from_extension("ods"), None);
        assert_eq!(FileFormat::from_path(Path::new("/tmp/report.csv")), Some(FileFormat::Csv));
    }

    #[test]
    fn test_detect_signatures() {
        let mut cfb = CFB_SIGNATURE.to_vec();
        cfb.extend_from_slice(&[0; 16]);
        assert_eq!(FileFormat::detect(&cfb).unwrap(), FileFormat::Binary);
        assert_eq!(FileFormat::detect(b"PK\x03\x04rest").unwrap(), FileFormat::Xlsx);
        assert_eq!(FileFormat::detect(b"\xEF\xBB\xBF  {\"sheets\": []}").unwrap(), FileFormat::Json);
        assert_eq!(FileFormat::detect(b"<?xml version=\"1.0\"?>").unwrap(), FileFormat::Xml);
    }

    #[test]
    fn test_detect_rejects_unknown() {
        assert!(matches!(FileFormat::detect(b"a,b,c\n1,2,3"), Err(IoError::UnsupportedFormat(_))));
        assert!(matches!(FileFormat::detect(b"<html><table>"), Err(IoError::UnsupportedFormat(_))));
        assert!(matches!(FileFormat::detect(b""), Err(IoError::UnsupportedFormat(_))));
    }
}
