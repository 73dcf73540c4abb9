//! Worksheet and workbook protection.
//!
//! Worksheet protection is advisory metadata: it is stored, exported and
//! reported, and `Sheet::unprotect` removes it without asking for the
//! password. Workbook structure protection is enforced by `Workbook` and
//! requires the password to remove.

use serde::{Deserialize, Serialize};

fn is_false(v: &bool) -> bool {
    !*v
}

/// Operations still permitted on a protected worksheet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetProtection {
    /// Legacy 16-bit hash of the password, if one was given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<u16>,
    pub select_locked_cells: bool,
    pub select_unlocked_cells: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub format_cells: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub insert_rows: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub insert_columns: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub delete_rows: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub delete_columns: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub sort: bool,
}

impl Default for SheetProtection {
    fn default() -> Self {
        Self {
            password_hash: None,
            select_locked_cells: true,
            select_unlocked_cells: true,
            format_cells: false,
            insert_rows: false,
            insert_columns: false,
            delete_rows: false,
            delete_columns: false,
            sort: false,
        }
    }
}

impl SheetProtection {
    pub fn with_password(password: Option<&str>) -> Self {
        Self {
            password_hash: password.filter(|p| !p.is_empty()).map(hash_legacy_password),
            ..Self::default()
        }
    }
}

/// Workbook-level lock on adding, removing, renaming and moving sheets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkbookProtection {
    pub lock_structure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<u16>,
}

/// Legacy 16-bit password hash used by worksheet and workbook protection.
///
/// Not a cryptographic hash: it only round-trips the value file formats store.
pub fn hash_legacy_password(password: &str) -> u16 {
    let mut hash: u16 = 0;
    let mut len: u16 = 0;

    // Only the first 15 UTF-16 units participate
    for (i, ch) in password.encode_utf16().take(15).enumerate() {
        len += 1;
        let shift = (i + 1) as u32;
        let rotated = (((ch as u32) << shift) & 0x7FFF) | ((ch as u32) >> (15 - shift));
        hash ^= rotated as u16;
    }

    hash ^ len ^ 0xCE4B
}

pub fn verify_legacy_password(password: &str, hash: u16) -> bool {
    hash_legacy_password(password) == hash
}
