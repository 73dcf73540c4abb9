//! Named range definitions and management
//!
//! Named ranges give meaningful names to cells or ranges, making formulas
//! more readable (e.g., =SUM(Revenue) instead of =SUM(A1:A100)).

use cellbook_core::{letters_to_col, CellRange, MAX_COLS, MAX_ROWS};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::formula::adjust::StructuralEdit;
use crate::formula::functions::is_known_function;
use crate::sheet::SheetId;

/// Where a name is visible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NameScope {
    Workbook,
    /// Only formulas on this sheet see the name; it shadows a workbook name.
    Sheet(SheetId),
}

/// A named range that maps a name to a rectangle on one sheet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedRange {
    /// Original case is preserved; lookups are case-insensitive
    pub name: String,
    pub sheet: SheetId,
    /// Target rectangle (no sheet qualifier)
    pub range: CellRange,
    pub scope: NameScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl NamedRange {
    pub fn new(name: impl Into<String>, sheet: SheetId, range: CellRange, scope: NameScope) -> Self {
        let mut range = range;
        range.sheet = None;
        Self { name: name.into(), sheet, range, scope, comment: None }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn references_cell(&self, sheet: SheetId, row: usize, col: usize) -> bool {
        self.sheet == sheet && self.range.contains(row, col)
    }
}

/// Validate a named range identifier
/// Rules:
/// - Must start with letter or underscore
/// - Can contain letters, numbers, underscores, and dots (for namespaces)
/// - Cannot be a cell reference (A1, BC23) or a range (A1:B2)
/// - Cannot be a function name (SUM, IF)
/// - Cannot be a boolean or error literal (TRUE, FALSE, #REF!)
pub fn is_valid_name(name: &str) -> Result<(), String> {
    let name = name.trim();

    let Some(first) = name.chars().next() else {
        return Err("Name cannot be empty".into());
    };

    if first.is_ascii_digit() {
        return Err("Name must start with a letter or underscore, not a digit".into());
    }
    if !first.is_alphabetic() && first != '_' {
        return Err("Name must start with a letter or underscore".into());
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
        return Err("Name can only contain letters, numbers, underscores, and dots".into());
    }
    if name.ends_with('.') {
        return Err("Name cannot end with a dot".into());
    }
    if name.contains("..") {
        return Err("Name cannot have consecutive dots".into());
    }

    let upper = name.to_uppercase();

    if looks_like_cell_ref(name) {
        return Err(format!("'{}' looks like a cell reference (e.g., A1, BC23)", name));
    }
    if upper == "TRUE" || upper == "FALSE" {
        return Err(format!("'{}' is a reserved boolean value", name));
    }
    const ERROR_WORDS: &[&str] = &["REF", "DIV", "NAME", "VALUE", "NUM", "NA", "NULL", "CIRC"];
    if ERROR_WORDS.contains(&upper.as_str()) {
        return Err(format!("'{}' conflicts with an error value", name));
    }
    if is_known_function(&upper) {
        return Err(format!("'{}' is a function name", name));
    }

    Ok(())
}

/// A1-style token within grid limits (letters then digits, nothing else)
fn looks_like_cell_ref(s: &str) -> bool {
    let split = s.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(s.len());
    let (letters, digits) = s.split_at(split);
    if letters.is_empty() || letters.len() > 3 || digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let col_ok = letters_to_col(letters).is_some_and(|c| c < MAX_COLS);
    let row_ok = digits.parse::<usize>().is_ok_and(|r| r >= 1 && r <= MAX_ROWS);
    col_ok && row_ok
}

/// Storage for named ranges in a workbook.
///
/// Keyed by (uppercased name, scope), so a sheet-scoped name may share its
/// spelling with a workbook name.
#[derive(Debug, Clone, Default)]
pub struct NamedRangeStore {
    ranges: FxHashMap<(String, NameScope), NamedRange>,
}

impl NamedRangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a named range
    pub fn define(&mut self, range: NamedRange) -> Result<(), String> {
        is_valid_name(&range.name)?;
        let mut range = range;
        range.name = range.name.trim().to_string();
        self.ranges.insert((range.name.to_uppercase(), range.scope), range);
        Ok(())
    }

    /// Exact lookup in one scope
    pub fn get(&self, name: &str, scope: NameScope) -> Option<&NamedRange> {
        self.ranges.get(&(name.to_uppercase(), scope))
    }

    /// Lookup as seen from a formula on `sheet`: sheet scope first, then workbook.
    pub fn resolve(&self, name: &str, sheet: SheetId) -> Option<&NamedRange> {
        let upper = name.to_uppercase();
        self.ranges
            .get(&(upper.clone(), NameScope::Sheet(sheet)))
            .or_else(|| self.ranges.get(&(upper, NameScope::Workbook)))
    }

    pub fn remove(&mut self, name: &str, scope: NameScope) -> Option<NamedRange> {
        self.ranges.remove(&(name.to_uppercase(), scope))
    }

    pub fn contains(&self, name: &str, scope: NameScope) -> bool {
        self.ranges.contains_key(&(name.to_uppercase(), scope))
    }

    /// All names, sorted by name then scope
    pub fn iter(&self) -> impl Iterator<Item = &NamedRange> {
        let mut all: Vec<&NamedRange> = self.ranges.values().collect();
        all.sort_by(|a, b| {
            a.name
                .to_uppercase()
                .cmp(&b.name.to_uppercase())
                .then_with(|| scope_key(a.scope).cmp(&scope_key(b.scope)))
        });
        all.into_iter()
    }

    /// Names that point at `sheet` or are scoped to it
    pub fn names_for_sheet(&self, sheet: SheetId) -> Vec<&NamedRange> {
        self.iter().filter(|n| n.sheet == sheet || n.scope == NameScope::Sheet(sheet)).collect()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Shift targets on the edited sheet. Names whose target is deleted
    /// entirely are dropped and returned.
    pub(crate) fn apply_edit(&mut self, edit: &StructuralEdit) -> Vec<NamedRange> {
        let mut dropped = Vec::new();
        self.ranges.retain(|_, nr| {
            if nr.sheet != edit.sheet() {
                return true;
            }
            match edit.map_rect(&nr.range) {
                Some(range) => {
                    nr.range = range;
                    true
                }
                None => {
                    dropped.push(nr.clone());
                    false
                }
            }
        });
        dropped
    }

    /// Drop names targeting or scoped to a removed sheet
    pub(crate) fn remove_sheet(&mut self, sheet: SheetId) {
        self.ranges.retain(|_, nr| nr.sheet != sheet && nr.scope != NameScope::Sheet(sheet));
    }
}

fn scope_key(scope: NameScope) -> (u8, u64) {
    match scope {
        NameScope::Workbook => (0, 0),
        NameScope::Sheet(id) => (1, id.raw()),
    }
}

impl Serialize for NamedRangeStore {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for NamedRangeStore {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let list: Vec<NamedRange> = Vec::deserialize(deserializer)?;
        let mut store = NamedRangeStore::new();
        for nr in list {
            store.ranges.insert((nr.name.to_uppercase(), nr.scope), nr);
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S1: SheetId = SheetId::from_raw(1);
    const S2: SheetId = SheetId::from_raw(2);

    fn range(s: &str) -> CellRange {
        CellRange::parse(s).unwrap()
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("Revenue").is_ok());
        assert!(is_valid_name("_tax_rate").is_ok());
        assert!(is_valid_name("ACME.Revenue").is_ok());
        assert!(is_valid_name("  Padded  ").is_ok());
        assert!(is_valid_name("ABCD1").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(is_valid_name("").is_err());
        assert!(is_valid_name("1abc").is_err());
        assert!(is_valid_name("my name").is_err());
        assert!(is_valid_name("A1").is_err());
        assert!(is_valid_name("xfd100").is_err());
        assert!(is_valid_name("TRUE").is_err());
        assert!(is_valid_name("sum").is_err());
        assert!(is_valid_name("ref").is_err());
        assert!(is_valid_name("end.").is_err());
        assert!(is_valid_name("a..b").is_err());
    }

    #[test]
    fn test_store_is_case_insensitive() {
        let mut store = NamedRangeStore::new();
        store.define(NamedRange::new("Revenue", S1, range("B2:B10"), NameScope::Workbook)).unwrap();
        assert!(store.contains("REVENUE", NameScope::Workbook));
        assert_eq!(store.get("revenue", NameScope::Workbook).unwrap().name, "Revenue");
        assert!(store.remove("reVENUE", NameScope::Workbook).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_sheet_scope_shadows_workbook_scope() {
        let mut store = NamedRangeStore::new();
        store.define(NamedRange::new("Rate", S1, range("A1"), NameScope::Workbook)).unwrap();
        store.define(NamedRange::new("Rate", S2, range("C3"), NameScope::Sheet(S2))).unwrap();

        assert_eq!(store.resolve("rate", S1).unwrap().range.to_string(), "A1");
        assert_eq!(store.resolve("rate", S2).unwrap().range.to_string(), "C3");
        assert_eq!(store.len(), 2);
        assert_eq!(store.names_for_sheet(S2).len(), 1);
    }

    #[test]
    fn test_apply_edit_shifts_and_drops() {
        let mut store = NamedRangeStore::new();
        store.define(NamedRange::new("Data", S1, range("A5:A9"), NameScope::Workbook)).unwrap();
        store.define(NamedRange::new("Gone", S1, range("C2"), NameScope::Workbook)).unwrap();
        store.define(NamedRange::new("Other", S2, range("A5"), NameScope::Workbook)).unwrap();

        let dropped = store.apply_edit(&StructuralEdit::DeleteRows { sheet: S1, at: 1, count: 1 });
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].name, "Gone");
        assert_eq!(store.get("data", NameScope::Workbook).unwrap().range.to_string(), "A4:A8");
        assert_eq!(store.get("other", NameScope::Workbook).unwrap().range.to_string(), "A5");
    }

    #[test]
    fn test_serde_round_trip() {
        let mut store = NamedRangeStore::new();
        store.define(NamedRange::new("Data", S1, range("A1:B2"), NameScope::Sheet(S1)).with_comment("inputs")).unwrap();
        let json = serde_json::to_string(&store).unwrap();
        let back: NamedRangeStore = serde_json::from_str(&json).unwrap();
        let nr = back.get("DATA", NameScope::Sheet(S1)).unwrap();
        assert_eq!(nr.comment.as_deref(), Some("inputs"));
    }
}
