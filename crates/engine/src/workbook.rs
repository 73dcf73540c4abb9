use std::borrow::Cow;
use std::time::Instant;

use cellbook_config::{EngineConfig, RecalcMode};
use cellbook_core::CellRange;
use chrono::NaiveDateTime;
use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::cell::{Cell, CellValue, Comment, Formula};
use crate::cell_id::CellId;
use crate::conditional;
use crate::dep_graph::DepGraph;
use crate::error::{EngineError, Result};
use crate::formula::adjust::invalidate_sheet;
use crate::formula::eval::{evaluate, evaluate_formula, CellLookup, NamedRangeResolution};
use crate::formula::parser::{bind_expr, format_expr, parse, BoundExpr, Expr};
use crate::formula::refs::{has_range_refs, referenced_cells};
use crate::formula::value::{CellError, Value};
use crate::named_range::{is_valid_name, NameScope, NamedRange, NamedRangeStore};
use crate::protection::{hash_legacy_password, verify_legacy_password, WorkbookProtection};
use crate::recalc::{EvalState, RecalcReport};
use crate::sheet::{Sheet, SheetId, SheetRef};
use crate::style::{Style, StyleId, StylePool};
use crate::table::{DataTable, NamedTable, TableValue};

/// Longest sheet name accepted by the file formats
pub const MAX_SHEET_NAME_LEN: usize = 31;

/// Check a sheet name: non-empty, at most 31 characters, none of `[]:*?/\`,
/// and no leading or trailing apostrophe.
pub fn validate_sheet_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| EngineError::InvalidSheetName { name: name.to_string(), reason: reason.to_string() };
    if name.trim().is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.chars().count() > MAX_SHEET_NAME_LEN {
        return Err(invalid("name is longer than 31 characters"));
    }
    if let Some(c) = name.chars().find(|c| matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\')) {
        return Err(invalid(&format!("'{}' is not allowed", c)));
    }
    if name.starts_with('\'') || name.ends_with('\'') {
        return Err(invalid("name cannot start or end with an apostrophe"));
    }
    Ok(())
}

/// Document properties
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub author: Option<String>,
    pub title: Option<String>,
    pub subject: Option<String>,
    pub comments: Option<String>,
    pub keywords: Option<String>,
    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
    pub last_printed: Option<NaiveDateTime>,
}

/// A workbook containing one or more sheets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workbook {
    pub(crate) sheets: Vec<Sheet>,
    pub(crate) active_sheet: usize,
    /// Next ID to assign to a new sheet. Monotonically increasing, never reused.
    #[serde(default = "default_next_sheet_id")]
    next_sheet_id: u64,
    #[serde(default)]
    pub(crate) names: NamedRangeStore,
    #[serde(default)]
    pub(crate) tables: Vec<NamedTable>,
    #[serde(default)]
    pub(crate) styles: StylePool,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    protection: WorkbookProtection,

    #[serde(skip)]
    pub(crate) config: EngineConfig,

    /// Dependency graph for formula cells.
    /// Rebuilt on load, updated incrementally on cell changes.
    #[serde(skip)]
    pub(crate) dep_graph: DepGraph,

    /// Upper bound of each sheet's extent. Range edges in the graph were
    /// expanded against these; growing one past its bound forces a rebuild
    /// when any formula reads a range.
    #[serde(skip)]
    pub(crate) extents: FxHashMap<SheetId, (usize, usize)>,
    #[serde(skip)]
    pub(crate) has_range_formulas: bool,
}

fn default_next_sheet_id() -> u64 {
    1
}

impl Default for Workbook {
    fn default() -> Self {
        Self::new()
    }
}

impl Workbook {
    /// Create a new workbook with one sheet named "Sheet1"
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let sheet = Sheet::new(SheetId::from_raw(1), "Sheet1");
        Self {
            sheets: vec![sheet],
            active_sheet: 0,
            next_sheet_id: 2,
            names: NamedRangeStore::new(),
            tables: Vec::new(),
            styles: StylePool::new(),
            metadata: Metadata::default(),
            protection: WorkbookProtection::default(),
            config,
            dep_graph: DepGraph::new(),
            extents: FxHashMap::default(),
            has_range_formulas: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replace the configuration. Switching to automatic mode recalculates.
    pub fn set_config(&mut self, config: EngineConfig) {
        let was_manual = self.config.recalc == RecalcMode::Manual;
        self.config = config;
        if was_manual && self.config.recalc == RecalcMode::Automatic {
            self.recalculate();
        }
    }

    pub fn set_recalc_mode(&mut self, mode: RecalcMode) {
        let mut config = self.config.clone();
        config.recalc = mode;
        self.set_config(config);
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn styles(&self) -> &StylePool {
        &self.styles
    }

    pub fn styles_mut(&mut self) -> &mut StylePool {
        &mut self.styles
    }

    // =========================================================================
    // Sheets
    // =========================================================================

    /// Generate a new unique SheetId (monotonically increasing, never reused)
    fn generate_sheet_id(&mut self) -> SheetId {
        let id = SheetId::from_raw(self.next_sheet_id);
        self.next_sheet_id += 1;
        id
    }

    pub fn sheet_count(&self) -> usize {
        self.sheets.len()
    }

    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(Sheet::name).collect()
    }

    pub fn active_sheet_index(&self) -> usize {
        self.active_sheet
    }

    pub fn active_sheet(&self) -> &Sheet {
        &self.sheets[self.active_sheet]
    }

    pub fn set_active_sheet(&mut self, index: usize) -> Result<()> {
        self.sheet_checked(index)?;
        self.active_sheet = index;
        Ok(())
    }

    pub fn sheet(&self, index: usize) -> Option<&Sheet> {
        self.sheets.get(index)
    }

    /// Raw sheet access for layout, drawings and bulk loading.
    ///
    /// Cell contents written through it bypass dependency tracking; call
    /// [`Workbook::rebuild`] once done.
    pub fn sheet_mut(&mut self, index: usize) -> Option<&mut Sheet> {
        self.sheets.get_mut(index)
    }

    /// Case-insensitive lookup
    pub fn sheet_by_name(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name().eq_ignore_ascii_case(name))
    }

    pub fn sheet_by_id(&self, id: SheetId) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.id() == id)
    }

    fn sheet_by_id_mut(&mut self, id: SheetId) -> Option<&mut Sheet> {
        self.sheets.iter_mut().find(|s| s.id() == id)
    }

    /// Index of a sheet by its ID
    pub fn sheet_index(&self, id: SheetId) -> Option<usize> {
        self.sheets.iter().position(|s| s.id() == id)
    }

    pub fn sheet_index_by_name(&self, name: &str) -> Option<usize> {
        self.sheets.iter().position(|s| s.name().eq_ignore_ascii_case(name))
    }

    pub fn sheet_id_by_name(&self, name: &str) -> Option<SheetId> {
        self.sheet_by_name(name).map(Sheet::id)
    }

    pub(crate) fn sheet_checked(&self, index: usize) -> Result<&Sheet> {
        self.sheets
            .get(index)
            .ok_or_else(|| EngineError::SheetNotFound(format!("index {}", index)))
    }

    fn check_structure_unlocked(&self, action: &str) -> Result<()> {
        if self.protection.lock_structure {
            return Err(EngineError::Protected(format!("cannot {}", action)));
        }
        Ok(())
    }

    fn check_name_available(&self, name: &str, exclude: Option<SheetId>) -> Result<()> {
        validate_sheet_name(name)?;
        let taken = self
            .sheets
            .iter()
            .any(|s| Some(s.id()) != exclude && s.name().eq_ignore_ascii_case(name));
        if taken {
            return Err(EngineError::DuplicateSheetName(name.to_string()));
        }
        Ok(())
    }

    /// First free name of the form `base`, `base (2)`, `base (3)`...
    pub(crate) fn unique_sheet_name(&self, base: &str) -> String {
        let base: String = if base.trim().is_empty() { "Sheet".to_string() } else { base.chars().take(MAX_SHEET_NAME_LEN).collect() };
        if self.sheet_by_name(&base).is_none() {
            return base;
        }
        (2..)
            .map(|n| {
                let suffix = format!(" ({})", n);
                let keep = MAX_SHEET_NAME_LEN.saturating_sub(suffix.len());
                format!("{}{}", base.chars().take(keep).collect::<String>(), suffix)
            })
            .find(|candidate| self.sheet_by_name(candidate).is_none())
            .unwrap_or(base)
    }

    /// Append a sheet and return its index
    pub fn add_sheet(&mut self, name: &str) -> Result<usize> {
        self.check_structure_unlocked("add a sheet")?;
        self.check_name_available(name, None)?;
        let id = self.generate_sheet_id();
        self.sheets.push(Sheet::new(id, name));
        debug!("added sheet '{}' ({})", name, id.raw());
        Ok(self.sheets.len() - 1)
    }

    /// Remove a sheet. References into it become `#REF!`, names pointing at
    /// it and tables on it are dropped. The last sheet cannot be removed.
    pub fn remove_sheet(&mut self, index: usize) -> Result<()> {
        self.check_structure_unlocked("remove a sheet")?;
        let id = self.sheet_checked(index)?.id();
        if self.sheets.len() == 1 {
            return Err(EngineError::Precondition("A workbook must contain at least one sheet".into()));
        }

        let removed = self.sheets.remove(index);
        if self.active_sheet >= self.sheets.len() {
            self.active_sheet = self.sheets.len() - 1;
        } else if self.active_sheet > index {
            self.active_sheet -= 1;
        }

        for sheet in &mut self.sheets {
            for (_, cell) in sheet.cells_unordered_mut() {
                if let CellValue::Formula(f) = &mut cell.value {
                    if let Some(expr) = &f.expr {
                        let invalidated = invalidate_sheet(expr, id);
                        if invalidated != *expr {
                            f.expr = Some(invalidated);
                        }
                    }
                }
            }
        }
        self.refresh_formula_sources();
        self.names.remove_sheet(id);
        self.tables.retain(|t| t.sheet != id);
        self.extents.remove(&id);

        debug!("removed sheet '{}'", removed.name());
        self.structure_changed();
        Ok(())
    }

    /// Rename a sheet; formulas referring to it show the new name.
    pub fn rename_sheet(&mut self, index: usize, new_name: &str) -> Result<()> {
        self.check_structure_unlocked("rename a sheet")?;
        let id = self.sheet_checked(index)?.id();
        self.check_name_available(new_name, Some(id))?;
        self.sheets[index].set_name(new_name);
        self.refresh_formula_sources();
        Ok(())
    }

    /// Move the named sheet to `position` (clamped). The active sheet stays
    /// the same sheet.
    pub fn move_sheet(&mut self, name: &str, position: usize) -> Result<()> {
        self.check_structure_unlocked("move a sheet")?;
        let from = self
            .sheet_index_by_name(name)
            .ok_or_else(|| EngineError::SheetNotFound(name.to_string()))?;
        let active_id = self.sheets[self.active_sheet].id();
        let sheet = self.sheets.remove(from);
        let to = position.min(self.sheets.len());
        self.sheets.insert(to, sheet);
        self.active_sheet = self.sheet_index(active_id).unwrap_or(0);
        Ok(())
    }

    /// Duplicate a sheet under a new name, appended at the end. Formulas
    /// without a sheet qualifier point at the copy.
    pub fn copy_sheet(&mut self, index: usize, new_name: &str) -> Result<usize> {
        self.check_structure_unlocked("add a sheet")?;
        let mut copy = self.sheet_checked(index)?.clone();
        self.check_name_available(new_name, None)?;
        let id = self.generate_sheet_id();
        copy.set_id(id);
        copy.set_name(new_name);
        self.sheets.push(copy);
        self.structure_changed();
        Ok(self.sheets.len() - 1)
    }

    /// Copy a sheet into another workbook. Styles are re-interned there and
    /// formulas are re-bound by sheet name in the target.
    pub fn copy_sheet_to(&self, other: &mut Workbook, index: usize, new_name: &str) -> Result<usize> {
        other.check_structure_unlocked("add a sheet")?;
        let source = self.sheet_checked(index)?;
        other.check_name_available(new_name, None)?;

        let mut copy = source.clone();
        let id = other.generate_sheet_id();
        copy.set_id(id);
        copy.set_name(new_name);

        let mut style_map: FxHashMap<StyleId, StyleId> = FxHashMap::default();
        for (_, cell) in copy.cells_unordered_mut() {
            if !cell.style.is_default() {
                let mapped = *style_map
                    .entry(cell.style)
                    .or_insert_with(|| other.styles.intern(self.styles.get(cell.style).clone()));
                cell.style = mapped;
            }
            if let CellValue::Formula(f) = &mut cell.value {
                f.expr = None;
            }
            cell.cached = Value::Empty;
            cell.state = EvalState::Unevaluated;
        }

        other.sheets.push(copy);
        other.rebuild();
        Ok(other.sheets.len() - 1)
    }

    // =========================================================================
    // Workbook protection
    // =========================================================================

    /// Lock sheet add/remove/rename/move.
    pub fn protect_structure(&mut self, password: Option<&str>) {
        self.protection = WorkbookProtection {
            lock_structure: true,
            password_hash: password.filter(|p| !p.is_empty()).map(hash_legacy_password),
        };
    }

    /// Unlock the structure; the password must match when one was set.
    pub fn unprotect_structure(&mut self, password: Option<&str>) -> Result<()> {
        if let Some(hash) = self.protection.password_hash {
            match password {
                Some(p) if verify_legacy_password(p, hash) => {}
                _ => return Err(EngineError::WrongPassword),
            }
        }
        self.protection = WorkbookProtection::default();
        Ok(())
    }

    pub fn is_structure_protected(&self) -> bool {
        self.protection.lock_structure
    }

    pub fn workbook_protection(&self) -> &WorkbookProtection {
        &self.protection
    }

    pub fn set_workbook_protection(&mut self, protection: WorkbookProtection) {
        self.protection = protection;
    }

    // =========================================================================
    // Cell content
    // =========================================================================

    pub(crate) fn check_bounds(&self, row: usize, col: usize) -> Result<()> {
        let limits = &self.config.limits;
        if row >= limits.max_rows || col >= limits.max_cols {
            return Err(EngineError::OutOfBounds { row, col });
        }
        Ok(())
    }

    /// Set a cell from typed input, inferring its type.
    pub fn set_value(&mut self, sheet: usize, row: usize, col: usize, input: &str) -> Result<()> {
        self.set_cell_value(sheet, row, col, CellValue::infer(input))
    }

    pub fn set_formula(&mut self, sheet: usize, row: usize, col: usize, formula: &str) -> Result<()> {
        self.set_cell_value(sheet, row, col, CellValue::Formula(Formula::new(formula)))
    }

    /// Store a value; formulas are parsed and bound, and fail with
    /// `InvalidFormula` on a syntax error. Dependents are recalculated in
    /// automatic mode and marked unevaluated in manual mode.
    pub fn set_cell_value(&mut self, sheet: usize, row: usize, col: usize, value: CellValue) -> Result<()> {
        self.check_bounds(row, col)?;
        let sheet_id = self.sheet_checked(sheet)?.id();
        let value = match value {
            CellValue::Formula(f) => CellValue::Formula(self.bind_formula(&f.source)?),
            other => other,
        };

        let ws = &mut self.sheets[sheet];
        let cell = ws.cell_mut_or_create(row, col);
        cell.value = value;
        cell.cached = Value::Empty;
        cell.state = EvalState::Unevaluated;
        ws.prune(row, col);

        self.cells_changed(&[CellId::new(sheet_id, row, col)]);
        Ok(())
    }

    /// Set a cell addressed as `B3` (active sheet) or `Sheet2!B3`.
    pub fn set_value_at(&mut self, address: &str, input: &str) -> Result<()> {
        let (sheet, row, col) = self.resolve_address(address)?;
        self.set_value(sheet, row, col, input)
    }

    /// Computed value of a cell addressed as `B3` or `Sheet2!B3`.
    pub fn value_at(&self, address: &str) -> Result<Value> {
        let (sheet, row, col) = self.resolve_address(address)?;
        Ok(self.value(sheet, row, col))
    }

    fn resolve_address(&self, address: &str) -> Result<(usize, usize, usize)> {
        let range = CellRange::parse(address)?;
        let sheet = match &range.sheet {
            Some(name) => self
                .sheet_index_by_name(name)
                .ok_or_else(|| EngineError::SheetNotFound(name.clone()))?,
            None => self.active_sheet,
        };
        Ok((sheet, range.start.row, range.start.col))
    }

    /// Value as formulas see it; formula cells give their last result.
    pub fn value(&self, sheet: usize, row: usize, col: usize) -> Value {
        self.sheets
            .get(sheet)
            .map_or(Value::Empty, |s| s.computed_value(row, col, self.config.date_system))
    }

    pub fn cell(&self, sheet: usize, row: usize, col: usize) -> Option<&Cell> {
        self.sheets.get(sheet)?.cell(row, col)
    }

    /// Formatted text, applying the cell's number format
    pub fn display(&self, sheet: usize, row: usize, col: usize) -> String {
        self.sheets
            .get(sheet)
            .map(|s| s.display_text(row, col, &self.styles, self.config.date_system))
            .unwrap_or_default()
    }

    pub fn formula_text(&self, sheet: usize, row: usize, col: usize) -> Option<String> {
        self.cell(sheet, row, col)?.value.formula().map(|f| f.source.clone())
    }

    pub fn eval_state(&self, sheet: usize, row: usize, col: usize) -> Option<EvalState> {
        self.cell(sheet, row, col).filter(|c| c.is_formula()).map(|c| c.state)
    }

    pub fn set_comment(&mut self, sheet: usize, row: usize, col: usize, comment: Option<Comment>) -> Result<()> {
        self.check_bounds(row, col)?;
        self.sheet_checked(sheet)?;
        let ws = &mut self.sheets[sheet];
        ws.cell_mut_or_create(row, col).comment = comment;
        ws.prune(row, col);
        Ok(())
    }

    pub fn set_hyperlink(&mut self, sheet: usize, row: usize, col: usize, url: Option<String>) -> Result<()> {
        self.check_bounds(row, col)?;
        self.sheet_checked(sheet)?;
        let ws = &mut self.sheets[sheet];
        ws.cell_mut_or_create(row, col).hyperlink = url;
        ws.prune(row, col);
        Ok(())
    }

    /// Remove values and formulas; styles, comments and links stay.
    pub fn clear_contents(&mut self, sheet: usize, range: &CellRange) -> Result<()> {
        let sheet_id = self.sheet_checked(sheet)?.id();
        let ws = &mut self.sheets[sheet];
        let targets = stored_positions(ws, range);
        for &(row, col) in &targets {
            if let Some(cell) = ws.cell_mut(row, col) {
                cell.clear_content();
            }
            ws.prune(row, col);
        }
        let changed: Vec<CellId> = targets.into_iter().map(|(r, c)| CellId::new(sheet_id, r, c)).collect();
        self.cells_changed(&changed);
        Ok(())
    }

    /// Remove everything in the range, including styles and merges inside it.
    pub fn clear_all(&mut self, sheet: usize, range: &CellRange) -> Result<()> {
        let sheet_id = self.sheet_checked(sheet)?.id();
        let ws = &mut self.sheets[sheet];
        let targets = stored_positions(ws, range);
        for &(row, col) in &targets {
            ws.take_cell(row, col);
        }
        ws.remove_merges_within(range);
        let changed: Vec<CellId> = targets.into_iter().map(|(r, c)| CellId::new(sheet_id, r, c)).collect();
        self.cells_changed(&changed);
        Ok(())
    }

    // =========================================================================
    // Styles
    // =========================================================================

    pub fn style_of(&self, sheet: usize, row: usize, col: usize) -> &Style {
        let id = self.cell(sheet, row, col).map_or(StyleId::DEFAULT, |c| c.style);
        self.styles.get(id)
    }

    /// Apply one style to every cell of the range
    pub fn set_style(&mut self, sheet: usize, range: &CellRange, style: Style) -> Result<StyleId> {
        self.check_bounds(range.end.row, range.end.col)?;
        self.sheet_checked(sheet)?;
        let id = self.styles.intern(style);
        let ws = &mut self.sheets[sheet];
        for (row, col) in range.iter() {
            ws.cell_mut_or_create(row, col).style = id;
            ws.prune(row, col);
        }
        Ok(id)
    }

    /// Edit the style of every cell in the range. Each distinct source
    /// style is derived once, so cells sharing a style keep sharing one.
    pub fn update_style<F>(&mut self, sheet: usize, range: &CellRange, mut edit: F) -> Result<()>
    where
        F: FnMut(&mut Style),
    {
        self.check_bounds(range.end.row, range.end.col)?;
        self.sheet_checked(sheet)?;
        let mut derived: FxHashMap<StyleId, StyleId> = FxHashMap::default();
        for (row, col) in range.iter() {
            let old = self.sheets[sheet].cell(row, col).map_or(StyleId::DEFAULT, |c| c.style);
            let new = match derived.get(&old) {
                Some(id) => *id,
                None => {
                    let id = self.styles.derive(old, |s| edit(s));
                    derived.insert(old, id);
                    id
                }
            };
            let ws = &mut self.sheets[sheet];
            ws.cell_mut_or_create(row, col).style = new;
            ws.prune(row, col);
        }
        Ok(())
    }

    pub fn set_number_format(&mut self, sheet: usize, range: &CellRange, code: &str) -> Result<()> {
        self.update_style(sheet, range, |s| s.number_format = code.to_string())
    }

    /// Style as displayed: the cell's style with the first matching
    /// conditional rule applied. Evaluated on every call.
    pub fn effective_style(&self, sheet: usize, row: usize, col: usize) -> Cow<'_, Style> {
        let base = self.style_of(sheet, row, col);
        let Some(ws) = self.sheets.get(sheet) else {
            return Cow::Borrowed(base);
        };
        if ws.conditional_formats().is_empty() {
            return Cow::Borrowed(base);
        }
        let value = ws.computed_value(row, col, self.config.date_system);
        match conditional::resolve(ws.conditional_formats(), row, col, &value) {
            Some(over) => Cow::Owned(over.apply(base)),
            None => Cow::Borrowed(base),
        }
    }

    // =========================================================================
    // Named ranges
    // =========================================================================

    pub fn named_ranges(&self) -> &NamedRangeStore {
        &self.names
    }

    /// Define (or redefine) a name for `target`, e.g. `Sheet1!A1:B2`. An
    /// unqualified target refers to the scope's sheet, or the active sheet
    /// for workbook names.
    pub fn define_name(&mut self, name: &str, target: &str, scope: NameScope) -> Result<()> {
        let range = CellRange::parse(target)?;
        let sheet = match &range.sheet {
            Some(sheet_name) => self
                .sheet_id_by_name(sheet_name)
                .ok_or_else(|| EngineError::SheetNotFound(sheet_name.clone()))?,
            None => match scope {
                NameScope::Sheet(id) => id,
                NameScope::Workbook => self.active_sheet().id(),
            },
        };
        if let NameScope::Sheet(id) = scope {
            if self.sheet_by_id(id).is_none() {
                return Err(EngineError::SheetNotFound(format!("id {}", id.raw())));
            }
        }
        self.names
            .define(NamedRange::new(name, sheet, range, scope))
            .map_err(EngineError::InvalidName)?;
        self.structure_changed();
        Ok(())
    }

    /// Store a fully formed name as read from a file. Values are not
    /// refreshed; call [`Workbook::rebuild`] once loading is done.
    pub fn insert_name(&mut self, name: NamedRange) -> Result<()> {
        if self.sheet_by_id(name.sheet).is_none() {
            return Err(EngineError::SheetNotFound(format!("id {}", name.sheet.raw())));
        }
        if let NameScope::Sheet(id) = name.scope {
            if self.sheet_by_id(id).is_none() {
                return Err(EngineError::SheetNotFound(format!("id {}", id.raw())));
            }
        }
        self.names.define(name).map_err(EngineError::InvalidName)
    }

    pub fn remove_name(&mut self, name: &str, scope: NameScope) -> bool {
        let removed = self.names.remove(name, scope).is_some();
        if removed {
            self.structure_changed();
        }
        removed
    }

    /// Absolute address of a name as seen from the active sheet, e.g.
    /// `Sheet1!$A$1:$B$2`.
    pub fn find_name(&self, name: &str) -> Option<String> {
        let nr = self.names.resolve(name, self.active_sheet().id())?;
        let sheet = self.sheet_by_id(nr.sheet)?;
        Some(nr.range.clone().with_sheet(sheet.name()).to_absolute_string())
    }

    // =========================================================================
    // Named tables and data sets
    // =========================================================================

    pub fn add_named_table(&mut self, sheet: usize, name: &str, range: CellRange) -> Result<()> {
        let sheet_id = self.sheet_checked(sheet)?.id();
        is_valid_name(name).map_err(EngineError::InvalidName)?;
        if self.named_table(name).is_some() {
            return Err(EngineError::InvalidName(format!("a table named '{}' already exists", name)));
        }
        if range.rows() < 2 {
            return Err(EngineError::Precondition("A table needs a header row and at least one data row".into()));
        }
        if let Some(clash) = self.tables.iter().find(|t| t.sheet == sheet_id && t.range.overlaps(&range)) {
            return Err(EngineError::Precondition(format!("Table overlaps table '{}'", clash.name)));
        }
        self.tables.push(NamedTable::new(name.trim(), sheet_id, range));
        Ok(())
    }

    pub fn named_table(&self, name: &str) -> Option<&NamedTable> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn named_table_mut(&mut self, name: &str) -> Option<&mut NamedTable> {
        self.tables.iter_mut().find(|t| t.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn named_tables(&self) -> &[NamedTable] {
        &self.tables
    }

    pub fn named_table_names(&self, sheet: usize) -> Vec<&str> {
        let Some(id) = self.sheets.get(sheet).map(Sheet::id) else {
            return Vec::new();
        };
        self.tables.iter().filter(|t| t.sheet == id).map(|t| t.name.as_str()).collect()
    }

    pub fn remove_named_table(&mut self, name: &str) -> bool {
        let before = self.tables.len();
        self.tables.retain(|t| !t.name.eq_ignore_ascii_case(name.trim()));
        self.tables.len() != before
    }

    /// Typed copy of a sheet's used range. Formula cells contribute their
    /// results; dates stay dates.
    pub fn to_table(&self, sheet: usize, first_row_is_header: bool) -> Result<DataTable> {
        let ws = self.sheet_checked(sheet)?;
        let Some(used) = ws.used_range() else {
            return Ok(DataTable::new(ws.name(), Vec::<String>::new()));
        };

        let mut first_row = used.start.row;
        let headers: Vec<String> = (used.start.col..=used.end.col)
            .enumerate()
            .map(|(i, col)| {
                let text = if first_row_is_header { self.display(sheet, used.start.row, col) } else { String::new() };
                if text.trim().is_empty() { format!("Column{}", i + 1) } else { text }
            })
            .collect();
        if first_row_is_header {
            first_row += 1;
        }

        let mut table = DataTable::new(ws.name(), headers);
        for row in first_row..=used.end.row {
            let values = (used.start.col..=used.end.col)
                .map(|col| match ws.cell(row, col).map(|c| &c.value) {
                    Some(CellValue::Date(dt)) => TableValue::Date(*dt),
                    _ => TableValue::from(ws.computed_value(row, col, self.config.date_system)),
                })
                .collect();
            table.push_row(values);
        }
        Ok(table)
    }

    /// Every sheet as a table, first row taken as the header
    pub fn to_data_set(&self) -> Vec<DataTable> {
        (0..self.sheets.len())
            .filter_map(|i| self.to_table(i, true).ok())
            .collect()
    }

    /// Append a sheet holding the table: column names in row 1, data below.
    /// The sheet takes the table's name, made unique if needed.
    pub fn add_sheet_from_table(&mut self, table: &DataTable) -> Result<SheetId> {
        let limits = &self.config.limits;
        if table.rows.len() + 1 > limits.max_rows || table.column_count() > limits.max_cols {
            return Err(EngineError::OutOfBounds { row: table.rows.len(), col: table.column_count() });
        }
        let name = self.unique_sheet_name(&table.name);
        let index = self.add_sheet(&name)?;

        let ws = &mut self.sheets[index];
        for (col, column) in table.columns.iter().enumerate() {
            ws.put_cell(0, col, Cell::with_value(CellValue::Text(column.name.clone())));
        }
        for (r, row) in table.rows.iter().enumerate() {
            for (col, value) in row.iter().enumerate() {
                ws.put_cell(r + 1, col, Cell::with_value(value.to_cell_value()));
            }
        }
        let id = ws.id();
        self.rebuild();
        Ok(id)
    }

    // =========================================================================
    // Formula binding
    // =========================================================================

    /// Parse and bind formula text against the current sheet names.
    /// The stored source is the canonical rendering of the bound AST.
    pub(crate) fn bind_formula(&self, source: &str) -> Result<Formula> {
        let parsed = parse(source).map_err(|reason| EngineError::InvalidFormula {
            formula: source.to_string(),
            reason,
        })?;
        let expr = bind_expr(&parsed, |name| self.sheet_id_by_name(name));
        Ok(Formula { source: self.format_formula(&expr), expr: Some(expr) })
    }

    pub(crate) fn format_formula(&self, expr: &BoundExpr) -> String {
        format_expr(expr, |id| self.sheet_by_id(id).map(|s| s.name().to_string()))
    }

    /// Regenerate every formula's text from its AST (after renames and
    /// sheet removal).
    pub(crate) fn refresh_formula_sources(&mut self) {
        let names: FxHashMap<SheetId, String> = self.sheets.iter().map(|s| (s.id(), s.name().to_string())).collect();
        for sheet in &mut self.sheets {
            for (_, cell) in sheet.cells_unordered_mut() {
                if let CellValue::Formula(f) = &mut cell.value {
                    if let Some(expr) = &f.expr {
                        f.source = format_expr(expr, |id| names.get(&id).cloned());
                    }
                }
            }
        }
    }

    /// Bind unbound formulas, rebuild the dependency graph and recalculate
    /// everything. Call after deserializing or after writing cells through
    /// [`Workbook::sheet_mut`].
    pub fn rebuild(&mut self) -> RecalcReport {
        let mut bound: Vec<(usize, (usize, usize), BoundExpr)> = Vec::new();
        for (idx, sheet) in self.sheets.iter().enumerate() {
            for (&pos, cell) in sheet.cells_unordered() {
                let Some(f) = cell.value.formula() else { continue };
                if f.expr.is_some() {
                    continue;
                }
                let expr = match parse(&f.source) {
                    Ok(parsed) => bind_expr(&parsed, |name| self.sheet_id_by_name(name)),
                    Err(reason) => {
                        warn!("{}!{}: unparseable formula '{}': {}", sheet.name(), CellRange::cell(pos.0, pos.1), f.source, reason);
                        Expr::Error(CellError::Name)
                    }
                };
                bound.push((idx, pos, expr));
            }
        }
        for (idx, (row, col), expr) in bound {
            if let Some(CellValue::Formula(f)) = self.sheets[idx].cell_mut(row, col).map(|c| &mut c.value) {
                f.expr = Some(expr);
            }
        }

        self.rebuild_dep_graph();
        self.recalculate()
    }

    // =========================================================================
    // Dependency graph
    // =========================================================================

    pub fn dep_graph(&self) -> &DepGraph {
        &self.dep_graph
    }

    /// Cells the formula at this position reads
    pub fn precedents(&self, sheet: usize, row: usize, col: usize) -> Vec<CellId> {
        self.cell_id(sheet, row, col)
            .map(|id| {
                let mut cells: Vec<CellId> = self.dep_graph.precedents(id).collect();
                cells.sort();
                cells
            })
            .unwrap_or_default()
    }

    /// Formulas that read this position directly
    pub fn dependents(&self, sheet: usize, row: usize, col: usize) -> Vec<CellId> {
        self.cell_id(sheet, row, col)
            .map(|id| {
                let mut cells: Vec<CellId> = self.dep_graph.dependents(id).collect();
                cells.sort();
                cells
            })
            .unwrap_or_default()
    }

    fn cell_id(&self, sheet: usize, row: usize, col: usize) -> Option<CellId> {
        self.sheets.get(sheet).map(|s| CellId::new(s.id(), row, col))
    }

    /// Rebuild the dependency graph from scratch
    pub(crate) fn rebuild_dep_graph(&mut self) {
        self.dep_graph.clear();
        self.extents = self.sheets.iter().map(|s| (s.id(), s.extent())).collect();

        let mut edges: Vec<(CellId, FxHashSet<CellId>)> = Vec::new();
        let mut has_ranges = false;
        for sheet in &self.sheets {
            let lookup = WorkbookLookup::new(self, sheet.id());
            for (&(row, col), cell) in sheet.cells_unordered() {
                if let Some(expr) = cell.value.formula().and_then(|f| f.expr.as_ref()) {
                    has_ranges |= has_range_refs(expr);
                    edges.push((CellId::new(sheet.id(), row, col), referenced_cells(expr, &lookup)));
                }
            }
        }
        for (cell, preds) in edges {
            self.dep_graph.replace_edges(cell, preds);
        }
        self.has_range_formulas = has_ranges;
    }

    fn update_cell_deps(&mut self, id: CellId) {
        let preds = self
            .sheet_by_id(id.sheet)
            .and_then(|s| s.cell(id.row, id.col))
            .and_then(|c| c.value.formula())
            .and_then(|f| f.expr.as_ref())
            .map(|expr| (has_range_refs(expr), referenced_cells(expr, &WorkbookLookup::new(self, id.sheet))));
        match preds {
            Some((ranges, preds)) => {
                self.has_range_formulas |= ranges;
                self.dep_graph.replace_edges(id, preds);
            }
            None => self.dep_graph.clear_cell(id),
        }
    }

    /// Record edits to individual cells: update their edges, then
    /// recalculate or mark dirty according to the recalc mode.
    pub(crate) fn cells_changed(&mut self, changed: &[CellId]) {
        let mut grew = false;
        for id in changed {
            let occupied = self
                .sheet_by_id(id.sheet)
                .is_some_and(|s| s.cell(id.row, id.col).is_some());
            if occupied {
                let bound = self.extents.entry(id.sheet).or_insert((0, 0));
                if id.row >= bound.0 || id.col >= bound.1 {
                    bound.0 = bound.0.max(id.row + 1);
                    bound.1 = bound.1.max(id.col + 1);
                    grew = true;
                }
            }
        }

        for &id in changed {
            self.update_cell_deps(id);
        }
        if grew && self.has_range_formulas {
            self.rebuild_dep_graph();
        }

        match self.config.recalc {
            RecalcMode::Automatic => {
                self.recalculate_from(changed);
            }
            RecalcMode::Manual => self.mark_dirty(changed),
        }
    }

    /// After edits that may touch any formula: rebuild edges and
    /// recalculate (or mark everything dirty in manual mode).
    pub(crate) fn structure_changed(&mut self) {
        self.rebuild_dep_graph();
        match self.config.recalc {
            RecalcMode::Automatic => {
                self.recalculate();
            }
            RecalcMode::Manual => {
                for sheet in &mut self.sheets {
                    for (_, cell) in sheet.cells_unordered_mut() {
                        if cell.is_formula() {
                            cell.state = EvalState::Unevaluated;
                        }
                    }
                }
            }
        }
    }

    fn mark_dirty(&mut self, changed: &[CellId]) {
        let mut dirty = self.dep_graph.dependents_closure(changed);
        dirty.extend(changed.iter().copied());
        for id in dirty {
            if let Some(cell) = self.formula_cell_mut(id) {
                cell.state = EvalState::Unevaluated;
            }
        }
    }

    fn formula_cell_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        self.sheet_by_id_mut(id.sheet)?
            .cell_mut(id.row, id.col)
            .filter(|c| c.is_formula())
    }

    // =========================================================================
    // Recalculation
    // =========================================================================

    /// Evaluate every formula in dependency order. Cells on a cycle get
    /// `#CIRC!` and the pass continues with the rest.
    pub fn recalculate(&mut self) -> RecalcReport {
        let all: FxHashSet<CellId> = self
            .sheets
            .iter()
            .flat_map(|s| {
                let id = s.id();
                s.cells_unordered()
                    .filter(|(_, c)| c.is_formula())
                    .map(move |(&(row, col), _)| CellId::new(id, row, col))
            })
            .collect();
        self.run_pass(all)
    }

    /// Re-evaluate only what depends on `changed` (and any formulas among them).
    pub fn recalculate_from(&mut self, changed: &[CellId]) -> RecalcReport {
        let mut dirty = self.dep_graph.dependents_closure(changed);
        for &id in changed {
            let is_formula = self
                .sheet_by_id(id.sheet)
                .and_then(|s| s.cell(id.row, id.col))
                .is_some_and(Cell::is_formula);
            if is_formula {
                dirty.insert(id);
            }
        }
        self.run_pass(dirty)
    }

    fn run_pass(&mut self, cells: FxHashSet<CellId>) -> RecalcReport {
        let start = Instant::now();
        let mut report = RecalcReport::new();
        if cells.is_empty() {
            return report;
        }

        let plan = self.dep_graph.plan(&cells);
        for dirty in plan.order.iter().chain(&plan.circular) {
            if let Some(cell) = self.formula_cell_mut(*dirty) {
                cell.state = EvalState::Unevaluated;
            }
        }

        for &id in &plan.circular {
            if let Some(cell) = self.formula_cell_mut(id) {
                cell.cached = Value::Error(CellError::Circular);
                cell.state = EvalState::CircularError;
            }
        }

        for (&id, &depth) in plan.order.iter().zip(&plan.depths) {
            let Some(cell) = self.formula_cell_mut(id) else { continue };
            cell.state = EvalState::Evaluating;
            let value = self.evaluate_cell(id);
            if let Some(cell) = self.formula_cell_mut(id) {
                cell.cached = value;
                cell.state = EvalState::Evaluated;
            }
            report.cells_recomputed += 1;
            report.max_depth = report.max_depth.max(depth);
        }

        report.had_cycles = !plan.circular.is_empty();
        report.cycle_cells = plan.circular;
        report.duration_ms = start.elapsed().as_millis() as u64;

        if report.had_cycles {
            warn!("circular reference involving {} cells", report.cycle_cells.len());
        }
        debug!("recalc: {}", report.summary());
        report
    }

    fn evaluate_cell(&self, id: CellId) -> Value {
        let expr = self
            .sheet_by_id(id.sheet)
            .and_then(|s| s.cell(id.row, id.col))
            .and_then(|c| c.value.formula())
            .and_then(|f| f.expr.as_ref());
        match expr {
            Some(expr) => evaluate_formula(expr, &WorkbookLookup::new(self, id.sheet)),
            None => Value::Error(CellError::Name),
        }
    }

    /// Evaluate a bound expression as if it lived on `sheet`
    pub(crate) fn evaluate_on(&self, sheet: SheetId, expr: &BoundExpr) -> Value {
        evaluate(expr, &WorkbookLookup::new(self, sheet))
    }

    pub(crate) fn range_expr(range: &CellRange) -> BoundExpr {
        Expr::Range {
            sheet: SheetRef::Current,
            start_col: range.start.col,
            start_row: range.start.row,
            end_col: range.end.col,
            end_row: range.end.row,
            start_col_abs: false,
            start_row_abs: false,
            end_col_abs: false,
            end_row_abs: false,
        }
    }
}

/// Positions of stored cells inside a range
pub(crate) fn stored_positions(sheet: &Sheet, range: &CellRange) -> Vec<(usize, usize)> {
    let mut positions: Vec<(usize, usize)> = sheet
        .cells_unordered()
        .map(|(pos, _)| *pos)
        .filter(|&(r, c)| range.contains(r, c))
        .collect();
    positions.sort();
    positions
}

// ============================================================================
// WorkbookLookup - CellLookup implementation with cross-sheet support
// ============================================================================

/// Reads cells for one formula evaluation. Formula cells yield their cached
/// result; a cell still being evaluated reads as `#CIRC!`.
pub struct WorkbookLookup<'a> {
    workbook: &'a Workbook,
    current_sheet_id: SheetId,
}

impl<'a> WorkbookLookup<'a> {
    pub fn new(workbook: &'a Workbook, current_sheet_id: SheetId) -> Self {
        Self { workbook, current_sheet_id }
    }
}

impl CellLookup for WorkbookLookup<'_> {
    fn current_sheet(&self) -> SheetId {
        self.current_sheet_id
    }

    fn get_value(&self, sheet: SheetId, row: usize, col: usize) -> Value {
        let Some(ws) = self.workbook.sheet_by_id(sheet) else {
            return Value::Error(CellError::Ref);
        };
        match ws.cell(row, col) {
            None => Value::Empty,
            Some(cell) if cell.is_formula() && cell.state == EvalState::Evaluating => {
                Value::Error(CellError::Circular)
            }
            Some(cell) => cell.computed_value(self.workbook.config.date_system),
        }
    }

    fn extent(&self, sheet: SheetId) -> Option<(usize, usize)> {
        let ws = self.workbook.sheet_by_id(sheet)?;
        Some(self.workbook.extents.get(&sheet).copied().unwrap_or_else(|| ws.extent()))
    }

    fn resolve_named_range(&self, name: &str) -> Option<NamedRangeResolution> {
        let nr = self.workbook.names.resolve(name, self.current_sheet_id)?;
        Some(NamedRangeResolution {
            sheet: nr.sheet,
            start_row: nr.range.start.row,
            start_col: nr.range.start.col,
            end_row: nr.range.end.row,
            end_col: nr.range.end.col,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditional::{Comparison, ConditionalRule, StyleOverride};
    use crate::style::Color;
    use crate::table::ColumnKind;

    fn range(s: &str) -> CellRange {
        CellRange::parse(s).unwrap()
    }

    fn num(wb: &Workbook, addr: &str) -> f64 {
        match wb.value_at(addr).unwrap() {
            Value::Number(n) => n,
            other => panic!("{} is not a number: {:?}", addr, other),
        }
    }

    #[test]
    fn test_new_workbook() {
        let wb = Workbook::new();
        assert_eq!(wb.sheet_count(), 1);
        assert_eq!(wb.active_sheet_index(), 0);
        assert_eq!(wb.active_sheet().name(), "Sheet1");
    }

    #[test]
    fn test_add_sheet_rejects_duplicates_and_bad_names() {
        let mut wb = Workbook::new();
        assert_eq!(wb.add_sheet("Data").unwrap(), 1);
        assert!(matches!(wb.add_sheet("data"), Err(EngineError::DuplicateSheetName(_))));
        assert!(matches!(wb.add_sheet("a/b"), Err(EngineError::InvalidSheetName { .. })));
        assert!(matches!(wb.add_sheet(""), Err(EngineError::InvalidSheetName { .. })));
        assert!(wb.add_sheet(&"x".repeat(32)).is_err());
    }

    #[test]
    fn test_remove_sheet_adjusts_active() {
        let mut wb = Workbook::new();
        wb.add_sheet("Sheet2").unwrap();
        wb.add_sheet("Sheet3").unwrap();
        wb.set_active_sheet(2).unwrap();

        wb.remove_sheet(1).unwrap();
        assert_eq!(wb.sheet_count(), 2);
        assert_eq!(wb.active_sheet_index(), 1);
        assert_eq!(wb.active_sheet().name(), "Sheet3");

        wb.remove_sheet(0).unwrap();
        assert!(matches!(wb.remove_sheet(0), Err(EngineError::Precondition(_))));
    }

    #[test]
    fn test_sheet_ids_never_reused() {
        let mut wb = Workbook::new();
        wb.add_sheet("A").unwrap();
        let removed = wb.sheet(1).unwrap().id();
        wb.remove_sheet(1).unwrap();
        wb.add_sheet("B").unwrap();
        assert_ne!(wb.sheet(1).unwrap().id(), removed);
    }

    #[test]
    fn test_basic_formula() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "1").unwrap();
        wb.set_value(0, 0, 1, "=A1*10").unwrap();
        assert_eq!(wb.value(0, 0, 1), Value::Number(10.0));

        wb.set_value(0, 0, 0, "4").unwrap();
        assert_eq!(wb.value(0, 0, 1), Value::Number(40.0));
        assert_eq!(wb.formula_text(0, 0, 1).as_deref(), Some("=A1*10"));
        assert_eq!(wb.eval_state(0, 0, 1), Some(EvalState::Evaluated));
    }

    #[test]
    fn test_sum_range() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "1").unwrap();
        wb.set_value_at("A2", "2").unwrap();
        wb.set_value_at("A3", "3").unwrap();
        wb.set_value_at("B1", "=SUM(A1:A3)").unwrap();
        assert_eq!(num(&wb, "B1"), 6.0);
    }

    #[test]
    fn test_range_formula_sees_cells_added_later() {
        let mut wb = Workbook::new();
        wb.set_value_at("B1", "=SUM(A:A)").unwrap();
        assert_eq!(num(&wb, "B1"), 0.0);
        wb.set_value_at("A1", "5").unwrap();
        wb.set_value_at("A100", "7").unwrap();
        assert_eq!(num(&wb, "B1"), 12.0);
        wb.set_value_at("A100", "").unwrap();
        assert_eq!(num(&wb, "B1"), 5.0);
    }

    #[test]
    fn test_whole_row_sum_follows_inserted_rows() {
        let mut wb = Workbook::new();
        wb.set_value_at("A2", "3").unwrap();
        wb.set_value_at("C2", "4").unwrap();
        wb.set_value_at("E1", "=SUM(2:2)").unwrap();
        assert_eq!(num(&wb, "E1"), 7.0);

        wb.insert_rows(0, 1, 1).unwrap();
        assert_eq!(wb.formula_text(0, 0, 4).as_deref(), Some("=SUM(3:3)"));
        assert_eq!(num(&wb, "E1"), 7.0);
        wb.set_value_at("Z3", "1").unwrap();
        assert_eq!(num(&wb, "E1"), 8.0);
    }

    #[test]
    fn test_invalid_formula_is_rejected() {
        let mut wb = Workbook::new();
        let err = wb.set_value(0, 0, 0, "=SUM(A1").unwrap_err();
        assert!(matches!(err, EngineError::InvalidFormula { .. }));
        assert!(wb.cell(0, 0, 0).is_none());
    }

    #[test]
    fn test_cycle_is_isolated() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "=B1+1").unwrap();
        wb.set_value_at("B1", "=A1+1").unwrap();
        wb.set_value_at("C1", "5").unwrap();
        wb.set_value_at("D1", "=C1*2").unwrap();

        assert_eq!(wb.value_at("A1").unwrap(), Value::Error(CellError::Circular));
        assert_eq!(wb.value_at("B1").unwrap(), Value::Error(CellError::Circular));
        assert_eq!(wb.eval_state(0, 0, 0), Some(EvalState::CircularError));
        assert_eq!(wb.eval_state(0, 0, 1), Some(EvalState::CircularError));
        assert_eq!(num(&wb, "D1"), 10.0);

        let report = wb.recalculate();
        assert!(report.had_cycles);
        assert_eq!(report.cycle_cells.len(), 2);
        assert_eq!(report.cells_recomputed, 1);
    }

    #[test]
    fn test_downstream_of_cycle_reads_circ() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "=A1+1").unwrap();
        wb.set_value_at("B1", "=A1*2").unwrap();
        assert_eq!(wb.value_at("A1").unwrap(), Value::Error(CellError::Circular));
        assert_eq!(wb.value_at("B1").unwrap(), Value::Error(CellError::Circular));
        assert_eq!(wb.eval_state(0, 0, 1), Some(EvalState::Evaluated));
    }

    #[test]
    fn test_breaking_a_cycle_recovers() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "=B1+1").unwrap();
        wb.set_value_at("B1", "=A1+1").unwrap();
        wb.set_value_at("A1", "10").unwrap();
        assert_eq!(num(&wb, "B1"), 11.0);
        assert_eq!(wb.eval_state(0, 0, 1), Some(EvalState::Evaluated));
    }

    #[test]
    fn test_incremental_recalc_touches_only_dependents() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "1").unwrap();
        wb.set_value_at("B1", "=A1+1").unwrap();
        wb.set_value_at("C1", "=B1+1").unwrap();
        wb.set_value_at("Z1", "=2*3").unwrap();

        let a1 = CellId::new(wb.active_sheet().id(), 0, 0);
        let report = wb.recalculate_from(&[a1]);
        assert_eq!(report.cells_recomputed, 2);
        assert_eq!(report.max_depth, 2);
        assert_eq!(wb.recalculate().cells_recomputed, 3);
    }

    #[test]
    fn test_manual_mode_defers_evaluation() {
        let mut config = EngineConfig::default();
        config.recalc = RecalcMode::Manual;
        let mut wb = Workbook::with_config(config);
        wb.set_value_at("A1", "2").unwrap();
        wb.set_value_at("B1", "=A1*2").unwrap();
        assert_eq!(wb.eval_state(0, 0, 1), Some(EvalState::Unevaluated));

        wb.recalculate();
        assert_eq!(num(&wb, "B1"), 4.0);

        wb.set_value_at("A1", "3").unwrap();
        assert_eq!(wb.eval_state(0, 0, 1), Some(EvalState::Unevaluated));
        assert_eq!(num(&wb, "B1"), 4.0);

        wb.set_recalc_mode(RecalcMode::Automatic);
        assert_eq!(num(&wb, "B1"), 6.0);
    }

    #[test]
    fn test_cross_sheet_reference_and_rename() {
        let mut wb = Workbook::new();
        wb.add_sheet("Data").unwrap();
        wb.set_value(1, 0, 0, "42").unwrap();
        wb.set_value(0, 0, 0, "=Data!A1+1").unwrap();
        assert_eq!(num(&wb, "A1"), 43.0);

        wb.rename_sheet(1, "My Data").unwrap();
        assert_eq!(wb.formula_text(0, 0, 0).as_deref(), Some("='My Data'!A1+1"));
        wb.set_value_at("'My Data'!A1", "1").unwrap();
        assert_eq!(num(&wb, "A1"), 2.0);
    }

    #[test]
    fn test_remove_sheet_turns_refs_into_ref_error() {
        let mut wb = Workbook::new();
        wb.add_sheet("Data").unwrap();
        wb.set_value(1, 0, 0, "42").unwrap();
        wb.set_value(0, 0, 0, "=Data!A1+1").unwrap();
        wb.remove_sheet(1).unwrap();
        assert_eq!(wb.value(0, 0, 0), Value::Error(CellError::Ref));
        assert_eq!(wb.formula_text(0, 0, 0).as_deref(), Some("=#REF!+1"));

        // A new sheet with the old name does not revive the reference
        wb.add_sheet("Data").unwrap();
        wb.set_value(1, 0, 0, "1").unwrap();
        assert_eq!(wb.value(0, 0, 0), Value::Error(CellError::Ref));
    }

    #[test]
    fn test_unknown_sheet_is_ref_error() {
        let mut wb = Workbook::new();
        wb.set_value(0, 0, 0, "=Nowhere!A1").unwrap();
        assert_eq!(wb.value(0, 0, 0), Value::Error(CellError::Ref));
    }

    #[test]
    fn test_move_sheet_keeps_active() {
        let mut wb = Workbook::new();
        wb.add_sheet("B").unwrap();
        wb.add_sheet("C").unwrap();
        wb.set_active_sheet(2).unwrap();
        wb.move_sheet("C", 0).unwrap();
        assert_eq!(wb.sheet_names(), vec!["C", "Sheet1", "B"]);
        assert_eq!(wb.active_sheet().name(), "C");
        wb.move_sheet("sheet1", 99).unwrap();
        assert_eq!(wb.sheet_names(), vec!["C", "B", "Sheet1"]);
    }

    #[test]
    fn test_copy_sheet_rebinds_current_refs() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "2").unwrap();
        wb.set_value_at("B1", "=A1*3").unwrap();
        let idx = wb.copy_sheet(0, "Copy").unwrap();
        wb.set_value_at("Copy!A1", "5").unwrap();
        assert_eq!(num(&wb, "Copy!B1"), 15.0);
        assert_eq!(num(&wb, "B1"), 6.0);
        assert_ne!(wb.sheet(idx).unwrap().id(), wb.sheet(0).unwrap().id());
    }

    #[test]
    fn test_copy_sheet_to_other_workbook_maps_styles() {
        let mut src = Workbook::new();
        src.set_value_at("A1", "2").unwrap();
        src.set_value_at("B1", "=A1+1").unwrap();
        src.update_style(0, &range("A1"), |s| s.font.bold = true).unwrap();

        let mut dst = Workbook::new();
        dst.update_style(0, &range("C3"), |s| s.font.italic = true).unwrap();
        let idx = src.copy_sheet_to(&mut dst, 0, "Imported").unwrap();

        assert_eq!(dst.value(idx, 0, 1), Value::Number(3.0));
        assert!(dst.style_of(idx, 0, 0).font.bold);
        assert!(!dst.style_of(idx, 0, 0).font.italic);
    }

    #[test]
    fn test_structure_protection() {
        let mut wb = Workbook::new();
        wb.protect_structure(Some("secret"));
        assert!(matches!(wb.add_sheet("X"), Err(EngineError::Protected(_))));
        assert!(matches!(wb.rename_sheet(0, "X"), Err(EngineError::Protected(_))));
        assert!(matches!(wb.unprotect_structure(Some("nope")), Err(EngineError::WrongPassword)));
        assert!(matches!(wb.unprotect_structure(None), Err(EngineError::WrongPassword)));
        wb.unprotect_structure(Some("secret")).unwrap();
        wb.add_sheet("X").unwrap();
    }

    #[test]
    fn test_sheet_unprotect_needs_no_password() {
        let mut wb = Workbook::new();
        let ws = wb.sheet_mut(0).unwrap();
        ws.protect(Some("pw"));
        assert!(ws.is_protected());
        ws.unprotect();
        assert!(!ws.is_protected());
    }

    #[test]
    fn test_update_style_is_copy_on_write() {
        let mut wb = Workbook::new();
        wb.update_style(0, &range("A1:B2"), |s| s.font.bold = true).unwrap();
        let bold = wb.cell(0, 0, 0).unwrap().style;
        assert_eq!(wb.cell(0, 1, 1).unwrap().style, bold);

        wb.update_style(0, &range("A1"), |s| s.font.italic = true).unwrap();
        assert!(wb.style_of(0, 0, 0).font.italic);
        assert!(!wb.style_of(0, 1, 1).font.italic);
        assert!(wb.style_of(0, 1, 1).font.bold);
        assert_eq!(wb.styles().len(), 3);
    }

    #[test]
    fn test_number_format_display() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "0.256").unwrap();
        wb.set_number_format(0, &range("A1"), "0.0%").unwrap();
        assert_eq!(wb.display(0, 0, 0), "25.6%");
    }

    #[test]
    fn test_effective_style_first_match_wins() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "5").unwrap();
        wb.set_value_at("A2", "50").unwrap();
        wb.sheet_mut(0)
            .unwrap()
            .add_conditional_format(
                range("A1:A10"),
                vec![
                    ConditionalRule::new(Comparison::LessThan, vec![10.0.into()], StyleOverride::fill(Color::RED)),
                    ConditionalRule::new(Comparison::LessThan, vec![100.0.into()], StyleOverride::fill(Color::GREEN)),
                ],
            )
            .unwrap();

        assert_eq!(wb.effective_style(0, 0, 0).fill.fg_color, Some(Color::RED));
        assert_eq!(wb.effective_style(0, 1, 0).fill.fg_color, Some(Color::GREEN));
        assert!(matches!(wb.effective_style(0, 5, 0), Cow::Borrowed(_)));

        wb.set_value_at("A1", "500").unwrap();
        assert!(matches!(wb.effective_style(0, 0, 0), Cow::Borrowed(_)));
    }

    #[test]
    fn test_named_range_in_formula() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "10").unwrap();
        wb.set_value_at("A2", "20").unwrap();
        wb.set_value_at("C1", "=SUM(Inputs)").unwrap();
        assert_eq!(wb.value_at("C1").unwrap(), Value::Error(CellError::Name));

        wb.define_name("Inputs", "Sheet1!A1:A2", NameScope::Workbook).unwrap();
        assert_eq!(num(&wb, "C1"), 30.0);
        assert_eq!(wb.find_name("inputs").as_deref(), Some("Sheet1!$A$1:$A$2"));

        wb.set_value_at("A2", "1").unwrap();
        assert_eq!(num(&wb, "C1"), 11.0);

        assert!(wb.remove_name("INPUTS", NameScope::Workbook));
        assert_eq!(wb.value_at("C1").unwrap(), Value::Error(CellError::Name));
    }

    #[test]
    fn test_define_name_validates() {
        let mut wb = Workbook::new();
        assert!(matches!(wb.define_name("A1", "A1", NameScope::Workbook), Err(EngineError::InvalidName(_))));
        assert!(matches!(wb.define_name("Ok", "Missing!A1", NameScope::Workbook), Err(EngineError::SheetNotFound(_))));
        assert!(wb.define_name("Ok", "not an address", NameScope::Workbook).is_err());
    }

    #[test]
    fn test_named_tables() {
        let mut wb = Workbook::new();
        wb.add_named_table(0, "Sales", range("A1:C5")).unwrap();
        assert!(wb.add_named_table(0, "sales", range("E1:F5")).is_err());
        assert!(wb.add_named_table(0, "Other", range("B2:D9")).is_err());
        wb.add_named_table(0, "Other", range("E1:F5")).unwrap();
        assert_eq!(wb.named_table_names(0), vec!["Sales", "Other"]);
        assert_eq!(wb.named_table("SALES").unwrap().data_rows(), 4);
    }

    #[test]
    fn test_to_table_and_back() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "Name").unwrap();
        wb.set_value_at("B1", "Score").unwrap();
        wb.set_value_at("A2", "Ann").unwrap();
        wb.set_value_at("B2", "3").unwrap();
        wb.set_value_at("A3", "Bob").unwrap();
        wb.set_value_at("B3", "=B2*2").unwrap();

        let table = wb.to_table(0, true).unwrap();
        assert_eq!(table.columns[1].name, "Score");
        assert_eq!(table.columns[1].kind, ColumnKind::Number);
        assert_eq!(table.rows[1], vec![TableValue::from("Bob"), TableValue::Number(6.0)]);

        let id = wb.add_sheet_from_table(&table).unwrap();
        let idx = wb.sheet_index(id).unwrap();
        assert_eq!(wb.sheet(idx).unwrap().name(), "Sheet1 (2)");
        assert_eq!(wb.value(idx, 2, 1), Value::Number(6.0));
        assert_eq!(wb.formula_text(idx, 2, 1), None);
        assert_eq!(wb.to_data_set().len(), 2);
    }

    #[test]
    fn test_clear_contents_keeps_style() {
        let mut wb = Workbook::new();
        wb.set_value_at("A1", "3").unwrap();
        wb.set_value_at("B1", "=A1").unwrap();
        wb.update_style(0, &range("A1"), |s| s.font.bold = true).unwrap();

        wb.clear_contents(0, &range("A1")).unwrap();
        assert_eq!(wb.value(0, 0, 0), Value::Empty);
        assert!(wb.style_of(0, 0, 0).font.bold);
        assert_eq!(wb.value(0, 0, 1), Value::Number(0.0));

        wb.clear_all(0, &range("A1:B1")).unwrap();
        assert_eq!(wb.sheet(0).unwrap().cell_count(), 0);
    }

    #[test]
    fn test_limits_enforced() {
        let mut config = EngineConfig::default();
        config.limits.max_rows = 100;
        let mut wb = Workbook::with_config(config);
        assert!(matches!(wb.set_value(0, 100, 0, "1"), Err(EngineError::OutOfBounds { row: 100, col: 0 })));
        wb.set_value(0, 99, 0, "1").unwrap();
    }

    #[test]
    fn test_serde_round_trip_rebuilds() {
        let mut wb = Workbook::new();
        wb.add_sheet("Two").unwrap();
        wb.set_value_at("A1", "4").unwrap();
        wb.set_value_at("Two!B2", "=Sheet1!A1^2").unwrap();
        wb.update_style(1, &range("B2"), |s| s.font.bold = true).unwrap();
        wb.metadata_mut().author = Some("Ann".into());

        let json = serde_json::to_string(&wb).unwrap();
        let mut back: Workbook = serde_json::from_str(&json).unwrap();
        back.rebuild();

        assert_eq!(back.value(1, 1, 1), Value::Number(16.0));
        assert!(back.style_of(1, 1, 1).font.bold);
        assert_eq!(back.metadata().author.as_deref(), Some("Ann"));
        back.set_value_at("A1", "5").unwrap();
        assert_eq!(back.value(1, 1, 1), Value::Number(25.0));
    }
}
