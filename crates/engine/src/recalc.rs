//! Recalculation state and reporting.

use serde::{Deserialize, Serialize};

use crate::cell_id::CellId;

/// Evaluation state of a formula cell.
///
/// `Evaluating` only exists while a pass is running; a cell found in that
/// state by a lookup is part of a cycle the planner did not see (a named
/// range or a dependency outside the used extent) and reads as `#CIRC!`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalState {
    #[default]
    Unevaluated,
    Evaluating,
    Evaluated,
    CircularError,
}

/// Report from a recalculation pass.
#[derive(Debug, Clone, Default)]
pub struct RecalcReport {
    /// Time taken in milliseconds.
    pub duration_ms: u64,

    /// Number of formula cells that were evaluated (cycle cells excluded).
    pub cells_recomputed: usize,

    /// Longest formula-to-formula dependency chain in the pass.
    /// A formula with no formula precedents has depth 1.
    pub max_depth: usize,

    /// True if any cycle was found. Cycle cells hold `#CIRC!`.
    pub had_cycles: bool,

    /// Cells marked CircularError, in (sheet, row, col) order.
    pub cycle_cells: Vec<CellId>,
}

impl RecalcReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-line summary for logging.
    pub fn summary(&self) -> String {
        format!(
            "{} cells in {}ms, depth={}, cycles={}",
            self.cells_recomputed,
            self.duration_ms,
            self.max_depth,
            self.cycle_cells.len()
        )
    }
}

/// Ordered plan for one pass: evaluation order plus the cells to mark circular.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecalcPlan {
    pub order: Vec<CellId>,
    pub circular: Vec<CellId>,
    pub depths: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::SheetId;

    #[test]
    fn test_default_state_is_unevaluated() {
        assert_eq!(EvalState::default(), EvalState::Unevaluated);
    }

    #[test]
    fn test_summary() {
        let report = RecalcReport {
            duration_ms: 3,
            cells_recomputed: 12,
            max_depth: 4,
            had_cycles: true,
            cycle_cells: vec![CellId::new(SheetId::from_raw(1), 0, 0), CellId::new(SheetId::from_raw(1), 0, 1)],
        };
        assert_eq!(report.summary(), "12 cells in 3ms, depth=4, cycles=2");
    }
}
