//! Dependency graph for formula cells.
//!
//! # Edge Direction
//!
//! ```text
//! A → B  means  "B depends on A"  (A is a precedent of B)
//! ```
//!
//! "What must be recomputed if X changes?" follows outgoing edges;
//! evaluation order and cycle detection walk incoming ones.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell_id::CellId;
use crate::recalc::RecalcPlan;

/// Persistent dependency graph for formula cells.
///
/// Maintains bidirectional adjacency:
/// - `preds[B]` = cells that B depends on (precedents)
/// - `succs[A]` = cells that depend on A (dependents)
///
/// # Invariants
///
/// 1. If A ∈ preds[B] then B ∈ succs[A], and vice versa.
/// 2. Empty sets are removed, not stored.
/// 3. `replace_edges` is the only mutator that touches both maps.
#[derive(Default, Debug, Clone)]
pub struct DepGraph {
    preds: FxHashMap<CellId, FxHashSet<CellId>>,
    succs: FxHashMap<CellId, FxHashSet<CellId>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cells this formula cell depends on.
    pub fn precedents(&self, cell: CellId) -> impl Iterator<Item = CellId> + '_ {
        self.preds.get(&cell).into_iter().flat_map(|s| s.iter().copied())
    }

    /// Cells that depend directly on this cell.
    pub fn dependents(&self, cell: CellId) -> impl Iterator<Item = CellId> + '_ {
        self.succs.get(&cell).into_iter().flat_map(|s| s.iter().copied())
    }

    pub fn has_precedents(&self, cell: CellId) -> bool {
        self.preds.contains_key(&cell)
    }

    /// Number of cells with at least one precedent.
    pub fn formula_cell_count(&self) -> usize {
        self.preds.len()
    }

    /// Number of cells referenced by at least one formula.
    pub fn referenced_cell_count(&self) -> usize {
        self.succs.len()
    }

    /// Replace all edges for a formula cell atomically.
    ///
    /// Pass an empty set to clear all edges for this cell.
    pub fn replace_edges(&mut self, formula_cell: CellId, new_preds: FxHashSet<CellId>) {
        if let Some(old_preds) = self.preds.remove(&formula_cell) {
            for pred in old_preds {
                if let Some(deps) = self.succs.get_mut(&pred) {
                    deps.remove(&formula_cell);
                    if deps.is_empty() {
                        self.succs.remove(&pred);
                    }
                }
            }
        }

        if new_preds.is_empty() {
            return;
        }

        for pred in &new_preds {
            self.succs.entry(*pred).or_default().insert(formula_cell);
        }
        self.preds.insert(formula_cell, new_preds);
    }

    pub fn clear_cell(&mut self, cell: CellId) {
        self.replace_edges(cell, FxHashSet::default());
    }

    pub fn clear(&mut self) {
        self.preds.clear();
        self.succs.clear();
    }

    /// Every cell that transitively depends on any of `changed`, excluding
    /// the changed cells themselves unless they sit on a cycle.
    pub fn dependents_closure(&self, changed: &[CellId]) -> FxHashSet<CellId> {
        let mut seen: FxHashSet<CellId> = FxHashSet::default();
        let mut queue: VecDeque<CellId> = changed.iter().copied().collect();
        while let Some(cell) = queue.pop_front() {
            for dep in self.dependents(cell) {
                if seen.insert(dep) {
                    queue.push_back(dep);
                }
            }
        }
        seen
    }

    // =========================================================================
    // Evaluation order (Tarjan's SCC)
    // =========================================================================

    /// Order `cells` for evaluation.
    ///
    /// Runs Tarjan's algorithm over the subgraph induced by `cells`.
    /// Components come out dependencies-first; a component with more than
    /// one member, or a single self-referencing cell, is a cycle and goes
    /// to `circular` instead of `order`. Roots and neighbours are visited
    /// in (sheet, row, col) order so the plan is deterministic.
    pub(crate) fn plan(&self, cells: &FxHashSet<CellId>) -> RecalcPlan {
        let mut sorted_cells: Vec<CellId> = cells.iter().copied().collect();
        sorted_cells.sort();

        let sorted_neighbours = |cell: CellId| -> Vec<CellId> {
            let mut neighbours: Vec<CellId> = self.precedents(cell).filter(|c| cells.contains(c)).collect();
            neighbours.sort();
            neighbours
        };

        struct DfsFrame {
            cell: CellId,
            neighbours: Vec<CellId>,
            next_idx: usize,
        }

        let mut index_counter: u32 = 0;
        let mut stack: Vec<CellId> = Vec::new();
        let mut on_stack: FxHashSet<CellId> = FxHashSet::default();
        let mut indices: FxHashMap<CellId, u32> = FxHashMap::default();
        let mut lowlinks: FxHashMap<CellId, u32> = FxHashMap::default();
        let mut depth_of: FxHashMap<CellId, usize> = FxHashMap::default();
        let mut plan = RecalcPlan::default();

        for &root in &sorted_cells {
            if indices.contains_key(&root) {
                continue;
            }

            indices.insert(root, index_counter);
            lowlinks.insert(root, index_counter);
            index_counter += 1;
            stack.push(root);
            on_stack.insert(root);
            let mut dfs_stack = vec![DfsFrame { cell: root, neighbours: sorted_neighbours(root), next_idx: 0 }];

            while let Some(frame) = dfs_stack.last_mut() {
                if frame.next_idx < frame.neighbours.len() {
                    let w = frame.neighbours[frame.next_idx];
                    frame.next_idx += 1;

                    if let Some(&w_idx) = indices.get(&w) {
                        if on_stack.contains(&w) {
                            let v_low = lowlinks.entry(frame.cell).or_insert(w_idx);
                            *v_low = (*v_low).min(w_idx);
                        }
                    } else {
                        indices.insert(w, index_counter);
                        lowlinks.insert(w, index_counter);
                        index_counter += 1;
                        stack.push(w);
                        on_stack.insert(w);
                        dfs_stack.push(DfsFrame { cell: w, neighbours: sorted_neighbours(w), next_idx: 0 });
                    }
                    continue;
                }

                let Some(finished) = dfs_stack.pop() else { break };
                let v = finished.cell;
                let v_low = lowlinks.get(&v).copied().unwrap_or(u32::MAX);
                let v_idx = indices.get(&v).copied().unwrap_or(u32::MAX);

                if let Some(parent) = dfs_stack.last() {
                    if let Some(parent_low) = lowlinks.get_mut(&parent.cell) {
                        *parent_low = (*parent_low).min(v_low);
                    }
                }

                if v_low != v_idx {
                    continue;
                }

                let mut scc = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack.remove(&w);
                    scc.push(w);
                    if w == v {
                        break;
                    }
                }

                let is_cycle = scc.len() > 1 || self.preds.get(&v).is_some_and(|p| p.contains(&v));
                if is_cycle {
                    plan.circular.extend(scc);
                } else {
                    let depth = 1 + finished
                        .neighbours
                        .iter()
                        .filter_map(|n| depth_of.get(n))
                        .max()
                        .copied()
                        .unwrap_or(0);
                    depth_of.insert(v, depth);
                    plan.order.push(v);
                    plan.depths.push(depth);
                }
            }
        }

        plan.circular.sort();
        plan
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (b, preds) in &self.preds {
            assert!(!preds.is_empty(), "empty preds stored for {b}");
            for a in preds {
                assert!(self.succs.get(a).is_some_and(|s| s.contains(b)), "{a} -> {b} missing from succs");
            }
        }
        for (a, succs) in &self.succs {
            assert!(!succs.is_empty(), "empty succs stored for {a}");
            for b in succs {
                assert!(self.preds.get(b).is_some_and(|p| p.contains(a)), "{a} -> {b} missing from preds");
            }
        }
    }
}
