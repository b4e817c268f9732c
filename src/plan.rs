//! The plan artifact returned to callers (§6).
//!
//! `Plan` is pure data: the driver in `planner.rs` is the only thing that
//! constructs one, on `close()`. Nothing in this module touches a provider or
//! the evaluator.

use crate::addr::{Map, ResourceInstanceObjectAddr};
use crate::object::PlannedChange;
use crate::state::StateSnapshot;

/// Which mode a plan was produced under; carried through to apply so it can
/// enforce the same mode (e.g. a destroy plan may only be applied as a destroy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UiMode {
    /// Ordinary create/update/delete planning.
    Normal,
    /// Refresh prior state only; no planned changes are produced.
    RefreshOnly,
    /// Plan the destruction of every managed object in scope.
    Destroy,
}

/// The result of a planning round.
#[derive(Debug, Clone)]
pub struct Plan {
    /// The mode this plan was produced under.
    pub ui_mode: UiMode,
    /// Every planned change, keyed by the address it applies to.
    pub changes: Map<ResourceInstanceObjectAddr, PlannedChange>,
    /// The state snapshot planning started from.
    pub prior_state: StateSnapshot,
    /// The state snapshot after any refresh reads performed during planning.
    pub refreshed_state: StateSnapshot,
    /// The serialized execution graph (opaque; see [`crate::graph::ExecutionGraph::marshal`]).
    pub execution_graph: Vec<u8>,
    /// Whether any error occurred while producing this plan. A `true` value
    /// does not mean the plan is empty — it is always best-effort (§7).
    pub errored: bool,
}

impl Plan {
    /// True if this plan has no planned changes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_plan_reports_empty() {
        let plan = Plan {
            ui_mode: UiMode::Normal,
            changes: Map::new(),
            prior_state: StateSnapshot::new(),
            refreshed_state: StateSnapshot::new(),
            execution_graph: Vec::new(),
            errored: false,
        };
        assert!(plan.is_empty());
    }
}
