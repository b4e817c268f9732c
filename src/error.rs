//! Error and diagnostic types for the planning core.
//!
//! Per-operation diagnostics carry a severity, a one-line summary, a detail
//! paragraph, and an optional address — §7's taxonomy. Diagnostics aggregate;
//! a single object's provider call can produce several without aborting
//! planning for its siblings. [`Error`] is reserved for contract violations
//! and for situations with no best-effort plan to fall back on.

use miette::Diagnostic as MietteDiagnostic;
use thiserror::Error as ThisError;

use crate::addr::{ProviderInstanceAddr, ResourceInstanceObjectAddr};

/// Result type alias using the planning core's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Severity of a single diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Severity {
    /// Non-fatal; the affected object may still produce a plan.
    Warning,
    /// Fatal for the affected object, but not for its siblings.
    Error,
}

/// A single diagnostic message attached to a plan, a resource instance, or a
/// provider instance.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    /// Severity of this diagnostic.
    pub severity: Severity,
    /// One-line summary.
    pub summary: String,
    /// Longer explanation.
    pub detail: String,
    /// The resource-instance object this diagnostic is about, if any.
    pub address: Option<ResourceInstanceObjectAddr>,
}

impl Diagnostic {
    /// Builds an error-severity diagnostic against a specific object.
    #[must_use]
    pub fn error(
        summary: impl Into<String>,
        detail: impl Into<String>,
        address: Option<ResourceInstanceObjectAddr>,
    ) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.into(),
            address,
        }
    }

    /// Builds a warning-severity diagnostic against a specific object.
    #[must_use]
    pub fn warning(
        summary: impl Into<String>,
        detail: impl Into<String>,
        address: Option<ResourceInstanceObjectAddr>,
    ) -> Self {
        Self {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.into(),
            address,
        }
    }

    /// True if this diagnostic is fatal for the object it concerns.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// A batch of diagnostics collected for one plan.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Diagnostics(pub Vec<Diagnostic>);

impl Diagnostics {
    /// An empty diagnostic batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one diagnostic.
    pub fn push(&mut self, diag: Diagnostic) {
        self.0.push(diag);
    }

    /// Appends every diagnostic from `other`.
    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    /// True if any diagnostic in the batch has [`Severity::Error`].
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.0.iter().any(Diagnostic::is_error)
    }
}

/// Contract-violation and unrecoverable errors in the planning core.
///
/// Most failures (configuration-validation, provider RPC, invalid-plan
/// post-conditions) are surfaced as [`Diagnostic`]s attached to the
/// best-effort plan instead of through this type — see §7. `Error` is
/// reserved for situations where no plan can be produced at all, or where the
/// caller violated an API invariant.
#[derive(ThisError, Debug, MietteDiagnostic)]
pub enum Error {
    /// No configuration evaluator has been attached to the plan context.
    #[error("no configuration evaluator attached to this plan context")]
    #[diagnostic(code(iacplan::no_evaluator))]
    NoEvaluator,

    /// A cyclic dependency was found assembling the execution graph, after
    /// the post-build strongly-connected-components check.
    #[error("execution graph contains a dependency cycle")]
    #[diagnostic(
        code(iacplan::cyclic_dependency),
        help("check for resources whose configurations reference each other")
    )]
    CyclicDependency {
        /// One address on the offending cycle, for diagnostics, if any node on
        /// the cycle carries one (a cycle formed entirely of waiter/constant
        /// nodes has none).
        example: Option<ResourceInstanceObjectAddr>,
    },

    /// [`crate::object::ResourceInstanceObjects::put`] was called twice for the same address.
    #[error("duplicate resource-instance-object record for {address}")]
    #[diagnostic(code(iacplan::duplicate_put))]
    DuplicatePut {
        /// The address that was put twice.
        address: ResourceInstanceObjectAddr,
    },

    /// A deposed-object record was given a non-`Delete`/`Forget` action.
    #[error("deposed object {address} may only be planned for deletion")]
    #[diagnostic(code(iacplan::invalid_deposed_action))]
    InvalidDeposedAction {
        /// The offending address.
        address: ResourceInstanceObjectAddr,
    },

    /// A planner was dispatched for a resource mode it does not handle.
    #[error("wrong-mode dispatch: {expected} planner invoked for {address}")]
    #[diagnostic(code(iacplan::wrong_mode_dispatch))]
    WrongModeDispatch {
        /// The mode the planner expected.
        expected: crate::addr::ResourceMode,
        /// The address that was dispatched incorrectly.
        address: ResourceInstanceObjectAddr,
    },

    /// A provider instance could not be configured or opened.
    #[error("provider instance {provider} is not available: {message}")]
    #[diagnostic(code(iacplan::provider_unavailable))]
    ProviderUnavailable {
        /// The provider instance that failed.
        provider: ProviderInstanceAddr,
        /// The underlying message.
        message: String,
    },

    /// The planning operation was cancelled.
    #[error("planning was cancelled")]
    #[diagnostic(code(iacplan::cancelled))]
    Cancelled,

    /// An execution-graph reference was used after the graph was frozen, or a
    /// reference from a different graph was passed in.
    #[error("invalid execution-graph reference")]
    #[diagnostic(code(iacplan::invalid_graph_ref))]
    InvalidGraphRef,

    /// Serializing or deserializing the execution graph failed.
    #[error("failed to marshal execution graph: {0}")]
    #[diagnostic(code(iacplan::marshal_error))]
    Marshal(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_batch_detects_errors() {
        let mut diags = Diagnostics::new();
        assert!(!diags.has_errors());
        diags.push(Diagnostic::warning("heads up", "detail", None));
        assert!(!diags.has_errors());
        diags.push(Diagnostic::error("boom", "detail", None));
        assert!(diags.has_errors());
    }
}
