//! # iacplan
//!
//! The planning core of a Terraform/OpenTofu-style infrastructure-as-code
//! engine: the part that turns an evaluator's walk over a configuration
//! graph, plus a provider's opinions about each resource, into an ordered
//! execution graph an apply phase can run.
//!
//! This crate does not parse configuration languages, does not speak the
//! provider wire protocol, and does not execute anything itself — those are
//! external collaborators (see `SPEC_FULL.md` §1). What it owns:
//!
//! - [`addr`]: addressing for modules, resources, instances, providers, and
//!   the per-object addresses ("current" vs "deposed") the planning graph is
//!   keyed by.
//! - [`value`]: the deferred-aware value wrapper threaded through planning.
//! - [`object`]: the intermediate planning graph — one
//!   [`object::ResourceInstanceObject`] per address, with its planned change,
//!   provider, replace-order hint, and config dependencies.
//! - [`replace_order`]: resolves create-before-destroy vs destroy-before-create
//!   for every replace, including cross-object chains.
//! - [`graph`]: the two-layer execution graph — [`graph::primitive`]'s flat
//!   arena of typed operation nodes, and [`graph::builder`]'s per-action
//!   subgraph assembly on top of it.
//! - [`provider`]: the provider client contract and an at-most-once-open
//!   registry of provider instances.
//! - [`state`]: the narrow read/write contract over persisted state.
//! - [`completion`]: a reusable "every dependent finished" tracker used by
//!   both resource and provider-instance lifecycles.
//! - [`plan`]: the `Plan` artifact `close()` produces.
//! - [`planner`]: [`planner::PlanContext`], the driver that ties all of the
//!   above together across one planning round.
//!
//! ## Example
//!
//! ```ignore
//! use iacplan::planner::{ManagedInstanceInput, PlanContext, PlanContextConfig};
//! use iacplan::state::StateSnapshot;
//!
//! # async fn run() -> iacplan::error::Result<()> {
//! let ctx = PlanContext::new(PlanContextConfig::default(), StateSnapshot::new());
//!
//! // The evaluator calls plan_desired_* / plan_*_orphans as it walks the
//! // configuration graph, substituting the returned values back into
//! // expressions it hasn't finished evaluating yet.
//! // ...
//!
//! let plan = ctx.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod addr;
pub mod completion;
pub mod error;
pub mod graph;
pub mod object;
pub mod plan;
pub mod planner;
pub mod provider;
pub mod replace_order;
pub mod state;
pub mod value;

pub use error::{Error, Result};
pub use plan::{Plan, UiMode};
pub use planner::{PlanContext, PlanContextConfig};
pub use value::Value;
