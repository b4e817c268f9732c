//! The execution graph: a two-layer API over the operations the apply phase
//! must perform, in the order it must perform them.
//!
//! [`primitive`] is the low-level arena of typed operation nodes (§4.F);
//! [`builder`] is the per-action subgraph assembly layer built on top of it
//! (§4.G). Planners call the builder; the builder calls the primitive layer.

pub mod builder;
pub mod primitive;

pub use builder::SubgraphBuilder;
pub use primitive::{ExecutionGraph, PrimitiveGraph, Ref};
