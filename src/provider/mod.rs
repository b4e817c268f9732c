//! The narrow provider-plugin contract the planning core consumes.
//!
//! The actual provider-plugin transport (spawning a process, a gRPC
//! handshake, wire-protocol framing) is an external collaborator and
//! deliberately out of scope here — see §1. What the core needs is a
//! [`ProviderClient`] trait it can call behind an `Arc<dyn ProviderClient>`,
//! so the rest of the crate can be exercised against an in-memory fake.

mod registry;

pub use registry::{ProviderConfig, ProviderRegistry};

use async_trait::async_trait;

use crate::error::{Diagnostics, Result};
use crate::value::Value;

/// Result of a provider RPC that may partially succeed: a value plus whatever
/// diagnostics were attached to it.
#[derive(Debug, Clone)]
pub struct ProviderOutcome<T> {
    /// The value returned by the provider, if the call produced one.
    pub value: Option<T>,
    /// Diagnostics attached to the call.
    pub diagnostics: Diagnostics,
}

impl<T> ProviderOutcome<T> {
    /// Wraps a successful value with no diagnostics.
    #[must_use]
    pub fn ok(value: T) -> Self {
        Self {
            value: Some(value),
            diagnostics: Diagnostics::new(),
        }
    }

    /// True if the call produced no usable value or attached an error diagnostic.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.value.is_none() || self.diagnostics.has_errors()
    }
}

/// The result of asking a provider to refine a proposed plan.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    /// The planned state after apply, possibly still partially unknown.
    pub planned_state: Value,
    /// Attribute paths that forced a replace, if the provider decided one is required.
    pub requires_replace: Vec<Vec<String>>,
    /// Opaque private data to round-trip through apply.
    pub planned_private: Vec<u8>,
    /// Whether the provider sets the "legacy type system" flag, which
    /// downgrades certain post-condition assertions (§7) from errors to warnings.
    pub legacy_type_system: bool,
}

/// An opened ephemeral resource handle.
#[derive(Debug, Clone)]
pub struct EphemeralHandle {
    /// Opaque token the provider uses to identify this open resource on close.
    pub token: Vec<u8>,
    /// The value exposed to consumers while the resource is open.
    pub result: Value,
}

/// The narrow client contract the planning core calls against a configured
/// provider instance. Every call is `async` (suspension points per §5) and
/// returns diagnostics alongside its result so partial failure never aborts
/// sibling objects.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Validates a resource configuration before planning.
    async fn validate_resource_config(
        &self,
        type_name: &str,
        config: &Value,
    ) -> Result<Diagnostics>;

    /// Reads the current state of a managed resource (refresh).
    async fn read_resource(&self, type_name: &str, prior: &Value)
        -> Result<ProviderOutcome<Value>>;

    /// Reads a data source.
    async fn read_data_source(
        &self,
        type_name: &str,
        config: &Value,
    ) -> Result<ProviderOutcome<Value>>;

    /// Asks the provider to refine a proposed new state into a final plan.
    async fn plan_resource_change(
        &self,
        type_name: &str,
        prior: Option<&Value>,
        proposed_new: &Value,
        config: &Value,
    ) -> Result<ProviderOutcome<PlannedChange>>;

    /// Applies a final plan, producing the new object state.
    async fn apply_resource_change(
        &self,
        type_name: &str,
        prior: Option<&Value>,
        planned: &PlannedChange,
    ) -> Result<ProviderOutcome<Value>>;

    /// Opens an ephemeral resource.
    async fn open_ephemeral(
        &self,
        type_name: &str,
        config: &Value,
    ) -> Result<ProviderOutcome<EphemeralHandle>>;

    /// Closes a previously opened ephemeral resource.
    async fn close_ephemeral(&self, type_name: &str, token: &[u8]) -> Result<Diagnostics>;

    /// Requests a graceful stop of in-flight operations (used on cancellation
    /// before a forceful [`ProviderClient::close`]).
    async fn stop(&self) -> Result<()>;

    /// Closes the provider client, releasing its underlying process/connection.
    async fn close(&self) -> Result<()>;
}
