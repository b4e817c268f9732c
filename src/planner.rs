//! Planner driver and glue (§4.H): `PlanContext`.
//!
//! This is the component every other module in this crate exists to serve.
//! The evaluator (an external collaborator — see §1) drives a planning round
//! by calling the `plan_desired_*` and `plan_*_orphans` methods below as it
//! walks the configuration; each call records zero or one resource-instance-
//! object into the intermediate graph (`crate::object`) and returns a value
//! for the evaluator to keep substituting into expressions. Once every
//! desired and orphaned object has been reported, the caller invokes
//! [`PlanContext::close`], which resolves replace order, assembles the
//! execution graph, and returns the [`Plan`] artifact.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::addr::{
    AbsModuleCallAddr, InstanceKey, Map, ModuleInstanceAddr, ProviderInstanceAddr, ResourceAddr, ResourceInstanceAddr,
    ResourceInstanceObjectAddr, ResourceMode, Set,
};
use crate::completion::CompletionTracker;
use crate::error::{Diagnostic, Diagnostics, Error, Result};
use crate::graph::primitive::{NothingOut, RawRef};
use crate::graph::{ExecutionGraph, PrimitiveGraph, Ref, SubgraphBuilder};
use crate::object::{
    Action, FrozenResourceInstanceObjects, PlannedChange, ReplaceOrder, ResourceInstanceObject, ResourceInstanceObjects,
};
use crate::plan::{Plan, UiMode};
use crate::provider::{ProviderClient, ProviderRegistry};
use crate::replace_order::{self, ResolvedOrder};
use crate::state::StateSnapshot;
use crate::value::Value;

/// Driver-level configuration, fixed for the lifetime of one `PlanContext`.
#[derive(Debug, Clone, Copy)]
pub struct PlanContextConfig {
    /// Soft cap on how many provider instances may be mid-open at once. Not
    /// enforced by this crate (no scheduler lives here — see §5's
    /// "cooperative async tasks" design note); carried through for whatever
    /// owns the evaluator's task pool to honor.
    pub max_concurrent_provider_opens: usize,
    /// How long a cancelled provider instance is given to stop gracefully
    /// before [`ProviderClient::close`] is called anyway.
    pub cancellation_grace: std::time::Duration,
    /// Which mode this round is planning under.
    pub ui_mode: UiMode,
}

impl Default for PlanContextConfig {
    fn default() -> Self {
        Self {
            max_concurrent_provider_opens: 10,
            cancellation_grace: std::time::Duration::from_secs(30),
            ui_mode: UiMode::Normal,
        }
    }
}

/// Evaluator-supplied input for [`PlanContext::plan_desired_managed_instance`].
pub struct ManagedInstanceInput {
    /// The provider instance that governs this resource type.
    pub provider: ProviderInstanceAddr,
    /// The fully-evaluated configuration block.
    pub config: Value,
    /// Addresses this configuration's expressions depend on.
    pub config_deps: Set<ResourceInstanceObjectAddr>,
    /// Whether a replace (if one is required) should create before destroying.
    pub create_before_destroy: bool,
    /// The address this instance was "moved" from, if a `moved` block applies.
    pub moved_from: Option<ResourceInstanceAddr>,
}

/// Evaluator-supplied input for [`PlanContext::plan_desired_data_instance`].
pub struct DataInstanceInput {
    /// The provider instance that governs this data source type.
    pub provider: ProviderInstanceAddr,
    /// The fully-evaluated configuration block.
    pub config: Value,
    /// Addresses this configuration's expressions depend on.
    pub config_deps: Set<ResourceInstanceObjectAddr>,
}

/// Evaluator-supplied input for [`PlanContext::plan_desired_ephemeral_instance`].
pub struct EphemeralInstanceInput {
    /// The provider instance that governs this ephemeral resource type.
    pub provider: ProviderInstanceAddr,
    /// The fully-evaluated configuration block.
    pub config: Value,
    /// Addresses this configuration's expressions depend on.
    pub config_deps: Set<ResourceInstanceObjectAddr>,
}

type CloseFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// The planning-round driver: one `PlanContext` is built per plan, fed every
/// desired and orphaned object the evaluator discovers, then closed once.
pub struct PlanContext {
    config: PlanContextConfig,
    prior_state: StateSnapshot,
    refreshed_state: Mutex<StateSnapshot>,
    objects: ResourceInstanceObjects,
    graph: Arc<PrimitiveGraph>,
    subgraphs: SubgraphBuilder,
    providers: Arc<ProviderRegistry>,
    resource_completions: Arc<CompletionTracker<ResourceInstanceAddr>>,
    close_stack: Mutex<Vec<CloseFn>>,
    diagnostics: Mutex<Diagnostics>,
    errored: AtomicBool,
    cancelled: AtomicBool,
}

impl PlanContext {
    /// Starts a new planning round against `prior_state`.
    #[must_use]
    pub fn new(config: PlanContextConfig, prior_state: StateSnapshot) -> Self {
        let graph = Arc::new(PrimitiveGraph::new());
        Self {
            config,
            prior_state,
            refreshed_state: Mutex::new(StateSnapshot::new()),
            objects: ResourceInstanceObjects::new(),
            subgraphs: SubgraphBuilder::new(Arc::clone(&graph)),
            graph,
            providers: Arc::new(ProviderRegistry::new()),
            resource_completions: Arc::new(CompletionTracker::new()),
            close_stack: Mutex::new(Vec::new()),
            diagnostics: Mutex::new(Diagnostics::new()),
            errored: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Marks this round as cancelled: providers close via stop-then-close
    /// rather than a bare close once their dependents finish.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn mark_errored(&self) {
        self.errored.store(true, Ordering::SeqCst);
    }

    fn finish_resource(&self, instance: &ResourceInstanceAddr, provider: &ProviderInstanceAddr) {
        self.resource_completions.complete(instance.clone());
        self.providers.dependent_done(provider);
    }

    /// Panics if `instance` isn't of `expected` mode — the evaluator
    /// dispatched it to the wrong `plan_desired_*` method, a contract
    /// violation (§9's "wrong-mode dispatch"), not a recoverable error.
    fn assert_mode(instance: &ResourceInstanceAddr, expected: ResourceMode) {
        assert!(
            instance.resource.mode == expected,
            "{}",
            Error::WrongModeDispatch {
                expected,
                address: ResourceInstanceObjectAddr::current(instance.clone()),
            }
        );
    }

    fn push_closer<F>(&self, f: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        self.close_stack.lock().push(Box::new(f));
    }

    /// Opens (or returns the cached client for) a provider instance. `open`
    /// is only ever called once per address — see [`ProviderRegistry::client_for`].
    pub async fn provider_client<F, Fut>(&self, addr: &ProviderInstanceAddr, open: F) -> Result<Arc<dyn ProviderClient>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn ProviderClient>>>,
    {
        self.providers.client_for(addr, open).await
    }

    /// Registers that a resource instance's planning will depend on `provider`
    /// having stayed open, before dispatching to it.
    pub fn expect_provider_dependent(&self, addr: &ProviderInstanceAddr) {
        self.providers.expect_dependent(addr);
    }

    /// Records a read from the refreshed-state snapshot, used by callers that
    /// refresh prior objects ahead of planning (§6's "refreshed_state").
    pub fn record_refresh(&self, instance: ResourceInstanceAddr, state: crate::state::ResourceInstanceState) {
        self.refreshed_state.lock().insert(instance, state);
    }

    #[instrument(name = "plan_orphan", skip(self), fields(instance = %instance))]
    async fn orphan_provider(&self, instance: &ResourceInstanceAddr) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let addr = ResourceInstanceObjectAddr::current(instance.clone());
        self.resource_completions.expect(instance.clone());

        let Ok(Some(state)) = crate::state::StateReader::instance_state(&self.prior_state, instance).await else {
            self.resource_completions.complete(instance.clone());
            return diags;
        };
        let Some(current) = state.current else {
            self.resource_completions.complete(instance.clone());
            return diags;
        };

        self.providers.expect_dependent(&current.provider);
        if self.providers.get(&current.provider).is_none() {
            warn!(address = %addr, "provider instance not available, orphan delete will be errored");
            diags.push(Diagnostic::error(
                "Provider instance not available",
                format!("cannot plan deletion of {addr}: its provider instance is not available"),
                Some(addr.clone()),
            ));
            self.mark_errored();
        } else {
            debug!(address = %addr, "planned orphan deletion");
        }

        let planned_change = PlannedChange {
            previous_address: addr.clone(),
            new_address: addr.clone(),
            action: Action::Delete,
            before_value: current.value.clone(),
            after_value: Value::null(),
            required_replace_paths: Vec::new(),
            private_blob: current.private_blob.clone(),
        };
        self.objects.put(ResourceInstanceObject {
            address: addr,
            planned_change: Some(planned_change),
            placeholder_value: None,
            provider: current.provider.clone(),
            replace_order: ReplaceOrder::Any,
            dependencies: Set::new(),
        });

        self.finish_resource(instance, &current.provider);
        diags
    }

    /// Plans the deletion of every deposed object under `resource` that isn't
    /// in `desired` (current-instance keys the evaluator still wants).
    /// `desired = None` means the desired set isn't resolvable yet; every
    /// candidate is still reported complete so dependents don't deadlock, but
    /// nothing is planned this round.
    pub async fn plan_resource_instance_orphans(
        &self,
        resource: ResourceAddr,
        desired: Option<Set<Option<InstanceKey>>>,
    ) -> Diagnostics {
        let candidates: Vec<ResourceInstanceAddr> = self
            .prior_state
            .addresses()
            .into_iter()
            .filter(|a| a.resource == resource)
            .collect();

        let Some(desired) = desired else {
            for addr in &candidates {
                self.resource_completions.expect(addr.clone());
                self.resource_completions.complete(addr.clone());
            }
            return Diagnostics::new();
        };

        let mut diags = Diagnostics::new();
        for addr in candidates {
            if desired.contains(&addr.key) {
                continue;
            }
            diags.extend(self.orphan_provider(&addr).await);
        }
        diags
    }

    /// Plans the deletion of every resource (of `mode`) under `module` that
    /// isn't named in `desired` (as `(resource_type, name)` pairs).
    pub async fn plan_resource_orphans(
        &self,
        module: ModuleInstanceAddr,
        mode: ResourceMode,
        desired: Option<Set<(String, String)>>,
    ) -> Diagnostics {
        let candidates: Vec<ResourceInstanceAddr> = self
            .prior_state
            .addresses()
            .into_iter()
            .filter(|a| a.resource.module == module && a.resource.mode == mode)
            .collect();

        let Some(desired) = desired else {
            for addr in &candidates {
                self.resource_completions.expect(addr.clone());
                self.resource_completions.complete(addr.clone());
            }
            return Diagnostics::new();
        };

        let mut diags = Diagnostics::new();
        for addr in candidates {
            let key = (addr.resource.resource_type.clone(), addr.resource.name.clone());
            if desired.contains(&key) {
                continue;
            }
            diags.extend(self.orphan_provider(&addr).await);
        }
        diags
    }

    /// Plans the deletion of every resource instance whose module path's
    /// final step is the call `call`, for keys not present in `desired`.
    pub async fn plan_module_call_instance_orphans(
        &self,
        call: AbsModuleCallAddr,
        desired: Option<Set<Option<String>>>,
    ) -> Diagnostics {
        let depth = call.module.steps.len();
        let candidates: Vec<ResourceInstanceAddr> = self
            .prior_state
            .addresses()
            .into_iter()
            .filter(|a| {
                a.resource.module.steps.len() > depth
                    && a.resource.module.steps[..depth] == call.module.steps[..]
                    && a.resource.module.steps[depth].0 == call.call_name
            })
            .collect();

        let Some(desired) = desired else {
            for addr in &candidates {
                self.resource_completions.expect(addr.clone());
                self.resource_completions.complete(addr.clone());
            }
            return Diagnostics::new();
        };

        let mut diags = Diagnostics::new();
        for addr in candidates {
            let key = addr.resource.module.steps[depth].1.clone();
            if desired.contains(&key) {
                continue;
            }
            diags.extend(self.orphan_provider(&addr).await);
        }
        diags
    }

    /// Plans the deletion of every resource instance under any module call
    /// beneath `module` whose call name isn't present in `desired`.
    pub async fn plan_module_call_orphans(&self, module: ModuleInstanceAddr, desired: Option<Set<String>>) -> Diagnostics {
        let depth = module.steps.len();
        let candidates: Vec<ResourceInstanceAddr> = self
            .prior_state
            .addresses()
            .into_iter()
            .filter(|a| a.resource.module.steps.len() > depth && a.resource.module.steps[..depth] == module.steps[..])
            .collect();

        let Some(desired) = desired else {
            for addr in &candidates {
                self.resource_completions.expect(addr.clone());
                self.resource_completions.complete(addr.clone());
            }
            return Diagnostics::new();
        };

        let mut diags = Diagnostics::new();
        for addr in candidates {
            let call_name = addr.resource.module.steps[depth].0.clone();
            if desired.contains(&call_name) {
                continue;
            }
            diags.extend(self.orphan_provider(&addr).await);
        }
        diags
    }

    /// Plans the deletion of one deposed object directly (not discovered
    /// through the orphan sweeps above, since deposed objects are addressed
    /// individually by the evaluator).
    pub async fn plan_deposed_managed_object(&self, instance: ResourceInstanceAddr, deposed_key: String) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let addr = ResourceInstanceObjectAddr::deposed(instance.clone(), deposed_key.clone());

        let Ok(Some(state)) = crate::state::StateReader::instance_state(&self.prior_state, &instance).await else {
            return diags;
        };
        let Some(stored) = state.deposed.get(&deposed_key) else {
            return diags;
        };

        if self.providers.get(&stored.provider).is_none() {
            diags.push(Diagnostic::error(
                "Provider instance not available",
                format!("cannot plan deletion of {addr}: its provider instance is not available"),
                Some(addr.clone()),
            ));
            self.mark_errored();
        }

        let planned_change = PlannedChange {
            previous_address: addr.clone(),
            new_address: addr.clone(),
            action: Action::Delete,
            before_value: stored.value.clone(),
            after_value: Value::null(),
            required_replace_paths: Vec::new(),
            private_blob: stored.private_blob.clone(),
        };
        self.objects.put(ResourceInstanceObject {
            address: addr,
            planned_change: Some(planned_change),
            placeholder_value: None,
            provider: stored.provider.clone(),
            replace_order: ReplaceOrder::Any,
            dependencies: Set::new(),
        });

        diags
    }

    /// Plans one managed resource instance: validates, refines through the
    /// provider, decides an action, and records the object.
    #[instrument(name = "plan_desired_managed_instance", skip(self, input), fields(instance = %instance))]
    pub async fn plan_desired_managed_instance(
        &self,
        instance: ResourceInstanceAddr,
        input: ManagedInstanceInput,
    ) -> (Value, Diagnostics) {
        Self::assert_mode(&instance, ResourceMode::Managed);
        let mut diags = Diagnostics::new();
        let addr = ResourceInstanceObjectAddr::current(instance.clone());
        let previous_addr = input
            .moved_from
            .clone()
            .map(ResourceInstanceObjectAddr::current)
            .unwrap_or_else(|| addr.clone());

        self.resource_completions.expect(instance.clone());
        self.providers.expect_dependent(&input.provider);

        let lookup_instance = input.moved_from.clone().unwrap_or_else(|| instance.clone());
        let prior = crate::state::StateReader::instance_state(&self.prior_state, &lookup_instance)
            .await
            .ok()
            .flatten()
            .and_then(|s| s.current);

        if input.config.deferred || prior.as_ref().is_some_and(|p| p.value.deferred) {
            debug!(address = %addr, "deferring: input or prior state is marked deferred");
            let placeholder = Value::deferred_unknown();
            self.objects.put(ResourceInstanceObject {
                address: addr,
                planned_change: None,
                placeholder_value: Some(placeholder.clone()),
                provider: input.provider.clone(),
                replace_order: ReplaceOrder::Any,
                dependencies: input.config_deps.clone(),
            });
            self.finish_resource(&instance, &input.provider);
            return (placeholder, diags);
        }

        let Some(client) = self.providers.get(&input.provider) else {
            warn!(address = %addr, provider = %input.provider, "provider instance not available, falling back to placeholder");
            diags.push(Diagnostic::error(
                "Provider instance not available",
                format!("cannot plan {addr}: its provider instance failed to configure"),
                Some(addr.clone()),
            ));
            self.mark_errored();
            let placeholder = Value::deferred_unknown();
            self.objects.put(ResourceInstanceObject {
                address: addr,
                planned_change: None,
                placeholder_value: Some(placeholder.clone()),
                provider: input.provider.clone(),
                replace_order: ReplaceOrder::Any,
                dependencies: input.config_deps.clone(),
            });
            self.finish_resource(&instance, &input.provider);
            return (placeholder, diags);
        };

        let type_name = instance.resource.resource_type.clone();
        match client.validate_resource_config(&type_name, &input.config).await {
            Ok(d) => {
                if d.has_errors() {
                    self.mark_errored();
                }
                diags.extend(d);
            }
            Err(err) => {
                diags.push(Diagnostic::error("Invalid configuration", err.to_string(), Some(addr.clone())));
                self.mark_errored();
            }
        }

        let prior_value = prior.as_ref().map(|p| p.value.clone());
        let proposed_new = input.config.clone().combine(prior_value.as_ref().unwrap_or(&Value::null()));

        let (value, action, required_replace_paths, private_blob) = match client
            .plan_resource_change(&type_name, prior_value.as_ref(), &proposed_new, &input.config)
            .await
        {
            Ok(outcome) => {
                diags.extend(outcome.diagnostics.clone());
                match outcome.value {
                    Some(planned) => {
                        // Invalid whenever the provider hands back a null
                        // planned state but the action it implies needs a
                        // non-null after_value: either an update with no
                        // replace (prior exists, no replace required), or
                        // any replace at all (requires_replace non-empty
                        // regardless of prior) — both end up as actions
                        // other than Create, which §3 requires both values
                        // non-null for.
                        let invalid = planned.planned_state.is_null()
                            && (!planned.requires_replace.is_empty()
                                || prior_value.as_ref().is_some_and(|p| !p.is_null()));
                        if invalid {
                            if planned.legacy_type_system {
                                diags.push(Diagnostic::warning(
                                    "Provider produced an unrefined plan",
                                    format!("{addr}: planned value collapsed to null for an action that requires a non-null after value"),
                                    Some(addr.clone()),
                                ));
                            } else {
                                diags.push(Diagnostic::error(
                                    "Provider produced an invalid plan",
                                    format!("{addr}: planned value collapsed to null for an action that requires a non-null after value"),
                                    Some(addr.clone()),
                                ));
                                self.mark_errored();
                            }
                            // A collapsed-to-null plan carries no actionable
                            // before/after pair for update or replace; fall
                            // back to a no-op rather than violate §3's
                            // action-vs-value invariants.
                            (Value::deferred_unknown(), Action::NoOp, Vec::new(), Vec::new())
                        } else {
                            let action = if prior.is_none() {
                                Action::Create
                            } else if planned.requires_replace.is_empty() {
                                Action::Update
                            } else if input.create_before_destroy {
                                Action::CreateThenDelete
                            } else {
                                Action::DeleteThenCreate
                            };
                            (
                                planned.planned_state.clone(),
                                action,
                                planned.requires_replace,
                                planned.planned_private,
                            )
                        }
                    }
                    None => {
                        self.mark_errored();
                        (Value::deferred_unknown(), Action::NoOp, Vec::new(), Vec::new())
                    }
                }
            }
            Err(err) => {
                diags.push(Diagnostic::error("Provider RPC failed", err.to_string(), Some(addr.clone())));
                self.mark_errored();
                (Value::deferred_unknown(), Action::NoOp, Vec::new(), Vec::new())
            }
        };

        let before_value = if matches!(action, Action::Create) {
            Value::null()
        } else {
            prior_value.clone().unwrap_or_else(Value::null)
        };

        let replace_order = if matches!(action, Action::CreateThenDelete | Action::DeleteThenCreate) {
            if input.create_before_destroy {
                ReplaceOrder::CreateThenDestroy
            } else {
                ReplaceOrder::Any
            }
        } else {
            ReplaceOrder::Any
        };

        let planned_change = PlannedChange {
            previous_address: previous_addr,
            new_address: addr.clone(),
            action,
            before_value,
            after_value: value.clone(),
            required_replace_paths,
            private_blob,
        };

        debug!(address = %addr, action = ?action, "planned managed instance");
        self.objects.put(ResourceInstanceObject {
            address: addr,
            planned_change: Some(planned_change),
            placeholder_value: None,
            provider: input.provider.clone(),
            replace_order,
            dependencies: input.config_deps.clone(),
        });

        self.finish_resource(&instance, &input.provider);
        (value, diags)
    }

    /// Plans one data-source instance: if configuration is wholly known and
    /// nothing upstream is deferred, reads immediately and records a
    /// placeholder only; otherwise defers the read to apply via a recorded
    /// `Read` action.
    #[instrument(name = "plan_desired_data_instance", skip(self, input), fields(instance = %instance))]
    pub async fn plan_desired_data_instance(&self, instance: ResourceInstanceAddr, input: DataInstanceInput) -> (Value, Diagnostics) {
        Self::assert_mode(&instance, ResourceMode::Data);
        let mut diags = Diagnostics::new();
        let addr = ResourceInstanceObjectAddr::current(instance.clone());
        self.resource_completions.expect(instance.clone());
        self.providers.expect_dependent(&input.provider);

        if input.config.deferred {
            debug!(address = %addr, "deferring data source read: config is marked deferred");
            let planned_change = PlannedChange {
                previous_address: addr.clone(),
                new_address: addr.clone(),
                action: Action::Read,
                before_value: Value::null(),
                after_value: Value::deferred_unknown(),
                required_replace_paths: Vec::new(),
                private_blob: Vec::new(),
            };
            self.objects.put(ResourceInstanceObject {
                address: addr,
                planned_change: Some(planned_change),
                placeholder_value: None,
                provider: input.provider.clone(),
                replace_order: ReplaceOrder::Any,
                dependencies: input.config_deps.clone(),
            });
            self.finish_resource(&instance, &input.provider);
            return (Value::deferred_unknown(), diags);
        }

        let Some(client) = self.providers.get(&input.provider) else {
            warn!(address = %addr, provider = %input.provider, "provider instance not available for data source read");
            diags.push(Diagnostic::error(
                "Provider instance not available",
                format!("cannot read data source {addr}"),
                Some(addr.clone()),
            ));
            self.mark_errored();
            let placeholder = Value::deferred_unknown();
            self.objects.put(ResourceInstanceObject {
                address: addr,
                planned_change: None,
                placeholder_value: Some(placeholder.clone()),
                provider: input.provider.clone(),
                replace_order: ReplaceOrder::Any,
                dependencies: input.config_deps.clone(),
            });
            self.finish_resource(&instance, &input.provider);
            return (placeholder, diags);
        };

        let type_name = instance.resource.resource_type.clone();
        match client.validate_resource_config(&type_name, &input.config).await {
            Ok(d) => {
                if d.has_errors() {
                    self.mark_errored();
                }
                diags.extend(d);
            }
            Err(err) => {
                diags.push(Diagnostic::error("Invalid configuration", err.to_string(), Some(addr.clone())));
                self.mark_errored();
            }
        }

        let value = match client.read_data_source(&type_name, &input.config).await {
            Ok(outcome) => {
                diags.extend(outcome.diagnostics.clone());
                match outcome.value {
                    Some(value) => value,
                    None => {
                        self.mark_errored();
                        Value::deferred_unknown()
                    }
                }
            }
            Err(err) => {
                diags.push(Diagnostic::error("Provider RPC failed", err.to_string(), Some(addr.clone())));
                self.mark_errored();
                Value::deferred_unknown()
            }
        };

        debug!(address = %addr, "data source read recorded as placeholder");
        self.objects.put(ResourceInstanceObject {
            address: addr,
            planned_change: None,
            placeholder_value: Some(value.clone()),
            provider: input.provider.clone(),
            replace_order: ReplaceOrder::Any,
            dependencies: input.config_deps.clone(),
        });
        self.finish_resource(&instance, &input.provider);
        (value, diags)
    }

    /// Plans one ephemeral resource instance: opens it via the provider and
    /// stacks its close for the reverse-order cleanup run at
    /// [`Self::close`]. The execution-graph open/state/close subgraph is
    /// assembled at `close()` time, alongside every other object, once every
    /// address's dependents are known.
    #[instrument(name = "plan_desired_ephemeral_instance", skip(self, input), fields(instance = %instance))]
    pub async fn plan_desired_ephemeral_instance(
        &self,
        instance: ResourceInstanceAddr,
        input: EphemeralInstanceInput,
    ) -> (Value, Diagnostics) {
        Self::assert_mode(&instance, ResourceMode::Ephemeral);
        let mut diags = Diagnostics::new();
        let addr = ResourceInstanceObjectAddr::current(instance.clone());
        self.resource_completions.expect(instance.clone());
        self.providers.expect_dependent(&input.provider);

        let Some(client) = self.providers.get(&input.provider) else {
            warn!(address = %addr, provider = %input.provider, "provider instance not available, cannot open ephemeral resource");
            diags.push(Diagnostic::error(
                "Provider instance not available",
                format!("cannot open ephemeral resource {addr}"),
                Some(addr.clone()),
            ));
            self.mark_errored();
            let placeholder = Value::deferred_unknown();
            self.objects.put(ResourceInstanceObject {
                address: addr,
                planned_change: None,
                placeholder_value: Some(placeholder.clone()),
                provider: input.provider.clone(),
                replace_order: ReplaceOrder::Any,
                dependencies: input.config_deps.clone(),
            });
            self.finish_resource(&instance, &input.provider);
            return (placeholder, diags);
        };

        let type_name = instance.resource.resource_type.clone();
        match client.validate_resource_config(&type_name, &input.config).await {
            Ok(d) => {
                if d.has_errors() {
                    self.mark_errored();
                }
                diags.extend(d);
            }
            Err(err) => {
                diags.push(Diagnostic::error("Invalid configuration", err.to_string(), Some(addr.clone())));
                self.mark_errored();
            }
        }

        let value = match client.open_ephemeral(&type_name, &input.config).await {
            Ok(outcome) => {
                diags.extend(outcome.diagnostics.clone());
                match outcome.value {
                    Some(handle) => {
                        info!(address = %addr, "ephemeral resource opened");
                        let token = handle.token.clone();
                        let closer_client = Arc::clone(&client);
                        let closer_type = type_name.clone();
                        let closer_addr = addr.clone();
                        self.push_closer(move || {
                            Box::pin(async move {
                                debug!(address = %closer_addr, "closing ephemeral resource");
                                closer_client.close_ephemeral(&closer_type, &token).await?;
                                Ok(())
                            })
                        });
                        handle.result
                    }
                    None => {
                        self.mark_errored();
                        Value::deferred_unknown()
                    }
                }
            }
            Err(err) => {
                diags.push(Diagnostic::error("Provider RPC failed", err.to_string(), Some(addr.clone())));
                self.mark_errored();
                Value::deferred_unknown()
            }
        };

        self.objects.put(ResourceInstanceObject {
            address: addr,
            planned_change: None,
            placeholder_value: Some(value.clone()),
            provider: input.provider.clone(),
            replace_order: ReplaceOrder::Any,
            dependencies: input.config_deps.clone(),
        });
        self.finish_resource(&instance, &input.provider);
        (value, diags)
    }

    async fn run_closers(&self) {
        let closers: Vec<CloseFn> = std::mem::take(&mut *self.close_stack.lock());
        debug!(count = closers.len(), "running ephemeral closers in reverse order");
        for closer in closers.into_iter().rev() {
            if let Err(err) = closer().await {
                warn!(error = %err, "ephemeral cleanup failed");
                self.diagnostics.lock().push(Diagnostic::warning("Cleanup failed", err.to_string(), None));
            }
        }
    }

    /// Finishes the planning round: drains outstanding completions
    /// defensively, runs ephemeral closers in reverse order, resolves replace
    /// order, assembles and freezes the execution graph, and returns the
    /// [`Plan`] artifact.
    #[instrument(name = "plan_context_close", skip(self))]
    pub async fn close(&self) -> Result<Plan> {
        info!("closing planning round");
        self.resource_completions.drain_pending();
        self.providers.drain_pending_completions();
        self.run_closers().await;

        let frozen = self.objects.close();
        let resolution = replace_order::resolve(&frozen);
        if !resolution.self_dependencies.is_empty() {
            let mut diags = self.diagnostics.lock();
            for addr in &resolution.self_dependencies {
                diags.push(Diagnostic::error(
                    "Self-dependent replacement",
                    format!("{addr} depends on itself through its replace-order chain"),
                    Some(addr.clone()),
                ));
            }
            drop(diags);
            self.mark_errored();
        }

        let order = topo_order(&frozen);
        let mut value_refs: HashMap<ResourceInstanceObjectAddr, RawRef> = HashMap::new();
        let mut completions: HashMap<ResourceInstanceObjectAddr, RawRef> = HashMap::new();
        let mut release_waiters: HashMap<ResourceInstanceObjectAddr, Ref<NothingOut>> = HashMap::new();

        for addr in &order {
            let Some(record) = frozen.get(addr) else { continue };

            if record.address.instance.resource.mode == ResourceMode::Ephemeral {
                let Some(placeholder) = &record.placeholder_value else { continue };
                let desired_ref = self.graph.constant_value(placeholder.clone());
                let client_ref = self.subgraphs.provider_client(&record.provider, &[]);
                let outcome = self.subgraphs.ephemeral(desired_ref, client_ref);
                value_refs.insert(addr.clone(), outcome.state.erase());
                completions.insert(addr.clone(), outcome.close.erase());
                release_waiters.insert(addr.clone(), outcome.close_waiter);
                self.subgraphs.register_provider_dependent(&record.provider, outcome.close.erase());
                continue;
            }

            let Some(change) = &record.planned_change else { continue };

            let final_action = match change.action {
                Action::CreateThenDelete | Action::DeleteThenCreate => match resolution.orders.get(addr) {
                    Some(ResolvedOrder::CreateThenDestroy) => Action::CreateThenDelete,
                    _ => Action::DeleteThenCreate,
                },
                other => other,
            };

            if matches!(final_action, Action::Read) {
                continue;
            }

            let config_deps: Vec<RawRef> = record.dependencies.iter().filter_map(|dep| value_refs.get(dep).copied()).collect();
            let needs_client = !matches!(final_action, Action::NoOp | Action::Forget);
            let client_ref = needs_client.then(|| self.subgraphs.provider_client(&record.provider, &[]));

            let outcome = match final_action {
                Action::Create => {
                    let after = self.graph.constant_value(change.after_value.clone());
                    self.subgraphs.create(addr, after, &config_deps, client_ref)
                }
                Action::Update => {
                    let after = self.graph.constant_value(change.after_value.clone());
                    self.subgraphs.update(addr, &change.previous_address, after, &config_deps, client_ref)
                }
                Action::NoOp => self.subgraphs.no_op(addr, &change.previous_address),
                Action::Forget => self.subgraphs.forget(addr, &change.previous_address),
                Action::Delete => {
                    let null = self.graph.constant_value(Value::null());
                    let barrier = self.graph.mutable_waiter();
                    release_waiters.insert(addr.clone(), barrier);
                    self.subgraphs
                        .delete(addr, &change.previous_address, null, &[barrier.erase()], client_ref)
                }
                Action::CreateThenDelete => {
                    let after = self.graph.constant_value(change.after_value.clone());
                    let null = self.graph.constant_value(Value::null());
                    let barrier = self.graph.mutable_waiter();
                    release_waiters.insert(addr.clone(), barrier);
                    self.subgraphs.create_then_delete(
                        addr,
                        &change.previous_address,
                        after,
                        null,
                        &config_deps,
                        &[barrier.erase()],
                        client_ref,
                    )
                }
                Action::DeleteThenCreate => {
                    let after = self.graph.constant_value(change.after_value.clone());
                    let null = self.graph.constant_value(Value::null());
                    let barrier = self.graph.mutable_waiter();
                    release_waiters.insert(addr.clone(), barrier);
                    self.subgraphs.delete_then_create(
                        addr,
                        &change.previous_address,
                        after,
                        null,
                        &config_deps,
                        &[barrier.erase()],
                        client_ref,
                    )
                }
                Action::ForgetThenCreate => self.subgraphs.forget_then_create(),
                Action::Read => unreachable!("handled above"),
            };

            value_refs.insert(addr.clone(), outcome.result.erase());
            completions.insert(addr.clone(), outcome.completion.erase());
            self.subgraphs.register_provider_dependent(&record.provider, outcome.completion.erase());
        }

        for (addr, waiter) in &release_waiters {
            for dependent in frozen.dependents(addr).iter() {
                if let Some(completion) = completions.get(dependent) {
                    self.graph.register(*waiter, *completion);
                }
            }
        }

        self.subgraphs.close_all_providers();

        let exec: ExecutionGraph = self.graph.finish()?;
        let serialized = exec.marshal()?;

        let mut changes = Map::new();
        for record in frozen.all() {
            if let Some(change) = &record.planned_change {
                let mut change = change.clone();
                if matches!(change.action, Action::CreateThenDelete | Action::DeleteThenCreate) {
                    change.action = match resolution.orders.get(&record.address) {
                        Some(ResolvedOrder::CreateThenDestroy) => Action::CreateThenDelete,
                        _ => Action::DeleteThenCreate,
                    };
                }
                changes.insert(record.address.clone(), change);
            }
        }

        let errored = self.errored.load(Ordering::SeqCst) || !resolution.self_dependencies.is_empty();
        info!(changes = changes.len(), errored, "planning round closed");

        Ok(Plan {
            ui_mode: self.config.ui_mode,
            changes,
            prior_state: self.prior_state.clone(),
            refreshed_state: self.refreshed_state.lock().clone(),
            execution_graph: serialized,
            errored,
        })
    }
}

/// Kahn's-algorithm topological order over the frozen intermediate graph's
/// forward dependency edges. Best-effort on a cycle (falls back to address
/// order for whatever wasn't reached) — a genuine cycle is caught
/// authoritatively by [`PrimitiveGraph::finish`]'s SCC check once the
/// execution graph built from this order is frozen.
fn topo_order(frozen: &FrozenResourceInstanceObjects) -> Vec<ResourceInstanceObjectAddr> {
    let all = frozen.all();
    let mut remaining: HashMap<ResourceInstanceObjectAddr, usize> = all
        .iter()
        .map(|r| (r.address.clone(), frozen.dependencies(&r.address).len()))
        .collect();

    let mut ready: Vec<_> = remaining.iter().filter(|(_, count)| **count == 0).map(|(a, _)| a.clone()).collect();
    ready.sort();
    let mut queue: VecDeque<_> = ready.into();

    let mut order = Vec::with_capacity(all.len());
    let mut seen = std::collections::HashSet::new();

    while let Some(addr) = queue.pop_front() {
        if !seen.insert(addr.clone()) {
            continue;
        }
        order.push(addr.clone());

        let mut dependents: Vec<_> = frozen.dependents(&addr).iter().cloned().collect();
        dependents.sort();
        for dependent in dependents {
            if let Some(count) = remaining.get_mut(&dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if order.len() < all.len() {
        for record in &all {
            if !seen.contains(&record.address) {
                order.push(record.address.clone());
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{EphemeralHandle, PlannedChange as ProviderPlannedChange, ProviderOutcome};
    use async_trait::async_trait;

    struct FakeClient {
        requires_replace: Vec<Vec<String>>,
    }

    #[async_trait]
    impl ProviderClient for FakeClient {
        async fn validate_resource_config(&self, _: &str, _: &Value) -> Result<Diagnostics> {
            Ok(Diagnostics::new())
        }
        async fn read_resource(&self, _: &str, prior: &Value) -> Result<ProviderOutcome<Value>> {
            Ok(ProviderOutcome::ok(prior.clone()))
        }
        async fn read_data_source(&self, _: &str, _: &Value) -> Result<ProviderOutcome<Value>> {
            Ok(ProviderOutcome::ok(Value::known(serde_json::json!("data"))))
        }
        async fn plan_resource_change(
            &self,
            _: &str,
            _: Option<&Value>,
            proposed_new: &Value,
            _: &Value,
        ) -> Result<ProviderOutcome<ProviderPlannedChange>> {
            Ok(ProviderOutcome::ok(ProviderPlannedChange {
                planned_state: proposed_new.clone(),
                requires_replace: self.requires_replace.clone(),
                planned_private: Vec::new(),
                legacy_type_system: false,
            }))
        }
        async fn apply_resource_change(
            &self,
            _: &str,
            _: Option<&Value>,
            planned: &ProviderPlannedChange,
        ) -> Result<ProviderOutcome<Value>> {
            Ok(ProviderOutcome::ok(planned.planned_state.clone()))
        }
        async fn open_ephemeral(&self, _: &str, config: &Value) -> Result<ProviderOutcome<EphemeralHandle>> {
            Ok(ProviderOutcome::ok(EphemeralHandle {
                token: vec![1],
                result: config.clone(),
            }))
        }
        async fn close_ephemeral(&self, _: &str, _: &[u8]) -> Result<Diagnostics> {
            Ok(Diagnostics::new())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn provider_addr() -> ProviderInstanceAddr {
        ProviderInstanceAddr {
            module: ModuleInstanceAddr::root(),
            provider: "test".into(),
            alias: None,
        }
    }

    async fn open_fake(ctx: &PlanContext, requires_replace: Vec<Vec<String>>) {
        ctx.provider_client(&provider_addr(), || async move {
            Ok(Arc::new(FakeClient { requires_replace }) as Arc<dyn ProviderClient>)
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn zero_instances_closes_to_empty_plan() {
        let ctx = PlanContext::new(PlanContextConfig::default(), StateSnapshot::new());
        let plan = ctx.close().await.unwrap();
        assert!(plan.is_empty());
        assert!(!plan.errored);
        let graph = ExecutionGraph::unmarshal(&plan.execution_graph).unwrap();
        assert!(graph.is_empty());
    }

    #[tokio::test]
    async fn create_only_matches_s1_shape() {
        let ctx = PlanContext::new(PlanContextConfig::default(), StateSnapshot::new());
        open_fake(&ctx, Vec::new()).await;

        let instance = ResourceInstanceAddr::managed("test_placeholder", "widget");
        let (_value, diags) = ctx
            .plan_desired_managed_instance(
                instance,
                ManagedInstanceInput {
                    provider: provider_addr(),
                    config: Value::known(serde_json::json!({})),
                    config_deps: Set::new(),
                    create_before_destroy: false,
                    moved_from: None,
                },
            )
            .await;
        assert!(!diags.has_errors());

        let plan = ctx.close().await.unwrap();
        assert_eq!(plan.changes.len(), 1);
        assert!(!plan.errored);

        let graph = ExecutionGraph::unmarshal(&plan.execution_graph).unwrap();
        let repr = graph.debug_repr();
        assert!(repr.contains("ResourceInstanceDesired(test_placeholder.widget, await())"));
        assert!(repr.contains("ManagedFinalPlan("));
        assert!(repr.contains("ManagedApply("));
        assert!(repr.contains("test_placeholder.widget = r["));
    }

    #[tokio::test]
    async fn orphan_without_provider_is_errored_delete() {
        let mut prior = StateSnapshot::new();
        let instance = ResourceInstanceAddr::managed("test_placeholder", "gone");
        prior.insert(
            instance.clone(),
            crate::state::ResourceInstanceState {
                current: Some(crate::state::StoredObject {
                    value: Value::known(serde_json::json!("old")),
                    private_blob: Vec::new(),
                    provider: provider_addr(),
                }),
                deposed: std::collections::BTreeMap::new(),
            },
        );

        let ctx = PlanContext::new(PlanContextConfig::default(), prior);
        let diags = ctx
            .plan_resource_instance_orphans(instance.resource.clone(), Some(Set::new()))
            .await;
        assert!(diags.has_errors());

        let plan = ctx.close().await.unwrap();
        assert!(plan.errored);
        assert_eq!(plan.changes.len(), 1);
    }

    #[tokio::test]
    async fn update_with_replace_chooses_delete_then_create_by_default() {
        let mut prior = StateSnapshot::new();
        let instance = ResourceInstanceAddr::managed("test_placeholder", "widget");
        prior.insert(
            instance.clone(),
            crate::state::ResourceInstanceState {
                current: Some(crate::state::StoredObject {
                    value: Value::known(serde_json::json!("before")),
                    private_blob: Vec::new(),
                    provider: provider_addr(),
                }),
                deposed: std::collections::BTreeMap::new(),
            },
        );

        let ctx = PlanContext::new(PlanContextConfig::default(), prior);
        open_fake(&ctx, vec![vec!["id".to_string()]]).await;

        ctx.plan_desired_managed_instance(
            instance.clone(),
            ManagedInstanceInput {
                provider: provider_addr(),
                config: Value::known(serde_json::json!("after")),
                config_deps: Set::new(),
                create_before_destroy: false,
                moved_from: None,
            },
        )
        .await;

        let plan = ctx.close().await.unwrap();
        let addr = ResourceInstanceObjectAddr::current(instance);
        assert_eq!(plan.changes.get(&addr).unwrap().action, Action::DeleteThenCreate);
    }

    #[tokio::test]
    #[should_panic(expected = "wrong-mode dispatch")]
    async fn data_instance_dispatched_to_managed_planner_panics() {
        let ctx = PlanContext::new(PlanContextConfig::default(), StateSnapshot::new());
        let instance = ResourceInstanceAddr {
            resource: ResourceAddr {
                module: ModuleInstanceAddr::root(),
                mode: ResourceMode::Data,
                resource_type: "test_lookup".into(),
                name: "env".into(),
            },
            key: None,
        };
        ctx.plan_desired_managed_instance(
            instance,
            ManagedInstanceInput {
                provider: provider_addr(),
                config: Value::known(serde_json::json!({})),
                config_deps: Set::new(),
                create_before_destroy: false,
                moved_from: None,
            },
        )
        .await;
    }

    /// A provider that always plans a replace but hands back a null planned
    /// state — a plausible response the invalid-plan guard must catch
    /// *before* `ResourceInstanceObjects::put` validates invariants, not
    /// after: `CreateThenDelete`/`DeleteThenCreate` require a non-null
    /// `after_value`, so feeding this straight through would panic instead
    /// of degrading to a diagnostic.
    struct NullReplaceClient;

    #[async_trait]
    impl ProviderClient for NullReplaceClient {
        async fn validate_resource_config(&self, _: &str, _: &Value) -> Result<Diagnostics> {
            Ok(Diagnostics::new())
        }
        async fn read_resource(&self, _: &str, prior: &Value) -> Result<ProviderOutcome<Value>> {
            Ok(ProviderOutcome::ok(prior.clone()))
        }
        async fn read_data_source(&self, _: &str, _: &Value) -> Result<ProviderOutcome<Value>> {
            Ok(ProviderOutcome::ok(Value::null()))
        }
        async fn plan_resource_change(
            &self,
            _: &str,
            _: Option<&Value>,
            _: &Value,
            _: &Value,
        ) -> Result<ProviderOutcome<ProviderPlannedChange>> {
            Ok(ProviderOutcome::ok(ProviderPlannedChange {
                planned_state: Value::null(),
                requires_replace: vec![vec!["id".to_string()]],
                planned_private: Vec::new(),
                legacy_type_system: false,
            }))
        }
        async fn apply_resource_change(
            &self,
            _: &str,
            _: Option<&Value>,
            planned: &ProviderPlannedChange,
        ) -> Result<ProviderOutcome<Value>> {
            Ok(ProviderOutcome::ok(planned.planned_state.clone()))
        }
        async fn open_ephemeral(&self, _: &str, config: &Value) -> Result<ProviderOutcome<EphemeralHandle>> {
            Ok(ProviderOutcome::ok(EphemeralHandle {
                token: vec![1],
                result: config.clone(),
            }))
        }
        async fn close_ephemeral(&self, _: &str, _: &[u8]) -> Result<Diagnostics> {
            Ok(Diagnostics::new())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn null_planned_state_with_replace_degrades_to_diagnostic_not_panic() {
        let mut prior = StateSnapshot::new();
        let instance = ResourceInstanceAddr::managed("test_placeholder", "widget");
        prior.insert(
            instance.clone(),
            crate::state::ResourceInstanceState {
                current: Some(crate::state::StoredObject {
                    value: Value::known(serde_json::json!("before")),
                    private_blob: Vec::new(),
                    provider: provider_addr(),
                }),
                deposed: std::collections::BTreeMap::new(),
            },
        );

        let ctx = PlanContext::new(PlanContextConfig::default(), prior);
        ctx.provider_client(&provider_addr(), || async move {
            Ok(Arc::new(NullReplaceClient) as Arc<dyn ProviderClient>)
        })
        .await
        .unwrap();

        let (_value, diags) = ctx
            .plan_desired_managed_instance(
                instance.clone(),
                ManagedInstanceInput {
                    provider: provider_addr(),
                    config: Value::known(serde_json::json!("after")),
                    config_deps: Set::new(),
                    create_before_destroy: false,
                    moved_from: None,
                },
            )
            .await;
        assert!(diags.has_errors());

        // Must not panic: `close()` puts the record, which would previously
        // trip `PlannedChange::check_invariants` on a replace with a null
        // after_value.
        let plan = ctx.close().await.unwrap();
        assert!(plan.errored);
        let addr = ResourceInstanceObjectAddr::current(instance);
        assert_eq!(plan.changes.get(&addr).unwrap().action, Action::NoOp);
    }

    #[tokio::test]
    async fn data_source_reads_immediately_when_config_is_known() {
        let ctx = PlanContext::new(PlanContextConfig::default(), StateSnapshot::new());
        open_fake(&ctx, Vec::new()).await;

        let instance = ResourceInstanceAddr {
            resource: ResourceAddr {
                module: ModuleInstanceAddr::root(),
                mode: ResourceMode::Data,
                resource_type: "test_lookup".into(),
                name: "env".into(),
            },
            key: None,
        };
        let (value, diags) = ctx
            .plan_desired_data_instance(
                instance,
                DataInstanceInput {
                    provider: provider_addr(),
                    config: Value::known(serde_json::json!({})),
                    config_deps: Set::new(),
                },
            )
            .await;
        assert!(!diags.has_errors());
        assert_eq!(value, Value::known(serde_json::json!("data")));

        let plan = ctx.close().await.unwrap();
        assert!(plan.is_empty(), "data-source placeholder carries no planned change");
    }
}
