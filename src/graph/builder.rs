//! Execution-graph high-level builder: the per-action subgraph factories
//! from §4.G, plus the provider-instance and ephemeral-resource singleton
//! lifecycles that every subgraph hangs its completion off of.
//!
//! Where §4.G describes "a config-dep register callback the driver calls
//! later," this builder takes the dependency refs as a plain parameter
//! instead: by the time the driver (§4.H, `planner.rs`) reaches subgraph
//! assembly, the intermediate graph is already frozen and every object's
//! dependency set is known, so there's nothing left to defer. Same
//! information, no callback indirection — a simplification the Rust port
//! takes because the two-phase "register now, resolve later" split only
//! earns its keep when dependencies trickle in during assembly.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr::{ProviderInstanceAddr, ResourceInstanceObjectAddr};
use crate::graph::primitive::{NothingOut, ObjectOut, PrimitiveGraph, ProviderClientOut, RawRef, Ref, ValueOut};
use crate::value::Value;

/// What a subgraph factory hands back to the driver: the ref a reader should
/// treat as this object's current value, and the ref that must finish before
/// the object's provider (or anything downstream) may be considered done
/// with it. These coincide except in `create_then_delete`, where the value
/// is available as soon as the create leg applies but the provider isn't
/// released until the destroy leg also finishes.
#[derive(Debug, Clone, Copy)]
pub struct SubgraphOutcome {
    /// The ref holding this object's resulting state.
    pub result: Ref<ObjectOut>,
    /// The ref that must complete before dependents/provider-close may proceed.
    pub completion: Ref<ObjectOut>,
}

struct ProviderEntry {
    open: Ref<ProviderClientOut>,
    close_waiter: Ref<NothingOut>,
}

struct EphemeralEntry {
    close_waiter: Ref<NothingOut>,
}

/// The per-action subgraph factories, plus provider/ephemeral singleton bookkeeping.
pub struct SubgraphBuilder {
    graph: Arc<PrimitiveGraph>,
    providers: Mutex<HashMap<ProviderInstanceAddr, ProviderEntry>>,
    ephemerals: Mutex<Vec<EphemeralEntry>>,
}

impl SubgraphBuilder {
    /// Builds on top of an existing primitive graph.
    #[must_use]
    pub fn new(graph: Arc<PrimitiveGraph>) -> Self {
        Self {
            graph,
            providers: Mutex::new(HashMap::new()),
            ephemerals: Mutex::new(Vec::new()),
        }
    }

    /// Returns the open-client ref for `addr`, creating the
    /// config/open/close-waiter singleton the first time this address is
    /// seen. `config_deps` (the resource-instance addresses the provider's
    /// own configuration block depends on) is only consulted on first
    /// creation; later callers for the same address get the cached ref.
    pub fn provider_client(&self, addr: &ProviderInstanceAddr, config_deps: &[RawRef]) -> Ref<ProviderClientOut> {
        let mut providers = self.providers.lock();
        if let Some(entry) = providers.get(addr) {
            return entry.open;
        }

        let waiter = if config_deps.is_empty() {
            None
        } else {
            Some(self.graph.waiter(config_deps))
        };
        let config = self.graph.provider_instance_config(addr.clone(), waiter);
        let opened = self.graph.provider_instance_open(config);
        let close_waiter = self.graph.mutable_waiter();

        providers.insert(
            addr.clone(),
            ProviderEntry {
                open: opened,
                close_waiter,
            },
        );
        opened
    }

    /// Registers that `completion` must finish before `addr`'s provider may close.
    pub fn register_provider_dependent(&self, addr: &ProviderInstanceAddr, completion: impl Into<RawRef>) {
        let waiter = self.providers.lock().get(addr).map(|e| e.close_waiter);
        if let Some(waiter) = waiter {
            self.graph.register(waiter, completion);
        }
    }

    /// Creates the final `ProviderInstanceClose` node for every provider
    /// instance that was ever opened. Call once, after every subgraph has
    /// registered its completion ref. Returns the close ref per provider.
    pub fn close_all_providers(&self) -> Vec<(ProviderInstanceAddr, Ref<NothingOut>)> {
        self.providers
            .lock()
            .iter()
            .map(|(addr, entry)| {
                (
                    addr.clone(),
                    self.graph.provider_instance_close(entry.open, Some(entry.close_waiter)),
                )
            })
            .collect()
    }

    fn desired_waiter(&self, config_deps: &[RawRef]) -> Option<Ref<NothingOut>> {
        if config_deps.is_empty() {
            None
        } else {
            Some(self.graph.waiter(config_deps))
        }
    }

    /// **Create**: `desired -> final_plan(desired, none, planned_after, client) -> apply(final_plan, none, client, wait=∅)`.
    pub fn create(
        &self,
        addr: &ResourceInstanceObjectAddr,
        planned_after: Ref<ValueOut>,
        config_deps: &[RawRef],
        client: Option<Ref<ProviderClientOut>>,
    ) -> SubgraphOutcome {
        let desired = self
            .graph
            .resource_instance_desired(addr.clone(), self.desired_waiter(config_deps));
        let final_plan = self.graph.managed_final_plan(Some(desired), None, planned_after, client);
        let applied = self.graph.managed_apply(final_plan, None, client, None);
        self.graph.bind_address(addr.clone(), applied);
        SubgraphOutcome {
            result: applied,
            completion: applied,
        }
    }

    /// **Update**: `prior(+optional change_addr) -> desired -> final_plan(desired, prior, planned_after, client) -> apply(final_plan, none, client, wait=∅)`.
    pub fn update(
        &self,
        addr: &ResourceInstanceObjectAddr,
        prior_addr: &ResourceInstanceObjectAddr,
        planned_after: Ref<ValueOut>,
        config_deps: &[RawRef],
        client: Option<Ref<ProviderClientOut>>,
    ) -> SubgraphOutcome {
        let prior = self.graph.read_resource_instance_prior(prior_addr.clone());
        let prior = if prior_addr == addr {
            prior
        } else {
            self.graph.managed_change_addr(prior, addr.clone())
        };
        let desired = self
            .graph
            .resource_instance_desired(addr.clone(), self.desired_waiter(config_deps));
        let final_plan = self.graph.managed_final_plan(Some(desired), Some(prior), planned_after, client);
        let applied = self.graph.managed_apply(final_plan, None, client, None);
        self.graph.bind_address(addr.clone(), applied);
        SubgraphOutcome {
            result: applied,
            completion: applied,
        }
    }

    /// **Delete**: `prior(+optional change_addr) -> final_plan(none, prior, null, client) -> apply(final_plan, none, client, wait=delete_barrier)`.
    pub fn delete(
        &self,
        addr: &ResourceInstanceObjectAddr,
        prior_addr: &ResourceInstanceObjectAddr,
        planned_null: Ref<ValueOut>,
        delete_deps: &[RawRef],
        client: Option<Ref<ProviderClientOut>>,
    ) -> SubgraphOutcome {
        let prior = self.graph.read_resource_instance_prior(prior_addr.clone());
        let prior = if prior_addr == addr {
            prior
        } else {
            self.graph.managed_change_addr(prior, addr.clone())
        };
        let final_plan = self.graph.managed_final_plan(None, Some(prior), planned_null, client);
        let wait = self.desired_waiter(delete_deps);
        let applied = self.graph.managed_apply(final_plan, None, client, wait);
        self.graph.bind_address(addr.clone(), applied);
        SubgraphOutcome {
            result: applied,
            completion: applied,
        }
    }

    /// **DeleteThenCreate** (S4): both legs planned up front; the destroy
    /// apply waits on the create *plan* (not apply) plus the delete barrier,
    /// and the create apply waits on the destroy apply. Creation must be
    /// successfully planned before destruction may begin.
    pub fn delete_then_create(
        &self,
        addr: &ResourceInstanceObjectAddr,
        prior_addr: &ResourceInstanceObjectAddr,
        planned_after: Ref<ValueOut>,
        planned_null: Ref<ValueOut>,
        config_deps: &[RawRef],
        delete_deps: &[RawRef],
        client: Option<Ref<ProviderClientOut>>,
    ) -> SubgraphOutcome {
        let prior = self.graph.read_resource_instance_prior(prior_addr.clone());
        let desired = self
            .graph
            .resource_instance_desired(addr.clone(), self.desired_waiter(config_deps));
        let create_plan = self.graph.managed_final_plan(Some(desired), None, planned_after, client);
        let destroy_plan = self.graph.managed_final_plan(None, Some(prior), planned_null, client);

        let mut destroy_wait: Vec<RawRef> = vec![create_plan.erase()];
        destroy_wait.extend_from_slice(delete_deps);
        let destroy_waiter = self.graph.waiter(&destroy_wait);
        let destroy_apply = self.graph.managed_apply(destroy_plan, None, client, Some(destroy_waiter));

        let create_waiter = self.graph.waiter(&[destroy_apply.erase()]);
        let create_apply = self.graph.managed_apply(create_plan, None, client, Some(create_waiter));

        self.graph.bind_address(addr.clone(), create_apply);
        SubgraphOutcome {
            result: create_apply,
            completion: create_apply,
        }
    }

    /// **CreateThenDelete** (S5): both legs planned, then the prior object is
    /// deposed so it survives alongside the new one; the create apply uses
    /// the deposed object as a fallback so a failed create leaves the old
    /// object recoverable in state, and the destroy apply only runs once the
    /// create apply (and the delete barrier) complete.
    pub fn create_then_delete(
        &self,
        addr: &ResourceInstanceObjectAddr,
        prior_addr: &ResourceInstanceObjectAddr,
        planned_after: Ref<ValueOut>,
        planned_null: Ref<ValueOut>,
        config_deps: &[RawRef],
        delete_deps: &[RawRef],
        client: Option<Ref<ProviderClientOut>>,
    ) -> SubgraphOutcome {
        let prior = self.graph.read_resource_instance_prior(prior_addr.clone());
        let desired = self
            .graph
            .resource_instance_desired(addr.clone(), self.desired_waiter(config_deps));
        let create_plan = self.graph.managed_final_plan(Some(desired), None, planned_after, client);
        let destroy_plan = self.graph.managed_final_plan(None, Some(prior), planned_null, client);

        let depose_waiter = self.graph.waiter(&[create_plan.erase(), destroy_plan.erase()]);
        let deposed = self.graph.managed_depose(prior, Some(depose_waiter));

        let create_apply = self.graph.managed_apply(create_plan, Some(deposed), client, None);

        let mut destroy_wait: Vec<RawRef> = vec![create_apply.erase()];
        destroy_wait.extend_from_slice(delete_deps);
        let destroy_waiter = self.graph.waiter(&destroy_wait);
        let destroy_apply = self.graph.managed_apply(destroy_plan, None, client, Some(destroy_waiter));

        self.graph.bind_address(addr.clone(), create_apply);
        SubgraphOutcome {
            result: create_apply,
            completion: destroy_apply,
        }
    }

    /// **NoOp**: address-rebind-only. Still requires a `change_addr` node if
    /// the object's address changed ("moved") even though nothing else did.
    pub fn no_op(&self, addr: &ResourceInstanceObjectAddr, prior_addr: &ResourceInstanceObjectAddr) -> SubgraphOutcome {
        let prior = self.graph.read_resource_instance_prior(prior_addr.clone());
        let result = if prior_addr == addr {
            prior
        } else {
            self.graph.managed_change_addr(prior, addr.clone())
        };
        self.graph.bind_address(addr.clone(), result);
        SubgraphOutcome {
            result,
            completion: result,
        }
    }

    /// **Forget**: removes the object from state without calling the
    /// provider. Reserved per the source's own "not yet implemented" branches
    /// when combined with an address change — see the design notes.
    pub fn forget(&self, addr: &ResourceInstanceObjectAddr, prior_addr: &ResourceInstanceObjectAddr) -> SubgraphOutcome {
        assert!(
            prior_addr == addr,
            "forget combined with an address change is not yet implemented"
        );
        let prior = self.graph.read_resource_instance_prior(prior_addr.clone());
        self.graph.bind_address(addr.clone(), prior);
        SubgraphOutcome {
            result: prior,
            completion: prior,
        }
    }

    /// **ForgetThenCreate**: reserved, same as [`Self::forget`] — panics until
    /// the forget-plus-replace combination is disambiguated upstream.
    pub fn forget_then_create(&self) -> ! {
        panic!("forget-then-create replacement is not yet implemented")
    }

    /// Ephemeral-resource subgraph: `open -> state` for consumers, `open ->
    /// close(waiter)` for release ordering. Returns the value ref and the
    /// close-waiter ref; callers register every downstream consumer's
    /// completion onto the waiter before the close node is finalized.
    pub fn ephemeral(&self, desired: Ref<ValueOut>, client: Ref<ProviderClientOut>) -> EphemeralOutcome {
        let open = self.graph.ephemeral_open(desired, client);
        let state = self.graph.ephemeral_state(open);
        let close_waiter = self.graph.mutable_waiter();
        let close = self.graph.ephemeral_close(open, Some(close_waiter));

        self.ephemerals.lock().push(EphemeralEntry { close_waiter });

        EphemeralOutcome {
            state,
            close,
            close_waiter,
        }
    }

    /// Registers `completion` as something that must finish before the
    /// ephemeral behind `close_waiter` may close.
    pub fn register_ephemeral_dependent(&self, close_waiter: Ref<NothingOut>, completion: impl Into<RawRef>) {
        self.graph.register(close_waiter, completion);
    }
}

/// What [`SubgraphBuilder::ephemeral`] hands back.
#[derive(Debug, Clone, Copy)]
pub struct EphemeralOutcome {
    /// The ref yielding the ephemeral's value to consumers.
    pub state: Ref<ValueOut>,
    /// The close operation's own ref.
    pub close: Ref<NothingOut>,
    /// The mutable waiter close depends on; register consumer completions here.
    pub close_waiter: Ref<NothingOut>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{InstanceKey, ResourceInstanceAddr};

    fn addr(name: &str) -> ResourceInstanceObjectAddr {
        ResourceInstanceObjectAddr::current(ResourceInstanceAddr::managed("test", name))
    }

    fn builder() -> (Arc<PrimitiveGraph>, SubgraphBuilder) {
        let graph = Arc::new(PrimitiveGraph::new());
        let sb = SubgraphBuilder::new(Arc::clone(&graph));
        (graph, sb)
    }

    /// Reproduces S1 from the end-to-end scenarios: create only.
    #[test]
    fn create_subgraph_matches_s1_shape() {
        let (graph, sb) = builder();
        let after = graph.constant_value(Value::known(serde_json::json!({})));
        sb.create(&addr("placeholder"), after, &[], None);

        let frozen = graph.finish().unwrap();
        let repr = frozen.debug_repr();
        assert!(repr.contains("ResourceInstanceDesired(test.placeholder, await())"));
        assert!(repr.contains("ManagedFinalPlan(r[0], nil, v[0], nil)"));
        assert!(repr.contains("ManagedApply(r[1], nil, nil, await())"));
        assert!(repr.contains("test.placeholder = r[2];"));
    }

    /// Reproduces S2: plain update, no move.
    #[test]
    fn update_subgraph_matches_s2_shape() {
        let (graph, sb) = builder();
        let after = graph.constant_value(Value::known(serde_json::json!("after")));
        sb.update(&addr("placeholder"), &addr("placeholder"), after, &[], None);

        let frozen = graph.finish().unwrap();
        assert_eq!(
            frozen.debug_repr(),
            concat!(
                "v[0] = \"after\";\n",
                "r[0] = ResourceInstancePrior(test.placeholder);\n",
                "r[1] = ResourceInstanceDesired(test.placeholder, await());\n",
                "r[2] = ManagedFinalPlan(r[1], r[0], v[0], nil);\n",
                "r[3] = ManagedApply(r[2], nil, nil, await());\n",
                "test.placeholder = r[3];\n",
            )
        );
    }

    /// Reproduces S3: update with a move from `test.old` to `test.placeholder`.
    #[test]
    fn update_with_move_matches_s3_shape() {
        let (graph, sb) = builder();
        let after = graph.constant_value(Value::known(serde_json::json!("after")));
        sb.update(&addr("placeholder"), &addr("old"), after, &[], None);

        let frozen = graph.finish().unwrap();
        assert_eq!(
            frozen.debug_repr(),
            concat!(
                "v[0] = \"after\";\n",
                "r[0] = ResourceInstancePrior(test.old);\n",
                "r[1] = ManagedChangeAddr(r[0], test.placeholder);\n",
                "r[2] = ResourceInstanceDesired(test.placeholder, await());\n",
                "r[3] = ManagedFinalPlan(r[2], r[1], v[0], nil);\n",
                "r[4] = ManagedApply(r[3], nil, nil, await());\n",
                "test.placeholder = r[4];\n",
            )
        );
    }

    /// Reproduces S4: destroy-then-create is wired as create-plan-first.
    #[test]
    fn delete_then_create_matches_s4_shape() {
        let (graph, sb) = builder();
        let after = graph.constant_value(Value::known(serde_json::json!("after")));
        let null = graph.constant_value(Value::known(serde_json::json!(null)));
        sb.delete_then_create(&addr("placeholder"), &addr("placeholder"), after, null, &[], &[], None);

        let frozen = graph.finish().unwrap();
        assert_eq!(
            frozen.debug_repr(),
            concat!(
                "v[0] = \"after\";\n",
                "v[1] = nil;\n",
                "r[0] = ResourceInstancePrior(test.placeholder);\n",
                "r[1] = ResourceInstanceDesired(test.placeholder, await());\n",
                "r[2] = ManagedFinalPlan(r[1], nil, v[0], nil);\n",
                "r[3] = ManagedFinalPlan(nil, r[0], v[1], nil);\n",
                "r[4] = ManagedApply(r[3], nil, nil, await(r[2]));\n",
                "r[5] = ManagedApply(r[2], nil, nil, await(r[4]));\n",
                "test.placeholder = r[5];\n",
            )
        );
    }

    /// Reproduces S5: create-then-delete depose-and-fallback wiring.
    #[test]
    fn create_then_delete_matches_s5_shape() {
        let (graph, sb) = builder();
        let after = graph.constant_value(Value::known(serde_json::json!("after")));
        let null = graph.constant_value(Value::known(serde_json::json!(null)));
        sb.create_then_delete(&addr("placeholder"), &addr("placeholder"), after, null, &[], &[], None);

        let frozen = graph.finish().unwrap();
        assert_eq!(
            frozen.debug_repr(),
            concat!(
                "v[0] = \"after\";\n",
                "v[1] = nil;\n",
                "r[0] = ResourceInstancePrior(test.placeholder);\n",
                "r[1] = ResourceInstanceDesired(test.placeholder, await());\n",
                "r[2] = ManagedFinalPlan(r[1], nil, v[0], nil);\n",
                "r[3] = ManagedFinalPlan(nil, r[0], v[1], nil);\n",
                "r[4] = ManagedDepose(r[0], await(r[2], r[3]));\n",
                "r[5] = ManagedApply(r[2], r[4], nil, await());\n",
                "r[6] = ManagedApply(r[3], nil, nil, await(r[5]));\n",
                "test.placeholder = r[5];\n",
            )
        );
    }

    #[test]
    fn create_then_delete_completion_is_the_destroy_apply() {
        let (graph, sb) = builder();
        let after = graph.constant_value(Value::known(serde_json::json!("after")));
        let null = graph.constant_value(Value::known(serde_json::json!(null)));
        let outcome = sb.create_then_delete(&addr("placeholder"), &addr("placeholder"), after, null, &[], &[], None);

        assert_ne!(outcome.result.erase(), outcome.completion.erase());
        let frozen = graph.finish().unwrap();
        assert!(!frozen.is_empty());
    }

    #[test]
    fn no_op_without_move_reuses_prior_ref() {
        let (graph, sb) = builder();
        let outcome = sb.no_op(&addr("placeholder"), &addr("placeholder"));
        assert_eq!(outcome.result.erase(), outcome.completion.erase());
        let frozen = graph.finish().unwrap();
        assert_eq!(frozen.len(), 1);
    }

    #[test]
    #[should_panic(expected = "not yet implemented")]
    fn forget_with_move_panics() {
        let (_graph, sb) = builder();
        let moved = ResourceInstanceObjectAddr::current(ResourceInstanceAddr {
            resource: addr("placeholder").instance.resource,
            key: Some(InstanceKey::Int(1)),
        });
        sb.forget(&moved, &addr("placeholder"));
    }
}
