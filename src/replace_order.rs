//! Replace-order resolution.
//!
//! A pure function over the frozen intermediate graph: decides, for every
//! object that carries a replace action, whether the destroy leg runs before
//! or after the create leg. Grounded on §4.E's flood-fill fixpoint:
//! `create_then_destroy` floods outward from every seed across the
//! whole connected component (forward and reverse neighbors alike), not just
//! one hop, so every object in a chain ends up with the same final order.

use crate::addr::{ResourceInstanceObjectAddr, Set};
use crate::object::{FrozenResourceInstanceObjects, ReplaceOrder};

/// Final, resolved order for one object. `Any` never appears here; every
/// object is resolved to one of the other two variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ResolvedOrder {
    /// Create the replacement before destroying the old object.
    CreateThenDestroy,
    /// Destroy the old object before creating the replacement.
    DestroyThenCreate,
}

/// Output of [`resolve`]: the final order assigned to every object plus the
/// set of objects that were found to depend, directly or through the
/// forward/reverse neighbor scan, on themselves.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Final order per object address.
    pub orders: std::collections::HashMap<ResourceInstanceObjectAddr, ResolvedOrder>,
    /// Addresses that were observed as their own neighbor during the scan.
    pub self_dependencies: Set<ResourceInstanceObjectAddr>,
}

/// Resolves every object's initial `any`/`create_then_destroy` hint into a
/// final order.
///
/// # Panics
///
/// Panics if any object's `replace_order` is [`ReplaceOrder::DestroyThenCreate`]
/// on input — per §4.E that value is only ever produced by this function,
/// never supplied by a caller.
#[must_use]
pub fn resolve(objects: &FrozenResourceInstanceObjects) -> Resolution {
    let all = objects.all();
    for record in &all {
        assert!(
            !matches!(record.replace_order, ReplaceOrder::DestroyThenCreate),
            "object {} was submitted with an already-resolved replace order",
            record.address
        );
    }

    let mut orders = std::collections::HashMap::new();
    let mut self_dependencies = Set::new();
    let mut queue = std::collections::VecDeque::new();

    // Self-dependency check: an object that appears in its own forward or
    // reverse neighbor set. Independent of order assignment, so it's checked
    // once up front rather than as a side effect of the flood below.
    for record in &all {
        let neighbors = objects.dependencies(&record.address).union(&objects.dependents(&record.address));
        if neighbors.contains(&record.address) {
            self_dependencies.insert(record.address.clone());
        }
    }

    // Step 1: every object whose initial hint is already create_then_destroy
    // is final immediately, and seeds the flood-fill below.
    for record in &all {
        if matches!(record.replace_order, ReplaceOrder::CreateThenDestroy) {
            orders.insert(record.address.clone(), ResolvedOrder::CreateThenDestroy);
            queue.push_back(record.address.clone());
        }
    }

    // Step 2: flood create_then_destroy outward from every seed across the
    // whole connected component (forward and reverse neighbors), to a
    // fixpoint — not just one hop — so every object reachable through a
    // chain of dependency edges from a create_then_destroy seed ends up with
    // the same final order, matching this module's own consistency
    // guarantee.
    while let Some(addr) = queue.pop_front() {
        let neighbors = objects.dependencies(&addr).union(&objects.dependents(&addr));
        for neighbor in &neighbors {
            if *neighbor == addr {
                continue;
            }
            if orders.contains_key(neighbor) {
                continue;
            }
            orders.insert(neighbor.clone(), ResolvedOrder::CreateThenDestroy);
            queue.push_back(neighbor.clone());
        }
    }

    // Step 3: anything still unassigned defaults to destroy_then_create.
    for record in &all {
        orders
            .entry(record.address.clone())
            .or_insert(ResolvedOrder::DestroyThenCreate);
    }

    Resolution {
        orders,
        self_dependencies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{ModuleInstanceAddr, ProviderInstanceAddr, ResourceInstanceAddr};
    use crate::object::{ResourceInstanceObject, ResourceInstanceObjects};
    use crate::value::Value;

    fn provider() -> ProviderInstanceAddr {
        ProviderInstanceAddr {
            module: ModuleInstanceAddr::root(),
            provider: "test".into(),
            alias: None,
        }
    }

    fn record(name: &str, order: ReplaceOrder, deps: &[&str]) -> ResourceInstanceObject {
        let address = ResourceInstanceObjectAddr::current(ResourceInstanceAddr::managed("test_thing", name));
        let mut dependencies = Set::new();
        for dep in deps {
            dependencies.insert(ResourceInstanceObjectAddr::current(ResourceInstanceAddr::managed(
                "test_thing",
                *dep,
            )));
        }
        ResourceInstanceObject {
            address,
            planned_change: None,
            placeholder_value: Some(Value::null()),
            provider: provider(),
            replace_order: order,
            dependencies,
        }
    }

    fn addr_for(name: &str) -> ResourceInstanceObjectAddr {
        ResourceInstanceObjectAddr::current(ResourceInstanceAddr::managed("test_thing", name))
    }

    /// S6 from the end-to-end scenarios: a linear chain `a -> b -> c` where
    /// `b` starts `create_then_destroy` and the others start `any` all
    /// resolve to `create_then_destroy`; an isolated `any` object resolves to
    /// `destroy_then_create`.
    #[test]
    fn s6_chain_propagates_create_then_destroy() {
        let objs = ResourceInstanceObjects::new();
        objs.put(record("a", ReplaceOrder::Any, &["b"]));
        objs.put(record("b", ReplaceOrder::CreateThenDestroy, &["c"]));
        objs.put(record("c", ReplaceOrder::Any, &[]));
        objs.put(record("unchained", ReplaceOrder::Any, &[]));

        let frozen = objs.close();
        let resolution = resolve(&frozen);

        assert_eq!(
            resolution.orders[&addr_for("a")],
            ResolvedOrder::CreateThenDestroy
        );
        assert_eq!(
            resolution.orders[&addr_for("b")],
            ResolvedOrder::CreateThenDestroy
        );
        assert_eq!(
            resolution.orders[&addr_for("c")],
            ResolvedOrder::CreateThenDestroy
        );
        assert_eq!(
            resolution.orders[&addr_for("unchained")],
            ResolvedOrder::DestroyThenCreate
        );
        assert!(resolution.self_dependencies.is_empty());
    }

    /// A four-node chain `n0 -> n1 -> n2 -> n3` seeded `create_then_destroy`
    /// only at the far end (`n3`) must still propagate all the way back to
    /// `n0`, three hops away — regression test for the single-pass version
    /// of step 2, which only reached `n2`.
    #[test]
    fn chain_propagates_beyond_one_hop() {
        let objs = ResourceInstanceObjects::new();
        objs.put(record("n0", ReplaceOrder::Any, &["n1"]));
        objs.put(record("n1", ReplaceOrder::Any, &["n2"]));
        objs.put(record("n2", ReplaceOrder::Any, &["n3"]));
        objs.put(record("n3", ReplaceOrder::CreateThenDestroy, &[]));

        let frozen = objs.close();
        let resolution = resolve(&frozen);

        for name in ["n0", "n1", "n2", "n3"] {
            assert_eq!(
                resolution.orders[&addr_for(name)],
                ResolvedOrder::CreateThenDestroy,
                "{name} should have inherited create_then_destroy through the whole chain"
            );
        }
    }

    #[test]
    fn self_dependency_is_recorded_and_resolved_destroy_then_create() {
        let objs = ResourceInstanceObjects::new();
        objs.put(record("a", ReplaceOrder::Any, &["a"]));

        let frozen = objs.close();
        let resolution = resolve(&frozen);

        assert!(resolution.self_dependencies.contains(&addr_for("a")));
        assert_eq!(
            resolution.orders[&addr_for("a")],
            ResolvedOrder::DestroyThenCreate
        );
    }

    #[test]
    fn resolution_is_idempotent() {
        let objs = ResourceInstanceObjects::new();
        objs.put(record("a", ReplaceOrder::CreateThenDestroy, &[]));
        objs.put(record("b", ReplaceOrder::Any, &["a"]));

        let frozen = objs.close();
        let first = resolve(&frozen);
        let second = resolve(&frozen);

        assert_eq!(first.orders, second.orders);
    }

    #[test]
    #[should_panic(expected = "already-resolved replace order")]
    fn rejects_already_resolved_input() {
        let objs = ResourceInstanceObjects::new();
        objs.put(record("a", ReplaceOrder::DestroyThenCreate, &[]));
        let frozen = objs.close();
        resolve(&frozen);
    }

    use proptest::prelude::*;

    /// A random DAG of up to 20 nodes, encoded as one bitmask + one order flag
    /// per node: node `i` depends on node `j < i` iff bit `j` of `dep_masks[i]`
    /// is set. Masking to `j < i` when the graph is built guarantees the
    /// adjacency can never contain a cycle, regardless of which bits are set.
    fn random_dag() -> impl Strategy<Value = (Vec<bool>, Vec<u32>)> {
        (1usize..20).prop_flat_map(|n| (prop::collection::vec(any::<bool>(), n), prop::collection::vec(any::<u32>(), n)))
    }

    fn build(is_ctd: &[bool], dep_masks: &[u32]) -> (ResourceInstanceObjects, Vec<Vec<usize>>) {
        let objs = ResourceInstanceObjects::new();
        let n = is_ctd.len();
        let names: Vec<String> = (0..n).map(|i| format!("n{i}")).collect();
        let mut deps_by_node = Vec::with_capacity(n);
        for i in 0..n {
            let deps: Vec<usize> = (0..i).filter(|j| dep_masks[i] & (1 << j) != 0).collect();
            let dep_names: Vec<&str> = deps.iter().map(|d| names[*d].as_str()).collect();
            let order = if is_ctd[i] { ReplaceOrder::CreateThenDestroy } else { ReplaceOrder::Any };
            objs.put(record(&names[i], order, &dep_names));
            deps_by_node.push(deps);
        }
        (objs, deps_by_node)
    }

    proptest! {
        /// Resolution is a pure function of the frozen graph: calling it twice
        /// over the same snapshot always produces the same assignment.
        #[test]
        fn resolution_is_idempotent_over_random_dags((is_ctd, dep_masks) in random_dag()) {
            let (objs, _) = build(&is_ctd, &dep_masks);
            let frozen = objs.close();
            let first = resolve(&frozen);
            let second = resolve(&frozen);
            prop_assert_eq!(first.orders, second.orders);
        }

        /// Every node in a connected component (by forward+reverse dependency
        /// edges) that contains at least one `create_then_destroy` seed
        /// resolves to `create_then_destroy` — the whole chain, not just the
        /// seed's immediate neighbors. This exercises the fixpoint flood-fill
        /// step 2 performs, over randomly generated DAGs up to ~20 nodes.
        #[test]
        fn chain_propagation_is_consistent_across_whole_components((is_ctd, dep_masks) in random_dag()) {
            let (objs, deps_by_node) = build(&is_ctd, &dep_masks);
            let frozen = objs.close();
            let resolution = resolve(&frozen);
            let n = is_ctd.len();
            let names: Vec<String> = (0..n).map(|i| format!("n{i}")).collect();

            // Undirected adjacency from the forward edges recorded while
            // building, used to find each node's whole connected component.
            let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
            for (i, deps) in deps_by_node.iter().enumerate() {
                for &d in deps {
                    adj[i].push(d);
                    adj[d].push(i);
                }
            }

            let mut component_of = vec![usize::MAX; n];
            let mut components: Vec<Vec<usize>> = Vec::new();
            for start in 0..n {
                if component_of[start] != usize::MAX {
                    continue;
                }
                let id = components.len();
                let mut members = Vec::new();
                let mut queue = std::collections::VecDeque::new();
                queue.push_back(start);
                component_of[start] = id;
                while let Some(node) = queue.pop_front() {
                    members.push(node);
                    for &next in &adj[node] {
                        if component_of[next] == usize::MAX {
                            component_of[next] = id;
                            queue.push_back(next);
                        }
                    }
                }
                components.push(members);
            }

            for members in &components {
                let has_self_dependency = members
                    .iter()
                    .any(|&i| resolution.self_dependencies.contains(&addr_for(&names[i])));
                if has_self_dependency {
                    continue;
                }
                let has_ctd_seed = members.iter().any(|&i| is_ctd[i]);
                if !has_ctd_seed {
                    continue;
                }
                for &i in members {
                    let addr = addr_for(&names[i]);
                    prop_assert_eq!(resolution.orders[&addr], ResolvedOrder::CreateThenDestroy);
                }
            }
        }
    }
}
