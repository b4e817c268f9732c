//! Execution-graph primitive layer.
//!
//! A flat, append-only node table behind typed handles: every factory method
//! returns a small `Ref<T>` carrying the phantom result type of the
//! operation it names, so callers can't accidentally wire a `Value` output
//! into a slot expecting a `ResourceInstanceObject`. The table itself is
//! untyped — `Ref<T>` is just an index plus a marker, the same shape as the
//! `NodeId` arena handle this layer is grounded on — so storage stays a
//! single `Vec` behind one mutex (§5: pure graph-builder operations don't
//! suspend, so the whole critical section is index arithmetic and a push).

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use parking_lot::Mutex;
use petgraph::graph::DiGraph;

use crate::addr::{DeposedKey, ProviderInstanceAddr, ResourceInstanceObjectAddr};
use crate::error::{Error, Result};
use crate::value::Value;

/// Marker type for a node producing a [`Value`].
#[derive(Debug)]
pub struct ValueOut;
/// Marker type for a node producing a resource-instance object (prior,
/// desired, or the result of an apply/depose/change-addr operation).
#[derive(Debug)]
pub struct ObjectOut;
/// Marker type for a node producing an opened provider client.
#[derive(Debug)]
pub struct ProviderClientOut;
/// Marker type for a node producing an opened ephemeral handle.
#[derive(Debug)]
pub struct EphemeralOut;
/// Marker type for a node with no useful value — a `Waiter`, a provider or
/// ephemeral close, or any other ordering-only operation.
#[derive(Debug)]
pub struct NothingOut;
/// Marker type for a constant resource-instance-object address leaf.
#[derive(Debug)]
pub struct InstanceAddrOut;
/// Marker type for a constant deposed-key leaf.
#[derive(Debug)]
pub struct DeposedKeyOut;
/// Marker type for a constant provider-instance address leaf.
#[derive(Debug)]
pub struct ProviderAddrOut;

/// A typed handle into the node table: the phantom `T` is the kind of result
/// the referenced node produces. Cheap to copy, comparable, and the only way
/// to obtain one is through a factory method on [`PrimitiveGraph`], so the
/// phantom type always matches the node it was minted from.
pub struct Ref<T> {
    idx: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Ref<T> {
    fn new(idx: usize) -> Self {
        Self {
            idx,
            _marker: PhantomData,
        }
    }

    /// Erases the phantom type, for storage in a heterogeneous waiter list.
    #[must_use]
    pub fn erase(self) -> RawRef {
        RawRef(self.idx)
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Ref<T> {}
impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.idx == other.idx
    }
}
impl<T> Eq for Ref<T> {}
impl<T> std::hash::Hash for Ref<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.idx.hash(state);
    }
}
impl<T> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r[{}]", self.idx)
    }
}
impl<T> serde::Serialize for Ref<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.idx.serialize(serializer)
    }
}
impl<'de, T> serde::Deserialize<'de> for Ref<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(Self::new(usize::deserialize(deserializer)?))
    }
}

/// A type-erased reference, used only where a node's inputs are genuinely
/// heterogeneous (a waiter's wait-set may mix apply, close, and desired refs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RawRef(usize);

impl<T> From<Ref<T>> for RawRef {
    fn from(r: Ref<T>) -> Self {
        r.erase()
    }
}

/// One operation in the execution graph. Field shapes mirror the factory
/// signatures in §4.F exactly.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum NodeKind {
    ConstantValue(Value),
    ConstantInstanceAddr(ResourceInstanceObjectAddr),
    ConstantDeposedKey(DeposedKey),
    ConstantProviderAddr(ProviderInstanceAddr),
    ResourceInstancePrior {
        addr: ResourceInstanceObjectAddr,
    },
    ResourceInstanceDesired {
        addr: ResourceInstanceObjectAddr,
        waiter: Option<Ref<NothingOut>>,
    },
    ManagedFinalPlan {
        desired: Option<Ref<ObjectOut>>,
        prior: Option<Ref<ObjectOut>>,
        planned_value: Ref<ValueOut>,
        provider_client: Option<Ref<ProviderClientOut>>,
    },
    ManagedApply {
        final_plan: Ref<ObjectOut>,
        fallback: Option<Ref<ObjectOut>>,
        provider_client: Option<Ref<ProviderClientOut>>,
        waiter: Option<Ref<NothingOut>>,
    },
    ManagedChangeAddr {
        prior: Ref<ObjectOut>,
        new_addr: ResourceInstanceObjectAddr,
    },
    ManagedDepose {
        prior: Ref<ObjectOut>,
        waiter: Option<Ref<NothingOut>>,
    },
    ManagedAlreadyDeposed {
        addr: ResourceInstanceObjectAddr,
        deposed_key: DeposedKey,
    },
    ProviderInstanceConfig {
        addr: ProviderInstanceAddr,
        waiter: Option<Ref<NothingOut>>,
    },
    ProviderInstanceOpen {
        config: Ref<ValueOut>,
    },
    ProviderInstanceClose {
        client: Ref<ProviderClientOut>,
        waiter: Option<Ref<NothingOut>>,
    },
    EphemeralOpen {
        desired: Ref<ValueOut>,
        client: Ref<ProviderClientOut>,
    },
    EphemeralState {
        open: Ref<EphemeralOut>,
    },
    EphemeralClose {
        open: Ref<EphemeralOut>,
        waiter: Option<Ref<NothingOut>>,
    },
    /// Ordering-only node: completes once every ref in its wait-set
    /// completes. A mutable waiter is a `Waiter` whose list keeps growing via
    /// [`PrimitiveGraph::register`] until the graph is frozen.
    Waiter(Vec<RawRef>),
}

impl NodeKind {
    fn inputs(&self) -> Vec<usize> {
        match self {
            Self::ConstantValue(_)
            | Self::ConstantInstanceAddr(_)
            | Self::ConstantDeposedKey(_)
            | Self::ConstantProviderAddr(_)
            | Self::ResourceInstancePrior { .. }
            | Self::ManagedAlreadyDeposed { .. } => Vec::new(),
            Self::ResourceInstanceDesired { waiter, .. } => opt(waiter),
            Self::ManagedFinalPlan {
                desired,
                prior,
                planned_value,
                provider_client,
            } => chain([opt(desired), opt(prior), vec![planned_value.idx], opt(provider_client)]),
            Self::ManagedApply {
                final_plan,
                fallback,
                provider_client,
                waiter,
            } => chain([vec![final_plan.idx], opt(fallback), opt(provider_client), opt(waiter)]),
            Self::ManagedChangeAddr { prior, .. } => vec![prior.idx],
            Self::ManagedDepose { prior, waiter } => chain([vec![prior.idx], opt(waiter)]),
            Self::ProviderInstanceConfig { waiter, .. } => opt(waiter),
            Self::ProviderInstanceOpen { config } => vec![config.idx],
            Self::ProviderInstanceClose { client, waiter } => chain([vec![client.idx], opt(waiter)]),
            Self::EphemeralOpen { desired, client } => vec![desired.idx, client.idx],
            Self::EphemeralState { open } => vec![open.idx],
            Self::EphemeralClose { open, waiter } => chain([vec![open.idx], opt(waiter)]),
            Self::Waiter(refs) => refs.iter().map(|r| r.0).collect(),
        }
    }

    /// The address most directly associated with this node, if any — used
    /// both for diagnostics and to let downstream nodes inherit an address
    /// for cycle-diagnostic purposes without storing it redundantly.
    fn own_address(&self) -> Option<&ResourceInstanceObjectAddr> {
        match self {
            Self::ConstantInstanceAddr(addr)
            | Self::ResourceInstancePrior { addr }
            | Self::ResourceInstanceDesired { addr, .. }
            | Self::ManagedChangeAddr { new_addr: addr, .. }
            | Self::ManagedAlreadyDeposed { addr, .. } => Some(addr),
            _ => None,
        }
    }

    /// The node index this node's own `waiter: Option<Ref<NothingOut>>` field
    /// points at, if it has one. Used by `debug_repr` to tell a `Waiter` node
    /// that's only ever reached through one such field — and so only ever
    /// renders inline, never as a free-standing reference — from one that's
    /// also a member of another wait-set and therefore needs a visible name.
    fn waiter_field(&self) -> Option<usize> {
        match self {
            Self::ResourceInstanceDesired { waiter, .. }
            | Self::ManagedApply { waiter, .. }
            | Self::ManagedDepose { waiter, .. }
            | Self::ProviderInstanceConfig { waiter, .. }
            | Self::ProviderInstanceClose { waiter, .. }
            | Self::EphemeralClose { waiter, .. } => waiter.map(|w| w.idx),
            _ => None,
        }
    }
}

fn opt<T>(r: &Option<Ref<T>>) -> Vec<usize> {
    r.map(|r| vec![r.idx]).unwrap_or_default()
}

fn chain<const N: usize>(parts: [Vec<usize>; N]) -> Vec<usize> {
    parts.into_iter().flatten().collect()
}

struct BuilderState {
    nodes: Vec<NodeKind>,
    node_address: Vec<Option<ResourceInstanceObjectAddr>>,
    bindings: HashMap<ResourceInstanceObjectAddr, Ref<ObjectOut>>,
}

/// The builder-phase handle to the execution graph's primitive layer.
pub struct PrimitiveGraph {
    state: Mutex<BuilderState>,
}

impl PrimitiveGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BuilderState {
                nodes: Vec::new(),
                node_address: Vec::new(),
                bindings: HashMap::new(),
            }),
        }
    }

    fn push(&self, node: NodeKind) -> usize {
        let mut state = self.state.lock();
        let inherited = node.own_address().cloned().or_else(|| {
            node.inputs()
                .iter()
                .find_map(|&i| state.node_address.get(i).and_then(Clone::clone))
        });
        state.nodes.push(node);
        state.node_address.push(inherited);
        state.nodes.len() - 1
    }

    pub fn constant_value(&self, v: Value) -> Ref<ValueOut> {
        Ref::new(self.push(NodeKind::ConstantValue(v)))
    }

    pub fn constant_instance_addr(&self, a: ResourceInstanceObjectAddr) -> Ref<InstanceAddrOut> {
        Ref::new(self.push(NodeKind::ConstantInstanceAddr(a)))
    }

    pub fn constant_deposed_key(&self, k: DeposedKey) -> Ref<DeposedKeyOut> {
        Ref::new(self.push(NodeKind::ConstantDeposedKey(k)))
    }

    pub fn constant_provider_addr(&self, p: ProviderInstanceAddr) -> Ref<ProviderAddrOut> {
        Ref::new(self.push(NodeKind::ConstantProviderAddr(p)))
    }

    pub fn read_resource_instance_prior(&self, addr: ResourceInstanceObjectAddr) -> Ref<ObjectOut> {
        Ref::new(self.push(NodeKind::ResourceInstancePrior { addr }))
    }

    pub fn resource_instance_desired(
        &self,
        addr: ResourceInstanceObjectAddr,
        waiter: Option<Ref<NothingOut>>,
    ) -> Ref<ObjectOut> {
        Ref::new(self.push(NodeKind::ResourceInstanceDesired { addr, waiter }))
    }

    pub fn managed_final_plan(
        &self,
        desired: Option<Ref<ObjectOut>>,
        prior: Option<Ref<ObjectOut>>,
        planned_value: Ref<ValueOut>,
        provider_client: Option<Ref<ProviderClientOut>>,
    ) -> Ref<ObjectOut> {
        Ref::new(self.push(NodeKind::ManagedFinalPlan {
            desired,
            prior,
            planned_value,
            provider_client,
        }))
    }

    pub fn managed_apply(
        &self,
        final_plan: Ref<ObjectOut>,
        fallback: Option<Ref<ObjectOut>>,
        provider_client: Option<Ref<ProviderClientOut>>,
        waiter: Option<Ref<NothingOut>>,
    ) -> Ref<ObjectOut> {
        Ref::new(self.push(NodeKind::ManagedApply {
            final_plan,
            fallback,
            provider_client,
            waiter,
        }))
    }

    pub fn managed_change_addr(
        &self,
        prior: Ref<ObjectOut>,
        new_addr: ResourceInstanceObjectAddr,
    ) -> Ref<ObjectOut> {
        Ref::new(self.push(NodeKind::ManagedChangeAddr { prior, new_addr }))
    }

    pub fn managed_depose(&self, prior: Ref<ObjectOut>, waiter: Option<Ref<NothingOut>>) -> Ref<ObjectOut> {
        Ref::new(self.push(NodeKind::ManagedDepose { prior, waiter }))
    }

    pub fn managed_already_deposed(
        &self,
        addr: ResourceInstanceObjectAddr,
        deposed_key: DeposedKey,
    ) -> Ref<ObjectOut> {
        Ref::new(self.push(NodeKind::ManagedAlreadyDeposed { addr, deposed_key }))
    }

    pub fn provider_instance_config(
        &self,
        addr: ProviderInstanceAddr,
        waiter: Option<Ref<NothingOut>>,
    ) -> Ref<ValueOut> {
        Ref::new(self.push(NodeKind::ProviderInstanceConfig { addr, waiter }))
    }

    pub fn provider_instance_open(&self, config: Ref<ValueOut>) -> Ref<ProviderClientOut> {
        Ref::new(self.push(NodeKind::ProviderInstanceOpen { config }))
    }

    pub fn provider_instance_close(
        &self,
        client: Ref<ProviderClientOut>,
        waiter: Option<Ref<NothingOut>>,
    ) -> Ref<NothingOut> {
        Ref::new(self.push(NodeKind::ProviderInstanceClose { client, waiter }))
    }

    pub fn ephemeral_open(&self, desired: Ref<ValueOut>, client: Ref<ProviderClientOut>) -> Ref<EphemeralOut> {
        Ref::new(self.push(NodeKind::EphemeralOpen { desired, client }))
    }

    pub fn ephemeral_state(&self, open: Ref<EphemeralOut>) -> Ref<ValueOut> {
        Ref::new(self.push(NodeKind::EphemeralState { open }))
    }

    pub fn ephemeral_close(&self, open: Ref<EphemeralOut>, waiter: Option<Ref<NothingOut>>) -> Ref<NothingOut> {
        Ref::new(self.push(NodeKind::EphemeralClose { open, waiter }))
    }

    /// An ordinary, fixed wait-set waiter.
    pub fn waiter(&self, refs: &[RawRef]) -> Ref<NothingOut> {
        Ref::new(self.push(NodeKind::Waiter(refs.to_vec())))
    }

    /// A waiter whose wait-set can grow after creation via [`Self::register`].
    pub fn mutable_waiter(&self) -> Ref<NothingOut> {
        Ref::new(self.push(NodeKind::Waiter(Vec::new())))
    }

    /// Adds `target` to `waiter`'s wait-set.
    ///
    /// # Panics
    ///
    /// Panics if `waiter` does not refer to a `Waiter` node.
    pub fn register(&self, waiter: Ref<NothingOut>, target: impl Into<RawRef>) {
        let mut state = self.state.lock();
        match &mut state.nodes[waiter.idx] {
            NodeKind::Waiter(refs) => refs.push(target.into()),
            _ => panic!("register called on a non-waiter node"),
        }
    }

    /// Records the final result ref an address resolves to, for the
    /// `addr = r[N];` line in the debug representation and for apply-phase
    /// lookup.
    pub fn bind_address(&self, addr: ResourceInstanceObjectAddr, result: Ref<ObjectOut>) {
        self.state.lock().bindings.insert(addr, result);
    }

    /// Freezes the graph: runs the strongly-connected-components cycle
    /// check (§5, §9) and returns an immutable view, or a [`Error::CyclicDependency`]
    /// naming one address on the offending cycle.
    pub fn finish(&self) -> Result<ExecutionGraph> {
        let state = self.state.lock();
        let nodes = state.nodes.clone();
        let bindings = state.bindings.clone();
        drop(state);

        let mut pg = DiGraph::<(), ()>::new();
        let indices: Vec<_> = (0..nodes.len()).map(|_| pg.add_node(())).collect();
        for (i, node) in nodes.iter().enumerate() {
            for input in node.inputs() {
                pg.add_edge(indices[input], indices[i], ());
            }
        }
        for scc in petgraph::algo::tarjan_scc(&pg) {
            if scc.len() > 1 {
                let example = scc
                    .iter()
                    .find_map(|ix| nodes[ix.index()].own_address().cloned());
                return Err(Error::CyclicDependency { example });
            }
        }

        Ok(ExecutionGraph { nodes, bindings })
    }
}

impl Default for PrimitiveGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// The frozen, immutable execution graph.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExecutionGraph {
    nodes: Vec<NodeKind>,
    #[serde(with = "bindings_as_pairs")]
    bindings: HashMap<ResourceInstanceObjectAddr, Ref<ObjectOut>>,
}

/// `serde_json` only accepts string map keys; addresses aren't strings, so
/// bindings round-trip as a flat list of pairs instead of a JSON object.
mod bindings_as_pairs {
    use std::collections::HashMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{ObjectOut, Ref};
    use crate::addr::ResourceInstanceObjectAddr;

    pub fn serialize<S: Serializer>(
        map: &HashMap<ResourceInstanceObjectAddr, Ref<ObjectOut>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        map.iter().collect::<Vec<_>>().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<ResourceInstanceObjectAddr, Ref<ObjectOut>>, D::Error> {
        let pairs = Vec::<(ResourceInstanceObjectAddr, Ref<ObjectOut>)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

impl ExecutionGraph {
    /// Serializes the graph to the opaque byte blob carried in the plan artifact.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Reloads a graph previously produced by [`Self::marshal`]. No
    /// cross-version compatibility is promised — see §6.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Number of nodes in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the graph has no operation nodes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The final result ref bound to `addr`, if any.
    #[must_use]
    pub fn binding(&self, addr: &ResourceInstanceObjectAddr) -> Option<Ref<ObjectOut>> {
        self.bindings.get(addr).copied()
    }

    /// Renders the graph as a readable list of numbered node definitions,
    /// matching the literal format used by the end-to-end test scenarios:
    /// `v[N]` for constant-value leaves, `r[N]` for every other operation,
    /// followed by one `addr = r[N];` line per bound address in address order.
    #[must_use]
    pub fn debug_repr(&self) -> String {
        let mut out = String::new();
        let mut value_index = HashMap::new();
        let mut result_index = HashMap::new();

        // A `Waiter` node reached only through some other node's `waiter`
        // field always renders inline at that field's use site; giving it
        // its own `r[N]` line too would be a redundant, never-referenced
        // definition. One that's *also* a plain member of another wait-set
        // needs a visible name, since that membership renders as a bare
        // reference. `dedicated_to` counts field-owners per index;
        // `raw_member_of` marks indices reachable only that way.
        let mut dedicated_to: HashMap<usize, usize> = HashMap::new();
        for node in &self.nodes {
            if let Some(target) = node.waiter_field() {
                *dedicated_to.entry(target).or_insert(0) += 1;
            }
        }
        let mut raw_member_of: std::collections::HashSet<usize> = std::collections::HashSet::new();
        for node in &self.nodes {
            if let NodeKind::Waiter(refs) = node {
                for r in refs {
                    raw_member_of.insert(r.0);
                }
            }
        }
        let inline_only = |i: usize, node: &NodeKind| {
            matches!(node, NodeKind::Waiter(_)) && dedicated_to.contains_key(&i) && !raw_member_of.contains(&i)
        };

        for (i, node) in self.nodes.iter().enumerate() {
            if let NodeKind::ConstantValue(v) = node {
                let vi = value_index.len();
                value_index.insert(i, vi);
                out.push_str(&format!("v[{vi}] = {};\n", render_value(v)));
            } else if !inline_only(i, node) {
                result_index.insert(i, result_index.len());
            }
        }

        for (i, node) in self.nodes.iter().enumerate() {
            if matches!(node, NodeKind::ConstantValue(_)) || inline_only(i, node) {
                continue;
            }
            let ri = result_index[&i];
            out.push_str(&format!(
                "r[{ri}] = {};\n",
                render_node(node, &self.nodes, &value_index, &result_index)
            ));
        }

        let mut bound: Vec<_> = self.bindings.iter().collect();
        bound.sort_by(|a, b| a.0.cmp(b.0));
        for (addr, r) in bound {
            out.push_str(&format!("{addr} = r[{}];\n", result_index[&r.idx]));
        }

        out
    }
}

fn render_value(v: &Value) -> String {
    if v.deferred {
        return "(deferred)".to_string();
    }
    match &v.data {
        serde_json::Value::Null => "nil".to_string(),
        serde_json::Value::String(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}

fn ref_name(idx: usize, value_index: &HashMap<usize, usize>, result_index: &HashMap<usize, usize>) -> String {
    if let Some(vi) = value_index.get(&idx) {
        format!("v[{vi}]")
    } else {
        format!("r[{}]", result_index[&idx])
    }
}

fn opt_ref_name(
    idx: Option<usize>,
    value_index: &HashMap<usize, usize>,
    result_index: &HashMap<usize, usize>,
) -> String {
    idx.map_or_else(|| "nil".to_string(), |i| ref_name(i, value_index, result_index))
}

fn waiter_name(refs: &[RawRef], value_index: &HashMap<usize, usize>, result_index: &HashMap<usize, usize>) -> String {
    let items: Vec<_> = refs
        .iter()
        .map(|r| ref_name(r.0, value_index, result_index))
        .collect();
    format!("await({})", items.join(", "))
}

/// A `waiter: Option<Ref<NothingOut>>` field names a `Waiter` node elsewhere
/// in the table; what renders inline is that node's own wait-set, not the
/// reference to it — so this needs the full node list, not just the two
/// index maps passed to the rest of `render_node`.
fn render_waiter_field(
    waiter: Option<Ref<NothingOut>>,
    nodes: &[NodeKind],
    value_index: &HashMap<usize, usize>,
    result_index: &HashMap<usize, usize>,
) -> String {
    match waiter {
        None => "await()".to_string(),
        Some(w) => match &nodes[w.idx] {
            NodeKind::Waiter(refs) => waiter_name(refs, value_index, result_index),
            _ => unreachable!("waiter field must reference a Waiter node"),
        },
    }
}

fn render_node(
    node: &NodeKind,
    nodes: &[NodeKind],
    value_index: &HashMap<usize, usize>,
    result_index: &HashMap<usize, usize>,
) -> String {
    let rn = |i: usize| ref_name(i, value_index, result_index);
    let orn = |i: Option<usize>| opt_ref_name(i, value_index, result_index);
    let wf = |w: Option<Ref<NothingOut>>| render_waiter_field(w, nodes, value_index, result_index);
    match node {
        NodeKind::ConstantValue(_) => unreachable!("constants are rendered separately"),
        NodeKind::ConstantInstanceAddr(a) => format!("ConstantInstanceAddr({a})"),
        NodeKind::ConstantDeposedKey(k) => format!("ConstantDeposedKey({k})"),
        NodeKind::ConstantProviderAddr(p) => format!("ConstantProviderAddr({p})"),
        NodeKind::ResourceInstancePrior { addr } => format!("ResourceInstancePrior({addr})"),
        NodeKind::ResourceInstanceDesired { addr, waiter } => {
            format!("ResourceInstanceDesired({addr}, {})", wf(*waiter))
        }
        NodeKind::ManagedFinalPlan {
            desired,
            prior,
            planned_value,
            provider_client,
        } => format!(
            "ManagedFinalPlan({}, {}, {}, {})",
            orn(desired.map(|r| r.idx)),
            orn(prior.map(|r| r.idx)),
            rn(planned_value.idx),
            orn(provider_client.map(|r| r.idx)),
        ),
        NodeKind::ManagedApply {
            final_plan,
            fallback,
            provider_client,
            waiter,
        } => format!(
            "ManagedApply({}, {}, {}, {})",
            rn(final_plan.idx),
            orn(fallback.map(|r| r.idx)),
            orn(provider_client.map(|r| r.idx)),
            wf(*waiter),
        ),
        NodeKind::ManagedChangeAddr { prior, new_addr } => {
            format!("ManagedChangeAddr({}, {new_addr})", rn(prior.idx))
        }
        NodeKind::ManagedDepose { prior, waiter } => {
            format!("ManagedDepose({}, {})", rn(prior.idx), wf(*waiter))
        }
        NodeKind::ManagedAlreadyDeposed { addr, deposed_key } => {
            format!("ManagedAlreadyDeposed({addr}, {deposed_key})")
        }
        NodeKind::ProviderInstanceConfig { addr, waiter } => {
            format!("ProviderInstanceConfig({addr}, {})", wf(*waiter))
        }
        NodeKind::ProviderInstanceOpen { config } => format!("ProviderInstanceOpen({})", rn(config.idx)),
        NodeKind::ProviderInstanceClose { client, waiter } => {
            format!("ProviderInstanceClose({}, {})", rn(client.idx), wf(*waiter))
        }
        NodeKind::EphemeralOpen { desired, client } => {
            format!("EphemeralOpen({}, {})", rn(desired.idx), rn(client.idx))
        }
        NodeKind::EphemeralState { open } => format!("EphemeralState({})", rn(open.idx)),
        NodeKind::EphemeralClose { open, waiter } => {
            format!("EphemeralClose({}, {})", rn(open.idx), wf(*waiter))
        }
        NodeKind::Waiter(refs) => waiter_name(refs, value_index, result_index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::ResourceInstanceAddr;

    fn addr(name: &str) -> ResourceInstanceObjectAddr {
        ResourceInstanceObjectAddr::current(ResourceInstanceAddr::managed("test", name))
    }

    #[test]
    fn finish_detects_cycles() {
        let g = PrimitiveGraph::new();
        let w = g.mutable_waiter();
        let desired = g.resource_instance_desired(addr("placeholder"), Some(w));
        // Manufacture a cycle: make the waiter depend on the node that
        // depends on the waiter.
        g.register(w, desired.erase());

        let err = g.finish().unwrap_err();
        assert!(matches!(err, Error::CyclicDependency { .. }));
    }

    #[test]
    fn empty_graph_has_no_nodes() {
        let g = PrimitiveGraph::new();
        let graph = g.finish().unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn marshal_round_trips_byte_identically() {
        let g = PrimitiveGraph::new();
        let v = g.constant_value(Value::known(serde_json::json!("after")));
        let desired = g.resource_instance_desired(addr("placeholder"), None);
        let plan = g.managed_final_plan(Some(desired), None, v, None);
        let applied = g.managed_apply(plan, None, None, None);
        g.bind_address(addr("placeholder"), applied);

        let graph = g.finish().unwrap();
        let first = graph.marshal().unwrap();
        let second = ExecutionGraph::unmarshal(&first).unwrap().marshal().unwrap();
        assert_eq!(first, second);
    }
}
