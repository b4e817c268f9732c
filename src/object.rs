//! The resource-instance-object intermediate graph.
//!
//! A concurrency-safe collection of per-object records, built concurrently
//! as each evaluator callback returns and frozen on [`ResourceInstanceObjects::close`].
//! Forward and reverse dependency indexes are kept consistent under a single
//! mutex, matching §5: pure graph-builder operations don't suspend and hold
//! the lock only for the small critical section that mutates the maps.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::addr::{ProviderInstanceAddr, ResourceInstanceObjectAddr, Set};
use crate::error::{Error, Result};
use crate::value::Value;

/// The action planned for a resource-instance object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Action {
    /// No prior object; a new one will be created.
    Create,
    /// The object will be read (deferred data-source read).
    Read,
    /// Both before and after are known and differ.
    Update,
    /// The object will be removed from infrastructure.
    Delete,
    /// The object will be removed from state only, without touching infrastructure.
    Forget,
    /// Replace: create the new object, then destroy the old one.
    CreateThenDelete,
    /// Replace: destroy the old object, then create the new one.
    DeleteThenCreate,
    /// Replace via forget: forget the old object, then create the new one.
    ForgetThenCreate,
    /// Before and after are identical; no operation needed at apply time.
    NoOp,
}

impl Action {
    /// True if this action destroys (or forgets) an existing object as part
    /// of its work, and therefore has a "destroy leg" in the execution graph.
    #[must_use]
    pub fn has_destroy_leg(self) -> bool {
        matches!(
            self,
            Self::Delete | Self::Forget | Self::CreateThenDelete | Self::DeleteThenCreate | Self::ForgetThenCreate
        )
    }

    /// True if this action creates a new object as part of its work.
    #[must_use]
    pub fn has_create_leg(self) -> bool {
        matches!(
            self,
            Self::Create | Self::Update | Self::CreateThenDelete | Self::DeleteThenCreate | Self::ForgetThenCreate
        )
    }
}

/// The planned change for one resource-instance object, present once the
/// planner has decided on an action (as opposed to only producing a
/// placeholder value).
#[derive(Debug, Clone)]
pub struct PlannedChange {
    /// The address this object had before planning (differs from the record's
    /// address only when a "moved" rebinding is in effect).
    pub previous_address: ResourceInstanceObjectAddr,
    /// The address this object will have after apply.
    pub new_address: ResourceInstanceObjectAddr,
    /// The action to take.
    pub action: Action,
    /// State before the change. Null iff `action == Create`.
    pub before_value: Value,
    /// State after the change. Null iff `action` is `Delete` or `Forget`.
    pub after_value: Value,
    /// Attribute paths that forced a replace, if any.
    pub required_replace_paths: Vec<Vec<String>>,
    /// Opaque provider-private data to round-trip to apply.
    pub private_blob: Vec<u8>,
}

impl PlannedChange {
    /// Validates the action-vs-value invariants from §3.
    fn check_invariants(&self) -> Result<()> {
        match self.action {
            Action::Create => {
                if !self.before_value.is_null() {
                    return Err(Error::InvalidDeposedAction {
                        address: self.new_address.clone(),
                    });
                }
            }
            Action::Delete | Action::Forget => {
                if !self.after_value.is_null() {
                    return Err(Error::InvalidDeposedAction {
                        address: self.new_address.clone(),
                    });
                }
            }
            // A deferred data-source read carries no committed before/after
            // value yet — both legitimately stay at the unknown placeholder
            // until apply actually performs the read.
            Action::NoOp | Action::Read => {}
            _ => {
                if self.before_value.is_null() || self.after_value.is_null() {
                    return Err(Error::InvalidDeposedAction {
                        address: self.new_address.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Replace order, as carried on a resource-instance-object record before
/// resolution (§3: callers may only return `Any` or `CreateThenDestroy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReplaceOrder {
    /// No preference; resolved to match a neighbor, or to `DestroyThenCreate`.
    Any,
    /// Create the replacement before destroying the old object.
    CreateThenDestroy,
    /// Destroy the old object before creating the replacement. Only ever
    /// produced by [`crate::replace_order::resolve`]; an initial record may
    /// not carry this value.
    DestroyThenCreate,
}

/// One record in the intermediate graph.
#[derive(Debug, Clone)]
pub struct ResourceInstanceObject {
    /// This object's address. If a "moved" rebinding is in effect, this is
    /// the *final* address, not the address under which it was evaluated.
    pub address: ResourceInstanceObjectAddr,
    /// The planned change, if one was produced.
    pub planned_change: Option<PlannedChange>,
    /// A conservative, possibly partially-unknown value for expression
    /// type-checking. Required when `planned_change` is absent.
    pub placeholder_value: Option<Value>,
    /// The provider instance whose schema governs this object.
    pub provider: ProviderInstanceAddr,
    /// Initial replace-order hint; `Any` or `CreateThenDestroy` only.
    pub replace_order: ReplaceOrder,
    /// Forward dependencies: addresses this object's configuration (or
    /// recorded state, for orphans/deposed) depends on.
    pub dependencies: Set<ResourceInstanceObjectAddr>,
}

impl ResourceInstanceObject {
    fn validate(&self) -> Result<()> {
        if self.planned_change.is_none() && self.placeholder_value.is_none() {
            return Err(Error::InvalidDeposedAction {
                address: self.address.clone(),
            });
        }
        if let Some(change) = &self.planned_change {
            change.check_invariants()?;
        }
        if self.address.deposed.is_deposed() {
            let ok = self
                .planned_change
                .as_ref()
                .is_some_or(|c| matches!(c.action, Action::Delete));
            if !ok {
                return Err(Error::InvalidDeposedAction {
                    address: self.address.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Indexes {
    records: HashMap<ResourceInstanceObjectAddr, ResourceInstanceObject>,
    // forward: addr -> what addr depends on
    forward: HashMap<ResourceInstanceObjectAddr, Set<ResourceInstanceObjectAddr>>,
    // reverse: addr -> what depends on addr
    reverse: HashMap<ResourceInstanceObjectAddr, Set<ResourceInstanceObjectAddr>>,
}

/// The builder-phase handle to the intermediate graph: concurrent `put`
/// calls from the driver glue as each evaluation callback returns.
pub struct ResourceInstanceObjects {
    inner: Mutex<Indexes>,
}

impl ResourceInstanceObjects {
    /// Creates an empty, open collection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Indexes::default()),
        }
    }

    /// Inserts `record`, updating forward and reverse indexes atomically.
    ///
    /// # Panics
    ///
    /// Panics if a record already exists at `record.address` — a second
    /// `put` for the same address is a contract violation (§3), not a
    /// recoverable error, since it means the evaluator invoked planning
    /// twice for the same object.
    pub fn put(&self, record: ResourceInstanceObject) {
        record
            .validate()
            .expect("resource-instance-object record violates §3 invariants");

        let mut idx = self.inner.lock();
        assert!(
            !idx.records.contains_key(&record.address),
            "{}",
            Error::DuplicatePut {
                address: record.address.clone(),
            }
        );

        let addr = record.address.clone();
        let deps = record.dependencies.clone();

        for dep in &deps {
            idx.reverse.entry(dep.clone()).or_default().insert(addr.clone());
        }
        idx.forward.insert(addr.clone(), deps);
        idx.records.insert(addr, record);
    }

    /// Looks up the record at `addr`.
    #[must_use]
    pub fn get(&self, addr: &ResourceInstanceObjectAddr) -> Option<ResourceInstanceObject> {
        self.inner.lock().records.get(addr).cloned()
    }

    /// Returns every record, in address order.
    #[must_use]
    pub fn all(&self) -> Vec<ResourceInstanceObject> {
        let idx = self.inner.lock();
        let mut records: Vec<_> = idx.records.values().cloned().collect();
        records.sort_by(|a, b| a.address.cmp(&b.address));
        records
    }

    /// Forward dependencies of `addr`: what its configuration depends on.
    #[must_use]
    pub fn dependencies(&self, addr: &ResourceInstanceObjectAddr) -> Set<ResourceInstanceObjectAddr> {
        self.inner.lock().forward.get(addr).cloned().unwrap_or_default()
    }

    /// Reverse dependencies of `addr`: what depends on it.
    #[must_use]
    pub fn dependents(&self, addr: &ResourceInstanceObjectAddr) -> Set<ResourceInstanceObjectAddr> {
        self.inner.lock().reverse.get(addr).cloned().unwrap_or_default()
    }

    /// The union of forward and reverse neighbors of `addr`.
    #[must_use]
    pub fn dependencies_and_dependents(
        &self,
        addr: &ResourceInstanceObjectAddr,
    ) -> Set<ResourceInstanceObjectAddr> {
        self.dependencies(addr).union(&self.dependents(addr))
    }

    /// Number of records currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// True if no records have been put yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// Freezes the collection into an immutable view. After this call no
    /// further `put`s are accepted by the frozen view (there is no API to
    /// mutate it); the builder itself may still be dropped.
    #[must_use]
    pub fn close(&self) -> FrozenResourceInstanceObjects {
        let idx = self.inner.lock();
        FrozenResourceInstanceObjects {
            records: idx.records.clone(),
            forward: idx.forward.clone(),
            reverse: idx.reverse.clone(),
        }
    }
}

impl Default for ResourceInstanceObjects {
    fn default() -> Self {
        Self::new()
    }
}

/// The immutable view of the intermediate graph after [`ResourceInstanceObjects::close`].
#[derive(Debug, Clone, Default)]
pub struct FrozenResourceInstanceObjects {
    records: HashMap<ResourceInstanceObjectAddr, ResourceInstanceObject>,
    forward: HashMap<ResourceInstanceObjectAddr, Set<ResourceInstanceObjectAddr>>,
    reverse: HashMap<ResourceInstanceObjectAddr, Set<ResourceInstanceObjectAddr>>,
}

impl FrozenResourceInstanceObjects {
    /// Looks up the record at `addr`.
    #[must_use]
    pub fn get(&self, addr: &ResourceInstanceObjectAddr) -> Option<&ResourceInstanceObject> {
        self.records.get(addr)
    }

    /// Returns every record, in address order.
    #[must_use]
    pub fn all(&self) -> Vec<&ResourceInstanceObject> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by(|a, b| a.address.cmp(&b.address));
        records
    }

    /// Forward dependencies of `addr`.
    #[must_use]
    pub fn dependencies(&self, addr: &ResourceInstanceObjectAddr) -> Set<ResourceInstanceObjectAddr> {
        self.forward.get(addr).cloned().unwrap_or_default()
    }

    /// Reverse dependencies of `addr`.
    #[must_use]
    pub fn dependents(&self, addr: &ResourceInstanceObjectAddr) -> Set<ResourceInstanceObjectAddr> {
        self.reverse.get(addr).cloned().unwrap_or_default()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::ResourceInstanceAddr;

    fn provider() -> ProviderInstanceAddr {
        ProviderInstanceAddr {
            module: crate::addr::ModuleInstanceAddr::root(),
            provider: "test".into(),
            alias: None,
        }
    }

    fn noop_record(name: &str) -> ResourceInstanceObject {
        let addr = ResourceInstanceObjectAddr::current(ResourceInstanceAddr::managed("test_thing", name));
        ResourceInstanceObject {
            address: addr,
            planned_change: None,
            placeholder_value: Some(Value::null()),
            provider: provider(),
            replace_order: ReplaceOrder::Any,
            dependencies: Set::new(),
        }
    }

    #[test]
    #[should_panic(expected = "duplicate resource-instance-object record")]
    fn put_panics_on_duplicate_address() {
        let objs = ResourceInstanceObjects::new();
        objs.put(noop_record("a"));
        objs.put(noop_record("a"));
    }

    #[test]
    fn forward_and_reverse_indexes_stay_consistent() {
        let objs = ResourceInstanceObjects::new();
        let a = noop_record("a");
        let mut b = noop_record("b");
        b.dependencies.insert(a.address.clone());

        objs.put(a.clone());
        objs.put(b.clone());

        assert!(objs.dependencies(&b.address).contains(&a.address));
        assert!(objs.dependents(&a.address).contains(&b.address));
        assert!(objs.dependencies(&a.address).is_empty());
    }

    #[test]
    fn close_freezes_a_consistent_snapshot() {
        let objs = ResourceInstanceObjects::new();
        objs.put(noop_record("a"));
        let frozen = objs.close();
        assert_eq!(frozen.len(), 1);
    }

    #[test]
    #[should_panic]
    fn record_with_no_planned_change_and_no_placeholder_is_invalid() {
        let mut record = noop_record("a");
        record.placeholder_value = None;
        let objs = ResourceInstanceObjects::new();
        objs.put(record);
    }

    use proptest::prelude::*;

    /// Random dependency masks over up to 20 addresses, encoded the same way
    /// as in `replace_order`'s property tests: address `i` depends on `j < i`
    /// iff bit `j` of `dep_masks[i]` is set. `put` itself doesn't require a
    /// dependency's record to exist yet, so every address's `put` is safe to
    /// run concurrently regardless of which other addresses it names.
    fn random_dep_masks() -> impl Strategy<Value = Vec<u32>> {
        (1usize..20).prop_flat_map(|n| prop::collection::vec(any::<u32>(), n))
    }

    proptest! {
        /// After any number of `put` calls issued concurrently from several
        /// threads, the reverse index matches the forward index exactly: `b`
        /// is a dependent of `a` iff `a` is a dependency of `b`.
        #[test]
        fn reverse_index_matches_forward_index_under_concurrent_put(dep_masks in random_dep_masks()) {
            let n = dep_masks.len();
            let names: Vec<String> = (0..n).map(|i| format!("c{i}")).collect();
            let objs = ResourceInstanceObjects::new();

            std::thread::scope(|scope| {
                for i in 0..n {
                    let deps: Vec<usize> = (0..i).filter(|j| dep_masks[i] & (1 << j) != 0).collect();
                    let dep_names: Vec<String> = deps.iter().map(|d| names[*d].clone()).collect();
                    let name = names[i].clone();
                    let objs = &objs;
                    scope.spawn(move || {
                        let dep_refs: Vec<&str> = dep_names.iter().map(String::as_str).collect();
                        objs.put(noop_record_with_deps(&name, &dep_refs));
                    });
                }
            });

            let frozen = objs.close();
            prop_assert_eq!(frozen.len(), n);
            for i in 0..n {
                let addr_i = ResourceInstanceObjectAddr::current(ResourceInstanceAddr::managed("test_thing", names[i].as_str()));
                for j in 0..n {
                    if i == j {
                        continue;
                    }
                    let addr_j = ResourceInstanceObjectAddr::current(ResourceInstanceAddr::managed("test_thing", names[j].as_str()));
                    let i_depends_on_j = frozen.dependencies(&addr_i).contains(&addr_j);
                    let j_has_i_as_dependent = frozen.dependents(&addr_j).contains(&addr_i);
                    prop_assert_eq!(i_depends_on_j, j_has_i_as_dependent);
                }
            }
        }
    }

    fn noop_record_with_deps(name: &str, deps: &[&str]) -> ResourceInstanceObject {
        let addr = ResourceInstanceObjectAddr::current(ResourceInstanceAddr::managed("test_thing", name));
        let mut dependencies = Set::new();
        for dep in deps {
            dependencies.insert(ResourceInstanceObjectAddr::current(ResourceInstanceAddr::managed(
                "test_thing",
                *dep,
            )));
        }
        ResourceInstanceObject {
            address: addr,
            planned_change: None,
            placeholder_value: Some(Value::null()),
            provider: provider(),
            replace_order: ReplaceOrder::Any,
            dependencies,
        }
    }
}
