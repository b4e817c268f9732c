//! Addressing primitives.
//!
//! Canonical, comparable addresses for resources, instances, providers and
//! modules, plus the ordered `Map`/`Set` containers keyed by them. Two
//! addresses compare equal iff they denote the same logical object; `Ord` is
//! defined purely to give graph assembly a deterministic iteration order, not
//! because addresses have any natural magnitude.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

/// The mode a resource instance was declared under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum ResourceMode {
    /// A managed resource: created, updated and destroyed by the provider.
    Managed,
    /// A data resource: read-only, never persisted meaningfully between rounds.
    Data,
    /// An ephemeral resource: no persisted state, scoped to a single plan/apply.
    Ephemeral,
}

impl fmt::Display for ResourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Managed => write!(f, "managed"),
            Self::Data => write!(f, "data"),
            Self::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

/// Address of a module instance (the root module instance has no steps).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ModuleInstanceAddr {
    /// Ordered path of `(call_name, instance_key)` steps from the root module.
    pub steps: Vec<(String, Option<String>)>,
}

impl ModuleInstanceAddr {
    /// The root module instance.
    #[must_use]
    pub fn root() -> Self {
        Self { steps: Vec::new() }
    }

    /// True if this is the root module instance.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for ModuleInstanceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "<root>");
        }
        for (i, (name, key)) in self.steps.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            match key {
                Some(k) => write!(f, "module.{name}[{k}]")?,
                None => write!(f, "module.{name}")?,
            }
        }
        Ok(())
    }
}

/// Address of a module *call* (the static, un-keyed module reference).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct AbsModuleCallAddr {
    /// Enclosing module instance.
    pub module: ModuleInstanceAddr,
    /// Name of the `module` block.
    pub call_name: String,
}

impl fmt::Display for AbsModuleCallAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.module.is_root() {
            write!(f, "module.{}", self.call_name)
        } else {
            write!(f, "{}.module.{}", self.module, self.call_name)
        }
    }
}

/// Address of a resource (un-keyed; spans all instances).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ResourceAddr {
    /// Enclosing module instance.
    pub module: ModuleInstanceAddr,
    /// Resource mode.
    pub mode: ResourceMode,
    /// Resource type, e.g. `"test_placeholder"`.
    pub resource_type: String,
    /// Resource name, e.g. `"placeholder"`.
    pub name: String,
}

impl fmt::Display for ResourceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.module.is_root() {
            write!(f, "{}.", self.module)?;
        }
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

/// Address of a single resource instance (resource plus optional instance key).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ResourceInstanceAddr {
    /// The resource this instance belongs to.
    pub resource: ResourceAddr,
    /// `count`/`for_each` instance key, if any.
    pub key: Option<InstanceKey>,
}

/// A `count` (integer) or `for_each` (string) instance key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum InstanceKey {
    /// `count` index.
    Int(i64),
    /// `for_each` key.
    String(String),
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl fmt::Display for ResourceInstanceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource)?;
        if let Some(key) = &self.key {
            write!(f, "[{key}]")?;
        }
        Ok(())
    }
}

impl ResourceInstanceAddr {
    /// Builds a resource instance address with no instance key, in the root module.
    #[must_use]
    pub fn managed(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource: ResourceAddr {
                module: ModuleInstanceAddr::root(),
                mode: ResourceMode::Managed,
                resource_type: resource_type.into(),
                name: name.into(),
            },
            key: None,
        }
    }
}

/// Distinguishes the "current" object of a resource instance from one of its
/// deposed predecessors.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum DeposedKey {
    /// The instance's current object.
    Current,
    /// A deposed object, keyed by an opaque identifier assigned when it was deposed.
    Deposed(String),
}

impl DeposedKey {
    /// True if this key denotes a deposed (not current) object.
    #[must_use]
    pub fn is_deposed(&self) -> bool {
        matches!(self, Self::Deposed(_))
    }
}

impl fmt::Display for DeposedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => write!(f, "current"),
            Self::Deposed(k) => write!(f, "deposed({k})"),
        }
    }
}

/// Address of a single resource-instance *object*: an instance plus which of
/// its incarnations (current, or a specific deposed key) is meant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ResourceInstanceObjectAddr {
    /// The resource instance.
    pub instance: ResourceInstanceAddr,
    /// Which object of that instance.
    pub deposed: DeposedKey,
}

impl ResourceInstanceObjectAddr {
    /// Addresses the current object of `instance`.
    #[must_use]
    pub fn current(instance: ResourceInstanceAddr) -> Self {
        Self {
            instance,
            deposed: DeposedKey::Current,
        }
    }

    /// Addresses a deposed object of `instance`.
    #[must_use]
    pub fn deposed(instance: ResourceInstanceAddr, key: impl Into<String>) -> Self {
        Self {
            instance,
            deposed: DeposedKey::Deposed(key.into()),
        }
    }
}

impl fmt::Display for ResourceInstanceObjectAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.instance)?;
        if self.deposed.is_deposed() {
            write!(f, " ({})", self.deposed)?;
        }
        Ok(())
    }
}

/// Address of a provider *instance* (a configured provider block, possibly
/// aliased or passed through a module expansion).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ProviderInstanceAddr {
    /// Enclosing module instance.
    pub module: ModuleInstanceAddr,
    /// Provider local name, e.g. `"aws"`.
    pub provider: String,
    /// Optional `alias`.
    pub alias: Option<String>,
}

impl fmt::Display for ProviderInstanceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.module.is_root() {
            write!(f, "{}.", self.module)?;
        }
        write!(f, "provider.{}", self.provider)?;
        if let Some(alias) = &self.alias {
            write!(f, ".{alias}")?;
        }
        Ok(())
    }
}

/// An ordered map keyed by an address type. A thin `BTreeMap` wrapper so call
/// sites read as domain types rather than raw collections, and so iteration
/// order is always address order (needed for deterministic graph assembly).
#[derive(Debug, Clone)]
pub struct Map<K, V>(BTreeMap<K, V>);

impl<K: Ord, V> Map<K, V> {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Inserts a value, returning any value previously stored at `key`.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.0.insert(key, value)
    }

    /// Looks up a value by key.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.0.get(key)
    }

    /// Mutably looks up a value by key.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.0.get_mut(key)
    }

    /// True if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.0.contains_key(key)
    }

    /// Removes and returns the value at `key`, if present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.0.remove(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.0.iter()
    }

    /// Iterates keys in address order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.0.keys()
    }

    /// Iterates values in address order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.0.values()
    }
}

impl<K: Ord, V> Default for Map<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for Map<K, V> {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(BTreeMap::from_iter(iter))
    }
}

/// An ordered set keyed by an address type, for the same determinism reasons as [`Map`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Set<K>(BTreeSet<K>);

impl<K: Ord> Set<K> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Inserts `key`, returning `true` if it was newly inserted.
    pub fn insert(&mut self, key: K) -> bool {
        self.0.insert(key)
    }

    /// True if `key` is a member.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.0.contains(key)
    }

    /// Removes `key`, returning `true` if it was present.
    pub fn remove(&mut self, key: &K) -> bool {
        self.0.remove(key)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the set has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates members in address order.
    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.0.iter()
    }
}

impl<K: Ord> Default for Set<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord> FromIterator<K> for Set<K> {
    fn from_iter<T: IntoIterator<Item = K>>(iter: T) -> Self {
        Self(BTreeSet::from_iter(iter))
    }
}

impl<K: Ord + Clone> Set<K> {
    /// Returns the union of `self` and `other` as a new set.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        self.0.union(&other.0).cloned().collect()
    }
}

impl<'a, K: Ord> IntoIterator for &'a Set<K> {
    type Item = &'a K;
    type IntoIter = std::collections::btree_set::Iter<'a, K>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_value_equal() {
        let a = ResourceInstanceAddr::managed("test_thing", "a");
        let b = ResourceInstanceAddr::managed("test_thing", "a");
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));
    }

    #[test]
    fn display_formats_are_readable() {
        let addr = ResourceInstanceAddr::managed("test_placeholder", "widget");
        assert_eq!(addr.to_string(), "test_placeholder.widget");

        let keyed = ResourceInstanceAddr {
            key: Some(InstanceKey::Int(2)),
            ..addr
        };
        assert_eq!(keyed.to_string(), "test_placeholder.widget[2]");
    }

    #[test]
    fn map_iterates_in_address_order() {
        let mut m: Map<ResourceInstanceAddr, i32> = Map::new();
        m.insert(ResourceInstanceAddr::managed("test", "b"), 2);
        m.insert(ResourceInstanceAddr::managed("test", "a"), 1);
        let names: Vec<_> = m.keys().map(|k| k.resource.name.clone()).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn set_union_is_deduplicated() {
        let a: Set<i32> = [1, 2, 3].into_iter().collect();
        let b: Set<i32> = [2, 3, 4].into_iter().collect();
        let u = a.union(&b);
        assert_eq!(u.len(), 4);
    }
}
