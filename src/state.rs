//! The persisted-state interface (§6): a narrow read/write contract over
//! the previous round's state, consumed by the driver. Codecs and actual
//! storage (disk, remote backend) are an external collaborator — see §1 —
//! so this module only defines the shape the driver needs and an in-memory
//! implementation useful for tests and for holding `refreshed_state` during
//! a planning run.

use async_trait::async_trait;

use crate::addr::{DeposedKey, Map, ModuleInstanceAddr, ProviderInstanceAddr, ResourceInstanceAddr};
use crate::error::Result;
use crate::value::Value;

/// One persisted object: its value, the opaque provider-private blob
/// recorded alongside it, and the provider instance that manages it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredObject {
    /// The object's recorded value.
    pub value: Value,
    /// Opaque provider-private data round-tripped from the last apply.
    pub private_blob: Vec<u8>,
    /// The provider instance that last managed this object.
    pub provider: ProviderInstanceAddr,
}

/// One resource instance's recorded state: an optional current object plus
/// zero or more deposed objects.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ResourceInstanceState {
    /// The instance's current object, if one exists.
    pub current: Option<StoredObject>,
    /// Deposed objects, keyed by their deposed key.
    pub deposed: std::collections::BTreeMap<String, StoredObject>,
}

/// Read access to persisted state: a snapshot of modules → resources →
/// instances, each instance carrying a current object (optional) and any
/// deposed objects.
#[async_trait]
pub trait StateReader: Send + Sync {
    /// Every module instance with at least one recorded resource instance.
    async fn modules(&self) -> Result<Vec<ModuleInstanceAddr>>;

    /// Every resource instance address recorded under `module`.
    async fn resource_instances(&self, module: &ModuleInstanceAddr) -> Result<Vec<ResourceInstanceAddr>>;

    /// The recorded state for one resource instance, if any is recorded.
    async fn instance_state(&self, instance: &ResourceInstanceAddr) -> Result<Option<ResourceInstanceState>>;
}

/// Write access to persisted state: per-instance setters for current,
/// deposed, and forget (nil-out).
#[async_trait]
pub trait StateWriter: Send + Sync {
    /// Records `object` as the current object of `instance`.
    async fn set_current(&self, instance: &ResourceInstanceAddr, object: StoredObject) -> Result<()>;

    /// Records `object` as a deposed object of `instance` under `key`.
    async fn set_deposed(&self, instance: &ResourceInstanceAddr, key: &str, object: StoredObject) -> Result<()>;

    /// Removes one incarnation of `instance` from the record entirely
    /// (the "forget" operation: no provider call, just drops the bookkeeping).
    async fn forget(&self, instance: &ResourceInstanceAddr, deposed: Option<DeposedKey>) -> Result<()>;
}

/// An in-memory snapshot implementing both [`StateReader`] and
/// [`StateWriter`], used to hold `prior_state`/`refreshed_state` in the plan
/// artifact and as a fake in tests.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    instances: Map<ResourceInstanceAddr, ResourceInstanceState>,
}

impl StateSnapshot {
    /// An empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a full instance record directly, for test fixtures.
    pub fn insert(&mut self, instance: ResourceInstanceAddr, state: ResourceInstanceState) {
        self.instances.insert(instance, state);
    }

    /// Every resource instance address recorded, regardless of module.
    #[must_use]
    pub fn addresses(&self) -> Vec<ResourceInstanceAddr> {
        self.instances.keys().cloned().collect()
    }
}

#[async_trait]
impl StateReader for StateSnapshot {
    async fn modules(&self) -> Result<Vec<ModuleInstanceAddr>> {
        let mut modules: Vec<_> = self
            .instances
            .keys()
            .map(|addr| addr.resource.module.clone())
            .collect();
        modules.sort();
        modules.dedup();
        Ok(modules)
    }

    async fn resource_instances(&self, module: &ModuleInstanceAddr) -> Result<Vec<ResourceInstanceAddr>> {
        Ok(self
            .instances
            .keys()
            .filter(|addr| &addr.resource.module == module)
            .cloned()
            .collect())
    }

    async fn instance_state(&self, instance: &ResourceInstanceAddr) -> Result<Option<ResourceInstanceState>> {
        Ok(self.instances.get(instance).cloned())
    }
}

#[async_trait]
impl StateWriter for parking_lot::Mutex<StateSnapshot> {
    async fn set_current(&self, instance: &ResourceInstanceAddr, object: StoredObject) -> Result<()> {
        let mut snapshot = self.lock();
        snapshot
            .instances
            .get_mut(instance)
            .map(|state| state.current = Some(object.clone()))
            .unwrap_or_else(|| {
                snapshot.instances.insert(
                    instance.clone(),
                    ResourceInstanceState {
                        current: Some(object),
                        deposed: std::collections::BTreeMap::new(),
                    },
                );
            });
        Ok(())
    }

    async fn set_deposed(&self, instance: &ResourceInstanceAddr, key: &str, object: StoredObject) -> Result<()> {
        let mut snapshot = self.lock();
        snapshot
            .instances
            .get_mut(instance)
            .map(|state| {
                state.deposed.insert(key.to_string(), object.clone());
            })
            .unwrap_or_else(|| {
                let mut deposed = std::collections::BTreeMap::new();
                deposed.insert(key.to_string(), object);
                snapshot.instances.insert(
                    instance.clone(),
                    ResourceInstanceState { current: None, deposed },
                );
            });
        Ok(())
    }

    async fn forget(&self, instance: &ResourceInstanceAddr, deposed: Option<DeposedKey>) -> Result<()> {
        let mut snapshot = self.lock();
        let Some(state) = snapshot.instances.get_mut(instance) else {
            return Ok(());
        };
        match deposed {
            None | Some(DeposedKey::Current) => state.current = None,
            Some(DeposedKey::Deposed(key)) => {
                state.deposed.remove(&key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::ResourceInstanceAddr;

    #[tokio::test]
    async fn snapshot_round_trips_current_object() {
        let snapshot = parking_lot::Mutex::new(StateSnapshot::new());
        let instance = ResourceInstanceAddr::managed("test_thing", "a");
        let object = StoredObject {
            value: Value::known(serde_json::json!("before")),
            private_blob: vec![1, 2, 3],
            provider: crate::addr::ProviderInstanceAddr {
                module: ModuleInstanceAddr::root(),
                provider: "test".into(),
                alias: None,
            },
        };

        StateWriter::set_current(&snapshot, &instance, object.clone())
            .await
            .unwrap();

        let read_back = snapshot.lock().clone();
        let state = read_back.instance_state(&instance).await.unwrap().unwrap();
        assert_eq!(state.current.unwrap().value, object.value);
    }
}
