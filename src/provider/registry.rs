//! Provider-instance registry.
//!
//! Maintains an at-most-one-open-client-per-address invariant: the first
//! caller to ask for a provider instance's client pays the cost of
//! configuring and opening it; every later caller gets the cached `Arc`.
//! Closure is deferred until the completion tracker reports that every
//! dependent resource-instance plan and every ephemeral resource this
//! provider depends on has finished.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use crate::addr::ProviderInstanceAddr;
use crate::completion::CompletionTracker;
use crate::error::{Error, Result};
use crate::provider::ProviderClient;
use crate::value::Value;

/// Configuration supplied to a provider instance the first time it's opened.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// The evaluated provider configuration block.
    pub config: Value,
    /// Addresses of resource instances whose values this config depends on
    /// (so the evaluator can be asked to resolve them before opening).
    pub required_instance_deps: Vec<crate::addr::ResourceInstanceAddr>,
}

enum Entry {
    Open(Arc<dyn ProviderClient>),
    Failed(String),
}

/// At-most-once-per-address provider client cache, plus completion-gated closure.
pub struct ProviderRegistry {
    clients: DashMap<ProviderInstanceAddr, Entry>,
    opening: tokio::sync::Mutex<()>,
    completions: Arc<CompletionTracker<ProviderInstanceAddr>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            opening: tokio::sync::Mutex::new(()),
            completions: Arc::new(CompletionTracker::new()),
        }
    }

    /// Returns the client for `addr`, opening and configuring it via `open`
    /// the first time this address is requested. `open` is only ever invoked
    /// once per address even under concurrent callers: later callers for the
    /// same address while the first is still opening block on an internal
    /// lock rather than racing a second open.
    ///
    /// On configuration failure, the failure is cached too (`nil client,
    /// diagnostics` in the source design): every caller for this address
    /// gets the same [`Error::ProviderUnavailable`] without retrying the open.
    #[instrument(name = "provider_registry_client_for", skip(self, open))]
    pub async fn client_for<F, Fut>(
        &self,
        addr: &ProviderInstanceAddr,
        open: F,
    ) -> Result<Arc<dyn ProviderClient>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn ProviderClient>>>,
    {
        if let Some(entry) = self.clients.get(addr) {
            return match &*entry {
                Entry::Open(client) => Ok(Arc::clone(client)),
                Entry::Failed(message) => Err(Error::ProviderUnavailable {
                    provider: addr.clone(),
                    message: message.clone(),
                }),
            };
        }

        let _guard = self.opening.lock().await;
        // Re-check: another caller may have finished opening while we waited
        // for the lock.
        if let Some(entry) = self.clients.get(addr) {
            return match &*entry {
                Entry::Open(client) => Ok(Arc::clone(client)),
                Entry::Failed(message) => Err(Error::ProviderUnavailable {
                    provider: addr.clone(),
                    message: message.clone(),
                }),
            };
        }

        info!(provider = %addr, "opening provider instance");
        match open().await {
            Ok(client) => {
                self.clients.insert(addr.clone(), Entry::Open(Arc::clone(&client)));
                Ok(client)
            }
            Err(err) => {
                let message = err.to_string();
                self.clients
                    .insert(addr.clone(), Entry::Failed(message.clone()));
                warn!(provider = %addr, error = %message, "provider instance unavailable");
                Err(Error::ProviderUnavailable {
                    provider: addr.clone(),
                    message,
                })
            }
        }
    }

    /// Registers that `dependent` must finish before `addr` may be closed.
    pub fn expect_dependent(&self, addr: &ProviderInstanceAddr) {
        self.completions.expect(addr.clone());
    }

    /// Reports that one dependent of `addr` (a resource-instance plan, or an
    /// ephemeral this provider depended on) has finished.
    pub fn dependent_done(&self, addr: &ProviderInstanceAddr) {
        self.completions.complete(addr.clone());
    }

    /// Schedules closure of `addr`'s client contingent on every dependent
    /// reporting completion, then closes it. Runs the graceful-stop-then-
    /// forceful-close sequence described in §5 if `cancelled` is set.
    #[instrument(name = "provider_registry_close_when_done", skip(self))]
    pub async fn close_when_done(&self, addr: &ProviderInstanceAddr, cancelled: bool) -> Result<()> {
        self.completions.wait_for(addr.clone()).await;

        let Some((_, entry)) = self.clients.remove(addr) else {
            return Ok(());
        };
        let Entry::Open(client) = entry else {
            return Ok(());
        };

        if cancelled {
            if let Err(err) = client.stop().await {
                debug!(provider = %addr, error = %err, "graceful stop failed, closing forcefully");
            }
        }
        client.close().await
    }

    /// Drains every provider-instance completion event still pending,
    /// marking it complete. Called defensively on driver shutdown so a panic
    /// elsewhere can't leave a `close_when_done` waiter stuck forever.
    pub fn drain_pending_completions(&self) -> Vec<ProviderInstanceAddr> {
        self.completions.drain_pending()
    }

    /// Returns the cached client for `addr`, if one is open, without triggering an open.
    #[must_use]
    pub fn get(&self, addr: &ProviderInstanceAddr) -> Option<Arc<dyn ProviderClient>> {
        match self.clients.get(addr)?.value() {
            Entry::Open(client) => Some(Arc::clone(client)),
            Entry::Failed(_) => None,
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{EphemeralHandle, PlannedChange, ProviderOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::error::Diagnostics;

    struct FakeClient;

    #[async_trait]
    impl ProviderClient for FakeClient {
        async fn validate_resource_config(&self, _: &str, _: &Value) -> Result<Diagnostics> {
            Ok(Diagnostics::new())
        }
        async fn read_resource(&self, _: &str, _: &Value) -> Result<ProviderOutcome<Value>> {
            Ok(ProviderOutcome::ok(Value::null()))
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
        ) -> Result<ProviderOutcome<PlannedChange>> {
            unimplemented!()
        }
        async fn apply_resource_change(
            &self,
            _: &str,
            _: Option<&Value>,
            _: &PlannedChange,
        ) -> Result<ProviderOutcome<Value>> {
            unimplemented!()
        }
        async fn open_ephemeral(&self, _: &str, _: &Value) -> Result<ProviderOutcome<EphemeralHandle>> {
            unimplemented!()
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

    fn addr(name: &str) -> ProviderInstanceAddr {
        ProviderInstanceAddr {
            module: crate::addr::ModuleInstanceAddr::root(),
            provider: name.to_string(),
            alias: None,
        }
    }

    #[tokio::test]
    async fn client_for_opens_at_most_once() {
        let registry = ProviderRegistry::new();
        let opens = Arc::new(AtomicUsize::new(0));
        let a = addr("aws");

        for _ in 0..5 {
            let opens = Arc::clone(&opens);
            let client = registry
                .client_for(&a, || async move {
                    opens.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(FakeClient) as Arc<dyn ProviderClient>)
                })
                .await
                .unwrap();
            let _ = client;
        }

        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_when_done_waits_for_dependents() {
        let registry = Arc::new(ProviderRegistry::new());
        let a = addr("aws");
        registry
            .client_for(&a, || async { Ok(Arc::new(FakeClient) as Arc<dyn ProviderClient>) })
            .await
            .unwrap();

        registry.expect_dependent(&a);

        let closer = Arc::clone(&registry);
        let closer_addr = a.clone();
        let closed = tokio::spawn(async move { closer.close_when_done(&closer_addr, false).await });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(registry.get(&a).is_some());

        registry.dependent_done(&a);
        closed.await.unwrap().unwrap();
        assert!(registry.get(&a).is_none());
    }

    #[tokio::test]
    async fn failed_open_is_cached_and_reported_to_every_caller() {
        let registry = ProviderRegistry::new();
        let a = addr("broken");
        let attempts = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let attempts = Arc::clone(&attempts);
            let result = registry
                .client_for(&a, || async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(Error::ProviderUnavailable {
                        provider: addr("broken"),
                        message: "config invalid".into(),
                    })
                })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
