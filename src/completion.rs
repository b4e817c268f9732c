//! Completion tracker.
//!
//! A generic, concurrency-safe collection of pending events used to sequence
//! resource-release operations: "this provider instance may be closed once
//! all its dependent resource-instance planning calls complete", "this
//! ephemeral resource may be closed once all provider instances depending on
//! it have closed". The tracker is not a scheduler — it only lets callers
//! wait for a set of events to resolve.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct EventState {
    done: bool,
    notify: Arc<Notify>,
}

/// A concurrency-safe set of events, each either pending or complete.
///
/// `E` is any comparable, hashable token identifying one unit of planning
/// work (a resource-instance address, a provider-instance address, ...).
pub struct CompletionTracker<E> {
    events: Mutex<HashMap<E, EventState>>,
}

impl<E> Default for CompletionTracker<E>
where
    E: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> CompletionTracker<E>
where
    E: Eq + Hash + Clone,
{
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `event` as pending, if it isn't already known. Idempotent:
    /// registering an event twice is not an error, unlike [`crate::object::ResourceInstanceObjects::put`].
    pub fn expect(&self, event: E) {
        let mut events = self.events.lock();
        events.entry(event).or_insert_with(|| EventState {
            done: false,
            notify: Arc::new(Notify::new()),
        });
    }

    /// Marks `event` as complete, waking any waiters. Marking an event that
    /// was never `expect`-ed also registers it as complete, so that
    /// `complete` followed by a later `wait_for` never deadlocks regardless
    /// of call order between concurrent tasks.
    pub fn complete(&self, event: E) {
        let mut events = self.events.lock();
        let state = events.entry(event).or_insert_with(|| EventState {
            done: false,
            notify: Arc::new(Notify::new()),
        });
        if !state.done {
            state.done = true;
            state.notify.notify_waiters();
        }
    }

    /// Waits until `event` is complete. If `event` was never registered it is
    /// treated as already complete (there is nothing to wait for), so callers
    /// don't need a prior `expect` in hand for events that may never be
    /// produced.
    pub async fn wait_for(&self, event: E) {
        let notify = {
            let mut events = self.events.lock();
            let state = events.entry(event).or_insert_with(|| EventState {
                done: true,
                notify: Arc::new(Notify::new()),
            });
            if state.done {
                return;
            }
            Arc::clone(&state.notify)
        };
        notify.notified().await;
    }

    /// True if `event` is known and complete.
    #[must_use]
    pub fn is_complete(&self, event: &E) -> bool {
        self.events
            .lock()
            .get(event)
            .is_some_or(|s| s.done)
    }

    /// Drains every event that is still pending, marking it complete and
    /// returning its token. Used for defensive shutdown cleanup: a driver
    /// that is closing despite a panic elsewhere must still unblock anyone
    /// waiting on events that will now never be reported normally.
    pub fn drain_pending(&self) -> Vec<E> {
        let mut events = self.events.lock();
        let mut drained = Vec::new();
        for (event, state) in events.iter_mut() {
            if !state.done {
                state.done = true;
                state.notify.notify_waiters();
                drained.push(event.clone());
            }
        }
        drained
    }
}

impl<E: fmt::Debug> fmt::Debug for CompletionTracker<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionTracker").finish_non_exhaustive()
    }
}
