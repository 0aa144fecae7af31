//! Event-name keyed subscriber registry.
//!
//! Subscribers run on the dispatching task. Each dispatch iterates a
//! snapshot of the subscriber list, so callbacks may subscribe or
//! unsubscribe (even themselves) without affecting the pass in progress.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, trace};

/// Shared subscriber callback.
pub type Callback = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Handle returned by [`EventDispatcher::on`], used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    event: String,
    id: u64,
}

impl Subscription {
    /// Event name this subscription listens to.
    pub fn event(&self) -> &str {
        &self.event
    }
}

/// Subscription removed from its dispatcher on drop.
#[must_use = "the subscription ends when the guard is dropped"]
pub struct ScopedSubscription<'a> {
    dispatcher: &'a EventDispatcher,
    subscription: Subscription,
}

impl Drop for ScopedSubscription<'_> {
    fn drop(&mut self) {
        self.dispatcher.off(&self.subscription);
    }
}

struct Entry {
    id: u64,
    callback: Callback,
}

/// Registry mapping event names to ordered subscriber lists.
#[derive(Default)]
pub struct EventDispatcher {
    next_id: AtomicU64,
    registry: Mutex<HashMap<String, Vec<Entry>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `callback` to the subscribers of `event`.
    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.subscribe(event, Arc::new(callback))
    }

    /// Appends a shared callback to the subscribers of `event`.
    ///
    /// Registering the same `Arc` twice for one event returns the
    /// existing subscription instead of adding a duplicate.
    pub fn subscribe(&self, event: impl Into<String>, callback: Callback) -> Subscription {
        let event = event.into();
        let mut registry = self.lock();
        let entries = registry.entry(event.clone()).or_default();

        if let Some(existing) = entries.iter().find(|e| same_callback(&e.callback, &callback)) {
            return Subscription {
                event,
                id: existing.id,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.push(Entry { id, callback });
        trace!(event = %event, id, "subscribed");
        Subscription { event, id }
    }

    /// Removes the subscription. Returns `false` if it was already gone.
    pub fn off(&self, subscription: &Subscription) -> bool {
        self.remove_where(&subscription.event, |e| e.id == subscription.id)
    }

    /// Removes the first subscriber of `event` that is the same `Arc` as
    /// `callback`.
    pub fn off_callback(&self, event: &str, callback: &Callback) -> bool {
        self.remove_where(event, |e| same_callback(&e.callback, callback))
    }

    /// Like [`on`](Self::on), but the subscription ends when the returned
    /// guard is dropped.
    pub fn on_scoped<F>(&self, event: impl Into<String>, callback: F) -> ScopedSubscription<'_>
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        ScopedSubscription {
            dispatcher: self,
            subscription: self.on(event, callback),
        }
    }

    /// Delivers `payload` to every subscriber of `event` in registration
    /// order. Returns the number of subscribers invoked.
    ///
    /// A panicking subscriber is logged and skipped; the remaining
    /// subscribers still run.
    pub fn dispatch(&self, event: &str, payload: &serde_json::Value) -> usize {
        let snapshot: Vec<(u64, Callback)> = match self.lock().get(event) {
            Some(entries) => entries
                .iter()
                .map(|e| (e.id, e.callback.clone()))
                .collect(),
            None => return 0,
        };

        for (id, callback) in &snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                error!(
                    event = %event,
                    subscriber = id,
                    "subscriber panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
        snapshot.len()
    }

    /// Number of subscribers for `event`.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.lock().get(event).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().values().all(Vec::is_empty)
    }

    /// Drops every subscription.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn remove_where(&self, event: &str, pred: impl Fn(&Entry) -> bool) -> bool {
        let mut registry = self.lock();
        let Some(entries) = registry.get_mut(event) else {
            return false;
        };
        let Some(pos) = entries.iter().position(pred) else {
            return false;
        };
        entries.remove(pos);
        if entries.is_empty() {
            registry.remove(event);
        }
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Entry>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn same_callback(a: &Callback, b: &Callback) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}
