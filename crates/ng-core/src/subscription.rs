//! Subscription registry.
//!
//! The subscriber list is copy-on-write: dispatch clones one `Arc` under a
//! brief read lock and then walks an immutable snapshot, so callbacks run
//! without any registry lock held and may themselves subscribe or
//! unsubscribe.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::signal::SignalEvent;
use crate::time::now_unix_millis;

pub type SubscriptionId = Uuid;

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

pub type Callback = Arc<dyn Fn(&SignalEvent<'_>) -> std::result::Result<(), CallbackError> + Send + Sync>;

pub struct Subscription {
    pub id: SubscriptionId,
    pub name: String,
    pub filter: Filter,
    pub callback: Callback,
    pub created_at_ms: u64,
}

impl Subscription {
    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            name: self.name.clone(),
            created_at_ms: self.created_at_ms,
        }
    }
}

/// Listing entry without the callback.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub name: String,
    pub created_at_ms: u64,
}

/// Outcome of one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub matched: u64,
    pub missed: u64,
    /// Callbacks that returned `Ok`.
    pub notified: u64,
    /// Callbacks that returned `Err` or panicked.
    pub failed: u64,
}

pub struct SubscriptionRegistry {
    subscribers: RwLock<Arc<Vec<Arc<Subscription>>>>,
    reserved_segments: Vec<String>,
}

impl SubscriptionRegistry {
    pub fn new(reserved_segments: Vec<String>) -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
            reserved_segments,
        }
    }

    /// Compile `filter` and register `callback`. An invalid filter is
    /// rejected and nothing is registered.
    pub fn subscribe<F>(&self, name: &str, filter: &Value, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&SignalEvent<'_>) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
    {
        let filter = Filter::compile(filter, &self.reserved_segments)?;
        let subscription = Arc::new(Subscription {
            id: Uuid::new_v4(),
            name: name.to_string(),
            filter,
            callback: Arc::new(callback),
            created_at_ms: now_unix_millis(),
        });
        let id = subscription.id;

        let mut guard = self.subscribers.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(subscription);
        *guard = Arc::new(next);

        tracing::debug!(%id, name, "subscribed");
        Ok(id)
    }

    /// Returns false for an unknown id.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.subscribers.write();
        if !guard.iter().any(|s| s.id == id) {
            return false;
        }
        let next: Vec<Arc<Subscription>> = guard.iter().filter(|s| s.id != id).cloned().collect();
        *guard = Arc::new(next);
        tracing::debug!(%id, "unsubscribed");
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Subscriptions in creation order.
    pub fn list(&self) -> Vec<SubscriptionInfo> {
        self.snapshot().iter().map(|s| s.info()).collect()
    }

    pub fn get(&self, id: SubscriptionId) -> Result<SubscriptionInfo> {
        self.snapshot()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.info())
            .ok_or(Error::SubscriptionNotFound(id))
    }

    fn snapshot(&self) -> Arc<Vec<Arc<Subscription>>> {
        Arc::clone(&self.subscribers.read())
    }

    /// Evaluate every filter and invoke matching callbacks in creation
    /// order. A failing callback is logged and counted; the rest still run.
    pub fn dispatch(&self, event: &SignalEvent<'_>) -> DispatchReport {
        let subscribers = self.snapshot();
        let mut report = DispatchReport::default();

        for sub in subscribers.iter() {
            if !sub.filter.matches(event) {
                report.missed += 1;
                continue;
            }
            report.matched += 1;

            match catch_unwind(AssertUnwindSafe(|| (sub.callback)(event))) {
                Ok(Ok(())) => report.notified += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(
                        subscription = %sub.id,
                        name = %sub.name,
                        event_type = event.event_type,
                        "callback failed: {e}"
                    );
                }
                Err(panic) => {
                    report.failed += 1;
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    tracing::warn!(
                        subscription = %sub.id,
                        name = %sub.name,
                        event_type = event.event_type,
                        "callback panicked: {msg}"
                    );
                }
            }
        }
        report
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(vec!["system".to_string()])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::error::Error;

    fn event(event_type: &str, priority: u8) -> SignalEvent<'_> {
        SignalEvent {
            event_type,
            vector: &[0.0, 0.0, 0.0],
            priority,
            timestamp_ms: 0,
            token_id: 1,
            is_novel: true,
            fast_path: false,
        }
    }

    #[test]
    fn test_subscribe_and_count() {
        let reg = SubscriptionRegistry::default();
        assert_eq!(reg.subscriber_count(), 0);
        let a = reg.subscribe("a", &json!({}), |_| Ok(())).unwrap();
        let b = reg.subscribe("b", &json!({}), |_| Ok(())).unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.subscriber_count(), 2);
        let names: Vec<String> = reg.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_invalid_filter_registers_nothing() {
        let reg = SubscriptionRegistry::default();
        let err = reg
            .subscribe("bad", &json!({"priority": {"$between": [1, 2]}}), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFilter(_)));
        assert_eq!(reg.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe_idempotent() {
        let reg = SubscriptionRegistry::default();
        let id = reg.subscribe("a", &json!({}), |_| Ok(())).unwrap();
        assert!(reg.unsubscribe(id));
        assert!(!reg.unsubscribe(id));
        assert!(!reg.unsubscribe(Uuid::new_v4()));
        assert_eq!(reg.subscriber_count(), 0);
    }

    #[test]
    fn test_get_by_id() {
        let reg = SubscriptionRegistry::default();
        let id = reg.subscribe("alerts", &json!({}), |_| Ok(())).unwrap();
        assert_eq!(reg.get(id).unwrap().name, "alerts");

        reg.unsubscribe(id);
        let err = reg.get(id).unwrap_err();
        assert_eq!(err, Error::SubscriptionNotFound(id));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_dispatch_in_creation_order() {
        let reg = SubscriptionRegistry::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            reg.subscribe(name, &json!({}), move |_| {
                order.lock().unwrap().push(name);
                Ok(())
            })
            .unwrap();
        }
        let report = reg.dispatch(&event("a.b", 0));
        assert_eq!(report.notified, 3);
        assert_eq!(*order.lock().unwrap(), ["first", "second", "third"]);
    }

    #[test]
    fn test_failing_callbacks_are_isolated() {
        let reg = SubscriptionRegistry::default();
        let hits = Arc::new(AtomicUsize::new(0));

        reg.subscribe("err", &json!({}), |_| Err("boom".into())).unwrap();
        reg.subscribe("panic", &json!({}), |_| panic!("callback bug")).unwrap();
        let h = Arc::clone(&hits);
        reg.subscribe("ok", &json!({}), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        let report = reg.dispatch(&event("a.b", 0));
        assert_eq!(
            report,
            DispatchReport {
                matched: 3,
                missed: 0,
                notified: 1,
                failed: 2
            }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_filter_misses_counted() {
        let reg = SubscriptionRegistry::default();
        reg.subscribe("hi", &json!({"priority": {"$gte": 150}}), |_| Ok(()))
            .unwrap();
        reg.subscribe("all", &json!({}), |_| Ok(())).unwrap();
        let report = reg.dispatch(&event("a.b", 100));
        assert_eq!((report.matched, report.missed), (1, 1));
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let reg = Arc::new(SubscriptionRegistry::default());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let (r, s) = (Arc::clone(&reg), Arc::clone(&slot));
        let id = reg
            .subscribe("once", &json!({}), move |_| {
                if let Some(id) = *s.lock().unwrap() {
                    r.unsubscribe(id);
                }
                Ok(())
            })
            .unwrap();
        *slot.lock().unwrap() = Some(id);

        assert_eq!(reg.dispatch(&event("a", 0)).notified, 1);
        assert_eq!(reg.subscriber_count(), 0);
        assert_eq!(reg.dispatch(&event("a", 0)).notified, 0);
    }
}
