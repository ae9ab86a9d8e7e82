//! In-process publish/subscribe for settlement events.
//!
//! Delivery is synchronous and best-effort: `publish` calls every handler
//! subscribed to the topic at that moment, in subscription order. Nothing
//! is queued or persisted. A handler that errors or panics is logged and
//! skipped; the publisher never sees it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    SettlementCompleted,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::SettlementCompleted => "settlement:completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementEvent {
    pub resource_id: String,
    /// Transactions that reached the settled state in this run.
    pub transaction_ids: Vec<String>,
    pub settled_at: DateTime<Utc>,
}

type Handler = Arc<dyn Fn(&SettlementEvent) -> Result<(), String> + Send + Sync>;

struct Subscriber {
    id: u64,
    topic: Topic,
    handler: Handler,
}

#[derive(Default)]
pub struct Notifier {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

/// Handle returned by [`Notifier::subscribe`]. Dropping it keeps the
/// subscription; call [`Subscription::unsubscribe`] to end it.
pub struct Subscription {
    notifier: Weak<Notifier>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.remove(self.id);
        }
    }
}

impl Notifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe<F>(self: &Arc<Self>, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&SettlementEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push(Subscriber {
            id,
            topic,
            handler: Arc::new(handler),
        });
        Subscription {
            notifier: Arc::downgrade(self),
            id,
        }
    }

    fn remove(&self, id: u64) {
        self.lock().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.lock().iter().filter(|s| s.topic == topic).count()
    }

    /// Deliver `event` to the current subscribers of `topic`. Returns how
    /// many handlers completed without error.
    pub fn publish(&self, topic: Topic, event: &SettlementEvent) -> usize {
        // Snapshot so handlers may (un)subscribe while being called.
        let handlers: Vec<Handler> = self
            .lock()
            .iter()
            .filter(|s| s.topic == topic)
            .map(|s| s.handler.clone())
            .collect();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(topic = topic.as_str(), error = %e, "settlement event handler failed")
                }
                Err(_) => warn!(topic = topic.as_str(), "settlement event handler panicked"),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event() -> SettlementEvent {
        SettlementEvent {
            resource_id: "t1".into(),
            transaction_ids: vec!["o1".into()],
            settled_at: Utc::now(),
        }
    }

    #[test]
    fn test_topic_name() {
        assert_eq!(Topic::SettlementCompleted.as_str(), "settlement:completed");
    }

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let notifier = Notifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["tables", "orders"] {
            let seen = seen.clone();
            notifier.subscribe(Topic::SettlementCompleted, move |e| {
                seen.lock().unwrap().push(format!("{name}:{}", e.resource_id));
                Ok(())
            });
        }
        assert_eq!(notifier.publish(Topic::SettlementCompleted, &event()), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["tables:t1", "orders:t1"]);
    }

    #[test]
    fn test_failing_handlers_do_not_block_others() {
        let notifier = Notifier::new();
        let calls = Arc::new(AtomicUsize::new(0));
        notifier.subscribe(Topic::SettlementCompleted, |_| Err("render failed".into()));
        notifier.subscribe(Topic::SettlementCompleted, |_| panic!("handler bug"));
        let counter = calls.clone();
        notifier.subscribe(Topic::SettlementCompleted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(notifier.publish(Topic::SettlementCompleted, &event()), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let notifier = Notifier::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = notifier.subscribe(Topic::SettlementCompleted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        notifier.publish(Topic::SettlementCompleted, &event());
        sub.unsubscribe();
        assert_eq!(notifier.subscriber_count(Topic::SettlementCompleted), 0);
        assert_eq!(notifier.publish(Topic::SettlementCompleted, &event()), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let notifier = Notifier::new();
        assert_eq!(notifier.publish(Topic::SettlementCompleted, &event()), 0);
    }

    #[test]
    fn test_handler_may_unsubscribe_during_dispatch() {
        let notifier = Notifier::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_for_handler = slot.clone();
        let sub = notifier.subscribe(Topic::SettlementCompleted, move |_| {
            if let Some(sub) = slot_for_handler.lock().unwrap().take() {
                sub.unsubscribe();
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(sub);

        assert_eq!(notifier.publish(Topic::SettlementCompleted, &event()), 1);
        assert_eq!(notifier.subscriber_count(Topic::SettlementCompleted), 0);
    }
}
