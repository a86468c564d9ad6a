//! Subscription registry for stats notifications

use reqstats_common::StatsResult;
use std::sync::{Arc, Mutex};
use tracing::trace;

use crate::lock;
use crate::recorder::RecorderHandle;

/// Notification published by a [`ServerStatsHub`](crate::hub::ServerStatsHub)
#[derive(Debug, Clone)]
pub enum StatsEvent {
    /// A request started; the handle can be polled for progress
    Request(RecorderHandle),
    /// A request produced its result
    Complete(Arc<StatsResult>),
}

impl StatsEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StatsEvent::Request(_) => EventKind::Request,
            StatsEvent::Complete(_) => EventKind::Complete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Request,
    Complete,
}

/// Token returned by a subscription, used to cancel it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&StatsEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    once: bool,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Publish/subscribe surface for [`StatsEvent`]s.
///
/// Clones share one registry. A subscription lives until it is cancelled
/// with [`unsubscribe`](Self::unsubscribe) or, for [`once`](Self::once),
/// until its first delivery.
#[derive(Clone, Default)]
pub struct StatsEvents {
    registry: Arc<Mutex<Registry>>,
}

impl StatsEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&StatsEvent) + Send + Sync + 'static,
    {
        self.register(kind, false, Arc::new(callback))
    }

    /// Subscribe for a single delivery
    pub fn once<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&StatsEvent) + Send + Sync + 'static,
    {
        self.register(kind, true, Arc::new(callback))
    }

    pub fn on_request<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&RecorderHandle) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Request, move |event| {
            if let StatsEvent::Request(handle) = event {
                callback(handle);
            }
        })
    }

    pub fn on_complete<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StatsResult) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Complete, move |event| {
            if let StatsEvent::Complete(result) = event {
                callback(result.as_ref());
            }
        })
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = lock(&self.registry);
        let before = registry.subscribers.len();
        registry.subscribers.retain(|s| s.id != id);
        registry.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).subscribers.len()
    }

    /// Deliver `event` to every matching subscriber; returns how many ran.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe themselves. One-shot subscribers are removed before any
    /// callback runs.
    pub fn publish(&self, event: &StatsEvent) -> usize {
        let kind = event.kind();
        let callbacks: Vec<Callback> = {
            let mut registry = lock(&self.registry);
            let callbacks = registry
                .subscribers
                .iter()
                .filter(|s| s.kind == kind)
                .map(|s| s.callback.clone())
                .collect();
            registry.subscribers.retain(|s| !(s.once && s.kind == kind));
            callbacks
        };

        trace!(?kind, subscribers = callbacks.len(), "Publishing stats event");
        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }

    fn register(&self, kind: EventKind, once: bool, callback: Callback) -> SubscriptionId {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.subscribers.push(Subscriber {
            id,
            kind,
            once,
            callback,
        });
        id
    }
}

impl std::fmt::Debug for StatsEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsEvents")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqstats_common::{Headers, RequestStats, ResponseStats};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn complete_event() -> StatsEvent {
        StatsEvent::Complete(Arc::new(StatsResult {
            ok: true,
            elapsed_ms: 3,
            request: RequestStats {
                bytes: 10,
                headers: Headers::new(),
                method: "GET".to_string(),
                path: "/".to_string(),
            },
            response: ResponseStats {
                bytes: 20,
                headers: Headers::new(),
                status: 200,
            },
        }))
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&StatsEvent) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, move |_: &StatsEvent| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let events = StatsEvents::new();
        let (count, callback) = counter();
        let id = events.subscribe(EventKind::Complete, callback);

        assert_eq!(events.publish(&complete_event()), 1);
        assert_eq!(events.publish(&complete_event()), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(events.unsubscribe(id));
        assert!(!events.unsubscribe(id));
        assert_eq!(events.publish(&complete_event()), 0);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let events = StatsEvents::new();
        let (count, callback) = counter();
        events.once(EventKind::Complete, callback);
        assert_eq!(events.subscriber_count(), 1);

        events.publish(&complete_event());
        events.publish(&complete_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(events.subscriber_count(), 0);
    }

    #[test]
    fn test_kind_filtering() {
        let events = StatsEvents::new();
        let (count, callback) = counter();
        events.once(EventKind::Request, callback);

        assert_eq!(events.publish(&complete_event()), 0);
        // a non-matching event must not consume the one-shot subscription
        assert_eq!(events.subscriber_count(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_on_complete_receives_result() {
        let events = StatsEvents::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.on_complete(move |result| sink.lock().unwrap().push(result.response.bytes));

        events.publish(&complete_event());
        assert_eq!(*seen.lock().unwrap(), vec![20]);
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let events = StatsEvents::new();
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let (count, bump) = counter();

        let inner_events = events.clone();
        let inner_slot = slot.clone();
        let id = events.subscribe(EventKind::Complete, move |event| {
            bump(event);
            if let Some(id) = *inner_slot.lock().unwrap() {
                inner_events.unsubscribe(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        events.publish(&complete_event());
        events.publish(&complete_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
