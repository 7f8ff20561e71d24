//! Bounded activity bus with a tokio broadcast channel for live subscribers

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::types::{into_fields, ActivityEvent, ActivityPage};

/// Number of events kept in memory
const DEFAULT_CAPACITY: usize = 2000;
/// Capacity for the broadcast channel
const CHANNEL_CAPACITY: usize = 1000;
/// Upper bound for a single page
const MAX_PAGE: usize = 500;

struct BusInner {
    history: VecDeque<ActivityEvent>,
    next_id: u64,
}

/// Process-wide feed of recent events.
///
/// Cloning is cheap and every clone shares the same history.
#[derive(Clone)]
pub struct ActivityBus {
    inner: Arc<RwLock<BusInner>>,
    sender: broadcast::Sender<ActivityEvent>,
    capacity: usize,
}

impl ActivityBus {
    /// Create a bus with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus keeping at most `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(BusInner {
                history: VecDeque::with_capacity(capacity.min(256)),
                next_id: 1,
            })),
            sender,
            capacity: capacity.max(1),
        }
    }

    /// Append an event and return its id.
    ///
    /// Ids are assigned under the write lock so they are strictly increasing
    /// in history order.
    pub fn emit(&self, event: &str, run_id: Option<&str>, fields: Value) -> u64 {
        let entry = {
            let mut inner = self.inner.write().unwrap();
            let entry = ActivityEvent {
                id: inner.next_id,
                timestamp: Utc::now(),
                event: event.to_string(),
                run_id: run_id.map(str::to_string),
                fields: into_fields(fields),
            };
            inner.next_id += 1;
            inner.history.push_back(entry.clone());
            while inner.history.len() > self.capacity {
                inner.history.pop_front();
            }
            entry
        };

        let id = entry.id;
        // No subscribers is fine; the history still has the event.
        let _ = self.sender.send(entry);
        id
    }

    /// Return up to `limit` events with `id > since_id`, optionally filtered
    /// by run. `limit` is clamped to `1..=500`.
    pub fn get(&self, run_id: Option<&str>, since_id: u64, limit: usize) -> ActivityPage {
        let limit = limit.clamp(1, MAX_PAGE);
        let inner = self.inner.read().unwrap();

        let events: Vec<ActivityEvent> = inner
            .history
            .iter()
            .filter(|e| e.id > since_id)
            .filter(|e| run_id.map_or(true, |r| e.run_id.as_deref() == Some(r)))
            .take(limit)
            .cloned()
            .collect();

        let next_since_id = events.last().map(|e| e.id).unwrap_or(since_id);
        ActivityPage {
            events,
            next_since_id,
            latest_id: inner.next_id - 1,
        }
    }

    /// Drop all history and restart ids at 1
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.history.clear();
        inner.next_id = 1;
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.sender.subscribe()
    }

    /// Buffered history followed by live events, without gaps or duplicates.
    pub fn history_plus_stream(&self) -> impl Stream<Item = ActivityEvent> + Send + 'static {
        // Subscribe before taking the snapshot so nothing emitted in between is lost.
        let rx = self.subscribe();
        let history: Vec<ActivityEvent> = self.inner.read().unwrap().history.iter().cloned().collect();
        let last_seen = history.last().map(|e| e.id).unwrap_or(0);

        let live = BroadcastStream::new(rx).filter_map(move |res| async move {
            res.ok().filter(|e| e.id > last_seen)
        });

        futures::stream::iter(history).chain(live)
    }

    /// Number of events currently buffered
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest id assigned so far (0 when nothing was emitted)
    pub fn latest_id(&self) -> u64 {
        self.inner.read().unwrap().next_id - 1
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ActivityBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActivityBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityBus")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("latest_id", &self.latest_id())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_monotonic() {
        let bus = ActivityBus::new();
        let a = bus.emit("plan_created", Some("run-1"), json!({}));
        let b = bus.emit("plan_step", Some("run-1"), json!({"status": "running"}));
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(bus.latest_id(), 2);
    }

    #[test]
    fn test_ring_is_bounded() {
        let bus = ActivityBus::with_capacity(3);
        for i in 0..5 {
            bus.emit("print", None, json!({ "i": i }));
        }

        assert_eq!(bus.len(), 3);
        let page = bus.get(None, 0, 100);
        let ids: Vec<u64> = page.events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(page.latest_id, 5);
    }

    #[test]
    fn test_get_filters_by_run_and_since_id() {
        let bus = ActivityBus::new();
        bus.emit("a", Some("run-1"), json!({}));
        bus.emit("b", Some("run-2"), json!({}));
        bus.emit("c", Some("run-1"), json!({}));
        bus.emit("d", None, json!({}));

        let page = bus.get(Some("run-1"), 0, 200);
        let names: Vec<&str> = page.events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(page.next_since_id, 3);

        let page = bus.get(Some("run-1"), 3, 200);
        assert!(page.events.is_empty());
        assert_eq!(page.next_since_id, 3);
        assert_eq!(page.latest_id, 4);
    }

    #[test]
    fn test_limit_is_clamped() {
        let bus = ActivityBus::new();
        for _ in 0..3 {
            bus.emit("tick", None, json!({}));
        }

        let page = bus.get(None, 0, 0);
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.next_since_id, 1);
    }

    #[test]
    fn test_reset_restarts_ids() {
        let bus = ActivityBus::new();
        bus.emit("a", None, json!({}));
        bus.reset();

        assert!(bus.is_empty());
        assert_eq!(bus.emit("b", None, json!({})), 1);
    }

    #[tokio::test]
    async fn test_subscribers_receive_live_events() {
        let bus = ActivityBus::new();
        let mut rx = bus.subscribe();

        bus.emit("amendment", Some("run-9"), json!({"text": "also include pricing"}));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event, "amendment");
        assert_eq!(received.field_str("text"), Some("also include pricing"));
    }

    #[tokio::test]
    async fn test_history_plus_stream() {
        let bus = ActivityBus::new();
        bus.emit("first", None, json!({}));
        bus.emit("second", None, json!({}));

        let mut stream = Box::pin(bus.history_plus_stream());
        bus.emit("third", None, json!({}));

        let mut names = Vec::new();
        for _ in 0..3 {
            names.push(stream.next().await.unwrap().event);
        }
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_clone_shares_history() {
        let bus1 = ActivityBus::new();
        let bus2 = bus1.clone();

        bus1.emit("a", None, json!({}));
        assert_eq!(bus2.len(), 1);

        let _rx = bus2.subscribe();
        assert_eq!(bus1.subscriber_count(), 1);
    }
}
