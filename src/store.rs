use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::json::JsonValue;
use crate::path::StatePath;

/// Buffered change events per subscriber before it starts lagging.
pub const CHANGE_CAPACITY: usize = 1024;

/// One path's transition within an applied diff batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub path: StatePath,
    pub old_value: Option<JsonValue>,
    pub new_value: JsonValue,
}

/// Item yielded by [`StateStore::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Changed(ChangeEvent),
    /// The subscriber fell behind and this many events were dropped; re-read
    /// the store to catch up.
    Lagged(u64),
}

/// The local mirror of the server's state tree, plus a change broadcaster.
///
/// Cloning shares the same mirror. Writes and their change events happen
/// under one lock, so a reader never observes a value whose event has not
/// been sent yet.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<RwLock<HashMap<StatePath, JsonValue>>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl StateStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    pub fn get(&self, path: &StatePath) -> Option<JsonValue> {
        self.inner.read().get(path).cloned()
    }

    pub fn contains(&self, path: &StatePath) -> bool {
        self.inner.read().contains_key(path)
    }

    /// Store a single value and broadcast its change.
    pub fn set(&self, path: StatePath, value: JsonValue) -> ChangeEvent {
        let mut inner = self.inner.write();
        self.write_locked(&mut inner, path, value)
    }

    /// Apply a diff batch in order, one change event per path. A path that
    /// appears more than once keeps its first position and its last value.
    pub fn apply<I>(&self, batch: I) -> Vec<ChangeEvent>
    where
        I: IntoIterator<Item = (StatePath, JsonValue)>,
    {
        let mut entries: Vec<(StatePath, JsonValue)> = Vec::new();
        let mut positions: HashMap<StatePath, usize> = HashMap::new();
        for (path, value) in batch {
            match positions.get(&path) {
                Some(&at) => entries[at].1 = value,
                None => {
                    positions.insert(path.clone(), entries.len());
                    entries.push((path, value));
                }
            }
        }

        let mut inner = self.inner.write();
        entries
            .into_iter()
            .map(|(path, value)| self.write_locked(&mut inner, path, value))
            .collect()
    }

    fn write_locked(
        &self,
        inner: &mut HashMap<StatePath, JsonValue>,
        path: StatePath,
        value: JsonValue,
    ) -> ChangeEvent {
        let old_value = inner.insert(path.clone(), value.clone());
        let event = ChangeEvent {
            path,
            old_value,
            new_value: value,
        };
        // Ignore error - means no subscribers
        let _ = self.changes.send(event.clone());
        event
    }

    /// Every entry whose path satisfies `predicate`, in no particular order.
    pub fn scan<F>(&self, mut predicate: F) -> Vec<(StatePath, JsonValue)>
    where
        F: FnMut(&StatePath) -> bool,
    {
        self.inner
            .read()
            .iter()
            .filter(|(path, _)| predicate(path))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect()
    }

    pub fn scan_prefix(&self, prefix: &StatePath) -> Vec<(StatePath, JsonValue)> {
        self.scan(|path| path.has_prefix(prefix))
    }

    /// A copy of the whole mirror.
    pub fn entries(&self) -> HashMap<StatePath, JsonValue> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Drop every value. No change events are sent.
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Raw receiver for callers that want `recv()` semantics.
    pub fn subscribe_receiver(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Subscribe to changes as a stream. Only changes made after this call
    /// are delivered.
    pub fn subscribe(&self) -> impl Stream<Item = StoreEvent> {
        BroadcastStream::new(self.changes.subscribe()).map(|result| match result {
            Ok(event) => StoreEvent::Changed(event),
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => {
                StoreEvent::Lagged(n)
            }
        })
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> StatePath {
        StatePath::parse(s)
    }

    #[test]
    fn set_then_get() {
        let store = StateStore::new();
        assert!(store.get(&p("Game(g1).Score")).is_none());
        store.set(p("Game(g1).Score"), JsonValue::Int(5));
        assert_eq!(store.get(&p("Game(g1).Score")), Some(JsonValue::Int(5)));
        assert!(store.contains(&p("Game(g1).Score")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn apply_reports_old_values_in_order() {
        let store = StateStore::new();
        store.set(p("A"), JsonValue::Int(1));
        let events = store.apply(vec![
            (p("B"), JsonValue::from("x")),
            (p("A"), JsonValue::Int(2)),
        ]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].path, p("B"));
        assert_eq!(events[0].old_value, None);
        assert_eq!(events[1].old_value, Some(JsonValue::Int(1)));
        assert_eq!(events[1].new_value, JsonValue::Int(2));
    }

    #[test]
    fn repeated_path_in_a_batch_emits_one_event() {
        let store = StateStore::new();
        store.set(p("A"), JsonValue::Int(1));
        let mut rx = store.subscribe_receiver();

        let events = store.apply(vec![
            (p("A"), JsonValue::Int(2)),
            (p("B"), JsonValue::Bool(true)),
            (p("A"), JsonValue::Int(3)),
        ]);

        assert_eq!(
            events,
            vec![
                ChangeEvent {
                    path: p("A"),
                    old_value: Some(JsonValue::Int(1)),
                    new_value: JsonValue::Int(3),
                },
                ChangeEvent {
                    path: p("B"),
                    old_value: None,
                    new_value: JsonValue::Bool(true),
                },
            ]
        );
        assert_eq!(store.get(&p("A")), Some(JsonValue::Int(3)));
        assert_eq!(rx.try_recv().unwrap().new_value, JsonValue::Int(3));
        assert_eq!(rx.try_recv().unwrap().path, p("B"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribers_receive_changes() {
        let store = StateStore::new();
        let mut rx1 = store.subscribe_receiver();
        let mut rx2 = store.subscribe_receiver();

        store.set(p("Game(g1).Score"), JsonValue::Int(5));

        let e1 = rx1.recv().await.expect("rx1 should receive");
        let e2 = rx2.recv().await.expect("rx2 should receive");
        assert_eq!(e1, e2);
        assert_eq!(e1.new_value, JsonValue::Int(5));
    }

    #[tokio::test]
    async fn stream_reports_lag() {
        let store = StateStore::new();
        let mut stream = Box::pin(store.subscribe());
        for i in 0..(CHANGE_CAPACITY as i64 + 10) {
            store.set(p("Clock.Time"), JsonValue::Int(i));
        }
        match stream.next().await {
            Some(StoreEvent::Lagged(n)) => assert_eq!(n, 10),
            other => panic!("expected lag notice, got {other:?}"),
        }
    }

    #[test]
    fn scan_prefix_filters() {
        let store = StateStore::new();
        store.set(p("Team(1).Name"), JsonValue::from("A"));
        store.set(p("Team(1).Score"), JsonValue::Int(3));
        store.set(p("Team(2).Name"), JsonValue::from("B"));
        let mut found: Vec<_> = store
            .scan_prefix(&p("Team(1)"))
            .into_iter()
            .map(|(path, _)| path.to_string())
            .collect();
        found.sort();
        assert_eq!(found, vec!["Team(1).Name", "Team(1).Score"]);
    }

    #[test]
    fn clear_empties_the_mirror() {
        let store = StateStore::new();
        let clone = store.clone();
        store.set(p("A"), JsonValue::Null);
        clone.clear();
        assert!(store.is_empty());
    }
}
