//! In-memory source that behaves like a tiny API server: monotonically
//! increasing versions, a replayable change history, compaction, and
//! controllable disconnects. Used for demos and end-to-end tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::channel::mpsc;
use futures::StreamExt;
use kmirror_core::{Error, ListerWatcher, ObjectKey, ObjectList, Resource, Result, Selector, WatchEvent, WatchStream};
use tracing::debug;

type Sink = mpsc::UnboundedSender<Result<WatchEvent>>;

#[derive(Default)]
struct Inner {
    rv: u64,
    objects: BTreeMap<ObjectKey, Resource>,
    history: Vec<(u64, WatchEvent)>,
    /// Watches resuming from before this version get `Expired`.
    compacted_at: u64,
    watchers: Vec<Sink>,
    failing_lists: u32,
    list_calls: u32,
    watch_calls: u32,
}

impl Inner {
    fn broadcast(&mut self, item: Result<WatchEvent>) {
        self.watchers.retain(|tx| tx.unbounded_send(item.clone()).is_ok());
    }

    fn record(&mut self, ev: WatchEvent) {
        self.history.push((self.rv, ev.clone()));
        self.broadcast(Ok(ev));
    }
}

pub struct MemorySource {
    kind: String,
    inner: Mutex<Inner>,
}

impl MemorySource {
    pub fn new(kind: &str) -> Self {
        Self { kind: kind.to_string(), inner: Mutex::new(Inner::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace an object; emits `Added` or `Modified`.
    pub fn upsert(&self, key: ObjectKey, body: serde_json::Value) -> Resource {
        let mut inner = self.lock();
        inner.rv += 1;
        let rv = inner.rv.to_string();
        let mut body = if body.is_object() { body } else { serde_json::json!({}) };
        body["kind"] = self.kind.clone().into();
        body["metadata"]["name"] = key.name.clone().into();
        if let Some(ns) = &key.namespace {
            body["metadata"]["namespace"] = ns.clone().into();
        }
        body["metadata"]["resourceVersion"] = rv.clone().into();
        let obj = Resource::new(&self.kind, key.clone(), &rv, body);
        let existed = inner.objects.insert(key, obj.clone()).is_some();
        let ev = if existed { WatchEvent::Modified(obj.clone()) } else { WatchEvent::Added(obj.clone()) };
        inner.record(ev);
        obj
    }

    /// Remove an object; emits `Deleted` carrying its final state.
    pub fn delete(&self, key: &ObjectKey) -> Option<Resource> {
        let mut inner = self.lock();
        let mut obj = inner.objects.remove(key)?;
        inner.rv += 1;
        let rv = inner.rv.to_string();
        obj.resource_version = rv.clone();
        obj.raw["metadata"]["resourceVersion"] = rv.into();
        inner.record(WatchEvent::Deleted(obj.clone()));
        Some(obj)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Resource> {
        self.lock().objects.get(key).cloned()
    }

    pub fn resource_version(&self) -> String {
        self.lock().rv.to_string()
    }

    /// End every open watch stream, as a dropped connection would.
    pub fn disconnect_watches(&self) {
        let n = {
            let mut inner = self.lock();
            let n = inner.watchers.len();
            inner.watchers.clear();
            n
        };
        debug!(watchers = n, "watches disconnected");
    }

    /// Forget the change history; resuming from an older version now fails
    /// with `Expired`.
    pub fn compact(&self) {
        let mut inner = self.lock();
        inner.history.clear();
        inner.compacted_at = inner.rv;
    }

    /// Deliver an in-band error event to every open watch.
    pub fn inject_watch_error(&self, err: Error) {
        self.lock().broadcast(Ok(WatchEvent::Error(err)));
    }

    /// Deliver an undecodable item to every open watch.
    pub fn inject_malformed(&self, what: &str) {
        self.lock().broadcast(Err(Error::Malformed(what.to_string())));
    }

    /// Make the next `n` list calls fail with a connection error.
    pub fn fail_next_lists(&self, n: u32) {
        self.lock().failing_lists = n;
    }

    pub fn list_calls(&self) -> u32 {
        self.lock().list_calls
    }

    pub fn watch_calls(&self) -> u32 {
        self.lock().watch_calls
    }

    /// Watches still attached.
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|tx| !tx.is_closed());
        inner.watchers.len()
    }
}

// Selectors are not evaluated: every object matches.
#[async_trait::async_trait]
impl ListerWatcher for MemorySource {
    async fn list(&self, _selector: &Selector) -> Result<ObjectList> {
        let mut inner = self.lock();
        inner.list_calls += 1;
        if inner.failing_lists > 0 {
            inner.failing_lists -= 1;
            return Err(Error::Connection("list refused".into()));
        }
        Ok(ObjectList { items: inner.objects.values().cloned().collect(), resource_version: inner.rv.to_string() })
    }

    async fn watch(&self, _selector: &Selector, since: &str) -> Result<WatchStream> {
        let since: u64 = if since.is_empty() {
            0
        } else {
            since.parse().map_err(|_| Error::Expired(format!("unknown resource version {since:?}")))?
        };
        let mut inner = self.lock();
        inner.watch_calls += 1;
        if since < inner.compacted_at {
            return Err(Error::Expired(format!("{since} is older than {}", inner.compacted_at)));
        }
        let (tx, rx) = mpsc::unbounded();
        for (rv, ev) in &inner.history {
            if *rv > since {
                let _ = tx.unbounded_send(Ok(ev.clone()));
            }
        }
        inner.watchers.push(tx);
        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn watch_replays_history_after_version() {
        let src = MemorySource::new("ConfigMap");
        let a = ObjectKey::new(Some("ns"), "a");
        src.upsert(a.clone(), json!({ "data": { "v": "1" } }));
        let list = src.list(&Selector::everything()).await.unwrap();
        assert_eq!(list.resource_version, "1");
        assert_eq!(list.items[0].field("data.v"), Some(&json!("1")));

        src.upsert(a.clone(), json!({ "data": { "v": "2" } }));
        src.delete(&a);
        let mut w = src.watch(&Selector::everything(), "1").await.unwrap();
        assert!(matches!(w.next().await, Some(Ok(WatchEvent::Modified(o))) if o.resource_version == "2"));
        assert!(matches!(w.next().await, Some(Ok(WatchEvent::Deleted(o))) if o.resource_version == "3"));

        src.disconnect_watches();
        assert!(w.next().await.is_none());
    }

    #[tokio::test]
    async fn compaction_expires_old_versions() {
        let src = MemorySource::new("ConfigMap");
        src.upsert(ObjectKey::new(Some("ns"), "a"), json!({}));
        src.upsert(ObjectKey::new(Some("ns"), "b"), json!({}));
        src.compact();
        assert!(matches!(src.watch(&Selector::everything(), "1").await, Err(Error::Expired(_))));
        assert!(src.watch(&Selector::everything(), "2").await.is_ok());
    }

    #[tokio::test]
    async fn failing_lists() {
        let src = MemorySource::new("ConfigMap");
        src.fail_next_lists(1);
        assert!(src.list(&Selector::everything()).await.is_err());
        assert!(src.list(&Selector::everything()).await.is_ok());
        assert_eq!(src.list_calls(), 2);
    }
}
