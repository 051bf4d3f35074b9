use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kmirror_core::{Delta, DeltaType, Deltas, Error, ObjectKey, ObjectStore, Resource, Result};
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

#[derive(Debug, thiserror::Error)]
pub enum PopError {
    #[error("queue closed")]
    Closed,
    #[error("processing {key} failed (attempt {failures}): {source}")]
    Process {
        key: ObjectKey,
        failures: u32,
        #[source]
        source: Error,
    },
}

#[derive(Default)]
struct Pending {
    deltas: Deltas,
    /// Consecutive failed deliveries of the leading `failed` deltas.
    failures: u32,
    failed: usize,
}

/// Key handed to the consumer by the running `pop`.
struct InFlight {
    key: ObjectKey,
    /// Newest object in the batch, unless the batch ends in a delete.
    last: Option<Resource>,
}

#[derive(Default)]
struct State {
    items: FxHashMap<ObjectKey, Pending>,
    /// Keys in arrival order. May hold keys whose entry was collapsed away;
    /// `take_next` skips those.
    order: VecDeque<ObjectKey>,
    in_flight: Option<InFlight>,
    populated: bool,
    replaced_once: bool,
    /// Keys queued by the first `replace` not yet processed successfully.
    initial: FxHashSet<ObjectKey>,
    closed: bool,
}

impl State {
    fn take_next(&mut self) -> Option<(ObjectKey, Pending)> {
        while let Some(key) = self.order.pop_front() {
            if let Some(p) = self.items.remove(&key) {
                let last = p.deltas.last().filter(|d| !d.is_delete()).map(|d| d.object.clone());
                self.in_flight = Some(InFlight { key: key.clone(), last });
                return Some((key, p));
            }
        }
        None
    }

    fn is_in_flight(&self, key: &ObjectKey) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.key == *key)
    }

    fn synced(&self) -> bool {
        self.populated && self.initial.is_empty()
    }
}

/// Ordered queue of pending deltas, one list per key.
///
/// Producers call [`DeltaFifo::add`] (or the [`ObjectStore`] methods) from any
/// task. A single consumer drains it with [`DeltaFifo::pop`]. Deltas for one
/// key are delivered in the order they were added; keys are served roughly in
/// arrival order with no cross-key guarantee.
///
/// `known` is the consumer's view (its client store). It decides whether a
/// delete refers to something the consumer has seen and which keys a re-list
/// must report as gone.
pub struct DeltaFifo {
    state: Mutex<State>,
    notify: Notify,
    synced: watch::Sender<bool>,
    known: Option<Arc<dyn ObjectStore>>,
}

impl DeltaFifo {
    pub fn new(known: Option<Arc<dyn ObjectStore>>) -> Self {
        let (synced, _) = watch::channel(false);
        Self { state: Mutex::new(State::default()), notify: Notify::new(), synced, known }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the sync flag once the initial list has been consumed.
    fn publish_sync(&self, st: &State) {
        if st.synced() && !*self.synced.borrow() {
            self.synced.send_replace(true);
            debug!("initial list delivered");
        }
    }

    /// Append a delta for `obj`'s key. Never blocks on capacity.
    pub fn add(&self, obj: Resource, kind: DeltaType) {
        let mut st = self.lock();
        st.populated = true;
        if kind == DeltaType::Deleted && !st.items.contains_key(&obj.key) {
            if let Some(known) = &self.known {
                if known.get(&obj.key).is_none() && !st.is_in_flight(&obj.key) {
                    trace!(key = %obj.key, "delete for unknown object ignored");
                    self.publish_sync(&st);
                    return;
                }
            }
        }
        self.queue_locked(&mut st, Delta::new(kind, obj));
        self.publish_sync(&st);
    }

    fn queue_locked(&self, st: &mut State, delta: Delta) {
        let key = delta.object.key.clone();
        if delta.is_delete() && self.collapses(st, &key) {
            st.items.remove(&key);
            st.initial.remove(&key);
            counter!("kmirror_fifo_collapsed_total").increment(1);
            debug!(key = %key, "added and deleted before delivery; dropped");
            gauge!("kmirror_fifo_pending").set(st.items.len() as f64);
            self.publish_sync(st);
            return;
        }
        let mut fresh = false;
        let entry = st.items.entry(key.clone()).or_insert_with(|| {
            fresh = true;
            Pending::default()
        });
        entry.deltas.push(delta);
        dedup_deletes(&mut entry.deltas, entry.failed);
        entry.failed = entry.failed.min(entry.deltas.len());
        if fresh {
            st.order.push_back(key);
            self.notify.notify_one();
        }
        gauge!("kmirror_fifo_pending").set(st.items.len() as f64);
    }

    /// A delete makes the pending work for `key` vanish when the consumer has
    /// never seen the object and cannot be midway through seeing it.
    fn collapses(&self, st: &State, key: &ObjectKey) -> bool {
        let Some(p) = st.items.get(key) else { return false };
        if p.deltas.is_empty() || p.failed > 0 || st.is_in_flight(key) {
            return false;
        }
        if p.deltas.iter().any(Delta::is_delete) {
            return false;
        }
        match &self.known {
            Some(known) => known.get(key).is_none(),
            None => p.deltas[0].kind == DeltaType::Added,
        }
    }

    /// Wait for a key with pending deltas, take its whole list and hand it to
    /// `process`. If `process` fails the list goes back in front of anything
    /// queued for the key in the meantime.
    ///
    /// Only one task may pop at a time. Cancel-safe: nothing is taken from the
    /// queue until the wait is over.
    pub async fn pop<F>(&self, process: F) -> std::result::Result<(), PopError>
    where
        F: FnOnce(&ObjectKey, &[Delta]) -> Result<()>,
    {
        let (key, pending) = loop {
            let next = {
                let mut st = self.lock();
                if st.closed {
                    return Err(PopError::Closed);
                }
                let next = st.take_next();
                gauge!("kmirror_fifo_pending").set(st.items.len() as f64);
                next
            };
            match next {
                Some(found) => break found,
                None => self.notify.notified().await,
            }
        };

        let result = process(&key, &pending.deltas);

        let mut st = self.lock();
        st.in_flight = None;
        let Err(source) = result else {
            st.initial.remove(&key);
            self.publish_sync(&st);
            return Ok(());
        };

        let failures = pending.failures.saturating_add(1);
        let failed = pending.deltas.len();
        let mut deltas = pending.deltas;
        match st.items.remove(&key) {
            Some(newer) => deltas.extend(newer.deltas),
            None => st.order.push_back(key.clone()),
        }
        st.items.insert(key.clone(), Pending { deltas, failures, failed });
        counter!("kmirror_fifo_requeued_total").increment(1);
        drop(st);
        self.notify.notify_one();
        Err(PopError::Process { key, failures, source })
    }

    /// Drop the deltas whose delivery failed for `key`, keeping anything that
    /// arrived after them.
    pub fn discard_failed(&self, key: &ObjectKey) -> usize {
        let mut st = self.lock();
        let Some(p) = st.items.get_mut(key) else { return 0 };
        let n = p.failed.min(p.deltas.len());
        p.deltas.drain(..n);
        p.failed = 0;
        p.failures = 0;
        if p.deltas.is_empty() {
            st.items.remove(key);
            st.initial.remove(key);
        }
        self.publish_sync(&st);
        n
    }

    /// Reconcile against a fresh list: a `Sync` for every listed object not
    /// already pending at that version, a tombstone for every pending, known or
    /// in-flight key the list no longer contains.
    pub fn replace(&self, items: Vec<Resource>, resource_version: &str) {
        let mut st = self.lock();
        st.populated = true;
        let listed: FxHashSet<ObjectKey> = items.iter().map(|o| o.key.clone()).collect();
        let (mut synced, mut skipped, mut gone) = (0usize, 0usize, 0usize);

        for obj in items {
            let already = st
                .items
                .get(&obj.key)
                .and_then(|p| p.deltas.last())
                .is_some_and(|d| {
                    !d.is_delete()
                        && !obj.resource_version.is_empty()
                        && d.object.resource_version == obj.resource_version
                });
            if already {
                skipped += 1;
                continue;
            }
            self.queue_locked(&mut st, Delta::new(DeltaType::Sync, obj));
            synced += 1;
        }

        let vanished: Vec<Resource> = st
            .items
            .iter()
            .filter(|(k, _)| !listed.contains(*k))
            .filter_map(|(_, p)| p.deltas.last().filter(|d| !d.is_delete()).map(|d| d.object.clone()))
            .collect();
        for obj in vanished {
            self.queue_locked(&mut st, Delta::tombstone(obj));
            gone += 1;
        }

        if let Some(known) = &self.known {
            for key in known.list_keys() {
                if listed.contains(&key) || st.items.contains_key(&key) {
                    continue;
                }
                if let Some(obj) = known.get(&key) {
                    self.queue_locked(&mut st, Delta::tombstone(obj));
                    gone += 1;
                }
            }
        }

        // The consumer is about to record the in-flight object; it must hear
        // that the object is gone even though the known store lacks it yet.
        let in_flight = st
            .in_flight
            .as_ref()
            .filter(|f| !listed.contains(&f.key) && !st.items.contains_key(&f.key))
            .and_then(|f| f.last.clone());
        if let Some(obj) = in_flight {
            self.queue_locked(&mut st, Delta::tombstone(obj));
            gone += 1;
        }

        if !st.replaced_once {
            st.replaced_once = true;
            st.initial = st.items.keys().cloned().collect();
        }
        self.publish_sync(&st);
        debug!(rv = %resource_version, synced, skipped, gone, "queue replaced");
    }

    /// True once the first list has been fully processed.
    pub fn has_synced(&self) -> bool {
        self.lock().synced()
    }

    /// Resolve once `has_synced` turns true.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // the sender lives as long as `self`
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Wake the consumer; every later `pop` returns `PopError::Closed`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of keys with pending deltas.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending deltas for `key`, oldest first.
    pub fn pending(&self, key: &ObjectKey) -> Option<Deltas> {
        self.lock().items.get(key).map(|p| p.deltas.clone())
    }
}

/// Two deletes in a row say the same thing; keep the one that knows the final
/// state, preferring the newer. A delete inside the failed prefix is left
/// alone so that discarding the prefix cannot take the newer one with it.
fn dedup_deletes(deltas: &mut Deltas, failed: usize) {
    let n = deltas.len();
    if n < 2 || n - 2 < failed || !(deltas[n - 1].is_delete() && deltas[n - 2].is_delete()) {
        return;
    }
    if let Some(newest) = deltas.pop() {
        if !newest.final_state_unknown {
            deltas[n - 2] = newest;
        }
    }
}

impl ObjectStore for DeltaFifo {
    fn add(&self, obj: Resource) -> Result<()> {
        DeltaFifo::add(self, obj, DeltaType::Added);
        Ok(())
    }

    fn update(&self, obj: Resource) -> Result<()> {
        DeltaFifo::add(self, obj, DeltaType::Updated);
        Ok(())
    }

    fn delete(&self, obj: Resource) -> Result<()> {
        DeltaFifo::add(self, obj, DeltaType::Deleted);
        Ok(())
    }

    /// Newest pending state of the object.
    fn get(&self, key: &ObjectKey) -> Option<Resource> {
        self.lock().items.get(key).and_then(|p| p.deltas.last()).map(|d| d.object.clone())
    }

    fn list_keys(&self) -> Vec<ObjectKey> {
        self.lock().items.keys().cloned().collect()
    }

    fn replace(&self, items: Vec<Resource>, resource_version: &str) -> Result<()> {
        DeltaFifo::replace(self, items, resource_version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use serde_json::json;

    fn obj(name: &str, rv: &str) -> Resource {
        Resource::new("ConfigMap", ObjectKey::new(Some("ns"), name), rv, json!({ "data": rv }))
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(Some("ns"), name)
    }

    fn kinds(d: &[Delta]) -> Vec<DeltaType> {
        d.iter().map(|d| d.kind).collect()
    }

    async fn pop_all(q: &DeltaFifo) -> Vec<(ObjectKey, Vec<DeltaType>, Vec<String>)> {
        let mut out = Vec::new();
        while !q.is_empty() {
            q.pop(|k, d| {
                out.push((k.clone(), kinds(d), d.iter().map(|d| d.object.resource_version.clone()).collect()));
                Ok(())
            })
            .await
            .unwrap();
        }
        out
    }

    #[tokio::test]
    async fn added_then_deleted_leaves_nothing() {
        let q = DeltaFifo::new(None);
        q.add(obj("a", "1"), DeltaType::Added);
        q.add(obj("a", "2"), DeltaType::Updated);
        q.add(obj("a", "3"), DeltaType::Deleted);
        assert!(q.is_empty());
        assert!(q.pending(&key("a")).is_none());
    }

    #[tokio::test]
    async fn delete_of_seen_object_is_kept() {
        let known = Arc::new(Store::new());
        known.add(obj("a", "1"));
        let q = DeltaFifo::new(Some(known.clone()));
        q.add(obj("a", "2"), DeltaType::Updated);
        q.add(obj("a", "3"), DeltaType::Deleted);
        assert_eq!(kinds(&q.pending(&key("a")).unwrap()), vec![DeltaType::Updated, DeltaType::Deleted]);
    }

    #[tokio::test]
    async fn delete_of_unknown_object_is_ignored() {
        let q = DeltaFifo::new(Some(Arc::new(Store::new())));
        q.add(obj("ghost", "9"), DeltaType::Deleted);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn consecutive_deletes_collapse() {
        let known = Arc::new(Store::new());
        known.add(obj("a", "1"));
        let q = DeltaFifo::new(Some(known.clone()));
        q.add(obj("a", "2"), DeltaType::Deleted);
        q.add(obj("a", "3"), DeltaType::Deleted);
        let p = q.pending(&key("a")).unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].object.resource_version, "3");

        // an inferred delete never replaces one with a known final state
        q.queue_locked(&mut q.lock(), Delta::tombstone(obj("a", "1")));
        let p = q.pending(&key("a")).unwrap();
        assert_eq!(p.len(), 1);
        assert!(!p[0].final_state_unknown);
        assert_eq!(p[0].object.resource_version, "3");
    }

    #[tokio::test]
    async fn per_key_order_survives_interleaving() {
        let q = DeltaFifo::new(None);
        q.add(obj("a", "1"), DeltaType::Added);
        q.add(obj("b", "2"), DeltaType::Added);
        q.add(obj("a", "3"), DeltaType::Updated);
        q.add(obj("b", "4"), DeltaType::Updated);
        q.add(obj("a", "5"), DeltaType::Updated);
        let popped = pop_all(&q).await;
        assert_eq!(popped.len(), 2);
        let a = popped.iter().find(|(k, _, _)| *k == key("a")).unwrap();
        assert_eq!(a.2, vec!["1", "3", "5"]);
        let b = popped.iter().find(|(k, _, _)| *k == key("b")).unwrap();
        assert_eq!(b.1, vec![DeltaType::Added, DeltaType::Updated]);
    }

    #[tokio::test]
    async fn failed_process_keeps_deltas_in_front() {
        let q = DeltaFifo::new(None);
        q.add(obj("a", "1"), DeltaType::Added);
        let err = q
            .pop(|_, _| {
                // a producer races in while processing
                q.add(obj("a", "2"), DeltaType::Updated);
                Err(Error::Store("disk full".into()))
            })
            .await
            .unwrap_err();
        match err {
            PopError::Process { key: k, failures, .. } => {
                assert_eq!(k, key("a"));
                assert_eq!(failures, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        let popped = pop_all(&q).await;
        assert_eq!(popped, vec![(key("a"), vec![DeltaType::Added, DeltaType::Updated], vec!["1".into(), "2".into()])]);
    }

    #[tokio::test]
    async fn discard_failed_keeps_newer_deltas() {
        let q = DeltaFifo::new(None);
        q.add(obj("a", "1"), DeltaType::Added);
        let _ = q.pop(|_, _| Err(Error::Store("nope".into()))).await;
        q.add(obj("a", "2"), DeltaType::Updated);
        assert_eq!(q.discard_failed(&key("a")), 1);
        let popped = pop_all(&q).await;
        assert_eq!(popped, vec![(key("a"), vec![DeltaType::Updated], vec!["2".into()])]);
    }

    #[tokio::test]
    async fn replace_emits_sync_and_tombstones() {
        let known = Arc::new(Store::new());
        known.add(obj("a", "1"));
        known.add(obj("gone", "2"));
        let q = DeltaFifo::new(Some(known.clone()));
        q.add(obj("b", "5"), DeltaType::Added);

        q.replace(vec![obj("a", "1"), obj("b", "5"), obj("c", "6")], "6");

        assert_eq!(kinds(&q.pending(&key("a")).unwrap()), vec![DeltaType::Sync]);
        // b is already pending at version 5
        assert_eq!(kinds(&q.pending(&key("b")).unwrap()), vec![DeltaType::Added]);
        assert_eq!(kinds(&q.pending(&key("c")).unwrap()), vec![DeltaType::Sync]);
        let gone = q.pending(&key("gone")).unwrap();
        assert_eq!(gone.len(), 1);
        assert!(gone[0].is_delete() && gone[0].final_state_unknown);
        assert_eq!(gone[0].object.resource_version, "2");
    }

    #[tokio::test]
    async fn replace_drops_pending_unseen_objects() {
        let q = DeltaFifo::new(Some(Arc::new(Store::new())));
        q.add(obj("tmp", "3"), DeltaType::Added);
        q.replace(vec![], "4");
        assert!(q.is_empty());
        assert!(q.has_synced());
    }

    #[tokio::test]
    async fn has_synced_after_initial_list_drained() {
        let q = DeltaFifo::new(Some(Arc::new(Store::new())));
        assert!(!q.has_synced());
        q.replace(vec![obj("a", "1"), obj("b", "2")], "2");
        assert!(!q.has_synced());
        q.pop(|_, _| Ok(())).await.unwrap();
        assert!(!q.has_synced());
        q.pop(|_, _| Ok(())).await.unwrap();
        assert!(q.has_synced());
    }

    #[tokio::test]
    async fn failed_initial_delivery_is_not_synced() {
        let q = DeltaFifo::new(Some(Arc::new(Store::new())));
        q.replace(vec![obj("a", "1")], "1");
        let _ = q.pop(|_, _| Err(Error::Store("unavailable".into()))).await;
        assert!(!q.has_synced());
        q.pop(|_, _| Ok(())).await.unwrap();
        assert!(q.has_synced());
    }

    #[tokio::test]
    async fn waiters_wake_when_initial_list_is_processed() {
        let q = Arc::new(DeltaFifo::new(Some(Arc::new(Store::new()))));
        q.replace(vec![obj("a", "1")], "1");
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.wait_synced().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        q.pop(|_, _| Ok(())).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter).await.unwrap().unwrap();
        // already synced: returns at once
        q.wait_synced().await;
    }

    #[tokio::test]
    async fn newer_delete_survives_discarding_failed_delete() {
        let known = Arc::new(Store::new());
        known.add(obj("a", "1"));
        let q = DeltaFifo::new(Some(known.clone()));
        q.add(obj("a", "2"), DeltaType::Deleted);
        let _ = q.pop(|_, _| Err(Error::Store("nope".into()))).await;
        q.add(obj("a", "3"), DeltaType::Deleted);
        assert_eq!(q.pending(&key("a")).unwrap().len(), 2);

        assert_eq!(q.discard_failed(&key("a")), 1);
        let p = q.pending(&key("a")).unwrap();
        assert_eq!(kinds(&p), vec![DeltaType::Deleted]);
        assert_eq!(p[0].object.resource_version, "3");
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let q = Arc::new(DeltaFifo::new(None));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.pop(|_, _| Ok(())).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.close();
        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(PopError::Closed)));
    }
}
