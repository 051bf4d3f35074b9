#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kmirror_core::{DeltaType, ObjectKey, WatchConfig};
use kmirror_kubehub::{MemorySource, Reflector};
use kmirror_store::{DeltaFifo, Store};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn key(name: &str) -> ObjectKey {
    ObjectKey::new(Some("default"), name)
}

fn fast_config() -> WatchConfig {
    WatchConfig {
        backoff_initial: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        ..WatchConfig::default()
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn names(store: &Store) -> Vec<String> {
    store.list_keys().into_iter().map(|k| k.name).collect()
}

struct Running {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.token.cancel();
        self.handle.await.unwrap();
    }
}

fn start(src: &Arc<MemorySource>, store: Arc<Store>, cfg: WatchConfig) -> Running {
    let token = CancellationToken::new();
    let reflector = Reflector::new("test", src.clone(), store, &cfg);
    let handle = tokio::spawn(reflector.run(token.clone()));
    Running { token, handle }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lists_then_follows_watch() {
    let src = Arc::new(MemorySource::new("Pod"));
    src.upsert(key("a"), json!({}));
    src.upsert(key("b"), json!({}));
    let store = Arc::new(Store::new());
    let run = start(&src, store.clone(), fast_config());

    eventually("initial list", || store.len() == 2).await;
    assert_eq!(store.last_sync_resource_version(), "2");

    src.upsert(key("c"), json!({ "status": { "phase": "Running" } }));
    src.delete(&key("a"));
    eventually("watch events", || names(&store) == ["b", "c"]).await;
    let c = store.get(&key("c")).unwrap();
    assert_eq!(c.field("status.phase"), Some(&json!("Running")));

    run.stop().await;
    assert_eq!(src.list_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relists_after_disconnect() {
    let src = Arc::new(MemorySource::new("Pod"));
    src.upsert(key("a"), json!({}));
    src.upsert(key("gone"), json!({}));
    let store = Arc::new(Store::new());
    let run = start(&src, store.clone(), fast_config());
    eventually("watch attached", || src.watcher_count() == 1 && store.len() == 2).await;

    src.disconnect_watches();
    src.delete(&key("gone"));
    src.upsert(key("b"), json!({}));
    eventually("state after reconnect", || names(&store) == ["a", "b"]).await;

    run.stop().await;
    assert!(src.list_calls() >= 2);
    assert!(src.watch_calls() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relists_when_resume_version_expired() {
    let src = Arc::new(MemorySource::new("Pod"));
    src.upsert(key("a"), json!({}));
    src.upsert(key("b"), json!({}));
    let store = Arc::new(Store::new());
    // slow enough that the history is compacted before the re-list
    let cfg = WatchConfig { backoff_initial: Duration::from_millis(200), ..fast_config() };
    let run = start(&src, store.clone(), cfg);
    eventually("watch attached", || src.watcher_count() == 1 && store.len() == 2).await;

    src.disconnect_watches();
    src.delete(&key("b"));
    src.compact();
    eventually("re-list drops b", || names(&store) == ["a"]).await;

    run.stop().await;
    assert!(src.list_calls() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_error_event_forces_relist() {
    let src = Arc::new(MemorySource::new("Pod"));
    src.upsert(key("a"), json!({}));
    let store = Arc::new(Store::new());
    let run = start(&src, store.clone(), fast_config());
    eventually("watch attached", || src.watcher_count() == 1).await;

    src.inject_watch_error(kmirror_core::Error::Expired("too old resource version".into()));
    eventually("second list", || src.list_calls() >= 2).await;
    run.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retries_failed_lists() {
    let src = Arc::new(MemorySource::new("Pod"));
    src.upsert(key("a"), json!({}));
    src.fail_next_lists(2);
    let store = Arc::new(Store::new());
    let run = start(&src, store.clone(), fast_config());

    eventually("list after retries", || store.len() == 1).await;
    run.stop().await;
    assert_eq!(src.list_calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_events_are_skipped() {
    let src = Arc::new(MemorySource::new("Pod"));
    let store = Arc::new(Store::new());
    let run = start(&src, store.clone(), fast_config());
    eventually("watch attached", || src.watcher_count() == 1).await;

    src.inject_malformed("object missing metadata.name");
    src.upsert(key("a"), json!({}));
    eventually("event after malformed one", || store.len() == 1).await;

    run.stop().await;
    assert_eq!(src.watch_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn periodic_resync_relists_healthy_watch() {
    let src = Arc::new(MemorySource::new("Pod"));
    src.upsert(key("a"), json!({}));
    let store = Arc::new(Store::new());
    let cfg = WatchConfig { resync_period: Duration::from_millis(50), ..fast_config() };
    let run = start(&src, store.clone(), cfg);

    eventually("several re-lists", || src.list_calls() >= 3).await;
    run.stop().await;
    assert_eq!(store.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unexpected_kind_is_skipped() {
    let src = Arc::new(MemorySource::new("ConfigMap"));
    src.upsert(key("a"), json!({}));
    let store = Arc::new(Store::new());
    let token = CancellationToken::new();
    let reflector = Reflector::new("kinds", src.clone(), store.clone(), &fast_config()).with_expected_kind("Pod");
    let version = reflector.sync_version();
    let handle = tokio::spawn(reflector.run(token.clone()));

    eventually("list done", || version.get().as_str() == "1").await;
    eventually("watch attached", || src.watcher_count() == 1).await;
    src.upsert(key("b"), json!({}));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.is_empty());
    // skipped events do not advance the resume point
    assert_eq!(version.get().as_str(), "1");

    token.cancel();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn feeds_delta_queue() {
    let src = Arc::new(MemorySource::new("Pod"));
    src.upsert(key("a"), json!({}));
    let known = Arc::new(Store::new());
    let fifo = Arc::new(DeltaFifo::new(Some(known.clone())));
    let token = CancellationToken::new();
    let handle = tokio::spawn(Reflector::new("fifo", src.clone(), fifo.clone(), &fast_config()).run(token.clone()));

    eventually("sync delta", || fifo.pending(&key("a")).is_some()).await;
    eventually("watch attached", || src.watcher_count() == 1).await;
    src.upsert(key("a"), json!({ "v": 2 }));
    eventually("update delta", || fifo.pending(&key("a")).map(|d| d.len()) == Some(2)).await;

    let kinds: Vec<DeltaType> = fifo.pending(&key("a")).unwrap().iter().map(|d| d.kind).collect();
    assert_eq!(kinds, vec![DeltaType::Sync, DeltaType::Updated]);

    token.cancel();
    handle.await.unwrap();
}
