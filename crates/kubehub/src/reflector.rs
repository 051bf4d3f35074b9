//! List-then-watch loop that keeps an `ObjectStore` in step with a remote
//! collection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use kmirror_core::{
    is_newer_version, Backoff, DeltaType, Error, ListerWatcher, ObjectStore, Resource, Selector, WatchConfig, WatchEvent,
};
use metrics::counter;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lock-free view of the last resourceVersion the reflector synced to.
#[derive(Clone, Default)]
pub struct SyncVersion(Arc<ArcSwap<String>>);

impl SyncVersion {
    pub fn get(&self) -> Arc<String> {
        self.0.load_full()
    }

    fn set(&self, rv: &str) {
        self.0.store(Arc::new(rv.to_string()));
    }
}

enum WatchEnd {
    Cancelled,
    Resync,
    Expired(String),
    /// Stream ended or broke; resume from the last version.
    Interrupted { delivered: bool, cause: Option<Error> },
}

pub struct Reflector<L: ?Sized> {
    name: String,
    source: Arc<L>,
    store: Arc<dyn ObjectStore>,
    selector: Selector,
    expected_kind: Option<String>,
    resync_period: Duration,
    backoff: Backoff,
    version: SyncVersion,
}

impl<L: ListerWatcher + ?Sized> Reflector<L> {
    pub fn new(name: &str, source: Arc<L>, store: Arc<dyn ObjectStore>, config: &WatchConfig) -> Self {
        Self {
            name: name.to_string(),
            source,
            store,
            selector: config.selector.clone(),
            expected_kind: None,
            resync_period: config.resync_period,
            backoff: config.backoff(),
            version: SyncVersion::default(),
        }
    }

    /// Skip (and log) objects whose kind differs.
    pub fn with_expected_kind(mut self, kind: &str) -> Self {
        self.expected_kind = Some(kind.to_string());
        self
    }

    pub fn sync_version(&self) -> SyncVersion {
        self.version.clone()
    }

    /// Run until `token` is cancelled. Connection failures are retried
    /// forever with capped backoff; nothing here is fatal.
    pub async fn run(mut self, token: CancellationToken) {
        info!(reflector = %self.name, resync_secs = self.resync_period.as_secs(), "reflector started");
        loop {
            let listed = tokio::select! {
                _ = token.cancelled() => break,
                r = self.list_and_replace() => r,
            };
            let mut rv = match listed {
                Ok(rv) => {
                    self.backoff.reset();
                    rv
                }
                Err(e) => {
                    warn!(reflector = %self.name, error = %e, "list failed");
                    if !self.pause(&token).await {
                        break;
                    }
                    continue;
                }
            };
            let resync_at = (!self.resync_period.is_zero()).then(|| Instant::now() + self.resync_period);

            match self.watch(&token, &mut rv, resync_at).await {
                WatchEnd::Cancelled => break,
                WatchEnd::Resync => {
                    info!(reflector = %self.name, rv = %rv, "resync period elapsed; re-listing");
                }
                WatchEnd::Expired(msg) => {
                    counter!("kmirror_reflector_expired_total").increment(1);
                    warn!(reflector = %self.name, rv = %rv, reason = %msg, "resource version expired; re-listing");
                    if !self.pause(&token).await {
                        break;
                    }
                }
                WatchEnd::Interrupted { delivered, cause } => {
                    counter!("kmirror_reflector_watch_restarts_total").increment(1);
                    if delivered {
                        self.backoff.reset();
                    }
                    // Deletes made while disconnected only show up in a list.
                    match cause {
                        Some(e) => warn!(reflector = %self.name, rv = %rv, error = %e, "watch failed; re-listing"),
                        None => debug!(reflector = %self.name, rv = %rv, "watch closed; re-listing"),
                    }
                    if !self.pause(&token).await {
                        break;
                    }
                }
            }
        }
        info!(reflector = %self.name, "reflector stopped");
    }

    /// Sleep for the next backoff step. False when cancelled meanwhile.
    async fn pause(&mut self, token: &CancellationToken) -> bool {
        let delay = self.backoff.next_delay();
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn kind_ok(&self, obj: &Resource) -> bool {
        match &self.expected_kind {
            Some(k) if *k != obj.kind => {
                warn!(reflector = %self.name, expected = %k, got = %obj.kind, key = %obj.key, "unexpected kind; skipped");
                false
            }
            _ => true,
        }
    }

    async fn list_and_replace(&self) -> kmirror_core::Result<String> {
        let list = self.source.list(&self.selector).await?;
        let items: Vec<Resource> = list.items.into_iter().filter(|o| self.kind_ok(o)).collect();
        let count = items.len();
        self.store.replace(items, &list.resource_version)?;
        self.version.set(&list.resource_version);
        counter!("kmirror_reflector_lists_total").increment(1);
        info!(reflector = %self.name, count, rv = %list.resource_version, "listed");
        Ok(list.resource_version)
    }

    async fn watch(&self, token: &CancellationToken, rv: &mut String, resync_at: Option<Instant>) -> WatchEnd {
        let resync = until(resync_at);
        tokio::pin!(resync);

        let opened = tokio::select! {
            _ = token.cancelled() => return WatchEnd::Cancelled,
            _ = &mut resync => return WatchEnd::Resync,
            r = self.source.watch(&self.selector, rv.as_str()) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(Error::Expired(msg)) => return WatchEnd::Expired(msg),
            Err(e) => return WatchEnd::Interrupted { delivered: false, cause: Some(e) },
        };
        debug!(reflector = %self.name, rv = %rv, "watch opened");

        let mut delivered = false;
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return WatchEnd::Cancelled,
                _ = &mut resync => return WatchEnd::Resync,
                n = stream.next() => n,
            };
            match next {
                None => return WatchEnd::Interrupted { delivered, cause: None },
                Some(Err(Error::Malformed(msg))) => {
                    warn!(reflector = %self.name, reason = %msg, "malformed watch event; skipped");
                }
                Some(Err(Error::Expired(msg))) => return WatchEnd::Expired(msg),
                Some(Err(e)) => return WatchEnd::Interrupted { delivered, cause: Some(e) },
                Some(Ok(WatchEvent::Error(Error::Expired(msg)))) => return WatchEnd::Expired(msg),
                Some(Ok(WatchEvent::Error(e))) => return WatchEnd::Interrupted { delivered, cause: Some(e) },
                Some(Ok(ev)) => delivered |= self.apply(ev, rv),
            }
        }
    }

    /// Feed one event into the store. Returns whether it was applied.
    fn apply(&self, ev: WatchEvent, rv: &mut String) -> bool {
        let (kind, obj) = match ev {
            WatchEvent::Bookmark(v) => {
                *rv = v;
                self.version.set(rv);
                return false;
            }
            WatchEvent::Added(o) => (DeltaType::Added, o),
            WatchEvent::Modified(o) => (DeltaType::Updated, o),
            WatchEvent::Deleted(o) => (DeltaType::Deleted, o),
            WatchEvent::Error(_) => return false,
        };
        if !self.kind_ok(&obj) {
            return false;
        }
        if !is_newer_version(&obj.resource_version, rv) {
            debug!(reflector = %self.name, key = %obj.key, rv = %obj.resource_version, seen = %rv, "stale or duplicate event; skipped");
            return false;
        }
        let new_rv = obj.resource_version.clone();
        let key = obj.key.clone();
        let res = match kind {
            DeltaType::Added => self.store.add(obj),
            DeltaType::Updated => self.store.update(obj),
            _ => self.store.delete(obj),
        };
        if let Err(e) = res {
            warn!(reflector = %self.name, key = %key, error = %e, ?kind, "store rejected watch event");
        }
        counter!("kmirror_reflector_watch_events_total", "type" => format!("{kind:?}")).increment(1);
        debug!(reflector = %self.name, key = %key, rv = %new_rv, ?kind, "applied");
        if !new_rv.is_empty() {
            *rv = new_rv;
            self.version.set(rv);
        }
        true
    }
}

fn until(at: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}
