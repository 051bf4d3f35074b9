//! kmirror core types: resources, deltas, watch events and the seams
//! (`ListerWatcher`, `ObjectStore`) the engine is built around.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod backoff;
pub mod config;

pub use backoff::Backoff;
pub use config::WatchConfig;

/// Engine-wide error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// List request failed or the watch stream broke.
    #[error("connection: {0}")]
    Connection(String),
    /// The requested resourceVersion is no longer served (HTTP 410).
    #[error("resource version too old: {0}")]
    Expired(String),
    /// An object or event with an unexpected shape.
    #[error("malformed: {0}")]
    Malformed(String),
    /// A store mutation failed.
    #[error("store: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Identity of a resource: `namespace/name`, or `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn cluster(name: &str) -> Self {
        Self::new(None, name)
    }

    /// Inverse of `Display`: `ns/name` or `name`.
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(name)),
            [ns, name] if !name.is_empty() => Ok(Self::new(Some(ns), name)),
            _ => Err(Error::Malformed(format!("invalid object key: {key:?}"))),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Opaque versioned object. Consumers look at `kind` and `raw`; the engine
/// only ever reads `key` and `resource_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: String,
    pub key: ObjectKey,
    pub resource_version: String,
    pub raw: serde_json::Value,
}

impl Resource {
    pub fn new(kind: &str, key: ObjectKey, resource_version: &str, raw: serde_json::Value) -> Self {
        Self { kind: kind.to_string(), key, resource_version: resource_version.to_string(), raw }
    }

    /// Build from a raw API document. `fallback_kind` is used when the payload
    /// carries no `kind` (list items usually don't).
    pub fn from_value(fallback_kind: &str, raw: serde_json::Value) -> Result<Self> {
        let meta = raw
            .get("metadata")
            .ok_or_else(|| Error::Malformed("object missing metadata".into()))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Malformed("object missing metadata.name".into()))?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str());
        let rv = meta.get("resourceVersion").and_then(|v| v.as_str()).unwrap_or("");
        let kind = raw
            .get("kind")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(fallback_kind)
            .to_string();
        Ok(Self { kind, key: ObjectKey::new(namespace, name), resource_version: rv.to_string(), raw })
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Read a dotted path out of the payload, e.g. `status.phase`.
    pub fn field(&self, path: &str) -> Option<&serde_json::Value> {
        path.split('.').try_fold(&self.raw, |v, seg| v.get(seg))
    }
}

/// Compare two resourceVersion tokens. Tokens are opaque; only when both are
/// plain integers is an order defined.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => Some(a.cmp(&b)),
        _ => None,
    }
}

/// True unless `candidate` is provably not newer than `seen`.
pub fn is_newer_version(candidate: &str, seen: &str) -> bool {
    !matches!(compare_versions(candidate, seen), Some(Ordering::Less | Ordering::Equal))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DeltaType {
    Added,
    Updated,
    Deleted,
    /// Synthetic, injected by a re-list. Never produced by a watch.
    Sync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaType,
    pub object: Resource,
    /// Set on deletes inferred from a re-list; `object` is the last state seen.
    pub final_state_unknown: bool,
}

impl Delta {
    pub fn new(kind: DeltaType, object: Resource) -> Self {
        Self { kind, object, final_state_unknown: false }
    }

    pub fn tombstone(object: Resource) -> Self {
        Self { kind: DeltaType::Deleted, object, final_state_unknown: true }
    }

    pub fn is_delete(&self) -> bool {
        self.kind == DeltaType::Deleted
    }
}

/// Pending deltas for one key, oldest first.
pub type Deltas = SmallVec<[Delta; 2]>;

/// Event from the remote change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Resource),
    Modified(Resource),
    Deleted(Resource),
    /// Progress marker: only advances the resume token.
    Bookmark(String),
    /// Server-side error delivered in-band; ends the watch.
    Error(Error),
}

/// Full snapshot returned by a list call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectList {
    pub items: Vec<Resource>,
    pub resource_version: String,
}

/// Label/field scope for list and watch. Empty means everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub label: Option<String>,
    pub field: Option<String>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_everything(&self) -> bool {
        self.label.is_none() && self.field.is_none()
    }
}

pub type WatchStream = futures::stream::BoxStream<'static, Result<WatchEvent>>;

/// Remote source: "fetch full snapshot" and "open incremental change stream".
/// Dropping the returned stream terminates the watch.
#[async_trait::async_trait]
pub trait ListerWatcher: Send + Sync {
    async fn list(&self, selector: &Selector) -> Result<ObjectList>;
    async fn watch(&self, selector: &Selector, since: &str) -> Result<WatchStream>;
}

/// Mutation surface shared by the plain store and the delta queue, so a
/// reflector can feed either.
pub trait ObjectStore: Send + Sync {
    fn add(&self, obj: Resource) -> Result<()>;
    fn update(&self, obj: Resource) -> Result<()>;
    fn delete(&self, obj: Resource) -> Result<()>;
    fn get(&self, key: &ObjectKey) -> Option<Resource>;
    fn list_keys(&self) -> Vec<ObjectKey>;
    fn replace(&self, items: Vec<Resource>, resource_version: &str) -> Result<()>;
}

pub mod prelude {
    pub use super::{
        Delta, DeltaType, Deltas, Error, ListerWatcher, ObjectKey, ObjectList, ObjectStore, Resource,
        Selector, WatchEvent, WatchStream,
    };
}
