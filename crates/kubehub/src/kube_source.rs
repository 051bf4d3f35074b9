//! Kubernetes list/watch over `DynamicObject`, resolved through API discovery.

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use futures::StreamExt;
use kmirror_core::{Error, ListerWatcher, ObjectList, Resource, Selector, WatchEvent, WatchStream};
use kube::{
    api::{Api, ListParams, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind, WatchEvent as KubeEvent},
    discovery::{Discovery, Scope},
    Client,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// How to reach the API server. With neither field set the default kube
/// config resolution applies (KUBECONFIG, ~/.kube/config, in-cluster).
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub kubeconfig: Option<PathBuf>,
    pub master_url: Option<String>,
}

pub async fn client(opts: &ClientOptions) -> anyhow::Result<Client> {
    if let Some(path) = &opts.kubeconfig {
        let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
        let cfg = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
            .await
            .context("loading kubeconfig")?;
        return Client::try_from(cfg).context("building client from kubeconfig");
    }
    if let Some(url) = &opts.master_url {
        let uri: http::Uri = url.parse().with_context(|| format!("parsing master url {url}"))?;
        return Client::try_from(kube::Config::new(uri)).context("building client for master url");
    }
    Client::try_default().await.context("building default client")
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: Client) -> anyhow::Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

fn parse_gvk_key(key: &str) -> anyhow::Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> anyhow::Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar, matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

fn to_resource(kind: &str, obj: DynamicObject) -> kmirror_core::Result<Resource> {
    let mut raw = serde_json::to_value(obj).map_err(|e| Error::Malformed(e.to_string()))?;
    strip_managed_fields(&mut raw);
    Resource::from_value(kind, raw)
}

fn map_kube_err(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(resp) if resp.code == 410 => Error::Expired(resp.message),
        kube::Error::Api(resp) => Error::Connection(format!("{} ({})", resp.message, resp.code)),
        other => Error::Connection(other.to_string()),
    }
}

/// List/watch for one GVK, namespaced or across all namespaces.
pub struct KubeListerWatcher {
    api: Api<DynamicObject>,
    kind: String,
}

impl KubeListerWatcher {
    /// `gvk_key` is `v1/Pod` or `group/version/Kind`.
    pub async fn new(client: Client, gvk_key: &str, namespace: Option<&str>) -> anyhow::Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        info!(gvk = %gvk_key, ns = ?namespace, namespaced, "kube source ready");
        Ok(Self { api, kind: ar.kind })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

fn list_params(selector: &Selector) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(l) = &selector.label {
        lp = lp.labels(l);
    }
    if let Some(f) = &selector.field {
        lp = lp.fields(f);
    }
    lp
}

fn watch_params(selector: &Selector) -> WatchParams {
    let mut wp = WatchParams::default(); // bookmarks are enabled by default in kube 0.90
    if let Some(l) = &selector.label {
        wp = wp.labels(l);
    }
    if let Some(f) = &selector.field {
        wp = wp.fields(f);
    }
    wp
}

fn translate(kind: &str, ev: kube::Result<KubeEvent<DynamicObject>>) -> kmirror_core::Result<WatchEvent> {
    match ev {
        Ok(KubeEvent::Added(o)) => to_resource(kind, o).map(WatchEvent::Added),
        Ok(KubeEvent::Modified(o)) => to_resource(kind, o).map(WatchEvent::Modified),
        Ok(KubeEvent::Deleted(o)) => to_resource(kind, o).map(WatchEvent::Deleted),
        Ok(KubeEvent::Bookmark(b)) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
        Ok(KubeEvent::Error(resp)) if resp.code == 410 => Ok(WatchEvent::Error(Error::Expired(resp.message))),
        Ok(KubeEvent::Error(resp)) => {
            Ok(WatchEvent::Error(Error::Connection(format!("{} ({})", resp.message, resp.code))))
        }
        Err(e) => Err(map_kube_err(e)),
    }
}

#[async_trait::async_trait]
impl ListerWatcher for KubeListerWatcher {
    async fn list(&self, selector: &Selector) -> kmirror_core::Result<ObjectList> {
        let list = self.api.list(&list_params(selector)).await.map_err(map_kube_err)?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let mut items = Vec::with_capacity(list.items.len());
        for o in list.items {
            match to_resource(&self.kind, o) {
                Ok(r) => items.push(r),
                Err(e) => warn!(error = %e, "skipping malformed list item"),
            }
        }
        debug!(count = items.len(), rv = %resource_version, "listed");
        Ok(ObjectList { items, resource_version })
    }

    async fn watch(&self, selector: &Selector, since: &str) -> kmirror_core::Result<WatchStream> {
        let stream = self.api.watch(&watch_params(selector), since).await.map_err(map_kube_err)?;
        let kind = self.kind.clone();
        Ok(stream.map(move |ev| translate(&kind, ev)).boxed())
    }
}
