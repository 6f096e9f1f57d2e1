//! Kube-backed store: one list+watch per rule kind feeding the shared cache.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dds_core::{ResourceKind, RuleObject};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::{stopped, ConfigStore, EventHandler};

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

pub struct KubeConfigStore {
    kinds: Vec<ResourceKind>,
    namespace: Option<String>,
    cache: Arc<Cache>,
}

impl KubeConfigStore {
    /// Watch `kinds` across all namespaces, or only `namespace` when given.
    pub fn new(kinds: Vec<ResourceKind>, namespace: Option<String>) -> Self {
        Self { kinds, namespace, cache: Arc::new(Cache::default()) }
    }

    pub fn kinds(&self) -> &[ResourceKind] {
        &self.kinds
    }
}

#[async_trait]
impl ConfigStore for KubeConfigStore {
    fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<Vec<RuleObject>> {
        if !self.kinds.contains(&kind) {
            return Err(anyhow!("{} is not watched", kind.kind()));
        }
        Ok(self.cache.list(kind, namespace))
    }

    fn get(&self, kind: ResourceKind, name: &str, namespace: &str) -> Option<RuleObject> {
        self.cache.get(kind, name, namespace)
    }

    fn register_event_handler(&self, kind: ResourceKind, handler: Arc<dyn EventHandler>) {
        self.cache.register(kind, handler);
    }

    fn has_synced(&self) -> bool {
        self.kinds.iter().all(|k| self.cache.is_synced(*k))
    }

    async fn start(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let client = Client::try_default().await.context("building kube client")?;
        let mut tasks = Vec::with_capacity(self.kinds.len());
        for &kind in &self.kinds {
            tasks.push(tokio::spawn(run_watcher(
                client.clone(),
                kind,
                self.namespace.clone(),
                Arc::clone(&self.cache),
                stop.clone(),
            )));
        }
        stopped(&mut stop).await;
        for t in futures::future::join_all(tasks).await {
            if let Err(e) = t {
                warn!(error = %e, "watcher task panicked");
            }
        }
        info!("config store stopped");
        Ok(())
    }
}

/// Keep one kind's watch alive until stopped, restarting with backoff.
async fn run_watcher(
    client: Client,
    kind: ResourceKind,
    namespace: Option<String>,
    cache: Arc<Cache>,
    mut stop: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_START;
    loop {
        let result = tokio::select! {
            r = watch_kind(client.clone(), kind, namespace.as_deref(), &cache) => r,
            _ = stopped(&mut stop) => return,
        };
        match result {
            Ok(()) => {
                warn!(kind = kind.kind(), "watch stream ended; restarting");
                backoff = BACKOFF_START;
            }
            Err(e) => warn!(kind = kind.kind(), error = %e, backoff_ms = backoff.as_millis() as u64, "watch failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = stopped(&mut stop) => return,
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

async fn watch_kind(client: Client, kind: ResourceKind, namespace: Option<&str>, cache: &Cache) -> Result<()> {
    let gvk = parse_gvk_key(kind.as_str())?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api: Api<DynamicObject> = match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    };

    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(kind = kind.kind(), ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        let changed = match ev {
            Event::Applied(o) => cache.upsert(kind, rule_from(&o)?),
            Event::Deleted(o) => {
                let obj = rule_from(&o)?;
                cache.remove(kind, &obj.name, &obj.namespace)
            }
            Event::Restarted(list) => {
                debug!(kind = kind.kind(), count = list.len(), "watch restart");
                let objects = list.iter().map(rule_from).collect::<Result<Vec<_>>>()?;
                let changed = cache.replace(kind, objects);
                cache.mark_synced(kind) || changed
            }
        };
        notify_changed(cache, kind, changed);
    }
    Ok(())
}

/// Run the handlers of a synced kind after a change. A failing handler does
/// not stop the watch; the next change of the kind runs the handlers again.
/// Returns whether the handlers ran and all succeeded.
fn notify_changed(cache: &Cache, kind: ResourceKind, changed: bool) -> bool {
    if !changed || !cache.is_synced(kind) {
        return false;
    }
    match cache.fire(kind) {
        Ok(()) => true,
        Err(e) => {
            debug!(kind = kind.kind(), error = %e, "change not applied; waiting for the next event");
            false
        }
    }
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [group, version, kind] => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {key} (expect group/version/Kind)")),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("resource not served: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Project a watched object onto name, namespace and spec. A missing spec reads
/// as an empty object.
fn rule_from(obj: &DynamicObject) -> Result<RuleObject> {
    let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let spec = obj.data.get("spec").cloned().unwrap_or_else(|| serde_json::json!({}));
    Ok(RuleObject { name, namespace, spec })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handler_failure_does_not_stop_later_changes() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cache = Cache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        cache.register(
            ResourceKind::TagRoute,
            Arc::new(move |_kind: ResourceKind| -> Result<()> {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow!("publish failed"))
                } else {
                    Ok(())
                }
            }),
        );

        assert!(cache.upsert(ResourceKind::TagRoute, RuleObject::new("a", "ns", json!({}))));
        assert!(!notify_changed(&cache, ResourceKind::TagRoute, true));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cache.mark_synced(ResourceKind::TagRoute);
        assert!(!notify_changed(&cache, ResourceKind::TagRoute, false));
        assert!(!notify_changed(&cache, ResourceKind::TagRoute, true));
        assert!(notify_changed(&cache, ResourceKind::TagRoute, true));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn gvk_keys_of_every_kind_parse() {
        for kind in ResourceKind::ALL {
            let gvk = parse_gvk_key(kind.as_str()).unwrap();
            assert_eq!(gvk.group, "dubbo.apache.org");
            assert_eq!(gvk.version, "v1alpha1");
            assert_eq!(gvk.kind, kind.kind());
        }
        assert!(parse_gvk_key("v1/Pod").is_err());
    }

    #[test]
    fn projects_name_namespace_and_spec() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "dubbo.apache.org/v1alpha1",
            "kind": "TagRoute",
            "metadata": { "name": "demo", "namespace": "default", "managedFields": [] },
            "spec": { "force": true },
        }))
        .unwrap();
        let rule = rule_from(&obj).unwrap();
        assert_eq!(rule.key(), "demo/default");
        assert_eq!(rule.spec, json!({ "force": true }));

        let bare: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "dubbo.apache.org/v1alpha1",
            "kind": "TagRoute",
            "metadata": { "name": "bare" },
        }))
        .unwrap();
        let rule = rule_from(&bare).unwrap();
        assert_eq!(rule.namespace, "");
        assert_eq!(rule.spec, json!({}));
    }

    #[test]
    fn unwatched_kind_is_an_error() {
        let store = KubeConfigStore::new(vec![ResourceKind::TagRoute], None);
        assert!(store.list(ResourceKind::ConditionRoute, None).is_err());
        assert!(store.list(ResourceKind::TagRoute, None).unwrap().is_empty());
        assert!(!store.has_synced());
    }
}
