use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use dds_core::{ResourceKind, RuleObject};
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::EventHandler;

#[derive(Default)]
struct KindCache {
    synced: bool,
    /// Keyed by (namespace, name) so listing is ordered and deterministic.
    objects: BTreeMap<(String, String), RuleObject>,
}

/// Object cache plus registered change handlers, shared by both store flavours.
#[derive(Default)]
pub(crate) struct Cache {
    kinds: RwLock<FxHashMap<ResourceKind, KindCache>>,
    handlers: RwLock<FxHashMap<ResourceKind, Vec<Arc<dyn EventHandler>>>>,
}

fn key(obj: &RuleObject) -> (String, String) {
    (obj.namespace.clone(), obj.name.clone())
}

impl Cache {
    pub(crate) fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> Vec<RuleObject> {
        let kinds = self.kinds.read().unwrap_or_else(|e| e.into_inner());
        let Some(cache) = kinds.get(&kind) else { return Vec::new() };
        cache.objects.values().filter(|o| namespace.map_or(true, |ns| o.namespace == ns)).cloned().collect()
    }

    pub(crate) fn get(&self, kind: ResourceKind, name: &str, namespace: &str) -> Option<RuleObject> {
        let kinds = self.kinds.read().unwrap_or_else(|e| e.into_inner());
        kinds.get(&kind)?.objects.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    /// Insert or replace. Returns false when an identical object was already cached.
    pub(crate) fn upsert(&self, kind: ResourceKind, obj: RuleObject) -> bool {
        let mut kinds = self.kinds.write().unwrap_or_else(|e| e.into_inner());
        let cache = kinds.entry(kind).or_default();
        let k = key(&obj);
        if cache.objects.get(&k) == Some(&obj) {
            return false;
        }
        cache.objects.insert(k, obj);
        true
    }

    pub(crate) fn remove(&self, kind: ResourceKind, name: &str, namespace: &str) -> bool {
        let mut kinds = self.kinds.write().unwrap_or_else(|e| e.into_inner());
        kinds
            .get_mut(&kind)
            .map(|c| c.objects.remove(&(namespace.to_string(), name.to_string())).is_some())
            .unwrap_or(false)
    }

    /// Swap in a full listing. Returns true when the contents changed.
    pub(crate) fn replace(&self, kind: ResourceKind, objects: Vec<RuleObject>) -> bool {
        let next: BTreeMap<_, _> = objects.into_iter().map(|o| (key(&o), o)).collect();
        let mut kinds = self.kinds.write().unwrap_or_else(|e| e.into_inner());
        let cache = kinds.entry(kind).or_default();
        if cache.objects == next {
            return false;
        }
        cache.objects = next;
        true
    }

    /// Mark `kind` as having completed its initial listing. Returns true the first time.
    pub(crate) fn mark_synced(&self, kind: ResourceKind) -> bool {
        let mut kinds = self.kinds.write().unwrap_or_else(|e| e.into_inner());
        let cache = kinds.entry(kind).or_default();
        !std::mem::replace(&mut cache.synced, true)
    }

    pub(crate) fn is_synced(&self, kind: ResourceKind) -> bool {
        let kinds = self.kinds.read().unwrap_or_else(|e| e.into_inner());
        kinds.get(&kind).is_some_and(|c| c.synced)
    }

    pub(crate) fn register(&self, kind: ResourceKind, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(kind).or_default().push(handler);
    }

    /// Invoke every handler of `kind`. All handlers run; the first error is returned.
    pub(crate) fn fire(&self, kind: ResourceKind) -> anyhow::Result<()> {
        let handlers = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(&kind).cloned().unwrap_or_default()
        };
        let mut first = None;
        for h in handlers {
            if let Err(e) = h.on_change(kind) {
                warn!(kind = kind.kind(), error = %e, "change handler failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}
