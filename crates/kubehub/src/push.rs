//! Snapshot assembly: list a kind from the store, scope policies to their own
//! namespace, stamp the next revision and hand the result to storage.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use dds_core::policy::{AuthenticationPolicy, AuthorizationPolicy, AuthorizationRule, PolicySelector};
use dds_core::{ResourceKind, RuleObject};
use dds_rules::Origin;
use dds_store::Storage;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::{ConfigStore, EventHandler};

pub struct PushContext {
    store: Arc<dyn ConfigStore>,
    storage: Arc<Storage>,
    /// Last revision handed out per kind. Held across list and publish so that
    /// snapshots of one kind reach storage in revision order.
    revisions: Mutex<FxHashMap<ResourceKind, i64>>,
}

impl PushContext {
    pub fn new(store: Arc<dyn ConfigStore>, storage: Arc<Storage>) -> Self {
        Self { store, storage, revisions: Mutex::new(FxHashMap::default()) }
    }

    /// Register this context as the change handler of every kind in `kinds`.
    pub fn register(self: &Arc<Self>, kinds: &[ResourceKind]) {
        for &kind in kinds {
            self.store.register_event_handler(kind, Arc::clone(self) as Arc<dyn EventHandler>);
        }
    }

    /// Rebuild the snapshot of `kind` and broadcast it.
    pub fn notify(&self, kind: ResourceKind) -> Result<Arc<Origin>> {
        let mut revisions = self.revisions.lock().unwrap_or_else(|e| e.into_inner());
        let objects = self.snapshot_objects(kind)?;
        let revision = revisions.get(&kind).copied().unwrap_or(0) + 1;
        revisions.insert(kind, revision);

        metrics::counter!("dds_snapshots_total", 1u64, "kind" => kind.kind());
        info!(kind = kind.kind(), revision, objects = objects.len(), "snapshot");
        Ok(self.storage.publish(Origin::new(kind, revision, objects)))
    }

    /// Current objects of `kind` with namespace defaulting applied.
    pub fn snapshot_objects(&self, kind: ResourceKind) -> Result<Vec<RuleObject>> {
        let mut objects = self.store.list(kind, None).with_context(|| format!("listing {}", kind.kind()))?;
        let root = &self.storage.options().root_namespace;
        for obj in &mut objects {
            default_namespace(kind, obj, root);
        }
        Ok(objects)
    }

    /// Last revision assigned to `kind`, 0 before the first snapshot.
    pub fn revision(&self, kind: ResourceKind) -> i64 {
        let revisions = self.revisions.lock().unwrap_or_else(|e| e.into_inner());
        revisions.get(&kind).copied().unwrap_or(0)
    }
}

impl EventHandler for PushContext {
    fn on_change(&self, kind: ResourceKind) -> Result<()> {
        self.notify(kind).map(|_| ())
    }
}

/// Scope a policy outside `root` to its own namespace. Only selectors and rule
/// targets without a namespace restriction are scoped. Non-policy kinds, objects
/// in the root namespace and cluster-scoped objects are left untouched. A spec
/// that does not decode is left as-is for the generator to report.
pub fn default_namespace(kind: ResourceKind, obj: &mut RuleObject, root: &str) {
    if !kind.is_policy() || obj.namespace.is_empty() || obj.namespace == root {
        return;
    }
    let ns = obj.namespace.clone();
    let spec = match kind {
        ResourceKind::AuthenticationPolicy => {
            serde_json::from_value::<AuthenticationPolicy>(obj.spec.clone()).and_then(|mut p| {
                if p.selector.is_empty() {
                    p.selector.push(PolicySelector::in_namespace(&ns));
                } else {
                    p.selector.iter_mut().for_each(|s| s.default_namespace(&ns));
                }
                serde_json::to_value(p)
            })
        }
        ResourceKind::AuthorizationPolicy => {
            serde_json::from_value::<AuthorizationPolicy>(obj.spec.clone()).and_then(|mut p| {
                if p.rules.is_empty() {
                    p.rules.push(AuthorizationRule { to: Some(PolicySelector::in_namespace(&ns)), ..Default::default() });
                } else {
                    for rule in &mut p.rules {
                        rule.to.get_or_insert_with(PolicySelector::default).default_namespace(&ns);
                    }
                }
                serde_json::to_value(p)
            })
        }
        _ => return,
    };
    match spec {
        Ok(v) => obj.spec = v,
        Err(e) => warn!(kind = kind.kind(), key = %obj.key(), error = %e, "spec does not decode; namespace not defaulted"),
    }
}
