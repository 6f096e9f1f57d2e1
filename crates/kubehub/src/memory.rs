use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dds_core::{ResourceKind, RuleObject};
use tokio::sync::watch;
use tracing::debug;

use crate::cache::Cache;
use crate::{stopped, ConfigStore, EventHandler};

/// In-process store. Always synced; `apply` and `delete` fire the kind's
/// handlers when the cached set actually changes.
#[derive(Default)]
pub struct MemoryConfigStore {
    cache: Cache,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed objects without firing handlers.
    pub fn with_objects(kind: ResourceKind, objects: Vec<RuleObject>) -> Self {
        let store = Self::new();
        store.cache.replace(kind, objects);
        store
    }

    pub fn apply(&self, kind: ResourceKind, obj: RuleObject) -> Result<()> {
        let key = obj.key();
        if !self.cache.upsert(kind, obj) {
            debug!(kind = kind.kind(), key = %key, "unchanged; not notifying");
            return Ok(());
        }
        self.cache.fire(kind)
    }

    /// Returns false when the object was not present.
    pub fn delete(&self, kind: ResourceKind, name: &str, namespace: &str) -> Result<bool> {
        if !self.cache.remove(kind, name, namespace) {
            return Ok(false);
        }
        self.cache.fire(kind)?;
        Ok(true)
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<Vec<RuleObject>> {
        Ok(self.cache.list(kind, namespace))
    }

    fn get(&self, kind: ResourceKind, name: &str, namespace: &str) -> Option<RuleObject> {
        self.cache.get(kind, name, namespace)
    }

    fn register_event_handler(&self, kind: ResourceKind, handler: Arc<dyn EventHandler>) {
        self.cache.register(kind, handler);
    }

    fn has_synced(&self) -> bool {
        true
    }

    async fn start(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        stopped(&mut stop).await;
        Ok(())
    }
}
