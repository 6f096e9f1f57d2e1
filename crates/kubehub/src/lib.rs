//! DDS kubehub: the configuration-store collaborator (kube watchers or an
//! in-memory cache) and the handler that turns store changes into snapshots.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dds_core::{ResourceKind, RuleObject};
use tokio::sync::watch;

mod cache;
mod memory;
mod push;
mod watch_store;

pub use memory::MemoryConfigStore;
pub use push::{default_namespace, PushContext};
pub use watch_store::KubeConfigStore;

/// Called with the kind whose object set changed.
pub trait EventHandler: Send + Sync {
    fn on_change(&self, kind: ResourceKind) -> Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(ResourceKind) -> Result<()> + Send + Sync,
{
    fn on_change(&self, kind: ResourceKind) -> Result<()> {
        self(kind)
    }
}

/// Source of rule objects. Reads are served from a local cache; `start` drives
/// whatever keeps that cache current until `stop` flips to true.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Objects of `kind`, ordered by namespace then name. `None` lists all namespaces.
    fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<Vec<RuleObject>>;

    fn get(&self, kind: ResourceKind, name: &str, namespace: &str) -> Option<RuleObject>;

    fn register_event_handler(&self, kind: ResourceKind, handler: Arc<dyn EventHandler>);

    /// Every watched kind has completed its initial listing.
    fn has_synced(&self) -> bool;

    async fn start(&self, stop: watch::Receiver<bool>) -> Result<()>;
}

/// Resolve once `stop` reads true or its sender is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        let stop_now = *stop.borrow_and_update();
        if stop_now || stop.changed().await.is_err() {
            return;
        }
    }
}
