//! DDS store: the registry of live connections and latest snapshots, and the
//! per-connection dispatch that delivers snapshots with ACK tracking.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dds_core::{DdsOptions, Endpoint, ObserveRequest, ResourceKind};
use dds_rules::{Generators, Origin};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

mod connection;
mod queue;
pub mod transport;

pub use connection::{ClientStatus, Connection, ConnectionStatus, PushingStatus};
pub use queue::PushQueue;
pub use transport::{channel, ChannelClient, ChannelTransport, Transport};

use connection::AckRejected;

#[derive(Default)]
struct Registry {
    connections: Vec<Arc<Connection>>,
    latest: FxHashMap<ResourceKind, Arc<Origin>>,
}

/// Shared state of the distribution core. Always held behind an `Arc`; each
/// connection's tasks keep a clone.
pub struct Storage {
    registry: RwLock<Registry>,
    generators: Generators,
    options: DdsOptions,
    next_id: AtomicU64,
}

impl Storage {
    pub fn new(generators: Generators, options: DdsOptions) -> Arc<Self> {
        Arc::new(Self { registry: RwLock::new(Registry::default()), generators, options, next_id: AtomicU64::new(1) })
    }

    pub fn generators(&self) -> &Generators {
        &self.generators
    }

    pub fn options(&self) -> &DdsOptions {
        &self.options
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new client stream and start its reader and dispatch tasks.
    /// Must be called from within a tokio runtime.
    pub fn connected(self: &Arc<Self>, endpoint: Endpoint, transport: Arc<dyn Transport>) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, endpoint, transport));
        let total = {
            let mut reg = self.write();
            reg.connections.push(Arc::clone(&conn));
            reg.connections.len()
        };
        metrics::gauge!("dds_connections", total as f64);
        info!(conn = id, endpoint = %conn.endpoint(), total, "client connected");

        tokio::spawn(connection::run_reader(Arc::clone(self), Arc::clone(&conn)));
        tokio::spawn(connection::run_dispatch(Arc::clone(self), Arc::clone(&conn)));
        conn
    }

    /// Apply one client request: a subscription (empty nonce) or an ACK.
    pub fn handle_request(&self, conn: &Connection, req: ObserveRequest) {
        let kind = match req.kind.parse::<ResourceKind>() {
            Ok(k) => k,
            Err(e) => {
                warn!(conn = conn.id(), error = %e, nonce = %req.nonce, "ignoring request");
                return;
            }
        };

        if !req.nonce.is_empty() {
            match conn.acknowledge(kind, &req.nonce) {
                Ok(revision) => {
                    metrics::counter!("dds_ack_total", 1u64, "kind" => kind.kind());
                    info!(conn = conn.id(), kind = kind.kind(), nonce = %req.nonce, revision, "ack");
                }
                Err(AckRejected::NotSubscribed) => {
                    warn!(conn = conn.id(), kind = kind.kind(), nonce = %req.nonce, "ack for a kind never subscribed");
                }
                Err(AckRejected::NothingOutstanding) => {
                    debug!(conn = conn.id(), kind = kind.kind(), nonce = %req.nonce, "ack with no push outstanding");
                }
                Err(AckRejected::NonceMismatch { expected }) => {
                    metrics::counter!("dds_ack_mismatch_total", 1u64, "kind" => kind.kind());
                    warn!(conn = conn.id(), kind = kind.kind(), got = %req.nonce, expected = %expected, "ack nonce mismatch");
                }
            }
            return;
        }

        if !conn.listen(kind) {
            debug!(conn = conn.id(), kind = kind.kind(), "already subscribed");
            return;
        }
        info!(conn = conn.id(), kind = kind.kind(), "subscribed");
        // Read under the registry lock so a concurrent publish cannot slip between
        // the latest lookup and the enqueue.
        let reg = self.read();
        if let Some(latest) = reg.latest.get(&kind) {
            conn.queue.push(Arc::clone(latest));
        }
    }

    /// Drop a connection. Idempotent.
    pub fn disconnect(&self, conn: &Arc<Connection>) {
        let total = {
            let mut reg = self.write();
            reg.connections.retain(|c| !Arc::ptr_eq(c, conn));
            reg.connections.len()
        };
        if conn.close() {
            metrics::gauge!("dds_connections", total as f64);
            info!(conn = conn.id(), endpoint = %conn.endpoint(), total, "client disconnected");
        }
    }

    /// Record `origin` as the latest snapshot of its kind and queue it for every
    /// live connection.
    pub fn publish(&self, origin: Origin) -> Arc<Origin> {
        let origin = Arc::new(origin);
        let mut reg = self.write();
        reg.latest.insert(origin.kind, Arc::clone(&origin));
        for conn in &reg.connections {
            conn.queue.push(Arc::clone(&origin));
        }
        debug!(kind = origin.kind.kind(), revision = origin.revision, connections = reg.connections.len(), "published");
        origin
    }

    pub fn latest(&self, kind: ResourceKind) -> Option<Arc<Origin>> {
        self.read().latest.get(&kind).cloned()
    }

    /// Live connections in connect order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.read().connections.clone()
    }
}
