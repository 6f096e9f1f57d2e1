//! One subscribed client: its listened kinds, per-kind push/ACK state, and the
//! reader and dispatch tasks that drive it.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dds_core::{Endpoint, GenerateError, ObserveResponse, ResourceKind, TransportError, VersionedRule};
use dds_rules::{Generators, Origin};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::queue::PushQueue;
use crate::transport::Transport;
use crate::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushingStatus {
    /// Nothing outstanding: the last push (if any) was acknowledged.
    Pushed,
    /// A push was sent and its ACK has not arrived yet.
    Pushing,
}

/// Per-kind delivery state of one connection.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub pushing_status: PushingStatus,
    /// A newer snapshot is waiting behind the outstanding push.
    pub push_queued: bool,
    pub nonce_counter: i64,
    /// Last payload the client acknowledged; `None` until the first ACK.
    pub acked_version: Option<Arc<VersionedRule>>,
    pub last_pushed_version: Option<Arc<VersionedRule>>,
    pub last_pushed_time: Option<DateTime<Utc>>,
    pub last_push_nonce: String,
    pushed_at: Option<Instant>,
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            pushing_status: PushingStatus::Pushed,
            push_queued: false,
            nonce_counter: 0,
            acked_version: None,
            last_pushed_version: None,
            last_pushed_time: None,
            last_push_nonce: String::new(),
            pushed_at: None,
        }
    }
}

impl ClientStatus {
    /// Revision the client has acknowledged, `-1` before the first ACK.
    pub fn acked_revision(&self) -> i64 {
        self.acked_version.as_ref().map_or(-1, |v| v.revision)
    }

    /// The client already holds `rule`, or something at least as new.
    fn holds(&self, rule: &VersionedRule) -> bool {
        match &self.acked_version {
            Some(acked) => acked.data == rule.data || acked.revision >= rule.revision,
            None => false,
        }
    }
}

#[derive(Debug)]
struct ConnectionState {
    status: ConnectionStatus,
    listened: BTreeSet<ResourceKind>,
    client_rules: FxHashMap<ResourceKind, ClientStatus>,
}

/// Result of offering one snapshot to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Delivery {
    Pushed { nonce: String },
    UpToDate,
    NotListened,
}

#[derive(Debug)]
pub(crate) enum DispatchError {
    Generate(GenerateError),
    Transport(TransportError),
    Unresponsive(Duration),
    Closed,
}

pub struct Connection {
    id: u64,
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
    pub(crate) queue: PushQueue,
    /// Bumped on every ACK and on disconnect; waiters re-check state on change.
    progress: watch::Sender<u64>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).field("endpoint", &self.endpoint).finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(id: u64, endpoint: Endpoint, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            endpoint,
            transport,
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Connected,
                listened: BTreeSet::new(),
                client_rules: FxHashMap::default(),
            }),
            queue: PushQueue::new(),
            progress: watch::channel(0u64).0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    pub fn is_listening(&self, kind: ResourceKind) -> bool {
        self.lock().listened.contains(&kind)
    }

    pub fn listened(&self) -> Vec<ResourceKind> {
        self.lock().listened.iter().copied().collect()
    }

    /// Snapshot of the delivery state for `kind`.
    pub fn client_status(&self, kind: ResourceKind) -> Option<ClientStatus> {
        self.lock().client_rules.get(&kind).cloned()
    }

    /// Snapshots waiting for the dispatch worker.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.progress.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Register interest in `kind`. Returns true the first time.
    pub(crate) fn listen(&self, kind: ResourceKind) -> bool {
        let mut st = self.lock();
        if st.status == ConnectionStatus::Disconnected || !st.listened.insert(kind) {
            return false;
        }
        st.client_rules.insert(kind, ClientStatus::default());
        true
    }

    /// Apply an ACK. Returns the acknowledged revision when `nonce` matched the
    /// outstanding push.
    pub(crate) fn acknowledge(&self, kind: ResourceKind, nonce: &str) -> Result<i64, AckRejected> {
        let revision = {
            let mut st = self.lock();
            let Some(cr) = st.client_rules.get_mut(&kind) else {
                return Err(AckRejected::NotSubscribed);
            };
            if cr.pushing_status != PushingStatus::Pushing {
                return Err(AckRejected::NothingOutstanding);
            }
            if cr.last_push_nonce != nonce {
                return Err(AckRejected::NonceMismatch { expected: cr.last_push_nonce.clone() });
            }
            cr.acked_version = cr.last_pushed_version.clone();
            cr.pushing_status = PushingStatus::Pushed;
            cr.acked_revision()
        };
        self.bump();
        Ok(revision)
    }

    /// Flip to `Disconnected`. Returns false if already disconnected.
    pub(crate) fn close(&self) -> bool {
        {
            let mut st = self.lock();
            if st.status == ConnectionStatus::Disconnected {
                return false;
            }
            st.status = ConnectionStatus::Disconnected;
        }
        self.transport.disconnect();
        self.queue.shutdown();
        self.bump();
        true
    }

    /// Resolve once the connection is disconnected.
    pub async fn closed(&self) {
        let mut rx = self.progress.subscribe();
        while self.status() != ConnectionStatus::Disconnected {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until no push of `kind` is outstanding. The deadline runs from the
    /// moment the outstanding push was sent.
    async fn wait_for_ack(&self, kind: ResourceKind, block_max_time: Duration) -> Result<(), DispatchError> {
        let mut rx = self.progress.subscribe();
        loop {
            let deadline = {
                let mut st = self.lock();
                if st.status == ConnectionStatus::Disconnected {
                    return Err(DispatchError::Closed);
                }
                match st.client_rules.get_mut(&kind) {
                    Some(cr) if cr.pushing_status == PushingStatus::Pushing => {
                        cr.push_queued = true;
                        cr.pushed_at.unwrap_or_else(Instant::now) + block_max_time
                    }
                    _ => return Ok(()),
                }
            };
            debug!(conn = self.id, kind = kind.kind(), "push outstanding; waiting for ack");
            match tokio::time::timeout_at(deadline.into(), rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(DispatchError::Closed),
                Err(_) => return Err(DispatchError::Unresponsive(block_max_time)),
            }
        }
    }

    /// Earliest moment an outstanding push runs out of time.
    fn ack_deadline(&self, block_max_time: Duration) -> Option<Instant> {
        let st = self.lock();
        st.client_rules
            .values()
            .filter(|cr| cr.pushing_status == PushingStatus::Pushing)
            .filter_map(|cr| cr.pushed_at)
            .min()
            .map(|at| at + block_max_time)
    }

    /// A kind whose push has stayed un-acked for `block_max_time` or longer.
    fn overdue(&self, block_max_time: Duration) -> Option<ResourceKind> {
        let now = Instant::now();
        let st = self.lock();
        st.client_rules
            .iter()
            .filter(|(_, cr)| cr.pushing_status == PushingStatus::Pushing)
            .find(|(_, cr)| cr.pushed_at.is_some_and(|at| at + block_max_time <= now))
            .map(|(kind, _)| *kind)
    }

    /// Render `origin` for this endpoint and send it unless the client already
    /// holds equivalent data.
    pub(crate) async fn deliver(
        &self,
        origin: &Origin,
        generators: &Generators,
        block_max_time: Duration,
    ) -> Result<Delivery, DispatchError> {
        let kind = origin.kind;
        if !self.is_listening(kind) {
            return Ok(Delivery::NotListened);
        }
        let rule = origin.exact(generators, &self.endpoint).map_err(DispatchError::Generate)?;
        self.wait_for_ack(kind, block_max_time).await?;

        let response = {
            let mut st = self.lock();
            if st.status == ConnectionStatus::Disconnected {
                return Err(DispatchError::Closed);
            }
            let Some(cr) = st.client_rules.get_mut(&kind) else {
                return Ok(Delivery::NotListened);
            };
            cr.push_queued = false;
            if cr.holds(&rule) {
                return Ok(Delivery::UpToDate);
            }
            cr.nonce_counter += 1;
            let nonce = cr.nonce_counter.to_string();
            let rule = Arc::new(rule);
            cr.pushing_status = PushingStatus::Pushing;
            cr.last_pushed_version = Some(Arc::clone(&rule));
            cr.last_push_nonce = nonce.clone();
            cr.last_pushed_time = Some(Utc::now());
            cr.pushed_at = Some(Instant::now());
            ObserveResponse { kind: kind.as_str().to_string(), nonce, revision: rule.revision, data: rule.data.clone() }
        };
        let nonce = response.nonce.clone();
        self.transport.send(response).await.map_err(DispatchError::Transport)?;
        Ok(Delivery::Pushed { nonce })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AckRejected {
    NotSubscribed,
    NothingOutstanding,
    NonceMismatch { expected: String },
}

/// Reads requests until EOF, error or disconnect.
pub(crate) async fn run_reader(storage: Arc<Storage>, conn: Arc<Connection>) {
    loop {
        let next = tokio::select! {
            r = conn.transport.recv() => r,
            _ = conn.closed() => return,
        };
        match next {
            Ok(req) => storage.handle_request(&conn, req),
            Err(TransportError::Closed) => {
                info!(conn = conn.id, endpoint = %conn.endpoint, "observe stream closed by client");
                storage.disconnect(&conn);
                return;
            }
            Err(e) => {
                warn!(conn = conn.id, endpoint = %conn.endpoint, error = %e, "observe stream failed");
                storage.disconnect(&conn);
                return;
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Drains the connection's queue in order, one outstanding push at a time. An
/// idle worker still drops the client once a push outlives `block_max_time`.
pub(crate) async fn run_dispatch(storage: Arc<Storage>, conn: Arc<Connection>) {
    let block_max_time = storage.options().block_max_time;
    loop {
        let deadline = conn.ack_deadline(block_max_time);
        let origin = tokio::select! {
            next = conn.queue.pop() => match next {
                Some(origin) => origin,
                None => break,
            },
            _ = sleep_until(deadline) => {
                if let Some(kind) = conn.overdue(block_max_time) {
                    warn!(conn = conn.id, kind = kind.kind(), waited_ms = block_max_time.as_millis() as u64, "no ack within block max time; disconnecting");
                    storage.disconnect(&conn);
                    break;
                }
                continue;
            }
        };
        let kind = origin.kind.kind();
        match conn.deliver(&origin, storage.generators(), block_max_time).await {
            Ok(Delivery::Pushed { nonce }) => {
                metrics::counter!("dds_push_total", 1u64, "kind" => kind);
                info!(conn = conn.id, kind, revision = origin.revision, nonce = %nonce, "pushed");
            }
            Ok(Delivery::UpToDate) => {
                metrics::counter!("dds_push_skipped_total", 1u64, "kind" => kind);
                debug!(conn = conn.id, kind, revision = origin.revision, "client already up to date");
            }
            Ok(Delivery::NotListened) => {
                debug!(conn = conn.id, kind, "kind not listened; dropping");
            }
            Err(DispatchError::Generate(e)) => {
                warn!(conn = conn.id, kind, revision = origin.revision, error = %e, "rendering failed; skipping");
            }
            Err(DispatchError::Transport(e)) => {
                warn!(conn = conn.id, kind, error = %e, "push failed; disconnecting");
                storage.disconnect(&conn);
                break;
            }
            Err(DispatchError::Unresponsive(waited)) => {
                warn!(conn = conn.id, kind, waited_ms = waited.as_millis() as u64, "no ack within block max time; disconnecting");
                storage.disconnect(&conn);
                break;
            }
            Err(DispatchError::Closed) => break,
        }
    }
    debug!(conn = conn.id, "dispatch worker stopped");
}
