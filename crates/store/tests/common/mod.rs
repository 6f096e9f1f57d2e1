#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dds_core::{DdsOptions, ObserveRequest, ObserveResponse, ResourceKind, RuleObject, TransportError};
use dds_rules::{Generators, Origin};
use dds_store::{ChannelClient, Storage, Transport};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Scripted transport: requests are fed through `script`, sends are recorded.
pub struct FakeTransport {
    requests: AsyncMutex<mpsc::UnboundedReceiver<Result<ObserveRequest, TransportError>>>,
    pub sent: Mutex<Vec<ObserveResponse>>,
    pub fail_sends: AtomicBool,
    pub disconnects: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<Result<ObserveRequest, TransportError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let t = Arc::new(Self {
            requests: AsyncMutex::new(rx),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
        });
        (t, tx)
    }

    pub fn sent(&self) -> Vec<ObserveResponse> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, response: ObserveResponse) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("broken pipe".into()));
        }
        self.sent.lock().unwrap().push(response);
        Ok(())
    }

    async fn recv(&self) -> Result<ObserveRequest, TransportError> {
        match self.requests.lock().await.recv().await {
            Some(r) => r,
            // Script exhausted: behave like an idle client.
            None => std::future::pending().await,
        }
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn storage() -> Arc<Storage> {
    storage_with(DdsOptions::default())
}

pub fn storage_with(options: DdsOptions) -> Arc<Storage> {
    Storage::new(Generators::default(), options)
}

pub fn tag_route(revision: i64, force: bool) -> Origin {
    Origin::new(
        ResourceKind::TagRoute,
        revision,
        vec![RuleObject::new("demo", "default", serde_json::json!({ "force": force, "tags": [] }))],
    )
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn next_push(client: &mut ChannelClient) -> ObserveResponse {
    tokio::time::timeout(Duration::from_secs(2), client.next_push())
        .await
        .expect("push in time")
        .expect("stream open")
}

/// Assert nothing arrives for a short while.
pub async fn no_push(client: &mut ChannelClient) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.try_next_push().is_none(), "unexpected push");
}
