//! The bidirectional observe stream as seen by the control plane, plus an
//! in-process channel implementation used by the CLI and tests.

use async_trait::async_trait;
use dds_core::{ObserveRequest, ObserveResponse, ResourceKind, TransportError};
use tokio::sync::{mpsc, watch, Mutex};

/// One client's observe stream. `recv` is only ever called by the connection's
/// reader task; `send` only by its dispatch worker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, response: ObserveResponse) -> Result<(), TransportError>;

    /// Next request. `Err(TransportError::Closed)` signals a clean EOF.
    async fn recv(&self) -> Result<ObserveRequest, TransportError>;

    /// Tear the stream down. Must be idempotent.
    fn disconnect(&self);
}

/// Server half of an in-process observe stream.
pub struct ChannelTransport {
    requests: Mutex<mpsc::Receiver<ObserveRequest>>,
    responses: mpsc::Sender<ObserveResponse>,
    closed: watch::Sender<bool>,
}

/// Client half of an in-process observe stream.
pub struct ChannelClient {
    requests: Option<mpsc::Sender<ObserveRequest>>,
    responses: mpsc::Receiver<ObserveResponse>,
    closed: watch::Receiver<bool>,
}

/// Build a connected transport/client pair with `buffer` slots in each direction.
pub fn channel(buffer: usize) -> (ChannelTransport, ChannelClient) {
    let (req_tx, req_rx) = mpsc::channel(buffer.max(1));
    let (resp_tx, resp_rx) = mpsc::channel(buffer.max(1));
    let (closed_tx, closed_rx) = watch::channel(false);
    (
        ChannelTransport { requests: Mutex::new(req_rx), responses: resp_tx, closed: closed_tx },
        ChannelClient { requests: Some(req_tx), responses: resp_rx, closed: closed_rx },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, response: ObserveResponse) -> Result<(), TransportError> {
        let closed = *self.closed.borrow();
        if closed {
            return Err(TransportError::Closed);
        }
        self.responses.send(response).await.map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&self) -> Result<ObserveRequest, TransportError> {
        let mut closed = self.closed.subscribe();
        let already = *closed.borrow_and_update();
        if already {
            return Err(TransportError::Closed);
        }
        let mut rx = self.requests.lock().await;
        tokio::select! {
            req = rx.recv() => req.ok_or(TransportError::Closed),
            _ = closed.changed() => Err(TransportError::Closed),
        }
    }

    fn disconnect(&self) {
        self.closed.send_replace(true);
    }
}

impl ChannelClient {
    /// Send a raw request. Fails once the client half closed its sending side or
    /// the server dropped the stream.
    pub async fn request(&self, request: ObserveRequest) -> Result<(), TransportError> {
        match &self.requests {
            Some(tx) => tx.send(request).await.map_err(|e| TransportError::Send(e.to_string())),
            None => Err(TransportError::Closed),
        }
    }

    pub async fn subscribe(&self, kind: ResourceKind) -> Result<(), TransportError> {
        self.request(ObserveRequest::subscribe(kind)).await
    }

    pub async fn ack(&self, kind: ResourceKind, nonce: impl Into<String>) -> Result<(), TransportError> {
        self.request(ObserveRequest::ack(kind, nonce)).await
    }

    /// Next push, or `None` once the server side is gone.
    pub async fn next_push(&mut self) -> Option<ObserveResponse> {
        self.responses.recv().await
    }

    /// Non-blocking variant of [`ChannelClient::next_push`].
    pub fn try_next_push(&mut self) -> Option<ObserveResponse> {
        self.responses.try_recv().ok()
    }

    /// Close the request direction; the server sees a clean EOF.
    pub fn close(&mut self) {
        self.requests = None;
    }

    pub fn is_disconnected(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve once the server has dropped this stream.
    pub async fn disconnected(&mut self) {
        loop {
            let closed = *self.closed.borrow_and_update();
            if closed || self.closed.changed().await.is_err() {
                return;
            }
        }
    }
}
