use thiserror::Error;

/// A request named a type the control plane does not serve.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KindError {
    #[error("empty resource type")]
    Empty,
    #[error("unsupported resource type: {0}")]
    Unsupported(String),
}

/// A generator could not render a snapshot for an endpoint.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("decoding {kind} {key}: {source}")]
    Decode {
        kind: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no generator registered for {0}")]
    MissingGenerator(&'static str),
}

/// Failures of the bidirectional observe stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Peer closed the stream (clean EOF).
    #[error("stream closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Recv(String),
}
