use std::time::Duration;

use tracing::warn;

/// Tunables the distribution core honours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdsOptions {
    /// Policies in this namespace apply mesh-wide; policies elsewhere are scoped
    /// to their own namespace.
    pub root_namespace: String,
    /// How long a push may stay un-acknowledged before the connection is dropped.
    pub block_max_time: Duration,
    /// Request channel depth of the in-process transport.
    pub request_buffer: usize,
}

impl Default for DdsOptions {
    fn default() -> Self {
        Self {
            root_namespace: "dubbo-system".to_string(),
            block_max_time: Duration::from_secs(15),
            request_buffer: 64,
        }
    }
}

impl DdsOptions {
    /// Read `DDS_ROOT_NAMESPACE`, `DDS_BLOCK_MAX_TIME_MS` and `DDS_REQUEST_BUFFER`,
    /// falling back to defaults.
    pub fn from_env() -> Self {
        let mut o = Self::default();
        if let Ok(ns) = std::env::var("DDS_ROOT_NAMESPACE") {
            if !ns.is_empty() {
                o.root_namespace = ns;
            }
        }
        if let Some(ms) = env_parse::<u64>("DDS_BLOCK_MAX_TIME_MS") {
            o.block_max_time = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("DDS_REQUEST_BUFFER") {
            o.request_buffer = n.max(1);
        }
        o
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable option");
            None
        }
    }
}
