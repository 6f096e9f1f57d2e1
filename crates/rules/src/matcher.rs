//! Selector / target matching against an endpoint.
//!
//! A selector matches when every non-empty criterion holds; an empty criterion
//! is vacuously true. Malformed CIDRs and endpoint IPs are logged and skipped.

use std::net::IpAddr;

use dds_core::policy::{Extend, PolicySelector};
use dds_core::Endpoint;
use ipnet::IpNet;
use serde_json::Value;
use tracing::warn;

/// True when `endpoint` satisfies every criterion of `selector`.
pub fn matches(selector: &PolicySelector, endpoint: &Endpoint) -> bool {
    if !match_namespaces(&selector.namespaces, endpoint) {
        return false;
    }
    if !match_not_namespaces(&selector.not_namespaces, endpoint) {
        return false;
    }
    if !selector.ip_blocks.is_empty() && !any_ip_in_blocks(&selector.ip_blocks, endpoint) {
        return false;
    }
    if !selector.not_ip_blocks.is_empty() && any_ip_in_blocks(&selector.not_ip_blocks, endpoint) {
        return false;
    }
    if !selector.principals.is_empty() && !any_principal(&selector.principals, endpoint) {
        return false;
    }
    if !selector.not_principals.is_empty() && any_principal(&selector.not_principals, endpoint) {
        return false;
    }
    if selector.extends.is_empty() && selector.not_extends.is_empty() {
        return true;
    }

    let doc = match serde_json::to_value(endpoint) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, endpoint = %endpoint, "serializing endpoint failed");
            return false;
        }
    };
    if !selector.extends.is_empty() && !any_extend(&selector.extends, &doc) {
        return false;
    }
    if !selector.not_extends.is_empty() && any_extend(&selector.not_extends, &doc) {
        return false;
    }
    true
}

fn match_namespaces(namespaces: &[String], endpoint: &Endpoint) -> bool {
    if namespaces.is_empty() {
        return true;
    }
    match endpoint.namespace() {
        Some(ns) => namespaces.iter().any(|n| n == ns),
        None => false,
    }
}

fn match_not_namespaces(namespaces: &[String], endpoint: &Endpoint) -> bool {
    match endpoint.namespace() {
        Some(ns) => !namespaces.iter().any(|n| n == ns),
        None => true,
    }
}

fn any_ip_in_blocks(blocks: &[String], endpoint: &Endpoint) -> bool {
    let addrs: Vec<IpAddr> = endpoint
        .ips
        .iter()
        .filter_map(|ip| match ip.parse::<IpAddr>() {
            Ok(a) => Some(a),
            Err(e) => {
                warn!(ip = %ip, error = %e, "skipping unparsable endpoint ip");
                None
            }
        })
        .collect();
    for block in blocks {
        let net = match block.parse::<IpNet>() {
            Ok(n) => n,
            Err(e) => {
                warn!(block = %block, error = %e, "skipping malformed ip block");
                continue;
            }
        };
        if addrs.iter().any(|a| net.contains(a)) {
            return true;
        }
    }
    false
}

fn any_principal(principals: &[String], endpoint: &Endpoint) -> bool {
    principals.iter().any(|p| *p == endpoint.spiffe_id || p == endpoint.principal())
}

fn any_extend(extends: &[Extend], doc: &Value) -> bool {
    extends.iter().any(|e| lookup(doc, &e.key) == e.value)
}

/// Resolve a dot-separated path (`kubernetesEnv.podLabels.app`, `ips.0`) to its
/// string form. Missing paths read as the empty string.
pub fn lookup(doc: &Value, path: &str) -> String {
    let mut cur = doc;
    for seg in path.split('.') {
        let next = match cur {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => cur = v,
            None => return String::new(),
        }
    }
    match cur {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
