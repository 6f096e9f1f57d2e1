//! DDS core types: resource kinds, raw rule objects, rendered payloads and the
//! observe wire messages exchanged with data-plane clients.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod endpoint;
mod error;
mod options;
pub mod policy;

pub use endpoint::{Endpoint, KubernetesEnv};
pub use error::{GenerateError, KindError, TransportError};
pub use options::DdsOptions;

pub mod prelude {
    pub use super::{
        DdsOptions, Endpoint, GenerateError, KindError, KubernetesEnv, ObserveRequest, ObserveResponse,
        ResourceKind, RuleObject, TransportError, VersionedRule,
    };
}

/// API group shared by every rule kind.
pub const GROUP: &str = "dubbo.apache.org";
/// Served version of every rule kind.
pub const VERSION: &str = "v1alpha1";

/// The rule kinds the control plane distributes. The wire `type` of a kind is its
/// GVK key (`group/version/Kind`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    AuthenticationPolicy,
    AuthorizationPolicy,
    ServiceNameMapping,
    TagRoute,
    DynamicConfig,
    ConditionRoute,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::AuthenticationPolicy,
        ResourceKind::AuthorizationPolicy,
        ResourceKind::ServiceNameMapping,
        ResourceKind::TagRoute,
        ResourceKind::DynamicConfig,
        ResourceKind::ConditionRoute,
    ];

    /// GVK key used as the wire type, e.g. `dubbo.apache.org/v1alpha1/TagRoute`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::AuthenticationPolicy => "dubbo.apache.org/v1alpha1/AuthenticationPolicy",
            ResourceKind::AuthorizationPolicy => "dubbo.apache.org/v1alpha1/AuthorizationPolicy",
            ResourceKind::ServiceNameMapping => "dubbo.apache.org/v1alpha1/ServiceNameMapping",
            ResourceKind::TagRoute => "dubbo.apache.org/v1alpha1/TagRoute",
            ResourceKind::DynamicConfig => "dubbo.apache.org/v1alpha1/DynamicConfig",
            ResourceKind::ConditionRoute => "dubbo.apache.org/v1alpha1/ConditionRoute",
        }
    }

    /// Bare kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceKind::AuthenticationPolicy => "AuthenticationPolicy",
            ResourceKind::AuthorizationPolicy => "AuthorizationPolicy",
            ResourceKind::ServiceNameMapping => "ServiceNameMapping",
            ResourceKind::TagRoute => "TagRoute",
            ResourceKind::DynamicConfig => "DynamicConfig",
            ResourceKind::ConditionRoute => "ConditionRoute",
        }
    }

    /// Plural resource name used by the Kubernetes API.
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::AuthenticationPolicy => "authenticationpolicies",
            ResourceKind::AuthorizationPolicy => "authorizationpolicies",
            ResourceKind::ServiceNameMapping => "servicenamemappings",
            ResourceKind::TagRoute => "tagroutes",
            ResourceKind::DynamicConfig => "dynamicconfigs",
            ResourceKind::ConditionRoute => "conditionroutes",
        }
    }

    /// Policy kinds carry an audience (selectors / targets) and are rendered per endpoint.
    pub fn is_policy(&self) -> bool {
        matches!(self, ResourceKind::AuthenticationPolicy | ResourceKind::AuthorizationPolicy)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = KindError;

    /// Accepts the full GVK key or the bare kind name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(KindError::Empty);
        }
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s || k.kind() == s)
            .ok_or_else(|| KindError::Unsupported(s.to_string()))
    }
}

/// One custom resource as listed from the configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleObject {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl RuleObject {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, spec: serde_json::Value) -> Self {
        Self { name: name.into(), namespace: namespace.into(), spec }
    }

    /// Envelope key sent to clients: `name/namespace`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.name, self.namespace)
    }
}

/// Rendered payload of one revision of one kind for one endpoint. Never mutated
/// after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRule {
    pub revision: i64,
    pub kind: ResourceKind,
    pub data: Vec<Vec<u8>>,
}

/// Client -> server. Empty `nonce` subscribes to `type`; a non-empty one acknowledges a push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserveRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub nonce: String,
}

impl ObserveRequest {
    pub fn subscribe(kind: ResourceKind) -> Self {
        Self { kind: kind.as_str().to_string(), nonce: String::new() }
    }

    pub fn ack(kind: ResourceKind, nonce: impl Into<String>) -> Self {
        Self { kind: kind.as_str().to_string(), nonce: nonce.into() }
    }
}

/// Server -> client push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserveResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub nonce: String,
    pub revision: i64,
    #[serde(default)]
    pub data: Vec<Vec<u8>>,
}
