use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Identity and metadata of a connected data-plane client; the subject policies
/// are matched against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Endpoint {
    pub id: String,
    pub ips: SmallVec<[String; 2]>,
    /// SPIFFE principal, with or without the `spiffe://` scheme.
    pub spiffe_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes_env: Option<KubernetesEnv>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesEnv {
    pub namespace: String,
    pub pod_name: String,
    pub pod_labels: BTreeMap<String, String>,
    pub pod_annotations: BTreeMap<String, String>,
    pub deployment_name: String,
    pub stateful_set_name: String,
}

impl Endpoint {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Default::default() }
    }

    pub fn with_ips<I, S>(mut self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ips = ips.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_spiffe_id(mut self, id: impl Into<String>) -> Self {
        self.spiffe_id = id.into();
        self
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.kubernetes_env.get_or_insert_with(KubernetesEnv::default).namespace = ns.into();
        self
    }

    pub fn with_pod_name(mut self, pod: impl Into<String>) -> Self {
        self.kubernetes_env.get_or_insert_with(KubernetesEnv::default).pod_name = pod.into();
        self
    }

    /// Kubernetes namespace, when the endpoint runs in a pod.
    pub fn namespace(&self) -> Option<&str> {
        self.kubernetes_env.as_ref().map(|k| k.namespace.as_str())
    }

    /// Principal with the `spiffe://` scheme removed.
    pub fn principal(&self) -> &str {
        self.spiffe_id.strip_prefix("spiffe://").unwrap_or(&self.spiffe_id)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.id, self.ips.join(","))
    }
}
