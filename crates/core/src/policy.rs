//! Typed specs of the two policy kinds and the envelopes sent to clients.
//!
//! Every field is optional on input. Empty lists are omitted on output so that
//! rendered payloads stay small and stable.

use serde::{Deserialize, Serialize};

/// Key/value criterion evaluated against the endpoint's JSON form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Extend {
    pub key: String,
    pub value: String,
}

/// AND-combined matching criteria. Used as an authentication selector, an
/// authorization target and an authorization source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicySelector {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub not_namespaces: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip_blocks: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub not_ip_blocks: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub principals: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub not_principals: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extends: Vec<Extend>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub not_extends: Vec<Extend>,
}

impl PolicySelector {
    pub fn in_namespace(ns: impl Into<String>) -> Self {
        Self { namespaces: vec![ns.into()], ..Default::default() }
    }

    /// Names namespaces either way.
    pub fn restricts_namespace(&self) -> bool {
        !self.namespaces.is_empty() || !self.not_namespaces.is_empty()
    }

    /// Restrict to `ns` when no namespace restriction is present yet. Explicit
    /// lists are kept as written.
    pub fn default_namespace(&mut self, ns: &str) {
        if !self.restricts_namespace() {
            self.namespaces.push(ns.to_string());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortLevel {
    pub port: i32,
    pub action: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthenticationPolicy {
    pub action: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub selector: Vec<PolicySelector>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub port_level: Vec<PortLevel>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionMatch {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Condition {
    pub key: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<ConditionMatch>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub not_values: Vec<ConditionMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<PolicySelector>,
    /// Audience of the rule; `None` matches every endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<PolicySelector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthorizationPolicy {
    pub action: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<AuthorizationRule>,
    pub samples: f32,
    pub order: f32,
    pub match_type: String,
}

/// Wire form of every data item: the object's key plus a client-facing spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<S> {
    pub key: String,
    pub spec: S,
}

/// Authentication policy as seen by a client: selectors already resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthenticationSpecToClient {
    pub action: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub port_level: Vec<PortLevel>,
}

impl From<AuthenticationPolicy> for AuthenticationSpecToClient {
    fn from(p: AuthenticationPolicy) -> Self {
        Self { action: p.action, port_level: p.port_level }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationRuleToClient {
    pub from: PolicySelector,
    pub when: Condition,
}

/// Authorization policy as seen by a client: targets already resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthorizationSpecToClient {
    pub action: String,
    pub samples: f32,
    pub order: f32,
    pub match_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<AuthorizationRuleToClient>,
}

impl From<AuthorizationPolicy> for AuthorizationSpecToClient {
    fn from(p: AuthorizationPolicy) -> Self {
        let rules = p
            .rules
            .into_iter()
            .map(|r| AuthorizationRuleToClient { from: r.from.unwrap_or_default(), when: r.when.unwrap_or_default() })
            .collect();
        Self { action: p.action, samples: p.samples, order: p.order, match_type: p.match_type, rules }
    }
}
