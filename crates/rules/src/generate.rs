//! One generator per rule kind. Generators are pure: the same objects and
//! endpoint always render the same bytes.

use dds_core::policy::{
    AuthenticationPolicy, AuthenticationSpecToClient, AuthorizationPolicy, AuthorizationSpecToClient, Envelope,
};
use dds_core::{Endpoint, GenerateError, ResourceKind, RuleObject};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::matcher::matches;

/// Renders the objects of one kind into wire payloads for a requesting endpoint.
pub trait Generator: Send + Sync {
    fn generate(&self, objects: &[RuleObject], endpoint: &Endpoint) -> Result<Vec<Vec<u8>>, GenerateError>;
}

fn decode<T: DeserializeOwned>(kind: ResourceKind, obj: &RuleObject) -> Result<T, GenerateError> {
    serde_json::from_value(obj.spec.clone()).map_err(|source| GenerateError::Decode {
        kind: kind.kind(),
        key: obj.key(),
        source,
    })
}

fn encode<S: Serialize>(key: String, spec: S) -> Result<Vec<u8>, GenerateError> {
    let env = Envelope { key, spec };
    serde_json::to_vec(&env).map_err(|source| GenerateError::Encode { key: env.key.clone(), source })
}

/// Emits a policy only when the endpoint matches every selector; selectors are
/// stripped from the output.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthenticationGenerator;

impl Generator for AuthenticationGenerator {
    fn generate(&self, objects: &[RuleObject], endpoint: &Endpoint) -> Result<Vec<Vec<u8>>, GenerateError> {
        let mut out = Vec::with_capacity(objects.len());
        for obj in objects {
            let policy: AuthenticationPolicy = decode(ResourceKind::AuthenticationPolicy, obj)?;
            if !policy.selector.iter().all(|s| matches(s, endpoint)) {
                debug!(key = %obj.key(), endpoint = %endpoint, "authentication policy not selected");
                continue;
            }
            out.push(encode(obj.key(), AuthenticationSpecToClient::from(policy))?);
        }
        Ok(out)
    }
}

/// Emits a policy only when every rule's target matches the endpoint; a single
/// failing target excludes the whole policy. Targets are stripped from the output.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthorizationGenerator;

impl Generator for AuthorizationGenerator {
    fn generate(&self, objects: &[RuleObject], endpoint: &Endpoint) -> Result<Vec<Vec<u8>>, GenerateError> {
        let mut out = Vec::with_capacity(objects.len());
        for obj in objects {
            let policy: AuthorizationPolicy = decode(ResourceKind::AuthorizationPolicy, obj)?;
            let selected = policy.rules.iter().all(|r| r.to.as_ref().map_or(true, |t| matches(t, endpoint)));
            if !selected {
                debug!(key = %obj.key(), endpoint = %endpoint, "authorization policy not selected");
                continue;
            }
            out.push(encode(obj.key(), AuthorizationSpecToClient::from(policy))?);
        }
        Ok(out)
    }
}

/// Routing and config kinds: every object is sent as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughGenerator;

impl Generator for PassthroughGenerator {
    fn generate(&self, objects: &[RuleObject], _endpoint: &Endpoint) -> Result<Vec<Vec<u8>>, GenerateError> {
        objects.iter().map(|o| encode(o.key(), &o.spec)).collect()
    }
}
