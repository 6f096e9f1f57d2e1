//! DDS rules: stored snapshots (`Origin`) and their lazy, per-endpoint rendering
//! through the generator registry.

#![forbid(unsafe_code)]

use std::sync::Arc;

use dds_core::{Endpoint, GenerateError, ResourceKind, RuleObject, VersionedRule};
use rustc_hash::FxHashMap;

mod generate;
pub mod matcher;

pub use generate::{AuthenticationGenerator, AuthorizationGenerator, Generator, PassthroughGenerator};

/// Generator registry keyed by kind.
pub struct Generators {
    map: FxHashMap<ResourceKind, Box<dyn Generator>>,
}

impl Generators {
    /// Empty registry; rendering any kind fails until a generator is registered.
    pub fn empty() -> Self {
        Self { map: FxHashMap::default() }
    }

    pub fn register(&mut self, kind: ResourceKind, generator: impl Generator + 'static) {
        self.map.insert(kind, Box::new(generator));
    }

    pub fn get(&self, kind: ResourceKind) -> Option<&dyn Generator> {
        self.map.get(&kind).map(|g| g.as_ref())
    }
}

impl Default for Generators {
    /// Registry covering every supported kind.
    fn default() -> Self {
        let mut g = Self::empty();
        g.register(ResourceKind::AuthenticationPolicy, AuthenticationGenerator);
        g.register(ResourceKind::AuthorizationPolicy, AuthorizationGenerator);
        g.register(ResourceKind::ServiceNameMapping, PassthroughGenerator);
        g.register(ResourceKind::TagRoute, PassthroughGenerator);
        g.register(ResourceKind::DynamicConfig, PassthroughGenerator);
        g.register(ResourceKind::ConditionRoute, PassthroughGenerator);
        g
    }
}

/// One revision of the full object set of one kind. Rendering for a given
/// endpoint is deferred to push time via [`Origin::exact`].
#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    pub kind: ResourceKind,
    pub revision: i64,
    pub objects: Arc<[RuleObject]>,
}

impl Origin {
    pub fn new(kind: ResourceKind, revision: i64, objects: Vec<RuleObject>) -> Self {
        Self { kind, revision, objects: objects.into() }
    }

    /// Materialize this snapshot for `endpoint`.
    pub fn exact(&self, generators: &Generators, endpoint: &Endpoint) -> Result<VersionedRule, GenerateError> {
        let generator = generators.get(self.kind).ok_or(GenerateError::MissingGenerator(self.kind.kind()))?;
        let data = generator.generate(&self.objects, endpoint).inspect_err(|_| {
            metrics::counter!("dds_generate_errors_total", 1u64);
        })?;
        Ok(VersionedRule { revision: self.revision, kind: self.kind, data })
    }
}
