//! Service registry -- the ordered collection of plan-creation services.
//!
//! Registration order matters: when neither affinity nor the owner applies,
//! the router hands a dependency to the first matching non-owner service.

use std::collections::BTreeSet;
use std::sync::Arc;

use planfold_types::models::PipelineVersion;

use super::client::PlanCreatorClient;
use super::supported::SupportedTypes;
use crate::yaml::YamlField;

/// A remote service: its name, what it can claim, and how to reach it.
#[derive(Clone)]
pub struct PlanCreatorService {
    name: String,
    supported: SupportedTypes,
    versions: BTreeSet<PipelineVersion>,
    client: Arc<dyn PlanCreatorClient>,
}

impl PlanCreatorService {
    /// Create a service supporting every pipeline version.
    pub fn new(
        name: impl Into<String>,
        supported: SupportedTypes,
        client: impl PlanCreatorClient + 'static,
    ) -> Self {
        Self::from_arc(name, supported, Arc::new(client))
    }

    /// Like [`PlanCreatorService::new`] with an already shared client.
    pub fn from_arc(
        name: impl Into<String>,
        supported: SupportedTypes,
        client: Arc<dyn PlanCreatorClient>,
    ) -> Self {
        Self {
            name: name.into(),
            supported,
            versions: BTreeSet::from([PipelineVersion::V0, PipelineVersion::V1]),
            client,
        }
    }

    /// Restrict the pipeline versions this service understands.
    pub fn with_versions(mut self, versions: impl IntoIterator<Item = PipelineVersion>) -> Self {
        self.versions = versions.into_iter().collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supported(&self) -> &SupportedTypes {
        &self.supported
    }

    pub fn versions(&self) -> &BTreeSet<PipelineVersion> {
        &self.versions
    }

    pub fn client(&self) -> Arc<dyn PlanCreatorClient> {
        Arc::clone(&self.client)
    }

    /// The claim predicate: can this service handle `field` under
    /// `version`'s grammar?
    pub fn claims(&self, field: &YamlField<'_>, version: PipelineVersion) -> bool {
        self.versions.contains(&version) && self.supported.supports(field, version)
    }
}

impl std::fmt::Debug for PlanCreatorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanCreatorService")
            .field("name", &self.name)
            .field("supported", &self.supported)
            .field("versions", &self.versions)
            .finish_non_exhaustive()
    }
}

/// Registered services in registration order, plus the document-root owner.
///
/// # Example
///
/// ```ignore
/// let mut registry = ServiceRegistry::new();
/// registry.register_owner(PlanCreatorService::new("pms", pipeline_types, pms_client));
/// registry.register(PlanCreatorService::new("cd", cd_types, cd_client));
/// let owner = registry.owner().unwrap();
/// ```
#[derive(Default)]
pub struct ServiceRegistry {
    services: Vec<PlanCreatorService>,
    owner: Option<String>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service.
    ///
    /// A service with the same name is replaced in place (keeping its
    /// position) and the old one is returned.
    pub fn register(&mut self, service: PlanCreatorService) -> Option<PlanCreatorService> {
        match self.services.iter_mut().find(|s| s.name == service.name) {
            Some(existing) => Some(std::mem::replace(existing, service)),
            None => {
                self.services.push(service);
                None
            }
        }
    }

    /// Register a service and flag it as the document-root owner.
    pub fn register_owner(&mut self, service: PlanCreatorService) -> Option<PlanCreatorService> {
        self.owner = Some(service.name.clone());
        self.register(service)
    }

    /// Look up a service by name.
    pub fn get(&self, name: &str) -> Option<&PlanCreatorService> {
        self.services.iter().find(|s| s.name == name)
    }

    /// The document-root owner, if one is registered.
    pub fn owner(&self) -> Option<&PlanCreatorService> {
        self.owner.as_deref().and_then(|name| self.get(name))
    }

    /// Every service except the owner, in registration order.
    pub fn non_owners(&self) -> impl Iterator<Item = &PlanCreatorService> {
        self.services
            .iter()
            .filter(move |s| Some(s.name.as_str()) != self.owner.as_deref())
    }

    /// Every service, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &PlanCreatorService> {
        self.services.iter()
    }

    /// Names of all registered services, in registration order.
    pub fn list(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.list())
            .field("owner", &self.owner)
            .finish()
    }
}
