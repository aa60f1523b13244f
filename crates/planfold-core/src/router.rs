//! Router: decides which service claims each pending dependency.
//!
//! Routing is a chain of [`RoutingRule`]s evaluated in order; the first rule
//! that names a service wins. The default chain is affinity, then the
//! document-root owner, then the first matching non-owner service in
//! registration order. Dependencies no rule claims stay unassigned for this
//! iteration.

use std::collections::BTreeMap;

use planfold_types::models::{Dependency, DependencySet, NodeId, PipelineVersion};

use crate::service::{PlanCreatorService, ServiceRegistry};
use crate::yaml::{YamlField, YamlTree};

/// What a rule sees about one pending dependency.
#[derive(Debug)]
pub struct Candidate<'a> {
    pub node_id: &'a str,
    pub field: &'a YamlField<'a>,
    pub version: PipelineVersion,
    /// Service this node is pinned to, if any.
    pub affinity: Option<&'a str>,
}

/// One step of the routing chain.
pub trait RoutingRule: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// The service that should claim `candidate`, or `None` to defer to the
    /// next rule.
    fn select<'r>(
        &self,
        candidate: &Candidate<'_>,
        registry: &'r ServiceRegistry,
    ) -> Option<&'r PlanCreatorService>;
}

// Compile-time assertion: RoutingRule must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn RoutingRule) {}
};

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Honors a service pin, provided the pinned service can claim the field.
#[derive(Debug, Default)]
pub struct AffinityRule;

impl RoutingRule for AffinityRule {
    fn name(&self) -> &'static str {
        "affinity"
    }

    fn select<'r>(
        &self,
        candidate: &Candidate<'_>,
        registry: &'r ServiceRegistry,
    ) -> Option<&'r PlanCreatorService> {
        let service = registry.get(candidate.affinity?)?;
        service
            .claims(candidate.field, candidate.version)
            .then_some(service)
    }
}

/// The document-root owner gets first pick after affinity.
#[derive(Debug, Default)]
pub struct OwnerRule;

impl RoutingRule for OwnerRule {
    fn name(&self) -> &'static str {
        "owner"
    }

    fn select<'r>(
        &self,
        candidate: &Candidate<'_>,
        registry: &'r ServiceRegistry,
    ) -> Option<&'r PlanCreatorService> {
        registry
            .owner()
            .filter(|owner| owner.claims(candidate.field, candidate.version))
    }
}

/// First non-owner service, in registration order, whose predicate matches.
#[derive(Debug, Default)]
pub struct FirstMatchRule;

impl RoutingRule for FirstMatchRule {
    fn name(&self) -> &'static str {
        "first_match"
    }

    fn select<'r>(
        &self,
        candidate: &Candidate<'_>,
        registry: &'r ServiceRegistry,
    ) -> Option<&'r PlanCreatorService> {
        registry
            .non_owners()
            .find(|service| service.claims(candidate.field, candidate.version))
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Result of routing one iteration: a partition of the pending set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Routing {
    /// Service name -> dependencies it claims, in node-id order.
    pub assigned: BTreeMap<String, Vec<Dependency>>,
    /// Dependencies nobody claimed this iteration.
    pub unassigned: Vec<Dependency>,
}

impl Routing {
    /// Number of dependencies assigned to some service.
    pub fn assigned_count(&self) -> usize {
        self.assigned.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }
}

/// An ordered chain of routing rules.
pub struct Router {
    rules: Vec<Box<dyn RoutingRule>>,
}

impl Router {
    /// Build a router from an explicit rule chain.
    pub fn with_rules(rules: Vec<Box<dyn RoutingRule>>) -> Self {
        Self { rules }
    }

    /// Names of the rules, in evaluation order.
    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Partition the pending dependencies of `deps` by claiming service.
    ///
    /// `tree` must be parsed from `deps.yaml`. Paths that do not resolve in
    /// the tree are left unassigned.
    pub fn route(
        &self,
        deps: &DependencySet,
        tree: &YamlTree,
        registry: &ServiceRegistry,
        version: PipelineVersion,
    ) -> Routing {
        let mut routing = Routing::default();

        for dependency in deps.dependencies() {
            let field = match tree.field_at(&dependency.path) {
                Ok(Some(field)) => field,
                Ok(None) => {
                    tracing::warn!(
                        node_id = %dependency.node_id,
                        path = %dependency.path,
                        "dependency path not found in document"
                    );
                    routing.unassigned.push(dependency);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        node_id = %dependency.node_id,
                        path = %dependency.path,
                        error = %e,
                        "dependency path is malformed"
                    );
                    routing.unassigned.push(dependency);
                    continue;
                }
            };

            let candidate = Candidate {
                node_id: &dependency.node_id,
                field: &field,
                version,
                affinity: affinity_of(deps, &dependency.node_id),
            };

            match self.select(&candidate, registry) {
                Some((rule, service)) => {
                    tracing::debug!(
                        node_id = %dependency.node_id,
                        service = %service.name(),
                        rule = rule,
                        "dependency routed"
                    );
                    routing
                        .assigned
                        .entry(service.name().to_string())
                        .or_default()
                        .push(dependency);
                }
                None => {
                    tracing::debug!(
                        node_id = %dependency.node_id,
                        path = %dependency.path,
                        "no service claims dependency"
                    );
                    routing.unassigned.push(dependency);
                }
            }
        }

        routing
    }

    fn select<'r>(
        &self,
        candidate: &Candidate<'_>,
        registry: &'r ServiceRegistry,
    ) -> Option<(&'static str, &'r PlanCreatorService)> {
        self.rules.iter().find_map(|rule| {
            rule.select(candidate, registry)
                .map(|service| (rule.name(), service))
        })
    }
}

impl Default for Router {
    /// Affinity, then owner, then first match.
    fn default() -> Self {
        Self::with_rules(vec![
            Box::new(AffinityRule),
            Box::new(OwnerRule),
            Box::new(FirstMatchRule),
        ])
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("rules", &self.rule_names())
            .finish()
    }
}

fn affinity_of<'a>(deps: &'a DependencySet, node_id: &NodeId) -> Option<&'a str> {
    deps.service_affinity.get(node_id).map(String::as_str)
}
