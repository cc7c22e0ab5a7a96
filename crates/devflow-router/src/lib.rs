//! Routing: which provider and model serve a given phase
//!
//! The router is a pure function over an ordered rule table from
//! configuration. The first rule whose predicate matches the routing key
//! wins; a configured default is mandatory. Decisions are memoised per key,
//! which is sound because the table is immutable after construction.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use devflow_config::{RoutePredicate, RouteRule, RouterConfig, RoutingDecision};
use devflow_types::{Classified, ErrorClass, ModelSet, PhaseName, WorkflowKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("router configuration has no default route")]
    MissingDefault,
}

impl Classified for RouterError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

/// Everything a routing decision may depend on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub phase: PhaseName,
    pub kind: WorkflowKind,
    pub model_set: ModelSet,
    pub tags: BTreeSet<String>,
}

impl RouteKey {
    #[must_use]
    pub fn new(phase: PhaseName, kind: WorkflowKind, model_set: ModelSet) -> Self {
        Self {
            phase,
            kind,
            model_set,
            tags: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_tags(mut self, tags: BTreeSet<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// First-match-wins rule table with a decision cache.
pub struct Router {
    rules: Vec<RouteRule>,
    default: RoutingDecision,
    cache: Mutex<HashMap<RouteKey, RoutingDecision>>,
}

impl Router {
    pub fn from_config(config: &RouterConfig) -> Result<Self, RouterError> {
        let default = config.default.clone().ok_or(RouterError::MissingDefault)?;
        Ok(Self {
            rules: config.rules.clone(),
            default,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a routing key to a decision. Pure; no I/O.
    #[must_use]
    pub fn route(&self, key: &RouteKey) -> RoutingDecision {
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return hit.clone();
        }
        let decision = self
            .rules
            .iter()
            .find(|rule| matches(&rule.when, key))
            .map_or_else(|| self.default.clone(), |rule| rule.then.clone());
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), decision.clone());
        decision
    }
}

/// A predicate matches when every present field matches; `tags` requires
/// all listed tags to be present on the workflow.
fn matches(predicate: &RoutePredicate, key: &RouteKey) -> bool {
    if predicate.phase.is_some_and(|phase| phase != key.phase) {
        return false;
    }
    if predicate.kind.is_some_and(|kind| kind != key.kind) {
        return false;
    }
    if predicate
        .model_set
        .is_some_and(|model_set| model_set != key.model_set)
    {
        return false;
    }
    predicate.tags.iter().all(|tag| key.tags.contains(tag))
}
