use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::predicate::Predicate;
use crate::registry::Registry;

/// A predicate rewriter: receives the predicate a traversal level is about to
/// compile and returns the predicate to use instead.
pub type PredicateHook = Arc<dyn Fn(&Registry, &str, Predicate) -> Predicate + Send + Sync>;

/// A values rewriter: receives a create row or update change-set and returns
/// the map to use instead. Runs before the required-column check, so it may
/// supply values the caller omitted.
pub type ValuesHook = Arc<dyn Fn(&Registry, &str, Map<String, Value>) -> Map<String, Value> + Send + Sync>;

/// Where a hook applies.
#[derive(Debug, Clone)]
pub enum HookScope {
    /// Every model.
    Global,
    /// One model by name.
    Model(String),
}

impl From<&str> for HookScope {
    fn from(model: &str) -> Self {
        Self::Model(model.to_string())
    }
}

impl From<String> for HookScope {
    fn from(model: String) -> Self {
        Self::Model(model)
    }
}

struct HookList<H> {
    global: Vec<H>,
    scoped: HashMap<String, Vec<H>>,
}

impl<H> Default for HookList<H> {
    fn default() -> Self {
        Self {
            global: Vec::new(),
            scoped: HashMap::new(),
        }
    }
}

impl<H> HookList<H> {
    fn register(&mut self, scope: HookScope, hook: H) {
        match scope {
            HookScope::Global => self.global.push(hook),
            HookScope::Model(model) => self.scoped.entry(model).or_default().push(hook),
        }
    }

    /// Hooks for `model`: global ones first, then model-scoped ones, each in
    /// registration order.
    fn for_model(&self, model: &str) -> impl Iterator<Item = &H> {
        self.global
            .iter()
            .chain(self.scoped.get(model).into_iter().flatten())
    }
}

/// The middleware pipeline: ordered rewrite functions per hook point.
///
/// Composition order is deterministic: global hooks run before model-scoped
/// hooks, and each list composes left-to-right in registration order, every
/// hook consuming the previous output. Predicate hooks are re-applied
/// independently at every relation depth during planning.
#[derive(Default)]
pub struct Hooks {
    find_predicate: HookList<PredicateHook>,
    count_predicate: HookList<PredicateHook>,
    update_predicate: HookList<PredicateHook>,
    delete_predicate: HookList<PredicateHook>,
    create_values: HookList<ValuesHook>,
    update_values: HookList<ValuesHook>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Hooks")
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_predicate<F>(mut self, scope: impl Into<HookScope>, hook: F) -> Self
    where
        F: Fn(&Registry, &str, Predicate) -> Predicate + Send + Sync + 'static,
    {
        self.find_predicate.register(scope.into(), Arc::new(hook));
        self
    }

    pub fn count_predicate<F>(mut self, scope: impl Into<HookScope>, hook: F) -> Self
    where
        F: Fn(&Registry, &str, Predicate) -> Predicate + Send + Sync + 'static,
    {
        self.count_predicate.register(scope.into(), Arc::new(hook));
        self
    }

    pub fn update_predicate<F>(mut self, scope: impl Into<HookScope>, hook: F) -> Self
    where
        F: Fn(&Registry, &str, Predicate) -> Predicate + Send + Sync + 'static,
    {
        self.update_predicate.register(scope.into(), Arc::new(hook));
        self
    }

    pub fn delete_predicate<F>(mut self, scope: impl Into<HookScope>, hook: F) -> Self
    where
        F: Fn(&Registry, &str, Predicate) -> Predicate + Send + Sync + 'static,
    {
        self.delete_predicate.register(scope.into(), Arc::new(hook));
        self
    }

    pub fn create_values<F>(mut self, scope: impl Into<HookScope>, hook: F) -> Self
    where
        F: Fn(&Registry, &str, Map<String, Value>) -> Map<String, Value> + Send + Sync + 'static,
    {
        self.create_values.register(scope.into(), Arc::new(hook));
        self
    }

    pub fn update_values<F>(mut self, scope: impl Into<HookScope>, hook: F) -> Self
    where
        F: Fn(&Registry, &str, Map<String, Value>) -> Map<String, Value> + Send + Sync + 'static,
    {
        self.update_values.register(scope.into(), Arc::new(hook));
        self
    }

    fn apply_predicate(
        list: &HookList<PredicateHook>,
        registry: &Registry,
        model: &str,
        predicate: Option<Predicate>,
    ) -> Option<Predicate> {
        let mut current = predicate.unwrap_or_else(|| Predicate::And(Vec::new()));
        for hook in list.for_model(model) {
            current = hook(registry, model, current);
        }
        if current.is_empty() { None } else { Some(current) }
    }

    pub(crate) fn apply_find_predicate(
        &self,
        registry: &Registry,
        model: &str,
        predicate: Option<Predicate>,
    ) -> Option<Predicate> {
        Self::apply_predicate(&self.find_predicate, registry, model, predicate)
    }

    pub(crate) fn apply_count_predicate(
        &self,
        registry: &Registry,
        model: &str,
        predicate: Option<Predicate>,
    ) -> Option<Predicate> {
        Self::apply_predicate(&self.count_predicate, registry, model, predicate)
    }

    pub(crate) fn apply_update_predicate(
        &self,
        registry: &Registry,
        model: &str,
        predicate: Option<Predicate>,
    ) -> Option<Predicate> {
        Self::apply_predicate(&self.update_predicate, registry, model, predicate)
    }

    pub(crate) fn apply_delete_predicate(
        &self,
        registry: &Registry,
        model: &str,
        predicate: Option<Predicate>,
    ) -> Option<Predicate> {
        Self::apply_predicate(&self.delete_predicate, registry, model, predicate)
    }

    fn apply_values(
        list: &HookList<ValuesHook>,
        registry: &Registry,
        model: &str,
        values: Map<String, Value>,
    ) -> Map<String, Value> {
        let mut current = values;
        for hook in list.for_model(model) {
            current = hook(registry, model, current);
        }
        current
    }

    pub(crate) fn apply_create_values(
        &self,
        registry: &Registry,
        model: &str,
        values: Map<String, Value>,
    ) -> Map<String, Value> {
        Self::apply_values(&self.create_values, registry, model, values)
    }

    pub(crate) fn apply_update_values(
        &self,
        registry: &Registry,
        model: &str,
        values: Map<String, Value>,
    ) -> Map<String, Value> {
        Self::apply_values(&self.update_values, registry, model, values)
    }
}
