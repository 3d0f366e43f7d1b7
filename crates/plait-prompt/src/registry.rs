use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use plait_core::error::{PlaitError, Result};
use plait_core::template::SourceRef;

use crate::value::{lookup, parse_path};

/// Name of the synthetic source exposing captured step outputs.
pub const STEP_OUTPUTS_SOURCE: &str = "stepOutputs";

/// Context key the runner stores accumulated step outputs under.
pub const STEP_INPUTS_KEY: &str = "stepInputs";

pub const TURN_GENERATION: &str = "turn_generation";
pub const CHAPTER_SUMMARIZATION: &str = "chapter_summarization";

/// A source resolver: `(ref, ctx) -> value`. `Value::Null` means "undefined".
pub type Resolver = dyn Fn(&SourceRef, &Value) -> Value + Send + Sync;

/// Registry of data sources.
pub trait SourceRegistry: Send + Sync {
    /// Resolve a source reference against a render context.
    fn resolve(&self, source_ref: &SourceRef, ctx: &Value) -> Value;

    /// Declared source names.
    fn list(&self) -> Vec<String>;

    fn contains(&self, name: &str) -> bool {
        self.list().iter().any(|n| n == name)
    }

    /// Declared names as a set, for compile-time checks.
    fn allowed_sources(&self) -> HashSet<String> {
        self.list().into_iter().collect()
    }
}

/// A fixed `name -> resolver` map built once per task kind.
pub struct StaticRegistry {
    task: String,
    resolvers: BTreeMap<String, Arc<Resolver>>,
}

impl StaticRegistry {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            resolvers: BTreeMap::new(),
        }
    }

    /// Register a resolver under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, resolver: F)
    where
        F: Fn(&SourceRef, &Value) -> Value + Send + Sync + 'static,
    {
        self.resolvers.insert(name.into(), Arc::new(resolver));
    }

    pub fn with_source<F>(mut self, name: impl Into<String>, resolver: F) -> Self
    where
        F: Fn(&SourceRef, &Value) -> Value + Send + Sync + 'static,
    {
        self.register(name, resolver);
        self
    }

    /// Register a source that reads the same-named context key.
    pub fn with_context_source(self, name: &str) -> Self {
        let key = name.to_string();
        self.with_source(name, move |r, ctx| context_value(&key, r, ctx))
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Built-in registry for interactive turn generation.
    pub fn turn_generation() -> Self {
        ["turns", "characters", "scenario", "globals", "intent"]
            .into_iter()
            .fold(Self::new(TURN_GENERATION), |reg, name| {
                reg.with_context_source(name)
            })
    }

    /// Built-in registry for chapter summarization.
    pub fn chapter_summarization() -> Self {
        ["chapter", "turns", "characters", "globals"]
            .into_iter()
            .fold(Self::new(CHAPTER_SUMMARIZATION), |reg, name| {
                reg.with_context_source(name)
            })
    }
}

impl SourceRegistry for StaticRegistry {
    fn resolve(&self, source_ref: &SourceRef, ctx: &Value) -> Value {
        match self.resolvers.get(&source_ref.source) {
            Some(resolver) => resolver(source_ref, ctx),
            None => {
                warn!(
                    task = %self.task,
                    source = %source_ref.source,
                    "Unknown source, resolving to null"
                );
                Value::Null
            }
        }
    }

    fn list(&self) -> Vec<String> {
        self.resolvers.keys().cloned().collect()
    }
}

/// Read `ctx[key]` and apply the standard source args.
///
/// Args: `path` (dot path into the value), `role`/`roles` (keep array items
/// whose `role` field matches), `last` (keep the last N array items).
pub fn context_value(key: &str, source_ref: &SourceRef, ctx: &Value) -> Value {
    let Some(mut value) = ctx.get(key).cloned() else {
        return Value::Null;
    };

    if let Some(path) = source_ref.arg_str("path") {
        value = match lookup(&value, &parse_path(path)) {
            Some(v) => v.clone(),
            None => return Value::Null,
        };
    }

    if let Value::Array(items) = &mut value {
        let roles: Vec<&str> = match (source_ref.arg("roles"), source_ref.arg_str("role")) {
            (Some(Value::Array(list)), _) => list.iter().filter_map(Value::as_str).collect(),
            (_, Some(role)) => vec![role],
            _ => Vec::new(),
        };
        if !roles.is_empty() {
            items.retain(|item| {
                item.get("role")
                    .and_then(Value::as_str)
                    .is_some_and(|r| roles.contains(&r))
            });
        }
        if let Some(last) = source_ref.arg("last").and_then(Value::as_u64) {
            let last = last as usize;
            if items.len() > last {
                items.drain(..items.len() - last);
            }
        }
    }

    value
}

/// A base registry plus the synthetic `stepOutputs` source.
///
/// `stepOutputs` reads `ctx.stepInputs`; args `key` or `path` select a
/// single value. The base registry's resolver set is left untouched.
pub struct ExtendedRegistry {
    base: Arc<dyn SourceRegistry>,
}

impl ExtendedRegistry {
    pub fn new(base: Arc<dyn SourceRegistry>) -> Self {
        Self { base }
    }
}

impl SourceRegistry for ExtendedRegistry {
    fn resolve(&self, source_ref: &SourceRef, ctx: &Value) -> Value {
        if source_ref.source != STEP_OUTPUTS_SOURCE {
            return self.base.resolve(source_ref, ctx);
        }
        let Some(outputs) = ctx.get(STEP_INPUTS_KEY) else {
            return Value::Null;
        };
        let selector = source_ref
            .arg_str("key")
            .or_else(|| source_ref.arg_str("path"));
        match selector {
            Some(path) => lookup(outputs, &parse_path(path))
                .cloned()
                .unwrap_or(Value::Null),
            None => outputs.clone(),
        }
    }

    fn list(&self) -> Vec<String> {
        let mut names = self.base.list();
        if !names.iter().any(|n| n == STEP_OUTPUTS_SOURCE) {
            names.push(STEP_OUTPUTS_SOURCE.to_string());
        }
        names
    }
}

/// Registries keyed by workflow task kind.
#[derive(Default)]
pub struct RegistrySet {
    registries: HashMap<String, Arc<dyn SourceRegistry>>,
}

impl RegistrySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set with the built-in task registries registered.
    pub fn with_builtins() -> Self {
        let mut set = Self::new();
        set.insert(TURN_GENERATION, Arc::new(StaticRegistry::turn_generation()));
        set.insert(
            CHAPTER_SUMMARIZATION,
            Arc::new(StaticRegistry::chapter_summarization()),
        );
        set
    }

    pub fn insert(&mut self, task: impl Into<String>, registry: Arc<dyn SourceRegistry>) {
        self.registries.insert(task.into(), registry);
    }

    pub fn get(&self, task: &str) -> Result<Arc<dyn SourceRegistry>> {
        self.registries
            .get(task)
            .cloned()
            .ok_or_else(|| PlaitError::UnknownTask(task.to_string()))
    }

    /// The task's registry wrapped with the `stepOutputs` source.
    pub fn extended(&self, task: &str) -> Result<Arc<dyn SourceRegistry>> {
        Ok(Arc::new(ExtendedRegistry::new(self.get(task)?)))
    }

    pub fn tasks(&self) -> Vec<&str> {
        let mut tasks: Vec<&str> = self.registries.keys().map(String::as_str).collect();
        tasks.sort_unstable();
        tasks
    }
}
