/// Hot-reload flow registry using ArcSwap
///
/// Maps flow ids to their executable definitions. Every (re)definition swaps
/// the whole map pointer, so executions already holding an `Arc<FlowDefinition>`
/// finish on the body they started with while new invocations see the new one.
use arc_swap::ArcSwap;
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt, future::Future, sync::Arc};

/// Result of a flow body, already converted to JSON where possible
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutput {
    Value(Value),
    /// The body succeeded but its return value could not be serialized
    Unserializable { type_name: &'static str, error: String },
}

impl FlowOutput {
    pub fn from_serialize<O: Serialize>(output: &O) -> Self {
        match serde_json::to_value(output) {
            Ok(value) => FlowOutput::Value(value),
            Err(err) => FlowOutput::Unserializable {
                type_name: std::any::type_name::<O>(),
                error: err.to_string(),
            },
        }
    }
}

pub type FlowFuture = BoxFuture<'static, anyhow::Result<FlowOutput>>;

/// Type-erased flow body: JSON arguments in, JSON output out
pub type FlowFn = Arc<dyn Fn(Value) -> FlowFuture + Send + Sync>;

/// An executable flow plus its display metadata
#[derive(Clone)]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Arguments applied underneath the caller's arguments
    pub defaults: Map<String, Value>,
    func: FlowFn,
}

impl FlowDefinition {
    /// Wrap a typed async function as a flow
    ///
    /// Arguments are deserialized into `I` before the body runs; a mismatch
    /// fails the execution like any other body error.
    pub fn new<I, O, F, Fut>(id: impl Into<String>, name: impl Into<String>, func: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let func: FlowFn = Arc::new(move |args: Value| match serde_json::from_value::<I>(args) {
            Ok(input) => {
                let fut = func(input);
                async move {
                    let output = fut.await?;
                    Ok(FlowOutput::from_serialize(&output))
                }
                .boxed()
            }
            Err(err) => async move {
                Err::<FlowOutput, _>(anyhow::Error::new(err).context("invalid flow arguments"))
            }
            .boxed(),
        });

        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            defaults: Map::new(),
            func,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare default arguments (non-object values are ignored)
    pub fn with_defaults(mut self, defaults: Value) -> Self {
        if let Value::Object(map) = defaults {
            self.defaults = map;
        }
        self
    }

    /// Caller arguments laid over the declared defaults
    ///
    /// `null` means "no arguments"; a non-object argument is passed through
    /// untouched since defaults cannot apply to it.
    pub fn bind_args(&self, args: Value) -> Value {
        match args {
            Value::Null => Value::Object(self.defaults.clone()),
            Value::Object(given) => {
                let mut bound = self.defaults.clone();
                bound.extend(given);
                Value::Object(bound)
            }
            other => other,
        }
    }

    /// Start the body on already-bound arguments
    pub fn call(&self, args: Value) -> FlowFuture {
        (self.func)(args)
    }
}

impl fmt::Debug for FlowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("description", &self.description)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

/// Lock-free flow registry
///
/// Owned by the composition root and shared with the engines; there is no
/// process-wide registry.
pub struct FlowRegistry {
    flows: ArcSwap<HashMap<String, Arc<FlowDefinition>>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self {
            flows: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Insert or replace a definition, returning the one it replaced
    pub fn register(&self, definition: FlowDefinition) -> Option<Arc<FlowDefinition>> {
        let id = definition.id.clone();
        let definition = Arc::new(definition);
        let previous = self.flows.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(id.clone(), definition.clone());
            next
        });

        let replaced = previous.get(&id).cloned();
        if replaced.is_some() {
            tracing::info!("🔥 Hot-reloaded flow: {}", id);
        } else {
            tracing::info!("📝 Registered flow: {}", id);
        }
        replaced
    }

    /// Get a flow by ID (lock-free read)
    pub fn get(&self, flow_id: &str) -> Option<Arc<FlowDefinition>> {
        self.flows.load().get(flow_id).cloned()
    }

    pub fn contains(&self, flow_id: &str) -> bool {
        self.flows.load().contains_key(flow_id)
    }

    /// List all registered flow IDs
    pub fn ids(&self) -> Vec<String> {
        self.flows.load().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.flows.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.load().is_empty()
    }

    /// Remove a flow from the registry
    pub fn remove(&self, flow_id: &str) -> Option<Arc<FlowDefinition>> {
        let previous = self.flows.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(flow_id);
            next
        });
        let removed = previous.get(flow_id).cloned();
        if removed.is_some() {
            tracing::info!("🗑️ Removed flow from registry: {}", flow_id);
        }
        removed
    }
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRegistry").field("flows", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Args {
        x: i64,
        y: i64,
    }

    fn adder() -> FlowDefinition {
        FlowDefinition::new("add", "Add", |args: Args| async move {
            Ok::<_, anyhow::Error>(args.x + args.y)
        })
        .with_defaults(json!({"y": 10}))
    }

    #[test]
    fn caller_args_override_defaults() {
        let def = adder();
        assert_eq!(def.bind_args(json!({"x": 1})), json!({"x": 1, "y": 10}));
        assert_eq!(def.bind_args(json!({"x": 1, "y": 2})), json!({"x": 1, "y": 2}));
        assert_eq!(def.bind_args(Value::Null), json!({"y": 10}));
        assert_eq!(def.bind_args(json!(5)), json!(5));
    }

    #[tokio::test]
    async fn call_deserializes_and_serializes() {
        let def = adder();
        let out = def.call(def.bind_args(json!({"x": 5}))).await.unwrap();
        assert_eq!(out, FlowOutput::Value(json!(15)));

        let err = def.call(json!({"x": "nope"})).await.unwrap_err();
        assert!(format!("{:#}", err).contains("invalid flow arguments"));
    }

    #[test]
    fn register_replaces_same_id() {
        let registry = FlowRegistry::new();
        assert!(registry.register(adder()).is_none());
        let replaced = registry.register(adder().with_description("v2"));
        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("add").unwrap().description.as_deref(), Some("v2"));
        assert!(registry.remove("add").is_some());
        assert!(registry.is_empty());
    }
}
