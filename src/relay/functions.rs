//! # Function Dispatch Table
//!
//! Immutable mapping from function name to handler, built once at startup and
//! shared by every session. The agent asks for functions by name; the outbound
//! relay looks them up here.
//!
//! ## Handler Contract:
//! - **Input**: the decoded JSON arguments
//! - **Output**: `Ok(result)` or `Err(message)`; a panicking handler is reported
//!   as an error instead of taking the session down

use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Uniform callable signature for agent functions.
pub type FunctionHandler = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// A registered function: its handler plus the definition advertised to the agent.
#[derive(Clone)]
struct RegisteredFunction {
    handler: FunctionHandler,
    description: String,
    parameters: Value,
}

/// Outcome of looking up and invoking a function.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Completed(Value),
    Failed(String),
    UnknownFunction,
}

/// Name → handler mapping. Built with [`FunctionRegistryBuilder`], read-only afterwards.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, RegisteredFunction>,
}

impl FunctionRegistry {
    pub fn builder() -> FunctionRegistryBuilder {
        FunctionRegistryBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Function definitions in the shape the agent settings expect.
    pub fn definitions(&self) -> Vec<Value> {
        self.names()
            .into_iter()
            .filter_map(|name| {
                self.functions.get(&name).map(|f| {
                    json!({
                        "name": name,
                        "description": f.description,
                        "parameters": f.parameters,
                    })
                })
            })
            .collect()
    }

    /// Invoke a function by name.
    ///
    /// Handlers run synchronously on the caller's thread. A panic inside a handler
    /// is caught and reported as `Failed`.
    pub fn invoke(&self, name: &str, arguments: Value) -> Invocation {
        let Some(function) = self.functions.get(name) else {
            return Invocation::UnknownFunction;
        };

        let handler = function.handler.clone();
        match panic::catch_unwind(AssertUnwindSafe(move || handler(arguments))) {
            Ok(Ok(result)) => Invocation::Completed(result),
            Ok(Err(message)) => Invocation::Failed(message),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Invocation::Failed(message)
            }
        }
    }
}

#[cfg(test)]
impl FunctionRegistry {
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

#[derive(Default)]
pub struct FunctionRegistryBuilder {
    functions: HashMap<String, RegisteredFunction>,
}

impl FunctionRegistryBuilder {
    /// Register a handler. A later registration with the same name replaces the earlier one.
    pub fn register<F>(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(
            name.into(),
            RegisteredFunction {
                handler: Arc::new(handler),
                description: description.into(),
                parameters,
            },
        );
        self
    }

    pub fn build(self) -> FunctionRegistry {
        FunctionRegistry {
            functions: self.functions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FunctionRegistry {
        FunctionRegistry::builder()
            .register("echo", "Echo the arguments", json!({"type": "object"}), |args| Ok(args))
            .register("fail", "Always fails", json!({"type": "object"}), |_| {
                Err("nope".to_string())
            })
            .register("explode", "Panics", json!({"type": "object"}), |_| {
                panic!("boom")
            })
            .build()
    }

    #[test]
    fn test_invoke_outcomes() {
        let registry = registry();

        assert_eq!(
            registry.invoke("echo", json!({"x": 1})),
            Invocation::Completed(json!({"x": 1}))
        );
        assert_eq!(
            registry.invoke("fail", json!({})),
            Invocation::Failed("nope".to_string())
        );
        assert_eq!(registry.invoke("missing", json!({})), Invocation::UnknownFunction);
    }

    #[test]
    fn test_panicking_handler_is_reported_as_failure() {
        let registry = registry();
        assert_eq!(
            registry.invoke("explode", json!({})),
            Invocation::Failed("boom".to_string())
        );
    }

    #[test]
    fn test_definitions_are_sorted_by_name() {
        let registry = registry();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.names(), vec!["echo", "explode", "fail"]);

        let definitions = registry.definitions();
        assert_eq!(definitions[0]["name"], "echo");
        assert_eq!(definitions[0]["description"], "Echo the arguments");
    }
}
