use std::collections::BTreeMap;
use std::future::Future;
use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::builtin::{CalculatorTool, ClockTool};
use super::message::ToolCall;
use crate::{Error, Result};

const LOG_RESULT_MAX_CHARS: usize = 500;
const LOG_RESULT_EDGE_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

impl ToolDefinition {
    /// The `{"type": "function", "function": {...}}` form chat-completion servers accept.
    #[must_use]
    pub fn to_function(&self) -> Value {
        json!({"type": "function", "function": self})
    }
}

/// A capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Run the tool with decoded arguments. Errors are reported back to the model as text.
    async fn execute(&self, args: Value) -> Result<String>;
}

struct FnTool<A, F> {
    definition: ToolDefinition,
    handler: F,
    _args: PhantomData<fn(A)>,
}

#[async_trait]
impl<A, F, Fut> Tool for FnTool<A, F>
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn execute(&self, args: Value) -> Result<String> {
        let args: A = serde_json::from_value(args)
            .map_err(|e| Error::Tool(format!("invalid arguments: {e}")))?;
        (self.handler)(args).await
    }
}

/// Fixed table of tools, keyed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the clock and calculator tools.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ClockTool);
        registry.register(CalculatorTool);
        registry
    }

    /// Add a tool, replacing any tool of the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.definition().name;
        tracing::debug!(tool = %name, "Registered tool");
        self.tools.insert(name, Arc::new(tool));
    }

    /// Register a typed async closure; the parameter schema is derived from `A`.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be serialized.
    #[allow(clippy::result_large_err)]
    pub fn register_fn<A, F, Fut>(
        &mut self,
        name: &str,
        description: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        A: DeserializeOwned + JsonSchema + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let parameters = serde_json::to_value(schemars::schema_for!(A))?;
        self.register(FnTool {
            definition: ToolDefinition {
                name: name.to_string(),
                description: description.into(),
                parameters,
            },
            handler,
            _args: PhantomData::<fn(A)>,
        });
        Ok(())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn definition(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.get(name).map(|tool| tool.definition())
    }

    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }

    /// Run a tool. Never fails: unknown tools, bad arguments and tool errors come back as text.
    pub async fn execute(&self, name: &str, raw_args: &Value) -> String {
        let Some(tool) = self.tools.get(name) else {
            tracing::error!(tool = %name, "Tool not found");
            return format!("Error: tool '{name}' not found");
        };

        let args = match decode_arguments(raw_args) {
            Ok(args) => args,
            Err(e) => {
                tracing::error!(tool = %name, "Bad tool arguments: {e}");
                return format!("Error while executing {name}: {e}");
            }
        };

        tracing::info!(tool = %name, %args, "Executing tool");
        match AssertUnwindSafe(tool.execute(args)).catch_unwind().await {
            Ok(Ok(result)) => {
                tracing::info!(tool = %name, result = %preview(&result), "Tool succeeded");
                result
            }
            Ok(Err(e)) => {
                tracing::error!(tool = %name, "Tool failed: {e}");
                format!("Error while executing {name}: {e}")
            }
            Err(panic) => {
                tracing::error!(tool = %name, reason = panic_message(panic.as_ref()), "Tool panicked");
                format!("Error while executing {name}: tool panicked")
            }
        }
    }

    pub async fn execute_call(&self, call: &ToolCall) -> String {
        self.execute(&call.name, &call.arguments).await
    }
}

/// Arguments may arrive as an object, as JSON text, or not at all.
#[allow(clippy::result_large_err)]
fn decode_arguments(raw: &Value) -> Result<Value> {
    let decoded = match raw {
        Value::Null => return Ok(json!({})),
        Value::String(text) if text.trim().is_empty() => return Ok(json!({})),
        Value::String(text) => serde_json::from_str(text)
            .map_err(|e| Error::Tool(format!("arguments are not valid JSON: {e}")))?,
        other => other.clone(),
    };
    if decoded.is_object() {
        Ok(decoded)
    } else {
        Err(Error::Tool(format!("arguments must be a JSON object, got {decoded}")))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn preview(result: &str) -> String {
    let count = result.chars().count();
    if count <= LOG_RESULT_MAX_CHARS {
        return result.to_string();
    }
    let head: String = result.chars().take(LOG_RESULT_EDGE_CHARS).collect();
    let tail: String = result.chars().skip(count - LOG_RESULT_EDGE_CHARS).collect();
    format!("{head}...{tail} (truncated)")
}
