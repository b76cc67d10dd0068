//! Tool service modeling
//!
//! A tool is a named `tower::Service<ToolInvocation, Response = ToolOutput>`
//! plus the spec (name, description, JSON schema) the model sees. Plain tools
//! return a JSON result; control-flow tools such as handoffs also return a
//! [`Command`] for the executor.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower::{util::BoxCloneService, BoxError, Service};

use crate::graph::Command;
use crate::state::SharedState;

/// Uniform tool invocation passed to routed tool services.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,   // tool_call_id
    pub name: String, // function name
    pub arguments: Value,
    /// State as seen by the calling agent, including the invoking ai message
    pub state: Arc<SharedState>,
}

/// Uniform tool output produced by tool services.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub id: String, // same as invocation.id
    pub result: Value,
    /// Set by tools that steer the graph
    pub command: Option<Command>,
}

impl ToolOutput {
    pub fn value(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result,
            command: None,
        }
    }

    pub fn command(id: impl Into<String>, command: Command) -> Self {
        Self {
            id: id.into(),
            result: Value::Null,
            command: Some(command),
        }
    }

    /// Text used for the tool message answering this call.
    pub fn content_text(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Boxed tool service type alias.
pub type ToolSvc = BoxCloneService<ToolInvocation, ToolOutput, BoxError>;

/// Function signature shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Definition of a tool: function spec + service implementation.
#[derive(Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
    pub service: ToolSvc,
}

impl std::fmt::Debug for ToolDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDef")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: Value,
        service: ToolSvc,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema,
            service,
        }
    }

    /// Create a tool definition from a handler function that takes JSON args and returns JSON.
    pub fn from_handler(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: Value,
        handler: Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync + 'static>,
    ) -> Self {
        let name = name.into();
        let expected = name.clone();
        let svc = tower::service_fn(move |inv: ToolInvocation| {
            let handler = handler.clone();
            let expected = expected.clone();
            async move {
                if inv.name != expected {
                    return Err::<ToolOutput, BoxError>(
                        format!("routed to wrong tool: expected={}, got={}", expected, inv.name).into(),
                    );
                }
                let out = (handler)(inv.arguments).await?;
                Ok(ToolOutput::value(inv.id, out))
            }
        });
        Self::new(name, description, parameters_schema, BoxCloneService::new(svc))
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec::new(&self.name, &self.description, self.parameters_schema.clone())
    }
}

/// Create a tool from a typed handler.
/// - `A` is the input args struct (Deserialize + JsonSchema)
/// - `R` is the output type (Serialize)
pub fn tool_typed<A, H, Fut, R>(name: impl Into<String>, description: impl Into<String>, handler: H) -> ToolDef
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
    R: Serialize + Send + 'static,
    H: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
{
    let schema = schemars::schema_for!(A);
    let params_value = serde_json::to_value(schema.schema).unwrap_or_else(|_| json!({"type": "object"}));
    let handler = Arc::new(handler);
    let erased: Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync> =
        Arc::new(move |raw: Value| {
            let h = handler.clone();
            Box::pin(async move {
                let args: A = serde_json::from_value(raw)?;
                let out: R = (h.as_ref())(args).await?;
                Ok(serde_json::to_value(out)?)
            })
        });
    ToolDef::from_handler(name, description, params_value, erased)
}

/// Router service over tools using a name -> index table.
#[derive(Clone)]
pub struct ToolRouter {
    name_to_index: HashMap<String, usize>,
    services: Vec<ToolSvc>, // index 0 is the unknown-tool fallback
}

impl ToolRouter {
    pub fn new(tools: Vec<ToolDef>) -> (Self, Vec<ToolSpec>) {
        let unknown = BoxCloneService::new(tower::service_fn(|inv: ToolInvocation| async move {
            Err::<ToolOutput, BoxError>(format!("unknown tool: {}", inv.name).into())
        }));

        let mut services: Vec<ToolSvc> = vec![unknown];
        let mut specs = Vec::with_capacity(tools.len());
        let mut name_to_index = HashMap::new();

        for (i, td) in tools.into_iter().enumerate() {
            specs.push(td.spec());
            name_to_index.insert(td.name, i + 1);
            services.push(td.service);
        }

        (
            Self {
                name_to_index,
                services,
            },
            specs,
        )
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }
}

impl Service<ToolInvocation> for ToolRouter {
    type Response = ToolOutput;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness of the selected tool is awaited by the caller via `oneshot`.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ToolInvocation) -> Self::Future {
        let idx = self.name_to_index.get(req.name.as_str()).copied().unwrap_or(0);
        // index 0 is always present
        let svc = self.services[idx].clone();
        Box::pin(tower::ServiceExt::oneshot(svc, req))
    }
}
