//! Model provider abstraction
//!
//! What this module provides
//! - The request shape every model sees: [`ModelRequest`]
//! - `ModelService`: any `Service<ModelRequest, Response = Message, Error = BoxError>`
//! - [`BindToolsLayer`]: the "bind tools" configuration step
//! - [`ScriptedModel`]: deterministic responses for tests and demos
//!
//! Composition
//! - `ServiceBuilder::new().layer(NormalizeToolCallsLayer).layer(BindToolsLayer::new(..)).service(model)`
//! - The concrete network backend lives in [`crate::openai`]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::{self, BoxFuture};
use serde_json::Value;
use tower::{util::BoxCloneService, BoxError, Layer, Service};
use tracing::trace;

use crate::error::SupervisorError;
use crate::messages::Message;
use crate::tool::ToolSpec;

/// Schema for a structured final answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: Value,
    /// Optional system prompt placed before the history for the structuring call
    pub prompt: Option<String>,
}

impl ResponseFormat {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// One model call: the ordered prompt plus the tools the model may use.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    /// `Some(false)` asks the provider for at most one tool call per turn
    pub parallel_tool_calls: Option<bool>,
    pub response_format: Option<ResponseFormat>,
}

impl ModelRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }
}

pub trait ModelService: Service<ModelRequest, Response = Message, Error = BoxError> {}
impl<T> ModelService for T where T: Service<ModelRequest, Response = Message, Error = BoxError> {}

/// Boxed, clonable model service.
pub type ModelSvc = BoxCloneService<ModelRequest, Message, BoxError>;

// ================================================================================================
// Tool binding
// ================================================================================================

/// Layer that binds a fixed tool set (and the parallel-call flag) to every request.
#[derive(Debug, Clone)]
pub struct BindToolsLayer {
    tools: Arc<Vec<ToolSpec>>,
    parallel_tool_calls: Option<bool>,
}

impl BindToolsLayer {
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        Self {
            tools: Arc::new(tools),
            parallel_tool_calls: None,
        }
    }

    pub fn parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.parallel_tool_calls = Some(enabled);
        self
    }
}

impl<S> Layer<S> for BindToolsLayer {
    type Service = BoundModel<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BoundModel {
            inner,
            tools: self.tools.clone(),
            parallel_tool_calls: self.parallel_tool_calls,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BoundModel<S> {
    inner: S,
    tools: Arc<Vec<ToolSpec>>,
    parallel_tool_calls: Option<bool>,
}

impl<S> Service<ModelRequest> for BoundModel<S>
where
    S: Service<ModelRequest, Response = Message, Error = BoxError>,
{
    type Response = Message;
    type Error = BoxError;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: ModelRequest) -> Self::Future {
        // Structured-output calls go to the unbound model.
        if req.response_format.is_none() {
            if req.tools.is_empty() {
                req.tools = (*self.tools).clone();
            }
            if req.parallel_tool_calls.is_none() && !req.tools.is_empty() {
                req.parallel_tool_calls = self.parallel_tool_calls;
            }
        }
        self.inner.call(req)
    }
}

// ================================================================================================
// Scripted model
// ================================================================================================

/// A model that replays scripted responses in order and records every request.
#[derive(Clone, Default)]
pub struct ScriptedModel {
    responses: Arc<Mutex<VecDeque<Message>>>,
    requests: Arc<Mutex<Vec<ModelRequest>>>,
    fallback: Option<Message>,
}

impl ScriptedModel {
    pub fn new(responses: impl IntoIterator<Item = Message>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into_iter().collect())),
            requests: Arc::new(Mutex::new(Vec::new())),
            fallback: None,
        }
    }

    /// Response returned once the script runs out.
    pub fn with_fallback(mut self, message: Message) -> Self {
        self.fallback = Some(message);
        self
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn next_response(&self, req: ModelRequest) -> Result<Message, BoxError> {
        trace!(messages = req.messages.len(), tools = req.tools.len(), "scripted model call");
        self.requests
            .lock()
            .map_err(|_| "scripted model request log poisoned")?
            .push(req);
        let next = self
            .responses
            .lock()
            .map_err(|_| "scripted model script poisoned")?
            .pop_front();
        match next.or_else(|| self.fallback.clone()) {
            Some(message) => Ok(message),
            None => Err(SupervisorError::ModelBehavior {
                message: "scripted model has no responses left".to_string(),
            }
            .into()),
        }
    }
}

impl Service<ModelRequest> for ScriptedModel {
    type Response = Message;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Message, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ModelRequest) -> Self::Future {
        Box::pin(future::ready(self.next_response(req)))
    }
}
