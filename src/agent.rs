//! Tool-calling agent loop
//!
//! [`ReactAgent`] alternates model turns and tool execution until the model
//! answers without tool calls, or a tool steers the graph with a
//! [`Command`]. The supervisor is one of these agents; workers usually are
//! too, but any `Service<SharedState, Response = SharedState>` can be a
//! worker.
//!
//! Per model turn
//! - Render the prompt against the working state
//! - Call the model (tools are bound once at build time)
//! - Attribute the reply to the agent and append it
//! - Run the requested tools sequentially and append their results
//!
//! A turn that issues several control-transfer calls honors the first one
//! and answers the rest with a "skipped" tool message.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tower::{util::BoxCloneService, BoxError, Layer, Service, ServiceExt};
use tracing::{debug, info, info_span, trace, Instrument};
use uuid::Uuid;

use crate::error::SupervisorError;
use crate::graph::{Command, Goto};
use crate::messages::Message;
use crate::provider::{BindToolsLayer, ModelRequest, ModelService, ModelSvc, ResponseFormat};
use crate::state::{add_messages, SharedState, StateUpdate, STRUCTURED_RESPONSE_KEY};
use crate::tool::{ToolDef, ToolInvocation, ToolRouter, ToolSpec};

pub const DEFAULT_MAX_STEPS: usize = 25;

/// How the agent turns state into the model prompt.
#[derive(Clone)]
pub enum Prompt {
    /// Prepended as a system message
    Text(String),
    /// Prepended as is
    System(Message),
    /// Receives the full state and returns the complete prompt
    Dynamic(Arc<dyn Fn(&SharedState) -> Vec<Message> + Send + Sync>),
}

impl Prompt {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&SharedState) -> Vec<Message> + Send + Sync + 'static,
    {
        Prompt::Dynamic(Arc::new(f))
    }

    pub fn render(&self, state: &SharedState) -> Vec<Message> {
        match self {
            Prompt::Text(text) => prepend(Message::system(text.as_str()), &state.messages),
            Prompt::System(message) => prepend(message.clone(), &state.messages),
            Prompt::Dynamic(f) => f(state),
        }
    }
}

fn prepend(first: Message, rest: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(rest.len() + 1);
    out.push(first);
    out.extend_from_slice(rest);
    out
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prompt::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Prompt::System(message) => f.debug_tuple("System").field(message).finish(),
            Prompt::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<&str> for Prompt {
    fn from(value: &str) -> Self {
        Prompt::Text(value.to_string())
    }
}

impl From<String> for Prompt {
    fn from(value: String) -> Self {
        Prompt::Text(value)
    }
}

impl From<Message> for Prompt {
    fn from(value: Message) -> Self {
        Prompt::System(value)
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentStopReason {
    DoneNoToolCalls,
    /// A tool asked the graph to move on
    Transfer(Command),
}

/// Final run summary from the agent loop.
#[derive(Debug, Clone)]
pub struct AgentRun {
    /// Input history followed by everything the agent produced, all with ids
    pub messages: Vec<Message>,
    /// Input extra keys plus anything the agent set
    pub extra: Map<String, Value>,
    pub steps: usize,
    pub stop: AgentStopReason,
}

impl AgentRun {
    /// As a graph node result.
    pub fn into_command(self) -> Command {
        match self.stop {
            AgentStopReason::DoneNoToolCalls => Command::update(StateUpdate {
                messages: self.messages,
                extra: self.extra,
            }),
            AgentStopReason::Transfer(mut command) => {
                command.update.extra.extend(self.extra);
                command
            }
        }
    }

    /// As the final state of a standalone run.
    pub fn into_state(self) -> SharedState {
        match self.stop {
            AgentStopReason::DoneNoToolCalls => SharedState {
                messages: self.messages,
                extra: self.extra,
            },
            AgentStopReason::Transfer(command) => {
                let mut extra = self.extra;
                extra.extend(command.update.extra);
                SharedState {
                    messages: add_messages(self.messages, command.update.messages),
                    extra,
                }
            }
        }
    }
}

fn with_fresh_id(mut message: Message) -> Message {
    if message.id.is_none() {
        message.id = Some(Uuid::new_v4().to_string());
    }
    message
}

fn skipped_call_message(call_id: &str, tool_name: &str) -> Message {
    with_fresh_id(
        Message::tool(
            format!("Tool call '{tool_name}' skipped: control was already transferred in this turn"),
            call_id,
        )
        .with_name(tool_name),
    )
}

/// Tool-calling agent.
#[derive(Clone)]
pub struct ReactAgent {
    name: Arc<str>,
    model: ModelSvc,
    tools: ToolRouter,
    specs: Arc<Vec<ToolSpec>>,
    prompt: Option<Prompt>,
    response_format: Option<ResponseFormat>,
    max_steps: usize,
}

impl fmt::Debug for ReactAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactAgent")
            .field("name", &self.name)
            .field("tools", &self.specs.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("prompt", &self.prompt)
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}

impl ReactAgent {
    pub fn builder<M>(name: impl Into<String>, model: M) -> ReactAgentBuilder
    where
        M: ModelService + Clone + Send + 'static,
        M::Future: Send + 'static,
    {
        ReactAgentBuilder {
            name: name.into(),
            model: BoxCloneService::new(model),
            tools: Vec::new(),
            prompt: None,
            response_format: None,
            max_steps: DEFAULT_MAX_STEPS,
            parallel_tool_calls: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tool_specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    /// Run the loop on `state`.
    pub fn run(&self, state: SharedState) -> BoxFuture<'static, Result<AgentRun, BoxError>> {
        let span = info_span!("agent", agent = %self.name);
        let name = self.name.clone();
        let mut model = self.model.clone();
        let tools = self.tools.clone();
        let prompt = self.prompt.clone();
        let response_format = self.response_format.clone();
        let max_steps = self.max_steps;

        let fut = async move {
            let extra = state.extra;
            let mut messages = add_messages(Vec::new(), state.messages);
            let mut steps = 0usize;

            let stop = loop {
                if steps >= max_steps {
                    return Err(SupervisorError::MaxStepsExceeded {
                        agent: name.to_string(),
                        max_steps,
                    }
                    .into());
                }
                steps += 1;

                let view = SharedState {
                    messages: messages.clone(),
                    extra: extra.clone(),
                };
                let rendered = match &prompt {
                    Some(prompt) => prompt.render(&view),
                    None => view.messages,
                };

                let mut response = ServiceExt::ready(&mut model)
                    .await?
                    .call(ModelRequest::new(rendered))
                    .await?;
                response.name = Some(name.to_string());
                let response = with_fresh_id(response);
                messages.push(response.clone());

                if !response.has_tool_calls() {
                    debug!(steps, "no tool calls, agent done");
                    break AgentStopReason::DoneNoToolCalls;
                }

                let snapshot = Arc::new(SharedState {
                    messages: messages.clone(),
                    extra: extra.clone(),
                });
                let mut transfer: Option<Command> = None;
                let mut results = Vec::with_capacity(response.tool_calls.len());
                for call in &response.tool_calls {
                    if transfer.is_some() {
                        debug!(tool = %call.name, "skipping tool call after transfer");
                        results.push(skipped_call_message(&call.id, &call.name));
                        continue;
                    }
                    trace!(tool = %call.name, id = %call.id, "invoking tool");
                    let out = tools
                        .clone()
                        .oneshot(ToolInvocation {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                            state: snapshot.clone(),
                        })
                        .await?;
                    match out.command {
                        Some(command) => transfer = Some(command),
                        None => results.push(with_fresh_id(
                            Message::tool(out.content_text(), out.id).with_name(call.name.as_str()),
                        )),
                    }
                }

                messages.extend(results.iter().cloned());
                if let Some(mut command) = transfer {
                    if matches!(command.goto, Some(Goto::Node(_))) {
                        command.update.messages.extend(results);
                    }
                    info!("🔀 {} stopped on transfer to {:?}", name, command.goto);
                    break AgentStopReason::Transfer(command);
                }
            };

            let mut extra = extra;
            if let (AgentStopReason::DoneNoToolCalls, Some(format)) = (&stop, &response_format) {
                let structured = structured_response(&mut model, format, &messages).await?;
                extra.insert(STRUCTURED_RESPONSE_KEY.to_string(), structured);
            }

            Ok::<_, BoxError>(AgentRun {
                messages,
                extra,
                steps,
                stop,
            })
        };
        Box::pin(fut.instrument(span))
    }
}

/// One extra model call that must answer with JSON matching `format`.
async fn structured_response(
    model: &mut ModelSvc,
    format: &ResponseFormat,
    messages: &[Message],
) -> Result<Value, BoxError> {
    let prompt = match &format.prompt {
        Some(text) => prepend(Message::system(text.as_str()), messages),
        None => messages.to_vec(),
    };
    let mut request = ModelRequest::new(prompt);
    request.response_format = Some(format.clone());

    let reply = ServiceExt::ready(model).await?.call(request).await?;
    let text = reply.content.to_text();
    serde_json::from_str(&text).map_err(|e| {
        SupervisorError::ModelBehavior {
            message: format!("structured response '{}' is not valid JSON: {e}", format.name),
        }
        .into()
    })
}

impl Service<SharedState> for ReactAgent {
    type Response = AgentRun;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<AgentRun, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, state: SharedState) -> Self::Future {
        self.run(state)
    }
}

/// Builder for [`ReactAgent`].
pub struct ReactAgentBuilder {
    name: String,
    model: ModelSvc,
    tools: Vec<ToolDef>,
    prompt: Option<Prompt>,
    response_format: Option<ResponseFormat>,
    max_steps: usize,
    parallel_tool_calls: Option<bool>,
}

impl ReactAgentBuilder {
    pub fn tool(mut self, tool: ToolDef) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn prompt(mut self, prompt: impl Into<Prompt>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn max_steps(mut self, max: usize) -> Self {
        self.max_steps = max;
        self
    }

    pub fn parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.parallel_tool_calls = Some(enabled);
        self
    }

    /// Wrap the model before tools are bound.
    pub fn map_model<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ModelSvc) -> ModelSvc,
    {
        self.model = f(self.model);
        self
    }

    pub fn build(self) -> ReactAgent {
        let (router, specs) = ToolRouter::new(self.tools);
        let mut bind = BindToolsLayer::new(specs.clone());
        if let Some(parallel) = self.parallel_tool_calls {
            bind = bind.parallel_tool_calls(parallel);
        }
        ReactAgent {
            name: Arc::from(self.name),
            model: BoxCloneService::new(bind.layer(self.model)),
            tools: router,
            specs: Arc::new(specs),
            prompt: self.prompt,
            response_format: self.response_format,
            max_steps: self.max_steps,
        }
    }
}
