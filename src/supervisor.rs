//! # Supervisor orchestration
//!
//! A supervisor is a tool-calling agent whose tools include one handoff tool
//! per worker. The compiled workflow is a small graph:
//!
//! ```text
//! __start__ ──▶ supervisor ──▶ worker_a ──┐
//!                  ▲   │                  │
//!                  │   ├──▶ worker_b ─────┤
//!                  │   └──▶ __end__       │
//!                  └──────────────────────┘
//! ```
//!
//! The supervisor runs until it either answers without tool calls (the run
//! ends) or calls a handoff tool (the graph moves to that worker). Workers
//! always return to the supervisor. Each worker's output is trimmed according
//! to [`OutputMode`] and optionally followed by a synthetic transfer-back pair.
//!
//! ```no_run
//! use tower_supervisor::{create_supervisor, Message, ReactAgent, SharedState};
//! use tower_supervisor::openai::OpenAIChatModel;
//!
//! # async fn run() -> Result<(), tower::BoxError> {
//! let model = OpenAIChatModel::new("gpt-4o");
//! let math = ReactAgent::builder("math_expert", model.clone())
//!     .prompt("You are a math expert.")
//!     .build();
//!
//! let workflow = create_supervisor([math], model)
//!     .prompt("Route math questions to math_expert.")
//!     .build()?;
//!
//! let out = workflow
//!     .ainvoke(SharedState::new(vec![Message::human("what's 2 + 2?")]))
//!     .await?;
//! println!("{}", out.messages.len());
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tower::{util::BoxCloneService, BoxError, Layer, Service, ServiceExt};
use tracing::{debug, info, instrument};

use crate::agent::{AgentRun, Prompt, ReactAgent};
use crate::config::{AgentNameMode, OutputMode, SupervisorConfig};
use crate::error::{Result, SupervisorError};
use crate::graph::{node_fn, Command, CompiledGraph, Goto, NodeSvc, StateGraph, DEFAULT_GRAPH_NAME, END, START};
use crate::handoff::{create_handoff_back_messages, handoff_tool_name, HandoffTool, HANDOFF_TOOL_PREFIX};
use crate::messages::Message;
use crate::provider::{ModelService, ModelSvc, ResponseFormat};
use crate::state::{SharedState, StateUpdate};
use crate::tagging::AgentNameLayer;
use crate::tool::ToolDef;
use crate::tool_calls::NormalizeToolCallsLayer;

/// Boxed worker service.
pub type WorkerSvc = BoxCloneService<SharedState, SharedState, BoxError>;

/// A named agent the supervisor can hand control to.
#[derive(Clone)]
pub struct Worker {
    name: String,
    service: WorkerSvc,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new<S>(name: impl Into<String>, service: S) -> Self
    where
        S: Service<SharedState, Response = SharedState, Error = BoxError> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        Self {
            name: name.into(),
            service: BoxCloneService::new(service),
        }
    }

    /// Worker backed by a tool-calling agent, named after it.
    pub fn from_agent(agent: ReactAgent) -> Self {
        let name = agent.name().to_string();
        Self::new(name, agent.map_response(AgentRun::into_state))
    }

    /// Worker backed by a compiled graph, named after it.
    pub fn from_graph(graph: CompiledGraph) -> Self {
        let name = graph.name().to_string();
        Self::new(name, graph)
    }

    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(SharedState) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = std::result::Result<SharedState, BoxError>> + Send + 'static,
    {
        Self::new(name, tower::service_fn(f))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl From<ReactAgent> for Worker {
    fn from(agent: ReactAgent) -> Self {
        Worker::from_agent(agent)
    }
}

impl From<CompiledGraph> for Worker {
    fn from(graph: CompiledGraph) -> Self {
        Worker::from_graph(graph)
    }
}

/// Where a supervisor workflow stands between two node executions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteState {
    AwaitingSupervisor,
    RunningWorker(String),
    Done,
}

impl RouteState {
    /// State reached once the node for `self` returned `command`.
    ///
    /// The supervisor either hands off or finishes; a worker always hands
    /// control back.
    pub fn advance(&self, command: &Command) -> Self {
        match self {
            RouteState::AwaitingSupervisor => match &command.goto {
                Some(Goto::Node(name)) => RouteState::RunningWorker(name.clone()),
                Some(Goto::End) | None => RouteState::Done,
            },
            RouteState::RunningWorker(_) => RouteState::AwaitingSupervisor,
            RouteState::Done => RouteState::Done,
        }
    }
}

impl fmt::Display for RouteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteState::AwaitingSupervisor => f.write_str("awaiting supervisor"),
            RouteState::RunningWorker(name) => write!(f, "running worker {name}"),
            RouteState::Done => f.write_str("done"),
        }
    }
}

/// Check worker names: non-empty, not reserved, pairwise unique.
pub fn validate_worker_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(SupervisorError::MissingAgentName);
        }
        if name == DEFAULT_GRAPH_NAME {
            return Err(SupervisorError::ReservedAgentName {
                name: name.to_string(),
            });
        }
        if !seen.insert(name) {
            return Err(SupervisorError::DuplicateAgentName {
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

/// Trim a worker's output and append the transfer-back pair when enabled.
pub fn process_worker_output(
    mut messages: Vec<Message>,
    output_mode: OutputMode,
    add_handoff_back_messages: bool,
    agent_name: &str,
    supervisor_name: &str,
) -> Vec<Message> {
    if output_mode == OutputMode::LastMessage {
        messages = messages.pop().into_iter().collect();
    }
    if add_handoff_back_messages {
        let (ai, tool) = create_handoff_back_messages(agent_name, supervisor_name);
        messages.push(ai);
        messages.push(tool);
    }
    messages
}

/// Start building a supervisor over `workers`.
pub fn create_supervisor<I, M>(workers: I, model: M) -> SupervisorBuilder
where
    I: IntoIterator,
    I::Item: Into<Worker>,
    M: ModelService + Clone + Send + 'static,
    M::Future: Send + 'static,
{
    SupervisorBuilder {
        workers: workers.into_iter().map(Into::into).collect(),
        model: BoxCloneService::new(model),
        tools: Vec::new(),
        handoff_tools: Vec::new(),
        prompt: None,
        response_format: None,
        config: SupervisorConfig::default(),
    }
}

/// Builder returned by [`create_supervisor`].
pub struct SupervisorBuilder {
    workers: Vec<Worker>,
    model: ModelSvc,
    tools: Vec<ToolDef>,
    handoff_tools: Vec<HandoffTool>,
    prompt: Option<Prompt>,
    response_format: Option<ResponseFormat>,
    config: SupervisorConfig,
}

impl SupervisorBuilder {
    /// Extra tool for the supervisor, bound next to the handoff tools.
    pub fn tool(mut self, tool: ToolDef) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Replace the default handoff tool of one worker.
    pub fn handoff_tool(mut self, tool: HandoffTool) -> Self {
        self.handoff_tools.push(tool);
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

    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn output_mode(mut self, mode: OutputMode) -> Self {
        self.config.output_mode = mode;
        self
    }

    pub fn add_handoff_back_messages(mut self, enabled: bool) -> Self {
        self.config.add_handoff_back_messages = enabled;
        self
    }

    pub fn include_agent_name(mut self, mode: AgentNameMode) -> Self {
        self.config.include_agent_name = Some(mode);
        self
    }

    pub fn parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.config.parallel_tool_calls = enabled;
        self
    }

    pub fn supervisor_name(mut self, name: impl Into<String>) -> Self {
        self.config.supervisor_name = name.into();
        self
    }

    /// Validate the worker set and compile the workflow graph.
    #[instrument(skip_all, fields(supervisor = %self.config.supervisor_name, workers = self.workers.len()))]
    pub fn build(self) -> Result<CompiledGraph> {
        let SupervisorBuilder {
            workers,
            model,
            tools,
            handoff_tools,
            prompt,
            response_format,
            config,
        } = self;

        validate_worker_names(workers.iter().map(Worker::name))?;
        let supervisor_name = config.supervisor_name.clone();
        if supervisor_name.is_empty() {
            return Err(SupervisorError::MissingAgentName);
        }
        if workers.iter().any(|w| w.name == supervisor_name) {
            return Err(SupervisorError::DuplicateAgentName {
                name: supervisor_name,
            });
        }

        let mut overrides: HashMap<String, HandoffTool> = HashMap::new();
        for tool in handoff_tools {
            if !workers.iter().any(|w| w.name == tool.agent_name()) {
                return Err(SupervisorError::UnknownNode {
                    name: tool.agent_name().to_string(),
                });
            }
            overrides.insert(tool.agent_name().to_string(), tool);
        }

        let mut owners: HashMap<String, String> = HashMap::new();
        let mut handoffs = Vec::with_capacity(workers.len());
        for worker in &workers {
            let tool = overrides
                .remove(&worker.name)
                .unwrap_or_else(|| HandoffTool::new(worker.name.clone()));
            let tool_name = tool.tool_name();
            ensure_canonical(&tool_name)?;
            if let Some(first) = owners.insert(tool_name.clone(), worker.name.clone()) {
                return Err(SupervisorError::HandoffToolCollision {
                    first,
                    second: worker.name.clone(),
                    tool_name,
                });
            }
            handoffs.push(tool.build());
        }
        let mut tool_names: HashSet<&str> = owners.keys().map(String::as_str).collect();
        for tool in &tools {
            ensure_canonical(&tool.name)?;
            if !tool_names.insert(tool.name.as_str()) {
                return Err(SupervisorError::DuplicateToolName {
                    name: tool.name.clone(),
                });
            }
        }

        let include_agent_name = config.include_agent_name;
        let tagged_name = supervisor_name.clone();
        let mut agent = ReactAgent::builder(supervisor_name.clone(), model)
            .tools(handoffs)
            .tools(tools)
            .parallel_tool_calls(config.parallel_tool_calls)
            .max_steps(config.max_agent_steps)
            .map_model(move |model| {
                let model = match include_agent_name {
                    Some(AgentNameMode::Inline) => {
                        BoxCloneService::new(AgentNameLayer::inline(tagged_name).layer(model))
                    }
                    None => model,
                };
                BoxCloneService::new(NormalizeToolCallsLayer.layer(model))
            });
        if let Some(prompt) = prompt {
            agent = agent.prompt(prompt);
        }
        if let Some(format) = response_format {
            agent = agent.response_format(format);
        }
        let agent = agent.build();

        let mut destinations: Vec<String> = workers.iter().map(|w| w.name.clone()).collect();
        destinations.push(END.to_string());

        let mut graph = StateGraph::new();
        graph.add_node_with_destinations(supervisor_name.clone(), supervisor_node(agent), destinations)?;
        for worker in workers {
            let name = worker.name.clone();
            graph.add_node(name.clone(), worker_node(worker, &config))?;
            graph.add_edge(name, supervisor_name.clone());
        }
        graph.add_edge(START, supervisor_name.clone());

        info!("👥 Supervisor '{}' compiled", supervisor_name);
        Ok(graph
            .compile()?
            .with_recursion_limit(config.recursion_limit)
            .with_name(supervisor_name))
    }
}

/// Tool-call normalization rewrites `transfer_to_<suffix>` calls, so such a
/// name must already be in canonical form to stay reachable.
fn ensure_canonical(tool_name: &str) -> Result<()> {
    let Some(suffix) = tool_name.strip_prefix(HANDOFF_TOOL_PREFIX) else {
        return Ok(());
    };
    let canonical = handoff_tool_name(suffix);
    if canonical != tool_name {
        return Err(SupervisorError::NonCanonicalHandoffName {
            name: tool_name.to_string(),
            canonical,
        });
    }
    Ok(())
}

fn supervisor_node(agent: ReactAgent) -> NodeSvc {
    node_fn(move |state: SharedState| {
        let run = agent.run(state);
        async move {
            let run = run.await?;
            let steps = run.steps;
            let mut command = run.into_command();
            let route = RouteState::AwaitingSupervisor.advance(&command);
            if route == RouteState::Done {
                command.goto = Some(Goto::End);
            }
            info!(steps, "🧭 Supervisor turn finished, {}", route);
            Ok(command)
        }
    })
}

fn worker_node(worker: Worker, config: &SupervisorConfig) -> NodeSvc {
    let output_mode = config.output_mode;
    let add_back = config.add_handoff_back_messages;
    let supervisor_name: Arc<str> = Arc::from(config.supervisor_name.as_str());
    let name: Arc<str> = Arc::from(worker.name.as_str());
    let service = worker.service;

    node_fn(move |state: SharedState| {
        let svc = service.clone();
        let name = name.clone();
        let supervisor_name = supervisor_name.clone();
        async move {
            info!("🤖 Running worker {}", name);
            let output = svc.oneshot(state).await?;
            let produced = output.messages.len();
            let messages =
                process_worker_output(output.messages, output_mode, add_back, &name, &supervisor_name);
            debug!(
                worker = %name,
                produced,
                kept = messages.len(),
                handoff_back = add_back,
                "worker output merged"
            );
            let command = Command::update(StateUpdate {
                messages,
                extra: output.extra,
            });
            let route = RouteState::RunningWorker(name.to_string()).advance(&command);
            info!("↩️  {} returned control, {}", name, route);
            Ok(command)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::create_forward_message_tool;
    use crate::messages::{MessageContent, Role, ToolCall};
    use crate::provider::ScriptedModel;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn echo_worker(name: &str, reply: &'static str) -> Worker {
        let agent = name.to_string();
        Worker::from_fn(name, move |mut state: SharedState| {
            let agent = agent.clone();
            async move {
                state.messages.push(Message::ai(reply).with_name(agent));
                Ok(state)
            }
        })
    }

    fn handoff_call(tool: &str) -> Message {
        Message::ai_with_tool_calls("", vec![ToolCall::new(tool, json!({})).with_id("call_1")])
    }

    #[test]
    fn worker_names_are_validated() {
        assert!(validate_worker_names(["a", "b"]).is_ok());
        assert!(matches!(validate_worker_names(["a", ""]), Err(SupervisorError::MissingAgentName)));
        assert!(matches!(
            validate_worker_names(["graph"]),
            Err(SupervisorError::ReservedAgentName { .. })
        ));
        assert!(matches!(
            validate_worker_names(["a", "b", "a"]),
            Err(SupervisorError::DuplicateAgentName { name }) if name == "a"
        ));
    }

    #[test]
    fn duplicate_workers_fail_before_compilation() {
        let err = create_supervisor(
            [echo_worker("math_expert", "4"), echo_worker("math_expert", "5")],
            ScriptedModel::new(vec![]),
        )
        .build()
        .unwrap_err();
        assert!(matches!(err, SupervisorError::DuplicateAgentName { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn normalized_collisions_are_rejected() {
        let err = create_supervisor(
            [echo_worker("Café", "a"), echo_worker("cafe", "b")],
            ScriptedModel::new(vec![]),
        )
        .build()
        .unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::HandoffToolCollision { tool_name, .. } if tool_name == "transfer_to_cafe"
        ));
    }

    #[test]
    fn supervisor_name_cannot_shadow_worker() {
        let err = create_supervisor([echo_worker("supervisor", "x")], ScriptedModel::new(vec![]))
            .build()
            .unwrap_err();
        assert!(matches!(err, SupervisorError::DuplicateAgentName { .. }));
    }

    #[test]
    fn handoff_override_must_target_worker() {
        let err = create_supervisor([echo_worker("a", "x")], ScriptedModel::new(vec![]))
            .handoff_tool(HandoffTool::new("ghost"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownNode { name } if name == "ghost"));
    }

    #[test]
    fn last_message_keeps_tail_then_pair() {
        let out = process_worker_output(
            vec![Message::human("q"), Message::ai("4")],
            OutputMode::LastMessage,
            true,
            "math_expert",
            "supervisor",
        );
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].content, MessageContent::Text("4".into()));
        assert_eq!(out[1].name.as_deref(), Some("math_expert"));
        assert_eq!(out[1].tool_calls[0].name, "transfer_back_to_supervisor");
        assert_eq!(out[2].role, Role::Tool);
        assert_eq!(out[2].tool_call_id.as_deref(), Some(out[1].tool_calls[0].id.as_str()));

        let full = process_worker_output(
            vec![Message::human("q"), Message::ai("4")],
            OutputMode::FullHistory,
            false,
            "math_expert",
            "supervisor",
        );
        assert_eq!(full.len(), 2);
    }

    #[test]
    fn route_state_transitions() {
        let awaiting = RouteState::AwaitingSupervisor;
        let running = awaiting.advance(&Command::goto("a"));
        assert_eq!(running, RouteState::RunningWorker("a".into()));
        assert_eq!(running.advance(&Command::default()), RouteState::AwaitingSupervisor);
        assert_eq!(awaiting.advance(&Command::end()), RouteState::Done);
        assert_eq!(awaiting.advance(&Command::default()), RouteState::Done);
        assert_eq!(RouteState::Done.advance(&Command::goto("a")), RouteState::Done);
        assert_eq!(running.to_string(), "running worker a");
    }

    #[test]
    fn non_canonical_custom_handoff_name_is_rejected() {
        let err = create_supervisor([echo_worker("math", "4")], ScriptedModel::new(vec![]))
            .handoff_tool(HandoffTool::new("math").with_name("transfer_to_Math"))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::NonCanonicalHandoffName { ref name, ref canonical }
                if name == "transfer_to_Math" && canonical == "transfer_to_math"
        ));
        assert!(err.is_configuration());
    }

    #[test]
    fn extra_tool_clashing_with_handoff_is_reported_as_tool() {
        let err = create_supervisor([echo_worker("math", "4")], ScriptedModel::new(vec![]))
            .tool(HandoffTool::new("someone").with_name("transfer_to_math").build())
            .build()
            .unwrap_err();
        assert!(matches!(err, SupervisorError::DuplicateToolName { ref name } if name == "transfer_to_math"));
        assert_eq!(err.to_string(), "Tool name 'transfer_to_math' is registered more than once");
    }

    #[test]
    fn duplicate_extra_tools_are_rejected() {
        let err = create_supervisor([echo_worker("math", "4")], ScriptedModel::new(vec![]))
            .tool(create_forward_message_tool("supervisor"))
            .tool(create_forward_message_tool("supervisor"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SupervisorError::DuplicateToolName { name } if name == "forward_message"));
    }

    #[tokio::test]
    async fn routes_through_custom_handoff_names() {
        let model = ScriptedModel::new(vec![
            handoff_call("ask_math"),
            handoff_call("transfer_to_math_desk"),
            Message::ai("both answered"),
        ]);
        let workflow = create_supervisor(
            [echo_worker("math", "4"), echo_worker("Math Desk", "5")],
            model.clone(),
        )
        .handoff_tool(HandoffTool::new("math").with_name("ask_math"))
        .handoff_tool(HandoffTool::new("Math Desk").with_name("transfer_to_math_desk"))
        .add_handoff_back_messages(false)
        .build()
        .unwrap();

        let out = workflow.ainvoke(SharedState::new(vec![Message::human("q")])).await.unwrap();
        let replies: Vec<String> = out
            .messages
            .iter()
            .filter(|m| m.name.as_deref() == Some("math") || m.name.as_deref() == Some("Math Desk"))
            .map(|m| m.content.to_text().into_owned())
            .collect();
        assert_eq!(replies, vec!["4", "5"]);
        assert_eq!(text_of(out.last_message().unwrap()), "both answered");

        let tool_names: Vec<String> = model.requests()[0].tools.iter().map(|t| t.name.clone()).collect();
        assert_eq!(tool_names, vec!["ask_math", "transfer_to_math_desk"]);
    }

    fn text_of(message: &Message) -> String {
        message.content.to_text().into_owned()
    }

    #[tokio::test]
    async fn routes_to_worker_and_back() {
        let model = ScriptedModel::new(vec![
            handoff_call("transfer_to_crème_brûlée_expert"),
            Message::ai("Dessert is handled."),
        ]);
        let workflow = create_supervisor([echo_worker("crème brûlée expert", "torch it")], model.clone())
            .build()
            .unwrap();

        assert_eq!(workflow.name(), "supervisor");
        let out = workflow
            .ainvoke(SharedState::new(vec![Message::human("how do I caramelize?")]))
            .await
            .unwrap();

        let texts: Vec<String> = out.messages.iter().map(|m| m.content.to_text().into_owned()).collect();
        assert_eq!(
            texts,
            vec![
                "how do I caramelize?",
                "",
                "Successfully transferred to crème brûlée expert",
                "torch it",
                "Transferring back to supervisor",
                "Successfully transferred back to supervisor",
                "Dessert is handled.",
            ]
        );
        assert_eq!(out.messages[1].tool_calls[0].name, "transfer_to_creme_brulee_expert");
        assert_eq!(model.requests()[0].tools.len(), 1);
        assert_eq!(model.requests()[0].parallel_tool_calls, Some(false));
    }

    #[tokio::test]
    async fn inline_names_reach_the_model() {
        let model = ScriptedModel::new(vec![
            handoff_call("transfer_to_researcher"),
            Message::ai("<name>supervisor</name><content>All done</content>"),
        ]);
        let workflow = create_supervisor([echo_worker("researcher", "found it")], model.clone())
            .include_agent_name(AgentNameMode::Inline)
            .add_handoff_back_messages(false)
            .build()
            .unwrap();

        let out = workflow.ainvoke(SharedState::new(vec![Message::human("look it up")])).await.unwrap();
        let last = out.last_message().unwrap();
        assert_eq!(last.content, MessageContent::Text("All done".into()));

        let second = &model.requests()[1];
        let worker_reply = second
            .messages
            .iter()
            .find(|m| m.content.to_text().contains("found it"))
            .unwrap();
        assert_eq!(
            worker_reply.content,
            MessageContent::Text("<name>researcher</name><content>found it</content>".into())
        );
    }
}
