//! # Tower Supervisor
//!
//! Route a conversation between a supervisor model and a set of named worker
//! agents. Every moving part is a Tower service: models, tools, agents,
//! workers and the compiled workflow itself.
//!
//! ## Core Concepts
//!
//! - **Supervisor**: a tool-calling agent with one `transfer_to_<agent>` tool per worker
//! - **Workers**: any `Service<SharedState, Response = SharedState>`, usually a [`ReactAgent`]
//! - **Handoffs**: tools that return a [`Command`] moving the graph to a worker
//! - **Layers**: model middleware for tool binding, agent-name tagging and
//!   tool-call name normalization
//!
//! ## Getting Started
//!
//! Set your OpenAI API key in the `OPENAI_API_KEY` environment variable
//! (or in a `.env.json` / `.env` file, see [`config::load_env`]).
//!
//! ```rust,no_run
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//! use tower_supervisor::openai::OpenAIChatModel;
//! use tower_supervisor::{create_supervisor, tool_typed, Message, OutputMode, ReactAgent, SharedState};
//!
//! #[derive(Debug, Deserialize, JsonSchema)]
//! struct AddArgs {
//!     a: f64,
//!     b: f64,
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! tower_supervisor::config::load_env(".", false)?;
//! let model = OpenAIChatModel::new("gpt-4o");
//!
//! let add = tool_typed("add", "Add two numbers", |args: AddArgs| async move {
//!     Ok::<_, tower::BoxError>(serde_json::json!({ "sum": args.a + args.b }))
//! });
//! let math = ReactAgent::builder("math_expert", model.clone())
//!     .tool(add)
//!     .prompt("You are a math expert. Use one tool at a time.")
//!     .build();
//!
//! let workflow = create_supervisor([math], model)
//!     .prompt("You manage a math expert. Delegate arithmetic to it.")
//!     .output_mode(OutputMode::FullHistory)
//!     .build()?;
//!
//! let out = workflow
//!     .ainvoke(SharedState::new(vec![Message::human("what's 2 + 2?")]))
//!     .await?;
//! println!("{:?}", out.last_message());
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod graph;
pub mod handoff;
pub mod messages;
pub mod normalize;
pub mod openai;
pub mod provider;
pub mod state;
pub mod supervisor;
pub mod tagging;
pub mod tool;
pub mod tool_calls;

pub use agent::{AgentRun, AgentStopReason, Prompt, ReactAgent, ReactAgentBuilder};
pub use config::{AgentNameMode, OutputMode, SupervisorConfig};
pub use error::{Result, SupervisorError};
pub use graph::{Command, CompiledGraph, Goto, StateGraph, END, START};
pub use handoff::{
    create_forward_message_tool, create_handoff_back_messages, create_handoff_tool, handoff_tool_name,
    HandoffTool,
};
pub use messages::{ContentBlock, Message, MessageContent, Role, ToolCall, UsageMetadata};
pub use normalize::normalize_agent_name;
pub use provider::{ModelRequest, ModelService, ResponseFormat, ScriptedModel};
pub use state::{add_messages, SharedState, StateUpdate};
pub use supervisor::{create_supervisor, process_worker_output, RouteState, SupervisorBuilder, Worker};
pub use tagging::{AgentNameLayer, InlineTagger, MessageTagger};
pub use tool::{tool_typed, ToolDef, ToolSpec};
pub use tool_calls::{normalize_tool_calls, NormalizeToolCallsLayer};
