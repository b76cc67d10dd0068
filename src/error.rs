//! Error types for the supervisor crate

use thiserror::Error;

/// Result type alias for supervisor construction and configuration
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Main error type for the supervisor crate.
///
/// Configuration variants are raised before any conversation turn runs.
/// Failures coming from models, tools and worker agents are not wrapped in
/// this type; they travel as `tower::BoxError` so callers can downcast to
/// the original error.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A worker agent was registered without a name
    #[error("Please specify a name for every worker agent (got an empty name)")]
    MissingAgentName,

    /// A worker agent uses the executor's reserved default name
    #[error("Agent name '{name}' is reserved; give the agent an explicit name")]
    ReservedAgentName { name: String },

    /// Two worker agents share a name
    #[error("Agent with name '{name}' already exists. Agent names must be unique.")]
    DuplicateAgentName { name: String },

    /// Two distinct agent names normalize to the same handoff tool
    #[error("Agents '{first}' and '{second}' both map to handoff tool '{tool_name}'")]
    HandoffToolCollision {
        first: String,
        second: String,
        tool_name: String,
    },

    /// A custom handoff name would be rewritten by tool-call normalization
    #[error("Handoff tool name '{name}' is not canonical; use '{canonical}' or a name without the transfer prefix")]
    NonCanonicalHandoffName { name: String, canonical: String },

    /// Two supervisor tools share a name
    #[error("Tool name '{name}' is registered more than once")]
    DuplicateToolName { name: String },

    /// Unknown output-inclusion mode
    #[error("Invalid agent output mode: {value}. Needs to be one of {allowed:?}")]
    InvalidOutputMode {
        value: String,
        allowed: &'static [&'static str],
    },

    /// Unknown agent-name inlining mode
    #[error("Invalid agent name mode: {value}. Needs to be one of {allowed:?}")]
    InvalidAgentNameMode {
        value: String,
        allowed: &'static [&'static str],
    },

    /// A node name was registered twice in the same graph
    #[error("Node '{name}' is already present in the graph")]
    DuplicateNode { name: String },

    /// An edge or command referenced a node that does not exist
    #[error("Unknown node: {name}")]
    UnknownNode { name: String },

    /// The graph has no edge leaving the start node
    #[error("Graph has no entry point; add an edge from the start node")]
    MissingEntryPoint,

    /// A node routed somewhere it did not declare as a destination
    #[error("Node '{from}' cannot route to '{to}'; declared destinations: {allowed:?}")]
    InvalidDestination {
        from: String,
        to: String,
        allowed: Vec<String>,
    },

    /// The executor ran more node steps than allowed
    #[error("Recursion limit of {limit} reached without hitting a stop condition")]
    RecursionLimit { limit: usize },

    /// An agent loop ran more model turns than allowed
    #[error("Agent '{agent}' exceeded maximum steps: {max_steps}")]
    MaxStepsExceeded { agent: String, max_steps: usize },

    /// Blocking invocation attempted from inside an async runtime
    #[error("Blocking invoke called from within an async runtime; use ainvoke instead")]
    NestedRuntime,

    /// Model behavior error
    #[error("Model behavior error: {message}")]
    ModelBehavior { message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Env file error
    #[error("Env file error: {0}")]
    EnvFile(#[from] dotenv::Error),
}

impl SupervisorError {
    /// Whether this error is raised while building or configuring a workflow.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SupervisorError::MissingAgentName
                | SupervisorError::ReservedAgentName { .. }
                | SupervisorError::DuplicateAgentName { .. }
                | SupervisorError::HandoffToolCollision { .. }
                | SupervisorError::NonCanonicalHandoffName { .. }
                | SupervisorError::DuplicateToolName { .. }
                | SupervisorError::InvalidOutputMode { .. }
                | SupervisorError::InvalidAgentNameMode { .. }
                | SupervisorError::DuplicateNode { .. }
                | SupervisorError::UnknownNode { .. }
                | SupervisorError::MissingEntryPoint
        )
    }
}
