//! Minimal sequential state-graph executor
//!
//! What this module provides
//! - [`StateGraph`]: register nodes and static edges, then `compile`
//! - [`CompiledGraph`]: runs one node at a time until the end marker, and is
//!   itself a `Service<SharedState, Response = SharedState>`
//! - [`Command`]: what a node returns, a state update plus an optional jump
//!
//! Execution model
//! - Start at the node reached from [`START`]
//! - After each node, merge its update into the state, then follow
//!   `Command::goto`, else the node's static edge, else stop
//! - At most `recursion_limit` node executions per run
//!
//! Nodes that declare destinations may only jump to those destinations.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower::{util::BoxService, BoxError, Service, ServiceExt};
use tracing::{debug, info, instrument, trace};

use crate::error::{Result, SupervisorError};
use crate::state::{add_messages, SharedState, StateUpdate};

pub const START: &str = "__start__";
pub const END: &str = "__end__";
/// Name given to a compiled graph that was never named.
pub const DEFAULT_GRAPH_NAME: &str = "graph";
pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// Where to go after a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Goto {
    Node(String),
    End,
}

impl Goto {
    pub fn as_str(&self) -> &str {
        match self {
            Goto::Node(name) => name,
            Goto::End => END,
        }
    }
}

/// Node result: a state update and an optional explicit next hop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    pub goto: Option<Goto>,
    pub update: StateUpdate,
}

impl Command {
    /// Update only; routing follows the static edge.
    pub fn update(update: StateUpdate) -> Self {
        Self { goto: None, update }
    }

    pub fn goto(node: impl Into<String>) -> Self {
        Self {
            goto: Some(Goto::Node(node.into())),
            update: StateUpdate::default(),
        }
    }

    pub fn end() -> Self {
        Self {
            goto: Some(Goto::End),
            update: StateUpdate::default(),
        }
    }

    pub fn with_update(mut self, update: StateUpdate) -> Self {
        self.update = update;
        self
    }

    /// Target node name, if this command jumps to a node.
    pub fn target(&self) -> Option<&str> {
        match &self.goto {
            Some(Goto::Node(name)) => Some(name),
            _ => None,
        }
    }
}

/// Boxed node service.
pub type NodeSvc = BoxService<SharedState, Command, BoxError>;

/// Wrap an async function as a node.
pub fn node_fn<F, Fut>(f: F) -> NodeSvc
where
    F: FnMut(SharedState) -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Command, BoxError>> + Send + 'static,
{
    BoxService::new(tower::service_fn(f))
}

/// Graph under construction.
#[derive(Default)]
pub struct StateGraph {
    nodes: HashMap<String, NodeSvc>,
    edges: HashMap<String, String>,
    destinations: HashMap<String, Vec<String>>,
}

impl StateGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node<S>(&mut self, name: impl Into<String>, node: S) -> Result<&mut Self>
    where
        S: Service<SharedState, Response = Command, Error = BoxError> + Send + 'static,
        S::Future: Send + 'static,
    {
        let name = name.into();
        if name == START || name == END {
            return Err(SupervisorError::ReservedAgentName { name });
        }
        if self.nodes.contains_key(&name) {
            return Err(SupervisorError::DuplicateNode { name });
        }
        self.nodes.insert(name, BoxService::new(node));
        Ok(self)
    }

    /// Add a node that may only jump to `destinations` (node names or [`END`]).
    pub fn add_node_with_destinations<S, I, D>(
        &mut self,
        name: impl Into<String>,
        node: S,
        destinations: I,
    ) -> Result<&mut Self>
    where
        S: Service<SharedState, Response = Command, Error = BoxError> + Send + 'static,
        S::Future: Send + 'static,
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        let name = name.into();
        self.add_node(name.clone(), node)?;
        self.destinations
            .insert(name, destinations.into_iter().map(Into::into).collect());
        Ok(self)
    }

    /// Static edge; a node has at most one, and a later call replaces it.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.insert(from.into(), to.into());
        self
    }

    pub fn compile(self) -> Result<CompiledGraph> {
        let known = |name: &str| name == END || self.nodes.contains_key(name);

        for (from, to) in &self.edges {
            if from != START && !self.nodes.contains_key(from) {
                return Err(SupervisorError::UnknownNode { name: from.clone() });
            }
            if !known(to) {
                return Err(SupervisorError::UnknownNode { name: to.clone() });
            }
        }
        for targets in self.destinations.values() {
            if let Some(missing) = targets.iter().find(|t| !known(t)) {
                return Err(SupervisorError::UnknownNode {
                    name: missing.clone(),
                });
            }
        }
        let entry = self
            .edges
            .get(START)
            .cloned()
            .ok_or(SupervisorError::MissingEntryPoint)?;

        Ok(CompiledGraph {
            name: Arc::from(DEFAULT_GRAPH_NAME),
            nodes: Arc::new(tokio::sync::Mutex::new(self.nodes)),
            edges: Arc::new(self.edges),
            destinations: Arc::new(self.destinations),
            entry: Arc::from(entry),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        })
    }
}

/// An executable graph.
#[derive(Clone)]
pub struct CompiledGraph {
    name: Arc<str>,
    nodes: Arc<tokio::sync::Mutex<HashMap<String, NodeSvc>>>,
    edges: Arc<HashMap<String, String>>,
    destinations: Arc<HashMap<String, Vec<String>>>,
    entry: Arc<str>,
    recursion_limit: usize,
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("edges", &self.edges)
            .field("destinations", &self.destinations)
            .field("recursion_limit", &self.recursion_limit)
            .finish_non_exhaustive()
    }
}

impl CompiledGraph {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Arc::from(name.into());
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn recursion_limit(&self) -> usize {
        self.recursion_limit
    }

    /// Declared destinations of a node, if it declared any.
    pub fn destinations(&self, node: &str) -> Option<&[String]> {
        self.destinations.get(node).map(Vec::as_slice)
    }

    pub fn edge(&self, from: &str) -> Option<&str> {
        self.edges.get(from).map(String::as_str)
    }

    pub async fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn next_hop(&self, current: &str, goto: Option<Goto>) -> Result<String> {
        let Some(goto) = goto else {
            return Ok(self.edges.get(current).cloned().unwrap_or_else(|| END.to_string()));
        };
        if let Some(allowed) = self.destinations.get(current) {
            if !allowed.iter().any(|d| d == goto.as_str()) {
                return Err(SupervisorError::InvalidDestination {
                    from: current.to_string(),
                    to: goto.as_str().to_string(),
                    allowed: allowed.clone(),
                });
            }
        }
        Ok(goto.as_str().to_string())
    }

    /// Run the graph to completion.
    #[instrument(skip_all, fields(graph = %self.name))]
    pub async fn ainvoke(&self, input: SharedState) -> std::result::Result<SharedState, BoxError> {
        let mut state = SharedState {
            messages: add_messages(Vec::new(), input.messages),
            extra: input.extra,
        };
        let mut current = self.entry.to_string();
        let mut steps = 0usize;

        debug!(entry = %current, "graph run started");
        while current != END {
            if steps >= self.recursion_limit {
                return Err(SupervisorError::RecursionLimit {
                    limit: self.recursion_limit,
                }
                .into());
            }
            steps += 1;
            trace!(step = steps, node = %current, "executing node");

            let command = {
                let mut nodes = self.nodes.lock().await;
                let node = nodes
                    .get_mut(&current)
                    .ok_or_else(|| SupervisorError::UnknownNode {
                        name: current.clone(),
                    })?;
                ServiceExt::ready(node).await?.call(state.clone()).await?
            };

            state = state.merged(command.update);
            let next = self.next_hop(&current, command.goto)?;
            trace!(from = %current, to = %next, "routing");
            current = next;
        }

        info!(steps, messages = state.messages.len(), "✅ graph run finished");
        Ok(state)
    }

    /// Blocking form of [`CompiledGraph::ainvoke`] on a private current-thread runtime.
    ///
    /// Fails with [`SupervisorError::NestedRuntime`] inside an async context.
    pub fn invoke(&self, input: SharedState) -> std::result::Result<SharedState, BoxError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(SupervisorError::NestedRuntime.into());
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.ainvoke(input))
    }
}

impl Service<SharedState> for CompiledGraph {
    type Response = SharedState;
    type Error = BoxError;
    type Future = BoxFuture<'static, std::result::Result<SharedState, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: SharedState) -> Self::Future {
        let graph = self.clone();
        Box::pin(async move { graph.ainvoke(req).await })
    }
}
