//! # Handoff tools
//!
//! A handoff is a tool the supervisor model can call to pass control to a
//! worker agent. Calling `transfer_to_<token>` does not run any business
//! logic: the tool answers its own call with an acknowledgment message and
//! returns a [`Command`] that sends the graph to the worker, carrying the
//! full history along.
//!
//! The way back is recorded with [`create_handoff_back_messages`], a
//! synthetic ai/tool pair that makes the transcript read as if the worker had
//! called a `transfer_back_to_<supervisor>` tool.
//!
//! ```
//! use tower_supervisor::handoff::{create_handoff_tool, HandoffTool};
//!
//! let tool = create_handoff_tool("Crème Brûlée Expert");
//! assert_eq!(tool.name, "transfer_to_creme_brulee_expert");
//!
//! let custom = HandoffTool::new("math_expert")
//!     .with_name("ask_math")
//!     .with_description("Route arithmetic questions")
//!     .build();
//! assert_eq!(custom.name, "ask_math");
//! ```

use std::collections::BTreeSet;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tower::{util::BoxCloneService, BoxError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::graph::Command;
use crate::messages::{Message, ToolCall};
use crate::normalize::normalize_agent_name;
use crate::state::StateUpdate;
use crate::tool::{ToolDef, ToolInvocation, ToolOutput};

pub const HANDOFF_TOOL_PREFIX: &str = "transfer_to_";
pub const HANDOFF_BACK_TOOL_PREFIX: &str = "transfer_back_to_";
pub const FORWARD_MESSAGE_TOOL_NAME: &str = "forward_message";
/// Response-metadata flag set on synthetic handoff-back ai messages.
pub const HANDOFF_BACK_METADATA_KEY: &str = "__is_handoff_back";

/// `transfer_to_<normalize(agent_name)>`
pub fn handoff_tool_name(agent_name: &str) -> String {
    format!("{HANDOFF_TOOL_PREFIX}{}", normalize_agent_name(agent_name))
}

pub fn is_handoff_tool_name(name: &str) -> bool {
    name.starts_with(HANDOFF_TOOL_PREFIX)
}

fn empty_parameters() -> Value {
    json!({"type": "object", "properties": {}, "required": []})
}

/// Builder for a handoff tool targeting one agent.
#[derive(Debug, Clone)]
pub struct HandoffTool {
    agent_name: String,
    name: Option<String>,
    description: Option<String>,
}

impl HandoffTool {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            name: None,
            description: None,
        }
    }

    /// Override the tool name. Custom names are used verbatim.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn tool_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| handoff_tool_name(&self.agent_name))
    }

    pub fn description(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("Ask agent '{}' for help", self.agent_name))
    }

    pub fn build(self) -> ToolDef {
        let tool_name = self.tool_name();
        let description = self.description();
        let agent_name = self.agent_name;

        let svc_tool_name = tool_name.clone();
        let svc = tower::service_fn(move |inv: ToolInvocation| {
            let agent_name = agent_name.clone();
            let tool_name = svc_tool_name.clone();
            async move {
                info!("🔄 Handoff via {} → {}", tool_name, agent_name);
                let ack = Message::tool(
                    format!("Successfully transferred to {agent_name}"),
                    inv.id.clone(),
                )
                .with_name(tool_name);

                let mut messages = inv.state.messages.clone();
                messages.push(ack);
                let command = Command::goto(agent_name).with_update(StateUpdate::messages(messages));
                Ok::<_, BoxError>(ToolOutput::command(inv.id, command))
            }
        });

        ToolDef::new(tool_name, description, empty_parameters(), BoxCloneService::new(svc))
    }
}

/// Handoff tool with the default name and description.
pub fn create_handoff_tool(agent_name: impl Into<String>) -> ToolDef {
    HandoffTool::new(agent_name).build()
}

/// The (ai, tool) pair appended when a worker hands control back.
pub fn create_handoff_back_messages(agent_name: &str, supervisor_name: &str) -> (Message, Message) {
    let tool_name = format!("{HANDOFF_BACK_TOOL_PREFIX}{}", normalize_agent_name(supervisor_name));
    let call_id = Uuid::new_v4().to_string();

    let announce = Message::ai_with_tool_calls(
        format!("Transferring back to {supervisor_name}"),
        vec![ToolCall::new(tool_name.clone(), json!({})).with_id(call_id.clone())],
    )
    .with_name(agent_name)
    .with_response_metadata(HANDOFF_BACK_METADATA_KEY, Value::Bool(true));

    let ack = Message::tool(
        format!("Successfully transferred back to {supervisor_name}"),
        call_id,
    )
    .with_name(tool_name);

    (announce, ack)
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ForwardMessageArgs {
    /// Name of the agent whose latest reply should be forwarded
    from_agent: String,
}

fn is_handoff_back(message: &Message) -> bool {
    message
        .response_metadata
        .get(HANDOFF_BACK_METADATA_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || message.content.to_text().starts_with("Transferring back to")
}

/// Tool that ends the run by repeating a worker's latest reply verbatim.
///
/// The forwarded copy is attributed to `supervisor_name`. When no reply from
/// the requested agent exists the tool returns a plain result listing the
/// agent names it did find, and the supervisor keeps going.
pub fn create_forward_message_tool(supervisor_name: impl Into<String>) -> ToolDef {
    let supervisor_name = supervisor_name.into();
    let schema = schemars::schema_for!(ForwardMessageArgs);
    let parameters = serde_json::to_value(schema.schema).unwrap_or_else(|_| empty_parameters());

    let svc = tower::service_fn(move |inv: ToolInvocation| {
        let supervisor_name = supervisor_name.clone();
        async move {
            let args: ForwardMessageArgs = serde_json::from_value(inv.arguments)?;
            let wanted = args.from_agent.to_lowercase();

            let target = inv.state.messages.iter().rev().find(|m| {
                m.is_ai()
                    && m.agent_name().map(str::to_lowercase).as_deref() == Some(wanted.as_str())
                    && !is_handoff_back(m)
            });

            let Some(target) = target else {
                let found: BTreeSet<&str> = inv
                    .state
                    .messages
                    .iter()
                    .filter(|m| m.is_ai())
                    .filter_map(Message::agent_name)
                    .collect();
                debug!(from_agent = %args.from_agent, "no message to forward");
                return Ok::<_, BoxError>(ToolOutput::value(
                    inv.id,
                    Value::String(format!(
                        "Could not find message from source agent {}. Found names: {:?}",
                        args.from_agent, found
                    )),
                ));
            };

            info!("📨 Forwarding reply of {} as {}", args.from_agent, supervisor_name);
            let forwarded = Message::ai(target.content.clone())
                .with_name(supervisor_name)
                .with_id(Uuid::new_v4().to_string());
            Ok(ToolOutput::command(
                inv.id,
                Command::end().with_update(StateUpdate::messages(vec![forwarded])),
            ))
        }
    });

    ToolDef::new(
        FORWARD_MESSAGE_TOOL_NAME,
        "Forwards the latest message from the specified agent to the user without any changes. \
         Use this to save tokens and avoid hallucinating when the agent's reply is already the final answer.",
        parameters,
        BoxCloneService::new(svc),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Goto;
    use crate::messages::{MessageContent, Role};
    use crate::state::SharedState;
    use crate::tool::ToolRouter;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn call(name: &str, arguments: Value, messages: Vec<Message>) -> ToolInvocation {
        ToolInvocation {
            id: "call_1".into(),
            name: name.into(),
            arguments,
            state: Arc::new(SharedState::new(messages)),
        }
    }

    #[test]
    fn tool_names_are_normalized() {
        assert_eq!(handoff_tool_name("math_expert"), "transfer_to_math_expert");
        assert_eq!(handoff_tool_name("Crème Brûlée"), "transfer_to_creme_brulee");
        assert!(is_handoff_tool_name("transfer_to_x"));
        assert!(!is_handoff_tool_name("transfer_back_to_x"));
    }

    #[test]
    fn default_and_custom_metadata() {
        let tool = create_handoff_tool("Café Guide");
        assert_eq!(tool.name, "transfer_to_cafe_guide");
        assert_eq!(tool.description, "Ask agent 'Café Guide' for help");

        let custom = HandoffTool::new("math").with_name("ask_math").with_description("Math help").build();
        assert_eq!(custom.name, "ask_math");
        assert_eq!(custom.description, "Math help");
    }

    #[tokio::test]
    async fn handoff_returns_transfer_command() {
        let history = vec![
            Message::human("what's 2 + 2?").with_id("h1"),
            Message::ai_with_tool_calls("", vec![ToolCall::new("transfer_to_math_expert", json!({})).with_id("call_1")]),
        ];
        let tool = create_handoff_tool("math_expert");
        let out = tool
            .service
            .oneshot(call("transfer_to_math_expert", json!({}), history.clone()))
            .await
            .unwrap();

        let command = out.command.expect("handoff returns a command");
        assert_eq!(command.goto, Some(Goto::Node("math_expert".into())));
        assert_eq!(command.update.messages.len(), 3);
        assert_eq!(&command.update.messages[..2], &history[..]);

        let ack = &command.update.messages[2];
        assert_eq!(ack.role, Role::Tool);
        assert_eq!(ack.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(ack.name.as_deref(), Some("transfer_to_math_expert"));
        assert_eq!(ack.content, MessageContent::Text("Successfully transferred to math_expert".into()));
    }

    #[test]
    fn handoff_back_pair() {
        let (announce, ack) = create_handoff_back_messages("math_expert", "Supervisor Prime");

        assert_eq!(announce.role, Role::Ai);
        assert_eq!(announce.name.as_deref(), Some("math_expert"));
        assert_eq!(announce.content, MessageContent::Text("Transferring back to Supervisor Prime".into()));
        assert_eq!(announce.tool_calls.len(), 1);
        assert_eq!(announce.tool_calls[0].name, "transfer_back_to_supervisor_prime");
        assert_eq!(announce.response_metadata.get(HANDOFF_BACK_METADATA_KEY), Some(&json!(true)));

        assert_eq!(ack.role, Role::Tool);
        assert_eq!(ack.tool_call_id.as_deref(), Some(announce.tool_calls[0].id.as_str()));
        assert_eq!(ack.content, MessageContent::Text("Successfully transferred back to Supervisor Prime".into()));

        let (again, _) = create_handoff_back_messages("math_expert", "Supervisor Prime");
        assert_ne!(again.tool_calls[0].id, announce.tool_calls[0].id);
    }

    #[tokio::test]
    async fn forward_message_ends_with_copy() {
        let (back, back_ack) = create_handoff_back_messages("Research", "supervisor");
        let history = vec![
            Message::human("find me ramen"),
            Message::ai("Ramen Nagi, 4.6 stars").with_name("research"),
            back,
            back_ack,
        ];
        let (router, _) = ToolRouter::new(vec![create_forward_message_tool("supervisor")]);
        let out = router
            .oneshot(call(FORWARD_MESSAGE_TOOL_NAME, json!({"from_agent": "Research"}), history))
            .await
            .unwrap();

        let command = out.command.expect("forward ends the run");
        assert_eq!(command.goto, Some(Goto::End));
        let forwarded = &command.update.messages[0];
        assert_eq!(forwarded.content, MessageContent::Text("Ramen Nagi, 4.6 stars".into()));
        assert_eq!(forwarded.name.as_deref(), Some("supervisor"));
    }

    #[tokio::test]
    async fn forward_message_reports_known_names() {
        let history = vec![Message::ai("hi").with_name("places"), Message::ai("yo").with_name("ranking")];
        let out = create_forward_message_tool("supervisor")
            .service
            .oneshot(call(FORWARD_MESSAGE_TOOL_NAME, json!({"from_agent": "route"}), history))
            .await
            .unwrap();

        assert!(out.command.is_none());
        assert_eq!(
            out.content_text(),
            "Could not find message from source agent route. Found names: {\"places\", \"ranking\"}"
        );
    }
}
