//! OpenAI chat-completions backend
//!
//! Maps [`ModelRequest`] onto async-openai request types and the first
//! choice of the response back onto a [`Message`]. The client is owned by
//! the caller and shared through an `Arc`.

use std::sync::Arc;
use std::task::{Context, Poll};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
        ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolType,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
        FunctionCall, FunctionObjectArgs, ImageDetail, ImageUrl, ResponseFormat as OpenAIResponseFormat,
        ResponseFormatJsonSchema,
    },
    Client,
};
use futures::future::BoxFuture;
use serde_json::Value;
use tower::{BoxError, Service};
use tracing::{debug, debug_span, Instrument};

use crate::error::SupervisorError;
use crate::messages::{ContentBlock, Message, MessageContent, Role, ToolCall, UsageMetadata};
use crate::normalize::normalize_agent_name;
use crate::provider::ModelRequest;
use crate::tool::ToolSpec;

/// Chat model served by the OpenAI API (or any compatible endpoint).
#[derive(Clone)]
pub struct OpenAIChatModel {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
    temperature: Option<f32>,
}

impl OpenAIChatModel {
    /// Uses `OPENAI_API_KEY` / `OPENAI_BASE_URL` from the environment.
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_client(Arc::new(Client::new()), model)
    }

    pub fn with_client(client: Arc<Client<OpenAIConfig>>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            temperature: None,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Build the chat-completions request for `req`.
    pub fn build_request(&self, req: &ModelRequest) -> Result<CreateChatCompletionRequest, BoxError> {
        let messages = req
            .messages
            .iter()
            .map(convert_message)
            .collect::<Result<Vec<_>, BoxError>>()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model).messages(messages);

        if !req.tools.is_empty() {
            let tools = req
                .tools
                .iter()
                .map(convert_tool)
                .collect::<Result<Vec<_>, BoxError>>()?;
            builder.tools(tools);
            if let Some(parallel) = req.parallel_tool_calls {
                builder.parallel_tool_calls(parallel);
            }
        }
        if let Some(t) = self.temperature {
            builder.temperature(t);
        }
        if let Some(format) = &req.response_format {
            builder.response_format(OpenAIResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: None,
                    name: format.name.clone(),
                    schema: Some(format.schema.clone()),
                    strict: Some(true),
                },
            });
        }
        Ok(builder.build()?)
    }
}

/// OpenAI accepts `^[a-zA-Z0-9_-]+$` for participant names.
fn participant_name(name: &str) -> Option<String> {
    let cleaned: String = normalize_agent_name(name)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

fn image_detail(detail: Option<&str>) -> Option<ImageDetail> {
    match detail? {
        "low" => Some(ImageDetail::Low),
        "high" => Some(ImageDetail::High),
        _ => Some(ImageDetail::Auto),
    }
}

fn user_content(content: &MessageContent) -> ChatCompletionRequestUserMessageContent {
    match content {
        MessageContent::Text(text) => ChatCompletionRequestUserMessageContent::Text(text.clone()),
        MessageContent::Blocks(blocks) => ChatCompletionRequestUserMessageContent::Array(
            blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => ChatCompletionRequestUserMessageContentPart::Text(
                        ChatCompletionRequestMessageContentPartText { text: text.clone() },
                    ),
                    ContentBlock::Image { image_url, detail } => {
                        ChatCompletionRequestUserMessageContentPart::ImageUrl(
                            ChatCompletionRequestMessageContentPartImage {
                                image_url: ImageUrl {
                                    url: image_url.clone(),
                                    detail: image_detail(detail.as_deref()),
                                },
                            },
                        )
                    }
                })
                .collect(),
        ),
    }
}

/// Convert one history message into the OpenAI request shape.
pub fn convert_message(msg: &Message) -> Result<ChatCompletionRequestMessage, BoxError> {
    let name = msg.agent_name().and_then(participant_name);
    let converted: ChatCompletionRequestMessage = match msg.role {
        Role::System => {
            let mut builder = ChatCompletionRequestSystemMessageArgs::default();
            builder.content(msg.content.to_text().into_owned());
            builder.build()?.into()
        }
        Role::Human => {
            let mut builder = ChatCompletionRequestUserMessageArgs::default();
            builder.content(user_content(&msg.content));
            if let Some(name) = name {
                builder.name(name);
            }
            builder.build()?.into()
        }
        Role::Ai => {
            let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
            let text = msg.content.to_text();
            if !text.is_empty() || msg.tool_calls.is_empty() {
                builder.content(text.into_owned());
            }
            if let Some(name) = name {
                builder.name(name);
            }
            if !msg.tool_calls.is_empty() {
                let calls: Vec<ChatCompletionMessageToolCall> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| ChatCompletionMessageToolCall {
                        id: tc.id.clone(),
                        r#type: ChatCompletionToolType::Function,
                        function: FunctionCall {
                            name: tc.name.clone(),
                            arguments: tc.arguments.to_string(),
                        },
                    })
                    .collect();
                builder.tool_calls(calls);
            }
            builder.build()?.into()
        }
        Role::Tool => ChatCompletionRequestToolMessageArgs::default()
            .content(msg.content.to_text().into_owned())
            .tool_call_id(msg.tool_call_id.clone().unwrap_or_default())
            .build()?
            .into(),
    };
    Ok(converted)
}

/// Convert a tool spec into an OpenAI function tool.
pub fn convert_tool(spec: &ToolSpec) -> Result<ChatCompletionTool, BoxError> {
    let function = FunctionObjectArgs::default()
        .name(&spec.name)
        .description(&spec.description)
        .parameters(spec.parameters.clone())
        .build()?;
    Ok(ChatCompletionToolArgs::default()
        .r#type(ChatCompletionToolType::Function)
        .function(function)
        .build()?)
}

/// Map the first choice of a response onto an ai message.
pub fn convert_response(response: CreateChatCompletionResponse) -> Result<Message, BoxError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| SupervisorError::ModelBehavior {
            message: "No choices in response".to_string(),
        })?;

    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let arguments = serde_json::from_str(&tc.function.arguments)
                .unwrap_or(Value::String(tc.function.arguments));
            ToolCall::new(tc.function.name, arguments).with_id(tc.id)
        })
        .collect();

    let mut message = Message::ai_with_tool_calls(choice.message.content.unwrap_or_default(), tool_calls)
        .with_id(response.id)
        .with_response_metadata("model_name", Value::String(response.model));
    if let Some(reason) = choice.finish_reason {
        message = message.with_response_metadata("finish_reason", serde_json::to_value(reason)?);
    }
    if let Some(usage) = response.usage {
        message = message.with_usage(UsageMetadata {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        });
    }
    Ok(message)
}

impl Service<ModelRequest> for OpenAIChatModel {
    type Response = Message;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Message, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ModelRequest) -> Self::Future {
        let span = debug_span!("openai_chat", model = %self.model);
        let client = self.client.clone();
        let request = self.build_request(&req);
        let fut = async move {
            let request = request?;
            debug!(messages = request.messages.len(), "chat completion request");
            let response = client.chat().create(request).await?;
            convert_response(response)
        };
        Box::pin(fut.instrument(span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ResponseFormat;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn model() -> OpenAIChatModel {
        let client = Client::with_config(OpenAIConfig::new().with_api_key("test-key"));
        OpenAIChatModel::with_client(Arc::new(client), "gpt-4o")
    }

    #[test]
    fn converts_every_role() {
        let ai = Message::ai_with_tool_calls(
            "",
            vec![ToolCall::new("transfer_to_math", json!({"x": 1})).with_id("call_1")],
        )
        .with_name("Supervisor");
        let converted = convert_message(&ai).unwrap();
        let ChatCompletionRequestMessage::Assistant(assistant) = converted else {
            panic!("expected assistant message");
        };
        assert_eq!(assistant.name.as_deref(), Some("supervisor"));
        let calls = assistant.tool_calls.unwrap();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.arguments, r#"{"x":1}"#);

        assert!(matches!(
            convert_message(&Message::system("be brief")).unwrap(),
            ChatCompletionRequestMessage::System(_)
        ));
        assert!(matches!(
            convert_message(&Message::tool("4", "call_1")).unwrap(),
            ChatCompletionRequestMessage::Tool(_)
        ));
    }

    #[test]
    fn human_blocks_become_parts() {
        let human = Message::human(vec![
            ContentBlock::text("what is this?"),
            ContentBlock::Image {
                image_url: "http://example.com/dish.jpg".into(),
                detail: Some("low".into()),
            },
        ]);
        let ChatCompletionRequestMessage::User(user) = convert_message(&human).unwrap() else {
            panic!("expected user message");
        };
        let ChatCompletionRequestUserMessageContent::Array(parts) = user.content else {
            panic!("expected content parts");
        };
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn unicode_names_are_made_safe() {
        assert_eq!(participant_name("Crème Brûlée"), Some("creme_brulee".into()));
        assert_eq!(participant_name("食べ物"), None);
    }

    #[test]
    fn request_carries_tools_and_flags() {
        let mut req = ModelRequest::new(vec![Message::human("hi")]);
        req.tools = vec![ToolSpec::new("transfer_to_math", "Ask math", json!({"type": "object"}))];
        req.parallel_tool_calls = Some(false);
        let built = model().build_request(&req).unwrap();

        assert_eq!(built.model, "gpt-4o");
        assert_eq!(built.tools.map(|t| t.len()), Some(1));
        assert_eq!(built.parallel_tool_calls, Some(false));
        assert!(built.response_format.is_none());
    }

    #[test]
    fn request_with_response_format() {
        let mut req = ModelRequest::new(vec![Message::human("hi")]);
        req.response_format = Some(ResponseFormat::new("answer", json!({"type": "object"})));
        let built = model().build_request(&req).unwrap();
        assert!(matches!(
            built.response_format,
            Some(OpenAIResponseFormat::JsonSchema { ref json_schema }) if json_schema.name == "answer"
        ));
        assert!(built.tools.is_none());
    }

    #[test]
    fn response_maps_to_ai_message() {
        let response: CreateChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "transfer_to_math_expert", "arguments": "{}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }))
        .unwrap();

        let message = convert_response(response).unwrap();
        assert!(message.has_tool_calls());
        assert_eq!(message.tool_calls[0].id, "call_9");
        assert_eq!(message.tool_calls[0].arguments, json!({}));
        assert_eq!(message.id.as_deref(), Some("chatcmpl-1"));
        assert_eq!(message.usage_metadata, Some(UsageMetadata::new(12, 3)));
        assert_eq!(message.response_metadata.get("finish_reason"), Some(&json!("tool_calls")));
    }

    #[test]
    fn empty_choices_is_model_behavior_error() {
        let response: CreateChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-2",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4o",
            "choices": []
        }))
        .unwrap();
        let err = convert_response(response).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SupervisorError>(),
            Some(SupervisorError::ModelBehavior { .. })
        ));
    }
}
