//! Agent identity tagging
//!
//! Several agents share one linear history, but a chat model only sees text.
//! [`InlineTagger`] writes the author into the content itself,
//! `<name>math_expert</name><content>4</content>`, before the history reaches
//! the model, and strips the tags again from the model's reply.
//!
//! Both directions return `Cow<'_, Message>`: `Cow::Borrowed` means the
//! message was not in a form the operation applies to and is handed back
//! untouched. Decoding never fails; anything that does not match the tagged
//! shape passes through.
//!
//! [`AgentNameLayer`] applies a tagger around a model service.

use std::borrow::Cow;
use std::sync::{Arc, LazyLock};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use regex::Regex;
use tower::{BoxError, Layer, Service};
use tracing::trace;

use crate::messages::{ContentBlock, Message, MessageContent};
use crate::provider::ModelRequest;

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<name>(.*?)</name>").expect("valid name pattern"));
static CONTENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<content>(.*?)</content>").expect("valid content pattern"));

/// Moves agent identity in and out of message content.
pub trait MessageTagger: Send + Sync {
    /// Attach the author's identity to an outbound message.
    fn encode<'a>(&self, message: &'a Message) -> Cow<'a, Message>;

    /// Remove a previously attached identity from a model response.
    fn decode<'a>(&self, message: &'a Message) -> Cow<'a, Message>;
}

/// XML-style inline tags in the message text.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineTagger;

impl MessageTagger for InlineTagger {
    fn encode<'a>(&self, message: &'a Message) -> Cow<'a, Message> {
        encode(message)
    }

    fn decode<'a>(&self, message: &'a Message) -> Cow<'a, Message> {
        decode(message)
    }
}

fn wrap(name: &str, text: &str) -> String {
    format!("<name>{name}</name><content>{text}</content>")
}

/// Tag an ai message with its author's name.
///
/// With block content only the first text block survives; further text
/// blocks are dropped and non-text blocks move in front of the tagged text.
pub fn encode(message: &Message) -> Cow<'_, Message> {
    let Some(name) = message.agent_name().filter(|_| message.is_ai()) else {
        return Cow::Borrowed(message);
    };

    let content = match &message.content {
        MessageContent::Text(text) => MessageContent::Text(wrap(name, text)),
        MessageContent::Blocks(blocks) => {
            let (text_blocks, mut other) = MessageContent::partition_blocks(blocks);
            let first = text_blocks.first().and_then(|b| b.as_text()).unwrap_or("");
            other.push(ContentBlock::text(wrap(name, first)));
            MessageContent::Blocks(other)
        }
    };

    let mut tagged = message.clone();
    tagged.content = content;
    Cow::Owned(tagged)
}

/// Strip the tags written by [`encode`].
///
/// The captured name must equal the message's own `name`; a mismatch, a
/// missing tag, or an untagged message leaves the message as is.
pub fn decode(message: &Message) -> Cow<'_, Message> {
    let Some(name) = message.agent_name().filter(|_| message.is_ai()) else {
        return Cow::Borrowed(message);
    };
    if message.content.is_empty() {
        return Cow::Borrowed(message);
    }

    let scanned = match &message.content {
        MessageContent::Text(text) => text.as_str(),
        MessageContent::Blocks(blocks) => match blocks.iter().find_map(ContentBlock::as_text) {
            Some(text) => text,
            None => return Cow::Borrowed(message),
        },
    };

    let (Some(name_match), Some(content_match)) = (
        NAME_PATTERN.captures(scanned),
        CONTENT_PATTERN.captures(scanned),
    ) else {
        trace!(agent = name, "message not in tagged form");
        return Cow::Borrowed(message);
    };

    if &name_match[1] != name {
        trace!(agent = name, tagged = &name_match[1], "tag name mismatch, leaving message as is");
        return Cow::Borrowed(message);
    }
    let payload = &content_match[1];

    let content = match &message.content {
        MessageContent::Text(_) => MessageContent::Text(payload.to_string()),
        MessageContent::Blocks(blocks) => {
            let (_, mut other) = MessageContent::partition_blocks(blocks);
            if !payload.is_empty() {
                other.push(ContentBlock::text(payload));
            }
            MessageContent::Blocks(other)
        }
    };

    let mut decoded = message.clone();
    decoded.content = content;
    Cow::Owned(decoded)
}

// ================================================================================================
// Model wrapper
// ================================================================================================

/// Encodes every prompt message and decodes the model's reply.
///
/// Replies that come back without a name are attributed to `agent_name`
/// before decoding, so the tag check has something to compare against.
#[derive(Clone)]
pub struct AgentNameLayer {
    tagger: Arc<dyn MessageTagger>,
    agent_name: Arc<str>,
}

impl AgentNameLayer {
    pub fn new(tagger: impl MessageTagger + 'static, agent_name: impl Into<String>) -> Self {
        Self {
            tagger: Arc::new(tagger),
            agent_name: Arc::from(agent_name.into()),
        }
    }

    pub fn inline(agent_name: impl Into<String>) -> Self {
        Self::new(InlineTagger, agent_name)
    }
}

impl<S> Layer<S> for AgentNameLayer {
    type Service = AgentNameModel<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AgentNameModel {
            inner,
            tagger: self.tagger.clone(),
            agent_name: self.agent_name.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AgentNameModel<S> {
    inner: S,
    tagger: Arc<dyn MessageTagger>,
    agent_name: Arc<str>,
}

impl<S> Service<ModelRequest> for AgentNameModel<S>
where
    S: Service<ModelRequest, Response = Message, Error = BoxError>,
    S::Future: Send + 'static,
{
    type Response = Message;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Message, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: ModelRequest) -> Self::Future {
        req.messages = req
            .messages
            .iter()
            .map(|m| self.tagger.encode(m).into_owned())
            .collect();

        let tagger = self.tagger.clone();
        let agent_name = self.agent_name.clone();
        let fut = self.inner.call(req);
        Box::pin(async move {
            let mut response = fut.await?;
            if response.agent_name().is_none() {
                response.name = Some(agent_name.to_string());
            }
            Ok(tagger.decode(&response).into_owned())
        })
    }
}
