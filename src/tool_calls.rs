//! Canonicalizing handoff tool calls coming out of a model.

use std::borrow::Cow;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower::{BoxError, Layer, Service};
use tracing::debug;

use crate::handoff::HANDOFF_TOOL_PREFIX;
use crate::messages::Message;
use crate::normalize::normalize_agent_name;

/// Rewrite every `transfer_to_<suffix>` call name to `transfer_to_<normalize(suffix)>`.
///
/// Returns `Cow::Borrowed` when no name changed. Otherwise the result is a
/// copy of `message` with only the affected tool-call names replaced.
pub fn normalize_tool_calls(message: &Message) -> Cow<'_, Message> {
    if !message.has_tool_calls() {
        return Cow::Borrowed(message);
    }

    let mut fixed: Option<Message> = None;
    for (idx, call) in message.tool_calls.iter().enumerate() {
        let Some(suffix) = call.name.strip_prefix(HANDOFF_TOOL_PREFIX) else {
            continue;
        };
        let canonical = format!("{HANDOFF_TOOL_PREFIX}{}", normalize_agent_name(suffix));
        if canonical != call.name {
            debug!(from = %call.name, to = %canonical, "normalized handoff tool call");
            fixed.get_or_insert_with(|| message.clone()).tool_calls[idx].name = canonical;
        }
    }

    match fixed {
        Some(message) => Cow::Owned(message),
        None => Cow::Borrowed(message),
    }
}

/// Layer applying [`normalize_tool_calls`] to every model reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeToolCallsLayer;

impl<S> Layer<S> for NormalizeToolCallsLayer {
    type Service = NormalizeToolCalls<S>;

    fn layer(&self, inner: S) -> Self::Service {
        NormalizeToolCalls { inner }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizeToolCalls<S> {
    inner: S,
}

impl<S, Req> Service<Req> for NormalizeToolCalls<S>
where
    S: Service<Req, Response = Message, Error = BoxError>,
    S::Future: Send + 'static,
{
    type Response = Message;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Message, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let fut = self.inner.call(req);
        Box::pin(async move {
            let message = fut.await?;
            Ok(match normalize_tool_calls(&message) {
                Cow::Borrowed(_) => message,
                Cow::Owned(fixed) => fixed,
            })
        })
    }
}
