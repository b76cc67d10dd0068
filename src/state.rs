//! Shared conversation state threaded through the graph.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::messages::Message;

/// State key holding a structured final answer.
pub const STRUCTURED_RESPONSE_KEY: &str = "structured_response";

/// The conversation plus any auxiliary keys.
///
/// Nodes never edit a state in place; they return a [`StateUpdate`] that the
/// executor folds in with [`SharedState::merged`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SharedState {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn structured_response(&self) -> Option<&Value> {
        self.get(STRUCTURED_RESPONSE_KEY)
    }

    /// Fold an update in: messages through [`add_messages`], extra keys by overwrite.
    pub fn merged(self, update: StateUpdate) -> Self {
        let mut extra = self.extra;
        extra.extend(update.extra);
        Self {
            messages: add_messages(self.messages, update.messages),
            extra,
        }
    }
}

/// A partial state returned by a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub messages: Vec<Message>,
    pub extra: Map<String, Value>,
}

impl StateUpdate {
    pub fn messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.extra.is_empty()
    }
}

impl From<SharedState> for StateUpdate {
    fn from(state: SharedState) -> Self {
        Self {
            messages: state.messages,
            extra: state.extra,
        }
    }
}

/// Merge `right` into `left` by message id.
///
/// Messages without an id get a fresh one. A right-hand message whose id
/// already exists replaces the left-hand message in place; all others are
/// appended in order.
pub fn add_messages(left: Vec<Message>, right: Vec<Message>) -> Vec<Message> {
    let mut merged: Vec<Message> = left.into_iter().map(ensure_id).collect();
    let mut index: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .filter_map(|(i, m)| m.id.clone().map(|id| (id, i)))
        .collect();

    for message in right.into_iter().map(ensure_id) {
        let id = message.id.clone().unwrap_or_default();
        match index.get(&id) {
            Some(&pos) => merged[pos] = message,
            None => {
                index.insert(id, merged.len());
                merged.push(message);
            }
        }
    }
    merged
}

fn ensure_id(mut message: Message) -> Message {
    if message.id.is_none() {
        message.id = Some(Uuid::new_v4().to_string());
    }
    message
}
