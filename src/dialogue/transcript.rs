//! Conversation transcript owned by the dialogue engine.

use serde_json::{Map, Value};

/// A resolved or pending request from the model to run a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Correlates the invocation with its result in the model's history.
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    System(String),
    User(String),
    Assistant(String),
    ToolInvocation(ToolCall),
    ToolResult {
        call_id: String,
        name: String,
        result: Value,
    },
}

/// Append-only list of turns.
///
/// Tool invocations can only be appended together with their result, so an
/// invocation is always immediately followed by exactly one result.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_system(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::System(text.into()));
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::User(text.into()));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::Assistant(text.into()));
    }

    /// Record a resolved tool call as an invocation turn followed by its result.
    pub fn push_tool_exchange(&mut self, call: ToolCall, result: Value) {
        let call_id = call.id.clone();
        let name = call.name.clone();
        self.turns.push(Turn::ToolInvocation(call));
        self.turns.push(Turn::ToolResult {
            call_id,
            name,
            result,
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
