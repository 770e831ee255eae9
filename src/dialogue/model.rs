//! Language-model backend seam.

use super::tools::ToolSpec;
use super::transcript::Turn;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other(String),
}

impl FinishReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "stop" => Self::Stop,
            "tool_calls" | "function_call" => Self::ToolCalls,
            "length" => Self::Length,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One increment of streamed model output.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelDelta {
    Text(String),
    /// A complete tool call. `arguments` is the raw argument text as the
    /// model produced it; see [`super::args::parse_tool_arguments`].
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    Finish(FinishReason),
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = anyhow::Result<ModelDelta>> + Send>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    /// Start a generation over `turns` with `tools` declared as callable.
    async fn stream(&self, turns: &[Turn], tools: &[ToolSpec]) -> anyhow::Result<DeltaStream>;
}
