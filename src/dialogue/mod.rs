//! Dialogue engine: transcript ownership, model streaming, and tool calls.
//!
//! ```text
//!   Utterance ──submit──▶ DialogueEngine ──stream──▶ LanguageModel
//!                              │  ▲                        │
//!                              │  └──── tool result ◀── Tool (HTTP / in-process)
//!                              ▼
//!                         Reply* (acks, then one final)
//! ```

pub mod args;
pub mod engine;
pub mod manifest;
pub mod markdown;
pub mod model;
pub mod openai;
pub mod prompt;
pub mod tools;
pub mod transcript;

pub use engine::{CallContext, DialogueEngine, DialogueHandle, Reply};
pub use model::{DeltaStream, FinishReason, LanguageModel, ModelDelta};
pub use openai::OpenAiChat;
pub use tools::{HttpTool, Tool, ToolRegistry, ToolSpec};
pub use transcript::{ToolCall, Transcript, Turn};
