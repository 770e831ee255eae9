//! OpenAI-compatible streaming chat completions.
//!
//! ## Protocol Overview
//!
//! 1. **Request**: `POST {api_url}/chat/completions` with `stream: true`,
//!    the rendered transcript as `messages`, and tools as `function` tools.
//! 2. **Stream**: server-sent events, one `chat.completion.chunk` per
//!    `data:` line, terminated by `data: [DONE]`.
//! 3. **Tool calls**: `delta.tool_calls[i]` arrive as fragments keyed by
//!    `index`; the first fragment carries `id` and `function.name`, later ones
//!    append to `function.arguments`. Complete calls are yielded once
//!    `finish_reason` arrives.

use super::model::{DeltaStream, FinishReason, LanguageModel, ModelDelta};
use super::tools::ToolSpec;
use super::transcript::Turn;
use crate::config::DialogueConfig;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::time::Duration;

const CHUNK_OBJECT: &str = "chat.completion.chunk";

pub struct OpenAiChat {
    config: DialogueConfig,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(config: DialogueConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;
        Ok(Self { config, client })
    }

    fn request_body(&self, turns: &[Turn], tools: &[ToolSpec]) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": turns.iter().map(turn_to_message).collect::<Vec<_>>(),
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(tool_to_function).collect());
        }
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

#[async_trait]
impl LanguageModel for OpenAiChat {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream(&self, turns: &[Turn], tools: &[ToolSpec]) -> anyhow::Result<DeltaStream> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("OpenAI API key is not configured"))?;
        let url = format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'));

        tracing::debug!(model = %self.config.model, turns = turns.len(), tools = tools.len(), "Starting chat completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&self.request_body(turns, tools))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Chat completion request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Chat completion returned {status}: {body}");
        }

        let events = response.bytes_stream().eventsource();
        Ok(decode_events(events.map(|event| {
            event
                .map(|e| e.data)
                .map_err(|e| anyhow::anyhow!("SSE stream error: {e}"))
        })))
    }
}

// ── Request mapping ────────────────────────────────────────────────

fn turn_to_message(turn: &Turn) -> Value {
    match turn {
        Turn::System(text) => json!({ "role": "system", "content": text }),
        Turn::User(text) => json!({ "role": "user", "content": text }),
        Turn::Assistant(text) => json!({ "role": "assistant", "content": text }),
        Turn::ToolInvocation(call) => json!({
            "role": "assistant",
            "content": Value::Null,
            "tool_calls": [{
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": Value::Object(call.arguments.clone()).to_string(),
                }
            }]
        }),
        Turn::ToolResult {
            call_id,
            name,
            result,
        } => json!({
            "role": "tool",
            "tool_call_id": call_id,
            "name": name,
            "content": result.to_string(),
        }),
    }
}

fn tool_to_function(spec: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.parameters,
        }
    })
}

// ── Response decoding ──────────────────────────────────────────────

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

struct DecodeState<S> {
    events: Pin<Box<S>>,
    calls: BTreeMap<u64, PartialCall>,
    pending: VecDeque<ModelDelta>,
    finished: bool,
    done: bool,
}

impl<S> DecodeState<S> {
    fn flush_calls(&mut self) {
        for (_, call) in std::mem::take(&mut self.calls) {
            self.pending.push_back(ModelDelta::ToolCall {
                id: call.id,
                name: call.name,
                arguments: call.arguments,
            });
        }
    }

    fn apply_chunk(&mut self, chunk: &Value) -> anyhow::Result<()> {
        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| error.as_str())
                .unwrap_or("An error occurred during streaming");
            anyhow::bail!("SSE API error: {message}");
        }
        if chunk.get("object").and_then(Value::as_str) != Some(CHUNK_OBJECT) {
            tracing::debug!("Skipping non-chunk SSE event");
            return Ok(());
        }
        let Some(choice) = chunk.pointer("/choices/0") else {
            return Ok(());
        };

        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    self.pending.push_back(ModelDelta::Text(text.to_string()));
                }
            }
            if let Some(fragments) = delta.get("tool_calls").and_then(Value::as_array) {
                for fragment in fragments {
                    let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
                    let call = self.calls.entry(index).or_default();
                    if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                        call.id = id.to_string();
                    }
                    if let Some(function) = fragment.get("function") {
                        if let Some(name) = function.get("name").and_then(Value::as_str) {
                            if !name.is_empty() {
                                call.name = name.to_string();
                            }
                        }
                        if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                            call.arguments.push_str(arguments);
                        }
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.flush_calls();
            self.pending
                .push_back(ModelDelta::Finish(FinishReason::parse(reason)));
            self.finished = true;
        }
        Ok(())
    }
}

/// Turn a stream of SSE `data` payloads into model deltas.
fn decode_events<S>(events: S) -> DeltaStream
where
    S: Stream<Item = anyhow::Result<String>> + Send + 'static,
{
    let state = DecodeState {
        events: Box::pin(events),
        calls: BTreeMap::new(),
        pending: VecDeque::new(),
        finished: false,
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delta) = state.pending.pop_front() {
                return Some((Ok(delta), state));
            }
            if state.done {
                return None;
            }
            match state.events.next().await {
                Some(Ok(data)) if data.trim() == "[DONE]" => {
                    state.flush_calls();
                    state.done = true;
                }
                Some(Ok(data)) => {
                    let parsed = serde_json::from_str::<Value>(&data)
                        .map_err(|e| anyhow::anyhow!("SSE parsing error: {e}, data: {data}"))
                        .and_then(|chunk| state.apply_chunk(&chunk));
                    if let Err(e) = parsed {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    if !state.finished {
                        return Some((
                            Err(anyhow::anyhow!("SSE stream closed before response completed")),
                            state,
                        ));
                    }
                }
            }
        }
    })
    .boxed()
}
