//! Per-call dialogue engine.
//!
//! The engine task exclusively owns the [`Transcript`]. Each submitted
//! utterance becomes one turn: the user text is appended, the model is
//! streamed, and any tool calls are resolved one at a time (each announced
//! by a short acknowledgement reply) until the model answers in plain text.
//! Every turn ends with exactly one final [`Reply`], the fallback apology
//! when anything in the turn failed.

use super::args::parse_tool_arguments;
use super::markdown::strip_markdown;
use super::model::{FinishReason, LanguageModel, ModelDelta};
use super::prompt::{call_context_notes, datetime_note, render_turns};
use super::tools::{ToolRegistry, ToolSpec};
use super::transcript::{ToolCall, Transcript, Turn};
use crate::config::DialogueConfig;
use crate::error::SubmitError;
use crate::segmenter::Utterance;
use chrono::Utc;
use chrono_tz::Tz;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const REPLY_BUFFER: usize = 16;

/// Text to speak for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub turn: u64,
    /// `false` for acknowledgements spoken while a tool runs.
    pub is_final: bool,
}

/// Identity of the call the engine is talking to.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub session_id: String,
    pub call_sid: Option<String>,
    pub caller: Option<String>,
}

struct Job {
    turn: u64,
    utterance: Utterance,
    replies: mpsc::Sender<Reply>,
}

/// Submission side of a running engine.
#[derive(Clone)]
pub struct DialogueHandle {
    jobs: mpsc::Sender<Job>,
    busy: Arc<AtomicBool>,
    next_turn: Arc<AtomicU64>,
}

impl DialogueHandle {
    /// Start a turn for `utterance`. Rejected while a previous turn is still
    /// running; the returned channel closes after the final reply.
    pub fn submit(&self, utterance: Utterance) -> Result<mpsc::Receiver<Reply>, SubmitError> {
        if self.jobs.is_closed() {
            return Err(SubmitError::Stopped);
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!(
                seq = utterance.seq,
                text = %utterance.text,
                "Dialogue engine busy, rejecting utterance"
            );
            return Err(SubmitError::Busy);
        }

        let (replies, rx) = mpsc::channel(REPLY_BUFFER);
        let turn = self.next_turn.fetch_add(1, Ordering::Relaxed);
        if self
            .jobs
            .try_send(Job {
                turn,
                utterance,
                replies,
            })
            .is_err()
        {
            self.busy.store(false, Ordering::Release);
            return Err(SubmitError::Stopped);
        }
        Ok(rx)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Tool call as announced by the model, arguments still raw.
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Default)]
struct ModelOutput {
    text: String,
    tool_calls: Vec<PendingCall>,
}

pub struct DialogueEngine {
    session_id: String,
    model: Arc<dyn LanguageModel>,
    tools: Arc<ToolRegistry>,
    config: DialogueConfig,
    timezone: Tz,
    transcript: Transcript,
    busy: Arc<AtomicBool>,
}

impl DialogueEngine {
    /// Spawn the engine task for one call. It stops when `cancel` fires,
    /// dropping any in-flight model or tool call.
    pub fn spawn(
        model: Arc<dyn LanguageModel>,
        tools: Arc<ToolRegistry>,
        config: DialogueConfig,
        context: CallContext,
        cancel: CancellationToken,
    ) -> DialogueHandle {
        let (jobs, jobs_rx) = mpsc::channel(1);
        let busy = Arc::new(AtomicBool::new(false));
        let engine = Self::new(model, tools, config, &context, busy.clone());
        tokio::spawn(engine.run(jobs_rx, cancel));
        DialogueHandle {
            jobs,
            busy,
            // Turn 0 is the greeting.
            next_turn: Arc::new(AtomicU64::new(1)),
        }
    }

    fn new(
        model: Arc<dyn LanguageModel>,
        tools: Arc<ToolRegistry>,
        config: DialogueConfig,
        context: &CallContext,
        busy: Arc<AtomicBool>,
    ) -> Self {
        let timezone = config.timezone().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Invalid dialogue timezone, using UTC");
            chrono_tz::UTC
        });

        let mut transcript = Transcript::new();
        transcript.push_system(config.system_prompt.clone());
        if !config.greeting.trim().is_empty() {
            transcript.push_assistant(config.greeting.trim());
        }
        for note in call_context_notes(context.call_sid.as_deref(), context.caller.as_deref()) {
            transcript.push_system(note);
        }

        Self {
            session_id: context.session_id.clone(),
            model,
            tools,
            config,
            timezone,
            transcript,
            busy,
        }
    }

    async fn run(mut self, mut jobs: mpsc::Receiver<Job>, cancel: CancellationToken) {
        tracing::debug!(
            session_id = %self.session_id,
            model = self.model.name(),
            tools = self.tools.len(),
            "Dialogue engine started"
        );
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(session_id = %self.session_id, "Dialogue turn cancelled");
                    break;
                }
                _ = self.process(job) => {}
            }
        }
        tracing::debug!(session_id = %self.session_id, "Dialogue engine stopped");
    }

    async fn process(&mut self, job: Job) {
        let Job {
            turn,
            utterance,
            replies,
        } = job;
        tracing::info!(
            session_id = %self.session_id,
            turn,
            seq = utterance.seq,
            text = %utterance.text,
            "Dialogue turn started"
        );

        self.transcript.push_user(utterance.text);
        let text = match self.generate(turn, &replies).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(
                    session_id = %self.session_id,
                    turn,
                    error = %e,
                    "Dialogue turn failed, sending fallback reply"
                );
                self.config.fallback_reply.clone()
            }
        };

        let spoken = strip_markdown(&text);
        self.transcript.push_assistant(text);
        tracing::info!(
            session_id = %self.session_id,
            turn,
            transcript_len = self.transcript.len(),
            "Dialogue turn finished"
        );

        self.busy.store(false, Ordering::Release);
        let _ = replies
            .send(Reply {
                text: spoken,
                turn,
                is_final: true,
            })
            .await;
    }

    /// Drive the model until it answers in plain text.
    async fn generate(&mut self, turn: u64, replies: &mpsc::Sender<Reply>) -> anyhow::Result<String> {
        let specs = self.tools.specs();
        let mut rounds = 0u32;
        loop {
            let note = datetime_note(Utc::now(), self.timezone);
            let turns = render_turns(&self.transcript, &note);
            let output = self.collect_output(&turns, &specs).await?;

            if output.tool_calls.is_empty() {
                if output.text.trim().is_empty() {
                    anyhow::bail!("model returned an empty reply");
                }
                return Ok(output.text);
            }
            if !output.text.trim().is_empty() {
                tracing::debug!(
                    session_id = %self.session_id,
                    "Discarding text streamed alongside tool calls"
                );
            }
            if rounds >= self.config.max_tool_rounds {
                anyhow::bail!(
                    "model still requesting tools after {} rounds",
                    self.config.max_tool_rounds
                );
            }
            rounds += 1;

            for call in output.tool_calls {
                self.run_tool(turn, call, replies).await?;
            }
        }
    }

    async fn collect_output(&self, turns: &[Turn], specs: &[ToolSpec]) -> anyhow::Result<ModelOutput> {
        let mut stream = self.model.stream(turns, specs).await?;
        let idle = self.config.idle_timeout();
        let mut output = ModelOutput::default();

        loop {
            let next = tokio::time::timeout(idle, stream.next())
                .await
                .map_err(|_| anyhow::anyhow!("model stream idle for {}s", idle.as_secs()))?;
            let Some(delta) = next else { break };
            match delta? {
                ModelDelta::Text(text) => output.text.push_str(&text),
                ModelDelta::ToolCall {
                    id,
                    name,
                    arguments,
                } => output.tool_calls.push(PendingCall {
                    id,
                    name,
                    arguments,
                }),
                ModelDelta::Finish(FinishReason::Length) => {
                    tracing::warn!(session_id = %self.session_id, "Model output truncated at length limit");
                }
                ModelDelta::Finish(reason) => {
                    tracing::debug!(session_id = %self.session_id, ?reason, "Model output finished");
                }
            }
        }
        Ok(output)
    }

    /// Acknowledge, invoke, and record one tool call.
    async fn run_tool(
        &mut self,
        turn: u64,
        call: PendingCall,
        replies: &mpsc::Sender<Reply>,
    ) -> anyhow::Result<()> {
        let tool = self
            .tools
            .get(&call.name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("model called unknown tool: {}", call.name))?;
        let arguments = parse_tool_arguments(&call.arguments)?;

        let ack = tool
            .spec()
            .say
            .clone()
            .unwrap_or_else(|| self.config.default_ack.clone());
        let _ = replies
            .send(Reply {
                text: strip_markdown(&ack),
                turn,
                is_final: false,
            })
            .await;

        tracing::info!(session_id = %self.session_id, turn, tool = %call.name, "Invoking tool");
        let result = tool.call(&arguments).await?;

        let id = if call.id.is_empty() {
            format!("call_{}", uuid::Uuid::new_v4().simple())
        } else {
            call.id
        };
        self.transcript.push_tool_exchange(
            ToolCall {
                id,
                name: call.name,
                arguments,
            },
            result,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogue::model::DeltaStream;
    use crate::dialogue::tools::Tool;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Map, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    // ── Stubs ──────────────────────────────────────────────────────

    #[derive(Default)]
    struct ScriptedModel {
        script: Mutex<VecDeque<Result<Vec<ModelDelta>, String>>>,
        /// Served once the script runs out.
        otherwise: Vec<ModelDelta>,
        calls: AtomicUsize,
        seen: Mutex<Vec<Vec<Turn>>>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedModel {
        fn new(script: Vec<Result<Vec<ModelDelta>, String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream(&self, turns: &[Turn], _tools: &[ToolSpec]) -> anyhow::Result<DeltaStream> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(turns.to_vec());
            let next = self.script.lock().pop_front();
            let deltas = match next {
                Some(Ok(deltas)) => deltas,
                Some(Err(message)) => anyhow::bail!(message),
                None => self.otherwise.clone(),
            };
            Ok(futures_util::stream::iter(deltas.into_iter().map(Ok)).boxed())
        }
    }

    struct StaticTool {
        spec: ToolSpec,
        result: Result<Value, String>,
        calls: AtomicUsize,
        seen: Mutex<Vec<Map<String, Value>>>,
    }

    impl StaticTool {
        fn new(name: &str, say: Option<&str>, result: Result<Value, String>) -> Self {
            Self {
                spec: ToolSpec {
                    name: name.into(),
                    description: format!("{name} stub"),
                    parameters: json!({"type": "object"}),
                    returns: None,
                    say: say.map(str::to_string),
                },
                result,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Tool for StaticTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }

        async fn call(&self, arguments: &Map<String, Value>) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(arguments.clone());
            self.result.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    /// Tool whose call never completes.
    struct StalledTool {
        spec: ToolSpec,
        entered: Notify,
    }

    #[async_trait]
    impl Tool for StalledTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }

        async fn call(&self, _arguments: &Map<String, Value>) -> anyhow::Result<Value> {
            self.entered.notify_one();
            std::future::pending().await
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn text(t: &str) -> Vec<ModelDelta> {
        vec![
            ModelDelta::Text(t.into()),
            ModelDelta::Finish(FinishReason::Stop),
        ]
    }

    fn tool_call(id: &str, name: &str, arguments: &str) -> Vec<ModelDelta> {
        vec![
            ModelDelta::ToolCall {
                id: id.into(),
                name: name.into(),
                arguments: arguments.into(),
            },
            ModelDelta::Finish(FinishReason::ToolCalls),
        ]
    }

    fn utterance(text: &str) -> Utterance {
        Utterance {
            text: text.into(),
            seq: 1,
            timestamp: Utc::now(),
        }
    }

    fn build_engine(model: Arc<dyn LanguageModel>, tools: ToolRegistry, config: DialogueConfig) -> DialogueEngine {
        DialogueEngine::new(
            model,
            Arc::new(tools),
            config,
            &CallContext {
                session_id: "test".into(),
                ..CallContext::default()
            },
            Arc::new(AtomicBool::new(true)),
        )
    }

    async fn run_turn(engine: &mut DialogueEngine, text: &str) -> Vec<Reply> {
        let (replies, mut rx) = mpsc::channel(REPLY_BUFFER);
        engine
            .process(Job {
                turn: 1,
                utterance: utterance(text),
                replies,
            })
            .await;
        let mut out = Vec::new();
        while let Some(reply) = rx.recv().await {
            out.push(reply);
        }
        out
    }

    // ── Tests ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn plain_answer_appends_user_and_assistant() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(text(
            "We have Cardiology and Neurology.",
        ))]));
        let mut engine = build_engine(model, ToolRegistry::new(), DialogueConfig::default());
        let before = engine.transcript.len();

        let replies = run_turn(&mut engine, "what departments do you have").await;

        assert_eq!(
            replies,
            vec![Reply {
                text: "We have Cardiology and Neurology.".into(),
                turn: 1,
                is_final: true,
            }]
        );
        assert_eq!(engine.transcript.len(), before + 2);
        let turns = engine.transcript.turns();
        assert_eq!(turns[before], Turn::User("what departments do you have".into()));
        assert_eq!(
            turns[before + 1],
            Turn::Assistant("We have Cardiology and Neurology.".into())
        );
        assert!(!engine.busy.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tool_call_is_acknowledged_and_recorded() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(tool_call(
                "call_1",
                "checkAvailability",
                r#"{"doctor":"Dr. Lee","slots":[{"dateTime":"2024-08-06T10:00:00","duration":30}]}"#,
            )),
            Ok(text("That slot isn't free.")),
        ]));
        let tool = Arc::new(StaticTool::new(
            "checkAvailability",
            Some("Umm..."),
            Ok(json!({"available": false})),
        ));
        let mut tools = ToolRegistry::new();
        tools.register(tool.clone()).unwrap();
        let mut engine = build_engine(model.clone(), tools, DialogueConfig::default());
        let before = engine.transcript.len();

        let replies = run_turn(&mut engine, "is Dr. Lee free at 10?").await;

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].text, "Umm...");
        assert!(!replies[0].is_final);
        assert_eq!(replies[1].text, "That slot isn't free.");
        assert!(replies[1].is_final);

        let turns = &engine.transcript.turns()[before..];
        assert_eq!(turns.len(), 4);
        assert!(matches!(&turns[0], Turn::User(_)));
        assert!(matches!(
            &turns[1],
            Turn::ToolInvocation(call) if call.id == "call_1" && call.arguments["doctor"] == "Dr. Lee"
        ));
        assert!(matches!(
            &turns[2],
            Turn::ToolResult { call_id, result, .. } if call_id == "call_1" && *result == json!({"available": false})
        ));
        assert_eq!(turns[3], Turn::Assistant("That slot isn't free.".into()));

        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        // The second model call saw the tool result.
        let seen = model.seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[1].last(), Some(Turn::ToolResult { .. })));
    }

    #[tokio::test]
    async fn concatenated_arguments_reach_tool_merged() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(tool_call(
                "call_1",
                "checkAvailability",
                r#"{"slots":[{"dateTime":"a"}]}{"slots":[{"dateTime":"b"}],"doctor":"Dr. Lee"}"#,
            )),
            Ok(text("Both are free.")),
        ]));
        let tool = Arc::new(StaticTool::new("checkAvailability", None, Ok(json!({}))));
        let mut tools = ToolRegistry::new();
        tools.register(tool.clone()).unwrap();
        let mut engine = build_engine(model, tools, DialogueConfig::default());

        let replies = run_turn(&mut engine, "check both").await;

        assert_eq!(replies[0].text, DialogueConfig::default().default_ack);
        let seen = tool.seen.lock();
        assert_eq!(seen[0]["slots"].as_array().map(Vec::len), Some(2));
        assert_eq!(seen[0]["doctor"], "Dr. Lee");
    }

    #[tokio::test]
    async fn tool_rounds_terminate_with_text() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(tool_call("c1", "recommendDoctor", r#"{"department":"Cardiology"}"#)),
            Ok(tool_call("c2", "recommendDoctor", r#"{"department":"Neurology"}"#)),
            Ok(text("Dr. Lee can see you.")),
        ]));
        let tool = Arc::new(StaticTool::new("recommendDoctor", Some("Umm..."), Ok(json!({"doctor": "Dr. Lee"}))));
        let mut tools = ToolRegistry::new();
        tools.register(tool.clone()).unwrap();
        let mut engine = build_engine(model, tools, DialogueConfig::default());

        let replies = run_turn(&mut engine, "I need a heart doctor").await;
        let finals: Vec<_> = replies.iter().filter(|r| r.is_final).collect();
        assert_eq!(replies.len(), 3);
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].text, "Dr. Lee can see you.");
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn endless_tool_calls_end_in_fallback() {
        let model = Arc::new(ScriptedModel {
            otherwise: tool_call("again", "recommendDoctor", "{}"),
            ..ScriptedModel::default()
        });
        let tool = Arc::new(StaticTool::new("recommendDoctor", None, Ok(json!({}))));
        let mut tools = ToolRegistry::new();
        tools.register(tool.clone()).unwrap();
        let config = DialogueConfig {
            max_tool_rounds: 3,
            ..DialogueConfig::default()
        };
        let fallback = config.fallback_reply.clone();
        let mut engine = build_engine(model.clone(), tools, config);

        let replies = run_turn(&mut engine, "loop forever").await;

        assert_eq!(tool.calls.load(Ordering::SeqCst), 3);
        assert_eq!(model.calls.load(Ordering::SeqCst), 4);
        let last = replies.last().unwrap();
        assert!(last.is_final);
        assert_eq!(last.text, fallback);
        assert_eq!(replies.iter().filter(|r| r.is_final).count(), 1);
    }

    #[tokio::test]
    async fn model_error_yields_single_fallback_reply() {
        let model = Arc::new(ScriptedModel::new(vec![Err("upstream 500".into())]));
        let mut engine = build_engine(model, ToolRegistry::new(), DialogueConfig::default());
        let before = engine.transcript.len();

        let replies = run_turn(&mut engine, "hello").await;

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].text, DialogueConfig::default().fallback_reply);
        assert!(replies[0].is_final);
        assert_eq!(engine.transcript.len(), before + 2);
    }

    #[tokio::test]
    async fn failing_or_unknown_tool_records_no_invocation() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(tool_call("c1", "bookMeeting", "{}"))]));
        let tool = Arc::new(StaticTool::new("bookMeeting", Some("Booking."), Err("calendar down".into())));
        let mut tools = ToolRegistry::new();
        tools.register(tool).unwrap();
        let mut engine = build_engine(model, tools, DialogueConfig::default());
        let before = engine.transcript.len();

        let replies = run_turn(&mut engine, "book it").await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[1].text, DialogueConfig::default().fallback_reply);
        assert!(!engine
            .transcript
            .turns()
            .iter()
            .any(|t| matches!(t, Turn::ToolInvocation(_))));
        assert_eq!(engine.transcript.len(), before + 2);

        let model = Arc::new(ScriptedModel::new(vec![Ok(tool_call("c1", "cancelMeeting", "{}"))]));
        let mut engine = engine_without_tools(model);
        let replies = run_turn(&mut engine, "cancel it").await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].text, DialogueConfig::default().fallback_reply);
    }

    fn engine_without_tools(model: Arc<dyn LanguageModel>) -> DialogueEngine {
        build_engine(model, ToolRegistry::new(), DialogueConfig::default())
    }

    #[tokio::test]
    async fn markdown_is_stripped_from_spoken_text_only() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(text("**Dr. Lee** is free."))]));
        let mut engine = engine_without_tools(model);
        let replies = run_turn(&mut engine, "who is free").await;
        assert_eq!(replies[0].text, "Dr. Lee is free.");
        assert_eq!(
            engine.transcript.turns().last(),
            Some(&Turn::Assistant("**Dr. Lee** is free.".into()))
        );
    }

    #[tokio::test]
    async fn transcript_starts_with_prompt_greeting_and_call_notes() {
        let config = DialogueConfig::default();
        let engine = DialogueEngine::new(
            Arc::new(ScriptedModel::default()),
            Arc::new(ToolRegistry::new()),
            config.clone(),
            &CallContext {
                session_id: "s".into(),
                call_sid: Some("CA1".into()),
                caller: Some("+971500000000".into()),
            },
            Arc::new(AtomicBool::new(false)),
        );
        let turns = engine.transcript.turns();
        assert_eq!(turns[0], Turn::System(config.system_prompt.clone()));
        assert_eq!(turns[1], Turn::Assistant(config.greeting.clone()));
        assert_eq!(turns[2], Turn::System("callSid: CA1".into()));
        assert!(matches!(&turns[3], Turn::System(t) if t.contains("+971500000000")));
    }

    #[tokio::test]
    async fn model_sees_current_datetime_note() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(text("Today is Tuesday."))]));
        let mut engine = build_engine(model.clone(), ToolRegistry::new(), DialogueConfig::default());
        run_turn(&mut engine, "what day is it").await;

        let seen = model.seen.lock();
        assert!(matches!(&seen[0][0], Turn::System(t) if t.contains("\n\ncurrent_datetime: ")));
        assert!(matches!(&engine.transcript.turns()[0], Turn::System(t) if !t.contains("current_datetime: 2")));
    }

    #[tokio::test]
    async fn second_submit_while_busy_is_rejected() {
        let gate = Arc::new(Notify::new());
        let model = Arc::new(ScriptedModel {
            gate: Some(gate.clone()),
            ..ScriptedModel::new(vec![Ok(text("First.")), Ok(text("Second."))])
        });
        let cancel = CancellationToken::new();
        let handle = DialogueEngine::spawn(
            model.clone(),
            Arc::new(ToolRegistry::new()),
            DialogueConfig::default(),
            CallContext::default(),
            cancel.clone(),
        );

        let mut first = handle.submit(utterance("one")).unwrap();
        assert!(handle.is_busy());
        assert_eq!(handle.submit(utterance("two")).unwrap_err(), SubmitError::Busy);

        gate.notify_one();
        let reply = first.recv().await.unwrap();
        assert_eq!(reply.text, "First.");
        assert_eq!(reply.turn, 1);
        assert!(first.recv().await.is_none());
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);

        let mut second = handle.submit(utterance("three")).unwrap();
        gate.notify_one();
        let reply = second.recv().await.unwrap();
        assert_eq!(reply.text, "Second.");
        assert_eq!(reply.turn, 2);

        cancel.cancel();
    }

    #[tokio::test]
    async fn submit_after_cancel_reports_stopped() {
        let cancel = CancellationToken::new();
        let handle = DialogueEngine::spawn(
            Arc::new(ScriptedModel::default()),
            Arc::new(ToolRegistry::new()),
            DialogueConfig::default(),
            CallContext::default(),
            cancel.clone(),
        );
        cancel.cancel();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.submit(utterance("hello")).unwrap_err(), SubmitError::Stopped);
    }

    #[tokio::test]
    async fn empty_greeting_leaves_no_assistant_turn() {
        let config = DialogueConfig {
            greeting: "  ".into(),
            ..DialogueConfig::default()
        };
        let engine = build_engine(Arc::new(ScriptedModel::default()), ToolRegistry::new(), config);
        let turns = engine.transcript.turns();
        assert_eq!(turns.len(), 1);
        assert!(matches!(&turns[0], Turn::System(_)));
    }

    #[tokio::test]
    async fn cancel_drops_in_flight_model_call() {
        // The gate is never opened, so the model call hangs.
        let model = Arc::new(ScriptedModel {
            gate: Some(Arc::new(Notify::new())),
            ..ScriptedModel::new(vec![Ok(text("Too late."))])
        });
        let cancel = CancellationToken::new();
        let handle = DialogueEngine::spawn(
            model.clone(),
            Arc::new(ToolRegistry::new()),
            DialogueConfig::default(),
            CallContext::default(),
            cancel.clone(),
        );

        let mut replies = handle.submit(utterance("hello")).unwrap();
        tokio::task::yield_now().await;
        cancel.cancel();

        let next = tokio::time::timeout(Duration::from_secs(5), replies.recv())
            .await
            .expect("reply channel should close");
        assert!(next.is_none());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_drops_in_flight_tool_call() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(tool_call("call_1", "bookMeeting", "{}")),
            Ok(text("Booked.")),
        ]));
        let tool = Arc::new(StalledTool {
            spec: ToolSpec {
                name: "bookMeeting".into(),
                description: "stalls".into(),
                parameters: json!({"type": "object"}),
                returns: None,
                say: Some("Booking now.".into()),
            },
            entered: Notify::new(),
        });
        let mut tools = ToolRegistry::new();
        tools.register(tool.clone()).unwrap();
        let cancel = CancellationToken::new();
        let handle = DialogueEngine::spawn(
            model.clone(),
            Arc::new(tools),
            DialogueConfig::default(),
            CallContext::default(),
            cancel.clone(),
        );

        let mut replies = handle.submit(utterance("book me in")).unwrap();
        let ack = replies.recv().await.unwrap();
        assert_eq!(ack.text, "Booking now.");
        assert!(!ack.is_final);
        tool.entered.notified().await;
        cancel.cancel();

        let next = tokio::time::timeout(Duration::from_secs(5), replies.recv())
            .await
            .expect("reply channel should close");
        assert!(next.is_none());
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }
}
