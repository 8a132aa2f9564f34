//! ConversationLoop — bounded generate → segment → dispatch rounds.
//!
//! Each round streams one model call through a [`SegmenterChain`], forwards
//! pass-through text to the caller as it arrives, and collects tool payloads.
//! A round without tool payloads answers the request. Otherwise the payloads
//! are dispatched in source order and their results reshape the
//! conversation for the next round, until a terminal result or the round
//! bound ends the turn.
//!
//! The caller receives [`LoopEvent`]s over an `mpsc` channel. Dropping the
//! receiver cancels the turn: the loop notices at the next forward, round
//! start or tool dispatch, stops pulling from the model, schedules no further
//! rounds and submits no maintenance work.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::conversation::ConversationState;
use super::dispatcher::{ToolContext, ToolDispatcher, ToolResult};
use super::segmenter::{GrammarKind, SegmentEvent, SegmenterChain};
use super::voice::{strip_markdown, VoiceBuffer, VoiceSynthesizer};
use crate::config::{Persona, RuntimeConfig};
use crate::inference::client::{static_fallback_response, ModelClient};
use crate::inference::errors::InferenceError;
use crate::inference::types::{ChatMessage, ModelRequest};
use crate::maintenance::queue::WorkKey;
use crate::maintenance::scheduler::{MaintenanceScheduler, Transcript};

// ─── Public Types ────────────────────────────────────────────────────────────

/// What the caller sees, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    /// Visible answer text.
    Content(String),
    /// An audio file for a chunk of the answer is ready.
    VoiceReady(String),
    /// Side-channel notice (tool progress, malformed calls).
    SystemNotice(String),
    /// Reasoning text, only when `keep_reasoning` is set.
    Reasoning(String),
    /// Final conversation state for the caller to persist.
    History(Vec<ChatMessage>),
    End,
}

/// Input for one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub identity: String,
    pub persona: String,
    pub query: String,
    pub history: Vec<ChatMessage>,
    /// Memory summary to inject; recalled from the scheduler when `None`.
    pub memory: Option<String>,
    /// Tool instructions; rendered from the registry when `None`.
    pub tool_catalogue: Option<String>,
}

impl TurnRequest {
    pub fn new(identity: &str, persona: &str, query: &str) -> Self {
        Self {
            identity: identity.to_string(),
            persona: persona.to_string(),
            query: query.to_string(),
            ..Self::default()
        }
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_memory(mut self, memory: &str) -> Self {
        self.memory = Some(memory.to_string());
        self
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// A round produced no tool calls.
    Answered,
    /// A tool returned `End` or `Feedback`.
    Ended,
    /// The round bound was reached; the filler was appended.
    Exhausted,
    /// The model could not be called or the persona could not be resolved.
    Failed,
    /// The event receiver was dropped.
    Cancelled,
}

/// Summary returned by [`ConversationLoop::run`].
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    pub rounds: usize,
    /// Every `Content` text forwarded, concatenated.
    pub output: String,
    pub messages: Vec<ChatMessage>,
}

// ─── Forwarder ───────────────────────────────────────────────────────────────

/// Event sender that records visible output and detects cancellation.
struct Forwarder {
    events: mpsc::Sender<LoopEvent>,
    output: String,
    cancelled: bool,
}

impl Forwarder {
    fn new(events: mpsc::Sender<LoopEvent>) -> Self {
        Self {
            events,
            output: String::new(),
            cancelled: false,
        }
    }

    /// Returns `false` once the receiver is gone.
    async fn send(&mut self, event: LoopEvent) -> bool {
        if self.cancelled {
            return false;
        }
        if self.events.send(event).await.is_err() {
            self.cancelled = true;
        }
        !self.cancelled
    }

    async fn content(&mut self, text: &str) -> bool {
        if text.is_empty() {
            return !self.cancelled;
        }
        let sent = self.send(LoopEvent::Content(text.to_string())).await;
        if sent {
            self.output.push_str(text);
        }
        sent
    }

    async fn notice(&mut self, text: String) -> bool {
        self.send(LoopEvent::SystemNotice(text)).await
    }

    /// Whether the receiver is gone, without sending anything.
    fn is_closed(&mut self) -> bool {
        if self.events.is_closed() {
            self.cancelled = true;
        }
        self.cancelled
    }
}

// ─── ConversationLoop ────────────────────────────────────────────────────────

/// Drives one request through bounded model/tool rounds.
pub struct ConversationLoop {
    model: Arc<dyn ModelClient>,
    dispatcher: ToolDispatcher,
    config: Arc<RuntimeConfig>,
    voice: Option<Arc<dyn VoiceSynthesizer>>,
    scheduler: Option<MaintenanceScheduler>,
}

impl ConversationLoop {
    pub fn new(
        model: Arc<dyn ModelClient>,
        dispatcher: ToolDispatcher,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            model,
            dispatcher,
            config,
            voice: None,
            scheduler: None,
        }
    }

    pub fn with_voice(mut self, voice: Arc<dyn VoiceSynthesizer>) -> Self {
        self.voice = Some(voice);
        self
    }

    pub fn with_scheduler(mut self, scheduler: MaintenanceScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Run one turn, streaming events to `events`.
    pub async fn run(&self, request: TurnRequest, events: mpsc::Sender<LoopEvent>) -> TurnOutcome {
        let turn_id = Uuid::new_v4();
        let settings = &self.config.conversation;
        let mut out = Forwarder::new(events);

        let persona = match self.config.persona(&request.persona) {
            Ok(persona) => persona,
            Err(e) => {
                tracing::warn!(turn = %turn_id, persona = %request.persona, error = %e, "persona unavailable");
                return self.fail(out, e.to_string(), Vec::new()).await;
            }
        };
        let template_chain = match SegmenterChain::new(&settings.grammars) {
            Ok(chain) => chain,
            Err(e) => {
                tracing::warn!(turn = %turn_id, error = %e, "invalid delimiter grammars");
                return self.fail(out, e.to_string(), Vec::new()).await;
            }
        };

        let key = WorkKey::new(request.identity.as_str(), persona.name.as_str());
        let memory = request.memory.clone().or_else(|| {
            self.scheduler
                .as_ref()
                .and_then(|scheduler| scheduler.recall(&key))
        });
        let catalogue = request.tool_catalogue.clone().unwrap_or_else(|| {
            settings
                .tool_grammar()
                .map(|grammar| self.dispatcher.registry().catalogue(grammar))
                .unwrap_or_default()
        });
        let system = compose_system_content(&persona, memory.as_deref(), &catalogue);

        let ctx = ToolContext {
            identity: request.identity.clone(),
            persona: persona.name.clone(),
            query: request.query.clone(),
        };
        let mut state = ConversationState::new(request.history, &request.query);
        let mut voice_tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut status = TurnStatus::Exhausted;
        let mut rounds = 0;

        tracing::info!(
            turn = %turn_id,
            identity = %ctx.identity,
            persona = %ctx.persona,
            max_rounds = settings.max_rounds,
            "=== TURN START ==="
        );

        'rounds: for round in 0..settings.max_rounds {
            if out.is_closed() {
                status = TurnStatus::Cancelled;
                break;
            }
            rounds = round + 1;
            state.set_system(&system);

            tracing::info!(
                turn = %turn_id,
                round = round,
                message_count = state.len(),
                "=== CONVERSATION ROUND START ==="
            );

            let model_request = ModelRequest {
                model: persona.model.clone(),
                messages: state.messages().to_vec(),
                temperature: persona.temperature,
            };
            let mut stream = match self.model.chat_completion_stream(model_request).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(turn = %turn_id, round = round, error = %e, "model unavailable");
                    status = if out.content(&static_fallback_response(&e)).await {
                        TurnStatus::Failed
                    } else {
                        TurnStatus::Cancelled
                    };
                    break;
                }
            };

            let mut chain = template_chain.clone();
            let mut voice = VoiceBuffer::new(settings.voice_min_chars);
            let mut visible = String::new();
            let mut payloads: Vec<String> = Vec::new();

            while let Some(item) = stream.next().await {
                let fragment = match item {
                    Ok(fragment) => fragment,
                    Err(e) => {
                        tracing::warn!(
                            turn = %turn_id,
                            round = round,
                            error = %e,
                            "stream error, treating as end of stream"
                        );
                        break;
                    }
                };

                for event in chain.feed(&fragment) {
                    match event {
                        SegmentEvent::PassThrough(text) => {
                            visible.push_str(&text);
                            if !out.content(&text).await {
                                status = TurnStatus::Cancelled;
                                break 'rounds;
                            }
                            if let Some(chunk) = voice.push(&text) {
                                self.spawn_synthesis(chunk, &persona, &out.events, &mut voice_tasks);
                            }
                        }
                        SegmentEvent::Captured {
                            kind: GrammarKind::Tool,
                            grammar,
                            content,
                        } => {
                            tracing::debug!(turn = %turn_id, grammar = %grammar, "tool payload captured");
                            payloads.push(content);
                        }
                        SegmentEvent::Captured {
                            kind: GrammarKind::Reasoning,
                            content,
                            ..
                        } => {
                            if settings.keep_reasoning
                                && !out.send(LoopEvent::Reasoning(content)).await
                            {
                                status = TurnStatus::Cancelled;
                                break 'rounds;
                            }
                        }
                    }
                }
            }
            drop(stream);

            let unterminated = chain.unterminated();
            if !unterminated.is_empty() {
                tracing::warn!(
                    turn = %turn_id,
                    grammars = ?unterminated,
                    "unterminated delimiter at end of stream, buffered text dropped"
                );
            }
            if let Some(rest) = voice.flush() {
                self.spawn_synthesis(rest, &persona, &out.events, &mut voice_tasks);
            }

            state.push_assistant(&visible);

            tracing::info!(
                turn = %turn_id,
                round = round,
                visible_len = visible.len(),
                tool_calls = payloads.len(),
                "=== MODEL RESPONSE ==="
            );

            if payloads.is_empty() {
                status = TurnStatus::Answered;
                break;
            }

            for payload in &payloads {
                if out.is_closed() {
                    status = TurnStatus::Cancelled;
                    break 'rounds;
                }
                let dispatched = match self.dispatcher.dispatch(payload, &ctx).await {
                    Ok(dispatched) => dispatched,
                    Err(e) => {
                        tracing::warn!(turn = %turn_id, error = %e, "rejected tool payload");
                        if !out.notice(e.to_string()).await {
                            status = TurnStatus::Cancelled;
                            break 'rounds;
                        }
                        continue;
                    }
                };

                for result in dispatched.results {
                    match result {
                        ToolResult::System(text) => {
                            if !out.notice(text).await {
                                status = TurnStatus::Cancelled;
                                break 'rounds;
                            }
                        }
                        ToolResult::Result(text) => {
                            state.apply_tool_result(&dispatched.invocation, &text);
                        }
                        ToolResult::End(text) => {
                            status = if out.content(&text).await {
                                TurnStatus::Ended
                            } else {
                                TurnStatus::Cancelled
                            };
                            break 'rounds;
                        }
                        ToolResult::Feedback { query, format } => {
                            let text = match self.feedback(&persona, &state, &query).await {
                                Ok(reply) => format(&reply),
                                Err(e) => {
                                    tracing::warn!(turn = %turn_id, error = %e, "feedback call failed");
                                    static_fallback_response(&e)
                                }
                            };
                            status = if out.content(&text).await {
                                TurnStatus::Ended
                            } else {
                                TurnStatus::Cancelled
                            };
                            break 'rounds;
                        }
                    }
                }
            }
        }

        if status == TurnStatus::Exhausted {
            tracing::info!(turn = %turn_id, rounds = rounds, "round bound reached");
            if !out.content(&settings.filler).await {
                status = TurnStatus::Cancelled;
            }
        }

        if status == TurnStatus::Cancelled {
            for task in voice_tasks {
                task.abort();
            }
            tracing::info!(turn = %turn_id, rounds = rounds, "turn cancelled by caller");
            return TurnOutcome {
                status,
                rounds,
                output: out.output,
                messages: state.into_messages(),
            };
        }

        for task in voice_tasks {
            if let Err(e) = task.await {
                tracing::warn!(turn = %turn_id, error = %e, "speech synthesis task failed");
            }
        }

        if status != TurnStatus::Failed {
            if let Some(scheduler) = &self.scheduler {
                scheduler.submit(
                    key,
                    Transcript {
                        query: ctx.query.clone(),
                        answer: out.output.clone(),
                    },
                );
            }
        }

        let messages = state.into_messages();
        out.send(LoopEvent::History(messages.clone())).await;
        out.send(LoopEvent::End).await;

        tracing::info!(
            turn = %turn_id,
            status = ?status,
            rounds = rounds,
            output_len = out.output.len(),
            "=== TURN COMPLETE ==="
        );

        TurnOutcome {
            status,
            rounds,
            output: out.output,
            messages,
        }
    }

    /// Non-streaming call for a `Feedback` result: the conversation minus its
    /// last turn, plus `query`.
    async fn feedback(
        &self,
        persona: &Persona,
        state: &ConversationState,
        query: &str,
    ) -> Result<String, InferenceError> {
        let mut messages = state.without_last();
        messages.push(ChatMessage::user(query));
        self.model
            .chat_completion(ModelRequest {
                model: persona.model.clone(),
                messages,
                temperature: persona.temperature,
            })
            .await
    }

    /// Hand a chunk to the synthesizer without blocking forwarding.
    fn spawn_synthesis(
        &self,
        text: String,
        persona: &Persona,
        events: &mpsc::Sender<LoopEvent>,
        tasks: &mut Vec<JoinHandle<()>>,
    ) {
        let (Some(synth), Some(voice)) = (&self.voice, &persona.voice) else {
            return;
        };
        let synth = Arc::clone(synth);
        let voice = voice.clone();
        let events = events.clone();

        tasks.push(tokio::spawn(async move {
            let speakable = strip_markdown(&text);
            match synth.synthesize(&speakable, &voice).await {
                Ok(file) => {
                    let _ = events.send(LoopEvent::VoiceReady(file)).await;
                }
                Err(e) => tracing::warn!(voice = %voice, error = %e, "speech synthesis failed"),
            }
        }));
    }

    async fn fail(&self, mut out: Forwarder, text: String, messages: Vec<ChatMessage>) -> TurnOutcome {
        let status = if out.content(&text).await {
            out.send(LoopEvent::End).await;
            TurnStatus::Failed
        } else {
            TurnStatus::Cancelled
        };
        TurnOutcome {
            status,
            rounds: 0,
            output: out.output,
            messages,
        }
    }
}

/// System prompt for every round: persona, remembered context, tools.
pub fn compose_system_content(persona: &Persona, memory: Option<&str>, catalogue: &str) -> String {
    let mut content = persona.system_content();
    if let Some(memory) = memory.filter(|m| !m.trim().is_empty()) {
        content.push_str("\n\nWhat you remember about the user from earlier conversations:\n");
        content.push_str(memory);
    }
    if !catalogue.is_empty() {
        content.push_str("\n\n");
        content.push_str(catalogue);
    }
    content
}

// ─── Tests ───────────────────────────────────────────────────────────────────
