// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent facade: owns the conversation state, enforces the
//! one-run-at-a-time invariant, mirrors loop events into an observable
//! [`AgentState`], and fans events out to subscribers.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tracing::warn;

use skein_ai::{
    now_ms, AbortHandle, AssistantMessage, ContentPart, Message, Model, StopReason,
    ThinkingBudgets, UserContent, UserMessage,
};

use crate::agent_loop::{agent_loop, agent_loop_continue, AgentEventStream};
use crate::types::{
    default_convert_to_llm, AgentContext, AgentError, AgentEvent, AgentLoopConfig, AgentMessage,
    AgentState, AgentStreamFn, AgentThinkingLevel, AgentTool, ApiKeyFn, ConvertToLlmFn,
    MessageSourceFn, QueueMode, TransformContextFn,
};

/// Listener invoked for every agent event during a run.
pub type ListenerFn = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

/// Prompt input accepted by [`Agent::prompt`].
pub enum PromptInput {
    Text(String),
    Message(Box<AgentMessage>),
    Messages(Vec<AgentMessage>),
}

impl From<&str> for PromptInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for PromptInput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<AgentMessage> for PromptInput {
    fn from(message: AgentMessage) -> Self {
        Self::Message(Box::new(message))
    }
}

impl From<Vec<AgentMessage>> for PromptInput {
    fn from(messages: Vec<AgentMessage>) -> Self {
        Self::Messages(messages)
    }
}

/// Construction options for [`Agent`].
#[derive(Default)]
pub struct AgentOptions {
    pub initial_state: Option<AgentState>,
    pub convert_to_llm: Option<ConvertToLlmFn>,
    pub transform_context: Option<TransformContextFn>,
    pub steering_mode: QueueMode,
    pub follow_up_mode: QueueMode,
    pub stream_fn: Option<AgentStreamFn>,
    pub session_id: Option<String>,
    pub get_api_key: Option<ApiKeyFn>,
    pub thinking_budgets: Option<ThinkingBudgets>,
    pub max_retry_delay_ms: Option<u64>,
}

struct AgentInner {
    state: Mutex<AgentState>,
    steering_queue: Mutex<VecDeque<AgentMessage>>,
    follow_up_queue: Mutex<VecDeque<AgentMessage>>,
    steering_mode: Mutex<QueueMode>,
    follow_up_mode: Mutex<QueueMode>,
    listeners: Mutex<Vec<(u64, ListenerFn)>>,
    next_listener_id: AtomicU64,
    abort: Mutex<Option<AbortHandle>>,
    streaming_tx: watch::Sender<bool>,
    convert_to_llm: ConvertToLlmFn,
    transform_context: Option<TransformContextFn>,
    get_api_key: Option<ApiKeyFn>,
    stream_fn: AgentStreamFn,
    session_id: Mutex<Option<String>>,
    thinking_budgets: Mutex<Option<ThinkingBudgets>>,
    max_retry_delay_ms: Mutex<Option<u64>>,
}

/// Unregisters a listener added with [`Agent::subscribe`].
pub struct Subscription {
    id: u64,
    inner: Weak<AgentInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.lock().unwrap().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Driver for LLM conversations: accepts prompts, queues steering and
/// follow-up input, and surfaces every loop event to subscribers.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(options: AgentOptions) -> Self {
        // The default transport dispatches through the registry.
        skein_ai::register_builtin_api_providers();

        let stream_fn = options.stream_fn.unwrap_or_else(default_stream_fn);
        let (streaming_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(AgentInner {
                state: Mutex::new(options.initial_state.unwrap_or_default()),
                steering_queue: Mutex::new(VecDeque::new()),
                follow_up_queue: Mutex::new(VecDeque::new()),
                steering_mode: Mutex::new(options.steering_mode),
                follow_up_mode: Mutex::new(options.follow_up_mode),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                abort: Mutex::new(None),
                streaming_tx,
                convert_to_llm: options.convert_to_llm.unwrap_or_else(default_convert_to_llm),
                transform_context: options.transform_context,
                get_api_key: options.get_api_key,
                stream_fn,
                session_id: Mutex::new(options.session_id),
                thinking_budgets: Mutex::new(options.thinking_budgets),
                max_retry_delay_ms: Mutex::new(options.max_retry_delay_ms),
            }),
        }
    }

    // ── State access and mutation ─────────────────────────────────────────────

    /// Snapshot of the current state.
    pub fn state(&self) -> AgentState {
        self.inner.state.lock().unwrap().clone()
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        self.inner.state.lock().unwrap().system_prompt = prompt.into();
    }

    pub fn set_model(&self, model: Model) {
        self.inner.state.lock().unwrap().model = Some(model);
    }

    pub fn set_thinking_level(&self, level: AgentThinkingLevel) {
        self.inner.state.lock().unwrap().thinking_level = level;
    }

    pub fn set_tools(&self, tools: Vec<AgentTool>) {
        self.inner.state.lock().unwrap().tools = tools;
    }

    pub fn replace_messages(&self, messages: Vec<AgentMessage>) {
        self.inner.state.lock().unwrap().messages = messages;
    }

    pub fn append_message(&self, message: AgentMessage) {
        self.inner.state.lock().unwrap().messages.push(message);
    }

    pub fn clear_messages(&self) {
        self.inner.state.lock().unwrap().messages.clear();
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().unwrap().clone()
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        *self.inner.session_id.lock().unwrap() = session_id;
    }

    pub fn thinking_budgets(&self) -> Option<ThinkingBudgets> {
        self.inner.thinking_budgets.lock().unwrap().clone()
    }

    pub fn set_thinking_budgets(&self, budgets: Option<ThinkingBudgets>) {
        *self.inner.thinking_budgets.lock().unwrap() = budgets;
    }

    pub fn max_retry_delay_ms(&self) -> Option<u64> {
        *self.inner.max_retry_delay_ms.lock().unwrap()
    }

    pub fn set_max_retry_delay_ms(&self, delay: Option<u64>) {
        *self.inner.max_retry_delay_ms.lock().unwrap() = delay;
    }

    pub fn steering_mode(&self) -> QueueMode {
        *self.inner.steering_mode.lock().unwrap()
    }

    pub fn set_steering_mode(&self, mode: QueueMode) {
        *self.inner.steering_mode.lock().unwrap() = mode;
    }

    pub fn follow_up_mode(&self) -> QueueMode {
        *self.inner.follow_up_mode.lock().unwrap()
    }

    pub fn set_follow_up_mode(&self, mode: QueueMode) {
        *self.inner.follow_up_mode.lock().unwrap() = mode;
    }

    // ── Queues ────────────────────────────────────────────────────────────────

    /// Queue a message to interrupt the run at the next safe boundary.
    pub fn steer(&self, message: AgentMessage) {
        self.inner.steering_queue.lock().unwrap().push_back(message);
    }

    /// Queue a message to be processed after the run would otherwise end.
    pub fn follow_up(&self, message: AgentMessage) {
        self.inner.follow_up_queue.lock().unwrap().push_back(message);
    }

    pub fn clear_steering_queue(&self) {
        self.inner.steering_queue.lock().unwrap().clear();
    }

    pub fn clear_follow_up_queue(&self) {
        self.inner.follow_up_queue.lock().unwrap().clear();
    }

    pub fn clear_all_queues(&self) {
        self.clear_steering_queue();
        self.clear_follow_up_queue();
    }

    // ── Listeners ─────────────────────────────────────────────────────────────

    /// Register a listener for agent events.  A listener that panics is
    /// logged and skipped; it never disturbs dispatch to the others.
    pub fn subscribe(&self, listener: ListenerFn) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().unwrap().push((id, listener));
        Subscription { id, inner: Arc::downgrade(&self.inner) }
    }

    fn emit(&self, event: &AgentEvent) {
        let listeners: Vec<ListenerFn> = {
            let guard = self.inner.listeners.lock().unwrap();
            guard.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("agent event listener panicked; continuing dispatch");
            }
        }
    }

    // ── Run control ───────────────────────────────────────────────────────────

    /// Signal the in-flight run to stop.  Idempotent; a no-op when idle.
    pub fn abort(&self) {
        if let Some(handle) = self.inner.abort.lock().unwrap().as_ref() {
            handle.abort();
        }
    }

    /// Resolve once no run is active.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.inner.streaming_tx.subscribe();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Clear messages, queues and error state.  Ignored while streaming.
    pub fn reset(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.is_streaming {
                return;
            }
            state.messages.clear();
            state.stream_message = None;
            state.pending_tool_calls.clear();
            state.error = None;
        }
        self.clear_all_queues();
    }

    /// Send a prompt and drive the run to completion.
    pub async fn prompt(&self, input: impl Into<PromptInput>) -> Result<(), AgentError> {
        self.prompt_with_images(input, Vec::new()).await
    }

    /// Like [`prompt`](Self::prompt), attaching images to a text input.
    pub async fn prompt_with_images(
        &self,
        input: impl Into<PromptInput>,
        images: Vec<ContentPart>,
    ) -> Result<(), AgentError> {
        {
            let state = self.inner.state.lock().unwrap();
            if state.is_streaming {
                return Err(AgentError::AlreadyStreaming);
            }
            if state.model.is_none() {
                return Err(AgentError::NoModel);
            }
        }

        let messages = match input.into() {
            PromptInput::Text(text) => {
                let mut content = vec![ContentPart::text(text)];
                content.extend(images);
                vec![Message::User(UserMessage {
                    content: UserContent::Parts(content),
                    timestamp: now_ms(),
                })]
            }
            PromptInput::Message(message) => vec![*message],
            PromptInput::Messages(messages) => messages,
        };

        self.run(Some(messages)).await
    }

    /// Re-enter the loop on the existing history, without a new message.
    /// The retry path after external compaction repaired an overflow; an
    /// errored or aborted assistant tail is accepted as non-final.
    pub async fn continue_run(&self) -> Result<(), AgentError> {
        {
            let state = self.inner.state.lock().unwrap();
            if state.is_streaming {
                return Err(AgentError::AlreadyStreaming);
            }
            if state.model.is_none() {
                return Err(AgentError::NoModel);
            }
            if state.messages.is_empty() {
                return Err(AgentError::EmptyHistory);
            }
            if let Some(Message::Assistant(assistant)) = state.messages.last() {
                if !matches!(assistant.stop_reason, StopReason::Error | StopReason::Aborted) {
                    return Err(AgentError::LastMessageIsAssistant);
                }
            }
        }
        self.run(None).await
    }

    async fn run(&self, messages: Option<Vec<AgentMessage>>) -> Result<(), AgentError> {
        let (abort_handle, abort_signal) = AbortHandle::new();
        let (model, context, reasoning) = {
            let mut state = self.inner.state.lock().unwrap();
            // Check-and-set under one lock so racing prompts cannot both
            // start a run.
            if state.is_streaming {
                return Err(AgentError::AlreadyStreaming);
            }
            let model = state.model.clone().ok_or(AgentError::NoModel)?;
            state.is_streaming = true;
            state.stream_message = None;
            state.error = None;
            let context = AgentContext {
                system_prompt: state.system_prompt.clone(),
                messages: state.messages.clone(),
                tools: state.tools.clone(),
            };
            (model, context, state.thinking_level.reasoning())
        };
        *self.inner.abort.lock().unwrap() = Some(abort_handle);
        let _ = self.inner.streaming_tx.send(true);

        let config = AgentLoopConfig {
            reasoning,
            session_id: self.session_id(),
            thinking_budgets: self.thinking_budgets(),
            max_retry_delay_ms: self.max_retry_delay_ms(),
            convert_to_llm: Arc::clone(&self.inner.convert_to_llm),
            transform_context: self.inner.transform_context.clone(),
            get_api_key: self.inner.get_api_key.clone(),
            get_steering_messages: Some(self.steering_source()),
            get_follow_up_messages: Some(self.follow_up_source()),
            ..AgentLoopConfig::new(model.clone())
        };

        let stream = match messages {
            Some(messages) => Ok(agent_loop(
                messages,
                context,
                config,
                Some(abort_signal.clone()),
                Arc::clone(&self.inner.stream_fn),
            )),
            None => agent_loop_continue(
                context,
                config,
                Some(abort_signal.clone()),
                Arc::clone(&self.inner.stream_fn),
            ),
        };

        let result = match stream {
            Ok(stream) => {
                self.consume_events(stream, &model, &abort_signal).await;
                Ok(())
            }
            Err(error) => Err(error),
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            state.is_streaming = false;
            state.stream_message = None;
            state.pending_tool_calls.clear();
        }
        *self.inner.abort.lock().unwrap() = None;
        let _ = self.inner.streaming_tx.send(false);

        result
    }

    /// Mirror loop events into the state and fan them out.  If the loop
    /// dies without `agent_end` (task panic, dropped stream), synthesize a
    /// terminal error so observers always see termination.
    async fn consume_events(
        &self,
        mut stream: AgentEventStream,
        model: &Model,
        abort_signal: &skein_ai::AbortSignal,
    ) {
        let mut partial: Option<AgentMessage> = None;
        let mut saw_agent_end = false;

        while let Some(event) = stream.next().await {
            match &event {
                AgentEvent::MessageStart { message } | AgentEvent::MessageUpdate { message, .. } => {
                    partial = Some(message.clone());
                    self.inner.state.lock().unwrap().stream_message = Some(message.clone());
                }
                AgentEvent::MessageEnd { message } => {
                    partial = None;
                    let mut state = self.inner.state.lock().unwrap();
                    state.stream_message = None;
                    state.messages.push(message.clone());
                }
                AgentEvent::ToolExecutionStart { tool_call_id, .. } => {
                    self.inner
                        .state
                        .lock()
                        .unwrap()
                        .pending_tool_calls
                        .insert(tool_call_id.clone());
                }
                AgentEvent::ToolExecutionEnd { tool_call_id, .. } => {
                    self.inner
                        .state
                        .lock()
                        .unwrap()
                        .pending_tool_calls
                        .remove(tool_call_id);
                }
                AgentEvent::TurnEnd { message, .. } => {
                    if let Message::Assistant(assistant) = message {
                        if let Some(error_message) = &assistant.error_message {
                            self.inner.state.lock().unwrap().error =
                                Some(error_message.clone());
                        }
                    }
                }
                AgentEvent::AgentEnd { .. } => {
                    saw_agent_end = true;
                    let mut state = self.inner.state.lock().unwrap();
                    state.is_streaming = false;
                    state.stream_message = None;
                }
                AgentEvent::AgentStart
                | AgentEvent::TurnStart
                | AgentEvent::ToolExecutionUpdate { .. } => {}
            }
            self.emit(&event);
        }

        // An interrupted stream can leave a partial behind that carries
        // real content; keep it rather than losing streamed text.
        if let Some(Message::Assistant(assistant)) = &partial {
            let has_content = assistant.content.iter().any(|block| match block {
                skein_ai::AssistantContent::Text { text, .. } => !text.trim().is_empty(),
                skein_ai::AssistantContent::Thinking { thinking, .. } => {
                    !thinking.trim().is_empty()
                }
                skein_ai::AssistantContent::ToolCall(call) => !call.name.trim().is_empty(),
            });
            if has_content {
                self.append_message(Message::Assistant(assistant.clone()));
            }
        }

        if !saw_agent_end {
            let stop_reason = if abort_signal.is_aborted() {
                StopReason::Aborted
            } else {
                StopReason::Error
            };
            let error = AssistantMessage::errored(
                model,
                stop_reason,
                "agent loop terminated unexpectedly",
            );
            {
                let mut state = self.inner.state.lock().unwrap();
                state.error = error.error_message.clone();
                state.messages.push(Message::Assistant(error.clone()));
                state.is_streaming = false;
            }
            self.emit(&AgentEvent::AgentEnd { messages: vec![Message::Assistant(error)] });
        }
    }

    fn steering_source(&self) -> MessageSourceFn {
        let inner = Arc::clone(&self.inner);
        Arc::new(move || {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                let mode = *inner.steering_mode.lock().unwrap();
                drain_queue(&inner.steering_queue, mode)
            })
        })
    }

    fn follow_up_source(&self) -> MessageSourceFn {
        let inner = Arc::clone(&self.inner);
        Arc::new(move || {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                let mode = *inner.follow_up_mode.lock().unwrap();
                drain_queue(&inner.follow_up_queue, mode)
            })
        })
    }
}

fn drain_queue(queue: &Mutex<VecDeque<AgentMessage>>, mode: QueueMode) -> Vec<AgentMessage> {
    let mut queue = queue.lock().unwrap();
    match mode {
        QueueMode::All => queue.drain(..).collect(),
        QueueMode::OneAtATime => queue.pop_front().into_iter().collect(),
    }
}

fn default_stream_fn() -> AgentStreamFn {
    Arc::new(|model, context, options| {
        match skein_ai::stream_simple(model, context, options) {
            Ok(stream) => stream,
            Err(error) => {
                let (sink, stream) = skein_ai::assistant_event_stream();
                sink.push(skein_ai::AssistantMessageEvent::Error {
                    reason: skein_ai::ErrorReason::Error,
                    error: AssistantMessage::errored(model, StopReason::Error, error.to_string()),
                });
                sink.end(None);
                stream
            }
        }
    })
}
