// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use skein_ai::{
    AbortSignal, AssistantMessageEvent, AssistantMessageStream, CacheRetention, ContentPart,
    Context, Message, Model, SimpleStreamOptions, ThinkingBudgets, ThinkingLevel, Tool,
    ToolResultMessage,
};

/// Messages the agent layer works with.  Currently identical to the LLM
/// message set; `convert_to_llm` is the hook where app-specific message
/// kinds would be projected out.
pub type AgentMessage = Message;

// ─── Tools ────────────────────────────────────────────────────────────────────

/// Result of one tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentToolResult {
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AgentToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self { content: vec![ContentPart::text(text)], details: None }
    }
}

/// Callback for streaming partial tool output while the tool runs.
pub type ToolUpdateFn = Arc<dyn Fn(AgentToolResult) + Send + Sync>;

/// Executes one tool call.  Implementations should observe `signal` for
/// cooperative cancellation and may call `on_update` any number of times;
/// each call surfaces as a `tool_execution_update` event.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        tool_call_id: &str,
        arguments: Map<String, Value>,
        signal: Option<AbortSignal>,
        on_update: ToolUpdateFn,
    ) -> anyhow::Result<AgentToolResult>;
}

/// A tool the agent can dispatch: schema plus executor.
#[derive(Clone)]
pub struct AgentTool {
    pub name: String,
    /// Human-readable label for UI display.
    pub label: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
    pub executor: Arc<dyn ToolExecutor>,
}

impl AgentTool {
    /// Project to the schema-only form sent to the model.
    pub fn schema(&self) -> Tool {
        Tool {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

impl fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentTool")
            .field("name", &self.name)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Like [`Context`] but carrying executable tools.
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub system_prompt: String,
    pub messages: Vec<AgentMessage>,
    pub tools: Vec<AgentTool>,
}

// ─── Configuration ────────────────────────────────────────────────────────────

/// Reasoning effort including "off".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentThinkingLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl AgentThinkingLevel {
    pub fn reasoning(self) -> Option<ThinkingLevel> {
        match self {
            Self::Off => None,
            Self::Minimal => Some(ThinkingLevel::Minimal),
            Self::Low => Some(ThinkingLevel::Low),
            Self::Medium => Some(ThinkingLevel::Medium),
            Self::High => Some(ThinkingLevel::High),
            Self::Xhigh => Some(ThinkingLevel::Xhigh),
        }
    }
}

/// Drain policy for the steering and follow-up queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    All,
    #[default]
    OneAtATime,
}

/// Async callback producing queued messages (steering or follow-up).
pub type MessageSourceFn = Arc<dyn Fn() -> BoxFuture<'static, Vec<AgentMessage>> + Send + Sync>;

/// Async transform applied to the context before `convert_to_llm`.
pub type TransformContextFn = Arc<
    dyn Fn(Vec<AgentMessage>, Option<AbortSignal>) -> BoxFuture<'static, Vec<AgentMessage>>
        + Send
        + Sync,
>;

/// Projects agent messages to the provider-visible subset.
pub type ConvertToLlmFn = Arc<dyn Fn(&[AgentMessage]) -> Vec<Message> + Send + Sync>;

/// Resolves an API key for a provider at call time.
pub type ApiKeyFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// The pluggable transport surface used by the loop.
pub type AgentStreamFn =
    Arc<dyn Fn(&Model, &Context, SimpleStreamOptions) -> AssistantMessageStream + Send + Sync>;

/// Everything one run of the agent loop needs.
#[derive(Clone)]
pub struct AgentLoopConfig {
    pub model: Model,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub cache_retention: Option<CacheRetention>,
    pub session_id: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub max_retry_delay_ms: Option<u64>,
    pub reasoning: Option<ThinkingLevel>,
    pub thinking_budgets: Option<ThinkingBudgets>,
    pub convert_to_llm: ConvertToLlmFn,
    pub transform_context: Option<TransformContextFn>,
    pub get_api_key: Option<ApiKeyFn>,
    pub get_steering_messages: Option<MessageSourceFn>,
    pub get_follow_up_messages: Option<MessageSourceFn>,
}

impl AgentLoopConfig {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            temperature: None,
            max_tokens: None,
            api_key: None,
            cache_retention: None,
            session_id: None,
            headers: None,
            max_retry_delay_ms: None,
            reasoning: None,
            thinking_budgets: None,
            convert_to_llm: default_convert_to_llm(),
            transform_context: None,
            get_api_key: None,
            get_steering_messages: None,
            get_follow_up_messages: None,
        }
    }
}

/// Default projection: keep user, assistant and tool-result messages.
pub fn default_convert_to_llm() -> ConvertToLlmFn {
    Arc::new(|messages| messages.to_vec())
}

// ─── Agent state ──────────────────────────────────────────────────────────────

/// Lightweight mirror of the conversation, updated from the event stream.
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub system_prompt: String,
    pub model: Option<Model>,
    pub thinking_level: AgentThinkingLevel,
    pub tools: Vec<AgentTool>,
    pub messages: Vec<AgentMessage>,
    pub is_streaming: bool,
    /// The in-flight partial message while streaming.
    pub stream_message: Option<AgentMessage>,
    /// Tool calls currently executing or queued within the turn.
    pub pending_tool_calls: HashSet<String>,
    pub error: Option<String>,
}

// ─── Agent events ─────────────────────────────────────────────────────────────

/// Events emitted over one agent run, in a strict total order:
///
/// ```text
/// agent_start (turn_start (message_* | tool_execution_*)* turn_end)* agent_end
/// ```
///
/// Every event names the messages it references by value, so replaying a
/// recorded sequence reconstructs the conversation exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart,
    AgentEnd {
        messages: Vec<AgentMessage>,
    },
    TurnStart,
    TurnEnd {
        message: AgentMessage,
        tool_results: Vec<ToolResultMessage>,
    },
    MessageStart {
        message: AgentMessage,
    },
    MessageUpdate {
        message: AgentMessage,
        #[serde(rename = "assistant_message_event")]
        event: AssistantMessageEvent,
    },
    MessageEnd {
        message: AgentMessage,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: Map<String, Value>,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        args: Map<String, Value>,
        partial_result: AgentToolResult,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: AgentToolResult,
        is_error: bool,
    },
}

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Synchronous failures from facade entry points.  Errors that occur
/// inside a run are folded into the event stream instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error(
        "agent is already processing a prompt; use steer() or follow_up() to queue messages, \
         or wait for completion"
    )]
    AlreadyStreaming,
    #[error("no model configured")]
    NoModel,
    #[error("cannot continue: no messages in context")]
    EmptyHistory,
    #[error("cannot continue from message role: assistant")]
    LastMessageIsAssistant,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
