use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::abort::AbortSignal;

/// Milliseconds since the Unix epoch.  All messages are stamped with this.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A content part that may appear in user messages and tool results:
/// plain text or a base64-encoded image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text_signature: Option<String>,
    },
    Image {
        /// Base64-encoded image bytes (no data-URL prefix).
        data: String,
        /// MIME type, e.g. `"image/png"`.
        mime_type: String,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into(), text_signature: None }
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Image { data: data.into(), mime_type: mime_type.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text),
            Self::Image { .. } => None,
        }
    }
}

/// A tool invocation requested by the model.
///
/// `arguments` holds the tolerant-parsed JSON object accumulated from the
/// argument delta stream.  `thought_signature` is an opaque provider token
/// that must be echoed back verbatim on same-provider continuations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

/// Content of an assistant message.  The taxonomy is closed: text,
/// thinking, or a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AssistantContent {
    #[serde(rename = "text")]
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text_signature: Option<String>,
    },
    /// Reasoning content.  `thinking_signature` identifies provider-private
    /// state (opaque blob for Anthropic, the wire field name for providers
    /// that stream reasoning on a separate text channel).
    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking_signature: Option<String>,
    },
    #[serde(rename = "toolCall")]
    ToolCall(ToolCall),
}

impl AssistantContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into(), text_signature: None }
    }

    pub fn thinking(thinking: impl Into<String>) -> Self {
        Self::Thinking { thinking: thinking.into(), thinking_signature: None }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCall> {
        match self {
            Self::ToolCall(tc) => Some(tc),
            _ => None,
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// User message content: a plain string or a list of text/image parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl From<String> for UserContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for UserContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: UserContent,
    pub timestamp: i64,
}

/// Why a completed assistant message stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    Error,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<AssistantContent>,
    pub api: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub usage: Usage,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: i64,
}

impl AssistantMessage {
    /// The empty partial created at stream `start`, before any deltas.
    pub fn empty(model: &Model) -> Self {
        Self {
            content: Vec::new(),
            api: model.api.clone(),
            provider: model.provider.clone(),
            model: model.id.clone(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
            timestamp: now_ms(),
        }
    }

    /// An error-terminal assistant message carrying `message` as its reason.
    pub fn errored(model: &Model, stop_reason: StopReason, message: impl Into<String>) -> Self {
        Self {
            stop_reason,
            error_message: Some(message.into()),
            ..Self::empty(model)
        }
    }

    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content.iter().filter_map(AssistantContent::as_tool_call).collect()
    }

    /// Concatenated text content, ignoring thinking and tool calls.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
    pub timestamp: i64,
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "user")]
    User(UserMessage),
    #[serde(rename = "assistant")]
    Assistant(AssistantMessage),
    #[serde(rename = "toolResult")]
    ToolResult(ToolResultMessage),
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User(UserMessage { content: UserContent::Text(text.into()), timestamp: now_ms() })
    }

    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        Self::User(UserMessage { content: UserContent::Parts(parts), timestamp: now_ms() })
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::ToolResult(_) => "toolResult",
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Assistant(m) => Some(m),
            _ => None,
        }
    }
}

impl From<AssistantMessage> for Message {
    fn from(m: AssistantMessage) -> Self {
        Self::Assistant(m)
    }
}

impl From<ToolResultMessage> for Message {
    fn from(m: ToolResultMessage) -> Self {
        Self::ToolResult(m)
    }
}

// ─── Usage ────────────────────────────────────────────────────────────────────

/// Cost breakdown in dollars, derived from the model's per-million pricing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    pub total: f64,
}

/// Token usage for one turn.  Updated in place while streaming; the final
/// update before `done`/`error` is authoritative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u32,
    pub output: u32,
    pub cache_read: u32,
    pub cache_write: u32,
    pub total_tokens: u32,
    #[serde(default)]
    pub cost: UsageCost,
}

// ─── Model descriptor ─────────────────────────────────────────────────────────

/// Input modalities a model accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputModality {
    Text,
    Image,
}

/// Cost per million tokens, in dollars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

/// Which wire field carries the output-token cap for an
/// OpenAI-completions-compatible endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxTokensField {
    MaxCompletionTokens,
    MaxTokens,
}

/// How a completions-compatible endpoint expects thinking to be enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingFormat {
    Openai,
    Zai,
    Qwen,
}

/// Gateway routing preferences (OpenRouter, Vercel AI Gateway).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<String>>,
}

/// Per-model compatibility toggles for OpenAI-completions-style endpoints.
///
/// Every field is optional; `None` means "use the value auto-detected from
/// the provider id and base URL".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionsCompat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_store: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_developer_role: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_reasoning_effort: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_usage_in_streaming: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_field: Option<MaxTokensField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_tool_result_name: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_assistant_after_tool_result: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_thinking_as_text: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_mistral_tool_ids: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_format: Option<ThinkingFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_router_routing: Option<RoutingPreferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_strict_mode: Option<bool>,
}

/// A model definition: identity, endpoint, capability, limits and pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    /// Wire API this model speaks, e.g. `"anthropic-messages"`.
    pub api: String,
    pub provider: String,
    pub base_url: String,
    pub reasoning: bool,
    pub input: Vec<InputModality>,
    #[serde(default)]
    pub cost: ModelCost,
    pub context_window: u32,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compat: Option<CompletionsCompat>,
}

impl Model {
    pub fn supports_images(&self) -> bool {
        self.input.contains(&InputModality::Image)
    }
}

// ─── Tools and context ────────────────────────────────────────────────────────

/// A tool schema as presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

/// Conversation context for one LLM call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
}

// ─── Stream options ───────────────────────────────────────────────────────────

/// Prompt-cache retention requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheRetention {
    None,
    Short,
    Long,
}

/// Reasoning effort requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

/// Token budgets per thinking level, for providers that take a budget
/// rather than an effort enum.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThinkingBudgets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimal: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<u32>,
}

/// Base options shared by every provider transport.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub cache_retention: Option<CacheRetention>,
    pub session_id: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    /// Upper bound on how long the transport honors a provider-requested
    /// retry delay (e.g. `Retry-After`).
    pub max_retry_delay_ms: Option<u64>,
    /// Cooperative abort signal; when fired the transport finalizes the
    /// partial with `stop_reason = aborted`.
    pub signal: Option<AbortSignal>,
}

/// Unified options accepted by `stream_simple` / `complete_simple`.
#[derive(Debug, Clone, Default)]
pub struct SimpleStreamOptions {
    pub options: StreamOptions,
    pub reasoning: Option<ThinkingLevel>,
    pub thinking_budgets: Option<ThinkingBudgets>,
}

// ─── Assistant message events ─────────────────────────────────────────────────

/// Terminal reason on a successful `done` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DoneReason {
    Stop,
    Length,
    ToolUse,
}

/// Terminal reason on an `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorReason {
    Aborted,
    Error,
}

/// The canonical event sequence produced by every provider transport:
///
/// ```text
/// start ( <kind>_start ; <kind>_delta* ; <kind>_end )* (done | error)
/// ```
///
/// Every event carries a snapshot of the partial assistant message so
/// consumers can retain prior states safely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantMessageEvent {
    Start {
        partial: AssistantMessage,
    },
    TextStart {
        content_index: usize,
        partial: AssistantMessage,
    },
    TextDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    TextEnd {
        content_index: usize,
        content: String,
        partial: AssistantMessage,
    },
    ThinkingStart {
        content_index: usize,
        partial: AssistantMessage,
    },
    ThinkingDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    ThinkingEnd {
        content_index: usize,
        content: String,
        partial: AssistantMessage,
    },
    ToolcallStart {
        content_index: usize,
        partial: AssistantMessage,
    },
    ToolcallDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    ToolcallEnd {
        content_index: usize,
        tool_call: ToolCall,
        partial: AssistantMessage,
    },
    Done {
        reason: DoneReason,
        message: AssistantMessage,
    },
    Error {
        reason: ErrorReason,
        error: AssistantMessage,
    },
}

impl AssistantMessageEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// The partial-message snapshot carried by a non-terminal event.
    pub fn partial(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Start { partial }
            | Self::TextStart { partial, .. }
            | Self::TextDelta { partial, .. }
            | Self::TextEnd { partial, .. }
            | Self::ThinkingStart { partial, .. }
            | Self::ThinkingDelta { partial, .. }
            | Self::ThinkingEnd { partial, .. }
            | Self::ToolcallStart { partial, .. }
            | Self::ToolcallDelta { partial, .. }
            | Self::ToolcallEnd { partial, .. } => Some(partial),
            Self::Done { .. } | Self::Error { .. } => None,
        }
    }

    /// The final message carried by a terminal event, if this is one.
    pub fn terminal_message(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Done { message, .. } => Some(message),
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> Model {
        Model {
            id: "claude-opus-4-6".into(),
            name: "Claude Opus 4.6".into(),
            api: "anthropic-messages".into(),
            provider: "anthropic".into(),
            base_url: "https://api.anthropic.com".into(),
            reasoning: true,
            input: vec![InputModality::Text, InputModality::Image],
            cost: ModelCost::default(),
            context_window: 200_000,
            max_tokens: 64_000,
            headers: None,
            compat: None,
        }
    }

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn user_message_roundtrips_as_plain_string_content() {
        let m = Message::user("hello");
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn user_message_with_parts_serializes_tagged_blocks() {
        use base64::Engine as _;
        let data = base64::engine::general_purpose::STANDARD.encode(b"not a real png");
        let m = Message::user_with_parts(vec![
            ContentPart::text("what is this?"),
            ContentPart::image(data.clone(), "image/png"),
        ]);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image");
        assert_eq!(json["content"][1]["mime_type"], "image/png");
        assert_eq!(json["content"][1]["data"], data);
    }

    #[test]
    fn empty_assistant_starts_with_stop_reason_stop() {
        let m = AssistantMessage::empty(&model());
        assert!(m.content.is_empty());
        assert_eq!(m.stop_reason, StopReason::Stop);
        assert_eq!(m.provider, "anthropic");
        assert!(m.timestamp > 0);
    }

    #[test]
    fn tool_calls_filters_content_blocks() {
        let mut m = AssistantMessage::empty(&model());
        m.content.push(AssistantContent::text("working on it"));
        m.content.push(AssistantContent::ToolCall(ToolCall {
            id: "tc_1".into(),
            name: "get_time".into(),
            arguments: serde_json::Map::new(),
            thought_signature: None,
        }));
        assert_eq!(m.tool_calls().len(), 1);
        assert_eq!(m.tool_calls()[0].id, "tc_1");
        assert_eq!(m.text(), "working on it");
    }

    // ── Wire-format tags ──────────────────────────────────────────────────────

    #[test]
    fn stop_reason_uses_camel_case_tool_use() {
        assert_eq!(serde_json::to_value(StopReason::ToolUse).unwrap(), "toolUse");
        assert_eq!(serde_json::to_value(StopReason::Aborted).unwrap(), "aborted");
    }

    #[test]
    fn tool_call_block_tagged_as_tool_call() {
        let block = AssistantContent::ToolCall(ToolCall {
            id: "t1".into(),
            name: "search".into(),
            arguments: serde_json::Map::new(),
            thought_signature: None,
        });
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "toolCall");
        assert_eq!(json["name"], "search");
    }

    #[test]
    fn assistant_message_roundtrip_preserves_content_order() {
        let mut m = AssistantMessage::empty(&model());
        m.content.push(AssistantContent::thinking("hmm"));
        m.content.push(AssistantContent::text("answer"));
        let json = serde_json::to_string(&Message::Assistant(m.clone())).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_assistant().unwrap().content, m.content);
    }

    #[test]
    fn event_tags_match_wire_names() {
        let partial = AssistantMessage::empty(&model());
        let ev = AssistantMessageEvent::ToolcallStart { content_index: 2, partial };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "toolcall_start");
        assert_eq!(json["content_index"], 2);
    }

    #[test]
    fn done_event_is_terminal_and_carries_message() {
        let msg = AssistantMessage::empty(&model());
        let ev = AssistantMessageEvent::Done { reason: DoneReason::Stop, message: msg.clone() };
        assert!(ev.is_terminal());
        assert_eq!(ev.terminal_message(), Some(&msg));
    }

    #[test]
    fn delta_events_are_not_terminal() {
        let partial = AssistantMessage::empty(&model());
        let ev = AssistantMessageEvent::TextDelta {
            content_index: 0,
            delta: "hi".into(),
            partial,
        };
        assert!(!ev.is_terminal());
        assert!(ev.terminal_message().is_none());
    }
}
