// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI Completions API transport, shared by every completions-style
//! endpoint (OpenAI, Groq, Cerebras, xAI, Mistral, OpenRouter, local
//! servers).
//!
//! Per-provider deviations are captured in a [`ResolvedCompat`] table,
//! auto-detected from the provider id and base URL and overridable per
//! model via [`CompletionsCompat`].  The delta protocol has no block
//! boundaries, so block start/end events are synthesized whenever the
//! delta kind changes.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::{bail, Context as AnyhowContext};
use futures::StreamExt;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::catalog::{calculate_cost, supports_xhigh};
use crate::env_keys::get_env_api_key;
use crate::event_stream::{assistant_event_stream, AssistantEventSink, AssistantMessageStream};
use crate::json_parse::parse_streaming_json;
use crate::providers::options::{build_base_options, clamp_reasoning};
use crate::providers::{error_stream, finish};
use crate::transform::transform_messages;
use crate::types::{
    AssistantContent, AssistantMessage, AssistantMessageEvent, ContentPart, Context, Message,
    MaxTokensField, Model, SimpleStreamOptions, StopReason, StreamOptions, ThinkingFormat,
    ThinkingLevel, ToolCall, UserContent,
};

/// Options specific to OpenAI-completions-compatible APIs.
#[derive(Debug, Clone, Default)]
pub struct OpenAiCompletionsOptions {
    pub options: StreamOptions,
    pub tool_choice: Option<Value>,
    pub reasoning_effort: Option<ThinkingLevel>,
}

#[derive(Debug, thiserror::Error)]
#[error("request aborted")]
struct Aborted;

// ─── Compat resolution ────────────────────────────────────────────────────────

/// Fully-resolved compatibility table for one model.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedCompat {
    pub supports_store: bool,
    pub supports_developer_role: bool,
    pub supports_reasoning_effort: bool,
    pub supports_usage_in_streaming: bool,
    pub max_tokens_field: MaxTokensField,
    pub requires_tool_result_name: bool,
    pub requires_assistant_after_tool_result: bool,
    pub requires_thinking_as_text: bool,
    pub requires_mistral_tool_ids: bool,
    pub thinking_format: ThinkingFormat,
    pub supports_strict_mode: bool,
}

/// Detect deviations from the provider id and base URL, then apply any
/// explicit per-model overrides on top.
pub(crate) fn resolve_compat(model: &Model) -> ResolvedCompat {
    let provider = model.provider.as_str();
    let base_url = model.base_url.as_str();

    let is_zai = provider == "zai" || base_url.contains("api.z.ai");
    let is_grok = provider == "xai" || base_url.contains("api.x.ai");
    let is_mistral = provider == "mistral" || base_url.contains("mistral.ai");
    let is_non_standard = provider == "cerebras"
        || base_url.contains("cerebras.ai")
        || is_grok
        || is_mistral
        || base_url.contains("chutes.ai")
        || base_url.contains("deepseek.com")
        || is_zai
        || provider == "opencode"
        || base_url.contains("opencode.ai");
    let use_max_tokens = is_mistral || base_url.contains("chutes.ai");

    let mut compat = ResolvedCompat {
        supports_store: !is_non_standard,
        supports_developer_role: !is_non_standard,
        supports_reasoning_effort: !is_grok && !is_zai,
        supports_usage_in_streaming: true,
        max_tokens_field: if use_max_tokens {
            MaxTokensField::MaxTokens
        } else {
            MaxTokensField::MaxCompletionTokens
        },
        requires_tool_result_name: is_mistral,
        requires_assistant_after_tool_result: false,
        requires_thinking_as_text: is_mistral,
        requires_mistral_tool_ids: is_mistral,
        thinking_format: if is_zai { ThinkingFormat::Zai } else { ThinkingFormat::Openai },
        supports_strict_mode: true,
    };

    if let Some(overrides) = &model.compat {
        if let Some(v) = overrides.supports_store {
            compat.supports_store = v;
        }
        if let Some(v) = overrides.supports_developer_role {
            compat.supports_developer_role = v;
        }
        if let Some(v) = overrides.supports_reasoning_effort {
            compat.supports_reasoning_effort = v;
        }
        if let Some(v) = overrides.supports_usage_in_streaming {
            compat.supports_usage_in_streaming = v;
        }
        if let Some(v) = overrides.max_tokens_field {
            compat.max_tokens_field = v;
        }
        if let Some(v) = overrides.requires_tool_result_name {
            compat.requires_tool_result_name = v;
        }
        if let Some(v) = overrides.requires_assistant_after_tool_result {
            compat.requires_assistant_after_tool_result = v;
        }
        if let Some(v) = overrides.requires_thinking_as_text {
            compat.requires_thinking_as_text = v;
        }
        if let Some(v) = overrides.requires_mistral_tool_ids {
            compat.requires_mistral_tool_ids = v;
        }
        if let Some(v) = overrides.thinking_format {
            compat.thinking_format = v;
        }
        if let Some(v) = overrides.supports_strict_mode {
            compat.supports_strict_mode = v;
        }
    }
    compat
}

// ─── Tool-call id normalization ───────────────────────────────────────────────

/// Mistral ids are exactly 9 alphanumeric characters.
fn normalize_mistral_tool_id(id: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| Regex::new(r"[^a-zA-Z0-9]").expect("must compile"));
    let mut normalized: String = invalid.replace_all(id, "").to_string();
    const PADDING: &str = "ABCDEFGHI";
    if normalized.len() < 9 {
        let needed = 9 - normalized.len();
        normalized.push_str(&PADDING[..needed]);
    } else if normalized.len() > 9 {
        normalized.truncate(9);
    }
    normalized
}

fn normalize_tool_call_id(compat: &ResolvedCompat, model: &Model, id: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let unsafe_chars = UNSAFE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_-]").expect("must compile"));

    if compat.requires_mistral_tool_ids {
        return normalize_mistral_tool_id(id);
    }
    // Composite ids ("call|item") keep the call portion only.
    if let Some((call_id, _)) = id.split_once('|') {
        let cleaned = unsafe_chars.replace_all(call_id, "_");
        return cleaned.chars().take(40).collect();
    }
    if model.provider == "openai" {
        return id.chars().take(40).collect();
    }
    if model.provider == "github-copilot" && model.id.to_lowercase().contains("claude") {
        let cleaned = unsafe_chars.replace_all(id, "_");
        return cleaned.chars().take(64).collect();
    }
    id.to_string()
}

// ─── Message building ─────────────────────────────────────────────────────────

fn has_tool_history(messages: &[Message]) -> bool {
    messages.iter().any(|m| match m {
        Message::ToolResult(_) => true,
        Message::Assistant(a) => !a.tool_calls().is_empty(),
        Message::User(_) => false,
    })
}

fn data_url(data: &str, mime_type: &str) -> Value {
    json!({
        "type": "image_url",
        "image_url": { "url": format!("data:{mime_type};base64,{data}") },
    })
}

pub(crate) fn build_messages(
    model: &Model,
    compat: &ResolvedCompat,
    system_prompt: Option<&str>,
    history: &[Message],
) -> Vec<Value> {
    let transformed = transform_messages(
        history,
        model,
        Some(&|id: &str, m: &Model, _: &AssistantMessage| {
            normalize_tool_call_id(&resolve_compat(m), m, id)
        }),
    );

    let mut out: Vec<Value> = Vec::new();

    if let Some(system_prompt) = system_prompt {
        let role = if model.reasoning && compat.supports_developer_role {
            "developer"
        } else {
            "system"
        };
        out.push(json!({ "role": role, "content": system_prompt }));
    }

    let mut last_role: Option<&'static str> = None;
    let mut i = 0;
    while i < transformed.len() {
        match &transformed[i] {
            Message::User(user) => {
                if compat.requires_assistant_after_tool_result && last_role == Some("toolResult") {
                    out.push(json!({
                        "role": "assistant",
                        "content": "I have processed the tool results.",
                    }));
                }
                match &user.content {
                    UserContent::Text(text) => {
                        out.push(json!({ "role": "user", "content": text }));
                    }
                    UserContent::Parts(parts) => {
                        let content: Vec<Value> = parts
                            .iter()
                            .filter_map(|part| match part {
                                ContentPart::Text { text, .. } => {
                                    Some(json!({ "type": "text", "text": text }))
                                }
                                ContentPart::Image { data, mime_type }
                                    if model.supports_images() =>
                                {
                                    Some(data_url(data, mime_type))
                                }
                                ContentPart::Image { .. } => None,
                            })
                            .collect();
                        if !content.is_empty() {
                            out.push(json!({ "role": "user", "content": content }));
                        }
                    }
                }
                last_role = Some("user");
            }

            Message::Assistant(assistant) => {
                let mut message = json!({ "role": "assistant" });
                message["content"] = if compat.requires_assistant_after_tool_result {
                    json!("")
                } else {
                    Value::Null
                };

                let text_blocks: Vec<&str> = assistant
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        AssistantContent::Text { text, .. } if !text.trim().is_empty() => {
                            Some(text.as_str())
                        }
                        _ => None,
                    })
                    .collect();
                if !text_blocks.is_empty() {
                    let blocks: Vec<Value> = text_blocks
                        .iter()
                        .map(|t| json!({ "type": "text", "text": t }))
                        .collect();
                    message["content"] = json!(blocks);
                }

                let thinking: Vec<(&str, Option<&str>)> = assistant
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        AssistantContent::Thinking { thinking, thinking_signature }
                            if !thinking.trim().is_empty() =>
                        {
                            Some((thinking.as_str(), thinking_signature.as_deref()))
                        }
                        _ => None,
                    })
                    .collect();
                if !thinking.is_empty() {
                    if compat.requires_thinking_as_text {
                        let text = thinking
                            .iter()
                            .map(|(t, _)| *t)
                            .collect::<Vec<_>>()
                            .join("\n\n");
                        let block = json!({ "type": "text", "text": text });
                        match &mut message["content"] {
                            Value::Array(blocks) => blocks.insert(0, block),
                            _ => message["content"] = json!([block]),
                        }
                    } else if let Some(field) = thinking[0].1 {
                        // Restore reasoning onto the wire field it arrived on
                        // (reasoning_content / reasoning / reasoning_text).
                        let text =
                            thinking.iter().map(|(t, _)| *t).collect::<Vec<_>>().join("\n");
                        message[field] = json!(text);
                    }
                }

                let tool_calls = assistant.tool_calls();
                if !tool_calls.is_empty() {
                    let calls: Vec<Value> = tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments":
                                        Value::Object(call.arguments.clone()).to_string(),
                                },
                            })
                        })
                        .collect();
                    message["tool_calls"] = json!(calls);
                }

                let has_content = match &message["content"] {
                    Value::String(s) => !s.is_empty(),
                    Value::Array(a) => !a.is_empty(),
                    _ => false,
                };
                if has_content || message.get("tool_calls").is_some() {
                    out.push(message);
                }
                last_role = Some("assistant");
            }

            Message::ToolResult(_) => {
                let mut image_blocks: Vec<Value> = Vec::new();
                while let Some(Message::ToolResult(result)) = transformed.get(i) {
                    let text: Vec<&str> =
                        result.content.iter().filter_map(ContentPart::as_text).collect();
                    let text = text.join("\n");
                    let content =
                        if text.is_empty() { "(see attached image)".to_string() } else { text };
                    let mut message = json!({
                        "role": "tool",
                        "content": content,
                        "tool_call_id": result.tool_call_id,
                    });
                    if compat.requires_tool_result_name && !result.tool_name.is_empty() {
                        message["name"] = json!(result.tool_name);
                    }
                    out.push(message);

                    if model.supports_images() {
                        for part in &result.content {
                            if let ContentPart::Image { data, mime_type } = part {
                                image_blocks.push(data_url(data, mime_type));
                            }
                        }
                    }
                    i += 1;
                }

                // Completions tool messages cannot carry images; hoist them
                // into a follow-up user message.
                if !image_blocks.is_empty() {
                    if compat.requires_assistant_after_tool_result {
                        out.push(json!({
                            "role": "assistant",
                            "content": "I have processed the tool results.",
                        }));
                    }
                    let mut content =
                        vec![json!({ "type": "text", "text": "Attached image(s) from tool result:" })];
                    content.extend(image_blocks);
                    out.push(json!({ "role": "user", "content": content }));
                    last_role = Some("user");
                } else {
                    last_role = Some("toolResult");
                }
                continue;
            }
        }
        i += 1;
    }

    out
}

fn build_request_body(
    model: &Model,
    compat: &ResolvedCompat,
    context: &Context,
    options: &OpenAiCompletionsOptions,
) -> Value {
    let messages =
        build_messages(model, compat, context.system_prompt.as_deref(), &context.messages);

    let mut body = json!({
        "model": model.id,
        "messages": messages,
        "stream": true,
    });

    if compat.supports_usage_in_streaming {
        body["stream_options"] = json!({ "include_usage": true });
    }
    if compat.supports_store {
        body["store"] = json!(false);
    }
    if let Some(max_tokens) = options.options.max_tokens {
        match compat.max_tokens_field {
            MaxTokensField::MaxTokens => body["max_tokens"] = json!(max_tokens),
            MaxTokensField::MaxCompletionTokens => {
                body["max_completion_tokens"] = json!(max_tokens)
            }
        }
    }
    if let Some(temperature) = options.options.temperature {
        body["temperature"] = json!(temperature);
    }

    match &context.tools {
        Some(tools) if !tools.is_empty() => {
            let tools: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    let mut function = json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    });
                    if compat.supports_strict_mode {
                        function["strict"] = json!(false);
                    }
                    json!({ "type": "function", "function": function })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        // A history with tool traffic needs an (empty) tools array or some
        // providers reject the resubmitted tool messages.
        _ if has_tool_history(&context.messages) => {
            body["tools"] = json!([]);
        }
        _ => {}
    }

    if let Some(tool_choice) = &options.tool_choice {
        body["tool_choice"] = tool_choice.clone();
    }

    match compat.thinking_format {
        ThinkingFormat::Zai if model.reasoning => {
            let enabled = options.reasoning_effort.is_some();
            body["thinking"] = json!({ "type": if enabled { "enabled" } else { "disabled" } });
        }
        ThinkingFormat::Qwen if model.reasoning => {
            body["enable_thinking"] = json!(options.reasoning_effort.is_some());
        }
        _ => {
            if let Some(effort) = options.reasoning_effort {
                if model.reasoning && compat.supports_reasoning_effort {
                    body["reasoning_effort"] = serde_json::to_value(effort)
                        .expect("thinking level serializes to a string");
                }
            }
        }
    }

    if model.base_url.contains("openrouter.ai") {
        if let Some(routing) =
            model.compat.as_ref().and_then(|c| c.open_router_routing.as_ref())
        {
            body["provider"] = serde_json::to_value(routing)
                .expect("routing preferences serialize");
        }
    }

    body
}

// ─── Delta state machine ──────────────────────────────────────────────────────

/// The delta protocol carries no block boundaries; this tracks the block
/// currently being appended to so start/end events can be synthesized when
/// the delta kind switches.
#[derive(Default)]
struct ChunkState {
    /// Raw argument JSON accumulated for the open tool call, if any.
    args_buf: String,
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::Stop,
        "length" => StopReason::Length,
        "function_call" | "tool_calls" => StopReason::ToolUse,
        _ => StopReason::Error,
    }
}

/// Emit the `*_end` event for the block currently open at the tail of
/// `output.content`.
fn finish_open_block(state: &mut ChunkState, output: &mut AssistantMessage, sink: &AssistantEventSink) {
    let content_index = match output.content.len() {
        0 => return,
        n => n - 1,
    };
    // Freeze tool arguments from the raw payload before the snapshot.
    if let Some(AssistantContent::ToolCall(call)) = output.content.last_mut() {
        call.arguments = parse_streaming_json(&state.args_buf);
        state.args_buf.clear();
    }
    let event = match output.content.last() {
        Some(AssistantContent::Text { text, .. }) => AssistantMessageEvent::TextEnd {
            content_index,
            content: text.clone(),
            partial: output.clone(),
        },
        Some(AssistantContent::Thinking { thinking, .. }) => AssistantMessageEvent::ThinkingEnd {
            content_index,
            content: thinking.clone(),
            partial: output.clone(),
        },
        Some(AssistantContent::ToolCall(call)) => AssistantMessageEvent::ToolcallEnd {
            content_index,
            tool_call: call.clone(),
            partial: output.clone(),
        },
        None => return,
    };
    sink.push(event);
}

fn handle_chunk(
    value: &Value,
    state: &mut ChunkState,
    output: &mut AssistantMessage,
    model: &Model,
    sink: &AssistantEventSink,
) {
    if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
        let cached = usage["prompt_tokens_details"]["cached_tokens"].as_u64().unwrap_or(0) as u32;
        let reasoning =
            usage["completion_tokens_details"]["reasoning_tokens"].as_u64().unwrap_or(0) as u32;
        let prompt = usage["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let completion = usage["completion_tokens"].as_u64().unwrap_or(0) as u32;

        output.usage.input = prompt.saturating_sub(cached);
        output.usage.output = completion + reasoning;
        output.usage.cache_read = cached;
        output.usage.cache_write = 0;
        output.usage.total_tokens =
            output.usage.input + output.usage.output + output.usage.cache_read;
        calculate_cost(model, &mut output.usage);
    }

    let Some(choice) = value["choices"].get(0) else { return };

    if let Some(reason) = choice["finish_reason"].as_str() {
        output.stop_reason = map_finish_reason(reason);
    }

    let delta = &choice["delta"];

    // Text.
    if let Some(fragment) = delta["content"].as_str().filter(|s| !s.is_empty()) {
        if !matches!(output.content.last(), Some(AssistantContent::Text { .. })) {
            finish_open_block(state, output, sink);
            output.content.push(AssistantContent::text(""));
            sink.push(AssistantMessageEvent::TextStart {
                content_index: output.content.len() - 1,
                partial: output.clone(),
            });
        }
        let content_index = output.content.len() - 1;
        if let Some(AssistantContent::Text { text, .. }) = output.content.last_mut() {
            text.push_str(fragment);
        }
        sink.push(AssistantMessageEvent::TextDelta {
            content_index,
            delta: fragment.to_string(),
            partial: output.clone(),
        });
    }

    // Reasoning, streamed on a provider-specific side channel.  The field
    // name is recorded as the thinking signature so the reverse transform
    // can restore the format on resubmission.
    for field in ["reasoning_content", "reasoning", "reasoning_text"] {
        let Some(fragment) = delta[field].as_str().filter(|s| !s.is_empty()) else { continue };
        if !matches!(output.content.last(), Some(AssistantContent::Thinking { .. })) {
            finish_open_block(state, output, sink);
            output.content.push(AssistantContent::Thinking {
                thinking: String::new(),
                thinking_signature: Some(field.to_string()),
            });
            sink.push(AssistantMessageEvent::ThinkingStart {
                content_index: output.content.len() - 1,
                partial: output.clone(),
            });
        }
        let content_index = output.content.len() - 1;
        if let Some(AssistantContent::Thinking { thinking, .. }) = output.content.last_mut() {
            thinking.push_str(fragment);
        }
        sink.push(AssistantMessageEvent::ThinkingDelta {
            content_index,
            delta: fragment.to_string(),
            partial: output.clone(),
        });
        break;
    }

    // Tool calls.
    if let Some(calls) = delta["tool_calls"].as_array() {
        for call_delta in calls {
            let id = call_delta["id"].as_str().unwrap_or("");
            let name = call_delta["function"]["name"].as_str().unwrap_or("");
            let needs_new_block = match output.content.last() {
                Some(AssistantContent::ToolCall(open)) => !id.is_empty() && open.id != id,
                _ => true,
            };
            if needs_new_block {
                finish_open_block(state, output, sink);
                output.content.push(AssistantContent::ToolCall(ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: Map::new(),
                    thought_signature: None,
                }));
                sink.push(AssistantMessageEvent::ToolcallStart {
                    content_index: output.content.len() - 1,
                    partial: output.clone(),
                });
            }

            let content_index = output.content.len() - 1;
            let mut delta_args = String::new();
            if let Some(AssistantContent::ToolCall(open)) = output.content.last_mut() {
                if !id.is_empty() {
                    open.id = id.to_string();
                }
                if !name.is_empty() {
                    open.name = name.to_string();
                }
                if let Some(arguments) = call_delta["function"]["arguments"].as_str() {
                    delta_args = arguments.to_string();
                    state.args_buf.push_str(arguments);
                    open.arguments = parse_streaming_json(&state.args_buf);
                }
            }
            sink.push(AssistantMessageEvent::ToolcallDelta {
                content_index,
                delta: delta_args,
                partial: output.clone(),
            });
        }
    }
}

// ─── Streaming entry points ───────────────────────────────────────────────────

/// Stream an assistant message from an OpenAI-completions endpoint.
pub fn stream_openai_completions(
    model: &Model,
    context: &Context,
    options: OpenAiCompletionsOptions,
) -> AssistantMessageStream {
    let (sink, stream) = assistant_event_stream();
    let model = model.clone();
    let context = context.clone();

    tokio::spawn(async move {
        let mut output = AssistantMessage::empty(&model);
        let mut state = ChunkState::default();
        match run(&model, &context, &options, &sink, &mut output, &mut state).await {
            Ok(()) => {
                finish_open_block(&mut state, &mut output, &sink);
                finish(&sink, &mut output);
            }
            Err(error) => {
                if error.is::<Aborted>() {
                    output.stop_reason = StopReason::Aborted;
                    sink.push(AssistantMessageEvent::Error {
                        reason: crate::types::ErrorReason::Aborted,
                        error: output,
                    });
                } else {
                    output.stop_reason = StopReason::Error;
                    output.error_message = Some(error.to_string());
                    sink.push(AssistantMessageEvent::Error {
                        reason: crate::types::ErrorReason::Error,
                        error: output,
                    });
                }
                sink.end(None);
            }
        }
    });

    stream
}

/// Stream with unified options; `xhigh` passes through only on models that
/// advertise it.
pub fn stream_simple_openai_completions(
    model: &Model,
    context: &Context,
    options: SimpleStreamOptions,
) -> AssistantMessageStream {
    let api_key = options.options.api_key.clone().or_else(|| get_env_api_key(&model.provider));
    let Some(api_key) = api_key else {
        return error_stream(model, format!("No API key for provider: {}", model.provider));
    };

    let base = build_base_options(model, &options, Some(api_key));
    let reasoning_effort = if supports_xhigh(model) {
        options.reasoning
    } else {
        clamp_reasoning(options.reasoning)
    };

    stream_openai_completions(
        model,
        context,
        OpenAiCompletionsOptions { options: base, tool_choice: None, reasoning_effort },
    )
}

async fn run(
    model: &Model,
    context: &Context,
    options: &OpenAiCompletionsOptions,
    sink: &AssistantEventSink,
    output: &mut AssistantMessage,
    state: &mut ChunkState,
) -> anyhow::Result<()> {
    let api_key = options
        .options
        .api_key
        .clone()
        .or_else(|| get_env_api_key(&model.provider))
        .unwrap_or_default();

    let compat = resolve_compat(model);
    let body = build_request_body(model, &compat, context, options);

    debug!(
        model = %model.id,
        provider = %model.provider,
        reasoning_effort = ?options.reasoning_effort,
        "sending completions request",
    );

    let mut extra_headers: HashMap<String, String> = HashMap::new();
    if let Some(headers) = &model.headers {
        extra_headers.extend(headers.clone());
    }
    if model.provider == "github-copilot" {
        let is_agent_call =
            matches!(context.messages.last(), Some(m) if m.role() != "user");
        extra_headers.insert(
            "X-Initiator".into(),
            if is_agent_call { "agent" } else { "user" }.into(),
        );
        extra_headers.insert("Openai-Intent".into(), "conversation-edits".into());
    }
    if let Some(headers) = &options.options.headers {
        extra_headers.extend(headers.clone());
    }

    let mut request = reqwest::Client::new()
        .post(format!("{}/chat/completions", model.base_url.trim_end_matches('/')))
        .bearer_auth(api_key);
    for (name, value) in &extra_headers {
        request = request.header(name, value);
    }

    sink.push(AssistantMessageEvent::Start { partial: output.clone() });

    let request = request.json(&body);
    let mut retried = false;
    let response = loop {
        let attempt = request.try_clone().context("request body must be cloneable")?;
        let response = attempt.send().await.context("completions request failed")?;
        let status = response.status();
        if status.is_success() {
            break response;
        }
        if !retried {
            if let Some(delay) = crate::providers::provider_retry_delay(
                status,
                response.headers(),
                options.options.max_retry_delay_ms,
            ) {
                debug!(status = %status, ?delay, "honoring provider retry request");
                retried = true;
                tokio::time::sleep(delay).await;
                continue;
            }
        }
        let text = response.text().await.unwrap_or_default();
        if text.trim().is_empty() {
            bail!("{} (no body)", status.as_u16());
        }
        bail!("{} error {status}: {text}", model.provider);
    };

    let mut signal = options.options.signal.clone();
    let mut byte_stream = response.bytes_stream();
    let mut buf = String::new();

    loop {
        let chunk = match signal.as_mut() {
            Some(sig) => {
                tokio::select! {
                    biased;
                    _ = sig.fired() => {
                        if sig.is_aborted() {
                            return Err(Aborted.into());
                        }
                        signal = None;
                        continue;
                    }
                    chunk = byte_stream.next() => chunk,
                }
            }
            None => byte_stream.next().await,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk.context("completions stream read failed")?;
        buf.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buf.find('\n') {
            let line = buf[..pos].trim_end_matches('\r').to_string();
            buf.drain(..=pos);
            let Some(data) = line.strip_prefix("data: ") else { continue };
            let data = data.trim();
            if data == "[DONE]" {
                return Ok(());
            }
            if let Ok(value) = serde_json::from_str::<Value>(data) {
                handle_chunk(&value, state, output, model, sink);
            }
        }
    }

    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
