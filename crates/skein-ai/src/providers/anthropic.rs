// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic Messages API transport.
//!
//! Translates the Messages SSE protocol (`message_start`,
//! `content_block_*`, `message_delta`, `message_stop`) into the canonical
//! assistant-message event sequence, reconstructing the partial message as
//! deltas arrive.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::{bail, Context as AnyhowContext};
use futures::StreamExt;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use crate::catalog::calculate_cost;
use crate::env_keys::get_env_api_key;
use crate::event_stream::{assistant_event_stream, AssistantEventSink, AssistantMessageStream};
use crate::json_parse::parse_streaming_json;
use crate::providers::{error_stream, finish};
use crate::providers::options::{adjust_max_tokens_for_thinking, build_base_options};
use crate::transform::transform_messages;
use crate::types::{
    AssistantContent, AssistantMessage, AssistantMessageEvent, CacheRetention, ContentPart,
    Context, DoneReason, ErrorReason, Message, Model, SimpleStreamOptions, StopReason,
    StreamOptions, ToolCall, UserContent,
};

/// Options specific to the Anthropic Messages API.
#[derive(Debug, Clone, Default)]
pub struct AnthropicOptions {
    pub options: StreamOptions,
    pub thinking_enabled: bool,
    pub thinking_budget_tokens: Option<u32>,
    /// Enable the interleaved-thinking beta.  Defaults to on.
    pub interleaved_thinking: Option<bool>,
    pub tool_choice: Option<Value>,
}

/// Sentinel error used to route an observed abort out of the SSE loop.
#[derive(Debug, thiserror::Error)]
#[error("request aborted")]
struct Aborted;

/// Stream an assistant message from the Anthropic Messages API.
pub fn stream_anthropic(
    model: &Model,
    context: &Context,
    options: AnthropicOptions,
) -> AssistantMessageStream {
    let (sink, stream) = assistant_event_stream();
    let model = model.clone();
    let context = context.clone();

    tokio::spawn(async move {
        let mut output = AssistantMessage::empty(&model);
        match run(&model, &context, &options, &sink, &mut output).await {
            Ok(()) => finish(&sink, &mut output),
            Err(error) => {
                if error.is::<Aborted>() {
                    output.stop_reason = StopReason::Aborted;
                    sink.push(AssistantMessageEvent::Error {
                        reason: ErrorReason::Aborted,
                        error: output,
                    });
                } else {
                    output.stop_reason = StopReason::Error;
                    output.error_message = Some(error.to_string());
                    sink.push(AssistantMessageEvent::Error {
                        reason: ErrorReason::Error,
                        error: output,
                    });
                }
                sink.end(None);
            }
        }
    });

    stream
}

/// Stream with unified options, resolving the reasoning level into a
/// thinking budget.
pub fn stream_simple_anthropic(
    model: &Model,
    context: &Context,
    options: SimpleStreamOptions,
) -> AssistantMessageStream {
    let api_key = options.options.api_key.clone().or_else(|| get_env_api_key(&model.provider));
    let Some(api_key) = api_key else {
        return error_stream(model, format!("No API key for provider: {}", model.provider));
    };

    let base = build_base_options(model, &options, Some(api_key));

    let Some(reasoning) = options.reasoning else {
        return stream_anthropic(
            model,
            context,
            AnthropicOptions { options: base, thinking_enabled: false, ..Default::default() },
        );
    };

    let (max_tokens, thinking_budget) = adjust_max_tokens_for_thinking(
        base.max_tokens.unwrap_or(0),
        model.max_tokens,
        reasoning,
        options.thinking_budgets.as_ref(),
    );

    stream_anthropic(
        model,
        context,
        AnthropicOptions {
            options: StreamOptions { max_tokens: Some(max_tokens), ..base },
            thinking_enabled: true,
            thinking_budget_tokens: Some(thinking_budget),
            ..Default::default()
        },
    )
}

async fn run(
    model: &Model,
    context: &Context,
    options: &AnthropicOptions,
    sink: &AssistantEventSink,
    output: &mut AssistantMessage,
) -> anyhow::Result<()> {
    let api_key = options
        .options
        .api_key
        .clone()
        .or_else(|| get_env_api_key(&model.provider))
        .unwrap_or_default();

    let body = build_request_body(model, context, options)?;

    debug!(
        model = %model.id,
        thinking = options.thinking_enabled,
        cache_retention = ?options.options.cache_retention,
        "sending anthropic request",
    );

    let interleaved = options.interleaved_thinking.unwrap_or(true);
    let mut betas = vec!["fine-grained-tool-streaming-2025-05-14"];
    if interleaved {
        betas.push("interleaved-thinking-2025-05-14");
    }

    let mut request = reqwest::Client::new()
        .post(format!("{}/v1/messages", model.base_url.trim_end_matches('/')))
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01")
        .header("anthropic-beta", betas.join(","))
        .header("accept", "application/json");
    if let Some(headers) = &model.headers {
        for (name, value) in headers {
            request = request.header(name, value);
        }
    }
    if let Some(headers) = &options.options.headers {
        for (name, value) in headers {
            request = request.header(name, value);
        }
    }

    sink.push(AssistantMessageEvent::Start { partial: output.clone() });

    let request = request.json(&body);
    let mut retried = false;
    let response = loop {
        let attempt = request.try_clone().context("request body must be cloneable")?;
        let response = attempt.send().await.context("Anthropic request failed")?;
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
        bail!("Anthropic error {status}: {text}");
    };

    let mut signal = options.options.signal.clone();
    let mut byte_stream = response.bytes_stream();
    // SSE lines can be split across TCP chunks; carry the remainder forward
    // and only parse complete lines.
    let mut buf = String::new();
    let mut state = SseState::default();

    loop {
        let chunk = match signal.as_mut() {
            Some(sig) => {
                tokio::select! {
                    biased;
                    _ = sig.fired() => {
                        if sig.is_aborted() {
                            return Err(Aborted.into());
                        }
                        // Handle dropped without aborting; stop watching.
                        signal = None;
                        continue;
                    }
                    chunk = byte_stream.next() => chunk,
                }
            }
            None => byte_stream.next().await,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk.context("Anthropic stream read failed")?;
        buf.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buf.find('\n') {
            let line = buf[..pos].trim_end_matches('\r').to_string();
            buf.drain(..=pos);
            let Some(data) = line.strip_prefix("data: ") else { continue };
            let Ok(value) = serde_json::from_str::<Value>(data.trim()) else { continue };
            handle_wire_event(&value, &mut state, output, model, sink)?;
            if state.done {
                return Ok(());
            }
        }
    }

    Ok(())
}

// ─── Request building ─────────────────────────────────────────────────────────

/// Resolve the cache-control marker for the requested retention.
/// `None` disables caching entirely; `long` uses the 1-hour TTL on the
/// first-party endpoint.
fn cache_control(base_url: &str, retention: Option<CacheRetention>) -> Option<Value> {
    match retention.unwrap_or(CacheRetention::Short) {
        CacheRetention::None => None,
        CacheRetention::Short => Some(json!({ "type": "ephemeral" })),
        CacheRetention::Long => {
            if base_url.contains("api.anthropic.com") {
                Some(json!({ "type": "ephemeral", "ttl": "1h" }))
            } else {
                Some(json!({ "type": "ephemeral" }))
            }
        }
    }
}

/// Tool-call ids must match `^[a-zA-Z0-9_-]+$` and fit in 64 chars.
fn normalize_tool_call_id(id: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_-]").expect("must compile"));
    let normalized = invalid.replace_all(id, "_");
    normalized.chars().take(64).collect()
}

fn image_block(data: &str, mime_type: &str) -> Value {
    json!({
        "type": "image",
        "source": { "type": "base64", "media_type": mime_type, "data": data },
    })
}

/// Tool-result content: a plain string when text-only, an array of blocks
/// when images are present.
fn tool_result_content(content: &[ContentPart]) -> Value {
    let has_images = content.iter().any(|c| matches!(c, ContentPart::Image { .. }));
    if !has_images {
        let text: Vec<&str> = content.iter().filter_map(ContentPart::as_text).collect();
        return json!(text.join("\n"));
    }
    let mut blocks: Vec<Value> = content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text, .. } => json!({ "type": "text", "text": text }),
            ContentPart::Image { data, mime_type } => image_block(data, mime_type),
        })
        .collect();
    if !blocks.iter().any(|b| b["type"] == "text") {
        blocks.insert(0, json!({ "type": "text", "text": "(see attached image)" }));
    }
    json!(blocks)
}

pub(crate) fn build_messages(model: &Model, messages: &[Message]) -> Vec<Value> {
    let transformed =
        transform_messages(messages, model, Some(&|id: &str, _: &Model, _: &AssistantMessage| {
            normalize_tool_call_id(id)
        }));

    let mut out: Vec<Value> = Vec::new();
    let mut i = 0;
    while i < transformed.len() {
        match &transformed[i] {
            Message::User(user) => match &user.content {
                UserContent::Text(text) => {
                    if !text.trim().is_empty() {
                        out.push(json!({ "role": "user", "content": text }));
                    }
                }
                UserContent::Parts(parts) => {
                    let blocks: Vec<Value> = parts
                        .iter()
                        .filter_map(|part| match part {
                            ContentPart::Text { text, .. } => {
                                Some(json!({ "type": "text", "text": text }))
                            }
                            ContentPart::Image { data, mime_type } if model.supports_images() => {
                                Some(image_block(data, mime_type))
                            }
                            ContentPart::Image { .. } => None,
                        })
                        .collect();
                    if !blocks.is_empty() {
                        out.push(json!({ "role": "user", "content": blocks }));
                    }
                }
            },

            Message::Assistant(assistant) => {
                let mut blocks: Vec<Value> = Vec::new();
                for block in &assistant.content {
                    match block {
                        AssistantContent::Text { text, .. } => {
                            if !text.trim().is_empty() {
                                blocks.push(json!({ "type": "text", "text": text }));
                            }
                        }
                        AssistantContent::Thinking { thinking, thinking_signature } => {
                            if thinking.trim().is_empty() {
                                continue;
                            }
                            // Signature-bound blocks round-trip natively;
                            // unsigned thinking is resubmitted as text.
                            match thinking_signature {
                                Some(signature) => blocks.push(json!({
                                    "type": "thinking",
                                    "thinking": thinking,
                                    "signature": signature,
                                })),
                                None => {
                                    blocks.push(json!({ "type": "text", "text": thinking }))
                                }
                            }
                        }
                        AssistantContent::ToolCall(call) => blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": Value::Object(call.arguments.clone()),
                        })),
                    }
                }
                if !blocks.is_empty() {
                    out.push(json!({ "role": "assistant", "content": blocks }));
                }
            }

            Message::ToolResult(_) => {
                // Consecutive tool results share one user-role message.
                let mut results: Vec<Value> = Vec::new();
                while let Some(Message::ToolResult(result)) = transformed.get(i) {
                    results.push(json!({
                        "type": "tool_result",
                        "tool_use_id": result.tool_call_id,
                        "content": tool_result_content(&result.content),
                        "is_error": result.is_error,
                    }));
                    i += 1;
                }
                out.push(json!({ "role": "user", "content": results }));
                continue;
            }
        }
        i += 1;
    }
    out
}

/// Attach a cache marker to the last block of the last user message so
/// the conversation prefix is cached up to the current turn.
fn mark_last_user_block(messages: &mut [Value], cache_ctrl: &Value) {
    let Some(last) = messages.last_mut() else { return };
    if last["role"] != "user" {
        return;
    }
    let content = &mut last["content"];
    match content {
        Value::Array(blocks) => {
            if let Some(block) = blocks.last_mut() {
                let kind = block["type"].as_str().unwrap_or("");
                if matches!(kind, "text" | "image" | "tool_result") {
                    block["cache_control"] = cache_ctrl.clone();
                }
            }
        }
        Value::String(text) => {
            let wrapped = json!([{
                "type": "text",
                "text": text.clone(),
                "cache_control": cache_ctrl,
            }]);
            *content = wrapped;
        }
        _ => {}
    }
}

fn build_request_body(
    model: &Model,
    context: &Context,
    options: &AnthropicOptions,
) -> anyhow::Result<Value> {
    let cache_ctrl = cache_control(&model.base_url, options.options.cache_retention);
    let mut messages = build_messages(model, &context.messages);
    if let Some(cache_ctrl) = &cache_ctrl {
        mark_last_user_block(&mut messages, cache_ctrl);
    }

    let mut body = json!({
        "model": model.id,
        "messages": messages,
        "max_tokens": options.options.max_tokens.unwrap_or(model.max_tokens / 3),
        "stream": true,
    });

    if let Some(system_prompt) = &context.system_prompt {
        let mut block = json!({ "type": "text", "text": system_prompt });
        if let Some(cache_ctrl) = &cache_ctrl {
            block["cache_control"] = cache_ctrl.clone();
        }
        body["system"] = json!([block]);
    }

    if let Some(temperature) = options.options.temperature {
        body["temperature"] = json!(temperature);
    }

    if let Some(tools) = &context.tools {
        if !tools.is_empty() {
            let tools: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": {
                            "type": "object",
                            "properties": tool.parameters.get("properties").cloned()
                                .unwrap_or_else(|| json!({})),
                            "required": tool.parameters.get("required").cloned()
                                .unwrap_or_else(|| json!([])),
                        },
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
    }

    if options.thinking_enabled && model.reasoning {
        body["thinking"] = json!({
            "type": "enabled",
            "budget_tokens": options.thinking_budget_tokens.unwrap_or(1024),
        });
    }

    if let Some(tool_choice) = &options.tool_choice {
        body["tool_choice"] = tool_choice.clone();
    }

    Ok(body)
}

// ─── SSE state machine ────────────────────────────────────────────────────────

#[derive(Default)]
struct SseState {
    /// Wire block index → index into `output.content`.
    block_map: HashMap<u64, usize>,
    /// Accumulated raw argument JSON per content index.
    tool_json: HashMap<usize, String>,
    done: bool,
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "end_turn" | "pause_turn" | "stop_sequence" => StopReason::Stop,
        "max_tokens" => StopReason::Length,
        "tool_use" => StopReason::ToolUse,
        _ => StopReason::Error,
    }
}

fn update_usage_totals(model: &Model, output: &mut AssistantMessage) {
    let usage = &mut output.usage;
    usage.total_tokens = usage.input + usage.output + usage.cache_read + usage.cache_write;
    calculate_cost(model, usage);
}

fn handle_wire_event(
    value: &Value,
    state: &mut SseState,
    output: &mut AssistantMessage,
    model: &Model,
    sink: &AssistantEventSink,
) -> anyhow::Result<()> {
    match value["type"].as_str().unwrap_or("") {
        "message_start" => {
            if let Some(usage) = value["message"].get("usage") {
                output.usage.input = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
                output.usage.output = usage["output_tokens"].as_u64().unwrap_or(0) as u32;
                output.usage.cache_read =
                    usage["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32;
                output.usage.cache_write =
                    usage["cache_creation_input_tokens"].as_u64().unwrap_or(0) as u32;
                update_usage_totals(model, output);
            }
        }

        "content_block_start" => {
            let wire_index = value["index"].as_u64().unwrap_or(0);
            let block = &value["content_block"];
            match block["type"].as_str().unwrap_or("") {
                "text" => {
                    output.content.push(AssistantContent::text(""));
                    let content_index = output.content.len() - 1;
                    state.block_map.insert(wire_index, content_index);
                    sink.push(AssistantMessageEvent::TextStart {
                        content_index,
                        partial: output.clone(),
                    });
                }
                "thinking" => {
                    output.content.push(AssistantContent::thinking(""));
                    let content_index = output.content.len() - 1;
                    state.block_map.insert(wire_index, content_index);
                    sink.push(AssistantMessageEvent::ThinkingStart {
                        content_index,
                        partial: output.clone(),
                    });
                }
                "tool_use" => {
                    output.content.push(AssistantContent::ToolCall(ToolCall {
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                        arguments: serde_json::Map::new(),
                        thought_signature: None,
                    }));
                    let content_index = output.content.len() - 1;
                    state.block_map.insert(wire_index, content_index);
                    state.tool_json.insert(content_index, String::new());
                    sink.push(AssistantMessageEvent::ToolcallStart {
                        content_index,
                        partial: output.clone(),
                    });
                }
                _ => {}
            }
        }

        "content_block_delta" => {
            let wire_index = value["index"].as_u64().unwrap_or(0);
            let Some(&content_index) = state.block_map.get(&wire_index) else {
                return Ok(());
            };
            let delta = &value["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let fragment = delta["text"].as_str().unwrap_or("");
                    if let Some(AssistantContent::Text { text, .. }) =
                        output.content.get_mut(content_index)
                    {
                        text.push_str(fragment);
                    }
                    sink.push(AssistantMessageEvent::TextDelta {
                        content_index,
                        delta: fragment.to_string(),
                        partial: output.clone(),
                    });
                }
                "thinking_delta" => {
                    let fragment = delta["thinking"].as_str().unwrap_or("");
                    if let Some(AssistantContent::Thinking { thinking, .. }) =
                        output.content.get_mut(content_index)
                    {
                        thinking.push_str(fragment);
                    }
                    sink.push(AssistantMessageEvent::ThinkingDelta {
                        content_index,
                        delta: fragment.to_string(),
                        partial: output.clone(),
                    });
                }
                "input_json_delta" => {
                    let fragment = delta["partial_json"].as_str().unwrap_or("");
                    let accumulated = state.tool_json.entry(content_index).or_default();
                    accumulated.push_str(fragment);
                    let parsed = parse_streaming_json(accumulated);
                    if let Some(AssistantContent::ToolCall(call)) =
                        output.content.get_mut(content_index)
                    {
                        call.arguments = parsed;
                    }
                    sink.push(AssistantMessageEvent::ToolcallDelta {
                        content_index,
                        delta: fragment.to_string(),
                        partial: output.clone(),
                    });
                }
                // The signature arrives at the end of each thinking block.
                // Opaque server state; accumulated but never surfaced as a
                // delta event.
                "signature_delta" => {
                    let fragment = delta["signature"].as_str().unwrap_or("");
                    if let Some(AssistantContent::Thinking { thinking_signature, .. }) =
                        output.content.get_mut(content_index)
                    {
                        match thinking_signature {
                            Some(signature) => signature.push_str(fragment),
                            None => *thinking_signature = Some(fragment.to_string()),
                        }
                    }
                }
                _ => {}
            }
        }

        "content_block_stop" => {
            let wire_index = value["index"].as_u64().unwrap_or(0);
            let Some(&content_index) = state.block_map.get(&wire_index) else {
                return Ok(());
            };
            // Arguments are frozen at block end from the full accumulated
            // payload, before the snapshot below.
            if let Some(AssistantContent::ToolCall(call)) = output.content.get_mut(content_index)
            {
                let accumulated =
                    state.tool_json.get(&content_index).cloned().unwrap_or_default();
                call.arguments = parse_streaming_json(&accumulated);
            }
            let event = match output.content.get(content_index) {
                Some(AssistantContent::Text { text, .. }) => AssistantMessageEvent::TextEnd {
                    content_index,
                    content: text.clone(),
                    partial: output.clone(),
                },
                Some(AssistantContent::Thinking { thinking, .. }) => {
                    AssistantMessageEvent::ThinkingEnd {
                        content_index,
                        content: thinking.clone(),
                        partial: output.clone(),
                    }
                }
                Some(AssistantContent::ToolCall(call)) => AssistantMessageEvent::ToolcallEnd {
                    content_index,
                    tool_call: call.clone(),
                    partial: output.clone(),
                },
                None => return Ok(()),
            };
            sink.push(event);
        }

        "message_delta" => {
            if let Some(reason) = value["delta"]["stop_reason"].as_str() {
                output.stop_reason = map_stop_reason(reason);
            }
            if let Some(usage) = value.get("usage") {
                if let Some(tokens) = usage["input_tokens"].as_u64() {
                    output.usage.input = tokens as u32;
                }
                if let Some(tokens) = usage["output_tokens"].as_u64() {
                    output.usage.output = tokens as u32;
                }
                if let Some(tokens) = usage["cache_read_input_tokens"].as_u64() {
                    output.usage.cache_read = tokens as u32;
                }
                if let Some(tokens) = usage["cache_creation_input_tokens"].as_u64() {
                    output.usage.cache_write = tokens as u32;
                }
                update_usage_totals(model, output);
            }
        }

        "message_stop" => {
            state.done = true;
        }

        "error" => {
            let message = value["error"]["message"].as_str().unwrap_or("stream error");
            bail!("Anthropic stream error: {message}");
        }

        _ => {}
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InputModality, ModelCost, ToolResultMessage};

    fn model() -> Model {
        Model {
            id: "claude-opus-4-6".into(),
            name: "Claude Opus 4.6".into(),
            api: "anthropic-messages".into(),
            provider: "anthropic".into(),
            base_url: "https://api.anthropic.com".into(),
            reasoning: true,
            input: vec![InputModality::Text, InputModality::Image],
            cost: ModelCost { input: 5.0, output: 25.0, cache_read: 0.5, cache_write: 6.25 },
            context_window: 200_000,
            max_tokens: 64_000,
            headers: None,
            compat: None,
        }
    }

    async fn drive(events: &[Value]) -> (Vec<AssistantMessageEvent>, AssistantMessage) {
        let (sink, mut stream) = assistant_event_stream();
        let m = model();
        let mut output = AssistantMessage::empty(&m);
        let mut state = SseState::default();
        for event in events {
            handle_wire_event(event, &mut state, &mut output, &m, &sink).unwrap();
        }
        finish(&sink, &mut output);
        let mut collected = Vec::new();
        while let Some(event) = stream.next().await {
            collected.push(event);
        }
        (collected, output)
    }

    // ── Stop-reason mapping ───────────────────────────────────────────────────

    #[test]
    fn stop_reasons_map_to_canonical_values() {
        assert_eq!(map_stop_reason("end_turn"), StopReason::Stop);
        assert_eq!(map_stop_reason("stop_sequence"), StopReason::Stop);
        assert_eq!(map_stop_reason("pause_turn"), StopReason::Stop);
        assert_eq!(map_stop_reason("max_tokens"), StopReason::Length);
        assert_eq!(map_stop_reason("tool_use"), StopReason::ToolUse);
        assert_eq!(map_stop_reason("refusal"), StopReason::Error);
        assert_eq!(map_stop_reason("sensitive"), StopReason::Error);
    }

    // ── Wire-event translation ────────────────────────────────────────────────

    #[tokio::test]
    async fn text_block_lifecycle_produces_bracketed_events() {
        let (events, output) = drive(&[
            json!({ "type": "content_block_start", "index": 0,
                    "content_block": { "type": "text", "text": "" } }),
            json!({ "type": "content_block_delta", "index": 0,
                    "delta": { "type": "text_delta", "text": "hel" } }),
            json!({ "type": "content_block_delta", "index": 0,
                    "delta": { "type": "text_delta", "text": "lo" } }),
            json!({ "type": "content_block_stop", "index": 0 }),
            json!({ "type": "message_delta", "delta": { "stop_reason": "end_turn" } }),
            json!({ "type": "message_stop" }),
        ]).await;
        assert!(matches!(events[0], AssistantMessageEvent::TextStart { content_index: 0, .. }));
        assert!(matches!(
            &events[1],
            AssistantMessageEvent::TextDelta { delta, .. } if delta == "hel"
        ));
        assert!(matches!(
            &events[3],
            AssistantMessageEvent::TextEnd { content, .. } if content == "hello"
        ));
        assert!(matches!(events.last().unwrap(), AssistantMessageEvent::Done { reason: DoneReason::Stop, .. }));
        assert_eq!(output.text(), "hello");
    }

    #[tokio::test]
    async fn tool_use_arguments_accumulate_and_freeze_at_block_stop() {
        let (events, output) = drive(&[
            json!({ "type": "content_block_start", "index": 0,
                    "content_block": { "type": "tool_use", "id": "toolu_1", "name": "search" } }),
            json!({ "type": "content_block_delta", "index": 0,
                    "delta": { "type": "input_json_delta", "partial_json": "{\"query\": \"ru" } }),
            json!({ "type": "content_block_delta", "index": 0,
                    "delta": { "type": "input_json_delta", "partial_json": "st\"}" } }),
            json!({ "type": "content_block_stop", "index": 0 }),
            json!({ "type": "message_delta", "delta": { "stop_reason": "tool_use" } }),
            json!({ "type": "message_stop" }),
        ]).await;
        let end = events.iter().find_map(|e| match e {
            AssistantMessageEvent::ToolcallEnd { tool_call, .. } => Some(tool_call.clone()),
            _ => None,
        });
        let call = end.expect("must emit toolcall_end");
        assert_eq!(call.id, "toolu_1");
        assert_eq!(call.arguments["query"], "rust");
        assert_eq!(output.stop_reason, StopReason::ToolUse);
        assert!(matches!(
            events.last().unwrap(),
            AssistantMessageEvent::Done { reason: DoneReason::ToolUse, .. }
        ));
    }

    #[tokio::test]
    async fn partial_tool_arguments_visible_mid_stream() {
        let (events, _) = drive(&[
            json!({ "type": "content_block_start", "index": 0,
                    "content_block": { "type": "tool_use", "id": "t", "name": "search" } }),
            json!({ "type": "content_block_delta", "index": 0,
                    "delta": { "type": "input_json_delta", "partial_json": "{\"query\": \"par" } }),
        ]).await;
        let delta_partial = events.iter().find_map(|e| match e {
            AssistantMessageEvent::ToolcallDelta { partial, .. } => Some(partial.clone()),
            _ => None,
        });
        let partial = delta_partial.expect("must emit toolcall_delta");
        let call = partial.tool_calls()[0];
        assert_eq!(call.arguments["query"], "par", "tolerant parse of the open string");
    }

    #[tokio::test]
    async fn thinking_block_collects_signature_without_emitting_it() {
        let (events, output) = drive(&[
            json!({ "type": "content_block_start", "index": 0,
                    "content_block": { "type": "thinking" } }),
            json!({ "type": "content_block_delta", "index": 0,
                    "delta": { "type": "thinking_delta", "thinking": "let me think" } }),
            json!({ "type": "content_block_delta", "index": 0,
                    "delta": { "type": "signature_delta", "signature": "EqRk" } }),
            json!({ "type": "content_block_stop", "index": 0 }),
            json!({ "type": "message_stop" }),
        ]).await;
        assert!(matches!(
            &output.content[0],
            AssistantContent::Thinking { thinking, thinking_signature: Some(sig) }
                if thinking == "let me think" && sig == "EqRk"
        ));
        // No event mentions the signature; only start/delta/end for thinking.
        let kinds: Vec<_> = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    AssistantMessageEvent::ThinkingStart { .. }
                        | AssistantMessageEvent::ThinkingDelta { .. }
                        | AssistantMessageEvent::ThinkingEnd { .. }
                )
            })
            .collect();
        assert_eq!(kinds.len(), 3);
    }

    #[tokio::test]
    async fn usage_updates_recompute_totals_and_cost() {
        let (_, output) = drive(&[
            json!({ "type": "message_start", "message": { "usage": {
                "input_tokens": 100, "output_tokens": 0,
                "cache_read_input_tokens": 50, "cache_creation_input_tokens": 10 } } }),
            json!({ "type": "message_delta", "usage": { "output_tokens": 20 } }),
            json!({ "type": "message_stop" }),
        ]).await;
        assert_eq!(output.usage.input, 100);
        assert_eq!(output.usage.output, 20);
        assert_eq!(output.usage.cache_read, 50);
        assert_eq!(output.usage.cache_write, 10);
        assert_eq!(output.usage.total_tokens, 180);
        let cost = &output.usage.cost;
        assert!((cost.total - (cost.input + cost.output + cost.cache_read + cost.cache_write)).abs() < 1e-12);
    }

    #[test]
    fn wire_error_event_becomes_bail() {
        let (sink, _stream) = assistant_event_stream();
        let m = model();
        let mut output = AssistantMessage::empty(&m);
        let mut state = SseState::default();
        let result = handle_wire_event(
            &json!({ "type": "error", "error": { "message": "overloaded" } }),
            &mut state,
            &mut output,
            &m,
            &sink,
        );
        assert!(result.unwrap_err().to_string().contains("overloaded"));
    }

    #[tokio::test]
    async fn finish_reconciles_tool_use_stop_reason_with_content() {
        // Wire said end_turn but a tool call is present.
        let (_, output) = drive(&[
            json!({ "type": "content_block_start", "index": 0,
                    "content_block": { "type": "tool_use", "id": "t", "name": "f" } }),
            json!({ "type": "content_block_stop", "index": 0 }),
            json!({ "type": "message_delta", "delta": { "stop_reason": "end_turn" } }),
            json!({ "type": "message_stop" }),
        ]).await;
        assert_eq!(output.stop_reason, StopReason::ToolUse);
    }

    // ── Request building ──────────────────────────────────────────────────────

    #[test]
    fn plain_user_message_serialized_as_string_content() {
        let messages = build_messages(&model(), &[Message::user("hello")]);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "hello");
    }

    #[test]
    fn consecutive_tool_results_grouped_into_one_user_message() {
        let mk = |id: &str| {
            Message::ToolResult(ToolResultMessage {
                tool_call_id: id.into(),
                tool_name: "t".into(),
                content: vec![ContentPart::text("ok")],
                details: None,
                is_error: false,
                timestamp: 0,
            })
        };
        let mut assistant = AssistantMessage::empty(&model());
        assistant.content.push(AssistantContent::ToolCall(ToolCall {
            id: "a".into(),
            name: "t".into(),
            arguments: serde_json::Map::new(),
            thought_signature: None,
        }));
        assistant.content.push(AssistantContent::ToolCall(ToolCall {
            id: "b".into(),
            name: "t".into(),
            arguments: serde_json::Map::new(),
            thought_signature: None,
        }));
        assistant.stop_reason = StopReason::ToolUse;
        let messages =
            build_messages(&model(), &[Message::Assistant(assistant), mk("a"), mk("b")]);
        assert_eq!(messages.len(), 2);
        let results = messages[1]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_use_id"], "a");
        assert_eq!(results[1]["tool_use_id"], "b");
    }

    #[test]
    fn unsigned_thinking_resubmitted_as_text() {
        let mut assistant = AssistantMessage::empty(&model());
        assistant.content.push(AssistantContent::thinking("my chain of thought"));
        let messages = build_messages(&model(), &[Message::Assistant(assistant)]);
        let block = &messages[0]["content"][0];
        assert_eq!(block["type"], "text");
        assert_eq!(block["text"], "my chain of thought");
    }

    #[test]
    fn cache_control_default_is_short_ephemeral() {
        let ctrl = cache_control("https://api.anthropic.com", None).unwrap();
        assert_eq!(ctrl["type"], "ephemeral");
        assert!(ctrl.get("ttl").is_none());
    }

    #[test]
    fn cache_control_long_uses_extended_ttl_on_first_party_only() {
        let ctrl = cache_control("https://api.anthropic.com", Some(CacheRetention::Long)).unwrap();
        assert_eq!(ctrl["ttl"], "1h");
        let ctrl = cache_control("https://proxy.example.com", Some(CacheRetention::Long)).unwrap();
        assert!(ctrl.get("ttl").is_none());
    }

    #[test]
    fn cache_control_none_disables_markers() {
        assert!(cache_control("https://api.anthropic.com", Some(CacheRetention::None)).is_none());
    }

    #[test]
    fn string_user_tail_wrapped_into_text_block_for_cache_marker() {
        let mut messages = vec![json!({ "role": "user", "content": "hi" })];
        mark_last_user_block(&mut messages, &json!({ "type": "ephemeral" }));
        let block = &messages[0]["content"][0];
        assert_eq!(block["type"], "text");
        assert_eq!(block["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn thinking_body_included_when_enabled() {
        let context = Context {
            system_prompt: Some("be brief".into()),
            messages: vec![Message::user("hi")],
            tools: None,
        };
        let options = AnthropicOptions {
            thinking_enabled: true,
            thinking_budget_tokens: Some(2048),
            ..Default::default()
        };
        let body = build_request_body(&model(), &context, &options).unwrap();
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], 2048);
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn tool_call_id_normalization_is_idempotent() {
        let once = normalize_tool_call_id("call|weird:chars");
        let twice = normalize_tool_call_id(&once);
        assert_eq!(once, "call_weird_chars");
        assert_eq!(once, twice);
        assert!(normalize_tool_call_id(&"x".repeat(100)).len() <= 64);
    }
}
