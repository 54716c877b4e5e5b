// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Proxy stream function for apps that route LLM calls through a server.
//!
//! The server forwards the canonical event stream over SSE but strips the
//! partial-message snapshots to save bandwidth; this client reconstructs
//! the partial locally by applying deltas exactly the way the native
//! transports do, so downstream consumers cannot tell the difference.

use std::collections::HashMap;

use anyhow::{bail, Context as AnyhowContext};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Map;

use skein_ai::{
    assistant_event_stream, AssistantContent, AssistantMessage, AssistantMessageEvent,
    AssistantMessageStream, Context, DoneReason, ErrorReason, Model, SimpleStreamOptions,
    StopReason, ToolCall, Usage,
};

/// Options for the proxy transport.
#[derive(Debug, Clone)]
pub struct ProxyStreamOptions {
    pub options: SimpleStreamOptions,
    /// Bearer token for the proxy server.
    pub auth_token: String,
    /// Proxy server base URL.
    pub proxy_url: String,
}

/// Wire events received from the proxy.  Mirrors the canonical event
/// taxonomy minus the partial snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyEvent {
    Start,
    TextStart {
        content_index: usize,
    },
    TextDelta {
        content_index: usize,
        delta: String,
    },
    TextEnd {
        content_index: usize,
        #[serde(default)]
        content_signature: Option<String>,
    },
    ThinkingStart {
        content_index: usize,
    },
    ThinkingDelta {
        content_index: usize,
        delta: String,
    },
    ThinkingEnd {
        content_index: usize,
        #[serde(default)]
        content_signature: Option<String>,
    },
    ToolcallStart {
        content_index: usize,
        id: String,
        tool_name: String,
    },
    ToolcallDelta {
        content_index: usize,
        delta: String,
    },
    ToolcallEnd {
        content_index: usize,
    },
    Done {
        reason: DoneReason,
        usage: Usage,
    },
    Error {
        reason: ErrorReason,
        #[serde(default)]
        error_message: Option<String>,
        usage: Usage,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("request aborted")]
struct Aborted;

/// Stream an assistant message through the proxy server.
pub fn stream_proxy(
    model: &Model,
    context: &Context,
    options: ProxyStreamOptions,
) -> AssistantMessageStream {
    let (sink, stream) = assistant_event_stream();
    let model = model.clone();
    let context = context.clone();

    tokio::spawn(async move {
        let mut partial = AssistantMessage::empty(&model);
        let mut started = false;
        match run(&model, &context, &options, &sink, &mut partial, &mut started).await {
            Ok(()) => sink.end(None),
            Err(error) => {
                // A failure before the server's own `start` event still
                // opens the canonical sequence.
                if !started {
                    sink.push(AssistantMessageEvent::Start { partial: partial.clone() });
                }
                if error.is::<Aborted>() {
                    partial.stop_reason = StopReason::Aborted;
                    sink.push(AssistantMessageEvent::Error {
                        reason: ErrorReason::Aborted,
                        error: partial,
                    });
                } else {
                    partial.stop_reason = StopReason::Error;
                    partial.error_message = Some(error.to_string());
                    sink.push(AssistantMessageEvent::Error {
                        reason: ErrorReason::Error,
                        error: partial,
                    });
                }
                sink.end(None);
            }
        }
    });

    stream
}

async fn run(
    model: &Model,
    context: &Context,
    options: &ProxyStreamOptions,
    sink: &skein_ai::AssistantEventSink,
    partial: &mut AssistantMessage,
    started: &mut bool,
) -> anyhow::Result<()> {
    let body = serde_json::json!({
        "model": model,
        "context": context,
        "options": {
            "temperature": options.options.options.temperature,
            "max_tokens": options.options.options.max_tokens,
            "reasoning": options.options.reasoning,
        },
    });

    let response = reqwest::Client::new()
        .post(format!("{}/api/stream", options.proxy_url.trim_end_matches('/')))
        .bearer_auth(&options.auth_token)
        .json(&body)
        .send()
        .await
        .context("proxy request failed")?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v["error"].as_str().map(str::to_string));
        match detail {
            Some(detail) => bail!("Proxy error: {detail}"),
            None => bail!("Proxy error: {status}"),
        }
    }

    let mut signal = options.options.options.signal.clone();
    let mut byte_stream = response.bytes_stream();
    let mut buf = String::new();
    // Raw tool-call argument JSON per content index.
    let mut tool_json: HashMap<usize, String> = HashMap::new();

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
        let chunk = chunk.context("proxy stream read failed")?;
        buf.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buf.find('\n') {
            let line = buf[..pos].trim_end_matches('\r').to_string();
            buf.drain(..=pos);
            let Some(data) = line.strip_prefix("data: ") else { continue };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            let event: ProxyEvent =
                serde_json::from_str(data).context("malformed proxy event")?;
            if let Some(canonical) = apply_proxy_event(event, partial, &mut tool_json)? {
                sink.push(canonical);
                *started = true;
            }
        }
    }

    Ok(())
}

/// Apply one proxy event to the locally reconstructed partial and return
/// the canonical event to emit, if any.
fn apply_proxy_event(
    event: ProxyEvent,
    partial: &mut AssistantMessage,
    tool_json: &mut HashMap<usize, String>,
) -> anyhow::Result<Option<AssistantMessageEvent>> {
    let canonical = match event {
        ProxyEvent::Start => AssistantMessageEvent::Start { partial: partial.clone() },

        ProxyEvent::TextStart { content_index } => {
            insert_block(partial, content_index, AssistantContent::text(""));
            AssistantMessageEvent::TextStart { content_index, partial: partial.clone() }
        }
        ProxyEvent::TextDelta { content_index, delta } => {
            match partial.content.get_mut(content_index) {
                Some(AssistantContent::Text { text, .. }) => text.push_str(&delta),
                _ => bail!("received text_delta for non-text content"),
            }
            AssistantMessageEvent::TextDelta {
                content_index,
                delta,
                partial: partial.clone(),
            }
        }
        ProxyEvent::TextEnd { content_index, content_signature } => {
            let content = match partial.content.get_mut(content_index) {
                Some(AssistantContent::Text { text, text_signature }) => {
                    *text_signature = content_signature;
                    text.clone()
                }
                _ => bail!("received text_end for non-text content"),
            };
            AssistantMessageEvent::TextEnd { content_index, content, partial: partial.clone() }
        }

        ProxyEvent::ThinkingStart { content_index } => {
            insert_block(partial, content_index, AssistantContent::thinking(""));
            AssistantMessageEvent::ThinkingStart { content_index, partial: partial.clone() }
        }
        ProxyEvent::ThinkingDelta { content_index, delta } => {
            match partial.content.get_mut(content_index) {
                Some(AssistantContent::Thinking { thinking, .. }) => thinking.push_str(&delta),
                _ => bail!("received thinking_delta for non-thinking content"),
            }
            AssistantMessageEvent::ThinkingDelta {
                content_index,
                delta,
                partial: partial.clone(),
            }
        }
        ProxyEvent::ThinkingEnd { content_index, content_signature } => {
            let content = match partial.content.get_mut(content_index) {
                Some(AssistantContent::Thinking { thinking, thinking_signature }) => {
                    *thinking_signature = content_signature;
                    thinking.clone()
                }
                _ => bail!("received thinking_end for non-thinking content"),
            };
            AssistantMessageEvent::ThinkingEnd {
                content_index,
                content,
                partial: partial.clone(),
            }
        }

        ProxyEvent::ToolcallStart { content_index, id, tool_name } => {
            insert_block(
                partial,
                content_index,
                AssistantContent::ToolCall(ToolCall {
                    id,
                    name: tool_name,
                    arguments: Map::new(),
                    thought_signature: None,
                }),
            );
            tool_json.insert(content_index, String::new());
            AssistantMessageEvent::ToolcallStart { content_index, partial: partial.clone() }
        }
        ProxyEvent::ToolcallDelta { content_index, delta } => {
            let accumulated = tool_json.entry(content_index).or_default();
            accumulated.push_str(&delta);
            let parsed = skein_ai::parse_streaming_json(accumulated);
            match partial.content.get_mut(content_index) {
                Some(AssistantContent::ToolCall(call)) => call.arguments = parsed,
                _ => bail!("received toolcall_delta for non-toolCall content"),
            }
            AssistantMessageEvent::ToolcallDelta {
                content_index,
                delta,
                partial: partial.clone(),
            }
        }
        ProxyEvent::ToolcallEnd { content_index } => {
            let tool_call = match partial.content.get(content_index) {
                Some(AssistantContent::ToolCall(call)) => call.clone(),
                _ => return Ok(None),
            };
            tool_json.remove(&content_index);
            AssistantMessageEvent::ToolcallEnd {
                content_index,
                tool_call,
                partial: partial.clone(),
            }
        }

        ProxyEvent::Done { reason, usage } => {
            partial.stop_reason = match reason {
                DoneReason::Stop => StopReason::Stop,
                DoneReason::Length => StopReason::Length,
                DoneReason::ToolUse => StopReason::ToolUse,
            };
            partial.usage = usage;
            AssistantMessageEvent::Done { reason, message: partial.clone() }
        }
        ProxyEvent::Error { reason, error_message, usage } => {
            partial.stop_reason = match reason {
                ErrorReason::Aborted => StopReason::Aborted,
                ErrorReason::Error => StopReason::Error,
            };
            partial.error_message = error_message;
            partial.usage = usage;
            AssistantMessageEvent::Error { reason, error: partial.clone() }
        }
    };
    Ok(Some(canonical))
}

fn insert_block(partial: &mut AssistantMessage, content_index: usize, block: AssistantContent) {
    let index = content_index.min(partial.content.len());
    partial.content.insert(index, block);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
