// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic scripted transport for tests.
//!
//! Produces the same canonical event sequence a real provider transport
//! would, from pre-scripted turns, so agent-level scenarios run without
//! network access and with exact, repeatable event traces.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::event_stream::{assistant_event_stream, AssistantMessageStream};
use crate::json_parse::parse_streaming_json;
use crate::types::{
    AssistantContent, AssistantMessage, AssistantMessageEvent, Context, DoneReason, ErrorReason,
    Model, SimpleStreamOptions, StopReason, ToolCall, Usage,
};

/// One scripted piece of an assistant turn.
#[derive(Debug, Clone)]
pub enum ScriptedSegment {
    /// Text streamed as the given delta fragments.
    Text(Vec<String>),
    Thinking(String),
    /// A tool call whose raw argument JSON arrives as one delta.
    ToolCall { id: String, name: String, arguments: String },
    /// Fail the turn with a transport error.
    Error(String),
    /// Fail the turn as externally aborted.
    Aborted,
}

/// A pre-scripted stream function.  Each call pops the next script; when
/// the scripts run out a fallback text turn is produced.
pub struct ScriptedStreamFn {
    scripts: Arc<Mutex<VecDeque<Vec<ScriptedSegment>>>>,
    /// The last context seen, for asserting what was sent to the "model".
    pub last_context: Arc<Mutex<Option<Context>>>,
}

impl ScriptedStreamFn {
    pub fn new(scripts: Vec<Vec<ScriptedSegment>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            last_context: Arc::new(Mutex::new(None)),
        }
    }

    /// A single text-only turn.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![ScriptedSegment::Text(vec![reply.into()])]])
    }

    /// Turn one: a tool call.  Turn two: a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![ScriptedSegment::ToolCall {
                id: tool_id.into(),
                name: tool_name.into(),
                arguments: args_json.into(),
            }],
            vec![ScriptedSegment::Text(vec![final_text.into()])],
        ])
    }

    /// Produce the canonical stream for the next scripted turn.
    pub fn stream(
        &self,
        model: &Model,
        context: &Context,
        _options: SimpleStreamOptions,
    ) -> AssistantMessageStream {
        *self.last_context.lock().unwrap() = Some(context.clone());
        let segments = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![ScriptedSegment::Text(vec!["[no more scripts]".into()])]);

        let (sink, stream) = assistant_event_stream();
        let mut output = AssistantMessage::empty(model);
        sink.push(AssistantMessageEvent::Start { partial: output.clone() });

        for segment in segments {
            match segment {
                ScriptedSegment::Text(deltas) => {
                    output.content.push(AssistantContent::text(""));
                    let content_index = output.content.len() - 1;
                    sink.push(AssistantMessageEvent::TextStart {
                        content_index,
                        partial: output.clone(),
                    });
                    let mut full = String::new();
                    for delta in deltas {
                        full.push_str(&delta);
                        if let Some(AssistantContent::Text { text, .. }) =
                            output.content.last_mut()
                        {
                            text.push_str(&delta);
                        }
                        sink.push(AssistantMessageEvent::TextDelta {
                            content_index,
                            delta,
                            partial: output.clone(),
                        });
                    }
                    sink.push(AssistantMessageEvent::TextEnd {
                        content_index,
                        content: full,
                        partial: output.clone(),
                    });
                }
                ScriptedSegment::Thinking(thinking) => {
                    output.content.push(AssistantContent::thinking(""));
                    let content_index = output.content.len() - 1;
                    sink.push(AssistantMessageEvent::ThinkingStart {
                        content_index,
                        partial: output.clone(),
                    });
                    if let Some(AssistantContent::Thinking { thinking: t, .. }) =
                        output.content.last_mut()
                    {
                        t.push_str(&thinking);
                    }
                    sink.push(AssistantMessageEvent::ThinkingDelta {
                        content_index,
                        delta: thinking.clone(),
                        partial: output.clone(),
                    });
                    sink.push(AssistantMessageEvent::ThinkingEnd {
                        content_index,
                        content: thinking,
                        partial: output.clone(),
                    });
                }
                ScriptedSegment::ToolCall { id, name, arguments } => {
                    output.content.push(AssistantContent::ToolCall(ToolCall {
                        id,
                        name,
                        arguments: serde_json::Map::new(),
                        thought_signature: None,
                    }));
                    let content_index = output.content.len() - 1;
                    sink.push(AssistantMessageEvent::ToolcallStart {
                        content_index,
                        partial: output.clone(),
                    });
                    let parsed = parse_streaming_json(&arguments);
                    if let Some(AssistantContent::ToolCall(call)) = output.content.last_mut() {
                        call.arguments = parsed;
                    }
                    sink.push(AssistantMessageEvent::ToolcallDelta {
                        content_index,
                        delta: arguments,
                        partial: output.clone(),
                    });
                    let tool_call = match output.content.last() {
                        Some(AssistantContent::ToolCall(call)) => call.clone(),
                        _ => unreachable!("tool call was just pushed"),
                    };
                    sink.push(AssistantMessageEvent::ToolcallEnd {
                        content_index,
                        tool_call,
                        partial: output.clone(),
                    });
                }
                ScriptedSegment::Error(message) => {
                    output.stop_reason = StopReason::Error;
                    output.error_message = Some(message);
                    sink.push(AssistantMessageEvent::Error {
                        reason: ErrorReason::Error,
                        error: output,
                    });
                    sink.end(None);
                    return stream;
                }
                ScriptedSegment::Aborted => {
                    output.stop_reason = StopReason::Aborted;
                    sink.push(AssistantMessageEvent::Error {
                        reason: ErrorReason::Aborted,
                        error: output,
                    });
                    sink.end(None);
                    return stream;
                }
            }
        }

        output.usage = Usage { input: 5, output: 5, total_tokens: 10, ..Usage::default() };
        let reason = if output.tool_calls().is_empty() {
            output.stop_reason = StopReason::Stop;
            DoneReason::Stop
        } else {
            output.stop_reason = StopReason::ToolUse;
            DoneReason::ToolUse
        };
        sink.push(AssistantMessageEvent::Done { reason, message: output });
        sink.end(None);
        stream
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
