// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent conversation loop.
//!
//! One run covers one `prompt`/`continue`: the loop streams assistant
//! turns, dispatches tool calls sequentially, injects steering messages at
//! the next safe boundary, and re-opens for queued follow-ups when the
//! conversation would otherwise end.  Everything observable is emitted as
//! an ordered [`AgentEvent`] stream terminating in `agent_end` with the
//! messages added during the run.

use skein_ai::{
    event_stream, now_ms, AbortSignal, AssistantMessage, AssistantMessageEvent, ContentPart,
    Context, EventSink, EventStream, Message, SimpleStreamOptions, StopReason, StreamOptions,
    ToolCall, ToolResultMessage, validate_tool_arguments,
};
use std::sync::Arc;
use tracing::warn;

use crate::types::{
    AgentContext, AgentError, AgentEvent, AgentLoopConfig, AgentMessage, AgentStreamFn,
    AgentTool, AgentToolResult, MessageSourceFn, ToolUpdateFn,
};

/// Stream of agent events; the terminal result is the list of messages
/// the run appended.
pub type AgentEventStream = EventStream<AgentEvent, Vec<AgentMessage>>;
pub type AgentEventSink = EventSink<AgentEvent, Vec<AgentMessage>>;

pub fn agent_event_stream() -> (AgentEventSink, AgentEventStream) {
    event_stream(
        |event: &AgentEvent| matches!(event, AgentEvent::AgentEnd { .. }),
        |event: &AgentEvent| match event {
            AgentEvent::AgentEnd { messages } => Some(messages.clone()),
            _ => None,
        },
    )
}

/// Start an agent run with new prompt messages.
///
/// The prompts are appended to the context and echoed as
/// `message_start`/`message_end` before the first assistant turn.
pub fn agent_loop(
    prompts: Vec<AgentMessage>,
    context: AgentContext,
    config: AgentLoopConfig,
    signal: Option<AbortSignal>,
    stream_fn: AgentStreamFn,
) -> AgentEventStream {
    let (sink, stream) = agent_event_stream();

    tokio::spawn(async move {
        let mut ctx = context;
        let new_messages: Vec<AgentMessage> = prompts.clone();
        ctx.messages.extend(prompts.iter().cloned());

        sink.push(AgentEvent::AgentStart);
        sink.push(AgentEvent::TurnStart);
        for prompt in prompts {
            sink.push(AgentEvent::MessageStart { message: prompt.clone() });
            sink.push(AgentEvent::MessageEnd { message: prompt });
        }

        run_loop(ctx, new_messages, config, signal, &sink, stream_fn).await;
    });

    stream
}

/// Continue a run from the existing context without adding a message.
/// Used to retry after the caller repaired an overflow.
///
/// The context must end in something the model can answer: an errored or
/// aborted assistant tail is treated as non-final because the transform
/// layer filters it before resend.
pub fn agent_loop_continue(
    context: AgentContext,
    config: AgentLoopConfig,
    signal: Option<AbortSignal>,
    stream_fn: AgentStreamFn,
) -> Result<AgentEventStream, AgentError> {
    if context.messages.is_empty() {
        return Err(AgentError::EmptyHistory);
    }
    if let Some(Message::Assistant(assistant)) = context.messages.last() {
        if !matches!(assistant.stop_reason, StopReason::Error | StopReason::Aborted) {
            return Err(AgentError::LastMessageIsAssistant);
        }
    }

    let (sink, stream) = agent_event_stream();

    tokio::spawn(async move {
        sink.push(AgentEvent::AgentStart);
        sink.push(AgentEvent::TurnStart);
        run_loop(context, Vec::new(), config, signal, &sink, stream_fn).await;
    });

    Ok(stream)
}

fn is_aborted(signal: &Option<AbortSignal>) -> bool {
    signal.as_ref().is_some_and(AbortSignal::is_aborted)
}

async fn poll(source: &Option<MessageSourceFn>) -> Vec<AgentMessage> {
    match source {
        Some(source) => source().await,
        None => Vec::new(),
    }
}

fn end_run(sink: &AgentEventSink, new_messages: Vec<AgentMessage>) {
    sink.push(AgentEvent::AgentEnd { messages: new_messages.clone() });
    sink.end(Some(new_messages));
}

async fn run_loop(
    mut ctx: AgentContext,
    mut new_messages: Vec<AgentMessage>,
    config: AgentLoopConfig,
    signal: Option<AbortSignal>,
    sink: &AgentEventSink,
    stream_fn: AgentStreamFn,
) {
    let mut first_turn = true;
    let mut pending = poll(&config.get_steering_messages).await;

    // Outer loop: re-opened by queued follow-up messages.
    loop {
        let mut has_more_tool_calls = true;

        // Inner loop: one assistant turn plus its tool executions.
        while has_more_tool_calls || !pending.is_empty() {
            if is_aborted(&signal) {
                return end_run(sink, new_messages);
            }

            if first_turn {
                first_turn = false;
            } else {
                sink.push(AgentEvent::TurnStart);
            }

            for message in pending.drain(..) {
                sink.push(AgentEvent::MessageStart { message: message.clone() });
                sink.push(AgentEvent::MessageEnd { message: message.clone() });
                ctx.messages.push(message.clone());
                new_messages.push(message);
            }

            let assistant =
                stream_assistant(&mut ctx, &config, &signal, sink, &stream_fn).await;
            new_messages.push(Message::Assistant(assistant.clone()));

            if matches!(assistant.stop_reason, StopReason::Error | StopReason::Aborted) {
                sink.push(AgentEvent::TurnEnd {
                    message: Message::Assistant(assistant),
                    tool_results: vec![],
                });
                return end_run(sink, new_messages);
            }

            let tool_calls: Vec<ToolCall> =
                assistant.tool_calls().into_iter().cloned().collect();
            has_more_tool_calls = !tool_calls.is_empty();

            let mut tool_results: Vec<ToolResultMessage> = Vec::new();
            let mut steering_after_tools: Option<Vec<AgentMessage>> = None;
            let mut aborted_in_tools = false;

            if has_more_tool_calls {
                if is_aborted(&signal) {
                    return end_run(sink, new_messages);
                }
                let execution =
                    execute_tool_calls(&ctx.tools, &tool_calls, &signal, sink, &config).await;
                tool_results = execution.results;
                steering_after_tools = execution.steering;
                aborted_in_tools = execution.aborted;

                for result in &tool_results {
                    ctx.messages.push(Message::ToolResult(result.clone()));
                    new_messages.push(Message::ToolResult(result.clone()));
                }
            }

            sink.push(AgentEvent::TurnEnd {
                message: Message::Assistant(assistant),
                tool_results,
            });

            if aborted_in_tools {
                return end_run(sink, new_messages);
            }

            pending = match steering_after_tools {
                Some(steering) => steering,
                None => poll(&config.get_steering_messages).await,
            };
        }

        // The run would stop here; queued follow-ups re-open it.
        let follow_ups = poll(&config.get_follow_up_messages).await;
        if follow_ups.is_empty() {
            break;
        }
        pending = follow_ups;
    }

    end_run(sink, new_messages);
}

// ─── Assistant streaming ──────────────────────────────────────────────────────

async fn stream_assistant(
    ctx: &mut AgentContext,
    config: &AgentLoopConfig,
    signal: &Option<AbortSignal>,
    sink: &AgentEventSink,
    stream_fn: &AgentStreamFn,
) -> AssistantMessage {
    let mut messages = ctx.messages.clone();
    if let Some(transform) = &config.transform_context {
        messages = transform(messages, signal.clone()).await;
    }
    let llm_messages = (config.convert_to_llm)(&messages);

    let llm_context = Context {
        system_prompt: if ctx.system_prompt.is_empty() {
            None
        } else {
            Some(ctx.system_prompt.clone())
        },
        messages: llm_messages,
        tools: if ctx.tools.is_empty() {
            None
        } else {
            Some(ctx.tools.iter().map(AgentTool::schema).collect())
        },
    };

    let api_key = match &config.get_api_key {
        Some(resolve) => resolve(&config.model.provider).or_else(|| config.api_key.clone()),
        None => config.api_key.clone(),
    };

    let options = SimpleStreamOptions {
        options: StreamOptions {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            api_key,
            cache_retention: config.cache_retention,
            session_id: config.session_id.clone(),
            headers: config.headers.clone(),
            max_retry_delay_ms: config.max_retry_delay_ms,
            signal: signal.clone(),
        },
        reasoning: config.reasoning,
        thinking_budgets: config.thinking_budgets.clone(),
    };

    let mut response = (stream_fn)(&config.model, &llm_context, options);
    let mut added_partial = false;

    while let Some(event) = response.next().await {
        match &event {
            AssistantMessageEvent::Start { partial } => {
                ctx.messages.push(Message::Assistant(partial.clone()));
                added_partial = true;
                sink.push(AgentEvent::MessageStart {
                    message: Message::Assistant(partial.clone()),
                });
            }
            AssistantMessageEvent::Done { .. } | AssistantMessageEvent::Error { .. } => break,
            _ => {
                if added_partial {
                    if let Some(partial) = event.partial() {
                        let partial = partial.clone();
                        if let Some(last) = ctx.messages.last_mut() {
                            *last = Message::Assistant(partial.clone());
                        }
                        sink.push(AgentEvent::MessageUpdate {
                            message: Message::Assistant(partial),
                            event: event.clone(),
                        });
                    }
                }
            }
        }
    }

    let final_message = match response.result().await {
        Ok(message) => message,
        // The transport dropped without a terminal event; treat as a
        // transport failure so the run terminates observably.
        Err(error) => {
            warn!(%error, "transport stream closed without a terminal result");
            AssistantMessage::errored(&config.model, StopReason::Error, error.to_string())
        }
    };

    if added_partial {
        if let Some(last) = ctx.messages.last_mut() {
            *last = Message::Assistant(final_message.clone());
        }
    } else {
        ctx.messages.push(Message::Assistant(final_message.clone()));
        sink.push(AgentEvent::MessageStart {
            message: Message::Assistant(final_message.clone()),
        });
    }
    sink.push(AgentEvent::MessageEnd { message: Message::Assistant(final_message.clone()) });

    final_message
}

// ─── Tool execution ───────────────────────────────────────────────────────────

struct ToolExecution {
    results: Vec<ToolResultMessage>,
    steering: Option<Vec<AgentMessage>>,
    aborted: bool,
}

/// Execute the turn's tool calls strictly in call order.
///
/// After each call the steering queue is polled; queued input causes the
/// remaining calls to be skipped with failing results so the model hears
/// the user before acting further.
async fn execute_tool_calls(
    tools: &[AgentTool],
    tool_calls: &[ToolCall],
    signal: &Option<AbortSignal>,
    sink: &AgentEventSink,
    config: &AgentLoopConfig,
) -> ToolExecution {
    let mut results: Vec<ToolResultMessage> = Vec::new();
    let mut steering: Option<Vec<AgentMessage>> = None;
    let mut aborted = false;

    for (index, call) in tool_calls.iter().enumerate() {
        sink.push(AgentEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        });

        let (result, is_error) = run_one_tool(tools, call, signal, sink).await;

        sink.push(AgentEvent::ToolExecutionEnd {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result: result.clone(),
            is_error,
        });

        let message = ToolResultMessage {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: result.content,
            details: result.details,
            is_error,
            timestamp: now_ms(),
        };
        sink.push(AgentEvent::MessageStart { message: Message::ToolResult(message.clone()) });
        sink.push(AgentEvent::MessageEnd { message: Message::ToolResult(message.clone()) });
        results.push(message);

        if is_aborted(signal) {
            aborted = true;
            break;
        }

        let queued = poll(&config.get_steering_messages).await;
        if !queued.is_empty() {
            steering = Some(queued);
            for skipped in &tool_calls[index + 1..] {
                results.push(skip_tool_call(skipped, sink));
            }
            break;
        }
    }

    ToolExecution { results, steering, aborted }
}

async fn run_one_tool(
    tools: &[AgentTool],
    call: &ToolCall,
    signal: &Option<AbortSignal>,
    sink: &AgentEventSink,
) -> (AgentToolResult, bool) {
    let Some(tool) = tools.iter().find(|t| t.name == call.name) else {
        return (AgentToolResult::text(format!("Tool \"{}\" not found", call.name)), true);
    };

    let arguments = match validate_tool_arguments(&tool.schema(), call) {
        Ok(arguments) => arguments,
        Err(error) => return (AgentToolResult::text(error.to_string()), true),
    };

    let update_sink = sink.clone();
    let (id, name, args) = (call.id.clone(), call.name.clone(), call.arguments.clone());
    let on_update: ToolUpdateFn = Arc::new(move |partial| {
        update_sink.push(AgentEvent::ToolExecutionUpdate {
            tool_call_id: id.clone(),
            tool_name: name.clone(),
            args: args.clone(),
            partial_result: partial,
        });
    });

    match tool.executor.execute(&call.id, arguments, signal.clone(), on_update).await {
        Ok(result) => (result, false),
        Err(error) => (AgentToolResult::text(error.to_string()), true),
    }
}

/// Synthesize a failing result for a call abandoned because the user
/// queued a steering message.
fn skip_tool_call(call: &ToolCall, sink: &AgentEventSink) -> ToolResultMessage {
    let result = AgentToolResult {
        content: vec![ContentPart::text("Skipped due to queued user message.")],
        details: None,
    };

    sink.push(AgentEvent::ToolExecutionStart {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        args: call.arguments.clone(),
    });
    sink.push(AgentEvent::ToolExecutionEnd {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        result: result.clone(),
        is_error: true,
    });

    let message = ToolResultMessage {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        content: result.content,
        details: None,
        is_error: true,
        timestamp: now_ms(),
    };
    sink.push(AgentEvent::MessageStart { message: Message::ToolResult(message.clone()) });
    sink.push(AgentEvent::MessageEnd { message: Message::ToolResult(message.clone()) });
    message
}
