// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Turn-structured agent loop over the skein-ai transport.
//!
//! [`Agent`] is the public entry point: it owns the conversation, accepts
//! prompts, queues steering and follow-up input, and fans an ordered
//! [`AgentEvent`] trace out to subscribers.  [`agent_loop`] /
//! [`agent_loop_continue`] expose the underlying state machine for
//! embedders that manage their own state.

mod agent;
mod agent_loop;
mod proxy;
mod types;

pub use agent::{Agent, AgentOptions, ListenerFn, PromptInput, Subscription};
pub use agent_loop::{agent_event_stream, agent_loop, agent_loop_continue, AgentEventSink, AgentEventStream};
pub use proxy::{stream_proxy, ProxyEvent, ProxyStreamOptions};
pub use types::{
    default_convert_to_llm, AgentContext, AgentError, AgentEvent, AgentLoopConfig, AgentMessage,
    AgentState, AgentStreamFn, AgentThinkingLevel, AgentTool, AgentToolResult, ApiKeyFn,
    ConvertToLlmFn, MessageSourceFn, QueueMode, ToolExecutor, ToolUpdateFn, TransformContextFn,
};
