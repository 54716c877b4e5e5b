// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider-agnostic streaming LLM transport.
//!
//! Every provider transport produces the same canonical event stream — an
//! ordered sequence of block start/delta/end events bracketed by `start`
//! and `done`/`error` — over a shared message model, so consumers render
//! incrementally and replay deterministically without caring which wire
//! protocol produced the events.
//!
//! Entry points: [`stream`] / [`stream_simple`] dispatch through the
//! process-wide API registry (populate it once with
//! [`register_builtin_api_providers`]); [`complete`] / [`complete_simple`]
//! await the terminal message.

pub mod abort;
pub mod catalog;
pub mod event_stream;
pub mod json_parse;
pub mod mock;
pub mod overflow;
pub mod providers;
pub mod registry;
pub mod transform;
pub mod validation;
mod env_keys;
mod stream;
mod types;

pub use abort::{AbortHandle, AbortSignal};
pub use catalog::{
    calculate_cost, get_model, get_models, get_providers, models_are_equal, static_catalog,
    supports_xhigh,
};
pub use env_keys::get_env_api_key;
pub use event_stream::{
    assistant_event_stream, event_stream, AssistantEventSink, AssistantMessageStream, EventSink,
    EventStream, StreamClosedWithoutResult,
};
pub use json_parse::parse_streaming_json;
pub use overflow::is_context_overflow;
pub use registry::{
    clear_api_providers, get_api_provider, get_api_providers, register_api_provider,
    register_builtin_api_providers, unregister_api_providers, ApiProvider, StreamFn,
    StreamSimpleFn,
};
pub use stream::{complete, complete_simple, stream, stream_simple, UnknownApi};
pub use transform::{transform_messages, ToolIdNormalizer};
pub use types::*;
pub use validation::{validate_tool_arguments, validate_tool_call, ToolValidationError};
