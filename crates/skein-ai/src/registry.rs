// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! API-provider registry: maps a wire API id to its stream functions.
//!
//! Process-wide, populated once at initialization and treated as
//! immutable afterwards.  `source_id`-scoped registration lets embedders
//! (plugins, tests) add providers and remove them again as a group.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::event_stream::{assistant_event_stream, AssistantMessageStream};
use crate::types::{
    AssistantMessage, AssistantMessageEvent, Context, ErrorReason, Model, SimpleStreamOptions,
    StopReason, StreamOptions,
};

/// Low-level stream function: full provider-specific options.
pub type StreamFn =
    Arc<dyn Fn(&Model, &Context, StreamOptions) -> AssistantMessageStream + Send + Sync>;

/// Simplified stream function: reasoning level resolved automatically.
pub type StreamSimpleFn =
    Arc<dyn Fn(&Model, &Context, SimpleStreamOptions) -> AssistantMessageStream + Send + Sync>;

/// A registered wire-API implementation.
#[derive(Clone)]
pub struct ApiProvider {
    pub api: String,
    pub stream: StreamFn,
    pub stream_simple: StreamSimpleFn,
}

struct Registered {
    provider: ApiProvider,
    source_id: Option<String>,
}

fn registry() -> &'static RwLock<HashMap<String, Registered>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Registered>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// A stream that fails immediately with `message`.  Used when dispatch
/// itself fails so that no error ever crosses the stream boundary as a
/// panic or a hung future.  Opens with `start` so consumers still see the
/// canonical event sequence.
fn immediate_error_stream(model: &Model, message: String) -> AssistantMessageStream {
    let (sink, stream) = assistant_event_stream();
    sink.push(AssistantMessageEvent::Start { partial: AssistantMessage::empty(model) });
    let error = AssistantMessage::errored(model, StopReason::Error, message);
    sink.push(AssistantMessageEvent::Error { reason: ErrorReason::Error, error });
    sink.end(None);
    stream
}

/// Register an API provider, replacing any previous registration for the
/// same api.  The stored functions are wrapped with an api-mismatch guard:
/// calling them with a model of a different api yields an error stream.
pub fn register_api_provider(provider: ApiProvider, source_id: Option<&str>) {
    let api = provider.api.clone();

    let guard_api = api.clone();
    let inner_stream = provider.stream;
    let stream: StreamFn = Arc::new(move |model, context, options| {
        if model.api != guard_api {
            return immediate_error_stream(
                model,
                format!("Mismatched api: {} expected {guard_api}", model.api),
            );
        }
        (inner_stream)(model, context, options)
    });

    let guard_api = api.clone();
    let inner_simple = provider.stream_simple;
    let stream_simple: StreamSimpleFn = Arc::new(move |model, context, options| {
        if model.api != guard_api {
            return immediate_error_stream(
                model,
                format!("Mismatched api: {} expected {guard_api}", model.api),
            );
        }
        (inner_simple)(model, context, options)
    });

    registry().write().unwrap().insert(
        api.clone(),
        Registered {
            provider: ApiProvider { api, stream, stream_simple },
            source_id: source_id.map(str::to_string),
        },
    );
}

/// Look up a provider by api id.
pub fn get_api_provider(api: &str) -> Option<ApiProvider> {
    registry().read().unwrap().get(api).map(|r| r.provider.clone())
}

/// All registered providers.
pub fn get_api_providers() -> Vec<ApiProvider> {
    registry().read().unwrap().values().map(|r| r.provider.clone()).collect()
}

/// Remove every provider registered under `source_id`.
pub fn unregister_api_providers(source_id: &str) {
    registry()
        .write()
        .unwrap()
        .retain(|_, r| r.source_id.as_deref() != Some(source_id));
}

/// Remove all providers (tests only).
pub fn clear_api_providers() {
    registry().write().unwrap().clear();
}

/// Register the built-in transports.  Idempotent.
pub fn register_builtin_api_providers() {
    register_api_provider(
        ApiProvider {
            api: "anthropic-messages".into(),
            stream: Arc::new(|model, context, options| {
                crate::providers::anthropic::stream_anthropic(
                    model,
                    context,
                    crate::providers::anthropic::AnthropicOptions {
                        options,
                        ..Default::default()
                    },
                )
            }),
            stream_simple: Arc::new(|model, context, options| {
                crate::providers::anthropic::stream_simple_anthropic(model, context, options)
            }),
        },
        None,
    );

    register_api_provider(
        ApiProvider {
            api: "openai-completions".into(),
            stream: Arc::new(|model, context, options| {
                crate::providers::openai_compat::stream_openai_completions(
                    model,
                    context,
                    crate::providers::openai_compat::OpenAiCompletionsOptions {
                        options,
                        ..Default::default()
                    },
                )
            }),
            stream_simple: Arc::new(|model, context, options| {
                crate::providers::openai_compat::stream_simple_openai_completions(
                    model, context, options,
                )
            }),
        },
        None,
    );
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
