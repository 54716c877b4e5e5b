// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Top-level streaming entry points, dispatching by the model's wire API.

use crate::event_stream::AssistantMessageStream;
use crate::registry::get_api_provider;
use crate::types::{AssistantMessage, Context, Model, SimpleStreamOptions, StreamOptions};

/// No provider is registered for the model's wire API.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no API provider registered for api: {0}")]
pub struct UnknownApi(pub String);

/// Stream one assistant message using provider-specific options.
pub fn stream(
    model: &Model,
    context: &Context,
    options: StreamOptions,
) -> Result<AssistantMessageStream, UnknownApi> {
    let provider =
        get_api_provider(&model.api).ok_or_else(|| UnknownApi(model.api.clone()))?;
    Ok((provider.stream)(model, context, options))
}

/// Stream one assistant message using unified options; the provider
/// resolves the reasoning level into its native knobs.
pub fn stream_simple(
    model: &Model,
    context: &Context,
    options: SimpleStreamOptions,
) -> Result<AssistantMessageStream, UnknownApi> {
    let provider =
        get_api_provider(&model.api).ok_or_else(|| UnknownApi(model.api.clone()))?;
    Ok((provider.stream_simple)(model, context, options))
}

/// Stream to completion and return the final message.
pub async fn complete(
    model: &Model,
    context: &Context,
    options: StreamOptions,
) -> anyhow::Result<AssistantMessage> {
    Ok(stream(model, context, options)?.result().await?)
}

/// Like [`complete`] but with unified options.
pub async fn complete_simple(
    model: &Model,
    context: &Context,
    options: SimpleStreamOptions,
) -> anyhow::Result<AssistantMessage> {
    Ok(stream_simple(model, context, options)?.result().await?)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
