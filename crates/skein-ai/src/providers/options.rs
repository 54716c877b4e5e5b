// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Helpers shared by the provider transports for turning unified
//! [`SimpleStreamOptions`] into provider-native knobs.

use crate::types::{Model, SimpleStreamOptions, StreamOptions, ThinkingBudgets, ThinkingLevel};

/// Output tokens reserved for the visible answer when a thinking budget
/// would otherwise swallow the whole turn.
const MIN_OUTPUT_TOKENS: u32 = 1024;

/// Build the base stream options, filling in the default output cap.
pub fn build_base_options(
    model: &Model,
    options: &SimpleStreamOptions,
    api_key: Option<String>,
) -> StreamOptions {
    let base = &options.options;
    StreamOptions {
        temperature: base.temperature,
        max_tokens: Some(base.max_tokens.unwrap_or_else(|| model.max_tokens.min(32_000))),
        api_key: api_key.or_else(|| base.api_key.clone()),
        cache_retention: base.cache_retention,
        session_id: base.session_id.clone(),
        headers: base.headers.clone(),
        max_retry_delay_ms: base.max_retry_delay_ms,
        signal: base.signal.clone(),
    }
}

/// Clamp `xhigh` down to `high` for providers that do not advertise it.
pub fn clamp_reasoning(effort: Option<ThinkingLevel>) -> Option<ThinkingLevel> {
    match effort {
        Some(ThinkingLevel::Xhigh) => Some(ThinkingLevel::High),
        other => other,
    }
}

/// Resolve `(max_tokens, thinking_budget)` for a token-budgeted provider.
///
/// The budget is added on top of the base output cap, clamped to the
/// model's limit; if the budget would leave less than [`MIN_OUTPUT_TOKENS`]
/// of visible output, it is shrunk to fit.
pub fn adjust_max_tokens_for_thinking(
    base_max_tokens: u32,
    model_max_tokens: u32,
    reasoning: ThinkingLevel,
    custom_budgets: Option<&ThinkingBudgets>,
) -> (u32, u32) {
    let level = clamp_reasoning(Some(reasoning)).unwrap_or(ThinkingLevel::Low);
    let default_budget = match level {
        ThinkingLevel::Minimal => 1024,
        ThinkingLevel::Low => 2048,
        ThinkingLevel::Medium => 8192,
        ThinkingLevel::High | ThinkingLevel::Xhigh => 16_384,
    };
    let mut thinking_budget = custom_budgets
        .and_then(|b| match level {
            ThinkingLevel::Minimal => b.minimal,
            ThinkingLevel::Low => b.low,
            ThinkingLevel::Medium => b.medium,
            ThinkingLevel::High | ThinkingLevel::Xhigh => b.high,
        })
        .unwrap_or(default_budget);

    let max_tokens = (base_max_tokens + thinking_budget).min(model_max_tokens);
    if max_tokens <= thinking_budget {
        thinking_budget = max_tokens.saturating_sub(MIN_OUTPUT_TOKENS);
    }
    (max_tokens, thinking_budget)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
