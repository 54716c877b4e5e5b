// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context-overflow detection.
//!
//! Providers report context-window exhaustion in wildly different ways:
//! most return an error whose message matches one of a closed catalog of
//! patterns; a few return HTTP 400/413 with no body at all; and some accept
//! the request and answer "successfully" despite having truncated the
//! input.  [`is_context_overflow`] recognises all three so a caller can
//! compact history and retry.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::{AssistantMessage, StopReason};

const OVERFLOW_PATTERNS: &[&str] = &[
    r"prompt is too long",                       // Anthropic
    r"input is too long for requested model",    // Amazon Bedrock
    r"exceeds the context window",               // OpenAI
    r"input token count.*exceeds the maximum",   // Google
    r"maximum prompt length is \d+",             // xAI
    r"reduce the length of the messages",        // Groq
    r"maximum context length is \d+ tokens",     // OpenRouter
    r"exceeds the limit of \d+",                 // GitHub Copilot
    r"exceeds the available context size",       // llama.cpp
    r"greater than the context length",          // LM Studio
    r"context window exceeds limit",             // MiniMax
    r"exceeded model token limit",               // Kimi
    r"context[_ ]length[_ ]exceeded",            // generic
    r"too many tokens",                          // generic
    r"token limit exceeded",                     // generic
];

fn patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        OVERFLOW_PATTERNS
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")).expect("overflow pattern must compile"))
            .collect()
    })
}

fn no_body_pattern() -> &'static Regex {
    // Cerebras and Mistral return 400/413 with an empty body on overflow.
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^4(00|13)\s*(status code)?\s*\(no body\)").expect("pattern must compile")
    })
}

/// Return `true` if a finalized assistant message indicates context
/// overflow.  Pure function of `(message, context_window)`.
///
/// `context_window` enables silent-overflow detection: a `stop` message
/// whose `usage.input + usage.cache_read` exceeds the window was truncated
/// server-side even though the provider reported success.
pub fn is_context_overflow(message: &AssistantMessage, context_window: Option<u32>) -> bool {
    if message.stop_reason == StopReason::Error {
        if let Some(error_message) = &message.error_message {
            if patterns().iter().any(|p| p.is_match(error_message)) {
                return true;
            }
            if no_body_pattern().is_match(error_message) {
                return true;
            }
        }
    }

    if let Some(window) = context_window {
        if message.stop_reason == StopReason::Stop {
            let input_tokens = message.usage.input + message.usage.cache_read;
            if input_tokens > window {
                return true;
            }
        }
    }

    false
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
