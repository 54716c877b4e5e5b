// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider transports.
//!
//! Each transport translates one wire protocol into the canonical
//! [`AssistantMessageEvent`](crate::types::AssistantMessageEvent) sequence.
//! Failures never escape the stream: every code path ends in a `done` or
//! `error` event followed by stream close.

pub mod anthropic;
pub mod openai_compat;
pub mod options;

use std::time::Duration;

use crate::event_stream::{assistant_event_stream, AssistantEventSink, AssistantMessageStream};
use crate::types::{
    AssistantMessage, AssistantMessageEvent, DoneReason, ErrorReason, Model, StopReason,
};

/// Longest provider-requested retry honored when the caller sets no
/// `max_retry_delay_ms`.
const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 30_000;

/// How long to wait before honoring a provider-requested retry.
///
/// The core never retries on its own; it only honors an explicit
/// `Retry-After` on a 429/503, and only when the requested wait fits
/// within `max_retry_delay_ms`.  Returns `None` when the response is not
/// a retry request or asks for longer than the caller will wait.
pub(crate) fn provider_retry_delay(
    status: reqwest::StatusCode,
    headers: &reqwest::header::HeaderMap,
    max_retry_delay_ms: Option<u64>,
) -> Option<Duration> {
    if status.as_u16() != 429 && status.as_u16() != 503 {
        return None;
    }
    let seconds = headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    let delay_ms = seconds.saturating_mul(1000);
    if delay_ms > max_retry_delay_ms.unwrap_or(DEFAULT_MAX_RETRY_DELAY_MS) {
        return None;
    }
    Some(Duration::from_millis(delay_ms))
}

/// A stream that has already failed: `start`, one `error` event, close.
/// The opening `start` keeps even this degenerate stream on the canonical
/// event sequence.
pub(crate) fn error_stream(model: &Model, message: impl Into<String>) -> AssistantMessageStream {
    let (sink, stream) = assistant_event_stream();
    sink.push(AssistantMessageEvent::Start { partial: AssistantMessage::empty(model) });
    let error = AssistantMessage::errored(model, StopReason::Error, message);
    sink.push(AssistantMessageEvent::Error { reason: ErrorReason::Error, error });
    sink.end(None);
    stream
}

/// Terminal bookkeeping shared by the transports: reconcile the stop
/// reason with the finalized content, emit `done` or `error`, close.
pub(crate) fn finish(sink: &AssistantEventSink, output: &mut AssistantMessage) {
    // stop_reason = toolUse iff the finalized content carries a tool call.
    if !matches!(output.stop_reason, StopReason::Error | StopReason::Aborted) {
        output.stop_reason = if output.tool_calls().is_empty() {
            match output.stop_reason {
                StopReason::ToolUse => StopReason::Stop,
                other => other,
            }
        } else {
            StopReason::ToolUse
        };
    }

    match output.stop_reason {
        StopReason::Stop => sink.push(AssistantMessageEvent::Done {
            reason: DoneReason::Stop,
            message: output.clone(),
        }),
        StopReason::Length => sink.push(AssistantMessageEvent::Done {
            reason: DoneReason::Length,
            message: output.clone(),
        }),
        StopReason::ToolUse => sink.push(AssistantMessageEvent::Done {
            reason: DoneReason::ToolUse,
            message: output.clone(),
        }),
        StopReason::Error | StopReason::Aborted => {
            if output.error_message.is_none() {
                output.error_message = Some("model refused to answer".into());
            }
            sink.push(AssistantMessageEvent::Error {
                reason: ErrorReason::Error,
                error: output.clone(),
            });
        }
    }
    sink.end(None);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
