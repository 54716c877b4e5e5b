// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cross-provider history normalization.
//!
//! Conversation history produced on one provider is not generally accepted
//! by another: thinking blocks may be signature-bound, tool-call ids obey
//! different character sets, and tool calls may be left unanswered when a
//! run was cut short.  [`transform_messages`] applies the minimal edits
//! that make a history valid for a given target model while preserving its
//! meaning.  The input is never mutated.

use crate::types::{
    AssistantContent, AssistantMessage, ContentPart, Message, Model, StopReason, ToolCall,
    ToolResultMessage, now_ms,
};
use std::collections::{HashMap, HashSet};

/// Rewrites a tool-call id for the target model.  Receives the original
/// id, the target model, and the assistant message the call came from.
/// Must be deterministic and idempotent.
pub type ToolIdNormalizer = dyn Fn(&str, &Model, &AssistantMessage) -> String;

/// Transform `messages` for submission to `model`.
///
/// - Thinking blocks survive verbatim on the same `(provider, api, model)`
///   triple; elsewhere they are rewritten as plain text.  Empty thinking
///   blocks are always dropped.
/// - Tool-call ids on foreign-model history are rewritten through
///   `normalize_tool_call_id` and the mapping is applied to subsequent
///   tool results.
/// - Tool calls with no result before the next assistant or user message
///   get a synthesized failing result, so every call is balanced.
/// - Assistant messages with `stop_reason` of `error` or `aborted` are
///   removed entirely.
pub fn transform_messages(
    messages: &[Message],
    model: &Model,
    normalize_tool_call_id: Option<&ToolIdNormalizer>,
) -> Vec<Message> {
    let mut id_map: HashMap<String, String> = HashMap::new();

    // First pass: per-message content rewrites.
    let mut transformed: Vec<Message> = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg {
            Message::User(_) => transformed.push(msg.clone()),

            Message::ToolResult(result) => {
                match id_map.get(&result.tool_call_id) {
                    Some(mapped) if mapped != &result.tool_call_id => {
                        let mut rewritten = result.clone();
                        rewritten.tool_call_id = mapped.clone();
                        transformed.push(Message::ToolResult(rewritten));
                    }
                    _ => transformed.push(msg.clone()),
                }
            }

            Message::Assistant(assistant) => {
                let is_same_model = assistant.provider == model.provider
                    && assistant.api == model.api
                    && assistant.model == model.id;

                let mut content: Vec<AssistantContent> =
                    Vec::with_capacity(assistant.content.len());
                for block in &assistant.content {
                    match block {
                        AssistantContent::Thinking { thinking, thinking_signature } => {
                            if is_same_model && thinking_signature.is_some() {
                                content.push(block.clone());
                            } else if thinking.trim().is_empty() {
                                // Dropped on every target.
                            } else if is_same_model {
                                content.push(block.clone());
                            } else {
                                content.push(AssistantContent::text(thinking.clone()));
                            }
                        }
                        AssistantContent::Text { .. } => content.push(block.clone()),
                        AssistantContent::ToolCall(call) => {
                            let mut call = call.clone();
                            if !is_same_model {
                                call.thought_signature = None;
                                if let Some(normalize) = normalize_tool_call_id {
                                    let normalized = normalize(&call.id, model, assistant);
                                    if normalized != call.id {
                                        id_map.insert(call.id.clone(), normalized.clone());
                                        call.id = normalized;
                                    }
                                }
                            }
                            content.push(AssistantContent::ToolCall(call));
                        }
                    }
                }

                let mut rewritten = assistant.clone();
                rewritten.content = content;
                transformed.push(Message::Assistant(rewritten));
            }
        }
    }

    // Second pass: balance orphaned tool calls and drop failed turns.
    let mut result: Vec<Message> = Vec::with_capacity(transformed.len());
    let mut pending_calls: Vec<ToolCall> = Vec::new();
    let mut answered_ids: HashSet<String> = HashSet::new();

    let mut flush_orphans =
        |pending: &mut Vec<ToolCall>, answered: &mut HashSet<String>, out: &mut Vec<Message>| {
            for call in pending.drain(..) {
                if !answered.contains(&call.id) {
                    out.push(Message::ToolResult(ToolResultMessage {
                        tool_call_id: call.id,
                        tool_name: call.name,
                        content: vec![ContentPart::text("No result provided")],
                        details: None,
                        is_error: true,
                        timestamp: now_ms(),
                    }));
                }
            }
            answered.clear();
        };

    for msg in transformed {
        match &msg {
            Message::Assistant(assistant) => {
                flush_orphans(&mut pending_calls, &mut answered_ids, &mut result);
                if matches!(assistant.stop_reason, StopReason::Error | StopReason::Aborted) {
                    continue;
                }
                pending_calls = assistant.tool_calls().into_iter().cloned().collect();
                result.push(msg);
            }
            Message::ToolResult(tool_result) => {
                answered_ids.insert(tool_result.tool_call_id.clone());
                result.push(msg);
            }
            Message::User(_) => {
                // A user message interrupts the tool flow; balance first.
                flush_orphans(&mut pending_calls, &mut answered_ids, &mut result);
                result.push(msg);
            }
        }
    }

    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InputModality, ModelCost, Usage};

    fn model(provider: &str, api: &str, id: &str) -> Model {
        Model {
            id: id.into(),
            name: id.into(),
            api: api.into(),
            provider: provider.into(),
            base_url: "https://example.com".into(),
            reasoning: true,
            input: vec![InputModality::Text],
            cost: ModelCost::default(),
            context_window: 128_000,
            max_tokens: 8192,
            headers: None,
            compat: None,
        }
    }

    fn anthropic() -> Model {
        model("anthropic", "anthropic-messages", "claude-opus-4-6")
    }

    fn openai() -> Model {
        model("openai", "openai-completions", "gpt-5.2")
    }

    fn assistant_on(m: &Model, content: Vec<AssistantContent>) -> Message {
        Message::Assistant(AssistantMessage {
            content,
            api: m.api.clone(),
            provider: m.provider.clone(),
            model: m.id.clone(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
            timestamp: 0,
        })
    }

    fn tool_call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: serde_json::Map::new(),
            thought_signature: None,
        }
    }

    fn tool_result(id: &str, name: &str) -> Message {
        Message::ToolResult(ToolResultMessage {
            tool_call_id: id.into(),
            tool_name: name.into(),
            content: vec![ContentPart::text("ok")],
            details: None,
            is_error: false,
            timestamp: 0,
        })
    }

    // ── Thinking portability ──────────────────────────────────────────────────

    #[test]
    fn signed_thinking_preserved_on_same_model() {
        let m = anthropic();
        let msgs = vec![assistant_on(
            &m,
            vec![AssistantContent::Thinking {
                thinking: "reasoning".into(),
                thinking_signature: Some("sig-abc".into()),
            }],
        )];
        let out = transform_messages(&msgs, &m, None);
        let Message::Assistant(a) = &out[0] else { panic!("expected assistant") };
        assert!(matches!(
            &a.content[0],
            AssistantContent::Thinking { thinking_signature: Some(sig), .. } if sig == "sig-abc"
        ));
    }

    #[test]
    fn unsigned_thinking_kept_as_thinking_on_same_model() {
        let m = anthropic();
        let msgs = vec![assistant_on(&m, vec![AssistantContent::thinking("keep me")])];
        let out = transform_messages(&msgs, &m, None);
        let Message::Assistant(a) = &out[0] else { panic!("expected assistant") };
        assert!(matches!(&a.content[0], AssistantContent::Thinking { .. }));
    }

    #[test]
    fn thinking_becomes_text_on_different_model() {
        let msgs = vec![assistant_on(&anthropic(), vec![AssistantContent::thinking("my plan")])];
        let out = transform_messages(&msgs, &openai(), None);
        let Message::Assistant(a) = &out[0] else { panic!("expected assistant") };
        assert!(matches!(
            &a.content[0],
            AssistantContent::Text { text, .. } if text == "my plan"
        ));
    }

    #[test]
    fn empty_thinking_dropped_everywhere() {
        let m = anthropic();
        let msgs = vec![assistant_on(
            &m,
            vec![
                AssistantContent::thinking("  \n "),
                AssistantContent::text("visible"),
            ],
        )];
        for target in [anthropic(), openai()] {
            let out = transform_messages(&msgs, &target, None);
            let Message::Assistant(a) = &out[0] else { panic!("expected assistant") };
            assert_eq!(a.content.len(), 1, "empty thinking must be dropped");
        }
    }

    #[test]
    fn thought_signature_stripped_for_foreign_model() {
        let mut call = tool_call("c1", "search");
        call.thought_signature = Some("google-sig".into());
        let msgs = vec![
            assistant_on(&anthropic(), vec![AssistantContent::ToolCall(call)]),
            tool_result("c1", "search"),
        ];
        let out = transform_messages(&msgs, &openai(), None);
        let Message::Assistant(a) = &out[0] else { panic!("expected assistant") };
        assert!(a.tool_calls()[0].thought_signature.is_none());
    }

    // ── Tool-call id normalization ────────────────────────────────────────────

    #[test]
    fn normalizer_rewrites_call_and_matching_result() {
        let msgs = vec![
            assistant_on(&anthropic(), vec![AssistantContent::ToolCall(tool_call(
                "call|extra", "search",
            ))]),
            tool_result("call|extra", "search"),
        ];
        let normalize: Box<ToolIdNormalizer> =
            Box::new(|id, _, _| id.replace('|', "_"));
        let out = transform_messages(&msgs, &openai(), Some(&*normalize));
        let Message::Assistant(a) = &out[0] else { panic!("expected assistant") };
        assert_eq!(a.tool_calls()[0].id, "call_extra");
        let Message::ToolResult(r) = &out[1] else { panic!("expected tool result") };
        assert_eq!(r.tool_call_id, "call_extra");
    }

    #[test]
    fn normalizer_not_applied_on_same_model() {
        let m = anthropic();
        let msgs = vec![
            assistant_on(&m, vec![AssistantContent::ToolCall(tool_call("call|extra", "t"))]),
            tool_result("call|extra", "t"),
        ];
        let normalize: Box<ToolIdNormalizer> = Box::new(|id, _, _| id.replace('|', "_"));
        let out = transform_messages(&msgs, &m, Some(&*normalize));
        let Message::Assistant(a) = &out[0] else { panic!("expected assistant") };
        assert_eq!(a.tool_calls()[0].id, "call|extra");
    }

    // ── Orphan repair ─────────────────────────────────────────────────────────

    #[test]
    fn orphaned_tool_call_gets_synthetic_result_before_next_assistant() {
        let m = anthropic();
        let msgs = vec![
            assistant_on(&m, vec![
                AssistantContent::ToolCall(tool_call("x", "a")),
                AssistantContent::ToolCall(tool_call("y", "b")),
            ]),
            tool_result("x", "a"),
            assistant_on(&m, vec![AssistantContent::text("done")]),
        ];
        let out = transform_messages(&msgs, &m, None);
        // assistant, result x, synthesized result y, assistant
        assert_eq!(out.len(), 4);
        let Message::ToolResult(synth) = &out[2] else { panic!("expected synthesized result") };
        assert_eq!(synth.tool_call_id, "y");
        assert!(synth.is_error);
        assert_eq!(synth.content[0].as_text(), Some("No result provided"));
    }

    #[test]
    fn user_message_also_triggers_orphan_repair() {
        let m = anthropic();
        let msgs = vec![
            assistant_on(&m, vec![AssistantContent::ToolCall(tool_call("x", "a"))]),
            Message::user("actually, stop"),
        ];
        let out = transform_messages(&msgs, &m, None);
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[1], Message::ToolResult(r) if r.tool_call_id == "x" && r.is_error));
        assert_eq!(out[2].role(), "user");
    }

    #[test]
    fn balanced_history_needs_no_repair() {
        let m = anthropic();
        let msgs = vec![
            assistant_on(&m, vec![AssistantContent::ToolCall(tool_call("x", "a"))]),
            tool_result("x", "a"),
            assistant_on(&m, vec![AssistantContent::text("done")]),
        ];
        let out = transform_messages(&msgs, &m, None);
        assert_eq!(out.len(), 3);
    }

    // ── Error filtering ───────────────────────────────────────────────────────

    #[test]
    fn errored_and_aborted_assistants_removed() {
        let m = anthropic();
        let mut errored = AssistantMessage {
            content: vec![],
            api: m.api.clone(),
            provider: m.provider.clone(),
            model: m.id.clone(),
            usage: Usage::default(),
            stop_reason: StopReason::Error,
            error_message: Some("prompt is too long".into()),
            timestamp: 0,
        };
        let msgs = vec![
            Message::user("hi"),
            Message::Assistant(errored.clone()),
            Message::user("retry"),
        ];
        let out = transform_messages(&msgs, &m, None);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| m.as_assistant().is_none()));

        errored.stop_reason = StopReason::Aborted;
        let msgs = vec![Message::user("hi"), Message::Assistant(errored)];
        let out = transform_messages(&msgs, &m, None);
        assert_eq!(out.len(), 1);
    }

    // ── Purity and idempotence ────────────────────────────────────────────────

    #[test]
    fn input_is_not_mutated() {
        let msgs = vec![assistant_on(&anthropic(), vec![AssistantContent::thinking("plan")])];
        let snapshot = msgs.clone();
        let _ = transform_messages(&msgs, &openai(), None);
        assert_eq!(msgs, snapshot);
    }

    #[test]
    fn transform_is_idempotent() {
        let m = anthropic();
        let target = openai();
        let msgs = vec![
            Message::user("go"),
            assistant_on(&m, vec![
                AssistantContent::thinking("plan"),
                AssistantContent::ToolCall(tool_call("x", "a")),
                AssistantContent::ToolCall(tool_call("y", "b")),
            ]),
            tool_result("x", "a"),
            assistant_on(&m, vec![AssistantContent::text("done")]),
        ];
        let once = transform_messages(&msgs, &target, None);
        let twice = transform_messages(&once, &target, None);
        // Synthesized results carry fresh timestamps; compare shape instead.
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.role(), b.role());
        }
        assert_eq!(
            once.iter().filter(|m| matches!(m, Message::ToolResult(_))).count(),
            twice.iter().filter(|m| matches!(m, Message::ToolResult(_))).count(),
        );
    }

    #[test]
    fn user_messages_pass_through_untouched() {
        let msgs = vec![Message::user("hello")];
        let out = transform_messages(&msgs, &openai(), None);
        assert_eq!(out, msgs);
    }
}
